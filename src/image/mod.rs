//! Image Store (spec.md §3-4.3): tracks pulled images as typed records in
//! the State Store and drives pulls through an injected `Puller`,
//! aggregating its raw progress events into the throttled, client-shaped
//! progress lines Docker clients already know how to render.
//!
//! Registry access at the byte level is explicitly out of scope (spec.md
//! §1 Non-goals) — this module owns bookkeeping and the progress-line
//! shape, not wire-protocol details, which live behind `Puller`.

mod progress;
pub mod puller;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub use progress::{ProgressLine, ProgressTracker};
pub use puller::{ProgressEvent, PullError, Puller, RegistryAuth, ResolvedImage};

use crate::store::{StateStore, StorageError};

const KEY_PREFIX: &str = "image/";

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("image not found: {0}")]
    NotFound(String),

    #[error("authentication required for {0}")]
    AuthRequired(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("corrupt image data: {0}")]
    Corrupt(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type ImageResult<T> = Result<T, ImageError>;

impl From<PullError> for ImageError {
    fn from(e: PullError) -> Self {
        match e {
            PullError::NotFound(r) => ImageError::NotFound(r),
            PullError::AuthRequired(r) => ImageError::AuthRequired(r),
            PullError::Registry(m) => ImageError::Registry(m),
            PullError::Corrupt(m) => ImageError::Corrupt(m),
            PullError::Io(e) => ImageError::Registry(e.to_string()),
        }
    }
}

/// A pulled image's durable record, the spec.md §3 `Image record` shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    pub repo_tags: Vec<String>,
    pub repo_digests: Vec<String>,
    pub created: i64,
    pub size: u64,
    pub architecture: String,
    pub os: String,
    pub layer_digests: Vec<String>,
}

impl ImageRecord {
    fn short_id(&self) -> String {
        format!("sha256:{}", self.id.trim_start_matches("sha256:"))
    }
}

/// Tracks bookkeeping for pulled images and drives pulls through the
/// injected `Puller`. Cheaply `Clone` — shares the same `StateStore`
/// handle and `Puller` every caller is handed at daemon startup.
#[derive(Clone)]
pub struct ImageStore {
    store: StateStore,
    puller: Arc<dyn Puller>,
    layers_dir: PathBuf,
}

impl ImageStore {
    pub fn new(store: StateStore, puller: Arc<dyn Puller>, layers_dir: PathBuf) -> Self {
        Self { store, puller, layers_dir }
    }

    fn key(id: &str) -> String {
        format!("{}{}", KEY_PREFIX, id)
    }

    pub async fn list(&self) -> ImageResult<Vec<ImageRecord>> {
        Ok(self.store.scan_json(KEY_PREFIX).await?)
    }

    /// Resolve `reference` (a tag, `name@digest`, or bare id prefix)
    /// against locally known images.
    pub async fn inspect(&self, reference: &str) -> ImageResult<ImageRecord> {
        let images = self.list().await?;
        images
            .into_iter()
            .find(|img| {
                img.id == reference
                    || img.short_id() == reference
                    || img.id.starts_with(reference)
                    || img.repo_tags.iter().any(|t| t == reference)
                    || img.repo_digests.iter().any(|d| d == reference)
            })
            .ok_or_else(|| ImageError::NotFound(reference.to_string()))
    }

    /// Pull `reference`, emitting throttled, aggregated progress lines on
    /// `on_progress` as spec.md §4.3 and §8 describe. Idempotent: pulling
    /// a reference whose digest is already present locally downloads
    /// nothing and emits a single "Status: Image is up to date" line.
    pub async fn pull(
        &self,
        reference: &str,
        auth: Option<RegistryAuth>,
        on_progress: mpsc::Sender<ProgressLine>,
    ) -> ImageResult<ImageRecord> {
        let digest = self.puller.resolve_digest(reference, auth.clone()).await?;

        if let Ok(existing) = self.inspect(&digest).await {
            let mut record = existing;
            add_tag_if_new(&mut record, reference);
            self.store.put_json(&Self::key(&record.id), &record).await?;
            let _ = on_progress
                .send(ProgressLine::status(format!("Status: Image is up to date for {}", reference)))
                .await;
            return Ok(record);
        }

        let (resolved, mut events) = self.puller.pull(reference, auth, self.layers_dir.clone()).await?;
        let mut tracker =
            ProgressTracker::with_manifest(resolved.digest.clone(), resolved.layer_digests.clone());
        tracker.set_layer_sizes(resolved.layer_sizes.clone());

        while let Some(event) = events.recv().await {
            let event = event?;
            for line in tracker.apply(event) {
                let _ = on_progress.send(line).await;
            }
        }

        let record = ImageRecord {
            id: resolved.digest.clone(),
            repo_tags: vec![reference.to_string()],
            repo_digests: vec![format!("{}@{}", reference_name(reference), resolved.digest)],
            created: current_timestamp(),
            size: resolved.size,
            architecture: resolved.architecture,
            os: resolved.os,
            layer_digests: resolved.layer_digests,
        };

        self.store.put_json(&Self::key(&record.id), &record).await?;
        info!(image = %record.id, reference, "image pulled");

        let _ = on_progress
            .send(ProgressLine::status(format!("Status: Downloaded newer image for {}", reference)))
            .await;

        Ok(record)
    }

    /// Add `dst` as a tag on the image currently resolved by `src`,
    /// matching `docker tag`'s semantics: the source image is unaffected.
    pub async fn tag(&self, src: &str, dst: &str) -> ImageResult<ImageRecord> {
        let mut record = self.inspect(src).await?;
        add_tag_if_new(&mut record, dst);
        self.store.put_json(&Self::key(&record.id), &record).await?;
        Ok(record)
    }

    /// Remove a tag, deleting the underlying record once its last tag is
    /// gone. `force` drops the record even if other tags remain, matching
    /// `docker rmi -f`.
    pub async fn remove(&self, reference: &str, force: bool) -> ImageResult<()> {
        let mut record = self.inspect(reference).await?;
        record.repo_tags.retain(|t| t != reference);

        if record.repo_tags.is_empty() || force {
            self.store.delete(&Self::key(&record.id)).await?;
            info!(image = %record.id, reference, force, "image removed");
        } else {
            self.store.put_json(&Self::key(&record.id), &record).await?;
        }
        Ok(())
    }
}

fn add_tag_if_new(record: &mut ImageRecord, reference: &str) {
    if !record.repo_tags.iter().any(|t| t == reference) {
        record.repo_tags.push(reference.to_string());
    }
}

fn reference_name(reference: &str) -> String {
    reference.split(':').next().unwrap_or(reference).to_string()
}

fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::puller::MockPuller;
    use tokio::sync::mpsc;

    async fn new_store(layer_count: usize) -> (ImageStore, PathBuf) {
        let state = StateStore::open_in_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let layers = dir.path().join("layers");
        let store = ImageStore::new(state, Arc::new(MockPuller::new(layer_count, 1024)), layers);
        (store, dir.path().to_path_buf())
    }

    #[tokio::test]
    async fn pull_creates_record_and_final_status_line() {
        let (store, _dir) = new_store(2).await;
        let (tx, mut rx) = mpsc::channel(64);

        let record = store.pull("alpine:latest", None, tx).await.unwrap();
        assert_eq!(record.repo_tags, vec!["alpine:latest".to_string()]);
        assert_eq!(record.architecture, "amd64");

        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        let last = lines.last().unwrap();
        assert!(last.status.contains("Downloaded newer image for alpine:latest"), "{:?}", last);
    }

    #[tokio::test]
    async fn repeated_pull_of_same_digest_is_up_to_date() {
        let (store, _dir) = new_store(1).await;
        let (tx, mut rx) = mpsc::channel(64);
        store.pull("alpine:latest", None, tx).await.unwrap();

        let (tx2, mut rx2) = mpsc::channel(64);
        store.pull("alpine:latest", None, tx2).await.unwrap();

        let mut lines = Vec::new();
        while let Ok(line) = rx2.try_recv() {
            lines.push(line);
        }
        assert_eq!(lines.len(), 1);
        assert!(lines[0].status.contains("up to date"));

        drop(rx);
    }

    #[tokio::test]
    async fn inspect_finds_by_short_id_and_tag() {
        let (store, _dir) = new_store(1).await;
        let (tx, _rx) = mpsc::channel(64);
        let record = store.pull("alpine:latest", None, tx).await.unwrap();

        assert_eq!(store.inspect("alpine:latest").await.unwrap().id, record.id);
        assert_eq!(store.inspect(&record.id).await.unwrap().id, record.id);
    }

    #[tokio::test]
    async fn remove_without_force_keeps_record_with_remaining_tags() {
        let (store, _dir) = new_store(1).await;
        let (tx, _rx) = mpsc::channel(64);
        let record = store.pull("alpine:latest", None, tx).await.unwrap();
        store.tag(&record.id, "alpine:stable").await.unwrap();

        store.remove("alpine:latest", false).await.unwrap();
        let still_there = store.inspect("alpine:stable").await.unwrap();
        assert!(!still_there.repo_tags.contains(&"alpine:latest".to_string()));

        store.remove("alpine:stable", false).await.unwrap();
        assert!(store.inspect(&record.id).await.is_err());
    }
}
