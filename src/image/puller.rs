//! The injected pull primitive (spec.md §4.3): the core never speaks the
//! registry wire protocol itself at the byte level (an explicit
//! Non-goal) — it consumes a `Puller` that resolves a reference's
//! manifest up front, then streams typed progress events while writing
//! layer blobs under the image store's `layers/` directory.
//!
//! `RegistryPuller` is the real implementation shipped with this crate: a
//! minimal, anonymous-auth Docker Registry v2 client (Docker Hub only,
//! the common case client tools hit) built on `reqwest`. `MockPuller` is
//! an in-process double for tests that never touches the network.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::StreamExt;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum PullError {
    #[error("image not found: {0}")]
    NotFound(String),

    #[error("authentication required for {0}")]
    AuthRequired(String),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("corrupt image data: {0}")]
    Corrupt(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PullResult<T> = Result<T, PullError>;

#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
}

/// One step of a pull, exactly the event vocabulary spec.md §4.3 names.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    AddTotalSize(u64),
    AddTotalItems(u64),
    AddSize(u64),
    AddItems(u64),
    ContainerSetupStart(String),
    ContainerSetupComplete,
}

/// Manifest metadata resolved *before* any layer is downloaded — a real
/// registry pull always fetches the manifest (and, for platform info, the
/// config blob) first, so this is available up front rather than only at
/// the end of the stream. The Image Store uses `digest` and
/// `layer_digests` for the short-ID progress-line rule in spec.md §4.3.
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    pub digest: String,
    pub layer_digests: Vec<String>,
    pub layer_sizes: Vec<u64>,
    pub size: u64,
    pub architecture: String,
    pub os: String,
}

#[async_trait::async_trait]
pub trait Puller: Send + Sync {
    /// Resolve `reference`'s manifest, then pull its layers into
    /// `layers_dir`. Returns the resolved metadata immediately and a
    /// stream of progress events describing the download as it happens.
    async fn pull(
        &self,
        reference: &str,
        auth: Option<RegistryAuth>,
        layers_dir: PathBuf,
    ) -> PullResult<(ResolvedImage, ReceiverStream<PullResult<ProgressEvent>>)>;

    /// Resolve a reference's manifest digest without downloading layers —
    /// used by `pull`'s "already up to date" fast path (spec.md §8).
    async fn resolve_digest(&self, reference: &str, auth: Option<RegistryAuth>) -> PullResult<String>;
}

/// Parses `name[:tag][@digest]`, defaulting the registry to Docker Hub and
/// the tag to `latest`, and qualifying unqualified names with `library/`
/// exactly as the Docker CLI does.
struct ParsedReference {
    registry: String,
    repository: String,
    reference: String, // tag or digest
}

fn parse_reference(reference: &str) -> ParsedReference {
    let (name_part, explicit_tag_or_digest) = match reference.rsplit_once('@') {
        Some((name, digest)) => (name, Some(format!("sha256:{}", digest.trim_start_matches("sha256:")))),
        None => match reference.rsplit_once(':') {
            // Guard against ':' inside a registry host:port prefix.
            Some((name, tag)) if !tag.contains('/') => (name, Some(tag.to_string())),
            _ => (reference, None),
        },
    };

    let mut parts: Vec<&str> = name_part.splitn(2, '/').collect();
    let (registry, repository) = if parts.len() == 2 && (parts[0].contains('.') || parts[0].contains(':')) {
        (parts.remove(0).to_string(), parts.remove(0).to_string())
    } else {
        (
            "registry-1.docker.io".to_string(),
            if name_part.contains('/') { name_part.to_string() } else { format!("library/{}", name_part) },
        )
    };

    ParsedReference {
        registry,
        repository,
        reference: explicit_tag_or_digest.unwrap_or_else(|| "latest".to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
struct ManifestLayer {
    size: u64,
    digest: String,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default)]
    config: Option<ManifestLayer>,
    #[serde(default)]
    layers: Vec<ManifestLayer>,
    #[serde(default)]
    manifests: Vec<ManifestDescriptor>,
}

#[derive(Debug, Deserialize)]
struct ManifestDescriptor {
    digest: String,
    platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
struct Platform {
    architecture: String,
    os: String,
}

#[derive(Debug, Deserialize)]
struct ImageConfig {
    architecture: Option<String>,
    os: Option<String>,
}

pub struct RegistryPuller {
    client: reqwest::Client,
}

impl RegistryPuller {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }

    async fn bearer_token(
        &self,
        parsed: &ParsedReference,
        auth: &Option<RegistryAuth>,
    ) -> PullResult<Option<String>> {
        if parsed.registry != "registry-1.docker.io" {
            // Other registries' auth schemes are out of scope for the
            // anonymous Docker Hub flow this puller implements.
            return Ok(None);
        }

        let mut req = self.client.get("https://auth.docker.io/token").query(&[
            ("service", "registry.docker.io"),
            ("scope", &format!("repository:{}:pull", parsed.repository)),
        ]);
        if let Some(a) = auth {
            req = req.basic_auth(&a.username, Some(&a.password));
        }

        let resp = req.send().await.map_err(|e| PullError::Registry(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(PullError::AuthRequired(parsed.repository.clone()));
        }
        let body: TokenResponse =
            resp.json().await.map_err(|e| PullError::Registry(format!("token response: {}", e)))?;
        Ok(body.token.or(body.access_token))
    }

    fn manifest_url(parsed: &ParsedReference) -> String {
        format!("https://{}/v2/{}/manifests/{}", parsed.registry, parsed.repository, parsed.reference)
    }

    fn blob_url(parsed: &ParsedReference, digest: &str) -> String {
        format!("https://{}/v2/{}/blobs/{}", parsed.registry, parsed.repository, digest)
    }

    async fn fetch_manifest(
        &self,
        parsed: &ParsedReference,
        token: &Option<String>,
    ) -> PullResult<(Manifest, String)> {
        let accept = "application/vnd.docker.distribution.manifest.v2+json, \
                      application/vnd.docker.distribution.manifest.list.v2+json, \
                      application/vnd.oci.image.manifest.v1+json, \
                      application/vnd.oci.image.index.v1+json";

        let mut req = self.client.get(Self::manifest_url(parsed)).header("Accept", accept);
        if let Some(t) = token {
            req = req.bearer_auth(t);
        }
        let resp = req.send().await.map_err(|e| PullError::Registry(e.to_string()))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PullError::NotFound(parsed.repository.clone()));
        }
        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(PullError::AuthRequired(parsed.repository.clone()));
        }
        if !resp.status().is_success() {
            return Err(PullError::Registry(format!("manifest fetch failed: {}", resp.status())));
        }
        let digest_header =
            resp.headers().get("docker-content-digest").and_then(|v| v.to_str().ok()).map(|s| s.to_string());

        let bytes = resp.bytes().await.map_err(|e| PullError::Registry(e.to_string()))?;
        let digest = digest_header.unwrap_or_else(|| format!("sha256:{}", hex::encode(Sha256::digest(&bytes))));
        let manifest: Manifest =
            serde_json::from_slice(&bytes).map_err(|e| PullError::Corrupt(e.to_string()))?;
        Ok((manifest, digest))
    }

    /// Resolve the manifest (descending through a manifest list if
    /// present) and the image's platform, without downloading any layer.
    async fn resolve(
        &self,
        parsed: &ParsedReference,
        auth: &Option<RegistryAuth>,
    ) -> PullResult<(Manifest, String, Option<String>)> {
        let token = self.bearer_token(parsed, auth).await?;
        let (mut manifest, digest) = self.fetch_manifest(parsed, &token).await?;

        if !manifest.manifests.is_empty() {
            let chosen = manifest
                .manifests
                .iter()
                .find(|m| {
                    m.platform.as_ref().map(|p| p.architecture == "amd64" && p.os == "linux").unwrap_or(false)
                })
                .or_else(|| manifest.manifests.first())
                .cloned()
                .ok_or_else(|| PullError::Corrupt("empty manifest list".into()))?;

            let single = ParsedReference {
                registry: parsed.registry.clone(),
                repository: parsed.repository.clone(),
                reference: chosen.digest.clone(),
            };
            let (resolved_manifest, _) = self.fetch_manifest(&single, &token).await?;
            manifest = resolved_manifest;
        }

        Ok((manifest, digest, token))
    }
}

impl Default for RegistryPuller {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Puller for RegistryPuller {
    async fn resolve_digest(&self, reference: &str, auth: Option<RegistryAuth>) -> PullResult<String> {
        let parsed = parse_reference(reference);
        let (_manifest, digest, _token) = self.resolve(&parsed, &auth).await?;
        Ok(digest)
    }

    async fn pull(
        &self,
        reference: &str,
        auth: Option<RegistryAuth>,
        layers_dir: PathBuf,
    ) -> PullResult<(ResolvedImage, ReceiverStream<PullResult<ProgressEvent>>)> {
        let parsed = parse_reference(reference);
        let (manifest, digest, token) = self.resolve(&parsed, &auth).await?;

        let layers = manifest.layers.clone();
        let total_size: u64 = layers.iter().map(|l| l.size).sum();
        let layer_digests: Vec<String> = layers.iter().map(|l| l.digest.clone()).collect();
        let layer_sizes: Vec<u64> = layers.iter().map(|l| l.size).collect();

        let (architecture, os) = match &manifest.config {
            Some(config) => {
                fetch_image_platform(&self.client, &parsed, &token, config).await.unwrap_or_else(|e| {
                    warn!(error = %e, "failed to read image config, defaulting platform");
                    ("amd64".to_string(), "linux".to_string())
                })
            }
            None => ("amd64".to_string(), "linux".to_string()),
        };

        let resolved = ResolvedImage {
            digest: digest.clone(),
            layer_digests: layer_digests.clone(),
            layer_sizes,
            size: total_size,
            architecture,
            os,
        };

        let client = self.client.clone();
        let (tx, rx) = tokio::sync::mpsc::channel(32);

        tokio::spawn(async move {
            if let Err(e) = download_layers(client, parsed, token, layers, layers_dir, digest, tx.clone()).await
            {
                let _ = tx.send(Err(e)).await;
            }
        });

        Ok((resolved, ReceiverStream::new(rx)))
    }
}

async fn download_layers(
    client: reqwest::Client,
    parsed: ParsedReference,
    token: Option<String>,
    layers: Vec<ManifestLayer>,
    layers_dir: PathBuf,
    digest: String,
    tx: tokio::sync::mpsc::Sender<PullResult<ProgressEvent>>,
) -> PullResult<()> {
    let total_size: u64 = layers.iter().map(|l| l.size).sum();
    let _ = tx.send(Ok(ProgressEvent::AddTotalSize(total_size))).await;
    let _ = tx.send(Ok(ProgressEvent::AddTotalItems(layers.len() as u64))).await;

    tokio::fs::create_dir_all(&layers_dir).await?;

    for layer in &layers {
        download_blob(&client, &parsed, &token, layer, &layers_dir, &tx).await?;
        let _ = tx.send(Ok(ProgressEvent::AddItems(1))).await;
    }

    let setup_id = digest.trim_start_matches("sha256:").chars().take(12).collect::<String>();
    let _ = tx.send(Ok(ProgressEvent::ContainerSetupStart(setup_id))).await;
    let _ = tx.send(Ok(ProgressEvent::ContainerSetupComplete)).await;
    Ok(())
}

async fn fetch_image_platform(
    client: &reqwest::Client,
    parsed: &ParsedReference,
    token: &Option<String>,
    config: &ManifestLayer,
) -> PullResult<(String, String)> {
    let mut req = client.get(RegistryPuller::blob_url(parsed, &config.digest));
    if let Some(t) = token {
        req = req.bearer_auth(t);
    }
    let resp = req.send().await.map_err(|e| PullError::Registry(e.to_string()))?;
    let bytes = resp.bytes().await.map_err(|e| PullError::Registry(e.to_string()))?;
    let config: ImageConfig = serde_json::from_slice(&bytes).map_err(|e| PullError::Corrupt(e.to_string()))?;
    Ok((config.architecture.unwrap_or_else(|| "amd64".into()), config.os.unwrap_or_else(|| "linux".into())))
}

/// Streams one layer blob to `layers_dir/<digest>.layer`, emitting
/// `AddSize` as chunks land so the Image Store's throttled timer has
/// something to aggregate (spec.md §4.3).
async fn download_blob(
    client: &reqwest::Client,
    parsed: &ParsedReference,
    token: &Option<String>,
    layer: &ManifestLayer,
    layers_dir: &Path,
    tx: &tokio::sync::mpsc::Sender<PullResult<ProgressEvent>>,
) -> PullResult<()> {
    debug!(digest = %layer.digest, "downloading layer");

    let mut req = client.get(RegistryPuller::blob_url(parsed, &layer.digest));
    if let Some(t) = token {
        req = req.bearer_auth(t);
    }
    let resp = req.send().await.map_err(|e| PullError::Registry(e.to_string()))?;
    if !resp.status().is_success() {
        return Err(PullError::Registry(format!("blob fetch failed: {}", resp.status())));
    }

    let dest_path = layers_dir.join(format!("{}.layer", layer.digest.replace(':', "_")));
    let mut file = tokio::fs::File::create(&dest_path).await?;
    let mut stream = resp.bytes_stream();
    use tokio::io::AsyncWriteExt;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| PullError::Registry(e.to_string()))?;
        file.write_all(&chunk).await?;
        let _ = tx.send(Ok(ProgressEvent::AddSize(chunk.len() as u64))).await;
    }
    file.flush().await?;
    Ok(())
}

/// In-process double for tests: no network, a deterministic fake manifest
/// with a configurable number of layers, each `layer_size` bytes.
pub struct MockPuller {
    pub layer_count: usize,
    pub layer_size: u64,
    pub digest: String,
}

impl MockPuller {
    pub fn new(layer_count: usize, layer_size: u64) -> Self {
        Self { layer_count, layer_size, digest: format!("sha256:{}", "0".repeat(64)) }
    }
}

#[async_trait::async_trait]
impl Puller for MockPuller {
    async fn resolve_digest(&self, _reference: &str, _auth: Option<RegistryAuth>) -> PullResult<String> {
        Ok(self.digest.clone())
    }

    async fn pull(
        &self,
        _reference: &str,
        _auth: Option<RegistryAuth>,
        layers_dir: PathBuf,
    ) -> PullResult<(ResolvedImage, ReceiverStream<PullResult<ProgressEvent>>)> {
        let layer_digests: Vec<String> =
            (0..self.layer_count).map(|i| format!("sha256:{:064x}", i + 1)).collect();
        let total_size = self.layer_size * self.layer_count as u64;

        let resolved = ResolvedImage {
            digest: self.digest.clone(),
            layer_digests: layer_digests.clone(),
            layer_sizes: vec![self.layer_size; self.layer_count],
            size: total_size,
            architecture: "amd64".into(),
            os: "linux".into(),
        };

        let (tx, rx) = tokio::sync::mpsc::channel(32);
        let layer_count = self.layer_count;
        let layer_size = self.layer_size;

        tokio::spawn(async move {
            let _ = tokio::fs::create_dir_all(&layers_dir).await;
            let _ = tx.send(Ok(ProgressEvent::AddTotalSize(total_size))).await;
            let _ = tx.send(Ok(ProgressEvent::AddTotalItems(layer_count as u64))).await;

            for _ in 0..layer_count {
                let _ = tx.send(Ok(ProgressEvent::AddSize(layer_size))).await;
                let _ = tx.send(Ok(ProgressEvent::AddItems(1))).await;
            }

            let _ = tx.send(Ok(ProgressEvent::ContainerSetupStart("mock".into()))).await;
            let _ = tx.send(Ok(ProgressEvent::ContainerSetupComplete)).await;
        });

        Ok((resolved, ReceiverStream::new(rx)))
    }
}

pub fn puller_arc(p: impl Puller + 'static) -> Arc<dyn Puller> {
    Arc::new(p)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_name_as_docker_hub_library() {
        let r = parse_reference("alpine");
        assert_eq!(r.registry, "registry-1.docker.io");
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.reference, "latest");
    }

    #[test]
    fn parses_name_with_tag() {
        let r = parse_reference("alpine:3.19");
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.reference, "3.19");
    }

    #[test]
    fn parses_namespaced_name() {
        let r = parse_reference("library/nginx:latest");
        assert_eq!(r.repository, "library/nginx");
    }

    #[test]
    fn parses_digest_reference() {
        let r = parse_reference("alpine@sha256:abc123");
        assert_eq!(r.reference, "sha256:abc123");
    }
}
