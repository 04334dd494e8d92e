//! Runtime Adapter: the seam between the Container Manager and the
//! out-of-scope VM-per-container runtime.
//!
//! The real adapter this crate ships against, `BollardRuntimeAdapter`,
//! talks to a live Docker Engine and stands in for "a VM handle" with a
//! Docker container — the nearest fetchable crate to the vsock-based
//! framework the design calls for. Swapping in a true VM backend later is
//! a second impl of this trait; nothing above this seam should need to
//! change.

mod bollard_adapter;

pub use bollard_adapter::BollardRuntimeAdapter;

use std::collections::HashMap;

use async_trait::async_trait;
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("transient runtime error: {0}")]
    Transient(String),

    #[error("runtime error: {0}")]
    Permanent(String),

    #[error("runtime handle not found: {0}")]
    NotFound(String),
}

impl RuntimeError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RuntimeError::NotFound(_) => StatusCode::NOT_FOUND,
            RuntimeError::Transient(_) | RuntimeError::Permanent(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Opaque handle id on the runtime side of the Docker-ID ↔ runtime-ID
/// bijection the adapter owns.
pub type VmHandle = String;

#[derive(Debug, Clone)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ResourceLimits {
    pub memory_bytes: i64,
    pub memory_swap_bytes: i64,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub cpu_shares: i64,
    pub pids_limit: i64,
}

/// Everything `createVM` needs: image ref, command, env, mounts, working
/// dir, tty/stdin flags, resource limits.
#[derive(Debug, Clone)]
pub struct VmSpec {
    pub docker_id: String,
    pub image_ref: String,
    pub cmd: Vec<String>,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<MountSpec>,
    pub working_dir: Option<String>,
    pub tty: bool,
    pub open_stdin: bool,
    pub hostname: Option<String>,
    pub labels: HashMap<String, String>,
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitResult {
    pub exit_code: i64,
    pub signaled: bool,
    pub oom_killed: bool,
}

/// Bidirectional stream handed back by `dialVsock`/`attachStdio`.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for T {}

/// The contract the Container Manager and Network Controller consume.
/// `createVM`/`start`/`stop`/`kill`/`wait`/`dialVsock`/`attachStdio`
/// exactly as named in the design.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    async fn create_vm(&self, spec: VmSpec) -> RuntimeResult<VmHandle>;

    async fn start(&self, handle: &VmHandle) -> RuntimeResult<()>;

    async fn stop(&self, handle: &VmHandle, graceful_timeout_secs: u64) -> RuntimeResult<()>;

    async fn kill(&self, handle: &VmHandle, signal: &str) -> RuntimeResult<()>;

    async fn wait(&self, handle: &VmHandle) -> RuntimeResult<WaitResult>;

    async fn destroy(&self, handle: &VmHandle) -> RuntimeResult<()>;

    async fn is_running(&self, handle: &VmHandle) -> RuntimeResult<bool>;

    async fn dial_vsock(
        &self,
        handle: &VmHandle,
        port: u32,
        cmd: Vec<String>,
    ) -> RuntimeResult<Box<dyn DuplexStream>>;

    async fn attach_stdio(
        &self,
        handle: &VmHandle,
    ) -> RuntimeResult<(Box<dyn AsyncWrite + Send + Unpin>, Box<dyn AsyncRead + Send + Unpin>)>;

    /// Resolve a persisted Docker ID back to a live runtime handle, e.g.
    /// after a daemon restart. Returns `NotFound` if the handle no longer
    /// exists on the runtime side.
    async fn resolve(&self, docker_id: &str) -> RuntimeResult<VmHandle>;

    /// Update resource limits without a restart, where the runtime
    /// supports it.
    async fn update_limits(&self, handle: &VmHandle, limits: ResourceLimits) -> RuntimeResult<()>;
}
