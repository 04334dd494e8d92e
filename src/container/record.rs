//! Container record (spec.md §3): the durable shape of a container,
//! its config/host-config wire sub-structures, and the in-memory status
//! enum the state machine in `manager.rs` drives.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::restart::RestartPolicy;

pub fn container_key(id: &str) -> String {
    format!("container/{}", id)
}

pub fn name_key(name: &str) -> String {
    format!("container_name/{}", name)
}

/// `created, running, paused, restarting, exited, dead, removing` —
/// exactly the status set spec.md §3 names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Exited,
    Dead,
    Removing,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Created => "created",
            ContainerStatus::Running => "running",
            ContainerStatus::Paused => "paused",
            ContainerStatus::Restarting => "restarting",
            ContainerStatus::Exited => "exited",
            ContainerStatus::Dead => "dead",
            ContainerStatus::Removing => "removing",
        }
    }
}

/// Bind mount: host path -> container path, optionally read-only
/// (`host:container[:ro]` on the wire).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bind {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortBinding {
    pub container_port: u16,
    pub protocol: String,
    pub host_port: Option<u16>,
}

/// Everything the image/command/env side of `docker create` submits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub image: String,
    pub cmd: Vec<String>,
    /// Ordered `key=value` env, preserving submission order (spec.md §8's
    /// "stable canonical ordering" round-trip requirement).
    pub env: Vec<String>,
    pub working_dir: Option<String>,
    pub labels: HashMap<String, String>,
    pub tty: bool,
    pub open_stdin: bool,
    pub exposed_ports: Vec<PortBinding>,
    pub user: Option<String>,
    pub hostname: Option<String>,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            cmd: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            labels: HashMap::new(),
            tty: false,
            open_stdin: false,
            exposed_ports: Vec::new(),
            user: None,
            hostname: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub memory_bytes: i64,
    pub memory_swap_bytes: i64,
    pub cpu_quota: i64,
    pub cpu_period: i64,
    pub cpu_shares: i64,
    pub pids_limit: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    pub restart_policy: RestartPolicy,
    pub resources: ResourceRequest,
    pub binds: Vec<Bind>,
    /// Named volumes referenced by this container (as opposed to host-path
    /// binds), refcounted by the Volume Manager across create/remove.
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Network names to attach at `start`, in declared order (eth0, eth1, ...).
    pub network_mode: Vec<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            restart_policy: RestartPolicy::No,
            resources: ResourceRequest::default(),
            binds: Vec::new(),
            volumes: Vec::new(),
            network_mode: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkAttachmentConfig {
    pub network_id: String,
    pub aliases: Vec<String>,
    pub ip_hint: Option<std::net::Ipv4Addr>,
}

/// The mutable, transient half of the record (spec.md §3 `state` block).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerState {
    pub status: ContainerStatus,
    pub pid: Option<i64>,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,
    pub exit_code: Option<i64>,
    pub error: Option<String>,
    pub oom_killed: bool,
    pub restart_count: u32,
}

impl Default for ContainerState {
    fn default() -> Self {
        Self {
            status: ContainerStatus::Created,
            pid: None,
            started_at: None,
            finished_at: None,
            exit_code: None,
            error: None,
            oom_killed: false,
            restart_count: 0,
        }
    }
}

/// Whether the last user-initiated action against this container was a
/// stop; `unless-stopped` restart policy keys off this (spec.md §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LastAction {
    None,
    UserStop,
    UserStart,
}

impl Default for LastAction {
    fn default() -> Self {
        LastAction::None
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub id: String,
    pub names: Vec<String>,
    pub image_ref: String,
    pub image_digest: String,
    pub config: ContainerConfig,
    pub host_config: HostConfig,
    pub networks: Vec<NetworkAttachmentConfig>,
    pub state: ContainerState,
    /// Bumped on every fresh `start`; a Monitor task whose generation has
    /// fallen behind discards its own writes (spec.md §3, §4.6).
    pub monitor_generation: u64,
    pub last_action: LastAction,
    pub created_at: i64,
}

impl ContainerRecord {
    pub fn is_running_like(&self) -> bool {
        matches!(
            self.state.status,
            ContainerStatus::Running | ContainerStatus::Paused | ContainerStatus::Restarting
        )
    }
}
