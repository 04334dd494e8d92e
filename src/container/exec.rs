//! Exec records (spec.md §3): one-shot command instances scoped to a
//! running container's lifetime, stored the same way container records
//! are — a JSON blob in the State Store under `exec/<id>`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Created,
    Running,
    Exited,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub tty: bool,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRecord {
    pub id: String,
    pub container_id: String,
    pub config: ExecConfig,
    pub status: ExecStatus,
    pub exit_code: Option<i64>,
}

pub fn exec_key(id: &str) -> String {
    format!("exec/{}", id)
}

pub fn exec_prefix_for_container(container_id: &str) -> String {
    // Execs aren't keyed by container in storage (they're looked up by their
    // own id), so removal on `remove` scans the full table and filters —
    // see `ContainerManager::remove`.
    let _ = container_id;
    "exec/".to_string()
}
