//! `/_ping`, `/version`, `/info` — daemon identity and host facts.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::network::NetworkAgentClient;
use crate::router::AppState;

const API_VERSION: &str = "1.51";
const MIN_API_VERSION: &str = "1.24";

pub async fn ping() -> &'static str {
    "OK"
}

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    #[serde(rename = "Version")]
    pub version: String,
    #[serde(rename = "ApiVersion")]
    pub api_version: String,
    #[serde(rename = "MinAPIVersion")]
    pub min_api_version: String,
    #[serde(rename = "Os")]
    pub os: String,
    #[serde(rename = "Arch")]
    pub arch: String,
    #[serde(rename = "KernelVersion")]
    pub kernel_version: String,
}

pub async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        api_version: API_VERSION.to_string(),
        min_api_version: MIN_API_VERSION.to_string(),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        kernel_version: sysinfo::System::kernel_version().unwrap_or_else(|| "unknown".to_string()),
    })
}

#[derive(Debug, Serialize)]
pub struct InfoResponse {
    #[serde(rename = "Containers")]
    pub containers: usize,
    #[serde(rename = "ContainersRunning")]
    pub containers_running: usize,
    #[serde(rename = "Images")]
    pub images: usize,
    #[serde(rename = "NCPU")]
    pub ncpu: usize,
    #[serde(rename = "MemTotal")]
    pub mem_total: u64,
    #[serde(rename = "ServerVersion")]
    pub server_version: String,
    #[serde(rename = "OperatingSystem")]
    pub operating_system: String,
    #[serde(rename = "Architecture")]
    pub architecture: String,
}

pub async fn info<A: NetworkAgentClient + 'static>(State(state): State<AppState<A>>) -> Json<InfoResponse> {
    let containers = state.containers.list(true).await.unwrap_or_default();
    let images = state.images.list().await.unwrap_or_default();

    let mut sys = sysinfo::System::new();
    sys.refresh_memory();

    Json(InfoResponse {
        containers: containers.len(),
        containers_running: containers.iter().filter(|c| c.is_running_like()).count(),
        images: images.len(),
        ncpu: num_cpus::get(),
        mem_total: sys.total_memory(),
        server_version: env!("CARGO_PKG_VERSION").to_string(),
        operating_system: std::env::consts::OS.to_string(),
        architecture: std::env::consts::ARCH.to_string(),
    })
}
