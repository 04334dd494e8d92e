//! `/containers/*` — create, list, inspect, lifecycle, logs/attach, exec.

use std::collections::HashMap;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::container::{
    Bind, ContainerConfig, ContainerRecord, CreateRequest, HostConfig, NetworkAttachmentConfig, PortBinding,
    ResourceRequest, RestartPolicy,
};
use crate::error::DaemonError;
use crate::network::NetworkAgentClient;
use crate::router::stream::{frame, StreamType};
use crate::router::AppState;
use crate::volume::VolumeDriver;

#[derive(Debug, Serialize)]
pub struct ContainerSummary {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Names")]
    pub names: Vec<String>,
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "State")]
    pub state: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Created")]
    pub created: i64,
    #[serde(rename = "Labels")]
    pub labels: HashMap<String, String>,
}

impl From<&ContainerRecord> for ContainerSummary {
    fn from(r: &ContainerRecord) -> Self {
        Self {
            id: r.id.clone(),
            names: r.names.clone(),
            image: r.image_ref.clone(),
            state: r.state.status.as_str().to_string(),
            status: human_status(r),
            created: r.created_at,
            labels: r.config.labels.clone(),
        }
    }
}

fn human_status(r: &ContainerRecord) -> String {
    match r.state.status {
        crate::container::ContainerStatus::Running => "Up".to_string(),
        crate::container::ContainerStatus::Exited => {
            format!("Exited ({})", r.state.exit_code.unwrap_or(0))
        }
        other => other.as_str().to_string(),
    }
}

#[derive(Debug, Serialize)]
pub struct ContainerInspectResponse {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "Created")]
    pub created: i64,
    #[serde(rename = "State")]
    pub state: InspectState,
    #[serde(rename = "Config")]
    pub config: InspectConfig,
    #[serde(rename = "HostConfig")]
    pub host_config: InspectHostConfig,
    #[serde(rename = "RestartCount")]
    pub restart_count: u32,
}

#[derive(Debug, Serialize)]
pub struct InspectState {
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "Running")]
    pub running: bool,
    #[serde(rename = "Paused")]
    pub paused: bool,
    #[serde(rename = "StartedAt")]
    pub started_at: Option<i64>,
    #[serde(rename = "FinishedAt")]
    pub finished_at: Option<i64>,
    #[serde(rename = "ExitCode")]
    pub exit_code: Option<i64>,
    #[serde(rename = "OOMKilled")]
    pub oom_killed: bool,
    #[serde(rename = "Error")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct InspectConfig {
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "Cmd")]
    pub cmd: Vec<String>,
    #[serde(rename = "Env")]
    pub env: Vec<String>,
    #[serde(rename = "Labels")]
    pub labels: HashMap<String, String>,
    #[serde(rename = "Tty")]
    pub tty: bool,
}

#[derive(Debug, Serialize)]
pub struct InspectHostConfig {
    #[serde(rename = "RestartPolicy")]
    pub restart_policy: InspectRestartPolicy,
}

#[derive(Debug, Serialize)]
pub struct InspectRestartPolicy {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "MaximumRetryCount")]
    pub maximum_retry_count: i64,
}

impl From<&ContainerRecord> for ContainerInspectResponse {
    fn from(r: &ContainerRecord) -> Self {
        Self {
            id: r.id.clone(),
            name: r.names.first().cloned().unwrap_or_default(),
            image: r.image_ref.clone(),
            created: r.created_at,
            state: InspectState {
                status: r.state.status.as_str().to_string(),
                running: r.state.status == crate::container::ContainerStatus::Running,
                paused: r.state.status == crate::container::ContainerStatus::Paused,
                started_at: r.state.started_at,
                finished_at: r.state.finished_at,
                exit_code: r.state.exit_code,
                oom_killed: r.state.oom_killed,
                error: r.state.error.clone(),
            },
            config: InspectConfig {
                image: r.image_ref.clone(),
                cmd: r.config.cmd.clone(),
                env: r.config.env.clone(),
                labels: r.config.labels.clone(),
                tty: r.config.tty,
            },
            host_config: InspectHostConfig {
                restart_policy: InspectRestartPolicy {
                    name: r.host_config.restart_policy.name().to_string(),
                    maximum_retry_count: r.host_config.restart_policy.max_retry_count(),
                },
            },
            restart_count: r.state.restart_count,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub all: bool,
}

pub async fn list<A: NetworkAgentClient + 'static>(
    State(state): State<AppState<A>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<ContainerSummary>>, DaemonError> {
    let records = state.containers.list(query.all).await?;
    Ok(Json(records.iter().map(ContainerSummary::from).collect()))
}

#[derive(Debug, Deserialize)]
pub struct CreateQuery {
    pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "Cmd", default)]
    pub cmd: Vec<String>,
    #[serde(rename = "Env", default)]
    pub env: Vec<String>,
    #[serde(rename = "WorkingDir", default)]
    pub working_dir: Option<String>,
    #[serde(rename = "Labels", default)]
    pub labels: HashMap<String, String>,
    #[serde(rename = "Tty", default)]
    pub tty: bool,
    #[serde(rename = "OpenStdin", default)]
    pub open_stdin: bool,
    #[serde(rename = "HostConfig", default)]
    pub host_config: CreateHostConfigBody,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateHostConfigBody {
    #[serde(rename = "RestartPolicy", default)]
    pub restart_policy: Option<CreateRestartPolicyBody>,
    #[serde(rename = "Binds", default)]
    pub binds: Vec<String>,
    #[serde(rename = "Memory", default)]
    pub memory: i64,
    #[serde(rename = "NetworkMode", default)]
    pub network_mode: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRestartPolicyBody {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "MaximumRetryCount", default)]
    pub maximum_retry_count: i64,
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    #[serde(rename = "Id")]
    pub id: String,
}

pub async fn create<A: NetworkAgentClient + 'static>(
    State(state): State<AppState<A>>,
    Query(query): Query<CreateQuery>,
    Json(body): Json<CreateBody>,
) -> Result<(StatusCode, Json<CreateResponse>), DaemonError> {
    let mut binds: Vec<Bind> = Vec::new();
    let mut volume_names: Vec<String> = Vec::new();
    for spec in &body.host_config.binds {
        let Some(mut bind) = parse_bind(spec) else { continue };
        // A bind source that isn't a path is a named volume reference
        // (Docker's own `docker run -v name:/path` convention); resolve it
        // to the volume's on-disk mountpoint, auto-creating it if new.
        if !bind.host_path.starts_with('/') && !bind.host_path.starts_with('.') {
            let record = state.volumes.create(&bind.host_path, VolumeDriver::Files, HashMap::new()).await?;
            volume_names.push(bind.host_path.clone());
            bind.host_path = record.mountpoint;
        }
        binds.push(bind);
    }

    let restart_policy = body
        .host_config
        .restart_policy
        .map(|p| RestartPolicy::parse(&p.name, p.maximum_retry_count))
        .unwrap_or(RestartPolicy::No);

    let network_mode = body.host_config.network_mode.into_iter().collect::<Vec<_>>();
    let networks = network_mode
        .iter()
        .filter(|m| *m != "none" && *m != "default" && *m != "bridge")
        .map(|network_id| NetworkAttachmentConfig { network_id: network_id.clone(), aliases: vec![], ip_hint: None })
        .collect();

    let config = ContainerConfig {
        image: body.image,
        cmd: body.cmd,
        env: body.env,
        working_dir: body.working_dir,
        labels: body.labels,
        tty: body.tty,
        open_stdin: body.open_stdin,
        exposed_ports: Vec::<PortBinding>::new(),
        user: None,
        hostname: None,
    };

    let host_config = HostConfig {
        restart_policy,
        resources: ResourceRequest { memory_bytes: body.host_config.memory, ..Default::default() },
        binds,
        volumes: volume_names,
        network_mode,
    };

    let record = state
        .containers
        .create(CreateRequest { name: query.name, config, host_config, networks })
        .await?;

    Ok((StatusCode::CREATED, Json(CreateResponse { id: record.id })))
}

fn parse_bind(spec: &str) -> Option<Bind> {
    let mut parts = spec.split(':');
    let host_path = parts.next()?.to_string();
    let container_path = parts.next()?.to_string();
    let read_only = parts.next().map(|m| m == "ro").unwrap_or(false);
    Some(Bind { host_path, container_path, read_only })
}

pub async fn inspect<A: NetworkAgentClient + 'static>(
    State(state): State<AppState<A>>,
    Path(id): Path<String>,
) -> Result<Json<ContainerInspectResponse>, DaemonError> {
    let record = state.containers.resolve(&id).await?;
    Ok(Json(ContainerInspectResponse::from(&record)))
}

/// Lifecycle operations are idempotent in Docker's wire sense: a `409`
/// from the manager on an already-desired state surfaces as `304`, not an
/// error, per spec.md §8.
fn lifecycle_response(result: Result<(), crate::container::ManagerError>) -> Result<StatusCode, DaemonError> {
    match result {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(crate::container::ManagerError::Conflict(_)) => Ok(StatusCode::NOT_MODIFIED),
        Err(e) => Err(e.into()),
    }
}

pub async fn start<A: NetworkAgentClient + 'static>(
    State(state): State<AppState<A>>,
    Path(id): Path<String>,
) -> Result<StatusCode, DaemonError> {
    lifecycle_response(state.containers.start(&id).await)
}

#[derive(Debug, Deserialize)]
pub struct StopQuery {
    #[serde(rename = "t", default = "default_stop_timeout")]
    pub timeout: u64,
}

fn default_stop_timeout() -> u64 {
    10
}

pub async fn stop<A: NetworkAgentClient + 'static>(
    State(state): State<AppState<A>>,
    Path(id): Path<String>,
    Query(query): Query<StopQuery>,
) -> Result<StatusCode, DaemonError> {
    lifecycle_response(state.containers.stop(&id, query.timeout).await)
}

pub async fn restart<A: NetworkAgentClient + 'static>(
    State(state): State<AppState<A>>,
    Path(id): Path<String>,
    Query(query): Query<StopQuery>,
) -> Result<StatusCode, DaemonError> {
    let _ = state.containers.stop(&id, query.timeout).await;
    state.containers.start(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct KillQuery {
    #[serde(default = "default_signal")]
    pub signal: String,
}

fn default_signal() -> String {
    "SIGKILL".to_string()
}

pub async fn kill<A: NetworkAgentClient + 'static>(
    State(state): State<AppState<A>>,
    Path(id): Path<String>,
    Query(query): Query<KillQuery>,
) -> Result<StatusCode, DaemonError> {
    state.containers.kill(&id, &query.signal).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn pause<A: NetworkAgentClient + 'static>(
    State(state): State<AppState<A>>,
    Path(id): Path<String>,
) -> Result<StatusCode, DaemonError> {
    lifecycle_response(state.containers.pause(&id).await)
}

pub async fn unpause<A: NetworkAgentClient + 'static>(
    State(state): State<AppState<A>>,
    Path(id): Path<String>,
) -> Result<StatusCode, DaemonError> {
    lifecycle_response(state.containers.unpause(&id).await)
}

#[derive(Debug, Serialize)]
pub struct WaitResponse {
    #[serde(rename = "StatusCode")]
    pub status_code: i64,
}

pub async fn wait<A: NetworkAgentClient + 'static>(
    State(state): State<AppState<A>>,
    Path(id): Path<String>,
) -> Result<Json<WaitResponse>, DaemonError> {
    let status_code = state.containers.wait(&id).await?;
    Ok(Json(WaitResponse { status_code }))
}

#[derive(Debug, Deserialize)]
pub struct RemoveQuery {
    #[serde(default)]
    pub force: bool,
}

pub async fn remove<A: NetworkAgentClient + 'static>(
    State(state): State<AppState<A>>,
    Path(id): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> Result<StatusCode, DaemonError> {
    state.containers.remove(&id, query.force).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub follow: bool,
    #[serde(default)]
    pub stdout: bool,
    #[serde(default)]
    pub stderr: bool,
    #[serde(default)]
    pub timestamps: bool,
    #[serde(default)]
    pub tail: Option<String>,
}

/// Streams stdout/stderr framed with the 8-byte Docker log header
/// (spec.md §6), reusing the same stdio attachment the Runtime Adapter
/// hands back for `attach`.
pub async fn logs<A: NetworkAgentClient + 'static>(
    State(state): State<AppState<A>>,
    Path(id): Path<String>,
    Query(_query): Query<LogsQuery>,
) -> Result<Response, DaemonError> {
    let record = state.containers.resolve(&id).await?;
    let (_writer, mut reader) = state.containers.attach_stdio(&id).await?;

    let body_stream = async_stream::stream! {
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => yield Ok::<_, std::io::Error>(bytes::Bytes::from(frame(StreamType::Stdout, &buf[..n]))),
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    };

    let _ = record.config.tty;
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/vnd.docker.raw-stream")
        .body(Body::from_stream(body_stream))
        .unwrap())
}

/// `attach` hijacks the connection into a raw bidirectional pipe over the
/// runtime adapter's stdio stream — here modeled as a one-shot relay for
/// the lifetime of the HTTP response body, same framing as `logs`.
pub async fn attach<A: NetworkAgentClient + 'static>(
    State(state): State<AppState<A>>,
    Path(id): Path<String>,
) -> Result<Response, DaemonError> {
    logs(State(state), Path(id), Query(LogsQuery { follow: true, stdout: true, stderr: true, timestamps: false, tail: None })).await
}
