//! `/containers/:id/exec` and `/exec/*` — one-shot command execution
//! inside a running container's VM, reusing the Runtime Adapter's vsock
//! dial the same way `attach`/`logs` reuse its stdio stream.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::container::{ExecConfig, ExecRecord, ExecStatus};
use crate::error::DaemonError;
use crate::network::NetworkAgentClient;
use crate::router::stream::{frame, StreamType};
use crate::router::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    #[serde(rename = "Cmd", default)]
    pub cmd: Vec<String>,
    #[serde(rename = "Env", default)]
    pub env: Vec<String>,
    #[serde(rename = "Tty", default)]
    pub tty: bool,
    #[serde(rename = "AttachStdin", default)]
    pub attach_stdin: bool,
    #[serde(rename = "AttachStdout", default = "default_true")]
    pub attach_stdout: bool,
    #[serde(rename = "AttachStderr", default = "default_true")]
    pub attach_stderr: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    #[serde(rename = "Id")]
    pub id: String,
}

pub async fn create<A: NetworkAgentClient + 'static>(
    State(state): State<AppState<A>>,
    Path(id): Path<String>,
    Json(body): Json<CreateBody>,
) -> Result<(StatusCode, Json<CreateResponse>), DaemonError> {
    let config = ExecConfig {
        cmd: body.cmd,
        env: body.env,
        tty: body.tty,
        attach_stdin: body.attach_stdin,
        attach_stdout: body.attach_stdout,
        attach_stderr: body.attach_stderr,
    };
    let exec = state.containers.create_exec(&id, config).await?;
    Ok((StatusCode::CREATED, Json(CreateResponse { id: exec.id })))
}

#[derive(Debug, Deserialize)]
pub struct StartBody {
    #[serde(rename = "Detach", default)]
    pub detach: bool,
    #[serde(rename = "Tty", default)]
    pub tty: bool,
}

/// `Detach: true` fires the command and returns immediately; otherwise
/// this relays the vsock stream's output back as the HTTP response body,
/// same framing `logs`/`attach` already use for a hijacked connection.
pub async fn start<A: NetworkAgentClient + 'static>(
    State(state): State<AppState<A>>,
    Path(id): Path<String>,
    Json(body): Json<StartBody>,
) -> Result<Response, DaemonError> {
    if body.detach {
        let containers = state.containers.clone();
        let exec_id = id.clone();
        tokio::spawn(async move {
            let _ = containers.start_exec(&exec_id).await;
        });
        return Ok(StatusCode::OK.into_response());
    }

    let mut stream = state.containers.start_exec(&id).await?;
    let _ = body.tty;

    let body_stream = async_stream::stream! {
        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 8192];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => yield Ok::<_, std::io::Error>(bytes::Bytes::from(frame(StreamType::Stdout, &buf[..n]))),
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    };

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/vnd.docker.raw-stream")
        .body(Body::from_stream(body_stream))
        .unwrap())
}

#[derive(Debug, Serialize)]
pub struct InspectResponse {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "ContainerID")]
    pub container_id: String,
    #[serde(rename = "Running")]
    pub running: bool,
    #[serde(rename = "ExitCode")]
    pub exit_code: Option<i64>,
}

impl From<&ExecRecord> for InspectResponse {
    fn from(r: &ExecRecord) -> Self {
        Self {
            id: r.id.clone(),
            container_id: r.container_id.clone(),
            running: r.status == ExecStatus::Running,
            exit_code: r.exit_code,
        }
    }
}

pub async fn inspect<A: NetworkAgentClient + 'static>(
    State(state): State<AppState<A>>,
    Path(id): Path<String>,
) -> Result<Json<InspectResponse>, DaemonError> {
    let exec = state.containers.get_exec(&id).await?;
    Ok(Json(InspectResponse::from(&exec)))
}
