//! `/images/*` — list, pull, inspect, remove.

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::DaemonError;
use crate::image::{ImageRecord, ImageStore, RegistryAuth};
use crate::router::stream::progress_line_json;

#[derive(Debug, Serialize)]
pub struct ImageSummary {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "RepoTags")]
    pub repo_tags: Vec<String>,
    #[serde(rename = "RepoDigests")]
    pub repo_digests: Vec<String>,
    #[serde(rename = "Created")]
    pub created: i64,
    #[serde(rename = "Size")]
    pub size: u64,
}

impl From<&ImageRecord> for ImageSummary {
    fn from(r: &ImageRecord) -> Self {
        Self {
            id: r.id.clone(),
            repo_tags: r.repo_tags.clone(),
            repo_digests: r.repo_digests.clone(),
            created: r.created,
            size: r.size,
        }
    }
}

pub async fn list(State(images): State<ImageStore>) -> Result<Json<Vec<ImageSummary>>, DaemonError> {
    let images = images.list().await?;
    Ok(Json(images.iter().map(ImageSummary::from).collect()))
}

#[derive(Debug, Deserialize)]
pub struct CreateQuery {
    #[serde(rename = "fromImage")]
    pub from_image: Option<String>,
    pub tag: Option<String>,
}

/// Mirrors `POST /images/create?fromImage=...&tag=...`: streams NDJSON
/// progress lines exactly as Docker clients already parse, reading
/// `X-Registry-Auth` the way `docker pull` sends it (base64 JSON; decoded
/// losslessly or treated as anonymous on any parse failure).
pub async fn create(
    State(images): State<ImageStore>,
    Query(query): Query<CreateQuery>,
    headers: HeaderMap,
) -> Result<Response, DaemonError> {
    let image = query.from_image.ok_or_else(|| DaemonError::Validation("fromImage is required".into()))?;
    let reference = match query.tag {
        Some(tag) => format!("{}:{}", image, tag),
        None => image,
    };
    let auth = parse_registry_auth(&headers);

    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    let pull_reference = reference.clone();
    let pull_task = tokio::spawn(async move { images.pull(&pull_reference, auth, tx).await });

    let body_stream = async_stream::stream! {
        while let Some(line) = rx.recv().await {
            yield Ok::<_, std::io::Error>(bytes::Bytes::from(progress_line_json(&line)));
        }
        if let Ok(Err(e)) = pull_task.await {
            let message = serde_json::json!({ "error": e.to_string() }).to_string();
            yield Ok(bytes::Bytes::from(format!("{}\n", message)));
        }
    };

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Body::from_stream(body_stream))
        .unwrap())
}

fn parse_registry_auth(headers: &HeaderMap) -> Option<RegistryAuth> {
    let raw = headers.get("X-Registry-Auth")?.to_str().ok()?;
    let decoded = base64_decode(raw)?;
    let parsed: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
    Some(RegistryAuth {
        username: parsed.get("username")?.as_str()?.to_string(),
        password: parsed.get("password").and_then(|v| v.as_str()).unwrap_or("").to_string(),
    })
}

/// Docker sends `X-Registry-Auth` as standard base64 (padded or not,
/// depending on client); `=` padding is simply ignored rather than
/// validated.
fn base64_decode(input: &str) -> Option<Vec<u8>> {
    let mut table = [-1i8; 256];
    for (i, c) in "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/".bytes().enumerate() {
        table[c as usize] = i as i8;
    }

    let mut out = Vec::new();
    let mut acc: u32 = 0;
    let mut bits = 0;
    for b in input.bytes().filter(|b| *b != b'=' && !b.is_ascii_whitespace()) {
        let v = table[b as usize];
        if v < 0 {
            return None;
        }
        acc = (acc << 6) | v as u32;
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
        }
    }
    Some(out)
}

pub async fn inspect(
    State(images): State<ImageStore>,
    Path(name): Path<String>,
) -> Result<Json<ImageRecord>, DaemonError> {
    Ok(Json(images.inspect(&name).await?))
}

#[derive(Debug, Deserialize)]
pub struct TagQuery {
    pub repo: String,
    pub tag: Option<String>,
}

pub async fn tag(
    State(images): State<ImageStore>,
    Path(name): Path<String>,
    Query(query): Query<TagQuery>,
) -> Result<StatusCode, DaemonError> {
    let dst = match query.tag {
        Some(tag) => format!("{}:{}", query.repo, tag),
        None => format!("{}:latest", query.repo),
    };
    images.tag(&name, &dst).await?;
    Ok(StatusCode::CREATED)
}

#[derive(Debug, Deserialize)]
pub struct RemoveQuery {
    #[serde(default)]
    pub force: bool,
}

pub async fn remove(
    State(images): State<ImageStore>,
    Path(name): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> Result<StatusCode, DaemonError> {
    images.remove(&name, query.force).await?;
    Ok(StatusCode::OK)
}
