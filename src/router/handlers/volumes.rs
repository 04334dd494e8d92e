//! `/volumes/*` — list, create, inspect, remove, prune.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::DaemonError;
use crate::volume::{VolumeDriver, VolumeManager, VolumeRecord};

#[derive(Debug, Serialize)]
pub struct VolumeResponse {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Driver")]
    pub driver: String,
    #[serde(rename = "Mountpoint")]
    pub mountpoint: String,
    #[serde(rename = "Labels")]
    pub labels: HashMap<String, String>,
    #[serde(rename = "CreatedAt")]
    pub created_at: i64,
}

impl From<&VolumeRecord> for VolumeResponse {
    fn from(r: &VolumeRecord) -> Self {
        Self {
            name: r.name.clone(),
            driver: driver_name(r.driver).to_string(),
            mountpoint: r.mountpoint.clone(),
            labels: r.labels.clone(),
            created_at: r.created_at,
        }
    }
}

fn driver_name(driver: VolumeDriver) -> &'static str {
    match driver {
        VolumeDriver::Files => "files",
        VolumeDriver::Block => "block",
    }
}

fn parse_driver(name: &str) -> VolumeDriver {
    match name {
        "block" => VolumeDriver::Block,
        _ => VolumeDriver::Files,
    }
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    #[serde(rename = "Volumes")]
    pub volumes: Vec<VolumeResponse>,
}

pub async fn list(State(volumes): State<VolumeManager>) -> Result<Json<ListResponse>, DaemonError> {
    let all = volumes.list().await?;
    Ok(Json(ListResponse { volumes: all.iter().map(VolumeResponse::from).collect() }))
}

#[derive(Debug, Deserialize)]
pub struct CreateBody {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Driver", default)]
    pub driver: Option<String>,
    #[serde(rename = "Labels", default)]
    pub labels: HashMap<String, String>,
}

pub async fn create(
    State(volumes): State<VolumeManager>,
    Json(body): Json<CreateBody>,
) -> Result<(StatusCode, Json<VolumeResponse>), DaemonError> {
    let driver = parse_driver(body.driver.as_deref().unwrap_or("files"));
    let record = volumes.create(&body.name, driver, body.labels).await?;
    Ok((StatusCode::CREATED, Json(VolumeResponse::from(&record))))
}

pub async fn inspect(
    State(volumes): State<VolumeManager>,
    Path(name): Path<String>,
) -> Result<Json<VolumeResponse>, DaemonError> {
    let record = volumes.inspect(&name).await?;
    Ok(Json(VolumeResponse::from(&record)))
}

#[derive(Debug, Deserialize)]
pub struct RemoveQuery {
    #[serde(default)]
    pub force: bool,
}

pub async fn remove(
    State(volumes): State<VolumeManager>,
    Path(name): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> Result<StatusCode, DaemonError> {
    volumes.remove(&name, query.force).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Serialize)]
pub struct PruneResponse {
    #[serde(rename = "VolumesDeleted")]
    pub volumes_deleted: Vec<String>,
    #[serde(rename = "SpaceReclaimed")]
    pub space_reclaimed: u64,
}

pub async fn prune(State(volumes): State<VolumeManager>) -> Result<Json<PruneResponse>, DaemonError> {
    let deleted = volumes.prune().await?;
    Ok(Json(PruneResponse { volumes_deleted: deleted, space_reclaimed: 0 }))
}
