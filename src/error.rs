//! Daemon-wide error taxonomy.
//!
//! Every layer maps its domain error into one of these kinds; the HTTP
//! boundary turns a kind into a Docker-compatible status code and a
//! `{"message": "..."}` body. Handlers never invent their own status codes
//! or prefixes — error text matches what Docker clients already expect.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::build::BuildError;
use crate::container::ManagerError;
use crate::image::ImageError;
use crate::ipam::IpamError;
use crate::network::NetworkError;
use crate::runtime::RuntimeError;
use crate::store::StorageError;
use crate::volume::VolumeError;

#[derive(Error, Debug)]
pub enum DaemonError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("{0}")]
    Network(#[from] NetworkError),

    #[error("authentication required")]
    AuthRequired,

    #[error("{0}")]
    Timeout(String),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DaemonError>;

impl From<IpamError> for DaemonError {
    fn from(e: IpamError) -> Self {
        match e {
            IpamError::Exhausted => {
                DaemonError::Conflict("no available IP addresses in network pool".into())
            }
            IpamError::Storage(s) => DaemonError::Storage(s),
            IpamError::NotFound(n) => DaemonError::NotFound(n),
        }
    }
}

impl From<ImageError> for DaemonError {
    fn from(e: ImageError) -> Self {
        match e {
            ImageError::NotFound(r) => DaemonError::NotFound(r),
            ImageError::AuthRequired(_) => DaemonError::AuthRequired,
            ImageError::Registry(m) => DaemonError::Internal(m),
            ImageError::Corrupt(m) => DaemonError::Internal(m),
            ImageError::Storage(s) => DaemonError::Storage(s),
        }
    }
}

impl From<ManagerError> for DaemonError {
    fn from(e: ManagerError) -> Self {
        match e {
            ManagerError::NotFound(m) => DaemonError::NotFound(m),
            ManagerError::NameConflict(m) => DaemonError::Conflict(m),
            ManagerError::Conflict(m) => DaemonError::Conflict(m),
            ManagerError::Busy(m) => DaemonError::Conflict(m),
            ManagerError::Storage(s) => DaemonError::Storage(s),
            ManagerError::Runtime(r) => DaemonError::Runtime(r),
            ManagerError::Network(n) => DaemonError::Network(n),
            ManagerError::Image(i) => i.into(),
            ManagerError::Volume(v) => v.into(),
        }
    }
}

impl From<VolumeError> for DaemonError {
    fn from(e: VolumeError) -> Self {
        match e {
            VolumeError::NotFound(m) => DaemonError::NotFound(m),
            VolumeError::NameConflict(m) => DaemonError::Conflict(m),
            VolumeError::InUse(m) => DaemonError::Conflict(m),
            VolumeError::Storage(s) => DaemonError::Storage(s),
        }
    }
}

impl From<BuildError> for DaemonError {
    fn from(e: BuildError) -> Self {
        match e {
            BuildError::Unreachable(m) => DaemonError::Timeout(m),
            BuildError::Failed(m) => DaemonError::Internal(m),
            BuildError::Manager(m) => m.into(),
        }
    }
}

impl IntoResponse for DaemonError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            DaemonError::Validation(m) => (StatusCode::BAD_REQUEST, m.clone()),
            DaemonError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            DaemonError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            DaemonError::Storage(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            DaemonError::Runtime(e) => (e.status_code(), e.to_string()),
            DaemonError::Network(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            DaemonError::AuthRequired => {
                (StatusCode::UNAUTHORIZED, "authentication required".to_string())
            }
            DaemonError::Timeout(m) => (StatusCode::REQUEST_TIMEOUT, m.clone()),
            DaemonError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m.clone()),
        };

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %self, "request failed");
        }

        (status, Json(json!({ "message": message }))).into_response()
    }
}
