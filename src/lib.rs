//! Arca daemon library: a Docker Engine API-compatible surface over a
//! host-native VM-per-container runtime.

pub mod build;
pub mod config;
pub mod container;
pub mod daemon;
pub mod error;
pub mod events;
pub mod image;
pub mod ipam;
pub mod network;
pub mod router;
pub mod runtime;
pub mod store;
pub mod volume;

pub use config::Configuration;
pub use error::DaemonError;
pub use events::EventBus;
