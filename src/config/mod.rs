//! Daemon configuration: a JSON config file plus CLI overrides.

mod config;

pub use config::*;
