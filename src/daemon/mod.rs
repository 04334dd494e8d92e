//! Daemon Core (spec.md §4.9, §5, §6): wires every component's concrete
//! implementation together and serves the HTTP Router over a Unix socket.
//!
//! Grounded in the teacher's `cmd::root::run` boot sequence (load config,
//! build the manager stack, assemble `AppState`, build the router, install
//! a ctrl_c-triggered graceful shutdown, then serve) but generalized from a
//! TCP/TLS bind to a Unix socket, since spec.md §6 names `DOCKER_HOST`-style
//! Unix socket serving rather than a network listener.
//!
//! The Network Controller's only in-crate `NetworkAgentClient` implementor
//! is `LoopbackAgent` — the vsock-reached control-plane agent container is
//! out of scope (spec.md §1 Non-goals) — so `config.network.backend` is
//! read and logged here but does not select between implementations.

mod status;

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UnixListener;
use tracing::{info, warn};

use crate::build::{BuildManager, LoopbackBuildClient};
use crate::config::Configuration;
use crate::container::ContainerManager;
use crate::events::EventBus;
use crate::image::puller::RegistryPuller;
use crate::image::ImageStore;
use crate::ipam::Ipam;
use crate::network::{LoopbackAgent, NetworkController};
use crate::router::{self, AppState};
use crate::runtime::{BollardRuntimeAdapter, RuntimeAdapter};
use crate::store::StateStore;
use crate::volume::VolumeManager;

pub use status::{status, stop};

/// CLI-supplied overrides layered onto the on-disk configuration, the way
/// the teacher's `Cli` flags win over `config.yml`.
#[derive(Debug, Default, Clone)]
pub struct StartOverrides {
    pub socket_path: Option<PathBuf>,
    pub log_level: Option<String>,
    pub kernel_path: Option<PathBuf>,
}

fn apply_overrides(mut config: Configuration, overrides: &StartOverrides) -> Configuration {
    if let Some(path) = &overrides.socket_path {
        config.api.socket_path = Some(path.clone());
    }
    if let Some(level) = &overrides.log_level {
        config.system.log_level = level.clone();
    }
    if let Some(kernel) = &overrides.kernel_path {
        config.runtime.kernel_path = Some(kernel.clone());
    }
    config
}

fn pid_file_path(config: &Configuration) -> PathBuf {
    config.system.base_directory().join("arca.pid")
}

fn write_pid_file(config: &Configuration) -> Result<()> {
    let path = pid_file_path(config);
    std::fs::write(&path, std::process::id().to_string())
        .with_context(|| format!("failed to write pid file at {}", path.display()))
}

/// Starts the daemon and blocks until a shutdown signal arrives.
///
/// This process model relies on the OS service manager (systemd, a
/// process supervisor, or an attached terminal) to keep the daemon
/// running and to restart it; it never forks or detaches itself.
pub async fn start(config_path: &str, overrides: StartOverrides) -> Result<()> {
    info!(path = config_path, "loading configuration");
    let config = Configuration::load(config_path).context("failed to load configuration")?;
    let config = apply_overrides(config, &overrides);
    let config = Arc::new(config);

    let socket_path = config.api.socket_path();
    info!(
        socket = %socket_path.display(),
        backend = %config.network.backend,
        "configuration loaded"
    );
    if config.network.backend != "bridge" && config.network.backend != "nat" {
        warn!(backend = %config.network.backend, "unrecognized network.backend value, proceeding anyway");
    }

    let store = StateStore::open(config.system.state_db_path()).context("failed to open state store")?;

    let ipam = Arc::new(Ipam::new(store.clone()));
    let network = Arc::new(NetworkController::new(store.clone(), ipam, LoopbackAgent::new()));

    let images = ImageStore::new(store.clone(), Arc::new(RegistryPuller::new()), config.system.layers_directory());
    let volumes = VolumeManager::new(store.clone(), config.system.base_directory().join("volumes"));

    let runtime: Arc<dyn RuntimeAdapter> =
        Arc::new(BollardRuntimeAdapter::connect().context("failed to connect to the container runtime")?);
    let events = Arc::new(EventBus::new());

    let containers = Arc::new(ContainerManager::new(
        store.clone(),
        runtime,
        network.clone(),
        images.clone(),
        volumes.clone(),
        events.clone(),
    ));

    info!("recovering container state from a previous run");
    containers.recover_from_crash().await.context("crash recovery failed")?;

    let build = Arc::new(BuildManager::new(
        containers.clone(),
        Arc::new(LoopbackBuildClient),
        "arca/buildkit:latest".into(),
    ));

    let state = AppState {
        containers: containers.clone(),
        images,
        networks: network,
        volumes,
        build,
        events,
        config: config.clone(),
    };
    let app = router::build_router(state);

    if socket_path.exists() {
        std::fs::remove_file(&socket_path)
            .with_context(|| format!("failed to remove stale socket at {}", socket_path.display()))?;
    }
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to bind unix socket at {}", socket_path.display()))?;
    std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(0o600))
        .context("failed to set socket permissions")?;
    info!(path = %socket_path.display(), "listening");

    write_pid_file(&config)?;

    let serve_result = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await;

    info!("no longer accepting connections, draining in-flight work");
    // Monitor tasks (restart backoff, exit watchers) are plain spawned
    // tasks with no cancellation handle; give them a grace window to
    // finish rather than killing the process out from under them.
    tokio::time::sleep(Duration::from_secs(5)).await;

    let _ = std::fs::remove_file(&socket_path);
    let _ = std::fs::remove_file(pid_file_path(&config));

    serve_result.context("server error")?;
    info!("daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install ctrl_c handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => warn!("received SIGINT, shutting down"),
        _ = terminate => warn!("received SIGTERM, shutting down"),
    }
}
