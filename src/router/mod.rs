//! HTTP Router + Handlers (spec.md §4.9): the Docker Engine API-compatible
//! surface, built the way the teacher assembles its own `router/mod.rs` —
//! an `AppState` threaded through `with_state`, a nested `Router`, and a
//! `tower_http` middleware stack — generalized from Bearer-token auth to
//! version-prefix normalization (no auth boundary exists on a Unix socket
//! whose permissions already gate access).

pub mod handlers;
mod middleware;
pub mod stream;

use std::sync::Arc;

use axum::extract::FromRef;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::build::BuildManager;
use crate::config::Configuration;
use crate::container::ContainerManager;
use crate::events::EventBus;
use crate::image::ImageStore;
use crate::network::{NetworkAgentClient, NetworkController};
use crate::volume::VolumeManager;

pub use middleware::normalize_api_version;

/// Everything a handler needs, shared behind `Arc`s the way the teacher's
/// `AppState` shares its `Manager`/`HttpClient`/`Configuration`.
pub struct AppState<A: NetworkAgentClient + 'static> {
    pub containers: Arc<ContainerManager<A>>,
    pub images: ImageStore,
    pub networks: Arc<NetworkController<A>>,
    pub volumes: VolumeManager,
    pub build: Arc<BuildManager<A>>,
    pub events: Arc<EventBus>,
    pub config: Arc<Configuration>,
}

impl<A: NetworkAgentClient + 'static> Clone for AppState<A> {
    fn clone(&self) -> Self {
        Self {
            containers: self.containers.clone(),
            images: self.images.clone(),
            networks: self.networks.clone(),
            volumes: self.volumes.clone(),
            build: self.build.clone(),
            events: self.events.clone(),
            config: self.config.clone(),
        }
    }
}

/// Handlers for resources that don't depend on the network agent type
/// (images, volumes) extract their substate directly via `FromRef`
/// rather than taking the whole `AppState<A>` and a spurious `A` generic.
impl<A: NetworkAgentClient + 'static> FromRef<AppState<A>> for ImageStore {
    fn from_ref(state: &AppState<A>) -> Self {
        state.images.clone()
    }
}

impl<A: NetworkAgentClient + 'static> FromRef<AppState<A>> for VolumeManager {
    fn from_ref(state: &AppState<A>) -> Self {
        state.volumes.clone()
    }
}

pub fn build_router<A: NetworkAgentClient + 'static>(state: AppState<A>) -> Router {
    let container_routes = Router::new()
        .route("/json", get(handlers::containers::list::<A>))
        .route("/create", post(handlers::containers::create::<A>))
        .route("/:id/json", get(handlers::containers::inspect::<A>))
        .route("/:id/start", post(handlers::containers::start::<A>))
        .route("/:id/stop", post(handlers::containers::stop::<A>))
        .route("/:id/restart", post(handlers::containers::restart::<A>))
        .route("/:id/kill", post(handlers::containers::kill::<A>))
        .route("/:id/pause", post(handlers::containers::pause::<A>))
        .route("/:id/unpause", post(handlers::containers::unpause::<A>))
        .route("/:id/wait", post(handlers::containers::wait::<A>))
        .route("/:id", delete(handlers::containers::remove::<A>))
        .route("/:id/logs", get(handlers::containers::logs::<A>))
        .route("/:id/attach", post(handlers::containers::attach::<A>))
        .route("/:id/exec", post(handlers::exec::create::<A>));

    let exec_routes = Router::new()
        .route("/:id/start", post(handlers::exec::start::<A>))
        .route("/:id/json", get(handlers::exec::inspect::<A>));

    let image_routes = Router::new()
        .route("/json", get(handlers::images::list))
        .route("/create", post(handlers::images::create))
        .route("/*name", get(handlers::images::inspect).delete(handlers::images::remove))
        .route("/:name/tag", post(handlers::images::tag));

    let network_routes = Router::new()
        .route("/", get(handlers::networks::list::<A>).post(handlers::networks::create::<A>))
        .route("/:id", get(handlers::networks::inspect::<A>).delete(handlers::networks::remove::<A>))
        .route("/:id/connect", post(handlers::networks::connect::<A>))
        .route("/:id/disconnect", post(handlers::networks::disconnect::<A>));

    let volume_routes = Router::new()
        .route("/", get(handlers::volumes::list))
        .route("/create", post(handlers::volumes::create))
        .route("/:name", get(handlers::volumes::inspect).delete(handlers::volumes::remove))
        .route("/prune", post(handlers::volumes::prune));

    let router = Router::new()
        .route("/_ping", get(handlers::system::ping))
        .route("/version", get(handlers::system::version))
        .route("/info", get(handlers::system::info::<A>))
        .route("/events", get(handlers::events::stream::<A>))
        .nest("/containers", container_routes)
        .nest("/exec", exec_routes)
        .nest("/images", image_routes)
        .nest("/networks", network_routes)
        .nest("/volumes", volume_routes)
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(normalize_api_version));

    router.with_state(state)
}
