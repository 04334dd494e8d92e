//! Version-prefix normalizer (spec.md §4.9, §6): `/vX.Y/containers/json`
//! and `/containers/json` must dispatch to the identical handler. Routes
//! are registered unprefixed; this middleware strips a leading
//! `/vMAJOR.MINOR` segment before the request reaches the router's match
//! step, the same `axum::middleware::from_fn` shape the teacher uses for
//! its auth layer in `router/middleware/auth.rs`, repurposed here since a
//! Unix socket's filesystem permissions are this daemon's auth boundary.

use axum::body::Body;
use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;

pub async fn normalize_api_version(mut request: Request<Body>, next: Next) -> Response {
    let path = request.uri().path();
    if let Some(stripped) = strip_version_prefix(path) {
        let mut parts = request.uri().clone().into_parts();
        let path_and_query = match request.uri().query() {
            Some(q) => format!("{}?{}", stripped, q),
            None => stripped.to_string(),
        };
        parts.path_and_query = Some(path_and_query.parse().expect("stripped path is valid"));
        *request.uri_mut() = axum::http::Uri::from_parts(parts).expect("valid uri parts");
    }
    next.run(request).await
}

/// Returns the path with a leading `/vMAJOR.MINOR` segment removed, or
/// `None` if the path doesn't start with one (nothing to normalize).
fn strip_version_prefix(path: &str) -> Option<String> {
    let rest = path.strip_prefix('/')?;
    let (first, remainder) = rest.split_once('/').unwrap_or((rest, ""));
    if !first.starts_with('v') {
        return None;
    }
    let version = &first[1..];
    let (major, minor) = version.split_once('.')?;
    if major.chars().all(|c| c.is_ascii_digit()) && minor.chars().all(|c| c.is_ascii_digit()) && !major.is_empty() {
        Some(format!("/{}", remainder))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_version_prefix() {
        assert_eq!(strip_version_prefix("/v1.51/containers/json").as_deref(), Some("/containers/json"));
        assert_eq!(strip_version_prefix("/v1.51/_ping").as_deref(), Some("/_ping"));
    }

    #[test]
    fn leaves_unprefixed_paths_alone() {
        assert_eq!(strip_version_prefix("/containers/json"), None);
        assert_eq!(strip_version_prefix("/volumes"), None);
    }

    #[test]
    fn does_not_mistake_a_container_name_for_a_version() {
        assert_eq!(strip_version_prefix("/vault-server/json"), None);
    }
}
