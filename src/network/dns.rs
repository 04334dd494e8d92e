//! Embedded in-container DNS: idempotent full-snapshot pushes of
//! name→ip mappings to each container's local resolver (127.0.0.11:53).
//!
//! The resolver itself and the RPC transport that reaches it live inside
//! the in-VM init agent (spec.md §1, out of scope). What this module owns
//! is the push side: serializing concurrent pushes per container so the
//! last snapshot always wins, and treating transport failure as
//! best-effort (spec.md §4.5 — a failed push never blocks a lifecycle
//! transition).

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::warn;

/// The RPC boundary to the in-VM DNS relay. Out of scope per spec.md §1;
/// a real implementation dials the container's vsock DNS-push port
/// through the Runtime Adapter. `LoggingTransport` stands in for tests
/// and for backends (e.g. "nat", spec.md §9) that skip the agent.
#[async_trait::async_trait]
pub trait DnsPushTransport: Send + Sync {
    async fn push(&self, container_id: &str, snapshot: &HashMap<String, Ipv4Addr>) -> Result<(), String>;
}

pub struct LoggingTransport;

#[async_trait::async_trait]
impl DnsPushTransport for LoggingTransport {
    async fn push(&self, container_id: &str, snapshot: &HashMap<String, Ipv4Addr>) -> Result<(), String> {
        tracing::debug!(container_id, entries = snapshot.len(), "dns snapshot push (no-op transport)");
        Ok(())
    }
}

/// Per-container serialized pusher. Holding a lock per container (rather
/// than one global lock) lets pushes to unrelated containers proceed
/// concurrently, matching spec.md §5's "DNS pushes per container are
/// serialized; the last-writer wins" ordering guarantee.
pub struct DnsPusher {
    transport: Arc<dyn DnsPushTransport>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl DnsPusher {
    pub fn new() -> Self {
        Self::with_transport(Arc::new(LoggingTransport))
    }

    pub fn with_transport(transport: Arc<dyn DnsPushTransport>) -> Self {
        Self { transport, locks: DashMap::new() }
    }

    /// Push a full snapshot to one container. Best-effort: failures are
    /// logged, never propagated, since a DNS push never blocks lifecycle.
    pub async fn push_snapshot(&self, container_id: &str, snapshot: &HashMap<String, Ipv4Addr>) {
        let lock = self
            .locks
            .entry(container_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Err(e) = self.transport.push(container_id, snapshot).await {
            warn!(container_id, error = %e, "dns snapshot push failed (best-effort, continuing)");
        }
    }

    pub fn forget(&self, container_id: &str) {
        self.locks.remove(container_id);
    }
}

impl Default for DnsPusher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as TokioMutex;

    struct RecordingTransport {
        calls: Arc<TokioMutex<Vec<String>>>,
    }

    #[async_trait::async_trait]
    impl DnsPushTransport for RecordingTransport {
        async fn push(&self, container_id: &str, _snapshot: &HashMap<String, Ipv4Addr>) -> Result<(), String> {
            self.calls.lock().await.push(container_id.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn push_reaches_transport() {
        let calls = Arc::new(TokioMutex::new(Vec::new()));
        let pusher = DnsPusher::with_transport(Arc::new(RecordingTransport { calls: calls.clone() }));

        let mut snapshot = HashMap::new();
        snapshot.insert("web".to_string(), "10.0.0.2".parse().unwrap());
        pusher.push_snapshot("container1", &snapshot).await;

        assert_eq!(*calls.lock().await, vec!["container1".to_string()]);
    }

    struct FailingTransport;

    #[async_trait::async_trait]
    impl DnsPushTransport for FailingTransport {
        async fn push(&self, _container_id: &str, _snapshot: &HashMap<String, Ipv4Addr>) -> Result<(), String> {
            Err("unreachable".to_string())
        }
    }

    #[tokio::test]
    async fn failed_push_does_not_panic_or_propagate() {
        let pusher = DnsPusher::with_transport(Arc::new(FailingTransport));
        pusher.push_snapshot("container1", &HashMap::new()).await;
    }
}
