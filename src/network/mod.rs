//! Network Controller: owns logical networks, drives the (out-of-scope)
//! control-plane agent over vsock RPC, and brokers per-attachment packet
//! relay sessions between host and in-VM TAP.
//!
//! The agent itself is an external managed container reached over vsock;
//! this crate defines the RPC shape as a trait (`NetworkAgentClient`) and
//! ships an in-process `LoopbackAgent` double for tests and for the "nat"
//! backend, which skips the bridge agent entirely.

mod agent;
mod dns;
mod relay;

pub use agent::{AgentHealth, LoopbackAgent, NetworkAgentClient};
pub use dns::DnsPusher;
pub use relay::{RelayError, RelaySession};

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::ipam::{Ipam, IpamError};
use crate::store::{StateStore, StorageError};

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("no such network: {0}")]
    NotFound(String),

    #[error("network name already in use: {0}")]
    NameConflict(String),

    #[error(transparent)]
    Ipam(#[from] IpamError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("control-plane agent error: {0}")]
    Agent(String),

    #[error("packet relay error: {0}")]
    Relay(#[from] RelayError),
}

pub type NetworkResult<T> = Result<T, NetworkError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkDriver {
    BridgeLike,
    HostLike,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRecord {
    pub id: String,
    pub name: String,
    pub driver: NetworkDriver,
    pub subnet: Ipv4Addr,
    pub prefix_len: u8,
    pub gateway: Ipv4Addr,
    pub connected_containers: Vec<String>,
    /// Role label carried on the control-plane agent container itself
    /// (spec.md §4.5/§4.7); `None` for ordinary user networks.
    pub role: Option<String>,
}

fn network_key(id: &str) -> String {
    format!("network/{}", id)
}

/// One attachment's worth of state the Container Manager needs back:
/// the IP it was given and the vsock port its relay session runs on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub network_id: String,
    pub container_id: String,
    pub ipv4: Ipv4Addr,
    pub mac: String,
    pub aliases: Vec<String>,
    pub vsock_port: u32,
}

fn attachment_key(container_id: &str, network_id: &str) -> String {
    format!("attachment/{}/{}", container_id, network_id)
}

pub struct NetworkController<A: NetworkAgentClient> {
    store: StateStore,
    ipam: Arc<Ipam>,
    agent: A,
    dns: DnsPusher,
    relays: Mutex<HashMap<(String, String), RelaySession>>,
}

impl<A: NetworkAgentClient> NetworkController<A> {
    pub fn new(store: StateStore, ipam: Arc<Ipam>, agent: A) -> Self {
        Self::with_dns(store, ipam, agent, DnsPusher::new())
    }

    pub fn with_dns(store: StateStore, ipam: Arc<Ipam>, agent: A, dns: DnsPusher) -> Self {
        Self { store, ipam, agent, dns, relays: Mutex::new(HashMap::new()) }
    }

    pub async fn create_network(
        &self,
        id: String,
        name: String,
        driver: NetworkDriver,
        subnet: Ipv4Addr,
        prefix_len: u8,
        gateway: Ipv4Addr,
        role: Option<String>,
    ) -> NetworkResult<NetworkRecord> {
        let existing: Vec<NetworkRecord> = self.store.scan_json("network/").await?;
        if existing.iter().any(|n| n.name == name) {
            return Err(NetworkError::NameConflict(name));
        }

        self.agent
            .create_bridge(&id, subnet, prefix_len, gateway)
            .await
            .map_err(NetworkError::Agent)?;

        self.ipam.register_network(&id, subnet, prefix_len, gateway).await?;

        let record = NetworkRecord {
            id: id.clone(),
            name,
            driver,
            subnet,
            prefix_len,
            gateway,
            connected_containers: Vec::new(),
            role,
        };
        self.store.put_json(&network_key(&id), &record).await?;
        Ok(record)
    }

    pub async fn get(&self, id: &str) -> NetworkResult<NetworkRecord> {
        self.store
            .get_json(&network_key(id))
            .await?
            .ok_or_else(|| NetworkError::NotFound(id.to_string()))
    }

    pub async fn list(&self) -> NetworkResult<Vec<NetworkRecord>> {
        Ok(self.store.scan_json("network/").await?)
    }

    pub async fn remove_network(&self, id: &str) -> NetworkResult<()> {
        let record = self.get(id).await?;
        if !record.connected_containers.is_empty() {
            return Err(NetworkError::Agent(format!(
                "network {} still has connected containers",
                id
            )));
        }
        self.agent.delete_bridge(id).await.map_err(NetworkError::Agent)?;
        self.ipam.unregister_network(id).await?;
        self.store.delete(&network_key(id)).await?;
        Ok(())
    }

    /// Attach a container to a network: reserve an IP, pick a vsock port,
    /// ask the agent to open a bridge port, then stand up the relay.
    /// On any failure after IP reservation, the IP is released before
    /// returning the error so no partial attach survives.
    pub async fn attach(
        &self,
        network_id: &str,
        container_id: &str,
        mac: String,
        aliases: Vec<String>,
        ip_hint: Option<Ipv4Addr>,
    ) -> NetworkResult<Attachment> {
        let ipv4 = self.ipam.reserve(network_id, ip_hint).await?;
        let vsock_port = allocate_vsock_port(container_id, network_id);

        if let Err(e) =
            self.agent.attach_container(network_id, container_id, ipv4, &mac, vsock_port).await
        {
            let _ = self.ipam.release(network_id, ipv4).await;
            return Err(NetworkError::Agent(e));
        }

        let attachment = Attachment {
            network_id: network_id.to_string(),
            container_id: container_id.to_string(),
            ipv4,
            mac,
            aliases,
            vsock_port,
        };

        if let Err(e) = self.store.put_json(&attachment_key(container_id, network_id), &attachment).await
        {
            let _ = self.agent.detach_container(network_id, container_id).await;
            let _ = self.ipam.release(network_id, ipv4).await;
            return Err(e.into());
        }

        let session = RelaySession::spawn(vsock_port);
        self.relays.lock().await.insert((container_id.to_string(), network_id.to_string()), session);

        self.push_dns_for_network(network_id).await;
        Ok(attachment)
    }

    /// Detach is cooperative: the relay is cancelled, the agent port torn
    /// down, and the IP released, in that order, regardless of any
    /// individual step's failure (best-effort, matching spec.md §4.5).
    pub async fn detach(&self, network_id: &str, container_id: &str) -> NetworkResult<()> {
        if let Some(session) =
            self.relays.lock().await.remove(&(container_id.to_string(), network_id.to_string()))
        {
            session.cancel().await;
        }
        let _ = self.agent.detach_container(network_id, container_id).await;

        if let Some(attachment) =
            self.store.get_json::<Attachment>(&attachment_key(container_id, network_id)).await?
        {
            self.ipam.release(network_id, attachment.ipv4).await?;
        }
        self.store.delete(&attachment_key(container_id, network_id)).await?;
        self.dns.forget(container_id);

        self.push_dns_for_network(network_id).await;
        Ok(())
    }

    pub async fn attachments_for_container(&self, container_id: &str) -> NetworkResult<Vec<Attachment>> {
        Ok(self.store.scan_json(&format!("attachment/{}/", container_id)).await?)
    }

    /// Cross-network DNS propagation (spec.md §4.5): when a container
    /// joins (or leaves) network M, every container reachable from M
    /// within one network hop gets a fresh, complete view of every name it
    /// can resolve — not just M's own members. Concretely: the "affected"
    /// set is M's members plus every *other* network those members sit
    /// on, and each affected container's pushed snapshot is the union of
    /// every network *it* is attached to. This is symmetric (a container C
    /// on M always sees M's other members' other-network IPs, and those
    /// other containers always see C) and bounded by O(|attachments|²):
    /// one pass to find affected networks, one pass per affected
    /// container to build its snapshot.
    async fn push_dns_for_network(&self, network_id: &str) {
        let Ok(all): Result<Vec<Attachment>, _> = self.store.scan_json(&attachment_prefix_by_network()).await
        else {
            return;
        };

        let members_of_m: Vec<&Attachment> = all.iter().filter(|a| a.network_id == network_id).collect();
        if members_of_m.is_empty() {
            // Nothing left on M (e.g. the last detach) — nothing to propagate.
            return;
        }

        let mut affected_networks: std::collections::HashSet<&str> = std::collections::HashSet::new();
        affected_networks.insert(network_id);
        for m in &members_of_m {
            for a in all.iter().filter(|a| a.container_id == m.container_id) {
                affected_networks.insert(&a.network_id);
            }
        }

        let mut affected_containers: std::collections::HashSet<&str> = std::collections::HashSet::new();
        for a in all.iter().filter(|a| affected_networks.contains(a.network_id.as_str())) {
            affected_containers.insert(&a.container_id);
        }

        for container_id in affected_containers {
            let mut snapshot: HashMap<String, Ipv4Addr> = HashMap::new();
            let my_networks: Vec<&str> = all
                .iter()
                .filter(|a| a.container_id == container_id)
                .map(|a| a.network_id.as_str())
                .collect();
            for a in all.iter().filter(|a| my_networks.contains(&a.network_id.as_str())) {
                snapshot.insert(a.container_id.clone(), a.ipv4);
                for alias in &a.aliases {
                    snapshot.insert(alias.clone(), a.ipv4);
                }
            }
            self.dns.push_snapshot(container_id, &snapshot).await;
        }
    }

    pub async fn health(&self) -> NetworkResult<AgentHealth> {
        self.agent.health().await.map_err(NetworkError::Agent)
    }
}

/// All attachment records share the `attachment/` prefix; per-network
/// filtering happens in memory since the key is organized by container.
fn attachment_prefix_by_network() -> String {
    "attachment/".to_string()
}

/// Deterministic per-(container, network) vsock port in the ephemeral
/// range, derived rather than allocated from a shared counter so restarts
/// don't need to persist a cursor.
fn allocate_vsock_port(container_id: &str, network_id: &str) -> u32 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    container_id.hash(&mut hasher);
    network_id.hash(&mut hasher);
    let h = hasher.finish();
    1024 + (h % (u16::MAX as u64 - 1024))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_attach_detach_roundtrip() {
        let store = StateStore::open_in_memory().unwrap();
        let ipam = Arc::new(Ipam::new(store.clone()));
        let controller = NetworkController::new(store, ipam, LoopbackAgent::new());

        let record = controller
            .create_network(
                "net1".into(),
                "bridge0".into(),
                NetworkDriver::BridgeLike,
                "10.2.0.0".parse().unwrap(),
                24,
                "10.2.0.1".parse().unwrap(),
                None,
            )
            .await
            .unwrap();
        assert_eq!(record.name, "bridge0");

        let attachment = controller
            .attach("net1", "container1", "02:00:00:00:00:01".into(), vec!["web".into()], None)
            .await
            .unwrap();
        assert_ne!(attachment.ipv4, record.gateway);

        controller.detach("net1", "container1").await.unwrap();
        let remaining = controller.attachments_for_container("container1").await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn duplicate_network_name_conflicts() {
        let store = StateStore::open_in_memory().unwrap();
        let ipam = Arc::new(Ipam::new(store.clone()));
        let controller = NetworkController::new(store, ipam, LoopbackAgent::new());

        controller
            .create_network(
                "net1".into(),
                "bridge0".into(),
                NetworkDriver::BridgeLike,
                "10.3.0.0".parse().unwrap(),
                24,
                "10.3.0.1".parse().unwrap(),
                None,
            )
            .await
            .unwrap();

        let second = controller
            .create_network(
                "net2".into(),
                "bridge0".into(),
                NetworkDriver::BridgeLike,
                "10.4.0.0".parse().unwrap(),
                24,
                "10.4.0.1".parse().unwrap(),
                None,
            )
            .await;
        assert!(matches!(second, Err(NetworkError::NameConflict(_))));
    }

    #[tokio::test]
    async fn cross_network_connect_propagates_dns_both_ways() {
        use dns::DnsPushTransport;
        use std::collections::HashMap as StdHashMap;
        use tokio::sync::Mutex as TokioMutex;

        struct RecordingTransport {
            pushes: Arc<TokioMutex<StdHashMap<String, HashMap<String, Ipv4Addr>>>>,
        }

        #[async_trait::async_trait]
        impl DnsPushTransport for RecordingTransport {
            async fn push(
                &self,
                container_id: &str,
                snapshot: &HashMap<String, Ipv4Addr>,
            ) -> Result<(), String> {
                self.pushes.lock().await.insert(container_id.to_string(), snapshot.clone());
                Ok(())
            }
        }

        let pushes = Arc::new(TokioMutex::new(StdHashMap::new()));
        let transport = Arc::new(RecordingTransport { pushes: pushes.clone() });

        let store = StateStore::open_in_memory().unwrap();
        let ipam = Arc::new(Ipam::new(store.clone()));
        let controller = NetworkController::with_dns(
            store,
            ipam,
            LoopbackAgent::new(),
            DnsPusher::with_transport(transport),
        );

        controller
            .create_network(
                "web".into(),
                "web".into(),
                NetworkDriver::BridgeLike,
                "10.1.0.0".parse().unwrap(),
                24,
                "10.1.0.1".parse().unwrap(),
                None,
            )
            .await
            .unwrap();
        controller
            .create_network(
                "db".into(),
                "db".into(),
                NetworkDriver::BridgeLike,
                "10.2.0.0".parse().unwrap(),
                24,
                "10.2.0.1".parse().unwrap(),
                None,
            )
            .await
            .unwrap();

        controller.attach("web", "app", "02:00:00:00:00:01".into(), vec![], None).await.unwrap();
        controller.attach("db", "dbserver", "02:00:00:00:00:02".into(), vec![], None).await.unwrap();

        // "app" joins "db" too: it should now see "dbserver", and
        // "dbserver" should be pushed a snapshot that includes "app".
        controller.attach("db", "app", "02:00:00:00:00:03".into(), vec![], None).await.unwrap();

        let snapshots = pushes.lock().await;
        let app_view = snapshots.get("app").expect("app should have received a push");
        assert!(app_view.contains_key("dbserver"));

        let dbserver_view = snapshots.get("dbserver").expect("dbserver should have received a push");
        assert!(dbserver_view.contains_key("app"));
    }
}
