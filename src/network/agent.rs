//! Control-plane agent RPC: {create-bridge, delete-bridge, attach-container,
//! detach-container, list-bridges, health}. The real agent is a managed
//! container reached over vsock and is out of scope for this crate; what
//! lives here is the RPC contract and an in-process double that makes the
//! "nat" backend and the test suite work without one.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Default)]
pub struct AgentHealth {
    pub healthy: bool,
    pub subsystems: HashMap<String, String>,
}

#[async_trait]
pub trait NetworkAgentClient: Send + Sync {
    async fn create_bridge(
        &self,
        network_id: &str,
        subnet: Ipv4Addr,
        prefix_len: u8,
        gateway: Ipv4Addr,
    ) -> Result<String, String>;

    async fn delete_bridge(&self, network_id: &str) -> Result<(), String>;

    async fn attach_container(
        &self,
        network_id: &str,
        container_id: &str,
        ip: Ipv4Addr,
        mac: &str,
        vsock_port: u32,
    ) -> Result<String, String>;

    async fn detach_container(&self, network_id: &str, container_id: &str) -> Result<(), String>;

    async fn list_bridges(&self) -> Result<Vec<String>, String>;

    async fn health(&self) -> Result<AgentHealth, String>;
}

/// In-process stand-in for the real agent. Tracks bridges and port names
/// in memory; used by the "nat" backend (spec.md §9's pluggability note)
/// and by the Network Controller's own test suite.
pub struct LoopbackAgent {
    bridges: Mutex<HashMap<String, String>>,
    ports: Mutex<HashMap<(String, String), String>>,
}

impl LoopbackAgent {
    pub fn new() -> Self {
        Self { bridges: Mutex::new(HashMap::new()), ports: Mutex::new(HashMap::new()) }
    }
}

impl Default for LoopbackAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkAgentClient for LoopbackAgent {
    async fn create_bridge(
        &self,
        network_id: &str,
        _subnet: Ipv4Addr,
        _prefix_len: u8,
        _gateway: Ipv4Addr,
    ) -> Result<String, String> {
        let bridge_name = format!("arca-br-{}", &network_id[..network_id.len().min(8)]);
        self.bridges.lock().await.insert(network_id.to_string(), bridge_name.clone());
        Ok(bridge_name)
    }

    async fn delete_bridge(&self, network_id: &str) -> Result<(), String> {
        self.bridges.lock().await.remove(network_id);
        Ok(())
    }

    async fn attach_container(
        &self,
        network_id: &str,
        container_id: &str,
        _ip: Ipv4Addr,
        _mac: &str,
        vsock_port: u32,
    ) -> Result<String, String> {
        let port_name = format!("veth{}", vsock_port);
        self.ports
            .lock()
            .await
            .insert((network_id.to_string(), container_id.to_string()), port_name.clone());
        Ok(port_name)
    }

    async fn detach_container(&self, network_id: &str, container_id: &str) -> Result<(), String> {
        self.ports.lock().await.remove(&(network_id.to_string(), container_id.to_string()));
        Ok(())
    }

    async fn list_bridges(&self) -> Result<Vec<String>, String> {
        Ok(self.bridges.lock().await.values().cloned().collect())
    }

    async fn health(&self) -> Result<AgentHealth, String> {
        let mut subsystems = HashMap::new();
        subsystems.insert("agent".to_string(), "ok".to_string());
        Ok(AgentHealth { healthy: true, subsystems })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_delete_bridge() {
        let agent = LoopbackAgent::new();
        agent
            .create_bridge("net1", "10.0.0.0".parse().unwrap(), 24, "10.0.0.1".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(agent.list_bridges().await.unwrap().len(), 1);
        agent.delete_bridge("net1").await.unwrap();
        assert!(agent.list_bridges().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn health_reports_healthy() {
        let agent = LoopbackAgent::new();
        let health = agent.health().await.unwrap();
        assert!(health.healthy);
    }
}
