//! Per-network IP address allocator.
//!
//! One free-address set per network, rebuilt from the State Store's
//! persisted allocation records on daemon boot. Mutations are serialized
//! per network (a `tokio::sync::Mutex` per entry, mirroring the teacher's
//! per-container `Locker` pattern in `system/locker.rs`) and are recorded
//! in the State Store before the in-memory set is updated, so a crash
//! between the two never leaves IPAM more permissive than the durable
//! record.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::store::{StateStore, StorageError};

#[derive(Debug, Error)]
pub enum IpamError {
    #[error("address pool exhausted")]
    Exhausted,

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("{0}")]
    NotFound(String),
}

pub type IpamResult<T> = Result<T, IpamError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Allocation {
    network_id: String,
    ipv4: u32,
}

fn alloc_key(network_id: &str, ipv4: u32) -> String {
    format!("ipam/{}/{}", network_id, ipv4)
}

fn alloc_prefix(network_id: &str) -> String {
    format!("ipam/{}/", network_id)
}

struct NetworkPool {
    free: BTreeSet<u32>,
}

/// Allocator across all networks. Each network gets its own lock so
/// concurrent attach/detach on different networks never contend.
pub struct Ipam {
    store: StateStore,
    pools: DashMap<String, Mutex<NetworkPool>>,
}

impl Ipam {
    pub fn new(store: StateStore) -> Self {
        Self { store, pools: DashMap::new() }
    }

    /// Register a network's subnet, excluding the network address,
    /// broadcast address, and gateway from the free pool. Safe to call
    /// again after a restart: it rebuilds the free set from persisted
    /// allocations rather than assuming an empty pool.
    pub async fn register_network(
        &self,
        network_id: &str,
        subnet: Ipv4Addr,
        prefix_len: u8,
        gateway: Ipv4Addr,
    ) -> IpamResult<()> {
        let (lo, hi) = host_range(subnet, prefix_len);
        let mut free: BTreeSet<u32> = (lo..=hi).collect();

        let existing: Vec<Allocation> = self
            .store
            .scan_json(&alloc_prefix(network_id))
            .await?;
        for a in &existing {
            free.remove(&a.ipv4);
        }
        free.remove(&u32::from(gateway));
        if !existing.iter().any(|a| a.ipv4 == u32::from(gateway)) {
            self.store
                .put_json(&alloc_key(network_id, u32::from(gateway)), &Allocation {
                    network_id: network_id.to_string(),
                    ipv4: u32::from(gateway),
                })
                .await?;
        }

        self.pools.insert(network_id.to_string(), Mutex::new(NetworkPool { free }));
        Ok(())
    }

    pub async fn unregister_network(&self, network_id: &str) -> IpamResult<()> {
        let rows = self.store.scan(&alloc_prefix(network_id)).await?;
        for (key, _) in rows {
            self.store.delete(&key).await?;
        }
        self.pools.remove(network_id);
        Ok(())
    }

    /// Reserve an address. `hint`, if present and free, is used; otherwise
    /// the lowest free host address is picked deterministically.
    pub async fn reserve(&self, network_id: &str, hint: Option<Ipv4Addr>) -> IpamResult<Ipv4Addr> {
        let pool = self
            .pools
            .get(network_id)
            .ok_or_else(|| IpamError::NotFound(format!("no such network: {}", network_id)))?;
        let mut guard = pool.lock().await;

        let chosen = if let Some(hint) = hint {
            let raw = u32::from(hint);
            if guard.free.contains(&raw) {
                Some(raw)
            } else {
                None
            }
        } else {
            None
        };

        let chosen = match chosen {
            Some(v) => v,
            None => *guard.free.iter().next().ok_or(IpamError::Exhausted)?,
        };

        self.store
            .put_json(&alloc_key(network_id, chosen), &Allocation {
                network_id: network_id.to_string(),
                ipv4: chosen,
            })
            .await?;
        guard.free.remove(&chosen);

        Ok(Ipv4Addr::from(chosen))
    }

    /// Idempotent: releasing an address that isn't reserved is a no-op.
    pub async fn release(&self, network_id: &str, ipv4: Ipv4Addr) -> IpamResult<()> {
        let raw = u32::from(ipv4);
        self.store.delete(&alloc_key(network_id, raw)).await?;

        if let Some(pool) = self.pools.get(network_id) {
            pool.lock().await.free.insert(raw);
        }
        Ok(())
    }

    pub async fn allocations(&self, network_id: &str) -> IpamResult<Vec<Ipv4Addr>> {
        let rows: Vec<Allocation> = self.store.scan_json(&alloc_prefix(network_id)).await?;
        Ok(rows.into_iter().map(|a| Ipv4Addr::from(a.ipv4)).collect())
    }
}

/// Host-address range [network+1, broadcast-1] as u32, excluding network
/// and broadcast addresses so callers never hand those out.
fn host_range(subnet: Ipv4Addr, prefix_len: u8) -> (u32, u32) {
    let mask: u32 = if prefix_len == 0 { 0 } else { !0u32 << (32 - prefix_len) };
    let network = u32::from(subnet) & mask;
    let broadcast = network | !mask;
    (network + 1, broadcast.saturating_sub(1).max(network + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reserve_lowest_free_and_excludes_gateway() {
        let store = StateStore::open_in_memory().unwrap();
        let ipam = Ipam::new(store);
        ipam.register_network("net1", "10.1.0.0".parse().unwrap(), 24, "10.1.0.1".parse().unwrap())
            .await
            .unwrap();

        let a = ipam.reserve("net1", None).await.unwrap();
        assert_eq!(a, "10.1.0.2".parse::<Ipv4Addr>().unwrap());

        let b = ipam.reserve("net1", None).await.unwrap();
        assert_eq!(b, "10.1.0.3".parse::<Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        let ipam = Ipam::new(store);
        ipam.register_network("net1", "10.1.0.0".parse().unwrap(), 30, "10.1.0.1".parse().unwrap())
            .await
            .unwrap();

        let a = ipam.reserve("net1", None).await.unwrap();
        ipam.release("net1", a).await.unwrap();
        ipam.release("net1", a).await.unwrap();

        let a2 = ipam.reserve("net1", None).await.unwrap();
        assert_eq!(a, a2);
    }

    #[tokio::test]
    async fn exhaustion_never_duplicates() {
        let store = StateStore::open_in_memory().unwrap();
        let ipam = Ipam::new(store);
        // /30 subnet: network.0, gateway.1, broadcast.3 -> one host address (.2) free.
        ipam.register_network("net1", "10.1.0.0".parse().unwrap(), 30, "10.1.0.1".parse().unwrap())
            .await
            .unwrap();

        let _first = ipam.reserve("net1", None).await.unwrap();
        let second = ipam.reserve("net1", None).await;
        assert!(matches!(second, Err(IpamError::Exhausted)));
    }
}
