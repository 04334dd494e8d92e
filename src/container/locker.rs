//! Per-container operation lock (spec.md §5: "for a single container,
//! start/stop/remove are serialized"). A binary semaphore, one per
//! container id, grounded in the teacher's `system/locker.rs` power lock.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

#[derive(Debug, Error)]
pub enum LockerError {
    #[error("container is busy with another operation")]
    Busy,

    #[error("lock acquisition was cancelled")]
    Cancelled,
}

pub struct LockerGuard {
    _permit: OwnedSemaphorePermit,
}

/// One binary semaphore per container id, created lazily and never
/// removed (the entry is cheap and container ids aren't reused).
#[derive(Default)]
pub struct ContainerLockers {
    lockers: DashMap<String, Arc<Semaphore>>,
}

impl ContainerLockers {
    pub fn new() -> Self {
        Self::default()
    }

    fn semaphore_for(&self, container_id: &str) -> Arc<Semaphore> {
        self.lockers.entry(container_id.to_string()).or_insert_with(|| Arc::new(Semaphore::new(1))).clone()
    }

    /// Waits indefinitely for exclusive access to `container_id`.
    pub async fn acquire(&self, container_id: &str) -> Result<LockerGuard, LockerError> {
        let sem = self.semaphore_for(container_id);
        let permit = sem.acquire_owned().await.map_err(|_| LockerError::Cancelled)?;
        Ok(LockerGuard { _permit: permit })
    }

    /// Non-blocking: used by `kill`, which spec.md §4.6 says never waits
    /// for a grace period, including any in-flight operation's lock.
    pub fn try_acquire(&self, container_id: &str) -> Result<LockerGuard, LockerError> {
        let sem = self.semaphore_for(container_id);
        match sem.try_acquire_owned() {
            Ok(permit) => Ok(LockerGuard { _permit: permit }),
            Err(TryAcquireError::NoPermits) => Err(LockerError::Busy),
            Err(TryAcquireError::Closed) => Err(LockerError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serializes_operations_on_the_same_container() {
        let lockers = ContainerLockers::new();
        let guard = lockers.acquire("c1").await.unwrap();
        assert!(lockers.try_acquire("c1").is_err());
        drop(guard);
        assert!(lockers.try_acquire("c1").is_ok());
    }

    #[tokio::test]
    async fn different_containers_do_not_contend() {
        let lockers = ContainerLockers::new();
        let _g1 = lockers.acquire("c1").await.unwrap();
        assert!(lockers.try_acquire("c2").is_ok());
    }
}
