//! Container Manager (spec.md §4.6): lifecycle state machine, restart
//! policy, exec, and per-container locking, built on the State Store,
//! Runtime Adapter, Network Controller, and Image Store.

mod exec;
mod locker;
mod manager;
mod record;
pub mod restart;

pub use exec::{ExecConfig, ExecRecord, ExecStatus};
pub use locker::{ContainerLockers, LockerError, LockerGuard};
pub use manager::{ContainerManager, CreateRequest, ManagerError, ManagerResult};
pub use record::{
    Bind, ContainerConfig, ContainerRecord, ContainerState, ContainerStatus, HostConfig, LastAction,
    NetworkAttachmentConfig, PortBinding, ResourceRequest,
};
pub use restart::RestartPolicy;
