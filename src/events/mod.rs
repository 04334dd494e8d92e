//! Event plumbing: a per-container internal pub/sub bus for the Container
//! Manager's own monitor/attach consumers, and the daemon-global,
//! Docker-style `/events` bus subscribers actually see over the API.

mod bus;
mod global;

pub use bus::{ContainerEvent, ContainerEvents, ProcessState};
pub use global::{Actor, Event, EventBus, EventFilters, EventType};
