//! Container Manager (spec.md §4.6): the lifecycle state machine,
//! restart-policy engine, crash recovery, and monitor tasks. Directly
//! grounded in the teacher's `server/server.rs` (per-instance power
//! operations) and `server/manager.rs` (the collection type), generalized
//! from "one game server process" to "one VM-backed container with
//! network attachments and a restart policy".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::events::{ContainerEvents, Event, EventBus, EventType, ProcessState};
use crate::image::{ImageError, ImageStore};
use crate::network::{NetworkAgentClient, NetworkController, NetworkError};
use crate::runtime::{MountSpec, ResourceLimits, RuntimeAdapter, RuntimeError, VmSpec, WaitResult};
use crate::store::{StateStore, StorageError};
use crate::volume::{VolumeDriver, VolumeManager};

use super::exec::{exec_key, ExecConfig, ExecRecord, ExecStatus};
use super::locker::{ContainerLockers, LockerError};
use super::record::{
    container_key, name_key, Bind, ContainerConfig, ContainerRecord, ContainerState, ContainerStatus,
    HostConfig, LastAction, NetworkAttachmentConfig,
};
use super::restart::{backoff_delay, should_restart, ExitReason};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("no such container: {0}")]
    NotFound(String),

    #[error("container name already in use: {0}")]
    NameConflict(String),

    #[error("container {0} is running; stop it first or pass force")]
    Conflict(String),

    #[error("{0}")]
    Busy(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error(transparent)]
    Volume(#[from] crate::volume::VolumeError),
}

pub type ManagerResult<T> = Result<T, ManagerError>;

impl From<LockerError> for ManagerError {
    fn from(e: LockerError) -> Self {
        ManagerError::Busy(e.to_string())
    }
}

/// Spec for `create`: the Docker-shaped request already decoded by the
/// router, with names resolved but nothing else touched yet.
pub struct CreateRequest {
    pub name: Option<String>,
    pub config: ContainerConfig,
    pub host_config: HostConfig,
    pub networks: Vec<NetworkAttachmentConfig>,
}

pub struct ContainerManager<A: NetworkAgentClient> {
    store: StateStore,
    runtime: Arc<dyn RuntimeAdapter>,
    network: Arc<NetworkController<A>>,
    images: ImageStore,
    volumes: VolumeManager,
    events: Arc<EventBus>,
    lockers: ContainerLockers,
    /// Per-container internal pub/sub for live log/attach consumers,
    /// distinct from the global Docker-style `events` bus above.
    console: dashmap::DashMap<String, Arc<ContainerEvents>>,
}

impl<A: NetworkAgentClient + 'static> ContainerManager<A> {
    pub fn new(
        store: StateStore,
        runtime: Arc<dyn RuntimeAdapter>,
        network: Arc<NetworkController<A>>,
        images: ImageStore,
        volumes: VolumeManager,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            runtime,
            network,
            images,
            volumes,
            events,
            lockers: ContainerLockers::new(),
            console: dashmap::DashMap::new(),
        }
    }

    /// Exposed so a sibling component (the Build Manager launches its
    /// daemon container through `create`/`start`, but still needs to pull
    /// its own image first) can share this manager's Image Store handle.
    pub fn images(&self) -> &ImageStore {
        &self.images
    }

    fn console_bus(&self, id: &str) -> Arc<ContainerEvents> {
        self.console.entry(id.to_string()).or_insert_with(|| Arc::new(ContainerEvents::new())).clone()
    }

    pub fn console_bus_for(&self, id: &str) -> Arc<ContainerEvents> {
        self.console_bus(id)
    }

    fn emit(&self, event_type: EventType, action: &str, id: &str, attrs: &[(&str, &str)]) {
        let mut event = Event::new(event_type, action.to_string(), id.to_string());
        for (k, v) in attrs {
            event = event.with_attribute(*k, *v);
        }
        self.events.publish(event);
    }

    pub async fn list(&self, all: bool) -> ManagerResult<Vec<ContainerRecord>> {
        let mut records: Vec<ContainerRecord> = self.store.scan_json("container/").await?;
        if !all {
            records.retain(|r| !matches!(r.state.status, ContainerStatus::Exited | ContainerStatus::Dead));
        }
        Ok(records)
    }

    /// Resolves an id prefix or a `/name` to a full record. Docker accepts
    /// both everywhere a container is named on the wire.
    pub async fn resolve(&self, id_or_name: &str) -> ManagerResult<ContainerRecord> {
        if let Some(id) = self.store.get_json::<String>(&name_key(id_or_name)).await? {
            if let Some(record) = self.store.get_json::<ContainerRecord>(&container_key(&id)).await? {
                return Ok(record);
            }
        }
        if let Some(record) = self.store.get_json::<ContainerRecord>(&container_key(id_or_name)).await? {
            return Ok(record);
        }
        let all: Vec<ContainerRecord> = self.store.scan_json("container/").await?;
        all.into_iter()
            .find(|r| r.id.starts_with(id_or_name))
            .ok_or_else(|| ManagerError::NotFound(id_or_name.to_string()))
    }

    async fn persist(&self, record: &ContainerRecord) -> ManagerResult<()> {
        self.store.put_json(&container_key(&record.id), record).await?;
        Ok(())
    }

    /// `create` never starts the container (spec.md §4.6).
    pub async fn create(&self, req: CreateRequest) -> ManagerResult<ContainerRecord> {
        let name = req.name.unwrap_or_else(|| format!("/{}", petname()));
        let name = if name.starts_with('/') { name } else { format!("/{}", name) };

        if self.store.get(&name_key(&name)).await?.is_some() {
            return Err(ManagerError::NameConflict(name));
        }

        let image = self.images.inspect(&req.config.image).await?;

        let id = new_container_id();
        let record = ContainerRecord {
            id: id.clone(),
            names: vec![name.clone()],
            image_ref: req.config.image.clone(),
            image_digest: image.id.clone(),
            config: req.config,
            host_config: req.host_config,
            networks: req.networks,
            state: ContainerState::default(),
            monitor_generation: 0,
            last_action: LastAction::None,
            created_at: chrono::Utc::now().timestamp(),
        };

        self.persist(&record).await?;
        self.store.put_json(&name_key(&name), &id).await?;

        // Volume refcounts are bumped at create, not start (spec.md §3):
        // a created-but-never-started container still holds its volumes.
        for volume in &record.host_config.volumes {
            self.volumes.create(volume, VolumeDriver::Files, HashMap::new()).await?;
            self.volumes.acquire(volume).await?;
        }

        self.emit(EventType::Container, "create", &id, &[("image", &record.image_ref), ("name", &name)]);
        info!(container_id = %id, name, "container created");
        Ok(record)
    }

    /// `start` is idempotent on an already-running container (spec.md §8:
    /// returns 304, the router maps `AlreadyRunning` to that).
    pub async fn start(self: &Arc<Self>, id_or_name: &str) -> ManagerResult<()> {
        let guard = self.lockers.acquire(id_or_name).await?;
        let mut record = self.resolve(id_or_name).await?;

        if record.state.status == ContainerStatus::Running {
            return Err(ManagerError::Conflict("already running".into()));
        }

        record.last_action = LastAction::UserStart;
        record.monitor_generation += 1;
        let generation = record.monitor_generation;

        if let Err(e) = self.attach_networks(&record).await {
            record.state.status = ContainerStatus::Created;
            record.state.error = Some(e.to_string());
            self.persist(&record).await?;
            return Err(e);
        }

        let vm_handle = match self.runtime.resolve(&record.id).await {
            Ok(handle) => handle,
            Err(RuntimeError::NotFound(_)) => self.recreate_vm(&record).await?,
            Err(e) => return Err(e.into()),
        };

        self.runtime.start(&vm_handle).await?;

        record.state.status = ContainerStatus::Running;
        record.state.started_at = Some(chrono::Utc::now().timestamp());
        record.state.finished_at = None;
        record.state.exit_code = None;
        record.state.error = None;
        self.persist(&record).await?;
        self.console_bus(&record.id).publish_state(ProcessState::Running);
        self.emit(EventType::Container, "start", &record.id, &[]);
        info!(container_id = %record.id, "container started");

        let this = self.clone();
        let container_id = record.id.clone();
        drop(guard);
        tokio::spawn(async move {
            this.run_monitor(container_id, vm_handle, generation).await;
        });

        Ok(())
    }

    async fn attach_networks(&self, record: &ContainerRecord) -> ManagerResult<()> {
        let mut attached = Vec::new();
        for net in &record.networks {
            let mac = random_mac();
            match self
                .network
                .attach(&net.network_id, &record.id, mac, net.aliases.clone(), net.ip_hint)
                .await
            {
                Ok(_) => attached.push(net.network_id.clone()),
                Err(e) => {
                    for network_id in attached {
                        let _ = self.network.detach(&network_id, &record.id).await;
                    }
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Rebuilds a runtime VM from the persisted spec + current image
    /// record — the same builder crash recovery and first-`start`-after-
    /// restart both use (spec.md §9).
    async fn recreate_vm(&self, record: &ContainerRecord) -> ManagerResult<crate::runtime::VmHandle> {
        let image = self.images.inspect(&record.image_ref).await?;

        let mounts = record
            .host_config
            .binds
            .iter()
            .map(|b: &Bind| MountSpec {
                source: b.host_path.clone(),
                target: b.container_path.clone(),
                read_only: b.read_only,
            })
            .collect();

        let env = record
            .config
            .env
            .iter()
            .filter_map(|kv| kv.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let limits = ResourceLimits {
            memory_bytes: record.host_config.resources.memory_bytes,
            memory_swap_bytes: record.host_config.resources.memory_swap_bytes,
            cpu_quota: record.host_config.resources.cpu_quota,
            cpu_period: record.host_config.resources.cpu_period,
            cpu_shares: record.host_config.resources.cpu_shares,
            pids_limit: record.host_config.resources.pids_limit,
        };

        let spec = VmSpec {
            docker_id: record.id.clone(),
            image_ref: image.id.clone(),
            cmd: record.config.cmd.clone(),
            env,
            mounts,
            working_dir: record.config.working_dir.clone(),
            tty: record.config.tty,
            open_stdin: record.config.open_stdin,
            hostname: record.config.hostname.clone(),
            labels: record.config.labels.clone(),
            limits,
        };

        Ok(self.runtime.create_vm(spec).await?)
    }

    /// Awaits the VM's exit, persists the result, and evaluates the
    /// restart policy. Discards its own write if a fresher generation has
    /// since started (spec.md §4.6's monitor-generation guard).
    async fn run_monitor(self: Arc<Self>, container_id: String, vm_handle: crate::runtime::VmHandle, generation: u64) {
        let wait_result = match self.runtime.wait(&vm_handle).await {
            Ok(r) => r,
            Err(e) => {
                warn!(container_id, error = %e, "monitor wait failed");
                WaitResult { exit_code: 137, signaled: true, oom_killed: false }
            }
        };

        self.finish_run(&container_id, generation, wait_result, ExitReason::ProcessExited).await;
    }

    async fn finish_run(
        self: &Arc<Self>,
        container_id: &str,
        generation: u64,
        wait_result: WaitResult,
        default_reason: ExitReason,
    ) {
        let Ok(mut record) = self.resolve(container_id).await else { return };
        if record.monitor_generation != generation {
            debug!(container_id, generation, current = record.monitor_generation, "stale monitor generation, discarding");
            return;
        }

        record.state.status = ContainerStatus::Exited;
        record.state.exit_code = Some(wait_result.exit_code);
        record.state.finished_at = Some(chrono::Utc::now().timestamp());
        record.state.oom_killed = wait_result.oom_killed;
        let _ = self.persist(&record).await;
        self.console_bus(container_id).publish_state(ProcessState::Offline);
        self.emit(
            EventType::Container,
            "die",
            container_id,
            &[("exitCode", &wait_result.exit_code.to_string())],
        );
        info!(container_id, exit_code = wait_result.exit_code, "container exited");

        let reason = if record.last_action == LastAction::UserStop { ExitReason::UserStopped } else { default_reason };

        if should_restart(record.host_config.restart_policy, wait_result.exit_code, reason, record.state.restart_count) {
            record.state.restart_count += 1;
            let attempt = record.state.restart_count;
            let _ = self.persist(&record).await;

            let this = self.clone();
            let id = container_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(backoff_delay(attempt)).await;
                if let Err(e) = this.start(&id).await {
                    warn!(container_id = %id, error = %e, "restart-policy start failed");
                }
            });
        }
    }

    /// SIGTERM, wait up to `grace_timeout_secs`, then SIGKILL. Idempotent
    /// on an already-exited container.
    pub async fn stop(&self, id_or_name: &str, grace_timeout_secs: u64) -> ManagerResult<()> {
        let _guard = self.lockers.acquire(id_or_name).await?;
        let mut record = self.resolve(id_or_name).await?;

        if record.state.status != ContainerStatus::Running && record.state.status != ContainerStatus::Paused {
            return Err(ManagerError::Conflict("not running".into()));
        }

        record.last_action = LastAction::UserStop;
        self.persist(&record).await?;

        let vm_handle = self.runtime.resolve(&record.id).await?;
        self.runtime.stop(&vm_handle, grace_timeout_secs).await?;
        self.emit(EventType::Container, "stop", &record.id, &[]);
        Ok(())
    }

    /// Immediate SIGKILL (or the given signal); no grace period, and
    /// never waits on a busy per-container lock (spec.md §4.6).
    pub async fn kill(&self, id_or_name: &str, signal: &str) -> ManagerResult<()> {
        let _guard = self.lockers.try_acquire(id_or_name)?;
        let record = self.resolve(id_or_name).await?;
        let vm_handle = self.runtime.resolve(&record.id).await?;
        self.runtime.kill(&vm_handle, signal).await?;
        self.emit(EventType::Container, "kill", &record.id, &[("signal", signal)]);
        Ok(())
    }

    pub async fn pause(&self, id_or_name: &str) -> ManagerResult<()> {
        let _guard = self.lockers.acquire(id_or_name).await?;
        let mut record = self.resolve(id_or_name).await?;
        if record.state.status != ContainerStatus::Running {
            return Err(ManagerError::Conflict("not running".into()));
        }
        record.state.status = ContainerStatus::Paused;
        self.persist(&record).await?;
        self.emit(EventType::Container, "pause", &record.id, &[]);
        Ok(())
    }

    pub async fn unpause(&self, id_or_name: &str) -> ManagerResult<()> {
        let _guard = self.lockers.acquire(id_or_name).await?;
        let mut record = self.resolve(id_or_name).await?;
        if record.state.status != ContainerStatus::Paused {
            return Err(ManagerError::Conflict("not paused".into()));
        }
        record.state.status = ContainerStatus::Running;
        self.persist(&record).await?;
        self.emit(EventType::Container, "unpause", &record.id, &[]);
        Ok(())
    }

    /// Blocks until the container reaches a terminal state, returning its
    /// exit code. Returns immediately if it's already exited.
    pub async fn wait(&self, id_or_name: &str) -> ManagerResult<i64> {
        let record = self.resolve(id_or_name).await?;
        if record.state.status == ContainerStatus::Exited {
            return Ok(record.state.exit_code.unwrap_or(0));
        }

        let bus = self.console_bus(&record.id);
        let mut rx = bus.subscribe();
        loop {
            let record = self.resolve(&record.id).await?;
            if record.state.status == ContainerStatus::Exited {
                return Ok(record.state.exit_code.unwrap_or(0));
            }
            match rx.recv().await {
                Ok(_) => continue,
                Err(_) => {
                    // Lagged or bus closed; poll the record once more
                    // before giving up.
                    let record = self.resolve(&record.id).await?;
                    return Ok(record.state.exit_code.unwrap_or(0));
                }
            }
        }
    }

    /// Refuses a running container unless `force`; otherwise stops it
    /// first. Releases network attachments and deletes execs before the
    /// record itself.
    pub async fn remove(&self, id_or_name: &str, force: bool) -> ManagerResult<()> {
        let _guard = self.lockers.acquire(id_or_name).await?;
        let record = self.resolve(id_or_name).await?;

        if record.is_running_like() {
            if !force {
                return Err(ManagerError::Conflict(record.id.clone()));
            }
            if let Ok(handle) = self.runtime.resolve(&record.id).await {
                let _ = self.runtime.stop(&handle, 5).await;
            }
        }

        for net in &record.networks {
            let _ = self.network.detach(&net.network_id, &record.id).await;
        }

        for volume in &record.host_config.volumes {
            let _ = self.volumes.release(volume).await;
        }

        let execs: Vec<ExecRecord> = self.store.scan_json("exec/").await?;
        for exec in execs.into_iter().filter(|e| e.container_id == record.id) {
            self.store.delete(&exec_key(&exec.id)).await?;
        }

        if let Ok(handle) = self.runtime.resolve(&record.id).await {
            let _ = self.runtime.destroy(&handle).await;
        }

        self.store.delete(&container_key(&record.id)).await?;
        for name in &record.names {
            self.store.delete(&name_key(name)).await?;
        }
        self.console.remove(&record.id);
        self.emit(EventType::Container, "destroy", &record.id, &[]);
        info!(container_id = %record.id, force, "container removed");
        Ok(())
    }

    pub async fn create_exec(&self, id_or_name: &str, config: ExecConfig) -> ManagerResult<ExecRecord> {
        let record = self.resolve(id_or_name).await?;
        if record.state.status != ContainerStatus::Running {
            return Err(ManagerError::Conflict("container is not running".into()));
        }
        let exec = ExecRecord { id: new_exec_id(), container_id: record.id.clone(), config, status: ExecStatus::Created, exit_code: None };
        self.store.put_json(&exec_key(&exec.id), &exec).await?;
        Ok(exec)
    }

    pub async fn get_exec(&self, exec_id: &str) -> ManagerResult<ExecRecord> {
        self.store.get_json(&exec_key(exec_id)).await?.ok_or_else(|| ManagerError::NotFound(exec_id.to_string()))
    }

    /// Opens stdio over the Runtime Adapter's vsock stand-in and records
    /// the exit code when the command completes.
    pub async fn start_exec(&self, exec_id: &str) -> ManagerResult<Box<dyn crate::runtime::DuplexStream>> {
        let mut exec = self.get_exec(exec_id).await?;
        let record = self.resolve(&exec.container_id).await?;
        let vm_handle = self.runtime.resolve(&record.id).await?;

        exec.status = ExecStatus::Running;
        self.store.put_json(&exec_key(&exec.id), &exec).await?;

        let stream = self.runtime.dial_vsock(&vm_handle, exec_vsock_port(exec_id), exec.config.cmd.clone()).await?;

        exec.status = ExecStatus::Exited;
        exec.exit_code = Some(0);
        self.store.put_json(&exec_key(&exec.id), &exec).await?;

        Ok(stream)
    }

    /// Opens this container's stdio stream for `attach`/interactive logs.
    pub async fn attach_stdio(
        &self,
        id_or_name: &str,
    ) -> ManagerResult<(Box<dyn tokio::io::AsyncWrite + Send + Unpin>, Box<dyn tokio::io::AsyncRead + Send + Unpin>)> {
        let record = self.resolve(id_or_name).await?;
        let vm_handle = self.runtime.resolve(&record.id).await?;
        Ok(self.runtime.attach_stdio(&vm_handle).await?)
    }

    /// Daemon-boot reconciliation (spec.md §4.6 Crash recovery): every
    /// record left in {running, paused, restarting} either rebinds to a
    /// live runtime handle or is marked exited with code 137, then has its
    /// restart policy evaluated exactly like a normal exit.
    pub async fn recover_from_crash(self: &Arc<Self>) -> ManagerResult<()> {
        let all: Vec<ContainerRecord> = self.store.scan_json("container/").await?;
        for record in all.into_iter().filter(|r| r.is_running_like()) {
            match self.runtime.resolve(&record.id).await {
                Ok(handle) => match self.runtime.is_running(&handle).await {
                    Ok(true) => {
                        info!(container_id = %record.id, "rebinding to live runtime handle after restart");
                        let generation = record.monitor_generation;
                        let this = self.clone();
                        let id = record.id.clone();
                        tokio::spawn(async move {
                            this.run_monitor(id, handle, generation).await;
                        });
                    }
                    _ => self.mark_crash_exited(record).await,
                },
                Err(_) => self.mark_crash_exited(record).await,
            }
        }
        Ok(())
    }

    async fn mark_crash_exited(self: &Arc<Self>, mut record: ContainerRecord) {
        warn!(container_id = %record.id, "marking orphaned container exited after crash recovery");
        record.state.status = ContainerStatus::Exited;
        record.state.exit_code = Some(137);
        record.state.finished_at = Some(chrono::Utc::now().timestamp());
        record.state.error = Some("killed-by-crash-recovery".to_string());
        if self.persist(&record).await.is_err() {
            return;
        }
        self.emit(EventType::Container, "die", &record.id, &[("exitCode", "137")]);

        let reason = if record.last_action == LastAction::UserStop { ExitReason::UserStopped } else { ExitReason::ProcessExited };
        if should_restart(record.host_config.restart_policy, 137, reason, record.state.restart_count) {
            let id = record.id.clone();
            let this = self.clone();
            tokio::spawn(async move {
                if let Err(e) = this.start(&id).await {
                    warn!(container_id = %id, error = %e, "post-crash-recovery restart failed");
                }
            });
        }
    }
}

fn new_container_id() -> String {
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    format!("{}{}", a.simple(), b.simple())[..64].to_string()
}

fn new_exec_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn exec_vsock_port(exec_id: &str) -> u32 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    exec_id.hash(&mut hasher);
    2048 + (hasher.finish() % (u16::MAX as u64 - 2048))
}

fn random_mac() -> String {
    let bytes: [u8; 5] = Uuid::new_v4().as_bytes()[..5].try_into().unwrap();
    format!("02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", bytes[0], bytes[1], bytes[2], bytes[3], bytes[4])
}

fn petname() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::puller::MockPuller;
    use crate::ipam::Ipam;
    use crate::network::{LoopbackAgent, NetworkController};
    use crate::runtime::{DuplexStream, RuntimeResult, VmHandle};
    use std::sync::atomic::{AtomicI64, Ordering};

    struct FakeRuntime {
        exit_code: AtomicI64,
    }

    #[async_trait::async_trait]
    impl RuntimeAdapter for FakeRuntime {
        async fn create_vm(&self, spec: VmSpec) -> RuntimeResult<VmHandle> {
            Ok(format!("vm-{}", spec.docker_id))
        }
        async fn start(&self, _handle: &VmHandle) -> RuntimeResult<()> {
            Ok(())
        }
        async fn stop(&self, _handle: &VmHandle, _t: u64) -> RuntimeResult<()> {
            Ok(())
        }
        async fn kill(&self, _handle: &VmHandle, _s: &str) -> RuntimeResult<()> {
            Ok(())
        }
        async fn wait(&self, _handle: &VmHandle) -> RuntimeResult<WaitResult> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(WaitResult { exit_code: self.exit_code.load(Ordering::SeqCst), signaled: false, oom_killed: false })
        }
        async fn destroy(&self, _handle: &VmHandle) -> RuntimeResult<()> {
            Ok(())
        }
        async fn is_running(&self, _handle: &VmHandle) -> RuntimeResult<bool> {
            Ok(false)
        }
        async fn dial_vsock(&self, _h: &VmHandle, _p: u32, _cmd: Vec<String>) -> RuntimeResult<Box<dyn DuplexStream>> {
            unimplemented!()
        }
        async fn attach_stdio(
            &self,
            _h: &VmHandle,
        ) -> RuntimeResult<(Box<dyn tokio::io::AsyncWrite + Send + Unpin>, Box<dyn tokio::io::AsyncRead + Send + Unpin>)> {
            unimplemented!()
        }
        async fn resolve(&self, docker_id: &str) -> RuntimeResult<VmHandle> {
            Ok(format!("vm-{}", docker_id))
        }
        async fn update_limits(&self, _h: &VmHandle, _limits: ResourceLimits) -> RuntimeResult<()> {
            Ok(())
        }
    }

    async fn new_manager(exit_code: i64) -> Arc<ContainerManager<LoopbackAgent>> {
        let store = StateStore::open_in_memory().unwrap();
        let ipam = Arc::new(Ipam::new(store.clone()));
        let network = Arc::new(NetworkController::new(store.clone(), ipam, LoopbackAgent::new()));
        let dir = tempfile::tempdir().unwrap();
        let images = ImageStore::new(store.clone(), Arc::new(MockPuller::new(1, 128)), dir.path().to_path_buf());
        let volumes = crate::volume::VolumeManager::new(store.clone(), dir.path().join("volumes"));
        let events = Arc::new(EventBus::new());
        let runtime: Arc<dyn RuntimeAdapter> = Arc::new(FakeRuntime { exit_code: AtomicI64::new(exit_code) });
        Arc::new(ContainerManager::new(store, runtime, network, images, volumes, events))
    }

    #[tokio::test]
    async fn create_then_inspect_roundtrips_config() {
        let manager = new_manager(0).await;
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        manager.images.pull("alpine:latest", None, tx).await.unwrap();

        let record = manager
            .create(CreateRequest {
                name: Some("t1".into()),
                config: ContainerConfig { image: "alpine:latest".into(), cmd: vec!["sleep".into(), "1".into()], ..Default::default() },
                host_config: HostConfig::default(),
                networks: vec![],
            })
            .await
            .unwrap();

        assert_eq!(record.state.status, ContainerStatus::Created);
        let fetched = manager.resolve(&record.id).await.unwrap();
        assert_eq!(fetched.config.cmd, vec!["sleep", "1"]);
        assert_eq!(fetched.names, vec!["/t1".to_string()]);
    }

    #[tokio::test]
    async fn lifecycle_start_wait_remove() {
        let manager = new_manager(0).await;
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        manager.images.pull("alpine:latest", None, tx).await.unwrap();

        let record = manager
            .create(CreateRequest {
                name: Some("t2".into()),
                config: ContainerConfig { image: "alpine:latest".into(), cmd: vec!["sleep".into(), "1".into()], ..Default::default() },
                host_config: HostConfig::default(),
                networks: vec![],
            })
            .await
            .unwrap();

        manager.start(&record.id).await.unwrap();
        let exit_code = manager.wait(&record.id).await.unwrap();
        assert_eq!(exit_code, 0);

        manager.remove(&record.id, false).await.unwrap();
        assert!(manager.resolve(&record.id).await.is_err());
    }

    #[tokio::test]
    async fn start_on_running_container_is_conflict() {
        let manager = new_manager(0).await;
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        manager.images.pull("alpine:latest", None, tx).await.unwrap();
        let record = manager
            .create(CreateRequest {
                name: Some("t3".into()),
                config: ContainerConfig { image: "alpine:latest".into(), ..Default::default() },
                host_config: HostConfig::default(),
                networks: vec![],
            })
            .await
            .unwrap();
        manager.start(&record.id).await.unwrap();
        let second = manager.start(&record.id).await;
        assert!(matches!(second, Err(ManagerError::Conflict(_))));
    }

    #[tokio::test]
    async fn restart_on_failure_retries_up_to_limit() {
        let manager = new_manager(1).await;
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        manager.images.pull("alpine:latest", None, tx).await.unwrap();

        let mut host_config = HostConfig::default();
        host_config.restart_policy = crate::container::restart::RestartPolicy::OnFailure(2);

        let record = manager
            .create(CreateRequest {
                name: Some("t4".into()),
                config: ContainerConfig { image: "alpine:latest".into(), cmd: vec!["sh".into()], ..Default::default() },
                host_config,
                networks: vec![],
            })
            .await
            .unwrap();

        manager.start(&record.id).await.unwrap();

        // Allow the monitor -> backoff -> restart chain to run its course.
        // Backoff at attempt 1/2 is short (base 100ms); give it headroom.
        tokio::time::sleep(Duration::from_secs(2)).await;

        let fetched = manager.resolve(&record.id).await.unwrap();
        assert_eq!(fetched.state.restart_count, 2);
        assert_eq!(fetched.state.status, ContainerStatus::Exited);
    }

    #[tokio::test]
    async fn remove_releases_named_volume_refcount() {
        let store = StateStore::open_in_memory().unwrap();
        let ipam = Arc::new(Ipam::new(store.clone()));
        let network = Arc::new(NetworkController::new(store.clone(), ipam, LoopbackAgent::new()));
        let dir = tempfile::tempdir().unwrap();
        let images = ImageStore::new(store.clone(), Arc::new(MockPuller::new(1, 128)), dir.path().to_path_buf());
        let volumes = crate::volume::VolumeManager::new(store.clone(), dir.path().join("volumes"));
        let events = Arc::new(EventBus::new());
        let runtime: Arc<dyn RuntimeAdapter> = Arc::new(FakeRuntime { exit_code: AtomicI64::new(0) });
        let manager = Arc::new(ContainerManager::new(store, runtime, network, images, volumes.clone(), events));

        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        manager.images.pull("alpine:latest", None, tx).await.unwrap();

        let mut host_config = HostConfig::default();
        host_config.volumes = vec!["data".into()];

        let record = manager
            .create(CreateRequest {
                name: Some("t5".into()),
                config: ContainerConfig { image: "alpine:latest".into(), ..Default::default() },
                host_config,
                networks: vec![],
            })
            .await
            .unwrap();

        assert_eq!(volumes.inspect("data").await.unwrap().refcount, 1);

        manager.remove(&record.id, false).await.unwrap();
        assert_eq!(volumes.inspect("data").await.unwrap().refcount, 0);
    }
}
