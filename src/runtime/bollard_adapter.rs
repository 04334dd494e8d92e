//! Docker-backed stand-in for the VM runtime.
//!
//! Grounded in `environment/docker/environment.rs` and
//! `environment/docker/power.rs`: the same bollard calls the teacher used
//! to drive a single managed container now drive the generic `VmHandle`
//! this adapter hands back to the Container Manager. `dialVsock` is
//! modeled as `docker exec` with a raw TTY stream — the nearest bollard
//! primitive to "a bidirectional byte stream into the guest" — and
//! `attachStdio` uses `attach_container`, exactly as the teacher's
//! `power::attach_container` does.

use std::collections::HashMap;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, KillContainerOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use super::{
    DuplexStream, MountSpec, ResourceLimits, RuntimeAdapter, RuntimeError, RuntimeResult, VmHandle,
    VmSpec, WaitResult,
};

pub struct BollardRuntimeAdapter {
    docker: Docker,
}

impl BollardRuntimeAdapter {
    pub fn connect() -> RuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Permanent(e.to_string()))?;
        Ok(Self { docker })
    }

    fn to_bollard_error(e: bollard::errors::Error) -> RuntimeError {
        match &e {
            bollard::errors::Error::DockerResponseServerError { status_code: 404, .. } => {
                RuntimeError::NotFound(e.to_string())
            }
            bollard::errors::Error::DockerResponseServerError { status_code: 409, .. } => {
                RuntimeError::Permanent(e.to_string())
            }
            bollard::errors::Error::HyperResponseError { .. } | bollard::errors::Error::IOError { .. } => {
                RuntimeError::Transient(e.to_string())
            }
            _ => RuntimeError::Permanent(e.to_string()),
        }
    }

    fn build_host_config(spec: &VmSpec) -> HostConfig {
        let mounts = spec
            .mounts
            .iter()
            .map(|m: &MountSpec| Mount {
                source: Some(m.source.clone()),
                target: Some(m.target.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(m.read_only),
                ..Default::default()
            })
            .collect();

        HostConfig {
            mounts: Some(mounts),
            memory: Some(spec.limits.memory_bytes),
            memory_swap: Some(spec.limits.memory_swap_bytes),
            cpu_quota: Some(spec.limits.cpu_quota),
            cpu_period: Some(spec.limits.cpu_period),
            cpu_shares: Some(spec.limits.cpu_shares),
            pids_limit: Some(spec.limits.pids_limit),
            ..Default::default()
        }
    }
}

#[async_trait]
impl RuntimeAdapter for BollardRuntimeAdapter {
    async fn create_vm(&self, spec: VmSpec) -> RuntimeResult<VmHandle> {
        let handle = format!("arca_{}", spec.docker_id);

        // The Image Store resolves and records pulls independently of this
        // engine (spec.md §4.3); this engine still needs the image in its
        // own local cache to create a container from it, so mirror the
        // pull here. A no-op when the image is already cached.
        let mut create_image_stream = self.docker.create_image(
            Some(CreateImageOptions { from_image: spec.image_ref.clone(), ..Default::default() }),
            None,
            None,
        );
        while let Some(progress) = create_image_stream.next().await {
            progress.map_err(Self::to_bollard_error)?;
        }

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let labels: HashMap<String, String> = spec.labels.clone();

        let config = Config {
            image: Some(spec.image_ref.clone()),
            cmd: if spec.cmd.is_empty() { None } else { Some(spec.cmd.clone()) },
            env: Some(env),
            working_dir: spec.working_dir.clone(),
            tty: Some(spec.tty),
            open_stdin: Some(spec.open_stdin),
            hostname: spec.hostname.clone(),
            labels: Some(labels),
            host_config: Some(Self::build_host_config(&spec)),
            ..Default::default()
        };

        self.docker
            .create_container(
                Some(bollard::container::CreateContainerOptions { name: handle.clone(), platform: None }),
                config,
            )
            .await
            .map_err(Self::to_bollard_error)?;

        Ok(handle)
    }

    async fn start(&self, handle: &VmHandle) -> RuntimeResult<()> {
        self.docker
            .start_container(handle, None::<StartContainerOptions<String>>)
            .await
            .map_err(Self::to_bollard_error)
    }

    async fn stop(&self, handle: &VmHandle, graceful_timeout_secs: u64) -> RuntimeResult<()> {
        let options = StopContainerOptions { t: graceful_timeout_secs as i64 };
        match self.docker.stop_container(handle, Some(options)).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 304, .. }) => Ok(()),
            Err(e) => Err(Self::to_bollard_error(e)),
        }
    }

    async fn kill(&self, handle: &VmHandle, signal: &str) -> RuntimeResult<()> {
        let options = KillContainerOptions { signal };
        match self.docker.kill_container(handle, Some(options)).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 409, .. }) => Ok(()),
            Err(e) => Err(Self::to_bollard_error(e)),
        }
    }

    async fn wait(&self, handle: &VmHandle) -> RuntimeResult<WaitResult> {
        let options = WaitContainerOptions { condition: "not-running" };
        let mut stream = self.docker.wait_container(handle, Some(options));

        while let Some(result) = stream.next().await {
            match result {
                Ok(response) => {
                    let inspect = self
                        .docker
                        .inspect_container(handle, None)
                        .await
                        .map_err(Self::to_bollard_error)?;
                    let state = inspect.state.unwrap_or_default();
                    return Ok(WaitResult {
                        exit_code: response.status_code,
                        signaled: state.oom_killed.unwrap_or(false) || response.status_code == 137,
                        oom_killed: state.oom_killed.unwrap_or(false),
                    });
                }
                Err(e) => return Err(Self::to_bollard_error(e)),
            }
        }

        Err(RuntimeError::Transient("wait stream ended without a result".into()))
    }

    async fn destroy(&self, handle: &VmHandle) -> RuntimeResult<()> {
        let options = RemoveContainerOptions { force: true, v: true, ..Default::default() };
        match self.docker.remove_container(handle, Some(options)).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(Self::to_bollard_error(e)),
        }
    }

    async fn is_running(&self, handle: &VmHandle) -> RuntimeResult<bool> {
        let inspect = self.docker.inspect_container(handle, None).await.map_err(Self::to_bollard_error)?;
        Ok(inspect.state.and_then(|s| s.running).unwrap_or(false))
    }

    async fn dial_vsock(
        &self,
        handle: &VmHandle,
        port: u32,
        cmd: Vec<String>,
    ) -> RuntimeResult<Box<dyn DuplexStream>> {
        debug!(%handle, port, "dialing vsock (docker exec stand-in)");

        let exec = self
            .docker
            .create_exec(
                handle,
                CreateExecOptions {
                    cmd: Some(cmd),
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(Self::to_bollard_error)?;

        let results = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(Self::to_bollard_error)?;

        match results {
            StartExecResults::Attached { output, input } => {
                let boxed_output: std::pin::Pin<
                    Box<dyn futures_util::Stream<Item = std::io::Result<bytes::Bytes>> + Send>,
                > = Box::pin(output.map(|r| r.map(|o| o.into_bytes()).map_err(std::io::Error::other)));
                let reader = tokio_util::io::StreamReader::new(boxed_output);
                Ok(Box::new(ExecDuplex { reader, writer: input }))
            }
            StartExecResults::Detached => Err(RuntimeError::Permanent("exec detached unexpectedly".into())),
        }
    }

    async fn attach_stdio(
        &self,
        handle: &VmHandle,
    ) -> RuntimeResult<(Box<dyn AsyncWrite + Send + Unpin>, Box<dyn AsyncRead + Send + Unpin>)> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(false),
            ..Default::default()
        };

        let AttachContainerResults { output, input } =
            self.docker.attach_container(handle, Some(options)).await.map_err(Self::to_bollard_error)?;

        let reader = tokio_util::io::StreamReader::new(output.map(|r| {
            r.map(|o| o.into_bytes()).map_err(std::io::Error::other)
        }));

        Ok((Box::new(input), Box::new(reader)))
    }

    async fn resolve(&self, docker_id: &str) -> RuntimeResult<VmHandle> {
        let handle = format!("arca_{}", docker_id);
        match self.docker.inspect_container(&handle, None).await {
            Ok(_) => Ok(handle),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {
                warn!(%docker_id, "no runtime handle found on resolve");
                Err(RuntimeError::NotFound(docker_id.to_string()))
            }
            Err(e) => Err(Self::to_bollard_error(e)),
        }
    }

    async fn update_limits(&self, handle: &VmHandle, limits: ResourceLimits) -> RuntimeResult<()> {
        use bollard::container::UpdateContainerOptions;

        let options: UpdateContainerOptions<String> = UpdateContainerOptions {
            memory: Some(limits.memory_bytes),
            memory_swap: Some(limits.memory_swap_bytes),
            cpu_quota: Some(limits.cpu_quota),
            cpu_period: Some(limits.cpu_period),
            ..Default::default()
        };

        self.docker.update_container(handle, options).await.map_err(Self::to_bollard_error)?;
        Ok(())
    }
}

/// Wraps bollard's exec output stream + stdin writer into a single
/// AsyncRead+AsyncWrite duplex, the shape `dialVsock` promises upward.
struct ExecDuplex {
    reader: tokio_util::io::StreamReader<
        std::pin::Pin<Box<dyn futures_util::Stream<Item = std::io::Result<bytes::Bytes>> + Send>>,
        bytes::Bytes,
    >,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl AsyncRead for ExecDuplex {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        std::pin::Pin::new(&mut this.reader).poll_read(cx, buf)
    }
}

impl AsyncWrite for ExecDuplex {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        std::pin::Pin::new(&mut this.writer).poll_write(cx, buf)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        std::pin::Pin::new(&mut this.writer).poll_flush(cx)
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        let this = self.get_mut();
        std::pin::Pin::new(&mut this.writer).poll_shutdown(cx)
    }
}
