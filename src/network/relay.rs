//! Per-attachment packet relay: two copy loops bridging a host-side byte
//! stream and the in-VM TAP device over vsock, cancelled together the
//! moment either side EOFs — the same `CancellationToken`-gated two-task
//! shape the teacher uses for attach/output streaming in
//! `environment/docker/power.rs`, generalized from "container stdio" to
//! "raw Ethernet frames".

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const MAX_FRAME: usize = 65_536;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay io error: {0}")]
    Io(String),
}

/// A running relay session for one (container, network) attachment. The
/// real endpoints are vsock streams dialed through the Runtime Adapter;
/// this type owns only the cancellation handle and the task handles, not
/// the streams themselves, since callers that already hold the streams
/// should use `spawn_with_streams`.
pub struct RelaySession {
    vsock_port: u32,
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl RelaySession {
    /// Placeholder session bound to a vsock port but with no live streams —
    /// used where the host/VM sides are dialed lazily (the control-plane
    /// agent assigns the port before either side is ready to connect).
    /// Call `cancel` to tear it down; there is nothing running yet to copy.
    pub fn spawn(vsock_port: u32) -> Self {
        Self { vsock_port, cancel: CancellationToken::new(), tasks: Vec::new() }
    }

    /// Start the two copy loops given both ends of the bridge. Either
    /// direction finishing (EOF or error) cancels the other.
    pub fn spawn_with_streams<A, B>(vsock_port: u32, host_side: A, vm_side: B) -> Self
    where
        A: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
        B: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
        A: Split,
        B: Split,
    {
        let cancel = CancellationToken::new();
        let (host_read, host_write) = host_side.split_halves();
        let (vm_read, vm_write) = vm_side.split_halves();

        let forward = spawn_copy_loop("host->vm", vsock_port, host_read, vm_write, cancel.clone());
        let backward = spawn_copy_loop("vm->host", vsock_port, vm_read, host_write, cancel.clone());

        Self { vsock_port, cancel, tasks: vec![forward, backward] }
    }

    pub async fn cancel(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        debug!(vsock_port = self.vsock_port, "relay session torn down");
    }

    pub fn vsock_port(&self) -> u32 {
        self.vsock_port
    }
}

/// Split a duplex stream into independently ownable read/write halves.
/// `tokio::io::split` already gives this; named here so `RelaySession`
/// doesn't hard-code the concrete halves type.
pub trait Split {
    type Read: tokio::io::AsyncRead + Send + Unpin + 'static;
    type Write: tokio::io::AsyncWrite + Send + Unpin + 'static;
    fn split_halves(self) -> (Self::Read, Self::Write);
}

impl<T> Split for T
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    type Read = tokio::io::ReadHalf<T>;
    type Write = tokio::io::WriteHalf<T>;

    fn split_halves(self) -> (Self::Read, Self::Write) {
        tokio::io::split(self)
    }
}

fn spawn_copy_loop<R, W>(
    direction: &'static str,
    vsock_port: u32,
    mut reader: R,
    mut writer: W,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()>
where
    R: tokio::io::AsyncRead + Send + Unpin + 'static,
    W: tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_FRAME];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = read_write_once(&mut reader, &mut writer, &mut buf) => {
                    match result {
                        Ok(true) => continue,
                        Ok(false) => break,
                        Err(e) => {
                            warn!(direction, vsock_port, error = %e, "relay copy loop ended");
                            break;
                        }
                    }
                }
            }
        }
        cancel.cancel();
    })
}

async fn read_write_once<R, W>(reader: &mut R, writer: &mut W, buf: &mut [u8]) -> Result<bool, RelayError>
where
    R: tokio::io::AsyncRead + Send + Unpin,
    W: tokio::io::AsyncWrite + Send + Unpin,
{
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let n = reader.read(buf).await.map_err(|e| RelayError::Io(e.to_string()))?;
    if n == 0 {
        return Ok(false);
    }
    writer.write_all(&buf[..n]).await.map_err(|e| RelayError::Io(e.to_string()))?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn relay_forwards_bytes_until_eof() {
        let (host_a, mut host_b) = duplex(1024);
        let (vm_a, mut vm_b) = duplex(1024);

        let session = RelaySession::spawn_with_streams(42, host_a, vm_a);

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        host_b.write_all(b"hello-vm").await.unwrap();
        let mut buf = [0u8; 8];
        vm_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello-vm");

        drop(host_b);
        drop(vm_b);
        session.cancel().await;
    }

    #[tokio::test]
    async fn placeholder_session_cancels_cleanly() {
        let session = RelaySession::spawn(7);
        assert_eq!(session.vsock_port(), 7);
        session.cancel().await;
    }
}
