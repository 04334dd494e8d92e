//! `daemon status` and `daemon stop` (spec.md §6 names these as CLI
//! surface without detailing them). `status` connects to the Unix socket
//! and calls `/_ping` and `/info`; `stop` signals the running process by
//! pid, found via the pid file `start` writes next to the socket.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use http_body_util::BodyExt;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;

use crate::config::Configuration;

fn pid_file_path(config: &Configuration) -> PathBuf {
    config.system.base_directory().join("arca.pid")
}

async fn unix_get(socket_path: &std::path::Path, path: &str) -> Result<String> {
    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("failed to connect to {}", socket_path.display()))?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let request = Request::builder()
        .uri(path)
        .header("Host", "localhost")
        .body(http_body_util::Empty::<bytes::Bytes>::new())?;
    let response = sender.send_request(request).await?;
    let body = response.into_body().collect().await?.to_bytes();
    Ok(String::from_utf8_lossy(&body).into_owned())
}

/// Prints a short human summary of the running daemon, or reports that
/// none is reachable at the configured socket.
pub async fn status(config_path: &str) -> Result<()> {
    let config = Configuration::load(config_path).context("failed to load configuration")?;
    let socket_path = config.api.socket_path();

    match unix_get(&socket_path, "/_ping").await {
        Ok(_) => {
            println!("daemon: running");
            println!("socket: {}", socket_path.display());
            if let Ok(info) = unix_get(&socket_path, "/info").await {
                println!("info: {}", info);
            }
            if let Ok(pid) = std::fs::read_to_string(pid_file_path(&config)) {
                println!("pid: {}", pid.trim());
            }
            Ok(())
        }
        Err(e) => {
            println!("daemon: not running ({})", e);
            std::process::exit(1);
        }
    }
}

/// Sends `SIGTERM` to the pid recorded by a running `daemon start`,
/// triggering the same graceful shutdown path a ctrl_c would.
pub async fn stop(config_path: &str) -> Result<()> {
    let config = Configuration::load(config_path).context("failed to load configuration")?;
    let pid_path = pid_file_path(&config);
    let pid = std::fs::read_to_string(&pid_path)
        .with_context(|| format!("no pid file at {} — is the daemon running?", pid_path.display()))?;
    let pid = pid.trim();

    let status = std::process::Command::new("kill")
        .arg("-TERM")
        .arg(pid)
        .status()
        .context("failed to invoke kill")?;

    if !status.success() {
        bail!("failed to signal pid {}", pid);
    }
    println!("sent SIGTERM to pid {}", pid);
    Ok(())
}
