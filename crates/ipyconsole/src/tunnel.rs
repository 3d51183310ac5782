//! SSH port forwarding for remote kernels.
//!
//! All five kernel ports are forwarded through one `ssh -N` process. The rewritten connection info points at loopback.

use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use jupyter_protocol::ConnectionInfo;
use log::{info, warn};
use tokio::io::AsyncReadExt;

use crate::error::{ConsoleError, Result};

/// Where and how to open the tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshParams {
    /// `[user@]host[:port]`
    pub host: String,
    pub keyfile: Option<PathBuf>,
}

impl SshParams {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            keyfile: None,
        }
    }

    /// Split `[user@]host[:port]` into the ssh destination and port.
    pub fn destination(&self) -> (String, Option<u16>) {
        let (user, rest) = match self.host.split_once('@') {
            Some((user, rest)) => (Some(user), rest),
            None => (None, self.host.as_str()),
        };
        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => match port.parse::<u16>() {
                Ok(port) => (host, Some(port)),
                Err(_) => (rest, None),
            },
            None => (rest, None),
        };
        let dest = match user {
            Some(user) => format!("{}@{}", user, host),
            None => host.to_string(),
        };
        (dest, port)
    }

    /// Host name without user or port, for display.
    pub fn hostname(&self) -> String {
        let (dest, _) = self.destination();
        dest.rsplit('@').next().unwrap_or_default().to_string()
    }
}

/// A live `ssh -N` forwarding process.
#[derive(Debug)]
pub struct SshTunnel {
    child: tokio::process::Child,
    /// Local `[shell, iopub, stdin, hb, control]` ports.
    pub local_ports: [u16; 5],
}

impl SshTunnel {
    pub async fn close(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!("[tunnel] Failed to stop ssh: {}", e);
        }
    }
}

/// Arguments passed to `ssh` for the given forwards.
///
/// `forwards` pairs each local port with the remote port it reaches.
pub fn tunnel_args(params: &SshParams, remote_ip: &str, forwards: &[(u16, u16)]) -> Vec<String> {
    let (dest, port) = params.destination();
    let mut args = vec![
        "-N".to_string(),
        "-o".to_string(),
        "ExitOnForwardFailure=yes".to_string(),
        "-o".to_string(),
        "BatchMode=yes".to_string(),
    ];
    if let Some(port) = port {
        args.push("-p".to_string());
        args.push(port.to_string());
    }
    if let Some(key) = &params.keyfile {
        args.push("-i".to_string());
        args.push(key.to_string_lossy().into_owned());
    }
    for (local, remote) in forwards {
        args.push("-L".to_string());
        args.push(format!("127.0.0.1:{}:{}:{}", local, remote_ip, remote));
    }
    args.push(dest);
    args
}

/// Connection info as seen through the tunnel.
pub fn rewrite_for_tunnel(info: &ConnectionInfo, local_ports: [u16; 5]) -> ConnectionInfo {
    let mut rewritten = info.clone();
    rewritten.ip = "127.0.0.1".to_string();
    rewritten.shell_port = local_ports[0];
    rewritten.iopub_port = local_ports[1];
    rewritten.stdin_port = local_ports[2];
    rewritten.hb_port = local_ports[3];
    rewritten.control_port = local_ports[4];
    rewritten
}

/// Open the forwards and return the rewritten connection info.
pub async fn open_tunnel(
    info: &ConnectionInfo,
    params: &SshParams,
) -> Result<(ConnectionInfo, SshTunnel)> {
    let loopback = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
    let ports = runtimelib::peek_ports(loopback, 5)
        .await
        .map_err(ConsoleError::connection)?;
    let local_ports = [ports[0], ports[1], ports[2], ports[3], ports[4]];
    let remote = [
        info.shell_port,
        info.iopub_port,
        info.stdin_port,
        info.hb_port,
        info.control_port,
    ];
    let forwards: Vec<(u16, u16)> = local_ports.iter().copied().zip(remote).collect();

    // Kernels bound to "localhost" on the remote side are reached from there.
    let remote_ip = match info.ip.as_str() {
        "" | "localhost" | "0.0.0.0" => "127.0.0.1",
        ip => ip,
    };

    let args = tunnel_args(params, remote_ip, &forwards);
    info!("[tunnel] ssh {}", args.join(" "));

    let mut child = tokio::process::Command::new("ssh")
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ConsoleError::Connection(format!("Could not start ssh: {}", e)))?;

    // ExitOnForwardFailure makes ssh quit quickly when a forward is refused.
    tokio::time::sleep(Duration::from_millis(500)).await;
    if let Ok(Some(status)) = child.try_wait() {
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_string(&mut stderr).await;
        }
        return Err(ConsoleError::Connection(format!(
            "ssh tunnel to {} exited with {}: {}",
            params.host,
            status,
            stderr.trim()
        )));
    }

    Ok((
        rewrite_for_tunnel(info, local_ports),
        SshTunnel { child, local_ports },
    ))
}
