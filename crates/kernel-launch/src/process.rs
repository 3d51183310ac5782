//! Kernel process spawning and teardown.

use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::{LaunchError, LaunchSpec};

/// A running kernel process.
#[derive(Debug)]
pub struct KernelProcess {
    pub child: tokio::process::Child,
    /// Process group id on unix; the kernel is its group leader.
    pub pgid: Option<i32>,
    pub stderr_path: PathBuf,
}

impl KernelProcess {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Kill the whole process group, then reap the child.
    pub async fn kill(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
        if let Err(e) = self.child.kill().await {
            warn!("[kernel-launch] Failed to kill kernel process: {}", e);
        }
    }
}

/// Create (truncating) the file that captures the kernel's stderr.
pub fn create_stderr_file(path: &Path) -> Result<std::fs::File, LaunchError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| LaunchError::StderrFile {
            path: path.to_path_buf(),
            source,
        })?;
    }
    std::fs::File::create(path).map_err(|source| LaunchError::StderrFile {
        path: path.to_path_buf(),
        source,
    })
}

/// Read the captured stderr, tolerating undecodable bytes.
///
/// A missing file reads as empty.
pub fn read_stderr(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(text) => text,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        },
        Err(_) => String::new(),
    }
}

/// Spawn the kernel described by `spec`.
///
/// The process gets its own process group so interrupts and kills reach
/// any children it forks.
pub async fn spawn_kernel(
    spec: &LaunchSpec,
    connection_file: &Path,
    stderr_path: &Path,
) -> Result<KernelProcess, LaunchError> {
    let stderr = create_stderr_file(stderr_path)?;
    let mut cmd = spec
        .command(connection_file, stderr)
        .await
        .map_err(|e| LaunchError::Spawn(format!("{:#}", e)))?;

    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| LaunchError::Spawn(e.to_string()))?;

    #[cfg(unix)]
    let pgid = child.id().map(|pid| pid as i32);
    #[cfg(not(unix))]
    let pgid = None;

    info!(
        "[kernel-launch] Spawned kernel pid={:?} connection_file={:?}",
        child.id(),
        connection_file
    );

    Ok(KernelProcess {
        child,
        pgid,
        stderr_path: stderr_path.to_path_buf(),
    })
}

/// SIGKILL a process group, ignoring groups that are already gone.
pub fn kill_process_group(pgid: i32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        if let Err(e) = killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            if e != nix::errno::Errno::ESRCH {
                log::error!("[kernel-launch] Failed to kill process group {}: {}", pgid, e);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pgid;
}

/// Send SIGINT to a process group.
///
/// Used when the control channel is unavailable.
pub fn interrupt_process_group(pgid: i32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;
        killpg(Pid::from_raw(pgid), Signal::SIGINT).map_err(std::io::Error::from)
    }
    #[cfg(not(unix))]
    {
        let _ = pgid;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "signals are not supported on this platform",
        ))
    }
}
