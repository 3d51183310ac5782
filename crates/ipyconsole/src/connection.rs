//! Connection files: allocation, reading and writing.
//!
//! A connection file is the JSON document Jupyter kernels use to publish
//! their ports and signing key. Files live in the shared Jupyter runtime
//! directory, so names carry a uuid and are checked before use.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use jupyter_protocol::ConnectionInfo;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConsoleError, Result};

/// How a client reaches its kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Kernel process spawned and owned by this console.
    Local,
    /// Existing kernel reached through its connection file.
    External,
    /// Connection info handed over directly, no file on disk.
    Stdio,
    /// Existing remote kernel behind ssh port forwards.
    SshTunnel,
}

impl TransportKind {
    /// Whether the console may kill and respawn the kernel.
    pub fn owns_process(&self) -> bool {
        matches!(self, TransportKind::Local)
    }
}

/// Everything a client knows about where its kernel lives.
#[derive(Debug, Clone)]
pub struct KernelConnection {
    /// `None` for stdio connections.
    pub connection_file: Option<PathBuf>,
    pub info: ConnectionInfo,
    pub kind: TransportKind,
    /// Remote host for tunneled kernels, shown in the tab name.
    pub hostname: Option<String>,
}

impl KernelConnection {
    pub fn new(connection_file: Option<PathBuf>, info: ConnectionInfo, kind: TransportKind) -> Self {
        Self {
            connection_file,
            info,
            kind,
            hostname: None,
        }
    }

    /// Kernel id: the connection file name without its `.json` suffix.
    pub fn kernel_id(&self) -> String {
        self.connection_file
            .as_deref()
            .map(kernel_id_from_path)
            .unwrap_or_else(|| format!("stdio-{}", self.info.shell_port))
    }

    /// `[shell, iopub, stdin, hb, control]`
    pub fn ports(&self) -> [u16; 5] {
        [
            self.info.shell_port,
            self.info.iopub_port,
            self.info.stdin_port,
            self.info.hb_port,
            self.info.control_port,
        ]
    }

    /// Whether two connections point at the same kernel.
    ///
    /// Identity is the connection file; stdio connections are never shared.
    pub fn same_kernel(&self, other: &KernelConnection) -> bool {
        match (&self.connection_file, &other.connection_file) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

pub fn kernel_id_from_path(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.strip_suffix(".json").map(str::to_string).unwrap_or(name)
}

/// Check that the runtime directory exists and accepts new files.
pub fn ensure_writable_dir(dir: &Path) -> Result<()> {
    let unwritable = || ConsoleError::UnwritableRuntimeDir(dir.to_path_buf());
    std::fs::create_dir_all(dir).map_err(|_| unwritable())?;
    let marker = dir.join(format!(".ipyconsole-write-check-{}", Uuid::new_v4()));
    std::fs::write(&marker, b"").map_err(|_| unwritable())?;
    let _ = std::fs::remove_file(&marker);
    Ok(())
}

/// Pick an unused `kernel-<uuid>.json` path in `runtime_dir`.
///
/// Fails with [`ConsoleError::UnwritableRuntimeDir`] if the directory is
/// missing and cannot be created, or refuses writes.
pub fn allocate_connection_file(runtime_dir: &Path) -> Result<PathBuf> {
    ensure_writable_dir(runtime_dir)?;
    loop {
        let candidate = runtime_dir.join(format!("kernel-{}.json", Uuid::new_v4()));
        if !candidate.exists() {
            return Ok(candidate);
        }
        warn!(
            "[connection] Connection file {:?} already exists, regenerating",
            candidate
        );
    }
}

/// Reserve five local ports and build connection info for a new kernel.
pub async fn new_local_connection_info(kernel_name: &str) -> Result<ConnectionInfo> {
    let ip = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
    let ports = runtimelib::peek_ports(ip, 5)
        .await
        .map_err(ConsoleError::connection)?;

    Ok(ConnectionInfo {
        transport: jupyter_protocol::connection_info::Transport::TCP,
        ip: ip.to_string(),
        stdin_port: ports[0],
        control_port: ports[1],
        hb_port: ports[2],
        shell_port: ports[3],
        iopub_port: ports[4],
        signature_scheme: "hmac-sha256".to_string(),
        key: Uuid::new_v4().to_string(),
        kernel_name: Some(kernel_name.to_string()),
    })
}

pub fn write_connection_file(path: &Path, info: &ConnectionInfo) -> Result<()> {
    std::fs::write(path, serde_json::to_string_pretty(info)?)?;
    debug!("[connection] Wrote {:?}", path);
    Ok(())
}

/// Parse a connection document.
pub fn parse_connection_info(content: &str) -> Result<ConnectionInfo> {
    serde_json::from_str(content).map_err(ConsoleError::connection)
}

pub fn read_connection_file(path: &Path) -> Result<ConnectionInfo> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConsoleError::Connection(format!("{}: {}", path.display(), e)))?;
    parse_connection_info(&content)
        .map_err(|e| ConsoleError::Connection(format!("{}: {}", path.display(), e)))
}

/// Resolve what a user typed into a connection file path.
///
/// Accepts a path, a file name inside the runtime dir, a kernel id
/// (`kernel-<id>`), or a bare id (`<id>`).
pub fn find_connection_file(spec: &str, runtime_dir: &Path) -> Result<PathBuf> {
    let spec = spec.trim();
    let direct = PathBuf::from(spec);
    if direct.is_file() {
        return Ok(direct);
    }

    let mut candidates = vec![runtime_dir.join(spec)];
    if !spec.ends_with(".json") {
        candidates.push(runtime_dir.join(format!("{}.json", spec)));
        if !spec.starts_with("kernel-") {
            candidates.push(runtime_dir.join(format!("kernel-{}.json", spec)));
        }
    }

    candidates
        .into_iter()
        .find(|p| p.is_file())
        .ok_or_else(|| {
            ConsoleError::Connection(format!(
                "Unable to find connection file for {} in {}",
                spec,
                runtime_dir.display()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> ConnectionInfo {
        ConnectionInfo {
            transport: jupyter_protocol::connection_info::Transport::TCP,
            ip: "127.0.0.1".to_string(),
            stdin_port: 5001,
            control_port: 5002,
            hb_port: 5003,
            shell_port: 5004,
            iopub_port: 5005,
            signature_scheme: "hmac-sha256".to_string(),
            key: "secret".to_string(),
            kernel_name: Some("python3".to_string()),
        }
    }

    #[test]
    fn test_kernel_id_strips_json() {
        assert_eq!(
            kernel_id_from_path(Path::new("/run/jupyter/kernel-abc.json")),
            "kernel-abc"
        );
        assert_eq!(kernel_id_from_path(Path::new("/x/odd-name")), "odd-name");
    }

    #[test]
    fn test_allocate_connection_file_unique() {
        let tmp = tempfile::TempDir::new().unwrap();
        let a = allocate_connection_file(tmp.path()).unwrap();
        std::fs::write(&a, "{}").unwrap();
        let b = allocate_connection_file(tmp.path()).unwrap();
        assert_ne!(a, b);
        assert!(b.file_name().unwrap().to_string_lossy().starts_with("kernel-"));
        assert!(!b.exists());
    }

    #[test]
    fn test_allocate_creates_missing_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().join("runtime");
        allocate_connection_file(&dir).unwrap();
        assert!(dir.is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn test_allocate_unwritable_dir() {
        let tmp = tempfile::TempDir::new().unwrap();
        // A regular file where the directory should be cannot be written into.
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let err = allocate_connection_file(&blocker.join("runtime")).unwrap_err();
        assert!(matches!(err, ConsoleError::UnwritableRuntimeDir(_)));
    }

    #[test]
    fn test_write_then_read() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("kernel-1.json");
        write_connection_file(&path, &sample_info()).unwrap();
        let info = read_connection_file(&path).unwrap();
        assert_eq!(info.shell_port, 5004);
        assert_eq!(info.key, "secret");
        assert_eq!(info.kernel_name.as_deref(), Some("python3"));
    }

    #[test]
    fn test_read_garbage_is_connection_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("kernel-bad.json");
        std::fs::write(&path, "{\"ip\": ").unwrap();
        let err = read_connection_file(&path).unwrap_err();
        assert!(matches!(err, ConsoleError::Connection(_)));
        let err = read_connection_file(&tmp.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, ConsoleError::Connection(_)));
    }

    #[test]
    fn test_find_connection_file_forms() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("kernel-42.json");
        std::fs::write(&path, "{}").unwrap();

        for spec in ["kernel-42.json", "kernel-42", "42", path.to_str().unwrap()] {
            assert_eq!(find_connection_file(spec, tmp.path()).unwrap(), path);
        }
        assert!(find_connection_file("43", tmp.path()).is_err());
    }

    #[test]
    fn test_same_kernel_by_file() {
        let a = KernelConnection::new(
            Some(PathBuf::from("/r/kernel-1.json")),
            sample_info(),
            TransportKind::Local,
        );
        let b = KernelConnection::new(
            Some(PathBuf::from("/r/kernel-1.json")),
            sample_info(),
            TransportKind::External,
        );
        let c = KernelConnection::new(None, sample_info(), TransportKind::Stdio);
        assert!(a.same_kernel(&b));
        assert!(!a.same_kernel(&c));
        assert!(!c.same_kernel(&c.clone()));
        assert_eq!(a.kernel_id(), "kernel-1");
        assert_eq!(c.kernel_id(), "stdio-5004");
        assert_eq!(a.ports(), [5004, 5005, 5001, 5003, 5002]);
    }
}
