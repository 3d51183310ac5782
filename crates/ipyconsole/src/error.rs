//! Error taxonomy for the console core.

use std::path::PathBuf;

/// Failures surfaced by transports, clients and the console manager.
///
/// Kernel-side execution errors are never represented here; they are
/// rendered as tracebacks in the view.
#[derive(Debug, thiserror::Error)]
pub enum ConsoleError {
    /// The kernel process could not be launched. Carries the captured text.
    #[error("{0}")]
    SpawnFailed(String),

    #[error("The directory {} is not writable and it is required to create IPython consoles. Please make it writable.", .0.display())]
    UnwritableRuntimeDir(PathBuf),

    /// Connection file could not be read or parsed, tunnel or ports failed.
    #[error("Could not connect to kernel: {0}")]
    Connection(String),

    #[error("Kernel died")]
    KernelDied,

    #[error("Your Python environment or installation doesn't have the <tt>{module}</tt> module installed or it occurred a problem importing it. Due to that, it is not possible to create this console for you.")]
    MissingKernelModule { module: String, interpreter: PathBuf },

    #[error("Error restarting kernel: {0}")]
    RestartFailed(String),

    /// A visible execution is already in flight.
    #[error("An execution is already in progress")]
    RequestWhileBusy,

    /// The operation is not allowed for this kind of kernel.
    #[error("{0}")]
    NotPermitted(String),

    #[error("No kernel running")]
    NoKernel,

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// The kernel restarted while a reply was pending.
    #[error("Kernel restarted before replying")]
    Restarted,

    /// The kernel answered with an error.
    #[error("{ename}: {evalue}")]
    Kernel { ename: String, evalue: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = ConsoleError> = std::result::Result<T, E>;

impl ConsoleError {
    /// Convert a plumbing error into a connection error, keeping the chain.
    pub fn connection(err: impl std::fmt::Display) -> Self {
        ConsoleError::Connection(format!("{:#}", err))
    }

    /// Whether this error should put the client into the kernel-error page.
    pub fn is_kernel_error(&self) -> bool {
        matches!(
            self,
            ConsoleError::SpawnFailed(_)
                | ConsoleError::UnwritableRuntimeDir(_)
                | ConsoleError::MissingKernelModule { .. }
        )
    }
}

impl From<kernel_launch::LaunchError> for ConsoleError {
    fn from(err: kernel_launch::LaunchError) -> Self {
        match err {
            kernel_launch::LaunchError::MissingModule { module, interpreter } => {
                ConsoleError::MissingKernelModule { module, interpreter }
            }
            other => ConsoleError::SpawnFailed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_module_conversion() {
        let err: ConsoleError = kernel_launch::LaunchError::MissingModule {
            module: "sympy".to_string(),
            interpreter: PathBuf::from("/usr/bin/python3"),
        }
        .into();
        assert!(err.is_kernel_error());
        assert!(err.to_string().contains("<tt>sympy</tt>"));
    }

    #[test]
    fn test_spawn_error_is_verbatim() {
        let err: ConsoleError =
            kernel_launch::LaunchError::Spawn("No such file or directory".to_string()).into();
        assert_eq!(err.to_string(), "No such file or directory");
    }

    #[test]
    fn test_unwritable_dir_message() {
        let err = ConsoleError::UnwritableRuntimeDir(PathBuf::from("/run/jupyter"));
        assert!(err.to_string().starts_with("The directory /run/jupyter is not writable"));
        assert!(err.is_kernel_error());
        assert!(!ConsoleError::KernelDied.is_kernel_error());
    }
}
