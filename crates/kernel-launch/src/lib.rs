//! Kernel launching for the IPython console.
//!
//! This crate knows how to turn a console request ("a new sympy console
//! using this interpreter") into a running kernel process:
//!
//! - [`KernelFlavor`] selects the startup recipe (plain, pylab, sympy, cython)
//! - [`LaunchSpec`] builds the command line and environment
//! - [`spawn_kernel`] starts the process in its own process group with its
//!   stderr redirected to a capture file
//!
//! ```ignore
//! use kernel_launch::{spawn_kernel, KernelFlavor, LaunchSpec};
//!
//! let spec = LaunchSpec::for_interpreter("/usr/bin/python3", KernelFlavor::Sympy);
//! spec.check_modules().await?;
//! let kernel = spawn_kernel(&spec, &connection_file, &stderr_file).await?;
//! ```

pub mod flavor;
pub mod process;
pub mod spec;

pub use flavor::KernelFlavor;
pub use process::{
    create_stderr_file, interrupt_process_group, kill_process_group, read_stderr, spawn_kernel,
    KernelProcess,
};
pub use spec::{KernelCommand, LaunchOptions, LaunchSpec};

use std::path::PathBuf;

/// Errors raised while preparing or starting a kernel process.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    /// The interpreter is missing a module the selected console needs.
    #[error("missing module {module} in {}", interpreter.display())]
    MissingModule { module: String, interpreter: PathBuf },

    /// The OS refused to start the process.
    #[error("{0}")]
    Spawn(String),

    /// The stderr capture file could not be created.
    #[error("could not create {}: {source}", path.display())]
    StderrFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Default interpreter used when none is configured.
pub fn default_interpreter() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from("python.exe")
    } else {
        PathBuf::from("python3")
    }
}
