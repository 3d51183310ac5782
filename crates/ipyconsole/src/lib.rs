//! ipyconsole - the core of a tabbed IPython console.
//!
//! Each console tab is a [`client::Client`] talking to one Jupyter kernel.
//! Messages flow Transport → Router → Shell state machine → view, and user
//! input flows the other way. The [`manager::ConsoleManager`] owns every
//! client and brokers requests coming from outside the console (run this
//! file, run this cell, jump to this error).
//!
//! Kernel I/O runs on one worker task per client; everything else is plain
//! state mutated by whoever owns the manager.

use std::path::PathBuf;

pub mod banner;
pub mod client;
pub mod connection;
pub mod debugger;
pub mod elapsed;
pub mod error;
pub mod history;
pub mod info_page;
pub mod input;
pub mod manager;
pub mod router;
pub mod settings;
pub mod shell;
pub mod tabs;
pub mod transport;
pub mod tunnel;
pub mod view;
pub mod wire;

pub use error::{ConsoleError, Result};

/// Directory holding settings and history files.
///
/// `IPYCONSOLE_CONFIG_DIR` overrides the platform config directory.
pub fn config_base_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("IPYCONSOLE_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ipyconsole")
}

/// Append-only console history log.
pub fn default_history_path() -> PathBuf {
    config_base_dir().join("history.py")
}

/// Debugger history database.
pub fn default_pdb_history_path() -> PathBuf {
    config_base_dir().join("pdb_history.sqlite")
}

/// Directory for per-kernel stderr capture files.
pub fn default_stderr_dir() -> PathBuf {
    std::env::temp_dir().join("ipyconsole")
}
