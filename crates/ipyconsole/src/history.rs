//! Command history: the persistent log and prompt-line browsing.

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use log::{debug, warn};

#[cfg(windows)]
const LINESEP: &str = "\r\n";
#[cfg(not(windows))]
const LINESEP: &str = "\n";

/// Header written to a fresh history file.
pub const INIT_HISTORY: [&str; 2] = [
    "# -*- coding: utf-8 -*-",
    "# *** Console History Log ***",
];

/// Files that already received a session separator from this process.
fn separated_files() -> &'static Mutex<HashSet<PathBuf>> {
    static FILES: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    FILES.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Separator line written once per file per process.
pub fn session_separator() -> String {
    format!(
        "{sep}{sep}## ---({})---",
        chrono::Local::now().format("%a %b %e %H:%M:%S %Y"),
        sep = LINESEP
    )
}

/// Somewhere executed commands are recorded.
pub trait HistoryStore: Send {
    fn entries(&self) -> &[String];

    /// Record a command. Returns whether it was added.
    fn append(&mut self, command: &str) -> bool;
}

/// Normalize a command for storage; `None` means it must not be stored.
fn history_entry(command: &str) -> Option<&str> {
    if command.is_empty() || command == "\n" || command.starts_with("Traceback") {
        return None;
    }
    Some(command.strip_suffix('\n').unwrap_or(command))
}

/// In-memory history, used by debugger sessions and tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryHistory {
    entries: Vec<String>,
}

impl MemoryHistory {
    pub fn new(entries: Vec<String>) -> Self {
        Self { entries }
    }
}

impl HistoryStore for MemoryHistory {
    fn entries(&self) -> &[String] {
        &self.entries
    }

    fn append(&mut self, command: &str) -> bool {
        let Some(entry) = history_entry(command) else {
            return false;
        };
        if self.entries.last().map(String::as_str) == Some(entry) {
            return false;
        }
        self.entries.push(entry.to_string());
        true
    }
}

/// Append-only history file shared by every console of this process.
#[derive(Debug)]
pub struct HistoryLog {
    path: PathBuf,
    entries: Vec<String>,
    max_entries: usize,
}

impl HistoryLog {
    /// Load the log, creating it if needed and truncating it to the cap.
    pub fn load(path: &Path, max_entries: usize) -> std::io::Result<Self> {
        let mut raw: Vec<String> = if path.is_file() {
            let bytes = std::fs::read(path)?;
            String::from_utf8_lossy(&bytes)
                .lines()
                .map(|l| l.trim_end_matches('\r').to_string())
                .collect()
        } else {
            INIT_HISTORY.iter().map(|s| s.to_string()).collect()
        };
        while raw.len() < 2 {
            raw.push(INIT_HISTORY[raw.len()].to_string());
        }

        let mut entries: Vec<String> = raw
            .iter()
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .cloned()
            .collect();

        // Drop the oldest entries, together with the comment lines above them.
        let mut truncated = false;
        while max_entries > 0 && entries.len() >= max_entries {
            entries.remove(0);
            let body = raw.split_off(2);
            let mut body = body.into_iter().skip_while(|l| l.starts_with('#') || l.is_empty());
            body.next();
            raw.extend(body);
            truncated = true;
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if truncated || !path.is_file() {
            std::fs::write(path, raw.join(LINESEP))?;
            debug!("[history] Rewrote {:?} with {} entries", path, entries.len());
        }

        Ok(Self {
            path: path.to_path_buf(),
            entries,
            max_entries,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    fn write_entry(&self, entry: &str) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let first_write = separated_files()
            .lock()
            .map(|mut files| files.insert(self.path.clone()))
            .unwrap_or(false);
        if first_write {
            file.write_all(session_separator().as_bytes())?;
        }
        file.write_all(format!("{}{}", LINESEP, entry).as_bytes())
    }
}

impl HistoryStore for HistoryLog {
    fn entries(&self) -> &[String] {
        &self.entries
    }

    fn append(&mut self, command: &str) -> bool {
        let Some(entry) = history_entry(command) else {
            return false;
        };
        if self.entries.last().map(String::as_str) == Some(entry) {
            return false;
        }
        self.entries.push(entry.to_string());
        if let Err(e) = self.write_entry(entry) {
            warn!("[history] Failed to append to {:?}: {}", self.path, e);
        }
        true
    }
}

/// History store shared by every client of the process.
#[derive(Clone)]
pub struct SharedHistory {
    store: Arc<Mutex<Box<dyn HistoryStore>>>,
}

impl SharedHistory {
    pub fn new(store: impl HistoryStore + 'static) -> Self {
        Self {
            store: Arc::new(Mutex::new(Box::new(store))),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryHistory::default())
    }

    pub fn entries(&self) -> Vec<String> {
        self.store
            .lock()
            .map(|s| s.entries().to_vec())
            .unwrap_or_default()
    }

    pub fn append(&self, command: &str) -> bool {
        match self.store.lock() {
            Ok(mut store) => store.append(command),
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for SharedHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedHistory")
            .field("entries", &self.entries().len())
            .finish()
    }
}

/// Up/Down browsing state for one prompt.
///
/// With an empty prefix (or once whole-line mode has started) each step
/// replaces the line with the next entry. Otherwise the text left of the
/// cursor is a prefix and matching entries complete the line in place.
#[derive(Debug, Default, Clone)]
pub struct HistoryBrowser {
    index: Option<usize>,
    whole_line: bool,
}

/// Line contents after a browse step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrowseResult {
    pub line: String,
    pub cursor: usize,
}

impl HistoryBrowser {
    pub fn reset(&mut self) {
        self.index = None;
    }

    pub fn is_whole_line(&self) -> bool {
        self.whole_line
    }

    /// Step through `history`. `cursor` is a byte offset into `line`.
    pub fn browse(
        &mut self,
        history: &[String],
        line: &str,
        cursor: usize,
        backward: bool,
    ) -> Option<BrowseResult> {
        if cursor < line.len() && self.whole_line {
            self.whole_line = false;
        }
        let to_cursor = &line[..cursor];
        let start = self.index.unwrap_or(history.len());

        if to_cursor.is_empty() || self.whole_line {
            let next = if backward {
                start.checked_sub(1)
            } else {
                Some(start + 1)
            };
            self.whole_line = true;
            return match next {
                Some(idx) if idx < history.len() => {
                    self.index = Some(idx);
                    let entry = history[idx].clone();
                    let cursor = entry.len();
                    Some(BrowseResult {
                        line: entry,
                        cursor,
                    })
                }
                Some(_) => {
                    // Walked past the newest entry: back to an empty line.
                    self.index = Some(history.len());
                    Some(BrowseResult {
                        line: String::new(),
                        cursor: 0,
                    })
                }
                None => {
                    self.index = Some(0);
                    history.first().map(|entry| BrowseResult {
                        line: entry.clone(),
                        cursor: entry.len(),
                    })
                }
            };
        }

        let len = history.len();
        for step in 1..=len {
            let idx = if backward {
                (start + len * step - step) % len
            } else {
                (start + step) % len
            };
            let entry = &history[idx];
            if entry.starts_with(to_cursor) {
                self.index = Some(idx);
                let mut new_line = to_cursor.to_string();
                new_line.push_str(&entry[to_cursor.len()..]);
                return Some(BrowseResult {
                    line: new_line,
                    cursor,
                });
            }
        }
        None
    }
}
