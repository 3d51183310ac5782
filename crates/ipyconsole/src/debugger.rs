//! Debugger sub-state of the shell.
//!
//! While the kernel sits in pdb, every `input_request` whose prompt carries
//! the debugger marker is a pdb prompt. Lines typed by the user and lines
//! sent by the frontend on its own (hidden) share one FIFO queue, so the
//! kernel only ever receives a line when it asked for one.

use std::collections::{BTreeSet, VecDeque};
use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, warn};
use rusqlite::{params, Connection};

/// `do_*` commands of the standard library debugger.
pub const DEFAULT_PDB_COMMANDS: &[&str] = &[
    "a", "alias", "args", "b", "break", "bt", "c", "cl", "clear", "commands", "condition", "cont",
    "continue", "d", "debug", "disable", "display", "down", "enable", "exit", "h", "help",
    "ignore", "interact", "j", "jump", "l", "list", "ll", "longlist", "n", "next", "p", "pp", "q",
    "quit", "r", "restart", "retval", "return", "rv", "run", "s", "source", "step", "tbreak", "u",
    "unalias", "undisplay", "unt", "until", "up", "w", "whatis", "where",
];

/// Persistent debugger history, in the IPython history database layout.
pub struct PdbHistoryStore {
    conn: Connection,
    session: i64,
}

impl PdbHistoryStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {:?}", path))?;
        Self::initialize(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session INTEGER PRIMARY KEY AUTOINCREMENT,
                start TIMESTAMP,
                end TIMESTAMP,
                num_cmds INTEGER,
                remark TEXT
            );
            CREATE TABLE IF NOT EXISTS history (
                session INTEGER,
                line INTEGER,
                source TEXT,
                source_raw TEXT,
                PRIMARY KEY (session, line)
            );
            CREATE TABLE IF NOT EXISTS output_history (
                session INTEGER,
                line INTEGER,
                output TEXT,
                PRIMARY KEY (session, line)
            );
            "#,
        )
        .context("Failed to create pdb history schema")?;

        conn.execute(
            "INSERT INTO sessions (start, num_cmds, remark) VALUES (?1, 0, '')",
            params![chrono::Utc::now().to_rfc3339()],
        )?;
        let session = conn.last_insert_rowid();
        Ok(Self { conn, session })
    }

    pub fn session(&self) -> i64 {
        self.session
    }

    pub fn store(&self, line: i64, source: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO history (session, line, source, source_raw) VALUES (?1, ?2, ?3, ?3)",
            params![self.session, line, source],
        )?;
        self.conn.execute(
            "UPDATE sessions SET num_cmds = num_cmds + 1, end = ?2 WHERE session = ?1",
            params![self.session, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Most recent `max` entries across sessions, oldest first.
    pub fn recent(&self, max: usize) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT source_raw FROM history ORDER BY session DESC, line DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![max as i64], |row| row.get::<_, String>(0))?;
        let mut lines = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        lines.reverse();
        Ok(lines)
    }
}

/// Debugger command history with its optional database.
pub struct PdbHistory {
    entries: Vec<String>,
    store: Option<PdbHistoryStore>,
    max: usize,
}

impl PdbHistory {
    pub fn in_memory(max: usize) -> Self {
        Self {
            entries: Vec::new(),
            store: None,
            max,
        }
    }

    pub fn with_store(store: PdbHistoryStore, max: usize) -> Self {
        let entries = store.recent(max).unwrap_or_else(|e| {
            warn!("[debugger] Could not load pdb history: {}", e);
            Vec::new()
        });
        Self {
            entries,
            store: Some(store),
            max,
        }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    fn push(&mut self, line_number: usize, line: &str) {
        self.entries.push(line.to_string());
        if self.max > 0 && self.entries.len() > self.max {
            let excess = self.entries.len() - self.max;
            self.entries.drain(..excess);
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.store(line_number as i64, line) {
                warn!("[debugger] Failed to store pdb history: {}", e);
            }
        }
    }
}

/// A line waiting for the kernel to ask for input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdbQueued {
    pub line: String,
    pub hidden: bool,
    pub add_history: bool,
}

/// What the shell has to do after a debugger step.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PdbStep {
    /// Line to echo after the visible prompt.
    pub echo: Option<String>,
    /// Line to send now as the `input_reply`.
    pub send: Option<String>,
}

/// Result of a pdb `input_request`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PdbPrompt {
    /// Whether a prompt has to be printed and reading armed.
    pub print_prompt: bool,
    pub step: PdbStep,
}

pub struct DebuggerState {
    depth: usize,
    marker: String,
    use_exclamation_mark: bool,
    commands: BTreeSet<String>,
    queue: VecDeque<PdbQueued>,
    /// The kernel asked for a line that has not been sent yet.
    input_ready: bool,
    /// A visible prompt is waiting for the user.
    waiting_input: bool,
    last_cmd: String,
    input_number: usize,
    saved_input_numbers: Vec<usize>,
    previous_prompt: Option<(String, bool)>,
    history: PdbHistory,
}

impl DebuggerState {
    pub fn new(marker: impl Into<String>, use_exclamation_mark: bool, history: PdbHistory) -> Self {
        Self {
            depth: 0,
            marker: marker.into(),
            use_exclamation_mark,
            commands: DEFAULT_PDB_COMMANDS.iter().map(|c| c.to_string()).collect(),
            queue: VecDeque::new(),
            input_ready: false,
            waiting_input: false,
            last_cmd: String::new(),
            input_number: 0,
            saved_input_numbers: Vec::new(),
            previous_prompt: None,
            history,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_debugging(&self) -> bool {
        self.depth > 0
    }

    pub fn is_waiting_input(&self) -> bool {
        self.waiting_input
    }

    pub fn queued(&self) -> impl Iterator<Item = &PdbQueued> {
        self.queue.iter()
    }

    pub fn history(&self) -> &[String] {
        self.history.entries()
    }

    pub fn last_command(&self) -> &str {
        &self.last_cmd
    }

    /// Replace the known command names, e.g. with the kernel's own list.
    pub fn set_commands<I, S>(&mut self, commands: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let commands: BTreeSet<String> = commands.into_iter().map(Into::into).collect();
        if !commands.is_empty() {
            self.commands = commands;
        }
    }

    pub fn is_pdb_command(&self, name: &str) -> bool {
        self.commands.contains(name)
    }

    /// Debugger depth encoded in `prompt`, if it is a debugger prompt.
    ///
    /// A nested debugger wraps the marker in one pair of parentheses per
    /// extra level: `ipdb> `, `(ipdb>) `, `((ipdb>)) `.
    pub fn prompt_depth(&self, prompt: &str) -> Option<usize> {
        let marker = self.marker.trim();
        if marker.is_empty() {
            return None;
        }
        let mut inner = prompt.trim();
        let mut level = 1;
        while let Some(stripped) = inner
            .strip_prefix('(')
            .and_then(|rest| rest.strip_suffix(')'))
        {
            inner = stripped;
            level += 1;
        }
        (inner == marker).then_some(level)
    }

    /// Enter, leave or change depth. Any change drops queued lines.
    pub fn set_depth(&mut self, depth: usize) {
        if depth == self.depth {
            return;
        }
        while self.saved_input_numbers.len() < depth {
            self.saved_input_numbers.push(self.input_number);
            self.input_number = 0;
        }
        while self.saved_input_numbers.len() > depth {
            if let Some(number) = self.saved_input_numbers.pop() {
                self.input_number = number;
            }
        }
        debug!("[debugger] Depth {} -> {}", self.depth, depth);
        self.depth = depth;
        self.queue.clear();
        if depth == 0 {
            self.input_ready = false;
            self.waiting_input = false;
            self.previous_prompt = None;
        }
    }

    pub fn leave(&mut self) {
        self.set_depth(0);
    }

    /// Numbered prompt shown to the user: `IPdb [3]: `, `(IPdb [1]): `.
    pub fn prompt_text(&self) -> String {
        let nesting = self.depth.saturating_sub(1);
        format!(
            "{}IPdb [{}]{}: ",
            "(".repeat(nesting),
            self.input_number + 1,
            ")".repeat(nesting)
        )
    }

    /// Handle a pdb `input_request`.
    ///
    /// `reading` says whether the previous prompt is still armed for input.
    /// A request with the same prompt as the one already displayed is not
    /// printed again.
    pub fn on_input_request(&mut self, prompt: &str, password: bool, reading: bool) -> PdbPrompt {
        if let Some(depth) = self.prompt_depth(prompt) {
            self.set_depth(depth);
        }
        let current = (prompt.to_string(), password);
        let duplicate = reading && self.previous_prompt.as_ref() == Some(&current);
        self.previous_prompt = Some(current);

        let head_hidden = self.queue.front().is_some_and(|q| q.hidden);
        let print_prompt = !duplicate && !head_hidden;
        if print_prompt || duplicate {
            self.waiting_input = true;
        }
        self.input_ready = true;

        let step = match self.queue.pop_front() {
            Some(next) => self.execute(&next.line, next.hidden, next.add_history),
            None => PdbStep::default(),
        };
        PdbPrompt { print_prompt, step }
    }

    /// Submit a line to the debugger.
    ///
    /// Visible lines typed while no prompt is waiting, and any line while
    /// the kernel has not asked for input, are queued.
    pub fn execute(&mut self, line: &str, hidden: bool, add_history: bool) -> PdbStep {
        let mut step = PdbStep::default();
        if !self.is_debugging() {
            return step;
        }
        let line = if line.trim().is_empty() {
            self.last_cmd.clone()
        } else {
            line.to_string()
        };

        if !hidden {
            if !self.waiting_input {
                self.queue.push_back(PdbQueued {
                    line,
                    hidden: false,
                    add_history,
                });
                return step;
            }
            self.last_cmd = line.clone();
            step.echo = Some(line.clone());
            if add_history {
                self.add_to_history(&line);
            }
            self.waiting_input = false;
        }

        if self.input_ready {
            self.input_ready = false;
            step.send = Some(line);
        } else {
            self.queue.push_back(PdbQueued {
                line,
                hidden: true,
                add_history,
            });
        }
        step
    }

    /// Record `line` unless it is a bare debugger command.
    pub fn add_to_history(&mut self, line: &str) {
        self.input_number += 1;
        let line = line.trim_end();
        if line.is_empty() || self.history.entries().last().map(String::as_str) == Some(line) {
            return;
        }
        let (cmd, args) = match line.split_once(' ') {
            Some((cmd, args)) => (cmd, args),
            None => (line, ""),
        };
        let mut is_pdb_cmd = !cmd.trim().is_empty()
            && !cmd.starts_with('!')
            && self.is_pdb_command(cmd);
        if self.use_exclamation_mark {
            if let Some(name) = cmd.strip_prefix('!') {
                is_pdb_cmd = self.is_pdb_command(name);
            }
        }
        if !cmd.is_empty() && (!is_pdb_cmd || !args.is_empty()) {
            self.history.push(self.input_number, line);
        }
    }

    /// Command that makes the debugger quit.
    pub fn exit_command(&self) -> &'static str {
        "exit"
    }
}
