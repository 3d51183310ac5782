//! The console's prompt state machine.
//!
//! The shell turns routed kernel messages and key presses into view
//! updates, requests for the kernel, and signals for the client. It never
//! talks to the kernel itself: requests are queued and drained by the
//! owner, which keeps this module free of I/O.
//!
//! ```text
//!          execute             input_request            commit
//!   Idle ───────────▶ Executing ──────────────▶ AwaitingInput ──▶ Executing
//!    ▲                   │  ▲                                       │
//!    └──── idle ─────────┘  └──── commit ◀── AwaitingPdbInput ◀─────┘
//!                                          (pdb input_request)
//! ```

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use jupyter_protocol::JupyterMessage;
use log::{debug, warn};
use regex::Regex;

use crate::debugger::{DebuggerState, PdbHistory, PdbStep};
use crate::error::{ConsoleError, Result};
use crate::history::{HistoryBrowser, HistoryStore, MemoryHistory};
use crate::input::InputBuffer;
use crate::router::{Completion, ExecutionReply, Output, Routed};
use crate::settings::ConsoleSettings;
use crate::view::{ConsoleView, TextKind};

/// Where the prompt is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellMode {
    Idle,
    Executing,
    /// `input()` in user code is waiting for a line.
    AwaitingInput,
    AwaitingPdbInput,
}

/// Keys the shell reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Char(char),
    Enter,
    /// Newline inside the input instead of submitting it.
    ShiftEnter,
    Backspace,
    Delete,
    Left,
    Right,
    ShiftLeft,
    ShiftRight,
    Up,
    Down,
    Home,
    End,
    Escape,
    Ctrl(char),
    /// Command key chords on macOS.
    Cmd(char),
}

/// Something the owner has to send to the kernel.
#[derive(Debug, Clone)]
pub enum ShellRequest {
    Execute(String),
    InputReply {
        value: String,
        request: JupyterMessage,
    },
    Interrupt,
}

/// Something the client reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellSignal {
    /// A visible execution was submitted.
    Executing(String),
    /// The visible execution finished and its output is rendered.
    Executed,
    PromptReady,
    DebugDepth(usize),
    GoToError { file: String, line: u32 },
}

/// Shell settings taken from [`ConsoleSettings`].
#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub pdb_prompt: String,
    pub pdb_use_exclamation_mark: bool,
    pub other_output_prefix: String,
    pub flush_interval: Duration,
    pub show_modules_message: bool,
    /// Cmd+. interrupts and Ctrl+C only copies.
    pub macos_keys: bool,
}

impl ShellConfig {
    pub fn from_settings(settings: &ConsoleSettings) -> Self {
        Self {
            pdb_prompt: settings.pdb_prompt.clone(),
            pdb_use_exclamation_mark: settings.pdb_use_exclamation_mark,
            other_output_prefix: settings.other_output_prefix.clone(),
            flush_interval: settings.flush_interval,
            show_modules_message: settings.show_modules_message,
            macos_keys: cfg!(target_os = "macos"),
        }
    }
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self::from_settings(&ConsoleSettings::default())
    }
}

pub const MODULES_MESSAGE: &str = "<br>It seems you're trying to use a module that is not \
installed in the environment this console runs in. Install it there and restart the \
kernel to use it.<br>";

// ============================================================================
// Stream buffering
// ============================================================================

/// stdout/stderr text waiting to be rendered.
///
/// Text is held for at most one flush interval so bursts of small writes
/// reach the view as a few large appends.
#[derive(Debug)]
pub struct StreamBuffer {
    chunks: Vec<(bool, String)>,
    first_at: Option<Instant>,
    interval: Duration,
}

impl StreamBuffer {
    pub fn new(interval: Duration) -> Self {
        Self {
            chunks: Vec::new(),
            first_at: None,
            interval,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Buffer `text`; returns whether the buffer is due for a flush.
    pub fn push(&mut self, stderr: bool, text: &str, now: Instant) -> bool {
        match self.chunks.last_mut() {
            Some((last_stderr, last)) if *last_stderr == stderr => last.push_str(text),
            _ => self.chunks.push((stderr, text.to_string())),
        }
        self.first_at.get_or_insert(now);
        self.is_due(now)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.first_at
            .is_some_and(|first| now.saturating_duration_since(first) >= self.interval)
    }

    pub fn take(&mut self) -> Vec<(bool, String)> {
        self.first_at = None;
        std::mem::take(&mut self.chunks)
    }

    pub fn discard(&mut self) {
        self.take();
    }
}

// ============================================================================
// Traceback links
// ============================================================================

/// Finds `file:line` locations in rendered output.
pub trait LinkScanner: Send {
    fn link_at(&self, line: &str) -> Option<(String, u32)>;
}

/// Scanner for Python and IPython traceback frames.
pub struct TracebackLinks {
    ansi: Regex,
    patterns: Vec<Regex>,
}

impl TracebackLinks {
    pub fn new() -> Result<Self> {
        let compile = |p: &str| Regex::new(p).map_err(ConsoleError::connection);
        Ok(Self {
            ansi: compile(r"\x1b\[[0-9;]*m")?,
            patterns: vec![
                compile(r#"File "(.*)", line (\d+)"#)?,
                compile(r"File (.*):(\d+)")?,
            ],
        })
    }
}

impl LinkScanner for TracebackLinks {
    fn link_at(&self, line: &str) -> Option<(String, u32)> {
        let plain = self.ansi.replace_all(line, "");
        self.patterns.iter().find_map(|re| {
            let caps = re.captures(&plain)?;
            let file = caps.get(1)?.as_str().trim().to_string();
            let line = caps.get(2)?.as_str().parse().ok()?;
            Some((file, line))
        })
    }
}

/// Pattern matching console prompts at the start of a line.
pub fn prompt_pattern(other_output_prefix: &str) -> Result<Regex> {
    Regex::new(&format!(
        r"^({})?([ \t]*\(*IPdb \[\d+\]\)*: |[ \t]*In \[\d+\]: |[ \t]*   \.\.\.+: )",
        regex::escape(other_output_prefix)
    ))
    .map_err(ConsoleError::connection)
}

// ============================================================================
// Shell
// ============================================================================

pub struct Shell {
    view: Box<dyn ConsoleView>,
    config: ShellConfig,
    mode: ShellMode,
    buffer: InputBuffer,
    /// A prompt is displayed and accepts input.
    reading: bool,
    password: bool,
    input_request: Option<JupyterMessage>,
    debugger: DebuggerState,
    history: MemoryHistory,
    browser: HistoryBrowser,
    stream: StreamBuffer,
    next_count: u32,
    paste_queue: VecDeque<String>,
    links: Box<dyn LinkScanner>,
    prompt_re: Option<Regex>,
    traceback_lines: Vec<String>,
    modules_message_shown: bool,
    requests: Vec<ShellRequest>,
    signals: Vec<ShellSignal>,
}

impl Shell {
    pub fn new(
        view: Box<dyn ConsoleView>,
        config: ShellConfig,
        history: Vec<String>,
        pdb_history: PdbHistory,
        links: Box<dyn LinkScanner>,
    ) -> Self {
        let prompt_re = prompt_pattern(&config.other_output_prefix)
            .map_err(|e| warn!("[shell] {}", e))
            .ok();
        Self {
            view,
            debugger: DebuggerState::new(
                config.pdb_prompt.clone(),
                config.pdb_use_exclamation_mark,
                pdb_history,
            ),
            stream: StreamBuffer::new(config.flush_interval),
            config,
            mode: ShellMode::Idle,
            buffer: InputBuffer::new(),
            reading: false,
            password: false,
            input_request: None,
            history: MemoryHistory::new(history),
            browser: HistoryBrowser::default(),
            next_count: 1,
            paste_queue: VecDeque::new(),
            links,
            prompt_re,
            traceback_lines: Vec::new(),
            modules_message_shown: false,
            requests: Vec::new(),
            signals: Vec::new(),
        }
    }

    pub fn mode(&self) -> ShellMode {
        self.mode
    }

    pub fn is_reading(&self) -> bool {
        self.reading
    }

    /// Reading input that should not be echoed.
    pub fn wants_password(&self) -> bool {
        self.reading && self.password
    }

    pub fn input_text(&self) -> &str {
        self.buffer.text()
    }

    pub fn debugger(&self) -> &DebuggerState {
        &self.debugger
    }

    pub fn debugger_mut(&mut self) -> &mut DebuggerState {
        &mut self.debugger
    }

    pub fn is_debugging(&self) -> bool {
        self.debugger.is_debugging()
    }

    pub fn history(&self) -> &[String] {
        self.history.entries()
    }

    pub fn traceback_lines(&self) -> &[String] {
        &self.traceback_lines
    }

    pub fn next_execution_count(&self) -> u32 {
        self.next_count
    }

    pub fn take_requests(&mut self) -> Vec<ShellRequest> {
        std::mem::take(&mut self.requests)
    }

    pub fn take_signals(&mut self) -> Vec<ShellSignal> {
        std::mem::take(&mut self.signals)
    }

    pub fn view_mut(&mut self) -> &mut dyn ConsoleView {
        self.view.as_mut()
    }

    fn render_input(&mut self) {
        if !self.reading {
            return;
        }
        if self.password {
            let masked = "*".repeat(self.buffer.text().chars().count());
            let cursor = masked.len();
            self.view.set_input(&masked, cursor);
        } else {
            self.view.set_input(self.buffer.text(), self.buffer.cursor());
        }
    }

    fn prompt_text(&self) -> String {
        if self.is_debugging() {
            self.debugger.prompt_text()
        } else {
            format!("In [{}]: ", self.next_count)
        }
    }

    /// Show a fresh prompt and start reading.
    pub fn show_prompt(&mut self) {
        self.flush_stream();
        let prompt = self.prompt_text();
        self.view.show_prompt(&prompt);
        self.reading = true;
        self.password = false;
        self.browser.reset();
        self.render_input();
        self.signals.push(ShellSignal::PromptReady);
    }

    // ------------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------------

    pub fn append_text(&mut self, text: &str, kind: TextKind) {
        self.flush_stream();
        self.view.append_text(text, kind);
    }

    pub fn append_html(&mut self, html: &str) {
        self.flush_stream();
        self.view.append_html(html);
    }

    fn flush_stream(&mut self) {
        for (stderr, text) in self.stream.take() {
            let kind = if stderr {
                TextKind::Stderr
            } else if !self.config.other_output_prefix.is_empty()
                && text.starts_with(&self.config.other_output_prefix)
            {
                TextKind::Notice
            } else {
                TextKind::Stdout
            };
            self.view.append_text(&text, kind);
        }
    }

    /// Flush buffered stream text whose interval elapsed.
    pub fn tick(&mut self, now: Instant) {
        if self.stream.is_due(now) {
            self.flush_stream();
        }
    }

    fn show_output(&mut self, output: Output, now: Instant) {
        match output {
            Output::Stream { stderr, text } => {
                if self.stream.push(stderr, &text, now) {
                    self.flush_stream();
                }
            }
            Output::Result {
                execution_count,
                text,
                html,
            } => {
                self.flush_stream();
                let count = execution_count.unwrap_or(self.next_count);
                match (text, html) {
                    (Some(text), _) => self
                        .view
                        .append_text(&format!("Out[{}]: {}\n", count, text), TextKind::Result),
                    (None, Some(html)) => self.view.append_html(&html),
                    (None, None) => {}
                }
            }
            Output::Display { text, html } => {
                self.flush_stream();
                match (html, text) {
                    (Some(html), _) => self.view.append_html(&html),
                    (None, Some(text)) => self
                        .view
                        .append_text(&format!("{}\n", text), TextKind::Result),
                    (None, None) => {}
                }
            }
            Output::Error {
                ename,
                evalue,
                traceback,
            } => {
                self.flush_stream();
                let rendered = if traceback.is_empty() {
                    format!("{}: {}\n", ename, evalue)
                } else {
                    format!("{}\n", traceback.join("\n"))
                };
                self.traceback_lines = rendered.lines().map(str::to_string).collect();
                self.view.append_text(&rendered, TextKind::Traceback);
                if self.config.show_modules_message
                    && !self.modules_message_shown
                    && (ename == "ModuleNotFoundError" || ename == "ImportError")
                {
                    self.modules_message_shown = true;
                    self.view.append_html(MODULES_MESSAGE);
                }
            }
            Output::ClearOutput { .. } => self.stream.discard(),
            Output::Input { .. } => {}
        }
    }

    /// Activate a rendered line; emits `GoToError` when it names a location.
    pub fn click_line(&mut self, line: &str) -> bool {
        match self.links.link_at(line) {
            Some((file, line)) => {
                self.signals.push(ShellSignal::GoToError { file, line });
                true
            }
            None => false,
        }
    }

    /// Locations named in the last traceback, outermost first.
    pub fn traceback_links(&self) -> Vec<(String, u32)> {
        self.traceback_lines
            .iter()
            .filter_map(|l| self.links.link_at(l))
            .collect()
    }

    // ------------------------------------------------------------------------
    // Kernel messages
    // ------------------------------------------------------------------------

    pub fn on_routed(&mut self, routed: Routed, now: Instant) {
        match routed {
            Routed::Output(output) => self.show_output(output, now),
            Routed::InputRequest {
                prompt,
                password,
                request,
            } => self.on_input_request(&prompt, password, request),
            Routed::Reply(reply) => self.on_reply(reply),
            Routed::Idle => self.on_idle(),
            Routed::HiddenFinished | Routed::KernelStatus(_) => {}
        }
    }

    fn on_reply(&mut self, reply: ExecutionReply) {
        if let Some(page) = reply.page {
            self.flush_stream();
            self.view.append_text(&format!("{}\n", page), TextKind::Result);
        }
        if let Some(count) = reply.execution_count {
            self.next_count = count + 1;
        }
        if reply.aborted {
            debug!("[shell] Execution aborted");
        }
    }

    fn on_idle(&mut self) {
        if self.is_debugging() {
            self.debugger.leave();
            self.signals.push(ShellSignal::DebugDepth(0));
        }
        self.mode = ShellMode::Idle;
        self.input_request = None;
        self.show_prompt();
        self.signals.push(ShellSignal::Executed);

        if let Some(next) = self.paste_queue.pop_front() {
            if let Err(e) = self.execute(&next) {
                warn!("[shell] Queued line not executed: {}", e);
            }
        }
    }

    fn on_input_request(&mut self, prompt: &str, password: bool, request: JupyterMessage) {
        self.flush_stream();
        self.input_request = Some(request);

        if self.debugger.prompt_depth(prompt).is_none() {
            self.mode = ShellMode::AwaitingInput;
            self.view.show_prompt(prompt);
            self.reading = true;
            self.password = password;
            self.render_input();
            return;
        }

        let before = self.debugger.depth();
        let reading = self.reading && self.mode == ShellMode::AwaitingPdbInput;
        let outcome = self.debugger.on_input_request(prompt, password, reading);
        if self.debugger.depth() != before {
            self.signals.push(ShellSignal::DebugDepth(self.debugger.depth()));
        }
        self.mode = ShellMode::AwaitingPdbInput;
        if outcome.print_prompt {
            let text = self.debugger.prompt_text();
            self.view.show_prompt(&text);
            self.reading = true;
            self.password = password;
            self.browser.reset();
            self.render_input();
            self.signals.push(ShellSignal::PromptReady);
        }
        self.apply_pdb_step(outcome.step);
    }

    fn apply_pdb_step(&mut self, step: PdbStep) {
        if let Some(line) = &step.echo {
            self.view.commit_input(line);
            self.reading = false;
            self.mode = ShellMode::Executing;
        }
        if let Some(value) = step.send {
            match self.input_request.take() {
                Some(request) => {
                    if step.echo.is_none() && !self.reading {
                        self.mode = ShellMode::Executing;
                    }
                    self.requests.push(ShellRequest::InputReply { value, request });
                }
                None => warn!("[shell] Debugger line without an input request"),
            }
        }
    }

    /// Kernel restarted: drop every in-flight state and start over.
    pub fn reset_after_restart(&mut self) {
        self.flush_stream();
        if self.is_debugging() {
            self.debugger.leave();
            self.signals.push(ShellSignal::DebugDepth(0));
        }
        self.mode = ShellMode::Idle;
        self.reading = false;
        self.password = false;
        self.input_request = None;
        self.paste_queue.clear();
        self.next_count = 1;
    }

    // ------------------------------------------------------------------------
    // Submitting code
    // ------------------------------------------------------------------------

    /// Run `code` as if typed at the prompt.
    ///
    /// While debugging the line goes to the debugger instead.
    pub fn execute(&mut self, code: &str) -> Result<()> {
        if self.is_debugging() {
            self.pdb_execute(code, false, true);
            return Ok(());
        }
        if self.mode != ShellMode::Idle {
            return Err(ConsoleError::RequestWhileBusy);
        }
        if is_clear_magic(code) {
            self.history.append(code);
            self.stream.discard();
            self.view.clear();
            self.show_prompt();
            return Ok(());
        }
        if self.reading {
            self.view.commit_input(code);
        }
        self.reading = false;
        self.mode = ShellMode::Executing;
        self.history.append(code);
        self.browser.reset();
        self.requests.push(ShellRequest::Execute(code.to_string()));
        self.signals.push(ShellSignal::Executing(code.to_string()));
        Ok(())
    }

    /// Send a line to the debugger.
    pub fn pdb_execute(&mut self, line: &str, hidden: bool, add_history: bool) {
        let step = self.debugger.execute(line, hidden, add_history);
        self.apply_pdb_step(step);
    }

    /// Leave the debugger, interrupting the kernel if it is busy.
    pub fn stop_debugging(&mut self) {
        if !self.is_debugging() {
            return;
        }
        if !self.debugger.is_waiting_input() {
            self.requests.push(ShellRequest::Interrupt);
        }
        let exit = self.debugger.exit_command();
        self.pdb_execute(exit, true, false);
    }

    pub fn interrupt(&mut self) {
        self.requests.push(ShellRequest::Interrupt);
    }

    fn commit(&mut self) {
        match self.mode {
            ShellMode::Idle if self.reading => {
                let code = self.buffer.take();
                if code.trim().is_empty() {
                    self.view.commit_input(&code);
                    self.show_prompt();
                    return;
                }
                if let Err(e) = self.execute(&code) {
                    warn!("[shell] {}", e);
                }
            }
            ShellMode::AwaitingInput => {
                let value = self.buffer.take();
                let shown = if self.password {
                    String::new()
                } else {
                    value.clone()
                };
                self.view.commit_input(&shown);
                self.reading = false;
                self.password = false;
                self.mode = ShellMode::Executing;
                match self.input_request.take() {
                    Some(request) => self.requests.push(ShellRequest::InputReply { value, request }),
                    None => warn!("[shell] Input committed without a request"),
                }
            }
            _ if self.is_debugging() => {
                let line = self.buffer.take();
                self.pdb_execute(&line, false, true);
                self.render_input();
            }
            // Typed ahead while the kernel is busy: keep it for the next prompt.
            _ => {}
        }
    }

    // ------------------------------------------------------------------------
    // Keyboard
    // ------------------------------------------------------------------------

    pub fn key(&mut self, key: Key) {
        match key {
            Key::Char(c) => self.buffer.insert(c.encode_utf8(&mut [0; 4])),
            Key::ShiftEnter => self.buffer.insert("\n"),
            Key::Enter => {
                self.commit();
                return;
            }
            Key::Backspace => self.buffer.backspace(),
            Key::Delete => self.buffer.delete(),
            Key::Left => self.buffer.move_left(false),
            Key::Right => self.buffer.move_right(false),
            Key::ShiftLeft => self.buffer.move_left(true),
            Key::ShiftRight => self.buffer.move_right(true),
            Key::Home => self.buffer.home(false),
            Key::End => self.buffer.end(false),
            Key::Up => {
                if !self.buffer.move_up() {
                    self.browse_history(true);
                }
            }
            Key::Down => {
                if !self.buffer.move_down() {
                    self.browse_history(false);
                }
            }
            Key::Escape => self.buffer.clear(),
            Key::Ctrl('c') if self.config.macos_keys => {
                self.copy_selection();
            }
            Key::Ctrl('c') => {
                if !self.copy_selection() {
                    self.interrupt();
                }
            }
            Key::Cmd('.') if self.config.macos_keys => self.interrupt(),
            Key::Cmd('c') => {
                self.copy_selection();
            }
            Key::Ctrl('l') => {
                self.clear_console();
                return;
            }
            Key::Ctrl(_) | Key::Cmd(_) => {}
        }
        self.render_input();
    }

    fn copy_selection(&mut self) -> bool {
        match self.buffer.selected_text() {
            Some(text) => {
                let text = text.to_string();
                self.view.copy_to_clipboard(&text);
                true
            }
            None => false,
        }
    }

    fn browse_history(&mut self, backward: bool) {
        let entries: Vec<String> = if self.is_debugging() {
            self.debugger.history().to_vec()
        } else {
            self.history.entries().to_vec()
        };
        if let Some(result) =
            self.browser
                .browse(&entries, self.buffer.text(), self.buffer.cursor(), backward)
        {
            self.buffer.set(&result.line, result.cursor);
        }
    }

    pub fn clear_line(&mut self) {
        self.buffer.clear();
        self.render_input();
    }

    /// Clear the display and redraw the prompt with the pending input.
    pub fn clear_console(&mut self) {
        self.flush_stream();
        self.view.clear();
        if self.reading {
            let prompt = match self.mode {
                ShellMode::AwaitingInput => String::new(),
                _ => self.prompt_text(),
            };
            self.view.show_prompt(&prompt);
            self.render_input();
        }
    }

    /// Insert pasted text.
    ///
    /// Multi-line text runs line by line: the text left of the cursor
    /// joins the first pasted line, and the text right of it stays in the
    /// input with the cursor at its end.
    pub fn paste(&mut self, text: &str) {
        let text = text.replace("\r\n", "\n");
        if !text.contains('\n') {
            self.buffer.insert(&text);
            self.render_input();
            return;
        }

        let mut lines: Vec<String> = text
            .split('\n')
            .map(|l| self.strip_prompt(l).to_string())
            .collect();
        if lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        let (before, after) = self.buffer.split_at_cursor();
        let (before, after) = (before.to_string(), after.to_string());
        if let Some(first) = lines.first_mut() {
            first.insert_str(0, &before);
        }
        self.buffer.set(&after, after.len());

        for line in lines {
            if self.is_debugging() {
                self.pdb_execute(&line, false, true);
            } else if self.mode == ShellMode::Idle && self.reading && self.paste_queue.is_empty() {
                if let Err(e) = self.execute(&line) {
                    warn!("[shell] {}", e);
                }
            } else {
                self.paste_queue.push_back(line);
            }
        }
        self.render_input();
    }

    /// Input text and cursor, the cursor counted in characters as the
    /// wire protocol expects.
    pub fn completion_request(&self) -> (String, usize) {
        let (before, _) = self.buffer.split_at_cursor();
        (self.buffer.text().to_string(), before.chars().count())
    }

    /// Insert a `complete_reply` into the input.
    ///
    /// One match replaces the completed span. Several matches insert their
    /// common prefix and are listed above a fresh prompt.
    pub fn apply_completion(&mut self, completion: &Completion) -> bool {
        let Some(first) = completion.matches.first() else {
            return false;
        };
        let text = self.buffer.text().to_string();
        let start = char_to_byte(&text, completion.cursor_start);
        let end = char_to_byte(&text, completion.cursor_end).max(start);
        let insert = if completion.matches.len() == 1 {
            first.clone()
        } else {
            common_prefix(&completion.matches)
        };

        if completion.matches.len() > 1 && self.reading {
            self.view
                .append_text(&format!("\n{}\n", completion.matches.join("  ")), TextKind::Notice);
            let prompt = self.prompt_text();
            self.view.show_prompt(&prompt);
        }
        if insert.len() < end - start {
            self.render_input();
            return false;
        }
        let mut updated = String::with_capacity(text.len() + insert.len());
        updated.push_str(&text[..start]);
        updated.push_str(&insert);
        updated.push_str(&text[end..]);
        self.buffer.set(&updated, start + insert.len());
        self.render_input();
        true
    }

    /// Remove a leading console prompt from a copied line.
    pub fn strip_prompt<'a>(&self, line: &'a str) -> &'a str {
        match self.prompt_re.as_ref().and_then(|re| re.find(line)) {
            Some(m) => &line[m.end()..],
            None => line,
        }
    }
}

/// `%clear` and `%cls` only touch the view and never reach the kernel.
fn is_clear_magic(code: &str) -> bool {
    matches!(code.trim(), "%clear" | "%cls")
}

fn char_to_byte(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len())
}

fn common_prefix(words: &[String]) -> String {
    let Some(first) = words.first() else {
        return String::new();
    };
    let mut len = first.len();
    for word in &words[1..] {
        len = first
            .char_indices()
            .zip(word.chars())
            .take_while(|((_, a), b)| a == b)
            .last()
            .map(|((i, a), _)| i + a.len_utf8())
            .unwrap_or(0)
            .min(len);
    }
    first[..len].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::{Transcript, ViewItem};
    use crate::wire;
    use serde_json::json;

    fn shell() -> (Shell, Transcript) {
        let record = Transcript::new();
        let mut config = ShellConfig::default();
        config.macos_keys = false;
        let shell = Shell::new(
            Box::new(record.clone()),
            config,
            vec!["import os".to_string()],
            PdbHistory::in_memory(50),
            Box::new(TracebackLinks::new().unwrap()),
        );
        (shell, record)
    }

    fn type_line(shell: &mut Shell, text: &str) {
        for c in text.chars() {
            shell.key(Key::Char(c));
        }
    }

    fn input_request(prompt: &str) -> Routed {
        let parent = wire::execute_request("x", false, Default::default(), true);
        Routed::InputRequest {
            prompt: prompt.to_string(),
            password: false,
            request: wire::child_message(
                "input_request",
                json!({"prompt": prompt, "password": false}),
                Some(&parent),
            )
            .unwrap(),
        }
    }

    fn reply(count: u32) -> Routed {
        Routed::Reply(ExecutionReply {
            ok: true,
            aborted: false,
            execution_count: Some(count),
            page: None,
        })
    }

    #[test]
    fn test_execute_and_idle_cycle() {
        let (mut shell, record) = shell();
        shell.show_prompt();
        type_line(&mut shell, "1+1");
        assert_eq!(record.input(), ("1+1".to_string(), 3));
        shell.key(Key::Enter);

        assert_eq!(shell.mode(), ShellMode::Executing);
        assert!(matches!(
            &shell.take_requests()[..],
            [ShellRequest::Execute(code)] if code == "1+1"
        ));
        let now = Instant::now();
        shell.on_routed(
            Routed::Output(Output::Result {
                execution_count: Some(1),
                text: Some("2".to_string()),
                html: None,
            }),
            now,
        );
        shell.on_routed(reply(1), now);
        shell.on_routed(Routed::Idle, now);

        assert_eq!(shell.mode(), ShellMode::Idle);
        assert_eq!(record.prompts(), vec!["In [1]: ", "In [2]: "]);
        assert!(record.contains("Out[1]: 2"));
        let signals = shell.take_signals();
        let executed = signals.iter().position(|s| *s == ShellSignal::Executed);
        let executing = signals
            .iter()
            .position(|s| matches!(s, ShellSignal::Executing(_)));
        assert!(executing < executed);
        assert_eq!(shell.history(), &["import os", "1+1"]);
    }

    #[test]
    fn test_execute_while_busy_rejected() {
        let (mut shell, _) = shell();
        shell.show_prompt();
        shell.execute("a").unwrap();
        assert!(matches!(
            shell.execute("b"),
            Err(ConsoleError::RequestWhileBusy)
        ));
    }

    #[test]
    fn test_stream_flushes_on_interval_and_prompt() {
        let (mut shell, record) = shell();
        shell.show_prompt();
        shell.execute("print('a')").unwrap();
        let t0 = Instant::now();
        shell.on_routed(
            Routed::Output(Output::Stream {
                stderr: false,
                text: "a".to_string(),
            }),
            t0,
        );
        shell.on_routed(
            Routed::Output(Output::Stream {
                stderr: false,
                text: "b".to_string(),
            }),
            t0 + Duration::from_millis(10),
        );
        assert!(!record.contains("ab"));
        shell.tick(t0 + Duration::from_millis(60));
        assert!(record.items().contains(&ViewItem::Text(TextKind::Stdout, "ab".to_string())));

        shell.on_routed(
            Routed::Output(Output::Stream {
                stderr: true,
                text: "oops".to_string(),
            }),
            t0 + Duration::from_millis(70),
        );
        shell.on_routed(Routed::Idle, t0 + Duration::from_millis(71));
        let items = record.items();
        let err = items
            .iter()
            .position(|i| *i == ViewItem::Text(TextKind::Stderr, "oops".to_string()))
            .unwrap();
        let prompt = items
            .iter()
            .rposition(|i| matches!(i, ViewItem::Prompt(_)))
            .unwrap();
        assert!(err < prompt);
    }

    #[test]
    fn test_input_request_and_reply() {
        let (mut shell, record) = shell();
        shell.show_prompt();
        shell.execute("input('Name: ')").unwrap();
        shell.take_requests();
        shell.on_routed(input_request("Name: "), Instant::now());
        assert_eq!(shell.mode(), ShellMode::AwaitingInput);
        type_line(&mut shell, "Ada");
        shell.key(Key::Enter);
        assert_eq!(shell.mode(), ShellMode::Executing);
        assert!(matches!(
            &shell.take_requests()[..],
            [ShellRequest::InputReply { value, .. }] if value == "Ada"
        ));
        assert!(record.prompts().contains(&"Name: ".to_string()));
    }

    #[test]
    fn test_pdb_prompt_and_command() {
        let (mut shell, record) = shell();
        shell.show_prompt();
        shell.execute("debugfile('t.py')").unwrap();
        shell.take_requests();
        shell.on_routed(input_request("ipdb> "), Instant::now());

        assert_eq!(shell.mode(), ShellMode::AwaitingPdbInput);
        assert!(shell.is_debugging());
        assert_eq!(record.prompts().last().unwrap(), "IPdb [1]: ");
        assert!(shell.take_signals().contains(&ShellSignal::DebugDepth(1)));

        type_line(&mut shell, "n");
        shell.key(Key::Enter);
        assert!(matches!(
            &shell.take_requests()[..],
            [ShellRequest::InputReply { value, .. }] if value == "n"
        ));
        assert_eq!(shell.mode(), ShellMode::Executing);

        shell.on_routed(Routed::Idle, Instant::now());
        assert!(!shell.is_debugging());
        assert_eq!(shell.mode(), ShellMode::Idle);
    }

    #[test]
    fn test_pdb_paste_queues_lines() {
        let (mut shell, _) = shell();
        shell.show_prompt();
        shell.execute("debug").unwrap();
        shell.take_requests();
        shell.on_routed(input_request("ipdb> "), Instant::now());

        shell.paste("a = 1\nb = 2\nc = 3\nd = 4\n");
        let sent = shell.take_requests();
        assert!(matches!(&sent[..], [ShellRequest::InputReply { value, .. }] if value == "a = 1"));
        assert_eq!(shell.debugger().queued().count(), 3);

        for expected in ["b = 2", "c = 3", "d = 4"] {
            shell.on_routed(input_request("ipdb> "), Instant::now());
            assert!(matches!(
                &shell.take_requests()[..],
                [ShellRequest::InputReply { value, .. }] if value == expected
            ));
        }
        assert_eq!(shell.debugger().queued().count(), 0);
    }

    #[test]
    fn test_paste_keeps_text_after_cursor() {
        let (mut shell, record) = shell();
        shell.show_prompt();
        type_line(&mut shell, "x = ");
        type_line(&mut shell, "#end");
        for _ in 0..4 {
            shell.key(Key::Left);
        }
        shell.paste("1\ny = 2");
        assert!(matches!(
            &shell.take_requests()[..],
            [ShellRequest::Execute(code)] if code == "x = 1"
        ));
        assert_eq!(shell.input_text(), "#end");

        let now = Instant::now();
        shell.on_routed(reply(1), now);
        shell.on_routed(Routed::Idle, now);
        assert!(matches!(
            &shell.take_requests()[..],
            [ShellRequest::Execute(code)] if code == "y = 2"
        ));
        assert_eq!(record.input().0, "");
    }

    #[test]
    fn test_paste_strips_prompts() {
        let (mut shell, _) = shell();
        shell.show_prompt();
        shell.paste("In [3]: a = 1\n   ...: b = 2\n");
        assert!(matches!(
            &shell.take_requests()[..],
            [ShellRequest::Execute(code)] if code == "a = 1"
        ));
    }

    #[test]
    fn test_ctrl_c_copies_selection_or_interrupts() {
        let (mut shell, record) = shell();
        shell.show_prompt();
        type_line(&mut shell, "abc");
        shell.key(Key::ShiftLeft);
        shell.key(Key::Ctrl('c'));
        assert!(record.items().contains(&ViewItem::Copied("c".to_string())));
        assert!(shell.take_requests().is_empty());

        shell.key(Key::End);
        shell.key(Key::Ctrl('c'));
        assert!(matches!(&shell.take_requests()[..], [ShellRequest::Interrupt]));
    }

    #[test]
    fn test_macos_keys() {
        let (mut shell, _) = shell();
        shell.config.macos_keys = true;
        shell.show_prompt();
        shell.key(Key::Ctrl('c'));
        assert!(shell.take_requests().is_empty());
        shell.key(Key::Cmd('.'));
        assert!(matches!(&shell.take_requests()[..], [ShellRequest::Interrupt]));
    }

    #[test]
    fn test_history_browsing_at_prompt() {
        let (mut shell, record) = shell();
        shell.show_prompt();
        shell.key(Key::Up);
        assert_eq!(record.input().0, "import os");
        shell.key(Key::Down);
        assert_eq!(record.input().0, "");
    }

    #[test]
    fn test_traceback_links_and_modules_hint() {
        let (mut shell, record) = shell();
        shell.show_prompt();
        shell.execute("import missing").unwrap();
        shell.on_routed(
            Routed::Output(Output::Error {
                ename: "ModuleNotFoundError".to_string(),
                evalue: "No module named 'missing'".to_string(),
                traceback: vec![
                    "\x1b[0;31mTraceback\x1b[0m".to_string(),
                    "  File \"/tmp/t.py\", line 3, in <module>".to_string(),
                    "File /tmp/u.py:7, in f()".to_string(),
                ],
            }),
            Instant::now(),
        );
        assert_eq!(
            shell.traceback_links(),
            vec![("/tmp/t.py".to_string(), 3), ("/tmp/u.py".to_string(), 7)]
        );
        assert!(record.contains("It seems you're trying to use a module"));

        assert!(shell.click_line("  File \"/tmp/t.py\", line 3, in <module>"));
        assert!(shell.take_signals().contains(&ShellSignal::GoToError {
            file: "/tmp/t.py".to_string(),
            line: 3
        }));
        assert!(!shell.click_line("plain output"));
    }

    #[test]
    fn test_stop_debugging() {
        let (mut shell, _) = shell();
        shell.show_prompt();
        shell.execute("debug").unwrap();
        shell.take_requests();
        shell.on_routed(input_request("ipdb> "), Instant::now());
        shell.stop_debugging();
        assert!(matches!(
            &shell.take_requests()[..],
            [ShellRequest::InputReply { value, .. }] if value == "exit"
        ));
    }

    #[test]
    fn test_clear_magic_stays_local() {
        let (mut shell, record) = shell();
        shell.show_prompt();
        type_line(&mut shell, "%clear");
        shell.key(Key::Enter);
        assert!(shell.take_requests().is_empty());
        assert_eq!(shell.mode(), ShellMode::Idle);
        assert!(record.items().contains(&ViewItem::Cleared));
        assert_eq!(record.prompts(), vec!["In [1]: ", "In [1]: "]);
        assert_eq!(shell.history().last().map(String::as_str), Some("%clear"));
    }

    #[test]
    fn test_reset_after_restart() {
        let (mut shell, _) = shell();
        shell.show_prompt();
        shell.execute("while True: pass").unwrap();
        shell.reset_after_restart();
        assert_eq!(shell.mode(), ShellMode::Idle);
        assert_eq!(shell.next_execution_count(), 1);
        shell.show_prompt();
        assert!(shell.execute("1").is_ok());
    }

    #[test]
    fn test_completion_single_and_common_prefix() {
        let (mut shell, record) = shell();
        shell.show_prompt();
        type_line(&mut shell, "x = np.ar");
        assert_eq!(shell.completion_request(), ("x = np.ar".to_string(), 9));

        let many = Completion {
            matches: vec!["arange".to_string(), "array".to_string()],
            cursor_start: 7,
            cursor_end: 9,
        };
        assert!(shell.apply_completion(&many));
        assert_eq!(shell.input_text(), "x = np.ar");
        assert!(record.contains("arange  array"));

        let one = Completion {
            matches: vec!["arange".to_string()],
            cursor_start: 7,
            cursor_end: 9,
        };
        assert!(shell.apply_completion(&one));
        assert_eq!(record.input(), ("x = np.arange".to_string(), 13));
        assert!(!shell.apply_completion(&Completion {
            matches: Vec::new(),
            cursor_start: 0,
            cursor_end: 0,
        }));
    }

    #[test]
    fn test_common_prefix() {
        let words = |w: &[&str]| w.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(common_prefix(&words(&["print", "prin", "private"])), "pri");
        assert_eq!(common_prefix(&words(&["héla", "hélb"])), "hél");
        assert_eq!(common_prefix(&words(&["a", "b"])), "");
    }
}
