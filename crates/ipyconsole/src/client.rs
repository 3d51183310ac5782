//! One console tab.
//!
//! A [`Client`] pairs the tab's own state (name, info page, elapsed time,
//! stop button) with a kernel session. The session is the transport and
//! router; the shell belongs to the client so its history and view survive
//! kernel restarts.
//!
//! Kernel-method calls issued on the client's own behalf (namespace
//! refresh, cwd, environment) run as small tasks and come back as
//! [`CallResult`]s on the manager's call channel.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use kernel_launch::KernelFlavor;
use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::banner::{self, InterpreterVersions};
use crate::debugger::PdbHistory;
use crate::elapsed::ElapsedTimer;
use crate::error::{ConsoleError, Result};
use crate::history::SharedHistory;
use crate::info_page::{escape_error_text, is_benign_error, InfoPage, InfoPageState};
use crate::router::{Completion, Inspection, KernelInfo, ReplyFuture, Router};
use crate::settings::ConsoleSettings;
use crate::shell::{Key, Shell, ShellConfig, ShellMode, ShellRequest, ShellSignal, TracebackLinks};
use crate::transport::{ClientId, TransportEvent, TransportHandle};
use crate::view::{ConsoleView, TextKind, ViewStyle};
use crate::wire::{self, KernelMethod};

// ============================================================================
// Confirmation
// ============================================================================

/// Questions a client or the manager asks before acting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Question {
    RestartKernel,
    ResetNamespace,
    /// Close the other consoles sharing this kernel too?
    CloseRelated { count: usize },
    CloseConsole,
}

impl Question {
    pub fn text(&self) -> String {
        match self {
            Question::RestartKernel => "Are you sure you want to restart the kernel?".to_string(),
            Question::ResetNamespace => {
                "All user-defined variables will be removed. Are you sure you want to proceed?"
                    .to_string()
            }
            Question::CloseRelated { count } => format!(
                "Do you want to close all other consoles connected to the same kernel as this one? ({} more)",
                count
            ),
            Question::CloseConsole => "Do you want to close this console?".to_string(),
        }
    }
}

/// Something that can answer a [`Question`], such as a dialog.
pub trait Confirm: Send {
    fn confirm(&mut self, question: &Question) -> bool;
}

/// Says yes to everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysYes;

impl Confirm for AlwaysYes {
    fn confirm(&mut self, _question: &Question) -> bool {
        true
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    answers: VecDeque<bool>,
    asked: Vec<Question>,
}

/// Answers from a prepared list, recording every question. Says no once
/// the list runs out. Clones share the script.
#[derive(Debug, Default, Clone)]
pub struct ScriptedAnswers {
    state: Arc<StdMutex<ScriptState>>,
}

impl ScriptedAnswers {
    pub fn new(answers: impl IntoIterator<Item = bool>) -> Self {
        Self {
            state: Arc::new(StdMutex::new(ScriptState {
                answers: answers.into_iter().collect(),
                asked: Vec::new(),
            })),
        }
    }

    pub fn asked(&self) -> Vec<Question> {
        self.state
            .lock()
            .map(|s| s.asked.clone())
            .unwrap_or_default()
    }
}

impl Confirm for ScriptedAnswers {
    fn confirm(&mut self, question: &Question) -> bool {
        match self.state.lock() {
            Ok(mut state) => {
                state.asked.push(question.clone());
                state.answers.pop_front().unwrap_or(false)
            }
            Err(_) => false,
        }
    }
}

// ============================================================================
// Client types
// ============================================================================

/// Tab ids: `int_id` numbers kernels, `str_id` letters the consoles that
/// share one (`1/A`, `1/B`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIds {
    pub int_id: u32,
    pub str_id: String,
}

impl std::fmt::Display for ClientIds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.int_id, self.str_id)
    }
}

/// How a client was created.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub given_name: Option<String>,
    pub flavor: KernelFlavor,
    /// File this console is dedicated to.
    pub filename: Option<PathBuf>,
    /// Kernel runs an interpreter other than the default one.
    pub custom_interpreter: bool,
}

/// Things the owner of the client has to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientNotice {
    /// The info page changed; re-render it.
    PageChanged,
    StopButton(bool),
    DebugDepth(usize),
    /// Fresh variable-explorer contents.
    NamespaceView(Value),
    Cwd(String),
    ShowEnv(BTreeMap<String, String>),
    ShowSyspath(Vec<String>),
    GoToError { file: String, line: u32 },
    /// Channels could not be opened; the tab should go away.
    ConnectionLost(String),
    /// The kernel process exited for good.
    KernelFinished,
}

/// Why a kernel method was called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPurpose {
    NamespaceView,
    Cwd,
    Env,
    SysPath,
    PdbCommands,
    SpyderProbe,
    /// Environment fetched to re-apply the flavor after a reset.
    ResetFlavor,
    Other,
}

/// A finished kernel-method call.
#[derive(Debug)]
pub struct CallResult {
    pub client: ClientId,
    pub purpose: CallPurpose,
    pub result: Result<Value>,
}

pub type CallSender = mpsc::UnboundedSender<CallResult>;

/// Context-menu entries of a console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextAction {
    InspectObject,
    ClearLine,
    RemoveAllVariables,
    ClearConsole,
    Quit,
}

/// The pieces of a client that outlive its kernel.
pub struct ClientParts {
    pub view: Box<dyn ConsoleView>,
    /// Console history shared with every other client.
    pub history: SharedHistory,
    pub pdb_history: PdbHistory,
}

struct Session {
    transport: TransportHandle,
    router: Router,
}

pub struct Client {
    id: ClientId,
    ids: ClientIds,
    config: ClientConfig,
    settings: ConsoleSettings,
    hostname: Option<String>,
    session: Option<Session>,
    shell: Shell,
    page: InfoPageState,
    timer: ElapsedTimer,
    history: SharedHistory,
    versions: Option<InterpreterVersions>,
    spyder_kernel: bool,
    stop_enabled: bool,
    shut_down: bool,
    calls: CallSender,
    notices: Vec<ClientNotice>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("ids", &self.ids)
            .field("attached", &self.session.is_some())
            .field("mode", &self.shell.mode())
            .finish()
    }
}

impl Client {
    pub fn new(
        id: ClientId,
        ids: ClientIds,
        config: ClientConfig,
        settings: ConsoleSettings,
        parts: ClientParts,
        calls: CallSender,
    ) -> Result<Self> {
        let ClientParts {
            view,
            history,
            pdb_history,
        } = parts;
        let shell = Shell::new(
            view,
            ShellConfig::from_settings(&settings),
            history.entries(),
            pdb_history,
            Box::new(TracebackLinks::new()?),
        );
        Ok(Self {
            id,
            ids,
            config,
            hostname: None,
            session: None,
            shell,
            page: InfoPageState::default(),
            timer: ElapsedTimer::new(settings.show_elapsed_time),
            history,
            versions: None,
            spyder_kernel: false,
            stop_enabled: false,
            shut_down: false,
            calls,
            notices: Vec::new(),
            settings,
        })
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn ids(&self) -> &ClientIds {
        &self.ids
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn shell(&self) -> &Shell {
        &self.shell
    }

    pub fn shell_mut(&mut self) -> &mut Shell {
        &mut self.shell
    }

    pub fn page(&self) -> &InfoPage {
        self.page.page()
    }

    pub fn is_attached(&self) -> bool {
        self.session.is_some()
    }

    pub fn transport(&self) -> Option<&TransportHandle> {
        self.session.as_ref().map(|s| &s.transport)
    }

    pub fn connection_file(&self) -> Option<PathBuf> {
        self.transport()
            .and_then(|t| t.connection().connection_file.clone())
    }

    /// Whether the kernel understands the console's kernel methods.
    pub fn is_spyder_kernel(&self) -> bool {
        self.spyder_kernel
    }

    /// The console did not spawn this kernel.
    pub fn is_external(&self) -> bool {
        !self.transport().is_some_and(TransportHandle::owns_process)
    }

    pub fn is_executing(&self) -> bool {
        matches!(
            self.shell.mode(),
            ShellMode::Executing | ShellMode::AwaitingInput
        )
    }

    pub fn is_debugging(&self) -> bool {
        self.shell.is_debugging()
    }

    pub fn stop_enabled(&self) -> bool {
        self.stop_enabled
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn take_notices(&mut self) -> Vec<ClientNotice> {
        std::mem::take(&mut self.notices)
    }

    /// Tab name.
    ///
    /// `Console 1/A`, or the remote host instead of `Console`. Special
    /// consoles and custom interpreters keep both ids after their name;
    /// other given names only keep the letter.
    pub fn name(&self) -> String {
        let special = self
            .config
            .given_name
            .as_deref()
            .is_some_and(|n| ["Pylab", "Sympy", "SymPy", "Cython"].contains(&n));
        match &self.config.given_name {
            None => {
                let base = self.hostname.as_deref().unwrap_or("Console");
                format!("{} {}", base, self.ids)
            }
            Some(given) if special || self.config.custom_interpreter => {
                format!("{} {}", given, self.ids)
            }
            Some(given) => format!("{}/{}", given, self.ids.str_id),
        }
    }

    pub fn rename(&mut self, name: Option<String>) {
        self.config.given_name = name.filter(|n| !n.trim().is_empty());
    }

    // ------------------------------------------------------------------------
    // Session
    // ------------------------------------------------------------------------

    /// Connect the client to a started transport.
    pub fn attach(&mut self, transport: TransportHandle) {
        self.hostname = transport.connection().hostname.clone();
        self.spyder_kernel = transport
            .keeper()
            .is_some_and(|keeper| keeper.spec().is_spyder_kernel());
        let router = Router::new(transport.sink(), self.settings.method_timeout);
        info!(
            "[client] {} attached to kernel {}",
            self.name(),
            transport.connection().kernel_id()
        );
        self.session = Some(Session { transport, router });
    }

    fn router(&self) -> Result<&Router> {
        self.session
            .as_ref()
            .map(|s| &s.router)
            .ok_or(ConsoleError::NoKernel)
    }

    pub fn kernel_info(&self) -> Result<ReplyFuture<KernelInfo>> {
        self.router()?.kernel_info()
    }

    /// Finish startup once `kernel_info` answered: banner, prompt, and the
    /// calls that fill the rest of the tab.
    pub fn on_kernel_info(&mut self, info: &KernelInfo, now: Instant) {
        let versions = InterpreterVersions::from_kernel_info(info);
        let banner = banner::banner(
            self.settings.banner,
            &versions,
            self.config.flavor,
            self.is_external(),
        );
        self.versions = Some(versions);
        if !banner.is_empty() {
            self.shell.append_text(&banner, TextKind::Notice);
        }
        self.apply_style(&ViewStyle {
            color_scheme: self.settings.color_scheme,
            plain_font: self.settings.plain_font.clone(),
            rich_font: self.settings.rich_font.clone(),
        });
        self.shell.show_prompt();
        if !self.spyder_kernel {
            self.spawn_call(CallPurpose::SpyderProbe, KernelMethod::IsSpyderKernel, &[]);
        }
        self.spawn_call(CallPurpose::PdbCommands, KernelMethod::GetPdbCommands, &[]);
        self.drain(now);
    }

    pub fn versions(&self) -> Option<&InterpreterVersions> {
        self.versions.as_ref()
    }

    /// React to what the transport reported.
    pub fn on_transport_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Message(inbound, msg) => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                for routed in session.router.on_message(inbound, &msg) {
                    self.shell.on_routed(routed, now);
                }
            }
            TransportEvent::ProcessStarted => {
                debug!("[client] {} kernel process started", self.id);
            }
            TransportEvent::KernelDied => {
                warn!("[client] {} kernel died", self.name());
                self.cancel_outstanding();
                if self.is_external() {
                    self.shell
                        .append_html(&banner::restart_html(&ConsoleError::KernelDied.to_string()));
                }
            }
            TransportEvent::KernelRestarted { died, stderr } => {
                self.on_restarted(died, &stderr);
            }
            TransportEvent::RestartFailed(msg) => {
                self.shell.append_text(&format!("{}\n", msg), TextKind::Notice);
                if !self.shell.is_reading() {
                    self.shell.show_prompt();
                }
            }
            TransportEvent::ConnectionFailed(msg) => {
                self.page
                    .show_error_html("Could not connect to kernel", &escape_error_text(&msg));
                self.notices.push(ClientNotice::PageChanged);
                self.notices.push(ClientNotice::ConnectionLost(msg));
            }
            TransportEvent::ProcessFinished => {
                info!("[client] {} kernel finished", self.name());
                self.cancel_outstanding();
                self.timer.stop();
                self.notices.push(ClientNotice::KernelFinished);
            }
        }
        self.drain(now);
    }

    fn cancel_outstanding(&mut self) {
        if let Some(session) = self.session.as_mut() {
            if session.router.cancel_outstanding() {
                debug!("[client] {} dropped the running execution", self.id);
            }
        }
        self.shell.reset_after_restart();
        self.set_stop_button(false);
    }

    fn on_restarted(&mut self, died: bool, stderr: &str) {
        self.cancel_outstanding();
        let stderr = stderr.trim();
        let notice = if died && !stderr.is_empty() && !is_benign_error(stderr) {
            escape_error_text(stderr)
        } else {
            banner::restart_message(died).to_string()
        };
        self.shell.append_html(&banner::restart_html(&notice));
        if self.page.page().is_error() || self.page.is_covering() {
            self.page.hide_loading();
            self.notices.push(ClientNotice::PageChanged);
        }
        self.timer.start(Instant::now());
        self.shell.show_prompt();
    }

    /// Hand what the shell queued to the kernel and act on its signals.
    fn drain(&mut self, now: Instant) {
        loop {
            let requests = self.shell.take_requests();
            let signals = self.shell.take_signals();
            if requests.is_empty() && signals.is_empty() {
                break;
            }
            for request in requests {
                self.send_request(request);
            }
            for signal in signals {
                self.on_signal(signal, now);
            }
        }
    }

    fn send_request(&mut self, request: ShellRequest) {
        let Some(session) = self.session.as_ref() else {
            debug!("[client] {} has no kernel for {:?}", self.id, request);
            return;
        };
        let result = match request {
            ShellRequest::Execute(code) => session.router.execute(&code).map(|_| ()),
            ShellRequest::InputReply { value, request } => {
                session.router.input_reply(&value, &request)
            }
            ShellRequest::Interrupt => {
                self.interrupt_kernel();
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!("[client] {} request not sent: {}", self.id, e);
        }
    }

    fn on_signal(&mut self, signal: ShellSignal, now: Instant) {
        match signal {
            ShellSignal::Executing(code) => {
                if !self.shell.is_debugging() {
                    self.history.append(&code);
                }
                self.set_stop_button(true);
            }
            ShellSignal::Executed => {
                self.set_stop_button(false);
                if self.spyder_kernel {
                    self.spawn_call(
                        CallPurpose::NamespaceView,
                        KernelMethod::GetNamespaceView,
                        &[],
                    );
                }
                self.spawn_call(CallPurpose::Cwd, KernelMethod::GetCwd, &[]);
            }
            ShellSignal::PromptReady => {
                if !self.timer.is_started() {
                    self.timer.start(now);
                }
                if self.page.on_prompt_ready() {
                    self.notices.push(ClientNotice::PageChanged);
                }
            }
            ShellSignal::DebugDepth(depth) => {
                self.set_stop_button(depth > 0);
                self.notices.push(ClientNotice::DebugDepth(depth));
            }
            ShellSignal::GoToError { file, line } => {
                self.notices.push(ClientNotice::GoToError { file, line });
            }
        }
    }

    fn set_stop_button(&mut self, enabled: bool) {
        if self.stop_enabled != enabled {
            self.stop_enabled = enabled;
            self.notices.push(ClientNotice::StopButton(enabled));
        }
    }

    // ------------------------------------------------------------------------
    // Kernel methods
    // ------------------------------------------------------------------------

    /// Call `method` and report the outcome on the call channel.
    fn spawn_call(&self, purpose: CallPurpose, method: KernelMethod, args: &[Value]) {
        let future = match self.router().and_then(|r| r.call_method(method, args)) {
            Ok(future) => future,
            Err(e) => {
                debug!("[client] {} could not call {}: {}", self.id, method, e);
                return;
            }
        };
        let calls = self.calls.clone();
        let client = self.id;
        tokio::spawn(async move {
            let result = future.wait().await;
            let _ = calls.send(CallResult {
                client,
                purpose,
                result,
            });
        });
    }

    /// Call a kernel method and hand back the reply future.
    pub fn call_method(&self, method: KernelMethod, args: &[Value]) -> Result<ReplyFuture<Value>> {
        self.router()?.call_method(method, args)
    }

    pub fn on_call_result(&mut self, purpose: CallPurpose, result: Result<Value>, now: Instant) {
        let value = match result {
            Ok(value) => value,
            Err(e) => {
                debug!("[client] {} {:?} call failed: {}", self.id, purpose, e);
                if matches!(purpose, CallPurpose::Env | CallPurpose::SysPath) {
                    self.page.hide_loading();
                    self.notices.push(ClientNotice::PageChanged);
                }
                return;
            }
        };
        match purpose {
            CallPurpose::NamespaceView => self.notices.push(ClientNotice::NamespaceView(value)),
            CallPurpose::Cwd => {
                if let Some(cwd) = value.as_str() {
                    self.notices.push(ClientNotice::Cwd(cwd.to_string()));
                }
            }
            CallPurpose::Env => {
                self.page.hide_loading();
                self.notices.push(ClientNotice::PageChanged);
                match wire::decode_as::<BTreeMap<String, String>>(value) {
                    Ok(env) => self.notices.push(ClientNotice::ShowEnv(env)),
                    Err(e) => warn!("[client] Bad environment from kernel: {}", e),
                }
            }
            CallPurpose::SysPath => {
                self.page.hide_loading();
                self.notices.push(ClientNotice::PageChanged);
                match wire::decode_as::<Vec<String>>(value) {
                    Ok(path) => self.notices.push(ClientNotice::ShowSyspath(path)),
                    Err(e) => warn!("[client] Bad sys.path from kernel: {}", e),
                }
            }
            CallPurpose::PdbCommands => match wire::decode_as::<Vec<String>>(value) {
                Ok(commands) => self.shell.debugger_mut().set_commands(commands),
                Err(e) => debug!("[client] Keeping built-in pdb commands: {}", e),
            },
            CallPurpose::SpyderProbe => {
                self.spyder_kernel = value.as_bool().unwrap_or(false);
                debug!("[client] {} spyder kernel: {}", self.id, self.spyder_kernel);
            }
            CallPurpose::ResetFlavor => {
                let env = wire::decode_as::<BTreeMap<String, String>>(value).unwrap_or_default();
                let flavor = KernelFlavor::from_env(|key| env.get(key).map(String::as_str));
                self.reload_flavor(flavor);
            }
            CallPurpose::Other => {}
        }
        self.drain(now);
    }

    fn reload_flavor(&self, flavor: KernelFlavor) {
        let Ok(router) = self.router() else {
            return;
        };
        for statement in flavor.reload_statements() {
            if let Err(e) = router.execute_silent(statement) {
                warn!("[client] Could not restore {} namespace: {}", flavor, e);
                return;
            }
        }
        if self.spyder_kernel {
            self.spawn_call(CallPurpose::NamespaceView, KernelMethod::GetNamespaceView, &[]);
        }
    }

    // ------------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------------

    /// Run `code` as if typed at the prompt.
    pub fn execute(&mut self, code: &str) -> Result<()> {
        let result = self.shell.execute(code);
        self.drain(Instant::now());
        result
    }

    /// Run `code` without output or history.
    pub fn execute_silent(&self, code: &str) -> Result<()> {
        self.router()?.execute_silent(code).map(|_| ())
    }

    pub fn key(&mut self, key: Key) {
        self.shell.key(key);
        self.drain(Instant::now());
    }

    pub fn paste(&mut self, text: &str) {
        self.shell.paste(text);
        self.drain(Instant::now());
    }

    /// Type `line` at the prompt and press Enter.
    pub fn submit_line(&mut self, line: &str) {
        self.shell.paste(line.trim_end_matches(['\r', '\n']));
        self.shell.key(Key::Enter);
        self.drain(Instant::now());
    }

    /// A rendered line was clicked.
    pub fn click_line(&mut self, line: &str) -> bool {
        let linked = self.shell.click_line(line);
        self.drain(Instant::now());
        linked
    }

    /// Flush buffered stream output that is due.
    pub fn tick(&mut self, now: Instant) {
        self.shell.tick(now);
        if let Some(session) = self.session.as_ref() {
            session.router.expire_abandoned();
        }
    }

    /// Restart the kernel, asking first unless told otherwise.
    ///
    /// The restart notice and new prompt follow when the transport reports
    /// the new process.
    pub async fn restart_kernel(&mut self, confirm: &mut dyn Confirm) -> Result<()> {
        let ask = self.settings.ask_before_restart && !self.settings.launch.testing;
        if ask && !confirm.confirm(&Question::RestartKernel) {
            return Ok(());
        }
        let Some(session) = self.session.as_ref() else {
            return Err(ConsoleError::NoKernel);
        };
        if !session.transport.owns_process() {
            self.shell
                .append_html(&banner::restart_html(banner::RESTART_NOT_PERMITTED));
            return Ok(());
        }
        if self.page.is_covering() {
            self.page.hide_loading();
            self.notices.push(ClientNotice::PageChanged);
        }
        match session.transport.restart().await {
            Ok(()) => Ok(()),
            // Already reported by the transport.
            Err(e @ ConsoleError::RestartFailed(_)) => Err(e),
            Err(e) => {
                self.shell
                    .append_text(&format!("Error restarting kernel: {}\n", e), TextKind::Notice);
                Err(e)
            }
        }
    }

    /// Interrupt the kernel. Nothing happens if it is already gone.
    ///
    /// Goes through the control channel; local kernels fall back to SIGINT.
    pub fn interrupt_kernel(&self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if let Err(e) = session.router.interrupt() {
            debug!("[client] {} control interrupt failed: {}", self.id, e);
            if let Some(keeper) = session.transport.keeper().cloned() {
                tokio::spawn(async move {
                    if let Err(e) = keeper.interrupt().await {
                        debug!("[client] SIGINT failed: {}", e);
                    }
                });
            }
        }
    }

    /// Stop button: interrupt, or quit the debugger when it waits for input.
    pub fn stop_button(&mut self) {
        self.set_stop_button(false);
        if self.shell.mode() == ShellMode::AwaitingPdbInput {
            let exit = self.shell.debugger().exit_command();
            self.shell.pdb_execute(exit, false, false);
        } else {
            self.interrupt_kernel();
        }
        self.drain(Instant::now());
    }

    /// Leave the debugger, interrupting the kernel if it is busy.
    pub fn stop_debugging(&mut self) {
        self.shell.stop_debugging();
        self.drain(Instant::now());
    }

    /// Stop the channels, and the kernel too when no other client shares it
    /// and this console started it. Calling this twice is harmless.
    pub async fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;
        if self.shell.is_debugging() {
            self.stop_debugging();
        } else if self.is_executing() {
            self.interrupt_kernel();
        }
        self.timer.stop();
        if let Some(mut session) = self.session.take() {
            session.router.cancel_outstanding();
            session.transport.shutdown(false).await;
        }
        info!("[client] {} shut down", self.name());
    }

    /// Remove all user variables, then re-apply the kernel's flavor.
    pub fn reset_namespace(&mut self, confirm: &mut dyn Confirm) -> Result<()> {
        let warn = self.settings.show_reset_warning && !self.settings.launch.testing;
        if warn && !confirm.confirm(&Question::ResetNamespace) {
            return Ok(());
        }
        if self.shell.is_debugging() {
            self.shell.pdb_execute("%reset -f", true, false);
            self.drain(Instant::now());
            return Ok(());
        }
        self.router()?.execute_silent("%reset -f")?;
        if self.is_external() {
            self.spawn_call(CallPurpose::ResetFlavor, KernelMethod::GetEnv, &[]);
        } else {
            self.reload_flavor(self.config.flavor);
        }
        Ok(())
    }

    /// Change the kernel's working directory.
    pub fn set_cwd(&mut self, path: &str) {
        self.spawn_call(CallPurpose::Other, KernelMethod::SetCwd, &[Value::from(path)]);
    }

    /// Swap the project entries of the kernel's `sys.path`.
    pub fn update_path(&self, old: &[String], new: &[String]) {
        if !self.spyder_kernel {
            return;
        }
        self.spawn_call(
            CallPurpose::Other,
            KernelMethod::UpdateSyspath,
            &[Value::from(old.to_vec()), Value::from(new.to_vec())],
        );
    }

    pub fn show_env(&mut self) {
        self.page.show_loading("Retrieving environment variables...");
        self.notices.push(ClientNotice::PageChanged);
        self.spawn_call(CallPurpose::Env, KernelMethod::GetEnv, &[]);
    }

    pub fn show_syspath(&mut self) {
        self.page.show_loading("Retrieving sys.path contents...");
        self.notices.push(ClientNotice::PageChanged);
        self.spawn_call(CallPurpose::SysPath, KernelMethod::GetSyspath, &[]);
    }

    /// Ask the kernel about the name under the cursor.
    pub fn inspect_request(&self) -> Result<ReplyFuture<Inspection>> {
        let (code, cursor) = self.shell.completion_request();
        self.router()?.inspect(&code, cursor)
    }

    pub fn show_inspection(&mut self, inspection: &Inspection) {
        match (&inspection.text, inspection.found) {
            (Some(text), true) => self.shell.append_text(&format!("{}\n", text), TextKind::Notice),
            _ => debug!("[client] Nothing to inspect"),
        }
    }

    pub fn complete_request(&self) -> Result<ReplyFuture<Completion>> {
        let (code, cursor) = self.shell.completion_request();
        self.router()?.complete(&code, cursor)
    }

    pub fn apply_completion(&mut self, completion: &Completion) -> bool {
        self.shell.apply_completion(completion)
    }

    /// Context-menu actions that need no kernel reply.
    ///
    /// `InspectObject` and `Quit` involve the owner and are ignored here.
    pub fn context_action(&mut self, action: ContextAction, confirm: &mut dyn Confirm) -> Result<()> {
        match action {
            ContextAction::ClearLine => self.shell.clear_line(),
            ContextAction::ClearConsole => self.shell.clear_console(),
            ContextAction::RemoveAllVariables => self.reset_namespace(confirm)?,
            ContextAction::InspectObject | ContextAction::Quit => {}
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Tab state
    // ------------------------------------------------------------------------

    /// Put the tab into the kernel-error page for `error`.
    pub fn show_kernel_error(&mut self, error: &ConsoleError) {
        match error {
            ConsoleError::MissingKernelModule { .. } | ConsoleError::UnwritableRuntimeDir(_) => {
                self.page
                    .show_error_html("An error occurred while starting the kernel", &error.to_string());
            }
            other => {
                if !self.page.show_error(&other.to_string()) {
                    return;
                }
            }
        }
        self.notices.push(ClientNotice::PageChanged);
    }

    pub fn set_show_elapsed_time(&mut self, visible: bool) {
        self.timer.set_visible(visible);
    }

    pub fn time_label(&mut self, now: Instant) -> String {
        self.timer.label(now)
    }

    pub fn apply_style(&mut self, style: &ViewStyle) {
        self.shell.view_mut().apply_style(style);
    }

    pub fn update_settings(&mut self, settings: ConsoleSettings) {
        self.timer.set_visible(settings.show_elapsed_time);
        self.settings = settings;
    }

    pub fn set_filename(&mut self, filename: Option<PathBuf>) {
        self.config.filename = filename;
    }
}
