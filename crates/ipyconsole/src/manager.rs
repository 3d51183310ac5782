//! The console manager: every tab, and the requests that reach them from
//! the rest of the IDE.
//!
//! The manager owns the clients in tab order and pumps the two channels
//! their tasks report on: transport events and kernel-method results.
//! Callers drive it with [`ConsoleManager::step`] in their main loop;
//! operations that need a reply (kernel info, inspection) keep pumping
//! while they wait, so no event is held back behind them.
//!
//! Whatever the manager learns for other panes (namespace contents, cwd,
//! files to open) goes through the [`Collaborators`] trait.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use kernel_launch::{KernelFlavor, LaunchSpec};
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::client::{
    CallResult, Client, ClientConfig, ClientIds, ClientNotice, ClientParts, Confirm,
    ContextAction, Question,
};
use crate::connection::{self, KernelConnection, TransportKind};
use crate::debugger::{PdbHistory, PdbHistoryStore};
use crate::error::{ConsoleError, Result};
use crate::history::SharedHistory;
use crate::info_page::PageTemplates;
use crate::router::ReplyFuture;
use crate::settings::{ColorScheme, ConsoleSettings, FontSpec};
use crate::shell::{LinkScanner, TracebackLinks};
use crate::tabs;
use crate::transport::{ClientEvent, ClientId, KernelKeeper, TransportHandle};
use crate::tunnel::{self, SshParams};
use crate::view::{ConsoleView, ViewStyle};

/// How long a new kernel gets to answer `kernel_info`.
const KERNEL_INFO_TIMEOUT: Duration = Duration::from_secs(30);
/// Pause between ticks when nothing arrives.
const TICK: Duration = Duration::from_millis(50);

const NOT_SPYDER_KERNEL: &str = "<br>The console is not running a Spyder kernel, so \
    <b>%runfile</b> is not available. Using <b>%run</b> instead.<br>";

// ============================================================================
// Collaborators
// ============================================================================

/// The panes and plugins the console reports to.
///
/// Every method has a no-op default, so embedders implement only what
/// they show.
pub trait Collaborators: Send {
    /// Open `file` in the editor at `line`.
    fn open_file(&mut self, _file: &Path, _line: u32) {}

    fn namespace_view(&mut self, _client: ClientId, _view: &Value) {}

    fn cwd_changed(&mut self, _client: ClientId, _cwd: &str) {}

    fn show_env(&mut self, _client: ClientId, _env: &BTreeMap<String, String>) {}

    fn show_syspath(&mut self, _client: ClientId, _path: &[String]) {}

    /// Tab titles in tab order.
    fn tabs_changed(&mut self, _tabs: &[(ClientId, String)]) {}

    /// The info page of `client` changed; `html` is the rendered page.
    fn page_changed(&mut self, _client: ClientId, _html: &str) {}

    fn stop_button(&mut self, _client: ClientId, _enabled: bool) {}

    fn debug_depth(&mut self, _client: ClientId, _depth: usize) {}

    /// A failure that belongs in a message box.
    fn error(&mut self, _message: &str) {}
}

/// Reports nowhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCollaborators;

impl Collaborators for NoCollaborators {}

/// One call made on [`RecordingCollaborators`].
#[derive(Debug, Clone, PartialEq)]
pub enum CollaboratorEvent {
    OpenFile(PathBuf, u32),
    NamespaceView(ClientId, Value),
    Cwd(ClientId, String),
    Env(ClientId, BTreeMap<String, String>),
    Syspath(ClientId, Vec<String>),
    Tabs(Vec<String>),
    Page(ClientId, String),
    StopButton(ClientId, bool),
    DebugDepth(ClientId, usize),
    Error(String),
}

/// Keeps every call for later inspection. Clones share the record.
#[derive(Debug, Default, Clone)]
pub struct RecordingCollaborators {
    events: Arc<StdMutex<Vec<CollaboratorEvent>>>,
}

impl RecordingCollaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CollaboratorEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Titles from the most recent tab update.
    pub fn last_tabs(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .rev()
            .find_map(|e| match e {
                CollaboratorEvent::Tabs(titles) => Some(titles),
                _ => None,
            })
            .unwrap_or_default()
    }

    fn push(&self, event: CollaboratorEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl Collaborators for RecordingCollaborators {
    fn open_file(&mut self, file: &Path, line: u32) {
        self.push(CollaboratorEvent::OpenFile(file.to_path_buf(), line));
    }

    fn namespace_view(&mut self, client: ClientId, view: &Value) {
        self.push(CollaboratorEvent::NamespaceView(client, view.clone()));
    }

    fn cwd_changed(&mut self, client: ClientId, cwd: &str) {
        self.push(CollaboratorEvent::Cwd(client, cwd.to_string()));
    }

    fn show_env(&mut self, client: ClientId, env: &BTreeMap<String, String>) {
        self.push(CollaboratorEvent::Env(client, env.clone()));
    }

    fn show_syspath(&mut self, client: ClientId, path: &[String]) {
        self.push(CollaboratorEvent::Syspath(client, path.to_vec()));
    }

    fn tabs_changed(&mut self, tabs: &[(ClientId, String)]) {
        let titles = tabs.iter().map(|(_, title)| title.clone()).collect();
        self.push(CollaboratorEvent::Tabs(titles));
    }

    fn page_changed(&mut self, client: ClientId, html: &str) {
        self.push(CollaboratorEvent::Page(client, html.to_string()));
    }

    fn stop_button(&mut self, client: ClientId, enabled: bool) {
        self.push(CollaboratorEvent::StopButton(client, enabled));
    }

    fn debug_depth(&mut self, client: ClientId, depth: usize) {
        self.push(CollaboratorEvent::DebugDepth(client, depth));
    }

    fn error(&mut self, message: &str) {
        self.push(CollaboratorEvent::Error(message.to_string()));
    }
}

// ============================================================================
// Options
// ============================================================================

/// Builds the display surface of a new tab.
pub type ViewFactory = Box<dyn FnMut(ClientId) -> Box<dyn ConsoleView> + Send>;

/// Where the manager keeps its files.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Jupyter runtime directory for connection files.
    pub runtime_dir: PathBuf,
    /// Directory for kernel stderr capture files.
    pub stderr_dir: PathBuf,
    /// Debugger history database; `None` keeps it in memory.
    pub pdb_history_path: Option<PathBuf>,
    /// Kernelspec to launch instead of an interpreter.
    pub kernelspec: Option<String>,
    pub templates: PageTemplates,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            runtime_dir: runtimelib::dirs::runtime_dir(),
            stderr_dir: crate::default_stderr_dir(),
            pdb_history_path: Some(crate::default_pdb_history_path()),
            kernelspec: None,
            templates: PageTemplates::default(),
        }
    }
}

/// How `run_script` runs a file.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Command-line arguments, as one string.
    pub args: String,
    pub wdir: Option<PathBuf>,
    /// Run in the current console instead of one dedicated to the file.
    pub current_client: bool,
    /// Remove all variables first.
    pub clear_variables: bool,
    /// Share the console's namespace instead of a fresh one.
    pub console_namespace: bool,
    pub post_mortem: bool,
    pub debug: bool,
}

/// Which cell `run_cell` runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellId {
    Index(usize),
    Name(String),
}

fn norm(text: &str) -> String {
    if cfg!(windows) {
        text.replace('\\', "/")
    } else {
        text.to_string()
    }
}

fn shell_join(args: &[String]) -> Result<String> {
    shlex::try_join(args.iter().map(String::as_str))
        .map_err(|e| ConsoleError::NotPermitted(format!("Cannot quote {:?}: {}", args, e)))
}

/// The line that runs `filename` in a console.
///
/// Spyder kernels get `%runfile`/`%debugfile` with quoted options; other
/// kernels fall back to `%run`.
pub fn run_script_line(
    filename: &Path,
    options: &RunOptions,
    spyder_kernel: bool,
    external: bool,
) -> Result<String> {
    let file = norm(&filename.display().to_string());
    if !spyder_kernel {
        let mut args = Vec::new();
        if options.debug {
            args.push("-d".to_string());
        }
        args.push(file);
        let mut line = format!("%run {}", shell_join(&args)?);
        if !options.args.trim().is_empty() {
            line.push(' ');
            line.push_str(&norm(options.args.trim()));
        }
        return Ok(line);
    }

    let method = if options.debug { "debugfile" } else { "runfile" };
    let mut args = vec![file];
    if !options.args.trim().is_empty() {
        args.push("--args".to_string());
        args.push(norm(options.args.trim()));
    }
    if let Some(wdir) = &options.wdir {
        if Some(wdir.as_path()) == filename.parent() {
            // The kernel defaults to the file's directory, which an
            // external kernel may not share.
            if !external {
                args.push("--wdir".to_string());
            }
        } else {
            args.push("--wdir".to_string());
            args.push(norm(&wdir.display().to_string()));
        }
    }
    if options.post_mortem {
        args.push("--post-mortem".to_string());
    }
    if options.console_namespace {
        args.push("--current-namespace".to_string());
    }
    Ok(format!("%{} {}", method, shell_join(&args)?))
}

/// The code that runs one cell of `filename`.
pub fn run_cell_code(
    code: &str,
    cell: &CellId,
    filename: &Path,
    debug: bool,
    spyder_kernel: bool,
) -> Result<String> {
    if !spyder_kernel {
        let code = code.trim();
        return Ok(if debug {
            format!("%%debug\n{}", code)
        } else {
            code.to_string()
        });
    }
    let method = if debug { "debugcell" } else { "runcell" };
    let mut args = match cell {
        CellId::Index(i) => vec!["-i".to_string(), i.to_string()],
        CellId::Name(name) => vec!["-n".to_string(), name.clone()],
    };
    args.push(norm(&filename.display().to_string()));
    Ok(format!("%{} {}", method, shell_join(&args)?))
}

// ============================================================================
// Manager
// ============================================================================

pub struct ConsoleManager {
    settings: ConsoleSettings,
    options: ManagerOptions,
    clients: Vec<Client>,
    current: Option<ClientId>,
    next_client: u64,
    next_int_id: u32,
    history: SharedHistory,
    views: ViewFactory,
    collaborators: Box<dyn Collaborators>,
    confirm: Box<dyn Confirm>,
    links: TracebackLinks,
    run_cell_filename: Option<PathBuf>,
    /// Clients whose connection failed, removed on the next pump.
    doomed: Vec<ClientId>,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    calls_tx: mpsc::UnboundedSender<CallResult>,
    calls: mpsc::UnboundedReceiver<CallResult>,
}

impl std::fmt::Debug for ConsoleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsoleManager")
            .field("clients", &self.clients)
            .field("current", &self.current)
            .finish()
    }
}

impl ConsoleManager {
    pub fn new(
        settings: ConsoleSettings,
        options: ManagerOptions,
        history: SharedHistory,
        views: ViewFactory,
        collaborators: Box<dyn Collaborators>,
        confirm: Box<dyn Confirm>,
    ) -> Result<Self> {
        let (events_tx, events) = mpsc::unbounded_channel();
        let (calls_tx, calls) = mpsc::unbounded_channel();
        Ok(Self {
            settings,
            options,
            clients: Vec::new(),
            current: None,
            next_client: 1,
            next_int_id: 1,
            history,
            views,
            collaborators,
            confirm,
            links: TracebackLinks::new()?,
            run_cell_filename: None,
            doomed: Vec::new(),
            events_tx,
            events,
            calls_tx,
            calls,
        })
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    pub fn settings(&self) -> &ConsoleSettings {
        &self.settings
    }

    pub fn clients(&self) -> &[Client] {
        &self.clients
    }

    pub fn client(&self, id: ClientId) -> Option<&Client> {
        self.clients.iter().find(|c| c.id() == id)
    }

    pub fn client_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.clients.iter_mut().find(|c| c.id() == id)
    }

    fn require(&mut self, id: ClientId) -> Result<&mut Client> {
        self.client_mut(id).ok_or(ConsoleError::NoKernel)
    }

    pub fn current(&self) -> Option<ClientId> {
        self.current
    }

    pub fn set_current(&mut self, id: ClientId) {
        if self.client(id).is_some() {
            self.current = Some(id);
        }
    }

    /// The console dedicated to `filename`, if one is open.
    pub fn client_for_file(&self, filename: &Path) -> Option<ClientId> {
        self.clients
            .iter()
            .find(|c| c.config().filename.as_deref() == Some(filename))
            .map(Client::id)
    }

    /// Other clients talking to the same kernel as `id`.
    pub fn related_clients(&self, id: ClientId) -> Vec<ClientId> {
        let Some(connection) = self
            .client(id)
            .and_then(Client::transport)
            .map(|t| t.connection().clone())
        else {
            return Vec::new();
        };
        self.clients
            .iter()
            .filter(|c| c.id() != id)
            .filter(|c| {
                c.transport()
                    .is_some_and(|t| t.connection().same_kernel(&connection))
            })
            .map(Client::id)
            .collect()
    }

    /// Tab titles in tab order: the disambiguated file for file consoles,
    /// the client name otherwise.
    pub fn tab_titles(&self) -> Vec<(ClientId, String)> {
        let paths: Vec<Option<&Path>> = self
            .clients
            .iter()
            .map(|c| c.config().filename.as_deref())
            .collect();
        tabs::tab_titles(&paths)
            .into_iter()
            .zip(&self.clients)
            .map(|(title, c)| (c.id(), title.unwrap_or_else(|| c.name())))
            .collect()
    }

    fn refresh_tabs(&mut self) {
        let titles = self.tab_titles();
        self.collaborators.tabs_changed(&titles);
    }

    // ------------------------------------------------------------------------
    // Creating clients
    // ------------------------------------------------------------------------

    pub fn reserve_id(&mut self) -> ClientId {
        let id = ClientId(self.next_client);
        self.next_client += 1;
        id
    }

    fn fresh_ids(&mut self) -> ClientIds {
        let int_id = self.next_int_id;
        self.next_int_id += 1;
        ClientIds {
            int_id,
            str_id: "A".to_string(),
        }
    }

    fn next_str_id(&self, int_id: u32) -> String {
        let used: Vec<&str> = self
            .clients
            .iter()
            .filter(|c| c.ids().int_id == int_id)
            .map(|c| c.ids().str_id.as_str())
            .collect();
        ('A'..='Z')
            .map(String::from)
            .find(|s| !used.contains(&s.as_str()))
            .unwrap_or_else(|| (used.len() + 1).to_string())
    }

    /// Ids for a client of `connection`: the next letter of an open
    /// kernel, or a new number.
    fn ids_for(&mut self, connection: &KernelConnection) -> ClientIds {
        let master = self
            .clients
            .iter()
            .find(|c| {
                c.transport()
                    .is_some_and(|t| t.connection().same_kernel(connection))
            })
            .map(|c| c.ids().int_id);
        match master {
            Some(int_id) => ClientIds {
                int_id,
                str_id: self.next_str_id(int_id),
            },
            None => self.fresh_ids(),
        }
    }

    fn pdb_history(&self) -> PdbHistory {
        let max = self.settings.pdb_history_max;
        let Some(path) = &self.options.pdb_history_path else {
            return PdbHistory::in_memory(max);
        };
        match PdbHistoryStore::open(path) {
            Ok(store) => PdbHistory::with_store(store, max),
            Err(e) => {
                warn!("[manager] Debugger history unavailable: {:#}", e);
                PdbHistory::in_memory(max)
            }
        }
    }

    fn build_client(&mut self, id: ClientId, ids: ClientIds, config: ClientConfig) -> Result<Client> {
        let parts = ClientParts {
            view: (self.views)(id),
            history: self.history.clone(),
            pdb_history: self.pdb_history(),
        };
        Client::new(
            id,
            ids,
            config,
            self.settings.clone(),
            parts,
            self.calls_tx.clone(),
        )
    }

    fn insert(&mut self, client: Client) {
        self.current = Some(client.id());
        self.clients.push(client);
        self.refresh_tabs();
    }

    /// Add a client for an already started transport, without the
    /// `kernel_info` handshake.
    pub fn adopt(&mut self, transport: TransportHandle, config: ClientConfig) -> Result<ClientId> {
        let id = transport.client();
        let ids = self.ids_for(transport.connection());
        let mut client = self.build_client(id, ids, config)?;
        client.attach(transport);
        self.insert(client);
        Ok(id)
    }

    fn launch_spec(&self, flavor: KernelFlavor) -> LaunchSpec {
        let mut spec = match &self.options.kernelspec {
            Some(name) => LaunchSpec::for_kernelspec(name.clone()),
            None => {
                let interpreter = self
                    .settings
                    .interpreter
                    .clone()
                    .unwrap_or_else(kernel_launch::default_interpreter);
                let mut spec = LaunchSpec::for_interpreter(interpreter, flavor);
                spec.external_interpreter = self.settings.interpreter.is_some();
                spec
            }
        };
        spec.options = self.settings.launch.clone();
        spec
    }

    async fn start_kernel(&self, id: ClientId, flavor: KernelFlavor) -> Result<TransportHandle> {
        let connection_file = connection::allocate_connection_file(&self.options.runtime_dir)?;
        std::fs::create_dir_all(&self.options.stderr_dir)?;
        let stderr_path = self.options.stderr_dir.join(format!(
            "{}.stderr",
            connection::kernel_id_from_path(&connection_file)
        ));
        let keeper = KernelKeeper::start(self.launch_spec(flavor), connection_file, stderr_path).await?;
        let connection = keeper.connection().clone();
        Ok(TransportHandle::start(
            id,
            connection,
            Some(keeper),
            None,
            self.settings.time_to_dead,
            self.events_tx.clone(),
        ))
    }

    /// Open a tab with a new kernel.
    ///
    /// A kernel that fails to start still gets its tab, showing the error
    /// page; only internal failures are returned as errors.
    pub async fn new_client(
        &mut self,
        flavor: KernelFlavor,
        given_name: Option<String>,
        filename: Option<PathBuf>,
    ) -> Result<ClientId> {
        let id = self.reserve_id();
        let config = ClientConfig {
            given_name: given_name.or_else(|| flavor.title().map(str::to_string)),
            flavor,
            filename,
            custom_interpreter: self.settings.interpreter.is_some(),
        };
        match self.start_kernel(id, flavor).await {
            Ok(transport) => {
                self.adopt(transport, config)?;
                self.handshake(id).await;
            }
            Err(e) => {
                error!("[manager] Kernel for {} did not start: {}", id, e);
                let ids = self.fresh_ids();
                let mut client = self.build_client(id, ids, config)?;
                client.show_kernel_error(&e);
                self.insert(client);
                self.dispatch_notices(id);
            }
        }
        Ok(id)
    }

    /// Wait for `kernel_info` and finish the client's startup.
    pub async fn handshake(&mut self, id: ClientId) {
        let reply = match self.client(id).map(Client::kernel_info) {
            Some(Ok(reply)) => reply.with_timeout(KERNEL_INFO_TIMEOUT),
            Some(Err(e)) => {
                warn!("[manager] {} has no kernel to greet: {}", id, e);
                return;
            }
            None => return,
        };
        let result = self.wait_reply(reply).await;
        let Some(client) = self.client_mut(id) else {
            return;
        };
        match result {
            Ok(info) => client.on_kernel_info(&info, Instant::now()),
            Err(e) => {
                warn!("[manager] {} did not answer kernel_info: {}", id, e);
                let stderr = client
                    .transport()
                    .and_then(TransportHandle::stderr_path)
                    .map(kernel_launch::read_stderr)
                    .unwrap_or_default();
                let error = if stderr.trim().is_empty() {
                    e
                } else {
                    ConsoleError::SpawnFailed(stderr)
                };
                client.show_kernel_error(&error);
            }
        }
        self.dispatch_notices(id);
        self.reap().await;
    }

    /// Attach a tab to a kernel started elsewhere.
    ///
    /// `spec` is a connection file path, a kernel id, or a fragment of one.
    /// A kernel already open in another tab gets a sibling tab sharing it.
    pub async fn connect_to_existing(
        &mut self,
        spec: &str,
        ssh: Option<SshParams>,
    ) -> Result<ClientId> {
        let file = connection::find_connection_file(spec, &self.options.runtime_dir)?;
        let info = connection::read_connection_file(&file)?;
        let id = self.reserve_id();

        let master = self
            .clients
            .iter()
            .filter_map(Client::transport)
            .find(|t| t.connection().connection_file.as_deref() == Some(file.as_path()));
        let keeper = master.and_then(|t| t.keeper().cloned());
        let kind = master.map_or(TransportKind::External, |t| t.connection().kind);

        let (connection, tunnel) = match &ssh {
            Some(params) => {
                let (info, tunnel) = tunnel::open_tunnel(&info, params).await?;
                let mut connection =
                    KernelConnection::new(Some(file.clone()), info, TransportKind::SshTunnel);
                connection.hostname = Some(params.hostname());
                (connection, Some(tunnel))
            }
            None => (KernelConnection::new(Some(file.clone()), info, kind), None),
        };
        info!("[manager] Connecting {} to {}", id, file.display());
        let transport = TransportHandle::start(
            id,
            connection,
            keeper,
            tunnel,
            self.settings.time_to_dead,
            self.events_tx.clone(),
        );
        self.adopt(transport, ClientConfig::default())?;
        self.handshake(id).await;
        Ok(id)
    }

    /// Attach a tab to a kernel whose connection info was handed over
    /// directly.
    pub async fn connect_stdio(&mut self, connection_json: &str) -> Result<ClientId> {
        let info = connection::parse_connection_info(connection_json)?;
        let id = self.reserve_id();
        let transport = TransportHandle::start(
            id,
            KernelConnection::new(None, info, TransportKind::Stdio),
            None,
            None,
            self.settings.time_to_dead,
            self.events_tx.clone(),
        );
        self.adopt(transport, ClientConfig::default())?;
        self.handshake(id).await;
        Ok(id)
    }

    // ------------------------------------------------------------------------
    // Event pump
    // ------------------------------------------------------------------------

    /// Handle whatever arrives next, or tick after a short pause.
    ///
    /// Safe to cancel, e.g. from a `select!` that also reads user input.
    pub async fn step(&mut self) {
        tokio::select! {
            Some(event) = self.events.recv() => self.handle_event(event),
            Some(call) = self.calls.recv() => self.handle_call(call),
            _ = tokio::time::sleep(TICK) => {}
        }
        self.tick();
        self.reap().await;
    }

    /// Wait for `reply` while still handling events.
    pub async fn wait_reply<T>(&mut self, reply: ReplyFuture<T>) -> Result<T> {
        let wait = reply.wait();
        tokio::pin!(wait);
        loop {
            tokio::select! {
                result = &mut wait => return result,
                Some(event) = self.events.recv() => self.handle_event(event),
                Some(call) = self.calls.recv() => self.handle_call(call),
            }
        }
    }

    /// Route one transport event to its client. Events for closed clients
    /// are dropped.
    pub fn handle_event(&mut self, event: ClientEvent) {
        let Some(client) = self.client_mut(event.client) else {
            debug!("[manager] Event for closed {}", event.client);
            return;
        };
        client.on_transport_event(event.event, Instant::now());
        self.dispatch_notices(event.client);
    }

    pub fn handle_call(&mut self, call: CallResult) {
        let Some(client) = self.client_mut(call.client) else {
            return;
        };
        client.on_call_result(call.purpose, call.result, Instant::now());
        self.dispatch_notices(call.client);
    }

    /// Flush due stream output of every client.
    pub fn tick(&mut self) {
        let now = Instant::now();
        for client in &mut self.clients {
            client.tick(now);
        }
    }

    fn dispatch_notices(&mut self, id: ClientId) {
        let Some(client) = self.client_mut(id) else {
            return;
        };
        let notices = client.take_notices();
        let page = client.page().clone();
        for notice in notices {
            match notice {
                ClientNotice::PageChanged => {
                    let html = self.options.templates.render(&page);
                    self.collaborators.page_changed(id, &html);
                }
                ClientNotice::StopButton(enabled) => self.collaborators.stop_button(id, enabled),
                ClientNotice::DebugDepth(depth) => self.collaborators.debug_depth(id, depth),
                ClientNotice::NamespaceView(view) => self.collaborators.namespace_view(id, &view),
                ClientNotice::Cwd(cwd) => self.collaborators.cwd_changed(id, &cwd),
                ClientNotice::ShowEnv(env) => self.collaborators.show_env(id, &env),
                ClientNotice::ShowSyspath(path) => self.collaborators.show_syspath(id, &path),
                ClientNotice::GoToError { file, line } => self.go_to_location(&file, line),
                ClientNotice::ConnectionLost(msg) => {
                    self.collaborators.error(&msg);
                    if !self.doomed.contains(&id) {
                        self.doomed.push(id);
                    }
                }
                ClientNotice::KernelFinished => debug!("[manager] {} kernel finished", id),
            }
        }
    }

    /// Remove clients whose connection failed. An id leaves the list only
    /// once its client is gone.
    async fn reap(&mut self) {
        while let Some(&id) = self.doomed.last() {
            info!("[manager] Removing {} after connection failure", id);
            self.remove(id).await;
            self.doomed.pop();
        }
    }

    // ------------------------------------------------------------------------
    // Running code
    // ------------------------------------------------------------------------

    /// Run `filename`, in a console dedicated to it unless
    /// `options.current_client`. Cython files always get their own.
    ///
    /// A console that is already executing drops the request.
    pub async fn run_script(&mut self, filename: &Path, options: RunOptions) -> Result<()> {
        let is_cython = filename.extension().is_some_and(|ext| ext == "pyx");
        let dedicated = !options.current_client || is_cython;
        let existing = if dedicated {
            self.client_for_file(filename)
        } else {
            self.current
        };
        let id = match existing {
            Some(id) => id,
            None => {
                let (flavor, bound) = match (is_cython, dedicated) {
                    (true, _) => (KernelFlavor::Cython, Some(filename.to_path_buf())),
                    (false, true) => (self.settings.default_flavor, Some(filename.to_path_buf())),
                    (false, false) => (self.settings.default_flavor, None),
                };
                self.new_client(flavor, None, bound).await?
            }
        };
        self.set_current(id);

        let client = self.require(id)?;
        if client.is_executing() {
            info!("[manager] {} is busy, not running {}", id, filename.display());
            return Ok(());
        }
        let spyder = client.is_spyder_kernel();
        let mut line = run_script_line(filename, &options, spyder, client.is_external())?;
        if !spyder {
            client.shell_mut().append_html(NOT_SPYDER_KERNEL);
        }
        if options.clear_variables {
            client.execute_silent("%reset -f")?;
        }
        if dedicated && !client.is_debugging() {
            client.shell_mut().clear_console();
        }
        if client.is_debugging() {
            line.insert(0, '!');
        }
        client.execute(&line)?;
        self.dispatch_notices(id);
        Ok(())
    }

    /// Run one cell of `filename` in its dedicated console, or the current
    /// one.
    pub fn run_cell(&mut self, code: &str, cell: CellId, filename: &Path, debug: bool) -> Result<()> {
        self.run_cell_filename = Some(filename.to_path_buf());
        let id = self
            .client_for_file(filename)
            .or(self.current)
            .ok_or(ConsoleError::NoKernel)?;
        let client = self.require(id)?;
        let spyder = client.is_spyder_kernel();
        let mut line = run_cell_code(code, &cell, filename, debug, spyder)?;
        if spyder && client.is_debugging() {
            line.insert(0, '!');
        }
        match client.execute(&line) {
            Ok(()) => {}
            Err(ConsoleError::RequestWhileBusy) => {
                info!("[manager] {} is busy, cell dropped", id);
            }
            Err(e) => return Err(e),
        }
        self.dispatch_notices(id);
        Ok(())
    }

    /// Open the editor at the location named by a traceback `line`.
    pub fn go_to_error(&mut self, line: &str) -> bool {
        match self.links.link_at(line) {
            Some((file, line)) => {
                self.go_to_location(&file, line);
                true
            }
            None => false,
        }
    }

    fn go_to_location(&mut self, file: &str, line: u32) {
        let path = self.resolve_error_path(file);
        debug!("[manager] Opening {}:{}", path.display(), line);
        self.collaborators.open_file(&path, line);
    }

    /// Absolute editor path for a traceback file name. Cell input maps to
    /// the file whose cell ran last.
    pub fn resolve_error_path(&self, file: &str) -> PathBuf {
        if file.contains("<ipython-input-") {
            if let Some(path) = &self.run_cell_filename {
                return absolutize(path.clone());
            }
        }
        let path = match file.strip_prefix('~') {
            Some(rest) => match dirs::home_dir() {
                Some(home) => home.join(rest.trim_start_matches(['/', '\\'])),
                None => PathBuf::from(file),
            },
            None => PathBuf::from(file),
        };
        absolutize(path)
    }

    // ------------------------------------------------------------------------
    // Client operations
    // ------------------------------------------------------------------------

    /// Type a line into the current console.
    pub fn submit_line(&mut self, line: &str) -> Result<()> {
        let id = self.current.ok_or(ConsoleError::NoKernel)?;
        self.require(id)?.submit_line(line);
        self.dispatch_notices(id);
        Ok(())
    }

    pub fn execute(&mut self, id: ClientId, code: &str) -> Result<()> {
        let result = self.require(id)?.execute(code);
        self.dispatch_notices(id);
        result
    }

    pub async fn restart_kernel(&mut self, id: ClientId) -> Result<()> {
        let client = self
            .clients
            .iter_mut()
            .find(|c| c.id() == id)
            .ok_or(ConsoleError::NoKernel)?;
        let result = client.restart_kernel(self.confirm.as_mut()).await;
        self.dispatch_notices(id);
        result
    }

    /// Restart every kernel this console started, once per kernel.
    pub async fn restart_all(&mut self) {
        let mut seen: Vec<PathBuf> = Vec::new();
        let mut targets = Vec::new();
        for client in &self.clients {
            if client.is_external() {
                continue;
            }
            match client.connection_file() {
                Some(file) if seen.contains(&file) => {}
                Some(file) => {
                    seen.push(file);
                    targets.push(client.id());
                }
                None => targets.push(client.id()),
            }
        }
        for id in targets {
            if let Err(e) = self.restart_kernel(id).await {
                warn!("[manager] Restarting {} failed: {}", id, e);
            }
        }
    }

    pub fn interrupt_kernel(&mut self, id: ClientId) -> Result<()> {
        self.require(id)?.interrupt_kernel();
        Ok(())
    }

    pub fn interrupt_all(&mut self) {
        for client in &self.clients {
            if client.is_executing() {
                client.interrupt_kernel();
            }
        }
    }

    pub fn stop_button(&mut self, id: ClientId) -> Result<()> {
        self.require(id)?.stop_button();
        self.dispatch_notices(id);
        Ok(())
    }

    pub fn reset_namespace(&mut self, id: ClientId) -> Result<()> {
        let client = self
            .clients
            .iter_mut()
            .find(|c| c.id() == id)
            .ok_or(ConsoleError::NoKernel)?;
        client.reset_namespace(self.confirm.as_mut())?;
        self.dispatch_notices(id);
        Ok(())
    }

    pub fn show_env(&mut self, id: ClientId) -> Result<()> {
        self.require(id)?.show_env();
        self.dispatch_notices(id);
        Ok(())
    }

    pub fn show_syspath(&mut self, id: ClientId) -> Result<()> {
        self.require(id)?.show_syspath();
        self.dispatch_notices(id);
        Ok(())
    }

    pub fn set_cwd(&mut self, id: ClientId, path: &str) -> Result<()> {
        self.require(id)?.set_cwd(path);
        Ok(())
    }

    /// Ask for completions at the cursor and apply them.
    pub async fn complete(&mut self, id: ClientId) -> Result<bool> {
        let reply = self.require(id)?.complete_request()?;
        let completion = self.wait_reply(reply).await?;
        Ok(self.require(id)?.apply_completion(&completion))
    }

    pub async fn context_action(&mut self, id: ClientId, action: ContextAction) -> Result<()> {
        match action {
            ContextAction::InspectObject => {
                let reply = self.require(id)?.inspect_request()?;
                let inspection = self.wait_reply(reply).await?;
                self.require(id)?.show_inspection(&inspection);
            }
            ContextAction::Quit => {
                self.close_client(id, false).await;
            }
            action => {
                let client = self
                    .clients
                    .iter_mut()
                    .find(|c| c.id() == id)
                    .ok_or(ConsoleError::NoKernel)?;
                client.context_action(action, self.confirm.as_mut())?;
            }
        }
        self.dispatch_notices(id);
        Ok(())
    }

    pub fn rename(&mut self, id: ClientId, name: Option<String>) {
        if let Some(client) = self.client_mut(id) {
            client.rename(name);
            self.refresh_tabs();
        }
    }

    // ------------------------------------------------------------------------
    // Closing
    // ------------------------------------------------------------------------

    /// Close a tab. Returns whether it was closed.
    ///
    /// Without `force`, asks first when configured to, then offers to
    /// close the other tabs of the same kernel. Closing an unknown or
    /// already closed tab does nothing.
    pub async fn close_client(&mut self, id: ClientId, force: bool) -> bool {
        if self.client(id).is_none() {
            return false;
        }
        let ask = self.settings.ask_before_closing && !self.settings.launch.testing;
        if !force && ask && !self.confirm.confirm(&Question::CloseConsole) {
            return false;
        }
        let related = self.related_clients(id);
        let close_related = !force
            && !related.is_empty()
            && self.confirm.confirm(&Question::CloseRelated {
                count: related.len(),
            });

        self.remove(id).await;
        if close_related {
            for other in related {
                self.remove(other).await;
            }
        }
        true
    }

    async fn remove(&mut self, id: ClientId) {
        let Some(index) = self.clients.iter().position(|c| c.id() == id) else {
            return;
        };
        self.clients[index].shutdown().await;
        self.clients.remove(index);
        if self.current == Some(id) {
            let next = index.min(self.clients.len().saturating_sub(1));
            self.current = self.clients.get(next).map(Client::id);
        }
        self.refresh_tabs();
    }

    /// Shut every client down at once.
    pub async fn close_all(&mut self) {
        futures::future::join_all(self.clients.iter_mut().map(|c| c.shutdown())).await;
        self.clients.clear();
        self.current = None;
        self.refresh_tabs();
    }

    // ------------------------------------------------------------------------
    // Settings fan-out
    // ------------------------------------------------------------------------

    fn style(&self) -> ViewStyle {
        ViewStyle {
            color_scheme: self.settings.color_scheme,
            plain_font: self.settings.plain_font.clone(),
            rich_font: self.settings.rich_font.clone(),
        }
    }

    pub fn update_settings(&mut self, settings: ConsoleSettings) {
        self.settings = settings;
        let style = self.style();
        for client in &mut self.clients {
            client.update_settings(self.settings.clone());
            client.apply_style(&style);
        }
    }

    pub fn update_font(&mut self, plain: FontSpec, rich: FontSpec) {
        let mut settings = self.settings.clone();
        settings.plain_font = plain;
        settings.rich_font = rich;
        self.update_settings(settings);
    }

    pub fn update_color_scheme(&mut self, scheme: ColorScheme) {
        let mut settings = self.settings.clone();
        settings.color_scheme = scheme;
        self.update_settings(settings);
    }

    pub fn set_show_elapsed_time(&mut self, visible: bool) {
        self.settings.show_elapsed_time = visible;
        for client in &mut self.clients {
            client.set_show_elapsed_time(visible);
        }
    }

    /// Project paths changed from `old` to `new`.
    pub fn update_path(&mut self, old: &[String], new: &[String]) {
        for client in &self.clients {
            client.update_path(old, new);
        }
    }

    /// Elapsed-time labels, empty for tabs that hide them.
    pub fn time_labels(&mut self) -> Vec<(ClientId, String)> {
        let now = Instant::now();
        self.clients
            .iter_mut()
            .map(|c| (c.id(), c.time_label(now)))
            .collect()
    }

    /// Report a kernel-start failure that has no tab to show it on.
    pub fn report_error(&mut self, error: &ConsoleError) {
        self.collaborators.error(&error.to_string());
    }
}

fn absolutize(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match std::env::current_dir() {
        Ok(dir) => dir.join(path),
        Err(_) => path,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ScriptedAnswers;
    use crate::info_page::InfoPage;
    use crate::view::Transcript;
    use crate::wire::Outgoing;
    use jupyter_protocol::{ConnectionInfo, JupyterMessageContent};
    use std::collections::HashMap;

    fn info() -> ConnectionInfo {
        ConnectionInfo {
            transport: jupyter_protocol::connection_info::Transport::TCP,
            ip: "127.0.0.1".to_string(),
            stdin_port: 1,
            control_port: 2,
            hb_port: 3,
            shell_port: 4,
            iopub_port: 5,
            signature_scheme: "hmac-sha256".to_string(),
            key: "k".to_string(),
            kernel_name: None,
        }
    }

    fn sent_code(outgoing: &mut mpsc::UnboundedReceiver<Outgoing>) -> String {
        match outgoing.try_recv().unwrap().message.content {
            JupyterMessageContent::ExecuteRequest(req) => req.code,
            other => panic!("expected execute_request, got {:?}", other),
        }
    }

    struct Fixture {
        manager: ConsoleManager,
        record: RecordingCollaborators,
        answers: ScriptedAnswers,
        views: Arc<StdMutex<HashMap<ClientId, Transcript>>>,
        outgoing: Vec<mpsc::UnboundedReceiver<Outgoing>>,
    }

    impl Fixture {
        fn new(answers: Vec<bool>) -> Self {
            Self::with_options(
                answers,
                ManagerOptions {
                    pdb_history_path: None,
                    ..Default::default()
                },
            )
        }

        fn with_options(answers: Vec<bool>, options: ManagerOptions) -> Self {
            let mut settings = ConsoleSettings::default();
            settings.launch.testing = true;
            let record = RecordingCollaborators::new();
            let answers = ScriptedAnswers::new(answers);
            let views: Arc<StdMutex<HashMap<ClientId, Transcript>>> = Arc::default();
            let factory_views = views.clone();
            let manager = ConsoleManager::new(
                settings,
                options,
                SharedHistory::in_memory(),
                Box::new(move |id| {
                    let transcript = Transcript::new();
                    factory_views.lock().unwrap().insert(id, transcript.clone());
                    Box::new(transcript)
                }),
                Box::new(record.clone()),
                Box::new(answers.clone()),
            )
            .unwrap();
            Self {
                manager,
                record,
                answers,
                views,
                outgoing: Vec::new(),
            }
        }

        fn open(&mut self, file: &str, config: ClientConfig) -> ClientId {
            let id = self.manager.reserve_id();
            let connection = KernelConnection::new(
                Some(PathBuf::from(file)),
                info(),
                TransportKind::External,
            );
            let (transport, outgoing) = TransportHandle::detached(id, connection);
            self.outgoing.push(outgoing);
            self.manager.adopt(transport, config).unwrap()
        }

        fn view(&self, id: ClientId) -> Transcript {
            self.views.lock().unwrap()[&id].clone()
        }

        /// A console on a kernel this process spawned.
        fn open_local(&mut self, keeper: &Arc<KernelKeeper>) -> ClientId {
            let id = self.manager.reserve_id();
            let (transport, outgoing) = TransportHandle::detached_sharing(id, keeper.clone());
            self.outgoing.push(outgoing);
            self.manager.adopt(transport, ClientConfig::default()).unwrap()
        }
    }

    fn local_kernel() -> (Arc<KernelKeeper>, Arc<std::sync::atomic::AtomicUsize>) {
        KernelKeeper::counting(KernelConnection::new(
            Some(PathBuf::from("/rt/kernel-9.json")),
            info(),
            TransportKind::Local,
        ))
    }

    #[test]
    fn test_run_script_line_spyder_kernel() {
        let options = RunOptions {
            args: "-v  data.csv".to_string(),
            wdir: Some(PathBuf::from("/work/out dir")),
            post_mortem: true,
            console_namespace: true,
            ..Default::default()
        };
        let line = run_script_line(Path::new("/work/my script.py"), &options, true, false).unwrap();
        assert_eq!(
            line,
            "%runfile '/work/my script.py' --args '-v  data.csv' --wdir '/work/out dir' --post-mortem --current-namespace"
        );
    }

    #[test]
    fn test_run_script_line_wdir_of_file() {
        let options = RunOptions {
            wdir: Some(PathBuf::from("/work")),
            debug: true,
            ..Default::default()
        };
        let file = Path::new("/work/a.py");
        assert_eq!(
            run_script_line(file, &options, true, false).unwrap(),
            "%debugfile /work/a.py --wdir"
        );
        assert_eq!(
            run_script_line(file, &options, true, true).unwrap(),
            "%debugfile /work/a.py"
        );
    }

    #[test]
    fn test_run_script_line_plain_kernel() {
        let options = RunOptions {
            args: "x y".to_string(),
            debug: true,
            ..Default::default()
        };
        assert_eq!(
            run_script_line(Path::new("/work/a b.py"), &options, false, true).unwrap(),
            "%run -d '/work/a b.py' x y"
        );
    }

    #[test]
    fn test_run_cell_code() {
        let file = Path::new("/work/a.py");
        assert_eq!(
            run_cell_code("x = 1", &CellId::Index(2), file, false, true).unwrap(),
            "%runcell -i 2 /work/a.py"
        );
        assert_eq!(
            run_cell_code("x = 1", &CellId::Name("load data".into()), file, true, true).unwrap(),
            "%debugcell -n 'load data' /work/a.py"
        );
        assert_eq!(
            run_cell_code("  x = 1\n", &CellId::Index(0), file, false, false).unwrap(),
            "x = 1"
        );
        assert_eq!(
            run_cell_code("x = 1\n", &CellId::Index(0), file, true, false).unwrap(),
            "%%debug\nx = 1"
        );
    }

    #[tokio::test]
    async fn test_ids_and_tab_titles() {
        let mut fx = Fixture::new(vec![]);
        let a = fx.open("/rt/kernel-1.json", ClientConfig::default());
        let b = fx.open("/rt/kernel-1.json", ClientConfig::default());
        let c = fx.open(
            "/rt/kernel-2.json",
            ClientConfig {
                filename: Some(PathBuf::from("/p/one/run.py")),
                ..Default::default()
            },
        );
        assert_eq!(fx.manager.client(a).unwrap().ids().to_string(), "1/A");
        assert_eq!(fx.manager.client(b).unwrap().ids().to_string(), "1/B");
        assert_eq!(fx.manager.client(c).unwrap().ids().to_string(), "2/A");
        assert_eq!(fx.manager.related_clients(a), vec![b]);
        assert_eq!(fx.manager.current(), Some(c));

        fx.open(
            "/rt/kernel-3.json",
            ClientConfig {
                filename: Some(PathBuf::from("/p/two/run.py")),
                ..Default::default()
            },
        );
        assert_eq!(
            fx.record.last_tabs(),
            vec!["Console 1/A", "Console 1/B", "one/run.py", "two/run.py"]
        );
    }

    #[tokio::test]
    async fn test_close_with_related_clients() {
        let mut fx = Fixture::new(vec![true]);
        let a = fx.open("/rt/kernel-1.json", ClientConfig::default());
        let b = fx.open("/rt/kernel-1.json", ClientConfig::default());
        let c = fx.open("/rt/kernel-2.json", ClientConfig::default());

        assert!(fx.manager.close_client(a, false).await);
        assert_eq!(fx.answers.asked(), vec![Question::CloseRelated { count: 1 }]);
        assert!(fx.manager.client(b).is_none());
        assert_eq!(fx.manager.clients().len(), 1);
        assert_eq!(fx.manager.current(), Some(c));
        assert!(!fx.manager.close_client(a, false).await);
    }

    #[tokio::test]
    async fn test_close_keeps_related_when_declined() {
        let mut fx = Fixture::new(vec![false]);
        let a = fx.open("/rt/kernel-1.json", ClientConfig::default());
        let b = fx.open("/rt/kernel-1.json", ClientConfig::default());
        fx.manager.set_current(a);

        assert!(fx.manager.close_client(a, false).await);
        assert_eq!(fx.manager.current(), Some(b));
        assert_eq!(fx.record.last_tabs(), vec!["Console 1/B"]);
    }

    #[tokio::test]
    async fn test_unwritable_runtime_dir_shows_error_page() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let mut fx = Fixture::with_options(
            vec![],
            ManagerOptions {
                runtime_dir: blocker.join("runtime"),
                stderr_dir: tmp.path().join("stderr"),
                pdb_history_path: None,
                ..Default::default()
            },
        );

        let id = fx
            .manager
            .new_client(KernelFlavor::Plain, None, None)
            .await
            .unwrap();

        let client = fx.manager.client(id).unwrap();
        assert!(client.page().is_error());
        assert!(client.transport().is_none());
        let InfoPage::KernelError { error, .. } = client.page() else {
            panic!("expected the kernel error page");
        };
        assert!(error.contains("is not writable"));
        assert!(error.contains("Please make it writable"));
        assert_eq!(fx.manager.clients().len(), 1);
        assert!(fx.record.events().iter().any(|event| matches!(
            event,
            CollaboratorEvent::Page(page_id, html) if *page_id == id && html.contains("is not writable")
        )));
    }

    #[tokio::test]
    async fn test_closing_master_and_slave_stops_kernel_once() {
        use std::sync::atomic::Ordering;

        let mut fx = Fixture::new(vec![true]);
        let (keeper, shutdowns) = local_kernel();
        let master = fx.open_local(&keeper);
        let slave = fx.open_local(&keeper);
        assert_eq!(keeper.sharers(), 2);

        assert!(fx.manager.close_client(master, false).await);
        assert!(fx.manager.client(slave).is_none());
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(keeper.sharers(), 0);

        assert!(!fx.manager.close_client(slave, true).await);
        fx.manager.close_all().await;
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slave_keeps_kernel_until_it_closes() {
        use std::sync::atomic::Ordering;

        let mut fx = Fixture::new(vec![false]);
        let (keeper, shutdowns) = local_kernel();
        let master = fx.open_local(&keeper);
        let slave = fx.open_local(&keeper);

        assert!(fx.manager.close_client(master, false).await);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 0);
        assert!(fx.manager.client(slave).is_some());

        assert!(fx.manager.close_client(slave, false).await);
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_go_to_error_resolves_paths() {
        let mut fx = Fixture::new(vec![]);
        assert!(fx.manager.go_to_error("  File \"/src/mod.py\", line 12, in f"));
        assert!(!fx.manager.go_to_error("ZeroDivisionError: division by zero"));

        fx.manager.run_cell_filename = Some(PathBuf::from("/src/cells.py"));
        assert!(fx
            .manager
            .go_to_error("  File \"<ipython-input-3-abc>\", line 2, in <module>"));
        assert_eq!(
            fx.record.events(),
            vec![
                CollaboratorEvent::OpenFile(PathBuf::from("/src/mod.py"), 12),
                CollaboratorEvent::OpenFile(PathBuf::from("/src/cells.py"), 2),
            ]
        );

        let home = dirs::home_dir().unwrap();
        assert_eq!(fx.manager.resolve_error_path("~/x.py"), home.join("x.py"));
    }

    #[tokio::test]
    async fn test_run_script_in_current_console() {
        let mut fx = Fixture::new(vec![]);
        let id = fx.open("/rt/kernel-1.json", ClientConfig::default());
        fx.manager.client_mut(id).unwrap().shell_mut().show_prompt();

        let options = RunOptions {
            current_client: true,
            ..Default::default()
        };
        fx.manager
            .run_script(Path::new("/work/a.py"), options.clone())
            .await
            .unwrap();
        assert_eq!(sent_code(&mut fx.outgoing[0]), "%run /work/a.py");
        assert!(fx.view(id).contains("Using <b>%run</b> instead"));

        // Busy now: the second request is dropped.
        fx.manager
            .run_script(Path::new("/work/a.py"), options)
            .await
            .unwrap();
        assert!(fx.outgoing[0].try_recv().is_err());
    }

    #[tokio::test]
    async fn test_run_cell_uses_file_console() {
        let mut fx = Fixture::new(vec![]);
        let file_client = fx.open(
            "/rt/kernel-1.json",
            ClientConfig {
                filename: Some(PathBuf::from("/work/a.py")),
                ..Default::default()
            },
        );
        fx.open("/rt/kernel-2.json", ClientConfig::default());
        fx.manager
            .client_mut(file_client)
            .unwrap()
            .shell_mut()
            .show_prompt();

        fx.manager
            .run_cell("y = 2\n", CellId::Index(1), Path::new("/work/a.py"), false)
            .unwrap();
        assert_eq!(sent_code(&mut fx.outgoing[0]), "y = 2");
        assert!(fx.outgoing[1].try_recv().is_err());
        assert_eq!(
            fx.manager.resolve_error_path("<ipython-input-1-x>"),
            PathBuf::from("/work/a.py")
        );
    }

    #[tokio::test]
    async fn test_connection_failure_removes_client() {
        let mut fx = Fixture::new(vec![]);
        let id = fx.open("/rt/kernel-1.json", ClientConfig::default());
        fx.manager.handle_event(ClientEvent {
            client: id,
            event: crate::transport::TransportEvent::ConnectionFailed("refused".into()),
        });
        fx.manager.reap().await;
        assert!(fx.manager.clients().is_empty());
        assert!(fx
            .record
            .events()
            .contains(&CollaboratorEvent::Error("refused".to_string())));
    }
}
