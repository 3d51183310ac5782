//! Kernel channels and kernel process lifecycle.
//!
//! Two kinds of tasks live here:
//!
//! - A [`KernelKeeper`] owns a locally spawned kernel process. It is shared
//!   by every client talking to that kernel, restarts the process on
//!   request or when it dies, and kills it once the last client lets go.
//!   Clients are counted explicitly; `Arc` clones held by tasks do not
//!   keep the kernel alive.
//! - One worker per client owns that client's shell, iopub, stdin and
//!   control connections plus a heartbeat monitor. It forwards everything
//!   it reads as [`ClientEvent`]s and writes whatever the router queues.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jupyter_protocol::{ConnectionInfo, JupyterMessage, ShutdownRequest};
use kernel_launch::{interrupt_process_group, spawn_kernel, KernelProcess, LaunchSpec};
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::connection::{self, KernelConnection, TransportKind};
use crate::error::{ConsoleError, Result};
use crate::router::{Inbound, MessageSink};
use crate::tunnel::SshTunnel;
use crate::wire::{Channel, Outgoing};

/// How long a graceful shutdown waits for the process to exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// How long a worker gets to flush and stop before it is aborted.
const STOP_TIMEOUT: Duration = Duration::from_secs(2);
/// Pause between heartbeat pings.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);
/// Unexpected exits restarted automatically before giving up.
const MAX_AUTO_RESTARTS: u32 = 5;

/// Identifies a client across tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// What a client's transport reports.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Message(Inbound, JupyterMessage),
    ProcessStarted,
    ProcessFinished,
    /// The heartbeat stopped answering or the process exited.
    KernelDied,
    /// `stderr` is what the previous process wrote before it went away.
    KernelRestarted {
        died: bool,
        stderr: String,
    },
    RestartFailed(String),
    /// Channels could not be opened.
    ConnectionFailed(String),
}

#[derive(Debug, Clone)]
pub struct ClientEvent {
    pub client: ClientId,
    pub event: TransportEvent,
}

pub type EventSender = mpsc::UnboundedSender<ClientEvent>;

// ============================================================================
// Kernel keeper
// ============================================================================

/// Process lifecycle broadcast to every client of a kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    Died,
    Restarted { died: bool, stderr: String },
    RestartFailed(String),
    Finished,
}

enum KeeperCommand {
    Restart {
        died: bool,
        requested_at: Instant,
        reply: oneshot::Sender<Result<()>>,
    },
    Interrupt {
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        now: bool,
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a kernel process spawned by this console.
pub struct KernelKeeper {
    commands: mpsc::UnboundedSender<KeeperCommand>,
    lifecycle: broadcast::Sender<Lifecycle>,
    connection: KernelConnection,
    stderr_path: PathBuf,
    spec: LaunchSpec,
    /// Transports currently attached.
    sharers: AtomicUsize,
}

impl std::fmt::Debug for KernelKeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelKeeper")
            .field("kernel_id", &self.connection.kernel_id())
            .field("stderr_path", &self.stderr_path)
            .field("sharers", &self.sharers())
            .finish()
    }
}

impl KernelKeeper {
    /// Write the connection file and spawn the kernel.
    ///
    /// The keeper task runs until [`KernelKeeper::shutdown`] or until the
    /// last `Arc` is dropped, then kills the process and removes the
    /// connection and stderr files.
    pub async fn start(
        spec: LaunchSpec,
        connection_file: PathBuf,
        stderr_path: PathBuf,
    ) -> Result<Arc<KernelKeeper>> {
        spec.check_modules().await?;
        let info = connection::new_local_connection_info(&spec.kernel_name()).await?;
        connection::write_connection_file(&connection_file, &info)?;

        let process = match spawn_kernel(&spec, &connection_file, &stderr_path).await {
            Ok(process) => process,
            Err(e) => {
                let _ = std::fs::remove_file(&connection_file);
                let captured = kernel_launch::read_stderr(&stderr_path);
                let mut err = ConsoleError::from(e);
                if let ConsoleError::SpawnFailed(msg) = &mut err {
                    if !captured.trim().is_empty() {
                        msg.push('\n');
                        msg.push_str(&captured);
                    }
                }
                return Err(err);
            }
        };

        let connection = KernelConnection::new(
            Some(connection_file.clone()),
            info.clone(),
            TransportKind::Local,
        );
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (lifecycle, _) = broadcast::channel(16);

        let keeper = KeeperTask {
            spec: spec.clone(),
            info,
            connection_file,
            stderr_path: stderr_path.clone(),
            process: Some(process),
            started_at: Instant::now(),
            auto_restarts: 0,
            lifecycle: lifecycle.clone(),
            name: petname::petname(2, "-").unwrap_or_else(|| connection.kernel_id()),
        };
        info!("[transport] Kernel {} started", keeper.name);
        tokio::spawn(keeper.run(command_rx));

        Ok(Arc::new(KernelKeeper {
            commands,
            lifecycle,
            connection,
            stderr_path,
            spec,
            sharers: AtomicUsize::new(0),
        }))
    }

    pub fn connection(&self) -> &KernelConnection {
        &self.connection
    }

    pub fn stderr_path(&self) -> &Path {
        &self.stderr_path
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Lifecycle> {
        self.lifecycle.subscribe()
    }

    /// Number of transports attached to this kernel.
    pub fn sharers(&self) -> usize {
        self.sharers.load(Ordering::SeqCst)
    }

    fn join(&self) {
        self.sharers.fetch_add(1, Ordering::SeqCst);
    }

    /// Detach one transport. True when it was the last one.
    fn leave(&self) -> bool {
        self.sharers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map(|previous| previous == 1)
            .unwrap_or(false)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> KeeperCommand,
    ) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).ok()?;
        rx.await.ok()
    }

    /// Kill and respawn the process with the same connection file.
    pub async fn restart(&self) -> Result<()> {
        let requested_at = Instant::now();
        self.request(|reply| KeeperCommand::Restart {
            died: false,
            requested_at,
            reply,
        })
        .await
        .unwrap_or(Err(ConsoleError::NoKernel))
    }

    /// Ask for a restart after the kernel was found dead; does not wait.
    pub fn restart_dead(&self) {
        let (reply, _) = oneshot::channel();
        let _ = self.commands.send(KeeperCommand::Restart {
            died: true,
            requested_at: Instant::now(),
            reply,
        });
    }

    /// Ask for a graceful shutdown; does not wait.
    fn shutdown_in_background(&self) {
        let (reply, _) = oneshot::channel();
        let _ = self.commands.send(KeeperCommand::Shutdown { now: false, reply });
    }

    /// SIGINT the kernel's process group.
    pub async fn interrupt(&self) -> Result<()> {
        self.request(|reply| KeeperCommand::Interrupt { reply })
            .await
            .unwrap_or(Err(ConsoleError::NoKernel))
    }

    /// Stop the process. A second call is a no-op.
    pub async fn shutdown(&self, now: bool) {
        let _ = self
            .request(|reply| KeeperCommand::Shutdown { now, reply })
            .await;
    }
}

#[cfg(test)]
impl KernelKeeper {
    /// A keeper with no process behind it that counts shutdown requests.
    pub(crate) fn counting(connection: KernelConnection) -> (Arc<Self>, Arc<AtomicUsize>) {
        let (commands, mut command_rx) = mpsc::unbounded_channel();
        let (lifecycle, _) = broadcast::channel(4);
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let counter = shutdowns.clone();
        tokio::spawn(async move {
            while let Some(command) = command_rx.recv().await {
                match command {
                    KeeperCommand::Shutdown { reply, .. } => {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let _ = reply.send(());
                    }
                    KeeperCommand::Restart { reply, .. } | KeeperCommand::Interrupt { reply } => {
                        let _ = reply.send(Ok(()));
                    }
                }
            }
        });
        let keeper = Arc::new(KernelKeeper {
            commands,
            lifecycle,
            connection,
            stderr_path: PathBuf::from("/tmp/kernel-counting.stderr"),
            spec: LaunchSpec::for_interpreter("python3", kernel_launch::KernelFlavor::Plain),
            sharers: AtomicUsize::new(0),
        });
        (keeper, shutdowns)
    }
}

enum KeeperEvent {
    Exited(Option<std::process::ExitStatus>),
    Command(Option<KeeperCommand>),
}

struct KeeperTask {
    spec: LaunchSpec,
    info: ConnectionInfo,
    connection_file: PathBuf,
    stderr_path: PathBuf,
    process: Option<KernelProcess>,
    started_at: Instant,
    auto_restarts: u32,
    lifecycle: broadcast::Sender<Lifecycle>,
    name: String,
}

impl KeeperTask {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<KeeperCommand>) {
        loop {
            let event = match self.process.as_mut() {
                Some(process) => tokio::select! {
                    status = process.child.wait() => KeeperEvent::Exited(status.ok()),
                    cmd = commands.recv() => KeeperEvent::Command(cmd),
                },
                None => KeeperEvent::Command(commands.recv().await),
            };

            match event {
                KeeperEvent::Exited(status) => {
                    warn!(
                        "[transport] Kernel {} exited unexpectedly: {:?}",
                        self.name, status
                    );
                    self.process = None;
                    let _ = self.lifecycle.send(Lifecycle::Died);
                    if self.auto_restarts < MAX_AUTO_RESTARTS {
                        self.auto_restarts += 1;
                        let _ = self.restart(true).await;
                    } else {
                        error!(
                            "[transport] Kernel {} died {} times, not restarting",
                            self.name, self.auto_restarts
                        );
                    }
                }
                KeeperEvent::Command(Some(KeeperCommand::Restart {
                    died,
                    requested_at,
                    reply,
                })) => {
                    // A death report older than the current process is stale.
                    let result = if died && self.process.is_some() && self.started_at > requested_at
                    {
                        Ok(())
                    } else {
                        if !died {
                            self.auto_restarts = 0;
                        }
                        self.restart(died).await
                    };
                    let _ = reply.send(result);
                }
                KeeperEvent::Command(Some(KeeperCommand::Interrupt { reply })) => {
                    let _ = reply.send(self.interrupt());
                }
                KeeperEvent::Command(Some(KeeperCommand::Shutdown { now, reply })) => {
                    self.stop(now).await;
                    let _ = reply.send(());
                    return;
                }
                KeeperEvent::Command(None) => {
                    debug!("[transport] Last client of kernel {} gone", self.name);
                    self.stop(false).await;
                    return;
                }
            }
        }
    }

    async fn restart(&mut self, died: bool) -> Result<()> {
        info!("[transport] Restarting kernel {} (died={})", self.name, died);
        if let Some(mut process) = self.process.take() {
            process.kill().await;
        }
        // Respawning truncates the stderr file.
        let stderr = kernel_launch::read_stderr(&self.stderr_path);
        match spawn_kernel(&self.spec, &self.connection_file, &self.stderr_path).await {
            Ok(process) => {
                self.process = Some(process);
                self.started_at = Instant::now();
                let _ = self.lifecycle.send(Lifecycle::Restarted { died, stderr });
                Ok(())
            }
            Err(e) => {
                let err = ConsoleError::RestartFailed(e.to_string());
                error!("[transport] {}", err);
                let _ = self.lifecycle.send(Lifecycle::RestartFailed(err.to_string()));
                Err(err)
            }
        }
    }

    fn interrupt(&self) -> Result<()> {
        let pgid = self
            .process
            .as_ref()
            .and_then(|p| p.pgid)
            .ok_or(ConsoleError::NoKernel)?;
        interrupt_process_group(pgid)?;
        debug!("[transport] Sent SIGINT to kernel {}", self.name);
        Ok(())
    }

    async fn stop(&mut self, now: bool) {
        if let Some(mut process) = self.process.take() {
            if !now {
                match tokio::time::timeout(SHUTDOWN_GRACE, self.request_shutdown()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("[transport] shutdown_request failed: {:#}", e),
                    Err(_) => warn!(
                        "[transport] Kernel {} did not take shutdown_request in time",
                        self.name
                    ),
                }
                if tokio::time::timeout(SHUTDOWN_GRACE, process.child.wait())
                    .await
                    .is_err()
                {
                    warn!(
                        "[transport] Kernel {} ignored shutdown_request, killing",
                        self.name
                    );
                }
            }
            process.kill().await;
        }
        let _ = std::fs::remove_file(&self.connection_file);
        let _ = std::fs::remove_file(&self.stderr_path);
        let _ = self.lifecycle.send(Lifecycle::Finished);
        info!("[transport] Kernel {} shut down", self.name);
    }

    async fn request_shutdown(&self) -> anyhow::Result<()> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let mut control =
            runtimelib::create_client_control_connection(&self.info, &session_id).await?;
        let request: JupyterMessage = ShutdownRequest { restart: false }.into();
        control.send(request).await?;
        Ok(())
    }
}

// ============================================================================
// Channels
// ============================================================================

/// Router-facing writer: queues messages for the worker.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    outgoing: mpsc::UnboundedSender<Outgoing>,
}

impl MessageSink for ChannelSink {
    fn send(&self, outgoing: Outgoing) -> Result<()> {
        self.outgoing
            .send(outgoing)
            .map_err(|_| ConsoleError::NoKernel)
    }
}

/// A client's end of its transport.
pub struct TransportHandle {
    client: ClientId,
    connection: KernelConnection,
    keeper: Option<Arc<KernelKeeper>>,
    sink: Arc<ChannelSink>,
    stop: Option<mpsc::UnboundedSender<oneshot::Sender<()>>>,
    task: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("client", &self.client)
            .field("kernel_id", &self.connection.kernel_id())
            .field("kind", &self.connection.kind)
            .finish()
    }
}

impl TransportHandle {
    /// Open the channels on a worker task.
    ///
    /// `keeper` is set for kernels this console spawned, `tunnel` for
    /// kernels reached over ssh; the worker closes the tunnel when it stops.
    pub fn start(
        client: ClientId,
        connection: KernelConnection,
        keeper: Option<Arc<KernelKeeper>>,
        tunnel: Option<SshTunnel>,
        time_to_dead: Duration,
        events: EventSender,
    ) -> Self {
        if let Some(keeper) = &keeper {
            keeper.join();
        }
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            client,
            info: connection.info.clone(),
            session_id: uuid::Uuid::new_v4().to_string(),
            local: keeper.is_some(),
            keeper: keeper.clone(),
            lifecycle: keeper.as_ref().map(|k| k.subscribe()),
            tunnel,
            time_to_dead,
            events,
            outgoing: outgoing_rx,
            stop: stop_rx,
        };
        let task = tokio::spawn(worker.run());
        Self {
            client,
            connection,
            keeper,
            sink: Arc::new(ChannelSink {
                outgoing: outgoing_tx,
            }),
            stop: Some(stop_tx),
            task: Some(task),
        }
    }

    /// A transport with no kernel behind it; queued messages come out of
    /// the returned receiver.
    pub fn detached(
        client: ClientId,
        connection: KernelConnection,
    ) -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let handle = Self {
            client,
            connection,
            keeper: None,
            sink: Arc::new(ChannelSink {
                outgoing: outgoing_tx,
            }),
            stop: None,
            task: None,
        };
        (handle, outgoing_rx)
    }

    /// Like [`TransportHandle::detached`], attached to `keeper`.
    #[cfg(test)]
    pub(crate) fn detached_sharing(
        client: ClientId,
        keeper: Arc<KernelKeeper>,
    ) -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (mut handle, outgoing) = Self::detached(client, keeper.connection().clone());
        keeper.join();
        handle.keeper = Some(keeper);
        (handle, outgoing)
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub fn connection(&self) -> &KernelConnection {
        &self.connection
    }

    pub fn keeper(&self) -> Option<&Arc<KernelKeeper>> {
        self.keeper.as_ref()
    }

    pub fn sink(&self) -> Arc<dyn MessageSink> {
        self.sink.clone()
    }

    /// Whether this console spawned the kernel.
    pub fn owns_process(&self) -> bool {
        self.keeper.is_some()
    }

    pub fn stderr_path(&self) -> Option<&Path> {
        self.keeper.as_deref().map(KernelKeeper::stderr_path)
    }

    /// Restart the kernel. Not permitted for kernels started elsewhere.
    pub async fn restart(&self) -> Result<()> {
        match &self.keeper {
            Some(keeper) => keeper.restart().await,
            None => Err(ConsoleError::NotPermitted(
                crate::banner::RESTART_NOT_PERMITTED.to_string(),
            )),
        }
    }

    /// Signal-based interrupt, for local kernels only.
    pub async fn interrupt(&self) -> Result<()> {
        match &self.keeper {
            Some(keeper) => keeper.interrupt().await,
            None => Err(ConsoleError::NoKernel),
        }
    }

    /// Stop the worker after it wrote everything already queued.
    ///
    /// A worker that does not stop in time (still connecting, say) is
    /// aborted.
    pub async fn stop_channels(&mut self) {
        if let Some(stop) = self.stop.take() {
            let (tx, rx) = oneshot::channel();
            if stop.send(tx).is_ok() {
                let _ = tokio::time::timeout(STOP_TIMEOUT, rx).await;
            }
        }
        if let Some(mut task) = self.task.take() {
            if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
                warn!("[transport] {} worker did not stop in time, aborting", self.client);
                task.abort();
                let _ = task.await;
            }
        }
    }

    /// Stop channels, and the kernel too when this is its last client.
    ///
    /// Kernels started elsewhere are only detached. Calling this twice is
    /// harmless.
    pub async fn shutdown(&mut self, now: bool) {
        self.stop_channels().await;
        if let Some(keeper) = self.keeper.take() {
            if keeper.leave() {
                keeper.shutdown(now).await;
            } else {
                debug!(
                    "[transport] {} detached, kernel still has {} other clients",
                    self.client,
                    keeper.sharers()
                );
            }
        }
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(keeper) = self.keeper.take() {
            if keeper.leave() {
                keeper.shutdown_in_background();
            }
        }
    }
}

struct Worker {
    client: ClientId,
    info: ConnectionInfo,
    session_id: String,
    local: bool,
    keeper: Option<Arc<KernelKeeper>>,
    lifecycle: Option<broadcast::Receiver<Lifecycle>>,
    tunnel: Option<SshTunnel>,
    time_to_dead: Duration,
    events: EventSender,
    outgoing: mpsc::UnboundedReceiver<Outgoing>,
    stop: mpsc::UnboundedReceiver<oneshot::Sender<()>>,
}

enum WorkerExit {
    Reconnect { died: bool, stderr: String },
    Stop(Option<oneshot::Sender<()>>),
    Finished,
}

async fn next_lifecycle(rx: &mut Option<broadcast::Receiver<Lifecycle>>) -> Option<Lifecycle> {
    let Some(rx) = rx.as_mut() else {
        return std::future::pending().await;
    };
    loop {
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("[transport] Missed {} lifecycle events", n);
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

/// Ping the kernel until it stops answering within `time_to_dead`.
async fn heartbeat_monitor(info: ConnectionInfo, time_to_dead: Duration, dead: mpsc::Sender<()>) {
    loop {
        let beat = tokio::time::timeout(time_to_dead, async {
            let mut hb = runtimelib::create_client_heartbeat_connection(&info).await?;
            hb.single_heartbeat().await
        })
        .await;
        if !matches!(beat, Ok(Ok(()))) {
            let _ = dead.send(()).await;
            return;
        }
        tokio::time::sleep(HEARTBEAT_INTERVAL).await;
    }
}

impl Worker {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(ClientEvent {
            client: self.client,
            event,
        });
    }

    async fn forward<E: std::fmt::Display>(
        &self,
        inbound: Inbound,
        result: std::result::Result<JupyterMessage, E>,
    ) {
        match result {
            Ok(msg) => self.emit(TransportEvent::Message(inbound, msg)),
            Err(e) => {
                warn!("[transport] {} {:?} read failed: {}", self.client, inbound, e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }

    async fn run(mut self) {
        let mut first = true;
        loop {
            let info = self.info.clone();
            let session_id = self.session_id.clone();
            let channels = async {
                let identity = runtimelib::peer_identity_for_session(&session_id)?;
                let shell = runtimelib::create_client_shell_connection_with_identity(
                    &info,
                    &session_id,
                    identity.clone(),
                )
                .await?;
                let stdin = runtimelib::create_client_stdin_connection_with_identity(
                    &info,
                    &session_id,
                    identity,
                )
                .await?;
                let iopub =
                    runtimelib::create_client_iopub_connection(&info, "", &session_id).await?;
                let control =
                    runtimelib::create_client_control_connection(&info, &session_id).await?;
                anyhow::Ok((shell, stdin, iopub, control))
            }
            .await;

            let (shell, mut stdin_conn, mut iopub, mut control) = match channels {
                Ok(channels) => channels,
                Err(e) => {
                    let err = ConsoleError::connection(&e);
                    error!("[transport] {} {}", self.client, err);
                    self.emit(TransportEvent::ConnectionFailed(err.to_string()));
                    self.close_tunnel().await;
                    return;
                }
            };
            let (mut shell_writer, mut shell_reader) = shell.split();
            info!("[transport] {} channels started", self.client);
            if first && self.local {
                self.emit(TransportEvent::ProcessStarted);
            }
            first = false;

            let (hb_tx, mut hb_rx) = mpsc::channel(1);
            let heartbeat = tokio::spawn(heartbeat_monitor(info.clone(), self.time_to_dead, hb_tx));
            let mut dead = false;

            macro_rules! write_out {
                ($out:expr) => {{
                    let Outgoing { channel, message } = $out;
                    let msg_type = message.header.msg_type.clone();
                    let result = match channel {
                        Channel::Shell => shell_writer.send(message).await.map_err(|e| e.to_string()),
                        Channel::Stdin => stdin_conn.send(message).await.map_err(|e| e.to_string()),
                        Channel::Control => control.send(message).await.map_err(|e| e.to_string()),
                    };
                    if let Err(e) = result {
                        warn!("[transport] {} failed to send {} on {}: {}", self.client, msg_type, channel, e);
                    }
                }};
            }

            let exit = loop {
                tokio::select! {
                    out = self.outgoing.recv() => match out {
                        Some(out) => write_out!(out),
                        None => break WorkerExit::Stop(None),
                    },
                    stop = self.stop.recv() => break WorkerExit::Stop(stop),
                    event = next_lifecycle(&mut self.lifecycle) => match event {
                        Some(Lifecycle::Restarted { died, stderr }) => {
                            break WorkerExit::Reconnect { died, stderr }
                        }
                        Some(Lifecycle::Died) => {
                            if !dead {
                                dead = true;
                                self.emit(TransportEvent::KernelDied);
                            }
                        }
                        Some(Lifecycle::RestartFailed(msg)) => {
                            self.emit(TransportEvent::RestartFailed(msg));
                        }
                        Some(Lifecycle::Finished) | None => break WorkerExit::Finished,
                    },
                    Some(()) = hb_rx.recv(), if !dead => {
                        warn!("[transport] {} heartbeat lost", self.client);
                        dead = true;
                        self.emit(TransportEvent::KernelDied);
                        if let Some(keeper) = &self.keeper {
                            keeper.restart_dead();
                        }
                    }
                    msg = iopub.read() => self.forward(Inbound::IoPub, msg).await,
                    msg = shell_reader.read() => self.forward(Inbound::Shell, msg).await,
                    msg = stdin_conn.read() => self.forward(Inbound::Stdin, msg).await,
                    msg = control.read() => self.forward(Inbound::Control, msg).await,
                }
            };
            heartbeat.abort();

            match exit {
                WorkerExit::Reconnect { died, stderr } => {
                    info!("[transport] {} reconnecting after restart", self.client);
                    self.emit(TransportEvent::KernelRestarted { died, stderr });
                }
                WorkerExit::Stop(reply) => {
                    while let Ok(out) = self.outgoing.try_recv() {
                        write_out!(out);
                    }
                    self.close_tunnel().await;
                    info!("[transport] {} channels stopped", self.client);
                    if let Some(reply) = reply {
                        let _ = reply.send(());
                    }
                    return;
                }
                WorkerExit::Finished => {
                    self.emit(TransportEvent::ProcessFinished);
                    self.close_tunnel().await;
                    return;
                }
            }
        }
    }

    async fn close_tunnel(&mut self) {
        if let Some(tunnel) = self.tunnel.take() {
            tunnel.close().await;
        }
    }
}
