//! Request bookkeeping and reply routing.
//!
//! Every request the console sends is registered in one pending table,
//! keyed by `msg_id`, before it goes out. Replies and iopub traffic are
//! matched through their parent header; anything that does not match an
//! entry belongs to another frontend or to a request that was abandoned,
//! and is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use jupyter_protocol::{ExecutionState, JupyterMessage, JupyterMessageContent, ReplyStatus};
use log::{debug, warn};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{ConsoleError, Result};
use crate::wire::{self, Channel, ExpressionOutcome, KernelMethod, Outgoing};

/// Where frames leave the console. Implemented by the transport.
pub trait MessageSink: Send + Sync {
    fn send(&self, outgoing: Outgoing) -> Result<()>;
}

/// Sink that keeps every frame, for driving a console without a kernel.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    sent: Arc<StdMutex<Vec<Outgoing>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<Outgoing> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Frames sent since the last call.
    pub fn take(&self) -> Vec<Outgoing> {
        self.sent
            .lock()
            .map(|mut s| std::mem::take(&mut *s))
            .unwrap_or_default()
    }
}

impl MessageSink for RecordingSink {
    fn send(&self, outgoing: Outgoing) -> Result<()> {
        self.sent
            .lock()
            .map_err(|_| ConsoleError::connection("recording sink poisoned"))?
            .push(outgoing);
        Ok(())
    }
}

/// Channel a kernel message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Shell,
    IoPub,
    Stdin,
    Control,
}

pub type ReplySender<T> = oneshot::Sender<Result<T>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub matches: Vec<String>,
    pub cursor_start: usize,
    pub cursor_end: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inspection {
    pub found: bool,
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeCompleteness {
    Complete,
    Incomplete { indent: String },
    Invalid,
    Unknown,
}

/// The parts of `kernel_info_reply` the console shows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelInfo {
    pub implementation: String,
    pub implementation_version: String,
    pub language_version: String,
    pub banner: String,
}

/// What a pending request is waiting for, and who gets the answer.
pub enum RequestKind {
    VisibleExecute,
    SilentExecute,
    Method {
        tag: String,
        method: KernelMethod,
        reply: Option<ReplySender<Value>>,
    },
    Complete(Option<ReplySender<Completion>>),
    Inspect(Option<ReplySender<Inspection>>),
    IsComplete(Option<ReplySender<CodeCompleteness>>),
    KernelInfo(Option<ReplySender<KernelInfo>>),
    Interrupt,
    Shutdown { restart: bool },
}

impl RequestKind {
    fn name(&self) -> &'static str {
        match self {
            RequestKind::VisibleExecute => "execute",
            RequestKind::SilentExecute => "silent-execute",
            RequestKind::Method { .. } => "method",
            RequestKind::Complete(_) => "complete",
            RequestKind::Inspect(_) => "inspect",
            RequestKind::IsComplete(_) => "is-complete",
            RequestKind::KernelInfo(_) => "kernel-info",
            RequestKind::Interrupt => "interrupt",
            RequestKind::Shutdown { .. } => "shutdown",
        }
    }

    fn is_hidden(&self) -> bool {
        matches!(
            self,
            RequestKind::SilentExecute | RequestKind::Method { .. }
        )
    }

    /// Executions end on reply plus idle; everything else on the reply.
    fn needs_idle(&self) -> bool {
        matches!(
            self,
            RequestKind::VisibleExecute | RequestKind::SilentExecute | RequestKind::Method { .. }
        )
    }

    /// The waiting caller went away.
    fn is_abandoned(&self) -> bool {
        match self {
            RequestKind::Method { reply, .. } => reply.as_ref().map_or(false, |r| r.is_closed()),
            RequestKind::Complete(r) => r.as_ref().map_or(false, |r| r.is_closed()),
            RequestKind::Inspect(r) => r.as_ref().map_or(false, |r| r.is_closed()),
            RequestKind::IsComplete(r) => r.as_ref().map_or(false, |r| r.is_closed()),
            RequestKind::KernelInfo(r) => r.as_ref().map_or(false, |r| r.is_closed()),
            _ => false,
        }
    }

    fn fail(&mut self, error: impl Fn() -> ConsoleError) {
        match self {
            RequestKind::Method { reply, .. } => send_reply(reply, Err(error())),
            RequestKind::Complete(r) => send_reply(r, Err(error())),
            RequestKind::Inspect(r) => send_reply(r, Err(error())),
            RequestKind::IsComplete(r) => send_reply(r, Err(error())),
            RequestKind::KernelInfo(r) => send_reply(r, Err(error())),
            _ => {}
        }
    }
}

fn send_reply<T>(slot: &mut Option<ReplySender<T>>, value: Result<T>) {
    if let Some(tx) = slot.take() {
        let _ = tx.send(value);
    }
}

pub struct PendingRequest {
    pub kind: RequestKind,
    pub submitted_at: Instant,
    saw_reply: bool,
    saw_idle: bool,
}

impl PendingRequest {
    fn new(kind: RequestKind) -> Self {
        Self {
            kind,
            submitted_at: Instant::now(),
            saw_reply: false,
            saw_idle: false,
        }
    }

    fn done(&self) -> bool {
        self.saw_reply && (self.saw_idle || !self.kind.needs_idle())
    }
}

type PendingTable = Arc<StdMutex<HashMap<String, PendingRequest>>>;

/// Answer to a request, bounded by a timeout.
///
/// On timeout the pending entry is removed, so a late reply is dropped as
/// an orphan.
pub struct ReplyFuture<T> {
    msg_id: String,
    rx: oneshot::Receiver<Result<T>>,
    timeout: Duration,
    pending: PendingTable,
    what: &'static str,
}

impl<T> ReplyFuture<T> {
    pub fn msg_id(&self) -> &str {
        &self.msg_id
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn wait(self) -> Result<T> {
        match tokio::time::timeout(self.timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConsoleError::Restarted),
            Err(_) => {
                if let Ok(mut pending) = self.pending.lock() {
                    pending.remove(&self.msg_id);
                }
                Err(ConsoleError::Timeout(self.what.to_string()))
            }
        }
    }
}

/// Reply to the visible execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReply {
    pub ok: bool,
    pub aborted: bool,
    pub execution_count: Option<u32>,
    /// `obj?` help text returned as a page payload.
    pub page: Option<String>,
}

/// Output produced by the visible execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Stream {
        stderr: bool,
        text: String,
    },
    Result {
        execution_count: Option<u32>,
        text: Option<String>,
        html: Option<String>,
    },
    Display {
        text: Option<String>,
        html: Option<String>,
    },
    Error {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },
    ClearOutput {
        wait: bool,
    },
    Input {
        execution_count: u32,
        code: String,
    },
}

/// What the shell has to react to.
#[derive(Debug, Clone)]
pub enum Routed {
    Output(Output),
    InputRequest {
        prompt: String,
        password: bool,
        request: JupyterMessage,
    },
    Reply(ExecutionReply),
    /// The visible execution went idle.
    Idle,
    /// A silent execution or method call completed.
    HiddenFinished,
    /// Status not tied to any request of ours, e.g. `starting`.
    KernelStatus(ExecutionState),
}

pub struct Router {
    pending: PendingTable,
    sink: Arc<dyn MessageSink>,
    method_timeout: Duration,
    orphans: usize,
}

impl Router {
    pub fn new(sink: Arc<dyn MessageSink>, method_timeout: Duration) -> Self {
        Self {
            pending: Arc::new(StdMutex::new(HashMap::new())),
            sink,
            method_timeout,
            orphans: 0,
        }
    }

    fn table(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, PendingRequest>>> {
        self.pending
            .lock()
            .map_err(|_| ConsoleError::connection("pending request table poisoned"))
    }

    /// Register, then send. The entry exists before any reply can arrive.
    fn submit(&self, channel: Channel, message: JupyterMessage, kind: RequestKind) -> Result<String> {
        let msg_id = message.header.msg_id.clone();
        debug!(
            "[router] -> {} {} ({})",
            channel,
            message.header.msg_type,
            kind.name()
        );
        self.table()?
            .insert(msg_id.clone(), PendingRequest::new(kind));
        if let Err(e) = self.sink.send(Outgoing { channel, message }) {
            self.table()?.remove(&msg_id);
            return Err(e);
        }
        Ok(msg_id)
    }

    fn reply_future<T>(&self, msg_id: String, rx: oneshot::Receiver<Result<T>>, what: &'static str) -> ReplyFuture<T> {
        ReplyFuture {
            msg_id,
            rx,
            timeout: self.method_timeout,
            pending: self.pending.clone(),
            what,
        }
    }

    pub fn has_visible_execution(&self) -> bool {
        self.table()
            .map(|t| t.values().any(|p| matches!(p.kind, RequestKind::VisibleExecute)))
            .unwrap_or(false)
    }

    /// Silent executions and method calls still in flight.
    pub fn hidden_in_flight(&self) -> usize {
        self.table()
            .map(|t| t.values().filter(|p| p.kind.is_hidden()).count())
            .unwrap_or(0)
    }

    pub fn pending_len(&self) -> usize {
        self.table().map(|t| t.len()).unwrap_or(0)
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans
    }

    /// Run `code` as the user's execution. Only one may be in flight.
    pub fn execute(&self, code: &str) -> Result<String> {
        if self.has_visible_execution() {
            return Err(ConsoleError::RequestWhileBusy);
        }
        self.submit(
            Channel::Shell,
            wire::execute_request(code, false, HashMap::new(), true),
            RequestKind::VisibleExecute,
        )
    }

    /// Run `code` without output, history or prompt changes.
    pub fn execute_silent(&self, code: &str) -> Result<String> {
        self.submit(
            Channel::Shell,
            wire::execute_request(code, true, HashMap::new(), false),
            RequestKind::SilentExecute,
        )
    }

    /// Call a kernel method; the result arrives as decoded JSON.
    pub fn call_method(&self, method: KernelMethod, args: &[Value]) -> Result<ReplyFuture<Value>> {
        let tag = format!("{}-{}", method.name(), uuid::Uuid::new_v4());
        let mut expressions = HashMap::new();
        expressions.insert(tag.clone(), wire::method_expression(method, args)?);
        let (tx, rx) = oneshot::channel();
        let msg_id = self.submit(
            Channel::Shell,
            wire::execute_request("", true, expressions, false),
            RequestKind::Method {
                tag,
                method,
                reply: Some(tx),
            },
        )?;
        Ok(self.reply_future(msg_id, rx, method.name()))
    }

    pub fn complete(&self, code: &str, cursor_pos: usize) -> Result<ReplyFuture<Completion>> {
        let (tx, rx) = oneshot::channel();
        let msg_id = self.submit(
            Channel::Shell,
            wire::complete_request(code, cursor_pos),
            RequestKind::Complete(Some(tx)),
        )?;
        Ok(self.reply_future(msg_id, rx, "complete"))
    }

    pub fn inspect(&self, code: &str, cursor_pos: usize) -> Result<ReplyFuture<Inspection>> {
        let (tx, rx) = oneshot::channel();
        let msg_id = self.submit(
            Channel::Shell,
            wire::inspect_request(code, cursor_pos, 0)?,
            RequestKind::Inspect(Some(tx)),
        )?;
        Ok(self.reply_future(msg_id, rx, "inspect"))
    }

    pub fn is_complete(&self, code: &str) -> Result<ReplyFuture<CodeCompleteness>> {
        let (tx, rx) = oneshot::channel();
        let msg_id = self.submit(
            Channel::Shell,
            wire::is_complete_request(code)?,
            RequestKind::IsComplete(Some(tx)),
        )?;
        Ok(self.reply_future(msg_id, rx, "is_complete"))
    }

    pub fn kernel_info(&self) -> Result<ReplyFuture<KernelInfo>> {
        let (tx, rx) = oneshot::channel();
        let msg_id = self.submit(
            Channel::Shell,
            wire::kernel_info_request(),
            RequestKind::KernelInfo(Some(tx)),
        )?;
        Ok(self.reply_future(msg_id, rx, "kernel_info"))
    }

    /// Answer an `input_request`. Not tracked; the kernel sends no reply.
    pub fn input_reply(&self, value: &str, request: &JupyterMessage) -> Result<()> {
        self.sink.send(Outgoing {
            channel: Channel::Stdin,
            message: wire::input_reply(value, request),
        })
    }

    pub fn interrupt(&self) -> Result<String> {
        self.submit(
            Channel::Control,
            wire::interrupt_request(),
            RequestKind::Interrupt,
        )
    }

    pub fn shutdown(&self, restart: bool) -> Result<String> {
        self.submit(
            Channel::Control,
            wire::shutdown_request(restart),
            RequestKind::Shutdown { restart },
        )
    }

    /// Fail every waiting caller and forget all requests.
    ///
    /// Returns whether a visible execution was outstanding.
    pub fn cancel_outstanding(&mut self) -> bool {
        let Ok(mut table) = self.table() else {
            return false;
        };
        let mut had_visible = false;
        for (_, mut entry) in table.drain() {
            had_visible |= matches!(entry.kind, RequestKind::VisibleExecute);
            entry.kind.fail(|| ConsoleError::Restarted);
        }
        had_visible
    }

    /// Drop entries whose callers stopped waiting.
    pub fn expire_abandoned(&self) -> usize {
        let Ok(mut table) = self.table() else {
            return 0;
        };
        let before = table.len();
        table.retain(|_, entry| !entry.kind.is_abandoned());
        let expired = before - table.len();
        if expired > 0 {
            debug!("[router] Expired {} abandoned requests", expired);
        }
        expired
    }

    /// Route one kernel message.
    pub fn on_message(&mut self, inbound: Inbound, msg: &JupyterMessage) -> Vec<Routed> {
        let parent = wire::parent_msg_id(msg).map(str::to_string);

        let mut table = match self.pending.lock() {
            Ok(table) => table,
            Err(_) => return Vec::new(),
        };
        let entry = parent.as_deref().and_then(|id| table.get_mut(id));

        let Some(entry) = entry else {
            drop(table);
            return self.unmatched(inbound, msg);
        };

        let mut routed = Vec::new();
        match &msg.content {
            JupyterMessageContent::Status(status) => {
                if status.execution_state == ExecutionState::Idle {
                    entry.saw_idle = true;
                    if matches!(entry.kind, RequestKind::VisibleExecute) {
                        routed.push(Routed::Idle);
                    }
                }
            }
            content if inbound == Inbound::IoPub => {
                if matches!(entry.kind, RequestKind::VisibleExecute) {
                    if let Some(output) = output_of(content) {
                        routed.push(Routed::Output(output));
                    }
                }
            }
            JupyterMessageContent::InputRequest(request) => {
                if matches!(entry.kind, RequestKind::VisibleExecute) {
                    routed.push(Routed::InputRequest {
                        prompt: request.prompt.clone(),
                        password: request.password,
                        request: msg.clone(),
                    });
                } else {
                    warn!("[router] input_request for a {} request", entry.kind.name());
                }
            }
            content => {
                entry.saw_reply = true;
                deliver_reply(&mut entry.kind, content, &mut routed);
            }
        }

        if entry.done() {
            let hidden = entry.kind.is_hidden();
            if let Some(id) = parent.as_deref() {
                table.remove(id);
            }
            if hidden {
                routed.push(Routed::HiddenFinished);
            }
        }
        routed
    }

    fn unmatched(&mut self, inbound: Inbound, msg: &JupyterMessage) -> Vec<Routed> {
        if let JupyterMessageContent::Status(status) = &msg.content {
            if msg.parent_header.is_none()
                || matches!(
                    status.execution_state,
                    ExecutionState::Starting | ExecutionState::Restarting | ExecutionState::Dead
                )
            {
                return vec![Routed::KernelStatus(status.execution_state.clone())];
            }
            return Vec::new();
        }
        match inbound {
            Inbound::IoPub => {
                debug!(
                    "[router] Ignoring {} from another request",
                    msg.header.msg_type
                );
            }
            _ => {
                self.orphans += 1;
                debug!(
                    "[router] Discarding orphan {} (parent {:?})",
                    msg.header.msg_type,
                    wire::parent_msg_id(msg)
                );
            }
        }
        Vec::new()
    }
}

fn deliver_reply(kind: &mut RequestKind, content: &JupyterMessageContent, routed: &mut Vec<Routed>) {
    match (kind, content) {
        (RequestKind::VisibleExecute, JupyterMessageContent::ExecuteReply(reply)) => {
            routed.push(Routed::Reply(ExecutionReply {
                ok: matches!(reply.status, ReplyStatus::Ok),
                aborted: matches!(reply.status, ReplyStatus::Aborted),
                execution_count: Some(reply.execution_count.0 as u32),
                page: wire::page_payload(reply),
            }));
        }
        (RequestKind::SilentExecute, JupyterMessageContent::ExecuteReply(_)) => {}
        (RequestKind::Method { tag, method, reply: slot }, JupyterMessageContent::ExecuteReply(reply)) => {
            let result = match wire::user_expression(reply, tag) {
                Some(ExpressionOutcome::Value(text)) => wire::decode_method_result(&text),
                Some(ExpressionOutcome::Error { ename, evalue }) => {
                    Err(ConsoleError::Kernel { ename, evalue })
                }
                None => Err(ConsoleError::Kernel {
                    ename: "NoResult".to_string(),
                    evalue: format!("{} returned no value", method),
                }),
            };
            send_reply(slot, result);
        }
        (RequestKind::Complete(slot), JupyterMessageContent::CompleteReply(reply)) => {
            let value = serde_json::to_value(reply).unwrap_or(Value::Null);
            send_reply(
                slot,
                Ok(Completion {
                    matches: value["matches"]
                        .as_array()
                        .map(|m| m.iter().filter_map(|s| s.as_str().map(str::to_string)).collect())
                        .unwrap_or_default(),
                    cursor_start: value["cursor_start"].as_u64().unwrap_or(0) as usize,
                    cursor_end: value["cursor_end"].as_u64().unwrap_or(0) as usize,
                }),
            );
        }
        (RequestKind::Inspect(slot), JupyterMessageContent::InspectReply(reply)) => {
            send_reply(
                slot,
                Ok(Inspection {
                    found: reply.found,
                    text: wire::plain_text(&reply.data),
                }),
            );
        }
        (RequestKind::IsComplete(slot), JupyterMessageContent::IsCompleteReply(reply)) => {
            let value = serde_json::to_value(reply).unwrap_or(Value::Null);
            let completeness = match value["status"].as_str() {
                Some("complete") => CodeCompleteness::Complete,
                Some("incomplete") => CodeCompleteness::Incomplete {
                    indent: value["indent"].as_str().unwrap_or_default().to_string(),
                },
                Some("invalid") => CodeCompleteness::Invalid,
                _ => CodeCompleteness::Unknown,
            };
            send_reply(slot, Ok(completeness));
        }
        (RequestKind::KernelInfo(slot), JupyterMessageContent::KernelInfoReply(reply)) => {
            let value = serde_json::to_value(reply).unwrap_or(Value::Null);
            let field = |v: &Value| v.as_str().unwrap_or_default().to_string();
            send_reply(
                slot,
                Ok(KernelInfo {
                    implementation: field(&value["implementation"]),
                    implementation_version: field(&value["implementation_version"]),
                    language_version: field(&value["language_info"]["version"]),
                    banner: field(&value["banner"]),
                }),
            );
        }
        (RequestKind::Interrupt, _) | (RequestKind::Shutdown { .. }, _) => {}
        (kind, content) => {
            let name = kind.name();
            kind.fail(|| {
                ConsoleError::connection(format!(
                    "unexpected reply to {}: {:?}",
                    name,
                    std::mem::discriminant(content)
                ))
            });
        }
    }
}

fn output_of(content: &JupyterMessageContent) -> Option<Output> {
    Some(match content {
        JupyterMessageContent::StreamContent(stream) => Output::Stream {
            stderr: matches!(stream.name, jupyter_protocol::Stdio::Stderr),
            text: stream.text.clone(),
        },
        JupyterMessageContent::ExecuteResult(result) => Output::Result {
            execution_count: Some(result.execution_count.0 as u32),
            text: wire::plain_text(&result.data),
            html: wire::html_text(&result.data),
        },
        JupyterMessageContent::DisplayData(display) => Output::Display {
            text: wire::plain_text(&display.data),
            html: wire::html_text(&display.data),
        },
        JupyterMessageContent::ErrorOutput(error) => Output::Error {
            ename: error.ename.clone(),
            evalue: error.evalue.clone(),
            traceback: error.traceback.clone(),
        },
        JupyterMessageContent::ClearOutput(clear) => Output::ClearOutput { wait: clear.wait },
        JupyterMessageContent::ExecuteInput(input) => Output::Input {
            execution_count: input.execution_count.0 as u32,
            code: input.code.clone(),
        },
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn router() -> (Router, RecordingSink) {
        let sink = RecordingSink::new();
        (
            Router::new(Arc::new(sink.clone()), Duration::from_millis(200)),
            sink,
        )
    }

    fn kernel_msg(msg_type: &str, content: Value, parent: &JupyterMessage) -> JupyterMessage {
        wire::child_message(msg_type, content, Some(parent)).unwrap()
    }

    fn ok_reply(count: u32, parent: &JupyterMessage) -> JupyterMessage {
        kernel_msg(
            "execute_reply",
            json!({"status": "ok", "execution_count": count, "user_expressions": {}, "payload": []}),
            parent,
        )
    }

    fn idle(parent: &JupyterMessage) -> JupyterMessage {
        kernel_msg("status", json!({"execution_state": "idle"}), parent)
    }

    #[test]
    fn test_visible_execute_lifecycle() {
        let (mut router, sink) = router();
        let msg_id = router.execute("1+1").unwrap();
        let sent = sink.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].msg_id(), msg_id);
        assert_eq!(sent[0].channel, Channel::Shell);
        let request = sent[0].message.clone();

        assert!(matches!(
            router.execute("2+2"),
            Err(ConsoleError::RequestWhileBusy)
        ));

        let result = kernel_msg(
            "execute_result",
            json!({"execution_count": 1, "data": {"text/plain": "2"}, "metadata": {}}),
            &request,
        );
        let routed = router.on_message(Inbound::IoPub, &result);
        assert!(matches!(
            &routed[..],
            [Routed::Output(Output::Result { text: Some(t), .. })] if t == "2"
        ));

        let routed = router.on_message(Inbound::Shell, &ok_reply(1, &request));
        assert!(matches!(
            &routed[..],
            [Routed::Reply(ExecutionReply { ok: true, execution_count: Some(1), .. })]
        ));
        assert!(router.has_visible_execution());

        let routed = router.on_message(Inbound::IoPub, &idle(&request));
        assert!(matches!(&routed[..], [Routed::Idle]));
        assert!(!router.has_visible_execution());
        assert_eq!(router.pending_len(), 0);
    }

    #[test]
    fn test_idle_before_reply_keeps_entry() {
        let (mut router, sink) = router();
        router.execute("x").unwrap();
        let request = sink.take()[0].message.clone();
        router.on_message(Inbound::IoPub, &idle(&request));
        assert_eq!(router.pending_len(), 1);
        router.on_message(Inbound::Shell, &ok_reply(1, &request));
        assert_eq!(router.pending_len(), 0);
    }

    #[test]
    fn test_silent_execute_output_not_routed() {
        let (mut router, sink) = router();
        router.execute_silent("import os").unwrap();
        let request = sink.take()[0].message.clone();
        assert_eq!(router.hidden_in_flight(), 1);
        let stream = kernel_msg("stream", json!({"name": "stdout", "text": "hi"}), &request);
        assert!(router.on_message(Inbound::IoPub, &stream).is_empty());
        router.on_message(Inbound::Shell, &ok_reply(0, &request));
        let routed = router.on_message(Inbound::IoPub, &idle(&request));
        assert!(matches!(&routed[..], [Routed::HiddenFinished]));
        assert_eq!(router.hidden_in_flight(), 0);
    }

    #[tokio::test]
    async fn test_method_reply_decoded() {
        let (mut router, sink) = router();
        let fut = router.call_method(KernelMethod::GetCwd, &[]).unwrap();
        let request = sink.take()[0].message.clone();
        let tag = match &request.content {
            JupyterMessageContent::ExecuteRequest(req) => req
                .user_expressions
                .as_ref()
                .and_then(|e| e.keys().next().cloned())
                .unwrap(),
            _ => panic!("expected execute_request"),
        };
        let reply = kernel_msg(
            "execute_reply",
            json!({
                "status": "ok",
                "execution_count": 0,
                "payload": [],
                "user_expressions": {
                    (tag.clone()): {"status": "ok", "data": {"text/plain": "'\"/home/me\"'"}, "metadata": {}}
                }
            }),
            &request,
        );
        router.on_message(Inbound::Shell, &reply);
        assert_eq!(fut.wait().await.unwrap(), json!("/home/me"));

        // A second reply for the same request is ignored.
        assert!(router.on_message(Inbound::Shell, &reply).is_empty());
    }

    #[tokio::test]
    async fn test_method_kernel_error() {
        let (mut router, sink) = router();
        let fut = router
            .call_method(KernelMethod::GetValue, &[json!("missing")])
            .unwrap();
        let request = sink.take()[0].message.clone();
        let key = match &request.content {
            JupyterMessageContent::ExecuteRequest(req) => req
                .user_expressions
                .as_ref()
                .and_then(|e| e.keys().next().cloned())
                .unwrap(),
            _ => panic!("expected execute_request"),
        };
        let reply = kernel_msg(
            "execute_reply",
            json!({
                "status": "ok",
                "execution_count": 0,
                "payload": [],
                "user_expressions": {
                    key: {"status": "error", "ename": "NameError", "evalue": "name 'missing' is not defined", "traceback": []}
                }
            }),
            &request,
        );
        router.on_message(Inbound::Shell, &reply);
        let err = fut.wait().await.unwrap_err();
        assert!(matches!(err, ConsoleError::Kernel { ref ename, .. } if ename == "NameError"));
    }

    #[tokio::test]
    async fn test_timeout_removes_entry_and_late_reply_is_orphan() {
        let (mut router, sink) = router();
        let fut = router
            .complete("imp", 3)
            .unwrap()
            .with_timeout(Duration::from_millis(20));
        let request = sink.take()[0].message.clone();
        assert!(matches!(fut.wait().await, Err(ConsoleError::Timeout(_))));
        assert_eq!(router.pending_len(), 0);

        let late = kernel_msg(
            "complete_reply",
            json!({"status": "ok", "matches": ["import"], "cursor_start": 0, "cursor_end": 3, "metadata": {}}),
            &request,
        );
        assert!(router.on_message(Inbound::Shell, &late).is_empty());
        assert_eq!(router.orphan_count(), 1);
    }

    #[tokio::test]
    async fn test_complete_reply() {
        let (mut router, sink) = router();
        let fut = router.complete("imp", 3).unwrap();
        let request = sink.take()[0].message.clone();
        let reply = kernel_msg(
            "complete_reply",
            json!({"status": "ok", "matches": ["import"], "cursor_start": 0, "cursor_end": 3, "metadata": {}}),
            &request,
        );
        router.on_message(Inbound::Shell, &reply);
        let completion = fut.wait().await.unwrap();
        assert_eq!(completion.matches, vec!["import"]);
        assert_eq!(completion.cursor_end, 3);
    }

    #[tokio::test]
    async fn test_cancel_outstanding_fails_waiters() {
        let (mut router, _sink) = router();
        router.execute("while True: pass").unwrap();
        let fut = router.call_method(KernelMethod::GetCwd, &[]).unwrap();
        assert!(router.cancel_outstanding());
        assert!(matches!(fut.wait().await, Err(ConsoleError::Restarted)));
        assert_eq!(router.pending_len(), 0);
        assert!(!router.has_visible_execution());
    }

    #[test]
    fn test_expire_abandoned() {
        let (router, _sink) = router();
        let fut = router.inspect("len", 3).unwrap();
        drop(fut);
        router.interrupt().unwrap();
        assert_eq!(router.expire_abandoned(), 1);
        assert_eq!(router.pending_len(), 1);
    }

    #[test]
    fn test_foreign_iopub_ignored_and_unparented_status_reported() {
        let (mut router, _sink) = router();
        let other = wire::execute_request("x", false, HashMap::new(), true);
        let stream = kernel_msg("stream", json!({"name": "stdout", "text": "hi"}), &other);
        assert!(router.on_message(Inbound::IoPub, &stream).is_empty());
        assert_eq!(router.orphan_count(), 0);

        let starting = wire::child_message("status", json!({"execution_state": "starting"}), None).unwrap();
        let routed = router.on_message(Inbound::IoPub, &starting);
        assert!(matches!(
            &routed[..],
            [Routed::KernelStatus(ExecutionState::Starting)]
        ));
    }

    #[test]
    fn test_input_request_routed_for_visible_execution() {
        let (mut router, sink) = router();
        router.execute("input()").unwrap();
        let request = sink.take()[0].message.clone();
        let input = kernel_msg("input_request", json!({"prompt": "ipdb> ", "password": false}), &request);
        let routed = router.on_message(Inbound::Stdin, &input);
        assert!(matches!(
            &routed[..],
            [Routed::InputRequest { prompt, password: false, .. }] if prompt == "ipdb> "
        ));
        router.input_reply("n", &input).unwrap();
        let sent = sink.take();
        assert_eq!(sent[0].channel, Channel::Stdin);
        assert_eq!(sent[0].msg_type(), "input_reply");
        // Replies to input requests are not tracked.
        assert_eq!(router.pending_len(), 1);
    }
}
