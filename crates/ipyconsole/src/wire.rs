//! Building and reading Jupyter messages.
//!
//! Every place that needs to know the exact shape of a request or reply
//! goes through this module, including the kernel-method calling
//! convention: the frontend never pastes arguments into source code, it
//! sends them as a JSON document the kernel decodes.

use std::collections::HashMap;

use jupyter_protocol::{
    CompleteRequest, ExecuteReply, ExecuteRequest, ExpressionResult, InputReply,
    InterruptRequest, JupyterMessage, JupyterMessageContent, KernelInfoRequest, MediaType,
    ReplyStatus, ShutdownRequest,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{ConsoleError, Result};

/// Outgoing channels. iopub and heartbeat are never written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Shell,
    Stdin,
    Control,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Shell => write!(f, "shell"),
            Channel::Stdin => write!(f, "stdin"),
            Channel::Control => write!(f, "control"),
        }
    }
}

/// A message queued for one channel.
#[derive(Debug, Clone)]
pub struct Outgoing {
    pub channel: Channel,
    pub message: JupyterMessage,
}

impl Outgoing {
    pub fn msg_id(&self) -> &str {
        &self.message.header.msg_id
    }

    pub fn msg_type(&self) -> &str {
        &self.message.header.msg_type
    }
}

// ============================================================================
// Requests
// ============================================================================

/// `execute_request`. Silent requests never store history.
pub fn execute_request(
    code: &str,
    silent: bool,
    user_expressions: HashMap<String, String>,
    allow_stdin: bool,
) -> JupyterMessage {
    ExecuteRequest {
        code: code.to_string(),
        silent,
        store_history: !silent,
        user_expressions: if user_expressions.is_empty() {
            None
        } else {
            Some(user_expressions)
        },
        allow_stdin,
        stop_on_error: !silent,
    }
    .into()
}

pub fn complete_request(code: &str, cursor_pos: usize) -> JupyterMessage {
    CompleteRequest {
        code: code.to_string(),
        cursor_pos,
    }
    .into()
}

pub fn inspect_request(code: &str, cursor_pos: usize, detail_level: usize) -> Result<JupyterMessage> {
    let request: jupyter_protocol::InspectRequest = serde_json::from_value(json!({
        "code": code,
        "cursor_pos": cursor_pos,
        "detail_level": detail_level,
    }))?;
    Ok(request.into())
}

pub fn is_complete_request(code: &str) -> Result<JupyterMessage> {
    let request: jupyter_protocol::IsCompleteRequest =
        serde_json::from_value(json!({ "code": code }))?;
    Ok(request.into())
}

/// `input_reply` answering `request`.
pub fn input_reply(value: &str, request: &JupyterMessage) -> JupyterMessage {
    InputReply {
        value: value.to_string(),
        status: ReplyStatus::Ok,
        error: None,
    }
    .as_child_of(request)
}

pub fn interrupt_request() -> JupyterMessage {
    InterruptRequest {}.into()
}

pub fn shutdown_request(restart: bool) -> JupyterMessage {
    ShutdownRequest { restart }.into()
}

pub fn kernel_info_request() -> JupyterMessage {
    KernelInfoRequest::default().into()
}

// ============================================================================
// Reading replies
// ============================================================================

pub fn parent_msg_id(msg: &JupyterMessage) -> Option<&str> {
    msg.parent_header.as_ref().map(|h| h.msg_id.as_str())
}

/// First `text/plain` entry of a mime bundle.
pub fn plain_text(data: &jupyter_protocol::Media) -> Option<String> {
    data.content.iter().find_map(|media| match media {
        MediaType::Plain(text) => Some(text.clone()),
        _ => None,
    })
}

/// First `text/html` entry of a mime bundle.
pub fn html_text(data: &jupyter_protocol::Media) -> Option<String> {
    data.content.iter().find_map(|media| match media {
        MediaType::Html(text) => Some(text.clone()),
        _ => None,
    })
}

/// Outcome of one `user_expressions` entry.
#[derive(Debug, Clone, PartialEq)]
pub enum ExpressionOutcome {
    /// The `text/plain` repr of the value.
    Value(String),
    Error { ename: String, evalue: String },
}

/// Look up `tag` in the reply's `user_expressions`.
pub fn user_expression(reply: &ExecuteReply, tag: &str) -> Option<ExpressionOutcome> {
    let expressions = reply.user_expressions.as_ref()?;
    match expressions.get(tag)? {
        ExpressionResult::Ok { data, .. } => Some(ExpressionOutcome::Value(
            plain_text(data).unwrap_or_default(),
        )),
        err @ ExpressionResult::Error { .. } => {
            let value = serde_json::to_value(err).unwrap_or(Value::Null);
            let field = |name: &str| {
                value
                    .get(name)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            Some(ExpressionOutcome::Error {
                ename: field("ename"),
                evalue: field("evalue"),
            })
        }
    }
}

/// Text of a `page` payload (`obj?` help), if the reply carries one.
pub fn page_payload(reply: &ExecuteReply) -> Option<String> {
    let payload = serde_json::to_value(&reply.payload).ok()?;
    payload.as_array()?.iter().find_map(|item| {
        if item.get("source")?.as_str()? != "page" {
            return None;
        }
        item.get("data")?
            .get("text/plain")?
            .as_str()
            .map(str::to_string)
    })
}

/// Build a message as the kernel would, replying to `parent`.
///
/// Used for locally synthesized messages and to drive clients without a
/// live kernel.
pub fn child_message(
    msg_type: &str,
    content: Value,
    parent: Option<&JupyterMessage>,
) -> Result<JupyterMessage> {
    let header: jupyter_protocol::Header = serde_json::from_value(json!({
        "msg_id": uuid::Uuid::new_v4().to_string(),
        "username": "kernel",
        "session": parent.map(|p| p.header.session.clone()).unwrap_or_default(),
        "date": chrono::Utc::now().to_rfc3339(),
        "msg_type": msg_type,
        "version": "5.3",
    }))?;
    let content = JupyterMessageContent::from_type_and_content(msg_type, content)
        .map_err(ConsoleError::connection)?;
    Ok(JupyterMessage {
        zmq_identities: Vec::new(),
        header,
        parent_header: parent.map(|p| p.header.clone()),
        metadata: json!({}),
        content,
        buffers: Vec::new(),
        channel: None,
    })
}

/// Tags present in the reply's `user_expressions`.
pub fn user_expression_tags(reply: &ExecuteReply) -> Vec<String> {
    reply
        .user_expressions
        .as_ref()
        .map(|e| e.keys().cloned().collect())
        .unwrap_or_default()
}

/// Decode a Python `str` repr (`'...'` or `"..."`) into its value.
pub fn decode_py_str_repr(repr: &str) -> Option<String> {
    let repr = repr.trim();
    let quote = repr.chars().next()?;
    if (quote != '\'' && quote != '"') || repr.len() < 2 || !repr.ends_with(quote) {
        return None;
    }
    let body = &repr[1..repr.len() - 1];

    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let esc = chars.next()?;
        match esc {
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            '0' => out.push('\0'),
            'x' | 'u' | 'U' => {
                let width = match esc {
                    'x' => 2,
                    'u' => 4,
                    _ => 8,
                };
                let hex: String = chars.by_ref().take(width).collect();
                if hex.len() != width {
                    return None;
                }
                let code = u32::from_str_radix(&hex, 16).ok()?;
                out.push(char::from_u32(code)?);
            }
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    Some(out)
}

// ============================================================================
// Kernel methods
// ============================================================================

/// Methods the frontend can call in the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelMethod {
    SetCwd,
    GetCwd,
    GetEnv,
    GetSyspath,
    GetValue,
    SetValue,
    RemoveValue,
    CopyValue,
    IsDefined,
    GetDoc,
    GetSource,
    LoadData,
    SaveNamespace,
    GetNamespaceView,
    GetVarProperties,
    CloseAllMplFigures,
    /// Replace the project path entries in `sys.path`.
    UpdateSyspath,
    /// Names of the debugger's `do_*` commands.
    GetPdbCommands,
    /// Whether the kernel is a spyder kernel.
    IsSpyderKernel,
}

impl KernelMethod {
    pub fn name(&self) -> &'static str {
        match self {
            KernelMethod::SetCwd => "set_cwd",
            KernelMethod::GetCwd => "get_cwd",
            KernelMethod::GetEnv => "get_env",
            KernelMethod::GetSyspath => "get_syspath",
            KernelMethod::GetValue => "get_value",
            KernelMethod::SetValue => "set_value",
            KernelMethod::RemoveValue => "remove_value",
            KernelMethod::CopyValue => "copy_value",
            KernelMethod::IsDefined => "is_defined",
            KernelMethod::GetDoc => "get_doc",
            KernelMethod::GetSource => "get_source",
            KernelMethod::LoadData => "load_data",
            KernelMethod::SaveNamespace => "save_namespace",
            KernelMethod::GetNamespaceView => "get_namespace_view",
            KernelMethod::GetVarProperties => "get_var_properties",
            KernelMethod::CloseAllMplFigures => "close_all_mpl_figures",
            KernelMethod::UpdateSyspath => "update_syspath",
            KernelMethod::GetPdbCommands => "get_pdb_commands",
            KernelMethod::IsSpyderKernel => "is_spyder_kernel",
        }
    }

    /// Methods any IPython kernel can answer, without kernel extensions.
    pub fn is_portable(&self) -> bool {
        matches!(
            self,
            KernelMethod::SetCwd
                | KernelMethod::GetCwd
                | KernelMethod::GetEnv
                | KernelMethod::GetSyspath
                | KernelMethod::GetPdbCommands
                | KernelMethod::IsSpyderKernel
        )
    }
}

impl std::fmt::Display for KernelMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Python string literal holding `text`.
///
/// JSON string escapes are a subset of Python's, so a JSON-encoded string
/// is a valid Python literal with the same value.
fn py_literal(text: &str) -> String {
    Value::String(text.to_string()).to_string()
}

/// Expression evaluated in `user_expressions` for a method call.
///
/// Arguments travel as one JSON document; the result comes back as the
/// repr of its JSON encoding.
pub fn method_expression(method: KernelMethod, args: &[Value]) -> Result<String> {
    let args_json = serde_json::to_string(args)?;
    let loads = format!("*__import__('json').loads({})", py_literal(&args_json));
    let call = match method {
        KernelMethod::SetCwd => format!("__import__('os').chdir({})", loads),
        KernelMethod::GetCwd => "__import__('os').getcwd()".to_string(),
        KernelMethod::GetEnv => "dict(__import__('os').environ)".to_string(),
        KernelMethod::GetSyspath => "list(__import__('sys').path)".to_string(),
        KernelMethod::GetPdbCommands => concat!(
            "sorted(n[3:] for n in dir(__import__('pdb').Pdb) ",
            "if n.startswith('do_'))"
        )
        .to_string(),
        KernelMethod::IsSpyderKernel => {
            "type(get_ipython().kernel).__module__.startswith('spyder_kernels')".to_string()
        }
        other => format!("get_ipython().kernel.{}({})", other.name(), loads),
    };
    Ok(format!(
        "__import__('json').dumps({}, default=repr)",
        call
    ))
}

/// Decode the `text/plain` repr of a method result back into JSON.
pub fn decode_method_result(text_plain: &str) -> Result<Value> {
    let json_text = decode_py_str_repr(text_plain).ok_or_else(|| {
        ConsoleError::Json(serde_json::Error::io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("not a string repr: {}", text_plain),
        )))
    })?;
    Ok(serde_json::from_str(&json_text)?)
}

/// Typed result of a kernel method call.
pub fn decode_as<T: for<'de> Deserialize<'de>>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_request_silent_flags() {
        let msg = execute_request("1+1", false, HashMap::new(), true);
        assert_eq!(msg.header.msg_type, "execute_request");
        let content = serde_json::to_value(&msg.content).unwrap();
        assert_eq!(content["store_history"], json!(true));
        assert_eq!(content["silent"], json!(false));

        let mut exprs = HashMap::new();
        exprs.insert("tag".to_string(), "1".to_string());
        let msg = execute_request("", true, exprs, false);
        let content = serde_json::to_value(&msg.content).unwrap();
        assert_eq!(content["silent"], json!(true));
        assert_eq!(content["store_history"], json!(false));
        assert_eq!(content["user_expressions"]["tag"], json!("1"));
    }

    #[test]
    fn test_unique_msg_ids() {
        let a = execute_request("a", false, HashMap::new(), true);
        let b = execute_request("a", false, HashMap::new(), true);
        assert_ne!(a.header.msg_id, b.header.msg_id);
    }

    #[test]
    fn test_inspect_and_is_complete_types() {
        assert_eq!(
            inspect_request("len", 3, 0).unwrap().header.msg_type,
            "inspect_request"
        );
        assert_eq!(
            is_complete_request("for i in x:").unwrap().header.msg_type,
            "is_complete_request"
        );
    }

    #[test]
    fn test_input_reply_parent() {
        let request = execute_request("input()", false, HashMap::new(), true);
        let reply = input_reply("42", &request);
        assert_eq!(reply.header.msg_type, "input_reply");
        assert_eq!(parent_msg_id(&reply), Some(request.header.msg_id.as_str()));
    }

    #[test]
    fn test_child_message_links_parent() {
        let request = execute_request("x", false, HashMap::new(), true);
        let reply = child_message(
            "input_request",
            json!({"prompt": "ipdb> ", "password": false}),
            Some(&request),
        )
        .unwrap();
        assert_eq!(reply.header.msg_type, "input_request");
        assert_eq!(parent_msg_id(&reply), Some(request.header.msg_id.as_str()));
        assert!(matches!(
            reply.content,
            JupyterMessageContent::InputRequest(_)
        ));
    }

    #[test]
    fn test_page_payload() {
        let request = execute_request("len?", false, HashMap::new(), true);
        let reply = child_message(
            "execute_reply",
            json!({
                "status": "ok",
                "execution_count": 3,
                "user_expressions": {},
                "payload": [{"source": "page", "data": {"text/plain": "Docstring"}, "start": 0}],
            }),
            Some(&request),
        )
        .unwrap();
        let JupyterMessageContent::ExecuteReply(reply) = reply.content else {
            panic!("expected execute_reply");
        };
        assert_eq!(page_payload(&reply).as_deref(), Some("Docstring"));
    }

    #[test]
    fn test_decode_py_str_repr() {
        assert_eq!(decode_py_str_repr("'abc'").as_deref(), Some("abc"));
        assert_eq!(
            decode_py_str_repr(r#"'{"a": "it\'s"}'"#).as_deref(),
            Some(r#"{"a": "it's"}"#)
        );
        assert_eq!(
            decode_py_str_repr(r#""C:\\Users\\me""#).as_deref(),
            Some(r"C:\Users\me")
        );
        assert_eq!(decode_py_str_repr(r"'\xe9\u20ac'").as_deref(), Some("é€"));
        assert_eq!(decode_py_str_repr("'a\\nb'").as_deref(), Some("a\nb"));
        assert!(decode_py_str_repr("42").is_none());
        assert!(decode_py_str_repr("'unterminated").is_none());
    }

    #[test]
    fn test_method_expression_has_no_interpolated_args() {
        let expr = method_expression(
            KernelMethod::SetCwd,
            &[json!("C:\\temp\\'); import os; os.system('x')")],
        )
        .unwrap();
        assert!(expr.starts_with("__import__('json').dumps(__import__('os').chdir("));
        // The hostile quote only ever appears inside the JSON string literal.
        let literal_start = expr.find("loads(").unwrap() + "loads(".len();
        let literal_end = expr.rfind(")), default=repr)").unwrap();
        let literal = &expr[literal_start..literal_end];
        let decoded: String = serde_json::from_str(literal).unwrap();
        let args: Vec<String> = serde_json::from_str(&decoded).unwrap();
        assert_eq!(args, vec!["C:\\temp\\'); import os; os.system('x')"]);
    }

    #[test]
    fn test_method_expression_kernel_methods() {
        let expr = method_expression(KernelMethod::GetValue, &[json!("df")]).unwrap();
        assert!(expr.contains("get_ipython().kernel.get_value(*__import__('json').loads("));
        let expr = method_expression(KernelMethod::GetPdbCommands, &[]).unwrap();
        assert!(expr.contains("dir(__import__('pdb').Pdb)"));
    }

    #[test]
    fn test_decode_method_result() {
        let value = decode_method_result(r#"'{"cwd": "/home/me", "n": 3}'"#).unwrap();
        assert_eq!(value["cwd"], json!("/home/me"));
        let list: Vec<String> = decode_as(decode_method_result(r#"'["a", "b"]'"#).unwrap()).unwrap();
        assert_eq!(list, vec!["a", "b"]);
        assert!(decode_method_result("None").is_err());
    }
}
