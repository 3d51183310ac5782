//! Rendering seam between the shell and whatever displays it.

use std::io::Write;
use std::sync::{Arc, Mutex as StdMutex};

use crate::settings::{ColorScheme, FontSpec};

/// What a block of text is, so views can style it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextKind {
    Stdout,
    Stderr,
    /// `Out[n]:` results and display data.
    Result,
    Traceback,
    /// Console messages such as restart banners.
    Notice,
}

/// Fonts and colors applied to a view.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ViewStyle {
    pub color_scheme: ColorScheme,
    pub plain_font: FontSpec,
    pub rich_font: FontSpec,
}

/// A console display surface.
pub trait ConsoleView: Send {
    fn append_text(&mut self, text: &str, kind: TextKind);

    fn append_html(&mut self, html: &str);

    /// Start a new input line with `prompt`.
    fn show_prompt(&mut self, prompt: &str);

    /// Redraw the editable text after the prompt.
    fn set_input(&mut self, text: &str, cursor: usize);

    /// Freeze the current input line as submitted.
    fn commit_input(&mut self, text: &str);

    fn clear(&mut self);

    fn copy_to_clipboard(&mut self, _text: &str) {}

    fn apply_style(&mut self, _style: &ViewStyle) {}
}

/// Something a [`Transcript`] recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewItem {
    Text(TextKind, String),
    Html(String),
    Prompt(String),
    Committed(String),
    Cleared,
    Copied(String),
    Styled(ViewStyle),
}

#[derive(Debug, Default)]
struct TranscriptState {
    items: Vec<ViewItem>,
    input: String,
    cursor: usize,
}

/// View that records everything it is asked to show.
///
/// Clones share the same record, so a handle kept outside the shell sees
/// what the shell rendered.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    state: Arc<StdMutex<TranscriptState>>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut TranscriptState) -> R) -> Option<R> {
        self.state.lock().ok().map(|mut s| f(&mut s))
    }

    pub fn items(&self) -> Vec<ViewItem> {
        self.with(|s| s.items.clone()).unwrap_or_default()
    }

    /// Current editable text and cursor.
    pub fn input(&self) -> (String, usize) {
        self.with(|s| (s.input.clone(), s.cursor)).unwrap_or_default()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.items()
            .into_iter()
            .filter_map(|item| match item {
                ViewItem::Prompt(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn committed(&self) -> Vec<String> {
        self.items()
            .into_iter()
            .filter_map(|item| match item {
                ViewItem::Committed(c) => Some(c),
                _ => None,
            })
            .collect()
    }

    /// All text and html, in order, as one string.
    pub fn rendered(&self) -> String {
        let mut out = String::new();
        for item in self.items() {
            match item {
                ViewItem::Text(_, t) | ViewItem::Html(t) => out.push_str(&t),
                ViewItem::Prompt(p) => out.push_str(&p),
                ViewItem::Committed(c) => {
                    out.push_str(&c);
                    out.push('\n');
                }
                _ => {}
            }
        }
        out
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.rendered().contains(needle)
    }

    pub fn clear_record(&self) {
        self.with(|s| s.items.clear());
    }
}

impl ConsoleView for Transcript {
    fn append_text(&mut self, text: &str, kind: TextKind) {
        self.with(|s| s.items.push(ViewItem::Text(kind, text.to_string())));
    }

    fn append_html(&mut self, html: &str) {
        self.with(|s| s.items.push(ViewItem::Html(html.to_string())));
    }

    fn show_prompt(&mut self, prompt: &str) {
        self.with(|s| {
            s.items.push(ViewItem::Prompt(prompt.to_string()));
            s.input.clear();
            s.cursor = 0;
        });
    }

    fn set_input(&mut self, text: &str, cursor: usize) {
        self.with(|s| {
            s.input = text.to_string();
            s.cursor = cursor;
        });
    }

    fn commit_input(&mut self, text: &str) {
        self.with(|s| {
            s.items.push(ViewItem::Committed(text.to_string()));
            s.input.clear();
            s.cursor = 0;
        });
    }

    fn clear(&mut self) {
        self.with(|s| s.items.push(ViewItem::Cleared));
    }

    fn copy_to_clipboard(&mut self, text: &str) {
        self.with(|s| s.items.push(ViewItem::Copied(text.to_string())));
    }

    fn apply_style(&mut self, style: &ViewStyle) {
        self.with(|s| s.items.push(ViewItem::Styled(style.clone())));
    }
}

/// Reduce console html to terminal text.
pub fn html_to_text(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut rest = html;
    while let Some(start) = rest.find('<') {
        text.push_str(&rest[..start]);
        let Some(end) = rest[start..].find('>') else {
            text.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let tag = rest[start + 1..start + end].trim().to_ascii_lowercase();
        if tag.starts_with("br") || tag.starts_with("/p") || tag.starts_with("hr") {
            text.push('\n');
        }
        rest = &rest[start + end + 1..];
    }
    text.push_str(rest);
    text.replace("&#8209;", "-")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&amp;", "&")
}

/// Escape text for inclusion in console html.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// View writing straight to the process's stdout and stderr.
///
/// Line editing is left to the terminal; `set_input` does nothing.
#[derive(Debug, Default)]
pub struct TerminalView;

impl ConsoleView for TerminalView {
    fn append_text(&mut self, text: &str, kind: TextKind) {
        match kind {
            TextKind::Stderr | TextKind::Traceback => {
                eprint!("{}", text);
                let _ = std::io::stderr().flush();
            }
            _ => {
                print!("{}", text);
                let _ = std::io::stdout().flush();
            }
        }
    }

    fn append_html(&mut self, html: &str) {
        print!("{}", html_to_text(html));
        let _ = std::io::stdout().flush();
    }

    fn show_prompt(&mut self, prompt: &str) {
        print!("{}", prompt);
        let _ = std::io::stdout().flush();
    }

    fn set_input(&mut self, _text: &str, _cursor: usize) {}

    fn commit_input(&mut self, _text: &str) {}

    fn clear(&mut self) {
        print!("\x1b[2J\x1b[H");
        let _ = std::io::stdout().flush();
    }
}
