//! Html pages shown in place of a console: loading, blank, kernel error.

use std::path::{Path, PathBuf};

use regex::Regex;

use crate::view::escape_html;

/// Which page the tab area shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoPage {
    /// Until the first prompt.
    Loading { message: String },
    Blank,
    KernelError { message: String, error: String },
}

impl InfoPage {
    pub fn loading() -> Self {
        InfoPage::Loading {
            message: "Connecting to kernel...".to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, InfoPage::KernelError { .. })
    }
}

/// Renders pages with a shared stylesheet.
#[derive(Debug, Clone, Default)]
pub struct PageTemplates {
    css_path: Option<PathBuf>,
    spinner: Option<PathBuf>,
}

impl PageTemplates {
    pub fn new(css_path: Option<PathBuf>, spinner: Option<PathBuf>) -> Self {
        Self { css_path, spinner }
    }

    fn head(&self) -> String {
        match &self.css_path {
            Some(css) => format!(
                "<head><link rel=\"stylesheet\" href=\"{}\"></head>",
                url_path(css)
            ),
            None => "<head></head>".to_string(),
        }
    }

    pub fn render(&self, page: &InfoPage) -> String {
        let body = match page {
            InfoPage::Loading { message } => {
                let spinner = self
                    .spinner
                    .as_ref()
                    .map(|img| format!("<img src=\"{}\" class=\"loading\">", url_path(img)))
                    .unwrap_or_default();
                format!(
                    "<div class=\"loading\">{}<p>{}</p></div>",
                    spinner,
                    escape_html(message)
                )
            }
            InfoPage::Blank => String::new(),
            InfoPage::KernelError { message, error } => format!(
                "<div class=\"error\"><h3>{}</h3><p>{}</p></div>",
                escape_html(message),
                error
            ),
        };
        format!("<html>{}<body>{}</body></html>", self.head(), body)
    }
}

/// Backslashes break file urls on Windows.
fn url_path(path: &Path) -> String {
    path.display().to_string().replace('\\', "/")
}

/// Kernel stderr made safe for a page: escaped, line breaks as `<br>`,
/// hyphens as non-breaking hyphens.
pub fn escape_error_text(text: &str) -> String {
    escape_html(text)
        .replace('-', "&#8209;")
        .replace("\r\n", "<br>")
        .replace('\n', "<br>")
}

/// Build the kernel-error page content for `error`.
pub fn kernel_error(error: &str) -> InfoPage {
    InfoPage::KernelError {
        message: "An error occurred while starting the kernel".to_string(),
        error: escape_error_text(error),
    }
}

const BENIGN_ERRORS: &[&str] = &[
    "KeyboardInterrupt caught in kernel",
    "QSocketNotifier: Multiple socket notifiers for same socket",
    "Tcl_AsyncDelete async handler deleted by the wrong thread",
    "error in background error handler:",
    "    while executing",
    "\"::tcl::Bgerror",
    "WARNING: Insecure writes have been enabled via environment",
    "No such comm",
    "Note: Debugging will proceed. Set PYDEVD_DISABLE_FILE_VALIDATION=1 to disable this validation.",
    "The following argument was not expected",
    "debugpy_stream undefined, debugging will not be enabled",
    "The system cannot find the path specified",
    "Matplotlib is building the font cache",
];

/// Kernel stderr noise that never deserves an error page.
pub fn is_benign_error(text: &str) -> bool {
    BENIGN_ERRORS.iter().any(|e| text.contains(e))
}

/// Text that is a warning rather than a failure.
pub fn is_warning_message(text: &str) -> bool {
    Regex::new(r"(?:^|\s)(?:[A-Za-z]*Warning:|WARNING:?)(?:\s|$)")
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

/// Which page a client shows and when it changes.
///
/// Loading turns blank exactly once, on the first prompt. An error page
/// replaces either and stays.
#[derive(Debug, Clone)]
pub struct InfoPageState {
    page: InfoPage,
    first_prompt_seen: bool,
}

impl Default for InfoPageState {
    fn default() -> Self {
        Self {
            page: InfoPage::loading(),
            first_prompt_seen: false,
        }
    }
}

impl InfoPageState {
    pub fn page(&self) -> &InfoPage {
        &self.page
    }

    /// Whether the console itself is hidden behind a page.
    pub fn is_covering(&self) -> bool {
        !matches!(self.page, InfoPage::Blank)
    }

    /// Returns true on the loading to blank transition.
    pub fn on_prompt_ready(&mut self) -> bool {
        if self.first_prompt_seen || self.page.is_error() {
            return false;
        }
        self.first_prompt_seen = true;
        self.page = InfoPage::Blank;
        true
    }

    /// Show `error` unless it is noise. Returns whether the page changed.
    pub fn show_error(&mut self, error: &str) -> bool {
        if is_benign_error(error) || is_warning_message(error) {
            return false;
        }
        self.page = kernel_error(error);
        true
    }

    /// Show a message that is already html.
    pub fn show_error_html(&mut self, message: &str, html: &str) {
        self.page = InfoPage::KernelError {
            message: message.to_string(),
            error: html.to_string(),
        };
    }

    /// Loading page with a custom message, e.g. while fetching the
    /// environment.
    pub fn show_loading(&mut self, message: &str) {
        if !self.page.is_error() {
            self.page = InfoPage::Loading {
                message: message.to_string(),
            };
        }
    }

    pub fn hide_loading(&mut self) {
        if !self.page.is_error() {
            self.page = InfoPage::Blank;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_error_text() {
        assert_eq!(
            escape_error_text("x <- 1\nerror-code"),
            "x &lt;&#8209; 1<br>error&#8209;code"
        );
    }

    #[test]
    fn test_loading_turns_blank_once() {
        let mut state = InfoPageState::default();
        assert!(matches!(state.page(), InfoPage::Loading { .. }));
        assert!(state.on_prompt_ready());
        assert_eq!(state.page(), &InfoPage::Blank);
        state.show_loading("Retrieving environment variables...");
        assert!(!state.on_prompt_ready());
        state.hide_loading();
        assert!(!state.is_covering());
    }

    #[test]
    fn test_error_supersedes() {
        let mut state = InfoPageState::default();
        assert!(state.show_error("Traceback\nModuleNotFoundError: No module named 'spyder_kernels'"));
        assert!(!state.on_prompt_ready());
        state.hide_loading();
        assert!(state.page().is_error());
        assert!(state.is_covering());
    }

    #[test]
    fn test_noise_is_filtered() {
        let mut state = InfoPageState::default();
        assert!(!state.show_error("Matplotlib is building the font cache; this may take a moment."));
        assert!(!state.show_error("DeprecationWarning: x is deprecated"));
        assert!(!state.page().is_error());
        assert!(is_warning_message("WARNING something"));
        assert!(!is_warning_message("Error: boom"));
    }

    #[test]
    fn test_render_pages() {
        let templates = PageTemplates::new(Some(PathBuf::from("C:\\css\\page.css")), None);
        let html = templates.render(&kernel_error("bad-thing"));
        assert!(html.contains("href=\"C:/css/page.css\""));
        assert!(html.contains("bad&#8209;thing"));
        assert!(html.contains("An error occurred while starting the kernel"));
        let loading = templates.render(&InfoPage::loading());
        assert!(loading.contains("Connecting to kernel..."));
    }
}
