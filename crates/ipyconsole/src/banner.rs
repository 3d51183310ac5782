//! Console banners and restart notices.

use kernel_launch::KernelFlavor;

use crate::router::KernelInfo;
use crate::settings::BannerStyle;

/// Interpreter versions reported by `kernel_info`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InterpreterVersions {
    /// Full `sys.version`, possibly several lines.
    pub python: String,
    pub ipython: String,
}

impl InterpreterVersions {
    pub fn from_kernel_info(info: &KernelInfo) -> Self {
        // The kernel banner starts with "Python <sys.version>", which is
        // richer than language_info.version.
        let python = info
            .banner
            .lines()
            .next()
            .and_then(|line| line.strip_prefix("Python "))
            .map(str::to_string)
            .unwrap_or_else(|| info.language_version.clone());
        Self {
            python,
            ipython: info.implementation_version.clone(),
        }
    }
}

const SYMPY_LINES: &str = "
These commands were executed:
>>> from sympy import *
>>> x, y, z, t = symbols('x y z t')
>>> k, m, n = symbols('k m n', integer=True)
>>> f, g, h = symbols('f g h', cls=Function)
";

pub fn long_banner(versions: &InterpreterVersions, flavor: KernelFlavor) -> String {
    let py_ver = versions.python.lines().next().unwrap_or_default();
    let mut banner = format!(
        "Python {}\nType \"copyright\", \"credits\" or \"license\" for more information.\n\n\
         IPython {} -- An enhanced Interactive Python.\n",
        py_ver, versions.ipython
    );
    match flavor {
        KernelFlavor::Pylab => {
            banner.push_str("\nPopulating the interactive namespace from numpy and matplotlib\n")
        }
        KernelFlavor::Sympy => banner.push_str(SYMPY_LINES),
        KernelFlavor::Plain | KernelFlavor::Cython => {}
    }
    banner
}

/// `Python 3.11.4 -- IPython 8.14.0`
pub fn short_banner(versions: &InterpreterVersions) -> String {
    let py_ver = versions.python.split(' ').next().unwrap_or_default();
    format!("Python {} -- IPython {}", py_ver, versions.ipython)
}

/// Banner for a new console. Attached kernels get none.
pub fn banner(
    style: BannerStyle,
    versions: &InterpreterVersions,
    flavor: KernelFlavor,
    external: bool,
) -> String {
    if external {
        return String::new();
    }
    match style {
        BannerStyle::Long => long_banner(versions, flavor),
        BannerStyle::Short => format!("{}\n", short_banner(versions)),
    }
}

pub fn restart_message(died: bool) -> &'static str {
    if died {
        "Kernel died, restarting"
    } else {
        "Kernel restarting"
    }
}

/// Html block appended when the kernel restarts.
pub fn restart_html(message: &str) -> String {
    format!("<br>{}<hr><br>", message)
}

pub const RESTART_NOT_PERMITTED: &str = "Cannot restart a kernel not started by the host";
