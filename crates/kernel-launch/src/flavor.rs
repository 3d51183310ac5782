//! Startup recipes for console kernels.

use serde::{Deserialize, Serialize};

/// Kernel startup recipe.
///
/// Special flavors preload a scientific stack into the namespace and need
/// an extra module in the target interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KernelFlavor {
    #[default]
    Plain,
    /// `from pylab import *` at startup.
    Pylab,
    /// Sympy symbols and pretty printing at startup.
    Sympy,
    /// Cython magics loaded at startup.
    Cython,
}

impl KernelFlavor {
    /// Module the interpreter must provide for this flavor, if any.
    pub fn required_module(&self) -> Option<&'static str> {
        match self {
            KernelFlavor::Plain => None,
            KernelFlavor::Pylab => Some("matplotlib"),
            KernelFlavor::Sympy => Some("sympy"),
            KernelFlavor::Cython => Some("Cython"),
        }
    }

    /// Tab title prefix used for special consoles.
    pub fn title(&self) -> Option<&'static str> {
        match self {
            KernelFlavor::Plain => None,
            KernelFlavor::Pylab => Some("Pylab"),
            KernelFlavor::Sympy => Some("Sympy"),
            KernelFlavor::Cython => Some("Cython"),
        }
    }

    /// Environment switches read by the kernel at startup.
    ///
    /// Values use Python's `str(bool)` spelling since the kernel compares
    /// them against `"True"`.
    pub fn env_flags(&self) -> [(&'static str, &'static str); 3] {
        let on = |b: bool| if b { "True" } else { "False" };
        [
            ("SPY_AUTOLOAD_PYLAB_O", on(*self == KernelFlavor::Pylab)),
            ("SPY_SYMPY_O", on(*self == KernelFlavor::Sympy)),
            ("SPY_RUN_CYTHON", on(*self == KernelFlavor::Cython)),
        ]
    }

    /// Recover the flavor from a kernel environment.
    pub fn from_env<'a>(mut lookup: impl FnMut(&str) -> Option<&'a str>) -> Self {
        if lookup("SPY_AUTOLOAD_PYLAB_O") == Some("True") {
            KernelFlavor::Pylab
        } else if lookup("SPY_SYMPY_O") == Some("True") {
            KernelFlavor::Sympy
        } else if lookup("SPY_RUN_CYTHON") == Some("True") {
            KernelFlavor::Cython
        } else {
            KernelFlavor::Plain
        }
    }

    /// Statements that re-create the flavor's namespace after a reset.
    pub fn reload_statements(&self) -> &'static [&'static str] {
        match self {
            KernelFlavor::Plain => &[],
            KernelFlavor::Pylab => &["from pylab import *"],
            KernelFlavor::Sympy => &[concat!(
                "from sympy import *\n",
                "x, y, z, t = symbols('x y z t')\n",
                "k, m, n = symbols('k m n', integer=True)\n",
                "f, g, h = symbols('f g h', cls=Function)\n",
                "init_printing()"
            )],
            KernelFlavor::Cython => &["%reload_ext Cython"],
        }
    }
}

impl std::fmt::Display for KernelFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelFlavor::Plain => write!(f, "plain"),
            KernelFlavor::Pylab => write!(f, "pylab"),
            KernelFlavor::Sympy => write!(f, "sympy"),
            KernelFlavor::Cython => write!(f, "cython"),
        }
    }
}

impl std::str::FromStr for KernelFlavor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" | "" => Ok(KernelFlavor::Plain),
            "pylab" => Ok(KernelFlavor::Pylab),
            "sympy" => Ok(KernelFlavor::Sympy),
            "cython" => Ok(KernelFlavor::Cython),
            other => Err(format!("unknown kernel flavor: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_flavor_display_roundtrip() {
        for flavor in [
            KernelFlavor::Plain,
            KernelFlavor::Pylab,
            KernelFlavor::Sympy,
            KernelFlavor::Cython,
        ] {
            assert_eq!(flavor.to_string().parse::<KernelFlavor>(), Ok(flavor));
        }
        assert!("lisp".parse::<KernelFlavor>().is_err());
    }

    #[test]
    fn test_env_flags_only_one_enabled() {
        let flags = KernelFlavor::Sympy.env_flags();
        let enabled: Vec<_> = flags.iter().filter(|(_, v)| *v == "True").collect();
        assert_eq!(enabled, vec![&("SPY_SYMPY_O", "True")]);

        let plain = KernelFlavor::Plain.env_flags();
        assert!(plain.iter().all(|(_, v)| *v == "False"));
    }

    #[test]
    fn test_from_env_recovers_flavor() {
        let env: HashMap<&str, &str> = KernelFlavor::Cython.env_flags().into_iter().collect();
        let flavor = KernelFlavor::from_env(|k| env.get(k).copied());
        assert_eq!(flavor, KernelFlavor::Cython);

        let empty: HashMap<&str, &str> = HashMap::new();
        assert_eq!(
            KernelFlavor::from_env(|k| empty.get(k).copied()),
            KernelFlavor::Plain
        );
    }

    #[test]
    fn test_reload_statements() {
        assert!(KernelFlavor::Plain.reload_statements().is_empty());
        assert_eq!(
            KernelFlavor::Pylab.reload_statements(),
            &["from pylab import *"]
        );
        assert!(KernelFlavor::Sympy.reload_statements()[0].contains("init_printing()"));
    }

    #[test]
    fn test_serialize_snake_case() {
        let json = serde_json::to_string(&KernelFlavor::Pylab).unwrap();
        assert_eq!(json, "\"pylab\"");
        let parsed: KernelFlavor = serde_json::from_str("\"cython\"").unwrap();
        assert_eq!(parsed, KernelFlavor::Cython);
    }
}
