//! Kernel command lines and environments.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{KernelFlavor, LaunchError};

/// Module every console kernel started from an interpreter must provide.
pub const KERNEL_MODULE: &str = "spyder_kernels";

/// How the kernel process is started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum KernelCommand {
    /// `<python> -m spyder_kernels.console -f <connection file>`
    Interpreter(PathBuf),
    /// An installed Jupyter kernelspec, looked up by name.
    Kernelspec(String),
}

/// Console preferences forwarded to the kernel through its environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchOptions {
    pub pylab_backend: String,
    pub autocall: u8,
    pub greedy_completer: bool,
    pub jedi_completer: bool,
    pub umr_enabled: bool,
    pub umr_namelist: Vec<String>,
    /// Lines executed after startup, joined with `; `.
    pub run_lines: Vec<String>,
    /// File executed after startup.
    pub startup_file: Option<PathBuf>,
    pub testing: bool,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            pylab_backend: "inline".to_string(),
            autocall: 0,
            greedy_completer: false,
            jedi_completer: false,
            umr_enabled: true,
            umr_namelist: vec![],
            run_lines: vec![],
            startup_file: None,
            testing: false,
        }
    }
}

/// Everything needed to start one kernel process.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub command: KernelCommand,
    pub flavor: KernelFlavor,
    pub options: LaunchOptions,
    /// Extra variables layered over the inherited environment.
    pub extra_env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    /// Whether the interpreter is not the one bundled with the host.
    pub external_interpreter: bool,
}

fn py_bool(b: bool) -> String {
    if b { "True" } else { "False" }.to_string()
}

impl LaunchSpec {
    pub fn for_interpreter(interpreter: impl Into<PathBuf>, flavor: KernelFlavor) -> Self {
        Self {
            command: KernelCommand::Interpreter(interpreter.into()),
            flavor,
            options: LaunchOptions::default(),
            extra_env: BTreeMap::new(),
            cwd: None,
            external_interpreter: false,
        }
    }

    pub fn for_kernelspec(name: impl Into<String>) -> Self {
        Self {
            command: KernelCommand::Kernelspec(name.into()),
            flavor: KernelFlavor::Plain,
            options: LaunchOptions::default(),
            extra_env: BTreeMap::new(),
            cwd: None,
            external_interpreter: true,
        }
    }

    /// Name recorded as `kernel_name` in the connection file.
    pub fn kernel_name(&self) -> String {
        match &self.command {
            KernelCommand::Interpreter(_) => "spyder-kernel".to_string(),
            KernelCommand::Kernelspec(name) => name.clone(),
        }
    }

    /// Whether the kernel speaks the console's kernel-method extensions.
    pub fn is_spyder_kernel(&self) -> bool {
        matches!(self.command, KernelCommand::Interpreter(_))
    }

    /// Argument vector for an interpreter-based kernel.
    ///
    /// Returns `None` for kernelspec kernels whose argv is owned by the spec.
    pub fn argv(&self, connection_file: &Path) -> Option<Vec<String>> {
        match &self.command {
            KernelCommand::Interpreter(python) => Some(vec![
                python.to_string_lossy().into_owned(),
                "-Xfrozen_modules=off".to_string(),
                "-m".to_string(),
                format!("{}.console", KERNEL_MODULE),
                "-f".to_string(),
                connection_file.to_string_lossy().into_owned(),
            ]),
            KernelCommand::Kernelspec(_) => None,
        }
    }

    /// Variables the kernel reads at startup.
    ///
    /// The inherited environment is not included here; see [`Self::apply_env`].
    pub fn env_vars(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        let opts = &self.options;

        env.insert(
            "SPY_EXTERNAL_INTERPRETER".to_string(),
            py_bool(self.external_interpreter),
        );
        env.insert("SPY_UMR_ENABLED".to_string(), py_bool(opts.umr_enabled));
        env.insert("SPY_UMR_NAMELIST".to_string(), opts.umr_namelist.join(","));
        env.insert("SPY_RUN_LINES_O".to_string(), opts.run_lines.join("; "));
        env.insert(
            "SPY_PYLAB_O".to_string(),
            py_bool(self.flavor == KernelFlavor::Pylab),
        );
        env.insert("SPY_BACKEND_O".to_string(), opts.pylab_backend.clone());
        env.insert("SPY_AUTOCALL_O".to_string(), opts.autocall.to_string());
        env.insert("SPY_GREEDY_O".to_string(), py_bool(opts.greedy_completer));
        env.insert("SPY_JEDI_O".to_string(), py_bool(opts.jedi_completer));
        env.insert("SPY_TESTING".to_string(), py_bool(opts.testing));
        env.insert(
            "SPY_USE_FILE_O".to_string(),
            py_bool(opts.startup_file.is_some()),
        );
        if let Some(file) = &opts.startup_file {
            env.insert(
                "SPY_RUN_FILE_O".to_string(),
                file.to_string_lossy().into_owned(),
            );
        }
        for (key, value) in self.flavor.env_flags() {
            env.insert(key.to_string(), value.to_string());
        }
        env.insert(
            "SPY_PARENT_PID".to_string(),
            std::process::id().to_string(),
        );

        for (key, value) in &self.extra_env {
            env.insert(key.clone(), value.clone());
        }
        env
    }

    /// Apply the kernel environment to a command.
    ///
    /// Variables that make a foreign interpreter pick up the host's
    /// site-packages are removed.
    pub fn apply_env(&self, cmd: &mut tokio::process::Command) {
        for key in ["VIRTUAL_ENV", "PYTHONPATH", "PYTHONEXECUTABLE"] {
            cmd.env_remove(key);
        }
        cmd.envs(self.env_vars());
    }

    /// Build the kernel command with stdout discarded and stderr sent to `stderr`.
    pub async fn command(
        &self,
        connection_file: &Path,
        stderr: std::fs::File,
    ) -> anyhow::Result<tokio::process::Command> {
        let mut cmd = match &self.command {
            KernelCommand::Interpreter(_) => {
                let argv = self
                    .argv(connection_file)
                    .ok_or_else(|| anyhow::anyhow!("Interpreter command without argv"))?;
                info!("[kernel-launch] Kernel command: {:?}", argv);
                let mut c = tokio::process::Command::new(&argv[0]);
                c.args(&argv[1..]);
                c.stdout(Stdio::null());
                c.stderr(Stdio::from(stderr));
                c
            }
            KernelCommand::Kernelspec(name) => {
                info!("[kernel-launch] Starting {} kernel via kernelspec", name);
                let kernelspec = runtimelib::find_kernelspec(name).await?;
                kernelspec.command(
                    connection_file,
                    Some(Stdio::null()),
                    Some(Stdio::from(stderr)),
                )?
            }
        };

        self.apply_env(&mut cmd);
        let cwd = self
            .cwd
            .clone()
            .or_else(dirs::home_dir)
            .unwrap_or_else(std::env::temp_dir);
        debug!("[kernel-launch] Kernel cwd: {:?}", cwd);
        cmd.current_dir(cwd);
        Ok(cmd)
    }

    /// Modules the interpreter has to import successfully for this console.
    pub fn required_modules(&self) -> Vec<&'static str> {
        let mut modules = Vec::new();
        if self.is_spyder_kernel() {
            modules.push(KERNEL_MODULE);
        }
        if let Some(module) = self.flavor.required_module() {
            modules.push(module);
        }
        modules
    }

    /// Verify the interpreter can import every required module.
    ///
    /// Kernelspec kernels are not checked.
    pub async fn check_modules(&self) -> Result<(), LaunchError> {
        let KernelCommand::Interpreter(python) = &self.command else {
            return Ok(());
        };

        for module in self.required_modules() {
            let status = tokio::process::Command::new(python)
                .args(["-c", &format!("import {}", module)])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await
                .map_err(|e| LaunchError::Spawn(format!("{}: {}", python.display(), e)))?;

            if !status.success() {
                return Err(LaunchError::MissingModule {
                    module: module.to_string(),
                    interpreter: python.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpreter_argv() {
        let spec = LaunchSpec::for_interpreter("/opt/py/bin/python", KernelFlavor::Plain);
        let argv = spec.argv(Path::new("/run/kernel-1.json")).unwrap();
        assert_eq!(
            argv,
            vec![
                "/opt/py/bin/python",
                "-Xfrozen_modules=off",
                "-m",
                "spyder_kernels.console",
                "-f",
                "/run/kernel-1.json",
            ]
        );
    }

    #[test]
    fn test_kernelspec_has_no_argv() {
        let spec = LaunchSpec::for_kernelspec("ir");
        assert!(spec.argv(Path::new("k.json")).is_none());
        assert_eq!(spec.kernel_name(), "ir");
        assert!(!spec.is_spyder_kernel());
        assert!(spec.required_modules().is_empty());
    }

    #[test]
    fn test_env_vars_for_pylab() {
        let spec = LaunchSpec::for_interpreter("python3", KernelFlavor::Pylab);
        let env = spec.env_vars();
        assert_eq!(env["SPY_AUTOLOAD_PYLAB_O"], "True");
        assert_eq!(env["SPY_PYLAB_O"], "True");
        assert_eq!(env["SPY_SYMPY_O"], "False");
        assert_eq!(env["SPY_BACKEND_O"], "inline");
        assert_eq!(env["SPY_USE_FILE_O"], "False");
        assert!(!env.contains_key("SPY_RUN_FILE_O"));
    }

    #[test]
    fn test_extra_env_overrides() {
        let mut spec = LaunchSpec::for_interpreter("python3", KernelFlavor::Plain);
        spec.extra_env
            .insert("SPY_TESTING".to_string(), "True".to_string());
        spec.options.run_lines = vec!["import os".into(), "import sys".into()];
        let env = spec.env_vars();
        assert_eq!(env["SPY_TESTING"], "True");
        assert_eq!(env["SPY_RUN_LINES_O"], "import os; import sys");
    }

    #[test]
    fn test_required_modules() {
        let spec = LaunchSpec::for_interpreter("python3", KernelFlavor::Sympy);
        assert_eq!(spec.required_modules(), vec!["spyder_kernels", "sympy"]);
    }

    #[tokio::test]
    async fn test_check_modules_missing_interpreter() {
        let spec = LaunchSpec::for_interpreter(
            "/nonexistent/interpreter/python",
            KernelFlavor::Plain,
        );
        let err = spec.check_modules().await.unwrap_err();
        assert!(matches!(err, LaunchError::Spawn(_)));
    }
}
