//! Terminal front end: IPython consoles driven from stdin.
//!
//! Lines starting with `:` at the `In` prompt are console commands
//! (`:help` lists them); everything else goes to the kernel.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use ipyconsole::client::{AlwaysYes, Confirm, Question};
use ipyconsole::history::{HistoryLog, SharedHistory};
use ipyconsole::manager::{Collaborators, ConsoleManager, ManagerOptions, RunOptions};
use ipyconsole::settings::load_settings;
use ipyconsole::shell::ShellMode;
use ipyconsole::transport::ClientId;
use ipyconsole::tunnel::SshParams;
use ipyconsole::view::{html_to_text, TerminalView};
use kernel_launch::KernelFlavor;
use log::warn;
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(author, version, about = "IPython console for Jupyter kernels", long_about = None)]
struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Connect to a running kernel: connection file, kernel id, or part of one
    #[arg(long)]
    existing: Option<String>,

    /// Reach the existing kernel through ssh, as [user@]host[:port]
    #[arg(long, requires = "existing")]
    ssh: Option<String>,

    /// Private key for --ssh
    #[arg(long, requires = "ssh")]
    ssh_key: Option<PathBuf>,

    /// Kernelspec to launch instead of the configured interpreter
    #[arg(long, conflicts_with = "existing")]
    kernel: Option<String>,

    /// Console flavor: plain, pylab, sympy or cython
    #[arg(long, value_parser = parse_flavor)]
    flavor: Option<KernelFlavor>,

    /// Script to run once the console is up
    #[arg(long)]
    run: Option<PathBuf>,

    /// Answer yes to every confirmation
    #[arg(long, short)]
    yes: bool,
}

fn parse_flavor(value: &str) -> std::result::Result<KernelFlavor, String> {
    match value.to_ascii_lowercase().as_str() {
        "plain" => Ok(KernelFlavor::Plain),
        "pylab" => Ok(KernelFlavor::Pylab),
        "sympy" => Ok(KernelFlavor::Sympy),
        "cython" => Ok(KernelFlavor::Cython),
        other => Err(format!("unknown flavor '{}'", other)),
    }
}

/// Asks on the terminal.
struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn confirm(&mut self, question: &Question) -> bool {
        eprint!("{} [y/N] ", question.text());
        let _ = io::stderr().flush();
        let mut answer = String::new();
        io::stdin().read_line(&mut answer).is_ok()
            && matches!(answer.trim(), "y" | "Y" | "yes" | "Yes")
    }
}

/// Prints what the other panes of an IDE would show.
struct TerminalPanes;

impl Collaborators for TerminalPanes {
    fn open_file(&mut self, file: &Path, line: u32) {
        println!("\n{}:{}", file.display(), line);
    }

    fn namespace_view(&mut self, _client: ClientId, view: &Value) {
        log::debug!("namespace: {}", view);
    }

    fn show_env(&mut self, _client: ClientId, env: &BTreeMap<String, String>) {
        for (key, value) in env {
            println!("{}={}", key, value);
        }
    }

    fn show_syspath(&mut self, _client: ClientId, path: &[String]) {
        for entry in path {
            println!("{}", entry);
        }
    }

    fn page_changed(&mut self, _client: ClientId, html: &str) {
        let text = html_to_text(html);
        if !text.trim().is_empty() {
            println!("{}", text.trim());
        }
    }

    fn error(&mut self, message: &str) {
        eprintln!("{}", message);
    }
}

const HELP: &str = "\
:new [flavor]      open a console with a new kernel
:connect <kernel>  open a console on a running kernel
:tabs              list consoles
:switch <n>        make console n current
:restart           restart the kernel
:interrupt         interrupt the kernel
:stop              stop button (leaves the debugger when it waits)
:reset             remove all variables
:env               show the kernel's environment variables
:syspath           show the kernel's sys.path
:cwd <dir>         change the kernel's working directory
:run <file> [args] run a file in this console
:debug <file>      debug a file in this console
:close             close this console
:quit              close every console and exit";

/// Start reading stdin on its own thread. Each `true`/`false` sent on the
/// returned sender reads one password/plain line; `None` means EOF.
fn spawn_reader() -> (
    std::sync::mpsc::Sender<bool>,
    mpsc::UnboundedReceiver<Option<String>>,
) {
    let (request_tx, request_rx) = std::sync::mpsc::channel::<bool>();
    let (line_tx, line_rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        for password in request_rx {
            let line = if password {
                rpassword::read_password().ok()
            } else {
                let mut line = String::new();
                match io::stdin().lock().read_line(&mut line) {
                    Ok(0) | Err(_) => None,
                    Ok(_) => Some(line),
                }
            };
            if line_tx.send(line).is_err() {
                break;
            }
        }
    });
    (request_tx, line_rx)
}

/// Run a `:` command. Returns false to exit.
async fn command(manager: &mut ConsoleManager, line: &str, flavor: KernelFlavor) -> Result<bool> {
    let (name, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let rest = rest.trim();
    let current = manager.current();
    match (name, current) {
        ("help", _) => println!("{}", HELP),
        ("quit" | "exit", _) => return Ok(false),
        ("new", _) => {
            let flavor = if rest.is_empty() {
                flavor
            } else {
                parse_flavor(rest).map_err(anyhow::Error::msg)?
            };
            manager.new_client(flavor, None, None).await?;
        }
        ("connect", _) => {
            manager.connect_to_existing(rest, None).await?;
        }
        ("tabs", _) => {
            for (n, (id, title)) in manager.tab_titles().into_iter().enumerate() {
                let marker = if Some(id) == current { '*' } else { ' ' };
                println!("{} {} {}", marker, n + 1, title);
            }
        }
        ("switch", _) => {
            let n: usize = rest.parse().context("usage: :switch <n>")?;
            let id = manager
                .tab_titles()
                .get(n.saturating_sub(1))
                .map(|(id, _)| *id)
                .context("no such console")?;
            manager.set_current(id);
        }
        (_, None) => println!("No console open, use :new"),
        ("restart", Some(id)) => manager.restart_kernel(id).await?,
        ("interrupt", Some(id)) => manager.interrupt_kernel(id)?,
        ("stop", Some(id)) => manager.stop_button(id)?,
        ("reset", Some(id)) => manager.reset_namespace(id)?,
        ("env", Some(id)) => manager.show_env(id)?,
        ("syspath", Some(id)) => manager.show_syspath(id)?,
        ("cwd", Some(id)) => manager.set_cwd(id, rest)?,
        ("run" | "debug", Some(_)) => {
            let (file, args) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
            let options = RunOptions {
                args: args.trim().to_string(),
                current_client: true,
                debug: name == "debug",
                ..Default::default()
            };
            manager.run_script(Path::new(file), options).await?;
        }
        ("close", Some(id)) => {
            manager.close_client(id, false).await;
            if manager.clients().is_empty() {
                return Ok(false);
            }
        }
        (other, Some(_)) => println!("Unknown command :{}, try :help", other),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let settings = load_settings();
    let flavor = cli.flavor.unwrap_or(settings.default_flavor);
    let history = match HistoryLog::load(&ipyconsole::default_history_path(), settings.history_max)
    {
        Ok(log) => SharedHistory::new(log),
        Err(e) => {
            warn!("History file unavailable, keeping history in memory: {}", e);
            SharedHistory::in_memory()
        }
    };
    let confirm: Box<dyn Confirm> = if cli.yes {
        Box::new(AlwaysYes)
    } else {
        Box::new(TerminalConfirm)
    };
    let options = ManagerOptions {
        kernelspec: cli.kernel.clone(),
        ..Default::default()
    };
    let mut manager = ConsoleManager::new(
        settings,
        options,
        history,
        Box::new(|_| Box::new(TerminalView)),
        Box::new(TerminalPanes),
        confirm,
    )?;

    match &cli.existing {
        Some(spec) => {
            let ssh = cli.ssh.as_ref().map(|host| SshParams {
                host: host.clone(),
                keyfile: cli.ssh_key.clone(),
            });
            manager
                .connect_to_existing(spec, ssh)
                .await
                .with_context(|| format!("Could not connect to kernel {}", spec))?;
        }
        None => {
            manager.new_client(flavor, None, None).await?;
        }
    }
    if let Some(script) = &cli.run {
        let options = RunOptions {
            current_client: true,
            ..Default::default()
        };
        manager.run_script(script, options).await?;
    }

    let (read_requests, mut lines) = spawn_reader();
    let mut waiting_for_line = false;
    loop {
        if !waiting_for_line {
            // Consoles stuck on an error page still take commands.
            let wanted = match manager.current().and_then(|id| manager.client(id)) {
                Some(c) if c.shell().is_reading() => Some(c.shell().wants_password()),
                Some(c) if !c.is_attached() || c.page().is_error() => Some(false),
                Some(_) => None,
                None => Some(false),
            };
            if let Some(password) = wanted {
                read_requests.send(password).context("stdin reader stopped")?;
                waiting_for_line = true;
            }
        }

        tokio::select! {
            line = lines.recv() => {
                waiting_for_line = false;
                let Some(line) = line.flatten() else {
                    break;
                };
                let at_prompt = manager
                    .current()
                    .and_then(|id| manager.client(id))
                    .map_or(true, |c| c.shell().mode() == ShellMode::Idle);
                match line.trim().strip_prefix(':') {
                    Some(cmd) if at_prompt => match command(&mut manager, cmd.trim(), flavor).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => eprintln!("Error: {:#}", e),
                    },
                    _ => {
                        if let Err(e) = manager.submit_line(&line) {
                            eprintln!("{}", e);
                        }
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                if let Some(id) = manager.current() {
                    if let Err(e) = manager.stop_button(id) {
                        warn!("Could not interrupt {}: {}", id, e);
                    }
                }
            }
            _ = manager.step() => {}
        }
    }

    manager.close_all().await;
    Ok(())
}
