//! matchlock: micro-VM sandbox CLI.
//!
//! Exit codes: 0 on success; the guest command's exit code for `run`/`exec`
//! when the command completed; 1 on any matchlock-level failure; 124 when
//! the run timeout elapses.

use anyhow::{bail, Context, Result};
use clap::Parser;
use matchlock::api::{self, Config, ExecOptions, NetworkConfig, Resources, VfsConfig};
use matchlock::cli::{Cli, Commands, ExecArgs, RunArgs};
use matchlock::sandbox::{exec_interactive_via_relay, exec_via_relay, Options, Sandbox};
use matchlock::{image, rpc, state};
use std::collections::BTreeMap;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Exit code for an elapsed `--timeout`.
const EXIT_TIMEOUT: i32 = 124;

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Run(args) => runtime.block_on(cmd_run(args)),
        Commands::Exec(args) => runtime.block_on(cmd_exec(args)),
        Commands::List { running } => cmd_list(running),
        Commands::Get { id } => cmd_get(&id),
        Commands::Kill { all, id } => cmd_kill(all, id),
        Commands::Rm { stopped, id } => cmd_rm(stopped, id),
        Commands::Prune => cmd_prune(),
        Commands::Rpc => runtime.block_on(cmd_rpc()),
    };

    if let Err(e) = result {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("matchlock={default}")));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_config(args: &RunArgs) -> Result<Config> {
    let mut mounts = BTreeMap::new();
    for volume in &args.volume {
        let (guest, mount) = api::parse_volume(volume, &args.workspace)
            .with_context(|| format!("invalid volume mount {volume:?}"))?;
        mounts.insert(guest, mount);
    }

    let mut secrets = std::collections::HashMap::new();
    for raw in &args.secret {
        let (name, secret) =
            api::parse_secret(raw).with_context(|| format!("invalid secret {raw:?}"))?;
        secrets.insert(name, secret);
    }

    Ok(Config {
        image: args.image.clone(),
        privileged: args.privileged,
        resources: Resources {
            cpus: args.cpus,
            memory_mb: args.memory,
            disk_size_mb: args.disk_size,
            timeout_seconds: args.timeout,
        },
        network: NetworkConfig {
            allowed_hosts: args.allow_host.clone(),
            block_private_ips: true,
            secrets,
        },
        vfs: VfsConfig {
            workspace: args.workspace.clone(),
            mounts,
        },
    })
}

async fn cmd_run(args: RunArgs) -> Result<()> {
    let command = api::shell_join(&args.command);
    let interactive_mode = args.tty && args.interactive;

    if args.rm && args.command.is_empty() && !interactive_mode {
        bail!("command required (or use --rm=false to start without a command)");
    }

    let store = image::Store::new();
    let resolved = store.resolve(&args.image, args.pull)?;
    debug!(rootfs = %resolved.rootfs_path.display(), "rootfs resolved");

    let config = build_config(&args)?;
    let timeout = Duration::from_secs(args.timeout);

    let sandbox = Sandbox::new(
        config,
        Options {
            rootfs_path: resolved.rootfs_path,
            kernel_path: store.kernel_path(),
            remove_on_close: args.rm,
            state: None,
        },
    )?;

    // Ctrl-C / SIGTERM cancel in-flight execs and unwind the sandbox.
    let cancel = sandbox.cancel_token();
    tokio::spawn(async move {
        let mut term =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("signal handler install");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        cancel.cancel();
    });

    sandbox.start().await.context("starting sandbox")?;

    if !args.rm {
        eprintln!("Sandbox {} is running", sandbox.id());
        eprintln!("  Connect: matchlock exec {} -it sh", sandbox.id());
        eprintln!("  Stop:    matchlock kill {}", sandbox.id());
    }

    if interactive_mode {
        let exit = run_interactive(&sandbox, &command, args.workdir.as_deref()).await;
        if args.rm {
            let _ = sandbox.close().await;
        }
        std::process::exit(exit?);
    }

    if !args.command.is_empty() {
        let mut options = ExecOptions::default();
        options.working_dir = args.workdir.clone();

        let result = tokio::time::timeout(timeout, sandbox.exec(&command, &options)).await;
        let exit = match result {
            Err(_) => {
                eprintln!("timeout after {}s", args.timeout);
                let _ = sandbox.close().await;
                std::process::exit(EXIT_TIMEOUT);
            }
            Ok(result) => {
                let result = match result {
                    Ok(result) => result,
                    Err(e) => {
                        if args.rm {
                            let _ = sandbox.close().await;
                        }
                        return Err(e).context("executing command");
                    }
                };
                std::io::stdout().write_all(&result.stdout)?;
                std::io::stderr().write_all(&result.stderr)?;
                result.exit_code
            }
        };

        if args.rm {
            sandbox.close().await.context("closing sandbox")?;
            std::process::exit(exit);
        }
    }

    if !args.rm {
        // Keep the sandbox alive for `matchlock exec` until a signal lands.
        sandbox.cancel_token().cancelled().await;
        sandbox.close().await.context("closing sandbox")?;
    }

    Ok(())
}

async fn run_interactive(sandbox: &Sandbox, command: &str, workdir: Option<&str>) -> Result<i32> {
    if !nix::unistd::isatty(std::io::stdin().as_raw_fd()).unwrap_or(false) {
        bail!("-it requires a TTY");
    }
    let (rows, cols) = terminal_size();
    let _raw = RawModeGuard::enable()?;
    let resize_rx = spawn_resize_watcher();

    let command = if command.is_empty() { "sh" } else { command };
    let mut options = ExecOptions::default();
    options.working_dir = workdir.map(str::to_string);

    let exit = sandbox
        .exec_interactive(
            command,
            &options,
            rows,
            cols,
            tokio::io::stdin(),
            tokio::io::stdout(),
            resize_rx,
        )
        .await
        .context("interactive exec failed")?;
    Ok(exit)
}

async fn cmd_exec(args: ExecArgs) -> Result<()> {
    let interactive_mode = args.tty && args.interactive;
    if args.command.is_empty() && !interactive_mode {
        bail!("command required (or use -it for interactive mode)");
    }

    let manager = state::Manager::new();
    let record = manager
        .get(&args.id)
        .with_context(|| format!("sandbox {} not found", args.id))?;
    if record.status != state::Status::Running {
        bail!("sandbox {} is not running (status: {})", args.id, record.status);
    }
    let socket = manager.exec_socket_path(&args.id);
    if !socket.exists() {
        bail!(
            "exec socket not found for {} (was it started with --rm=false?)",
            args.id
        );
    }

    let command = if args.command.is_empty() {
        "sh".to_string()
    } else {
        api::shell_join(&args.command)
    };
    let mut options = ExecOptions::default();
    options.working_dir = args.workdir.clone();

    if interactive_mode {
        if !nix::unistd::isatty(std::io::stdin().as_raw_fd()).unwrap_or(false) {
            bail!("-it requires a TTY");
        }
        let (rows, cols) = terminal_size();
        let _raw = RawModeGuard::enable()?;
        let resize_rx = spawn_resize_watcher();

        let exit = exec_interactive_via_relay(
            &socket,
            &command,
            &options,
            rows,
            cols,
            tokio::io::stdin(),
            tokio::io::stdout(),
            resize_rx,
        )
        .await
        .context("interactive exec failed")?;
        drop(_raw);
        std::process::exit(exit);
    }

    let result = exec_via_relay(&socket, &command, &options)
        .await
        .context("exec failed")?;
    std::io::stdout().write_all(&result.stdout)?;
    std::io::stderr().write_all(&result.stderr)?;
    std::process::exit(result.exit_code);
}

fn cmd_list(running_only: bool) -> Result<()> {
    let manager = state::Manager::new();
    let records = manager.list()?;

    println!(
        "{:<14} {:<10} {:<28} {:<18} {:<8}",
        "ID", "STATUS", "IMAGE", "CREATED", "PID"
    );
    for record in records {
        if running_only && record.status != state::Status::Running {
            continue;
        }
        let pid = if record.pid > 0 {
            record.pid.to_string()
        } else {
            "-".to_string()
        };
        println!(
            "{:<14} {:<10} {:<28} {:<18} {:<8}",
            record.id,
            record.status.to_string(),
            record.image,
            record.created_at.format("%Y-%m-%d %H:%M"),
            pid
        );
    }
    Ok(())
}

fn cmd_get(id: &str) -> Result<()> {
    let manager = state::Manager::new();
    let record = manager.get(id)?;
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(())
}

fn cmd_kill(all: bool, id: Option<String>) -> Result<()> {
    let manager = state::Manager::new();

    if all {
        for record in manager.list()? {
            if record.status == state::Status::Running {
                match manager.kill(&record.id) {
                    Ok(()) => println!("Killed {}", record.id),
                    Err(e) => eprintln!("Failed to kill {}: {e}", record.id),
                }
            }
        }
        return Ok(());
    }

    let id = id.context("sandbox ID required (or use --all)")?;
    manager.kill(&id)?;
    println!("Killed {id}");
    Ok(())
}

fn cmd_rm(stopped: bool, id: Option<String>) -> Result<()> {
    let manager = state::Manager::new();

    if stopped {
        for record in manager.list()? {
            if record.status != state::Status::Running {
                match manager.remove(&record.id) {
                    Ok(()) => println!("Removed {}", record.id),
                    Err(e) => eprintln!("Failed to remove {}: {e}", record.id),
                }
            }
        }
        return Ok(());
    }

    let id = id.context("sandbox ID required (or use --stopped)")?;
    manager.remove(&id)?;
    println!("Removed {id}");
    Ok(())
}

fn cmd_prune() -> Result<()> {
    let manager = state::Manager::new();
    let pruned = manager.prune()?;
    for id in &pruned {
        println!("Pruned {id}");
    }
    println!("Pruned {} sandboxes", pruned.len());
    Ok(())
}

async fn cmd_rpc() -> Result<()> {
    let store = image::Store::new();
    let factory: rpc::SandboxFactory = Box::new(move |config: Config| {
        let resolved = store.resolve(&config.image, false).map_err(|e| {
            matchlock::SandboxError::Config(api::ConfigError::InvalidVolume {
                input: config.image.clone(),
                reason: e.to_string(),
            })
        })?;
        Sandbox::new(
            config,
            Options {
                rootfs_path: resolved.rootfs_path,
                kernel_path: store.kernel_path(),
                remove_on_close: false,
                state: None,
            },
        )
    });

    rpc::serve(tokio::io::stdin(), tokio::io::stdout(), factory)
        .await
        .context("rpc session failed")
}

/// Current terminal geometry, with a sane fallback.
fn terminal_size() -> (u16, u16) {
    let mut size: libc::winsize = unsafe { std::mem::zeroed() };
    let rc = unsafe {
        libc::ioctl(
            std::io::stdin().as_raw_fd(),
            libc::TIOCGWINSZ,
            &mut size as *mut libc::winsize,
        )
    };
    if rc == 0 && size.ws_row > 0 && size.ws_col > 0 {
        (size.ws_row, size.ws_col)
    } else {
        (24, 80)
    }
}

/// Forward SIGWINCH as resize events.
fn spawn_resize_watcher() -> mpsc::Receiver<(u16, u16)> {
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        let Ok(mut winch) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())
        else {
            return;
        };
        while winch.recv().await.is_some() {
            if tx.send(terminal_size()).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// Puts stdin into raw mode, restoring the previous termios on drop.
struct RawModeGuard {
    original: nix::sys::termios::Termios,
}

impl RawModeGuard {
    fn enable() -> Result<Self> {
        use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg};
        let stdin = std::io::stdin();
        let original = tcgetattr(&stdin).context("reading terminal attributes")?;
        let mut raw = original.clone();
        cfmakeraw(&mut raw);
        tcsetattr(&stdin, SetArg::TCSANOW, &raw).context("setting raw mode")?;
        Ok(Self { original })
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let stdin = std::io::stdin();
        let _ = nix::sys::termios::tcsetattr(
            &stdin,
            nix::sys::termios::SetArg::TCSANOW,
            &self.original,
        );
    }
}
