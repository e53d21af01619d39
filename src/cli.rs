//! Command-line interface definitions.
//!
//! Uses clap's derive API. Every flag has a `MATCHLOCK_*` environment
//! mirror (dashes become underscores).

use clap::{Args, Parser, Subcommand};

/// A lightweight micro-VM sandbox for running AI agents securely, with
/// network interception and secret protection.
#[derive(Parser, Debug)]
#[command(name = "matchlock")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a command in a new sandbox.
    ///
    /// Secrets are injected via the MITM proxy; the real value never enters
    /// the VM. The VM sees a placeholder, which is replaced with the real
    /// value in HTTP headers on matching hosts.
    #[command(after_long_help = RUN_HELP)]
    Run(RunArgs),

    /// Execute a command in a running sandbox.
    ///
    /// The sandbox must have been started with --rm=false to stay running.
    Exec(ExecArgs),

    /// List all sandboxes.
    #[command(alias = "ls")]
    List {
        /// Show only running sandboxes.
        #[arg(long)]
        running: bool,
    },

    /// Get details of a sandbox as JSON.
    Get { id: String },

    /// Kill a running sandbox.
    Kill {
        /// Kill all running sandboxes.
        #[arg(long)]
        all: bool,
        id: Option<String>,
    },

    /// Remove a stopped sandbox.
    #[command(alias = "remove")]
    Rm {
        /// Remove all stopped sandboxes.
        #[arg(long)]
        stopped: bool,
        id: Option<String>,
    },

    /// Remove all stopped sandboxes.
    Prune,

    /// Run in JSON-RPC mode (for programmatic access).
    Rpc,
}

const RUN_HELP: &str = "\
Secrets (--secret):
    NAME=VALUE@host1,host2     Inline secret value for specified hosts
    NAME@host1,host2           Read secret from $NAME environment variable

Volume mounts (-v):
    ./mycode:code              Mounts to <workspace>/code
    ./data:/workspace/data     Same as above (explicit)
    /host/path:subdir:ro       Read-only mount to <workspace>/subdir

Wildcard patterns for --allow-host:
    *                          Allow all hosts
    *.example.com              Allow all subdomains (api.example.com, a.b.example.com)
    api-*.example.com          Allow pattern match (api-v1.example.com, api-prod.example.com)
";

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Container image (or a direct path to a rootfs).
    #[arg(long, env = "MATCHLOCK_IMAGE")]
    pub image: String,

    /// Guest mount point for the VFS.
    #[arg(long, default_value = crate::api::DEFAULT_WORKSPACE, env = "MATCHLOCK_WORKSPACE")]
    pub workspace: String,

    /// Allowed host pattern (repeatable).
    #[arg(long = "allow-host", env = "MATCHLOCK_ALLOW_HOST")]
    pub allow_host: Vec<String>,

    /// Volume mount HOST:GUEST[:ro] (repeatable).
    #[arg(short = 'v', long = "volume")]
    pub volume: Vec<String>,

    /// Secret NAME=VALUE@host1,host2 or NAME@host1,host2 (repeatable).
    #[arg(long)]
    pub secret: Vec<String>,

    /// Number of CPUs.
    #[arg(long, default_value_t = crate::api::DEFAULT_CPUS, env = "MATCHLOCK_CPUS")]
    pub cpus: u32,

    /// Memory in MB.
    #[arg(long, default_value_t = crate::api::DEFAULT_MEMORY_MB, env = "MATCHLOCK_MEMORY")]
    pub memory: u32,

    /// Timeout in seconds (exit 124 when exceeded).
    #[arg(long, default_value_t = crate::api::DEFAULT_TIMEOUT_SECONDS, env = "MATCHLOCK_TIMEOUT")]
    pub timeout: u64,

    /// Disk size in MB.
    #[arg(long = "disk-size", default_value_t = crate::api::DEFAULT_DISK_SIZE_MB, env = "MATCHLOCK_DISK_SIZE")]
    pub disk_size: u32,

    /// Allocate a pseudo-TTY.
    #[arg(short = 't', long)]
    pub tty: bool,

    /// Keep STDIN open.
    #[arg(short = 'i', long)]
    pub interactive: bool,

    /// Always pull the image from the registry (ignore cache).
    #[arg(long)]
    pub pull: bool,

    /// Remove the sandbox after the command exits (--rm=false keeps it
    /// running for `matchlock exec`).
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set, num_args = 0..=1, default_missing_value = "true")]
    pub rm: bool,

    /// Skip in-guest security restrictions (seccomp, cap drop, no_new_privs).
    #[arg(long)]
    pub privileged: bool,

    /// Working directory inside the sandbox (default: workspace path).
    #[arg(short = 'w', long = "workdir")]
    pub workdir: Option<String>,

    /// Command to run.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Allocate a pseudo-TTY.
    #[arg(short = 't', long)]
    pub tty: bool,

    /// Keep STDIN open.
    #[arg(short = 'i', long)]
    pub interactive: bool,

    /// Working directory inside the sandbox (default: workspace path).
    #[arg(short = 'w', long = "workdir")]
    pub workdir: Option<String>,

    /// Sandbox ID.
    pub id: String,

    /// Command to run.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}
