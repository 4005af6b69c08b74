//! scp-wire - copy files to and from a remote host over ssh, speaking the
//! scp protocol directly

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use scp_wire::url::{parse_remote, RemoteSpec};
use scp_wire::{CancelToken, Logger, NoopLogger, ProcessShell, Scp, ScpConfig, TextLogger};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "scp-wire - scp protocol client over ssh")]
struct Cli {
    /// TOML config file (scp_path, buffer_size, preserve)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// ssh program used to reach the remote host
    #[arg(long, global = true, default_value = "ssh")]
    ssh: String,

    /// Append transfer log lines to file
    #[arg(long = "log-file", global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy a local file or directory to the remote host
    Push(PushArgs),
    /// Copy a remote file or directory to this machine
    Pull(PullArgs),
}

#[derive(Args, Debug)]
struct PushArgs {
    /// Copy directories recursively
    #[arg(short, long)]
    recursive: bool,
    local: PathBuf,
    /// [user@]host:path
    remote: String,
}

#[derive(Args, Debug)]
struct PullArgs {
    /// Copy directories recursively
    #[arg(short, long)]
    recursive: bool,
    /// [user@]host:path
    remote: String,
    local: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted by user, cancelling transfer (Ctrl-C)...");
        on_interrupt.cancel();
    })
    .context("failed to set Ctrl-C handler")?;

    let config = match &cli.config {
        Some(path) => ScpConfig::load(path)?,
        None => ScpConfig::default(),
    };

    // Choose logger once; NoopLogger when no log file was asked for
    let logger: Arc<dyn Logger> = match &cli.log_file {
        Some(p) => match TextLogger::new(p) {
            Ok(l) => Arc::new(l),
            Err(e) => {
                tracing::warn!(path = %p.display(), error = %e, "cannot open log file, continuing without it");
                Arc::new(NoopLogger)
            }
        },
        None => Arc::new(NoopLogger),
    };

    let client = |remote: &RemoteSpec| {
        Scp::new(ProcessShell::ssh(&remote.host).with_program(&cli.ssh))
            .with_config(config.clone())
            .with_cancel(cancel.clone())
            .with_logger(logger.clone())
    };

    let result = match &cli.command {
        Command::Push(args) => {
            let remote = remote_operand(&args.remote)?;
            push(&client(&remote), &args.local, &remote.path, args.recursive)
        }
        Command::Pull(args) => {
            let remote = remote_operand(&args.remote)?;
            pull(&client(&remote), &remote.path, &args.local, args.recursive)
        }
    };

    if cancel.is_cancelled() {
        eprintln!("Transfer cancelled");
        std::process::exit(130);
    }
    result
}

fn remote_operand(operand: &str) -> Result<RemoteSpec> {
    match parse_remote(operand) {
        Some(remote) => Ok(remote),
        None => bail!("expected [user@]host:path, got {:?}", operand),
    }
}

fn push(client: &Scp<ProcessShell>, local: &Path, remote: &str, recursive: bool) -> Result<()> {
    if local.is_dir() {
        if !recursive {
            bail!("{} is a directory (use -r)", local.display());
        }
        client.send_dir(local, remote, None)
    } else {
        client.send_file(local, remote)
    }
}

fn pull(client: &Scp<ProcessShell>, remote: &str, local: &Path, recursive: bool) -> Result<()> {
    if recursive {
        client.receive_dir(remote, local, None)
    } else {
        client.receive_file(remote, local)
    }
}
