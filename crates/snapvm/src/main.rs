//! snapvm - snapshot-based user-mode emulator
//!
//! Usage:
//!   snapvm --workspace DIR run             Execute the workspace snapshot
//!   snapvm --workspace DIR init-runtime    Write a fresh runtime module

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use snapvm_core::RegisterBank;
use snapvm_ir::Module;
use snapvm_runtime::{Executor, ExecutorConfig, Workspace};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "snapvm")]
#[command(about = "Snapshot-based user-mode emulator", long_about = None)]
struct Cli {
    /// Workspace directory holding the snapshot, page files, and
    /// runtime module.
    #[arg(long, default_value = ".")]
    workspace: PathBuf,

    /// Cap on executed IR blocks per task dispatch.
    #[arg(long)]
    max_steps: Option<u64>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the snapshot and run until the task queue drains.
    Run,
    /// Write a seed runtime.bc into the workspace.
    InitRuntime,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let ws = Workspace::new(&cli.workspace);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(ws, cli.max_steps),
        Commands::InitRuntime => init_runtime(ws),
    }
}

fn run(ws: Workspace, max_steps: Option<u64>) -> Result<()> {
    if !ws.root().is_dir() {
        bail!("workspace {} is not a directory", ws.root().display());
    }

    let config = ExecutorConfig { max_steps };
    let mut executor = Executor::from_workspace_with_config(ws, config)
        .context("failed to initialize executor from workspace")?;

    info!("running until the task queue drains");
    executor.run();

    executor
        .shutdown()
        .context("failed to persist lifted code at shutdown")?;
    Ok(())
}

fn init_runtime(ws: Workspace) -> Result<()> {
    ws.ensure_dirs()
        .with_context(|| format!("cannot create workspace at {}", ws.root().display()))?;

    let path = ws.runtime_bitcode_path();
    if path.exists() {
        bail!("refusing to overwrite existing {}", path.display());
    }

    Module::runtime_seed(RegisterBank::MIN_LEN)
        .write_to(&path)
        .context("failed to write runtime module")?;
    println!("wrote {}", path.display());
    Ok(())
}
