use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use fa_patcher::asm::Nasm;
use fa_patcher::config::Plan;
use fa_patcher::run::Orchestrator;

#[derive(Parser, Debug)]
#[command(name = "fa-patcher", version, about = "Forged Alliance Patcher")]
struct Cli {
    /// Compile the C patch version instead
    #[arg(short = 'c', long = "c-code")]
    c_code: bool,

    /// Show the assembled code and every step of the run
    #[arg(short, long)]
    verbose: bool,

    /// Assembler used for the hooks and the extension section
    #[arg(long, default_value = "nasm")]
    nasm: PathBuf,

    /// Optional filename to place the patched version at
    output_file: Option<PathBuf>,
}

/// Installs the log subscriber, honouring `RUST_LOG` when it is set
fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();
}

/// Moves `from` to `to`, falling back to copy and delete across filesystems
fn move_file(from: &Path, to: &Path) -> Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)
        .with_context(|| format!("failed to copy {} to {}", from.display(), to.display()))?;
    fs::remove_file(from).with_context(|| format!("failed to remove {}", from.display()))?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let plan = Plan::forged_alliance(cli.c_code).context("invalid executable layout")?;
    let nasm = Nasm::new(&cli.nasm, &plan.build_dir);

    Orchestrator::new(&plan, &nasm)
        .run()
        .with_context(|| format!("failed to patch {}", plan.base.display()))?;

    if let Some(output) = &cli.output_file {
        move_file(&plan.working, output)?;
        info!(
            "Moved {} to {}",
            plan.working.display(),
            output.display()
        );
    }
    Ok(())
}
