mod commands;
mod config;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{
    backup::BackupCommand,
    backups::BackupsCommand,
    fsck::FsckCommand,
    gc::{GcCommand, UnusedCommand},
    remove::RemoveCommand,
    restore::RestoreCommand,
};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "larder",
    about = "Deduplicating multi-host backup store",
    long_about = "Larder backs up many hosts into one content-addressed chunk pool, \
                  tracks chunk references per backup, host and pool, and reclaims \
                  unreferenced chunks safely while backups run"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, env = "LARDER_CONFIG", help = "Configuration file")]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "LARDER_STORE", help = "Store path")]
    store: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Back up a directory for a host")]
    Backup(BackupCommand),

    #[command(about = "Remove a backup and release its chunk references")]
    Remove(RemoveCommand),

    #[command(about = "Mark chunks no backup references")]
    Unused(UnusedCommand),

    #[command(about = "Mark and delete unreferenced chunks")]
    Gc(GcCommand),

    #[command(about = "Check reference counts and pool integrity")]
    Fsck(FsckCommand),

    #[command(about = "List backups")]
    Backups(BackupsCommand),

    #[command(about = "Restore a file from a backup")]
    Restore(RestoreCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet)?;

    debug!("Starting larder");

    match cli.command {
        Commands::Backup(ref cmd) => cmd.run(&cli).await,
        Commands::Remove(ref cmd) => cmd.run(&cli).await,
        Commands::Unused(ref cmd) => cmd.run(&cli).await,
        Commands::Gc(ref cmd) => cmd.run(&cli).await,
        Commands::Fsck(ref cmd) => cmd.run(&cli).await,
        Commands::Backups(ref cmd) => cmd.run(&cli).await,
        Commands::Restore(ref cmd) => cmd.run(&cli).await,
    }
}

fn init_tracing(verbose: bool, quiet: bool) -> Result<()> {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    // Matches larder, larder_core and larder_backends. RUST_LOG replaces it.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("larder={}", level)));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
