use super::{Context, format_bytes};
use crate::progress::BarSink;
use anyhow::{Result, anyhow};
use clap::Args;
use larder_core::pipeline::{BackupRun, LocalFileSource};
use larder_core::scanner::{ScanFilter, Scanner};
use larder_core::store::validate_host;
use std::path::PathBuf;
use tracing::info;

#[derive(Args)]
pub struct BackupCommand {
    #[arg(help = "Host the backup belongs to")]
    host: String,

    #[arg(help = "Directory to back up")]
    root: PathBuf,

    #[arg(long, help = "Include glob (repeatable); added to configured includes")]
    include: Vec<String>,

    #[arg(long, help = "Exclude glob (repeatable); added to configured excludes")]
    exclude: Vec<String>,

    #[arg(long, help = "Chunk size in bytes")]
    chunk_size: Option<usize>,

    #[arg(long, help = "Files hashed concurrently")]
    parallelism: Option<usize>,
}

impl BackupCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        validate_host(&self.host)?;
        if !self.root.is_dir() {
            return Err(anyhow!("Not a directory: {}", self.root.display()));
        }

        let ctx = Context::open(cli).await?;
        let mut options = ctx.config.backup_options();
        if let Some(chunk_size) = self.chunk_size.filter(|&n| n > 0) {
            options.chunk_size = chunk_size;
        }
        if let Some(parallelism) = self.parallelism.filter(|&n| n > 0) {
            options.parallelism = parallelism;
        }

        let includes: Vec<String> = ctx.config.includes.iter().chain(&self.include).cloned().collect();
        let excludes: Vec<String> = ctx.config.excludes.iter().chain(&self.exclude).cloned().collect();
        let scanner = Scanner::new(&self.root, ScanFilter::new(&includes, &excludes)?);

        info!(host = %self.host, root = %self.root.display(), "Starting backup");
        let bar = BarSink::new(cli.quiet);
        let result = BackupRun::new(&ctx.counter, &ctx.pool, &LocalFileSource, options)
            .with_progress(&bar)
            .run(&self.host, scanner)
            .await;
        let info = match result {
            Ok(info) => {
                bar.finish("done");
                info
            }
            Err(e) => {
                bar.abandon();
                return Err(e.into());
            }
        };

        println!("✅ Backup {}/{} complete", info.host, info.number);
        println!("📁 Files: {} ({} reused)", info.stats.files, info.stats.reused_files);
        println!("💾 Size: {}", format_bytes(info.stats.bytes));
        println!(
            "🧩 New chunks: {} ({} stored)",
            info.stats.new_chunks,
            format_bytes(info.stats.new_stored_bytes)
        );
        println!("📝 Journal entries: {}", info.stats.journal_entries);
        if info.degraded {
            println!("⚠️  Degraded: {} files could not be read", info.failed_files.len());
            for path in &info.failed_files {
                println!("    {}", path);
            }
        }
        Ok(())
    }
}
