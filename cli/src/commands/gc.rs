use super::{Context, format_bytes};
use crate::progress::BarSink;
use anyhow::Result;
use clap::Args;
use std::time::Duration;
use tracing::info;

#[derive(Args)]
pub struct UnusedCommand {
    #[arg(long, help = "Print candidate digests")]
    list: bool,
}

impl UnusedCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let ctx = Context::open(cli).await?;
        let unused = ctx
            .retrying("compute unused", || ctx.counter.compute_unused(&ctx.pool))
            .await?;

        println!(
            "🔍 {} unused chunks ({})",
            unused.len(),
            format_bytes(unused.total_stored_size())
        );
        if self.list {
            let mut digests: Vec<_> = unused.digests().collect();
            digests.sort();
            for digest in digests {
                println!("{}", digest);
            }
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct GcCommand {
    #[arg(long, help = "Grace period in seconds; overrides gc.grace_secs")]
    grace_secs: Option<u64>,

    #[arg(long, help = "Candidates per locked batch")]
    batch_size: Option<usize>,

    #[arg(long, help = "Sweep the existing unused set without marking again")]
    no_mark: bool,
}

impl GcCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let ctx = Context::open(cli).await?;
        let mut options = ctx.config.sweep_options();
        if let Some(secs) = self.grace_secs {
            options.grace = Duration::from_secs(secs);
        }
        if let Some(batch_size) = self.batch_size.filter(|&n| n > 0) {
            options.batch_size = batch_size;
        }

        if !self.no_mark {
            let unused = ctx
                .retrying("compute unused", || ctx.counter.compute_unused(&ctx.pool))
                .await?;
            info!(candidates = unused.len(), "Marked unused chunks");
        }

        let bar = BarSink::new(cli.quiet);
        let report = ctx
            .retrying("sweep unused", || {
                ctx.counter.sweep_unused(&ctx.pool, options, &bar)
            })
            .await;
        let report = match report {
            Ok(report) => {
                bar.finish("swept");
                report
            }
            Err(e) => {
                bar.abandon();
                return Err(e.into());
            }
        };

        println!("🧹 Garbage collection finished");
        println!("   Candidates: {}", report.candidates);
        println!("   Deleted: {} ({} freed)", report.deleted, format_bytes(report.freed_bytes));
        println!("   Still referenced: {}", report.skipped_live);
        println!("   Touched within grace period: {}", report.skipped_recent);
        if report.already_gone > 0 {
            println!("   Already gone: {}", report.already_gone);
        }
        Ok(())
    }
}
