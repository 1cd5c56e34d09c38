use super::Context;
use crate::progress::BarSink;
use anyhow::{Result, anyhow};
use clap::Args;
use larder_core::refcnt::LedgerScope;
use larder_core::{ChunkPool, VerifyOptions, VerifyReport};

#[derive(Args)]
pub struct FsckCommand {
    #[arg(long, help = "Rewrite diverging ledgers and mark orphaned chunks unused")]
    fix: bool,

    #[arg(long, help = "Confirm every referenced chunk exists in the pool")]
    check_pool: bool,

    #[arg(long, help = "Output format (table, json)")]
    format: Option<String>,
}

impl FsckCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let ctx = Context::open(cli).await?;
        let options = VerifyOptions {
            fix: self.fix,
            check_pool: self.check_pool,
        };
        let pool: Option<&dyn ChunkPool> = self.check_pool.then_some(&ctx.pool as &dyn ChunkPool);

        let bar = BarSink::new(cli.quiet);
        let report = ctx
            .retrying("verify", || ctx.counter.verify(pool, options, &bar))
            .await;
        let report = match report {
            Ok(report) => {
                bar.finish("checked");
                report
            }
            Err(e) => {
                bar.abandon();
                return Err(e.into());
            }
        };

        match self.format.as_deref().unwrap_or("table") {
            "table" => print_report(&report),
            "json" => println!("{}", serde_json::to_string_pretty(&report)?),
            other => return Err(anyhow!("Unsupported format: {}", other)),
        }

        report.into_result()?;
        Ok(())
    }
}

fn scope_name(scope: &LedgerScope) -> String {
    match scope {
        LedgerScope::Backup { host, number } => format!("backup {}/{}", host, number),
        LedgerScope::Host(host) => format!("host {}", host),
        LedgerScope::Pool => "pool".to_string(),
    }
}

fn print_report(report: &VerifyReport) {
    println!(
        "Checked {} hosts, {} backups",
        report.hosts_checked, report.backups_checked
    );

    for scope in &report.scopes {
        let state = if scope.corrupt { " (unreadable)" } else { "" };
        println!(
            "❌ {} ledger diverges on {} digests{}",
            scope_name(&scope.scope),
            scope.divergences.len(),
            state
        );
        for d in scope.divergences.iter().take(20) {
            println!("    {}  expected {}  found {}", d.digest, d.expected, d.actual);
        }
        if scope.divergences.len() > 20 {
            println!("    ... {} more", scope.divergences.len() - 20);
        }
    }
    for fault in &report.faults {
        println!(
            "❌ {}/{}:{} references missing chunk {}",
            fault.host, fault.number, fault.path, fault.digest
        );
    }
    for failure in &report.decode_failures {
        println!(
            "❌ manifest of {}/{} is unreadable: {}",
            failure.host, failure.number, failure.error
        );
    }
    if !report.orphans.is_empty() {
        println!(
            "⚠️  {} pool objects are not in the pool ledger{}",
            report.orphans.len(),
            if report.fixed { "; marked unused" } else { "" }
        );
    }

    if report.is_clean() {
        println!("✅ No problems found");
    } else if report.fixed {
        println!("🔧 Ledgers rewritten");
    }
}
