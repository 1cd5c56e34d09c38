use super::{Context, format_bytes};
use anyhow::{Result, anyhow};
use clap::Args;
use larder_core::BackupInfo;

#[derive(Args)]
pub struct BackupsCommand {
    #[arg(help = "Only list backups of this host")]
    host: Option<String>,

    #[arg(long, help = "Include failed and unfinished backups")]
    all: bool,

    #[arg(long, help = "Output format (table, json)")]
    format: Option<String>,
}

impl BackupsCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let ctx = Context::open(cli).await?;
        let hosts = match &self.host {
            Some(host) => vec![host.clone()],
            None => ctx.store().list_hosts().await?,
        };

        let mut backups: Vec<BackupInfo> = Vec::new();
        for host in &hosts {
            let mut listed = ctx.store().list_backups(host).await?;
            if !self.all {
                listed.retain(BackupInfo::is_live);
            }
            backups.extend(listed);
        }

        match self.format.as_deref().unwrap_or("table") {
            "table" => {
                if backups.is_empty() {
                    println!("No backups found");
                    return Ok(());
                }
                println!(
                    "{:<16} {:>5} {:<20} {:<9} {:>8} {:>12}",
                    "Host", "#", "Started", "State", "Files", "Size"
                );
                println!("{:-<75}", "");
                for backup in &backups {
                    let state = if backup.degraded {
                        format!("{:?}*", backup.state)
                    } else {
                        format!("{:?}", backup.state)
                    };
                    println!(
                        "{:<16} {:>5} {:<20} {:<9} {:>8} {:>12}",
                        backup.host,
                        backup.number,
                        backup.started_at.format("%Y-%m-%d %H:%M:%S"),
                        state,
                        backup.stats.files,
                        format_bytes(backup.stats.bytes)
                    );
                }
                if backups.iter().any(|b| b.degraded) {
                    println!("* some files could not be read");
                }
            }
            "json" => println!("{}", serde_json::to_string_pretty(&backups)?),
            other => return Err(anyhow!("Unsupported format: {}", other)),
        }
        Ok(())
    }
}
