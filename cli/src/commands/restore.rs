use super::{Context, format_bytes};
use anyhow::{Context as _, Result};
use clap::Args;
use larder_core::restore::restore_file;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

#[derive(Args)]
pub struct RestoreCommand {
    #[arg(help = "Host the backup belongs to")]
    host: String,

    #[arg(help = "Backup number")]
    number: u32,

    #[arg(help = "Path of the file inside the backup, e.g. /etc/hosts")]
    path: String,

    #[arg(help = "Target file, or directory to restore into")]
    target: PathBuf,
}

impl RestoreCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let ctx = Context::open(cli).await?;
        let inside = normalize(&self.path);
        let target = target_file(&self.target, &inside).await;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        info!(host = %self.host, number = self.number, path = %inside, target = %target.display(), "Restoring file");
        let partial = target.with_extension("larder-partial");
        let mut file = fs::File::create(&partial)
            .await
            .with_context(|| format!("Failed to create {}", partial.display()))?;
        let restored = restore_file(
            ctx.store(),
            &ctx.pool,
            &self.host,
            self.number,
            inside.as_bytes(),
            &mut file,
        )
        .await;

        let written = match restored {
            Ok(written) => written,
            Err(e) => {
                drop(file);
                if let Err(cleanup) = fs::remove_file(&partial).await {
                    warn!(error = %cleanup, "Could not remove partial restore");
                }
                return Err(e.into());
            }
        };
        file.sync_all().await?;
        drop(file);
        fs::rename(&partial, &target).await?;

        println!("📂 Restored {} to {}", inside, target.display());
        println!("💾 {}", format_bytes(written));
        Ok(())
    }
}

/// Backup paths are stored relative to the backup root with a leading `/`.
fn normalize(path: &str) -> String {
    format!("/{}", path.trim_start_matches('/'))
}

async fn target_file(target: &Path, inside: &str) -> PathBuf {
    let is_dir = fs::metadata(target).await.map(|m| m.is_dir()).unwrap_or(false);
    match Path::new(inside).file_name() {
        Some(name) if is_dir => target.join(name),
        _ => target.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("etc/hosts"), "/etc/hosts");
        assert_eq!(normalize("/etc/hosts"), "/etc/hosts");
    }

    #[tokio::test]
    async fn test_target_file_joins_directories() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            target_file(dir.path(), "/etc/hosts").await,
            dir.path().join("hosts")
        );
        let file = dir.path().join("out.txt");
        assert_eq!(target_file(&file, "/etc/hosts").await, file);
    }
}
