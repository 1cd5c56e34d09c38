use super::Context;
use anyhow::Result;
use clap::Args;
use tracing::info;

#[derive(Args)]
pub struct RemoveCommand {
    #[arg(help = "Host the backup belongs to")]
    host: String,

    #[arg(help = "Backup number")]
    number: u32,
}

impl RemoveCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let ctx = Context::open(cli).await?;
        let info = ctx.store().load_backup(&self.host, self.number).await?;
        info!(backup = %info.summary(), "Removing backup");

        let removal = ctx
            .retrying("remove backup", || {
                ctx.counter.remove_backup(&self.host, self.number)
            })
            .await?;

        println!("🗑️  Removed backup {}/{}", self.host, self.number);
        if removal.decremented {
            println!(
                "   {} chunks no longer used by {}, {} no longer used by any host",
                removal.host_zeroed, self.host, removal.pool_zeroed
            );
            if removal.pool_zeroed > 0 {
                println!("   Run `larder gc` to reclaim their space");
            }
        } else {
            println!("   Reference counts were not changed");
        }
        Ok(())
    }
}
