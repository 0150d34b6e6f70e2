use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "shardline", version, about = "Sharding proxy for memcache and redis")]
struct Args {
    /// Path of the TOML config file.
    #[arg(long, short, default_value = "shardline.toml")]
    config: PathBuf,

    /// Poll the config file and hot swap forwarders on backend changes.
    #[arg(long)]
    reload: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    libshardline::run(args.config, args.reload).await
}
