use clap::Parser;
use tracing_subscriber::EnvFilter;

use s3tlsproxy::cli::{self, Cli};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_level(true)
        .with_thread_names(true)
        .with_target(true)
        .init();

    let cli = Cli::parse();
    cli::run(cli).await
}
