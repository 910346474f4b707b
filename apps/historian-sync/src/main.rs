use anyhow::Result;
use clap::Parser;
use historian_sync::cli::{self, Cli};
use historian_sync::config::Config;
use tokio_util::sync::CancellationToken;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,historian_sync=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing()?;
    let config = Config::from_env()?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("shutdown signal received; cancelling in-flight fetches");
            shutdown.cancel();
        }
    });

    let code = cli::run(cli, config, cancel).await?;
    std::process::exit(code);
}
