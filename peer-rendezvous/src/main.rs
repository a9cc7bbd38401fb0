use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use peer_rendezvous::{
    broker::Broker,
    cli::{BrokerArgs, Cli, Command},
    client,
};

const DEFAULT_LOG_FILTER: &str = "info";

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match Cli::parse().command {
        Command::Broker(args) => serve(args).await,
        Command::Client(args) => client::run(args).await,
    }
}

async fn serve(args: BrokerArgs) -> Result<()> {
    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let broker = Broker::with_config(listener, args.config());

    // Keep the address last; scripts read it off the end of the line.
    info!("broker listening on {}", broker.local_addr()?);
    debug!(reply_timeout_secs = args.reply_timeout_secs, "rendezvous reply timeout");

    broker.run_until_ctrl_c().await.inspect_err(|err| {
        error!(error = ?err, "broker stopped unexpectedly");
    })
}
