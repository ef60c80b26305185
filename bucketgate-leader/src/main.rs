use anyhow::{Context, Result};
use bucketgate::distributed::{LeaderConfig, LeaderServer, DEFAULT_LEADER_ADDR};
use bucketgate::distributed::frame::DEFAULT_MAX_FRAME_LEN;
use clap::Parser;
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Owns bucket queues and the global rate limiter for a fleet of bucketgate workers.
#[derive(Debug, Parser)]
#[command(name = "bucketgate-leader", version, about)]
struct Args {
    /// Address to accept workers on.
    #[arg(long, env = "BUCKETGATE_BIND", default_value_t = DEFAULT_LEADER_ADDR)]
    bind: SocketAddr,

    /// Longest frame accepted from a worker, in bytes.
    #[arg(long, env = "BUCKETGATE_MAX_FRAME_LEN", default_value_t = DEFAULT_MAX_FRAME_LEN)]
    max_frame_len: usize,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("bucketgate={level},bucketgate_leader={level}", level = args.log_level).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = LeaderConfig::new(args.bind).with_max_frame_len(args.max_frame_len);
    let server = LeaderServer::bind(config)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(bind = %server.local_addr()?, max_frame_len = args.max_frame_len, "starting leader");

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received");
            shutdown.cancel();
        }
    });

    server.run().await.context("leader stopped")?;
    Ok(())
}
