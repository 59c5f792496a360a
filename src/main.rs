use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edgekeeper::{Config, Gatekeeper};

#[derive(Parser, Debug)]
#[command(name = "edgekeeper")]
#[command(about = "Request-admission and cache-policy engine")]
struct Args {
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    #[arg(short, long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting edgekeeper");

    // Configuration errors are fatal: never serve with a bad pool set.
    let config = Config::load(&args.config).await?;

    if args.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }

    let gatekeeper = Gatekeeper::new(&config)?;

    let server_task = {
        let gatekeeper = gatekeeper.clone();
        let server = config.server.clone();
        tokio::spawn(async move {
            if let Err(e) = gatekeeper.serve(&server).await {
                error!("Server error: {}", e);
            }
        })
    };

    info!(
        "edgekeeper started on {}:{} with {} pools",
        config.server.host,
        config.server.port,
        config.pools.len()
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        _ = server_task => {
            error!("Server task exited unexpectedly");
        }
    }

    info!("edgekeeper shutdown complete");
    Ok(())
}
