//! portico - multi-tenant HTTPS edge proxy for loopback-tunneled backends

mod bootstrap;
mod config;
mod server;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Server(args) => {
            tracing_subscriber::registry()
                .with(
                    EnvFilter::try_new(&args.log_level)
                        .unwrap_or_else(|_| EnvFilter::new("info")),
                )
                .with(tracing_subscriber::fmt::layer())
                .init();

            server::run(args).await
        }
    }
}
