//! Scribble - serverless shared whiteboard
//!
//! Starts one peer node and drives it from the console.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use scribble_net::PeerNode;

mod config;
mod console;

use config::{AppConfig, Args};
use console::Console;

fn main() {
    // Initialize logging on stderr, leaving stdout to the console
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match AppConfig::from_args(Args::parse()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(2);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!("Failed to create tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    std::process::exit(runtime.block_on(run(config)));
}

async fn run(config: AppConfig) -> i32 {
    tracing::info!(listen = %config.node.listen, author = %config.author, "Starting Scribble");

    let node = match PeerNode::start(config.node).await {
        Ok(node) => node,
        Err(e) => {
            tracing::error!("Failed to start node: {}", e);
            return 1;
        }
    };

    Console::new(node, config.author).run().await;
    0
}
