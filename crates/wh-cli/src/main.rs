//! wormhole CLI
//!
//! One binary, two roles:
//! - `connector`: cluster member next to the protected service
//! - `dispatcher`: central endpoint external clients reach

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wormhole::cli::{Cli, Commands};
use wormhole::output::{print_error, print_success, print_warning};
use wormhole::RunningHandle;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| cli.log_level().into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let config = match cli.load_config() {
        Ok(config) => config,
        Err(e) => {
            print_error(&format!("{:#}", e));
            std::process::exit(1);
        }
    };

    if config.tls.insecure {
        print_warning("TLS certificate verification is disabled (--insecure)");
    }

    let handle = match &cli.command {
        Commands::Connector(_) => wormhole::start(config.clone()).await?,
        Commands::Dispatcher(_) => wormhole::start_dispatcher(config.clone()).await?,
    };
    report(&handle, cli.quiet);

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = handle.terminated() => {
            tracing::warn!("Node stopped on its own, shutting down");
        }
    }

    tokio::select! {
        result = handle.shutdown(config.shutdown_grace) => result,
        _ = shutdown_signal() => {
            print_warning("Second signal received, exiting without draining");
            std::process::exit(130);
        }
    }
}

fn report(handle: &RunningHandle, quiet: bool) {
    if quiet {
        return;
    }
    let addrs = handle.addrs();
    if let Some(addr) = addrs.direct {
        print_success(&format!("Direct-serve listening on {}", addr));
    }
    if let Some(addr) = addrs.gossip {
        print_success(&format!("Gossip on {}", addr));
    }
    if let Some(addr) = addrs.consensus {
        print_success(&format!("Consensus on {}", addr));
    }
    if let Some(addr) = addrs.reverse_tunnel {
        print_success(&format!("Reverse tunnel listening on {}", addr));
    }
    if let Some(addr) = addrs.front {
        print_success(&format!("Tunnel listening on {}", addr));
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, initiating shutdown..."),
        _ = terminate => tracing::info!("Received SIGTERM, initiating shutdown..."),
    }
}
