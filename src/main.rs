use std::sync::Arc;

use clap::Parser;
use cosmolet::config::{Cli, Commands};
use cosmolet::http::HealthState;
use cosmolet::{Result, agent, http};
use tokio::task::JoinError;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Agent(args) => {
            setup_subscriber();

            let health = Arc::new(HealthState::default());
            let ready = tokio_util::sync::CancellationToken::new();
            let cancel = tokio_util::sync::CancellationToken::new();
            let mut http_handle = tokio::spawn(http::serve(
                args.health_address,
                ready.clone(),
                health.clone(),
                cancel.child_token(),
            ));
            let mut agent_handle = tokio::spawn(agent::start(args, ready, health, cancel.child_token()));
            let mut shutdown_handle = tokio::spawn(async move { shutdown_signal().await });
            // watch for shutdown and errors
            tokio::select! {
                h = &mut http_handle => exit("http", h),
                h = &mut agent_handle => exit("agent", h),
                _ = &mut shutdown_handle => {
                    cancel.cancel();
                    let (http, agent) = tokio::join!(http_handle, agent_handle);
                    exit("http", http);
                    exit("agent", agent);
                },
            };
            info!("Exiting...");
        }
    }
    Ok(())
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cosmolet=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {
            info!("captured ctrl_c signal");
        },
        _ = terminate => {},
    }
}

fn exit(task: &str, out: Result<Result<()>, JoinError>) {
    match out {
        Ok(Ok(_)) => {
            info!("{task} exited")
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}")
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}")
        }
    }
}
