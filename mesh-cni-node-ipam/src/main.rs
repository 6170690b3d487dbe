use std::sync::Arc;

use clap::Parser;
use mesh_cni_node_ipam::{Result, config::Cli, config::Commands, controller, http, metrics::Metrics};
use tokio::task::JoinError;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_subscriber();
    match cli.command {
        Commands::Controller(controller_args) => {
            let cancel = tokio_util::sync::CancellationToken::new();
            let ready = tokio_util::sync::CancellationToken::new();
            let metrics = Arc::new(Metrics::default());

            let mut metrics_handle = tokio::spawn(http::serve_metrics(
                controller_args.metrics_address,
                metrics.registry.clone(),
                ready.child_token(),
                cancel.child_token(),
            ));
            let mut controller_handle = tokio::spawn(controller::start(
                controller_args,
                metrics,
                ready,
                cancel.child_token(),
            ));
            let mut shutdown_handle = tokio::spawn(async move { shutdown_signal().await });
            // watch for shutdown and errors
            tokio::select! {
                h = &mut metrics_handle => exit("metrics", h),
                h = &mut controller_handle => exit("controller", h),
                _ = &mut shutdown_handle => {
                        cancel.cancel();
                        let (metrics, controller) = tokio::join!(metrics_handle, controller_handle);
                        if let Err(m) = metrics {
                            error!("metrics exited with error: {}", m.to_string());
                        }
                        if let Err(c) = controller {
                            error!("controller exited with error: {}", c.to_string());
                        }
                    },
            };
            info!("Exiting...");
        }
        Commands::Cleanup(cleanup_args) => controller::cleanup(cleanup_args).await?,
    }
    Ok(())
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "mesh_cni_node_ipam=info,mesh_cni_node_ipam_controller=info,mesh_cni_ipam=info"
                    .into()
            }),
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
