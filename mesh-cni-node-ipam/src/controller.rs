use std::sync::Arc;

use kube::Client;
use mesh_cni_node_ipam_controller::{
    HybridOverlayConfig, KubeNodeStore, NodeReconciler, start_node_ipam_controller,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Result;
use crate::config::{CleanupArgs, ControllerArgs};
use crate::metrics::Metrics;

pub async fn start(
    args: ControllerArgs,
    metrics: Arc<Metrics>,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    let network = args.network.network()?;
    let hybrid_overlay = args.hybrid_overlay()?;
    let client = Client::try_default().await?;
    info!(
        "starting node ipam for network {} ({} topology)",
        network.name, network.topology
    );

    let store = Arc::new(KubeNodeStore::new(client.clone()));
    let reconciler = Arc::new(NodeReconciler::new(
        store,
        network,
        hybrid_overlay,
        metrics.subnets.clone(),
    ));
    start_node_ipam_controller(
        client,
        reconciler,
        metrics.controller.clone(),
        args.concurrency,
        ready,
        cancel,
    )
    .await?;
    Ok(())
}

pub async fn cleanup(args: CleanupArgs) -> Result<()> {
    let network = args.network.context()?;
    let client = Client::try_default().await?;
    let store = Arc::new(KubeNodeStore::new(client));
    let name = network.name.clone();
    let reconciler = NodeReconciler::new(
        store,
        network,
        HybridOverlayConfig::default(),
        Default::default(),
    );
    reconciler.cleanup(&name).await?;
    info!("removed network {} from all nodes", name);
    Ok(())
}
