use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::{Controller, WatchStreamExt, controller, metadata_watcher, watcher};
use kube::{Api, Client, ResourceExt};
use mesh_cni_k8s_utils::create_store_and_subscriber;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    Result,
    context::Context,
    controller::{error_policy, reconcile},
    metrics::ControllerMetrics,
    reconciler::NodeReconciler,
};

/// Initializes the pools, seeds them from the current nodes and reconciles
/// nodes until `cancel` fires. `ready` is cancelled once the pools are seeded.
pub async fn start_node_ipam_controller(
    client: Client,
    reconciler: Arc<NodeReconciler>,
    metrics: ControllerMetrics,
    concurrency: u16,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    reconciler.init()?;
    let api = Api::<Node>::all(client);
    let (node_store, node_subscriber) = create_store_and_subscriber(
        api.clone(),
        watcher::Config::default(),
        Some(Duration::from_secs(30)),
    )
    .await?;

    let nodes = node_store.state();
    reconciler.sync(&nodes);
    info!(
        "seeded subnet pools of network {} from {} nodes",
        reconciler.network().name,
        nodes.len()
    );
    ready.cancel();

    tokio::spawn(watch_deletions(api, reconciler.clone(), cancel.clone()));

    let context = Arc::new(Context {
        reconciler,
        metrics,
    });
    Controller::for_shared_stream(node_subscriber, node_store)
        .with_config(controller::Config::default().concurrency(concurrency))
        .graceful_shutdown_on(shutdown(cancel))
        .run(reconcile, error_policy, context)
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    Ok(())
}

// the controller skips objects that are gone from the store
async fn watch_deletions(
    api: Api<Node>,
    reconciler: Arc<NodeReconciler>,
    cancel: CancellationToken,
) {
    let deletions = metadata_watcher(api, watcher::Config::default())
        .default_backoff()
        .for_each(|event| {
            match event {
                Ok(watcher::Event::Delete(node)) => reconciler.handle_delete(&node.name_any()),
                Ok(_) => {}
                Err(e) => warn!(%e, "node deletion watcher failed"),
            }
            futures::future::ready(())
        });
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = deletions => {}
    }
}

async fn shutdown(cancel: CancellationToken) {
    cancel.cancelled().await;
}
