use std::{sync::Arc, time::Duration};

use k8s_openapi::api::core::v1::Node;
use kube::{ResourceExt, runtime::controller::Action};
use tracing::{debug, error};

use crate::{Error, Result, context::Context};

pub(crate) const DEFAULT_REQUEUE_DURATION: Duration = Duration::from_secs(300);
const ERROR_REQUEUE_DURATION: Duration = Duration::from_secs(5);

#[tracing::instrument(skip(node, ctx), fields(node = %node.name_any()))]
pub(crate) async fn reconcile(node: Arc<Node>, ctx: Arc<Context>) -> Result<Action> {
    let _measure = ctx.metrics.count_and_measure(node.as_ref());
    if node.metadata.deletion_timestamp.is_some() {
        debug!("node {} is terminating", node.name_any());
        ctx.reconciler.handle_delete(&node.name_any());
        return Ok(Action::await_change());
    }
    ctx.reconciler.handle_add_or_update(&node).await?;
    Ok(Action::requeue(DEFAULT_REQUEUE_DURATION))
}

pub(crate) fn error_policy(node: Arc<Node>, error: &Error, ctx: Arc<Context>) -> Action {
    ctx.metrics.count_failure(node.as_ref(), error);
    error!(?error, "reconcile error for node {}", node.name_any());
    Action::requeue(ERROR_REQUEUE_DURATION)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use mesh_cni_ipam::SubnetRange;

    use super::*;
    use crate::metrics::{ControllerLabels, ControllerMetrics, ErrorLabels, SubnetMetrics};
    use crate::network::{HybridOverlayConfig, NetworkContext};
    use crate::reconciler::NodeReconciler;
    use crate::testing::{FakeNodeStore, make_node};

    fn context(store: &Arc<FakeNodeStore>) -> Arc<Context> {
        let range: SubnetRange = "10.130.0.0/24/24".parse().unwrap();
        let reconciler = NodeReconciler::new(
            store.clone(),
            NetworkContext::default_network(vec![range]),
            HybridOverlayConfig::default(),
            SubnetMetrics::default(),
        );
        reconciler.init().unwrap();
        Arc::new(Context {
            reconciler: Arc::new(reconciler),
            metrics: ControllerMetrics::default(),
        })
    }

    #[tokio::test]
    async fn reconcile_allocates_and_requeues() {
        let store = Arc::new(FakeNodeStore::default());
        store.insert(make_node("node-a", &[], &[]));
        let ctx = context(&store);

        let action = reconcile(Arc::new(store.node("node-a")), ctx.clone())
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(DEFAULT_REQUEUE_DURATION));
        assert_eq!(ctx.reconciler.cluster_pool().usage(), (1, 0));
        let runs = ctx
            .metrics
            .runs
            .get_or_create(&ControllerLabels {
                resource: "node".into(),
            })
            .get();
        assert_eq!(runs, 1);
    }

    #[tokio::test]
    async fn terminating_node_releases_subnets() {
        let store = Arc::new(FakeNodeStore::default());
        store.insert(make_node("node-a", &[], &[]));
        let ctx = context(&store);
        reconcile(Arc::new(store.node("node-a")), ctx.clone())
            .await
            .unwrap();

        let mut node = store.node("node-a");
        node.metadata.deletion_timestamp = Some(Time(Default::default()));
        let action = reconcile(Arc::new(node), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(ctx.reconciler.cluster_pool().usage(), (0, 0));
    }

    #[tokio::test]
    async fn failures_are_counted_and_retried() {
        let store = Arc::new(FakeNodeStore::default());
        store.insert(make_node("node-a", &[], &[]));
        store.insert(make_node("node-b", &[], &[]));
        let ctx = context(&store);
        reconcile(Arc::new(store.node("node-a")), ctx.clone())
            .await
            .unwrap();

        let node = Arc::new(store.node("node-b"));
        let error = reconcile(node.clone(), ctx.clone()).await.unwrap_err();
        let action = error_policy(node, &error, ctx.clone());
        assert_eq!(action, Action::requeue(ERROR_REQUEUE_DURATION));
        let failures = ctx
            .metrics
            .failures
            .get_or_create(&ErrorLabels {
                resource: "node".into(),
                error: "pool".into(),
            })
            .get();
        assert_eq!(failures, 1);
    }
}
