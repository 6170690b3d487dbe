use std::collections::BTreeMap;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use mesh_cni_ipam::{Families, RangePool, reconcile_subnets};
use mesh_cni_k8s_utils::{Backoff, retry_with_backoff};
use tracing::{debug, info, warn};

use crate::annotations::{self, AnnotationError, NO_HOST_SUBNET_LABEL};
use crate::metrics::SubnetMetrics;
use crate::network::{HybridOverlayConfig, INVALID_NETWORK_ID, NetworkContext};
use crate::store::NodeStore;
use crate::{Error, Result};

/// Keeps the host subnets declared on nodes consistent with the cluster and
/// hybrid overlay pools of one network.
///
/// Pool reservations are made before the node is written; when the write
/// fails the reservations made for it are released again before returning.
pub struct NodeReconciler {
    store: Arc<dyn NodeStore>,
    network: NetworkContext,
    hybrid_overlay: HybridOverlayConfig,
    cluster_pool: RangePool,
    hybrid_overlay_pool: RangePool,
    metrics: SubnetMetrics,
    backoff: Backoff,
}

impl NodeReconciler {
    pub fn new(
        store: Arc<dyn NodeStore>,
        network: NetworkContext,
        hybrid_overlay: HybridOverlayConfig,
        metrics: SubnetMetrics,
    ) -> Self {
        Self {
            store,
            network,
            hybrid_overlay,
            cluster_pool: RangePool::new(),
            hybrid_overlay_pool: RangePool::new(),
            metrics,
            backoff: Backoff::default(),
        }
    }

    /// Overrides the backoff used when node updates conflict.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn network(&self) -> &NetworkContext {
        &self.network
    }

    pub fn cluster_pool(&self) -> &RangePool {
        &self.cluster_pool
    }

    pub fn hybrid_overlay_pool(&self) -> &RangePool {
        &self.hybrid_overlay_pool
    }

    fn hybrid_overlay_eligible(&self) -> bool {
        !self.network.secondary && self.hybrid_overlay.enabled
    }

    /// Registers the configured ranges in the pools.
    pub fn init(&self) -> Result<()> {
        self.network.validate()?;
        if self.network.has_node_subnet_allocation() {
            for range in &self.network.cluster_subnets {
                self.cluster_pool.add_range(range.network, range.host_prefix)?;
                info!("added cluster subnet {} to network {}", range, self.network.name);
            }
        }
        if self.hybrid_overlay_eligible() {
            for range in &self.hybrid_overlay.cluster_subnets {
                self.hybrid_overlay_pool
                    .add_range(range.network, range.host_prefix)?;
                info!("added hybrid overlay subnet {}", range);
            }
        }
        self.record_count();
        Ok(())
    }

    #[tracing::instrument(skip(self, node), fields(node = %node.name_any()))]
    pub async fn handle_add_or_update(&self, node: &Node) -> Result<()> {
        if !annotations::no_host_subnet(node) {
            self.sync_node(node).await?;
        } else if self.has_hybrid_overlay_allocation(node) {
            self.ensure_hybrid_overlay_subnet(node).await?;
        } else {
            debug!("node {} has no host subnet, skipping", node.name_any());
        }
        self.record_count();
        Ok(())
    }

    /// Returns every subnet held by `name` to the pools.
    #[tracing::instrument(skip(self))]
    pub fn handle_delete(&self, name: &str) {
        if self.hybrid_overlay_eligible() {
            let released = self.hybrid_overlay_pool.release_all(name);
            if !released.is_empty() {
                info!("released hybrid overlay subnets {:?} of deleted node {}", released, name);
            }
        }
        if self.network.has_node_subnet_allocation() {
            let released = self.cluster_pool.release_all(name);
            if !released.is_empty() {
                info!("released subnets {:?} of deleted node {}", released, name);
            }
            self.record_count();
        }
    }

    /// Seeds the pools with the subnets already declared on `nodes`. Nothing
    /// new is allocated and nothing is written.
    pub fn sync(&self, nodes: &[Arc<Node>]) {
        if !self.network.has_node_subnet_allocation() {
            return;
        }
        for node in nodes {
            let name = node.name_any();
            if annotations::no_host_subnet(node) {
                if self.has_hybrid_overlay_allocation(node) {
                    match annotations::hybrid_overlay_subnet(node) {
                        Ok(Some(subnet)) => {
                            let pool = &self.hybrid_overlay_pool;
                            if let Err(e) = pool.mark_allocated(&name, &[subnet]) {
                                warn!(
                                    "failed to mark hybrid overlay subnet {} on {}: {}",
                                    subnet, name, e
                                );
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("ignoring hybrid overlay subnet of {}: {}", name, e),
                    }
                }
                continue;
            }
            match annotations::node_subnets(node, &self.network.name) {
                Ok(Some(subnets)) => {
                    debug!("marking subnets {:?} of {} as allocated", subnets, name);
                    if let Err(e) = self.cluster_pool.mark_allocated(&name, &subnets) {
                        warn!("failed to mark subnets {:?} on {}: {}", subnets, name, e);
                    }
                }
                Ok(None) => {}
                Err(e) => warn!("ignoring subnets of {}: {}", name, e),
            }
        }
        self.record_usage();
    }

    /// Removes `network_name` from every managed node and releases the
    /// subnets those nodes held. Every node is attempted; the first failure
    /// is returned once all of them have been visited.
    #[tracing::instrument(skip(self))]
    pub async fn cleanup(&self, network_name: &str) -> Result<()> {
        let nodes = self.store.list(&format!("!{NO_HOST_SUBNET_LABEL}")).await?;
        let mut first_error = None;
        for node in nodes.iter().filter(|n| !annotations::no_host_subnet(n)) {
            let name = node.name_any();
            let result = self
                .update_node_annotations(&name, |annotations| {
                    annotations::set_node_subnets(annotations, network_name, &[])?;
                    annotations::set_network_id(annotations, network_name, INVALID_NETWORK_ID)
                })
                .await;
            if let Err(e) = result {
                warn!("failed to clear network {} from node {}: {}", network_name, name, e);
                first_error.get_or_insert(e);
                continue;
            }
            let released = self.cluster_pool.release_all(&name);
            info!(
                "cleared network {} from node {}, released {:?}",
                network_name, name, released
            );
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn sync_node(&self, node: &Node) -> Result<()> {
        let name = node.name_any();
        let network = &self.network;
        let existing = annotations::node_subnets(node, &network.name)
            .unwrap_or_else(|e| {
                warn!("treating subnets of {} as absent: {}", name, e);
                None
            })
            .unwrap_or_default();
        let declared_id = annotations::network_id(node, &network.name).unwrap_or_else(|e| {
            warn!("treating network id of {} as absent: {}", name, e);
            None
        });

        let adopted = self.cluster_pool.allocated(&name).is_empty();
        let (subnets, allocated) = if network.has_node_subnet_allocation() {
            let reconciled =
                reconcile_subnets(&self.cluster_pool, &name, &existing, network.families)?;
            (Some(reconciled.subnets), reconciled.allocated)
        } else {
            (None, Vec::new())
        };

        let subnets_changed = subnets
            .as_ref()
            .is_some_and(|s| s.len() != existing.len() || s.iter().any(|n| !existing.contains(n)));
        if !subnets_changed && declared_id == Some(network.id) {
            debug!("node {} is up to date for network {}", name, network.name);
            if adopted && subnets.as_ref().is_some_and(|s| !s.is_empty()) {
                self.release_if_deleted(&self.cluster_pool, &name).await;
            }
            return Ok(());
        }

        let result = self
            .update_node_annotations(&name, |annotations| {
                if let Some(subnets) = &subnets {
                    annotations::set_node_subnets(annotations, &network.name, subnets)?;
                }
                annotations::set_network_id(annotations, &network.name, network.id)
            })
            .await;
        if let Err(e) = result {
            release(&self.cluster_pool, &name, &allocated);
            if e.is_not_found() {
                self.cluster_pool.release_all(&name);
            }
            return Err(e);
        }
        info!(
            "set subnets {:?} and network id {} on node {} for network {}",
            subnets.unwrap_or_default(),
            network.id,
            name,
            network.name
        );
        Ok(())
    }

    async fn ensure_hybrid_overlay_subnet(&self, node: &Node) -> Result<()> {
        let name = node.name_any();
        let existing: Vec<IpNetwork> = annotations::hybrid_overlay_subnet(node)
            .unwrap_or_else(|e| {
                warn!("treating hybrid overlay subnet of {} as absent: {}", name, e);
                None
            })
            .into_iter()
            .collect();
        let adopted = self.hybrid_overlay_pool.allocated(&name).is_empty();
        let reconciled =
            reconcile_subnets(&self.hybrid_overlay_pool, &name, &existing, Families::V4)?;
        let Some(&subnet) = reconciled.subnets.first() else {
            return Ok(());
        };
        if reconciled.allocated.is_empty() && existing == [subnet] {
            debug!("hybrid overlay subnet {} on {} is up to date", subnet, name);
            if adopted {
                self.release_if_deleted(&self.hybrid_overlay_pool, &name).await;
            }
            return Ok(());
        }

        let result = self
            .update_node_annotations(&name, |annotations| {
                annotations::set_hybrid_overlay_subnet(annotations, &subnet);
                Ok(())
            })
            .await;
        if let Err(e) = result {
            release(&self.hybrid_overlay_pool, &name, &reconciled.allocated);
            if e.is_not_found() {
                self.hybrid_overlay_pool.release_all(&name);
            }
            return Err(e);
        }
        info!("set hybrid overlay subnet {} on node {}", subnet, name);
        Ok(())
    }

    /// Subnets adopted from a stale copy of a node that has meanwhile been
    /// deleted would never be released, since the delete was already handled.
    async fn release_if_deleted(&self, pool: &RangePool, name: &str) {
        match self.store.get(name).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                let released = pool.release_all(name);
                info!("node {} is gone, released {:?}", name, released);
            }
            Err(e) => warn!("failed to check whether node {} still exists: {}", name, e),
        }
    }

    fn has_hybrid_overlay_allocation(&self, node: &Node) -> bool {
        self.hybrid_overlay_eligible() && annotations::is_hybrid_overlay_node(node)
    }

    /// Applies `mutate` to a fresh copy of the node's annotations and writes
    /// it back, retrying on conflicts.
    async fn update_node_annotations<F>(&self, name: &str, mutate: F) -> Result<()>
    where
        F: Fn(&mut BTreeMap<String, String>) -> Result<(), AnnotationError> + Sync,
    {
        let store = &self.store;
        let mutate = &mutate;
        retry_with_backoff(&self.backoff, Error::is_conflict, || async move {
            let mut node = store.get(name).await?;
            mutate(node.metadata.annotations.get_or_insert_with(BTreeMap::new))?;
            store.update_status(node).await?;
            Ok::<_, Error>(())
        })
        .await
        .map_err(|e| Error::UpdateNode {
            node: name.to_owned(),
            source: Box::new(e),
        })
    }

    fn record_count(&self) {
        if !self.network.secondary {
            self.metrics.record_count(self.cluster_pool.count());
        }
    }

    fn record_usage(&self) {
        if !self.network.secondary {
            self.metrics.record_usage(self.cluster_pool.usage());
        }
    }
}

fn release(pool: &RangePool, owner: &str, subnets: &[IpNetwork]) {
    if subnets.is_empty() {
        return;
    }
    match pool.release(owner, subnets) {
        Ok(()) => info!("released subnets {:?} of {} after failed update", subnets, owner),
        Err(e) => warn!("failed to release subnets {:?} of {}: {}", subnets, owner, e),
    }
}
