use std::sync::Arc;

use mesh_cni_node_ipam_controller::{ControllerMetrics, SubnetMetrics};
use prometheus_client::registry::Registry;

pub struct Metrics {
    pub registry: Arc<Registry>,
    pub controller: ControllerMetrics,
    pub subnets: SubnetMetrics,
}

impl Default for Metrics {
    fn default() -> Self {
        let mut registry = Registry::with_prefix("mesh_cni_node_ipam");
        let controller = ControllerMetrics::default().register(&mut registry);
        let subnets = SubnetMetrics::default().register(&mut registry);
        Self {
            registry: Arc::new(registry),
            controller,
            subnets,
        }
    }
}
