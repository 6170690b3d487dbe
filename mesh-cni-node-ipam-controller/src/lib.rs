pub mod annotations;
mod context;
mod controller;
mod error;
pub mod metrics;
pub mod network;
mod reconciler;
mod runtime;
pub mod store;
#[cfg(test)]
mod testing;

pub use error::Error;
pub use metrics::{ControllerMetrics, SubnetMetrics};
pub use network::{HybridOverlayConfig, NetworkContext, Topology};
pub use reconciler::NodeReconciler;
pub use runtime::start_node_ipam_controller;
pub use store::{KubeNodeStore, NodeStore, StoreError};

pub type Result<T, E = Error> = std::result::Result<T, E>;
