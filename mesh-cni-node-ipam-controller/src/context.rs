use std::sync::Arc;

use crate::metrics::ControllerMetrics;
use crate::reconciler::NodeReconciler;

pub(crate) struct Context {
    pub reconciler: Arc<NodeReconciler>,
    pub metrics: ControllerMetrics,
}
