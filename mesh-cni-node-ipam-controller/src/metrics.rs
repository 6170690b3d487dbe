use kube::ResourceExt;
use mesh_cni_ipam::Family as IpFamily;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::{Registry, Unit},
};
use tokio::time::Instant;

use crate::Error;

/// Capacity and usage of the cluster subnet pool.
#[derive(Clone, Default)]
pub struct SubnetMetrics {
    host_subnets: Family<IpFamilyLabels, Gauge>,
    allocated_host_subnets: Family<IpFamilyLabels, Gauge>,
}

impl SubnetMetrics {
    pub fn register(self, registry: &mut Registry) -> Self {
        registry.register(
            "host_subnets",
            "Number of host subnets in the cluster subnet pool",
            self.host_subnets.clone(),
        );
        registry.register(
            "allocated_host_subnets",
            "Number of host subnets allocated to nodes",
            self.allocated_host_subnets.clone(),
        );
        self
    }

    pub fn record_count(&self, (v4, v6): (u64, u64)) {
        set(&self.host_subnets, IpFamily::V4, v4);
        set(&self.host_subnets, IpFamily::V6, v6);
    }

    pub fn record_usage(&self, (v4, v6): (u64, u64)) {
        set(&self.allocated_host_subnets, IpFamily::V4, v4);
        set(&self.allocated_host_subnets, IpFamily::V6, v6);
    }

    pub fn host_subnets(&self, family: IpFamily) -> i64 {
        self.host_subnets.get_or_create(&IpFamilyLabels::from(family)).get()
    }

    pub fn allocated_host_subnets(&self, family: IpFamily) -> i64 {
        self.allocated_host_subnets
            .get_or_create(&IpFamilyLabels::from(family))
            .get()
    }
}

fn set(metric: &Family<IpFamilyLabels, Gauge>, family: IpFamily, value: u64) {
    metric
        .get_or_create(&IpFamilyLabels::from(family))
        .set(i64::try_from(value).unwrap_or(i64::MAX));
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct IpFamilyLabels {
    pub family: String,
}

impl From<IpFamily> for IpFamilyLabels {
    fn from(family: IpFamily) -> Self {
        Self {
            family: family.as_str().to_owned(),
        }
    }
}

#[derive(Clone)]
pub struct ControllerMetrics {
    pub runs: Family<ControllerLabels, Counter>,
    pub failures: Family<ErrorLabels, Counter>,
    pub duration: Histogram,
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self {
            runs: Family::default(),
            failures: Family::default(),
            duration: Histogram::new([0.01, 0.1, 0.25, 0.5, 1.0, 5.0, 15.0, 60.0].into_iter()),
        }
    }
}

impl ControllerMetrics {
    /// Register reconcile metrics to start tracking them.
    pub fn register(self, registry: &mut Registry) -> Self {
        registry.register_with_unit(
            "reconcile_duration",
            "reconcile duration",
            Unit::Seconds,
            self.duration.clone(),
        );
        registry.register(
            "reconcile_failures",
            "Number of reconciliation errors",
            self.failures.clone(),
        );
        registry.register(
            "reconcile_runs",
            "Number of reconciliations",
            self.runs.clone(),
        );
        self
    }

    pub fn count_failure<K>(&self, _k: &K, e: &Error)
    where
        K: ResourceExt<DynamicType = ()>,
    {
        self.failures
            .get_or_create(&ErrorLabels {
                resource: K::kind(&()).into_owned().to_lowercase(),
                error: e.metric_label(),
            })
            .inc();
    }

    pub fn count_and_measure<K>(&self, _k: &K) -> ReconcileMeasurer
    where
        K: ResourceExt<DynamicType = ()>,
    {
        self.runs
            .get_or_create(&ControllerLabels {
                resource: K::kind(&()).into_owned().to_lowercase(),
            })
            .inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.duration.clone(),
        }
    }
}

pub struct ReconcileMeasurer {
    start: Instant,
    metric: Histogram,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        self.metric.observe(self.start.elapsed().as_secs_f64());
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ControllerLabels {
    pub resource: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub resource: String,
    pub error: String,
}
