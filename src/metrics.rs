use std::sync::{LazyLock, RwLock};

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

pub static REGISTRY: LazyLock<RwLock<Registry>> =
    LazyLock::new(|| RwLock::new(Registry::with_prefix("cosmolet")));

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct VipLabels {
    pub service: String,
    pub namespace: String,
    pub ipfamily: String,
    pub node: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EndpointLabels {
    pub service: String,
    pub namespace: String,
    pub node: String,
}

#[derive(Clone, Default)]
pub struct ControllerMetrics {
    pub vip_advertised: Family<VipLabels, Counter>,
    pub vip_withdrawn: Family<VipLabels, Counter>,
    pub endpoints_ready: Family<EndpointLabels, Gauge>,
    pub reconcile_errors: Counter,
}

impl ControllerMetrics {
    /// Register controller metrics to start tracking them.
    pub fn register(self, r: &mut Registry) -> Self {
        r.register(
            "vip_advertised",
            "Number of VIP advertisements issued by this node",
            self.vip_advertised.clone(),
        );
        r.register(
            "vip_withdrawn",
            "Number of VIP withdrawals issued by this node",
            self.vip_withdrawn.clone(),
        );
        r.register(
            "endpoints_ready",
            "Ready endpoints for a service on this node",
            self.endpoints_ready.clone(),
        );
        r.register(
            "reconcile_errors",
            "Total number of reconcile errors",
            self.reconcile_errors.clone(),
        );
        self
    }
}
