pub mod decision;
pub mod desired;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use tokio::sync::mpsc::Receiver;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::frr::{Prefix, Speaker};
use crate::http::HealthState;
use crate::kubernetes::state::{ClusterState, KubeStore};
use crate::metrics::{ControllerMetrics, VipLabels};
use desired::{VipService, desired_vips};

/// Bound on the shutdown withdraw sweep; the operator needs the process to
/// exit even when the speaker is wedged.
const TEARDOWN_BUDGET: Duration = Duration::from_secs(10);

/// Converges the local speaker onto the desired VIP set. `announced` is
/// optimistic bookkeeping: a prefix whose announce failed is absent, a
/// prefix whose withdraw failed stays until a later reconcile retries it.
pub struct Reconciler {
    node_name: String,
    speaker: Arc<dyn Speaker>,
    metrics: ControllerMetrics,
    health: Arc<HealthState>,
    state: Mutex<VipState>,
}

#[derive(Default)]
struct VipState {
    desired: BTreeMap<Prefix, VipService>,
    announced: BTreeMap<Prefix, VipService>,
}

impl Reconciler {
    pub fn new(
        node_name: String,
        speaker: Arc<dyn Speaker>,
        metrics: ControllerMetrics,
        health: Arc<HealthState>,
    ) -> Self {
        Self {
            node_name,
            speaker,
            metrics,
            health,
            state: Mutex::new(VipState::default()),
        }
    }

    /// One pass of desired-set computation and speaker convergence. Failures
    /// are per-prefix; none abort the pass. Callers serialize invocations.
    pub async fn reconcile_once(
        &self,
        services: &impl KubeStore<Service>,
        endpoint_slices: &impl KubeStore<EndpointSlice>,
        nodes: &impl KubeStore<Node>,
    ) {
        let new_desired = desired_vips(
            &self.node_name,
            services,
            endpoint_slices,
            nodes,
            &self.metrics,
        );

        // The lock covers snapshot copy-in and copy-out only, never the
        // speaker calls below.
        let (desired, mut announced) = {
            let mut state = self.state.lock().unwrap();
            state.desired = new_desired;
            (state.desired.clone(), state.announced.clone())
        };

        // Adds before removes: while a VIP moves between nodes a duplicate
        // announce is harmless, a gap blackholes.
        for (prefix, svc) in &desired {
            if announced.contains_key(prefix) {
                continue;
            }
            match self.speaker.announce(prefix).await {
                Ok(()) => {
                    info!("announced {prefix} for {}/{}", svc.namespace, svc.name);
                    self.metrics
                        .vip_advertised
                        .get_or_create(&self.vip_labels(prefix, svc))
                        .inc();
                    announced.insert(*prefix, svc.clone());
                }
                Err(e) => {
                    self.metrics.reconcile_errors.inc();
                    warn!(%e, "failed to announce {prefix}");
                }
            }
        }

        let stale: Vec<(Prefix, VipService)> = announced
            .iter()
            .filter(|(prefix, _)| !desired.contains_key(*prefix))
            .map(|(prefix, svc)| (*prefix, svc.clone()))
            .collect();
        for (prefix, svc) in stale {
            match self.speaker.withdraw(&prefix).await {
                Ok(()) => {
                    info!("withdrew {prefix} for {}/{}", svc.namespace, svc.name);
                    self.metrics
                        .vip_withdrawn
                        .get_or_create(&self.vip_labels(&prefix, &svc))
                        .inc();
                    announced.remove(&prefix);
                }
                Err(e) => {
                    // Stays in the snapshot so the next reconcile retries.
                    self.metrics.reconcile_errors.inc();
                    warn!(%e, "failed to withdraw {prefix}");
                }
            }
        }

        self.state.lock().unwrap().announced = announced;
        self.health.mark_reconciled();
    }

    /// Withdraws every announced prefix regardless of desired state. Used
    /// only at shutdown; failures are logged and do not block exit.
    pub async fn withdraw_all(&self) {
        let announced = self.state.lock().unwrap().announced.clone();
        for (prefix, svc) in announced {
            match self.speaker.withdraw(&prefix).await {
                Ok(()) => {
                    info!("withdrew {prefix} on shutdown");
                    self.metrics
                        .vip_withdrawn
                        .get_or_create(&self.vip_labels(&prefix, &svc))
                        .inc();
                    self.state.lock().unwrap().announced.remove(&prefix);
                }
                Err(e) => warn!(%e, "failed to withdraw {prefix} on shutdown"),
            }
        }
    }

    /// Serialized reconcile loop: runs on every trigger poke and on the
    /// periodic tick, then tears down announcements once cancelled. An
    /// in-flight reconcile always completes before the loop observes
    /// cancellation.
    pub async fn run(
        &self,
        cluster: &ClusterState,
        mut dirty: Receiver<()>,
        interval: Duration,
        ready: CancellationToken,
        cancel: CancellationToken,
    ) {
        let mut tick = tokio::time::interval(interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = dirty.recv(), if events_open => {
                    if event.is_none() {
                        warn!("watch event channel closed, continuing on ticks only");
                        events_open = false;
                        continue;
                    }
                }
                _ = tick.tick() => {},
            }
            self.reconcile_once(&cluster.services, &cluster.endpoint_slices, &cluster.nodes)
                .await;
            ready.cancel();
        }

        info!("reconcile loop stopped, withdrawing announced prefixes");
        if tokio::time::timeout(TEARDOWN_BUDGET, self.withdraw_all())
            .await
            .is_err()
        {
            warn!("shutdown withdraw exceeded {TEARDOWN_BUDGET:?}");
        }
    }

    fn vip_labels(&self, prefix: &Prefix, svc: &VipService) -> VipLabels {
        VipLabels {
            service: svc.name.clone(),
            namespace: svc.namespace.clone(),
            ipfamily: prefix.family().as_str().to_string(),
            node: self.node_name.clone(),
        }
    }
}

#[cfg(test)]
mod test {
    use std::collections::{BTreeMap, BTreeSet, HashMap};

    use async_trait::async_trait;
    use k8s_openapi::api::core::v1::{
        LoadBalancerIngress, LoadBalancerStatus, NodeSpec, ServiceSpec, ServiceStatus,
    };
    use k8s_openapi::api::discovery::v1::{Endpoint, EndpointConditions};
    use kube::api::ObjectMeta;
    use kube::runtime::reflector::ObjectRef;

    use crate::Error;
    use crate::kubernetes::SERVICE_OWNER_LABEL;

    use super::*;

    impl<K> KubeStore<K> for HashMap<ObjectRef<K>, Arc<K>>
    where
        K: k8s_openapi::Metadata + kube::Resource + Clone,
        K::DynamicType: std::hash::Hash + std::cmp::Eq + Clone,
    {
        fn get_store_state(&self) -> Vec<Arc<K>> {
            self.values().map(|k| k.to_owned()).collect()
        }

        fn get_resource(&self, key: &ObjectRef<K>) -> Option<Arc<K>> {
            self.get(key).map(|r| r.to_owned())
        }
    }

    #[derive(Default)]
    struct FakeSpeaker {
        calls: Mutex<Vec<String>>,
        fail_announce: Mutex<BTreeSet<Prefix>>,
        fail_withdraw: Mutex<BTreeSet<Prefix>>,
    }

    impl FakeSpeaker {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn fail(status: i32) -> Error {
            Error::VtyshFailed {
                status,
                stdout: String::new(),
                stderr: "simulated".into(),
            }
        }
    }

    #[async_trait]
    impl Speaker for FakeSpeaker {
        async fn announce(&self, prefix: &Prefix) -> crate::Result<()> {
            self.calls.lock().unwrap().push(format!("announce {prefix}"));
            if self.fail_announce.lock().unwrap().contains(prefix) {
                return Err(Self::fail(1));
            }
            Ok(())
        }

        async fn withdraw(&self, prefix: &Prefix) -> crate::Result<()> {
            self.calls.lock().unwrap().push(format!("withdraw {prefix}"));
            if self.fail_withdraw.lock().unwrap().contains(prefix) {
                return Err(Self::fail(1));
            }
            Ok(())
        }

        async fn list_announced(&self) -> crate::Result<BTreeSet<Prefix>> {
            Ok(BTreeSet::new())
        }
    }

    struct Fixture {
        speaker: Arc<FakeSpeaker>,
        reconciler: Reconciler,
        services: HashMap<ObjectRef<Service>, Arc<Service>>,
        slices: HashMap<ObjectRef<EndpointSlice>, Arc<EndpointSlice>>,
        nodes: HashMap<ObjectRef<Node>, Arc<Node>>,
    }

    impl Fixture {
        fn new() -> Self {
            let speaker = Arc::new(FakeSpeaker::default());
            let reconciler = Reconciler::new(
                "node-a".into(),
                speaker.clone(),
                ControllerMetrics::default(),
                Arc::new(HealthState::default()),
            );
            let mut fixture = Self {
                speaker,
                reconciler,
                services: HashMap::new(),
                slices: HashMap::new(),
                nodes: HashMap::new(),
            };
            fixture.set_node_schedulable(true);
            fixture
        }

        fn set_node_schedulable(&mut self, schedulable: bool) {
            self.nodes.insert(
                ObjectRef::new("node-a"),
                Arc::new(Node {
                    metadata: ObjectMeta {
                        name: Some("node-a".into()),
                        ..Default::default()
                    },
                    spec: Some(NodeSpec {
                        unschedulable: Some(!schedulable),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
            );
        }

        fn add_lb_service(&mut self, namespace: &str, name: &str, ip: &str, traffic_policy: &str) {
            self.services.insert(
                ObjectRef::new(name).within(namespace),
                Arc::new(Service {
                    metadata: ObjectMeta {
                        name: Some(name.into()),
                        namespace: Some(namespace.into()),
                        ..Default::default()
                    },
                    spec: Some(ServiceSpec {
                        type_: Some("LoadBalancer".into()),
                        external_traffic_policy: Some(traffic_policy.into()),
                        ..Default::default()
                    }),
                    status: Some(ServiceStatus {
                        load_balancer: Some(LoadBalancerStatus {
                            ingress: Some(vec![LoadBalancerIngress {
                                ip: Some(ip.into()),
                                ..Default::default()
                            }]),
                        }),
                        ..Default::default()
                    }),
                }),
            );
        }

        fn set_slice(&mut self, namespace: &str, service: &str, node_name: &str, ready: bool) {
            let slice_name = format!("{service}-abc12");
            let mut labels = BTreeMap::new();
            labels.insert(SERVICE_OWNER_LABEL.to_string(), service.to_string());
            self.slices.insert(
                ObjectRef::new(&slice_name).within(namespace),
                Arc::new(EndpointSlice {
                    address_type: "IPv4".into(),
                    endpoints: vec![Endpoint {
                        addresses: vec!["10.244.0.10".into()],
                        node_name: Some(node_name.into()),
                        conditions: Some(EndpointConditions {
                            ready: Some(ready),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    metadata: ObjectMeta {
                        labels: Some(labels),
                        name: Some(slice_name.clone()),
                        namespace: Some(namespace.into()),
                        ..Default::default()
                    },
                    ports: None,
                }),
            );
        }

        async fn reconcile(&self) {
            self.reconciler
                .reconcile_once(&self.services, &self.slices, &self.nodes)
                .await;
        }

        fn announced(&self) -> BTreeSet<Prefix> {
            self.reconciler
                .state
                .lock()
                .unwrap()
                .announced
                .keys()
                .copied()
                .collect()
        }
    }

    fn prefix(s: &str) -> Prefix {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_cluster_policy_announces_ingress_vip() {
        let mut fixture = Fixture::new();
        fixture.add_lb_service("ns", "foo", "203.0.113.5", "Cluster");

        fixture.reconcile().await;

        assert_eq!(fixture.speaker.calls(), vec!["announce 203.0.113.5/32"]);
        assert_eq!(fixture.announced(), BTreeSet::from([prefix("203.0.113.5/32")]));
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let mut fixture = Fixture::new();
        fixture.add_lb_service("ns", "foo", "203.0.113.5", "Cluster");

        fixture.reconcile().await;
        let announced = fixture.announced();
        let calls = fixture.speaker.calls();

        fixture.reconcile().await;
        assert_eq!(fixture.speaker.calls(), calls);
        assert_eq!(fixture.announced(), announced);
    }

    #[tokio::test]
    async fn test_local_policy_endpoint_lifecycle() {
        let mut fixture = Fixture::new();
        fixture.add_lb_service("ns", "bar", "10.0.0.7", "Local");
        fixture.set_slice("ns", "bar", "node-b", true);

        // No local ready endpoint: nothing announced.
        fixture.reconcile().await;
        assert!(fixture.speaker.calls().is_empty());
        assert!(fixture.announced().is_empty());

        // A local endpoint becomes ready.
        fixture.set_slice("ns", "bar", "node-a", true);
        fixture.reconcile().await;
        assert_eq!(fixture.speaker.calls(), vec!["announce 10.0.0.7/32"]);
        assert_eq!(fixture.announced(), BTreeSet::from([prefix("10.0.0.7/32")]));

        // The endpoint flips back to not ready.
        fixture.set_slice("ns", "bar", "node-a", false);
        fixture.reconcile().await;
        assert_eq!(
            fixture.speaker.calls(),
            vec!["announce 10.0.0.7/32", "withdraw 10.0.0.7/32"]
        );
        assert!(fixture.announced().is_empty());
    }

    #[tokio::test]
    async fn test_node_cordon_withdraws() {
        let mut fixture = Fixture::new();
        fixture.add_lb_service("ns", "foo", "203.0.113.5", "Cluster");

        fixture.reconcile().await;
        assert_eq!(fixture.announced(), BTreeSet::from([prefix("203.0.113.5/32")]));

        fixture.set_node_schedulable(false);
        fixture.reconcile().await;
        assert!(fixture.announced().is_empty());
        assert_eq!(
            fixture.speaker.calls(),
            vec!["announce 203.0.113.5/32", "withdraw 203.0.113.5/32"]
        );
    }

    #[tokio::test]
    async fn test_node_disappearing_withdraws_everything() {
        let mut fixture = Fixture::new();
        fixture.add_lb_service("ns", "foo", "203.0.113.5", "Cluster");

        fixture.reconcile().await;
        assert!(!fixture.announced().is_empty());

        fixture.nodes.clear();
        fixture.reconcile().await;
        assert!(fixture.announced().is_empty());
    }

    #[tokio::test]
    async fn test_ipv6_vip() {
        let mut fixture = Fixture::new();
        fixture.add_lb_service("ns", "v6", "2001:db8::1", "Cluster");

        fixture.reconcile().await;
        assert_eq!(fixture.speaker.calls(), vec!["announce 2001:db8::1/128"]);
        assert_eq!(
            fixture.announced(),
            BTreeSet::from([prefix("2001:db8::1/128")])
        );
    }

    #[tokio::test]
    async fn test_announce_failure_retries_next_reconcile() {
        let mut fixture = Fixture::new();
        fixture.add_lb_service("ns", "foo", "203.0.113.5", "Cluster");
        fixture
            .speaker
            .fail_announce
            .lock()
            .unwrap()
            .insert(prefix("203.0.113.5/32"));

        fixture.reconcile().await;
        assert!(fixture.announced().is_empty());
        assert_eq!(fixture.reconciler.metrics.reconcile_errors.get(), 1);

        fixture.speaker.fail_announce.lock().unwrap().clear();
        fixture.reconcile().await;
        assert_eq!(fixture.announced(), BTreeSet::from([prefix("203.0.113.5/32")]));
        assert_eq!(
            fixture.speaker.calls(),
            vec!["announce 203.0.113.5/32", "announce 203.0.113.5/32"]
        );
    }

    #[tokio::test]
    async fn test_withdraw_failure_keeps_prefix_for_retry() {
        let mut fixture = Fixture::new();
        fixture.add_lb_service("ns", "foo", "203.0.113.5", "Cluster");
        fixture.reconcile().await;

        fixture.services.clear();
        fixture
            .speaker
            .fail_withdraw
            .lock()
            .unwrap()
            .insert(prefix("203.0.113.5/32"));
        fixture.reconcile().await;
        assert_eq!(fixture.announced(), BTreeSet::from([prefix("203.0.113.5/32")]));
        assert_eq!(fixture.reconciler.metrics.reconcile_errors.get(), 1);

        fixture.speaker.fail_withdraw.lock().unwrap().clear();
        fixture.reconcile().await;
        assert!(fixture.announced().is_empty());
    }

    #[tokio::test]
    async fn test_announces_precede_withdraws() {
        let mut fixture = Fixture::new();
        fixture.add_lb_service("ns", "old", "203.0.113.5", "Cluster");
        fixture.reconcile().await;

        fixture.services.clear();
        fixture.add_lb_service("ns", "new", "198.51.100.9", "Cluster");
        fixture.reconcile().await;

        assert_eq!(
            fixture.speaker.calls(),
            vec![
                "announce 203.0.113.5/32",
                "announce 198.51.100.9/32",
                "withdraw 203.0.113.5/32",
            ]
        );
    }

    #[tokio::test]
    async fn test_withdraw_all_empties_announced() {
        let mut fixture = Fixture::new();
        fixture.add_lb_service("ns", "a", "203.0.113.5", "Cluster");
        fixture.add_lb_service("ns", "b", "198.51.100.9", "Cluster");
        fixture.reconcile().await;
        assert_eq!(fixture.announced().len(), 2);

        fixture.reconciler.withdraw_all().await;
        assert!(fixture.announced().is_empty());
        let withdraws = fixture
            .speaker
            .calls()
            .iter()
            .filter(|call| call.starts_with("withdraw"))
            .count();
        assert_eq!(withdraws, 2);
    }

    #[tokio::test]
    async fn test_withdraw_all_keeps_failures() {
        let mut fixture = Fixture::new();
        fixture.add_lb_service("ns", "a", "203.0.113.5", "Cluster");
        fixture.add_lb_service("ns", "b", "198.51.100.9", "Cluster");
        fixture.reconcile().await;

        fixture
            .speaker
            .fail_withdraw
            .lock()
            .unwrap()
            .insert(prefix("198.51.100.9/32"));
        fixture.reconciler.withdraw_all().await;
        assert_eq!(
            fixture.announced(),
            BTreeSet::from([prefix("198.51.100.9/32")])
        );
    }
}
