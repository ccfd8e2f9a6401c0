use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::ResourceExt;
use kube::core::{Expression, Selector, SelectorExt};
use kube::runtime::reflector::ObjectRef;

use crate::controller::decision::{self, Policy};
use crate::frr::Prefix;
use crate::kubernetes::SERVICE_OWNER_LABEL;
use crate::kubernetes::state::KubeStore;
use crate::metrics::{ControllerMetrics, EndpointLabels};

/// Service that justified a prefix. There is no per-service ownership of a
/// prefix; the last writer wins and the record only feeds metric labels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VipService {
    pub namespace: String,
    pub name: String,
}

/// Computes the prefixes this node should currently announce. An absent
/// local node record yields the empty set: unknown node state is safer as
/// "announce nothing".
pub fn desired_vips(
    node_name: &str,
    services: &impl KubeStore<Service>,
    endpoint_slices: &impl KubeStore<EndpointSlice>,
    nodes: &impl KubeStore<Node>,
    metrics: &ControllerMetrics,
) -> BTreeMap<Prefix, VipService> {
    let mut desired = BTreeMap::new();

    let Some(node) = nodes.get_resource(&ObjectRef::new(node_name)) else {
        return desired;
    };
    let schedulable = node_schedulable(&node);
    let draining = node_draining(&node);

    for svc in services.get_store_state() {
        let name = svc.name_any();
        let Some(namespace) = svc.namespace() else {
            continue;
        };

        let slices = slices_for_service(endpoint_slices, &namespace, &name);
        let ready = decision::local_ready_endpoints(node_name, &slices);
        metrics
            .endpoints_ready
            .get_or_create(&EndpointLabels {
                service: name.clone(),
                namespace: namespace.clone(),
                node: node_name.to_string(),
            })
            .set(ready as i64);

        let gate = decision::announce_gate(&svc);
        if !decision::should_advertise(
            node_name,
            &svc,
            &slices,
            Policy::Auto,
            schedulable,
            draining,
            gate,
        ) {
            continue;
        }

        let (v4, v6) = decision::extract_vips(&svc);
        for ip in v4.into_iter().chain(v6) {
            desired.insert(
                Prefix::host(ip),
                VipService {
                    namespace: namespace.clone(),
                    name: name.clone(),
                },
            );
        }
    }

    desired
}

fn node_schedulable(node: &Node) -> bool {
    node.spec.as_ref().and_then(|s| s.unschedulable) != Some(true)
}

fn node_draining(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "NetworkUnavailable" && c.status == "True")
        })
}

fn slices_for_service(
    store: &impl KubeStore<EndpointSlice>,
    namespace: &str,
    name: &str,
) -> Vec<Arc<EndpointSlice>> {
    let selector: Selector = Expression::Equal(SERVICE_OWNER_LABEL.into(), name.to_owned()).into();
    store
        .get_store_state()
        .into_iter()
        .filter(|slice| {
            slice.namespace().as_deref() == Some(namespace) && selector.matches(slice.labels())
        })
        .collect()
}
