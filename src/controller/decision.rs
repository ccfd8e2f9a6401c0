use std::net::IpAddr;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::ResourceExt;

/// Per-service gate: a value of `"false"` forces non-advertisement no matter
/// what the policy would otherwise decide.
pub const ANNOUNCE_ANNOTATION: &str = "cosmolet.platformbuilds.io/announce";

/// Advertisement policy. `Auto` defers to the service's external traffic
/// policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Policy {
    Auto,
    Local,
    Cluster,
}

/// Resolves the announce annotation into an operator opinion. Values other
/// than `"true"`/`"false"` carry no opinion.
pub fn announce_gate(svc: &Service) -> Option<bool> {
    let value = svc.annotations().get(ANNOUNCE_ANNOTATION)?;
    if value.eq_ignore_ascii_case("false") {
        Some(false)
    } else if value.eq_ignore_ascii_case("true") {
        Some(true)
    } else {
        None
    }
}

/// Collects the VIPs of a service across its load balancer ingress and
/// cluster IPs, partitioned by family, deduplicated, and sorted by their
/// canonical text.
pub fn extract_vips(svc: &Service) -> (Vec<IpAddr>, Vec<IpAddr>) {
    let mut ips: Vec<IpAddr> = Vec::new();

    let spec = svc.spec.as_ref();
    if spec.and_then(|s| s.type_.as_deref()) == Some("LoadBalancer")
        && let Some(ingress) = svc
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
    {
        for ing in ingress {
            if let Some(ip) = ing.ip.as_ref().and_then(|ip| ip.parse().ok()) {
                ips.push(ip);
            }
        }
    }

    let mut cluster_ips: Vec<&String> = Vec::new();
    if let Some(spec) = spec {
        if let Some(ip) = &spec.cluster_ip {
            cluster_ips.push(ip);
        }
        if let Some(more) = &spec.cluster_ips {
            cluster_ips.extend(more);
        }
    }
    for ip in cluster_ips {
        // Headless services carry the literal "None".
        if ip.is_empty() || ip.eq_ignore_ascii_case("none") {
            continue;
        }
        if let Ok(ip) = ip.parse() {
            ips.push(ip);
        }
    }

    let (v4, v6): (Vec<IpAddr>, Vec<IpAddr>) = ips.into_iter().partition(|ip| ip.is_ipv4());
    (uniq_sorted(v4), uniq_sorted(v6))
}

fn uniq_sorted(mut ips: Vec<IpAddr>) -> Vec<IpAddr> {
    ips.sort_by_key(|ip| ip.to_string());
    ips.dedup();
    ips
}

/// Counts endpoints on `node_name` whose ready condition is explicitly true.
/// An absent or unknown condition counts as not ready.
pub fn local_ready_endpoints(node_name: &str, slices: &[Arc<EndpointSlice>]) -> usize {
    slices
        .iter()
        .filter(|slice| matches!(slice.address_type.as_str(), "IPv4" | "IPv6"))
        .flat_map(|slice| slice.endpoints.iter())
        .filter(|ep| ep.node_name.as_deref() == Some(node_name))
        .filter(|ep| ep.conditions.as_ref().and_then(|c| c.ready) == Some(true))
        .count()
}

/// Decides node-local announcement for a service. A node must withdraw its
/// announcements for `Local` services the moment it has no ready local
/// backend, otherwise the fabric blackholes traffic for the VIP.
pub fn should_advertise(
    node_name: &str,
    svc: &Service,
    slices: &[Arc<EndpointSlice>],
    policy: Policy,
    node_schedulable: bool,
    node_draining: bool,
    gate: Option<bool>,
) -> bool {
    if gate == Some(false) {
        return false;
    }
    if !node_schedulable || node_draining {
        return false;
    }
    let service_type = svc.spec.as_ref().and_then(|s| s.type_.as_deref());
    if !matches!(service_type, Some("ClusterIP") | Some("LoadBalancer")) {
        return false;
    }

    let local = match policy {
        Policy::Auto => {
            svc.spec
                .as_ref()
                .and_then(|s| s.external_traffic_policy.as_deref())
                == Some("Local")
        }
        Policy::Local => true,
        Policy::Cluster => false,
    };
    if !local {
        return true;
    }
    local_ready_endpoints(node_name, slices) > 0
}
