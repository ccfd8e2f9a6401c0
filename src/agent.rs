use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Result;
use crate::config::AgentArgs;
use crate::controller::Reconciler;
use crate::frr::vtysh::Vtysh;
use crate::http::HealthState;
use crate::kubernetes::{self, state::ClusterState};
use crate::metrics::{ControllerMetrics, REGISTRY};

pub async fn start(
    args: AgentArgs,
    ready: CancellationToken,
    health: Arc<HealthState>,
    cancel: CancellationToken,
) -> Result<()> {
    // Fail before any watch starts if the driver is misconfigured.
    let speaker = Arc::new(Vtysh::new(
        &args.vtysh_path,
        args.bgp_asn,
        args.frr_ensure_static,
    )?);

    let client = kubernetes::client(args.kubeconfig.as_deref()).await?;

    // Capacity 1: the channel is the reconcile dirty bit, excess events
    // coalesce into the next pass.
    let (trigger, dirty) = mpsc::channel(1);
    let cluster = ClusterState::try_new(client, &args.node_name, args.resync_seconds, trigger).await?;
    info!("watch caches synced for node {}", args.node_name);

    let metrics = ControllerMetrics::default().register(&mut REGISTRY.write().unwrap());
    let reconciler = Reconciler::new(args.node_name, speaker, metrics, health);
    reconciler
        .run(
            &cluster,
            dirty,
            Duration::from_secs(args.loop_interval_seconds),
            ready,
            cancel,
        )
        .await;
    Ok(())
}
