pub mod state;

use std::path::Path;

use kube::config::{KubeConfigOptions, Kubeconfig};
use tracing::info;

use crate::Result;

pub(crate) const SERVICE_OWNER_LABEL: &str = "kubernetes.io/service-name";

/// Builds a client from an explicit kubeconfig, or infers the in-cluster
/// configuration (falling back to the default kubeconfig) when none is given.
pub async fn client(kubeconfig: Option<&Path>) -> Result<kube::Client> {
    let config = match kubeconfig {
        Some(path) => {
            info!("using kubeconfig from {}", path.display());
            let kubeconfig = Kubeconfig::read_from(path)?;
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?
        }
        None => kube::Config::infer().await?,
    };
    Ok(kube::Client::try_from(config)?)
}
