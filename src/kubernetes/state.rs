use std::fmt::Debug;
use std::hash::Hash;
use std::pin::pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Service};
use k8s_openapi::api::discovery::v1::EndpointSlice;
use kube::runtime::reflector::{ObjectRef, ReflectHandle, Store};
use kube::runtime::{WatchStreamExt, reflector, watcher};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc::Sender;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{error, info, trace};

use crate::{Error, Result};

/// The API server caps a single watch request at roughly this many seconds;
/// longer resync settings degrade to the cap.
const MAX_WATCH_TIMEOUT: u32 = 290;

/// Read access to a watcher-backed cache, abstracted so reconcile logic can
/// be driven from in-memory fixtures in tests.
pub trait KubeStore<K: k8s_openapi::Metadata + kube::Resource> {
    fn get_store_state(&self) -> Vec<Arc<K>>;
    fn get_resource(&self, key: &ObjectRef<K>) -> Option<Arc<K>>;
}

impl<K> KubeStore<K> for Store<K>
where
    K: k8s_openapi::Metadata + kube::Resource + Clone,
    K::DynamicType: Hash + Eq + Clone,
{
    fn get_store_state(&self) -> Vec<Arc<K>> {
        self.state()
    }

    fn get_resource(&self, key: &ObjectRef<K>) -> Option<Arc<K>> {
        self.get(key)
    }
}

/// Shared caches over the three watched resources. Every delivered event
/// pokes the reconcile trigger; the node watch is scoped to the local node.
pub struct ClusterState {
    pub services: Store<Service>,
    pub endpoint_slices: Store<EndpointSlice>,
    pub nodes: Store<Node>,
}

impl ClusterState {
    pub async fn try_new(
        client: kube::Client,
        node_name: &str,
        resync_seconds: u32,
        trigger: Sender<()>,
    ) -> Result<Self> {
        let config = watcher::Config::default().timeout(resync_seconds.min(MAX_WATCH_TIMEOUT));

        let (services, service_events) =
            watch(Api::<Service>::all(client.clone()), config.clone()).await?;
        let (endpoint_slices, slice_events) =
            watch(Api::<EndpointSlice>::all(client.clone()), config.clone()).await?;
        let node_config = config.fields(&format!("metadata.name={node_name}"));
        let (nodes, node_events) = watch(Api::<Node>::all(client), node_config).await?;
        info!("started service, endpoint slice, and node watches");

        tokio::spawn(forward_events(service_events, trigger.clone()));
        tokio::spawn(forward_events(slice_events, trigger.clone()));
        tokio::spawn(forward_events(node_events, trigger));

        Ok(Self {
            services,
            endpoint_slices,
            nodes,
        })
    }
}

async fn watch<K>(api: Api<K>, config: watcher::Config) -> Result<(Store<K>, ReflectHandle<K>)>
where
    K: Resource + Send + Clone + Debug + DeserializeOwned + Sync + 'static,
    <K as Resource>::DynamicType: Default + Eq + Send + DeserializeOwned + Hash + Clone,
{
    let (store, writer) = reflector::store_shared(1000);
    let subscriber: ReflectHandle<K> = writer
        .subscribe()
        .ok_or_else(|| Error::StoreCreation("failed to create subscriber".into()))?;

    let stream = watcher(api, config)
        .default_backoff()
        .reflect_shared(writer)
        .for_each(|res| async move {
            match res {
                Ok(ev) => trace!("received event: {:?}", ev),
                Err(e) => error!(%e, "unexpected error with watch stream"),
            }
        });

    tokio::spawn(stream);
    store
        .wait_until_ready()
        .await
        .map_err(|e| Error::StoreCreation(e.to_string()))?;
    Ok((store, subscriber))
}

/// Collapses watcher events into the reconcile dirty bit. A full channel
/// means a reconcile is already pending and will observe the newer cache.
async fn forward_events<K>(subscriber: ReflectHandle<K>, trigger: Sender<()>)
where
    K: k8s_openapi::Metadata + Resource + Send + Clone + Debug + DeserializeOwned + Sync + 'static,
    <K as Resource>::DynamicType: Default + Eq + Send + DeserializeOwned + Hash + Clone,
{
    let mut stream = pin!(subscriber);
    while let Some(_resource) = stream.next().await {
        match trigger.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Closed(())) => break,
        }
    }
}
