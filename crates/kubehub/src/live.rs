//! kube-rs backed implementations of the cluster seam.

use std::fmt::Debug;
use std::marker::PhantomData;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::{Api, DeleteParams, ListParams, LogParams, PostParams},
    runtime::{watcher, WatchStreamExt},
    Client, Resource,
};
use metrics::counter;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::{ClusterError, EventStream, ObjectApi, PodLogs, Selector, WatchApi, WatchEvent};

/// Typed, namespaced access to one kind through `kube::Api`.
pub struct KubeApi<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeApi<K> {
    pub fn new(client: Client) -> Self { Self { client, _kind: PhantomData } }
}

impl<K> Clone for KubeApi<K> {
    fn clone(&self) -> Self { Self::new(self.client.clone()) }
}

fn list_params(selector: &Selector) -> ListParams {
    let mut lp = ListParams::default();
    if let Some(l) = selector.labels.as_deref() { lp = lp.labels(l); }
    if let Some(f) = selector.fields.as_deref() { lp = lp.fields(f); }
    lp
}

fn kind_of<K: Resource<DynamicType = ()>>() -> String { K::kind(&()).to_string() }

impl<K> KubeApi<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    fn api(&self, namespace: &str) -> Api<K> { Api::namespaced(self.client.clone(), namespace) }
}

#[async_trait::async_trait]
impl<K> ObjectApi<K> for KubeApi<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn create(&self, namespace: &str, obj: &K) -> Result<K, ClusterError> {
        let name = obj.meta().name.clone().unwrap_or_default();
        counter!("kube_calls", 1u64, "verb" => "create");
        debug!(kind = %kind_of::<K>(), ns = %namespace, name = %name, "create");
        self.api(namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| ClusterError::from_kube(e, &kind_of::<K>(), &name))
    }

    async fn replace(&self, namespace: &str, name: &str, obj: &K) -> Result<K, ClusterError> {
        counter!("kube_calls", 1u64, "verb" => "replace");
        debug!(kind = %kind_of::<K>(), ns = %namespace, name = %name, "replace");
        self.api(namespace)
            .replace(name, &PostParams::default(), obj)
            .await
            .map_err(|e| ClusterError::from_kube(e, &kind_of::<K>(), name))
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, ClusterError> {
        counter!("kube_calls", 1u64, "verb" => "get");
        self.api(namespace).get_opt(name).await.map_err(|e| ClusterError::from_kube(e, &kind_of::<K>(), name))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<bool, ClusterError> {
        counter!("kube_calls", 1u64, "verb" => "delete");
        debug!(kind = %kind_of::<K>(), ns = %namespace, name = %name, "delete");
        match self.api(namespace).delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(ClusterError::from_kube(e, &kind_of::<K>(), name)),
        }
    }

    async fn list(&self, namespace: &str, selector: &Selector) -> Result<Vec<K>, ClusterError> {
        counter!("kube_calls", 1u64, "verb" => "list");
        let list = self.api(namespace).list(&list_params(selector)).await.map_err(|e| ClusterError::from_kube(e, &kind_of::<K>(), ""))?;
        Ok(list.items)
    }

    async fn list_all(&self, selector: &Selector) -> Result<Vec<K>, ClusterError> {
        counter!("kube_calls", 1u64, "verb" => "list");
        let api: Api<K> = Api::all(self.client.clone());
        let list = api.list(&list_params(selector)).await.map_err(|e| ClusterError::from_kube(e, &kind_of::<K>(), ""))?;
        Ok(list.items)
    }
}

#[async_trait::async_trait]
impl<K> WatchApi<K> for KubeApi<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    async fn watch(&self, namespace: &str, selector: &Selector) -> Result<EventStream<K>, ClusterError> {
        let mut cfg = watcher::Config::default();
        if let Some(l) = selector.labels.as_deref() { cfg = cfg.labels(l); }
        if let Some(f) = selector.fields.as_deref() { cfg = cfg.fields(f); }
        debug!(kind = %kind_of::<K>(), ns = %namespace, labels = ?selector.labels, fields = ?selector.fields, "watch started");
        let stream = watcher::watcher(self.api(namespace), cfg)
            .default_backoff()
            .flat_map(|res| {
                let items: Vec<Result<WatchEvent<K>, ClusterError>> = match res {
                    Ok(watcher::Event::Applied(o)) => vec![Ok(WatchEvent::Applied(o))],
                    Ok(watcher::Event::Deleted(o)) => vec![Ok(WatchEvent::Deleted(o))],
                    // A relist replays current state as applied events.
                    Ok(watcher::Event::Restarted(list)) => list.into_iter().map(|o| Ok(WatchEvent::Applied(o))).collect(),
                    Err(e) => vec![Err(ClusterError::Transport(e.to_string()))],
                };
                futures::stream::iter(items)
            })
            .boxed();
        Ok(stream)
    }
}

/// Pod log tails over the `pods/log` subresource.
#[derive(Clone)]
pub struct KubeLogs {
    client: Client,
}

impl KubeLogs {
    pub fn new(client: Client) -> Self { Self { client } }
}

#[async_trait::async_trait]
impl PodLogs for KubeLogs {
    async fn tail(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        lines: i64,
        max_bytes: i64,
    ) -> Result<String, ClusterError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = LogParams {
            container: Some(container.to_string()),
            tail_lines: Some(lines),
            limit_bytes: Some(max_bytes),
            ..Default::default()
        };
        api.logs(pod, &lp).await.map_err(|e| ClusterError::from_kube(e, "Pod", pod))
    }
}
