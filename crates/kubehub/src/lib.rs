//! Keel kubehub: the cluster seam. Per-kind object, watch and log primitives,
//! a kube-rs backed implementation (`live`) and in-memory fakes (`memory`).

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OnceCell;

pub mod live;
pub mod memory;

pub use live::{KubeApi, KubeLogs};

/// Failures talking to the cluster, classified by what callers branch on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },
    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },
    #[error("conflict on {kind} {name}: {message}")]
    Conflict { kind: String, name: String, message: String },
    #[error("api error {code} ({reason}): {message}")]
    Api { code: u16, reason: String, message: String },
    #[error("transport: {0}")]
    Transport(String),
}

impl ClusterError {
    pub fn from_kube(err: kube::Error, kind: &str, name: &str) -> Self {
        match err {
            kube::Error::Api(ae) => match (ae.code, ae.reason.as_str()) {
                (404, _) => ClusterError::NotFound { kind: kind.to_string(), name: name.to_string() },
                (409, "AlreadyExists") => ClusterError::AlreadyExists { kind: kind.to_string(), name: name.to_string() },
                (409, _) => ClusterError::Conflict { kind: kind.to_string(), name: name.to_string(), message: ae.message },
                (code, reason) => ClusterError::Api { code, reason: reason.to_string(), message: ae.message },
            },
            other => ClusterError::Transport(other.to_string()),
        }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, ClusterError::NotFound { .. }) }
    pub fn is_already_exists(&self) -> bool { matches!(self, ClusterError::AlreadyExists { .. }) }
}

/// Label and field selectors for list/watch.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Selector {
    pub labels: Option<String>,
    pub fields: Option<String>,
}

impl Selector {
    pub fn labels(expr: impl Into<String>) -> Self { Self { labels: Some(expr.into()), fields: None } }
    pub fn fields(expr: impl Into<String>) -> Self { Self { labels: None, fields: Some(expr.into()) } }

    /// Equality-only evaluation (`k=v,k2=v2`), which is all Keel issues.
    pub fn matches(&self, name: &str, labels: Option<&BTreeMap<String, String>>) -> bool {
        let labels_ok = self.labels.as_deref().map_or(true, |expr| {
            pairs(expr).all(|(k, v)| labels.and_then(|l| l.get(k)).map(|x| x == v).unwrap_or(false))
        });
        let fields_ok = self.fields.as_deref().map_or(true, |expr| {
            pairs(expr).all(|(k, v)| k != "metadata.name" || v == name)
        });
        labels_ok && fields_ok
    }
}

fn pairs(expr: &str) -> impl Iterator<Item = (&str, &str)> {
    expr.split(',').filter(|p| !p.trim().is_empty()).map(|p| match p.split_once('=') {
        Some((k, v)) => (k.trim(), v.trim()),
        None => (p.trim(), ""),
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<K> {
    Applied(K),
    Deleted(K),
}

pub type EventStream<K> = BoxStream<'static, Result<WatchEvent<K>, ClusterError>>;

/// Namespaced create/replace/get/delete/list for one object kind.
#[async_trait::async_trait]
pub trait ObjectApi<K: Send + Sync + 'static>: Send + Sync {
    /// Fails with `AlreadyExists` when the name is taken.
    async fn create(&self, namespace: &str, obj: &K) -> Result<K, ClusterError>;
    async fn replace(&self, namespace: &str, name: &str, obj: &K) -> Result<K, ClusterError>;
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, ClusterError>;
    /// `Ok(false)` when the object was already absent.
    async fn delete(&self, namespace: &str, name: &str) -> Result<bool, ClusterError>;
    async fn list(&self, namespace: &str, selector: &Selector) -> Result<Vec<K>, ClusterError>;
    /// Every namespace at once; items carry `metadata.namespace`.
    async fn list_all(&self, selector: &Selector) -> Result<Vec<K>, ClusterError>;
}

#[async_trait::async_trait]
pub trait WatchApi<K: Send + Sync + 'static>: Send + Sync {
    /// Dropping the returned stream ends the subscription.
    async fn watch(&self, namespace: &str, selector: &Selector) -> Result<EventStream<K>, ClusterError>;
}

#[async_trait::async_trait]
pub trait PodLogs: Send + Sync {
    async fn tail(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        lines: i64,
        max_bytes: i64,
    ) -> Result<String, ClusterError>;
}

/// Every cluster capability the engine consumes, one handle per kind.
#[derive(Clone)]
pub struct Cluster {
    pub deployments: Arc<dyn ObjectApi<Deployment>>,
    pub stateful_sets: Arc<dyn ObjectApi<StatefulSet>>,
    pub services: Arc<dyn ObjectApi<Service>>,
    pub ingresses: Arc<dyn ObjectApi<Ingress>>,
    pub autoscalers: Arc<dyn ObjectApi<HorizontalPodAutoscaler>>,
    pub claims: Arc<dyn ObjectApi<PersistentVolumeClaim>>,
    pub pods: Arc<dyn ObjectApi<Pod>>,
    pub jobs: Arc<dyn ObjectApi<Job>>,
    pub job_events: Arc<dyn WatchApi<Job>>,
    pub pod_events: Arc<dyn WatchApi<Pod>>,
    pub logs: Arc<dyn PodLogs>,
}

impl Cluster {
    pub fn from_client(client: Client) -> Self {
        let jobs = Arc::new(KubeApi::<Job>::new(client.clone()));
        let pods = Arc::new(KubeApi::<Pod>::new(client.clone()));
        Self {
            deployments: Arc::new(KubeApi::<Deployment>::new(client.clone())),
            stateful_sets: Arc::new(KubeApi::<StatefulSet>::new(client.clone())),
            services: Arc::new(KubeApi::<Service>::new(client.clone())),
            ingresses: Arc::new(KubeApi::<Ingress>::new(client.clone())),
            autoscalers: Arc::new(KubeApi::<HorizontalPodAutoscaler>::new(client.clone())),
            claims: Arc::new(KubeApi::<PersistentVolumeClaim>::new(client.clone())),
            pods: pods.clone(),
            jobs: jobs.clone(),
            job_events: jobs,
            pod_events: pods,
            logs: Arc::new(KubeLogs::new(client)),
        }
    }

    pub async fn connect() -> anyhow::Result<Self> {
        Ok(Self::from_client(get_kube_client().await?))
    }
}

static CLIENT: OnceCell<Client> = OnceCell::const_new();

/// Process-wide client built from the ambient kubeconfig / in-cluster env.
pub async fn get_kube_client() -> anyhow::Result<Client> {
    let client = CLIENT.get_or_try_init(|| async { Client::try_default().await }).await?;
    Ok(client.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_matches_labels_and_name() {
        let mut labels = BTreeMap::new();
        labels.insert("job-name".to_string(), "build-a".to_string());
        labels.insert("app".to_string(), "x".to_string());
        assert!(Selector::labels("job-name=build-a").matches("pod-1", Some(&labels)));
        assert!(!Selector::labels("job-name=build-b").matches("pod-1", Some(&labels)));
        assert!(!Selector::labels("job-name=build-a").matches("pod-1", None));
        assert!(Selector::fields("metadata.name=build-a").matches("build-a", None));
        assert!(!Selector::fields("metadata.name=build-a").matches("build-b", None));
        assert!(Selector::default().matches("anything", None));
    }
}
