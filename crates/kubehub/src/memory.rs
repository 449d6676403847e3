//! In-memory stand-ins for the cluster seam. They behave like the API server for
//! the subset Keel relies on (name conflicts, resourceVersion checks, selectors)
//! and record every call so tests can assert on exactly what was sent.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::Resource;
use tokio::sync::mpsc;

use crate::{Cluster, ClusterError, EventStream, ObjectApi, PodLogs, Selector, WatchApi, WatchEvent};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Create,
    Replace,
    Get,
    Delete,
    List,
}

impl Verb {
    pub fn is_mutating(&self) -> bool { matches!(self, Verb::Create | Verb::Replace | Verb::Delete) }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub verb: Verb,
    pub namespace: String,
    pub name: String,
}

struct Injected {
    verb: Verb,
    name: Option<String>,
    error: ClusterError,
}

/// A namespaced object store for one kind.
pub struct MemoryApi<K> {
    objects: Mutex<BTreeMap<(String, String), K>>,
    calls: Mutex<Vec<Call>>,
    failures: Mutex<Vec<Injected>>,
    revision: AtomicU64,
}

impl<K> Default for MemoryApi<K> {
    fn default() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
            revision: AtomicU64::new(1),
        }
    }
}

impl<K> MemoryApi<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self { Self::default() }

    /// Seed an object without recording a call.
    pub fn insert(&self, namespace: &str, mut obj: K) {
        let name = obj.meta().name.clone().unwrap_or_default();
        self.stamp(namespace, &mut obj, None);
        lock(&self.objects).insert((namespace.to_string(), name), obj);
    }

    pub fn object(&self, namespace: &str, name: &str) -> Option<K> {
        lock(&self.objects).get(&(namespace.to_string(), name.to_string())).cloned()
    }

    pub fn names(&self, namespace: &str) -> Vec<String> {
        lock(&self.objects).keys().filter(|(ns, _)| ns == namespace).map(|(_, n)| n.clone()).collect()
    }

    pub fn len(&self) -> usize { lock(&self.objects).len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn calls(&self) -> Vec<Call> { lock(&self.calls).clone() }

    pub fn calls_for(&self, verb: Verb) -> Vec<Call> {
        lock(&self.calls).iter().filter(|c| c.verb == verb).cloned().collect()
    }

    pub fn mutations(&self) -> usize { lock(&self.calls).iter().filter(|c| c.verb.is_mutating()).count() }

    pub fn reset_calls(&self) { lock(&self.calls).clear(); }

    /// Make every `verb` call on `name` (or on any name when `None`) fail with `error`.
    pub fn fail(&self, verb: Verb, name: Option<&str>, error: ClusterError) {
        lock(&self.failures).push(Injected { verb, name: name.map(|s| s.to_string()), error });
    }

    pub fn clear_failures(&self) { lock(&self.failures).clear(); }

    fn record(&self, verb: Verb, namespace: &str, name: &str) -> Result<(), ClusterError> {
        lock(&self.calls).push(Call { verb, namespace: namespace.to_string(), name: name.to_string() });
        let failures = lock(&self.failures);
        match failures.iter().find(|f| f.verb == verb && f.name.as_deref().map_or(true, |n| n == name)) {
            Some(f) => Err(f.error.clone()),
            None => Ok(()),
        }
    }

    fn stamp(&self, namespace: &str, obj: &mut K, uid: Option<String>) {
        let rv = self.revision.fetch_add(1, Ordering::SeqCst);
        let meta = obj.meta_mut();
        meta.namespace = Some(namespace.to_string());
        meta.resource_version = Some(rv.to_string());
        meta.uid = Some(uid.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()));
    }

    fn not_found(name: &str) -> ClusterError {
        ClusterError::NotFound { kind: K::kind(&()).to_string(), name: name.to_string() }
    }
}

#[async_trait::async_trait]
impl<K> ObjectApi<K> for MemoryApi<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async fn create(&self, namespace: &str, obj: &K) -> Result<K, ClusterError> {
        let name = obj.meta().name.clone().unwrap_or_default();
        self.record(Verb::Create, namespace, &name)?;
        let key = (namespace.to_string(), name.clone());
        let mut objects = lock(&self.objects);
        if objects.contains_key(&key) {
            return Err(ClusterError::AlreadyExists { kind: K::kind(&()).to_string(), name });
        }
        let mut stored = obj.clone();
        self.stamp(namespace, &mut stored, None);
        objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn replace(&self, namespace: &str, name: &str, obj: &K) -> Result<K, ClusterError> {
        self.record(Verb::Replace, namespace, name)?;
        let key = (namespace.to_string(), name.to_string());
        let mut objects = lock(&self.objects);
        let live = objects.get(&key).ok_or_else(|| Self::not_found(name))?;
        let live_rv = live.meta().resource_version.clone();
        if let Some(rv) = obj.meta().resource_version.as_deref() {
            if Some(rv) != live_rv.as_deref() {
                return Err(ClusterError::Conflict {
                    kind: K::kind(&()).to_string(),
                    name: name.to_string(),
                    message: format!("resourceVersion {} is stale (live {})", rv, live_rv.unwrap_or_default()),
                });
            }
        }
        let uid = live.meta().uid.clone();
        let mut stored = obj.clone();
        self.stamp(namespace, &mut stored, uid);
        objects.insert(key, stored.clone());
        Ok(stored)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Option<K>, ClusterError> {
        self.record(Verb::Get, namespace, name)?;
        Ok(self.object(namespace, name))
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<bool, ClusterError> {
        self.record(Verb::Delete, namespace, name)?;
        Ok(lock(&self.objects).remove(&(namespace.to_string(), name.to_string())).is_some())
    }

    async fn list(&self, namespace: &str, selector: &Selector) -> Result<Vec<K>, ClusterError> {
        self.record(Verb::List, namespace, "")?;
        let objects = lock(&self.objects);
        Ok(objects
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .filter(|((_, name), obj)| selector.matches(name, obj.meta().labels.as_ref()))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn list_all(&self, selector: &Selector) -> Result<Vec<K>, ClusterError> {
        self.record(Verb::List, "", "")?;
        let objects = lock(&self.objects);
        Ok(objects
            .iter()
            .filter(|((_, name), obj)| selector.matches(name, obj.meta().labels.as_ref()))
            .map(|(_, obj)| obj.clone())
            .collect())
    }
}

type EventSender<K> = mpsc::UnboundedSender<Result<WatchEvent<K>, ClusterError>>;
type EventReceiver<K> = mpsc::UnboundedReceiver<Result<WatchEvent<K>, ClusterError>>;
type ReceiverSlot<K> = Arc<Mutex<Option<EventReceiver<K>>>>;

/// Holds the receiver for one subscriber and hands it back when dropped.
struct Subscription<K> {
    rx: Option<EventReceiver<K>>,
    slot: ReceiverSlot<K>,
    active: Arc<AtomicUsize>,
}

impl<K> Drop for Subscription<K> {
    fn drop(&mut self) {
        if let Some(rx) = self.rx.take() { *lock(&self.slot) = Some(rx); }
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An event feed with one subscriber at a time. Events pushed while nobody
/// listens are buffered for the next subscriber.
pub struct MemoryWatch<K> {
    tx: Mutex<Option<EventSender<K>>>,
    rx: ReceiverSlot<K>,
    subscriptions: Mutex<Vec<(String, Selector)>>,
    active: Arc<AtomicUsize>,
}

impl<K> Default for MemoryWatch<K> {
    fn default() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Arc::new(Mutex::new(Some(rx))),
            subscriptions: Mutex::new(Vec::new()),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl<K: Send + Sync + 'static> MemoryWatch<K> {
    pub fn new() -> Self { Self::default() }

    pub fn push(&self, event: WatchEvent<K>) {
        if let Some(tx) = lock(&self.tx).as_ref() { let _ = tx.send(Ok(event)); }
    }

    pub fn push_error(&self, error: ClusterError) {
        if let Some(tx) = lock(&self.tx).as_ref() { let _ = tx.send(Err(error)); }
    }

    /// End the stream once buffered events are drained.
    pub fn close(&self) { lock(&self.tx).take(); }

    /// Subscriptions that have not been dropped yet.
    pub fn active_subscriptions(&self) -> usize { self.active.load(Ordering::SeqCst) }

    pub fn subscriptions(&self) -> Vec<(String, Selector)> { lock(&self.subscriptions).clone() }
}

#[async_trait::async_trait]
impl<K: Send + Sync + 'static> WatchApi<K> for MemoryWatch<K> {
    async fn watch(&self, namespace: &str, selector: &Selector) -> Result<EventStream<K>, ClusterError> {
        let rx = lock(&self.rx)
            .take()
            .ok_or_else(|| ClusterError::Transport("memory watch already has a subscriber".into()))?;
        lock(&self.subscriptions).push((namespace.to_string(), selector.clone()));
        self.active.fetch_add(1, Ordering::SeqCst);
        let sub = Subscription { rx: Some(rx), slot: self.rx.clone(), active: self.active.clone() };
        let stream = futures::stream::unfold(sub, |mut sub| async move {
            let item = sub.rx.as_mut()?.recv().await?;
            Some((item, sub))
        });
        Ok(stream.boxed())
    }
}

/// Canned container logs keyed by `(pod, container)`.
#[derive(Default)]
pub struct MemoryLogs {
    logs: Mutex<BTreeMap<(String, String), Result<String, ClusterError>>>,
    requests: Mutex<Vec<(String, String)>>,
}

impl MemoryLogs {
    pub fn new() -> Self { Self::default() }

    pub fn set(&self, pod: &str, container: &str, text: &str) {
        lock(&self.logs).insert((pod.to_string(), container.to_string()), Ok(text.to_string()));
    }

    pub fn set_error(&self, pod: &str, container: &str, error: ClusterError) {
        lock(&self.logs).insert((pod.to_string(), container.to_string()), Err(error));
    }

    pub fn requests(&self) -> Vec<(String, String)> { lock(&self.requests).clone() }
}

#[async_trait::async_trait]
impl PodLogs for MemoryLogs {
    async fn tail(
        &self,
        _namespace: &str,
        pod: &str,
        container: &str,
        lines: i64,
        max_bytes: i64,
    ) -> Result<String, ClusterError> {
        lock(&self.requests).push((pod.to_string(), container.to_string()));
        let entry = lock(&self.logs).get(&(pod.to_string(), container.to_string())).cloned();
        let text = match entry {
            Some(r) => r?,
            None => return Err(ClusterError::NotFound { kind: "Pod".into(), name: format!("{}/{}", pod, container) }),
        };
        // Mirror the server: keep the last `lines`, then cap at `max_bytes`.
        let all: Vec<&str> = text.lines().collect();
        let keep = (lines.max(0) as usize).min(all.len());
        let mut tail = all[all.len() - keep..].join("\n");
        let cap = max_bytes.max(0) as usize;
        if tail.len() > cap {
            let mut cut = cap;
            while !tail.is_char_boundary(cut) { cut -= 1; }
            tail.truncate(cut);
        }
        Ok(tail)
    }
}

/// A whole fake cluster; `cluster()` hands out the trait-object view.
#[derive(Default)]
pub struct MemoryCluster {
    pub deployments: Arc<MemoryApi<Deployment>>,
    pub stateful_sets: Arc<MemoryApi<StatefulSet>>,
    pub services: Arc<MemoryApi<Service>>,
    pub ingresses: Arc<MemoryApi<Ingress>>,
    pub autoscalers: Arc<MemoryApi<HorizontalPodAutoscaler>>,
    pub claims: Arc<MemoryApi<PersistentVolumeClaim>>,
    pub pods: Arc<MemoryApi<Pod>>,
    pub jobs: Arc<MemoryApi<Job>>,
    pub job_events: Arc<MemoryWatch<Job>>,
    pub pod_events: Arc<MemoryWatch<Pod>>,
    pub logs: Arc<MemoryLogs>,
}

impl MemoryCluster {
    pub fn new() -> Self { Self::default() }

    pub fn cluster(&self) -> Cluster {
        Cluster {
            deployments: self.deployments.clone(),
            stateful_sets: self.stateful_sets.clone(),
            services: self.services.clone(),
            ingresses: self.ingresses.clone(),
            autoscalers: self.autoscalers.clone(),
            claims: self.claims.clone(),
            pods: self.pods.clone(),
            jobs: self.jobs.clone(),
            job_events: self.job_events.clone(),
            pod_events: self.pod_events.clone(),
            logs: self.logs.clone(),
        }
    }

    /// Mutating calls across the workload-topology kinds.
    pub fn topology_mutations(&self) -> usize {
        self.deployments.mutations()
            + self.stateful_sets.mutations()
            + self.services.mutations()
            + self.ingresses.mutations()
            + self.autoscalers.mutations()
            + self.claims.mutations()
    }

    pub fn reset_calls(&self) {
        self.deployments.reset_calls();
        self.stateful_sets.reset_calls();
        self.services.reset_calls();
        self.ingresses.reset_calls();
        self.autoscalers.reset_calls();
        self.claims.reset_calls();
        self.pods.reset_calls();
        self.jobs.reset_calls();
    }
}
