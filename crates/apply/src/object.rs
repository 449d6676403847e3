//! Create-or-replace for a single object, converging on a spec-hash annotation so
//! an already-converged object costs one read and no writes.

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use k8s_openapi::api::networking::v1::Ingress;
use keel_core::ANNOTATION_SPEC_HASH;
use keel_kubehub::{ClusterError, ObjectApi};
use kube::Resource;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::Action;

/// Kinds the reconciler writes.
pub trait Reconcilable: Resource<DynamicType = ()> + Clone + Serialize + Send + Sync + 'static {
    /// Copy server-owned fields from the live object into a replacement.
    fn retain_live(&mut self, _live: &Self) {}
}

impl Reconcilable for Deployment {}
impl Reconcilable for StatefulSet {}
impl Reconcilable for Ingress {}
impl Reconcilable for HorizontalPodAutoscaler {}
impl Reconcilable for PersistentVolumeClaim {}

impl Reconcilable for Service {
    fn retain_live(&mut self, live: &Self) {
        // clusterIP is immutable once assigned.
        if let (Some(desired), Some(live)) = (self.spec.as_mut(), live.spec.as_ref()) {
            desired.cluster_ip = live.cluster_ip.clone();
            desired.cluster_ips = live.cluster_ips.clone();
        }
    }
}

const VOLATILE_METADATA: [&str; 7] =
    ["resourceVersion", "uid", "creationTimestamp", "generation", "managedFields", "selfLink", "namespace"];

/// SHA-256 over the canonical JSON of the object's desired content.
pub fn spec_hash<K: Serialize>(obj: &K) -> String {
    let mut value = serde_json::to_value(obj).unwrap_or(Value::Null);
    if let Some(map) = value.as_object_mut() {
        map.remove("status");
        if let Some(meta) = map.get_mut("metadata").and_then(Value::as_object_mut) {
            for key in VOLATILE_METADATA { meta.remove(key); }
            if let Some(ann) = meta.get_mut("annotations").and_then(Value::as_object_mut) {
                ann.remove(ANNOTATION_SPEC_HASH);
                if ann.is_empty() { meta.remove("annotations"); }
            }
        }
    }
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(&value).as_bytes());
    hex::encode(hasher.finalize())
}

fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => format!("[{}]", items.iter().map(canonical_json).collect::<Vec<_>>().join(",")),
        other => other.to_string(),
    }
}

pub fn live_hash<K: Resource>(obj: &K) -> Option<&str> {
    obj.meta().annotations.as_ref()?.get(ANNOTATION_SPEC_HASH).map(String::as_str)
}

/// A copy of `desired` annotated with its own spec hash.
pub fn stamped<K: Reconcilable>(desired: &K) -> (K, String) {
    let hash = spec_hash(desired);
    let mut obj = desired.clone();
    obj.meta_mut()
        .annotations
        .get_or_insert_with(Default::default)
        .insert(ANNOTATION_SPEC_HASH.to_string(), hash.clone());
    (obj, hash)
}

/// Get, then create when absent or replace when the spec hash moved.
pub async fn apply_object<K: Reconcilable>(
    api: &dyn ObjectApi<K>,
    namespace: &str,
    desired: &K,
) -> Result<(Action, K), ClusterError> {
    let name = desired.meta().name.clone().unwrap_or_default();
    let (obj, hash) = stamped(desired);
    let live = match api.get(namespace, &name).await? {
        Some(live) => live,
        None => match api.create(namespace, &obj).await {
            Ok(created) => return Ok((Action::Created, created)),
            // Lost a create race; converge on whatever won it.
            Err(e) if e.is_already_exists() => api
                .get(namespace, &name)
                .await?
                .ok_or_else(|| ClusterError::NotFound { kind: K::kind(&()).to_string(), name: name.clone() })?,
            Err(e) => return Err(e),
        },
    };
    if live_hash(&live) == Some(hash.as_str()) {
        debug!(kind = %K::kind(&()), ns = %namespace, name = %name, "unchanged");
        return Ok((Action::Unchanged, live));
    }
    replace_with(api, namespace, &name, obj, &live).await.map(|o| (Action::Updated, o))
}

/// Replace `live` with `obj`, carrying the live resourceVersion.
pub async fn replace_with<K: Reconcilable>(
    api: &dyn ObjectApi<K>,
    namespace: &str,
    name: &str,
    mut obj: K,
    live: &K,
) -> Result<K, ClusterError> {
    obj.retain_live(live);
    obj.meta_mut().resource_version = live.meta().resource_version.clone();
    api.replace(namespace, name, &obj).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use keel_kubehub::memory::{MemoryApi, Verb};
    use std::collections::BTreeMap;

    fn ingress(name: &str, class: &str) -> Ingress {
        Ingress {
            metadata: ObjectMeta { name: Some(name.into()), ..Default::default() },
            spec: Some(k8s_openapi::api::networking::v1::IngressSpec {
                ingress_class_name: Some(class.into()),
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn hash_ignores_server_fields_and_key_order() {
        let a = ingress("web", "nginx");
        let mut b = a.clone();
        b.metadata.resource_version = Some("42".into());
        b.metadata.uid = Some("abc".into());
        b.metadata.annotations = Some(BTreeMap::from([(ANNOTATION_SPEC_HASH.to_string(), "old".to_string())]));
        assert_eq!(spec_hash(&a), spec_hash(&b));
        assert_ne!(spec_hash(&a), spec_hash(&ingress("web", "traefik")));
    }

    #[tokio::test]
    async fn second_apply_makes_no_mutating_call() {
        let api = MemoryApi::<Ingress>::new();
        let (action, _) = apply_object(&api, "ns", &ingress("web", "nginx")).await.unwrap();
        assert_eq!(action, Action::Created);
        api.reset_calls();
        let (action, _) = apply_object(&api, "ns", &ingress("web", "nginx")).await.unwrap();
        assert_eq!(action, Action::Unchanged);
        assert_eq!(api.mutations(), 0);
    }

    #[tokio::test]
    async fn changed_object_is_replaced_with_live_version() {
        let api = MemoryApi::<Ingress>::new();
        apply_object(&api, "ns", &ingress("web", "nginx")).await.unwrap();
        let (action, obj) = apply_object(&api, "ns", &ingress("web", "traefik")).await.unwrap();
        assert_eq!(action, Action::Updated);
        assert_eq!(obj.spec.unwrap().ingress_class_name.as_deref(), Some("traefik"));
        assert_eq!(api.calls_for(Verb::Replace).len(), 1);
    }

    /// Hides the object from the first get, as if another writer created it in between.
    struct Racing {
        inner: MemoryApi<Ingress>,
        first_get: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl ObjectApi<Ingress> for Racing {
        async fn create(&self, ns: &str, obj: &Ingress) -> Result<Ingress, ClusterError> { self.inner.create(ns, obj).await }
        async fn replace(&self, ns: &str, name: &str, obj: &Ingress) -> Result<Ingress, ClusterError> {
            self.inner.replace(ns, name, obj).await
        }
        async fn get(&self, ns: &str, name: &str) -> Result<Option<Ingress>, ClusterError> {
            if self.first_get.swap(false, std::sync::atomic::Ordering::SeqCst) {
                return Ok(None);
            }
            self.inner.get(ns, name).await
        }
        async fn delete(&self, ns: &str, name: &str) -> Result<bool, ClusterError> { self.inner.delete(ns, name).await }
        async fn list(&self, ns: &str, sel: &keel_kubehub::Selector) -> Result<Vec<Ingress>, ClusterError> {
            self.inner.list(ns, sel).await
        }
        async fn list_all(&self, sel: &keel_kubehub::Selector) -> Result<Vec<Ingress>, ClusterError> {
            self.inner.list_all(sel).await
        }
    }

    #[tokio::test]
    async fn create_race_falls_through_to_update() {
        let api = Racing { inner: MemoryApi::new(), first_get: std::sync::atomic::AtomicBool::new(true) };
        api.inner.insert("ns", ingress("web", "other"));
        let (action, obj) = apply_object(&api, "ns", &ingress("web", "nginx")).await.unwrap();
        assert_eq!(action, Action::Updated);
        assert_eq!(obj.spec.unwrap().ingress_class_name.as_deref(), Some("nginx"));
        assert_eq!(api.inner.calls_for(Verb::Create).len(), 1);
        assert_eq!(api.inner.calls_for(Verb::Replace).len(), 1);
    }

    #[tokio::test]
    async fn service_replace_keeps_cluster_ip() {
        use k8s_openapi::api::core::v1::ServiceSpec;
        let api = MemoryApi::<Service>::new();
        let mut live = Service {
            metadata: ObjectMeta { name: Some("web".into()), ..Default::default() },
            spec: Some(ServiceSpec { cluster_ip: Some("10.0.0.7".into()), ..Default::default() }),
            status: None,
        };
        api.insert("ns", live.clone());
        live.spec.as_mut().unwrap().cluster_ip = None;
        live.spec.as_mut().unwrap().type_ = Some("ClusterIP".into());
        let (_, obj) = apply_object(&api, "ns", &live).await.unwrap();
        assert_eq!(obj.spec.unwrap().cluster_ip.as_deref(), Some("10.0.0.7"));
    }
}
