//! Volume claims are created once and afterwards only ever grown.

use std::cmp::Ordering;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use keel_core::quantity;
use keel_kubehub::{ClusterError, ObjectApi};
use keel_render::storage::{requested, set_requested};
use tracing::{info, warn};

use crate::object::stamped;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Created,
    Expanded { from: String, to: String },
    Unchanged,
    /// Desired size is below the live size; shrinking is never written.
    ShrinkIgnored { live: String, desired: String },
    /// Template claim not created by the controller yet.
    Pending,
}

impl ClaimOutcome {
    pub fn is_mutation(&self) -> bool { matches!(self, ClaimOutcome::Created | ClaimOutcome::Expanded { .. }) }
}

/// Create the claim when absent, otherwise expand it when the desired size is larger.
pub async fn ensure_standalone(
    api: &dyn ObjectApi<PersistentVolumeClaim>,
    namespace: &str,
    desired: &PersistentVolumeClaim,
) -> Result<ClaimOutcome, ClusterError> {
    let name = desired.metadata.name.clone().unwrap_or_default();
    let live = match api.get(namespace, &name).await? {
        Some(live) => live,
        None => {
            let (obj, _) = stamped(desired);
            match api.create(namespace, &obj).await {
                Ok(_) => {
                    info!(ns = %namespace, claim = %name, "claim created");
                    return Ok(ClaimOutcome::Created);
                }
                Err(e) if e.is_already_exists() => api
                    .get(namespace, &name)
                    .await?
                    .ok_or(ClusterError::NotFound { kind: "PersistentVolumeClaim".into(), name: name.clone() })?,
                Err(e) => return Err(e),
            }
        }
    };
    match requested(desired) {
        Some(size) => expand(api, namespace, live, size).await,
        None => Ok(ClaimOutcome::Unchanged),
    }
}

/// Grow the claim the StatefulSet controller made from its template, if it exists yet.
pub async fn expand_template_claim(
    api: &dyn ObjectApi<PersistentVolumeClaim>,
    namespace: &str,
    name: &str,
    desired_size: &str,
) -> Result<ClaimOutcome, ClusterError> {
    match api.get(namespace, name).await? {
        Some(live) => expand(api, namespace, live, desired_size).await,
        None => Ok(ClaimOutcome::Pending),
    }
}

async fn expand(
    api: &dyn ObjectApi<PersistentVolumeClaim>,
    namespace: &str,
    mut live: PersistentVolumeClaim,
    desired: &str,
) -> Result<ClaimOutcome, ClusterError> {
    let name = live.metadata.name.clone().unwrap_or_default();
    let Some(current) = requested(&live).map(str::to_string) else {
        return Ok(ClaimOutcome::Unchanged);
    };
    match quantity::compare(desired, &current) {
        Some(Ordering::Greater) => {
            set_requested(&mut live, desired);
            api.replace(namespace, &name, &live).await?;
            info!(ns = %namespace, claim = %name, from = %current, to = %desired, "claim expanded");
            Ok(ClaimOutcome::Expanded { from: current, to: desired.to_string() })
        }
        Some(Ordering::Less) => {
            warn!(ns = %namespace, claim = %name, live = %current, desired = %desired, "claim shrink ignored");
            Ok(ClaimOutcome::ShrinkIgnored { live: current, desired: desired.to_string() })
        }
        _ => Ok(ClaimOutcome::Unchanged),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ResourceNames;
    use keel_core::ServiceId;
    use keel_kubehub::memory::{MemoryApi, Verb};
    use keel_render::storage::template;

    fn claim(name: &str, size: &str) -> PersistentVolumeClaim {
        let mut pvc = template(&ResourceNames::for_service(&ServiceId::new("svc")), size);
        pvc.metadata.name = Some(name.to_string());
        pvc
    }

    #[tokio::test]
    async fn created_then_expanded_never_shrunk() {
        let api = MemoryApi::<PersistentVolumeClaim>::new();
        assert_eq!(ensure_standalone(&api, "ns", &claim("svc-data", "1Gi")).await.unwrap(), ClaimOutcome::Created);
        assert_eq!(
            ensure_standalone(&api, "ns", &claim("svc-data", "2Gi")).await.unwrap(),
            ClaimOutcome::Expanded { from: "1Gi".into(), to: "2Gi".into() }
        );
        api.reset_calls();
        assert_eq!(
            ensure_standalone(&api, "ns", &claim("svc-data", "512Mi")).await.unwrap(),
            ClaimOutcome::ShrinkIgnored { live: "2Gi".into(), desired: "512Mi".into() }
        );
        assert_eq!(api.mutations(), 0);
        assert_eq!(requested(&api.object("ns", "svc-data").unwrap()), Some("2Gi"));
    }

    #[tokio::test]
    async fn equal_sizes_in_different_units_are_unchanged() {
        let api = MemoryApi::<PersistentVolumeClaim>::new();
        api.insert("ns", claim("svc-data", "1024Mi"));
        assert_eq!(ensure_standalone(&api, "ns", &claim("svc-data", "1Gi")).await.unwrap(), ClaimOutcome::Unchanged);
        assert!(api.calls_for(Verb::Replace).is_empty());
    }

    #[tokio::test]
    async fn missing_template_claim_is_pending() {
        let api = MemoryApi::<PersistentVolumeClaim>::new();
        assert_eq!(expand_template_claim(&api, "ns", "data-db-0", "5Gi").await.unwrap(), ClaimOutcome::Pending);
        api.insert("ns", claim("data-db-0", "5Gi"));
        assert_eq!(expand_template_claim(&api, "ns", "data-db-0", "10Gi").await.unwrap(), ClaimOutcome::Expanded {
            from: "5Gi".into(),
            to: "10Gi".into()
        });
    }
}
