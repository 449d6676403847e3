//! Persistent volume claims.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use keel_core::naming::CLAIM_TEMPLATE;
use keel_core::{ResourceNames, ServiceSpec, LABEL_ROLE};

use crate::{labels, object_meta, ClaimOwner, VolumeClaim};

/// The claim a service needs, if any. Stable-identity workloads own theirs through
/// the `data` template; the claim returned for them names the ordinal-0 instance.
pub fn claim(spec: &ServiceSpec, names: &ResourceNames, namespace: &str) -> Option<VolumeClaim> {
    let size = spec.storage_size()?;
    let (name, owner) = if spec.needs_stable_identity() {
        (names.template_claim(), ClaimOwner::Template)
    } else {
        (names.claim(), ClaimOwner::Standalone)
    };
    let mut meta = object_meta(&name, namespace, names);
    if let Some(l) = meta.labels.as_mut() { l.insert(LABEL_ROLE.to_string(), "data".to_string()); }
    Some(VolumeClaim { claim: PersistentVolumeClaim { metadata: meta, spec: Some(claim_spec(&size)), status: None }, owner })
}

/// Volume-claim template embedded in a StatefulSet.
pub fn template(names: &ResourceNames, size: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(CLAIM_TEMPLATE.to_string()),
            labels: Some(labels(names)),
            ..Default::default()
        },
        spec: Some(claim_spec(size)),
        status: None,
    }
}

fn claim_spec(size: &str) -> PersistentVolumeClaimSpec {
    PersistentVolumeClaimSpec {
        access_modes: Some(vec!["ReadWriteOnce".to_string()]),
        resources: Some(VolumeResourceRequirements {
            requests: Some(BTreeMap::from([("storage".to_string(), Quantity(size.to_string()))])),
            limits: None,
        }),
        ..Default::default()
    }
}

/// `spec.resources.requests.storage` of a claim.
pub fn requested(claim: &PersistentVolumeClaim) -> Option<&str> {
    claim
        .spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get("storage")
        .map(|q| q.0.as_str())
}

/// Overwrite the requested size in place.
pub fn set_requested(claim: &mut PersistentVolumeClaim, size: &str) {
    let spec = claim.spec.get_or_insert_with(Default::default);
    let resources = spec.resources.get_or_insert_with(Default::default);
    resources
        .requests
        .get_or_insert_with(Default::default)
        .insert("storage".to_string(), Quantity(size.to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::{ManagedKind, ServiceId};

    #[test]
    fn git_service_with_storage_gets_standalone_claim() {
        let mut spec = ServiceSpec::git("svc-1", "acme", "https://example.com/r.git");
        spec.storage = Some("3Gi".into());
        let names = ResourceNames::for_service(&spec.id);
        let vc = claim(&spec, &names, "acme").unwrap();
        assert_eq!(vc.owner, ClaimOwner::Standalone);
        assert_eq!(vc.name(), "svc-1-data");
        assert_eq!(vc.requested_storage(), Some("3Gi"));
    }

    #[test]
    fn managed_kinds_use_template_claims_with_default_size() {
        let spec = ServiceSpec::managed("db", "acme", ManagedKind::Postgres, "16");
        let names = ResourceNames::for_service(&ServiceId::new("db"));
        let vc = claim(&spec, &names, "acme").unwrap();
        assert_eq!(vc.owner, ClaimOwner::Template);
        assert_eq!(vc.name(), "data-db-0");
        assert_eq!(vc.requested_storage(), Some("5Gi"));
    }

    #[test]
    fn stateless_without_storage_has_no_claim() {
        let spec = ServiceSpec::managed("cache", "acme", ManagedKind::Redis, "7");
        let names = ResourceNames::for_service(&spec.id);
        assert!(claim(&spec, &names, "acme").is_none());
    }

    #[test]
    fn set_requested_rewrites_size() {
        let names = ResourceNames::for_service(&ServiceId::new("db"));
        let mut pvc = template(&names, "1Gi");
        set_requested(&mut pvc, "4Gi");
        assert_eq!(requested(&pvc), Some("4Gi"));
    }
}
