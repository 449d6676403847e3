//! Keel render: turns a validated service definition and an image reference into the
//! full set of cluster objects that should exist for it. Pure; no cluster access.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use keel_core::config::RenderSettings;
use keel_core::naming::namespace_for_tenant;
use keel_core::{ConfigError, ResourceNames, ServiceSpec, Source};
use keel_core::{LABEL_MANAGED_BY, LABEL_NAME, LABEL_SERVICE, MANAGED_BY_KEEL};
use serde::Serialize;
use tracing::debug;

pub mod network;
pub mod scaling;
pub mod storage;
pub mod workload;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "object")]
pub enum Workload {
    Deployment(Deployment),
    StatefulSet(StatefulSet),
}

impl Workload {
    pub fn kind(&self) -> &'static str {
        match self {
            Workload::Deployment(_) => "Deployment",
            Workload::StatefulSet(_) => "StatefulSet",
        }
    }

    pub fn name(&self) -> &str {
        let meta = match self {
            Workload::Deployment(d) => &d.metadata,
            Workload::StatefulSet(s) => &s.metadata,
        };
        meta.name.as_deref().unwrap_or_default()
    }

    pub fn replicas(&self) -> Option<i32> {
        match self {
            Workload::Deployment(d) => d.spec.as_ref().and_then(|s| s.replicas),
            Workload::StatefulSet(s) => s.spec.as_ref().and_then(|s| s.replicas),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimOwner {
    /// Created directly; a Deployment mounts it by name.
    Standalone,
    /// Created by the StatefulSet controller from its `data` template.
    Template,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeClaim {
    pub claim: PersistentVolumeClaim,
    pub owner: ClaimOwner,
}

impl VolumeClaim {
    pub fn name(&self) -> &str { self.claim.metadata.name.as_deref().unwrap_or_default() }

    pub fn requested_storage(&self) -> Option<&str> { storage::requested(&self.claim) }
}

/// Everything one service needs in the cluster.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceTopology {
    pub namespace: String,
    pub names: ResourceNames,
    pub workload: Workload,
    pub services: Vec<Service>,
    pub routes: Vec<Ingress>,
    pub autoscaler: Option<HorizontalPodAutoscaler>,
    pub volume_claim: Option<VolumeClaim>,
}

impl ResourceTopology {
    /// Objects as they would be applied, for previews.
    pub fn manifests(&self) -> Result<Vec<serde_json::Value>, serde_json::Error> {
        let mut out = Vec::new();
        if let Some(vc) = self.volume_claim.as_ref().filter(|vc| vc.owner == ClaimOwner::Standalone) {
            out.push(manifest("v1", "PersistentVolumeClaim", &vc.claim)?);
        }
        match &self.workload {
            Workload::Deployment(d) => out.push(manifest("apps/v1", "Deployment", d)?),
            Workload::StatefulSet(s) => out.push(manifest("apps/v1", "StatefulSet", s)?),
        }
        for svc in &self.services { out.push(manifest("v1", "Service", svc)?); }
        for ing in &self.routes { out.push(manifest("networking.k8s.io/v1", "Ingress", ing)?); }
        if let Some(hpa) = &self.autoscaler {
            out.push(manifest("autoscaling/v2", "HorizontalPodAutoscaler", hpa)?);
        }
        Ok(out)
    }
}

fn manifest<T: Serialize>(api_version: &str, kind: &str, obj: &T) -> Result<serde_json::Value, serde_json::Error> {
    let mut v = serde_json::to_value(obj)?;
    if let Some(map) = v.as_object_mut() {
        map.insert("apiVersion".into(), api_version.into());
        map.insert("kind".into(), kind.into());
    }
    Ok(v)
}

/// Labels carried by every rendered object.
pub fn labels(names: &ResourceNames) -> BTreeMap<String, String> {
    let mut l = selector(names);
    l.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_KEEL.to_string());
    l.insert(LABEL_SERVICE.to_string(), names.base.clone());
    l
}

pub fn selector(names: &ResourceNames) -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_NAME.to_string(), names.selector_value().to_string())])
}

/// `app.kubernetes.io/name=<base>` as a selector expression.
pub fn selector_expr(names: &ResourceNames) -> String {
    format!("{}={}", LABEL_NAME, names.selector_value())
}

pub(crate) fn object_meta(name: &str, namespace: &str, names: &ResourceNames) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels(names)),
        ..Default::default()
    }
}

/// Render the topology for `spec` running `image`. `public_port` is the allocated
/// external port for managed services that expose TCP.
pub fn render(
    spec: &ServiceSpec,
    image: &str,
    public_port: Option<i32>,
    settings: &RenderSettings,
) -> Result<ResourceTopology, ConfigError> {
    spec.validate()?;
    if image.trim().is_empty() {
        return Err(ConfigError::Empty { field: "image" });
    }
    let exposes_tcp = matches!(&spec.source, Source::Managed(m) if m.expose_tcp);
    if exposes_tcp && public_port.is_none() {
        return Err(ConfigError::Invalid { field: "public_port", reason: "TCP-exposed service needs an allocated port".into() });
    }

    let names = ResourceNames::for_service(&spec.id);
    let namespace = namespace_for_tenant(&spec.tenant);
    let volume_claim = storage::claim(spec, &names, &namespace);
    let workload = workload::render(spec, image, &names, &namespace, settings, volume_claim.as_ref())?;
    let mut services = network::endpoint_services(spec, &names, &namespace);
    if let Workload::StatefulSet(_) = &workload {
        services.push(network::headless_service(spec, &names, &namespace));
    }
    if let (true, Some(port)) = (exposes_tcp, public_port) {
        services.push(network::public_service(spec, &names, &namespace, port));
    }
    let routes = network::routes(spec, &names, &namespace, settings);
    let autoscaler = scaling::autoscaler(spec, &names, &namespace, &workload, settings);

    debug!(
        service = %spec.id,
        workload = workload.kind(),
        services = services.len(),
        routes = routes.len(),
        autoscaler = autoscaler.is_some(),
        claim = ?volume_claim.as_ref().map(|c| c.owner),
        "rendered topology"
    );
    Ok(ResourceTopology { namespace, names, workload, services, routes, autoscaler, volume_claim })
}
