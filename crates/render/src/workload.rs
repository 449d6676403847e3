//! Deployments and StatefulSets, and the pod template they share.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, Probe,
    ResourceRequirements, TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use keel_core::config::RenderSettings;
use keel_core::naming::CLAIM_TEMPLATE;
use keel_core::{quantity, ConfigError, ResourceNames, ServiceSpec, ANNOTATION_DISPLAY_NAME};

use crate::{labels, object_meta, selector, storage, ClaimOwner, VolumeClaim, Workload};

const CONTAINER: &str = "app";

pub fn render(
    spec: &ServiceSpec,
    image: &str,
    names: &ResourceNames,
    namespace: &str,
    settings: &RenderSettings,
    claim: Option<&VolumeClaim>,
) -> Result<Workload, ConfigError> {
    let mut meta = object_meta(names.workload(), namespace, names);
    if !spec.display_name.is_empty() {
        meta.annotations = Some(BTreeMap::from([(ANNOTATION_DISPLAY_NAME.to_string(), spec.display_name.clone())]));
    }
    let label_selector = LabelSelector { match_labels: Some(selector(names)), ..Default::default() };

    match claim {
        Some(vc) if vc.owner == ClaimOwner::Template => {
            let kind = spec.managed_kind().ok_or(ConfigError::Invalid {
                field: "storage",
                reason: "stable-identity storage is only defined for managed kinds".into(),
            })?;
            let size = vc.requested_storage().unwrap_or(kind.default_storage());
            let mount = VolumeMount { name: CLAIM_TEMPLATE.to_string(), mount_path: kind.data_path().to_string(), ..Default::default() };
            let template = pod_template(spec, image, names, settings, Some(mount), None);
            Ok(Workload::StatefulSet(StatefulSet {
                metadata: meta,
                spec: Some(StatefulSetSpec {
                    replicas: Some(1),
                    selector: label_selector,
                    service_name: names.headless_service(),
                    template,
                    volume_claim_templates: Some(vec![storage::template(names, size)]),
                    ..Default::default()
                }),
                status: None,
            }))
        }
        standalone => {
            let (mount, volume) = match standalone {
                Some(vc) => {
                    let path = match spec.managed_kind() {
                        Some(kind) => kind.data_path().to_string(),
                        None => settings.git_data_path.clone(),
                    };
                    let mount = VolumeMount { name: "data".to_string(), mount_path: path, ..Default::default() };
                    let volume = Volume {
                        name: "data".to_string(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: vc.name().to_string(),
                            read_only: None,
                        }),
                        ..Default::default()
                    };
                    (Some(mount), Some(volume))
                }
                None => (None, None),
            };
            let template = pod_template(spec, image, names, settings, mount, volume);
            Ok(Workload::Deployment(Deployment {
                metadata: meta,
                spec: Some(DeploymentSpec {
                    replicas: Some(spec.replicas.initial_replicas() as i32),
                    selector: label_selector,
                    template,
                    ..Default::default()
                }),
                status: None,
            }))
        }
    }
}

fn pod_template(
    spec: &ServiceSpec,
    image: &str,
    names: &ResourceNames,
    settings: &RenderSettings,
    mount: Option<VolumeMount>,
    volume: Option<Volume>,
) -> PodTemplateSpec {
    let endpoints = spec.endpoints();
    let ports = endpoints
        .iter()
        .map(|ep| ContainerPort {
            name: Some(port_name(&ep.name)),
            container_port: ep.port as i32,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        })
        .collect();
    let primary_port = endpoints.iter().find(|e| e.primary).map(|e| e.port).unwrap_or(spec.port);
    let kind = spec.managed_kind();

    let container = Container {
        name: CONTAINER.to_string(),
        image: Some(image.to_string()),
        command: kind.and_then(|k| k.command()),
        args: kind.and_then(|k| k.args(spec.storage_size().is_some())),
        env: Some(env(spec)),
        ports: Some(ports),
        resources: Some(resources(spec, settings)),
        readiness_probe: Some(Probe {
            tcp_socket: Some(TCPSocketAction { port: IntOrString::Int(primary_port as i32), host: None }),
            initial_delay_seconds: Some(5),
            period_seconds: Some(10),
            ..Default::default()
        }),
        volume_mounts: mount.map(|m| vec![m]),
        ..Default::default()
    };
    PodTemplateSpec {
        metadata: Some(ObjectMeta { labels: Some(labels(names)), ..Default::default() }),
        spec: Some(PodSpec { containers: vec![container], volumes: volume.map(|v| vec![v]), ..Default::default() }),
    }
}

/// Port names are IANA_SVC_NAME: at most 15 chars.
fn port_name(endpoint: &str) -> String {
    endpoint.chars().take(15).collect::<String>().trim_end_matches('-').to_string()
}

/// Kind defaults first; declared variables win. Sorted by name.
fn env(spec: &ServiceSpec) -> Vec<EnvVar> {
    let mut merged: BTreeMap<String, String> = BTreeMap::new();
    if let Some(kind) = spec.managed_kind() {
        for (k, v) in kind.default_env() { merged.insert(k.to_string(), v); }
    }
    for (k, v) in &spec.env { merged.insert(k.clone(), v.clone()); }
    merged.into_iter().map(|(name, value)| EnvVar { name, value: Some(value), value_from: None }).collect()
}

/// Requests always set (default capped at the limit); limits only when declared.
fn resources(spec: &ServiceSpec, settings: &RenderSettings) -> ResourceRequirements {
    let mut requests = BTreeMap::new();
    let mut limits = BTreeMap::new();
    let pairs = [
        ("cpu", settings.default_cpu_request.as_str(), spec.resources.cpu.as_deref()),
        ("memory", settings.default_memory_request.as_str(), spec.resources.memory.as_deref()),
    ];
    for (resource, default, limit) in pairs {
        let request = match limit {
            Some(l) => quantity::min(default, l),
            None => default,
        };
        requests.insert(resource.to_string(), Quantity(request.to_string()));
        if let Some(l) = limit { limits.insert(resource.to_string(), Quantity(l.to_string())); }
    }
    ResourceRequirements {
        requests: Some(requests),
        limits: if limits.is_empty() { None } else { Some(limits) },
        ..Default::default()
    }
}
