//! Services and ingress routes.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec as KubeServiceSpec};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule, IngressServiceBackend,
    IngressSpec, IngressTLS, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use keel_core::config::RenderSettings;
use keel_core::{Endpoint, Protocol, ResourceNames, ServiceSpec, LABEL_ROLE};

use crate::{object_meta, selector};

const CERT_MANAGER_ISSUER: &str = "cert-manager.io/cluster-issuer";

fn service_port(ep: &Endpoint, node_port: Option<i32>) -> ServicePort {
    ServicePort {
        name: Some(ep.name.clone()),
        port: ep.port as i32,
        target_port: Some(IntOrString::Int(ep.port as i32)),
        protocol: Some("TCP".to_string()),
        node_port,
        ..Default::default()
    }
}

fn service(name: &str, namespace: &str, names: &ResourceNames, role: &str, spec: KubeServiceSpec) -> Service {
    let mut meta = object_meta(name, namespace, names);
    if let Some(l) = meta.labels.as_mut() { l.insert(LABEL_ROLE.to_string(), role.to_string()); }
    Service { metadata: meta, spec: Some(spec), status: None }
}

/// One ClusterIP Service per endpoint.
pub fn endpoint_services(spec: &ServiceSpec, names: &ResourceNames, namespace: &str) -> Vec<Service> {
    spec.endpoints()
        .iter()
        .map(|ep| {
            service(
                &names.endpoint_service(ep),
                namespace,
                names,
                "endpoint",
                KubeServiceSpec {
                    type_: Some("ClusterIP".to_string()),
                    selector: Some(selector(names)),
                    ports: Some(vec![service_port(ep, None)]),
                    ..Default::default()
                },
            )
        })
        .collect()
}

/// `clusterIP: None` Service governing a StatefulSet's per-pod DNS records.
pub fn headless_service(spec: &ServiceSpec, names: &ResourceNames, namespace: &str) -> Service {
    service(
        &names.headless_service(),
        namespace,
        names,
        "headless",
        KubeServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(selector(names)),
            ports: Some(spec.endpoints().iter().map(|ep| service_port(ep, None)).collect()),
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        },
    )
}

/// NodePort Service publishing the primary endpoint on the allocated port.
pub fn public_service(spec: &ServiceSpec, names: &ResourceNames, namespace: &str, node_port: i32) -> Service {
    let primary = spec.endpoints().into_iter().find(|e| e.primary).unwrap_or_else(|| {
        Endpoint::new("tcp", spec.port, Protocol::Tcp, true)
    });
    service(
        &names.public_service(),
        namespace,
        names,
        "public",
        KubeServiceSpec {
            type_: Some("NodePort".to_string()),
            selector: Some(selector(names)),
            ports: Some(vec![service_port(&primary, Some(node_port))]),
            ..Default::default()
        },
    )
}

/// `nodePort` of a public Service, if it has one.
pub fn node_port(svc: &Service) -> Option<i32> {
    svc.spec.as_ref()?.ports.as_ref()?.iter().find_map(|p| p.node_port)
}

/// One Ingress per HTTP endpoint.
pub fn routes(spec: &ServiceSpec, names: &ResourceNames, namespace: &str, settings: &RenderSettings) -> Vec<Ingress> {
    spec.endpoints()
        .iter()
        .filter(|ep| ep.protocol == Protocol::Http)
        .map(|ep| route(spec, ep, names, namespace, settings))
        .collect()
}

fn route(
    spec: &ServiceSpec,
    ep: &Endpoint,
    names: &ResourceNames,
    namespace: &str,
    settings: &RenderSettings,
) -> Ingress {
    let name = names.route(ep);
    let hosts: Vec<String> = if ep.primary && !spec.domains.is_empty() {
        spec.domains.clone()
    } else {
        vec![format!("{}.{}", name, settings.base_domain)]
    };
    let backend = IngressBackend {
        service: Some(IngressServiceBackend {
            name: names.endpoint_service(ep),
            port: Some(ServiceBackendPort { number: Some(ep.port as i32), name: None }),
        }),
        resource: None,
    };
    let rules = hosts
        .iter()
        .map(|host| IngressRule {
            host: Some(host.clone()),
            http: Some(HTTPIngressRuleValue {
                paths: vec![HTTPIngressPath {
                    path: Some("/".to_string()),
                    path_type: "Prefix".to_string(),
                    backend: backend.clone(),
                }],
            }),
        })
        .collect();

    let mut meta = object_meta(&name, namespace, names);
    let tls = settings.cluster_issuer.as_ref().map(|issuer| {
        meta.annotations = Some(BTreeMap::from([(CERT_MANAGER_ISSUER.to_string(), issuer.clone())]));
        vec![IngressTLS { hosts: Some(hosts.clone()), secret_name: Some(format!("{}-tls", name)) }]
    });
    Ingress {
        metadata: meta,
        spec: Some(IngressSpec {
            ingress_class_name: settings.ingress_class.clone(),
            rules: Some(rules),
            tls,
            ..Default::default()
        }),
        status: None,
    }
}
