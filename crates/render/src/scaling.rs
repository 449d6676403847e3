use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HorizontalPodAutoscaler, HorizontalPodAutoscalerSpec, MetricSpec, MetricTarget,
    ResourceMetricSource,
};
use keel_core::config::RenderSettings;
use keel_core::{ReplicaPolicy, ResourceNames, ServiceSpec};

use crate::{object_meta, Workload};

/// CPU-utilization autoscaler for autoscaled Deployments. StatefulSets are pinned
/// to one replica and never get one.
pub fn autoscaler(
    spec: &ServiceSpec,
    names: &ResourceNames,
    namespace: &str,
    workload: &Workload,
    settings: &RenderSettings,
) -> Option<HorizontalPodAutoscaler> {
    let ReplicaPolicy::Autoscaled(min, max) = spec.replicas else { return None };
    if !matches!(workload, Workload::Deployment(_)) {
        return None;
    }
    Some(HorizontalPodAutoscaler {
        metadata: object_meta(names.autoscaler(), namespace, names),
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: workload.kind().to_string(),
                name: workload.name().to_string(),
            },
            min_replicas: Some(min as i32),
            max_replicas: max as i32,
            metrics: Some(vec![MetricSpec {
                type_: "Resource".to_string(),
                resource: Some(ResourceMetricSource {
                    name: "cpu".to_string(),
                    target: MetricTarget {
                        type_: "Utilization".to_string(),
                        average_utilization: Some(settings.cpu_target_utilization),
                        ..Default::default()
                    },
                }),
                ..Default::default()
            }]),
            behavior: None,
        }),
        status: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render;
    use keel_core::ManagedKind;

    #[test]
    fn autoscaler_targets_workload_by_name() {
        let mut spec = ServiceSpec::git("svc-1", "acme", "https://example.com/r.git");
        spec.replicas = ReplicaPolicy::Autoscaled(2, 5);
        let t = render(&spec, "img:1", None, &RenderSettings::default()).unwrap();
        let hpa = t.autoscaler.unwrap();
        let s = hpa.spec.unwrap();
        assert_eq!(s.scale_target_ref.kind, "Deployment");
        assert_eq!(s.scale_target_ref.name, "svc-1");
        assert_eq!((s.min_replicas, s.max_replicas), (Some(2), 5));
        let binding = s.metrics.unwrap();
        let target = &binding[0].resource.as_ref().unwrap().target;
        assert_eq!(target.average_utilization, Some(80));
    }

    #[test]
    fn stateful_workloads_are_never_autoscaled() {
        let mut spec = ServiceSpec::managed("db", "acme", ManagedKind::MySql, "8");
        spec.env.insert("MYSQL_ROOT_PASSWORD".into(), "pw".into());
        spec.replicas = ReplicaPolicy::Autoscaled(1, 3);
        let t = render(&spec, "mysql:8", None, &RenderSettings::default()).unwrap();
        assert_eq!(t.workload.kind(), "StatefulSet");
        assert!(t.autoscaler.is_none());
    }
}
