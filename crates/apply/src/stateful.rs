//! Updating a stable-identity workload: scale to zero, wait for the pod to go,
//! swap the template, scale back to one. The single pod never overlaps its
//! replacement on the same volume.

use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use keel_core::config::{ApplySettings, DrainMode};
use keel_kubehub::{Cluster, Selector};
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::error::StepError;
use crate::object::replace_with;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// Sleep for a grace period and assume the pod is gone.
    FixedDelay(Duration),
    /// List pods by selector until none remain.
    PollPods { interval: Duration, timeout: Duration },
}

impl Drain {
    pub fn from_settings(settings: &ApplySettings) -> Self {
        match settings.drain_mode {
            DrainMode::Fixed => Drain::FixedDelay(settings.drain_grace),
            DrainMode::Poll => Drain::PollPods { interval: settings.drain_poll_interval, timeout: settings.drain_timeout },
        }
    }

    async fn wait(&self, cluster: &Cluster, namespace: &str, name: &str, selector: &Selector) -> Result<(), StepError> {
        match *self {
            Drain::FixedDelay(grace) => {
                sleep(grace).await;
                Ok(())
            }
            Drain::PollPods { interval, timeout } => {
                let started = Instant::now();
                loop {
                    let pods = cluster.pods.list(namespace, selector).await?;
                    if pods.is_empty() {
                        return Ok(());
                    }
                    if started.elapsed() >= timeout {
                        return Err(StepError::DrainTimeout { name: name.to_string(), waited: started.elapsed() });
                    }
                    debug!(ns = %namespace, statefulset = %name, remaining = pods.len(), "waiting for pods to drain");
                    sleep(interval).await;
                }
            }
        }
    }
}

/// Roll `desired` (already hash-stamped) over the live StatefulSet of the same name.
pub async fn roll(
    cluster: &Cluster,
    namespace: &str,
    desired: &StatefulSet,
    selector: &Selector,
    drain: Drain,
) -> Result<StatefulSet, StepError> {
    let api = cluster.stateful_sets.as_ref();
    let name = desired.metadata.name.clone().unwrap_or_default();
    let vanished = || StepError::Vanished { kind: "StatefulSet", name: name.clone() };

    let mut live = api.get(namespace, &name).await?.ok_or_else(vanished)?;
    if let Some(spec) = live.spec.as_mut() { spec.replicas = Some(0); }
    api.replace(namespace, &name, &live).await?;
    info!(ns = %namespace, statefulset = %name, "scaled to zero for update");

    drain.wait(cluster, namespace, &name, selector).await?;

    let live = api.get(namespace, &name).await?.ok_or_else(vanished)?;
    let mut next = live.clone();
    if let (Some(spec), Some(want)) = (next.spec.as_mut(), desired.spec.as_ref()) {
        spec.template = want.template.clone();
        spec.volume_claim_templates = want.volume_claim_templates.clone();
        spec.replicas = Some(1);
    }
    next.metadata.annotations = desired.metadata.annotations.clone();
    next.metadata.labels = desired.metadata.labels.clone();
    let updated = replace_with(api, namespace, &name, next, &live).await?;
    info!(ns = %namespace, statefulset = %name, "updated and scaled back to one");
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::StatefulSetSpec;
    use k8s_openapi::api::core::v1::Pod;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use keel_kubehub::memory::{MemoryCluster, Verb};
    use keel_kubehub::ClusterError;
    use std::collections::BTreeMap;

    fn sts(image: &str, replicas: i32) -> StatefulSet {
        let mut template = k8s_openapi::api::core::v1::PodTemplateSpec::default();
        template.spec = Some(k8s_openapi::api::core::v1::PodSpec {
            containers: vec![k8s_openapi::api::core::v1::Container {
                name: "app".into(),
                image: Some(image.into()),
                ..Default::default()
            }],
            ..Default::default()
        });
        StatefulSet {
            metadata: ObjectMeta { name: Some("db".into()), ..Default::default() },
            spec: Some(StatefulSetSpec { replicas: Some(replicas), template, ..Default::default() }),
            status: None,
        }
    }

    fn image(s: &StatefulSet) -> Option<String> {
        s.spec.as_ref()?.template.spec.as_ref()?.containers[0].image.clone()
    }

    #[tokio::test(start_paused = true)]
    async fn scales_down_swaps_template_and_scales_up() {
        let mem = MemoryCluster::new();
        mem.stateful_sets.insert("ns", sts("postgres:15", 1));
        let out = roll(&mem.cluster(), "ns", &sts("postgres:16", 1), &Selector::labels("app=db"), Drain::FixedDelay(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(image(&out).as_deref(), Some("postgres:16"));
        assert_eq!(out.spec.as_ref().unwrap().replicas, Some(1));
        let replaces = mem.stateful_sets.calls_for(Verb::Replace);
        assert_eq!(replaces.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_drain_times_out_when_pods_linger() {
        let mem = MemoryCluster::new();
        mem.stateful_sets.insert("ns", sts("postgres:15", 1));
        mem.pods.insert(
            "ns",
            Pod {
                metadata: ObjectMeta {
                    name: Some("db-0".into()),
                    labels: Some(BTreeMap::from([("app".to_string(), "db".to_string())])),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        let drain = Drain::PollPods { interval: Duration::from_secs(2), timeout: Duration::from_secs(10) };
        let err = roll(&mem.cluster(), "ns", &sts("postgres:16", 1), &Selector::labels("app=db"), drain).await.unwrap_err();
        assert!(matches!(err, StepError::DrainTimeout { .. }));
        // Left scaled down; no attempt to restore the old template.
        let live = mem.stateful_sets.object("ns", "db").unwrap();
        assert_eq!(live.spec.as_ref().unwrap().replicas, Some(0));
        assert_eq!(image(&live).as_deref(), Some("postgres:15"));
    }

    #[tokio::test(start_paused = true)]
    async fn scale_down_failure_is_surfaced() {
        let mem = MemoryCluster::new();
        mem.stateful_sets.insert("ns", sts("postgres:15", 1));
        mem.stateful_sets.fail(Verb::Replace, Some("db"), ClusterError::Transport("reset".into()));
        let err = roll(&mem.cluster(), "ns", &sts("postgres:16", 1), &Selector::default(), Drain::FixedDelay(Duration::ZERO))
            .await
            .unwrap_err();
        assert_eq!(err, StepError::Cluster(ClusterError::Transport("reset".into())));
    }
}
