use std::collections::BTreeSet;

use keel_core::config::BuildSettings;
use keel_kubehub::Cluster;
use tracing::warn;

use crate::error::ContainerLog;
use crate::job::{BUILD_CONTAINER, FETCH_CONTAINER};
use crate::watch::{pod_selector, Target};

/// Best-effort tails of both build containers across every pod of the job.
///
/// Pods seen on the watch are merged with whatever the cluster still lists for the same
/// job. Errors are logged and skipped.
pub async fn collect(
    cluster: &Cluster,
    target: &Target<'_>,
    seen: &BTreeSet<String>,
    settings: &BuildSettings,
) -> Vec<ContainerLog> {
    let (namespace, job) = (target.namespace, target.job);
    let mut pods = seen.clone();
    match cluster.pods.list(namespace, &pod_selector(job)).await {
        Ok(listed) => pods.extend(listed.into_iter().filter(|p| target.owns_pod(p)).filter_map(|p| p.metadata.name)),
        Err(e) => warn!(ns = %namespace, job = %job, error = %e, "listing build pods failed"),
    }

    let mut logs = Vec::new();
    for pod in &pods {
        for container in [FETCH_CONTAINER, BUILD_CONTAINER] {
            match cluster.logs.tail(namespace, pod, container, settings.log_tail_lines, settings.log_tail_bytes).await {
                Ok(text) if text.trim().is_empty() => {}
                Ok(text) => logs.push(ContainerLog { pod: pod.clone(), container: container.to_string(), text }),
                Err(e) => warn!(pod = %pod, container, error = %e, "reading build logs failed"),
            }
        }
    }
    logs
}
