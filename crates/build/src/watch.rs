//! Watching a submitted build job to a terminal outcome.

use std::collections::BTreeSet;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use keel_kubehub::{Cluster, Selector, WatchEvent};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::BuildFailure;
use crate::job::MISSING_DESCRIPTOR_EXIT;

const IMAGE_PULL_REASONS: &[&str] = &["ImagePullBackOff", "ErrImagePull", "InvalidImageName"];
const CONFIG_REASONS: &[&str] = &["CreateContainerConfigError", "CreateContainerError", "RunContainerError"];
const CRASH_LOOP: &str = "CrashLoopBackOff";

pub fn job_selector(job: &str) -> Selector { Selector::fields(format!("metadata.name={}", job)) }

/// The job controller labels its pods with `job-name`.
pub fn pod_selector(job: &str) -> Selector { Selector::labels(format!("job-name={}", job)) }

/// What classification needs beyond the pod itself.
#[derive(Debug, Clone)]
pub struct PodRules<'a> {
    pub descriptor: &'a str,
    pub restart_threshold: i32,
}

/// A terminal failure visible on a pod, if any.
pub fn classify_pod(pod: &Pod, rules: &PodRules<'_>) -> Option<BuildFailure> {
    let status = pod.status.as_ref()?;
    let init = status.init_container_statuses.iter().flatten();
    for cs in init {
        if let Some(f) = classify_container(cs, rules) {
            return Some(f);
        }
        let exit = cs.state.as_ref().and_then(|s| s.terminated.as_ref());
        match exit {
            Some(t) if t.exit_code == MISSING_DESCRIPTOR_EXIT => {
                return Some(BuildFailure::MissingBuildDescriptor { descriptor: rules.descriptor.to_string() })
            }
            Some(t) if t.exit_code != 0 => {
                return Some(BuildFailure::SourceFetch {
                    exit_code: t.exit_code,
                    message: t.message.clone().or_else(|| t.reason.clone()),
                })
            }
            _ => {}
        }
    }
    status.container_statuses.iter().flatten().find_map(|cs| classify_container(cs, rules))
}

fn classify_container(cs: &ContainerStatus, rules: &PodRules<'_>) -> Option<BuildFailure> {
    let waiting = cs.state.as_ref().and_then(|s| s.waiting.as_ref());
    if let Some(w) = waiting {
        let reason = w.reason.as_deref().unwrap_or_default();
        if IMAGE_PULL_REASONS.contains(&reason) {
            return Some(BuildFailure::ImagePull {
                container: cs.name.clone(),
                reason: reason.to_string(),
                message: w.message.clone(),
            });
        }
        if CONFIG_REASONS.contains(&reason) {
            return Some(BuildFailure::ContainerConfig {
                container: cs.name.clone(),
                reason: reason.to_string(),
                message: w.message.clone(),
            });
        }
        if reason == CRASH_LOOP {
            return Some(BuildFailure::CrashLoop { container: cs.name.clone() });
        }
    }
    if cs.restart_count > rules.restart_threshold {
        return Some(BuildFailure::RestartLimit { container: cs.name.clone(), restarts: cs.restart_count });
    }
    None
}

/// `Ok(())` once the job completed, the failure once it failed, `None` while running.
pub fn classify_job(job: &Job) -> Option<Result<(), BuildFailure>> {
    let conditions = job.status.as_ref()?.conditions.as_ref()?;
    for c in conditions.iter().filter(|c| c.status == "True") {
        match c.type_.as_str() {
            "Complete" => return Some(Ok(())),
            "Failed" => {
                return Some(Err(BuildFailure::JobFailed {
                    reason: c.reason.clone().filter(|r| !r.is_empty()).unwrap_or_else(|| "Failed".to_string()),
                    message: c.message.clone(),
                }))
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug)]
pub struct Watched {
    pub outcome: Result<(), BuildFailure>,
    /// Every pod of the job observed on the stream, for log collection.
    pub pods: BTreeSet<String>,
}

/// Labels the job controller stamps on its pods with the owning job's uid.
const CONTROLLER_UID_LABELS: &[&str] = &["batch.kubernetes.io/controller-uid", "controller-uid"];

/// Identity of the submitted job; events about an older job of the same name are ignored.
pub struct Target<'a> {
    pub namespace: &'a str,
    pub job: &'a str,
    pub uid: Option<&'a str>,
}

impl Target<'_> {
    fn owns(&self, job: &Job) -> bool {
        match (self.uid, job.metadata.uid.as_deref()) {
            (Some(want), Some(got)) => want == got,
            _ => true,
        }
    }

    /// Pods of a deleted job keep the `job-name` label until garbage collection, so
    /// the owning job is read from the controller reference or the controller-uid label.
    pub fn owns_pod(&self, pod: &Pod) -> bool {
        let Some(want) = self.uid else { return true };
        let meta = &pod.metadata;
        let from_owner = meta
            .owner_references
            .as_ref()
            .and_then(|refs| refs.iter().find(|r| r.kind == "Job" && r.controller == Some(true)))
            .map(|r| r.uid.as_str());
        let from_label = meta
            .labels
            .as_ref()
            .and_then(|l| CONTROLLER_UID_LABELS.iter().find_map(|k| l.get(*k)))
            .map(|v| v.as_str());
        match from_owner.or(from_label) {
            Some(got) => got == want,
            None => true,
        }
    }
}

/// Consume both subscriptions from one loop until a terminal signal or the deadline.
///
/// Pod events are polled ahead of job events, so a pod-level failure that lands alongside
/// a job condition wins. Both streams are dropped before returning.
pub async fn watch_job(
    cluster: &Cluster,
    target: &Target<'_>,
    rules: &PodRules<'_>,
    started: Instant,
    limit: Duration,
) -> Watched {
    let mut seen = BTreeSet::new();
    let mut pods = match cluster.pod_events.watch(target.namespace, &pod_selector(target.job)).await {
        Ok(s) => s,
        Err(e) => return Watched { outcome: Err(BuildFailure::Watch(e)), pods: seen },
    };
    let mut jobs = match cluster.job_events.watch(target.namespace, &job_selector(target.job)).await {
        Ok(s) => s,
        Err(e) => return Watched { outcome: Err(BuildFailure::Watch(e)), pods: seen },
    };
    let timeout = tokio::time::sleep_until(started + limit);
    tokio::pin!(timeout);

    let outcome = loop {
        tokio::select! {
            biased;
            _ = &mut timeout => {
                break Err(BuildFailure::TimedOut(limit));
            }
            event = pods.next() => match event {
                Some(Ok(WatchEvent::Applied(pod))) if target.owns_pod(&pod) => {
                    if let Some(name) = pod.metadata.name.clone() {
                        if seen.insert(name.clone()) {
                            debug!(job = %target.job, pod = %name, "build pod observed");
                        }
                    }
                    if let Some(failure) = classify_pod(&pod, rules) {
                        break Err(failure);
                    }
                }
                Some(Ok(WatchEvent::Applied(pod))) => {
                    debug!(job = %target.job, pod = ?pod.metadata.name, "ignoring pod of an earlier job");
                }
                Some(Ok(WatchEvent::Deleted(_))) => {}
                Some(Err(e)) => warn!(job = %target.job, error = %e, "pod watch error"),
                None => break Err(BuildFailure::StreamClosed),
            },
            event = jobs.next() => match event {
                Some(Ok(WatchEvent::Applied(job))) if target.owns(&job) => {
                    if let Some(result) = classify_job(&job) {
                        break result;
                    }
                }
                Some(Ok(WatchEvent::Deleted(job))) if target.owns(&job) => {
                    break Err(BuildFailure::JobFailed {
                        reason: "Deleted".to_string(),
                        message: Some("job was deleted before it finished".to_string()),
                    });
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => warn!(job = %target.job, error = %e, "job watch error"),
                None => break Err(BuildFailure::StreamClosed),
            },
        }
    };
    drop(pods);
    drop(jobs);
    Watched { outcome, pods: seen }
}
