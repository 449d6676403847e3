use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::{Job, JobCondition, JobStatus};
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus, Pod, PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use keel_build::{BuildFailure, BuildOrchestrator, BuildRequest};
use keel_core::config::BuildSettings;
use keel_core::{ManagedKind, ServiceSpec};
use keel_kubehub::memory::{MemoryCluster, Verb};
use keel_kubehub::{ClusterError, EventStream, Selector, WatchApi, WatchEvent};

const REGISTRY: &str = "registry.keel-system.svc:5000";
const JOB: &str = "build-svc-1-latest";
const POD: &str = "build-svc-1-latest-x7k2p";

fn request() -> BuildRequest {
    BuildRequest::new(ServiceSpec::git("svc-1", "acme", "https://git.example.com/acme/app.git"), REGISTRY)
}

fn orchestrator(mem: &MemoryCluster) -> BuildOrchestrator {
    BuildOrchestrator::new(mem.cluster(), BuildSettings::default())
}

fn job_with(kind: &str, reason: Option<&str>) -> Job {
    Job {
        metadata: ObjectMeta { name: Some(JOB.into()), namespace: Some("acme".into()), ..Default::default() },
        status: Some(JobStatus {
            conditions: Some(vec![JobCondition {
                type_: kind.into(),
                status: "True".into(),
                reason: reason.map(Into::into),
                message: reason.map(|r| format!("job {}", r)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pod_with(init: Option<ContainerStatus>, main: Option<ContainerStatus>) -> Pod {
    let mut labels = std::collections::BTreeMap::new();
    labels.insert("job-name".to_string(), JOB.to_string());
    Pod {
        metadata: ObjectMeta { name: Some(POD.into()), labels: Some(labels), ..Default::default() },
        status: Some(PodStatus {
            init_container_statuses: init.map(|c| vec![c]),
            container_statuses: main.map(|c| vec![c]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn waiting(container: &str, reason: &str) -> ContainerStatus {
    ContainerStatus {
        name: container.into(),
        state: Some(ContainerState {
            waiting: Some(ContainerStateWaiting { reason: Some(reason.into()), message: None }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn exited(container: &str, code: i32) -> ContainerStatus {
    ContainerStatus {
        name: container.into(),
        state: Some(ContainerState {
            terminated: Some(ContainerStateTerminated { exit_code: code, ..Default::default() }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[tokio::test]
async fn completed_job_yields_the_image() {
    let mem = MemoryCluster::new();
    mem.job_events.push(WatchEvent::Applied(job_with("Complete", None)));

    let artifact = orchestrator(&mem).run_build(&request()).await.unwrap();
    assert_eq!(artifact.image, "registry.keel-system.svc:5000/svc-1:latest");
    assert_eq!(artifact.job, JOB);
    assert_eq!(artifact.namespace, "acme");

    let submitted = mem.jobs.object("acme", JOB).unwrap();
    assert_eq!(submitted.spec.unwrap().backoff_limit, Some(0));
    assert_eq!(mem.job_events.subscriptions(), vec![("acme".to_string(), Selector::fields("metadata.name=build-svc-1-latest"))]);
    assert_eq!(mem.pod_events.subscriptions(), vec![("acme".to_string(), Selector::labels("job-name=build-svc-1-latest"))]);
    assert_eq!(mem.job_events.active_subscriptions(), 0);
    assert_eq!(mem.pod_events.active_subscriptions(), 0);
    assert!(mem.logs.requests().is_empty());
}

#[tokio::test]
async fn pinned_commit_names_job_and_tag() {
    let mem = MemoryCluster::new();
    let mut job = job_with("Complete", None);
    job.metadata.name = Some("build-svc-1-9f2c1e0".into());
    mem.job_events.push(WatchEvent::Applied(job));

    let mut req = request();
    req.commit = Some("9f2c1e0".into());
    let artifact = orchestrator(&mem).run_build(&req).await.unwrap();
    assert_eq!(artifact.image, "registry.keel-system.svc:5000/svc-1:9f2c1e0");
    assert_eq!(artifact.job, "build-svc-1-9f2c1e0");
}

#[tokio::test]
async fn image_pull_backoff_preempts_a_simultaneous_completion() {
    let mem = MemoryCluster::new();
    mem.pod_events.push(WatchEvent::Applied(pod_with(None, Some(waiting("build", "ImagePullBackOff")))));
    mem.job_events.push(WatchEvent::Applied(job_with("Complete", None)));

    let err = orchestrator(&mem).run_build(&request()).await.unwrap_err();
    assert!(
        matches!(&err.failure, BuildFailure::ImagePull { container, reason, .. } if container == "build" && reason == "ImagePullBackOff"),
        "{:?}",
        err.failure
    );
    assert_eq!(err.image, "registry.keel-system.svc:5000/svc-1:latest");
    assert_eq!(mem.pod_events.active_subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn deadline_times_out_and_drops_both_watches() {
    let mem = MemoryCluster::new();
    let orch = orchestrator(&mem);

    let err = orch.run_build(&request()).await.unwrap_err();
    assert_eq!(err.failure, BuildFailure::TimedOut(Duration::from_secs(900)));
    assert_eq!(mem.job_events.active_subscriptions(), 0);
    assert_eq!(mem.pod_events.active_subscriptions(), 0);
    // Only the pre-delete and the submit; nothing is cleaned up on timeout.
    assert_eq!(mem.jobs.calls_for(Verb::Delete).len(), 1);
    assert_eq!(mem.jobs.calls_for(Verb::Create).len(), 1);
    assert!(mem.jobs.object("acme", JOB).is_some());
}

#[tokio::test]
async fn missing_descriptor_is_reported_with_fetch_logs() {
    let mem = MemoryCluster::new();
    mem.pod_events.push(WatchEvent::Applied(pod_with(Some(exited("fetch-source", 3)), None)));
    mem.logs.set(POD, "fetch-source", "cloning...\nbuild descriptor Dockerfile not found");

    let err = orchestrator(&mem).run_build(&request()).await.unwrap_err();
    assert_eq!(err.failure, BuildFailure::MissingBuildDescriptor { descriptor: "Dockerfile".into() });
    assert_eq!(err.logs.len(), 1);
    assert_eq!(err.logs[0].container, "fetch-source");
    assert!(err.logs[0].text.ends_with("not found"));
    assert!(mem.logs.requests().contains(&(POD.to_string(), "build".to_string())));
}

#[tokio::test]
async fn failed_job_carries_reason_and_message() {
    let mem = MemoryCluster::new();
    mem.job_events.push(WatchEvent::Applied(job_with("Failed", Some("BackoffLimitExceeded"))));

    let err = orchestrator(&mem).run_build(&request()).await.unwrap_err();
    assert_eq!(
        err.failure,
        BuildFailure::JobFailed {
            reason: "BackoffLimitExceeded".into(),
            message: Some("job BackoffLimitExceeded".into())
        }
    );
    assert_eq!(err.failure.reason(), "job_failed");
}

#[tokio::test]
async fn log_errors_never_replace_the_failure() {
    let mem = MemoryCluster::new();
    mem.pod_events.push(WatchEvent::Applied(pod_with(None, Some(waiting("build", "CrashLoopBackOff")))));
    mem.logs.set_error(POD, "build", ClusterError::Transport("connection reset".into()));
    mem.logs.set(POD, "fetch-source", "cloned");

    let err = orchestrator(&mem).run_build(&request()).await.unwrap_err();
    assert_eq!(err.failure, BuildFailure::CrashLoop { container: "build".into() });
    assert_eq!(err.logs.len(), 1);
    assert_eq!(err.logs[0].container, "fetch-source");
}

fn owned_by(mut pod: Pod, name: &str, job_uid: &str) -> Pod {
    pod.metadata.name = Some(name.into());
    pod.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "batch/v1".into(),
        kind: "Job".into(),
        name: JOB.into(),
        uid: job_uid.into(),
        controller: Some(true),
        ..Default::default()
    }]);
    pod
}

#[tokio::test]
async fn pods_left_by_an_earlier_job_of_the_same_name_are_ignored() {
    let mem = MemoryCluster::new();
    let stale = owned_by(pod_with(Some(exited("fetch-source", 3)), None), "build-svc-1-latest-old01", "old-job-uid");
    mem.pods.insert("acme", stale.clone());
    mem.pod_events.push(WatchEvent::Applied(stale));
    mem.job_events.push(WatchEvent::Applied(job_with("Complete", None)));

    let artifact = orchestrator(&mem).run_build(&request()).await.unwrap();
    assert_eq!(artifact.job, JOB);
}

#[tokio::test]
async fn logs_skip_pods_of_an_earlier_job() {
    let mem = MemoryCluster::new();
    let stale = owned_by(pod_with(None, None), "build-svc-1-latest-old01", "old-job-uid");
    mem.pods.insert("acme", stale);
    mem.pods.insert("acme", pod_with(None, None));
    mem.job_events.push(WatchEvent::Applied(job_with("Failed", Some("DeadlineExceeded"))));

    orchestrator(&mem).run_build(&request()).await.unwrap_err();
    let tailed: Vec<String> = mem.logs.requests().into_iter().map(|(pod, _)| pod).collect();
    assert!(tailed.iter().all(|p| p == POD), "{:?}", tailed);
    assert!(!tailed.is_empty());
}

#[tokio::test]
async fn stale_job_is_deleted_before_submit() {
    let mem = MemoryCluster::new();
    mem.jobs.insert("acme", job_with("Failed", Some("Old")));
    mem.job_events.push(WatchEvent::Applied(job_with("Complete", None)));

    orchestrator(&mem).run_build(&request()).await.unwrap();
    let verbs: Vec<Verb> = mem.jobs.calls().into_iter().map(|c| c.verb).filter(|v| v.is_mutating()).collect();
    assert_eq!(verbs, vec![Verb::Delete, Verb::Create]);
    assert!(mem.jobs.object("acme", JOB).unwrap().status.is_none());
}

#[tokio::test]
async fn failed_pre_delete_is_not_fatal() {
    let mem = MemoryCluster::new();
    mem.jobs.fail(Verb::Delete, None, ClusterError::Api { code: 403, reason: "Forbidden".into(), message: "no".into() });
    mem.job_events.push(WatchEvent::Applied(job_with("Complete", None)));

    assert!(orchestrator(&mem).run_build(&request()).await.is_ok());
}

#[tokio::test]
async fn submit_failure_skips_watch_and_logs() {
    let mem = MemoryCluster::new();
    mem.jobs.fail(Verb::Create, None, ClusterError::Transport("refused".into()));

    let err = orchestrator(&mem).run_build(&request()).await.unwrap_err();
    assert!(matches!(err.failure, BuildFailure::Submit(ClusterError::Transport(_))));
    assert!(mem.job_events.subscriptions().is_empty());
    assert!(mem.logs.requests().is_empty());
}

#[tokio::test]
async fn closed_stream_is_a_failure() {
    let mem = MemoryCluster::new();
    mem.pod_events.close();
    mem.job_events.close();

    let err = orchestrator(&mem).run_build(&request()).await.unwrap_err();
    assert_eq!(err.failure, BuildFailure::StreamClosed);
}

#[tokio::test]
async fn managed_services_are_rejected_before_any_cluster_call() {
    let mem = MemoryCluster::new();
    let req = BuildRequest::new(ServiceSpec::managed("cache", "acme", ManagedKind::Redis, "7"), REGISTRY);

    let err = orchestrator(&mem).run_build(&req).await.unwrap_err();
    assert!(matches!(err.failure, BuildFailure::Config(_)));
    assert!(mem.jobs.calls().is_empty());
}

/// Pod feed that plays a script over time, including transient stream errors.
struct ScriptedPods {
    gap: Duration,
}

#[async_trait::async_trait]
impl WatchApi<Pod> for ScriptedPods {
    async fn watch(&self, _namespace: &str, _selector: &Selector) -> Result<EventStream<Pod>, ClusterError> {
        let gap = self.gap;
        let s = async_stream::stream! {
            yield Ok(WatchEvent::Applied(pod_with(Some(waiting("fetch-source", "PodInitializing")), None)));
            tokio::time::sleep(gap).await;
            yield Err(ClusterError::Transport("watch reset".into()));
            tokio::time::sleep(gap).await;
            yield Ok(WatchEvent::Applied(pod_with(Some(exited("fetch-source", 0)), Some(waiting("build", "CreateContainerConfigError")))));
        };
        Ok(s.boxed())
    }
}

#[tokio::test(start_paused = true)]
async fn watch_errors_are_skipped_until_a_terminal_signal() {
    let mem = MemoryCluster::new();
    let mut cluster = mem.cluster();
    cluster.pod_events = Arc::new(ScriptedPods { gap: Duration::from_secs(30) });
    let orch = BuildOrchestrator::new(cluster, BuildSettings::default());

    let err = orch.run_build(&request()).await.unwrap_err();
    assert!(matches!(err.failure, BuildFailure::ContainerConfig { ref reason, .. } if reason == "CreateContainerConfigError"));
    assert_eq!(mem.job_events.active_subscriptions(), 0);
}

#[tokio::test(start_paused = true)]
async fn short_deadline_beats_a_slow_script() {
    let mem = MemoryCluster::new();
    let mut cluster = mem.cluster();
    cluster.pod_events = Arc::new(ScriptedPods { gap: Duration::from_secs(600) });
    let settings = BuildSettings { deadline: Duration::from_secs(60), ..Default::default() };
    let orch = BuildOrchestrator::new(cluster, settings);

    let err = orch.run_build(&request()).await.unwrap_err();
    assert_eq!(err.failure, BuildFailure::TimedOut(Duration::from_secs(60)));
    assert_eq!(err.failure.reason(), "timed_out");
}
