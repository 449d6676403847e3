//! Keel build: submit a single-shot image build job and watch it to a classified outcome.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use keel_core::config::BuildSettings;
use keel_core::naming::namespace_for_tenant;
use keel_core::{ConfigError, GitSource, ResourceNames, ServiceSpec, Source};
use keel_kubehub::Cluster;
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub mod error;
pub mod image;
pub mod job;
pub mod logs;
pub mod watch;

pub use error::{BuildError, BuildFailure, ContainerLog};

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub service: ServiceSpec,
    /// Overrides the commit pinned in the service source.
    pub commit: Option<String>,
    pub registry: String,
}

impl BuildRequest {
    pub fn new(service: ServiceSpec, registry: impl Into<String>) -> Self {
        Self { service, commit: None, registry: registry.into() }
    }

    fn git(&self) -> Result<&GitSource, ConfigError> {
        match &self.service.source {
            Source::Git(git) => Ok(git),
            Source::Managed(_) => Err(ConfigError::Invalid {
                field: "source",
                reason: "managed services run a published image and are never built".into(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildArtifact {
    pub image: String,
    pub job: String,
    pub namespace: String,
    #[serde(skip)]
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Created,
    Submitted,
    Watching,
    Succeeded,
    Failed,
    TimedOut,
}

impl fmt::Display for BuildState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BuildState::Created => "created",
            BuildState::Submitted => "submitted",
            BuildState::Watching => "watching",
            BuildState::Succeeded => "succeeded",
            BuildState::Failed => "failed",
            BuildState::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

struct Run<'a> {
    job: &'a str,
    state: BuildState,
}

impl Run<'_> {
    fn advance(&mut self, next: BuildState) {
        debug!(job = %self.job, from = %self.state, to = %next, "build state");
        self.state = next;
    }
}

#[derive(Clone)]
pub struct BuildOrchestrator {
    cluster: Cluster,
    settings: BuildSettings,
}

impl BuildOrchestrator {
    pub fn new(cluster: Cluster, settings: BuildSettings) -> Self { Self { cluster, settings } }

    pub fn settings(&self) -> &BuildSettings { &self.settings }

    /// Build and push the service image. No retries: one job, one outcome.
    pub async fn run_build(&self, req: &BuildRequest) -> Result<BuildArtifact, BuildError> {
        let git = req.git().map_err(BuildError::config)?;
        req.service.validate().map_err(BuildError::config)?;
        if req.registry.trim().is_empty() {
            return Err(BuildError::config(ConfigError::Empty { field: "registry" }));
        }

        let started = Instant::now();
        let names = ResourceNames::for_service(&req.service.id);
        let namespace = namespace_for_tenant(&req.service.tenant);
        let commit = req.commit.as_deref().or(git.commit.as_deref()).map(str::trim).filter(|c| !c.is_empty());
        let tag = image::tag_for(commit);
        let image = image::image_reference(&req.registry, &names, commit);
        let job_name = names.build_job(&tag);
        let mut run = Run { job: &job_name, state: BuildState::Created };
        let fail = |failure: BuildFailure| BuildError {
            failure,
            image: image.clone(),
            job: job_name.clone(),
            logs: Vec::new(),
        };

        counter!("build_started", 1u64);
        info!(ns = %namespace, job = %job_name, image = %image, "build starting");

        // A finished job with the same name would make the create fail.
        match self.cluster.jobs.delete(&namespace, &job_name).await {
            Ok(true) => info!(ns = %namespace, job = %job_name, "deleted previous build job"),
            Ok(false) => {}
            Err(e) => warn!(ns = %namespace, job = %job_name, error = %e, "could not delete previous build job"),
        }

        let plan = job::JobPlan {
            namespace: &namespace,
            job_name: &job_name,
            names: &names,
            source: git,
            commit,
            build_args: &req.service.build_args,
            image: &image,
            registry: &req.registry,
        };
        let manifest = job::build_job(&plan, &self.settings);
        let submitted = match self.cluster.jobs.create(&namespace, &manifest).await {
            Ok(j) => j,
            Err(e) => {
                let err = fail(BuildFailure::Submit(e));
                record_failure(&err, started);
                run.advance(BuildState::Failed);
                return Err(err);
            }
        };
        run.advance(BuildState::Submitted);

        let target = watch::Target { namespace: &namespace, job: &job_name, uid: submitted.metadata.uid.as_deref() };
        let rules = watch::PodRules { descriptor: &git.build_descriptor, restart_threshold: self.settings.restart_threshold };
        run.advance(BuildState::Watching);
        let watched = watch::watch_job(&self.cluster, &target, &rules, started, self.settings.deadline).await;

        match watched.outcome {
            Ok(()) => {
                run.advance(BuildState::Succeeded);
                let elapsed = started.elapsed();
                histogram!("build_latency_ms", elapsed.as_secs_f64() * 1000.0);
                info!(ns = %namespace, job = %job_name, image = %image, elapsed_ms = elapsed.as_millis() as u64, "build succeeded");
                Ok(BuildArtifact { image, job: job_name.clone(), namespace, elapsed })
            }
            Err(failure) => {
                run.advance(if matches!(failure, BuildFailure::TimedOut(_)) {
                    BuildState::TimedOut
                } else {
                    BuildState::Failed
                });
                let mut err = fail(failure);
                if err.failure.has_job() {
                    err.logs = logs::collect(&self.cluster, &target, &watched.pods, &self.settings).await;
                }
                record_failure(&err, started);
                Err(err)
            }
        }
    }
}

fn record_failure(err: &BuildError, started: Instant) {
    counter!("build_failed", 1u64, "reason" => err.failure.reason());
    histogram!("build_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
    warn!(job = %err.job, reason = err.failure.reason(), error = %err.failure, logs = err.logs.len(), "build failed");
}
