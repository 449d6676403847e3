use std::time::Duration;

use keel_core::ConfigError;
use keel_kubehub::ClusterError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a build did not produce an image.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum BuildFailure {
    #[error("cannot pull image for {container}: {reason}{}", fmt_message(.message))]
    ImagePull { container: String, reason: String, message: Option<String> },
    #[error("container {container} misconfigured: {reason}{}", fmt_message(.message))]
    ContainerConfig { container: String, reason: String, message: Option<String> },
    #[error("container {container} is crash looping")]
    CrashLoop { container: String },
    #[error("container {container} restarted {restarts} times")]
    RestartLimit { container: String, restarts: i32 },
    #[error("build descriptor {descriptor} not found in repository")]
    MissingBuildDescriptor { descriptor: String },
    #[error("fetching source failed with exit code {exit_code}{}", fmt_message(.message))]
    SourceFetch { exit_code: i32, message: Option<String> },
    #[error("job failed: {reason}{}", fmt_message(.message))]
    JobFailed { reason: String, message: Option<String> },
    #[error("build did not finish within {0:?}")]
    TimedOut(Duration),
    #[error("watch stream ended before the build finished")]
    StreamClosed,
    #[error("watch subscription failed: {0}")]
    Watch(ClusterError),
    #[error("submitting build job: {0}")]
    Submit(ClusterError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn fmt_message(message: &Option<String>) -> String {
    match message {
        Some(m) if !m.is_empty() => format!(" ({})", m),
        _ => String::new(),
    }
}

impl BuildFailure {
    /// Short machine-readable reason for status reporting and metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            BuildFailure::ImagePull { .. } => "image_pull",
            BuildFailure::ContainerConfig { .. } => "container_config",
            BuildFailure::CrashLoop { .. } => "crash_loop",
            BuildFailure::RestartLimit { .. } => "restart_limit",
            BuildFailure::MissingBuildDescriptor { .. } => "missing_build_descriptor",
            BuildFailure::SourceFetch { .. } => "source_fetch",
            BuildFailure::JobFailed { .. } => "job_failed",
            BuildFailure::TimedOut(_) => "timed_out",
            BuildFailure::StreamClosed => "stream_closed",
            BuildFailure::Watch(_) => "watch",
            BuildFailure::Submit(_) => "submit",
            BuildFailure::Config(_) => "config",
        }
    }

    /// Failures raised before a job existed have no pod logs to collect.
    pub fn has_job(&self) -> bool { !matches!(self, BuildFailure::Config(_) | BuildFailure::Submit(_)) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerLog {
    pub pod: String,
    pub container: String,
    pub text: String,
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("build {job} failed: {failure}")]
pub struct BuildError {
    #[source]
    pub failure: BuildFailure,
    pub image: String,
    pub job: String,
    /// Bounded tails of the build containers, when any could be read.
    pub logs: Vec<ContainerLog>,
}

impl BuildError {
    pub fn config(err: ConfigError) -> Self {
        Self { failure: BuildFailure::Config(err), image: String::new(), job: String::new(), logs: Vec::new() }
    }
}
