//! Keel public API façade (in-process).
//!
//! Frontends (the CLI today) depend on the `DeployApi` trait. `InProcDeployer` runs the
//! whole pipeline in the caller's process: build, render, reconcile, report status.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use keel_apply::{ApplyReport, Drain, NamespaceEnsurer, PortAllocator, RangePortPool, ReconcileError, Reconciler, TeardownReport};
use keel_build::{BuildError, BuildOrchestrator, BuildRequest, ContainerLog};
use keel_core::config::{BuildSettings, RenderSettings};
use keel_core::naming::namespace_for_tenant;
use keel_core::{EngineConfig, Phase, ResourceNames, ServiceId, ServiceSpec, Source};
use k8s_openapi::api::core::v1::Service;
use keel_kubehub::{Cluster, ObjectApi};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub mod status;

pub use status::{DeployStatus, LogStatusSink, MemoryStatusSink, StatusSink};

/// A failed deploy, attributed to the pipeline step that failed.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize, PartialEq)]
#[error("{phase}: {message}")]
pub struct DeployError {
    pub phase: Phase,
    pub message: String,
    /// Build container output, when the build step failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<ContainerLog>,
}

impl DeployError {
    pub fn new(phase: Phase, message: impl Into<String>) -> Self {
        Self { phase, message: message.into(), logs: Vec::new() }
    }
}

impl From<BuildError> for DeployError {
    fn from(e: BuildError) -> Self {
        let phase = match e.failure {
            keel_build::BuildFailure::Config(_) => Phase::Validate,
            _ => Phase::Build,
        };
        Self { phase, message: e.failure.to_string(), logs: e.logs }
    }
}

impl From<ReconcileError> for DeployError {
    fn from(e: ReconcileError) -> Self { Self::new(e.phase, e.to_string()) }
}

pub type DeployResult<T> = Result<T, DeployError>;

#[derive(Debug, Clone, Serialize)]
pub struct DeployReport {
    pub service: ServiceId,
    pub namespace: String,
    pub image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_job: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_port: Option<i32>,
    pub apply: ApplyReport,
}

/// Declarative deploy surface.
#[async_trait::async_trait]
pub trait DeployApi: Send + Sync {
    /// Bring the cluster to the state `spec` describes, building first when needed.
    async fn deploy(&self, spec: &ServiceSpec) -> DeployResult<DeployReport>;

    /// Remove the service's objects. Storage survives unless `purge_storage`.
    async fn teardown(&self, spec: &ServiceSpec, purge_storage: bool) -> DeployResult<TeardownReport>;
}

// ----------------- In-process implementation -----------------

pub struct InProcDeployer {
    services: Arc<dyn ObjectApi<Service>>,
    namespaces: Arc<dyn NamespaceEnsurer>,
    builds: BuildOrchestrator,
    reconciler: Reconciler,
    ports: Arc<PortAllocator>,
    render: RenderSettings,
    status: Arc<dyn StatusSink>,
}

impl InProcDeployer {
    pub fn new(
        cluster: Cluster,
        namespaces: Arc<dyn NamespaceEnsurer>,
        config: &EngineConfig,
        status: Arc<dyn StatusSink>,
    ) -> Self {
        let pool = Arc::new(RangePortPool::new(config.ports));
        Self {
            builds: BuildOrchestrator::new(cluster.clone(), config.build.clone()),
            reconciler: Reconciler::new(cluster.clone(), namespaces.clone(), &config.apply),
            ports: Arc::new(PortAllocator::new(cluster.services.clone(), pool)),
            render: config.render.clone(),
            services: cluster.services.clone(),
            namespaces,
            status,
        }
    }

    /// Share one allocator between deployers of the same cluster.
    pub fn with_ports(mut self, ports: Arc<PortAllocator>) -> Self {
        self.ports = ports;
        self
    }

    pub fn with_drain(mut self, drain: Drain) -> Self {
        self.reconciler = self.reconciler.with_drain(drain);
        self
    }

    pub fn build_settings(&self) -> &BuildSettings { self.builds.settings() }

    async fn fail(&self, id: &ServiceId, err: DeployError, started: Instant) -> DeployError {
        counter!("deploys", 1u64, "outcome" => "failed", "phase" => err.phase.as_str());
        histogram!("deploy_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        warn!(service = %id, phase = %err.phase, error = %err.message, "deploy failed");
        let status = DeployStatus::Failed { phase: err.phase, reason: err.message.clone() };
        self.status.publish(id, &status).await;
        err
    }

    /// After a failed apply the port is only kept if its public Service survived.
    async fn release_unused_port(&self, namespace: &str, names: &ResourceNames, id: &ServiceId) {
        match self.services.get(namespace, &names.public_service()).await {
            Ok(Some(_)) => {}
            Ok(None) => self.ports.release(namespace, id).await,
            Err(e) => warn!(service = %id, error = %e, "keeping port; public service state unknown"),
        }
    }

    async fn run(&self, spec: &ServiceSpec) -> DeployResult<DeployReport> {
        let names = ResourceNames::for_service(&spec.id);
        let namespace = namespace_for_tenant(&spec.tenant);

        // The build job runs in the tenant namespace, so it has to exist first.
        self.namespaces
            .ensure(&namespace)
            .await
            .map_err(|e| DeployError::new(Phase::Namespace, e.to_string()))?;

        let (image, build_job, public_port) = match &spec.source {
            Source::Git(_) => {
                let req = BuildRequest::new(spec.clone(), self.builds.settings().registry.clone());
                let artifact = self.builds.run_build(&req).await?;
                (artifact.image, Some(artifact.job), None)
            }
            Source::Managed(m) => {
                let port = if m.expose_tcp {
                    let port = self
                        .ports
                        .resolve(&namespace, &names, &spec.id)
                        .await
                        .map_err(|e| DeployError::new(Phase::Ports, e.to_string()))?;
                    Some(port)
                } else {
                    None
                };
                (m.kind.image(&m.version), None, port)
            }
        };

        let topology = keel_render::render(spec, &image, public_port, &self.render)
            .map_err(|e| DeployError::new(Phase::Validate, e.to_string()))?;
        let apply = match self.reconciler.apply(&topology).await {
            Ok(report) => report,
            Err(e) => {
                if public_port.is_some() {
                    self.release_unused_port(&namespace, &names, &spec.id).await;
                }
                return Err(e.into());
            }
        };
        Ok(DeployReport { service: spec.id.clone(), namespace, image, build_job, public_port, apply })
    }
}

#[async_trait::async_trait]
impl DeployApi for InProcDeployer {
    async fn deploy(&self, spec: &ServiceSpec) -> DeployResult<DeployReport> {
        let started = Instant::now();
        if let Err(e) = spec.validate() {
            return Err(self.fail(&spec.id, DeployError::new(Phase::Validate, e.to_string()), started).await);
        }
        self.status.publish(&spec.id, &DeployStatus::Building).await;
        info!(service = %spec.id, tenant = %spec.tenant, "deploy started");

        match self.run(spec).await {
            Ok(report) => {
                counter!("deploys", 1u64, "outcome" => "running");
                histogram!("deploy_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
                info!(
                    service = %spec.id,
                    image = %report.image,
                    mutations = report.apply.mutations(),
                    warnings = report.apply.warnings.len(),
                    "deploy running"
                );
                let status = DeployStatus::Running { warnings: report.apply.warnings.clone() };
                self.status.publish(&spec.id, &status).await;
                Ok(report)
            }
            Err(e) => Err(self.fail(&spec.id, e, started).await),
        }
    }

    async fn teardown(&self, spec: &ServiceSpec, purge_storage: bool) -> DeployResult<TeardownReport> {
        let names = ResourceNames::for_service(&spec.id);
        let namespace = namespace_for_tenant(&spec.tenant);
        let report = self
            .reconciler
            .teardown(&namespace, &names, purge_storage)
            .await
            .map_err(|e| DeployError::new(Phase::Workload, e.to_string()))?;
        self.ports.release(&namespace, &spec.id).await;
        self.status.publish(&spec.id, &DeployStatus::Removed).await;
        Ok(report)
    }
}
