//! Keel apply: converges a rendered topology onto the cluster.
//!
//! Objects are applied in dependency order (namespace, standalone claim, workload,
//! services, routes, autoscaler, template claim). A fatal failure deletes what this
//! invocation wrote, newest first, before the error is returned.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use keel_core::config::ApplySettings;
use keel_core::{Phase, ResourceNames};
use keel_kubehub::{Cluster, ClusterError, ObjectApi, Selector};
use keel_render::{selector_expr, ClaimOwner, ResourceTopology, Workload};
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{info, warn};

pub mod error;
pub mod namespace;
pub mod object;
pub mod ports;
pub mod stateful;
pub mod storage;

pub use error::{PortError, ReconcileError, StepError};
pub use namespace::{KubeNamespaces, MemoryNamespaces, NamespaceEnsurer};
pub use ports::{PortAllocator, PortPool, RangePortPool};
pub use stateful::Drain;

use object::{apply_object, live_hash, stamped, Reconcilable};
use storage::ClaimOutcome;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Created,
    Updated,
    Unchanged,
    Expanded,
    Deleted,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Created => "created",
            Action::Updated => "updated",
            Action::Unchanged => "unchanged",
            Action::Expanded => "expanded",
            Action::Deleted => "deleted",
        }
    }

    pub fn is_mutation(&self) -> bool { !matches!(self, Action::Unchanged) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ObjectKind {
    PersistentVolumeClaim,
    Deployment,
    StatefulSet,
    Service,
    Ingress,
    HorizontalPodAutoscaler,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::PersistentVolumeClaim => "PersistentVolumeClaim",
            ObjectKind::Deployment => "Deployment",
            ObjectKind::StatefulSet => "StatefulSet",
            ObjectKind::Service => "Service",
            ObjectKind::Ingress => "Ingress",
            ObjectKind::HorizontalPodAutoscaler => "HorizontalPodAutoscaler",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ObjectOutcome {
    pub kind: ObjectKind,
    pub name: String,
    pub action: Action,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub outcomes: Vec<ObjectOutcome>,
    /// Non-fatal problems; the deploy is usable regardless.
    pub warnings: Vec<String>,
}

impl ApplyReport {
    pub fn mutations(&self) -> usize { self.outcomes.iter().filter(|o| o.action.is_mutation()).count() }

    pub fn action_for(&self, kind: ObjectKind, name: &str) -> Option<Action> {
        self.outcomes.iter().find(|o| o.kind == kind && o.name == name).map(|o| o.action)
    }

    fn record(&mut self, kind: ObjectKind, name: &str, action: Action) {
        counter!("apply_objects", 1u64, "kind" => kind.as_str(), "action" => action.as_str());
        self.outcomes.push(ObjectOutcome { kind, name: name.to_string(), action });
    }

    fn warn(&mut self, message: String) {
        warn!(warning = %message, "apply warning");
        self.warnings.push(message);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeardownReport {
    pub deleted: Vec<String>,
}

/// What this invocation wrote, for rollback.
struct Written {
    kind: ObjectKind,
    name: String,
}

pub struct Reconciler {
    cluster: Cluster,
    namespaces: Arc<dyn NamespaceEnsurer>,
    drain: Drain,
}

impl Reconciler {
    pub fn new(cluster: Cluster, namespaces: Arc<dyn NamespaceEnsurer>, settings: &ApplySettings) -> Self {
        Self { cluster, namespaces, drain: Drain::from_settings(settings) }
    }

    pub fn with_drain(mut self, drain: Drain) -> Self {
        self.drain = drain;
        self
    }

    pub async fn apply(&self, topology: &ResourceTopology) -> Result<ApplyReport, ReconcileError> {
        let started = Instant::now();
        let ns = topology.namespace.as_str();
        let mut report = ApplyReport::default();
        let mut written: Vec<Written> = Vec::new();

        if let Err(e) = self.namespaces.ensure(ns).await {
            return Err(self.abort(ns, Phase::Namespace, ns, e.into(), written).await);
        }

        if let Some(vc) = topology.volume_claim.as_ref().filter(|vc| vc.owner == ClaimOwner::Standalone) {
            match storage::ensure_standalone(self.cluster.claims.as_ref(), ns, &vc.claim).await {
                Ok(outcome) => {
                    if outcome == ClaimOutcome::Created {
                        written.push(Written { kind: ObjectKind::PersistentVolumeClaim, name: vc.name().to_string() });
                    }
                    record_claim(&mut report, vc.name(), &outcome);
                }
                Err(e) => return Err(self.abort(ns, Phase::Storage, vc.name(), e.into(), written).await),
            }
        }

        let workload_name = topology.workload.name().to_string();
        let (kind, result) = match &topology.workload {
            Workload::Deployment(d) => {
                let applied = apply_object(self.cluster.deployments.as_ref(), ns, d).await;
                (ObjectKind::Deployment, applied.map(|(a, _)| a).map_err(StepError::from))
            }
            Workload::StatefulSet(s) => (ObjectKind::StatefulSet, self.apply_stateful_set(topology, s).await),
        };
        match result {
            Ok(action) => {
                if action.is_mutation() { written.push(Written { kind, name: workload_name.clone() }); }
                report.record(kind, &workload_name, action);
            }
            Err(e) => return Err(self.abort(ns, Phase::Workload, &workload_name, e, written).await),
        }
        self.remove_stale_workload(topology, &mut report).await;

        for svc in &topology.services {
            let name = svc.metadata.name.clone().unwrap_or_default();
            match apply_object(self.cluster.services.as_ref(), ns, svc).await {
                Ok((action, _)) => {
                    if action.is_mutation() { written.push(Written { kind: ObjectKind::Service, name: name.clone() }); }
                    report.record(ObjectKind::Service, &name, action);
                }
                Err(e) => return Err(self.abort(ns, Phase::Network, &name, e.into(), written).await),
            }
        }

        for route in &topology.routes {
            let name = route.metadata.name.clone().unwrap_or_default();
            match apply_object(self.cluster.ingresses.as_ref(), ns, route).await {
                Ok((action, _)) => {
                    if action.is_mutation() { written.push(Written { kind: ObjectKind::Ingress, name: name.clone() }); }
                    report.record(ObjectKind::Ingress, &name, action);
                }
                Err(e) => return Err(self.abort(ns, Phase::Route, &name, e.into(), written).await),
            }
        }

        self.prune::<Service>(ns, &topology.names, ObjectKind::Service, &topology.services, &mut report).await;
        self.prune::<Ingress>(ns, &topology.names, ObjectKind::Ingress, &topology.routes, &mut report).await;
        self.apply_autoscaler(topology, &mut report).await;

        if let Some(vc) = topology.volume_claim.as_ref().filter(|vc| vc.owner == ClaimOwner::Template) {
            if let Some(size) = vc.requested_storage() {
                match storage::expand_template_claim(self.cluster.claims.as_ref(), ns, vc.name(), size).await {
                    Ok(outcome) => record_claim(&mut report, vc.name(), &outcome),
                    Err(e) => report.warn(format!("expanding claim {}: {}", vc.name(), e)),
                }
            }
        }

        histogram!("apply_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(
            ns = %ns,
            service = %topology.names.base,
            mutations = report.mutations(),
            warnings = report.warnings.len(),
            "topology applied"
        );
        Ok(report)
    }

    async fn apply_stateful_set(
        &self,
        topology: &ResourceTopology,
        desired: &k8s_openapi::api::apps::v1::StatefulSet,
    ) -> Result<Action, StepError> {
        let ns = topology.namespace.as_str();
        let api = self.cluster.stateful_sets.as_ref();
        let name = desired.metadata.name.clone().unwrap_or_default();
        match api.get(ns, &name).await? {
            None => Ok(apply_object(api, ns, desired).await?.0),
            Some(live) => {
                let (obj, hash) = stamped(desired);
                if live_hash(&live) == Some(hash.as_str()) {
                    return Ok(Action::Unchanged);
                }
                let selector = Selector::labels(selector_expr(&topology.names));
                stateful::roll(&self.cluster, ns, &obj, &selector, self.drain).await?;
                Ok(Action::Updated)
            }
        }
    }

    /// A service that switched workload kind leaves its old workload behind.
    async fn remove_stale_workload(&self, topology: &ResourceTopology, report: &mut ApplyReport) {
        let ns = topology.namespace.as_str();
        let name = topology.workload.name();
        let result = match &topology.workload {
            Workload::Deployment(_) => delete_if_present(self.cluster.stateful_sets.as_ref(), ns, name).await,
            Workload::StatefulSet(_) => delete_if_present(self.cluster.deployments.as_ref(), ns, name).await,
        };
        let stale_kind = match &topology.workload {
            Workload::Deployment(_) => ObjectKind::StatefulSet,
            Workload::StatefulSet(_) => ObjectKind::Deployment,
        };
        match result {
            Ok(true) => report.record(stale_kind, name, Action::Deleted),
            Ok(false) => {}
            Err(e) => report.warn(format!("deleting stale {} {}: {}", stale_kind.as_str(), name, e)),
        }
    }

    async fn apply_autoscaler(&self, topology: &ResourceTopology, report: &mut ApplyReport) {
        let ns = topology.namespace.as_str();
        let api = self.cluster.autoscalers.as_ref();
        let name = topology.names.autoscaler();
        match &topology.autoscaler {
            Some(hpa) => match apply_object(api, ns, hpa).await {
                Ok((action, _)) => report.record(ObjectKind::HorizontalPodAutoscaler, name, action),
                Err(e) => report.warn(format!("applying autoscaler {}: {}", name, e)),
            },
            None => match delete_if_present(api, ns, name).await {
                Ok(true) => report.record(ObjectKind::HorizontalPodAutoscaler, name, Action::Deleted),
                Ok(false) => {}
                Err(e) => report.warn(format!("deleting autoscaler {}: {}", name, e)),
            },
        }
    }

    /// Delete objects of this service that the topology no longer names.
    async fn prune<K>(&self, ns: &str, names: &ResourceNames, kind: ObjectKind, desired: &[K], report: &mut ApplyReport)
    where
        K: Reconcilable,
        Cluster: HasApi<K>,
    {
        let api = <Cluster as HasApi<K>>::api(&self.cluster);
        let keep: Vec<&str> = desired.iter().filter_map(|o| o.meta().name.as_deref()).collect();
        let live = match api.list(ns, &Selector::labels(selector_expr(names))).await {
            Ok(live) => live,
            Err(e) => {
                report.warn(format!("listing {} objects: {}", kind.as_str(), e));
                return;
            }
        };
        for obj in live {
            let Some(name) = obj.meta().name.clone() else { continue };
            if keep.contains(&name.as_str()) { continue; }
            match api.delete(ns, &name).await {
                Ok(_) => report.record(kind, &name, Action::Deleted),
                Err(e) => report.warn(format!("deleting stale {} {}: {}", kind.as_str(), name, e)),
            }
        }
    }

    async fn abort(
        &self,
        ns: &str,
        phase: Phase,
        object: &str,
        source: StepError,
        written: Vec<Written>,
    ) -> ReconcileError {
        warn!(ns = %ns, phase = %phase, object = %object, error = %source, "reconcile failed; rolling back");
        counter!("apply_rollbacks", 1u64, "phase" => phase.as_str());
        let mut rolled_back = Vec::new();
        let mut rollback_failures = Vec::new();
        for w in written.iter().rev() {
            let label = format!("{}/{}", w.kind.as_str(), w.name);
            match self.delete(w.kind, ns, &w.name).await {
                Ok(_) => rolled_back.push(label),
                Err(e) => {
                    warn!(ns = %ns, object = %label, error = %e, "rollback delete failed");
                    rollback_failures.push(format!("{}: {}", label, e));
                }
            }
        }
        ReconcileError { phase, object: object.to_string(), source, rolled_back, rollback_failures }
    }

    async fn delete(&self, kind: ObjectKind, ns: &str, name: &str) -> Result<bool, ClusterError> {
        match kind {
            ObjectKind::PersistentVolumeClaim => self.cluster.claims.delete(ns, name).await,
            ObjectKind::Deployment => self.cluster.deployments.delete(ns, name).await,
            ObjectKind::StatefulSet => self.cluster.stateful_sets.delete(ns, name).await,
            ObjectKind::Service => self.cluster.services.delete(ns, name).await,
            ObjectKind::Ingress => self.cluster.ingresses.delete(ns, name).await,
            ObjectKind::HorizontalPodAutoscaler => self.cluster.autoscalers.delete(ns, name).await,
        }
    }

    /// Remove every object of a service. Claims are kept unless `purge_storage`.
    pub async fn teardown(
        &self,
        ns: &str,
        names: &ResourceNames,
        purge_storage: bool,
    ) -> Result<TeardownReport, ClusterError> {
        let selector = Selector::labels(selector_expr(names));
        let mut report = TeardownReport::default();
        let mut targets: Vec<(ObjectKind, String)> = Vec::new();
        for ing in self.cluster.ingresses.list(ns, &selector).await? {
            targets.extend(ing.metadata.name.map(|n| (ObjectKind::Ingress, n)));
        }
        for svc in self.cluster.services.list(ns, &selector).await? {
            targets.extend(svc.metadata.name.map(|n| (ObjectKind::Service, n)));
        }
        targets.push((ObjectKind::HorizontalPodAutoscaler, names.autoscaler().to_string()));
        targets.push((ObjectKind::Deployment, names.workload().to_string()));
        targets.push((ObjectKind::StatefulSet, names.workload().to_string()));
        if purge_storage {
            for pvc in self.cluster.claims.list(ns, &selector).await? {
                targets.extend(pvc.metadata.name.map(|n| (ObjectKind::PersistentVolumeClaim, n)));
            }
        }
        for (kind, name) in targets {
            if self.delete(kind, ns, &name).await? {
                report.deleted.push(format!("{}/{}", kind.as_str(), name));
            }
        }
        info!(ns = %ns, service = %names.base, deleted = report.deleted.len(), "service torn down");
        Ok(report)
    }
}

fn record_claim(report: &mut ApplyReport, name: &str, outcome: &ClaimOutcome) {
    let action = match outcome {
        ClaimOutcome::Created => Action::Created,
        ClaimOutcome::Expanded { .. } => Action::Expanded,
        ClaimOutcome::ShrinkIgnored { live, desired } => {
            report.warn(format!("claim {} stays at {}; shrinking to {} is not supported", name, live, desired));
            Action::Unchanged
        }
        ClaimOutcome::Unchanged | ClaimOutcome::Pending => Action::Unchanged,
    };
    report.record(ObjectKind::PersistentVolumeClaim, name, action);
}

async fn delete_if_present<K: Send + Sync + 'static>(
    api: &dyn ObjectApi<K>,
    ns: &str,
    name: &str,
) -> Result<bool, ClusterError> {
    match api.get(ns, name).await? {
        Some(_) => api.delete(ns, name).await,
        None => Ok(false),
    }
}

/// Typed access to the per-kind handle in a `Cluster`.
pub trait HasApi<K: Send + Sync + 'static> {
    fn api(&self) -> &dyn ObjectApi<K>;
}

impl HasApi<Service> for Cluster {
    fn api(&self) -> &dyn ObjectApi<Service> { self.services.as_ref() }
}

impl HasApi<Ingress> for Cluster {
    fn api(&self) -> &dyn ObjectApi<Ingress> { self.ingresses.as_ref() }
}
