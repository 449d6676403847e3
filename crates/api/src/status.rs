//! Deploy status as reported to whoever tracks services.

use std::sync::Mutex;

use keel_core::{Phase, ServiceId};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DeployStatus {
    Building,
    Running {
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        warnings: Vec<String>,
    },
    Failed { phase: Phase, reason: String },
    Removed,
}

impl DeployStatus {
    pub fn is_terminal(&self) -> bool { !matches!(self, DeployStatus::Building) }
}

/// Receives every status transition of every service.
#[async_trait::async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish(&self, service: &ServiceId, status: &DeployStatus);
}

/// Writes transitions to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusSink;

#[async_trait::async_trait]
impl StatusSink for LogStatusSink {
    async fn publish(&self, service: &ServiceId, status: &DeployStatus) {
        match status {
            DeployStatus::Failed { phase, reason } => info!(service = %service, phase = %phase, reason = %reason, "status failed"),
            DeployStatus::Running { warnings } => info!(service = %service, warnings = warnings.len(), "status running"),
            other => info!(service = %service, status = ?other, "status"),
        }
    }
}

/// Keeps the full transition history, for tests and single-process callers.
#[derive(Debug, Default)]
pub struct MemoryStatusSink {
    history: Mutex<Vec<(ServiceId, DeployStatus)>>,
}

impl MemoryStatusSink {
    pub fn new() -> Self { Self::default() }

    pub fn history(&self, service: &ServiceId) -> Vec<DeployStatus> {
        let history = self.history.lock().unwrap_or_else(|p| p.into_inner());
        history.iter().filter(|(id, _)| id == service).map(|(_, s)| s.clone()).collect()
    }

    pub fn latest(&self, service: &ServiceId) -> Option<DeployStatus> { self.history(service).pop() }
}

#[async_trait::async_trait]
impl StatusSink for MemoryStatusSink {
    async fn publish(&self, service: &ServiceId, status: &DeployStatus) {
        self.history.lock().unwrap_or_else(|p| p.into_inner()).push((service.clone(), status.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_wire_shape() {
        let failed = DeployStatus::Failed { phase: Phase::Build, reason: "image_pull".into() };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json, serde_json::json!({"state": "failed", "phase": "build", "reason": "image_pull"}));
        let running = serde_json::to_value(DeployStatus::Running { warnings: vec![] }).unwrap();
        assert_eq!(running, serde_json::json!({"state": "running"}));
        assert!(!DeployStatus::Building.is_terminal());
    }

    #[tokio::test]
    async fn memory_sink_keeps_history_per_service() {
        let sink = MemoryStatusSink::new();
        let a = ServiceId::new("a");
        sink.publish(&a, &DeployStatus::Building).await;
        sink.publish(&ServiceId::new("b"), &DeployStatus::Building).await;
        sink.publish(&a, &DeployStatus::Running { warnings: vec![] }).await;
        assert_eq!(sink.history(&a).len(), 2);
        assert_eq!(sink.latest(&a), Some(DeployStatus::Running { warnings: vec![] }));
    }
}
