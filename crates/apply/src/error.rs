use std::time::Duration;

use keel_core::Phase;
use keel_kubehub::ClusterError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StepError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),
    #[error("pods of {name} still present after {waited:?}")]
    DrainTimeout { name: String, waited: Duration },
    #[error("{kind} {name} disappeared mid-update")]
    Vanished { kind: &'static str, name: String },
}

/// A fatal reconcile step, with what the rollback managed to undo.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{phase} step failed on {object}: {source}")]
pub struct ReconcileError {
    pub phase: Phase,
    pub object: String,
    #[source]
    pub source: StepError,
    /// `Kind/name` of every object deleted during rollback, in deletion order.
    pub rolled_back: Vec<String>,
    /// Rollback deletions that failed; logged, never raised.
    pub rollback_failures: Vec<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PortError {
    #[error("no free port left in {first}..={last}")]
    Exhausted { first: u16, last: u16 },
    #[error("port {port} is held by {holder}")]
    Taken { port: i32, holder: String },
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}
