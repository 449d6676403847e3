//! Keel core types: the service model every other crate renders, builds and reconciles.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

pub mod config;
pub mod error;
pub mod managed;
pub mod model;
pub mod naming;
pub mod quantity;

pub use config::EngineConfig;
pub use error::ConfigError;
pub use managed::{Endpoint, ManagedKind, Protocol};
pub use model::{GitSource, ManagedSource, ReplicaPolicy, ResourceLimits, ServiceId, ServiceSpec, Source};
pub use naming::ResourceNames;

pub mod prelude {
    pub use super::{
        ConfigError, EngineConfig, Endpoint, GitSource, ManagedKind, ManagedSource, Phase, Protocol, ReplicaPolicy,
        ResourceLimits, ResourceNames, ServiceId, ServiceSpec, Source,
    };
}

/// Label carried by every object Keel manages.
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_KEEL: &str = "keel";
/// Selector label; value is the derived base resource name.
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_SERVICE: &str = "keel.dev/service";
pub const LABEL_ROLE: &str = "keel.dev/role";
pub const ANNOTATION_SPEC_HASH: &str = "keel.dev/spec-hash";
pub const ANNOTATION_DISPLAY_NAME: &str = "keel.dev/display-name";

/// Which step of a deploy produced a failure.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Validate,
    Build,
    Ports,
    Namespace,
    Storage,
    Workload,
    Network,
    Route,
    Autoscaler,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Validate => "validate",
            Phase::Build => "build",
            Phase::Ports => "ports",
            Phase::Namespace => "namespace",
            Phase::Storage => "storage",
            Phase::Workload => "workload",
            Phase::Network => "network",
            Phase::Route => "route",
            Phase::Autoscaler => "autoscaler",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
