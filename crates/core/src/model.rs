//! The declarative description of a deployable unit.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::managed::{Endpoint, ManagedKind, Protocol};
use crate::quantity;

/// Stable identity of a service. Immutable; every derived object name comes from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct ServiceId(String);

impl ServiceId {
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}

impl std::fmt::Display for ServiceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for ServiceId {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GitSource {
    pub url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Pinned commit; when absent the branch head is built and tagged `latest`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    /// Path of the build descriptor relative to the repository root.
    #[serde(default = "default_build_descriptor")]
    pub build_descriptor: String,
}

fn default_branch() -> String { "main".to_string() }
fn default_build_descriptor() -> String { "Dockerfile".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManagedSource {
    pub kind: ManagedKind,
    #[serde(default)]
    pub version: String,
    /// Publish the primary endpoint on an externally routable port.
    #[serde(default)]
    pub expose_tcp: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Source {
    Git(GitSource),
    Managed(ManagedSource),
}

/// `{static: 2}` or `{autoscaled: [2, 5]}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "ReplicaRepr", into = "ReplicaRepr")]
pub enum ReplicaPolicy {
    Static(u32),
    Autoscaled(u32, u32),
}

// Single-key map form; plain struct so JSON and YAML read it the same way.
#[derive(Serialize, Deserialize)]
struct ReplicaRepr {
    #[serde(rename = "static", default, skip_serializing_if = "Option::is_none")]
    fixed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    autoscaled: Option<[u32; 2]>,
}

impl TryFrom<ReplicaRepr> for ReplicaPolicy {
    type Error = String;

    fn try_from(r: ReplicaRepr) -> Result<Self, Self::Error> {
        match (r.fixed, r.autoscaled) {
            (Some(n), None) => Ok(ReplicaPolicy::Static(n)),
            (None, Some([min, max])) => Ok(ReplicaPolicy::Autoscaled(min, max)),
            (None, None) => Err("replicas needs either `static` or `autoscaled`".to_string()),
            (Some(_), Some(_)) => Err("replicas cannot be both `static` and `autoscaled`".to_string()),
        }
    }
}

impl From<ReplicaPolicy> for ReplicaRepr {
    fn from(p: ReplicaPolicy) -> Self {
        match p {
            ReplicaPolicy::Static(n) => ReplicaRepr { fixed: Some(n), autoscaled: None },
            ReplicaPolicy::Autoscaled(min, max) => ReplicaRepr { fixed: None, autoscaled: Some([min, max]) },
        }
    }
}

impl Default for ReplicaPolicy {
    fn default() -> Self { ReplicaPolicy::Static(1) }
}

impl ReplicaPolicy {
    /// Replica count written into the workload; the autoscaler owns it afterwards.
    pub fn initial_replicas(&self) -> u32 {
        match *self {
            ReplicaPolicy::Static(n) => n,
            ReplicaPolicy::Autoscaled(min, _) => min,
        }
    }

    pub fn is_autoscaled(&self) -> bool { matches!(self, ReplicaPolicy::Autoscaled(..)) }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceSpec {
    pub id: ServiceId,
    #[serde(default)]
    pub display_name: String,
    pub tenant: String,
    pub source: Source,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub replicas: ReplicaPolicy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub build_args: BTreeMap<String, String>,
    #[serde(default)]
    pub domains: Vec<String>,
}

fn default_port() -> u16 { 8080 }

impl ServiceSpec {
    /// A git-sourced service with defaults; mostly useful for tests and the CLI.
    pub fn git(id: &str, tenant: &str, url: &str) -> Self {
        Self {
            id: ServiceId::new(id),
            display_name: id.to_string(),
            tenant: tenant.to_string(),
            source: Source::Git(GitSource {
                url: url.to_string(),
                branch: default_branch(),
                commit: None,
                build_descriptor: default_build_descriptor(),
            }),
            port: default_port(),
            resources: ResourceLimits::default(),
            replicas: ReplicaPolicy::default(),
            storage: None,
            env: BTreeMap::new(),
            build_args: BTreeMap::new(),
            domains: Vec::new(),
        }
    }

    pub fn managed(id: &str, tenant: &str, kind: ManagedKind, version: &str) -> Self {
        Self {
            source: Source::Managed(ManagedSource { kind, version: version.to_string(), expose_tcp: false }),
            port: kind.primary_endpoint().port,
            ..Self::git(id, tenant, "")
        }
    }

    pub fn managed_kind(&self) -> Option<ManagedKind> {
        match &self.source {
            Source::Managed(m) => Some(m.kind),
            Source::Git(_) => None,
        }
    }

    /// Storage size the service needs, if any: declared size, or the kind default
    /// for managed kinds that always persist.
    pub fn storage_size(&self) -> Option<String> {
        match (&self.storage, self.managed_kind()) {
            (Some(s), _) => Some(s.clone()),
            (None, Some(kind)) if kind.requires_storage() => Some(kind.default_storage().to_string()),
            _ => None,
        }
    }

    /// Stable-identity workloads back data-bearing managed services.
    pub fn needs_stable_identity(&self) -> bool {
        self.managed_kind().is_some() && self.storage_size().is_some()
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        match self.managed_kind() {
            Some(kind) => kind.endpoints(),
            None => vec![Endpoint::new("http", self.port, Protocol::Http, true)],
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.as_str().trim().is_empty() { return Err(ConfigError::Empty { field: "id" }); }
        if self.tenant.trim().is_empty() { return Err(ConfigError::Empty { field: "tenant" }); }
        match &self.source {
            Source::Git(git) => {
                if git.url.trim().is_empty() { return Err(ConfigError::Empty { field: "source.url" }); }
                if git.branch.trim().is_empty() { return Err(ConfigError::Empty { field: "source.branch" }); }
                if git.build_descriptor.trim().is_empty() {
                    return Err(ConfigError::Empty { field: "source.build_descriptor" });
                }
                if self.port == 0 {
                    return Err(ConfigError::Invalid { field: "port", reason: "must be between 1 and 65535".into() });
                }
            }
            Source::Managed(m) => {
                for var in m.kind.required_env().iter().copied() {
                    if self.env.get(var).map(|v| v.is_empty()).unwrap_or(true) {
                        return Err(ConfigError::MissingVariable { kind: m.kind.as_str(), var });
                    }
                }
            }
        }
        match self.replicas {
            ReplicaPolicy::Static(0) => {
                return Err(ConfigError::Invalid { field: "replicas", reason: "static replica count must be at least 1".into() })
            }
            ReplicaPolicy::Autoscaled(0, _) => {
                return Err(ConfigError::Invalid { field: "replicas", reason: "autoscaled minimum must be at least 1".into() })
            }
            ReplicaPolicy::Autoscaled(min, max) if min > max => {
                return Err(ConfigError::Invalid {
                    field: "replicas",
                    reason: format!("autoscaled minimum {} exceeds maximum {}", min, max),
                })
            }
            _ => {}
        }
        check_quantity("resources.cpu", self.resources.cpu.as_deref())?;
        check_quantity("resources.memory", self.resources.memory.as_deref())?;
        check_quantity("storage", self.storage.as_deref())?;
        Ok(())
    }
}

fn check_quantity(field: &'static str, value: Option<&str>) -> Result<(), ConfigError> {
    match value {
        Some(v) if !quantity::is_valid(v) => Err(ConfigError::Quantity { field, value: v.to_string() }),
        _ => Ok(()),
    }
}
