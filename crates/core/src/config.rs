//! Engine configuration, read from `KEEL_*` environment variables with defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RenderSettings {
    /// Hosts for routes without declared domains: `<route>.<base_domain>`.
    pub base_domain: String,
    pub ingress_class: Option<String>,
    /// cert-manager cluster issuer; when set, routes get a TLS section.
    pub cluster_issuer: Option<String>,
    pub default_cpu_request: String,
    pub default_memory_request: String,
    pub cpu_target_utilization: i32,
    /// Mount path for standalone claims of git services.
    pub git_data_path: String,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            base_domain: "apps.local".to_string(),
            ingress_class: Some("nginx".to_string()),
            cluster_issuer: None,
            default_cpu_request: "100m".to_string(),
            default_memory_request: "128Mi".to_string(),
            cpu_target_utilization: 80,
            git_data_path: "/data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BuildSettings {
    pub registry: String,
    pub git_image: String,
    pub builder_image: String,
    /// Secret holding a docker `config.json` for registry pushes.
    pub registry_secret: Option<String>,
    pub deadline: Duration,
    /// Retention window for finished build jobs.
    pub job_ttl: Duration,
    pub restart_threshold: i32,
    pub log_tail_lines: i64,
    pub log_tail_bytes: i64,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            registry: "registry.keel-system.svc:5000".to_string(),
            git_image: "alpine/git:2.45.2".to_string(),
            builder_image: "gcr.io/kaniko-project/executor:v1.23.2".to_string(),
            registry_secret: None,
            deadline: Duration::from_secs(900),
            job_ttl: Duration::from_secs(600),
            restart_threshold: 3,
            log_tail_lines: 200,
            log_tail_bytes: 32 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DrainMode {
    Fixed,
    Poll,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApplySettings {
    pub drain_mode: DrainMode,
    pub drain_grace: Duration,
    pub drain_poll_interval: Duration,
    pub drain_timeout: Duration,
}

impl Default for ApplySettings {
    fn default() -> Self {
        Self {
            drain_mode: DrainMode::Fixed,
            drain_grace: Duration::from_secs(10),
            drain_poll_interval: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortRange {
    pub first: u16,
    pub last: u16,
}

impl Default for PortRange {
    fn default() -> Self { Self { first: 30000, last: 32767 } }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    pub render: RenderSettings,
    pub build: BuildSettings,
    pub apply: ApplySettings,
    pub ports: PortRange,
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = EngineConfig::default();
        let get = |k: &str| lookup(k).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let num = |k: &str, default: u64| -> u64 {
            match get(k) {
                Some(v) => v.parse().unwrap_or_else(|_| {
                    warn!(key = k, value = %v, "ignoring non-numeric config value");
                    default
                }),
                None => default,
            }
        };
        let secs = |k: &str, default: Duration| Duration::from_secs(num(k, default.as_secs()));

        let render = RenderSettings {
            base_domain: get("KEEL_BASE_DOMAIN").unwrap_or(d.render.base_domain),
            ingress_class: match get("KEEL_INGRESS_CLASS") {
                Some(v) if v == "none" => None,
                Some(v) => Some(v),
                None => d.render.ingress_class,
            },
            cluster_issuer: get("KEEL_CLUSTER_ISSUER"),
            default_cpu_request: get("KEEL_DEFAULT_CPU_REQUEST").unwrap_or(d.render.default_cpu_request),
            default_memory_request: get("KEEL_DEFAULT_MEMORY_REQUEST").unwrap_or(d.render.default_memory_request),
            cpu_target_utilization: num("KEEL_HPA_CPU_TARGET", d.render.cpu_target_utilization as u64).min(100) as i32,
            git_data_path: get("KEEL_GIT_DATA_PATH").unwrap_or(d.render.git_data_path),
        };
        let build = BuildSettings {
            registry: get("KEEL_REGISTRY").unwrap_or(d.build.registry),
            git_image: get("KEEL_GIT_IMAGE").unwrap_or(d.build.git_image),
            builder_image: get("KEEL_BUILDER_IMAGE").unwrap_or(d.build.builder_image),
            registry_secret: get("KEEL_REGISTRY_SECRET"),
            deadline: secs("KEEL_BUILD_DEADLINE_SECS", d.build.deadline),
            job_ttl: secs("KEEL_BUILD_JOB_TTL_SECS", d.build.job_ttl),
            restart_threshold: num("KEEL_BUILD_RESTART_THRESHOLD", d.build.restart_threshold as u64) as i32,
            log_tail_lines: num("KEEL_LOG_TAIL_LINES", d.build.log_tail_lines as u64) as i64,
            log_tail_bytes: num("KEEL_LOG_TAIL_BYTES", d.build.log_tail_bytes as u64) as i64,
        };
        let apply = ApplySettings {
            drain_mode: match get("KEEL_DRAIN_MODE").as_deref() {
                Some("poll") => DrainMode::Poll,
                Some("fixed") | None => DrainMode::Fixed,
                Some(other) => {
                    warn!(value = %other, "unknown KEEL_DRAIN_MODE; using fixed");
                    DrainMode::Fixed
                }
            },
            drain_grace: secs("KEEL_DRAIN_GRACE_SECS", d.apply.drain_grace),
            drain_poll_interval: secs("KEEL_DRAIN_POLL_SECS", d.apply.drain_poll_interval),
            drain_timeout: secs("KEEL_DRAIN_TIMEOUT_SECS", d.apply.drain_timeout),
        };
        let ports = PortRange {
            first: num("KEEL_PORT_RANGE_FIRST", d.ports.first as u64).min(u16::MAX as u64) as u16,
            last: num("KEEL_PORT_RANGE_LAST", d.ports.last as u64).min(u16::MAX as u64) as u16,
        };
        Self { render, build, apply, ports }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = EngineConfig::from_lookup(|_| None);
        assert_eq!(cfg, EngineConfig::default());
        assert_eq!(cfg.build.restart_threshold, 3);
    }

    #[test]
    fn overrides_are_read_and_bad_numbers_ignored() {
        let vars: HashMap<&str, &str> = [
            ("KEEL_REGISTRY", "ghcr.io/acme"),
            ("KEEL_BUILD_DEADLINE_SECS", "1200"),
            ("KEEL_LOG_TAIL_LINES", "many"),
            ("KEEL_INGRESS_CLASS", "none"),
            ("KEEL_DRAIN_MODE", "poll"),
        ]
        .into_iter()
        .collect();
        let cfg = EngineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.build.registry, "ghcr.io/acme");
        assert_eq!(cfg.build.deadline, Duration::from_secs(1200));
        assert_eq!(cfg.build.log_tail_lines, 200);
        assert_eq!(cfg.render.ingress_class, None);
        assert_eq!(cfg.apply.drain_mode, DrainMode::Poll);
    }
}
