//! Deterministic resource names derived from a service identity.
//!
//! Names depend on the identity alone, never on the display name. When the identity
//! is not already a clean DNS label (or is too long) the sanitized form gets a short
//! hash of the raw identity appended, so `Svc_1` and `svc-1` cannot collide.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::managed::Endpoint;
use crate::model::ServiceId;

/// Longest base name; leaves room for the suffixes derived names append.
pub const MAX_BASE_LEN: usize = 40;
const MAX_LABEL_LEN: usize = 63;
const MAX_TAG_LEN: usize = 12;

static INVALID_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").expect("static regex"));

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceNames {
    pub base: String,
}

impl ResourceNames {
    pub fn for_service(id: &ServiceId) -> Self {
        Self { base: dns_label(id.as_str(), MAX_BASE_LEN, true) }
    }

    pub fn workload(&self) -> &str { &self.base }

    /// Primary endpoint keeps the bare name so existing installs keep their Service.
    pub fn endpoint_service(&self, endpoint: &Endpoint) -> String {
        if endpoint.primary { self.base.clone() } else { format!("{}-{}", self.base, endpoint.name) }
    }

    pub fn route(&self, endpoint: &Endpoint) -> String { self.endpoint_service(endpoint) }

    pub fn public_service(&self) -> String { format!("{}-public", self.base) }

    /// Governing Service of a StatefulSet; gives pods `<base>-0.<base>-headless` DNS.
    pub fn headless_service(&self) -> String { format!("{}-headless", self.base) }

    pub fn autoscaler(&self) -> &str { &self.base }

    pub fn claim(&self) -> String { format!("{}-data", self.base) }

    /// Claim the StatefulSet controller creates from the `data` template for ordinal 0.
    pub fn template_claim(&self) -> String { format!("{}-{}-0", CLAIM_TEMPLATE, self.base) }

    pub fn build_job(&self, tag: &str) -> String {
        let lowered = tag.trim().to_ascii_lowercase();
        let mut tag = truncate_label(INVALID_RUN.replace_all(&lowered, "-").trim_matches('-'), MAX_TAG_LEN);
        if tag.is_empty() { tag = "latest".to_string(); }
        let name = format!("build-{}-{}", self.base, tag);
        truncate_label(&name, MAX_LABEL_LEN)
    }

    /// Selector value shared by every object of the service.
    pub fn selector_value(&self) -> &str { &self.base }
}

/// Volume-claim template name used by stable-identity workloads.
pub const CLAIM_TEMPLATE: &str = "data";

pub fn namespace_for_tenant(tenant: &str) -> String {
    dns_label(tenant, MAX_LABEL_LEN, false)
}

/// 32-bit FNV-1a, rendered as 8 hex chars.
pub fn short_hash(input: &str) -> String {
    let mut h: u32 = 0x811c9dc5;
    for b in input.as_bytes() {
        h ^= *b as u32;
        h = h.wrapping_mul(0x01000193);
    }
    format!("{:08x}", h)
}

fn dns_label(raw: &str, max: usize, need_alpha_start: bool) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    let mut clean = INVALID_RUN.replace_all(&lowered, "-").trim_matches('-').to_string();
    if need_alpha_start && !clean.starts_with(|c: char| c.is_ascii_lowercase()) {
        clean = if clean.is_empty() { "svc".to_string() } else { format!("s-{}", clean) };
    }
    let altered = clean != raw;
    if !altered && clean.len() <= max {
        return clean;
    }
    // Reserve room for "-xxxxxxxx".
    let keep = max.saturating_sub(9);
    let head = truncate_label(&clean, keep);
    if head.is_empty() { short_hash(raw) } else { format!("{}-{}", head, short_hash(raw)) }
}

fn truncate_label(s: &str, max: usize) -> String {
    let cut: String = s.chars().take(max).collect();
    cut.trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managed::{ManagedKind, Protocol};

    #[test]
    fn clean_identity_is_used_verbatim() {
        let names = ResourceNames::for_service(&ServiceId::new("svc-1"));
        assert_eq!(names.base, "svc-1");
        assert_eq!(names.claim(), "svc-1-data");
        assert_eq!(names.template_claim(), "data-svc-1-0");
        assert_eq!(names.public_service(), "svc-1-public");
        assert_eq!(names.headless_service(), "svc-1-headless");
    }

    #[test]
    fn sanitized_identities_do_not_collide() {
        let a = ResourceNames::for_service(&ServiceId::new("Svc_1"));
        let b = ResourceNames::for_service(&ServiceId::new("svc-1"));
        let c = ResourceNames::for_service(&ServiceId::new("SVC.1"));
        assert_ne!(a.base, b.base);
        assert_ne!(a.base, c.base);
        assert!(a.base.starts_with("svc-1-"));
    }

    #[test]
    fn long_and_numeric_identities_become_valid_labels() {
        let long = "a".repeat(120);
        let n = ResourceNames::for_service(&ServiceId::new(long.as_str()));
        assert!(n.base.len() <= MAX_BASE_LEN, "{}", n.base);
        let numeric = ResourceNames::for_service(&ServiceId::new("42"));
        assert!(numeric.base.starts_with("s-42"));
    }

    #[test]
    fn names_are_stable_for_same_identity() {
        let id = ServiceId::new("Billing API");
        assert_eq!(ResourceNames::for_service(&id), ResourceNames::for_service(&id));
    }

    #[test]
    fn secondary_endpoints_are_suffixed() {
        let names = ResourceNames::for_service(&ServiceId::new("queue"));
        let eps = ManagedKind::RabbitMq.endpoints();
        assert_eq!(names.endpoint_service(&eps[0]), "queue");
        assert_eq!(names.endpoint_service(&eps[1]), "queue-management");
        let http = Endpoint::new("http", 8080, Protocol::Http, true);
        assert_eq!(names.route(&http), "queue");
    }

    #[test]
    fn build_job_names_fit_a_label() {
        let names = ResourceNames::for_service(&ServiceId::new(&*"x".repeat(40)));
        let job = names.build_job("0123456789abcdef0123456789abcdef01234567");
        assert!(job.len() <= 63, "{} ({})", job, job.len());
        assert!(job.starts_with("build-"));
        assert_eq!(ResourceNames::for_service(&ServiceId::new("svc-1")).build_job("latest"), "build-svc-1-latest");
    }

    #[test]
    fn tenant_namespaces_are_sanitized() {
        assert_eq!(namespace_for_tenant("acme"), "acme");
        assert!(namespace_for_tenant("Acme Corp").starts_with("acme-corp-"));
    }
}
