//! Image references and registry transport.

use keel_core::ResourceNames;

/// Tag used when no commit is pinned.
pub const DEFAULT_TAG: &str = "latest";
const MAX_TAG_LEN: usize = 128;

/// `<registry>/<base>:<tag>`; the tag is the pinned commit or `latest`.
pub fn image_reference(registry: &str, names: &ResourceNames, commit: Option<&str>) -> String {
    format!("{}/{}:{}", registry.trim().trim_end_matches('/'), names.base, tag_for(commit))
}

pub fn tag_for(commit: Option<&str>) -> String {
    let raw = commit.map(str::trim).filter(|c| !c.is_empty()).unwrap_or(DEFAULT_TAG);
    let tag: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') { c } else { '-' })
        .take(MAX_TAG_LEN)
        .collect();
    // Tags may not start with '.' or '-'.
    match tag.trim_start_matches(['.', '-']) {
        "" => DEFAULT_TAG.to_string(),
        t => t.to_string(),
    }
}

/// Host part of a registry reference, without scheme, path or port.
pub fn registry_host(registry: &str) -> &str {
    let r = registry.trim();
    let r = r.strip_prefix("https://").or_else(|| r.strip_prefix("http://")).unwrap_or(r);
    let authority = r.split('/').next().unwrap_or(r);
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    }
}

/// Cluster-local registries speak plain HTTP; everything else is TLS.
pub fn is_plain_registry(registry: &str) -> bool {
    let host = registry_host(registry).to_ascii_lowercase();
    host == "localhost"
        || host.starts_with("127.")
        || !host.contains('.')
        || host.ends_with(".svc")
        || host.contains(".svc.")
        || host.ends_with(".local")
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::ServiceId;

    #[test]
    fn reference_uses_commit_or_latest() {
        let names = ResourceNames::for_service(&ServiceId::new("svc-1"));
        assert_eq!(image_reference("registry.local:5000/", &names, Some("9f2c1e0")), "registry.local:5000/svc-1:9f2c1e0");
        assert_eq!(image_reference("ghcr.io/acme", &names, None), "ghcr.io/acme/svc-1:latest");
        assert_eq!(image_reference("ghcr.io/acme", &names, Some("  ")), "ghcr.io/acme/svc-1:latest");
    }

    #[test]
    fn tags_are_sanitized() {
        assert_eq!(tag_for(Some("feature/x")), "feature-x");
        assert_eq!(tag_for(Some("-abc")), "abc");
        assert_eq!(tag_for(Some("...")), "latest");
    }

    #[test]
    fn registry_transport_by_host() {
        for plain in [
            "localhost:5000",
            "127.0.0.1:5000",
            "registry:5000",
            "registry.keel-system.svc:5000",
            "registry.keel-system.svc.cluster.local",
            "http://registry.local/team",
        ] {
            assert!(is_plain_registry(plain), "{}", plain);
        }
        for tls in ["ghcr.io/acme", "registry.example.com:443", "https://index.docker.io"] {
            assert!(!is_plain_registry(tls), "{}", tls);
        }
    }
}
