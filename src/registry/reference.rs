//! Image references
//!
//! A [`Reference`] names an image in a registry: `registry/repository:tag` or
//! `registry/repository@sha256:...`. Parsing follows the usual Docker rules:
//! the first path component is a registry host only if it contains `.` or
//! `:` or is `localhost`; otherwise the image lives on Docker Hub.

use crate::error::{PusherError, Result};
use std::fmt;
use std::str::FromStr;
use url::Url;

pub const DEFAULT_REGISTRY: &str = "index.docker.io";
pub const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    pub registry: String,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

impl Reference {
    /// Build the push destination for a discovered image name.
    ///
    /// A name that already carries a registry host is used as is; anything
    /// else is placed under `registry`. A missing tag becomes `latest`.
    pub fn for_image(registry: &str, name: &str) -> Result<Self> {
        let name = name.trim();
        let qualified = match name.split_once('/') {
            Some((first, _)) if looks_like_host(first) => name.to_string(),
            _ => format!("{}/{}", registry, name),
        };

        let mut reference: Reference = qualified.parse()?;
        if reference.tag.is_none() && reference.digest.is_none() {
            reference.tag = Some(DEFAULT_TAG.to_string());
        }
        Ok(reference)
    }

    /// Tag or digest used when addressing the manifest.
    pub fn identifier(&self) -> &str {
        self.digest
            .as_deref()
            .or(self.tag.as_deref())
            .unwrap_or(DEFAULT_TAG)
    }

    /// Registry host as used in URLs; Docker Hub's API lives at `registry-1.docker.io`.
    pub fn registry_host(&self) -> &str {
        if self.registry == DEFAULT_REGISTRY || self.registry == "docker.io" {
            "registry-1.docker.io"
        } else {
            &self.registry
        }
    }

    /// `http` or `https` for this reference's registry.
    pub fn scheme(&self, plain_http: bool) -> &'static str {
        if plain_http || is_insecure_registry(&self.registry) {
            "http"
        } else {
            "https"
        }
    }

    /// `<scheme>://<host>/v2/`
    pub fn api_base(&self, plain_http: bool) -> Result<Url> {
        let raw = format!("{}://{}/v2/", self.scheme(plain_http), self.registry_host());
        Url::parse(&raw).map_err(|e| PusherError::InvalidReference {
            reference: self.to_string(),
            message: e.to_string(),
        })
    }

    /// Token scope granting push access to the repository.
    pub fn push_scope(&self) -> String {
        format!("repository:{}:pull,push", self.repository)
    }
}

impl FromStr for Reference {
    type Err = PusherError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |message: &str| PusherError::InvalidReference {
            reference: s.to_string(),
            message: message.to_string(),
        };

        if s.is_empty() {
            return Err(invalid("reference is empty"));
        }

        let (name, digest) = match s.split_once('@') {
            Some((name, digest)) => {
                validate_digest(digest).map_err(|m| invalid(&m))?;
                (name, Some(digest.to_string()))
            }
            None => (s, None),
        };

        let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name[last_slash..].rfind(':') {
            Some(i) => {
                let at = last_slash + i;
                let tag = &name[at + 1..];
                validate_tag(tag).map_err(|m| invalid(&m))?;
                (&name[..at], Some(tag.to_string()))
            }
            None => (name, None),
        };

        let (registry, repository) = match name.split_once('/') {
            Some((first, rest)) if looks_like_host(first) => (first.to_string(), rest.to_string()),
            Some(_) => (DEFAULT_REGISTRY.to_string(), name.to_string()),
            None => (DEFAULT_REGISTRY.to_string(), format!("library/{}", name)),
        };

        validate_repository(&repository).map_err(|m| invalid(&m))?;

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// Registries reached over plain HTTP: loopback and `.local` hosts.
pub fn is_insecure_registry(registry: &str) -> bool {
    if registry.starts_with("http://") {
        return true;
    }

    let host = host_without_port(registry);
    host == "localhost"
        || host == "127.0.0.1"
        || host == "::1"
        || host.ends_with(".local")
        || host.starts_with("localhost.")
}

fn host_without_port(registry: &str) -> &str {
    let registry = registry.trim_start_matches("http://").trim_start_matches("https://");
    if let Some(rest) = registry.strip_prefix('[') {
        // [::1]:5000
        return rest.split(']').next().unwrap_or(rest);
    }
    if registry.matches(':').count() > 1 {
        return registry;
    }
    registry.split(':').next().unwrap_or(registry)
}

fn looks_like_host(component: &str) -> bool {
    component.contains('.') || component.contains(':') || component == "localhost"
}

fn validate_repository(repository: &str) -> std::result::Result<(), String> {
    if repository.is_empty() {
        return Err("repository is empty".to_string());
    }
    if repository.len() > 255 {
        return Err("repository name longer than 255 characters".to_string());
    }

    for component in repository.split('/') {
        if component.is_empty() {
            return Err("repository has an empty path component".to_string());
        }
        let valid_chars = component
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'));
        if !valid_chars {
            return Err(format!(
                "repository component {:?} must be lowercase alphanumerics separated by '.', '_' or '-'",
                component
            ));
        }
        let starts_ok = component
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric());
        let ends_ok = component
            .chars()
            .last()
            .is_some_and(|c| c.is_ascii_alphanumeric());
        if !starts_ok || !ends_ok {
            return Err(format!(
                "repository component {:?} must start and end with an alphanumeric",
                component
            ));
        }
    }
    Ok(())
}

fn validate_tag(tag: &str) -> std::result::Result<(), String> {
    let mut chars = tag.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_');
    if !first_ok || tag.len() > 128 {
        return Err(format!("invalid tag {:?}", tag));
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')) {
        return Err(format!("invalid tag {:?}", tag));
    }
    Ok(())
}

fn validate_digest(digest: &str) -> std::result::Result<(), String> {
    match digest.split_once(':') {
        Some((alg, hex))
            if !alg.is_empty()
                && hex.len() >= 32
                && hex.chars().all(|c| c.is_ascii_hexdigit()) =>
        {
            Ok(())
        }
        _ => Err(format!("invalid digest {:?}", digest)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_parse_registry_repo_tag() {
        let r: Reference = "localhost:5000/team/app:v1.2".parse().unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.tag.as_deref(), Some("v1.2"));
        assert_eq!(r.identifier(), "v1.2");
        assert_eq!(r.to_string(), "localhost:5000/team/app:v1.2");
    }

    #[test]
    fn test_parse_digest_reference() {
        let raw = format!("registry.example.com/app@{}", DIGEST);
        let r: Reference = raw.parse().unwrap();
        assert_eq!(r.digest.as_deref(), Some(DIGEST));
        assert_eq!(r.tag, None);
        assert_eq!(r.identifier(), DIGEST);
        assert_eq!(r.to_string(), raw);
    }

    #[test]
    fn test_docker_hub_defaults() {
        let r: Reference = "nginx".parse().unwrap();
        assert_eq!(r.registry, DEFAULT_REGISTRY);
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.registry_host(), "registry-1.docker.io");

        let r: Reference = "bitnami/redis:7".parse().unwrap();
        assert_eq!(r.repository, "bitnami/redis");
    }

    #[test]
    fn test_invalid_references() {
        for raw in ["", "Upper/Case", "app:", "app@sha256:zz", "registry.io//app", "app:-bad"] {
            assert!(raw.parse::<Reference>().is_err(), "{:?} should fail", raw);
        }
    }

    #[test]
    fn test_for_image_qualifies_and_tags() {
        let r = Reference::for_image("gitea.cnoe.localtest.me:8443", "myapp").unwrap();
        assert_eq!(r.to_string(), "gitea.cnoe.localtest.me:8443/myapp:latest");

        let r = Reference::for_image("localhost:5000", "myapp:v2").unwrap();
        assert_eq!(r.to_string(), "localhost:5000/myapp:v2");

        let r = Reference::for_image("localhost:5000", "other.io/team/app:1").unwrap();
        assert_eq!(r.registry, "other.io");

        assert!(Reference::for_image("localhost:5000", "Not Valid").is_err());
    }

    #[test]
    fn test_insecure_registry_heuristics() {
        assert!(is_insecure_registry("localhost:5000"));
        assert!(is_insecure_registry("127.0.0.1:5000"));
        assert!(is_insecure_registry("[::1]:5000"));
        assert!(is_insecure_registry("registry.local"));
        assert!(is_insecure_registry("http://registry.example.com"));
        assert!(!is_insecure_registry("registry.example.com"));
        assert!(!is_insecure_registry("ghcr.io"));
    }

    #[test]
    fn test_api_base_scheme() {
        let r: Reference = "127.0.0.1:5000/app:v1".parse().unwrap();
        assert_eq!(r.api_base(false).unwrap().as_str(), "http://127.0.0.1:5000/v2/");

        let r: Reference = "ghcr.io/org/app:v1".parse().unwrap();
        assert_eq!(r.api_base(false).unwrap().as_str(), "https://ghcr.io/v2/");
        assert_eq!(r.api_base(true).unwrap().as_str(), "http://ghcr.io/v2/");
        assert_eq!(r.push_scope(), "repository:org/app:pull,push");
    }
}
