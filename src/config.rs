//! Configuration for push operations
//!
//! Callers fill in a [`PushOptions`] by field name (starting from
//! [`PushOptions::new`] and struct update syntax) and hand it to
//! [`PushConfig::new`], which validates the combination and fills in
//! defaults. Recognised options:
//!
//! * `registry`: target registry host; an `http://` or `https://` prefix is stripped
//!   (`http://` additionally selects plain HTTP)
//! * `username` / `password`: explicit credentials, highest precedence
//! * `insecure`: disables TLS certificate verification
//! * `build_path`: root searched by discovery
//! * `max_retries`: retries per image push on top of the first attempt
//! * `concurrency`: caps simultaneous image transfers
//! * `user_agent`: sent with every registry request
//! * `filter`: include/exclude patterns and size bounds applied after discovery
//! * `backoff`: delay schedule between push attempts
//! * `chunk_size`: blob bytes per upload request
//! * `timeout`: per-request timeout

use crate::buffer_pool::DEFAULT_CHUNK_SIZE;
use crate::error::{PusherError, Result};
use crate::registry::auth::CredentialSource;
use crate::retry::BackoffStrategy;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_CONCURRENCY: usize = 3;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_USER_AGENT: &str = concat!("registry-pusher/", env!("CARGO_PKG_VERSION"));

/// Where and how discovery looks for images.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryOptions {
    pub build_path: PathBuf,
    pub extensions: Vec<String>,
    /// Files larger than this are ignored; 0 disables the limit.
    pub max_size_mb: u64,
    pub follow_links: bool,
}

impl DiscoveryOptions {
    pub fn new(build_path: impl Into<PathBuf>) -> Self {
        Self {
            build_path: build_path.into(),
            extensions: vec![".tar".to_string(), ".tar.gz".to_string(), ".tgz".to_string()],
            max_size_mb: 5000,
            follow_links: true,
        }
    }

    pub fn max_size_bytes(&self) -> Option<u64> {
        (self.max_size_mb > 0).then(|| self.max_size_mb.saturating_mul(1024 * 1024))
    }
}

/// Post-discovery selection of images.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterCriteria {
    /// Glob patterns on the image name; empty keeps everything.
    pub include: Vec<String>,
    /// Glob patterns on the image name that drop a match.
    pub exclude: Vec<String>,
    pub min_size: Option<u64>,
    pub max_size: Option<u64>,
}

impl FilterCriteria {
    pub fn is_empty(&self) -> bool {
        self.include.is_empty()
            && self.exclude.is_empty()
            && self.min_size.is_none()
            && self.max_size.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub registry: String,
    pub plain_http: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    pub insecure: bool,
    pub build_path: PathBuf,
    pub max_retries: u32,
    pub concurrency: usize,
    pub user_agent: String,
    pub filter: Option<FilterCriteria>,
    pub backoff: BackoffStrategy,
    pub chunk_size: usize,
    pub timeout: Duration,
    /// Negotiate bearer tokens with the registry's token service.
    pub token_auth: bool,
    pub discovery: DiscoveryOptions,
}

/// Caller-supplied settings, validated by [`PushConfig::new`].
///
/// Zero values for `max_retries`, `concurrency` and `chunk_size` select the
/// defaults; `None` for the optional fields does the same.
#[derive(Debug, Clone)]
pub struct PushOptions {
    pub registry: String,
    /// Explicit flag credentials; empty strings count as unset.
    pub username: Option<String>,
    pub password: Option<String>,
    pub insecure: bool,
    pub build_path: PathBuf,
    pub max_retries: u32,
    pub concurrency: usize,
    pub user_agent: Option<String>,
    /// An empty filter is the same as none.
    pub filter: Option<FilterCriteria>,
    /// Defaults to [`BackoffStrategy::for_push`] with `max_retries`.
    pub backoff: Option<BackoffStrategy>,
    pub chunk_size: usize,
    pub timeout: Duration,
    pub token_auth: bool,
    pub extensions: Option<Vec<String>>,
    pub max_size_mb: Option<u64>,
}

impl PushOptions {
    /// Defaults for everything but the registry.
    pub fn new(registry: impl Into<String>) -> Self {
        Self {
            registry: registry.into(),
            username: None,
            password: None,
            insecure: false,
            build_path: PathBuf::from("."),
            max_retries: DEFAULT_MAX_RETRIES,
            concurrency: DEFAULT_CONCURRENCY,
            user_agent: None,
            filter: None,
            backoff: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            timeout: DEFAULT_TIMEOUT,
            token_auth: false,
            extensions: None,
            max_size_mb: None,
        }
    }
}

impl PushConfig {
    pub fn new(options: PushOptions) -> Result<Self> {
        let (registry, plain_http) = normalize_registry(&options.registry)?;

        let username = options.username.filter(|u| !u.is_empty());
        let password = options.password.filter(|p| !p.is_empty());
        if username.is_some() != password.is_some() {
            return Err(PusherError::Credential {
                origin: CredentialSource::Flags,
                message: "username and password must be provided together".to_string(),
            });
        }

        if options.timeout.is_zero() {
            return Err(PusherError::Config("timeout must be greater than zero".to_string()));
        }

        let max_retries = if options.max_retries == 0 {
            DEFAULT_MAX_RETRIES
        } else {
            options.max_retries
        };
        let concurrency = if options.concurrency == 0 {
            DEFAULT_CONCURRENCY
        } else {
            options.concurrency
        };
        let chunk_size = if options.chunk_size == 0 {
            DEFAULT_CHUNK_SIZE
        } else {
            options.chunk_size
        };
        let backoff = options
            .backoff
            .unwrap_or_else(|| BackoffStrategy::for_push(max_retries));

        let mut discovery = DiscoveryOptions::new(options.build_path.clone());
        if let Some(extensions) = options.extensions {
            discovery.extensions = extensions;
        }
        if let Some(max_size_mb) = options.max_size_mb {
            discovery.max_size_mb = max_size_mb;
        }

        Ok(Self {
            registry,
            plain_http,
            username,
            password,
            insecure: options.insecure,
            build_path: options.build_path,
            max_retries,
            concurrency,
            user_agent: options
                .user_agent
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            filter: options.filter.filter(|f| !f.is_empty()),
            backoff,
            chunk_size,
            timeout: options.timeout,
            token_auth: options.token_auth,
            discovery,
        })
    }

    pub fn has_flag_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }
}

/// Strip a scheme and trailing slashes; `http://` forces plain HTTP.
fn normalize_registry(raw: &str) -> Result<(String, bool)> {
    let trimmed = raw.trim();
    let (rest, plain_http) = if let Some(rest) = trimmed.strip_prefix("http://") {
        (rest, true)
    } else if let Some(rest) = trimmed.strip_prefix("https://") {
        (rest, false)
    } else {
        (trimmed, false)
    };

    let host = rest.trim_end_matches('/');
    if host.is_empty() {
        return Err(PusherError::Config("registry must not be empty".to_string()));
    }
    if host.contains('/') {
        return Err(PusherError::Config(format!(
            "registry must be a host[:port], got {}",
            raw
        )));
    }

    Ok((host.to_string(), plain_http))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(options: PushOptions) -> Result<PushConfig> {
        PushConfig::new(options)
    }

    #[test]
    fn test_defaults() {
        let config = config(PushOptions::new("localhost:5000")).unwrap();
        assert_eq!(config.registry, "localhost:5000");
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.chunk_size, 1024 * 1024);
        assert_eq!(config.timeout, Duration::from_secs(300));
        assert_eq!(config.backoff.base_delay(), Duration::from_secs(1));
        assert_eq!(config.backoff.max_attempts(), 4);
        assert!(config.user_agent.starts_with("registry-pusher/"));
        assert_eq!(config.discovery.extensions.len(), 3);
        assert_eq!(config.discovery.max_size_mb, 5000);
        assert!(!config.plain_http);
    }

    #[test]
    fn test_zero_values_select_defaults() {
        let config = config(PushOptions {
            max_retries: 0,
            concurrency: 0,
            chunk_size: 0,
            ..PushOptions::new("registry.example.com")
        })
        .unwrap();
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(config.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_discovery_follows_options() {
        let config = config(PushOptions {
            build_path: PathBuf::from("/tmp/build"),
            extensions: Some(vec![".oci".to_string()]),
            max_size_mb: Some(10),
            ..PushOptions::new("localhost:5000")
        })
        .unwrap();
        assert_eq!(config.discovery.build_path, PathBuf::from("/tmp/build"));
        assert_eq!(config.discovery.extensions, vec![".oci".to_string()]);
        assert_eq!(config.discovery.max_size_bytes(), Some(10 * 1024 * 1024));
    }

    #[test]
    fn test_scheme_is_stripped() {
        let config = config(PushOptions::new("http://gitea.local:8443/")).unwrap();
        assert_eq!(config.registry, "gitea.local:8443");
        assert!(config.plain_http);

        let config = self::config(PushOptions::new("https://ghcr.io")).unwrap();
        assert_eq!(config.registry, "ghcr.io");
        assert!(!config.plain_http);
    }

    #[test]
    fn test_rejects_bad_registry() {
        assert!(config(PushOptions::new("")).is_err());
        assert!(config(PushOptions::new("https://")).is_err());
        assert!(config(PushOptions::new("host/path")).is_err());
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let err = config(PushOptions {
            timeout: Duration::ZERO,
            ..PushOptions::new("localhost:5000")
        })
        .unwrap_err();
        assert!(matches!(err, PusherError::Config(_)));
    }

    #[test]
    fn test_credential_pairing() {
        let err = config(PushOptions {
            username: Some("admin".to_string()),
            ..PushOptions::new("localhost:5000")
        })
        .unwrap_err();
        assert!(matches!(
            err,
            PusherError::Credential {
                origin: CredentialSource::Flags,
                ..
            }
        ));

        let paired = config(PushOptions {
            username: Some("admin".to_string()),
            password: Some("secret".to_string()),
            ..PushOptions::new("localhost:5000")
        })
        .unwrap();
        assert!(paired.has_flag_credentials());

        let blank = config(PushOptions {
            username: Some(String::new()),
            password: Some(String::new()),
            ..PushOptions::new("localhost:5000")
        })
        .unwrap();
        assert!(!blank.has_flag_credentials());
    }

    #[test]
    fn test_empty_filter_is_dropped() {
        let config = config(PushOptions {
            filter: Some(FilterCriteria::default()),
            ..PushOptions::new("localhost:5000")
        })
        .unwrap();
        assert!(config.filter.is_none());
    }
}
