//! Credential resolution
//!
//! Credentials come from, in order of precedence: explicit flags, the
//! `IDPBUILDER_REGISTRY_USER` / `IDPBUILDER_REGISTRY_PASSWORD` environment
//! variables, and the Docker config file (`$DOCKER_CONFIG/config.json` or
//! `~/.docker/config.json`). A username without a password, or the reverse,
//! is rejected before any network call is made.

use crate::error::{PusherError, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const ENV_REGISTRY_USER: &str = "IDPBUILDER_REGISTRY_USER";
pub const ENV_REGISTRY_PASSWORD: &str = "IDPBUILDER_REGISTRY_PASSWORD";
pub const ENV_DOCKER_CONFIG: &str = "DOCKER_CONFIG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    None,
    Env,
    Flags,
    Keychain,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CredentialSource::None => "none",
            CredentialSource::Env => "environment",
            CredentialSource::Flags => "flags",
            CredentialSource::Keychain => "keychain",
        };
        f.write_str(name)
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub source: CredentialSource,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}

impl Credentials {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        source: CredentialSource,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            source,
        }
    }

    pub fn none() -> Self {
        Self::new("", "", CredentialSource::None)
    }

    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }

    /// Username and password must be both set or both empty.
    pub fn validate(&self) -> Result<()> {
        let message = match (self.username.is_empty(), self.password.is_empty()) {
            (true, false) => "username is required when password is provided",
            (false, true) => "password is required when username is provided",
            _ => return Ok(()),
        };
        Err(PusherError::Credential {
            origin: self.source,
            message: message.to_string(),
        })
    }
}

/// Resolve credentials for `registry` by precedence: flags, environment, keychain.
pub fn resolve_credentials(
    flag_user: Option<&str>,
    flag_pass: Option<&str>,
    registry: &str,
) -> Result<Credentials> {
    let flags = Credentials::new(
        flag_user.unwrap_or_default(),
        flag_pass.unwrap_or_default(),
        CredentialSource::Flags,
    );
    if !flags.is_empty() {
        flags.validate()?;
        return Ok(flags);
    }

    let env = credentials_from_env();
    if !env.is_empty() {
        env.validate()?;
        return Ok(env);
    }

    match DockerConfigKeychain::from_env() {
        Some(keychain) => Ok(keychain.lookup(registry)?.unwrap_or_else(Credentials::none)),
        None => Ok(Credentials::none()),
    }
}

/// Credentials from the environment, `source` is `None` when unset.
pub fn credentials_from_env() -> Credentials {
    let username = std::env::var(ENV_REGISTRY_USER).unwrap_or_default();
    let password = std::env::var(ENV_REGISTRY_PASSWORD).unwrap_or_default();
    if username.is_empty() && password.is_empty() {
        return Credentials::none();
    }
    Credentials::new(username, password, CredentialSource::Env)
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuthEntry {
    auth: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

/// Reads `auths` entries from a Docker `config.json`.
#[derive(Debug, Clone)]
pub struct DockerConfigKeychain {
    config_path: PathBuf,
}

impl DockerConfigKeychain {
    pub fn new(config_dir: impl AsRef<Path>) -> Self {
        Self {
            config_path: config_dir.as_ref().join("config.json"),
        }
    }

    /// `$DOCKER_CONFIG`, falling back to `$HOME/.docker`.
    pub fn from_env() -> Option<Self> {
        if let Some(dir) = std::env::var_os(ENV_DOCKER_CONFIG).filter(|d| !d.is_empty()) {
            return Some(Self::new(PathBuf::from(dir)));
        }
        std::env::var_os("HOME")
            .filter(|h| !h.is_empty())
            .map(|home| Self::new(PathBuf::from(home).join(".docker")))
    }

    pub fn lookup(&self, registry: &str) -> Result<Option<Credentials>> {
        let raw = match std::fs::read(&self.config_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                warn!(path = %self.config_path.display(), error = %e, "cannot read docker config");
                return Ok(None);
            }
        };

        let config: DockerConfigFile = match serde_json::from_slice(&raw) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %self.config_path.display(), error = %e, "ignoring malformed docker config");
                return Ok(None);
            }
        };

        let wanted = normalize_host(registry);
        let entry = config
            .auths
            .iter()
            .find(|(key, _)| normalize_host(key) == wanted)
            .map(|(_, entry)| entry);

        let Some(entry) = entry else {
            debug!(registry, "no docker config entry");
            return Ok(None);
        };

        let credentials = match (&entry.auth, &entry.username, &entry.password) {
            (Some(auth), _, _) if !auth.is_empty() => decode_auth(auth)?,
            (_, Some(username), Some(password)) => {
                Credentials::new(username.clone(), password.clone(), CredentialSource::Keychain)
            }
            _ => return Ok(None),
        };

        credentials.validate()?;
        Ok(Some(credentials))
    }
}

fn decode_auth(auth: &str) -> Result<Credentials> {
    let invalid = |message: &str| PusherError::Credential {
        origin: CredentialSource::Keychain,
        message: message.to_string(),
    };

    let decoded = STANDARD
        .decode(auth.trim())
        .map_err(|_| invalid("auth entry is not valid base64"))?;
    let decoded = String::from_utf8(decoded).map_err(|_| invalid("auth entry is not UTF-8"))?;
    let (username, password) = decoded
        .split_once(':')
        .ok_or_else(|| invalid("auth entry must be username:password"))?;

    Ok(Credentials::new(username, password, CredentialSource::Keychain))
}

/// `https://index.docker.io/v1/` and `index.docker.io` name the same host.
fn normalize_host(raw: &str) -> String {
    let host = raw
        .trim_start_matches("https://")
        .trim_start_matches("http://");
    let host = host.split('/').next().unwrap_or(host);
    match host {
        "docker.io" | "registry-1.docker.io" => "index.docker.io".to_string(),
        other => other.to_ascii_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        unsafe {
            std::env::remove_var(ENV_REGISTRY_USER);
            std::env::remove_var(ENV_REGISTRY_PASSWORD);
            std::env::remove_var(ENV_DOCKER_CONFIG);
        }
    }

    fn empty_docker_config() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        unsafe {
            std::env::set_var(ENV_DOCKER_CONFIG, dir.path());
        }
        dir
    }

    #[test]
    fn test_validate_pairing() {
        assert!(Credentials::none().validate().is_ok());
        assert!(Credentials::new("u", "p", CredentialSource::Flags).validate().is_ok());

        let err = Credentials::new("u", "", CredentialSource::Env).validate().unwrap_err();
        assert!(matches!(
            err,
            PusherError::Credential {
                origin: CredentialSource::Env,
                ..
            }
        ));
        assert!(Credentials::new("", "p", CredentialSource::Flags).validate().is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let creds = Credentials::new("admin", "hunter2", CredentialSource::Flags);
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("admin"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    #[serial]
    fn test_flags_take_precedence_over_env() {
        clear_env();
        unsafe {
            std::env::set_var(ENV_REGISTRY_USER, "env-user");
            std::env::set_var(ENV_REGISTRY_PASSWORD, "env-pass");
        }

        let creds = resolve_credentials(Some("flag-user"), Some("flag-pass"), "localhost:5000").unwrap();
        assert_eq!(creds.source, CredentialSource::Flags);
        assert_eq!(creds.username, "flag-user");

        let creds = resolve_credentials(None, None, "localhost:5000").unwrap();
        assert_eq!(creds.source, CredentialSource::Env);
        assert_eq!(creds.password, "env-pass");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_partial_flags_fail_fast() {
        clear_env();
        let err = resolve_credentials(Some("only-user"), None, "localhost:5000").unwrap_err();
        assert!(matches!(
            err,
            PusherError::Credential {
                origin: CredentialSource::Flags,
                ..
            }
        ));
    }

    #[test]
    #[serial]
    fn test_partial_env_fails_fast() {
        clear_env();
        unsafe {
            std::env::set_var(ENV_REGISTRY_PASSWORD, "orphan");
        }
        let _dir = empty_docker_config();
        let err = resolve_credentials(None, None, "localhost:5000").unwrap_err();
        assert!(err.to_string().contains("environment"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_keychain_lookup() {
        clear_env();
        let dir = empty_docker_config();
        let auth = STANDARD.encode("robot:s3cret");
        let config = serde_json::json!({
            "auths": {
                "https://index.docker.io/v1/": { "auth": auth },
                "gitea.local:8443": { "username": "gitea", "password": "pw" }
            }
        });
        std::fs::write(dir.path().join("config.json"), config.to_string()).unwrap();

        let creds = resolve_credentials(None, None, "docker.io").unwrap();
        assert_eq!(creds.source, CredentialSource::Keychain);
        assert_eq!(creds.username, "robot");
        assert_eq!(creds.password, "s3cret");

        let creds = resolve_credentials(None, None, "gitea.local:8443").unwrap();
        assert_eq!(creds.username, "gitea");

        let creds = resolve_credentials(None, None, "unknown.example.com").unwrap();
        assert_eq!(creds.source, CredentialSource::None);
        assert!(creds.is_empty());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_missing_docker_config_means_anonymous() {
        clear_env();
        let _dir = empty_docker_config();
        let creds = resolve_credentials(None, None, "localhost:5000").unwrap();
        assert_eq!(creds, Credentials::none());
        clear_env();
    }
}
