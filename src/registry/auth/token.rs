//! Bearer token issuing
//!
//! [`RegistryTokenIssuer`] speaks the Docker registry token protocol: probe
//! `/v2/`, read the `WWW-Authenticate: Bearer realm=..,service=..,scope=..`
//! challenge, then fetch a token from the realm with basic credentials.

use super::credentials::Credentials;
use crate::error::{PusherError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// A freshly issued bearer token.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    /// Lifetime reported by the issuer, if any.
    pub expires_in: Option<Duration>,
}

impl fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedToken")
            .field("token", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Source of bearer tokens for a token authenticator.
#[async_trait]
pub trait TokenIssuer: Send + Sync + fmt::Debug {
    async fn issue(&self) -> Result<IssuedToken>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthChallenge {
    pub realm: String,
    pub service: String,
    pub scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
    expires_in: Option<u64>,
}

/// Parse `Bearer realm="...",service="...",scope="..."`.
pub fn parse_auth_challenge(header: &str) -> Option<AuthChallenge> {
    let (scheme, params) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut values = HashMap::new();
    let mut rest = params.trim();
    while !rest.is_empty() {
        let (key, after_key) = rest.split_once('=')?;
        let key = key.trim().trim_start_matches(',').trim();
        let after_key = after_key.trim_start();

        // quoted values may contain commas (scope="repository:a:pull,push")
        let (value, remainder) = if let Some(quoted) = after_key.strip_prefix('"') {
            let end = quoted.find('"')?;
            (&quoted[..end], &quoted[end + 1..])
        } else {
            match after_key.find(',') {
                Some(end) => (&after_key[..end], &after_key[end..]),
                None => (after_key, ""),
            }
        };

        values.insert(key.to_ascii_lowercase(), value.to_string());
        rest = remainder.trim_start().trim_start_matches(',').trim_start();
    }

    let realm = values.remove("realm")?;
    Some(AuthChallenge {
        realm,
        service: values.remove("service").unwrap_or_default(),
        scope: values.remove("scope"),
    })
}

/// Token issuer backed by the registry's token service.
pub struct RegistryTokenIssuer {
    client: Client,
    registry: String,
    api_base: Url,
    credentials: Option<Credentials>,
    scopes: RwLock<BTreeSet<String>>,
}

impl fmt::Debug for RegistryTokenIssuer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryTokenIssuer")
            .field("registry", &self.registry)
            .field("api_base", &self.api_base.as_str())
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl RegistryTokenIssuer {
    pub fn new(client: Client, registry: impl Into<String>, api_base: Url) -> Self {
        Self {
            client,
            registry: registry.into(),
            api_base,
            credentials: None,
            scopes: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = (!credentials.is_empty()).then_some(credentials);
        self
    }

    /// Request push access to `repository` with the next token.
    pub fn add_repository_scope(&self, repository: &str) {
        self.scopes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(format!("repository:{}:pull,push", repository));
    }

    fn auth_error(&self, message: impl Into<String>) -> PusherError {
        PusherError::Authentication {
            registry: self.registry.clone(),
            message: message.into(),
        }
    }

    async fn challenge(&self) -> Result<AuthChallenge> {
        let response = self.client.get(self.api_base.clone()).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Err(self.auth_error(format!(
                "expected a bearer challenge from /v2/, got status {}",
                response.status()
            )));
        }

        let header = response
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| self.auth_error("401 response without WWW-Authenticate header"))?;

        parse_auth_challenge(header)
            .ok_or_else(|| self.auth_error(format!("unsupported auth challenge: {}", header)))
    }
}

#[async_trait]
impl TokenIssuer for RegistryTokenIssuer {
    async fn issue(&self) -> Result<IssuedToken> {
        let challenge = self.challenge().await?;
        debug!(realm = %challenge.realm, service = %challenge.service, "requesting bearer token");

        let mut url = Url::parse(&challenge.realm)
            .map_err(|e| self.auth_error(format!("invalid token realm {}: {}", challenge.realm, e)))?;
        {
            let mut query = url.query_pairs_mut();
            if !challenge.service.is_empty() {
                query.append_pair("service", &challenge.service);
            }
            let scopes = self
                .scopes
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for scope in challenge.scope.iter().chain(scopes.iter()) {
                query.append_pair("scope", scope);
            }
        }

        let mut request = self.client.get(url);
        if let Some(credentials) = &self.credentials {
            request = request.basic_auth(&credentials.username, Some(&credentials.password));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.auth_error(format!(
                "token request failed with status {}: {}",
                status,
                body.trim()
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| self.auth_error(format!("invalid token response: {}", e)))?;
        let token = body
            .token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| self.auth_error("token response contained no token"))?;

        Ok(IssuedToken {
            token,
            expires_in: body.expires_in.map(Duration::from_secs),
        })
    }
}
