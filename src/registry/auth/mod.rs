//! Registry authentication
//!
//! An [`Authenticator`] signs outbound requests. There are exactly three
//! kinds:
//!
//! * [`AnonymousAuthenticator`] leaves requests untouched
//! * [`BasicAuthenticator`] injects a fixed `Basic` header
//! * [`TokenAuthenticator`] injects `Bearer <token>` and refreshes the token
//!   through a [`TokenIssuer`] once it is within 30 seconds of expiry
//!
//! [`new_authenticator`] is the only place that chooses between them.

pub mod credentials;
pub mod manager;
pub mod token;

pub use credentials::{
    CredentialSource, Credentials, DockerConfigKeychain, credentials_from_env, resolve_credentials,
};
pub use manager::{AuthManager, CredentialStore, KeychainCredentialStore, StaticCredentialStore};
pub use token::{IssuedToken, RegistryTokenIssuer, TokenIssuer, parse_auth_challenge};

use crate::error::{PusherError, Result};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::debug;

/// Tokens are treated as expired this long before their actual expiry.
pub const TOKEN_EXPIRY_GRACE: Duration = Duration::from_secs(30);

/// Lifetime assumed when the issuer does not report one.
pub const DEFAULT_TOKEN_EXPIRY: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    Anonymous,
    Basic,
    Bearer,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Anonymous => write!(f, "anonymous"),
            AuthMethod::Basic => write!(f, "basic"),
            AuthMethod::Bearer => write!(f, "bearer-token"),
        }
    }
}

/// Request-signing capability.
#[async_trait]
pub trait Authenticator: Send + Sync + fmt::Debug {
    /// Add credentials to the request.
    async fn authenticate(&self, request: &mut reqwest::Request) -> Result<()>;

    /// Obtain fresh credentials.
    async fn refresh(&self) -> Result<()>;

    /// Whether the current credentials can still be used.
    fn is_valid(&self) -> bool;

    fn method(&self) -> AuthMethod;
}

/// What kind of authenticator to build for a registry.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthConfig {
    None,
    Basic { username: String, password: String },
    /// Bearer tokens, optionally seeded with an initial token.
    Token { token: Option<String> },
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthConfig::None => write!(f, "None"),
            AuthConfig::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            AuthConfig::Token { token } => f
                .debug_struct("Token")
                .field("token", &token.as_ref().map(|_| "<redacted>"))
                .finish(),
        }
    }
}

impl AuthConfig {
    /// Basic auth for non-empty credentials, bearer tokens when `token_auth` is set.
    pub fn from_credentials(credentials: &Credentials, token_auth: bool) -> Self {
        if token_auth {
            AuthConfig::Token { token: None }
        } else if credentials.is_empty() {
            AuthConfig::None
        } else {
            AuthConfig::Basic {
                username: credentials.username.clone(),
                password: credentials.password.clone(),
            }
        }
    }
}

/// Build the authenticator for `config`; token authenticators refresh through `issuer`.
pub fn new_authenticator(
    registry: &str,
    config: &AuthConfig,
    issuer: Option<Arc<dyn TokenIssuer>>,
) -> Result<Arc<dyn Authenticator>> {
    let authenticator: Arc<dyn Authenticator> = match config {
        AuthConfig::None => Arc::new(AnonymousAuthenticator),
        AuthConfig::Basic { username, password } => {
            Arc::new(BasicAuthenticator::new(registry, username, password)?)
        }
        AuthConfig::Token { token } => {
            let auth = TokenAuthenticator::new(registry, issuer);
            if let Some(token) = token.as_deref().filter(|t| !t.is_empty()) {
                auth.set_token(token, DEFAULT_TOKEN_EXPIRY);
            }
            Arc::new(auth)
        }
    };
    Ok(authenticator)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousAuthenticator;

#[async_trait]
impl Authenticator for AnonymousAuthenticator {
    async fn authenticate(&self, _request: &mut reqwest::Request) -> Result<()> {
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    fn is_valid(&self) -> bool {
        true
    }

    fn method(&self) -> AuthMethod {
        AuthMethod::Anonymous
    }
}

pub struct BasicAuthenticator {
    header: HeaderValue,
}

impl fmt::Debug for BasicAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BasicAuthenticator { .. }")
    }
}

impl BasicAuthenticator {
    pub fn new(registry: &str, username: &str, password: &str) -> Result<Self> {
        let encoded = STANDARD.encode(format!("{}:{}", username, password));
        let mut header = HeaderValue::from_str(&format!("Basic {}", encoded)).map_err(|_| {
            PusherError::Authentication {
                registry: registry.to_string(),
                message: "credentials cannot be encoded as a header".to_string(),
            }
        })?;
        header.set_sensitive(true);
        Ok(Self { header })
    }
}

#[async_trait]
impl Authenticator for BasicAuthenticator {
    async fn authenticate(&self, request: &mut reqwest::Request) -> Result<()> {
        request
            .headers_mut()
            .insert(AUTHORIZATION, self.header.clone());
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    fn is_valid(&self) -> bool {
        true
    }

    fn method(&self) -> AuthMethod {
        AuthMethod::Basic
    }
}

#[derive(Default)]
struct TokenState {
    token: String,
    expires_at: Option<Instant>,
}

pub struct TokenAuthenticator {
    registry: String,
    state: RwLock<TokenState>,
    issuer: Option<Arc<dyn TokenIssuer>>,
}

impl fmt::Debug for TokenAuthenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenAuthenticator")
            .field("registry", &self.registry)
            .field("valid", &self.is_valid())
            .field("issuer", &self.issuer)
            .finish()
    }
}

impl TokenAuthenticator {
    pub fn new(registry: impl Into<String>, issuer: Option<Arc<dyn TokenIssuer>>) -> Self {
        Self {
            registry: registry.into(),
            state: RwLock::new(TokenState::default()),
            issuer,
        }
    }

    /// Replace the token; it expires `ttl` from now.
    pub fn set_token(&self, token: impl Into<String>, ttl: Duration) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.token = token.into();
        state.expires_at = Instant::now().checked_add(ttl);
    }

    fn current_token(&self) -> String {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .token
            .clone()
    }

    fn auth_error(&self, message: impl Into<String>) -> PusherError {
        PusherError::Authentication {
            registry: self.registry.clone(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, request: &mut reqwest::Request) -> Result<()> {
        let mut token = self.current_token();
        if token.is_empty() {
            self.refresh().await?;
            token = self.current_token();
        }
        if token.is_empty() {
            return Err(self.auth_error("no bearer token available"));
        }

        let mut header = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|_| self.auth_error("token cannot be encoded as a header"))?;
        header.set_sensitive(true);
        request.headers_mut().insert(AUTHORIZATION, header);
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        let issuer = self
            .issuer
            .as_ref()
            .ok_or_else(|| self.auth_error("no token issuer configured"))?;

        let issued = issuer.issue().await?;
        let ttl = issued.expires_in.unwrap_or(DEFAULT_TOKEN_EXPIRY);
        self.set_token(issued.token, ttl);
        debug!(registry = %self.registry, ttl_secs = ttl.as_secs(), "bearer token refreshed");
        Ok(())
    }

    fn is_valid(&self) -> bool {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if state.token.is_empty() {
            return false;
        }
        match state.expires_at {
            Some(expires_at) => Instant::now() + TOKEN_EXPIRY_GRACE < expires_at,
            None => true,
        }
    }

    fn method(&self) -> AuthMethod {
        AuthMethod::Bearer
    }
}
