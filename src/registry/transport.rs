//! Authenticated HTTP transport
//!
//! [`AuthTransport`] wraps a [`RequestSender`] and signs every request with an
//! [`Authenticator`]. The caller's request is never mutated: each send works
//! on a fresh clone. A `401 Unauthorized` response triggers exactly one
//! credential refresh and one resend of a newly signed clone; a second 401 is
//! returned to the caller as is.

use crate::error::{PusherError, Result};
use crate::logging::PushLogger;
use crate::registry::auth::{AuthManager, Authenticator};
use async_trait::async_trait;
use reqwest::{Client, Request, Response, StatusCode};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

/// Something that can execute an HTTP request.
#[async_trait]
pub trait RequestSender: Send + Sync + fmt::Debug {
    async fn send(&self, request: Request) -> Result<Response>;
}

#[async_trait]
impl RequestSender for Client {
    async fn send(&self, request: Request) -> Result<Response> {
        Ok(self.execute(request).await?)
    }
}

/// HTTP client for registry traffic. `insecure` turns off certificate verification.
pub fn build_http_client(insecure: bool, timeout: Duration, user_agent: &str) -> Result<Client> {
    if insecure {
        warn!("TLS certificate verification is disabled");
    }

    Client::builder()
        .user_agent(user_agent)
        .timeout(timeout)
        .danger_accept_invalid_certs(insecure)
        .build()
        .map_err(|e| PusherError::Config(format!("Failed to create HTTP client: {}", e)))
}

pub struct AuthTransport {
    inner: Arc<dyn RequestSender>,
    authenticator: Arc<dyn Authenticator>,
    registry: String,
    logger: PushLogger,
}

impl fmt::Debug for AuthTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthTransport")
            .field("registry", &self.registry)
            .field("method", &self.authenticator.method())
            .finish()
    }
}

impl AuthTransport {
    pub fn new(
        inner: Arc<dyn RequestSender>,
        authenticator: Arc<dyn Authenticator>,
        registry: impl Into<String>,
    ) -> Self {
        Self {
            inner,
            authenticator,
            registry: registry.into(),
            logger: PushLogger,
        }
    }

    /// Sign and send a clone of `request`, refreshing once on 401.
    pub async fn round_trip(&self, request: &Request) -> Result<Response> {
        if !self.authenticator.is_valid() {
            debug!(registry = %self.registry, "credentials expired, refreshing before send");
            self.refresh().await?;
        }

        let signed = self.signed_clone(request).await?;
        let response = self.send_logged(signed).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        // release the connection before retrying
        drop(response);
        debug!(registry = %self.registry, url = %request.url(), "401 received, refreshing credentials");
        self.refresh().await?;

        let resigned = self.signed_clone(request).await?;
        self.send_logged(resigned).await
    }

    async fn send_logged(&self, request: Request) -> Result<Response> {
        let method = request.method().clone();
        let url = request.url().clone();
        self.logger.registry_request(method.as_str(), url.as_str());
        let response = self.inner.send(request).await?;
        self.logger
            .registry_response(method.as_str(), url.as_str(), response.status().as_u16());
        Ok(response)
    }

    async fn signed_clone(&self, request: &Request) -> Result<Request> {
        let mut clone = request.try_clone().ok_or_else(|| {
            PusherError::Validation(format!(
                "request to {} has a streaming body and cannot be replayed",
                request.url()
            ))
        })?;
        self.authenticator
            .authenticate(&mut clone)
            .await
            .map_err(|e| self.auth_error(e))?;
        Ok(clone)
    }

    async fn refresh(&self) -> Result<()> {
        self.authenticator
            .refresh()
            .await
            .map_err(|e| self.auth_error(e))
    }

    fn auth_error(&self, err: PusherError) -> PusherError {
        match err {
            PusherError::Authentication { .. } | PusherError::Cancelled => err,
            other => PusherError::Authentication {
                registry: self.registry.clone(),
                message: other.to_string(),
            },
        }
    }
}

#[async_trait]
impl RequestSender for AuthTransport {
    async fn send(&self, request: Request) -> Result<Response> {
        self.round_trip(&request).await
    }
}

/// Routes each request through the [`AuthManager`] entry for its host.
///
/// The authenticator is looked up per request, so an expired entry is
/// rebuilt from the credential store before it is used.
#[derive(Debug)]
pub struct ManagedTransport {
    inner: Arc<dyn RequestSender>,
    manager: Arc<AuthManager>,
}

impl ManagedTransport {
    pub fn new(inner: Arc<dyn RequestSender>, manager: Arc<AuthManager>) -> Self {
        Self { inner, manager }
    }
}

#[async_trait]
impl RequestSender for ManagedTransport {
    async fn send(&self, request: Request) -> Result<Response> {
        let registry = registry_of(request.url());
        let authenticator = self.manager.get(&registry)?;
        AuthTransport::new(Arc::clone(&self.inner), authenticator, registry)
            .round_trip(&request)
            .await
    }
}

/// `host[:port]` of a registry URL.
fn registry_of(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingAuthenticator, ScriptedSender};
    use reqwest::Method;
    use reqwest::header::AUTHORIZATION;

    fn get(url: &str) -> Request {
        Request::new(Method::GET, url.parse().unwrap())
    }

    #[tokio::test]
    async fn test_signs_clone_not_original() {
        let sender = Arc::new(ScriptedSender::new(vec![200]));
        let auth = Arc::new(CountingAuthenticator::valid());
        let transport = AuthTransport::new(sender.clone(), auth.clone(), "localhost:5000");

        let request = get("http://localhost:5000/v2/");
        let response = transport.round_trip(&request).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(request.headers().get(AUTHORIZATION).is_none());
        assert_eq!(sender.recorded()[0].authorization.as_deref(), Some("Bearer token-0"));
        assert_eq!(auth.refreshes(), 0);
    }

    #[tokio::test]
    async fn test_refreshes_before_send_when_invalid() {
        let sender = Arc::new(ScriptedSender::new(vec![200]));
        let auth = Arc::new(CountingAuthenticator::invalid());
        let transport = AuthTransport::new(sender.clone(), auth.clone(), "localhost:5000");

        transport.round_trip(&get("http://localhost:5000/v2/")).await.unwrap();
        assert_eq!(auth.refreshes(), 1);
        assert_eq!(sender.recorded()[0].authorization.as_deref(), Some("Bearer token-1"));
    }

    #[tokio::test]
    async fn test_single_refresh_and_resend_on_401() {
        let sender = Arc::new(ScriptedSender::new(vec![401, 200]));
        let auth = Arc::new(CountingAuthenticator::valid());
        let transport = AuthTransport::new(sender.clone(), auth.clone(), "localhost:5000");

        let response = transport
            .round_trip(&get("http://localhost:5000/v2/app/manifests/v1"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(auth.refreshes(), 1);
        let recorded = sender.recorded();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[1].authorization.as_deref(), Some("Bearer token-1"));
    }

    #[tokio::test]
    async fn test_second_401_is_returned() {
        let sender = Arc::new(ScriptedSender::new(vec![401, 401, 200]));
        let auth = Arc::new(CountingAuthenticator::valid());
        let transport = AuthTransport::new(sender.clone(), auth.clone(), "localhost:5000");

        let response = transport.round_trip(&get("http://localhost:5000/v2/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(auth.refreshes(), 1);
        assert_eq!(sender.recorded().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_sends_nothing_more() {
        let sender = Arc::new(ScriptedSender::new(vec![401, 200]));
        let auth = Arc::new(CountingAuthenticator::valid().failing_refresh());
        let transport = AuthTransport::new(sender.clone(), auth.clone(), "localhost:5000");

        let err = transport.round_trip(&get("http://localhost:5000/v2/")).await.unwrap_err();

        assert!(matches!(err, PusherError::Authentication { .. }));
        assert_eq!(sender.recorded().len(), 1);
    }

    #[tokio::test]
    async fn test_post_body_is_replayed() {
        let sender = Arc::new(ScriptedSender::new(vec![401, 201]));
        let auth = Arc::new(CountingAuthenticator::valid());
        let transport = AuthTransport::new(sender.clone(), auth, "localhost:5000");

        let mut request = Request::new(Method::PUT, "http://localhost:5000/v2/app/manifests/v1".parse().unwrap());
        *request.body_mut() = Some(reqwest::Body::from(b"{}".to_vec()));

        let response = transport.round_trip(&request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(sender.recorded()[1].body_len, 2);
    }

    #[tokio::test]
    async fn test_managed_transport_uses_host_credentials() {
        use crate::registry::auth::{AuthConfig, StaticCredentialStore};

        let store = StaticCredentialStore::new(AuthConfig::None).with_registry(
            "localhost:5000",
            AuthConfig::Basic {
                username: "user".to_string(),
                password: "pass".to_string(),
            },
        );
        let manager = Arc::new(AuthManager::new(Arc::new(store)));
        let sender = Arc::new(ScriptedSender::new(vec![200, 200]));
        let transport = ManagedTransport::new(sender.clone(), manager.clone());

        transport.send(get("http://localhost:5000/v2/")).await.unwrap();
        transport.send(get("https://ghcr.io/v2/")).await.unwrap();

        let recorded = sender.recorded();
        assert!(recorded[0].authorization.as_deref().unwrap().starts_with("Basic "));
        assert!(recorded[1].authorization.is_none());
        assert_eq!(manager.cached_count(), 2);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_each_send_is_logged() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let sender = Arc::new(ScriptedSender::new(vec![401, 200]));
        let transport = AuthTransport::new(sender, Arc::new(CountingAuthenticator::valid()), "localhost:5000");
        transport.round_trip(&get("http://localhost:5000/v2/")).await.unwrap();

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert_eq!(output.matches("Registry request").count(), 2);
        assert_eq!(output.matches("Registry response").count(), 2);
        assert!(output.contains("status=401"));
        assert!(output.contains("status=200"));
    }

    #[test]
    fn test_registry_of_keeps_port() {
        let url: Url = "http://localhost:5000/v2/".parse().unwrap();
        assert_eq!(registry_of(&url), "localhost:5000");
        let url: Url = "https://ghcr.io/v2/".parse().unwrap();
        assert_eq!(registry_of(&url), "ghcr.io");
    }
}
