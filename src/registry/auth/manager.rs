//! Per-registry authenticator cache

use super::credentials::{Credentials, resolve_credentials};
use super::{AuthConfig, Authenticator, TokenIssuer, new_authenticator};
use crate::error::Result;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Supplies the auth configuration used to (re)build a registry's authenticator.
pub trait CredentialStore: Send + Sync + fmt::Debug {
    fn get_credentials(&self, registry: &str) -> Result<AuthConfig>;
}

/// Fixed per-registry configuration with a fallback for unknown registries.
#[derive(Debug, Clone)]
pub struct StaticCredentialStore {
    configs: HashMap<String, AuthConfig>,
    fallback: AuthConfig,
}

impl StaticCredentialStore {
    pub fn new(fallback: AuthConfig) -> Self {
        Self {
            configs: HashMap::new(),
            fallback,
        }
    }

    pub fn with_registry(mut self, registry: impl Into<String>, config: AuthConfig) -> Self {
        self.configs.insert(registry.into(), config);
        self
    }
}

impl CredentialStore for StaticCredentialStore {
    fn get_credentials(&self, registry: &str) -> Result<AuthConfig> {
        Ok(self
            .configs
            .get(registry)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}

/// Resolves flags, environment and Docker config on every rebuild.
#[derive(Debug, Clone)]
pub struct KeychainCredentialStore {
    flag_user: Option<String>,
    flag_pass: Option<String>,
    token_auth: bool,
}

impl KeychainCredentialStore {
    pub fn new(flag_user: Option<String>, flag_pass: Option<String>, token_auth: bool) -> Self {
        Self {
            flag_user,
            flag_pass,
            token_auth,
        }
    }

    pub fn resolve(&self, registry: &str) -> Result<Credentials> {
        resolve_credentials(self.flag_user.as_deref(), self.flag_pass.as_deref(), registry)
    }
}

impl CredentialStore for KeychainCredentialStore {
    fn get_credentials(&self, registry: &str) -> Result<AuthConfig> {
        let credentials = self.resolve(registry)?;
        Ok(AuthConfig::from_credentials(&credentials, self.token_auth))
    }
}

pub type IssuerFactory = Arc<dyn Fn(&str) -> Option<Arc<dyn TokenIssuer>> + Send + Sync>;

/// Caches one authenticator per registry host.
///
/// `get` hands out the cached authenticator while it reports itself valid
/// and rebuilds it from the [`CredentialStore`] otherwise.
pub struct AuthManager {
    cache: RwLock<HashMap<String, Arc<dyn Authenticator>>>,
    store: Arc<dyn CredentialStore>,
    issuers: Option<IssuerFactory>,
}

impl fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cached: Vec<String> = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        f.debug_struct("AuthManager")
            .field("cached", &cached)
            .field("store", &self.store)
            .finish()
    }
}

impl AuthManager {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self {
            cache: RwLock::new(HashMap::new()),
            store,
            issuers: None,
        }
    }

    /// Token issuer to hand to bearer-token authenticators built for a registry.
    pub fn with_issuer_factory(mut self, factory: IssuerFactory) -> Self {
        self.issuers = Some(factory);
        self
    }

    pub fn get(&self, registry: &str) -> Result<Arc<dyn Authenticator>> {
        {
            let cache = self.cache.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = cache.get(registry) {
                if existing.is_valid() {
                    return Ok(Arc::clone(existing));
                }
            }
        }

        let config = self.store.get_credentials(registry)?;
        let issuer = self.issuers.as_ref().and_then(|factory| factory(registry));
        let fresh = new_authenticator(registry, &config, issuer)?;

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        // another caller may have rebuilt it while we were unlocked
        if let Some(existing) = cache.get(registry) {
            if existing.is_valid() {
                return Ok(Arc::clone(existing));
            }
        }

        debug!(registry, method = %fresh.method(), "authenticator rebuilt");
        cache.insert(registry.to_string(), Arc::clone(&fresh));
        Ok(fresh)
    }

    pub fn clear(&self, registry: &str) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(registry);
    }

    pub fn clear_all(&self) {
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn cached_count(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
