//! Push operation orchestration
//!
//! [`PushOperation::execute`] runs one complete push: discover images under
//! the build path, filter and validate them, then push them concurrently and
//! collect a [`PushOperationResult`]. Validation is all-or-nothing and runs
//! before any network traffic; push failures of individual images are
//! collected and do not stop the others.

use crate::buffer_pool::{BufferPool, DEFAULT_BUFFER_SIZE};
use crate::config::PushConfig;
use crate::discovery::{discover_local_images_with_options, filter_push_targets};
use crate::error::{PusherError, Result};
use crate::logging::{PushLogger, format_bytes, format_duration};
use crate::metrics::{MetricsRecorder, NoOpMetrics, PushMetrics};
use crate::progress::{ProgressReporter, ProgressTracker};
use crate::pusher::{ImagePusher, PushResult, validate_image};
use crate::registry::auth::{
    AuthManager, KeychainCredentialStore, RegistryTokenIssuer, TokenIssuer,
};
use crate::registry::{
    ManagedTransport, Reference, RegistryWriter, RequestSender, WriteOptions, build_http_client,
    is_insecure_registry,
};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use url::Url;

/// Aggregate outcome of [`PushOperation::execute`].
#[derive(Debug, Clone, Default)]
pub struct PushOperationResult {
    pub images_found: usize,
    pub images_pushed: usize,
    pub images_failed: usize,
    pub total_bytes: u64,
    /// One entry per discovered image, in discovery order.
    pub results: Vec<PushResult>,
    pub errors: Vec<PusherError>,
    pub metrics: PushMetrics,
    pub duration: Duration,
}

impl PushOperationResult {
    pub fn is_success(&self) -> bool {
        self.images_failed == 0
    }

    /// Percentage of found images that were pushed; 0 when nothing was found.
    pub fn success_rate(&self) -> f64 {
        if self.images_found == 0 {
            return 0.0;
        }
        self.images_pushed as f64 / self.images_found as f64 * 100.0
    }

    pub fn summary(&self) -> String {
        format!(
            "Push Operation Summary:\n  Duration: {}\n  Images Found: {}\n  Images Pushed: {}\n  Images Failed: {}\n  Success Rate: {:.1}%\n  Total Bytes: {}\n  Average Throughput: {:.2} MB/s",
            format_duration(self.duration),
            self.images_found,
            self.images_pushed,
            self.images_failed,
            self.success_rate(),
            format_bytes(self.total_bytes),
            self.metrics.average_throughput_mbps(),
        )
    }
}

/// An operation that stopped before it could push, with the partial result.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct OperationError {
    /// Everything aggregated before the failure; `errors` includes `error`.
    pub result: Box<PushOperationResult>,
    #[source]
    pub error: PusherError,
}

impl From<OperationError> for PusherError {
    fn from(err: OperationError) -> Self {
        err.error
    }
}

impl fmt::Display for PushOperationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.summary())
    }
}

pub struct PushOperation {
    config: PushConfig,
    sender: Option<Arc<dyn RequestSender>>,
    progress: Arc<dyn ProgressReporter>,
    metrics: Arc<dyn MetricsRecorder>,
    logger: PushLogger,
}

impl fmt::Debug for PushOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PushOperation")
            .field("registry", &self.config.registry)
            .field("build_path", &self.config.build_path)
            .finish()
    }
}

impl PushOperation {
    /// Operation with console progress and registry traffic over reqwest.
    pub fn new(config: PushConfig) -> Self {
        Self {
            config,
            sender: None,
            progress: Arc::new(ProgressTracker::stdout()),
            metrics: Arc::new(NoOpMetrics),
            logger: PushLogger,
        }
    }

    /// Operation with caller-supplied collaborators. `sender` replaces the
    /// HTTP client for registry requests; authentication still wraps it.
    pub fn with_components(
        config: PushConfig,
        sender: Option<Arc<dyn RequestSender>>,
        progress: Arc<dyn ProgressReporter>,
        metrics: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            config,
            sender,
            progress,
            metrics,
            logger: PushLogger,
        }
    }

    pub fn config(&self) -> &PushConfig {
        &self.config
    }

    /// Run the whole operation.
    ///
    /// Per-image push failures and a cancelled batch are recorded in the
    /// returned result. Failures that stop the operation as a whole
    /// (discovery, validation, credentials) come back as an
    /// [`OperationError`] that still carries everything aggregated so far.
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
    ) -> std::result::Result<PushOperationResult, OperationError> {
        let started = Instant::now();
        let mut result = PushOperationResult::default();
        let outcome = self.run(cancel, &mut result).await;
        result.duration = started.elapsed();
        result.metrics.total_duration = result.duration;

        match outcome {
            Ok(()) => Ok(result),
            Err(error) => {
                result.errors.push(error.clone());
                Err(OperationError {
                    result: Box::new(result),
                    error,
                })
            }
        }
    }

    async fn run(&self, cancel: &CancellationToken, result: &mut PushOperationResult) -> Result<()> {
        let discovery_started = Instant::now();
        let options = self.config.discovery.clone();
        let mut images =
            tokio::task::spawn_blocking(move || discover_local_images_with_options(&options))
                .await??;
        if let Some(filter) = &self.config.filter {
            images = filter_push_targets(images, filter);
        }
        result.metrics.discovery_duration = discovery_started.elapsed();
        result.images_found = images.len();

        if images.is_empty() {
            info!(path = %self.config.build_path.display(), "No images found to push");
            return Ok(());
        }
        info!(count = images.len(), "Discovered images");

        for image in &images {
            if cancel.is_cancelled() {
                return Err(PusherError::Cancelled);
            }
            let handle = Arc::clone(&image.image);
            let outcome = tokio::task::spawn_blocking(move || validate_image(handle.as_ref())).await?;
            if let Err(err) = outcome {
                self.logger.image_validation(&image.name, false, &err.to_string());
                return Err(PusherError::Validation(format!(
                    "image {} ({}) failed validation: {}",
                    image.name,
                    image.path.display(),
                    err
                )));
            }
            self.logger.image_validation(&image.name, true, "");
        }

        let targets: Vec<_> = images
            .iter()
            .map(|image| (image.clone(), Reference::for_image(&self.config.registry, &image.name)))
            .collect();

        let client = build_http_client(
            self.config.insecure,
            self.config.timeout,
            &self.config.user_agent,
        )?;
        let manager = Arc::new(self.auth_manager(&client, &targets));
        let hosts: BTreeSet<String> = targets
            .iter()
            .filter_map(|(_, r)| r.as_ref().ok())
            .map(|r| r.registry_host().to_string())
            .collect();
        for host in &hosts {
            let authenticator = manager.get(host)?;
            self.logger.authentication(host, authenticator.method());
        }

        let inner: Arc<dyn RequestSender> = match &self.sender {
            Some(sender) => Arc::clone(sender),
            None => Arc::new(client),
        };
        let writer = RegistryWriter::new(
            Arc::new(ManagedTransport::new(inner, manager)),
            BufferPool::new(DEFAULT_BUFFER_SIZE),
            WriteOptions {
                chunk_size: self.config.chunk_size,
                plain_http: self.config.plain_http,
            },
        );
        let pusher = Arc::new(ImagePusher::new(
            writer,
            Arc::clone(&self.progress),
            Arc::clone(&self.metrics),
            self.config.backoff.clone(),
        ));

        let push_started = Instant::now();
        let outcome = pusher
            .batch_push(targets, self.config.concurrency, cancel)
            .await;
        result.metrics.push_duration = push_started.elapsed();

        // results arrive in completion order
        let mut by_name: HashMap<String, Vec<PushResult>> = HashMap::new();
        for push in outcome.results {
            by_name.entry(push.image_name.clone()).or_default().push(push);
        }
        let mut unfinished = 0usize;
        for image in &images {
            let push = match (by_name.get_mut(&image.name).and_then(Vec::pop), &outcome.error) {
                (Some(push), _) => push,
                (None, Some(err)) => {
                    unfinished += 1;
                    let reference = Reference::for_image(&self.config.registry, &image.name)
                        .map(|r| r.to_string())
                        .unwrap_or_default();
                    PushResult::failed(image.name.clone(), reference, err.clone(), 0, Duration::ZERO)
                }
                (None, None) => continue,
            };
            result.metrics.retries += push.retry_count;
            match &push.error {
                None => {
                    result.images_pushed += 1;
                    result.total_bytes += push.size_bytes;
                    result.metrics.layers_uploaded += push.layers_uploaded;
                }
                Some(err) => {
                    result.images_failed += 1;
                    result.errors.push(err.clone());
                }
            }
            result.results.push(push);
        }
        if let Some(err) = outcome.error {
            warn!(unfinished, error = %err, "batch stopped before every push finished");
            if unfinished == 0 {
                result.errors.push(err);
            }
        }

        result.metrics.total_bytes = result.total_bytes;
        result.metrics.images_pushed = result.images_pushed;
        self.logger.performance_metrics(
            result.total_bytes,
            result.metrics.push_duration,
            result.images_pushed,
        );

        Ok(())
    }

    fn auth_manager(
        &self,
        client: &reqwest::Client,
        targets: &[(crate::image::LocalImage, Result<Reference>)],
    ) -> AuthManager {
        let store = Arc::new(KeychainCredentialStore::new(
            self.config.username.clone(),
            self.config.password.clone(),
            self.config.token_auth,
        ));
        let manager = AuthManager::new(store.clone());
        if !self.config.token_auth {
            return manager;
        }

        let mut repositories: HashMap<String, Vec<String>> = HashMap::new();
        for reference in targets.iter().filter_map(|(_, r)| r.as_ref().ok()) {
            repositories
                .entry(reference.registry_host().to_string())
                .or_default()
                .push(reference.repository.clone());
        }

        let client = client.clone();
        let plain_http = self.config.plain_http;
        manager.with_issuer_factory(Arc::new(move |registry: &str| {
            let scheme = if plain_http || is_insecure_registry(registry) {
                "http"
            } else {
                "https"
            };
            let api_base = Url::parse(&format!("{}://{}/v2/", scheme, registry)).ok()?;
            let mut issuer = RegistryTokenIssuer::new(client.clone(), registry, api_base);
            if let Ok(credentials) = store.resolve(registry) {
                issuer = issuer.with_credentials(credentials);
            }
            for repository in repositories.get(registry).into_iter().flatten() {
                issuer.add_repository_scope(repository);
            }
            Some(Arc::new(issuer) as Arc<dyn TokenIssuer>)
        }))
    }
}
