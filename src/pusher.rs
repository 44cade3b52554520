//! Push engine
//!
//! [`ImagePusher`] uploads single images ([`ImagePusher::push`]), wraps that in
//! the retry engine ([`ImagePusher::push_with_retry`]) and fans a batch out
//! over a bounded number of concurrent pushes ([`ImagePusher::batch_push`]).

use crate::config::DEFAULT_CONCURRENCY;
use crate::error::{PusherError, Result};
use crate::image::{Image, LocalImage};
use crate::logging::PushLogger;
use crate::metrics::MetricsRecorder;
use crate::progress::ProgressReporter;
use crate::registry::{Reference, RegistryWriter};
use crate::retry::{BackoffStrategy, with_retry_notify};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outcome of pushing one image.
#[derive(Debug, Clone)]
pub struct PushResult {
    pub image_name: String,
    pub reference: String,
    /// Manifest digest; empty when the push failed.
    pub digest: String,
    pub size_bytes: u64,
    pub duration: Duration,
    pub error: Option<PusherError>,
    pub retry_count: u32,
    pub layers_uploaded: usize,
}

impl PushResult {
    pub fn failed(
        image_name: impl Into<String>,
        reference: impl Into<String>,
        error: PusherError,
        retry_count: u32,
        duration: Duration,
    ) -> Self {
        Self {
            image_name: image_name.into(),
            reference: reference.into(),
            digest: String::new(),
            size_bytes: 0,
            duration,
            error: Some(error),
            retry_count,
            layers_uploaded: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Results of a batch. `error` is set when the batch stopped early.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub results: Vec<PushResult>,
    pub error: Option<PusherError>,
}

/// Calls `finish_image` when dropped, so every started image is finished.
struct FinishGuard<'a> {
    progress: &'a dyn ProgressReporter,
    key: &'a str,
}

impl Drop for FinishGuard<'_> {
    fn drop(&mut self) {
        self.progress.finish_image(self.key);
    }
}

pub struct ImagePusher {
    writer: RegistryWriter,
    progress: Arc<dyn ProgressReporter>,
    metrics: Arc<dyn MetricsRecorder>,
    backoff: BackoffStrategy,
    logger: PushLogger,
}

impl fmt::Debug for ImagePusher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImagePusher")
            .field("writer", &self.writer)
            .field("backoff", &self.backoff)
            .finish()
    }
}

impl ImagePusher {
    pub fn new(
        writer: RegistryWriter,
        progress: Arc<dyn ProgressReporter>,
        metrics: Arc<dyn MetricsRecorder>,
        backoff: BackoffStrategy,
    ) -> Self {
        Self {
            writer,
            progress,
            metrics,
            backoff,
            logger: PushLogger,
        }
    }

    /// Push one image once.
    pub async fn push(
        &self,
        image: &LocalImage,
        reference: &Reference,
        cancel: &CancellationToken,
    ) -> Result<PushResult> {
        let started = Instant::now();
        let reference_str = reference.to_string();

        let handle = Arc::clone(&image.image);
        let (size, digest) = tokio::task::spawn_blocking(move || {
            let size = handle.manifest().map(|m| m.total_size()).ok();
            (size, handle.digest().ok())
        })
        .await?;
        let key = digest.unwrap_or_else(|| reference_str.clone());

        self.logger.push_start(&image.name, &reference_str, size);
        self.metrics.record_push_start(&image.name);
        self.progress.start_image(&key, size);
        let _finish = FinishGuard {
            progress: self.progress.as_ref(),
            key: &key,
        };

        let outcome = match self
            .writer
            .write(reference, Arc::clone(&image.image), self.progress.as_ref(), &key, cancel)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                self.progress.set_error(&key, &err);
                return Err(err);
            }
        };

        for blob in outcome.blobs.iter().filter(|b| !b.skipped) {
            self.metrics
                .record_layer_upload(&image.name, &blob.digest, blob.size, blob.duration);
        }
        let uploaded = outcome.uploaded_bytes();
        self.metrics.record_progress(&image.name, uploaded, size);

        Ok(PushResult {
            image_name: image.name.clone(),
            reference: reference_str,
            digest: outcome.digest.clone(),
            size_bytes: size.unwrap_or(uploaded),
            duration: started.elapsed(),
            error: None,
            retry_count: 0,
            layers_uploaded: outcome.uploaded_layers(),
        })
    }

    /// Push with the retry engine. Failures are reported in the result.
    pub async fn push_with_retry(
        &self,
        image: &LocalImage,
        reference: &Reference,
        cancel: &CancellationToken,
    ) -> PushResult {
        let started = Instant::now();
        let mut retries = 0u32;

        let outcome = with_retry_notify(
            &self.backoff,
            cancel,
            |attempt, err, delay| {
                retries = attempt;
                self.logger.retry_attempt(&image.name, attempt, delay, err);
                self.metrics.record_retry(&image.name, attempt);
            },
            move |_| self.push(image, reference, cancel),
        )
        .await;

        match outcome {
            Ok(mut result) => {
                result.retry_count = retries;
                result.duration = started.elapsed();
                self.logger
                    .push_complete(&image.name, &result.digest, result.duration);
                self.metrics.record_push_complete(
                    &image.name,
                    result.size_bytes,
                    result.duration,
                    true,
                );
                result
            }
            Err(err) => {
                self.logger.push_error(&image.name, &err);
                self.metrics
                    .record_push_complete(&image.name, 0, started.elapsed(), false);
                PushResult::failed(
                    image.name.clone(),
                    reference.to_string(),
                    err,
                    retries,
                    started.elapsed(),
                )
            }
        }
    }

    /// Push every image with at most `max_concurrency` pushes in flight.
    ///
    /// `0` selects the default concurrency. Results arrive in completion
    /// order. When `cancel` fires the call returns with the results gathered
    /// so far; pushes already running are left to observe the token on their
    /// own.
    pub async fn batch_push(
        self: &Arc<Self>,
        images: Vec<(LocalImage, Result<Reference>)>,
        max_concurrency: usize,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        let slots = if max_concurrency == 0 {
            DEFAULT_CONCURRENCY
        } else {
            max_concurrency
        };
        let semaphore = Arc::new(Semaphore::new(slots));
        let mut outcome = BatchOutcome::default();
        let mut pending = FuturesUnordered::new();

        for (image, reference) in images {
            let reference = match reference {
                Ok(reference) => reference,
                Err(err) => {
                    warn!(image = %image.name, error = %err, "cannot build reference, skipping push");
                    outcome.results.push(PushResult::failed(
                        image.name.clone(),
                        String::new(),
                        err,
                        0,
                        Duration::ZERO,
                    ));
                    continue;
                }
            };

            let name = image.name.clone();
            let reference_str = reference.to_string();
            let pusher = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();

            let handle = tokio::spawn(async move {
                let permit = tokio::select! {
                    _ = cancel.cancelled() => None,
                    permit = semaphore.acquire_owned() => permit.ok(),
                };
                let Some(_permit) = permit else {
                    return PushResult::failed(
                        image.name.clone(),
                        reference.to_string(),
                        PusherError::Cancelled,
                        0,
                        Duration::ZERO,
                    );
                };
                debug!(image = %image.name, "push slot acquired");
                pusher.push_with_retry(&image, &reference, &cancel).await
            });

            pending.push(async move { (name, reference_str, handle.await) });
        }

        loop {
            // collect finished pushes before honouring the token
            tokio::select! {
                biased;
                next = pending.next() => match next {
                    Some((_, _, Ok(result))) => outcome.results.push(result),
                    Some((name, reference, Err(err))) => {
                        outcome.results.push(PushResult::failed(name, reference, err.into(), 0, Duration::ZERO));
                    }
                    None => break,
                },
                _ = cancel.cancelled() => {
                    outcome.error = Some(PusherError::Cancelled);
                    return outcome;
                }
            }
        }

        outcome
    }
}

/// Check that an image can be pushed: decodable manifest and a usable config.
pub fn validate_image(image: &dyn Image) -> Result<()> {
    let manifest = image
        .manifest()
        .map_err(|e| PusherError::Validation(format!("failed to read manifest: {}", e)))?;

    if manifest.config.size == 0 {
        return Err(PusherError::Validation("config blob size is zero".to_string()));
    }
    if manifest.config.media_type.is_empty() {
        return Err(PusherError::Validation(
            "config media type is empty".to_string(),
        ));
    }
    if manifest.layers.is_empty() {
        warn!("image has no layers");
    }
    Ok(())
}
