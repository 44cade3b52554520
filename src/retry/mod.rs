//! Retry engine
//!
//! [`with_retry`] drives an async operation through a [`BackoffStrategy`],
//! sleeping between attempts and giving up on the first non-retryable error.
//! Every sleep races the caller's [`CancellationToken`] so a cancelled push
//! stops at its next backoff decision instead of waiting out the delay.

mod backoff;

pub use backoff::BackoffStrategy;

use crate::error::{PusherError, Result, Retryable};
use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Substrings (matched case-insensitively) that mark an error message as a
/// transient network condition.
const TRANSIENT_MESSAGES: [&str; 5] = [
    "connection refused",
    "connection reset",
    "timeout",
    "i/o timeout",
    "broken pipe",
];

/// Matched case-sensitively.
const EOF_MARKER: &str = "EOF";

/// HTTP statuses the generic engine retries.
const RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Default retryability classification.
pub fn is_retryable(err: &PusherError) -> bool {
    match err {
        PusherError::Cancelled
        | PusherError::MaxRetriesExceeded { .. }
        | PusherError::Authentication { .. }
        | PusherError::Credential { .. } => return false,
        PusherError::Registry {
            status: Some(401 | 403),
            ..
        } => return false,
        _ => {}
    }

    if err.is_retryable() || is_network_error(err) {
        return true;
    }

    if let Some(status) = err.status() {
        if RETRYABLE_STATUSES.contains(&status) {
            return true;
        }
    }

    let message = err.to_string();
    if message.contains(EOF_MARKER) {
        return true;
    }
    let message = message.to_lowercase();
    TRANSIENT_MESSAGES.iter().any(|needle| message.contains(needle))
}

/// Network-level temporary or timeout conditions only.
pub fn is_network_error(err: &PusherError) -> bool {
    match err {
        PusherError::Network { kind, .. } => kind.is_transient(),
        PusherError::Timeout { .. } => true,
        PusherError::Io(io) => matches!(
            io.kind(),
            ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
                | ErrorKind::TimedOut
                | ErrorKind::UnexpectedEof
        ),
        _ => false,
    }
}

/// Predicate that only retries network-level failures, never HTTP statuses.
pub fn retry_if_transient(err: &PusherError) -> bool {
    !err.is_cancelled() && is_network_error(err)
}

/// Run `operation` until it succeeds, fails permanently, or the strategy's
/// attempts are exhausted. The closure receives the zero-based attempt number.
pub async fn with_retry<T, F, Fut>(
    strategy: &BackoffStrategy,
    cancel: &CancellationToken,
    operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_loop(strategy, cancel, is_retryable, |_, _, _| {}, operation).await
}

/// Like [`with_retry`] with a caller-supplied retryability predicate.
pub async fn with_retry_if<T, F, Fut, P>(
    strategy: &BackoffStrategy,
    cancel: &CancellationToken,
    predicate: P,
    operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&PusherError) -> bool,
{
    retry_loop(strategy, cancel, predicate, |_, _, _| {}, operation).await
}

/// Like [`with_retry`], calling `on_retry(attempt, error, delay)` before each sleep.
pub async fn with_retry_notify<T, F, Fut, N>(
    strategy: &BackoffStrategy,
    cancel: &CancellationToken,
    on_retry: N,
    operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    N: FnMut(u32, &PusherError, Duration),
{
    retry_loop(strategy, cancel, is_retryable, on_retry, operation).await
}

async fn retry_loop<T, F, Fut, P, N>(
    strategy: &BackoffStrategy,
    cancel: &CancellationToken,
    predicate: P,
    mut on_retry: N,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&PusherError) -> bool,
    N: FnMut(u32, &PusherError, Duration),
{
    let max_attempts = strategy.max_attempts();
    let mut attempt = 0u32;

    loop {
        if cancel.is_cancelled() {
            return Err(PusherError::Cancelled);
        }

        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if cancel.is_cancelled() || err.is_cancelled() {
            return Err(PusherError::Cancelled);
        }

        if !predicate(&err) {
            debug!(attempt, error = %err, "non-retryable error");
            return Err(err);
        }

        if attempt + 1 >= max_attempts {
            return Err(PusherError::MaxRetriesExceeded {
                attempts: max_attempts,
                last: Box::new(err),
            });
        }
        let delay = strategy
            .next_delay(attempt_index(attempt))
            .unwrap_or_else(|| strategy.max_delay());

        on_retry(attempt + 1, &err, delay);
        debug!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, error = %err, "retrying");

        tokio::select! {
            _ = cancel.cancelled() => return Err(PusherError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }
}

fn attempt_index(attempt: u32) -> i32 {
    i32::try_from(attempt).unwrap_or(i32::MAX)
}
