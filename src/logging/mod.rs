//! Logging setup and push event helpers
//!
//! [`init_tracing`] installs the global `tracing` subscriber. [`PushLogger`]
//! gives call sites named events so every push is logged with the same
//! fields. [`format_bytes`] and [`format_duration`] render values for humans.

use crate::error::PusherError;
use crate::registry::auth::AuthMethod;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::EnvFilter;

/// Install the global subscriber. `RUST_LOG` takes precedence over `verbose`.
pub fn init_tracing(verbose: bool) {
    let default_directive = if verbose {
        "registry_pusher=debug,info"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    // a second call (tests, embedding) keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose)
        .try_init();
}

/// Named log events for the push pipeline.
#[derive(Debug, Clone, Copy, Default)]
pub struct PushLogger;

impl PushLogger {
    pub fn discovery_start(&self, path: &std::path::Path) {
        info!(path = %path.display(), "Discovering local images");
    }

    pub fn image_discovered(&self, name: &str, format: &str, path: &std::path::Path) {
        debug!(image = name, format, path = %path.display(), "Found image");
    }

    pub fn push_start(&self, image: &str, reference: &str, size: Option<u64>) {
        let size = size.map(format_bytes).unwrap_or_else(|| "unknown size".to_string());
        info!(image, reference, size = %size, "Pushing image");
    }

    pub fn push_complete(&self, image: &str, digest: &str, duration: Duration) {
        info!(image, digest, duration = %format_duration(duration), "Image pushed");
    }

    pub fn push_error(&self, image: &str, err: &PusherError) {
        error!(image, error = %err, "Image push failed");
    }

    pub fn retry_attempt(&self, image: &str, attempt: u32, delay: Duration, err: &PusherError) {
        warn!(
            image,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying push"
        );
    }

    pub fn authentication(&self, registry: &str, method: AuthMethod) {
        debug!(registry, method = %method, "Authenticator ready");
    }

    pub fn image_validation(&self, image: &str, valid: bool, detail: &str) {
        if valid {
            debug!(image, "Image validated");
        } else {
            warn!(image, detail, "Image validation failed");
        }
    }

    pub fn performance_metrics(&self, bytes: u64, duration: Duration, images: usize) {
        let secs = duration.as_secs_f64();
        let mbps = if secs > 0.0 {
            bytes as f64 / (1024.0 * 1024.0) / secs
        } else {
            0.0
        };
        info!(
            images,
            bytes = %format_bytes(bytes),
            duration = %format_duration(duration),
            throughput_mbps = format!("{:.2}", mbps),
            "Push throughput"
        );
    }

    pub fn registry_request(&self, method: &str, url: &str) {
        trace!(method, url, "Registry request");
    }

    pub fn registry_response(&self, method: &str, url: &str, status: u16) {
        trace!(method, url, status, "Registry response");
    }
}

/// Human readable size using binary units, e.g. `1.5 KB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }

    let mut div = UNIT;
    let mut exp = 0usize;
    let mut n = bytes / UNIT;
    while n >= UNIT && exp < 5 {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }

    let unit = ['K', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.1} {}B", bytes as f64 / div as f64, unit)
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60 {
        format!("{:.1}s", duration.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.0 KB");
        assert_eq!(format_bytes(1536), "1.5 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(2500)), "2.5s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m5s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h2m5s");
    }

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        init_tracing(false);
        init_tracing(true);
    }
}
