//! Push metrics
//!
//! [`PushMetrics`] is the aggregate attached to an operation result.
//! [`MetricsRecorder`] is a hook for exporting per-push events; the crate
//! itself only ships [`NoOpMetrics`].

use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushMetrics {
    pub discovery_duration: Duration,
    pub push_duration: Duration,
    pub total_duration: Duration,
    pub total_bytes: u64,
    pub images_pushed: usize,
    pub layers_uploaded: usize,
    pub retries: u32,
}

impl PushMetrics {
    /// Bytes pushed per second over the push phase, in MiB/s.
    pub fn average_throughput_mbps(&self) -> f64 {
        let secs = self.push_duration.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.total_bytes as f64 / (1024.0 * 1024.0) / secs
    }
}

pub trait MetricsRecorder: Send + Sync {
    fn record_push_start(&self, image: &str);
    fn record_push_complete(&self, image: &str, bytes: u64, duration: Duration, success: bool);
    fn record_retry(&self, image: &str, attempt: u32);
    fn record_progress(&self, image: &str, written: u64, total: Option<u64>);
    fn record_layer_upload(&self, image: &str, layer: &str, bytes: u64, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpMetrics;

impl MetricsRecorder for NoOpMetrics {
    fn record_push_start(&self, _image: &str) {}
    fn record_push_complete(&self, _image: &str, _bytes: u64, _duration: Duration, _success: bool) {}
    fn record_retry(&self, _image: &str, _attempt: u32) {}
    fn record_progress(&self, _image: &str, _written: u64, _total: Option<u64>) {}
    fn record_layer_upload(&self, _image: &str, _layer: &str, _bytes: u64, _duration: Duration) {}
}
