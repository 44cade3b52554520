//! Push progress reporting
//!
//! The push engine reports through the [`ProgressReporter`] observer. Events
//! for one image are keyed by the image digest; layer events carry both the
//! image key and the layer digest.
//!
//! [`ProgressTracker`] is the console implementation. All of its state sits
//! behind one mutex because layer updates arrive from concurrent pushes, and
//! an image's entry is dropped as soon as the image finishes.

use crate::error::PusherError;
use crate::logging::{format_bytes, format_duration};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

pub trait ProgressReporter: Send + Sync {
    /// Begin tracking an image. An existing entry with the same key is replaced.
    fn start_image(&self, image: &str, total_size: Option<u64>);

    /// `written` is the total bytes written for `layer` so far.
    fn update_layer(&self, image: &str, layer: &str, written: u64);

    fn finish_layer(&self, image: &str, layer: &str);

    fn finish_image(&self, image: &str);

    /// Record a terminal error, reported by `finish_image`.
    fn set_error(&self, image: &str, error: &PusherError);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpProgress;

impl ProgressReporter for NoOpProgress {
    fn start_image(&self, _image: &str, _total_size: Option<u64>) {}
    fn update_layer(&self, _image: &str, _layer: &str, _written: u64) {}
    fn finish_layer(&self, _image: &str, _layer: &str) {}
    fn finish_image(&self, _image: &str) {}
    fn set_error(&self, _image: &str, _error: &PusherError) {}
}

/// Forwards every event to each wrapped reporter in order.
#[derive(Default, Clone)]
pub struct MultiProgress {
    reporters: Vec<Arc<dyn ProgressReporter>>,
}

impl fmt::Debug for MultiProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiProgress")
            .field("reporters", &self.reporters.len())
            .finish()
    }
}

impl MultiProgress {
    pub fn new(reporters: Vec<Arc<dyn ProgressReporter>>) -> Self {
        Self { reporters }
    }

    pub fn push(&mut self, reporter: Arc<dyn ProgressReporter>) {
        self.reporters.push(reporter);
    }
}

impl ProgressReporter for MultiProgress {
    fn start_image(&self, image: &str, total_size: Option<u64>) {
        self.reporters
            .iter()
            .for_each(|r| r.start_image(image, total_size));
    }

    fn update_layer(&self, image: &str, layer: &str, written: u64) {
        self.reporters
            .iter()
            .for_each(|r| r.update_layer(image, layer, written));
    }

    fn finish_layer(&self, image: &str, layer: &str) {
        self.reporters
            .iter()
            .for_each(|r| r.finish_layer(image, layer));
    }

    fn finish_image(&self, image: &str) {
        self.reporters.iter().for_each(|r| r.finish_image(image));
    }

    fn set_error(&self, image: &str, error: &PusherError) {
        self.reporters.iter().for_each(|r| r.set_error(image, error));
    }
}

#[derive(Debug, Clone, Default)]
struct LayerProgress {
    written: u64,
    done: bool,
}

#[derive(Debug, Clone)]
struct ImageProgress {
    total_size: Option<u64>,
    written: u64,
    layers: HashMap<String, LayerProgress>,
    started: Instant,
    error: Option<String>,
    /// Last printed tenth of the total.
    reported_step: u64,
}

/// Point-in-time copy of one image's progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSnapshot {
    pub total_size: Option<u64>,
    pub written: u64,
    pub layers: usize,
    pub finished_layers: usize,
    pub error: Option<String>,
}

struct TrackerState<W> {
    out: W,
    images: HashMap<String, ImageProgress>,
}

/// Console progress output in 10% steps.
pub struct ProgressTracker<W: Write + Send = io::Stdout> {
    state: Mutex<TrackerState<W>>,
    layer_details: bool,
}

impl<W: Write + Send> fmt::Debug for ProgressTracker<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("in_flight", &self.in_flight())
            .field("layer_details", &self.layer_details)
            .finish()
    }
}

impl ProgressTracker<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> ProgressTracker<W> {
    pub fn new(out: W) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                out,
                images: HashMap::new(),
            }),
            layer_details: false,
        }
    }

    /// Also print a line per layer update.
    pub fn with_layer_details(mut self, enabled: bool) -> Self {
        self.layer_details = enabled;
        self
    }

    /// Number of images started and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.lock().images.len()
    }

    pub fn snapshot(&self, image: &str) -> Option<ImageSnapshot> {
        self.lock().images.get(image).map(|p| ImageSnapshot {
            total_size: p.total_size,
            written: p.written,
            layers: p.layers.len(),
            finished_layers: p.layers.values().filter(|l| l.done).count(),
            error: p.error.clone(),
        })
    }

    pub fn into_inner(self) -> W {
        self.state
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState<W>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> ProgressReporter for ProgressTracker<W> {
    fn start_image(&self, image: &str, total_size: Option<u64>) {
        let mut state = self.lock();
        state.images.insert(
            image.to_string(),
            ImageProgress {
                total_size,
                written: 0,
                layers: HashMap::new(),
                started: Instant::now(),
                error: None,
                reported_step: 0,
            },
        );

        let size = total_size
            .map(format_bytes)
            .unwrap_or_else(|| "unknown size".to_string());
        let _ = writeln!(state.out, "📤 Pushing {} ({})", short(image), size);
    }

    fn update_layer(&self, image: &str, layer: &str, written: u64) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(progress) = state.images.get_mut(image) else {
            return;
        };

        progress.layers.entry(layer.to_string()).or_default().written = written;
        progress.written = progress.layers.values().map(|l| l.written).sum();

        if self.layer_details {
            let _ = writeln!(
                state.out,
                "   layer {}: {}",
                short(layer),
                format_bytes(written)
            );
        }

        if let Some(total) = progress.total_size.filter(|t| *t > 0) {
            let step = (progress.written.saturating_mul(10) / total).min(10);
            if step > progress.reported_step {
                progress.reported_step = step;
                let _ = writeln!(
                    state.out,
                    "   {}: {}% ({} / {})",
                    short(image),
                    step * 10,
                    format_bytes(progress.written),
                    format_bytes(total)
                );
            }
        }
    }

    fn finish_layer(&self, image: &str, layer: &str) {
        let mut guard = self.lock();
        let state = &mut *guard;
        if let Some(progress) = state.images.get_mut(image) {
            progress.layers.entry(layer.to_string()).or_default().done = true;
            if self.layer_details {
                let _ = writeln!(state.out, "   layer {} done", short(layer));
            }
        }
    }

    fn finish_image(&self, image: &str) {
        let mut state = self.lock();
        let Some(progress) = state.images.remove(image) else {
            return;
        };

        let elapsed = progress.started.elapsed();
        match progress.error {
            Some(error) => {
                let _ = writeln!(
                    state.out,
                    "❌ {} failed after {}: {}",
                    short(image),
                    format_duration(elapsed),
                    error
                );
            }
            None => {
                let secs = elapsed.as_secs_f64();
                let mbps = if secs > 0.0 {
                    progress.written as f64 / (1024.0 * 1024.0) / secs
                } else {
                    0.0
                };
                let _ = writeln!(
                    state.out,
                    "✅ {} pushed {} in {} ({:.2} MB/s)",
                    short(image),
                    format_bytes(progress.written),
                    format_duration(elapsed),
                    mbps
                );
            }
        }
        let _ = state.out.flush();
    }

    fn set_error(&self, image: &str, error: &PusherError) {
        if let Some(progress) = self.lock().images.get_mut(image) {
            progress.error = Some(error.to_string());
        }
    }
}

/// `sha256:0123456789ab...` shortened to its first 12 hex characters.
fn short(key: &str) -> &str {
    match key.strip_prefix("sha256:") {
        Some(hex) if hex.len() > 12 => &hex[..12],
        _ => key,
    }
}
