//! Registry Pusher Library
//!
//! Finds locally built OCI images (image tarballs and OCI layout
//! directories) and pushes them to a container registry, with retries on
//! transient failures, credential refresh on `401`, bounded concurrency and
//! progress reporting.

pub mod buffer_pool;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod error;
pub mod image;
pub mod logging;
pub mod metrics;
pub mod operation;
pub mod progress;
pub mod pusher;
pub mod registry;
pub mod retry;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{DiscoveryOptions, FilterCriteria, PushConfig, PushOptions};
pub use discovery::{discover_local_images, filter_push_targets};
pub use error::{PusherError, Result};
pub use image::{Image, ImageFormat, LocalImage};
pub use operation::{OperationError, PushOperation, PushOperationResult};
pub use pusher::{ImagePusher, PushResult};
pub use retry::BackoffStrategy;
