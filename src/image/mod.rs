//! Local image sources
//!
//! This module provides the [`Image`] capability used by the push pipeline to
//! read a manifest and stream its blobs, together with the concrete sources
//! found on disk:
//!
//! * [`TarballImage`] for `docker save` style archives (`.tar`, `.tar.gz`, `.tgz`)
//! * [`OciLayoutImage`] for OCI image layout directories
//! * [`MemoryImage`] for images assembled in memory
//!
//! Discovery wraps each source in a [`LocalImage`] carrying its name, path and
//! format.

pub mod digest;
pub mod layout;
pub mod manifest;
pub mod memory;
pub mod tarball;

pub use digest::{DigestUtils, HashingWriter};
pub use layout::OciLayoutImage;
pub use manifest::{Descriptor, DockerManifestEntry, ImageIndex, ImageManifest};
pub use memory::MemoryImage;
pub use tarball::TarballImage;

use crate::error::Result;
use std::fmt;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

/// Read access to one image: its manifest bytes and its blobs by digest.
///
/// Implementations perform blocking file IO; async callers should go through
/// `tokio::task::spawn_blocking`.
pub trait Image: Send + Sync + fmt::Debug {
    /// Serialized manifest exactly as it will be uploaded.
    fn raw_manifest(&self) -> Result<Vec<u8>>;

    /// Open a blob (config or layer) referenced by the manifest.
    fn open_blob(&self, digest: &str) -> Result<Box<dyn Read + Send>>;

    fn manifest(&self) -> Result<ImageManifest> {
        ImageManifest::from_slice(&self.raw_manifest()?)
    }

    /// Content digest of the manifest.
    fn digest(&self) -> Result<String> {
        Ok(DigestUtils::compute_docker_digest(&self.raw_manifest()?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Tarball,
    OciLayout,
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageFormat::Tarball => write!(f, "tarball"),
            ImageFormat::OciLayout => write!(f, "oci-layout"),
        }
    }
}

/// A pushable image found on disk.
#[derive(Debug, Clone)]
pub struct LocalImage {
    pub name: String,
    pub path: PathBuf,
    pub format: ImageFormat,
    pub image: Arc<dyn Image>,
}

impl LocalImage {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        format: ImageFormat,
        image: Arc<dyn Image>,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            format,
            image,
        }
    }

    /// Bytes the image occupies on disk (file size, or the sum of a layout's files).
    pub fn disk_size(&self) -> u64 {
        match self.format {
            ImageFormat::Tarball => std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0),
            ImageFormat::OciLayout => walkdir::WalkDir::new(&self.path)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter_map(|e| e.metadata().ok())
                .map(|m| m.len())
                .sum(),
        }
    }
}
