//! OCI image layout directories

use super::Image;
use super::digest::DigestUtils;
use super::manifest::{ANNOTATION_REF_NAME, Descriptor, ImageIndex, is_index_media_type};
use crate::error::{PusherError, Result};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

pub const LAYOUT_MARKER: &str = "oci-layout";
pub const INDEX_FILE: &str = "index.json";

/// The first image referenced by a layout's `index.json`.
#[derive(Debug)]
pub struct OciLayoutImage {
    root: PathBuf,
    descriptor: Descriptor,
}

impl OciLayoutImage {
    /// Both the layout marker and the index file must be present.
    pub fn is_layout(dir: &Path) -> bool {
        dir.join(LAYOUT_MARKER).is_file() && dir.join(INDEX_FILE).is_file()
    }

    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let index_bytes = fs::read(root.join(INDEX_FILE))?;
        let index: ImageIndex = serde_json::from_slice(&index_bytes).map_err(|e| {
            PusherError::ImageParsing(format!("Invalid index.json in {}: {}", root.display(), e))
        })?;

        let descriptor = index.manifests.into_iter().next().ok_or_else(|| {
            PusherError::ImageParsing(format!("no images found in OCI layout {}", root.display()))
        })?;

        if is_index_media_type(&descriptor.media_type) {
            return Err(PusherError::ImageParsing(format!(
                "{} points at a nested index, expected an image manifest",
                root.display()
            )));
        }

        Ok(Self { root, descriptor })
    }

    /// Annotated reference name, or the directory name.
    pub fn name(&self) -> String {
        self.descriptor
            .annotation(ANNOTATION_REF_NAME)
            .map(str::to_string)
            .unwrap_or_else(|| {
                self.root
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "image".to_string())
            })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let (algorithm, hex) = DigestUtils::split(digest)?;
        Ok(self.root.join("blobs").join(algorithm).join(hex))
    }
}

impl Image for OciLayoutImage {
    fn raw_manifest(&self) -> Result<Vec<u8>> {
        let raw = fs::read(self.blob_path(&self.descriptor.digest)?)?;
        Ok(raw)
    }

    fn open_blob(&self, digest: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.blob_path(digest)?;
        let file = File::open(&path).map_err(|e| {
            PusherError::ImageParsing(format!("blob {} missing from layout: {}", digest, e))
        })?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn digest(&self) -> Result<String> {
        Ok(self.descriptor.digest.clone())
    }
}
