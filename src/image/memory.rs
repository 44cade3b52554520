//! Images held entirely in memory

use super::Image;
use super::digest::DigestUtils;
use super::manifest::{Descriptor, ImageManifest, OCI_CONFIG_V1, OCI_LAYER_TAR, OCI_LAYER_TAR_GZIP};
use crate::error::{PusherError, Result};
use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct MemoryImage {
    raw_manifest: Vec<u8>,
    blobs: HashMap<String, Arc<[u8]>>,
}

impl MemoryImage {
    /// Build an OCI image from a config blob and layer blobs.
    pub fn new(config: Vec<u8>, layers: Vec<Vec<u8>>) -> Result<Self> {
        let mut blobs = HashMap::new();

        let config_digest = DigestUtils::compute_docker_digest(&config);
        let config_desc = Descriptor::new(OCI_CONFIG_V1, config_digest.clone(), config.len() as u64);
        blobs.insert(config_digest, Arc::from(config));

        let mut descriptors = Vec::with_capacity(layers.len());
        for layer in layers {
            let digest = DigestUtils::compute_docker_digest(&layer);
            let media_type = if DigestUtils::is_gzipped(&layer) {
                OCI_LAYER_TAR_GZIP
            } else {
                OCI_LAYER_TAR
            };
            descriptors.push(Descriptor::new(media_type, digest.clone(), layer.len() as u64));
            blobs.insert(digest, Arc::from(layer));
        }

        let raw_manifest = serde_json::to_vec(&ImageManifest::new(config_desc, descriptors))?;
        Ok(Self {
            raw_manifest,
            blobs,
        })
    }

    /// Use the given manifest bytes verbatim; blobs can be attached with [`MemoryImage::with_blob`].
    pub fn from_raw_manifest(raw_manifest: impl Into<Vec<u8>>) -> Self {
        Self {
            raw_manifest: raw_manifest.into(),
            blobs: HashMap::new(),
        }
    }

    pub fn with_blob(mut self, data: Vec<u8>) -> Self {
        let digest = DigestUtils::compute_docker_digest(&data);
        self.blobs.insert(digest, Arc::from(data));
        self
    }
}

impl Image for MemoryImage {
    fn raw_manifest(&self) -> Result<Vec<u8>> {
        Ok(self.raw_manifest.clone())
    }

    fn open_blob(&self, digest: &str) -> Result<Box<dyn Read + Send>> {
        let data = self
            .blobs
            .get(digest)
            .cloned()
            .ok_or_else(|| PusherError::ImageParsing(format!("blob {} not found", digest)))?;
        Ok(Box::new(Cursor::new(data)))
    }
}
