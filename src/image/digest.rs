//! SHA256 digest utilities
//!
//! Registry blobs and manifests are content addressed by `sha256:<hex>`; these
//! helpers compute, validate and split such digests.

use crate::error::{PusherError, Result};
use sha2::{Digest, Sha256};
use std::io::Write;

/// Utilities for working with SHA256 digests
pub struct DigestUtils;

impl DigestUtils {
    /// Compute SHA256 hex digest from byte data
    pub fn compute_sha256(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    /// Compute full digest (with sha256: prefix) from byte data
    pub fn compute_docker_digest(data: &[u8]) -> String {
        format!("sha256:{}", Self::compute_sha256(data))
    }

    /// Validate SHA256 hex string (64 characters, all hex)
    pub fn is_valid_sha256_hex(digest: &str) -> bool {
        digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit())
    }

    pub fn is_valid_docker_digest(digest: &str) -> bool {
        digest
            .strip_prefix("sha256:")
            .is_some_and(Self::is_valid_sha256_hex)
    }

    /// Split `algorithm:hex` into its two halves
    pub fn split(digest: &str) -> Result<(&str, &str)> {
        match digest.split_once(':') {
            Some((alg, hex)) if !alg.is_empty() && !hex.is_empty() && !hex.contains('/') => {
                Ok((alg, hex))
            }
            _ => Err(PusherError::Validation(format!(
                "Invalid digest format: {}",
                digest
            ))),
        }
    }

    /// Whether the data starts with the gzip magic bytes
    pub fn is_gzipped(data: &[u8]) -> bool {
        data.len() >= 2 && data[0] == 0x1f && data[1] == 0x8b
    }
}

/// Writer that hashes everything passing through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Finish hashing and return the inner writer with the `sha256:` digest.
    pub fn finish(self) -> (W, String) {
        let digest = format!("sha256:{}", hex::encode(self.hasher.finalize()));
        (self.inner, digest)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY: &str = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn test_empty_digest() {
        assert_eq!(DigestUtils::compute_docker_digest(b""), EMPTY);
        assert!(DigestUtils::is_valid_docker_digest(EMPTY));
        assert!(!DigestUtils::is_valid_docker_digest("sha256:xyz"));
    }

    #[test]
    fn test_split() {
        let (alg, hex) = DigestUtils::split(EMPTY).unwrap();
        assert_eq!(alg, "sha256");
        assert_eq!(hex.len(), 64);
        assert!(DigestUtils::split("nodigest").is_err());
        assert!(DigestUtils::split("sha256:../../etc").is_err());
    }

    #[test]
    fn test_is_gzipped() {
        assert!(DigestUtils::is_gzipped(&[0x1f, 0x8b, 0x08]));
        assert!(!DigestUtils::is_gzipped(b"ustar"));
        assert!(!DigestUtils::is_gzipped(&[0x1f]));
    }

    #[test]
    fn test_hashing_writer_matches_direct_digest() {
        let mut writer = HashingWriter::new(Vec::new());
        writer.write_all(b"hello ").unwrap();
        writer.write_all(b"world").unwrap();
        assert_eq!(writer.written(), 11);

        let (inner, digest) = writer.finish();
        assert_eq!(inner, b"hello world");
        assert_eq!(digest, DigestUtils::compute_docker_digest(b"hello world"));
    }
}
