//! `docker save` style tarball images
//!
//! The archive's `manifest.json` names a config file and a list of layer
//! files. The OCI manifest is built lazily on first use in a single pass over
//! the archive: each referenced entry is hashed and its offset recorded, so
//! later blob reads seek straight to the data (or skip through the gzip
//! stream for compressed archives).

use super::digest::{DigestUtils, HashingWriter};
use super::manifest::{
    Descriptor, DockerManifestEntry, ImageManifest, OCI_CONFIG_V1, OCI_LAYER_TAR,
    OCI_LAYER_TAR_GZIP,
};
use super::Image;
use crate::error::{PusherError, Result};
use flate2::read::GzDecoder;
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tar::Archive;

const MANIFEST_ENTRY: &str = "manifest.json";
const LEGACY_REPOSITORIES_ENTRY: &str = "repositories";

#[derive(Debug, Clone)]
struct BlobLocation {
    offset: u64,
    size: u64,
}

#[derive(Debug, Clone)]
struct Indexed {
    raw_manifest: Vec<u8>,
    blobs: HashMap<String, BlobLocation>,
}

pub struct TarballImage {
    path: PathBuf,
    compressed: bool,
    entry: DockerManifestEntry,
    indexed: OnceLock<std::result::Result<Indexed, PusherError>>,
}

impl fmt::Debug for TarballImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TarballImage")
            .field("path", &self.path)
            .field("compressed", &self.compressed)
            .field("config", &self.entry.config)
            .field("layers", &self.entry.layers.len())
            .finish()
    }
}

impl TarballImage {
    /// Open an image tarball and read its `manifest.json`.
    ///
    /// Only the first image of a multi-image archive is used.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let compressed = is_gzip_file(&path)?;

        let mut archive = Archive::new(open_stream(&path, compressed)?);
        let mut manifest_bytes = None;
        for entry in archive.entries().map_err(parse_error("read tar entries"))? {
            let mut entry = entry.map_err(parse_error("read tar entry"))?;
            if entry_name(&entry)? == MANIFEST_ENTRY {
                let mut buf = Vec::new();
                entry
                    .read_to_end(&mut buf)
                    .map_err(parse_error("read manifest.json"))?;
                manifest_bytes = Some(buf);
                break;
            }
        }

        let manifest_bytes = manifest_bytes.ok_or_else(|| {
            PusherError::ImageParsing(format!("{} has no manifest.json", path.display()))
        })?;
        let entries: Vec<DockerManifestEntry> = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| PusherError::ImageParsing(format!("Invalid manifest.json: {}", e)))?;
        let entry = entries.into_iter().next().ok_or_else(|| {
            PusherError::ImageParsing(format!("{} manifest.json lists no images", path.display()))
        })?;

        Ok(Self {
            path,
            compressed,
            entry,
            indexed: OnceLock::new(),
        })
    }

    /// Check whether a file looks like an image tarball without indexing it.
    ///
    /// A `manifest.json` entry is sufficient; a legacy `repositories` entry also counts.
    pub fn sniff(path: impl AsRef<Path>) -> Result<bool> {
        let path = path.as_ref();
        let compressed = is_gzip_file(path)?;
        let mut archive = Archive::new(open_stream(path, compressed)?);

        let mut found_legacy = false;
        for entry in archive.entries().map_err(parse_error("read tar entries"))? {
            let entry = entry.map_err(parse_error("read tar entry"))?;
            match entry_name(&entry)?.as_str() {
                MANIFEST_ENTRY => return Ok(true),
                LEGACY_REPOSITORIES_ENTRY => found_legacy = true,
                _ => {}
            }
        }
        Ok(found_legacy)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tags recorded by `docker save`, if any.
    pub fn repo_tags(&self) -> &[String] {
        self.entry.repo_tags.as_deref().unwrap_or(&[])
    }

    fn indexed(&self) -> Result<&Indexed> {
        self.indexed
            .get_or_init(|| self.build_index())
            .as_ref()
            .map_err(Clone::clone)
    }

    fn build_index(&self) -> Result<Indexed> {
        let config_path = normalize(&self.entry.config);
        let layer_paths: Vec<String> = self.entry.layers.iter().map(|l| normalize(l)).collect();

        // path -> (digest, offset, size, gzipped)
        let mut found: HashMap<String, (String, u64, u64, bool)> = HashMap::new();

        let mut archive = Archive::new(open_stream(&self.path, self.compressed)?);
        for entry in archive.entries().map_err(parse_error("read tar entries"))? {
            let mut entry = entry.map_err(parse_error("read tar entry"))?;
            let name = entry_name(&entry)?;
            if name != config_path && !layer_paths.contains(&name) {
                continue;
            }

            let offset = entry.raw_file_position();
            let mut magic = [0u8; 2];
            let mut head = 0;
            let mut writer = HashingWriter::new(io::sink());
            while head < magic.len() {
                let n = entry
                    .read(&mut magic[head..])
                    .map_err(parse_error("read blob"))?;
                if n == 0 {
                    break;
                }
                head += n;
            }
            io::Write::write_all(&mut writer, &magic[..head])?;
            io::copy(&mut entry, &mut writer).map_err(parse_error("hash blob"))?;

            let size = writer.written();
            let (_, digest) = writer.finish();
            let gzipped = DigestUtils::is_gzipped(&magic[..head]);
            found.insert(name, (digest, offset, size, gzipped));
        }

        let lookup = |path: &str| {
            found.get(path).cloned().ok_or_else(|| {
                PusherError::ImageParsing(format!(
                    "{} references missing entry {}",
                    self.path.display(),
                    path
                ))
            })
        };

        let mut blobs = HashMap::new();
        let (config_digest, config_offset, config_size, _) = lookup(&config_path)?;
        blobs.insert(
            config_digest.clone(),
            BlobLocation {
                offset: config_offset,
                size: config_size,
            },
        );
        let config = Descriptor::new(OCI_CONFIG_V1, config_digest, config_size);

        let mut layers = Vec::with_capacity(layer_paths.len());
        for layer_path in &layer_paths {
            let (digest, offset, size, gzipped) = lookup(layer_path)?;
            let media_type = if gzipped { OCI_LAYER_TAR_GZIP } else { OCI_LAYER_TAR };
            blobs.insert(digest.clone(), BlobLocation { offset, size });
            layers.push(Descriptor::new(media_type, digest, size));
        }

        let raw_manifest = serde_json::to_vec(&ImageManifest::new(config, layers))?;
        Ok(Indexed {
            raw_manifest,
            blobs,
        })
    }
}

impl Image for TarballImage {
    fn raw_manifest(&self) -> Result<Vec<u8>> {
        Ok(self.indexed()?.raw_manifest.clone())
    }

    fn open_blob(&self, digest: &str) -> Result<Box<dyn Read + Send>> {
        let location = self.indexed()?.blobs.get(digest).cloned().ok_or_else(|| {
            PusherError::ImageParsing(format!(
                "blob {} not found in {}",
                digest,
                self.path.display()
            ))
        })?;

        if self.compressed {
            let mut stream = open_stream(&self.path, true)?;
            let skipped = io::copy(&mut (&mut stream).take(location.offset), &mut io::sink())?;
            if skipped != location.offset {
                return Err(PusherError::ImageParsing(format!(
                    "{} ended before blob {}",
                    self.path.display(),
                    digest
                )));
            }
            Ok(Box::new(stream.take(location.size)))
        } else {
            let mut file = File::open(&self.path)?;
            file.seek(SeekFrom::Start(location.offset))?;
            Ok(Box::new(BufReader::new(file).take(location.size)))
        }
    }
}

fn open_stream(path: &Path, compressed: bool) -> Result<Box<dyn Read + Send>> {
    let file = BufReader::new(File::open(path)?);
    if compressed {
        Ok(Box::new(GzDecoder::new(file)))
    } else {
        Ok(Box::new(file))
    }
}

fn is_gzip_file(path: &Path) -> Result<bool> {
    let mut magic = [0u8; 2];
    let mut file = File::open(path)?;
    let mut read = 0;
    while read < magic.len() {
        let n = file.read(&mut magic[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    Ok(DigestUtils::is_gzipped(&magic[..read]))
}

fn entry_name<R: Read>(entry: &tar::Entry<'_, R>) -> Result<String> {
    let path = entry.path().map_err(parse_error("read entry path"))?;
    Ok(normalize(&path.to_string_lossy()))
}

fn normalize(path: &str) -> String {
    path.trim_start_matches("./").to_string()
}

fn parse_error(context: &'static str) -> impl Fn(io::Error) -> PusherError {
    move |e| PusherError::ImageParsing(format!("Failed to {}: {}", context, e))
}
