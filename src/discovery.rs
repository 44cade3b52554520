//! Local image discovery
//!
//! Walks a build directory and collects everything that can be pushed: OCI
//! image layout directories and image tarballs (`docker save` output, plain
//! or gzipped). The scan is best effort. Files that merely look like
//! tarballs but do not hold an image are skipped without complaint; only a
//! missing or unreadable root is an error.

use crate::config::{DiscoveryOptions, FilterCriteria};
use crate::error::{PusherError, Result};
use crate::image::{ImageFormat, LocalImage, OciLayoutImage, TarballImage};
use crate::logging::PushLogger;
use glob::Pattern;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Discover images under `path` with default options.
pub fn discover_local_images(path: impl AsRef<Path>) -> Result<Vec<LocalImage>> {
    discover_local_images_with_options(&DiscoveryOptions::new(path.as_ref()))
}

pub fn discover_local_images_with_options(options: &DiscoveryOptions) -> Result<Vec<LocalImage>> {
    let root = options.build_path.as_path();
    if !root.exists() {
        return Err(PusherError::PathNotFound {
            path: root.to_path_buf(),
        });
    }

    let logger = PushLogger;
    logger.discovery_start(root);

    let mut images = Vec::new();
    let mut walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) if err.depth() == 0 => {
                return Err(err
                    .into_io_error()
                    .map(PusherError::from)
                    .unwrap_or_else(|| PusherError::PathNotFound {
                        path: root.to_path_buf(),
                    }));
            }
            Err(err) => {
                warn!(error = %err, "skipping unreadable path");
                continue;
            }
        };

        let path = entry.path();
        if entry.file_type().is_dir() {
            if !OciLayoutImage::is_layout(path) {
                continue;
            }
            // blobs inside a layout are never images of their own
            walker.skip_current_dir();
            match load_layout(path) {
                Ok(image) => {
                    logger.image_discovered(&image.name, "oci-layout", path);
                    images.push(image);
                }
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable OCI layout"),
            }
            continue;
        }

        if !entry.file_type().is_file() || !has_extension(path, &options.extensions) {
            continue;
        }

        if let Some(limit) = options.max_size_bytes() {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            if size > limit {
                debug!(path = %path.display(), size, limit, "file exceeds size limit, skipping");
                continue;
            }
        }

        match load_tarball(path) {
            Some(image) => {
                logger.image_discovered(&image.name, "tarball", path);
                images.push(image);
            }
            None => debug!(path = %path.display(), "not an image tarball"),
        }
    }

    debug!(count = images.len(), "discovery finished");
    Ok(images)
}

fn load_layout(dir: &Path) -> Result<LocalImage> {
    let layout = OciLayoutImage::open(dir)?;
    let name = layout.name();
    Ok(LocalImage::new(name, dir, ImageFormat::OciLayout, Arc::new(layout)))
}

fn load_tarball(path: &Path) -> Option<LocalImage> {
    if !TarballImage::sniff(path).ok()? {
        return None;
    }
    let image = TarballImage::open(path).ok()?;
    Some(LocalImage::new(
        tarball_name(path),
        path,
        ImageFormat::Tarball,
        Arc::new(image),
    ))
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    let lower = path.to_string_lossy().to_lowercase();
    extensions
        .iter()
        .any(|ext| lower.ends_with(&ext.to_lowercase()))
}

/// `app.tar.gz` -> `app`, `app.tgz` -> `app`, `app.tar` -> `app`.
fn tarball_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    stem.strip_suffix(".tar").map(str::to_string).unwrap_or(stem)
}

/// Apply include/exclude globs on the image name and size bounds.
///
/// An image is kept when it matches at least one include pattern (or there
/// are none), matches no exclude pattern and its on-disk size is inside the
/// bounds. Invalid patterns never match.
pub fn filter_push_targets(images: Vec<LocalImage>, criteria: &FilterCriteria) -> Vec<LocalImage> {
    if criteria.is_empty() {
        return images;
    }

    let compile = |patterns: &[String]| -> Vec<Pattern> {
        patterns
            .iter()
            .filter_map(|p| match Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(err) => {
                    warn!(pattern = %p, error = %err, "ignoring invalid filter pattern");
                    None
                }
            })
            .collect()
    };
    let include = compile(&criteria.include);
    let exclude = compile(&criteria.exclude);

    images
        .into_iter()
        .filter(|image| {
            if criteria.min_size.is_some() || criteria.max_size.is_some() {
                let size = image.disk_size();
                if criteria.min_size.is_some_and(|min| size < min)
                    || criteria.max_size.is_some_and(|max| size > max)
                {
                    return false;
                }
            }

            if !criteria.include.is_empty() && !include.iter().any(|p| p.matches(&image.name)) {
                return false;
            }
            !exclude.iter().any(|p| p.matches(&image.name))
        })
        .collect()
}
