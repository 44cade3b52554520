//! Image upload over the OCI distribution API
//!
//! For every blob (config first, then layers) the writer asks the registry
//! whether it already has it (`HEAD`), and otherwise opens an upload session
//! (`POST`) and sends the content either in a single `PUT` or, for blobs
//! larger than the chunk size, as a series of `PATCH` requests closed by a
//! final `PUT`. The manifest is uploaded last.

use crate::buffer_pool::{BufferPool, copy_buffered};
use crate::error::{PusherError, Result};
use crate::image::{Descriptor, DigestUtils, HashingWriter, Image, ImageManifest};
use crate::progress::ProgressReporter;
use crate::registry::reference::Reference;
use crate::registry::transport::RequestSender;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderValue, LOCATION};
use reqwest::{Body, Method, Request, Response, StatusCode};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use url::Url;

const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Debug, Clone)]
pub struct WriteOptions {
    pub chunk_size: usize,
    /// Talk plain HTTP even to hosts that would normally get HTTPS.
    pub plain_http: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            chunk_size: crate::buffer_pool::DEFAULT_CHUNK_SIZE,
            plain_http: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlobOutcome {
    pub digest: String,
    pub size: u64,
    pub duration: Duration,
    /// The registry already had the blob.
    pub skipped: bool,
}

#[derive(Debug, Clone)]
pub struct WriteOutcome {
    /// Digest of the uploaded manifest.
    pub digest: String,
    pub blobs: Vec<BlobOutcome>,
}

impl WriteOutcome {
    pub fn uploaded_layers(&self) -> usize {
        self.blobs.iter().filter(|b| !b.skipped).count()
    }

    pub fn uploaded_bytes(&self) -> u64 {
        self.blobs.iter().filter(|b| !b.skipped).map(|b| b.size).sum()
    }
}

/// Blob reader and running hash carried across blocking chunk reads.
struct BlobStream {
    reader: Box<dyn Read + Send>,
    hasher: Sha256,
}

#[derive(Debug)]
pub struct RegistryWriter {
    transport: Arc<dyn RequestSender>,
    pool: Arc<BufferPool>,
    options: WriteOptions,
}

impl RegistryWriter {
    pub fn new(transport: Arc<dyn RequestSender>, pool: Arc<BufferPool>, options: WriteOptions) -> Self {
        Self {
            transport,
            pool,
            options,
        }
    }

    /// Upload all blobs of `image` and then its manifest under `reference`.
    ///
    /// Layer progress is reported under `progress_key`.
    pub async fn write(
        &self,
        reference: &Reference,
        image: Arc<dyn Image>,
        progress: &dyn ProgressReporter,
        progress_key: &str,
        cancel: &CancellationToken,
    ) -> Result<WriteOutcome> {
        let manifest_image = Arc::clone(&image);
        let (raw_manifest, manifest) = tokio::task::spawn_blocking(move || {
            let raw = manifest_image.raw_manifest()?;
            let manifest = ImageManifest::from_slice(&raw)?;
            Ok::<_, PusherError>((raw, manifest))
        })
        .await??;

        let base = reference.api_base(self.options.plain_http)?;
        let mut blobs = Vec::with_capacity(manifest.layers.len() + 1);

        for descriptor in manifest.blobs() {
            if cancel.is_cancelled() {
                return Err(PusherError::Cancelled);
            }
            let outcome = self
                .upload_blob(&base, reference, &image, descriptor, progress, progress_key, cancel)
                .await?;
            progress.finish_layer(progress_key, &descriptor.digest);
            blobs.push(outcome);
        }

        if cancel.is_cancelled() {
            return Err(PusherError::Cancelled);
        }
        let digest = self
            .put_manifest(&base, reference, &manifest, raw_manifest)
            .await?;

        Ok(WriteOutcome { digest, blobs })
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_blob(
        &self,
        base: &Url,
        reference: &Reference,
        image: &Arc<dyn Image>,
        descriptor: &Descriptor,
        progress: &dyn ProgressReporter,
        progress_key: &str,
        cancel: &CancellationToken,
    ) -> Result<BlobOutcome> {
        let started = Instant::now();
        let digest = descriptor.digest.as_str();

        if self.blob_exists(base, reference, digest).await? {
            debug!(digest, "blob already present, skipping upload");
            progress.update_layer(progress_key, digest, descriptor.size);
            return Ok(BlobOutcome {
                digest: digest.to_string(),
                size: descriptor.size,
                duration: started.elapsed(),
                skipped: true,
            });
        }

        let location = self.start_upload(base, reference).await?;
        if descriptor.size as usize <= self.options.chunk_size {
            self.upload_monolithic(reference, image, descriptor, location, cancel)
                .await?;
            progress.update_layer(progress_key, digest, descriptor.size);
        } else {
            self.upload_chunked(reference, image, descriptor, location, progress, progress_key, cancel)
                .await?;
        }

        Ok(BlobOutcome {
            digest: digest.to_string(),
            size: descriptor.size,
            duration: started.elapsed(),
            skipped: false,
        })
    }

    async fn blob_exists(&self, base: &Url, reference: &Reference, digest: &str) -> Result<bool> {
        let url = base.join(&format!("{}/blobs/{}", reference.repository, digest))?;
        let response = self.transport.send(Request::new(Method::HEAD, url)).await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(status_error(reference, "HEAD blob", status, response).await),
        }
    }

    async fn start_upload(&self, base: &Url, reference: &Reference) -> Result<Url> {
        let url = base.join(&format!("{}/blobs/uploads/", reference.repository))?;
        let mut request = Request::new(Method::POST, url);
        request
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        *request.body_mut() = Some(Body::from(Vec::new()));

        let response = self.transport.send(request).await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(status_error(reference, "POST blob upload", response.status(), response).await);
        }
        next_location(base, reference, &response)
    }

    async fn upload_monolithic(
        &self,
        reference: &Reference,
        image: &Arc<dyn Image>,
        descriptor: &Descriptor,
        location: Url,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let image = Arc::clone(image);
        let pool = Arc::clone(&self.pool);
        let cancel_read = cancel.clone();
        let digest = descriptor.digest.clone();

        let (data, actual) = tokio::task::spawn_blocking(move || {
            let mut reader = image.open_blob(&digest)?;
            let mut writer = HashingWriter::new(Vec::new());
            copy_buffered(&pool, &cancel_read, &mut reader, &mut writer)?;
            let (data, actual) = writer.finish();
            Ok::<_, PusherError>((data, actual))
        })
        .await??;

        verify_digest(&descriptor.digest, &actual)?;
        trace!(digest = %descriptor.digest, bytes = data.len(), "monolithic blob upload");

        let url = with_digest(location, &descriptor.digest);
        let mut request = Request::new(Method::PUT, url);
        let headers = request.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(OCTET_STREAM));
        headers.insert(CONTENT_LENGTH, HeaderValue::from(data.len() as u64));
        *request.body_mut() = Some(Body::from(data));

        let response = self.transport.send(request).await?;
        if !response.status().is_success() {
            return Err(status_error(reference, "PUT blob", response.status(), response).await);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_chunked(
        &self,
        reference: &Reference,
        image: &Arc<dyn Image>,
        descriptor: &Descriptor,
        mut location: Url,
        progress: &dyn ProgressReporter,
        progress_key: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let open_image = Arc::clone(image);
        let open_digest = descriptor.digest.clone();
        let reader = tokio::task::spawn_blocking(move || open_image.open_blob(&open_digest)).await??;
        let mut stream = BlobStream {
            reader,
            hasher: Sha256::new(),
        };

        let chunk_size = self.options.chunk_size as u64;
        let mut offset = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(PusherError::Cancelled);
            }

            let pool = Arc::clone(&self.pool);
            let cancel_read = cancel.clone();
            let (returned, chunk) = tokio::task::spawn_blocking(move || {
                let mut stream = stream;
                let mut chunk = Vec::with_capacity(chunk_size as usize);
                let mut limited = (&mut stream.reader).take(chunk_size);
                copy_buffered(&pool, &cancel_read, &mut limited, &mut chunk)?;
                stream.hasher.update(&chunk);
                Ok::<_, PusherError>((stream, chunk))
            })
            .await??;
            stream = returned;

            if chunk.is_empty() {
                break;
            }

            let end = offset + chunk.len() as u64 - 1;
            let mut request = Request::new(Method::PATCH, location.clone());
            let headers = request.headers_mut();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(OCTET_STREAM));
            headers.insert(CONTENT_LENGTH, HeaderValue::from(chunk.len() as u64));
            headers.insert(
                "Content-Range",
                HeaderValue::from_str(&format!("{}-{}", offset, end))
                    .map_err(|e| PusherError::Validation(e.to_string()))?,
            );
            offset = end + 1;
            *request.body_mut() = Some(Body::from(chunk));

            let response = self.transport.send(request).await?;
            if response.status() != StatusCode::ACCEPTED {
                return Err(status_error(reference, "PATCH blob chunk", response.status(), response).await);
            }
            location = next_location(&location, reference, &response)?;
            progress.update_layer(progress_key, &descriptor.digest, offset);
            trace!(digest = %descriptor.digest, offset, "chunk uploaded");
        }

        let actual = format!("sha256:{}", hex::encode(stream.hasher.finalize()));
        verify_digest(&descriptor.digest, &actual)?;

        let url = with_digest(location, &descriptor.digest);
        let mut request = Request::new(Method::PUT, url);
        request
            .headers_mut()
            .insert(CONTENT_LENGTH, HeaderValue::from_static("0"));
        *request.body_mut() = Some(Body::from(Vec::new()));

        let response = self.transport.send(request).await?;
        if !response.status().is_success() {
            return Err(status_error(reference, "PUT blob", response.status(), response).await);
        }
        Ok(())
    }

    async fn put_manifest(
        &self,
        base: &Url,
        reference: &Reference,
        manifest: &ImageManifest,
        raw: Vec<u8>,
    ) -> Result<String> {
        let digest = DigestUtils::compute_docker_digest(&raw);
        let url = base.join(&format!(
            "{}/manifests/{}",
            reference.repository,
            reference.identifier()
        ))?;

        let mut request = Request::new(Method::PUT, url);
        let headers = request.headers_mut();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_str(manifest.content_type())
                .map_err(|e| PusherError::Validation(e.to_string()))?,
        );
        headers.insert(CONTENT_LENGTH, HeaderValue::from(raw.len() as u64));
        *request.body_mut() = Some(Body::from(raw));

        let response = self.transport.send(request).await?;
        if !response.status().is_success() {
            return Err(status_error(reference, "PUT manifest", response.status(), response).await);
        }

        debug!(reference = %reference, digest = %digest, "manifest uploaded");
        Ok(digest)
    }
}

async fn status_error(
    reference: &Reference,
    operation: &str,
    status: StatusCode,
    response: Response,
) -> PusherError {
    let body = response.text().await.unwrap_or_default();
    PusherError::from_status(&reference.registry, operation, status, &body)
}

/// Resolve the `Location` header of an upload response against `base`.
fn next_location(base: &Url, reference: &Reference, response: &Response) -> Result<Url> {
    let location = response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| PusherError::Registry {
            registry: reference.registry.clone(),
            operation: "blob upload".to_string(),
            status: Some(response.status().as_u16()),
            message: "response is missing the Location header".to_string(),
        })?;
    Ok(base.join(location)?)
}

fn with_digest(mut url: Url, digest: &str) -> Url {
    url.query_pairs_mut().append_pair("digest", digest);
    url
}

fn verify_digest(expected: &str, actual: &str) -> Result<()> {
    if expected != actual {
        return Err(PusherError::Validation(format!(
            "blob content does not match digest: expected {}, got {}",
            expected, actual
        )));
    }
    Ok(())
}
