//! Test doubles shared by unit tests

use crate::error::{PusherError, Result};
use crate::progress::ProgressReporter;
use crate::registry::auth::{AuthMethod, Authenticator, IssuedToken, TokenIssuer};
use crate::registry::transport::RequestSender;
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderValue};
use reqwest::{Request, Response};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub url: String,
    pub authorization: Option<String>,
    pub content_range: Option<String>,
    pub body_len: usize,
}

impl RecordedRequest {
    fn from_request(request: &Request) -> Self {
        let header = |name: &str| {
            request
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Self {
            method: request.method().to_string(),
            url: request.url().to_string(),
            authorization: header(AUTHORIZATION.as_str()),
            content_range: header("content-range"),
            body_len: body_bytes(request).map(<[u8]>::len).unwrap_or(0),
        }
    }
}

fn body_bytes(request: &Request) -> Option<&[u8]> {
    request.body().and_then(|b| b.as_bytes())
}

fn response(status: u16, headers: &[(&str, String)]) -> Response {
    let mut builder = http::Response::builder().status(status);
    for (name, value) in headers {
        builder = builder.header(*name, value.as_str());
    }
    Response::from(builder.body(Vec::<u8>::new()).unwrap())
}

/// Answers with a fixed sequence of status codes, then 200.
#[derive(Debug, Default)]
pub struct ScriptedSender {
    statuses: Mutex<VecDeque<u16>>,
    recorded: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedSender {
    pub fn new(statuses: Vec<u16>) -> Self {
        Self {
            statuses: Mutex::new(statuses.into()),
            recorded: Mutex::new(Vec::new()),
        }
    }

    pub fn recorded(&self) -> Vec<RecordedRequest> {
        self.recorded.lock().unwrap().clone()
    }
}

#[async_trait]
impl RequestSender for ScriptedSender {
    async fn send(&self, request: Request) -> Result<Response> {
        self.recorded
            .lock()
            .unwrap()
            .push(RecordedRequest::from_request(&request));
        let status = self.statuses.lock().unwrap().pop_front().unwrap_or(200);
        Ok(response(status, &[]))
    }
}

/// Authenticator whose header names the number of refreshes so far.
#[derive(Debug, Default)]
pub struct CountingAuthenticator {
    valid: AtomicBool,
    refreshes: AtomicU32,
    fail_refresh: bool,
}

impl CountingAuthenticator {
    pub fn valid() -> Self {
        Self {
            valid: AtomicBool::new(true),
            ..Self::default()
        }
    }

    pub fn invalid() -> Self {
        Self::default()
    }

    pub fn failing_refresh(mut self) -> Self {
        self.fail_refresh = true;
        self
    }

    pub fn refreshes(&self) -> u32 {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Authenticator for CountingAuthenticator {
    async fn authenticate(&self, request: &mut Request) -> Result<()> {
        let value = format!("Bearer token-{}", self.refreshes());
        request
            .headers_mut()
            .insert(AUTHORIZATION, HeaderValue::from_str(&value).unwrap());
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        if self.fail_refresh {
            return Err(PusherError::Authentication {
                registry: "test".to_string(),
                message: "refresh rejected".to_string(),
            });
        }
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        self.valid.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    fn method(&self) -> AuthMethod {
        AuthMethod::Bearer
    }
}

#[derive(Debug)]
pub struct CountingIssuer {
    token: String,
    expires_in: Option<Duration>,
    calls: AtomicUsize,
}

impl CountingIssuer {
    pub fn new(token: &str) -> Self {
        Self {
            token: token.to_string(),
            expires_in: Some(Duration::from_secs(3600)),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_expiry(mut self, expires_in: Option<Duration>) -> Self {
        self.expires_in = expires_in;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenIssuer for CountingIssuer {
    async fn issue(&self) -> Result<IssuedToken> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(IssuedToken {
            token: self.token.clone(),
            expires_in: self.expires_in,
        })
    }
}

/// In-process registry speaking enough of the distribution API for uploads.
#[derive(Debug, Default)]
pub struct MockRegistry {
    existing: HashSet<String>,
    manifest_status: Option<u16>,
    failures: Mutex<VecDeque<u16>>,
    latency: Option<Duration>,
    sessions: Mutex<HashMap<String, Vec<u8>>>,
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    next_session: AtomicUsize,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_existing_blob(mut self, digest: &str) -> Self {
        self.existing.insert(digest.to_string());
        self
    }

    pub fn failing_manifest_put(mut self, status: u16) -> Self {
        self.manifest_status = Some(status);
        self
    }

    /// The next `count` requests answer with `status` before normal service.
    pub fn failing_first(self, count: usize, status: u16) -> Self {
        self.failures
            .lock()
            .unwrap()
            .extend(std::iter::repeat_n(status, count));
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn stored_blob(&self, digest: &str) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap().get(digest).cloned()
    }

    pub fn manifest_puts(&self) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.method == "PUT" && r.url.contains("/manifests/"))
            .count()
    }

    fn handle(&self, request: &Request) -> Response {
        let path = request.url().path().to_string();
        let body = body_bytes(request).unwrap_or_default().to_vec();

        match request.method().as_str() {
            "HEAD" => {
                let digest = path.rsplit('/').next().unwrap_or_default();
                let known = self.existing.contains(digest)
                    || self.blobs.lock().unwrap().contains_key(digest);
                response(if known { 200 } else { 404 }, &[])
            }
            "POST" => {
                let id = self.next_session.fetch_add(1, Ordering::SeqCst).to_string();
                self.sessions.lock().unwrap().insert(id.clone(), Vec::new());
                response(202, &[("Location", format!("{}{}", path, id))])
            }
            "PATCH" => {
                let id = path.rsplit('/').next().unwrap_or_default().to_string();
                let mut sessions = self.sessions.lock().unwrap();
                let data = sessions.entry(id).or_default();
                data.extend_from_slice(&body);
                let range = format!("0-{}", data.len().saturating_sub(1));
                response(202, &[("Location", path.clone()), ("Range", range)])
            }
            "PUT" if path.contains("/manifests/") => {
                let status = self.manifest_status.unwrap_or(201);
                let digest = crate::image::DigestUtils::compute_docker_digest(&body);
                response(status, &[("Docker-Content-Digest", digest)])
            }
            "PUT" => {
                let id = path.rsplit('/').next().unwrap_or_default().to_string();
                let digest = request
                    .url()
                    .query_pairs()
                    .find(|(k, _)| k == "digest")
                    .map(|(_, v)| v.into_owned())
                    .unwrap_or_default();
                let mut data = self.sessions.lock().unwrap().remove(&id).unwrap_or_default();
                data.extend_from_slice(&body);
                self.blobs.lock().unwrap().insert(digest.clone(), data);
                response(201, &[("Docker-Content-Digest", digest)])
            }
            _ => response(405, &[]),
        }
    }
}

#[async_trait]
impl RequestSender for MockRegistry {
    async fn send(&self, request: Request) -> Result<Response> {
        self.requests
            .lock()
            .unwrap()
            .push(RecordedRequest::from_request(&request));
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(status) = self.failures.lock().unwrap().pop_front() {
            return Ok(response(status, &[]));
        }
        Ok(self.handle(&request))
    }
}

/// Progress reporter that remembers every event.
#[derive(Debug, Default)]
pub struct RecordingProgress {
    updates: Mutex<Vec<(String, String, u64)>>,
    finished_layers: Mutex<Vec<(String, String)>>,
    finished_images: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl RecordingProgress {
    pub fn updates_for(&self, image: &str, layer: &str) -> Vec<u64> {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter(|(i, l, _)| i == image && l == layer)
            .map(|(_, _, w)| *w)
            .collect()
    }

    pub fn last_written(&self, image: &str, layer: &str) -> Option<u64> {
        self.updates_for(image, layer).last().copied()
    }

    pub fn finished_images(&self) -> Vec<String> {
        self.finished_images.lock().unwrap().clone()
    }

    pub fn finished_layers(&self) -> usize {
        self.finished_layers.lock().unwrap().len()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    /// Highest number of images between start and finish at the same time.
    pub fn peak_active(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl ProgressReporter for RecordingProgress {
    fn start_image(&self, _image: &str, _total_size: Option<u64>) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn update_layer(&self, image: &str, layer: &str, written: u64) {
        self.updates
            .lock()
            .unwrap()
            .push((image.to_string(), layer.to_string(), written));
    }

    fn finish_layer(&self, image: &str, layer: &str) {
        self.finished_layers
            .lock()
            .unwrap()
            .push((image.to_string(), layer.to_string()));
    }

    fn finish_image(&self, image: &str) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.finished_images.lock().unwrap().push(image.to_string());
    }

    fn set_error(&self, image: &str, error: &PusherError) {
        self.errors
            .lock()
            .unwrap()
            .push(format!("{}: {}", image, error));
    }
}

fn append_entry(builder: &mut tar::Builder<std::fs::File>, name: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, data).unwrap();
}

/// `docker save` style tarball `<name>.tar` with one layer.
pub fn write_image_tarball(dir: &Path, name: &str, layer: &[u8]) -> PathBuf {
    let path = dir.join(format!("{}.tar", name));
    let mut builder = tar::Builder::new(std::fs::File::create(&path).unwrap());
    let config = format!(r#"{{"architecture":"amd64","os":"linux","name":"{}"}}"#, name);
    append_entry(&mut builder, "config.json", config.as_bytes());
    append_entry(&mut builder, "layer0/layer.tar", layer);
    let manifest = serde_json::json!([{
        "Config": "config.json",
        "RepoTags": [format!("{}:latest", name)],
        "Layers": ["layer0/layer.tar"],
    }]);
    append_entry(&mut builder, "manifest.json", manifest.to_string().as_bytes());
    builder.into_inner().unwrap();
    path
}
