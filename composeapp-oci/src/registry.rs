//! OCI distribution HTTP client and the remote [`BlobProvider`].

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use reqwest::header::{
    ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, RANGE, WWW_AUTHENTICATE,
};
use reqwest::{Method, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use crate::digest::Digest;
use crate::error::{OciError, Result};
use crate::manifest::{
    self, Descriptor, MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST_LIST,
    MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
};
use crate::provider::{BlobProvider, ReadOpts};
use crate::reader::BlobStream;
use crate::reference::Reference;

const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";

/// Network settings for [`RegistryClient`].
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub user_agent: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            user_agent: concat!("composeapp/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Basic credentials for one registry host.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Low-level OCI Distribution HTTP client.
pub struct RegistryClient {
    client: reqwest::Client,
    credentials: HashMap<String, Credentials>,
    /// Bearer tokens keyed by `registry/repository`.
    tokens: Mutex<HashMap<String, String>>,
}

/// Return the base URL scheme for a registry host.
/// Localhost and loopback registries default to HTTP; everything else to HTTPS.
fn registry_scheme(registry: &str) -> &'static str {
    let host = registry.split(':').next().unwrap_or(registry);
    if host == "localhost" || host == "127.0.0.1" || host == "::1" {
        "http"
    } else {
        "https"
    }
}

fn manifest_accept() -> String {
    [
        MEDIA_TYPE_OCI_MANIFEST,
        MEDIA_TYPE_OCI_INDEX,
        MEDIA_TYPE_DOCKER_MANIFEST,
        MEDIA_TYPE_DOCKER_MANIFEST_LIST,
    ]
    .join(", ")
}

/// Which distribution endpoint serves a blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Manifests,
    Blobs,
}

impl Endpoint {
    fn for_media_type(media_type: Option<&str>) -> Self {
        match media_type {
            Some(mt) if !manifest::is_manifest_endpoint_type(mt) => Endpoint::Blobs,
            _ => Endpoint::Manifests,
        }
    }

    fn path(self) -> &'static str {
        match self {
            Endpoint::Manifests => "manifests",
            Endpoint::Blobs => "blobs",
        }
    }
}

impl RegistryClient {
    pub fn new(config: RegistryConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent)
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()?;
        Ok(Self {
            client,
            credentials: HashMap::new(),
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// Use basic credentials for `registry`, both directly and when
    /// requesting bearer tokens.
    pub fn with_credentials(mut self, registry: impl Into<String>, creds: Credentials) -> Self {
        self.credentials.insert(registry.into(), creds);
        self
    }

    // -- public API ---------------------------------------------------------

    /// Resolve a pinned reference to its descriptor with a `HEAD` on the
    /// manifests endpoint.
    pub async fn resolve(&self, reference: &Reference) -> Result<Descriptor> {
        let digest = reference
            .digest
            .clone()
            .ok_or_else(|| OciError::DigestRequired(reference.to_string()))?;
        let url = self.url(reference, Endpoint::Manifests, &digest);
        let resp = self
            .send(Method::HEAD, &url, reference, Some(&manifest_accept()), None)
            .await?;

        let headers = resp.headers();
        if let Some(served) = headers
            .get(DOCKER_CONTENT_DIGEST)
            .and_then(|v| v.to_str().ok())
        {
            let served = Digest::parse(served)?;
            if served != digest {
                return Err(OciError::DigestMismatch {
                    expected: digest.to_string(),
                    calculated: served.to_string(),
                });
            }
        }
        let media_type = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .unwrap_or_else(|| manifest::MEDIA_TYPE_OCTET_STREAM.to_string());
        let size = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| OciError::Registry(format!("HEAD {url} returned no content length")))?;

        debug!(reference = %reference, %media_type, size, "resolved");
        let mut desc = Descriptor::new(media_type, digest, size);
        desc.urls.push(reference.to_string());
        Ok(desc)
    }

    // -- internals ----------------------------------------------------------

    fn url(&self, reference: &Reference, endpoint: Endpoint, digest: &Digest) -> String {
        format!(
            "{}://{}/v2/{}/{}/{}",
            registry_scheme(&reference.registry),
            reference.registry,
            reference.repository,
            endpoint.path(),
            digest,
        )
    }

    fn token_key(reference: &Reference) -> String {
        reference.locator()
    }

    fn cached_token(&self, reference: &Reference) -> Option<String> {
        self.tokens
            .lock()
            .ok()?
            .get(&Self::token_key(reference))
            .cloned()
    }

    fn request(
        &self,
        method: &Method,
        url: &str,
        accept: Option<&str>,
        range: Option<u64>,
    ) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method.clone(), url);
        if let Some(a) = accept {
            req = req.header(ACCEPT, a);
        }
        if let Some(offset) = range {
            req = req.header(RANGE, format!("bytes={offset}-"));
        }
        req
    }

    /// Perform a request with the anonymous-then-bearer-token auth flow and
    /// map error statuses.
    async fn send(
        &self,
        method: Method,
        url: &str,
        reference: &Reference,
        accept: Option<&str>,
        range: Option<u64>,
    ) -> Result<Response> {
        let mut req = self.request(&method, url, accept, range);
        if let Some(token) = self.cached_token(reference) {
            req = req.bearer_auth(token);
        } else if let Some(creds) = self.credentials.get(&reference.registry) {
            req = req.basic_auth(&creds.username, Some(&creds.password));
        }
        let mut resp = req.send().await?;

        if resp.status() == StatusCode::UNAUTHORIZED {
            let www_auth = resp
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();

            if www_auth.starts_with("Bearer") {
                let token = self.fetch_bearer_token(&www_auth, reference).await?;
                if let Ok(mut tokens) = self.tokens.lock() {
                    tokens.insert(Self::token_key(reference), token.clone());
                }
                resp = self
                    .request(&method, url, accept, range)
                    .bearer_auth(token)
                    .send()
                    .await?;
            } else if let Some(creds) = self.credentials.get(&reference.registry) {
                resp = self
                    .request(&method, url, accept, range)
                    .basic_auth(&creds.username, Some(&creds.password))
                    .send()
                    .await?;
            }
        }

        check_status(&method, url, resp).await
    }

    /// Parse a `www-authenticate: Bearer realm="…",service="…",scope="…"`
    /// header and fetch a token.
    async fn fetch_bearer_token(&self, www_auth: &str, reference: &Reference) -> Result<String> {
        let realm = extract_param(www_auth, "realm").unwrap_or_default();
        let service = extract_param(www_auth, "service").unwrap_or_default();
        let scope = extract_param(www_auth, "scope")
            .unwrap_or_else(|| format!("repository:{}:pull", reference.repository));

        if realm.is_empty() {
            return Err(OciError::Registry(
                "www-authenticate header missing realm".to_string(),
            ));
        }

        debug!(%realm, %service, %scope, "fetching bearer token");
        let mut req = self
            .client
            .get(&realm)
            .query(&[("service", service.as_str()), ("scope", scope.as_str())]);
        if let Some(creds) = self.credentials.get(&reference.registry) {
            req = req.basic_auth(&creds.username, Some(&creds.password));
        }
        let resp = req.send().await?;
        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(OciError::Unauthorized(format!(
                    "token endpoint refused {}",
                    reference.locator()
                )));
            }
            status if !status.is_success() => {
                let body = resp.text().await.unwrap_or_default();
                return Err(OciError::Registry(format!(
                    "token endpoint returned {status}: {body}"
                )));
            }
            _ => {}
        }

        let body: serde_json::Value = resp.json().await?;
        let token = body
            .get("token")
            .or_else(|| body.get("access_token"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| OciError::Registry("token response missing token field".to_string()))?;

        Ok(token.to_string())
    }
}

async fn check_status(method: &Method, url: &str, resp: Response) -> Result<Response> {
    match resp.status() {
        s if s.is_success() => Ok(resp),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(OciError::Unauthorized(format!("{method} {url}")))
        }
        StatusCode::NOT_FOUND => Err(OciError::NotFound(url.to_string())),
        status => {
            let body = resp.text().await.unwrap_or_default();
            Err(OciError::Registry(format!(
                "{method} {url} returned {status}: {body}"
            )))
        }
    }
}

#[async_trait]
impl BlobProvider for RegistryClient {
    async fn open_blob(&self, opts: &ReadOpts) -> Result<BlobStream> {
        let raw = opts
            .reference
            .as_deref()
            .ok_or_else(|| OciError::InvalidReference("remote read without reference".to_string()))?;
        let reference = Reference::parse(raw)?;
        let digest = opts.resolve_digest()?;

        let mut opts = opts.clone();
        // Known digest, size and type skip the round trip.
        if opts.expected_size.is_none() || opts.media_type.is_none() {
            let desc = self.resolve(&reference.with_digest(&digest)).await?;
            opts.expected_size.get_or_insert(desc.size);
            opts.media_type.get_or_insert(desc.media_type);
        }

        let endpoint = Endpoint::for_media_type(opts.media_type.as_deref());
        let url = self.url(&reference, endpoint, &digest);
        let accept = (endpoint == Endpoint::Manifests).then(manifest_accept);
        let range = (opts.offset > 0).then_some(opts.offset);
        let resp = self
            .send(Method::GET, &url, &reference, accept.as_deref(), range)
            .await?;
        let partial = resp.status() == StatusCode::PARTIAL_CONTENT;
        debug!(%url, status = %resp.status(), offset = opts.offset, "opened remote blob");

        let mut body = StreamReader::new(Box::pin(
            resp.bytes_stream().map_err(io::Error::other),
        ));
        if opts.offset > 0 && !partial {
            // The registry ignored the range; skip the prefix ourselves.
            info!(%url, offset = opts.offset, "registry ignored range request");
            let skipped = tokio::io::copy(&mut (&mut body).take(opts.offset), &mut tokio::io::sink())
                .await?;
            if skipped < opts.offset {
                return Err(OciError::SizeMismatch {
                    expected: opts.offset,
                    got: skipped,
                });
            }
        }
        opts.wrap(body, digest)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Extract a parameter value from a `www-authenticate` header.
/// E.g. `extract_param(header, "realm")` returns the value of `realm="…"`.
fn extract_param(header: &str, param: &str) -> Option<String> {
    let search = format!("{}=\"", param);
    if let Some(start) = header.find(&search) {
        let value_start = start + search.len();
        if let Some(end) = header[value_start..].find('"') {
            return Some(header[value_start..value_start + end].to_string());
        }
    }
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
