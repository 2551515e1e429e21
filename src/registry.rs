//! OCI distribution client for read-only image pulls.
//!
//! Speaks the subset of the distribution protocol a pull needs, over HTTPS:
//!
//! 1. On `401`, parse the `WWW-Authenticate: Bearer …` challenge, fetch a
//!    token from the advertised realm, and cache it per registry and scope.
//! 2. Fetch `/v2/<repo>/manifests/<ref>` advertising both the OCI and the
//!    Docker schema-2 media types (many registries still answer with the
//!    Docker types by default). An index or manifest list is narrowed to
//!    the entry matching the host platform and re-fetched by digest.
//! 3. Stream blobs to disk, hashing during the download; a mismatch against
//!    the advertised digest fails the pull. Interrupted downloads keep a
//!    `.partial` file and resume with a `Range` request.
//!
//! Network failures are retried with capped exponential backoff. Standard
//! proxy environment variables are honoured by the underlying HTTP client.

use crate::constants::{
    CONNECT_TIMEOUT, INITIAL_RETRY_DELAY, MAX_CONFIG_SIZE, MAX_IMAGE_REF_LEN, MAX_LAYERS,
    MAX_MANIFEST_SIZE, MAX_RETRIES, MAX_RETRY_DELAY, MEDIA_TYPES_LAYER_GZIP,
    MEDIA_TYPES_LAYER_TAR, MEDIA_TYPES_LAYER_ZSTD, MEDIA_TYPE_DOCKER_CONFIG,
    MEDIA_TYPE_DOCKER_LIST, MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_OCI_CONFIG,
    MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
};
use crate::error::{Error, Result};
use crate::platform::Platform;
use futures_util::StreamExt;
use regex::Regex;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, RANGE, WWW_AUTHENTICATE};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Image References
// =============================================================================

/// A parsed `<registry>/<repository>:<tag>` or `…@sha256:…` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub reference: String,
}

impl ImageReference {
    /// Parses a full image reference. The registry component is mandatory.
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidReference {
            reference: raw.to_string(),
            reason: reason.to_string(),
        };

        if raw.len() > MAX_IMAGE_REF_LEN {
            return Err(invalid("reference too long"));
        }
        let (registry, rest) = raw
            .split_once('/')
            .ok_or_else(|| invalid("expected <registry>/<repository>[:tag]"))?;
        if registry.is_empty() || rest.is_empty() {
            return Err(invalid("empty registry or repository"));
        }

        let (repository, reference) = if let Some((repo, digest)) = rest.split_once('@') {
            parse_digest(digest)?;
            (repo, digest.to_string())
        } else {
            match rest.rsplit_once(':') {
                Some((repo, tag)) if !tag.contains('/') => (repo, tag.to_string()),
                _ => (rest, "latest".to_string()),
            }
        };
        if repository.is_empty() || reference.is_empty() {
            return Err(invalid("empty repository or tag"));
        }
        if !repository
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./".contains(c))
        {
            return Err(invalid("repository contains invalid characters"));
        }

        Ok(Self {
            registry: registry.to_string(),
            repository: repository.to_string(),
            reference,
        })
    }

    /// Short human name: the last repository component (`ubuntu` for
    /// `registry-1.docker.io/library/ubuntu:latest`).
    pub fn short_name(&self) -> &str {
        self.repository
            .rsplit('/')
            .next()
            .unwrap_or(&self.repository)
    }

    /// Token scope for read-only access to this repository.
    fn pull_scope(&self) -> String {
        format!("repository:{}:pull", self.repository)
    }

    fn manifest_url(&self, reference: &str) -> String {
        format!(
            "https://{}/v2/{}/manifests/{}",
            self.registry, self.repository, reference
        )
    }

    fn blob_url(&self, digest: &str) -> String {
        format!(
            "https://{}/v2/{}/blobs/{}",
            self.registry, self.repository, digest
        )
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let separator = if self.reference.starts_with("sha256:") {
            '@'
        } else {
            ':'
        };
        write!(
            f,
            "{}/{}{}{}",
            self.registry, self.repository, separator, self.reference
        )
    }
}

/// Splits and validates a `sha256:<hex>` digest.
pub fn parse_digest(digest: &str) -> Result<&str> {
    match digest.split_once(':') {
        Some(("sha256", hex)) if hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()) => {
            Ok(hex)
        }
        _ => Err(Error::UnsupportedMediaType(format!(
            "unsupported digest '{}'",
            digest
        ))),
    }
}

// =============================================================================
// Wire Types
// =============================================================================

/// A content descriptor: media type, digest, and size.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    #[serde(default)]
    pub size: Option<u64>,
}

/// An OCI image manifest (or Docker schema-2 manifest).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    #[serde(default)]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

/// One entry of an image index / manifest list.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEntry {
    #[serde(default)]
    pub media_type: Option<String>,
    pub digest: String,
    #[serde(default)]
    pub platform: Option<PlatformEntry>,
}

/// Platform descriptor inside an index entry.
#[derive(Debug, Clone, Deserialize)]
pub struct PlatformEntry {
    pub architecture: String,
    pub os: String,
    #[serde(default)]
    pub variant: Option<String>,
}

/// An OCI image index / Docker manifest list.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub manifests: Vec<IndexEntry>,
}

/// The parts of an image config blob the runtime consumes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub config: Option<ImageRuntimeConfig>,
}

/// `config` object of an image config blob.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageRuntimeConfig {
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    #[serde(default)]
    pub env: Option<Vec<String>>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

/// A manifest resolved to the host platform, plus its digest.
#[derive(Debug, Clone)]
pub struct ResolvedManifest {
    pub digest: String,
    pub manifest: ImageManifest,
}

/// How a layer blob is compressed, per its media type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerCompression {
    None,
    Gzip,
    Zstd,
}

/// Maps a layer media type to its compression, or refuses it.
pub fn layer_compression(media_type: &str) -> Result<LayerCompression> {
    if MEDIA_TYPES_LAYER_TAR.contains(&media_type) {
        Ok(LayerCompression::None)
    } else if MEDIA_TYPES_LAYER_GZIP.contains(&media_type) {
        Ok(LayerCompression::Gzip)
    } else if MEDIA_TYPES_LAYER_ZSTD.contains(&media_type) {
        Ok(LayerCompression::Zstd)
    } else {
        Err(Error::UnsupportedMediaType(media_type.to_string()))
    }
}

// =============================================================================
// Bearer Challenges
// =============================================================================

/// Parsed `WWW-Authenticate: Bearer …` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

impl BearerChallenge {
    /// Parses the challenge header; parameters may appear in any order.
    fn parse(header: &str) -> Option<Self> {
        let rest = header.trim().strip_prefix("Bearer ")?;
        let pair = Regex::new(r#"([a-zA-Z_]+)="([^"]*)""#).ok()?;
        let mut params: HashMap<&str, &str> = HashMap::new();
        for capture in pair.captures_iter(rest) {
            params.insert(
                capture.get(1).unwrap().as_str(),
                capture.get(2).unwrap().as_str(),
            );
        }
        Some(Self {
            realm: params.get("realm")?.to_string(),
            service: params.get("service").map(|s| s.to_string()),
            scope: params.get("scope").map(|s| s.to_string()),
        })
    }
}

/// Token endpoint response; registries answer with either field name.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

// =============================================================================
// Client
// =============================================================================

/// OCI distribution client with per-registry token caching.
pub struct RegistryClient {
    http: reqwest::Client,
    platform: Platform,
    /// Bearer tokens keyed by `(registry, scope)`.
    tokens: Mutex<HashMap<(String, String), String>>,
}

impl RegistryClient {
    /// Creates a client for the host platform.
    pub fn new() -> Result<Self> {
        Self::for_platform(Platform::host())
    }

    /// Creates a client selecting manifests for an explicit platform.
    pub fn for_platform(platform: Platform) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self {
            http,
            platform,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    /// Fetches the manifest for `reference`, negotiating media types and
    /// narrowing an index to the host platform.
    pub async fn resolve_manifest(&self, reference: &ImageReference) -> Result<ResolvedManifest> {
        let accept = [
            MEDIA_TYPE_OCI_INDEX,
            MEDIA_TYPE_DOCKER_LIST,
            MEDIA_TYPE_OCI_MANIFEST,
            MEDIA_TYPE_DOCKER_MANIFEST,
        ]
        .join(", ");

        let (media_type, body) = self
            .get_with_retries(
                reference,
                &reference.manifest_url(&reference.reference),
                &accept,
                MAX_MANIFEST_SIZE,
            )
            .await?;

        let (media_type, body) = if media_type == MEDIA_TYPE_OCI_INDEX
            || media_type == MEDIA_TYPE_DOCKER_LIST
        {
            let index: ImageIndex = serde_json::from_slice(&body)
                .map_err(|err| Error::Network(format!("malformed image index: {}", err)))?;
            let digest = self.select_platform(&index)?;
            info!(digest = %digest, platform = %self.platform, "selected platform manifest");
            self.get_with_retries(
                reference,
                &reference.manifest_url(&digest),
                &[MEDIA_TYPE_OCI_MANIFEST, MEDIA_TYPE_DOCKER_MANIFEST].join(", "),
                MAX_MANIFEST_SIZE,
            )
            .await?
        } else {
            (media_type, body)
        };

        if media_type != MEDIA_TYPE_OCI_MANIFEST && media_type != MEDIA_TYPE_DOCKER_MANIFEST {
            return Err(Error::UnsupportedMediaType(media_type));
        }

        let manifest: ImageManifest = serde_json::from_slice(&body)
            .map_err(|err| Error::Network(format!("malformed manifest: {}", err)))?;
        if manifest.layers.is_empty() || manifest.layers.len() > MAX_LAYERS {
            return Err(Error::Network(format!(
                "manifest has {} layers, expected 1..={}",
                manifest.layers.len(),
                MAX_LAYERS
            )));
        }
        for layer in &manifest.layers {
            layer_compression(&layer.media_type)?;
            parse_digest(&layer.digest)?;
        }
        if manifest.config.media_type != MEDIA_TYPE_OCI_CONFIG
            && manifest.config.media_type != MEDIA_TYPE_DOCKER_CONFIG
        {
            return Err(Error::UnsupportedMediaType(
                manifest.config.media_type.clone(),
            ));
        }

        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&body)));
        Ok(ResolvedManifest { digest, manifest })
    }

    /// Fetches and verifies the image config blob.
    pub async fn fetch_config(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
    ) -> Result<ImageConfig> {
        parse_digest(&descriptor.digest)?;
        let (_, body) = self
            .get_with_retries(
                reference,
                &reference.blob_url(&descriptor.digest),
                &descriptor.media_type,
                MAX_CONFIG_SIZE,
            )
            .await?;
        let computed = format!("sha256:{}", hex::encode(Sha256::digest(&body)));
        if computed != descriptor.digest {
            return Err(Error::DigestMismatch {
                expected: descriptor.digest.clone(),
                computed,
            });
        }
        serde_json::from_slice(&body)
            .map_err(|err| Error::Network(format!("malformed image config: {}", err)))
    }

    /// Downloads a blob into `cache_dir`, verifying its digest while
    /// streaming. Returns the path of the completed blob.
    ///
    /// An interrupted download leaves a `.partial` file that later attempts
    /// resume with a `Range` request; a digest mismatch discards it.
    pub async fn download_blob(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        cache_dir: &Path,
    ) -> Result<PathBuf> {
        let hex_digest = parse_digest(&descriptor.digest)?;
        let final_path = cache_dir
            .join("sha256")
            .join(&hex_digest[..2])
            .join(hex_digest);
        if final_path.is_file() {
            debug!(digest = %descriptor.digest, "blob already cached");
            return Ok(final_path);
        }
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let partial_path = final_path.with_extension("partial");

        let mut attempt = 0u32;
        loop {
            match self
                .download_blob_once(reference, descriptor, &partial_path)
                .await
            {
                Ok(()) => break,
                Err(err) if err.is_transient() && attempt + 1 < MAX_RETRIES => {
                    let delay = backoff_delay(attempt);
                    warn!(
                        digest = %descriptor.digest,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "blob download interrupted; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if matches!(err, Error::DigestMismatch { .. }) {
                        let _ = fs::remove_file(&partial_path);
                    }
                    return Err(err);
                }
            }
        }

        fs::rename(&partial_path, &final_path)?;
        info!(digest = %descriptor.digest, path = %final_path.display(), "blob downloaded");
        Ok(final_path)
    }

    /// One download attempt, resuming an existing partial file.
    async fn download_blob_once(
        &self,
        reference: &ImageReference,
        descriptor: &Descriptor,
        partial_path: &Path,
    ) -> Result<()> {
        // Re-hash whatever a previous attempt already wrote.
        let mut hasher = Sha256::new();
        let mut offset = 0u64;
        if partial_path.is_file() {
            let mut existing = File::open(partial_path)?;
            let mut buf = [0u8; 64 * 1024];
            loop {
                let n = existing.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                offset += n as u64;
            }
        }

        let url = reference.blob_url(&descriptor.digest);
        let mut request = self
            .http
            .get(&url)
            .header(ACCEPT, descriptor.media_type.as_str());
        if offset > 0 {
            request = request.header(RANGE, format!("bytes={}-", offset));
        }
        if let Some(token) = self.cached_token(reference) {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        let response = request.send().await?;
        let response = self
            .reauthorized(reference, response, &url, &descriptor.media_type)
            .await?;

        let mut file = match response.status() {
            StatusCode::PARTIAL_CONTENT if offset > 0 => {
                debug!(digest = %descriptor.digest, offset, "resuming blob download");
                OpenOptions::new().append(true).open(partial_path)?
            }
            status if status.is_success() => {
                // Server ignored the range; start over.
                hasher = Sha256::new();
                File::create(partial_path)?
            }
            StatusCode::NOT_FOUND => return Err(Error::RegistryNotFound(url)),
            status => return Err(Error::Network(format!("GET {} returned {}", url, status))),
        };

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk)?;
        }
        file.flush()?;

        let computed = format!("sha256:{}", hex::encode(hasher.finalize()));
        if computed != descriptor.digest {
            return Err(Error::DigestMismatch {
                expected: descriptor.digest.clone(),
                computed,
            });
        }
        Ok(())
    }

    /// GET with auth handling, bounded body size, and transient retries.
    async fn get_with_retries(
        &self,
        reference: &ImageReference,
        url: &str,
        accept: &str,
        max_size: usize,
    ) -> Result<(String, Vec<u8>)> {
        let mut attempt = 0u32;
        loop {
            match self.get_once(reference, url, accept, max_size).await {
                Ok(result) => return Ok(result),
                Err(err) if err.is_transient() && attempt + 1 < MAX_RETRIES => {
                    let delay = backoff_delay(attempt);
                    warn!(url, attempt, error = %err, "request failed; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn get_once(
        &self,
        reference: &ImageReference,
        url: &str,
        accept: &str,
        max_size: usize,
    ) -> Result<(String, Vec<u8>)> {
        let mut request = self.http.get(url).header(ACCEPT, accept);
        if let Some(token) = self.cached_token(reference) {
            request = request.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        let response = request.send().await?;
        let response = self.reauthorized(reference, response, url, accept).await?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => return Err(Error::RegistryNotFound(url.to_string())),
            status => return Err(Error::Network(format!("GET {} returned {}", url, status))),
        }

        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .unwrap_or_default();
        let body = response.bytes().await?;
        if body.len() > max_size {
            return Err(Error::Network(format!(
                "response from {} exceeds {} bytes",
                url, max_size
            )));
        }
        Ok((media_type, body.to_vec()))
    }

    /// Handles a `401` by performing the bearer handshake and replaying the
    /// request once. A second `401` with a fresh token is `AuthFailed`.
    async fn reauthorized(
        &self,
        reference: &ImageReference,
        response: Response,
        url: &str,
        accept: &str,
    ) -> Result<Response> {
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(BearerChallenge::parse)
            .ok_or_else(|| Error::AuthRequired(reference.registry.clone()))?;

        let token = self.fetch_token(reference, &challenge).await?;
        let replay = self
            .http
            .get(url)
            .header(ACCEPT, accept)
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await?;
        if replay.status() == StatusCode::UNAUTHORIZED {
            return Err(Error::AuthFailed {
                registry: reference.registry.clone(),
                reason: format!("'{}' still unauthorized with a fresh token", url),
            });
        }
        Ok(replay)
    }

    /// Fetches a bearer token from the challenge's realm and caches it.
    async fn fetch_token(
        &self,
        reference: &ImageReference,
        challenge: &BearerChallenge,
    ) -> Result<String> {
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| reference.pull_scope());

        let mut request = self.http.get(&challenge.realm);
        if let Some(service) = &challenge.service {
            request = request.query(&[("service", service.as_str())]);
        }
        request = request.query(&[("scope", scope.as_str())]);

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::AuthFailed {
                registry: reference.registry.clone(),
                reason: format!("token endpoint returned {}", response.status()),
            });
        }
        let body: TokenResponse = response.json().await?;
        let token = body
            .token
            .or(body.access_token)
            .ok_or_else(|| Error::AuthFailed {
                registry: reference.registry.clone(),
                reason: "token endpoint answered without a token".to_string(),
            })?;

        debug!(registry = %reference.registry, scope = %scope, "bearer token obtained");
        self.tokens
            .lock()
            .unwrap()
            .insert((reference.registry.clone(), scope), token.clone());
        Ok(token)
    }

    fn cached_token(&self, reference: &ImageReference) -> Option<String> {
        self.tokens
            .lock()
            .unwrap()
            .get(&(reference.registry.clone(), reference.pull_scope()))
            .cloned()
    }

    /// Picks the index entry for the host platform.
    fn select_platform(&self, index: &ImageIndex) -> Result<String> {
        let mut available = Vec::new();
        for entry in &index.manifests {
            let platform = match &entry.platform {
                Some(platform) => platform,
                None => continue,
            };
            if self.platform.matches(
                &platform.os,
                &platform.architecture,
                platform.variant.as_deref(),
            ) {
                return Ok(entry.digest.clone());
            }
            available.push(match &platform.variant {
                Some(variant) => format!("{}/{}/{}", platform.os, platform.architecture, variant),
                None => format!("{}/{}", platform.os, platform.architecture),
            });
        }
        Err(Error::NoMatchingPlatform {
            wanted: self.platform.to_string(),
            available,
        })
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    let delay = INITIAL_RETRY_DELAY.saturating_mul(2u32.saturating_pow(attempt));
    delay.min(MAX_RETRY_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Arch;

    #[test]
    fn reference_parsing_defaults_the_tag() {
        let parsed = ImageReference::parse("registry-1.docker.io/library/ubuntu").unwrap();
        assert_eq!(parsed.registry, "registry-1.docker.io");
        assert_eq!(parsed.repository, "library/ubuntu");
        assert_eq!(parsed.reference, "latest");
        assert_eq!(parsed.short_name(), "ubuntu");
    }

    #[test]
    fn reference_parsing_accepts_tags_and_digests() {
        let tagged = ImageReference::parse("ghcr.io/owner/app:v1.2").unwrap();
        assert_eq!(tagged.reference, "v1.2");

        let digest = format!("ghcr.io/owner/app@sha256:{}", "a".repeat(64));
        let pinned = ImageReference::parse(&digest).unwrap();
        assert!(pinned.reference.starts_with("sha256:"));
        assert_eq!(pinned.to_string(), digest);
    }

    #[test]
    fn reference_parsing_rejects_garbage() {
        assert!(ImageReference::parse("no-slash-here").is_err());
        assert!(ImageReference::parse("reg.io/").is_err());
        assert!(ImageReference::parse("reg.io/repo@sha256:short").is_err());
        assert!(ImageReference::parse("reg.io/repo with spaces:x").is_err());
    }

    #[test]
    fn bearer_challenge_parses_in_any_order() {
        let challenge = BearerChallenge::parse(
            "Bearer scope=\"repository:library/ubuntu:pull\",realm=\"https://auth.docker.io/token\",service=\"registry.docker.io\"",
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:library/ubuntu:pull")
        );

        assert!(BearerChallenge::parse("Basic realm=\"x\"").is_none());
    }

    #[test]
    fn layer_compression_follows_media_type() {
        assert_eq!(
            layer_compression("application/vnd.oci.image.layer.v1.tar+gzip").unwrap(),
            LayerCompression::Gzip
        );
        assert_eq!(
            layer_compression("application/vnd.docker.image.rootfs.diff.tar.gzip").unwrap(),
            LayerCompression::Gzip
        );
        assert_eq!(
            layer_compression("application/vnd.oci.image.layer.v1.tar+zstd").unwrap(),
            LayerCompression::Zstd
        );
        assert!(layer_compression("application/vnd.oci.image.manifest.v1+json").is_err());
    }

    #[test]
    fn platform_selection_reports_what_was_available() {
        let client = RegistryClient::for_platform(Platform { arch: Arch::Arm64 }).unwrap();
        let index: ImageIndex = serde_json::from_str(
            r#"{
                "manifests": [
                    {"digest": "sha256:aa", "platform": {"architecture": "amd64", "os": "linux"}},
                    {"digest": "sha256:bb", "platform": {"architecture": "s390x", "os": "linux"}}
                ]
            }"#,
        )
        .unwrap();
        match client.select_platform(&index) {
            Err(Error::NoMatchingPlatform { wanted, available }) => {
                assert_eq!(wanted, "linux/arm64");
                assert_eq!(available, vec!["linux/amd64", "linux/s390x"]);
            }
            other => panic!("expected NoMatchingPlatform, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn platform_selection_finds_the_host_entry() {
        let client = RegistryClient::for_platform(Platform { arch: Arch::Amd64 }).unwrap();
        let index: ImageIndex = serde_json::from_str(
            r#"{
                "manifests": [
                    {"digest": "sha256:aa", "platform": {"architecture": "arm64", "os": "linux", "variant": "v8"}},
                    {"digest": "sha256:bb", "platform": {"architecture": "amd64", "os": "linux"}}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(client.select_platform(&index).unwrap(), "sha256:bb");
    }

    #[test]
    fn manifest_wire_format_deserializes() {
        let manifest: ImageManifest = serde_json::from_str(
            r#"{
                "schemaVersion": 2,
                "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
                "config": {
                    "mediaType": "application/vnd.docker.container.image.v1+json",
                    "digest": "sha256:cc",
                    "size": 7023
                },
                "layers": [
                    {
                        "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
                        "digest": "sha256:dd",
                        "size": 32654
                    }
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(manifest.layers.len(), 1);
        assert_eq!(manifest.config.digest, "sha256:cc");
    }

    #[test]
    fn image_config_deserializes_docker_keys() {
        let config: ImageConfig = serde_json::from_str(
            r#"{
                "architecture": "amd64",
                "config": {
                    "Entrypoint": ["/entry"],
                    "Cmd": ["arg"],
                    "Env": ["PATH=/usr/bin"],
                    "WorkingDir": "/srv"
                }
            }"#,
        )
        .unwrap();
        let runtime = config.config.unwrap();
        assert_eq!(runtime.entrypoint, Some(vec!["/entry".to_string()]));
        assert_eq!(runtime.working_dir.as_deref(), Some("/srv"));
    }

    #[test]
    fn backoff_is_capped() {
        assert!(backoff_delay(0) >= INITIAL_RETRY_DELAY);
        assert_eq!(backoff_delay(30), MAX_RETRY_DELAY);
    }
}
