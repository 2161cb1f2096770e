use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::{OciError, Result};

// ---------------------------------------------------------------------------
// Media type constants
// ---------------------------------------------------------------------------

pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_OCI_EMPTY: &str = "application/vnd.oci.empty.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
pub const MEDIA_TYPE_OCTET_STREAM: &str = "application/octet-stream";

/// Annotation carrying a compose service's config hash.
pub const ANNOTATION_CONFIG_HASH: &str = "io.compose-spec.config-hash";

/// Returns `true` when `media_type` is an image index / manifest list.
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_INDEX || media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
}

/// Returns `true` when `media_type` is a single image manifest.
pub fn is_manifest_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_MANIFEST || media_type == MEDIA_TYPE_DOCKER_MANIFEST
}

/// Returns `true` when `media_type` is an image config.
pub fn is_config_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_CONFIG || media_type == MEDIA_TYPE_DOCKER_CONFIG
}

/// Returns `true` for blobs that registries serve from `/manifests/`.
pub fn is_manifest_endpoint_type(media_type: &str) -> bool {
    is_index_media_type(media_type) || is_manifest_media_type(media_type)
}

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// A content-addressable descriptor used in both manifests and image indexes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    pub digest: Digest,

    pub size: u64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            urls: Vec::new(),
            annotations: BTreeMap::new(),
            platform: None,
        }
    }

    /// The remote reference this blob can be fetched from, if any.
    pub fn reference(&self) -> Option<&str> {
        self.urls.first().map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// OCI Image Manifest
// ---------------------------------------------------------------------------

/// An OCI image manifest (application/vnd.oci.image.manifest.v1+json or
/// application/vnd.docker.distribution.manifest.v2+json).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciManifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default)]
    pub media_type: String,

    #[serde(rename = "artifactType", default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,

    pub config: Descriptor,

    #[serde(default)]
    pub layers: Vec<Descriptor>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// Target platform for a manifest inside an image index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    /// Build a `Platform` matching the current host.
    pub fn host() -> Self {
        Self {
            architecture: host_arch().to_string(),
            os: "linux".to_string(),
            variant: None,
        }
    }

    /// Parse `[os/]arch[/variant]`, e.g. `arm64/v8` or `linux/arm/v7`.
    pub fn parse(raw: &str) -> Result<Self> {
        let parts: Vec<&str> = raw.trim().split('/').collect();
        let (os, arch, variant) = match parts.as_slice() {
            [arch] => ("linux", *arch, None),
            [first, second] if *first == "linux" || *first == "windows" => (*first, *second, None),
            [arch, variant] => ("linux", *arch, Some(*variant)),
            [os, arch, variant] => (*os, *arch, Some(*variant)),
            _ => {
                return Err(OciError::Manifest(format!("invalid platform: {raw}")));
            }
        };
        if arch.is_empty() || os.is_empty() || variant.is_some_and(str::is_empty) {
            return Err(OciError::Manifest(format!("invalid platform: {raw}")));
        }
        Ok(Self {
            architecture: arch.to_string(),
            os: os.to_string(),
            variant: variant.map(str::to_string),
        })
    }

    /// Fill in the implied variant (`arm64` is `v8`, `arm` is `v7`).
    fn normalized_variant(&self) -> Option<&str> {
        match (self.architecture.as_str(), self.variant.as_deref()) {
            (_, Some(v)) => Some(v),
            ("arm64", None) => Some("v8"),
            ("arm", None) => Some("v7"),
            _ => None,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)?;
        if let Some(v) = &self.variant {
            write!(f, "/{v}")?;
        }
        Ok(())
    }
}

/// Map Rust `std::env::consts::ARCH` values to OCI / Docker platform strings.
fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "arm",
        "s390x" => "s390x",
        "powerpc64" => "ppc64le",
        other => other,
    }
}

/// Decides which entries of an image index belong to the device.
#[derive(Debug, Clone)]
pub struct PlatformMatcher {
    target: Platform,
}

impl PlatformMatcher {
    pub fn new(target: Platform) -> Self {
        Self { target }
    }

    pub fn host() -> Self {
        Self::new(Platform::host())
    }

    pub fn target(&self) -> &Platform {
        &self.target
    }

    /// OS and architecture must be equal; a variant on the target must equal
    /// the candidate's (normalised) variant.
    pub fn matches(&self, candidate: &Platform) -> bool {
        if candidate.os != self.target.os || candidate.architecture != self.target.architecture {
            return false;
        }
        match self.target.variant.as_deref() {
            None => true,
            Some(v) => candidate.normalized_variant() == Some(v),
        }
    }
}

// ---------------------------------------------------------------------------
// Image Index (fat manifest)
// ---------------------------------------------------------------------------

/// An OCI image index (application/vnd.oci.image.index.v1+json or
/// application/vnd.docker.distribution.manifest.list.v2+json).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageIndex {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", default, skip_serializing_if = "String::is_empty")]
    pub media_type: String,

    pub manifests: Vec<Descriptor>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageIndex {
    /// Descriptors that match the given platform, in index order.
    pub fn matching<'a>(&'a self, matcher: &'a PlatformMatcher) -> impl Iterator<Item = &'a Descriptor> {
        self.manifests.iter().filter(move |d| {
            d.platform
                .as_ref()
                .is_some_and(|p| matcher.matches(p))
        })
    }

    /// Select the first descriptor whose platform matches the given target.
    pub fn select_platform<'a>(&'a self, matcher: &'a PlatformMatcher) -> Result<&'a Descriptor> {
        self.matching(matcher).next().ok_or_else(|| {
            OciError::Manifest(format!(
                "no manifest found for platform {}",
                matcher.target()
            ))
        })
    }

    /// An index written by skopeo: no `mediaType` marker, schema version 2.
    /// Every child of such an index is kept regardless of platform.
    pub fn is_skopeo(&self) -> bool {
        self.media_type.is_empty() && self.schema_version == 2
    }
}

/// Peeked top-level shape of a manifest-like JSON document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestKind {
    Index,
    Manifest,
}

/// Classify raw manifest bytes by their `mediaType` field, falling back to
/// structural markers when the field is absent.
pub fn classify(bytes: &[u8]) -> Result<(ManifestKind, String)> {
    let raw: serde_json::Value = serde_json::from_slice(bytes)?;
    let media_type = raw
        .get("mediaType")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    if is_index_media_type(&media_type) {
        return Ok((ManifestKind::Index, media_type));
    }
    if is_manifest_media_type(&media_type) {
        return Ok((ManifestKind::Manifest, media_type));
    }
    if !media_type.is_empty() {
        return Err(OciError::UnsupportedMediaType(media_type));
    }
    if raw.get("manifests").is_some() {
        Ok((ManifestKind::Index, media_type))
    } else if raw.get("config").is_some() && raw.get("layers").is_some() {
        Ok((ManifestKind::Manifest, media_type))
    } else {
        Err(OciError::Manifest(
            "document is neither an image index nor a manifest".to_string(),
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
