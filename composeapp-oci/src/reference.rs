use std::fmt;

use crate::digest::Digest;
use crate::{OciError, Result};

const DOCKER_HUB: &str = "registry-1.docker.io";

/// A parsed `host[:port]/path[:tag][@sha256:<hex>]` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    /// Registry hostname (e.g. "hub.foundries.io" or "localhost:5000").
    pub registry: String,
    /// Repository path (e.g. "factory/app").
    pub repository: String,
    /// Optional tag.
    pub tag: Option<String>,
    /// Optional digest pin.
    pub digest: Option<Digest>,
}

impl Reference {
    /// Parse a raw reference string.
    ///
    /// Supported formats:
    /// - `alpine:latest`
    /// - `ghcr.io/foo/bar:v1`
    /// - `my.registry.io/org/repo@sha256:<hex>`
    /// - `localhost:5000/org/repo:v1@sha256:<hex>`
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(OciError::InvalidReference("empty reference".to_string()));
        }

        let (name_part, digest) = match raw.split_once('@') {
            Some((name, digest)) => (name, Some(Digest::parse(digest)?)),
            None => (raw, None),
        };

        // A tag colon always comes after the last '/', otherwise it belongs
        // to the registry port.
        let after_last_slash = name_part.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name_part, tag) = match name_part.rfind(':') {
            Some(colon) if colon > after_last_slash => (
                &name_part[..colon],
                Some(name_part[colon + 1..].to_string()),
            ),
            _ => (name_part, None),
        };
        if tag.as_deref() == Some("") {
            return Err(OciError::InvalidReference(format!("empty tag in {raw}")));
        }

        // A first component is a registry hostname when it contains a dot or
        // a port, or is "localhost".
        let (registry, repository) = match name_part.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (first.to_string(), rest.to_string())
            }
            Some(_) => (DOCKER_HUB.to_string(), name_part.to_string()),
            None => (DOCKER_HUB.to_string(), format!("library/{name_part}")),
        };

        if repository.is_empty()
            || repository
                .split('/')
                .any(|c| c.is_empty() || c == "." || c == "..")
        {
            return Err(OciError::InvalidReference(format!(
                "invalid repository in {raw}"
            )));
        }
        if !repository
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "._-/".contains(c))
        {
            return Err(OciError::InvalidReference(format!(
                "invalid characters in repository of {raw}"
            )));
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Parse and require a digest pin.
    pub fn parse_pinned(raw: &str) -> Result<Self> {
        let r = Self::parse(raw)?;
        if r.digest.is_none() {
            return Err(OciError::DigestRequired(raw.to_string()));
        }
        Ok(r)
    }

    /// `registry/repository` without tag or digest.
    pub fn locator(&self) -> String {
        format!("{}/{}", self.registry, self.repository)
    }

    /// Last repository path component.
    pub fn name(&self) -> &str {
        self.repository
            .rsplit('/')
            .next()
            .unwrap_or(&self.repository)
    }

    /// The same repository pinned at another digest (`host/repo@<digest>`).
    pub fn with_digest(&self, digest: &Digest) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: None,
            digest: Some(digest.clone()),
        }
    }

    /// The same repository under a tag (`host/repo:<tag>`).
    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Some(tag.to_string()),
            digest: None,
        }
    }

    /// Shortened Docker Hub form, as printed by `docker images`.
    pub fn familiar(&self) -> String {
        let mut out = if self.registry == DOCKER_HUB {
            self.repository
                .strip_prefix("library/")
                .unwrap_or(&self.repository)
                .to_string()
        } else {
            self.locator()
        };
        if let Some(tag) = &self.tag {
            out.push(':');
            out.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            out.push('@');
            out.push_str(&digest.to_string());
        }
        out
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.locator())?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}
