//! The slice of a compose project the core needs: services, their pinned
//! images and their config hashes.
//!
//! A service's config hash travels as the service label
//! [`LABEL_CONFIG_HASH`]. Compose copies service labels onto the
//! containers it creates, so the hash can be read back from a running
//! container. A publisher may stamp the label itself; otherwise the hash is
//! computed from the service definition and the installer stamps it.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use composeapp_oci::manifest::ANNOTATION_CONFIG_HASH;
use composeapp_oci::{Digest, Reference};
use serde_yaml::{Mapping, Value};

use crate::{Error, Result};

pub const COMPOSE_FILE: &str = "docker-compose.yml";

/// Service and container label holding the config hash.
pub const LABEL_CONFIG_HASH: &str = ANNOTATION_CONFIG_HASH;

/// A digest-pinned image reference from a compose file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub spec: String,
    pub reference: Reference,
    pub digest: Digest,
}

impl ImageRef {
    pub fn parse_pinned(raw: &str) -> Result<Self> {
        let reference = Reference::parse(raw)
            .map_err(|e| Error::InvalidInput(format!("invalid image reference {raw}: {e}")))?;
        let digest = reference.digest.clone().ok_or_else(|| {
            Error::InvalidInput(format!("image {raw} is not pinned to a digest"))
        })?;
        Ok(Self {
            spec: raw.trim().to_string(),
            reference,
            digest,
        })
    }

    /// `host/repo@sha256:<hex>`.
    pub fn digest_ref(&self) -> String {
        self.reference.with_digest(&self.digest).to_string()
    }

    /// `host/repo:<first 7 hex chars of the digest>`, the tag images are
    /// loaded under.
    pub fn tag_ref(&self) -> String {
        self.reference.with_tag(self.digest.short(7)).to_string()
    }

    /// Docker Hub short form of the reference as written.
    pub fn familiar(&self) -> String {
        self.reference.familiar()
    }

    /// Every name the daemon may list this image under.
    pub fn aliases(&self) -> Vec<String> {
        let mut out = vec![self.digest_ref(), self.tag_ref(), self.familiar(), self.spec.clone()];
        out.dedup();
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComposeService {
    pub name: String,
    pub image: ImageRef,
    /// The stamped [`LABEL_CONFIG_HASH`] label, or the SHA-256 of the
    /// service definition as canonical JSON.
    pub config_hash: String,
    /// Labels the service declares, in either compose form.
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ComposeProject {
    pub services: Vec<ComposeService>,
}

impl ComposeProject {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let doc: Value = serde_yaml::from_slice(bytes)?;
        let services = match doc.get("services") {
            Some(Value::Mapping(m)) => m,
            Some(Value::Null) | None => return Ok(Self::default()),
            Some(_) => {
                return Err(Error::Integrity(
                    "compose services must be a mapping".to_string(),
                ))
            }
        };

        let mut out = Vec::with_capacity(services.len());
        for (name, def) in services {
            let name = name
                .as_str()
                .ok_or_else(|| Error::Integrity("compose service name is not a string".into()))?;
            let image = def
                .get("image")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::Integrity(format!("service {name} has no image")))?;
            let labels = service_labels(def)?;
            let config_hash = match labels.get(LABEL_CONFIG_HASH) {
                Some(stamped) => stamped.clone(),
                None => config_hash(def)?,
            };
            out.push(ComposeService {
                name: name.to_string(),
                image: ImageRef::parse_pinned(image)?,
                config_hash,
                labels,
            });
        }
        Ok(Self { services: out })
    }
}

/// Labels of a service definition, written as a mapping or as a list of
/// `key=value` strings.
fn service_labels(def: &Value) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    match def.get("labels") {
        None | Some(Value::Null) => {}
        Some(Value::Mapping(m)) => {
            for (k, v) in m {
                let key = k
                    .as_str()
                    .ok_or_else(|| Error::Integrity("compose label name is not a string".into()))?;
                out.insert(key.to_string(), scalar_string(v));
            }
        }
        Some(Value::Sequence(items)) => {
            for item in items {
                let raw = item
                    .as_str()
                    .ok_or_else(|| Error::Integrity("compose label entry is not a string".into()))?;
                let (k, v) = raw.split_once('=').unwrap_or((raw, ""));
                out.insert(k.to_string(), v.to_string());
            }
        }
        Some(_) => {
            return Err(Error::Integrity(
                "compose labels must be a mapping or a list".to_string(),
            ))
        }
    }
    Ok(out)
}

fn scalar_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

/// Add the [`LABEL_CONFIG_HASH`] label to every service that lacks it.
/// Returns the rewritten file, or `None` when every service is already
/// stamped.
pub fn stamp_config_hashes(bytes: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut doc: Value = serde_yaml::from_slice(bytes)?;
    let Some(Value::Mapping(services)) = doc.get_mut("services") else {
        return Ok(None);
    };
    let mut changed = false;
    for (_, def) in services.iter_mut() {
        if service_labels(def)?.contains_key(LABEL_CONFIG_HASH) {
            continue;
        }
        let hash = config_hash(def)?;
        let Value::Mapping(fields) = def else {
            return Err(Error::Integrity("compose service is not a mapping".into()));
        };
        match fields.get_mut("labels") {
            Some(Value::Mapping(labels)) => {
                labels.insert(LABEL_CONFIG_HASH.into(), hash.into());
            }
            Some(Value::Sequence(labels)) => {
                labels.push(format!("{LABEL_CONFIG_HASH}={hash}").into());
            }
            _ => {
                let mut labels = Mapping::new();
                labels.insert(LABEL_CONFIG_HASH.into(), hash.into());
                fields.insert("labels".into(), Value::Mapping(labels));
            }
        }
        changed = true;
    }
    if !changed {
        return Ok(None);
    }
    Ok(Some(serde_yaml::to_string(&doc)?.into_bytes()))
}

/// SHA-256 hex of `def` rendered as JSON with sorted keys.
pub fn config_hash(def: &Value) -> Result<String> {
    let json = serde_json::to_value(def)?;
    let mut canonical = String::new();
    write_canonical(&json, &mut canonical);
    Ok(Digest::of(canonical.as_bytes()).hex().to_string())
}

fn write_canonical(v: &serde_json::Value, out: &mut String) {
    use serde_json::Value as J;
    match v {
        J::Object(map) => {
            let sorted: BTreeMap<&String, &J> = map.iter().collect();
            out.push('{');
            for (i, (k, v)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Serialising a string cannot fail.
                let _ = write!(out, "{}", J::String(k.clone()));
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        J::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => {
            let _ = write!(out, "{scalar}");
        }
    }
}
