use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest as _, Sha256};

use crate::{OciError, Result};

pub const SHA256: &str = "sha256";

/// A canonical `sha256:<hex>` content identifier.
///
/// Only SHA-256 is accepted; the hex part is lower-cased on parse so equality
/// is bytewise on the normalised form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest {
    hex: String,
}

impl Digest {
    /// Parse `sha256:<64 hex chars>`.
    pub fn parse(raw: &str) -> Result<Self> {
        let (algo, hex) = raw
            .trim()
            .split_once(':')
            .ok_or_else(|| OciError::InvalidReference(format!("digest without algorithm: {raw}")))?;
        if algo != SHA256 {
            return Err(OciError::InvalidReference(format!(
                "unsupported digest algorithm '{algo}'"
            )));
        }
        Self::from_hex(hex)
    }

    /// Build a digest from the bare 64-character hex form.
    pub fn from_hex(hex: &str) -> Result<Self> {
        if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(OciError::InvalidReference(format!(
                "invalid sha256 hex: {hex}"
            )));
        }
        Ok(Self {
            hex: hex.to_ascii_lowercase(),
        })
    }

    /// Digest of `data`.
    pub fn of(data: &[u8]) -> Self {
        Self {
            hex: format!("{:x}", Sha256::digest(data)),
        }
    }

    /// Finalise a running hasher into a digest.
    pub fn from_hasher(hasher: Sha256) -> Self {
        Self {
            hex: format!("{:x}", hasher.finalize()),
        }
    }

    pub fn algorithm(&self) -> &'static str {
        SHA256
    }

    pub fn hex(&self) -> &str {
        &self.hex
    }

    /// First `n` hex characters, used for short tags.
    pub fn short(&self, n: usize) -> &str {
        &self.hex[..n.min(self.hex.len())]
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SHA256}:{}", self.hex)
    }
}

impl FromStr for Digest {
    type Err = OciError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Digest::parse(&raw).map_err(serde::de::Error::custom)
    }
}
