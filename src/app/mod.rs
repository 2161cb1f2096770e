//! Compose applications as Merkle trees of typed OCI descriptors.

pub mod layers_meta;
pub mod layout;
pub mod loader;
pub mod project;

use std::fmt;

use composeapp_oci::manifest::ANNOTATION_CONFIG_HASH;
use composeapp_oci::{Descriptor, Digest, Reference};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub use layers_meta::{LayerMeta, LayersMeta};
pub use loader::{load_app, load_apps};
pub use project::{ComposeProject, ComposeService};

/// Maximum depth of any app tree; the app manifest is at depth 1.
pub const MAX_MERKLE_TREE_DEPTH: usize = 10;

/// A pinned app reference: `host[:port]/repo/name[:tag]@sha256:<hex>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AppRef {
    /// The reference exactly as given.
    pub spec: String,
    pub reference: Reference,
    /// Last path component; names the compose project and layout dir.
    pub name: String,
    pub digest: Digest,
}

impl AppRef {
    /// Parse a reference, requiring a digest.
    pub fn parse_pinned(raw: &str) -> Result<Self> {
        let reference = Reference::parse(raw)
            .map_err(|e| Error::InvalidInput(format!("invalid app reference {raw}: {e}")))?;
        let digest = reference
            .digest
            .clone()
            .ok_or_else(|| Error::InvalidInput(format!("app reference {raw} has no digest")))?;
        Ok(Self {
            spec: raw.trim().to_string(),
            name: reference.name().to_string(),
            reference,
            digest,
        })
    }

    /// `host/repo`.
    pub fn repo(&self) -> String {
        self.reference.locator()
    }

    pub fn tag(&self) -> Option<&str> {
        self.reference.tag.as_deref()
    }

    /// Location of another blob in the same repository.
    pub fn blob_ref(&self, digest: &Digest) -> String {
        self.reference.with_digest(digest).to_string()
    }
}

impl fmt::Display for AppRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.spec)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlobType {
    AppManifest,
    AppBundle,
    AppLayersMeta,
    ImageIndex,
    SkopeoImageIndex,
    ImageManifest,
    ImageConfig,
    ImageLayer,
    Unknown,
}

impl BlobType {
    pub fn is_image_root(self) -> bool {
        matches!(
            self,
            BlobType::ImageIndex | BlobType::SkopeoImageIndex | BlobType::ImageManifest
        )
    }
}

impl fmt::Display for BlobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BlobType::AppManifest => "app manifest",
            BlobType::AppBundle => "app bundle",
            BlobType::AppLayersMeta => "app layers meta",
            BlobType::ImageIndex => "image index",
            BlobType::SkopeoImageIndex => "skopeo image index",
            BlobType::ImageManifest => "image manifest",
            BlobType::ImageConfig => "image config",
            BlobType::ImageLayer => "image layer",
            BlobType::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One blob of an app tree.
#[derive(Debug, Clone, PartialEq)]
pub struct TreeNode {
    pub descriptor: Descriptor,
    pub blob_type: BlobType,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn new(descriptor: Descriptor, blob_type: BlobType) -> Self {
        Self {
            descriptor,
            blob_type,
            children: Vec::new(),
        }
    }

    /// Config hash stamped on an image root.
    pub fn config_hash(&self) -> Option<&str> {
        self.descriptor.annotation(ANNOTATION_CONFIG_HASH)
    }

    /// First URL hint: where the blob lives in a registry.
    pub fn reference(&self) -> Option<&str> {
        self.descriptor.reference()
    }

    /// Add `child` unless a sibling of the same type already has its digest
    /// and config hash. Services sharing an image with different definitions
    /// keep one node each.
    pub fn push_child(&mut self, child: TreeNode) {
        let dup = self.children.iter().any(|c| {
            c.blob_type == child.blob_type
                && c.descriptor.digest == child.descriptor.digest
                && c.config_hash() == child.config_hash()
        });
        if !dup {
            self.children.push(child);
        }
    }

    /// Visit every node, parent before children, children in stored order.
    /// `depth` is 1 for `self`. Fails before visiting anything deeper than
    /// [`MAX_MERKLE_TREE_DEPTH`].
    pub fn walk<F>(&self, f: &mut F) -> Result<()>
    where
        F: FnMut(&TreeNode, usize) -> Result<()>,
    {
        self.walk_at(1, f)
    }

    fn walk_at<F>(&self, depth: usize, f: &mut F) -> Result<()>
    where
        F: FnMut(&TreeNode, usize) -> Result<()>,
    {
        if depth > MAX_MERKLE_TREE_DEPTH {
            return Err(Error::Integrity(format!(
                "tree depth exceeded: {} is deeper than {}",
                self.descriptor.digest, MAX_MERKLE_TREE_DEPTH
            )));
        }
        f(self, depth)?;
        for child in &self.children {
            child.walk_at(depth + 1, f)?;
        }
        Ok(())
    }

    /// All nodes in walk order.
    pub fn nodes(&self) -> Result<Vec<&TreeNode>> {
        let mut out = Vec::new();
        self.walk_refs(1, &mut out)?;
        Ok(out)
    }

    fn walk_refs<'a>(&'a self, depth: usize, out: &mut Vec<&'a TreeNode>) -> Result<()> {
        if depth > MAX_MERKLE_TREE_DEPTH {
            return Err(Error::Integrity(format!(
                "tree depth exceeded at {}",
                self.descriptor.digest
            )));
        }
        out.push(self);
        for child in &self.children {
            child.walk_refs(depth + 1, out)?;
        }
        Ok(())
    }
}

/// A loaded app: its reference, tree and compose project.
#[derive(Debug, Clone)]
pub struct App {
    pub app_ref: AppRef,
    pub tree: TreeNode,
    pub project: ComposeProject,
    pub layers_meta: Option<LayersMeta>,
}

impl App {
    pub fn name(&self) -> &str {
        &self.app_ref.name
    }

    pub fn bundle(&self) -> Option<&TreeNode> {
        self.tree
            .children
            .iter()
            .find(|c| c.blob_type == BlobType::AppBundle)
    }

    /// Image root nodes, one per distinct service image.
    pub fn image_roots(&self) -> impl Iterator<Item = &TreeNode> {
        self.bundle()
            .into_iter()
            .flat_map(|b| b.children.iter())
            .filter(|c| c.blob_type.is_image_root())
    }

    /// The image root node of a service.
    pub fn image_root(&self, service: &ComposeService) -> Option<&TreeNode> {
        let mut roots = self
            .image_roots()
            .filter(|n| n.descriptor.digest == service.image.digest);
        let first = roots.next()?;
        if first.config_hash() == Some(service.config_hash.as_str()) {
            return Some(first);
        }
        roots
            .find(|n| n.config_hash() == Some(service.config_hash.as_str()))
            .or(Some(first))
    }
}
