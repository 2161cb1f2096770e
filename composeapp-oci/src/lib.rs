//! OCI plumbing for compose apps: digests, references, manifests, verified
//! blob readers, blob providers, the registry client and the
//! content-addressed store.

pub mod digest;
pub mod error;
pub mod manifest;
pub mod provider;
pub mod reader;
pub mod reference;
pub mod registry;
pub mod store;
pub mod unpack;

pub use digest::Digest;
pub use error::{OciError, Result};
pub use manifest::{Descriptor, ImageIndex, OciManifest, Platform, PlatformMatcher};
pub use provider::{read_blob, read_blob_with_limit, BlobProvider, MemoryProvider, ReadOpts};
pub use reader::{BlobStream, IntegrityReader};
pub use reference::Reference;
pub use registry::{Credentials, RegistryClient, RegistryConfig};
pub use store::{BlobWriter, ContentStore, PruneStats};
