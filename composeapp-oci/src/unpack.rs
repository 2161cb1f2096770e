//! Compose-bundle tarball helpers (`tar+gzip`).
//!
//! These are blocking; async callers run them on the blocking pool or over
//! an in-memory buffer.

use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::{debug, warn};

use crate::error::{OciError, Result};

/// A regular file found in a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFile {
    pub path: PathBuf,
    pub size: u64,
}

fn open(reader: impl Read) -> Archive<GzDecoder<impl Read>> {
    let mut archive = Archive::new(GzDecoder::new(reader));
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(false);
    archive.set_unpack_xattrs(false);
    archive
}

/// Strip `./` prefixes so `./docker-compose.yml` and `docker-compose.yml`
/// compare equal.
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Extract a `tar+gzip` stream into `dest`, never writing outside it and
/// never changing ownership. Returns the regular files written.
pub fn extract_tgz(reader: impl Read, dest: &Path) -> Result<Vec<BundleFile>> {
    fs::create_dir_all(dest)?;
    let mut archive = open(reader);
    let mut written = Vec::new();

    for entry_result in archive.entries()? {
        let mut entry = entry_result?;
        let rel_path = normalize(&entry.path()?);
        if rel_path.as_os_str().is_empty() {
            continue;
        }
        let is_file = entry.header().entry_type().is_file();
        let size = entry.header().size()?;
        if !entry.unpack_in(dest)? {
            warn!(path = %rel_path.display(), "skipped bundle entry outside destination");
            continue;
        }
        if is_file {
            written.push(BundleFile {
                path: rel_path,
                size,
            });
        }
    }

    debug!(dest = %dest.display(), files = written.len(), "extracted bundle");
    Ok(written)
}

/// Return the contents of the first regular file at `name`, if any.
/// Errors a verifying reader raises keep their type.
pub fn find_file_in_tgz(reader: impl Read, name: &str) -> Result<Option<Vec<u8>>> {
    find_file(reader, name).map_err(OciError::from_io)
}

fn find_file(reader: impl Read, name: &str) -> io::Result<Option<Vec<u8>>> {
    let wanted = normalize(Path::new(name));
    let mut archive = open(reader);
    for entry_result in archive.entries()? {
        let mut entry = entry_result?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        if normalize(&entry.path()?) == wanted {
            let mut out = Vec::with_capacity(entry.header().size()? as usize);
            entry.read_to_end(&mut out)?;
            return Ok(Some(out));
        }
    }
    Ok(None)
}

/// List every regular file in a bundle together with its size.
pub fn list_tgz_files(reader: impl Read) -> Result<Vec<BundleFile>> {
    list_files(reader).map_err(OciError::from_io)
}

fn list_files(reader: impl Read) -> io::Result<Vec<BundleFile>> {
    let mut archive = open(reader);
    let mut out = Vec::new();
    for entry_result in archive.entries()? {
        let entry = entry_result?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        out.push(BundleFile {
            path: normalize(&entry.path()?),
            size: entry.header().size()?,
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
