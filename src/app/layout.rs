//! `apps/<name>/<digest-hex>/` layouts: symlinked views of store blobs that
//! record which apps the store holds.

use std::path::{Path, PathBuf};

use composeapp_oci::manifest::MEDIA_TYPE_OCI_INDEX;
use composeapp_oci::unpack::find_file_in_tgz;
use composeapp_oci::{ContentStore, ImageIndex};
use tokio::fs;
use tracing::{debug, info, warn};

use super::project::COMPOSE_FILE;
use super::{App, AppRef, BlobType};
use crate::{Error, Result};

/// Directory of one app version inside the store.
pub fn app_dir(store: &ContentStore, app_ref: &AppRef) -> PathBuf {
    store
        .apps_dir()
        .join(&app_ref.name)
        .join(app_ref.digest.hex())
}

/// Write the layout of `app`, whose blobs must all be in `store`.
pub async fn materialize(store: &ContentStore, app: &App) -> Result<PathBuf> {
    let dir = app_dir(store, &app.app_ref);
    fs::create_dir_all(&dir).await?;
    fs::write(dir.join("uri"), app.app_ref.spec.as_bytes()).await?;

    relink(&store.blob_path(&app.app_ref.digest), &dir.join("manifest.json")).await?;

    let bundle = app
        .bundle()
        .ok_or_else(|| Error::Internal(format!("app {} has no bundle node", app.app_ref)))?;
    let bundle_path = store.blob_path(&bundle.descriptor.digest);
    relink(
        &bundle_path,
        &dir.join(format!("{}.tgz", bundle.descriptor.digest.hex())),
    )
    .await?;

    let compose = tokio::task::spawn_blocking(move || {
        let file = std::fs::File::open(&bundle_path)?;
        find_file_in_tgz(file, COMPOSE_FILE).map_err(Error::from)
    })
    .await
    .map_err(|e| Error::Internal(format!("bundle scan task failed: {e}")))??
    .ok_or_else(|| Error::Integrity(format!("{COMPOSE_FILE} missing from bundle")))?;
    fs::write(dir.join(COMPOSE_FILE), compose).await?;

    for root in app.image_roots() {
        let Some(reference) = root.reference() else {
            continue;
        };
        let image = composeapp_oci::Reference::parse(reference)?;
        let image_dir = dir
            .join("images")
            .join(&image.registry)
            .join(&image.repository)
            .join(root.descriptor.digest.hex());
        fs::create_dir_all(&image_dir).await?;
        let index_path = image_dir.join("index.json");
        match root.blob_type {
            BlobType::ImageIndex | BlobType::SkopeoImageIndex => {
                relink(&store.blob_path(&root.descriptor.digest), &index_path).await?;
            }
            _ => {
                // A bare manifest gets a one-entry index.
                let index = ImageIndex {
                    schema_version: 2,
                    media_type: MEDIA_TYPE_OCI_INDEX.to_string(),
                    manifests: vec![root.descriptor.clone()],
                    annotations: Default::default(),
                };
                let _ = fs::remove_file(&index_path).await;
                fs::write(&index_path, serde_json::to_vec_pretty(&index)?).await?;
            }
        }
    }

    info!(app = %app.app_ref.name, dir = %dir.display(), "materialized app layout");
    Ok(dir)
}

/// Replace `link` with a symlink to `target`.
async fn relink(target: &Path, link: &Path) -> Result<()> {
    match fs::remove_file(link).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    fs::symlink(target, link).await?;
    Ok(())
}

/// Every app with a layout in the store.
pub async fn list_apps(store: &ContentStore) -> Result<Vec<AppRef>> {
    let mut out = Vec::new();
    for uri in store.list_app_uris().await? {
        match AppRef::parse_pinned(&uri) {
            Ok(r) => out.push(r),
            Err(e) => warn!(%uri, error = %e, "ignoring malformed app uri"),
        }
    }
    Ok(out)
}

/// Delete an app layout; also drops the `apps/<name>` directory once empty.
pub async fn remove_app(store: &ContentStore, app_ref: &AppRef) -> Result<()> {
    let dir = app_dir(store, app_ref);
    match fs::remove_dir_all(&dir).await {
        Ok(()) => debug!(app = %app_ref.name, "removed app layout"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound(format!("app {app_ref} is not in the store")));
        }
        Err(e) => return Err(e.into()),
    }
    if let Some(parent) = dir.parent() {
        // Fails when other versions remain.
        let _ = fs::remove_dir(parent).await;
    }
    Ok(())
}
