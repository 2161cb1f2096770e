//! Builds app trees from any [`BlobProvider`].

use composeapp_oci::manifest::{
    self, ManifestKind, ANNOTATION_CONFIG_HASH, MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
    MEDIA_TYPE_OCTET_STREAM,
};
use composeapp_oci::reader::{read_all, BlobStream};
use composeapp_oci::unpack::find_file_in_tgz;
use composeapp_oci::{
    BlobProvider, Descriptor, ImageIndex, OciError, OciManifest, PlatformMatcher, ReadOpts,
    Reference,
};
use tokio_util::io::SyncIoBridge;
use tracing::{debug, info};

use super::layers_meta::{ANNOTATION_LAYERS_META, LAYERS_META_VERSION};
use super::project::{ImageRef, COMPOSE_FILE};
use super::{App, AppRef, BlobType, ComposeProject, LayersMeta, TreeNode};
use crate::{Error, Result};

/// Read limit for the top-level app manifest.
pub const APP_MANIFEST_MAX_SIZE: u64 = 50 * 1024;
/// Read limit for a service image's root index or manifest.
pub const IMAGE_ROOT_MAX_SIZE: u64 = 100 * 1024;

/// Load the tree of the app at `uri`, which must be digest-pinned.
pub async fn load_app(
    provider: &dyn BlobProvider,
    matcher: &PlatformMatcher,
    uri: &str,
) -> Result<App> {
    let app_ref = AppRef::parse_pinned(uri)?;
    debug!(app = %app_ref.name, uri, "loading app tree");

    let opts = ReadOpts::new()
        .reference(app_ref.spec.as_str())
        .digest(app_ref.digest.clone())
        .limit(APP_MANIFEST_MAX_SIZE)
        .media_type(MEDIA_TYPE_OCI_MANIFEST);
    let bytes = read_all(provider.open_blob(&opts).await?).await?;
    let app_manifest: OciManifest = serde_json::from_slice(&bytes)?;
    if app_manifest.media_type != MEDIA_TYPE_OCI_MANIFEST {
        return Err(Error::Integrity(format!(
            "app manifest {} has unsupported media type {:?}",
            app_ref, app_manifest.media_type
        )));
    }

    let mut root_desc =
        Descriptor::new(MEDIA_TYPE_OCI_MANIFEST, app_ref.digest.clone(), bytes.len() as u64);
    root_desc.urls.push(app_ref.spec.clone());
    root_desc.annotations = app_manifest.annotations.clone();
    let mut root = TreeNode::new(root_desc, BlobType::AppManifest);

    // layers[0]: the compose bundle.
    let bundle_layer = app_manifest
        .layers
        .first()
        .ok_or_else(|| Error::Integrity(format!("app manifest {app_ref} has no layers")))?;
    if bundle_layer.media_type != MEDIA_TYPE_OCTET_STREAM {
        return Err(Error::Integrity(format!(
            "app bundle of {} has unsupported media type {}",
            app_ref, bundle_layer.media_type
        )));
    }
    let bundle_desc = with_urls(bundle_layer, vec![app_ref.blob_ref(&bundle_layer.digest)]);
    let mut bundle_stream = SyncIoBridge::new(open_exact(provider, &bundle_desc).await?);
    let compose = tokio::task::spawn_blocking(move || -> Result<Option<Vec<u8>>> {
        let found = find_file_in_tgz(&mut bundle_stream, COMPOSE_FILE)?;
        // The digest is checked once the stream hits its end.
        std::io::copy(&mut bundle_stream, &mut std::io::sink()).map_err(OciError::from_io)?;
        Ok(found)
    })
    .await
    .map_err(|e| Error::Internal(format!("bundle scan task failed: {e}")))??
    .ok_or_else(|| Error::Integrity(format!("{COMPOSE_FILE} missing from bundle of {app_ref}")))?;
    let project = ComposeProject::parse(&compose)?;

    let mut bundle = TreeNode::new(bundle_desc, BlobType::AppBundle);
    for service in &project.services {
        let image = load_image_tree(provider, matcher, &service.image, &service.config_hash).await?;
        bundle.push_child(image);
    }
    root.push_child(bundle);

    // layers[1]: optional layer size hints.
    let mut layers_meta = None;
    if let Some(meta_layer) = app_manifest
        .layers
        .get(1)
        .filter(|l| l.annotation(ANNOTATION_LAYERS_META) == Some(LAYERS_META_VERSION))
    {
        let desc = with_urls(meta_layer, vec![app_ref.blob_ref(&meta_layer.digest)]);
        let meta_bytes = read_exact(provider, &desc).await?;
        layers_meta = LayersMeta::parse_for_arch(&meta_bytes, &matcher.target().architecture)?;
        root.push_child(TreeNode::new(desc, BlobType::AppLayersMeta));
    }

    info!(
        app = %app_ref.name,
        services = project.services.len(),
        "loaded app tree"
    );
    Ok(App {
        app_ref,
        tree: root,
        project,
        layers_meta,
    })
}

/// Load several apps in order.
pub async fn load_apps(
    provider: &dyn BlobProvider,
    matcher: &PlatformMatcher,
    uris: &[String],
) -> Result<Vec<App>> {
    let mut apps = Vec::with_capacity(uris.len());
    for uri in uris {
        apps.push(load_app(provider, matcher, uri).await?);
    }
    Ok(apps)
}

/// Load the image sub-tree of one compose service.
async fn load_image_tree(
    provider: &dyn BlobProvider,
    matcher: &PlatformMatcher,
    image: &ImageRef,
    config_hash: &str,
) -> Result<TreeNode> {
    let root_ref = image.digest_ref();
    let opts = ReadOpts::new()
        .reference(root_ref.as_str())
        .digest(image.digest.clone())
        .limit(IMAGE_ROOT_MAX_SIZE);
    let bytes = read_all(provider.open_blob(&opts).await?).await?;
    let (kind, media_type) = manifest::classify(&bytes)?;

    let default_type = match kind {
        ManifestKind::Index => MEDIA_TYPE_OCI_INDEX,
        ManifestKind::Manifest => MEDIA_TYPE_OCI_MANIFEST,
    };
    let media_type = if media_type.is_empty() {
        default_type.to_string()
    } else {
        media_type
    };
    let mut desc = Descriptor::new(media_type, image.digest.clone(), bytes.len() as u64);
    desc.urls.push(root_ref.clone());
    desc.annotations
        .insert(ANNOTATION_CONFIG_HASH.to_string(), config_hash.to_string());

    match kind {
        ManifestKind::Manifest => {
            let m: OciManifest = serde_json::from_slice(&bytes)?;
            let mut node = TreeNode::new(desc, BlobType::ImageManifest);
            add_manifest_children(&mut node, &m, &image.reference);
            Ok(node)
        }
        ManifestKind::Index => {
            let index: ImageIndex = serde_json::from_slice(&bytes)?;
            let skopeo = index.is_skopeo();
            let blob_type = if skopeo {
                BlobType::SkopeoImageIndex
            } else {
                BlobType::ImageIndex
            };
            let mut node = TreeNode::new(desc, blob_type);
            let selected: Vec<&Descriptor> = if skopeo {
                index.manifests.iter().collect()
            } else {
                index.matching(matcher).collect()
            };
            debug!(
                image = %image.spec,
                total = index.manifests.len(),
                selected = selected.len(),
                "filtered image index"
            );

            for child in selected {
                let child_ref = image.reference.with_digest(&child.digest).to_string();
                let child_desc = with_urls(child, vec![child_ref, root_ref.clone()]);
                let child_bytes = read_exact(provider, &child_desc).await?;
                let (child_kind, _) = manifest::classify(&child_bytes)?;
                if child_kind != ManifestKind::Manifest {
                    return Err(Error::Integrity(format!(
                        "nested image index {} in {} is not supported",
                        child.digest, image.spec
                    )));
                }
                let m: OciManifest = serde_json::from_slice(&child_bytes)?;
                let mut manifest_node = TreeNode::new(child_desc, BlobType::ImageManifest);
                add_manifest_children(&mut manifest_node, &m, &image.reference);
                node.push_child(manifest_node);
            }
            Ok(node)
        }
    }
}

fn add_manifest_children(node: &mut TreeNode, m: &OciManifest, repo: &Reference) {
    let locate = |d: &Descriptor| with_urls(d, vec![repo.with_digest(&d.digest).to_string()]);
    node.push_child(TreeNode::new(locate(&m.config), BlobType::ImageConfig));
    for layer in &m.layers {
        node.push_child(TreeNode::new(locate(layer), BlobType::ImageLayer));
    }
}

fn with_urls(desc: &Descriptor, urls: Vec<String>) -> Descriptor {
    let mut out = desc.clone();
    out.urls = urls;
    out
}

/// Read a blob whose digest, size and media type are all known.
async fn read_exact(provider: &dyn BlobProvider, desc: &Descriptor) -> Result<Vec<u8>> {
    Ok(read_all(open_exact(provider, desc).await?).await?)
}

/// Open the blob `desc` names at its first location, checked against its
/// digest and size.
async fn open_exact(provider: &dyn BlobProvider, desc: &Descriptor) -> Result<BlobStream> {
    let reference = desc
        .reference()
        .ok_or_else(|| Error::Internal(format!("descriptor {} has no location", desc.digest)))?;
    let opts = ReadOpts::new()
        .reference(reference)
        .digest(desc.digest.clone())
        .size(desc.size)
        .media_type(desc.media_type.as_str());
    Ok(provider.open_blob(&opts).await?)
}
