//! App tree loading: platform selection, URL hints, layer size hints and
//! malformed apps.

mod common;

use common::{compose_file, layer_bytes, push_app, push_image, push_index_image, tgz, REGISTRY};
use composeapp::app::{load_app, BlobType, TreeNode};
use composeapp::blob::{BlobInfo, BlobState};
use composeapp::ErrorKind;
use composeapp_oci::manifest::{MEDIA_TYPE_OCI_MANIFEST, MEDIA_TYPE_OCTET_STREAM};
use composeapp_oci::{Digest, MemoryProvider, Platform, PlatformMatcher};
use serde_json::json;

const PLATFORMS: [&str; 3] = ["linux/amd64", "linux/arm/v7", "linux/arm64/v8"];

fn matcher(raw: &str) -> PlatformMatcher {
    PlatformMatcher::new(Platform::parse(raw).unwrap())
}

fn image_root(tree: &TreeNode) -> &TreeNode {
    let bundle = tree
        .children
        .iter()
        .find(|c| c.blob_type == BlobType::AppBundle)
        .unwrap();
    bundle
        .children
        .iter()
        .find(|c| c.blob_type.is_image_root())
        .unwrap()
}

fn push_multi_arch_app(registry: &MemoryProvider) -> (String, String, Vec<Digest>) {
    let (image, children) = push_index_image(registry, "web", "web-1.0", &PLATFORMS);
    let app = push_app(
        registry,
        "shop",
        &compose_file(&[("web", &image)]),
        &[&image],
        None,
    );
    (app.uri, image.uri, children)
}

#[tokio::test]
async fn index_keeps_only_the_matching_platform() {
    let registry = MemoryProvider::new();
    let (uri, image_uri, children) = push_multi_arch_app(&registry);

    let app = load_app(&registry, &matcher("arm64/v8"), &uri).await.unwrap();
    let root = image_root(&app.tree);
    assert_eq!(root.blob_type, BlobType::ImageIndex);
    assert_eq!(root.children.len(), 1);
    let manifest = &root.children[0];
    assert_eq!(manifest.blob_type, BlobType::ImageManifest);
    assert_eq!(manifest.descriptor.digest, children[2]);

    // Child manifests carry their own location, then the index's.
    let child_ref = format!("{REGISTRY}/web@{}", children[2]);
    assert_eq!(manifest.descriptor.urls, vec![child_ref, image_uri.clone()]);
    assert_eq!(root.descriptor.urls, vec![image_uri]);

    let types: Vec<BlobType> = manifest.children.iter().map(|c| c.blob_type).collect();
    assert_eq!(types, vec![BlobType::ImageConfig, BlobType::ImageLayer]);
    for node in app.tree.nodes().unwrap() {
        assert!(node.reference().is_some(), "{} has no location", node.descriptor.digest);
    }
}

#[tokio::test]
async fn unmatched_variant_selects_nothing() {
    let registry = MemoryProvider::new();
    let (uri, _, _) = push_multi_arch_app(&registry);

    let app = load_app(&registry, &matcher("arm64/v9"), &uri).await.unwrap();
    assert!(image_root(&app.tree).children.is_empty());

    let app = load_app(&registry, &matcher("linux/amd64"), &uri).await.unwrap();
    assert_eq!(image_root(&app.tree).children.len(), 1);
}

#[tokio::test]
async fn skopeo_index_keeps_every_platform() {
    let registry = MemoryProvider::new();
    let (image, _) = push_index_image(&registry, "web", "web-1.0", &PLATFORMS);
    // Same manifests, written without a media type.
    let original = registry.remove(image.digest()).unwrap();
    let mut index: serde_json::Value = serde_json::from_slice(&original).unwrap();
    index.as_object_mut().unwrap().remove("mediaType");
    let skopeo = registry.insert(index.to_string().into_bytes());
    let uri = format!("{REGISTRY}/web@{skopeo}");
    let compose = format!("services:\n  web:\n    image: {uri}\n");
    let app = push_app(&registry, "shop", &compose, &[], None);

    let app = load_app(&registry, &matcher("arm64/v8"), &app.uri).await.unwrap();
    let root = image_root(&app.tree);
    assert_eq!(root.blob_type, BlobType::SkopeoImageIndex);
    assert_eq!(root.children.len(), PLATFORMS.len());
}

#[tokio::test]
async fn layers_meta_sizes_runtime_usage() {
    let registry = MemoryProvider::new();
    let image = push_image(&registry, "web", "web-1.0");
    let layer_digest = Digest::of(&layer_bytes("web-1.0", "amd64"));
    let meta = json!({
        "amd64": {
            "fs_block_size": 4096,
            "layers": {
                layer_digest.to_string(): { "size": 10, "usage": 10_000, "archive_size": 12 }
            }
        }
    });
    let app = push_app(
        &registry,
        "shop",
        &compose_file(&[("web", &image)]),
        &[&image],
        Some(&meta),
    );

    let app = load_app(&registry, &matcher("linux/amd64"), &app.uri).await.unwrap();
    let meta_node = app
        .tree
        .children
        .iter()
        .find(|c| c.blob_type == BlobType::AppLayersMeta)
        .unwrap();
    assert!(meta_node.reference().is_some());
    let meta = app.layers_meta.as_ref().unwrap();
    assert_eq!(meta.fs_block_size, 4096);

    let layer = app
        .tree
        .nodes()
        .unwrap()
        .into_iter()
        .find(|n| n.blob_type == BlobType::ImageLayer)
        .unwrap();
    let info = BlobInfo::new(layer, BlobState::Missing, 512, Some(meta));
    assert_eq!(info.runtime_size, 12_288);
    assert_eq!(info.store_size % 512, 0);
}

#[tokio::test]
async fn services_sharing_an_image_share_a_node() {
    let registry = MemoryProvider::new();
    let image = push_image(&registry, "web", "web-1.0");
    let compose = compose_file(&[("blue", &image), ("green", &image)]);
    let app = push_app(&registry, "shop", &compose, &[&image], None);

    let app = load_app(&registry, &matcher("linux/amd64"), &app.uri).await.unwrap();
    assert_eq!(app.project.services.len(), 2);
    assert_eq!(app.image_roots().count(), 1);
    // Identical definitions hash the same; the name is not part of it.
    assert_eq!(
        app.project.services[0].config_hash,
        app.project.services[1].config_hash
    );
    assert_eq!(app.tree.nodes().unwrap().len(), 5);
}

#[tokio::test]
async fn services_sharing_an_image_keep_their_own_hash() {
    let registry = MemoryProvider::new();
    let image = push_image(&registry, "web", "web-1.0");
    let compose = format!(
        "services:\n  blue:\n    image: {uri}\n    environment: [COLOR=blue]\n  green:\n    image: {uri}\n    environment: [COLOR=green]\n",
        uri = image.uri
    );
    let app = push_app(&registry, "shop", &compose, &[&image], None);

    let app = load_app(&registry, &matcher("linux/amd64"), &app.uri).await.unwrap();
    let blue = &app.project.services[0];
    let green = &app.project.services[1];
    assert_ne!(blue.config_hash, green.config_hash);

    let roots: Vec<_> = app.image_roots().collect();
    assert_eq!(roots.len(), 2);
    assert_eq!(roots[0].descriptor.digest, roots[1].descriptor.digest);
    assert_eq!(
        app.image_root(blue).unwrap().config_hash(),
        Some(blue.config_hash.as_str())
    );
    assert_eq!(
        app.image_root(green).unwrap().config_hash(),
        Some(green.config_hash.as_str())
    );
}

#[tokio::test]
async fn published_config_hash_is_kept() {
    let registry = MemoryProvider::new();
    let image = push_image(&registry, "web", "web-1.0");
    let compose = format!(
        "services:\n  web:\n    image: {}\n    labels:\n      io.compose-spec.config-hash: feedface\n",
        image.uri
    );
    let app = push_app(&registry, "shop", &compose, &[&image], None);

    let app = load_app(&registry, &matcher("linux/amd64"), &app.uri).await.unwrap();
    assert_eq!(app.project.services[0].config_hash, "feedface");
    let root = app.image_roots().next().unwrap();
    assert_eq!(root.config_hash(), Some("feedface"));
}

// ──────────────────────────────────────────────────────────────────────────────
// Malformed apps
// ──────────────────────────────────────────────────────────────────────────────

fn push_raw_app(registry: &MemoryProvider, name: &str, bundle: Vec<u8>, media_type: &str) -> String {
    let size = bundle.len();
    let bundle = registry.insert(bundle);
    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": media_type,
        "config": {
            "mediaType": "application/vnd.oci.empty.v1+json",
            "digest": Digest::of(b"{}").to_string(),
            "size": 2,
        },
        "layers": [{ "mediaType": MEDIA_TYPE_OCTET_STREAM, "digest": bundle.to_string(), "size": size }],
    });
    let digest = registry.insert(manifest.to_string().into_bytes());
    format!("{REGISTRY}/{name}@{digest}")
}

#[tokio::test]
async fn bundle_is_verified_past_the_compose_file() {
    let registry = MemoryProvider::new();
    let bundle = tgz(&[
        ("docker-compose.yml", &b"services: {}\n"[..]),
        ("README.md", &b"tail of the bundle"[..]),
    ]);
    let size = bundle.len();
    let claimed = Digest::of(b"the bundle that was published");
    registry.insert_raw(claimed.clone(), bundle);
    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_OCI_MANIFEST,
        "config": {
            "mediaType": "application/vnd.oci.empty.v1+json",
            "digest": Digest::of(b"{}").to_string(),
            "size": 2,
        },
        "layers": [{ "mediaType": MEDIA_TYPE_OCTET_STREAM, "digest": claimed.to_string(), "size": size }],
    });
    let digest = registry.insert(manifest.to_string().into_bytes());
    let uri = format!("{REGISTRY}/tampered@{digest}");

    let err = load_app(&registry, &matcher("linux/amd64"), &uri)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Integrity, "{err}");
}

#[tokio::test]
async fn bundle_without_compose_file_is_rejected() {
    let registry = MemoryProvider::new();
    let uri = push_raw_app(
        &registry,
        "broken",
        tgz(&[("README.md", &b"nothing to run"[..])]),
        MEDIA_TYPE_OCI_MANIFEST,
    );
    let err = load_app(&registry, &matcher("linux/amd64"), &uri)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert!(err.to_string().contains("docker-compose.yml"), "{err}");
}

#[tokio::test]
async fn unpinned_service_image_is_rejected() {
    let registry = MemoryProvider::new();
    let compose = b"services:\n  web:\n    image: nginx:1.25\n";
    let uri = push_raw_app(
        &registry,
        "loose",
        tgz(&[("docker-compose.yml", &compose[..])]),
        MEDIA_TYPE_OCI_MANIFEST,
    );
    let err = load_app(&registry, &matcher("linux/amd64"), &uri)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn wrong_manifest_media_type_is_rejected() {
    let registry = MemoryProvider::new();
    let uri = push_raw_app(
        &registry,
        "legacy",
        tgz(&[("docker-compose.yml", &b"services: {}\n"[..])]),
        "application/vnd.docker.distribution.manifest.v2+json",
    );
    let err = load_app(&registry, &matcher("linux/amd64"), &uri)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Integrity);
}

#[tokio::test]
async fn tag_only_reference_is_rejected() {
    let registry = MemoryProvider::new();
    let err = load_app(&registry, &matcher("linux/amd64"), "hub.example.com/factory/shop:v1")
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test]
async fn missing_app_manifest_is_not_found() {
    let registry = MemoryProvider::new();
    let uri = format!("{REGISTRY}/shop@{}", Digest::of(b"gone"));
    let err = load_app(&registry, &matcher("linux/amd64"), &uri)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
