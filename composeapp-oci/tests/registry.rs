use composeapp_oci::manifest::{MEDIA_TYPE_OCI_MANIFEST, MEDIA_TYPE_OCTET_STREAM};
use composeapp_oci::reader::read_all;
use composeapp_oci::{BlobProvider, Digest, OciError, ReadOpts, RegistryClient, RegistryConfig};
use httpmock::prelude::*;

fn client() -> RegistryClient {
    RegistryClient::new(RegistryConfig::default()).unwrap()
}

fn reference(server: &MockServer, d: &Digest) -> String {
    format!("{}/factory/app@{d}", server.address())
}

#[tokio::test]
async fn blob_get_is_verified() {
    let server = MockServer::start_async().await;
    let data = b"some blob data";
    let d = Digest::of(data);
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path(format!("/v2/factory/app/blobs/{d}"));
            then.status(200).body(data);
        })
        .await;

    let opts = ReadOpts::new()
        .reference(reference(&server, &d))
        .size(14)
        .media_type(MEDIA_TYPE_OCTET_STREAM);
    let out = read_all(client().open_blob(&opts).await.unwrap())
        .await
        .unwrap();
    assert_eq!(out, data);
    mock.assert_async().await;
}

#[tokio::test]
async fn tampered_blob_fails_digest_check() {
    let server = MockServer::start_async().await;
    let d = Digest::of(b"some blob data");
    server
        .mock_async(|when, then| {
            when.method(GET).path(format!("/v2/factory/app/blobs/{d}"));
            then.status(200).body("some invalid blob data");
        })
        .await;

    let opts = ReadOpts::new()
        .reference(reference(&server, &d))
        .size(14)
        .media_type(MEDIA_TYPE_OCTET_STREAM);
    let err = read_all(client().open_blob(&opts).await.unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, OciError::DigestMismatch { .. }), "{err}");
}

#[tokio::test]
async fn ranged_get_sends_range_header() {
    let server = MockServer::start_async().await;
    let data = b"0123456789";
    let d = Digest::of(data);
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path(format!("/v2/factory/app/blobs/{d}"))
                .header("range", "bytes=4-");
            then.status(206).body(&data[4..]);
        })
        .await;

    let opts = ReadOpts::new()
        .reference(reference(&server, &d))
        .size(10)
        .media_type(MEDIA_TYPE_OCTET_STREAM)
        .offset(4);
    let out = read_all(client().open_blob(&opts).await.unwrap())
        .await
        .unwrap();
    assert_eq!(out, b"456789");
    mock.assert_async().await;
}

#[tokio::test]
async fn ignored_range_skips_prefix() {
    let server = MockServer::start_async().await;
    let data = b"0123456789";
    let d = Digest::of(data);
    server
        .mock_async(|when, then| {
            when.method(GET).path(format!("/v2/factory/app/blobs/{d}"));
            then.status(200).body(data);
        })
        .await;

    let opts = ReadOpts::new()
        .reference(reference(&server, &d))
        .size(10)
        .media_type(MEDIA_TYPE_OCTET_STREAM)
        .offset(6);
    let out = read_all(client().open_blob(&opts).await.unwrap())
        .await
        .unwrap();
    assert_eq!(out, b"6789");
}

#[tokio::test]
async fn manifest_head_resolves_media_type() {
    let server = MockServer::start_async().await;
    let body = br#"{"schemaVersion":2}"#;
    let d = Digest::of(body);
    let head = server
        .mock_async(|when, then| {
            when.method(httpmock::Method::HEAD).path(format!("/v2/factory/app/manifests/{d}"));
            then.status(200)
                .header("content-type", MEDIA_TYPE_OCI_MANIFEST)
                .header("docker-content-digest", d.to_string())
                .body(&body[..]);
        })
        .await;
    let get = server
        .mock_async(|when, then| {
            when.method(GET).path(format!("/v2/factory/app/manifests/{d}"));
            then.status(200)
                .header("content-type", MEDIA_TYPE_OCI_MANIFEST)
                .body(&body[..]);
        })
        .await;

    let opts = ReadOpts::new()
        .reference(reference(&server, &d))
        .limit(50 * 1024);
    let out = read_all(client().open_blob(&opts).await.unwrap())
        .await
        .unwrap();
    assert_eq!(out, body);
    head.assert_async().await;
    get.assert_async().await;
}

#[tokio::test]
async fn bearer_challenge_is_answered() {
    let server = MockServer::start_async().await;
    let data = b"private";
    let d = Digest::of(data);
    let challenge = format!(
        r#"Bearer realm="http://{}/token",service="registry",scope="repository:factory/app:pull""#,
        server.address()
    );
    server
        .mock_async(|when, then| {
            when.method(GET)
                .path(format!("/v2/factory/app/blobs/{d}"))
                .header_missing("authorization");
            then.status(401).header("www-authenticate", challenge.as_str());
        })
        .await;
    let token = server
        .mock_async(|when, then| {
            when.method(GET).path("/token").query_param("service", "registry");
            then.status(200).body(r#"{"token":"t0k3n"}"#);
        })
        .await;
    let authed = server
        .mock_async(|when, then| {
            when.method(GET)
                .path(format!("/v2/factory/app/blobs/{d}"))
                .header("authorization", "Bearer t0k3n");
            then.status(200).body(data);
        })
        .await;

    let opts = ReadOpts::new()
        .reference(reference(&server, &d))
        .size(7)
        .media_type(MEDIA_TYPE_OCTET_STREAM);
    let out = read_all(client().open_blob(&opts).await.unwrap())
        .await
        .unwrap();
    assert_eq!(out, data);
    token.assert_async().await;
    authed.assert_async().await;
}

#[tokio::test]
async fn status_codes_map_to_errors() {
    let server = MockServer::start_async().await;
    let missing = Digest::of(b"missing");
    let denied = Digest::of(b"denied");
    server
        .mock_async(|when, then| {
            when.method(GET).path(format!("/v2/factory/app/blobs/{missing}"));
            then.status(404);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path(format!("/v2/factory/app/blobs/{denied}"));
            then.status(403);
        })
        .await;

    let c = client();
    let open = |d: &Digest| {
        ReadOpts::new()
            .reference(reference(&server, d))
            .size(7)
            .media_type(MEDIA_TYPE_OCTET_STREAM)
    };
    assert!(matches!(
        c.open_blob(&open(&missing)).await,
        Err(OciError::NotFound(_))
    ));
    assert!(matches!(
        c.open_blob(&open(&denied)).await,
        Err(OciError::Unauthorized(_))
    ));
}
