//! HTTP-level tests for downloads and the asset cache.
//!
//! Uses wiremock for reachable servers and a closed local port for the
//! unreachable case.

use sandcas_core::{
    Algorithm, AssetCache, AssetMetadata, DownloadOptions, Downloader, Error, FileStore, Hash,
    InfoOptions, Manifest, StoreOptions, TransportOptions,
};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TEXT_BODY: &str = "hello, world\nthis is a test file\n";
const TEXT_MD5: &str = "86d73d2f11e507365f7ea8e7ec3cc4cb";

/// Deterministic stand-in for a small PNG.
fn image_body() -> Vec<u8> {
    (0..3230u32).map(|i| (i * 31 % 251) as u8).collect()
}

fn downloader() -> (TempDir, Downloader) {
    let temp_dir = TempDir::new().unwrap();
    let store = FileStore::init(temp_dir.path().join("sandbox"), StoreOptions::default()).unwrap();
    let options = TransportOptions {
        connect_timeout: Duration::from_secs(5),
        ..TransportOptions::default()
    };
    let downloader = Downloader::with_http(store, &options).unwrap();
    (temp_dir, downloader)
}

async fn exists(downloader: &Downloader, path: &str) -> bool {
    downloader
        .store()
        .info(path, InfoOptions::default())
        .await
        .unwrap()
        .exists
}

#[tokio::test]
async fn download_image_with_digest_and_headers() {
    let server = MockServer::start().await;
    let body = image_body();
    Mock::given(method("GET"))
        .and(path("/avatar2.png"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body.clone(), "image/png"))
        .mount(&server)
        .await;

    let (_tmp, downloader) = downloader();
    let url = format!("{}/avatar2.png", server.uri());
    let options = DownloadOptions {
        hash: true,
        ..DownloadOptions::default()
    };
    let result = downloader.download(&url, "download1.png", options).await.unwrap();

    assert_eq!(result.status, 200);
    assert_eq!(result.size, 3230);
    assert_eq!(result.hash, Some(Hash::hash_bytes(Algorithm::Md5, &body)));
    assert_eq!(result.headers.get("Content-Type"), Some("image/png"));
    assert_eq!(result.headers.get("content-type"), Some("image/png"));

    let info = downloader
        .store()
        .info("download1.png", InfoOptions { hash: true, ..InfoOptions::default() })
        .await
        .unwrap();
    assert!(info.exists);
    assert_eq!(info.size, Some(3230));
    assert_eq!(info.uri, result.uri);
    assert_eq!(info.hash, result.hash);
}

#[tokio::test]
async fn download_text_fixture() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/text-file.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_string(TEXT_BODY))
        .mount(&server)
        .await;

    let (_tmp, downloader) = downloader();
    let url = format!("{}/text-file.txt", server.uri());
    let options = DownloadOptions {
        hash: true,
        ..DownloadOptions::default()
    };
    let result = downloader.download(&url, "text.txt", options).await.unwrap();

    assert_eq!(result.hash.unwrap().to_hex(), TEXT_MD5);
    assert_eq!(
        downloader.store().read_to_string("text.txt").await.unwrap(),
        TEXT_BODY
    );
}

#[tokio::test]
async fn download_not_found_still_writes_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such asset"))
        .mount(&server)
        .await;

    let (_tmp, downloader) = downloader();
    let url = format!("{}/missing.png", server.uri());
    let result = downloader
        .download(&url, "download404.png", DownloadOptions::default())
        .await
        .unwrap();

    assert_eq!(result.status, 404);
    assert!(exists(&downloader, "download404.png").await);
    assert_eq!(
        downloader
            .store()
            .read_to_string("download404.png")
            .await
            .unwrap(),
        "no such asset"
    );
}

#[tokio::test]
async fn download_unreachable_writes_nothing() {
    let (_tmp, downloader) = downloader();

    // Port 1 is closed on test machines.
    let result = downloader
        .download(
            "http://127.0.0.1:1/nothing.png",
            "nothing.png",
            DownloadOptions::default(),
        )
        .await;

    assert!(matches!(result, Err(Error::Transport { .. })));
    assert!(!exists(&downloader, "nothing.png").await);
}

#[tokio::test]
async fn download_wrong_expected_hash_writes_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(TEXT_BODY))
        .mount(&server)
        .await;

    let (_tmp, downloader) = downloader();
    let url = format!("{}/text-file.txt", server.uri());
    let options = DownloadOptions {
        expected_hash: Some(Hash::hash_bytes(Algorithm::Md5, b"different")),
        ..DownloadOptions::default()
    };
    let result = downloader.download(&url, "text.txt", options).await;

    assert!(matches!(result, Err(Error::Integrity { .. })));
    assert!(!exists(&downloader, "text.txt").await);
}

#[tokio::test]
async fn download_out_of_scope_makes_no_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string(TEXT_BODY))
        .expect(0)
        .mount(&server)
        .await;

    let (tmp, downloader) = downloader();
    let url = format!("{}/text-file.txt", server.uri());
    let result = downloader
        .download(&url, "../hello/world.txt", DownloadOptions::default())
        .await;

    assert!(matches!(result, Err(Error::OutOfScope { .. })));
    assert!(!tmp.path().join("hello").exists());
}

#[tokio::test]
async fn asset_cache_downloads_once() {
    let server = MockServer::start().await;
    let body = image_body();
    Mock::given(method("GET"))
        .and(path("/assets/avatar2.png"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body.clone(), "image/png"))
        .expect(1)
        .mount(&server)
        .await;

    let (_tmp, downloader) = downloader();
    let hash = Hash::hash_bytes(Algorithm::Md5, &body);
    let manifest_json = format!(
        r#"{{"base_url": "{}/assets", "assets": {{"avatar": {{"name": "avatar2", "type": "png", "hash": "{}", "width": 256, "height": 256}}}}}}"#,
        server.uri(),
        hash
    );
    let manifest = Manifest::from_json(&manifest_json, Algorithm::Md5).unwrap();
    let cache = AssetCache::new(downloader, manifest, "asset");

    let entry = cache.resolve("avatar").unwrap();
    assert_eq!(entry.name, "avatar2");
    assert_eq!(entry.kind, "png");
    assert_eq!(entry.hash, hash);
    assert!(entry.local_uri.is_none());

    let entry = cache.download("avatar").await.unwrap();
    let local_uri = entry.local_uri.clone().unwrap();
    assert!(local_uri.ends_with(&format!("asset-{}.png", hash)));

    let cache_name = cache.cache_file_name(&entry);
    let info = cache
        .store()
        .info(&cache_name, InfoOptions { cache: true, hash: true })
        .await
        .unwrap();
    assert!(info.exists);
    assert_eq!(info.uri, local_uri);
    assert_eq!(info.hash, Some(hash));

    // Second fetch is served from disk; the mock expects exactly one request.
    let again = cache.download("avatar").await.unwrap();
    assert_eq!(again.local_uri, Some(local_uri));
}

#[tokio::test]
async fn asset_cache_integrity_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("tampered"))
        .mount(&server)
        .await;

    let (_tmp, downloader) = downloader();
    let hash = Hash::hash_bytes(Algorithm::Md5, &image_body());
    let meta = AssetMetadata {
        id: "avatar".to_string(),
        name: "avatar2".to_string(),
        kind: "png".to_string(),
        hash,
        width: None,
        height: None,
        url: format!("{}/avatar2.png", server.uri()),
    };
    let cache = AssetCache::new(downloader, Manifest::from_assets([meta]), "asset");

    let result = cache.download("avatar").await;
    assert!(matches!(result, Err(Error::Integrity { .. })));

    let entry = cache.resolve("avatar").unwrap();
    assert!(!cache.cache_path(&entry).unwrap().exists());
}
