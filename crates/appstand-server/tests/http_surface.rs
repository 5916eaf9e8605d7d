//! Exercises the HTTP surface end to end: app registration and version
//! publication behind editor tokens, document reads, channel-latest
//! resolution, attachments with etags, and the editor directory.

use std::sync::Arc;

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use appstand_core::auth::{generate_token, Editor};
use appstand_core::cache::MemoryCache;
use appstand_core::store::{MemoryDocumentStore, MemoryObjectStore};
use appstand_core::{Registry, SpaceRegistry};
use appstand_server::routes;

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

fn notes_tarball() -> Vec<u8> {
    let manifest =
        br#"{"editor":"acme","slug":"notes","version":"1.0.0","icon":"icon.svg","name":"Notes"}"#;
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, data) in [
        ("notes/manifest.webapp", manifest.as_slice()),
        ("notes/icon.svg", b"<svg/>".as_slice()),
    ] {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

async fn serve(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

struct Fixture {
    api: String,
    archive_url: String,
    sha256: String,
    token: String,
}

/// Boots the API over memory stores, registers the `acme` editor, and
/// hosts the fixture archive on a second loopback server.
async fn fixture() -> Fixture {
    let docs = Arc::new(MemoryDocumentStore::new());
    let blobs = Arc::new(MemoryObjectStore::new());
    let cache = Arc::new(MemoryCache::new());

    let mut spaces = SpaceRegistry::new("registry");
    spaces.declare_space("main").unwrap();
    spaces.bootstrap(docs.as_ref(), blobs.as_ref()).await.unwrap();

    let registry = Arc::new(Registry::new(docs, blobs, cache, spaces));
    let editor = Editor::generate("acme").unwrap();
    registry.vault().create(&editor).await.unwrap();
    let token = generate_token(&editor, "*", 3600).unwrap();

    let archive = notes_tarball();
    let sha256 = sha256_hex(&archive);
    let fixture_host = serve(axum::Router::new().route(
        "/notes.tar.gz",
        axum::routing::get(move || {
            let archive = archive.clone();
            async move {
                (
                    [(axum::http::header::CONTENT_TYPE, "application/gzip")],
                    archive,
                )
            }
        }),
    ))
    .await;

    Fixture {
        api: serve(routes::router(registry)).await,
        archive_url: format!("{fixture_host}/notes.tar.gz"),
        sha256,
        token,
    }
}

#[tokio::test]
async fn publish_and_read_through_http() {
    let Fixture {
        api,
        archive_url,
        sha256,
        token,
    } = fixture().await;
    let client = reqwest::Client::new();

    // Create the app.
    let response = client
        .post(format!("{api}/main/registry"))
        .header("Authorization", format!("Token {token}"))
        .json(&json!({"slug": "notes", "editor": "acme", "type": "webapp"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    // Publish a version, leading `v` included.
    let response = client
        .post(format!("{api}/main/registry/notes"))
        .header("Authorization", format!("Token {token}"))
        .json(&json!({"version": "v1.0.0", "url": archive_url, "sha256": sha256}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let version: Value = response.json().await.unwrap();
    assert_eq!(version["version"], json!("1.0.0"));
    assert_eq!(version["type"], json!("webapp"));
    assert_eq!(version["tar_prefix"], json!("notes"));
    assert_eq!(version["sha256"], json!(sha256));

    // Document reads.
    let app: Value = client
        .get(format!("{api}/main/registry/notes"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(app["slug"], json!("notes"));
    assert_eq!(app["versions"]["stable"], json!(["1.0.0"]));

    let latest: Value = client
        .get(format!("{api}/main/registry/notes/stable/latest"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(latest["version"], json!("1.0.0"));

    // The versioned read accepts the `v` prefix and is cacheable.
    let response = client
        .get(format!("{api}/main/registry/notes/v1.0.0"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let cache_control = response
        .headers()
        .get("cache-control")
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();
    assert!(cache_control.contains("max-age"), "{cache_control}");

    // Attachment with etag round-trip.
    let response = client
        .get(format!("{api}/main/registry/notes/1.0.0/icon"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "image/svg+xml"
    );
    let etag = response
        .headers()
        .get("etag")
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();
    let body = response.bytes().await.unwrap();
    assert_eq!(&body[..], b"<svg/>");

    let response = client
        .get(format!("{api}/main/registry/notes/1.0.0/icon"))
        .header("If-None-Match", etag)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 304);

    // App-level icon falls back across channels.
    let response = client
        .get(format!("{api}/main/registry/notes/icon"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // Listing with pagination metadata.
    let page: Value = client
        .get(format!("{api}/main/registry?limit=1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["meta"]["count"], json!(1));
    assert!(page["meta"].get("next_cursor").is_none());
    assert_eq!(page["data"][0]["slug"], json!("notes"));
}

#[tokio::test]
async fn head_requests_return_headers_without_a_body() {
    let Fixture {
        api,
        archive_url,
        sha256,
        token,
    } = fixture().await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{api}/main/registry"))
        .header("Authorization", format!("Token {token}"))
        .json(&json!({"slug": "notes", "editor": "acme", "type": "webapp"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);
    let response = client
        .post(format!("{api}/main/registry/notes"))
        .header("Authorization", format!("Token {token}"))
        .json(&json!({"version": "1.0.0", "url": archive_url, "sha256": sha256}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    // A document HEAD carries the headers of the GET, including the
    // length of the body it does not send.
    let body_len = client
        .get(format!("{api}/main/registry/notes/1.0.0"))
        .send()
        .await
        .unwrap()
        .bytes()
        .await
        .unwrap()
        .len();

    let response = client
        .head(format!("{api}/main/registry/notes/1.0.0"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/json"
    );
    assert_eq!(
        response
            .headers()
            .get("content-length")
            .unwrap()
            .to_str()
            .unwrap(),
        body_len.to_string()
    );
    assert!(response.bytes().await.unwrap().is_empty());

    // Same for attachments: type and length of the stored bytes, no body.
    let response = client
        .head(format!("{api}/main/registry/notes/1.0.0/icon"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "image/svg+xml"
    );
    assert_eq!(response.headers().get("content-length").unwrap(), "6");
    assert!(response.headers().get("etag").is_some());
    assert!(response.bytes().await.unwrap().is_empty());

    // The app document answers HEAD as well.
    let response = client
        .head(format!("{api}/main/registry/notes"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "application/json"
    );
    assert!(response.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn authorization_failures() {
    let Fixture { api, token, .. } = fixture().await;
    let client = reqwest::Client::new();

    // No token at all.
    let response = client
        .post(format!("{api}/main/registry"))
        .json(&json!({"slug": "chat", "editor": "acme", "type": "webapp"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Wrong scheme.
    let response = client
        .post(format!("{api}/main/registry"))
        .header("Authorization", format!("Bearer {token}"))
        .json(&json!({"slug": "chat", "editor": "acme", "type": "webapp"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // Unknown editor.
    let response = client
        .post(format!("{api}/main/registry"))
        .header("Authorization", format!("Token {token}"))
        .json(&json!({"slug": "chat", "editor": "nobody", "type": "webapp"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn lookup_misses_and_bad_channels() {
    let Fixture { api, .. } = fixture().await;
    let client = reqwest::Client::new();

    // Unknown channel is a 400.
    let response = client
        .get(format!("{api}/main/registry/notes/nightly/latest"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    // Unknown space is a 404 with a short cache-control.
    let response = client
        .get(format!("{api}/nowhere/registry"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    assert_eq!(
        response.headers().get("cache-control").unwrap(),
        "max-age=60"
    );

    // Missing app is a 404 as well.
    let response = client
        .get(format!("{api}/main/registry/ghost"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    // Editor directory misses.
    let response = client.get(format!("{api}/editors/ghost")).send().await.unwrap();
    assert_eq!(response.status(), 404);

    // Directory hides secrets.
    let editors: Value = client
        .get(format!("{api}/editors"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(editors, json!([{"name": "acme"}]));
}
