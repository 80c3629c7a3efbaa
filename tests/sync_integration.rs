//! End-to-end sync runs against a local mock HTTP server
//!
//! These tests drive the whole pipeline through the public API: a
//! declarative source document, adapters that discover files from a remote
//! index, the conditional transfer path, and the event stream.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use sitesync::{
    parse_kwargs, AdapterRegistry, Config, DownloadDescriptor, Event, ProducerContext, Result,
    Session, SiteAdapter, SourceDocument, SyncEngine,
};

#[derive(Deserialize)]
struct IndexParams {
    index_url: String,
}

#[derive(Deserialize)]
struct IndexEntry {
    name: String,
    url: String,
}

/// Adapter that lists files from a remote JSON index, optionally behind a
/// shared login endpoint.
struct IndexAdapter {
    folder: String,
    login_url: Option<String>,
}

#[async_trait]
impl SiteAdapter for IndexAdapter {
    async fn produce(&self, ctx: ProducerContext<'_>) -> Result<()> {
        if let Some(login_url) = &self.login_url {
            let session = ctx.session;
            ctx.session
                .login_once("index", async {
                    session
                        .client()
                        .post(login_url)
                        .form(&[("user", "alice"), ("pass", "secret")])
                        .send()
                        .await?
                        .error_for_status()
                        .map_err(sitesync::Error::from)?;
                    Ok(())
                })
                .await?;
        }

        let params: IndexParams = parse_kwargs(ctx.kwargs)?;
        let entries: Vec<IndexEntry> = ctx
            .session
            .get(&params.index_url)
            .send()
            .await?
            .error_for_status()
            .map_err(sitesync::Error::from)?
            .json()
            .await?;
        for entry in entries {
            ctx.queue.put(DownloadDescriptor::new(
                ctx.base_path.join(&entry.name),
                entry.url,
                ctx.unique_key,
            ));
        }
        Ok(())
    }

    async fn folder_name(
        &self,
        _session: &Session,
        _kwargs: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<String> {
        Ok(self.folder.clone())
    }
}

async fn mount_file(server: &MockServer, url_path: &str, body: &[u8], etag: &str) {
    Mock::given(method("GET"))
        .and(path(url_path.to_string()))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(body.to_vec())
                .insert_header("ETag", etag),
        )
        .mount(server)
        .await;
}

async fn mount_index(server: &MockServer, url_path: &str, entries: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(url_path.to_string()))
        .respond_with(ResponseTemplate::new(200).set_body_json(entries))
        .mount(server)
        .await;
}

fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::default();
    config.sync.base_path = tmp.path().join("sync");
    config.sync.cache_dir = tmp.path().join("cache");
    config.concurrency.transfer_consumers = 4;
    config.tools.search_path = false;
    config
}

async fn engine_with(
    registry: AdapterRegistry,
    document: serde_json::Value,
    config: Config,
) -> SyncEngine {
    let document: SourceDocument = serde_json::from_value(document).unwrap();
    SyncEngine::new(config, registry, &document).await.unwrap()
}

#[tokio::test]
async fn test_full_tree_sync_with_filters() {
    let server = MockServer::start().await;
    mount_index(
        &server,
        "/algebra/index",
        serde_json::json!([
            { "name": "lecture1.pdf", "url": format!("{}/algebra/lecture1.pdf", server.uri()) },
            { "name": "solutions.zip", "url": format!("{}/algebra/solutions.zip", server.uri()) }
        ]),
    )
    .await;
    mount_index(
        &server,
        "/announcements/index",
        serde_json::json!([
            { "name": "week1.txt", "url": format!("{}/announcements/week1.txt", server.uri()) }
        ]),
    )
    .await;
    mount_file(&server, "/algebra/lecture1.pdf", b"lecture", "\"a1\"").await;
    mount_file(&server, "/announcements/week1.txt", b"welcome", "\"w1\"").await;

    let mut registry = AdapterRegistry::new();
    registry.register(
        "index",
        Arc::new(IndexAdapter {
            folder: "Algebra".into(),
            login_url: None,
        }),
    );

    let tmp = TempDir::new().unwrap();
    let engine = engine_with(
        registry,
        serde_json::json!({
            "folder": {
                "name": "Semester 1",
                "sites": [
                    {
                        "module": "index",
                        "index_url": format!("{}/algebra/index", server.uri()),
                        "forbidden_extensions": ["zip"]
                    },
                    {
                        "module": "index",
                        "folder_name": "Announcements",
                        "index_url": format!("{}/announcements/index", server.uri())
                    }
                ]
            }
        }),
        test_config(&tmp),
    )
    .await;

    let report = engine.run().await.unwrap();
    assert!(report.all_succeeded(), "outcomes: {:?}", report.outcomes);
    assert_eq!(
        report.files_added, 2,
        "the forbidden zip must not count as added"
    );

    let base = engine.get_config().base_path().clone();
    assert_eq!(
        tokio::fs::read(base.join("Semester 1/Algebra/lecture1.pdf"))
            .await
            .unwrap(),
        b"lecture"
    );
    assert_eq!(
        tokio::fs::read(base.join("Semester 1/Announcements/week1.txt"))
            .await
            .unwrap(),
        b"welcome"
    );
    assert!(
        !base.join("Semester 1/Algebra/solutions.zip").exists(),
        "forbidden extension must be filtered out"
    );
}

#[tokio::test]
async fn test_login_happens_once_across_sibling_sites() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    mount_index(
        &server,
        "/a/index",
        serde_json::json!([
            { "name": "a.txt", "url": format!("{}/files/a.txt", server.uri()) }
        ]),
    )
    .await;
    mount_index(
        &server,
        "/b/index",
        serde_json::json!([
            { "name": "b.txt", "url": format!("{}/files/b.txt", server.uri()) }
        ]),
    )
    .await;
    mount_file(&server, "/files/a.txt", b"a", "\"a\"").await;
    mount_file(&server, "/files/b.txt", b"b", "\"b\"").await;

    let mut registry = AdapterRegistry::new();
    registry.register(
        "index",
        Arc::new(IndexAdapter {
            folder: "unused".into(),
            login_url: Some(format!("{}/login", server.uri())),
        }),
    );

    let tmp = TempDir::new().unwrap();
    let engine = engine_with(
        registry,
        serde_json::json!({
            "sites": [
                { "module": "index", "folder_name": "A", "index_url": format!("{}/a/index", server.uri()) },
                { "module": "index", "folder_name": "B", "index_url": format!("{}/b/index", server.uri()) }
            ]
        }),
        test_config(&tmp),
    )
    .await;

    let report = engine.run().await.unwrap();
    assert!(report.all_succeeded(), "outcomes: {:?}", report.outcomes);
    assert_eq!(report.files_added, 2);
    // The expect(1) on the login mock verifies the single shared attempt
}

#[tokio::test]
async fn test_force_run_replaces_changed_file_and_keeps_old() {
    let server = MockServer::start().await;
    mount_index(
        &server,
        "/index",
        serde_json::json!([
            { "name": "notes.txt", "url": format!("{}/notes.txt", server.uri()) }
        ]),
    )
    .await;
    mount_file(&server, "/notes.txt", b"version one", "\"v1\"").await;

    let mut registry = AdapterRegistry::new();
    registry.register(
        "index",
        Arc::new(IndexAdapter {
            folder: "unused".into(),
            login_url: None,
        }),
    );
    let document = serde_json::json!({
        "sites": [
            { "module": "index", "folder_name": "Notes", "index_url": format!("{}/index", server.uri()) }
        ]
    });

    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.sync.force_download = true;
    config.sync.keep_replaced_files = true;
    let engine = engine_with(registry, document, config).await;

    let first = engine.run().await.unwrap();
    assert_eq!(first.files_added, 1);

    // Remote content changes; the stale ETag no longer matches
    server.reset().await;
    mount_index(
        &server,
        "/index",
        serde_json::json!([
            { "name": "notes.txt", "url": format!("{}/notes.txt", server.uri()) }
        ]),
    )
    .await;
    mount_file(&server, "/notes.txt", b"version two", "\"v2\"").await;

    let mut rx = engine.subscribe();
    let second = engine.run().await.unwrap();
    assert!(second.all_succeeded(), "outcomes: {:?}", second.outcomes);
    assert_eq!(second.files_replaced, 1);

    let base = engine.get_config().base_path().clone();
    assert_eq!(
        tokio::fs::read(base.join("Notes/notes.txt")).await.unwrap(),
        b"version two"
    );
    assert_eq!(
        tokio::fs::read(base.join("Notes/notes-old.txt")).await.unwrap(),
        b"version one",
        "previous version must be kept next to the replacement"
    );

    let mut saw_replaced = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, Event::FileReplaced { .. }) {
            saw_replaced = true;
        }
    }
    assert!(saw_replaced, "expected a FileReplaced event");
}

#[tokio::test]
async fn test_force_run_honors_not_modified() {
    let server = MockServer::start().await;
    mount_index(
        &server,
        "/index",
        serde_json::json!([
            { "name": "notes.txt", "url": format!("{}/notes.txt", server.uri()) }
        ]),
    )
    .await;
    // Conditional re-request with the stored tag answers 304
    Mock::given(method("GET"))
        .and(path("/notes.txt"))
        .and(header("If-None-Match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .mount(&server)
        .await;
    mount_file(&server, "/notes.txt", b"version one", "\"v1\"").await;

    let mut registry = AdapterRegistry::new();
    registry.register(
        "index",
        Arc::new(IndexAdapter {
            folder: "unused".into(),
            login_url: None,
        }),
    );
    let document = serde_json::json!({
        "sites": [
            { "module": "index", "folder_name": "Notes", "index_url": format!("{}/index", server.uri()) }
        ]
    });

    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.sync.force_download = true;
    let engine = engine_with(registry, document, config).await;

    let first = engine.run().await.unwrap();
    assert_eq!(first.files_added, 1);

    let second = engine.run().await.unwrap();
    assert!(second.all_succeeded(), "outcomes: {:?}", second.outcomes);
    assert_eq!(second.files_added, 0);
    assert_eq!(second.files_replaced, 0);

    let base = engine.get_config().base_path().clone();
    assert_eq!(
        tokio::fs::read(base.join("Notes/notes.txt")).await.unwrap(),
        b"version one"
    );
}

#[tokio::test]
async fn test_custom_module_references_registered_pair() {
    let server = MockServer::start().await;
    mount_index(
        &server,
        "/index",
        serde_json::json!([
            { "name": "scan.txt", "url": format!("{}/scan.txt", server.uri()) }
        ]),
    )
    .await;
    mount_file(&server, "/scan.txt", b"scan", "\"s1\"").await;

    // Custom sites reference an adapter registered under "module.function"
    let mut registry = AdapterRegistry::new();
    registry.register(
        "notes.fetch",
        Arc::new(IndexAdapter {
            folder: "Scans".into(),
            login_url: None,
        }),
    );

    let tmp = TempDir::new().unwrap();
    let engine = engine_with(
        registry,
        serde_json::json!({
            "sites": [{
                "module": "custom",
                "function": "notes.fetch",
                "folder_function": "notes.course_folder",
                "index_url": format!("{}/index", server.uri())
            }]
        }),
        test_config(&tmp),
    )
    .await;

    let report = engine.run().await.unwrap();
    assert!(report.all_succeeded(), "outcomes: {:?}", report.outcomes);

    let file = engine.get_config().base_path().join("Scans/scan.txt");
    assert_eq!(tokio::fs::read(&file).await.unwrap(), b"scan");
}
