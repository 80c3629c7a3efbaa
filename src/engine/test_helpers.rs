//! Shared fixtures for engine tests

use crate::config::Config;
use crate::error::{Error, Result};
use crate::registry::{AdapterRegistry, ProducerContext, SiteAdapter};
use crate::session::Session;
use crate::tree::SourceDocument;
use crate::types::DownloadDescriptor;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use super::SyncEngine;

/// Adapter that enqueues one descriptor per configured (file name, url)
/// pair and answers folder-name queries with a fixed string, counting how
/// often it is asked.
pub(crate) struct ListAdapter {
    pub(crate) files: Vec<(String, String)>,
    pub(crate) folder: String,
    pub(crate) folder_name_calls: AtomicU32,
}

impl ListAdapter {
    pub(crate) fn new(folder: &str, files: Vec<(String, String)>) -> Self {
        Self {
            files,
            folder: folder.to_string(),
            folder_name_calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl SiteAdapter for ListAdapter {
    async fn produce(&self, ctx: ProducerContext<'_>) -> Result<()> {
        for (name, url) in &self.files {
            ctx.queue.put(DownloadDescriptor::new(
                ctx.base_path.join(name),
                url.clone(),
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
        self.folder_name_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.folder.clone())
    }
}

/// Adapter whose produce always fails (folder_name keeps the refusing
/// default)
pub(crate) struct FailingAdapter;

#[async_trait]
impl SiteAdapter for FailingAdapter {
    async fn produce(&self, _ctx: ProducerContext<'_>) -> Result<()> {
        Err(Error::Producer("remote listing unavailable".into()))
    }
}

/// Build an engine over a fresh temp directory.
///
/// The returned `TempDir` must stay alive for the engine's lifetime; it
/// holds both the sync root and the cache directory.
pub(crate) async fn test_engine(
    registry: AdapterRegistry,
    document: serde_json::Value,
) -> (SyncEngine, TempDir) {
    test_engine_with(registry, document, |_| {}).await
}

/// Like [`test_engine`] but lets the test adjust the config first
pub(crate) async fn test_engine_with(
    registry: AdapterRegistry,
    document: serde_json::Value,
    tweak: impl FnOnce(&mut Config),
) -> (SyncEngine, TempDir) {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    let mut config = Config::default();
    config.sync.base_path = tmp.path().join("sync");
    config.sync.cache_dir = tmp.path().join("cache");
    config.concurrency.transfer_consumers = 4;
    config.tools.search_path = false;
    tweak(&mut config);
    let document: SourceDocument =
        serde_json::from_value(document).expect("document should deserialize");
    let engine = SyncEngine::new(config, registry, &document)
        .await
        .expect("engine should initialize");
    (engine, tmp)
}

/// Drain every event currently buffered on a subscription
pub(crate) fn drain_events(
    rx: &mut tokio::sync::broadcast::Receiver<crate::types::Event>,
) -> Vec<crate::types::Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
