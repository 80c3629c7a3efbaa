//! Core sync engine split into focused submodules.
//!
//! The `SyncEngine` struct and its methods are organized by domain:
//! - [`runner`] - Concurrent tree walk and producer supervision
//! - [`consumers`] - Queue consumer pool feeding the transfer executor
//!
//! The engine is cloneable (all fields are Arc-wrapped) and event-driven:
//! consumers subscribe to a broadcast channel instead of polling.

mod consumers;
mod runner;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

use crate::cache::CacheService;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::queue::UniqueQueue;
use crate::registry::AdapterRegistry;
use crate::session::Session;
use crate::side_tasks::SideTaskPool;
use crate::transfer::{MergedFilters, TransferExecutor, TransferStats};
use crate::tree::{NodeKind, SourceDocument, TaskTree};
use crate::types::{Event, NodeId, NodeOutcome, RunReport};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Per-site consumer routing: node id and merged extension filters,
/// looked up by descriptor unique key
pub(crate) type FilterMap = HashMap<String, (NodeId, MergedFilters)>;

/// Main sync engine instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct SyncEngine {
    /// Configuration (wrapped in Arc for sharing across tasks)
    pub(crate) config: Arc<Config>,
    /// Adapter registry the tree was validated against
    pub(crate) registry: Arc<AdapterRegistry>,
    /// The built task tree
    pub(crate) tree: Arc<TaskTree>,
    /// Fingerprint cache service
    pub(crate) cache: Arc<CacheService>,
    /// Shared HTTP session with login coordination
    pub(crate) session: Session,
    /// Unique work queue between producers and the consumer pool
    pub(crate) queue: Arc<UniqueQueue>,
    /// Bounded external-process pool for post-processing
    pub(crate) side_tasks: Arc<SideTaskPool>,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: broadcast::Sender<Event>,
    /// Global cooperative cancellation token
    pub(crate) cancel: CancellationToken,
    /// Transfer executor shared by the consumer pool
    pub(crate) executor: Arc<TransferExecutor>,
    /// unique_key -> (node, merged filters) for descriptor routing
    pub(crate) filters: Arc<FilterMap>,
}

impl SyncEngine {
    /// Create a new engine for one source document.
    ///
    /// This builds and validates the task tree (static configuration errors
    /// abort here, before any network activity), opens the fingerprint
    /// cache, and wires up the session, queue, side-task pool and event
    /// channel.
    pub async fn new(
        config: Config,
        registry: AdapterRegistry,
        document: &SourceDocument,
    ) -> Result<Self> {
        let tree = TaskTree::build(document, &registry)?;

        tokio::fs::create_dir_all(config.base_path())
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create sync directory '{}': {}",
                        config.base_path().display(),
                        e
                    ),
                ))
            })?;
        let cache = Arc::new(CacheService::open(config.cache_dir().clone()).await?);

        let session = Session::new(config.concurrency.request_timeout)?;
        let (event_tx, _rx) = broadcast::channel(config.concurrency.event_capacity);
        let side_tasks = Arc::new(SideTaskPool::new(config.concurrency.side_task_workers));

        // Merge each site's filters once; consumers only look them up
        let mut filters: FilterMap = HashMap::new();
        for node in tree.nodes() {
            if let NodeKind::Site {
                filters: branch, ..
            } = &node.kind
            {
                filters.insert(
                    node.unique_key.clone(),
                    (node.id, MergedFilters::merge(&config, branch)),
                );
            }
        }

        let config = Arc::new(config);
        let executor = Arc::new(TransferExecutor {
            config: config.clone(),
            cache: cache.clone(),
            session: session.clone(),
            side_tasks: side_tasks.clone(),
            event_tx: event_tx.clone(),
            stats: TransferStats::default(),
        });

        tracing::info!(
            nodes = tree.len(),
            producers = filters.len(),
            base_path = %config.base_path().display(),
            "Sync engine initialized"
        );

        Ok(Self {
            config,
            registry: Arc::new(registry),
            tree: Arc::new(tree),
            cache,
            session,
            queue: Arc::new(UniqueQueue::new()),
            side_tasks,
            event_tx,
            cancel: CancellationToken::new(),
            executor,
            filters: Arc::new(filters),
        })
    }

    /// Subscribe to sync events
    ///
    /// Multiple subscribers are supported. Each subscriber receives all
    /// events independently; a subscriber that falls behind the channel
    /// capacity receives a `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Get the current configuration
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// The built task tree, for inspection by embedders
    pub fn tree(&self) -> &TaskTree {
        &self.tree
    }

    /// Emit an event to all subscribers.
    ///
    /// If nobody is listening the event is silently dropped; a run never
    /// depends on having subscribers.
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    /// Run a full sync: walk the whole tree recursively.
    ///
    /// Equivalent to [`run_from`](Self::run_from) starting at the root.
    pub async fn run(&self) -> Result<RunReport> {
        self.run_from(NodeId::ROOT, true).await
    }

    /// Run a sync starting at `start`, optionally recursing into its
    /// subtree.
    ///
    /// Starts the consumer pool, walks the tree fanning out one task per
    /// branch, waits for every enqueued descriptor to be handled, and
    /// flushes the fingerprint cache. Branch failures are isolated: they
    /// appear in the report and as [`Event::NodeError`] events, but never
    /// cancel sibling branches.
    pub async fn run_from(&self, start: NodeId, recursive: bool) -> Result<RunReport> {
        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }
        let started_at = chrono::Utc::now();
        tracing::info!(start = %start, recursive, "Sync run starting");

        // Collision markers are scoped to one run
        self.queue.reset_markers();
        let (mut consumer_pool, consumer_stop) = self.start_consumers();

        let outcomes = Arc::new(tokio::sync::Mutex::new(vec![
            NodeOutcome::Skipped;
            self.tree.len()
        ]));
        self.visit(start, recursive, outcomes.clone()).await;

        // Producers are done; wait for the consumers to drain the queue,
        // then stop the pool. The queue stays open for later runs.
        self.queue.join().await;
        consumer_stop.cancel();
        while consumer_pool.join_next().await.is_some() {}

        self.cache.flush().await?;

        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let outcomes = outcomes.lock().await;
        let report = RunReport {
            started_at,
            finished_at: chrono::Utc::now(),
            outcomes: outcomes
                .iter()
                .cloned()
                .enumerate()
                .map(|(index, outcome)| (NodeId(index), outcome))
                .collect(),
            files_added: self.executor.stats.files_added.load(Ordering::Relaxed),
            files_replaced: self.executor.stats.files_replaced.load(Ordering::Relaxed),
            bytes_downloaded: self
                .executor
                .stats
                .bytes_downloaded
                .load(Ordering::Relaxed),
        };
        tracing::info!(
            files_added = report.files_added,
            files_replaced = report.files_replaced,
            bytes = report.bytes_downloaded,
            all_succeeded = report.all_succeeded(),
            "Sync run finished"
        );
        Ok(report)
    }

    /// Cancel the run and release every resource.
    ///
    /// The cancellation token reaches every producer, every consumer and
    /// the side-task pool; consumers acknowledge descriptors they already
    /// hold without processing them. The fingerprint cache is flushed and
    /// closed. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Ok(());
        }
        tracing::info!("Shutting down sync engine");
        self.cancel.cancel();
        self.queue.close();
        self.side_tasks.shutdown();
        self.cache.close().await
    }
}
