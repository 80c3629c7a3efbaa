//! Queue consumer pool feeding the transfer executor.
//!
//! A fixed number of consumer tasks pull descriptors off the unique queue
//! and hand them to the [`TransferExecutor`](crate::transfer::TransferExecutor).
//! Each dequeued descriptor is always acknowledged with `task_done`,
//! including on failure and during shutdown, so the producer-side join
//! barrier can never deadlock on a dropped item.

use crate::transfer::MergedFilters;
use crate::types::{DownloadDescriptor, Event, NodeId};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::SyncEngine;

impl SyncEngine {
    /// Spawn the consumer pool for one run.
    ///
    /// Returns the pool and a stop token; cancelling the token makes idle
    /// consumers exit once the queue is drained, leaving the queue itself
    /// open for subsequent runs.
    pub(super) fn start_consumers(&self) -> (JoinSet<()>, CancellationToken) {
        let stop = CancellationToken::new();
        let mut pool = JoinSet::new();
        let count = self.config.concurrency.transfer_consumers;
        for worker in 0..count {
            let engine = self.clone();
            let stop = stop.clone();
            pool.spawn(async move {
                engine.consume_loop(worker, stop).await;
            });
        }
        tracing::debug!(consumers = count, "Consumer pool started");
        (pool, stop)
    }

    /// One consumer: dequeue, transfer, acknowledge, repeat
    async fn consume_loop(&self, worker: usize, stop: CancellationToken) {
        loop {
            let descriptor = tokio::select! {
                item = self.queue.get() => match item {
                    Some(descriptor) => descriptor,
                    // Queue closed for good (engine shutdown)
                    None => break,
                },
                _ = stop.cancelled() => break,
            };

            if self.cancel.is_cancelled() {
                // Acknowledge without processing so join() still completes
                self.queue.task_done();
                continue;
            }

            self.consume_one(worker, descriptor).await;
            self.queue.task_done();
        }
        tracing::trace!(worker, "Consumer exiting");
    }

    async fn consume_one(&self, worker: usize, descriptor: DownloadDescriptor) {
        let (node, filters) = self.routing_for(&descriptor);
        let path = descriptor.path.clone();
        match self.executor.fetch(node, descriptor, &filters).await {
            Ok(outcome) => {
                tracing::debug!(worker, path = %path.display(), outcome = ?outcome, "Transfer done");
            }
            Err(e) => {
                tracing::error!(worker, path = %path.display(), error = %e, "Transfer failed");
                self.emit_event(Event::NodeError {
                    node,
                    message: format!(
                        "transfer of '{}' failed ({}): {}",
                        path.display(),
                        e.kind_name(),
                        e
                    ),
                });
            }
        }
    }

    /// Look up the owning node and merged filters for a descriptor.
    ///
    /// Descriptors enqueued outside any registered site (possible when an
    /// adapter is driven directly in tests) fall back to the root node with
    /// only the global filters applied.
    fn routing_for(&self, descriptor: &DownloadDescriptor) -> (NodeId, MergedFilters) {
        match self.filters.get(&descriptor.unique_key) {
            Some((node, filters)) => (*node, filters.clone()),
            None => (
                NodeId::ROOT,
                MergedFilters::merge(&self.config, &Default::default()),
            ),
        }
    }
}
