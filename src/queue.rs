//! Unique work queue for download descriptors
//!
//! A FIFO of [`DownloadDescriptor`]s with deterministic collision renaming:
//! the queue tracks how often each output path has been dequeued and rewrites
//! the n-th occurrence by inserting `"(n)"` before the extension (appended
//! when the extension is still deferred). Two descriptors that would collide
//! on disk therefore never overwrite one another, producers never block or
//! coordinate, and arrival order is preserved.
//!
//! Consumers acknowledge each descriptor with [`task_done`](UniqueQueue::task_done)
//! (also for descriptors they drop at cancellation time) so the
//! [`join`](UniqueQueue::join) barrier stays correct.

use crate::types::DownloadDescriptor;
use crate::utils::numbered_path;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::sync::{watch, Semaphore};

#[derive(Debug, Default)]
struct Inner {
    items: VecDeque<DownloadDescriptor>,
    seen: HashMap<PathBuf, u32>,
}

/// Queue of download descriptors with collision renaming and a join barrier
#[derive(Debug)]
pub struct UniqueQueue {
    inner: Mutex<Inner>,
    available: Semaphore,
    unfinished_tx: watch::Sender<usize>,
}

impl Default for UniqueQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl UniqueQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        let (unfinished_tx, _) = watch::channel(0);
        Self {
            inner: Mutex::new(Inner::default()),
            available: Semaphore::new(0),
            unfinished_tx,
        }
    }

    /// Enqueue a descriptor; never blocks.
    ///
    /// Returns false if the queue is already closed (shutdown in progress);
    /// the descriptor is dropped in that case.
    pub fn put(&self, descriptor: DownloadDescriptor) -> bool {
        if self.available.is_closed() {
            tracing::debug!(url = %descriptor.url, "Queue closed, dropping descriptor");
            return false;
        }
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .items
            .push_back(descriptor);
        self.unfinished_tx.send_modify(|n| *n += 1);
        self.available.add_permits(1);
        true
    }

    /// Dequeue the next descriptor, waiting if the queue is empty.
    ///
    /// Collision renaming happens here: the first occurrence of a path
    /// passes through unchanged, the n-th is rewritten with a `"(n)"`
    /// marker. Once the queue has been closed the items enqueued before the
    /// close still drain, one per call; after that every call returns None.
    pub async fn get(&self) -> Option<DownloadDescriptor> {
        match self.available.acquire().await {
            Ok(permit) => permit.forget(),
            // Closed. Items already in the deque must still come out so
            // their task_done acknowledgements keep the join barrier
            // correct; pop_front below returns None once they are gone.
            Err(_) => {}
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut descriptor = inner.items.pop_front()?;

        let count = inner.seen.entry(descriptor.path.clone()).or_insert(0);
        if *count > 0 {
            let renamed = numbered_path(&descriptor.path, *count, !descriptor.forced_extension);
            tracing::debug!(
                original = %descriptor.path.display(),
                renamed = %renamed.display(),
                "Resolved output path collision"
            );
            *count += 1;
            descriptor.path = renamed;
        } else {
            *count += 1;
        }
        Some(descriptor)
    }

    /// Acknowledge one dequeued descriptor as handled (success, failure, or
    /// dropped during cancellation)
    pub fn task_done(&self) {
        self.unfinished_tx.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Wait until every enqueued descriptor has been acknowledged
    pub async fn join(&self) {
        let mut rx = self.unfinished_tx.subscribe();
        // wait_for checks the current value first, so no wakeup can be missed
        let _ = rx.wait_for(|unfinished| *unfinished == 0).await;
    }

    /// Forget all collision markers.
    ///
    /// Markers are per-run state: the same path re-enqueued in a later run
    /// must pass through unchanged, not pick up a `"(n)"` suffix from the
    /// previous run.
    pub fn reset_markers(&self) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .seen
            .clear();
    }

    /// Close the queue: `put` starts rejecting descriptors, and `get`
    /// returns None once the already-enqueued items have drained.
    /// Every dequeued descriptor still needs its `task_done`.
    pub fn close(&self) {
        self.available.close();
    }

    /// Number of descriptors currently waiting in the queue
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).items.len()
    }

    /// True when no descriptors are waiting
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
