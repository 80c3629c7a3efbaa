//! Core types and events for sitesync

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Index of a node in the task-tree arena
///
/// Stable for the lifetime of one run. For state that must survive process
/// restarts (resolved folder names, file fingerprints), nodes are addressed
/// by their deterministic [`unique_key`](crate::tree::Node::unique_key)
/// instead.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct NodeId(pub usize);

impl NodeId {
    /// Arena index of the root node
    pub const ROOT: NodeId = NodeId(0);

    /// Get the inner index value
    pub fn get(&self) -> usize {
        self.0
    }
}

impl From<usize> for NodeId {
    fn from(index: usize) -> Self {
        Self(index)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One queued unit of download work, produced by adapters and consumed by
/// the transfer executor.
///
/// Immutable once enqueued, except for the in-place path renaming performed
/// by the [`UniqueQueue`](crate::queue::UniqueQueue) on dequeue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadDescriptor {
    /// Destination path relative to the owning node's base path.
    /// When `forced_extension` is false the extension is still unresolved
    /// and gets derived from the response at transfer time.
    pub path: PathBuf,

    /// Source url to fetch
    pub url: String,

    /// Extra request parameters the adapter needs sent along (query
    /// parameters, form fields); passed through to the fetch untouched
    pub session_kwargs: serde_json::Map<String, serde_json::Value>,

    /// Adapter-supplied content checksum, if the remote exposes one
    pub checksum: Option<String>,

    /// True when `path` already carries its final extension
    pub forced_extension: bool,

    /// Unique key of the node this descriptor belongs to
    pub unique_key: String,
}

impl DownloadDescriptor {
    /// Create a descriptor with a final path and no extras
    pub fn new(path: impl Into<PathBuf>, url: impl Into<String>, unique_key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            url: url.into(),
            session_kwargs: serde_json::Map::new(),
            checksum: None,
            forced_extension: true,
            unique_key: unique_key.into(),
        }
    }
}

/// Outcome of one node's branch after a run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum NodeOutcome {
    /// Producer finished without error
    Success {
        /// Wall-clock time the producer dispatch took, in milliseconds
        elapsed_ms: u64,
    },
    /// Producer quit with an error; siblings were unaffected
    Failed {
        /// Human-readable failure message
        message: String,
    },
    /// Node carries no producer (Root / Folder nodes)
    Skipped,
}

/// Summary of one completed run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunReport {
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// When the run finished (after queue join and cache flush)
    pub finished_at: DateTime<Utc>,
    /// Per-node outcome, keyed by arena index
    pub outcomes: Vec<(NodeId, NodeOutcome)>,
    /// Number of files newly created
    pub files_added: u64,
    /// Number of files that replaced an existing version
    pub files_replaced: u64,
    /// Total body bytes streamed to disk
    pub bytes_downloaded: u64,
}

impl RunReport {
    /// True when no branch reported a failure
    pub fn all_succeeded(&self) -> bool {
        !self
            .outcomes
            .iter()
            .any(|(_, outcome)| matches!(outcome, NodeOutcome::Failed { .. }))
    }

    /// Total run duration
    pub fn elapsed(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

/// Event emitted during a sync run
///
/// Consumers subscribe via [`SyncEngine::subscribe`](crate::SyncEngine::subscribe);
/// per-node events carry the node's arena index, file events are global.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A node's producer dispatch started
    NodeStarted {
        /// Node the event belongs to
        node: NodeId,
    },

    /// A node's producer dispatch finished successfully
    NodeFinished {
        /// Node the event belongs to
        node: NodeId,
        /// Elapsed dispatch time in milliseconds
        elapsed_ms: u64,
        /// Optional status message
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Non-fatal oddity on a branch (e.g. missing ETag from a cooperative domain)
    NodeWarning {
        /// Node the event belongs to
        node: NodeId,
        /// Warning text
        message: String,
    },

    /// A branch failed; siblings keep running
    NodeError {
        /// Node the event belongs to
        node: NodeId,
        /// Failure message, prefixed with the error kind
        message: String,
    },

    /// A node's folder name was resolved (adapter call or cache hit)
    FolderNameUpdated {
        /// Node the event belongs to
        node: NodeId,
        /// The resolved folder name
        name: String,
    },

    /// A node's base path was resolved
    BasePathUpdated {
        /// Node the event belongs to
        node: NodeId,
        /// The resolved path, relative to the sync root
        path: PathBuf,
    },

    /// A file that did not exist before was written
    NewFileAdded {
        /// Absolute destination path
        path: PathBuf,
    },

    /// An existing file was replaced with new content
    FileReplaced {
        /// Absolute destination path
        path: PathBuf,
        /// Where the previous version was kept, if keep_replaced_files is set
        #[serde(skip_serializing_if = "Option::is_none")]
        old_path: Option<PathBuf>,
        /// Diff annotation produced by the side-task pool, if any
        #[serde(skip_serializing_if = "Option::is_none")]
        diff_path: Option<PathBuf>,
    },

    /// Body bytes hit the disk
    BytesDownloaded {
        /// Byte count for this chunk of progress
        n: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_tags() {
        let event = Event::NewFileAdded {
            path: PathBuf::from("/sync/a.pdf"),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "new_file_added");
        assert_eq!(json["path"], "/sync/a.pdf");
    }

    #[test]
    fn test_file_replaced_omits_empty_options() {
        let event = Event::FileReplaced {
            path: PathBuf::from("/sync/a.pdf"),
            old_path: None,
            diff_path: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("old_path").is_none());
        assert!(json.get("diff_path").is_none());
    }

    #[test]
    fn test_run_report_all_succeeded() {
        let report = RunReport {
            started_at: Utc::now(),
            finished_at: Utc::now(),
            outcomes: vec![
                (NodeId(1), NodeOutcome::Success { elapsed_ms: 12 }),
                (NodeId(2), NodeOutcome::Skipped),
            ],
            files_added: 1,
            files_replaced: 0,
            bytes_downloaded: 100,
        };
        assert!(report.all_succeeded());

        let mut failed = report.clone();
        failed.outcomes.push((
            NodeId(3),
            NodeOutcome::Failed {
                message: "login failed".into(),
            },
        ));
        assert!(!failed.all_succeeded());
    }
}
