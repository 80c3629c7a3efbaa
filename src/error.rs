//! Error types for sitesync
//!
//! This module provides error handling for the library, including:
//! - Static configuration errors (raised while building the task tree,
//!   before any network activity)
//! - Per-branch runtime errors (kwargs, login, transfer)
//! - Context information (node, keyword, url, file path)

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for sitesync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for sitesync
///
/// This is the primary error type used throughout the library. Each variant includes
/// contextual information to help diagnose issues.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "base_path")
        key: Option<String>,
    },

    /// Malformed source-tree document (static, raised at tree-build time)
    #[error("invalid source tree: {0}")]
    InvalidTree(String),

    /// Unknown adapter module or function name (static, raised at tree-build time)
    #[error("unknown adapter: {0}")]
    UnknownAdapter(String),

    /// An adapter keyword argument was missing or unexpected at dispatch time
    #[error("bad keyword argument `{keyword}`: {message}")]
    Kwargs {
        /// The offending keyword name, recovered from the deserializer message
        keyword: String,
        /// Full deserializer message
        message: String,
    },

    /// Login against a remote system failed
    #[error("login failed: {0}")]
    Login(String),

    /// Network error (timeout, disconnect, DNS, TLS)
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// HTTP error status from the remote
    #[error("HTTP {status} for {url}")]
    Http {
        /// Response status code
        status: u16,
        /// The requested url
        url: String,
    },

    /// A descriptor's relative path would escape the sync root
    #[error("path escapes sync root: {path}")]
    PathEscape {
        /// The offending relative path
        path: PathBuf,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Fingerprint cache error
    #[error("cache error: {0}")]
    Cache(String),

    /// Side-task worker failed (spawn failure or non-zero exit)
    #[error("side task error: {0}")]
    SideTask(String),

    /// Shutdown in progress - not accepting new work
    #[error("shutdown in progress: not accepting new work")]
    ShuttingDown,

    /// Error raised by an adapter's producer
    #[error("producer error: {0}")]
    Producer(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Static errors abort the whole run before any network activity;
    /// everything else is reported per branch.
    pub fn is_static(&self) -> bool {
        matches!(
            self,
            Error::Config { .. } | Error::InvalidTree(_) | Error::UnknownAdapter(_)
        )
    }

    /// Short type tag used in branch-failure events ("what kind of error")
    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config",
            Error::InvalidTree(_) => "invalid tree",
            Error::UnknownAdapter(_) => "unknown adapter",
            Error::Kwargs { .. } => "keyword argument",
            Error::Login(_) => "login",
            Error::Network(_) => "network",
            Error::Http { .. } => "http",
            Error::PathEscape { .. } => "path escape",
            Error::Io(_) => "io",
            Error::Serialization(_) => "serialization",
            Error::Cache(_) => "cache",
            Error::SideTask(_) => "side task",
            Error::ShuttingDown => "shutting down",
            Error::Producer(_) => "producer",
            Error::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_errors_are_static() {
        assert!(Error::InvalidTree("both folder and module".into()).is_static());
        assert!(Error::UnknownAdapter("moodle2".into()).is_static());
        assert!(Error::Config {
            message: "empty".into(),
            key: Some("base_path".into()),
        }
        .is_static());
    }

    #[test]
    fn test_runtime_errors_are_not_static() {
        assert!(!Error::Login("bad credentials".into()).is_static());
        assert!(!Error::Http {
            status: 500,
            url: "https://example.com/a".into(),
        }
        .is_static());
        assert!(!Error::Producer("boom".into()).is_static());
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::Kwargs {
            keyword: "course_id".into(),
            message: "missing field `course_id`".into(),
        };
        assert!(err.to_string().contains("course_id"));

        let err = Error::PathEscape {
            path: PathBuf::from("/etc/passwd"),
        };
        assert!(err.to_string().contains("/etc/passwd"));
    }
}
