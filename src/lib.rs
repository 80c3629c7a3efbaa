//! # sitesync
//!
//! Backend library for keeping a local folder tree in sync with the
//! documents scattered across remote course and department sites.
//!
//! ## Design Philosophy
//!
//! sitesync is designed to be:
//! - **Declarative** - One document describes the whole source tree
//! - **Concurrent** - Every branch and every transfer runs in parallel
//! - **Fault-isolating** - One broken site never stops its siblings
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding
//! - **Event-driven** - Consumers subscribe to events, no polling required
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use sitesync::{AdapterRegistry, Config, SourceDocument, SyncEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!
//!     let mut registry = AdapterRegistry::new();
//!     // registry.register("moodle", Arc::new(MoodleAdapter::new(...)));
//!
//!     let document: SourceDocument = serde_json::from_str(
//!         r#"{ "folder": { "name": "Semester 1", "sites": [] } }"#,
//!     )?;
//!
//!     let engine = SyncEngine::new(config, registry, &document).await?;
//!
//!     // Subscribe to events
//!     let mut events = engine.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let report = engine.run().await?;
//!     println!("Added {} files", report.files_added);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Persistent fingerprint cache
pub mod cache;
/// Configuration types
pub mod config;
/// Core sync engine (decomposed into focused submodules)
pub mod engine;
/// Error types
pub mod error;
/// Unique work queue between producers and consumers
pub mod queue;
/// Adapter registry and producer contract
pub mod registry;
/// Retry logic for transient transfer failures
pub mod retry;
/// Shared HTTP session with login coordination
pub mod session;
/// Bounded external-process pool for post-processing
pub mod side_tasks;
/// Conditional download pipeline
pub mod transfer;
/// Task tree built from the declarative source document
pub mod tree;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use cache::{CacheService, FileMeta};
pub use config::{Config, ConcurrencyConfig, RetryConfig, SyncConfig, ToolsConfig};
pub use engine::SyncEngine;
pub use error::{Error, Result};
pub use queue::UniqueQueue;
pub use registry::{parse_kwargs, AdapterRegistry, ProducerContext, SiteAdapter};
pub use session::Session;
pub use transfer::TransferOutcome;
pub use tree::{FolderSpec, SiteSpec, SourceDocument, TaskTree};
pub use types::{DownloadDescriptor, Event, NodeId, NodeOutcome, RunReport};

/// Helper function to run one full sync with graceful signal handling.
///
/// Races the sync run against a termination signal; on signal the engine's
/// `shutdown()` is called and the partial run is abandoned.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use sitesync::{AdapterRegistry, Config, SourceDocument, SyncEngine, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::default();
///     let document = SourceDocument::default();
///     let engine = SyncEngine::new(config, AdapterRegistry::new(), &document).await?;
///
///     // Run with automatic signal handling
///     if let Some(report) = run_with_shutdown(engine).await? {
///         println!("Added {} files", report.files_added);
///     }
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(engine: SyncEngine) -> Result<Option<RunReport>> {
    tokio::select! {
        report = engine.run() => report.map(Some),
        _ = wait_for_signal() => {
            engine.shutdown().await?;
            Ok(None)
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
