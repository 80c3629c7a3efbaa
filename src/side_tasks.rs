//! Bounded side-task pool for CPU-heavy post-processing
//!
//! Occasional work like diffing two versions of a replaced PDF runs in
//! external worker processes, outside the cooperative scheduler. The pool
//! holds a fixed number of worker slots; [`apply`](SideTaskPool::apply)
//! blocks the calling task until a slot is free, spawns the process, and
//! resolves when it exits. Cancellation while a call is outstanding kills
//! the child immediately (`kill_on_drop`) instead of waiting for it, and the
//! freed slot is reusable right away.

use crate::error::{Error, Result};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Fixed-size pool of external worker processes
#[derive(Debug)]
pub struct SideTaskPool {
    slots: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl SideTaskPool {
    /// Create a pool with `workers` concurrent slots
    pub fn new(workers: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(workers.max(1))),
            shutdown: CancellationToken::new(),
        }
    }

    /// Run an external command in a worker slot.
    ///
    /// Waits for a free slot, spawns the process, and returns once it has
    /// exited. A non-zero exit status is an [`Error::SideTask`]. If the pool
    /// shuts down while the call is queued or running, the child is killed
    /// and [`Error::ShuttingDown`] is returned.
    pub async fn apply<I, S>(&self, program: &Path, args: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let permit = tokio::select! {
            permit = self.slots.acquire() => {
                permit.map_err(|_| Error::ShuttingDown)?
            }
            _ = self.shutdown.cancelled() => return Err(Error::ShuttingDown),
        };

        let mut child = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::SideTask(format!("failed to spawn {}: {}", program.display(), e))
            })?;

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = self.shutdown.cancelled() => {
                // Terminate immediately rather than waiting the worker out
                child.kill().await.ok();
                drop(permit);
                return Err(Error::ShuttingDown);
            }
        };
        drop(permit);

        if status.success() {
            Ok(())
        } else {
            Err(Error::SideTask(format!(
                "{} exited with {}",
                program.display(),
                status
            )))
        }
    }

    /// Kill every worker, free or busy. Idempotent.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::debug!("Shutting down side-task pool");
            self.shutdown.cancel();
        }
        self.slots.close();
    }
}

/// Locate the PDF diff tool: explicit config path first, PATH search second
///
/// Returns None when no tool is available; replaced PDFs are then kept
/// without a diff annotation.
pub fn find_pdf_diff_tool(explicit: Option<&PathBuf>, search_path: bool) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.clone());
    }
    if search_path {
        return which::which("diff-pdf-visually")
            .or_else(|_| which::which("diff-pdf"))
            .ok();
    }
    None
}
