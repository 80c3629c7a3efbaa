//! Concurrent tree walk and producer supervision.
//!
//! The runner walks the task tree, fanning out one task per branch. A
//! node whose base path is already resolved has its own dispatch run
//! concurrently with descent into its children; a node that still needs
//! path resolution is dispatched synchronously first, because children must
//! never start work against an undefined path.
//!
//! Every producer invocation is supervised: it is timed, its success emits
//! a finished event with elapsed time, and any failure is caught at the
//! node boundary and reported as a branch error without cancelling
//! siblings. Cancellation is the one exception and always propagates.

use crate::cache::NS_FOLDER_NAMES;
use crate::error::{Error, Result};
use crate::registry::ProducerContext;
use crate::tree::{NodeKind, PathState};
use crate::types::{Event, NodeId, NodeOutcome};
use futures::future::BoxFuture;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use super::SyncEngine;

/// Shared per-run outcome store, indexed by arena position
pub(super) type Outcomes = Arc<Mutex<Vec<NodeOutcome>>>;

impl SyncEngine {
    /// Visit one node: dispatch it and recurse into its children, each
    /// child as an independent concurrently-scheduled branch.
    pub(super) fn visit(
        &self,
        id: NodeId,
        recursive: bool,
        outcomes: Outcomes,
    ) -> BoxFuture<'static, ()> {
        let engine = self.clone();
        Box::pin(async move {
            if engine.cancel.is_cancelled() {
                return;
            }

            let mut branches = tokio::task::JoinSet::new();
            if engine.tree.resolved_path(id).is_some() {
                // Path known: the node's own dispatch and the descent into
                // children can run concurrently
                let dispatch_engine = engine.clone();
                let dispatch_outcomes = outcomes.clone();
                branches.spawn(async move {
                    dispatch_engine.dispatch(id, dispatch_outcomes).await;
                });
            } else {
                engine.dispatch(id, outcomes.clone()).await;
                if engine.tree.resolved_path(id).is_none() {
                    // Resolution failed; the subtree has no defined path
                    tracing::warn!(node = %id, "Base path unresolved, not descending");
                    return;
                }
            }

            if recursive {
                for child in engine.tree.node(id).children.clone() {
                    let child_engine = engine.clone();
                    let child_outcomes = outcomes.clone();
                    branches.spawn(async move {
                        child_engine.visit(child, true, child_outcomes).await;
                    });
                }
            }

            // Join every branch scheduled from this node. JoinSet isolates
            // panics per task, so one poisoned branch cannot take down the
            // walk.
            while let Some(joined) = branches.join_next().await {
                if let Err(e) = joined {
                    if !e.is_cancelled() {
                        tracing::error!(node = %id, error = %e, "Branch task panicked");
                    }
                }
            }
        })
    }

    /// Dispatch one node: resolve its path if needed, then run its
    /// producer under supervision. Folder and Root nodes only resolve.
    async fn dispatch(&self, id: NodeId, outcomes: Outcomes) {
        match &self.tree.node(id).kind {
            NodeKind::Root => {}
            NodeKind::Folder { name } => {
                if self.tree.resolved_path(id).is_none() {
                    let name = name.clone();
                    if let Some(parent_path) = self.parent_path(id) {
                        let path = parent_path.join(name);
                        if self.tree.mark_resolved(id, PathState::Resolved(path.clone())) {
                            self.emit_event(Event::BasePathUpdated { node: id, path });
                        }
                    }
                }
            }
            NodeKind::Site { .. } => {
                self.dispatch_site(id, outcomes).await;
            }
        }
    }

    /// Supervised producer dispatch for one site node
    async fn dispatch_site(&self, id: NodeId, outcomes: Outcomes) {
        self.emit_event(Event::NodeStarted { node: id });
        let started = Instant::now();

        let result = self.run_producer(id).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(()) => {
                tracing::debug!(node = %id, elapsed_ms, "Producer finished");
                self.emit_event(Event::NodeFinished {
                    node: id,
                    elapsed_ms,
                    message: None,
                });
                outcomes.lock().await[id.get()] = NodeOutcome::Success { elapsed_ms };
            }
            Err(Error::ShuttingDown) => {
                // Cancellation propagates untouched; no branch-failure event
                tracing::debug!(node = %id, "Producer cancelled");
            }
            Err(e) => {
                // Branch boundary: report and isolate, never crash the walk
                let message = match &e {
                    Error::Kwargs { keyword, .. } => format!(
                        "quit with error: unexpected or missing keyword argument `{}`",
                        keyword
                    ),
                    other => format!("quit with error ({}): {}", other.kind_name(), other),
                };
                tracing::error!(node = %id, error = %e, "Branch failed");
                self.emit_event(Event::NodeError {
                    node: id,
                    message: message.clone(),
                });
                outcomes.lock().await[id.get()] = NodeOutcome::Failed { message };
            }
        }
    }

    /// Resolve the site's base path (if still unresolved) and invoke its
    /// producer. Any error fails this branch only.
    async fn run_producer(&self, id: NodeId) -> Result<()> {
        let NodeKind::Site {
            adapter, kwargs, ..
        } = &self.tree.node(id).kind
        else {
            return Ok(());
        };

        let base_path = match self.tree.resolved_path(id) {
            Some(path) => path,
            None => self.resolve_site_path(id).await?,
        };

        let adapter_impl = self.registry.get(adapter).ok_or_else(|| {
            // Tree build validated this; a miss here means registry misuse
            Error::UnknownAdapter(adapter.clone())
        })?;

        let node = self.tree.node(id);
        let ctx = ProducerContext {
            session: &self.session,
            queue: &self.queue,
            base_path: &base_path,
            kwargs,
            unique_key: &node.unique_key,
        };

        tokio::select! {
            result = adapter_impl.produce(ctx) => result,
            _ = self.cancel.cancelled() => Err(Error::ShuttingDown),
        }
    }

    /// Derive an unresolved site path: inherit, join a literal name, or ask
    /// the folder-name cache / adapter function (at most one adapter call
    /// per node; the answer is cached under the node's unique key).
    async fn resolve_site_path(&self, id: NodeId) -> Result<PathBuf> {
        let node = self.tree.node(id);
        let NodeKind::Site {
            adapter,
            folder_name,
            use_folder,
            kwargs,
            ..
        } = &node.kind
        else {
            return Err(Error::Other(format!("node {} is not a site", id)));
        };

        let parent_path = self.parent_path(id).ok_or_else(|| {
            Error::Other(format!("parent path of node {} is unresolved", id))
        })?;

        let (state, path) = if !use_folder {
            (PathState::Inherited(parent_path.clone()), parent_path)
        } else {
            let name = match folder_name {
                Some(literal) => literal.clone(),
                None => {
                    let name = match self
                        .cache
                        .get_str(NS_FOLDER_NAMES, &node.unique_key)
                        .await?
                    {
                        Some(cached) => {
                            tracing::debug!(node = %id, name = %cached, "Folder name from cache");
                            cached
                        }
                        None => {
                            let adapter_impl = self
                                .registry
                                .get(adapter)
                                .ok_or_else(|| Error::UnknownAdapter(adapter.clone()))?;
                            let derived = tokio::select! {
                                result = adapter_impl.folder_name(&self.session, kwargs) => result?,
                                _ = self.cancel.cancelled() => return Err(Error::ShuttingDown),
                            };
                            self.cache
                                .set_str(NS_FOLDER_NAMES, &node.unique_key, &derived)
                                .await?;
                            derived
                        }
                    };
                    self.emit_event(Event::FolderNameUpdated {
                        node: id,
                        name: name.clone(),
                    });
                    name
                }
            };
            let path = parent_path.join(name);
            (PathState::Resolved(path.clone()), path)
        };

        if self.tree.mark_resolved(id, state) {
            self.emit_event(Event::BasePathUpdated {
                node: id,
                path: path.clone(),
            });
        }
        Ok(path)
    }

    fn parent_path(&self, id: NodeId) -> Option<PathBuf> {
        let parent = self.tree.node(id).parent?;
        self.tree.resolved_path(parent)
    }
}
