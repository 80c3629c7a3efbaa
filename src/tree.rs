//! Task tree built from the declarative source document
//!
//! The tree is an arena: nodes live in a flat `Vec` addressed by [`NodeId`],
//! parents hold child indices in insertion order, children hold a plain
//! back-index for path resolution. Node identity (`unique_key`) is a
//! deterministic function of sibling position and canonicalized construction
//! arguments, so per-node cached state survives process restarts as long as
//! the tree shape is unchanged.
//!
//! All structural validation happens here, at build time: unknown adapter
//! names, malformed entries and incomplete `custom` references abort the
//! whole run before any network activity.

use crate::error::{Error, Result};
use crate::registry::AdapterRegistry;
use crate::types::NodeId;
use crate::utils::sha256_hex;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Module name that selects an explicitly registered function pair
pub const CUSTOM_MODULE: &str = "custom";

/// Declarative description of one site (one remote source)
#[derive(Clone, Debug, Deserialize)]
pub struct SiteSpec {
    /// Adapter name, or `"custom"` to reference registered functions directly
    pub module: String,

    /// Producer function reference (required iff `module == "custom"`)
    #[serde(default)]
    pub function: Option<String>,

    /// Folder-name function reference (required iff `module == "custom"`)
    #[serde(default)]
    pub folder_function: Option<String>,

    /// Literal folder name; when absent the name is resolved at run time
    #[serde(default)]
    pub folder_name: Option<String>,

    /// When false, the site inherits its parent's path verbatim
    #[serde(default = "default_true")]
    pub use_folder: bool,

    /// Per-branch allowed extensions, merged with the global setting
    #[serde(default)]
    pub allowed_extensions: Option<Vec<String>>,

    /// Per-branch forbidden extensions, merged with the global setting
    #[serde(default)]
    pub forbidden_extensions: Option<Vec<String>>,

    /// Nested site children
    #[serde(default)]
    pub sites: Vec<SiteSpec>,

    /// Nested folder child
    #[serde(default)]
    pub folder: Option<FolderSpec>,

    /// Adapter-specific keyword arguments
    #[serde(flatten)]
    pub kwargs: serde_json::Map<String, Value>,
}

/// Declarative description of one folder grouping
#[derive(Clone, Debug, Deserialize)]
pub struct FolderSpec {
    /// Folder name, becomes a path segment
    pub name: String,

    /// Site children
    #[serde(default)]
    pub sites: Vec<SiteSpec>,

    /// Nested folder child
    #[serde(default)]
    pub folder: Option<Box<FolderSpec>>,
}

/// The whole declarative source-tree document
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SourceDocument {
    /// Top-level folder child
    #[serde(default)]
    pub folder: Option<FolderSpec>,

    /// Top-level site children
    #[serde(default)]
    pub sites: Vec<SiteSpec>,
}

fn default_true() -> bool {
    true
}

/// Per-branch extension filters captured from a site entry
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsumerFilters {
    /// Allowed extensions override (None = use global only)
    pub allowed_extensions: Option<Vec<String>>,
    /// Forbidden extensions override (None = use global only)
    pub forbidden_extensions: Option<Vec<String>>,
}

/// Closed set of node kinds
#[derive(Clone, Debug)]
pub enum NodeKind {
    /// The synthetic tree root
    Root,
    /// A folder grouping with a literal name
    Folder {
        /// Folder name (path segment)
        name: String,
    },
    /// A producer-carrying site
    Site {
        /// Adapter name resolved against the registry
        adapter: String,
        /// Literal folder name, if declared
        folder_name: Option<String>,
        /// False when the site inherits its parent's path verbatim
        use_folder: bool,
        /// Adapter keyword arguments
        kwargs: serde_json::Map<String, Value>,
        /// Per-branch extension filters
        filters: ConsumerFilters,
    },
}

/// Resolution state of a node's output path, relative to the sync root
///
/// Explicitly three-state; a node without a literal name stays `Unresolved`
/// until the runner derives the name (adapter call or folder-name cache).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathState {
    /// Not yet resolved
    Unresolved,
    /// Parent's path taken verbatim (`use_folder = false`)
    Inherited(PathBuf),
    /// Own path segment joined onto the parent's path
    Resolved(PathBuf),
}

impl PathState {
    /// The resolved path, if any
    pub fn path(&self) -> Option<&Path> {
        match self {
            PathState::Unresolved => None,
            PathState::Inherited(p) | PathState::Resolved(p) => Some(p),
        }
    }
}

/// One node in the arena
#[derive(Clone, Debug)]
pub struct Node {
    /// Arena index of this node
    pub id: NodeId,
    /// Parent index; None only for the root
    pub parent: Option<NodeId>,
    /// Children in insertion order (order is part of node identity)
    pub children: Vec<NodeId>,
    /// Positional identity, e.g. `"0:2:"`
    pub position: String,
    /// SHA-256 over position and canonicalized construction arguments
    pub unique_key: String,
    /// Node kind and payload
    pub kind: NodeKind,
}

impl Node {
    /// True only for Site nodes, which carry a producer reference
    pub fn is_producer(&self) -> bool {
        matches!(self.kind, NodeKind::Site { .. })
    }
}

/// The built task tree: immutable structure plus set-once path states
#[derive(Debug)]
pub struct TaskTree {
    nodes: Vec<Node>,
    paths: RwLock<Vec<PathState>>,
}

impl TaskTree {
    /// Build a tree from a declarative document, validating every entry
    /// against the adapter registry.
    ///
    /// # Errors
    ///
    /// Returns a static configuration error ([`Error::InvalidTree`] or
    /// [`Error::UnknownAdapter`]) for malformed entries or unknown names;
    /// nothing has touched the network at that point.
    pub fn build(document: &SourceDocument, registry: &AdapterRegistry) -> Result<Self> {
        let root = Node {
            id: NodeId::ROOT,
            parent: None,
            children: Vec::new(),
            position: String::new(),
            unique_key: sha256_hex(b""),
            kind: NodeKind::Root,
        };
        let mut builder = TreeBuilder {
            nodes: vec![root],
            paths: vec![PathState::Resolved(PathBuf::new())],
            registry,
        };

        if let Some(folder) = &document.folder {
            builder.add_folder(NodeId::ROOT, folder)?;
        }
        for site in &document.sites {
            builder.add_site(NodeId::ROOT, site)?;
        }

        Ok(Self {
            nodes: builder.nodes,
            paths: RwLock::new(builder.paths),
        })
    }

    /// Borrow a node by arena index
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.get()]
    }

    /// All nodes in arena order (root first)
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Number of nodes including the root
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when the tree holds only the root
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Current path state of a node
    pub fn path_state(&self, id: NodeId) -> PathState {
        self.paths
            .read()
            .unwrap_or_else(|e| e.into_inner())[id.get()]
        .clone()
    }

    /// The node's resolved path relative to the sync root, if resolved
    pub fn resolved_path(&self, id: NodeId) -> Option<PathBuf> {
        self.path_state(id).path().map(Path::to_path_buf)
    }

    /// Resolve a node's path exactly once.
    ///
    /// Returns true if this call performed the resolution; false if the path
    /// was already fixed (the existing value wins, per the set-once
    /// invariant).
    pub fn mark_resolved(&self, id: NodeId, state: PathState) -> bool {
        debug_assert!(!matches!(state, PathState::Unresolved));
        let mut paths = self.paths.write().unwrap_or_else(|e| e.into_inner());
        if paths[id.get()] != PathState::Unresolved {
            tracing::warn!(node = %id, "Attempted second path resolution, keeping first");
            return false;
        }
        paths[id.get()] = state;
        true
    }
}

struct TreeBuilder<'r> {
    nodes: Vec<Node>,
    paths: Vec<PathState>,
    registry: &'r AdapterRegistry,
}

impl TreeBuilder<'_> {
    fn push_node(
        &mut self,
        parent: NodeId,
        kind: NodeKind,
        canonical_args: &str,
        path: PathState,
    ) -> NodeId {
        let id = NodeId(self.nodes.len());
        let child_index = self.nodes[parent.get()].children.len();
        let position = format!("{}{}:", self.nodes[parent.get()].position, child_index);
        let unique_key = sha256_hex(format!("{}{}", position, canonical_args).as_bytes());
        self.nodes[parent.get()].children.push(id);
        self.nodes.push(Node {
            id,
            parent: Some(parent),
            children: Vec::new(),
            position,
            unique_key,
            kind,
        });
        self.paths.push(path);
        id
    }

    fn add_folder(&mut self, parent: NodeId, spec: &FolderSpec) -> Result<()> {
        if spec.name.is_empty() {
            return Err(Error::InvalidTree("folder entry with empty name".into()));
        }

        // A literal name resolves immediately when the parent is resolved
        let path = match self.paths[parent.get()].path() {
            Some(parent_path) => PathState::Resolved(parent_path.join(&spec.name)),
            None => PathState::Unresolved,
        };
        let canonical = canonicalize_kwargs(&single_kwarg("name", &spec.name));
        let id = self.push_node(
            parent,
            NodeKind::Folder {
                name: spec.name.clone(),
            },
            &canonical,
            path,
        );

        if let Some(folder) = &spec.folder {
            self.add_folder(id, folder)?;
        }
        for site in &spec.sites {
            self.add_site(id, site)?;
        }
        Ok(())
    }

    fn add_site(&mut self, parent: NodeId, spec: &SiteSpec) -> Result<()> {
        if spec.module.is_empty() {
            return Err(Error::InvalidTree("site entry with empty module".into()));
        }

        // Resolve the adapter name statically; custom references split into
        // module path and function name here, never at dispatch time
        let adapter = if spec.module == CUSTOM_MODULE {
            let (function, folder_function) = match (&spec.function, &spec.folder_function) {
                (Some(f), Some(ff)) => (f, ff),
                _ => {
                    return Err(Error::InvalidTree(format!(
                        "custom site needs both `function` and `folder_function` \
                         (position under node {})",
                        parent
                    )));
                }
            };
            let name = split_function_reference(function)?;
            let folder_fn_name = split_function_reference(folder_function)?;
            if folder_fn_name.0 != name.0 {
                return Err(Error::InvalidTree(format!(
                    "custom `function` and `folder_function` reference different modules: \
                     `{}` vs `{}`",
                    name.0, folder_fn_name.0
                )));
            }
            format!("{}.{}", name.0, name.1)
        } else {
            if spec.function.is_some() || spec.folder_function.is_some() {
                return Err(Error::InvalidTree(format!(
                    "`function`/`folder_function` are only valid with module \"custom\", \
                     found module `{}`",
                    spec.module
                )));
            }
            spec.module.clone()
        };

        if !self.registry.contains(&adapter) {
            return Err(Error::UnknownAdapter(adapter));
        }

        // use_folder=false inherits the parent's path verbatim; a literal
        // folder name joins onto it; neither leaves the path unresolved for
        // the runner to derive
        let parent_path = self.paths[parent.get()].path().map(Path::to_path_buf);
        let path = if !spec.use_folder {
            match parent_path {
                Some(p) => PathState::Inherited(p),
                None => PathState::Unresolved,
            }
        } else {
            match (&spec.folder_name, parent_path) {
                (Some(name), Some(p)) => PathState::Resolved(p.join(name)),
                _ => PathState::Unresolved,
            }
        };

        let canonical = canonicalize_kwargs(&construction_args(spec));
        let id = self.push_node(
            parent,
            NodeKind::Site {
                adapter,
                folder_name: spec.folder_name.clone(),
                use_folder: spec.use_folder,
                kwargs: spec.kwargs.clone(),
                filters: ConsumerFilters {
                    allowed_extensions: spec.allowed_extensions.clone(),
                    forbidden_extensions: spec.forbidden_extensions.clone(),
                },
            },
            &canonical,
            path,
        );

        if let Some(folder) = &spec.folder {
            self.add_folder(id, folder)?;
        }
        for site in &spec.sites {
            self.add_site(id, site)?;
        }
        Ok(())
    }
}

/// Split `"module.function"` into its module path and function name
fn split_function_reference(reference: &str) -> Result<(&str, &str)> {
    match reference.rsplit_once('.') {
        Some((module, function)) if !module.is_empty() && !function.is_empty() => {
            Ok((module, function))
        }
        _ => Err(Error::InvalidTree(format!(
            "cannot split `{}` into module and function",
            reference
        ))),
    }
}

/// Construction arguments that feed a site's unique key: the adapter name,
/// the literal folder name and the adapter kwargs. Layout-only switches
/// (use_folder, extension filters) are excluded so position-equivalent
/// configurations keep their identity when filters change.
fn construction_args(spec: &SiteSpec) -> serde_json::Map<String, Value> {
    let mut map = spec.kwargs.clone();
    map.insert("module".into(), Value::String(spec.module.clone()));
    if let Some(f) = &spec.function {
        map.insert("function".into(), Value::String(f.clone()));
    }
    if let Some(name) = &spec.folder_name {
        map.insert("folder_name".into(), Value::String(name.clone()));
    }
    map
}

fn single_kwarg(key: &str, value: &str) -> serde_json::Map<String, Value> {
    let mut map = serde_json::Map::new();
    map.insert(key.into(), Value::String(value.into()));
    map
}

/// Canonicalize keyword arguments for identity hashing: names sorted,
/// nested mappings recursed into, nulls dropped. Semantically identical
/// configurations yield the same string regardless of declaration order.
pub fn canonicalize_kwargs(kwargs: &serde_json::Map<String, Value>) -> String {
    let mut out = String::new();
    write_canonical_map(kwargs, &mut out);
    out
}

fn write_canonical_map(map: &serde_json::Map<String, Value>, out: &mut String) {
    let mut keys: Vec<&String> = map
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, _)| k)
        .collect();
    keys.sort();
    out.push('{');
    for key in keys {
        out.push_str(key);
        out.push('=');
        write_canonical_value(&map[key], out);
        out.push(';');
    }
    out.push('}');
}

fn write_canonical_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => write_canonical_map(map, out),
        Value::Array(items) => {
            out.push('[');
            for item in items {
                write_canonical_value(item, out);
                out.push(',');
            }
            out.push(']');
        }
        Value::String(s) => out.push_str(s),
        other => out.push_str(&other.to_string()),
    }
}
