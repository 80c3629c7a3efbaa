//! Adapter registry and producer contract
//!
//! Remote-system adapters implement [`SiteAdapter`] and register under a
//! name at startup. The source-tree document references adapters by that
//! name; unknown names are a tree-build error, not a late dispatch failure.
//!
//! Adapter keyword arguments travel as JSON maps and are deserialized into
//! the adapter's own parameter struct via [`parse_kwargs`], which recovers
//! the offending keyword name from the deserializer message so branch
//! failures can say *which* argument was wrong.

use crate::error::{Error, Result};
use crate::queue::UniqueQueue;
use crate::session::Session;
use async_trait::async_trait;
use regex::Regex;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, OnceLock};

/// Everything a producer invocation gets handed
pub struct ProducerContext<'a> {
    /// Shared HTTP session with login coordination
    pub session: &'a Session,
    /// Queue the producer enqueues download descriptors into
    pub queue: &'a UniqueQueue,
    /// The node's resolved output path, relative to the sync root
    pub base_path: &'a Path,
    /// Adapter keyword arguments from the source document
    pub kwargs: &'a serde_json::Map<String, serde_json::Value>,
    /// Unique key of the node being dispatched; descriptors must carry it
    pub unique_key: &'a str,
}

/// Contract implemented by every remote-system adapter
///
/// `produce` discovers remote files and enqueues descriptors; it may return
/// an error to fail its branch without affecting siblings. `folder_name` is
/// invoked at most once per node and its answer is cached under the node's
/// unique key, so later runs reuse it instead of re-deriving.
#[async_trait]
pub trait SiteAdapter: Send + Sync {
    /// Discover remote files and enqueue download descriptors
    async fn produce(&self, ctx: ProducerContext<'_>) -> Result<()>;

    /// Derive the node's folder name from the remote system
    ///
    /// The default refuses; adapters whose sites always declare a literal
    /// `folder_name` never need it.
    async fn folder_name(
        &self,
        _session: &Session,
        _kwargs: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<String> {
        Err(Error::Producer(
            "adapter has no folder-name function".into(),
        ))
    }
}

/// Explicit mapping from adapter names to implementations
///
/// Populated at startup; the task tree validates every site entry against it
/// before any network activity.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn SiteAdapter>>,
}

impl AdapterRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter under `name`.
    ///
    /// Custom function pairs register under their `"module.function"`
    /// reference string. Re-registering a name replaces the previous entry.
    pub fn register(&mut self, name: impl Into<String>, adapter: Arc<dyn SiteAdapter>) {
        let name = name.into();
        if self.adapters.insert(name.clone(), adapter).is_some() {
            tracing::warn!(adapter = %name, "Adapter re-registered, replacing previous entry");
        }
    }

    /// True if `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Look up an adapter by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn SiteAdapter>> {
        self.adapters.get(name).cloned()
    }

    /// Registered adapter names, for diagnostics
    pub fn names(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("adapters", &self.names())
            .finish()
    }
}

/// Deserialize adapter kwargs into the adapter's parameter struct.
///
/// A shape mismatch (unknown or missing keyword) becomes [`Error::Kwargs`]
/// carrying the offending keyword name, recovered by pattern-matching the
/// deserializer message.
pub fn parse_kwargs<T: DeserializeOwned>(
    kwargs: &serde_json::Map<String, serde_json::Value>,
) -> Result<T> {
    serde_json::from_value(serde_json::Value::Object(kwargs.clone())).map_err(|e| {
        let message = e.to_string();
        match extract_keyword(&message) {
            Some(keyword) => Error::Kwargs { keyword, message },
            None => Error::Serialization(e),
        }
    })
}

/// Pull the field name out of serde's `unknown field` / `missing field`
/// messages
pub(crate) fn extract_keyword(message: &str) -> Option<String> {
    static KEYWORD_RE: OnceLock<Regex> = OnceLock::new();
    let re = KEYWORD_RE.get_or_init(|| {
        // unwrap: the pattern is a compile-time constant
        #[allow(clippy::unwrap_used)]
        Regex::new(r"(?:unknown|missing) field `([^`]+)`").unwrap()
    });
    re.captures(message)
        .map(|captures| captures[1].to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    /// Adapter that does nothing; enough for structural tests
    pub(crate) struct FakeAdapter;

    #[async_trait]
    impl SiteAdapter for FakeAdapter {
        async fn produce(&self, _ctx: ProducerContext<'_>) -> Result<()> {
            Ok(())
        }

        async fn folder_name(
            &self,
            _session: &Session,
            _kwargs: &serde_json::Map<String, serde_json::Value>,
        ) -> Result<String> {
            Ok("fake-folder".to_string())
        }
    }

    /// Registry with the adapters the unit tests reference
    pub(crate) fn test_registry() -> AdapterRegistry {
        let mut registry = AdapterRegistry::new();
        registry.register("fake", Arc::new(FakeAdapter));
        registry.register("my_mod.produce", Arc::new(FakeAdapter));
        registry
    }

    #[test]
    fn test_contains_and_get() {
        let registry = test_registry();
        assert!(registry.contains("fake"));
        assert!(!registry.contains("moodle"));
        assert!(registry.get("fake").is_some());
        assert!(registry.get("moodle").is_none());
    }

    #[derive(Debug, Deserialize)]
    #[serde(deny_unknown_fields)]
    struct Params {
        course_id: u64,
        #[serde(default)]
        #[allow(dead_code)]
        semester: Option<String>,
    }

    #[test]
    fn test_parse_kwargs_ok() {
        let kwargs: serde_json::Map<String, serde_json::Value> =
            serde_json::from_value(json!({"course_id": 42})).unwrap();
        let params: Params = parse_kwargs(&kwargs).unwrap();
        assert_eq!(params.course_id, 42);
    }

    #[test]
    fn test_parse_kwargs_missing_field_names_keyword() {
        let kwargs = serde_json::Map::new();
        let err = parse_kwargs::<Params>(&kwargs).unwrap_err();
        match err {
            Error::Kwargs { keyword, .. } => assert_eq!(keyword, "course_id"),
            other => panic!("expected Kwargs error, got: {:?}", other),
        }
    }

    #[test]
    fn test_parse_kwargs_unknown_field_names_keyword() {
        let kwargs: serde_json::Map<String, serde_json::Value> =
            serde_json::from_value(json!({"course_id": 42, "typo_field": 1})).unwrap();
        let err = parse_kwargs::<Params>(&kwargs).unwrap_err();
        match err {
            Error::Kwargs { keyword, .. } => assert_eq!(keyword, "typo_field"),
            other => panic!("expected Kwargs error, got: {:?}", other),
        }
    }

    #[test]
    fn test_extract_keyword_patterns() {
        assert_eq!(
            extract_keyword("missing field `course_id` at line 1"),
            Some("course_id".to_string())
        );
        assert_eq!(
            extract_keyword("unknown field `typo`, expected one of `a`, `b`"),
            Some("typo".to_string())
        );
        assert_eq!(extract_keyword("expected u64, found string"), None);
    }
}
