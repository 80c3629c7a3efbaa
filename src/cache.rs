//! Persistent fingerprint cache
//!
//! Maps logical namespaces to string-keyed JSON values: ETags, checksums,
//! resolved extensions and filenames, resolved folder names. Namespaces are
//! loaded lazily on first access, held in memory for the service's lifetime,
//! and flushed atomically (temp file + rename) by an explicit [`flush`] or
//! [`close`] call; there is no implicit exit hook.
//!
//! On-disk layout: one `<namespace>.json` file per namespace under the cache
//! directory. Values that cannot be represented as JSON are written to a
//! sibling `.blob` file, with a pointer entry left in the JSON.
//!
//! [`flush`]: CacheService::flush
//! [`close`]: CacheService::close

use crate::error::{Error, Result};
use crate::utils::sha256_hex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Namespace for resolved folder names, keyed by node unique_key
pub const NS_FOLDER_NAMES: &str = "folder_name";
/// Namespace for per-file fingerprints, keyed by relative file path
pub const NS_FILE_META: &str = "file_meta_data";
/// Namespace for resolved file extensions, keyed by url
pub const NS_EXTENSIONS: &str = "extensions";
/// Namespace for resolved filenames, keyed by url
pub const NS_FILENAMES: &str = "filenames";
/// Namespace for redirect targets, keyed by requested url
pub const NS_URL_REFERENCE: &str = "url_reference";

/// Marker key used for blob pointer objects
const BLOB_POINTER_KEY: &str = "__blob__";

/// Fingerprints recorded for one synced file
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMeta {
    /// Adapter-supplied content checksum, if the remote exposes one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    /// SHA-256 of the local file contents as written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub own_checksum: Option<String>,
    /// ETag from the last successful fetch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// One in-memory namespace with its dirty flag
#[derive(Debug, Default)]
struct Namespace {
    entries: HashMap<String, Value>,
    dirty: bool,
}

#[derive(Debug, Default)]
struct CacheState {
    namespaces: HashMap<String, Namespace>,
    closed: bool,
}

/// Fingerprint cache service with an explicit open/flush/close lifecycle
///
/// Constructed once per run and shared by reference with every component
/// that needs it. All reads and writes go through the in-memory maps; disk
/// is only touched on first access per namespace and on flush.
#[derive(Debug)]
pub struct CacheService {
    dir: PathBuf,
    state: Mutex<CacheState>,
}

impl CacheService {
    /// Open the cache rooted at `dir`, creating the directory if needed.
    ///
    /// Namespace files are not read here; each loads lazily on first access.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to create cache directory '{}': {}", dir.display(), e),
            ))
        })?;
        Ok(Self {
            dir,
            state: Mutex::new(CacheState::default()),
        })
    }

    /// Read a value from `namespace`
    pub async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        let mut state = self.state.lock().await;
        self.ensure_loaded(&mut state, namespace).await?;
        Ok(state
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.entries.get(key))
            .cloned())
    }

    /// Read a string value from `namespace`
    pub async fn get_str(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .get(namespace, key)
            .await?
            .and_then(|v| v.as_str().map(str::to_owned)))
    }

    /// Write a value into `namespace`, marking it dirty
    pub async fn set(&self, namespace: &str, key: &str, value: Value) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(Error::Cache("cache already closed".into()));
        }
        self.ensure_loaded(&mut state, namespace).await?;
        let ns = state.namespaces.entry(namespace.to_string()).or_default();
        ns.entries.insert(key.to_string(), value);
        ns.dirty = true;
        Ok(())
    }

    /// Write a string value into `namespace`
    pub async fn set_str(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        self.set(namespace, key, Value::String(value.to_string()))
            .await
    }

    /// Read the fingerprint record for one file path
    pub async fn file_meta(&self, path: &str) -> Result<FileMeta> {
        match self.get(NS_FILE_META, path).await? {
            Some(value) => Ok(serde_json::from_value(value)?),
            None => Ok(FileMeta::default()),
        }
    }

    /// Write the fingerprint record for one file path
    pub async fn set_file_meta(&self, path: &str, meta: &FileMeta) -> Result<()> {
        self.set(NS_FILE_META, path, serde_json::to_value(meta)?)
            .await
    }

    /// Store an opaque byte value.
    ///
    /// The bytes land in a content-addressed `.blob` file next to the
    /// namespace JSON; the JSON entry holds a pointer to it.
    pub async fn set_blob(&self, namespace: &str, key: &str, bytes: &[u8]) -> Result<()> {
        let blob_name = format!("{}.{}.blob", namespace, &sha256_hex(bytes)[..16]);
        let blob_path = self.dir.join(&blob_name);
        atomic_write(&blob_path, bytes).await?;
        self.set(
            namespace,
            key,
            serde_json::json!({ BLOB_POINTER_KEY: blob_name }),
        )
        .await
    }

    /// Read back an opaque byte value stored with [`set_blob`](Self::set_blob)
    pub async fn get_blob(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let Some(value) = self.get(namespace, key).await? else {
            return Ok(None);
        };
        let Some(blob_name) = value.get(BLOB_POINTER_KEY).and_then(Value::as_str) else {
            return Ok(None);
        };
        match tokio::fs::read(self.dir.join(blob_name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write every dirty namespace to disk.
    ///
    /// Each namespace file is written to a temp path and renamed into place,
    /// so a crash mid-flush never leaves a truncated namespace behind.
    pub async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let dir = self.dir.clone();
        for (name, ns) in state.namespaces.iter_mut() {
            if !ns.dirty {
                continue;
            }
            let json = serde_json::to_vec_pretty(&ns.entries)?;
            atomic_write(&dir.join(format!("{}.json", name)), &json).await?;
            ns.dirty = false;
            tracing::debug!(namespace = %name, "Flushed cache namespace");
        }
        Ok(())
    }

    /// Flush and mark the service closed. Idempotent; later reads still work
    /// but writes are rejected.
    pub async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }
        self.flush().await
    }

    /// Load a namespace file into memory if it is not resident yet
    async fn ensure_loaded(&self, state: &mut CacheState, namespace: &str) -> Result<()> {
        if state.namespaces.contains_key(namespace) {
            return Ok(());
        }
        let path = self.dir.join(format!("{}.json", namespace));
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::Cache(format!(
                    "corrupt namespace file '{}': {}",
                    path.display(),
                    e
                ))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        state.namespaces.insert(
            namespace.to_string(),
            Namespace {
                entries,
                dirty: false,
            },
        );
        Ok(())
    }
}

/// Write `bytes` to `path` via a temp file in the same directory plus rename
async fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn open_cache(dir: &TempDir) -> CacheService {
        CacheService::open(dir.path()).await.unwrap()
    }

    #[tokio::test]
    async fn test_get_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        assert_eq!(cache.get(NS_EXTENSIONS, "http://x/a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_then_get_in_memory() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        cache
            .set_str(NS_FOLDER_NAMES, "abc123", "Analysis I")
            .await
            .unwrap();
        assert_eq!(
            cache.get_str(NS_FOLDER_NAMES, "abc123").await.unwrap(),
            Some("Analysis I".to_string())
        );
    }

    #[tokio::test]
    async fn test_round_trip_across_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let cache = open_cache(&dir).await;
            cache
                .set_file_meta(
                    "A/notes.pdf",
                    &FileMeta {
                        checksum: Some("abc".into()),
                        own_checksum: Some("deadbeef".into()),
                        etag: Some("\"v1\"".into()),
                    },
                )
                .await
                .unwrap();
            cache.close().await.unwrap();
        }

        // Fresh service simulating a process restart
        let cache = open_cache(&dir).await;
        let meta = cache.file_meta("A/notes.pdf").await.unwrap();
        assert_eq!(meta.checksum.as_deref(), Some("abc"));
        assert_eq!(meta.own_checksum.as_deref(), Some("deadbeef"));
        assert_eq!(meta.etag.as_deref(), Some("\"v1\""));
    }

    #[tokio::test]
    async fn test_unflushed_writes_do_not_hit_disk() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        cache.set_str(NS_EXTENSIONS, "http://x/a", "pdf").await.unwrap();

        let on_disk = dir.path().join("extensions.json");
        assert!(!on_disk.exists(), "write should stay in memory until flush");

        cache.flush().await.unwrap();
        assert!(on_disk.exists());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_rejects_writes() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        cache.set_str(NS_FILENAMES, "http://x/a", "a.pdf").await.unwrap();
        cache.close().await.unwrap();
        cache.close().await.unwrap();

        let result = cache.set_str(NS_FILENAMES, "http://x/b", "b.pdf").await;
        assert!(matches!(result, Err(Error::Cache(_))));
    }

    #[tokio::test]
    async fn test_blob_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        let payload = vec![0u8, 159, 146, 150]; // not valid UTF-8 / JSON
        cache
            .set_blob("session_tokens", "adapter-a", &payload)
            .await
            .unwrap();
        cache.flush().await.unwrap();

        let cache = open_cache(&dir).await;
        assert_eq!(
            cache.get_blob("session_tokens", "adapter-a").await.unwrap(),
            Some(payload)
        );
    }

    #[tokio::test]
    async fn test_nested_values_round_trip() {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir).await;
        cache
            .set(
                NS_URL_REFERENCE,
                "http://short/x",
                json!("http://long.example.com/real/x"),
            )
            .await
            .unwrap();
        cache.flush().await.unwrap();

        let cache = open_cache(&dir).await;
        assert_eq!(
            cache.get_str(NS_URL_REFERENCE, "http://short/x").await.unwrap(),
            Some("http://long.example.com/real/x".to_string())
        );
    }
}
