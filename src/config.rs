//! Configuration types for sitesync

use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Sync behavior configuration (directories, force/keep policies, filters)
///
/// Groups settings related to where files land and how re-downloads are
/// decided. Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Root directory files are mirrored into (default: "./sync")
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,

    /// Cache directory for fingerprint namespaces (default: "./sync/.cache")
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Re-download files even when the destination already exists
    #[serde(default)]
    pub force_download: bool,

    /// Keep a `-old` copy of any file that gets replaced
    #[serde(default)]
    pub keep_replaced_files: bool,

    /// Globally allowed file extensions (empty = allow all).
    /// The alias `"video"` expands to the movie-extension set.
    #[serde(default)]
    pub allowed_extensions: Vec<String>,

    /// Globally forbidden file extensions
    #[serde(default)]
    pub forbidden_extensions: Vec<String>,

    /// Domains that reject conditional requests; no `If-None-Match` header is
    /// sent for them, force_download does not apply to them, and a missing
    /// ETag in their responses is never warned about
    #[serde(default)]
    pub conditional_request_blacklist: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            cache_dir: default_cache_dir(),
            force_download: false,
            keep_replaced_files: false,
            allowed_extensions: Vec::new(),
            forbidden_extensions: Vec::new(),
            conditional_request_blacklist: Vec::new(),
        }
    }
}

/// Concurrency and timeout configuration
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Number of queue consumers draining descriptors concurrently (default: 20)
    #[serde(default = "default_transfer_consumers")]
    pub transfer_consumers: usize,

    /// Number of side-task worker slots for CPU-heavy post-processing (default: 2)
    #[serde(default = "default_side_task_workers")]
    pub side_task_workers: usize,

    /// Per-request timeout (default: 30 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// Event broadcast channel capacity (default: 1000)
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            transfer_consumers: default_transfer_consumers(),
            side_task_workers: default_side_task_workers(),
            request_timeout: default_request_timeout(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Retry configuration for transient transfer failures
///
/// Timeouts and mid-stream disconnects are retried with a fixed backoff;
/// other HTTP errors surface immediately.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed delay between retries (default: 1 second)
    #[serde(default = "default_retry_delay", with = "duration_serde")]
    pub delay: Duration,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay: default_retry_delay(),
            jitter: true,
        }
    }
}

/// Side-task tool configuration
///
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Path to the PDF diff tool (auto-detected via PATH if None)
    #[serde(default)]
    pub pdf_diff_path: Option<PathBuf>,

    /// Whether to search PATH for the diff tool if no explicit path is set (default: true)
    #[serde(default = "default_true")]
    pub search_path: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            pdf_diff_path: None,
            search_path: true,
        }
    }
}

/// Main configuration for [`SyncEngine`](crate::SyncEngine)
///
/// Fields are organized into logical sub-configs:
/// - [`sync`](SyncConfig) - paths, force/keep policies, extension filters
/// - [`concurrency`](ConcurrencyConfig) - consumer pool sizes, timeouts
/// - [`retry`](RetryConfig) - transient-failure retries
/// - [`tools`](ToolsConfig) - external diff binary
///
/// All sub-config fields are flattened for flat JSON/TOML serialization.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Sync behavior settings (paths, force/keep policies, filters)
    #[serde(flatten)]
    pub sync: SyncConfig,

    /// Concurrency limits and timeouts
    #[serde(flatten)]
    pub concurrency: ConcurrencyConfig,

    /// Retry settings for transient failures
    #[serde(default)]
    pub retry: RetryConfig,

    /// External tool paths
    #[serde(flatten)]
    pub tools: ToolsConfig,
}

// Convenience accessors so call sites can use `config.base_path()` etc.
// without reaching through the sub-config structs.
impl Config {
    /// Root directory files are mirrored into
    pub fn base_path(&self) -> &PathBuf {
        &self.sync.base_path
    }

    /// Cache directory for fingerprint namespaces
    pub fn cache_dir(&self) -> &PathBuf {
        &self.sync.cache_dir
    }

    /// True if `domain` is on the conditional-request blacklist
    pub fn is_blacklisted_domain(&self, domain: &str) -> bool {
        self.sync
            .conditional_request_blacklist
            .iter()
            .any(|d| d.eq_ignore_ascii_case(domain))
    }
}

fn default_base_path() -> PathBuf {
    PathBuf::from("./sync")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./sync/.cache")
}

fn default_transfer_consumers() -> usize {
    20
}

fn default_side_task_workers() -> usize {
    2
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_event_capacity() -> usize {
    1000
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_true() -> bool {
    true
}

// Duration serialization helper (stores seconds as integers)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
