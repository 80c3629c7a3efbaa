//! Transfer executor: conditional fetch, streaming write, atomic replace
//!
//! One [`TransferExecutor::fetch`] call handles one download descriptor end
//! to end: destination computation and containment check, deferred-extension
//! resolution, the force/up-to-date decision against the fingerprint cache,
//! extension filtering, the conditional HTTP fetch, the streamed write with
//! replace-with-backup, and the cache update. Failures during the write
//! always remove the partial file; the destination never holds a
//! half-written file.

use crate::cache::{CacheService, NS_EXTENSIONS, NS_URL_REFERENCE};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::retry::transfer_with_retry;
use crate::session::Session;
use crate::side_tasks::{find_pdf_diff_tool, SideTaskPool};
use crate::tree::ConsumerFilters;
use crate::types::{DownloadDescriptor, Event, NodeId};
use crate::utils::{check_contained, expand_extension_aliases, extension_of, old_variant};
use futures::StreamExt;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;

/// What happened to one descriptor
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Body streamed to a fresh destination
    Added,
    /// Body streamed over an existing destination
    Replaced,
    /// Destination exists and nothing forced a re-download; zero network bytes
    UpToDate,
    /// Remote answered `304 Not Modified`
    NotModified,
    /// Dropped by the extension filters
    Filtered,
}

/// Running totals for the final run report
#[derive(Debug, Default)]
pub(crate) struct TransferStats {
    pub(crate) files_added: AtomicU64,
    pub(crate) files_replaced: AtomicU64,
    pub(crate) bytes_downloaded: AtomicU64,
}

/// Extension filters after merging global settings with one branch's
/// overrides: union first, alias expansion second.
#[derive(Clone, Debug, Default)]
pub struct MergedFilters {
    allowed: HashSet<String>,
    forbidden: HashSet<String>,
}

impl MergedFilters {
    /// Merge the global lists with one branch's overrides
    pub fn merge(config: &Config, branch: &ConsumerFilters) -> Self {
        let mut allowed = config.sync.allowed_extensions.clone();
        if let Some(extra) = &branch.allowed_extensions {
            allowed.extend(extra.iter().cloned());
        }
        let mut forbidden = config.sync.forbidden_extensions.clone();
        if let Some(extra) = &branch.forbidden_extensions {
            forbidden.extend(extra.iter().cloned());
        }
        Self {
            allowed: expand_extension_aliases(&allowed).into_iter().collect(),
            forbidden: expand_extension_aliases(&forbidden).into_iter().collect(),
        }
    }

    /// True when a file at `path` may be downloaded.
    ///
    /// Forbidden wins over allowed; an empty allow set means "allow all".
    /// Files without an extension only pass when no allow list is active.
    pub fn passes(&self, path: &Path) -> bool {
        match extension_of(path) {
            Some(ext) => {
                !self.forbidden.contains(&ext)
                    && (self.allowed.is_empty() || self.allowed.contains(&ext))
            }
            None => self.allowed.is_empty(),
        }
    }
}

/// Executes one descriptor at a time; shared by the whole consumer pool
pub(crate) struct TransferExecutor {
    pub(crate) config: Arc<Config>,
    pub(crate) cache: Arc<CacheService>,
    pub(crate) session: Session,
    pub(crate) side_tasks: Arc<SideTaskPool>,
    pub(crate) event_tx: broadcast::Sender<Event>,
    pub(crate) stats: TransferStats,
}

impl TransferExecutor {
    fn emit(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    /// Fetch one descriptor, running the conditional steps in order (see
    /// module docs)
    pub(crate) async fn fetch(
        &self,
        node: NodeId,
        mut descriptor: DownloadDescriptor,
        filters: &MergedFilters,
    ) -> Result<TransferOutcome> {
        check_contained(&descriptor.path)?;

        // Deferred extensions resolve before any cache or existence check,
        // because the final path depends on them
        if !descriptor.forced_extension {
            let ext = self.resolve_extension(&descriptor.url).await?;
            // Append rather than set_extension: a deferred name may contain
            // dots of its own ("lecture.v2") that are not an extension
            descriptor.path.as_mut_os_string().push(format!(".{}", ext));
        }
        let destination = self.config.base_path().join(&descriptor.path);
        let meta_key = descriptor.path.to_string_lossy().to_string();
        let mut meta = self.cache.file_meta(&meta_key).await?;

        let domain = domain_of(&descriptor.url);
        let blacklisted = domain
            .as_deref()
            .map(|d| self.config.is_blacklisted_domain(d))
            .unwrap_or(false);

        let checksum_changed = match (&descriptor.checksum, &meta.checksum) {
            (Some(supplied), Some(cached)) => supplied != cached,
            (Some(_), None) => true,
            (None, _) => false,
        };
        let force = checksum_changed || (self.config.sync.force_download && !blacklisted);

        let exists = tokio::fs::try_exists(&destination).await?;
        if exists && !force {
            tracing::debug!(path = %destination.display(), "Destination up to date, skipping");
            return Ok(TransferOutcome::UpToDate);
        }

        let conditional_etag = if exists && !blacklisted {
            meta.etag.clone()
        } else {
            None
        };

        if !filters.passes(&descriptor.path) {
            tracing::debug!(path = %descriptor.path.display(), "Dropped by extension filters");
            return Ok(TransferOutcome::Filtered);
        }

        let fetched = transfer_with_retry(&self.config.retry, || {
            self.fetch_once(&descriptor, conditional_etag.as_deref(), &destination)
        })
        .await?;

        let Fetched::Body {
            bytes_written,
            own_checksum,
            etag,
            final_url,
            temp_path,
        } = fetched
        else {
            tracing::debug!(url = %descriptor.url, "Remote replied 304 Not Modified");
            return Ok(TransferOutcome::NotModified);
        };

        if final_url != descriptor.url {
            self.cache
                .set_str(NS_URL_REFERENCE, &descriptor.url, &final_url)
                .await?;
        }

        // Replace-with-backup, then the atomic rename into place
        let mut old_path = None;
        let mut diff_path = None;
        if exists {
            if self.config.sync.keep_replaced_files {
                let aside = old_variant(&destination);
                tokio::fs::rename(&destination, &aside).await?;
                if extension_of(&destination).as_deref() == Some("pdf") {
                    diff_path = self.annotate_pdf_diff(&aside, &temp_path, &destination).await;
                }
                old_path = Some(aside);
            }
        }
        tokio::fs::rename(&temp_path, &destination).await?;

        if etag.is_none() && !blacklisted {
            self.emit(Event::NodeWarning {
                node,
                message: format!("no ETag in response from {}", descriptor.url),
            });
        }

        meta.etag = etag;
        meta.checksum = descriptor.checksum.clone();
        meta.own_checksum = Some(own_checksum);
        self.cache.set_file_meta(&meta_key, &meta).await?;

        self.stats
            .bytes_downloaded
            .fetch_add(bytes_written, Ordering::Relaxed);
        self.emit(Event::BytesDownloaded { n: bytes_written });

        if exists {
            self.stats.files_replaced.fetch_add(1, Ordering::Relaxed);
            tracing::info!(path = %destination.display(), bytes = bytes_written, "File replaced");
            self.emit(Event::FileReplaced {
                path: destination,
                old_path,
                diff_path,
            });
            Ok(TransferOutcome::Replaced)
        } else {
            self.stats.files_added.fetch_add(1, Ordering::Relaxed);
            tracing::info!(path = %destination.display(), bytes = bytes_written, "New file added");
            self.emit(Event::NewFileAdded { path: destination });
            Ok(TransferOutcome::Added)
        }
    }

    /// One fetch attempt: request, status handling, streamed write.
    /// Retried as a whole on transient failures.
    async fn fetch_once(
        &self,
        descriptor: &DownloadDescriptor,
        conditional_etag: Option<&str>,
        destination: &Path,
    ) -> Result<Fetched> {
        let mut request = self.session.get(&descriptor.url);
        for (key, value) in &descriptor.session_kwargs {
            match value.as_str() {
                Some(s) => request = request.query(&[(key.as_str(), s)]),
                None => request = request.query(&[(key.as_str(), value.to_string().as_str())]),
            }
        }
        if let Some(etag) = conditional_etag {
            request = request.header(reqwest::header::IF_NONE_MATCH, etag);
        }

        let response = request.send().await?;
        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            return Ok(Fetched::NotModified);
        }
        if !response.status().is_success() {
            return Err(Error::Http {
                status: response.status().as_u16(),
                url: descriptor.url.clone(),
            });
        }

        let etag = header_str(&response, reqwest::header::ETAG);
        let final_url = response.url().to_string();

        let dir = destination
            .parent()
            .ok_or_else(|| Error::Other(format!("no parent for {}", destination.display())))?;
        tokio::fs::create_dir_all(dir).await?;
        let file_name = destination
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("download");
        let temp_path = dir.join(format!(".{}.part", file_name));

        let (bytes_written, own_checksum) =
            write_stream(&temp_path, response.bytes_stream()).await?;

        Ok(Fetched::Body {
            bytes_written,
            own_checksum,
            etag,
            final_url,
            temp_path,
        })
    }

    /// Resolve a deferred extension for `url`, caching per url so repeated
    /// resolution costs nothing.
    async fn resolve_extension(&self, url: &str) -> Result<String> {
        if let Some(ext) = self.cache.get_str(NS_EXTENSIONS, url).await? {
            return Ok(ext);
        }

        let response = self.session.get(url).send().await?;
        if !response.status().is_success() {
            return Err(Error::Http {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        let ext = extension_from_response(&response)
            .unwrap_or_else(|| "bin".to_string());
        // Body intentionally not consumed; dropping the response closes it
        self.cache.set_str(NS_EXTENSIONS, url, &ext).await?;
        Ok(ext)
    }

    /// Diff the old and new version of a replaced PDF through the side-task
    /// pool. A missing tool or a failed diff is a log line, never an error:
    /// the replacement itself already succeeded.
    async fn annotate_pdf_diff(
        &self,
        old: &Path,
        new: &Path,
        destination: &Path,
    ) -> Option<PathBuf> {
        let tool = find_pdf_diff_tool(
            self.config.tools.pdf_diff_path.as_ref(),
            self.config.tools.search_path,
        )?;
        let diff_path = destination.with_file_name(format!(
            "{}-diff.pdf",
            destination.file_stem().and_then(|s| s.to_str()).unwrap_or("file")
        ));
        let result = self
            .side_tasks
            .apply(
                &tool,
                [
                    format!("--output-diff={}", diff_path.display()),
                    old.display().to_string(),
                    new.display().to_string(),
                ],
            )
            .await;
        match result {
            Ok(()) => Some(diff_path),
            Err(e) => {
                tracing::warn!(error = %e, old = %old.display(), "PDF diff annotation failed");
                None
            }
        }
    }
}

/// Result of one network attempt
enum Fetched {
    NotModified,
    Body {
        bytes_written: u64,
        own_checksum: String,
        etag: Option<String>,
        final_url: String,
        temp_path: PathBuf,
    },
}

/// Stream a response body into `temp_path`, hashing as it goes.
///
/// On any error the partial file is deleted before the error propagates.
async fn write_stream<S, E>(temp_path: &Path, stream: S) -> Result<(u64, String)>
where
    S: futures::Stream<Item = std::result::Result<bytes::Bytes, E>>,
    Error: From<E>,
{
    use sha2::{Digest, Sha256};

    let mut stream = std::pin::pin!(stream);
    let result: Result<(u64, String)> = async {
        let mut file = tokio::fs::File::create(temp_path).await?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        let mut checksum = String::with_capacity(64);
        for byte in hasher.finalize() {
            use std::fmt::Write;
            let _ = write!(checksum, "{:02x}", byte);
        }
        Ok((written, checksum))
    }
    .await;

    if result.is_err() {
        tokio::fs::remove_file(temp_path).await.ok();
    }
    result
}

/// Host part of a url, for the conditional-request blacklist
fn domain_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
}

fn header_str(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}

/// Derive a file extension from response headers: Content-Disposition
/// filename first, Content-Type subtype second, url path last.
fn extension_from_response(response: &reqwest::Response) -> Option<String> {
    if let Some(disposition) = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(ext) = filename_extension(disposition) {
            return Some(ext);
        }
    }

    if let Some(content_type) = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(ext) = extension_from_content_type(content_type) {
            return Some(ext);
        }
    }

    let path = response.url().path();
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Extension of the `filename=` parameter in a Content-Disposition header
fn filename_extension(disposition: &str) -> Option<String> {
    let filename = disposition
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))?;
    let filename = filename.trim_matches('"');
    Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Well-known content types, with a generic subtype fallback
fn extension_from_content_type(content_type: &str) -> Option<String> {
    let mime = content_type.split(';').next()?.trim();
    let known = match mime {
        "application/pdf" => Some("pdf"),
        "text/plain" => Some("txt"),
        "text/html" => Some("html"),
        "image/jpeg" => Some("jpg"),
        "image/png" => Some("png"),
        "application/zip" => Some("zip"),
        "video/mp4" => Some("mp4"),
        "application/vnd.openxmlformats-officedocument.presentationml.presentation" => {
            Some("pptx")
        }
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => Some("docx"),
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => Some("xlsx"),
        "application/octet-stream" => None,
        _ => None,
    };
    if let Some(ext) = known {
        return Some(ext.to_string());
    }
    // Fall back to the subtype when it looks like a plain extension
    let subtype = mime.split('/').nth(1)?;
    if !subtype.is_empty() && subtype.len() <= 5 && subtype.chars().all(|c| c.is_ascii_alphanumeric())
    {
        Some(subtype.to_ascii_lowercase())
    } else {
        None
    }
}
