//! Remote uploader: ships finished local files to ClickHouse.
//!
//! A scanner task lists the data directory on every tick, skips files the
//! writer still owns (via the in-progress predicate) and files already being
//! uploaded, and runs up to `threads` uploads at once. A file is deleted only
//! after every configured insert succeeded; otherwise it stays on disk and is
//! picked up again by a later scan.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::NaiveDate;
use thiserror::Error;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::row::{RowError, RowReader, encode_data_row, encode_tree_row, reverse_path};
use crate::writer::{FILE_PREFIX, InProgressFn};

// =============================================================================
// Constants
// =============================================================================

/// Default interval between directory scans.
const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Default insert timeout.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Column list of points tables.
const DATA_COLUMNS: &str = "Path, Value, Time, Date, Timestamp";

/// Column list of tree tables.
const TREE_COLUMNS: &str = "Date, Level, Path, Deleted, Version";

/// Errors that can occur in the uploader.
#[derive(Debug, Error)]
pub enum UploaderError {
    /// Local file access failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request failed or the client could not be built.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// ClickHouse rejected an insert.
    #[error("clickhouse insert into {table} failed with {status}: {body}")]
    Status {
        table: String,
        status: reqwest::StatusCode,
        body: String,
    },

    /// ClickHouse URL is malformed.
    #[error("invalid clickhouse url: {0}")]
    Url(#[from] url::ParseError),

    /// Local file holds malformed rows.
    #[error("malformed data file: {0}")]
    Row(#[from] RowError),
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for constructing an [`Uploader`].
pub struct UploaderBuilder {
    path: PathBuf,
    clickhouse_url: String,
    data_tables: Vec<String>,
    reverse_data_tables: Vec<String>,
    data_timeout: Duration,
    tree_table: String,
    reverse_tree_table: String,
    tree_date: NaiveDate,
    tree_timeout: Duration,
    in_progress: Option<InProgressFn>,
    threads: usize,
    scan_interval: Duration,
}

impl UploaderBuilder {
    /// Create a builder for files under `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            clickhouse_url: "http://localhost:8123/".to_string(),
            data_tables: Vec::new(),
            reverse_data_tables: Vec::new(),
            data_timeout: DEFAULT_TIMEOUT,
            tree_table: String::new(),
            reverse_tree_table: String::new(),
            tree_date: NaiveDate::default(),
            tree_timeout: DEFAULT_TIMEOUT,
            in_progress: None,
            threads: 1,
            scan_interval: DEFAULT_SCAN_INTERVAL,
        }
    }

    /// Set the ClickHouse HTTP interface URL.
    pub fn clickhouse(mut self, url: impl Into<String>) -> Self {
        self.clickhouse_url = url.into();
        self
    }

    /// Set the points tables.
    pub fn data_tables(mut self, tables: Vec<String>) -> Self {
        self.data_tables = tables;
        self
    }

    /// Set the reversed-path points tables.
    pub fn reverse_data_tables(mut self, tables: Vec<String>) -> Self {
        self.reverse_data_tables = tables;
        self
    }

    /// Set the points insert timeout.
    pub fn data_timeout(mut self, timeout: Duration) -> Self {
        self.data_timeout = timeout;
        self
    }

    /// Set the tree table; empty disables tree inserts.
    pub fn tree_table(mut self, table: impl Into<String>) -> Self {
        self.tree_table = table.into();
        self
    }

    /// Set the reversed tree table; empty disables.
    pub fn reverse_tree_table(mut self, table: impl Into<String>) -> Self {
        self.reverse_tree_table = table.into();
        self
    }

    /// Set the date written into tree rows.
    pub fn tree_date(mut self, date: NaiveDate) -> Self {
        self.tree_date = date;
        self
    }

    /// Set the tree insert timeout.
    pub fn tree_timeout(mut self, timeout: Duration) -> Self {
        self.tree_timeout = timeout;
        self
    }

    /// Set the predicate used to skip files the writer still owns.
    pub fn in_progress(mut self, callback: InProgressFn) -> Self {
        self.in_progress = Some(callback);
        self
    }

    /// Set the number of concurrent file uploads (minimum 1).
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    /// Set the directory scan interval.
    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    /// Build the uploader. It does nothing until [`Uploader::start`].
    pub fn build(self) -> Result<Uploader, UploaderError> {
        let url = url::Url::parse(&self.clickhouse_url)?;
        let client = reqwest::Client::builder().build()?;
        let tree_date = days_from_epoch(self.tree_date);

        Ok(Uploader {
            inner: Arc::new(UploaderInner {
                path: self.path,
                url,
                client,
                data_tables: self.data_tables,
                reverse_data_tables: self.reverse_data_tables,
                data_timeout: self.data_timeout,
                tree_table: self.tree_table,
                reverse_tree_table: self.reverse_tree_table,
                tree_date,
                tree_timeout: self.tree_timeout,
                in_progress: self
                    .in_progress
                    .unwrap_or_else(|| -> InProgressFn { Arc::new(|_: &Path| false) }),
                threads: self.threads,
                scan_interval: self.scan_interval,
                tree_cache: tokio::sync::Mutex::new(TreeCache::default()),
                stats: UploaderStats::default(),
                cancel: CancellationToken::new(),
                task: Mutex::new(None),
            }),
        })
    }
}

fn days_from_epoch(date: NaiveDate) -> u16 {
    let days = date.signed_duration_since(NaiveDate::default()).num_days();
    u16::try_from(days).unwrap_or(0)
}

fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default()
}

// =============================================================================
// Uploader
// =============================================================================

/// Paths already recorded in the tree tables.
#[derive(Debug, Default)]
pub(crate) struct TreeCache {
    direct: HashSet<String>,
    reverse: HashSet<String>,
}

impl TreeCache {
    fn len(&self) -> usize {
        self.direct.len() + self.reverse.len()
    }
}

#[derive(Debug, Default)]
struct UploaderStats {
    uploaded_files: AtomicU64,
    errors: AtomicU64,
    /// Last known number of cached tree paths, updated under the cache lock.
    tree_cache_size: AtomicU64,
}

struct UploaderInner {
    path: PathBuf,
    url: url::Url,
    client: reqwest::Client,
    data_tables: Vec<String>,
    reverse_data_tables: Vec<String>,
    data_timeout: Duration,
    tree_table: String,
    reverse_tree_table: String,
    tree_date: u16,
    tree_timeout: Duration,
    in_progress: InProgressFn,
    threads: usize,
    scan_interval: Duration,
    tree_cache: tokio::sync::Mutex<TreeCache>,
    stats: UploaderStats,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Uploader handle. Cloning is cheap and every clone controls the same uploader.
#[derive(Clone)]
pub struct Uploader {
    inner: Arc<UploaderInner>,
}

impl std::fmt::Debug for Uploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Uploader")
            .field("path", &self.inner.path)
            .field("url", &self.inner.url.as_str())
            .field("data_tables", &self.inner.data_tables)
            .field("threads", &self.inner.threads)
            .finish_non_exhaustive()
    }
}

impl Uploader {
    /// Spawn the scanner task. Calling it on a running uploader is a no-op.
    pub fn start(&self) {
        let mut task = self.inner.task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }
        *task = Some(tokio::spawn(Arc::clone(&self.inner).run()));
    }

    /// Whether the scanner task is alive.
    pub fn is_running(&self) -> bool {
        self.inner
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop scanning and abort in-flight uploads; their files stay on disk.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        let handle = self.inner.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "Uploader task ended abnormally");
        }
    }

    /// Forget which paths are already recorded in the tree tables.
    pub async fn clear_tree_exists_cache(&self) {
        let mut cache = self.inner.tree_cache.lock().await;
        let entries = cache.len();
        cache.direct.clear();
        cache.reverse.clear();
        self.inner.stats.tree_cache_size.store(0, Ordering::Relaxed);
        tracing::info!(entries, "Tree exists cache cleared");
    }

    /// Mark `paths` as already recorded in the direct tree table.
    #[cfg(test)]
    pub(crate) async fn remember_tree_paths(&self, paths: &[&str]) {
        self.inner
            .remember_tree_paths(paths.iter().map(|p| p.to_string()), false)
            .await;
    }

    /// Hold the tree cache lock, stalling every cache operation until dropped.
    #[cfg(test)]
    pub(crate) async fn lock_tree_cache(&self) -> tokio::sync::MutexGuard<'_, TreeCache> {
        self.inner.tree_cache.lock().await
    }

    /// Number of cached tree paths.
    pub async fn tree_cache_size(&self) -> usize {
        self.inner.tree_cache.lock().await.len()
    }

    /// Report counters accumulated since the previous call.
    pub fn stat(&self, send: &mut dyn FnMut(&str, f64)) {
        let stats = &self.inner.stats;
        send(
            "uploadedFiles",
            stats.uploaded_files.swap(0, Ordering::Relaxed) as f64,
        );
        send("errors", stats.errors.swap(0, Ordering::Relaxed) as f64);
        send(
            "treeCacheSize",
            stats.tree_cache_size.load(Ordering::Relaxed) as f64,
        );
    }
}

impl UploaderInner {
    async fn run(self: Arc<Self>) {
        tracing::info!(path = %self.path.display(), url = %self.url, "Uploader started");

        let mut ticker = tokio::time::interval(self.scan_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut uploads: JoinSet<PathBuf> = JoinSet::new();
        let mut inflight: HashSet<PathBuf> = HashSet::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.pending_files(&inflight).await {
                        Ok(files) => {
                            for file in files {
                                if uploads.len() >= self.threads {
                                    break;
                                }
                                inflight.insert(file.clone());
                                uploads.spawn(Arc::clone(&self).upload(file));
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Failed to scan data directory"),
                    }
                }
                Some(done) = uploads.join_next(), if !uploads.is_empty() => match done {
                    Ok(file) => {
                        inflight.remove(&file);
                    }
                    Err(e) => tracing::error!(error = %e, "Upload task failed"),
                },
            }
        }

        uploads.shutdown().await;
        tracing::info!("Uploader stopped");
    }

    /// Finished files, oldest first.
    async fn pending_files(&self, inflight: &HashSet<PathBuf>) -> std::io::Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.path).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_data_file = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(FILE_PREFIX));
            if is_data_file && !inflight.contains(&path) && !(self.in_progress)(&path) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    async fn upload(self: Arc<Self>, file: PathBuf) -> PathBuf {
        let start = std::time::Instant::now();
        match self.upload_file(&file).await {
            Ok(()) => {
                self.stats.uploaded_files.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    file = %file.display(),
                    duration_ms = start.elapsed().as_millis() as u64,
                    "Upload succeeded"
                );
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(file = %file.display(), error = %e, "Upload failed");
            }
        }
        file
    }

    async fn upload_file(&self, file: &Path) -> Result<(), UploaderError> {
        let body = tokio::fs::read(file).await?;

        if !body.is_empty() {
            for table in &self.data_tables {
                self.insert(table, DATA_COLUMNS, body.clone(), self.data_timeout)
                    .await?;
            }

            if !self.reverse_data_tables.is_empty() {
                let reversed = reverse_body(&body)?;
                for table in &self.reverse_data_tables {
                    self.insert(table, DATA_COLUMNS, reversed.clone(), self.data_timeout)
                        .await?;
                }
            }

            if !self.tree_table.is_empty() {
                self.upload_tree(&self.tree_table, &body, false).await?;
            }

            if !self.reverse_tree_table.is_empty() {
                self.upload_tree(&self.reverse_tree_table, &body, true)
                    .await?;
            }
        }

        tokio::fs::remove_file(file).await?;
        Ok(())
    }

    async fn upload_tree(&self, table: &str, body: &[u8], reverse: bool) -> Result<(), UploaderError> {
        let mut paths = Vec::new();
        for row in RowReader::new(body) {
            let row = row?;
            paths.push(if reverse {
                reverse_path(&row.path)
            } else {
                row.path
            });
        }

        let (rows, added) = {
            let cache = self.tree_cache.lock().await;
            let seen = if reverse { &cache.reverse } else { &cache.direct };
            tree_rows(
                paths.iter().map(String::as_str),
                seen,
                self.tree_date,
                unix_now(),
            )
        };

        if added.is_empty() {
            return Ok(());
        }

        self.insert(table, TREE_COLUMNS, rows, self.tree_timeout).await?;
        self.remember_tree_paths(added, reverse).await;
        Ok(())
    }

    async fn remember_tree_paths(&self, paths: impl IntoIterator<Item = String>, reverse: bool) {
        let mut cache = self.tree_cache.lock().await;
        let seen = if reverse {
            &mut cache.reverse
        } else {
            &mut cache.direct
        };
        seen.extend(paths);
        self.stats
            .tree_cache_size
            .store(cache.len() as u64, Ordering::Relaxed);
    }

    async fn insert(
        &self,
        table: &str,
        columns: &str,
        body: Vec<u8>,
        timeout: Duration,
    ) -> Result<(), UploaderError> {
        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair(
            "query",
            &format!("INSERT INTO {table} ({columns}) FORMAT RowBinary"),
        );

        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UploaderError::Status {
                table: table.to_string(),
                status,
                body,
            });
        }
        Ok(())
    }
}

/// Re-encode a data body with reversed paths.
fn reverse_body(body: &[u8]) -> Result<Vec<u8>, RowError> {
    let mut out = Vec::with_capacity(body.len());
    for row in RowReader::new(body) {
        let row = row?;
        encode_data_row(
            &mut out,
            &reverse_path(&row.path),
            row.value,
            row.time,
            row.date,
            row.version,
        );
    }
    Ok(out)
}

/// Build tree rows for every path node not yet in `seen`.
///
/// `a.b.c` yields `a.` (level 1), `a.b.` (level 2) and `a.b.c` (level 3).
/// Returns the encoded rows and the newly added nodes.
fn tree_rows<'a>(
    paths: impl Iterator<Item = &'a str>,
    seen: &HashSet<String>,
    date: u16,
    version: u32,
) -> (Vec<u8>, Vec<String>) {
    let mut body = Vec::new();
    let mut added: Vec<String> = Vec::new();
    let mut batch: HashSet<&str> = HashSet::new();

    for path in paths {
        let mut level = 0u32;
        let nodes = path
            .match_indices('.')
            .map(|(i, _)| &path[..=i])
            .chain(std::iter::once(path));
        for node in nodes {
            level += 1;
            if node.is_empty() || seen.contains(node) || !batch.insert(node) {
                continue;
            }
            encode_tree_row(&mut body, date, level, node, version);
            added.push(node.to_string());
        }
    }

    (body, added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{Point, WriteBuffer};
    use tempfile::tempdir;

    fn body(paths: &[&str]) -> Vec<u8> {
        let mut buf = WriteBuffer::new();
        for path in paths {
            buf.write_point(&Point::new(*path, 1.0, 1_500_000_000), 1_500_000_000);
        }
        buf.as_bytes().to_vec()
    }

    #[test]
    fn test_tree_rows_levels() {
        let (rows, added) = tree_rows(["a.b.c"].into_iter(), &HashSet::new(), 10, 99);
        assert_eq!(added, vec!["a.", "a.b.", "a.b.c"]);

        let mut expected = Vec::new();
        encode_tree_row(&mut expected, 10, 1, "a.", 99);
        encode_tree_row(&mut expected, 10, 2, "a.b.", 99);
        encode_tree_row(&mut expected, 10, 3, "a.b.c", 99);
        assert_eq!(rows, expected);
    }

    #[test]
    fn test_tree_rows_skip_seen_and_duplicates() {
        let seen: HashSet<String> = ["a.".to_string()].into_iter().collect();
        let (_, added) = tree_rows(["a.b", "a.c", "a.b"].into_iter(), &seen, 0, 0);
        assert_eq!(added, vec!["a.b", "a.c"]);
    }

    #[test]
    fn test_reverse_body() {
        let reversed = reverse_body(&body(&["a.b.c"])).unwrap();
        let row = RowReader::new(&reversed).next().unwrap().unwrap();
        assert_eq!(row.path, "c.b.a");
        assert_eq!(row.value, 1.0);
    }

    #[test]
    fn test_days_from_epoch() {
        let date = NaiveDate::from_ymd_opt(2016, 11, 1).unwrap();
        assert_eq!(days_from_epoch(date), 17_106);
    }

    #[test]
    fn test_builder_rejects_bad_url() {
        let result = UploaderBuilder::new("/tmp").clickhouse("not a url").build();
        assert!(matches!(result, Err(UploaderError::Url(_))));
    }

    #[tokio::test]
    async fn test_pending_files_skip_in_progress_and_foreign() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("default.1"), body(&["x"])).unwrap();
        std::fs::write(dir.path().join("default.2"), body(&["y"])).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();

        let uploader = UploaderBuilder::new(dir.path())
            .in_progress(Arc::new(|p: &Path| p.ends_with("default.2")))
            .build()
            .unwrap();

        let files = uploader
            .inner
            .pending_files(&HashSet::new())
            .await
            .unwrap();
        assert_eq!(files, vec![dir.path().join("default.1")]);

        let inflight: HashSet<PathBuf> = files.into_iter().collect();
        assert!(
            uploader
                .inner
                .pending_files(&inflight)
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_failed_upload_keeps_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("default.1");
        std::fs::write(&file, body(&["a.b"])).unwrap();

        // Nothing listens on the discard port; the insert fails fast.
        let uploader = UploaderBuilder::new(dir.path())
            .clickhouse("http://127.0.0.1:9/")
            .data_tables(vec!["graphite".to_string()])
            .data_timeout(Duration::from_secs(2))
            .build()
            .unwrap();

        let result = uploader.inner.upload_file(&file).await;
        assert!(result.is_err());
        assert!(file.exists());
    }

    #[tokio::test]
    async fn test_empty_file_is_removed_without_inserts() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("default.1");
        std::fs::write(&file, b"").unwrap();

        let uploader = UploaderBuilder::new(dir.path())
            .clickhouse("http://127.0.0.1:9/")
            .data_tables(vec!["graphite".to_string()])
            .build()
            .unwrap();

        uploader.inner.upload_file(&file).await.unwrap();
        assert!(!file.exists());
    }

    #[tokio::test]
    async fn test_lifecycle_and_cache_clear() {
        let dir = tempdir().unwrap();
        let uploader = UploaderBuilder::new(dir.path())
            .scan_interval(Duration::from_millis(10))
            .build()
            .unwrap();

        uploader.start();
        assert!(uploader.is_running());

        uploader.remember_tree_paths(&["a."]).await;
        assert_eq!(uploader.tree_cache_size().await, 1);
        uploader.clone().clear_tree_exists_cache().await;
        assert_eq!(uploader.tree_cache_size().await, 0);

        uploader.stop().await;
        assert!(!uploader.is_running());
        uploader.stop().await;
    }

    fn collect_stats(uploader: &Uploader) -> Vec<(String, f64)> {
        let mut sent = Vec::new();
        uploader.stat(&mut |name: &str, value: f64| sent.push((name.to_string(), value)));
        sent
    }

    #[tokio::test]
    async fn test_stat_reports_tree_cache_size_while_locked() {
        let dir = tempdir().unwrap();
        let uploader = UploaderBuilder::new(dir.path()).build().unwrap();
        uploader.remember_tree_paths(&["a.", "a.b."]).await;

        let guard = uploader.lock_tree_cache().await;
        let sent = collect_stats(&uploader);
        drop(guard);
        assert!(sent.contains(&("treeCacheSize".to_string(), 2.0)));

        uploader.clear_tree_exists_cache().await;
        let sent = collect_stats(&uploader);
        assert!(sent.contains(&("treeCacheSize".to_string(), 0.0)));
    }
}
