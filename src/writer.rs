//! Local durable writer.
//!
//! Single-consumer pattern: one task owns the write channel receiver and
//! appends every [`WriteBuffer`] to the current file under the data directory.
//! Files rotate every `file_interval`; a rotated file is complete and may be
//! picked up by the uploader. The name of the file being written is published
//! through [`Writer::is_in_progress`] so the uploader never reads it early.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::row::WriteBuffer;

// =============================================================================
// Constants
// =============================================================================

/// Name prefix of files produced by the writer.
pub const FILE_PREFIX: &str = "default.";

/// Capacity of the shared write channel.
///
/// Tokio channels need at least one slot. A single slot keeps producers in
/// lockstep with the writer, so a slow disk stalls receivers instead of
/// growing memory.
pub const WRITE_CHANNEL_CAPACITY: usize = 1;

/// Sender half of the shared write channel.
pub type WriteSender = mpsc::Sender<WriteBuffer>;

/// Receiver half of the shared write channel.
pub type WriteReceiver = mpsc::Receiver<WriteBuffer>;

/// Predicate telling whether a file is still being written.
pub type InProgressFn = Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// Create a fresh write channel.
pub fn write_channel() -> (WriteSender, WriteReceiver) {
    mpsc::channel(WRITE_CHANNEL_CAPACITY)
}

/// Errors that can occur while starting the writer.
#[derive(Debug, Error)]
pub enum WriterError {
    /// The data directory could not be created.
    #[error("failed to create data directory '{}': {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `start` was called twice.
    #[error("writer already started")]
    AlreadyStarted,
}

#[derive(Debug, Default)]
struct WriterStats {
    written_bytes: AtomicU64,
    written_points: AtomicU64,
    files: AtomicU64,
    errors: AtomicU64,
}

/// Durable writer handle.
pub struct Writer {
    path: PathBuf,
    file_interval: Duration,
    rx: Option<WriteReceiver>,
    current: Arc<RwLock<Option<PathBuf>>>,
    stats: Arc<WriterStats>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("path", &self.path)
            .field("file_interval", &self.file_interval)
            .finish_non_exhaustive()
    }
}

impl Writer {
    /// Create a writer consuming `rx`. Nothing happens until [`Writer::start`].
    pub fn new(rx: WriteReceiver, path: impl AsRef<Path>, file_interval: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file_interval,
            rx: Some(rx),
            current: Arc::new(RwLock::new(None)),
            stats: Arc::new(WriterStats::default()),
            cancel: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Create the data directory and spawn the consumer task.
    pub async fn start(&mut self) -> Result<(), WriterError> {
        tokio::fs::create_dir_all(&self.path)
            .await
            .map_err(|source| WriterError::CreateDir {
                path: self.path.clone(),
                source,
            })?;

        let rx = self.rx.take().ok_or(WriterError::AlreadyStarted)?;
        let actor = WriterActor {
            dir: self.path.clone(),
            file_interval: self.file_interval,
            rx,
            file: None,
            current: Arc::clone(&self.current),
            stats: Arc::clone(&self.stats),
            cancel: self.cancel.clone(),
        };

        let handle = tokio::spawn(actor.run());
        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    /// Whether `path` is the file currently being written.
    pub fn is_in_progress(&self, path: &Path) -> bool {
        is_current(&self.current, path)
    }

    /// Shareable form of [`Writer::is_in_progress`] for the uploader.
    pub fn in_progress_fn(&self) -> InProgressFn {
        let current = Arc::clone(&self.current);
        Arc::new(move |path: &Path| is_current(&current, path))
    }

    /// Whether the consumer task is alive.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop the consumer, draining the channel slot and closing the current file.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "Writer task ended abnormally");
        }
    }

    /// Report counters accumulated since the previous call.
    pub fn stat(&self, send: &mut dyn FnMut(&str, f64)) {
        send(
            "writtenBytes",
            self.stats.written_bytes.swap(0, Ordering::Relaxed) as f64,
        );
        send(
            "writtenPoints",
            self.stats.written_points.swap(0, Ordering::Relaxed) as f64,
        );
        send("files", self.stats.files.swap(0, Ordering::Relaxed) as f64);
        send("errors", self.stats.errors.swap(0, Ordering::Relaxed) as f64);
    }
}

fn is_current(current: &RwLock<Option<PathBuf>>, path: &Path) -> bool {
    let guard = current.read().unwrap_or_else(|e| e.into_inner());
    match guard.as_deref() {
        Some(cur) => cur.file_name().is_some() && cur.file_name() == path.file_name(),
        None => false,
    }
}

fn new_file_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("{FILE_PREFIX}{nanos}")
}

// =============================================================================
// Actor
// =============================================================================

struct WriterActor {
    dir: PathBuf,
    file_interval: Duration,
    rx: WriteReceiver,
    file: Option<BufWriter<File>>,
    current: Arc<RwLock<Option<PathBuf>>>,
    stats: Arc<WriterStats>,
    cancel: CancellationToken,
}

impl WriterActor {
    async fn run(mut self) {
        tracing::info!(path = %self.dir.display(), "Writer started");

        let mut rotate = tokio::time::interval(self.file_interval);
        rotate.set_missed_tick_behavior(MissedTickBehavior::Delay);
        rotate.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                msg = self.rx.recv() => match msg {
                    Some(buf) => self.handle(buf).await,
                    None => {
                        tracing::debug!("Write channel closed");
                        break;
                    }
                },
                _ = rotate.tick() => self.rotate().await,
            }
        }

        // Producers are stopped before the writer; keep whatever they left in the slot.
        while let Ok(buf) = self.rx.try_recv() {
            self.handle(buf).await;
        }
        self.rotate().await;

        tracing::info!("Writer stopped");
    }

    async fn handle(&mut self, buf: WriteBuffer) {
        if buf.is_empty() {
            return;
        }
        match self.write(&buf).await {
            Ok(()) => {
                self.stats
                    .written_bytes
                    .fetch_add(buf.as_bytes().len() as u64, Ordering::Relaxed);
                self.stats
                    .written_points
                    .fetch_add(buf.points() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, points = buf.points(), "Write failed");
                // Start over with a fresh file rather than appending after a partial write.
                self.rotate().await;
            }
        }
    }

    async fn write(&mut self, buf: &WriteBuffer) -> std::io::Result<()> {
        if self.file.is_none() {
            self.open().await?;
        }
        if let Some(file) = self.file.as_mut() {
            file.write_all(buf.as_bytes()).await?;
        }
        Ok(())
    }

    async fn open(&mut self) -> std::io::Result<()> {
        let path = self.dir.join(new_file_name());

        // Publish before creating so the uploader can never list an unclaimed file.
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(path.clone());

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => {
                tracing::debug!(file = %path.display(), "Opened data file");
                self.stats.files.fetch_add(1, Ordering::Relaxed);
                self.file = Some(BufWriter::new(file));
                Ok(())
            }
            Err(e) => {
                *self.current.write().unwrap_or_else(|e| e.into_inner()) = None;
                Err(e)
            }
        }
    }

    async fn rotate(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(e) = file.flush().await {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                tracing::error!(error = %e, "Flush failed");
            }
            if let Err(e) = file.get_mut().sync_all().await {
                tracing::warn!(error = %e, "Sync failed");
            }
        }
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}
