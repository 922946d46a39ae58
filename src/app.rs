//! Process-lifecycle supervisor.
//!
//! [`App`] owns every subsystem under one lock: the writer, the uploader, up to
//! three receivers and the self-metrics collector. Startup is all-or-nothing;
//! a failure part way through stops whatever was already started. Shutdown is
//! ordered (listeners, collector, writer, uploader) and idempotent.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::collector::{Collector, CollectorOptions, Endpoint};
use crate::concurrency;
use crate::config::{Config, ConfigError};
use crate::receiver::{self, Receiver, ReceiverError, ReceiverKind};
use crate::uploader::{Uploader, UploaderBuilder, UploaderError};
use crate::writer::{WriteSender, Writer, WriterError, write_channel};

/// Errors returned by [`App`] operations.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("writer: {0}")]
    Writer(#[from] WriterError),

    #[error("uploader: {0}")]
    Uploader(#[from] UploaderError),

    #[error("receiver: {0}")]
    Receiver(#[from] ReceiverError),

    #[error("app is already running")]
    AlreadyRunning,
}

/// Lifecycle state of the supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AppState {
    /// No configuration has been resolved yet.
    #[default]
    Unconfigured,
    /// Configuration resolved, nothing running.
    Configured,
    Running,
    /// Stopped after running; may be started again.
    Stopped,
}

/// Snapshot of which components are live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppStatus {
    pub state: AppState,
    pub writer: bool,
    pub uploader: bool,
    pub tcp: bool,
    pub udp: bool,
    pub pickle: bool,
    pub collector: bool,
    /// Exit signal armed (a `run_loop` would block).
    pub exit_pending: bool,
}

#[derive(Default)]
struct AppInner {
    state: AppState,
    config: Option<Arc<Config>>,
    writer: Option<Writer>,
    uploader: Option<Uploader>,
    tcp: Option<Receiver>,
    udp: Option<Receiver>,
    pickle: Option<Receiver>,
    collector: Option<Collector>,
    write_tx: Option<WriteSender>,
    exit: Option<CancellationToken>,
}

impl AppInner {
    fn receiver_slot(&mut self, kind: ReceiverKind) -> &mut Option<Receiver> {
        match kind {
            ReceiverKind::Tcp => &mut self.tcp,
            ReceiverKind::Udp => &mut self.udp,
            ReceiverKind::Pickle => &mut self.pickle,
        }
    }

    /// Stop everything that is running, in shutdown order.
    ///
    /// Every handle is taken before it is stopped, so calling this again is a
    /// no-op. Also used to roll back a failed start.
    async fn stop_all(&mut self) {
        for kind in [ReceiverKind::Tcp, ReceiverKind::Pickle, ReceiverKind::Udp] {
            if let Some(receiver) = self.receiver_slot(kind).take() {
                receiver.stop().await;
                tracing::debug!(module = %kind, "finished");
            }
        }

        if let Some(collector) = self.collector.take() {
            collector.stop().await;
            tracing::debug!(module = "collector", "finished");
        }

        if let Some(writer) = self.writer.take() {
            writer.stop().await;
            tracing::debug!(module = "writer", "finished");
        }

        if let Some(uploader) = self.uploader.take() {
            uploader.stop().await;
            tracing::debug!(module = "uploader", "finished");
        }

        self.write_tx = None;

        if let Some(exit) = self.exit.take() {
            exit.cancel();
        }

        if self.state == AppState::Running {
            self.state = AppState::Stopped;
        }
    }
}

/// The supervisor.
pub struct App {
    config_path: PathBuf,
    this: Weak<App>,
    inner: RwLock<AppInner>,
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("config_path", &self.config_path)
            .finish_non_exhaustive()
    }
}

impl App {
    /// Create a supervisor for the configuration file at `config_path`.
    /// Nothing is read until [`App::parse_config`] or [`App::start`].
    pub fn new(config_path: impl AsRef<Path>) -> Arc<Self> {
        let config_path = config_path.as_ref().to_path_buf();
        Arc::new_cyclic(|this| Self {
            config_path,
            this: this.clone(),
            inner: RwLock::new(AppInner::default()),
        })
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Load and validate the configuration file, replacing the current
    /// configuration only on success.
    pub async fn parse_config(&self) -> Result<(), AppError> {
        let mut inner = self.inner.write().await;
        self.configure(&mut inner)?;
        Ok(())
    }

    fn configure(&self, inner: &mut AppInner) -> Result<Arc<Config>, ConfigError> {
        let config = Arc::new(Config::load(&self.config_path)?);
        inner.config = Some(Arc::clone(&config));
        if inner.state == AppState::Unconfigured {
            inner.state = AppState::Configured;
        }
        tracing::debug!(path = %self.config_path.display(), "Configuration loaded");
        Ok(config)
    }

    /// Re-read the configuration and start every enabled component.
    ///
    /// On error nothing is left running.
    pub async fn start(&self) -> Result<(), AppError> {
        let mut inner = self.inner.write().await;
        if inner.state == AppState::Running {
            return Err(AppError::AlreadyRunning);
        }

        let config = self.configure(&mut inner)?;

        if let Err(e) = self.start_locked(&mut inner, &config).await {
            tracing::error!(error = %e, "Startup failed, stopping started components");
            inner.stop_all().await;
            return Err(e);
        }

        tracing::info!(
            tcp = inner.tcp.is_some(),
            udp = inner.udp.is_some(),
            pickle = inner.pickle.is_some(),
            "Started"
        );
        Ok(())
    }

    async fn start_locked(&self, inner: &mut AppInner, config: &Config) -> Result<(), AppError> {
        concurrency::set_max_cpu(config.common.max_cpu);

        let (write_tx, write_rx) = write_channel();
        inner.write_tx = Some(write_tx.clone());
        inner.exit = Some(CancellationToken::new());
        inner.state = AppState::Running;

        let mut writer = Writer::new(write_rx, &config.data.path, config.data.file_interval);
        writer.start().await?;
        let in_progress = writer.in_progress_fn();
        inner.writer = Some(writer);

        let ch = &config.clickhouse;
        let uploader = UploaderBuilder::new(&config.data.path)
            .clickhouse(&ch.url)
            .data_tables(ch.upload_data_tables())
            .reverse_data_tables(ch.reverse_data_tables.clone())
            .data_timeout(ch.data_timeout)
            .tree_table(&ch.tree_table)
            .reverse_tree_table(&ch.reverse_tree_table)
            .tree_date(ch.tree_date()?)
            .tree_timeout(ch.tree_timeout)
            .in_progress(in_progress)
            .threads(ch.threads)
            .build()?;
        uploader.start();
        inner.uploader = Some(uploader);

        let parse_threads = concurrency::parse_threads();
        let listeners = [
            (ReceiverKind::Tcp, &config.tcp),
            (ReceiverKind::Udp, &config.udp),
            (ReceiverKind::Pickle, &config.pickle),
        ];
        for (kind, listener) in listeners {
            if !listener.enabled {
                continue;
            }
            let dsn = format!("{kind}://{}", listener.listen);
            let receiver = receiver::new(&dsn, parse_threads, write_tx.clone()).await?;
            *inner.receiver_slot(kind) = Some(receiver);
        }

        let options = CollectorOptions {
            prefix: config.common.metric_prefix.clone(),
            endpoint: Endpoint::parse(&config.common.metric_endpoint)?,
            interval: config.common.metric_interval,
        };
        inner.collector = Some(Collector::new(self.this.clone(), options, write_tx));

        Ok(())
    }

    /// Stop every component. Safe to call repeatedly and concurrently.
    pub async fn stop(&self) {
        let mut inner = self.inner.write().await;
        inner.stop_all().await;
        tracing::info!("Stopped");
    }

    /// Block until the app is stopped. Returns immediately when not running.
    pub async fn run_loop(&self) {
        let exit = self.inner.read().await.exit.clone();
        if let Some(exit) = exit {
            exit.cancelled().await;
        }
    }

    /// Ask the uploader to forget its tree cache. The clear runs in the
    /// background; without an uploader this does nothing.
    pub async fn clear_tree_exists_cache(&self) {
        let uploader = self.inner.write().await.uploader.clone();
        if let Some(uploader) = uploader {
            tokio::spawn(async move { uploader.clear_tree_exists_cache().await });
        }
    }

    /// Current configuration snapshot.
    pub async fn config(&self) -> Option<Arc<Config>> {
        self.inner.read().await.config.clone()
    }

    pub async fn status(&self) -> AppStatus {
        let inner = self.inner.read().await;
        AppStatus {
            state: inner.state,
            writer: inner.writer.is_some(),
            uploader: inner.uploader.is_some(),
            tcp: inner.tcp.is_some(),
            udp: inner.udp.is_some(),
            pickle: inner.pickle.is_some(),
            collector: inner.collector.is_some(),
            exit_pending: inner.exit.is_some(),
        }
    }

    /// Walk the counters of every live component, named `<module>.<metric>`.
    pub async fn stats<F>(&self, send: &mut F)
    where
        F: FnMut(&str, f64) + Send,
    {
        let inner = self.inner.read().await;

        if let Some(writer) = &inner.writer {
            writer.stat(&mut prefixed("writer", send));
        }
        if let Some(uploader) = &inner.uploader {
            uploader.stat(&mut prefixed("uploader", send));
        }
        for receiver in [&inner.tcp, &inner.udp, &inner.pickle].into_iter().flatten() {
            receiver.stat(&mut prefixed(receiver.kind().as_str(), send));
        }
    }
}

fn prefixed<'a, F>(module: &'a str, send: &'a mut F) -> impl FnMut(&str, f64) + 'a
where
    F: FnMut(&str, f64),
{
    move |name: &str, value: f64| send(&format!("{module}.{name}"), value)
}
