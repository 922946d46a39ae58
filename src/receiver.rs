//! Network receivers: Graphite plaintext over TCP and UDP, and the pickle
//! protocol over TCP.
//!
//! A receiver binds its socket in [`new`], so a returned [`Receiver`] is
//! already accepting traffic. Socket tasks only frame raw bytes; decoding
//! happens in a pool of parse workers that push encoded batches onto the
//! shared write channel.

mod pickle;
mod plain;
mod tcp;
mod udp;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::row::WriteBuffer;
use crate::writer::WriteSender;

pub use pickle::{PickleError, parse_points as parse_pickle};
pub use plain::{parse_chunk as parse_plain, parse_line};

/// Receiver flavour, selected by the DSN scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverKind {
    Tcp,
    Udp,
    Pickle,
}

impl ReceiverKind {
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            "pickle" => Some(Self::Pickle),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Pickle => "pickle",
        }
    }
}

impl fmt::Display for ReceiverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur while creating a receiver.
#[derive(Debug, Error)]
pub enum ReceiverError {
    #[error("unsupported receiver scheme '{0}'")]
    UnsupportedScheme(String),

    /// DSN is not of the form `scheme://host:port`.
    #[error("invalid receiver address '{0}'")]
    InvalidAddress(String),

    #[error("failed to bind {kind} receiver on '{addr}': {source}")]
    Bind {
        kind: ReceiverKind,
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Default)]
pub(crate) struct ReceiverStats {
    metrics_received: AtomicU64,
    errors: AtomicU64,
    active: AtomicU64,
}

impl ReceiverStats {
    pub(crate) fn error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Open connection marker; keeps the `active` gauge right even when a
/// connection task is aborted.
pub(crate) struct ActiveGuard(Arc<ReceiverStats>);

impl ActiveGuard {
    pub(crate) fn new(stats: &Arc<ReceiverStats>) -> Self {
        stats.active.fetch_add(1, Ordering::Relaxed);
        Self(Arc::clone(stats))
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Raw bytes handed from socket tasks to parse workers.
#[derive(Debug)]
pub(crate) enum Payload {
    Plain(Vec<u8>),
    Pickle(Vec<u8>),
}

pub(crate) type PayloadSender = mpsc::Sender<Payload>;
type SharedPayloadReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<Payload>>>;

/// Send `payload` unless the receiver is shutting down. Returns `false` when
/// the caller should stop producing.
pub(crate) async fn forward(
    tx: &PayloadSender,
    payload: Payload,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(payload) => sent.is_ok(),
    }
}

/// A started receiver.
pub struct Receiver {
    kind: ReceiverKind,
    local_addr: SocketAddr,
    stats: Arc<ReceiverStats>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for Receiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("kind", &self.kind)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

/// Split `scheme://addr`, expanding the `:port` shorthand to all interfaces.
fn parse_dsn(dsn: &str) -> Result<(ReceiverKind, String), ReceiverError> {
    let (scheme, addr) = dsn
        .split_once("://")
        .ok_or_else(|| ReceiverError::InvalidAddress(dsn.to_string()))?;
    let kind = ReceiverKind::from_scheme(scheme)
        .ok_or_else(|| ReceiverError::UnsupportedScheme(scheme.to_string()))?;

    if addr.is_empty() || !addr.contains(':') {
        return Err(ReceiverError::InvalidAddress(dsn.to_string()));
    }
    let addr = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    Ok((kind, addr))
}

/// Bind a receiver for `dsn` (`tcp://`, `udp://` or `pickle://`) and start
/// `parse_threads` parse workers feeding `write_tx`.
pub async fn new(
    dsn: &str,
    parse_threads: usize,
    write_tx: WriteSender,
) -> Result<Receiver, ReceiverError> {
    let (kind, addr) = parse_dsn(dsn)?;
    let bind_err = |source| ReceiverError::Bind {
        kind,
        addr: addr.clone(),
        source,
    };

    let stats = Arc::new(ReceiverStats::default());
    let cancel = CancellationToken::new();
    let parse_threads = parse_threads.max(1);
    let (payload_tx, payload_rx) = mpsc::channel(parse_threads);

    let (local_addr, socket_task) = match kind {
        ReceiverKind::Tcp | ReceiverKind::Pickle => {
            let listener = TcpListener::bind(&addr).await.map_err(bind_err)?;
            let local_addr = listener.local_addr().map_err(bind_err)?;
            let task = tokio::spawn(tcp::serve(
                listener,
                kind,
                payload_tx,
                Arc::clone(&stats),
                cancel.clone(),
            ));
            (local_addr, task)
        }
        ReceiverKind::Udp => {
            let socket = UdpSocket::bind(&addr).await.map_err(bind_err)?;
            let local_addr = socket.local_addr().map_err(bind_err)?;
            let task = tokio::spawn(udp::serve(
                socket,
                payload_tx,
                Arc::clone(&stats),
                cancel.clone(),
            ));
            (local_addr, task)
        }
    };

    let mut tasks = Vec::with_capacity(parse_threads + 1);
    tasks.push(socket_task);

    let payload_rx: SharedPayloadReceiver = Arc::new(tokio::sync::Mutex::new(payload_rx));
    for _ in 0..parse_threads {
        tasks.push(tokio::spawn(parse_worker(
            Arc::clone(&payload_rx),
            write_tx.clone(),
            Arc::clone(&stats),
            cancel.clone(),
        )));
    }

    tracing::info!(%kind, addr = %local_addr, parse_threads, "Receiver listening");

    Ok(Receiver {
        kind,
        local_addr,
        stats,
        cancel,
        tasks: Mutex::new(tasks),
    })
}

impl Receiver {
    pub fn kind(&self) -> ReceiverKind {
        self.kind
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        let tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        !tasks.is_empty() && tasks.iter().all(|h| !h.is_finished())
    }

    /// Stop every task and wait for them; the socket is closed on return.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(kind = %self.kind, error = %e, "Receiver task ended abnormally");
            }
        }
    }

    /// Report counters accumulated since the previous call.
    pub fn stat(&self, send: &mut dyn FnMut(&str, f64)) {
        send(
            "metricsReceived",
            self.stats.metrics_received.swap(0, Ordering::Relaxed) as f64,
        );
        send("errors", self.stats.errors.swap(0, Ordering::Relaxed) as f64);
        send("active", self.stats.active.load(Ordering::Relaxed) as f64);
    }
}

fn now_version() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or_default()
}

fn decode(payload: Payload, stats: &ReceiverStats) -> WriteBuffer {
    let version = now_version();
    let (buf, invalid) = match payload {
        Payload::Plain(chunk) => plain::parse_chunk(&chunk, version),
        Payload::Pickle(frame) => match pickle::parse_points(&frame) {
            Ok((points, invalid)) => {
                let mut buf = WriteBuffer::new();
                for point in &points {
                    buf.write_point(point, version);
                }
                (buf, invalid)
            }
            Err(e) => {
                tracing::debug!(error = %e, "Dropping undecodable pickle frame");
                (WriteBuffer::new(), 1)
            }
        },
    };

    stats
        .metrics_received
        .fetch_add(buf.points() as u64, Ordering::Relaxed);
    stats.errors.fetch_add(invalid as u64, Ordering::Relaxed);
    buf
}

async fn parse_worker(
    rx: SharedPayloadReceiver,
    write_tx: WriteSender,
    stats: Arc<ReceiverStats>,
    cancel: CancellationToken,
) {
    loop {
        let payload = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                payload = rx.recv() => payload,
            }
        };
        let Some(payload) = payload else { break };

        let buf = decode(payload, &stats);
        if buf.is_empty() {
            continue;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = write_tx.send(buf) => {
                if sent.is_err() {
                    tracing::debug!("Write channel closed, parse worker exiting");
                    break;
                }
            }
        }
    }
}
