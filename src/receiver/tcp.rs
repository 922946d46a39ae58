//! Stream listener shared by the plaintext and pickle receivers.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::{ActiveGuard, Payload, PayloadSender, ReceiverKind, ReceiverStats, forward};

/// Plaintext bytes collected before a batch is handed to the parsers.
const MAX_PLAIN_BATCH: usize = 64 * 1024;

/// Longest accepted plaintext line. Longer lines are dropped up to the next newline.
const MAX_PLAIN_LINE: usize = 64 * 1024;

/// Largest accepted pickle frame.
const MAX_PICKLE_FRAME: usize = 1024 * 1024;

/// Pause after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub(super) async fn serve(
    listener: TcpListener,
    kind: ReceiverKind,
    payload_tx: PayloadSender,
    stats: Arc<ReceiverStats>,
    cancel: CancellationToken,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::trace!(%kind, %peer, "Connection accepted");
                    connections.spawn(handle_connection(
                        stream,
                        peer,
                        kind,
                        payload_tx.clone(),
                        Arc::clone(&stats),
                        cancel.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!(%kind, error = %e, "Accept failed");
                    stats.error();
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    connections.shutdown().await;
    tracing::debug!(%kind, "Listener closed");
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    kind: ReceiverKind,
    payload_tx: PayloadSender,
    stats: Arc<ReceiverStats>,
    cancel: CancellationToken,
) {
    let _active = ActiveGuard::new(&stats);
    let reader = BufReader::new(stream);

    let result = match kind {
        ReceiverKind::Pickle => read_pickle(reader, &payload_tx, &stats, &cancel).await,
        _ => read_plain(reader, &payload_tx, &stats, &cancel).await,
    };

    if let Err(e) = result {
        tracing::debug!(%kind, %peer, error = %e, "Connection closed with error");
        stats.error();
    }
}

async fn read_plain(
    mut reader: BufReader<TcpStream>,
    payload_tx: &PayloadSender,
    stats: &ReceiverStats,
    cancel: &CancellationToken,
) -> std::io::Result<()> {
    let mut batch = Vec::with_capacity(MAX_PLAIN_BATCH);
    // `batch[..line_start]` holds complete lines, the rest is the line being read.
    let mut line_start = 0;
    let mut discarding = false;

    loop {
        // Always positive: an unfinished line never reaches MAX_PLAIN_LINE.
        let limit = (MAX_PLAIN_LINE - (batch.len() - line_start)) as u64;
        let mut limited = (&mut reader).take(limit);
        let n = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = limited.read_until(b'\n', &mut batch) => read?,
        };

        let eof = n == 0;
        let complete = !eof && batch.last() == Some(&b'\n');
        if discarding {
            batch.truncate(line_start);
            discarding = !complete;
        } else if complete {
            line_start = batch.len();
        } else if batch.len() - line_start >= MAX_PLAIN_LINE {
            tracing::warn!(max = MAX_PLAIN_LINE, "Plaintext line too long, dropping it");
            stats.error();
            batch.truncate(line_start);
            discarding = true;
        }

        // Flush on EOF, on a full batch, or once the socket has nothing buffered.
        let ready = if eof { batch.len() } else { line_start };
        if ready > 0 && (eof || ready >= MAX_PLAIN_BATCH || reader.buffer().is_empty()) {
            let rest = batch.split_off(ready);
            let chunk = std::mem::replace(&mut batch, rest);
            batch.reserve(MAX_PLAIN_BATCH);
            line_start = 0;
            if !forward(payload_tx, Payload::Plain(chunk), cancel).await {
                return Ok(());
            }
        }
        if eof {
            return Ok(());
        }
    }
}

async fn read_pickle(
    mut reader: BufReader<TcpStream>,
    payload_tx: &PayloadSender,
    stats: &ReceiverStats,
    cancel: &CancellationToken,
) -> std::io::Result<()> {
    loop {
        let len = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            len = reader.read_u32() => match len {
                Ok(len) => len as usize,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            },
        };

        if len > MAX_PICKLE_FRAME {
            tracing::warn!(len, max = MAX_PICKLE_FRAME, "Pickle frame too large, closing connection");
            stats.error();
            return Ok(());
        }

        let mut frame = vec![0u8; len];
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            read = reader.read_exact(&mut frame) => { read?; }
        }

        if !forward(payload_tx, Payload::Pickle(frame), cancel).await {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn test_oversized_pickle_frame_closes_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(1);
        let stats = Arc::new(ReceiverStats::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(serve(
            listener,
            ReceiverKind::Pickle,
            tx,
            Arc::clone(&stats),
            cancel.clone(),
        ));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_u32((MAX_PICKLE_FRAME + 1) as u32).await.unwrap();

        // The server hangs up without reading a body.
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(stats.errors.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_plain_partial_last_line_is_flushed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(serve(
            listener,
            ReceiverKind::Tcp,
            tx,
            Arc::new(ReceiverStats::default()),
            cancel.clone(),
        ));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"no.newline 1 2").await.unwrap();
        client.shutdown().await.unwrap();

        let payload = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(payload, Payload::Plain(chunk) if chunk == b"no.newline 1 2"));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_plain_overlong_line_is_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        let stats = Arc::new(ReceiverStats::default());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(serve(
            listener,
            ReceiverKind::Tcp,
            tx,
            Arc::clone(&stats),
            cancel.clone(),
        ));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&vec![b'x'; MAX_PLAIN_LINE * 3])
            .await
            .unwrap();
        client.write_all(b" 1 2\nvalid.line 1 2\n").await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        while !received.ends_with(b"valid.line 1 2\n") {
            let payload = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            let Payload::Plain(chunk) = payload else {
                panic!("unexpected payload kind");
            };
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received, b"valid.line 1 2\n");

        cancel.cancel();
        task.await.unwrap();
        assert_eq!(stats.errors.load(std::sync::atomic::Ordering::Relaxed), 1);
    }
}
