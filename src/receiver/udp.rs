//! Datagram listener: every datagram carries one or more plaintext lines.

use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::{Payload, PayloadSender, ReceiverStats, forward};

/// Largest datagram read in one call.
const MAX_DATAGRAM: usize = 64 * 1024;

pub(super) async fn serve(
    socket: UdpSocket,
    payload_tx: PayloadSender,
    stats: Arc<ReceiverStats>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, _)) => n,
                Err(e) => {
                    tracing::debug!(error = %e, "UDP receive failed");
                    stats.error();
                    continue;
                }
            },
        };
        if n == 0 {
            continue;
        }

        if !forward(&payload_tx, Payload::Plain(buf[..n].to_vec()), &cancel).await {
            break;
        }
    }

    tracing::debug!("UDP listener closed");
}
