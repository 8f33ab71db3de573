//! Sender worker: drains the output queue, assembles coalesced
//! datagrams, and writes them to the socket.

use super::Shared;
use quiver_quic::connection::Output;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

pub(crate) async fn run(shared: Arc<Shared>, mut output_rx: mpsc::UnboundedReceiver<Output>) {
    while let Some(item) = output_rx.recv().await {
        let datagrams = {
            let mut conn = shared.conn.lock().await;
            let datagrams = conn.assemble(item, Instant::now());
            // Assembly can park stream data or raise retransmits.
            shared.drain(&mut conn);
            datagrams
        };

        for datagram in datagrams {
            if let Err(err) = shared.io.send(&datagram).await {
                tracing::debug!(?err, "sender: socket write failed");
                return;
            }
        }
    }
    // Queue closed: the connection handle and workers are going away.
}
