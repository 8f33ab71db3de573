//! Receiver worker: socket to state machine.

use super::Shared;
use std::sync::Arc;
use std::time::Instant;

pub(crate) async fn run(shared: Arc<Shared>) {
    loop {
        let Some(datagram) = shared.io.recv().await else {
            // Socket closed underneath us; a quiet exit, not an error.
            tracing::debug!("receiver: transport gone, exiting");
            return;
        };

        let reply = {
            let mut conn = shared.conn.lock().await;
            conn.process_datagram(datagram, Instant::now());
            let reply = conn.take_close_datagram();
            shared.drain(&mut conn);
            if conn.is_closed() {
                return;
            }
            reply
        };

        // A packet that arrived while Closing gets one CONNECTION_CLOSE
        // back, already rate-limited by the state machine.
        if let Some(reply) = reply {
            let _ = shared.io.send(&reply).await;
        }
    }
}
