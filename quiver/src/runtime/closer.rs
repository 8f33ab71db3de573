//! Closer worker: emits CONNECTION_CLOSE when a close is initiated and
//! sits out the drain period. The drain deadline itself fires on the
//! timer worker; this task only handles the sending side.

use super::Shared;
use std::sync::Arc;
use std::time::Instant;

pub(crate) async fn run(shared: Arc<Shared>) {
    loop {
        let signal = shared.close_signal.notified();

        let close = {
            let mut conn = shared.conn.lock().await;
            if conn.is_closed() {
                return;
            }
            conn.close_datagram(Instant::now())
        };

        match close {
            Some(datagram) => {
                let _ = shared.io.send(&datagram).await;
            }
            None => {
                // Not closing yet (or draining: nothing to send).
                signal.await;
            }
        }
    }
}
