//! Retransmit/timer worker: wakes on the earliest of the loss-detection
//! timer, PTO, delayed-ACK timer, idle timer, and the drain deadline.

use super::Shared;
use std::sync::Arc;
use std::time::Instant;

pub(crate) async fn run(shared: Arc<Shared>) {
    loop {
        // Register for wakeups before reading the deadline so a state
        // change between the two cannot be lost.
        let rearm = shared.activity.notified();

        let deadline = {
            let conn = shared.conn.lock().await;
            if conn.is_closed() {
                return;
            }
            conn.next_timeout()
        };

        tokio::select! {
            _ = rearm => continue,
            _ = sleep_until(deadline) => {}
        }

        let mut conn = shared.conn.lock().await;
        conn.on_timeout(Instant::now());
        shared.drain(&mut conn);
        if conn.is_closed() {
            return;
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}
