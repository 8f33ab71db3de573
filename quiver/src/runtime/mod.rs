//! The per-connection worker set.
//!
//! Five cooperative tasks share one connection record through an async
//! mutex: receiver, sender, retransmit/timer, handshake driver, and
//! closer. Tasks communicate over FIFO queues and never own the record;
//! teardown cancels them in reverse creation order once the state
//! machine reaches Closed.

mod closer;
mod handshake;
mod receiver;
mod sender;
mod timer;

use crate::socket::DatagramIo;
use bytes::Bytes;
use quiver_quic::connection::{Connection, Event, Output};
use quiver_quic::crypto::Level;
use quiver_quic::tls::TlsSession;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

/// State shared by the worker tasks and the application handle.
pub(crate) struct Shared {
    pub conn: Mutex<Connection>,
    pub io: DatagramIo,

    /// Sender worker's queue of Control / Handshake / Retransmit /
    /// Stream items.
    pub output_tx: mpsc::UnboundedSender<Output>,

    /// Reassembled CRYPTO bytes for the handshake driver.
    pub crypto_tx: mpsc::UnboundedSender<(Level, Bytes)>,

    /// Application-facing events.
    pub event_tx: mpsc::UnboundedSender<Event>,

    /// Pinged whenever connection state changed: timers re-arm, blocked
    /// readers re-check.
    pub activity: Notify,

    /// Wakes the closer when a close is initiated or observed.
    pub close_signal: Notify,
}

impl Shared {
    /// Moves everything the last connection mutation produced into the
    /// worker queues. Must be called before the lock drops so queue
    /// order matches mutation order.
    pub fn drain(&self, conn: &mut Connection) {
        for item in conn.take_outputs() {
            let _ = self.output_tx.send(item);
        }
        for chunk in conn.take_crypto_ready() {
            let _ = self.crypto_tx.send(chunk);
        }
        for event in conn.take_events() {
            if matches!(event, Event::Closed { .. }) {
                self.close_signal.notify_waiters();
            }
            let _ = self.event_tx.send(event);
        }
        if conn.state() >= quiver_quic::ConnectionState::Closing {
            self.close_signal.notify_waiters();
        }
        self.activity.notify_waiters();
    }
}

/// Handles for the five workers, aborted in reverse creation order.
pub(crate) struct WorkerSet {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerSet {
    pub fn abort_all(&mut self) {
        while let Some(handle) = self.handles.pop() {
            handle.abort();
        }
    }
}

impl Drop for WorkerSet {
    fn drop(&mut self) {
        self.abort_all();
    }
}

/// Spawns the worker set for a freshly constructed connection.
pub(crate) fn spawn(
    conn: Connection,
    io: DatagramIo,
    tls: TlsSession,
) -> (Arc<Shared>, mpsc::UnboundedReceiver<Event>, WorkerSet) {
    let (output_tx, output_rx) = mpsc::unbounded_channel();
    let (crypto_tx, crypto_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let shared = Arc::new(Shared {
        conn: Mutex::new(conn),
        io,
        output_tx,
        crypto_tx,
        event_tx,
        activity: Notify::new(),
        close_signal: Notify::new(),
    });

    let handles = vec![
        tokio::spawn(receiver::run(shared.clone())),
        tokio::spawn(sender::run(shared.clone(), output_rx)),
        tokio::spawn(timer::run(shared.clone())),
        tokio::spawn(handshake::run(shared.clone(), tls, crypto_rx)),
        tokio::spawn(closer::run(shared.clone())),
    ];

    (shared, event_rx, WorkerSet { handles })
}
