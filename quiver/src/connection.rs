//! Application-facing connection handle.
//!
//! A cheap clone over the shared per-connection state; reads and
//! writes lock the record briefly and park on the activity notifier
//! when they must wait.

use crate::runtime::{Shared, WorkerSet};
use bytes::Bytes;
use quiver_quic::connection::Event;
use quiver_quic::error::{Error, Result};
use quiver_quic::{ConnStats, ConnectionState, StreamDir, StreamId};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};

/// Handle to a live QUIC connection.
pub struct Connection {
    shared: Arc<Shared>,
    events: Mutex<mpsc::UnboundedReceiver<Event>>,
    /// Workers die with the last handle.
    _workers: Arc<WorkerSet>,
}

impl Connection {
    pub(crate) fn new(
        shared: Arc<Shared>,
        events: mpsc::UnboundedReceiver<Event>,
        workers: WorkerSet,
    ) -> Self {
        Self { shared, events: Mutex::new(events), _workers: Arc::new(workers) }
    }

    /// Waits until the handshake finishes (or fails).
    pub async fn established(&self) -> Result<()> {
        loop {
            let notified = self.shared.activity.notified();
            {
                let conn = self.shared.conn.lock().await;
                match conn.state() {
                    ConnectionState::Established => return Ok(()),
                    ConnectionState::Closing
                    | ConnectionState::Draining
                    | ConnectionState::Closed => {
                        return Err(conn
                            .close_error()
                            .cloned()
                            .unwrap_or(Error::ConnectionClosed));
                    }
                    _ => {}
                }
            }
            notified.await;
        }
    }

    /// Opens a locally initiated bidirectional stream.
    pub async fn open_bi(&self) -> Result<StreamId> {
        let mut conn = self.shared.conn.lock().await;
        let id = conn.open_stream(StreamDir::Bidi)?;
        self.shared.drain(&mut conn);
        Ok(id)
    }

    /// Opens a locally initiated unidirectional stream.
    pub async fn open_uni(&self) -> Result<StreamId> {
        let mut conn = self.shared.conn.lock().await;
        let id = conn.open_stream(StreamDir::Uni)?;
        self.shared.drain(&mut conn);
        Ok(id)
    }

    /// Queues stream data; `fin` closes our sending side after it.
    pub async fn write(&self, id: StreamId, data: Bytes, fin: bool) -> Result<()> {
        let mut conn = self.shared.conn.lock().await;
        conn.stream_write(id, data, fin)?;
        self.shared.drain(&mut conn);
        Ok(())
    }

    /// Reads the next ordered chunk from a stream, waiting if none is
    /// buffered. `Ok(None)` is end of stream.
    pub async fn read(&self, id: StreamId) -> Result<Option<Bytes>> {
        loop {
            let notified = self.shared.activity.notified();
            {
                let mut conn = self.shared.conn.lock().await;
                match conn.stream_read(id, 64 * 1024) {
                    Ok(Some((data, _fin))) => {
                        self.shared.drain(&mut conn);
                        return Ok(Some(data));
                    }
                    Ok(None) => {
                        if conn.stream_at_eof(id) {
                            return Ok(None);
                        }
                    }
                    Err(err) => return Err(err),
                }
            }
            notified.await;
        }
    }

    /// Resets our sending side of a stream.
    pub async fn reset(&self, id: StreamId, error_code: u64) -> Result<()> {
        let mut conn = self.shared.conn.lock().await;
        conn.stream_reset(id, error_code)?;
        self.shared.drain(&mut conn);
        Ok(())
    }

    /// Next peer-initiated stream.
    pub async fn accept_stream(&self) -> Option<StreamId> {
        let mut events = self.events.lock().await;
        while let Some(event) = events.recv().await {
            match event {
                Event::StreamOpened { id } => return Some(id),
                Event::Closed { .. } => return None,
                _ => {}
            }
        }
        None
    }

    /// Next raw connection event; mostly useful for tests and tooling.
    pub async fn next_event(&self) -> Option<Event> {
        self.events.lock().await.recv().await
    }

    /// Initiates a 1-RTT key update (RFC 9001 Section 6).
    pub async fn rekey(&self) -> Result<()> {
        let mut conn = self.shared.conn.lock().await;
        let pto = conn.recovery.pto_base();
        conn.crypto.initiate_key_update(Instant::now(), pto)
    }

    /// Closes with an application error and waits out the drain.
    pub async fn close(&self, error_code: u64, reason: &[u8]) {
        {
            let mut conn = self.shared.conn.lock().await;
            conn.start_close(
                Error::Application {
                    code: error_code,
                    reason: Bytes::copy_from_slice(reason),
                },
                Instant::now(),
            );
            self.shared.drain(&mut conn);
        }
        self.closed().await;
    }

    /// Resolves once the connection reaches its terminal state.
    pub async fn closed(&self) {
        loop {
            let notified = self.shared.activity.notified();
            if self.shared.conn.lock().await.is_closed() {
                return;
            }
            notified.await;
        }
    }

    pub async fn stats(&self) -> ConnStats {
        self.shared.conn.lock().await.stats
    }

    pub async fn state(&self) -> ConnectionState {
        self.shared.conn.lock().await.state()
    }

    /// Terminal error, once there is one.
    pub async fn close_reason(&self) -> Option<Error> {
        self.shared.conn.lock().await.close_error().cloned()
    }
}
