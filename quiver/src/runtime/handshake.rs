//! Handshake driver: owns the TLS 1.3 state machine and couples it to
//! the connection's crypto streams.
//!
//! Each step feeds reassembled CRYPTO bytes into TLS and applies what
//! comes back: handshake bytes to send, new traffic secrets (installed
//! before the level advances, releasing any buffered packets), the
//! peer's transport parameters, completion, or an alert.

use super::Shared;
use bytes::Bytes;
use quiver_quic::connection::{Connection, Output};
use quiver_quic::crypto::Level;
use quiver_quic::error::{Error, Result};
use quiver_quic::tls::{KeyEvent, TlsSession, TlsStep};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

pub(crate) async fn run(
    shared: Arc<Shared>,
    mut tls: TlsSession,
    mut crypto_rx: mpsc::UnboundedReceiver<(Level, Bytes)>,
) {
    // The client's opening step produces the ClientHello flight.
    match tls.start() {
        Ok(step) => {
            let mut conn = shared.conn.lock().await;
            if let Err(err) = apply_step(&mut conn, step, Instant::now()) {
                fail(&shared, &mut conn, err);
                return;
            }
            shared.drain(&mut conn);
        }
        Err(err) => {
            let mut conn = shared.conn.lock().await;
            fail(&shared, &mut conn, err);
            return;
        }
    }

    while let Some((level, data)) = crypto_rx.recv().await {
        let step = tls.drive(level, &data);

        let mut conn = shared.conn.lock().await;
        match step.and_then(|s| apply_step(&mut conn, s, Instant::now())) {
            Ok(()) => {
                shared.drain(&mut conn);
                if conn.is_closed() {
                    return;
                }
            }
            Err(err) => {
                fail(&shared, &mut conn, err);
                return;
            }
        }
    }
}

/// Applies one TLS step to the connection. Keys install before the
/// level advance releases buffered packets, and outgoing handshake
/// bytes queue after both.
fn apply_step(conn: &mut Connection, step: TlsStep, now: Instant) -> Result<()> {
    for key in step.keys {
        match key {
            KeyEvent::WriteSecret { level, suite, secret } => {
                conn.on_write_secret(level, suite, &secret)?;
            }
            KeyEvent::ReadSecret { level, suite, secret } => {
                conn.on_read_secret(level, suite, &secret, now)?;
            }
        }
    }

    if let Some(params) = step.peer_params {
        conn.apply_peer_params(params)?;
    }

    if !step.outgoing.is_empty() {
        conn.queue_output(Output::Handshake { flights: step.outgoing });
    }

    if let Some(alert) = step.alert {
        return Err(Error::HandshakeFailed(alert));
    }

    if step.handshake_done {
        tracing::info!("TLS handshake complete");
        conn.on_handshake_complete();
    }
    Ok(())
}

fn fail(shared: &Shared, conn: &mut Connection, err: Error) {
    tracing::warn!(?err, "handshake failed");
    conn.start_close(err, Instant::now());
    shared.drain(conn);
}
