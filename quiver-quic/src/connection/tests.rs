//! Connection state-machine tests: packet exchange over Initial keys,
//! key-gated buffering, ACK scheduling, and the close/drain lifecycle.
//! Both endpoints derive Initial keys from the same DCID, so packets
//! flow without running a real TLS handshake.

use super::*;
use crate::packet::MIN_INITIAL_SIZE;
use crate::version::VERSION_1;
use bytes::Bytes;
use std::time::{Duration, Instant};

fn params() -> TransportParams {
    TransportParams {
        max_idle_timeout: 10_000,
        initial_max_data: 1 << 20,
        initial_max_stream_data_bidi_local: 1 << 18,
        initial_max_stream_data_bidi_remote: 1 << 18,
        initial_max_stream_data_uni: 1 << 17,
        initial_max_streams_bidi: 8,
        initial_max_streams_uni: 4,
        ..Default::default()
    }
}

fn pair() -> (Connection, Connection) {
    let odcid = ConnectionId::new(&[0xa1; 8]).unwrap();
    let c_scid = ConnectionId::new(&[0xb2; 8]).unwrap();
    let s_scid = ConnectionId::new(&[0xc3; 8]).unwrap();

    let client =
        Connection::new_client(VERSION_1, odcid, c_scid, params(), Bytes::new()).unwrap();
    let server =
        Connection::new_server(VERSION_1, odcid, s_scid, c_scid, params(), true).unwrap();
    (client, server)
}

fn flush(conn: &mut Connection, now: Instant) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    for item in conn.take_outputs() {
        out.extend(conn.assemble(item, now));
    }
    out
}

#[test]
fn client_initial_is_padded_and_carries_crypto_at_zero() {
    let (mut client, mut server) = pair();
    let now = Instant::now();

    client.queue_output(Output::Handshake {
        flights: vec![(Level::Initial, Bytes::from_static(b"client hello"))],
    });
    let datagrams = flush(&mut client, now);
    assert_eq!(datagrams.len(), 1);
    assert!(datagrams[0].len() >= MIN_INITIAL_SIZE, "client Initial must fill 1200");

    server.process_datagram(Bytes::from(datagrams.into_iter().next().unwrap()), now);
    let crypto = server.take_crypto_ready();
    assert_eq!(crypto.len(), 1);
    assert_eq!(crypto[0].0, Level::Initial);
    assert_eq!(crypto[0].1.as_ref(), b"client hello");
    assert_eq!(server.stats.recv_initial, 1);
}

#[test]
fn initial_receipt_schedules_immediate_ack() {
    let (mut client, mut server) = pair();
    let now = Instant::now();

    client.queue_output(Output::Handshake {
        flights: vec![(Level::Initial, Bytes::from_static(b"hello"))],
    });
    for d in flush(&mut client, now) {
        server.process_datagram(Bytes::from(d), now);
    }

    // Handshake-level receipts are acked without delay: an ACK flush
    // item must be queued already.
    let acks = flush(&mut server, now);
    assert!(!acks.is_empty(), "server should emit an Initial ACK");

    for d in acks {
        client.process_datagram(Bytes::from(d), now + Duration::from_millis(5));
    }
    assert_eq!(
        client.recovery.bytes_in_flight(),
        0,
        "client Initial acknowledged"
    );
}

#[test]
fn packets_before_keys_are_buffered_and_released() {
    let (mut client, mut server) = pair();
    let now = Instant::now();
    let secret = [0x42u8; 32];

    client.on_write_secret(Level::OneRtt, 0x1301, &secret).unwrap();
    client.queue_output(Output::Control { level: Level::OneRtt, frames: vec![Frame::Ping] });
    let datagrams = flush(&mut client, now);
    assert_eq!(datagrams.len(), 1);

    // Server has no 1-RTT keys yet: the packet parks, nothing processed.
    server.process_datagram(Bytes::from(datagrams.into_iter().next().unwrap()), now);
    assert_eq!(server.stats.recv_1rtt, 0);

    // Key install replays the buffered packet through the normal path.
    server.on_read_secret(Level::OneRtt, 0x1301, &secret, now).unwrap();
    assert_eq!(server.stats.recv_1rtt, 1);
}

#[test]
fn undecryptable_packets_drop_silently() {
    let (mut client, mut server) = pair();
    let now = Instant::now();

    client.queue_output(Output::Control { level: Level::Initial, frames: vec![Frame::Ping] });
    let mut datagrams = flush(&mut client, now);
    let mut mangled = datagrams.pop().unwrap();
    let last = mangled.len() - 1;
    mangled[last] ^= 0x5a;

    server.process_datagram(Bytes::from(mangled), now);
    assert_eq!(server.stats.recv_initial, 0);
    assert_eq!(server.stats.packets_dropped, 1);
    assert!(server.take_events().is_empty(), "silent drop must raise nothing");
}

#[test]
fn duplicate_packets_processed_once() {
    let (mut client, mut server) = pair();
    let now = Instant::now();

    client.queue_output(Output::Handshake {
        flights: vec![(Level::Initial, Bytes::from_static(b"dup"))],
    });
    let datagrams = flush(&mut client, now);
    let datagram = Bytes::from(datagrams.into_iter().next().unwrap());

    server.process_datagram(datagram.clone(), now);
    server.process_datagram(datagram, now);

    assert_eq!(server.stats.recv_initial, 1, "replay must not process twice");
    assert_eq!(server.take_crypto_ready().len(), 1);
}

#[test]
fn retransmit_uses_fresh_packet_number() {
    let (mut client, _) = pair();
    let now = Instant::now();

    client.queue_output(Output::Control { level: Level::Initial, frames: vec![Frame::Ping] });
    flush(&mut client, now);

    // Fire enough PTOs to retransmit; the new probe must carry a new
    // packet number (numbers are never reused).
    let deadline = client.next_timeout().expect("PTO armed");
    client.on_timeout(deadline);
    let probes = flush(&mut client, deadline);
    assert!(!probes.is_empty());
    assert_eq!(client.stats.sent_initial, 2);
}

#[test]
fn peer_close_enters_draining_then_closed() {
    let (mut client, mut server) = pair();
    let now = Instant::now();

    client.start_close(
        Error::Application { code: 7, reason: Bytes::from_static(b"done") },
        now,
    );
    assert_eq!(client.state(), ConnectionState::Closing);
    let close = client.close_datagram(now).expect("close datagram");

    server.process_datagram(Bytes::from(close), now);
    assert_eq!(server.state(), ConnectionState::Draining);
    assert!(server
        .take_events()
        .iter()
        .any(|e| matches!(e, Event::Closed { .. })));

    // No traffic while draining.
    server.queue_output(Output::Control { level: Level::Initial, frames: vec![Frame::Ping] });
    assert!(flush(&mut server, now).is_empty());

    let deadline = server.next_timeout().expect("drain timer");
    server.on_timeout(deadline);
    assert_eq!(server.state(), ConnectionState::Closed);
}

#[test]
fn closing_answers_with_rate_limited_close() {
    let (mut client, mut server) = pair();
    let now = Instant::now();

    server.start_close(Error::transport(TransportErrorCode::NoError, ""), now);
    let _ = server.close_datagram(now);

    client.queue_output(Output::Control { level: Level::Initial, frames: vec![Frame::Ping] });
    let datagrams = flush(&mut client, now);

    // First straggler gets a reply, an immediate second does not.
    server.process_datagram(Bytes::from(datagrams[0].clone()), now + Duration::from_millis(200));
    assert!(server.take_close_datagram().is_some());
    server.process_datagram(Bytes::from(datagrams[0].clone()), now + Duration::from_millis(210));
    assert!(server.take_close_datagram().is_none());
}

#[test]
fn idle_timeout_closes_silently() {
    let (mut client, _) = pair();
    let now = Instant::now();

    client.queue_output(Output::Control { level: Level::Initial, frames: vec![Frame::Ping] });
    flush(&mut client, now);

    // Idle deadline armed by the send; expiry closes with no frame.
    let deadline = now + Duration::from_millis(10_000);
    client.on_timeout(deadline);
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(client
        .take_events()
        .iter()
        .any(|e| matches!(e, Event::Closed { error: Error::ConnectionClosed })));
}

#[test]
fn no_new_data_after_closing() {
    let (mut client, _) = pair();
    let now = Instant::now();
    client.start_close(Error::transport(TransportErrorCode::NoError, ""), now);

    assert!(matches!(
        client.stream_write(StreamId(0), Bytes::from_static(b"x"), false),
        Err(Error::ConnectionClosed)
    ));
    assert!(matches!(client.open_stream(StreamDir::Bidi), Err(Error::ConnectionClosed)));
}

#[test]
fn version_negotiation_surfaces_next_version() {
    let (mut client, _) = pair();
    let now = Instant::now();

    let vn = crate::packet::header::version_negotiation(
        &client.local_cid(),
        &ConnectionId::new(&[9; 8]).unwrap(),
        &[0xdead_beef, 0xff00_001d],
    );
    client.process_datagram(Bytes::from(vn), now);

    assert_eq!(client.state(), ConnectionState::Closed);
    match client.close_error() {
        Some(Error::NextVersion(v)) => assert_eq!(*v, 0xff00_001d),
        other => panic!("expected NextVersion, got {other:?}"),
    }
}

#[test]
fn vn_listing_current_version_ignored() {
    let (mut client, _) = pair();
    let now = Instant::now();

    let vn = crate::packet::header::version_negotiation(
        &client.local_cid(),
        &ConnectionId::new(&[9; 8]).unwrap(),
        &[VERSION_1],
    );
    client.process_datagram(Bytes::from(vn), now);
    assert_eq!(client.state(), ConnectionState::Handshaking);
}

#[test]
fn stream_data_round_trip_over_1rtt() {
    let (mut client, mut server) = pair();
    let now = Instant::now();
    let secret_c = [0x11u8; 32];
    let secret_s = [0x22u8; 32];

    // Install symmetric 1-RTT keys by hand and exchange parameters.
    client.on_write_secret(Level::OneRtt, 0x1301, &secret_c).unwrap();
    client.on_read_secret(Level::OneRtt, 0x1301, &secret_s, now).unwrap();
    server.on_write_secret(Level::OneRtt, 0x1301, &secret_s).unwrap();
    server.on_read_secret(Level::OneRtt, 0x1301, &secret_c, now).unwrap();

    let mut server_params = params();
    server_params.original_destination_connection_id = Some(ConnectionId::new(&[0xa1; 8]).unwrap());
    server_params.initial_source_connection_id = Some(client.remote_cid());
    client.apply_peer_params(Bytes::from(server_params.encode())).unwrap();

    let mut client_params = params();
    client_params.initial_source_connection_id = Some(server.remote_cid());
    server.apply_peer_params(Bytes::from(client_params.encode())).unwrap();

    let id = client.open_stream(StreamDir::Bidi).unwrap();
    client.stream_write(id, Bytes::from_static(b"ping over quic"), true).unwrap();
    for d in flush(&mut client, now) {
        server.process_datagram(Bytes::from(d), now);
    }

    let events = server.take_events();
    assert!(events.iter().any(|e| matches!(e, Event::StreamOpened { id: sid } if *sid == id)));
    let (data, fin) = server.stream_read(id, 4096).unwrap().expect("data ready");
    assert_eq!(data.as_ref(), b"ping over quic");
    assert!(fin);
}
