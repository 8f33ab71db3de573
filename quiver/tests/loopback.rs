//! End-to-end loopback tests: a real client and server over UDP on
//! 127.0.0.1, with a self-signed certificate generated on the fly.

use bytes::Bytes;
use quiver::{connect, serve, ClientConfig, Connection, ServerConfig};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quiver=info".into()),
        )
        .try_init();
}

fn self_signed_identity() -> (Bytes, Bytes) {
    use boring::asn1::Asn1Time;
    use boring::bn::BigNum;
    use boring::hash::MessageDigest;
    use boring::nid::Nid;
    use boring::pkey::PKey;
    use boring::rsa::Rsa;
    use boring::x509::{X509Builder, X509NameBuilder};

    let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, "localhost").unwrap();
    let name = name.build();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::days_from_now(7).unwrap()).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    let cert = builder.build();

    (
        Bytes::from(cert.to_pem().unwrap()),
        Bytes::from(key.private_key_to_pem_pkcs8().unwrap()),
    )
}

fn server_config() -> ServerConfig {
    let (cert, key) = self_signed_identity();
    let mut config = ServerConfig::new(cert, key);
    config.alpn = vec![b"echo".to_vec()];
    config
}

fn client_config() -> ClientConfig {
    ClientConfig { alpn: vec![b"echo".to_vec()], ..Default::default() }
}

/// Serves echo connections until the listener drops: every stream's
/// bytes come straight back with FIN.
async fn run_echo_server(mut server: quiver::Server) {
    while let Some(conn) = server.accept().await {
        tokio::spawn(async move {
            if conn.established().await.is_err() {
                return;
            }
            while let Some(id) = conn.accept_stream().await {
                let mut buf = Vec::new();
                while let Ok(Some(chunk)) = conn.read(id).await {
                    buf.extend_from_slice(&chunk);
                }
                let _ = conn.write(id, Bytes::from(buf), true).await;
            }
        });
    }
}

async fn echo_roundtrip(conn: &Connection, payload: &[u8]) -> Vec<u8> {
    let id = conn.open_bi().await.unwrap();
    conn.write(id, Bytes::copy_from_slice(payload), true).await.unwrap();
    let mut echoed = Vec::new();
    while let Some(chunk) = conn.read(id).await.unwrap() {
        echoed.extend_from_slice(&chunk);
    }
    echoed
}

#[tokio::test(flavor = "multi_thread")]
async fn handshake_echo_and_clean_close() {
    init_logging();
    let server = serve("127.0.0.1:0".parse().unwrap(), server_config()).await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(run_echo_server(server));

    let conn = connect("localhost", addr, client_config()).await.unwrap();

    let payload = b"sixteen bytes!!!";
    assert_eq!(payload.len(), 16);
    assert_eq!(echo_roundtrip(&conn, payload).await, payload);

    // Traffic flowed at every level, without loss on the loopback.
    let stats = conn.stats().await;
    assert!(stats.sent_initial + stats.recv_initial >= 2, "{stats:?}");
    assert!(stats.sent_handshake + stats.recv_handshake >= 2, "{stats:?}");
    assert!(stats.sent_1rtt + stats.recv_1rtt >= 2, "{stats:?}");
    assert_eq!(stats.packets_lost, 0, "no retransmissions expected: {stats:?}");

    conn.close(0, b"done").await;
    assert!(matches!(
        conn.state().await,
        quiver::ConnectionState::Closed | quiver::ConnectionState::Closing
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn multiple_streams_interleave() {
    let server = serve("127.0.0.1:0".parse().unwrap(), server_config()).await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(run_echo_server(server));

    let conn = connect("localhost", addr, client_config()).await.unwrap();

    // Larger-than-one-packet payload exercises chunking and reassembly.
    let big: Vec<u8> = (0..9000u32).map(|i| (i % 251) as u8).collect();
    let small = b"tiny".to_vec();

    let (a, b) = tokio::join!(echo_roundtrip(&conn, &big), echo_roundtrip(&conn, &small));
    assert_eq!(a, big);
    assert_eq!(b, small);

    conn.close(0, b"").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn version_negotiation_retries_supported_version() {
    let server = serve("127.0.0.1:0".parse().unwrap(), server_config()).await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(run_echo_server(server));

    // First offer draft-22, which the server does not speak; it answers
    // with Version Negotiation and the dial retries at v1.
    let config = ClientConfig {
        versions: vec![0xff00_0016, quiver_quic::version::VERSION_1],
        ..client_config()
    };
    let conn = connect("localhost", addr, config).await.unwrap();
    assert_eq!(echo_roundtrip(&conn, b"post-negotiation").await, b"post-negotiation");
    conn.close(0, b"").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_validates_address_then_completes() {
    let mut config = server_config();
    config.use_retry = true;
    let server = serve("127.0.0.1:0".parse().unwrap(), config).await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(run_echo_server(server));

    let conn = connect("localhost", addr, client_config()).await.unwrap();
    assert_eq!(echo_roundtrip(&conn, b"via retry").await, b"via retry");
    conn.close(0, b"").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn key_update_after_establishment() {
    let server = serve("127.0.0.1:0".parse().unwrap(), server_config()).await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(run_echo_server(server));

    let conn = connect("localhost", addr, client_config()).await.unwrap();
    assert_eq!(echo_roundtrip(&conn, b"before rekey").await, b"before rekey");

    conn.rekey().await.unwrap();
    assert_eq!(echo_roundtrip(&conn, b"after rekey").await, b"after rekey");

    // A second rekey inside a PTO of the first is refused.
    assert!(conn.rekey().await.is_err());
    conn.close(0, b"").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn server_sees_application_close_code() {
    let server = serve("127.0.0.1:0".parse().unwrap(), server_config()).await.unwrap();
    let addr = server.local_addr();

    let (tx, rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let mut server = server;
        let conn = server.accept().await.unwrap();
        conn.established().await.unwrap();
        conn.closed().await;
        let _ = tx.send(conn.close_reason().await);
    });

    let conn = connect("localhost", addr, client_config()).await.unwrap();
    conn.close(42, b"bye now").await;

    let reason = rx.await.unwrap();
    match reason {
        Some(quiver::Error::Application { code, .. }) => assert_eq!(code, 42),
        other => panic!("expected application close 42, got {other:?}"),
    }
}
