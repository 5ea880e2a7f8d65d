//! Integration tests for the QUIC transport session against a local mock
//! edge endpoint with a self-signed certificate.

use nimbus_transport::session::CONTROL_RECV_CAP;
use nimbus_transport::{EdgeConfig, SessionEvent, TransportSession};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use std::sync::OnceLock;
static CRYPTO_PROVIDER_INIT: OnceLock<()> = OnceLock::new();

fn init_crypto_provider() {
    CRYPTO_PROVIDER_INIT.get_or_init(|| {
        let _ = quinn::rustls::crypto::ring::default_provider().install_default();
    });
}

/// Builds a mock edge endpoint speaking the tunnel ALPN with a self-signed
/// certificate, returning the endpoint, its address, and the cert DER for
/// the client's trust store.
fn mock_edge() -> (quinn::Endpoint, SocketAddr, Vec<u8>) {
    init_crypto_provider();

    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .expect("generate self-signed cert");
    let cert_der = cert.cert.der().to_vec();
    let key = quinn::rustls::pki_types::PrivateKeyDer::Pkcs8(
        cert.key_pair.serialize_der().into(),
    );

    let mut crypto = quinn::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert.cert.der().clone()], key)
        .expect("server crypto");
    crypto.alpn_protocols = vec![b"argotunnel".to_vec()];

    let server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(crypto).expect("quic server config"),
    ));

    let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let endpoint = quinn::Endpoint::server(server_config, bind).expect("bind server endpoint");
    let addr = endpoint.local_addr().expect("local addr");
    (endpoint, addr, cert_der)
}

fn test_config(cert_der: Vec<u8>) -> EdgeConfig {
    EdgeConfig::client_default()
        .with_server_name("localhost")
        .with_root_certificate(cert_der)
        .with_keep_alive(Duration::from_secs(1))
        .with_idle_timeout(Duration::from_secs(10))
}

async fn connect(addr: SocketAddr, cert_der: Vec<u8>) -> TransportSession {
    let config = test_config(cert_der);
    timeout(
        Duration::from_secs(5),
        TransportSession::connect(&config, "127.0.0.1", addr.port()),
    )
    .await
    .expect("connect timeout")
    .expect("connect failed")
}

#[tokio::test]
async fn test_connected_is_first_event_and_control_stream_is_zero() {
    let (endpoint, addr, cert_der) = mock_edge();

    let server = tokio::spawn(async move {
        let conn = endpoint.accept().await.expect("incoming").await.expect("accept");
        let (_send, mut recv) = conn.accept_bi().await.expect("accept_bi");
        let mut buf = [0u8; 5];
        recv.read_exact(&mut buf).await.expect("read");
        buf
    });

    let mut session = connect(addr, cert_der).await;
    assert!(matches!(session.next_event().await, SessionEvent::Connected));

    let id = session.open_stream(true).await.expect("open control stream");
    assert_eq!(id, 0, "first locally-initiated bidi stream");
    session.send(id, b"hello", false).await.expect("send");

    let received = timeout(Duration::from_secs(5), server)
        .await
        .expect("server timeout")
        .expect("server task");
    assert_eq!(&received, b"hello");
}

#[tokio::test]
async fn test_receive_buffer_accumulates_in_order() {
    let (endpoint, addr, cert_der) = mock_edge();

    let server = tokio::spawn(async move {
        let conn = endpoint.accept().await.expect("incoming").await.expect("accept");
        let (mut send, mut recv) = conn.accept_bi().await.expect("accept_bi");
        let mut probe = [0u8; 1];
        recv.read_exact(&mut probe).await.expect("read probe");
        for part in [&b"alpha "[..], &b"beta "[..], &b"gamma"[..]] {
            send.write_all(part).await.expect("write");
        }
        send.finish().expect("finish");
        // Hold the connection open until the client has drained the stream.
        tokio::time::sleep(Duration::from_millis(500)).await;
        drop(conn);
    });

    let mut session = connect(addr, cert_der).await;
    assert!(matches!(session.next_event().await, SessionEvent::Connected));

    let id = session.open_stream(true).await.expect("open stream");
    session.send(id, b"x", false).await.expect("send");

    let mut delivered = Vec::new();
    loop {
        match timeout(Duration::from_secs(5), session.next_event())
            .await
            .expect("event timeout")
        {
            SessionEvent::StreamData { stream_id, bytes } => {
                assert_eq!(stream_id, id);
                delivered.extend_from_slice(&bytes);
                // Invariant: buffer equals the concatenation of deliveries.
                assert_eq!(session.stream(id).unwrap().recv_buffer(), &delivered[..]);
            }
            SessionEvent::StreamFin(stream_id) => {
                assert_eq!(stream_id, id);
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    assert_eq!(delivered, b"alpha beta gamma");
    assert!(session.stream(id).unwrap().received_final());

    server.await.expect("server task");
}

#[tokio::test]
async fn test_remote_stream_and_response_with_fin() {
    let (endpoint, addr, cert_der) = mock_edge();

    let server = tokio::spawn(async move {
        let conn = endpoint.accept().await.expect("incoming").await.expect("accept");
        let (mut send, mut recv) = conn.open_bi().await.expect("open_bi");
        send.write_all(b"request").await.expect("write");
        let response = recv.read_to_end(64).await.expect("read response");
        response
    });

    let mut session = connect(addr, cert_der).await;
    assert!(matches!(session.next_event().await, SessionEvent::Connected));

    let stream_id = loop {
        match timeout(Duration::from_secs(5), session.next_event())
            .await
            .expect("event timeout")
        {
            SessionEvent::StreamOpenedRemote(id) => break id,
            other => panic!("unexpected event {other:?}"),
        }
    };
    // Remote-initiated bidi streams occupy the server parity class.
    assert_eq!(stream_id % 4, 1);

    match timeout(Duration::from_secs(5), session.next_event())
        .await
        .expect("event timeout")
    {
        SessionEvent::StreamData { stream_id: id, .. } => {
            assert_eq!(id, stream_id);
            assert_eq!(session.stream(id).unwrap().recv_buffer(), b"request");
        }
        other => panic!("unexpected event {other:?}"),
    }

    session
        .send(stream_id, b"response", true)
        .await
        .expect("send response");

    // No further send is allowed after the final marker.
    assert!(session.send(stream_id, b"late", false).await.is_err());

    let response = timeout(Duration::from_secs(5), server)
        .await
        .expect("server timeout")
        .expect("server task");
    assert_eq!(response, b"response");
}

#[tokio::test]
async fn test_control_buffer_cap_resets_stream() {
    let (endpoint, addr, cert_der) = mock_edge();

    let server = tokio::spawn(async move {
        let conn = endpoint.accept().await.expect("incoming").await.expect("accept");
        let (mut send, mut recv) = conn.accept_bi().await.expect("accept_bi");
        let mut probe = [0u8; 1];
        recv.read_exact(&mut probe).await.expect("read probe");
        // Flood well past the 64 KiB control cap. The client resets the
        // stream at some point, so write errors are expected.
        let chunk = vec![0u8; 8192];
        for _ in 0..(CONTROL_RECV_CAP / chunk.len() + 4) {
            if send.write_all(&chunk).await.is_err() {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        drop(conn);
    });

    let mut session = connect(addr, cert_der).await;
    assert!(matches!(session.next_event().await, SessionEvent::Connected));

    let id = session.open_stream(true).await.expect("open control stream");
    session.send(id, b"x", false).await.expect("send");

    loop {
        match timeout(Duration::from_secs(10), session.next_event())
            .await
            .expect("event timeout")
        {
            SessionEvent::StreamData { stream_id, .. } => assert_eq!(stream_id, id),
            SessionEvent::StreamReset(stream_id) => {
                assert_eq!(stream_id, id);
                break;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    // The overrun stream's state is gone.
    assert!(session.stream(id).is_none());

    server.await.expect("server task");
}

#[tokio::test]
async fn test_disconnect_reported_once_peer_closes() {
    let (endpoint, addr, cert_der) = mock_edge();

    let server = tokio::spawn(async move {
        let conn = endpoint.accept().await.expect("incoming").await.expect("accept");
        tokio::time::sleep(Duration::from_millis(100)).await;
        conn.close(quinn::VarInt::from_u32(0), b"going away");
        // Give the close frame time to flush.
        tokio::time::sleep(Duration::from_millis(100)).await;
    });

    let mut session = connect(addr, cert_der).await;
    assert!(matches!(session.next_event().await, SessionEvent::Connected));

    match timeout(Duration::from_secs(5), session.next_event())
        .await
        .expect("event timeout")
    {
        SessionEvent::Disconnected { .. } => {}
        other => panic!("unexpected event {other:?}"),
    }

    server.await.expect("server task");
}
