//! End to end over real sockets: a TLS connector and a front client

use std::path::PathBuf;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use wh_core::tls::{Identity, TlsClient, TlsServer, TrustMode};
use wh_core::Config;
use wh_dispatcher::{Dispatcher, SessionEvent};
use wh_protocol::{Frame, FrameCodec, Message, PROTOCOL_VERSION};

struct Pki {
    _dir: tempfile::TempDir,
    ca: PathBuf,
    server: (PathBuf, PathBuf),
    client: (PathBuf, PathBuf),
}

fn make_pki() -> Pki {
    let dir = tempfile::tempdir().unwrap();
    let write = |name: &str, pem: String| {
        let path = dir.path().join(name);
        std::fs::write(&path, pem).unwrap();
        path
    };

    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_key = KeyPair::generate().unwrap();
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();
    let ca = write("ca.pem", ca_cert.pem());

    let leaf = |name: &str, san: &str| {
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::new(vec![san.to_string()])
            .unwrap()
            .signed_by(&key, &ca_cert, &ca_key)
            .unwrap();
        (
            write(&format!("{}.pem", name), cert.pem()),
            write(&format!("{}-key.pem", name), key.serialize_pem()),
        )
    };
    let server = leaf("dispatcher", "localhost");
    let client = leaf("connector", "connector");

    Pki {
        _dir: dir,
        ca,
        server,
        client,
    }
}

#[tokio::test]
async fn test_tls_tunnel_serves_front_clients() {
    let pki = make_pki();
    let dispatcher = Dispatcher::with_term_fence(&Config::default());
    let mut events = dispatcher.subscribe();

    let server = TlsServer::new(
        Identity::load(&pki.server.0, &pki.server.1).unwrap(),
        Some(&pki.ca),
    )
    .unwrap();
    let tunnel_addr = dispatcher.bind_tunnel("127.0.0.1:0", server).await.unwrap();
    let front_addr = dispatcher.bind_front("127.0.0.1:0").await.unwrap();

    let identity = Identity::load(&pki.client.0, &pki.client.1).unwrap();
    let expected_fingerprint = identity.fingerprint();
    let client = TlsClient::new(&TrustMode::CustomCa(pki.ca.clone()), Some(identity)).unwrap();
    let tls = client
        .connect(&tunnel_addr.to_string(), "localhost", Duration::from_secs(5))
        .await
        .unwrap();

    let mut conn = Framed::new(tls, FrameCodec::new());
    conn.send(Frame::control(Message::Register {
        node_id: "node-a".into(),
        term: 1,
        version: PROTOCOL_VERSION.into(),
    }))
    .await
    .unwrap();
    let ack = conn.next().await.unwrap().unwrap();
    assert!(matches!(ack.message, Message::RegisterAck { accepted: true, .. }));
    assert!(matches!(events.recv().await.unwrap(), SessionEvent::Opened { .. }));

    let session = dispatcher.sessions().owner().unwrap();
    assert_eq!(session.fingerprint, expected_fingerprint);

    // Connector side: accept every stream and uppercase whatever arrives
    tokio::spawn(async move {
        while let Some(Ok(frame)) = conn.next().await {
            match frame.message {
                Message::StreamOpen { .. } => {
                    conn.send(Frame::new(frame.stream_id, Message::WindowUpdate { increment: 16 }))
                        .await
                        .unwrap();
                }
                Message::Data(data) => {
                    let upper = data.to_ascii_uppercase();
                    conn.send(Frame::new(frame.stream_id, Message::Data(upper.into())))
                        .await
                        .unwrap();
                }
                Message::StreamEnd => {
                    conn.send(Frame::new(frame.stream_id, Message::StreamEnd))
                        .await
                        .unwrap();
                }
                _ => {}
            }
        }
    });

    let mut front = TcpStream::connect(front_addr).await.unwrap();
    front.write_all(b"hello").await.unwrap();
    front.shutdown().await.unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), front.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response, b"HELLO");

    dispatcher.close_all("test finished");
    tokio::time::timeout(Duration::from_secs(5), dispatcher.wait())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_untrusted_connector_never_registers() {
    let pki = make_pki();
    let other = make_pki();
    let dispatcher = Dispatcher::with_term_fence(&Config::default());

    let server = TlsServer::new(
        Identity::load(&pki.server.0, &pki.server.1).unwrap(),
        Some(&pki.ca),
    )
    .unwrap();
    let addr = dispatcher.bind_tunnel("127.0.0.1:0", server).await.unwrap();

    // Client certificate from a different CA
    let identity = Identity::load(&other.client.0, &other.client.1).unwrap();
    let client = TlsClient::new(&TrustMode::CustomCa(pki.ca.clone()), Some(identity)).unwrap();

    if let Ok(tls) = client
        .connect(&addr.to_string(), "localhost", Duration::from_secs(5))
        .await
    {
        // TLS 1.3 reports client auth failure on first read
        let mut conn = Framed::new(tls, FrameCodec::new());
        let _ = conn
            .send(Frame::control(Message::Register {
                node_id: "intruder".into(),
                term: 1,
                version: PROTOCOL_VERSION.into(),
            }))
            .await;
        let next = tokio::time::timeout(Duration::from_secs(5), conn.next())
            .await
            .unwrap();
        assert!(!matches!(next, Some(Ok(_))));
    }

    assert!(dispatcher.sessions().is_empty());
    dispatcher.close_all("test finished");
}
