use detection_client::{config::PortalConfig, ClientError, ClientPortal};
use detection_server::{
    detector::{from_fn, DetectionError, Detector},
    ServerError, ServerPortal, ServerPortalConfig,
};
use frame_codec::CodecError;
use std::time::Duration;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::broadcast,
    task::JoinHandle,
};

struct TestServer {
    addr: String,
    shutdown_tx: broadcast::Sender<()>,
    handle: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    async fn start(detector: impl Detector, config: ServerPortalConfig) -> Self {
        let portal = ServerPortal::bind("127.0.0.1:0", detector, &config)
            .await
            .unwrap();
        let addr = portal.local_addr().unwrap().to_string();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(portal.run(shutdown_rx));

        Self {
            addr,
            shutdown_tx,
            handle,
        }
    }

    async fn stop(self) {
        self.shutdown_tx.send(()).unwrap();
        self.handle.await.unwrap().unwrap();
    }
}

fn echo() -> impl Detector {
    from_fn(|image| Ok(image.to_vec()))
}

#[tokio::test]
async fn test_echo_returns_identical_payload() {
    let server = TestServer::start(echo(), ServerPortalConfig::default()).await;
    let image: Vec<u8> = (0..1024).map(|i| (i * 7 % 256) as u8).collect();

    let response = ClientPortal::default()
        .send_bytes(&server.addr, &image)
        .await
        .unwrap();

    assert_eq!(response.len(), 1024);
    assert_eq!(response, image);
    server.stop().await;
}

#[tokio::test]
async fn test_empty_request_gets_stub_response() {
    let detector = from_fn(|image| {
        assert!(image.is_empty());
        Ok(b"0123456789".to_vec())
    });
    let server = TestServer::start(detector, ServerPortalConfig::default()).await;

    let response = ClientPortal::default()
        .send_bytes(&server.addr, &[])
        .await
        .unwrap();

    assert_eq!(response, b"0123456789");
    server.stop().await;
}

#[tokio::test]
async fn test_send_image_reads_file() {
    let server = TestServer::start(echo(), ServerPortalConfig::default()).await;
    let path = std::env::temp_dir().join(format!("e2e-input-{}.bin", std::process::id()));
    tokio::fs::write(&path, b"fake jpeg bytes").await.unwrap();

    let response = ClientPortal::default()
        .send_image(&server.addr, &path)
        .await;
    tokio::fs::remove_file(&path).await.unwrap();

    assert_eq!(response.unwrap(), b"fake jpeg bytes");
    server.stop().await;
}

#[tokio::test]
async fn test_malformed_connection_does_not_affect_next_client() {
    let config = ServerPortalConfig {
        max_payload_size: 2048,
        ..ServerPortalConfig::default()
    };
    let server = TestServer::start(echo(), config).await;
    let portal = ClientPortal::default();

    for k in 0..4u8 {
        if k % 2 == 0 {
            let mut raw = TcpStream::connect(&server.addr).await.unwrap();
            raw.write_all(&u64::MAX.to_be_bytes()).await.unwrap();
            let mut rest = Vec::new();
            let _ = raw.read_to_end(&mut rest).await;
            assert!(rest.is_empty());
        } else {
            let image = vec![k; 512];
            assert_eq!(portal.send_bytes(&server.addr, &image).await.unwrap(), image);
        }
    }

    server.stop().await;
}

#[tokio::test]
async fn test_oversized_request_rejected_by_server() {
    let config = ServerPortalConfig {
        max_payload_size: 128,
        ..ServerPortalConfig::default()
    };
    let server = TestServer::start(echo(), config).await;

    let portal = ClientPortal::default();

    // The close may reach the client while it is still uploading or while it
    // waits for the response; both are reported the same way.
    for size in [64 * 1024, 4 * 1024 * 1024] {
        let result = portal.send_bytes(&server.addr, &vec![1u8; size]).await;
        assert!(
            matches!(result, Err(ClientError::Protocol(_))),
            "{} byte upload: {:?}",
            size,
            result.map(|response| response.len())
        );
    }
    assert_eq!(
        ClientPortal::default()
            .send_bytes(&server.addr, b"small")
            .await
            .unwrap(),
        b"small"
    );
    server.stop().await;
}

#[tokio::test]
async fn test_detection_error_surfaces_as_protocol_error() {
    let detector = from_fn(|_| Err(DetectionError::Model("no accelerator".to_string())));
    let server = TestServer::start(detector, ServerPortalConfig::default()).await;

    let result = ClientPortal::default()
        .send_bytes(&server.addr, b"image")
        .await;

    assert!(matches!(
        result,
        Err(ClientError::Protocol(CodecError::Truncated { .. }))
    ));
    server.stop().await;
}

#[tokio::test]
async fn test_stalled_peer_times_out_and_server_keeps_accepting() {
    let config = ServerPortalConfig {
        exchange_timeout: Duration::from_millis(200),
        ..ServerPortalConfig::default()
    };
    let server = TestServer::start(echo(), config).await;

    let mut stalled = TcpStream::connect(&server.addr).await.unwrap();
    stalled.write_all(&1024u64.to_be_bytes()).await.unwrap();
    let mut rest = Vec::new();
    let closed = tokio::time::timeout(Duration::from_secs(5), stalled.read_to_end(&mut rest)).await;
    assert!(closed.is_ok(), "stalled connection was never closed");
    assert!(rest.is_empty());

    let response = ClientPortal::default()
        .send_bytes(&server.addr, b"after timeout")
        .await
        .unwrap();
    assert_eq!(response, b"after timeout");
    server.stop().await;
}

#[tokio::test]
async fn test_client_response_timeout_against_slow_detector() {
    let detector = from_fn(|image| {
        std::thread::sleep(Duration::from_millis(500));
        Ok(image.to_vec())
    });
    let server = TestServer::start(detector, ServerPortalConfig::default()).await;
    let portal = ClientPortal::new(&PortalConfig {
        response_timeout_ms: 100,
        ..PortalConfig::default()
    });

    let result = portal.send_bytes(&server.addr, b"image").await;

    assert!(matches!(result, Err(ClientError::Timeout(_))));
    server.stop().await;
}
