// Integration tests for the HTTP long-poll transport against a mock server
//
// Run with: cargo test --test polling_transport_test

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use inventory_notifier::transport::{
    AutoConnector, Connector, PollingConnector, TransportEvent, TransportKind,
    TransportPreference,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{method, path_regex};
use wiremock::{Mock, MockServer, ResponseTemplate};

const POLL_PATH: &str = r"^/ws/\d{3}/[0-9a-f]{32}/xhr$";
const SEND_PATH: &str = r"^/ws/\d{3}/[0-9a-f]{32}/xhr_send$";

async fn mount_poll(server: &MockServer, priority: u8, times: u64, body: &str) {
    Mock::given(method("POST"))
        .and(path_regex(POLL_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .up_to_n_times(times)
        .with_priority(priority)
        .mount(server)
        .await;
}

async fn next_event(conn: &mut inventory_notifier::transport::TransportConnection) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(5), conn.recv())
        .await
        .expect("no transport event within 5s")
        .expect("transport driver gone")
}

/// HTTP server that answers long-polls but never completes a WebSocket
/// upgrade, like a proxy that swallows `Upgrade` requests.
async fn spawn_stalling_upgrade_server() -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let opened = Arc::new(AtomicBool::new(false));
        while let Ok((mut socket, _)) = listener.accept().await {
            let opened = Arc::clone(&opened);
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0_u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => head.extend_from_slice(&buf[..n]),
                    }
                }
                let request = String::from_utf8_lossy(&head).to_ascii_lowercase();
                if request.contains("upgrade: websocket") {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    return;
                }
                let body = if opened.swap(true, Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    "h\n"
                } else {
                    "o\n"
                };
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });
    (format!("http://{addr}/ws"), handle)
}

#[tokio::test]
async fn test_open_receive_and_server_close() {
    let server = MockServer::start().await;
    mount_poll(&server, 1, 1, "o\n").await;
    mount_poll(
        &server,
        2,
        1,
        "a[\"CONNECTED\\nversion:1.2\\n\\n\\u0000\",\"\\n\"]\n",
    )
    .await;
    mount_poll(&server, 3, 1, "c[3000,\"Go away!\"]\n").await;

    let mut conn = PollingConnector::default()
        .open(&format!("{}/ws", server.uri()))
        .await
        .unwrap();
    assert_eq!(conn.kind(), TransportKind::Polling);

    assert_eq!(next_event(&mut conn).await, TransportEvent::Open);
    assert_eq!(
        next_event(&mut conn).await,
        TransportEvent::Frame(Bytes::from_static(b"CONNECTED\nversion:1.2\n\n\0"))
    );
    assert_eq!(
        next_event(&mut conn).await,
        TransportEvent::Frame(Bytes::from_static(b"\n"))
    );
    assert_eq!(
        next_event(&mut conn).await,
        TransportEvent::Closed("Go away!".to_string())
    );
    assert!(!conn.is_open());
}

#[tokio::test]
async fn test_send_posts_json_array() {
    let server = MockServer::start().await;
    mount_poll(&server, 1, 1, "o\n").await;
    // Later polls are held open briefly and return heartbeats.
    Mock::given(method("POST"))
        .and(path_regex(POLL_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("h\n")
                .set_delay(Duration::from_millis(200)),
        )
        .with_priority(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path_regex(SEND_PATH))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let mut conn = PollingConnector::default()
        .open(&format!("{}/ws", server.uri()))
        .await
        .unwrap();
    assert_eq!(next_event(&mut conn).await, TransportEvent::Open);

    conn.send(b"CONNECT\naccept-version:1.2\n\n\0".to_vec());

    let mut sent: Option<Vec<String>> = None;
    for _ in 0..250 {
        let requests = server.received_requests().await.unwrap_or_default();
        if let Some(request) = requests
            .iter()
            .find(|r| r.url.path().ends_with("/xhr_send"))
        {
            sent = Some(serde_json::from_slice(&request.body).unwrap());
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(
        sent.expect("xhr_send never called"),
        vec!["CONNECT\naccept-version:1.2\n\n\0".to_string()]
    );

    conn.close();
    conn.send(b"ignored".to_vec());
}

#[tokio::test]
async fn test_open_refused_by_server() {
    let server = MockServer::start().await;
    mount_poll(&server, 1, 1, "c[2010,\"Another connection still open\"]\n").await;

    let err = PollingConnector::default()
        .open(&format!("{}/ws", server.uri()))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Another connection still open"), "{err:#}");
}

#[tokio::test]
async fn test_open_http_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path_regex(POLL_PATH))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let err = PollingConnector::default()
        .open(&format!("{}/ws", server.uri()))
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("503"), "{err:#}");
}

#[tokio::test]
async fn test_auto_connector_falls_back_to_polling() {
    // The mock server does not speak WebSocket, so the upgrade fails.
    let server = MockServer::start().await;
    mount_poll(&server, 1, 1, "o\n").await;
    Mock::given(method("POST"))
        .and(path_regex(POLL_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("h\n")
                .set_delay(Duration::from_millis(200)),
        )
        .with_priority(2)
        .mount(&server)
        .await;

    let mut conn = AutoConnector::new(TransportPreference::Auto)
        .open(&format!("{}/ws", server.uri()))
        .await
        .unwrap();
    assert_eq!(conn.kind(), TransportKind::Polling);
    assert_eq!(next_event(&mut conn).await, TransportEvent::Open);
}

#[tokio::test]
async fn test_websocket_only_preference_does_not_fall_back() {
    let server = MockServer::start().await;
    mount_poll(&server, 1, 1, "o\n").await;

    let result = AutoConnector::new(TransportPreference::WebSocket)
        .open(&format!("{}/ws", server.uri()))
        .await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_auto_connector_falls_back_when_upgrade_stalls() {
    let (url, server) = spawn_stalling_upgrade_server().await;

    let connector = AutoConnector::new(TransportPreference::Auto)
        .with_websocket_timeout(Duration::from_millis(300));
    let mut conn = tokio::time::timeout(Duration::from_secs(5), connector.open(&url))
        .await
        .expect("long-poll fallback was never attempted")
        .unwrap();
    assert_eq!(conn.kind(), TransportKind::Polling);
    assert_eq!(next_event(&mut conn).await, TransportEvent::Open);

    conn.close();
    server.abort();
}

#[tokio::test]
async fn test_websocket_only_preference_gives_up_when_upgrade_stalls() {
    let (url, server) = spawn_stalling_upgrade_server().await;

    let connector = AutoConnector::new(TransportPreference::WebSocket)
        .with_websocket_timeout(Duration::from_millis(300));
    let result = tokio::time::timeout(Duration::from_secs(5), connector.open(&url))
        .await
        .expect("WebSocket attempt was not bounded");
    assert!(result.is_err());
    server.abort();
}
