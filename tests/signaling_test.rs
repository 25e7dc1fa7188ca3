//! Signaling flow against an in-process rendezvous server
//!
//! Covers bind, rejected tokens, requests to unknown, idle or silent users,
//! and a full call that ends in a direct session.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;

use castline::network::{SignalingConnection, SignalingMessage, SignalingServer, SignalingState};
use castline::{Engine, EngineConfig, SessionRole};

struct TestServer {
    url: String,
    // Dropping the runtime stops the server
    _runtime: Runtime,
}

fn start_server() -> TestServer {
    let runtime = Runtime::new().unwrap();
    let tokens = HashMap::from([
        ("alice-token".to_string(), "alice".to_string()),
        ("bob-token".to_string(), "bob".to_string()),
    ]);
    let server = SignalingServer::new(tokens);

    let listener = runtime
        .block_on(TcpListener::bind("127.0.0.1:0"))
        .unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    runtime.spawn(async move {
        let _ = server.run(listener).await;
    });

    TestServer {
        url,
        _runtime: runtime,
    }
}

fn engine_with_identity(dir: &TempDir) -> Engine {
    let config = EngineConfig {
        stun_servers: Vec::new(),
        signaling_timeout_ms: 3000,
        request_timeout_ms: 3000,
        stop_grace_ms: 1000,
        ..EngineConfig::default()
    };
    let engine = Engine::new(config).unwrap();
    engine.init_identity(dir.path()).unwrap();
    engine
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    condition()
}

fn connect(engine: &Engine, server: &TestServer, token: &str) {
    engine.connect_signaling_with_url(&server.url, token).unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || engine
            .signaling_state()
            .is_connected()),
        "not bound: {}",
        engine.last_cloud_status()
    );
}

#[test]
fn test_bind_reports_username() {
    let server = start_server();
    let dir = TempDir::new().unwrap();
    let engine = engine_with_identity(&dir);

    connect(&engine, &server, "alice-token");
    assert_eq!(
        engine.signaling_state(),
        SignalingState::Connected {
            username: "alice".to_string()
        }
    );
    assert_eq!(engine.last_cloud_status(), "Connected to signaling as alice");

    engine.stop();
    assert_eq!(engine.signaling_state(), SignalingState::Disconnected);
}

#[test]
fn test_bad_token_is_reported() {
    let server = start_server();
    let dir = TempDir::new().unwrap();
    let engine = engine_with_identity(&dir);

    engine
        .connect_signaling_with_url(&server.url, "wrong-token")
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || matches!(
        engine.signaling_state(),
        SignalingState::Error(_)
    )));
    assert!(engine.last_cloud_status().contains("invalid token"));
    assert!(engine.send_connect_request("bob").is_err());
}

#[test]
fn test_request_to_unknown_user_is_rejected() {
    let server = start_server();
    let dir = TempDir::new().unwrap();
    let engine = engine_with_identity(&dir);
    connect(&engine, &server, "alice-token");

    engine.send_connect_request("carol").unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || engine
            .last_cloud_status()
            .starts_with("Cloud request rejected")),
        "status: {}",
        engine.last_cloud_status()
    );
    assert!(engine.last_cloud_status().contains("carol"));
    assert!(engine.last_error().starts_with("Cloud request rejected"));
}

#[test]
fn test_request_to_idle_user_is_declined() {
    let server = start_server();
    let alice_dir = TempDir::new().unwrap();
    let bob_dir = TempDir::new().unwrap();
    let alice = engine_with_identity(&alice_dir);
    let bob = engine_with_identity(&bob_dir);
    connect(&alice, &server, "alice-token");
    connect(&bob, &server, "bob-token");

    alice.send_connect_request("bob").unwrap();
    assert!(wait_until(Duration::from_secs(5), || alice
        .last_cloud_status()
        == "Cloud request rejected: not hosting"));
    assert!(bob.last_cloud_status().contains("not hosting"));
    assert!(!alice.is_active());
}

#[test]
fn test_unanswered_request_expires() {
    let server = start_server();
    let dir = TempDir::new().unwrap();
    let alice = Engine::new(EngineConfig {
        stun_servers: Vec::new(),
        signaling_timeout_ms: 3000,
        request_timeout_ms: 500,
        stop_grace_ms: 1000,
        ..EngineConfig::default()
    })
    .unwrap();
    alice.init_identity(dir.path()).unwrap();

    // Bob binds with a bare connection and never answers
    let bob_runtime = Runtime::new().unwrap();
    let mut bob = bob_runtime.block_on(async {
        let mut conn = SignalingConnection::connect(&server.url).await.unwrap();
        conn.send(&SignalingMessage::Bind {
            token: "bob-token".to_string(),
            public_key: BASE64.encode([7u8; 32]),
        })
        .await
        .unwrap();
        assert!(matches!(
            conn.recv().await.unwrap(),
            SignalingMessage::Bound { .. }
        ));
        conn
    });

    connect(&alice, &server, "alice-token");
    alice.send_connect_request("bob").unwrap();

    let incoming = bob_runtime
        .block_on(async { tokio::time::timeout(Duration::from_secs(3), bob.recv()).await })
        .unwrap()
        .unwrap();
    assert!(matches!(
        incoming,
        SignalingMessage::IncomingRequest { ref from_username, .. } if from_username == "alice"
    ));

    assert!(
        wait_until(Duration::from_secs(3), || alice
            .last_cloud_status()
            .contains("timed out")),
        "status: {}",
        alice.last_cloud_status()
    );
    let mut buf = [0u8; 128];
    let len = alice.copy_last_cloud_status(&mut buf);
    assert_eq!(&buf[..len], b"Cloud request to bob timed out");
    assert_eq!(buf[len], 0);
    assert_eq!(alice.last_error(), "Cloud request to bob timed out");

    // The signaling session itself survives the expired request
    assert!(alice.signaling_state().is_connected());
    assert!(!alice.is_active());
}

#[test]
fn test_call_starts_direct_session() {
    let server = start_server();
    let alice_dir = TempDir::new().unwrap();
    let bob_dir = TempDir::new().unwrap();
    let alice = engine_with_identity(&alice_dir);
    let bob = engine_with_identity(&bob_dir);

    let port = std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    bob.start_host(port).unwrap();

    connect(&alice, &server, "alice-token");
    connect(&bob, &server, "bob-token");

    alice.send_connect_request("bob").unwrap();
    assert!(
        wait_until(Duration::from_secs(8), || alice.stats().connected),
        "alice: {} / {}",
        alice.last_cloud_status(),
        alice.last_error()
    );

    let info = alice.session_info().unwrap();
    assert_eq!(info.role, SessionRole::Client);
    assert_eq!(info.peer.map(|addr| addr.port()), Some(port));
    assert!(bob.last_cloud_status().starts_with("Accepted request from alice"));

    alice.stop();
    bob.stop();
}
