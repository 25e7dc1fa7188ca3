//! Engine lifecycle and loopback session tests
//!
//! Each test builds its own engines; a host and a client in the same process
//! need two engines since one engine runs at most one session.

use std::net::UdpSocket;
use std::time::{Duration, Instant};

use castline::config::HostConfig;
use castline::input::{InputError, InputEvent, InputInjector};
use castline::{Engine, EngineConfig, EngineError, ErrorCode, SessionRole};

fn test_config() -> EngineConfig {
    EngineConfig {
        stun_servers: Vec::new(),
        connect_timeout_ms: 3000,
        peer_timeout_ms: 3000,
        stop_grace_ms: 1000,
        ..EngineConfig::default()
    }
}

fn engine() -> Engine {
    Engine::new(test_config()).unwrap()
}

/// Find a UDP port that is free right now
fn free_udp_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0")
        .expect("Failed to bind to ephemeral port")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

/// Poll `condition` every 20 ms until it holds or `timeout` passes
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

fn small_host() -> HostConfig {
    HostConfig {
        width: 320,
        height: 240,
        fps: 30,
        bitrate_kbps: 2000,
        keyframe_interval_ms: 1000,
        display_id: None,
    }
}

#[test]
fn test_stop_when_idle_is_harmless() {
    let engine = engine();
    engine.stop();
    engine.stop();
    assert!(!engine.is_active());
    let stats = engine.stats();
    assert!(!stats.connected);
    assert_eq!(stats.frames_encoded, 0);
}

#[test]
fn test_invalid_port_leaves_engine_idle() {
    let engine = engine();
    let err = engine.start_host(0).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    let err = engine.start_client("127.0.0.1", 0).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    let err = engine.start_client("  ", 5600).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidString);
    assert!(!engine.is_active());
    // Argument errors are not recorded as the last error
    assert!(engine.last_error().is_empty());
}

#[test]
fn test_restart_on_same_port() {
    let engine = engine();
    let port = free_udp_port();

    engine.start_host(port).unwrap();
    engine.stop();
    assert!(!engine.is_active());

    engine.start_host(port).unwrap();
    assert!(engine.is_active());
    engine.stop();
}

#[test]
fn test_public_key_requires_identity() {
    let engine = engine();
    let err = engine.public_key().unwrap_err();
    assert_eq!(err.code(), ErrorCode::IdentityUninitialized);
}

#[test]
fn test_unreachable_host_times_out() {
    let config = EngineConfig {
        connect_timeout_ms: 500,
        ..test_config()
    };
    let client = Engine::new(config).unwrap();

    // Nothing listens on this port, so the handshake never completes
    let port = free_udp_port();
    client.start_client("127.0.0.1", port).unwrap();
    assert!(client.is_active());

    assert!(wait_until(Duration::from_secs(5), || !client.is_active()));
    assert!(!client.last_error().is_empty());
    assert!(!client.stats().connected);
}

#[test]
fn test_loopback_session_streams_frames() {
    let host = engine();
    let client = engine();
    let port = free_udp_port();

    host.start_host_with_config(port, small_host()).unwrap();
    client.start_client("127.0.0.1", port).unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || client.stats().connected),
        "client never connected: {}",
        client.last_error()
    );
    assert!(
        wait_until(Duration::from_secs(5), || client.stats().frames_decoded > 0),
        "no frames decoded: {}",
        client.last_error()
    );

    let host_stats = host.stats();
    assert!(host_stats.connected);
    assert!(host_stats.frames_encoded > 0);
    assert!(client.stats().fps <= 60);

    let info = client.session_info().unwrap();
    assert_eq!(info.role, SessionRole::Client);
    assert_eq!(info.peer.map(|addr| addr.port()), Some(port));
    let params = info.params.unwrap();
    assert_eq!((params.width, params.height), (320, 240));

    let host_info = host.session_info().unwrap();
    assert_eq!(host_info.role, SessionRole::Host);
    assert!(host_info.peer.is_some());

    client.stop();
    assert!(!client.stats().connected);

    // The client's goodbye ends the host session as well
    assert!(wait_until(Duration::from_secs(3), || !host.is_active()));
    assert!(!host.stats().connected);
}

#[test]
fn test_full_hd_stream_holds_rate_within_bitrate() {
    let host = engine();
    let client = engine();
    let port = free_udp_port();
    let config = HostConfig {
        width: 1920,
        height: 1080,
        fps: 60,
        bitrate_kbps: 8000,
        keyframe_interval_ms: 2000,
        display_id: None,
    };

    host.start_host_with_config(port, config).unwrap();
    client.start_client("127.0.0.1", port).unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || client.stats().connected),
        "client never connected: {}",
        client.last_error()
    );
    assert!(
        wait_until(Duration::from_secs(5), || client.stats().frames_decoded > 0),
        "no frames decoded: {}",
        client.last_error()
    );

    let first = client.stats().frames_decoded;
    let started = Instant::now();
    std::thread::sleep(Duration::from_secs(3));
    let decoded = client.stats().frames_decoded - first;
    let per_second = decoded as f64 / started.elapsed().as_secs_f64();
    assert!(
        per_second >= 7.0,
        "only {} frames in 3 s ({:.1}/s): {}",
        decoded,
        per_second,
        client.last_error()
    );

    let client_stats = client.stats();
    assert!(client_stats.connected);
    assert!(client_stats.fps <= 60);

    let host_stats = host.stats();
    assert!(host_stats.bitrate_kbps > 0);
    assert!(
        host_stats.bitrate_kbps <= 8000 * 11 / 10,
        "host sending {} kbps against 8000",
        host_stats.bitrate_kbps
    );
    assert!(client_stats.bitrate_kbps <= 8000 * 11 / 10);

    let params = client.session_info().unwrap().params.unwrap();
    assert_eq!((params.width, params.height, params.fps), (1920, 1080, 60));

    client.stop();
    host.stop();
}

#[test]
fn test_input_reaches_host_injector() {
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<InputEvent>>>);

    impl InputInjector for Recorder {
        fn inject(&mut self, event: InputEvent) -> Result<(), InputError> {
            self.0.lock().unwrap().push(event);
            Ok(())
        }
    }

    let host = engine();
    let client = engine();
    let port = free_udp_port();
    let recorder = Recorder::default();
    host.init_injector_with(320, 240, Box::new(recorder.clone()))
        .unwrap();

    host.start_host_with_config(port, small_host()).unwrap();
    client.start_client("127.0.0.1", port).unwrap();
    assert!(wait_until(Duration::from_secs(5), || client.stats().connected));

    client
        .send_input(InputEvent::Key {
            keycode: 30,
            pressed: true,
        })
        .unwrap();

    assert!(wait_until(Duration::from_secs(3), || {
        recorder.0.lock().unwrap().iter().any(|event| {
            *event
                == InputEvent::Key {
                    keycode: 30,
                    pressed: true,
                }
        })
    }));

    client.stop();
    host.stop();
}

#[test]
fn test_send_input_without_session() {
    let client = engine();
    let err = client
        .send_input(InputEvent::MouseMove { x: 0, y: 0 })
        .unwrap_err();
    assert!(matches!(err, EngineError::NoSession));
}
