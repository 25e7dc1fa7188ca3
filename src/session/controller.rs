//! Engine: the session controller
//!
//! The engine owns a tokio runtime and a single session slot. Public methods
//! are synchronous control calls; the actual work happens on workers spawned
//! onto the runtime. At most one host or client session runs at a time.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use x25519_dalek::StaticSecret;

use crate::config::{EngineConfig, HostConfig};
use crate::error::EngineError;
use crate::identity::{IdentityStore, KEY_SIZE};
use crate::input::{InputError, InputEvent, InputInjector, ScaledInjector, VirtualInjector};
use crate::media::{RendererSlot, SurfaceRenderer, VideoRenderer};
use crate::network::{validate_url, NetworkError, SignalingState, UdpTransport};
use crate::stats::{DiagnosticSlot, StatsAggregator, StatsSnapshot};

use super::cloud::{CloudCommand, CloudWorker};
use super::negotiator::{run_client, run_host, InjectorSlot, SessionContext};
use super::{SessionInfo, SessionRole};

/// Last error and last cloud status, readable from any thread
#[derive(Debug, Default)]
pub(crate) struct Diagnostics {
    pub last_error: DiagnosticSlot,
    pub cloud_status: DiagnosticSlot,
}

/// A spawned task with a way to wait for it from synchronous code
struct Worker {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    done: Receiver<()>,
}

impl Worker {
    fn spawn<F>(runtime: &Handle, cancel: CancellationToken, future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (done_tx, done) = sync_channel(1);
        let task = runtime.spawn(async move {
            future.await;
            let _ = done_tx.send(());
        });
        Self { cancel, task, done }
    }

    /// Cancel, wait up to `grace`, then abort
    fn shutdown(self, grace: Duration, name: &str) {
        self.cancel.cancel();
        match self.done.recv_timeout(grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => debug!("{} worker stopped", name),
            Err(RecvTimeoutError::Timeout) => {
                warn!("{} worker still running after {:?}; aborting", name, grace);
                self.task.abort();
            }
        }
    }
}

pub(crate) struct ActiveSession {
    generation: u64,
    worker: Worker,
    info: Arc<Mutex<SessionInfo>>,
    /// Local UDP port (hosting only)
    port: u16,
    input_tx: Option<mpsc::Sender<InputEvent>>,
    punch_tx: Option<mpsc::UnboundedSender<Vec<SocketAddr>>>,
}

/// What the engine is doing right now
#[derive(Default)]
pub(crate) enum SessionSlot {
    #[default]
    Idle,
    Hosting(ActiveSession),
    Clienting(ActiveSession),
}

impl SessionSlot {
    fn active(&self) -> Option<&ActiveSession> {
        match self {
            SessionSlot::Idle => None,
            SessionSlot::Hosting(active) | SessionSlot::Clienting(active) => Some(active),
        }
    }

    fn into_active(self) -> Option<ActiveSession> {
        match self {
            SessionSlot::Idle => None,
            SessionSlot::Hosting(active) | SessionSlot::Clienting(active) => Some(active),
        }
    }
}

pub(crate) struct SignalingHandle {
    state: Arc<Mutex<SignalingState>>,
    commands: mpsc::UnboundedSender<CloudCommand>,
    worker: Worker,
}

/// State shared between the engine and its workers
pub(crate) struct EngineShared {
    config: EngineConfig,
    runtime: Handle,
    identity: IdentityStore,
    diagnostics: Arc<Diagnostics>,
    stats: Arc<StatsAggregator>,
    slot: Mutex<SessionSlot>,
    generation: AtomicU64,
    signaling: Mutex<Option<SignalingHandle>>,
    renderer: RendererSlot,
    injector: InjectorSlot,
}

impl EngineShared {
    fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.config.stop_grace_ms)
    }

    /// Static key for a new session
    fn session_identity(&self) -> StaticSecret {
        match self.identity.secret() {
            Ok(secret) => secret,
            Err(_) => {
                warn!("No identity initialized; using a throwaway key for this session");
                StaticSecret::random_from_rng(OsRng)
            }
        }
    }

    fn context(&self, cancel: CancellationToken, info: Arc<Mutex<SessionInfo>>) -> SessionContext {
        SessionContext {
            config: self.config.clone(),
            identity: self.session_identity(),
            stats: self.stats.clone(),
            renderer: self.renderer.clone(),
            injector: self.injector.clone(),
            info,
            cancel,
        }
    }

    fn spawn_session<F>(self: &Arc<Self>, generation: u64, cancel: CancellationToken, session: F) -> Worker
    where
        F: Future<Output = Result<(), EngineError>> + Send + 'static,
    {
        let shared = Arc::downgrade(self);
        Worker::spawn(&self.runtime, cancel, async move {
            let result = session.await;
            if let Some(shared) = shared.upgrade() {
                shared.session_finished(generation, result);
            }
        })
    }

    /// Called by a worker when its session ends for any reason
    fn session_finished(&self, generation: u64, result: Result<(), EngineError>) {
        {
            let mut slot = self.slot.lock();
            if slot.active().map(|active| active.generation) != Some(generation) {
                // Already taken by stop() or replaced
                return;
            }
            *slot = SessionSlot::Idle;
        }

        match result {
            Ok(()) => info!("Session ended"),
            Err(e) => {
                warn!("Session ended: {}", e);
                self.diagnostics.last_error.set(e.to_string());
            }
        }
        self.stats.reset_live();
        self.stats.publish();
    }

    fn start_host(self: &Arc<Self>, port: u16, host: HostConfig) -> Result<(), EngineError> {
        if port == 0 {
            return Err(EngineError::InvalidArgument("port must be non-zero".to_string()));
        }
        let host = host.normalize();

        let mut slot = self.slot.lock();
        if slot.active().is_some() {
            return Err(EngineError::SessionActive);
        }

        let transport = {
            let _guard = self.runtime.enter();
            UdpTransport::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?
        };

        self.stats.reset_session();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let info = Arc::new(Mutex::new(SessionInfo::new(
            SessionRole::Host,
            Some(transport.local_addr()),
        )));
        let (punch_tx, punch_rx) = mpsc::unbounded_channel();

        let ctx = self.context(cancel.clone(), info.clone());
        let worker = self.spawn_session(generation, cancel, run_host(ctx, transport, host, punch_rx));

        *slot = SessionSlot::Hosting(ActiveSession {
            generation,
            worker,
            info,
            port,
            input_tx: None,
            punch_tx: Some(punch_tx),
        });
        info!(
            "Hosting on port {} ({}x{}@{}, {} kbps)",
            port, host.width, host.height, host.fps, host.bitrate_kbps
        );
        Ok(())
    }

    /// Start a client session; never blocks, so workers may call it
    pub(crate) fn start_client(
        self: &Arc<Self>,
        host: String,
        port: u16,
        expected_identity: Option<[u8; KEY_SIZE]>,
    ) -> Result<(), EngineError> {
        if host.trim().is_empty() {
            return Err(EngineError::InvalidString("host"));
        }
        if port == 0 {
            return Err(EngineError::InvalidArgument("port must be non-zero".to_string()));
        }

        let mut slot = self.slot.lock();
        if slot.active().is_some() {
            return Err(EngineError::SessionActive);
        }

        self.stats.reset_session();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let cancel = CancellationToken::new();
        let info = Arc::new(Mutex::new(SessionInfo::new(SessionRole::Client, None)));
        let (input_tx, input_rx) = mpsc::channel(self.config.input_queue_events);

        info!("Joining {}:{}", host, port);
        let ctx = self.context(cancel.clone(), info.clone());
        let worker = self.spawn_session(
            generation,
            cancel,
            run_client(ctx, host, port, expected_identity, input_rx),
        );

        *slot = SessionSlot::Clienting(ActiveSession {
            generation,
            worker,
            info,
            port: 0,
            input_tx: Some(input_tx),
            punch_tx: None,
        });
        Ok(())
    }

    pub(crate) fn hosting_port(&self) -> Option<u16> {
        match &*self.slot.lock() {
            SessionSlot::Hosting(active) => Some(active.port),
            _ => None,
        }
    }

    /// Ask the host worker to send hole-punch packets
    pub(crate) fn punch(&self, targets: Vec<SocketAddr>) {
        if targets.is_empty() {
            return;
        }
        if let SessionSlot::Hosting(active) = &*self.slot.lock() {
            if let Some(tx) = &active.punch_tx {
                let _ = tx.send(targets);
            }
        }
    }

    fn stop(&self) {
        let grace = self.stop_grace();
        let session = std::mem::take(&mut *self.slot.lock());
        let signaling = self.signaling.lock().take();
        let was_running = session.active().is_some() || signaling.is_some();

        if let Some(active) = session.into_active() {
            info!("Stopping session");
            active.worker.shutdown(grace, "Session");
        }
        if let Some(signaling) = signaling {
            signaling.worker.shutdown(grace, "Signaling");
        }

        if was_running {
            self.stats.reset_live();
            self.stats.publish();
        }
    }
}

/// The castline session engine
pub struct Engine {
    runtime: Option<Runtime>,
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Create an engine with its own runtime
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .thread_name("castline-worker")
            .build()
            .map_err(EngineError::Runtime)?;

        let shared = Arc::new(EngineShared {
            runtime: runtime.handle().clone(),
            identity: IdentityStore::new(),
            diagnostics: Arc::new(Diagnostics::default()),
            stats: Arc::new(StatsAggregator::new()),
            slot: Mutex::new(SessionSlot::Idle),
            generation: AtomicU64::new(0),
            signaling: Mutex::new(None),
            renderer: Arc::new(Mutex::new(None)),
            injector: Arc::new(Mutex::new(None)),
            config,
        });

        Ok(Self {
            runtime: Some(runtime),
            shared,
        })
    }

    /// Reset diagnostics
    pub fn init(&self) {
        self.shared.diagnostics.last_error.clear();
        self.shared.diagnostics.cloud_status.clear();
        info!("castline {} initialized", Self::version());
    }

    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    // Identity

    /// Load or create the identity key under `storage_path`
    pub fn init_identity(&self, storage_path: impl AsRef<Path>) -> Result<[u8; KEY_SIZE], EngineError> {
        self.record(
            self.shared
                .identity
                .init(storage_path.as_ref())
                .map_err(EngineError::from),
        )
    }

    pub fn public_key(&self) -> Result<[u8; KEY_SIZE], EngineError> {
        Ok(self.shared.identity.public_key()?)
    }

    pub fn copy_public_key(&self, out: &mut [u8]) -> Result<(), EngineError> {
        Ok(self.shared.identity.copy_public_key(out)?)
    }

    // Sessions

    /// Host with the configured stream parameters
    pub fn start_host(&self, port: u16) -> Result<(), EngineError> {
        self.record(self.shared.start_host(port, self.shared.config.host))
    }

    pub fn start_host_with_config(&self, port: u16, host: HostConfig) -> Result<(), EngineError> {
        self.record(self.shared.start_host(port, host))
    }

    /// Join a host; the handshake runs in the background
    pub fn start_client(&self, host: &str, port: u16) -> Result<(), EngineError> {
        self.record(self.shared.start_client(host.to_string(), port, None))
    }

    /// Stop the session and signaling; succeeds when nothing is running
    pub fn stop(&self) {
        self.shared.stop();
    }

    pub fn session_info(&self) -> Option<SessionInfo> {
        self.shared
            .slot
            .lock()
            .active()
            .map(|active| active.info.lock().clone())
    }

    pub fn is_active(&self) -> bool {
        self.shared.slot.lock().active().is_some()
    }

    // Signaling

    pub fn connect_signaling(&self, token: &str) -> Result<(), EngineError> {
        let url = self.shared.config.signaling_url.clone();
        self.connect_signaling_with_url(&url, token)
    }

    pub fn connect_signaling_with_url(&self, url: &str, token: &str) -> Result<(), EngineError> {
        if url.is_empty() {
            return Err(EngineError::InvalidString("url"));
        }
        if token.is_empty() {
            return Err(EngineError::InvalidString("token"));
        }
        validate_url(url).map_err(|e| EngineError::InvalidArgument(e.to_string()))?;
        let public_key = self.record(self.public_key())?;

        if let Some(previous) = self.shared.signaling.lock().take() {
            previous.worker.shutdown(self.shared.stop_grace(), "Signaling");
        }

        let state = Arc::new(Mutex::new(SignalingState::Connecting));
        self.shared
            .diagnostics
            .cloud_status
            .set(format!("Connecting to {}", url));
        info!("Connecting to signaling server {}", url);

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let cloud = CloudWorker {
            url: url.to_string(),
            token: token.to_string(),
            public_key: BASE64.encode(public_key),
            config: self.shared.config.clone(),
            state: state.clone(),
            diagnostics: self.shared.diagnostics.clone(),
            engine: Arc::downgrade(&self.shared),
        };
        let worker = Worker::spawn(
            &self.shared.runtime,
            cancel.clone(),
            cloud.run(commands_rx, cancel),
        );

        *self.shared.signaling.lock() = Some(SignalingHandle {
            state,
            commands,
            worker,
        });
        Ok(())
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.shared
            .signaling
            .lock()
            .as_ref()
            .map(|handle| handle.state.lock().clone())
            .unwrap_or_default()
    }

    /// Ask a user known to the signaling server for a session
    pub fn send_connect_request(&self, target: &str) -> Result<(), EngineError> {
        if target.trim().is_empty() {
            return Err(EngineError::InvalidString("target"));
        }
        let signaling = self.shared.signaling.lock();
        let handle = signaling
            .as_ref()
            .filter(|handle| handle.state.lock().is_connected())
            .ok_or(EngineError::SignalingNotConnected)?;
        handle
            .commands
            .send(CloudCommand::Connect {
                target: target.to_string(),
            })
            .map_err(|_| EngineError::SignalingNotConnected)
    }

    // Media and input sinks

    /// Render decoded frames to an opaque surface handle
    pub fn init_renderer(&self, surface: usize) -> Result<(), EngineError> {
        if surface == 0 {
            return Err(EngineError::InvalidArgument(
                "surface handle must be non-null".to_string(),
            ));
        }
        self.set_renderer(Box::new(SurfaceRenderer::new(surface)));
        Ok(())
    }

    pub fn set_renderer(&self, renderer: Box<dyn VideoRenderer>) {
        *self.shared.renderer.lock() = Some(renderer);
    }

    /// Install the built-in injector at the given resolution
    pub fn init_injector(&self, width: u32, height: u32) -> Result<(), EngineError> {
        self.init_injector_with(width, height, Box::new(VirtualInjector::new()))
    }

    pub fn init_injector_with(
        &self,
        width: u32,
        height: u32,
        backend: Box<dyn InputInjector>,
    ) -> Result<(), EngineError> {
        let injector = ScaledInjector::new(width, height, backend)?;
        *self.shared.injector.lock() = Some(injector);
        info!("Input injector ready at {}x{}", width, height);
        Ok(())
    }

    /// Move the pointer to the injector's centre
    pub fn test_input_injection(&self) -> Result<(), EngineError> {
        let mut injector = self.shared.injector.lock();
        let result = match injector.as_mut() {
            Some(injector) => injector.inject_test_event().map_err(EngineError::from),
            None => Err(InputError::NotInitialized.into()),
        };
        drop(injector);
        self.record(result)
    }

    /// Queue an input event for the host (client sessions only)
    pub fn send_input(&self, event: InputEvent) -> Result<(), EngineError> {
        let slot = self.shared.slot.lock();
        let SessionSlot::Clienting(active) = &*slot else {
            return Err(EngineError::NoSession);
        };
        let tx = active.input_tx.as_ref().ok_or(EngineError::NoSession)?;
        tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NetworkError::SendBufferFull.into(),
            mpsc::error::TrySendError::Closed(_) => EngineError::NoSession,
        })
    }

    // Diagnostics

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<StatsSnapshot> {
        self.shared.stats.subscribe()
    }

    pub fn last_error(&self) -> String {
        self.shared.diagnostics.last_error.get()
    }

    pub fn copy_last_error(&self, buf: &mut [u8]) -> usize {
        self.shared.diagnostics.last_error.copy_to(buf)
    }

    pub fn subscribe_errors(&self) -> watch::Receiver<String> {
        self.shared.diagnostics.last_error.subscribe()
    }

    pub fn last_cloud_status(&self) -> String {
        self.shared.diagnostics.cloud_status.get()
    }

    pub fn copy_last_cloud_status(&self, buf: &mut [u8]) -> usize {
        self.shared.diagnostics.cloud_status.copy_to(buf)
    }

    pub fn subscribe_cloud_status(&self) -> watch::Receiver<String> {
        self.shared.diagnostics.cloud_status.subscribe()
    }
}

impl Engine {
    /// Keep failures other than plain argument errors in LastError
    fn record<T>(&self, result: Result<T, EngineError>) -> Result<T, EngineError> {
        if let Err(e) = &result {
            if !matches!(
                e,
                EngineError::InvalidArgument(_) | EngineError::InvalidString(_)
            ) {
                self.shared.diagnostics.last_error.set(e.to_string());
            }
        }
        result
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shared.stop();
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> Engine {
        let config = EngineConfig {
            stun_servers: Vec::new(),
            ..EngineConfig::default()
        };
        Engine::new(config).unwrap()
    }

    #[test]
    fn test_zero_port_rejected_without_state_change() {
        let engine = engine();
        let err = engine.start_host(0).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidArgument);
        assert!(!engine.is_active());
    }

    #[test]
    fn test_second_start_is_session_active() {
        let engine = engine();
        engine.start_host(47301).unwrap();
        let err = engine.start_host(47302).unwrap_err();
        assert!(matches!(err, EngineError::SessionActive));
        let err = engine.start_client("127.0.0.1", 47301).unwrap_err();
        assert!(matches!(err, EngineError::SessionActive));
        engine.stop();
        assert!(!engine.is_active());
    }

    #[test]
    fn test_session_info_while_hosting() {
        let engine = engine();
        assert!(engine.session_info().is_none());
        engine.start_host(47303).unwrap();
        let info = engine.session_info().unwrap();
        assert_eq!(info.role, SessionRole::Host);
        assert_eq!(info.local_addr.map(|addr| addr.port()), Some(47303));
        assert!(info.peer.is_none());
        engine.stop();
    }

    #[test]
    fn test_send_input_needs_client_session() {
        let engine = engine();
        let err = engine
            .send_input(InputEvent::MouseMove { x: 1, y: 1 })
            .unwrap_err();
        assert!(matches!(err, EngineError::NoSession));
    }

    #[test]
    fn test_connect_request_needs_signaling() {
        let engine = engine();
        assert!(matches!(
            engine.send_connect_request("alice"),
            Err(EngineError::SignalingNotConnected)
        ));
        assert!(matches!(
            engine.send_connect_request(""),
            Err(EngineError::InvalidString(_))
        ));
    }

    #[test]
    fn test_signaling_argument_checks() {
        let engine = engine();
        assert!(matches!(
            engine.connect_signaling_with_url("http://example.com", "token"),
            Err(EngineError::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.connect_signaling_with_url("ws://127.0.0.1:1", ""),
            Err(EngineError::InvalidString("token"))
        ));
        // Valid arguments but no identity yet
        assert!(matches!(
            engine.connect_signaling_with_url("ws://127.0.0.1:1", "token"),
            Err(EngineError::Identity(_))
        ));
    }

    #[test]
    fn test_renderer_and_injector() {
        let engine = engine();
        assert!(engine.init_renderer(0).is_err());
        engine.init_renderer(0xdead_beef).unwrap();

        assert_eq!(
            engine.test_input_injection().unwrap_err().code(),
            crate::error::ErrorCode::InjectorNotInitialized
        );
        assert!(engine.init_injector(0, 1080).is_err());
        engine.init_injector(1920, 1080).unwrap();
        engine.test_input_injection().unwrap();
    }
}
