//! Signaling worker
//!
//! Holds the WebSocket to the signaling server for as long as the engine is
//! connected, forwards connect requests and reacts to the server's routing
//! messages by answering requests or starting client sessions.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::identity::KEY_SIZE;
use crate::network::{
    NetworkError, RendezvousInfo, SignalingConnection, SignalingMessage, SignalingState,
    StunClient,
};

use super::controller::{Diagnostics, EngineShared};

/// How long a close handshake may take on disconnect
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Requests from the engine to the signaling worker
#[derive(Debug)]
pub(crate) enum CloudCommand {
    Connect { target: String },
}

/// A connect request waiting for its answer
struct PendingRequest {
    request_id: String,
    target: String,
    deadline: Instant,
}

pub(crate) struct CloudWorker {
    pub url: String,
    pub token: String,
    /// Our identity key, base64
    pub public_key: String,
    pub config: EngineConfig,
    pub state: Arc<Mutex<SignalingState>>,
    pub diagnostics: Arc<Diagnostics>,
    pub engine: Weak<EngineShared>,
}

impl CloudWorker {
    pub async fn run(
        self,
        mut commands: mpsc::UnboundedReceiver<CloudCommand>,
        cancel: CancellationToken,
    ) {
        let connect_timeout = Duration::from_millis(self.config.signaling_timeout_ms);

        let mut conn = tokio::select! {
            _ = cancel.cancelled() => {
                self.disconnected();
                return;
            }
            result = timeout(connect_timeout, self.connect_and_bind()) => match result {
                Ok(Ok((conn, username))) => {
                    info!("Signaling bound as {}", username);
                    self.diagnostics
                        .cloud_status
                        .set(format!("Connected to signaling as {}", username));
                    *self.state.lock() = SignalingState::Connected { username };
                    conn
                }
                Ok(Err(e)) => {
                    self.fail(format!("Signaling connect failed: {}", e));
                    return;
                }
                Err(_) => {
                    self.fail(format!(
                        "Signaling connect timed out after {} ms",
                        self.config.signaling_timeout_ms
                    ));
                    return;
                }
            }
        };

        let mut pending: Option<PendingRequest> = None;

        loop {
            let step = tokio::select! {
                _ = cancel.cancelled() => {
                    if timeout(CLOSE_TIMEOUT, conn.close()).await.is_err() {
                        debug!("Signaling close timed out");
                    }
                    self.disconnected();
                    return;
                }

                Some(command) = commands.recv() => self.on_command(&mut conn, command, &mut pending).await,

                received = conn.recv() => match received {
                    Ok(msg) => self.on_message(&mut conn, msg, &mut pending).await,
                    Err(e) => Err(e),
                },

                _ = request_deadline(&pending) => {
                    if let Some(request) = pending.take() {
                        self.report_error(format!(
                            "Cloud request to {} timed out",
                            request.target
                        ));
                    }
                    Ok(())
                }
            };

            if let Err(e) = step {
                self.fail(format!("Signaling connection lost: {}", e));
                return;
            }
        }
    }

    async fn connect_and_bind(&self) -> Result<(SignalingConnection, String), NetworkError> {
        let mut conn = SignalingConnection::connect(&self.url).await?;
        conn.send(&SignalingMessage::Bind {
            token: self.token.clone(),
            public_key: self.public_key.clone(),
        })
        .await?;

        loop {
            match conn.recv().await? {
                SignalingMessage::Bound { username } => return Ok((conn, username)),
                SignalingMessage::Error { code, message, .. } => {
                    return Err(NetworkError::Signaling(format!(
                        "auth rejected: {} ({})",
                        message, code
                    )));
                }
                other => debug!("Ignoring {:?} before bind", other),
            }
        }
    }

    async fn on_command(
        &self,
        conn: &mut SignalingConnection,
        command: CloudCommand,
        pending: &mut Option<PendingRequest>,
    ) -> Result<(), NetworkError> {
        match command {
            CloudCommand::Connect { target } => {
                // Our client socket is not bound yet, so there is no port to offer
                let rendezvous = gather_rendezvous(0, &self.config).await;
                let request_id = Uuid::new_v4().to_string();

                conn.send(&SignalingMessage::ConnectRequest {
                    request_id: request_id.clone(),
                    target_username: target.clone(),
                    public_key: self.public_key.clone(),
                    rendezvous,
                })
                .await?;

                let request = PendingRequest {
                    request_id,
                    target: target.clone(),
                    deadline: Instant::now() + Duration::from_millis(self.config.request_timeout_ms),
                };
                if let Some(previous) = pending.replace(request) {
                    debug!(
                        "Request {} to {} superseded",
                        previous.request_id, previous.target
                    );
                }
                info!("Connect request sent to {}", target);
                self.diagnostics
                    .cloud_status
                    .set(format!("Connect request sent to {}", target));
            }
        }
        Ok(())
    }

    async fn on_message(
        &self,
        conn: &mut SignalingConnection,
        msg: SignalingMessage,
        pending: &mut Option<PendingRequest>,
    ) -> Result<(), NetworkError> {
        match msg {
            SignalingMessage::IncomingRequest {
                request_id,
                from_username,
                rendezvous,
                ..
            } => {
                self.on_incoming(conn, request_id, from_username, rendezvous)
                    .await?;
            }

            SignalingMessage::RequestAnswered {
                request_id,
                from_username,
                accepted,
                reason,
                public_key,
                rendezvous,
            } => {
                if !pending
                    .as_ref()
                    .is_some_and(|request| request.request_id == request_id)
                {
                    debug!("Ignoring answer to unknown request {}", request_id);
                    return Ok(());
                }
                *pending = None;

                if !accepted {
                    let reason = reason.unwrap_or_else(|| "declined".to_string());
                    self.report_error(format!("Cloud request rejected: {}", reason));
                    return Ok(());
                }
                self.on_accepted(from_username, public_key, rendezvous);
            }

            SignalingMessage::Error {
                request_id,
                code,
                message,
            } => {
                let ours = match (&request_id, pending.as_ref()) {
                    (Some(id), Some(request)) => *id == request.request_id,
                    _ => false,
                };
                if ours {
                    *pending = None;
                    self.report_error(format!("Cloud request rejected: {} ({})", message, code));
                } else {
                    self.report_error(format!("Signaling error: {} ({})", message, code));
                }
            }

            other => debug!("Ignoring signaling message {:?}", other),
        }
        Ok(())
    }

    async fn on_incoming(
        &self,
        conn: &mut SignalingConnection,
        request_id: String,
        from_username: String,
        rendezvous: RendezvousInfo,
    ) -> Result<(), NetworkError> {
        let engine = self.engine.upgrade();
        let port = engine.as_ref().and_then(|engine| engine.hosting_port());

        let Some(port) = port else {
            conn.send(&SignalingMessage::ConnectAnswer {
                request_id,
                target_username: from_username.clone(),
                accepted: false,
                reason: Some("not hosting".to_string()),
                rendezvous: None,
            })
            .await?;
            info!("Declined request from {}: not hosting", from_username);
            self.diagnostics
                .cloud_status
                .set(format!("Declined request from {}: not hosting", from_username));
            return Ok(());
        };

        let ours = gather_rendezvous(port, &self.config).await;
        conn.send(&SignalingMessage::ConnectAnswer {
            request_id,
            target_username: from_username.clone(),
            accepted: true,
            reason: None,
            rendezvous: Some(ours),
        })
        .await?;

        let targets: Vec<SocketAddr> = rendezvous
            .candidates()
            .into_iter()
            .filter(|addr| addr.port() != 0)
            .collect();
        if let Some(engine) = engine {
            engine.punch(targets);
        }

        info!("Accepted request from {}", from_username);
        self.diagnostics
            .cloud_status
            .set(format!("Accepted request from {}", from_username));
        Ok(())
    }

    fn on_accepted(
        &self,
        from_username: String,
        public_key: String,
        rendezvous: Option<RendezvousInfo>,
    ) {
        let Some(addr) = rendezvous.as_ref().and_then(RendezvousInfo::candidate) else {
            self.report_error(format!(
                "Cloud request rejected: {} sent no address",
                from_username
            ));
            return;
        };
        let identity = decode_public_key(&public_key);
        if identity.is_none() {
            warn!("{} sent an unusable public key; not pinning", from_username);
        }

        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        match engine.start_client(addr.ip().to_string(), addr.port(), identity) {
            Ok(()) => {
                info!("Connecting to {} at {}", from_username, addr);
                self.diagnostics
                    .cloud_status
                    .set(format!("Connecting to {} at {}", from_username, addr));
            }
            Err(e) => self.report_error(format!(
                "Could not start session with {}: {}",
                from_username, e
            )),
        }
    }

    fn report_error(&self, message: String) {
        warn!("{}", message);
        self.diagnostics.cloud_status.set(&message);
        self.diagnostics.last_error.set(&message);
    }

    fn fail(&self, message: String) {
        *self.state.lock() = SignalingState::Error(message.clone());
        self.report_error(message);
    }

    fn disconnected(&self) {
        *self.state.lock() = SignalingState::Disconnected;
        self.diagnostics.cloud_status.set("Signaling disconnected");
    }
}

/// Resolve at the pending request's deadline; never without one
async fn request_deadline(pending: &Option<PendingRequest>) {
    match pending {
        Some(request) => sleep_until(request.deadline).await,
        None => std::future::pending().await,
    }
}

fn decode_public_key(encoded: &str) -> Option<[u8; KEY_SIZE]> {
    let bytes = BASE64.decode(encoded).ok()?;
    bytes.try_into().ok()
}

/// Addresses a peer may reach us on at `port`
pub(crate) async fn gather_rendezvous(port: u16, config: &EngineConfig) -> RendezvousInfo {
    let local_addrs = match local_ip_address::local_ip() {
        Ok(ip) => vec![SocketAddr::new(ip, port)],
        Err(e) => {
            debug!("No routable local address: {}", e);
            vec![SocketAddr::new(Ipv4Addr::LOCALHOST.into(), port)]
        }
    };

    // The mapping is only meaningful for the port we will actually use
    let public_addr = if port == 0 || config.stun_servers.is_empty() {
        None
    } else {
        let stun_timeout = Duration::from_millis(config.stun_timeout_ms);
        match StunClient::bind(stun_timeout) {
            Ok(client) => match client.discover(&config.stun_servers).await {
                Ok(result) => Some(SocketAddr::new(result.mapped_address.ip(), port)),
                Err(e) => {
                    debug!("STUN discovery failed: {}", e);
                    None
                }
            },
            Err(e) => {
                debug!("STUN socket failed: {}", e);
                None
            }
        }
    };

    RendezvousInfo {
        port,
        public_addr,
        local_addrs,
    }
}
