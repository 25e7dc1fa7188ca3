//! Signaling protocol, client connection and rendezvous server
//!
//! Peers authenticate with a token, are known to each other by username and
//! exchange connect requests carrying their public key and UDP rendezvous
//! candidates. Messages are JSON text frames over a WebSocket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{accept_async, connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::error::NetworkError;

/// Error code for a bad or missing token
pub const ERROR_UNAUTHORIZED: u16 = 401;

/// Error code for an unknown or offline user
pub const ERROR_NOT_FOUND: u16 = 404;

/// Error code for a message the server cannot act on
pub const ERROR_BAD_REQUEST: u16 = 400;

/// UDP candidates a peer can be reached on
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendezvousInfo {
    /// Port the session socket is (or will be) bound to
    pub port: u16,
    /// Public address discovered via STUN
    pub public_addr: Option<SocketAddr>,
    /// Addresses of local interfaces
    pub local_addrs: Vec<SocketAddr>,
}

impl RendezvousInfo {
    /// Preferred address to reach the peer on
    pub fn candidate(&self) -> Option<SocketAddr> {
        self.public_addr.or_else(|| self.local_addrs.first().copied())
    }

    /// Every known address, public first
    pub fn candidates(&self) -> Vec<SocketAddr> {
        self.public_addr
            .into_iter()
            .chain(self.local_addrs.iter().copied())
            .collect()
    }
}

/// Signaling message types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SignalingMessage {
    // Client -> Server
    Bind {
        token: String,
        /// Base64 x25519 public key
        public_key: String,
    },
    ConnectRequest {
        request_id: String,
        target_username: String,
        public_key: String,
        rendezvous: RendezvousInfo,
    },
    ConnectAnswer {
        request_id: String,
        target_username: String,
        accepted: bool,
        reason: Option<String>,
        rendezvous: Option<RendezvousInfo>,
    },

    // Server -> Client
    Bound {
        username: String,
    },
    IncomingRequest {
        request_id: String,
        from_username: String,
        public_key: String,
        rendezvous: RendezvousInfo,
    },
    RequestAnswered {
        request_id: String,
        from_username: String,
        accepted: bool,
        reason: Option<String>,
        public_key: String,
        rendezvous: Option<RendezvousInfo>,
    },
    Error {
        request_id: Option<String>,
        code: u16,
        message: String,
    },
}

/// Connection state of the signaling client
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SignalingState {
    #[default]
    Disconnected,
    Connecting,
    Connected { username: String },
    Error(String),
}

impl SignalingState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// Validate a signaling endpoint URL
pub fn validate_url(url: &str) -> Result<(), NetworkError> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        Ok(())
    } else {
        Err(NetworkError::Signaling(format!(
            "URL must use ws:// or wss://: {}",
            url
        )))
    }
}

/// An active connection to the signaling server
pub struct SignalingConnection {
    ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<TcpStream>,
    >,
}

impl SignalingConnection {
    /// Open a WebSocket to the server
    pub async fn connect(url: &str) -> Result<Self, NetworkError> {
        validate_url(url)?;
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| NetworkError::Signaling(format!("Connect failed: {}", e)))?;

        debug!("Connected to signaling server: {}", url);
        Ok(Self { ws_stream })
    }

    /// Send a message to the server
    pub async fn send(&mut self, msg: &SignalingMessage) -> Result<(), NetworkError> {
        let json = serde_json::to_string(msg)
            .map_err(|e| NetworkError::Signaling(format!("Serialize failed: {}", e)))?;

        self.ws_stream
            .send(Message::Text(json))
            .await
            .map_err(|e| NetworkError::Signaling(format!("Send failed: {}", e)))
    }

    /// Receive the next message from the server
    pub async fn recv(&mut self) -> Result<SignalingMessage, NetworkError> {
        loop {
            match self.ws_stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(&text).map_err(|e| {
                        NetworkError::Signaling(format!("Deserialize failed: {}", e))
                    });
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(NetworkError::Signaling("Connection closed".to_string()));
                }
                Some(Err(e)) => {
                    return Err(NetworkError::Signaling(format!("Receive failed: {}", e)));
                }
                _ => continue,
            }
        }
    }

    /// Close the connection
    pub async fn close(mut self) -> Result<(), NetworkError> {
        self.ws_stream
            .close(None)
            .await
            .map_err(|e| NetworkError::Signaling(format!("Close failed: {}", e)))
    }
}

struct OnlineUser {
    connection_id: Uuid,
    public_key: String,
    tx: mpsc::UnboundedSender<SignalingMessage>,
}

struct ServerState {
    /// token -> username
    tokens: HashMap<String, String>,
    online: RwLock<HashMap<String, OnlineUser>>,
}

/// Rendezvous server routing connect requests between bound users
#[derive(Clone)]
pub struct SignalingServer {
    state: Arc<ServerState>,
}

impl SignalingServer {
    /// Create a server accepting the given token -> username registrations
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self {
            state: Arc::new(ServerState {
                tokens,
                online: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Accept plain WebSocket connections forever
    pub async fn run(&self, listener: TcpListener) -> Result<(), NetworkError> {
        info!(
            "Signaling server listening on {}",
            listener.local_addr()?
        );

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    info!("New signaling connection from {}", peer_addr);
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.serve_connection(stream).await {
                            warn!("Connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }

    /// Number of users currently bound
    pub async fn online_count(&self) -> usize {
        self.state.online.read().await.len()
    }

    /// Serve one WebSocket over any byte stream (plain TCP or TLS)
    pub async fn serve_connection<S>(&self, stream: S) -> Result<(), NetworkError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ws_stream = accept_async(stream)
            .await
            .map_err(|e| NetworkError::Signaling(format!("WebSocket accept failed: {}", e)))?;

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<SignalingMessage>();
        let connection_id = Uuid::new_v4();
        let mut username: Option<String> = None;

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<SignalingMessage>(&text) {
                                Ok(msg) => {
                                    self.process_message(msg, connection_id, &tx, &mut username).await;
                                }
                                Err(e) => {
                                    warn!("Invalid message: {}", e);
                                    let _ = tx.send(SignalingMessage::Error {
                                        request_id: None,
                                        code: ERROR_BAD_REQUEST,
                                        message: "malformed message".to_string(),
                                    });
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!("WebSocket error: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }

                outbound = rx.recv() => {
                    let Some(msg) = outbound else { break };
                    let json = serde_json::to_string(&msg)
                        .map_err(|e| NetworkError::Signaling(format!("Serialize failed: {}", e)))?;
                    if write.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
            }
        }

        if let Some(name) = username {
            let mut online = self.state.online.write().await;
            if online
                .get(&name)
                .is_some_and(|user| user.connection_id == connection_id)
            {
                online.remove(&name);
                info!("User {} went offline", name);
            }
        }

        Ok(())
    }

    async fn process_message(
        &self,
        msg: SignalingMessage,
        connection_id: Uuid,
        tx: &mpsc::UnboundedSender<SignalingMessage>,
        username: &mut Option<String>,
    ) {
        let reply = match msg {
            SignalingMessage::Bind { token, public_key } => {
                match self.state.tokens.get(&token) {
                    Some(name) => {
                        self.state.online.write().await.insert(
                            name.clone(),
                            OnlineUser {
                                connection_id,
                                public_key,
                                tx: tx.clone(),
                            },
                        );
                        info!("User {} bound", name);
                        *username = Some(name.clone());
                        SignalingMessage::Bound {
                            username: name.clone(),
                        }
                    }
                    None => SignalingMessage::Error {
                        request_id: None,
                        code: ERROR_UNAUTHORIZED,
                        message: "invalid token".to_string(),
                    },
                }
            }

            SignalingMessage::ConnectRequest {
                request_id,
                target_username,
                public_key,
                rendezvous,
            } => {
                let Some(from) = username.clone() else {
                    return send_unbound(tx, request_id);
                };
                let online = self.state.online.read().await;
                match online.get(&target_username) {
                    Some(target) => {
                        debug!("Routing request {} from {} to {}", request_id, from, target_username);
                        let _ = target.tx.send(SignalingMessage::IncomingRequest {
                            request_id,
                            from_username: from,
                            public_key,
                            rendezvous,
                        });
                        return;
                    }
                    None => SignalingMessage::Error {
                        request_id: Some(request_id),
                        code: ERROR_NOT_FOUND,
                        message: format!("user not found: {}", target_username),
                    },
                }
            }

            SignalingMessage::ConnectAnswer {
                request_id,
                target_username,
                accepted,
                reason,
                rendezvous,
            } => {
                let Some(from) = username.clone() else {
                    return send_unbound(tx, request_id);
                };
                let online = self.state.online.read().await;
                let public_key = online
                    .get(&from)
                    .map(|user| user.public_key.clone())
                    .unwrap_or_default();
                match online.get(&target_username) {
                    Some(target) => {
                        let _ = target.tx.send(SignalingMessage::RequestAnswered {
                            request_id,
                            from_username: from,
                            accepted,
                            reason,
                            public_key,
                            rendezvous,
                        });
                        return;
                    }
                    None => SignalingMessage::Error {
                        request_id: Some(request_id),
                        code: ERROR_NOT_FOUND,
                        message: format!("user not found: {}", target_username),
                    },
                }
            }

            other => {
                debug!("Ignoring server-bound message from client: {:?}", other);
                return;
            }
        };

        let _ = tx.send(reply);
    }
}

fn send_unbound(tx: &mpsc::UnboundedSender<SignalingMessage>, request_id: String) {
    let _ = tx.send(SignalingMessage::Error {
        request_id: Some(request_id),
        code: ERROR_UNAUTHORIZED,
        message: "bind first".to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signaling_message_serialize() {
        let msg = SignalingMessage::ConnectRequest {
            request_id: "r1".to_string(),
            target_username: "alice".to_string(),
            public_key: "AAAA".to_string(),
            rendezvous: RendezvousInfo {
                port: 5000,
                public_addr: Some("203.0.113.9:5000".parse().unwrap()),
                local_addrs: vec!["192.168.1.2:5000".parse().unwrap()],
            },
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"ConnectRequest\""));
        let parsed: SignalingMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_rendezvous_candidate_prefers_public() {
        let mut info = RendezvousInfo {
            port: 5000,
            public_addr: None,
            local_addrs: vec!["10.0.0.2:5000".parse().unwrap()],
        };
        assert_eq!(info.candidate(), Some("10.0.0.2:5000".parse().unwrap()));

        info.public_addr = Some("198.51.100.1:6000".parse().unwrap());
        assert_eq!(info.candidate(), Some("198.51.100.1:6000".parse().unwrap()));
        assert_eq!(info.candidates().len(), 2);
    }

    #[test]
    fn test_validate_url() {
        assert!(validate_url("ws://127.0.0.1:9000").is_ok());
        assert!(validate_url("wss://example.com/ws").is_ok());
        assert!(validate_url("http://example.com").is_err());
        assert!(validate_url("").is_err());
    }

    #[tokio::test]
    async fn test_server_routes_request_and_rejects_unknown() {
        let mut tokens = HashMap::new();
        tokens.insert("tok-a".to_string(), "alice".to_string());
        tokens.insert("tok-b".to_string(), "bob".to_string());
        let server = SignalingServer::new(tokens);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let runner = server.clone();
        tokio::spawn(async move { runner.run(listener).await });

        let mut alice = SignalingConnection::connect(&url).await.unwrap();
        let mut bob = SignalingConnection::connect(&url).await.unwrap();

        alice
            .send(&SignalingMessage::Bind {
                token: "tok-a".to_string(),
                public_key: "a-key".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(
            alice.recv().await.unwrap(),
            SignalingMessage::Bound {
                username: "alice".to_string()
            }
        );
        bob.send(&SignalingMessage::Bind {
            token: "tok-b".to_string(),
            public_key: "b-key".to_string(),
        })
        .await
        .unwrap();
        bob.recv().await.unwrap();

        alice
            .send(&SignalingMessage::ConnectRequest {
                request_id: "r1".to_string(),
                target_username: "bob".to_string(),
                public_key: "a-key".to_string(),
                rendezvous: RendezvousInfo::default(),
            })
            .await
            .unwrap();
        match bob.recv().await.unwrap() {
            SignalingMessage::IncomingRequest {
                request_id,
                from_username,
                ..
            } => {
                assert_eq!(request_id, "r1");
                assert_eq!(from_username, "alice");
            }
            other => panic!("Unexpected message: {:?}", other),
        }

        bob.send(&SignalingMessage::ConnectAnswer {
            request_id: "r1".to_string(),
            target_username: "alice".to_string(),
            accepted: true,
            reason: None,
            rendezvous: Some(RendezvousInfo::default()),
        })
        .await
        .unwrap();
        match alice.recv().await.unwrap() {
            SignalingMessage::RequestAnswered {
                accepted,
                public_key,
                ..
            } => {
                assert!(accepted);
                assert_eq!(public_key, "b-key");
            }
            other => panic!("Unexpected message: {:?}", other),
        }

        alice
            .send(&SignalingMessage::ConnectRequest {
                request_id: "r2".to_string(),
                target_username: "nobody".to_string(),
                public_key: "a-key".to_string(),
                rendezvous: RendezvousInfo::default(),
            })
            .await
            .unwrap();
        match alice.recv().await.unwrap() {
            SignalingMessage::Error {
                request_id, code, ..
            } => {
                assert_eq!(request_id.as_deref(), Some("r2"));
                assert_eq!(code, ERROR_NOT_FOUND);
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_rejects_bad_token() {
        let server = SignalingServer::new(HashMap::new());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let runner = server.clone();
        tokio::spawn(async move { runner.run(listener).await });

        let mut conn = SignalingConnection::connect(&url).await.unwrap();
        conn.send(&SignalingMessage::Bind {
            token: "wrong".to_string(),
            public_key: String::new(),
        })
        .await
        .unwrap();

        match conn.recv().await.unwrap() {
            SignalingMessage::Error { code, .. } => assert_eq!(code, ERROR_UNAUTHORIZED),
            other => panic!("Unexpected message: {:?}", other),
        }
        assert_eq!(server.online_count().await, 0);
    }
}
