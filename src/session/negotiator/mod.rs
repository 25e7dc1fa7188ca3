//! Peer session negotiation and transport loops
//!
//! `host` waits for a client's `Hello`, `client` dials a host. Once the
//! handshake completes both sides talk through a `PeerLink`, which seals every
//! packet with the session keys and filters what comes back.

mod client;
mod host;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};
use x25519_dalek::StaticSecret;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::input::ScaledInjector;
use crate::media::{MediaError, RendererSlot};
use crate::network::{NetworkError, SessionCrypto, SequenceTracker, UdpTransport};
use crate::protocol::{encode, Packet, PacketType, ParityChunk, VideoChunk, HEADER_SIZE};
use crate::stats::StatsAggregator;

use super::SessionInfo;

pub(crate) use client::run_client;
pub(crate) use host::run_host;

/// Interval between client `Hello` retransmissions
pub(crate) const HELLO_RETRY: Duration = Duration::from_millis(250);

/// Minimum spacing of keyframe requests sent by the client
pub(crate) const KEYFRAME_REQUEST_INTERVAL: Duration = Duration::from_millis(250);

/// Liveness, stats and ping period
pub(crate) const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(1);

/// Name the client announces in its `Hello`
pub(crate) const CLIENT_NAME: &str = "castline";

/// Shared slot for the injector installed by the embedding application
pub(crate) type InjectorSlot = Arc<Mutex<Option<ScaledInjector>>>;

/// Everything a session worker needs from the engine
pub(crate) struct SessionContext {
    pub config: EngineConfig,
    pub identity: StaticSecret,
    pub stats: Arc<StatsAggregator>,
    pub renderer: RendererSlot,
    pub injector: InjectorSlot,
    pub info: Arc<Mutex<SessionInfo>>,
    pub cancel: CancellationToken,
}

impl SessionContext {
    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.config.peer_timeout_ms)
    }
}

/// Encrypted, sequenced channel to the one connected peer
pub(crate) struct PeerLink {
    transport: UdpTransport,
    peer: SocketAddr,
    crypto: SessionCrypto,
    /// `None` once the sequence space is used up; the nonce must never repeat
    next_sequence: Option<u32>,
    started: Instant,
    received: SequenceTracker,
    last_heard: Instant,
}

impl PeerLink {
    pub fn new(transport: UdpTransport, peer: SocketAddr, crypto: SessionCrypto) -> Self {
        let now = Instant::now();
        Self {
            transport,
            peer,
            crypto,
            next_sequence: Some(0),
            started: now,
            received: SequenceTracker::new(),
            last_heard: now,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Seal and send a typed message; returns the datagram size
    pub async fn send<T: Serialize>(
        &mut self,
        packet_type: PacketType,
        msg: &T,
    ) -> Result<usize, NetworkError> {
        self.send_payload(packet_type, encode(msg)?, false).await
    }

    pub async fn send_chunk(&mut self, chunk: &VideoChunk) -> Result<usize, NetworkError> {
        self.send_payload(PacketType::Video, encode(chunk)?, chunk.keyframe)
            .await
    }

    pub async fn send_parity(&mut self, parity: &ParityChunk) -> Result<usize, NetworkError> {
        self.send_payload(PacketType::VideoParity, encode(parity)?, parity.keyframe)
            .await
    }

    pub async fn send_keep_alive(&mut self) -> Result<usize, NetworkError> {
        self.send_payload(PacketType::KeepAlive, Vec::new(), false)
            .await
    }

    async fn send_payload(
        &mut self,
        packet_type: PacketType,
        payload: Vec<u8>,
        keyframe: bool,
    ) -> Result<usize, NetworkError> {
        let sequence = self.next_sequence.ok_or_else(|| {
            NetworkError::Encryption("packet sequence space exhausted".to_string())
        })?;
        self.next_sequence = sequence.checked_add(1);

        let timestamp = self.started.elapsed().as_millis() as u32;
        let mut packet = Packet::new(packet_type, sequence, timestamp, payload);
        packet.flags.keyframe = keyframe;
        self.crypto.seal(&mut packet)?;

        let size = HEADER_SIZE + packet.payload.len();
        self.transport.send_to(&packet, self.peer).await?;
        Ok(size)
    }

    /// Authenticate an inbound packet and drop replays
    pub fn open(&mut self, mut packet: Packet, from: SocketAddr) -> Option<Packet> {
        if from != self.peer || !packet.flags.encrypted {
            return None;
        }
        if let Err(e) = self.crypto.open(&mut packet) {
            trace!("Dropping packet from {}: {}", from, e);
            return None;
        }
        let outcome = self.received.record(packet.sequence);
        if !outcome.is_fresh() {
            trace!("Dropping packet {} ({:?})", packet.sequence, outcome);
            return None;
        }
        self.last_heard = Instant::now();
        Some(packet)
    }

    pub fn silent_for(&self) -> Duration {
        self.last_heard.elapsed()
    }

    pub fn packets_received(&self) -> u64 {
        self.received.packets_received()
    }

    pub fn packets_lost(&self) -> u64 {
        self.received.packets_lost()
    }
}

/// Socket-level send failures are transient; anything else ends the session
pub(crate) fn tolerate_io(result: Result<usize, NetworkError>) -> Result<usize, NetworkError> {
    match result {
        Err(NetworkError::Io(e)) => {
            warn!("Send failed: {}", e);
            Ok(0)
        }
        other => other,
    }
}

/// Whether the peer can still hear a `Goodbye`
pub(crate) fn should_say_goodbye(result: &Result<(), EngineError>) -> bool {
    !matches!(
        result,
        Err(EngineError::Network(
            NetworkError::PeerClosed(_) | NetworkError::PeerTimeout(_)
        ))
    )
}

/// An encode or decode loop running beside the transport loop
pub(crate) struct MediaTask {
    cancel: CancellationToken,
    handle: JoinHandle<Result<(), MediaError>>,
}

impl MediaTask {
    pub fn spawn<F>(cancel: CancellationToken, task: F) -> Self
    where
        F: Future<Output = Result<(), MediaError>> + Send + 'static,
    {
        Self {
            cancel,
            handle: tokio::spawn(task),
        }
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

/// Resolve when the media task ends; never resolves without one
///
/// The caller must clear the slot once this returns.
pub(crate) async fn media_finished(task: &mut Option<MediaTask>) -> Result<(), MediaError> {
    match task {
        Some(task) => match (&mut task.handle).await {
            Ok(result) => result,
            Err(e) => Err(MediaError::Corrupt(format!("media task failed: {}", e))),
        },
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;

    use super::*;
    use crate::network::{HandshakeKeys, HandshakeRole};
    use crate::protocol::{decode, ControlMessage};

    fn crypto_pair() -> (SessionCrypto, SessionCrypto) {
        let host = HandshakeKeys::new(StaticSecret::random_from_rng(OsRng));
        let client = HandshakeKeys::new(StaticSecret::random_from_rng(OsRng));
        let host_crypto = host
            .derive(
                HandshakeRole::Host,
                &client.identity_public(),
                &client.ephemeral_public(),
            )
            .unwrap();
        let client_crypto = client
            .derive(
                HandshakeRole::Client,
                &host.identity_public(),
                &host.ephemeral_public(),
            )
            .unwrap();
        (host_crypto, client_crypto)
    }

    fn loopback() -> UdpTransport {
        UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_link_roundtrip_and_replay() {
        let (host_crypto, client_crypto) = crypto_pair();
        let host_transport = loopback();
        let client_transport = loopback();

        let mut client = PeerLink::new(
            client_transport.clone(),
            host_transport.local_addr(),
            client_crypto,
        );
        let mut host = PeerLink::new(
            host_transport.clone(),
            client_transport.local_addr(),
            host_crypto,
        );

        let goodbye = ControlMessage::Goodbye {
            reason: "done".to_string(),
        };
        client.send(PacketType::Control, &goodbye).await.unwrap();

        let (packet, from) = host_transport.recv_from().await.unwrap();
        let replay = packet.clone();
        let opened = host.open(packet, from).expect("packet should open");
        assert_eq!(decode::<ControlMessage>(&opened.payload).unwrap(), goodbye);
        assert_eq!(host.packets_received(), 1);

        assert!(host.open(replay, from).is_none());
    }

    #[tokio::test]
    async fn test_link_ignores_other_senders() {
        let (host_crypto, client_crypto) = crypto_pair();
        let host_transport = loopback();
        let client_transport = loopback();
        let stranger = loopback();

        let mut host = PeerLink::new(
            host_transport.clone(),
            client_transport.local_addr(),
            host_crypto,
        );
        let mut impostor = PeerLink::new(stranger, host_transport.local_addr(), client_crypto);

        impostor.send_keep_alive().await.unwrap();
        let (packet, from) = host_transport.recv_from().await.unwrap();
        assert!(host.open(packet, from).is_none());
    }

    #[tokio::test]
    async fn test_unencrypted_packet_rejected() {
        let (host_crypto, _) = crypto_pair();
        let host_transport = loopback();
        let client_transport = loopback();
        let mut host = PeerLink::new(
            host_transport.clone(),
            client_transport.local_addr(),
            host_crypto,
        );

        client_transport
            .send_to(&Packet::keep_alive(1), host_transport.local_addr())
            .await
            .unwrap();
        let (packet, from) = host_transport.recv_from().await.unwrap();
        assert!(host.open(packet, from).is_none());
    }

    #[test]
    fn test_tolerate_io() {
        let io = Err(NetworkError::Io(std::io::Error::other("ENOBUFS")));
        assert_eq!(tolerate_io(io).unwrap(), 0);
        assert!(tolerate_io(Err(NetworkError::NotConnected)).is_err());
    }

    #[test]
    fn test_goodbye_only_when_peer_can_hear() {
        assert!(should_say_goodbye(&Ok(())));
        assert!(should_say_goodbye(&Err(EngineError::Media(
            MediaError::Corrupt("bad".to_string())
        ))));
        assert!(!should_say_goodbye(&Err(EngineError::Network(
            NetworkError::PeerTimeout(5000)
        ))));
    }
}
