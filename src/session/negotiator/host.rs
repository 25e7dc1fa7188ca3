//! Host side of a session
//!
//! Waits for a client `Hello`, answers with session parameters, then streams
//! encoded frames and replays the client's input. One client at a time.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use x25519_dalek::PublicKey;

use crate::config::HostConfig;
use crate::error::EngineError;
use crate::input::InputOrdering;
use crate::media::{
    create_encoder, BitrateController, EncodeLoop, EncodedFrame, FrameQueue, KeyframeTrigger,
    TestPatternSource,
};
use crate::network::{
    parity_for, HandshakeKeys, HandshakeRole, NetworkError, Pacer, UdpTransport, FEC_GROUP_SIZE,
};
use crate::protocol::{
    decode, encode, ControlMessage, HandshakeMessage, Hello, HelloAck, InputMessage, Packet,
    PacketType, ParityChunk, SessionParams, VideoChunk, VideoCodec, PROTOCOL_VERSION,
};
use crate::stats::RateMeter;

use super::{
    media_finished, should_say_goodbye, tolerate_io, MediaTask, PeerLink, SessionContext,
    HOUSEKEEPING_INTERVAL,
};

/// Percent of the target bitrate the encoder may fill
///
/// The rest carries parity chunks (one per `FEC_GROUP_SIZE` data chunks) and
/// packet framing.
const ENCODER_SHARE_PERCENT: u64 = 75;

fn encoder_kbps(target_kbps: u32) -> u32 {
    (target_kbps as u64 * ENCODER_SHARE_PERCENT / 100) as u32
}

/// A datagram waiting for the pacer
enum Outbound {
    Chunk(VideoChunk),
    Parity(ParityChunk),
}

/// Run a host session until cancelled or the peer goes away
pub(crate) async fn run_host(
    ctx: SessionContext,
    transport: UdpTransport,
    host: HostConfig,
    punch_rx: mpsc::UnboundedReceiver<Vec<SocketAddr>>,
) -> Result<(), EngineError> {
    let mut session = HostSession::new(ctx, transport, host, punch_rx);
    let result = session.run().await;
    session.shutdown(should_say_goodbye(&result)).await;
    result
}

struct ConnectedPeer {
    link: PeerLink,
    /// Ephemeral key of the accepted `Hello`, to recognise retransmissions
    client_ephemeral: [u8; 32],
    ack: HelloAck,
    params: SessionParams,
    input_order: InputOrdering,
}

struct HostSession {
    ctx: SessionContext,
    transport: UdpTransport,
    host: HostConfig,
    session_id: u64,
    peer: Option<ConnectedPeer>,
    media: Option<MediaTask>,
    queue: Arc<FrameQueue>,
    keyframe: Arc<KeyframeTrigger>,
    bitrate_tx: watch::Sender<u32>,
    rate: BitrateController,
    pacer: Pacer,
    pending: VecDeque<Outbound>,
    meter: RateMeter,
    punch_rx: mpsc::UnboundedReceiver<Vec<SocketAddr>>,
}

impl HostSession {
    fn new(
        ctx: SessionContext,
        transport: UdpTransport,
        host: HostConfig,
        punch_rx: mpsc::UnboundedReceiver<Vec<SocketAddr>>,
    ) -> Self {
        let queue = Arc::new(FrameQueue::new(ctx.config.outbound_queue_frames));
        let (bitrate_tx, _) = watch::channel(encoder_kbps(host.bitrate_kbps));
        Self {
            transport,
            session_id: rand::random(),
            peer: None,
            media: None,
            queue,
            keyframe: Arc::new(KeyframeTrigger::new()),
            bitrate_tx,
            rate: BitrateController::new(host.bitrate_kbps),
            pacer: Pacer::new(host.bitrate_kbps),
            pending: VecDeque::new(),
            meter: RateMeter::new(),
            punch_rx,
            host,
            ctx,
        }
    }

    async fn run(&mut self) -> Result<(), EngineError> {
        let mut housekeeping = interval(HOUSEKEEPING_INTERVAL);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let cancel = self.ctx.cancel.clone();

        info!(
            "Waiting for a client on {} ({}x{}@{})",
            self.transport.local_addr(),
            self.host.width,
            self.host.height,
            self.host.fps
        );

        loop {
            let pace = if self.pending.is_empty() {
                Duration::ZERO
            } else {
                self.pacer.ready_in(Instant::now())
            };

            // Receive and control traffic go first; one paced video datagram per pass
            let step = tokio::select! {
                biased;

                _ = cancel.cancelled() => return Ok(()),

                received = self.transport.recv_from() => match received {
                    Ok((packet, from)) => self.on_packet(packet, from).await,
                    Err(NetworkError::InvalidPacket) => {
                        trace!("Ignoring malformed datagram");
                        Ok(())
                    }
                    Err(e) => {
                        debug!("Receive error: {}", e);
                        Ok(())
                    }
                },

                Some(targets) = self.punch_rx.recv() => {
                    self.punch(targets).await;
                    Ok(())
                }

                _ = housekeeping.tick() => self.on_housekeeping().await,

                result = media_finished(&mut self.media) => {
                    self.media = None;
                    result.map_err(EngineError::from)
                }

                frame = self.queue.pop_wait(), if self.pending.is_empty() && self.peer.is_some() => {
                    self.on_frame(frame);
                    Ok(())
                }

                _ = paced(pace), if !self.pending.is_empty() => self.send_next_chunk().await,
            };
            step?;
        }
    }

    async fn on_packet(&mut self, packet: Packet, from: SocketAddr) -> Result<(), EngineError> {
        if packet.packet_type == PacketType::Handshake && !packet.flags.encrypted {
            return match decode::<HandshakeMessage>(&packet.payload) {
                Ok(HandshakeMessage::Hello(hello)) => self.on_hello(hello, from).await,
                Ok(HandshakeMessage::HelloAck(_)) => Ok(()),
                Err(e) => {
                    debug!("Bad handshake from {}: {}", from, e);
                    Ok(())
                }
            };
        }

        let Some(peer) = self.peer.as_mut() else {
            trace!("Ignoring {:?} from {} before handshake", packet.packet_type, from);
            return Ok(());
        };
        let Some(packet) = peer.link.open(packet, from) else {
            return Ok(());
        };

        match packet.packet_type {
            PacketType::Control => match decode::<ControlMessage>(&packet.payload) {
                Ok(msg) => self.on_control(msg).await,
                Err(e) => {
                    debug!("Bad control message: {}", e);
                    Ok(())
                }
            },
            PacketType::Input => {
                self.on_input(&packet.payload);
                Ok(())
            }
            PacketType::KeepAlive => Ok(()),
            other => {
                trace!("Ignoring {:?} packet from client", other);
                Ok(())
            }
        }
    }

    async fn on_hello(&mut self, hello: Hello, from: SocketAddr) -> Result<(), EngineError> {
        let mut rejoin_params = None;
        if let Some(peer) = &self.peer {
            if peer.link.peer() != from {
                info!("Rejecting {}: already serving {}", from, peer.link.peer());
                return self.reject(from, "busy").await;
            }
            if peer.client_ephemeral == hello.ephemeral_key {
                trace!("Repeating HelloAck to {}", from);
                let ack = HandshakeMessage::HelloAck(peer.ack.clone());
                return self.send_handshake(&ack, from).await;
            }
            rejoin_params = Some(peer.params);
        }

        if hello.protocol_version != PROTOCOL_VERSION {
            return self.reject(from, "unsupported protocol version").await;
        }
        if !hello.codecs.contains(&VideoCodec::DeltaRle) {
            return self.reject(from, "no common codec").await;
        }

        let keys = HandshakeKeys::new(self.ctx.identity.clone());
        let crypto = match keys.derive(
            HandshakeRole::Host,
            &hello.identity_key,
            &hello.ephemeral_key,
        ) {
            Ok(crypto) => crypto,
            Err(e) => {
                warn!("Handshake with {} failed: {}", from, e);
                return self.reject(from, "handshake failed").await;
            }
        };

        let rejoin = rejoin_params.is_some();
        let params = rejoin_params.unwrap_or_else(|| self.negotiate(&hello));
        let ack = HelloAck {
            accepted: true,
            reason: None,
            identity_key: keys.identity_public(),
            ephemeral_key: keys.ephemeral_public(),
            params: Some(params),
        };
        self.send_handshake(&HandshakeMessage::HelloAck(ack.clone()), from)
            .await?;

        self.peer = Some(ConnectedPeer {
            link: PeerLink::new(self.transport.clone(), from, crypto),
            client_ephemeral: hello.ephemeral_key,
            ack,
            params,
            input_order: InputOrdering::new(),
        });
        self.pending.clear();
        self.queue.clear();

        if rejoin {
            info!("Client {} re-joined; session re-keyed", from);
            self.keyframe.request();
        } else {
            info!(
                "Client '{}' joined from {}: {} {}x{}@{} {} kbps",
                hello.client_name,
                from,
                params.codec.name(),
                params.width,
                params.height,
                params.fps,
                params.bitrate_kbps
            );
            self.start_media(params)?;
            self.ctx.stats.set_connected(true);
            self.ctx.stats.set_bitrate_kbps(params.bitrate_kbps);
        }

        {
            let mut info = self.ctx.info.lock();
            info.peer = Some(from);
            info.params = Some(params);
        }
        self.ctx.stats.publish();
        Ok(())
    }

    fn negotiate(&self, hello: &Hello) -> SessionParams {
        let (max_width, max_height) = hello.max_resolution;
        SessionParams {
            codec: VideoCodec::DeltaRle,
            width: fit_dimension(self.host.width, max_width),
            height: fit_dimension(self.host.height, max_height),
            fps: self.host.fps.min(u16::MAX as u32) as u16,
            bitrate_kbps: self.host.bitrate_kbps,
            keyframe_interval_ms: self.host.keyframe_interval_ms,
            session_id: self.session_id,
        }
    }

    fn start_media(&mut self, params: SessionParams) -> Result<(), EngineError> {
        let source = TestPatternSource::new(
            params.width as u32,
            params.height as u32,
            self.host.display_id,
        )?;
        let encoder = create_encoder(
            params.codec,
            encoder_kbps(params.bitrate_kbps),
            params.fps as u32,
        )?;

        let encode = EncodeLoop {
            source: Box::new(source),
            encoder,
            queue: self.queue.clone(),
            keyframe: self.keyframe.clone(),
            stats: self.ctx.stats.clone(),
            fps: params.fps as u32,
            keyframe_interval: Duration::from_millis(params.keyframe_interval_ms as u64),
            max_consecutive_errors: self.ctx.config.max_consecutive_media_errors,
            bitrate: self.bitrate_tx.subscribe(),
        };
        let cancel = self.ctx.cancel.child_token();
        self.media = Some(MediaTask::spawn(cancel.clone(), encode.run(cancel)));
        Ok(())
    }

    async fn reject(&self, to: SocketAddr, reason: &str) -> Result<(), EngineError> {
        let ack = HelloAck {
            accepted: false,
            reason: Some(reason.to_string()),
            identity_key: PublicKey::from(&self.ctx.identity).to_bytes(),
            ephemeral_key: [0u8; 32],
            params: None,
        };
        self.send_handshake(&HandshakeMessage::HelloAck(ack), to)
            .await
    }

    async fn send_handshake(
        &self,
        msg: &HandshakeMessage,
        to: SocketAddr,
    ) -> Result<(), EngineError> {
        let payload = encode(msg).map_err(NetworkError::from)?;
        let packet = Packet::new(PacketType::Handshake, 0, 0, payload);
        let size = packet.payload.len();
        tolerate_io(self.transport.send_to(&packet, to).await.map(|_| size))?;
        Ok(())
    }

    async fn on_control(&mut self, msg: ControlMessage) -> Result<(), EngineError> {
        let Some(peer) = self.peer.as_mut() else {
            return Ok(());
        };

        match msg {
            ControlMessage::Ping {
                ping_sequence,
                sent_time_us,
            } => {
                let pong = ControlMessage::Pong {
                    ping_sequence,
                    sent_time_us,
                };
                tolerate_io(peer.link.send(PacketType::Control, &pong).await)?;
            }
            ControlMessage::Pong { .. } => {}
            ControlMessage::Stats(report) => {
                self.ctx.stats.set_rtt_ms((report.rtt_us / 1000) as u32);
                self.ctx.stats.set_packets_lost(report.packets_lost);
                if let Some(kbps) = self
                    .rate
                    .on_report(report.packets_received, report.packets_lost)
                {
                    self.pacer.set_rate(kbps);
                    self.bitrate_tx.send_replace(encoder_kbps(kbps));
                }
            }
            ControlMessage::KeyframeRequest { last_frame_id } => {
                debug!("Client requested a keyframe (last good {:?})", last_frame_id);
                self.pending.clear();
                self.queue.clear();
                self.keyframe.request();
            }
            ControlMessage::Goodbye { reason } => {
                info!("Client left: {}", reason);
                return Err(NetworkError::PeerClosed(reason).into());
            }
        }
        Ok(())
    }

    fn on_input(&mut self, payload: &[u8]) {
        let Some(peer) = self.peer.as_mut() else {
            return;
        };
        let msg: InputMessage = match decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Bad input message: {}", e);
                return;
            }
        };
        if !peer.input_order.accept(msg.seq) {
            trace!(
                "Dropping stale input {} ({} stale so far)",
                msg.seq,
                peer.input_order.dropped()
            );
            return;
        }

        match self.ctx.injector.lock().as_mut() {
            Some(injector) => {
                if let Err(e) = injector.inject_from(msg.event, msg.source_width, msg.source_height)
                {
                    warn!("Input injection failed: {}", e);
                }
            }
            None => trace!("No injector installed; dropping input {}", msg.seq),
        }
    }

    async fn on_housekeeping(&mut self) -> Result<(), EngineError> {
        let timeout = self.ctx.peer_timeout();
        let Some(peer) = self.peer.as_mut() else {
            return Ok(());
        };

        if peer.link.silent_for() > timeout {
            warn!("Client {} silent for {:?}", peer.link.peer(), timeout);
            return Err(NetworkError::PeerTimeout(self.ctx.config.peer_timeout_ms).into());
        }
        tolerate_io(peer.link.send_keep_alive().await)?;

        if let Some((_, kbps)) = self.meter.poll() {
            self.ctx.stats.set_bitrate_kbps(kbps);
        }
        self.ctx.stats.publish();
        Ok(())
    }

    fn on_frame(&mut self, frame: EncodedFrame) {
        match VideoChunk::split(frame.frame_id, frame.timestamp_us, frame.keyframe, &frame.data) {
            Ok(chunks) => {
                trace!("Frame {} -> {} chunks", frame.frame_id, chunks.len());
                for group in chunks.chunks(FEC_GROUP_SIZE) {
                    let parity = parity_for(group);
                    self.pending
                        .extend(group.iter().cloned().map(Outbound::Chunk));
                    self.pending.extend(parity.map(Outbound::Parity));
                }
            }
            Err(e) => {
                warn!("Cannot send frame {}: {}", frame.frame_id, e);
                self.ctx.stats.add_frames_dropped(1);
                self.keyframe.request();
            }
        }
    }

    async fn send_next_chunk(&mut self) -> Result<(), EngineError> {
        let Some(peer) = self.peer.as_mut() else {
            self.pending.clear();
            return Ok(());
        };
        let sent = match self.pending.pop_front() {
            Some(Outbound::Chunk(chunk)) => tolerate_io(peer.link.send_chunk(&chunk).await)?,
            Some(Outbound::Parity(parity)) => tolerate_io(peer.link.send_parity(&parity).await)?,
            None => return Ok(()),
        };
        self.pacer.consume(sent, Instant::now());
        self.meter.record(sent);
        Ok(())
    }

    /// Open our NAT mapping toward a peer announced through signaling
    async fn punch(&self, targets: Vec<SocketAddr>) {
        let punch = Packet::keep_alive(0).to_bytes();
        for target in targets {
            debug!("Hole-punch packet to {}", target);
            if let Err(e) = self.transport.send_raw(&punch, target).await {
                debug!("Hole punch to {} failed: {}", target, e);
            }
        }
    }

    async fn shutdown(&mut self, say_goodbye: bool) {
        if let Some(media) = self.media.take() {
            media.stop().await;
        }
        if say_goodbye {
            if let Some(peer) = self.peer.as_mut() {
                let goodbye = ControlMessage::Goodbye {
                    reason: "host stopped".to_string(),
                };
                if let Err(e) = peer.link.send(PacketType::Control, &goodbye).await {
                    debug!("Goodbye not sent: {}", e);
                }
            }
        }
        info!("Host session on {} ended", self.transport.local_addr());
    }
}

/// Resolve once the pacer allows the next datagram
async fn paced(delay: Duration) {
    if !delay.is_zero() {
        sleep(delay).await;
    }
}

/// Fit a configured dimension within the client's limit (zero is no limit)
fn fit_dimension(configured: u32, client_max: u16) -> u16 {
    let configured = configured.min(u16::MAX as u32) as u16;
    if client_max == 0 {
        configured
    } else {
        configured.min(client_max)
    }
}
