//! Client side of a session

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::lookup_host;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval, sleep_until, timeout, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::error::EngineError;
use crate::input::InputEvent;
use crate::media::{
    create_decoder, AssembledFrame, DecodeFeedback, DecodeLoop, EncodedFrame, FrameAssembler,
};
use crate::network::{HandshakeKeys, HandshakeRole, NetworkError, RttEstimator, UdpTransport};
use crate::protocol::{
    decode, encode, ControlMessage, HandshakeMessage, Hello, InputMessage, Packet, PacketType,
    ParityChunk, SessionParams, StatsReport, VideoChunk, VideoCodec, PROTOCOL_VERSION,
};
use crate::stats::RateMeter;

use super::{
    media_finished, should_say_goodbye, tolerate_io, MediaTask, PeerLink, SessionContext,
    CLIENT_NAME, HELLO_RETRY, HOUSEKEEPING_INTERVAL, KEYFRAME_REQUEST_INTERVAL,
};

/// Reassembled frames buffered for the decoder
const DECODE_QUEUE_FRAMES: usize = 8;

/// Partial frames older than this are abandoned
const ASSEMBLY_TIMEOUT: Duration = Duration::from_millis(500);

/// Connect to `host:port` and run the session until cancelled or the host leaves
///
/// `expected_identity` pins the host's static key when it was learned through
/// signaling.
pub(crate) async fn run_client(
    ctx: SessionContext,
    host: String,
    port: u16,
    expected_identity: Option<[u8; 32]>,
    input_rx: mpsc::Receiver<InputEvent>,
) -> Result<(), EngineError> {
    let cancel = ctx.cancel.clone();
    let connect_timeout = Duration::from_millis(ctx.config.connect_timeout_ms);
    let deadline = tokio::time::Instant::now() + connect_timeout;

    let remote = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        resolved = timeout(connect_timeout, resolve(&host, port)) => {
            resolved.map_err(|_| NetworkError::ConnectionTimeout)??
        }
    };

    let transport = UdpTransport::bind_ephemeral_for(remote)?;
    {
        let mut info = ctx.info.lock();
        info.local_addr = Some(transport.local_addr());
        info.peer = Some(remote);
    }
    info!("Connecting to {} from {}", remote, transport.local_addr());

    let (link, params) = tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        result = handshake(&ctx, &transport, remote, expected_identity, deadline) => result?,
    };

    ctx.info.lock().params = Some(params);
    ctx.stats.set_connected(true);
    ctx.stats.publish();
    info!(
        "Connected to {}: {} {}x{}@{}",
        remote,
        params.codec.name(),
        params.width,
        params.height,
        params.fps
    );

    let mut session = ClientSession::new(ctx, transport, link, params)?;
    let result = session.run(input_rx).await;
    session.shutdown(should_say_goodbye(&result)).await;
    result
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, NetworkError> {
    let mut addrs: Vec<SocketAddr> = lookup_host((host, port))
        .await
        .map_err(|e| NetworkError::Resolve(format!("{}: {}", host, e)))?
        .collect();
    // Hosts bind IPv4 by default
    addrs.sort_by_key(|addr| !addr.is_ipv4());
    addrs
        .into_iter()
        .next()
        .ok_or_else(|| NetworkError::Resolve(host.to_string()))
}

/// Send `Hello` until the host answers or the deadline passes
async fn handshake(
    ctx: &SessionContext,
    transport: &UdpTransport,
    remote: SocketAddr,
    expected_identity: Option<[u8; 32]>,
    deadline: tokio::time::Instant,
) -> Result<(PeerLink, SessionParams), EngineError> {
    let keys = HandshakeKeys::new(ctx.identity.clone());
    let hello = HandshakeMessage::Hello(Hello {
        protocol_version: PROTOCOL_VERSION,
        client_name: CLIENT_NAME.to_string(),
        identity_key: keys.identity_public(),
        ephemeral_key: keys.ephemeral_public(),
        codecs: vec![VideoCodec::DeltaRle],
        max_resolution: (0, 0),
    });
    let hello = Packet::new(
        PacketType::Handshake,
        0,
        0,
        encode(&hello).map_err(NetworkError::from)?,
    )
    .to_bytes();

    let mut retry = interval(HELLO_RETRY);
    loop {
        tokio::select! {
            _ = sleep_until(deadline) => {
                warn!("No answer from {}", remote);
                return Err(NetworkError::ConnectionTimeout.into());
            }
            _ = retry.tick() => {
                trace!("Hello -> {}", remote);
                let size = hello.len();
                tolerate_io(transport.send_raw(&hello, remote).await.map(|_| size))?;
            }
            received = transport.recv_from() => {
                let Ok((packet, from)) = received else { continue };
                if from != remote || packet.packet_type != PacketType::Handshake {
                    continue;
                }
                let Ok(HandshakeMessage::HelloAck(ack)) = decode::<HandshakeMessage>(&packet.payload) else {
                    continue;
                };

                if !ack.accepted {
                    let reason = ack.reason.unwrap_or_else(|| "refused".to_string());
                    return Err(NetworkError::ConnectionRefused(reason).into());
                }
                if expected_identity.is_some_and(|key| key != ack.identity_key) {
                    return Err(NetworkError::Encryption("host identity mismatch".to_string()).into());
                }
                let params = ack.params.ok_or_else(|| {
                    NetworkError::ConnectionRefused("host sent no session parameters".to_string())
                })?;
                let crypto = keys.derive(HandshakeRole::Client, &ack.identity_key, &ack.ephemeral_key)?;
                return Ok((PeerLink::new(transport.clone(), remote, crypto), params));
            }
        }
    }
}

struct ClientSession {
    ctx: SessionContext,
    transport: UdpTransport,
    link: PeerLink,
    params: SessionParams,
    assembler: FrameAssembler,
    rtt: RttEstimator,
    frames_tx: mpsc::Sender<EncodedFrame>,
    feedback_rx: mpsc::UnboundedReceiver<DecodeFeedback>,
    decode: Option<MediaTask>,
    input_seq: u64,
    last_keyframe_request: Option<Instant>,
    meter: RateMeter,
}

impl ClientSession {
    fn new(
        ctx: SessionContext,
        transport: UdpTransport,
        link: PeerLink,
        params: SessionParams,
    ) -> Result<Self, EngineError> {
        let (frames_tx, frames) = mpsc::channel(DECODE_QUEUE_FRAMES);
        let (feedback, feedback_rx) = mpsc::unbounded_channel();

        let decode = DecodeLoop {
            decoder: create_decoder(params.codec, params.width as u32, params.height as u32)?,
            renderer: ctx.renderer.clone(),
            stats: ctx.stats.clone(),
            max_fps: params.fps as u32,
            max_consecutive_errors: ctx.config.max_consecutive_media_errors,
            frames,
            feedback,
        };
        let cancel = ctx.cancel.child_token();
        let decode = MediaTask::spawn(cancel.clone(), decode.run(cancel));

        Ok(Self {
            ctx,
            transport,
            link,
            params,
            assembler: FrameAssembler::new(ASSEMBLY_TIMEOUT),
            rtt: RttEstimator::new(),
            frames_tx,
            feedback_rx,
            decode: Some(decode),
            input_seq: 0,
            last_keyframe_request: None,
            meter: RateMeter::new(),
        })
    }

    async fn run(&mut self, mut input_rx: mpsc::Receiver<InputEvent>) -> Result<(), EngineError> {
        let mut housekeeping = interval(HOUSEKEEPING_INTERVAL);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let cancel = self.ctx.cancel.clone();

        loop {
            // Input is small and latency-sensitive, so it goes out first
            let step = tokio::select! {
                biased;

                _ = cancel.cancelled() => return Ok(()),

                Some(event) = input_rx.recv() => self.send_input(event).await,

                Some(feedback) = self.feedback_rx.recv() => self.on_feedback(feedback).await,

                received = self.transport.recv_from() => match received {
                    Ok((packet, from)) => self.on_packet(packet, from).await,
                    Err(e) => {
                        trace!("Receive error: {}", e);
                        Ok(())
                    }
                },

                _ = housekeeping.tick() => self.on_housekeeping().await,

                result = media_finished(&mut self.decode) => {
                    self.decode = None;
                    result.map_err(EngineError::from)
                }
            };
            step?;
        }
    }

    async fn send_input(&mut self, event: InputEvent) -> Result<(), EngineError> {
        self.input_seq += 1;
        let msg = InputMessage {
            seq: self.input_seq,
            source_width: self.params.width as u32,
            source_height: self.params.height as u32,
            event,
        };
        tolerate_io(self.link.send(PacketType::Input, &msg).await)?;
        Ok(())
    }

    async fn on_feedback(&mut self, feedback: DecodeFeedback) -> Result<(), EngineError> {
        let DecodeFeedback::NeedKeyframe { last_frame_id } = feedback;
        if self
            .last_keyframe_request
            .is_some_and(|at| at.elapsed() < KEYFRAME_REQUEST_INTERVAL)
        {
            return Ok(());
        }
        self.last_keyframe_request = Some(Instant::now());

        debug!("Requesting keyframe (last good {:?})", last_frame_id);
        let request = ControlMessage::KeyframeRequest { last_frame_id };
        tolerate_io(self.link.send(PacketType::Control, &request).await)?;
        Ok(())
    }

    async fn on_packet(&mut self, packet: Packet, from: SocketAddr) -> Result<(), EngineError> {
        if packet.packet_type == PacketType::Handshake {
            // Late HelloAck retransmissions
            return Ok(());
        }
        let Some(packet) = self.link.open(packet, from) else {
            return Ok(());
        };

        match packet.packet_type {
            PacketType::Video => {
                self.meter.record(packet.payload.len());
                match decode::<VideoChunk>(&packet.payload) {
                    Ok(chunk) => {
                        let assembled = self.assembler.push(chunk);
                        self.on_assembled(assembled);
                    }
                    Err(e) => debug!("Bad video chunk: {}", e),
                }
                Ok(())
            }
            PacketType::VideoParity => {
                self.meter.record(packet.payload.len());
                match decode::<ParityChunk>(&packet.payload) {
                    Ok(parity) => {
                        let assembled = self.assembler.push_parity(parity);
                        self.on_assembled(assembled);
                    }
                    Err(e) => debug!("Bad parity chunk: {}", e),
                }
                Ok(())
            }
            PacketType::Control => match decode::<ControlMessage>(&packet.payload) {
                Ok(msg) => self.on_control(msg).await,
                Err(e) => {
                    debug!("Bad control message: {}", e);
                    Ok(())
                }
            },
            _ => Ok(()),
        }
    }

    fn on_assembled(&mut self, assembled: Option<AssembledFrame>) {
        let Some(assembled) = assembled else {
            return;
        };
        if assembled.recovered > 0 {
            trace!(
                "Rebuilt {} chunk(s) of frame {} from parity",
                assembled.recovered,
                assembled.frame.frame_id
            );
        }
        if assembled.skipped > 0 {
            debug!("{} frame(s) lost before {}", assembled.skipped, assembled.frame.frame_id);
            self.ctx.stats.add_frames_dropped(assembled.skipped);
        }
        match self.frames_tx.try_send(assembled.frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                debug!("Decoder backlog; dropping frame {}", frame.frame_id);
                self.ctx.stats.add_frames_dropped(1);
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    async fn on_control(&mut self, msg: ControlMessage) -> Result<(), EngineError> {
        match msg {
            ControlMessage::Pong { ping_sequence, .. } => {
                if let Some(sample) = self.rtt.on_pong(ping_sequence) {
                    trace!("RTT sample {:?}", sample);
                    self.ctx.stats.set_rtt_ms(self.rtt.rtt_ms());
                }
            }
            ControlMessage::Ping {
                ping_sequence,
                sent_time_us,
            } => {
                let pong = ControlMessage::Pong {
                    ping_sequence,
                    sent_time_us,
                };
                tolerate_io(self.link.send(PacketType::Control, &pong).await)?;
            }
            ControlMessage::Goodbye { reason } => {
                info!("Host ended the session: {}", reason);
                return Err(NetworkError::PeerClosed(reason).into());
            }
            ControlMessage::Stats(_) | ControlMessage::KeyframeRequest { .. } => {}
        }
        Ok(())
    }

    async fn on_housekeeping(&mut self) -> Result<(), EngineError> {
        let timeout = self.ctx.peer_timeout();
        if self.link.silent_for() > timeout {
            warn!("Host {} silent for {:?}", self.link.peer(), timeout);
            return Err(NetworkError::PeerTimeout(self.ctx.config.peer_timeout_ms).into());
        }

        let (ping_sequence, sent_time_us) = self.rtt.start_ping();
        let ping = ControlMessage::Ping {
            ping_sequence,
            sent_time_us,
        };
        tolerate_io(self.link.send(PacketType::Control, &ping).await)?;

        let report = StatsReport {
            rtt_us: self.rtt.srtt().map_or(0, |rtt| rtt.as_micros() as u64),
            packets_received: self.link.packets_received(),
            packets_lost: self.link.packets_lost(),
            frames_decoded: self.ctx.stats.snapshot().frames_decoded,
        };
        tolerate_io(
            self.link
                .send(PacketType::Control, &ControlMessage::Stats(report))
                .await,
        )?;

        let expired = self.assembler.expire(Instant::now());
        if expired > 0 {
            debug!("Abandoned {} incomplete frame(s)", expired);
            self.ctx.stats.add_frames_dropped(expired as u64);
        }
        if let Some((_, kbps)) = self.meter.poll() {
            self.ctx.stats.set_bitrate_kbps(kbps);
        }
        self.ctx.stats.set_packets_lost(report.packets_lost);
        self.ctx.stats.publish();
        Ok(())
    }

    async fn shutdown(&mut self, say_goodbye: bool) {
        if let Some(decode) = self.decode.take() {
            decode.stop().await;
        }
        if say_goodbye {
            let goodbye = ControlMessage::Goodbye {
                reason: "client stopped".to_string(),
            };
            if let Err(e) = self.link.send(PacketType::Control, &goodbye).await {
                debug!("Goodbye not sent: {}", e);
            }
        }
        info!("Client session with {} ended", self.link.peer());
    }
}
