//! Typed messages carried inside packet payloads
//!
//! Handshake, control, video and input payloads are bincode-encoded
//! structures. Video frames are split into chunks that fit one datagram.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::input::InputEvent;

use super::packet::MAX_CHUNK_PAYLOAD;

/// Errors from encoding or decoding message payloads
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Frame too large to chunk: {0} bytes")]
    FrameTooLarge(usize),
}

/// Video codec negotiated for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum VideoCodec {
    /// Built-in run-length / XOR-delta software codec
    #[default]
    DeltaRle,
    /// Hardware H.264 provided by the platform
    H264,
    /// Hardware HEVC provided by the platform
    Hevc,
}

impl VideoCodec {
    pub fn name(&self) -> &'static str {
        match self {
            VideoCodec::DeltaRle => "delta-rle",
            VideoCodec::H264 => "h264",
            VideoCodec::Hevc => "hevc",
        }
    }
}

/// Parameters the host settled on for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionParams {
    pub codec: VideoCodec,
    pub width: u16,
    pub height: u16,
    pub fps: u16,
    pub bitrate_kbps: u32,
    pub keyframe_interval_ms: u32,
    pub session_id: u64,
}

/// First message from a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hello {
    pub protocol_version: u8,
    pub client_name: String,
    pub identity_key: [u8; 32],
    pub ephemeral_key: [u8; 32],
    pub codecs: Vec<VideoCodec>,
    /// Largest stream the client is willing to render; zero means no limit
    pub max_resolution: (u16, u16),
}

/// Host reply to a `Hello`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloAck {
    pub accepted: bool,
    pub reason: Option<String>,
    pub identity_key: [u8; 32],
    pub ephemeral_key: [u8; 32],
    pub params: Option<SessionParams>,
}

/// Handshake payloads (sent in the clear)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum HandshakeMessage {
    Hello(Hello),
    HelloAck(HelloAck),
}

/// Receiver-side report, sent by the client once per second
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsReport {
    pub rtt_us: u64,
    pub packets_received: u64,
    pub packets_lost: u64,
    pub frames_decoded: u64,
}

/// Encrypted control messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    Ping { ping_sequence: u32, sent_time_us: u64 },
    Pong { ping_sequence: u32, sent_time_us: u64 },
    Stats(StatsReport),
    KeyframeRequest { last_frame_id: Option<u64> },
    Goodbye { reason: String },
}

/// One datagram-sized piece of an encoded frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoChunk {
    pub frame_id: u64,
    pub chunk_index: u16,
    pub chunk_count: u16,
    pub timestamp_us: u64,
    pub keyframe: bool,
    pub payload: Vec<u8>,
}

impl VideoChunk {
    /// Split an encoded frame into chunks of at most `MAX_CHUNK_PAYLOAD` bytes
    pub fn split(
        frame_id: u64,
        timestamp_us: u64,
        keyframe: bool,
        data: &[u8],
    ) -> Result<Vec<VideoChunk>, MessageError> {
        let chunk_count = data.len().div_ceil(MAX_CHUNK_PAYLOAD).max(1);
        if chunk_count > u16::MAX as usize {
            return Err(MessageError::FrameTooLarge(data.len()));
        }

        if data.is_empty() {
            return Ok(vec![VideoChunk {
                frame_id,
                chunk_index: 0,
                chunk_count: 1,
                timestamp_us,
                keyframe,
                payload: Vec::new(),
            }]);
        }

        Ok(data
            .chunks(MAX_CHUNK_PAYLOAD)
            .enumerate()
            .map(|(index, part)| VideoChunk {
                frame_id,
                chunk_index: index as u16,
                chunk_count: chunk_count as u16,
                timestamp_us,
                keyframe,
                payload: part.to_vec(),
            })
            .collect())
    }
}

/// XOR parity over a run of consecutive chunks of one frame
///
/// Carries the frame fields of the chunks it covers so it can open a frame in
/// reassembly even when it arrives first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParityChunk {
    pub frame_id: u64,
    pub first_index: u16,
    pub chunk_count: u16,
    pub timestamp_us: u64,
    pub keyframe: bool,
    /// Payload length of each covered chunk, starting at `first_index`
    pub lengths: Vec<u16>,
    pub payload: Vec<u8>,
}

/// An input event with its per-session ordering number
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputMessage {
    pub seq: u64,
    pub source_width: u32,
    pub source_height: u32,
    pub event: InputEvent,
}

/// Serialize a message payload
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, MessageError> {
    bincode::serialize(msg).map_err(|e| MessageError::Encode(e.to_string()))
}

/// Deserialize a message payload
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, MessageError> {
    bincode::deserialize(bytes).map_err(|e| MessageError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{HEADER_SIZE, MAX_DATAGRAM_SIZE};

    #[test]
    fn test_split_small_frame() {
        let chunks = VideoChunk::split(7, 1000, true, &[1, 2, 3]).unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_count, 1);
        assert!(chunks[0].keyframe);
        assert_eq!(chunks[0].payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_split_large_frame() {
        let data = vec![0xAB; MAX_CHUNK_PAYLOAD * 2 + 10];
        let chunks = VideoChunk::split(1, 0, false, &data).unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chunk_count == 3));
        assert_eq!(chunks[2].payload.len(), 10);
        let total: usize = chunks.iter().map(|c| c.payload.len()).sum();
        assert_eq!(total, data.len());
    }

    #[test]
    fn test_split_empty_frame() {
        let chunks = VideoChunk::split(3, 0, false, &[]).unwrap();
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].payload.is_empty());
    }

    #[test]
    fn test_parity_fits_datagram() {
        let parity = ParityChunk {
            frame_id: u64::MAX,
            first_index: 0,
            chunk_count: 4,
            timestamp_us: u64::MAX,
            keyframe: true,
            lengths: vec![MAX_CHUNK_PAYLOAD as u16; 4],
            payload: vec![0xFF; MAX_CHUNK_PAYLOAD],
        };
        // 16-byte AEAD tag on top of the header
        let sealed = encode(&parity).unwrap().len() + HEADER_SIZE + 16;
        assert!(sealed <= MAX_DATAGRAM_SIZE, "{} bytes", sealed);
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result: Result<ControlMessage, _> = decode(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
        assert!(result.is_err());
    }

    #[test]
    fn test_hello_roundtrip() {
        let hello = HandshakeMessage::Hello(Hello {
            protocol_version: 1,
            client_name: "viewer".to_string(),
            identity_key: [1u8; 32],
            ephemeral_key: [2u8; 32],
            codecs: vec![VideoCodec::DeltaRle],
            max_resolution: (1920, 1080),
        });
        let bytes = encode(&hello).unwrap();
        match decode::<HandshakeMessage>(&bytes).unwrap() {
            HandshakeMessage::Hello(h) => {
                assert_eq!(h.client_name, "viewer");
                assert_eq!(h.identity_key, [1u8; 32]);
                assert_eq!(h.codecs, vec![VideoCodec::DeltaRle]);
            }
            other => panic!("Wrong message: {:?}", other),
        }
    }
}
