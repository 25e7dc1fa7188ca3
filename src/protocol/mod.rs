//! Network protocol definitions
//!
//! Defines the packet format and the typed messages carried inside it.

mod message;
mod packet;

pub use message::{
    decode, encode, ControlMessage, HandshakeMessage, Hello, HelloAck, InputMessage,
    MessageError, ParityChunk, SessionParams, StatsReport, VideoChunk, VideoCodec,
};
pub use packet::{
    Packet, PacketFlags, PacketType, HEADER_SIZE, MAX_CHUNK_PAYLOAD, MAX_DATAGRAM_SIZE,
    PROTOCOL_VERSION,
};
