//! Packet definitions for the castline wire protocol
//!
//! Packet format (12-byte header):
//! - version: 1 byte
//! - type: 1 byte
//! - sequence: 4 bytes (big-endian, per-direction packet counter)
//! - timestamp: 4 bytes (big-endian, milliseconds since session start)
//! - flags: 2 bytes

use serde::{Deserialize, Serialize};

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Header size in bytes
pub const HEADER_SIZE: usize = 12;

/// Largest datagram we ever put on the wire
pub const MAX_DATAGRAM_SIZE: usize = 1200;

/// Largest video chunk payload, leaving room for header, framing and AEAD tag
pub const MAX_CHUNK_PAYLOAD: usize = 1100;

/// Packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    /// Session handshake (Hello / HelloAck), never encrypted
    Handshake = 0x01,
    /// Control message (ping, stats, keyframe request, goodbye)
    Control = 0x02,
    /// Video chunk
    Video = 0x03,
    /// Input event
    Input = 0x04,
    /// Keep-alive / hole-punch packet
    KeepAlive = 0x05,
    /// Parity over a group of video chunks
    VideoParity = 0x06,
}

impl TryFrom<u8> for PacketType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(PacketType::Handshake),
            0x02 => Ok(PacketType::Control),
            0x03 => Ok(PacketType::Video),
            0x04 => Ok(PacketType::Input),
            0x05 => Ok(PacketType::KeepAlive),
            0x06 => Ok(PacketType::VideoParity),
            _ => Err(()),
        }
    }
}

/// Packet flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags {
    /// Payload is encrypted with the session key
    pub encrypted: bool,
    /// Payload belongs to a keyframe
    pub keyframe: bool,
}

impl PacketFlags {
    pub fn to_u16(self) -> u16 {
        let mut flags = 0u16;
        if self.encrypted {
            flags |= 0x0001;
        }
        if self.keyframe {
            flags |= 0x0002;
        }
        flags
    }

    pub fn from_u16(value: u16) -> Self {
        Self {
            encrypted: (value & 0x0001) != 0,
            keyframe: (value & 0x0002) != 0,
        }
    }
}

/// A network packet
#[derive(Debug, Clone)]
pub struct Packet {
    pub version: u8,
    pub packet_type: PacketType,
    pub sequence: u32,
    pub timestamp: u32,
    pub flags: PacketFlags,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Create a packet of the given type
    pub fn new(packet_type: PacketType, sequence: u32, timestamp: u32, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_type,
            sequence,
            timestamp,
            flags: PacketFlags::default(),
            payload,
        }
    }

    /// Create a new keep-alive packet
    pub fn keep_alive(sequence: u32) -> Self {
        Self::new(PacketType::KeepAlive, sequence, 0, Vec::new())
    }

    /// Serialize the header only (used as AEAD associated data)
    pub fn header_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.version;
        buf[1] = self.packet_type as u8;
        buf[2..6].copy_from_slice(&self.sequence.to_be_bytes());
        buf[6..10].copy_from_slice(&self.timestamp.to_be_bytes());
        buf[10..12].copy_from_slice(&self.flags.to_u16().to_be_bytes());
        buf
    }

    /// Serialize the packet to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        buf.extend_from_slice(&self.header_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Deserialize a packet from bytes
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }

        let version = data[0];
        if version != PROTOCOL_VERSION {
            return None;
        }

        let packet_type = PacketType::try_from(data[1]).ok()?;
        let sequence = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let timestamp = u32::from_be_bytes([data[6], data[7], data[8], data[9]]);
        let flags = PacketFlags::from_u16(u16::from_be_bytes([data[10], data[11]]));
        let payload = data[HEADER_SIZE..].to_vec();

        Some(Self {
            version,
            packet_type,
            sequence,
            timestamp,
            flags,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_roundtrip() {
        let mut original = Packet::new(PacketType::Video, 42, 12345, vec![1, 2, 3, 4, 5]);
        original.flags.keyframe = true;
        let bytes = original.to_bytes();
        let decoded = Packet::from_bytes(&bytes).expect("Failed to decode packet");

        assert_eq!(decoded.version, original.version);
        assert_eq!(decoded.packet_type, original.packet_type);
        assert_eq!(decoded.sequence, original.sequence);
        assert_eq!(decoded.timestamp, original.timestamp);
        assert_eq!(decoded.flags, original.flags);
        assert_eq!(decoded.payload, original.payload);
    }

    #[test]
    fn test_packet_type_conversion() {
        assert_eq!(PacketType::try_from(0x01), Ok(PacketType::Handshake));
        assert_eq!(PacketType::try_from(0x03), Ok(PacketType::Video));
        assert_eq!(PacketType::try_from(0x05), Ok(PacketType::KeepAlive));
        assert_eq!(PacketType::try_from(0x06), Ok(PacketType::VideoParity));
        assert_eq!(PacketType::try_from(0xFF), Err(()));
    }

    #[test]
    fn test_header_size() {
        let packet = Packet::keep_alive(0);
        assert_eq!(packet.to_bytes().len(), HEADER_SIZE);
        assert_eq!(&packet.to_bytes()[..], &packet.header_bytes()[..]);
    }

    #[test]
    fn test_invalid_packet_too_short() {
        let data = vec![0u8; HEADER_SIZE - 1];
        assert!(Packet::from_bytes(&data).is_none());
    }

    #[test]
    fn test_invalid_protocol_version() {
        let mut data = vec![0u8; HEADER_SIZE];
        data[0] = 99;
        data[1] = PacketType::Control as u8;
        assert!(Packet::from_bytes(&data).is_none());
    }
}
