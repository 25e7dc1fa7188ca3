//! Network error types

use thiserror::Error;

use crate::protocol::MessageError;

/// Errors that can occur in the network subsystem
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Connection refused: {0}")]
    ConnectionRefused(String),

    #[error("Peer timed out after {0} ms of silence")]
    PeerTimeout(u64),

    #[error("Peer closed the session: {0}")]
    PeerClosed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Send buffer full")]
    SendBufferFull,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid packet")]
    InvalidPacket,

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("Could not resolve host: {0}")]
    Resolve(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Signaling error: {0}")]
    Signaling(String),

    #[error("STUN error: {0}")]
    Stun(String),
}
