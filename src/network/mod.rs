//! Network module for P2P communication
//!
//! Handles UDP transport, NAT discovery, signaling and session encryption.

mod crypto;
mod error;
mod fec;
mod pacer;
mod rtt;
mod sequence_tracker;
mod signaling;
mod stun;
mod transport;

pub use crypto::{HandshakeKeys, HandshakeRole, SessionCrypto};
pub use error::NetworkError;
pub use fec::{parity_for, recover_chunk, FecError, FEC_GROUP_SIZE};
pub use pacer::Pacer;
pub use rtt::RttEstimator;
pub use sequence_tracker::{SequenceOutcome, SequenceTracker};
pub use signaling::{
    validate_url, RendezvousInfo, SignalingConnection, SignalingMessage, SignalingServer,
    SignalingState, ERROR_BAD_REQUEST, ERROR_NOT_FOUND, ERROR_UNAUTHORIZED,
};
pub use stun::{StunClient, StunResult, DEFAULT_STUN_SERVERS};
pub use transport::UdpTransport;
