//! Session lifecycle
//!
//! The controller owns the engine state and spawns one worker per role: the
//! host or client negotiator for the peer session, and the cloud worker for
//! signaling.

mod cloud;
mod controller;
mod negotiator;

use std::net::SocketAddr;

use crate::protocol::SessionParams;

pub use controller::Engine;

/// Which side of a session this engine is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRole {
    Host,
    Client,
}

/// Live description of the running session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub role: SessionRole,
    pub local_addr: Option<SocketAddr>,
    pub peer: Option<SocketAddr>,
    /// Parameters agreed in the handshake, once it completed
    pub params: Option<SessionParams>,
}

impl SessionInfo {
    pub(crate) fn new(role: SessionRole, local_addr: Option<SocketAddr>) -> Self {
        Self {
            role,
            local_addr,
            peer: None,
            params: None,
        }
    }
}
