//! castline - Low-latency peer-to-peer remote display sessions
//!
//! A host streams a display to one client over an encrypted UDP session; the
//! client renders it and sends input back. Peers find each other directly by
//! address or through a signaling server. The engine is usable from Rust and,
//! through the `ffi` module, from any language that can call C.

pub mod config;
pub mod error;
pub mod ffi;
pub mod identity;
pub mod input;
pub mod media;
pub mod network;
pub mod protocol;
pub mod session;
pub mod stats;

pub use config::{EngineConfig, HostConfig};
pub use error::{EngineError, ErrorCode};
pub use session::{Engine, SessionInfo, SessionRole};
pub use stats::StatsSnapshot;
