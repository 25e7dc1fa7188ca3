//! Engine-level errors and their stable numeric codes

use thiserror::Error;

use crate::config::ConfigError;
use crate::identity::IdentityError;
use crate::input::InputError;
use crate::media::MediaError;
use crate::network::NetworkError;

/// Stable return codes shared by the Rust API and the C ABI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    NullPointer = -1,
    InvalidString = -2,
    InvalidArgument = -3,
    BufferTooSmall = -4,
    SessionActive = -10,
    IdentityUninitialized = -11,
    IdentityStorage = -12,
    SignalingNotConnected = -13,
    Signaling = -14,
    Transport = -15,
    InjectorNotInitialized = -17,
    InjectionFailed = -18,
    EngineInit = -19,
    Media = -20,
    Config = -21,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// Errors returned by the engine's public operations
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Empty or invalid string argument: {0}")]
    InvalidString(&'static str),

    #[error("A session is already active; stop it first")]
    SessionActive,

    #[error("Signaling is not connected")]
    SignalingNotConnected,

    #[error("No client session is running")]
    NoSession,

    #[error("Failed to start engine runtime: {0}")]
    Runtime(std::io::Error),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineError {
    /// Numeric code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            EngineError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            EngineError::InvalidString(_) => ErrorCode::InvalidString,
            EngineError::SessionActive => ErrorCode::SessionActive,
            EngineError::SignalingNotConnected => ErrorCode::SignalingNotConnected,
            EngineError::NoSession => ErrorCode::Transport,
            EngineError::Runtime(_) => ErrorCode::EngineInit,
            EngineError::Identity(e) => match e {
                IdentityError::Uninitialized => ErrorCode::IdentityUninitialized,
                IdentityError::BufferTooSmall(_) => ErrorCode::BufferTooSmall,
                _ => ErrorCode::IdentityStorage,
            },
            EngineError::Network(e) => match e {
                NetworkError::Signaling(_) => ErrorCode::Signaling,
                _ => ErrorCode::Transport,
            },
            EngineError::Media(_) => ErrorCode::Media,
            EngineError::Input(e) => match e {
                InputError::NotInitialized => ErrorCode::InjectorNotInitialized,
                InputError::InvalidResolution { .. } => ErrorCode::InvalidArgument,
                InputError::InjectionFailed(_) => ErrorCode::InjectionFailed,
            },
            EngineError::Config(_) => ErrorCode::Config,
        }
    }
}

/// Validate a port coming from an untyped boundary
pub fn validate_port(port: i64) -> Result<u16, EngineError> {
    match u16::try_from(port) {
        Ok(p) if p != 0 => Ok(p),
        _ => Err(EngineError::InvalidArgument(format!(
            "port out of range: {}",
            port
        ))),
    }
}
