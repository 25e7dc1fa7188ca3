//! Input channel
//!
//! Clients serialize local input events over the session; hosts replay them
//! through an injector sink, rescaling pointer coordinates to the injector's
//! resolution.

mod injector;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use injector::{InputInjector, InputOrdering, ScaledInjector, VirtualInjector};

/// A single input event. Pointer coordinates are absolute pixels in the
/// sender's view of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum InputEvent {
    MouseMove { x: u32, y: u32 },
    MouseButton { button: u8, pressed: bool },
    Scroll { dx: f32, dy: f32 },
    Key { keycode: u32, pressed: bool },
}

/// Errors raised by injector backends
#[derive(Error, Debug)]
pub enum InputError {
    #[error("Injector not initialized")]
    NotInitialized,

    #[error("Invalid injector resolution: {width}x{height}")]
    InvalidResolution { width: u32, height: u32 },

    #[error("Injection failed: {0}")]
    InjectionFailed(String),
}
