//! Video media pipeline
//!
//! Capture, encode, chunk reassembly, decode and render. Platform capture,
//! hardware codecs and OS renderers plug in through the traits defined here;
//! built-in software implementations keep the pipeline usable everywhere.

mod assembler;
mod capture;
mod codec;
mod error;
mod pipeline;
mod queue;
mod rate;
mod renderer;

pub use assembler::{AssembledFrame, FrameAssembler};
pub use capture::{FrameSource, TestPatternSource};
pub use codec::{create_decoder, create_encoder, DeltaRleDecoder, DeltaRleEncoder, VideoDecoder, VideoEncoder};
pub use error::MediaError;
pub use pipeline::{DecodeFeedback, DecodeLoop, EncodeLoop, KeyframeTrigger, RendererSlot};
pub use queue::FrameQueue;
pub use rate::BitrateController;
pub use renderer::{SurfaceRenderer, VideoRenderer};

/// Pixel layout of a raw frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Gray8,
    Bgra8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Bgra8 => 4,
        }
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            PixelFormat::Gray8 => 0,
            PixelFormat::Bgra8 => 1,
        }
    }

    pub(crate) fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PixelFormat::Gray8),
            1 => Some(PixelFormat::Bgra8),
            _ => None,
        }
    }
}

/// An uncompressed frame from a capture source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub timestamp_us: u64,
    pub data: Vec<u8>,
}

impl RawFrame {
    /// Expected byte length for the frame's dimensions
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

/// Output of an encoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedFrame {
    pub frame_id: u64,
    pub timestamp_us: u64,
    pub keyframe: bool,
    pub data: Vec<u8>,
}

/// Output of a decoder, ready for rendering
pub type DecodedFrame = RawFrame;
