//! Frame sources

use std::time::Instant;

use super::error::MediaError;
use super::{PixelFormat, RawFrame};

/// Produces raw frames for the host to encode
pub trait FrameSource: Send {
    fn capture(&mut self) -> Result<RawFrame, MediaError>;

    /// Resolution of captured frames
    fn resolution(&self) -> (u32, u32);
}

/// Synthetic source drawing vertical bars that scroll each frame
///
/// Stands in for screen capture on systems without a capture backend. The
/// display id shifts the bar phase so different displays are distinguishable.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    display_id: u32,
    frame_index: u64,
    epoch: Instant,
}

/// Width of one bar in pixels
const BAR_WIDTH: u32 = 32;

/// Horizontal scroll per frame in pixels
const SCROLL_STEP: u32 = 4;

impl TestPatternSource {
    pub fn new(width: u32, height: u32, display_id: Option<u32>) -> Result<Self, MediaError> {
        if width == 0 || height == 0 {
            return Err(MediaError::UnsupportedResolution { width, height });
        }
        Ok(Self {
            width,
            height,
            display_id: display_id.unwrap_or(0),
            frame_index: 0,
            epoch: Instant::now(),
        })
    }

    fn row(&self) -> Vec<u8> {
        let offset = (self.frame_index as u32)
            .wrapping_mul(SCROLL_STEP)
            .wrapping_add(self.display_id.wrapping_mul(BAR_WIDTH / 2));
        (0..self.width)
            .map(|x| {
                if (x.wrapping_add(offset) / BAR_WIDTH) % 2 == 0 {
                    0xE0
                } else {
                    0x20
                }
            })
            .collect()
    }
}

impl FrameSource for TestPatternSource {
    fn capture(&mut self) -> Result<RawFrame, MediaError> {
        let row = self.row();
        let mut data = Vec::with_capacity(row.len() * self.height as usize);
        for _ in 0..self.height {
            data.extend_from_slice(&row);
        }
        self.frame_index += 1;

        Ok(RawFrame {
            width: self.width,
            height: self.height,
            format: PixelFormat::Gray8,
            timestamp_us: self.epoch.elapsed().as_micros() as u64,
            data,
        })
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
