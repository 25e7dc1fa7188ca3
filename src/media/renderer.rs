//! Video renderers

use tracing::trace;

use super::error::MediaError;
use super::DecodedFrame;

/// Presents decoded frames on a display surface
pub trait VideoRenderer: Send {
    fn render(&mut self, frame: &DecodedFrame) -> Result<(), MediaError>;
}

/// Renderer bound to an opaque platform surface handle
///
/// Presentation itself belongs to the platform layer that owns the surface;
/// this renderer validates frames and keeps presentation counters.
#[derive(Debug)]
pub struct SurfaceRenderer {
    surface: usize,
    presented: u64,
    last_resolution: Option<(u32, u32)>,
    last_timestamp_us: u64,
}

impl SurfaceRenderer {
    pub fn new(surface: usize) -> Self {
        Self {
            surface,
            presented: 0,
            last_resolution: None,
            last_timestamp_us: 0,
        }
    }

    pub fn surface(&self) -> usize {
        self.surface
    }

    pub fn presented(&self) -> u64 {
        self.presented
    }

    pub fn last_resolution(&self) -> Option<(u32, u32)> {
        self.last_resolution
    }

    pub fn last_timestamp_us(&self) -> u64 {
        self.last_timestamp_us
    }
}

impl VideoRenderer for SurfaceRenderer {
    fn render(&mut self, frame: &DecodedFrame) -> Result<(), MediaError> {
        if frame.data.len() != frame.expected_len() {
            return Err(MediaError::Render(format!(
                "frame has {} bytes, expected {}",
                frame.data.len(),
                frame.expected_len()
            )));
        }
        self.presented += 1;
        self.last_resolution = Some((frame.width, frame.height));
        self.last_timestamp_us = frame.timestamp_us;
        trace!(
            "Presented {}x{} frame on surface {:#x}",
            frame.width,
            frame.height,
            self.surface
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::PixelFormat;

    #[test]
    fn test_render_counts_frames() {
        let mut renderer = SurfaceRenderer::new(0x1000);
        let frame = DecodedFrame {
            width: 4,
            height: 2,
            format: PixelFormat::Gray8,
            timestamp_us: 5,
            data: vec![0; 8],
        };

        renderer.render(&frame).unwrap();
        renderer.render(&frame).unwrap();
        assert_eq!(renderer.presented(), 2);
        assert_eq!(renderer.last_resolution(), Some((4, 2)));
    }

    #[test]
    fn test_render_rejects_short_frame() {
        let mut renderer = SurfaceRenderer::new(1);
        let frame = DecodedFrame {
            width: 4,
            height: 4,
            format: PixelFormat::Bgra8,
            timestamp_us: 0,
            data: vec![0; 16],
        };
        assert!(renderer.render(&frame).is_err());
        assert_eq!(renderer.presented(), 0);
    }
}
