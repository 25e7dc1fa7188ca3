//! Video codecs
//!
//! The built-in codec is a lossless-by-default software scheme:
//! - keyframes code each row as the XOR against the row above
//! - delta frames do the same on the XOR against the previous frame
//!
//! The residual is run-length coded as `(count: u16 LE, value: u8)` pairs.
//! Each frame starts with a 14-byte header:
//!
//! ```text
//! kind(1) format(1) width(2 LE) height(2 LE) reference_id(8 LE)
//! ```
//!
//! `reference_id` is the frame a delta applies to, so a decoder that missed a
//! frame rejects the delta instead of producing garbage. When frames come out
//! larger than the per-frame share of the bitrate target, the encoder drops
//! low bits of every pixel until they fit.

use tracing::debug;

use crate::protocol::VideoCodec;

use super::error::MediaError;
use super::{DecodedFrame, EncodedFrame, PixelFormat, RawFrame};

const HEADER_LEN: usize = 14;
const KIND_KEY: u8 = 0;
const KIND_DELTA: u8 = 1;

/// Most low bits the encoder will drop from a pixel byte
const MAX_QUANT_SHIFT: u8 = 4;

/// Compresses raw frames
pub trait VideoEncoder: Send {
    /// Encode one frame, producing a keyframe when `force_keyframe` is set
    fn encode(&mut self, frame: &RawFrame, force_keyframe: bool)
        -> Result<EncodedFrame, MediaError>;

    /// Adjust the bitrate target
    fn set_bitrate(&mut self, kbps: u32);
}

/// Decompresses encoded frames
pub trait VideoDecoder: Send {
    fn decode(&mut self, frame: &EncodedFrame) -> Result<DecodedFrame, MediaError>;
}

/// Build an encoder for a negotiated codec
pub fn create_encoder(
    codec: VideoCodec,
    bitrate_kbps: u32,
    fps: u32,
) -> Result<Box<dyn VideoEncoder>, MediaError> {
    match codec {
        VideoCodec::DeltaRle => Ok(Box::new(DeltaRleEncoder::new(bitrate_kbps, fps))),
        other => Err(MediaError::CodecUnavailable(other.name())),
    }
}

/// Build a decoder for a negotiated codec
///
/// Frames larger than `max_width` x `max_height` are rejected before any
/// pixel buffer is allocated.
pub fn create_decoder(
    codec: VideoCodec,
    max_width: u32,
    max_height: u32,
) -> Result<Box<dyn VideoDecoder>, MediaError> {
    match codec {
        VideoCodec::DeltaRle => Ok(Box::new(DeltaRleDecoder::new(max_width, max_height))),
        other => Err(MediaError::CodecUnavailable(other.name())),
    }
}

struct Reference {
    frame_id: u64,
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
}

impl Reference {
    fn matches(&self, width: u32, height: u32, format: PixelFormat) -> bool {
        self.width == width && self.height == height && self.format == format
    }
}

/// Row-predicted run-length / XOR-delta encoder
pub struct DeltaRleEncoder {
    next_frame_id: u64,
    bitrate_kbps: u32,
    fps: u32,
    quant_shift: u8,
    reference: Option<Reference>,
}

impl DeltaRleEncoder {
    pub fn new(bitrate_kbps: u32, fps: u32) -> Self {
        Self {
            next_frame_id: 1,
            bitrate_kbps,
            fps: fps.max(1),
            quant_shift: 0,
            reference: None,
        }
    }

    /// Bytes one frame may use at the current bitrate target
    pub fn frame_budget(&self) -> usize {
        self.bitrate_kbps as usize * 125 / self.fps as usize
    }

    /// Coarsen after an oversized frame, refine once frames are well under budget
    fn adapt_quantizer(&mut self, frame_len: usize) {
        let budget = self.frame_budget();
        let previous = self.quant_shift;
        if frame_len > budget && self.quant_shift < MAX_QUANT_SHIFT {
            self.quant_shift += 1;
        } else if frame_len < budget / 4 && self.quant_shift > 0 {
            self.quant_shift -= 1;
        }
        if self.quant_shift != previous {
            debug!(
                "Frame of {} bytes against a {} byte budget; quantizer {} -> {}",
                frame_len, budget, previous, self.quant_shift
            );
        }
    }
}

impl VideoEncoder for DeltaRleEncoder {
    fn encode(
        &mut self,
        frame: &RawFrame,
        force_keyframe: bool,
    ) -> Result<EncodedFrame, MediaError> {
        if frame.width == 0
            || frame.height == 0
            || frame.width > u16::MAX as u32
            || frame.height > u16::MAX as u32
        {
            return Err(MediaError::UnsupportedResolution {
                width: frame.width,
                height: frame.height,
            });
        }
        if frame.data.len() != frame.expected_len() {
            return Err(MediaError::Capture(format!(
                "frame has {} bytes, expected {}",
                frame.data.len(),
                frame.expected_len()
            )));
        }

        let shift = self.quant_shift;
        let pixels: Vec<u8> = if shift == 0 {
            frame.data.clone()
        } else {
            let mask = 0xFFu8 << shift;
            frame.data.iter().map(|b| b & mask).collect()
        };
        let stride = frame.width as usize * frame.format.bytes_per_pixel();

        let frame_id = self.next_frame_id;
        self.next_frame_id += 1;

        let delta_ref = match &self.reference {
            Some(r) if !force_keyframe && r.matches(frame.width, frame.height, frame.format) => Some(r),
            _ => None,
        };

        let mut data = Vec::with_capacity(HEADER_LEN + pixels.len() / 64);
        let keyframe = delta_ref.is_none();
        match delta_ref {
            Some(r) => {
                write_header(&mut data, KIND_DELTA, frame, r.frame_id);
                let mut changed = pixels.clone();
                xor_into(&mut changed, &r.data);
                rle_encode(&predict_rows(&changed, stride), &mut data);
            }
            None => {
                write_header(&mut data, KIND_KEY, frame, 0);
                rle_encode(&predict_rows(&pixels, stride), &mut data);
            }
        }

        self.reference = Some(Reference {
            frame_id,
            width: frame.width,
            height: frame.height,
            format: frame.format,
            data: pixels,
        });
        self.adapt_quantizer(data.len());

        Ok(EncodedFrame {
            frame_id,
            timestamp_us: frame.timestamp_us,
            keyframe,
            data,
        })
    }

    fn set_bitrate(&mut self, kbps: u32) {
        if kbps != self.bitrate_kbps {
            debug!("Encoder bitrate {} -> {} kbps", self.bitrate_kbps, kbps);
            self.bitrate_kbps = kbps;
        }
    }
}

/// Decoder for `DeltaRleEncoder` output
pub struct DeltaRleDecoder {
    max_width: u32,
    max_height: u32,
    reference: Option<Reference>,
}

impl DeltaRleDecoder {
    pub fn new(max_width: u32, max_height: u32) -> Self {
        Self {
            max_width,
            max_height,
            reference: None,
        }
    }
}

impl VideoDecoder for DeltaRleDecoder {
    fn decode(&mut self, frame: &EncodedFrame) -> Result<DecodedFrame, MediaError> {
        if frame.data.len() < HEADER_LEN {
            return Err(MediaError::Corrupt("truncated header".to_string()));
        }
        let kind = frame.data[0];
        let format = PixelFormat::from_u8(frame.data[1])
            .ok_or_else(|| MediaError::Corrupt(format!("pixel format {}", frame.data[1])))?;
        let width = u16::from_le_bytes([frame.data[2], frame.data[3]]) as u32;
        let height = u16::from_le_bytes([frame.data[4], frame.data[5]]) as u32;
        let mut ref_bytes = [0u8; 8];
        ref_bytes.copy_from_slice(&frame.data[6..HEADER_LEN]);
        let reference_id = u64::from_le_bytes(ref_bytes);

        if width == 0 || height == 0 || width > self.max_width || height > self.max_height {
            return Err(MediaError::UnsupportedResolution { width, height });
        }

        let stride = width as usize * format.bytes_per_pixel();
        let expected = stride * height as usize;
        let mut body = rle_decode(&frame.data[HEADER_LEN..], expected)?;
        unpredict_rows(&mut body, stride);

        let pixels = match kind {
            KIND_KEY => body,
            KIND_DELTA => match &self.reference {
                Some(r) if r.frame_id == reference_id && r.matches(width, height, format) => {
                    xor_into(&mut body, &r.data);
                    body
                }
                _ => return Err(MediaError::NeedKeyframe),
            },
            other => return Err(MediaError::Corrupt(format!("frame kind {}", other))),
        };

        self.reference = Some(Reference {
            frame_id: frame.frame_id,
            width,
            height,
            format,
            data: pixels.clone(),
        });

        Ok(RawFrame {
            width,
            height,
            format,
            timestamp_us: frame.timestamp_us,
            data: pixels,
        })
    }
}

fn write_header(out: &mut Vec<u8>, kind: u8, frame: &RawFrame, reference_id: u64) {
    out.push(kind);
    out.push(frame.format.to_u8());
    out.extend_from_slice(&(frame.width as u16).to_le_bytes());
    out.extend_from_slice(&(frame.height as u16).to_le_bytes());
    out.extend_from_slice(&reference_id.to_le_bytes());
}

/// `dst ^= src` for slices of equal length, a word at a time
fn xor_into(dst: &mut [u8], src: &[u8]) {
    let mut dst_words = dst.chunks_exact_mut(8);
    let mut src_words = src.chunks_exact(8);
    for (d, s) in (&mut dst_words).zip(&mut src_words) {
        let mut a = [0u8; 8];
        let mut b = [0u8; 8];
        a.copy_from_slice(d);
        b.copy_from_slice(s);
        d.copy_from_slice(&(u64::from_ne_bytes(a) ^ u64::from_ne_bytes(b)).to_ne_bytes());
    }
    for (d, s) in dst_words.into_remainder().iter_mut().zip(src_words.remainder()) {
        *d ^= s;
    }
}

/// Replace every row after the first with its XOR against the row above
fn predict_rows(data: &[u8], stride: usize) -> Vec<u8> {
    let mut out = data.to_vec();
    if stride == 0 {
        return out;
    }
    for (row, above) in out.chunks_exact_mut(stride).skip(1).zip(data.chunks_exact(stride)) {
        xor_into(row, above);
    }
    out
}

fn unpredict_rows(data: &mut [u8], stride: usize) {
    if stride == 0 {
        return;
    }
    let mut start = stride;
    while start + stride <= data.len() {
        let (done, rest) = data.split_at_mut(start);
        xor_into(&mut rest[..stride], &done[start - stride..]);
        start += stride;
    }
}

fn rle_encode(input: &[u8], out: &mut Vec<u8>) {
    let mut rest = input;
    while let Some(&value) = rest.first() {
        let limit = rest.len().min(u16::MAX as usize);
        let count = rest[..limit].iter().take_while(|&&b| b == value).count();
        out.extend_from_slice(&(count as u16).to_le_bytes());
        out.push(value);
        rest = &rest[count..];
    }
}

/// Expand runs into exactly `expected` bytes
///
/// The buffer grows with the runs actually present, so a header claiming a
/// huge frame costs nothing until runs back it up.
fn rle_decode(input: &[u8], expected: usize) -> Result<Vec<u8>, MediaError> {
    if input.len() % 3 != 0 {
        return Err(MediaError::Corrupt("run data not a multiple of 3".to_string()));
    }
    let mut out = Vec::new();
    for run in input.chunks_exact(3) {
        let count = u16::from_le_bytes([run[0], run[1]]) as usize;
        if count == 0 || out.len() + count > expected {
            return Err(MediaError::Corrupt("run overflows frame".to_string()));
        }
        out.resize(out.len() + count, run[2]);
    }
    if out.len() != expected {
        return Err(MediaError::Corrupt(format!(
            "decoded {} bytes, expected {}",
            out.len(),
            expected
        )));
    }
    Ok(out)
}
