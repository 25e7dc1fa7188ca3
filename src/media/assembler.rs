//! Reassembly of chunked video frames
//!
//! Chunks may arrive out of order. Parity chunks fill in a single lost chunk
//! per group. A frame is delivered once all its chunks are present and only
//! if it is newer than the last delivered frame; older incomplete frames are
//! then abandoned. Partial frames older than the timeout are expired.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::network::{recover_chunk, FecError};
use crate::protocol::{ParityChunk, VideoChunk};

use super::EncodedFrame;

/// Upper bound on frames held in reassembly at once
const MAX_PENDING_FRAMES: usize = 16;

/// A completed frame plus how many frames were abandoned before it
#[derive(Debug)]
pub struct AssembledFrame {
    pub frame: EncodedFrame,
    pub skipped: u64,
    /// Chunks rebuilt from parity
    pub recovered: u16,
}

struct PartialFrame {
    chunk_count: u16,
    chunks: Vec<Option<Vec<u8>>>,
    received: u16,
    recovered: u16,
    parity: Vec<ParityChunk>,
    keyframe: bool,
    timestamp_us: u64,
    first_seen: Instant,
}

impl PartialFrame {
    fn new(chunk_count: u16, keyframe: bool, timestamp_us: u64) -> Self {
        Self {
            chunk_count,
            chunks: vec![None; chunk_count as usize],
            received: 0,
            recovered: 0,
            parity: Vec::new(),
            keyframe,
            timestamp_us,
            first_seen: Instant::now(),
        }
    }

    /// Rebuild what the held parity allows, dropping parity that is spent
    fn recover(&mut self) {
        let chunks = &mut self.chunks;
        let mut rebuilt = 0u16;
        self.parity.retain(|parity| {
            let start = parity.first_index as usize;
            let group = &mut chunks[start..start + parity.lengths.len()];
            let result = {
                let shards: Vec<Option<&[u8]>> = group.iter().map(|c| c.as_deref()).collect();
                recover_chunk(parity, &shards)
            };
            match result {
                Ok((index, payload)) => {
                    group[index] = Some(payload);
                    rebuilt += 1;
                    false
                }
                Err(FecError::TooManyMissing) => true,
                Err(FecError::NoMissingChunk) => false,
                Err(e) => {
                    debug!("Discarding parity at chunk {}: {}", start, e);
                    false
                }
            }
        });
        self.received += rebuilt;
        self.recovered += rebuilt;
    }
}

/// Collects chunks into frames and enforces delivery order
pub struct FrameAssembler {
    partial: BTreeMap<u64, PartialFrame>,
    last_delivered: Option<u64>,
    timeout: Duration,
}

impl FrameAssembler {
    pub fn new(timeout: Duration) -> Self {
        Self {
            partial: BTreeMap::new(),
            last_delivered: None,
            timeout,
        }
    }

    /// Add a chunk; returns a frame when one completes
    pub fn push(&mut self, chunk: VideoChunk) -> Option<AssembledFrame> {
        if chunk.chunk_count == 0 || chunk.chunk_index >= chunk.chunk_count {
            debug!(
                "Dropping malformed chunk {}/{} of frame {}",
                chunk.chunk_index, chunk.chunk_count, chunk.frame_id
            );
            return None;
        }
        if !self.accepts(chunk.frame_id, chunk.chunk_count) {
            return None;
        }

        let frame_id = chunk.frame_id;
        let entry = self
            .partial
            .entry(frame_id)
            .or_insert_with(|| PartialFrame::new(chunk.chunk_count, chunk.keyframe, chunk.timestamp_us));
        let slot = &mut entry.chunks[chunk.chunk_index as usize];
        if slot.is_none() {
            *slot = Some(chunk.payload);
            entry.received += 1;
        }
        self.complete(frame_id)
    }

    /// Add a parity chunk; returns a frame when it fills the last gap
    pub fn push_parity(&mut self, parity: ParityChunk) -> Option<AssembledFrame> {
        let covered = parity.lengths.len();
        if covered == 0 || parity.first_index as usize + covered > parity.chunk_count as usize {
            debug!(
                "Dropping malformed parity at {} (+{}) of frame {}",
                parity.first_index, covered, parity.frame_id
            );
            return None;
        }
        if !self.accepts(parity.frame_id, parity.chunk_count) {
            return None;
        }

        let frame_id = parity.frame_id;
        let entry = self
            .partial
            .entry(frame_id)
            .or_insert_with(|| PartialFrame::new(parity.chunk_count, parity.keyframe, parity.timestamp_us));
        if entry.parity.iter().all(|p| p.first_index != parity.first_index) {
            entry.parity.push(parity);
        }
        self.complete(frame_id)
    }

    /// Drop partial frames older than the timeout; returns how many
    pub fn expire(&mut self, now: Instant) -> usize {
        let timeout = self.timeout;
        let before = self.partial.len();
        self.partial
            .retain(|_, frame| now.duration_since(frame.first_seen) < timeout);
        before - self.partial.len()
    }

    /// Whether a piece of `frame_id` can still be used
    fn accepts(&mut self, frame_id: u64, chunk_count: u16) -> bool {
        if self.last_delivered.is_some_and(|last| frame_id <= last) {
            trace!("Dropping piece of stale frame {}", frame_id);
            return false;
        }
        if self
            .partial
            .get(&frame_id)
            .is_some_and(|frame| frame.chunk_count != chunk_count)
        {
            debug!("Chunk count mismatch for frame {}", frame_id);
            self.partial.remove(&frame_id);
            return false;
        }
        true
    }

    fn complete(&mut self, frame_id: u64) -> Option<AssembledFrame> {
        let entry = self.partial.get_mut(&frame_id)?;
        entry.recover();
        if entry.received < entry.chunk_count {
            self.enforce_bound();
            return None;
        }

        let complete = self.partial.remove(&frame_id)?;

        // Anything older can never be delivered now
        let older: Vec<u64> = self.partial.range(..frame_id).map(|(id, _)| *id).collect();
        for id in &older {
            self.partial.remove(id);
        }
        let skipped = match self.last_delivered {
            Some(last) => frame_id - last - 1,
            None => 0,
        };
        self.last_delivered = Some(frame_id);

        let data = complete.chunks.into_iter().flatten().flatten().collect();
        Some(AssembledFrame {
            frame: EncodedFrame {
                frame_id,
                timestamp_us: complete.timestamp_us,
                keyframe: complete.keyframe,
                data,
            },
            skipped,
            recovered: complete.recovered,
        })
    }

    fn enforce_bound(&mut self) {
        while self.partial.len() > MAX_PENDING_FRAMES {
            if let Some((&oldest, _)) = self.partial.iter().next() {
                self.partial.remove(&oldest);
            }
        }
    }
}
