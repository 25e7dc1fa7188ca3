//! Forward Error Correction (FEC) for video chunk loss recovery
//!
//! XOR parity: every group of up to `FEC_GROUP_SIZE` chunks of a frame is
//! followed by one parity chunk, so any single chunk lost from a group can be
//! rebuilt from the others without a retransmission.

use thiserror::Error;

use crate::protocol::{ParityChunk, VideoChunk};

/// Data chunks covered by one parity chunk
pub const FEC_GROUP_SIZE: usize = 4;

/// Why a parity chunk could not rebuild anything
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FecError {
    #[error("Chunk sizes do not match the parity group")]
    SizeMismatch,

    #[error("No chunk missing from the group")]
    NoMissingChunk,

    #[error("More than one chunk missing from the group")]
    TooManyMissing,
}

/// Parity over consecutive chunks of one frame
///
/// A lone chunk gets a parity chunk too; it is then simply sent twice.
pub fn parity_for(group: &[VideoChunk]) -> Option<ParityChunk> {
    let first = group.first()?;
    let width = group.iter().map(|c| c.payload.len()).max().unwrap_or(0);

    let mut payload = vec![0u8; width];
    for chunk in group {
        for (p, b) in payload.iter_mut().zip(&chunk.payload) {
            *p ^= b;
        }
    }

    Some(ParityChunk {
        frame_id: first.frame_id,
        first_index: first.chunk_index,
        chunk_count: first.chunk_count,
        timestamp_us: first.timestamp_us,
        keyframe: first.keyframe,
        lengths: group.iter().map(|c| c.payload.len() as u16).collect(),
        payload,
    })
}

/// Rebuild the one missing chunk of a group
///
/// `shards` holds the group's chunks in order, `None` where a chunk has not
/// arrived. Returns the position of the rebuilt chunk within the group.
pub fn recover_chunk(
    parity: &ParityChunk,
    shards: &[Option<&[u8]>],
) -> Result<(usize, Vec<u8>), FecError> {
    if shards.len() != parity.lengths.len() {
        return Err(FecError::SizeMismatch);
    }

    let mut missing = None;
    for (index, shard) in shards.iter().enumerate() {
        match shard {
            None if missing.is_some() => return Err(FecError::TooManyMissing),
            None => missing = Some(index),
            Some(data) if data.len() != parity.lengths[index] as usize => {
                return Err(FecError::SizeMismatch)
            }
            Some(_) => {}
        }
    }
    let missing = missing.ok_or(FecError::NoMissingChunk)?;

    let len = parity.lengths[missing] as usize;
    if len > parity.payload.len() {
        return Err(FecError::SizeMismatch);
    }
    let mut recovered = parity.payload.clone();
    for data in shards.iter().flatten() {
        for (r, b) in recovered.iter_mut().zip(*data) {
            *r ^= b;
        }
    }
    recovered.truncate(len);
    Ok((missing, recovered))
}
