//! Length-prefixed framing for backend snapshot chunk streams.
//!
//! The Raft snapshot sink/source expose an opaque byte stream, while the
//! backend exports and imports a sequence of [`SnapshotChunk`] messages. This
//! codec bridges the two: each chunk is prost-encoded and wrapped in a frame
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ length: u32, big-endian      │
//! ├──────────────────────────────┤
//! │ payload: SnapshotChunk bytes │
//! └──────────────────────────────┘
//! ```
//!
//! Reading terminates normally on EOF at a length prefix, or at the chunk
//! with `is_final = true`. A length prefix without its payload, or a payload
//! that fails to decode, is fatal for the in-progress restore.

use prost::Message;

use crate::service::proto::SnapshotChunk;

/// Size of the big-endian length prefix.
const PREFIX_LEN: usize = 4;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("truncated length prefix: {0} bytes where {PREFIX_LEN} were expected")]
    TruncatedPrefix(usize),

    #[error("truncated frame: length prefix says {expected} bytes, {found} remain")]
    TruncatedFrame { expected: usize, found: usize },

    #[error("chunk decode failed: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("non-contiguous chunk sequence: expected {expected}, got {got}")]
    SequenceGap { expected: u64, got: u64 },

    #[error("chunk stream has no final chunk")]
    MissingFinal,

    #[error("chunk {0} follows the final chunk")]
    ChunkAfterFinal(u64),
}

/// Check the chunk-stream invariants: sequences contiguous from 0 and exactly
/// one `is_final` chunk, in last position.
pub fn validate_sequence(chunks: &[SnapshotChunk]) -> Result<(), CodecError> {
    let mut finished = false;
    for (i, chunk) in chunks.iter().enumerate() {
        if finished {
            return Err(CodecError::ChunkAfterFinal(chunk.sequence));
        }
        if chunk.sequence != i as u64 {
            return Err(CodecError::SequenceGap {
                expected: i as u64,
                got: chunk.sequence,
            });
        }
        finished = chunk.is_final;
    }
    if !finished {
        return Err(CodecError::MissingFinal);
    }
    Ok(())
}

/// Frame a chunk sequence into a single byte stream.
///
/// The sequence invariants are checked up front so a malformed export never
/// reaches the Raft snapshot store.
pub fn write_frames(chunks: &[SnapshotChunk]) -> Result<Vec<u8>, CodecError> {
    validate_sequence(chunks)?;
    let mut buf = Vec::new();
    for chunk in chunks {
        let encoded = chunk.encode_to_vec();
        buf.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
        buf.extend_from_slice(&encoded);
    }
    Ok(buf)
}

/// Decode a framed byte stream back into its chunk sequence.
///
/// Terminates at EOF on a length prefix or at the `is_final` chunk. Any
/// partial frame is an error and the caller must abandon the restore.
pub fn read_frames(bytes: &[u8]) -> Result<Vec<SnapshotChunk>, CodecError> {
    let mut chunks = Vec::new();
    let mut pos = 0usize;

    loop {
        let remaining = bytes.len() - pos;
        if remaining == 0 {
            return Ok(chunks);
        }
        if remaining < PREFIX_LEN {
            return Err(CodecError::TruncatedPrefix(remaining));
        }

        let mut prefix = [0u8; PREFIX_LEN];
        prefix.copy_from_slice(&bytes[pos..pos + PREFIX_LEN]);
        let len = u32::from_be_bytes(prefix) as usize;
        pos += PREFIX_LEN;

        if bytes.len() - pos < len {
            return Err(CodecError::TruncatedFrame {
                expected: len,
                found: bytes.len() - pos,
            });
        }

        let chunk = SnapshotChunk::decode(&bytes[pos..pos + len])?;
        pos += len;

        let is_final = chunk.is_final;
        chunks.push(chunk);
        if is_final {
            return Ok(chunks);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
