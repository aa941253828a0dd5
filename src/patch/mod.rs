//! Chunked patcher (C6): transfer the delta between two file versions at
//! `O(changed-chunks)` cost (§4.6).

pub mod chunker;
pub mod sidecar;

use std::collections::HashMap;

use log::warn;

use crate::error::CoreError;
use crate::hash::{hash_bytes, Hash};
use chunker::{build_subblock_index, RollingChecksum};
use sidecar::{ChunkHash, ChunkSidecar};

/// Logical chunk size: `c_vhdblocksize` in the original (§4.6).
pub const CHUNK_SIZE: usize = 512 * 1024;
/// Sub-block size used by the rolling-hash search: `c_blocksize` (§4.6).
pub const SUBBLOCK_SIZE: usize = 4 * 1024;
/// Width of a chunk's strong hash in the sidecar.
pub const STRONG_HASH_BYTES: usize = 32;

/// Maximum whole-file retries before surfacing `ERR_HASH` (§4.6
/// "Correctness obligations").
pub const MAX_WHOLE_FILE_RETRIES: u32 = 5;

/// One instruction for reassembling the new file from the base plus
/// literal bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchOp {
    /// Reuse `len` bytes from the base file starting at `base_offset`
    /// ("same" — matched the sidecar or was relocated via rolling hash).
    Copy { base_offset: u64, len: u64 },
    /// Bytes the sender transmitted in full because no match was found.
    Literal(Vec<u8>),
}

/// Compute the patch turning `base` into `new`, using `base_sidecar` (one
/// strong hash per `CHUNK_SIZE`-aligned chunk of `base`) to avoid
/// re-transmitting unchanged chunks, and a rolling-hash pass over `base`'s
/// sub-blocks to relocate chunks that shifted position (§4.6 protocol).
pub fn compute_patch(base: &[u8], new: &[u8], base_sidecar: &ChunkSidecar) -> Vec<PatchOp> {
    let mut ops = Vec::new();
    let subblock_index = build_subblock_index(base);

    let mut offset = 0usize;
    let mut chunk_index = 0usize;
    while offset < new.len() {
        let end = (offset + CHUNK_SIZE).min(new.len());
        let chunk = &new[offset..end];

        if let Some(base_offset) = matches_base_chunk_in_place(chunk_index, chunk, base_sidecar) {
            ops.push(PatchOp::Copy {
                base_offset: base_offset as u64,
                len: chunk.len() as u64,
            });
        } else if let Some(base_offset) =
            relocate_via_rolling_hash(chunk, base, &subblock_index)
        {
            ops.push(PatchOp::Copy {
                base_offset: base_offset as u64,
                len: chunk.len() as u64,
            });
        } else {
            ops.push(PatchOp::Literal(chunk.to_vec()));
        }

        offset = end;
        chunk_index += 1;
    }

    ops
}

fn matches_base_chunk_in_place(
    chunk_index: usize,
    chunk: &[u8],
    base_sidecar: &ChunkSidecar,
) -> Option<usize> {
    let recorded = base_sidecar.chunk_hashes.get(chunk_index)?;
    if ChunkHash::of(chunk) == *recorded {
        Some(chunk_index * CHUNK_SIZE)
    } else {
        None
    }
}

/// Scan `base` for a window matching `chunk`'s leading sub-block via the
/// rolling checksum, then confirm with a strong-hash comparison over the
/// full chunk length (§4.6: rolling pass finds the *candidate*, strong
/// hash confirms it to avoid checksum collisions).
fn relocate_via_rolling_hash(
    chunk: &[u8],
    base: &[u8],
    subblock_index: &HashMap<u32, Vec<usize>>,
) -> Option<usize> {
    if chunk.len() < SUBBLOCK_SIZE {
        return None;
    }
    let target = RollingChecksum::new(&chunk[..SUBBLOCK_SIZE]).value();
    let candidates = subblock_index.get(&target)?;
    let target_hash = ChunkHash::of(chunk);
    for &candidate_offset in candidates {
        if candidate_offset + chunk.len() > base.len() {
            continue;
        }
        let candidate = &base[candidate_offset..candidate_offset + chunk.len()];
        if ChunkHash::of(candidate) == target_hash {
            return Some(candidate_offset);
        }
    }
    None
}

/// Reassemble the new file's bytes from `base` and a computed patch
/// (§4.6: "server reassembles: copy from base where same, apply literal
/// bytes where sent"). The result's length is implicitly the new file's
/// length, so truncation/extension need no special casing.
pub fn apply_patch(base: &[u8], ops: &[PatchOp]) -> Vec<u8> {
    let mut out = Vec::new();
    for op in ops {
        match op {
            PatchOp::Copy { base_offset, len } => {
                let start = *base_offset as usize;
                let end = start + *len as usize;
                out.extend_from_slice(&base[start..end]);
            }
            PatchOp::Literal(bytes) => out.extend_from_slice(bytes),
        }
    }
    out
}

/// Apply the patch and verify the result against `expected_hash`,
/// retrying the whole transfer up to [`MAX_WHOLE_FILE_RETRIES`] times
/// before surfacing `ERR_HASH` (§4.6 correctness obligation). `recompute`
/// is called again on each retry to obtain a fresh patch (e.g. re-pulled
/// from the network); this function does not itself perform I/O.
pub fn apply_with_retry<F>(
    base: &[u8],
    expected_hash: Hash,
    mut recompute: F,
    file_path: &std::path::Path,
) -> Result<Vec<u8>, CoreError>
where
    F: FnMut() -> Vec<PatchOp>,
{
    for attempt in 0..=MAX_WHOLE_FILE_RETRIES {
        let ops = recompute();
        let result = apply_patch(base, &ops);
        if hash_bytes(&result) == expected_hash {
            return Ok(result);
        }
        warn!(
            "patch: whole-file hash mismatch for {:?}, attempt {}/{}",
            file_path, attempt, MAX_WHOLE_FILE_RETRIES
        );
    }
    Err(CoreError::HashMismatch {
        path: file_path.to_path_buf(),
        expected: expected_hash.to_hex(),
        actual: String::new(),
    })
}

/// §4.6 "On any I/O error mid-transfer": decide whether to keep a
/// partially-written file as "incomplete" or delete it.
pub fn keep_partial_file(save_incomplete_file: bool, bytes_received: u64) -> bool {
    save_incomplete_file && bytes_received > 0
}
