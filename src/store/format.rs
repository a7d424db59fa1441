//! Cell blob format: `u32 magic, u32 version`, then 8-byte edit records
//! until the end of the blob. All integers little-endian.

use crate::cell::CellIndex;
use crate::core::error::Error;
use crate::core::types::Result;
use crate::edit::{CompressedEdit, RECORD_SIZE};

/// "Cell" read as a little-endian u32
pub const MAGIC: u32 = 0x6c6c6543;
pub const VERSION: u32 = 1;

const HEADER_SIZE: usize = 8;

/// Serialize a full edit history into a blob
pub fn encode_blob(edits: &[CompressedEdit]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE + edits.len() * RECORD_SIZE);
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(&VERSION.to_le_bytes());
    for edit in edits {
        out.extend_from_slice(&edit.to_bytes());
    }
    out
}

/// Parse a blob back into its edit history
///
/// A bad header or an unknown record kind is reported as
/// [`Error::CorruptPersistedState`]. A partial record at the very end is
/// dropped with a warning.
pub fn decode_blob(cell: CellIndex, data: &[u8]) -> Result<Vec<CompressedEdit>> {
    let corrupt = |reason: String| Error::CorruptPersistedState { cell, reason };

    if data.len() < HEADER_SIZE {
        return Err(corrupt(format!("truncated header ({} bytes)", data.len())));
    }

    let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    if magic != MAGIC {
        return Err(corrupt(format!("invalid magic {:#010x}", magic)));
    }

    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version != VERSION {
        return Err(corrupt(format!("unsupported version {}", version)));
    }

    let body = &data[HEADER_SIZE..];
    let chunks = body.chunks_exact(RECORD_SIZE);
    if !chunks.remainder().is_empty() {
        log::warn!(
            "Cell {} has {} trailing bytes after its last record, ignoring them",
            cell,
            chunks.remainder().len()
        );
    }

    chunks
        .enumerate()
        .map(|(i, record)| {
            CompressedEdit::read(record)
                .ok_or_else(|| corrupt(format!("record {} has unknown kind {}", i, record[0])))
        })
        .collect()
}
