// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-block CRC32 data tracing.
//!
//! Purely diagnostic: the checksums let a bus capture be matched against
//! what the pipeline actually moved. Never affects command outcome.

/// Emits one trace event per block in `data`.
pub(crate) fn trace_block_crc(op: &str, lun: usize, lba: u64, block_size: u32, data: &[u8]) {
    for (i, block) in data.chunks_exact(block_size as usize).enumerate() {
        let crc = crc32fast::hash(block);
        tracing::trace!(op, lun, lba = lba + i as u64, crc, "block crc");
    }
}
