// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! RAM-backed block backend.
//!
//! The I/O itself completes synchronously at submission, but the
//! completion event is queued rather than delivered, so the embedder (or a
//! test harness) controls when and in what order completions reach the
//! transport core. Error injection hooks let tests exercise the backend
//! I/O error paths.

use crate::BlockBackend;
use crate::BlockCompletion;
use crate::BlockError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::fmt::Debug;
use thiserror::Error;
use transfer_buffers::PooledBuffer;
use transfer_buffers::TransferData;

/// An error creating a RAM block backend.
#[derive(Debug, Error)]
pub enum InvalidGeometry {
    /// The block size is zero or not a power of two.
    #[error("unsupported block size {0}")]
    UnsupportedBlockSize(u32),
    /// The device has no blocks.
    #[error("zero block count")]
    ZeroBlockCount,
}

struct RamState {
    data: Vec<u8>,
    completions: VecDeque<BlockCompletion>,
    fail_reads: u32,
    fail_writes: u32,
}

/// A block backend held entirely in memory.
pub struct RamBlockBackend {
    state: Mutex<RamState>,
    block_size: u32,
    block_count: u64,
    write_protected: bool,
}

impl Debug for RamBlockBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RamBlockBackend")
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count)
            .field("write_protected", &self.write_protected)
            .finish()
    }
}

impl RamBlockBackend {
    /// Makes a zero-filled RAM backend of `block_count` blocks.
    pub fn new(
        block_count: u64,
        block_size: u32,
        write_protected: bool,
    ) -> Result<Self, InvalidGeometry> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(InvalidGeometry::UnsupportedBlockSize(block_size));
        }
        if block_count == 0 {
            return Err(InvalidGeometry::ZeroBlockCount);
        }
        Ok(RamBlockBackend {
            state: Mutex::new(RamState {
                data: vec![0; (block_count * block_size as u64) as usize],
                completions: VecDeque::new(),
                fail_reads: 0,
                fail_writes: 0,
            }),
            block_size,
            block_count,
            write_protected,
        })
    }

    /// Takes the oldest undelivered completion, if any.
    pub fn pop_completion(&self) -> Option<BlockCompletion> {
        self.state.lock().completions.pop_front()
    }

    /// Returns the number of undelivered completions.
    pub fn pending_completions(&self) -> usize {
        self.state.lock().completions.len()
    }

    /// Fails the next `count` reads with an unrecovered medium error.
    pub fn fail_next_reads(&self, count: u32) {
        self.state.lock().fail_reads = count;
    }

    /// Fails the next `count` writes with an I/O error.
    pub fn fail_next_writes(&self, count: u32) {
        self.state.lock().fail_writes = count;
    }

    /// Copies out `len` bytes at `lba` for verification.
    pub fn peek(&self, lba: u64, len: usize) -> Vec<u8> {
        let offset = (lba * self.block_size as u64) as usize;
        self.state.lock().data[offset..offset + len].to_vec()
    }

    fn range_for(&self, lba: u64, len: usize) -> Result<std::ops::Range<usize>, BlockError> {
        if len % self.block_size as usize != 0 {
            return Err(BlockError::IllegalBlock);
        }
        let end = lba
            .checked_mul(self.block_size as u64)
            .and_then(|off| off.checked_add(len as u64))
            .ok_or(BlockError::IllegalBlock)?;
        if end > self.block_count * self.block_size as u64 {
            return Err(BlockError::IllegalBlock);
        }
        let offset = (lba * self.block_size as u64) as usize;
        Ok(offset..offset + len)
    }
}

impl BlockBackend for RamBlockBackend {
    fn backend_type(&self) -> &str {
        "ram"
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn is_write_protected(&self) -> bool {
        self.write_protected
    }

    fn submit_read(&self, lba: u64, mut buffer: PooledBuffer) -> Result<(), BlockError> {
        let range = self.range_for(lba, buffer.len())?;
        let mut state = self.state.lock();
        let result = if state.fail_reads > 0 {
            state.fail_reads -= 1;
            tracing::debug!(lba, "injected read failure");
            Err(BlockError::MediumError(std::io::Error::other(
                "injected read failure",
            )))
        } else {
            let len = buffer.len();
            buffer.capacity_mut()[..len].copy_from_slice(&state.data[range]);
            Ok(buffer)
        };
        state.completions.push_back(BlockCompletion::Read { lba, result });
        Ok(())
    }

    fn submit_write(&self, lba: u64, data: TransferData) -> Result<(), BlockError> {
        if self.write_protected {
            return Err(BlockError::WriteProtected);
        }
        let range = self.range_for(lba, data.len())?;
        let mut state = self.state.lock();
        let result = if state.fail_writes > 0 {
            state.fail_writes -= 1;
            tracing::debug!(lba, "injected write failure");
            Err(BlockError::Io(std::io::Error::other(
                "injected write failure",
            )))
        } else {
            state.data[range].copy_from_slice(data.as_slice());
            Ok(())
        };
        state.completions.push_back(BlockCompletion::Write { lba, result });
        Ok(())
    }
}
