// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Defines the [`BlockBackend`] trait, the block storage abstraction the
//! mass-storage transport drives. Backends accept read and write
//! submissions that return immediately; the embedder delivers the matching
//! completion event to the transport core once the I/O finishes.
//!
//! Specific backends should be in their own modules or crates; the
//! RAM-backed reference implementation lives in [`ramdisk`].

#![forbid(unsafe_code)]

pub mod ramdisk;

use std::fmt::Debug;
use thiserror::Error;
use transfer_buffers::PooledBuffer;
use transfer_buffers::TransferData;

/// A block I/O error.
#[derive(Debug, Error)]
pub enum BlockError {
    /// The block run was out of range for the device.
    #[error("illegal block")]
    IllegalBlock,
    /// The request failed due to an unrecovered I/O error.
    #[error("io error")]
    Io(#[source] std::io::Error),
    /// The request failed due to a reportable medium error.
    #[error("medium error")]
    MediumError(#[source] std::io::Error),
    /// The backend is write protected.
    #[error("attempt to write to write-protected device")]
    WriteProtected,
    /// The backend has no queue space for the request.
    #[error("backend queue full")]
    QueueFull,
}

/// Block device metadata and asynchronous I/O submission.
///
/// `submit_read`/`submit_write` queue the operation and return. The
/// embedder later observes the backend's completion and forwards it to
/// whoever issued the submission (for the mass-storage core, via its
/// `block_read_complete`/`block_write_complete` entry points). A
/// submission error means the request was never queued and no completion
/// will be delivered.
pub trait BlockBackend: Send + Sync {
    /// Returns the backend type name, for diagnostics.
    fn backend_type(&self) -> &str;

    /// Returns the block count.
    ///
    /// This must not change while the backend is bound to a logical unit.
    fn block_count(&self) -> u64;

    /// Returns the block size in bytes.
    fn block_size(&self) -> u32;

    /// Returns true if the backend rejects writes.
    fn is_write_protected(&self) -> bool;

    /// Queues a read of `buffer.len() / block_size` blocks starting at
    /// `lba` into `buffer`. The buffer's valid length must already be set
    /// to the requested byte count.
    fn submit_read(&self, lba: u64, buffer: PooledBuffer) -> Result<(), BlockError>;

    /// Queues a write of `data.len() / block_size` blocks starting at
    /// `lba`.
    fn submit_write(&self, lba: u64, data: TransferData) -> Result<(), BlockError>;
}

/// A completed block I/O, surfaced by a backend to its embedder.
#[derive(Debug)]
pub enum BlockCompletion {
    /// A read finished; `buffer` holds the data on success.
    Read {
        lba: u64,
        result: Result<PooledBuffer, BlockError>,
    },
    /// A write finished; the data buffer has been released either way.
    Write {
        lba: u64,
        result: Result<(), BlockError>,
    },
}
