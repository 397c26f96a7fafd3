// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fixed-size transfer buffers shared between the transport layer and the
//! block storage backend.
//!
//! Data-phase payloads move through the pipeline as singly-owned values:
//! a buffer is owned by exactly one layer at a time, and ownership
//! transfers by moving the [`TransferData`] (or [`PooledBuffer`]) value at
//! each hand-off point. Dropping a pooled buffer returns it to its pool.

#![forbid(unsafe_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;

/// Error returned when the pool has no free buffers.
#[derive(Debug, Error)]
#[error("transfer buffer pool exhausted (capacity {capacity})")]
pub struct PoolExhausted {
    capacity: usize,
}

struct PoolShared {
    free: Mutex<Vec<Box<[u8]>>>,
    buffer_len: usize,
    capacity: usize,
}

/// A pool of equally-sized transfer buffers.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Creates a pool of `count` buffers of `buffer_len` bytes each.
    pub fn new(count: usize, buffer_len: usize) -> Self {
        let free = (0..count)
            .map(|_| vec![0u8; buffer_len].into_boxed_slice())
            .collect();
        BufferPool {
            shared: Arc::new(PoolShared {
                free: Mutex::new(free),
                buffer_len,
                capacity: count,
            }),
        }
    }

    /// Returns the length of every buffer in the pool.
    pub fn buffer_len(&self) -> usize {
        self.shared.buffer_len
    }

    /// Acquires a buffer, failing if none is free.
    pub fn try_acquire(&self) -> Result<PooledBuffer, PoolExhausted> {
        let data = self.shared.free.lock().pop().ok_or(PoolExhausted {
            capacity: self.shared.capacity,
        })?;
        Ok(PooledBuffer {
            data: Some(data),
            len: 0,
            shared: self.shared.clone(),
        })
    }

    /// Returns the number of buffers currently free.
    pub fn free_buffers(&self) -> usize {
        self.shared.free.lock().len()
    }
}

/// A buffer borrowed from a [`BufferPool`], returned on drop.
pub struct PooledBuffer {
    data: Option<Box<[u8]>>,
    len: usize,
    shared: Arc<PoolShared>,
}

impl PooledBuffer {
    /// Sets the number of valid bytes.
    ///
    /// Panics if `len` exceeds the buffer capacity.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.shared.buffer_len);
        self.len = len;
    }

    /// Returns the valid bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data.as_ref().unwrap()[..self.len]
    }

    /// Returns the full capacity mutably, for filling before `set_len`.
    pub fn capacity_mut(&mut self) -> &mut [u8] {
        self.data.as_mut().unwrap()
    }

    /// Returns the number of valid bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no bytes are valid.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.shared.free.lock().push(data);
        }
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer").field("len", &self.len).finish()
    }
}

/// An owned data-phase payload: either pool-backed or inline.
///
/// Inline payloads cover the small fixed-format responses (CSW, inquiry
/// data, sense data) and received OUT data handed over by the transport;
/// pooled payloads carry block runs through the read pipeline.
#[derive(Debug)]
pub enum TransferData {
    Inline(Vec<u8>),
    Pooled(PooledBuffer),
}

impl TransferData {
    /// An empty payload, used for zero-length packets.
    pub fn empty() -> Self {
        TransferData::Inline(Vec::new())
    }

    /// Returns the payload bytes.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            TransferData::Inline(v) => v,
            TransferData::Pooled(b) => b.as_slice(),
        }
    }

    /// Returns the payload length in bytes.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Returns true if the payload is zero-length.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Vec<u8>> for TransferData {
    fn from(v: Vec<u8>) -> Self {
        TransferData::Inline(v)
    }
}

impl From<PooledBuffer> for TransferData {
    fn from(b: PooledBuffer) -> Self {
        TransferData::Pooled(b)
    }
}
