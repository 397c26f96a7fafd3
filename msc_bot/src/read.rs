// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! READ(10) pipeline.
//!
//! Blocks move host-ward in pool-sized chunks. While a chunk is being
//! sent on the bulk IN endpoint, the next block read is already
//! submitted (read-ahead). The two completion sources race: whichever of
//! {block read, USB send} finishes second resumes the pipeline, arbitrated
//! by the `io_state` flags under the context lock so a finished read is
//! never double-submitted and never dropped.

use crate::dispatch;
use crate::trace;
use crate::Action;
use crate::CommandState;
use crate::Exec;
use crate::IoState;
use block_backend::BlockError;
use msc_defs::AdditionalSenseCode;
use msc_defs::Cdb10;
use msc_defs::CswStatus;
use msc_defs::SenseKey;
use transfer_buffers::PooledBuffer;
use transfer_buffers::TransferData;
use zerocopy::FromBytes;

pub(crate) fn start(exec: &mut Exec<'_>) {
    let cbw = exec.lun().command;
    let cdb = Cdb10::read_from_prefix(&cbw.cdb[..]).unwrap().0;
    let lba = cdb.logical_block.get();
    let blocks = cdb.transfer_blocks.get() as u32;

    if blocks == 0 {
        exec.send_csw(CswStatus::PASSED);
        return;
    }

    let block_size = exec.lun().block_size;
    let Some(bytes) = blocks.checked_mul(block_size) else {
        tracing::warn!(lun = exec.lun, blocks, block_size, "read(10) byte count overflows");
        exec.lun_mut().set_sense(
            SenseKey::ILLEGAL_REQUEST,
            AdditionalSenseCode::INVALID_CDB,
            0x00,
        );
        dispatch::respond_without_data(exec);
        return;
    };
    if !cbw.is_data_in() || cbw.data_transfer_length.get() != bytes {
        tracing::warn!(
            lun = exec.lun,
            expected = bytes,
            host = cbw.data_transfer_length.get(),
            "read(10) disagrees with CBW about the data phase"
        );
        exec.send_csw(CswStatus::PHASE_ERROR);
        return;
    }

    let capacity = exec.lun().capacity_blocks;
    if lba as u64 + blocks as u64 > capacity as u64 {
        tracing::debug!(lun = exec.lun, lba, blocks, capacity, "read beyond capacity");
        exec.lun_mut().set_sense(
            SenseKey::ILLEGAL_REQUEST,
            AdditionalSenseCode::ILLEGAL_BLOCK,
            0x00,
        );
        exec.start_zlp_query();
        return;
    }

    let lun = exec.lun_mut();
    lun.lba = lba as u64;
    lun.blocks_remaining = blocks;
    lun.transfer_length_bytes = bytes;
    lun.command_state = CommandState::DataInRead;
    submit_next_read(exec);
}

/// Submits the next block-read chunk, bounded by the pool buffer size.
fn submit_next_read(exec: &mut Exec<'_>) {
    let chunk_blocks = exec.lun().max_blocks_per_unit.min(exec.lun().blocks_remaining);
    let chunk_bytes = chunk_blocks * exec.lun().block_size;
    let mut buffer: PooledBuffer = match exec.shared.pool.try_acquire() {
        Ok(buffer) => buffer,
        Err(err) => {
            tracing::warn!(lun = exec.lun, error = %err, "read chunk allocation failed");
            let lun = exec.lun_mut();
            lun.set_sense(
                SenseKey::HARDWARE_ERROR,
                AdditionalSenseCode::RESOURCE_FAILURE,
                0x00,
            );
            lun.blocks_remaining = 0;
            if !lun.io_state.contains(IoState::SEND_PENDING) {
                finish(exec);
            }
            return;
        }
    };
    buffer.set_len(chunk_bytes as usize);
    let lun = exec.lun_mut();
    let backend = lun.backend.as_ref().expect("checked at dispatch").clone();
    let lba = lun.lba;
    lun.io_state.insert(IoState::BLOCK_IO_PENDING);
    lun.lba += chunk_blocks as u64;
    lun.blocks_remaining -= chunk_blocks;
    let lun_idx = exec.lun;
    exec.actions.push(Action::SubmitRead {
        lun: lun_idx,
        backend,
        lba,
        buffer,
    });
}

/// Block-read completion. If the previous send is still on the wire the
/// result is stashed; the send completion will pick it up.
pub(crate) fn read_complete(exec: &mut Exec<'_>, result: Result<PooledBuffer, BlockError>) {
    let lun = exec.lun_mut();
    lun.io_state.remove(IoState::BLOCK_IO_PENDING);
    match result {
        Ok(buffer) => {
            lun.io_state.insert(IoState::BLOCK_IO_FINISHED);
            lun.finished_read = Some(buffer);
            if lun.io_state.contains(IoState::SEND_PENDING) {
                return;
            }
            push_send(exec);
        }
        Err(err) => {
            tracing::warn!(lun = exec.lun, error = %err, "block read failed");
            let (key, asc) = classify_read_error(&err);
            let lun = exec.lun_mut();
            lun.set_sense(key, asc, 0x00);
            lun.blocks_remaining = 0;
            if !lun.io_state.contains(IoState::SEND_PENDING) {
                finish(exec);
            }
        }
    }
}

/// Hands the stashed finished read to the IN endpoint and, if blocks
/// remain, immediately starts the next block read.
fn push_send(exec: &mut Exec<'_>) {
    let trace_crc = exec.shared.trace_data_crc;
    let lun_idx = exec.lun;
    let lun = exec.lun_mut();
    let buffer = lun.finished_read.take().expect("a finished read is stashed");
    lun.io_state.remove(IoState::BLOCK_IO_FINISHED);
    lun.io_state.insert(IoState::SEND_PENDING);
    lun.inflight_in_bytes = buffer.len() as u32;
    // The chunk being sent is the last one submitted, so it ends exactly
    // at the current submission LBA.
    let sent_lba = lun.lba - (buffer.len() as u32 / lun.block_size) as u64;
    if trace_crc {
        trace::trace_block_crc("read", lun_idx, sent_lba, lun.block_size, buffer.as_slice());
    }
    exec.actions
        .push(Action::SubmitIn(TransferData::Pooled(buffer)));
    if exec.lun().blocks_remaining > 0 {
        submit_next_read(exec);
    }
}

/// Bulk IN completion during the data phase.
pub(crate) fn send_complete(exec: &mut Exec<'_>) {
    let lun = exec.lun_mut();
    lun.io_state.remove(IoState::SEND_PENDING);
    lun.data_transferred_bytes += lun.inflight_in_bytes;
    lun.inflight_in_bytes = 0;

    if lun.io_state.contains(IoState::BLOCK_IO_FINISHED) {
        push_send(exec);
    } else if !lun.io_state.contains(IoState::BLOCK_IO_PENDING) && lun.blocks_remaining == 0 {
        finish(exec);
    }
    // Otherwise a block read is still in flight; its completion resumes
    // the pipeline.
}

fn finish(exec: &mut Exec<'_>) {
    exec.lun_mut().command_state = CommandState::DataInReadFinished;
    exec.send_csw_auto();
}

fn classify_read_error(err: &BlockError) -> (SenseKey, AdditionalSenseCode) {
    match err {
        BlockError::IllegalBlock => (SenseKey::ILLEGAL_REQUEST, AdditionalSenseCode::ILLEGAL_BLOCK),
        _ => (SenseKey::MEDIUM_ERROR, AdditionalSenseCode::UNRECOVERED_ERROR),
    }
}
