// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! WRITE(10) pipeline.
//!
//! Mirror of the read pipeline: while a received chunk is being written
//! to the backend, the next OUT receive is already armed. A receive that
//! finishes while a write is in flight is stashed; whichever completion
//! comes second resumes the pipeline under the context lock.
//!
//! When a write fails (or a pre-check rejects the command) with host data
//! still owed, the pipeline switches to a drain state that keeps
//! accepting and discarding OUT data until the host has sent everything
//! it promised, then reports the failure in the CSW. This keeps the pipe
//! and the host in agreement about remaining bytes.

use crate::dispatch;
use crate::trace;
use crate::Action;
use crate::CommandState;
use crate::Exec;
use crate::IoState;
use crate::MediaState;
use block_backend::BlockError;
use msc_defs::AdditionalSenseCode;
use msc_defs::Cdb10;
use msc_defs::CswStatus;
use msc_defs::SenseKey;
use msc_defs::SCSI_SENSEQ_WRITE_ERROR_REALLOCATION_FAILED;
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
        tracing::warn!(lun = exec.lun, blocks, block_size, "write(10) byte count overflows");
        exec.lun_mut().set_sense(
            SenseKey::ILLEGAL_REQUEST,
            AdditionalSenseCode::INVALID_CDB,
            0x00,
        );
        dispatch::respond_without_data(exec);
        return;
    };
    if cbw.is_data_in() || cbw.data_transfer_length.get() != bytes {
        tracing::warn!(
            lun = exec.lun,
            expected = bytes,
            host = cbw.data_transfer_length.get(),
            "write(10) disagrees with CBW about the data phase"
        );
        exec.send_csw(CswStatus::PHASE_ERROR);
        return;
    }

    let lun = exec.lun();
    let write_protected = lun.media_state.contains(MediaState::WRITE_PROTECTED)
        || lun.backend.as_ref().is_some_and(|b| b.is_write_protected());
    if write_protected {
        tracing::debug!(lun = exec.lun, "write to write-protected media");
        exec.lun_mut().set_sense(
            SenseKey::DATA_PROTECT,
            AdditionalSenseCode::WRITE_PROTECT,
            0x00,
        );
        start_drain(exec);
        return;
    }

    let capacity = exec.lun().capacity_blocks;
    if lba as u64 + blocks as u64 > capacity as u64 {
        tracing::debug!(lun = exec.lun, lba, blocks, capacity, "write beyond capacity");
        exec.lun_mut().set_sense(
            SenseKey::ILLEGAL_REQUEST,
            AdditionalSenseCode::ILLEGAL_BLOCK,
            0x00,
        );
        start_drain(exec);
        return;
    }

    let lun = exec.lun_mut();
    lun.lba = lba as u64;
    lun.blocks_remaining = blocks;
    lun.transfer_length_bytes = bytes;
    lun.command_state = CommandState::DataOutWrite;
    arm_next_receive(exec);
}

/// Switches the command to the drain state: any data the host still owes
/// is received and discarded before the CSW reports the accumulated
/// status.
pub(crate) fn start_drain(exec: &mut Exec<'_>) {
    exec.lun_mut().command_state = CommandState::DataOutWriteError;
    if exec.lun().expected_remaining() == 0 {
        exec.send_csw_auto();
    } else {
        arm_next_receive(exec);
    }
}

/// Arms the next OUT receive: one chunk of outstanding blocks in the
/// write state, or whatever the host still owes in the drain state.
fn arm_next_receive(exec: &mut Exec<'_>) {
    let lun = exec.lun();
    let len = if lun.command_state == CommandState::DataOutWriteError {
        (exec.shared.pool.buffer_len() as u32).min(lun.expected_remaining())
    } else {
        lun.max_blocks_per_unit.min(lun.blocks_remaining) * lun.block_size
    };
    exec.lun_mut().io_state.insert(IoState::RECV_PENDING);
    exec.actions.push(Action::SubmitOut(len as usize));
}

/// OUT receive completion during the data phase. If a block write is
/// still in flight the data is stashed; the write completion will pick
/// it up.
pub(crate) fn receive_complete(exec: &mut Exec<'_>, data: TransferData) {
    let lun = exec.lun_mut();
    lun.io_state.remove(IoState::RECV_PENDING);
    lun.io_state.insert(IoState::RECV_FINISHED);
    lun.finished_recv = Some(data);
    if lun.io_state.contains(IoState::BLOCK_IO_PENDING) {
        return;
    }
    process_received(exec);
}

/// Validates and writes the stashed received chunk, then arms the next
/// receive if more data is expected.
fn process_received(exec: &mut Exec<'_>) {
    let trace_crc = exec.shared.trace_data_crc;
    let lun_idx = exec.lun;
    let lun = exec.lun_mut();
    let data = lun.finished_recv.take().expect("a finished receive is stashed");
    lun.io_state.remove(IoState::RECV_FINISHED);
    let len = data.len() as u32;

    if lun.command_state == CommandState::DataOutWriteError {
        lun.data_transferred_bytes += len;
        drop(data);
        if exec.lun().expected_remaining() == 0 {
            exec.send_csw_auto();
        } else {
            arm_next_receive(exec);
        }
        return;
    }

    let blocks = len / lun.block_size;
    let valid = lun.media_present()
        && len > 0
        && len % lun.block_size == 0
        && blocks <= lun.blocks_remaining
        && lun.lba + blocks as u64 <= lun.capacity_blocks as u64;
    if !valid {
        tracing::warn!(
            lun = lun_idx,
            len,
            lba = lun.lba,
            remaining = lun.blocks_remaining,
            "invalid write chunk"
        );
        let (key, asc) = if !lun.media_present() {
            (SenseKey::NOT_READY, AdditionalSenseCode::NO_MEDIA_IN_DEVICE)
        } else {
            (SenseKey::ILLEGAL_REQUEST, AdditionalSenseCode::ILLEGAL_BLOCK)
        };
        lun.set_sense(key, asc, 0x00);
        lun.data_transferred_bytes += len;
        drop(data);
        start_drain(exec);
        return;
    }

    if trace_crc {
        trace::trace_block_crc("write", lun_idx, lun.lba, lun.block_size, data.as_slice());
    }

    let backend = lun.backend.as_ref().expect("checked at dispatch").clone();
    let lba = lun.lba;
    lun.io_state.insert(IoState::BLOCK_IO_PENDING);
    lun.inflight_write_bytes = len;
    lun.lba += blocks as u64;
    lun.blocks_remaining -= blocks;
    exec.actions.push(Action::SubmitWrite {
        lun: lun_idx,
        backend,
        lba,
        data,
    });
    if exec.lun().blocks_remaining > 0 {
        arm_next_receive(exec);
    }
}

/// Block-write completion.
pub(crate) fn write_complete(exec: &mut Exec<'_>, result: Result<(), BlockError>) {
    let lun = exec.lun_mut();
    lun.io_state.remove(IoState::BLOCK_IO_PENDING);
    // The chunk crossed the bus whether or not the backend accepted it;
    // the residue accounts for bus bytes.
    lun.data_transferred_bytes += lun.inflight_write_bytes;
    lun.inflight_write_bytes = 0;

    if let Err(err) = result {
        tracing::warn!(lun = exec.lun, error = %err, "block write failed");
        let (key, asc, ascq) = classify_write_error(&err);
        let lun = exec.lun_mut();
        lun.set_sense(key, asc, ascq);
        if lun.command_state == CommandState::DataOutWrite {
            lun.command_state = CommandState::DataOutWriteError;
        }
    }

    let lun = exec.lun_mut();
    if lun.io_state.contains(IoState::RECV_FINISHED) {
        process_received(exec);
        return;
    }
    if lun.io_state.contains(IoState::RECV_PENDING) {
        return;
    }
    if exec.lun().expected_remaining() > 0 {
        // Only reachable on the error path; the normal pipeline always
        // has the next receive armed.
        arm_next_receive(exec);
        return;
    }
    if exec.lun().command_state == CommandState::DataOutWrite {
        exec.lun_mut().command_state = CommandState::DataOutWriteFinished;
    }
    exec.send_csw_auto();
}

fn classify_write_error(err: &BlockError) -> (SenseKey, AdditionalSenseCode, u8) {
    match err {
        BlockError::IllegalBlock => (
            SenseKey::ILLEGAL_REQUEST,
            AdditionalSenseCode::ILLEGAL_BLOCK,
            0x00,
        ),
        BlockError::WriteProtected => (
            SenseKey::DATA_PROTECT,
            AdditionalSenseCode::WRITE_PROTECT,
            0x00,
        ),
        _ => (
            SenseKey::MEDIUM_ERROR,
            AdditionalSenseCode::WRITE_ERROR,
            SCSI_SENSEQ_WRITE_ERROR_REALLOCATION_FAILED,
        ),
    }
}
