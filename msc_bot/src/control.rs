// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Control-plane surface: LUN mount/unmount, connect/disconnect waits,
//! and the vendor-specific command hand-off.
//!
//! These are the only blocking operations in the crate. They park on the
//! context condition variable and are woken by state transitions;
//! [`MscContext::close`] aborts every waiter with
//! [`ControlError::Aborted`].

use crate::dispatch;
use crate::Action;
use crate::CommandState;
use crate::Exec;
use crate::LogicalUnit;
use crate::MscContext;
use msc_defs::AdditionalSenseCode;
use msc_defs::SenseKey;
use msc_defs::CDB_LENGTH;
use block_backend::BlockBackend;
use std::sync::Arc;
use thiserror::Error;

/// Most LUNs a function instance will expose.
pub const MAX_LUNS: usize = 8;

/// A control-plane error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ControlError {
    /// The function is shutting down; all waits abort.
    #[error("connection aborted")]
    Aborted,
    /// Every LUN slot is in use.
    #[error("no free logical unit")]
    NoFreeLun,
    /// The named LUN is not mounted.
    #[error("no such logical unit")]
    NoSuchLun,
    /// The backing store's block size exceeds the transfer buffers.
    #[error("block size incompatible with transfer buffers")]
    IncompatibleBlockSize,
    /// The backing store reports no blocks.
    #[error("backing store has no blocks")]
    ZeroCapacity,
    /// No vendor-specific command is pending acknowledgement.
    #[error("no command pending acknowledgement")]
    NoPendingCommand,
}

impl MscContext {
    /// Binds `backend` to the next free LUN, returning its number.
    pub fn mount(&self, backend: Arc<dyn BlockBackend>) -> Result<u8, ControlError> {
        let mut actions = Vec::new();
        let lun_idx;
        {
            let mut state = self.shared.state.lock();
            if state.closing {
                return Err(ControlError::Aborted);
            }
            if state.luns.len() >= MAX_LUNS {
                return Err(ControlError::NoFreeLun);
            }
            let max_blocks = self.shared.pool.buffer_len() / backend.block_size() as usize;
            if max_blocks == 0 {
                return Err(ControlError::IncompatibleBlockSize);
            }
            if backend.block_count() == 0 {
                return Err(ControlError::ZeroCapacity);
            }
            lun_idx = state.luns.len();
            let lun = LogicalUnit::new(backend, max_blocks as u32, state.configured);
            tracing::info!(
                lun = lun_idx,
                capacity_blocks = lun.capacity_blocks,
                block_size = lun.block_size,
                "mounted logical unit"
            );
            state.luns.push(lun);
            if state.configured {
                actions.push(Action::Hotplug(true));
            }
            self.shared.waiters.notify_all();
        }
        self.perform(actions);
        Ok(lun_idx as u8)
    }

    /// Unbinds the most recently mounted LUN, dropping its backend.
    pub fn unmount(&self) -> Result<(), ControlError> {
        let mut actions = Vec::new();
        {
            let mut state = self.shared.state.lock();
            if state.luns.is_empty() {
                return Err(ControlError::NoSuchLun);
            }
            let lun_idx = state.luns.len() - 1;
            if state.cmd_lun == Some(lun_idx) {
                state.cmd_lun = None;
            }
            state.luns.pop();
            tracing::info!(lun = lun_idx, "unmounted logical unit");
            if state.configured {
                actions.push(Action::Hotplug(false));
            }
            self.shared.waiters.notify_all();
        }
        self.perform(actions);
        Ok(())
    }

    /// Returns the number of mounted LUNs.
    pub fn mounted_luns(&self) -> usize {
        self.shared.state.lock().luns.len()
    }

    /// Returns true if the host has configured the function.
    pub fn is_connected(&self) -> bool {
        self.shared.state.lock().configured
    }

    /// Blocks until the host configures the function.
    pub fn wait_connect(&self) -> Result<(), ControlError> {
        let mut state = self.shared.state.lock();
        loop {
            if state.closing {
                return Err(ControlError::Aborted);
            }
            if state.configured {
                return Ok(());
            }
            self.shared.waiters.wait(&mut state);
        }
    }

    /// Blocks until the host deconfigures or disconnects.
    pub fn wait_disconnect(&self) -> Result<(), ControlError> {
        let mut state = self.shared.state.lock();
        loop {
            if state.closing {
                return Err(ControlError::Aborted);
            }
            if !state.configured {
                return Ok(());
            }
            self.shared.waiters.wait(&mut state);
        }
    }

    /// Blocks until a vendor-specific command arrives on `lun` and
    /// returns its raw CDB. The command pipeline stays parked until
    /// [`MscContext::complete_unknown_command`] acknowledges it.
    pub fn unknown_command(&self, lun: u8) -> Result<[u8; CDB_LENGTH], ControlError> {
        let lun = lun as usize;
        let mut state = self.shared.state.lock();
        state.vendor_waiters += 1;
        let result = loop {
            if state.closing {
                break Err(ControlError::Aborted);
            }
            if lun >= state.luns.len() {
                break Err(ControlError::NoSuchLun);
            }
            if let Some(cdb) = state.luns[lun].unknown_cdb.take() {
                state.luns[lun].vendor_claimed = true;
                break Ok(cdb);
            }
            self.shared.waiters.wait(&mut state);
        };
        state.vendor_waiters -= 1;
        result
    }

    /// Acknowledges the vendor-specific command previously returned by
    /// [`MscContext::unknown_command`], resuming the pipeline with a
    /// passing or failing status.
    pub fn complete_unknown_command(&self, lun: u8, success: bool) -> Result<(), ControlError> {
        let lun = lun as usize;
        let mut actions = Vec::new();
        {
            let mut state = self.shared.state.lock();
            if lun >= state.luns.len() {
                return Err(ControlError::NoSuchLun);
            }
            // An ordinary query response also parks in the Query state;
            // only a claimed vendor command may be acknowledged.
            if state.cmd_lun != Some(lun)
                || state.luns[lun].command_state != CommandState::Query
                || !state.luns[lun].vendor_claimed
            {
                return Err(ControlError::NoPendingCommand);
            }
            state.luns[lun].vendor_claimed = false;
            let mut exec = Exec {
                state: &mut *state,
                actions: &mut actions,
                shared: &self.shared,
                lun,
            };
            if !success {
                exec.lun_mut().set_sense(
                    SenseKey::ILLEGAL_REQUEST,
                    AdditionalSenseCode::ILLEGAL_COMMAND,
                    0x00,
                );
            }
            dispatch::respond_without_data(&mut exec);
            self.shared.waiters.notify_all();
        }
        self.perform(actions);
        Ok(())
    }

    /// Shuts the control plane down, waking every waiter with
    /// [`ControlError::Aborted`].
    pub fn close(&self) {
        let mut state = self.shared.state.lock();
        state.closing = true;
        self.shared.waiters.notify_all();
    }
}
