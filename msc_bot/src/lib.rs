// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! USB Mass Storage Class Bulk-Only Transport (BOT) function engine.
//!
//! [`MscContext`] implements the BOT protocol state machine with SCSI
//! command emulation in front of a [`BlockBackend`]: CBW receipt and
//! validation, command dispatch, pipelined READ(10)/WRITE(10) data
//! phases, CSW framing, class-request handling (Bulk-Only Reset, Get Max
//! LUN), endpoint stall recovery, and multi-LUN mount/unmount with a
//! blocking control-plane surface.
//!
//! The context is a passive state machine driven by completion events.
//! Submissions to the USB side go through the [`Transport`] trait and to
//! the storage side through [`BlockBackend`]; both return immediately.
//! The embedder delivers the matching completions through the
//! `*_complete` entry points. All state transitions run under a single
//! per-context lock; submissions requested during a transition are issued
//! after the lock is released, so a transport or backend that completes
//! synchronously can re-enter the context without deadlocking.

#![forbid(unsafe_code)]

mod control;
mod dispatch;
mod read;
mod trace;
mod write;

#[cfg(test)]
mod tests;

pub use control::ControlError;
pub use control::MAX_LUNS;

use bitflags::bitflags;
use block_backend::BlockBackend;
use block_backend::BlockError;
use msc_defs::class_request;
use msc_defs::CommandBlockWrapper;
use msc_defs::CommandStatusWrapper;
use msc_defs::CswStatus;
use msc_defs::SenseData;
use msc_defs::SenseKey;
use msc_defs::AdditionalSenseCode;
use msc_defs::CBW_LENGTH;
use msc_defs::CBW_SIGNATURE;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::sync::Arc;
use thiserror::Error;
use transfer_buffers::BufferPool;
use transfer_buffers::PooledBuffer;
use transfer_buffers::TransferData;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// Bulk endpoint direction, from the host's point of view.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Device to host.
    In,
    /// Host to device.
    Out,
}

/// A transport submission error.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The endpoint is (or must be) stalled.
    #[error("endpoint stalled")]
    Stall,
    /// The bus is gone.
    #[error("transport disconnected")]
    Disconnected,
}

/// The USB bulk endpoint pair the function drives.
///
/// Submissions return immediately; the embedder delivers completions via
/// [`MscContext::bulk_in_complete`] and [`MscContext::bulk_out_complete`].
pub trait Transport: Send + Sync {
    /// Submits an IN (device-to-host) transfer. An empty payload is sent
    /// as a zero-length packet.
    fn submit_in(&self, data: TransferData) -> Result<(), TransportError>;

    /// Arms an OUT (host-to-device) receive of at most `len` bytes.
    fn submit_out(&self, len: usize) -> Result<(), TransportError>;

    /// Halts an endpoint. The halt clears only when the host issues
    /// Clear Feature, reported via [`MscContext::endpoint_cleared`].
    fn halt(&self, direction: Direction);
}

/// Out-of-band notification that storage became available/unavailable,
/// delivered on configure, reset, suspend, and media load/eject.
pub trait HotplugSignal: Send + Sync {
    fn media_changed(&self, available: bool);
}

bitflags! {
    /// Overlap tracking between block I/O and USB transfer completion.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub(crate) struct IoState: u8 {
        const BLOCK_IO_PENDING = 1 << 0;
        const BLOCK_IO_FINISHED = 1 << 1;
        const RECV_PENDING = 1 << 2;
        const RECV_FINISHED = 1 << 3;
        const SEND_PENDING = 1 << 4;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub(crate) struct EndpointState: u8 {
        const BULK_IN_HALTED = 1 << 0;
        const BULK_OUT_HALTED = 1 << 1;
    }
}

bitflags! {
    /// Media binding state of a logical unit.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub(crate) struct MediaState: u8 {
        const EJECTED = 1 << 0;
        const INSERTED = 1 << 1;
        const OPEN = 1 << 2;
        const WRITE_PROTECTED = 1 << 3;
        const CHANGE_ON = 1 << 4;
        const PREVENT_REMOVAL = 1 << 5;
    }
}

/// Phase of the current SCSI command.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum CommandState {
    /// Idle; the next CBW starts a command.
    Ready,
    /// WRITE data phase: receiving host data and writing blocks.
    DataOutWrite,
    /// WRITE data phase complete; CSW pending.
    DataOutWriteFinished,
    /// WRITE failed mid-phase; draining remaining host data to keep the
    /// pipe consistent before reporting the failure. Also used to drain
    /// OUT data for commands whose payload is accepted and discarded.
    DataOutWriteError,
    /// READ data phase: reading blocks and sending them to the host.
    DataInRead,
    /// READ data phase complete; CSW pending.
    DataInReadFinished,
    /// CSW in flight.
    Status,
    /// Immediate-response data (or a vendor command's control-plane
    /// round trip) in flight; CSW follows automatically.
    Query,
    /// Fatal protocol violation; only a Bulk-Only Reset recovers.
    WaitForReset,
    /// Reset seen; waiting for the host to clear both endpoint halts.
    WaitForClear,
}

/// Per-LUN state record.
pub(crate) struct LogicalUnit {
    pub connected: bool,
    pub command: CommandBlockWrapper,
    pub command_state: CommandState,
    /// Status the CSW will carry; forced to FAILED whenever sense data is
    /// recorded during the command.
    pub command_status: CswStatus,
    pub io_state: IoState,

    /// Next LBA the active pipeline will submit.
    pub lba: u64,
    /// Blocks not yet submitted (read) or not yet received (write).
    pub blocks_remaining: u32,
    pub transfer_length_bytes: u32,
    pub data_transferred_bytes: u32,
    /// Byte length of the IN transfer or block write currently in flight.
    pub inflight_in_bytes: u32,
    pub inflight_write_bytes: u32,

    pub backend: Option<Arc<dyn BlockBackend>>,
    pub block_size: u32,
    pub capacity_blocks: u32,
    pub max_blocks_per_unit: u32,
    pub media_state: MediaState,
    pub sense: Option<SenseData>,

    /// Block read that finished while the previous send was in flight.
    pub finished_read: Option<PooledBuffer>,
    /// USB receive that finished while a block write was in flight.
    pub finished_recv: Option<TransferData>,

    /// Vendor-specific CDB awaiting a control-plane consumer.
    pub unknown_cdb: Option<[u8; msc_defs::CDB_LENGTH]>,
    /// A consumer has taken the vendor CDB and owes an acknowledgement.
    /// Distinguishes the parked vendor command from an ordinary query
    /// response in flight, which also sits in [`CommandState::Query`].
    pub vendor_claimed: bool,
}

impl LogicalUnit {
    fn new(backend: Arc<dyn BlockBackend>, max_blocks_per_unit: u32, connected: bool) -> Self {
        let block_size = backend.block_size();
        let capacity_blocks = backend.block_count().min(u32::MAX as u64) as u32;
        let mut media_state = MediaState::INSERTED | MediaState::OPEN | MediaState::CHANGE_ON;
        if backend.is_write_protected() {
            media_state |= MediaState::WRITE_PROTECTED;
        }
        LogicalUnit {
            connected,
            command: CommandBlockWrapper::new_zeroed(),
            command_state: CommandState::Ready,
            command_status: CswStatus::PASSED,
            io_state: IoState::empty(),
            lba: 0,
            blocks_remaining: 0,
            transfer_length_bytes: 0,
            data_transferred_bytes: 0,
            inflight_in_bytes: 0,
            inflight_write_bytes: 0,
            backend: Some(backend),
            block_size,
            capacity_blocks,
            max_blocks_per_unit,
            media_state,
            sense: None,
            finished_read: None,
            finished_recv: None,
            unknown_cdb: None,
            vendor_claimed: false,
        }
    }

    pub(crate) fn media_present(&self) -> bool {
        self.media_state.contains(MediaState::INSERTED)
            && !self.media_state.contains(MediaState::EJECTED)
    }

    /// Records sense data for the current command and marks its CSW
    /// failed. The sense persists until overwritten or read back by
    /// REQUEST SENSE.
    pub(crate) fn set_sense(&mut self, key: SenseKey, asc: AdditionalSenseCode, ascq: u8) {
        self.sense = Some(SenseData::new(key, asc, ascq));
        self.command_status = CswStatus::FAILED;
    }

    /// Bytes the host still owes (or is owed) for the current command.
    pub(crate) fn expected_remaining(&self) -> u32 {
        self.command
            .data_transfer_length
            .get()
            .saturating_sub(self.data_transferred_bytes)
    }

    /// Drops any stashed buffers and in-flight accounting, aborting the
    /// current command without notifying the host.
    fn abort_command(&mut self) {
        self.io_state = IoState::empty();
        self.finished_read = None;
        self.finished_recv = None;
        self.unknown_cdb = None;
        self.vendor_claimed = false;
        self.inflight_in_bytes = 0;
        self.inflight_write_bytes = 0;
        self.blocks_remaining = 0;
    }
}

/// Deferred work generated by a state transition, issued after the
/// context lock is dropped.
pub(crate) enum Action {
    SubmitIn(TransferData),
    SubmitOut(usize),
    Halt(Direction),
    SubmitRead {
        lun: usize,
        backend: Arc<dyn BlockBackend>,
        lba: u64,
        buffer: PooledBuffer,
    },
    SubmitWrite {
        lun: usize,
        backend: Arc<dyn BlockBackend>,
        lba: u64,
        data: TransferData,
    },
    Hotplug(bool),
}

pub(crate) struct MscState {
    pub luns: Vec<LogicalUnit>,
    /// Which LUN owns the command in flight. Threaded explicitly through
    /// every transition; completions for the shared endpoints route here.
    pub cmd_lun: Option<usize>,
    pub configured: bool,
    pub closing: bool,
    /// A CBW-sized receive is armed on the OUT endpoint.
    pub cbw_armed: bool,
    /// CSW in flight answering a CBW that addressed no valid LUN.
    pub orphan_status: bool,
    pub endpoint_state: EndpointState,
    /// Control-plane threads currently blocked waiting for a
    /// vendor-specific command.
    pub vendor_waiters: usize,
}

impl MscState {
    fn teardown(&mut self, actions: &mut Vec<Action>) {
        self.configured = false;
        self.cmd_lun = None;
        self.cbw_armed = false;
        self.orphan_status = false;
        self.endpoint_state = EndpointState::empty();
        for lun in &mut self.luns {
            lun.connected = false;
            lun.command_state = CommandState::Ready;
            lun.abort_command();
        }
        if !self.luns.is_empty() {
            actions.push(Action::Hotplug(false));
        }
    }

    fn bring_up(&mut self, actions: &mut Vec<Action>) {
        self.configured = true;
        self.cmd_lun = None;
        self.orphan_status = false;
        self.endpoint_state = EndpointState::empty();
        for lun in &mut self.luns {
            lun.connected = true;
            lun.command_state = CommandState::Ready;
            lun.abort_command();
        }
        self.arm_cbw(actions);
        if !self.luns.is_empty() {
            actions.push(Action::Hotplug(true));
        }
    }

    /// Arms the initial 31-byte receive for the next CBW.
    pub(crate) fn arm_cbw(&mut self, actions: &mut Vec<Action>) {
        if self.configured && !self.cbw_armed {
            self.cbw_armed = true;
            actions.push(Action::SubmitOut(CBW_LENGTH));
        }
    }

    /// Fatal protocol violation: halt both endpoints and refuse further
    /// commands until a Bulk-Only Reset and endpoint clears.
    pub(crate) fn protocol_fatal(&mut self, actions: &mut Vec<Action>) {
        tracing::warn!("bulk-only protocol violation, halting endpoints");
        self.endpoint_state = EndpointState::BULK_IN_HALTED | EndpointState::BULK_OUT_HALTED;
        actions.push(Action::Halt(Direction::In));
        actions.push(Action::Halt(Direction::Out));
        self.cmd_lun = None;
        self.cbw_armed = false;
        self.orphan_status = false;
        for lun in &mut self.luns {
            lun.abort_command();
            lun.command_state = CommandState::WaitForReset;
        }
    }

    fn ready_after_clear(&mut self, actions: &mut Vec<Action>) {
        for lun in &mut self.luns {
            lun.command_state = CommandState::Ready;
        }
        self.cmd_lun = None;
        self.arm_cbw(actions);
    }
}

/// Tuning knobs for [`MscContext::new`].
pub struct MscOptions {
    /// Number of fixed-size data-phase buffers in the pool.
    pub transfer_buffers: usize,
    /// Byte length of each pooled buffer; bounds the blocks moved per
    /// block I/O request (`buffer_len / block_size`, computed at mount).
    pub transfer_buffer_len: usize,
    /// Emit a per-block CRC32 trace for every data-phase block.
    pub trace_data_crc: bool,
    /// Optional out-of-band availability notification.
    pub hotplug: Option<Box<dyn HotplugSignal>>,
}

impl Default for MscOptions {
    fn default() -> Self {
        MscOptions {
            transfer_buffers: 4,
            transfer_buffer_len: 64 * 512,
            trace_data_crc: false,
            hotplug: None,
        }
    }
}

pub(crate) struct MscShared {
    pub state: Mutex<MscState>,
    pub waiters: Condvar,
    pub transport: Arc<dyn Transport>,
    pub hotplug: Option<Box<dyn HotplugSignal>>,
    pub pool: BufferPool,
    pub trace_data_crc: bool,
}

/// The mass-storage function instance.
///
/// Clones share the same state; the control plane typically runs on its
/// own thread with a clone of the context.
#[derive(Clone)]
pub struct MscContext {
    shared: Arc<MscShared>,
}

/// A single state transition's view of the context: the locked state, the
/// deferred-action sink, and the LUN the transition targets.
pub(crate) struct Exec<'a> {
    pub state: &'a mut MscState,
    pub actions: &'a mut Vec<Action>,
    pub shared: &'a MscShared,
    pub lun: usize,
}

impl Exec<'_> {
    pub fn lun(&self) -> &LogicalUnit {
        &self.state.luns[self.lun]
    }

    pub fn lun_mut(&mut self) -> &mut LogicalUnit {
        &mut self.state.luns[self.lun]
    }

    /// Builds and submits the CSW for the current command.
    pub fn send_csw(&mut self, status: CswStatus) {
        let lun = self.lun_mut();
        let residue = lun.expected_remaining();
        let csw = CommandStatusWrapper::new(&lun.command, residue, status);
        lun.command_state = CommandState::Status;
        tracing::debug!(
            lun = self.lun,
            status = ?status,
            residue,
            "sending csw"
        );
        self.actions
            .push(Action::SubmitIn(csw.as_bytes().to_vec().into()));
    }

    /// Sends the CSW with the status accumulated for this command
    /// (FAILED when any sense was recorded, PASSED otherwise).
    pub fn send_csw_auto(&mut self) {
        let status = self.lun().command_status;
        self.send_csw(status);
    }

    /// Submits an immediate-response payload, truncated to what the host
    /// asked for; the CSW follows on its completion. With no data phase
    /// requested, skips straight to the CSW.
    pub fn start_query(&mut self, mut data: Vec<u8>) {
        let max = self.lun().command.data_transfer_length.get() as usize;
        data.truncate(max);
        if max == 0 {
            self.send_csw_auto();
            return;
        }
        let lun = self.lun_mut();
        lun.inflight_in_bytes = data.len() as u32;
        lun.command_state = CommandState::Query;
        self.actions.push(Action::SubmitIn(data.into()));
    }

    /// Responds with a zero-length IN packet followed by a CSW, for
    /// commands that must answer a device-to-host data phase they cannot
    /// fill.
    pub fn start_zlp_query(&mut self) {
        let lun = self.lun_mut();
        lun.inflight_in_bytes = 0;
        lun.command_state = CommandState::Query;
        self.actions.push(Action::SubmitIn(TransferData::empty()));
    }
}

impl MscContext {
    /// Creates a function context over `transport`.
    pub fn new(transport: Arc<dyn Transport>, options: MscOptions) -> Self {
        let MscOptions {
            transfer_buffers,
            transfer_buffer_len,
            trace_data_crc,
            hotplug,
        } = options;
        MscContext {
            shared: Arc::new(MscShared {
                state: Mutex::new(MscState {
                    luns: Vec::new(),
                    cmd_lun: None,
                    configured: false,
                    closing: false,
                    cbw_armed: false,
                    orphan_status: false,
                    endpoint_state: EndpointState::empty(),
                    vendor_waiters: 0,
                }),
                waiters: Condvar::new(),
                transport,
                hotplug,
                pool: BufferPool::new(transfer_buffers, transfer_buffer_len),
                trace_data_crc,
            }),
        }
    }

    fn run(&self, f: impl FnOnce(&mut MscState, &mut Vec<Action>, &MscShared)) {
        let mut actions = Vec::new();
        {
            let mut state = self.shared.state.lock();
            f(&mut state, &mut actions, &self.shared);
            self.shared.waiters.notify_all();
        }
        self.perform(actions);
    }

    fn perform(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::SubmitIn(data) => {
                    if let Err(err) = self.shared.transport.submit_in(data) {
                        tracing::warn!(error = %err, "bulk IN submission failed");
                        self.run(|state, actions, _| state.protocol_fatal(actions));
                    }
                }
                Action::SubmitOut(len) => {
                    if let Err(err) = self.shared.transport.submit_out(len) {
                        tracing::warn!(error = %err, len, "bulk OUT submission failed");
                        self.run(|state, actions, _| state.protocol_fatal(actions));
                    }
                }
                Action::Halt(direction) => self.shared.transport.halt(direction),
                Action::SubmitRead {
                    lun,
                    backend,
                    lba,
                    buffer,
                } => {
                    if let Err(err) = backend.submit_read(lba, buffer) {
                        tracing::warn!(lun, lba, error = %err, "read submission failed");
                        self.block_read_complete(lun as u8, Err(err));
                    }
                }
                Action::SubmitWrite {
                    lun,
                    backend,
                    lba,
                    data,
                } => {
                    if let Err(err) = backend.submit_write(lba, data) {
                        tracing::warn!(lun, lba, error = %err, "write submission failed");
                        self.block_write_complete(lun as u8, Err(err));
                    }
                }
                Action::Hotplug(available) => {
                    if let Some(hotplug) = &self.shared.hotplug {
                        hotplug.media_changed(available);
                    }
                }
            }
        }
    }

    /// The host selected (or deselected) the configuration exposing this
    /// function: all LUNs become ready and the initial CBW receive is
    /// armed.
    pub fn configured(&self, on: bool) {
        tracing::info!(on, "set configuration");
        self.run(|state, actions, _| {
            if on {
                state.bring_up(actions);
            } else {
                state.teardown(actions);
            }
        });
    }

    /// Bus reset or disconnect: tear down all LUN state and release the
    /// bound block devices.
    pub fn reset(&self) {
        tracing::info!("bus reset");
        self.run(|state, actions, _| {
            state.teardown(actions);
            state.luns.clear();
        });
    }

    /// Bus suspend: abort in-flight work and release outstanding receive
    /// buffers, keeping LUN bindings for resume.
    pub fn suspend(&self) {
        tracing::info!("suspend");
        self.run(|state, actions, _| state.teardown(actions));
    }

    /// Bus resume: mirror of [`MscContext::suspend`].
    pub fn resume(&self) {
        tracing::info!("resume");
        self.run(|state, actions, _| state.bring_up(actions));
    }

    /// Handles a class-specific control request. Returns the data-stage
    /// payload for device-to-host requests, or `TransportError::Stall` if
    /// the request must be stalled.
    pub fn class_request(
        &self,
        request: u8,
        _value: u16,
        _index: u16,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        match request {
            class_request::BULK_ONLY_RESET => {
                tracing::info!("bulk-only mass storage reset");
                self.run(|state, actions, _| {
                    state.cmd_lun = None;
                    state.cbw_armed = false;
                    state.orphan_status = false;
                    for lun in &mut state.luns {
                        lun.abort_command();
                        lun.command_state = CommandState::WaitForClear;
                    }
                    // The host clears both halts after the reset; if
                    // neither endpoint was halted there is nothing to
                    // wait for.
                    if state.endpoint_state.is_empty() {
                        state.ready_after_clear(actions);
                    }
                });
                Ok(None)
            }
            class_request::GET_MAX_LUN => {
                let state = self.shared.state.lock();
                if state.luns.is_empty() {
                    return Err(TransportError::Stall);
                }
                Ok(Some(vec![(state.luns.len() - 1) as u8]))
            }
            _ => {
                tracing::debug!(request, "unsupported class request");
                Err(TransportError::Stall)
            }
        }
    }

    /// The host cleared an endpoint halt.
    pub fn endpoint_cleared(&self, direction: Direction) {
        self.run(|state, actions, _| {
            let flag = match direction {
                Direction::In => EndpointState::BULK_IN_HALTED,
                Direction::Out => EndpointState::BULK_OUT_HALTED,
            };
            state.endpoint_state.remove(flag);
            let waiting = state
                .luns
                .iter()
                .any(|lun| lun.command_state == CommandState::WaitForClear);
            if waiting && state.endpoint_state.is_empty() {
                tracing::debug!("both endpoints cleared, resuming");
                state.ready_after_clear(actions);
            }
        });
    }

    /// An IN transfer submitted via [`Transport::submit_in`] finished.
    pub fn bulk_in_complete(&self) {
        self.run(|state, actions, shared| {
            if state.orphan_status {
                state.orphan_status = false;
                state.arm_cbw(actions);
                return;
            }
            let Some(lun_idx) = state.cmd_lun else {
                tracing::debug!("stale IN completion with no command in flight");
                return;
            };
            let mut exec = Exec {
                state,
                actions,
                shared,
                lun: lun_idx,
            };
            match exec.lun().command_state {
                CommandState::Status => {
                    exec.lun_mut().command_state = CommandState::Ready;
                    exec.state.cmd_lun = None;
                    exec.state.arm_cbw(exec.actions);
                }
                CommandState::Query => {
                    let sent = exec.lun().inflight_in_bytes;
                    let lun = exec.lun_mut();
                    lun.data_transferred_bytes += sent;
                    lun.inflight_in_bytes = 0;
                    exec.send_csw_auto();
                }
                CommandState::DataInRead => read::send_complete(&mut exec),
                CommandState::WaitForReset | CommandState::WaitForClear => {}
                other => {
                    tracing::warn!(state = ?other, "IN completion in unexpected state");
                    exec.state.protocol_fatal(exec.actions);
                }
            }
        });
    }

    /// An OUT receive armed via [`Transport::submit_out`] finished,
    /// handing ownership of the received bytes to the core.
    pub fn bulk_out_complete(&self, data: TransferData) {
        self.run(|state, actions, shared| {
            if !state.configured {
                return;
            }
            if let Some(lun_idx) = state.cmd_lun {
                let cmd_state = state.luns[lun_idx].command_state;
                if matches!(
                    cmd_state,
                    CommandState::DataOutWrite | CommandState::DataOutWriteError
                ) {
                    let mut exec = Exec {
                        state,
                        actions,
                        shared,
                        lun: lun_idx,
                    };
                    write::receive_complete(&mut exec, data);
                    return;
                }
                if matches!(
                    cmd_state,
                    CommandState::WaitForReset | CommandState::WaitForClear
                ) {
                    return;
                }
            }
            if state.cbw_armed {
                state.cbw_armed = false;
                Self::cbw_received(state, actions, shared, data);
            } else {
                tracing::warn!(len = data.len(), "unexpected OUT data");
                state.protocol_fatal(actions);
            }
        });
    }

    /// An unrecoverable transfer error on a bulk endpoint.
    pub fn bulk_error(&self, direction: Direction) {
        tracing::warn!(?direction, "bulk transfer error");
        self.run(|state, actions, _| state.protocol_fatal(actions));
    }

    /// A block read submitted by the read pipeline finished.
    pub fn block_read_complete(&self, lun: u8, result: Result<PooledBuffer, BlockError>) {
        self.run(|state, actions, shared| {
            let lun = lun as usize;
            if lun >= state.luns.len()
                || state.luns[lun].command_state != CommandState::DataInRead
            {
                tracing::debug!(lun, "stale block read completion");
                return;
            }
            let mut exec = Exec {
                state,
                actions,
                shared,
                lun,
            };
            read::read_complete(&mut exec, result);
        });
    }

    /// A block write submitted by the write pipeline finished.
    pub fn block_write_complete(&self, lun: u8, result: Result<(), BlockError>) {
        self.run(|state, actions, shared| {
            let lun = lun as usize;
            if lun >= state.luns.len()
                || !matches!(
                    state.luns[lun].command_state,
                    CommandState::DataOutWrite | CommandState::DataOutWriteError
                )
            {
                tracing::debug!(lun, "stale block write completion");
                return;
            }
            let mut exec = Exec {
                state,
                actions,
                shared,
                lun,
            };
            write::write_complete(&mut exec, result);
        });
    }

    /// Validates a received CBW and dispatches the command. A malformed
    /// wrapper is fatal to the session; a well-formed CBW addressing an
    /// out-of-range LUN is answered with a phase-error CSW.
    fn cbw_received(
        state: &mut MscState,
        actions: &mut Vec<Action>,
        shared: &MscShared,
        data: TransferData,
    ) {
        let bytes = data.as_slice();
        let Ok(cbw) = CommandBlockWrapper::read_from_bytes(bytes) else {
            tracing::warn!(len = bytes.len(), "short CBW");
            state.protocol_fatal(actions);
            return;
        };
        if cbw.signature.get() != CBW_SIGNATURE {
            tracing::warn!(signature = cbw.signature.get(), "bad CBW signature");
            state.protocol_fatal(actions);
            return;
        }
        let lun_idx = cbw.lun() as usize;
        if lun_idx >= state.luns.len() || !state.luns[lun_idx].connected {
            tracing::warn!(lun = lun_idx, "CBW addressed an invalid LUN");
            let csw = CommandStatusWrapper::new(
                &cbw,
                cbw.data_transfer_length.get(),
                CswStatus::PHASE_ERROR,
            );
            state.orphan_status = true;
            actions.push(Action::SubmitIn(csw.as_bytes().to_vec().into()));
            return;
        }

        let lun = &mut state.luns[lun_idx];
        lun.command = cbw;
        lun.command_status = CswStatus::PASSED;
        lun.io_state = IoState::empty();
        lun.lba = 0;
        lun.blocks_remaining = 0;
        lun.transfer_length_bytes = 0;
        lun.data_transferred_bytes = 0;
        lun.inflight_in_bytes = 0;
        lun.inflight_write_bytes = 0;
        lun.finished_read = None;
        lun.finished_recv = None;
        state.cmd_lun = Some(lun_idx);

        let mut exec = Exec {
            state,
            actions,
            shared,
            lun: lun_idx,
        };
        dispatch::dispatch(&mut exec);
    }
}
