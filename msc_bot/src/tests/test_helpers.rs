// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Test harness: an in-memory transport plus a host-side driver for the
//! function context. The harness plays the USB host, submitting CBWs and
//! collecting IN transfers, and decides when (and in what order) disk and
//! bus completions reach the core.

use crate::Direction;
use crate::HotplugSignal;
use crate::MscContext;
use crate::MscOptions;
use crate::Transport;
use crate::TransportError;
use block_backend::ramdisk::RamBlockBackend;
use block_backend::BlockCompletion;
use msc_defs::AdditionalSenseCode;
use msc_defs::Cdb10;
use msc_defs::CdbInquiry;
use msc_defs::CdbModeSense;
use msc_defs::CdbRequestSense;
use msc_defs::CommandBlockWrapper;
use msc_defs::CommandStatusWrapper;
use msc_defs::CswStatus;
use msc_defs::ScsiOp;
use msc_defs::SenseData;
use msc_defs::SenseKey;
use msc_defs::CBW_FLAG_DATA_IN;
use msc_defs::CBW_LENGTH;
use msc_defs::CBW_SIGNATURE;
use msc_defs::CSW_SIGNATURE;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use transfer_buffers::TransferData;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

pub const BLOCK_SIZE: u32 = 512;

#[derive(Default)]
struct TransportLog {
    in_transfers: VecDeque<Vec<u8>>,
    out_armed: VecDeque<usize>,
    in_halted: bool,
    out_halted: bool,
}

/// Records submissions instead of moving bytes; the test pulls them out
/// and answers with the matching completion events.
#[derive(Default)]
pub struct TestTransport {
    log: Mutex<TransportLog>,
}

impl TestTransport {
    pub fn pop_in(&self) -> Option<Vec<u8>> {
        self.log.lock().in_transfers.pop_front()
    }

    pub fn pop_out(&self) -> Option<usize> {
        self.log.lock().out_armed.pop_front()
    }

    pub fn pending_in(&self) -> usize {
        self.log.lock().in_transfers.len()
    }

    pub fn halted(&self, direction: Direction) -> bool {
        let log = self.log.lock();
        match direction {
            Direction::In => log.in_halted,
            Direction::Out => log.out_halted,
        }
    }

    /// Host-side Clear Feature; the test still reports it to the core via
    /// `endpoint_cleared`.
    pub fn clear_halt(&self, direction: Direction) {
        let mut log = self.log.lock();
        match direction {
            Direction::In => log.in_halted = false,
            Direction::Out => log.out_halted = false,
        }
    }
}

impl Transport for TestTransport {
    fn submit_in(&self, data: TransferData) -> Result<(), TransportError> {
        self.log
            .lock()
            .in_transfers
            .push_back(data.as_slice().to_vec());
        Ok(())
    }

    fn submit_out(&self, len: usize) -> Result<(), TransportError> {
        self.log.lock().out_armed.push_back(len);
        Ok(())
    }

    fn halt(&self, direction: Direction) {
        let mut log = self.log.lock();
        match direction {
            Direction::In => log.in_halted = true,
            Direction::Out => log.out_halted = true,
        }
    }
}

/// Hotplug recorder.
pub struct TestHotplug {
    pub events: Arc<Mutex<Vec<bool>>>,
}

impl HotplugSignal for TestHotplug {
    fn media_changed(&self, available: bool) {
        self.events.lock().push(available);
    }
}

/// A configured function with one RAM-backed LUN, driven from the host's
/// point of view.
pub struct TestHost {
    pub ctx: MscContext,
    pub transport: Arc<TestTransport>,
    pub disk: Arc<RamBlockBackend>,
    pub lun: u8,
    tag: u32,
}

impl TestHost {
    pub fn new(block_count: u64) -> Self {
        let disk = Arc::new(RamBlockBackend::new(block_count, BLOCK_SIZE, false).unwrap());
        Self::build(disk, MscOptions::default())
    }

    pub fn new_write_protected(block_count: u64) -> Self {
        let disk = Arc::new(RamBlockBackend::new(block_count, BLOCK_SIZE, true).unwrap());
        Self::build(disk, MscOptions::default())
    }

    pub fn with_options(block_count: u64, options: MscOptions) -> Self {
        let disk = Arc::new(RamBlockBackend::new(block_count, BLOCK_SIZE, false).unwrap());
        Self::build(disk, options)
    }

    /// A host that has already consumed the mount-time unit attention.
    pub fn ready(block_count: u64) -> Self {
        let mut host = Self::new(block_count);
        host.clear_unit_attention();
        host
    }

    pub fn ready_with_options(block_count: u64, options: MscOptions) -> Self {
        let mut host = Self::with_options(block_count, options);
        host.clear_unit_attention();
        host
    }

    pub fn build(disk: Arc<RamBlockBackend>, options: MscOptions) -> Self {
        let transport = Arc::new(TestTransport::default());
        let ctx = MscContext::new(transport.clone(), options);
        ctx.configured(true);
        ctx.mount(disk.clone()).unwrap();
        TestHost {
            ctx,
            transport,
            disk,
            lun: 0,
            tag: 0,
        }
    }

    /// Removable devices report a medium change on the first access after
    /// media arrives; real hosts retry after reading the sense.
    pub fn clear_unit_attention(&mut self) {
        let tag = self.test_unit_ready();
        self.expect_csw(tag, 0, CswStatus::FAILED);
        self.expect_sense(SenseKey::UNIT_ATTENTION, AdditionalSenseCode::MEDIUM_CHANGED);
    }

    /// Delivers a raw CBW, checking the core had a 31-byte receive armed.
    pub fn send_cbw_raw(&mut self, bytes: Vec<u8>) {
        assert_eq!(self.transport.pop_out(), Some(CBW_LENGTH));
        self.ctx.bulk_out_complete(bytes.into());
    }

    pub fn send_command_lun(
        &mut self,
        lun: u8,
        flags: u8,
        data_transfer_length: u32,
        cdb: &[u8],
    ) -> u32 {
        self.tag += 1;
        let mut cbw = CommandBlockWrapper::new_zeroed();
        cbw.signature = CBW_SIGNATURE.into();
        cbw.tag = self.tag.into();
        cbw.data_transfer_length = data_transfer_length.into();
        cbw.flags = flags;
        cbw.lun = lun;
        cbw.cdb_length = cdb.len() as u8;
        cbw.cdb[..cdb.len()].copy_from_slice(cdb);
        self.send_cbw_raw(cbw.as_bytes().to_vec());
        self.tag
    }

    pub fn send_command(&mut self, flags: u8, data_transfer_length: u32, cdb: &[u8]) -> u32 {
        self.send_command_lun(self.lun, flags, data_transfer_length, cdb)
    }

    pub fn test_unit_ready(&mut self) -> u32 {
        self.send_command(0, 0, &[0u8; 6])
    }

    pub fn read10(&mut self, lba: u32, blocks: u16) -> u32 {
        self.send_command(
            CBW_FLAG_DATA_IN,
            blocks as u32 * BLOCK_SIZE,
            &cdb10(ScsiOp::READ, lba, blocks),
        )
    }

    pub fn write10(&mut self, lba: u32, blocks: u16) -> u32 {
        self.send_command(0, blocks as u32 * BLOCK_SIZE, &cdb10(ScsiOp::WRITE, lba, blocks))
    }

    /// Takes the next IN transfer's payload and completes it.
    pub fn expect_in(&self) -> Vec<u8> {
        let data = self.transport.pop_in().expect("an IN transfer is pending");
        self.ctx.bulk_in_complete();
        data
    }

    pub fn expect_csw(&self, tag: u32, residue: u32, status: CswStatus) {
        let bytes = self.expect_in();
        let csw = CommandStatusWrapper::read_from_bytes(&bytes).unwrap();
        assert_eq!(csw.signature.get(), CSW_SIGNATURE);
        assert_eq!(csw.tag.get(), tag);
        assert_eq!(csw.data_residue.get(), residue);
        assert_eq!(csw.status, status);
    }

    /// Answers the armed OUT receive with `data`.
    pub fn send_out(&self, data: Vec<u8>) -> usize {
        let armed = self.transport.pop_out().expect("an OUT receive is armed");
        assert!(data.len() <= armed, "host sent more than armed ({armed})");
        self.ctx.bulk_out_complete(data.into());
        armed
    }

    /// Delivers one queued disk completion to the core.
    pub fn pump_disk_one(&self) {
        let completion = self.disk.pop_completion().expect("a disk completion is queued");
        self.deliver_disk(completion);
    }

    /// Delivers all queued disk completions in submission order.
    pub fn pump_disk(&self) {
        while let Some(completion) = self.disk.pop_completion() {
            self.deliver_disk(completion);
        }
    }

    fn deliver_disk(&self, completion: BlockCompletion) {
        match completion {
            BlockCompletion::Read { result, .. } => self.ctx.block_read_complete(self.lun, result),
            BlockCompletion::Write { result, .. } => {
                self.ctx.block_write_complete(self.lun, result)
            }
        }
    }

    /// Writes bytes straight into the RAM disk, bypassing the transport.
    pub fn seed(&self, lba: u64, data: Vec<u8>) {
        use block_backend::BlockBackend;
        self.disk
            .submit_write(lba, TransferData::Inline(data))
            .unwrap();
        let Some(BlockCompletion::Write { result, .. }) = self.disk.pop_completion() else {
            panic!("expected a write completion");
        };
        result.unwrap();
    }

    /// Runs a full REQUEST SENSE transaction and returns the sense data.
    pub fn request_sense(&mut self) -> SenseData {
        let cdb = CdbRequestSense {
            operation_code: ScsiOp::REQUEST_SENSE,
            flags: 0,
            reserved: [0; 2],
            allocation_length: size_of::<SenseData>() as u8,
            control: 0,
        };
        let tag = self.send_command(
            CBW_FLAG_DATA_IN,
            size_of::<SenseData>() as u32,
            cdb.as_bytes(),
        );
        let data = self.expect_in();
        self.expect_csw(tag, 0, CswStatus::PASSED);
        SenseData::read_from_bytes(&data).unwrap()
    }

    pub fn expect_sense(&mut self, key: SenseKey, asc: AdditionalSenseCode) {
        let sense = self.request_sense();
        assert_eq!(sense.header.sense_key, key);
        assert_eq!(sense.additional_sense_code, asc);
    }
}

pub fn cdb10(op: ScsiOp, lba: u32, blocks: u16) -> Vec<u8> {
    Cdb10 {
        operation_code: op,
        flags: 0,
        logical_block: lba.into(),
        group: 0,
        transfer_blocks: blocks.into(),
        control: 0,
    }
    .as_bytes()
    .to_vec()
}

pub fn inquiry_cdb(allocation_length: u16) -> Vec<u8> {
    CdbInquiry {
        operation_code: ScsiOp::INQUIRY,
        flags: 0,
        page_code: 0,
        allocation_length: allocation_length.into(),
        control: 0,
    }
    .as_bytes()
    .to_vec()
}

pub fn mode_sense_cdb(page: u8, allocation_length: u8) -> Vec<u8> {
    CdbModeSense {
        operation_code: ScsiOp::MODE_SENSE,
        flags: 0,
        page,
        subpage: 0,
        allocation_length,
        control: 0,
    }
    .as_bytes()
    .to_vec()
}
