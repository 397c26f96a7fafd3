// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Single-transaction command behavior: discovery commands, sense
//! reporting, media state, and CBW-level validation.

use super::test_helpers::cdb10;
use super::test_helpers::inquiry_cdb;
use super::test_helpers::mode_sense_cdb;
use super::test_helpers::TestHost;
use super::test_helpers::TestHotplug;
use crate::MscOptions;
use crate::TransportError;
use block_backend::ramdisk::RamBlockBackend;
use msc_defs::class_request;
use msc_defs::AdditionalSenseCode;
use msc_defs::CswStatus;
use msc_defs::InquiryData;
use msc_defs::ReadCapacityData;
use msc_defs::ScsiOp;
use msc_defs::SenseDataErrorCode;
use msc_defs::SenseKey;
use msc_defs::CBW_FLAG_DATA_IN;
use msc_defs::DIRECT_ACCESS_DEVICE;
use msc_defs::INQUIRY_REMOVABLE_MEDIA;
use msc_defs::MODE_DSP_WRITE_PROTECT;
use msc_defs::SCSI_SENSEQ_MEDIUM_REMOVAL_PREVENTED;
use parking_lot::Mutex;
use std::sync::Arc;
use zerocopy::FromBytes;

const EJECT: &[u8] = &[0x1B, 0x00, 0x00, 0x00, 0x02, 0x00];
const LOAD: &[u8] = &[0x1B, 0x00, 0x00, 0x00, 0x03, 0x00];

fn medium_removal(prevent: u8) -> Vec<u8> {
    vec![0x1E, 0x00, 0x00, 0x00, prevent, 0x00]
}

#[test]
fn inquiry_reports_removable_direct_access() {
    let mut host = TestHost::ready(64);
    let tag = host.send_command(CBW_FLAG_DATA_IN, 36, &inquiry_cdb(36));
    let data = host.expect_in();
    let inquiry = InquiryData::read_from_bytes(&data).unwrap();
    assert_eq!(inquiry.device_type, DIRECT_ACCESS_DEVICE);
    assert_eq!(inquiry.removable_media, INQUIRY_REMOVABLE_MEDIA);
    assert_eq!(&inquiry.vendor_id, b"Msft    ");
    host.expect_csw(tag, 0, CswStatus::PASSED);
}

#[test]
fn inquiry_truncates_and_reports_residue() {
    let mut host = TestHost::ready(64);
    let tag = host.send_command(CBW_FLAG_DATA_IN, 255, &inquiry_cdb(24));
    let data = host.expect_in();
    assert_eq!(data.len(), 24);
    host.expect_csw(tag, 255 - 24, CswStatus::PASSED);
}

#[test]
fn unit_attention_reported_once_after_mount() {
    let mut host = TestHost::new(64);
    let tag = host.test_unit_ready();
    host.expect_csw(tag, 0, CswStatus::FAILED);
    host.expect_sense(SenseKey::UNIT_ATTENTION, AdditionalSenseCode::MEDIUM_CHANGED);
    let tag = host.test_unit_ready();
    host.expect_csw(tag, 0, CswStatus::PASSED);
}

#[test]
fn request_sense_without_error_reports_no_sense() {
    let mut host = TestHost::ready(64);
    let sense = host.request_sense();
    assert_eq!(sense.header.error_code, SenseDataErrorCode::FIXED_CURRENT);
    assert_eq!(sense.header.sense_key, SenseKey::NO_SENSE);
    assert_eq!(sense.additional_sense_code, AdditionalSenseCode::NO_SENSE);
    assert_eq!(sense.header.additional_sense_length, 10);
}

#[test]
fn request_sense_clears_recorded_sense() {
    let mut host = TestHost::ready(64);
    let tag = host.read10(60, 8);
    assert!(host.expect_in().is_empty());
    host.expect_csw(tag, 8 * 512, CswStatus::FAILED);
    host.expect_sense(SenseKey::ILLEGAL_REQUEST, AdditionalSenseCode::ILLEGAL_BLOCK);
    host.expect_sense(SenseKey::NO_SENSE, AdditionalSenseCode::NO_SENSE);
}

#[test]
fn read_capacity_reports_last_block() {
    let mut host = TestHost::ready(64);
    let mut cdb = vec![0u8; 10];
    cdb[0] = ScsiOp::READ_CAPACITY.0;
    let tag = host.send_command(CBW_FLAG_DATA_IN, 8, &cdb);
    let data = host.expect_in();
    let capacity = ReadCapacityData::read_from_bytes(&data).unwrap();
    assert_eq!(capacity.last_logical_block.get(), 63);
    assert_eq!(capacity.bytes_per_block.get(), 512);
    host.expect_csw(tag, 0, CswStatus::PASSED);
}

#[test]
fn read_format_capacities_reports_current_geometry() {
    let mut host = TestHost::ready(64);
    let mut cdb = vec![0u8; 10];
    cdb[0] = ScsiOp::READ_FORMATTED_CAPACITY.0;
    cdb[8] = 12;
    let tag = host.send_command(CBW_FLAG_DATA_IN, 12, &cdb);
    let data = host.expect_in();
    assert_eq!(
        data,
        [
            0x00, 0x00, 0x00, 0x08, // list header
            0x00, 0x00, 0x00, 0x40, // 64 blocks
            0x02, // formatted media
            0x00, 0x02, 0x00, // 512-byte blocks
        ]
    );
    host.expect_csw(tag, 0, CswStatus::PASSED);
}

#[test]
fn mode_sense_reports_write_protect() {
    let mut host = TestHost::new_write_protected(64);
    host.clear_unit_attention();
    let tag = host.send_command(CBW_FLAG_DATA_IN, 4, &mode_sense_cdb(0x3F, 4));
    let data = host.expect_in();
    assert_eq!(data, [3, 0, MODE_DSP_WRITE_PROTECT, 0]);
    host.expect_csw(tag, 0, CswStatus::PASSED);
}

#[test]
fn mode_sense_rejects_saved_page_control() {
    let mut host = TestHost::ready(64);
    // Page-control "saved values" in the top bits of the page byte.
    let tag = host.send_command(CBW_FLAG_DATA_IN, 4, &mode_sense_cdb(0xC0 | 0x3F, 4));
    assert!(host.expect_in().is_empty());
    host.expect_csw(tag, 4, CswStatus::FAILED);
    host.expect_sense(SenseKey::ILLEGAL_REQUEST, AdditionalSenseCode::INVALID_CDB);
}

#[test]
fn zero_block_transfers_pass_without_data_phase() {
    let mut host = TestHost::ready(64);
    let tag = host.read10(5, 0);
    host.expect_csw(tag, 0, CswStatus::PASSED);
    let tag = host.write10(5, 0);
    host.expect_csw(tag, 0, CswStatus::PASSED);
    assert_eq!(host.transport.pending_in(), 0);
}

#[test]
fn read_beyond_capacity_fails_with_illegal_block() {
    let mut host = TestHost::ready(64);
    let tag = host.read10(63, 2);
    assert!(host.expect_in().is_empty());
    host.expect_csw(tag, 2 * 512, CswStatus::FAILED);
    host.expect_sense(SenseKey::ILLEGAL_REQUEST, AdditionalSenseCode::ILLEGAL_BLOCK);
    assert_eq!(host.disk.pending_completions(), 0);
}

#[test]
fn write_beyond_capacity_drains_host_data() {
    let mut host = TestHost::ready(64);
    let tag = host.write10(63, 2);
    let armed = host.send_out(vec![0; 1024]);
    assert_eq!(armed, 1024);
    host.expect_csw(tag, 0, CswStatus::FAILED);
    host.expect_sense(SenseKey::ILLEGAL_REQUEST, AdditionalSenseCode::ILLEGAL_BLOCK);
    assert_eq!(host.disk.pending_completions(), 0);
}

#[test]
fn transfer_byte_count_overflow_fails_with_invalid_cdb() {
    // 65535 blocks of 128 KiB does not fit the 32-bit byte count.
    let options = MscOptions {
        transfer_buffer_len: 128 * 1024,
        ..Default::default()
    };
    let disk = Arc::new(RamBlockBackend::new(4, 128 * 1024, false).unwrap());
    let mut host = TestHost::build(disk, options);
    host.clear_unit_attention();

    let tag = host.send_command(CBW_FLAG_DATA_IN, 512, &cdb10(ScsiOp::READ, 0, 65535));
    assert!(host.expect_in().is_empty());
    host.expect_csw(tag, 512, CswStatus::FAILED);
    host.expect_sense(SenseKey::ILLEGAL_REQUEST, AdditionalSenseCode::INVALID_CDB);
    assert_eq!(host.disk.pending_completions(), 0);

    let tag = host.send_command(0, 512, &cdb10(ScsiOp::WRITE, 0, 65535));
    assert_eq!(host.send_out(vec![0; 512]), 512);
    host.expect_csw(tag, 0, CswStatus::FAILED);
    host.expect_sense(SenseKey::ILLEGAL_REQUEST, AdditionalSenseCode::INVALID_CDB);
    assert_eq!(host.disk.pending_completions(), 0);
}

#[test]
fn write_then_read_round_trip() {
    let mut host = TestHost::ready(64);

    let tag = host.write10(3, 4);
    let armed = host.send_out(vec![0xAA; 2048]);
    assert_eq!(armed, 2048);
    host.pump_disk();
    host.expect_csw(tag, 0, CswStatus::PASSED);
    assert_eq!(host.disk.peek(3, 2048), vec![0xAA; 2048]);

    let tag = host.read10(3, 4);
    host.pump_disk_one();
    let data = host.expect_in();
    assert_eq!(data, vec![0xAA; 2048]);
    host.expect_csw(tag, 0, CswStatus::PASSED);
}

#[test]
fn ejected_media_fails_read_with_zlp() {
    let mut host = TestHost::ready(64);
    let tag = host.send_command(0, 0, EJECT);
    host.expect_csw(tag, 0, CswStatus::PASSED);

    let tag = host.read10(0, 2);
    assert!(host.expect_in().is_empty());
    host.expect_csw(tag, 2 * 512, CswStatus::FAILED);
    host.expect_sense(SenseKey::NOT_READY, AdditionalSenseCode::NO_MEDIA_IN_DEVICE);
}

#[test]
fn eject_and_load_signal_hotplug_and_unit_attention() {
    let events = Arc::new(Mutex::new(Vec::new()));
    let options = MscOptions {
        hotplug: Some(Box::new(TestHotplug {
            events: events.clone(),
        })),
        ..Default::default()
    };
    let disk = Arc::new(RamBlockBackend::new(64, 512, false).unwrap());
    let mut host = TestHost::build(disk, options);
    host.clear_unit_attention();
    assert_eq!(*events.lock(), [true]);

    let tag = host.send_command(0, 0, EJECT);
    host.expect_csw(tag, 0, CswStatus::PASSED);
    assert_eq!(*events.lock(), [true, false]);

    let tag = host.send_command(0, 0, LOAD);
    host.expect_csw(tag, 0, CswStatus::PASSED);
    assert_eq!(*events.lock(), [true, false, true]);

    // Reloading the media raises a fresh unit attention.
    let tag = host.test_unit_ready();
    host.expect_csw(tag, 0, CswStatus::FAILED);
    host.expect_sense(SenseKey::UNIT_ATTENTION, AdditionalSenseCode::MEDIUM_CHANGED);
    let tag = host.test_unit_ready();
    host.expect_csw(tag, 0, CswStatus::PASSED);
}

#[test]
fn prevent_removal_blocks_eject() {
    let mut host = TestHost::ready(64);
    let tag = host.send_command(0, 0, &medium_removal(1));
    host.expect_csw(tag, 0, CswStatus::PASSED);

    let tag = host.send_command(0, 0, EJECT);
    host.expect_csw(tag, 0, CswStatus::FAILED);
    let sense = host.request_sense();
    assert_eq!(sense.header.sense_key, SenseKey::ILLEGAL_REQUEST);
    assert_eq!(
        sense.additional_sense_code,
        AdditionalSenseCode::MEDIUM_REMOVAL_PREVENTED
    );
    assert_eq!(
        sense.additional_sense_code_qualifier,
        SCSI_SENSEQ_MEDIUM_REMOVAL_PREVENTED
    );

    let tag = host.send_command(0, 0, &medium_removal(0));
    host.expect_csw(tag, 0, CswStatus::PASSED);
    let tag = host.send_command(0, 0, EJECT);
    host.expect_csw(tag, 0, CswStatus::PASSED);
}

#[test]
fn write_protected_media_rejects_write() {
    let mut host = TestHost::new_write_protected(64);
    host.clear_unit_attention();
    let tag = host.write10(0, 2);
    host.send_out(vec![0x55; 1024]);
    host.expect_csw(tag, 0, CswStatus::FAILED);
    host.expect_sense(SenseKey::DATA_PROTECT, AdditionalSenseCode::WRITE_PROTECT);
    assert_eq!(host.disk.pending_completions(), 0);
    assert_eq!(host.disk.peek(0, 1024), vec![0; 1024]);
}

#[test]
fn unsupported_command_fails_with_illegal_command() {
    let mut host = TestHost::ready(64);
    let tag = host.send_command(0, 0, &[0xC6, 0, 0, 0, 0, 0]);
    host.expect_csw(tag, 0, CswStatus::FAILED);
    host.expect_sense(SenseKey::ILLEGAL_REQUEST, AdditionalSenseCode::ILLEGAL_COMMAND);

    // With a device-to-host data phase promised, a ZLP precedes the CSW.
    let tag = host.send_command(CBW_FLAG_DATA_IN, 64, &[0xC6, 0, 0, 0, 0, 0]);
    assert!(host.expect_in().is_empty());
    host.expect_csw(tag, 64, CswStatus::FAILED);
}

#[test]
fn verify_passes_with_media_present() {
    let mut host = TestHost::ready(64);
    let tag = host.send_command(0, 0, &cdb10(ScsiOp::VERIFY, 0, 16));
    host.expect_csw(tag, 0, CswStatus::PASSED);
}

#[test]
fn mode_select_discards_parameter_list() {
    let mut host = TestHost::ready(64);
    let tag = host.send_command(0, 12, &[0x15, 0x10, 0, 0, 12, 0]);
    let armed = host.send_out(vec![0; 12]);
    assert_eq!(armed, 12);
    host.expect_csw(tag, 0, CswStatus::PASSED);
}

#[test]
fn get_max_lun_tracks_mounts() {
    let host = TestHost::ready(64);
    let data = host
        .ctx
        .class_request(class_request::GET_MAX_LUN, 0, 0)
        .unwrap();
    assert_eq!(data, Some(vec![0]));

    let disk2 = Arc::new(RamBlockBackend::new(32, 512, false).unwrap());
    assert_eq!(host.ctx.mount(disk2).unwrap(), 1);
    let data = host
        .ctx
        .class_request(class_request::GET_MAX_LUN, 0, 0)
        .unwrap();
    assert_eq!(data, Some(vec![1]));
}

#[test]
fn get_max_lun_stalls_without_luns() {
    let host = TestHost::ready(64);
    host.ctx.unmount().unwrap();
    assert!(matches!(
        host.ctx.class_request(class_request::GET_MAX_LUN, 0, 0),
        Err(TransportError::Stall)
    ));
    // Unknown class requests stall too.
    assert!(matches!(
        host.ctx.class_request(0x42, 0, 0),
        Err(TransportError::Stall)
    ));
}

#[test]
fn invalid_lun_answered_with_phase_error() {
    let mut host = TestHost::ready(64);
    let tag = host.send_command_lun(4, CBW_FLAG_DATA_IN, 512, &cdb10(ScsiOp::READ, 0, 1));
    host.expect_csw(tag, 512, CswStatus::PHASE_ERROR);

    // The session survives; the next command proceeds normally.
    let tag = host.test_unit_ready();
    host.expect_csw(tag, 0, CswStatus::PASSED);
}

#[test]
fn data_phase_disagreement_is_a_phase_error() {
    let mut host = TestHost::ready(64);

    // READ with a host-to-device data phase.
    let tag = host.send_command(0, 1024, &cdb10(ScsiOp::READ, 0, 2));
    host.expect_csw(tag, 1024, CswStatus::PHASE_ERROR);

    // WRITE with a device-to-host data phase.
    let tag = host.send_command(CBW_FLAG_DATA_IN, 1024, &cdb10(ScsiOp::WRITE, 0, 2));
    host.expect_csw(tag, 1024, CswStatus::PHASE_ERROR);

    // Transfer length that disagrees with the CDB block count.
    let tag = host.send_command(CBW_FLAG_DATA_IN, 512, &cdb10(ScsiOp::READ, 0, 2));
    host.expect_csw(tag, 512, CswStatus::PHASE_ERROR);
}

#[test]
fn commands_route_by_lun() {
    let mut host = TestHost::ready(64);
    let disk2 = Arc::new(RamBlockBackend::new(32, 512, false).unwrap());
    assert_eq!(host.ctx.mount(disk2).unwrap(), 1);

    host.lun = 1;
    host.clear_unit_attention();
    let mut cdb = vec![0u8; 10];
    cdb[0] = ScsiOp::READ_CAPACITY.0;
    let tag = host.send_command(CBW_FLAG_DATA_IN, 8, &cdb);
    let data = host.expect_in();
    let capacity = ReadCapacityData::read_from_bytes(&data).unwrap();
    assert_eq!(capacity.last_logical_block.get(), 31);
    host.expect_csw(tag, 0, CswStatus::PASSED);

    host.lun = 0;
    let tag = host.send_command(CBW_FLAG_DATA_IN, 8, &cdb);
    let data = host.expect_in();
    let capacity = ReadCapacityData::read_from_bytes(&data).unwrap();
    assert_eq!(capacity.last_logical_block.get(), 63);
    host.expect_csw(tag, 0, CswStatus::PASSED);
}

#[test]
fn pooled_buffers_return_after_transfer() {
    let mut host = TestHost::ready(64);
    let free = host.ctx.shared.pool.free_buffers();
    let tag = host.read10(0, 8);
    host.pump_disk_one();
    assert_eq!(host.expect_in().len(), 8 * 512);
    host.expect_csw(tag, 0, CswStatus::PASSED);
    assert_eq!(host.ctx.shared.pool.free_buffers(), free);
}
