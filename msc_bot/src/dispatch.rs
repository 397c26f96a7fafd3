// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! SCSI command dispatch.
//!
//! Commands route through a data-driven table mapping the operation code
//! to a handler and a device-check policy; the policy decides what
//! happens when the addressed LUN has no usable media before the handler
//! is ever invoked. Opcodes outside the table take the vendor-specific
//! path: a blocked control-plane consumer may claim them, otherwise they
//! fail with Invalid Command sense.

use crate::read;
use crate::write;
use crate::CommandState;
use crate::Exec;
use crate::MediaState;
use msc_defs::AdditionalSenseCode;
use msc_defs::CdbInquiry;
use msc_defs::CdbMediumRemoval;
use msc_defs::CdbModeSense;
use msc_defs::CdbModeSense10;
use msc_defs::CdbRequestSense;
use msc_defs::CdbStartStop;
use msc_defs::CswStatus;
use msc_defs::FormatCapacityDescriptor;
use msc_defs::FormatCapacityListHeader;
use msc_defs::InquiryData;
use msc_defs::ModeParameterHeader;
use msc_defs::ModeParameterHeader10;
use msc_defs::ReadCapacityData;
use msc_defs::ScsiOp;
use msc_defs::SenseData;
use msc_defs::SenseKey;
use msc_defs::DIRECT_ACCESS_DEVICE;
use msc_defs::FORMAT_CAPACITY_FORMATTED;
use msc_defs::INQUIRY_REMOVABLE_MEDIA;
use msc_defs::MODE_CONTROL_CURRENT_VALUES;
use msc_defs::MODE_DSP_WRITE_PROTECT;
use msc_defs::SCSI_SENSEQ_MEDIUM_REMOVAL_PREVENTED;
use msc_defs::START_STOP_LOEJ;
use msc_defs::START_STOP_START;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// What to do when the addressed LUN has no usable media.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum DeviceCheck {
    /// Run the handler regardless.
    None,
    /// Fail the command with a CSW and no data phase.
    FailIfAbsent,
    /// Answer the device-to-host data phase with a zero-length packet,
    /// then fail the CSW.
    ZlpIfAbsent,
}

struct CommandEntry {
    op: ScsiOp,
    name: &'static str,
    check: DeviceCheck,
    handler: fn(&mut Exec<'_>),
}

static COMMANDS: &[CommandEntry] = &[
    CommandEntry {
        op: ScsiOp::TEST_UNIT_READY,
        name: "test unit ready",
        check: DeviceCheck::FailIfAbsent,
        handler: handle_test_unit_ready,
    },
    CommandEntry {
        op: ScsiOp::REQUEST_SENSE,
        name: "request sense",
        check: DeviceCheck::None,
        handler: handle_request_sense,
    },
    CommandEntry {
        op: ScsiOp::INQUIRY,
        name: "inquiry",
        check: DeviceCheck::None,
        handler: handle_inquiry,
    },
    CommandEntry {
        op: ScsiOp::MODE_SELECT,
        name: "mode select(6)",
        check: DeviceCheck::None,
        handler: handle_mode_select,
    },
    CommandEntry {
        op: ScsiOp::MODE_SENSE,
        name: "mode sense(6)",
        check: DeviceCheck::ZlpIfAbsent,
        handler: handle_mode_sense,
    },
    CommandEntry {
        op: ScsiOp::MODE_SENSE10,
        name: "mode sense(10)",
        check: DeviceCheck::ZlpIfAbsent,
        handler: handle_mode_sense,
    },
    CommandEntry {
        op: ScsiOp::START_STOP_UNIT,
        name: "start stop unit",
        check: DeviceCheck::None,
        handler: handle_start_stop,
    },
    CommandEntry {
        op: ScsiOp::MEDIUM_REMOVAL,
        name: "prevent allow medium removal",
        check: DeviceCheck::None,
        handler: handle_medium_removal,
    },
    CommandEntry {
        op: ScsiOp::READ_FORMATTED_CAPACITY,
        name: "read format capacities",
        check: DeviceCheck::ZlpIfAbsent,
        handler: handle_read_format_capacity,
    },
    CommandEntry {
        op: ScsiOp::READ_CAPACITY,
        name: "read capacity",
        check: DeviceCheck::ZlpIfAbsent,
        handler: handle_read_capacity,
    },
    CommandEntry {
        op: ScsiOp::READ,
        name: "read(10)",
        check: DeviceCheck::ZlpIfAbsent,
        handler: read::start,
    },
    CommandEntry {
        op: ScsiOp::WRITE,
        name: "write(10)",
        check: DeviceCheck::FailIfAbsent,
        handler: write::start,
    },
    CommandEntry {
        op: ScsiOp::VERIFY,
        name: "verify(10)",
        check: DeviceCheck::FailIfAbsent,
        handler: handle_verify,
    },
];

pub(crate) fn dispatch(exec: &mut Exec<'_>) {
    let op = exec.lun().command.scsiop();
    let Some(entry) = COMMANDS.iter().find(|entry| entry.op == op) else {
        dispatch_unknown(exec);
        return;
    };
    tracing::debug!(
        lun = exec.lun,
        op = ?op,
        name = entry.name,
        tag = exec.lun().command.tag.get(),
        transfer_length = exec.lun().command.data_transfer_length.get(),
        "scsi command"
    );
    if entry.check != DeviceCheck::None && !check_device(exec) {
        match entry.check {
            DeviceCheck::FailIfAbsent => exec.send_csw(CswStatus::FAILED),
            DeviceCheck::ZlpIfAbsent => {
                if exec.lun().command.data_transfer_length.get() == 0 {
                    exec.send_csw(CswStatus::FAILED);
                } else {
                    exec.start_zlp_query();
                }
            }
            DeviceCheck::None => unreachable!(),
        }
        return;
    }
    (entry.handler)(exec);
}

/// Verifies the LUN has usable, unchanged media, recording the proper
/// sense on failure. A pending media change is reported exactly once.
fn check_device(exec: &mut Exec<'_>) -> bool {
    let lun = exec.lun_mut();
    if !lun.media_present() || lun.backend.is_none() {
        lun.set_sense(
            SenseKey::NOT_READY,
            AdditionalSenseCode::NO_MEDIA_IN_DEVICE,
            0x00,
        );
        return false;
    }
    if lun.media_state.contains(MediaState::CHANGE_ON) {
        lun.media_state.remove(MediaState::CHANGE_ON);
        lun.set_sense(
            SenseKey::UNIT_ATTENTION,
            AdditionalSenseCode::MEDIUM_CHANGED,
            0x00,
        );
        return false;
    }
    true
}

/// Vendor-specific path: park the CDB for a blocked control-plane
/// consumer, or fail with Invalid Command when nobody is listening.
fn dispatch_unknown(exec: &mut Exec<'_>) {
    let op = exec.lun().command.scsiop();
    if exec.state.vendor_waiters > 0 {
        tracing::debug!(lun = exec.lun, op = ?op, "queueing vendor-specific command");
        let cdb = exec.lun().command.cdb;
        let lun = exec.lun_mut();
        lun.unknown_cdb = Some(cdb);
        // Parked until the consumer acknowledges it; the Query state
        // holds the pipeline with nothing in flight on the bus.
        lun.command_state = CommandState::Query;
        return;
    }
    tracing::debug!(lun = exec.lun, op = ?op, "unsupported command");
    exec.lun_mut().set_sense(
        SenseKey::ILLEGAL_REQUEST,
        AdditionalSenseCode::ILLEGAL_COMMAND,
        0x00,
    );
    respond_without_data(exec);
}

/// Closes the current command without supplying any data of our own,
/// while honoring whatever data phase the CBW promised the host: a
/// zero-length packet for device-to-host phases, a drain for
/// host-to-device phases, or the bare CSW.
pub(crate) fn respond_without_data(exec: &mut Exec<'_>) {
    let cbw = &exec.lun().command;
    if cbw.data_transfer_length.get() == 0 {
        exec.send_csw_auto();
    } else if cbw.is_data_in() {
        exec.start_zlp_query();
    } else {
        write::start_drain(exec);
    }
}

fn handle_test_unit_ready(exec: &mut Exec<'_>) {
    exec.send_csw(CswStatus::PASSED);
}

fn handle_request_sense(exec: &mut Exec<'_>) {
    let cdb = CdbRequestSense::read_from_prefix(&exec.lun().command.cdb[..])
        .unwrap()
        .0;
    let sense = exec.lun_mut().sense.take().unwrap_or(SenseData::new(
        SenseKey::NO_SENSE,
        AdditionalSenseCode::NO_SENSE,
        0x00,
    ));
    let mut data = sense.as_bytes().to_vec();
    data.truncate(cdb.allocation_length as usize);
    // Reading the sense also clears it; the CSW for REQUEST SENSE itself
    // reports success.
    exec.lun_mut().command_status = CswStatus::PASSED;
    exec.start_query(data);
}

fn handle_inquiry(exec: &mut Exec<'_>) {
    let cdb = CdbInquiry::read_from_prefix(&exec.lun().command.cdb[..])
        .unwrap()
        .0;
    let inquiry = InquiryData {
        device_type: DIRECT_ACCESS_DEVICE,
        removable_media: INQUIRY_REMOVABLE_MEDIA,
        versions: 0x00,
        response_data_format: 0x01,
        additional_length: (size_of::<InquiryData>() - 5) as u8,
        reserved: [0; 3],
        vendor_id: *b"Msft    ",
        product_id: *b"USB Storage     ",
        product_revision: *b"1.0 ",
    };
    let mut data = inquiry.as_bytes().to_vec();
    data.truncate(cdb.allocation_length.get() as usize);
    exec.start_query(data);
}

fn handle_mode_select(exec: &mut Exec<'_>) {
    // The parameter list is accepted and discarded.
    if exec.lun().command.data_transfer_length.get() != 0 && !exec.lun().command.is_data_in() {
        write::start_drain(exec);
    } else {
        exec.send_csw(CswStatus::PASSED);
    }
}

fn handle_mode_sense(exec: &mut Exec<'_>) {
    let is_mode_sense_10 = exec.lun().command.scsiop() == ScsiOp::MODE_SENSE10;
    let page_control;
    let allocation_length;
    if is_mode_sense_10 {
        let cdb = CdbModeSense10::read_from_prefix(&exec.lun().command.cdb[..])
            .unwrap()
            .0;
        page_control = cdb.page & 0xC0;
        allocation_length = cdb.allocation_length.get() as usize;
    } else {
        let cdb = CdbModeSense::read_from_prefix(&exec.lun().command.cdb[..])
            .unwrap()
            .0;
        page_control = cdb.page & 0xC0;
        allocation_length = cdb.allocation_length as usize;
    }

    if page_control != MODE_CONTROL_CURRENT_VALUES {
        tracing::debug!(page_control, "unsupported mode sense page control");
        exec.lun_mut().set_sense(
            SenseKey::ILLEGAL_REQUEST,
            AdditionalSenseCode::INVALID_CDB,
            0x00,
        );
        exec.start_zlp_query();
        return;
    }

    let mut dsp = 0;
    if exec.lun().media_state.contains(MediaState::WRITE_PROTECTED) {
        dsp |= MODE_DSP_WRITE_PROTECT;
    }

    // Minimal response: a bare header, no block descriptors, no pages.
    let mut data = if is_mode_sense_10 {
        let header = ModeParameterHeader10 {
            mode_data_length: ((size_of::<ModeParameterHeader10>() - 2) as u16).into(),
            device_specific_parameter: dsp,
            ..FromZeros::new_zeroed()
        };
        header.as_bytes().to_vec()
    } else {
        let header = ModeParameterHeader {
            mode_data_length: (size_of::<ModeParameterHeader>() - 1) as u8,
            device_specific_parameter: dsp,
            ..FromZeros::new_zeroed()
        };
        header.as_bytes().to_vec()
    };
    data.truncate(allocation_length);
    exec.start_query(data);
}

fn handle_start_stop(exec: &mut Exec<'_>) {
    let cdb = CdbStartStop::read_from_prefix(&exec.lun().command.cdb[..])
        .unwrap()
        .0;
    let load_eject = cdb.flag & START_STOP_LOEJ != 0;
    let start = cdb.flag & START_STOP_START != 0;
    if load_eject {
        if !start {
            if exec.lun().media_state.contains(MediaState::PREVENT_REMOVAL) {
                exec.lun_mut().set_sense(
                    SenseKey::ILLEGAL_REQUEST,
                    AdditionalSenseCode::MEDIUM_REMOVAL_PREVENTED,
                    SCSI_SENSEQ_MEDIUM_REMOVAL_PREVENTED,
                );
                exec.send_csw_auto();
                return;
            }
            tracing::info!(lun = exec.lun, "media ejected");
            exec.lun_mut().media_state.insert(MediaState::EJECTED);
            exec.actions.push(crate::Action::Hotplug(false));
        } else {
            if exec.lun().backend.is_none() {
                exec.lun_mut().set_sense(
                    SenseKey::NOT_READY,
                    AdditionalSenseCode::NO_MEDIA_IN_DEVICE,
                    0x00,
                );
                exec.send_csw_auto();
                return;
            }
            tracing::info!(lun = exec.lun, "media loaded");
            let lun = exec.lun_mut();
            lun.media_state.remove(MediaState::EJECTED);
            lun.media_state
                .insert(MediaState::INSERTED | MediaState::CHANGE_ON);
            exec.actions.push(crate::Action::Hotplug(true));
        }
    }
    exec.send_csw(CswStatus::PASSED);
}

fn handle_medium_removal(exec: &mut Exec<'_>) {
    let cdb = CdbMediumRemoval::read_from_prefix(&exec.lun().command.cdb[..])
        .unwrap()
        .0;
    let lun = exec.lun_mut();
    if cdb.prevent & 0x01 != 0 {
        lun.media_state.insert(MediaState::PREVENT_REMOVAL);
    } else {
        lun.media_state.remove(MediaState::PREVENT_REMOVAL);
    }
    exec.send_csw(CswStatus::PASSED);
}

fn handle_read_format_capacity(exec: &mut Exec<'_>) {
    let lun = exec.lun();
    let header = FormatCapacityListHeader {
        reserved: [0; 3],
        capacity_list_length: size_of::<FormatCapacityDescriptor>() as u8,
    };
    // The block length always reflects the bound device's real block
    // size, even for the maximum-capacity descriptor.
    let descriptor = FormatCapacityDescriptor {
        number_of_blocks: lun.capacity_blocks.into(),
        descriptor_code: FORMAT_CAPACITY_FORMATTED,
        block_length: FormatCapacityDescriptor::block_length_from(lun.block_size),
    };
    let mut data = header.as_bytes().to_vec();
    data.extend_from_slice(descriptor.as_bytes());
    exec.start_query(data);
}

fn handle_read_capacity(exec: &mut Exec<'_>) {
    let lun = exec.lun();
    let data = ReadCapacityData {
        last_logical_block: (lun.capacity_blocks - 1).into(),
        bytes_per_block: lun.block_size.into(),
    };
    exec.start_query(data.as_bytes().to_vec());
}

fn handle_verify(exec: &mut Exec<'_>) {
    // Media is present per the device check; the data is not actually
    // verified.
    exec.send_csw(CswStatus::PASSED);
}
