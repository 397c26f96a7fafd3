// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire-format definitions for the USB Mass Storage Class Bulk-Only
//! Transport (BOT): command/status wrappers, class-specific control
//! requests, and the subset of SCSI (SPC/SBC/MMC) structures the
//! transparent command set carries inside a CBW.
//!
//! CBW/CSW fields are little-endian per the BOT specification; SCSI CDB
//! and response payload fields are big-endian per SAM/SBC.

#![forbid(unsafe_code)]

use core::fmt::Debug;
use open_enum::open_enum;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

type U16BE = zerocopy::byteorder::U16<zerocopy::byteorder::BigEndian>;
type U32BE = zerocopy::byteorder::U32<zerocopy::byteorder::BigEndian>;
type U32LE = zerocopy::byteorder::U32<zerocopy::byteorder::LittleEndian>;

/// dCBWSignature, "USBC".
pub const CBW_SIGNATURE: u32 = 0x43425355;
/// dCSWSignature, "USBS".
pub const CSW_SIGNATURE: u32 = 0x53425355;

/// bmCBWFlags bit 7: data phase is device-to-host.
pub const CBW_FLAG_DATA_IN: u8 = 0x80;

/// Mass Storage class-specific control requests.
pub mod class_request {
    /// Bulk-Only Mass Storage Reset (host-to-device, no data stage).
    pub const BULK_ONLY_RESET: u8 = 0xFF;
    /// Get Max LUN (device-to-host, one data byte).
    pub const GET_MAX_LUN: u8 = 0xFE;
}

/// Command Block Wrapper, the 31-byte frame carrying one SCSI command.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CommandBlockWrapper {
    pub signature: U32LE,
    pub tag: U32LE,
    pub data_transfer_length: U32LE,
    pub flags: u8,
    pub lun: u8,
    pub cdb_length: u8,
    pub cdb: [u8; CDB_LENGTH],
}

/// Length of a CBW on the wire.
pub const CBW_LENGTH: usize = size_of::<CommandBlockWrapper>();
/// Length of the CDB field within a CBW.
pub const CDB_LENGTH: usize = 16;

impl CommandBlockWrapper {
    /// Returns the addressed logical unit (low 4 bits of bCBWLUN).
    pub fn lun(&self) -> u8 {
        self.lun & 0x0F
    }

    /// Returns the valid CDB length (low 5 bits of bCBWCBLength).
    pub fn cdb_length(&self) -> u8 {
        self.cdb_length & 0x1F
    }

    /// Returns true if the data phase, if any, is device-to-host.
    pub fn is_data_in(&self) -> bool {
        self.flags & CBW_FLAG_DATA_IN != 0
    }

    /// Returns the SCSI operation code.
    pub fn scsiop(&self) -> ScsiOp {
        ScsiOp(self.cdb[0])
    }
}

/// Command Status Wrapper, the 13-byte frame closing every transaction.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CommandStatusWrapper {
    pub signature: U32LE,
    pub tag: U32LE,
    pub data_residue: U32LE,
    pub status: CswStatus,
}

/// Length of a CSW on the wire.
pub const CSW_LENGTH: usize = size_of::<CommandStatusWrapper>();

impl CommandStatusWrapper {
    /// Builds a CSW answering `cbw` with `residue` untransferred bytes.
    pub fn new(cbw: &CommandBlockWrapper, residue: u32, status: CswStatus) -> Self {
        CommandStatusWrapper {
            signature: CSW_SIGNATURE.into(),
            tag: cbw.tag,
            data_residue: residue.into(),
            status,
        }
    }
}

open_enum! {
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum CswStatus: u8 {
        PASSED = 0x00,
        FAILED = 0x01,
        PHASE_ERROR = 0x02,
    }
}

open_enum! {
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum ScsiOp: u8 {
        TEST_UNIT_READY = 0x00,
        REQUEST_SENSE = 0x03,
        INQUIRY = 0x12,
        MODE_SELECT = 0x15,
        MODE_SENSE = 0x1A,
        START_STOP_UNIT = 0x1B,
        MEDIUM_REMOVAL = 0x1E,
        READ_FORMATTED_CAPACITY = 0x23,
        READ_CAPACITY = 0x25,
        READ = 0x28,
        WRITE = 0x2A,
        VERIFY = 0x2F,
        MODE_SENSE10 = 0x5A,
    }
}

/// 10-byte CDB shared by READ(10), WRITE(10), and VERIFY(10).
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct Cdb10 {
    pub operation_code: ScsiOp,
    pub flags: u8,
    pub logical_block: U32BE,
    pub group: u8,
    pub transfer_blocks: U16BE,
    pub control: u8,
}

/// 6-byte CDB for INQUIRY.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CdbInquiry {
    pub operation_code: ScsiOp,
    pub flags: u8,
    pub page_code: u8,
    pub allocation_length: U16BE,
    pub control: u8,
}

/// 6-byte CDB for REQUEST SENSE.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CdbRequestSense {
    pub operation_code: ScsiOp,
    pub flags: u8,
    pub reserved: [u8; 2],
    pub allocation_length: u8,
    pub control: u8,
}

/// 6-byte CDB for MODE SENSE(6).
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CdbModeSense {
    pub operation_code: ScsiOp,
    pub flags: u8,
    pub page: u8,
    pub subpage: u8,
    pub allocation_length: u8,
    pub control: u8,
}

/// 10-byte CDB for MODE SENSE(10).
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CdbModeSense10 {
    pub operation_code: ScsiOp,
    pub flags: u8,
    pub page: u8,
    pub subpage: u8,
    pub reserved: [u8; 3],
    pub allocation_length: U16BE,
    pub control: u8,
}

/// Page-control field (bits 7:6 of the MODE SENSE page byte).
pub const MODE_CONTROL_CURRENT_VALUES: u8 = 0x00;
pub const MODE_CONTROL_CHANGEABLE_VALUES: u8 = 0x40;
pub const MODE_CONTROL_DEFAULT_VALUES: u8 = 0x80;
pub const MODE_CONTROL_SAVED_VALUES: u8 = 0xC0;

/// 6-byte CDB for START STOP UNIT.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CdbStartStop {
    pub operation_code: ScsiOp,
    pub immediate: u8,
    pub reserved: [u8; 2],
    pub flag: u8,
    pub control: u8,
}

/// START STOP UNIT flag byte: load/eject.
pub const START_STOP_LOEJ: u8 = 0x02;
/// START STOP UNIT flag byte: start.
pub const START_STOP_START: u8 = 0x01;

/// 6-byte CDB for PREVENT ALLOW MEDIUM REMOVAL.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct CdbMediumRemoval {
    pub operation_code: ScsiOp,
    pub reserved: [u8; 3],
    pub prevent: u8,
    pub control: u8,
}

/// Standard INQUIRY data, fixed 36-byte form.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct InquiryData {
    pub device_type: u8,
    pub removable_media: u8,
    pub versions: u8,
    pub response_data_format: u8,
    pub additional_length: u8,
    pub reserved: [u8; 3],
    pub vendor_id: [u8; 8],
    pub product_id: [u8; 16],
    pub product_revision: [u8; 4],
}

/// Peripheral device type: direct-access block device.
pub const DIRECT_ACCESS_DEVICE: u8 = 0x00;
/// RMB bit in [`InquiryData::removable_media`].
pub const INQUIRY_REMOVABLE_MEDIA: u8 = 0x80;

/// READ CAPACITY(10) response.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ReadCapacityData {
    pub last_logical_block: U32BE,
    pub bytes_per_block: U32BE,
}

/// READ FORMAT CAPACITIES list header.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct FormatCapacityListHeader {
    pub reserved: [u8; 3],
    pub capacity_list_length: u8,
}

/// READ FORMAT CAPACITIES current/maximum capacity descriptor.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct FormatCapacityDescriptor {
    pub number_of_blocks: U32BE,
    pub descriptor_code: u8,
    pub block_length: [u8; 3],
}

impl FormatCapacityDescriptor {
    /// Packs `block_size` into the 24-bit block length field.
    pub fn block_length_from(block_size: u32) -> [u8; 3] {
        let b = block_size.to_be_bytes();
        [b[1], b[2], b[3]]
    }
}

/// Descriptor code: formatted media, capacity is current.
pub const FORMAT_CAPACITY_FORMATTED: u8 = 0x02;
/// Descriptor code: no media present, capacity is maximum formattable.
pub const FORMAT_CAPACITY_NO_MEDIA: u8 = 0x03;

/// MODE SENSE(6) parameter header, no block descriptors.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ModeParameterHeader {
    pub mode_data_length: u8,
    pub medium_type: u8,
    pub device_specific_parameter: u8,
    pub block_descriptor_length: u8,
}

/// MODE SENSE(10) parameter header, no block descriptors.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct ModeParameterHeader10 {
    pub mode_data_length: U16BE,
    pub medium_type: u8,
    pub device_specific_parameter: u8,
    pub reserved: [u8; 2],
    pub block_descriptor_length: U16BE,
}

/// Device-specific parameter bit: medium is write protected.
pub const MODE_DSP_WRITE_PROTECT: u8 = 0x80;

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SenseDataHeader {
    pub error_code: SenseDataErrorCode,
    pub segment_number: u8,
    pub sense_key: SenseKey,
    pub information: [u8; 4],
    pub additional_sense_length: u8,
}

/// Fixed-format sense data, as returned by REQUEST SENSE.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct SenseData {
    pub header: SenseDataHeader,
    pub command_specific_information: [u8; 4],
    pub additional_sense_code: AdditionalSenseCode,
    pub additional_sense_code_qualifier: u8,
    pub field_replaceable_unit_code: u8,
    pub sense_key_specific: [u8; 3],
}

impl SenseData {
    pub const fn new(
        sense_key: SenseKey,
        additional_sense_code: AdditionalSenseCode,
        additional_sense_code_qualifier: u8,
    ) -> Self {
        SenseData {
            header: SenseDataHeader {
                error_code: SenseDataErrorCode::FIXED_CURRENT,
                segment_number: 0,
                sense_key,
                information: [0; 4],
                additional_sense_length: (size_of::<SenseData>() - size_of::<SenseDataHeader>())
                    as u8,
            },
            command_specific_information: [0; 4],
            additional_sense_code,
            additional_sense_code_qualifier,
            field_replaceable_unit_code: 0,
            sense_key_specific: [0; 3],
        }
    }
}

open_enum! {
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum SenseKey: u8 {
        NO_SENSE = 0x00,
        RECOVERED_ERROR = 0x01,
        NOT_READY = 0x02,
        MEDIUM_ERROR = 0x03,
        HARDWARE_ERROR = 0x04,
        ILLEGAL_REQUEST = 0x05,
        UNIT_ATTENTION = 0x06,
        DATA_PROTECT = 0x07,
        ABORTED_COMMAND = 0x0B,
    }
}

open_enum! {
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum SenseDataErrorCode: u8 {
        FIXED_CURRENT = 0x70,
        FIXED_DEFERRED = 0x71,
    }
}

open_enum! {
    #[derive(IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub enum AdditionalSenseCode: u8 {
        NO_SENSE = 0x00,
        WRITE_ERROR = 0x0C,
        UNRECOVERED_ERROR = 0x11,
        ILLEGAL_COMMAND = 0x20,
        ILLEGAL_BLOCK = 0x21,
        INVALID_CDB = 0x24,
        INVALID_LUN = 0x25,
        WRITE_PROTECT = 0x27,
        MEDIUM_CHANGED = 0x28,
        NO_MEDIA_IN_DEVICE = 0x3A,
        MEDIUM_REMOVAL_PREVENTED = 0x53,
        RESOURCE_FAILURE = 0x55,
    }
}

// SCSI_ADSENSE_WRITE_ERROR (0x0C) qualifiers
pub const SCSI_SENSEQ_WRITE_ERROR_REALLOCATION_FAILED: u8 = 0x02;

// SCSI_ADSENSE_MEDIUM_REMOVAL_PREVENTED (0x53) qualifiers
pub const SCSI_SENSEQ_MEDIUM_REMOVAL_PREVENTED: u8 = 0x02;
