//! ATA register definitions and hardware access traits.
//!
//! ## License
//!
//! Copyright (c) The Ember Firmware Authors.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use bitflags::bitflags;

/// Sector size in bytes. All transfers are made in sector units.
pub const ATA_SECTOR_SIZE: usize = 512;

/// Highest addressable sector with 28-bit LBA commands.
pub const ATA_MAX_LBA28: u64 = 0x0fff_ffff;

/// Maximum sector count of a single 28-bit LBA command. A count register
/// value of zero encodes this maximum.
pub const ATA_MAX_LBA28_SECTOR_COUNT: u64 = 0x100;

/// Maximum sector count of a single 48-bit LBA command.
pub const ATA_MAX_LBA48_SECTOR_COUNT: u64 = 0x1_0000;

/// Physical boundary a single DMA descriptor must not cross.
pub const ATA_DMA_BOUNDARY: u64 = 0x1_0000;

/// Device select register code for the master device.
pub const ATA_DEVICE_MASTER: u8 = 0xa0;

/// Device select register code for the slave device.
pub const ATA_DEVICE_SLAVE: u8 = 0xb0;

/// LBA addressing bit in the device select register.
pub const ATA_DRIVE_SELECT_LBA: u8 = 0x40;

/// Sentinel for "no device selected" in the per-channel selection cache.
pub const ATA_INVALID_SELECTION: u8 = 0xff;

/// Signature left in the LBA1/LBA2 registers by a packet (ATAPI) device
/// after a failed IDENTIFY.
pub const ATA_PATAPI_SIGNATURE: (u8, u8) = (0x14, 0xeb);

/// Signature left in the LBA1/LBA2 registers by a SATA device after a
/// failed IDENTIFY.
pub const ATA_SATA_SIGNATURE: (u8, u8) = (0x3c, 0xc3);

/// Command completion timeout in seconds.
pub const ATA_TIMEOUT_SECONDS: u64 = 10;

/// Device selection timeout in microseconds.
pub const ATA_SELECT_TIMEOUT_MICROSECONDS: u64 = 10_000;

/// Legacy I/O base ports for the primary channel.
pub const ATA_LEGACY_PRIMARY_IO_BASE: u16 = 0x1f0;
pub const ATA_LEGACY_PRIMARY_CONTROL_BASE: u16 = 0x3f6;

/// Legacy I/O base ports for the secondary channel.
pub const ATA_LEGACY_SECONDARY_IO_BASE: u16 = 0x170;
pub const ATA_LEGACY_SECONDARY_CONTROL_BASE: u16 = 0x376;

bitflags! {
    /// ATA status register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AtaStatus: u8 {
        const ERROR = 0x01;
        const DATA_REQUEST = 0x08;
        const FAULT = 0x20;
        const DRIVE_READY = 0x40;
        const BUSY = 0x80;
        /// Bits that indicate a failed command.
        const ERROR_MASK = Self::ERROR.bits() | Self::FAULT.bits();
        /// Bits consulted when deciding whether the device is mid-transfer.
        const BUSY_MASK = Self::BUSY.bits() | Self::DATA_REQUEST.bits();
    }
}

bitflags! {
    /// ATA device control register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AtaControl: u8 {
        const INTERRUPT_DISABLE = 0x02;
        const SOFTWARE_RESET = 0x04;
        /// Routes reads and writes of the count/LBA ports to the high-order
        /// bytes of the 48-bit LBA registers.
        const HIGH_ORDER = 0x80;
    }
}

bitflags! {
    /// IDE bus master command register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BusMasterCommand: u8 {
        const DMA_ENABLE = 0x01;
        const DMA_READ = 0x08;
    }
}

bitflags! {
    /// IDE bus master status register bits. Interrupt and error are
    /// write-one-to-clear.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BusMasterStatus: u8 {
        const ACTIVE = 0x01;
        const ERROR = 0x02;
        const INTERRUPT = 0x04;
    }
}

/// ATA registers, enumerated as offsets in a unified register space.
///
/// Values `0x00..=0x07` sit at `io_base + value`. The high-order LBA48
/// registers (`0x08..=0x0b`) alias the low count/LBA ports and are reached by
/// flipping [`AtaControl::HIGH_ORDER`] in the control register around the
/// access. Control lives at `control_base`, and the bus master registers at
/// `bus_master_base + 0/2/4`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u16)]
pub enum AtaRegister {
    Data = 0x00,
    Error = 0x01,
    SectorCountLow = 0x02,
    Lba0 = 0x03,
    Lba1 = 0x04,
    Lba2 = 0x05,
    DeviceSelect = 0x06,
    Command = 0x07,
    SectorCountHigh = 0x08,
    Lba3 = 0x09,
    Lba4 = 0x0a,
    Lba5 = 0x0b,
    Control = 0x0c,
    BusMasterCommand = 0x0e,
    BusMasterStatus = 0x10,
    BusMasterTable = 0x12,
}

impl AtaRegister {
    /// The features register shares a port with the error register.
    pub const FEATURES: AtaRegister = AtaRegister::Error;
    /// The status register shares a port with the command register.
    pub const STATUS: AtaRegister = AtaRegister::Command;
    /// Reading the control port returns the alternate status, which does not
    /// clear the device's interrupt latch.
    pub const ALTERNATE_STATUS: AtaRegister = AtaRegister::Control;
}

/// ATA command opcodes used by this driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AtaCommand {
    ReadPio28 = 0x20,
    ReadPio48 = 0x24,
    ReadDma48 = 0x25,
    WritePio28 = 0x30,
    WritePio48 = 0x34,
    WriteDma48 = 0x35,
    IdentifyPacket = 0xa1,
    ReadDma28 = 0xc8,
    WriteDma28 = 0xca,
    CacheFlush28 = 0xe7,
    Identify = 0xec,
}

/// Port-level hardware access. Implemented over real port I/O by the
/// platform, and over a simulated drive in tests.
pub trait AtaPortIo: Send + Sync {
    fn read_u8(&self, port: u16) -> u8;
    fn write_u8(&self, port: u16, value: u8);
    fn read_u16(&self, port: u16) -> u16;
    fn write_u16(&self, port: u16, value: u16);
    fn write_u32(&self, port: u16, value: u32);
}

impl<T: AtaPortIo + ?Sized> AtaPortIo for alloc::sync::Arc<T> {
    fn read_u8(&self, port: u16) -> u8 {
        (**self).read_u8(port)
    }
    fn write_u8(&self, port: u16, value: u8) {
        (**self).write_u8(port, value)
    }
    fn read_u16(&self, port: u16) -> u16 {
        (**self).read_u16(port)
    }
    fn write_u16(&self, port: u16, value: u16) {
        (**self).write_u16(port, value)
    }
    fn write_u32(&self, port: u16, value: u32) {
        (**self).write_u32(port, value)
    }
}

/// Free-running time source used for command deadlines.
///
/// Two instances back the driver: the platform's normal time counter, and a
/// direct hardware source safe to query with interrupts masked. Crash-dump
/// (critical) operations use the latter exclusively.
pub trait AtaClock: Send + Sync {
    fn ticks(&self) -> u64;
    fn frequency(&self) -> u64;
}

/// Computes an absolute deadline `microseconds` from now on `clock`.
pub(crate) fn deadline_after(clock: &dyn AtaClock, microseconds: u64) -> u64 {
    let ticks = (microseconds as u128).saturating_mul(clock.frequency() as u128) / 1_000_000;
    clock.ticks().saturating_add(ticks as u64)
}

/// Decoded fields of an IDENTIFY DEVICE response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentifyData {
    pub lba48_supported: bool,
    pub total_sectors: u64,
}

// IDENTIFY word offsets.
const IDENTIFY_WORD_TOTAL_SECTORS: usize = 60;
const IDENTIFY_WORD_COMMAND_SETS: usize = 83;
const IDENTIFY_WORD_TOTAL_SECTORS_LBA48: usize = 100;
const IDENTIFY_COMMAND_SET_LBA48: u16 = 1 << 10;

/// Decodes the interesting fields out of a raw 512-byte IDENTIFY response.
pub fn parse_identify(data: &[u8; ATA_SECTOR_SIZE]) -> IdentifyData {
    let word = |index: usize| u16::from_le_bytes([data[index * 2], data[index * 2 + 1]]);

    let lba48_supported = (word(IDENTIFY_WORD_COMMAND_SETS) & IDENTIFY_COMMAND_SET_LBA48) != 0;
    let total_sectors = if lba48_supported {
        (word(IDENTIFY_WORD_TOTAL_SECTORS_LBA48) as u64)
            | (word(IDENTIFY_WORD_TOTAL_SECTORS_LBA48 + 1) as u64) << 16
            | (word(IDENTIFY_WORD_TOTAL_SECTORS_LBA48 + 2) as u64) << 32
            | (word(IDENTIFY_WORD_TOTAL_SECTORS_LBA48 + 3) as u64) << 48
    } else {
        (word(IDENTIFY_WORD_TOTAL_SECTORS) as u64) | (word(IDENTIFY_WORD_TOTAL_SECTORS + 1) as u64) << 16
    };

    IdentifyData { lba48_supported, total_sectors }
}
