//! Per-channel register access and command programming.
//!
//! ## License
//!
//! Copyright (c) The Ember Firmware Authors.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::sync::atomic::{AtomicU8, Ordering};

use ember_sdk::error::EfiError;

use crate::dma::PrdtEntry;
use crate::regs::{
    deadline_after, AtaClock, AtaCommand, AtaControl, AtaPortIo, AtaRegister, AtaStatus,
    ATA_DRIVE_SELECT_LBA, ATA_INVALID_SELECTION, ATA_SELECT_TIMEOUT_MICROSECONDS,
};

// Distance in register space between a high-order LBA48 register and the
// low-order port it aliases.
const ATA_HIGH_ADDRESSING_OFFSET: u16 = 6;

// Offset of the bus master registers within the unified register space.
const ATA_BUS_MASTER_OFFSET: u16 = AtaRegister::BusMasterCommand as u16;

// Offset of the control register within the unified register space.
const ATA_CONTROL_OFFSET: u16 = AtaRegister::Control as u16;

/// Physical placement of a channel's pre-allocated PRDT.
///
/// The table must sit below 4GiB, be physically contiguous, and not cross a
/// 64KiB boundary. The platform allocates it before handing the channel
/// configuration to the controller.
#[derive(Debug, Clone, Copy)]
pub struct PrdtRegion {
    pub virtual_address: *mut PrdtEntry,
    pub physical_address: u32,
    pub entries: usize,
}

/// Register bases for one channel of a controller.
#[derive(Debug, Clone, Copy)]
pub struct AtaChannelConfig {
    pub io_base: u16,
    pub control_base: u16,
    pub bus_master_base: Option<u16>,
    pub prdt: Option<PrdtRegion>,
}

/// One cable of an ATA controller, carrying up to two devices.
pub struct AtaChannel {
    pub(crate) io_base: u16,
    pub(crate) control_base: u16,
    pub(crate) bus_master_base: Option<u16>,
    /// Shadow of the interrupt disable bit currently programmed in control.
    pub(crate) interrupt_disable: AtomicU8,
    /// Device select code of the currently selected device, or
    /// [`ATA_INVALID_SELECTION`].
    pub(crate) selected_device: AtomicU8,
    /// Arbitration among submitters. Never taken by the interrupt path, and
    /// bypassed entirely by crash-dump operations.
    pub(crate) lock: spin::Mutex<()>,
    pub(crate) prdt_virt: *mut PrdtEntry,
    pub(crate) prdt_phys: u32,
    pub(crate) prdt_entries: usize,
}

// The raw PRDT pointer is only dereferenced under the controller's transfer
// state lock.
unsafe impl Send for AtaChannel {}
unsafe impl Sync for AtaChannel {}

impl AtaChannel {
    pub(crate) fn new(config: &AtaChannelConfig) -> AtaChannel {
        let (prdt_virt, prdt_phys, prdt_entries) = match config.prdt {
            Some(region) => (region.virtual_address, region.physical_address, region.entries),
            None => (core::ptr::null_mut(), 0, 0),
        };
        AtaChannel {
            io_base: config.io_base,
            control_base: config.control_base,
            bus_master_base: config.bus_master_base,
            interrupt_disable: AtomicU8::new(AtaControl::INTERRUPT_DISABLE.bits()),
            selected_device: AtomicU8::new(ATA_INVALID_SELECTION),
            lock: spin::Mutex::new(()),
            prdt_virt,
            prdt_phys,
            prdt_entries,
        }
    }

    /// Reads an ATA register, routing it to the correct port. High-order
    /// LBA48 registers are reached by flipping the high-order control bit
    /// around an access to the low-order port they alias.
    pub(crate) fn read_register<P: AtaPortIo>(&self, ports: &P, register: AtaRegister) -> u8 {
        let value = register as u16;
        if value < AtaRegister::SectorCountHigh as u16 {
            ports.read_u8(self.io_base + value)
        } else if value < ATA_CONTROL_OFFSET {
            let interrupt_disable = self.interrupt_disable.load(Ordering::Relaxed);
            ports.write_u8(self.control_base, AtaControl::HIGH_ORDER.bits() | interrupt_disable);
            let data = ports.read_u8(self.io_base + value - ATA_HIGH_ADDRESSING_OFFSET);
            ports.write_u8(self.control_base, interrupt_disable);
            data
        } else if value < ATA_BUS_MASTER_OFFSET {
            ports.read_u8(self.control_base + value - ATA_CONTROL_OFFSET)
        } else {
            let base = self.bus_master_base.unwrap_or(0);
            ports.read_u8(base + value - ATA_BUS_MASTER_OFFSET)
        }
    }

    /// Writes an ATA register, with the same routing as [`Self::read_register`].
    pub(crate) fn write_register<P: AtaPortIo>(&self, ports: &P, register: AtaRegister, data: u8) {
        let value = register as u16;
        if value < AtaRegister::SectorCountHigh as u16 {
            ports.write_u8(self.io_base + value, data);
        } else if value < ATA_CONTROL_OFFSET {
            let interrupt_disable = self.interrupt_disable.load(Ordering::Relaxed);
            ports.write_u8(self.control_base, AtaControl::HIGH_ORDER.bits() | interrupt_disable);
            ports.write_u8(self.io_base + value - ATA_HIGH_ADDRESSING_OFFSET, data);
            ports.write_u8(self.control_base, interrupt_disable);
        } else if value < ATA_BUS_MASTER_OFFSET {
            if register == AtaRegister::Control {
                self.interrupt_disable
                    .store(data & AtaControl::INTERRUPT_DISABLE.bits(), Ordering::Relaxed);
            }
            ports.write_u8(self.control_base + value - ATA_CONTROL_OFFSET, data);
        } else {
            let base = self.bus_master_base.unwrap_or(0);
            ports.write_u8(base + value - ATA_BUS_MASTER_OFFSET, data);
        }
    }

    /// Programs the bus master descriptor table pointer.
    pub(crate) fn write_prdt_pointer<P: AtaPortIo>(&self, ports: &P, physical: u32) {
        if let Some(base) = self.bus_master_base {
            ports.write_u32(base + 4, physical);
        }
    }

    pub(crate) fn read_data<P: AtaPortIo>(&self, ports: &P) -> u16 {
        ports.read_u16(self.io_base + AtaRegister::Data as u16)
    }

    pub(crate) fn write_data<P: AtaPortIo>(&self, ports: &P, value: u16) {
        ports.write_u16(self.io_base + AtaRegister::Data as u16, value);
    }

    /// Delays roughly 400ns by reading the alternate status register, which
    /// does not disturb the interrupt latch.
    pub(crate) fn stall<P: AtaPortIo>(&self, ports: &P) {
        for _ in 0..4 {
            self.read_register(ports, AtaRegister::ALTERNATE_STATUS);
        }
    }

    /// Selects a device on the channel, waiting for it to report ready. The
    /// selection is cached so back-to-back commands to the same device skip
    /// the wait.
    pub(crate) fn select_device<P: AtaPortIo>(
        &self,
        ports: &P,
        clock: &dyn AtaClock,
        device: u8,
    ) -> Result<(), EfiError> {
        if self.selected_device.load(Ordering::Relaxed) == device {
            return Ok(());
        }

        self.selected_device.store(ATA_INVALID_SELECTION, Ordering::Relaxed);
        let deadline = deadline_after(clock, ATA_SELECT_TIMEOUT_MICROSECONDS);
        loop {
            let status = AtaStatus::from_bits_retain(self.read_register(ports, AtaRegister::STATUS));
            if !status.intersects(AtaStatus::BUSY) {
                break;
            }
            if clock.ticks() >= deadline {
                return Err(EfiError::Timeout);
            }
            core::hint::spin_loop();
        }

        self.write_register(ports, AtaRegister::DeviceSelect, device);
        let deadline = deadline_after(clock, ATA_SELECT_TIMEOUT_MICROSECONDS);
        loop {
            let status = AtaStatus::from_bits_retain(self.read_register(ports, AtaRegister::STATUS));
            if status.intersects(AtaStatus::ERROR_MASK) {
                return Err(EfiError::DeviceError);
            }
            if !status.intersects(AtaStatus::BUSY_MASK) && status.intersects(AtaStatus::DRIVE_READY) {
                break;
            }
            if clock.ticks() >= deadline {
                return Err(EfiError::Timeout);
            }
            core::hint::spin_loop();
        }

        self.selected_device.store(device, Ordering::Relaxed);
        Ok(())
    }

    /// Programs the taskfile for a command: features, sector count, and LBA.
    /// For 48-bit commands the high-order bytes are batched behind a single
    /// pair of control register flips.
    pub(crate) fn setup_command<P: AtaPortIo>(
        &self,
        ports: &P,
        device: u8,
        lba48: bool,
        lba: u64,
        sector_count: u16,
        features: u8,
    ) {
        let mut device_select = device | ATA_DRIVE_SELECT_LBA;
        let interrupt_disable = self.interrupt_disable.load(Ordering::Relaxed);
        self.write_register(ports, AtaRegister::Control, interrupt_disable);
        if lba48 {
            // Write all three high-order bytes in one high-order window
            // rather than flipping the control register around each one.
            ports.write_u8(self.control_base, AtaControl::HIGH_ORDER.bits() | interrupt_disable);
            self.write_raw_low(ports, AtaRegister::SectorCountLow, (sector_count >> 8) as u8);
            self.write_raw_low(ports, AtaRegister::Lba0, (lba >> 24) as u8);
            self.write_raw_low(ports, AtaRegister::Lba1, (lba >> 32) as u8);
            self.write_raw_low(ports, AtaRegister::Lba2, (lba >> 40) as u8);
            ports.write_u8(self.control_base, interrupt_disable);
        } else {
            device_select |= ((lba >> 24) & 0x0f) as u8;
        }

        self.write_register(ports, AtaRegister::FEATURES, features);
        self.write_register(ports, AtaRegister::SectorCountLow, sector_count as u8);
        self.write_register(ports, AtaRegister::Lba0, lba as u8);
        self.write_register(ports, AtaRegister::Lba1, (lba >> 8) as u8);
        self.write_register(ports, AtaRegister::Lba2, (lba >> 16) as u8);
        self.write_register(ports, AtaRegister::DeviceSelect, device_select);
    }

    pub(crate) fn write_command<P: AtaPortIo>(&self, ports: &P, command: AtaCommand) {
        self.write_register(ports, AtaRegister::Command, command as u8);
    }

    // Writes a low io_base port directly, for use while the high-order
    // control bit is set.
    fn write_raw_low<P: AtaPortIo>(&self, ports: &P, register: AtaRegister, data: u8) {
        ports.write_u8(self.io_base + register as u16, data);
    }
}
