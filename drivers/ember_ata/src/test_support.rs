//! Simulated ATA hardware for tests.
//!
//! ## License
//!
//! Copyright (c) The Ember Firmware Authors.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::channel::PrdtRegion;
use crate::dma::{PrdtEntry, PRDT_END_OF_TABLE};
use crate::regs::{
    AtaClock, AtaCommand, AtaControl, AtaPortIo, AtaStatus, BusMasterCommand, BusMasterStatus,
    ATA_LEGACY_PRIMARY_CONTROL_BASE, ATA_LEGACY_PRIMARY_IO_BASE, ATA_LEGACY_SECONDARY_CONTROL_BASE,
    ATA_LEGACY_SECONDARY_IO_BASE, ATA_PATAPI_SIGNATURE, ATA_SATA_SIGNATURE, ATA_SECTOR_SIZE,
};
use crate::AtaControllerConfig;

pub const SIM_BUS_MASTER_BASE: u16 = 0xc000;

/// Test clock: a counter that advances a fixed step on every read so
/// deadlines eventually expire even if nothing else makes progress.
pub struct TestClock {
    ticks: AtomicU64,
    step: u64,
}

impl TestClock {
    pub fn new(step: u64) -> TestClock {
        TestClock { ticks: AtomicU64::new(0), step }
    }
}

impl AtaClock for TestClock {
    fn ticks(&self) -> u64 {
        self.ticks.fetch_add(self.step, Ordering::Relaxed) + self.step
    }

    fn frequency(&self) -> u64 {
        1_000_000
    }
}

/// What occupies a device slot on the simulated bus.
pub enum SimSlot {
    Empty,
    Disk(SimDrive),
    /// Packet device: fails IDENTIFY and leaves its signature in the LBA
    /// registers.
    Atapi,
    /// SATA device behind a compatibility bridge, same failure shape.
    Sata,
}

pub struct SimDrive {
    pub data: Vec<u8>,
    pub lba48: bool,
    pub flush_count: u32,
}

impl SimDrive {
    pub fn new(total_sectors: u64, lba48: bool) -> SimDrive {
        SimDrive { data: vec![0u8; (total_sectors as usize) * ATA_SECTOR_SIZE], lba48, flush_count: 0 }
    }

    fn total_sectors(&self) -> u64 {
        (self.data.len() / ATA_SECTOR_SIZE) as u64
    }

    fn identify_response(&self) -> Vec<u16> {
        let mut words = vec![0u16; 256];
        let sectors = self.total_sectors();
        if self.lba48 {
            words[83] = 1 << 10;
            words[100] = sectors as u16;
            words[101] = (sectors >> 16) as u16;
            words[102] = (sectors >> 32) as u16;
            words[103] = (sectors >> 48) as u16;
        } else {
            words[60] = sectors as u16;
            words[61] = (sectors >> 16) as u16;
        }
        words
    }
}

struct PendingWrite {
    lba: u64,
    remaining_sectors: u64,
    sector: Vec<u8>,
}

struct PendingDma {
    lba: u64,
    sectors: u64,
    write: bool,
}

struct SimChannel {
    // Taskfile shadows. Index 0 is the low byte, 1 the high-order byte
    // reached through the control register's high-order bit.
    sector_count: [u8; 2],
    lba: [[u8; 2]; 3],
    device_select: u8,
    control: u8,
    status: u8,
    lba1_out: u8,
    lba2_out: u8,
    bus_master_status: u8,
    prdt_physical: u32,
    slots: [SimSlot; 2],
    read_fifo: Vec<u16>,
    read_position: usize,
    pending_write: Option<PendingWrite>,
    pending_dma: Option<PendingDma>,
}

impl SimChannel {
    fn new(slots: [SimSlot; 2]) -> SimChannel {
        SimChannel {
            sector_count: [0; 2],
            lba: [[0; 2]; 3],
            device_select: 0,
            control: 0,
            status: AtaStatus::DRIVE_READY.bits(),
            lba1_out: 0,
            lba2_out: 0,
            bus_master_status: 0,
            prdt_physical: 0,
            slots,
            read_fifo: Vec::new(),
            read_position: 0,
            pending_write: None,
            pending_dma: None,
        }
    }

    fn selected_slot(&self) -> usize {
        ((self.device_select >> 4) & 1) as usize
    }

    fn high_order(&self) -> bool {
        self.control & AtaControl::HIGH_ORDER.bits() != 0
    }

    fn taskfile_lba28(&self) -> u64 {
        ((self.device_select as u64 & 0x0f) << 24)
            | ((self.lba[2][0] as u64) << 16)
            | ((self.lba[1][0] as u64) << 8)
            | self.lba[0][0] as u64
    }

    fn taskfile_lba48(&self) -> u64 {
        ((self.lba[2][1] as u64) << 40)
            | ((self.lba[1][1] as u64) << 32)
            | ((self.lba[0][1] as u64) << 24)
            | ((self.lba[2][0] as u64) << 16)
            | ((self.lba[1][0] as u64) << 8)
            | self.lba[0][0] as u64
    }

    fn taskfile_count28(&self) -> u64 {
        if self.sector_count[0] == 0 {
            0x100
        } else {
            self.sector_count[0] as u64
        }
    }

    fn taskfile_count48(&self) -> u64 {
        let count = ((self.sector_count[1] as u64) << 8) | self.sector_count[0] as u64;
        if count == 0 {
            0x1_0000
        } else {
            count
        }
    }
}

/// Host memory registered as visible to the simulated bus master engine at a
/// fake sub-4GiB physical address.
struct DmaWindow {
    physical: u64,
    host: usize,
    length: usize,
}

struct SimState {
    channels: [SimChannel; 2],
    windows: Vec<DmaWindow>,
}

impl SimState {
    fn translate(&self, physical: u64, length: usize) -> Option<*mut u8> {
        for window in &self.windows {
            if physical >= window.physical && physical + length as u64 <= window.physical + window.length as u64 {
                return Some((window.host + (physical - window.physical) as usize) as *mut u8);
            }
        }
        None
    }
}

/// The simulated legacy ATA controller, addressed through port I/O exactly
/// like real hardware.
pub struct SimBus {
    state: spin::Mutex<SimState>,
}

unsafe impl Send for SimBus {}
unsafe impl Sync for SimBus {}

impl SimBus {
    pub fn new(primary: [SimSlot; 2], secondary: [SimSlot; 2]) -> SimBus {
        SimBus {
            state: spin::Mutex::new(SimState {
                channels: [SimChannel::new(primary), SimChannel::new(secondary)],
                windows: Vec::new(),
            }),
        }
    }

    /// Registers a fake physical window over host memory for the DMA engine.
    pub fn map_dma_window(&self, physical: u64, host: *mut u8, length: usize) {
        self.state.lock().windows.push(DmaWindow { physical, host: host as usize, length });
    }

    pub fn flush_count(&self, channel: usize, slot: usize) -> u32 {
        match &self.state.lock().channels[channel].slots[slot] {
            SimSlot::Disk(drive) => drive.flush_count,
            _ => 0,
        }
    }

    /// Copies raw sector data out of a simulated drive.
    pub fn drive_data(&self, channel: usize, slot: usize, lba: u64, sectors: usize) -> Vec<u8> {
        match &self.state.lock().channels[channel].slots[slot] {
            SimSlot::Disk(drive) => {
                let start = (lba as usize) * ATA_SECTOR_SIZE;
                drive.data[start..start + sectors * ATA_SECTOR_SIZE].to_vec()
            }
            _ => Vec::new(),
        }
    }

    /// Overwrites raw sector data on a simulated drive.
    pub fn set_drive_data(&self, channel: usize, slot: usize, lba: u64, data: &[u8]) {
        if let SimSlot::Disk(drive) = &mut self.state.lock().channels[channel].slots[slot] {
            let start = (lba as usize) * ATA_SECTOR_SIZE;
            drive.data[start..start + data.len()].copy_from_slice(data);
        }
    }

    fn decode(port: u16) -> Option<(usize, PortKind)> {
        let io_bases = [ATA_LEGACY_PRIMARY_IO_BASE, ATA_LEGACY_SECONDARY_IO_BASE];
        let control_bases = [ATA_LEGACY_PRIMARY_CONTROL_BASE, ATA_LEGACY_SECONDARY_CONTROL_BASE];
        for channel in 0..2 {
            if port >= io_bases[channel] && port < io_bases[channel] + 8 {
                return Some((channel, PortKind::Io((port - io_bases[channel]) as u8)));
            }
            if port == control_bases[channel] {
                return Some((channel, PortKind::Control));
            }
            let bus_master = SIM_BUS_MASTER_BASE + (channel as u16) * 8;
            if port >= bus_master && port < bus_master + 8 {
                return Some((channel, PortKind::BusMaster((port - bus_master) as u8)));
            }
        }
        None
    }

    fn execute_command(state: &mut SimState, channel_index: usize, opcode: u8) {
        let channel = &mut state.channels[channel_index];
        let slot = channel.selected_slot();
        match opcode {
            op if op == AtaCommand::Identify as u8 => match &channel.slots[slot] {
                SimSlot::Empty => {
                    channel.status = 0;
                }
                SimSlot::Atapi => {
                    channel.status = (AtaStatus::DRIVE_READY | AtaStatus::ERROR).bits();
                    channel.lba1_out = ATA_PATAPI_SIGNATURE.0;
                    channel.lba2_out = ATA_PATAPI_SIGNATURE.1;
                }
                SimSlot::Sata => {
                    channel.status = (AtaStatus::DRIVE_READY | AtaStatus::ERROR).bits();
                    channel.lba1_out = ATA_SATA_SIGNATURE.0;
                    channel.lba2_out = ATA_SATA_SIGNATURE.1;
                }
                SimSlot::Disk(drive) => {
                    channel.read_fifo = drive.identify_response();
                    channel.read_position = 0;
                    channel.status = (AtaStatus::DRIVE_READY | AtaStatus::DATA_REQUEST).bits();
                }
            },
            op if op == AtaCommand::ReadPio28 as u8 || op == AtaCommand::ReadPio48 as u8 => {
                let lba48 = op == AtaCommand::ReadPio48 as u8;
                let lba = if lba48 { channel.taskfile_lba48() } else { channel.taskfile_lba28() };
                let sectors = if lba48 { channel.taskfile_count48() } else { channel.taskfile_count28() };
                if let SimSlot::Disk(drive) = &channel.slots[slot] {
                    let start = (lba as usize) * ATA_SECTOR_SIZE;
                    let end = start + (sectors as usize) * ATA_SECTOR_SIZE;
                    if end > drive.data.len() {
                        channel.status = (AtaStatus::DRIVE_READY | AtaStatus::ERROR).bits();
                        return;
                    }
                    channel.read_fifo = drive.data[start..end]
                        .chunks_exact(2)
                        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
                        .collect();
                    channel.read_position = 0;
                    channel.status = (AtaStatus::DRIVE_READY | AtaStatus::DATA_REQUEST).bits();
                } else {
                    channel.status = (AtaStatus::DRIVE_READY | AtaStatus::ERROR).bits();
                }
            }
            op if op == AtaCommand::WritePio28 as u8 || op == AtaCommand::WritePio48 as u8 => {
                let lba48 = op == AtaCommand::WritePio48 as u8;
                let lba = if lba48 { channel.taskfile_lba48() } else { channel.taskfile_lba28() };
                let sectors = if lba48 { channel.taskfile_count48() } else { channel.taskfile_count28() };
                channel.pending_write = Some(PendingWrite { lba, remaining_sectors: sectors, sector: Vec::new() });
                channel.status = (AtaStatus::DRIVE_READY | AtaStatus::DATA_REQUEST).bits();
            }
            op if op == AtaCommand::CacheFlush28 as u8 => {
                if let SimSlot::Disk(drive) = &mut channel.slots[slot] {
                    drive.flush_count += 1;
                }
                channel.status = AtaStatus::DRIVE_READY.bits();
            }
            op if op == AtaCommand::ReadDma28 as u8 || op == AtaCommand::ReadDma48 as u8 => {
                let lba48 = op == AtaCommand::ReadDma48 as u8;
                let lba = if lba48 { channel.taskfile_lba48() } else { channel.taskfile_lba28() };
                let sectors = if lba48 { channel.taskfile_count48() } else { channel.taskfile_count28() };
                channel.pending_dma = Some(PendingDma { lba, sectors, write: false });
                channel.status = (AtaStatus::DRIVE_READY | AtaStatus::BUSY).bits();
            }
            op if op == AtaCommand::WriteDma28 as u8 || op == AtaCommand::WriteDma48 as u8 => {
                let lba48 = op == AtaCommand::WriteDma48 as u8;
                let lba = if lba48 { channel.taskfile_lba48() } else { channel.taskfile_lba28() };
                let sectors = if lba48 { channel.taskfile_count48() } else { channel.taskfile_count28() };
                channel.pending_dma = Some(PendingDma { lba, sectors, write: true });
                channel.status = (AtaStatus::DRIVE_READY | AtaStatus::BUSY).bits();
            }
            _ => {
                channel.status = (AtaStatus::DRIVE_READY | AtaStatus::ERROR).bits();
            }
        }
    }

    /// Runs a programmed DMA transfer to completion, walking the descriptor
    /// table exactly as the bus master engine would.
    fn execute_dma(state: &mut SimState, channel_index: usize) {
        let (prdt_physical, pending) = {
            let channel = &mut state.channels[channel_index];
            (channel.prdt_physical, channel.pending_dma.take())
        };
        let Some(pending) = pending else {
            return;
        };

        let mut descriptors = Vec::new();
        let mut entry_physical = prdt_physical as u64;
        loop {
            let Some(entry_host) = state.translate(entry_physical, core::mem::size_of::<PrdtEntry>()) else {
                state.channels[channel_index].bus_master_status |= BusMasterStatus::ERROR.bits();
                return;
            };
            let entry = unsafe { core::ptr::read(entry_host as *const PrdtEntry) };
            let size = if entry.size == 0 { 0x10000usize } else { entry.size as usize };
            descriptors.push((entry.address as u64, size));
            if entry.flags & PRDT_END_OF_TABLE != 0 {
                break;
            }
            entry_physical += core::mem::size_of::<PrdtEntry>() as u64;
        }

        let mut disk_offset = (pending.lba as usize) * ATA_SECTOR_SIZE;
        let mut remaining = (pending.sectors as usize) * ATA_SECTOR_SIZE;
        for (physical, size) in descriptors {
            let span = size.min(remaining);
            if span == 0 {
                break;
            }
            let Some(host) = state.translate(physical, span) else {
                state.channels[channel_index].bus_master_status |= BusMasterStatus::ERROR.bits();
                return;
            };
            let channel = &mut state.channels[channel_index];
            let slot = channel.selected_slot();
            let SimSlot::Disk(drive) = &mut channel.slots[slot] else {
                channel.bus_master_status |= BusMasterStatus::ERROR.bits();
                return;
            };
            if disk_offset + span > drive.data.len() {
                channel.bus_master_status |= BusMasterStatus::ERROR.bits();
                return;
            }
            unsafe {
                if pending.write {
                    core::ptr::copy_nonoverlapping(host, drive.data.as_mut_ptr().add(disk_offset), span);
                } else {
                    core::ptr::copy_nonoverlapping(drive.data.as_ptr().add(disk_offset), host, span);
                }
            }
            disk_offset += span;
            remaining -= span;
        }

        let channel = &mut state.channels[channel_index];
        channel.status = AtaStatus::DRIVE_READY.bits();
        channel.bus_master_status |= BusMasterStatus::INTERRUPT.bits();
    }
}

enum PortKind {
    Io(u8),
    Control,
    BusMaster(u8),
}

impl AtaPortIo for SimBus {
    fn read_u8(&self, port: u16) -> u8 {
        let mut state = self.state.lock();
        let Some((channel_index, kind)) = Self::decode(port) else {
            return 0xff;
        };
        let channel = &mut state.channels[channel_index];
        match kind {
            PortKind::Io(1) => 0,
            PortKind::Io(2) => channel.sector_count[channel.high_order() as usize],
            PortKind::Io(3) => channel.lba[0][channel.high_order() as usize],
            PortKind::Io(4) => {
                if channel.lba1_out != 0 {
                    channel.lba1_out
                } else {
                    channel.lba[1][channel.high_order() as usize]
                }
            }
            PortKind::Io(5) => {
                if channel.lba2_out != 0 {
                    channel.lba2_out
                } else {
                    channel.lba[2][channel.high_order() as usize]
                }
            }
            PortKind::Io(6) => channel.device_select,
            PortKind::Io(7) | PortKind::Control => channel.status,
            PortKind::BusMaster(2) => channel.bus_master_status,
            _ => 0,
        }
    }

    fn write_u8(&self, port: u16, value: u8) {
        let mut state = self.state.lock();
        let Some((channel_index, kind)) = Self::decode(port) else {
            return;
        };
        match kind {
            PortKind::Io(2) => {
                let channel = &mut state.channels[channel_index];
                channel.sector_count[channel.high_order() as usize] = value;
            }
            PortKind::Io(3) => {
                let channel = &mut state.channels[channel_index];
                channel.lba[0][channel.high_order() as usize] = value;
            }
            PortKind::Io(4) => {
                let channel = &mut state.channels[channel_index];
                channel.lba[1][channel.high_order() as usize] = value;
            }
            PortKind::Io(5) => {
                let channel = &mut state.channels[channel_index];
                channel.lba[2][channel.high_order() as usize] = value;
            }
            PortKind::Io(6) => {
                let channel = &mut state.channels[channel_index];
                channel.device_select = value;
                channel.lba1_out = 0;
                channel.lba2_out = 0;
                channel.status = AtaStatus::DRIVE_READY.bits();
            }
            PortKind::Io(7) => {
                Self::execute_command(&mut state, channel_index, value);
            }
            PortKind::Control => {
                state.channels[channel_index].control = value;
            }
            PortKind::BusMaster(0) => {
                if value & BusMasterCommand::DMA_ENABLE.bits() != 0 {
                    Self::execute_dma(&mut state, channel_index);
                }
            }
            PortKind::BusMaster(2) => {
                // Write-one-to-clear.
                let channel = &mut state.channels[channel_index];
                channel.bus_master_status &= !(value & 0x06);
            }
            _ => {}
        }
    }

    fn read_u16(&self, port: u16) -> u16 {
        let mut state = self.state.lock();
        let Some((channel_index, PortKind::Io(0))) = Self::decode(port) else {
            return 0;
        };
        let channel = &mut state.channels[channel_index];
        let word = channel.read_fifo.get(channel.read_position).copied().unwrap_or(0);
        channel.read_position += 1;
        if channel.read_position >= channel.read_fifo.len() {
            channel.read_fifo.clear();
            channel.read_position = 0;
            channel.status = AtaStatus::DRIVE_READY.bits();
        }
        word
    }

    fn write_u16(&self, port: u16, value: u16) {
        let mut state = self.state.lock();
        let Some((channel_index, PortKind::Io(0))) = Self::decode(port) else {
            return;
        };
        let channel = &mut state.channels[channel_index];
        let slot = channel.selected_slot();
        let Some(pending) = channel.pending_write.as_mut() else {
            return;
        };
        pending.sector.extend_from_slice(&value.to_le_bytes());
        if pending.sector.len() == ATA_SECTOR_SIZE {
            let lba = pending.lba;
            let sector = core::mem::take(&mut pending.sector);
            pending.lba += 1;
            pending.remaining_sectors -= 1;
            let done = pending.remaining_sectors == 0;
            if let SimSlot::Disk(drive) = &mut channel.slots[slot] {
                let start = (lba as usize) * ATA_SECTOR_SIZE;
                drive.data[start..start + ATA_SECTOR_SIZE].copy_from_slice(&sector);
            }
            if done {
                channel.pending_write = None;
                channel.status = AtaStatus::DRIVE_READY.bits();
            }
        }
    }

    fn write_u32(&self, port: u16, value: u32) {
        let mut state = self.state.lock();
        if let Some((channel_index, PortKind::BusMaster(4))) = Self::decode(port) {
            state.channels[channel_index].prdt_physical = value;
        }
    }
}

/// Builds a legacy controller configuration whose PRDTs live in `prdt`
/// backing stores mapped at fake physical addresses.
pub fn sim_config(prdt: &mut [[PrdtEntry; 8]; 2]) -> (AtaControllerConfig, [(u64, *mut u8, usize); 2]) {
    let mut regions = [None, None];
    let mut windows = [(0u64, core::ptr::null_mut(), 0usize); 2];
    for (index, table) in prdt.iter_mut().enumerate() {
        let physical = 0x1_0000u32 + (index as u32) * 0x1000;
        regions[index] = Some(PrdtRegion {
            virtual_address: table.as_mut_ptr(),
            physical_address: physical,
            entries: table.len(),
        });
        windows[index] = (
            physical as u64,
            table.as_mut_ptr() as *mut u8,
            core::mem::size_of_val(table),
        );
    }
    (AtaControllerConfig::legacy(Some(SIM_BUS_MASTER_BASE), regions), windows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::DmaSegment;
    use crate::regs::ATA_DEVICE_MASTER;
    use crate::AtaController;
    use alloc::boxed::Box;
    use alloc::sync::Arc;

    fn controller_with(
        primary: [SimSlot; 2],
        secondary: [SimSlot; 2],
        prdt: &mut [[PrdtEntry; 8]; 2],
    ) -> Arc<AtaController<Arc<SimBus>>> {
        let (config, windows) = sim_config(prdt);
        let bus = Arc::new(SimBus::new(primary, secondary));
        for (physical, host, length) in windows {
            bus.map_dma_window(physical, host, length);
        }
        Arc::new(AtaController::new(
            bus,
            &config,
            Box::new(TestClock::new(100)),
            Box::new(TestClock::new(100)),
        ))
    }

    fn pattern(sectors: usize, seed: u8) -> Vec<u8> {
        (0..sectors * ATA_SECTOR_SIZE).map(|index| (index as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn enumerate_finds_disks_and_skips_empty_slots() {
        let mut prdt = [[PrdtEntry::default(); 8]; 2];
        let controller = controller_with(
            [SimSlot::Disk(SimDrive::new(1024, false)), SimSlot::Empty],
            [SimSlot::Empty, SimSlot::Disk(SimDrive::new(4096, true))],
            &mut prdt,
        );
        let disks = controller.enumerate();
        assert_eq!(disks.len(), 2);
        assert_eq!(disks[0].total_sectors(), 1024);
        assert_eq!(disks[1].total_sectors(), 4096);
    }

    #[test]
    fn identify_reports_packet_and_sata_devices_as_unsupported() {
        let mut prdt = [[PrdtEntry::default(); 8]; 2];
        let controller =
            controller_with([SimSlot::Atapi, SimSlot::Sata], [SimSlot::Empty, SimSlot::Empty], &mut prdt);
        assert_eq!(controller.identify(0, 0), Err(ember_sdk::error::EfiError::Unsupported));
        assert_eq!(controller.identify(0, 1), Err(ember_sdk::error::EfiError::Unsupported));
        assert_eq!(controller.identify(1, 0), Err(ember_sdk::error::EfiError::NotFound));
    }

    #[test]
    fn pio_write_then_read_round_trips_and_flushes() {
        let mut prdt = [[PrdtEntry::default(); 8]; 2];
        let controller = controller_with(
            [SimSlot::Disk(SimDrive::new(64, false)), SimSlot::Empty],
            [SimSlot::Empty, SimSlot::Empty],
            &mut prdt,
        );
        let disks = controller.enumerate();
        let disk = &disks[0];

        let data = pattern(3, 7);
        disk.write_blocks_critical(5, &data).unwrap();
        let mut readback = vec![0u8; data.len()];
        disk.read_blocks_critical(5, &mut readback).unwrap();
        assert_eq!(readback, data);
        // Polled writes flush the device cache.
        assert_eq!(controller.ports().flush_count(0, 0), 1);
    }

    #[test]
    fn pio_rejects_out_of_range_and_ragged_buffers() {
        let mut prdt = [[PrdtEntry::default(); 8]; 2];
        let controller = controller_with(
            [SimSlot::Disk(SimDrive::new(16, false)), SimSlot::Empty],
            [SimSlot::Empty, SimSlot::Empty],
            &mut prdt,
        );
        let disks = controller.enumerate();
        let disk = &disks[0];

        let mut buffer = vec![0u8; 2 * ATA_SECTOR_SIZE];
        assert_eq!(disk.read_blocks_critical(15, &mut buffer), Err(ember_sdk::error::EfiError::InvalidParameter));
        let mut ragged = vec![0u8; ATA_SECTOR_SIZE + 1];
        assert_eq!(disk.read_blocks_critical(0, &mut ragged), Err(ember_sdk::error::EfiError::InvalidParameter));
    }

    #[test]
    fn dma_read_matches_pio_read() {
        let mut prdt = [[PrdtEntry::default(); 8]; 2];
        let controller = controller_with(
            [SimSlot::Disk(SimDrive::new(256, true)), SimSlot::Empty],
            [SimSlot::Empty, SimSlot::Empty],
            &mut prdt,
        );
        let bus = controller.ports().clone();
        let disks = controller.enumerate();
        let disk = &disks[0];

        let data = pattern(8, 3);
        bus.set_drive_data(0, 0, 40, &data);

        let mut dma_buffer = vec![0u8; data.len()];
        bus.map_dma_window(0x8_0000, dma_buffer.as_mut_ptr(), dma_buffer.len());
        let segments = [DmaSegment { address: 0x8_0000, size: data.len() as u64 }];
        disk.dma_read(40, &segments, data.len() as u64).unwrap();
        assert_eq!(dma_buffer, data);

        let mut pio_buffer = vec![0u8; data.len()];
        disk.read_blocks_critical(40, &mut pio_buffer).unwrap();
        assert_eq!(pio_buffer, dma_buffer);
    }

    #[test]
    fn dma_write_runs_multiple_rounds_and_flushes() {
        let mut prdt = [[PrdtEntry::default(); 8]; 2];
        // 320 sectors exceed one 28-bit round, so the transfer takes two.
        let controller = controller_with(
            [SimSlot::Disk(SimDrive::new(512, false)), SimSlot::Empty],
            [SimSlot::Empty, SimSlot::Empty],
            &mut prdt,
        );
        let bus = controller.ports().clone();
        let disks = controller.enumerate();
        let disk = &disks[0];

        let data = pattern(320, 9);
        let mut dma_buffer = data.clone();
        bus.map_dma_window(0x10_0000, dma_buffer.as_mut_ptr(), dma_buffer.len());
        let segments = [DmaSegment { address: 0x10_0000, size: data.len() as u64 }];
        disk.dma_write(64, &segments, data.len() as u64).unwrap();

        assert_eq!(bus.drive_data(0, 0, 64, 320), data);
        assert_eq!(bus.flush_count(0, 0), 1);
    }

    #[test]
    fn critical_io_completes_while_submitter_lock_is_held() {
        let mut prdt = [[PrdtEntry::default(); 8]; 2];
        let controller = controller_with(
            [SimSlot::Disk(SimDrive::new(32, false)), SimSlot::Empty],
            [SimSlot::Empty, SimSlot::Empty],
            &mut prdt,
        );
        let disks = controller.enumerate();
        let disk = &disks[0];

        // Simulate a crash with the arbitration lock held by its owner.
        let guard = controller.channel_lock(0);
        let data = pattern(1, 1);
        disk.write_blocks_critical(2, &data).unwrap();
        let mut readback = vec![0u8; data.len()];
        disk.read_blocks_critical(2, &mut readback).unwrap();
        drop(guard);
        assert_eq!(readback, data);
    }

    #[test]
    fn byte_granular_io_read_modify_writes_partial_sectors() {
        let mut prdt = [[PrdtEntry::default(); 8]; 2];
        let controller = controller_with(
            [SimSlot::Disk(SimDrive::new(32, false)), SimSlot::Empty],
            [SimSlot::Empty, SimSlot::Empty],
            &mut prdt,
        );
        let bus = controller.ports().clone();
        let disks = controller.enumerate();
        let disk = &disks[0];

        let backdrop = pattern(4, 5);
        bus.set_drive_data(0, 0, 0, &backdrop);

        let payload = [0xabu8; 700];
        disk.write_bytes(300, &payload).unwrap();

        let mut readback = vec![0u8; 700];
        disk.read_bytes(300, &mut readback).unwrap();
        assert_eq!(readback, payload);

        // Bytes outside the written range keep their old contents.
        let mut prefix = vec![0u8; 300];
        disk.read_bytes(0, &mut prefix).unwrap();
        assert_eq!(prefix, backdrop[..300]);
    }

    #[test]
    fn lba48_transfer_reaches_high_sectors() {
        let mut prdt = [[PrdtEntry::default(); 8]; 2];
        let controller = controller_with(
            [SimSlot::Disk(SimDrive::new(0x1000, true)), SimSlot::Empty],
            [SimSlot::Empty, SimSlot::Empty],
            &mut prdt,
        );
        let disks = controller.enumerate();
        let disk = &disks[0];
        assert!(disk.total_sectors() == 0x1000);

        let data = pattern(2, 11);
        disk.write_blocks_critical(0xffe, &data).unwrap();
        let mut readback = vec![0u8; data.len()];
        disk.read_blocks_critical(0xffe, &mut readback).unwrap();
        assert_eq!(readback, data);
    }

    #[test]
    fn selection_is_cached_between_commands() {
        let mut prdt = [[PrdtEntry::default(); 8]; 2];
        let controller = controller_with(
            [SimSlot::Disk(SimDrive::new(32, false)), SimSlot::Empty],
            [SimSlot::Empty, SimSlot::Empty],
            &mut prdt,
        );
        let disks = controller.enumerate();
        let disk = &disks[0];

        let mut buffer = vec![0u8; ATA_SECTOR_SIZE];
        disk.read_blocks_critical(0, &mut buffer).unwrap();
        let cached = controller.selected_device(0);
        assert_eq!(cached, ATA_DEVICE_MASTER);
        disk.read_blocks_critical(1, &mut buffer).unwrap();
        assert_eq!(controller.selected_device(0), ATA_DEVICE_MASTER);
    }
}
