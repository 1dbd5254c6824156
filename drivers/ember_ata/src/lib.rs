//! # Ember ATA
//!
//! ATA/IDE disk driver for the Ember firmware core. Supports polled (PIO)
//! transfers, bus master DMA with physical region descriptor tables, and a
//! crash-dump ("critical") mode that performs polled I/O without taking
//! locks or depending on the scheduler.
//!
//! The driver is generic over [`AtaPortIo`], the port access trait the
//! platform implements over real I/O ports, which also lets the full command
//! flow run against a simulated drive in tests.
//!
//! ## License
//!
//! Copyright (c) The Ember Firmware Authors.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

extern crate alloc;

mod channel;
mod disk;
mod dma;
mod pio;
mod regs;

#[cfg(test)]
mod test_support;

pub use channel::{AtaChannelConfig, PrdtRegion};
pub use disk::AtaDisk;
pub use dma::{build_prdt, DmaSegment, PrdtEntry, PRDT_END_OF_TABLE};
pub use regs::{
    AtaClock, AtaPortIo, IdentifyData, ATA_LEGACY_PRIMARY_CONTROL_BASE, ATA_LEGACY_PRIMARY_IO_BASE,
    ATA_LEGACY_SECONDARY_CONTROL_BASE, ATA_LEGACY_SECONDARY_IO_BASE, ATA_SECTOR_SIZE,
};

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use ember_sdk::error::EfiError;

use channel::AtaChannel;
use dma::DmaRequest;
use pio::PioBuffer;
use regs::{
    deadline_after, AtaCommand, AtaRegister, AtaStatus, BusMasterCommand, BusMasterStatus,
    ATA_DEVICE_MASTER, ATA_DEVICE_SLAVE, ATA_MAX_LBA28, ATA_MAX_LBA28_SECTOR_COUNT,
    ATA_MAX_LBA48_SECTOR_COUNT, ATA_PATAPI_SIGNATURE, ATA_SATA_SIGNATURE, ATA_TIMEOUT_SECONDS,
};

// Time the channels are given to settle after a software reset.
const ATA_RESET_DELAY_MICROSECONDS: u64 = 2_000;

// Bus master bits the interrupt handler cares about.
const BUS_MASTER_PENDING_MASK: u8 = BusMasterStatus::INTERRUPT.bits() | BusMasterStatus::ERROR.bits();

/// Register placement of a controller's two channels.
#[derive(Debug, Clone, Copy)]
pub struct AtaControllerConfig {
    pub channels: [AtaChannelConfig; 2],
}

impl AtaControllerConfig {
    /// Configuration for a controller decoding the legacy ISA ports, with
    /// optional bus master registers from the PCI interface.
    pub fn legacy(bus_master_base: Option<u16>, prdt: [Option<PrdtRegion>; 2]) -> AtaControllerConfig {
        AtaControllerConfig {
            channels: [
                AtaChannelConfig {
                    io_base: ATA_LEGACY_PRIMARY_IO_BASE,
                    control_base: ATA_LEGACY_PRIMARY_CONTROL_BASE,
                    bus_master_base,
                    prdt: prdt[0],
                },
                AtaChannelConfig {
                    io_base: ATA_LEGACY_SECONDARY_IO_BASE,
                    control_base: ATA_LEGACY_SECONDARY_CONTROL_BASE,
                    bus_master_base: bus_master_base.map(|base| base + 8),
                    prdt: prdt[1],
                },
            ],
        }
    }
}

/// A dual-channel ATA controller.
///
/// The platform wires the interrupt line to [`AtaController::interrupt_service`]
/// and a deferred dispatch to [`AtaController::dispatch_pending`]; on
/// platforms without a usable line the blocking submitters pump both
/// themselves, which turns DMA completion into a poll of the bus master
/// status register.
pub struct AtaController<P: AtaPortIo> {
    pub(crate) ports: P,
    pub(crate) channels: [AtaChannel; 2],
    clock: Box<dyn AtaClock>,
    /// Clock safe to read with interrupts masked. Crash-dump I/O uses this
    /// one exclusively.
    direct_clock: Box<dyn AtaClock>,
    /// Interrupt bits latched by [`Self::interrupt_service`] and not yet
    /// dispatched. Channel 0 in the low byte, channel 1 in the next.
    pending_status: AtomicU32,
    /// Active DMA transfer per channel, shared between submitters and the
    /// dispatch path. Held only for short register-programming sections.
    transfer_state: spin::Mutex<[Option<DmaRequest>; 2]>,
}

impl<P: AtaPortIo> AtaController<P> {
    pub fn new(
        ports: P,
        config: &AtaControllerConfig,
        clock: Box<dyn AtaClock>,
        direct_clock: Box<dyn AtaClock>,
    ) -> AtaController<P> {
        AtaController {
            ports,
            channels: [AtaChannel::new(&config.channels[0]), AtaChannel::new(&config.channels[1])],
            clock,
            direct_clock,
            pending_status: AtomicU32::new(0),
            transfer_state: spin::Mutex::new([None, None]),
        }
    }

    /// The underlying port access implementation.
    pub fn ports(&self) -> &P {
        &self.ports
    }

    #[cfg(test)]
    pub(crate) fn channel_lock(&self, channel_index: usize) -> spin::MutexGuard<'_, ()> {
        self.channels[channel_index].lock.lock()
    }

    #[cfg(test)]
    pub(crate) fn selected_device(&self, channel_index: usize) -> u8 {
        self.channels[channel_index].selected_device.load(Ordering::Relaxed)
    }

    pub(crate) fn clock(&self, critical: bool) -> &dyn AtaClock {
        if critical {
            self.direct_clock.as_ref()
        } else {
            self.clock.as_ref()
        }
    }

    fn delay(&self, microseconds: u64) {
        let deadline = deadline_after(self.clock(false), microseconds);
        while self.clock(false).ticks() < deadline {
            core::hint::spin_loop();
        }
    }

    /// Resets both channels and quiesces the bus master engine.
    pub fn reset(&self) {
        for channel in &self.channels {
            channel.write_register(
                &self.ports,
                AtaRegister::Control,
                (regs::AtaControl::SOFTWARE_RESET | regs::AtaControl::INTERRUPT_DISABLE).bits(),
            );
        }
        self.delay(ATA_RESET_DELAY_MICROSECONDS);
        for channel in &self.channels {
            channel.write_register(&self.ports, AtaRegister::Control, regs::AtaControl::INTERRUPT_DISABLE.bits());
            channel.read_register(&self.ports, AtaRegister::STATUS);
            if channel.bus_master_base.is_some() {
                channel.write_register(&self.ports, AtaRegister::BusMasterStatus, BUS_MASTER_PENDING_MASK);
                channel.write_register(&self.ports, AtaRegister::BusMasterCommand, 0);
            }
        }
    }

    /// Identifies the device in the given slot (0 master, 1 slave) of a
    /// channel. Packet and SATA devices answer with their signature instead
    /// of IDENTIFY data and are reported as unsupported.
    pub fn identify(&self, channel_index: usize, device_slot: usize) -> Result<IdentifyData, EfiError> {
        let device = if device_slot == 0 { ATA_DEVICE_MASTER } else { ATA_DEVICE_SLAVE };
        let mut response = [0u8; ATA_SECTOR_SIZE];
        let result = self.pio_command(
            channel_index,
            device,
            AtaCommand::Identify,
            0,
            false,
            1,
            PioBuffer::Read(&mut response),
            false,
        );

        if let Err(error) = result {
            let channel = &self.channels[channel_index];
            let signature = (
                channel.read_register(&self.ports, AtaRegister::Lba1),
                channel.read_register(&self.ports, AtaRegister::Lba2),
            );
            if signature == ATA_PATAPI_SIGNATURE || signature == ATA_SATA_SIGNATURE {
                log::info!(
                    "ata: channel {channel_index} slot {device_slot} answered with signature {signature:02x?}, not a disk"
                );
                return Err(EfiError::Unsupported);
            }
            return Err(error);
        }

        Ok(regs::parse_identify(&response))
    }

    /// Probes all four device slots and returns a disk for each one that
    /// answers IDENTIFY.
    pub fn enumerate(self: &Arc<Self>) -> Vec<AtaDisk<P>> {
        let mut disks = Vec::new();
        for channel_index in 0..self.channels.len() {
            for device_slot in 0..2 {
                match self.identify(channel_index, device_slot) {
                    Ok(identify) => {
                        log::info!(
                            "ata: channel {channel_index} slot {device_slot}: {} sectors, lba48 {}",
                            identify.total_sectors,
                            identify.lba48_supported
                        );
                        disks.push(AtaDisk::new(self.clone(), channel_index, device_slot, identify));
                    }
                    Err(EfiError::NotFound) => {}
                    Err(error) => {
                        log::warn!("ata: channel {channel_index} slot {device_slot} identify failed: {error:?}");
                    }
                }
            }
        }
        disks
    }

    /// Interrupt service routine. Reads and clears the bus master status of
    /// each channel and latches the bits for [`Self::dispatch_pending`].
    /// Returns whether the interrupt belonged to this controller.
    pub fn interrupt_service(&self) -> bool {
        let mut pending = 0u32;
        for (channel_index, channel) in self.channels.iter().enumerate() {
            if channel.bus_master_base.is_none() {
                continue;
            }
            let status = channel.read_register(&self.ports, AtaRegister::BusMasterStatus);
            let bits = status & BUS_MASTER_PENDING_MASK;
            if bits != 0 {
                // Write-one-to-clear, then stop the engine.
                channel.write_register(&self.ports, AtaRegister::BusMasterStatus, bits);
                channel.write_register(&self.ports, AtaRegister::BusMasterCommand, 0);
                pending |= (bits as u32) << (channel_index * 8);
            }
        }
        if pending == 0 {
            return false;
        }
        self.pending_status.fetch_or(pending, Ordering::AcqRel);
        true
    }

    /// Deferred half of the interrupt path. Consumes the latched status bits
    /// and advances or completes the affected transfers.
    pub fn dispatch_pending(&self) {
        let pending = self.pending_status.swap(0, Ordering::AcqRel);
        if pending == 0 {
            return;
        }
        let mut state = self.transfer_state.lock();
        for channel_index in 0..self.channels.len() {
            let bits = ((pending >> (channel_index * 8)) as u8) & BUS_MASTER_PENDING_MASK;
            self.service_channel(&mut state, channel_index, bits);
        }
    }

    fn service_channel(&self, state: &mut [Option<DmaRequest>; 2], channel_index: usize, bits: u8) {
        if bits == 0 {
            return;
        }
        let Some(request) = state[channel_index].as_mut() else {
            return;
        };
        if request.in_flight == 0 {
            return;
        }
        let in_flight = request.in_flight;
        request.in_flight = 0;

        // Reading the status register acknowledges the device interrupt.
        let status =
            AtaStatus::from_bits_retain(self.channels[channel_index].read_register(&self.ports, AtaRegister::STATUS));
        if bits & BusMasterStatus::ERROR.bits() != 0 || status.intersects(AtaStatus::ERROR_MASK) {
            request.outcome = Some(Err(EfiError::DeviceError));
            return;
        }
        if bits & BusMasterStatus::INTERRUPT.bits() == 0 {
            // Spurious latch; re-arm the round that was in flight.
            request.in_flight = in_flight;
            return;
        }

        request.bytes_completed += in_flight;
        if request.bytes_completed < request.total_bytes {
            if let Err(error) = self.start_dma_round(state, channel_index) {
                if let Some(request) = state[channel_index].as_mut() {
                    request.outcome = Some(Err(error));
                }
            }
            return;
        }

        let needs_flush = request.write && request.synchronized;
        let device = request.device;
        let outcome = if needs_flush { self.cache_flush(channel_index, device, false) } else { Ok(()) };
        if let Some(request) = state[channel_index].as_mut() {
            request.outcome = Some(outcome);
        }
    }

    /// Programs the next round of an active DMA transfer into the hardware.
    /// Callers hold the transfer state lock.
    fn start_dma_round(&self, state: &mut [Option<DmaRequest>; 2], channel_index: usize) -> Result<(), EfiError> {
        let request = state[channel_index].as_mut().ok_or(EfiError::NotFound)?;
        let channel = &self.channels[channel_index];
        let clock = self.clock(false);

        let lba = request.lba + request.bytes_completed / ATA_SECTOR_SIZE as u64;
        let lba48 = request.lba48;
        let max_sectors =
            if lba48 { ATA_MAX_LBA48_SECTOR_COUNT } else { ATA_MAX_LBA28_SECTOR_COUNT };
        let remaining = request.total_bytes - request.bytes_completed;
        let max_bytes = remaining.min(max_sectors * ATA_SECTOR_SIZE as u64);

        // The PRDT lives in identity-mapped memory the platform set aside at
        // configuration time.
        let prdt =
            unsafe { core::slice::from_raw_parts_mut(channel.prdt_virt, channel.prdt_entries) };
        let covered = build_prdt(prdt, &request.segments, request.bytes_completed, max_bytes)?;
        let sectors = covered / ATA_SECTOR_SIZE as u64;

        channel.select_device(&self.ports, clock, request.device)?;
        channel.setup_command(&self.ports, request.device, lba48, lba, sectors as u16, 0);
        // DMA completion is interrupt driven, so unmask the channel.
        channel.write_register(&self.ports, AtaRegister::Control, 0);
        let command = match (request.write, lba48) {
            (false, false) => AtaCommand::ReadDma28,
            (false, true) => AtaCommand::ReadDma48,
            (true, false) => AtaCommand::WriteDma28,
            (true, true) => AtaCommand::WriteDma48,
        };
        channel.write_command(&self.ports, command);
        channel.write_prdt_pointer(&self.ports, channel.prdt_phys);
        channel.write_register(&self.ports, AtaRegister::BusMasterStatus, BUS_MASTER_PENDING_MASK);
        let mut bus_master = BusMasterCommand::DMA_ENABLE;
        if !request.write {
            bus_master |= BusMasterCommand::DMA_READ;
        }
        request.in_flight = covered;
        channel.write_register(&self.ports, AtaRegister::BusMasterCommand, bus_master.bits());
        Ok(())
    }

    /// Runs a complete DMA transfer and blocks until it finishes. The
    /// submitter pumps the interrupt and dispatch paths itself, so completion
    /// does not depend on the platform's interrupt wiring.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn dma_transfer(
        &self,
        channel_index: usize,
        device: u8,
        lba: u64,
        lba48_supported: bool,
        segments: &[DmaSegment],
        total_bytes: u64,
        write: bool,
        synchronized: bool,
    ) -> Result<(), EfiError> {
        if total_bytes == 0 || total_bytes % ATA_SECTOR_SIZE as u64 != 0 {
            return Err(EfiError::InvalidParameter);
        }
        let channel = &self.channels[channel_index];
        if channel.bus_master_base.is_none() || channel.prdt_virt.is_null() {
            return Err(EfiError::Unsupported);
        }
        let total_sectors = total_bytes / ATA_SECTOR_SIZE as u64;
        if lba + total_sectors > ATA_MAX_LBA28 + 1 && !lba48_supported {
            return Err(EfiError::InvalidParameter);
        }
        let lba48 = lba48_supported
            && (lba + total_sectors > ATA_MAX_LBA28 + 1 || total_sectors > ATA_MAX_LBA28_SECTOR_COUNT);

        let _guard = channel.lock.lock();
        {
            let mut state = self.transfer_state.lock();
            state[channel_index] = Some(DmaRequest {
                device,
                lba,
                segments: segments.to_vec(),
                total_bytes,
                bytes_completed: 0,
                in_flight: 0,
                write,
                synchronized,
                lba48,
                outcome: None,
            });
            if let Err(error) = self.start_dma_round(&mut state, channel_index) {
                state[channel_index] = None;
                return Err(error);
            }
        }

        let deadline = deadline_after(self.clock(false), ATA_TIMEOUT_SECONDS * 1_000_000);
        loop {
            self.interrupt_service();
            self.dispatch_pending();
            {
                let mut state = self.transfer_state.lock();
                let finished = state[channel_index].as_ref().is_some_and(|request| request.outcome.is_some());
                if finished {
                    let request = state[channel_index].take().ok_or(EfiError::NotFound)?;
                    return request.outcome.unwrap_or(Err(EfiError::DeviceError));
                }
            }
            if self.clock(false).ticks() >= deadline {
                let mut state = self.transfer_state.lock();
                state[channel_index] = None;
                channel.write_register(&self.ports, AtaRegister::BusMasterCommand, 0);
                return Err(EfiError::Timeout);
            }
            core::hint::spin_loop();
        }
    }
}
