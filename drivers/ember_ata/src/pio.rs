//! Polled (PIO) command execution.
//!
//! ## License
//!
//! Copyright (c) The Ember Firmware Authors.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use ember_sdk::error::EfiError;

use crate::regs::{
    deadline_after, AtaCommand, AtaControl, AtaPortIo, AtaRegister, AtaStatus, BusMasterStatus,
    ATA_SECTOR_SIZE, ATA_TIMEOUT_SECONDS,
};
use crate::AtaController;

/// Direction and payload of a PIO transfer.
pub(crate) enum PioBuffer<'a> {
    Read(&'a mut [u8]),
    Write(&'a [u8]),
}

impl<P: AtaPortIo> AtaController<P> {
    /// Issues a command and transfers its data a sector at a time through the
    /// data port, polling status between sectors. Used for IDENTIFY, for
    /// devices without bus master support, and for crash-dump I/O.
    pub(crate) fn pio_command(
        &self,
        channel_index: usize,
        device: u8,
        command: AtaCommand,
        lba: u64,
        lba48: bool,
        mut sector_count: u64,
        mut buffer: PioBuffer<'_>,
        critical: bool,
    ) -> Result<(), EfiError> {
        let channel = &self.channels[channel_index];
        // Crash-dump I/O runs with the scheduler dead, so it cannot block on
        // the submitter lock.
        let _guard = (!critical).then(|| channel.lock.lock());
        let clock = self.clock(critical);

        // An interrupt bit latched by an earlier transfer would confuse the
        // completion check at the end.
        if channel.bus_master_base.is_some() {
            channel.write_register(
                &self.ports,
                AtaRegister::BusMasterStatus,
                (BusMasterStatus::INTERRUPT | BusMasterStatus::ERROR).bits(),
            );
        }

        channel.select_device(&self.ports, clock, device)?;
        let identify = matches!(command, AtaCommand::Identify | AtaCommand::IdentifyPacket);
        if identify {
            sector_count = 1;
        }
        // A full-size transfer wraps to zero in the count register.
        channel.setup_command(&self.ports, device, lba48, lba, sector_count as u16, 0);
        channel.write_register(&self.ports, AtaRegister::Control, AtaControl::INTERRUPT_DISABLE.bits());
        channel.write_command(&self.ports, command);
        channel.stall(&self.ports);

        let is_write = matches!(&buffer, PioBuffer::Write(_));
        let mut offset = 0usize;
        let deadline = deadline_after(clock, ATA_TIMEOUT_SECONDS * 1_000_000);
        while sector_count != 0 {
            let status = AtaStatus::from_bits_retain(channel.read_register(&self.ports, AtaRegister::STATUS));
            // An empty slot answers IDENTIFY with an all-zero status.
            if identify && status.is_empty() {
                return Err(EfiError::NotFound);
            }
            if status.intersects(AtaStatus::ERROR_MASK) {
                return Err(EfiError::DeviceError);
            }
            if (status.bits() & AtaStatus::BUSY_MASK.bits()) != AtaStatus::DATA_REQUEST.bits() {
                if clock.ticks() >= deadline {
                    return Err(EfiError::Timeout);
                }
                core::hint::spin_loop();
                continue;
            }

            // Word-wide transfer of one sector through the data port.
            match buffer {
                PioBuffer::Read(ref mut data) => {
                    for chunk in data[offset..offset + ATA_SECTOR_SIZE].chunks_exact_mut(2) {
                        chunk.copy_from_slice(&channel.read_data(&self.ports).to_le_bytes());
                    }
                }
                PioBuffer::Write(data) => {
                    for chunk in data[offset..offset + ATA_SECTOR_SIZE].chunks_exact(2) {
                        channel.write_data(&self.ports, u16::from_le_bytes([chunk[0], chunk[1]]));
                    }
                }
            }
            offset += ATA_SECTOR_SIZE;
            channel.stall(&self.ports);
            sector_count -= 1;
        }

        // The final status read must show the command retired cleanly.
        let status = AtaStatus::from_bits_retain(channel.read_register(&self.ports, AtaRegister::STATUS));
        if status.intersects(AtaStatus::ERROR_MASK | AtaStatus::DATA_REQUEST) {
            return Err(EfiError::DeviceError);
        }
        if channel.bus_master_base.is_some() {
            let bus_master =
                BusMasterStatus::from_bits_retain(channel.read_register(&self.ports, AtaRegister::BusMasterStatus));
            if bus_master.intersects(BusMasterStatus::ERROR) {
                return Err(EfiError::DeviceError);
            }
        }

        // Polled writes bypass the interrupt-driven flush, so flush here.
        if is_write {
            self.cache_flush(channel_index, device, critical)?;
        }
        Ok(())
    }

    /// Issues a cache flush and polls it to completion. Callers must already
    /// hold the submitter lock (or be in crash-dump mode).
    pub(crate) fn cache_flush(&self, channel_index: usize, device: u8, critical: bool) -> Result<(), EfiError> {
        let channel = &self.channels[channel_index];
        let clock = self.clock(critical);

        channel.select_device(&self.ports, clock, device)?;
        channel.write_command(&self.ports, AtaCommand::CacheFlush28);
        channel.stall(&self.ports);

        let deadline = deadline_after(clock, ATA_TIMEOUT_SECONDS * 1_000_000);
        loop {
            let status = AtaStatus::from_bits_retain(channel.read_register(&self.ports, AtaRegister::STATUS));
            if status.intersects(AtaStatus::ERROR_MASK) {
                log::warn!("ata: cache flush failed on channel {channel_index}, status {status:?}");
                return Err(EfiError::DeviceError);
            }
            if !status.intersects(AtaStatus::BUSY_MASK) {
                return Ok(());
            }
            if clock.ticks() >= deadline {
                log::warn!("ata: cache flush timed out on channel {channel_index}");
                return Err(EfiError::Timeout);
            }
            core::hint::spin_loop();
        }
    }
}
