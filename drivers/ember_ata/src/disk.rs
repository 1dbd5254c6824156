//! Per-device disk interface.
//!
//! ## License
//!
//! Copyright (c) The Ember Firmware Authors.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::sync::Arc;

use ember_sdk::error::EfiError;

use crate::dma::DmaSegment;
use crate::pio::PioBuffer;
use crate::regs::{
    AtaCommand, AtaPortIo, IdentifyData, ATA_DEVICE_MASTER, ATA_DEVICE_SLAVE, ATA_MAX_LBA28,
    ATA_MAX_LBA28_SECTOR_COUNT, ATA_SECTOR_SIZE,
};
use crate::AtaController;

/// One disk attached to an [`AtaController`].
///
/// Block-granular reads and writes pick DMA when the channel has a bus
/// master engine and fall back to polled transfers otherwise. The
/// `_critical` variants are for crash-dump paths: always polled, no locks,
/// timed off the direct clock.
pub struct AtaDisk<P: AtaPortIo> {
    controller: Arc<AtaController<P>>,
    channel_index: usize,
    device: u8,
    dma_supported: bool,
    lba48: bool,
    total_sectors: u64,
}

impl<P: AtaPortIo> AtaDisk<P> {
    pub(crate) fn new(
        controller: Arc<AtaController<P>>,
        channel_index: usize,
        device_slot: usize,
        identify: IdentifyData,
    ) -> AtaDisk<P> {
        let channel = &controller.channels[channel_index];
        let dma_supported = channel.bus_master_base.is_some() && !channel.prdt_virt.is_null();
        AtaDisk {
            controller,
            channel_index,
            device: if device_slot == 0 { ATA_DEVICE_MASTER } else { ATA_DEVICE_SLAVE },
            dma_supported,
            lba48: identify.lba48_supported,
            total_sectors: identify.total_sectors,
        }
    }

    pub fn total_sectors(&self) -> u64 {
        self.total_sectors
    }

    pub fn block_size(&self) -> usize {
        ATA_SECTOR_SIZE
    }

    pub fn dma_supported(&self) -> bool {
        self.dma_supported
    }

    fn check_range(&self, lba: u64, bytes: usize) -> Result<u64, EfiError> {
        if bytes == 0 || bytes % ATA_SECTOR_SIZE != 0 {
            return Err(EfiError::InvalidParameter);
        }
        let sectors = (bytes / ATA_SECTOR_SIZE) as u64;
        if lba + sectors > self.total_sectors {
            return Err(EfiError::InvalidParameter);
        }
        Ok(sectors)
    }

    /// Reads whole sectors into `buffer`. The buffer must be a multiple of
    /// the sector size and is treated as identity mapped when the transfer
    /// goes through DMA.
    pub fn read_blocks(&self, lba: u64, buffer: &mut [u8]) -> Result<(), EfiError> {
        let bytes = buffer.len();
        self.check_range(lba, bytes)?;
        if self.dma_supported {
            let segments = [DmaSegment { address: buffer.as_mut_ptr() as u64, size: bytes as u64 }];
            return self.dma_read(lba, &segments, bytes as u64);
        }
        self.pio_read_write(lba, PioBuffer::Read(buffer), false)
    }

    /// Writes whole sectors from `buffer`, flushing the device cache once
    /// the data is transferred.
    pub fn write_blocks(&self, lba: u64, buffer: &[u8]) -> Result<(), EfiError> {
        let bytes = buffer.len();
        self.check_range(lba, bytes)?;
        if self.dma_supported {
            let segments = [DmaSegment { address: buffer.as_ptr() as u64, size: bytes as u64 }];
            return self.dma_write(lba, &segments, bytes as u64);
        }
        self.pio_read_write(lba, PioBuffer::Write(buffer), false)
    }

    /// Crash-dump read: polled, lockless, on the direct clock.
    pub fn read_blocks_critical(&self, lba: u64, buffer: &mut [u8]) -> Result<(), EfiError> {
        self.check_range(lba, buffer.len())?;
        self.pio_read_write(lba, PioBuffer::Read(buffer), true)
    }

    /// Crash-dump write: polled, lockless, on the direct clock.
    pub fn write_blocks_critical(&self, lba: u64, buffer: &[u8]) -> Result<(), EfiError> {
        self.check_range(lba, buffer.len())?;
        self.pio_read_write(lba, PioBuffer::Write(buffer), true)
    }

    /// DMA read from caller-mapped physical fragments.
    pub fn dma_read(&self, lba: u64, segments: &[DmaSegment], total_bytes: u64) -> Result<(), EfiError> {
        self.check_range(lba, total_bytes as usize)?;
        self.controller.dma_transfer(self.channel_index, self.device, lba, self.lba48, segments, total_bytes, false, false)
    }

    /// DMA write to caller-mapped physical fragments, followed by a cache
    /// flush.
    pub fn dma_write(&self, lba: u64, segments: &[DmaSegment], total_bytes: u64) -> Result<(), EfiError> {
        self.check_range(lba, total_bytes as usize)?;
        self.controller.dma_transfer(self.channel_index, self.device, lba, self.lba48, segments, total_bytes, true, true)
    }

    /// Reads an arbitrary byte range, bouncing partial sectors through a
    /// stack buffer.
    pub fn read_bytes(&self, offset: u64, buffer: &mut [u8]) -> Result<(), EfiError> {
        let mut lba = offset / ATA_SECTOR_SIZE as u64;
        let mut head = (offset % ATA_SECTOR_SIZE as u64) as usize;
        let mut remaining = buffer;
        let mut bounce = [0u8; ATA_SECTOR_SIZE];
        while !remaining.is_empty() {
            if head != 0 || remaining.len() < ATA_SECTOR_SIZE {
                let take = remaining.len().min(ATA_SECTOR_SIZE - head);
                self.pio_read_write(lba, PioBuffer::Read(&mut bounce), false)?;
                remaining[..take].copy_from_slice(&bounce[head..head + take]);
                remaining = &mut remaining[take..];
                head = 0;
                lba += 1;
                continue;
            }
            let whole = remaining.len() / ATA_SECTOR_SIZE * ATA_SECTOR_SIZE;
            let (aligned, rest) = remaining.split_at_mut(whole);
            self.pio_read_write(lba, PioBuffer::Read(aligned), false)?;
            lba += (whole / ATA_SECTOR_SIZE) as u64;
            remaining = rest;
        }
        Ok(())
    }

    /// Writes an arbitrary byte range, read-modify-writing partial sectors
    /// through a stack buffer.
    pub fn write_bytes(&self, offset: u64, buffer: &[u8]) -> Result<(), EfiError> {
        let mut lba = offset / ATA_SECTOR_SIZE as u64;
        let mut head = (offset % ATA_SECTOR_SIZE as u64) as usize;
        let mut remaining = buffer;
        let mut bounce = [0u8; ATA_SECTOR_SIZE];
        while !remaining.is_empty() {
            if head != 0 || remaining.len() < ATA_SECTOR_SIZE {
                let take = remaining.len().min(ATA_SECTOR_SIZE - head);
                self.pio_read_write(lba, PioBuffer::Read(&mut bounce), false)?;
                bounce[head..head + take].copy_from_slice(&remaining[..take]);
                self.pio_read_write(lba, PioBuffer::Write(&bounce), false)?;
                remaining = &remaining[take..];
                head = 0;
                lba += 1;
                continue;
            }
            let whole = remaining.len() / ATA_SECTOR_SIZE * ATA_SECTOR_SIZE;
            self.pio_read_write(lba, PioBuffer::Write(&remaining[..whole]), false)?;
            lba += (whole / ATA_SECTOR_SIZE) as u64;
            remaining = &remaining[whole..];
        }
        Ok(())
    }

    /// Flushes the device write cache.
    pub fn flush(&self) -> Result<(), EfiError> {
        let channel = &self.controller.channels[self.channel_index];
        let _guard = channel.lock.lock();
        self.controller.cache_flush(self.channel_index, self.device, false)
    }

    // Polled path, chunked so no command exceeds the 28-bit count limit.
    fn pio_read_write(&self, mut lba: u64, buffer: PioBuffer<'_>, critical: bool) -> Result<(), EfiError> {
        let (mut read_buffer, mut write_buffer) = match buffer {
            PioBuffer::Read(data) => (Some(data), None),
            PioBuffer::Write(data) => (None, Some(data)),
        };
        let total = read_buffer.as_ref().map(|b| b.len()).unwrap_or_else(|| {
            write_buffer.as_ref().map(|b| b.len()).unwrap_or(0)
        });
        let mut offset = 0usize;
        while offset < total {
            let chunk_sectors =
                (((total - offset) / ATA_SECTOR_SIZE) as u64).min(ATA_MAX_LBA28_SECTOR_COUNT);
            let chunk_bytes = (chunk_sectors as usize) * ATA_SECTOR_SIZE;
            let lba48 = self.lba48 && lba + chunk_sectors > ATA_MAX_LBA28 + 1;
            if !self.lba48 && lba + chunk_sectors > ATA_MAX_LBA28 + 1 {
                return Err(EfiError::InvalidParameter);
            }
            let is_write = write_buffer.is_some();
            let command = match (is_write, lba48) {
                (false, false) => AtaCommand::ReadPio28,
                (false, true) => AtaCommand::ReadPio48,
                (true, false) => AtaCommand::WritePio28,
                (true, true) => AtaCommand::WritePio48,
            };
            let chunk = match (&mut read_buffer, &write_buffer) {
                (Some(data), _) => PioBuffer::Read(&mut data[offset..offset + chunk_bytes]),
                (None, Some(data)) => PioBuffer::Write(&data[offset..offset + chunk_bytes]),
                (None, None) => return Err(EfiError::InvalidParameter),
            };
            self.controller.pio_command(
                self.channel_index,
                self.device,
                command,
                lba,
                lba48,
                chunk_sectors,
                chunk,
                critical,
            )?;
            offset += chunk_bytes;
            lba += chunk_sectors;
        }
        Ok(())
    }
}
