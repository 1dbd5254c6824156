//! Bus master DMA descriptor tables and transfer state.
//!
//! ## License
//!
//! Copyright (c) The Ember Firmware Authors.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;

use ember_sdk::error::EfiError;

use crate::regs::{ATA_DMA_BOUNDARY, ATA_SECTOR_SIZE};

/// End-of-table flag in a physical region descriptor.
pub const PRDT_END_OF_TABLE: u16 = 0x8000;

/// One entry of a bus master physical region descriptor table. A size of
/// zero encodes a 64KiB transfer.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct PrdtEntry {
    pub address: u32,
    pub size: u16,
    pub flags: u16,
}

/// A physically contiguous fragment of a DMA buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaSegment {
    pub address: u64,
    pub size: u64,
}

/// Fills a PRDT from `segments`, skipping the first `skip_bytes` of the
/// buffer and describing at most `max_bytes`. Returns the number of bytes the
/// table covers.
///
/// Descriptor addresses must be sector aligned and below 4GiB, and no
/// descriptor may cross a 64KiB physical boundary, so fragments get split
/// where they straddle one. The last emitted entry carries the end-of-table
/// flag.
pub fn build_prdt(
    prdt: &mut [PrdtEntry],
    segments: &[DmaSegment],
    skip_bytes: u64,
    max_bytes: u64,
) -> Result<u64, EfiError> {
    let boundary_of = |address: u64| address & !(ATA_DMA_BOUNDARY - 1);

    let mut entry_index = 0;
    let mut covered = 0u64;
    let mut remaining_skip = skip_bytes;
    for segment in segments {
        let mut address = segment.address;
        let mut size = segment.size;
        if remaining_skip >= size {
            remaining_skip -= size;
            continue;
        }
        address += remaining_skip;
        size -= remaining_skip;
        remaining_skip = 0;

        while size != 0 && covered < max_bytes {
            if entry_index == prdt.len() {
                break;
            }
            if address > u32::MAX as u64 || address % ATA_SECTOR_SIZE as u64 != 0 {
                return Err(EfiError::InvalidParameter);
            }

            let mut piece = size.min(max_bytes - covered).min(ATA_DMA_BOUNDARY);
            if boundary_of(address) != boundary_of(address + piece - 1)
                && (address + piece) % ATA_DMA_BOUNDARY != 0
            {
                piece = boundary_of(address) + ATA_DMA_BOUNDARY - address;
            }
            if piece % ATA_SECTOR_SIZE as u64 != 0 {
                return Err(EfiError::InvalidParameter);
            }

            prdt[entry_index] = PrdtEntry {
                address: address as u32,
                // 64KiB is encoded as zero.
                size: if piece == ATA_DMA_BOUNDARY { 0 } else { piece as u16 },
                flags: 0,
            };
            entry_index += 1;
            address += piece;
            size -= piece;
            covered += piece;
        }
        if covered == max_bytes || entry_index == prdt.len() {
            break;
        }
    }

    if entry_index == 0 {
        return Err(EfiError::InvalidParameter);
    }
    prdt[entry_index - 1].flags |= PRDT_END_OF_TABLE;
    Ok(covered)
}

/// State of a DMA transfer in progress on a channel. Guarded by the
/// controller's transfer state lock and shared between the submitting thread
/// and the interrupt service path.
pub(crate) struct DmaRequest {
    /// Device select code of the target device.
    pub device: u8,
    pub lba: u64,
    pub segments: Vec<DmaSegment>,
    pub total_bytes: u64,
    pub bytes_completed: u64,
    /// Bytes covered by the round currently programmed into the hardware.
    pub in_flight: u64,
    pub write: bool,
    /// Whether a cache flush should follow the final write round.
    pub synchronized: bool,
    /// Whether the rounds use the 48-bit command variants.
    pub lba48: bool,
    pub outcome: Option<Result<(), EfiError>>,
}
