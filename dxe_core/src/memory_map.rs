//! Memory map and typed page allocator
//!
//! The memory map is the authoritative ledger of physical memory: an ordered
//! list of typed, page-granular ranges. Page allocation and free are expressed
//! as type conversions on this list, so the map reported at ExitBootServices is
//! always the ground truth.
//!
//! ## License
//!
//! Copyright (c) The Ember Firmware Authors.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;

use r_efi::efi;

use ember_sdk::{
    base::{UEFI_PAGE_SIZE, align_down},
    error::EfiError,
};

use crate::{events, tpl_lock};

// Per the UEFI spec, AARCH64 runtime ranges are allocated on 64KB boundaries in units of 64KB to accommodate
// OSes that use 16KB or 64KB page sizes. Other architectures have no additional granularity requirements.
#[cfg(target_arch = "aarch64")]
pub(crate) const RUNTIME_PAGE_ALLOCATION_GRANULARITY: usize = ember_sdk::base::SIZE_64KB;
#[cfg(not(target_arch = "aarch64"))]
pub(crate) const RUNTIME_PAGE_ALLOCATION_GRANULARITY: usize = UEFI_PAGE_SIZE;

// Number of on-hand descriptor slots available during a mutation. Adding a descriptor can itself require an
// allocation, which requires a consistent map; mutations park new descriptors in these slots and a flush moves
// them to heap storage after the top-level operation completes.
const MAX_TEMPORARY_DESCRIPTORS: usize = 6;

// First memory type value not defined by the UEFI spec.
const MAX_MEMORY_TYPE: u32 = 16;

// Start of the vendor-defined memory type range.
const VENDOR_MEMORY_TYPE_BASE: u32 = 0x80000000;

/// Returns the required allocation alignment for the given memory type.
pub(crate) fn allocation_granularity(memory_type: efi::MemoryType) -> usize {
    match memory_type {
        efi::RESERVED_MEMORY_TYPE
        | efi::RUNTIME_SERVICES_CODE
        | efi::RUNTIME_SERVICES_DATA
        | efi::ACPI_RECLAIM_MEMORY
        | efi::ACPI_MEMORY_NVS => RUNTIME_PAGE_ALLOCATION_GRANULARITY,
        _ => UEFI_PAGE_SIZE,
    }
}

fn is_runtime_type(memory_type: efi::MemoryType) -> bool {
    matches!(memory_type, efi::RUNTIME_SERVICES_CODE | efi::RUNTIME_SERVICES_DATA)
}

// Memory types that cannot be the target of an allocation request.
fn is_valid_allocation_type(memory_type: efi::MemoryType) -> bool {
    match memory_type {
        efi::CONVENTIONAL_MEMORY | efi::UNUSABLE_MEMORY | efi::PERSISTENT_MEMORY | efi::UNACCEPTED_MEMORY_TYPE => false,
        t if t >= MAX_MEMORY_TYPE && t < VENDOR_MEMORY_TYPE_BASE => false,
        _ => true,
    }
}

/// A typed range of physical memory covering whole pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub memory_type: efi::MemoryType,
    pub physical_start: efi::PhysicalAddress,
    pub page_count: u64,
    pub attributes: u64,
}

impl MemoryRange {
    /// Exclusive end address of the range.
    pub fn end(&self) -> efi::PhysicalAddress {
        self.physical_start + self.page_count * UEFI_PAGE_SIZE as u64
    }
}

// Per-type allocation statistics. `base..=max` is the type's preferred bin; allocations of the type are clustered
// there so the memory map stays reproducible across boots (which keeps S4 resume happy). `special` bins get their
// type substituted back over free ranges in the reported map.
#[derive(Debug, Clone, Copy)]
struct MemoryTypeStats {
    base: efi::PhysicalAddress,
    max: efi::PhysicalAddress,
    current_pages: u64,
    info_index: usize,
    special: bool,
    runtime: bool,
}

impl MemoryTypeStats {
    const EMPTY: Self =
        MemoryTypeStats { base: 0, max: 0, current_pages: 0, info_index: usize::MAX, special: false, runtime: false };

    fn has_bin(&self) -> bool {
        self.max != 0
    }
}

/// Placement strategy for a page allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStrategy {
    /// Any free range satisfying the size.
    AnyPages,
    /// Any free range whose last byte is at or below the given address.
    MaxAddress(efi::PhysicalAddress),
    /// Exactly the given address.
    Address(efi::PhysicalAddress),
}

pub(crate) struct MemoryMap {
    // Permanent descriptor storage, kept sorted by physical start, disjoint, and coalesced.
    descriptors: Vec<MemoryRange>,
    // On-hand descriptor slots used during mutation. See MAX_TEMPORARY_DESCRIPTORS.
    temporaries: [Option<MemoryRange>; MAX_TEMPORARY_DESCRIPTORS],
    // guards flush_temporaries against re-entry.
    flushing: bool,
    // bumped on every mutation; returned to callers as proof-of-freshness.
    map_key: usize,
    stats: [MemoryTypeStats; MAX_MEMORY_TYPE as usize],
    // exclusive upper bound of the default bin (everything below the lowest seeded bin).
    default_bin_end: efi::PhysicalAddress,
}

impl MemoryMap {
    const fn new() -> Self {
        MemoryMap {
            descriptors: Vec::new(),
            temporaries: [None; MAX_TEMPORARY_DESCRIPTORS],
            flushing: false,
            map_key: 0,
            stats: [MemoryTypeStats::EMPTY; MAX_MEMORY_TYPE as usize],
            default_bin_end: efi::PhysicalAddress::MAX,
        }
    }

    // Records a range in the map, extending an adjacent descriptor of matching (type, attributes) where possible,
    // otherwise parking a new descriptor in a temporary slot. Bumps the map key.
    //
    // The caller must guarantee that [start, end) does not overlap any existing descriptor.
    fn add_range(
        &mut self,
        memory_type: efi::MemoryType,
        start: efi::PhysicalAddress,
        end: efi::PhysicalAddress,
        attributes: u64,
    ) -> Result<(), EfiError> {
        debug_assert!(start < end);
        debug_assert_eq!(start as usize & (UEFI_PAGE_SIZE - 1), 0);
        debug_assert_eq!(end as usize & (UEFI_PAGE_SIZE - 1), 0);

        self.map_key += 1;

        let pages = (end - start) / UEFI_PAGE_SIZE as u64;

        for descriptor in
            self.descriptors.iter_mut().chain(self.temporaries.iter_mut().filter_map(|slot| slot.as_mut()))
        {
            if descriptor.memory_type != memory_type || descriptor.attributes != attributes {
                continue;
            }
            if descriptor.end() == start {
                descriptor.page_count += pages;
                return Ok(());
            }
            if descriptor.physical_start == end {
                descriptor.physical_start = start;
                descriptor.page_count += pages;
                return Ok(());
            }
        }

        match self.temporaries.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(MemoryRange { memory_type, physical_start: start, page_count: pages, attributes });
                Ok(())
            }
            None => {
                log::error!("memory map temporary descriptor slots exhausted adding {:#x?}..{:#x?}", start, end);
                Err(EfiError::OutOfResources)
            }
        }
    }

    // Moves temporary descriptors into permanent storage and coalesces the map. Called after every top-level
    // mutation; the flushing flag keeps a flush-triggered allocation from recursing into another flush.
    fn flush_temporaries(&mut self) {
        if self.flushing {
            return;
        }
        self.flushing = true;

        for slot in 0..self.temporaries.len() {
            let Some(range) = self.temporaries[slot].take() else {
                continue;
            };
            let position =
                self.descriptors.partition_point(|descriptor| descriptor.physical_start < range.physical_start);
            self.descriptors.insert(position, range);
        }

        // merge adjacent descriptors with identical (type, attributes).
        let mut index = 0;
        while index + 1 < self.descriptors.len() {
            let next = self.descriptors[index + 1];
            let current = &mut self.descriptors[index];
            if current.end() == next.physical_start
                && current.memory_type == next.memory_type
                && current.attributes == next.attributes
            {
                current.page_count += next.page_count;
                self.descriptors.remove(index + 1);
            } else {
                index += 1;
            }
        }

        self.flushing = false;
    }

    // Returns the index of the descriptor wholly containing [start, end), if any.
    fn containing_descriptor(&self, start: efi::PhysicalAddress, end: efi::PhysicalAddress) -> Option<usize> {
        self.descriptors
            .iter()
            .position(|descriptor| descriptor.physical_start <= start && end <= descriptor.end())
    }

    // The only routine that changes a range's type. The range must lie wholly within a single descriptor;
    // conversions to free must come from a non-free type and conversions away from free must come from free.
    // Splits the containing descriptor as needed and maintains per-type page counters.
    fn convert_pages(
        &mut self,
        start: efi::PhysicalAddress,
        pages: u64,
        new_type: efi::MemoryType,
    ) -> Result<(), EfiError> {
        let end = start + pages * UEFI_PAGE_SIZE as u64;
        let index = self.containing_descriptor(start, end).ok_or(EfiError::NotFound)?;
        let old = self.descriptors[index];

        if new_type == efi::CONVENTIONAL_MEMORY {
            if old.memory_type == efi::CONVENTIONAL_MEMORY {
                return Err(EfiError::InvalidParameter);
            }
        } else if old.memory_type != efi::CONVENTIONAL_MEMORY {
            return Err(EfiError::InvalidParameter);
        }

        // free memory is the complement of the allocated types; only the allocated side is counted.
        if old.memory_type != efi::CONVENTIONAL_MEMORY && (old.memory_type as usize) < self.stats.len() {
            self.stats[old.memory_type as usize].current_pages =
                self.stats[old.memory_type as usize].current_pages.saturating_sub(pages);
        }
        if new_type != efi::CONVENTIONAL_MEMORY && (new_type as usize) < self.stats.len() {
            self.stats[new_type as usize].current_pages += pages;
        }

        self.descriptors.remove(index);

        if old.physical_start < start {
            self.add_range(old.memory_type, old.physical_start, start, old.attributes)?;
        }
        self.add_range(new_type, start, end, old.attributes)?;
        if end < old.end() {
            self.add_range(old.memory_type, end, old.end(), old.attributes)?;
        }

        Ok(())
    }

    // Finds the highest free range of the requested size within [min, max_end), aligned as requested.
    fn find_free_range(
        &self,
        min: efi::PhysicalAddress,
        max_end: efi::PhysicalAddress,
        pages: u64,
        alignment: usize,
    ) -> Option<efi::PhysicalAddress> {
        let size = pages * UEFI_PAGE_SIZE as u64;
        for descriptor in self.descriptors.iter().rev() {
            if descriptor.memory_type != efi::CONVENTIONAL_MEMORY {
                continue;
            }
            let window_start = descriptor.physical_start.max(min);
            let window_end = descriptor.end().min(max_end);
            if window_end < size || window_start > window_end - size {
                continue;
            }
            let candidate = align_down(window_end - size, alignment as u64);
            if candidate >= window_start {
                return Some(candidate);
            }
        }
        None
    }

    fn allocate_pages(
        &mut self,
        strategy: AllocationStrategy,
        memory_type: efi::MemoryType,
        pages: u64,
    ) -> Result<efi::PhysicalAddress, EfiError> {
        if pages == 0 || !is_valid_allocation_type(memory_type) {
            return Err(EfiError::InvalidParameter);
        }
        let alignment = allocation_granularity(memory_type);
        let size = pages * UEFI_PAGE_SIZE as u64;

        match strategy {
            AllocationStrategy::Address(address) => {
                if address % alignment as u64 != 0 {
                    return Err(EfiError::NotFound);
                }
                let end = address.checked_add(size).ok_or(EfiError::InvalidParameter)?;
                let index = self.containing_descriptor(address, end).ok_or(EfiError::NotFound)?;
                if self.descriptors[index].memory_type != efi::CONVENTIONAL_MEMORY {
                    return Err(EfiError::NotFound);
                }
                self.convert_pages(address, pages, memory_type)?;
                Ok(address)
            }
            AllocationStrategy::AnyPages | AllocationStrategy::MaxAddress(_) => {
                let cap = match strategy {
                    AllocationStrategy::MaxAddress(max) => max.saturating_add(1),
                    _ => efi::PhysicalAddress::MAX,
                };

                // search the type's own bin first, then the default bin, then anywhere under the cap.
                let bin = self.stats.get(memory_type as usize).copied().unwrap_or(MemoryTypeStats::EMPTY);
                let windows = [
                    bin.has_bin().then_some((bin.base, bin.max.saturating_add(1).min(cap))),
                    Some((0, self.default_bin_end.min(cap))),
                    Some((0, cap)),
                ];

                for (min, max_end) in windows.into_iter().flatten() {
                    if let Some(address) = self.find_free_range(min, max_end, pages, alignment) {
                        self.convert_pages(address, pages, memory_type)?;
                        return Ok(address);
                    }
                }
                Err(EfiError::OutOfResources)
            }
        }
    }

    fn free_pages(&mut self, address: efi::PhysicalAddress, pages: u64) -> Result<(), EfiError> {
        let size = pages.checked_mul(UEFI_PAGE_SIZE as u64).ok_or(EfiError::InvalidParameter)?;
        let end = address.checked_add(size).ok_or(EfiError::InvalidParameter)?;
        let index = self.containing_descriptor(address, end).ok_or(EfiError::NotFound)?;
        let memory_type = self.descriptors[index].memory_type;
        if memory_type == efi::CONVENTIONAL_MEMORY {
            return Err(EfiError::NotFound);
        }
        if address % allocation_granularity(memory_type) as u64 != 0 {
            return Err(EfiError::InvalidParameter);
        }
        self.convert_pages(address, pages, efi::CONVENTIONAL_MEMORY)
    }

    // Seeds the per-type statistics bins from the platform's memory type information table. Each type's bin is
    // carved by allocating it top-down and freeing it back, which reserves a reproducible address window without
    // leaving anything allocated. The default bin is everything below the lowest seeded bin.
    fn init_memory_type_statistics(&mut self, type_info: &[(efi::MemoryType, u64)]) {
        for stats in self.stats.iter_mut() {
            *stats = MemoryTypeStats::EMPTY;
        }

        // Pre-allocate every bin before freeing any of them back, so successive bins stack downward instead of
        // re-claiming the same top of memory.
        let mut seeded: [Option<(efi::MemoryType, efi::PhysicalAddress, u64)>; MAX_MEMORY_TYPE as usize] =
            [None; MAX_MEMORY_TYPE as usize];
        for (info_index, &(memory_type, pages)) in type_info.iter().enumerate() {
            if pages == 0 || memory_type >= MAX_MEMORY_TYPE {
                continue;
            }
            let address = match self.allocate_pages(AllocationStrategy::AnyPages, memory_type, pages) {
                Ok(address) => address,
                Err(err) => {
                    log::error!("failed to seed memory bin for type {:#x?}: {:?}", memory_type, err);
                    continue;
                }
            };
            self.flush_temporaries();
            let stats = &mut self.stats[memory_type as usize];
            stats.base = address;
            stats.max = address + pages * UEFI_PAGE_SIZE as u64 - 1;
            stats.info_index = info_index;
            stats.special = true;
            stats.runtime = is_runtime_type(memory_type);
            seeded[memory_type as usize] = Some((memory_type, address, pages));
        }

        for (memory_type, address, pages) in seeded.into_iter().flatten() {
            if let Err(err) = self.free_pages(address, pages) {
                log::error!("failed to release seeded memory bin for type {:#x?}: {:?}", memory_type, err);
            }
            self.flush_temporaries();
            let stats = self.stats[memory_type as usize];
            log::info!(
                "memory bin {} for type {:#x?}: {:#x?}..{:#x?}",
                stats.info_index,
                memory_type,
                stats.base,
                stats.max
            );
        }

        self.default_bin_end =
            self.stats.iter().filter(|stats| stats.has_bin()).map(|stats| stats.base).min().unwrap_or(u64::MAX);
    }

    // Produces the reported view of the map: free ranges wholly inside a special type's bin are reported as that
    // type (so the OS sees a stable map across boots), and runtime-marked types get the runtime attribute bit.
    fn get_memory_map_descriptors(&self) -> Vec<efi::MemoryDescriptor> {
        self.descriptors
            .iter()
            .map(|descriptor| {
                let mut memory_type = descriptor.memory_type;
                let mut attributes = descriptor.attributes;
                if memory_type == efi::CONVENTIONAL_MEMORY {
                    for (bin_type, stats) in self.stats.iter().enumerate() {
                        if stats.special
                            && descriptor.physical_start >= stats.base
                            && descriptor.end() - 1 <= stats.max
                        {
                            memory_type = bin_type as u32;
                            if stats.runtime {
                                attributes |= efi::MEMORY_RUNTIME;
                            }
                            break;
                        }
                    }
                }
                if is_runtime_type(memory_type) {
                    attributes |= efi::MEMORY_RUNTIME;
                }
                efi::MemoryDescriptor {
                    r#type: memory_type,
                    physical_start: descriptor.physical_start,
                    virtual_start: 0,
                    number_of_pages: descriptor.page_count,
                    attribute: attributes,
                }
            })
            .collect()
    }

    // Validates the map for hand-off. The caller's key must match, ACPI ranges must not carry the runtime
    // attribute, and runtime-attributed ranges must meet the runtime alignment.
    fn terminate(&self, map_key: usize) -> Result<(), EfiError> {
        if map_key != self.map_key {
            return Err(EfiError::InvalidParameter);
        }
        for descriptor in self.descriptors.iter() {
            let acpi_type =
                matches!(descriptor.memory_type, efi::ACPI_RECLAIM_MEMORY | efi::ACPI_MEMORY_NVS);
            let runtime_attr = descriptor.attributes & efi::MEMORY_RUNTIME != 0;
            if acpi_type && runtime_attr {
                log::error!("ACPI descriptor at {:#x?} carries the runtime attribute", descriptor.physical_start);
                return Err(EfiError::InvalidParameter);
            }
            if runtime_attr && descriptor.physical_start % RUNTIME_PAGE_ALLOCATION_GRANULARITY as u64 != 0 {
                log::error!("runtime descriptor at {:#x?} is not runtime-aligned", descriptor.physical_start);
                return Err(EfiError::InvalidParameter);
            }
        }
        Ok(())
    }
}

/// TPL-locked memory map instance.
///
/// This is the access point for all interaction with the memory map. The map is a global singleton, so access
/// is only allowed through this structure, which guards it with the memory lock at TPL_NOTIFY.
pub struct SpinLockedMemoryMap {
    inner: tpl_lock::TplMutex<MemoryMap>,
}

impl SpinLockedMemoryMap {
    pub const fn new() -> Self {
        SpinLockedMemoryMap { inner: tpl_lock::TplMutex::new(efi::TPL_NOTIFY, MemoryMap::new(), "MemoryLock") }
    }

    fn lock(&self) -> tpl_lock::TplGuard<MemoryMap> {
        self.inner.lock()
    }

    /// Adds a range of memory to the map with the given type and attributes.
    ///
    /// The range must be page-aligned and must not overlap any range already in the map. Used at init to describe
    /// the platform's memory, and to report ranges discovered after init.
    pub fn add_range(
        &self,
        memory_type: efi::MemoryType,
        start: efi::PhysicalAddress,
        end: efi::PhysicalAddress,
        attributes: u64,
    ) -> Result<(), EfiError> {
        {
            let mut map = self.lock();
            map.add_range(memory_type, start, end, attributes)?;
            map.flush_temporaries();
        }
        events::memory_map_changed();
        Ok(())
    }

    /// Allocates pages of the given type per the given placement strategy.
    ///
    /// Searches top-down: the highest qualifying free range wins. `AnyPages` prefers the type's statistics bin,
    /// then the default bin, then anywhere.
    ///
    /// ## Errors
    ///
    /// Returns `InvalidParameter` for a type that cannot be allocated, `NotFound` when an `Address` request does
    /// not land in free memory, and `OutOfResources` when no free range satisfies the request.
    pub fn allocate_pages(
        &self,
        strategy: AllocationStrategy,
        memory_type: efi::MemoryType,
        pages: u64,
    ) -> Result<efi::PhysicalAddress, EfiError> {
        let result = {
            let mut map = self.lock();
            let result = map.allocate_pages(strategy, memory_type, pages);
            map.flush_temporaries();
            result
        };
        if result.is_ok() {
            events::memory_map_changed();
        }
        result
    }

    /// Frees pages previously allocated with [`allocate_pages`](SpinLockedMemoryMap::allocate_pages).
    ///
    /// ## Errors
    ///
    /// Returns `NotFound` if the range is not an allocated range in the map, and `InvalidParameter` if the address
    /// does not meet the alignment of the range's type.
    pub fn free_pages(&self, address: efi::PhysicalAddress, pages: u64) -> Result<(), EfiError> {
        {
            let mut map = self.lock();
            map.free_pages(address, pages)?;
            map.flush_temporaries();
        }
        events::memory_map_changed();
        Ok(())
    }

    /// Seeds the per-type statistics bins from the platform memory type information table.
    pub fn init_memory_type_statistics(&self, type_info: &[(efi::MemoryType, u64)]) {
        {
            let mut map = self.lock();
            map.init_memory_type_statistics(type_info);
            map.flush_temporaries();
        }
        events::memory_map_changed();
    }

    /// Returns the current map key. The key changes on every mutation.
    pub fn map_key(&self) -> usize {
        self.lock().map_key
    }

    /// Returns the number of pages currently allocated for the given built-in memory type.
    pub fn page_count_for_type(&self, memory_type: efi::MemoryType) -> u64 {
        self.lock().stats.get(memory_type as usize).map(|stats| stats.current_pages).unwrap_or(0)
    }

    /// Returns the reported view of the map as EFI memory descriptors.
    pub fn get_memory_map_descriptors(&self) -> Vec<efi::MemoryDescriptor> {
        self.lock().get_memory_map_descriptors()
    }

    /// Validates the map for hand-off at ExitBootServices. See [`MemoryMap::terminate`].
    pub fn terminate(&self, map_key: usize) -> Result<(), EfiError> {
        self.lock().terminate(map_key)
    }

    /// Raw view of the map for diagnostics and tests.
    pub fn ranges(&self) -> Vec<MemoryRange> {
        self.lock().descriptors.clone()
    }

    #[cfg(test)]
    pub(crate) fn reset(&self) {
        let mut map = self.lock();
        *map = MemoryMap::new();
    }
}

impl Default for SpinLockedMemoryMap {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for SpinLockedMemoryMap {}
unsafe impl Sync for SpinLockedMemoryMap {}

/// The global memory map.
pub static MEMORY_MAP: SpinLockedMemoryMap = SpinLockedMemoryMap::new();
