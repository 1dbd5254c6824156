//! Pool allocator
//!
//! Bucketed free-list heap layered over the page allocator. Each memory type gets its own pool; free entries are
//! kept in per-size buckets in 128-byte steps up to one page, and larger requests go straight to the page
//! allocator. Every pool object carries a header and tail sentinel so corruption is caught at free time.
//!
//! ## License
//!
//! Copyright (c) The Ember Firmware Authors.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::{ffi::c_void, mem};

use alloc::collections::BTreeMap;
use r_efi::efi;

use ember_sdk::{base::UEFI_PAGE_SIZE, error::EfiError, uefi_size_to_pages};

use crate::{
    memory_map::{AllocationStrategy, MEMORY_MAP},
    tpl_lock,
};

const POOL_HEADER_MAGIC: u32 = 0x6C50_6D45;
const POOL_TAIL_MAGIC: u32 = 0x6C54_6D45;

// Free-list granularity. One bucket per 128-byte step up to a page.
const POOL_GRANULARITY: usize = 128;
const POOL_BUCKET_COUNT: usize = UEFI_PAGE_SIZE / POOL_GRANULARITY;

// Every pool object is laid out as [PoolHeader][caller data...][PoolTail]; `size` in both sentinels is the full
// object size including the overhead.
#[repr(C)]
struct PoolHeader {
    magic: u32,
    memory_type: efi::MemoryType,
    size: usize,
}

#[repr(C)]
struct PoolTail {
    magic: u32,
    reserved: u32,
    size: usize,
}

const POOL_OVERHEAD: usize = mem::size_of::<PoolHeader>() + mem::size_of::<PoolTail>();

// A free entry re-uses the storage of the freed object; `bucket` is the index the entry is filed under.
#[repr(C)]
struct PoolFreeEntry {
    next: *mut PoolFreeEntry,
    bucket: usize,
}

struct Pool {
    buckets: [*mut PoolFreeEntry; POOL_BUCKET_COUNT],
    used_bytes: usize,
}

impl Pool {
    const fn new() -> Self {
        Pool { buckets: [core::ptr::null_mut(); POOL_BUCKET_COUNT], used_bytes: 0 }
    }

    // Files a free chunk of `size` bytes (a POOL_GRANULARITY multiple) under its bucket.
    //
    // Safety: the chunk must be exclusively owned by the pool and at least `size` bytes.
    unsafe fn push_free_entry(&mut self, chunk: *mut u8, size: usize) {
        debug_assert!(size >= POOL_GRANULARITY && size % POOL_GRANULARITY == 0 && size <= UEFI_PAGE_SIZE);
        let bucket = size / POOL_GRANULARITY - 1;
        let entry = chunk as *mut PoolFreeEntry;
        unsafe {
            (*entry).next = self.buckets[bucket];
            (*entry).bucket = bucket;
        }
        self.buckets[bucket] = entry;
    }

    // Pops a free entry from the smallest bucket that satisfies `size`, returning the chunk and its actual size.
    fn pop_free_entry(&mut self, size: usize) -> Option<(*mut u8, usize)> {
        let first_bucket = size / POOL_GRANULARITY - 1;
        for bucket in first_bucket..POOL_BUCKET_COUNT {
            let entry = self.buckets[bucket];
            if entry.is_null() {
                continue;
            }
            debug_assert_eq!(unsafe { (*entry).bucket }, bucket);
            self.buckets[bucket] = unsafe { (*entry).next };
            return Some((entry as *mut u8, (bucket + 1) * POOL_GRANULARITY));
        }
        None
    }
}

struct PoolDb {
    // Previously unseen (vendor) memory types get a pool record on first use.
    pools: BTreeMap<efi::MemoryType, Pool>,
}

impl PoolDb {
    const fn new() -> Self {
        PoolDb { pools: BTreeMap::new() }
    }

    fn pool_for_type(&mut self, memory_type: efi::MemoryType) -> &mut Pool {
        self.pools.entry(memory_type).or_insert_with(Pool::new)
    }
}

/// TPL-locked pool allocator instance.
pub struct SpinLockedPoolDb {
    inner: tpl_lock::TplMutex<PoolDb>,
}

impl SpinLockedPoolDb {
    pub const fn new() -> Self {
        SpinLockedPoolDb { inner: tpl_lock::TplMutex::new(efi::TPL_NOTIFY, PoolDb::new(), "PoolLock") }
    }

    fn lock(&self) -> tpl_lock::TplGuard<PoolDb> {
        self.inner.lock()
    }

    /// Allocates `size` bytes of pool of the given memory type.
    ///
    /// ## Errors
    ///
    /// Returns `InvalidParameter` for a type that cannot be allocated, and `OutOfResources` when the page
    /// allocator cannot supply backing pages.
    pub fn allocate_pool(&self, pool_type: efi::MemoryType, size: usize) -> Result<*mut c_void, EfiError> {
        let total = (size + POOL_OVERHEAD + POOL_GRANULARITY - 1) & !(POOL_GRANULARITY - 1);

        let (chunk, total) = if total > UEFI_PAGE_SIZE {
            // oversized requests go straight to the page allocator.
            let pages = uefi_size_to_pages!(total);
            let address = MEMORY_MAP.allocate_pages(AllocationStrategy::AnyPages, pool_type, pages as u64)?;
            (address as usize as *mut u8, pages * UEFI_PAGE_SIZE)
        } else {
            let mut db = self.lock();
            let pool = db.pool_for_type(pool_type);
            match pool.pop_free_entry(total) {
                Some((chunk, entry_size)) => {
                    // slice any leftover back into a smaller bucket.
                    let leftover = entry_size - total;
                    if leftover >= POOL_GRANULARITY {
                        unsafe { pool.push_free_entry(chunk.add(total), leftover) };
                    }
                    (chunk, total)
                }
                None => {
                    // drop the lock while the page allocator runs; it takes the memory lock itself.
                    drop(db);
                    let address = MEMORY_MAP.allocate_pages(AllocationStrategy::AnyPages, pool_type, 1)?;
                    let page = address as usize as *mut u8;
                    let mut db = self.lock();
                    let pool = db.pool_for_type(pool_type);
                    // carve this request from the front of the page and file the remainder as a free entry.
                    let remainder = UEFI_PAGE_SIZE - total;
                    if remainder >= POOL_GRANULARITY {
                        unsafe { pool.push_free_entry(page.add(total), remainder) };
                    }
                    (page, total)
                }
            }
        };

        let mut db = self.lock();
        db.pool_for_type(pool_type).used_bytes += total;
        drop(db);

        unsafe {
            let header = chunk as *mut PoolHeader;
            header.write(PoolHeader { magic: POOL_HEADER_MAGIC, memory_type: pool_type, size: total });
            let tail = chunk.add(total - mem::size_of::<PoolTail>()) as *mut PoolTail;
            tail.write(PoolTail { magic: POOL_TAIL_MAGIC, reserved: 0, size: total });
            Ok(chunk.add(mem::size_of::<PoolHeader>()) as *mut c_void)
        }
    }

    /// Frees a pool allocation, validating both sentinels.
    ///
    /// ## Errors
    ///
    /// Returns `InvalidParameter` for a null buffer or when the header or tail sentinel is corrupt.
    pub fn free_pool(&self, buffer: *mut c_void) -> Result<(), EfiError> {
        if buffer.is_null() {
            return Err(EfiError::InvalidParameter);
        }

        let chunk = unsafe { (buffer as *mut u8).sub(mem::size_of::<PoolHeader>()) };
        let (memory_type, size) = unsafe {
            let header = &*(chunk as *const PoolHeader);
            if header.magic != POOL_HEADER_MAGIC {
                log::error!("pool header corruption at {:#x?}", chunk);
                return Err(EfiError::InvalidParameter);
            }
            let tail = &*(chunk.add(header.size - mem::size_of::<PoolTail>()) as *const PoolTail);
            if tail.magic != POOL_TAIL_MAGIC || tail.size != header.size {
                log::error!("pool tail corruption at {:#x?}", chunk);
                return Err(EfiError::InvalidParameter);
            }
            (header.memory_type, header.size)
        };

        let mut db = self.lock();
        let pool = db.pool_for_type(memory_type);
        pool.used_bytes = pool.used_bytes.saturating_sub(size);

        if size > UEFI_PAGE_SIZE {
            drop(db);
            MEMORY_MAP.free_pages(chunk as usize as u64, uefi_size_to_pages!(size) as u64)
        } else {
            unsafe { pool.push_free_entry(chunk, size) };
            Ok(())
        }
    }

    /// Returns the bytes currently allocated from the pool of the given memory type.
    pub fn used_bytes(&self, memory_type: efi::MemoryType) -> usize {
        self.lock().pools.get(&memory_type).map(|pool| pool.used_bytes).unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn reset(&self) {
        self.lock().pools.clear();
    }
}

impl Default for SpinLockedPoolDb {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for SpinLockedPoolDb {}
unsafe impl Sync for SpinLockedPoolDb {}

/// The global pool allocator.
pub static POOL_DB: SpinLockedPoolDb = SpinLockedPoolDb::new();
