//! Memory Allocation Services
//!
//! The `AllocatePages`/`FreePages`/`AllocatePool`/`FreePool`/`GetMemoryMap` surface of the boot services table,
//! layered over the [`memory map`](crate::memory_map) and the [`pool`](crate::pool).
//!
//! ## License
//!
//! Copyright (c) The Ember Firmware Authors.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::{ffi::c_void, mem, slice::from_raw_parts_mut};

use alloc::vec::Vec;
use r_efi::efi;

use ember_sdk::{base::UEFI_PAGE_SIZE, error::EfiError};

use crate::{
    memory_map::{AllocationStrategy, MEMORY_MAP},
    pool::POOL_DB,
};

/// Size of one reported memory map entry. Callers must use the `descriptor_size` output of `GetMemoryMap` as the
/// stride when walking the map; it is larger than `size_of::<efi::MemoryDescriptor>()` and the pad words after
/// each descriptor are reserved.
pub const MEMORY_MAP_DESCRIPTOR_SIZE: usize = mem::size_of::<efi::MemoryDescriptor>() + 8;

extern "efiapi" fn allocate_pages(
    allocation_type: efi::AllocateType,
    memory_type: efi::MemoryType,
    pages: usize,
    memory: *mut efi::PhysicalAddress,
) -> efi::Status {
    match core_allocate_pages(allocation_type, memory_type, pages, memory) {
        Ok(_) => efi::Status::SUCCESS,
        Err(status) => status.into(),
    }
}

pub fn core_allocate_pages(
    allocation_type: efi::AllocateType,
    memory_type: efi::MemoryType,
    pages: usize,
    memory: *mut efi::PhysicalAddress,
) -> Result<(), EfiError> {
    if memory.is_null() {
        return Err(EfiError::InvalidParameter);
    }

    let strategy = match allocation_type {
        efi::ALLOCATE_ANY_PAGES => AllocationStrategy::AnyPages,
        efi::ALLOCATE_MAX_ADDRESS => {
            let address = unsafe { memory.read() };
            AllocationStrategy::MaxAddress(address)
        }
        efi::ALLOCATE_ADDRESS => {
            let address = unsafe { memory.read() };
            AllocationStrategy::Address(address)
        }
        _ => return Err(EfiError::InvalidParameter),
    };

    let address = MEMORY_MAP.allocate_pages(strategy, memory_type, pages as u64)?;
    unsafe { memory.write(address) };
    Ok(())
}

extern "efiapi" fn free_pages(memory: efi::PhysicalAddress, pages: usize) -> efi::Status {
    match core_free_pages(memory, pages) {
        Ok(_) => efi::Status::SUCCESS,
        Err(status) => status.into(),
    }
}

pub fn core_free_pages(memory: efi::PhysicalAddress, pages: usize) -> Result<(), EfiError> {
    if pages == 0 {
        return Err(EfiError::InvalidParameter);
    }

    let size = match pages.checked_mul(UEFI_PAGE_SIZE) {
        Some(size) => size,
        None => return Err(EfiError::InvalidParameter),
    };

    if memory.checked_add(size as u64).is_none() {
        return Err(EfiError::InvalidParameter);
    }

    if memory.checked_rem(UEFI_PAGE_SIZE as efi::PhysicalAddress) != Some(0) {
        return Err(EfiError::InvalidParameter);
    }

    MEMORY_MAP.free_pages(memory, pages as u64)
}

extern "efiapi" fn allocate_pool(pool_type: efi::MemoryType, size: usize, buffer: *mut *mut c_void) -> efi::Status {
    if buffer.is_null() {
        return efi::Status::INVALID_PARAMETER;
    }

    match core_allocate_pool(pool_type, size) {
        Err(err) => err.into(),
        Ok(allocation) => unsafe {
            buffer.write(allocation);
            efi::Status::SUCCESS
        },
    }
}

pub fn core_allocate_pool(pool_type: efi::MemoryType, size: usize) -> Result<*mut c_void, EfiError> {
    POOL_DB.allocate_pool(pool_type, size)
}

extern "efiapi" fn free_pool(buffer: *mut c_void) -> efi::Status {
    match core_free_pool(buffer) {
        Ok(_) => efi::Status::SUCCESS,
        Err(status) => status.into(),
    }
}

pub fn core_free_pool(buffer: *mut c_void) -> Result<(), EfiError> {
    POOL_DB.free_pool(buffer)
}

extern "efiapi" fn copy_mem(destination: *mut c_void, source: *mut c_void, length: usize) {
    //nothing about this is safe.
    unsafe { core::ptr::copy(source as *mut u8, destination as *mut u8, length) }
}

extern "efiapi" fn set_mem(buffer: *mut c_void, size: usize, value: u8) {
    //nothing about this is safe.
    unsafe {
        let dst_buffer = from_raw_parts_mut(buffer as *mut u8, size);
        dst_buffer.fill(value);
    }
}

extern "efiapi" fn get_memory_map(
    memory_map_size: *mut usize,
    memory_map: *mut efi::MemoryDescriptor,
    map_key: *mut usize,
    descriptor_size: *mut usize,
    descriptor_version: *mut u32,
) -> efi::Status {
    if memory_map_size.is_null() {
        return efi::Status::INVALID_PARAMETER;
    }

    if !descriptor_size.is_null() {
        unsafe { descriptor_size.write(MEMORY_MAP_DESCRIPTOR_SIZE) };
    }

    if !descriptor_version.is_null() {
        unsafe { descriptor_version.write(efi::MEMORY_DESCRIPTOR_VERSION) };
    }

    let map_size = unsafe { *memory_map_size };

    let efi_descriptors: Vec<efi::MemoryDescriptor> = MEMORY_MAP.get_memory_map_descriptors();
    assert_ne!(efi_descriptors.len(), 0);

    let required_map_size = efi_descriptors.len() * MEMORY_MAP_DESCRIPTOR_SIZE;

    unsafe { memory_map_size.write(required_map_size) };

    if map_size < required_map_size {
        return efi::Status::BUFFER_TOO_SMALL;
    }

    if memory_map.is_null() {
        return efi::Status::INVALID_PARAMETER;
    }

    // Descriptors land at stride offsets, not at size_of::<MemoryDescriptor>() offsets, so copy bytes rather than
    // writing through a typed pointer that no one has checked for alignment.
    unsafe {
        let buffer = from_raw_parts_mut(memory_map as *mut u8, required_map_size);
        buffer.fill(0);
        for (index, descriptor) in efi_descriptors.iter().enumerate() {
            let descriptor_bytes = core::ptr::from_ref(descriptor) as *const u8;
            core::ptr::copy(
                descriptor_bytes,
                buffer[index * MEMORY_MAP_DESCRIPTOR_SIZE..].as_mut_ptr(),
                mem::size_of::<efi::MemoryDescriptor>(),
            );
        }

        if !map_key.is_null() {
            map_key.write(MEMORY_MAP.map_key());
        }
    }

    efi::Status::SUCCESS
}

/// Validates a caller-supplied map key and locks the memory map for hand-off. Called from `ExitBootServices`.
pub fn terminate_memory_map(map_key: usize) -> Result<(), EfiError> {
    MEMORY_MAP.terminate(map_key)
}

pub fn install_memory_services(bs: &mut efi::BootServices) {
    bs.allocate_pages = allocate_pages;
    bs.free_pages = free_pages;
    bs.allocate_pool = allocate_pool;
    bs.free_pool = free_pool;
    bs.copy_mem = copy_mem;
    bs.set_mem = set_mem;
    bs.get_memory_map = get_memory_map;
}
