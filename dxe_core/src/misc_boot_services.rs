//! Miscellaneous boot services
//!
//! `CalculateCrc32` and the `ExitBootServices` sequencing that retires the boot-time half of the
//! firmware.
//!
//! ## License
//!
//! Copyright (c) The Ember Firmware Authors.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::{
    ffi::c_void,
    slice::from_raw_parts,
    sync::atomic::{AtomicBool, Ordering},
};
use r_efi::efi;

use crate::{
    allocator::terminate_memory_map,
    events::{EVENT_DB, EVENT_GROUP_EXIT_BOOT_SERVICES_FAILED},
    interrupts,
    systemtables::SYSTEM_TABLE,
    timer,
};

// set when ExitBootServices completes; boot services are gone from that point on.
static AT_RUNTIME: AtomicBool = AtomicBool::new(false);

/// Returns true once ExitBootServices has completed successfully.
pub fn at_runtime() -> bool {
    AT_RUNTIME.load(Ordering::SeqCst)
}

extern "efiapi" fn calculate_crc32(data: *mut c_void, data_size: usize, crc_32: *mut u32) -> efi::Status {
    if data.is_null() || data_size == 0 || crc_32.is_null() {
        return efi::Status::INVALID_PARAMETER;
    }

    unsafe {
        let buffer = from_raw_parts(data as *mut u8, data_size);
        crc_32.write(crc32fast::hash(buffer));
    }

    efi::Status::SUCCESS
}

pub extern "efiapi" fn exit_boot_services(_handle: efi::Handle, map_key: usize) -> efi::Status {
    static BEFORE_EXIT_SIGNALED: AtomicBool = AtomicBool::new(false);

    log::info!("EBS initiated.");
    // The before-exit listeners run exactly once, even when a stale map key forces the caller to
    // re-fetch the map and retry.
    if !BEFORE_EXIT_SIGNALED.swap(true, Ordering::SeqCst) {
        EVENT_DB.signal_group(efi::EVENT_GROUP_BEFORE_EXIT_BOOT_SERVICES);
    }

    // Terminate memory services. An incomplete or failed EBS call must leave boot services memory
    // allocation functional, so a bad map key signals the failed group and resumes.
    match terminate_memory_map(map_key) {
        Ok(_) => (),
        Err(err) => {
            log::error!("Failed to terminate memory map: {err:?}");
            EVENT_DB.signal_group(EVENT_GROUP_EXIT_BOOT_SERVICES_FAILED);
            return err.into();
        }
    }

    EVENT_DB.signal_group(efi::EVENT_GROUP_EXIT_BOOT_SERVICES);

    interrupts::disable_interrupts();

    timer::disarm_watchdog();

    // Clear non-runtime services from the EFI System Table.
    SYSTEM_TABLE
        .lock()
        .as_mut()
        .expect("The System Table pointer is null. This is invalid.")
        .clear_boot_time_services();

    AT_RUNTIME.store(true, Ordering::SeqCst);

    log::info!("EBS completed successfully.");

    efi::Status::SUCCESS
}

pub fn init_misc_boot_services_support(bs: &mut efi::BootServices) {
    bs.calculate_crc32 = calculate_crc32;
    bs.exit_boot_services = exit_boot_services;
}
