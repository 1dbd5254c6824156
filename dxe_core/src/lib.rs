//! Ember DXE Core
//!
//! A pure Rust implementation of the core UEFI boot services environment: the
//! memory map and pool allocator, the event/TPL/timer machinery, the handle
//! and protocol database with driver-model dispatch, and the boot and runtime
//! service tables.
//!
//! The core is brought up in two phases. [`Core::initialize`] seeds the memory
//! map from the platform's range descriptions and publishes the system table
//! with every boot service installed; the returned [`CorePostInit`] accepts
//! configuration that requires a working allocator, such as the hardware tick
//! source backing `Stall` and the timer queue.
//!
//! ## Examples
//!
//! ``` rust,no_run
//! let ranges = [ember_dxe_core::MemoryRange {
//!     memory_type: r_efi::efi::CONVENTIONAL_MEMORY,
//!     start: 0x1000_0000,
//!     end: 0x2000_0000,
//!     attributes: 0,
//! }];
//! ember_dxe_core::Core::default().initialize(&ranges, &[]);
//! ```
//!
//! ## License
//!
//! Copyright (c) The Ember Firmware Authors.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(all(not(feature = "std"), not(test)), no_std)]

extern crate alloc;

mod allocator;
mod driver_services;
mod event_db;
mod events;
mod memory_map;
mod misc_boot_services;
mod pool;
mod protocol_db;
mod protocols;
mod systemtables;
mod timer;
mod tpl_lock;

pub mod config_tables;
pub mod interrupts;

#[cfg(test)]
pub(crate) mod test_support;

use alloc::boxed::Box;
use r_efi::efi;

pub use events::timer_tick;
pub use misc_boot_services::at_runtime;
pub use timer::HardwareTick;

/// Describes one physical memory range handed to the core at initialization.
pub struct MemoryRange {
    pub memory_type: efi::MemoryType,
    pub start: efi::PhysicalAddress,
    pub end: efi::PhysicalAddress,
    pub attributes: u64,
}

/// The initialization phase of the core.
///
/// No allocations may be made until [initialize](Core::initialize) has seeded
/// the memory map, so this phase carries no heap-backed configuration.
#[derive(Default)]
pub struct Core;

impl Core {
    /// Seeds the memory map, publishes the system table, and installs every
    /// boot service.
    ///
    /// `memory_type_info` optionally pre-reserves page bins for the given
    /// memory types so their allocations stay address-stable across boots.
    pub fn initialize(self, memory_ranges: &[MemoryRange], memory_type_info: &[(efi::MemoryType, u64)]) -> CorePostInit {
        for range in memory_ranges {
            memory_map::MEMORY_MAP
                .add_range(range.memory_type, range.start, range.end, range.attributes)
                .expect("Failed to seed the memory map from the platform range descriptions.");
        }
        memory_map::MEMORY_MAP.init_memory_type_statistics(memory_type_info);

        log::info!("memory map seeded: {} ranges", memory_ranges.len());

        protocols::PROTOCOL_DB.init_protocol_db();

        systemtables::init_system_table();
        {
            let mut st = systemtables::SYSTEM_TABLE.lock();
            let st = st.as_mut().expect("System Table not initialized!");

            let bs = st.boot_services_mut();
            allocator::install_memory_services(bs);
            events::init_events_support(bs);
            timer::init_timer_support(bs);
            protocols::init_protocol_support(bs);
            driver_services::init_driver_services(bs);
            misc_boot_services::init_misc_boot_services_support(bs);
            config_tables::init_config_tables_support(bs);

            // re-checksum the system tables after the above initialization.
            st.checksum_all();
        }

        let mut st = systemtables::SYSTEM_TABLE.lock();
        let bs = st.as_mut().expect("System Table not initialized!").boot_services_mut() as *mut efi::BootServices;
        drop(st);
        tpl_lock::init_boot_services(bs);

        log::info!("boot services published");

        CorePostInit::new()
    }
}

/// The configuration phase of the core, entered once allocations are
/// available.
pub struct CorePostInit;

impl CorePostInit {
    fn new() -> Self {
        Self
    }

    /// Registers the free-running hardware counter that backs `Stall` and the
    /// timer queue.
    pub fn with_tick_source(self, source: Box<dyn HardwareTick + Send>) -> Self {
        timer::register_tick_source(source);
        self
    }

    /// Pointer to the published system table, suitable for handing to loaded
    /// images.
    pub fn system_table(&self) -> *const efi::SystemTable {
        let st = systemtables::SYSTEM_TABLE.lock();
        st.as_ref().expect("System Table not initialized!").as_ptr()
    }
}
