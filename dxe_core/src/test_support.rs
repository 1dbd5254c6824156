//! Core Test Support
//!
//! Shared scaffolding for unit tests against the core's global state.
//!
//! ## License
//!
//! Copyright (c) The Ember Firmware Authors.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::ffi::c_void;
use core::ptr;
use r_efi::efi;
use std::any::Any;

use crate::memory_map::MEMORY_MAP;

/// A global mutex that can be used for tests to synchronize on access to global state.
/// Usage model is for tests that affect or assert things against global state to acquire this mutex to ensure that
/// other tests run in parallel do not modify or interact with global state non-deterministically.
/// The test should acquire the mutex when it starts to care about or modify global state, and release it when it no
/// longer cares about global state or modifies it (typically this would be the start and end of a test case,
/// respectively).
static GLOBAL_STATE_TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

/// All tests should run from inside this.
pub(crate) fn with_global_lock<F: Fn() + std::panic::RefUnwindSafe>(f: F) -> Result<(), Box<dyn Any + Send>> {
    let _guard = GLOBAL_STATE_TEST_LOCK.lock().unwrap();
    std::panic::catch_unwind(|| {
        f();
    })
}

// default backing allocation for the test memory map.
const TEST_MEMORY_MAP_ATTRIBUTES: u64 = efi::MEMORY_UC
    | efi::MEMORY_WC
    | efi::MEMORY_WT
    | efi::MEMORY_WB
    | efi::MEMORY_WP
    | efi::MEMORY_RP
    | efi::MEMORY_XP
    | efi::MEMORY_RO;

/// Reset the global memory map and seed it with a chunk of host memory from the system allocator, so that
/// subsystems layered on the page allocator (e.g. the pool) hand out pointers that are actually writable.
/// Note: for simplicity, this implementation intentionally leaks the backing memory. Expectation is that this
/// should be called few enough times in testing so that this leak does not cause problems.
pub(crate) unsafe fn init_test_memory_map(pages: usize) {
    let size = pages * ember_sdk::base::UEFI_PAGE_SIZE;
    let addr = unsafe { alloc::alloc::alloc(alloc::alloc::Layout::from_size_align(size, 0x1000).unwrap()) };
    MEMORY_MAP.reset();
    MEMORY_MAP
        .add_range(efi::CONVENTIONAL_MEMORY, addr as u64, addr as u64 + size as u64, TEST_MEMORY_MAP_ATTRIBUTES)
        .unwrap();
}

/// Reset the global protocol database to a pristine initialized state (well-known handles installed).
pub(crate) unsafe fn init_test_protocol_db() {
    unsafe { crate::protocols::PROTOCOL_DB.reset() };
    crate::protocols::PROTOCOL_DB.init_protocol_db();
}

extern "efiapi" fn dummy_raise_tpl(_new_tpl: efi::Tpl) -> efi::Tpl {
    0
}
extern "efiapi" fn dummy_restore_tpl(_old_tpl: efi::Tpl) {}
extern "efiapi" fn dummy_allocate_pages(
    _allocation_type: u32,
    _memory_type: u32,
    _pages: usize,
    _memory: *mut u64,
) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_free_pages(_memory: u64, _pages: usize) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_get_memory_map(
    _memory_map_size: *mut usize,
    _memory_map: *mut efi::MemoryDescriptor,
    _map_key: *mut usize,
    _descriptor_size: *mut usize,
    _descriptor_version: *mut u32,
) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_allocate_pool(_pool_type: u32, _size: usize, _buffer: *mut *mut c_void) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_free_pool(_buffer: *mut c_void) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_create_event(
    _event_type: u32,
    _notify_tpl: efi::Tpl,
    _notify_function: Option<efi::EventNotify>,
    _notify_context: *mut c_void,
    _event: *mut efi::Event,
) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_set_timer(_event: efi::Event, _type: u32, _trigger_time: u64) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_wait_for_event(
    _number_of_events: usize,
    _event: *mut efi::Event,
    _index: *mut usize,
) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_signal_event(_event: efi::Event) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_close_event(_event: efi::Event) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_check_event(_event: efi::Event) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_install_protocol_interface(
    _handle: *mut efi::Handle,
    _protocol: *mut efi::Guid,
    _interface_type: u32,
    _interface: *mut c_void,
) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_reinstall_protocol_interface(
    _handle: efi::Handle,
    _protocol: *mut efi::Guid,
    _old_interface: *mut c_void,
    _new_interface: *mut c_void,
) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_uninstall_protocol_interface(
    _handle: efi::Handle,
    _protocol: *mut efi::Guid,
    _interface: *mut c_void,
) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_handle_protocol(
    _handle: efi::Handle,
    _protocol: *mut efi::Guid,
    _interface: *mut *mut c_void,
) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_register_protocol_notify(
    _protocol: *mut efi::Guid,
    _event: efi::Event,
    _registration: *mut *mut c_void,
) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_locate_handle(
    _search_type: u32,
    _protocol: *mut efi::Guid,
    _search_key: *mut c_void,
    _buffer_size: *mut usize,
    _buffer: *mut efi::Handle,
) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_locate_device_path(
    _protocol: *mut efi::Guid,
    _device_path: *mut *mut r_efi::protocols::device_path::Protocol,
    _device: *mut efi::Handle,
) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_install_configuration_table(_guid: *mut efi::Guid, _table: *mut c_void) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_load_image(
    _boot_policy: efi::Boolean,
    _parent_image_handle: efi::Handle,
    _device_path: *mut r_efi::protocols::device_path::Protocol,
    _source_buffer: *mut c_void,
    _source_size: usize,
    _image_handle: *mut efi::Handle,
) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_start_image(
    _image_handle: efi::Handle,
    _exit_data_size: *mut usize,
    _exit_data: *mut *mut u16,
) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_exit(
    _image_handle: efi::Handle,
    _exit_status: efi::Status,
    _exit_data_size: usize,
    _exit_data: *mut u16,
) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_unload_image(_image_handle: efi::Handle) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_exit_boot_services(_image_handle: efi::Handle, _map_key: usize) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_get_next_monotonic_count(_count: *mut u64) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_stall(_microseconds: usize) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_set_watchdog_timer(
    _timeout: usize,
    _watchdog_code: u64,
    _data_size: usize,
    _watchdog_data: *mut u16,
) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_connect_controller(
    _controller_handle: efi::Handle,
    _driver_image_handle: *mut efi::Handle,
    _remaining_device_path: *mut r_efi::protocols::device_path::Protocol,
    _recursive: efi::Boolean,
) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_disconnect_controller(
    _controller_handle: efi::Handle,
    _driver_image_handle: efi::Handle,
    _child_handle: efi::Handle,
) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_open_protocol(
    _handle: efi::Handle,
    _protocol: *mut efi::Guid,
    _interface: *mut *mut c_void,
    _agent_handle: efi::Handle,
    _controller_handle: efi::Handle,
    _attributes: u32,
) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_close_protocol(
    _handle: efi::Handle,
    _protocol: *mut efi::Guid,
    _agent_handle: efi::Handle,
    _controller_handle: efi::Handle,
) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_open_protocol_information(
    _handle: efi::Handle,
    _protocol: *mut efi::Guid,
    _entry_buffer: *mut *mut efi::OpenProtocolInformationEntry,
    _entry_count: *mut usize,
) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_protocols_per_handle(
    _handle: efi::Handle,
    _protocol_buffer: *mut *mut *mut efi::Guid,
    _protocol_buffer_count: *mut usize,
) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_locate_handle_buffer(
    _search_type: u32,
    _protocol: *mut efi::Guid,
    _search_key: *mut c_void,
    _no_handles: *mut usize,
    _buffer: *mut *mut efi::Handle,
) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_locate_protocol(
    _protocol: *mut efi::Guid,
    _registration: *mut c_void,
    _interface: *mut *mut c_void,
) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_install_multiple_protocol_interfaces(
    _handle: *mut efi::Handle,
    _args: *mut c_void,
    _more_args: *mut c_void,
) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_uninstall_multiple_protocol_interfaces(
    _handle: efi::Handle,
    _args: *mut c_void,
    _more_args: *mut c_void,
) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_calculate_crc32(_data: *mut c_void, _data_size: usize, _crc32: *mut u32) -> efi::Status {
    efi::Status::SUCCESS
}
extern "efiapi" fn dummy_copy_mem(_destination: *mut c_void, _source: *mut c_void, _length: usize) {}
extern "efiapi" fn dummy_set_mem(_buffer: *mut c_void, _size: usize, _value: u8) {}
extern "efiapi" fn dummy_create_event_ex(
    _event_type: u32,
    _notify_tpl: efi::Tpl,
    _notify_function: Option<efi::EventNotify>,
    _notify_context: *const c_void,
    _event_group: *const efi::Guid,
    _event: *mut efi::Event,
) -> efi::Status {
    efi::Status::SUCCESS
}

/// Builds a boot services table filled with inert stand-ins, for tests that exercise the `init_*_support`
/// installers and the table plumbing.
pub(crate) fn mock_boot_services() -> efi::BootServices {
    efi::BootServices {
        hdr: efi::TableHeader { signature: 0, revision: 0, header_size: 0, crc32: 0, reserved: 0 },
        raise_tpl: dummy_raise_tpl,
        restore_tpl: dummy_restore_tpl,
        allocate_pages: dummy_allocate_pages,
        free_pages: dummy_free_pages,
        get_memory_map: dummy_get_memory_map,
        allocate_pool: dummy_allocate_pool,
        free_pool: dummy_free_pool,
        create_event: dummy_create_event,
        set_timer: dummy_set_timer,
        wait_for_event: dummy_wait_for_event,
        signal_event: dummy_signal_event,
        close_event: dummy_close_event,
        check_event: dummy_check_event,
        install_protocol_interface: dummy_install_protocol_interface,
        reinstall_protocol_interface: dummy_reinstall_protocol_interface,
        uninstall_protocol_interface: dummy_uninstall_protocol_interface,
        handle_protocol: dummy_handle_protocol,
        reserved: ptr::null_mut(),
        register_protocol_notify: dummy_register_protocol_notify,
        locate_handle: dummy_locate_handle,
        locate_device_path: dummy_locate_device_path,
        install_configuration_table: dummy_install_configuration_table,
        load_image: dummy_load_image,
        start_image: dummy_start_image,
        exit: dummy_exit,
        unload_image: dummy_unload_image,
        exit_boot_services: dummy_exit_boot_services,
        get_next_monotonic_count: dummy_get_next_monotonic_count,
        stall: dummy_stall,
        set_watchdog_timer: dummy_set_watchdog_timer,
        connect_controller: dummy_connect_controller,
        disconnect_controller: dummy_disconnect_controller,
        open_protocol: dummy_open_protocol,
        close_protocol: dummy_close_protocol,
        open_protocol_information: dummy_open_protocol_information,
        protocols_per_handle: dummy_protocols_per_handle,
        locate_handle_buffer: dummy_locate_handle_buffer,
        locate_protocol: dummy_locate_protocol,
        install_multiple_protocol_interfaces: dummy_install_multiple_protocol_interfaces,
        uninstall_multiple_protocol_interfaces: dummy_uninstall_multiple_protocol_interfaces,
        calculate_crc32: dummy_calculate_crc32,
        copy_mem: dummy_copy_mem,
        set_mem: dummy_set_mem,
        create_event_ex: dummy_create_event_ex,
    }
}
