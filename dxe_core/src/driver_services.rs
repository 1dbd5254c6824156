//! Driver model services
//!
//! `ConnectController` and `DisconnectController`, driving UEFI Driver Binding instances against
//! controller handles in the [`protocol database`](crate::protocol_db).
//!
//! ## License
//!
//! Copyright (c) The Ember Firmware Authors.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{collections::BTreeMap, collections::BTreeSet, vec::Vec};
use core::ptr::NonNull;
use ember_sdk::error::EfiError;

use r_efi::efi;

use crate::protocols::PROTOCOL_DB;

fn get_bindings_for_handles(handles: Vec<efi::Handle>) -> Vec<*mut efi::protocols::driver_binding::Protocol> {
    handles
        .iter()
        .filter_map(|x| {
            match PROTOCOL_DB.get_interface_for_handle(*x, efi::protocols::driver_binding::PROTOCOL_GUID) {
                Ok(interface) => Some(interface as *mut efi::protocols::driver_binding::Protocol),
                Err(_) => None, //ignore handles without driver bindings
            }
        })
        .collect()
}

fn get_platform_driver_override_bindings(
    controller_handle: efi::Handle,
) -> Vec<*mut efi::protocols::driver_binding::Protocol> {
    let driver_override_protocol = match PROTOCOL_DB
        .locate_protocol(efi::protocols::platform_driver_override::PROTOCOL_GUID)
    {
        Err(_) => return Vec::new(),
        Ok(protocol) => unsafe {
            (protocol as *mut efi::protocols::platform_driver_override::Protocol).as_mut().expect("bad protocol ptr")
        },
    };

    let mut driver_overrides = Vec::new();
    let mut driver_image_handle: efi::Handle = core::ptr::null_mut();
    loop {
        let status = (driver_override_protocol.get_driver)(
            driver_override_protocol,
            controller_handle,
            core::ptr::addr_of_mut!(driver_image_handle),
        );
        if status != efi::Status::SUCCESS {
            break;
        }
        driver_overrides.push(driver_image_handle);
    }

    get_bindings_for_handles(driver_overrides)
}

fn get_family_override_bindings() -> Vec<*mut efi::protocols::driver_binding::Protocol> {
    let driver_binding_handles = match PROTOCOL_DB.locate_handles(Some(efi::protocols::driver_binding::PROTOCOL_GUID)) {
        Err(_) => return Vec::new(),
        Ok(handles) => handles,
    };

    let mut driver_override_map: BTreeMap<u32, efi::Handle> = BTreeMap::new();

    // collect the handles that carry the family override protocol into a map sorted by override version
    for handle in driver_binding_handles {
        match PROTOCOL_DB.get_interface_for_handle(handle, efi::protocols::driver_family_override::PROTOCOL_GUID) {
            Ok(protocol) => {
                let driver_override_protocol = unsafe {
                    (protocol as *mut efi::protocols::driver_family_override::Protocol)
                        .as_mut()
                        .expect("bad protocol ptr")
                };
                let version = (driver_override_protocol.get_version)(driver_override_protocol);
                driver_override_map.insert(version, handle);
            }
            Err(_) => continue,
        }
    }

    //return the driver bindings for the values from the map in reverse order (highest versions first)
    get_bindings_for_handles(driver_override_map.into_values().rev().collect())
}

fn get_bus_specific_override_bindings(
    controller_handle: efi::Handle,
) -> Vec<*mut efi::protocols::driver_binding::Protocol> {
    let bus_specific_override_protocol = match PROTOCOL_DB
        .get_interface_for_handle(controller_handle, efi::protocols::bus_specific_driver_override::PROTOCOL_GUID)
    {
        Err(_) => return Vec::new(),
        Ok(protocol) => unsafe {
            (protocol as *mut efi::protocols::bus_specific_driver_override::Protocol)
                .as_mut()
                .expect("bad protocol ptr")
        },
    };

    let mut bus_overrides = Vec::new();
    let mut driver_image_handle: efi::Handle = core::ptr::null_mut();
    loop {
        let status = (bus_specific_override_protocol.get_driver)(
            bus_specific_override_protocol,
            core::ptr::addr_of_mut!(driver_image_handle),
        );
        if status != efi::Status::SUCCESS {
            break;
        }
        bus_overrides.push(driver_image_handle);
    }

    get_bindings_for_handles(bus_overrides)
}

fn get_all_driver_bindings() -> Vec<*mut efi::protocols::driver_binding::Protocol> {
    let mut driver_bindings = match PROTOCOL_DB.locate_handles(Some(efi::protocols::driver_binding::PROTOCOL_GUID)) {
        Err(_) => return Vec::new(),
        Ok(handles) if handles.is_empty() => return Vec::new(),
        Ok(handles) => get_bindings_for_handles(handles),
    };

    driver_bindings.sort_unstable_by(|a, b| unsafe { (*(*b)).version.cmp(&(*(*a)).version) });

    driver_bindings
}

fn driver_binding_handle_count() -> usize {
    PROTOCOL_DB.locate_handles(Some(efi::protocols::driver_binding::PROTOCOL_GUID)).map(|x| x.len()).unwrap_or(0)
}

fn core_connect_single_controller(
    controller_handle: efi::Handle,
    driver_handles: Vec<efi::Handle>,
    remaining_device_path: Option<*mut efi::protocols::device_path::Protocol>,
) -> Result<(), EfiError> {
    PROTOCOL_DB.validate_handle(controller_handle)?;

    let initial_binding_count = driver_binding_handle_count();

    //The following sources for driver instances are considered per UEFI Spec 2.10 section 7.3.12:
    //1. Context Override
    let mut driver_candidates = Vec::new();
    driver_candidates.extend(get_bindings_for_handles(driver_handles));

    //2. Platform Driver Override
    let mut platform_override_drivers = get_platform_driver_override_bindings(controller_handle);
    platform_override_drivers.retain(|x| !driver_candidates.contains(x));
    driver_candidates.append(&mut platform_override_drivers);

    //3. Driver Family Override Search
    let mut family_override_drivers = get_family_override_bindings();
    family_override_drivers.retain(|x| !driver_candidates.contains(x));
    driver_candidates.append(&mut family_override_drivers);

    //4. Bus Specific Driver Override
    let mut bus_override_drivers = get_bus_specific_override_bindings(controller_handle);
    bus_override_drivers.retain(|x| !driver_candidates.contains(x));
    driver_candidates.append(&mut bus_override_drivers);

    //5. Driver Binding Search
    let mut driver_bindings = get_all_driver_bindings();
    driver_bindings.retain(|x| !driver_candidates.contains(x));
    driver_candidates.append(&mut driver_bindings);

    //loop until no more drivers can be started on handle.
    let mut one_started = false;
    loop {
        // New driver bindings may have arrived since the candidate list was built (e.g. installed from a
        // Start() callback). The stale candidate list can't fairly represent them, so the caller must retry.
        if driver_binding_handle_count() > initial_binding_count {
            return Err(EfiError::NotReady);
        }

        let mut started_drivers = Vec::new();
        for driver_binding_interface in driver_candidates.clone() {
            let driver_binding = unsafe { &mut *(driver_binding_interface) };
            let device_path = remaining_device_path.unwrap_or(core::ptr::null_mut());

            match (driver_binding.supported)(driver_binding_interface, controller_handle, device_path) {
                efi::Status::SUCCESS => {
                    //driver claims support; attempt to start it.
                    started_drivers.push(driver_binding_interface);
                    if (driver_binding.start)(driver_binding_interface, controller_handle, device_path)
                        == efi::Status::SUCCESS
                    {
                        one_started = true;
                    }
                }
                _ => continue,
            }
        }
        if started_drivers.is_empty() {
            break;
        }
        driver_candidates.retain(|x| !started_drivers.contains(x));
    }

    if one_started {
        return Ok(());
    }

    // Safety: caller must ensure that the pointer contained in remaining_device_path is valid if it is Some(_).
    if let Some(device_path) = remaining_device_path {
        if unsafe { (device_path.read_unaligned()).r#type == efi::protocols::device_path::TYPE_END } {
            return Ok(());
        }
    }

    Err(EfiError::NotFound)
}

/// Connects a controller to drivers
///
/// This function matches the behavior of EFI_BOOT_SERVICES.ConnectController() API in the UEFI spec 2.10 section
/// 7.3.12. Refer to the UEFI spec description for details on input parameters, behavior, and error return codes.
///
/// # Safety
/// This routine cannot hold the protocol db lock while executing DriverBinding->Supported()/Start() since
/// they need to access protocol db services. That means this routine can't guarantee that driver bindings remain
/// valid for the duration of its execution. For example, if a driver were to be unloaded in a timer callback after
/// returning true from Supported() before Start() is called, then the driver binding instance would be uninstalled or
/// invalid and Start() would be an invalid function pointer when invoked. In general, the spec implicitly assumes
/// that driver binding instances that are valid at the start of the call to ConnectController() must remain valid for
/// the duration of the ConnectController() call. If this is not true, then behavior is undefined. This function is
/// marked unsafe for this reason.
///
/// ## Example
///
/// ```ignore
/// let result = core_connect_controller(controller_handle, Vec::new(), None, false);
/// ```
///
pub unsafe fn core_connect_controller(
    handle: efi::Handle,
    driver_handles: Vec<efi::Handle>,
    remaining_device_path: Option<*mut efi::protocols::device_path::Protocol>,
    recursive: bool,
) -> Result<(), EfiError> {
    let return_status = core_connect_single_controller(handle, driver_handles, remaining_device_path);

    if recursive {
        for child in PROTOCOL_DB.get_child_handles(handle) {
            //ignore the return value to match behavior of the reference C implementation.
            _ = unsafe { core_connect_controller(child, Vec::new(), None, true) };
        }
    }

    return_status
}

extern "efiapi" fn connect_controller(
    handle: efi::Handle,
    driver_image_handle: *mut efi::Handle,
    remaining_device_path: *mut efi::protocols::device_path::Protocol,
    recursive: efi::Boolean,
) -> efi::Status {
    let driver_handles = if driver_image_handle.is_null() {
        Vec::new()
    } else {
        let mut current_ptr = driver_image_handle;
        let mut handles: Vec<efi::Handle> = Vec::new();
        loop {
            // Safety: caller must ensure that driver_image_handle is a valid pointer to a null-terminated list of
            // handles if it is not null.
            let current_val = unsafe { current_ptr.read_unaligned() };
            if current_val.is_null() {
                break;
            }
            handles.push(current_val);
            // Safety: caller guarantees a null-terminated list, so safe to advance to the next pointer as the
            // null-terminator has just been checked above.
            current_ptr = unsafe { current_ptr.add(1) };
        }
        handles
    };
    // remaining_device_path is passed in and may not have proper alignment.
    let device_path = if remaining_device_path.is_null() { None } else { Some(remaining_device_path) };

    // Safety: caller must ensure that device_path is a valid pointer to a device path structure if it is not null.
    unsafe {
        match core_connect_controller(handle, driver_handles, device_path, recursive.into()) {
            Err(err) => err.into(),
            _ => efi::Status::SUCCESS,
        }
    }
}

/// Disconnects drivers from a controller.
///
/// This function matches the behavior of EFI_BOOT_SERVICES.DisconnectController() API in the UEFI spec 2.10 section
/// 7.3.13. Refer to the UEFI spec description for details on input parameters, behavior, and error return codes.
///
/// # Safety
/// See [`core_connect_controller`]; driver binding instances must remain valid for the duration of the call.
///
/// ## Example
///
/// ```ignore
/// let result = core_disconnect_controller(controller_handle, None, None);
/// ```
///
pub unsafe fn core_disconnect_controller(
    controller_handle: efi::Handle,
    driver_image_handle: Option<efi::Handle>,
    child_handle: Option<efi::Handle>,
) -> Result<(), EfiError> {
    PROTOCOL_DB.validate_handle(controller_handle)?;

    if let Some(handle) = driver_image_handle {
        PROTOCOL_DB.validate_handle(handle)?;
    }

    if let Some(handle) = child_handle {
        PROTOCOL_DB.validate_handle(handle)?;
    }

    // determine which driver_handles should be stopped.
    let mut drivers_managing_controller = {
        match PROTOCOL_DB.get_open_protocol_information(controller_handle) {
            Ok(info) => info
                .iter()
                .flat_map(|(_guid, open_info)| {
                    open_info.iter().filter_map(|x| {
                        if (x.attributes & efi::OPEN_PROTOCOL_BY_DRIVER) != 0 {
                            Some(x.agent_handle.expect("BY_DRIVER usage must have an agent handle"))
                        } else {
                            None
                        }
                    })
                })
                .collect(),
            Err(_) => Vec::new(),
        }
    };

    // remove duplicates but preserve ordering.
    let mut driver_set = BTreeSet::new();
    drivers_managing_controller.retain(|x| driver_set.insert(*x));

    // if the driver image was specified, only disconnect that one (if it is actually managing it)
    if let Some(driver) = driver_image_handle {
        drivers_managing_controller.retain(|x| *x == driver);
    }

    let mut one_or_more_drivers_disconnected = false;
    let no_drivers = drivers_managing_controller.is_empty();
    for driver_handle in drivers_managing_controller {
        let controller_info = match PROTOCOL_DB.get_open_protocol_information(controller_handle) {
            Ok(info) => info,
            Err(_) => continue,
        };

        // Determine whether this driver still has the controller open by driver, and what child handles it has open
        // (if any).
        let mut driver_valid = false;
        let mut child_handles = Vec::new();
        for (_guid, open_info) in controller_info.iter() {
            for info in open_info.iter() {
                if info.agent_handle == Some(driver_handle) {
                    if (info.attributes & efi::OPEN_PROTOCOL_BY_DRIVER) != 0 {
                        driver_valid = true;
                    }
                    if (info.attributes & efi::OPEN_PROTOCOL_BY_CHILD_CONTROLLER) != 0 {
                        if let Some(handle) = info.controller_handle {
                            child_handles.push(handle);
                        }
                    }
                }
            }
        }

        // This driver no longer has the controller open by driver (may have been closed as a side-effect of
        // processing a previous driver in the list), so nothing to do.
        if !driver_valid {
            continue;
        }

        // remove duplicates but preserve ordering.
        let mut child_set = BTreeSet::new();
        child_handles.retain(|x| child_set.insert(*x));

        let total_children = child_handles.len();
        let mut is_only_child = false;
        if let Some(handle) = child_handle {
            //if the child was specified, but was the only child, then the driver should be disconnected.
            //if the child was specified, but other children were present, then the driver should not be disconnected.
            child_handles.retain(|x| x == &handle);
            is_only_child = total_children == child_handles.len();
        }

        //resolve the handle to the driver_binding.
        //N.B. Corner case: a driver could install a driver-binding instance; then be asked to manage a controller (and
        //thus, become an agent_handle in the open protocol information), and then something uninstalls the driver
        //binding from the agent_handle. This would mean that the agent_handle now no longer supports the driver binding
        //but is marked in the protocol database as managing the controller. This code just returns INVALID_PARAMETER in
        //this case (which effectively makes the controller "un-disconnect-able" since all subsequent disconnects will
        //also fail for the same reason). This matches the reference C implementation.
        let driver_binding_interface = PROTOCOL_DB
            .get_interface_for_handle(driver_handle, efi::protocols::driver_binding::PROTOCOL_GUID)
            .or(Err(EfiError::InvalidParameter))?;
        let driver_binding_interface = driver_binding_interface as *mut efi::protocols::driver_binding::Protocol;
        let driver_binding = unsafe { &mut *(driver_binding_interface) };

        let mut status = efi::Status::SUCCESS;
        if !child_handles.is_empty() {
            //disconnect the child controller(s).
            status = (driver_binding.stop)(
                driver_binding_interface,
                controller_handle,
                child_handles.len(),
                child_handles.as_mut_ptr(),
            );
        }
        if status == efi::Status::SUCCESS && (child_handle.is_none() || is_only_child) {
            status = (driver_binding.stop)(driver_binding_interface, controller_handle, 0, core::ptr::null_mut());
        }
        if status == efi::Status::SUCCESS {
            one_or_more_drivers_disconnected = true;
        }
    }

    if one_or_more_drivers_disconnected || no_drivers {
        Ok(())
    } else {
        Err(EfiError::NotFound)
    }
}

extern "efiapi" fn disconnect_controller(
    controller_handle: efi::Handle,
    driver_image_handle: efi::Handle,
    child_handle: efi::Handle,
) -> efi::Status {
    let driver_image_handle = NonNull::new(driver_image_handle).map(|x| x.as_ptr());
    let child_handle = NonNull::new(child_handle).map(|x| x.as_ptr());
    unsafe {
        match core_disconnect_controller(controller_handle, driver_image_handle, child_handle) {
            Err(err) => err.into(),
            _ => efi::Status::SUCCESS,
        }
    }
}

pub fn init_driver_services(bs: &mut efi::BootServices) {
    bs.connect_controller = connect_controller;
    bs.disconnect_controller = disconnect_controller;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;
    use core::ffi::c_void;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static SUPPORTED_CALL_COUNT: AtomicUsize = AtomicUsize::new(0);
    static START_CALL_COUNT: AtomicUsize = AtomicUsize::new(0);
    static STOP_CALL_COUNT: AtomicUsize = AtomicUsize::new(0);

    fn with_locked_state<F: Fn() + std::panic::RefUnwindSafe>(f: F) {
        test_support::with_global_lock(|| {
            unsafe {
                test_support::init_test_protocol_db();
            }
            SUPPORTED_CALL_COUNT.store(0, Ordering::SeqCst);
            START_CALL_COUNT.store(0, Ordering::SeqCst);
            STOP_CALL_COUNT.store(0, Ordering::SeqCst);
            f();
        })
        .unwrap();
    }

    extern "efiapi" fn mock_supported_success(
        _this: *mut efi::protocols::driver_binding::Protocol,
        _controller_handle: efi::Handle,
        _remaining_device_path: *mut efi::protocols::device_path::Protocol,
    ) -> efi::Status {
        SUPPORTED_CALL_COUNT.fetch_add(1, Ordering::SeqCst);
        efi::Status::SUCCESS
    }

    extern "efiapi" fn mock_supported_failure(
        _this: *mut efi::protocols::driver_binding::Protocol,
        _controller_handle: efi::Handle,
        _remaining_device_path: *mut efi::protocols::device_path::Protocol,
    ) -> efi::Status {
        SUPPORTED_CALL_COUNT.fetch_add(1, Ordering::SeqCst);
        efi::Status::UNSUPPORTED
    }

    extern "efiapi" fn mock_start_success(
        _this: *mut efi::protocols::driver_binding::Protocol,
        _controller_handle: efi::Handle,
        _remaining_device_path: *mut efi::protocols::device_path::Protocol,
    ) -> efi::Status {
        START_CALL_COUNT.fetch_add(1, Ordering::SeqCst);
        efi::Status::SUCCESS
    }

    extern "efiapi" fn mock_start_installs_binding(
        _this: *mut efi::protocols::driver_binding::Protocol,
        _controller_handle: efi::Handle,
        _remaining_device_path: *mut efi::protocols::device_path::Protocol,
    ) -> efi::Status {
        START_CALL_COUNT.fetch_add(1, Ordering::SeqCst);
        // a second driver binding arrives mid-connect.
        let late_binding = Box::new(make_driver_binding(1, core::ptr::null_mut()));
        PROTOCOL_DB
            .install_protocol_interface(
                None,
                efi::protocols::driver_binding::PROTOCOL_GUID,
                Box::into_raw(late_binding) as *mut c_void,
            )
            .unwrap();
        efi::Status::SUCCESS
    }

    extern "efiapi" fn mock_stop_success(
        _this: *mut efi::protocols::driver_binding::Protocol,
        _controller_handle: efi::Handle,
        _num_children: usize,
        _child_handle_buffer: *mut efi::Handle,
    ) -> efi::Status {
        STOP_CALL_COUNT.fetch_add(1, Ordering::SeqCst);
        efi::Status::SUCCESS
    }

    fn make_driver_binding(version: u32, handle: efi::Handle) -> efi::protocols::driver_binding::Protocol {
        efi::protocols::driver_binding::Protocol {
            version,
            supported: mock_supported_success,
            start: mock_start_success,
            stop: mock_stop_success,
            driver_binding_handle: handle,
            image_handle: handle,
        }
    }

    fn install_driver_binding(binding: efi::protocols::driver_binding::Protocol) -> efi::Handle {
        let binding_ptr = Box::into_raw(Box::new(binding)) as *mut c_void;
        let (handle, _) = PROTOCOL_DB
            .install_protocol_interface(None, efi::protocols::driver_binding::PROTOCOL_GUID, binding_ptr)
            .unwrap();
        handle
    }

    fn install_controller() -> efi::Handle {
        let (handle, _) = PROTOCOL_DB
            .install_protocol_interface(None, efi::protocols::device_path::PROTOCOL_GUID, 0x1111 as *mut c_void)
            .unwrap();
        handle
    }

    extern "efiapi" fn mock_get_version_100(_this: *mut efi::protocols::driver_family_override::Protocol) -> u32 {
        100
    }

    extern "efiapi" fn mock_get_version_200(_this: *mut efi::protocols::driver_family_override::Protocol) -> u32 {
        200
    }

    #[test]
    fn bindings_for_handles_ignores_handles_without_bindings() {
        with_locked_state(|| {
            let plain_handle = install_controller();
            let binding_handle = install_driver_binding(make_driver_binding(10, core::ptr::null_mut()));

            let bindings = get_bindings_for_handles(vec![plain_handle, binding_handle]);
            assert_eq!(bindings.len(), 1);
            unsafe { assert_eq!((*bindings[0]).version, 10) };
        });
    }

    #[test]
    fn family_override_bindings_sort_by_version_descending() {
        with_locked_state(|| {
            let handle1 = install_driver_binding(make_driver_binding(10, core::ptr::null_mut()));
            let handle2 = install_driver_binding(make_driver_binding(20, core::ptr::null_mut()));
            let _handle3 = install_driver_binding(make_driver_binding(30, core::ptr::null_mut()));

            let family1 =
                Box::new(efi::protocols::driver_family_override::Protocol { get_version: mock_get_version_100 });
            let family2 =
                Box::new(efi::protocols::driver_family_override::Protocol { get_version: mock_get_version_200 });
            PROTOCOL_DB
                .install_protocol_interface(
                    Some(handle1),
                    efi::protocols::driver_family_override::PROTOCOL_GUID,
                    Box::into_raw(family1) as *mut c_void,
                )
                .unwrap();
            PROTOCOL_DB
                .install_protocol_interface(
                    Some(handle2),
                    efi::protocols::driver_family_override::PROTOCOL_GUID,
                    Box::into_raw(family2) as *mut c_void,
                )
                .unwrap();

            let bindings = get_family_override_bindings();
            //handle3 has no family override protocol and is excluded.
            assert_eq!(bindings.len(), 2);
            unsafe {
                assert_eq!((*bindings[0]).version, 20);
                assert_eq!((*bindings[1]).version, 10);
            }
        });
    }

    #[test]
    fn all_driver_bindings_sort_by_binding_version_descending() {
        with_locked_state(|| {
            install_driver_binding(make_driver_binding(10, core::ptr::null_mut()));
            install_driver_binding(make_driver_binding(30, core::ptr::null_mut()));
            install_driver_binding(make_driver_binding(20, core::ptr::null_mut()));

            let bindings = get_all_driver_bindings();
            assert_eq!(bindings.len(), 3);
            unsafe {
                assert_eq!((*bindings[0]).version, 30);
                assert_eq!((*bindings[1]).version, 20);
                assert_eq!((*bindings[2]).version, 10);
            }
        });
    }

    #[test]
    fn connect_starts_supporting_drivers() {
        with_locked_state(|| {
            let controller_handle = install_controller();

            let mut supporting = make_driver_binding(10, core::ptr::null_mut());
            supporting.supported = mock_supported_success;
            let supporting_handle = install_driver_binding(supporting);

            let mut refusing = make_driver_binding(20, core::ptr::null_mut());
            refusing.supported = mock_supported_failure;
            let refusing_handle = install_driver_binding(refusing);

            let result = core_connect_single_controller(
                controller_handle,
                vec![supporting_handle, refusing_handle],
                None,
            );
            assert!(result.is_ok());
            //the supporting driver started once; the refusing driver only got a Supported() probe. The second loop
            //pass probes the refusing driver once more before concluding nothing further can start.
            assert_eq!(START_CALL_COUNT.load(Ordering::SeqCst), 1);
            assert!(SUPPORTED_CALL_COUNT.load(Ordering::SeqCst) >= 2);
        });
    }

    #[test]
    fn connect_succeeds_with_end_device_path_when_nothing_starts() {
        with_locked_state(|| {
            let controller_handle = install_controller();

            let mut refusing = make_driver_binding(10, core::ptr::null_mut());
            refusing.supported = mock_supported_failure;
            let refusing_handle = install_driver_binding(refusing);

            let mut end_node = efi::protocols::device_path::Protocol {
                r#type: efi::protocols::device_path::TYPE_END,
                sub_type: efi::protocols::device_path::End::SUBTYPE_ENTIRE,
                length: [4, 0],
            };

            let result = core_connect_single_controller(
                controller_handle,
                vec![refusing_handle],
                Some(core::ptr::addr_of_mut!(end_node)),
            );
            assert!(result.is_ok());

            //without the end node the same connect reports no driver found.
            let result = core_connect_single_controller(controller_handle, vec![refusing_handle], None);
            assert_eq!(result, Err(EfiError::NotFound));
        });
    }

    #[test]
    fn connect_reports_not_ready_when_bindings_arrive_mid_connect() {
        with_locked_state(|| {
            let controller_handle = install_controller();

            let mut binding = make_driver_binding(10, core::ptr::null_mut());
            binding.start = mock_start_installs_binding;
            let binding_handle = install_driver_binding(binding);

            let result = core_connect_single_controller(controller_handle, vec![binding_handle], None);
            assert_eq!(result, Err(EfiError::NotReady));
            assert_eq!(START_CALL_COUNT.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn connect_recursive_walks_child_controllers() {
        with_locked_state(|| {
            let controller_handle = install_controller();
            let child_handle = install_controller();
            let driver_handle = install_driver_binding(make_driver_binding(10, core::ptr::null_mut()));

            PROTOCOL_DB
                .add_protocol_usage(
                    controller_handle,
                    efi::protocols::device_path::PROTOCOL_GUID,
                    Some(driver_handle),
                    Some(child_handle),
                    efi::OPEN_PROTOCOL_BY_CHILD_CONTROLLER,
                )
                .unwrap();

            unsafe {
                let result = core_connect_controller(controller_handle, vec![driver_handle], None, true);
                assert!(result.is_ok());
            }
            //the driver started on the parent and was probed again for the child.
            assert!(START_CALL_COUNT.load(Ordering::SeqCst) >= 2);
        });
    }

    #[test]
    fn disconnect_stops_managing_driver() {
        with_locked_state(|| {
            let controller_handle = install_controller();
            let driver_handle = install_driver_binding(make_driver_binding(10, core::ptr::null_mut()));

            PROTOCOL_DB
                .add_protocol_usage(
                    controller_handle,
                    efi::protocols::device_path::PROTOCOL_GUID,
                    Some(driver_handle),
                    Some(controller_handle),
                    efi::OPEN_PROTOCOL_BY_DRIVER,
                )
                .unwrap();

            unsafe {
                let result = core_disconnect_controller(controller_handle, Some(driver_handle), None);
                assert!(result.is_ok());
            }
            assert_eq!(STOP_CALL_COUNT.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn disconnect_with_no_managing_drivers_succeeds() {
        with_locked_state(|| {
            let controller_handle = install_controller();
            unsafe {
                let result = core_disconnect_controller(controller_handle, None, None);
                assert!(result.is_ok());
            }
            assert_eq!(STOP_CALL_COUNT.load(Ordering::SeqCst), 0);
        });
    }

    #[test]
    fn disconnect_child_only_stops_child() {
        with_locked_state(|| {
            let controller_handle = install_controller();
            let child1 = install_controller();
            let child2 = install_controller();
            let driver_handle = install_driver_binding(make_driver_binding(10, core::ptr::null_mut()));

            for child in [child1, child2] {
                PROTOCOL_DB
                    .add_protocol_usage(
                        controller_handle,
                        efi::protocols::device_path::PROTOCOL_GUID,
                        Some(driver_handle),
                        Some(child),
                        efi::OPEN_PROTOCOL_BY_CHILD_CONTROLLER,
                    )
                    .unwrap();
            }
            PROTOCOL_DB
                .add_protocol_usage(
                    controller_handle,
                    efi::protocols::device_path::PROTOCOL_GUID,
                    Some(driver_handle),
                    Some(controller_handle),
                    efi::OPEN_PROTOCOL_BY_DRIVER,
                )
                .unwrap();

            unsafe {
                let result = core_disconnect_controller(controller_handle, Some(driver_handle), Some(child1));
                assert!(result.is_ok());
            }
            //only the child stop happened; the driver keeps managing child2.
            assert_eq!(STOP_CALL_COUNT.load(Ordering::SeqCst), 1);
        });
    }

    #[test]
    fn install_driver_services_should_install_driver_services() {
        with_locked_state(|| {
            let mut boot_services = test_support::mock_boot_services();
            init_driver_services(&mut boot_services);
            #[allow(unpredictable_function_pointer_comparisons)]
            {
                assert!(boot_services.connect_controller == connect_controller);
                assert!(boot_services.disconnect_controller == disconnect_controller);
            }
        });
    }
}
