//! Handle and protocol database
//!
//! Tracks every handle in the system, the protocol interfaces installed on it, and the agents that
//! currently have those interfaces open. All public interaction goes through the
//! [`SpinLockedProtocolDb`] singleton.
//!
//! ## License
//!
//! Copyright (c) The Ember Firmware Authors.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
extern crate alloc;

use alloc::{
    collections::{BTreeMap, BTreeSet},
    vec,
    vec::Vec,
};
use core::{ffi::c_void, hash::Hasher};
use ember_sdk::{error::EfiError, guid::OrdGuid};
use r_efi::efi;

use crate::tpl_lock;

//private UUID used to create the "well-known handles"
const WELL_KNOWN_HANDLE_PROTOCOL_GUID: uuid::Uuid = uuid::Uuid::from_u128(0x3a2f90c4d01e47f2b64bc2a07d8f11aa);

#[allow(dead_code)]
pub const INVALID_HANDLE: efi::Handle = 0 as efi::Handle;
pub const CORE_HANDLE: efi::Handle = 1 as efi::Handle;
pub const TIMER_HANDLE: efi::Handle = 2 as efi::Handle;
pub const WATCHDOG_HANDLE: efi::Handle = 3 as efi::Handle;

/// Tracks one open of a protocol interface on a handle.
///
/// Follows the semantics of EFI_OPEN_PROTOCOL_INFORMATION_ENTRY in UEFI spec 2.10 section 7.3.11.
#[derive(Clone, Copy, Debug)]
pub struct OpenProtocolInformation {
    pub agent_handle: Option<efi::Handle>,
    pub controller_handle: Option<efi::Handle>,
    pub attributes: u32,
    pub open_count: u32,
}

impl PartialEq for OpenProtocolInformation {
    fn eq(&self, other: &Self) -> bool {
        self.agent_handle == other.agent_handle
            && self.controller_handle == other.controller_handle
            && self.attributes == other.attributes
    }
}

impl Eq for OpenProtocolInformation {}

impl OpenProtocolInformation {
    fn new(
        handle: efi::Handle,
        agent_handle: Option<efi::Handle>,
        controller_handle: Option<efi::Handle>,
        attributes: u32,
    ) -> Result<Self, EfiError> {
        const BY_DRIVER_EXCLUSIVE: u32 = efi::OPEN_PROTOCOL_BY_DRIVER | efi::OPEN_PROTOCOL_EXCLUSIVE;
        match attributes {
            efi::OPEN_PROTOCOL_BY_CHILD_CONTROLLER => {
                if agent_handle.is_none()
                    || controller_handle.is_none()
                    || handle == controller_handle.ok_or(EfiError::InvalidParameter)?
                {
                    return Err(EfiError::InvalidParameter);
                }
            }
            efi::OPEN_PROTOCOL_BY_DRIVER | BY_DRIVER_EXCLUSIVE => {
                if agent_handle.is_none() || controller_handle.is_none() {
                    return Err(EfiError::InvalidParameter);
                }
            }
            efi::OPEN_PROTOCOL_EXCLUSIVE => {
                if agent_handle.is_none() {
                    return Err(EfiError::InvalidParameter);
                }
            }
            efi::OPEN_PROTOCOL_BY_HANDLE_PROTOCOL
            | efi::OPEN_PROTOCOL_GET_PROTOCOL
            | efi::OPEN_PROTOCOL_TEST_PROTOCOL => (),
            _ => return Err(EfiError::InvalidParameter),
        }
        Ok(OpenProtocolInformation { agent_handle, controller_handle, attributes, open_count: 1 })
    }
}

impl From<OpenProtocolInformation> for efi::OpenProtocolInformationEntry {
    fn from(item: OpenProtocolInformation) -> Self {
        efi::OpenProtocolInformationEntry {
            agent_handle: item.agent_handle.unwrap_or(core::ptr::null_mut()),
            controller_handle: item.controller_handle.unwrap_or(core::ptr::null_mut()),
            attributes: item.attributes,
            open_count: item.open_count,
        }
    }
}

struct ProtocolInstance {
    interface: *mut c_void,
    opened_by_driver: bool,
    opened_by_exclusive: bool,
    usage: Vec<OpenProtocolInformation>,
}

/// Registration record for a protocol notify.
///
/// `event` is the event the caller signals when a fresh installation occurs; the registration token
/// and the set of handles with fresh installations are tracked internally.
#[derive(Clone, Debug)]
pub struct ProtocolNotify {
    pub event: efi::Event,
    registration: *mut c_void,
    fresh_handles: BTreeSet<efi::Handle>,
}

// The main implementation. Public interaction with the database goes through
// [`SpinLockedProtocolDb`] below.
struct ProtocolDb {
    handles: BTreeMap<usize, BTreeMap<OrdGuid, ProtocolInstance>>,
    notifications: BTreeMap<OrdGuid, Vec<ProtocolNotify>>,
    hash_new_handles: bool,
    next_handle: usize,
    next_registration: usize,
    database_key: usize,
}

impl ProtocolDb {
    const fn new() -> Self {
        ProtocolDb {
            handles: BTreeMap::new(),
            notifications: BTreeMap::new(),
            hash_new_handles: false,
            next_handle: 1,
            next_registration: 1,
            database_key: 0,
        }
    }

    fn enable_handle_hashing(&mut self) {
        self.hash_new_handles = true;
    }

    fn registered_protocols(&self) -> Vec<efi::Guid> {
        self.handles.iter().flat_map(|(_, handle)| handle.keys().map(|x| efi::Guid::from(*x))).collect()
    }

    fn install_protocol_interface(
        &mut self,
        handle: Option<efi::Handle>,
        protocol: efi::Guid,
        interface: *mut c_void,
    ) -> Result<(efi::Handle, Vec<ProtocolNotify>), EfiError> {
        let (output_handle, key) = match handle {
            Some(handle) => {
                //installing on an existing handle.
                self.validate_handle(handle)?;
                let key = handle as usize;
                (handle, key)
            }
            None => {
                //installing on a new handle.
                let mut key;
                if self.hash_new_handles {
                    let mut hasher = SplitMix64Hasher::default();
                    hasher.write_usize(self.next_handle);
                    key = hasher.finish() as usize;
                    self.next_handle += 1;
                    //make sure we don't collide with an existing key. 0 is reserved for "invalid handle".
                    while key == 0 || self.handles.contains_key(&key) {
                        hasher.write_usize(self.next_handle);
                        key = hasher.finish() as usize;
                        self.next_handle += 1;
                    }
                } else {
                    key = self.next_handle;
                    self.next_handle += 1;
                }

                self.handles.insert(key, BTreeMap::new());
                let handle = key as efi::Handle;
                (handle, key)
            }
        };

        debug_assert!(self.handles.contains_key(&key));
        let handle_instance = self.handles.get_mut(&key).ok_or(EfiError::Unsupported)?;

        if handle_instance.contains_key(&OrdGuid::from(protocol)) {
            return Err(EfiError::InvalidParameter);
        }

        let protocol_instance =
            ProtocolInstance { interface, opened_by_driver: false, opened_by_exclusive: false, usage: Vec::new() };

        let exists = handle_instance.insert(OrdGuid::from(protocol), protocol_instance);
        assert!(exists.is_none()); //guaranteed by the `contains_key` check above.

        self.database_key += 1;

        //record the fresh installation for any registered notifies on this protocol.
        if let Some(events) = self.notifications.get_mut(&OrdGuid::from(protocol)) {
            for event in events {
                event.fresh_handles.insert(output_handle);
            }
        }
        let events = match self.notifications.get(&OrdGuid::from(protocol)) {
            Some(events) => events.clone(),
            None => vec![],
        };

        Ok((output_handle, events))
    }

    fn uninstall_protocol_interface(
        &mut self,
        handle: efi::Handle,
        protocol: efi::Guid,
        interface: *mut c_void,
    ) -> Result<(), EfiError> {
        self.validate_handle(handle)?;

        let key = handle as usize;
        let handle_instance =
            self.handles.get_mut(&key).expect("Invalid handle should not occur due to prior handle validation.");
        let instance = handle_instance.get(&OrdGuid::from(protocol)).ok_or(EfiError::NotFound)?;

        if instance.interface != interface {
            return Err(EfiError::NotFound);
        }

        //An interface that is still open must be released before it can be uninstalled. The caller holds the
        //disconnect machinery (and calling it under this lock would deadlock), so report ACCESS_DENIED and let the
        //caller disconnect and retry.
        if !instance.usage.is_empty() {
            return Err(EfiError::AccessDenied);
        }
        handle_instance.remove(&OrdGuid::from(protocol));

        //a handle that loses its last interface is destroyed.
        if handle_instance.is_empty() {
            self.handles.remove(&key);
        }

        self.database_key += 1;

        Ok(())
    }

    fn locate_handles(&mut self, protocol: Option<efi::Guid>) -> Result<Vec<efi::Handle>, EfiError> {
        let handles: Vec<efi::Handle> = self
            .handles
            .iter()
            .filter_map(|(key, handle_data)| {
                match protocol {
                    None => Some(*key as efi::Handle), //"None" means return all handles.
                    Some(protocol) if handle_data.contains_key(&OrdGuid::from(protocol)) => {
                        Some(*key as efi::Handle)
                    }
                    _ => None,
                }
            })
            .collect();
        if handles.is_empty() {
            return Err(EfiError::NotFound);
        }
        Ok(handles)
    }

    fn locate_protocol(&mut self, protocol: efi::Guid) -> Result<*mut c_void, EfiError> {
        let interface = self.handles.values().find_map(|x| x.get(&OrdGuid::from(protocol)));

        match interface {
            Some(interface) => Ok(interface.interface),
            None => Err(EfiError::NotFound),
        }
    }

    fn get_interface_for_handle(&mut self, handle: efi::Handle, protocol: efi::Guid) -> Result<*mut c_void, EfiError> {
        self.validate_handle(handle)?;

        let key = handle as usize;
        let handle_instance = self.handles.get_mut(&key).ok_or(EfiError::NotFound)?;
        let instance = handle_instance.get_mut(&OrdGuid::from(protocol)).ok_or(EfiError::NotFound)?;
        Ok(instance.interface)
    }

    fn validate_handle(&self, handle: efi::Handle) -> Result<(), EfiError> {
        let handle = handle as usize;
        //to be valid the handle must exist in the handle database (i.e. not have been deleted).
        if !self.handles.contains_key(&handle) {
            return Err(EfiError::InvalidParameter);
        }
        Ok(())
    }

    fn add_protocol_usage(
        &mut self,
        handle: efi::Handle,
        protocol: efi::Guid,
        agent_handle: Option<efi::Handle>,
        controller_handle: Option<efi::Handle>,
        attributes: u32,
    ) -> Result<(), EfiError> {
        self.validate_handle(handle)?;

        if let Some(agent) = agent_handle {
            self.validate_handle(agent)?;
        }

        if let Some(controller) = controller_handle {
            self.validate_handle(controller)?;
        }

        let key = handle as usize;
        let handle_instance = self.handles.get_mut(&key).ok_or(EfiError::Unsupported)?;
        let instance = handle_instance.get_mut(&OrdGuid::from(protocol)).ok_or(EfiError::Unsupported)?;

        let new_using_agent = OpenProtocolInformation::new(handle, agent_handle, controller_handle, attributes)?;
        let exact_match = instance.usage.iter_mut().find(|user| user == &&new_using_agent);

        if instance.opened_by_driver && exact_match.is_some() {
            return Err(EfiError::AlreadyStarted);
        }

        if !instance.opened_by_exclusive {
            if let Some(exact_match) = exact_match {
                exact_match.open_count += 1;
                return Ok(());
            }
        }

        const BY_DRIVER_EXCLUSIVE: u32 = efi::OPEN_PROTOCOL_BY_DRIVER | efi::OPEN_PROTOCOL_EXCLUSIVE;
        match attributes {
            efi::OPEN_PROTOCOL_BY_DRIVER | efi::OPEN_PROTOCOL_EXCLUSIVE | BY_DRIVER_EXCLUSIVE => {
                //An EXCLUSIVE open must displace existing BY_DRIVER owners via DisconnectController. The caller owns
                //that machinery (and this runs under the database lock), so report the conflict and let the caller
                //disconnect and retry.
                if instance.opened_by_exclusive || instance.opened_by_driver {
                    return Err(EfiError::AccessDenied);
                }
            }
            efi::OPEN_PROTOCOL_BY_CHILD_CONTROLLER
            | efi::OPEN_PROTOCOL_BY_HANDLE_PROTOCOL
            | efi::OPEN_PROTOCOL_GET_PROTOCOL
            | efi::OPEN_PROTOCOL_TEST_PROTOCOL => (),
            _ => panic!("Unsupported attributes: {:#x?}", attributes), //dealt with in OpenProtocolInformation::new().
        }

        if agent_handle.is_none() {
            return Ok(()); //nothing to track if no agent is actually specified.
        }

        if (new_using_agent.attributes & efi::OPEN_PROTOCOL_BY_DRIVER) != 0 {
            instance.opened_by_driver = true;
        }
        if (new_using_agent.attributes & efi::OPEN_PROTOCOL_EXCLUSIVE) != 0 {
            instance.opened_by_exclusive = true;
        }
        instance.usage.push(new_using_agent);

        self.database_key += 1;

        Ok(())
    }

    fn remove_protocol_usage(
        &mut self,
        handle: efi::Handle,
        protocol: efi::Guid,
        agent_handle: Option<efi::Handle>,
        controller_handle: Option<efi::Handle>,
    ) -> Result<(), EfiError> {
        self.validate_handle(handle)?;

        if let Some(agent) = agent_handle {
            self.validate_handle(agent)?;
        }

        if let Some(controller) = controller_handle {
            self.validate_handle(controller)?;
        }

        let key = handle as usize;
        let handle_instance = self.handles.get_mut(&key).expect("valid handle, but no entry in self.handles");
        let instance = handle_instance.get_mut(&OrdGuid::from(protocol)).ok_or(EfiError::Unsupported)?;
        let mut removed = false;
        instance.usage.retain(|x| {
            if (x.agent_handle == agent_handle) && (x.controller_handle == controller_handle) {
                //there is at most one BY_DRIVER and one EXCLUSIVE usage per instance; clear the flags when the
                //usage carrying them is removed.
                if (x.attributes & efi::OPEN_PROTOCOL_BY_DRIVER) != 0 {
                    instance.opened_by_driver = false;
                }
                if (x.attributes & efi::OPEN_PROTOCOL_EXCLUSIVE) != 0 {
                    instance.opened_by_exclusive = false;
                }
                removed = true;
                false
            } else {
                true
            }
        });

        if !removed {
            return Err(EfiError::NotFound);
        }

        self.database_key += 1;

        Ok(())
    }

    fn get_open_protocol_information_by_protocol(
        &mut self,
        handle: efi::Handle,
        protocol: efi::Guid,
    ) -> Result<Vec<OpenProtocolInformation>, EfiError> {
        self.validate_handle(handle)?;

        let key = handle as usize;
        let handle_instance = self.handles.get_mut(&key).ok_or(EfiError::NotFound)?;
        let instance = handle_instance.get_mut(&OrdGuid::from(protocol)).ok_or(EfiError::NotFound)?;

        Ok(instance.usage.clone())
    }

    fn get_open_protocol_information(
        &mut self,
        handle: efi::Handle,
    ) -> Result<Vec<(efi::Guid, Vec<OpenProtocolInformation>)>, EfiError> {
        let key = handle as usize;
        let handle_instance = self.handles.get(&key).ok_or(EfiError::NotFound)?;

        let usages =
            handle_instance.iter().map(|(guid, instance)| (efi::Guid::from(*guid), instance.usage.clone())).collect();

        Ok(usages)
    }

    fn get_protocols_on_handle(&mut self, handle: efi::Handle) -> Result<Vec<efi::Guid>, EfiError> {
        self.validate_handle(handle)?;

        let key = handle as usize;
        Ok(self.handles[&key].keys().map(|x| efi::Guid::from(*x)).collect())
    }

    fn register_protocol_notify(&mut self, protocol: efi::Guid, event: efi::Event) -> Result<*mut c_void, EfiError> {
        let registration = self.next_registration as *mut c_void;
        self.next_registration += 1;
        let protocol_notify = ProtocolNotify { event, registration, fresh_handles: BTreeSet::new() };

        if let Some(existing_key) = self.notifications.get_mut(&OrdGuid::from(protocol)) {
            existing_key.push(protocol_notify);
        } else {
            let events: Vec<ProtocolNotify> = vec![protocol_notify];
            self.notifications.insert(OrdGuid::from(protocol), events);
        }
        Ok(registration)
    }

    fn unregister_protocol_notify_event(&mut self, event: efi::Event) {
        for (_, v) in self.notifications.iter_mut() {
            v.retain(|x| x.event != event);
        }
    }

    fn unregister_protocol_notify_events(&mut self, events: Vec<efi::Event>) {
        for event in events {
            self.unregister_protocol_notify_event(event);
        }
    }

    fn next_handle_for_registration(&mut self, registration: *mut c_void) -> Option<efi::Handle> {
        for (_, v) in self.notifications.iter_mut() {
            if let Some(index) = v.iter().position(|notify| notify.registration == registration) {
                if let Some(handle) = v[index].fresh_handles.pop_first() {
                    return Some(handle);
                }
            }
        }
        None
    }

    fn get_child_handles(&mut self, parent_handle: efi::Handle) -> Vec<efi::Handle> {
        if self.validate_handle(parent_handle).is_err() {
            return Vec::new();
        }

        let handles = &self.handles[&(parent_handle as usize)];
        let mut child_handles: Vec<efi::Handle> = handles
            .iter()
            .flat_map(|(_, instance)| {
                //the children of a handle are the controllers that have one of its protocol instances open
                //BY_CHILD_CONTROLLER.
                instance.usage.iter().filter_map(|open_info| {
                    if (open_info.attributes & efi::OPEN_PROTOCOL_BY_CHILD_CONTROLLER) != 0 {
                        Some(
                            open_info
                                .controller_handle
                                .expect("Controller handle must exist if opened by child controller"),
                        )
                    } else {
                        None
                    }
                })
            })
            .collect();
        child_handles.sort(); //dedup needs a sorted vector
        child_handles.dedup();
        child_handles
    }
}

/// Spin-locked protocol database instance.
///
/// The protocol database is a global singleton; access is only allowed through this wrapper, which
/// guards against concurrent mutation.
pub struct SpinLockedProtocolDb {
    inner: tpl_lock::TplMutex<ProtocolDb>,
}

impl Default for SpinLockedProtocolDb {
    fn default() -> Self {
        Self::new()
    }
}

impl SpinLockedProtocolDb {
    /// Creates a new instance of SpinLockedProtocolDb.
    pub const fn new() -> Self {
        SpinLockedProtocolDb { inner: tpl_lock::TplMutex::new(efi::TPL_NOTIFY, ProtocolDb::new(), "ProtocolLock") }
    }

    /// Resets the protocol database to its initial state.
    ///
    /// # Safety
    ///
    /// This call completely resets the protocol database and is intended mostly for use in test.
    ///
    #[cfg(test)]
    pub unsafe fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.handles.clear();
        inner.notifications.clear();
        inner.hash_new_handles = false;
        inner.next_handle = 1;
        inner.next_registration = 1;
        inner.database_key = 0;
    }

    fn lock(&self) -> tpl_lock::TplGuard<ProtocolDb> {
        self.inner.lock()
    }

    /// Returns a list of all the protocols that have been registered with the protocol database.
    pub fn registered_protocols(&self) -> Vec<efi::Guid> {
        self.lock().registered_protocols()
    }

    /// Initializes the protocol database. Installs the well-known handles, then enables hashing so that all
    /// subsequently created handles are opaque.
    pub fn init_protocol_db(&self) {
        let well_known_handle_guid: efi::Guid =
            unsafe { core::mem::transmute(*WELL_KNOWN_HANDLE_PROTOCOL_GUID.as_bytes()) };

        let well_known_handles = &[CORE_HANDLE, TIMER_HANDLE, WATCHDOG_HANDLE];

        for target_handle in well_known_handles.iter() {
            let (handle, _) = self
                .install_protocol_interface(None, well_known_handle_guid, core::ptr::null_mut())
                .expect("failed to install well-known handle");
            assert_eq!(handle, *target_handle);
        }
        self.lock().enable_handle_hashing();
    }

    /// Returns the current database key. The key changes on every mutation of the database, so callers can detect
    /// that handles appeared or vanished while they were working unlocked.
    pub fn database_key(&self) -> usize {
        self.lock().database_key
    }

    /// Installs a protocol interface on the given handle, or on a fresh handle if `handle` is `None`.
    ///
    /// Matches the semantics of EFI_BOOT_SERVICES.InstallProtocolInterface() in UEFI spec 2.10 section 7.3.2.
    ///
    /// On success, returns the handle on which the protocol was installed, along with the [`ProtocolNotify`]
    /// registrations whose events the caller must signal.
    pub fn install_protocol_interface(
        &self,
        handle: Option<efi::Handle>,
        guid: efi::Guid,
        interface: *mut c_void,
    ) -> Result<(efi::Handle, Vec<ProtocolNotify>), EfiError> {
        self.lock().install_protocol_interface(handle, guid, interface)
    }

    /// Removes a protocol interface from the given handle.
    ///
    /// Matches the semantics of EFI_BOOT_SERVICES.UninstallProtocolInterface() in UEFI spec 2.10 section 7.3.3,
    /// except that open interfaces are reported as `AccessDenied` rather than disconnected (the caller owns the
    /// disconnect machinery).
    pub fn uninstall_protocol_interface(
        &self,
        handle: efi::Handle,
        guid: efi::Guid,
        interface: *mut c_void,
    ) -> Result<(), EfiError> {
        self.lock().uninstall_protocol_interface(handle, guid, interface)
    }

    /// Returns the handles that have the specified protocol installed. `None` returns every handle.
    ///
    /// ## Errors
    ///
    /// Returns `NotFound` if no matching handles exist.
    pub fn locate_handles(&self, protocol: Option<efi::Guid>) -> Result<Vec<efi::Handle>, EfiError> {
        self.lock().locate_handles(protocol)
    }

    /// Returns an instance of the specified protocol interface from any handle.
    ///
    /// If multiple handles carry the protocol, no guarantee is made about which handle the interface comes from.
    pub fn locate_protocol(&self, protocol: efi::Guid) -> Result<*mut c_void, EfiError> {
        self.lock().locate_protocol(protocol)
    }

    /// Returns the interface for the specified protocol on the given handle if it exists.
    pub fn get_interface_for_handle(&self, handle: efi::Handle, protocol: efi::Guid) -> Result<*mut c_void, EfiError> {
        self.lock().get_interface_for_handle(handle, protocol)
    }

    /// Returns Ok(()) if the handle is a valid handle, Err(Status::INVALID_PARAMETER) otherwise.
    pub fn validate_handle(&self, handle: efi::Handle) -> Result<(), EfiError> {
        self.lock().validate_handle(handle)
    }

    /// Records a protocol usage on the specified handle/protocol.
    ///
    /// Generally matches EFI_BOOT_SERVICES.OpenProtocol() in UEFI spec 2.10 section 7.3.9, except that operations
    /// requiring the driver model (disconnecting a BY_DRIVER owner for an EXCLUSIVE open) are reported as errors
    /// for the caller to resolve.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyStarted` for a duplicate BY_DRIVER open by the same agent, `AccessDenied` for
    /// BY_DRIVER/EXCLUSIVE conflicts, and `Unsupported` if the handle does not carry the protocol.
    pub fn add_protocol_usage(
        &self,
        handle: efi::Handle,
        protocol: efi::Guid,
        agent_handle: Option<efi::Handle>,
        controller_handle: Option<efi::Handle>,
        attributes: u32,
    ) -> Result<(), EfiError> {
        self.lock().add_protocol_usage(handle, protocol, agent_handle, controller_handle, attributes)
    }

    /// Removes a protocol usage from the specified handle/protocol.
    ///
    /// Generally matches EFI_BOOT_SERVICES.CloseProtocol() in UEFI spec 2.10 section 7.3.10.
    pub fn remove_protocol_usage(
        &self,
        handle: efi::Handle,
        protocol: efi::Guid,
        agent_handle: Option<efi::Handle>,
        controller_handle: Option<efi::Handle>,
    ) -> Result<(), EfiError> {
        self.lock().remove_protocol_usage(handle, protocol, agent_handle, controller_handle)
    }

    /// Returns open protocol information for the given handle/protocol.
    ///
    /// Generally matches EFI_BOOT_SERVICES.OpenProtocolInformation() in UEFI spec 2.10 section 7.3.11.
    pub fn get_open_protocol_information_by_protocol(
        &self,
        handle: efi::Handle,
        protocol: efi::Guid,
    ) -> Result<Vec<OpenProtocolInformation>, EfiError> {
        self.lock().get_open_protocol_information_by_protocol(handle, protocol)
    }

    /// Returns open protocol information for every protocol on the given handle.
    pub fn get_open_protocol_information(
        &self,
        handle: efi::Handle,
    ) -> Result<Vec<(efi::Guid, Vec<OpenProtocolInformation>)>, EfiError> {
        self.lock().get_open_protocol_information(handle)
    }

    /// Returns the protocol GUIDs installed on the given handle.
    ///
    /// Generally matches EFI_BOOT_SERVICES.ProtocolsPerHandle() in UEFI spec 2.10 section 7.3.14.
    pub fn get_protocols_on_handle(&self, handle: efi::Handle) -> Result<Vec<efi::Guid>, EfiError> {
        self.lock().get_protocols_on_handle(handle)
    }

    /// Registers a notification event to be returned on protocol installation.
    ///
    /// Generally matches EFI_BOOT_SERVICES.RegisterProtocolNotify() in UEFI spec 2.10 section 7.3.5. This
    /// implementation does not fire the event; [`install_protocol_interface`](Self::install_protocol_interface)
    /// returns the notifies so the caller can fire them outside the lock.
    ///
    /// Returns a registration token for use with
    /// [`next_handle_for_registration`](Self::next_handle_for_registration).
    pub fn register_protocol_notify(&self, protocol: efi::Guid, event: efi::Event) -> Result<*mut c_void, EfiError> {
        self.lock().register_protocol_notify(protocol, event)
    }

    /// De-registers a list of previously installed protocol notifies.
    pub fn unregister_protocol_notify_events(&self, events: Vec<efi::Event>) {
        self.lock().unregister_protocol_notify_events(events);
    }

    /// Returns (and consumes) the next handle with a fresh installation matching the registration.
    pub fn next_handle_for_registration(&self, registration: *mut c_void) -> Option<efi::Handle> {
        self.lock().next_handle_for_registration(registration)
    }

    /// Returns the controller handles that have parent_handle open BY_CHILD_CONTROLLER.
    pub fn get_child_handles(&self, parent_handle: efi::Handle) -> Vec<efi::Handle> {
        self.lock().get_child_handles(parent_handle)
    }
}

unsafe impl Send for SpinLockedProtocolDb {}
unsafe impl Sync for SpinLockedProtocolDb {}

/// A hasher over the SplitMix64 output function. Not cryptographic; just enough mixing to make handle values
/// non-sequential and non-guessable.
///
/// https://prng.di.unimi.it/splitmix64.c
struct SplitMix64Hasher {
    state: u64,
}

impl SplitMix64Hasher {
    fn new(seed: u64) -> Self {
        SplitMix64Hasher { state: seed }
    }

    fn next_state(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E3779B97F4A7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^ (z >> 31)
    }
}

impl Default for SplitMix64Hasher {
    fn default() -> Self {
        SplitMix64Hasher::new(0x243F_6A88_85A3_08D3)
    }
}

impl Hasher for SplitMix64Hasher {
    fn finish(&self) -> u64 {
        self.state
    }

    fn write(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.state ^= byte as u64;
            self.state = self.next_state();
        }
    }
}
