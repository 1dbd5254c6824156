//! Configuration Table Services
//!
//! Maintains the vendor table list published through the system table, and
//! provides the ACPI root-table lookup and SMBIOS entry point construction
//! built on top of it.
//!
//! ## License
//!
//! Copyright (c) The Ember Firmware Authors.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{boxed::Box, vec::Vec};
use core::{ffi::c_void, mem::size_of, slice::from_raw_parts_mut};
use ember_sdk::{error::EfiError, uefi_size_to_pages};
use r_efi::efi;

use crate::{
    events::EVENT_DB,
    memory_map::{AllocationStrategy, MEMORY_MAP},
    systemtables::{EfiSystemTable, SYSTEM_TABLE},
};

/// ACPI 2.0 (and later) RSDP configuration table GUID.
pub const ACPI_20_TABLE_GUID: efi::Guid =
    efi::Guid::from_fields(0x8868e871, 0xe4f1, 0x11d3, 0xbc, 0x22, &[0x00, 0x80, 0xc7, 0x3c, 0x88, 0x81]);

/// ACPI 1.0 RSDP configuration table GUID.
pub const ACPI_10_TABLE_GUID: efi::Guid =
    efi::Guid::from_fields(0xeb9d2d30, 0x2d88, 0x11d3, 0x9a, 0x16, &[0x00, 0x90, 0x27, 0x3f, 0xc1, 0x4d]);

/// SMBIOS entry point configuration table GUID.
pub const SMBIOS_TABLE_GUID: efi::Guid =
    efi::Guid::from_fields(0xeb9d2d31, 0x2d88, 0x11d3, 0x9a, 0x16, &[0x00, 0x90, 0x27, 0x3f, 0xc1, 0x4d]);

extern "efiapi" fn install_configuration_table(table_guid: *mut efi::Guid, table: *mut c_void) -> efi::Status {
    if table_guid.is_null() {
        return efi::Status::INVALID_PARAMETER;
    }

    let table_guid = unsafe { table_guid.read_unaligned() };

    let mut st_guard = SYSTEM_TABLE.lock();
    let st = match st_guard.as_mut() {
        Some(st) => st,
        None => return efi::Status::NOT_FOUND,
    };

    match core_install_configuration_table(table_guid, table, st) {
        Err(err) => err.into(),
        Ok(()) => efi::Status::SUCCESS,
    }
}

/// Adds, replaces, or (for a null `vendor_table`) deletes a vendor table entry.
///
/// The entry list is republished to the system table as a fresh boxed slice on
/// every mutation, and the system table CRC is recomputed. The vendor GUID is
/// signaled as an event group so interested parties can observe publication.
pub fn core_install_configuration_table(
    vendor_guid: efi::Guid,
    vendor_table: *mut c_void,
    efi_system_table: &mut EfiSystemTable,
) -> Result<(), EfiError> {
    let system_table = efi_system_table.as_mut();

    // Reclaim ownership of the currently published slice, if there is one.
    let published = if system_table.configuration_table.is_null() {
        assert_eq!(system_table.number_of_table_entries, 0);
        None
    } else {
        Some(unsafe {
            Box::from_raw(from_raw_parts_mut(system_table.configuration_table, system_table.number_of_table_entries))
        })
    };

    let mut entries: Vec<efi::ConfigurationTable> = published.as_deref().map(<[_]>::to_vec).unwrap_or_default();
    let position = entries.iter().position(|entry| entry.vendor_guid == vendor_guid);

    if vendor_table.is_null() {
        match position {
            Some(index) => {
                entries.remove(index);
            }
            None => {
                // Nothing to delete. The published slice (when present) stays
                // exactly where it was, so do not drop or re-publish it.
                if let Some(slice) = published {
                    let _ = Box::into_raw(slice);
                }
                return Err(EfiError::NotFound);
            }
        }
    } else {
        match position {
            Some(index) => entries[index].vendor_table = vendor_table,
            None => entries.push(efi::ConfigurationTable { vendor_guid, vendor_table }),
        }
    }

    if entries.is_empty() {
        system_table.number_of_table_entries = 0;
        system_table.configuration_table = core::ptr::null_mut();
    } else {
        system_table.number_of_table_entries = entries.len();
        system_table.configuration_table = Box::into_raw(entries.into_boxed_slice()) as *mut efi::ConfigurationTable;
    }
    // The previous slice (if any) is no longer referenced by the system table.
    drop(published);

    efi_system_table.checksum();

    EVENT_DB.signal_group(vendor_guid);

    Ok(())
}

/// Returns the vendor table registered for `guid`, if any.
pub fn find_configuration_table(guid: &efi::Guid) -> Option<*mut c_void> {
    let st_guard = SYSTEM_TABLE.lock();
    let st = st_guard.as_ref()?;
    let system_table = st.system_table();
    if system_table.configuration_table.is_null() {
        return None;
    }
    let entries =
        unsafe { core::slice::from_raw_parts(system_table.configuration_table, system_table.number_of_table_entries) };
    entries.iter().find(|entry| entry.vendor_guid == *guid).map(|entry| entry.vendor_table)
}

/// ACPI root system description pointer (revision 2 layout).
#[repr(C, packed)]
pub struct AcpiRsdp {
    pub signature: u64,
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub revision: u8,
    pub rsdt_address: u32,
    pub length: u32,
    pub xsdt_address: u64,
    pub extended_checksum: u8,
    pub reserved: [u8; 3],
}

/// Common header shared by every ACPI description table.
#[repr(C, packed)]
pub struct AcpiDescriptionHeader {
    pub signature: u32,
    pub length: u32,
    pub revision: u8,
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub oem_table_id: u64,
    pub oem_revision: u32,
    pub creator_id: u32,
    pub creator_revision: u32,
}

/// Finds the ACPI description table whose 32-bit signature matches `signature`.
///
/// The RSDP is located through the ACPI 2.0 configuration table GUID, falling
/// back to the 1.0 GUID. Root table entries are walked in reverse so that a
/// table overriding an earlier copy is found first. When `previous` is
/// supplied, matching resumes with the entry just before it, which lets a
/// caller enumerate every instance of a signature (e.g. multiple SSDTs).
///
/// ## Safety
///
/// The RSDP registered in the configuration table, the root table it points
/// to, and every entry in that root table must be valid, accessible mappings.
pub unsafe fn get_acpi_table(
    signature: u32,
    previous: Option<*const AcpiDescriptionHeader>,
) -> Option<*const AcpiDescriptionHeader> {
    let rsdp = find_configuration_table(&ACPI_20_TABLE_GUID)
        .or_else(|| find_configuration_table(&ACPI_10_TABLE_GUID))? as *const AcpiRsdp;
    let rsdp = unsafe { &*rsdp };

    // Prefer the 64-bit entry array when the platform published one.
    let (entries_base, entry_size, root) = if rsdp.revision >= 2 && rsdp.xsdt_address != 0 {
        (rsdp.xsdt_address as usize + size_of::<AcpiDescriptionHeader>(), size_of::<u64>(), rsdp.xsdt_address as usize)
    } else {
        (rsdp.rsdt_address as usize + size_of::<AcpiDescriptionHeader>(), size_of::<u32>(), rsdp.rsdt_address as usize)
    };

    let root_length = unsafe { (*(root as *const AcpiDescriptionHeader)).length } as usize;
    let entry_count = root_length.saturating_sub(size_of::<AcpiDescriptionHeader>()) / entry_size;

    let mut skipping = previous.is_some();
    for index in (0..entry_count).rev() {
        let entry_address = entries_base + index * entry_size;
        let table = if entry_size == size_of::<u64>() {
            unsafe { core::ptr::read_unaligned(entry_address as *const u64) as usize }
        } else {
            unsafe { core::ptr::read_unaligned(entry_address as *const u32) as usize }
        } as *const AcpiDescriptionHeader;
        if skipping {
            if Some(table) == previous {
                skipping = false;
            }
            continue;
        }
        if unsafe { (*table).signature } == signature {
            return Some(table);
        }
    }
    None
}

const SMBIOS_ANCHOR: [u8; 4] = *b"_SM_";
const SMBIOS_INTERMEDIATE_ANCHOR: [u8; 5] = *b"_DMI_";
const SMBIOS_ENTRY_POINT_LENGTH: u8 = 0x1f;
const SMBIOS_MAJOR_VERSION: u8 = 2;
const SMBIOS_MINOR_VERSION: u8 = 8;
const SMBIOS_BCD_REVISION: u8 = 0x28;
// The intermediate anchor starts at this offset; its checksum covers the
// remainder of the entry point.
const SMBIOS_INTERMEDIATE_OFFSET: usize = 0x10;

/// SMBIOS 2.8 entry point structure.
#[repr(C, packed)]
pub struct SmbiosEntryPoint {
    pub anchor: [u8; 4],
    pub checksum: u8,
    pub entry_point_length: u8,
    pub major_version: u8,
    pub minor_version: u8,
    pub max_structure_size: u16,
    pub entry_point_revision: u8,
    pub formatted_area: [u8; 5],
    pub intermediate_anchor: [u8; 5],
    pub intermediate_checksum: u8,
    pub structure_table_length: u16,
    pub structure_table_address: u32,
    pub number_of_structures: u16,
    pub bcd_revision: u8,
}

fn checksum_byte(bytes: &[u8]) -> u8 {
    0u8.wrapping_sub(bytes.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte)))
}

fn entry_point_bytes(entry: &SmbiosEntryPoint) -> [u8; SMBIOS_ENTRY_POINT_LENGTH as usize] {
    let mut raw = [0u8; SMBIOS_ENTRY_POINT_LENGTH as usize];
    raw.copy_from_slice(unsafe {
        core::slice::from_raw_parts(entry as *const SmbiosEntryPoint as *const u8, size_of::<SmbiosEntryPoint>())
    });
    raw
}

/// Builds a fully checksummed SMBIOS 2.8 entry point describing a structure
/// table at `structure_table_address`.
pub fn smbios_entry_point(
    structure_table_address: u32,
    structure_table_length: u16,
    number_of_structures: u16,
    max_structure_size: u16,
) -> SmbiosEntryPoint {
    let mut entry = SmbiosEntryPoint {
        anchor: SMBIOS_ANCHOR,
        checksum: 0,
        entry_point_length: SMBIOS_ENTRY_POINT_LENGTH,
        major_version: SMBIOS_MAJOR_VERSION,
        minor_version: SMBIOS_MINOR_VERSION,
        max_structure_size,
        entry_point_revision: 0,
        formatted_area: [0u8; 5],
        intermediate_anchor: SMBIOS_INTERMEDIATE_ANCHOR,
        intermediate_checksum: 0,
        structure_table_length,
        structure_table_address,
        number_of_structures,
        bcd_revision: SMBIOS_BCD_REVISION,
    };
    // The intermediate checksum is covered by the overall checksum, so it must
    // be final before the overall checksum is computed.
    entry.intermediate_checksum = checksum_byte(&entry_point_bytes(&entry)[SMBIOS_INTERMEDIATE_OFFSET..]);
    entry.checksum = checksum_byte(&entry_point_bytes(&entry));
    entry
}

/// Places the SMBIOS entry point and structure table in a page-aligned
/// runtime-data allocation and publishes it through the configuration table.
pub fn install_smbios_tables(
    structures: &[u8],
    number_of_structures: u16,
    max_structure_size: u16,
) -> Result<(), EfiError> {
    if structures.is_empty() || structures.len() > u16::MAX as usize {
        return Err(EfiError::InvalidParameter);
    }

    let total = size_of::<SmbiosEntryPoint>() + structures.len();
    // The entry point's structure table address field is 32 bits wide, so the
    // whole allocation must sit below 4 GiB.
    let address = MEMORY_MAP.allocate_pages(
        AllocationStrategy::MaxAddress(u32::MAX as efi::PhysicalAddress),
        efi::RUNTIME_SERVICES_DATA,
        uefi_size_to_pages!(total) as u64,
    )?;

    let structure_table_address = address as u32 + size_of::<SmbiosEntryPoint>() as u32;
    let entry =
        smbios_entry_point(structure_table_address, structures.len() as u16, number_of_structures, max_structure_size);
    unsafe {
        core::ptr::write(address as usize as *mut SmbiosEntryPoint, entry);
        core::ptr::copy_nonoverlapping(structures.as_ptr(), structure_table_address as usize as *mut u8, structures.len());
    }

    let mut st_guard = SYSTEM_TABLE.lock();
    let st = st_guard.as_mut().ok_or(EfiError::NotFound)?;
    core_install_configuration_table(SMBIOS_TABLE_GUID, address as usize as *mut c_void, st)
}

pub fn init_config_tables_support(bs: &mut efi::BootServices) {
    bs.install_configuration_table = install_configuration_table;
}
