//! GUID ordering and formatting helpers.
//!
//! `efi::Guid` implements neither `Ord` nor `Display`; this module supplies both so GUIDs can key
//! ordered maps and show up readably in logs.
//!
//! ## License
//!
//! Copyright (c) The Ember Firmware Authors.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

use r_efi::efi;

/// Newtype to wrap Guid for Ord (so it can be used as a key in ordered collections).
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub struct OrdGuid([u8; 16]);

impl From<efi::Guid> for OrdGuid {
    fn from(guid: efi::Guid) -> Self {
        OrdGuid(*guid.as_bytes())
    }
}

impl From<OrdGuid> for efi::Guid {
    fn from(guid: OrdGuid) -> Self {
        efi::Guid::from_bytes(&guid.0)
    }
}

/// Converts an `efi::Guid` to a [`uuid::Uuid`] for display purposes.
///
/// EFI GUIDs store the first three fields little-endian; `from_bytes_le` performs the swab.
pub fn as_uuid(guid: &efi::Guid) -> uuid::Uuid {
    uuid::Uuid::from_bytes_le(*guid.as_bytes())
}

/// Formats a GUID in the conventional `8-4-4-4-12` registry format for log output.
#[macro_export]
macro_rules! guid_fmt {
    ($guid:expr) => {
        $crate::guid::as_uuid(&$guid)
    };
}
