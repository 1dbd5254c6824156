//! Device Path Utilities
//!
//! A device path is a length-prefixed sequence of nodes terminated by an end-of-entire-path node.
//! End-of-instance nodes separate instances within a multi-instance path. Paths are treated as
//! immutable byte sequences; all editing operations produce new allocations.
//!
//! ## License
//!
//! Copyright (c) The Ember Firmware Authors.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![no_std]

extern crate alloc;

use alloc::{boxed::Box, vec, vec::Vec};
use core::{mem::size_of, ptr::slice_from_raw_parts, slice::from_raw_parts};

use r_efi::efi;

/// Sanity limit on the number of nodes in a single device path.
pub const MAX_DEVICE_PATH_NODE_COUNT: usize = 255;

/// Returns the count of nodes and size (in bytes) of the given device path.
///
/// Count and size outputs both include the terminating end node. Fails with
/// `InvalidParameter` on a null pointer, a node shorter than its own header, or a path exceeding
/// [`MAX_DEVICE_PATH_NODE_COUNT`] nodes.
///
/// ## Safety
///
/// `device_path` must be a valid pointer to a well-formed device path.
pub fn device_path_node_count(
    device_path: *const efi::protocols::device_path::Protocol,
) -> Result<(usize, usize), efi::Status> {
    let mut node_count = 0;
    let mut path_size: usize = 0;
    let mut current_node_ptr = device_path;
    if current_node_ptr.is_null() {
        return Err(efi::Status::INVALID_PARAMETER);
    }
    loop {
        let current_node = unsafe { current_node_ptr.read_unaligned() };
        let current_length: usize = u16::from_le_bytes(current_node.length).into();
        if current_length < size_of::<efi::protocols::device_path::Protocol>() {
            return Err(efi::Status::INVALID_PARAMETER);
        }
        node_count += 1;
        path_size += current_length;
        if node_count > MAX_DEVICE_PATH_NODE_COUNT {
            return Err(efi::Status::INVALID_PARAMETER);
        }

        if current_node.r#type == efi::protocols::device_path::TYPE_END
            && current_node.sub_type == efi::protocols::device_path::End::SUBTYPE_ENTIRE
        {
            break;
        }

        let offset = current_length.try_into().map_err(|_| efi::Status::INVALID_PARAMETER)?;
        current_node_ptr = unsafe { current_node_ptr.byte_offset(offset) };
    }
    Ok((node_count, path_size))
}

/// Returns the device path as a byte slice, including the terminating end node.
pub fn device_path_as_slice(
    device_path: *const efi::protocols::device_path::Protocol,
) -> Result<&'static [u8], efi::Status> {
    let (_, byte_count) = device_path_node_count(device_path)?;
    unsafe { Ok(from_raw_parts(device_path as *const u8, byte_count)) }
}

/// Copies the device path into an owned boxed byte slice.
pub fn duplicate_device_path(
    device_path: *const efi::protocols::device_path::Protocol,
) -> Result<Box<[u8]>, efi::Status> {
    let path_slice = device_path_as_slice(device_path)?;
    Ok(path_slice.to_vec().into_boxed_slice())
}

/// Computes the remaining device path and the number of nodes in common for two device paths.
///
/// If device path `a` is a prefix of (or identical to) device path `b`, the result is
/// `Some((pointer to the portion of b after the prefix, nodes_in_common))`. If `a` is not a prefix
/// of `b`, the result is `None`. `nodes_in_common` does not count the terminating end node.
///
/// ## Safety
///
/// `a` and `b` must be valid pointers to well-formed device paths.
pub fn remaining_device_path(
    a: *const efi::protocols::device_path::Protocol,
    b: *const efi::protocols::device_path::Protocol,
) -> Option<(*const efi::protocols::device_path::Protocol, usize)> {
    let mut a_ptr = a;
    let mut b_ptr = b;
    let mut node_count = 0;
    loop {
        let a_node = unsafe { a_ptr.read_unaligned() };
        let b_node = unsafe { b_ptr.read_unaligned() };

        if is_device_path_end(a_ptr) {
            return Some((b_ptr, node_count));
        }

        node_count += 1;

        let a_length: usize = u16::from_le_bytes(a_node.length).into();
        let b_length: usize = u16::from_le_bytes(b_node.length).into();
        let a_slice = unsafe { slice_from_raw_parts(a_ptr as *const u8, a_length).as_ref() };
        let b_slice = unsafe { slice_from_raw_parts(b_ptr as *const u8, b_length).as_ref() };

        if a_slice != b_slice {
            return None;
        }

        let a_offset: isize = a_length.try_into().ok()?;
        let b_offset: isize = b_length.try_into().ok()?;
        a_ptr = unsafe { a_ptr.byte_offset(a_offset) };
        b_ptr = unsafe { b_ptr.byte_offset(b_offset) };
    }
}

/// Determines whether the given pointer points at an end-of-entire-path node.
///
/// A null pointer is treated as the end of the path.
pub fn is_device_path_end(device_path: *const efi::protocols::device_path::Protocol) -> bool {
    match unsafe { device_path.as_ref() } {
        Some(node) => {
            node.r#type == efi::protocols::device_path::TYPE_END
                && node.sub_type == efi::protocols::device_path::End::SUBTYPE_ENTIRE
        }
        None => true,
    }
}

/// Determines whether the given pointer points at an end-of-instance node.
pub fn is_device_path_instance_end(device_path: *const efi::protocols::device_path::Protocol) -> bool {
    match unsafe { device_path.as_ref() } {
        Some(node) => {
            node.r#type == efi::protocols::device_path::TYPE_END
                && node.sub_type == efi::protocols::device_path::End::SUBTYPE_INSTANCE
        }
        None => false,
    }
}

/// Produces a new byte vector that is the concatenation of `a` and `b`.
///
/// The end node of `a` is dropped; the result is terminated by `b`'s end node.
pub fn append_device_path(
    a: *const efi::protocols::device_path::Protocol,
    b: *const efi::protocols::device_path::Protocol,
) -> Result<Box<[u8]>, efi::Status> {
    let a_slice = device_path_as_slice(a)?;
    let b_slice = device_path_as_slice(b)?;
    let end_node_size = size_of::<efi::protocols::device_path::End>();
    let mut out_bytes = vec![0u8; a_slice.len() + b_slice.len() - end_node_size];
    out_bytes[..a_slice.len()].copy_from_slice(a_slice);
    out_bytes[a_slice.len() - end_node_size..].copy_from_slice(b_slice);
    Ok(out_bytes.into_boxed_slice())
}

/// Splits a (potentially multi-instance) device path into its instances.
///
/// Each returned instance is a standalone path terminated by an end-of-entire-path node; the
/// end-of-instance separators are not present in the output.
pub fn device_path_instances(
    device_path: *const efi::protocols::device_path::Protocol,
) -> Result<Vec<Box<[u8]>>, efi::Status> {
    const END_ENTIRE: [u8; 4] =
        [efi::protocols::device_path::TYPE_END, efi::protocols::device_path::End::SUBTYPE_ENTIRE, 0x04, 0x00];

    // Validates the path and bounds the walk below.
    device_path_node_count(device_path)?;

    let mut instances = Vec::new();
    let mut current = Vec::new();
    for node in unsafe { DevicePathWalker::new(device_path) } {
        if node.header.r#type == efi::protocols::device_path::TYPE_END {
            current.extend_from_slice(&END_ENTIRE);
            instances.push(core::mem::take(&mut current).into_boxed_slice());
            if node.header.sub_type == efi::protocols::device_path::End::SUBTYPE_ENTIRE {
                break;
            }
        } else {
            current.extend_from_slice(&node.as_bytes());
        }
    }
    Ok(instances)
}

/// Device Path Node
#[derive(Debug)]
pub struct DevicePathNode {
    pub header: efi::protocols::device_path::Protocol,
    pub data: Vec<u8>,
}

impl PartialEq for DevicePathNode {
    fn eq(&self, other: &Self) -> bool {
        self.header.r#type == other.header.r#type
            && self.header.sub_type == other.header.sub_type
            && self.data == other.data
    }
}
impl Eq for DevicePathNode {}

impl DevicePathNode {
    /// Create a DevicePathNode from a raw pointer.
    ///
    /// ## Safety
    /// Caller must ensure that the raw pointer points to a valid device path node structure.
    pub unsafe fn new(node: *const efi::protocols::device_path::Protocol) -> Option<Self> {
        let header = core::ptr::read_unaligned(node);
        let header_size = size_of::<efi::protocols::device_path::Protocol>();
        let node_len = u16::from_le_bytes(header.length);
        let data_len = (node_len as usize).checked_sub(header_size)?;
        let data_ptr = node.byte_offset(header_size.try_into().ok()?) as *const u8;
        let data = from_raw_parts(data_ptr, data_len).to_vec();
        Some(Self { header, data })
    }

    /// Returns the node serialized as its on-path byte representation.
    pub fn as_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![self.header.r#type, self.header.sub_type, self.header.length[0], self.header.length[1]];
        bytes.extend_from_slice(&self.data);
        bytes
    }

    fn len(&self) -> u16 {
        u16::from_le_bytes(self.header.length)
    }
}

/// Iterator that returns [`DevicePathNode`]s for a given raw device path pointer.
///
/// The iterator copies node data into owned structures to confine the unsafe raw pointer
/// operations needed for direct interaction with a device path.
pub struct DevicePathWalker {
    next_node: Option<*const efi::protocols::device_path::Protocol>,
}

impl DevicePathWalker {
    /// Creates an iterator over the nodes of the given raw device path.
    ///
    /// ## Safety
    /// Caller must ensure that the raw pointer points to a valid device path structure,
    /// including a proper device path end node.
    pub unsafe fn new(device_path: *const efi::protocols::device_path::Protocol) -> Self {
        Self { next_node: Some(device_path) }
    }
}

impl Iterator for DevicePathWalker {
    type Item = DevicePathNode;
    fn next(&mut self) -> Option<Self::Item> {
        let node = self.next_node?;
        let current = unsafe { DevicePathNode::new(node)? };
        if is_device_path_end(node) {
            self.next_node = None;
        } else {
            self.next_node = Some(unsafe { node.byte_offset(current.len().try_into().ok()?) });
        }
        Some(current)
    }
}
