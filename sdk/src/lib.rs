//! Ember SDK
//!
//! Shared types for the Ember firmware core: the rusty status model used by
//! all crates in the workspace, and GUID ordering/formatting helpers.
//!
//! ## License
//!
//! Copyright (c) The Ember Firmware Authors.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(not(test), no_std)]

pub mod base;
pub mod error;
pub mod guid;
