// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Address-space management for SMMU translation units.
//!
//! Clients register domains made of fixed IOVA partitions, allocate ranges from them, map those
//! ranges and attach the contexts of translation units to the domains. The page tables of secure
//! domains are owned by a privileged monitor, so their mappings are sent to it as requests rather
//! than written directly.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod attach;
pub mod config;
pub mod context;
pub mod domain;
pub mod error;
pub mod logger;
pub mod manager;
pub mod partition;
#[cfg(feature = "perfmon")]
pub mod perfmon;
pub mod platform;
pub mod secure;
pub mod smccc;

pub use crate::{
    config::{ContextConfig, DomainFlags, DomainLayout, PartitionLayout, UnitConfig},
    domain::{DomainHandle, Prot},
    error::Error,
    manager::{AddressSpaceManager, DomainRef},
    platform::Platform,
    secure::Segment,
};
