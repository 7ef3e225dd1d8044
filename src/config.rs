// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Parsed configuration consumed by the manager.
//!
//! These come from board or device configuration outside this crate. Only the parsed form is
//! specified here, not the file format it was read from.

use crate::error::Error;
use alloc::{
    borrow::ToOwned,
    string::{String, ToString},
    vec::Vec,
};
use arrayvec::ArrayVec;
use bitflags::bitflags;

/// Maximum number of stream IDs a single context bank can claim.
pub const MAX_STREAM_IDS: usize = 32;

bitflags! {
    /// Flags passed through to the page-table object when a domain is created.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[repr(transparent)]
    pub struct DomainFlags: u32 {
        /// Table walks by the hardware go through the cache.
        const PT_CACHEABLE = 1 << 0;
    }
}

/// One fixed virtual-address range of a domain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PartitionLayout {
    /// First address of the range.
    pub base: u64,
    /// Size of the range in bytes. A zero-sized partition keeps its index but is never allocated
    /// from.
    pub size: u64,
}

impl PartitionLayout {
    /// Creates a layout for `[base, base + size)`.
    pub const fn new(base: u64, size: u64) -> Self {
        Self { base, size }
    }
}

/// Everything needed to register a domain.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DomainLayout {
    /// The partitions, addressed by their index in this list.
    pub partitions: Vec<PartitionLayout>,
    /// Whether the domain's page tables are owned by the monitor.
    pub secure: bool,
    /// Flags for the page-table object.
    pub flags: DomainFlags,
    /// Name of the client, for diagnostics.
    pub client_name: Option<String>,
}

impl DomainLayout {
    /// Creates a non-secure layout with the given partitions.
    pub fn new(partitions: &[PartitionLayout]) -> Self {
        Self {
            partitions: partitions.to_vec(),
            ..Default::default()
        }
    }

    /// Marks the domain as secure, i.e. its page tables are owned by the monitor.
    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    /// Sets the page-table flags.
    pub fn with_flags(mut self, flags: DomainFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Names the client that owns the domain.
    pub fn with_client_name(mut self, name: &str) -> Self {
        self.client_name = Some(name.to_owned());
        self
    }
}

/// A bus-fabric-bypass register write staged at registration and applied on every attach.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BfbSetting {
    /// Register offset within the unit.
    pub offset: u32,
    /// Value written to the register.
    pub value: u32,
}

/// Configuration of one hardware translation unit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnitConfig {
    /// Unique name of the unit.
    pub name: String,
    /// The id the monitor knows the unit by. Units with a secure id are secure units.
    pub secure_id: Option<u32>,
    /// Register writes applied each time a context of the unit is attached.
    pub bfb_settings: Vec<BfbSetting>,
}

impl UnitConfig {
    /// Creates the configuration of a non-secure unit without BFB settings.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            secure_id: None,
            bfb_settings: Vec::new(),
        }
    }

    /// Makes the unit a secure unit known to the monitor as `secure_id`.
    pub fn with_secure_id(mut self, secure_id: u32) -> Self {
        self.secure_id = Some(secure_id);
        self
    }

    /// Stages the BFB register writes.
    pub fn with_bfb_settings(mut self, settings: &[BfbSetting]) -> Self {
        self.bfb_settings = settings.to_vec();
        self
    }

    /// Returns whether the unit's page tables are programmed by the monitor.
    pub fn is_secure(&self) -> bool {
        self.secure_id.is_some()
    }
}

/// Configuration of one context bank of a unit.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ContextConfig {
    /// Name of the context, unique across all units.
    pub name: String,
    /// Index of the context bank within its unit.
    pub bank: u32,
    /// Stream IDs routed to the context bank.
    pub stream_ids: ArrayVec<u16, MAX_STREAM_IDS>,
}

impl ContextConfig {
    /// Creates a context bank configuration without stream IDs.
    pub fn new(name: &str, bank: u32) -> Self {
        Self {
            name: name.to_owned(),
            bank,
            stream_ids: ArrayVec::new(),
        }
    }

    /// Adds the stream IDs claimed by the context bank.
    pub fn with_stream_ids(mut self, stream_ids: &[u16]) -> Result<Self, Error> {
        self.stream_ids
            .try_extend_from_slice(stream_ids)
            .map_err(|_| Error::TooManyStreamIds(self.name.to_string()))?;
        Ok(self)
    }
}
