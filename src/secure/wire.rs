// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Flat request and response layouts exchanged with the monitor.
//!
//! All structures are `repr(C)` without padding, so they can be passed to the monitor as raw bytes.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Map request flag asking the monitor to invalidate the unit's TLB after the update.
pub const FLAG_TLB_INVALIDATE: u32 = 1 << 0;

/// Response of every command except [`PtblSizeResponse`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct StatusResponse {
    /// 0 on success.
    pub status: i32,
}

/// Asks the monitor to configure a secure unit.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct ConfigRequest {
    /// Secure id of the unit.
    pub id: u32,
    /// Always 0.
    pub spare: u32,
}

/// Asks how much memory the monitor needs for its page-table pool.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct PtblSizeRequest {
    /// Always 0.
    pub spare: u32,
}

/// Response to [`PtblSizeRequest`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct PtblSizeResponse {
    /// Bytes of physically contiguous memory needed.
    pub size: u32,
    /// 0 on success.
    pub status: i32,
}

/// Hands the monitor memory for its page-table pool.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct PtblInitRequest {
    /// Physical address of the memory.
    pub paddr: u64,
    /// Size of the memory in bytes.
    pub size: u32,
    /// Always 0.
    pub spare: u32,
}

/// A list of physical chunk addresses, all of `size` bytes.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct PhysicalList {
    /// Physical address of an array of `list_size` u64 chunk addresses.
    pub list: u64,
    /// Number of entries in the array.
    pub list_size: u32,
    /// Always 0.
    pub reserved: u32,
    /// Size of each chunk in bytes.
    pub size: u64,
}

/// Which unit, context bank and virtual range a request is about.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct MappingInfo {
    /// Secure id of the unit.
    pub id: u32,
    /// Context bank index.
    pub ctx_id: u32,
    /// Start of the virtual range.
    pub va: u64,
    /// Size of the virtual range in bytes.
    pub size: u64,
}

/// Maps a virtual range to a list of physical chunks.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct MapRequest {
    /// The physical chunks, in virtual address order.
    pub plist: PhysicalList,
    /// The range being mapped.
    pub info: MappingInfo,
    /// `FLAG_*` bits.
    pub flags: u32,
    /// Always 0.
    pub reserved: u32,
}

/// Unmaps a virtual range.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, FromBytes, Immutable, IntoBytes, KnownLayout)]
#[repr(C)]
pub struct UnmapRequest {
    /// The range being unmapped.
    pub info: MappingInfo,
    /// `FLAG_*` bits.
    pub flags: u32,
    /// Always 0.
    pub reserved: u32,
}
