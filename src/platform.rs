// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The interface between the manager and the hardware it runs on.

#[cfg(test)]
pub(crate) mod test;

#[cfg(feature = "perfmon")]
use crate::perfmon::PerfCounterHardware;
use crate::{
    attach::UnitPower, config::DomainFlags, domain::PageTable, error::Error,
    secure::SecureMonitor,
};

/// The hooks implemented by all platforms.
///
/// A platform owns the collaborators the manager reaches through traits: the privileged monitor,
/// the power and clock controls of each unit, the page-table objects of non-secure domains, and
/// (with the `perfmon` feature) the performance counter registers.
pub trait Platform: Send + Sync {
    /// The granule in bytes of IOVA allocations. Must be a power of two.
    const ALLOCATION_QUANTUM: u64 = 0x1000;

    /// Platform dependent SecureMonitor implementation type.
    type Monitor: SecureMonitor;

    /// Platform dependent UnitPower implementation type.
    type Power: UnitPower;

    /// Platform dependent PageTable implementation type.
    type PageTable: PageTable;

    /// Platform dependent PerfCounterHardware implementation type.
    #[cfg(feature = "perfmon")]
    type Pmu: PerfCounterHardware;

    /// Returns the link to the privileged monitor.
    fn monitor(&self) -> &Self::Monitor;

    /// Returns the power and clock controls of the units.
    fn power(&self) -> &Self::Power;

    /// Returns the performance counter registers of the units.
    #[cfg(feature = "perfmon")]
    fn pmu(&self) -> &Self::Pmu;

    /// Creates the page-table object of a new domain.
    ///
    /// Secure domains get an object bound to the secure namespace; their tables are only ever
    /// written by the monitor.
    fn create_page_table(&self, secure: bool, flags: DomainFlags) -> Result<Self::PageTable, Error>;

    /// Allocates `size` bytes of physically contiguous memory and returns its physical address.
    fn allocate_contiguous(&self, size: u64) -> Option<u64>;

    /// Frees memory returned by [`Platform::allocate_contiguous`].
    fn free_contiguous(&self, physical_address: u64, size: u64);

    /// Returns the physical address of a buffer, so that the monitor can read it.
    fn physical_address(&self, buffer: &[u8]) -> u64;
}
