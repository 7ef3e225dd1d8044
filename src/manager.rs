// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! The entry point clients use: domains, IOVA allocation, mapping and attachment.

use crate::{
    attach::{self, AttachObserver},
    config::{ContextConfig, DomainLayout, UnitConfig},
    context::{Context, ContextRegistry, Unit},
    domain::{Domain, DomainHandle, DomainRegistry, PageTable, Prot},
    error::Error,
    platform::Platform,
    secure::{SecureMediator, Segment},
};
#[cfg(feature = "perfmon")]
use crate::perfmon::{CounterValue, MonitorState, PerfMonitor};
use alloc::{sync::Arc, vec::Vec};
use core::fmt::{self, Debug, Formatter};
#[cfg(feature = "perfmon")]
use log::info;
use log::{error, warn};

/// A domain of the manager's platform.
pub type DomainRef<P> = Arc<Domain<<P as Platform>::PageTable>>;

/// Owns every domain, unit and context of one platform.
///
/// All methods take `&self`, so the manager can be shared between threads in an `Arc`.
pub struct AddressSpaceManager<P: Platform> {
    platform: P,
    domains: DomainRegistry<P::PageTable>,
    contexts: ContextRegistry,
    #[cfg(feature = "perfmon")]
    perfmon: PerfMonitor,
}

impl<P: Platform> AddressSpaceManager<P> {
    /// Creates a manager with no units or domains.
    pub fn new(platform: P) -> Self {
        Self {
            platform,
            domains: DomainRegistry::new(),
            contexts: ContextRegistry::new(),
            #[cfg(feature = "perfmon")]
            perfmon: PerfMonitor::new(),
        }
    }

    /// Hands the monitor its page table pool, once all units have been registered.
    ///
    /// A failure is logged but not fatal: non-secure domains keep working without the pool.
    pub fn init(&self) {
        if let Err(e) = self.mediator().init_page_table_pool(&self.contexts.units()) {
            error!("Failed to initialise secure page table pool: {e}");
        }
    }

    /// Returns the platform the manager drives.
    pub fn platform(&self) -> &P {
        &self.platform
    }

    fn mediator(&self) -> SecureMediator<'_, P> {
        SecureMediator::new(&self.platform)
    }

    #[cfg(feature = "perfmon")]
    fn observer(&self) -> &impl AttachObserver<P> {
        &self.perfmon
    }

    #[cfg(not(feature = "perfmon"))]
    fn observer(&self) -> &impl AttachObserver<P> {
        &()
    }

    /// Registers a translation unit.
    pub fn register_unit(&self, config: UnitConfig) -> Result<Arc<Unit>, Error> {
        self.contexts.register_unit(config)
    }

    /// Returns all registered units in registration order.
    pub fn units(&self) -> Vec<Arc<Unit>> {
        self.contexts.units()
    }

    /// Adds a context bank to a registered unit.
    pub fn add_context(&self, unit: &str, config: ContextConfig) -> Result<Arc<Context>, Error> {
        self.contexts.add_context(unit, config)
    }

    /// Removes a context that is not attached to any domain.
    pub fn remove_context(&self, name: &str) -> Result<(), Error> {
        self.contexts.remove_context(name)
    }

    /// Finds a context by name among the contexts of all units.
    pub fn get_context(&self, name: &str) -> Result<Arc<Context>, Error> {
        self.contexts.get_context(name)
    }

    /// Creates a domain and returns its handle.
    pub fn register_domain(&self, layout: &DomainLayout) -> Result<DomainHandle, Error> {
        let table = self
            .platform
            .create_page_table(layout.secure, layout.flags)?;
        self.domains.register(layout, table, P::ALLOCATION_QUANTUM)
    }

    /// Looks up a domain by handle.
    pub fn get_domain(&self, handle: DomainHandle) -> Option<DomainRef<P>> {
        self.domains.get(handle)
    }

    /// Returns the handle of a domain registered with this manager.
    pub fn find_domain_no(&self, domain: &DomainRef<P>) -> Result<DomainHandle, Error> {
        self.domains.find_handle(domain)
    }

    /// Returns all registered domains in handle order.
    pub fn domains(&self) -> Vec<DomainRef<P>> {
        self.domains.domains()
    }

    fn domain(&self, handle: DomainHandle) -> Result<DomainRef<P>, Error> {
        self.domains.get(handle).ok_or(Error::InvalidHandle(handle))
    }

    /// Allocates `size` bytes aligned to `align` from a partition of the domain.
    pub fn allocate_iova(
        &self,
        handle: DomainHandle,
        partition: usize,
        size: u64,
        align: u64,
    ) -> Result<u64, Error> {
        self.domain(handle)?.allocate(partition, size, align)
    }

    /// Frees a range returned by [`AddressSpaceManager::allocate_iova`].
    pub fn free_iova(
        &self,
        iova: u64,
        handle: DomainHandle,
        partition: usize,
        size: u64,
    ) -> Result<(), Error> {
        self.domain(handle)?.free(partition, iova, size)
    }

    /// Maps `[iova, iova + len)` to the physically contiguous `[phys, phys + len)`.
    ///
    /// Secure domains are mapped by the monitor through their first attached context.
    pub fn map(
        &self,
        domain: &Domain<P::PageTable>,
        iova: u64,
        phys: u64,
        len: u64,
        prot: Prot,
    ) -> Result<(), Error> {
        if domain.is_secure() {
            let context = domain
                .first_attached()
                .ok_or(Error::NotAttached(domain.handle()))?;
            self.mediator().map(&context, iova, phys, len)
        } else {
            domain
                .table
                .lock()
                .map(iova, phys, len, prot)
                .map_err(|_| Error::PageTable { iova })
        }
    }

    /// Maps `[iova, iova + len)` to the pieces of a scatter list, in order.
    pub fn map_range(
        &self,
        domain: &Domain<P::PageTable>,
        iova: u64,
        segments: &[Segment],
        len: u64,
        prot: Prot,
    ) -> Result<(), Error> {
        if domain.is_secure() {
            let context = domain
                .first_attached()
                .ok_or(Error::NotAttached(domain.handle()))?;
            return self.mediator().map_range(&context, iova, segments, len);
        }

        let mut table = domain.table.lock();
        let mut mapped = 0;
        for segment in segments {
            if mapped == len {
                break;
            }
            let size = segment.length.min(len - mapped);
            if table
                .map(iova + mapped, segment.physical_address, size, prot)
                .is_err()
            {
                table.unmap(iova, mapped);
                return Err(Error::PageTable {
                    iova: iova + mapped,
                });
            }
            mapped += size;
        }
        if mapped < len {
            table.unmap(iova, mapped);
            return Err(Error::InvalidArgument(
                "scatter list is shorter than the mapping",
            ));
        }
        Ok(())
    }

    /// Unmaps `[iova, iova + len)`, returning the number of bytes unmapped.
    pub fn unmap(&self, domain: &Domain<P::PageTable>, iova: u64, len: u64) -> u64 {
        if domain.is_secure() {
            match domain.first_attached() {
                Some(context) => self.mediator().unmap(&context, iova, len),
                None => {
                    warn!(
                        "Unmap from domain {} with no attached context",
                        domain.handle()
                    );
                    0
                }
            }
        } else {
            domain.table.lock().unmap(iova, len)
        }
    }

    /// Allocates an IOVA range and maps it to the physically contiguous buffer at `phys`.
    ///
    /// The range is mapped read/write, and cacheable if `cached`. If the mapping fails the range is
    /// freed again.
    pub fn map_contig(
        &self,
        phys: u64,
        handle: DomainHandle,
        partition: usize,
        size: u64,
        align: u64,
        cached: bool,
    ) -> Result<u64, Error> {
        if !align.is_power_of_two() {
            return Err(Error::InvalidAlignment(align));
        }
        if size & (align - 1) != 0 {
            return Err(Error::InvalidArgument(
                "size is not a multiple of the alignment",
            ));
        }

        let domain = self.domain(handle)?;
        let iova = domain.allocate(partition, size, align)?;
        let mut prot = Prot::READ | Prot::WRITE;
        if cached {
            prot |= Prot::CACHE;
        }
        let segment = Segment::new(phys, size);
        if let Err(e) = self.map_range(&domain, iova, &[segment], size, prot) {
            if let Err(free_error) = domain.free(partition, iova, size) {
                error!("Failed to free {iova:#x} after failed mapping: {free_error}");
            }
            return Err(e);
        }
        Ok(iova)
    }

    /// Unmaps and frees a range returned by [`AddressSpaceManager::map_contig`].
    pub fn unmap_contig(
        &self,
        iova: u64,
        handle: DomainHandle,
        partition: usize,
        size: u64,
    ) -> Result<(), Error> {
        let domain = self.domain(handle)?;
        let unmapped = self.unmap(&domain, iova, size);
        if unmapped != size {
            warn!("Unmapped {unmapped:#x} of {size:#x} bytes at {iova:#x}");
        }
        domain.free(partition, iova, size)
    }

    /// Maps every page of `[start, start + size)` to the same physical page.
    ///
    /// Used to back guard regions around real buffers. On failure the pages mapped so far are
    /// unmapped again.
    pub fn map_extra(
        &self,
        domain: &Domain<P::PageTable>,
        start: u64,
        phys: u64,
        size: u64,
        page_size: u64,
        prot: Prot,
    ) -> Result<(), Error> {
        if !page_size.is_power_of_two() {
            return Err(Error::InvalidAlignment(page_size));
        }
        if start % page_size != 0 {
            return Err(Error::InvalidAlignment(start));
        }
        if size % page_size != 0 {
            return Err(Error::InvalidArgument(
                "size is not a multiple of the page size",
            ));
        }

        let mut mapped = 0;
        while mapped < size {
            if let Err(e) = self.map(domain, start + mapped, phys, page_size, prot) {
                self.unmap_extra(domain, start, mapped, page_size);
                return Err(e);
            }
            mapped += page_size;
        }
        Ok(())
    }

    /// Unmaps a range mapped with [`AddressSpaceManager::map_extra`].
    pub fn unmap_extra(&self, domain: &Domain<P::PageTable>, start: u64, size: u64, page_size: u64) {
        let mut offset = 0;
        while offset < size {
            self.unmap(domain, start + offset, page_size);
            offset += page_size;
        }
    }

    /// Attaches the named context to a domain of this manager.
    pub fn attach(&self, name: &str, domain: &DomainRef<P>) -> Result<(), Error> {
        self.find_domain_no(domain)?;
        let context = self.get_context(name)?;
        attach::attach(&self.platform, &context, domain, self.observer())
    }

    /// Detaches the named context from a domain. Does nothing if it is not attached there.
    ///
    /// Returns `PowerEnableFailed`, leaving the context attached, if the unit can't be clocked to
    /// reset its context bank.
    pub fn detach(&self, name: &str, domain: &DomainRef<P>) -> Result<(), Error> {
        self.find_domain_no(domain)?;
        let context = self.get_context(name)?;
        attach::detach(&self.platform, &context, domain, self.observer())
    }
}

#[cfg(feature = "perfmon")]
impl<P: Platform> AddressSpaceManager<P> {
    /// Creates the performance monitor of the named unit.
    pub fn register_perf_monitor(&self, unit: &str) -> Result<(), Error> {
        let unit = self.contexts.unit(unit)?;
        self.perfmon.register(&self.platform, &unit)?;
        info!("Perf monitor registered for {}", unit.name());
        Ok(())
    }

    /// Removes the performance monitor of the named unit.
    pub fn unregister_perf_monitor(&self, unit: &str) -> Result<(), Error> {
        let unit = self.contexts.unit(unit)?;
        self.perfmon.unregister(&self.platform, &unit)
    }

    /// Enables or disables the performance monitor of the named unit.
    pub fn enable_perf_monitor(&self, unit: &str, enable: bool) -> Result<(), Error> {
        let unit = self.contexts.unit(unit)?;
        self.perfmon.enable(&self.platform, &unit, enable)
    }

    /// Returns the state of the named unit's performance monitor.
    pub fn perf_monitor_state(&self, unit: &str) -> Result<MonitorState, Error> {
        let unit = self.contexts.unit(unit)?;
        self.perfmon.state(&unit)
    }

    /// Zeroes the named unit's counters.
    pub fn reset_perf_counters(&self, unit: &str) -> Result<(), Error> {
        let unit = self.contexts.unit(unit)?;
        self.perfmon.reset(&self.platform, &unit)
    }

    /// Returns the logical values of all of the named unit's counters.
    pub fn read_perf_counters(&self, unit: &str) -> Result<Vec<CounterValue>, Error> {
        let unit = self.contexts.unit(unit)?;
        self.perfmon.read_all(&self.platform, &unit)
    }

    /// Selects what a counter of the named unit counts, or stops it counting with `None`.
    pub fn set_perf_event_class(
        &self,
        unit: &str,
        group: usize,
        counter: usize,
        class: Option<u32>,
    ) -> Result<(), Error> {
        let unit = self.contexts.unit(unit)?;
        self.perfmon
            .set_event_class(&self.platform, &unit, group, counter, class)
    }

    /// Records a counter overflow interrupt of the unit with the given index, without blocking.
    pub fn perf_overflow_interrupt(&self, unit_index: usize) {
        self.perfmon.overflow_interrupt(unit_index);
    }

    /// Processes the overflow interrupts recorded so far. Call from a context that may block.
    pub fn process_perf_overflows(&self) -> usize {
        self.perfmon.process_deferred(&self.platform)
    }
}

impl<P: Platform> Debug for AddressSpaceManager<P> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        writeln!(f, "Units:")?;
        self.contexts.fmt(f)?;
        writeln!(f, "Domains:")?;
        self.domains.fmt(f)
    }
}
