// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Domains and the registry that hands out their handles.

use crate::{
    config::{ContextConfig, DomainFlags, DomainLayout, UnitConfig},
    context::Context,
    error::Error,
    partition::{IovaPool, Partition},
};
use alloc::{collections::BTreeMap, string::String, sync::Arc, vec::Vec};
use bitflags::bitflags;
use core::fmt::{self, Debug, Formatter};
use log::debug;
use spin::mutex::SpinMutex;

/// The integer a domain is known by. Never reused within a manager.
pub type DomainHandle = u32;

bitflags! {
    /// Access permissions of a non-secure mapping.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct Prot: u32 {
        /// Devices may read through the mapping.
        const READ = 1 << 0;
        /// Devices may write through the mapping.
        const WRITE = 1 << 1;
        /// The mapping is cacheable.
        const CACHE = 1 << 2;
    }
}

/// The page-table object was unable to complete an operation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PageTableError;

/// The translation tables of one domain.
///
/// Only non-secure domains are ever written through this trait. The tables of a secure domain are
/// owned by the monitor, and the object only stands for them.
pub trait PageTable: Send {
    /// Maps `[iova, iova + size)` to `[physical_address, physical_address + size)`.
    fn map(
        &mut self,
        iova: u64,
        physical_address: u64,
        size: u64,
        prot: Prot,
    ) -> Result<(), PageTableError>;

    /// Unmaps `[iova, iova + size)`, returning the number of bytes that were mapped.
    fn unmap(&mut self, iova: u64, size: u64) -> u64;

    /// Points the context bank of `unit` at these tables.
    fn install(&mut self, unit: &UnitConfig, context: &ContextConfig) -> Result<(), PageTableError>;

    /// Resets the context bank so that it no longer translates through these tables.
    fn uninstall(&mut self, unit: &UnitConfig, context: &ContextConfig);
}

/// One IOVA space: its partitions, its page tables and the contexts attached to it.
pub struct Domain<T> {
    handle: DomainHandle,
    secure: bool,
    flags: DomainFlags,
    client_name: Option<String>,
    partitions: Vec<Partition>,
    pub(crate) table: SpinMutex<T>,
    /// Contexts attached to this domain, in attach order.
    pub(crate) attached: SpinMutex<Vec<Arc<Context>>>,
}

impl<T> Domain<T> {
    /// Returns the handle the domain was registered under.
    pub fn handle(&self) -> DomainHandle {
        self.handle
    }

    /// Returns whether the domain's page tables are owned by the monitor.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Returns the flags the page-table object was created with.
    pub fn flags(&self) -> DomainFlags {
        self.flags
    }

    /// Returns the name of the client that owns the domain, if it gave one.
    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    /// Returns the partitions in index order, including inert ones.
    pub fn partitions(&self) -> &[Partition] {
        &self.partitions
    }

    /// Returns the pool of an allocatable partition.
    pub fn pool(&self, partition: usize) -> Result<&IovaPool, Error> {
        self.partitions
            .get(partition)
            .and_then(Partition::pool)
            .ok_or(Error::InvalidPartition {
                domain: self.handle,
                partition,
            })
    }

    /// Allocates `size` bytes aligned to `align` from the given partition.
    pub fn allocate(&self, partition: usize, size: u64, align: u64) -> Result<u64, Error> {
        self.pool(partition)?.allocate(size, align)
    }

    /// Frees a range returned by [`Domain::allocate`].
    pub fn free(&self, partition: usize, iova: u64, size: u64) -> Result<(), Error> {
        self.pool(partition)?.free(iova, size)
    }

    /// Returns the contexts currently attached, in attach order.
    pub fn attached_contexts(&self) -> Vec<Arc<Context>> {
        self.attached.lock().clone()
    }

    /// Returns the context that secure requests for this domain are routed through.
    pub fn first_attached(&self) -> Option<Arc<Context>> {
        self.attached.lock().first().cloned()
    }

    /// Runs `f` with exclusive access to the domain's page-table object.
    pub fn with_page_table<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.table.lock())
    }
}

impl<T> Debug for Domain<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "domain {}", self.handle)?;
        if let Some(name) = &self.client_name {
            write!(f, " ({name})")?;
        }
        writeln!(
            f,
            ": {}, flags {:?}",
            if self.secure { "secure" } else { "non-secure" },
            self.flags
        )?;
        for (index, partition) in self.partitions.iter().enumerate() {
            writeln!(f, "  partition {index}: {partition:?}")?;
        }
        match self.attached.try_lock() {
            Some(attached) => {
                for context in attached.iter() {
                    writeln!(f, "  attached: {}/{}", context.unit().name(), context.name())?;
                }
            }
            None => writeln!(f, "  attachments are locked")?,
        }
        Ok(())
    }
}

struct RegistryState<T> {
    next_handle: DomainHandle,
    by_handle: BTreeMap<DomainHandle, Arc<Domain<T>>>,
    /// Reverse index from the address of a registered domain to its handle.
    by_identity: BTreeMap<usize, DomainHandle>,
}

/// All domains registered with one manager.
///
/// Domains are never unregistered, so a handle or a reference handed out stays valid for the
/// lifetime of the registry.
pub struct DomainRegistry<T> {
    state: SpinMutex<RegistryState<T>>,
}

impl<T> DomainRegistry<T> {
    /// Creates an empty registry whose first handle is 0.
    pub const fn new() -> Self {
        Self {
            state: SpinMutex::new(RegistryState {
                next_handle: 0,
                by_handle: BTreeMap::new(),
                by_identity: BTreeMap::new(),
            }),
        }
    }

    /// Creates a domain with the given layout and page-table object, returning its handle.
    ///
    /// The partitions are validated before a handle is taken, so a rejected layout consumes no
    /// handle.
    pub fn register(
        &self,
        layout: &DomainLayout,
        table: T,
        quantum: u64,
    ) -> Result<DomainHandle, Error> {
        let partitions = layout
            .partitions
            .iter()
            .enumerate()
            .map(|(index, partition)| Partition::new(index, partition, quantum))
            .collect::<Result<Vec<_>, _>>()?;

        let mut state = self.state.lock();
        let handle = state.next_handle;
        let domain = Arc::new(Domain {
            handle,
            secure: layout.secure,
            flags: layout.flags,
            client_name: layout.client_name.clone(),
            partitions,
            table: SpinMutex::new(table),
            attached: SpinMutex::new(Vec::new()),
        });
        state.next_handle += 1;
        state.by_identity.insert(identity(&domain), handle);
        state.by_handle.insert(handle, domain);
        drop(state);

        debug!(
            "Registered domain {handle} with {} partitions",
            layout.partitions.len()
        );
        Ok(handle)
    }

    /// Looks up a domain by handle.
    pub fn get(&self, handle: DomainHandle) -> Option<Arc<Domain<T>>> {
        self.state.lock().by_handle.get(&handle).cloned()
    }

    /// Returns the handle of a registered domain.
    pub fn find_handle(&self, domain: &Arc<Domain<T>>) -> Result<DomainHandle, Error> {
        self.state
            .lock()
            .by_identity
            .get(&identity(domain))
            .copied()
            .ok_or(Error::DomainNotFound)
    }

    /// Returns all registered domains in handle order.
    pub fn domains(&self) -> Vec<Arc<Domain<T>>> {
        self.state.lock().by_handle.values().cloned().collect()
    }
}

impl<T> Default for DomainRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Debug for DomainRegistry<T> {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self.state.try_lock() {
            Some(state) => {
                for domain in state.by_handle.values() {
                    domain.fmt(f)?;
                }
                Ok(())
            }
            None => writeln!(f, "domain registry is locked"),
        }
    }
}

fn identity<T>(domain: &Arc<Domain<T>>) -> usize {
    Arc::as_ptr(domain) as usize
}
