// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Partitions of a domain's IOVA space and their free-space pools.

use crate::{config::PartitionLayout, error::Error};
use alloc::collections::BTreeMap;
use core::fmt::{self, Debug, Formatter};
use log::{trace, warn};
use spin::mutex::SpinMutex;

/// A live allocation, remembered so that `free` can check what it is given.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Allocation {
    /// The size the caller asked for.
    size: u64,
    /// The bytes taken from the pool, `size` rounded up to the quantum.
    span: u64,
}

struct PoolState {
    /// Live allocations keyed by start address.
    live: BTreeMap<u64, Allocation>,
    free_bytes: u64,
}

/// Rounds `value` up to a multiple of `align`, which must be a power of two.
fn align_up(value: u64, align: u64) -> Option<u64> {
    Some(value.checked_add(align - 1)? & !(align - 1))
}

/// The free-space pool of one partition.
///
/// Allocations are placed first-fit: the gaps between live allocations are searched in address
/// order and the lowest suitably aligned gap that is large enough is used.
pub struct IovaPool {
    index: usize,
    /// First address the pool may hand out.
    start: u64,
    /// End of the pool, exclusive.
    end: u64,
    quantum: u64,
    state: SpinMutex<PoolState>,
}

impl IovaPool {
    fn new(index: usize, start: u64, end: u64, quantum: u64) -> Self {
        Self {
            index,
            start,
            end,
            quantum,
            state: SpinMutex::new(PoolState {
                live: BTreeMap::new(),
                free_bytes: end - start,
            }),
        }
    }

    /// Finds the lowest address aligned to `align` where `span` bytes are free.
    fn find_gap(&self, live: &BTreeMap<u64, Allocation>, span: u64, align: u64) -> Option<u64> {
        let mut candidate = align_up(self.start, align)?;
        for (&iova, allocation) in live {
            if candidate.checked_add(span)? <= iova {
                return Some(candidate);
            }
            candidate = candidate.max(align_up(iova + allocation.span, align)?);
        }
        candidate
            .checked_add(span)
            .filter(|&end| end <= self.end)
            .map(|_| candidate)
    }

    /// Allocates `size` bytes aligned to `align`.
    ///
    /// The size is rounded up to the allocation quantum, and so is an alignment smaller than the
    /// quantum.
    pub fn allocate(&self, size: u64, align: u64) -> Result<u64, Error> {
        if !align.is_power_of_two() {
            return Err(Error::InvalidAlignment(align));
        }
        if size == 0 {
            return Err(Error::InvalidArgument("zero-sized IOVA allocation"));
        }
        let out_of_space = Error::OutOfSpace {
            partition: self.index,
            size,
            align,
        };

        let span = size
            .checked_next_multiple_of(self.quantum)
            .ok_or_else(|| out_of_space.clone())?;
        let align = align.max(self.quantum);

        let mut state = self.state.lock();
        let iova = self
            .find_gap(&state.live, span, align)
            .ok_or(out_of_space)?;
        state.live.insert(iova, Allocation { size, span });
        state.free_bytes -= span;
        trace!(
            "partition {}: allocated {size:#x} at {iova:#x}",
            self.index
        );

        Ok(iova)
    }

    /// Returns a range handed out by [`IovaPool::allocate`] to the pool.
    pub fn free(&self, iova: u64, size: u64) -> Result<(), Error> {
        let mut state = self.state.lock();
        let allocation = match state.live.get(&iova) {
            Some(allocation) if allocation.size == size => *allocation,
            _ => {
                warn!(
                    "partition {}: freeing {size:#x} at {iova:#x} which is not allocated",
                    self.index
                );
                return Err(Error::DoubleFreeOrInvalid { iova, size });
            }
        };

        state.live.remove(&iova);
        state.free_bytes += allocation.span;
        trace!("partition {}: freed {size:#x} at {iova:#x}", self.index);

        Ok(())
    }

    /// Returns the number of bytes not handed out, counted in whole quanta. Diagnostic only, as
    /// fragmentation may prevent a single allocation of this size.
    pub fn free_bytes(&self) -> u64 {
        self.state.lock().free_bytes
    }

    /// Returns the number of live allocations.
    pub fn live_allocations(&self) -> usize {
        self.state.lock().live.len()
    }
}

impl Debug for IovaPool {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self.state.try_lock() {
            Some(state) => write!(
                f,
                "free {:#x}, {} live allocations",
                state.free_bytes,
                state.live.len()
            ),
            None => write!(f, "pool is locked"),
        }
    }
}

/// One fixed virtual-address range of a domain.
pub struct Partition {
    base: u64,
    size: u64,
    /// `None` for zero-sized partitions, which are kept in the layout but never allocatable.
    pool: Option<IovaPool>,
}

impl Partition {
    /// Creates the partition and its pool.
    ///
    /// `quantum` is the allocation granule and must be a power of two. When the partition starts at
    /// address 0 its first quantum is withheld from the pool, so that 0 is never handed out.
    pub(crate) fn new(index: usize, layout: &PartitionLayout, quantum: u64) -> Result<Self, Error> {
        debug_assert!(quantum.is_power_of_two());

        let invalid = Error::InvalidLayout {
            partition: index,
            base: layout.base,
            size: layout.size,
        };

        if layout.size == 0 {
            return Ok(Self {
                base: layout.base,
                size: 0,
                pool: None,
            });
        }

        let end = layout
            .base
            .checked_add(layout.size)
            .ok_or_else(|| invalid.clone())?;
        if layout.base % quantum != 0 || layout.size % quantum != 0 {
            return Err(invalid);
        }

        // Address 0 is never handed out.
        let start = if layout.base == 0 { quantum } else { layout.base };

        Ok(Self {
            base: layout.base,
            size: layout.size,
            pool: Some(IovaPool::new(index, start, end, quantum)),
        })
    }

    /// Returns the first address of the partition.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Returns the size of the partition in bytes, 0 for an inert partition.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns the pool, or `None` if the partition is zero-sized.
    pub fn pool(&self) -> Option<&IovaPool> {
        self.pool.as_ref()
    }

    /// Returns whether `[iova, iova + size)` lies within the partition.
    pub fn contains(&self, iova: u64, size: u64) -> bool {
        iova >= self.base
            && iova
                .checked_add(size)
                .is_some_and(|end| end <= self.base + self.size)
    }
}

impl Debug for Partition {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "[{:#x}, {:#x}) ", self.base, self.base + self.size)?;
        match &self.pool {
            Some(pool) => pool.fmt(f),
            None => write!(f, "inert"),
        }
    }
}
