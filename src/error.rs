// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Error type shared by every component of the address-space manager.

use crate::{domain::DomainHandle, secure::SecureCommand};
use alloc::string::String;
use thiserror::Error;

/// Errors returned by the address-space manager.
///
/// Nothing is retried internally; every error is reported synchronously to the immediate caller.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum Error {
    /// No domain is registered under the handle.
    #[error("unknown domain handle {0}")]
    InvalidHandle(DomainHandle),
    /// The partition index is out of range, or the partition has no backing pool.
    #[error("partition {partition} of domain {domain} is not allocatable")]
    InvalidPartition {
        /// The domain.
        domain: DomainHandle,
        /// The partition index.
        partition: usize,
    },
    /// The partition's pool cannot satisfy the aligned request.
    #[error("no {size:#x} byte range aligned to {align:#x} left in partition {partition}")]
    OutOfSpace {
        /// The partition index.
        partition: usize,
        /// Requested size.
        size: u64,
        /// Requested alignment.
        align: u64,
    },
    /// The alignment is not a power of two, or an address is not aligned as required.
    #[error("{0:#x} is not a valid alignment for this request")]
    InvalidAlignment(u64),
    /// A size, length or scatter list is not usable for the request.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// A partition layout cannot be represented.
    #[error("partition {partition} layout {base:#x}+{size:#x} is invalid")]
    InvalidLayout {
        /// The partition index.
        partition: usize,
        /// The partition's base address.
        base: u64,
        /// The partition's size.
        size: u64,
    },
    /// The range passed to `free` is not a live allocation.
    #[error("{size:#x} bytes at {iova:#x} are not a live allocation")]
    DoubleFreeOrInvalid {
        /// Address passed to `free`.
        iova: u64,
        /// Size passed to `free`.
        size: u64,
    },
    /// The domain object is not known to this registry.
    #[error("domain is not registered")]
    DomainNotFound,
    /// No registered unit has a context with the name.
    #[error("no translation context named {0:?}")]
    ContextNotFound(String),
    /// No unit is registered under the name.
    #[error("no translation unit named {0:?}")]
    UnitNotFound(String),
    /// A unit or context with the same name already exists.
    #[error("{0:?} is already registered")]
    DuplicateName(String),
    /// The context is attached and cannot be removed.
    #[error("context {0:?} is attached")]
    ContextBusy(String),
    /// The context is already attached to a domain.
    #[error("context {0:?} is already attached")]
    AlreadyAttached(String),
    /// The domain has no attached context to route the request through.
    #[error("domain {0} has no attached context")]
    NotAttached(DomainHandle),
    /// The secure unit has not been configured by the monitor yet.
    #[error("secure unit {0:?} has not been programmed")]
    UnitNotProgrammed(String),
    /// Regulator or clock bring-up of a unit failed.
    #[error("failed to power up unit {0:?}")]
    PowerEnableFailed(String),
    /// The privileged monitor rejected the request or could not execute it.
    #[error("secure call {command:?} failed: return code {code}, status {status}")]
    SecureCallFailed {
        /// The command that failed.
        command: SecureCommand,
        /// Return code of the call itself.
        code: i32,
        /// Status reported by the command.
        status: i32,
    },
    /// Scratch memory for a monitor request could not be allocated.
    #[error("out of memory allocating {0:#x} bytes")]
    OutOfMemory(u64),
    /// The page-table object rejected a non-secure mapping or context installation.
    #[error("page table operation failed at {iova:#x}")]
    PageTable {
        /// Start of the failed operation, 0 for context installation.
        iova: u64,
    },
    /// More stream IDs than a context can hold.
    #[error("too many stream IDs for context {0:?}")]
    TooManyStreamIds(String),
    /// The unit has no performance monitor registered.
    #[error("no performance monitor registered for unit {0:?}")]
    PerfMonitorNotRegistered(String),
}
