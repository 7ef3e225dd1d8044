// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Mapping requests for secure domains, whose page tables only the monitor may write.

pub mod wire;

use self::wire::{
    ConfigRequest, FLAG_TLB_INVALIDATE, MapRequest, MappingInfo, PhysicalList, PtblInitRequest,
    PtblSizeRequest, PtblSizeResponse, StatusResponse, UnmapRequest,
};
use crate::{
    attach::UnitPower,
    context::{Context, Unit},
    error::Error,
    platform::Platform,
    smccc::{FunctionId, SUCCESS},
};
use alloc::{borrow::ToOwned, sync::Arc, vec::Vec};
use log::{debug, error, info, warn};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::{FromZeros, Immutable, IntoBytes};

/// Granule of secure mappings. Addresses, lengths and chunks must all be aligned to it.
pub const CHUNK_SIZE: u64 = 0x10_0000;

/// The monitor service that owns the secure page tables.
pub const SERVICE_MP: u8 = 0x0c;

/// Commands of the memory-protection service.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum SecureCommand {
    /// Configures a secure unit before its first use.
    ConfigureUnit = 0x02,
    /// Queries the size of the page-table pool.
    PtblSize = 0x03,
    /// Hands over the page-table pool.
    PtblInit = 0x04,
    /// Maps a range.
    Map = 0x0b,
    /// Unmaps a range.
    Unmap = 0x0c,
}

impl SecureCommand {
    /// Returns the function ID the command is issued with.
    pub fn function_id(self) -> FunctionId {
        FunctionId::sip(SERVICE_MP, self.into())
    }
}

/// The privileged monitor, reached through a synchronous call.
pub trait SecureMonitor {
    /// Issues the call with the given request bytes, filling in `response`.
    ///
    /// Returns the call's own return code. The command's status is part of the response.
    fn call(&self, function: FunctionId, request: &[u8], response: &mut [u8]) -> i32;
}

/// A physically contiguous piece of a buffer being mapped.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Segment {
    /// Physical address of the first byte.
    pub physical_address: u64,
    /// Length in bytes.
    pub length: u64,
}

impl Segment {
    /// Creates a segment of `length` bytes at `physical_address`.
    pub const fn new(physical_address: u64, length: u64) -> Self {
        Self {
            physical_address,
            length,
        }
    }
}

/// Which unit, context bank and virtual range a request is about.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Target {
    /// Secure id of the unit.
    pub secure_id: u32,
    /// Context bank index.
    pub bank: u32,
    /// Start of the virtual range.
    pub va: u64,
    /// Size of the virtual range in bytes.
    pub size: u64,
}

impl From<Target> for MappingInfo {
    fn from(target: Target) -> Self {
        Self {
            id: target.secure_id,
            ctx_id: target.bank,
            va: target.va,
            size: target.size,
        }
    }
}

/// A request to the monitor, before it is flattened into its wire layout.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SecureRequest<'a> {
    /// Configures a secure unit.
    ConfigureUnit {
        /// Secure id of the unit.
        secure_id: u32,
    },
    /// Maps the target to one physically contiguous range.
    MapSingle {
        /// The range being mapped.
        target: Target,
        /// Physical address the range maps to.
        physical_address: u64,
    },
    /// Maps the target to a list of chunks of [`CHUNK_SIZE`] bytes each.
    MapChunks {
        /// The range being mapped.
        target: Target,
        /// Physical address of each chunk, in virtual address order.
        chunks: &'a [u64],
    },
    /// Unmaps the target.
    Unmap {
        /// The range being unmapped.
        target: Target,
    },
    /// Queries the size of the page-table pool.
    PtblSize,
    /// Hands over the page-table pool.
    PtblInit {
        /// Physical address of the pool.
        physical_address: u64,
        /// Size of the pool in bytes.
        size: u32,
    },
}

impl SecureRequest<'_> {
    /// Returns the command the request is sent as.
    pub fn command(&self) -> SecureCommand {
        match self {
            Self::ConfigureUnit { .. } => SecureCommand::ConfigureUnit,
            Self::MapSingle { .. } | Self::MapChunks { .. } => SecureCommand::Map,
            Self::Unmap { .. } => SecureCommand::Unmap,
            Self::PtblSize => SecureCommand::PtblSize,
            Self::PtblInit { .. } => SecureCommand::PtblInit,
        }
    }
}

/// Flattens a scatter list into the physical addresses of consecutive [`CHUNK_SIZE`] chunks
/// covering `len` bytes.
///
/// Each chunk address is its segment's base plus the offset within the segment. Segments that
/// contribute chunks must be chunk aligned, and together must cover `len`.
pub fn flatten_chunks(segments: &[Segment], len: u64) -> Result<Vec<u64>, Error> {
    if len % CHUNK_SIZE != 0 {
        return Err(Error::InvalidAlignment(len));
    }
    let list_bytes = len / CHUNK_SIZE * size_of::<u64>() as u64;
    let count = usize::try_from(len / CHUNK_SIZE).map_err(|_| Error::OutOfMemory(list_bytes))?;
    let mut chunks = Vec::new();
    chunks
        .try_reserve_exact(count)
        .map_err(|_| Error::OutOfMemory(list_bytes))?;

    let mut segments = segments.iter();
    while (chunks.len() as u64) * CHUNK_SIZE < len {
        let segment = segments
            .next()
            .ok_or(Error::InvalidArgument("scatter list is shorter than the mapping"))?;
        if segment.length == 0 {
            continue;
        }
        if segment.physical_address % CHUNK_SIZE != 0 {
            return Err(Error::InvalidAlignment(segment.physical_address));
        }
        if segment.length % CHUNK_SIZE != 0 {
            return Err(Error::InvalidAlignment(segment.length));
        }

        let mut offset = 0;
        while offset < segment.length && (chunks.len() as u64) * CHUNK_SIZE < len {
            chunks.push(segment.physical_address + offset);
            offset += CHUNK_SIZE;
        }
    }

    Ok(chunks)
}

/// Builds and sends requests to the monitor on behalf of one platform.
pub struct SecureMediator<'a, P: Platform> {
    platform: &'a P,
}

impl<'a, P: Platform> SecureMediator<'a, P> {
    /// Creates a mediator using the platform's monitor, power controls and memory.
    pub fn new(platform: &'a P) -> Self {
        Self { platform }
    }

    /// Sends a request, returning the size reported by `PtblSize` or 0 for other commands.
    ///
    /// Both the call's return code and the command's status must be zero for the request to
    /// succeed.
    pub fn send(&self, request: &SecureRequest) -> Result<u32, Error> {
        let command = request.command();
        match *request {
            SecureRequest::ConfigureUnit { secure_id } => self.call(
                command,
                &ConfigRequest {
                    id: secure_id,
                    spare: 0,
                },
            ),
            SecureRequest::MapSingle {
                target,
                physical_address,
            } => {
                let list = [physical_address];
                self.call(
                    command,
                    &MapRequest {
                        plist: PhysicalList {
                            list: self.platform.physical_address(list.as_bytes()),
                            list_size: 1,
                            reserved: 0,
                            size: target.size,
                        },
                        info: target.into(),
                        flags: FLAG_TLB_INVALIDATE,
                        reserved: 0,
                    },
                )
            }
            SecureRequest::MapChunks { target, chunks } => self.call(
                command,
                &MapRequest {
                    plist: PhysicalList {
                        list: self.platform.physical_address(chunks.as_bytes()),
                        list_size: u32::try_from(chunks.len())
                            .map_err(|_| Error::InvalidArgument("too many chunks"))?,
                        reserved: 0,
                        size: CHUNK_SIZE,
                    },
                    info: target.into(),
                    flags: FLAG_TLB_INVALIDATE,
                    reserved: 0,
                },
            ),
            SecureRequest::Unmap { target } => self.call(
                command,
                &UnmapRequest {
                    info: target.into(),
                    flags: FLAG_TLB_INVALIDATE,
                    reserved: 0,
                },
            ),
            SecureRequest::PtblSize => {
                let mut response = PtblSizeResponse::new_zeroed();
                let code = self.platform.monitor().call(
                    command.function_id(),
                    PtblSizeRequest { spare: 0 }.as_bytes(),
                    response.as_mut_bytes(),
                );
                check(command, code, response.status)?;
                Ok(response.size)
            }
            SecureRequest::PtblInit {
                physical_address,
                size,
            } => self.call(
                command,
                &PtblInitRequest {
                    paddr: physical_address,
                    size,
                    spare: 0,
                },
            ),
        }
    }

    fn call<R: IntoBytes + Immutable>(
        &self,
        command: SecureCommand,
        request: &R,
    ) -> Result<u32, Error> {
        let mut response = StatusResponse::new_zeroed();
        let code = self.platform.monitor().call(
            command.function_id(),
            request.as_bytes(),
            response.as_mut_bytes(),
        );
        check(command, code, response.status)?;
        Ok(0)
    }

    /// Asks the monitor to configure a secure unit. Issued on the unit's first attachment.
    pub fn program_unit(&self, secure_id: u32) -> Result<(), Error> {
        self.send(&SecureRequest::ConfigureUnit { secure_id })?;
        info!("Secure unit {secure_id} programmed");
        Ok(())
    }

    /// Maps `[va, va + len)` to the physically contiguous `[pa, pa + len)`.
    pub fn map(&self, context: &Context, va: u64, pa: u64, len: u64) -> Result<(), Error> {
        for value in [va, pa, len] {
            if value % CHUNK_SIZE != 0 {
                return Err(Error::InvalidAlignment(value));
            }
        }
        let target = self.target(context, va, len)?;
        self.with_clocks(context.unit(), || {
            self.send(&SecureRequest::MapSingle {
                target,
                physical_address: pa,
            })
        })?;
        debug!("Secure map {va:#x}+{len:#x} -> {pa:#x} on {}", context.name());
        Ok(())
    }

    /// Maps `[va, va + len)` to the pieces of a scatter list, in order.
    pub fn map_range(
        &self,
        context: &Context,
        va: u64,
        segments: &[Segment],
        len: u64,
    ) -> Result<(), Error> {
        if va % CHUNK_SIZE != 0 {
            return Err(Error::InvalidAlignment(va));
        }
        if len % CHUNK_SIZE != 0 {
            return Err(Error::InvalidAlignment(len));
        }
        let first = segments
            .first()
            .ok_or(Error::InvalidArgument("empty scatter list"))?;
        let target = self.target(context, va, len)?;

        if first.length >= len {
            if first.physical_address % CHUNK_SIZE != 0 {
                return Err(Error::InvalidAlignment(first.physical_address));
            }
            self.with_clocks(context.unit(), || {
                self.send(&SecureRequest::MapSingle {
                    target,
                    physical_address: first.physical_address,
                })
            })?;
        } else {
            let chunks = flatten_chunks(segments, len)?;
            self.with_clocks(context.unit(), || {
                self.send(&SecureRequest::MapChunks {
                    target,
                    chunks: &chunks,
                })
            })?;
        }
        debug!(
            "Secure map {va:#x}+{len:#x} from {} segments on {}",
            segments.len(),
            context.name()
        );
        Ok(())
    }

    /// Unmaps `[va, va + len)`, returning `len` on success and 0 on any failure.
    pub fn unmap(&self, context: &Context, va: u64, len: u64) -> u64 {
        if va % CHUNK_SIZE != 0 || len % CHUNK_SIZE != 0 {
            warn!("Secure unmap of {va:#x}+{len:#x} is not chunk aligned");
            return 0;
        }
        let result = self.target(context, va, len).and_then(|target| {
            self.with_clocks(context.unit(), || {
                self.send(&SecureRequest::Unmap { target })
            })
        });
        match result {
            Ok(_) => len,
            Err(e) => {
                error!("Secure unmap of {va:#x}+{len:#x} failed: {e}");
                0
            }
        }
    }

    /// Hands the monitor the memory it needs for secure page tables.
    ///
    /// Does nothing if none of the given units is secure. The memory is only freed again if the
    /// monitor refuses it.
    pub fn init_page_table_pool(&self, units: &[Arc<Unit>]) -> Result<(), Error> {
        if !units.iter().any(|unit| unit.is_secure()) {
            debug!("No secure units, skipping page table pool");
            return Ok(());
        }

        let size = self.send(&SecureRequest::PtblSize)?;
        let physical_address = self
            .platform
            .allocate_contiguous(size.into())
            .ok_or(Error::OutOfMemory(size.into()))?;
        if let Err(e) = self.send(&SecureRequest::PtblInit {
            physical_address,
            size,
        }) {
            self.platform.free_contiguous(physical_address, size.into());
            return Err(e);
        }

        info!("Secure page table pool of {size:#x} bytes at {physical_address:#x}");
        Ok(())
    }

    fn target(&self, context: &Context, va: u64, size: u64) -> Result<Target, Error> {
        let unit = context.unit();
        let secure_id = unit
            .secure_id()
            .ok_or(Error::InvalidArgument("unit is not secure"))?;
        if !unit.is_programmed() {
            return Err(Error::UnitNotProgrammed(unit.name().to_owned()));
        }
        Ok(Target {
            secure_id,
            bank: context.bank(),
            va,
            size,
        })
    }

    fn with_clocks<T>(
        &self,
        unit: &Unit,
        f: impl FnOnce() -> Result<T, Error>,
    ) -> Result<T, Error> {
        let power = self.platform.power();
        power
            .enable_clocks(unit.config())
            .map_err(|_| Error::PowerEnableFailed(unit.name().to_owned()))?;
        let result = f();
        power.disable_clocks(unit.config());
        result
    }
}

fn check(command: SecureCommand, code: i32, status: i32) -> Result<(), Error> {
    if code == SUCCESS && status == SUCCESS {
        Ok(())
    } else {
        Err(Error::SecureCallFailed {
            command,
            code,
            status,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ContextConfig, UnitConfig},
        context::ContextRegistry,
        platform::test::{RecordedCall, TestPlatform},
        smccc::INVALID_PARAMETER,
    };

    const MIB: u64 = 0x10_0000;

    fn secure_context(registry: &ContextRegistry) -> Arc<Context> {
        registry
            .register_unit(UnitConfig::new("venus").with_secure_id(5))
            .unwrap();
        let context = registry
            .add_context("venus", ContextConfig::new("venus_cp", 1))
            .unwrap();
        context.unit().state.lock().programmed = true;
        context
    }

    #[test]
    fn function_ids() {
        assert_eq!(SecureCommand::Map.function_id().0, 0x0200_0c0b);
        assert_eq!(SecureCommand::Unmap.function_id().0, 0x0200_0c0c);
        assert!(matches!(
            SecureCommand::try_from(0x04u8),
            Ok(SecureCommand::PtblInit)
        ));
    }

    #[test]
    fn chunks_follow_segments() {
        let segments = [
            Segment::new(0x8000_0000, 2 * MIB),
            Segment::new(0x9000_0000, 3 * MIB),
        ];
        assert_eq!(
            flatten_chunks(&segments, 5 * MIB).unwrap(),
            [
                0x8000_0000,
                0x8010_0000,
                0x9000_0000,
                0x9010_0000,
                0x9020_0000
            ]
        );
    }

    #[test]
    fn chunks_stop_at_len() {
        let segments = [
            Segment::new(0x8000_0000, MIB),
            Segment::new(0x9000_0000, 4 * MIB),
        ];
        assert_eq!(
            flatten_chunks(&segments, 2 * MIB).unwrap(),
            [0x8000_0000, 0x9000_0000]
        );
    }

    #[test]
    fn short_scatter_list_is_rejected() {
        let segments = [Segment::new(0x8000_0000, MIB)];
        assert_eq!(
            flatten_chunks(&segments, 2 * MIB),
            Err(Error::InvalidArgument(
                "scatter list is shorter than the mapping"
            ))
        );
        let segments = [Segment::new(0x8000_0800, 2 * MIB)];
        assert_eq!(
            flatten_chunks(&segments, 2 * MIB),
            Err(Error::InvalidAlignment(0x8000_0800))
        );
    }

    #[test]
    fn oversized_chunk_list_reports_its_size() {
        let len = u64::MAX / CHUNK_SIZE * CHUNK_SIZE;
        let segments = [Segment::new(0x8000_0000, MIB)];
        // The list either cannot be reserved at all, or the single segment runs out first.
        match flatten_chunks(&segments, len) {
            Err(Error::OutOfMemory(bytes)) => assert_eq!(bytes, len / CHUNK_SIZE * 8),
            result => assert_eq!(
                result,
                Err(Error::InvalidArgument(
                    "scatter list is shorter than the mapping"
                ))
            ),
        }
    }

    #[test]
    fn map_sends_single_chunk() {
        let platform = TestPlatform::new();
        let registry = ContextRegistry::new();
        let context = secure_context(&registry);
        let mediator = SecureMediator::new(&platform);

        mediator
            .map(&context, 0x4000_0000, 0x8000_0000, 2 * MIB)
            .unwrap();
        assert_eq!(
            platform.monitor.calls(),
            [RecordedCall::Map {
                target: Target {
                    secure_id: 5,
                    bank: 1,
                    va: 0x4000_0000,
                    size: 2 * MIB
                },
                chunk_size: 2 * MIB,
                chunks: vec![0x8000_0000],
                flags: FLAG_TLB_INVALIDATE,
            }]
        );
        assert!(platform.power.balanced("venus"));
    }

    #[test]
    fn map_rejects_misalignment() {
        let platform = TestPlatform::new();
        let registry = ContextRegistry::new();
        let context = secure_context(&registry);
        let mediator = SecureMediator::new(&platform);

        assert_eq!(
            mediator.map(&context, 0x4000_0000, 0x8000_1000, MIB),
            Err(Error::InvalidAlignment(0x8000_1000))
        );
        assert!(platform.monitor.calls().is_empty());
    }

    #[test]
    fn map_range_flattens_segments() {
        let platform = TestPlatform::new();
        let registry = ContextRegistry::new();
        let context = secure_context(&registry);
        let mediator = SecureMediator::new(&platform);

        let segments = [
            Segment::new(0x8000_0000, 2 * MIB),
            Segment::new(0x9000_0000, 3 * MIB),
        ];
        mediator
            .map_range(&context, 0x4000_0000, &segments, 5 * MIB)
            .unwrap();
        let calls = platform.monitor.calls();
        let [RecordedCall::Map {
            chunk_size, chunks, ..
        }] = calls.as_slice()
        else {
            panic!("unexpected calls {calls:?}");
        };
        assert_eq!(*chunk_size, MIB);
        assert_eq!(
            chunks,
            &[
                0x8000_0000,
                0x8010_0000,
                0x9000_0000,
                0x9010_0000,
                0x9020_0000
            ]
        );
    }

    #[test]
    fn unprogrammed_unit_is_rejected() {
        let platform = TestPlatform::new();
        let registry = ContextRegistry::new();
        let context = secure_context(&registry);
        context.unit().state.lock().programmed = false;
        let mediator = SecureMediator::new(&platform);

        assert_eq!(
            mediator.map(&context, 0, 0, MIB),
            Err(Error::UnitNotProgrammed("venus".into()))
        );
        assert_eq!(mediator.unmap(&context, 0, MIB), 0);
    }

    #[test]
    fn status_failure_is_reported() {
        let platform = TestPlatform::new();
        let registry = ContextRegistry::new();
        let context = secure_context(&registry);
        let mediator = SecureMediator::new(&platform);

        platform
            .monitor
            .fail_next(SecureCommand::Map, SUCCESS, INVALID_PARAMETER);
        assert_eq!(
            mediator.map(&context, 0x4000_0000, 0x8000_0000, MIB),
            Err(Error::SecureCallFailed {
                command: SecureCommand::Map,
                code: SUCCESS,
                status: INVALID_PARAMETER
            })
        );
        assert!(platform.power.balanced("venus"));
    }

    #[test]
    fn unmap_reports_bytes() {
        let platform = TestPlatform::new();
        let registry = ContextRegistry::new();
        let context = secure_context(&registry);
        let mediator = SecureMediator::new(&platform);

        assert_eq!(mediator.unmap(&context, 0x4000_0000, 3 * MIB), 3 * MIB);
        platform.monitor.fail_next(SecureCommand::Unmap, -1, 0);
        assert_eq!(mediator.unmap(&context, 0x4000_0000, 3 * MIB), 0);
        assert_eq!(mediator.unmap(&context, 0x4000_1000, MIB), 0);
    }

    #[test]
    fn page_table_pool_is_handed_over() {
        let platform = TestPlatform::new();
        let registry = ContextRegistry::new();
        secure_context(&registry);
        let mediator = SecureMediator::new(&platform);

        mediator.init_page_table_pool(&registry.units()).unwrap();
        let calls = platform.monitor.calls();
        let [RecordedCall::PtblSize, RecordedCall::PtblInit { physical_address, size }] =
            calls.as_slice()
        else {
            panic!("unexpected calls {calls:?}");
        };
        assert_eq!(*size, TestPlatform::PTBL_SIZE);
        assert_eq!(platform.memory.live(), [(*physical_address, u64::from(*size))]);
    }

    #[test]
    fn page_table_pool_is_freed_on_failure() {
        let platform = TestPlatform::new();
        let registry = ContextRegistry::new();
        secure_context(&registry);
        let mediator = SecureMediator::new(&platform);

        platform.monitor.fail_next(SecureCommand::PtblInit, -1, 0);
        assert!(matches!(
            mediator.init_page_table_pool(&registry.units()),
            Err(Error::SecureCallFailed {
                command: SecureCommand::PtblInit,
                ..
            })
        ));
        assert!(platform.memory.live().is_empty());
    }

    #[test]
    fn page_table_pool_skipped_without_secure_units() {
        let platform = TestPlatform::new();
        let registry = ContextRegistry::new();
        registry.register_unit(UnitConfig::new("vfe")).unwrap();

        SecureMediator::new(&platform)
            .init_page_table_pool(&registry.units())
            .unwrap();
        assert!(platform.monitor.calls().is_empty());
    }
}
