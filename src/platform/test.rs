// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

use super::Platform;
#[cfg(feature = "perfmon")]
use crate::perfmon::PerfCounterHardware;
use crate::{
    attach::{PowerError, UnitPower},
    config::{BfbSetting, ContextConfig, DomainFlags, UnitConfig},
    domain::{PageTable, PageTableError, Prot},
    error::Error,
    logger::{self, LogSink},
    secure::{
        SERVICE_MP, SecureCommand, SecureMonitor, Target,
        wire::{
            ConfigRequest, MapRequest, MappingInfo, PtblInitRequest, PtblSizeResponse,
            StatusResponse, UnmapRequest,
        },
    },
    smccc::{FunctionId, NOT_SUPPORTED, SUCCESS},
};
use std::{
    collections::BTreeMap,
    fmt,
    io::{Write, stdout},
    slice,
    string::{String, ToString},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    vec::Vec,
};
use spin::mutex::SpinMutex;
use zerocopy::{FromBytes, IntoBytes};

const PTBL_SIZE: u32 = 0x4_0000;

static STDOUT_SINK: StdOutSink = StdOutSink;

/// A fake platform for unit tests.
pub struct TestPlatform {
    pub monitor: FakeMonitor,
    pub power: FakePower,
    pub memory: FakeMemory,
    pub pmu: FakePmu,
    /// Non-secure maps covering this address fail.
    fail_map_at: Arc<SpinMutex<Option<u64>>>,
}

impl TestPlatform {
    /// The size of the secure page table pool the fake monitor asks for.
    pub const PTBL_SIZE: u32 = PTBL_SIZE;

    /// Creates a platform on which every operation succeeds, logging to stdout.
    pub fn new() -> Self {
        let _ = logger::init(&STDOUT_SINK);
        Self {
            monitor: FakeMonitor::default(),
            power: FakePower::default(),
            memory: FakeMemory::default(),
            pmu: FakePmu::default(),
            fail_map_at: Arc::new(SpinMutex::new(None)),
        }
    }

    /// Makes every non-secure map covering `iova` fail, or none if `None`.
    pub fn fail_map_at(&self, iova: Option<u64>) {
        *self.fail_map_at.lock() = iova;
    }
}

impl Platform for TestPlatform {
    type Monitor = FakeMonitor;
    type Power = FakePower;
    type PageTable = FakePageTable;
    #[cfg(feature = "perfmon")]
    type Pmu = FakePmu;

    fn monitor(&self) -> &FakeMonitor {
        &self.monitor
    }

    fn power(&self) -> &FakePower {
        &self.power
    }

    #[cfg(feature = "perfmon")]
    fn pmu(&self) -> &FakePmu {
        &self.pmu
    }

    fn create_page_table(&self, secure: bool, flags: DomainFlags) -> Result<FakePageTable, Error> {
        Ok(FakePageTable {
            secure,
            flags,
            mappings: BTreeMap::new(),
            installed: Vec::new(),
            fail_map_at: self.fail_map_at.clone(),
        })
    }

    fn allocate_contiguous(&self, size: u64) -> Option<u64> {
        self.memory.allocate(size)
    }

    fn free_contiguous(&self, physical_address: u64, size: u64) {
        self.memory.free(physical_address, size);
    }

    fn physical_address(&self, buffer: &[u8]) -> u64 {
        // Tests run with an identity mapping, so the monitor can read the buffer directly.
        buffer.as_ptr() as u64
    }
}

/// Log sink writing to the test's stdout.
pub struct StdOutSink;

impl LogSink for StdOutSink {
    fn write_fmt(&self, args: fmt::Arguments) {
        stdout().write_fmt(args).unwrap();
    }

    fn flush(&self) {
        stdout().flush().unwrap();
    }
}

/// A monitor call as the fake monitor decoded it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RecordedCall {
    ConfigureUnit {
        secure_id: u32,
    },
    Map {
        target: Target,
        chunk_size: u64,
        chunks: Vec<u64>,
        flags: u32,
    },
    Unmap {
        target: Target,
        flags: u32,
    },
    PtblSize,
    PtblInit {
        physical_address: u64,
        size: u32,
    },
}

/// A monitor that records every request and succeeds unless told otherwise.
#[derive(Default)]
pub struct FakeMonitor {
    calls: SpinMutex<Vec<RecordedCall>>,
    /// Pending failures as (command, return code, status), used once each.
    failures: SpinMutex<Vec<(SecureCommand, i32, i32)>>,
}

impl FakeMonitor {
    /// Returns every call received so far, in order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Makes the next call of `command` return `code` with `status`.
    pub fn fail_next(&self, command: SecureCommand, code: i32, status: i32) {
        self.failures.lock().push((command, code, status));
    }

    fn take_failure(&self, command: SecureCommand) -> (i32, i32) {
        let mut failures = self.failures.lock();
        match failures.iter().position(|failure| failure.0 == command) {
            Some(index) => {
                let (_, code, status) = failures.remove(index);
                (code, status)
            }
            None => (SUCCESS, SUCCESS),
        }
    }
}

fn target_of(info: MappingInfo) -> Target {
    Target {
        secure_id: info.id,
        bank: info.ctx_id,
        va: info.va,
        size: info.size,
    }
}

impl SecureMonitor for FakeMonitor {
    fn call(&self, function: FunctionId, request: &[u8], response: &mut [u8]) -> i32 {
        assert_eq!(function.service(), SERVICE_MP);
        let Ok(command) = SecureCommand::try_from(function.command()) else {
            return NOT_SUPPORTED;
        };

        let call = match command {
            SecureCommand::ConfigureUnit => {
                let request = ConfigRequest::read_from_bytes(request).unwrap();
                RecordedCall::ConfigureUnit {
                    secure_id: request.id,
                }
            }
            SecureCommand::Map => {
                let request = MapRequest::read_from_bytes(request).unwrap();
                // SAFETY: `TestPlatform::physical_address` returns host addresses, and the caller
                // keeps the list alive and unmodified until the call returns.
                let chunks = unsafe {
                    slice::from_raw_parts(
                        request.plist.list as usize as *const u64,
                        request.plist.list_size as usize,
                    )
                };
                RecordedCall::Map {
                    target: target_of(request.info),
                    chunk_size: request.plist.size,
                    chunks: chunks.to_vec(),
                    flags: request.flags,
                }
            }
            SecureCommand::Unmap => {
                let request = UnmapRequest::read_from_bytes(request).unwrap();
                RecordedCall::Unmap {
                    target: target_of(request.info),
                    flags: request.flags,
                }
            }
            SecureCommand::PtblSize => RecordedCall::PtblSize,
            SecureCommand::PtblInit => {
                let request = PtblInitRequest::read_from_bytes(request).unwrap();
                RecordedCall::PtblInit {
                    physical_address: request.paddr,
                    size: request.size,
                }
            }
        };
        self.calls.lock().push(call);

        let (code, status) = self.take_failure(command);
        if command == SecureCommand::PtblSize {
            response.copy_from_slice(
                PtblSizeResponse {
                    size: PTBL_SIZE,
                    status,
                }
                .as_bytes(),
            );
        } else {
            response.copy_from_slice(StatusResponse { status }.as_bytes());
        }
        code
    }
}

#[derive(Clone, Debug, Default)]
struct PowerCounts {
    regulator: isize,
    clocks: isize,
    bfb_writes: Vec<BfbSetting>,
}

/// Reference counts of the regulators and clocks of each unit.
#[derive(Default)]
pub struct FakePower {
    units: SpinMutex<BTreeMap<String, PowerCounts>>,
    fail_regulator: AtomicBool,
    fail_clocks: AtomicBool,
}

impl FakePower {
    /// Makes regulator enables fail while `fail` is set.
    pub fn fail_regulator(&self, fail: bool) {
        self.fail_regulator.store(fail, Ordering::SeqCst);
    }

    /// Makes clock enables fail while `fail` is set.
    pub fn fail_clocks(&self, fail: bool) {
        self.fail_clocks.store(fail, Ordering::SeqCst);
    }

    /// Returns the unit's outstanding regulator enables.
    pub fn regulator_count(&self, unit: &str) -> isize {
        self.counts(unit).regulator
    }

    /// Returns the unit's outstanding clock enables.
    pub fn clock_count(&self, unit: &str) -> isize {
        self.counts(unit).clocks
    }

    /// Returns the BFB writes made to the unit, in order.
    pub fn bfb_writes(&self, unit: &str) -> Vec<BfbSetting> {
        self.counts(unit).bfb_writes
    }

    /// Returns whether every enable of the unit's regulator and clocks was matched by a disable.
    pub fn balanced(&self, unit: &str) -> bool {
        let counts = self.counts(unit);
        counts.regulator == 0 && counts.clocks == 0
    }

    fn counts(&self, unit: &str) -> PowerCounts {
        self.units.lock().get(unit).cloned().unwrap_or_default()
    }

    fn update(&self, unit: &UnitConfig, f: impl FnOnce(&mut PowerCounts)) {
        f(self.units.lock().entry(unit.name.to_string()).or_default());
    }
}

impl UnitPower for FakePower {
    fn enable_regulator(&self, unit: &UnitConfig) -> Result<(), PowerError> {
        if self.fail_regulator.load(Ordering::SeqCst) {
            return Err(PowerError);
        }
        self.update(unit, |counts| counts.regulator += 1);
        Ok(())
    }

    fn disable_regulator(&self, unit: &UnitConfig) {
        self.update(unit, |counts| counts.regulator -= 1);
    }

    fn enable_clocks(&self, unit: &UnitConfig) -> Result<(), PowerError> {
        if self.fail_clocks.load(Ordering::SeqCst) {
            return Err(PowerError);
        }
        self.update(unit, |counts| counts.clocks += 1);
        Ok(())
    }

    fn disable_clocks(&self, unit: &UnitConfig) {
        self.update(unit, |counts| counts.clocks -= 1);
    }

    fn write_bfb(&self, unit: &UnitConfig, setting: BfbSetting) {
        self.update(unit, |counts| {
            assert!(counts.clocks > 0, "BFB write without clocks");
            counts.bfb_writes.push(setting);
        });
    }
}

/// Page tables that only remember what they were asked to do.
pub struct FakePageTable {
    pub secure: bool,
    pub flags: DomainFlags,
    /// Mappings as iova to (physical address, size, prot).
    pub mappings: BTreeMap<u64, (u64, u64, Prot)>,
    /// Context banks the tables are installed in, as (unit name, bank).
    pub installed: Vec<(String, u32)>,
    fail_map_at: Arc<SpinMutex<Option<u64>>>,
}

impl PageTable for FakePageTable {
    fn map(
        &mut self,
        iova: u64,
        physical_address: u64,
        size: u64,
        prot: Prot,
    ) -> Result<(), PageTableError> {
        assert!(!self.secure, "secure tables are only written by the monitor");
        if let Some(fail_at) = *self.fail_map_at.lock()
            && (iova..iova + size).contains(&fail_at)
        {
            return Err(PageTableError);
        }
        self.mappings.insert(iova, (physical_address, size, prot));
        Ok(())
    }

    fn unmap(&mut self, iova: u64, size: u64) -> u64 {
        let unmapped: Vec<u64> = self
            .mappings
            .range(iova..iova + size)
            .map(|(&iova, _)| iova)
            .collect();
        unmapped
            .into_iter()
            .filter_map(|iova| self.mappings.remove(&iova))
            .map(|(_, size, _)| size)
            .sum()
    }

    fn install(&mut self, unit: &UnitConfig, context: &ContextConfig) -> Result<(), PageTableError> {
        self.installed.push((unit.name.clone(), context.bank));
        Ok(())
    }

    fn uninstall(&mut self, unit: &UnitConfig, context: &ContextConfig) {
        self.installed
            .retain(|(name, bank)| *name != unit.name || *bank != context.bank);
    }
}

/// Physically contiguous memory handed out from a fake address range.
pub struct FakeMemory {
    next: AtomicU64,
    live: SpinMutex<Vec<(u64, u64)>>,
}

impl Default for FakeMemory {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(0x9000_0000),
            live: SpinMutex::new(Vec::new()),
        }
    }
}

impl FakeMemory {
    /// Returns the live allocations as (physical address, size).
    pub fn live(&self) -> Vec<(u64, u64)> {
        self.live.lock().clone()
    }

    fn allocate(&self, size: u64) -> Option<u64> {
        let address = self
            .next
            .fetch_add(size.next_multiple_of(0x1000), Ordering::SeqCst);
        self.live.lock().push((address, size));
        Some(address)
    }

    fn free(&self, address: u64, size: u64) {
        let mut live = self.live.lock();
        let index = live
            .iter()
            .position(|&allocation| allocation == (address, size))
            .expect("freeing memory that was not allocated");
        live.remove(index);
    }
}

#[derive(Clone, Debug, Default)]
struct FakePmuUnit {
    values: BTreeMap<(usize, usize), u32>,
    event_classes: BTreeMap<(usize, usize), u32>,
    /// Overflow status bits per group.
    overflow: BTreeMap<usize, u32>,
    enabled: bool,
    resets: usize,
}

/// Performance counter registers of every unit.
pub struct FakePmu {
    reported_groups: AtomicUsize,
    counters_per_group: AtomicUsize,
    units: SpinMutex<BTreeMap<String, FakePmuUnit>>,
}

impl Default for FakePmu {
    fn default() -> Self {
        Self {
            // Like the hardware this works around, report no groups by default.
            reported_groups: AtomicUsize::new(0),
            counters_per_group: AtomicUsize::new(4),
            units: SpinMutex::new(BTreeMap::new()),
        }
    }
}

impl FakePmu {
    pub fn set_geometry(&self, groups: usize, counters_per_group: usize) {
        self.reported_groups.store(groups, Ordering::SeqCst);
        self.counters_per_group
            .store(counters_per_group, Ordering::SeqCst);
    }

    pub fn set_value(&self, unit: &str, group: usize, counter: usize, value: u32) {
        self.units
            .lock()
            .entry(unit.to_string())
            .or_default()
            .values
            .insert((group, counter), value);
    }

    pub fn raise_overflow(&self, unit: &str, group: usize, counter: usize) {
        *self
            .units
            .lock()
            .entry(unit.to_string())
            .or_default()
            .overflow
            .entry(group)
            .or_default() |= 1 << counter;
    }

    pub fn is_enabled(&self, unit: &str) -> bool {
        self.unit(unit).enabled
    }

    pub fn resets(&self, unit: &str) -> usize {
        self.unit(unit).resets
    }

    pub fn event_class(&self, unit: &str, group: usize, counter: usize) -> Option<u32> {
        self.unit(unit).event_classes.get(&(group, counter)).copied()
    }

    fn unit(&self, unit: &str) -> FakePmuUnit {
        self.units.lock().get(unit).cloned().unwrap_or_default()
    }

    fn update<R>(&self, unit: &UnitConfig, f: impl FnOnce(&mut FakePmuUnit) -> R) -> R {
        f(self.units.lock().entry(unit.name.to_string()).or_default())
    }
}

#[cfg(feature = "perfmon")]
impl PerfCounterHardware for FakePmu {
    fn group_count(&self, _unit: &UnitConfig) -> usize {
        self.reported_groups.load(Ordering::SeqCst)
    }

    fn counters_per_group(&self, _unit: &UnitConfig) -> usize {
        self.counters_per_group.load(Ordering::SeqCst)
    }

    fn select_event_class(&self, unit: &UnitConfig, group: usize, counter: usize, class: u32) {
        self.update(unit, |state| state.event_classes.insert((group, counter), class));
    }

    fn reset_counters(&self, unit: &UnitConfig) {
        self.update(unit, |state| {
            state.values.clear();
            state.overflow.clear();
            state.resets += 1;
        });
    }

    fn enable_counters(&self, unit: &UnitConfig, enable: bool) {
        self.update(unit, |state| state.enabled = enable);
    }

    fn read_counter(&self, unit: &UnitConfig, group: usize, counter: usize) -> u32 {
        self.update(unit, |state| {
            state.values.get(&(group, counter)).copied().unwrap_or(0)
        })
    }

    fn take_overflow(&self, unit: &UnitConfig, group: usize) -> u32 {
        self.update(unit, |state| state.overflow.remove(&group).unwrap_or(0))
    }
}
