// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Performance counters of the translation units.
//!
//! Each registered unit has a monitor that is `Disabled`, `Enabled` but waiting for the unit to be
//! attached, or `Armed` and counting. Counters only count while armed, since the unit's clocks are
//! only guaranteed to be on then.
//!
//! Overflow interrupts only set a bit in a pending mask; the counting happens later in
//! [`PerfMonitor::process_deferred`].

use crate::{
    attach::{AttachObserver, UnitPower},
    config::UnitConfig,
    context::Unit,
    error::Error,
    platform::Platform,
};
use alloc::{borrow::ToOwned, collections::BTreeMap, sync::Arc, vec::Vec};
use arrayvec::ArrayVec;
use core::sync::atomic::{AtomicU64, Ordering};
use log::{debug, info, warn};
use spin::mutex::SpinMutex;

/// Maximum number of counter groups tracked per unit.
pub const MAX_GROUPS: usize = 8;

/// Maximum number of counters tracked per group.
pub const MAX_COUNTERS_PER_GROUP: usize = 8;

/// Units whose index doesn't fit in the pending mask can't have a monitor.
const MAX_UNITS: usize = u64::BITS as usize;

/// The counter registers of the translation units.
pub trait PerfCounterHardware {
    /// Returns the number of counter groups the unit reports.
    fn group_count(&self, unit: &UnitConfig) -> usize;

    /// Returns the number of counters in each group.
    fn counters_per_group(&self, unit: &UnitConfig) -> usize;

    /// Selects the event class a counter counts.
    fn select_event_class(&self, unit: &UnitConfig, group: usize, counter: usize, class: u32);

    /// Zeroes all counters of the unit and clears their overflow status.
    fn reset_counters(&self, unit: &UnitConfig);

    /// Starts or stops all counters of the unit.
    fn enable_counters(&self, unit: &UnitConfig, enable: bool);

    /// Returns the current hardware value of a counter.
    fn read_counter(&self, unit: &UnitConfig, group: usize, counter: usize) -> u32;

    /// Returns and clears the overflow status bits of a group, one bit per counter.
    fn take_overflow(&self, unit: &UnitConfig, group: usize) -> u32;
}

/// Where a unit's monitor is in its life cycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MonitorState {
    /// Not counting and not waiting to.
    Disabled,
    /// Enabled, but no context of the unit is attached.
    Enabled,
    /// Counting while a context of the unit is attached.
    Armed,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
struct Counter {
    event_class: Option<u32>,
    /// Last value read from the hardware.
    raw: u32,
    overflows: u32,
}

impl Counter {
    fn value(&self) -> u64 {
        (u64::from(self.overflows) << 32) | u64::from(self.raw)
    }
}

/// The logical value of one counter.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CounterValue {
    /// Group of the counter.
    pub group: usize,
    /// Index of the counter within its group.
    pub counter: usize,
    /// What the counter counts, if anything was selected.
    pub event_class: Option<u32>,
    /// Overflow count in the upper 32 bits, hardware value in the lower.
    pub value: u64,
}

type Groups = ArrayVec<ArrayVec<Counter, MAX_COUNTERS_PER_GROUP>, MAX_GROUPS>;

struct UnitMonitor {
    unit: Arc<Unit>,
    state: MonitorState,
    /// Attached contexts of the unit, as last reported through the attach hooks.
    attach_count: usize,
    groups: Groups,
}

impl UnitMonitor {
    fn counters_mut(&mut self) -> impl Iterator<Item = (usize, usize, &mut Counter)> {
        self.groups.iter_mut().enumerate().flat_map(|(g, group)| {
            group
                .iter_mut()
                .enumerate()
                .map(move |(c, counter)| (g, c, counter))
        })
    }

    fn arm<P: Platform>(&mut self, platform: &P) {
        let unit = self.unit.clone();
        if platform.power().enable_clocks(unit.config()).is_err() {
            warn!("Unable to clock {} to arm its counters", unit.name());
            return;
        }
        let pmu = platform.pmu();
        for (g, c, counter) in self.counters_mut() {
            if let Some(class) = counter.event_class {
                pmu.select_event_class(unit.config(), g, c, class);
            }
        }
        pmu.enable_counters(unit.config(), true);
        self.state = MonitorState::Armed;
        debug!("Counters of {} armed", unit.name());
    }

    /// Latches the hardware values, stops counting and releases the clocks.
    fn disarm<P: Platform>(&mut self, platform: &P) {
        let unit = self.unit.clone();
        self.refresh(platform);
        platform.pmu().enable_counters(unit.config(), false);
        platform.power().disable_clocks(unit.config());
        self.state = MonitorState::Enabled;
        debug!("Counters of {} disarmed", unit.name());
    }

    fn refresh<P: Platform>(&mut self, platform: &P) {
        let unit = self.unit.clone();
        let pmu = platform.pmu();
        for (g, c, counter) in self.counters_mut() {
            counter.raw = pmu.read_counter(unit.config(), g, c);
        }
    }

    fn counter_mut(&mut self, group: usize, counter: usize) -> Result<&mut Counter, Error> {
        self.groups
            .get_mut(group)
            .and_then(|group| group.get_mut(counter))
            .ok_or(Error::InvalidArgument("no such counter"))
    }
}

/// The performance monitors of all registered units.
pub struct PerfMonitor {
    monitors: SpinMutex<BTreeMap<usize, Arc<SpinMutex<UnitMonitor>>>>,
    /// One bit per unit index with an overflow interrupt not yet processed.
    pending: AtomicU64,
}

impl PerfMonitor {
    /// Creates a monitor set with no units registered.
    pub const fn new() -> Self {
        Self {
            monitors: SpinMutex::new(BTreeMap::new()),
            pending: AtomicU64::new(0),
        }
    }

    /// Registers a monitor for the unit, reading its counter geometry from the hardware.
    pub fn register<P: Platform>(&self, platform: &P, unit: &Arc<Unit>) -> Result<(), Error> {
        if unit.index() >= MAX_UNITS {
            return Err(Error::InvalidArgument("unit index too large for a perf monitor"));
        }

        let pmu = platform.pmu();
        let mut group_count = pmu.group_count(unit.config());
        // Some units report no groups while having one.
        if group_count == 0 {
            group_count = 1;
        }
        if group_count > MAX_GROUPS {
            warn!(
                "{} reports {group_count} counter groups, only tracking {MAX_GROUPS}",
                unit.name()
            );
            group_count = MAX_GROUPS;
        }
        let counter_count = pmu
            .counters_per_group(unit.config())
            .min(MAX_COUNTERS_PER_GROUP);

        let mut groups = Groups::new();
        for _ in 0..group_count {
            groups.push((0..counter_count).map(|_| Counter::default()).collect());
        }
        // Holding the unit's lock keeps the attach hooks out until the monitor is in place, so the
        // count read here is the one the hooks continue from.
        let unit_state = unit.state.lock();
        let monitor = UnitMonitor {
            unit: unit.clone(),
            state: MonitorState::Disabled,
            attach_count: unit_state.attach_count,
            groups,
        };

        let mut monitors = self.monitors.lock();
        if monitors.contains_key(&unit.index()) {
            return Err(Error::DuplicateName(unit.name().to_owned()));
        }
        monitors.insert(unit.index(), Arc::new(SpinMutex::new(monitor)));
        info!(
            "Perf monitor of {}: {group_count} groups of {counter_count} counters",
            unit.name()
        );
        Ok(())
    }

    /// Removes the unit's monitor, stopping its counters first.
    pub fn unregister<P: Platform>(&self, platform: &P, unit: &Unit) -> Result<(), Error> {
        let monitor = self
            .monitors
            .lock()
            .remove(&unit.index())
            .ok_or_else(|| Error::PerfMonitorNotRegistered(unit.name().to_owned()))?;
        let mut monitor = monitor.lock();
        if monitor.state == MonitorState::Armed {
            monitor.disarm(platform);
        }
        Ok(())
    }

    /// Enables or disables the unit's monitor. An enabled monitor arms once the unit is attached.
    pub fn enable<P: Platform>(&self, platform: &P, unit: &Unit, enable: bool) -> Result<(), Error> {
        let monitor = self.monitor(unit)?;
        let mut monitor = monitor.lock();
        match (enable, monitor.state) {
            (true, MonitorState::Disabled) => {
                monitor.state = MonitorState::Enabled;
                if monitor.attach_count > 0 {
                    monitor.arm(platform);
                }
            }
            (false, MonitorState::Armed) => {
                monitor.disarm(platform);
                monitor.state = MonitorState::Disabled;
            }
            (false, MonitorState::Enabled) => monitor.state = MonitorState::Disabled,
            _ => {}
        }
        Ok(())
    }

    /// Zeroes the unit's counters and overflow tallies.
    pub fn reset<P: Platform>(&self, platform: &P, unit: &Unit) -> Result<(), Error> {
        let monitor = self.monitor(unit)?;
        let mut monitor = monitor.lock();
        let power = platform.power();
        let armed = monitor.state == MonitorState::Armed;
        if !armed {
            power
                .enable_clocks(unit.config())
                .map_err(|_| Error::PowerEnableFailed(unit.name().to_owned()))?;
        }
        platform.pmu().reset_counters(unit.config());
        if !armed {
            power.disable_clocks(unit.config());
        }
        for (_, _, counter) in monitor.counters_mut() {
            counter.raw = 0;
            counter.overflows = 0;
        }
        Ok(())
    }

    /// Returns the logical value of every counter of the unit.
    ///
    /// While armed the values are read from the hardware, otherwise the values latched when the
    /// monitor was disarmed are returned.
    pub fn read_all<P: Platform>(&self, platform: &P, unit: &Unit) -> Result<Vec<CounterValue>, Error> {
        let monitor = self.monitor(unit)?;
        let mut monitor = monitor.lock();
        if monitor.state == MonitorState::Armed {
            monitor.refresh(platform);
        }
        Ok(monitor
            .counters_mut()
            .map(|(group, counter, state)| CounterValue {
                group,
                counter,
                event_class: state.event_class,
                value: state.value(),
            })
            .collect())
    }

    /// Selects what a counter counts, or stops it counting with `None`.
    pub fn set_event_class<P: Platform>(
        &self,
        platform: &P,
        unit: &Unit,
        group: usize,
        counter: usize,
        class: Option<u32>,
    ) -> Result<(), Error> {
        let monitor = self.monitor(unit)?;
        let mut monitor = monitor.lock();
        let armed = monitor.state == MonitorState::Armed;
        monitor.counter_mut(group, counter)?.event_class = class;
        if armed && let Some(class) = class {
            platform
                .pmu()
                .select_event_class(unit.config(), group, counter, class);
        }
        Ok(())
    }

    /// Returns the state of the unit's monitor.
    pub fn state(&self, unit: &Unit) -> Result<MonitorState, Error> {
        Ok(self.monitor(unit)?.lock().state)
    }

    /// Notes an overflow interrupt of the unit with the given index.
    ///
    /// Safe to call from interrupt context: it neither blocks nor allocates.
    pub fn overflow_interrupt(&self, unit_index: usize) {
        if unit_index < MAX_UNITS {
            self.pending.fetch_or(1 << unit_index, Ordering::AcqRel);
        }
    }

    /// Adds pending overflows to the tallies of their counters. Returns the number of overflows
    /// counted.
    pub fn process_deferred<P: Platform>(&self, platform: &P) -> usize {
        let mut pending = self.pending.swap(0, Ordering::AcqRel);
        let mut counted = 0;
        while pending != 0 {
            let index = pending.trailing_zeros() as usize;
            pending &= pending - 1;

            let Some(monitor) = self.monitors.lock().get(&index).cloned() else {
                continue;
            };
            let mut monitor = monitor.lock();
            if monitor.state != MonitorState::Armed {
                continue;
            }
            let unit = monitor.unit.clone();
            for (g, group) in monitor.groups.iter_mut().enumerate() {
                let status = platform.pmu().take_overflow(unit.config(), g);
                for (c, counter) in group.iter_mut().enumerate() {
                    if status & (1 << c) != 0 {
                        counter.overflows = counter.overflows.wrapping_add(1);
                        counted += 1;
                    }
                }
            }
        }
        counted
    }

    fn monitor(&self, unit: &Unit) -> Result<Arc<SpinMutex<UnitMonitor>>, Error> {
        self.monitors
            .lock()
            .get(&unit.index())
            .cloned()
            .ok_or_else(|| Error::PerfMonitorNotRegistered(unit.name().to_owned()))
    }
}

impl Default for PerfMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Platform> AttachObserver<P> for PerfMonitor {
    fn attached(&self, platform: &P, unit: &Unit, attach_count: usize) {
        let Ok(monitor) = self.monitor(unit) else {
            return;
        };
        let mut monitor = monitor.lock();
        monitor.attach_count = attach_count;
        if monitor.state == MonitorState::Enabled {
            monitor.arm(platform);
        }
    }

    fn detaching(&self, platform: &P, unit: &Unit, attach_count: usize) {
        let Ok(monitor) = self.monitor(unit) else {
            return;
        };
        let mut monitor = monitor.lock();
        monitor.attach_count = attach_count;
        if attach_count == 0 && monitor.state == MonitorState::Armed {
            monitor.disarm(platform);
        }
    }
}
