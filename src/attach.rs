// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Binding contexts to domains, with the power and programming sequence around it.
//!
//! Locks are always taken in the order context, domain, unit. Attach observers are notified with
//! the unit lock held, so the attach count they are given cannot change under them, and must not
//! take any of these locks themselves.

use crate::{
    config::{BfbSetting, UnitConfig},
    context::{Context, Unit},
    domain::{Domain, PageTable},
    error::Error,
    platform::Platform,
    secure::SecureMediator,
};
use alloc::{borrow::ToOwned, sync::Arc};
use log::{debug, warn};

/// A regulator or clock could not be enabled.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PowerError;

/// Power, clock and bus-fabric controls of the translation units.
pub trait UnitPower {
    /// Enables the unit's regulator. Stays enabled for as long as any context is attached.
    fn enable_regulator(&self, unit: &UnitConfig) -> Result<(), PowerError>;

    /// Drops one reference to the unit's regulator.
    fn disable_regulator(&self, unit: &UnitConfig);

    /// Enables the clocks needed to access the unit's registers. Calls are counted, so every
    /// successful call must be paired with [`UnitPower::disable_clocks`].
    fn enable_clocks(&self, unit: &UnitConfig) -> Result<(), PowerError>;

    /// Drops one reference to the unit's clocks.
    fn disable_clocks(&self, unit: &UnitConfig);

    /// Writes a bus-fabric-bypass register of the unit. Clocks are enabled around this.
    fn write_bfb(&self, unit: &UnitConfig, setting: BfbSetting);
}

/// Told about changes of a unit's attach count.
///
/// Both hooks run with the unit's state lock held.
pub trait AttachObserver<P: Platform> {
    /// Called once a context of the unit is attached, with the unit's new attach count.
    fn attached(&self, platform: &P, unit: &Unit, attach_count: usize);

    /// Called before a context of the unit is detached, with the attach count the unit will have
    /// afterwards.
    fn detaching(&self, platform: &P, unit: &Unit, attach_count: usize);
}

impl<P: Platform> AttachObserver<P> for () {
    fn attached(&self, _platform: &P, _unit: &Unit, _attach_count: usize) {}

    fn detaching(&self, _platform: &P, _unit: &Unit, _attach_count: usize) {}
}

/// Attaches `context` to `domain`.
///
/// On the unit's first attachment a secure unit is programmed by the monitor. Staged BFB settings
/// are applied on every attachment. On failure everything enabled so far is disabled again and no
/// attachment is recorded.
pub fn attach<P: Platform>(
    platform: &P,
    context: &Arc<Context>,
    domain: &Domain<P::PageTable>,
    observer: &impl AttachObserver<P>,
) -> Result<(), Error> {
    let unit = context.unit();
    if domain.is_secure() != unit.is_secure() {
        return Err(Error::InvalidArgument(
            "secure domains can only be attached to secure units",
        ));
    }

    let mut attachment = context.attachment.lock();
    if attachment.is_some() {
        return Err(Error::AlreadyAttached(context.name().to_owned()));
    }
    let mut attached = domain.attached.lock();
    if attached.iter().any(|other| Arc::ptr_eq(other, context)) {
        return Err(Error::AlreadyAttached(context.name().to_owned()));
    }

    let power = platform.power();
    let power_failed = || Error::PowerEnableFailed(unit.name().to_owned());
    power
        .enable_regulator(unit.config())
        .map_err(|_| power_failed())?;
    if power.enable_clocks(unit.config()).is_err() {
        power.disable_regulator(unit.config());
        return Err(power_failed());
    }

    let result = bring_up(platform, context, domain, observer);
    power.disable_clocks(unit.config());
    if let Err(e) = result {
        power.disable_regulator(unit.config());
        return Err(e);
    }

    attached.push(context.clone());
    *attachment = Some(domain.handle());
    drop(attached);
    debug!(
        "Attached {}/{} to domain {}",
        unit.name(),
        context.name(),
        domain.handle()
    );
    Ok(())
}

/// Programs the unit if needed, applies BFB settings and installs the page tables, then counts
/// the attachment. Clocks are on.
fn bring_up<P: Platform>(
    platform: &P,
    context: &Context,
    domain: &Domain<P::PageTable>,
    observer: &impl AttachObserver<P>,
) -> Result<(), Error> {
    let unit = context.unit();
    let mut state = unit.state.lock();

    let programmed = match unit.secure_id() {
        Some(secure_id) if state.attach_count == 0 => {
            SecureMediator::new(platform).program_unit(secure_id)
        }
        _ => Ok(()),
    };
    for setting in &unit.config().bfb_settings {
        platform.power().write_bfb(unit.config(), *setting);
    }
    programmed?;
    if unit.is_secure() {
        state.programmed = true;
    }

    if !domain.is_secure() {
        domain
            .table
            .lock()
            .install(unit.config(), context.config())
            .map_err(|_| Error::PageTable { iova: 0 })?;
    }

    state.attach_count += 1;
    observer.attached(platform, unit, state.attach_count);
    Ok(())
}

/// Detaches `context` from `domain`.
///
/// Detaching a context that is not attached to this domain does nothing. If the unit can't be
/// clocked to take the domain's page table out of the context bank, the context stays attached and
/// `PowerEnableFailed` is returned.
pub fn detach<P: Platform>(
    platform: &P,
    context: &Arc<Context>,
    domain: &Domain<P::PageTable>,
    observer: &impl AttachObserver<P>,
) -> Result<(), Error> {
    let unit = context.unit();
    let mut attachment = context.attachment.lock();
    if *attachment != Some(domain.handle()) {
        warn!(
            "{} is not attached to domain {}, ignoring detach",
            context.name(),
            domain.handle()
        );
        return Ok(());
    }

    let power = platform.power();
    if !domain.is_secure() && power.enable_clocks(unit.config()).is_err() {
        warn!("Unable to clock {} to reset {}", unit.name(), context.name());
        return Err(Error::PowerEnableFailed(unit.name().to_owned()));
    }

    let mut attached = domain.attached.lock();
    let mut state = unit.state.lock();
    debug_assert!(state.attach_count > 0);
    let remaining = state.attach_count.saturating_sub(1);
    observer.detaching(platform, unit, remaining);

    attached.retain(|other| !Arc::ptr_eq(other, context));
    if !domain.is_secure() {
        domain
            .table
            .lock()
            .uninstall(unit.config(), context.config());
        power.disable_clocks(unit.config());
    }

    state.attach_count = remaining;
    if remaining == 0 {
        state.programmed = false;
    }
    drop(state);
    drop(attached);

    *attachment = None;
    power.disable_regulator(unit.config());
    debug!(
        "Detached {}/{} from domain {}",
        unit.name(),
        context.name(),
        domain.handle()
    );
    Ok(())
}
