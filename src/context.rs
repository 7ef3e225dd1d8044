// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Translation units, their context banks, and the registry that finds contexts by name.

use crate::{
    config::{ContextConfig, UnitConfig},
    domain::DomainHandle,
    error::Error,
};
use alloc::{
    borrow::ToOwned,
    collections::BTreeMap,
    string::{String, ToString},
    sync::Arc,
    vec::Vec,
};
use core::fmt::{self, Debug, Formatter};
use log::{debug, info};
use spin::mutex::SpinMutex;

/// Attachment bookkeeping of a unit, shared by all its contexts.
#[derive(Debug, Default)]
pub(crate) struct UnitState {
    /// Number of contexts of the unit currently attached to a domain.
    pub attach_count: usize,
    /// Whether the monitor has configured the unit since its first attachment.
    pub programmed: bool,
}

/// One hardware translation unit.
pub struct Unit {
    config: UnitConfig,
    /// Registration order, which also identifies the unit in the overflow pending mask.
    index: usize,
    pub(crate) state: SpinMutex<UnitState>,
}

impl Unit {
    /// Returns the unit's unique name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Returns the configuration the unit was registered with.
    pub fn config(&self) -> &UnitConfig {
        &self.config
    }

    /// Returns the unit's registration index.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the id the monitor knows the unit by, if it is a secure unit.
    pub fn secure_id(&self) -> Option<u32> {
        self.config.secure_id
    }

    /// Returns whether the unit is a secure unit.
    pub fn is_secure(&self) -> bool {
        self.config.is_secure()
    }

    /// Returns the number of the unit's contexts attached to a domain.
    pub fn attach_count(&self) -> usize {
        self.state.lock().attach_count
    }

    /// Returns whether the monitor has configured the unit for its current attachments.
    pub fn is_programmed(&self) -> bool {
        self.state.lock().programmed
    }
}

impl Debug for Unit {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "unit {} ({})", self.index, self.config.name)?;
        if let Some(secure_id) = self.config.secure_id {
            write!(f, " secure id {secure_id}")?;
        }
        if let Some(state) = self.state.try_lock() {
            write!(
                f,
                ", {} attached, programmed {}",
                state.attach_count, state.programmed
            )?;
        }
        Ok(())
    }
}

/// A context bank of a unit.
pub struct Context {
    config: ContextConfig,
    unit: Arc<Unit>,
    /// The domain this context is attached to, if any.
    pub(crate) attachment: SpinMutex<Option<DomainHandle>>,
}

impl Context {
    /// Returns the context's unique name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Returns the index of the context bank within its unit.
    pub fn bank(&self) -> u32 {
        self.config.bank
    }

    /// Returns the stream IDs routed to the context bank.
    pub fn stream_ids(&self) -> &[u16] {
        &self.config.stream_ids
    }

    /// Returns the configuration the context was added with.
    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// Returns the unit the context bank belongs to.
    pub fn unit(&self) -> &Arc<Unit> {
        &self.unit
    }

    /// Returns the handle of the domain the context is attached to.
    pub fn attached_domain(&self) -> Option<DomainHandle> {
        *self.attachment.lock()
    }

    /// Returns whether the context is attached to any domain.
    pub fn is_attached(&self) -> bool {
        self.attached_domain().is_some()
    }
}

impl Debug for Context {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "context {} bank {} of {}",
            self.config.name, self.config.bank, self.unit.config.name
        )?;
        if let Some(Some(domain)) = self.attachment.try_lock().map(|attachment| *attachment) {
            write!(f, ", attached to domain {domain}")?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct RegistryState {
    units: Vec<Arc<Unit>>,
    contexts: BTreeMap<String, Arc<Context>>,
}

/// The registered units and their contexts.
#[derive(Default)]
pub struct ContextRegistry {
    state: SpinMutex<RegistryState>,
}

impl ContextRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a unit.
    pub fn register_unit(&self, config: UnitConfig) -> Result<Arc<Unit>, Error> {
        let mut state = self.state.lock();
        if state.units.iter().any(|unit| unit.name() == config.name) {
            return Err(Error::DuplicateName(config.name));
        }
        let unit = Arc::new(Unit {
            index: state.units.len(),
            config,
            state: SpinMutex::new(UnitState::default()),
        });
        state.units.push(unit.clone());
        drop(state);

        info!("Registered {unit:?}");
        Ok(unit)
    }

    /// Adds a context bank to a registered unit.
    pub fn add_context(&self, unit: &str, config: ContextConfig) -> Result<Arc<Context>, Error> {
        let mut state = self.state.lock();
        let unit = state
            .units
            .iter()
            .find(|candidate| candidate.name() == unit)
            .cloned()
            .ok_or_else(|| Error::UnitNotFound(unit.to_owned()))?;
        if state.contexts.contains_key(&config.name) {
            return Err(Error::DuplicateName(config.name));
        }
        let context = Arc::new(Context {
            config,
            unit,
            attachment: SpinMutex::new(None),
        });
        state
            .contexts
            .insert(context.name().to_string(), context.clone());
        drop(state);

        debug!("Added {context:?}");
        Ok(context)
    }

    /// Removes a context that is not attached to any domain.
    pub fn remove_context(&self, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock();
        let context = state
            .contexts
            .get(name)
            .ok_or_else(|| Error::ContextNotFound(name.to_owned()))?;
        if context.is_attached() {
            return Err(Error::ContextBusy(name.to_owned()));
        }
        state.contexts.remove(name);
        drop(state);

        debug!("Removed context {name}");
        Ok(())
    }

    /// Looks up a context by name.
    pub fn get_context(&self, name: &str) -> Result<Arc<Context>, Error> {
        self.state
            .lock()
            .contexts
            .get(name)
            .cloned()
            .ok_or_else(|| Error::ContextNotFound(name.to_owned()))
    }

    /// Looks up a unit by name.
    pub fn unit(&self, name: &str) -> Result<Arc<Unit>, Error> {
        self.state
            .lock()
            .units
            .iter()
            .find(|unit| unit.name() == name)
            .cloned()
            .ok_or_else(|| Error::UnitNotFound(name.to_owned()))
    }

    /// Returns all registered units in registration order.
    pub fn units(&self) -> Vec<Arc<Unit>> {
        self.state.lock().units.clone()
    }

    /// Returns the contexts of a unit.
    pub fn contexts_of(&self, unit: &Unit) -> Vec<Arc<Context>> {
        self.state
            .lock()
            .contexts
            .values()
            .filter(|context| context.unit.index == unit.index)
            .cloned()
            .collect()
    }
}

impl Debug for ContextRegistry {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        let Some(state) = self.state.try_lock() else {
            return writeln!(f, "context registry is locked");
        };
        for unit in &state.units {
            writeln!(f, "{unit:?}")?;
            for context in state.contexts.values() {
                if Arc::ptr_eq(&context.unit, unit) {
                    writeln!(f, "  {context:?}")?;
                }
            }
        }
        Ok(())
    }
}
