// Copyright The Rusted Firmware-A Contributors.
//
// SPDX-License-Identifier: BSD-3-Clause

//! Function identifiers and return codes for calls into the privileged monitor.
//!
//! Monitor calls follow the SMC Calling Convention: the memory-protection service lives in the
//! SiP owning entity, and each command is addressed by a service/command pair packed into the
//! low 16 bits of the function ID.

use core::fmt::{self, Debug, Display, Formatter};

const FAST_CALL: u32 = 0x8000_0000;
const SMC64: u32 = 0x4000_0000;
const OEN_MASK: u32 = 0x3f00_0000;
const OEN_SHIFT: u8 = 24;
const SERVICE_SHIFT: u8 = 8;

/// The call completed successfully.
pub const SUCCESS: i32 = 0;

/// The call is not supported by the implementation.
pub const NOT_SUPPORTED: i32 = -1;

/// One of the call parameters has a non-supported value.
pub const INVALID_PARAMETER: i32 = -3;

/// The type of an SMCCC call.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SmcccCallType {
    /// An SMC32 fast call.
    Fast32,
    /// An SMC64 fast call.
    Fast64,
    /// A yielding call.
    Yielding,
}

/// Owning Entity Number (OEN)
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct OwningEntityNumber(pub u8);

impl OwningEntityNumber {
    /// Silicon-partner specific services, which is where the memory-protection service lives.
    pub const SIP: Self = Self(2);
}

impl Display for OwningEntityNumber {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An SMCCC function ID.
#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(transparent)]
pub struct FunctionId(pub u32);

impl FunctionId {
    /// Creates a new `FunctionId` from its components.
    pub const fn new(call_type: SmcccCallType, oen: OwningEntityNumber, number: u16) -> Self {
        let type_bits = match call_type {
            SmcccCallType::Fast32 => FAST_CALL,
            SmcccCallType::Fast64 => FAST_CALL | SMC64,
            SmcccCallType::Yielding => 0,
        };
        Self(type_bits | (((oen.0 as u32) << OEN_SHIFT) & OEN_MASK) | (number as u32))
    }

    /// Creates the ID of a SiP call addressed by a service and a command within it.
    ///
    /// Calls that pass command buffers by reference are yielding calls, since the monitor may take
    /// an unbounded (but finite) time walking them.
    pub const fn sip(service: u8, command: u8) -> Self {
        Self::new(
            SmcccCallType::Yielding,
            OwningEntityNumber::SIP,
            ((service as u16) << SERVICE_SHIFT) | command as u16,
        )
    }

    /// Returns the Owning Entity Number of the function ID.
    pub fn oen(self) -> OwningEntityNumber {
        OwningEntityNumber(((self.0 & OEN_MASK) >> OEN_SHIFT) as u8)
    }

    /// Returns the lower 16 bits of the function ID.
    pub fn number(self) -> u16 {
        self.0 as u16
    }

    /// Returns the service a SiP call is addressed to.
    pub fn service(self) -> u8 {
        (self.number() >> SERVICE_SHIFT) as u8
    }

    /// Returns the command within the service.
    pub fn command(self) -> u8 {
        self.number() as u8
    }

    /// Returns what type of call this is.
    pub fn call_type(self) -> SmcccCallType {
        if self.0 & FAST_CALL != 0 {
            if self.0 & SMC64 != 0 {
                SmcccCallType::Fast64
            } else {
                SmcccCallType::Fast32
            }
        } else {
            SmcccCallType::Yielding
        }
    }
}

impl Display for FunctionId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl Debug for FunctionId {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "{:#010x} ({:?} OEN {} service {:#x} command {:#x})",
            self.0,
            self.call_type(),
            self.oen(),
            self.service(),
            self.command()
        )
    }
}
