use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{BridgeError, Result};

/// The four Modbus register classes. Coils and holding registers are
/// writable, discrete inputs and input registers are read-only.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
    EnumString,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RegisterType {
    Coil,
    DiscreteInput,
    Holding,
    Input,
}

impl RegisterType {
    pub fn is_writable(self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::Holding)
    }

    /// Coils and discrete inputs travel as packed bits on the wire.
    pub fn is_bit(self) -> bool {
        matches!(self, RegisterType::Coil | RegisterType::DiscreteInput)
    }
}

/// A contiguous run of registers of one type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRange {
    pub first: u16,
    pub count: u16,
    pub reg_type: RegisterType,
}

impl AddressRange {
    pub fn new(first: u16, count: u16, reg_type: RegisterType) -> Result<Self> {
        if count == 0 {
            return Err(BridgeError::config("register count cannot be 0"));
        }
        if u32::from(first) + u32::from(count) - 1 > u32::from(u16::MAX) {
            return Err(BridgeError::config(format!(
                "register range {first}+{count} exceeds address space"
            )));
        }
        Ok(AddressRange {
            first,
            count,
            reg_type,
        })
    }

    pub fn single(number: u16, reg_type: RegisterType) -> Self {
        AddressRange {
            first: number,
            count: 1,
            reg_type,
        }
    }

    pub fn last(&self) -> u16 {
        self.first + self.count - 1
    }

    pub fn contains(&self, number: u16) -> bool {
        self.first <= number && number <= self.last()
    }

    pub fn overlaps(&self, other: &AddressRange) -> bool {
        if self.reg_type != other.reg_type {
            return false;
        }
        self.first <= other.last() && other.first <= self.last()
    }

    pub fn is_consecutive_of(&self, other: &AddressRange) -> bool {
        u32::from(self.last()) + 1 == u32::from(other.first)
            || u32::from(other.last()) + 1 == u32::from(self.first)
    }

    /// Extend this range to the enclosing span of both. Caller must ensure
    /// both ranges share a register type.
    pub fn merge(&mut self, other: &AddressRange) {
        debug_assert_eq!(self.reg_type, other.reg_type);
        let first = self.first.min(other.first);
        let last = self.last().max(other.last());
        log::debug!(
            "extending register range {}({}) to {}({})",
            self.first,
            self.count,
            first,
            last - first + 1
        );
        self.first = first;
        self.count = last - first + 1;
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}({})", self.reg_type, self.first, self.count)
    }
}

/// When register state is emitted towards the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    OnChange,
    EveryPoll,
    Once,
}

impl Default for PublishMode {
    fn default() -> Self {
        PublishMode::OnChange
    }
}

impl PublishMode {
    fn rank(self) -> u8 {
        match self {
            PublishMode::Once => 0,
            PublishMode::OnChange => 1,
            PublishMode::EveryPoll => 2,
        }
    }

    /// When two polls merge the most-reporting mode wins.
    pub fn most_reporting(self, other: PublishMode) -> PublishMode {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

/// Condition under which a command delay is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayKind {
    None,
    OnSlaveChange,
    EveryTime,
}

/// A silence requirement before a command may be issued on the bus.
/// Zero magnitude is the identity regardless of kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandDelay {
    pub kind: DelayKind,
    pub duration: Duration,
}

impl CommandDelay {
    pub const NONE: CommandDelay = CommandDelay {
        kind: DelayKind::None,
        duration: Duration::ZERO,
    };

    pub fn every_time(duration: Duration) -> Self {
        if duration.is_zero() {
            CommandDelay::NONE
        } else {
            CommandDelay {
                kind: DelayKind::EveryTime,
                duration,
            }
        }
    }

    pub fn on_slave_change(duration: Duration) -> Self {
        if duration.is_zero() {
            CommandDelay::NONE
        } else {
            CommandDelay {
                kind: DelayKind::OnSlaveChange,
                duration,
            }
        }
    }

    pub fn is_zero(&self) -> bool {
        self.duration.is_zero()
    }

    /// Whether this delay must be honored given the previous and next slave.
    pub fn applies(&self, last_slave: Option<u8>, next_slave: u8) -> bool {
        match self.kind {
            DelayKind::None => false,
            DelayKind::EveryTime => true,
            DelayKind::OnSlaveChange => {
                matches!(last_slave, Some(last) if last != next_slave)
            }
        }
    }
}

impl Default for CommandDelay {
    fn default() -> Self {
        CommandDelay::NONE
    }
}
