//! Error taxonomy.
//!
//! Configuration problems are collected and reported together when the tree
//! is finalized. Resource exhaustion fails only the operation that hit the
//! limit. Timing violations are handled according to [`TimingPolicy`].
//! Runtime access problems (unmapped addresses, floating lines) are not
//! errors at all: they return documented defaults and show up in
//! [`AccessStats`](crate::AccessStats).

use std::fmt;

use emu_core::EmuTime;
use thiserror::Error;

use crate::config::TimingPolicy;
use crate::line::Direction;

/// A single configuration problem found while building or finalizing a tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("duplicate device tag `{tag}`")]
    DuplicateTag { tag: String },

    #[error("invalid device tag `{tag}`")]
    InvalidTag { tag: String },

    #[error("device `{tag}` has no parent `{parent}`")]
    UnknownParent { tag: String, parent: String },

    #[error("no device `{tag}`")]
    UnknownDevice { tag: String },

    #[error("no device type `{kind}` (for `{tag}`)")]
    UnknownDeviceType { tag: String, kind: String },

    #[error("device `{tag}` rejected its parameters: {reason}")]
    InvalidParams { tag: String, reason: String },

    #[error("device `{tag}` declares `{name}` twice")]
    DuplicateDeclaration { tag: String, name: String },

    #[error("device `{tag}` has no line endpoint `{name}`")]
    UnknownEndpoint { tag: String, name: String },

    #[error("device `{tag}` has no {direction} handler `{name}` to bind to")]
    UnknownLineHandler {
        tag: String,
        name: String,
        direction: Direction,
    },

    #[error("required endpoint `{tag}` `{name}` is not bound")]
    UnboundEndpoint { tag: String, name: String },

    #[error("endpoint `{tag}` `{name}` is a {direction} line; the target does not fit")]
    DirectionMismatch {
        tag: String,
        name: String,
        direction: Direction,
    },

    #[error("endpoint `{tag}` `{name}` is a read line and cannot fan out")]
    ReadFanOut { tag: String, name: String },

    #[error("line width {width} of `{tag}` `{name}` is outside 1..=32")]
    LineWidth { tag: String, name: String, width: u8 },

    #[error("bit field shift {shift} on `{tag}` `{name}` is outside 0..32")]
    InvalidField { tag: String, name: String, shift: u8 },

    #[error("device `{tag}` does not implement the {capability} hooks")]
    MissingCapability {
        tag: String,
        capability: &'static str,
    },

    #[error("cannot bind `{tag}` `{name}`: device already started")]
    BindAfterStart { tag: String, name: String },

    #[error("device `{tag}` has no address space `{space}`")]
    UnknownSpace { tag: String, space: String },

    #[error("address space `{space}` must have 1..=48 address bits, got {bits}")]
    AddressBits { space: String, bits: u8 },

    #[error("device `{tag}` has no memory region `{region}`")]
    UnknownRegion { tag: String, region: String },

    #[error("invalid range {start:#X}..={end:#X} in space `{space}`")]
    InvalidRange { space: String, start: u64, end: u64 },

    #[error(
        "{width}-byte handler at {start:#X} in space `{space}` is wider than its {bus}-byte bus"
    )]
    HandlerTooWide {
        space: String,
        start: u64,
        width: u8,
        bus: u8,
    },

    #[error(
        "ROM at {start:#X} in space `{space}` holds {actual} bytes but the range needs {expected}"
    )]
    StorageSize {
        space: String,
        start: u64,
        expected: u64,
        actual: u64,
    },

    #[error(
        "RAM at {start:#X} in space `{space}` needs {length} bytes, over the {limit}-byte limit"
    )]
    StorageTooLarge {
        space: String,
        start: u64,
        length: u64,
        limit: u64,
    },

    #[error(
        "entries {first_start:#X}..={first_end:#X} and {second_start:#X}..={second_end:#X} in space `{space}` overlap at the same explicit priority {priority}"
    )]
    ConflictingPriority {
        space: String,
        priority: i32,
        first_start: u64,
        first_end: u64,
        second_start: u64,
        second_end: u64,
    },
}

/// Every configuration problem found in one finalization pass.
///
/// Never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigErrors(Vec<ConfigError>);

impl ConfigErrors {
    pub(crate) fn from_vec(errors: Vec<ConfigError>) -> Option<Self> {
        (!errors.is_empty()).then_some(Self(errors))
    }

    #[must_use]
    pub fn errors(&self) -> &[ConfigError] {
        &self.0
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConfigError> {
        self.0.iter()
    }
}

impl fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} configuration error(s):", self.0.len())?;
        for error in &self.0 {
            write!(f, "\n  - {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ConfigErrors {}

impl From<ConfigError> for ConfigErrors {
    fn from(error: ConfigError) -> Self {
        Self(vec![error])
    }
}

/// A pool or table is full. Retry after releasing something.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("timer pool exhausted ({capacity} timers live)")]
    TimerPoolExhausted { capacity: usize },

    #[error("device table full ({capacity} devices)")]
    DeviceTableFull { capacity: usize },
}

/// Something tried to look at, or schedule into, the wrong side of "now".
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimingViolation {
    #[error("timer scheduled at {requested}, before the current time {now}")]
    PastDeadline { requested: EmuTime, now: EmuTime },

    #[error(
        "`{observer}` at {observer_time} touched `{target}` whose local time is {target_time}"
    )]
    FutureObserved {
        observer: String,
        target: String,
        observer_time: EmuTime,
        target_time: EmuTime,
    },
}

impl TimingPolicy {
    /// Apply the policy: panic under `Strict`, log under `Clamp`.
    ///
    /// Returns normally only when the caller should clamp and carry on.
    pub(crate) fn enforce(self, violation: &TimingViolation) {
        match self {
            TimingPolicy::Strict => panic!("timing violation: {violation}"),
            TimingPolicy::Clamp => log::warn!("timing violation (clamped): {violation}"),
        }
    }
}

/// Errors from machine lifecycle operations.
#[derive(Debug, Error)]
pub enum MachineError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),

    #[error(transparent)]
    Resource(#[from] ResourceError),

    #[error("machine already started")]
    AlreadyStarted,

    #[error("machine not started")]
    NotStarted,

    #[error("machine has been shut down")]
    Stopped,

    #[error("no device `{0}`")]
    UnknownDevice(String),

    #[error("device `{tag}` failed to start: {source}")]
    Start {
        tag: String,
        source: ResourceError,
    },
}

impl From<ConfigError> for MachineError {
    fn from(error: ConfigError) -> Self {
        Self::Config(error.into())
    }
}
