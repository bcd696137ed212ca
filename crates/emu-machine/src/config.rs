//! Machine-wide configuration.

use emu_core::EmuTime;

/// What to do when a timing violation is detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum TimingPolicy {
    /// Panic. The default in debug builds.
    Strict,
    /// Clamp to the current time, log a warning and count it.
    Clamp,
}

impl Default for TimingPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Strict
        } else {
            Self::Clamp
        }
    }
}

/// Configuration shared by the scheduler, timer pool and bus.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MachineConfig {
    /// Longest slice any device may run before control returns to the
    /// scheduler, even with no timer pending.
    #[cfg_attr(feature = "serde", serde(rename = "quantum_ns", with = "nanos"))]
    pub quantum: EmuTime,
    /// Most timers alive at once (allocated or armed).
    pub max_timers: usize,
    /// Most devices in the tree.
    pub max_devices: usize,
    pub timing_policy: TimingPolicy,
    /// Log every unmapped bus access (they are always counted).
    pub log_unmapped: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            quantum: EmuTime::from_micros(100),
            max_timers: 4096,
            max_devices: 256,
            timing_policy: TimingPolicy::default(),
            log_unmapped: true,
        }
    }
}

impl MachineConfig {
    #[must_use]
    pub fn with_quantum(mut self, quantum: EmuTime) -> Self {
        self.quantum = quantum;
        self
    }

    #[must_use]
    pub fn with_timing_policy(mut self, policy: TimingPolicy) -> Self {
        self.timing_policy = policy;
        self
    }

    #[must_use]
    pub fn with_max_timers(mut self, max_timers: usize) -> Self {
        self.max_timers = max_timers;
        self
    }

    #[must_use]
    pub fn with_max_devices(mut self, max_devices: usize) -> Self {
        self.max_devices = max_devices;
        self
    }

    /// Parse a configuration from JSON. Missing fields keep their defaults.
    #[cfg(feature = "serde")]
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(feature = "serde")]
mod nanos {
    use emu_core::EmuTime;
    use serde::{Deserialize, Deserializer, Serializer};

    const ATTOS_PER_NANO: u128 = 1_000_000_000;

    pub(super) fn serialize<S: Serializer>(time: &EmuTime, s: S) -> Result<S::Ok, S::Error> {
        let nanos = time.as_attoseconds() / ATTOS_PER_NANO;
        s.serialize_u64(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<EmuTime, D::Error> {
        u64::deserialize(d).map(EmuTime::from_nanos)
    }
}
