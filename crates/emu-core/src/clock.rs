//! Per-device clock configuration.

use crate::{EmuTime, Ticks};

/// The clock driving one device.
///
/// Each device in a machine has its own clock, often a division of a shared
/// crystal. The scheduler never counts cycles itself: it hands devices spans
/// of [`EmuTime`] and the clock converts them into whole cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct Clock {
    /// Frequency in Hz (e.g. `21_477_272` for an NTSC NES crystal).
    /// Zero means the clock is stopped.
    pub frequency_hz: u64,
}

impl Clock {
    /// A stopped clock, for devices that only react to accesses and timers.
    pub const NONE: Self = Self { frequency_hz: 0 };

    #[must_use]
    pub const fn new(frequency_hz: u64) -> Self {
        Self { frequency_hz }
    }

    #[must_use]
    pub const fn is_stopped(&self) -> bool {
        self.frequency_hz == 0
    }

    /// This clock divided down, the way on-chip dividers derive CPU and video
    /// clocks from the crystal. A zero divisor stops the clock.
    #[must_use]
    pub const fn divided(&self, divisor: u64) -> Self {
        match self.frequency_hz.checked_div(divisor) {
            Some(frequency_hz) => Self { frequency_hz },
            None => Self::NONE,
        }
    }

    /// Length of one cycle. [`EmuTime::NEVER`] for a stopped clock.
    #[must_use]
    pub fn period(&self) -> EmuTime {
        EmuTime::from_cycles(1, self.frequency_hz)
    }

    /// Time taken by `ticks` cycles.
    #[must_use]
    pub fn time_of(&self, ticks: Ticks) -> EmuTime {
        EmuTime::from_cycles(ticks.get(), self.frequency_hz)
    }

    /// Whole cycles that fit in `span`.
    #[must_use]
    pub fn cycles_in(&self, span: EmuTime) -> Ticks {
        Ticks::new(span.to_cycles(self.frequency_hz))
    }

    /// Cycles per frame at the given frame rate (integer division).
    #[must_use]
    pub const fn ticks_per_frame(&self, frames_per_second: u64) -> Ticks {
        match self.frequency_hz.checked_div(frames_per_second) {
            Some(count) => Ticks::new(count),
            None => Ticks::ZERO,
        }
    }
}
