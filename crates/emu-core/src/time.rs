//! The universal unit of emulated time.
//!
//! Every deadline in the system is an [`EmuTime`]: a whole-seconds count plus
//! an attosecond fraction. One attosecond is 10^-18 s, which is fine enough
//! that the period of any practical crystal is either exact or off by less
//! than one attosecond, and devices clocked at unrelated frequencies can be
//! compared without drift.

use core::fmt;
use core::ops::{Add, AddAssign, Sub, SubAssign};

/// Attoseconds in one second. The fixed denominator of [`EmuTime`].
pub const ATTOSECONDS_PER_SECOND: u64 = 1_000_000_000_000_000_000;

const ATTOS: u128 = ATTOSECONDS_PER_SECOND as u128;

/// A point in (or span of) emulated time.
///
/// Invariant: `attoseconds < ATTOSECONDS_PER_SECOND`. Ordering compares
/// seconds first, then the fraction, so it is a total order.
///
/// [`EmuTime::NEVER`] stands for "no deadline". It is greater than every
/// finite time and absorbs additions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(try_from = "RawEmuTime")
)]
pub struct EmuTime {
    seconds: u64,
    attoseconds: u64,
}

impl EmuTime {
    pub const ZERO: Self = Self {
        seconds: 0,
        attoseconds: 0,
    };

    /// The far future.
    pub const NEVER: Self = Self {
        seconds: u64::MAX,
        attoseconds: ATTOSECONDS_PER_SECOND - 1,
    };

    /// Build a time from parts, carrying excess attoseconds into seconds.
    #[must_use]
    pub const fn new(seconds: u64, attoseconds: u64) -> Self {
        let carry = attoseconds / ATTOSECONDS_PER_SECOND;
        match seconds.checked_add(carry) {
            Some(seconds) => Self {
                seconds,
                attoseconds: attoseconds % ATTOSECONDS_PER_SECOND,
            },
            None => Self::NEVER,
        }
    }

    #[must_use]
    pub const fn from_seconds(seconds: u64) -> Self {
        Self {
            seconds,
            attoseconds: 0,
        }
    }

    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self::new(millis / 1_000, (millis % 1_000) * 1_000_000_000_000_000)
    }

    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self::new(micros / 1_000_000, (micros % 1_000_000) * 1_000_000_000_000)
    }

    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self::new(nanos / 1_000_000_000, (nanos % 1_000_000_000) * 1_000_000_000)
    }

    /// Build a time from a raw attosecond count. Saturates at [`Self::NEVER`].
    #[must_use]
    pub const fn from_attoseconds(attoseconds: u128) -> Self {
        let seconds = attoseconds / ATTOS;
        if seconds > u64::MAX as u128 {
            return Self::NEVER;
        }
        Self {
            seconds: seconds as u64,
            attoseconds: (attoseconds % ATTOS) as u64,
        }
    }

    #[must_use]
    pub const fn seconds(self) -> u64 {
        self.seconds
    }

    /// The sub-second fraction, in attoseconds.
    #[must_use]
    pub const fn attoseconds(self) -> u64 {
        self.attoseconds
    }

    /// Total attoseconds. Exact for every finite value.
    #[must_use]
    pub const fn as_attoseconds(self) -> u128 {
        self.seconds as u128 * ATTOS + self.attoseconds as u128
    }

    #[must_use]
    pub const fn is_never(self) -> bool {
        self.seconds == Self::NEVER.seconds && self.attoseconds == Self::NEVER.attoseconds
    }

    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.seconds == 0 && self.attoseconds == 0
    }

    /// Sum of two times, or `None` if it would pass [`Self::NEVER`].
    #[must_use]
    pub fn checked_add(self, rhs: Self) -> Option<Self> {
        if self.is_never() || rhs.is_never() {
            return None;
        }
        let mut attoseconds = self.attoseconds + rhs.attoseconds;
        let mut seconds = self.seconds.checked_add(rhs.seconds)?;
        if attoseconds >= ATTOSECONDS_PER_SECOND {
            attoseconds -= ATTOSECONDS_PER_SECOND;
            seconds = seconds.checked_add(1)?;
        }
        let sum = Self {
            seconds,
            attoseconds,
        };
        (!sum.is_never()).then_some(sum)
    }

    /// Sum that sticks at [`Self::NEVER`].
    #[must_use]
    pub fn saturating_add(self, rhs: Self) -> Self {
        self.checked_add(rhs).unwrap_or(Self::NEVER)
    }

    /// Difference, or `None` if `rhs` is later than `self`.
    #[must_use]
    pub fn checked_sub(self, rhs: Self) -> Option<Self> {
        if self < rhs {
            return None;
        }
        if self.is_never() {
            return Some(Self::NEVER);
        }
        let (seconds, attoseconds) = if self.attoseconds >= rhs.attoseconds {
            (self.seconds - rhs.seconds, self.attoseconds - rhs.attoseconds)
        } else {
            (
                self.seconds - rhs.seconds - 1,
                self.attoseconds + ATTOSECONDS_PER_SECOND - rhs.attoseconds,
            )
        };
        Some(Self {
            seconds,
            attoseconds,
        })
    }

    /// Difference clamped at zero.
    #[must_use]
    pub fn saturating_sub(self, rhs: Self) -> Self {
        self.checked_sub(rhs).unwrap_or(Self::ZERO)
    }

    /// Multiply by an integer factor. Saturates at [`Self::NEVER`].
    #[must_use]
    pub fn scaled(self, factor: u64) -> Self {
        if self.is_never() {
            return Self::NEVER;
        }
        self.as_attoseconds()
            .checked_mul(u128::from(factor))
            .map_or(Self::NEVER, Self::from_attoseconds)
    }

    /// Divide by an integer, truncating. Dividing by zero yields [`Self::NEVER`].
    #[must_use]
    pub fn divided(self, divisor: u64) -> Self {
        if divisor == 0 || self.is_never() {
            return Self::NEVER;
        }
        Self::from_attoseconds(self.as_attoseconds() / u128::from(divisor))
    }

    /// Scale by the rational `num / den`, truncating.
    ///
    /// Used to move a span between clock domains (e.g. a CPU running at
    /// crystal / 12). Saturates at [`Self::NEVER`] on overflow or `den == 0`.
    #[must_use]
    pub fn mul_ratio(self, num: u64, den: u64) -> Self {
        if den == 0 || self.is_never() {
            return Self::NEVER;
        }
        let attos = self.as_attoseconds();
        let (num, den) = (u128::from(num), u128::from(den));
        match attos.checked_mul(num) {
            Some(product) => Self::from_attoseconds(product / den),
            // Split into whole and remainder parts so the product stays in range.
            None => {
                let whole = (attos / den).checked_mul(num);
                let rem = (attos % den).checked_mul(num).map(|r| r / den);
                match (whole, rem) {
                    (Some(whole), Some(rem)) => whole
                        .checked_add(rem)
                        .map_or(Self::NEVER, Self::from_attoseconds),
                    _ => Self::NEVER,
                }
            }
        }
    }

    /// Time taken by `cycles` cycles of a clock running at `hz`.
    ///
    /// Rounds up to the next attosecond, which makes
    /// `from_cycles(n, hz).to_cycles(hz) == n` hold for every
    /// `hz <= ATTOSECONDS_PER_SECOND`. A stopped clock (`hz == 0`) never
    /// completes a cycle.
    #[must_use]
    pub fn from_cycles(cycles: u64, hz: u64) -> Self {
        if hz == 0 {
            return if cycles == 0 { Self::ZERO } else { Self::NEVER };
        }
        let hz = u128::from(hz);
        let numerator = u128::from(cycles) * ATTOS;
        Self::from_attoseconds(numerator.div_ceil(hz))
    }

    /// Whole cycles of a clock at `hz` that fit in this span. Truncates.
    #[must_use]
    pub fn to_cycles(self, hz: u64) -> u64 {
        if self.is_never() {
            return u64::MAX;
        }
        let hz = u128::from(hz);
        let whole = u128::from(self.seconds) * hz;
        let frac = u128::from(self.attoseconds) * hz / ATTOS;
        u64::try_from(whole + frac).unwrap_or(u64::MAX)
    }

    /// Convert to floating-point seconds. Lossy; for display only.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_secs_f64(self) -> f64 {
        self.seconds as f64 + self.attoseconds as f64 / ATTOSECONDS_PER_SECOND as f64
    }
}

impl Add for EmuTime {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        self.saturating_add(rhs)
    }
}

impl AddAssign for EmuTime {
    fn add_assign(&mut self, rhs: Self) {
        *self = self.saturating_add(rhs);
    }
}

impl Sub for EmuTime {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        self.saturating_sub(rhs)
    }
}

impl SubAssign for EmuTime {
    fn sub_assign(&mut self, rhs: Self) {
        *self = self.saturating_sub(rhs);
    }
}

impl fmt::Display for EmuTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_never() {
            return write!(f, "never");
        }
        write!(f, "{}.{:018}s", self.seconds, self.attoseconds)
    }
}

#[cfg(feature = "serde")]
#[derive(serde::Deserialize)]
struct RawEmuTime {
    seconds: u64,
    attoseconds: u64,
}

#[cfg(feature = "serde")]
impl TryFrom<RawEmuTime> for EmuTime {
    type Error = String;

    fn try_from(raw: RawEmuTime) -> Result<Self, Self::Error> {
        if raw.attoseconds >= ATTOSECONDS_PER_SECOND {
            return Err(format!(
                "attoseconds {} out of range (must be below {ATTOSECONDS_PER_SECOND})",
                raw.attoseconds
            ));
        }
        Ok(Self {
            seconds: raw.seconds,
            attoseconds: raw.attoseconds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn carry_into_seconds() {
        let t = EmuTime::new(1, ATTOSECONDS_PER_SECOND + 5);
        assert_eq!(t.seconds(), 2);
        assert_eq!(t.attoseconds(), 5);

        let sum = EmuTime::from_millis(600) + EmuTime::from_millis(700);
        assert_eq!(sum, EmuTime::from_millis(1_300));
        assert_eq!(sum.seconds(), 1);
    }

    #[test]
    fn subtraction_borrows() {
        let a = EmuTime::new(2, 100);
        let b = EmuTime::new(1, 200);
        let d = a - b;
        assert_eq!(d.seconds(), 0);
        assert_eq!(d.attoseconds(), ATTOSECONDS_PER_SECOND - 100);
        assert_eq!(b.checked_sub(a), None);
        assert_eq!(b - a, EmuTime::ZERO);
    }

    #[test]
    fn never_is_absorbing() {
        assert_eq!(EmuTime::NEVER + EmuTime::from_seconds(1), EmuTime::NEVER);
        assert!(EmuTime::from_seconds(u64::MAX) < EmuTime::NEVER);
        assert_eq!(EmuTime::NEVER.checked_add(EmuTime::ZERO), None);
        assert_eq!(EmuTime::NEVER.to_string(), "never");
    }

    #[test]
    fn unit_constructors_agree() {
        assert_eq!(EmuTime::from_micros(1_500), EmuTime::from_nanos(1_500_000));
        assert_eq!(EmuTime::from_millis(2), EmuTime::from_micros(2_000));
        assert_eq!(EmuTime::from_seconds(3), EmuTime::from_millis(3_000));
    }

    #[test]
    fn nes_cpu_cycle_round_trip() {
        // 1,789,773 Hz does not divide 10^18; the period is rounded up.
        let hz = 1_789_773;
        let one = EmuTime::from_cycles(1, hz);
        assert_eq!(one.to_cycles(hz), 1);
        assert_eq!(EmuTime::from_cycles(29_781, hz).to_cycles(hz), 29_781);
        assert_eq!(EmuTime::from_seconds(1).to_cycles(hz), hz);
    }

    #[test]
    fn exact_divisor_period_is_exact() {
        let t = EmuTime::from_cycles(3, 1_000_000);
        assert_eq!(t, EmuTime::from_micros(3));
    }

    #[test]
    fn stopped_clock_never_completes() {
        assert_eq!(EmuTime::from_cycles(1, 0), EmuTime::NEVER);
        assert_eq!(EmuTime::from_cycles(0, 0), EmuTime::ZERO);
        assert_eq!(EmuTime::from_seconds(5).to_cycles(0), 0);
    }

    #[test]
    fn ratio_scaling() {
        let crystal = EmuTime::from_nanos(120);
        assert_eq!(crystal.mul_ratio(1, 12), EmuTime::from_nanos(10));
        assert_eq!(crystal.mul_ratio(3, 2), EmuTime::from_nanos(180));
        assert_eq!(crystal.mul_ratio(1, 0), EmuTime::NEVER);
        assert_eq!(EmuTime::from_seconds(7).scaled(3), EmuTime::from_seconds(21));
        assert_eq!(EmuTime::from_seconds(7).divided(7), EmuTime::from_seconds(1));
    }

    #[test]
    fn display_shows_full_fraction() {
        assert_eq!(
            EmuTime::from_millis(1_500).to_string(),
            "1.500000000000000000s"
        );
    }

    #[cfg(feature = "serde")]
    #[test]
    fn deserialize_rejects_unnormalised_fraction() {
        let ok: EmuTime = serde_json::from_str(r#"{"seconds":1,"attoseconds":5}"#).unwrap();
        assert_eq!(ok, EmuTime::new(1, 5));
        let bad = serde_json::from_str::<EmuTime>(
            r#"{"seconds":1,"attoseconds":1000000000000000000}"#,
        );
        assert!(bad.is_err());
    }

    proptest! {
        #[test]
        fn cycle_round_trip(
            cycles in 0u64..1_000_000_000_000,
            hz in 1u64..=ATTOSECONDS_PER_SECOND,
        ) {
            prop_assert_eq!(EmuTime::from_cycles(cycles, hz).to_cycles(hz), cycles);
        }

        #[test]
        fn add_then_sub_is_identity(a in 0u128..(1u128 << 90), b in 0u128..(1u128 << 90)) {
            let (a, b) = (EmuTime::from_attoseconds(a), EmuTime::from_attoseconds(b));
            prop_assert_eq!((a + b) - b, a);
            prop_assert!(a + b >= a);
        }

        #[test]
        fn order_matches_attoseconds(a in any::<u64>(), b in any::<u64>()) {
            let ta = EmuTime::from_attoseconds(u128::from(a) * 977);
            let tb = EmuTime::from_attoseconds(u128::from(b) * 977);
            prop_assert_eq!(ta.cmp(&tb), (u128::from(a)).cmp(&u128::from(b)));
        }
    }
}
