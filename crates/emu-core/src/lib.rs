//! Core types for cycle-accurate emulation.
//!
//! All timing is expressed as [`EmuTime`], an attosecond-resolution
//! timestamp. Device clocks convert between cycles and `EmuTime`; nothing
//! else in the system counts time.

mod bus;
mod clock;
mod observable;
mod ticks;
mod time;

pub use bus::{AccessWidth, Bus};
pub use clock::Clock;
pub use observable::{Observable, Value};
pub use ticks::Ticks;
pub use time::{ATTOSECONDS_PER_SECOND, EmuTime};
