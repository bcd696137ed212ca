//! Device tree, bus dispatch and scheduler for cycle-accurate emulation.
//!
//! A machine is a tree of [`Device`]s built with a [`MachineBuilder`]. Devices
//! talk to each other only through address spaces (see [`Install`]) and
//! callback lines (see [`Target`]); the [`Machine`] owns all of them and runs
//! them in lock-step against a shared [`TimerQueue`].
//!
//! ```ignore
//! let mut builder = MachineBuilder::default();
//! builder.add_device("soc", Clock::new(21_477_272), Cpu::new())?;
//! builder.add_device("soc:io", Clock::NONE, Vt1682Io::new())?;
//! builder.install(
//!     "soc",
//!     "program",
//!     Install::new(0x210D, 0x210F, Handler::device("soc:io", "regs")),
//! );
//! let mut machine = builder.finalize()?;
//! machine.start()?;
//! machine.run_for(EmuTime::from_millis(16))?;
//! ```

mod builder;
mod config;
mod context;
#[cfg(feature = "serde")]
mod description;
mod device;
mod error;
mod line;
mod machine;
mod scheduler;
mod space;
mod timer;

pub use builder::MachineBuilder;
pub use config::{MachineConfig, TimingPolicy};
pub use context::{Context, SpaceBus};
#[cfg(feature = "serde")]
pub use description::{
    BindingDescription, DeviceDescription, DeviceTypes, InstallDescription, MachineDescription,
    TargetDescription,
};
pub use device::{
    AsAny, Capabilities, Configurator, Device, DeviceId, DeviceState, RegionId, SinkId, SourceId,
    SuspendReason,
};
pub use error::{ConfigError, ConfigErrors, MachineError, ResourceError, TimingViolation};
pub use line::{BitField, Direction, EndpointId, LineSpec, Target};
pub use machine::{AccessStats, Machine, Phase};
pub use space::{Access, Endianness, Handler, Install, MAX_RAM_BYTES, SpaceConfig, SpaceId, Unmap};
pub use timer::{Fired, TimerId, TimerQueue, TimerStart};

pub use emu_core::{AccessWidth, Bus, Clock, EmuTime, Observable, Value};
