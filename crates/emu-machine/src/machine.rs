//! A finalized device tree and its lifecycle.

use emu_core::{AccessWidth, EmuTime, Observable, Value};

use crate::config::MachineConfig;
use crate::context::Origin;
use crate::device::{Capabilities, Device, DeviceId, DeviceState, DeviceTable, SuspendReason};
use crate::error::{ConfigError, MachineError};
use crate::line::{BindRequest, BitField, Direction, LineTable, Target};
use crate::space::{AddressSpace, SpaceId, find_space};
use crate::timer::TimerQueue;

/// Lifecycle phase of a [`Machine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Finalized; bindings can still be added.
    Configured,
    Started,
    Stopped,
}

/// Runtime access warnings. None of these stop emulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AccessStats {
    pub unmapped_reads: u64,
    pub unmapped_writes: u64,
    /// Reads of unbound read endpoints.
    pub floating_reads: u64,
    /// Accesses that would have re-entered a device already in a hook.
    pub reentrant_accesses: u64,
    /// Violations clamped under [`TimingPolicy::Clamp`](crate::TimingPolicy::Clamp).
    pub timing_violations: u64,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct StateRequest {
    pub(crate) device: DeviceId,
    pub(crate) reason: SuspendReason,
    pub(crate) suspend: bool,
}

/// Scheduler bookkeeping for the slice in progress.
#[derive(Debug, Default)]
pub(crate) struct SliceState {
    pub(crate) executing: bool,
    pub(crate) target: EmuTime,
    pub(crate) resync_at: Option<EmuTime>,
    pub(crate) requests: Vec<StateRequest>,
}

impl SliceState {
    /// How far devices may run: the slice target, cut short by any pending
    /// resynchronization.
    pub(crate) fn bound(&self) -> EmuTime {
        self.resync_at.map_or(self.target, |at| at.min(self.target))
    }

    /// Request a resynchronization at `at` while a slice is running.
    pub(crate) fn cut_at(&mut self, at: EmuTime) {
        if self.executing {
            self.resync_at = Some(self.resync_at.map_or(at, |r| r.min(at)));
        }
    }
}

/// A finalized device tree: devices, bindings, address spaces, timers and
/// the scheduler state that drives them.
pub struct Machine {
    pub(crate) config: MachineConfig,
    pub(crate) devices: DeviceTable,
    /// Pre-order: parents before children, siblings in declaration order.
    pub(crate) order: Vec<DeviceId>,
    pub(crate) lines: LineTable,
    pub(crate) spaces: Vec<AddressSpace>,
    pub(crate) timers: TimerQueue,
    pub(crate) global: EmuTime,
    pub(crate) phase: Phase,
    pub(crate) stats: AccessStats,
    pub(crate) slice: SliceState,
}

impl Machine {
    pub(crate) fn new(
        config: MachineConfig,
        devices: DeviceTable,
        lines: LineTable,
        spaces: Vec<AddressSpace>,
    ) -> Self {
        let order = devices.pre_order();
        let timers = TimerQueue::new(config.max_timers, config.timing_policy);
        Self {
            config,
            devices,
            order,
            lines,
            spaces,
            timers,
            global: EmuTime::ZERO,
            phase: Phase::Configured,
            stats: AccessStats::default(),
            slice: SliceState::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Global time: every device has run at least this far.
    #[must_use]
    pub fn now(&self) -> EmuTime {
        self.global
    }

    #[must_use]
    pub fn stats(&self) -> AccessStats {
        AccessStats {
            timing_violations: self.stats.timing_violations + self.timers.violations(),
            ..self.stats
        }
    }

    /// Earliest pending timer, or [`EmuTime::NEVER`].
    #[must_use]
    pub fn next_deadline(&self) -> EmuTime {
        self.timers.next_deadline()
    }

    // Lifecycle

    /// Start every device once, parents first, then apply a power-on reset.
    pub fn start(&mut self) -> Result<(), MachineError> {
        match self.phase {
            Phase::Configured => {}
            Phase::Started => return Err(MachineError::AlreadyStarted),
            Phase::Stopped => return Err(MachineError::Stopped),
        }
        log::info!("starting machine with {} devices", self.order.len());
        let order = self.order.clone();
        for &id in &order {
            if !self.has(id, Capabilities::START) {
                continue;
            }
            let now = self.global;
            if let Some(Err(source)) = self.call_device(id, now, false, |dev, ctx| dev.start(ctx)) {
                let tag = self.devices.tag(id).to_owned();
                log::error!("`{tag}` failed to start: {source}");
                for slot in self.devices.iter_mut() {
                    slot.state = DeviceState::Stopped;
                }
                self.timers.clear();
                self.phase = Phase::Stopped;
                return Err(MachineError::Start { tag, source });
            }
        }
        let global = self.global;
        for slot in self.devices.iter_mut() {
            slot.state = if slot.suspend.is_empty() {
                DeviceState::Running
            } else {
                DeviceState::Suspended
            };
            slot.local = global;
        }
        self.phase = Phase::Started;
        self.apply_requests();
        self.reset_devices(&order);
        Ok(())
    }

    /// Reset every device, parents first. Bindings, maps and timers are
    /// kept; devices re-arm what they need in their reset hooks.
    pub fn reset(&mut self) -> Result<(), MachineError> {
        self.ensure_started()?;
        log::info!("resetting machine at {}", self.global);
        let order = self.order.clone();
        self.reset_devices(&order);
        Ok(())
    }

    /// Reset one device and everything below it.
    pub fn reset_device(&mut self, tag: &str) -> Result<(), MachineError> {
        self.ensure_started()?;
        let id = self.require(tag)?;
        log::debug!("resetting `{tag}` at {}", self.global);
        let subtree = self.devices.subtree(id);
        self.reset_devices(&subtree);
        Ok(())
    }

    fn reset_devices(&mut self, ids: &[DeviceId]) {
        for &id in ids {
            if self.has(id, Capabilities::RESET) {
                let now = self.global;
                self.call_device(id, now, false, |dev, ctx| dev.reset(ctx));
            }
        }
    }

    /// Stop every device, children first, and drop all timers.
    pub fn shutdown(&mut self) {
        if self.phase == Phase::Stopped {
            return;
        }
        if self.phase == Phase::Started {
            log::info!("shutting down machine at {}", self.global);
            let order = self.order.clone();
            for &id in order.iter().rev() {
                if self.has(id, Capabilities::STOP) {
                    let now = self.global;
                    self.call_device(id, now, false, |dev, ctx| dev.stop(ctx));
                }
            }
        }
        for slot in self.devices.iter_mut() {
            slot.state = DeviceState::Stopped;
        }
        self.timers.clear();
        self.slice.requests.clear();
        self.phase = Phase::Stopped;
    }

    pub(crate) fn ensure_started(&self) -> Result<(), MachineError> {
        match self.phase {
            Phase::Started => Ok(()),
            Phase::Configured => Err(MachineError::NotStarted),
            Phase::Stopped => Err(MachineError::Stopped),
        }
    }

    fn has(&self, id: DeviceId, caps: Capabilities) -> bool {
        self.devices.get(id).is_some_and(|slot| slot.caps.contains(caps))
    }

    fn require(&self, tag: &str) -> Result<DeviceId, MachineError> {
        self.devices
            .lookup(tag)
            .ok_or_else(|| MachineError::UnknownDevice(tag.to_owned()))
    }

    // Lookup

    #[must_use]
    pub fn device_id(&self, tag: &str) -> Option<DeviceId> {
        self.devices.lookup(tag)
    }

    #[must_use]
    pub fn tag(&self, id: DeviceId) -> Option<&str> {
        self.devices.get(id).map(|slot| slot.tag.as_str())
    }

    /// Device tags in pre-order.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|&id| self.devices.tag(id))
    }

    /// Borrow a device as its concrete type.
    #[must_use]
    pub fn device<T: Device + 'static>(&self, tag: &str) -> Option<&T> {
        let id = self.devices.lookup(tag)?;
        self.devices
            .get(id)?
            .device
            .as_deref()?
            .as_any()
            .downcast_ref::<T>()
    }

    #[must_use]
    pub fn device_mut<T: Device + 'static>(&mut self, tag: &str) -> Option<&mut T> {
        let id = self.devices.lookup(tag)?;
        self.devices
            .get_mut(id)?
            .device
            .as_deref_mut()?
            .as_any_mut()
            .downcast_mut::<T>()
    }

    #[must_use]
    pub fn state(&self, tag: &str) -> Option<DeviceState> {
        let id = self.devices.lookup(tag)?;
        self.devices.get(id).map(|slot| slot.state)
    }

    /// How far a device has run.
    #[must_use]
    pub fn local_time(&self, tag: &str) -> Option<EmuTime> {
        let id = self.devices.lookup(tag)?;
        self.devices.get(id).map(|slot| slot.local)
    }

    /// Inspect a device without affecting it.
    #[must_use]
    pub fn query(&self, tag: &str, path: &str) -> Option<Value> {
        let id = self.devices.lookup(tag)?;
        self.devices.get(id)?.device.as_deref()?.query(path)
    }

    // Bus access from the host

    #[must_use]
    pub fn space_id(&self, owner: &str, name: &str) -> Option<SpaceId> {
        find_space(&self.spaces, &self.devices, owner, name)
    }

    pub fn read(&mut self, space: SpaceId, address: u64, width: AccessWidth) -> u64 {
        let origin = Origin::host(self.global);
        self.space_read(origin, space, address, width)
    }

    pub fn write(&mut self, space: SpaceId, address: u64, width: AccessWidth, value: u64) {
        let origin = Origin::host(self.global);
        self.space_write(origin, space, address, width, value, width.mask());
    }

    pub fn write_masked(
        &mut self,
        space: SpaceId,
        address: u64,
        width: AccessWidth,
        value: u64,
        mask: u64,
    ) {
        let origin = Origin::host(self.global);
        self.space_write(origin, space, address, width, value, mask);
    }

    pub fn read_u8(&mut self, space: SpaceId, address: u64) -> u8 {
        self.read(space, address, AccessWidth::Byte) as u8
    }

    pub fn write_u8(&mut self, space: SpaceId, address: u64, value: u8) {
        self.write(space, address, AccessWidth::Byte, u64::from(value));
    }

    // Lines from the host

    /// Bind an endpoint. Only allowed until the machine starts.
    pub fn bind(&mut self, tag: &str, endpoint: &str, target: Target) -> Result<(), ConfigError> {
        self.bind_request(tag, endpoint, target, BitField::FULL, false)
    }

    pub fn bind_field(
        &mut self,
        tag: &str,
        endpoint: &str,
        target: Target,
        field: BitField,
    ) -> Result<(), ConfigError> {
        self.bind_request(tag, endpoint, target, field, false)
    }

    /// Add another sink to a write endpoint.
    pub fn append(&mut self, tag: &str, endpoint: &str, target: Target) -> Result<(), ConfigError> {
        self.bind_request(tag, endpoint, target, BitField::FULL, true)
    }

    fn bind_request(
        &mut self,
        tag: &str,
        endpoint: &str,
        target: Target,
        field: BitField,
        append: bool,
    ) -> Result<(), ConfigError> {
        if self.phase != Phase::Configured {
            return Err(ConfigError::BindAfterStart {
                tag: tag.to_owned(),
                name: endpoint.to_owned(),
            });
        }
        self.lines.resolve(
            &self.devices,
            BindRequest {
                tag: tag.to_owned(),
                endpoint: endpoint.to_owned(),
                target,
                field,
                append,
            },
        )
    }

    /// Drive one of a device's sinks directly, as if a line bound to it
    /// were written.
    pub fn set_sink(&mut self, tag: &str, sink: &str, value: u32) -> Result<(), MachineError> {
        self.ensure_started()?;
        let id = self.require(tag)?;
        let slot = self
            .devices
            .get(id)
            .ok_or_else(|| MachineError::UnknownDevice(tag.to_owned()))?;
        let sink = slot
            .decl
            .sink(sink)
            .ok_or_else(|| ConfigError::UnknownLineHandler {
                tag: tag.to_owned(),
                name: sink.to_owned(),
                direction: Direction::Write,
            })?;
        if !slot.caps.contains(Capabilities::LINES) {
            return Err(ConfigError::MissingCapability {
                tag: tag.to_owned(),
                capability: "line",
            }
            .into());
        }
        let now = self.global;
        self.call_device(id, now, false, |dev, ctx| dev.sink_write(ctx, sink, value));
        Ok(())
    }
}

const QUERY_PATHS: &[&str] = &[
    "time",
    "phase",
    "devices",
    "timers.live",
    "timers.next",
    "stats.unmapped_reads",
    "stats.unmapped_writes",
    "stats.floating_reads",
    "stats.reentrant_accesses",
    "stats.timing_violations",
];

impl Observable for Machine {
    fn query(&self, path: &str) -> Option<Value> {
        let stats = self.stats();
        match path {
            "time" => Some(Value::Time(self.global)),
            "phase" => Some(Value::from(match self.phase {
                Phase::Configured => "configured",
                Phase::Started => "started",
                Phase::Stopped => "stopped",
            })),
            "devices" => Some(Value::Array(self.tags().map(Value::from).collect())),
            "timers.live" => Some(Value::U64(self.timers.live() as u64)),
            "timers.next" => Some(Value::Time(self.timers.next_deadline())),
            "stats.unmapped_reads" => Some(Value::U64(stats.unmapped_reads)),
            "stats.unmapped_writes" => Some(Value::U64(stats.unmapped_writes)),
            "stats.floating_reads" => Some(Value::U64(stats.floating_reads)),
            "stats.reentrant_accesses" => Some(Value::U64(stats.reentrant_accesses)),
            "stats.timing_violations" => Some(Value::U64(stats.timing_violations)),
            _ => None,
        }
    }

    fn query_paths(&self) -> &'static [&'static str] {
        QUERY_PATHS
    }
}
