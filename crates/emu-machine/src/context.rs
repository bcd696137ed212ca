//! What a device sees while one of its hooks runs, and the dispatch paths
//! behind it.
//!
//! The machine owns every device. While a hook runs, that device is taken
//! out of its slot and the hook gets a [`Context`] borrowing the rest of the
//! machine. An access that would call back into a device whose hook is
//! already on the stack finds the slot empty; it is counted and answered
//! with the unmap value.

use emu_core::{AccessWidth, Bus, Clock, EmuTime, Ticks};

use crate::device::{Device, DeviceId, RegionId, SourceId, SuspendReason};
use crate::error::{ResourceError, TimingViolation};
use crate::line::{BitField, Direction, EndpointId, Route};
use crate::machine::Machine;
use crate::space::{Endianness, EntryKind, Side, SpaceId};
use crate::timer::{TimerId, TimerStart};

/// Who is performing an access, and at what time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Origin {
    pub(crate) device: Option<DeviceId>,
    pub(crate) now: EmuTime,
}

impl Origin {
    pub(crate) fn host(now: EmuTime) -> Self {
        Self { device: None, now }
    }
}

/// Handle passed to every [`Device`] hook.
pub struct Context<'m> {
    machine: &'m mut Machine,
    device: DeviceId,
    now: EmuTime,
    executing: bool,
}

impl<'m> Context<'m> {
    pub(crate) fn new(
        machine: &'m mut Machine,
        device: DeviceId,
        now: EmuTime,
        executing: bool,
    ) -> Self {
        Self {
            machine,
            device,
            now,
            executing,
        }
    }

    fn origin(&self) -> Origin {
        Origin {
            device: Some(self.device),
            now: self.now,
        }
    }

    #[must_use]
    pub fn device_id(&self) -> DeviceId {
        self.device
    }

    #[must_use]
    pub fn tag(&self) -> &str {
        self.machine.devices.tag(self.device)
    }

    /// This device's current time. Inside `execute` it moves with
    /// [`elapse`](Self::elapse); elsewhere it is the time of the event
    /// being handled.
    #[must_use]
    pub fn now(&self) -> EmuTime {
        self.now
    }

    /// Time the scheduler has committed to. Never ahead of `now` while
    /// executing.
    #[must_use]
    pub fn global_time(&self) -> EmuTime {
        self.machine.global
    }

    #[must_use]
    pub fn clock(&self) -> Clock {
        self.machine
            .devices
            .get(self.device)
            .map_or(Clock::NONE, |slot| slot.clock)
    }

    /// Consume time.
    pub fn elapse(&mut self, span: EmuTime) {
        self.now = self.now.saturating_add(span);
    }

    /// Consume whole cycles of this device's clock.
    pub fn elapse_cycles(&mut self, cycles: u64) {
        let clock = self.clock();
        if clock.is_stopped() {
            log::debug!("`{}` elapsed cycles on a stopped clock", self.tag());
            return;
        }
        self.elapse(clock.time_of(Ticks::new(cycles)));
    }

    /// Time left in the current slice. Zero outside `execute`.
    #[must_use]
    pub fn remaining(&self) -> EmuTime {
        if !self.executing {
            return EmuTime::ZERO;
        }
        self.machine.slice.bound().saturating_sub(self.now)
    }

    #[must_use]
    pub fn remaining_cycles(&self) -> Ticks {
        self.clock().cycles_in(self.remaining())
    }

    /// True once a resynchronization has been requested at or before this
    /// device's current time. An executing device should return promptly.
    #[must_use]
    pub fn yield_requested(&self) -> bool {
        self.machine.slice.executing
            && self.machine.slice.resync_at.is_some_and(|at| at <= self.now)
    }

    // Bus

    pub fn read(&mut self, space: SpaceId, address: u64, width: AccessWidth) -> u64 {
        let origin = self.origin();
        self.machine.space_read(origin, space, address, width)
    }

    pub fn write(&mut self, space: SpaceId, address: u64, width: AccessWidth, value: u64) {
        let origin = self.origin();
        self.machine
            .space_write(origin, space, address, width, value, width.mask());
    }

    /// Write only the byte lanes selected by `mask`.
    pub fn write_masked(
        &mut self,
        space: SpaceId,
        address: u64,
        width: AccessWidth,
        value: u64,
        mask: u64,
    ) {
        let origin = self.origin();
        self.machine.space_write(origin, space, address, width, value, mask);
    }

    /// A [`Bus`] view of one space, for code written against the plain bus
    /// trait.
    pub fn bus(&mut self, space: SpaceId) -> SpaceBus<'_, 'm> {
        SpaceBus { ctx: self, space }
    }

    // Lines

    /// Sample one of this device's read endpoints. Another device's
    /// endpoint reads as its floating value.
    pub fn read_line(&mut self, endpoint: EndpointId) -> u32 {
        if let Some(floating) = self.foreign(endpoint) {
            return floating;
        }
        let origin = self.origin();
        self.machine.line_read(origin, endpoint)
    }

    /// Drive one of this device's write endpoints. Writes to another
    /// device's endpoint are dropped.
    pub fn write_line(&mut self, endpoint: EndpointId, value: u32) {
        if self.foreign(endpoint).is_some() {
            return;
        }
        let origin = self.origin();
        self.machine.line_write(origin, endpoint, value);
    }

    /// The floating value of `endpoint` if some other device owns it.
    fn foreign(&self, endpoint: EndpointId) -> Option<u32> {
        let ep = self.machine.lines.get(endpoint)?;
        if ep.owner == self.device {
            return None;
        }
        log::warn!(
            "`{}` used `{}` `{}`, which it does not own; ignored",
            self.tag(),
            self.machine.devices.tag(ep.owner),
            ep.spec.name
        );
        Some(ep.spec.floating_value())
    }

    // Timers

    /// A disarmed timer owned by this device, delivered to
    /// [`Device::timer_fired`] with `key`.
    pub fn timer_alloc(&mut self, key: u32) -> Result<TimerId, ResourceError> {
        self.machine.timers.alloc(self.device, key)
    }

    /// (Re)arm a timer `delay` from now. `period == ZERO` is one-shot.
    pub fn timer_adjust(&mut self, id: TimerId, delay: EmuTime, period: EmuTime) -> bool {
        self.timer_program(id, TimerStart::After(delay), period, 0)
    }

    pub fn timer_program(
        &mut self,
        id: TimerId,
        start: TimerStart,
        period: EmuTime,
        param: u64,
    ) -> bool {
        let start = self.absolute(start);
        let armed = self.machine.timers.adjust(id, start, period, param);
        self.shorten_slice_for(id);
        armed
    }

    /// Allocate and arm an anonymous timer. One-shots free themselves.
    pub fn timer_schedule(
        &mut self,
        start: TimerStart,
        period: EmuTime,
        key: u32,
        param: u64,
    ) -> Result<TimerId, ResourceError> {
        let start = self.absolute(start);
        let id = self
            .machine
            .timers
            .schedule(self.device, start, period, key, param)?;
        self.shorten_slice_for(id);
        Ok(id)
    }

    pub fn timer_cancel(&mut self, id: TimerId) -> bool {
        self.machine.timers.cancel(id)
    }

    /// Time until the timer fires, or [`EmuTime::NEVER`] if disarmed.
    #[must_use]
    pub fn timer_remaining(&self, id: TimerId) -> EmuTime {
        self.machine
            .timers
            .expiry(id)
            .map_or(EmuTime::NEVER, |at| at.saturating_sub(self.now))
    }

    pub fn timer_free(&mut self, id: TimerId) {
        self.machine.timers.free(id);
    }

    /// A timer armed inside the running slice ends the slice at its expiry,
    /// so no device runs past it before it fires.
    fn shorten_slice_for(&mut self, id: TimerId) {
        let Some(at) = self.machine.timers.expiry(id) else {
            return;
        };
        if at < self.machine.slice.bound() {
            self.machine.slice.cut_at(at);
        }
    }

    fn absolute(&self, start: TimerStart) -> TimerStart {
        match start {
            TimerStart::After(delay) => TimerStart::At(self.now.saturating_add(delay)),
            at @ TimerStart::At(_) => at,
        }
    }

    // Scheduling

    /// Request a resynchronization at this device's current time.
    ///
    /// Every device catches up to `now`, then this device's
    /// [`Device::timer_fired`] runs with `key` and `param`. Inside an
    /// execute slice the slice is cut short at `now`.
    pub fn synchronize(&mut self, key: u32, param: u64) -> Result<(), ResourceError> {
        self.machine.timers.schedule(
            self.device,
            TimerStart::At(self.now),
            EmuTime::ZERO,
            key,
            param,
        )?;
        self.machine.slice.cut_at(self.now);
        Ok(())
    }

    /// Suspend a device from the next slice boundary.
    pub fn suspend(&mut self, device: DeviceId, reason: SuspendReason) {
        self.machine.request_state(device, reason, true);
    }

    pub fn resume(&mut self, device: DeviceId, reason: SuspendReason) {
        self.machine.request_state(device, reason, false);
    }

    #[must_use]
    pub fn lookup(&self, tag: &str) -> Option<DeviceId> {
        self.machine.devices.lookup(tag)
    }

    /// An address space declared by `owner`.
    #[must_use]
    pub fn space(&self, owner: &str, name: &str) -> Option<SpaceId> {
        self.machine.space_id(owner, name)
    }
}

/// One address space seen through the [`Bus`] trait.
pub struct SpaceBus<'a, 'm> {
    ctx: &'a mut Context<'m>,
    space: SpaceId,
}

impl Bus for SpaceBus<'_, '_> {
    fn read(&mut self, address: u64, width: AccessWidth) -> u64 {
        self.ctx.read(self.space, address, width)
    }

    fn write(&mut self, address: u64, width: AccessWidth, value: u64) {
        self.ctx.write(self.space, address, width, value);
    }
}

enum ReadAction {
    Value(u64),
    Unmapped,
    Split,
    Device(DeviceId, RegionId, u64),
}

enum WriteAction {
    Done,
    Unmapped,
    Split,
    RomDrop,
    Device(DeviceId, RegionId, u64),
}

#[derive(Clone, Copy)]
enum WriteTarget {
    Device(DeviceId, RegionId),
    Storage,
    Unmapped,
    Nop,
}

enum Pull {
    Value(u32),
    Floating(u32),
    Source(DeviceId, SourceId, u32),
}

impl Machine {
    /// Run one hook of one device. `None` if the device is already busy.
    pub(crate) fn call_device<R>(
        &mut self,
        id: DeviceId,
        now: EmuTime,
        executing: bool,
        f: impl FnOnce(&mut dyn Device, &mut Context<'_>) -> R,
    ) -> Option<R> {
        let slot = self.devices.get_mut(id)?;
        let Some(mut device) = slot.device.take() else {
            self.stats.reentrant_accesses += 1;
            log::warn!("re-entrant access to `{}` ignored", self.devices.tag(id));
            return None;
        };
        let result = {
            let mut ctx = Context::new(self, id, now, executing);
            f(&mut *device, &mut ctx)
        };
        if let Some(slot) = self.devices.get_mut(id) {
            slot.device = Some(device);
        }
        Some(result)
    }

    fn who(&self, origin: Origin) -> &str {
        origin.device.map_or("host", |id| self.devices.tag(id))
    }

    /// Report reads from a device that has run past the observer, and
    /// writes into a device that has not yet reached the writer.
    fn check_causality(&mut self, origin: Origin, target: DeviceId, side: Side) {
        let Some(observer) = origin.device else {
            return;
        };
        if observer == target {
            return;
        }
        let Some(slot) = self.devices.get(target) else {
            return;
        };
        if slot.device.is_none() || !slot.is_executing() {
            return;
        }
        let violated = match side {
            Side::Read => slot.local > origin.now,
            Side::Write => slot.local < origin.now,
        };
        if violated {
            let violation = TimingViolation::FutureObserved {
                observer: self.devices.tag(observer).to_owned(),
                target: slot.tag.clone(),
                observer_time: origin.now,
                target_time: slot.local,
            };
            self.stats.timing_violations += 1;
            self.config.timing_policy.enforce(&violation);
        }
    }

    pub(crate) fn space_read(
        &mut self,
        origin: Origin,
        space: SpaceId,
        address: u64,
        width: AccessWidth,
    ) -> u64 {
        let Some(sp) = self.spaces.get(space.index()) else {
            log::warn!("{}: read from unknown space {space:?}", self.who(origin));
            return width.mask();
        };
        let address = address & sp.address_mask();
        let fallback = sp.unmap_value(width);
        let action = match sp.lookup(Side::Read, address) {
            None => ReadAction::Unmapped,
            Some(hit) => {
                let entry = sp.entry(hit.entry);
                let last = address + u64::from(width.bytes()) - 1;
                if width > entry.width || last > hit.segment_end {
                    ReadAction::Split
                } else {
                    match entry.kind {
                        EntryKind::Storage { .. } => {
                            ReadAction::Value(sp.storage_read(hit.entry, address, width))
                        }
                        EntryKind::Nop => ReadAction::Value(fallback),
                        EntryKind::Unmap => ReadAction::Unmapped,
                        EntryKind::Device { device, region } => {
                            ReadAction::Device(device, region, address - entry.start)
                        }
                    }
                }
            }
        };
        match action {
            ReadAction::Value(value) => value,
            ReadAction::Unmapped => {
                self.stats.unmapped_reads += 1;
                if self.config.log_unmapped {
                    log::warn!(
                        "{}: unmapped {} read at {address:#X} ({} bytes)",
                        self.who(origin),
                        self.spaces[space.index()].config.name,
                        width.bytes()
                    );
                }
                fallback
            }
            ReadAction::Split => self.split_read(origin, space, address, width, fallback),
            ReadAction::Device(device, region, offset) => {
                self.check_causality(origin, device, Side::Read);
                self.call_device(device, origin.now, false, |dev, ctx| {
                    dev.read(ctx, region, offset, width)
                })
                .map_or(fallback, |value| value & width.mask())
            }
        }
    }

    fn split_read(
        &mut self,
        origin: Origin,
        space: SpaceId,
        address: u64,
        width: AccessWidth,
        fallback: u64,
    ) -> u64 {
        let Some(half) = width.half() else {
            return fallback;
        };
        let sp = &self.spaces[space.index()];
        let (mask, endianness) = (sp.address_mask(), sp.config.endianness);
        let first = self.space_read(origin, space, address, half);
        let second = self.space_read(
            origin,
            space,
            (address + u64::from(half.bytes())) & mask,
            half,
        );
        let shift = half.bits();
        match endianness {
            Endianness::Little => first | (second << shift),
            Endianness::Big => (first << shift) | second,
        }
    }

    pub(crate) fn space_write(
        &mut self,
        origin: Origin,
        space: SpaceId,
        address: u64,
        width: AccessWidth,
        value: u64,
        mask: u64,
    ) {
        let mask = mask & width.mask();
        if mask == 0 {
            return;
        }
        let value = value & width.mask();
        let Some(sp) = self.spaces.get_mut(space.index()) else {
            log::warn!("{}: write to unknown space {space:?}", self.who(origin));
            return;
        };
        let address = address & sp.address_mask();
        let action = match sp.lookup(Side::Write, address) {
            None => WriteAction::Unmapped,
            Some(hit) => {
                let entry = sp.entry(hit.entry);
                let (entry_width, start) = (entry.width, entry.start);
                let target = match entry.kind {
                    EntryKind::Device { device, region } => WriteTarget::Device(device, region),
                    EntryKind::Storage { .. } => WriteTarget::Storage,
                    EntryKind::Unmap => WriteTarget::Unmapped,
                    EntryKind::Nop => WriteTarget::Nop,
                };
                let last = address + u64::from(width.bytes()) - 1;
                let partial = mask != width.mask() && width.half().is_some();
                if width > entry_width || last > hit.segment_end {
                    WriteAction::Split
                } else {
                    match target {
                        WriteTarget::Device(..) if partial => WriteAction::Split,
                        WriteTarget::Device(device, region) => {
                            WriteAction::Device(device, region, address - start)
                        }
                        WriteTarget::Storage => {
                            if sp.storage_write(hit.entry, address, width, value, mask) {
                                WriteAction::Done
                            } else {
                                WriteAction::RomDrop
                            }
                        }
                        WriteTarget::Unmapped => WriteAction::Unmapped,
                        WriteTarget::Nop => WriteAction::Done,
                    }
                }
            }
        };
        match action {
            WriteAction::Done => {}
            WriteAction::RomDrop => {
                log::debug!(
                    "{}: write of {value:#X} to ROM at {address:#X} dropped",
                    self.who(origin)
                );
            }
            WriteAction::Unmapped => {
                self.stats.unmapped_writes += 1;
                if self.config.log_unmapped {
                    log::warn!(
                        "{}: unmapped {} write of {value:#X} at {address:#X} ({} bytes)",
                        self.who(origin),
                        self.spaces[space.index()].config.name,
                        width.bytes()
                    );
                }
            }
            WriteAction::Split => self.split_write(origin, space, address, width, value, mask),
            WriteAction::Device(device, region, offset) => {
                self.check_causality(origin, device, Side::Write);
                let value = value & mask;
                self.call_device(device, origin.now, false, |dev, ctx| {
                    dev.write(ctx, region, offset, width, value);
                });
            }
        }
    }

    fn split_write(
        &mut self,
        origin: Origin,
        space: SpaceId,
        address: u64,
        width: AccessWidth,
        value: u64,
        mask: u64,
    ) {
        let Some(half) = width.half() else {
            return;
        };
        let sp = &self.spaces[space.index()];
        let (addr_mask, endianness) = (sp.address_mask(), sp.config.endianness);
        let shift = half.bits();
        let (low, high) = (half.mask(), half.mask() << shift);
        let split = |v: u64| match endianness {
            Endianness::Little => (v & low, (v & high) >> shift),
            Endianness::Big => ((v & high) >> shift, v & low),
        };
        let (first_value, second_value) = split(value);
        let (first_mask, second_mask) = split(mask);
        let second = (address + u64::from(half.bytes())) & addr_mask;
        if first_mask != 0 {
            self.space_write(origin, space, address, half, first_value, first_mask);
        }
        if second_mask != 0 {
            self.space_write(origin, space, second, half, second_value, second_mask);
        }
    }

    pub(crate) fn line_read(&mut self, origin: Origin, endpoint: EndpointId) -> u32 {
        let pull = {
            let Some(ep) = self.lines.get_mut(endpoint) else {
                log::warn!("{}: read from unknown line {endpoint:?}", self.who(origin));
                return u32::MAX;
            };
            let floating = ep.spec.floating_value();
            let mask = ep.spec.mask();
            if ep.spec.direction != Direction::Read {
                Pull::Floating(floating)
            } else {
                match ep.bindings.first_mut() {
                    None => Pull::Floating(floating),
                    Some(binding) => {
                        let field = binding.field;
                        match &mut binding.route {
                            Route::Constant(v) => Pull::Value(field.extract(*v) & mask),
                            Route::HostSource(f) => Pull::Value(field.extract(f()) & mask),
                            Route::Source { device, source } => {
                                Pull::Source(*device, *source, floating)
                            }
                            Route::Stub | Route::Sink { .. } | Route::HostSink(_) => Pull::Value(0),
                        }
                    }
                }
            }
        };
        match pull {
            Pull::Value(value) => value,
            Pull::Floating(value) => {
                self.stats.floating_reads += 1;
                if let Some(ep) = self.lines.get(endpoint) {
                    log::debug!(
                        "{}: `{}` `{}` is floating, reads {value:#X}",
                        self.who(origin),
                        self.devices.tag(ep.owner),
                        ep.spec.name
                    );
                }
                value
            }
            Pull::Source(device, source, floating) => {
                self.check_causality(origin, device, Side::Read);
                let raw = self.call_device(device, origin.now, false, |dev, ctx| {
                    dev.source_read(ctx, source)
                });
                let Some(raw) = raw else {
                    return floating;
                };
                self.lines.get(endpoint).map_or(floating, |ep| {
                    let field = ep.bindings.first().map_or(BitField::FULL, |b| b.field);
                    field.extract(raw) & ep.spec.mask()
                })
            }
        }
    }

    pub(crate) fn line_write(&mut self, origin: Origin, endpoint: EndpointId, value: u32) {
        let Some(ep) = self.lines.get(endpoint) else {
            log::warn!("{}: write to unknown line {endpoint:?}", self.who(origin));
            return;
        };
        if ep.spec.direction != Direction::Write {
            log::warn!(
                "{}: write to read endpoint `{}` ignored",
                self.who(origin),
                ep.spec.name
            );
            return;
        }
        let value = value & ep.spec.mask();
        let count = ep.bindings.len();
        for i in 0..count {
            let call = {
                let Some(binding) = self
                    .lines
                    .get_mut(endpoint)
                    .and_then(|ep| ep.bindings.get_mut(i))
                else {
                    break;
                };
                let placed = binding.field.place(value);
                match &mut binding.route {
                    Route::HostSink(f) => {
                        f(placed);
                        None
                    }
                    Route::Sink { device, sink } => Some((*device, *sink, placed)),
                    _ => None,
                }
            };
            if let Some((device, sink, placed)) = call {
                self.check_causality(origin, device, Side::Write);
                self.call_device(device, origin.now, false, |dev, ctx| {
                    dev.sink_write(ctx, sink, placed);
                });
            }
        }
    }
}
