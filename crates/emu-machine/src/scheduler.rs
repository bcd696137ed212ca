//! The main loop.
//!
//! Time advances in slices. Each slice picks a target no later than the next
//! timer, one quantum past global time and the caller's limit. Executing
//! devices then run up to the target in tree order, after which every timer
//! due by then fires and global time moves to the target. A device may cut
//! the slice short with [`Context::synchronize`](crate::Context::synchronize);
//! devices that have not yet run stop at that instant and the slice ends
//! there.

use emu_core::EmuTime;

use crate::device::{Capabilities, DeviceId, DeviceState, SuspendReason};
use crate::error::MachineError;
use crate::machine::{Machine, StateRequest};
use crate::timer::Fired;

const MIN_QUANTUM: EmuTime = EmuTime::new(0, 1);

impl Machine {
    /// Run until global time reaches `limit`. Timers due exactly at `limit`
    /// fire before this returns.
    pub fn run_until(&mut self, limit: EmuTime) -> Result<(), MachineError> {
        self.ensure_started()?;
        loop {
            self.run_slice(limit);
            if self.global >= limit {
                return Ok(());
            }
        }
    }

    pub fn run_for(&mut self, span: EmuTime) -> Result<(), MachineError> {
        let limit = self.global.saturating_add(span);
        self.run_until(limit)
    }

    /// Run a single slice with no limit other than the quantum and the next
    /// timer.
    pub fn timeslice(&mut self) -> Result<(), MachineError> {
        self.ensure_started()?;
        self.run_slice(EmuTime::NEVER);
        Ok(())
    }

    fn run_slice(&mut self, limit: EmuTime) {
        self.apply_requests();

        let quantum = self.config.quantum.max(MIN_QUANTUM);
        let target = self
            .timers
            .next_deadline()
            .min(self.global.saturating_add(quantum))
            .min(limit)
            .max(self.global);

        self.slice.executing = true;
        self.slice.target = target;
        self.slice.resync_at = None;

        for i in 0..self.order.len() {
            let id = self.order[i];
            let bound = self.slice.bound();
            let Some(slot) = self.devices.get(id) else {
                continue;
            };
            if !slot.is_executing() || slot.local >= bound {
                continue;
            }
            let start = slot.local;
            let end = self.call_device(id, start, true, |dev, ctx| {
                dev.execute(ctx);
                ctx.now()
            });
            // A device that stops short without yielding idles to the bound.
            let bound = self.slice.bound();
            if let (Some(end), Some(slot)) = (end, self.devices.get_mut(id)) {
                slot.local = end.max(bound);
            }
        }

        self.slice.executing = false;
        let end = self.slice.bound().max(self.global);
        self.slice.resync_at = None;
        self.global = end;

        self.fire_timers(end);
        self.apply_requests();

        let global = self.global;
        for slot in self.devices.iter_mut() {
            let follows = match slot.state {
                DeviceState::Suspended => true,
                DeviceState::Running => !slot.caps.contains(Capabilities::EXECUTE),
                DeviceState::Idle | DeviceState::Stopped => false,
            };
            if follows {
                slot.local = slot.local.max(global);
            }
        }
    }

    fn fire_timers(&mut self, limit: EmuTime) {
        while self.timers.begin_pass(limit) {
            while let Some(fired) = self.timers.next_fired() {
                self.dispatch_timer(fired);
            }
            self.timers.end_pass();
        }
        self.timers.settle(limit);
    }

    fn dispatch_timer(&mut self, fired: Fired) {
        let Some(slot) = self.devices.get(fired.owner) else {
            return;
        };
        if slot.state == DeviceState::Stopped {
            return;
        }
        if !slot.caps.contains(Capabilities::TIMERS) {
            log::warn!("timer for `{}` fired but it has no timer hook", slot.tag);
            return;
        }
        self.call_device(fired.owner, fired.when, false, |dev, ctx| {
            dev.timer_fired(ctx, fired.key, fired.param);
        });
    }

    // Suspension

    /// Suspend a device from the next slice boundary.
    pub fn suspend(&mut self, tag: &str, reason: SuspendReason) -> Result<(), MachineError> {
        let id = self
            .devices
            .lookup(tag)
            .ok_or_else(|| MachineError::UnknownDevice(tag.to_owned()))?;
        self.request_state(id, reason, true);
        Ok(())
    }

    /// Clear a suspend reason from the next slice boundary. The device runs
    /// again once no reason is left.
    pub fn resume(&mut self, tag: &str, reason: SuspendReason) -> Result<(), MachineError> {
        let id = self
            .devices
            .lookup(tag)
            .ok_or_else(|| MachineError::UnknownDevice(tag.to_owned()))?;
        self.request_state(id, reason, false);
        Ok(())
    }

    pub(crate) fn request_state(&mut self, device: DeviceId, reason: SuspendReason, suspend: bool) {
        self.slice.requests.push(StateRequest {
            device,
            reason,
            suspend,
        });
    }

    pub(crate) fn apply_requests(&mut self) {
        if self.slice.requests.is_empty() {
            return;
        }
        let global = self.global;
        for request in std::mem::take(&mut self.slice.requests) {
            let Some(slot) = self.devices.get_mut(request.device) else {
                continue;
            };
            if request.suspend {
                slot.suspend |= request.reason;
            } else {
                slot.suspend -= request.reason;
            }
            match (slot.state, slot.suspend.is_empty()) {
                (DeviceState::Running, false) => {
                    log::debug!("`{}` suspended ({:?})", slot.tag, slot.suspend);
                    slot.state = DeviceState::Suspended;
                }
                (DeviceState::Suspended, true) => {
                    log::debug!("`{}` resumed at {global}", slot.tag);
                    slot.state = DeviceState::Running;
                    slot.local = slot.local.max(global);
                }
                _ => {}
            }
        }
    }
}
