//! The timer pool and expiry queue.
//!
//! Timers live in a fixed-capacity slab addressed by generation-checked
//! [`TimerId`]s. Armed timers sit in an ordered set keyed by
//! `(expiry, arming sequence)`, so ties fire in the order they were armed.
//!
//! Firing happens in passes. A pass takes a snapshot of every timer due at
//! the earliest pending instant. Anything armed while the pass runs goes
//! into a pending list that is merged when the pass ends, so a timer armed
//! for the same instant fires in the next pass at that instant rather than
//! in the one already running. A snapshot entry whose timer was cancelled or
//! re-armed in the meantime is skipped.

use std::collections::{BTreeSet, VecDeque};

use emu_core::EmuTime;

use crate::config::TimingPolicy;
use crate::device::DeviceId;
use crate::error::{ResourceError, TimingViolation};

/// Handle to a timer. Stale handles (to freed timers) are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId {
    index: u32,
    generation: u32,
}

/// When a timer first expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerStart {
    /// Relative to the arming party's current time.
    After(EmuTime),
    /// Absolute. Must not be in the past.
    At(EmuTime),
}

/// A timer that expired, handed back to whoever drives the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fired {
    pub id: TimerId,
    pub owner: DeviceId,
    pub when: EmuTime,
    pub key: u32,
    pub param: u64,
}

type QueueKey = (EmuTime, u64, u32);

#[derive(Debug)]
struct Slot {
    generation: u32,
    live: bool,
    /// Frees itself after a one-shot fire or when cancelled.
    transient: bool,
    owner: DeviceId,
    key: u32,
    param: u64,
    period: EmuTime,
    armed: Option<(EmuTime, u64)>,
}

#[derive(Debug)]
pub struct TimerQueue {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
    capacity: usize,
    queue: BTreeSet<QueueKey>,
    pending: Vec<QueueKey>,
    firing: VecDeque<QueueKey>,
    in_pass: bool,
    now: EmuTime,
    seq: u64,
    policy: TimingPolicy,
    violations: u64,
}

impl TimerQueue {
    #[must_use]
    pub fn new(capacity: usize, policy: TimingPolicy) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
            capacity,
            queue: BTreeSet::new(),
            pending: Vec::new(),
            firing: VecDeque::new(),
            in_pass: false,
            now: EmuTime::ZERO,
            seq: 0,
            policy,
            violations: 0,
        }
    }

    /// Time of the last pass, or the last [`settle`](Self::settle).
    #[must_use]
    pub fn now(&self) -> EmuTime {
        self.now
    }

    /// Timers currently allocated.
    #[must_use]
    pub fn live(&self) -> usize {
        self.live
    }

    /// Past-deadline violations clamped so far.
    #[must_use]
    pub fn violations(&self) -> u64 {
        self.violations
    }

    /// Allocate a disarmed persistent timer.
    pub fn alloc(&mut self, owner: DeviceId, key: u32) -> Result<TimerId, ResourceError> {
        self.allocate(owner, key, false)
    }

    /// Allocate and arm a timer in one step. A one-shot scheduled this way
    /// frees itself after it fires.
    pub fn schedule(
        &mut self,
        owner: DeviceId,
        start: TimerStart,
        period: EmuTime,
        key: u32,
        param: u64,
    ) -> Result<TimerId, ResourceError> {
        let id = self.allocate(owner, key, true)?;
        self.adjust(id, start, period, param);
        Ok(id)
    }

    fn allocate(
        &mut self,
        owner: DeviceId,
        key: u32,
        transient: bool,
    ) -> Result<TimerId, ResourceError> {
        if self.live >= self.capacity {
            return Err(ResourceError::TimerPoolExhausted {
                capacity: self.capacity,
            });
        }
        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    live: false,
                    transient: false,
                    owner,
                    key: 0,
                    param: 0,
                    period: EmuTime::ZERO,
                    armed: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.live = true;
        slot.transient = transient;
        slot.owner = owner;
        slot.key = key;
        slot.param = 0;
        slot.period = EmuTime::ZERO;
        slot.armed = None;
        self.live += 1;
        Ok(TimerId {
            index,
            generation: slot.generation,
        })
    }

    /// Release a timer, disarming it first. Stale ids are ignored.
    pub fn free(&mut self, id: TimerId) {
        if self.slot(id).is_none() {
            return;
        }
        self.disarm(id.index);
        let slot = &mut self.slots[id.index as usize];
        slot.live = false;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
    }

    /// (Re)arm a timer. `period == ZERO` makes it one-shot.
    ///
    /// Returns `false` for a stale id.
    pub fn adjust(&mut self, id: TimerId, start: TimerStart, period: EmuTime, param: u64) -> bool {
        if self.slot(id).is_none() {
            return false;
        }
        let expiry = match start {
            TimerStart::After(delay) => self.now.saturating_add(delay),
            TimerStart::At(at) if at < self.now => {
                self.policy.enforce(&TimingViolation::PastDeadline {
                    requested: at,
                    now: self.now,
                });
                self.violations += 1;
                self.now
            }
            TimerStart::At(at) => at,
        };
        let slot = &mut self.slots[id.index as usize];
        slot.period = period;
        slot.param = param;
        self.disarm(id.index);
        self.arm(id.index, expiry);
        true
    }

    /// Disarm a timer. Anonymous timers are freed. Returns whether it was
    /// armed.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let Some(slot) = self.slot(id) else {
            return false;
        };
        let (armed, transient) = (slot.armed.is_some(), slot.transient);
        if transient {
            self.free(id);
        } else {
            self.disarm(id.index);
        }
        armed
    }

    #[must_use]
    pub fn is_armed(&self, id: TimerId) -> bool {
        self.slot(id).is_some_and(|slot| slot.armed.is_some())
    }

    /// Expiry of an armed timer.
    #[must_use]
    pub fn expiry(&self, id: TimerId) -> Option<EmuTime> {
        self.slot(id)?.armed.map(|(at, _)| at)
    }

    /// Earliest armed expiry, or [`EmuTime::NEVER`].
    #[must_use]
    pub fn next_deadline(&self) -> EmuTime {
        let queued = self.queue.first().map_or(EmuTime::NEVER, |&(at, _, _)| at);
        let pending = self
            .pending
            .iter()
            .map(|&(at, _, _)| at)
            .min()
            .unwrap_or(EmuTime::NEVER);
        queued.min(pending)
    }

    /// Start a pass at the earliest deadline if it is `<= limit`.
    ///
    /// Returns `false` when nothing is due.
    pub fn begin_pass(&mut self, limit: EmuTime) -> bool {
        debug_assert!(!self.in_pass, "timer passes do not nest");
        let Some(&(at, _, _)) = self.queue.first() else {
            return false;
        };
        if at > limit {
            return false;
        }
        while let Some(&(expiry, _, _)) = self.queue.first() {
            if expiry != at {
                break;
            }
            if let Some(key) = self.queue.pop_first() {
                self.firing.push_back(key);
            }
        }
        self.now = self.now.max(at);
        self.in_pass = true;
        true
    }

    /// Claim the next timer of the current pass.
    ///
    /// Periodic timers are re-armed before they are returned; anonymous
    /// one-shots are freed.
    pub fn next_fired(&mut self) -> Option<Fired> {
        while let Some((at, seq, index)) = self.firing.pop_front() {
            let slot = &mut self.slots[index as usize];
            if !slot.live || slot.armed != Some((at, seq)) {
                continue;
            }
            slot.armed = None;
            let id = TimerId {
                index,
                generation: slot.generation,
            };
            let fired = Fired {
                id,
                owner: slot.owner,
                when: at,
                key: slot.key,
                param: slot.param,
            };
            let period = slot.period;
            if !period.is_zero() {
                self.arm(index, at.saturating_add(period));
            } else if slot.transient {
                self.free(id);
            }
            return Some(fired);
        }
        None
    }

    /// Finish the pass and merge timers armed during it.
    pub fn end_pass(&mut self) {
        self.firing.clear();
        self.queue.extend(self.pending.drain(..));
        self.in_pass = false;
    }

    /// Move the queue's notion of "now" forward to `time` after everything
    /// due by then has fired.
    pub fn settle(&mut self, time: EmuTime) {
        self.now = self.now.max(time);
    }

    /// Fire every timer due `<= time`, in expiry order and arming order for
    /// ties, then settle at `time`.
    pub fn advance_to(&mut self, time: EmuTime, mut fire: impl FnMut(&mut Self, Fired)) {
        while self.begin_pass(time) {
            while let Some(fired) = self.next_fired() {
                fire(self, fired);
            }
            self.end_pass();
        }
        self.settle(time);
    }

    /// Drop every timer. Outstanding ids become stale.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.pending.clear();
        self.firing.clear();
        self.in_pass = false;
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.live {
                slot.live = false;
                slot.armed = None;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(index as u32);
            }
        }
        self.live = 0;
    }

    fn slot(&self, id: TimerId) -> Option<&Slot> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.live && slot.generation == id.generation)
    }

    fn arm(&mut self, index: u32, expiry: EmuTime) {
        let seq = self.seq;
        self.seq += 1;
        self.slots[index as usize].armed = Some((expiry, seq));
        let key = (expiry, seq, index);
        if self.in_pass {
            self.pending.push(key);
        } else {
            self.queue.insert(key);
        }
    }

    fn disarm(&mut self, index: u32) {
        if let Some((at, seq)) = self.slots[index as usize].armed.take() {
            let key = (at, seq, index);
            if !self.queue.remove(&key) {
                self.pending.retain(|&k| k != key);
            }
        }
    }
}
