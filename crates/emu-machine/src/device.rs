//! The device interface and the per-device bookkeeping the tree keeps.
//!
//! A device is a plain struct implementing [`Device`]. It advertises which
//! hooks it implements through [`Capabilities`]; the machine never calls a
//! hook the device did not declare. Devices never hold references to each
//! other. Everything they do to the outside world goes through the
//! [`Context`] they are handed for the duration of a hook.

use std::any::Any;
use std::collections::HashMap;

use bitflags::bitflags;
use emu_core::{AccessWidth, Clock, EmuTime, Observable};

use crate::context::Context;
use crate::error::{ConfigError, ResourceError};
use crate::line::{EndpointId, LineSpec, LineTable};
use crate::space::{SpaceConfig, SpaceDecl, SpaceId};

/// Index of a device in its machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub(crate) u32);

impl DeviceId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// Hooks a device implements.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u8 {
        const START = 1 << 0;
        const RESET = 1 << 1;
        /// Consumes time in [`Device::execute`].
        const EXECUTE = 1 << 2;
        /// Serves bus accesses to its regions.
        const MEMORY = 1 << 3;
        /// Serves sinks and sources.
        const LINES = 1 << 4;
        const TIMERS = 1 << 5;
        const STOP = 1 << 6;
    }
}

bitflags! {
    /// Why a device is suspended. A device runs again once every reason has
    /// been cleared.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SuspendReason: u8 {
        const HALT = 1 << 0;
        const RESET = 1 << 1;
        const DISABLE = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    /// Configured but not started.
    Idle,
    Running,
    Suspended,
    Stopped,
}

/// Memory region declared by a device, local to that device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionId(pub u16);

/// Line sink declared by a device, local to that device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(pub u16);

/// Line source declared by a device, local to that device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(pub u16);

/// Downcasting support for boxed devices.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A node in the device tree.
///
/// Every hook except [`configure`](Self::configure) and
/// [`capabilities`](Self::capabilities) is gated by a [`Capabilities`] bit.
pub trait Device: Observable + AsAny {
    fn capabilities(&self) -> Capabilities;

    /// Declare endpoints, sinks, sources, regions and address spaces.
    ///
    /// Runs once, when the device is added to a builder. Declarations only:
    /// nothing else exists yet.
    fn configure(&mut self, _cfg: &mut Configurator<'_>) {}

    /// One-time setup after the tree is finalized (`START`).
    fn start(&mut self, _ctx: &mut Context<'_>) -> Result<(), ResourceError> {
        Ok(())
    }

    /// Return to the power-on state (`RESET`). Must be idempotent.
    fn reset(&mut self, _ctx: &mut Context<'_>) {}

    /// Run until [`Context::remaining`] is used up or a yield is requested
    /// (`EXECUTE`). Time is consumed with [`Context::elapse`].
    fn execute(&mut self, _ctx: &mut Context<'_>) {}

    /// Bus read from one of this device's regions (`MEMORY`).
    fn read(
        &mut self,
        _ctx: &mut Context<'_>,
        _region: RegionId,
        _offset: u64,
        width: AccessWidth,
    ) -> u64 {
        width.mask()
    }

    /// Bus write to one of this device's regions (`MEMORY`).
    fn write(
        &mut self,
        _ctx: &mut Context<'_>,
        _region: RegionId,
        _offset: u64,
        _width: AccessWidth,
        _value: u64,
    ) {
    }

    /// A write endpoint bound to one of this device's sinks was driven (`LINES`).
    fn sink_write(&mut self, _ctx: &mut Context<'_>, _sink: SinkId, _value: u32) {}

    /// A read endpoint bound to one of this device's sources is sampled (`LINES`).
    fn source_read(&mut self, _ctx: &mut Context<'_>, _source: SourceId) -> u32 {
        0
    }

    /// A timer owned by this device expired (`TIMERS`).
    fn timer_fired(&mut self, _ctx: &mut Context<'_>, _key: u32, _param: u64) {}

    /// Machine shutdown (`STOP`).
    fn stop(&mut self, _ctx: &mut Context<'_>) {}
}

/// Names a device declared while it was configured.
#[derive(Debug, Default)]
pub(crate) struct Declarations {
    pub(crate) endpoints: Vec<EndpointId>,
    pub(crate) sinks: Vec<String>,
    pub(crate) sources: Vec<String>,
    pub(crate) regions: Vec<String>,
    pub(crate) spaces: Vec<SpaceId>,
}

impl Declarations {
    pub(crate) fn sink(&self, name: &str) -> Option<SinkId> {
        position(&self.sinks, name).map(SinkId)
    }

    pub(crate) fn source(&self, name: &str) -> Option<SourceId> {
        position(&self.sources, name).map(SourceId)
    }

    pub(crate) fn region(&self, name: &str) -> Option<RegionId> {
        position(&self.regions, name).map(RegionId)
    }
}

fn position(names: &[String], name: &str) -> Option<u16> {
    names
        .iter()
        .position(|n| n == name)
        .and_then(|i| u16::try_from(i).ok())
}

/// Handed to [`Device::configure`] to collect declarations.
pub struct Configurator<'a> {
    pub(crate) device: DeviceId,
    pub(crate) tag: &'a str,
    pub(crate) clock: Clock,
    pub(crate) decl: &'a mut Declarations,
    pub(crate) lines: &'a mut LineTable,
    pub(crate) spaces: &'a mut Vec<SpaceDecl>,
    pub(crate) errors: &'a mut Vec<ConfigError>,
}

impl Configurator<'_> {
    #[must_use]
    pub fn tag(&self) -> &str {
        self.tag
    }

    #[must_use]
    pub fn clock(&self) -> Clock {
        self.clock
    }

    /// Optional read endpoint that floats to all ones when unbound.
    pub fn read_line(&mut self, name: &str, width: u8) -> EndpointId {
        self.line(LineSpec::read(name, width))
    }

    /// Optional write endpoint.
    pub fn write_line(&mut self, name: &str, width: u8) -> EndpointId {
        self.line(LineSpec::write(name, width))
    }

    pub fn line(&mut self, spec: LineSpec) -> EndpointId {
        if !(1..=32).contains(&spec.width) {
            self.errors.push(ConfigError::LineWidth {
                tag: self.tag.to_owned(),
                name: spec.name.clone(),
                width: spec.width,
            });
        }
        if self
            .decl
            .endpoints
            .iter()
            .any(|&id| self.lines.get(id).is_some_and(|ep| ep.spec.name == spec.name))
        {
            self.duplicate(&spec.name);
        }
        let id = self.lines.declare(self.device, spec);
        self.decl.endpoints.push(id);
        id
    }

    /// A named handler other devices' write endpoints can drive.
    pub fn sink(&mut self, name: &str) -> SinkId {
        if self.decl.sink(name).is_some() {
            self.duplicate(name);
        }
        self.decl.sinks.push(name.to_owned());
        SinkId(index_u16(self.decl.sinks.len() - 1))
    }

    /// A named handler other devices' read endpoints can sample.
    pub fn source(&mut self, name: &str) -> SourceId {
        if self.decl.source(name).is_some() {
            self.duplicate(name);
        }
        self.decl.sources.push(name.to_owned());
        SourceId(index_u16(self.decl.sources.len() - 1))
    }

    /// A named block of registers or memory that can be mapped into a space.
    pub fn region(&mut self, name: &str) -> RegionId {
        if self.decl.region(name).is_some() {
            self.duplicate(name);
        }
        self.decl.regions.push(name.to_owned());
        RegionId(index_u16(self.decl.regions.len() - 1))
    }

    /// An address space owned by this device, such as a CPU's program space.
    pub fn address_space(&mut self, config: SpaceConfig) -> SpaceId {
        if !(1..=48).contains(&config.address_bits) {
            self.errors.push(ConfigError::AddressBits {
                space: config.name.clone(),
                bits: config.address_bits,
            });
        }
        if self
            .decl
            .spaces
            .iter()
            .any(|&id| self.spaces[id.index()].config.name == config.name)
        {
            self.duplicate(&config.name);
        }
        let id = SpaceId(index_u16(self.spaces.len()));
        self.spaces.push(SpaceDecl {
            owner: self.device,
            config,
        });
        self.decl.spaces.push(id);
        id
    }

    fn duplicate(&mut self, name: &str) {
        self.errors.push(ConfigError::DuplicateDeclaration {
            tag: self.tag.to_owned(),
            name: name.to_owned(),
        });
    }
}

fn index_u16(index: usize) -> u16 {
    u16::try_from(index).unwrap_or(u16::MAX)
}

pub(crate) struct DeviceSlot {
    pub(crate) tag: String,
    pub(crate) parent: Option<DeviceId>,
    pub(crate) children: Vec<DeviceId>,
    pub(crate) clock: Clock,
    pub(crate) caps: Capabilities,
    /// Empty while one of the device's hooks is running.
    pub(crate) device: Option<Box<dyn Device>>,
    pub(crate) state: DeviceState,
    pub(crate) suspend: SuspendReason,
    /// How far this device has run.
    pub(crate) local: EmuTime,
    pub(crate) decl: Declarations,
}

impl DeviceSlot {
    pub(crate) fn is_executing(&self) -> bool {
        self.state == DeviceState::Running && self.caps.contains(Capabilities::EXECUTE)
    }
}

#[derive(Default)]
pub(crate) struct DeviceTable {
    slots: Vec<DeviceSlot>,
    tags: HashMap<String, DeviceId>,
}

impl DeviceTable {
    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn next_id(&self) -> DeviceId {
        DeviceId(self.slots.len() as u32)
    }

    /// Append a slot. The tag is only registered for lookup if `register`.
    pub(crate) fn push(&mut self, slot: DeviceSlot, register: bool) -> DeviceId {
        let id = self.next_id();
        if let Some(parent) = slot.parent.and_then(|p| self.slots.get_mut(p.index())) {
            parent.children.push(id);
        }
        if register {
            self.tags.insert(slot.tag.clone(), id);
        }
        self.slots.push(slot);
        id
    }

    pub(crate) fn lookup(&self, tag: &str) -> Option<DeviceId> {
        self.tags.get(tag).copied()
    }

    pub(crate) fn get(&self, id: DeviceId) -> Option<&DeviceSlot> {
        self.slots.get(id.index())
    }

    pub(crate) fn get_mut(&mut self, id: DeviceId) -> Option<&mut DeviceSlot> {
        self.slots.get_mut(id.index())
    }

    pub(crate) fn tag(&self, id: DeviceId) -> &str {
        self.get(id).map_or("?", |slot| slot.tag.as_str())
    }

    pub(crate) fn iter(&self) -> impl DoubleEndedIterator<Item = (DeviceId, &DeviceSlot)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (DeviceId(i as u32), slot))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut DeviceSlot> {
        self.slots.iter_mut()
    }

    /// Parents before children, siblings in the order they were added.
    pub(crate) fn pre_order(&self) -> Vec<DeviceId> {
        let mut order = Vec::with_capacity(self.slots.len());
        let mut stack: Vec<DeviceId> = self
            .iter()
            .filter(|(_, slot)| slot.parent.is_none())
            .map(|(id, _)| id)
            .rev()
            .collect();
        while let Some(id) = stack.pop() {
            order.push(id);
            if let Some(slot) = self.get(id) {
                stack.extend(slot.children.iter().rev());
            }
        }
        order
    }

    /// `root` and everything below it, in pre-order.
    pub(crate) fn subtree(&self, root: DeviceId) -> Vec<DeviceId> {
        let mut order = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            order.push(id);
            if let Some(slot) = self.get(id) {
                stack.extend(slot.children.iter().rev());
            }
        }
        order
    }
}

/// Tags are `:`-separated paths of non-empty segments made of ASCII
/// letters, digits, `_` and `-`.
pub(crate) fn valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.split(':').all(|segment| {
            !segment.is_empty()
                && segment
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        })
}

/// The parent path of a tag, if it has one.
pub(crate) fn parent_tag(tag: &str) -> Option<&str> {
    tag.rsplit_once(':').map(|(parent, _)| parent)
}
