//! Callback lines: named signal endpoints bound to sinks, sources and host
//! closures.
//!
//! A device declares endpoints while it is configured. Bindings are recorded
//! by tag and name and resolved in one pass when the tree is finalized, so a
//! binding may name a device that is added later. Once the machine starts the
//! tables are frozen.

use std::fmt;

use crate::device::{Capabilities, DeviceId, DeviceTable, SinkId, SourceId};
use crate::error::ConfigError;

/// Handle to a declared line endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(pub(crate) u32);

impl EndpointId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Direction {
    /// The owner samples a value from a source.
    Read,
    /// The owner drives a value into one or more sinks.
    Write,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
        })
    }
}

/// Declaration of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineSpec {
    pub name: String,
    pub direction: Direction,
    /// Significant bits, 1..=32.
    pub width: u8,
    /// Finalization fails if a required endpoint is left unbound.
    pub required: bool,
    /// Value an unbound read endpoint returns. All ones when `None`.
    pub floating: Option<u32>,
}

impl LineSpec {
    #[must_use]
    pub fn read(name: impl Into<String>, width: u8) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Read,
            width,
            required: false,
            floating: None,
        }
    }

    #[must_use]
    pub fn write(name: impl Into<String>, width: u8) -> Self {
        Self {
            direction: Direction::Write,
            ..Self::read(name, width)
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn floating(mut self, value: u32) -> Self {
        self.floating = Some(value);
        self
    }

    /// All-ones value of this endpoint's width.
    #[must_use]
    pub fn mask(&self) -> u32 {
        width_mask(self.width)
    }

    #[must_use]
    pub fn floating_value(&self) -> u32 {
        self.floating.unwrap_or(u32::MAX) & self.mask()
    }
}

pub(crate) fn width_mask(width: u8) -> u32 {
    match width {
        0 => 0,
        1..=31 => (1u32 << width) - 1,
        _ => u32::MAX,
    }
}

/// Selects a slice of bits on the far side of a binding.
///
/// Reads see `(source >> shift) & mask`; writes deliver
/// `(value & mask) << shift`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BitField {
    pub shift: u8,
    pub mask: u32,
}

impl BitField {
    pub const FULL: Self = Self {
        shift: 0,
        mask: u32::MAX,
    };

    #[must_use]
    pub const fn new(shift: u8, mask: u32) -> Self {
        Self { shift, mask }
    }

    /// A single bit.
    #[must_use]
    pub const fn bit(bit: u8) -> Self {
        Self { shift: bit, mask: 1 }
    }

    #[must_use]
    pub fn extract(self, raw: u32) -> u32 {
        (raw >> self.shift) & self.mask
    }

    #[must_use]
    pub fn place(self, value: u32) -> u32 {
        (value & self.mask) << self.shift
    }
}

impl Default for BitField {
    fn default() -> Self {
        Self::FULL
    }
}

/// What an endpoint is bound to.
pub enum Target {
    /// A sink (for write endpoints) or source (for read endpoints) declared
    /// by another device.
    Device { tag: String, handler: String },
    /// Reads return this value.
    Constant(u32),
    /// Reads return zero, writes are dropped. Marks a line as intentionally
    /// unconnected.
    Stub,
    HostSource(Box<dyn FnMut() -> u32>),
    HostSink(Box<dyn FnMut(u32)>),
}

impl Target {
    #[must_use]
    pub fn device(tag: impl Into<String>, handler: impl Into<String>) -> Self {
        Self::Device {
            tag: tag.into(),
            handler: handler.into(),
        }
    }

    pub fn host_source(f: impl FnMut() -> u32 + 'static) -> Self {
        Self::HostSource(Box::new(f))
    }

    pub fn host_sink(f: impl FnMut(u32) + 'static) -> Self {
        Self::HostSink(Box::new(f))
    }
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device { tag, handler } => f
                .debug_struct("Device")
                .field("tag", tag)
                .field("handler", handler)
                .finish(),
            Self::Constant(v) => f.debug_tuple("Constant").field(v).finish(),
            Self::Stub => f.write_str("Stub"),
            Self::HostSource(_) => f.write_str("HostSource(..)"),
            Self::HostSink(_) => f.write_str("HostSink(..)"),
        }
    }
}

/// A binding waiting to be resolved.
#[derive(Debug)]
pub(crate) struct BindRequest {
    pub(crate) tag: String,
    pub(crate) endpoint: String,
    pub(crate) target: Target,
    pub(crate) field: BitField,
    pub(crate) append: bool,
}

pub(crate) enum Route {
    Sink { device: DeviceId, sink: SinkId },
    Source { device: DeviceId, source: SourceId },
    Constant(u32),
    Stub,
    HostSource(Box<dyn FnMut() -> u32>),
    HostSink(Box<dyn FnMut(u32)>),
}

pub(crate) struct Binding {
    pub(crate) route: Route,
    pub(crate) field: BitField,
}

pub(crate) struct Endpoint {
    pub(crate) owner: DeviceId,
    pub(crate) spec: LineSpec,
    pub(crate) bindings: Vec<Binding>,
}

#[derive(Default)]
pub(crate) struct LineTable {
    endpoints: Vec<Endpoint>,
}

impl LineTable {
    pub(crate) fn declare(&mut self, owner: DeviceId, spec: LineSpec) -> EndpointId {
        let id = EndpointId(self.endpoints.len() as u32);
        self.endpoints.push(Endpoint {
            owner,
            spec,
            bindings: Vec::new(),
        });
        id
    }

    pub(crate) fn get(&self, id: EndpointId) -> Option<&Endpoint> {
        self.endpoints.get(id.index())
    }

    pub(crate) fn get_mut(&mut self, id: EndpointId) -> Option<&mut Endpoint> {
        self.endpoints.get_mut(id.index())
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (EndpointId, &Endpoint)> {
        self.endpoints
            .iter()
            .enumerate()
            .map(|(i, ep)| (EndpointId(i as u32), ep))
    }

    /// Find an endpoint by its owner and name.
    pub(crate) fn find(
        &self,
        devices: &DeviceTable,
        owner: DeviceId,
        name: &str,
    ) -> Option<EndpointId> {
        devices
            .get(owner)?
            .decl
            .endpoints
            .iter()
            .copied()
            .find(|&id| self.get(id).is_some_and(|ep| ep.spec.name == name))
    }

    /// Resolve one binding against the device table.
    pub(crate) fn resolve(
        &mut self,
        devices: &DeviceTable,
        request: BindRequest,
    ) -> Result<(), ConfigError> {
        let BindRequest {
            tag,
            endpoint: name,
            target,
            field,
            append,
        } = request;

        let owner = devices
            .lookup(&tag)
            .ok_or_else(|| ConfigError::UnknownDevice { tag: tag.clone() })?;
        let id = self
            .find(devices, owner, &name)
            .ok_or_else(|| ConfigError::UnknownEndpoint {
                tag: tag.clone(),
                name: name.clone(),
            })?;
        if field.shift >= 32 {
            return Err(ConfigError::InvalidField {
                tag,
                name,
                shift: field.shift,
            });
        }

        let direction = self.endpoints[id.index()].spec.direction;
        let mismatch = || ConfigError::DirectionMismatch {
            tag: tag.clone(),
            name: name.clone(),
            direction,
        };
        let route = match (target, direction) {
            (Target::Device { tag: far, handler }, _) => {
                let far_id = devices
                    .lookup(&far)
                    .ok_or_else(|| ConfigError::UnknownDevice { tag: far.clone() })?;
                let slot = devices
                    .get(far_id)
                    .ok_or_else(|| ConfigError::UnknownDevice { tag: far.clone() })?;
                let unknown = || ConfigError::UnknownLineHandler {
                    tag: far.clone(),
                    name: handler.clone(),
                    direction,
                };
                let route = match direction {
                    Direction::Write => Route::Sink {
                        device: far_id,
                        sink: slot.decl.sink(&handler).ok_or_else(unknown)?,
                    },
                    Direction::Read => Route::Source {
                        device: far_id,
                        source: slot.decl.source(&handler).ok_or_else(unknown)?,
                    },
                };
                if !slot.caps.contains(Capabilities::LINES) {
                    return Err(ConfigError::MissingCapability {
                        tag: far,
                        capability: "line",
                    });
                }
                route
            }
            (Target::Constant(v), Direction::Read) => Route::Constant(v),
            (Target::Stub, _) => Route::Stub,
            (Target::HostSource(f), Direction::Read) => Route::HostSource(f),
            (Target::HostSink(f), Direction::Write) => Route::HostSink(f),
            (Target::Constant(_) | Target::HostSource(_) | Target::HostSink(_), _) => {
                return Err(mismatch());
            }
        };

        let ep = &mut self.endpoints[id.index()];
        if append {
            if direction == Direction::Read && !ep.bindings.is_empty() {
                return Err(ConfigError::ReadFanOut { tag, name });
            }
        } else {
            ep.bindings.clear();
        }
        ep.bindings.push(Binding { route, field });
        Ok(())
    }

    /// Required endpoints that are still unbound.
    pub(crate) fn unbound_required(&self, devices: &DeviceTable) -> Vec<ConfigError> {
        self.iter()
            .filter(|(_, ep)| ep.spec.required && ep.bindings.is_empty())
            .map(|(_, ep)| ConfigError::UnboundEndpoint {
                tag: devices.tag(ep.owner).to_owned(),
                name: ep.spec.name.clone(),
            })
            .collect()
    }
}
