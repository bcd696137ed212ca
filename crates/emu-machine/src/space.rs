//! Address spaces: decoded maps from addresses to handlers.
//!
//! Each space keeps two segment maps, one for reads and one for writes.
//! Installs are painted onto them in `(priority, install order)` order, so
//! a later or higher-priority install shadows whatever it overlaps and the
//! earlier entry keeps the parts it still owns. Lookups are a single
//! `BTreeMap` range query.

use std::collections::BTreeMap;

use emu_core::AccessWidth;

use crate::device::{Capabilities, DeviceId, DeviceTable, RegionId};
use crate::error::ConfigError;

/// Largest RAM backing a single install may ask for.
pub const MAX_RAM_BYTES: u64 = 1 << 30;

/// Handle to an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpaceId(pub(crate) u16);

impl SpaceId {
    pub(crate) fn index(self) -> usize {
        usize::from(self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Endianness {
    #[default]
    Little,
    Big,
}

/// What an unmapped read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Unmap {
    /// All ones, like an undriven pulled-up data bus.
    #[default]
    High,
    Low,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpaceConfig {
    pub name: String,
    /// 1..=48.
    pub address_bits: u8,
    /// Native bus width. No handler may be wider.
    pub data_width: AccessWidth,
    pub endianness: Endianness,
    pub unmap: Unmap,
}

impl SpaceConfig {
    #[must_use]
    pub fn new(name: impl Into<String>, address_bits: u8, data_width: AccessWidth) -> Self {
        Self {
            name: name.into(),
            address_bits,
            data_width,
            endianness: Endianness::Little,
            unmap: Unmap::High,
        }
    }

    #[must_use]
    pub fn big_endian(mut self) -> Self {
        self.endianness = Endianness::Big;
        self
    }

    #[must_use]
    pub fn unmap_low(mut self) -> Self {
        self.unmap = Unmap::Low;
        self
    }

    #[must_use]
    pub fn address_mask(&self) -> u64 {
        match self.address_bits {
            0 => 0,
            bits @ 1..=63 => (1u64 << bits) - 1,
            _ => u64::MAX,
        }
    }
}

/// Which side of the map an install covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Access {
    Read,
    Write,
    #[default]
    ReadWrite,
}

impl Access {
    fn covers(self, side: Side) -> bool {
        matches!(
            (self, side),
            (Self::ReadWrite, _) | (Self::Read, Side::Read) | (Self::Write, Side::Write)
        )
    }

    fn shares_side(self, other: Self) -> bool {
        [Side::Read, Side::Write]
            .into_iter()
            .any(|side| self.covers(side) && other.covers(side))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Read,
    Write,
}

/// What an address range is backed by.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "lowercase"))]
pub enum Handler {
    /// A region declared by a `MEMORY` device. Offsets are relative to the
    /// start of the range.
    Device { tag: String, region: String },
    /// Zero-filled storage sized to the range.
    Ram,
    /// Read-only storage. Must be exactly as long as the range; writes are
    /// dropped.
    Rom { data: Vec<u8> },
    /// Reads return the unmap value and writes are dropped, silently.
    Nop,
    /// Punches a hole: accesses behave as if nothing were mapped.
    Unmap,
}

impl Handler {
    #[must_use]
    pub fn device(tag: impl Into<String>, region: impl Into<String>) -> Self {
        Self::Device {
            tag: tag.into(),
            region: region.into(),
        }
    }

    #[must_use]
    pub fn rom(data: impl Into<Vec<u8>>) -> Self {
        Self::Rom { data: data.into() }
    }
}

/// One map entry: an inclusive range, a handler and how it competes with
/// overlapping entries.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Install {
    pub start: u64,
    pub end: u64,
    #[cfg_attr(feature = "serde", serde(default))]
    pub access: Access,
    /// Widest access the handler accepts. Defaults to the bus width; wider
    /// accesses are split.
    #[cfg_attr(feature = "serde", serde(default))]
    pub width: Option<AccessWidth>,
    pub handler: Handler,
    /// Explicit priority. `None` behaves as 0 but never conflicts.
    #[cfg_attr(feature = "serde", serde(default))]
    pub priority: Option<i32>,
}

impl Install {
    #[must_use]
    pub fn new(start: u64, end: u64, handler: Handler) -> Self {
        Self {
            start,
            end,
            access: Access::ReadWrite,
            width: None,
            handler,
            priority: None,
        }
    }

    #[must_use]
    pub fn access(mut self, access: Access) -> Self {
        self.access = access;
        self
    }

    #[must_use]
    pub fn read_only(self) -> Self {
        self.access(Access::Read)
    }

    #[must_use]
    pub fn write_only(self) -> Self {
        self.access(Access::Write)
    }

    #[must_use]
    pub fn width(mut self, width: AccessWidth) -> Self {
        self.width = Some(width);
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }
}

/// A space as declared by its owner, before anything is installed.
#[derive(Debug)]
pub(crate) struct SpaceDecl {
    pub(crate) owner: DeviceId,
    pub(crate) config: SpaceConfig,
}

/// An install waiting to be resolved.
#[derive(Debug)]
pub(crate) struct InstallRequest {
    pub(crate) owner: String,
    pub(crate) space: String,
    pub(crate) install: Install,
}

#[derive(Debug)]
pub(crate) enum EntryKind {
    Device { device: DeviceId, region: RegionId },
    Storage { data: Vec<u8>, writable: bool },
    Nop,
    Unmap,
}

#[derive(Debug)]
pub(crate) struct Entry {
    pub(crate) start: u64,
    pub(crate) end: u64,
    pub(crate) width: AccessWidth,
    pub(crate) kind: EntryKind,
    access: Access,
    priority: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    end: u64,
    entry: usize,
}

/// Result of a lookup: the winning entry and where its segment ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Hit {
    pub(crate) entry: usize,
    pub(crate) segment_end: u64,
}

#[derive(Debug)]
pub(crate) struct AddressSpace {
    pub(crate) owner: DeviceId,
    pub(crate) config: SpaceConfig,
    entries: Vec<Entry>,
    read_map: BTreeMap<u64, Segment>,
    write_map: BTreeMap<u64, Segment>,
}

impl AddressSpace {
    fn new(decl: SpaceDecl) -> Self {
        Self {
            owner: decl.owner,
            config: decl.config,
            entries: Vec::new(),
            read_map: BTreeMap::new(),
            write_map: BTreeMap::new(),
        }
    }

    pub(crate) fn address_mask(&self) -> u64 {
        self.config.address_mask()
    }

    pub(crate) fn unmap_value(&self, width: AccessWidth) -> u64 {
        match self.config.unmap {
            Unmap::High => width.mask(),
            Unmap::Low => 0,
        }
    }

    pub(crate) fn entry(&self, index: usize) -> &Entry {
        &self.entries[index]
    }

    pub(crate) fn lookup(&self, side: Side, address: u64) -> Option<Hit> {
        let map = match side {
            Side::Read => &self.read_map,
            Side::Write => &self.write_map,
        };
        let (_, segment) = map.range(..=address).next_back()?;
        (segment.end >= address).then_some(Hit {
            entry: segment.entry,
            segment_end: segment.end,
        })
    }

    /// Read `width` bytes of RAM or ROM starting at `address`.
    pub(crate) fn storage_read(&self, index: usize, address: u64, width: AccessWidth) -> u64 {
        let entry = &self.entries[index];
        let EntryKind::Storage { data, .. } = &entry.kind else {
            return self.unmap_value(width);
        };
        let Some(bytes) = storage_slice(data, address - entry.start, width) else {
            return self.unmap_value(width);
        };
        match self.config.endianness {
            Endianness::Little => bytes
                .iter()
                .rev()
                .fold(0, |acc, &b| (acc << 8) | u64::from(b)),
            Endianness::Big => bytes.iter().fold(0, |acc, &b| (acc << 8) | u64::from(b)),
        }
    }

    /// Write the byte lanes of `value` selected by `mask`. Returns `false`
    /// for read-only storage.
    pub(crate) fn storage_write(
        &mut self,
        index: usize,
        address: u64,
        width: AccessWidth,
        value: u64,
        mask: u64,
    ) -> bool {
        let endianness = self.config.endianness;
        let entry = &mut self.entries[index];
        let offset = address - entry.start;
        let EntryKind::Storage { data, writable } = &mut entry.kind else {
            return false;
        };
        if !*writable {
            return false;
        }
        let Some(bytes) = storage_slice_mut(data, offset, width) else {
            return false;
        };
        let n = bytes.len();
        for (i, byte) in bytes.iter_mut().enumerate() {
            let lane = match endianness {
                Endianness::Little => i,
                Endianness::Big => n - 1 - i,
            };
            let v = (value >> (lane * 8)) as u8;
            let m = (mask >> (lane * 8)) as u8;
            *byte = (*byte & !m) | (v & m);
        }
        true
    }

    fn paint(&mut self, side: Side, start: u64, end: u64, entry: usize) {
        let map = match side {
            Side::Read => &mut self.read_map,
            Side::Write => &mut self.write_map,
        };
        // Trim a segment that begins before the new range and reaches into it.
        if let Some((&first, &segment)) = map.range(..start).next_back() {
            if segment.end >= start {
                map.insert(
                    first,
                    Segment {
                        end: start - 1,
                        entry: segment.entry,
                    },
                );
                if segment.end > end {
                    map.insert(
                        end + 1,
                        Segment {
                            end: segment.end,
                            entry: segment.entry,
                        },
                    );
                }
            }
        }
        let covered: Vec<u64> = map.range(start..=end).map(|(&s, _)| s).collect();
        for s in covered {
            if let Some(segment) = map.remove(&s) {
                if segment.end > end {
                    map.insert(
                        end + 1,
                        Segment {
                            end: segment.end,
                            entry: segment.entry,
                        },
                    );
                }
            }
        }
        map.insert(start, Segment { end, entry });
    }

    /// Paint every entry onto both maps in precedence order.
    fn rebuild(&mut self) {
        self.read_map.clear();
        self.write_map.clear();
        let mut order: Vec<usize> = (0..self.entries.len()).collect();
        // Stable sort keeps install order among equal priorities.
        order.sort_by_key(|&i| self.entries[i].priority.unwrap_or(0));
        for i in order {
            let (start, end, access) = {
                let e = &self.entries[i];
                (e.start, e.end, e.access)
            };
            for side in [Side::Read, Side::Write] {
                if access.covers(side) {
                    self.paint(side, start, end, i);
                }
            }
        }
    }

    fn conflicts(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        for (i, a) in self.entries.iter().enumerate() {
            for b in &self.entries[i + 1..] {
                let (Some(pa), Some(pb)) = (a.priority, b.priority) else {
                    continue;
                };
                if pa == pb
                    && a.start <= b.end
                    && b.start <= a.end
                    && a.access.shares_side(b.access)
                {
                    errors.push(ConfigError::ConflictingPriority {
                        space: self.config.name.clone(),
                        priority: pa,
                        first_start: a.start,
                        first_end: a.end,
                        second_start: b.start,
                        second_end: b.end,
                    });
                }
            }
        }
        errors
    }
}

fn storage_slice(data: &[u8], offset: u64, width: AccessWidth) -> Option<&[u8]> {
    let start = usize::try_from(offset).ok()?;
    data.get(start..start + usize::from(width.bytes()))
}

fn storage_slice_mut(data: &mut [u8], offset: u64, width: AccessWidth) -> Option<&mut [u8]> {
    let start = usize::try_from(offset).ok()?;
    data.get_mut(start..start + usize::from(width.bytes()))
}

/// Turn declared spaces and pending installs into decoded maps.
///
/// Every problem is pushed onto `errors`; the returned spaces are only
/// meaningful if none were found.
pub(crate) fn build_spaces(
    decls: Vec<SpaceDecl>,
    installs: Vec<InstallRequest>,
    devices: &DeviceTable,
    errors: &mut Vec<ConfigError>,
) -> Vec<AddressSpace> {
    let mut spaces: Vec<AddressSpace> = decls.into_iter().map(AddressSpace::new).collect();

    for request in installs {
        match resolve_install(&spaces, devices, request) {
            Ok((space, entry)) => spaces[space].entries.push(entry),
            Err(error) => errors.push(error),
        }
    }

    for space in &mut spaces {
        errors.extend(space.conflicts());
        space.rebuild();
    }
    spaces
}

/// Find a space by owner and name.
pub(crate) fn find_space(
    spaces: &[AddressSpace],
    devices: &DeviceTable,
    owner: &str,
    name: &str,
) -> Option<SpaceId> {
    let owner = devices.lookup(owner)?;
    devices
        .get(owner)?
        .decl
        .spaces
        .iter()
        .copied()
        .find(|id| spaces.get(id.index()).is_some_and(|s| s.config.name == name))
}

fn resolve_install(
    spaces: &[AddressSpace],
    devices: &DeviceTable,
    request: InstallRequest,
) -> Result<(usize, Entry), ConfigError> {
    let InstallRequest {
        owner,
        space: space_name,
        install,
    } = request;
    if devices.lookup(&owner).is_none() {
        return Err(ConfigError::UnknownDevice { tag: owner });
    }
    let id = find_space(spaces, devices, &owner, &space_name).ok_or_else(|| {
        ConfigError::UnknownSpace {
            tag: owner.clone(),
            space: space_name.clone(),
        }
    })?;
    let config = &spaces[id.index()].config;

    if install.start > install.end || install.end > config.address_mask() {
        return Err(ConfigError::InvalidRange {
            space: space_name,
            start: install.start,
            end: install.end,
        });
    }
    let width = install.width.unwrap_or(config.data_width);
    if width > config.data_width {
        return Err(ConfigError::HandlerTooWide {
            space: space_name,
            start: install.start,
            width: width.bytes(),
            bus: config.data_width.bytes(),
        });
    }

    let length = install.end - install.start + 1;
    let kind = match install.handler {
        Handler::Device { tag, region } => {
            let device = devices
                .lookup(&tag)
                .ok_or_else(|| ConfigError::UnknownDevice { tag: tag.clone() })?;
            let slot = devices
                .get(device)
                .ok_or_else(|| ConfigError::UnknownDevice { tag: tag.clone() })?;
            if !slot.caps.contains(Capabilities::MEMORY) {
                return Err(ConfigError::MissingCapability {
                    tag,
                    capability: "memory",
                });
            }
            let region = slot
                .decl
                .region(&region)
                .ok_or(ConfigError::UnknownRegion { tag, region })?;
            EntryKind::Device { device, region }
        }
        Handler::Ram => {
            let too_large = || ConfigError::StorageTooLarge {
                space: space_name.clone(),
                start: install.start,
                length,
                limit: MAX_RAM_BYTES,
            };
            if length > MAX_RAM_BYTES {
                return Err(too_large());
            }
            let size = usize::try_from(length).map_err(|_| too_large())?;
            let mut data = Vec::new();
            data.try_reserve_exact(size).map_err(|_| too_large())?;
            data.resize(size, 0);
            EntryKind::Storage {
                data,
                writable: true,
            }
        }
        Handler::Rom { data } => {
            if data.len() as u64 != length {
                return Err(ConfigError::StorageSize {
                    space: space_name,
                    start: install.start,
                    expected: length,
                    actual: data.len() as u64,
                });
            }
            EntryKind::Storage { data, writable: false }
        }
        Handler::Nop => EntryKind::Nop,
        Handler::Unmap => EntryKind::Unmap,
    };

    Ok((
        id.index(),
        Entry {
            start: install.start,
            end: install.end,
            width,
            kind,
            access: install.access,
            priority: install.priority,
        },
    ))
}
