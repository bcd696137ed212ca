//! Small devices shared by the integration tests.

#![allow(dead_code)]

use emu_machine::{
    AccessWidth, Capabilities, Configurator, Context, Device, Observable, RegionId, SpaceConfig,
    Value,
};

/// Owns one address space and does nothing else.
pub struct Host {
    space: Option<SpaceConfig>,
}

impl Host {
    pub fn new(space: SpaceConfig) -> Self {
        Self { space: Some(space) }
    }

    /// A 16-bit, byte-wide, little-endian `program` space.
    pub fn program() -> Self {
        Self::new(SpaceConfig::new("program", 16, AccessWidth::Byte))
    }
}

impl Device for Host {
    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    fn configure(&mut self, cfg: &mut Configurator<'_>) {
        if let Some(space) = self.space.take() {
            cfg.address_space(space);
        }
    }
}

impl Observable for Host {
    fn query(&self, _path: &str) -> Option<Value> {
        None
    }

    fn query_paths(&self) -> &'static [&'static str] {
        &[]
    }
}

/// A register block: reads return `0x80 | offset`, writes are recorded.
#[derive(Default)]
pub struct Regs {
    pub writes: Vec<(u64, AccessWidth, u64)>,
}

impl Device for Regs {
    fn capabilities(&self) -> Capabilities {
        Capabilities::MEMORY
    }

    fn configure(&mut self, cfg: &mut Configurator<'_>) {
        cfg.region("regs");
    }

    fn read(
        &mut self,
        _ctx: &mut Context<'_>,
        _region: RegionId,
        offset: u64,
        _width: AccessWidth,
    ) -> u64 {
        0x80 | offset
    }

    fn write(
        &mut self,
        _ctx: &mut Context<'_>,
        _region: RegionId,
        offset: u64,
        width: AccessWidth,
        value: u64,
    ) {
        self.writes.push((offset, width, value));
    }
}

impl Observable for Regs {
    fn query(&self, path: &str) -> Option<Value> {
        match path {
            "writes" => Some(Value::U64(self.writes.len() as u64)),
            _ => None,
        }
    }

    fn query_paths(&self) -> &'static [&'static str] {
        &["writes"]
    }
}
