//! V.R. Technology VT1682 I/O port controller.
//!
//! Four 4-bit ports (A to D), each independently an input or an output,
//! behind three byte registers on the VT1682's main bus.
//!
//! # Registers
//!
//! | Addr    | Name     | Description                                  |
//! |---------|----------|----------------------------------------------|
//! | `$210D` | IOCONFIG | Direction and output enable, two bits a port |
//! | `$210E` | IOAB     | Port A (bits 0-3) and port B (bits 4-7) data |
//! | `$210F` | IOCD     | Port C (bits 0-3) and port D (bits 4-7) data |
//!
//! IOCONFIG bit pairs: A = bits 0-1, B = 2-3, C = 4-5, D = 6-7. In each
//! pair the low bit (OE) makes the port an output and the high bit (ENB)
//! lets the output latch drive the port's `_out` line.
//!
//! Reading a data register returns the latch for output ports and a live
//! sample of the `_in` line for input ports. Writes only reach the latches
//! of output ports.

use emu_core::{AccessWidth, Observable, Value};
use emu_machine::{
    Capabilities, Configurator, Context, Device, DeviceTypes, EndpointId, Handler, Install,
    MachineBuilder, RegionId,
};

/// Address of IOCONFIG; the data registers follow it.
pub const BASE: u64 = 0x210D;

const REG_IOCONFIG: u64 = 0;
const REG_IOAB: u64 = 1;
const REG_IOCD: u64 = 2;

/// Type name used in machine descriptions.
pub const TYPE_NAME: &str = "vt1682-io";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    A = 0,
    B = 1,
    C = 2,
    D = 3,
}

impl Port {
    pub const ALL: [Port; 4] = [Port::A, Port::B, Port::C, Port::D];

    const fn index(self) -> usize {
        self as usize
    }

    /// OE bit in IOCONFIG.
    const fn output_bit(self) -> u8 {
        1 << (self as u8 * 2)
    }

    /// ENB bit in IOCONFIG.
    const fn enable_bit(self) -> u8 {
        2 << (self as u8 * 2)
    }

    const fn name(self) -> &'static str {
        match self {
            Port::A => "a",
            Port::B => "b",
            Port::C => "c",
            Port::D => "d",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Lines {
    outputs: [EndpointId; 4],
    inputs: [EndpointId; 4],
}

/// VT1682 I/O port controller.
#[derive(Debug, Default)]
pub struct Vt1682Io {
    ioconfig: u8,
    /// Output latches, one nibble per port.
    latch: [u8; 4],
    lines: Option<Lines>,
    regs: Option<RegionId>,
}

impl Vt1682Io {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn ioconfig(&self) -> u8 {
        self.ioconfig
    }

    #[must_use]
    pub fn latch(&self, port: Port) -> u8 {
        self.latch[port.index()]
    }

    #[must_use]
    pub fn is_output(&self, port: Port) -> bool {
        self.ioconfig & port.output_bit() != 0
    }

    /// Output with ENB set: the latch is on the `_out` line.
    #[must_use]
    pub fn drives(&self, port: Port) -> bool {
        drives(self.ioconfig, port)
    }

    /// Map the three registers at `$210D-$210F` of `owner`'s `space`.
    pub fn install(builder: &mut MachineBuilder, tag: &str, owner: &str, space: &str) {
        builder.install(
            owner,
            space,
            Install::new(BASE, BASE + REG_IOCD, Handler::device(tag, "regs"))
                .width(AccessWidth::Byte),
        );
    }

    /// Make the device available to machine descriptions as `vt1682-io`.
    pub fn register(types: &mut DeviceTypes) {
        types.register(TYPE_NAME, |_| Ok(Box::new(Vt1682Io::new())));
    }

    fn read_data(&mut self, ctx: &mut Context<'_>, low: Port, high: Port) -> u8 {
        self.nibble(ctx, low) | (self.nibble(ctx, high) << 4)
    }

    fn nibble(&mut self, ctx: &mut Context<'_>, port: Port) -> u8 {
        if self.is_output(port) {
            return self.latch[port.index()];
        }
        match self.lines {
            Some(lines) => (ctx.read_line(lines.inputs[port.index()]) & 0x0F) as u8,
            None => 0x0F,
        }
    }

    fn write_data(&mut self, ctx: &mut Context<'_>, low: Port, high: Port, data: u8) {
        self.latch_nibble(ctx, low, data & 0x0F);
        self.latch_nibble(ctx, high, data >> 4);
    }

    fn latch_nibble(&mut self, ctx: &mut Context<'_>, port: Port, value: u8) {
        if !self.is_output(port) {
            return;
        }
        self.latch[port.index()] = value;
        if self.drives(port) {
            self.drive(ctx, port);
        }
    }

    fn write_ioconfig(&mut self, ctx: &mut Context<'_>, data: u8) {
        let old = self.ioconfig;
        self.ioconfig = data;
        for port in Port::ALL {
            if drives(data, port) && !drives(old, port) {
                self.drive(ctx, port);
            }
        }
    }

    fn drive(&mut self, ctx: &mut Context<'_>, port: Port) {
        if let Some(lines) = self.lines {
            ctx.write_line(
                lines.outputs[port.index()],
                u32::from(self.latch[port.index()]),
            );
        }
    }
}

const fn drives(ioconfig: u8, port: Port) -> bool {
    let bits = port.output_bit() | port.enable_bit();
    ioconfig & bits == bits
}

impl Device for Vt1682Io {
    fn capabilities(&self) -> Capabilities {
        Capabilities::RESET | Capabilities::MEMORY
    }

    fn configure(&mut self, cfg: &mut Configurator<'_>) {
        let outputs = Port::ALL.map(|p| cfg.write_line(&format!("port{}_out", p.name()), 4));
        let inputs = Port::ALL.map(|p| cfg.read_line(&format!("port{}_in", p.name()), 4));
        self.lines = Some(Lines { outputs, inputs });
        self.regs = Some(cfg.region("regs"));
    }

    fn reset(&mut self, _ctx: &mut Context<'_>) {
        self.ioconfig = 0;
        self.latch = [0; 4];
    }

    fn read(
        &mut self,
        ctx: &mut Context<'_>,
        region: RegionId,
        offset: u64,
        width: AccessWidth,
    ) -> u64 {
        if Some(region) != self.regs {
            return width.mask();
        }
        let value = match offset {
            REG_IOCONFIG => self.ioconfig,
            REG_IOAB => self.read_data(ctx, Port::A, Port::B),
            REG_IOCD => self.read_data(ctx, Port::C, Port::D),
            _ => {
                log::warn!("{}: read from unknown register {offset}", ctx.tag());
                0xFF
            }
        };
        u64::from(value)
    }

    fn write(
        &mut self,
        ctx: &mut Context<'_>,
        region: RegionId,
        offset: u64,
        _width: AccessWidth,
        value: u64,
    ) {
        if Some(region) != self.regs {
            return;
        }
        let data = value as u8;
        match offset {
            REG_IOCONFIG => self.write_ioconfig(ctx, data),
            REG_IOAB => self.write_data(ctx, Port::A, Port::B, data),
            REG_IOCD => self.write_data(ctx, Port::C, Port::D, data),
            _ => log::warn!("{}: write of {data:#04X} to unknown register {offset}", ctx.tag()),
        }
    }
}

impl Observable for Vt1682Io {
    fn query(&self, path: &str) -> Option<Value> {
        let port = |name: &str| Port::ALL.into_iter().find(|p| p.name() == name);
        match path {
            "ioconfig" => Some(self.ioconfig.into()),
            _ => {
                let (field, name) = path.split_once('.')?;
                let p = port(name)?;
                match field {
                    "latch" => Some(self.latch(p).into()),
                    "output" => Some(self.is_output(p).into()),
                    "drive" => Some(self.drives(p).into()),
                    _ => None,
                }
            }
        }
    }

    fn query_paths(&self) -> &'static [&'static str] {
        &[
            "ioconfig", "latch.a", "latch.b", "latch.c", "latch.d", "output.a", "output.b",
            "output.c", "output.d", "drive.a", "drive.b", "drive.c", "drive.d",
        ]
    }
}
