//! Port behaviour seen from the main bus.
//!
//! A bare `soc` device owns a 16-bit program space with the I/O controller
//! mapped at `$210D-$210F`. The host drives registers through the machine
//! and observes the `_out` lines through host sinks.

use std::cell::RefCell;
use std::rc::Rc;

use emu_core::{AccessWidth, Observable, Value};
use emu_machine::{
    Capabilities, Clock, Configurator, Device, DeviceTypes, Machine, MachineBuilder,
    MachineDescription, SpaceConfig, SpaceId, Target,
};
use vrt_vt1682_io::{Port, Vt1682Io};

const IOCONFIG: u64 = 0x210D;
const IOAB: u64 = 0x210E;
const IOCD: u64 = 0x210F;

struct Soc;

impl Device for Soc {
    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    fn configure(&mut self, cfg: &mut Configurator<'_>) {
        cfg.address_space(SpaceConfig::new("program", 16, AccessWidth::Byte));
    }
}

impl Observable for Soc {
    fn query(&self, _path: &str) -> Option<Value> {
        None
    }

    fn query_paths(&self) -> &'static [&'static str] {
        &[]
    }
}

type Log = Rc<RefCell<Vec<u32>>>;

fn recorder(log: &Log) -> Target {
    let log = Rc::clone(log);
    Target::host_sink(move |v| log.borrow_mut().push(v))
}

fn builder() -> MachineBuilder {
    let mut builder = MachineBuilder::default();
    builder.add_device("soc", Clock::new(21_477_272), Soc).unwrap();
    builder.add_device("soc:io", Clock::NONE, Vt1682Io::new()).unwrap();
    Vt1682Io::install(&mut builder, "soc:io", "soc", "program");
    builder
}

fn started(builder: MachineBuilder) -> (Machine, SpaceId) {
    let mut machine = builder.finalize().unwrap();
    machine.start().unwrap();
    let space = machine.space_id("soc", "program").unwrap();
    (machine, space)
}

fn io(machine: &Machine) -> &Vt1682Io {
    machine.device::<Vt1682Io>("soc:io").unwrap()
}

#[test]
fn all_inputs_sample_their_lines() {
    let mut b = builder();
    b.bind("soc:io", "porta_in", Target::Constant(0x5));
    b.bind("soc:io", "portb_in", Target::Constant(0xA));
    b.bind("soc:io", "portc_in", Target::Constant(0x1));
    b.bind("soc:io", "portd_in", Target::Constant(0x2));
    let (mut m, space) = started(b);

    m.write_u8(space, IOCONFIG, 0x00);
    assert_eq!(m.read_u8(space, IOAB), 0xA5);
    assert_eq!(m.read_u8(space, IOCD), 0x21);
}

#[test]
fn input_lines_are_sampled_live() {
    let level = Rc::new(RefCell::new(0x3u32));
    let mut b = builder();
    let source = Rc::clone(&level);
    b.bind("soc:io", "portc_in", Target::host_source(move || *source.borrow()));
    let (mut m, space) = started(b);

    assert_eq!(m.read_u8(space, IOCD) & 0x0F, 0x3);
    *level.borrow_mut() = 0xC;
    assert_eq!(m.read_u8(space, IOCD) & 0x0F, 0xC);
    // Wider values are cut to the line width.
    *level.borrow_mut() = 0x1F7;
    assert_eq!(m.read_u8(space, IOCD) & 0x0F, 0x7);
}

#[test]
fn unbound_inputs_float_high() {
    let (mut m, space) = started(builder());
    assert_eq!(m.read_u8(space, IOAB), 0xFF);
    assert_eq!(m.read_u8(space, IOCD), 0xFF);
    assert_eq!(m.stats().floating_reads, 4);
}

#[test]
fn driven_outputs_round_trip() {
    let (a, b_out, c, d): (Log, Log, Log, Log) = Default::default();
    let mut b = builder();
    b.bind("soc:io", "porta_out", recorder(&a));
    b.bind("soc:io", "portb_out", recorder(&b_out));
    b.bind("soc:io", "portc_out", recorder(&c));
    b.bind("soc:io", "portd_out", recorder(&d));
    let (mut m, space) = started(b);

    m.write_u8(space, IOCONFIG, 0xFF);
    // Enabling drives the (still zero) latches once.
    assert_eq!(*a.borrow(), vec![0]);

    m.write_u8(space, IOAB, 0x3C);
    m.write_u8(space, IOCD, 0x96);
    assert_eq!(m.read_u8(space, IOAB), 0x3C);
    assert_eq!(m.read_u8(space, IOCD), 0x96);
    assert_eq!(m.read_u8(space, IOCONFIG), 0xFF);

    assert_eq!(*a.borrow(), vec![0, 0xC]);
    assert_eq!(*b_out.borrow(), vec![0, 0x3]);
    assert_eq!(*c.borrow(), vec![0, 0x6]);
    assert_eq!(*d.borrow(), vec![0, 0x9]);
}

#[test]
fn output_without_enable_latches_silently() {
    let a = Log::default();
    let mut b = builder();
    b.bind("soc:io", "porta_out", recorder(&a));
    let (mut m, space) = started(b);

    m.write_u8(space, IOCONFIG, 0x01);
    m.write_u8(space, IOAB, 0x07);
    assert!(a.borrow().is_empty());
    assert_eq!(io(&m).latch(Port::A), 0x7);
    assert_eq!(m.read_u8(space, IOAB) & 0x0F, 0x7);

    // Setting ENB puts the latch on the line.
    m.write_u8(space, IOCONFIG, 0x03);
    assert_eq!(*a.borrow(), vec![0x7]);
    // Rewriting the same configuration does not drive again.
    m.write_u8(space, IOCONFIG, 0x03);
    assert_eq!(*a.borrow(), vec![0x7]);
}

#[test]
fn writes_to_input_ports_are_ignored() {
    let mut b = builder();
    b.bind("soc:io", "portb_in", Target::Constant(0x9));
    let (mut m, space) = started(b);

    // A is an output, B stays an input.
    m.write_u8(space, IOCONFIG, 0x03);
    m.write_u8(space, IOAB, 0xE4);
    assert_eq!(io(&m).latch(Port::A), 0x4);
    assert_eq!(io(&m).latch(Port::B), 0x0);
    assert_eq!(m.read_u8(space, IOAB), 0x94);
}

#[test]
fn mixed_directions_on_one_register() {
    let d = Log::default();
    let mut b = builder();
    b.bind("soc:io", "portc_in", Target::Constant(0x6));
    b.bind("soc:io", "portd_out", recorder(&d));
    let (mut m, space) = started(b);

    m.write_u8(space, IOCONFIG, 0xC0);
    m.write_u8(space, IOCD, 0xAB);
    assert_eq!(m.read_u8(space, IOCD), 0xA6);
    assert_eq!(*d.borrow(), vec![0x0, 0xA]);
}

#[test]
fn reset_is_idempotent() {
    let (mut m, space) = started(builder());
    m.write_u8(space, IOCONFIG, 0x55);
    m.write_u8(space, IOAB, 0x12);
    m.write_u8(space, IOCD, 0x34);
    assert_eq!(io(&m).ioconfig(), 0x55);

    m.reset().unwrap();
    let after_one = (io(&m).ioconfig(), Port::ALL.map(|p| io(&m).latch(p)));
    m.reset().unwrap();
    let after_two = (io(&m).ioconfig(), Port::ALL.map(|p| io(&m).latch(p)));
    assert_eq!(after_one, (0, [0; 4]));
    assert_eq!(after_one, after_two);

    m.reset_device("soc:io").unwrap();
    assert_eq!(m.read_u8(space, IOCONFIG), 0);
}

#[test]
fn state_is_observable() {
    let (mut m, space) = started(builder());
    m.write_u8(space, IOCONFIG, 0x0C);
    m.write_u8(space, IOAB, 0x50);
    assert_eq!(m.query("soc:io", "ioconfig"), Some(Value::U8(0x0C)));
    assert_eq!(m.query("soc:io", "output.b"), Some(Value::Bool(true)));
    assert_eq!(m.query("soc:io", "drive.b"), Some(Value::Bool(true)));
    assert_eq!(m.query("soc:io", "latch.b"), Some(Value::U8(0x5)));
    assert_eq!(m.query("soc:io", "output.a"), Some(Value::Bool(false)));
}

#[test]
fn wider_accesses_split_into_bytes() {
    let mut b = builder();
    b.bind("soc:io", "porta_in", Target::Constant(0x1));
    b.bind("soc:io", "portb_in", Target::Constant(0x2));
    let (mut m, space) = started(b);
    m.write_u8(space, IOCONFIG, 0xF0);
    m.write_u8(space, IOCD, 0x87);
    // Little-endian word at IOAB covers IOAB then IOCD.
    assert_eq!(m.read(space, IOAB, AccessWidth::Word), 0x8721);
}

#[test]
fn built_from_a_description() {
    let text = r#"{
        "devices": [
            { "tag": "soc", "type": "soc", "clock": 21477272 },
            { "tag": "soc:io", "type": "vt1682-io" }
        ],
        "installs": [
            { "owner": "soc", "space": "program", "start": 8461, "end": 8463, "width": "byte",
              "handler": { "type": "device", "tag": "soc:io", "region": "regs" } }
        ],
        "bindings": [
            { "tag": "soc:io", "endpoint": "porta_in",
              "target": { "type": "constant", "value": 13 } }
        ]
    }"#;
    let mut types = DeviceTypes::new();
    types.register("soc", |_| Ok(Box::new(Soc)));
    Vt1682Io::register(&mut types);

    let desc = MachineDescription::from_json(text).unwrap();
    let b = MachineBuilder::from_description(desc, &types).unwrap();
    let (mut m, space) = started(b);
    assert_eq!(m.read_u8(space, IOAB) & 0x0F, 0xD);
}

proptest::proptest! {
    #[test]
    fn data_reads_mix_latches_and_inputs(
        config in 0u8..,
        data in 0u8..,
        a in 0u32..16,
        b in 0u32..16,
    ) {
        let mut builder = builder();
        builder.bind("soc:io", "porta_in", Target::Constant(a));
        builder.bind("soc:io", "portb_in", Target::Constant(b));
        let (mut m, space) = started(builder);

        m.write_u8(space, IOCONFIG, config);
        m.write_u8(space, IOAB, data);
        let low = if config & 0x01 != 0 { data & 0x0F } else { a as u8 };
        let high = if config & 0x04 != 0 { data >> 4 } else { b as u8 };
        proptest::prop_assert_eq!(m.read_u8(space, IOAB), low | (high << 4));
    }
}
