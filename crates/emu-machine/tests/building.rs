//! Tree construction, binding rules and machine lifecycle.

mod common;

use std::cell::RefCell;
use std::rc::Rc;

use common::{Host, Regs};
use emu_machine::{
    AccessWidth, BitField, Capabilities, Clock, ConfigError, Configurator, Context, Device,
    DeviceState, DeviceTypes, EndpointId, Handler, Install, LineSpec, MachineBuilder,
    MachineConfig, MachineDescription, MachineError, Observable, Phase, RegionId, ResourceError,
    SinkId, SourceId, SpaceConfig, Target, Value,
};

/// Exposes a couple of lines and records what reaches its sink. Reading its
/// register samples `data`; writing it drives `irq`.
#[derive(Default)]
struct Pins {
    irq: Option<EndpointId>,
    data: Option<EndpointId>,
    sunk: Vec<u32>,
    source: u32,
}

impl Device for Pins {
    fn capabilities(&self) -> Capabilities {
        Capabilities::LINES | Capabilities::MEMORY
    }

    fn configure(&mut self, cfg: &mut Configurator<'_>) {
        self.irq = Some(cfg.write_line("irq", 1));
        self.data = Some(cfg.line(LineSpec::read("data", 8).floating(0x5A)));
        cfg.sink("ack");
        cfg.source("bus");
        cfg.region("regs");
        cfg.address_space(SpaceConfig::new("io", 8, AccessWidth::Dword));
    }

    fn read(
        &mut self,
        ctx: &mut Context<'_>,
        _region: RegionId,
        _offset: u64,
        _width: AccessWidth,
    ) -> u64 {
        self.data.map_or(0, |ep| u64::from(ctx.read_line(ep)))
    }

    fn write(
        &mut self,
        ctx: &mut Context<'_>,
        _region: RegionId,
        _offset: u64,
        _width: AccessWidth,
        value: u64,
    ) {
        if let Some(ep) = self.irq {
            ctx.write_line(ep, value as u32);
        }
    }

    fn sink_write(&mut self, _ctx: &mut Context<'_>, _sink: SinkId, value: u32) {
        self.sunk.push(value);
    }

    fn source_read(&mut self, _ctx: &mut Context<'_>, _source: SourceId) -> u32 {
        self.source
    }
}

impl Observable for Pins {
    fn query(&self, path: &str) -> Option<Value> {
        match path {
            "source" => Some(self.source.into()),
            _ => None,
        }
    }

    fn query_paths(&self) -> &'static [&'static str] {
        &["source"]
    }
}

/// Declares a required line and nothing else.
struct NeedsIrq;

impl Device for NeedsIrq {
    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    fn configure(&mut self, cfg: &mut Configurator<'_>) {
        cfg.line(LineSpec::read("irq", 1).required());
    }
}

impl Observable for NeedsIrq {
    fn query(&self, _path: &str) -> Option<Value> {
        None
    }

    fn query_paths(&self) -> &'static [&'static str] {
        &[]
    }
}

/// Map a device's register block into its own `io` space.
fn wire(b: &mut MachineBuilder, tag: &str) {
    b.install(tag, "io", Install::new(0, 3, Handler::device(tag, "regs")));
}

fn sample(m: &mut emu_machine::Machine, tag: &str) -> u32 {
    let space = m.space_id(tag, "io").unwrap();
    m.read(space, 0, AccessWidth::Dword) as u32
}

fn drive(m: &mut emu_machine::Machine, tag: &str, value: u32) {
    let space = m.space_id(tag, "io").unwrap();
    m.write(space, 0, AccessWidth::Dword, u64::from(value));
}

#[test]
fn configuration_errors_are_batched() {
    let mut b = MachineBuilder::default();
    b.add_device("cpu", Clock::new(1_000_000), Host::program()).unwrap();
    b.add_device("Bad Tag!", Clock::NONE, Host::program()).unwrap();
    b.add_device("cpu", Clock::NONE, Regs::default()).unwrap();
    b.add_device("ghost:pins", Clock::NONE, Pins::default()).unwrap();
    b.add_device("needs", Clock::NONE, NeedsIrq).unwrap();
    b.add_device("pins", Clock::NONE, Pins::default()).unwrap();
    b.bind("pins", "nmi", Target::Stub);
    b.bind("pins", "irq", Target::device("cpu", "irq"));
    b.bind("pins", "data", Target::Constant(2));
    b.append("pins", "data", Target::Constant(1));
    b.bind("ghost:pins", "data", Target::host_sink(|_| {}));
    b.bind("nobody", "irq", Target::Stub);

    let errors = b.finalize().err().unwrap();
    let has = |f: fn(&ConfigError) -> bool| errors.iter().any(f);
    assert!(has(|e| matches!(e, ConfigError::InvalidTag { .. })), "{errors}");
    assert!(has(|e| matches!(e, ConfigError::DuplicateTag { .. })), "{errors}");
    assert!(has(|e| matches!(e, ConfigError::UnknownParent { .. })), "{errors}");
    assert!(has(|e| matches!(e, ConfigError::UnknownEndpoint { .. })), "{errors}");
    assert!(has(|e| matches!(e, ConfigError::UnknownLineHandler { .. })), "{errors}");
    assert!(has(|e| matches!(e, ConfigError::DirectionMismatch { .. })), "{errors}");
    assert!(has(|e| matches!(e, ConfigError::ReadFanOut { .. })), "{errors}");
    assert!(has(|e| matches!(e, ConfigError::UnknownDevice { .. })), "{errors}");
    assert!(has(|e| matches!(e, ConfigError::UnboundEndpoint { .. })), "{errors}");
    assert!(errors.to_string().contains("configuration error(s)"));
}

#[test]
fn declaration_errors_surface_at_finalize() {
    struct Sloppy;
    impl Device for Sloppy {
        fn capabilities(&self) -> Capabilities {
            Capabilities::empty()
        }

        fn configure(&mut self, cfg: &mut Configurator<'_>) {
            cfg.read_line("x", 0);
            cfg.read_line("y", 4);
            cfg.write_line("y", 4);
            cfg.address_space(SpaceConfig::new("huge", 64, AccessWidth::Byte));
        }
    }
    impl Observable for Sloppy {
        fn query(&self, _path: &str) -> Option<Value> {
            None
        }

        fn query_paths(&self) -> &'static [&'static str] {
            &[]
        }
    }

    let mut b = MachineBuilder::default();
    b.add_device("sloppy", Clock::NONE, Sloppy).unwrap();
    let errors = b.finalize().err().unwrap();
    assert_eq!(errors.len(), 3, "{errors}");
    assert!(matches!(errors.errors()[0], ConfigError::LineWidth { width: 0, .. }));
    assert!(matches!(errors.errors()[1], ConfigError::DuplicateDeclaration { .. }));
    assert!(matches!(errors.errors()[2], ConfigError::AddressBits { bits: 64, .. }));
}

#[test]
fn sinks_need_the_line_capability() {
    struct Deaf;
    impl Device for Deaf {
        fn capabilities(&self) -> Capabilities {
            Capabilities::empty()
        }

        fn configure(&mut self, cfg: &mut Configurator<'_>) {
            cfg.sink("ack");
        }
    }
    impl Observable for Deaf {
        fn query(&self, _path: &str) -> Option<Value> {
            None
        }

        fn query_paths(&self) -> &'static [&'static str] {
            &[]
        }
    }

    let mut b = MachineBuilder::default();
    b.add_device("pins", Clock::NONE, Pins::default()).unwrap();
    b.add_device("deaf", Clock::NONE, Deaf).unwrap();
    b.bind("pins", "irq", Target::device("deaf", "ack"));
    let errors = b.finalize().err().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors.errors()[0],
        ConfigError::MissingCapability { capability: "line", .. }
    ));
}

#[test]
fn binding_closes_at_start() {
    let mut b = MachineBuilder::default();
    b.add_device("pins", Clock::NONE, Pins::default()).unwrap();
    let mut m = b.finalize().unwrap();
    assert_eq!(m.phase(), Phase::Configured);

    m.bind("pins", "irq", Target::Stub).unwrap();
    m.start().unwrap();
    assert!(matches!(
        m.bind("pins", "irq", Target::Stub),
        Err(ConfigError::BindAfterStart { .. })
    ));
}

#[test]
fn device_table_and_timer_pool_are_bounded() {
    let mut b = MachineBuilder::new(MachineConfig::default().with_max_devices(2));
    b.add_device("a", Clock::NONE, Regs::default()).unwrap();
    b.add_device("b", Clock::NONE, Regs::default()).unwrap();
    assert_eq!(
        b.add_device("c", Clock::NONE, Regs::default()),
        Err(ResourceError::DeviceTableFull { capacity: 2 })
    );

    struct Greedy;
    impl Device for Greedy {
        fn capabilities(&self) -> Capabilities {
            Capabilities::START | Capabilities::TIMERS
        }

        fn start(&mut self, ctx: &mut Context<'_>) -> Result<(), ResourceError> {
            for key in 0..3 {
                ctx.timer_alloc(key)?;
            }
            Ok(())
        }
    }
    impl Observable for Greedy {
        fn query(&self, _path: &str) -> Option<Value> {
            None
        }

        fn query_paths(&self) -> &'static [&'static str] {
            &[]
        }
    }

    let mut b = MachineBuilder::new(MachineConfig::default().with_max_timers(2));
    b.add_device("greedy", Clock::NONE, Greedy).unwrap();
    let mut m = b.finalize().unwrap();
    let err = m.start().unwrap_err();
    assert!(matches!(
        err,
        MachineError::Start {
            source: ResourceError::TimerPoolExhausted { capacity: 2 },
            ..
        }
    ));
    assert_eq!(m.phase(), Phase::Stopped);
    assert_eq!(Observable::query(&m, "timers.live"), Some(Value::U64(0)));
    assert_eq!(m.state("greedy"), Some(DeviceState::Stopped));
    assert!(matches!(m.run_for(emu_machine::EmuTime::from_micros(1)), Err(MachineError::Stopped)));
}

#[test]
fn unbound_read_lines_float() {
    let mut b = MachineBuilder::default();
    b.add_device("pins", Clock::NONE, Pins::default()).unwrap();
    wire(&mut b, "pins");
    let mut m = b.finalize().unwrap();
    m.start().unwrap();

    assert_eq!(sample(&mut m, "pins"), 0x5A);
    assert_eq!(m.stats().floating_reads, 1);
}

#[test]
fn read_lines_pull_through_bit_fields() {
    let mut b = MachineBuilder::default();
    b.add_device("pins", Clock::NONE, Pins::default()).unwrap();
    b.add_device("src", Clock::NONE, Pins::default()).unwrap();
    b.bind_field("pins", "data", Target::device("src", "bus"), BitField::new(8, 0xFF));
    wire(&mut b, "pins");
    let mut m = b.finalize().unwrap();
    m.start().unwrap();

    m.device_mut::<Pins>("src").unwrap().source = 0x00AB_CD00;
    assert_eq!(sample(&mut m, "pins"), 0xCD);
    assert_eq!(m.stats().floating_reads, 0);
}

#[test]
fn write_lines_fan_out_through_bit_fields() {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let log = Rc::clone(&seen);
    let mut b = MachineBuilder::default();
    b.add_device("pins", Clock::NONE, Pins::default()).unwrap();
    b.add_device("a", Clock::NONE, Pins::default()).unwrap();
    b.bind_field("pins", "irq", Target::device("a", "ack"), BitField::bit(3));
    b.append("pins", "irq", Target::host_sink(move |v| log.borrow_mut().push(v)));
    b.append("pins", "irq", Target::Stub);
    wire(&mut b, "pins");
    let mut m = b.finalize().unwrap();
    m.start().unwrap();

    drive(&mut m, "pins", 0xFF);

    assert_eq!(m.device::<Pins>("a").unwrap().sunk, [0b1000]);
    assert_eq!(*seen.borrow(), [1]);
}

/// Holds endpoints that belong to another device and tries to use them.
#[derive(Default)]
struct Stranger {
    read: Option<EndpointId>,
    write: Option<EndpointId>,
}

impl Device for Stranger {
    fn capabilities(&self) -> Capabilities {
        Capabilities::MEMORY
    }

    fn configure(&mut self, cfg: &mut Configurator<'_>) {
        cfg.region("regs");
        cfg.address_space(SpaceConfig::new("io", 8, AccessWidth::Dword));
    }

    fn read(
        &mut self,
        ctx: &mut Context<'_>,
        _region: RegionId,
        _offset: u64,
        _width: AccessWidth,
    ) -> u64 {
        self.read.map_or(0, |ep| u64::from(ctx.read_line(ep)))
    }

    fn write(
        &mut self,
        ctx: &mut Context<'_>,
        _region: RegionId,
        _offset: u64,
        _width: AccessWidth,
        value: u64,
    ) {
        if let Some(ep) = self.write {
            ctx.write_line(ep, value as u32);
        }
    }
}

impl Observable for Stranger {
    fn query(&self, _path: &str) -> Option<Value> {
        None
    }

    fn query_paths(&self) -> &'static [&'static str] {
        &[]
    }
}

#[test]
fn devices_only_use_their_own_endpoints() {
    let mut b = MachineBuilder::default();
    b.add_device("pins", Clock::NONE, Pins::default()).unwrap();
    b.add_device("a", Clock::NONE, Pins::default()).unwrap();
    b.add_device("stranger", Clock::NONE, Stranger::default()).unwrap();
    b.bind("pins", "irq", Target::device("a", "ack"));
    b.bind("pins", "data", Target::Constant(0x21));
    wire(&mut b, "pins");
    wire(&mut b, "stranger");
    let mut m = b.finalize().unwrap();
    m.start().unwrap();

    let pins = m.device::<Pins>("pins").unwrap();
    let (irq, data) = (pins.irq, pins.data);
    let stranger = m.device_mut::<Stranger>("stranger").unwrap();
    stranger.read = data;
    stranger.write = irq;

    // Someone else's endpoint reads as floating and drives nothing.
    assert_eq!(sample(&mut m, "stranger"), 0x5A);
    drive(&mut m, "stranger", 1);
    assert!(m.device::<Pins>("a").unwrap().sunk.is_empty());
    assert_eq!(m.stats().floating_reads, 0);

    // The owner still sees its bindings.
    assert_eq!(sample(&mut m, "pins"), 0x21);
    drive(&mut m, "pins", 1);
    assert_eq!(m.device::<Pins>("a").unwrap().sunk, [1]);
}

#[test]
fn host_can_poke_sinks_directly() {
    let mut b = MachineBuilder::default();
    b.add_device("pins", Clock::NONE, Pins::default()).unwrap();
    let mut m = b.finalize().unwrap();
    assert!(matches!(m.set_sink("pins", "ack", 1), Err(MachineError::NotStarted)));
    m.start().unwrap();
    m.set_sink("pins", "ack", 1).unwrap();
    m.set_sink("pins", "ack", 0).unwrap();
    assert_eq!(m.device::<Pins>("pins").unwrap().sunk, [1, 0]);
    assert!(matches!(m.set_sink("pins", "nope", 1), Err(MachineError::Config(_))));
    assert!(matches!(m.set_sink("ghost", "ack", 1), Err(MachineError::UnknownDevice(_))));
}

/// Reads its own space from inside its own read handler.
struct Echo;

impl Device for Echo {
    fn capabilities(&self) -> Capabilities {
        Capabilities::MEMORY
    }

    fn configure(&mut self, cfg: &mut Configurator<'_>) {
        cfg.region("regs");
        cfg.address_space(SpaceConfig::new("bus", 8, AccessWidth::Byte));
    }

    fn read(
        &mut self,
        ctx: &mut Context<'_>,
        _region: RegionId,
        offset: u64,
        width: AccessWidth,
    ) -> u64 {
        if offset == 0 {
            return 0x11;
        }
        let space = ctx.space("echo", "bus");
        space.map_or(0, |s| ctx.read(s, 0, width))
    }
}

impl Observable for Echo {
    fn query(&self, _path: &str) -> Option<Value> {
        None
    }

    fn query_paths(&self) -> &'static [&'static str] {
        &[]
    }
}

#[test]
fn reentrant_access_reads_as_unmapped() {
    let mut b = MachineBuilder::default();
    b.add_device("echo", Clock::NONE, Echo).unwrap();
    b.install("echo", "bus", Install::new(0, 1, Handler::device("echo", "regs")));
    let mut m = b.finalize().unwrap();
    m.start().unwrap();
    let space = m.space_id("echo", "bus").unwrap();

    assert_eq!(m.read_u8(space, 0), 0x11);
    assert_eq!(m.read_u8(space, 1), 0xFF);
    assert_eq!(m.stats().reentrant_accesses, 1);
}

/// Records lifecycle hooks into a shared log.
struct Lifecycle {
    log: Rc<RefCell<Vec<String>>>,
    resets: u32,
}

impl Device for Lifecycle {
    fn capabilities(&self) -> Capabilities {
        Capabilities::START | Capabilities::RESET | Capabilities::STOP
    }

    fn start(&mut self, ctx: &mut Context<'_>) -> Result<(), ResourceError> {
        self.log.borrow_mut().push(format!("start {}", ctx.tag()));
        Ok(())
    }

    fn reset(&mut self, ctx: &mut Context<'_>) {
        self.resets += 1;
        self.log.borrow_mut().push(format!("reset {}", ctx.tag()));
    }

    fn stop(&mut self, ctx: &mut Context<'_>) {
        self.log.borrow_mut().push(format!("stop {}", ctx.tag()));
    }
}

impl Observable for Lifecycle {
    fn query(&self, path: &str) -> Option<Value> {
        match path {
            "resets" => Some(self.resets.into()),
            _ => None,
        }
    }

    fn query_paths(&self) -> &'static [&'static str] {
        &["resets"]
    }
}

#[test]
fn lifecycle_runs_in_tree_order() {
    let log = Rc::new(RefCell::new(Vec::new()));
    let node = || Lifecycle {
        log: Rc::clone(&log),
        resets: 0,
    };
    let mut b = MachineBuilder::default();
    b.add_device("soc", Clock::NONE, node()).unwrap();
    b.add_device("soc:io", Clock::NONE, node()).unwrap();
    b.add_device("cart", Clock::NONE, node()).unwrap();
    b.add_device("soc:dma", Clock::NONE, node()).unwrap();
    let mut m = b.finalize().unwrap();

    assert!(matches!(
        m.run_for(emu_machine::EmuTime::from_micros(1)),
        Err(MachineError::NotStarted)
    ));
    m.start().unwrap();
    assert!(matches!(m.start(), Err(MachineError::AlreadyStarted)));
    assert_eq!(
        m.tags().collect::<Vec<_>>(),
        ["soc", "soc:io", "soc:dma", "cart"]
    );
    assert_eq!(m.state("soc:dma"), Some(DeviceState::Running));

    m.reset_device("soc").unwrap();
    assert_eq!(m.query("soc:dma", "resets"), Some(Value::U32(2)));
    assert_eq!(m.query("cart", "resets"), Some(Value::U32(1)));

    m.shutdown();
    m.shutdown();
    assert_eq!(m.phase(), Phase::Stopped);
    assert_eq!(m.state("soc"), Some(DeviceState::Stopped));

    let log = log.borrow();
    assert_eq!(
        log[..4],
        ["start soc", "start soc:io", "start soc:dma", "start cart"]
    );
    assert_eq!(
        log[log.len() - 4..],
        ["stop cart", "stop soc:dma", "stop soc:io", "stop soc"]
    );
}

#[test]
fn machine_is_observable() {
    let mut b = MachineBuilder::default();
    b.add_device("pins", Clock::NONE, Pins::default()).unwrap();
    let mut m = b.finalize().unwrap();
    assert_eq!(Observable::query(&m, "phase"), Some(Value::from("configured")));
    m.start().unwrap();
    m.run_for(emu_machine::EmuTime::from_micros(3)).unwrap();

    assert_eq!(
        Observable::query(&m, "time"),
        Some(Value::Time(emu_machine::EmuTime::from_micros(3)))
    );
    assert_eq!(
        Observable::query(&m, "devices"),
        Some(Value::Array(vec![Value::from("pins")]))
    );
    for path in m.query_paths() {
        assert!(Observable::query(&m, path).is_some(), "{path}");
    }
}

#[test]
fn machine_from_a_json_description() {
    let text = r#"{
        "config": { "quantum_ns": 500, "timing_policy": "clamp" },
        "devices": [
            { "tag": "cpu", "type": "host", "clock": 1000000 },
            { "tag": "cpu:regs", "type": "regs" },
            { "tag": "pins", "type": "pins", "params": { "source": 7 } }
        ],
        "installs": [
            { "owner": "cpu", "space": "program", "start": 0, "end": 255,
              "handler": { "type": "ram" } },
            { "owner": "cpu", "space": "program", "start": 16, "end": 31,
              "handler": { "type": "device", "tag": "cpu:regs", "region": "regs" } }
        ],
        "bindings": [
            { "tag": "pins", "endpoint": "data",
              "target": { "type": "constant", "value": 3 } },
            { "tag": "pins", "endpoint": "irq", "target": { "type": "stub" } }
        ]
    }"#;
    let mut types = DeviceTypes::new();
    types
        .register("host", |_| Ok(Box::new(Host::program())))
        .register("regs", |_| Ok(Box::new(Regs::default())))
        .register("pins", |params| {
            let source = params["source"].as_u64().ok_or("missing source")?;
            Ok(Box::new(Pins {
                source: source as u32,
                ..Pins::default()
            }))
        });

    let desc = MachineDescription::from_json(text).unwrap();
    let b = MachineBuilder::from_description(desc, &types).unwrap();
    assert_eq!(b.config().quantum, emu_machine::EmuTime::from_nanos(500));
    let mut m = b.finalize().unwrap();
    m.start().unwrap();

    let space = m.space_id("cpu", "program").unwrap();
    m.write_u8(space, 0x05, 0x77);
    assert_eq!(m.read_u8(space, 0x05), 0x77);
    assert_eq!(m.read_u8(space, 0x12), 0x82);
    assert_eq!(m.query("pins", "source"), Some(Value::U32(7)));
}

#[test]
fn description_problems_are_batched() {
    let text = r#"{
        "devices": [
            { "tag": "a", "type": "mystery" },
            { "tag": "b", "type": "pins", "params": {} }
        ]
    }"#;
    let mut types = DeviceTypes::new();
    types.register("pins", |params| {
        params["source"]
            .as_u64()
            .ok_or_else(|| "missing source".to_owned())
            .map(|_| Box::new(Pins::default()) as Box<dyn Device>)
    });
    let desc = MachineDescription::from_json(text).unwrap();
    let errors = MachineBuilder::from_description(desc, &types)
        .unwrap()
        .finalize()
        .err()
        .unwrap();
    assert_eq!(errors.len(), 2);
    assert!(matches!(errors.errors()[0], ConfigError::UnknownDeviceType { .. }));
    assert!(matches!(errors.errors()[1], ConfigError::InvalidParams { .. }));
}
