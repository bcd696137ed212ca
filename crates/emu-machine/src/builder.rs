//! Building a device tree.
//!
//! Devices are added with hierarchical tags (`soc`, `soc:io`). Each one's
//! [`Device::configure`] hook runs immediately to collect its declarations.
//! Bindings and map installs are recorded by name and only resolved in
//! [`MachineBuilder::finalize`], which reports every problem at once.

use emu_core::{Clock, EmuTime};

use crate::config::MachineConfig;
use crate::device::{
    Configurator, Declarations, Device, DeviceId, DeviceSlot, DeviceState, DeviceTable,
    SuspendReason, parent_tag, valid_tag,
};
use crate::error::{ConfigError, ConfigErrors, ResourceError};
use crate::line::{BindRequest, BitField, LineTable, Target};
use crate::machine::Machine;
use crate::space::{Install, InstallRequest, SpaceDecl, build_spaces};

pub struct MachineBuilder {
    config: MachineConfig,
    devices: DeviceTable,
    lines: LineTable,
    spaces: Vec<SpaceDecl>,
    binds: Vec<BindRequest>,
    installs: Vec<InstallRequest>,
    errors: Vec<ConfigError>,
}

impl MachineBuilder {
    #[must_use]
    pub fn new(config: MachineConfig) -> Self {
        Self {
            config,
            devices: DeviceTable::default(),
            lines: LineTable::default(),
            spaces: Vec::new(),
            binds: Vec::new(),
            installs: Vec::new(),
            errors: Vec::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Add a device under the tag's parent path and run its configure hook.
    ///
    /// Only a full device table fails here; tag problems are reported by
    /// [`finalize`](Self::finalize).
    pub fn add_device(
        &mut self,
        tag: &str,
        clock: Clock,
        device: impl Device + 'static,
    ) -> Result<DeviceId, ResourceError> {
        self.add_boxed(tag, clock, Box::new(device))
    }

    pub fn add_boxed(
        &mut self,
        tag: &str,
        clock: Clock,
        mut device: Box<dyn Device>,
    ) -> Result<DeviceId, ResourceError> {
        if self.devices.len() >= self.config.max_devices {
            return Err(ResourceError::DeviceTableFull {
                capacity: self.config.max_devices,
            });
        }

        let mut register = true;
        let mut parent = None;
        if !valid_tag(tag) {
            self.errors.push(ConfigError::InvalidTag { tag: tag.to_owned() });
            register = false;
        } else if self.devices.lookup(tag).is_some() {
            self.errors.push(ConfigError::DuplicateTag { tag: tag.to_owned() });
            register = false;
        } else if let Some(parent_path) = parent_tag(tag) {
            parent = self.devices.lookup(parent_path);
            if parent.is_none() {
                self.errors.push(ConfigError::UnknownParent {
                    tag: tag.to_owned(),
                    parent: parent_path.to_owned(),
                });
            }
        }

        let id = self.devices.next_id();
        let mut decl = Declarations::default();
        let mut cfg = Configurator {
            device: id,
            tag,
            clock,
            decl: &mut decl,
            lines: &mut self.lines,
            spaces: &mut self.spaces,
            errors: &mut self.errors,
        };
        device.configure(&mut cfg);
        let caps = device.capabilities();
        log::debug!("added `{tag}` ({caps:?}) at {} Hz", clock.frequency_hz);

        Ok(self.devices.push(
            DeviceSlot {
                tag: tag.to_owned(),
                parent,
                children: Vec::new(),
                clock,
                caps,
                device: Some(device),
                state: DeviceState::Idle,
                suspend: SuspendReason::empty(),
                local: EmuTime::ZERO,
                decl,
            },
            register,
        ))
    }

    /// Bind an endpoint, replacing any earlier binding.
    pub fn bind(&mut self, tag: &str, endpoint: &str, target: Target) -> &mut Self {
        self.request(tag, endpoint, target, BitField::FULL, false)
    }

    /// Bind an endpoint through a bit field.
    pub fn bind_field(
        &mut self,
        tag: &str,
        endpoint: &str,
        target: Target,
        field: BitField,
    ) -> &mut Self {
        self.request(tag, endpoint, target, field, false)
    }

    /// Add another sink to a write endpoint.
    pub fn append(&mut self, tag: &str, endpoint: &str, target: Target) -> &mut Self {
        self.request(tag, endpoint, target, BitField::FULL, true)
    }

    pub fn append_field(
        &mut self,
        tag: &str,
        endpoint: &str,
        target: Target,
        field: BitField,
    ) -> &mut Self {
        self.request(tag, endpoint, target, field, true)
    }

    fn request(
        &mut self,
        tag: &str,
        endpoint: &str,
        target: Target,
        field: BitField,
        append: bool,
    ) -> &mut Self {
        self.binds.push(BindRequest {
            tag: tag.to_owned(),
            endpoint: endpoint.to_owned(),
            target,
            field,
            append,
        });
        self
    }

    /// Map a handler into the space `space` declared by `owner`.
    pub fn install(&mut self, owner: &str, space: &str, install: Install) -> &mut Self {
        self.installs.push(InstallRequest {
            owner: owner.to_owned(),
            space: space.to_owned(),
            install,
        });
        self
    }

    pub(crate) fn push_error(&mut self, error: ConfigError) {
        self.errors.push(error);
    }

    /// Resolve every binding and install and validate the result.
    pub fn finalize(self) -> Result<Machine, ConfigErrors> {
        let Self {
            config,
            devices,
            mut lines,
            spaces,
            binds,
            installs,
            mut errors,
        } = self;

        for request in binds {
            if let Err(error) = lines.resolve(&devices, request) {
                errors.push(error);
            }
        }
        errors.extend(lines.unbound_required(&devices));
        let spaces = build_spaces(spaces, installs, &devices, &mut errors);

        if let Some(errors) = ConfigErrors::from_vec(errors) {
            log::error!("machine configuration failed: {errors}");
            return Err(errors);
        }
        log::info!(
            "finalized machine: {} devices, {} address spaces",
            devices.len(),
            spaces.len()
        );
        Ok(Machine::new(config, devices, lines, spaces))
    }
}

impl Default for MachineBuilder {
    fn default() -> Self {
        Self::new(MachineConfig::default())
    }
}
