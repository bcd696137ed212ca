//! Static machine descriptions.
//!
//! A [`MachineDescription`] lists devices by type name, map installs and
//! line bindings in a serde format (JSON in practice). A [`DeviceTypes`]
//! registry maps type names to constructors, and
//! [`MachineBuilder::from_description`] turns the two into a builder that
//! can still be extended in code before it is finalized.

use std::collections::HashMap;

use emu_core::Clock;
use serde::{Deserialize, Serialize};

use crate::builder::MachineBuilder;
use crate::config::MachineConfig;
use crate::device::Device;
use crate::error::{ConfigError, ResourceError};
use crate::line::{BitField, Target};
use crate::space::Install;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineDescription {
    pub config: MachineConfig,
    /// In tree order: a parent must come before its children.
    pub devices: Vec<DeviceDescription>,
    pub installs: Vec<InstallDescription>,
    pub bindings: Vec<BindingDescription>,
}

impl MachineDescription {
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescription {
    pub tag: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub clock: Clock,
    /// Handed to the type's constructor as-is.
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallDescription {
    pub owner: String,
    pub space: String,
    #[serde(flatten)]
    pub install: Install,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingDescription {
    pub tag: String,
    pub endpoint: String,
    pub target: TargetDescription,
    #[serde(default)]
    pub shift: u8,
    #[serde(default = "all_ones")]
    pub mask: u32,
    /// Add to the endpoint's sinks instead of replacing them.
    #[serde(default)]
    pub append: bool,
}

fn all_ones() -> u32 {
    u32::MAX
}

/// Binding targets that can be written down. Host closures can only be
/// bound in code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TargetDescription {
    Device { tag: String, handler: String },
    Constant { value: u32 },
    Stub,
}

impl From<TargetDescription> for Target {
    fn from(target: TargetDescription) -> Self {
        match target {
            TargetDescription::Device { tag, handler } => Target::Device { tag, handler },
            TargetDescription::Constant { value } => Target::Constant(value),
            TargetDescription::Stub => Target::Stub,
        }
    }
}

type Constructor = Box<dyn Fn(&serde_json::Value) -> Result<Box<dyn Device>, String>>;

/// Named device constructors.
#[derive(Default)]
pub struct DeviceTypes {
    constructors: HashMap<String, Constructor>,
}

impl DeviceTypes {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor. It receives the description's `params` and
    /// may reject them with a reason.
    pub fn register<F>(&mut self, name: &str, constructor: F) -> &mut Self
    where
        F: Fn(&serde_json::Value) -> Result<Box<dyn Device>, String> + 'static,
    {
        self.constructors
            .insert(name.to_owned(), Box::new(constructor));
        self
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }
}

impl MachineBuilder {
    /// Build the devices, installs and bindings of a description.
    ///
    /// Unknown types and rejected parameters are collected and reported by
    /// [`finalize`](Self::finalize) along with everything else.
    pub fn from_description(
        description: MachineDescription,
        types: &DeviceTypes,
    ) -> Result<Self, ResourceError> {
        let MachineDescription {
            config,
            devices,
            installs,
            bindings,
        } = description;
        let mut builder = Self::new(config);

        for device in devices {
            let Some(constructor) = types.constructors.get(&device.kind) else {
                builder.push_error(ConfigError::UnknownDeviceType {
                    tag: device.tag,
                    kind: device.kind,
                });
                continue;
            };
            match constructor(&device.params) {
                Ok(instance) => {
                    builder.add_boxed(&device.tag, device.clock, instance)?;
                }
                Err(reason) => builder.push_error(ConfigError::InvalidParams {
                    tag: device.tag,
                    reason,
                }),
            }
        }

        for install in installs {
            builder.install(&install.owner, &install.space, install.install);
        }

        for binding in bindings {
            let field = BitField::new(binding.shift, binding.mask);
            if binding.append {
                builder.append_field(&binding.tag, &binding.endpoint, binding.target.into(), field);
            } else {
                builder.bind_field(&binding.tag, &binding.endpoint, binding.target.into(), field);
            }
        }

        Ok(builder)
    }
}
