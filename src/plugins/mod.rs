// src/plugins/mod.rs

//! Build plugins.
//!
//! A plugin turns a part's build step into a list of shell commands.
//! The registry maps plugin names to constructors and is an explicit
//! value owned by the lifecycle manager; built-in plugins are inserted
//! at construction and applications may register their own.

mod autotools;
mod dump;
mod make;
mod nil;
mod python;

pub use autotools::AutotoolsPlugin;
pub use dump::DumpPlugin;
pub use make::MakePlugin;
pub use nil::NilPlugin;
pub use python::PythonPlugin;

use crate::actions::ActionProperties;
use crate::error::{Error, Result};
use crate::infos::ProjectInfo;
use crate::parts::Part;
use serde_yaml::Value;
use std::collections::BTreeMap;

/// A part build plugin.
pub trait Plugin {
    /// Packages required on the build host.
    fn get_build_packages(&self) -> Vec<String> {
        Vec::new()
    }

    /// Snaps required on the build host.
    fn get_build_snaps(&self) -> Vec<String> {
        Vec::new()
    }

    /// Environment entries the build commands run with, in order.
    fn get_build_environment(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// The shell commands executing the build.
    fn get_build_commands(&self) -> Vec<String>;

    /// Whether the plugin builds outside the source tree.
    ///
    /// When false, the source tree is copied into the build directory
    /// before building.
    fn get_out_of_source_build(&self) -> bool {
        false
    }

    /// Hand the plugin sequencer-provided action properties before BUILD.
    fn set_action_properties(&mut self, _properties: &ActionProperties) {}

    /// Commands that must resolve in the build environment.
    fn required_commands(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Constructor for a named plugin.
pub type PluginFactory = Box<dyn Fn(&Part, &ProjectInfo) -> Result<Box<dyn Plugin>>>;

/// Plugin name to constructor mapping.
pub struct PluginRegistry {
    factories: BTreeMap<String, PluginFactory>,
}

impl PluginRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// A registry with the built-in plugins registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("autotools", Box::new(|p, i| AutotoolsPlugin::create(p, i)));
        registry.register("dump", Box::new(|p, i| DumpPlugin::create(p, i)));
        registry.register("make", Box::new(|p, i| MakePlugin::create(p, i)));
        registry.register("nil", Box::new(|p, i| NilPlugin::create(p, i)));
        registry.register("python", Box::new(|p, i| PythonPlugin::create(p, i)));
        registry
    }

    /// Register a plugin constructor under a name.
    pub fn register(&mut self, name: impl Into<String>, factory: PluginFactory) {
        self.factories.insert(name.into(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Instantiate the plugin for a part.
    pub fn create(&self, part: &Part, project: &ProjectInfo) -> Result<Box<dyn Plugin>> {
        let name = part.plugin_name();
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::PluginNotRegistered(name.to_string()))?;
        factory(part, project)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Read a plugin-specific string list property from a part.
pub(crate) fn get_list_property(part: &Part, key: &str) -> Result<Vec<String>> {
    match part.spec().plugin_properties.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(value) => serde_yaml::from_value(value.clone()).map_err(|e| Error::PluginProperties {
            part_name: part.name().to_string(),
            message: format!("{key}: {e}"),
        }),
    }
}
