// src/plugins/nil.rs

//! The nil plugin: a part with no build of its own.

use crate::error::Result;
use crate::infos::ProjectInfo;
use crate::parts::Part;
use crate::plugins::Plugin;

/// Does nothing at build time. Useful for parts that only pull sources,
/// declare packages, or populate the overlay.
pub struct NilPlugin;

impl NilPlugin {
    pub fn create(_part: &Part, _project: &ProjectInfo) -> Result<Box<dyn Plugin>> {
        Ok(Box::new(NilPlugin))
    }
}

impl Plugin for NilPlugin {
    fn get_build_commands(&self) -> Vec<String> {
        Vec::new()
    }
}
