// src/plugins/dump.rs

//! The dump plugin: copy the source tree into the install directory.

use crate::error::Result;
use crate::infos::ProjectInfo;
use crate::parts::Part;
use crate::plugins::Plugin;
use std::path::PathBuf;

pub struct DumpPlugin {
    install_dir: PathBuf,
}

impl DumpPlugin {
    pub fn create(part: &Part, _project: &ProjectInfo) -> Result<Box<dyn Plugin>> {
        Ok(Box::new(DumpPlugin {
            install_dir: part.part_install_dir(None),
        }))
    }
}

impl Plugin for DumpPlugin {
    fn get_build_commands(&self) -> Vec<String> {
        vec![format!(
            "cp --archive --link --no-dereference . {:?}",
            self.install_dir
        )]
    }
}
