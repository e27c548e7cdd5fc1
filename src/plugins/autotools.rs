// src/plugins/autotools.rs

//! The autotools plugin.
//!
//! Plugin properties:
//! - `autotools-configure-parameters`: arguments passed to `./configure`.

use crate::error::Result;
use crate::infos::ProjectInfo;
use crate::parts::Part;
use crate::plugins::{get_list_property, Plugin};
use std::path::PathBuf;

pub struct AutotoolsPlugin {
    install_dir: PathBuf,
    parallel_build_count: usize,
    configure_parameters: Vec<String>,
}

impl AutotoolsPlugin {
    pub fn create(part: &Part, project: &ProjectInfo) -> Result<Box<dyn Plugin>> {
        Ok(Box::new(AutotoolsPlugin {
            install_dir: part.part_install_dir(None),
            parallel_build_count: project.parallel_build_count(),
            configure_parameters: get_list_property(part, "autotools-configure-parameters")?,
        }))
    }
}

impl Plugin for AutotoolsPlugin {
    fn get_build_commands(&self) -> Vec<String> {
        vec![
            "[ -x ./configure ] || autoreconf --install".to_string(),
            format!("./configure {}", self.configure_parameters.join(" ")),
            format!("make -j\"{}\"", self.parallel_build_count),
            format!("make install DESTDIR={:?}", self.install_dir),
        ]
    }

    fn get_build_packages(&self) -> Vec<String> {
        vec![
            "autoconf".to_string(),
            "automake".to_string(),
            "autopoint".to_string(),
            "gcc".to_string(),
            "libtool".to_string(),
            "make".to_string(),
        ]
    }

    fn required_commands(&self) -> Vec<String> {
        vec!["autoreconf".to_string(), "make".to_string()]
    }
}
