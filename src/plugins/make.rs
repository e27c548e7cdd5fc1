// src/plugins/make.rs

//! The make plugin.
//!
//! Plugin properties:
//! - `make-parameters`: extra arguments passed to every make invocation.

use crate::error::Result;
use crate::infos::ProjectInfo;
use crate::parts::Part;
use crate::plugins::{get_list_property, Plugin};
use std::path::PathBuf;

pub struct MakePlugin {
    install_dir: PathBuf,
    parallel_build_count: usize,
    parameters: Vec<String>,
}

impl MakePlugin {
    pub fn create(part: &Part, project: &ProjectInfo) -> Result<Box<dyn Plugin>> {
        Ok(Box::new(MakePlugin {
            install_dir: part.part_install_dir(None),
            parallel_build_count: project.parallel_build_count(),
            parameters: get_list_property(part, "make-parameters")?,
        }))
    }
}

impl Plugin for MakePlugin {
    fn get_build_commands(&self) -> Vec<String> {
        let parameters = if self.parameters.is_empty() {
            String::new()
        } else {
            format!(" {}", self.parameters.join(" "))
        };
        vec![
            format!("make -j\"{}\"{}", self.parallel_build_count, parameters),
            format!(
                "make install DESTDIR={:?}{}",
                self.install_dir, parameters
            ),
        ]
    }

    fn get_build_packages(&self) -> Vec<String> {
        vec!["make".to_string()]
    }

    fn required_commands(&self) -> Vec<String> {
        vec!["make".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infos::ProjectDirs;
    use crate::parts::PartSpec;
    use std::sync::Arc;

    #[test]
    fn test_make_commands() {
        let dirs = Arc::new(ProjectDirs::new("/work", None));
        let spec: PartSpec =
            serde_yaml::from_str("plugin: make\nmake-parameters: [\"-s\"]\n").unwrap();
        let part = Part::new("p1", spec, dirs).unwrap();
        let project = crate::plugins::tests::test_project();

        let plugin = MakePlugin::create(&part, &project).unwrap();
        let commands = plugin.get_build_commands();
        assert_eq!(commands[0], "make -j\"4\" -s");
        assert!(commands[1].starts_with("make install DESTDIR="));
        assert!(commands[1].ends_with(" -s"));
    }
}
