// src/plugins/python.rs

//! The python plugin.
//!
//! Builds a virtual environment in the install directory and installs
//! the part's source with pip.
//!
//! Plugin properties:
//! - `python-requirements`: requirements files to install from.
//! - `python-constraints`: constraints files applied to installs.
//! - `python-packages`: packages installed before the source tree.

use crate::error::Result;
use crate::infos::ProjectInfo;
use crate::parts::Part;
use crate::plugins::{get_list_property, Plugin};
use std::path::PathBuf;

pub struct PythonPlugin {
    install_dir: PathBuf,
    requirements: Vec<String>,
    constraints: Vec<String>,
    packages: Vec<String>,
}

impl PythonPlugin {
    pub fn create(part: &Part, _project: &ProjectInfo) -> Result<Box<dyn Plugin>> {
        let mut packages = get_list_property(part, "python-packages")?;
        if packages.is_empty() {
            packages = vec![
                "pip".to_string(),
                "setuptools".to_string(),
                "wheel".to_string(),
            ];
        }
        Ok(Box::new(PythonPlugin {
            install_dir: part.part_install_dir(None),
            requirements: get_list_property(part, "python-requirements")?,
            constraints: get_list_property(part, "python-constraints")?,
            packages,
        }))
    }

    fn pip(&self) -> String {
        format!("{:?}/bin/pip", self.install_dir)
    }

    fn constraint_args(&self) -> String {
        self.constraints
            .iter()
            .map(|c| format!(" -c {c}"))
            .collect()
    }
}

impl Plugin for PythonPlugin {
    fn get_build_commands(&self) -> Vec<String> {
        let mut commands = vec![format!("python3 -m venv {:?}", self.install_dir)];

        commands.push(format!(
            "{} install -U{} {}",
            self.pip(),
            self.constraint_args(),
            self.packages.join(" ")
        ));

        for requirements in &self.requirements {
            commands.push(format!(
                "{} install -U{} -r {}",
                self.pip(),
                self.constraint_args(),
                requirements
            ));
        }

        commands.push(format!(
            "[ -f setup.py ] || [ -f pyproject.toml ] && {} install -U{} . || true",
            self.pip(),
            self.constraint_args()
        ));

        // venvs hardcode the creating interpreter path; make the scripts
        // relocatable before they are staged
        commands.push(format!(
            "find {:?}/bin -type f -perm -u+x -exec sed -i \
             '1 s|^#!.*/bin/python3$|#!/usr/bin/env python3|' {{}} \\;",
            self.install_dir
        ));

        commands
    }

    fn get_build_packages(&self) -> Vec<String> {
        vec!["python3-venv".to_string(), "python3-dev".to_string()]
    }

    fn required_commands(&self) -> Vec<String> {
        vec!["python3".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infos::ProjectDirs;
    use crate::parts::PartSpec;
    use std::sync::Arc;

    #[test]
    fn test_python_commands() {
        let dirs = Arc::new(ProjectDirs::new("/work", None));
        let spec: PartSpec = serde_yaml::from_str(
            "plugin: python\npython-requirements: [requirements.txt]\n",
        )
        .unwrap();
        let part = Part::new("p1", spec, dirs).unwrap();
        let project = crate::plugins::tests::test_project();

        let plugin = PythonPlugin::create(&part, &project).unwrap();
        let commands = plugin.get_build_commands();
        assert!(commands[0].starts_with("python3 -m venv"));
        assert!(commands.iter().any(|c| c.contains("-r requirements.txt")));
    }
}
