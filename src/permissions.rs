// src/permissions.rs

//! Path-filtered permission definitions.
//!
//! A part can declare `permissions` entries that apply an octal mode
//! and/or ownership to matching paths when files are migrated between
//! lifecycle areas. The original files are never modified.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// A single permissions definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Permissions {
    /// Glob selecting the paths this entry applies to.
    #[serde(default = "default_path")]
    pub path: String,
    /// Numeric owner uid.
    #[serde(default)]
    pub owner: Option<u32>,
    /// Numeric group gid.
    #[serde(default)]
    pub group: Option<u32>,
    /// Octal mode string, e.g. `"755"`.
    #[serde(default)]
    pub mode: Option<String>,
}

fn default_path() -> String {
    "*".to_string()
}

impl Permissions {
    /// Whether this definition applies to the given relative path.
    pub fn applies_to(&self, relpath: &str) -> bool {
        if self.path == "*" {
            return true;
        }
        glob::Pattern::new(&self.path)
            .map(|p| p.matches(relpath))
            .unwrap_or(false)
    }

    /// Apply mode and ownership to `path`.
    pub fn apply(&self, path: &Path) -> Result<()> {
        if let Some(mode) = &self.mode {
            let bits = u32::from_str_radix(mode, 8).map_err(|_| {
                Error::Feature(format!("invalid permissions mode {mode:?}"))
            })?;
            fs::set_permissions(path, fs::Permissions::from_mode(bits))?;
        }

        if self.owner.is_some() || self.group.is_some() {
            nix::unistd::chown(
                path,
                self.owner.map(nix::unistd::Uid::from_raw),
                self.group.map(nix::unistd::Gid::from_raw),
            )
            .map_err(|e| Error::Feature(format!("cannot chown {path:?}: {e}")))?;
        }

        Ok(())
    }
}

/// Select the permissions definitions that apply to `relpath`.
pub fn filter_permissions<'a>(relpath: &str, permissions: &'a [Permissions]) -> Vec<&'a Permissions> {
    permissions.iter().filter(|p| p.applies_to(relpath)).collect()
}

/// Apply every matching definition to a migrated path.
pub fn apply_permissions(path: &Path, filtered: &[&Permissions]) -> Result<()> {
    for permissions in filtered {
        permissions.apply(path)?;
    }
    Ok(())
}
