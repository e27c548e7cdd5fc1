// src/overlays/overlay_fs.rs

//! Low level interface to the kernel overlay filesystem.

use crate::error::{Error, Result};
use nix::mount::{mount, umount, MsFlags};
use std::path::PathBuf;
use tracing::debug;

/// An overlayfs mount definition.
///
/// Lower directories are given topmost first, matching the kernel's
/// `lowerdir` option order.
#[derive(Debug)]
pub struct OverlayFs {
    lower_dirs: Vec<PathBuf>,
    upper_dir: PathBuf,
    work_dir: PathBuf,
    mountpoint: PathBuf,
}

impl OverlayFs {
    pub fn new(
        lower_dirs: Vec<PathBuf>,
        upper_dir: PathBuf,
        work_dir: PathBuf,
        mountpoint: PathBuf,
    ) -> Self {
        Self {
            lower_dirs,
            upper_dir,
            work_dir,
            mountpoint,
        }
    }

    pub fn mountpoint(&self) -> &PathBuf {
        &self.mountpoint
    }

    /// Mount the layer stack.
    pub fn mount(&self) -> Result<()> {
        let lower = self
            .lower_dirs
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(":");
        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower,
            self.upper_dir.to_string_lossy(),
            self.work_dir.to_string_lossy()
        );

        debug!("mount overlay on {:?}: {}", self.mountpoint, options);

        mount(
            Some("overlay"),
            &self.mountpoint,
            Some("overlay"),
            MsFlags::empty(),
            Some(options.as_str()),
        )
        .map_err(|e| Error::OverlayMount {
            mountpoint: self.mountpoint.clone(),
            message: e.to_string(),
        })
    }

    /// Unmount the layer stack.
    pub fn unmount(&self) -> Result<()> {
        debug!("unmount overlay on {:?}", self.mountpoint);
        umount(&self.mountpoint).map_err(|e| Error::OverlayUnmount {
            mountpoint: self.mountpoint.clone(),
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lower_dirs_join_topmost_first() {
        let fs = OverlayFs::new(
            vec![PathBuf::from("/top"), PathBuf::from("/mid"), PathBuf::from("/base")],
            PathBuf::from("/upper"),
            PathBuf::from("/work"),
            PathBuf::from("/mnt"),
        );
        let lower = fs
            .lower_dirs
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(":");
        assert_eq!(lower, "/top:/mid:/base");
    }
}
