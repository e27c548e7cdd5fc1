// src/overlays/overlay_manager.rs

//! Mounting and package operations on the overlay layer stack.
//!
//! All operations are no-ops when no base layer is configured: parts may
//! still run overlay scriptlets against their layer directories, they
//! just do so without a merged view underneath.

use crate::error::{Error, Result};
use crate::infos::ProjectInfo;
use crate::overlays::chroot_run;
use crate::overlays::OverlayFs;
use crate::packages::PackageRepository;
use crate::parts::Part;
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use tracing::warn;

/// Mount and unmount the overlay step layer stack.
pub struct OverlayManager {
    project: Arc<ProjectInfo>,
    layer_dirs: Vec<PathBuf>,
    part_names: Vec<String>,
    base_layer_dir: Option<PathBuf>,
    overlay_fs: Option<OverlayFs>,
    packages: Arc<dyn PackageRepository>,
}

impl OverlayManager {
    pub fn new(
        project: Arc<ProjectInfo>,
        part_list: &[Part],
        packages: Arc<dyn PackageRepository>,
    ) -> Self {
        let layer_dirs = part_list.iter().map(|p| p.part_layer_dir(None)).collect();
        let part_names = part_list.iter().map(|p| p.name().to_string()).collect();
        let base_layer_dir = project.base_layer_dir().map(Path::to_path_buf);
        Self {
            project,
            layer_dirs,
            part_names,
            base_layer_dir,
            overlay_fs: None,
            packages,
        }
    }

    pub fn base_layer_dir(&self) -> Option<&Path> {
        self.base_layer_dir.as_deref()
    }

    /// Create overlay directories and mountpoints.
    pub fn mkdirs(&self) -> Result<()> {
        let dirs = self.project.dirs();
        for dir in [
            dirs.overlay_mount_dir(),
            dirs.overlay_packages_dir(),
            dirs.overlay_work_dir(),
            dirs.overlay_empty_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Mount the overlay layer stack up to the given part.
    ///
    /// The lower stack is the base layer (or the empty stand-in), the
    /// package cache layer when enabled, and the layers of every part
    /// below the given one; the part's own layer is the upper.
    pub fn mount_layer(&mut self, part: &Part, pkg_cache: bool, empty_base: bool) -> Result<()> {
        let Some(base_layer_dir) = &self.base_layer_dir else {
            return Ok(());
        };

        let dirs = self.project.dirs();
        let mut lowers: Vec<PathBuf> = if empty_base {
            vec![dirs.overlay_empty_dir()]
        } else {
            vec![base_layer_dir.clone()]
        };

        if pkg_cache {
            lowers.push(dirs.overlay_packages_dir());
        }

        let index = self
            .part_names
            .iter()
            .position(|name| name == part.name())
            .ok_or_else(|| Error::InvalidPartName(part.name().to_string()))?;
        lowers.extend(self.layer_dirs[..index].iter().cloned());
        let upper = self.layer_dirs[index].clone();

        // lower dirs are stacked right to left
        lowers.reverse();

        let overlay_fs = OverlayFs::new(
            lowers,
            upper,
            dirs.overlay_work_dir(),
            dirs.overlay_mount_dir(),
        );
        overlay_fs.mount()?;
        self.overlay_fs = Some(overlay_fs);
        Ok(())
    }

    /// Mount the overlay package cache layer directly above the base.
    pub fn mount_pkg_cache(&mut self) -> Result<()> {
        let Some(base_layer_dir) = &self.base_layer_dir else {
            return Ok(());
        };

        let dirs = self.project.dirs();
        let overlay_fs = OverlayFs::new(
            vec![base_layer_dir.clone()],
            dirs.overlay_packages_dir(),
            dirs.overlay_work_dir(),
            dirs.overlay_mount_dir(),
        );
        overlay_fs.mount()?;
        self.overlay_fs = Some(overlay_fs);
        Ok(())
    }

    /// Unmount whatever is currently mounted.
    pub fn unmount(&mut self) -> Result<()> {
        if self.base_layer_dir.is_none() {
            return Ok(());
        }

        match self.overlay_fs.take() {
            Some(overlay_fs) => overlay_fs.unmount(),
            None => {
                warn!("overlay filesystem not mounted");
                Ok(())
            }
        }
    }

    /// Whether an overlay is currently mounted.
    pub fn is_mounted(&self) -> bool {
        self.overlay_fs.is_some()
    }

    /// Update the list of available packages in the overlay system.
    pub fn refresh_packages_list(&mut self) -> Result<()> {
        let Some(mount_dir) = self.mounted_dir() else {
            return Ok(());
        };

        self.fix_resolv_conf()?;
        let packages = Arc::clone(&self.packages);
        chroot_run(&mount_dir, move || packages.refresh_packages_list())
    }

    /// Download the given packages into the mounted overlay view.
    pub fn fetch_packages(&mut self, package_names: &[String]) -> Result<()> {
        let Some(mount_dir) = self.mounted_dir() else {
            return Ok(());
        };

        self.fix_resolv_conf()?;
        let packages = Arc::clone(&self.packages);
        let names = package_names.to_vec();
        chroot_run(&mount_dir, move || packages.fetch_packages(&names).map(|_| ()))
    }

    /// Install the given packages into the mounted overlay view.
    pub fn install_packages(&mut self, package_names: &[String]) -> Result<()> {
        let Some(mount_dir) = self.mounted_dir() else {
            return Ok(());
        };

        self.fix_resolv_conf()?;
        let packages = Arc::clone(&self.packages);
        let names = package_names.to_vec();
        chroot_run(&mount_dir, move || {
            packages.install_packages(&names)?;
            // package downloads must not leak into the layers
            let _ = fs::remove_dir_all("/var/cache");
            Ok(())
        })
    }

    fn mounted_dir(&self) -> Option<PathBuf> {
        if self.base_layer_dir.is_none() {
            return None;
        }
        if self.overlay_fs.is_none() {
            warn!("overlay filesystem not mounted");
            return None;
        }
        Some(self.project.dirs().overlay_mount_dir())
    }

    /// The chroot helper bind-mounts over `etc/resolv.conf`, which fails
    /// if the target is a dangling symlink. Replace it with a file.
    fn fix_resolv_conf(&self) -> Result<()> {
        let resolv = self
            .project
            .dirs()
            .overlay_mount_dir()
            .join("etc")
            .join("resolv.conf");
        if resolv.is_symlink() {
            fs::remove_file(&resolv)?;
            fs::write(&resolv, b"")?;
        }
        Ok(())
    }
}

/// Scoped overlay layer stack mount.
///
/// Unmounts on drop, on every exit path. If the drop runs in a forked
/// child (the process id no longer matches acquisition), the child exits
/// immediately instead of unmounting the parent's mount.
pub struct LayerMount {
    manager: Rc<RefCell<OverlayManager>>,
    pid: u32,
}

impl LayerMount {
    pub fn new(
        manager: Rc<RefCell<OverlayManager>>,
        top_part: &Part,
        pkg_cache: bool,
    ) -> Result<Self> {
        {
            let mut inner = manager.borrow_mut();
            inner.mkdirs()?;
            inner.mount_layer(top_part, pkg_cache, false)?;
        }
        Ok(Self {
            manager,
            pid: std::process::id(),
        })
    }

    pub fn install_packages(&self, package_names: &[String]) -> Result<()> {
        self.manager.borrow_mut().install_packages(package_names)
    }
}

impl Drop for LayerMount {
    fn drop(&mut self) {
        if std::process::id() != self.pid {
            // never unwind into the parent's mount handling from a fork
            unsafe { libc::_exit(0) };
        }
        if let Err(e) = self.manager.borrow_mut().unmount() {
            warn!("cannot unmount layer stack: {}", e);
        }
    }
}

/// Scoped overlay package cache mount.
pub struct PackageCacheMount {
    manager: Rc<RefCell<OverlayManager>>,
    pid: u32,
}

impl PackageCacheMount {
    pub fn new(manager: Rc<RefCell<OverlayManager>>) -> Result<Self> {
        {
            let mut inner = manager.borrow_mut();
            inner.mkdirs()?;
            inner.mount_pkg_cache()?;
        }
        Ok(Self {
            manager,
            pid: std::process::id(),
        })
    }

    pub fn refresh_packages_list(&self) -> Result<()> {
        self.manager.borrow_mut().refresh_packages_list()
    }

    pub fn download_packages(&self, package_names: &[String]) -> Result<()> {
        self.manager.borrow_mut().fetch_packages(package_names)
    }
}

impl Drop for PackageCacheMount {
    fn drop(&mut self) {
        if std::process::id() != self.pid {
            unsafe { libc::_exit(0) };
        }
        if let Err(e) = self.manager.borrow_mut().unmount() {
            warn!("cannot unmount package cache: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infos::{FilesystemMounts, ProjectDirs};
    use crate::packages::NullRepository;
    use crate::parts::PartSpec;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn project(work: &Path, base_layer: Option<PathBuf>) -> Arc<ProjectInfo> {
        let dirs = Arc::new(ProjectDirs::new(work, None));
        Arc::new(
            ProjectInfo::new(
                "test".to_string(),
                None,
                work.join("cache"),
                Some("amd64".to_string()),
                1,
                dirs,
                FilesystemMounts::new(),
                base_layer,
                BTreeMap::new(),
                BTreeMap::new(),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_operations_are_noops_without_base_layer() {
        let tmp = TempDir::new().unwrap();
        let project = project(tmp.path(), None);
        let part = Part::new("p1", PartSpec::default(), project.dirs_arc()).unwrap();
        let mut manager =
            OverlayManager::new(Arc::clone(&project), &[part.clone()], Arc::new(NullRepository));

        manager.mount_layer(&part, true, false).unwrap();
        assert!(!manager.is_mounted());
        manager.unmount().unwrap();
        manager.refresh_packages_list().unwrap();
        manager
            .install_packages(&["hello".to_string()])
            .unwrap();
    }

    #[test]
    fn test_mkdirs_creates_overlay_tree() {
        let tmp = TempDir::new().unwrap();
        let project = project(tmp.path(), None);
        let part = Part::new("p1", PartSpec::default(), project.dirs_arc()).unwrap();
        let manager =
            OverlayManager::new(Arc::clone(&project), &[part], Arc::new(NullRepository));

        manager.mkdirs().unwrap();

        assert!(tmp.path().join("overlay/mount").is_dir());
        assert!(tmp.path().join("overlay/packages").is_dir());
        assert!(tmp.path().join("overlay/work").is_dir());
        assert!(tmp.path().join("overlay/empty").is_dir());
    }

    #[test]
    fn test_scoped_mount_without_base_layer() {
        let tmp = TempDir::new().unwrap();
        let project = project(tmp.path(), None);
        let part = Part::new("p1", PartSpec::default(), project.dirs_arc()).unwrap();
        let manager = Rc::new(RefCell::new(OverlayManager::new(
            Arc::clone(&project),
            std::slice::from_ref(&part),
            Arc::new(NullRepository),
        )));

        let mount = LayerMount::new(Rc::clone(&manager), &part, false).unwrap();
        drop(mount);
        assert!(!manager.borrow().is_mounted());
    }
}
