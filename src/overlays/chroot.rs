// src/overlays/chroot.rs

//! Execute a closure in a chroot environment.
//!
//! The parent process bind-mounts the runtime paths the collaborators
//! need (`/etc/resolv.conf`, `/proc`, `/sys`, `/dev`, in that order),
//! forks, and the child enters the target root before running the
//! closure. The mounts are torn down in reverse order once the child
//! exits. The child never returns into caller code: it reports success
//! or failure through its exit status.

use crate::error::{Error, Result};
use nix::mount::{mount, umount, MsFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, chroot, fork, ForkResult};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

struct BindEntry {
    fstype: Option<&'static str>,
    src: &'static str,
    mountpoint: &'static str,
    bind: bool,
}

const CHROOT_MOUNTS: &[BindEntry] = &[
    BindEntry {
        fstype: None,
        src: "/etc/resolv.conf",
        mountpoint: "etc/resolv.conf",
        bind: true,
    },
    BindEntry {
        fstype: Some("proc"),
        src: "proc",
        mountpoint: "proc",
        bind: false,
    },
    BindEntry {
        fstype: Some("sysfs"),
        src: "sysfs",
        mountpoint: "sys",
        bind: false,
    },
    BindEntry {
        fstype: None,
        src: "/dev",
        mountpoint: "dev",
        bind: true,
    },
];

/// Run `f` with `root` as the filesystem root.
pub fn chroot_run<F>(root: &Path, f: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    let mounted = setup_chroot(root)?;

    let run = || -> Result<()> {
        // fork so the chroot does not affect the calling process
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let status = match enter_and_run(root, f) {
                    Ok(()) => 0,
                    Err(e) => {
                        eprintln!("chroot execution failed: {e}");
                        1
                    }
                };
                unsafe { libc::_exit(status) };
            }
            Ok(ForkResult::Parent { child }) => match waitpid(child, None) {
                Ok(WaitStatus::Exited(_, 0)) => Ok(()),
                Ok(WaitStatus::Exited(_, code)) => Err(Error::Chroot(format!(
                    "chrooted process exited with status {code}"
                ))),
                Ok(status) => Err(Error::Chroot(format!(
                    "chrooted process terminated abnormally: {status:?}"
                ))),
                Err(e) => Err(Error::Chroot(format!("cannot wait for child: {e}"))),
            },
            Err(e) => Err(Error::Chroot(format!("cannot fork: {e}"))),
        }
    };

    let result = run();
    cleanup_chroot(root, &mounted);
    result
}

fn enter_and_run<F>(root: &Path, f: F) -> Result<()>
where
    F: FnOnce() -> Result<()>,
{
    debug!("[pid={}] chroot to {:?}", std::process::id(), root);
    chroot(root).map_err(|e| Error::Chroot(format!("cannot chroot to {root:?}: {e}")))?;
    chdir("/").map_err(|e| Error::Chroot(format!("cannot chdir to new root: {e}")))?;
    f()
}

fn setup_chroot(root: &Path) -> Result<Vec<PathBuf>> {
    let mut mounted = Vec::new();

    for entry in CHROOT_MOUNTS {
        let target = root.join(entry.mountpoint);

        if entry.bind && Path::new(entry.src).is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            if !target.exists() {
                fs::write(&target, b"")?;
            }
        } else {
            fs::create_dir_all(&target)?;
        }

        debug!("mount on chroot: {} -> {:?}", entry.src, target);
        let flags = if entry.bind {
            MsFlags::MS_BIND
        } else {
            MsFlags::empty()
        };
        mount(
            Some(entry.src),
            &target,
            entry.fstype,
            flags,
            None::<&str>,
        )
        .map_err(|e| {
            Error::Chroot(format!("cannot mount {} on {target:?}: {e}", entry.src))
        })?;
        mounted.push(target);
    }

    Ok(mounted)
}

fn cleanup_chroot(root: &Path, mounted: &[PathBuf]) {
    debug!("cleanup chroot: {:?}", root);
    for target in mounted.iter().rev() {
        if let Err(e) = umount(target) {
            warn!("cannot unmount {:?}: {}", target, e);
        }
    }
}
