// src/overlays/mod.rs

//! Overlay filesystem management.
//!
//! Two whiteout conventions are in play. Inside a mounted overlay, the
//! kernel marks deletions with character devices (0:0) and opaque
//! directories with the `trusted.overlay.opaque` extended attribute.
//! Once layer content is squashed into the shared stage/prime trees the
//! markers are translated to their OCI image forms: a `.wh.<name>`
//! regular file and a `.wh..wh..opq` marker file.

mod chroot;
mod layer_hash;
mod overlay_fs;
mod overlay_manager;

pub use chroot::chroot_run;
pub use layer_hash::LayerHash;
pub use overlay_fs::OverlayFs;
pub use overlay_manager::{LayerMount, OverlayManager, PackageCacheMount};

use crate::error::Result;
use std::collections::BTreeSet;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Prefix of OCI whiteout file names.
pub const OCI_WHITEOUT_PREFIX: &str = ".wh.";

/// Name of the OCI opaque directory marker file.
pub const OCI_OPAQUE_MARKER: &str = ".wh..wh..opq";

/// The OCI whiteout twin of a path: `.wh.<name>` next to it.
pub fn oci_whiteout(path: &Path) -> PathBuf {
    let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
    match path.parent() {
        Some(parent) => parent.join(format!("{OCI_WHITEOUT_PREFIX}{name}")),
        None => PathBuf::from(format!("{OCI_WHITEOUT_PREFIX}{name}")),
    }
}

/// The path whited out by an OCI whiteout file.
pub fn oci_whited_out_file(whiteout: &Path) -> PathBuf {
    let name = whiteout
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stripped = name.strip_prefix(OCI_WHITEOUT_PREFIX).unwrap_or(&name);
    match whiteout.parent() {
        Some(parent) => parent.join(stripped),
        None => PathBuf::from(stripped),
    }
}

/// The OCI opaque marker path for a directory.
pub fn oci_opaque_dir(dir: &Path) -> PathBuf {
    dir.join(OCI_OPAQUE_MARKER)
}

/// Whether the path name is an OCI whiteout file (not the opaque marker).
pub fn is_oci_whiteout_file(path: &Path) -> bool {
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name.starts_with(OCI_WHITEOUT_PREFIX) && name != OCI_OPAQUE_MARKER,
        None => false,
    }
}

/// Whether the path name is the OCI opaque directory marker.
pub fn is_oci_opaque_marker(path: &Path) -> bool {
    path.file_name().and_then(|n| n.to_str()) == Some(OCI_OPAQUE_MARKER)
}

/// Whether the path name is any kind of OCI whiteout.
pub fn is_oci_whiteout(path: &Path) -> bool {
    is_oci_whiteout_file(path) || is_oci_opaque_marker(path)
}

/// Whether the directory contains an OCI opaque marker.
pub fn is_oci_opaque_dir(dir: &Path) -> bool {
    oci_opaque_dir(dir).is_file()
}

/// Whether the path is an overlayfs whiteout: a character device 0:0.
pub fn is_whiteout_file(path: &Path) -> bool {
    match std::fs::symlink_metadata(path) {
        Ok(meta) => meta.file_type().is_char_device() && meta.rdev() == 0,
        Err(_) => false,
    }
}

/// Whether the directory is an overlayfs opaque directory
/// (`trusted.overlay.opaque` extended attribute set to `y`).
pub fn is_opaque_dir(path: &Path) -> bool {
    read_xattr(path, "trusted.overlay.opaque")
        .map(|value| value == b"y")
        .unwrap_or(false)
}

fn read_xattr(path: &Path, name: &str) -> Option<Vec<u8>> {
    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let c_name = CString::new(name).ok()?;
    let mut buf = [0u8; 16];
    let len = unsafe {
        libc::lgetxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
        )
    };
    if len < 0 {
        None
    } else {
        Some(buf[..len as usize].to_vec())
    }
}

/// Determine the files and directories of a layer that are visible at the
/// destination: entries not already present and not hidden under an OCI
/// opaque directory.
pub fn visible_in_layer(
    srcdir: &Path,
    destdir: &Path,
) -> Result<(BTreeSet<String>, BTreeSet<String>)> {
    let mut migratable_files = BTreeSet::new();
    let mut migratable_dirs = BTreeSet::new();

    debug!("check layer visibility in {:?}", srcdir);

    let src_root = srcdir.to_path_buf();
    let dest_root = destdir.to_path_buf();
    let walker = WalkDir::new(srcdir).into_iter().filter_entry(move |entry| {
        if entry.depth() == 0 || !entry.file_type().is_dir() {
            return true;
        }
        // don't descend into destination dirs overridden by opaque markers
        let rel = match entry.path().strip_prefix(&src_root) {
            Ok(rel) => rel,
            Err(_) => return true,
        };
        let dest = dest_root.join(rel);
        !(dest.exists() && is_oci_opaque_dir(&dest))
    });

    for entry in walker {
        let entry = entry.map_err(std::io::Error::from)?;
        if entry.depth() == 0 {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(srcdir)
            .expect("walked entry is under the walk root");
        let relpath = rel.to_string_lossy().into_owned();
        let dest = destdir.join(rel);

        if entry.file_type().is_dir() {
            if !dest.exists() {
                migratable_dirs.insert(relpath);
            }
        } else if !dest.exists() {
            // symlinked directories migrate as files
            migratable_files.insert(relpath);
        }
    }

    debug!(
        "files={:?}, dirs={:?}",
        migratable_files, migratable_dirs
    );
    Ok((migratable_files, migratable_dirs))
}
