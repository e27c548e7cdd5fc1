// src/overlays/layer_hash.rs

//! The overlay validation hash for a part.
//!
//! Each layer's hash chains the part's overlay-relevant parameters with
//! the hash of the layer below it, so a change anywhere in the stack
//! changes every hash above it. Non-overlay part properties are
//! deliberately excluded: a `build-packages` change must not invalidate
//! the overlay, only BUILD.

use crate::error::Result;
use crate::parts::Part;
use sha1::{Digest, Sha1};
use std::fs;
use std::io;
use std::path::PathBuf;

/// A 20-byte layer verification digest, stored hex-encoded at
/// `parts/<name>/state/layer_hash`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LayerHash {
    bytes: Vec<u8>,
}

impl LayerHash {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Compute the validation hash for a part layered above `previous`.
    pub fn for_part(part: &Part, previous: &LayerHash) -> LayerHash {
        let mut hasher = Sha1::new();

        for entry in &part.spec().overlay_packages {
            hasher.update(entry.as_bytes());
        }

        if let Some(overlay_files) = &part.spec().overlay_files {
            for entry in overlay_files {
                hasher.update(entry.as_bytes());
            }
        }

        if let Some(script) = &part.spec().override_overlay {
            hasher.update(script.as_bytes());
        }

        hasher.update(&previous.bytes);

        LayerHash {
            bytes: hasher.finalize().to_vec(),
        }
    }

    fn hash_file(part: &Part) -> PathBuf {
        part.part_state_dir().join("layer_hash")
    }

    /// Read the part's layer hash from persistent state.
    pub fn load(part: &Part) -> Result<Option<LayerHash>> {
        match fs::read_to_string(Self::hash_file(part)) {
            Ok(content) => {
                let hex_string = content.lines().next().unwrap_or("").trim();
                let bytes = hex::decode(hex_string).unwrap_or_default();
                Ok(Some(LayerHash { bytes }))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Save the part's layer hash to persistent state.
    pub fn save(&self, part: &Part) -> Result<()> {
        let path = Self::hash_file(part);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.hex())?;
        Ok(())
    }

    /// The hash as bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The hash as a hexadecimal string.
    pub fn hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infos::ProjectDirs;
    use crate::parts::PartSpec;
    use quickcheck::quickcheck;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn part_with_overlay(
        dirs: &Arc<ProjectDirs>,
        packages: &[&str],
        script: Option<&str>,
    ) -> Part {
        let spec = PartSpec {
            overlay_packages: packages.iter().map(|s| s.to_string()).collect(),
            override_overlay: script.map(str::to_string),
            ..PartSpec::default()
        };
        Part::new("p1", spec, Arc::clone(dirs)).unwrap()
    }

    #[test]
    fn test_hash_is_deterministic() {
        let dirs = Arc::new(ProjectDirs::new("/work", None));
        let part = part_with_overlay(&dirs, &["a", "b"], Some("echo"));
        let previous = LayerHash::default();
        assert_eq!(
            LayerHash::for_part(&part, &previous),
            LayerHash::for_part(&part, &previous)
        );
    }

    #[test]
    fn test_hash_changes_with_each_input() {
        let dirs = Arc::new(ProjectDirs::new("/work", None));
        let previous = LayerHash::default();

        let base = LayerHash::for_part(&part_with_overlay(&dirs, &["a"], None), &previous);
        let packages_changed =
            LayerHash::for_part(&part_with_overlay(&dirs, &["b"], None), &previous);
        let script_added =
            LayerHash::for_part(&part_with_overlay(&dirs, &["a"], Some("echo")), &previous);
        let chained = LayerHash::for_part(&part_with_overlay(&dirs, &["a"], None), &base);

        assert_ne!(base, packages_changed);
        assert_ne!(base, script_added);
        assert_ne!(base, chained);
        assert_ne!(packages_changed, script_added);
    }

    #[test]
    fn test_previous_hash_seeds_the_chain() {
        let dirs = Arc::new(ProjectDirs::new("/work", None));
        let part = part_with_overlay(&dirs, &[], None);
        let seed_a = LayerHash::new(vec![1; 20]);
        let seed_b = LayerHash::new(vec![2; 20]);
        assert_ne!(
            LayerHash::for_part(&part, &seed_a),
            LayerHash::for_part(&part, &seed_b)
        );
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let dirs = Arc::new(ProjectDirs::new(tmp.path(), None));
        let part = part_with_overlay(&dirs, &["pkg"], None);

        assert!(LayerHash::load(&part).unwrap().is_none());

        let hash = LayerHash::for_part(&part, &LayerHash::default());
        hash.save(&part).unwrap();

        let loaded = LayerHash::load(&part).unwrap().unwrap();
        assert_eq!(loaded, hash);
        assert_eq!(loaded.hex().len(), 40);
    }

    quickcheck! {
        fn prop_distinct_package_lists_distinct_hashes(a: Vec<String>, b: Vec<String>) -> bool {
            let dirs = Arc::new(ProjectDirs::new("/work", None));
            let previous = LayerHash::default();
            let pa: Vec<&str> = a.iter().map(String::as_str).collect();
            let pb: Vec<&str> = b.iter().map(String::as_str).collect();
            let ha = LayerHash::for_part(&part_with_overlay(&dirs, &pa, None), &previous);
            let hb = LayerHash::for_part(&part_with_overlay(&dirs, &pb, None), &previous);
            // equal inputs hash equal; the digest only collides on equal
            // concatenations, which equal inputs trivially satisfy
            (a.concat() == b.concat()) == (ha == hb)
        }
    }
}
