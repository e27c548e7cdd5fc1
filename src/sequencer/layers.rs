// src/sequencer/layers.rs

//! Planning-time view of overlay layer hashes.
//!
//! Stored hashes come from each part's persisted `layer_hash` file;
//! current hashes are computed from the specification. When planning
//! decides a layer will be rebuilt, its in-memory hash is refreshed so
//! the layers above it cascade correctly within the same plan.

use crate::error::Result;
use crate::overlays::LayerHash;
use crate::parts::Part;
use std::collections::BTreeMap;

pub struct LayerStateManager {
    base_layer_hash: LayerHash,
    stored: BTreeMap<String, Option<LayerHash>>,
}

impl LayerStateManager {
    pub fn new(part_list: &[Part], base_layer_hash: Option<LayerHash>) -> Result<Self> {
        let mut stored = BTreeMap::new();
        for part in part_list {
            stored.insert(part.name().to_string(), LayerHash::load(part)?);
        }
        Ok(Self {
            base_layer_hash: base_layer_hash.unwrap_or_default(),
            stored,
        })
    }

    /// The hash recorded for a part's layer, if any.
    pub fn get_layer_hash(&self, part: &Part) -> Option<LayerHash> {
        self.stored.get(part.name()).cloned().flatten()
    }

    /// Record the hash a planned overlay run will produce.
    pub fn set_layer_hash(&mut self, part: &Part, hash: LayerHash) {
        self.stored.insert(part.name().to_string(), Some(hash));
    }

    /// The hash the part's layer has under the current specification.
    pub fn compute_layer_hash(&self, part_list: &[Part], part: &Part) -> LayerHash {
        let mut hash = self.base_layer_hash.clone();
        for each in part_list {
            hash = LayerHash::for_part(each, &hash);
            if each.name() == part.name() {
                break;
            }
        }
        hash
    }

    /// The verification hash of the complete overlay stack.
    pub fn overlay_hash(&self, part_list: &[Part]) -> LayerHash {
        match part_list.last() {
            Some(last) => self.compute_layer_hash(part_list, last),
            None => self.base_layer_hash.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infos::ProjectDirs;
    use crate::parts::PartSpec;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn parts(tmp: &TempDir) -> Vec<Part> {
        let dirs = Arc::new(ProjectDirs::new(tmp.path(), None));
        vec![
            Part::new("p1", PartSpec::default(), Arc::clone(&dirs)).unwrap(),
            Part::new(
                "p2",
                PartSpec {
                    override_overlay: Some("echo".to_string()),
                    ..PartSpec::default()
                },
                dirs,
            )
            .unwrap(),
        ]
    }

    #[test]
    fn test_stored_hash_tracks_planned_runs() {
        let tmp = TempDir::new().unwrap();
        let parts = parts(&tmp);
        let mut layers = LayerStateManager::new(&parts, None).unwrap();

        assert!(layers.get_layer_hash(&parts[0]).is_none());

        let computed = layers.compute_layer_hash(&parts, &parts[0]);
        layers.set_layer_hash(&parts[0], computed.clone());
        assert_eq!(layers.get_layer_hash(&parts[0]), Some(computed));
    }

    #[test]
    fn test_chain_computation_is_cumulative() {
        let tmp = TempDir::new().unwrap();
        let parts = parts(&tmp);
        let layers = LayerStateManager::new(&parts, None).unwrap();

        let bottom = layers.compute_layer_hash(&parts, &parts[0]);
        let top = layers.compute_layer_hash(&parts, &parts[1]);
        assert_ne!(bottom, top);
        assert_eq!(layers.overlay_hash(&parts), top);
    }
}
