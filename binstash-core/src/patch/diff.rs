//! Patch creation: diff a parent release package against a child.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::bpkg::model::{FORMAT_V1, FORMAT_V2, ReleasePackage, unique_file_hashes};
use crate::bpkg::refs;
use crate::error::{Error, Result};
use crate::patch::model::{
    ComponentFilePatch, ContentIdChange, ContentIdDelta, FileModify, PropChange,
    ReleasePackagePatch, StringTableDelta,
};
use crate::patch::script::diff_by_key;

impl ReleasePackagePatch {
    /// Diff `parent` against `child`. Both packages must carry the same
    /// format version.
    pub fn create(parent: &ReleasePackage, child: &ReleasePackage) -> Result<Self> {
        create(parent, child)
    }
}

fn string_delta(parent: &ReleasePackage, child: &ReleasePackage) -> StringTableDelta {
    let parent_set: HashSet<&str> = parent.string_table.iter().map(String::as_str).collect();
    let child_set: HashSet<&str> = child.string_table.iter().map(String::as_str).collect();
    StringTableDelta {
        adds: child
            .string_table
            .iter()
            .enumerate()
            .filter(|(_, s)| !parent_set.contains(s.as_str()))
            .map(|(i, s)| (i as u32, s.clone()))
            .collect(),
        removes: parent
            .string_table
            .iter()
            .enumerate()
            .filter(|(_, s)| !child_set.contains(s.as_str()))
            .map(|(i, _)| i as u32)
            .collect(),
    }
}

fn content_id_map(pkg: &ReleasePackage) -> BTreeMap<u64, Vec<crate::bpkg::model::DeltaChunkRef>> {
    let mut map = BTreeMap::new();
    for comp in &pkg.components {
        for file in &comp.files {
            map.entry(refs::content_id(&file.chunks))
                .or_insert_with(|| file.chunks.clone());
        }
    }
    map
}

fn content_id_delta(parent: &ReleasePackage, child: &ReleasePackage) -> ContentIdDelta {
    let parent_map = content_id_map(parent);
    let child_map = content_id_map(child);
    let mut delta = ContentIdDelta::default();
    for (&cid, list) in &child_map {
        match parent_map.get(&cid) {
            None => delta.adds.push(ContentIdChange {
                content_id: cid,
                refs: list.clone(),
            }),
            Some(existing) if existing != list => delta.modifies.push(ContentIdChange {
                content_id: cid,
                refs: list.clone(),
            }),
            Some(_) => {}
        }
    }
    delta.removes = parent_map
        .keys()
        .filter(|cid| !child_map.contains_key(cid))
        .copied()
        .collect();
    delta
}

fn property_changes(parent: &ReleasePackage, child: &ReleasePackage) -> Vec<PropChange> {
    let mut changes = Vec::new();
    for (key, value) in &child.custom_properties {
        match parent.custom_properties.get(key) {
            None => changes.push(PropChange::Add {
                key: key.clone(),
                value: value.clone(),
            }),
            Some(old) if old != value => changes.push(PropChange::Modify {
                key: key.clone(),
                value: value.clone(),
            }),
            Some(_) => {}
        }
    }
    for key in parent.custom_properties.keys() {
        if !child.custom_properties.contains_key(key) {
            changes.push(PropChange::Remove { key: key.clone() });
        }
    }
    changes
}

pub fn create(parent: &ReleasePackage, child: &ReleasePackage) -> Result<ReleasePackagePatch> {
    if parent.version != child.version {
        return Err(Error::Unsupported(format!(
            "patch across package versions {} -> {}",
            parent.version, child.version
        )));
    }

    let component_script = diff_by_key(&parent.components, &child.components, |c| c.name.clone());

    // File scripts for every component kept on both sides, plus modifies
    // for same-named files whose content changed.
    let child_comps: HashMap<&str, &crate::bpkg::model::Component> = child
        .components
        .iter()
        .map(|c| (c.name.as_str(), c))
        .collect();
    let mut component_file_patches = Vec::new();
    for parent_comp in &parent.components {
        let Some(child_comp) = child_comps.get(parent_comp.name.as_str()) else {
            continue;
        };
        let files = diff_by_key(&parent_comp.files, &child_comp.files, |f| f.name.clone());
        let parent_files: HashMap<&str, &crate::bpkg::model::ReleaseFile> = parent_comp
            .files
            .iter()
            .map(|f| (f.name.as_str(), f))
            .collect();
        let mut modifies = Vec::new();
        for child_file in &child_comp.files {
            let Some(parent_file) = parent_files.get(child_file.name.as_str()) else {
                continue;
            };
            if parent_file.hash != child_file.hash || parent_file.chunks != child_file.chunks {
                modifies.push(FileModify {
                    name: child_file.name.clone(),
                    hash: child_file.hash,
                    chunks: (parent.version == FORMAT_V1).then(|| child_file.chunks.clone()),
                });
            }
        }
        if !files.is_identity() || !modifies.is_empty() {
            component_file_patches.push(ComponentFilePatch {
                component: parent_comp.name.clone(),
                files,
                modifies,
            });
        }
    }

    Ok(ReleasePackagePatch {
        version: child.version,
        release_id: child.release_id.clone(),
        repo_id: child.repo_id.clone(),
        notes: child.notes.clone(),
        created_at: child.created_at,
        stats: child.stats,
        string_delta: string_delta(parent, child),
        chunk_script: (parent.version == FORMAT_V1)
            .then(|| diff_by_key(&parent.chunks, &child.chunks, |c| c.checksum)),
        file_hash_script: (parent.version == FORMAT_V2).then(|| {
            diff_by_key(
                &unique_file_hashes(parent),
                &unique_file_hashes(child),
                |&h| h,
            )
        }),
        content_id_delta: (parent.version == FORMAT_V1)
            .then(|| content_id_delta(parent, child)),
        component_script,
        component_file_patches,
        property_changes: property_changes(parent, child),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpkg::model::{
        ChunkInfo, Component, FileHash, ReleaseFile, delta_encode_refs,
    };
    use crate::hash::Hash32;

    fn v1_parent() -> ReleasePackage {
        let mut pkg = ReleasePackage::new(FORMAT_V1, "1.0", "repo");
        pkg.chunks = (0..4u32)
            .map(|i| ChunkInfo {
                checksum: Hash32::of(&i.to_le_bytes()),
            })
            .collect();
        pkg.components = vec![Component {
            name: "app".into(),
            files: vec![
                ReleaseFile {
                    name: "a.txt".into(),
                    hash: FileHash::Short(1),
                    chunks: delta_encode_refs(&[(0, 0, 100)]),
                },
                ReleaseFile {
                    name: "b.txt".into(),
                    hash: FileHash::Short(2),
                    chunks: delta_encode_refs(&[(1, 0, 200)]),
                },
            ],
        }];
        pkg.string_table = vec!["a".into(), "app".into(), "b".into(), "txt".into()];
        pkg.recompute_stats();
        pkg
    }

    #[test]
    fn cross_version_diff_is_rejected() {
        let parent = v1_parent();
        let mut child = v1_parent();
        child.version = FORMAT_V2;
        assert!(matches!(
            ReleasePackagePatch::create(&parent, &child),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn identity_diff_is_empty() {
        let parent = v1_parent();
        let patch = ReleasePackagePatch::create(&parent, &parent).unwrap();
        assert!(patch.component_script.is_identity());
        assert!(patch.component_file_patches.is_empty());
        assert!(patch.property_changes.is_empty());
        assert!(patch.string_delta.adds.is_empty());
        assert!(patch.string_delta.removes.is_empty());
        assert!(patch.chunk_script.unwrap().is_identity());
        let delta = patch.content_id_delta.unwrap();
        assert!(delta.adds.is_empty() && delta.removes.is_empty() && delta.modifies.is_empty());
    }

    #[test]
    fn modified_file_lands_in_modifies_with_chunks_for_v1() {
        let parent = v1_parent();
        let mut child = v1_parent();
        child.components[0].files[1].hash = FileHash::Short(99);
        child.components[0].files[1].chunks = delta_encode_refs(&[(2, 0, 300), (3, 300, 50)]);
        let patch = ReleasePackagePatch::create(&parent, &child).unwrap();
        assert_eq!(patch.component_file_patches.len(), 1);
        let cfp = &patch.component_file_patches[0];
        assert!(cfp.files.is_identity(), "same names, so only modifies");
        assert_eq!(cfp.modifies.len(), 1);
        assert_eq!(cfp.modifies[0].name, "b.txt");
        assert_eq!(cfp.modifies[0].hash, FileHash::Short(99));
        assert!(cfp.modifies[0].chunks.is_some());
    }

    #[test]
    fn content_id_delta_tracks_list_changes() {
        let parent = v1_parent();
        let mut child = v1_parent();
        child.components[0].files[0].chunks = delta_encode_refs(&[(3, 0, 75)]);
        let patch = ReleasePackagePatch::create(&parent, &child).unwrap();
        let delta = patch.content_id_delta.unwrap();
        assert_eq!(delta.adds.len(), 1);
        assert_eq!(delta.removes.len(), 1);
    }
}
