//! Patch application: deep-clone the base, replay the edit scripts, then
//! rebuild the derived state (string table, stats) from the patched
//! content so chained patches can never drift from the canonical form.

use crate::bpkg::model::ReleasePackage;
use crate::error::{Error, Result};
use crate::patch::model::{PropChange, ReleasePackagePatch, StringTableDelta};
use crate::patch::script::apply_script;

impl ReleasePackagePatch {
    pub fn apply(&self, base: &ReleasePackage) -> Result<ReleasePackage> {
        apply(base, self)
    }
}

/// Positional replay of the transported table delta. Superseded by the
/// rebuild at the end of `apply`; kept so a truncated apply still leaves a
/// plausible table behind.
fn apply_string_delta(table: &mut Vec<String>, delta: &StringTableDelta) {
    let mut removes = delta.removes.clone();
    removes.sort_unstable();
    for &index in removes.iter().rev() {
        if (index as usize) < table.len() {
            table.remove(index as usize);
        }
    }
    for (index, s) in &delta.adds {
        let at = (*index as usize).min(table.len());
        table.insert(at, s.clone());
    }
}

pub fn apply(base: &ReleasePackage, patch: &ReleasePackagePatch) -> Result<ReleasePackage> {
    if base.version != patch.version {
        return Err(Error::Unsupported(format!(
            "patch for version {} applied to version {}",
            patch.version, base.version
        )));
    }
    let mut pkg = base.clone();

    for change in &patch.property_changes {
        match change {
            PropChange::Add { key, value } | PropChange::Modify { key, value } => {
                pkg.custom_properties.insert(key.clone(), value.clone());
            }
            PropChange::Remove { key } => {
                pkg.custom_properties.remove(key);
            }
        }
    }

    apply_string_delta(&mut pkg.string_table, &patch.string_delta);

    if let Some(script) = &patch.chunk_script {
        pkg.chunks = apply_script(&base.chunks, script)?;
    }

    pkg.components = apply_script(&base.components, &patch.component_script)?;

    for cfp in &patch.component_file_patches {
        let comp = pkg
            .components
            .iter_mut()
            .find(|c| c.name == cfp.component)
            .ok_or_else(|| {
                Error::NotFound(format!("component {} named by patch", cfp.component))
            })?;
        comp.files = apply_script(&comp.files, &cfp.files)?;
        for modify in &cfp.modifies {
            let file = comp
                .files
                .iter_mut()
                .find(|f| f.name == modify.name)
                .ok_or_else(|| {
                    Error::NotFound(format!(
                        "file {} named by patch in component {}",
                        modify.name, cfp.component
                    ))
                })?;
            file.hash = modify.hash;
            if let Some(chunks) = &modify.chunks {
                file.chunks = chunks.clone();
            }
        }
    }

    pkg.release_id = patch.release_id.clone();
    pkg.repo_id = patch.repo_id.clone();
    pkg.notes = patch.notes.clone();
    pkg.created_at = patch.created_at;

    pkg.rebuild_string_table();
    // Counts come from the rebuilt tree; sizes from the child stats when
    // the version elides chunk spans from the package.
    pkg.stats = patch.stats;
    pkg.recompute_stats();
    Ok(pkg)
}

/// Left-fold a base through a chain of patches, oldest first.
pub fn apply_chain(
    base: &ReleasePackage,
    patches: &[ReleasePackagePatch],
) -> Result<ReleasePackage> {
    let mut pkg = base.clone();
    for patch in patches {
        pkg = apply(&pkg, patch)?;
    }
    Ok(pkg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bpkg::model::{
        ChunkInfo, Component, FORMAT_V1, FORMAT_V2, FileHash, ReleaseFile, delta_encode_refs,
    };
    use crate::hash::Hash32;

    fn file_v1(name: &str, fingerprint: u64, spans: &[(u32, u64, u64)]) -> ReleaseFile {
        ReleaseFile {
            name: name.into(),
            hash: FileHash::Short(fingerprint),
            chunks: delta_encode_refs(spans),
        }
    }

    fn file_v2(name: &str, seed: &[u8]) -> ReleaseFile {
        ReleaseFile {
            name: name.into(),
            hash: FileHash::Full(Hash32::of(seed)),
            chunks: Vec::new(),
        }
    }

    fn finish(mut pkg: ReleasePackage) -> ReleasePackage {
        // Canonical form: rebuilt table, recomputed stats, exactly what
        // apply() itself produces.
        pkg.rebuild_string_table();
        pkg.recompute_stats();
        pkg
    }

    fn v1_pair() -> (ReleasePackage, ReleasePackage) {
        let mut parent = ReleasePackage::new(FORMAT_V1, "1.0", "acme/app");
        parent.created_at = 100;
        parent.chunks = (0..5u32)
            .map(|i| ChunkInfo {
                checksum: Hash32::of(&i.to_le_bytes()),
            })
            .collect();
        parent.components = vec![
            Component {
                name: "A".into(),
                files: vec![
                    file_v1("a.txt", 0xa1, &[(0, 0, 100)]),
                    file_v1("b.txt", 0xb2, &[(1, 0, 150), (2, 150, 60)]),
                ],
            },
            Component {
                name: "B".into(),
                files: vec![file_v1("c.txt", 0xc3, &[(3, 0, 80)])],
            },
        ];
        parent.custom_properties.insert("env".into(), "prod".into());
        let parent = finish(parent);

        let mut child = ReleasePackage::new(FORMAT_V1, "1.1", "acme/app");
        child.created_at = 200;
        child.notes = "hotfix".into();
        child.chunks = (0..6u32)
            .filter(|&i| i != 2)
            .map(|i| ChunkInfo {
                checksum: Hash32::of(&i.to_le_bytes()),
            })
            .collect();
        child.components = vec![
            Component {
                name: "A".into(),
                files: vec![
                    file_v1("a.txt", 0xa1, &[(0, 0, 100)]),
                    file_v1("d.txt", 0xd4, &[(4, 0, 40)]),
                ],
            },
            Component {
                name: "C".into(),
                files: vec![file_v1("e.txt", 0xe5, &[(2, 0, 90)])],
            },
        ];
        child.custom_properties.insert("env".into(), "prod".into());
        child
            .custom_properties
            .insert("channel".into(), "stable".into());
        (parent, finish(child))
    }

    #[test]
    fn apply_reproduces_the_child_v1() {
        let (parent, child) = v1_pair();
        let patch = ReleasePackagePatch::create(&parent, &child).unwrap();
        let applied = patch.apply(&parent).unwrap();
        assert_eq!(applied, child);
    }

    #[test]
    fn apply_reproduces_the_child_v2() {
        let mut parent = ReleasePackage::new(FORMAT_V2, "2.0", "acme/app");
        parent.components = vec![Component {
            name: "web".into(),
            files: vec![file_v2("index.html", b"one"), file_v2("app.js", b"two")],
        }];
        parent.stats.raw_size = 1000;
        parent.stats.deduped_size = 900;
        let parent = finish(parent);

        let mut child = ReleasePackage::new(FORMAT_V2, "2.1", "acme/app");
        child.components = vec![Component {
            name: "web".into(),
            files: vec![
                file_v2("index.html", b"one-changed"),
                file_v2("app.js", b"two"),
                file_v2("app.css", b"three"),
            ],
        }];
        child.stats.raw_size = 1500;
        child.stats.deduped_size = 1200;
        let child = finish(child);

        let patch = ReleasePackagePatch::create(&parent, &child).unwrap();
        assert!(patch.file_hash_script.is_some());
        assert!(patch.content_id_delta.is_none());
        let applied = patch.apply(&parent).unwrap();
        assert_eq!(applied, child);
        // v2 sizes travel with the patch.
        assert_eq!(applied.stats.raw_size, 1500);
        assert_eq!(applied.stats.deduped_size, 1200);
    }

    #[test]
    fn chained_patches_left_fold() {
        let (parent, child) = v1_pair();
        let mut grandchild = child.clone();
        grandchild.release_id = "1.2".into();
        grandchild.components[0].files[0].hash = FileHash::Short(0xff);
        grandchild
            .custom_properties
            .insert("channel".into(), "beta".into());
        let grandchild = finish(grandchild);

        let p1 = ReleasePackagePatch::create(&parent, &child).unwrap();
        let p2 = ReleasePackagePatch::create(&child, &grandchild).unwrap();
        let applied = apply_chain(&parent, &[p1, p2]).unwrap();
        assert_eq!(applied, grandchild);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let (parent, child) = v1_pair();
        let patch = ReleasePackagePatch::create(&parent, &child).unwrap();
        let mut wrong = parent.clone();
        wrong.version = FORMAT_V2;
        assert!(matches!(
            patch.apply(&wrong),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn string_table_is_rebuilt_canonically() {
        let (parent, child) = v1_pair();
        let patch = ReleasePackagePatch::create(&parent, &child).unwrap();
        let applied = patch.apply(&parent).unwrap();
        let mut sorted = applied.string_table.clone();
        sorted.sort();
        assert_eq!(applied.string_table, sorted);
        // Tokens of removed names are gone, new ones present.
        assert!(applied.string_table.iter().any(|s| s == "e"));
        assert!(!applied.string_table.iter().any(|s| s == "c"));
    }
}
