//! Worktree / index / head difference collectors
//!
//! Three collectors compose into a status report:
//! - worktree vs index (modified and deleted tracked paths)
//! - worktree walk for untracked paths
//! - index vs the head commit's tree (what the next commit would change)
//!
//! Post-processing collapses deletion artifacts around empty directories
//! and pairs additions with deletions of identical content into renames.
//! Stat fields short-circuit content comparison exactly like staging does.

use crate::areas::index::IndexState;
use crate::areas::object_store::ObjectStore;
use crate::areas::worktree::Worktree;
use crate::artifacts::objects::object_id::ObjectId;
use std::collections::BTreeMap;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffStatus {
    Added,
    Deleted,
    Modified,
    Renamed,
    DirAdded,
    DirDeleted,
}

/// One observed difference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEntry {
    pub status: DiffStatus,
    pub name: String,
    /// Target path of a rename
    pub new_name: Option<String>,
    pub oid: ObjectId,
}

impl DiffEntry {
    fn new(status: DiffStatus, name: String, oid: ObjectId) -> Self {
        DiffEntry {
            status,
            name,
            new_name: None,
            oid,
        }
    }
}

/// Tracked paths whose worktree state disagrees with the index
///
/// Stat agreement short-circuits; otherwise content is re-hashed (hashing
/// is over plaintext, so no key material is needed).
pub fn collect_changes_worktree(
    index: &IndexState,
    worktree: &Worktree,
    store: &ObjectStore,
) -> anyhow::Result<Vec<DiffEntry>> {
    let mut results = Vec::new();

    for entry in index.entries().filter(|entry| entry.stage == 0) {
        let stat = worktree.stat(&entry.name);

        if entry.is_empty_dir_sentinel() {
            match stat {
                Some(stat) if stat.is_dir => {}
                _ => results.push(DiffEntry::new(
                    DiffStatus::DirDeleted,
                    entry.name.clone(),
                    entry.oid.clone(),
                )),
            }
            continue;
        }

        match stat {
            None => results.push(DiffEntry::new(
                DiffStatus::Deleted,
                entry.name.clone(),
                entry.oid.clone(),
            )),
            Some(stat) if !stat.is_file => results.push(DiffEntry::new(
                DiffStatus::Deleted,
                entry.name.clone(),
                entry.oid.clone(),
            )),
            Some(stat) if entry.stat_match(&stat.entry_stat()) => {}
            Some(_) => {
                let on_disk = store.compute_blob_id(&worktree.full_path(&entry.name))?;
                if on_disk != entry.oid {
                    results.push(DiffEntry::new(
                        DiffStatus::Modified,
                        entry.name.clone(),
                        on_disk,
                    ));
                }
            }
        }
    }

    Ok(results)
}

/// Worktree paths absent from the index and not ignored
pub fn collect_untracked(
    index: &IndexState,
    worktree: &Worktree,
) -> anyhow::Result<Vec<DiffEntry>> {
    let mut results = Vec::new();
    collect_untracked_dir(index, worktree, "", &mut results)?;
    Ok(results)
}

fn collect_untracked_dir(
    index: &IndexState,
    worktree: &Worktree,
    relpath: &str,
    results: &mut Vec<DiffEntry>,
) -> anyhow::Result<()> {
    let mut listing = worktree.read_dir_filtered(relpath)?;
    listing.sort_by(|a, b| a.0.cmp(&b.0));

    for (name, stat) in listing {
        let path = if relpath.is_empty() {
            name
        } else {
            format!("{}/{}", relpath, name)
        };

        if stat.is_file {
            if index.entry(&path).is_none() {
                results.push(DiffEntry::new(
                    DiffStatus::Added,
                    path,
                    ObjectId::default(),
                ));
            }
        } else if stat.is_dir {
            if worktree.is_empty_dir(&path)? {
                if index.entry(&path).is_none() {
                    results.push(DiffEntry::new(
                        DiffStatus::DirAdded,
                        path,
                        ObjectId::default(),
                    ));
                }
            } else {
                collect_untracked_dir(index, worktree, &path, results)?;
            }
        }
    }

    Ok(())
}

/// What the index would change relative to the head commit's tree
pub fn collect_changes_index(
    index: &IndexState,
    head_root: Option<&ObjectId>,
    store: &ObjectStore,
) -> anyhow::Result<Vec<DiffEntry>> {
    let head = store.flatten_tree(head_root)?;
    let mut results = Vec::new();

    let staged: BTreeMap<&str, &crate::artifacts::index::cache_entry::CacheEntry> = index
        .entries()
        .filter(|entry| entry.stage == 0)
        .map(|entry| (entry.name.as_str(), entry))
        .collect();

    for (name, entry) in &staged {
        match head.get(*name) {
            None => {
                let status = if entry.is_empty_dir_sentinel() {
                    DiffStatus::DirAdded
                } else {
                    DiffStatus::Added
                };
                results.push(DiffEntry::new(status, name.to_string(), entry.oid.clone()));
            }
            // Directory slots compare by mode alone (sentinels carry the
            // zero id, trees the empty subtree's id)
            Some(slot)
                if slot.mode == entry.mode
                    && (entry.is_empty_dir_sentinel() || slot.oid == entry.oid) => {}
            Some(slot) if slot.mode == entry.mode => {
                results.push(DiffEntry::new(
                    DiffStatus::Modified,
                    name.to_string(),
                    entry.oid.clone(),
                ));
            }
            Some(_) => {
                // mode flip: report as delete + add of the new shape
                results.push(DiffEntry::new(
                    DiffStatus::Deleted,
                    name.to_string(),
                    entry.oid.clone(),
                ));
                results.push(DiffEntry::new(
                    DiffStatus::Added,
                    name.to_string(),
                    entry.oid.clone(),
                ));
            }
        }
    }

    for (name, slot) in &head {
        if !staged.contains_key(name.as_str()) {
            let status = if slot.mode.is_dir() {
                DiffStatus::DirDeleted
            } else {
                DiffStatus::Deleted
            };
            results.push(DiffEntry::new(status, name.clone(), slot.oid.clone()));
        }
    }

    Ok(results)
}

/// Drop empty-dir additions that only exist because everything under the
/// directory was deleted
pub fn resolve_empty_dirs(results: &mut Vec<DiffEntry>) {
    let deleted_prefixes: Vec<String> = results
        .iter()
        .filter(|entry| {
            matches!(entry.status, DiffStatus::Deleted | DiffStatus::DirDeleted)
        })
        .map(|entry| entry.name.clone())
        .collect();

    results.retain(|entry| {
        entry.status != DiffStatus::DirAdded
            || !deleted_prefixes
                .iter()
                .any(|deleted| deleted.starts_with(&format!("{}/", entry.name)))
    });
}

/// Pair an addition and a deletion carrying the same blob id into a rename
pub fn resolve_renames(results: &mut Vec<DiffEntry>) {
    let mut renamed = Vec::new();

    for added_pos in 0..results.len() {
        if results[added_pos].status != DiffStatus::Added || results[added_pos].oid.is_zero() {
            continue;
        }
        let oid = results[added_pos].oid.clone();

        if let Some(deleted_pos) = results.iter().position(|candidate| {
            candidate.status == DiffStatus::Deleted && candidate.oid == oid
        }) {
            renamed.push((deleted_pos, added_pos));
        }
    }

    let mut dropped: Vec<usize> = Vec::new();
    let mut replacements = Vec::new();
    for (deleted_pos, added_pos) in renamed {
        if dropped.contains(&deleted_pos) || dropped.contains(&added_pos) {
            continue;
        }
        let mut entry = results[deleted_pos].clone();
        entry.status = DiffStatus::Renamed;
        entry.new_name = Some(results[added_pos].name.clone());
        replacements.push(entry);
        dropped.push(deleted_pos);
        dropped.push(added_pos);
    }

    let mut index = 0;
    results.retain(|_| {
        let keep = !dropped.contains(&index);
        index += 1;
        keep
    });
    results.extend(replacements);
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Human-readable one-paragraph summary, used for generated commit
/// descriptions
pub fn describe_changes(results: &[DiffEntry]) -> Option<String> {
    if results.is_empty() {
        return None;
    }

    let mut desc = String::new();
    let groups: [(DiffStatus, &str, &str); 6] = [
        (DiffStatus::Added, "Added", "files"),
        (DiffStatus::Deleted, "Deleted", "files"),
        (DiffStatus::Renamed, "Renamed", "files"),
        (DiffStatus::Modified, "Modified", "files"),
        (DiffStatus::DirAdded, "Added directory", "directories"),
        (DiffStatus::DirDeleted, "Removed directory", "directories"),
    ];

    for (status, verb, plural) in groups {
        let matching: Vec<&DiffEntry> =
            results.iter().filter(|entry| entry.status == status).collect();
        match matching.len() {
            0 => {}
            1 => desc.push_str(&format!("{} \"{}\".\n", verb, basename(&matching[0].name))),
            n => desc.push_str(&format!(
                "{} \"{}\" and {} more {}.\n",
                verb,
                basename(&matching[0].name),
                n - 1,
                plural
            )),
        }
    }

    if desc.is_empty() {
        warn!("diff results present but nothing describable");
        return None;
    }
    Some(desc)
}
