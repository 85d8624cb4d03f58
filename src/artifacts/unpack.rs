//! Tree walker and worktree update planner
//!
//! Walks one, two or three flattened trees in lockstep with the index and
//! asks a merge strategy what to do at every path. The outcome is a result
//! index whose entries carry UPDATE / WT_REMOVE flags; `update_worktree`
//! then applies those flags to the filesystem (deletions first, then
//! writes) and refreshes stat fields, so the final index matches what is
//! on disk.
//!
//! Strategies:
//! - **oneway** (reset / revert): force index and worktree to the single
//!   target tree
//! - **twoway** (checkout): index matching HEAD moves to the new tree;
//!   index matching the new tree stays; anything else is a conflict
//! - **threeway** (merge): trivial resolutions are computed here; real
//!   conflicts come back as stage-1/2/3 entries plus a conflict record for
//!   the merge engine to resolve with content

use crate::areas::index::IndexState;
use crate::areas::object_store::{ObjectStore, TreeSlot};
use crate::areas::worktree::Worktree;
use crate::artifacts::crypt::CryptKey;
use crate::artifacts::index::cache_entry::{CacheEntry, CacheEntryFlags, EntryStat};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

/// What the walker consults at one path position
#[derive(Debug)]
struct WalkPosition<'w> {
    name: &'w str,
    slots: Vec<Option<&'w TreeSlot>>,
    index_entry: Option<&'w CacheEntry>,
}

/// Unresolved three-way position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictEntry {
    pub name: String,
    pub ancestor: Option<TreeSlot>,
    pub ours: Option<TreeSlot>,
    pub theirs: Option<TreeSlot>,
}

/// Walker output: planned index plus unresolved positions
#[derive(Debug, Default)]
pub struct UnpackResult {
    pub entries: Vec<CacheEntry>,
    pub conflicts: Vec<ConflictEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    Oneway,
    Twoway,
    Threeway,
}

/// Probe for files held open by other processes
///
/// Consulted before destructive worktree changes (not on initial checkout
/// and not when recovering an interrupted merge). The engine itself has no
/// platform lock tables; hosts that do install their own probe.
pub trait LockedFileProbe: Send + Sync {
    fn any_locked(&self, worktree: &Worktree, paths: &[String]) -> bool;
}

/// Default probe: nothing is ever locked
pub struct NoopLockedFileProbe;

impl LockedFileProbe for NoopLockedFileProbe {
    fn any_locked(&self, _worktree: &Worktree, _paths: &[String]) -> bool {
        false
    }
}

fn slots_equal(a: Option<&TreeSlot>, b: Option<&TreeSlot>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.mode == b.mode && a.oid == b.oid,
        _ => false,
    }
}

fn entry_matches(entry: Option<&CacheEntry>, slot: Option<&TreeSlot>) -> bool {
    match (entry, slot) {
        (None, None) => true,
        // Directory slots compare by mode alone: a sentinel entry carries
        // the zero id while the tree side holds the empty subtree's id
        (Some(entry), Some(slot)) => {
            entry.mode == slot.mode && (entry.mode.is_dir() || entry.oid == slot.oid)
        }
        _ => false,
    }
}

fn entry_from_slot(name: &str, slot: &TreeSlot, flags: CacheEntryFlags) -> CacheEntry {
    let mut entry = CacheEntry::new(
        name.to_string(),
        slot.oid.clone(),
        slot.mode,
        EntryStat::default(),
    );
    entry.flags = flags;
    entry
}

fn removal_of(entry: &CacheEntry) -> CacheEntry {
    let mut removal = entry.clone();
    removal.flags |= CacheEntryFlags::WT_REMOVE;
    removal
}

/// Walk `trees` against `index` under the given strategy
///
/// Tree order: oneway `[target]`; twoway `[head, new]`; threeway
/// `[ancestor, ours, theirs]`.
pub fn unpack_trees(
    trees: &[std::collections::BTreeMap<String, TreeSlot>],
    index: &IndexState,
    strategy: MergeStrategy,
) -> anyhow::Result<UnpackResult> {
    let expected = match strategy {
        MergeStrategy::Oneway => 1,
        MergeStrategy::Twoway => 2,
        MergeStrategy::Threeway => 3,
    };
    if trees.len() != expected {
        return Err(anyhow::anyhow!(
            "Strategy expects {} tree(s), got {}",
            expected,
            trees.len()
        ));
    }

    let mut names = BTreeSet::new();
    for tree in trees {
        names.extend(tree.keys().map(String::as_str));
    }
    names.extend(
        index
            .entries()
            .filter(|entry| entry.stage == 0)
            .map(|entry| entry.name.as_str()),
    );

    let mut result = UnpackResult::default();

    for name in names {
        let position = WalkPosition {
            name,
            slots: trees.iter().map(|tree| tree.get(name)).collect(),
            index_entry: index.entry(name),
        };

        match strategy {
            MergeStrategy::Oneway => oneway_merge(&position, &mut result),
            MergeStrategy::Twoway => twoway_merge(&position, &mut result),
            MergeStrategy::Threeway => threeway_merge(&position, &mut result),
        }
    }

    Ok(result)
}

/// Force index and worktree to match the single target tree
fn oneway_merge(position: &WalkPosition<'_>, result: &mut UnpackResult) {
    let target = position.slots[0];

    match (position.index_entry, target) {
        (Some(entry), None) => result.entries.push(removal_of(entry)),
        (Some(entry), Some(slot)) if entry_matches(Some(entry), Some(slot)) => {
            result.entries.push(entry.clone());
        }
        (_, Some(slot)) => {
            result
                .entries
                .push(entry_from_slot(position.name, slot, CacheEntryFlags::UPDATE));
        }
        (None, None) => {}
    }
}

/// Carry the index from HEAD to the new tree, refusing local divergence
fn twoway_merge(position: &WalkPosition<'_>, result: &mut UnpackResult) {
    let head = position.slots[0];
    let new = position.slots[1];
    let entry = position.index_entry;

    if slots_equal(head, new) {
        // Nothing moved between the trees; local state wins
        if let Some(entry) = entry {
            result.entries.push(entry.clone());
        } else if let Some(slot) = new {
            result
                .entries
                .push(entry_from_slot(position.name, slot, CacheEntryFlags::UPDATE));
        }
        return;
    }

    if entry_matches(entry, head) {
        // Index is at HEAD: replace with the new tree's view
        match (entry, new) {
            (_, Some(slot)) => {
                result
                    .entries
                    .push(entry_from_slot(position.name, slot, CacheEntryFlags::UPDATE))
            }
            (Some(entry), None) => result.entries.push(removal_of(entry)),
            (None, None) => {}
        }
        return;
    }

    if entry_matches(entry, new) {
        // Already where the checkout is going
        if let Some(entry) = entry {
            result.entries.push(entry.clone());
        }
        return;
    }

    debug!(path = position.name, "twoway conflict");
    result.conflicts.push(ConflictEntry {
        name: position.name.to_string(),
        ancestor: head.cloned(),
        ours: entry.map(|entry| TreeSlot {
            mode: entry.mode,
            oid: entry.oid.clone(),
        }),
        theirs: new.cloned(),
    });
}

/// Resolve the trivial three-way cases, surface the rest as conflicts
fn threeway_merge(position: &WalkPosition<'_>, result: &mut UnpackResult) {
    let ancestor = position.slots[0];
    let ours = position.slots[1];
    let theirs = position.slots[2];
    let entry = position.index_entry;

    // Both sides agree
    if slots_equal(ours, theirs) {
        match (entry, ours) {
            (Some(entry), Some(slot)) if entry_matches(Some(entry), Some(slot)) => {
                result.entries.push(entry.clone());
            }
            (_, Some(slot)) => {
                result
                    .entries
                    .push(entry_from_slot(position.name, slot, CacheEntryFlags::UPDATE));
            }
            (Some(entry), None) => result.entries.push(removal_of(entry)),
            (None, None) => {}
        }
        return;
    }

    // Only the remote side changed
    if slots_equal(ancestor, ours) {
        match theirs {
            Some(slot) => result.entries.push(entry_from_slot(
                position.name,
                slot,
                CacheEntryFlags::UPDATE,
            )),
            None => {
                if let Some(entry) = entry {
                    result.entries.push(removal_of(entry));
                }
            }
        }
        return;
    }

    // Only our side changed
    if slots_equal(ancestor, theirs) {
        if let Some(entry) = entry {
            result.entries.push(entry.clone());
        } else if let Some(slot) = ours {
            result
                .entries
                .push(entry_from_slot(position.name, slot, CacheEntryFlags::UPDATE));
        }
        return;
    }

    // Both changed, differently: record all present stages
    debug!(path = position.name, "threeway conflict");
    for (stage, slot) in [(1u8, ancestor), (2, ours), (3, theirs)] {
        if let Some(slot) = slot {
            let mut staged = entry_from_slot(position.name, slot, CacheEntryFlags::empty());
            staged.stage = stage;
            result.entries.push(staged);
        }
    }
    result.conflicts.push(ConflictEntry {
        name: position.name.to_string(),
        ancestor: ancestor.cloned(),
        ours: ours.cloned(),
        theirs: theirs.cloned(),
    });
}

/// Paths the plan will write or delete (input for the locked-file probe)
pub fn planned_destructive_paths(entries: &[CacheEntry]) -> Vec<String> {
    entries
        .iter()
        .filter(|entry| {
            entry
                .flags
                .intersects(CacheEntryFlags::UPDATE | CacheEntryFlags::WT_REMOVE)
                && !entry.is_empty_dir_sentinel()
        })
        .map(|entry| entry.name.clone())
        .collect()
}

/// Apply a walker plan to the worktree
///
/// Deletions run first (files before their now-empty parents, handled by
/// pruning), then writes with parent directories created on demand and
/// chunk decryption when a key is present. Each applied entry bumps
/// `finished`, refreshes its stat from disk and sheds its plan flags;
/// WT_REMOVE entries drop out of the final sequence.
pub fn update_worktree(
    result: &mut UnpackResult,
    store: &ObjectStore,
    worktree: &Worktree,
    crypt: Option<&CryptKey>,
    finished: Option<&AtomicI64>,
) -> anyhow::Result<()> {
    // deletions
    for entry in result
        .entries
        .iter()
        .filter(|entry| entry.flags.contains(CacheEntryFlags::WT_REMOVE))
    {
        if entry.is_empty_dir_sentinel() {
            worktree.remove_empty_dir(&entry.name)?;
        } else {
            worktree.remove_file_and_prune(&entry.name)?;
        }
        if let Some(finished) = finished {
            finished.fetch_add(1, Ordering::Relaxed);
        }
    }
    result
        .entries
        .retain(|entry| !entry.flags.contains(CacheEntryFlags::WT_REMOVE));

    // writes
    for entry in result.entries.iter_mut() {
        if !entry.flags.contains(CacheEntryFlags::UPDATE) {
            continue;
        }

        if entry.is_empty_dir_sentinel() {
            worktree.make_dir(&entry.name)?;
        } else {
            let chunks = store.read_blob_chunks(&entry.oid)?;
            worktree.write_file_decrypted(&entry.name, &chunks, crypt)?;
        }

        if let Some(stat) = worktree.stat(&entry.name) {
            entry.stat = stat.entry_stat();
        }
        entry.flags.remove(CacheEntryFlags::UPDATE);

        if let Some(finished) = finished {
            finished.fetch_add(1, Ordering::Relaxed);
        }
    }

    result.entries.sort();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::index::entry_mode::EntryMode;
    use crate::artifacts::objects::object_id::ObjectId;
    use rstest::rstest;
    use std::collections::BTreeMap;
    use std::path::Path;

    fn slot(seed: &str) -> TreeSlot {
        TreeSlot {
            mode: EntryMode::Regular,
            oid: ObjectId::hash_bytes(seed.as_bytes()),
        }
    }

    fn tree(entries: &[(&str, &str)]) -> BTreeMap<String, TreeSlot> {
        entries
            .iter()
            .map(|(name, seed)| (name.to_string(), slot(seed)))
            .collect()
    }

    fn index_with(entries: &[(&str, &str)]) -> IndexState {
        let mut index = IndexState::load(Path::new("/nonexistent/index")).unwrap();
        for (name, seed) in entries {
            index.add_entry(CacheEntry::new(
                name.to_string(),
                ObjectId::hash_bytes(seed.as_bytes()),
                EntryMode::Regular,
                EntryStat::new(1, 1, 1),
            ));
        }
        index
    }

    #[rstest]
    fn test_oneway_plans_updates_and_removals() {
        let index = index_with(&[("keep.txt", "same"), ("gone.txt", "old")]);
        let target = tree(&[("keep.txt", "same"), ("new.txt", "fresh")]);

        let result = unpack_trees(&[target], &index, MergeStrategy::Oneway).unwrap();

        let flags: BTreeMap<&str, CacheEntryFlags> = result
            .entries
            .iter()
            .map(|e| (e.name.as_str(), e.flags))
            .collect();
        assert_eq!(flags["keep.txt"], CacheEntryFlags::empty());
        assert!(flags["gone.txt"].contains(CacheEntryFlags::WT_REMOVE));
        assert!(flags["new.txt"].contains(CacheEntryFlags::UPDATE));
        assert!(result.conflicts.is_empty());
    }

    #[rstest]
    fn test_twoway_moves_index_at_head_to_new() {
        let index = index_with(&[("a.txt", "v1")]);
        let head = tree(&[("a.txt", "v1")]);
        let new = tree(&[("a.txt", "v2")]);

        let result = unpack_trees(&[head, new], &index, MergeStrategy::Twoway).unwrap();

        assert!(result.conflicts.is_empty());
        assert_eq!(result.entries.len(), 1);
        assert!(result.entries[0].flags.contains(CacheEntryFlags::UPDATE));
        assert_eq!(result.entries[0].oid, ObjectId::hash_bytes(b"v2"));
    }

    #[rstest]
    fn test_twoway_keeps_index_already_at_new() {
        let index = index_with(&[("a.txt", "v2")]);
        let head = tree(&[("a.txt", "v1")]);
        let new = tree(&[("a.txt", "v2")]);

        let result = unpack_trees(&[head, new], &index, MergeStrategy::Twoway).unwrap();

        assert!(result.conflicts.is_empty());
        assert_eq!(result.entries[0].flags, CacheEntryFlags::empty());
    }

    #[rstest]
    fn test_twoway_flags_local_divergence_as_conflict() {
        let index = index_with(&[("a.txt", "local-edit")]);
        let head = tree(&[("a.txt", "v1")]);
        let new = tree(&[("a.txt", "v2")]);

        let result = unpack_trees(&[head, new], &index, MergeStrategy::Twoway).unwrap();

        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].name, "a.txt");
    }

    #[rstest]
    fn test_threeway_takes_remote_only_change() {
        let index = index_with(&[("a.txt", "base")]);
        let ancestor = tree(&[("a.txt", "base")]);
        let ours = tree(&[("a.txt", "base")]);
        let theirs = tree(&[("a.txt", "remote")]);

        let result =
            unpack_trees(&[ancestor, ours, theirs], &index, MergeStrategy::Threeway).unwrap();

        assert!(result.conflicts.is_empty());
        assert_eq!(result.entries[0].oid, ObjectId::hash_bytes(b"remote"));
        assert!(result.entries[0].flags.contains(CacheEntryFlags::UPDATE));
    }

    #[rstest]
    fn test_threeway_keeps_local_only_change() {
        let index = index_with(&[("a.txt", "local")]);
        let ancestor = tree(&[("a.txt", "base")]);
        let ours = tree(&[("a.txt", "local")]);
        let theirs = tree(&[("a.txt", "base")]);

        let result =
            unpack_trees(&[ancestor, ours, theirs], &index, MergeStrategy::Threeway).unwrap();

        assert!(result.conflicts.is_empty());
        assert_eq!(result.entries[0].oid, ObjectId::hash_bytes(b"local"));
        assert_eq!(result.entries[0].flags, CacheEntryFlags::empty());
    }

    #[rstest]
    fn test_threeway_emits_stages_on_real_conflict() {
        let index = index_with(&[("a.txt", "local")]);
        let ancestor = tree(&[("a.txt", "base")]);
        let ours = tree(&[("a.txt", "local")]);
        let theirs = tree(&[("a.txt", "remote")]);

        let result =
            unpack_trees(&[ancestor, ours, theirs], &index, MergeStrategy::Threeway).unwrap();

        assert_eq!(result.conflicts.len(), 1);
        let stages: Vec<u8> = result.entries.iter().map(|e| e.stage).collect();
        pretty_assertions::assert_eq!(stages, vec![1, 2, 3]);
    }

    #[rstest]
    fn test_planned_destructive_paths_skips_sentinels() {
        let mut update = CacheEntry::new(
            "file.txt".into(),
            ObjectId::hash_bytes(b"x"),
            EntryMode::Regular,
            EntryStat::default(),
        );
        update.flags = CacheEntryFlags::UPDATE;
        let mut sentinel = CacheEntry::empty_dir("hollow".into());
        sentinel.flags = CacheEntryFlags::UPDATE;

        let paths = planned_destructive_paths(&[update, sentinel]);
        pretty_assertions::assert_eq!(paths, vec!["file.txt"]);
    }
}
