//! Tree derivation from the index
//!
//! Walks the sorted cache entries once, assembling the directory hierarchy
//! bottom-up and emitting a tree object at every directory boundary through
//! a store callback. Children are hashed before their parent so subtree ids
//! are known when the parent serializes.
//!
//! The derivation is deterministic: identical `(path, mode, blob_id)` tuples
//! produce identical root ids regardless of insertion history.

use crate::artifacts::index::cache_entry::CacheEntry;
use crate::artifacts::index::entry_mode::EntryMode;
use crate::artifacts::objects::object_id::ObjectId;
use crate::artifacts::objects::tree::{Tree, TreeEntry};
use std::collections::BTreeMap;

#[derive(Default)]
struct TreeNode {
    files: BTreeMap<String, (EntryMode, ObjectId)>,
    subdirs: BTreeMap<String, TreeNode>,
}

impl TreeNode {
    fn descend(&mut self, component: &str) -> &mut TreeNode {
        self.subdirs.entry(component.to_string()).or_default()
    }

    /// Post-order emission: children first, then this node
    fn store(&self, emit: &mut impl FnMut(&Tree) -> anyhow::Result<ObjectId>) -> anyhow::Result<ObjectId> {
        let mut tree = Tree::default();

        for (name, node) in &self.subdirs {
            let subtree_id = node.store(emit)?;
            tree.insert(name.clone(), TreeEntry::new(EntryMode::Directory, subtree_id));
        }
        for (name, (mode, oid)) in &self.files {
            tree.insert(name.clone(), TreeEntry::new(*mode, oid.clone()));
        }

        emit(&tree)
    }
}

/// Derive the root tree id of an index, storing every tree on the way
///
/// `emit` receives each finished tree object (leaves first) and returns its
/// id after persisting it. Entries with a nonzero merge stage make the
/// derivation fail: an unresolved merge has no single tree.
pub fn cache_tree_update(
    entries: &[CacheEntry],
    emit: &mut impl FnMut(&Tree) -> anyhow::Result<ObjectId>,
) -> anyhow::Result<ObjectId> {
    let mut root = TreeNode::default();

    for entry in entries {
        if entry.stage != 0 {
            return Err(anyhow::anyhow!(
                "Cannot build a tree from an unmerged index ({})",
                entry.name
            ));
        }

        let mut components: Vec<&str> = entry.name.split('/').collect();
        let leaf = components
            .pop()
            .ok_or_else(|| anyhow::anyhow!("Empty entry path"))?;

        let mut node = &mut root;
        for component in components {
            node = node.descend(component);
        }

        if entry.is_empty_dir_sentinel() {
            node.descend(leaf);
        } else {
            node.files
                .insert(leaf.to_string(), (entry.mode, entry.oid.clone()));
        }
    }

    root.store(emit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::index::cache_entry::EntryStat;
    use crate::artifacts::objects::object::Object;
    use rstest::rstest;

    fn entry(name: &str, seed: &str) -> CacheEntry {
        CacheEntry::new(
            name.to_string(),
            ObjectId::hash_bytes(seed.as_bytes()),
            EntryMode::Regular,
            EntryStat::new(7, 8, 9),
        )
    }

    fn root_of(entries: &[CacheEntry]) -> ObjectId {
        cache_tree_update(entries, &mut |tree| tree.object_id()).unwrap()
    }

    #[rstest]
    fn test_root_id_ignores_insertion_order() {
        let forward = vec![entry("a.txt", "a"), entry("dir/b.txt", "b")];
        let mut backward = forward.clone();
        backward.reverse();

        pretty_assertions::assert_eq!(root_of(&forward), root_of(&backward));
    }

    #[rstest]
    fn test_root_id_ignores_stat_fields() {
        let mut a = entry("a.txt", "a");
        let mut b = a.clone();
        a.stat = EntryStat::new(1, 1, 1);
        b.stat = EntryStat::new(2, 2, 2);

        pretty_assertions::assert_eq!(root_of(&[a]), root_of(&[b]));
    }

    #[rstest]
    fn test_empty_dir_sentinel_produces_empty_subtree() {
        let mut trees = Vec::new();
        cache_tree_update(&[CacheEntry::empty_dir("hollow".into())], &mut |tree| {
            trees.push(tree.clone());
            tree.object_id()
        })
        .unwrap();

        // one empty subtree plus the root
        assert_eq!(trees.len(), 2);
        assert!(trees[0].is_empty());
        assert_eq!(trees[1].len(), 1);
    }

    #[rstest]
    fn test_nested_dirs_emit_leaves_first() {
        let mut sizes = Vec::new();
        cache_tree_update(
            &[entry("x/y/z.txt", "z"), entry("top.txt", "t")],
            &mut |tree| {
                sizes.push(tree.len());
                tree.object_id()
            },
        )
        .unwrap();

        // y (1 file), x (1 subdir), root (subdir + file)
        pretty_assertions::assert_eq!(sizes, vec![1, 1, 2]);
    }

    #[rstest]
    fn test_unmerged_entries_are_rejected() {
        let mut staged = entry("war.txt", "w");
        staged.stage = 2;

        let result = cache_tree_update(&[staged], &mut |tree| tree.object_id());
        assert!(result.is_err());
    }
}
