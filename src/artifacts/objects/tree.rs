//! Directory listing objects
//!
//! A tree is an ordered sequence of `(name, mode, object_id)` entries, where
//! each id refers to a blob or a subtree. The serialization is canonical:
//! entries are emitted in byte-lexicographic name order, so two trees with
//! the same logical content always share one id.
//!
//! ## Format
//!
//! On disk: `tree <size>\0<entries>`
//! Each entry: `<octal mode> <name>\0<20-byte-sha1>`

use crate::artifacts::index::entry_mode::EntryMode;
use crate::artifacts::objects::object::{with_header, Object, Packable, Unpackable};
use crate::artifacts::objects::object_id::ObjectId;
use crate::artifacts::objects::object_type::ObjectType;
use anyhow::Context;
use bytes::Bytes;
use derive_new::new;
use std::collections::BTreeMap;
use std::io::BufRead;

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, new)]
pub struct TreeEntry {
    pub mode: EntryMode,
    pub oid: ObjectId,
}

/// Directory snapshot object
///
/// Entries are keyed by name; the `BTreeMap` keeps them in the canonical
/// byte-lexicographic order for serialization.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Tree {
    entries: BTreeMap<String, TreeEntry>,
}

impl Tree {
    pub fn insert(&mut self, name: String, entry: TreeEntry) {
        self.entries.insert(name, entry);
    }

    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.get(name)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&String, &TreeEntry)> {
        self.entries.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Packable for Tree {
    fn serialize(&self) -> anyhow::Result<Bytes> {
        let mut content = Vec::new();
        for (name, entry) in &self.entries {
            content.extend_from_slice(
                format!("{} {}\0", entry.mode.as_octal_str(), name).as_bytes(),
            );
            entry.oid.write_raw_to(&mut content)?;
        }

        Ok(with_header(ObjectType::Tree, &content))
    }
}

impl Unpackable for Tree {
    fn deserialize(mut reader: impl BufRead) -> anyhow::Result<Self> {
        let mut entries = BTreeMap::new();

        // Reuse scratch buffers to reduce allocs
        let mut mode_bytes = Vec::new();
        let mut name_bytes = Vec::new();

        loop {
            mode_bytes.clear();
            let n = reader.read_until(b' ', &mut mode_bytes)?;
            if n == 0 {
                break; // clean EOF: no more entries
            }
            if mode_bytes.pop() != Some(b' ') {
                return Err(anyhow::anyhow!("unexpected EOF in mode"));
            }
            let mode = EntryMode::from_octal_str(std::str::from_utf8(&mode_bytes)?)?;

            name_bytes.clear();
            let n = reader.read_until(b'\0', &mut name_bytes)?;
            if n == 0 || name_bytes.pop() != Some(b'\0') {
                return Err(anyhow::anyhow!("unexpected EOF in name"));
            }
            let name = std::str::from_utf8(&name_bytes)?.to_owned();

            let oid = ObjectId::read_raw_from(&mut reader).context("unexpected EOF in object id")?;

            entries.insert(name, TreeEntry::new(mode, oid));
        }

        Ok(Tree { entries })
    }
}

impl Object for Tree {
    fn object_type(&self) -> ObjectType {
        ObjectType::Tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Cursor;

    fn oid(seed: &str) -> ObjectId {
        ObjectId::hash_bytes(seed.as_bytes())
    }

    #[rstest]
    fn test_tree_id_is_insertion_order_independent() {
        let mut a = Tree::default();
        a.insert("zebra.txt".into(), TreeEntry::new(EntryMode::Regular, oid("z")));
        a.insert("alpha.txt".into(), TreeEntry::new(EntryMode::Regular, oid("a")));

        let mut b = Tree::default();
        b.insert("alpha.txt".into(), TreeEntry::new(EntryMode::Regular, oid("a")));
        b.insert("zebra.txt".into(), TreeEntry::new(EntryMode::Regular, oid("z")));

        pretty_assertions::assert_eq!(a.object_id().unwrap(), b.object_id().unwrap());
    }

    #[rstest]
    fn test_tree_serialization_roundtrip() {
        let mut tree = Tree::default();
        tree.insert("file.txt".into(), TreeEntry::new(EntryMode::Regular, oid("f")));
        tree.insert("empty".into(), TreeEntry::new(EntryMode::Directory, oid("d")));

        let bytes = tree.serialize().unwrap();
        let mut reader = Cursor::new(bytes);
        let (object_type, _) = ObjectType::parse_object_header(&mut reader).unwrap();
        let reread = Tree::deserialize(reader).unwrap();

        assert_eq!(object_type, ObjectType::Tree);
        pretty_assertions::assert_eq!(tree, reread);
    }
}
