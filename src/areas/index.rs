//! Staging index
//!
//! The index mirrors the next commit: an ordered (path, stage) sequence of
//! cache entries persisted to one file per repository. Loading tolerates a
//! missing file (an "unborn" index, seen before the first checkout or
//! commit); writing is atomic (temp file + fsync + rename), so a reader
//! always observes either the complete old or the complete new index.
//!
//! ## Invariants
//!
//! - (path, stage) pairs are unique and kept sorted
//! - an entry carrying the REMOVE flag disappears at the next compaction
//! - empty-directory sentinels keep purely-empty trees representable

use crate::artifacts::index::cache_entry::{CacheEntry, CacheEntryFlags, EntryStat};
use crate::artifacts::index::checksum::Checksum;
use crate::artifacts::index::index_header::IndexHeader;
use crate::artifacts::index::{HEADER_SIZE, SIGNATURE, VERSION};
use crate::artifacts::index::cache_entry::{ENTRY_BLOCK, ENTRY_MIN_SIZE};
use crate::artifacts::objects::object::{Packable, Unpackable};
use crate::artifacts::objects::object_id::ObjectId;
use anyhow::{anyhow, Context};
use bytes::Bytes;
use std::io::Write;
use std::ops::DerefMut;
use std::path::{Path, PathBuf};
use tracing::warn;

/// In-memory index of one repository
#[derive(Debug, Clone)]
pub struct IndexState {
    /// Path of the on-disk index file
    path: PathBuf,
    /// Entries sorted by (path, stage)
    entries: Vec<CacheEntry>,
    /// True when no index file existed at load time
    unborn: bool,
}

impl IndexState {
    /// Load the index from disk
    ///
    /// A missing file yields an empty, unborn index. A present but
    /// unparseable file is an error (the caller marks the repo's index
    /// corrupted).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(IndexState {
                path: path.to_path_buf(),
                entries: Vec::new(),
                unborn: true,
            });
        }

        let mut index_file = std::fs::OpenOptions::new().read(true).open(path)?;
        let mut lock = file_guard::lock(&mut index_file, file_guard::Lock::Shared, 0, 1)?;

        let mut reader = Checksum::new(lock.deref_mut());
        let entries_count = Self::parse_header(&mut reader)?;
        let entries = Self::parse_entries(entries_count, &mut reader)?;
        reader.verify()?;

        Ok(IndexState {
            path: path.to_path_buf(),
            entries,
            unborn: false,
        })
    }

    fn parse_header<F: std::io::Read>(reader: &mut Checksum<F>) -> anyhow::Result<u32> {
        let header_bytes = reader.read(HEADER_SIZE)?;
        let header = IndexHeader::deserialize(&header_bytes)?;

        if header.marker != SIGNATURE {
            return Err(anyhow!("Invalid index file signature"));
        }
        if header.version != VERSION {
            return Err(anyhow!("Unsupported index file version: {}", header.version));
        }

        Ok(header.entries_count)
    }

    fn parse_entries<F: std::io::Read>(
        entries_count: u32,
        reader: &mut Checksum<F>,
    ) -> anyhow::Result<Vec<CacheEntry>> {
        let mut entries = Vec::with_capacity(entries_count as usize);

        for _ in 0..entries_count {
            let mut entry_bytes = reader.read(ENTRY_MIN_SIZE)?.to_vec();
            while entry_bytes[entry_bytes.len() - 1] != 0 {
                entry_bytes.extend_from_slice(&reader.read(ENTRY_BLOCK)?);
            }

            let entry = CacheEntry::deserialize(std::io::Cursor::new(Bytes::from(entry_bytes)))?;
            entries.push(entry);
        }

        // The on-disk order is authoritative only when already sorted
        if !entries.windows(2).all(|w| w[0] <= w[1]) {
            return Err(anyhow!("Index entries are out of order"));
        }

        Ok(entries)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when no index file existed at load time
    pub fn is_unborn(&self) -> bool {
        self.unborn
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Binary search for `(name, stage)`
    ///
    /// `Ok(pos)` is the entry's position; `Err(pos)` is where it would be
    /// inserted.
    pub fn entry_pos(&self, name: &str, stage: u8) -> Result<usize, usize> {
        self.entries
            .binary_search_by(|entry| entry.sort_key().cmp(&(name, stage)))
    }

    /// Stage-0 entry for `name`, if any
    pub fn entry(&self, name: &str) -> Option<&CacheEntry> {
        self.entry_pos(name, 0).ok().map(|pos| &self.entries[pos])
    }

    pub fn entries(&self) -> impl Iterator<Item = &CacheEntry> {
        self.entries.iter()
    }

    pub fn entries_mut(&mut self) -> impl Iterator<Item = &mut CacheEntry> {
        self.entries.iter_mut()
    }

    pub fn into_entries(self) -> Vec<CacheEntry> {
        self.entries
    }

    /// Replace the whole entry sequence (tree-walker result installation)
    pub fn replace_entries(&mut self, mut entries: Vec<CacheEntry>) {
        entries.sort();
        self.entries = entries;
        self.unborn = false;
    }

    /// Insert or replace an entry, keeping the sort order
    pub fn add_entry(&mut self, entry: CacheEntry) {
        match self.entry_pos(&entry.name, entry.stage) {
            Ok(pos) => self.entries[pos] = entry,
            Err(pos) => self.entries.insert(pos, entry),
        }
    }

    /// Stage one worktree file
    ///
    /// When a same-path entry already exists with matching stat fields the
    /// content is known unchanged and hashing is skipped entirely. The
    /// `indexer` callback chunks, optionally encrypts, and stores the file,
    /// returning its blob id.
    pub fn add_to_index(
        &mut self,
        name: &str,
        stat: EntryStat,
        indexer: impl FnOnce() -> anyhow::Result<ObjectId>,
    ) -> anyhow::Result<()> {
        if let Some(existing) = self.entry(name) {
            if !existing.is_empty_dir_sentinel() && existing.stat_match(&stat) {
                return Ok(()); // unchanged, skip re-hashing
            }
        }

        let oid = indexer().with_context(|| format!("Failed to index file {}", name))?;

        let mut entry = CacheEntry::new(
            name.to_string(),
            oid,
            crate::artifacts::index::entry_mode::EntryMode::Regular,
            stat,
        );
        if let Some(existing) = self.entry(name) {
            if existing.oid == entry.oid && existing.mode == entry.mode {
                // Same content under a fresher stat
                entry.flags = existing.flags;
            }
        }
        self.add_entry(entry);

        Ok(())
    }

    /// Insert an empty-directory sentinel so the directory survives a
    /// commit/checkout round trip
    pub fn add_empty_dir(&mut self, name: &str) {
        if self.entry(name).is_none() {
            self.add_entry(CacheEntry::empty_dir(name.to_string()));
        }
    }

    /// Drop every stage of `name`
    pub fn remove_entry(&mut self, name: &str) {
        self.entries.retain(|entry| entry.name != name);
    }

    /// Compact away entries carrying the REMOVE flag
    pub fn remove_marked_entries(&mut self) {
        self.entries
            .retain(|entry| !entry.flags.contains(CacheEntryFlags::REMOVE));
    }

    /// Any entry with a nonzero stage marks an unresolved three-way merge
    pub fn is_unmerged(&self) -> bool {
        self.entries.iter().any(|entry| entry.stage != 0)
    }

    /// Names of stage-0 entries under `prefix` ("" = everything)
    pub fn names_under_prefix(&self, prefix: &str) -> Vec<String> {
        self.entries
            .iter()
            .filter(|entry| entry.stage == 0 && name_has_prefix(&entry.name, prefix))
            .map(|entry| entry.name.clone())
            .collect()
    }

    /// Write the index atomically
    ///
    /// Serializes to a temp file in the index directory, fsyncs, then
    /// renames over the final path. On any error the on-disk index is left
    /// untouched.
    pub fn write(&mut self) -> anyhow::Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| anyhow!("Index path has no parent directory"))?;
        std::fs::create_dir_all(dir)?;

        let temp_path = dir.join(format!(
            ".tmp-index-{:08x}",
            rand::random::<u32>()
        ));
        let result = self.write_to(&temp_path).and_then(|_| {
            std::fs::rename(&temp_path, &self.path)
                .with_context(|| format!("Failed to move index into {}", self.path.display()))
        });

        if result.is_err() {
            if let Err(err) = std::fs::remove_file(&temp_path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %temp_path.display(), "failed to clean up temp index");
                }
            }
        } else {
            self.unborn = false;
        }

        result
    }

    fn write_to(&self, path: &Path) -> anyhow::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("Failed to open temp index {}", path.display()))?;

        {
            let mut writer = Checksum::new(&mut file);

            let header =
                IndexHeader::new(String::from(SIGNATURE), VERSION, self.entries.len() as u32);
            writer.write(&header.serialize()?)?;

            for entry in &self.entries {
                writer.write(&entry.serialize()?)?;
            }
            writer.write_checksum()?;
        }

        file.flush()?;
        file.sync_all()?;

        Ok(())
    }
}

/// Path-prefix check on whole components ("a/b" has prefix "a" but not "a/b
/// c" style partial names); the empty prefix matches everything
pub fn name_has_prefix(name: &str, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    match name.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::index::entry_mode::EntryMode;
    use rstest::{fixture, rstest};

    fn entry(name: &str, seed: &str) -> CacheEntry {
        CacheEntry::new(
            name.to_string(),
            ObjectId::hash_bytes(seed.as_bytes()),
            EntryMode::Regular,
            EntryStat::new(1, 2, 3),
        )
    }

    struct Scratch {
        _dir: tempfile::TempDir,
        state: IndexState,
    }

    impl std::ops::Deref for Scratch {
        type Target = IndexState;
        fn deref(&self) -> &IndexState {
            &self.state
        }
    }

    impl std::ops::DerefMut for Scratch {
        fn deref_mut(&mut self) -> &mut IndexState {
            &mut self.state
        }
    }

    #[fixture]
    fn index() -> Scratch {
        let dir = tempfile::tempdir().unwrap();
        let mut state = IndexState::load(&dir.path().join("index-file")).unwrap();
        state.add_entry(entry("b.txt", "b"));
        state.add_entry(entry("a.txt", "a"));
        state.add_entry(entry("dir/c.txt", "c"));
        Scratch { _dir: dir, state }
    }

    #[rstest]
    fn test_missing_file_is_unborn() {
        let dir = tempfile::tempdir().unwrap();
        let state = IndexState::load(&dir.path().join("absent")).unwrap();
        assert!(state.is_unborn());
        assert!(state.is_empty());
    }

    #[rstest]
    fn test_entries_stay_sorted(index: Scratch) {
        let names: Vec<_> = index.entries().map(|e| e.name.clone()).collect();
        pretty_assertions::assert_eq!(names, vec!["a.txt", "b.txt", "dir/c.txt"]);
    }

    #[rstest]
    fn test_entry_pos_reports_insertion_point(index: Scratch) {
        assert_eq!(index.entry_pos("a.txt", 0), Ok(0));
        assert_eq!(index.entry_pos("ab.txt", 0), Err(1));
    }

    #[rstest]
    fn test_write_then_load_roundtrip(mut index: Scratch) {
        index.write().unwrap();

        let reread = IndexState::load(index.path()).unwrap();
        assert!(!reread.is_unborn());
        pretty_assertions::assert_eq!(
            index.entries().cloned().collect::<Vec<_>>(),
            reread.entries().cloned().collect::<Vec<_>>()
        );
    }

    #[rstest]
    fn test_repeated_writes_are_byte_identical(mut index: Scratch) {
        index.write().unwrap();
        let first = std::fs::read(index.path()).unwrap();

        let mut reread = IndexState::load(index.path()).unwrap();
        reread.write().unwrap();
        let second = std::fs::read(index.path()).unwrap();

        pretty_assertions::assert_eq!(first, second);
    }

    #[rstest]
    fn test_add_to_index_skips_hashing_on_stat_match(mut index: Scratch) {
        let stat = EntryStat::new(1, 2, 3);
        index
            .add_to_index("a.txt", stat, || {
                panic!("indexer must not run for unchanged stat")
            })
            .unwrap();
    }

    #[rstest]
    fn test_add_to_index_rehashes_on_stat_change(mut index: Scratch) {
        let stat = EntryStat::new(9, 9, 9);
        index
            .add_to_index("a.txt", stat, || Ok(ObjectId::hash_bytes(b"fresh")))
            .unwrap();

        let entry = index.entry("a.txt").unwrap();
        assert_eq!(entry.oid, ObjectId::hash_bytes(b"fresh"));
        assert_eq!(entry.stat, stat);
    }

    #[rstest]
    fn test_remove_marked_entries_compacts(mut index: Scratch) {
        let pos = index.entry_pos("b.txt", 0).unwrap();
        index.entries[pos].flags |= CacheEntryFlags::REMOVE;

        index.remove_marked_entries();

        assert!(index.entry("b.txt").is_none());
        assert_eq!(index.len(), 2);
    }

    #[rstest]
    fn test_unmerged_detection(mut index: Scratch) {
        assert!(!index.is_unmerged());

        let mut staged = entry("conflict.txt", "x");
        staged.stage = 2;
        index.add_entry(staged);

        assert!(index.is_unmerged());
    }

    #[rstest]
    fn test_empty_dir_sentinel_roundtrip(mut index: Scratch) {
        index.add_empty_dir("hollow");
        index.write().unwrap();

        let reread = IndexState::load(index.path()).unwrap();
        assert!(reread.entry("hollow").unwrap().is_empty_dir_sentinel());
    }

    #[rstest]
    fn test_failed_write_leaves_old_index_intact(mut index: Scratch) {
        index.write().unwrap();
        let before = std::fs::read(index.path()).unwrap();

        // Make the rename target directory read-only so the final rename fails
        let dir = index.path().parent().unwrap().to_path_buf();
        let mut perms = std::fs::metadata(&dir).unwrap().permissions();
        let original = perms.clone();
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o555);
        std::fs::set_permissions(&dir, perms).unwrap();

        index.add_entry(entry("z.txt", "z"));
        let result = index.write();
        std::fs::set_permissions(&dir, original).unwrap();

        assert!(result.is_err());
        pretty_assertions::assert_eq!(before, std::fs::read(index.path()).unwrap());
    }

    #[rstest]
    #[case("dir/c.txt", "dir", true)]
    #[case("dir/c.txt", "di", false)]
    #[case("dir/c.txt", "", true)]
    #[case("dir", "dir", true)]
    fn test_name_has_prefix(#[case] name: &str, #[case] prefix: &str, #[case] expected: bool) {
        assert_eq!(name_has_prefix(name, prefix), expected);
    }
}
