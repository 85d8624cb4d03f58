//! Cache entry representation
//!
//! Each entry in the index represents one tracked path with:
//! - Path relative to the worktree root (unix separators)
//! - Content hash (blob id; zero-hash irrelevant for dir sentinels)
//! - Stat fields (ctime, mtime, size) for fast change detection
//! - Flag bits driving compaction and worktree updates
//! - Merge stage (0 = merged; 1/2/3 = ancestor/ours/theirs of an
//!   unresolved three-way merge)
//!
//! ## Entry Format
//!
//! Entries are stored in a binary format with 8-byte alignment:
//!
//! ```text
//! ctime (8) mtime (8) size (8) mode (4) stage (2) flags (2)
//! blob id (20) path (variable, NUL-terminated, padded to 8)
//! ```

use crate::artifacts::index::entry_mode::EntryMode;
use crate::artifacts::objects::object::{Packable, Unpackable};
use crate::artifacts::objects::object_id::ObjectId;
use bitflags::bitflags;
use byteorder::{ByteOrder, WriteBytesExt};
use bytes::Bytes;
use derive_new::new;
use std::io::{BufRead, Write};

/// Block size for entry alignment
pub const ENTRY_BLOCK: usize = 8;

/// Size of the fixed part of an entry plus minimum path/padding
pub const ENTRY_MIN_SIZE: usize = 56;

bitflags! {
    /// Transient per-entry markers
    ///
    /// REMOVE marks an entry for the next compaction pass. UPDATE and
    /// WT_REMOVE are produced by the tree walker and consumed while the
    /// worktree update plan is applied; they are never persisted.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CacheEntryFlags: u16 {
        const REMOVE    = 0b001;
        const UPDATE    = 0b010;
        const WT_REMOVE = 0b100;
    }
}

/// Stat fields used for change detection without content reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, new)]
pub struct EntryStat {
    /// Status change time, unix seconds
    pub ctime: i64,
    /// Content modification time, unix seconds
    pub mtime: i64,
    /// File size in bytes
    pub size: u64,
}

/// One tracked path in the index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Path relative to the worktree root, unix separators
    pub name: String,
    /// Blob id of the content (plaintext hash)
    pub oid: ObjectId,
    pub mode: EntryMode,
    pub stat: EntryStat,
    pub stage: u8,
    pub flags: CacheEntryFlags,
}

impl CacheEntry {
    pub fn new(name: String, oid: ObjectId, mode: EntryMode, stat: EntryStat) -> Self {
        CacheEntry {
            name,
            oid,
            mode,
            stat,
            stage: 0,
            flags: CacheEntryFlags::empty(),
        }
    }

    /// Empty-directory sentinel for `path`
    pub fn empty_dir(name: String) -> Self {
        Self::new(
            name,
            ObjectId::default(),
            EntryMode::Directory,
            EntryStat::default(),
        )
    }

    pub fn is_empty_dir_sentinel(&self) -> bool {
        self.mode.is_dir()
    }

    /// True when on-disk stat fields match this entry exactly
    pub fn stat_match(&self, stat: &EntryStat) -> bool {
        self.stat.ctime == stat.ctime
            && self.stat.mtime == stat.mtime
            && self.stat.size == stat.size
    }

    /// Sort key: byte-lexicographic path, then merge stage
    pub fn sort_key(&self) -> (&str, u8) {
        (&self.name, self.stage)
    }
}

impl PartialOrd for CacheEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CacheEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl Packable for CacheEntry {
    fn serialize(&self) -> anyhow::Result<Bytes> {
        let mut entry_bytes = Vec::new();
        entry_bytes.write_i64::<byteorder::NetworkEndian>(self.stat.ctime)?;
        entry_bytes.write_i64::<byteorder::NetworkEndian>(self.stat.mtime)?;
        entry_bytes.write_u64::<byteorder::NetworkEndian>(self.stat.size)?;
        entry_bytes.write_u32::<byteorder::NetworkEndian>(self.mode.as_u32())?;
        entry_bytes.write_u16::<byteorder::NetworkEndian>(self.stage as u16)?;
        // Only the persistent flag bits survive serialization
        entry_bytes
            .write_u16::<byteorder::NetworkEndian>((self.flags & CacheEntryFlags::REMOVE).bits())?;
        self.oid.write_raw_to(&mut entry_bytes)?;
        entry_bytes.write_all(self.name.as_bytes())?;

        // At least one NUL, then pad to the alignment block
        entry_bytes.push(0);
        while entry_bytes.len() % ENTRY_BLOCK != 0 {
            entry_bytes.push(0);
        }

        Ok(Bytes::from(entry_bytes))
    }
}

impl Unpackable for CacheEntry {
    fn deserialize(reader: impl BufRead) -> anyhow::Result<Self> {
        let bytes = reader
            .bytes()
            .collect::<Result<Vec<u8>, std::io::Error>>()?;

        if bytes.len() < ENTRY_MIN_SIZE {
            return Err(anyhow::anyhow!("Invalid cache entry size"));
        }

        let ctime = byteorder::NetworkEndian::read_i64(&bytes[0..8]);
        let mtime = byteorder::NetworkEndian::read_i64(&bytes[8..16]);
        let size = byteorder::NetworkEndian::read_u64(&bytes[16..24]);
        let mode = EntryMode::from_u32(byteorder::NetworkEndian::read_u32(&bytes[24..28]))?;
        let stage = byteorder::NetworkEndian::read_u16(&bytes[28..30]) as u8;
        let flags = CacheEntryFlags::from_bits_truncate(byteorder::NetworkEndian::read_u16(
            &bytes[30..32],
        ));
        let mut oid_bytes = std::io::Cursor::new(&bytes[32..52]);
        let oid = ObjectId::read_raw_from(&mut oid_bytes)?;

        let name_end = bytes[52..]
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| anyhow::anyhow!("Missing NUL terminator in entry path"))?;
        let name = std::str::from_utf8(&bytes[52..52 + name_end])
            .map_err(|_| anyhow::anyhow!("Invalid UTF-8 in entry path"))?
            .to_string();

        if stage > 3 {
            return Err(anyhow::anyhow!("Invalid merge stage: {}", stage));
        }

        Ok(CacheEntry {
            name,
            oid,
            mode,
            stat: EntryStat::new(ctime, mtime, size),
            stage,
            flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};
    use std::io::Cursor;

    #[fixture]
    fn entry() -> CacheEntry {
        CacheEntry::new(
            "dir/file.txt".into(),
            ObjectId::hash_bytes(b"content"),
            EntryMode::Regular,
            EntryStat::new(1700000000, 1700000001, 42),
        )
    }

    #[rstest]
    fn test_entry_serialization_roundtrip(entry: CacheEntry) {
        let bytes = entry.serialize().unwrap();
        assert_eq!(bytes.len() % ENTRY_BLOCK, 0);

        let reread = CacheEntry::deserialize(Cursor::new(bytes)).unwrap();
        pretty_assertions::assert_eq!(entry, reread);
    }

    #[rstest]
    fn test_transient_flags_are_not_persisted(mut entry: CacheEntry) {
        entry.flags = CacheEntryFlags::UPDATE | CacheEntryFlags::WT_REMOVE;

        let bytes = entry.serialize().unwrap();
        let reread = CacheEntry::deserialize(Cursor::new(bytes)).unwrap();

        assert!(reread.flags.is_empty());
    }

    #[rstest]
    fn test_entries_sort_by_path_then_stage(entry: CacheEntry) {
        let mut staged = entry.clone();
        staged.stage = 2;
        let mut earlier = entry.clone();
        earlier.name = "a.txt".into();

        let mut entries = vec![staged.clone(), entry.clone(), earlier.clone()];
        entries.sort();

        pretty_assertions::assert_eq!(entries, vec![earlier, entry, staged]);
    }

    #[rstest]
    fn test_empty_dir_sentinel(entry: CacheEntry) {
        let sentinel = CacheEntry::empty_dir("empty".into());
        assert!(sentinel.is_empty_dir_sentinel());
        assert!(!entry.is_empty_dir_sentinel());
    }

    #[rstest]
    fn test_stat_match(entry: CacheEntry) {
        assert!(entry.stat_match(&EntryStat::new(1700000000, 1700000001, 42)));
        assert!(!entry.stat_match(&EntryStat::new(1700000000, 1700000002, 42)));
    }
}
