//! Index file format
//!
//! The index (staging area) mirrors the next commit. One index file exists
//! per repository, at `<data_dir>/index/<repo_id>`.
//!
//! ## File Format (Version 1)
//!
//! ```text
//! Header (12 bytes):
//!   - Signature: "SIDX" (4 bytes)
//!   - Version: 1 (4 bytes)
//!   - Entry count (4 bytes)
//!
//! Entries (variable length):
//!   - Each entry padded to 8-byte alignment
//!   - Sorted by (path, stage)
//!
//! Checksum (20 bytes):
//!   - SHA-1 hash of all preceding bytes
//! ```

pub mod cache_entry;
pub mod checksum;
pub mod entry_mode;
pub mod index_header;

/// Size of index header in bytes
pub const HEADER_SIZE: usize = 12; // 4 bytes for marker, 4 for version, 4 for entries_count

/// Magic signature identifying index files
pub const SIGNATURE: &str = "SIDX";

/// Index file format version
pub const VERSION: u32 = 1;
