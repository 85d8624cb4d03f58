//! Object and repository identifiers
//!
//! Blobs, chunks, trees and commits are keyed by hex-encoded SHA-1
//! (40 characters). Repositories are keyed by UUID (36 characters,
//! hyphenated form).
//!
//! ## Storage
//!
//! Objects are stored in `<store>/<first-2-chars>/<remaining-38-chars>`

use sha1::{Digest, Sha1};
use std::io;
use std::path::PathBuf;

/// Length of a hex-encoded object id
pub const OBJECT_ID_LENGTH: usize = 40;

/// Length of a raw SHA-1 digest in bytes
pub const RAW_ID_LENGTH: usize = 20;

/// Length of a hyphenated repository UUID
pub const REPO_ID_LENGTH: usize = 36;

/// Content address of an object (SHA-1 hash)
///
/// A 40-character hexadecimal string that uniquely identifies an object.
/// The default value is the all-zero id, used where no content exists yet
/// (empty-directory sentinels, untracked-file placeholders).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(String);

impl Default for ObjectId {
    fn default() -> Self {
        ObjectId("0".repeat(OBJECT_ID_LENGTH))
    }
}

impl ObjectId {
    /// Parse and validate an object id from a string
    pub fn try_parse(id: String) -> anyhow::Result<Self> {
        if id.len() != OBJECT_ID_LENGTH {
            return Err(anyhow::anyhow!("Invalid object id length: {}", id.len()));
        }
        if !id.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(anyhow::anyhow!("Invalid object id characters: {}", id));
        }
        Ok(Self(id))
    }

    /// Compute the id of a byte buffer
    pub fn hash_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self::from_digest(&hasher.finalize())
    }

    /// Build an id from a finalized 20-byte digest
    pub fn from_digest(digest: &[u8]) -> Self {
        let mut hex = String::with_capacity(OBJECT_ID_LENGTH);
        for byte in digest.iter().take(RAW_ID_LENGTH) {
            hex.push_str(&format!("{:02x}", byte));
        }
        Self(hex)
    }

    /// Write the id in raw binary form (20 bytes)
    ///
    /// Used when serializing index entries, blobs and trees.
    pub fn write_raw_to<W: io::Write>(&self, writer: &mut W) -> anyhow::Result<()> {
        // Process a nibble pair at a time
        for i in (0..OBJECT_ID_LENGTH).step_by(2) {
            let byte = u8::from_str_radix(&self.0[i..i + 2], 16)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "Invalid hex digit"))?;
            writer.write_all(&[byte])?;
        }

        Ok(())
    }

    /// Read an id from raw binary form (20 bytes)
    pub fn read_raw_from<R: io::Read + ?Sized>(reader: &mut R) -> anyhow::Result<Self> {
        let mut raw = [0u8; RAW_ID_LENGTH];
        reader.read_exact(&mut raw)?;
        Ok(Self::from_digest(&raw))
    }

    /// Raw 20-byte form of the id
    pub fn to_raw(&self) -> anyhow::Result<[u8; RAW_ID_LENGTH]> {
        let mut raw = [0u8; RAW_ID_LENGTH];
        for (i, slot) in raw.iter_mut().enumerate() {
            *slot = u8::from_str_radix(&self.0[2 * i..2 * i + 2], 16)
                .map_err(|_| anyhow::anyhow!("Invalid hex digit in object id"))?;
        }
        Ok(raw)
    }

    /// Convert to the fan-out path used by the object store
    ///
    /// `abc123...` becomes `ab/c123...`
    pub fn to_path(&self) -> PathBuf {
        let (dir, file) = self.0.split_at(2);
        PathBuf::from(dir).join(file)
    }

    /// Abbreviated form for log messages
    pub fn to_short_oid(&self) -> String {
        self.0.split_at(8).0.to_string()
    }

    /// True for the all-zero placeholder id
    pub fn is_zero(&self) -> bool {
        self.0.bytes().all(|b| b == b'0')
    }
}

impl AsRef<str> for ObjectId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Repository identifier (hyphenated UUID)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoId(String);

impl RepoId {
    /// Parse and validate a repository id
    pub fn try_parse(id: &str) -> anyhow::Result<Self> {
        if id.len() != REPO_ID_LENGTH {
            return Err(anyhow::anyhow!("Invalid repo id length: {}", id.len()));
        }
        uuid::Uuid::parse_str(id).map_err(|_| anyhow::anyhow!("Invalid repo id: {}", id))?;
        Ok(Self(id.to_string()))
    }

    /// Allocate a fresh repository id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().hyphenated().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for RepoId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RepoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
