//! Entry modes
//!
//! The engine tracks two kinds of entries: regular files and empty-directory
//! sentinels. Sentinels keep otherwise-empty directories representable in
//! trees and in the index.

/// Mode of an index or tree entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryMode {
    /// Regular file
    #[default]
    Regular,
    /// Directory (in trees: subtree; in the index: empty-dir sentinel)
    Directory,
}

impl EntryMode {
    pub fn as_u32(&self) -> u32 {
        match self {
            EntryMode::Regular => 0o100644,
            EntryMode::Directory => 0o040000,
        }
    }

    pub fn from_u32(mode: u32) -> anyhow::Result<Self> {
        match mode {
            0o100644 => Ok(EntryMode::Regular),
            0o040000 => Ok(EntryMode::Directory),
            _ => Err(anyhow::anyhow!("Unsupported entry mode: {:o}", mode)),
        }
    }

    pub fn from_octal_str(mode: &str) -> anyhow::Result<Self> {
        let mode = u32::from_str_radix(mode, 8)
            .map_err(|_| anyhow::anyhow!("Invalid octal mode: {}", mode))?;
        Self::from_u32(mode)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, EntryMode::Directory)
    }

    pub fn as_octal_str(&self) -> String {
        format!("{:o}", self.as_u32())
    }
}
