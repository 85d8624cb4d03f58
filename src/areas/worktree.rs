//! Worktree access
//!
//! The worktree is the user-visible mutable directory tracked by a repo.
//! This module owns all direct filesystem access under it: stat with the
//! fields change detection needs, ignore-aware directory listing, and the
//! write/remove primitives the checkout planner applies.
//!
//! All content writes go through a temp file in the target directory
//! followed by an atomic rename.

use crate::artifacts::crypt::CryptKey;
use crate::artifacts::ignore::should_ignore;
use crate::artifacts::index::cache_entry::EntryStat;
use anyhow::Context;
use std::fs::Metadata;
use std::io::Write;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Stat summary of one worktree path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub is_file: bool,
    pub is_dir: bool,
    pub ctime: i64,
    pub mtime: i64,
    pub size: u64,
}

impl FileStat {
    pub fn entry_stat(&self) -> EntryStat {
        EntryStat::new(self.ctime, self.mtime, self.size)
    }
}

impl From<&Metadata> for FileStat {
    fn from(metadata: &Metadata) -> Self {
        FileStat {
            is_file: metadata.is_file(),
            is_dir: metadata.is_dir(),
            ctime: metadata.ctime(),
            mtime: metadata.mtime(),
            size: metadata.size(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Worktree {
    root: PathBuf,
}

impl Worktree {
    pub fn new(root: PathBuf) -> Self {
        Worktree { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A worktree is valid when its root exists and is a directory
    pub fn is_valid(&self) -> bool {
        self.root.is_dir()
    }

    pub fn full_path(&self, relpath: &str) -> PathBuf {
        if relpath.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relpath)
        }
    }

    pub fn stat(&self, relpath: &str) -> Option<FileStat> {
        std::fs::symlink_metadata(self.full_path(relpath))
            .ok()
            .map(|metadata| FileStat::from(&metadata))
    }

    /// List one directory level, skipping ignored names
    ///
    /// Returns `(name, stat)` pairs in unspecified order.
    pub fn read_dir_filtered(&self, relpath: &str) -> anyhow::Result<Vec<(String, FileStat)>> {
        let dir_path = self.full_path(relpath);
        let mut listing = Vec::new();

        for entry in std::fs::read_dir(&dir_path)
            .with_context(|| format!("Failed to open dir {}", dir_path.display()))?
        {
            let entry = entry?;
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(_) => continue, // non-UTF-8 names cannot sync across peers
            };
            if should_ignore(&name) {
                continue;
            }
            let metadata = entry.metadata()?;
            listing.push((name, FileStat::from(&metadata)));
        }

        Ok(listing)
    }

    /// True when the directory contains nothing but ignored names
    pub fn is_empty_dir(&self, relpath: &str) -> anyhow::Result<bool> {
        Ok(self.read_dir_filtered(relpath)?.is_empty())
    }

    /// Every non-ignored file under `relpath`, as worktree-relative paths
    ///
    /// A path is skipped when any of its components is ignored.
    pub fn list_files(&self, relpath: &str) -> anyhow::Result<Vec<String>> {
        let base = self.full_path(relpath);
        let mut files = Vec::new();

        for entry in WalkDir::new(&base).into_iter().filter_entry(|e| {
            e.file_name()
                .to_str()
                .map(|name| e.depth() == 0 || !should_ignore(name))
                .unwrap_or(false)
        }) {
            let entry = entry?;
            if entry.file_type().is_file() {
                let rel = entry
                    .path()
                    .strip_prefix(&self.root)
                    .context("walked outside the worktree")?;
                if let Some(rel) = unix_relpath(rel) {
                    files.push(rel);
                }
            }
        }

        Ok(files)
    }

    /// Write blob content to `relpath`, creating parent directories on demand
    ///
    /// Content goes to a temp file in the final directory first and is
    /// renamed into place, so concurrent readers never observe a torn file.
    pub fn write_file(&self, relpath: &str, content: &[u8]) -> anyhow::Result<()> {
        let target = self.full_path(relpath);
        let dir = target
            .parent()
            .with_context(|| format!("Invalid worktree path {}", relpath))?;
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory {}", dir.display()))?;

        let temp_path = dir.join(format!(".sync-tmp-{:08x}", rand::random::<u32>()));
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to open temp file {}", temp_path.display()))?;
        file.write_all(content)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&temp_path, &target)
            .with_context(|| format!("Failed to move {} into place", target.display()))?;

        Ok(())
    }

    /// Decrypt-and-concatenate helper for encrypted checkouts
    pub fn write_file_decrypted(
        &self,
        relpath: &str,
        ciphertext_chunks: &[Vec<u8>],
        crypt: Option<&CryptKey>,
    ) -> anyhow::Result<()> {
        let mut content = Vec::new();
        for chunk in ciphertext_chunks {
            match crypt {
                Some(crypt) => content.extend_from_slice(&crypt.decrypt(chunk)?),
                None => content.extend_from_slice(chunk),
            }
        }
        self.write_file(relpath, &content)
    }

    pub fn make_dir(&self, relpath: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(self.full_path(relpath))?;
        Ok(())
    }

    /// Remove a file and prune now-empty parent directories up to the root
    pub fn remove_file_and_prune(&self, relpath: &str) -> anyhow::Result<()> {
        let target = self.full_path(relpath);
        match std::fs::remove_file(&target) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("Failed to remove {}", target.display()))
            }
        }

        let mut dir = target.parent().map(Path::to_path_buf);
        while let Some(current) = dir {
            if current == self.root {
                break;
            }
            if std::fs::remove_dir(&current).is_err() {
                break; // not empty or already gone
            }
            dir = current.parent().map(Path::to_path_buf);
        }

        Ok(())
    }

    /// Remove a directory only if it is empty
    pub fn remove_empty_dir(&self, relpath: &str) -> anyhow::Result<()> {
        let target = self.full_path(relpath);
        match std::fs::remove_dir(&target) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("Failed to remove {}", target.display())),
        }
    }
}

/// Convert a relative path to the unix-separator form used in the index
fn unix_relpath(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;
    use rstest::rstest;

    #[rstest]
    fn test_write_file_creates_parents_atomically() {
        let dir = assert_fs::TempDir::new().unwrap();
        let worktree = Worktree::new(dir.path().to_path_buf());

        worktree.write_file("a/b/c.txt", b"hello").unwrap();

        dir.child("a/b/c.txt").assert("hello");
        // no temp leftovers
        let names: Vec<_> = std::fs::read_dir(dir.path().join("a/b"))
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[rstest]
    fn test_remove_file_prunes_empty_parents() {
        let dir = assert_fs::TempDir::new().unwrap();
        let worktree = Worktree::new(dir.path().to_path_buf());
        worktree.write_file("a/b/c.txt", b"x").unwrap();

        worktree.remove_file_and_prune("a/b/c.txt").unwrap();

        assert!(!dir.path().join("a").exists());
        assert!(dir.path().exists());
    }

    #[rstest]
    fn test_remove_keeps_nonempty_parents() {
        let dir = assert_fs::TempDir::new().unwrap();
        let worktree = Worktree::new(dir.path().to_path_buf());
        worktree.write_file("a/keep.txt", b"x").unwrap();
        worktree.write_file("a/b/c.txt", b"y").unwrap();

        worktree.remove_file_and_prune("a/b/c.txt").unwrap();

        assert!(!dir.path().join("a/b").exists());
        assert!(dir.path().join("a/keep.txt").exists());
    }

    #[rstest]
    fn test_list_files_skips_ignored_components() {
        let dir = assert_fs::TempDir::new().unwrap();
        dir.child("ok.txt").write_str("1").unwrap();
        dir.child("Thumbs.db").write_str("2").unwrap();
        dir.child("sub/also.txt").write_str("3").unwrap();
        dir.child("junk.tmp").write_str("4").unwrap();

        let worktree = Worktree::new(dir.path().to_path_buf());
        let mut files = worktree.list_files("").unwrap();
        files.sort();

        pretty_assertions::assert_eq!(files, vec!["ok.txt", "sub/also.txt"]);
    }

    #[rstest]
    fn test_is_empty_dir_ignores_ignored_names() {
        let dir = assert_fs::TempDir::new().unwrap();
        dir.child("empty/.DS_Store").write_str("junk").unwrap();

        let worktree = Worktree::new(dir.path().to_path_buf());
        assert!(worktree.is_empty_dir("empty").unwrap());
    }
}
