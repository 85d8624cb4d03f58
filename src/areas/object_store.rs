//! Content-addressed object store
//!
//! Stores chunks, blobs, trees and commits under their hex ids in a two-level
//! fan-out directory. Objects are zlib-compressed on disk and written via a
//! temp file plus atomic rename; a write of an id that already exists is a
//! no-op, which makes concurrent writes of identical content safe.
//!
//! Durability rule: an object's bytes are synced before its id is returned
//! to any caller.

use crate::artifacts::crypt::CryptKey;
use crate::artifacts::index::entry_mode::EntryMode;
use crate::artifacts::objects::blob::{Blob, Chunk, CHUNK_SIZE};
use crate::artifacts::objects::commit::{Commit, SlimCommit};
use crate::artifacts::objects::object::{Object, Packable, Unpackable};
use crate::artifacts::objects::object_id::ObjectId;
use crate::artifacts::objects::object_type::ObjectType;
use crate::artifacts::objects::tree::Tree;
use anyhow::Context;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// One flattened tree slot: what a path points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeSlot {
    pub mode: EntryMode,
    pub oid: ObjectId,
}

#[derive(Debug, Clone)]
pub struct ObjectStore {
    path: PathBuf,
}

impl ObjectStore {
    pub fn new(path: PathBuf) -> Self {
        ObjectStore { path }
    }

    pub fn objects_path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self, object_id: &ObjectId) -> bool {
        self.path.join(object_id.to_path()).exists()
    }

    /// Store a tree or commit under its computed id
    pub fn store_object(&self, object: &impl Object) -> anyhow::Result<ObjectId> {
        let object_id = object.object_id()?;
        self.store_raw(&object_id, object.serialize()?)?;
        Ok(object_id)
    }

    /// Store a chunk under its explicit (plaintext) id
    pub fn store_chunk(&self, chunk_id: &ObjectId, chunk: &Chunk) -> anyhow::Result<()> {
        self.store_raw(chunk_id, chunk.serialize()?)
    }

    fn store_raw(&self, object_id: &ObjectId, content: Bytes) -> anyhow::Result<()> {
        let object_path = self.path.join(object_id.to_path());
        if object_path.exists() {
            return Ok(()); // content-addressed: identical bytes already present
        }

        let object_dir = object_path
            .parent()
            .context("Invalid object path")?
            .to_path_buf();
        std::fs::create_dir_all(&object_dir)
            .with_context(|| format!("Failed to create object dir {}", object_dir.display()))?;

        let compressed = Self::compress(&content)?;
        let temp_path = object_dir.join(format!("tmp-obj-{:08x}", rand::random::<u32>()));

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .with_context(|| format!("Failed to open object file {}", temp_path.display()))?;
        file.write_all(&compressed)
            .with_context(|| format!("Failed to write object {}", object_id))?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&temp_path, &object_path)
            .with_context(|| format!("Failed to move object {} into place", object_id))?;

        Ok(())
    }

    fn load_raw(&self, object_id: &ObjectId) -> anyhow::Result<Bytes> {
        let object_path = self.path.join(object_id.to_path());
        let compressed = std::fs::read(&object_path)
            .with_context(|| format!("Unable to read object {}", object_id))?;
        Self::decompress(&compressed)
    }

    fn parse_as_bytes(&self, object_id: &ObjectId) -> anyhow::Result<(ObjectType, impl std::io::BufRead)> {
        let content = self.load_raw(object_id)?;
        let mut reader = Cursor::new(content);
        let (object_type, _) = ObjectType::parse_object_header(&mut reader)?;
        Ok((object_type, reader))
    }

    pub fn load_tree(&self, object_id: &ObjectId) -> anyhow::Result<Tree> {
        let (object_type, reader) = self.parse_as_bytes(object_id)?;
        match object_type {
            ObjectType::Tree => Tree::deserialize(reader),
            other => Err(anyhow::anyhow!("Object {} is a {}, not a tree", object_id, other)),
        }
    }

    pub fn load_commit(&self, object_id: &ObjectId) -> anyhow::Result<Commit> {
        let (object_type, reader) = self.parse_as_bytes(object_id)?;
        match object_type {
            ObjectType::Commit => Commit::deserialize(reader),
            other => Err(anyhow::anyhow!("Object {} is a {}, not a commit", object_id, other)),
        }
    }

    pub fn load_blob(&self, object_id: &ObjectId) -> anyhow::Result<Blob> {
        let (object_type, reader) = self.parse_as_bytes(object_id)?;
        match object_type {
            ObjectType::Blob => Blob::deserialize(reader),
            other => Err(anyhow::anyhow!("Object {} is a {}, not a blob", object_id, other)),
        }
    }

    pub fn load_chunk(&self, object_id: &ObjectId) -> anyhow::Result<Chunk> {
        let (object_type, reader) = self.parse_as_bytes(object_id)?;
        match object_type {
            ObjectType::Chunk => Chunk::deserialize(reader),
            other => Err(anyhow::anyhow!("Object {} is a {}, not a chunk", object_id, other)),
        }
    }

    /// Chunk, encrypt and store one worktree file; returns its blob id
    ///
    /// Chunk ids are SHA-1 over plaintext, so the returned blob id is
    /// independent of the encryption key. Existing chunks are not rewritten.
    pub fn index_chunks(
        &self,
        file_path: &Path,
        crypt: Option<&CryptKey>,
    ) -> anyhow::Result<ObjectId> {
        let mut file = std::fs::File::open(file_path)
            .with_context(|| format!("Failed to index {}", file_path.display()))?;

        let mut chunk_ids = Vec::new();
        let mut size: u64 = 0;
        let mut buffer = vec![0u8; CHUNK_SIZE];

        loop {
            let read = read_up_to(&mut file, &mut buffer)
                .with_context(|| format!("Failed to index {}", file_path.display()))?;
            if read == 0 {
                break;
            }
            size += read as u64;

            let plaintext = &buffer[..read];
            let chunk_id = ObjectId::hash_bytes(plaintext);
            if !self.exists(&chunk_id) {
                let payload = match crypt {
                    Some(crypt) => Bytes::from(crypt.encrypt(plaintext)),
                    None => Bytes::copy_from_slice(plaintext),
                };
                self.store_chunk(&chunk_id, &Chunk::new(payload))
                    .with_context(|| format!("Failed to index {}", file_path.display()))?;
            }
            chunk_ids.push(chunk_id);
        }

        let blob = Blob::new(size, chunk_ids);
        let blob_id = blob.object_id()?;
        self.store_raw(&blob_id, blob.serialize()?)?;
        Ok(blob_id)
    }

    /// Blob id a file would get, without writing anything
    pub fn compute_blob_id(&self, file_path: &Path) -> anyhow::Result<ObjectId> {
        let mut file = std::fs::File::open(file_path)?;
        let mut chunk_ids = Vec::new();
        let mut buffer = vec![0u8; CHUNK_SIZE];

        loop {
            let read = read_up_to(&mut file, &mut buffer)?;
            if read == 0 {
                break;
            }
            chunk_ids.push(ObjectId::hash_bytes(&buffer[..read]));
        }

        let mut raw = Vec::with_capacity(chunk_ids.len() * 20);
        for chunk_id in &chunk_ids {
            chunk_id.write_raw_to(&mut raw)?;
        }
        Ok(ObjectId::hash_bytes(&raw))
    }

    /// Stored payloads of a blob's chunks, in file order (still ciphertext
    /// for encrypted repos)
    pub fn read_blob_chunks(&self, blob_id: &ObjectId) -> anyhow::Result<Vec<Vec<u8>>> {
        let blob = self.load_blob(blob_id)?;
        blob.chunk_ids
            .iter()
            .map(|chunk_id| Ok(self.load_chunk(chunk_id)?.payload.to_vec()))
            .collect()
    }

    /// Flatten a tree to `path -> slot`, recursing into subtrees
    ///
    /// An empty subtree appears as a Directory slot for its own path.
    /// `root = None` flattens the empty tree.
    pub fn flatten_tree(
        &self,
        root: Option<&ObjectId>,
    ) -> anyhow::Result<BTreeMap<String, TreeSlot>> {
        let mut slots = BTreeMap::new();
        if let Some(root) = root {
            self.flatten_into(root, "", &mut slots)?;
        }
        Ok(slots)
    }

    fn flatten_into(
        &self,
        tree_id: &ObjectId,
        prefix: &str,
        slots: &mut BTreeMap<String, TreeSlot>,
    ) -> anyhow::Result<()> {
        let tree = self
            .load_tree(tree_id)
            .with_context(|| format!("Tree {} is referenced but absent", tree_id))?;

        for (name, entry) in tree.entries() {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", prefix, name)
            };

            match entry.mode {
                EntryMode::Regular => {
                    slots.insert(
                        path,
                        TreeSlot {
                            mode: entry.mode,
                            oid: entry.oid.clone(),
                        },
                    );
                }
                EntryMode::Directory => {
                    let subtree = self.load_tree(&entry.oid)?;
                    if subtree.is_empty() {
                        slots.insert(
                            path,
                            TreeSlot {
                                mode: EntryMode::Directory,
                                oid: entry.oid.clone(),
                            },
                        );
                    } else {
                        self.flatten_into(&entry.oid, &path, slots)?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Number of file entries reachable from a root tree
    pub fn count_tree_files(&self, root: &ObjectId) -> anyhow::Result<i64> {
        Ok(self
            .flatten_tree(Some(root))?
            .values()
            .filter(|slot| !slot.mode.is_dir())
            .count() as i64)
    }

    /// Breadth-first walk of the commit graph rooted at `start`
    ///
    /// The visitor returns `true` to continue, `false` to stop the whole
    /// traversal early. Each reachable commit is visited exactly once.
    pub fn traverse_commits(
        &self,
        start: &ObjectId,
        mut visitor: impl FnMut(&Commit) -> anyhow::Result<bool>,
    ) -> anyhow::Result<()> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([start.clone()]);

        while let Some(commit_id) = queue.pop_front() {
            if !visited.insert(commit_id.clone()) {
                continue;
            }

            let commit = self
                .load_commit(&commit_id)
                .with_context(|| format!("Commit {} is missing", commit_id))?;

            if !visitor(&commit)? {
                return Ok(());
            }

            queue.extend(commit.parents());
        }

        Ok(())
    }

    fn compress(data: &[u8]) -> anyhow::Result<Bytes> {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(data)
            .context("Unable to compress object content")?;

        encoder
            .finish()
            .map(Bytes::from)
            .context("Unable to finish compressing object content")
    }

    fn decompress(data: &[u8]) -> anyhow::Result<Bytes> {
        let mut decoder = flate2::read::ZlibDecoder::new(data);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .context("Unable to decompress object content")?;

        Ok(Bytes::from(decompressed))
    }
}

/// Fill as much of `buffer` as the reader allows; 0 means EOF
fn read_up_to(reader: &mut impl Read, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

/// Commit cache for graph algorithms
///
/// Stores loaded commits so merge-base traversal can hand out `SlimCommit`
/// views that borrow parent lists instead of cloning them on every visit.
#[derive(Debug, Default)]
pub struct CommitCache {
    commits: HashMap<ObjectId, (Vec<ObjectId>, i64)>,
}

impl CommitCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a commit into the cache if not already present
    pub fn load_commit(&mut self, store: &ObjectStore, object_id: &ObjectId) -> anyhow::Result<()> {
        if self.commits.contains_key(object_id) {
            return Ok(());
        }

        let commit = store.load_commit(object_id)?;
        self.commits
            .insert(object_id.clone(), (commit.parents(), commit.ctime));
        Ok(())
    }

    /// Borrowed slim view of a cached commit
    pub fn get_slim_commit<'c>(&'c self, object_id: &ObjectId) -> anyhow::Result<SlimCommit<'c>> {
        let (key, (parents, ctime)) = self
            .commits
            .get_key_value(object_id)
            .ok_or_else(|| anyhow::anyhow!("Commit {} not found in cache", object_id))?;

        Ok(SlimCommit {
            oid: key,
            parents,
            ctime: *ctime,
        })
    }

    /// Preload every commit reachable from the given heads
    pub fn load_reachable(
        &mut self,
        store: &ObjectStore,
        heads: &[&ObjectId],
    ) -> anyhow::Result<()> {
        for head in heads {
            let mut queue = VecDeque::from([(*head).clone()]);
            while let Some(commit_id) = queue.pop_front() {
                if self.commits.contains_key(&commit_id) {
                    continue;
                }
                if let Err(err) = self.load_commit(store, &commit_id) {
                    warn!(commit = %commit_id, "failed to load commit during traversal: {err:#}");
                    return Err(err);
                }
                queue.extend(self.commits[&commit_id].0.iter().cloned());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::objects::tree::TreeEntry;
    use rstest::{fixture, rstest};
    use std::io::Write as _;

    #[fixture]
    fn store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStore::new(dir.path().join("objects"));
        (dir, store)
    }

    #[rstest]
    fn test_store_and_reload_tree(store: (tempfile::TempDir, ObjectStore)) {
        let (_dir, store) = store;
        let mut tree = Tree::default();
        tree.insert(
            "a.txt".into(),
            TreeEntry::new(EntryMode::Regular, ObjectId::hash_bytes(b"a")),
        );

        let tree_id = store.store_object(&tree).unwrap();
        let reread = store.load_tree(&tree_id).unwrap();

        pretty_assertions::assert_eq!(tree, reread);
    }

    #[rstest]
    fn test_store_is_idempotent(store: (tempfile::TempDir, ObjectStore)) {
        let (_dir, store) = store;
        let tree = Tree::default();

        let first = store.store_object(&tree).unwrap();
        let second = store.store_object(&tree).unwrap();

        assert_eq!(first, second);
        assert!(store.exists(&first));
    }

    #[rstest]
    fn test_index_chunks_roundtrip(store: (tempfile::TempDir, ObjectStore)) {
        let (dir, store) = store;
        let file_path = dir.path().join("payload.bin");
        let mut file = std::fs::File::create(&file_path).unwrap();
        file.write_all(b"hello object store").unwrap();
        drop(file);

        let blob_id = store.index_chunks(&file_path, None).unwrap();
        let chunks = store.read_blob_chunks(&blob_id).unwrap();
        let content: Vec<u8> = chunks.concat();

        pretty_assertions::assert_eq!(content, b"hello object store".to_vec());
        assert_eq!(store.compute_blob_id(&file_path).unwrap(), blob_id);
    }

    #[rstest]
    fn test_encrypted_chunks_differ_from_plaintext(store: (tempfile::TempDir, ObjectStore)) {
        let (dir, store) = store;
        let file_path = dir.path().join("secret.txt");
        std::fs::write(&file_path, b"top secret content").unwrap();

        let crypt = CryptKey::derive_from_seed(b"seed", 1).unwrap();
        let blob_id = store.index_chunks(&file_path, Some(&crypt)).unwrap();

        let chunks = store.read_blob_chunks(&blob_id).unwrap();
        assert_ne!(chunks[0].as_slice(), b"top secret content".as_ref());

        let decrypted = crypt.decrypt(&chunks[0]).unwrap();
        pretty_assertions::assert_eq!(decrypted.as_slice(), b"top secret content".as_ref());

        // plaintext hash: same id as an unencrypted indexing pass
        assert_eq!(store.compute_blob_id(&file_path).unwrap(), blob_id);
    }

    #[rstest]
    fn test_flatten_tree_recurses_and_keeps_empty_dirs(
        store: (tempfile::TempDir, ObjectStore),
    ) {
        let (_dir, store) = store;

        let empty_id = store.store_object(&Tree::default()).unwrap();
        let mut inner = Tree::default();
        inner.insert(
            "b.txt".into(),
            TreeEntry::new(EntryMode::Regular, ObjectId::hash_bytes(b"b")),
        );
        let inner_id = store.store_object(&inner).unwrap();

        let mut root = Tree::default();
        root.insert("a.txt".into(), TreeEntry::new(EntryMode::Regular, ObjectId::hash_bytes(b"a")));
        root.insert("dir".into(), TreeEntry::new(EntryMode::Directory, inner_id));
        root.insert("empty".into(), TreeEntry::new(EntryMode::Directory, empty_id));
        let root_id = store.store_object(&root).unwrap();

        let slots = store.flatten_tree(Some(&root_id)).unwrap();
        let paths: Vec<_> = slots.keys().cloned().collect();

        pretty_assertions::assert_eq!(paths, vec!["a.txt", "dir/b.txt", "empty"]);
        assert!(slots["empty"].mode.is_dir());
        assert_eq!(store.count_tree_files(&root_id).unwrap(), 2);
    }
}
