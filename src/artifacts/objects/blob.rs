//! File payload objects
//!
//! A file is stored as a `Blob` (the ordered list of its chunk ids plus the
//! plaintext length) and one `Chunk` object per fixed-size piece of content.
//!
//! ## Content addressing under encryption
//!
//! Chunk ids are SHA-1 over *plaintext*, and the blob id is SHA-1 over the
//! concatenated raw chunk ids. When a repository is encrypted only the chunk
//! payloads are ciphertext; ids are unchanged, so identical files deduplicate
//! across encrypted and plain repositories alike (decryption still requires
//! the password).

use crate::artifacts::objects::object::{with_header, Object, Packable, Unpackable};
use crate::artifacts::objects::object_id::ObjectId;
use crate::artifacts::objects::object_type::ObjectType;
use bytes::Bytes;
use derive_new::new;
use std::io::{BufRead, Read};

/// Fixed chunking granularity
pub const CHUNK_SIZE: usize = 1 << 20;

/// One stored piece of file content
///
/// The payload is ciphertext when the owning repository is encrypted. The
/// chunk's id is never derived from the stored payload; the indexer computes
/// it from plaintext and stores the chunk under that explicit address.
#[derive(Debug, Clone, new)]
pub struct Chunk {
    pub payload: Bytes,
}

impl Packable for Chunk {
    fn serialize(&self) -> anyhow::Result<Bytes> {
        Ok(with_header(ObjectType::Chunk, &self.payload))
    }
}

impl Unpackable for Chunk {
    fn deserialize(mut reader: impl BufRead) -> anyhow::Result<Self> {
        let mut payload = Vec::new();
        reader.read_to_end(&mut payload)?;
        Ok(Chunk {
            payload: Bytes::from(payload),
        })
    }
}

impl Object for Chunk {
    fn object_type(&self) -> ObjectType {
        ObjectType::Chunk
    }
}

/// Ordered chunk-id list describing one file
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Blob {
    /// Plaintext length of the whole file
    pub size: u64,
    /// Chunk ids in file order (empty for an empty file)
    pub chunk_ids: Vec<ObjectId>,
}

impl Blob {
    pub fn new(size: u64, chunk_ids: Vec<ObjectId>) -> Self {
        Blob { size, chunk_ids }
    }
}

impl Packable for Blob {
    fn serialize(&self) -> anyhow::Result<Bytes> {
        let mut content = format!("size {}\n", self.size).into_bytes();
        for chunk_id in &self.chunk_ids {
            content.extend_from_slice(chunk_id.as_ref().as_bytes());
            content.push(b'\n');
        }
        Ok(with_header(ObjectType::Blob, &content))
    }
}

impl Unpackable for Blob {
    fn deserialize(reader: impl BufRead) -> anyhow::Result<Self> {
        let mut size = None;
        let mut chunk_ids = Vec::new();

        for line in reader.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            match line.strip_prefix("size ") {
                Some(value) => {
                    size = Some(
                        value
                            .parse::<u64>()
                            .map_err(|_| anyhow::anyhow!("Invalid blob size: {}", value))?,
                    );
                }
                None => chunk_ids.push(ObjectId::try_parse(line)?),
            }
        }

        Ok(Blob {
            size: size.ok_or_else(|| anyhow::anyhow!("Blob is missing its size line"))?,
            chunk_ids,
        })
    }
}

impl Object for Blob {
    fn object_type(&self) -> ObjectType {
        ObjectType::Blob
    }

    /// Blob id: SHA-1 over the concatenated raw chunk ids
    fn object_id(&self) -> anyhow::Result<ObjectId> {
        let mut raw = Vec::with_capacity(self.chunk_ids.len() * 20);
        for chunk_id in &self.chunk_ids {
            chunk_id.write_raw_to(&mut raw)?;
        }
        Ok(ObjectId::hash_bytes(&raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Cursor;

    #[rstest]
    fn test_blob_id_depends_only_on_chunk_ids() {
        let chunks = vec![
            ObjectId::hash_bytes(b"chunk one"),
            ObjectId::hash_bytes(b"chunk two"),
        ];
        let a = Blob::new(42, chunks.clone());
        let b = Blob::new(42, chunks);

        pretty_assertions::assert_eq!(a.object_id().unwrap(), b.object_id().unwrap());
    }

    #[rstest]
    fn test_blob_serialization_roundtrip() {
        let blob = Blob::new(17, vec![ObjectId::hash_bytes(b"payload")]);

        let bytes = blob.serialize().unwrap();
        let mut reader = Cursor::new(bytes);
        let (object_type, _) = ObjectType::parse_object_header(&mut reader).unwrap();
        let reread = Blob::deserialize(reader).unwrap();

        assert_eq!(object_type, ObjectType::Blob);
        pretty_assertions::assert_eq!(blob, reread);
    }

    #[rstest]
    fn test_empty_blob_has_stable_id() {
        let a = Blob::new(0, vec![]);
        let b = Blob::new(0, vec![]);
        pretty_assertions::assert_eq!(a.object_id().unwrap(), b.object_id().unwrap());
    }
}
