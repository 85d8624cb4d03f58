//! Serialization traits for stored objects
//!
//! `Packable` produces the canonical byte form (including the type/size
//! header) and `Unpackable` parses the content that follows the header.
//! `Object` ties the two together with the type tag and the content
//! address derivation.

use crate::artifacts::objects::object_id::ObjectId;
use crate::artifacts::objects::object_type::ObjectType;
use bytes::Bytes;
use std::io::BufRead;
use std::path::PathBuf;

pub trait Packable {
    /// Canonical byte form of the object, header included
    fn serialize(&self) -> anyhow::Result<Bytes>;
}

pub trait Unpackable: Sized {
    /// Parse object content (the bytes after the `<type> <size>\0` header)
    fn deserialize(reader: impl BufRead) -> anyhow::Result<Self>;
}

pub trait Object: Packable {
    fn object_type(&self) -> ObjectType;

    /// Content address of this object
    ///
    /// Trees and commits hash their canonical serialization. Chunks and
    /// blobs override this: their ids are derived from plaintext content
    /// so that deduplication survives encryption.
    fn object_id(&self) -> anyhow::Result<ObjectId> {
        Ok(ObjectId::hash_bytes(&self.serialize()?))
    }

    /// Fan-out path of this object inside the store
    fn object_path(&self) -> anyhow::Result<PathBuf> {
        Ok(self.object_id()?.to_path())
    }
}

/// Prepend the `<type> <size>\0` header to serialized content
pub fn with_header(object_type: ObjectType, content: &[u8]) -> Bytes {
    let mut bytes = Vec::with_capacity(content.len() + 16);
    bytes.extend_from_slice(format!("{} {}\0", object_type.as_str(), content.len()).as_bytes());
    bytes.extend_from_slice(content);
    Bytes::from(bytes)
}
