//! Object type tags
//!
//! Every serialized object starts with a `<type> <size>\0` header, so the
//! store can dispatch parsing without knowing the type up front.

use std::io::BufRead;

/// Type tag of a stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    /// Raw file chunk payload (possibly ciphertext)
    Chunk,
    /// Ordered chunk-id list describing one file
    Blob,
    /// Directory listing
    Tree,
    /// History node
    Commit,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Chunk => "chunk",
            ObjectType::Blob => "blob",
            ObjectType::Tree => "tree",
            ObjectType::Commit => "commit",
        }
    }

    pub fn try_parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "chunk" => Ok(ObjectType::Chunk),
            "blob" => Ok(ObjectType::Blob),
            "tree" => Ok(ObjectType::Tree),
            "commit" => Ok(ObjectType::Commit),
            _ => Err(anyhow::anyhow!("Unknown object type: {}", value)),
        }
    }

    /// Consume the `<type> <size>\0` header from a reader
    ///
    /// Leaves the reader positioned at the start of the object content.
    pub fn parse_object_header(reader: &mut impl BufRead) -> anyhow::Result<(Self, usize)> {
        let mut type_bytes = Vec::new();
        reader.read_until(b' ', &mut type_bytes)?;
        if type_bytes.pop() != Some(b' ') {
            return Err(anyhow::anyhow!("Unexpected EOF in object header"));
        }

        let mut size_bytes = Vec::new();
        reader.read_until(b'\0', &mut size_bytes)?;
        if size_bytes.pop() != Some(b'\0') {
            return Err(anyhow::anyhow!("Unexpected EOF in object header"));
        }

        let object_type = Self::try_parse(std::str::from_utf8(&type_bytes)?)?;
        let size = std::str::from_utf8(&size_bytes)?
            .parse::<usize>()
            .map_err(|_| anyhow::anyhow!("Invalid object size in header"))?;

        Ok((object_type, size))
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
