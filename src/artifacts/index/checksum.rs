//! Checksummed index I/O
//!
//! Every byte read from or written to the index file flows through a SHA-1
//! digest; the trailing 20 bytes of the file hold the digest of everything
//! before them, so torn or corrupted index files are detected at load time.

use crate::artifacts::objects::object_id::RAW_ID_LENGTH;
use anyhow::anyhow;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::io::{Read, Write};

#[derive(Debug)]
pub struct Checksum<F> {
    inner: F,
    digest: Sha1,
}

impl<F> Checksum<F> {
    pub(crate) fn new(inner: F) -> Self {
        Checksum {
            inner,
            digest: Sha1::new(),
        }
    }
}

impl<F: Read> Checksum<F> {
    pub(crate) fn read(&mut self, size: usize) -> anyhow::Result<Bytes> {
        let mut buffer = vec![0; size];
        self.inner
            .read_exact(&mut buffer)
            .map_err(|_| anyhow!("Unexpected end-of-file while reading index"))?;

        self.digest.update(&buffer);
        Ok(Bytes::from(buffer))
    }

    /// Compare the trailing checksum against everything read so far
    pub(crate) fn verify(&mut self) -> anyhow::Result<()> {
        let mut expected = [0u8; RAW_ID_LENGTH];
        self.inner.read_exact(&mut expected)?;

        let actual = self.digest.clone().finalize();
        if expected != actual.as_slice() {
            return Err(anyhow!("Index checksum does not match value stored on disk"));
        }

        Ok(())
    }
}

impl<F: Write> Checksum<F> {
    pub(crate) fn write(&mut self, data: &[u8]) -> anyhow::Result<()> {
        self.inner.write_all(data)?;
        self.digest.update(data);
        Ok(())
    }

    pub(crate) fn write_checksum(&mut self) -> anyhow::Result<()> {
        let checksum = self.digest.clone().finalize();
        self.inner
            .write_all(checksum.as_slice())
            .map_err(|_| anyhow!("Failed to write checksum to index file"))?;

        Ok(())
    }
}
