//! Repository encryption
//!
//! A 16-byte AES key and 16-byte IV are derived from
//! `repo_id || password` by an iterated-SHA-1 key derivation (the
//! `EVP_BytesToKey` construction with no salt). The iteration count is high
//! on purpose, to defend against brute-force attacks on the password.
//!
//! The repository's "magic" is the hex of the derived key: recomputing it
//! from a candidate password and comparing proves the password without
//! storing it, and without touching any encrypted object.
//!
//! Chunk payloads are encrypted with AES-128 in CBC mode (PKCS#7 padding)
//! under the derived key/IV. Object ids are computed over plaintext, so the
//! cipher never changes an address.

use crate::artifacts::objects::object_id::RepoId;
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha1::{Digest, Sha1};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Current key-derivation scheme version
pub const CURRENT_ENC_VERSION: i32 = 1;

const KEY_LEN: usize = 16;
const IV_LEN: usize = 16;

/// Derived key material for one repository
#[derive(Clone, PartialEq, Eq)]
pub struct CryptKey {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
    version: i32,
}

impl std::fmt::Debug for CryptKey {
    // Key material stays out of logs
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptKey")
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl CryptKey {
    /// Derive key and IV from `repo_id || password`
    pub fn derive(repo_id: &RepoId, passwd: &str, version: i32) -> anyhow::Result<Self> {
        let mut seed = Vec::with_capacity(repo_id.as_str().len() + passwd.len());
        seed.extend_from_slice(repo_id.as_str().as_bytes());
        seed.extend_from_slice(passwd.as_bytes());
        Self::derive_from_seed(&seed, version)
    }

    /// Derive key and IV from raw seed bytes
    ///
    /// `EVP_BytesToKey` with SHA-1 and no salt:
    /// `D1 = H^n(seed)`, `D2 = H^n(D1 || seed)`; the key is the first 16
    /// bytes of `D1`, the IV the first 16 bytes of `D2`.
    pub fn derive_from_seed(seed: &[u8], version: i32) -> anyhow::Result<Self> {
        let rounds = kdf_rounds(version)?;

        let d1 = iterated_sha1(seed, &[], rounds);
        let d2 = iterated_sha1(seed, &d1, rounds);

        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        key.copy_from_slice(&d1[..KEY_LEN]);
        iv.copy_from_slice(&d2[..IV_LEN]);

        Ok(CryptKey { key, iv, version })
    }

    /// Password-verification fingerprint: hex of the derived key
    pub fn magic(&self) -> String {
        to_hex(&self.key)
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    /// Hex forms for the metadata DB
    pub fn to_hex_pair(&self) -> (String, String) {
        (to_hex(&self.key), to_hex(&self.iv))
    }

    /// Rebuild from the hex forms cached in the metadata DB
    pub fn from_hex_pair(key_hex: &str, iv_hex: &str, version: i32) -> anyhow::Result<Self> {
        Ok(CryptKey {
            key: from_hex(key_hex)?,
            iv: from_hex(iv_hex)?,
            version,
        })
    }

    /// Encrypt one chunk payload
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        Aes128CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext)
    }

    /// Decrypt one chunk payload
    pub fn decrypt(&self, ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
        Aes128CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| anyhow::anyhow!("Failed to decrypt chunk payload"))
    }
}

fn kdf_rounds(version: i32) -> anyhow::Result<u32> {
    match version {
        1 => Ok(1 << 19),
        _ => Err(anyhow::anyhow!(
            "Unsupported encryption version: {}",
            version
        )),
    }
}

/// `H^n(prefix || seed)` where H is SHA-1
fn iterated_sha1(seed: &[u8], prefix: &[u8], rounds: u32) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(prefix);
    hasher.update(seed);
    let mut digest: [u8; 20] = hasher.finalize().into();

    for _ in 1..rounds {
        let mut hasher = Sha1::new();
        hasher.update(digest);
        digest = hasher.finalize().into();
    }

    digest
}

fn to_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

fn from_hex(hex: &str) -> anyhow::Result<[u8; 16]> {
    if hex.len() != 32 {
        return Err(anyhow::anyhow!("Invalid key hex length: {}", hex.len()));
    }
    let mut raw = [0u8; 16];
    for (i, slot) in raw.iter_mut().enumerate() {
        *slot = u8::from_str_radix(&hex[2 * i..2 * i + 2], 16)
            .map_err(|_| anyhow::anyhow!("Invalid hex digit in key material"))?;
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn repo_id() -> RepoId {
        RepoId::generate()
    }

    #[rstest]
    fn test_derivation_is_deterministic(repo_id: RepoId) {
        let a = CryptKey::derive(&repo_id, "pw", CURRENT_ENC_VERSION).unwrap();
        let b = CryptKey::derive(&repo_id, "pw", CURRENT_ENC_VERSION).unwrap();

        pretty_assertions::assert_eq!(a.magic(), b.magic());
        pretty_assertions::assert_eq!(a.to_hex_pair(), b.to_hex_pair());
    }

    #[rstest]
    fn test_different_passwords_give_different_magic(repo_id: RepoId) {
        let a = CryptKey::derive(&repo_id, "pw", CURRENT_ENC_VERSION).unwrap();
        let b = CryptKey::derive(&repo_id, "pwx", CURRENT_ENC_VERSION).unwrap();

        assert_ne!(a.magic(), b.magic());
    }

    #[rstest]
    fn test_encrypt_decrypt_roundtrip(repo_id: RepoId) {
        let crypt = CryptKey::derive(&repo_id, "secret", CURRENT_ENC_VERSION).unwrap();
        let plaintext = b"the quick brown fox";

        let ciphertext = crypt.encrypt(plaintext);
        assert_ne!(ciphertext.as_slice(), plaintext.as_slice());

        let decrypted = crypt.decrypt(&ciphertext).unwrap();
        pretty_assertions::assert_eq!(decrypted.as_slice(), plaintext.as_slice());
    }

    #[rstest]
    fn test_wrong_key_fails_or_garbles(repo_id: RepoId) {
        let right = CryptKey::derive(&repo_id, "pw", CURRENT_ENC_VERSION).unwrap();
        let wrong = CryptKey::derive(&repo_id, "pwx", CURRENT_ENC_VERSION).unwrap();

        let ciphertext = right.encrypt(b"payload");
        match wrong.decrypt(&ciphertext) {
            Err(_) => {}
            Ok(garbled) => assert_ne!(garbled.as_slice(), b"payload".as_slice()),
        }
    }

    #[rstest]
    fn test_hex_pair_roundtrip(repo_id: RepoId) {
        let crypt = CryptKey::derive(&repo_id, "pw", CURRENT_ENC_VERSION).unwrap();
        let (key_hex, iv_hex) = crypt.to_hex_pair();

        let rebuilt = CryptKey::from_hex_pair(&key_hex, &iv_hex, CURRENT_ENC_VERSION).unwrap();
        pretty_assertions::assert_eq!(crypt, rebuilt);
    }
}
