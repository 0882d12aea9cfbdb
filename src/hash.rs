use std::fs;
use std::io::Read;

use sha2::{Digest, Sha256};

/// A 32-byte SHA-256 digest used for content-addressing and change detection.
///
/// In `kamado`, this serves three purposes:
/// 1. It fingerprints the bytes of every input file recorded in a cache
///    entry, so content changes are caught even when timestamps lie.
/// 2. Hashed over a node's canonical configuration, it becomes the content
///    signature under which cache entries are grouped.
/// 3. Hashed over a node's emitted path lists, it becomes the upstream
///    signature used to detect producer drift without rehashing files.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub fn hash(buffer: impl AsRef<[u8]>) -> Self {
        let digest: [u8; 32] = Sha256::digest(buffer.as_ref()).into();
        digest.into()
    }

    /// Hash the full contents of a file on disk.
    pub fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        let mut hasher = Sha256::new();
        let mut file = fs::File::open(path)?;
        let mut buffer = [0u8; 64 * 1024];

        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        let digest: [u8; 32] = hasher.finalize().into();
        Ok(digest.into())
    }

    pub fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = vec![0u8; 64];

        for (i, &byte) in self.0.iter().enumerate() {
            acc[i * 2] = HEX[(byte >> 4) as usize];
            acc[i * 2 + 1] = HEX[(byte & 0xF) as usize];
        }

        String::from_utf8(acc).unwrap()
    }

    /// First 8 hex characters, used in content signatures.
    pub fn to_hex_short(self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(8);
        hex
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}
