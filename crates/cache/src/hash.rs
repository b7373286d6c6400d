//! Content hashing for operation keys and file stamps.
//!
//! The engine content-addresses its work: every cache-eligible operation is
//! keyed by a digest of its semantic inputs, and every input file is keyed
//! by a digest of its bytes. The digest algorithm is pluggable through the
//! [`HashFn`] trait; the default is XXH3-64, a fast non-cryptographic hash.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::Path;

/// An opaque digest of some bytes, plus the distinguished nil value.
///
/// The byte width depends on the [`HashFn`] that produced the value; hashes
/// from different functions never compare equal by construction since their
/// widths differ. [`Hash::nil`] is the empty sequence and is used as the
/// "not yet hashed" sentinel on operations.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hash(Box<[u8]>);

impl Hash {
    /// The nil hash.
    #[must_use]
    pub fn nil() -> Self {
        Self(Box::new([]))
    }

    /// True if this is the nil hash.
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0.is_empty()
    }

    /// Create a hash from raw digest bytes.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Box<[u8]>>) -> Self {
        Self(bytes.into())
    }

    /// The raw digest bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hexadecimal form, the textual shape used for cache keys.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Parse a hash back from its hexadecimal form.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid hexadecimal.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|e| Error::configuration(format!("invalid hash hex {s:?}: {e}")))?;
        Ok(Self(bytes.into_boxed_slice()))
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nil() {
            return write!(f, "nil");
        }
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({self})")
    }
}

/// A hash algorithm usable for content addressing.
///
/// Implementations must be deterministic across processes and platforms:
/// the same bytes always produce the same digest.
pub trait HashFn {
    /// Short stable identifier of the algorithm.
    fn id(&self) -> &'static str;

    /// Hash a byte slice.
    fn bytes(&self, data: &[u8]) -> Hash;

    /// Hash the contents of a file, streaming.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error if the file cannot be read.
    fn file(&self, path: &Path) -> std::io::Result<Hash>;
}

const FILE_BUF_SIZE: usize = 1024 * 64;

/// XXH3 with a 64-bit digest. The default algorithm.
#[derive(Debug, Clone, Copy, Default)]
pub struct XxHash3;

impl HashFn for XxHash3 {
    fn id(&self) -> &'static str {
        "xxh3-64"
    }

    fn bytes(&self, data: &[u8]) -> Hash {
        Hash::from_bytes(xxhash_rust::xxh3::xxh3_64(data).to_be_bytes().to_vec())
    }

    fn file(&self, path: &Path) -> std::io::Result<Hash> {
        let _span = tracing::trace_span!("hash_file", path = %path.display()).entered();
        let mut file = fs::File::open(path)?;
        let mut hasher = xxhash_rust::xxh3::Xxh3::new();
        let mut buf = [0u8; FILE_BUF_SIZE];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Hash::from_bytes(hasher.digest().to_be_bytes().to_vec()))
    }
}

/// SHA-256, for callers that want a cryptographic digest.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha2;

impl HashFn for Sha2 {
    fn id(&self) -> &'static str {
        "sha-256"
    }

    fn bytes(&self, data: &[u8]) -> Hash {
        use sha2::Digest;
        Hash::from_bytes(sha2::Sha256::digest(data).to_vec())
    }

    fn file(&self, path: &Path) -> std::io::Result<Hash> {
        use sha2::Digest;
        let _span = tracing::trace_span!("hash_file", path = %path.display()).entered();
        let mut file = fs::File::open(path)?;
        let mut hasher = sha2::Sha256::new();
        let mut buf = [0u8; FILE_BUF_SIZE];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Hash::from_bytes(hasher.finalize().to_vec()))
    }
}

/// The default hash function, boxed.
#[must_use]
pub fn default_hash_fn() -> Box<dyn HashFn> {
    Box::new(XxHash3)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn nil_is_nil() {
        assert!(Hash::nil().is_nil());
        assert!(!XxHash3.bytes(b"x").is_nil());
        assert_eq!(format!("{}", Hash::nil()), "nil");
    }

    #[test]
    fn deterministic() {
        let a = XxHash3.bytes(b"hello world");
        let b = XxHash3.bytes(b"hello world");
        assert_eq!(a, b);
        assert_ne!(a, XxHash3.bytes(b"hello worlds"));
    }

    #[test]
    fn algorithms_have_distinct_widths() {
        assert_eq!(XxHash3.bytes(b"x").as_bytes().len(), 8);
        assert_eq!(Sha2.bytes(b"x").as_bytes().len(), 32);
    }

    #[test]
    fn hex_roundtrip() {
        let h = XxHash3.bytes(b"roundtrip");
        let back = Hash::from_hex(&h.to_hex()).unwrap();
        assert_eq!(h, back);
        assert!(Hash::from_hex("not hex!").is_err());
    }

    #[test]
    fn file_matches_bytes() {
        let tmp = TempDir::new().unwrap();
        let p = tmp.path().join("data.bin");
        let data = vec![7u8; 200_000]; // spans several read buffers
        fs::write(&p, &data).unwrap();
        assert_eq!(XxHash3.file(&p).unwrap(), XxHash3.bytes(&data));
        assert_eq!(Sha2.file(&p).unwrap(), Sha2.bytes(&data));
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(XxHash3.file(Path::new("/nonexistent/nope")).is_err());
    }
}
