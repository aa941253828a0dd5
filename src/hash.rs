//! Content fingerprint and the content-addressed index key (§3).

use std::convert::TryInto;
use std::fmt;

use sha2::{Digest, Sha256};

/// Width of a [`Hash`] in bytes. UrBackup's on-disk format reserves 16
/// bytes per `shahash` column regardless of the algorithm's native digest
/// size (truncated SHA-256 in the reference deployment; see
/// `original_source/urbackupserver/server_hash.h`).
pub const HASH_BYTES: usize = 16;

/// Opaque content fingerprint. Two files with identical bytes have
/// identical fingerprints; this type makes no claim about their converse
/// (a `Hash` is not guaranteed to *recover* the bytes).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash(pub [u8; HASH_BYTES]);

impl Hash {
    pub const ZERO: Hash = Hash([0u8; HASH_BYTES]);

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut out = [0u8; HASH_BYTES];
        let n = bytes.len().min(HASH_BYTES);
        out[..n].copy_from_slice(&bytes[..n]);
        Hash(out)
    }

    pub fn as_bytes(&self) -> &[u8; HASH_BYTES] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_BYTES]
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Streaming full-file content hasher. Feeds chunk-sized reads into a
/// running SHA-256 and truncates to [`HASH_BYTES`] at the end, so the same
/// primitive serves both the whole-file fingerprint (§3) and, once wired
/// through [`crate::patch`], the per-chunk strong hash used by the delta
/// transfer (§4.6 "tree hash" variant — same type, different scope).
#[derive(Default)]
pub struct HashingWriter {
    hasher: Sha256,
}

impl HashingWriter {
    pub fn new() -> Self {
        HashingWriter {
            hasher: Sha256::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    pub fn finish(self) -> Hash {
        let digest = self.hasher.finalize();
        Hash::from_bytes(&digest[..HASH_BYTES])
    }
}

/// Hash an in-memory buffer in one call.
pub fn hash_bytes(data: &[u8]) -> Hash {
    let mut w = HashingWriter::new();
    w.update(data);
    w.finish()
}

/// Hash a whole file by streaming it through in fixed-size reads, so large
/// files never need to be buffered entirely in memory.
pub fn hash_reader<R: std::io::Read>(mut reader: R) -> std::io::Result<Hash> {
    let mut w = HashingWriter::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        w.update(&buf[..n]);
    }
    Ok(w.finish())
}

/// The "wildcard client" value reserved for index lookups that should
/// ignore which client holds the content (§3).
pub const WILDCARD_CLIENT: u32 = 0;

/// `(Hash, file_size_bytes, client_id)` — the content-addressed index key.
///
/// Serializes big-endian so that byte-lexicographic order gives: same hash
/// grouped together; within a hash, same size grouped; within
/// `(hash,size)`, ordered by client (§3).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct IndexKey {
    pub hash: Hash,
    pub size: u64,
    pub client: u32,
}

/// On-disk/in-memory big-endian encoding of an [`IndexKey`]:
/// 16-byte hash, 8-byte size, 4-byte client, all big-endian.
pub const INDEX_KEY_BYTES: usize = HASH_BYTES + 8 + 4;

impl IndexKey {
    pub fn new(hash: Hash, size: u64, client: u32) -> Self {
        IndexKey { hash, size, client }
    }

    /// A lookup key that ignores the client (§3 "wildcard client").
    pub fn wildcard(hash: Hash, size: u64) -> Self {
        IndexKey {
            hash,
            size,
            client: WILDCARD_CLIENT,
        }
    }

    pub fn to_be_bytes(&self) -> [u8; INDEX_KEY_BYTES] {
        let mut out = [0u8; INDEX_KEY_BYTES];
        out[..HASH_BYTES].copy_from_slice(&self.hash.0);
        out[HASH_BYTES..HASH_BYTES + 8].copy_from_slice(&self.size.to_be_bytes());
        out[HASH_BYTES + 8..].copy_from_slice(&self.client.to_be_bytes());
        out
    }

    pub fn from_be_bytes(bytes: &[u8; INDEX_KEY_BYTES]) -> Self {
        let hash = Hash::from_bytes(&bytes[..HASH_BYTES]);
        let size = u64::from_be_bytes(bytes[HASH_BYTES..HASH_BYTES + 8].try_into().unwrap());
        let client = u32::from_be_bytes(bytes[HASH_BYTES + 8..].try_into().unwrap());
        IndexKey { hash, size, client }
    }

    /// The `(hash,size)` byte prefix shared by every client's entry for
    /// this content — used for `BTreeMap::range` prefix scans
    /// ("isEqualWithoutClientid" in `original_source/urbackupserver/FileIndex.h`).
    pub fn hash_size_prefix(&self) -> [u8; HASH_BYTES + 8] {
        let mut out = [0u8; HASH_BYTES + 8];
        out[..HASH_BYTES].copy_from_slice(&self.hash.0);
        out[HASH_BYTES..].copy_from_slice(&self.size.to_be_bytes());
        out
    }

    pub fn is_equal_without_client(&self, other: &IndexKey) -> bool {
        self.hash == other.hash && self.size == other.size
    }
}
