//! Chunk-hash sidecar: one 32-byte strong hash per 512 KiB chunk of a
//! stored file, kept alongside the file at its `hashpath` (§3, §4.6), plus
//! the full on-disk sidecar record — chunk hashes followed by OS metadata,
//! an alternate-data-stream table, a data checksum and a POSIX stat block
//! (§6 "`<backup_root>/<client>/<timestamp>/.hashes/…`").

use std::io::{self, Read, Write};

use crc32fast::Hasher as Crc32;
use endian_trait::Endian;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::{CHUNK_SIZE, STRONG_HASH_BYTES};

/// Full (untruncated) SHA-256 over one chunk, distinct from [`crate::hash::Hash`]
/// (16 bytes, whole-file fingerprint): the chunk-level sidecar wants the
/// full 32-byte digest per base spec §4.6.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ChunkHash(pub [u8; STRONG_HASH_BYTES]);

impl ChunkHash {
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let digest = hasher.finalize();
        let mut out = [0u8; STRONG_HASH_BYTES];
        out.copy_from_slice(&digest);
        ChunkHash(out)
    }
}

/// Ordered list of per-chunk strong hashes for a file, indexed by chunk
/// number (`offset = index * CHUNK_SIZE`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkSidecar {
    pub chunk_hashes: Vec<ChunkHash>,
}

impl ChunkSidecar {
    /// Compute the sidecar for a whole file read from `reader`, chunking
    /// it at `CHUNK_SIZE` boundaries.
    pub fn compute<R: Read>(mut reader: R) -> io::Result<Self> {
        let mut chunk_hashes = Vec::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = read_full(&mut reader, &mut buf)?;
            if n == 0 {
                break;
            }
            chunk_hashes.push(ChunkHash::of(&buf[..n]));
            if n < CHUNK_SIZE {
                break;
            }
        }
        Ok(ChunkSidecar { chunk_hashes })
    }

    /// Serialize as a flat run of 32-byte hashes, the on-disk sidecar
    /// format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.chunk_hashes.len() * STRONG_HASH_BYTES);
        for h in &self.chunk_hashes {
            out.extend_from_slice(&h.0);
        }
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let chunk_hashes = bytes
            .chunks_exact(STRONG_HASH_BYTES)
            .map(|c| {
                let mut arr = [0u8; STRONG_HASH_BYTES];
                arr.copy_from_slice(c);
                ChunkHash(arr)
            })
            .collect();
        ChunkSidecar { chunk_hashes }
    }

    pub fn write_to<W: Write>(&self, mut w: W) -> io::Result<()> {
        w.write_all(&self.to_bytes())
    }
}

/// Read until `buf` is full or the reader is exhausted, unlike
/// `Read::read` which may return short reads.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Magic marking a stat blob as Windows metadata, little-endian on the
/// wire (§6).
pub const MAGIC_WINDOWS: u64 = 0x320FAB3D119DCB4A;
/// Magic marking a stat blob as Unix metadata, little-endian on the wire
/// (§6).
pub const MAGIC_UNIX: u64 = 0xFE4378A3467647F0;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SidecarError {
    #[error("truncated sidecar record")]
    Truncated,
    #[error("unrecognized OS-metadata magic {0:#x}")]
    BadMagic(u64),
    #[error("attribute stream has an empty name")]
    EmptyStreamName,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsKind {
    Windows,
    Unix,
}

impl OsKind {
    fn magic(self) -> u64 {
        match self {
            OsKind::Windows => MAGIC_WINDOWS,
            OsKind::Unix => MAGIC_UNIX,
        }
    }

    fn from_magic(magic: u64) -> Result<Self, SidecarError> {
        match magic {
            MAGIC_WINDOWS => Ok(OsKind::Windows),
            MAGIC_UNIX => Ok(OsKind::Unix),
            other => Err(SidecarError::BadMagic(other)),
        }
    }
}

/// One named alternate data stream or extended attribute carried alongside
/// a file's stat blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeStream {
    pub name: String,
    pub data: Vec<u8>,
}

/// Fixed-width POSIX permission/ownership/timestamp block that trails
/// every sidecar record regardless of `OsKind`, so a Windows-originated
/// backup can still be restored onto a POSIX target (§6).
#[repr(C, packed)]
#[derive(Endian, Debug, Clone, Copy, PartialEq, Eq)]
pub struct PosixStat {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime: i64,
    pub atime: i64,
    pub ctime: i64,
}

impl PosixStat {
    const WIRE_SIZE: usize = 4 + 4 + 4 + 8 + 8 + 8;

    fn to_le_bytes(self) -> [u8; Self::WIRE_SIZE] {
        let host = self.to_le();
        let mut out = [0u8; Self::WIRE_SIZE];
        out[0..4].copy_from_slice(&host.mode.to_le_bytes());
        out[4..8].copy_from_slice(&host.uid.to_le_bytes());
        out[8..12].copy_from_slice(&host.gid.to_le_bytes());
        out[12..20].copy_from_slice(&host.mtime.to_le_bytes());
        out[20..28].copy_from_slice(&host.atime.to_le_bytes());
        out[28..36].copy_from_slice(&host.ctime.to_le_bytes());
        out
    }

    fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::WIRE_SIZE {
            return None;
        }
        Some(PosixStat {
            mode: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
            uid: u32::from_le_bytes(bytes[4..8].try_into().ok()?),
            gid: u32::from_le_bytes(bytes[8..12].try_into().ok()?),
            mtime: i64::from_le_bytes(bytes[12..20].try_into().ok()?),
            atime: i64::from_le_bytes(bytes[20..28].try_into().ok()?),
            ctime: i64::from_le_bytes(bytes[28..36].try_into().ok()?),
        })
    }
}

/// The full on-disk sidecar record for one stored file: chunk hashes plus
/// OS metadata, attribute streams, a data checksum and a POSIX stat block
/// (§6). Directories get the same layout with an empty [`ChunkSidecar`]
/// (`.dir_metadata`, §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarRecord {
    pub chunks: ChunkSidecar,
    pub os_kind: OsKind,
    pub stat_blob: Vec<u8>,
    pub attribute_streams: Vec<AttributeStream>,
    pub data_checksum: u32,
    pub posix_stat: PosixStat,
}

impl SidecarRecord {
    /// CRC32 over a file's data, the value stored as `data-checksum` (§6).
    pub fn checksum_data(data: &[u8]) -> u32 {
        let mut hasher = Crc32::new();
        hasher.update(data);
        hasher.finalize()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let hash_bytes = self.chunks.to_bytes();
        let mut out = Vec::new();
        out.extend_from_slice(&(hash_bytes.len() as u32).to_le_bytes());
        out.extend_from_slice(&hash_bytes);
        out.extend_from_slice(&self.os_kind.magic().to_le_bytes());
        out.extend_from_slice(&(self.stat_blob.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.stat_blob);
        out.extend_from_slice(&(self.attribute_streams.len() as u32).to_le_bytes());
        for stream in &self.attribute_streams {
            out.extend_from_slice(&(stream.name.len() as u32).to_le_bytes());
            out.extend_from_slice(stream.name.as_bytes());
            out.extend_from_slice(&(stream.data.len() as u64).to_le_bytes());
            out.extend_from_slice(&stream.data);
        }
        out.extend_from_slice(&self.data_checksum.to_le_bytes());
        out.extend_from_slice(&self.posix_stat.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SidecarError> {
        let mut cursor = bytes;
        let hashdata_len = take_u32(&mut cursor)? as usize;
        let hash_bytes = take_n(&mut cursor, hashdata_len)?;
        let chunks = ChunkSidecar::from_bytes(hash_bytes);

        let magic = take_u64(&mut cursor)?;
        let os_kind = OsKind::from_magic(magic)?;

        let stat_len = take_u32(&mut cursor)? as usize;
        let stat_blob = take_n(&mut cursor, stat_len)?.to_vec();

        let stream_count = take_u32(&mut cursor)?;
        let mut attribute_streams = Vec::with_capacity(stream_count as usize);
        for _ in 0..stream_count {
            let name_len = take_u32(&mut cursor)? as usize;
            let name = String::from_utf8_lossy(take_n(&mut cursor, name_len)?).into_owned();
            if name.is_empty() {
                return Err(SidecarError::EmptyStreamName);
            }
            let data_len = take_u64(&mut cursor)? as usize;
            let data = take_n(&mut cursor, data_len)?.to_vec();
            attribute_streams.push(AttributeStream { name, data });
        }

        let data_checksum = take_u32(&mut cursor)?;
        let posix_stat = PosixStat::from_le_bytes(cursor).ok_or(SidecarError::Truncated)?;

        Ok(SidecarRecord {
            chunks,
            os_kind,
            stat_blob,
            attribute_streams,
            data_checksum,
            posix_stat,
        })
    }
}

fn take_n<'a>(cursor: &mut &'a [u8], n: usize) -> Result<&'a [u8], SidecarError> {
    if cursor.len() < n {
        return Err(SidecarError::Truncated);
    }
    let (head, tail) = cursor.split_at(n);
    *cursor = tail;
    Ok(head)
}

fn take_u32(cursor: &mut &[u8]) -> Result<u32, SidecarError> {
    let bytes = take_n(cursor, 4)?;
    Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
}

fn take_u64(cursor: &mut &[u8]) -> Result<u64, SidecarError> {
    let bytes = take_n(cursor, 8)?;
    Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_roundtrips_through_bytes() {
        let data = vec![0x5au8; CHUNK_SIZE * 2 + 100];
        let sidecar = ChunkSidecar::compute(std::io::Cursor::new(&data)).unwrap();
        assert_eq!(sidecar.chunk_hashes.len(), 3);
        let bytes = sidecar.to_bytes();
        let back = ChunkSidecar::from_bytes(&bytes);
        assert_eq!(sidecar, back);
    }

    #[test]
    fn identical_chunks_hash_identically() {
        let data = vec![0x11u8; CHUNK_SIZE * 2];
        let sidecar = ChunkSidecar::compute(std::io::Cursor::new(&data)).unwrap();
        assert_eq!(sidecar.chunk_hashes[0], sidecar.chunk_hashes[1]);
    }

    fn sample_record(os_kind: OsKind) -> SidecarRecord {
        let data = b"restore contents";
        SidecarRecord {
            chunks: ChunkSidecar::compute(std::io::Cursor::new(data)).unwrap(),
            os_kind,
            stat_blob: vec![1, 2, 3, 4],
            attribute_streams: vec![AttributeStream {
                name: "user.comment".to_string(),
                data: b"hello".to_vec(),
            }],
            data_checksum: SidecarRecord::checksum_data(data),
            posix_stat: PosixStat {
                mode: 0o644,
                uid: 1000,
                gid: 1000,
                mtime: 1_700_000_000,
                atime: 1_700_000_000,
                ctime: 1_700_000_000,
            },
        }
    }

    #[test]
    fn sidecar_record_roundtrips_unix() {
        let record = sample_record(OsKind::Unix);
        let bytes = record.to_bytes();
        let back = SidecarRecord::from_bytes(&bytes).unwrap();
        assert_eq!(record, back);
    }

    #[test]
    fn sidecar_record_roundtrips_windows() {
        let record = sample_record(OsKind::Windows);
        let bytes = record.to_bytes();
        let back = SidecarRecord::from_bytes(&bytes).unwrap();
        assert_eq!(record, back);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let record = sample_record(OsKind::Unix);
        let mut bytes = record.to_bytes();
        let hashdata_len = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let magic_offset = 4 + hashdata_len;
        bytes[magic_offset..magic_offset + 8].copy_from_slice(&0u64.to_le_bytes());
        assert!(matches!(
            SidecarRecord::from_bytes(&bytes),
            Err(SidecarError::BadMagic(0))
        ));
    }

    #[test]
    fn empty_stream_name_is_rejected() {
        let mut record = sample_record(OsKind::Unix);
        record.attribute_streams[0].name = String::new();
        let bytes = record.to_bytes();
        assert_eq!(
            SidecarRecord::from_bytes(&bytes),
            Err(SidecarError::EmptyStreamName)
        );
    }

    #[test]
    fn truncated_record_is_rejected() {
        let record = sample_record(OsKind::Unix);
        let bytes = record.to_bytes();
        let truncated = &bytes[..bytes.len() - 10];
        assert!(SidecarRecord::from_bytes(truncated).is_err());
    }
}
