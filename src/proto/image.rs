//! Image-backup wire header and block-stream framing (§6 "Image backup
//! header on the wire").
//!
//! The fixed header precedes the block stream; blocks themselves are
//! length-prefixed records interspersed with keepalive and hash-checkpoint
//! sentinels so a stalled link can be detected without waiting for EOF.

use bitflags::bitflags;
use crc32fast::Hasher as Crc32;
use endian_trait::Endian;

/// Block offset sentinel: link keepalive, no payload follows.
pub const SENTINEL_KEEPALIVE: i64 = -125;
/// Block offset sentinel: a cumulative CRC32 checkpoint follows as a u32.
pub const SENTINEL_HASH_CHECKPOINT: i64 = -126;
/// Block offset sentinel: normal block terminator.
pub const SENTINEL_BLOCK_TERMINATOR: i64 = -123;
/// Block offset sentinel: end of the image stream.
pub const SENTINEL_END_OF_IMAGE: i64 = 0x7fff_ffff_ffff_ffff;

bitflags! {
    /// Per-image flags carried in [`ImageHeaderFixed::flags`].
    #[derive(Default)]
    pub struct ImageFlags: u8 {
        /// The image is a persistent (changed-block-tracked) incremental.
        const PERSISTENT = 0x01;
        /// A sparse/changed-block bitmap follows the header.
        const BITMAP     = 0x02;
    }
}

/// Fixed-size header at the start of an image-backup wire stream. Declared
/// `#[repr(C, packed)]` with `#[derive(Endian)]` so it can be written and
/// read as raw bytes in the wire's fixed little-endian layout, matching how
/// the teacher's tape code frames its own packed records.
#[repr(C, packed)]
#[derive(Endian, Debug, Copy, Clone, PartialEq, Eq)]
pub struct ImageHeaderFixed {
    pub blocksize: u32,
    pub drivesize: i64,
    pub blockcount: i64,
    pub flags: u8,
    pub shadowdata_len: u32,
}

impl ImageHeaderFixed {
    pub const WIRE_SIZE: usize = 4 + 8 + 8 + 1 + 4;

    pub fn to_le_bytes(self) -> Vec<u8> {
        let host = self.to_le();
        let mut out = Vec::with_capacity(Self::WIRE_SIZE);
        out.extend_from_slice(&host.blocksize.to_le_bytes());
        out.extend_from_slice(&host.drivesize.to_le_bytes());
        out.extend_from_slice(&host.blockcount.to_le_bytes());
        out.push(host.flags);
        out.extend_from_slice(&host.shadowdata_len.to_le_bytes());
        out
    }

    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::WIRE_SIZE {
            return None;
        }
        let blocksize = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let drivesize = i64::from_le_bytes(bytes[4..12].try_into().ok()?);
        let blockcount = i64::from_le_bytes(bytes[12..20].try_into().ok()?);
        let flags = bytes[20];
        let shadowdata_len = u32::from_le_bytes(bytes[21..25].try_into().ok()?);
        Some(ImageHeaderFixed {
            blocksize,
            drivesize,
            blockcount,
            flags,
            shadowdata_len,
        })
    }
}

/// One changed-block record: an absolute byte offset within the volume and
/// its `blocksize` bytes of content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRecord {
    pub offset: i64,
    pub data: Vec<u8>,
}

/// Accumulates a running CRC32 across emitted blocks so a checkpoint
/// sentinel can assert the receiver's view matches the sender's so far.
#[derive(Default)]
pub struct HashCheckpoint {
    hasher: Crc32,
}

impl HashCheckpoint {
    pub fn new() -> Self {
        HashCheckpoint::default()
    }

    pub fn update(&mut self, block: &BlockRecord) {
        self.hasher.update(&block.offset.to_le_bytes());
        self.hasher.update(&block.data);
    }

    pub fn checkpoint(&self) -> u32 {
        self.hasher.clone().finalize()
    }
}
