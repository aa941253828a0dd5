//! Rolling (weak) checksum over sub-blocks, used to relocate a base chunk
//! that has shifted position in the new file (§4.6: "run a weak
//! rolling-hash pass against the base to find any base chunk with the
//! same strong hash").
//!
//! This is the classic rsync/Adler-32-style rolling checksum: O(1) to
//! advance the window by one byte, so a full pass over the base costs
//! O(base_len) rather than O(base_len * window_len).

use super::SUBBLOCK_SIZE;

const MOD_ADLER: u32 = 65521;

/// Rolling checksum over a fixed-size window. `roll` advances the window
/// by dropping `old_byte` (leaving the window) and adding `new_byte`
/// (entering it) in O(1).
#[derive(Clone, Copy, Debug)]
pub struct RollingChecksum {
    a: u32,
    b: u32,
    len: u32,
}

impl RollingChecksum {
    pub fn new(window: &[u8]) -> Self {
        let mut a: u32 = 1;
        let mut b: u32 = 0;
        for &byte in window {
            a = (a + byte as u32) % MOD_ADLER;
            b = (b + a) % MOD_ADLER;
        }
        RollingChecksum {
            a,
            b,
            len: window.len() as u32,
        }
    }

    pub fn value(&self) -> u32 {
        (self.b << 16) | self.a
    }

    pub fn roll(&mut self, old_byte: u8, new_byte: u8) {
        self.a = (self.a + MOD_ADLER + new_byte as u32 - old_byte as u32) % MOD_ADLER;
        self.b = (self.b + MOD_ADLER * (self.len) + self.a - self.len * (old_byte as u32) - 1)
            % MOD_ADLER;
    }
}

/// Map from rolling checksum of every `SUBBLOCK_SIZE`-aligned window in
/// `base` to the byte offsets that produced it, used to relocate a chunk
/// whose position has shifted between versions.
pub fn build_subblock_index(base: &[u8]) -> std::collections::HashMap<u32, Vec<usize>> {
    let mut index: std::collections::HashMap<u32, Vec<usize>> = std::collections::HashMap::new();
    if base.len() < SUBBLOCK_SIZE {
        return index;
    }
    let mut offset = 0;
    while offset + SUBBLOCK_SIZE <= base.len() {
        let checksum = RollingChecksum::new(&base[offset..offset + SUBBLOCK_SIZE]);
        index.entry(checksum.value()).or_default().push(offset);
        offset += SUBBLOCK_SIZE;
    }
    index
}
