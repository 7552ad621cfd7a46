//! Morton (Z-order) keys over block coordinates.
//!
//! Each axis keeps 21 bits. Coordinates are biased by 2^20 first so that
//! negative block coordinates sort before positive ones.

use grid_kernel::Block;

/// Bits kept per axis.
pub const AXIS_BITS: u32 = 21;

const BIAS: i64 = 1 << (AXIS_BITS - 1);
const AXIS_MASK: u64 = (1 << AXIS_BITS) - 1;

/// Spread the low 21 bits of `v` so that bit `i` lands on bit `3i`.
fn spread(v: u64) -> u64 {
    let mut x = v & AXIS_MASK;
    x = (x | (x << 32)) & 0x001f_0000_0000_ffff;
    x = (x | (x << 16)) & 0x001f_0000_ff00_00ff;
    x = (x | (x << 8)) & 0x100f_00f0_0f00_f00f;
    x = (x | (x << 4)) & 0x10c3_0c30_c30c_30c3;
    x = (x | (x << 2)) & 0x1249_2492_4924_9249;
    x
}

/// Inverse of [`spread`].
fn compact(v: u64) -> u64 {
    let mut x = v & 0x1249_2492_4924_9249;
    x = (x | (x >> 2)) & 0x10c3_0c30_c30c_30c3;
    x = (x | (x >> 4)) & 0x100f_00f0_0f00_f00f;
    x = (x | (x >> 8)) & 0x001f_0000_ff00_00ff;
    x = (x | (x >> 16)) & 0x001f_0000_0000_ffff;
    x = (x | (x >> 32)) & AXIS_MASK;
    x
}

/// Interleave a block coordinate into a Morton key, x in the lowest bit.
///
/// Coordinates outside `[-2^20, 2^20)` wrap.
pub fn encode(coord: [i32; 3]) -> u64 {
    let biased = coord.map(|c| ((c as i64 + BIAS) as u64) & AXIS_MASK);
    spread(biased[0]) | (spread(biased[1]) << 1) | (spread(biased[2]) << 2)
}

/// Recover the block coordinate from a key produced by [`encode`].
pub fn decode(key: u64) -> [i32; 3] {
    [key, key >> 1, key >> 2].map(|k| (compact(k) as i64 - BIAS) as i32)
}

/// Sort key of a block: the Morton key of its block coordinate.
pub fn block_key(block: &Block) -> u64 {
    encode(block.coord())
}
