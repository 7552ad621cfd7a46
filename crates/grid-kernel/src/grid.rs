//! Sparse block-structured occupancy.
//!
//! A [`SparseGrid`] stores which cells are active as one 512-bit mask per
//! occupied block. Active cells are numbered densely: blocks are ordered by
//! block coordinate (z, then y, then x) and cells inside a block by their
//! local index, so every active cell has a stable global linear index in
//! `0..active_cell_count()`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::block::{block_coord, local_cell_index, Block, BLOCK_SIZE, CELLS_PER_BLOCK};

const MASK_WORDS: usize = (CELLS_PER_BLOCK as usize) / 64;

/// Inclusive integer box in cell coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexBox {
    /// Minimum corner (inclusive).
    pub min: [i32; 3],
    /// Maximum corner (inclusive).
    pub max: [i32; 3],
}

impl IndexBox {
    /// Create a box from inclusive corners.
    pub fn new(min: [i32; 3], max: [i32; 3]) -> Self {
        Self { min, max }
    }

    /// Box containing the single cell `cell`.
    pub fn cell(cell: [i32; 3]) -> Self {
        Self::new(cell, cell)
    }

    /// Number of cells along each axis.
    pub fn extent(&self) -> [usize; 3] {
        [
            (self.max[0] - self.min[0] + 1).max(0) as usize,
            (self.max[1] - self.min[1] + 1).max(0) as usize,
            (self.max[2] - self.min[2] + 1).max(0) as usize,
        ]
    }

    /// Total number of cells in the box.
    pub fn volume(&self) -> u64 {
        let e = self.extent();
        e[0] as u64 * e[1] as u64 * e[2] as u64
    }

    /// Whether `cell` lies inside the box.
    pub fn contains(&self, cell: [i32; 3]) -> bool {
        (0..3).all(|a| cell[a] >= self.min[a] && cell[a] <= self.max[a])
    }

    /// Overlap of two boxes, `None` when they share no cell.
    pub fn intersect(&self, other: &IndexBox) -> Option<IndexBox> {
        let mut min = [0; 3];
        let mut max = [0; 3];
        for a in 0..3 {
            min[a] = self.min[a].max(other.min[a]);
            max[a] = self.max[a].min(other.max[a]);
            if min[a] > max[a] {
                return None;
            }
        }
        Some(IndexBox::new(min, max))
    }

    /// Whether the two boxes share at least one cell.
    pub fn overlaps(&self, other: &IndexBox) -> bool {
        self.intersect(other).is_some()
    }

    /// Smallest box containing both boxes.
    pub fn union(&self, other: &IndexBox) -> IndexBox {
        let mut out = *self;
        for a in 0..3 {
            out.min[a] = out.min[a].min(other.min[a]);
            out.max[a] = out.max[a].max(other.max[a]);
        }
        out
    }

    /// Box grown by `by` cells on every side.
    pub fn expand(&self, by: i32) -> IndexBox {
        IndexBox::new(
            [self.min[0] - by, self.min[1] - by, self.min[2] - by],
            [self.max[0] + by, self.max[1] + by, self.max[2] + by],
        )
    }

    /// Iterate over every cell in the box, x fastest.
    pub fn cells(&self) -> impl Iterator<Item = [i32; 3]> + '_ {
        let (min, max) = (self.min, self.max);
        (min[2]..=max[2]).flat_map(move |z| {
            (min[1]..=max[1]).flat_map(move |y| (min[0]..=max[0]).map(move |x| [x, y, z]))
        })
    }
}

/// Read-only view of a sparse occupancy consumed by decomposition and halo
/// exchange.
pub trait Occupancy {
    /// Occupied blocks with their active-cell counts.
    fn blocks(&self) -> &[Block];

    /// Global linear index of an active cell, `None` when the cell is not
    /// part of the sparse structure.
    fn linear_index(&self, cell: [i32; 3]) -> Option<usize>;

    /// Total number of active cells.
    fn active_cell_count(&self) -> usize;

    /// Active cells of the block at `origin` paired with their linear index,
    /// in linear-index order.
    fn block_cells(&self, origin: [i32; 3]) -> Vec<([i32; 3], usize)>;

    /// Whether `cell` is active.
    fn is_active(&self, cell: [i32; 3]) -> bool {
        self.linear_index(cell).is_some()
    }
}

/// Occupancy stored as a bitmask per block.
#[derive(Debug, Clone, Default)]
pub struct SparseGrid {
    blocks: Vec<Block>,
    masks: Vec<[u64; MASK_WORDS]>,
    offsets: Vec<usize>,
    lookup: HashMap<[i32; 3], usize>,
    active: usize,
}

impl SparseGrid {
    /// Start building a grid cell by cell.
    pub fn builder() -> SparseGridBuilder {
        SparseGridBuilder::default()
    }

    /// Grid whose listed blocks are fully occupied. Coordinates are in block
    /// space.
    pub fn dense_blocks(coords: impl IntoIterator<Item = [i32; 3]>) -> Self {
        let mut builder = Self::builder();
        for c in coords {
            builder.activate_block(c);
        }
        builder.build()
    }

    /// Number of occupied blocks.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Cell-space bounds of all occupied blocks.
    pub fn bounds(&self) -> Option<IndexBox> {
        self.blocks
            .iter()
            .map(Block::bounds)
            .reduce(|acc, b| acc.union(&b))
    }

    /// Every active cell in linear-index order.
    pub fn active_cells(&self) -> Vec<[i32; 3]> {
        let mut out = Vec::with_capacity(self.active);
        for b in &self.blocks {
            out.extend(self.block_cells(b.origin).into_iter().map(|(c, _)| c));
        }
        out
    }

    fn slot_of(&self, cell: [i32; 3]) -> Option<usize> {
        self.lookup.get(&block_coord(cell)).copied()
    }
}

fn bit_set(mask: &[u64; MASK_WORDS], local: usize) -> bool {
    mask[local / 64] & (1u64 << (local % 64)) != 0
}

fn rank(mask: &[u64; MASK_WORDS], local: usize) -> usize {
    let word = local / 64;
    let below: u32 = mask[..word].iter().map(|w| w.count_ones()).sum();
    let partial = mask[word] & ((1u64 << (local % 64)) - 1);
    (below + partial.count_ones()) as usize
}

impl Occupancy for SparseGrid {
    fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    fn linear_index(&self, cell: [i32; 3]) -> Option<usize> {
        let slot = self.slot_of(cell)?;
        let local = local_cell_index(cell);
        let mask = &self.masks[slot];
        if !bit_set(mask, local) {
            return None;
        }
        Some(self.offsets[slot] + rank(mask, local))
    }

    fn active_cell_count(&self) -> usize {
        self.active
    }

    fn block_cells(&self, origin: [i32; 3]) -> Vec<([i32; 3], usize)> {
        let Some(slot) = self.lookup.get(&block_coord(origin)).copied() else {
            return Vec::new();
        };
        let mask = &self.masks[slot];
        let base = self.blocks[slot].origin;
        let b = BLOCK_SIZE as usize;
        let mut out = Vec::with_capacity(self.blocks[slot].active_cells as usize);
        let mut next = self.offsets[slot];
        for local in 0..CELLS_PER_BLOCK as usize {
            if bit_set(mask, local) {
                let cell = [
                    base[0] + (local % b) as i32,
                    base[1] + ((local / b) % b) as i32,
                    base[2] + (local / (b * b)) as i32,
                ];
                out.push((cell, next));
                next += 1;
            }
        }
        out
    }
}

/// Accumulates active cells and produces an immutable [`SparseGrid`].
#[derive(Debug, Default)]
pub struct SparseGridBuilder {
    masks: HashMap<[i32; 3], [u64; MASK_WORDS]>,
}

impl SparseGridBuilder {
    /// Mark one cell active.
    pub fn activate(&mut self, cell: [i32; 3]) -> &mut Self {
        let local = local_cell_index(cell);
        let mask = self
            .masks
            .entry(block_coord(cell))
            .or_insert([0; MASK_WORDS]);
        mask[local / 64] |= 1u64 << (local % 64);
        self
    }

    /// Mark every cell of the block at block coordinate `coord` active.
    pub fn activate_block(&mut self, coord: [i32; 3]) -> &mut Self {
        self.masks.insert(coord, [u64::MAX; MASK_WORDS]);
        self
    }

    /// Mark every cell of `region` active.
    pub fn activate_box(&mut self, region: &IndexBox) -> &mut Self {
        for cell in region.cells() {
            self.activate(cell);
        }
        self
    }

    /// Freeze the occupancy and assign linear indices.
    pub fn build(&self) -> SparseGrid {
        let mut coords: Vec<[i32; 3]> = self
            .masks
            .iter()
            .filter(|(_, m)| m.iter().any(|w| *w != 0))
            .map(|(c, _)| *c)
            .collect();
        coords.sort_by_key(|c| (c[2], c[1], c[0]));

        let mut grid = SparseGrid::default();
        for (slot, coord) in coords.into_iter().enumerate() {
            let mask = self.masks[&coord];
            let count: u32 = mask.iter().map(|w| w.count_ones()).sum();
            let origin = [
                coord[0] * BLOCK_SIZE,
                coord[1] * BLOCK_SIZE,
                coord[2] * BLOCK_SIZE,
            ];
            grid.blocks.push(Block::new(origin, count));
            grid.masks.push(mask);
            grid.offsets.push(grid.active);
            grid.lookup.insert(coord, slot);
            grid.active += count as usize;
        }
        grid
    }
}
