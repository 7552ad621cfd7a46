//! Fixed-size blocks, the atomic unit of partitioning.

use serde::{Deserialize, Serialize};

use crate::grid::IndexBox;

/// Edge length of a block in cells.
pub const BLOCK_SIZE: i32 = 8;

/// Number of cells in one block.
pub const CELLS_PER_BLOCK: u32 = (BLOCK_SIZE * BLOCK_SIZE * BLOCK_SIZE) as u32;

/// An axis-aligned cube of `BLOCK_SIZE`^3 cells with its occupied-cell count.
///
/// `origin` is the minimum corner in cell coordinates and is always a
/// multiple of [`BLOCK_SIZE`] on every axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Block {
    /// Minimum corner in cell coordinates.
    pub origin: [i32; 3],
    /// Number of active cells inside the block.
    pub active_cells: u32,
}

impl Block {
    /// Create a block at `origin` holding `active_cells` active cells.
    pub fn new(origin: [i32; 3], active_cells: u32) -> Self {
        Self {
            origin,
            active_cells,
        }
    }

    /// Block-space coordinate (origin divided by the block size).
    pub fn coord(&self) -> [i32; 3] {
        block_coord(self.origin)
    }

    /// Whether `origin` lies on the block lattice.
    pub fn is_aligned(&self) -> bool {
        self.origin.iter().all(|c| c.rem_euclid(BLOCK_SIZE) == 0)
    }

    /// Inclusive cell-space bounds covered by the block.
    pub fn bounds(&self) -> IndexBox {
        IndexBox::new(
            self.origin,
            [
                self.origin[0] + BLOCK_SIZE - 1,
                self.origin[1] + BLOCK_SIZE - 1,
                self.origin[2] + BLOCK_SIZE - 1,
            ],
        )
    }
}

/// Block-space coordinate of the block containing `cell`.
pub fn block_coord(cell: [i32; 3]) -> [i32; 3] {
    [
        cell[0].div_euclid(BLOCK_SIZE),
        cell[1].div_euclid(BLOCK_SIZE),
        cell[2].div_euclid(BLOCK_SIZE),
    ]
}

/// Index of `cell` within its block, x fastest, in `0..CELLS_PER_BLOCK`.
pub fn local_cell_index(cell: [i32; 3]) -> usize {
    let lx = cell[0].rem_euclid(BLOCK_SIZE) as usize;
    let ly = cell[1].rem_euclid(BLOCK_SIZE) as usize;
    let lz = cell[2].rem_euclid(BLOCK_SIZE) as usize;
    let b = BLOCK_SIZE as usize;
    lx + b * (ly + b * lz)
}
