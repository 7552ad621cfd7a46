//! Block-granular domain decomposition
//!
//! Occupied blocks are ordered along a Morton curve and cut into `N`
//! contiguous runs of roughly equal active-cell count. Each run becomes a
//! [`SubDomain`] with an axis-aligned bounding box; partitions whose boxes
//! touch face to face are linked as neighbors for halo exchange.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use grid_kernel::block::block_coord;
use grid_kernel::{Block, IndexBox, CELLS_PER_BLOCK};
use serde::{Deserialize, Serialize};

use crate::morton;

/// One of the six faces of an axis-aligned box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Face {
    /// Minimum x.
    NegX,
    /// Maximum x.
    PosX,
    /// Minimum y.
    NegY,
    /// Maximum y.
    PosY,
    /// Minimum z.
    NegZ,
    /// Maximum z.
    PosZ,
}

impl Face {
    /// All faces, negative before positive per axis.
    pub const ALL: [Face; 6] = [
        Face::NegX,
        Face::PosX,
        Face::NegY,
        Face::PosY,
        Face::NegZ,
        Face::PosZ,
    ];

    /// Face on the given side of `axis`.
    pub fn new(axis: usize, positive: bool) -> Face {
        match (axis, positive) {
            (0, false) => Face::NegX,
            (0, true) => Face::PosX,
            (1, false) => Face::NegY,
            (1, true) => Face::PosY,
            (_, false) => Face::NegZ,
            (_, true) => Face::PosZ,
        }
    }

    /// Axis normal to the face.
    pub fn axis(self) -> usize {
        match self {
            Face::NegX | Face::PosX => 0,
            Face::NegY | Face::PosY => 1,
            Face::NegZ | Face::PosZ => 2,
        }
    }

    /// Whether the face lies on the maximum side of its axis.
    pub fn is_positive(self) -> bool {
        matches!(self, Face::PosX | Face::PosY | Face::PosZ)
    }

    /// The face a neighbor sees.
    pub fn opposite(self) -> Face {
        Face::new(self.axis(), !self.is_positive())
    }

    /// The two axes spanning the face, fastest first.
    pub fn in_plane_axes(self) -> (usize, usize) {
        match self.axis() {
            0 => (1, 2),
            1 => (0, 2),
            _ => (0, 1),
        }
    }

    /// Short label such as `-X`.
    pub fn label(self) -> &'static str {
        match self {
            Face::NegX => "-X",
            Face::PosX => "+X",
            Face::NegY => "-Y",
            Face::PosY => "+Y",
            Face::NegZ => "-Z",
            Face::PosZ => "+Z",
        }
    }
}

impl fmt::Display for Face {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A face-adjacent partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbor {
    /// Index of the neighboring partition.
    pub partition: usize,
    /// Face of this partition the neighbor lies against.
    pub face: Face,
}

/// One partition's share of the grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubDomain {
    /// Partition index.
    pub index: usize,
    /// Cell-space bounding box of the assigned blocks, `None` when empty.
    pub bounds: Option<IndexBox>,
    /// Assigned blocks in Morton order.
    pub blocks: Vec<Block>,
    /// Sum of the blocks' active cells.
    pub active_cells: u64,
    /// Face neighbors sorted by partition index.
    pub neighbors: Vec<Neighbor>,
}

impl SubDomain {
    fn empty(index: usize) -> Self {
        Self {
            index,
            bounds: None,
            blocks: Vec::new(),
            active_cells: 0,
            neighbors: Vec::new(),
        }
    }

    /// Whether no block was assigned.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Neighbors lying against `face`.
    pub fn neighbors_on(&self, face: Face) -> impl Iterator<Item = &Neighbor> + '_ {
        self.neighbors.iter().filter(move |n| n.face == face)
    }

    /// Faces with at least one neighbor, in [`Face::ALL`] order.
    pub fn neighbor_faces(&self) -> Vec<Face> {
        Face::ALL
            .into_iter()
            .filter(|f| self.neighbors.iter().any(|n| n.face == *f))
            .collect()
    }
}

/// Load-balance diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoadBalance {
    /// Smallest per-partition active-cell count.
    pub min: u64,
    /// Largest per-partition active-cell count.
    pub max: u64,
    /// Mean active cells per partition.
    pub mean: f64,
    /// `max / mean`, 1.0 when the grid is empty.
    pub imbalance: f64,
    /// Partitions that received no block.
    pub empty_partitions: usize,
    /// Partition pairs whose bounding boxes interpenetrate.
    pub overlapping_pairs: usize,
}

impl LoadBalance {
    /// Whether `imbalance` is at most `1 + tolerance`.
    pub fn within_tolerance(&self, tolerance: f64) -> bool {
        self.imbalance <= 1.0 + tolerance
    }
}

/// Errors raised by [`decompose`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecomposeError {
    /// `N = 0` was requested.
    #[error("partition count must be at least 1")]
    ZeroPartitions,
    /// Two input blocks share an origin.
    #[error("block at {origin:?} appears more than once")]
    DuplicateBlock {
        /// Origin of the repeated block.
        origin: [i32; 3],
    },
    /// A block origin is not a multiple of the block size.
    #[error("block origin {origin:?} is not block-aligned")]
    MisalignedBlock {
        /// Offending origin.
        origin: [i32; 3],
    },
    /// A block claims more active cells than it holds.
    #[error("block at {origin:?} reports {active_cells} active cells (max {max})", max = CELLS_PER_BLOCK)]
    InvalidBlock {
        /// Offending origin.
        origin: [i32; 3],
        /// Reported count.
        active_cells: u32,
    },
}

/// Result of one decomposition. Immutable; replaced wholesale on
/// re-decomposition.
#[derive(Debug, Clone, PartialEq)]
pub struct Decomposition {
    subdomains: Arc<[SubDomain]>,
    balance: LoadBalance,
    owners: HashMap<[i32; 3], usize>,
    unlinked: Vec<(usize, usize)>,
}

impl Decomposition {
    /// Partitions in index order.
    pub fn subdomains(&self) -> &Arc<[SubDomain]> {
        &self.subdomains
    }

    /// Partition `index`.
    pub fn subdomain(&self, index: usize) -> Option<&SubDomain> {
        self.subdomains.get(index)
    }

    /// Number of partitions, empty ones included.
    pub fn partition_count(&self) -> usize {
        self.subdomains.len()
    }

    /// Load-balance diagnostics.
    pub fn balance(&self) -> &LoadBalance {
        &self.balance
    }

    /// Partition pairs `(a, b)`, `a < b`, whose bounding boxes interpenetrate
    /// and which therefore exchange no halo with each other.
    pub fn unlinked_pairs(&self) -> &[(usize, usize)] {
        &self.unlinked
    }

    /// Partition owning the block at `origin`.
    pub fn owner_of_block(&self, origin: [i32; 3]) -> Option<usize> {
        self.owners.get(&block_coord(origin)).copied()
    }

    /// Partition owning the block containing `cell`.
    pub fn owner_of_cell(&self, cell: [i32; 3]) -> Option<usize> {
        self.owners.get(&block_coord(cell)).copied()
    }
}

/// Partition `blocks` into `partitions` sub-domains.
///
/// Blocks are walked in Morton order and partition `k` is closed once the
/// running active-cell count reaches `(k + 1) / N` of the total, or earlier
/// when the blocks left are only enough to give each remaining partition
/// one. The last partition absorbs the rest. For `N <= blocks.len()` every
/// partition is non-empty and no partition exceeds the mean by a full block.
pub fn decompose(blocks: &[Block], partitions: usize) -> Result<Decomposition, DecomposeError> {
    if partitions == 0 {
        return Err(DecomposeError::ZeroPartitions);
    }

    let mut seen = HashSet::with_capacity(blocks.len());
    for b in blocks {
        if !b.is_aligned() {
            return Err(DecomposeError::MisalignedBlock { origin: b.origin });
        }
        if b.active_cells > CELLS_PER_BLOCK {
            return Err(DecomposeError::InvalidBlock {
                origin: b.origin,
                active_cells: b.active_cells,
            });
        }
        if !seen.insert(b.origin) {
            return Err(DecomposeError::DuplicateBlock { origin: b.origin });
        }
    }

    let mut sorted = blocks.to_vec();
    sorted.sort_by_key(morton::block_key);
    let total: u64 = sorted.iter().map(|b| b.active_cells as u64).sum();
    let n = partitions as u64;

    let mut subdomains: Vec<SubDomain> = (0..partitions).map(SubDomain::empty).collect();
    if partitions == 1 {
        assign(&mut subdomains[0], sorted);
    } else {
        let mut current = 0usize;
        let mut cumulative = 0u64;
        let count = sorted.len();
        for (i, block) in sorted.into_iter().enumerate() {
            cumulative += block.active_cells as u64;
            assign_one(&mut subdomains[current], block);
            if current + 1 == partitions {
                continue;
            }
            let reached_target = cumulative * n >= (current as u64 + 1) * total;
            let blocks_left = count - i - 1;
            let partitions_left = partitions - current - 1;
            if reached_target || blocks_left <= partitions_left {
                current += 1;
            }
        }
    }

    let unlinked = link_neighbors(&mut subdomains);
    let overlapping_pairs = unlinked.len();

    let mut owners = HashMap::with_capacity(blocks.len());
    for sd in &subdomains {
        for b in &sd.blocks {
            owners.insert(b.coord(), sd.index);
        }
    }

    let balance = load_balance(&subdomains, total, overlapping_pairs);
    tracing::info!(
        "Decomposed {} blocks ({} active cells) into {} partitions: min={} max={} imbalance={:.3}",
        blocks.len(),
        total,
        partitions,
        balance.min,
        balance.max,
        balance.imbalance
    );
    if balance.empty_partitions > 0 && !blocks.is_empty() {
        tracing::warn!(
            "{} of {} partitions received no blocks",
            balance.empty_partitions,
            partitions
        );
    }
    if overlapping_pairs > 0 {
        tracing::warn!(
            "{} partition pairs have interpenetrating bounds; halo exchange only covers face contacts",
            overlapping_pairs
        );
    }

    Ok(Decomposition {
        subdomains: subdomains.into(),
        balance,
        owners,
        unlinked,
    })
}

fn assign(sd: &mut SubDomain, blocks: Vec<Block>) {
    for b in blocks {
        assign_one(sd, b);
    }
}

fn assign_one(sd: &mut SubDomain, block: Block) {
    let b = block.bounds();
    sd.bounds = Some(match sd.bounds {
        Some(acc) => acc.union(&b),
        None => b,
    });
    sd.active_cells += block.active_cells as u64;
    sd.blocks.push(block);
}

/// Face on which `b` touches `a`, seen from `a`.
///
/// Adjacent means `a.max + 1 == b.min` (or the reverse) on one axis with a
/// non-empty overlap on the other two.
pub fn face_adjacency(a: &IndexBox, b: &IndexBox) -> Option<Face> {
    for axis in 0..3 {
        let overlaps_in_plane = (0..3)
            .filter(|&o| o != axis)
            .all(|o| a.min[o] <= b.max[o] && b.min[o] <= a.max[o]);
        if !overlaps_in_plane {
            continue;
        }
        if a.max[axis] + 1 == b.min[axis] {
            return Some(Face::new(axis, true));
        }
        if b.max[axis] + 1 == a.min[axis] {
            return Some(Face::new(axis, false));
        }
    }
    None
}

/// Record symmetric neighbor links. Returns the interpenetrating pairs,
/// which get no link.
fn link_neighbors(subdomains: &mut [SubDomain]) -> Vec<(usize, usize)> {
    let mut overlapping = Vec::new();
    for i in 0..subdomains.len() {
        for j in (i + 1)..subdomains.len() {
            let (Some(a), Some(b)) = (subdomains[i].bounds, subdomains[j].bounds) else {
                continue;
            };
            if a.overlaps(&b) {
                overlapping.push((i, j));
                continue;
            }
            if let Some(face) = face_adjacency(&a, &b) {
                subdomains[i].neighbors.push(Neighbor { partition: j, face });
                subdomains[j].neighbors.push(Neighbor {
                    partition: i,
                    face: face.opposite(),
                });
            }
        }
    }
    for sd in subdomains.iter_mut() {
        sd.neighbors.sort_by_key(|n| n.partition);
    }
    overlapping
}

fn load_balance(subdomains: &[SubDomain], total: u64, overlapping_pairs: usize) -> LoadBalance {
    let counts = subdomains.iter().map(|s| s.active_cells);
    let min = counts.clone().min().unwrap_or(0);
    let max = counts.max().unwrap_or(0);
    let mean = total as f64 / subdomains.len().max(1) as f64;
    let imbalance = if mean > 0.0 { max as f64 / mean } else { 1.0 };
    LoadBalance {
        min,
        max,
        mean,
        imbalance,
        empty_partitions: subdomains.iter().filter(|s| s.is_empty()).count(),
        overlapping_pairs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dense(coords: &[[i32; 3]]) -> Vec<Block> {
        coords
            .iter()
            .map(|c| Block::new([c[0] * 8, c[1] * 8, c[2] * 8], CELLS_PER_BLOCK))
            .collect()
    }

    fn line(n: i32) -> Vec<Block> {
        dense(&(0..n).map(|x| [x, 0, 0]).collect::<Vec<_>>())
    }

    #[test]
    fn test_line_of_eight_splits_in_half() {
        let d = decompose(&line(8), 2).unwrap();
        let [a, b] = &d.subdomains()[..] else { panic!("expected two partitions") };
        assert_eq!(a.blocks.len(), 4);
        assert_eq!(b.blocks.len(), 4);
        assert_eq!(a.bounds, Some(IndexBox::new([0, 0, 0], [31, 7, 7])));
        assert_eq!(b.bounds, Some(IndexBox::new([32, 0, 0], [63, 7, 7])));
        assert_eq!(a.neighbors, vec![Neighbor { partition: 1, face: Face::PosX }]);
        assert_eq!(b.neighbors, vec![Neighbor { partition: 0, face: Face::NegX }]);
        assert_eq!(d.balance().imbalance, 1.0);
    }

    #[test]
    fn test_single_partition_takes_everything() {
        let blocks = line(5);
        let d = decompose(&blocks, 1).unwrap();
        assert_eq!(d.partition_count(), 1);
        assert_eq!(d.subdomains()[0].blocks.len(), 5);
        assert!(d.subdomains()[0].neighbors.is_empty());
        assert_eq!(d.owner_of_cell([39, 3, 3]), Some(0));
    }

    #[test]
    fn test_zero_partitions_rejected() {
        assert_eq!(decompose(&line(2), 0), Err(DecomposeError::ZeroPartitions));
    }

    #[test]
    fn test_input_validation() {
        let mut blocks = line(2);
        blocks.push(blocks[0]);
        assert_eq!(
            decompose(&blocks, 2),
            Err(DecomposeError::DuplicateBlock { origin: [0, 0, 0] })
        );
        assert_eq!(
            decompose(&[Block::new([3, 0, 0], 1)], 1),
            Err(DecomposeError::MisalignedBlock { origin: [3, 0, 0] })
        );
        assert!(matches!(
            decompose(&[Block::new([0, 0, 0], 513)], 1),
            Err(DecomposeError::InvalidBlock { active_cells: 513, .. })
        ));
    }

    #[test]
    fn test_empty_grid_yields_empty_partitions() {
        let d = decompose(&[], 3).unwrap();
        assert_eq!(d.partition_count(), 3);
        assert!(d.subdomains().iter().all(|s| s.is_empty() && s.neighbors.is_empty()));
        assert_eq!(d.balance().empty_partitions, 3);
        assert_eq!(d.balance().imbalance, 1.0);
    }

    #[test]
    fn test_more_partitions_than_blocks() {
        let d = decompose(&line(2), 5).unwrap();
        assert_eq!(d.subdomains()[0].blocks.len(), 1);
        assert_eq!(d.subdomains()[1].blocks.len(), 1);
        assert_eq!(d.balance().empty_partitions, 3);
        assert_eq!(d.balance().min, 0);
    }

    #[test]
    fn test_skewed_occupancy_still_fills_every_partition() {
        // One heavy block followed by three nearly empty ones.
        let blocks = vec![
            Block::new([0, 0, 0], 512),
            Block::new([8, 0, 0], 1),
            Block::new([16, 0, 0], 1),
            Block::new([24, 0, 0], 1),
        ];
        let d = decompose(&blocks, 4).unwrap();
        assert!(d.subdomains().iter().all(|s| s.blocks.len() == 1));
        assert_eq!(d.balance().empty_partitions, 0);
    }

    #[test]
    fn test_cube_octants_are_boxes() {
        let coords: Vec<[i32; 3]> = (0..64).map(|i| [i % 4, (i / 4) % 4, i / 16]).collect();
        let d = decompose(&dense(&coords), 8).unwrap();
        for sd in d.subdomains().iter() {
            let bounds = sd.bounds.unwrap();
            assert_eq!(bounds.extent(), [16, 16, 16]);
            assert_eq!(sd.neighbors.len(), 3);
        }
        assert_eq!(d.balance().overlapping_pairs, 0);
        assert!(d.unlinked_pairs().is_empty());
    }

    #[test]
    fn test_interpenetrating_partitions_are_reported_unlinked() {
        // Morton order puts (1,0,0) and (0,1,0) first; the corner block that
        // follows sits inside their bounding box.
        let d = decompose(&dense(&[[1, 1, 0], [0, 1, 0], [1, 0, 0]]), 2).unwrap();
        let [a, b] = &d.subdomains()[..] else { panic!("expected two partitions") };
        assert_eq!(a.bounds, Some(IndexBox::new([0, 0, 0], [15, 15, 7])));
        assert_eq!(b.bounds, Some(IndexBox::new([8, 8, 0], [15, 15, 7])));
        assert_eq!(d.unlinked_pairs(), &[(0, 1)]);
        assert_eq!(d.balance().overlapping_pairs, 1);
        assert!(a.neighbors.is_empty() && b.neighbors.is_empty());
        assert_eq!(d.owner_of_cell([12, 12, 3]), Some(1));
    }

    #[test]
    fn test_face_adjacency() {
        let a = IndexBox::new([0, 0, 0], [7, 7, 7]);
        assert_eq!(face_adjacency(&a, &IndexBox::new([8, 0, 0], [15, 7, 7])), Some(Face::PosX));
        assert_eq!(face_adjacency(&a, &IndexBox::new([0, -8, 0], [7, -1, 7])), Some(Face::NegY));
        // Edge contact only.
        assert_eq!(face_adjacency(&a, &IndexBox::new([8, 8, 0], [15, 15, 7])), None);
        // Gap of one cell.
        assert_eq!(face_adjacency(&a, &IndexBox::new([9, 0, 0], [15, 7, 7])), None);
    }

    #[test]
    fn test_face_helpers() {
        for f in Face::ALL {
            assert_eq!(f.opposite().opposite(), f);
            assert_ne!(f.opposite(), f);
            let (u, v) = f.in_plane_axes();
            assert!(u < v && u != f.axis() && v != f.axis());
        }
        assert_eq!(Face::NegZ.to_string(), "-Z");
    }
}
