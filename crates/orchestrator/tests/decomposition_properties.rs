//! Decomposition properties over random block sets
//!
//! Each case draws a random sparse set of blocks with random occupancy and
//! checks the partitioning against its guarantees:
//! - every block is owned by exactly one partition
//! - partitions follow Morton order and stay within one block of the mean
//! - neighbor links are symmetric and match face adjacency
//! - the result does not depend on input order

use std::collections::HashSet;

use grid_kernel::{Block, BLOCK_SIZE, CELLS_PER_BLOCK};
use orchestrator::domain::{decompose, face_adjacency, Decomposition};
use orchestrator::morton;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const CASES: u64 = 40;

fn random_blocks(rng: &mut StdRng) -> Vec<Block> {
    let extent = rng.gen_range(2..6);
    let count = rng.gen_range(1..(extent * extent * extent) as usize);
    let mut seen = HashSet::new();
    let mut blocks = Vec::with_capacity(count);
    while blocks.len() < count {
        let coord: [i32; 3] = std::array::from_fn(|_| rng.gen_range(-extent / 2..extent));
        if seen.insert(coord) {
            let active = rng.gen_range(1..=CELLS_PER_BLOCK);
            blocks.push(Block::new(coord.map(|c| c * BLOCK_SIZE), active));
        }
    }
    blocks
}

fn check_coverage(blocks: &[Block], d: &Decomposition) {
    let assigned: usize = d.subdomains().iter().map(|s| s.blocks.len()).sum();
    assert_eq!(assigned, blocks.len());

    for b in blocks {
        let owner = d.owner_of_block(b.origin).expect("block has an owner");
        let holders = d
            .subdomains()
            .iter()
            .filter(|s| s.blocks.iter().any(|x| x.origin == b.origin))
            .count();
        assert_eq!(holders, 1, "block {:?}", b.origin);
        assert!(d.subdomains()[owner].blocks.contains(b));
    }

    let total: u64 = blocks.iter().map(|b| b.active_cells as u64).sum();
    let sum: u64 = d.subdomains().iter().map(|s| s.active_cells).sum();
    assert_eq!(sum, total);
}

fn check_order_and_balance(blocks: &[Block], d: &Decomposition) {
    let keys: Vec<u64> = d
        .subdomains()
        .iter()
        .flat_map(|s| s.blocks.iter().map(morton::block_key))
        .collect();
    assert!(keys.windows(2).all(|w| w[0] < w[1]), "Morton order broken");

    let n = d.partition_count();
    if n <= blocks.len() {
        assert_eq!(d.balance().empty_partitions, 0);
        let heaviest = blocks.iter().map(|b| b.active_cells).max().unwrap_or(0) as f64;
        let balance = d.balance();
        assert!(
            balance.max as f64 - balance.mean <= heaviest,
            "max {} mean {} heaviest block {}",
            balance.max,
            balance.mean,
            heaviest
        );
    } else {
        assert_eq!(d.balance().empty_partitions, n - blocks.len());
    }

    for s in d.subdomains().iter() {
        assert_eq!(s.is_empty(), s.bounds.is_none());
    }
}

fn check_neighbors(d: &Decomposition) {
    let subs = d.subdomains();
    for a in subs.iter() {
        for link in &a.neighbors {
            let b = &subs[link.partition];
            assert!(
                b.neighbors
                    .iter()
                    .any(|n| n.partition == a.index && n.face == link.face.opposite()),
                "link {} -> {} on {} not mirrored",
                a.index,
                b.index,
                link.face
            );
        }
        for b in subs.iter().filter(|b| b.index != a.index) {
            let (Some(ab), Some(bb)) = (a.bounds, b.bounds) else {
                assert!(a.neighbors.iter().all(|n| n.partition != b.index));
                continue;
            };
            let expected = face_adjacency(&ab, &bb);
            let linked = a
                .neighbors
                .iter()
                .find(|n| n.partition == b.index)
                .map(|n| n.face);
            assert_eq!(linked, expected, "partitions {} and {}", a.index, b.index);
        }
    }
}

#[test]
fn test_random_decompositions() {
    for seed in 0..CASES {
        let mut rng = StdRng::seed_from_u64(seed);
        let blocks = random_blocks(&mut rng);
        for partitions in [1, 2, 3, 5, 8, blocks.len(), blocks.len() + 3] {
            let d = decompose(&blocks, partitions).unwrap();
            assert_eq!(d.partition_count(), partitions);
            check_coverage(&blocks, &d);
            check_order_and_balance(&blocks, &d);
            check_neighbors(&d);
        }
    }
}

#[test]
fn test_input_order_does_not_matter() {
    for seed in 0..CASES {
        let mut rng = StdRng::seed_from_u64(1000 + seed);
        let blocks = random_blocks(&mut rng);
        let partitions = rng.gen_range(1..=blocks.len());
        let reference = decompose(&blocks, partitions).unwrap();

        let mut shuffled = blocks.clone();
        shuffled.shuffle(&mut rng);
        assert_eq!(decompose(&shuffled, partitions).unwrap(), reference);
        assert_eq!(decompose(&blocks, partitions).unwrap(), reference);
    }
}

#[test]
fn test_uniform_blocks_split_evenly() {
    // 4 x 4 x 4 full blocks: every power-of-two split is an exact Morton
    // octree cut with identical partition sizes.
    let blocks: Vec<Block> = (0..4)
        .flat_map(|z| (0..4).flat_map(move |y| (0..4).map(move |x| [x, y, z])))
        .map(|c: [i32; 3]| Block::new(c.map(|v| v * BLOCK_SIZE), CELLS_PER_BLOCK))
        .collect();
    for partitions in [2, 4, 8, 16, 64] {
        let d = decompose(&blocks, partitions).unwrap();
        assert_eq!(d.balance().min, d.balance().max, "{partitions} partitions");
        assert_eq!(d.balance().imbalance, 1.0);
        for s in d.subdomains().iter() {
            let bounds = s.bounds.expect("non-empty");
            let cells: i64 = (0..3)
                .map(|i| (bounds.max[i] - bounds.min[i] + 1) as i64)
                .product();
            assert_eq!(cells as u64, s.active_cells, "partition {} is a box", s.index);
        }
    }
}
