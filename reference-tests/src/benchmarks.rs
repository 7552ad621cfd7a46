//! Long-running decomposition and halo throughput benchmarks.
//!
//! They are marked with `#[ignore]` so they only run when explicitly
//! requested via:
//!
//! ```sh
//! cargo test --release -p reference-tests -- --ignored
//! ```

use std::sync::Arc;
use std::time::Instant;

use grid_kernel::{Block, BuiltinKernel, FieldDesc, HostBackend, Occupancy, BLOCK_SIZE};
use orchestrator::domain::decompose;
use orchestrator::geometry::{rasterize, Shape};
use orchestrator::{HaloConfig, Simulation, SimulationOptions};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_target(false)
        .try_init();
}

// ---------------------------------------------------------------------------
// Decomposition scaling
// ---------------------------------------------------------------------------

/// Decompose spheres of growing radius into up to 256 partitions. Every
/// split must stay within one block of the mean.
#[test]
#[ignore]
fn benchmark_decomposition_scaling() {
    init_logging();
    println!(
        "\n{:>8} {:>10} {:>6} {:>12} {:>10} {:>8}",
        "Blocks", "Cells", "N", "ms", "imbalance", "links"
    );
    for radius in [32.0, 64.0, 96.0] {
        let grid = rasterize(&[Shape::Sphere {
            center: [0.0; 3],
            radius,
        }]);
        for partitions in [2, 8, 32, 128, 256] {
            let start = Instant::now();
            let d = decompose(grid.blocks(), partitions).expect("decompose");
            let elapsed = start.elapsed().as_secs_f64();

            let heaviest = grid.blocks().iter().map(|b| b.active_cells).max().unwrap_or(0);
            assert!(d.balance().max as f64 - d.balance().mean <= heaviest as f64);
            assert_eq!(d.balance().empty_partitions, 0);

            let links: usize = d.subdomains().iter().map(|s| s.neighbors.len()).sum();
            println!(
                "{:>8} {:>10} {:>6} {:>12.3} {:>10.3} {:>8}",
                grid.block_count(),
                grid.active_cell_count(),
                partitions,
                elapsed * 1e3,
                d.balance().imbalance,
                links / 2
            );
        }
    }
}

/// Random sparse block sets at several fill densities.
#[test]
#[ignore]
fn benchmark_random_occupancy() {
    init_logging();
    let mut rng = StdRng::seed_from_u64(42);
    println!(
        "\n{:>8} {:>8} {:>6} {:>12} {:>10}",
        "Density", "Blocks", "N", "ms", "imbalance"
    );
    for density in [0.05, 0.25, 0.75] {
        let extent = 32;
        let mut blocks = Vec::new();
        for z in 0..extent {
            for y in 0..extent {
                for x in 0..extent {
                    if rng.gen_bool(density) {
                        let active = rng.gen_range(1..=512);
                        blocks.push(Block::new([x, y, z].map(|c| c * BLOCK_SIZE), active));
                    }
                }
            }
        }
        for partitions in [16, 64] {
            let start = Instant::now();
            let d = decompose(&blocks, partitions).expect("decompose");
            let elapsed = start.elapsed().as_secs_f64();
            assert!(d.balance().max as f64 - d.balance().mean <= 512.0);
            println!(
                "{:>8.2} {:>8} {:>6} {:>12.3} {:>10.3}",
                density,
                blocks.len(),
                partitions,
                elapsed * 1e3,
                d.balance().imbalance
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Halo throughput
// ---------------------------------------------------------------------------

fn box_simulation(partitions: usize, backend: HostBackend, thickness: u32) -> Simulation {
    let grid = rasterize(&[Shape::Box {
        min: [0.0; 3],
        max: [64.0; 3],
    }]);
    let options = SimulationOptions {
        partitions,
        halo: HaloConfig {
            thickness,
            ..HaloConfig::default()
        },
        ..SimulationOptions::default()
    };
    let mut sim = Simulation::new(grid, Arc::new(backend), options).expect("simulation");
    sim.add_field(FieldDesc::new("u", 1).with_halo()).expect("field");
    sim.add_task("diffuse", ["u"], ["u"], BuiltinKernel::Laplacian { coefficient: 0.1 })
        .expect("task");
    sim.set_field_with("u", |c| ((c[0] ^ c[1] ^ c[2]) & 7) as f32)
        .expect("initial values");
    sim
}

/// Halo bytes per second for direct and staged transfers at several halo
/// thicknesses. Both paths must produce the same field.
#[test]
#[ignore]
fn benchmark_halo_throughput() {
    init_logging();
    let partitions = 8;
    let steps = 20;
    println!(
        "\n{:>10} {:>8} {:>12} {:>12} {:>12}",
        "Path", "Layers", "ms/step", "MiB/step", "MiB/s"
    );
    for thickness in [1, 2, 4] {
        let mut fields = Vec::new();
        for (label, backend) in [
            ("direct", HostBackend::new(partitions)),
            ("staged", HostBackend::isolated(partitions)),
        ] {
            let mut sim = box_simulation(partitions, backend, thickness);
            let start = Instant::now();
            sim.run(steps, 0.1).expect("run");
            let elapsed = start.elapsed().as_secs_f64();

            let stats = sim.executor().halo().stats();
            let bytes = (stats.direct_bytes + stats.staged_bytes) as f64;
            let mib_per_step = bytes / steps as f64 / (1024.0 * 1024.0);
            println!(
                "{:>10} {:>8} {:>12.3} {:>12.3} {:>12.1}",
                label,
                thickness,
                elapsed / steps as f64 * 1e3,
                mib_per_step,
                bytes / elapsed / (1024.0 * 1024.0)
            );
            fields.push(sim.field("u").expect("field"));
        }
        assert_eq!(fields[0], fields[1], "thickness {thickness}");
    }
}
