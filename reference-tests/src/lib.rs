//! Reference test framework for partitioned grid execution
//!
//! This crate runs named scenarios from configuration files and validates
//! the decomposition and the partitioned results against expectations:
//! block coverage, the load-balance bound, parity with a single-partition
//! run, parity between direct and staged halo transfers, and conservation
//! of a diffused quantity.

#[cfg(test)]
mod benchmarks;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use grid_kernel::{Occupancy, CELLS_PER_BLOCK};
use orchestrator::config::{BackendType, SimulationConfig};
use orchestrator::distributed::max_abs_difference;
use orchestrator::{build_simulation, Simulation};

/// Expected result criteria for a reference test
#[derive(Debug, Clone, Default)]
pub struct ExpectedResult {
    /// Every active block owned by exactly one partition
    pub coverage: Option<CoverageCheck>,
    /// Load-balance bound
    pub balance: Option<BalanceCheck>,
    /// Agreement with a single-partition run
    pub parity: Option<ParityCheck>,
    /// Agreement between direct and staged halo transfers
    pub staged_parity: Option<StagedParityCheck>,
    /// Sum of a field preserved across the run
    pub conservation: Option<ConservationCheck>,
}

/// Check that the decomposition covers the occupancy
#[derive(Debug, Clone)]
pub struct CoverageCheck {
    /// Fail if any partition received no blocks
    pub require_nonempty: bool,
}

/// Check the partition sizes
#[derive(Debug, Clone)]
pub struct BalanceCheck {
    /// Maximum allowed `max / mean`
    pub max_imbalance: f64,
}

/// Compare fields against a single-partition reference run
#[derive(Debug, Clone)]
pub struct ParityCheck {
    /// Fields to compare
    pub fields: Vec<String>,
    /// Largest allowed absolute difference per cell
    pub max_abs_error: f32,
}

/// Compare fields against a run where no two devices are peers
#[derive(Debug, Clone)]
pub struct StagedParityCheck {
    /// Fields to compare bit for bit
    pub fields: Vec<String>,
}

/// Check that the sum of a field stays within a relative tolerance
#[derive(Debug, Clone)]
pub struct ConservationCheck {
    /// Field to sum
    pub field: String,
    /// Maximum allowed relative change (0.0 to 1.0)
    pub max_relative_change: f32,
}

/// Run metrics reported with every result
#[derive(Debug, Clone, Default)]
pub struct RunMetrics {
    /// Partition count
    pub partitions: usize,
    /// Active cells
    pub active_cells: usize,
    /// `max / mean` active cells per partition
    pub imbalance: f64,
    /// Halo bytes moved over direct and staged paths
    pub halo_bytes: u64,
    /// Wall time spent stepping the partitioned run
    pub wall_time: Duration,
}

/// Result of running a reference test
#[derive(Debug)]
pub struct TestResult {
    /// Test name
    pub name: String,
    /// Whether test passed
    pub passed: bool,
    /// Individual check results
    pub checks: Vec<CheckResult>,
    /// Run metrics
    pub metrics: RunMetrics,
    /// Number of timesteps executed
    pub timesteps: u64,
    /// Simulated time
    pub sim_time: f64,
}

/// Result of an individual validation check
#[derive(Debug)]
pub struct CheckResult {
    /// Check name
    pub name: String,
    /// Whether check passed
    pub passed: bool,
    /// Detail or failure message
    pub message: Option<String>,
}

impl CheckResult {
    fn pass(name: &str, message: String) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            message: Some(message),
        }
    }

    fn fail(name: &str, message: String) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            message: Some(message),
        }
    }
}

/// A reference test case
pub struct ReferenceTest {
    /// Test name
    pub name: String,
    /// Path to configuration file
    pub config_path: PathBuf,
    /// Number of timesteps to run
    pub timesteps: u64,
    /// Expected results to validate
    pub expected: ExpectedResult,
}

impl ReferenceTest {
    /// Run the reference test and return results
    pub fn run(&self) -> orchestrator::Result<TestResult> {
        tracing::info!("Running reference test: {}", self.name);

        let config = SimulationConfig::load(&self.config_path)?;
        let mut sim = build_simulation(&config)?;
        let initial = field_sums(&sim, &self.expected)?;

        tracing::info!(
            "Initialized: {} active cells, {} partitions, {} tasks",
            sim.grid().active_cell_count(),
            sim.partition_count(),
            sim.graph().len()
        );

        let start = Instant::now();
        advance(&mut sim, self.timesteps, config.dt)?;
        let wall_time = start.elapsed();
        tracing::info!(
            "Simulation complete: {} steps, {:.3} simulated, {:.2}s wall",
            sim.steps(),
            sim.sim_time(),
            wall_time.as_secs_f64()
        );

        let mut checks = Vec::new();

        if let Some(ref coverage) = self.expected.coverage {
            checks.push(validate_coverage(&sim, coverage));
        }

        if let Some(ref balance) = self.expected.balance {
            checks.push(validate_balance(&sim, balance));
        }

        if let Some(ref parity) = self.expected.parity {
            let mut single = config.clone();
            single.partitions = 1;
            single.devices.count = 1;
            single.devices.peer_groups = None;
            let reference = rerun(&single, self.timesteps)?;
            checks.push(validate_parity(&sim, &reference, parity)?);
        }

        if let Some(ref staged) = self.expected.staged_parity {
            let mut isolated = config.clone();
            isolated.devices.backend = BackendType::Host;
            isolated.devices.count = config.partitions;
            isolated.devices.peer_groups = Some((0..config.partitions as u32).collect());
            let reference = rerun(&isolated, self.timesteps)?;
            checks.push(validate_staged(&sim, &reference, staged)?);
        }

        if let Some(ref conservation) = self.expected.conservation {
            checks.push(validate_conservation(&sim, &initial, conservation)?);
        }

        let stats = sim.executor().halo().stats();
        let metrics = RunMetrics {
            partitions: sim.partition_count(),
            active_cells: sim.grid().active_cell_count(),
            imbalance: sim.balance().imbalance,
            halo_bytes: stats.direct_bytes + stats.staged_bytes,
            wall_time,
        };

        Ok(TestResult {
            name: self.name.clone(),
            passed: checks.iter().all(|c| c.passed),
            checks,
            metrics,
            timesteps: sim.steps(),
            sim_time: sim.sim_time(),
        })
    }
}

/// Step `sim` by `dt`, logging progress every 10% of the steps.
fn advance(sim: &mut Simulation, timesteps: u64, dt: f32) -> orchestrator::Result<()> {
    for step in 0..timesteps {
        sim.step(dt)?;
        if (step + 1) % (timesteps / 10).max(1) == 0 {
            let progress = ((step + 1) as f32 / timesteps as f32) * 100.0;
            tracing::info!("Progress: {:.0}% ({}/{})", progress, step + 1, timesteps);
        }
    }
    Ok(())
}

fn rerun(config: &SimulationConfig, timesteps: u64) -> orchestrator::Result<Simulation> {
    let mut sim = build_simulation(config)?;
    sim.run(timesteps, config.dt)?;
    Ok(sim)
}

fn field_sums(sim: &Simulation, expected: &ExpectedResult) -> orchestrator::Result<HashMap<String, f64>> {
    let mut sums = HashMap::new();
    if let Some(ref c) = expected.conservation {
        sums.insert(c.field.clone(), sum(&sim.field(&c.field)?));
    }
    Ok(sums)
}

fn sum(values: &[f32]) -> f64 {
    values.iter().map(|&v| v as f64).sum()
}

/// Validate that every active block has exactly one owner
fn validate_coverage(sim: &Simulation, check: &CoverageCheck) -> CheckResult {
    let decomposition = sim.decomposition();
    let mut seen = HashSet::new();
    let mut duplicates = 0;
    for sd in decomposition.subdomains().iter() {
        for b in &sd.blocks {
            if !seen.insert(b.origin) {
                duplicates += 1;
            }
        }
    }
    let missing = sim
        .grid()
        .blocks()
        .iter()
        .filter(|b| !seen.contains(&b.origin))
        .count();
    let empty = decomposition.balance().empty_partitions;

    let mut issues = Vec::new();
    if duplicates > 0 {
        issues.push(format!("{} blocks assigned twice", duplicates));
    }
    if missing > 0 {
        issues.push(format!("{} blocks unassigned", missing));
    }
    if check.require_nonempty && empty > 0 {
        issues.push(format!("{} empty partitions", empty));
    }

    if issues.is_empty() {
        CheckResult::pass(
            "Coverage",
            format!(
                "{} blocks over {} partitions",
                seen.len(),
                decomposition.partition_count()
            ),
        )
    } else {
        CheckResult::fail("Coverage", issues.join(", "))
    }
}

/// Validate partition sizes: within one block of the mean, and below the
/// configured imbalance
fn validate_balance(sim: &Simulation, check: &BalanceCheck) -> CheckResult {
    let balance = sim.balance();
    let excess = balance.max as f64 - balance.mean;
    let within_block = excess <= CELLS_PER_BLOCK as f64;
    let within_limit = balance.imbalance <= check.max_imbalance;

    let detail = format!(
        "min {} max {} mean {:.1}, imbalance {:.3} (limit {:.3})",
        balance.min, balance.max, balance.mean, balance.imbalance, check.max_imbalance
    );
    if within_block && within_limit {
        CheckResult::pass("Load Balance", detail)
    } else if !within_block {
        CheckResult::fail(
            "Load Balance",
            format!("{detail}; largest partition exceeds mean by {excess:.0} cells"),
        )
    } else {
        CheckResult::fail("Load Balance", detail)
    }
}

/// Validate against a single-partition run
fn validate_parity(
    sim: &Simulation,
    reference: &Simulation,
    check: &ParityCheck,
) -> orchestrator::Result<CheckResult> {
    let mut worst = 0.0f32;
    let mut issues = Vec::new();
    for name in &check.fields {
        match max_abs_difference(&sim.field(name)?, &reference.field(name)?) {
            Some(diff) => {
                worst = worst.max(diff);
                if diff > check.max_abs_error {
                    issues.push(format!("{name}: {diff:.3e}"));
                }
            }
            None => issues.push(format!("{name}: length mismatch")),
        }
    }
    Ok(if issues.is_empty() {
        CheckResult::pass(
            "Single-Partition Parity",
            format!("max |diff| {:.3e} over {} fields", worst, check.fields.len()),
        )
    } else {
        CheckResult::fail(
            "Single-Partition Parity",
            format!("{} (limit {:.3e})", issues.join(", "), check.max_abs_error),
        )
    })
}

/// Validate bit-exact agreement with a staged-transfer run
fn validate_staged(
    sim: &Simulation,
    reference: &Simulation,
    check: &StagedParityCheck,
) -> orchestrator::Result<CheckResult> {
    let mut mismatched = Vec::new();
    for name in &check.fields {
        let a = sim.field(name)?;
        let b = reference.field(name)?;
        let differing = a
            .iter()
            .zip(&b)
            .filter(|(x, y)| x.to_bits() != y.to_bits())
            .count();
        if a.len() != b.len() || differing > 0 {
            mismatched.push(format!("{name}: {differing} cells differ"));
        }
    }
    let staged = reference.executor().halo().stats();
    Ok(if mismatched.is_empty() {
        CheckResult::pass(
            "Staged Transfer Parity",
            format!(
                "{} staged transfers ({} bytes) reproduce direct results",
                staged.staged_transfers, staged.staged_bytes
            ),
        )
    } else {
        CheckResult::fail("Staged Transfer Parity", mismatched.join(", "))
    })
}

/// Validate the relative change of a field's sum
fn validate_conservation(
    sim: &Simulation,
    initial: &HashMap<String, f64>,
    check: &ConservationCheck,
) -> orchestrator::Result<CheckResult> {
    let before = initial.get(&check.field).copied().unwrap_or(0.0);
    let after = sum(&sim.field(&check.field)?);
    let change = if before.abs() > f64::EPSILON {
        ((after - before) / before).abs()
    } else {
        after.abs()
    };
    let detail = format!(
        "{}: {:.6} -> {:.6} ({:.3}%)",
        check.field,
        before,
        after,
        change * 100.0
    );
    Ok(if change <= check.max_relative_change as f64 {
        CheckResult::pass("Conservation", detail)
    } else {
        CheckResult::fail(
            "Conservation",
            format!("{detail} (limit {:.3}%)", check.max_relative_change * 100.0),
        )
    })
}

/// Resolve a path relative to the workspace root.
pub fn workspace_path(relative: impl AsRef<Path>) -> PathBuf {
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    manifest_dir
        .parent()
        .unwrap_or(manifest_dir)
        .join(relative)
}

impl TestResult {
    /// Print a summary of the test result
    pub fn print_summary(&self) {
        println!("\n{}", "=".repeat(80));
        println!("Test: {}", self.name);
        println!("{}", "=".repeat(80));
        println!("Status: {}", if self.passed { "PASSED" } else { "FAILED" });
        println!("Timesteps: {}", self.timesteps);
        println!("Simulated time: {:.3}", self.sim_time);
        println!("\nRun Metrics:");
        println!("  Partitions: {}", self.metrics.partitions);
        println!("  Active cells: {}", self.metrics.active_cells);
        println!("  Imbalance: {:.3}", self.metrics.imbalance);
        println!("  Halo traffic: {:.1} KiB", self.metrics.halo_bytes as f64 / 1024.0);
        println!("  Wall time: {:.2} s", self.metrics.wall_time.as_secs_f64());
        println!("\nValidation Checks:");
        for check in &self.checks {
            let status = if check.passed { "PASS" } else { "FAIL" };
            print!("  [{}] {}", status, check.name);
            if let Some(ref msg) = check.message {
                print!(" - {}", msg);
            }
            println!();
        }
        println!("{}", "=".repeat(80));
    }
}

/// Diffusion in a box split four ways
pub fn diffusion_box_test() -> ReferenceTest {
    ReferenceTest {
        name: "Diffusion Box".to_string(),
        config_path: workspace_path("configs/diffusion.json"),
        timesteps: 40,
        expected: ExpectedResult {
            coverage: Some(CoverageCheck {
                require_nonempty: true,
            }),
            balance: Some(BalanceCheck { max_imbalance: 1.0 }),
            parity: Some(ParityCheck {
                fields: vec!["u".into(), "v".into()],
                max_abs_error: 0.0,
            }),
            staged_parity: Some(StagedParityCheck {
                fields: vec!["u".into()],
            }),
            // The hot spot sits on the corner shared by all four partitions,
            // far from the open boundary.
            conservation: Some(ConservationCheck {
                field: "u".into(),
                max_relative_change: 0.01,
            }),
        },
    }
}

/// Two spheres joined by a bar, six partitions on three devices with
/// partial peer access
pub fn two_spheres_test() -> ReferenceTest {
    ReferenceTest {
        name: "Two Spheres".to_string(),
        config_path: workspace_path("configs/two-spheres.json"),
        timesteps: 30,
        expected: ExpectedResult {
            coverage: Some(CoverageCheck {
                require_nonempty: true,
            }),
            balance: Some(BalanceCheck { max_imbalance: 1.5 }),
            // Morton partitions of a sphere are not boxes, so there is no
            // single-partition parity to check here.
            parity: None,
            staged_parity: Some(StagedParityCheck {
                fields: vec!["u".into(), "c".into(), "s".into()],
            }),
            conservation: None,
        },
    }
}

/// Thin slab with deep halos and a barrier before every dispatch
pub fn thin_slab_test() -> ReferenceTest {
    ReferenceTest {
        name: "Thin Slab".to_string(),
        config_path: workspace_path("configs/slab.json"),
        timesteps: 25,
        expected: ExpectedResult {
            coverage: Some(CoverageCheck {
                require_nonempty: true,
            }),
            balance: Some(BalanceCheck { max_imbalance: 1.0 }),
            parity: Some(ParityCheck {
                fields: vec!["u".into(), "flux".into()],
                max_abs_error: 0.0,
            }),
            staged_parity: None,
            conservation: None,
        },
    }
}

/// Every reference test
pub fn all_tests() -> Vec<ReferenceTest> {
    vec![diffusion_box_test(), two_spheres_test(), thin_slab_test()]
}
