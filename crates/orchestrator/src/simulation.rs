//! Simulation facade
//!
//! Owns the occupancy, the current decomposition, the task graph and the
//! executor, and keeps them consistent: the schedule is rebuilt whenever the
//! task set changes, and re-decomposition carries every field across.

use std::sync::Arc;

use grid_kernel::{
    DeviceBackend, FieldDesc, KernelHandle, LocalField, Occupancy, SparseGrid,
};

use crate::domain::{decompose, Decomposition, LoadBalance};
use crate::error::Result;
use crate::executor::{BarrierPolicy, ExecutorConfig, GraphExecutor, StepReport};
use crate::graph::{DependencyGraph, GraphError, Schedule, TaskNode};
use crate::halo::{round_robin_devices, HaloConfig};

/// Imbalance above `1 + tolerance` is logged as a warning.
pub const DEFAULT_IMBALANCE_TOLERANCE: f64 = 0.1;

/// Construction settings for a [`Simulation`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulationOptions {
    /// Number of partitions.
    pub partitions: usize,
    /// Halo settings.
    pub halo: HaloConfig,
    /// Barrier insertion policy.
    pub barrier_policy: BarrierPolicy,
    /// Informational imbalance tolerance.
    pub imbalance_tolerance: f64,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            partitions: 1,
            halo: HaloConfig::default(),
            barrier_policy: BarrierPolicy::default(),
            imbalance_tolerance: DEFAULT_IMBALANCE_TOLERANCE,
        }
    }
}

/// A partitioned grid with fields and a task graph, advanced step by step.
pub struct Simulation {
    grid: Arc<SparseGrid>,
    backend: Arc<dyn DeviceBackend>,
    options: SimulationOptions,
    decomposition: Arc<Decomposition>,
    graph: DependencyGraph,
    executor: GraphExecutor,
    schedule: Option<Schedule>,
    steps: u64,
    sim_time: f64,
}

fn build_executor(
    grid: &Arc<SparseGrid>,
    backend: &Arc<dyn DeviceBackend>,
    options: &SimulationOptions,
) -> Result<(Arc<Decomposition>, GraphExecutor)> {
    let decomposition = Arc::new(decompose(grid.blocks(), options.partitions)?);
    let balance = decomposition.balance();
    if !balance.within_tolerance(options.imbalance_tolerance) {
        tracing::warn!(
            "Load imbalance {:.3} exceeds tolerance {:.3} ({} partitions)",
            balance.imbalance,
            options.imbalance_tolerance,
            options.partitions
        );
    }
    let devices = round_robin_devices(options.partitions, backend.device_count());
    let occupancy: Arc<dyn Occupancy + Send + Sync> = grid.clone();
    let executor = GraphExecutor::new(
        occupancy,
        Arc::clone(&decomposition),
        Arc::clone(backend),
        devices,
        ExecutorConfig {
            barrier_policy: options.barrier_policy,
            halo: options.halo,
        },
    )?;
    Ok((decomposition, executor))
}

/// Return the cached schedule, rebuilding it if the graph changed since.
fn current_schedule<'a>(
    graph: &mut DependencyGraph,
    cached: &'a mut Option<Schedule>,
) -> std::result::Result<&'a Schedule, GraphError> {
    let schedule = match cached.take() {
        Some(s) if graph.ensure_current(&s).is_ok() => s,
        _ => {
            let fresh = graph.build_schedule()?;
            tracing::debug!(
                "Rebuilt schedule at generation {}: {:?}",
                fresh.generation(),
                fresh.names()
            );
            fresh
        }
    };
    Ok(cached.insert(schedule))
}

impl Simulation {
    /// Decompose `grid` and set up an executor with no fields or tasks.
    /// Partitions are placed on the backend's devices round-robin.
    pub fn new(
        grid: SparseGrid,
        backend: Arc<dyn DeviceBackend>,
        options: SimulationOptions,
    ) -> Result<Self> {
        let grid = Arc::new(grid);
        let (decomposition, executor) = build_executor(&grid, &backend, &options)?;
        tracing::info!(
            "Simulation ready: {} blocks, {} active cells, {} partitions on '{}'",
            grid.block_count(),
            grid.active_cell_count(),
            options.partitions,
            backend.name()
        );
        Ok(Self {
            grid,
            backend,
            options,
            decomposition,
            graph: DependencyGraph::with_fields(Vec::<String>::new()),
            executor,
            schedule: None,
            steps: 0,
            sim_time: 0.0,
        })
    }

    // ========================================================================
    // Fields and tasks
    // ========================================================================

    /// Register a field. Values start at zero.
    pub fn add_field(&mut self, desc: FieldDesc) -> Result<()> {
        let name = desc.name.clone();
        self.executor.register_field(desc)?;
        self.graph.declare_field(name);
        Ok(())
    }

    /// Drop a field no task references. Nothing changes if it fails.
    pub fn retire_field(&mut self, name: &str) -> Result<FieldDesc> {
        self.graph.ensure_unused(name)?;
        let desc = self.executor.retire_field(name)?;
        self.graph.forget_field(name)?;
        Ok(desc)
    }

    /// Add a task and bind its kernel.
    pub fn add_task<R, W>(
        &mut self,
        name: &str,
        reads: R,
        writes: W,
        kernel: impl Into<KernelHandle>,
    ) -> Result<()>
    where
        R: IntoIterator,
        R::Item: Into<String>,
        W: IntoIterator,
        W::Item: Into<String>,
    {
        self.graph.add_task(name, reads, writes)?;
        self.executor.register_kernel(name, kernel);
        Ok(())
    }

    /// Remove a task and its kernel binding.
    pub fn remove_task(&mut self, name: &str) -> Result<TaskNode> {
        let node = self.graph.remove_task(name)?;
        self.executor.kernels_mut().unregister(name);
        Ok(node)
    }

    /// Rebind an existing task to another kernel.
    pub fn set_kernel(&mut self, name: &str, kernel: impl Into<KernelHandle>) -> Result<()> {
        if self.graph.task(name).is_none() {
            return Err(GraphError::UnknownTask(name.to_string()).into());
        }
        self.executor.register_kernel(name, kernel);
        Ok(())
    }

    /// Current schedule, rebuilt if tasks changed since it was last built.
    pub fn schedule(&mut self) -> Result<&Schedule> {
        Ok(current_schedule(&mut self.graph, &mut self.schedule)?)
    }

    /// Graphviz rendering of the task graph.
    pub fn export_diagnostic(&self) -> String {
        self.graph.export_diagnostic()
    }

    // ========================================================================
    // Stepping
    // ========================================================================

    /// Advance by one step of size `dt`.
    pub fn step(&mut self, dt: f32) -> Result<StepReport> {
        let schedule = current_schedule(&mut self.graph, &mut self.schedule)?;
        let report = self.executor.run_step(schedule, dt)?;
        self.steps += 1;
        self.sim_time += dt as f64;
        Ok(report)
    }

    /// Advance by `steps` steps, stopping at the first error.
    pub fn run(&mut self, steps: u64, dt: f32) -> Result<()> {
        for _ in 0..steps {
            self.step(dt)?;
        }
        Ok(())
    }

    // ========================================================================
    // Field data
    // ========================================================================

    /// Overwrite a field from host values in linear-index order.
    pub fn set_field(&mut self, name: &str, values: &[f32]) -> Result<()> {
        Ok(self.executor.scatter(name, values)?)
    }

    /// Set every component of every active cell from `value(cell)`.
    pub fn set_field_with(&mut self, name: &str, value: impl Fn([i32; 3]) -> f32) -> Result<()> {
        let components = self
            .executor
            .field_table()
            .get(name)
            .map(|d| d.components as usize)
            .ok_or_else(|| crate::executor::FieldError::Unknown(name.to_string()))?;
        let values: Vec<f32> = self
            .grid
            .active_cells()
            .into_iter()
            .flat_map(|cell| std::iter::repeat(value(cell)).take(components))
            .collect();
        self.set_field(name, &values)
    }

    /// Copy a field to the host in linear-index order.
    pub fn field(&self, name: &str) -> Result<Vec<f32>> {
        Ok(self.executor.gather(name)?)
    }

    /// Local storage of a field on one partition.
    pub fn local_field(&self, partition: usize, name: &str) -> Option<&LocalField> {
        self.executor.field(partition, name)
    }

    // ========================================================================
    // Decomposition
    // ========================================================================

    /// Re-partition into `partitions` sub-domains, carrying every field,
    /// kernel and the barrier policy across. Cancel tokens taken from the
    /// previous executor no longer apply.
    pub fn redecompose(&mut self, partitions: usize) -> Result<()> {
        let table = self.executor.field_table();
        let mut saved = Vec::with_capacity(table.len());
        for desc in table.iter() {
            saved.push((desc.clone(), self.executor.gather(&desc.name)?));
        }

        let options = SimulationOptions {
            partitions,
            barrier_policy: self.executor.barrier_policy(),
            ..self.options
        };
        let (decomposition, mut executor) = build_executor(&self.grid, &self.backend, &options)?;
        *executor.kernels_mut() = self.executor.kernels().clone();
        for (desc, values) in saved {
            let name = desc.name.clone();
            executor.register_field(desc)?;
            executor.scatter(&name, &values)?;
        }

        tracing::info!(
            "Re-decomposed from {} to {} partitions (imbalance {:.3})",
            self.options.partitions,
            partitions,
            decomposition.balance().imbalance
        );
        self.options = options;
        self.decomposition = decomposition;
        self.executor = executor;
        Ok(())
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Occupancy.
    pub fn grid(&self) -> &Arc<SparseGrid> {
        &self.grid
    }

    /// Current decomposition.
    pub fn decomposition(&self) -> &Arc<Decomposition> {
        &self.decomposition
    }

    /// Load-balance diagnostics of the current decomposition.
    pub fn balance(&self) -> &LoadBalance {
        self.decomposition.balance()
    }

    /// Task graph.
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Executor.
    pub fn executor(&self) -> &GraphExecutor {
        &self.executor
    }

    /// Executor, mutably.
    pub fn executor_mut(&mut self) -> &mut GraphExecutor {
        &mut self.executor
    }

    /// Active settings.
    pub fn options(&self) -> &SimulationOptions {
        &self.options
    }

    /// Number of partitions.
    pub fn partition_count(&self) -> usize {
        self.decomposition.partition_count()
    }

    /// Steps completed.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Sum of completed step sizes.
    pub fn sim_time(&self) -> f64 {
        self.sim_time
    }
}
