//! Step execution across partitions.
//!
//! A [`Schedule`] is lowered once per step into a [`StepPlan`]: a flat list
//! of barriers, halo exchanges and kernel dispatches that every partition
//! runs in the same order. Partitions run on their own threads; a partition
//! that fails aborts the halo layer so its neighbors stop waiting on it,
//! and is rolled back to the state it had when the step began.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use grid_kernel::{
    ComputeQueue, DeviceBackend, DeviceId, DispatchContext, FieldDesc, FieldTable, HostQueue,
    IndexBox, KernelError, KernelHandle, KernelRegistry, LocalField, Occupancy, QueueProfile,
};
use serde::{Deserialize, Serialize};

use crate::domain::Decomposition;
use crate::graph::{Schedule, ScheduledTask};
use crate::halo::{HaloConfig, HaloError, HaloExchangeManager, TransferStats};

// ============================================================================
// Plan
// ============================================================================

/// When the executor inserts a barrier before a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BarrierPolicy {
    /// Only before a task reading a field the previous task wrote.
    #[default]
    OnHazard,
    /// Before every dispatch.
    Always,
}

/// Where a partition is within the current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionPhase {
    /// No step in progress.
    Idle,
    /// Exchanging halos.
    HaloPending,
    /// Running a kernel.
    Dispatching,
    /// Waiting on a queue barrier.
    Barrier,
    /// Finished the step.
    Done,
    /// The step failed on this partition.
    Failed,
}

impl fmt::Display for PartitionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PartitionPhase::Idle => "idle",
            PartitionPhase::HaloPending => "halo exchange",
            PartitionPhase::Dispatching => "dispatch",
            PartitionPhase::Barrier => "barrier",
            PartitionPhase::Done => "done",
            PartitionPhase::Failed => "failed",
        })
    }
}

/// One operation of a [`StepPlan`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StepOp {
    /// Queue barrier.
    Barrier,
    /// Refresh the ghost cells of a halo field.
    Exchange {
        /// Field name.
        field: String,
    },
    /// Run a task's kernel over the partition's cells.
    Dispatch {
        /// Position in the schedule.
        index: usize,
        /// Task name.
        task: String,
    },
}

/// The operations every partition runs for one step.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct StepPlan {
    ops: Vec<StepOp>,
}

impl StepPlan {
    /// Lower `schedule` into a flat list of operations.
    ///
    /// Every halo field starts the step stale. A task reading a stale halo
    /// field gets an exchange right before its dispatch; a task writing a
    /// halo field makes it stale again.
    pub fn build(schedule: &Schedule, fields: &FieldTable, policy: BarrierPolicy) -> Self {
        let mut ops = Vec::new();
        let mut stale: HashSet<&str> = fields
            .iter()
            .filter(|f| f.halo)
            .map(|f| f.name.as_str())
            .collect();
        let mut previous: Option<&ScheduledTask> = None;

        for (index, task) in schedule.tasks().iter().enumerate() {
            let hazard = previous
                .is_some_and(|p| task.reads.iter().any(|r| p.writes.contains(r)));
            if policy == BarrierPolicy::Always || hazard {
                ops.push(StepOp::Barrier);
            }
            for read in &task.reads {
                if stale.remove(read.as_str()) {
                    ops.push(StepOp::Exchange {
                        field: read.clone(),
                    });
                }
            }
            ops.push(StepOp::Dispatch {
                index,
                task: task.name.clone(),
            });
            for write in &task.writes {
                if fields.is_halo(write) {
                    stale.insert(write.as_str());
                }
            }
            previous = Some(task);
        }
        Self { ops }
    }

    /// Operations in order.
    pub fn ops(&self) -> &[StepOp] {
        &self.ops
    }

    /// Number of halo exchanges.
    pub fn exchanges(&self) -> usize {
        self.count(|op| matches!(op, StepOp::Exchange { .. }))
    }

    /// Number of barriers.
    pub fn barriers(&self) -> usize {
        self.count(|op| matches!(op, StepOp::Barrier))
    }

    /// Number of dispatches.
    pub fn dispatches(&self) -> usize {
        self.count(|op| matches!(op, StepOp::Dispatch { .. }))
    }

    fn count(&self, pred: impl Fn(&StepOp) -> bool) -> usize {
        self.ops.iter().filter(|op| pred(op)).count()
    }
}

// ============================================================================
// Reports and errors
// ============================================================================

/// Something a partition did during a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StepEvent {
    /// Halo exchange over `faces` faces.
    Halo {
        /// Field name.
        field: String,
        /// Faces exchanged.
        faces: usize,
    },
    /// Kernel dispatch.
    Dispatch {
        /// Task name.
        task: String,
        /// Cells processed.
        cells: usize,
    },
    /// Queue barrier.
    Barrier,
}

/// What one partition did during a step.
#[derive(Debug, Clone, Serialize)]
pub struct PartitionReport {
    /// Partition index.
    pub partition: usize,
    /// Phase at the end of the step.
    pub phase: PartitionPhase,
    /// Operations completed, in order.
    pub events: Vec<StepEvent>,
    /// Wall time on the partition's thread.
    pub elapsed: Duration,
}

/// Summary of a completed step.
#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    /// Index of the step, starting at 0.
    pub step: u64,
    /// Step size.
    pub dt: f32,
    /// One report per partition, by index.
    pub partitions: Vec<PartitionReport>,
    /// Halo counters after the step.
    pub transfer: TransferStats,
    /// Partition pairs with interpenetrating bounds. Cells where they touch
    /// see no ghosts from each other, so results there can differ from a
    /// single-partition run.
    pub unlinked_pairs: Vec<(usize, usize)>,
    /// Wall time for the whole step.
    pub elapsed: Duration,
}

/// Why a partition failed.
#[derive(Debug, thiserror::Error)]
pub enum PartitionFailure {
    /// Halo exchange failed.
    #[error(transparent)]
    Halo(#[from] HaloError),
    /// Kernel failed.
    #[error(transparent)]
    Kernel(#[from] KernelError),
    /// The task's kernel disappeared from the registry.
    #[error("no kernel registered for task '{0}'")]
    MissingKernel(String),
    /// The partition has no storage for a field the task uses.
    #[error("task '{task}' uses field '{field}' which has no local storage")]
    MissingStorage {
        /// Task name.
        task: String,
        /// Field name.
        field: String,
    },
    /// The partition's thread panicked.
    #[error("panicked: {0}")]
    Panicked(String),
    /// The partition's thread could not be started.
    #[error("could not start worker thread: {0}")]
    Spawn(String),
}

/// A failure on one partition.
#[derive(Debug, thiserror::Error)]
#[error("partition {partition} failed during {phase}: {failure}")]
pub struct PartitionError {
    /// Partition index.
    pub partition: usize,
    /// Phase the partition was in.
    pub phase: PartitionPhase,
    /// Underlying cause.
    #[source]
    pub failure: PartitionFailure,
}

/// Errors raised by [`GraphExecutor::run_step`].
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// The cancel token was set before the step started.
    #[error("step {step} was cancelled")]
    Cancelled {
        /// Step that did not run.
        step: u64,
    },
    /// A scheduled task has no kernel.
    #[error("task '{task}' has no registered kernel")]
    MissingKernel {
        /// Task name.
        task: String,
    },
    /// A scheduled task uses a field the executor does not know.
    #[error("task '{task}' uses unregistered field '{field}'")]
    UnknownField {
        /// Task name.
        task: String,
        /// Field name.
        field: String,
    },
    /// At least one partition failed. Failed partitions were rolled back.
    #[error("step {step} failed on partitions {:?}", .failed.iter().map(|e| e.partition).collect::<Vec<_>>())]
    Partial {
        /// Step index.
        step: u64,
        /// Partitions that finished the step.
        completed: Vec<usize>,
        /// Failures, by partition index.
        failed: Vec<PartitionError>,
    },
}

/// Errors raised when registering or moving field data.
#[derive(Debug, thiserror::Error)]
pub enum FieldError {
    /// A field with this name is already registered.
    #[error("field '{0}' is already registered")]
    Duplicate(String),
    /// No field has this name.
    #[error("field '{0}' is not registered")]
    Unknown(String),
    /// Host data does not match the field layout.
    #[error("field '{field}' expects {expected} values, got {actual}")]
    Length {
        /// Field name.
        field: String,
        /// Active cells times components.
        expected: usize,
        /// Values supplied.
        actual: usize,
    },
    /// Halo buffers could not be allocated or released.
    #[error(transparent)]
    Halo(#[from] HaloError),
}

// ============================================================================
// Executor
// ============================================================================

/// Shared flag that stops the next step from starting.
///
/// The flag is consumed by the step it cancels.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Unset token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation is pending.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Drop a pending request.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Executor settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Barrier insertion.
    pub barrier_policy: BarrierPolicy,
    /// Halo layer settings.
    pub halo: HaloConfig,
}

struct PartitionState {
    index: usize,
    storage: Option<IndexBox>,
    cells: Vec<[i32; 3]>,
    linear: Vec<usize>,
    fields: HashMap<String, LocalField>,
    checkpoint: Option<HashMap<String, LocalField>>,
    queue: Box<dyn ComputeQueue>,
    phase: PartitionPhase,
}

struct StepContext<'a> {
    halo: &'a HaloExchangeManager,
    kernels: &'a KernelRegistry,
    schedule: &'a Schedule,
    plan: &'a StepPlan,
    dt: f32,
}

/// Runs schedules over a decomposed grid.
pub struct GraphExecutor {
    decomposition: Arc<Decomposition>,
    occupancy: Arc<dyn Occupancy + Send + Sync>,
    halo: HaloExchangeManager,
    partitions: Vec<PartitionState>,
    kernels: KernelRegistry,
    fields: Arc<FieldTable>,
    policy: BarrierPolicy,
    cancel: CancelToken,
    step: u64,
    checkpoint_step: Option<u64>,
}

impl GraphExecutor {
    /// Executor with one host queue per partition and no fields.
    pub fn new(
        occupancy: Arc<dyn Occupancy + Send + Sync>,
        decomposition: Arc<Decomposition>,
        backend: Arc<dyn DeviceBackend>,
        devices: Vec<DeviceId>,
        config: ExecutorConfig,
    ) -> Result<Self, HaloError> {
        let halo = HaloExchangeManager::new(
            Arc::clone(&decomposition),
            Arc::clone(&occupancy),
            backend,
            devices,
            config.halo,
        )?;
        let thickness = config.halo.thickness as i32;

        let partitions = decomposition
            .subdomains()
            .iter()
            .map(|sd| {
                let mut cells = Vec::with_capacity(sd.active_cells as usize);
                let mut linear = Vec::with_capacity(sd.active_cells as usize);
                for block in &sd.blocks {
                    for (cell, index) in occupancy.block_cells(block.origin) {
                        cells.push(cell);
                        linear.push(index);
                    }
                }
                PartitionState {
                    index: sd.index,
                    storage: sd.bounds.map(|b| b.expand(thickness)),
                    cells,
                    linear,
                    fields: HashMap::new(),
                    checkpoint: None,
                    queue: Box::new(HostQueue::new()),
                    phase: PartitionPhase::Idle,
                }
            })
            .collect::<Vec<_>>();

        tracing::info!(
            "Executor ready: {} partitions, {} active cells, barrier policy {:?}",
            partitions.len(),
            occupancy.active_cell_count(),
            config.barrier_policy
        );

        Ok(Self {
            decomposition,
            occupancy,
            halo,
            partitions,
            kernels: KernelRegistry::new(),
            fields: Arc::new(FieldTable::new(Vec::new(), 0)),
            policy: config.barrier_policy,
            cancel: CancelToken::new(),
            step: 0,
            checkpoint_step: None,
        })
    }

    // ------------------------------------------------------------------------
    // Fields
    // ------------------------------------------------------------------------

    /// Register a field, allocating local storage on every non-empty
    /// partition and halo buffers if the field has a halo. Values start at
    /// zero.
    pub fn register_field(&mut self, desc: FieldDesc) -> Result<(), FieldError> {
        if self.fields.get(&desc.name).is_some() {
            return Err(FieldError::Duplicate(desc.name));
        }
        if desc.halo {
            self.halo.allocate(&desc)?;
        }
        for part in &mut self.partitions {
            if let Some(storage) = part.storage {
                part.fields
                    .insert(desc.name.clone(), LocalField::new(storage, desc.components));
            }
        }
        tracing::debug!(
            "Registered field '{}' ({} components, halo: {})",
            desc.name,
            desc.components,
            desc.halo
        );
        let mut all = self.fields.to_vec();
        all.push(desc);
        self.replace_table(all);
        Ok(())
    }

    /// Drop a field with its storage and halo buffers.
    pub fn retire_field(&mut self, name: &str) -> Result<FieldDesc, FieldError> {
        let desc = self
            .fields
            .get(name)
            .cloned()
            .ok_or_else(|| FieldError::Unknown(name.to_string()))?;
        if desc.halo {
            self.halo.retire_field(name)?;
        }
        for part in &mut self.partitions {
            part.fields.remove(name);
        }
        let remaining = self.fields.iter().filter(|f| f.name != name).cloned().collect();
        self.replace_table(remaining);
        Ok(desc)
    }

    fn replace_table(&mut self, fields: Vec<FieldDesc>) {
        let generation = self.fields.generation() + 1;
        self.fields = Arc::new(FieldTable::new(fields, generation));
        // A checkpoint taken under another field set cannot be restored.
        for part in &mut self.partitions {
            part.checkpoint = None;
        }
        self.checkpoint_step = None;
    }

    /// Registered fields.
    pub fn field_table(&self) -> Arc<FieldTable> {
        Arc::clone(&self.fields)
    }

    /// Copy host values, indexed by occupancy linear index times
    /// components, into every partition's owned cells.
    pub fn scatter(&mut self, name: &str, values: &[f32]) -> Result<(), FieldError> {
        let desc = self
            .fields
            .get(name)
            .ok_or_else(|| FieldError::Unknown(name.to_string()))?;
        let n = desc.components as usize;
        let expected = self.occupancy.active_cell_count() * n;
        if values.len() != expected {
            return Err(FieldError::Length {
                field: name.to_string(),
                expected,
                actual: values.len(),
            });
        }
        for part in &mut self.partitions {
            let Some(local) = part.fields.get_mut(name) else {
                continue;
            };
            for (&cell, &li) in part.cells.iter().zip(&part.linear) {
                if let Some(dst) = local.cell_mut(cell) {
                    dst.copy_from_slice(&values[li * n..(li + 1) * n]);
                }
            }
        }
        Ok(())
    }

    /// Collect owned cells from every partition into one host array,
    /// laid out as for [`scatter`](Self::scatter).
    pub fn gather(&self, name: &str) -> Result<Vec<f32>, FieldError> {
        let desc = self
            .fields
            .get(name)
            .ok_or_else(|| FieldError::Unknown(name.to_string()))?;
        let n = desc.components as usize;
        let mut out = vec![0.0; self.occupancy.active_cell_count() * n];
        for part in &self.partitions {
            let Some(local) = part.fields.get(name) else {
                continue;
            };
            for (&cell, &li) in part.cells.iter().zip(&part.linear) {
                if let Some(src) = local.cell(cell) {
                    out[li * n..(li + 1) * n].copy_from_slice(src);
                }
            }
        }
        Ok(out)
    }

    /// Local storage of a field on one partition, ghost cells included.
    pub fn field(&self, partition: usize, name: &str) -> Option<&LocalField> {
        self.partitions.get(partition)?.fields.get(name)
    }

    // ------------------------------------------------------------------------
    // Kernels and accessors
    // ------------------------------------------------------------------------

    /// Bind a task name to a kernel.
    pub fn register_kernel(
        &mut self,
        task: impl Into<String>,
        kernel: impl Into<KernelHandle>,
    ) -> Option<KernelHandle> {
        self.kernels.register(task, kernel)
    }

    /// Registered kernels.
    pub fn kernels(&self) -> &KernelRegistry {
        &self.kernels
    }

    /// Registered kernels, mutably.
    pub fn kernels_mut(&mut self) -> &mut KernelRegistry {
        &mut self.kernels
    }

    /// Replace the compute queue of a partition, returning the old one.
    pub fn set_queue(
        &mut self,
        partition: usize,
        queue: Box<dyn ComputeQueue>,
    ) -> Option<Box<dyn ComputeQueue>> {
        let part = self.partitions.get_mut(partition)?;
        Some(std::mem::replace(&mut part.queue, queue))
    }

    /// Queue counters of a partition.
    pub fn profile(&self, partition: usize) -> Option<QueueProfile> {
        self.partitions.get(partition).map(|p| p.queue.profile())
    }

    /// Owned active cells of a partition, in block order.
    pub fn owned_cells(&self, partition: usize) -> Option<&[[i32; 3]]> {
        self.partitions.get(partition).map(|p| p.cells.as_slice())
    }

    /// Phase of every partition.
    pub fn phases(&self) -> Vec<PartitionPhase> {
        self.partitions.iter().map(|p| p.phase).collect()
    }

    /// Steps completed.
    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Token that cancels the next step.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Barrier insertion policy.
    pub fn barrier_policy(&self) -> BarrierPolicy {
        self.policy
    }

    /// Change the barrier insertion policy.
    pub fn set_barrier_policy(&mut self, policy: BarrierPolicy) {
        self.policy = policy;
    }

    /// Halo layer.
    pub fn halo(&self) -> &HaloExchangeManager {
        &self.halo
    }

    /// Decomposition the executor runs over.
    pub fn decomposition(&self) -> &Arc<Decomposition> {
        &self.decomposition
    }

    /// Plan the executor would run for `schedule`.
    pub fn plan(&self, schedule: &Schedule) -> StepPlan {
        StepPlan::build(schedule, &self.fields, self.policy)
    }

    // ------------------------------------------------------------------------
    // Stepping
    // ------------------------------------------------------------------------

    fn validate(&self, schedule: &Schedule) -> Result<(), StepError> {
        for task in schedule.tasks() {
            if !self.kernels.contains(&task.name) {
                return Err(StepError::MissingKernel {
                    task: task.name.clone(),
                });
            }
            if let Some(field) = task
                .reads
                .iter()
                .chain(&task.writes)
                .find(|f| self.fields.get(f).is_none())
            {
                return Err(StepError::UnknownField {
                    task: task.name.clone(),
                    field: field.clone(),
                });
            }
        }
        Ok(())
    }

    /// Run one step of `schedule` on every partition.
    ///
    /// Nothing is dispatched if the step is cancelled or the schedule does
    /// not validate. If any partition fails, failed partitions are restored
    /// to their state at the start of the step, the halo counters are
    /// resynchronized, and [`StepError::Partial`] lists both sides. The
    /// step counter only advances on full success.
    pub fn run_step(&mut self, schedule: &Schedule, dt: f32) -> Result<StepReport, StepError> {
        let step = self.step;
        if self.cancel.take() {
            tracing::info!("Step {} cancelled", step);
            return Err(StepError::Cancelled { step });
        }
        self.validate(schedule)?;

        let plan = StepPlan::build(schedule, &self.fields, self.policy);
        let started = Instant::now();

        for part in &mut self.partitions {
            part.checkpoint = Some(part.fields.clone());
            part.phase = PartitionPhase::Idle;
        }
        self.checkpoint_step = Some(step);
        self.halo.begin_step();

        let ctx = StepContext {
            halo: &self.halo,
            kernels: &self.kernels,
            schedule,
            plan: &plan,
            dt,
        };

        let mut outcomes = thread::scope(|s| {
            let mut outcomes = Vec::with_capacity(self.partitions.len());
            let mut handles = Vec::new();
            for part in self.partitions.iter_mut() {
                let index = part.index;
                if part.cells.is_empty() {
                    part.phase = PartitionPhase::Done;
                    outcomes.push(Ok(PartitionReport {
                        partition: index,
                        phase: PartitionPhase::Done,
                        events: Vec::new(),
                        elapsed: Duration::ZERO,
                    }));
                    continue;
                }
                let ctx = &ctx;
                let spawned = thread::Builder::new()
                    .name(format!("partition-{index}"))
                    .spawn_scoped(s, move || {
                        let result =
                            panic::catch_unwind(AssertUnwindSafe(|| run_partition(part, ctx)));
                        let result = result.unwrap_or_else(|payload| {
                            Err(PartitionError {
                                partition: index,
                                phase: part.phase,
                                failure: PartitionFailure::Panicked(panic_message(payload)),
                            })
                        });
                        if result.is_err() {
                            part.phase = PartitionPhase::Failed;
                            ctx.halo.abort();
                        }
                        result
                    });
                match spawned {
                    Ok(handle) => handles.push((index, handle)),
                    Err(e) => {
                        ctx.halo.abort();
                        outcomes.push(Err(PartitionError {
                            partition: index,
                            phase: PartitionPhase::Idle,
                            failure: PartitionFailure::Spawn(e.to_string()),
                        }));
                    }
                }
            }
            for (index, handle) in handles {
                outcomes.push(handle.join().unwrap_or_else(|payload| {
                    Err(PartitionError {
                        partition: index,
                        phase: PartitionPhase::Failed,
                        failure: PartitionFailure::Panicked(panic_message(payload)),
                    })
                }));
            }
            outcomes
        });
        outcomes.sort_by_key(|o| match o {
            Ok(r) => r.partition,
            Err(e) => e.partition,
        });

        let mut completed = Vec::new();
        let mut failed = Vec::new();
        let mut reports = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(report) => {
                    completed.push(report.partition);
                    reports.push(report);
                }
                Err(e) => failed.push(e),
            }
        }

        if !failed.is_empty() {
            for e in &failed {
                let part = &mut self.partitions[e.partition];
                if let Some(checkpoint) = &part.checkpoint {
                    part.fields = checkpoint.clone();
                }
                part.phase = PartitionPhase::Failed;
                tracing::warn!("Step {}: {}", step, e);
            }
            self.halo.resynchronize();
            return Err(StepError::Partial {
                step,
                completed,
                failed,
            });
        }

        self.step += 1;
        let elapsed = started.elapsed();
        tracing::debug!(
            "Step {} done in {:.3} ms ({} ops per partition)",
            step,
            elapsed.as_secs_f64() * 1e3,
            plan.ops().len()
        );
        Ok(StepReport {
            step,
            dt,
            partitions: reports,
            transfer: self.halo.stats(),
            unlinked_pairs: self.decomposition.unlinked_pairs().to_vec(),
            elapsed,
        })
    }

    /// Restore every partition to the state it had when the last step
    /// began and rewind the step counter. Returns false if no checkpoint
    /// exists.
    pub fn rollback(&mut self) -> bool {
        let Some(step) = self.checkpoint_step else {
            return false;
        };
        for part in &mut self.partitions {
            if let Some(checkpoint) = &part.checkpoint {
                part.fields = checkpoint.clone();
            }
            part.phase = PartitionPhase::Idle;
        }
        self.step = step;
        self.halo.resynchronize();
        tracing::info!("Rolled back to step {}", step);
        true
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn run_partition(
    part: &mut PartitionState,
    ctx: &StepContext<'_>,
) -> Result<PartitionReport, PartitionError> {
    let started = Instant::now();
    let index = part.index;
    let mut events = Vec::with_capacity(ctx.plan.ops().len());

    for op in ctx.plan.ops() {
        match op {
            StepOp::Barrier => {
                part.phase = PartitionPhase::Barrier;
                part.queue.barrier();
                events.push(StepEvent::Barrier);
            }
            StepOp::Exchange { field } => {
                part.phase = PartitionPhase::HaloPending;
                let fail = |failure| PartitionError {
                    partition: index,
                    phase: PartitionPhase::HaloPending,
                    failure,
                };
                let Some(local) = part.fields.get_mut(field) else {
                    return Err(fail(PartitionFailure::MissingStorage {
                        task: String::new(),
                        field: field.clone(),
                    }));
                };
                let faces = ctx
                    .halo
                    .exchange(field, index, local)
                    .map_err(|e| fail(e.into()))?;
                events.push(StepEvent::Halo {
                    field: field.clone(),
                    faces,
                });
            }
            StepOp::Dispatch { index: at, task } => {
                part.phase = PartitionPhase::Dispatching;
                let fail = |failure| PartitionError {
                    partition: index,
                    phase: PartitionPhase::Dispatching,
                    failure,
                };
                let Some(kernel) = ctx.kernels.get(task) else {
                    return Err(fail(PartitionFailure::MissingKernel(task.clone())));
                };
                dispatch(part, &ctx.schedule.tasks()[*at], kernel, ctx.dt).map_err(fail)?;
                events.push(StepEvent::Dispatch {
                    task: task.clone(),
                    cells: part.cells.len(),
                });
            }
        }
    }

    part.phase = PartitionPhase::Done;
    Ok(PartitionReport {
        partition: index,
        phase: PartitionPhase::Done,
        events,
        elapsed: started.elapsed(),
    })
}

/// Run one kernel over the partition's owned cells. Written fields are
/// moved out of the map for the duration of the call; a field both read and
/// written is read from a copy taken before the dispatch.
fn dispatch(
    part: &mut PartitionState,
    task: &ScheduledTask,
    kernel: &KernelHandle,
    dt: f32,
) -> Result<(), PartitionFailure> {
    let mut writes = Vec::with_capacity(task.writes.len());
    let mut missing = None;
    for name in &task.writes {
        match part.fields.remove(name) {
            Some(f) => writes.push(f),
            None => {
                missing = Some(name.clone());
                break;
            }
        }
    }

    let result = match missing {
        Some(field) => Err(PartitionFailure::MissingStorage {
            task: task.name.clone(),
            field,
        }),
        None => {
            let aliased: HashMap<&str, LocalField> = task
                .reads
                .iter()
                .filter_map(|r| {
                    let i = task.writes.iter().position(|w| w == r)?;
                    Some((r.as_str(), writes[i].clone()))
                })
                .collect();
            let mut reads = Vec::with_capacity(task.reads.len());
            let mut missing = None;
            for r in &task.reads {
                match aliased.get(r.as_str()).or_else(|| part.fields.get(r)) {
                    Some(f) => reads.push(f),
                    None => {
                        missing = Some(r.clone());
                        break;
                    }
                }
            }
            match missing {
                Some(field) => Err(PartitionFailure::MissingStorage {
                    task: task.name.clone(),
                    field,
                }),
                None => {
                    let ctx = DispatchContext {
                        task: &task.name,
                        partition: part.index,
                        cells: &part.cells,
                        range: 0..part.cells.len(),
                        dt,
                        reads: &reads,
                    };
                    part.queue
                        .dispatch(kernel, &ctx, &mut writes)
                        .map_err(PartitionFailure::from)
                }
            }
        }
    };

    for (name, field) in task.writes.iter().zip(writes) {
        part.fields.insert(name.clone(), field);
    }
    result
}
