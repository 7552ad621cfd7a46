//! Kernel lookup and dispatch.
//!
//! Tasks are bound to kernels late, by name, through a [`KernelRegistry`].
//! A [`KernelHandle`] is a tagged variant: either one of the built-in stencils
//! or an arbitrary host closure. A [`ComputeQueue`] executes handles over a
//! partition's active-cell range.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::field::LocalField;

/// Errors raised while executing a kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// The task declares fewer fields than the kernel consumes.
    #[error("task '{task}' binds {reads} read(s) and {writes} write(s), kernel '{kernel}' needs at least {min_reads} and {min_writes}")]
    Arity {
        /// Task name.
        task: String,
        /// Kernel kind.
        kernel: &'static str,
        /// Reads declared by the task.
        reads: usize,
        /// Writes declared by the task.
        writes: usize,
        /// Reads required.
        min_reads: usize,
        /// Writes required.
        min_writes: usize,
    },
    /// Two bound fields have incompatible component counts.
    #[error("task '{task}': field components {expected} and {actual} do not match")]
    ComponentMismatch {
        /// Task name.
        task: String,
        /// Components of the first field.
        expected: u32,
        /// Components of the second field.
        actual: u32,
    },
    /// A host kernel reported a failure.
    #[error("task '{task}' failed on partition {partition}: {reason}")]
    Failed {
        /// Task name.
        task: String,
        /// Partition index.
        partition: usize,
        /// Reason reported by the kernel.
        reason: String,
    },
}

/// Everything a kernel sees for one dispatch.
pub struct DispatchContext<'a> {
    /// Task being dispatched.
    pub task: &'a str,
    /// Partition index.
    pub partition: usize,
    /// The partition's owned active cells.
    pub cells: &'a [[i32; 3]],
    /// Range of `cells` to process.
    pub range: Range<usize>,
    /// Step size.
    pub dt: f32,
    /// Fields read by the task, in declaration order.
    pub reads: &'a [&'a LocalField],
}

impl DispatchContext<'_> {
    /// Cells covered by this dispatch.
    pub fn active(&self) -> &[[i32; 3]] {
        &self.cells[self.range.clone()]
    }
}

/// Signature of a kernel implemented as a host closure. Written fields are
/// passed in declaration order.
pub type HostKernelFn =
    dyn Fn(&DispatchContext<'_>, &mut [LocalField]) -> Result<(), KernelError> + Send + Sync;

/// Built-in stencils.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuiltinKernel {
    /// Every written field becomes `value`.
    Fill {
        /// Value stored in every component.
        value: f32,
    },
    /// `writes[0] = reads[0]`.
    Copy,
    /// `writes[0] = factor * reads[0]`.
    Scale {
        /// Multiplier.
        factor: f32,
    },
    /// `writes[0] = reads[1] + alpha * dt * reads[0]`.
    Axpy {
        /// Coefficient applied to `reads[0]`.
        alpha: f32,
    },
    /// Explicit diffusion step with a 6-point Laplacian:
    /// `writes[0] = u + coefficient * dt * sum(u_n - u)` where `u = reads[0]`.
    /// Neighbors outside the field's storage read as zero.
    Laplacian {
        /// Diffusion coefficient.
        coefficient: f32,
    },
}

const NEIGHBOR_OFFSETS: [[i32; 3]; 6] = [
    [-1, 0, 0],
    [1, 0, 0],
    [0, -1, 0],
    [0, 1, 0],
    [0, 0, -1],
    [0, 0, 1],
];

impl BuiltinKernel {
    /// Short name used in errors and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BuiltinKernel::Fill { .. } => "fill",
            BuiltinKernel::Copy => "copy",
            BuiltinKernel::Scale { .. } => "scale",
            BuiltinKernel::Axpy { .. } => "axpy",
            BuiltinKernel::Laplacian { .. } => "laplacian",
        }
    }

    /// Minimum (reads, writes) the kernel needs.
    pub fn arity(&self) -> (usize, usize) {
        match self {
            BuiltinKernel::Fill { .. } => (0, 1),
            BuiltinKernel::Copy | BuiltinKernel::Scale { .. } | BuiltinKernel::Laplacian { .. } => {
                (1, 1)
            }
            BuiltinKernel::Axpy { .. } => (2, 1),
        }
    }

    fn check(&self, ctx: &DispatchContext<'_>, writes: &[LocalField]) -> Result<(), KernelError> {
        let (min_reads, min_writes) = self.arity();
        if ctx.reads.len() < min_reads || writes.len() < min_writes {
            return Err(KernelError::Arity {
                task: ctx.task.to_string(),
                kernel: self.kind(),
                reads: ctx.reads.len(),
                writes: writes.len(),
                min_reads,
                min_writes,
            });
        }
        if min_reads > 0 {
            let out = writes[0].components();
            for r in &ctx.reads[..min_reads] {
                if r.components() != out {
                    return Err(KernelError::ComponentMismatch {
                        task: ctx.task.to_string(),
                        expected: out,
                        actual: r.components(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Run the kernel over `ctx.range`.
    pub fn execute(
        &self,
        ctx: &DispatchContext<'_>,
        writes: &mut [LocalField],
    ) -> Result<(), KernelError> {
        self.check(ctx, writes)?;
        match *self {
            BuiltinKernel::Fill { value } => {
                for out in writes.iter_mut() {
                    for &cell in ctx.active() {
                        if let Some(dst) = out.cell_mut(cell) {
                            dst.fill(value);
                        }
                    }
                }
            }
            BuiltinKernel::Copy => map_cells(ctx, &mut writes[0], |src, _| src[0]),
            BuiltinKernel::Scale { factor } => {
                map_cells(ctx, &mut writes[0], |src, _| factor * src[0])
            }
            BuiltinKernel::Axpy { alpha } => {
                let step = alpha * ctx.dt;
                map_cells(ctx, &mut writes[0], |src, _| src[1] + step * src[0])
            }
            BuiltinKernel::Laplacian { coefficient } => {
                let u = ctx.reads[0];
                let out = &mut writes[0];
                let k = coefficient * ctx.dt;
                let n = u.components() as usize;
                let mut next = vec![0.0f32; n];
                for &cell in ctx.active() {
                    let Some(center) = u.cell(cell) else { continue };
                    for c in 0..n {
                        let mut acc = 0.0f32;
                        for off in NEIGHBOR_OFFSETS {
                            let nb = [cell[0] + off[0], cell[1] + off[1], cell[2] + off[2]];
                            acc += u.value(nb, c) - center[c];
                        }
                        next[c] = center[c] + k * acc;
                    }
                    if let Some(dst) = out.cell_mut(cell) {
                        dst.copy_from_slice(&next);
                    }
                }
            }
        }
        Ok(())
    }
}

/// Apply `f` per component. `f` receives the value of that component in
/// each read field.
fn map_cells(
    ctx: &DispatchContext<'_>,
    out: &mut LocalField,
    f: impl Fn(&[f32], usize) -> f32,
) {
    let components = out.components() as usize;
    let mut src = Vec::with_capacity(ctx.reads.len());
    for &cell in ctx.active() {
        for c in 0..components {
            src.clear();
            src.extend(ctx.reads.iter().map(|r| r.value(cell, c)));
            let v = f(&src, c);
            if let Some(dst) = out.cell_mut(cell) {
                dst[c] = v;
            }
        }
    }
}

/// A kernel bound to a task name.
#[derive(Clone)]
pub enum KernelHandle {
    /// One of the built-in stencils.
    Builtin(BuiltinKernel),
    /// A host closure.
    Host(Arc<HostKernelFn>),
}

impl KernelHandle {
    /// Wrap a closure.
    pub fn host<F>(f: F) -> Self
    where
        F: Fn(&DispatchContext<'_>, &mut [LocalField]) -> Result<(), KernelError>
            + Send
            + Sync
            + 'static,
    {
        KernelHandle::Host(Arc::new(f))
    }
}

impl From<BuiltinKernel> for KernelHandle {
    fn from(k: BuiltinKernel) -> Self {
        KernelHandle::Builtin(k)
    }
}

impl std::fmt::Debug for KernelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KernelHandle::Builtin(k) => f.debug_tuple("Builtin").field(k).finish(),
            KernelHandle::Host(_) => f.write_str("Host(..)"),
        }
    }
}

/// Runtime-extensible map from task name to kernel.
#[derive(Debug, Clone, Default)]
pub struct KernelRegistry {
    kernels: HashMap<String, KernelHandle>,
}

impl KernelRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `kernel`, returning the previous binding.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        kernel: impl Into<KernelHandle>,
    ) -> Option<KernelHandle> {
        self.kernels.insert(name.into(), kernel.into())
    }

    /// Remove a binding.
    pub fn unregister(&mut self, name: &str) -> Option<KernelHandle> {
        self.kernels.remove(name)
    }

    /// Kernel bound to `name`.
    pub fn get(&self, name: &str) -> Option<&KernelHandle> {
        self.kernels.get(name)
    }

    /// Whether `name` has a kernel.
    pub fn contains(&self, name: &str) -> bool {
        self.kernels.contains_key(name)
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }
}

/// Counters accumulated by a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QueueProfile {
    /// Kernels dispatched.
    pub dispatches: u64,
    /// Barriers issued.
    pub barriers: u64,
    /// Cells processed across all dispatches.
    pub cells: u64,
    /// Time spent inside kernels.
    pub busy: Duration,
}

/// Ordered submission of kernels for one partition.
pub trait ComputeQueue: Send {
    /// Run `kernel` over `ctx.range` and return once its writes are visible.
    fn dispatch(
        &mut self,
        kernel: &KernelHandle,
        ctx: &DispatchContext<'_>,
        writes: &mut [LocalField],
    ) -> Result<(), KernelError>;

    /// Make every preceding write visible to subsequent dispatches.
    fn barrier(&mut self);

    /// Counters since creation.
    fn profile(&self) -> QueueProfile;
}

/// Queue that runs kernels synchronously on the calling thread.
#[derive(Debug, Default)]
pub struct HostQueue {
    profile: QueueProfile,
}

impl HostQueue {
    /// New queue with zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ComputeQueue for HostQueue {
    fn dispatch(
        &mut self,
        kernel: &KernelHandle,
        ctx: &DispatchContext<'_>,
        writes: &mut [LocalField],
    ) -> Result<(), KernelError> {
        let start = Instant::now();
        let result = match kernel {
            KernelHandle::Builtin(k) => k.execute(ctx, writes),
            KernelHandle::Host(f) => f(ctx, writes),
        };
        self.profile.busy += start.elapsed();
        self.profile.dispatches += 1;
        self.profile.cells += ctx.range.len() as u64;
        result
    }

    fn barrier(&mut self) {
        // Dispatches complete before returning, so ordering already holds.
        self.profile.barriers += 1;
    }

    fn profile(&self) -> QueueProfile {
        self.profile
    }
}
