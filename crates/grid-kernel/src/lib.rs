//! Sparse Grid Kernel
//!
//! This crate provides the storage and compute collaborators that the
//! orchestrator partitions and schedules. It is designed to be separable and
//! compute-focused.
//!
//! # Modules
//! - [`block`] -- Fixed-size blocks, the atomic unit of partitioning.
//! - [`grid`] -- Integer boxes and the bitmask-per-block sparse occupancy.
//! - [`field`] -- Field descriptors, immutable field tables, dense per-partition storage.
//! - [`device`] -- Opaque device buffers, peer capability and the host backend.
//! - [`dispatch`] -- Kernel registry, built-in stencils and compute queues.
//! - `gpu` -- wgpu device backend (feature `gpu`).

#![warn(missing_docs)]

pub mod block;
pub mod device;
pub mod dispatch;
pub mod field;
pub mod grid;

#[cfg(feature = "gpu")]
pub mod gpu;

pub use block::{Block, BLOCK_SIZE, CELLS_PER_BLOCK};
pub use device::{BufferHandle, CopyRegion, DeviceBackend, DeviceError, DeviceId, HostBackend};
pub use dispatch::{
    BuiltinKernel, ComputeQueue, DispatchContext, HostQueue, KernelError, KernelHandle,
    KernelRegistry, QueueProfile,
};
pub use field::{FieldDesc, FieldId, FieldTable, LocalField};
pub use grid::{IndexBox, Occupancy, SparseGrid, SparseGridBuilder};

#[cfg(feature = "gpu")]
pub use gpu::{GpuBackend, GpuInitError};
