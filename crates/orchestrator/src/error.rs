//! Crate-wide error type.

use grid_kernel::{DeviceError, KernelError};

use crate::config::ConfigError;
use crate::domain::DecomposeError;
use crate::executor::{FieldError, StepError};
use crate::graph::GraphError;
use crate::halo::HaloError;

/// Any failure surfaced by the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid or unreadable configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Decomposition rejected its input.
    #[error(transparent)]
    Decompose(#[from] DecomposeError),
    /// Halo allocation or exchange failed.
    #[error(transparent)]
    Halo(#[from] HaloError),
    /// The task graph is invalid.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// A step was rejected or aborted.
    #[error(transparent)]
    Step(#[from] StepError),
    /// A field operation failed.
    #[error(transparent)]
    Field(#[from] FieldError),
    /// A device backend call failed outside of a step.
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// A kernel failed outside of a step.
    #[error(transparent)]
    Kernel(#[from] KernelError),
    /// The requested compute backend cannot be created.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    /// The runner thread could not be started.
    #[error("failed to start runner thread: {0}")]
    Thread(std::io::Error),
    /// The runner thread panicked.
    #[error("simulation thread panicked")]
    RunnerPanicked,
}

/// Result alias using [`Error`].
pub type Result<T, E = Error> = std::result::Result<T, E>;
