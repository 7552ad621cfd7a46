//! Orchestration Layer
//!
//! This crate partitions a sparse block grid across compute devices and
//! runs a dependency-ordered set of stencil tasks over it:
//! - Morton-ordered domain decomposition with face-neighbor discovery
//! - Halo buffers and their exchange between neighboring partitions
//! - Task dependency graph with deterministic scheduling
//! - Concurrent per-partition step execution
//! - Simulation facade, runner and JSON configuration

#![warn(missing_docs)]

pub mod config;
pub mod distributed;
pub mod domain;
pub mod error;
pub mod executor;
pub mod geometry;
pub mod graph;
pub mod halo;
pub mod morton;
pub mod runner;
pub mod simulation;
pub mod sync;

pub use config::SimulationConfig;
pub use domain::{decompose, Decomposition, Face, LoadBalance, SubDomain};
pub use error::{Error, Result};
pub use executor::{BarrierPolicy, GraphExecutor, StepReport};
pub use graph::{DependencyGraph, Schedule};
pub use halo::{HaloConfig, HaloExchangeManager};
pub use runner::{RunnerState, SimulationRunner};
pub use simulation::{Simulation, SimulationOptions};

use std::path::Path;
use std::sync::Arc;

use grid_kernel::{DeviceBackend, HostBackend};

use crate::config::{BackendType, DeviceConfig};

/// Create a complete simulation from a configuration file
///
/// This function performs the full simulation setup pipeline:
/// 1. Load and validate the configuration
/// 2. Rasterize the geometry into a sparse occupancy
/// 3. Create the device backend and decompose the grid
/// 4. Register and initialise fields, then add tasks
/// 5. Wrap in a SimulationRunner for lifecycle management
///
/// # Example
/// ```no_run
/// use orchestrator::create_simulation;
///
/// let runner = create_simulation("configs/diffusion.json")?;
/// runner.start();
/// // ... query status, pause, resume, etc.
/// # Ok::<(), orchestrator::Error>(())
/// ```
pub fn create_simulation(config_path: impl AsRef<Path>) -> Result<SimulationRunner> {
    let config_path = config_path.as_ref();
    tracing::info!("Creating simulation from config: {}", config_path.display());

    let config = SimulationConfig::load(config_path)?;
    tracing::info!("Configuration loaded: {}", config.name);

    let simulation = build_simulation(&config)?;

    tracing::info!("Creating simulation runner...");
    let runner = SimulationRunner::new(simulation, config.dt, config.max_steps)?;
    tracing::info!("Simulation ready to start");
    Ok(runner)
}

/// Build a [`Simulation`] from a validated configuration.
pub fn build_simulation(config: &SimulationConfig) -> Result<Simulation> {
    let grid = geometry::rasterize(&config.geometry);
    let backend = create_backend(&config.devices)?;
    let mut simulation = Simulation::new(grid, backend, config.options())?;

    for field in &config.fields {
        simulation.add_field(field.desc())?;
        simulation.set_field_with(&field.name, |cell| field.initial.value_at(cell))?;
    }
    for task in &config.tasks {
        simulation.add_task(&task.name, task.reads.clone(), task.writes.clone(), task.kernel)?;
    }
    tracing::info!(
        "Simulation '{}': {} fields, {} tasks, imbalance {:.3}",
        config.name,
        config.fields.len(),
        config.tasks.len(),
        simulation.balance().imbalance
    );
    Ok(simulation)
}

// ===========================================================================
// Backend selection helper
// ===========================================================================

/// Create a device backend based on the device configuration.
///
/// For `Auto`, attempts GPU first and falls back to host memory if
/// unavailable. For `Gpu`, fails if no GPU can be initialised. For `Host`,
/// always returns a host backend.
pub fn create_backend(devices: &DeviceConfig) -> Result<Arc<dyn DeviceBackend>> {
    let host = || -> Arc<dyn DeviceBackend> {
        match &devices.peer_groups {
            Some(groups) => Arc::new(HostBackend::with_peer_groups(groups.clone())),
            None => Arc::new(HostBackend::new(devices.count)),
        }
    };

    match devices.backend {
        BackendType::Host => {
            tracing::info!("Creating host backend with {} devices", devices.count);
            Ok(host())
        }
        #[cfg(feature = "gpu")]
        BackendType::Gpu => {
            tracing::info!("Creating GPU backend with {} devices", devices.count);
            let gpu = grid_kernel::GpuBackend::new(devices.count)
                .map_err(|e| Error::BackendUnavailable(e.to_string()))?;
            Ok(Arc::new(gpu))
        }
        #[cfg(not(feature = "gpu"))]
        BackendType::Gpu => Err(Error::BackendUnavailable(
            "GPU backend requested but 'gpu' feature is not enabled".into(),
        )),
        #[cfg(feature = "gpu")]
        BackendType::Auto => {
            tracing::info!("Auto-detecting backend...");
            if grid_kernel::gpu::gpu_available() {
                match grid_kernel::GpuBackend::new(devices.count) {
                    Ok(gpu) => return Ok(Arc::new(gpu)),
                    Err(e) => tracing::warn!("GPU init failed ({e}), falling back to host"),
                }
            } else {
                tracing::info!("No GPU available, using host backend");
            }
            Ok(host())
        }
        #[cfg(not(feature = "gpu"))]
        BackendType::Auto => {
            tracing::info!("GPU feature not enabled, using host backend");
            Ok(host())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "name": "two-spheres",
        "partitions": 3,
        "devices": { "count": 2, "peer_groups": [0, 1] },
        "geometry": [
            { "type": "Sphere", "center": [0, 0, 0], "radius": 9 },
            { "type": "Box", "min": [8, -4, -4], "max": [24, 4, 4] }
        ],
        "fields": [
            { "name": "u", "halo": true,
              "initial": { "type": "Inside",
                           "shape": { "type": "Sphere", "center": [0, 0, 0], "radius": 4 },
                           "value": 1.0 } },
            { "name": "v" }
        ],
        "tasks": [
            { "name": "diffuse", "reads": ["u"], "writes": ["u"],
              "kernel": { "kind": "laplacian", "coefficient": 0.1 } },
            { "name": "sample", "reads": ["u"], "writes": ["v"], "kernel": { "kind": "copy" } }
        ],
        "dt": 0.5,
        "max_steps": 4
    }"#;

    #[test]
    fn test_build_simulation_from_config() {
        let config = SimulationConfig::from_json(CONFIG).unwrap();
        let mut sim = build_simulation(&config).unwrap();
        assert_eq!(sim.partition_count(), 3);
        let total: f32 = sim.field("u").unwrap().iter().sum();
        assert!(total > 0.0);
        sim.run(config.max_steps.unwrap(), config.dt).unwrap();
        assert_eq!(sim.steps(), 4);
    }

    #[test]
    fn test_host_backend_device_count() {
        let backend = create_backend(&DeviceConfig {
            backend: BackendType::Host,
            count: 3,
            peer_groups: None,
        })
        .unwrap();
        assert_eq!(backend.device_count(), 3);
    }

    #[cfg(not(feature = "gpu"))]
    #[test]
    fn test_gpu_without_feature_fails() {
        let err = create_backend(&DeviceConfig {
            backend: BackendType::Gpu,
            count: 1,
            peer_groups: None,
        });
        assert!(matches!(err, Err(Error::BackendUnavailable(_))));
    }
}
