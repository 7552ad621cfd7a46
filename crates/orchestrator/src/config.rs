//! Configuration parsing and validation for partitioned grid simulations

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use grid_kernel::{BuiltinKernel, FieldDesc, BLOCK_SIZE};

use crate::executor::BarrierPolicy;
use crate::geometry::Shape;
use crate::halo::{HaloConfig, DEFAULT_HALO_THICKNESS};
use crate::simulation::{SimulationOptions, DEFAULT_IMBALANCE_TOLERANCE};

/// Errors raised while loading or validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {}: {source}", .path.display())]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The JSON is malformed or has the wrong shape.
    #[error("failed to parse config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    /// `partitions` is zero.
    #[error("partitions must be at least 1")]
    ZeroPartitions,
    /// `halo_thickness` outside `1..=BLOCK_SIZE`.
    #[error("halo_thickness {0} must be between 1 and {max}", max = BLOCK_SIZE)]
    InvalidThickness(u32),
    /// `imbalance_tolerance` is negative.
    #[error("imbalance_tolerance must be non-negative, got {0}")]
    NegativeTolerance(f64),
    /// `dt` is not a positive finite number.
    #[error("dt must be positive, got {0}")]
    InvalidTimestep(f32),
    /// Two fields share a name.
    #[error("field '{0}' is declared twice")]
    DuplicateField(String),
    /// No shapes, so no active cells.
    #[error("geometry must contain at least one shape")]
    EmptyGeometry,
    /// `devices.count` is zero.
    #[error("devices.count must be at least 1")]
    NoDevices,
    /// `devices.peer_groups` does not have one entry per device.
    #[error("devices.peer_groups has {groups} entries for {count} devices")]
    PeerGroupMismatch {
        /// Entries given.
        groups: usize,
        /// Devices configured.
        count: usize,
    },
    /// A task references an undeclared field.
    #[error("task '{task}' references undeclared field '{field}'")]
    UnknownField {
        /// Task name.
        task: String,
        /// Field name.
        field: String,
    },
}

/// Main simulation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Human-readable simulation name
    pub name: String,
    /// Number of sub-domains
    #[serde(default = "default_partitions")]
    pub partitions: usize,
    /// Ghost layers per face
    #[serde(default = "default_halo_thickness")]
    pub halo_thickness: u32,
    /// Imbalance above `1 + tolerance` is logged
    #[serde(default = "default_imbalance_tolerance")]
    pub imbalance_tolerance: f64,
    /// Upper bound on any halo wait (milliseconds)
    #[serde(default = "default_halo_timeout_ms")]
    pub halo_timeout_ms: u64,
    /// Barrier insertion between tasks
    #[serde(default)]
    pub barrier_policy: BarrierPolicy,
    /// Device layout
    #[serde(default)]
    pub devices: DeviceConfig,
    /// Shapes whose union is the active region
    pub geometry: Vec<Shape>,
    /// Fields to register
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
    /// Tasks, in declaration order
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
    /// Step size
    #[serde(default = "default_dt")]
    pub dt: f32,
    /// Stop after this many steps
    pub max_steps: Option<u64>,
}

/// Which device backend to create
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackendType {
    /// Host memory arenas
    #[default]
    Host,
    /// wgpu devices (requires the `gpu` feature)
    Gpu,
    /// GPU if available, host otherwise
    Auto,
}

/// Device layout
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Backend type
    #[serde(default)]
    pub backend: BackendType,
    /// Number of devices
    #[serde(default = "default_device_count")]
    pub count: usize,
    /// Peer group per device (host backend only); all peers when absent
    #[serde(default)]
    pub peer_groups: Option<Vec<u32>>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::default(),
            count: default_device_count(),
            peer_groups: None,
        }
    }
}

/// One field
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConfig {
    /// Field name
    pub name: String,
    /// Components per cell
    #[serde(default = "default_components")]
    pub components: u32,
    /// Whether neighbors' values are needed at partition boundaries
    #[serde(default)]
    pub halo: bool,
    /// Initial values
    #[serde(default)]
    pub initial: InitialCondition,
}

impl FieldConfig {
    /// Descriptor for registration.
    pub fn desc(&self) -> FieldDesc {
        let desc = FieldDesc::new(self.name.clone(), self.components);
        if self.halo {
            desc.with_halo()
        } else {
            desc
        }
    }
}

/// How a field is initialised
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InitialCondition {
    /// Same value everywhere
    Constant {
        /// Value
        value: f32,
    },
    /// `value` inside `shape`, `background` elsewhere
    Inside {
        /// Region
        shape: Shape,
        /// Value inside
        value: f32,
        /// Value outside
        #[serde(default)]
        background: f32,
    },
    /// `scale * cell[axis]`
    Ramp {
        /// Axis index 0..3
        axis: usize,
        /// Slope per cell
        scale: f32,
    },
}

impl Default for InitialCondition {
    fn default() -> Self {
        InitialCondition::Constant { value: 0.0 }
    }
}

impl InitialCondition {
    /// Value at `cell`.
    pub fn value_at(&self, cell: [i32; 3]) -> f32 {
        match self {
            InitialCondition::Constant { value } => *value,
            InitialCondition::Inside {
                shape,
                value,
                background,
            } => {
                if shape.contains_cell(cell) {
                    *value
                } else {
                    *background
                }
            }
            InitialCondition::Ramp { axis, scale } => {
                *scale * cell.get(*axis).copied().unwrap_or(0) as f32
            }
        }
    }
}

/// One task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Task name
    pub name: String,
    /// Fields read
    #[serde(default)]
    pub reads: Vec<String>,
    /// Fields written
    #[serde(default)]
    pub writes: Vec<String>,
    /// Built-in kernel bound to the task
    pub kernel: BuiltinKernel,
}

// Default values
fn default_partitions() -> usize {
    1
}

fn default_halo_thickness() -> u32 {
    DEFAULT_HALO_THICKNESS
}

fn default_imbalance_tolerance() -> f64 {
    DEFAULT_IMBALANCE_TOLERANCE
}

fn default_halo_timeout_ms() -> u64 {
    10_000
}

fn default_dt() -> f32 {
    0.1
}

fn default_device_count() -> usize {
    1
}

fn default_components() -> u32 {
    1
}

impl SimulationConfig {
    /// Load configuration from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents)
    }

    /// Parse and validate a JSON document
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: SimulationConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.partitions == 0 {
            return Err(ConfigError::ZeroPartitions);
        }
        if self.halo_thickness == 0 || self.halo_thickness > BLOCK_SIZE as u32 {
            return Err(ConfigError::InvalidThickness(self.halo_thickness));
        }
        if self.imbalance_tolerance < 0.0 {
            return Err(ConfigError::NegativeTolerance(self.imbalance_tolerance));
        }
        if !(self.dt.is_finite() && self.dt > 0.0) {
            return Err(ConfigError::InvalidTimestep(self.dt));
        }
        if self.geometry.is_empty() {
            return Err(ConfigError::EmptyGeometry);
        }

        if self.devices.count == 0 {
            return Err(ConfigError::NoDevices);
        }
        if let Some(groups) = &self.devices.peer_groups {
            if groups.len() != self.devices.count {
                return Err(ConfigError::PeerGroupMismatch {
                    groups: groups.len(),
                    count: self.devices.count,
                });
            }
        }

        let mut names = HashSet::new();
        for f in &self.fields {
            if !names.insert(f.name.as_str()) {
                return Err(ConfigError::DuplicateField(f.name.clone()));
            }
        }
        for t in &self.tasks {
            if let Some(field) = t.reads.iter().chain(&t.writes).find(|f| !names.contains(f.as_str())) {
                return Err(ConfigError::UnknownField {
                    task: t.name.clone(),
                    field: field.clone(),
                });
            }
        }

        Ok(())
    }

    /// Halo settings
    pub fn halo(&self) -> HaloConfig {
        HaloConfig {
            thickness: self.halo_thickness,
            wait_timeout: Duration::from_millis(self.halo_timeout_ms),
        }
    }

    /// Simulation construction settings
    pub fn options(&self) -> SimulationOptions {
        SimulationOptions {
            partitions: self.partitions,
            halo: self.halo(),
            barrier_policy: self.barrier_policy,
            imbalance_tolerance: self.imbalance_tolerance,
        }
    }
}
