//! Field descriptors and per-partition field storage.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::grid::IndexBox;

/// Declaration of a named per-cell field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDesc {
    /// Unique field name.
    pub name: String,
    /// Number of `f32` components per cell.
    #[serde(default = "default_components")]
    pub components: u32,
    /// Whether stencils reading this field need up-to-date boundary data
    /// from neighboring partitions.
    #[serde(default)]
    pub halo: bool,
}

fn default_components() -> u32 {
    1
}

impl FieldDesc {
    /// Scalar or vector field without halo exchange.
    pub fn new(name: impl Into<String>, components: u32) -> Self {
        Self {
            name: name.into(),
            components,
            halo: false,
        }
    }

    /// Mark the field as halo-dependent.
    pub fn with_halo(mut self) -> Self {
        self.halo = true;
        self
    }

    /// Bytes per cell.
    pub fn element_size(&self) -> usize {
        self.components as usize * std::mem::size_of::<f32>()
    }
}

/// Stable index of a field inside a [`FieldTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldId(pub usize);

/// Immutable snapshot of the registered fields.
///
/// A new table is built whenever a field is added or retired; running steps
/// keep the snapshot they started with.
#[derive(Debug, Clone, Default)]
pub struct FieldTable {
    fields: Vec<FieldDesc>,
    index: HashMap<String, FieldId>,
    generation: u64,
}

impl FieldTable {
    /// Build a table from descriptors. Later duplicates shadow earlier ones;
    /// callers reject duplicates before building.
    pub fn new(fields: Vec<FieldDesc>, generation: u64) -> Self {
        let index = fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.clone(), FieldId(i)))
            .collect();
        Self {
            fields,
            index,
            generation,
        }
    }

    /// Look up a descriptor by name.
    pub fn get(&self, name: &str) -> Option<&FieldDesc> {
        self.index.get(name).map(|id| &self.fields[id.0])
    }

    /// Id of a field.
    pub fn id(&self, name: &str) -> Option<FieldId> {
        self.index.get(name).copied()
    }

    /// Whether the field exists and is halo-dependent.
    pub fn is_halo(&self, name: &str) -> bool {
        self.get(name).is_some_and(|f| f.halo)
    }

    /// All descriptors in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &FieldDesc> {
        self.fields.iter()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the table has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Monotonic counter identifying this snapshot.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Copy of the descriptors, for building the next snapshot.
    pub fn to_vec(&self) -> Vec<FieldDesc> {
        self.fields.clone()
    }
}

/// Dense storage of one field over a partition's storage box (owned region
/// plus ghost layers). Cells never written read as zero.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalField {
    storage: IndexBox,
    components: u32,
    data: Vec<f32>,
}

impl LocalField {
    /// Zero-filled field covering `storage`.
    pub fn new(storage: IndexBox, components: u32) -> Self {
        let len = storage.volume() as usize * components as usize;
        Self {
            storage,
            components,
            data: vec![0.0; len],
        }
    }

    /// Box covered by the storage.
    pub fn storage_box(&self) -> IndexBox {
        self.storage
    }

    /// Components per cell.
    pub fn components(&self) -> u32 {
        self.components
    }

    fn offset(&self, cell: [i32; 3]) -> Option<usize> {
        if !self.storage.contains(cell) {
            return None;
        }
        let e = self.storage.extent();
        let x = (cell[0] - self.storage.min[0]) as usize;
        let y = (cell[1] - self.storage.min[1]) as usize;
        let z = (cell[2] - self.storage.min[2]) as usize;
        Some((x + e[0] * (y + e[1] * z)) * self.components as usize)
    }

    /// Components of `cell`, `None` outside the storage box.
    pub fn cell(&self, cell: [i32; 3]) -> Option<&[f32]> {
        let off = self.offset(cell)?;
        Some(&self.data[off..off + self.components as usize])
    }

    /// Mutable components of `cell`.
    pub fn cell_mut(&mut self, cell: [i32; 3]) -> Option<&mut [f32]> {
        let off = self.offset(cell)?;
        let n = self.components as usize;
        Some(&mut self.data[off..off + n])
    }

    /// Single component, zero outside the storage box.
    pub fn value(&self, cell: [i32; 3], component: usize) -> f32 {
        self.cell(cell)
            .and_then(|c| c.get(component).copied())
            .unwrap_or(0.0)
    }

    /// Set every stored value, ghost cells included.
    pub fn fill(&mut self, value: f32) {
        self.data.fill(value);
    }

    /// Raw storage, x fastest then y then z, components interleaved.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}
