//! Halo exchange between face-adjacent partitions
//!
//! For every halo field, each partition owns one buffer pair per face that
//! has neighbors: a send buffer holding the `thickness` owned layers next to
//! the face, and a receive buffer covering the same number of ghost layers
//! just outside it. Both use the same slab layout:
//!
//! ```text
//! index = ((layer * dv) + v) * du + u
//! ```
//!
//! where `layer` runs along the face normal from the slab minimum and
//! `(u, v)` are the in-plane axes ([`Face::in_plane_axes`]).
//!
//! A neighbor only fills the part of the ghost slab its own send slab
//! covers (its *window*), and within it only the cells it owns. Windows of
//! neighbors with interpenetrating bounds may overlap; their owned cells
//! never do. Each window carries a `written`/`consumed` pair of timelines:
//! a producer may not overwrite a window before the previous delivery was
//! consumed, and a consumer never reads a window before its next delivery
//! was written. Every delivery is also signalled on the [`SyncChannel`] of
//! that partition pair.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use grid_kernel::{
    BufferHandle, CopyRegion, DeviceBackend, DeviceError, DeviceId, FieldDesc, IndexBox,
    LocalField, Occupancy, BLOCK_SIZE,
};
use serde::Serialize;

use crate::domain::{Decomposition, Face};
use crate::sync::{SyncChannel, Timeline, WaitError};

/// Ghost layers per face unless configured otherwise.
pub const DEFAULT_HALO_THICKNESS: u32 = 2;

/// How long a partition waits on a neighbor before giving up.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Halo settings shared by every field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HaloConfig {
    /// Layers exchanged per face.
    pub thickness: u32,
    /// Upper bound on any single wait.
    pub wait_timeout: Duration,
}

impl Default for HaloConfig {
    fn default() -> Self {
        Self {
            thickness: DEFAULT_HALO_THICKNESS,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

/// Errors raised by [`HaloExchangeManager`].
#[derive(Debug, thiserror::Error)]
pub enum HaloError {
    /// The field has no halo buffers.
    #[error("field '{0}' has no halo buffers")]
    UnknownField(String),
    /// Buffers for the field already exist.
    #[error("field '{0}' already has halo buffers")]
    AlreadyAllocated(String),
    /// Thickness outside `1..=BLOCK_SIZE`.
    #[error("halo thickness {0} must be between 1 and {max}", max = BLOCK_SIZE)]
    InvalidThickness(u32),
    /// The partition-to-device map does not cover every partition.
    #[error("{devices} device assignments for {partitions} partitions")]
    DeviceCount {
        /// Partitions in the decomposition.
        partitions: usize,
        /// Entries in the device map.
        devices: usize,
    },
    /// A partition was mapped to a device the backend does not have.
    #[error("partition {partition} mapped to {device}, backend has {available} devices")]
    DeviceOutOfRange {
        /// Partition index.
        partition: usize,
        /// Requested device.
        device: DeviceId,
        /// Devices the backend reports.
        available: usize,
    },
    /// Partition index out of range.
    #[error("partition {0} does not exist")]
    UnknownPartition(usize),
    /// The partition was retired.
    #[error("partition {0} was retired")]
    PartitionRetired(usize),
    /// Transfer without a pack since the previous transfer.
    #[error("send buffer of field '{field}' on partition {partition} face {face} was not packed since its last transfer")]
    StaleSendBuffer {
        /// Field name.
        field: String,
        /// Partition index.
        partition: usize,
        /// Face.
        face: Face,
    },
    /// Local storage does not match the field's component count.
    #[error("field '{field}' on partition {partition} has {actual} components, halo expects {expected}")]
    ComponentMismatch {
        /// Field name.
        field: String,
        /// Partition index.
        partition: usize,
        /// Components of the registered field.
        expected: u32,
        /// Components of the storage passed in.
        actual: u32,
    },
    /// A wait on a neighbor exceeded the timeout.
    #[error("partition {partition} timed out on face {face} of field '{field}' waiting for partition {peer}")]
    TimedOut {
        /// Field name.
        field: String,
        /// Waiting partition.
        partition: usize,
        /// Face.
        face: Face,
        /// Partition waited on.
        peer: usize,
        /// Counter state.
        #[source]
        source: WaitError,
    },
    /// The step was aborted while waiting.
    #[error("partition {partition} aborted on face {face} of field '{field}' waiting for partition {peer}")]
    Aborted {
        /// Field name.
        field: String,
        /// Waiting partition.
        partition: usize,
        /// Face.
        face: Face,
        /// Partition waited on.
        peer: usize,
        /// Counter state.
        #[source]
        source: WaitError,
    },
    /// The device backend failed.
    #[error("device error on field '{field}' partition {partition} face {face}")]
    Device {
        /// Field name.
        field: String,
        /// Partition index.
        partition: usize,
        /// Face.
        face: Face,
        /// Backend error.
        #[source]
        source: DeviceError,
    },
}

/// Snapshot of one (partition, field, face) buffer pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HaloFaceBuffer {
    /// Face the buffers belong to.
    pub face: Face,
    /// Layers along the face normal.
    pub thickness: u32,
    /// In-plane dimensions `(du, dv)`.
    pub dims: [usize; 2],
    /// `thickness * du * dv`.
    pub voxel_count: u64,
    /// Bytes per voxel.
    pub element_size: usize,
    /// Owned layers, read by neighbors.
    pub send: BufferHandle,
    /// Ghost layers, written by neighbors.
    pub recv: BufferHandle,
    /// Deliveries received, summed over neighbor windows.
    pub written: u64,
    /// Deliveries consumed, summed over neighbor windows.
    pub consumed: u64,
    /// Partitions filling this receive buffer.
    pub peers: Vec<usize>,
}

/// Exchange counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferStats {
    /// Send buffers packed.
    pub packs: u64,
    /// Receive buffers unpacked.
    pub unpacks: u64,
    /// Window copies done device to device.
    pub direct_transfers: u64,
    /// Window copies staged through host memory.
    pub staged_transfers: u64,
    /// Bytes moved device to device.
    pub direct_bytes: u64,
    /// Bytes moved through host memory.
    pub staged_bytes: u64,
}

#[derive(Debug, Default)]
struct TransferCounters {
    packs: AtomicU64,
    unpacks: AtomicU64,
    direct_transfers: AtomicU64,
    staged_transfers: AtomicU64,
    direct_bytes: AtomicU64,
    staged_bytes: AtomicU64,
}

/// Part of a ghost slab filled by one neighbor.
#[derive(Debug)]
struct Window {
    peer: usize,
    /// Cells of the region owned by `peer`.
    cells: Vec<[i32; 3]>,
    /// Copies of those cells from the peer's send slab into the ghost slab.
    runs: Vec<CopyRegion>,
    bytes: u64,
    written: Timeline,
    consumed: Timeline,
}

#[derive(Debug)]
struct FaceSlot {
    device: DeviceId,
    send_slab: IndexBox,
    ghost_slab: IndexBox,
    bytes: u64,
    send: BufferHandle,
    recv: BufferHandle,
    packed: AtomicU64,
    sent: AtomicU64,
    windows: Vec<Window>,
}

#[derive(Debug)]
struct FieldHalo {
    desc: FieldDesc,
    slots: HashMap<(usize, Face), FaceSlot>,
}

/// Owned layers of `bounds` next to `face`.
fn send_slab(bounds: &IndexBox, face: Face, thickness: i32) -> IndexBox {
    let axis = face.axis();
    let mut slab = *bounds;
    if face.is_positive() {
        slab.min[axis] = bounds.max[axis] - thickness + 1;
    } else {
        slab.max[axis] = bounds.min[axis] + thickness - 1;
    }
    slab
}

/// Ghost layers just outside `bounds` beyond `face`.
fn ghost_slab(bounds: &IndexBox, face: Face, thickness: i32) -> IndexBox {
    let axis = face.axis();
    let mut slab = *bounds;
    if face.is_positive() {
        slab.min[axis] = bounds.max[axis] + 1;
        slab.max[axis] = bounds.max[axis] + thickness;
    } else {
        slab.min[axis] = bounds.min[axis] - thickness;
        slab.max[axis] = bounds.min[axis] - 1;
    }
    slab
}

/// Voxel index of `cell` in a slab normal to `axis`.
fn slab_index(slab: &IndexBox, axis: usize, cell: [i32; 3]) -> usize {
    let (u, v) = Face::new(axis, true).in_plane_axes();
    let e = slab.extent();
    let layer = (cell[axis] - slab.min[axis]) as usize;
    let cu = (cell[u] - slab.min[u]) as usize;
    let cv = (cell[v] - slab.min[v]) as usize;
    (layer * e[v] + cv) * e[u] + cu
}

/// Contiguous `u`-runs of the cells of `region` accepted by `keep`, copied
/// from `src` slab layout to `dst`.
fn row_runs(
    region: &IndexBox,
    axis: usize,
    src: &IndexBox,
    dst: &IndexBox,
    element_size: u64,
    keep: impl Fn([i32; 3]) -> bool,
) -> Vec<CopyRegion> {
    let (u, v) = Face::new(axis, true).in_plane_axes();
    let mut runs = Vec::with_capacity(region.extent()[axis] * region.extent()[v]);
    for layer in region.min[axis]..=region.max[axis] {
        for row in region.min[v]..=region.max[v] {
            let mut first: Option<[i32; 3]> = None;
            for col in region.min[u]..=region.max[u] + 1 {
                let mut cell = [0; 3];
                cell[axis] = layer;
                cell[v] = row;
                cell[u] = col;
                let inside = col <= region.max[u] && keep(cell);
                match first {
                    None if inside => first = Some(cell),
                    Some(start) if !inside => {
                        runs.push(CopyRegion {
                            src_offset: slab_index(src, axis, start) as u64 * element_size,
                            dst_offset: slab_index(dst, axis, start) as u64 * element_size,
                            len: (col - start[u]) as u64 * element_size,
                        });
                        first = None;
                    }
                    _ => {}
                }
            }
        }
    }
    runs
}

/// Copy `regions` through host memory: one read spanning every source run,
/// then one write per run.
fn staged_copy(
    backend: &dyn DeviceBackend,
    src: BufferHandle,
    dst: BufferHandle,
    regions: &[CopyRegion],
) -> Result<(), DeviceError> {
    let Some(start) = regions.iter().map(|r| r.src_offset).min() else {
        return Ok(());
    };
    let end = regions
        .iter()
        .map(|r| r.src_offset + r.len)
        .max()
        .unwrap_or(start);
    let mut staging = vec![0u8; (end - start) as usize];
    backend.read(src, start, &mut staging)?;
    for r in regions {
        let from = (r.src_offset - start) as usize;
        backend.write(dst, r.dst_offset, &staging[from..from + r.len as usize])?;
    }
    Ok(())
}

/// Assign partitions to devices round-robin.
pub fn round_robin_devices(partitions: usize, device_count: usize) -> Vec<DeviceId> {
    (0..partitions)
        .map(|p| DeviceId((p % device_count.max(1)) as u32))
        .collect()
}

/// Allocates halo buffers and drives pack, transfer and unpack.
///
/// All exchange operations take `&self` and are called concurrently from
/// partition threads; allocation and retirement take `&mut self` and happen
/// between steps.
pub struct HaloExchangeManager {
    decomposition: Arc<Decomposition>,
    occupancy: Arc<dyn Occupancy + Send + Sync>,
    backend: Arc<dyn DeviceBackend>,
    devices: Vec<DeviceId>,
    config: HaloConfig,
    fields: HashMap<String, FieldHalo>,
    channels: HashMap<(usize, usize), SyncChannel>,
    retired: Vec<bool>,
    abort: AtomicBool,
    counters: TransferCounters,
}

impl HaloExchangeManager {
    /// Manager for `decomposition` with partition `p` on `devices[p]`. One
    /// channel is created per ordered pair of face neighbors.
    pub fn new(
        decomposition: Arc<Decomposition>,
        occupancy: Arc<dyn Occupancy + Send + Sync>,
        backend: Arc<dyn DeviceBackend>,
        devices: Vec<DeviceId>,
        config: HaloConfig,
    ) -> Result<Self, HaloError> {
        if config.thickness == 0 || config.thickness > BLOCK_SIZE as u32 {
            return Err(HaloError::InvalidThickness(config.thickness));
        }
        let partitions = decomposition.partition_count();
        if devices.len() != partitions {
            return Err(HaloError::DeviceCount {
                partitions,
                devices: devices.len(),
            });
        }
        let available = backend.device_count();
        if let Some((partition, device)) = devices
            .iter()
            .enumerate()
            .find(|(_, d)| d.0 as usize >= available)
        {
            return Err(HaloError::DeviceOutOfRange {
                partition,
                device: *device,
                available,
            });
        }

        let mut channels = HashMap::new();
        for sd in decomposition.subdomains().iter() {
            for n in &sd.neighbors {
                channels.insert((sd.index, n.partition), SyncChannel::new(sd.index, n.partition));
            }
        }
        tracing::debug!(
            "Halo manager on '{}': {} partitions, {} channels, thickness {}",
            backend.name(),
            partitions,
            channels.len(),
            config.thickness
        );

        Ok(Self {
            decomposition,
            occupancy,
            backend,
            devices,
            config,
            fields: HashMap::new(),
            channels,
            retired: vec![false; partitions],
            abort: AtomicBool::new(false),
            counters: TransferCounters::default(),
        })
    }

    /// Active settings.
    pub fn config(&self) -> &HaloConfig {
        &self.config
    }

    /// Device of each partition.
    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    /// Whether `field` has buffers.
    pub fn is_allocated(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Channel carrying traffic from `from` to `to`.
    pub fn channel(&self, from: usize, to: usize) -> Option<&SyncChannel> {
        self.channels.get(&(from, to))
    }

    /// Allocate send and receive buffers for every partition face with at
    /// least one live neighbor. All or nothing: on failure every buffer
    /// allocated by this call is released. Returns the bytes allocated.
    pub fn allocate(&mut self, desc: &FieldDesc) -> Result<u64, HaloError> {
        if self.fields.contains_key(&desc.name) {
            return Err(HaloError::AlreadyAllocated(desc.name.clone()));
        }
        let t = self.config.thickness as i32;
        let element_size = desc.element_size() as u64;
        let mut slots: HashMap<(usize, Face), FaceSlot> = HashMap::new();

        for sd in self.decomposition.subdomains().iter() {
            if self.retired[sd.index] {
                continue;
            }
            let Some(bounds) = sd.bounds else { continue };
            for face in sd.neighbor_faces() {
                let ghost = ghost_slab(&bounds, face, t);
                let windows: Vec<Window> = sd
                    .neighbors_on(face)
                    .filter(|n| !self.retired[n.partition])
                    .filter_map(|n| {
                        let peer_bounds = self.decomposition.subdomain(n.partition)?.bounds?;
                        let peer_send = send_slab(&peer_bounds, face.opposite(), t);
                        let region = ghost.intersect(&peer_send)?;
                        let owned =
                            |c: [i32; 3]| self.decomposition.owner_of_cell(c) == Some(n.partition);
                        let cells: Vec<[i32; 3]> = region.cells().filter(|&c| owned(c)).collect();
                        let runs =
                            row_runs(&region, face.axis(), &peer_send, &ghost, element_size, owned);
                        Some(Window {
                            peer: n.partition,
                            bytes: cells.len() as u64 * element_size,
                            cells,
                            runs,
                            written: Timeline::new(),
                            consumed: Timeline::new(),
                        })
                    })
                    .collect();
                if windows.is_empty() {
                    continue;
                }

                let device = self.devices[sd.index];
                let bytes = ghost.volume() * element_size;
                let label = format!("halo:{}:p{}:{}", desc.name, sd.index, face);
                let device_error = |source| HaloError::Device {
                    field: desc.name.clone(),
                    partition: sd.index,
                    face,
                    source,
                };
                let send = match self.backend.allocate(device, bytes, &format!("{label}:send")) {
                    Ok(h) => h,
                    Err(e) => {
                        self.release_slots(slots.into_values());
                        return Err(device_error(e));
                    }
                };
                let recv = match self.backend.allocate(device, bytes, &format!("{label}:recv")) {
                    Ok(h) => h,
                    Err(e) => {
                        if let Err(release) = self.backend.release(send) {
                            tracing::warn!("Failed to release halo buffer: {}", release);
                        }
                        self.release_slots(slots.into_values());
                        return Err(device_error(e));
                    }
                };
                slots.insert(
                    (sd.index, face),
                    FaceSlot {
                        device,
                        send_slab: send_slab(&bounds, face, t),
                        ghost_slab: ghost,
                        bytes,
                        send,
                        recv,
                        packed: AtomicU64::new(0),
                        sent: AtomicU64::new(0),
                        windows,
                    },
                );
            }
        }

        let total: u64 = slots.values().map(|s| 2 * s.bytes).sum();
        tracing::debug!(
            "Allocated halo for '{}': {} face slots, {} bytes",
            desc.name,
            slots.len(),
            total
        );
        self.fields.insert(
            desc.name.clone(),
            FieldHalo {
                desc: desc.clone(),
                slots,
            },
        );
        Ok(total)
    }

    /// Release every buffer of `field`. Returns the bytes freed.
    pub fn retire_field(&mut self, field: &str) -> Result<u64, HaloError> {
        let halo = self
            .fields
            .remove(field)
            .ok_or_else(|| HaloError::UnknownField(field.to_string()))?;
        let freed = halo.slots.values().map(|s| 2 * s.bytes).sum();
        self.release_slots(halo.slots.into_values());
        tracing::debug!("Retired halo for '{}' ({} bytes)", field, freed);
        Ok(freed)
    }

    /// Release every buffer of `partition` and stop its neighbors from
    /// exchanging with it. Neighbor faces left without any window are
    /// released too.
    pub fn retire_partition(&mut self, partition: usize) -> Result<(), HaloError> {
        self.check_partition(partition)?;
        let mut released = Vec::new();
        for halo in self.fields.values_mut() {
            let keys: Vec<(usize, Face)> = halo.slots.keys().copied().collect();
            for key in keys {
                let drop_slot = if key.0 == partition {
                    true
                } else if let Some(slot) = halo.slots.get_mut(&key) {
                    slot.windows.retain(|w| w.peer != partition);
                    slot.windows.is_empty()
                } else {
                    false
                };
                if drop_slot {
                    released.extend(halo.slots.remove(&key));
                }
            }
        }
        self.release_slots(released);
        self.channels
            .retain(|&(from, to), _| from != partition && to != partition);
        self.retired[partition] = true;
        tracing::info!("Retired partition {} from halo exchange", partition);
        Ok(())
    }

    fn release_slots(&self, slots: impl IntoIterator<Item = FaceSlot>) {
        for slot in slots {
            for handle in [slot.send, slot.recv] {
                if let Err(e) = self.backend.release(handle) {
                    tracing::warn!("Failed to release halo buffer: {}", e);
                }
            }
        }
    }

    /// Bytes held by send and receive buffers of every field.
    pub fn allocated_bytes(&self) -> u64 {
        self.fields
            .values()
            .flat_map(|h| h.slots.values())
            .map(|s| 2 * s.bytes)
            .sum()
    }

    /// Snapshot of the buffers of (`field`, `partition`, `face`), `None`
    /// when that face has no traffic.
    pub fn face_buffer(&self, field: &str, partition: usize, face: Face) -> Option<HaloFaceBuffer> {
        let halo = self.fields.get(field)?;
        let slot = halo.slots.get(&(partition, face))?;
        let (u, v) = face.in_plane_axes();
        let e = slot.ghost_slab.extent();
        Some(HaloFaceBuffer {
            face,
            thickness: self.config.thickness,
            dims: [e[u], e[v]],
            voxel_count: slot.ghost_slab.volume(),
            element_size: halo.desc.element_size(),
            send: slot.send,
            recv: slot.recv,
            written: slot.windows.iter().map(|w| w.written.value()).sum(),
            consumed: slot.windows.iter().map(|w| w.consumed.value()).sum(),
            peers: slot.windows.iter().map(|w| w.peer).collect(),
        })
    }

    /// Counters since construction.
    pub fn stats(&self) -> TransferStats {
        let c = &self.counters;
        TransferStats {
            packs: c.packs.load(Ordering::Relaxed),
            unpacks: c.unpacks.load(Ordering::Relaxed),
            direct_transfers: c.direct_transfers.load(Ordering::Relaxed),
            staged_transfers: c.staged_transfers.load(Ordering::Relaxed),
            direct_bytes: c.direct_bytes.load(Ordering::Relaxed),
            staged_bytes: c.staged_bytes.load(Ordering::Relaxed),
        }
    }

    fn field(&self, name: &str) -> Result<&FieldHalo, HaloError> {
        self.fields
            .get(name)
            .ok_or_else(|| HaloError::UnknownField(name.to_string()))
    }

    fn check_partition(&self, partition: usize) -> Result<(), HaloError> {
        match self.retired.get(partition) {
            None => Err(HaloError::UnknownPartition(partition)),
            Some(true) => Err(HaloError::PartitionRetired(partition)),
            Some(false) => Ok(()),
        }
    }

    fn check_components(
        halo: &FieldHalo,
        partition: usize,
        local: &LocalField,
    ) -> Result<(), HaloError> {
        if local.components() != halo.desc.components {
            return Err(HaloError::ComponentMismatch {
                field: halo.desc.name.clone(),
                partition,
                expected: halo.desc.components,
                actual: local.components(),
            });
        }
        Ok(())
    }

    fn deadline(&self) -> Instant {
        let now = Instant::now();
        now.checked_add(self.config.wait_timeout).unwrap_or(now)
    }

    fn wait_failed(field: &str, partition: usize, face: Face, peer: usize, err: WaitError) -> HaloError {
        let field = field.to_string();
        match err {
            WaitError::TimedOut { .. } => HaloError::TimedOut {
                field,
                partition,
                face,
                peer,
                source: err,
            },
            WaitError::Aborted { .. } => HaloError::Aborted {
                field,
                partition,
                face,
                peer,
                source: err,
            },
        }
    }

    /// Gather the owned layers next to `face` into the send buffer. Cells
    /// that are inactive, or owned by another partition, pack as zero.
    /// No-op when the face has no neighbor.
    pub fn pack(
        &self,
        field: &str,
        partition: usize,
        face: Face,
        local: &LocalField,
    ) -> Result<(), HaloError> {
        let halo = self.field(field)?;
        self.check_partition(partition)?;
        let Some(slot) = halo.slots.get(&(partition, face)) else {
            return Ok(());
        };
        Self::check_components(halo, partition, local)?;

        let n = halo.desc.components as usize;
        let axis = face.axis();
        let mut values = vec![0.0f32; slot.send_slab.volume() as usize * n];
        for cell in slot.send_slab.cells() {
            if self.decomposition.owner_of_cell(cell) != Some(partition)
                || !self.occupancy.is_active(cell)
            {
                continue;
            }
            if let Some(src) = local.cell(cell) {
                let i = slab_index(&slot.send_slab, axis, cell) * n;
                values[i..i + n].copy_from_slice(src);
            }
        }
        self.backend
            .write(slot.send, 0, bytemuck::cast_slice(&values))
            .map_err(|source| HaloError::Device {
                field: field.to_string(),
                partition,
                face,
                source,
            })?;
        slot.packed.fetch_add(1, Ordering::SeqCst);
        self.counters.packs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Copy the owned cells of the send buffer into every neighbor's receive
    /// window on the opposite face, then signal each neighbor's channel.
    ///
    /// Devices that can address each other copy directly; others go through
    /// a host staging buffer. Fails with [`HaloError::StaleSendBuffer`] if
    /// the face was not packed since its last transfer. No-op when the face
    /// has no neighbor.
    pub fn transfer(&self, field: &str, partition: usize, face: Face) -> Result<(), HaloError> {
        let halo = self.field(field)?;
        self.check_partition(partition)?;
        let Some(slot) = halo.slots.get(&(partition, face)) else {
            return Ok(());
        };
        let packed = slot.packed.load(Ordering::SeqCst);
        if packed <= slot.sent.load(Ordering::SeqCst) {
            return Err(HaloError::StaleSendBuffer {
                field: field.to_string(),
                partition,
                face,
            });
        }

        for out in &slot.windows {
            let Some(target) = halo.slots.get(&(out.peer, face.opposite())) else {
                continue;
            };
            let Some(window) = target.windows.iter().find(|w| w.peer == partition) else {
                continue;
            };

            let delivered = window.written.value();
            window
                .consumed
                .wait_for(delivered, self.deadline(), &self.abort)
                .map_err(|e| Self::wait_failed(field, partition, face, out.peer, e))?;

            let bytes = window.bytes;
            let direct = self.backend.peer_accessible(slot.device, target.device);
            let copied = if window.runs.is_empty() {
                Ok(())
            } else if direct {
                self.backend.copy_peer(slot.send, target.recv, &window.runs)
            } else {
                staged_copy(self.backend.as_ref(), slot.send, target.recv, &window.runs)
            };
            copied.map_err(|source| HaloError::Device {
                field: field.to_string(),
                partition,
                face,
                source,
            })?;

            if direct {
                self.counters.direct_transfers.fetch_add(1, Ordering::Relaxed);
                self.counters.direct_bytes.fetch_add(bytes, Ordering::Relaxed);
            } else {
                tracing::trace!(
                    "Staged {} bytes of '{}' from partition {} to {}",
                    bytes,
                    field,
                    partition,
                    out.peer
                );
                self.counters.staged_transfers.fetch_add(1, Ordering::Relaxed);
                self.counters.staged_bytes.fetch_add(bytes, Ordering::Relaxed);
            }

            window.written.advance();
            if let Some(channel) = self.channels.get(&(partition, out.peer)) {
                channel.signal();
            }
        }
        slot.sent.store(packed, Ordering::SeqCst);
        Ok(())
    }

    /// Wait for every neighbor's next delivery of `field` on `face`, then
    /// scatter each neighbor's owned cells from the receive buffer into the
    /// ghost cells of `local`. No-op when the face has no neighbor.
    pub fn unpack(
        &self,
        field: &str,
        partition: usize,
        face: Face,
        local: &mut LocalField,
    ) -> Result<(), HaloError> {
        let halo = self.field(field)?;
        self.check_partition(partition)?;
        let Some(slot) = halo.slots.get(&(partition, face)) else {
            return Ok(());
        };
        Self::check_components(halo, partition, local)?;

        for window in &slot.windows {
            let failed = |e| Self::wait_failed(field, partition, face, window.peer, e);
            window
                .written
                .wait_for(window.consumed.value() + 1, self.deadline(), &self.abort)
                .map_err(failed)?;
            if let Some(channel) = self.channels.get(&(window.peer, partition)) {
                channel
                    .wait_next(self.deadline(), &self.abort)
                    .map_err(failed)?;
            }
        }

        let n = halo.desc.components as usize;
        let mut values = vec![0.0f32; slot.ghost_slab.volume() as usize * n];
        self.backend
            .read(slot.recv, 0, bytemuck::cast_slice_mut(&mut values))
            .map_err(|source| HaloError::Device {
                field: field.to_string(),
                partition,
                face,
                source,
            })?;

        let axis = face.axis();
        for window in &slot.windows {
            for &cell in &window.cells {
                let i = slab_index(&slot.ghost_slab, axis, cell) * n;
                if let Some(dst) = local.cell_mut(cell) {
                    dst.copy_from_slice(&values[i..i + n]);
                }
            }
            window.consumed.advance();
        }
        self.counters.unpacks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Full exchange of `field` for one partition: pack every neighbor
    /// face, transfer each, then unpack each. Returns the faces exchanged.
    pub fn exchange(
        &self,
        field: &str,
        partition: usize,
        local: &mut LocalField,
    ) -> Result<usize, HaloError> {
        let halo = self.field(field)?;
        self.check_partition(partition)?;
        let faces: Vec<Face> = Face::ALL
            .into_iter()
            .filter(|f| halo.slots.contains_key(&(partition, *f)))
            .collect();
        for &face in &faces {
            self.pack(field, partition, face, local)?;
        }
        for &face in &faces {
            self.transfer(field, partition, face)?;
        }
        for &face in &faces {
            self.unpack(field, partition, face, local)?;
        }
        Ok(faces.len())
    }

    /// Clear the abort flag before a step.
    pub fn begin_step(&self) {
        self.abort.store(false, Ordering::SeqCst);
    }

    /// Fail every current and future wait until [`begin_step`] or
    /// [`resynchronize`] runs. Called by a partition that failed mid-step so
    /// its neighbors do not block on it.
    ///
    /// [`begin_step`]: Self::begin_step
    /// [`resynchronize`]: Self::resynchronize
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
        for channel in self.channels.values() {
            channel.interrupt();
        }
        for slot in self.fields.values().flat_map(|h| h.slots.values()) {
            for window in &slot.windows {
                window.written.interrupt();
                window.consumed.interrupt();
            }
        }
    }

    /// Whether the current step was aborted.
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Bring every counter back to a consistent state after an aborted
    /// step: pending claims are dropped, undelivered windows count as
    /// consumed, and every send buffer needs a fresh pack.
    pub fn resynchronize(&self) {
        for channel in self.channels.values() {
            channel.resynchronize();
        }
        for slot in self.fields.values().flat_map(|h| h.slots.values()) {
            slot.sent
                .store(slot.packed.load(Ordering::SeqCst), Ordering::SeqCst);
            for window in &slot.windows {
                window.consumed.raise_to(window.written.value());
            }
        }
        self.abort.store(false, Ordering::SeqCst);
        tracing::debug!("Halo counters resynchronized");
    }
}

impl Drop for HaloExchangeManager {
    fn drop(&mut self) {
        let fields: Vec<FieldHalo> = self.fields.drain().map(|(_, h)| h).collect();
        for halo in fields {
            self.release_slots(halo.slots.into_values());
        }
    }
}
