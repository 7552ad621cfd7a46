//! Device memory abstraction.
//!
//! Buffers are referenced through opaque [`BufferHandle`]s; callers never see
//! raw pointers. A backend reports which device pairs are mutually
//! addressable so that boundary transfers can pick a direct peer copy or fall
//! back to staging through host memory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

/// Index of a compute device within a backend.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct DeviceId(pub u32);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "device{}", self.0)
    }
}

/// Opaque reference to a buffer owned by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    device: DeviceId,
    id: u64,
}

impl BufferHandle {
    /// Create a handle. Only backends mint handles.
    pub fn new(device: DeviceId, id: u64) -> Self {
        Self { device, id }
    }

    /// Device the buffer lives on.
    pub fn device(&self) -> DeviceId {
        self.device
    }

    /// Backend-local buffer id.
    pub fn id(&self) -> u64 {
        self.id
    }
}

/// One contiguous byte range copied from a source to a destination buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRegion {
    /// Byte offset in the source buffer.
    pub src_offset: u64,
    /// Byte offset in the destination buffer.
    pub dst_offset: u64,
    /// Number of bytes.
    pub len: u64,
}

/// Errors raised by device backends.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// The device index is outside the backend's device list.
    #[error("{0} does not exist")]
    UnknownDevice(DeviceId),
    /// The handle was released or never allocated.
    #[error("buffer {} on {} is not allocated", .0.id(), .0.device())]
    InvalidHandle(BufferHandle),
    /// An access fell outside the buffer.
    #[error("access of {len} bytes at offset {offset} exceeds buffer {} of {size} bytes", handle.id())]
    OutOfBounds {
        /// Buffer accessed.
        handle: BufferHandle,
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: u64,
        /// Buffer size.
        size: u64,
    },
    /// A peer copy was requested between devices that cannot address each
    /// other.
    #[error("{src} cannot address {dst} directly")]
    NotPeers {
        /// Source device.
        src: DeviceId,
        /// Destination device.
        dst: DeviceId,
    },
    /// The backend requires aligned offsets and lengths.
    #[error("offset {offset} or length {len} is not {align}-byte aligned")]
    Unaligned {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: u64,
        /// Required alignment.
        align: u64,
    },
    /// The device stopped responding.
    #[error("{0} is unreachable")]
    Unreachable(DeviceId),
    /// Backend-specific failure.
    #[error("device backend error: {0}")]
    Backend(String),
    /// The backend could not allocate memory.
    #[error("allocation of {bytes} bytes on {device} failed: {reason}")]
    AllocationFailed {
        /// Target device.
        device: DeviceId,
        /// Requested size.
        bytes: u64,
        /// Backend-specific reason.
        reason: String,
    },
}

/// Memory operations a compute backend provides.
pub trait DeviceBackend: Send + Sync {
    /// Human-readable backend name for logs.
    fn name(&self) -> &str;

    /// Number of devices managed by the backend.
    fn device_count(&self) -> usize;

    /// Allocate a zeroed buffer of `bytes` bytes on `device`.
    fn allocate(&self, device: DeviceId, bytes: u64, label: &str)
        -> Result<BufferHandle, DeviceError>;

    /// Free a buffer.
    fn release(&self, handle: BufferHandle) -> Result<(), DeviceError>;

    /// Upload `data` at `offset`.
    fn write(&self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<(), DeviceError>;

    /// Download `out.len()` bytes starting at `offset` into host memory.
    fn read(&self, handle: BufferHandle, offset: u64, out: &mut [u8]) -> Result<(), DeviceError>;

    /// Whether memory on `src` can be copied to `dst` without staging.
    fn peer_accessible(&self, src: DeviceId, dst: DeviceId) -> bool;

    /// Copy regions from `src` to `dst` directly. Fails with
    /// [`DeviceError::NotPeers`] when the devices are not peers.
    fn copy_peer(
        &self,
        src: BufferHandle,
        dst: BufferHandle,
        regions: &[CopyRegion],
    ) -> Result<(), DeviceError>;
}

fn check_range(handle: BufferHandle, offset: u64, len: u64, size: u64) -> Result<(), DeviceError> {
    if !matches!(offset.checked_add(len), Some(end) if end <= size) {
        return Err(DeviceError::OutOfBounds {
            handle,
            offset,
            len,
            size,
        });
    }
    Ok(())
}

struct HostDevice {
    peer_group: u32,
    reachable: AtomicBool,
}

/// Backend whose "devices" are host memory arenas.
///
/// Devices in the same peer group are mutually addressable. Devices can be
/// marked unreachable to exercise transfer failure paths.
pub struct HostBackend {
    devices: Vec<HostDevice>,
    buffers: RwLock<HashMap<u64, Arc<Mutex<Vec<u8>>>>>,
    next_id: AtomicU64,
    peer_copies: AtomicU64,
}

impl HostBackend {
    /// `count` devices that are all peers of each other.
    pub fn new(count: usize) -> Self {
        Self::with_peer_groups(vec![0; count])
    }

    /// `count` devices with no peer access between distinct devices.
    pub fn isolated(count: usize) -> Self {
        Self::with_peer_groups((0..count as u32).collect())
    }

    /// One device per entry; devices sharing a group id are peers.
    pub fn with_peer_groups(groups: Vec<u32>) -> Self {
        let devices = groups
            .into_iter()
            .map(|peer_group| HostDevice {
                peer_group,
                reachable: AtomicBool::new(true),
            })
            .collect();
        Self {
            devices,
            buffers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            peer_copies: AtomicU64::new(0),
        }
    }

    /// Mark a device reachable or unreachable. Every operation touching an
    /// unreachable device fails with [`DeviceError::Unreachable`].
    pub fn set_reachable(&self, device: DeviceId, reachable: bool) {
        if let Some(d) = self.devices.get(device.0 as usize) {
            d.reachable.store(reachable, Ordering::SeqCst);
        }
    }

    /// Number of buffers currently allocated.
    pub fn live_buffers(&self) -> usize {
        self.buffers.read().len()
    }

    /// Number of successful `copy_peer` calls.
    pub fn peer_copy_count(&self) -> u64 {
        self.peer_copies.load(Ordering::Relaxed)
    }

    fn check_device(&self, device: DeviceId) -> Result<&HostDevice, DeviceError> {
        let d = self
            .devices
            .get(device.0 as usize)
            .ok_or(DeviceError::UnknownDevice(device))?;
        if !d.reachable.load(Ordering::SeqCst) {
            return Err(DeviceError::Unreachable(device));
        }
        Ok(d)
    }

    fn buffer(&self, handle: BufferHandle) -> Result<Arc<Mutex<Vec<u8>>>, DeviceError> {
        self.check_device(handle.device)?;
        self.buffers
            .read()
            .get(&handle.id)
            .cloned()
            .ok_or(DeviceError::InvalidHandle(handle))
    }
}

impl DeviceBackend for HostBackend {
    fn name(&self) -> &str {
        "host"
    }

    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn allocate(
        &self,
        device: DeviceId,
        bytes: u64,
        label: &str,
    ) -> Result<BufferHandle, DeviceError> {
        self.check_device(device)?;
        let len = usize::try_from(bytes).map_err(|_| DeviceError::AllocationFailed {
            device,
            bytes,
            reason: "size exceeds address space".into(),
        })?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.buffers
            .write()
            .insert(id, Arc::new(Mutex::new(vec![0u8; len])));
        tracing::trace!("allocated {} ({} bytes) on {}", label, bytes, device);
        Ok(BufferHandle::new(device, id))
    }

    fn release(&self, handle: BufferHandle) -> Result<(), DeviceError> {
        self.buffers
            .write()
            .remove(&handle.id)
            .map(|_| ())
            .ok_or(DeviceError::InvalidHandle(handle))
    }

    fn write(&self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let buf = self.buffer(handle)?;
        let mut mem = buf.lock();
        check_range(handle, offset, data.len() as u64, mem.len() as u64)?;
        let start = offset as usize;
        mem[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&self, handle: BufferHandle, offset: u64, out: &mut [u8]) -> Result<(), DeviceError> {
        let buf = self.buffer(handle)?;
        let mem = buf.lock();
        check_range(handle, offset, out.len() as u64, mem.len() as u64)?;
        let start = offset as usize;
        out.copy_from_slice(&mem[start..start + out.len()]);
        Ok(())
    }

    fn peer_accessible(&self, src: DeviceId, dst: DeviceId) -> bool {
        match (
            self.devices.get(src.0 as usize),
            self.devices.get(dst.0 as usize),
        ) {
            (Some(a), Some(b)) => src == dst || a.peer_group == b.peer_group,
            _ => false,
        }
    }

    fn copy_peer(
        &self,
        src: BufferHandle,
        dst: BufferHandle,
        regions: &[CopyRegion],
    ) -> Result<(), DeviceError> {
        if !self.peer_accessible(src.device, dst.device) {
            return Err(DeviceError::NotPeers {
                src: src.device,
                dst: dst.device,
            });
        }
        let src_buf = self.buffer(src)?;
        let dst_buf = self.buffer(dst)?;
        if Arc::ptr_eq(&src_buf, &dst_buf) {
            let mut mem = src_buf.lock();
            let size = mem.len() as u64;
            for r in regions {
                check_range(src, r.src_offset, r.len, size)?;
                check_range(dst, r.dst_offset, r.len, size)?;
                let (s, d, n) = (r.src_offset as usize, r.dst_offset as usize, r.len as usize);
                mem.copy_within(s..s + n, d);
            }
        } else {
            // Lock in id order so concurrent copies in opposite directions
            // cannot deadlock.
            let (src_mem, mut dst_mem) = if src.id < dst.id {
                let s = src_buf.lock();
                (s, dst_buf.lock())
            } else {
                let d = dst_buf.lock();
                (src_buf.lock(), d)
            };
            for r in regions {
                check_range(src, r.src_offset, r.len, src_mem.len() as u64)?;
                check_range(dst, r.dst_offset, r.len, dst_mem.len() as u64)?;
                let (s, d, n) = (r.src_offset as usize, r.dst_offset as usize, r.len as usize);
                dst_mem[d..d + n].copy_from_slice(&src_mem[s..s + n]);
            }
        }
        self.peer_copies.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_read_roundtrip() {
        let backend = HostBackend::new(1);
        let h = backend.allocate(DeviceId(0), 16, "buf").unwrap();
        backend.write(h, 4, &[1, 2, 3, 4]).unwrap();
        let mut out = [0u8; 8];
        backend.read(h, 0, &mut out).unwrap();
        assert_eq!(out, [0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let backend = HostBackend::new(1);
        let h = backend.allocate(DeviceId(0), 8, "buf").unwrap();
        let err = backend.write(h, 6, &[0; 4]).unwrap_err();
        assert!(matches!(err, DeviceError::OutOfBounds { offset: 6, len: 4, size: 8, .. }));
    }

    #[test]
    fn test_peer_groups() {
        let backend = HostBackend::with_peer_groups(vec![0, 0, 1]);
        assert!(backend.peer_accessible(DeviceId(0), DeviceId(1)));
        assert!(!backend.peer_accessible(DeviceId(1), DeviceId(2)));
        assert!(backend.peer_accessible(DeviceId(2), DeviceId(2)));
        assert!(!backend.peer_accessible(DeviceId(0), DeviceId(9)));

        let isolated = HostBackend::isolated(2);
        assert!(!isolated.peer_accessible(DeviceId(0), DeviceId(1)));
    }

    #[test]
    fn test_copy_peer_regions() {
        let backend = HostBackend::new(2);
        let a = backend.allocate(DeviceId(0), 8, "a").unwrap();
        let b = backend.allocate(DeviceId(1), 8, "b").unwrap();
        backend.write(a, 0, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        backend
            .copy_peer(
                a,
                b,
                &[
                    CopyRegion { src_offset: 0, dst_offset: 4, len: 2 },
                    CopyRegion { src_offset: 6, dst_offset: 0, len: 2 },
                ],
            )
            .unwrap();
        let mut out = [0u8; 8];
        backend.read(b, 0, &mut out).unwrap();
        assert_eq!(out, [7, 8, 0, 0, 1, 2, 0, 0]);
        assert_eq!(backend.peer_copy_count(), 1);
    }

    #[test]
    fn test_copy_between_non_peers_fails() {
        let backend = HostBackend::isolated(2);
        let a = backend.allocate(DeviceId(0), 4, "a").unwrap();
        let b = backend.allocate(DeviceId(1), 4, "b").unwrap();
        let err = backend
            .copy_peer(a, b, &[CopyRegion { src_offset: 0, dst_offset: 0, len: 4 }])
            .unwrap_err();
        assert!(matches!(err, DeviceError::NotPeers { .. }));
    }

    #[test]
    fn test_unreachable_device() {
        let backend = HostBackend::new(2);
        let a = backend.allocate(DeviceId(1), 4, "a").unwrap();
        backend.set_reachable(DeviceId(1), false);
        assert!(matches!(
            backend.write(a, 0, &[0; 4]),
            Err(DeviceError::Unreachable(DeviceId(1)))
        ));
        backend.set_reachable(DeviceId(1), true);
        assert!(backend.write(a, 0, &[0; 4]).is_ok());
    }

    #[test]
    fn test_release() {
        let backend = HostBackend::new(1);
        let h = backend.allocate(DeviceId(0), 4, "a").unwrap();
        assert_eq!(backend.live_buffers(), 1);
        backend.release(h).unwrap();
        assert_eq!(backend.live_buffers(), 0);
        assert!(matches!(backend.release(h), Err(DeviceError::InvalidHandle(_))));
    }
}
