//! GPU (Metal/Vulkan via wgpu) device backend.
//!
//! Each logical device is a separate `wgpu::Device` requested from the same
//! adapter. Buffers on one `wgpu::Device` can be copied with a command
//! encoder; buffers on different devices cannot address each other, so halo
//! traffic between them is staged through host memory.

pub mod buffers;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::device::{BufferHandle, CopyRegion, DeviceBackend, DeviceError, DeviceId};

/// Error returned when GPU initialization fails.
#[derive(Debug)]
pub struct GpuInitError(pub String);

impl std::fmt::Display for GpuInitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GPU initialization failed: {}", self.0)
    }
}

impl std::error::Error for GpuInitError {}

/// Check whether a GPU adapter is available.
pub fn gpu_available() -> bool {
    let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    });
    let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::HighPerformance,
        compatible_surface: None,
        force_fallback_adapter: false,
    }));
    adapter.is_some()
}

struct GpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
}

struct GpuBuffer {
    buffer: wgpu::Buffer,
    size: u64,
}

/// Device backend over wgpu.
pub struct GpuBackend {
    adapter_name: String,
    devices: Vec<GpuDevice>,
    buffers: RwLock<HashMap<u64, GpuBuffer>>,
    next_id: AtomicU64,
}

impl GpuBackend {
    /// Request `device_count` logical devices from the default high
    /// performance adapter.
    ///
    /// Returns `Err(GpuInitError)` if no suitable adapter is found, allowing
    /// callers to fall back to the host backend.
    pub fn new(device_count: usize) -> Result<Self, GpuInitError> {
        if device_count == 0 {
            return Err(GpuInitError("at least one device is required".into()));
        }
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| GpuInitError("No suitable GPU adapter found".into()))?;

        let adapter_name = adapter.get_info().name;
        tracing::info!("GPU adapter: {:?}, {} logical device(s)", adapter_name, device_count);

        let mut devices = Vec::with_capacity(device_count);
        for i in 0..device_count {
            let label = format!("grid_device_{i}");
            let (device, queue) = pollster::block_on(adapter.request_device(
                &wgpu::DeviceDescriptor {
                    label: Some(&label),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            ))
            .map_err(|e| GpuInitError(format!("Failed to create device {i}: {e}")))?;
            devices.push(GpuDevice { device, queue });
        }

        Ok(Self {
            adapter_name,
            devices,
            buffers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Name of the adapter backing every device.
    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    fn device(&self, id: DeviceId) -> Result<&GpuDevice, DeviceError> {
        self.devices
            .get(id.0 as usize)
            .ok_or(DeviceError::UnknownDevice(id))
    }
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

impl DeviceBackend for GpuBackend {
    fn name(&self) -> &str {
        "wgpu"
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
        let dev = self.device(device)?;
        buffers::check_alignment(0, bytes)?;
        let buffer = buffers::create_storage_buf(&dev.device, label, bytes);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.buffers.write().insert(id, GpuBuffer { buffer, size: bytes });
        Ok(BufferHandle::new(device, id))
    }

    fn release(&self, handle: BufferHandle) -> Result<(), DeviceError> {
        let removed = self
            .buffers
            .write()
            .remove(&handle.id())
            .ok_or(DeviceError::InvalidHandle(handle))?;
        removed.buffer.destroy();
        Ok(())
    }

    fn write(&self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<(), DeviceError> {
        let dev = self.device(handle.device())?;
        let buffers = self.buffers.read();
        let buf = buffers
            .get(&handle.id())
            .ok_or(DeviceError::InvalidHandle(handle))?;
        check_range(handle, offset, data.len() as u64, buf.size)?;
        buffers::check_alignment(offset, data.len() as u64)?;
        dev.queue.write_buffer(&buf.buffer, offset, data);
        Ok(())
    }

    fn read(&self, handle: BufferHandle, offset: u64, out: &mut [u8]) -> Result<(), DeviceError> {
        let dev = self.device(handle.device())?;
        let buffers = self.buffers.read();
        let buf = buffers
            .get(&handle.id())
            .ok_or(DeviceError::InvalidHandle(handle))?;
        check_range(handle, offset, out.len() as u64, buf.size)?;
        buffers::check_alignment(offset, out.len() as u64)?;
        buffers::read_bytes(&dev.device, &dev.queue, &buf.buffer, offset, out)
    }

    fn peer_accessible(&self, src: DeviceId, dst: DeviceId) -> bool {
        src == dst && (src.0 as usize) < self.devices.len()
    }

    fn copy_peer(
        &self,
        src: BufferHandle,
        dst: BufferHandle,
        regions: &[CopyRegion],
    ) -> Result<(), DeviceError> {
        if !self.peer_accessible(src.device(), dst.device()) {
            return Err(DeviceError::NotPeers {
                src: src.device(),
                dst: dst.device(),
            });
        }
        let dev = self.device(src.device())?;
        let buffers = self.buffers.read();
        let s = buffers.get(&src.id()).ok_or(DeviceError::InvalidHandle(src))?;
        let d = buffers.get(&dst.id()).ok_or(DeviceError::InvalidHandle(dst))?;

        let mut encoder = dev.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("halo_peer_copy"),
        });
        for r in regions {
            check_range(src, r.src_offset, r.len, s.size)?;
            check_range(dst, r.dst_offset, r.len, d.size)?;
            buffers::check_alignment(r.src_offset, r.len)?;
            buffers::check_alignment(r.dst_offset, r.len)?;
            encoder.copy_buffer_to_buffer(&s.buffer, r.src_offset, &d.buffer, r.dst_offset, r.len);
        }
        dev.queue.submit(Some(encoder.finish()));
        dev.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }
}
