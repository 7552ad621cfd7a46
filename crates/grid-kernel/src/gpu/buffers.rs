//! wgpu buffer helpers: creation, upload and staged readback.

use crate::device::DeviceError;

/// Minimum buffer size (wgpu requires non-zero buffers).
const MIN_BUF_SIZE: u64 = 4;

/// Create a zeroed storage buffer usable as copy source and destination.
pub fn create_storage_buf(device: &wgpu::Device, label: &str, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: aligned(size.max(MIN_BUF_SIZE)),
        usage: wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_SRC
            | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

/// Create a staging (MAP_READ) buffer for readback.
pub fn create_staging_buf(device: &wgpu::Device, label: &str, size: u64) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: aligned(size.max(MIN_BUF_SIZE)),
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

fn aligned(size: u64) -> u64 {
    size.div_ceil(wgpu::COPY_BUFFER_ALIGNMENT) * wgpu::COPY_BUFFER_ALIGNMENT
}

/// Fail unless `offset` and `len` satisfy wgpu's copy alignment.
pub fn check_alignment(offset: u64, len: u64) -> Result<(), DeviceError> {
    let align = wgpu::COPY_BUFFER_ALIGNMENT;
    if offset % align != 0 || len % align != 0 {
        return Err(DeviceError::Unaligned { offset, len, align });
    }
    Ok(())
}

/// Copy `out.len()` bytes at `offset` of `buffer` back to the host.
///
/// Goes through a temporary staging buffer and blocks until the map
/// completes.
pub fn read_bytes(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    buffer: &wgpu::Buffer,
    offset: u64,
    out: &mut [u8],
) -> Result<(), DeviceError> {
    let len = out.len() as u64;
    if len == 0 {
        return Ok(());
    }
    let staging = create_staging_buf(device, "halo_readback", len);
    let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
        label: Some("halo_readback_encoder"),
    });
    encoder.copy_buffer_to_buffer(buffer, offset, &staging, 0, len);
    queue.submit(Some(encoder.finish()));

    let slice = staging.slice(..len);
    let (tx, rx) = std::sync::mpsc::channel();
    slice.map_async(wgpu::MapMode::Read, move |result| {
        let _ = tx.send(result);
    });
    device.poll(wgpu::Maintain::Wait);
    let mapped = rx
        .recv()
        .map_err(|e| DeviceError::Backend(format!("readback channel closed: {e}")))?;
    mapped.map_err(|e| DeviceError::Backend(format!("buffer map failed: {e}")))?;

    let data = slice.get_mapped_range();
    out.copy_from_slice(&data[..out.len()]);
    drop(data);
    staging.unmap();
    Ok(())
}
