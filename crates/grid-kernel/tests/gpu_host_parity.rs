//! GPU vs host backend parity
//!
//! Writes the same byte patterns through `GpuBackend` and `HostBackend`,
//! copies regions with `copy_peer`, and checks both backends read back the
//! identical bytes.
//!
//! Gated behind `#[cfg(feature = "gpu")]` so it only runs when the GPU feature
//! is enabled. Skips at runtime when no adapter is present.

#![cfg(feature = "gpu")]

use grid_kernel::gpu::gpu_available;
use grid_kernel::{CopyRegion, DeviceBackend, DeviceError, DeviceId, GpuBackend, HostBackend};

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn exercise(backend: &dyn DeviceBackend) -> Vec<u8> {
    let a = backend.allocate(DeviceId(0), 64, "src").expect("allocate src");
    let b = backend.allocate(DeviceId(0), 64, "dst").expect("allocate dst");
    backend.write(a, 0, &pattern(64, 7)).expect("write src");
    backend
        .copy_peer(
            a,
            b,
            &[
                CopyRegion { src_offset: 0, dst_offset: 32, len: 16 },
                CopyRegion { src_offset: 48, dst_offset: 4, len: 8 },
            ],
        )
        .expect("peer copy");
    let mut out = vec![0u8; 64];
    backend.read(b, 0, &mut out).expect("read dst");
    backend.release(a).expect("release src");
    backend.release(b).expect("release dst");
    out
}

#[test]
fn test_gpu_matches_host_backend() {
    if !gpu_available() {
        eprintln!("no GPU adapter, skipping");
        return;
    }
    let gpu = GpuBackend::new(1).expect("GPU required");
    let host = HostBackend::new(1);
    assert_eq!(exercise(&gpu), exercise(&host));
}

#[test]
fn test_gpu_devices_are_not_peers() {
    if !gpu_available() {
        return;
    }
    let gpu = GpuBackend::new(2).expect("GPU required");
    assert!(gpu.peer_accessible(DeviceId(0), DeviceId(0)));
    assert!(!gpu.peer_accessible(DeviceId(0), DeviceId(1)));

    let a = gpu.allocate(DeviceId(0), 16, "a").unwrap();
    let b = gpu.allocate(DeviceId(1), 16, "b").unwrap();
    let err = gpu
        .copy_peer(a, b, &[CopyRegion { src_offset: 0, dst_offset: 0, len: 16 }])
        .unwrap_err();
    assert!(matches!(err, DeviceError::NotPeers { .. }));
}

#[test]
fn test_gpu_rejects_unaligned_writes() {
    if !gpu_available() {
        return;
    }
    let gpu = GpuBackend::new(1).expect("GPU required");
    let a = gpu.allocate(DeviceId(0), 16, "a").unwrap();
    assert!(matches!(
        gpu.write(a, 2, &[0u8; 4]),
        Err(DeviceError::Unaligned { .. })
    ));
}
