//! Concrete [`kforge_core::KernelBackend`] implementations: driver-compute
//! (CUDA via `cudarc`), cross-vendor compute (OpenCL via `ocl`), and
//! host-shared (system compiler + `dlopen`). Each is gated behind its own
//! feature so a binary only links the driver stack it actually needs.

#[cfg(feature = "driver-compute")]
pub mod driver_compute;

#[cfg(feature = "cross-vendor")]
pub mod cross_vendor;

#[cfg(feature = "host-shared")]
pub mod host_shared;

use std::sync::Arc;

use kforge_core::{KernelBackend, Result};

/// Opens a driver-compute (CUDA) device. `platform_id` is accepted for
/// symmetry with the other backends but is always `0`.
#[cfg(feature = "driver-compute")]
pub fn open_driver_compute(device_id: i32) -> Result<Arc<dyn KernelBackend>> {
    Ok(driver_compute::DriverComputeBackend::setup(device_id)? as Arc<dyn KernelBackend>)
}

/// Opens a cross-vendor compute (OpenCL) device at `(platform_id, device_id)`.
#[cfg(feature = "cross-vendor")]
pub fn open_cross_vendor(platform_id: i32, device_id: i32) -> Result<Arc<dyn KernelBackend>> {
    Ok(cross_vendor::CrossVendorBackend::setup(platform_id, device_id)? as Arc<dyn KernelBackend>)
}

/// Opens the host-shared (CPU) backend. Platform/device ids are accepted
/// for symmetry but otherwise meaningless on this backend.
#[cfg(feature = "host-shared")]
pub fn open_host_shared(platform_id: i32, device_id: i32) -> Result<Arc<dyn KernelBackend>> {
    Ok(host_shared::HostSharedBackend::setup(platform_id, device_id)? as Arc<dyn KernelBackend>)
}
