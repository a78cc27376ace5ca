//! Backend-agnostic runtime substrate for the kernelforge JIT compute-kernel
//! runtime: the Device/Kernel/Memory model, the cache coordinator, and the
//! trait every backend implements.

pub mod backend;
pub mod cache;
mod device;
mod error;
mod geometry;
mod invariants;
mod kernel;
mod kernel_info;
mod memory;
pub mod registry;
mod util;

pub use backend::{CompilerSettings, EventId, KernelBackend, KernelId, MemoryId, StreamId};
pub use device::Device;
pub use error::{Error, Result};
pub use geometry::{BackendKind, Dim3, DeviceCategory, KernelArg, Scalar, Vendor, MAX_ARGS, SIMD_WIDTH};
pub use kernel::Kernel;
pub use kernel_info::KernelInfo;
pub use memory::Memory;
