use crate::memory::Memory;

/// Maximum number of arguments a single kernel launch may bind.
pub const MAX_ARGS: usize = 50;

/// Default SIMD / warp / wavefront width used when a backend has no better answer.
pub const SIMD_WIDTH: u32 = 8;

/// A 3D launch geometry. Unused axes are set to `1`, never `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dim3 {
    pub x: usize,
    pub y: usize,
    pub z: usize,
}

impl Dim3 {
    pub const fn new(x: usize, y: usize, z: usize) -> Self {
        Self { x, y, z }
    }

    /// Builds a 1D geometry, `y` and `z` pinned to `1`.
    pub const fn one_d(x: usize) -> Self {
        Self::new(x, 1, 1)
    }

    /// Number of dimensions actually in use (1, 2, or 3), inferred from
    /// which trailing axes are `1`. A `(4,1,1)` geometry is 1D.
    pub fn dims(&self) -> u8 {
        if self.z > 1 {
            3
        } else if self.y > 1 {
            2
        } else {
            1
        }
    }

    pub fn is_valid(&self) -> bool {
        self.x >= 1 && self.y >= 1 && self.z >= 1
    }

    pub fn total(&self) -> usize {
        self.x * self.y * self.z
    }
}

/// A scalar value packed by value into a kernel launch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Int(i32),
    Long(i64),
    UInt(u32),
    Float32(f32),
    Float64(f64),
    I8(i8),
    I16(i16),
    I64(i64),
    U8(u8),
    U16(u16),
    U64(u64),
    Char(i8),
}

impl Scalar {
    /// Raw little-endian bytes of the scalar, as the backend's argument
    /// packer needs them.
    pub fn to_le_bytes(self) -> Vec<u8> {
        match self {
            Scalar::Int(v) => v.to_le_bytes().to_vec(),
            Scalar::Long(v) => v.to_le_bytes().to_vec(),
            Scalar::UInt(v) => v.to_le_bytes().to_vec(),
            Scalar::Float32(v) => v.to_le_bytes().to_vec(),
            Scalar::Float64(v) => v.to_le_bytes().to_vec(),
            Scalar::I8(v) => v.to_le_bytes().to_vec(),
            Scalar::I16(v) => v.to_le_bytes().to_vec(),
            Scalar::I64(v) => v.to_le_bytes().to_vec(),
            Scalar::U8(v) => v.to_le_bytes().to_vec(),
            Scalar::U16(v) => v.to_le_bytes().to_vec(),
            Scalar::U64(v) => v.to_le_bytes().to_vec(),
            Scalar::Char(v) => v.to_le_bytes().to_vec(),
        }
    }
}

macro_rules! impl_scalar_from {
    ($t:ty, $variant:ident) => {
        impl From<$t> for Scalar {
            fn from(v: $t) -> Self {
                Scalar::$variant(v)
            }
        }
    };
}

impl_scalar_from!(i32, Int);
impl_scalar_from!(i64, Long);
impl_scalar_from!(u32, UInt);
impl_scalar_from!(f32, Float32);
impl_scalar_from!(f64, Float64);
impl_scalar_from!(i8, I8);
impl_scalar_from!(i16, I16);
impl_scalar_from!(u8, U8);
impl_scalar_from!(u16, U16);
impl_scalar_from!(u64, U64);

/// A single kernel-launch argument: either a scalar packed by value or a
/// `Memory` buffer passed as a device pointer / buffer handle.
#[derive(Debug, Clone)]
pub enum KernelArg {
    Scalar(Scalar),
    Buffer(Memory),
}

impl From<Memory> for KernelArg {
    fn from(m: Memory) -> Self {
        KernelArg::Buffer(m)
    }
}

impl From<Scalar> for KernelArg {
    fn from(s: Scalar) -> Self {
        KernelArg::Scalar(s)
    }
}

macro_rules! impl_kernel_arg_from {
    ($t:ty) => {
        impl From<$t> for KernelArg {
            fn from(v: $t) -> Self {
                KernelArg::Scalar(Scalar::from(v))
            }
        }
    };
}

impl_kernel_arg_from!(i32);
impl_kernel_arg_from!(i64);
impl_kernel_arg_from!(u32);
impl_kernel_arg_from!(f32);
impl_kernel_arg_from!(f64);
impl_kernel_arg_from!(i8);
impl_kernel_arg_from!(i16);
impl_kernel_arg_from!(u8);
impl_kernel_arg_from!(u16);
impl_kernel_arg_from!(u64);

/// Backend technology tag (design-notes §9: replaces template specialization
/// over a backend tag with a small closed set of concrete variants).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// NVIDIA-style driver compute (PTX modules, `cuModuleLoad`-shaped API).
    DriverCompute,
    /// Cross-vendor compute (OpenCL-shaped API).
    CrossVendorCompute,
    /// Host-compiled shared object, loaded via `dlopen`.
    HostShared,
}

impl BackendKind {
    /// Stable tag used as the first component of a cache fingerprint.
    pub fn fingerprint_tag(&self) -> &'static str {
        match self {
            BackendKind::DriverCompute => "DriverCompute",
            BackendKind::CrossVendorCompute => "CrossVendor",
            BackendKind::HostShared => "HostShared",
        }
    }
}

/// Coarse device category, kept distinct from [`BackendKind`] because a
/// single backend kind (cross-vendor compute) can run on more than one
/// device category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceCategory {
    Cpu,
    Gpu,
    Fpga,
    XeonPhi,
}

/// Vendor tag used only for SIMD-width inference and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Vendor {
    Amd,
    Intel,
    Altera,
    Nvidia,
    Unknown,
}

impl Vendor {
    pub fn from_vendor_string(s: &str) -> Self {
        let upper = s.to_uppercase();
        if upper.contains("NVIDIA") {
            Vendor::Nvidia
        } else if upper.contains("AMD") || upper.contains("ATI") {
            Vendor::Amd
        } else if upper.contains("INTEL") {
            Vendor::Intel
        } else if upper.contains("ALTERA") {
            Vendor::Altera
        } else {
            Vendor::Unknown
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dims_infers_from_trailing_ones() {
        assert_eq!(Dim3::new(4, 1, 1).dims(), 1);
        assert_eq!(Dim3::new(4, 4, 1).dims(), 2);
        assert_eq!(Dim3::new(4, 4, 4).dims(), 3);
    }

    #[test]
    fn vendor_string_inference() {
        assert_eq!(Vendor::from_vendor_string("NVIDIA Corporation"), Vendor::Nvidia);
        assert_eq!(Vendor::from_vendor_string("Advanced Micro Devices, Inc."), Vendor::Amd);
        assert_eq!(Vendor::from_vendor_string("ATI Technologies"), Vendor::Amd);
        assert_eq!(Vendor::from_vendor_string("Intel(R) Corporation"), Vendor::Intel);
        assert_eq!(Vendor::from_vendor_string("Some Obscure Vendor"), Vendor::Unknown);
    }

    #[test]
    fn scalar_byte_packing_round_trips_width() {
        assert_eq!(Scalar::from(7i32).to_le_bytes().len(), 4);
        assert_eq!(Scalar::from(7i64).to_le_bytes().len(), 8);
        assert_eq!(Scalar::from(7u8).to_le_bytes().len(), 1);
    }
}
