use std::sync::Arc;

use crate::backend::{KernelBackend, MemoryId, StreamId};
use crate::error::{Error, Result};

/// A device allocation. Cheap to clone: clones alias the same backend
/// allocation (§3 "copy semantics for user-facing values are shallow").
/// Resources are released only by calling [`Memory::free`] explicitly.
#[derive(Clone)]
pub struct Memory {
    backend: Arc<dyn KernelBackend>,
    id: MemoryId,
    size: usize,
}

impl Memory {
    pub(crate) fn new(backend: Arc<dyn KernelBackend>, id: MemoryId, size: usize) -> Self {
        Self { backend, id, size }
    }

    pub fn id(&self) -> MemoryId {
        self.id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Resolves `bytes == 0` to "entire buffer" and checks
    /// `offset + bytes <= size`, per §4.1.
    fn resolve_and_check(&self, bytes: usize, offset: usize) -> Result<usize> {
        crate::checked_assert!(self.size > 0, "memory handle {:?} has zero size while live", self.id);
        let bytes = if bytes == 0 { self.size } else { bytes };
        if offset + bytes > self.size {
            return Err(Error::BoundsCheck {
                offset,
                bytes,
                size: self.size,
            });
        }
        Ok(bytes)
    }

    pub fn copy_from_host(&self, src: &[u8], bytes: usize, dst_offset: usize) -> Result<()> {
        let bytes = self.resolve_and_check(bytes, dst_offset)?;
        self.backend
            .copy_from_host(self.id, &src[..bytes], dst_offset)
    }

    pub fn copy_from_device(
        &self,
        src: &Memory,
        bytes: usize,
        dst_offset: usize,
        src_offset: usize,
    ) -> Result<()> {
        let bytes = self.resolve_and_check(bytes, dst_offset)?;
        src.resolve_and_check(bytes, src_offset)?;
        self.backend
            .copy_from_device(self.id, src.id, bytes, dst_offset, src_offset)
    }

    pub fn copy_to_host(&self, dst: &mut [u8], bytes: usize, src_offset: usize) -> Result<()> {
        let bytes = self.resolve_and_check(bytes, src_offset)?;
        self.backend
            .copy_to_host(self.id, &mut dst[..bytes], src_offset)
    }

    pub fn copy_to_device(
        &self,
        dst: &Memory,
        bytes: usize,
        dst_offset: usize,
        src_offset: usize,
    ) -> Result<()> {
        let bytes = self.resolve_and_check(bytes, src_offset)?;
        dst.resolve_and_check(bytes, dst_offset)?;
        self.backend
            .copy_to_device(self.id, dst.id, bytes, dst_offset, src_offset)
    }

    pub fn async_copy_from_host(
        &self,
        stream: StreamId,
        src: &[u8],
        bytes: usize,
        dst_offset: usize,
    ) -> Result<()> {
        let bytes = self.resolve_and_check(bytes, dst_offset)?;
        self.backend
            .async_copy_from_host(stream, self.id, &src[..bytes], dst_offset)
    }

    pub fn async_copy_from_device(
        &self,
        stream: StreamId,
        src: &Memory,
        bytes: usize,
        dst_offset: usize,
        src_offset: usize,
    ) -> Result<()> {
        let bytes = self.resolve_and_check(bytes, dst_offset)?;
        src.resolve_and_check(bytes, src_offset)?;
        self.backend
            .async_copy_from_device(stream, self.id, src.id, bytes, dst_offset, src_offset)
    }

    pub fn async_copy_to_host(
        &self,
        stream: StreamId,
        dst: &mut [u8],
        bytes: usize,
        src_offset: usize,
    ) -> Result<()> {
        let bytes = self.resolve_and_check(bytes, src_offset)?;
        self.backend
            .async_copy_to_host(stream, self.id, &mut dst[..bytes], src_offset)
    }

    pub fn async_copy_to_device(
        &self,
        stream: StreamId,
        dst: &Memory,
        bytes: usize,
        dst_offset: usize,
        src_offset: usize,
    ) -> Result<()> {
        let bytes = self.resolve_and_check(bytes, src_offset)?;
        dst.resolve_and_check(bytes, dst_offset)?;
        self.backend
            .async_copy_to_device(stream, self.id, dst.id, bytes, dst_offset, src_offset)
    }

    /// Eagerly releases the backing allocation. Other clones of this handle
    /// become dangling; the convention (§3) is that callers do not use them
    /// afterward.
    pub fn free(&self) -> Result<()> {
        self.backend.free_memory(self.id)
    }
}

impl std::fmt::Debug for Memory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memory")
            .field("id", &self.id)
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{BackendKind, Dim3, KernelArg};
    use crate::kernel_info::KernelInfo;
    use std::path::Path;
    use std::sync::Mutex;

    /// A trivial in-process backend used only to exercise bounds checking
    /// and copy plumbing without any real device.
    struct FakeBackend {
        bufs: Mutex<std::collections::HashMap<u64, Vec<u8>>>,
        next: std::sync::atomic::AtomicU64,
    }

    impl FakeBackend {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                bufs: Mutex::new(std::collections::HashMap::new()),
                next: std::sync::atomic::AtomicU64::new(1),
            })
        }
    }

    impl KernelBackend for FakeBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::HostShared
        }
        fn platform_id(&self) -> i32 {
            0
        }
        fn device_id(&self) -> i32 {
            0
        }
        fn initial_stream(&self) -> StreamId {
            StreamId(0)
        }
        fn simd_width(&self) -> Result<u32> {
            Ok(8)
        }
        fn flush(&self, _stream: StreamId) -> Result<()> {
            Ok(())
        }
        fn finish(&self, _stream: StreamId) -> Result<()> {
            Ok(())
        }
        fn gen_stream(&self) -> Result<StreamId> {
            Ok(StreamId(0))
        }
        fn free_stream(&self, _stream: StreamId) -> Result<()> {
            Ok(())
        }
        fn tag_stream(&self, _stream: StreamId) -> Result<crate::backend::EventId> {
            Ok(crate::backend::EventId(0))
        }
        fn time_between(
            &self,
            _start: crate::backend::EventId,
            _end: crate::backend::EventId,
        ) -> Result<f64> {
            Ok(0.0)
        }
        fn malloc(&self, bytes: usize, source: Option<&[u8]>) -> Result<MemoryId> {
            let id = self.next.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let mut data = vec![0u8; bytes];
            if let Some(src) = source {
                data[..src.len()].copy_from_slice(src);
            }
            self.bufs.lock().unwrap().insert(id, data);
            Ok(MemoryId(id))
        }
        fn free_memory(&self, mem: MemoryId) -> Result<()> {
            self.bufs.lock().unwrap().remove(&mem.0);
            Ok(())
        }
        fn memory_size(&self, mem: MemoryId) -> usize {
            self.bufs.lock().unwrap().get(&mem.0).map(|v| v.len()).unwrap_or(0)
        }
        fn copy_from_host(&self, mem: MemoryId, src: &[u8], dst_offset: usize) -> Result<()> {
            let mut bufs = self.bufs.lock().unwrap();
            let buf = bufs.get_mut(&mem.0).unwrap();
            buf[dst_offset..dst_offset + src.len()].copy_from_slice(src);
            Ok(())
        }
        fn copy_from_device(
            &self,
            dst: MemoryId,
            src: MemoryId,
            bytes: usize,
            dst_offset: usize,
            src_offset: usize,
        ) -> Result<()> {
            let mut bufs = self.bufs.lock().unwrap();
            let src_data = bufs.get(&src.0).unwrap()[src_offset..src_offset + bytes].to_vec();
            let dst_buf = bufs.get_mut(&dst.0).unwrap();
            dst_buf[dst_offset..dst_offset + bytes].copy_from_slice(&src_data);
            Ok(())
        }
        fn copy_to_host(&self, mem: MemoryId, dst: &mut [u8], src_offset: usize) -> Result<()> {
            let bufs = self.bufs.lock().unwrap();
            let buf = bufs.get(&mem.0).unwrap();
            dst.copy_from_slice(&buf[src_offset..src_offset + dst.len()]);
            Ok(())
        }
        fn copy_to_device(
            &self,
            src: MemoryId,
            dst: MemoryId,
            bytes: usize,
            dst_offset: usize,
            src_offset: usize,
        ) -> Result<()> {
            self.copy_from_device(dst, src, bytes, dst_offset, src_offset)
        }
        fn async_copy_from_host(
            &self,
            _stream: StreamId,
            mem: MemoryId,
            src: &[u8],
            dst_offset: usize,
        ) -> Result<()> {
            self.copy_from_host(mem, src, dst_offset)
        }
        fn async_copy_from_device(
            &self,
            _stream: StreamId,
            dst: MemoryId,
            src: MemoryId,
            bytes: usize,
            dst_offset: usize,
            src_offset: usize,
        ) -> Result<()> {
            self.copy_from_device(dst, src, bytes, dst_offset, src_offset)
        }
        fn async_copy_to_host(
            &self,
            _stream: StreamId,
            mem: MemoryId,
            dst: &mut [u8],
            src_offset: usize,
        ) -> Result<()> {
            self.copy_to_host(mem, dst, src_offset)
        }
        fn async_copy_to_device(
            &self,
            _stream: StreamId,
            src: MemoryId,
            dst: MemoryId,
            bytes: usize,
            dst_offset: usize,
            src_offset: usize,
        ) -> Result<()> {
            self.copy_to_device(src, dst, bytes, dst_offset, src_offset)
        }
        fn compile_artifact(
            &self,
            _intermediate: &Path,
            _artifact_path: &Path,
            _kernel_info: &KernelInfo,
            _compiler: &crate::backend::CompilerSettings,
        ) -> Result<()> {
            Ok(())
        }
        fn load_artifact(&self, _artifact_path: &Path, _function_name: &str) -> Result<crate::backend::KernelId> {
            Ok(crate::backend::KernelId(0))
        }
        fn free_kernel(&self, _kernel: crate::backend::KernelId) -> Result<()> {
            Ok(())
        }
        fn preferred_dim_size(&self, _kernel: crate::backend::KernelId) -> Result<u32> {
            Ok(32)
        }
        fn launch(
            &self,
            _stream: StreamId,
            _kernel: crate::backend::KernelId,
            _grid: Dim3,
            _block: Dim3,
            _args: &[KernelArg],
        ) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn zero_bytes_means_entire_buffer() {
        let backend = FakeBackend::new();
        let id = backend.malloc(64, None).unwrap();
        let mem = Memory::new(backend, id, 64);
        let mut out = vec![0u8; 64];
        mem.copy_to_host(&mut out, 0, 0).unwrap();
        assert_eq!(out.len(), 64);
    }

    #[test]
    fn bounds_check_rejects_overrun_without_driver_call() {
        let backend = FakeBackend::new();
        let id = backend.malloc(64, None).unwrap();
        let mem = Memory::new(backend, id, 64);
        let mut out = vec![0u8; 32];
        let err = mem.copy_to_host(&mut out, 32, 40).unwrap_err();
        assert!(matches!(err, Error::BoundsCheck { .. }));
    }

    #[test]
    fn malloc_with_source_then_copy_to_round_trips() {
        let backend = FakeBackend::new();
        let src = [1u8, 2, 3, 4];
        let id = backend.malloc(4, Some(&src)).unwrap();
        let mem = Memory::new(backend, id, 4);
        let mut out = vec![0u8; 4];
        mem.copy_to_host(&mut out, 0, 0).unwrap();
        assert_eq!(out, src);
    }
}
