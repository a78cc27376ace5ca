//! Host-shared backend: the CPU path that shells out to a system compiler
//! and dynamically loads the resulting shared object (§4.2 "CPU backend").
//!
//! Work enqueued on a "stream" runs synchronously at enqueue time, since
//! there's no real asynchronous hardware queue underneath; streams and
//! events still exist as the facade requires, just backed by a host clock
//! instead of a profiling counter.

use std::collections::HashMap;
use std::ffi::c_void;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, Once};
use std::time::Instant;

use libloading::Library;
use tracing::{debug, info};

use kforge_core::backend::{CompilerSettings, EventId, KernelBackend, KernelId, MemoryId, StreamId};
use kforge_core::{BackendKind, Dim3, Error, KernelArg, KernelInfo, Result, Scalar};

static INIT: Once = Once::new();

fn process_wide_init() {
    INIT.call_once(|| {
        debug!("host-shared backend process-wide init (one-shot)");
    });
}

/// Calling convention every host-shared kernel artifact exports: grid and
/// block geometry as 3-element `usize` arrays, followed by an argument
/// vector of raw pointers (scalars point at a stack-resident copy of their
/// bytes, buffers point directly at the allocation).
pub type RawKernelFn =
    unsafe extern "C" fn(grid: *const usize, block: *const usize, argv: *const *mut c_void, argc: usize);

struct LoadedKernel {
    // Kept alive so `func` stays valid; never read again after load.
    _lib: Library,
    func: RawKernelFn,
    function_name: String,
}

// SAFETY: `Library` only exposes symbol lookups through `&self`/owned
// handles and this backend never calls into it from more than one thread
// concurrently without synchronizing through the outer `Mutex`.
unsafe impl Send for LoadedKernel {}

pub struct HostSharedBackend {
    platform_id: i32,
    device_id: i32,
    initial_stream: StreamId,
    next_stream: AtomicU64,
    next_event: AtomicU64,
    next_buffer: AtomicU64,
    next_kernel: AtomicU64,
    buffers: Mutex<HashMap<u64, Vec<u8>>>,
    kernels: Mutex<HashMap<u64, LoadedKernel>>,
    events: Mutex<HashMap<u64, Instant>>,
    preferred_dim_size: Mutex<HashMap<u64, u32>>,
}

impl HostSharedBackend {
    /// `setup` (§4.1): process-wide one-shot init, then a fresh initial
    /// stream. The host-shared backend has no real device enumeration, so
    /// any `(platform_id, device_id)` pair is accepted.
    pub fn setup(platform_id: i32, device_id: i32) -> Result<std::sync::Arc<Self>> {
        process_wide_init();
        info!(platform_id, device_id, "host-shared device ready");
        Ok(std::sync::Arc::new(Self {
            platform_id,
            device_id,
            initial_stream: StreamId(0),
            next_stream: AtomicU64::new(1),
            next_event: AtomicU64::new(1),
            next_buffer: AtomicU64::new(1),
            next_kernel: AtomicU64::new(1),
            buffers: Mutex::new(HashMap::new()),
            kernels: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
            preferred_dim_size: Mutex::new(HashMap::new()),
        }))
    }

    fn buf<'a>(&self, bufs: &'a HashMap<u64, Vec<u8>>, id: MemoryId) -> Result<&'a Vec<u8>> {
        bufs.get(&id.0)
            .ok_or_else(|| Error::TransferError(format!("unknown buffer {id:?}")))
    }
}

impl KernelBackend for HostSharedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::HostShared
    }

    fn platform_id(&self) -> i32 {
        self.platform_id
    }

    fn device_id(&self) -> i32 {
        self.device_id
    }

    fn initial_stream(&self) -> StreamId {
        self.initial_stream
    }

    fn simd_width(&self) -> Result<u32> {
        Ok(kforge_core::SIMD_WIDTH)
    }

    fn flush(&self, _stream: StreamId) -> Result<()> {
        Ok(())
    }

    fn finish(&self, _stream: StreamId) -> Result<()> {
        Ok(())
    }

    fn gen_stream(&self) -> Result<StreamId> {
        Ok(StreamId(self.next_stream.fetch_add(1, Ordering::SeqCst)))
    }

    fn free_stream(&self, _stream: StreamId) -> Result<()> {
        Ok(())
    }

    fn tag_stream(&self, _stream: StreamId) -> Result<EventId> {
        let id = self.next_event.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().insert(id, Instant::now());
        Ok(EventId(id))
    }

    fn time_between(&self, start: EventId, end: EventId) -> Result<f64> {
        if start.0 == end.0 {
            let mut events = self.events.lock().unwrap();
            events
                .remove(&start.0)
                .ok_or_else(|| Error::Unsupported("event already consumed".into()))?;
            return Ok(0.0);
        }

        let mut events = self.events.lock().unwrap();
        let t0 = events
            .remove(&start.0)
            .ok_or_else(|| Error::Unsupported("event already consumed".into()))?;
        let t1 = events
            .remove(&end.0)
            .ok_or_else(|| Error::Unsupported("event already consumed".into()))?;
        Ok(t1.saturating_duration_since(t0).as_secs_f64())
    }

    fn malloc(&self, bytes: usize, source: Option<&[u8]>) -> Result<MemoryId> {
        let id = self.next_buffer.fetch_add(1, Ordering::SeqCst);
        let mut data = vec![0u8; bytes];
        if let Some(src) = source {
            data[..src.len()].copy_from_slice(src);
        }
        self.buffers.lock().unwrap().insert(id, data);
        Ok(MemoryId(id))
    }

    fn free_memory(&self, mem: MemoryId) -> Result<()> {
        self.buffers.lock().unwrap().remove(&mem.0);
        Ok(())
    }

    fn memory_size(&self, mem: MemoryId) -> usize {
        self.buffers
            .lock()
            .unwrap()
            .get(&mem.0)
            .map(|b| b.len())
            .unwrap_or(0)
    }

    fn copy_from_host(&self, mem: MemoryId, src: &[u8], dst_offset: usize) -> Result<()> {
        let mut bufs = self.buffers.lock().unwrap();
        let dst = bufs
            .get_mut(&mem.0)
            .ok_or_else(|| Error::TransferError(format!("unknown buffer {mem:?}")))?;
        dst[dst_offset..dst_offset + src.len()].copy_from_slice(src);
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
        let mut bufs = self.buffers.lock().unwrap();
        let src_bytes = self.buf(&bufs, src)?[src_offset..src_offset + bytes].to_vec();
        let dst_buf = bufs
            .get_mut(&dst.0)
            .ok_or_else(|| Error::TransferError(format!("unknown buffer {dst:?}")))?;
        dst_buf[dst_offset..dst_offset + bytes].copy_from_slice(&src_bytes);
        Ok(())
    }

    fn copy_to_host(&self, mem: MemoryId, dst: &mut [u8], src_offset: usize) -> Result<()> {
        let bufs = self.buffers.lock().unwrap();
        let src = self.buf(&bufs, mem)?;
        dst.copy_from_slice(&src[src_offset..src_offset + dst.len()]);
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
        intermediate: &Path,
        artifact_path: &Path,
        _kernel_info: &KernelInfo,
        compiler: &CompilerSettings,
    ) -> Result<()> {
        let mut command = String::new();
        if !compiler.env_prelude.is_empty() {
            command.push_str(&compiler.env_prelude);
            command.push_str(" && ");
        }
        command.push_str(&compiler.compiler);
        command.push(' ');
        command.push_str(&compiler.flags);
        command.push_str(" -shared -fPIC -x c -o ");
        command.push_str(&artifact_path.to_string_lossy());
        command.push(' ');
        command.push_str(&intermediate.to_string_lossy());

        info!(%command, "compiling host-shared kernel");

        let output = Command::new("sh")
            .arg("-c")
            .arg(&command)
            .output()
            .map_err(|e| Error::CompileError {
                path: intermediate.to_path_buf(),
                log: format!("failed to spawn compiler: {e}"),
            })?;

        if !output.status.success() {
            return Err(Error::CompileError {
                path: intermediate.to_path_buf(),
                log: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(())
    }

    fn load_artifact(&self, artifact_path: &Path, function_name: &str) -> Result<KernelId> {
        let lib = unsafe { Library::new(artifact_path) }.map_err(|e| Error::LoadError {
            path: artifact_path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let func: RawKernelFn = unsafe {
            let symbol = lib
                .get::<RawKernelFn>(function_name.as_bytes())
                .map_err(|e| Error::LoadError {
                    path: artifact_path.to_path_buf(),
                    reason: format!("symbol {function_name} not found: {e}"),
                })?;
            *symbol
        };

        let id = self.next_kernel.fetch_add(1, Ordering::SeqCst);
        self.kernels.lock().unwrap().insert(
            id,
            LoadedKernel {
                _lib: lib,
                func,
                function_name: function_name.to_string(),
            },
        );
        Ok(KernelId(id))
    }

    fn free_kernel(&self, kernel: KernelId) -> Result<()> {
        self.kernels.lock().unwrap().remove(&kernel.0);
        self.preferred_dim_size.lock().unwrap().remove(&kernel.0);
        Ok(())
    }

    fn preferred_dim_size(&self, kernel: KernelId) -> Result<u32> {
        let mut cache = self.preferred_dim_size.lock().unwrap();
        if let Some(v) = cache.get(&kernel.0) {
            return Ok(*v);
        }
        // No real device to query on the host-shared backend; the
        // configured SIMD width is the only meaningful block multiple.
        let v = kforge_core::SIMD_WIDTH;
        cache.insert(kernel.0, v);
        Ok(v)
    }

    fn launch(
        &self,
        _stream: StreamId,
        kernel: KernelId,
        grid: Dim3,
        block: Dim3,
        args: &[KernelArg],
    ) -> Result<()> {
        let kernels = self.kernels.lock().unwrap();
        let loaded = kernels
            .get(&kernel.0)
            .ok_or_else(|| Error::LaunchError(format!("unknown kernel {kernel:?}")))?;

        // Scalars need storage that outlives the call; buffers borrow the
        // backend's own allocation directly. Build scalar storage first so
        // its addresses are stable while `argv` is assembled in arg order.
        let mut scalar_storage: Vec<Vec<u8>> = args
            .iter()
            .filter_map(|arg| match arg {
                KernelArg::Scalar(s) => Some(scalar_bytes(*s)),
                KernelArg::Buffer(_) => None,
            })
            .collect();

        let mut bufs = self.buffers.lock().unwrap();
        let mut argv: Vec<*mut c_void> = Vec::with_capacity(args.len());
        let mut scalar_iter = scalar_storage.iter_mut();
        for arg in args {
            match arg {
                KernelArg::Scalar(_) => {
                    let storage = scalar_iter.next().expect("scalar storage pre-sized to args");
                    argv.push(storage.as_mut_ptr() as *mut c_void);
                }
                KernelArg::Buffer(mem) => {
                    let data = bufs
                        .get_mut(&mem.id().0)
                        .ok_or_else(|| Error::LaunchError(format!("unknown buffer {:?}", mem.id())))?;
                    argv.push(data.as_mut_ptr() as *mut c_void);
                }
            }
        }
        drop(bufs);

        let grid_arr = [grid.x, grid.y, grid.z];
        let block_arr = [block.x, block.y, block.z];

        debug!(
            function = %loaded.function_name,
            grid = ?grid_arr,
            block = ?block_arr,
            argc = argv.len(),
            "launching host-shared kernel"
        );

        unsafe {
            (loaded.func)(grid_arr.as_ptr(), block_arr.as_ptr(), argv.as_ptr(), argv.len());
        }

        Ok(())
    }
}

fn scalar_bytes(s: Scalar) -> Vec<u8> {
    s.to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kforge_core::{Device, KernelInfo};
    use std::sync::Arc;

    fn settings() -> CompilerSettings {
        CompilerSettings {
            compiler: std::env::var("CC").unwrap_or_else(|_| "cc".to_string()),
            env_prelude: String::new(),
            flags: "-O2".to_string(),
        }
    }

    /// Vector-add end-to-end scenario (§8 scenario 1), driven through the
    /// real cache coordinator and a real system compiler + `dlopen`.
    #[test]
    fn vector_add_host_to_device_to_host() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("vector_add.c");
        std::fs::write(
            &source_path,
            r#"
#include <stddef.h>

void vectorAdd(const size_t *grid, const size_t *block, void **argv, size_t argc) {
    (void)grid; (void)argc;
    int n = *(int *)argv[0];
    int *c = (int *)argv[1];
    int *a = (int *)argv[2];
    int *b = (int *)argv[3];
    for (int i = 0; i < n && (size_t)i < block[0]; i++) {
        c[i] = a[i] + b[i];
    }
}
"#,
        )
        .unwrap();

        let backend = HostSharedBackend::setup(0, 0).unwrap();
        let device = Device::with_cache_dir(
            backend as Arc<dyn KernelBackend>,
            settings(),
            dir.path().join("cache"),
        )
        .unwrap();

        let a: [i32; 4] = [1, 2, 3, 4];
        let b: [i32; 4] = [10, 20, 30, 40];

        let buf_a = device.malloc(16, Some(bytemuck(&a))).unwrap();
        let buf_b = device.malloc(16, Some(bytemuck(&b))).unwrap();
        let buf_c = device.malloc(16, None).unwrap();

        let kernel = device
            .build_kernel_from_source(&source_path, "vectorAdd", &KernelInfo::new())
            .unwrap();

        kernel
            .launch(
                device.current_stream(),
                Dim3::one_d(1),
                Dim3::one_d(4),
                &[
                    KernelArg::from(4i32),
                    KernelArg::from(buf_c.clone()),
                    KernelArg::from(buf_a.clone()),
                    KernelArg::from(buf_b.clone()),
                ],
            )
            .unwrap();

        let mut out = [0i32; 4];
        buf_c.copy_to_host(bytemuck_mut(&mut out), 0, 0).unwrap();

        assert_eq!(out, [11, 22, 33, 44]);
    }

    #[test]
    fn time_between_consecutive_tags_is_nonnegative() {
        let backend = HostSharedBackend::setup(0, 0).unwrap();
        let kind: std::sync::Arc<dyn KernelBackend> = backend;
        let stream = kind.initial_stream();
        let start = kind.tag_stream(stream).unwrap();
        let end = kind.tag_stream(stream).unwrap();
        let elapsed = kind.time_between(start, end).unwrap();
        assert!(elapsed >= 0.0);
        // both events are consumed; asking again is an error
        assert!(kind.time_between(start, end).is_err());
    }

    #[test]
    fn time_between_same_event_is_zero() {
        let backend = HostSharedBackend::setup(0, 0).unwrap();
        let kind: std::sync::Arc<dyn KernelBackend> = backend;
        let stream = kind.initial_stream();
        let tag = kind.tag_stream(stream).unwrap();
        assert_eq!(kind.time_between(tag, tag).unwrap(), 0.0);
        // consumed by the call above
        assert!(kind.time_between(tag, tag).is_err());
    }

    fn bytemuck(ints: &[i32]) -> &[u8] {
        unsafe { std::slice::from_raw_parts(ints.as_ptr() as *const u8, ints.len() * 4) }
    }

    fn bytemuck_mut(ints: &mut [i32]) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(ints.as_mut_ptr() as *mut u8, ints.len() * 4) }
    }
}
