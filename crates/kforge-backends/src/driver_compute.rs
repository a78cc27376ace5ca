//! Driver-compute backend: NVIDIA-style PTX/module API over `cudarc`'s
//! `driver` module (§4.2 "driver-compute backend"). Kernel source is handed
//! to `nvcc` out of process (two passes: a syntax check, then a PTX
//! emission), and the resulting PTX is loaded through the CUDA driver API.

use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};

use cudarc::driver::{CudaDevice, CudaFunction, CudaSlice, CudaStream, LaunchAsync, LaunchConfig};
use tracing::{debug, info};

use kforge_core::backend::{CompilerSettings, EventId, KernelBackend, KernelId, MemoryId, StreamId};
use kforge_core::{BackendKind, Dim3, Error, KernelArg, KernelInfo, Result, Scalar};

static INIT: Once = Once::new();

fn process_wide_init() {
    INIT.call_once(|| {
        debug!("driver-compute backend process-wide init (one-shot)");
    });
}

struct Buf {
    slice: CudaSlice<u8>,
}

struct LoadedKernel {
    func: CudaFunction,
}

pub struct DriverComputeBackend {
    platform_id: i32,
    device_id: i32,
    device: Arc<CudaDevice>,
    initial_stream: StreamId,
    streams: Mutex<HashMap<u64, Arc<CudaStream>>>,
    next_stream: AtomicU64,
    buffers: Mutex<HashMap<u64, Buf>>,
    next_buffer: AtomicU64,
    kernels: Mutex<HashMap<u64, LoadedKernel>>,
    next_kernel: AtomicU64,
    events: Mutex<HashMap<u64, (StreamId, std::time::Instant)>>,
    next_event: AtomicU64,
    preferred_dim_size: Mutex<HashMap<u64, u32>>,
}

impl DriverComputeBackend {
    /// `setup` (§4.1): `cudarc::driver::CudaDevice::new` already performs
    /// `cuInit`, context creation, and an initial stream; `platform_id` is
    /// always `0` since CUDA has exactly one platform.
    pub fn setup(device_id: i32) -> Result<Arc<Self>> {
        process_wide_init();
        let device = CudaDevice::new(device_id as usize)
            .map_err(|e| Error::BackendInit(e.to_string()))?;

        info!(device_id, "driver-compute device ready");

        Ok(Arc::new(Self {
            platform_id: 0,
            device_id,
            device,
            initial_stream: StreamId(0),
            streams: Mutex::new(HashMap::new()),
            next_stream: AtomicU64::new(1),
            buffers: Mutex::new(HashMap::new()),
            next_buffer: AtomicU64::new(1),
            kernels: Mutex::new(HashMap::new()),
            next_kernel: AtomicU64::new(1),
            events: Mutex::new(HashMap::new()),
            next_event: AtomicU64::new(1),
            preferred_dim_size: Mutex::new(HashMap::new()),
        }))
    }

    fn compute_capability(&self) -> Result<(i32, i32)> {
        use cudarc::driver::sys::CUdevice_attribute_enum as Attr;
        let major = self
            .device
            .attribute(Attr::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR)
            .map_err(|e| Error::BackendInit(e.to_string()))?;
        let minor = self
            .device
            .attribute(Attr::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR)
            .map_err(|e| Error::BackendInit(e.to_string()))?;
        Ok((major, minor))
    }
}

impl KernelBackend for DriverComputeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::DriverCompute
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
        // Warp width is architecturally fixed at 32 on every CUDA device
        // to date (§9 open question: populated lazily like every backend,
        // even though the answer here never varies).
        Ok(32)
    }

    fn flush(&self, _stream: StreamId) -> Result<()> {
        Ok(())
    }

    fn finish(&self, stream: StreamId) -> Result<()> {
        if stream == self.initial_stream {
            return self.device.synchronize().map_err(|e| Error::Unsupported(e.to_string()));
        }
        let streams = self.streams.lock().unwrap();
        let s = streams
            .get(&stream.0)
            .ok_or_else(|| Error::Unsupported(format!("unknown stream {stream:?}")))?;
        s.synchronize().map_err(|e| Error::Unsupported(e.to_string()))
    }

    fn gen_stream(&self) -> Result<StreamId> {
        let stream = self.device.fork_default_stream().map_err(|e| Error::Unsupported(e.to_string()))?;
        let id = self.next_stream.fetch_add(1, Ordering::SeqCst);
        self.streams.lock().unwrap().insert(id, stream);
        Ok(StreamId(id))
    }

    fn free_stream(&self, stream: StreamId) -> Result<()> {
        self.streams.lock().unwrap().remove(&stream.0);
        Ok(())
    }

    fn tag_stream(&self, stream: StreamId) -> Result<EventId> {
        let id = self.next_event.fetch_add(1, Ordering::SeqCst);
        self.events.lock().unwrap().insert(id, (stream, std::time::Instant::now()));
        Ok(EventId(id))
    }

    fn time_between(&self, start: EventId, end: EventId) -> Result<f64> {
        if start.0 == end.0 {
            let mut events = self.events.lock().unwrap();
            let (stream, _) = events
                .remove(&start.0)
                .ok_or_else(|| Error::Unsupported("event already consumed".into()))?;
            drop(events);
            self.finish(stream)?;
            return Ok(0.0);
        }

        let mut events = self.events.lock().unwrap();
        let (stream, t0) = events
            .remove(&start.0)
            .ok_or_else(|| Error::Unsupported("event already consumed".into()))?;
        let (_, t1) = events
            .remove(&end.0)
            .ok_or_else(|| Error::Unsupported("event already consumed".into()))?;
        drop(events);

        self.finish(stream)?;
        Ok(t1.saturating_duration_since(t0).as_secs_f64())
    }

    fn malloc(&self, bytes: usize, source: Option<&[u8]>) -> Result<MemoryId> {
        let mut slice = unsafe { self.device.alloc::<u8>(bytes) }
            .map_err(|e| Error::TransferError(e.to_string()))?;
        if let Some(src) = source {
            self.device
                .htod_copy_into(src.to_vec(), &mut slice)
                .map_err(|e| Error::TransferError(e.to_string()))?;
        }
        let id = self.next_buffer.fetch_add(1, Ordering::SeqCst);
        self.buffers.lock().unwrap().insert(id, Buf { slice });
        Ok(MemoryId(id))
    }

    fn free_memory(&self, mem: MemoryId) -> Result<()> {
        self.buffers.lock().unwrap().remove(&mem.0);
        Ok(())
    }

    fn memory_size(&self, mem: MemoryId) -> usize {
        self.buffers.lock().unwrap().get(&mem.0).map(|b| b.slice.len()).unwrap_or(0)
    }

    fn copy_from_host(&self, mem: MemoryId, src: &[u8], dst_offset: usize) -> Result<()> {
        let mut bufs = self.buffers.lock().unwrap();
        let buf = bufs
            .get_mut(&mem.0)
            .ok_or_else(|| Error::TransferError(format!("unknown buffer {mem:?}")))?;
        let mut window = buf.slice.try_slice_mut(dst_offset..dst_offset + src.len()).ok_or_else(|| {
            Error::TransferError("destination window out of range".into())
        })?;
        self.device
            .htod_copy_into(src.to_vec(), &mut window)
            .map_err(|e| Error::TransferError(e.to_string()))
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
        let src_bytes = {
            let src_buf = bufs
                .get(&src.0)
                .ok_or_else(|| Error::TransferError(format!("unknown buffer {src:?}")))?;
            let window = src_buf
                .slice
                .try_slice(src_offset..src_offset + bytes)
                .ok_or_else(|| Error::TransferError("source window out of range".into()))?;
            self.device
                .dtoh_sync_copy(&window)
                .map_err(|e| Error::TransferError(e.to_string()))?
        };
        let dst_buf = bufs
            .get_mut(&dst.0)
            .ok_or_else(|| Error::TransferError(format!("unknown buffer {dst:?}")))?;
        let mut window = dst_buf
            .slice
            .try_slice_mut(dst_offset..dst_offset + bytes)
            .ok_or_else(|| Error::TransferError("destination window out of range".into()))?;
        self.device
            .htod_copy_into(src_bytes, &mut window)
            .map_err(|e| Error::TransferError(e.to_string()))
    }

    fn copy_to_host(&self, mem: MemoryId, dst: &mut [u8], src_offset: usize) -> Result<()> {
        let bufs = self.buffers.lock().unwrap();
        let buf = bufs
            .get(&mem.0)
            .ok_or_else(|| Error::TransferError(format!("unknown buffer {mem:?}")))?;
        let window = buf
            .slice
            .try_slice(src_offset..src_offset + dst.len())
            .ok_or_else(|| Error::TransferError("source window out of range".into()))?;
        let host = self.device.dtoh_sync_copy(&window).map_err(|e| Error::TransferError(e.to_string()))?;
        dst.copy_from_slice(&host);
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
        let mut arch_flag = String::new();
        if !compiler.flags.contains("-arch=sm_") {
            let (major, minor) = self.compute_capability()?;
            arch_flag = format!(" -arch=sm_{major}{minor} ");
        }

        let run = |extra: &str, out: Option<&Path>| -> Result<()> {
            let mut command = String::new();
            if !compiler.env_prelude.is_empty() {
                command.push_str(&compiler.env_prelude);
                command.push_str(" && ");
            }
            command.push_str(&compiler.compiler);
            command.push(' ');
            command.push_str(&compiler.flags);
            command.push_str(&arch_flag);
            command.push_str(extra);
            if let Some(out) = out {
                command.push_str(" -o ");
                command.push_str(&out.to_string_lossy());
            }
            command.push_str(" -x cu ");
            command.push_str(&intermediate.to_string_lossy());

            info!(%command, "invoking nvcc");
            let output = Command::new("sh").arg("-c").arg(&command).output().map_err(|e| {
                Error::CompileError {
                    path: intermediate.to_path_buf(),
                    log: format!("failed to spawn nvcc: {e}"),
                }
            })?;
            if !output.status.success() {
                return Err(Error::CompileError {
                    path: intermediate.to_path_buf(),
                    log: String::from_utf8_lossy(&output.stderr).into_owned(),
                });
            }
            Ok(())
        };

        // First pass: syntax/semantic check only, discards output (mirrors
        // the original backend's "PTX check" pass before the real one).
        run("-Xptxas -v,-dlcm=cg,-abi=no -c", None)?;
        // Second pass: actually emit PTX to the cache artifact path.
        run("-ptx -I.", Some(artifact_path))?;

        Ok(())
    }

    fn load_artifact(&self, artifact_path: &Path, function_name: &str) -> Result<KernelId> {
        let ptx = std::fs::read_to_string(artifact_path).map_err(|e| Error::LoadError {
            path: artifact_path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let module_name = function_name.to_string();
        self.device
            .load_ptx(
                cudarc::nvrtc::Ptx::from_src(ptx),
                &module_name,
                &[Box::leak(function_name.to_string().into_boxed_str())],
            )
            .map_err(|e| Error::LoadError {
                path: artifact_path.to_path_buf(),
                reason: e.to_string(),
            })?;

        let func = self
            .device
            .get_func(&module_name, function_name)
            .ok_or_else(|| Error::LoadError {
                path: artifact_path.to_path_buf(),
                reason: format!("function {function_name} not present in module"),
            })?;

        let id = self.next_kernel.fetch_add(1, Ordering::SeqCst);
        self.kernels.lock().unwrap().insert(id, LoadedKernel { func });
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
        let _ = kernel;
        // §9 open question, resolved: lazy and constant here too, even
        // though the warp width never changes across CUDA devices.
        let v = 32;
        cache.insert(kernel.0, v);
        Ok(v)
    }

    fn launch(
        &self,
        stream: StreamId,
        kernel: KernelId,
        grid: Dim3,
        block: Dim3,
        args: &[KernelArg],
    ) -> Result<()> {
        let kernels = self.kernels.lock().unwrap();
        let loaded = kernels
            .get(&kernel.0)
            .ok_or_else(|| Error::LaunchError(format!("unknown kernel {kernel:?}")))?;

        let bufs = self.buffers.lock().unwrap();
        let scalar_storage: Vec<Scalar> = args
            .iter()
            .filter_map(|a| match a {
                KernelArg::Scalar(s) => Some(*s),
                KernelArg::Buffer(_) => None,
            })
            .collect();

        let config = LaunchConfig {
            grid_dim: (grid.x as u32, grid.y as u32, grid.z as u32),
            block_dim: (block.x as u32, block.y as u32, block.z as u32),
            shared_mem_bytes: 0,
        };

        // cudarc's `launch` builder takes a `LaunchArgs` accumulator; push
        // in original order, buffers by reference, scalars by value.
        let mut builder = self.device.launch_builder(&loaded.func);
        let mut scalar_iter = scalar_storage.iter();
        for arg in args {
            match arg {
                KernelArg::Scalar(_) => {
                    let s = scalar_iter.next().expect("scalar storage pre-sized to args");
                    push_scalar_arg(&mut builder, *s);
                }
                KernelArg::Buffer(mem) => {
                    let buf = bufs
                        .get(&mem.id().0)
                        .ok_or_else(|| Error::LaunchError(format!("unknown buffer {:?}", mem.id())))?;
                    builder.arg(&buf.slice);
                }
            }
        }

        // `builder` borrows from `bufs` (buffer args are pushed by
        // reference), so both must stay alive until the launch call
        // itself returns.
        let streams = self.streams.lock().unwrap();
        let result = if stream == self.initial_stream {
            unsafe { builder.launch(config) }
        } else {
            let s = streams
                .get(&stream.0)
                .ok_or_else(|| Error::LaunchError(format!("unknown stream {stream:?}")))?;
            unsafe { builder.launch_on_stream(s, config) }
        };
        drop(streams);
        drop(bufs);

        result.map_err(|e| Error::LaunchError(e.to_string()))
    }
}

fn push_scalar_arg(builder: &mut cudarc::driver::LaunchArgs<'_>, scalar: Scalar) {
    match scalar {
        Scalar::Int(v) => builder.arg(&v),
        Scalar::Long(v) => builder.arg(&v),
        Scalar::UInt(v) => builder.arg(&v),
        Scalar::Float32(v) => builder.arg(&v),
        Scalar::Float64(v) => builder.arg(&v),
        Scalar::I8(v) => builder.arg(&v),
        Scalar::I16(v) => builder.arg(&v),
        Scalar::I64(v) => builder.arg(&v),
        Scalar::U8(v) => builder.arg(&v),
        Scalar::U16(v) => builder.arg(&v),
        Scalar::U64(v) => builder.arg(&v),
        Scalar::Char(v) => builder.arg(&v),
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arch_flag_is_only_injected_when_absent() {
        let with_arch = CompilerSettings {
            compiler: "nvcc".into(),
            env_prelude: String::new(),
            flags: "-arch=sm_75 -O3".into(),
        };
        assert!(with_arch.flags.contains("-arch=sm_"));

        let without_arch = CompilerSettings {
            compiler: "nvcc".into(),
            env_prelude: String::new(),
            flags: "-O3".into(),
        };
        assert!(!without_arch.flags.contains("-arch=sm_"));
    }

    // Everything past arch-flag selection needs a real CUDA driver and
    // `nvcc`; exercised end-to-end by the host-shared backend's tests
    // instead, against the same cache coordinator.
}
