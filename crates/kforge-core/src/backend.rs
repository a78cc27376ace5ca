use std::path::Path;

use crate::error::Result;
use crate::geometry::{BackendKind, Dim3, KernelArg};
use crate::kernel_info::KernelInfo;

/// Opaque, backend-owned stream handle. The native queue/stream object lives
/// inside the backend implementation; callers only ever see this id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub u64);

/// Opaque, backend-owned event handle, consumed by `time_between`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub u64);

/// Opaque, backend-owned device-memory handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemoryId(pub u64);

/// Opaque, backend-owned compiled-kernel handle (module + entry point).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelId(pub u64);

/// Compiler configuration captured on the `Device` and handed to the backend
/// at build time. Lives on the facade (§4.5) rather than the backend so that
/// setters are simple field writes that only affect future builds.
#[derive(Debug, Clone)]
pub struct CompilerSettings {
    pub compiler: String,
    pub env_prelude: String,
    pub flags: String,
}

/// The capability set every backend implements (§4.1). Object-safe: no
/// generics or associated types, so a `Device` can hold a single
/// `Arc<dyn KernelBackend>` regardless of which concrete backend produced it
/// (design-notes §9: tagged dispatch through a dynamically-typed handle).
///
/// A backend instance is already bound to one device by the time it
/// implements this trait; `setup` (driver init, context creation, initial
/// stream) runs inside each backend crate's constructor, not here, since
/// constructing a trait object from inside the trait itself isn't possible.
pub trait KernelBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn platform_id(&self) -> i32;
    fn device_id(&self) -> i32;

    /// The stream created during `setup` (§4.1), before any user call to
    /// `gen_stream`. `Device::new` adopts this as the initial current
    /// stream.
    fn initial_stream(&self) -> StreamId;

    /// Hardware SIMD / warp / wavefront width. Cached by the caller after
    /// the first call (§4.1, §9 open question: populated lazily everywhere).
    fn simd_width(&self) -> Result<u32>;

    /// Non-blocking flush of the given stream.
    fn flush(&self, stream: StreamId) -> Result<()>;

    /// Blocks the calling thread until `stream` has drained.
    fn finish(&self, stream: StreamId) -> Result<()>;

    fn gen_stream(&self) -> Result<StreamId>;
    fn free_stream(&self, stream: StreamId) -> Result<()>;

    /// Records a marker on `stream`, returning an event consumed by
    /// `time_between`.
    fn tag_stream(&self, stream: StreamId) -> Result<EventId>;

    /// Synchronizes on `end`, then returns the elapsed seconds between
    /// `start` and `end`. Releases both events.
    fn time_between(&self, start: EventId, end: EventId) -> Result<f64>;

    /// Allocates `bytes` of device-visible storage. If `source` is
    /// `Some`, synchronously copies it in before returning.
    fn malloc(&self, bytes: usize, source: Option<&[u8]>) -> Result<MemoryId>;
    fn free_memory(&self, mem: MemoryId) -> Result<()>;
    fn memory_size(&self, mem: MemoryId) -> usize;

    fn copy_from_host(&self, mem: MemoryId, src: &[u8], dst_offset: usize) -> Result<()>;
    fn copy_from_device(
        &self,
        dst: MemoryId,
        src: MemoryId,
        bytes: usize,
        dst_offset: usize,
        src_offset: usize,
    ) -> Result<()>;
    fn copy_to_host(&self, mem: MemoryId, dst: &mut [u8], src_offset: usize) -> Result<()>;
    fn copy_to_device(
        &self,
        src: MemoryId,
        dst: MemoryId,
        bytes: usize,
        dst_offset: usize,
        src_offset: usize,
    ) -> Result<()>;

    fn async_copy_from_host(
        &self,
        stream: StreamId,
        mem: MemoryId,
        src: &[u8],
        dst_offset: usize,
    ) -> Result<()>;
    fn async_copy_from_device(
        &self,
        stream: StreamId,
        dst: MemoryId,
        src: MemoryId,
        bytes: usize,
        dst_offset: usize,
        src_offset: usize,
    ) -> Result<()>;
    fn async_copy_to_host(
        &self,
        stream: StreamId,
        mem: MemoryId,
        dst: &mut [u8],
        src_offset: usize,
    ) -> Result<()>;
    fn async_copy_to_device(
        &self,
        stream: StreamId,
        src: MemoryId,
        dst: MemoryId,
        bytes: usize,
        dst_offset: usize,
        src_offset: usize,
    ) -> Result<()>;

    /// Backend-specific compile step invoked by the cache coordinator
    /// (§4.2 step 5) once the intermediate source has been produced by the
    /// translator collaborator. Writes the artifact to `artifact_path`.
    fn compile_artifact(
        &self,
        intermediate: &Path,
        artifact_path: &Path,
        kernel_info: &KernelInfo,
        compiler: &CompilerSettings,
    ) -> Result<()>;

    /// Loads an artifact already on disk (freshly compiled, or a prior
    /// cache hit) and resolves `function_name`, returning a bound kernel.
    fn load_artifact(&self, artifact_path: &Path, function_name: &str) -> Result<KernelId>;

    fn free_kernel(&self, kernel: KernelId) -> Result<()>;

    /// Device-reported block-multiple hint for `kernel`. Queried once and
    /// cached by the facade.
    fn preferred_dim_size(&self, kernel: KernelId) -> Result<u32>;

    /// Enqueues `kernel` on `stream` with the given geometry and argument
    /// list (already validated against `MAX_ARGS` by the facade).
    fn launch(
        &self,
        stream: StreamId,
        kernel: KernelId,
        grid: Dim3,
        block: Dim3,
        args: &[KernelArg],
    ) -> Result<()>;
}
