use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use crate::backend::{CompilerSettings, KernelBackend, StreamId};
use crate::cache::{self, PassthroughTranslator, Translator, DEFAULT_LOCK_TIMEOUT};
use crate::error::{Error, Result};
use crate::kernel::Kernel;
use crate::kernel_info::KernelInfo;
use crate::memory::Memory;
use crate::registry;

/// User-facing device handle (§4.5). Holds a shared, type-erased pointer
/// to the backend implementation plus the small metadata bag the facade
/// owns on the backend's behalf: current stream selection, compiler
/// settings, and cached device-wide queries.
///
/// Cloning a `Device` aliases the same backend and metadata (shallow copy,
/// §3); call [`Device::free`] to release resources explicitly.
#[derive(Clone)]
pub struct Device {
    backend: Arc<dyn KernelBackend>,
    state: Arc<DeviceState>,
}

struct DeviceState {
    current_stream: Mutex<StreamId>,
    owned_streams: Mutex<HashSet<StreamId>>,
    compiler: Mutex<CompilerSettings>,
    bytes_allocated: AtomicUsize,
    simd_width: Mutex<Option<u32>>,
    cache_dir: PathBuf,
    lock_timeout: Duration,
    translator: Box<dyn Translator>,
}

impl Device {
    /// Wraps an already-initialized backend (driver init, context, and
    /// initial stream happened inside the backend's own constructor) into
    /// the public facade, and registers it for reverse-order teardown.
    ///
    /// Reads `KFORGE_CACHE_DIR` once, falling back to a temp-dir default
    /// if unset (§4.8).
    pub fn new(backend: Arc<dyn KernelBackend>, compiler: CompilerSettings) -> Result<Self> {
        let cache_dir = std::env::var("KFORGE_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::temp_dir().join("kforge-cache"));
        Self::with_cache_dir(backend, compiler, cache_dir)
    }

    pub fn with_cache_dir(
        backend: Arc<dyn KernelBackend>,
        compiler: CompilerSettings,
        cache_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)
            .map_err(|e| Error::BackendInit(format!("failed to create cache dir: {e}")))?;

        let lock_timeout = std::env::var("KFORGE_CACHE_LOCK_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_LOCK_TIMEOUT);

        let initial_stream = backend.initial_stream();
        let mut owned = HashSet::new();
        owned.insert(initial_stream);

        let translator = Box::new(PassthroughTranslator::new(cache_dir.clone()));

        let state = Arc::new(DeviceState {
            current_stream: Mutex::new(initial_stream),
            owned_streams: Mutex::new(owned),
            compiler: Mutex::new(compiler),
            bytes_allocated: AtomicUsize::new(0),
            simd_width: Mutex::new(None),
            cache_dir,
            lock_timeout,
            translator,
        });

        registry::register(backend.clone());

        Ok(Self { backend, state })
    }

    pub fn platform_id(&self) -> i32 {
        self.backend.platform_id()
    }

    pub fn device_id(&self) -> i32 {
        self.backend.device_id()
    }

    pub fn bytes_allocated(&self) -> usize {
        self.state.bytes_allocated.load(Ordering::SeqCst)
    }

    pub fn current_stream(&self) -> StreamId {
        *self.state.current_stream.lock().unwrap()
    }

    /// Selects `stream` as current. Must be a stream this device owns.
    pub fn set_current_stream(&self, stream: StreamId) -> Result<()> {
        if !self.state.owned_streams.lock().unwrap().contains(&stream) {
            return Err(Error::Unsupported(
                "stream does not belong to this device".into(),
            ));
        }
        *self.state.current_stream.lock().unwrap() = stream;
        Ok(())
    }

    pub fn gen_stream(&self) -> Result<StreamId> {
        let stream = self.backend.gen_stream()?;
        self.state.owned_streams.lock().unwrap().insert(stream);
        debug!(?stream, "stream created");
        Ok(stream)
    }

    pub fn free_stream(&self, stream: StreamId) -> Result<()> {
        self.backend.free_stream(stream)?;
        self.state.owned_streams.lock().unwrap().remove(&stream);
        Ok(())
    }

    pub fn simd_width(&self) -> Result<u32> {
        let mut cached = self.state.simd_width.lock().unwrap();
        if let Some(w) = *cached {
            return Ok(w);
        }
        let w = self.backend.simd_width()?;
        *cached = Some(w);
        Ok(w)
    }

    pub fn flush(&self) -> Result<()> {
        self.backend.flush(self.current_stream())
    }

    pub fn finish(&self) -> Result<()> {
        self.backend.finish(self.current_stream())
    }

    /// Records a marker on the current stream.
    pub fn tag_stream(&self) -> Result<crate::backend::EventId> {
        self.backend.tag_stream(self.current_stream())
    }

    /// Synchronizes on `end` and returns elapsed seconds since `start`.
    pub fn time_between(&self, start: crate::backend::EventId, end: crate::backend::EventId) -> Result<f64> {
        self.backend.time_between(start, end)
    }

    /// Sets the compiler name used by future `build_kernel_from_source`
    /// calls on this device. Per §4.5, calling this after an earlier build
    /// only affects builds issued afterward.
    pub fn set_compiler(&self, compiler: impl Into<String>) {
        self.state.compiler.lock().unwrap().compiler = compiler.into();
    }

    pub fn set_compiler_env_prelude(&self, prelude: impl Into<String>) {
        self.state.compiler.lock().unwrap().env_prelude = prelude.into();
    }

    pub fn set_compiler_flags(&self, flags: impl Into<String>) {
        self.state.compiler.lock().unwrap().flags = flags.into();
    }

    pub fn malloc(&self, bytes: usize, source: Option<&[u8]>) -> Result<Memory> {
        let id = self.backend.malloc(bytes, source)?;
        self.state.bytes_allocated.fetch_add(bytes, Ordering::SeqCst);
        Ok(Memory::new(self.backend.clone(), id, bytes))
    }

    pub fn free_memory(&self, mem: &Memory) -> Result<()> {
        let size = mem.size();
        mem.free()?;
        self.state.bytes_allocated.fetch_sub(size, Ordering::SeqCst);
        Ok(())
    }

    /// Routes through the cache coordinator (§4.2).
    pub fn build_kernel_from_source(
        &self,
        path: &Path,
        function_name: &str,
        kernel_info: &KernelInfo,
    ) -> Result<Kernel> {
        let compiler = self.state.compiler.lock().unwrap().clone();
        let id = cache::build_from_source(
            &self.backend,
            self.state.translator.as_ref(),
            path,
            function_name,
            kernel_info,
            &compiler,
            self.state.lock_timeout,
        )?;
        Ok(Kernel::new(self.backend.clone(), id, function_name.to_string()))
    }

    pub fn build_kernel_from_binary(&self, path: &Path, function_name: &str) -> Result<Kernel> {
        let id = self.backend.load_artifact(path, function_name)?;
        Ok(Kernel::new(self.backend.clone(), id, function_name.to_string()))
    }

    pub fn cache_dir(&self) -> &Path {
        &self.state.cache_dir
    }

    /// Releases the context and every stream this device still owns.
    /// Kernels and memory built from this device must be freed first; the
    /// backend's own drop glue releases native resources once every
    /// `Arc<dyn KernelBackend>` clone (including those held by `Kernel`/
    /// `Memory` values) is gone.
    pub fn free(&self) -> Result<()> {
        let streams: Vec<_> = self.state.owned_streams.lock().unwrap().drain().collect();
        for s in streams {
            self.backend.free_stream(s)?;
        }
        registry::unregister(&self.backend);
        Ok(())
    }
}
