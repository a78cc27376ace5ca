mod fingerprint;
mod lock;
mod translator;

pub use fingerprint::fingerprint;
pub use lock::DEFAULT_LOCK_TIMEOUT;
pub use translator::{PassthroughTranslator, Translator};

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::backend::{CompilerSettings, KernelBackend, KernelId};
use crate::error::{Error, Result};
use crate::geometry::BackendKind;
use crate::kernel_info::KernelInfo;

/// Runs the cache coordinator algorithm of §4.2 and returns a loaded,
/// bound kernel. This is the only entry point `Device::build_kernel_from_source`
/// calls into.
#[allow(clippy::too_many_arguments)]
pub fn build_from_source(
    backend: &Arc<dyn KernelBackend>,
    translator: &dyn Translator,
    source_path: &Path,
    function_name: &str,
    kernel_info: &KernelInfo,
    compiler: &CompilerSettings,
    lock_timeout: Duration,
) -> Result<KernelId> {
    let backend_kind = backend.kind();

    let salt = format!(
        "{}{}",
        fingerprint::fingerprint(
            backend_kind,
            backend.platform_id(),
            backend.device_id(),
            kernel_info,
            compiler,
            function_name,
        ),
        function_name,
    );

    let artifact = translator.cached_name(source_path, &salt);

    if artifact.exists() {
        info!(path = %artifact.display(), "cached hit");
        return backend.load_artifact(&artifact, function_name);
    }

    if !lock::have_file(&artifact) {
        info!(path = %artifact.display(), "another producer is building, waiting");
        let became_producer = lock::wait_for_file(&artifact, lock_timeout);
        if !became_producer {
            return backend.load_artifact(&artifact, function_name);
        }
        // We stole an abandoned claim: fall through and produce it ourselves.
    }

    let result = produce(backend, translator, source_path, &artifact, function_name, kernel_info, compiler);

    lock::release_file(&artifact);
    result
}

fn produce(
    backend: &Arc<dyn KernelBackend>,
    translator: &dyn Translator,
    source_path: &Path,
    artifact: &Path,
    function_name: &str,
    kernel_info: &KernelInfo,
    compiler: &CompilerSettings,
) -> Result<KernelId> {
    let macro_header = macro_header(backend.kind(), kernel_info);

    let intermediate =
        translator.create_intermediate_source(source_path, artifact, &macro_header, kernel_info)?;

    info!(function = function_name, path = %intermediate.display(), "compiling");

    if let Err(e) = backend.compile_artifact(&intermediate, artifact, kernel_info, compiler) {
        return Err(match e {
            Error::CompileError { path, log } => Error::CompileError { path, log },
            other => Error::CompileError {
                path: artifact.to_path_buf(),
                log: other.to_string(),
            },
        });
    }

    info!(function = function_name, path = %artifact.display(), "compiled");

    backend.load_artifact(artifact, function_name).map_err(|e| match e {
        Error::LoadError { path, reason } => Error::LoadError { path, reason },
        other => Error::LoadError {
            path: artifact.to_path_buf(),
            reason: other.to_string(),
        },
    })
}

/// Backend-specific header of macro definitions folded into the
/// intermediate source (§4.2 step 4): `OCCA_USING_GPU`, `OCCA_USING_{BACKEND}`,
/// plus every `kernel_info` define (the defines themselves are rendered by
/// the translator from `KernelInfo::render_defines`, this only adds the
/// keyword macros the backend contributes).
fn macro_header(kind: BackendKind, _kernel_info: &KernelInfo) -> String {
    let mut header = String::new();
    match kind {
        BackendKind::DriverCompute => {
            header.push_str("#define OCCA_USING_GPU 1\n");
            header.push_str("#define OCCA_USING_DRIVERCOMPUTE 1\n");
        }
        BackendKind::CrossVendorCompute => {
            header.push_str("#define OCCA_USING_GPU 1\n");
            header.push_str("#define OCCA_USING_CROSSVENDOR 1\n");
        }
        BackendKind::HostShared => {
            header.push_str("#define OCCA_USING_CPU 1\n");
            header.push_str("#define OCCA_USING_HOSTSHARED 1\n");
        }
    }
    header
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Dim3, KernelArg};
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingBackend {
        compile_count: AtomicUsize,
        fail_until: Option<usize>,
        next_id: AtomicU64,
        loaded: Mutex<Vec<PathBuf>>,
    }

    impl CountingBackend {
        fn new() -> Arc<Self> {
            Self::with_fail_until(0)
        }

        fn with_fail_until(fail_until: usize) -> Arc<Self> {
            Arc::new(Self {
                compile_count: AtomicUsize::new(0),
                fail_until: Some(fail_until).filter(|n| *n > 0),
                next_id: AtomicU64::new(1),
                loaded: Mutex::new(Vec::new()),
            })
        }

        fn compiles(&self) -> usize {
            self.compile_count.load(Ordering::SeqCst)
        }
    }

    impl KernelBackend for CountingBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::HostShared
        }
        fn platform_id(&self) -> i32 {
            0
        }
        fn device_id(&self) -> i32 {
            0
        }
        fn initial_stream(&self) -> crate::backend::StreamId {
            crate::backend::StreamId(0)
        }
        fn simd_width(&self) -> Result<u32> {
            Ok(8)
        }
        fn flush(&self, _s: crate::backend::StreamId) -> Result<()> {
            Ok(())
        }
        fn finish(&self, _s: crate::backend::StreamId) -> Result<()> {
            Ok(())
        }
        fn gen_stream(&self) -> Result<crate::backend::StreamId> {
            Ok(crate::backend::StreamId(0))
        }
        fn free_stream(&self, _s: crate::backend::StreamId) -> Result<()> {
            Ok(())
        }
        fn tag_stream(&self, _s: crate::backend::StreamId) -> Result<crate::backend::EventId> {
            Ok(crate::backend::EventId(0))
        }
        fn time_between(&self, _a: crate::backend::EventId, _b: crate::backend::EventId) -> Result<f64> {
            Ok(0.0)
        }
        fn malloc(&self, _bytes: usize, _source: Option<&[u8]>) -> Result<crate::backend::MemoryId> {
            Ok(crate::backend::MemoryId(0))
        }
        fn free_memory(&self, _m: crate::backend::MemoryId) -> Result<()> {
            Ok(())
        }
        fn memory_size(&self, _m: crate::backend::MemoryId) -> usize {
            0
        }
        fn copy_from_host(&self, _m: crate::backend::MemoryId, _s: &[u8], _o: usize) -> Result<()> {
            Ok(())
        }
        fn copy_from_device(
            &self,
            _d: crate::backend::MemoryId,
            _s: crate::backend::MemoryId,
            _b: usize,
            _do_: usize,
            _so: usize,
        ) -> Result<()> {
            Ok(())
        }
        fn copy_to_host(&self, _m: crate::backend::MemoryId, _d: &mut [u8], _o: usize) -> Result<()> {
            Ok(())
        }
        fn copy_to_device(
            &self,
            _s: crate::backend::MemoryId,
            _d: crate::backend::MemoryId,
            _b: usize,
            _do_: usize,
            _so: usize,
        ) -> Result<()> {
            Ok(())
        }
        fn async_copy_from_host(
            &self,
            _st: crate::backend::StreamId,
            _m: crate::backend::MemoryId,
            _s: &[u8],
            _o: usize,
        ) -> Result<()> {
            Ok(())
        }
        fn async_copy_from_device(
            &self,
            _st: crate::backend::StreamId,
            _d: crate::backend::MemoryId,
            _s: crate::backend::MemoryId,
            _b: usize,
            _do_: usize,
            _so: usize,
        ) -> Result<()> {
            Ok(())
        }
        fn async_copy_to_host(
            &self,
            _st: crate::backend::StreamId,
            _m: crate::backend::MemoryId,
            _d: &mut [u8],
            _o: usize,
        ) -> Result<()> {
            Ok(())
        }
        fn async_copy_to_device(
            &self,
            _st: crate::backend::StreamId,
            _s: crate::backend::MemoryId,
            _d: crate::backend::MemoryId,
            _b: usize,
            _do_: usize,
            _so: usize,
        ) -> Result<()> {
            Ok(())
        }
        fn compile_artifact(
            &self,
            _intermediate: &std::path::Path,
            artifact_path: &std::path::Path,
            _kernel_info: &KernelInfo,
            _compiler: &CompilerSettings,
        ) -> Result<()> {
            let n = self.compile_count.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some(fail_until) = self.fail_until {
                if n <= fail_until {
                    return Err(Error::CompileError {
                        path: artifact_path.to_path_buf(),
                        log: "syntax error".into(),
                    });
                }
            }
            std::fs::write(artifact_path, b"binary").unwrap();
            Ok(())
        }
        fn load_artifact(&self, artifact_path: &std::path::Path, _function_name: &str) -> Result<KernelId> {
            self.loaded.lock().unwrap().push(artifact_path.to_path_buf());
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(KernelId(id))
        }
        fn free_kernel(&self, _k: KernelId) -> Result<()> {
            Ok(())
        }
        fn preferred_dim_size(&self, _k: KernelId) -> Result<u32> {
            Ok(32)
        }
        fn launch(
            &self,
            _stream: crate::backend::StreamId,
            _kernel: KernelId,
            _grid: Dim3,
            _block: Dim3,
            _args: &[KernelArg],
        ) -> Result<()> {
            Ok(())
        }
    }

    fn settings() -> CompilerSettings {
        CompilerSettings {
            compiler: "cc".into(),
            env_prelude: String::new(),
            flags: String::new(),
        }
    }

    #[test]
    fn second_build_does_not_recompile() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("f.occa");
        std::fs::write(&source, "kernel void k() {}").unwrap();

        let concrete = CountingBackend::new();
        let backend: Arc<dyn KernelBackend> = concrete.clone();
        let translator = PassthroughTranslator::new(dir.path());
        let info = KernelInfo::new().add_define("OCCA_USE", 1);

        build_from_source(&backend, &translator, &source, "k", &info, &settings(), DEFAULT_LOCK_TIMEOUT).unwrap();
        assert_eq!(concrete.compiles(), 1);

        build_from_source(&backend, &translator, &source, "k", &info, &settings(), DEFAULT_LOCK_TIMEOUT).unwrap();
        assert_eq!(concrete.compiles(), 1, "cached hit must not invoke the compiler again");
    }

    #[test]
    fn compile_failure_releases_claim_and_reports_log() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("bad.occa");
        std::fs::write(&source, "kernel void k() { !!! }").unwrap();

        let concrete = CountingBackend::with_fail_until(1);
        let backend: Arc<dyn KernelBackend> = concrete.clone();
        let translator = PassthroughTranslator::new(dir.path());
        let info = KernelInfo::new();

        let err = build_from_source(&backend, &translator, &source, "k", &info, &settings(), DEFAULT_LOCK_TIMEOUT)
            .unwrap_err();
        let Error::CompileError { log, .. } = err else {
            panic!("expected CompileError, got {err:?}");
        };
        assert!(log.contains("syntax error"));

        // A corrected source under the same function name but different
        // content yields a new fingerprint and succeeds.
        std::fs::write(&source, "kernel void k() { /* fixed */ }").unwrap();
        build_from_source(&backend, &translator, &source, "k", &info, &settings(), DEFAULT_LOCK_TIMEOUT).unwrap();
    }

    #[test]
    fn concurrent_builds_compile_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("f.occa");
        std::fs::write(&source, "kernel void k() {}").unwrap();

        let concrete = CountingBackend::new();
        let info = KernelInfo::new();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let backend: Arc<dyn KernelBackend> = concrete.clone();
                let cache_dir = dir.path().to_path_buf();
                let source = source.clone();
                let info = info.clone();
                std::thread::spawn(move || {
                    let translator = PassthroughTranslator::new(&cache_dir);
                    build_from_source(&backend, &translator, &source, "k", &info, &settings(), DEFAULT_LOCK_TIMEOUT)
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap().unwrap();
        }

        assert_eq!(concrete.compiles(), 1);
    }
}
