use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::kernel_info::KernelInfo;

/// The source-to-backend kernel translator is an external collaborator
/// (§1, §6): it ingests the user's kernel source plus a backend-specific
/// macro header and emits a backend-ready intermediate source file. The
/// cache coordinator only needs the four operations below; how the
/// translator turns the ingest dialect into real source is out of scope
/// here.
pub trait Translator: Send + Sync {
    /// Stable function of `(source_path, salt)`: same inputs, same path,
    /// across processes and runs.
    fn cached_name(&self, source_path: &Path, salt: &str) -> PathBuf;

    /// Produces the backend-ready intermediate source next to
    /// `cache_path`, folding in `info`'s defines and the backend's keyword
    /// macro header. Returns the intermediate source's path.
    fn create_intermediate_source(
        &self,
        source_path: &Path,
        cache_path: &Path,
        macro_header: &str,
        info: &KernelInfo,
    ) -> Result<PathBuf>;
}

/// Default translator: hashes inputs for a stable cache path under a
/// configured cache directory, and materializes the intermediate source by
/// concatenating the macro header, `info`'s defines, and the original
/// source verbatim. A real deployment plugs in a translator that actually
/// understands the ingest dialect; this one assumes the source is already
/// backend-ready and only needs the macro preamble spliced in.
pub struct PassthroughTranslator {
    cache_dir: PathBuf,
}

impl PassthroughTranslator {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }
}

impl Translator for PassthroughTranslator {
    fn cached_name(&self, source_path: &Path, salt: &str) -> PathBuf {
        use sha2::{Digest, Sha256};

        let normalized = source_path
            .canonicalize()
            .unwrap_or_else(|_| source_path.to_path_buf());

        let mut hasher = Sha256::new();
        hasher.update(normalized.to_string_lossy().as_bytes());
        hasher.update(b"|");
        hasher.update(salt.as_bytes());
        let hex = crate::util::hex_encode(&hasher.finalize());

        let stem = source_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "kernel".to_string());

        self.cache_dir.join(format!("{stem}_{hex}.bin"))
    }

    fn create_intermediate_source(
        &self,
        source_path: &Path,
        cache_path: &Path,
        macro_header: &str,
        info: &KernelInfo,
    ) -> Result<PathBuf> {
        let source = std::fs::read_to_string(source_path).map_err(|e| {
            crate::error::Error::CompileError {
                path: source_path.to_path_buf(),
                log: format!("failed to read kernel source: {e}"),
            }
        })?;

        let intermediate_path = cache_path.with_extension("i");
        let mut contents = String::new();
        contents.push_str(macro_header);
        contents.push_str(&info.render_defines());
        contents.push_str(&source);

        std::fs::write(&intermediate_path, contents).map_err(|e| crate::error::Error::CompileError {
            path: intermediate_path.clone(),
            log: format!("failed to write intermediate source: {e}"),
        })?;

        Ok(intermediate_path)
    }
}
