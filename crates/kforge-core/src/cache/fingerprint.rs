use sha2::{Digest, Sha256};

use crate::backend::CompilerSettings;
use crate::geometry::BackendKind;
use crate::kernel_info::KernelInfo;

/// Deterministic fingerprint (§4.2 step 1) over every input that changes
/// the artifact a build would produce. Two calls with equal arguments
/// produce an equal fingerprint across processes and runs.
pub fn fingerprint(
    backend_kind: BackendKind,
    platform_id: i32,
    device_id: i32,
    kernel_info: &KernelInfo,
    compiler: &CompilerSettings,
    function_name: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(backend_kind.fingerprint_tag().as_bytes());
    hasher.update(platform_id.to_le_bytes());
    hasher.update(device_id.to_le_bytes());
    hasher.update(kernel_info.salt().as_bytes());
    hasher.update(compiler.env_prelude.as_bytes());
    hasher.update(compiler.compiler.as_bytes());
    hasher.update(compiler.flags.as_bytes());
    hasher.update(function_name.as_bytes());

    crate::util::hex_encode(&hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> CompilerSettings {
        CompilerSettings {
            compiler: "cc".into(),
            env_prelude: String::new(),
            flags: "-O3".into(),
        }
    }

    #[test]
    fn identical_inputs_produce_identical_fingerprint() {
        let info = KernelInfo::new().add_define("N", 4096);
        let a = fingerprint(BackendKind::HostShared, 0, 0, &info, &settings(), "vectorAdd");
        let b = fingerprint(BackendKind::HostShared, 0, 0, &info, &settings(), "vectorAdd");
        assert_eq!(a, b);
    }

    #[test]
    fn different_function_name_changes_fingerprint() {
        let info = KernelInfo::new();
        let a = fingerprint(BackendKind::HostShared, 0, 0, &info, &settings(), "vectorAdd");
        let b = fingerprint(BackendKind::HostShared, 0, 0, &info, &settings(), "vectorSub");
        assert_ne!(a, b);
    }

    #[test]
    fn different_backend_kind_changes_fingerprint() {
        let info = KernelInfo::new();
        let a = fingerprint(BackendKind::HostShared, 0, 0, &info, &settings(), "k");
        let b = fingerprint(BackendKind::DriverCompute, 0, 0, &info, &settings(), "k");
        assert_ne!(a, b);
    }
}
