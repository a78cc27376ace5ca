use sha2::{Digest, Sha256};

/// Ordered defines plus free-form flags that parameterize a kernel build.
///
/// `salt()` is a pure function of the content: two `KernelInfo` values with
/// the same defines (irrespective of insertion order) and the same flags
/// salt identically, since the defines are sorted before hashing.
#[derive(Debug, Clone, Default)]
pub struct KernelInfo {
    defines: Vec<(String, String)>,
    flags: String,
}

impl KernelInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_define(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.defines.push((name.into(), value.to_string()));
        self
    }

    pub fn add_flags(mut self, flags: impl AsRef<str>) -> Self {
        if !self.flags.is_empty() {
            self.flags.push(' ');
        }
        self.flags.push_str(flags.as_ref());
        self
    }

    pub fn defines(&self) -> &[(String, String)] {
        &self.defines
    }

    pub fn flags(&self) -> &str {
        &self.flags
    }

    /// Stable content hash used as the salt contribution to a cache fingerprint.
    pub fn salt(&self) -> String {
        let mut sorted = self.defines.clone();
        sorted.sort();

        let mut hasher = Sha256::new();
        for (name, value) in &sorted {
            hasher.update(name.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
            hasher.update(b";");
        }
        hasher.update(self.flags.as_bytes());

        crate::util::hex_encode(&hasher.finalize())
    }

    /// Renders the defines as a block of preprocessor macros, prefixed with
    /// the backend-specific keyword macros the cache coordinator injects
    /// (`OCCA_USING_GPU`, `OCCA_USING_{BACKEND}`, ...). Consumed by the
    /// translator collaborator, never interpreted by the core itself.
    pub fn render_defines(&self) -> String {
        let mut sorted = self.defines.clone();
        sorted.sort();
        sorted
            .iter()
            .map(|(name, value)| format!("#define {name} {value}\n"))
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salt_is_stable_under_define_reordering() {
        let a = KernelInfo::new()
            .add_define("OCCA_USE", 1)
            .add_define("N", 4096);
        let b = KernelInfo::new()
            .add_define("N", 4096)
            .add_define("OCCA_USE", 1);
        assert_eq!(a.salt(), b.salt());
    }

    #[test]
    fn salt_changes_with_flags() {
        let a = KernelInfo::new().add_flags("-O3");
        let b = KernelInfo::new().add_flags("-O2");
        assert_ne!(a.salt(), b.salt());
    }
}
