use std::path::PathBuf;

/// Uniform error taxonomy shared by every backend.
///
/// Backend crates define their own vendor-error wrapper types and map them
/// into this enum via `From`; nothing above the backend boundary ever sees
/// a vendor error code directly.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("backend initialization failed: {0}")]
    BackendInit(String),

    #[error("no such device: platform {platform_id}, device {device_id}")]
    NoSuchDevice { platform_id: i32, device_id: i32 },

    #[error("context/queue creation failed: {0}")]
    ContextCreate(String),

    #[error("offset {offset} + bytes {bytes} exceeds buffer size {size}")]
    BoundsCheck {
        offset: usize,
        bytes: usize,
        size: usize,
    },

    #[error("compilation of {path:?} failed:\n{log}")]
    CompileError { path: PathBuf, log: String },

    #[error("failed to load artifact {path:?}: {reason}")]
    LoadError { path: PathBuf, reason: String },

    #[error("kernel launch rejected: {0}")]
    LaunchError(String),

    #[error("device<->host transfer failed: {0}")]
    TransferError(String),

    #[error("unsupported on this backend: {0}")]
    Unsupported(String),
}

pub type Result<T> = std::result::Result<T, Error>;
