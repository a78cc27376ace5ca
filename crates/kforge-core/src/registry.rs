use std::sync::{Arc, Mutex, OnceLock};

use crate::backend::KernelBackend;

/// Process-wide registry of live devices, so the process can tear them down
/// in reverse creation order (§4.5) without the application needing to
/// track that order itself.
pub struct Registry {
    devices: Mutex<Vec<Arc<dyn KernelBackend>>>,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry {
        devices: Mutex::new(Vec::new()),
    })
}

pub(crate) fn register(backend: Arc<dyn KernelBackend>) {
    registry().devices.lock().unwrap().push(backend);
}

pub(crate) fn unregister(backend: &Arc<dyn KernelBackend>) {
    let mut devices = registry().devices.lock().unwrap();
    if let Some(pos) = devices.iter().position(|d| Arc::ptr_eq(d, backend)) {
        devices.remove(pos);
    }
}

/// Number of devices currently registered. Exposed for diagnostics and
/// tests; not part of the stable device lifecycle contract.
pub fn live_device_count() -> usize {
    registry().devices.lock().unwrap().len()
}
