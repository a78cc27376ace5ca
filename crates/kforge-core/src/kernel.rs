use std::sync::{Arc, Mutex};

use crate::backend::{EventId, KernelBackend, KernelId, StreamId};
use crate::error::Result;
use crate::geometry::{Dim3, KernelArg, MAX_ARGS};

/// A compiled kernel bound to one entry point on one device. Cheap to
/// clone (shared handle); destroyed explicitly via [`Kernel::free`].
#[derive(Clone)]
pub struct Kernel {
    backend: Arc<dyn KernelBackend>,
    id: KernelId,
    function_name: String,
    preferred_dim_size: Arc<Mutex<Option<u32>>>,
    last_tags: Arc<Mutex<Option<(EventId, EventId)>>>,
}

impl Kernel {
    pub(crate) fn new(backend: Arc<dyn KernelBackend>, id: KernelId, function_name: String) -> Self {
        Self {
            backend,
            id,
            function_name,
            preferred_dim_size: Arc::new(Mutex::new(None)),
            last_tags: Arc::new(Mutex::new(None)),
        }
    }

    pub fn id(&self) -> KernelId {
        self.id
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    /// Device-reported block-multiple hint, queried lazily on first call
    /// and cached thereafter (§4.3, §9 open question).
    pub fn preferred_dim_size(&self) -> Result<u32> {
        let mut cached = self.preferred_dim_size.lock().unwrap();
        if let Some(v) = *cached {
            return Ok(v);
        }
        let v = self.backend.preferred_dim_size(self.id)?;
        *cached = Some(v);
        Ok(v)
    }

    /// Launches this kernel on `stream` with `grid` outer geometry and
    /// `block` inner geometry, binding `args` in order. Records a start
    /// and end event so a later [`Kernel::time_taken`] can report elapsed
    /// time (§4.3).
    pub fn launch(&self, stream: StreamId, grid: Dim3, block: Dim3, args: &[KernelArg]) -> Result<()> {
        if args.is_empty() || args.len() > MAX_ARGS {
            return Err(crate::error::Error::LaunchError(format!(
                "argument count {} out of range [1, {MAX_ARGS}]",
                args.len()
            )));
        }
        if !grid.is_valid() || !block.is_valid() {
            return Err(crate::error::Error::LaunchError(
                "grid and block geometry must have every axis >= 1".into(),
            ));
        }

        let start = self.backend.tag_stream(stream)?;
        self.backend.launch(stream, self.id, grid, block, args)?;
        let end = self.backend.tag_stream(stream)?;

        *self.last_tags.lock().unwrap() = Some((start, end));
        Ok(())
    }

    /// Blocks on the end event from the most recent [`Kernel::launch`] and
    /// returns the elapsed seconds between its start and end tags.
    pub fn time_taken(&self) -> Result<f64> {
        let tags = self.last_tags.lock().unwrap().take();
        match tags {
            Some((start, end)) => self.backend.time_between(start, end),
            None => Ok(0.0),
        }
    }

    pub fn free(&self) -> Result<()> {
        self.backend.free_kernel(self.id)
    }
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("id", &self.id)
            .field("function_name", &self.function_name)
            .finish()
    }
}
