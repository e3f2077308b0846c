use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::backend::Backend;
use crate::error::{GpuError, Result};

use super::{KernelId, PipelineBundle};

/// Kernel-keyed registry of pipeline bundles.
///
/// Registration takes a short write lock; lookups clone an `Arc` under a read
/// lock and the bundle itself is then used without any locking.
pub struct PipelineLibrary<B: Backend> {
    bundles: RwLock<FxHashMap<KernelId, Arc<PipelineBundle<B>>>>,
}

impl<B: Backend> PipelineLibrary<B> {
    pub fn new() -> Self {
        Self {
            bundles: RwLock::new(FxHashMap::default()),
        }
    }

    /// Publishes a bundle under its kernel id.
    ///
    /// A kernel can only be registered once.
    pub fn register(&self, bundle: PipelineBundle<B>) -> Result<Arc<PipelineBundle<B>>> {
        let mut bundles = self.bundles.write();
        let kernel = bundle.kernel().clone();
        if bundles.contains_key(&kernel) {
            return Err(GpuError::DuplicateKernel(kernel));
        }

        let bundle = Arc::new(bundle);
        bundles.insert(kernel.clone(), Arc::clone(&bundle));
        log::debug!("registered pipeline bundle for kernel '{kernel}'");
        Ok(bundle)
    }

    pub fn get(&self, kernel: &KernelId) -> Result<Arc<PipelineBundle<B>>> {
        self.bundles
            .read()
            .get(kernel)
            .cloned()
            .ok_or_else(|| GpuError::UnknownKernel(kernel.clone()))
    }

    pub fn contains(&self, kernel: &KernelId) -> bool {
        self.bundles.read().contains_key(kernel)
    }

    pub fn len(&self) -> usize {
        self.bundles.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<B: Backend> Default for PipelineLibrary<B> {
    fn default() -> Self {
        Self::new()
    }
}
