use std::fmt;
use std::sync::Arc;

use crate::backend::Backend;

/// Identity of a compute kernel as assigned by the shader compiler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KernelId(Arc<str>);

impl KernelId {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for KernelId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compiled compute pipeline paired with its binding layout.
///
/// Immutable once built; command lists share it through `Arc`.
pub struct PipelineBundle<B: Backend> {
    kernel: KernelId,
    layout: B::BindingLayout,
    pipeline: B::Pipeline,
}

impl<B: Backend> PipelineBundle<B> {
    pub fn new(kernel: impl Into<KernelId>, layout: B::BindingLayout, pipeline: B::Pipeline) -> Self {
        Self {
            kernel: kernel.into(),
            layout,
            pipeline,
        }
    }

    #[inline]
    pub fn kernel(&self) -> &KernelId {
        &self.kernel
    }

    #[inline]
    pub fn layout(&self) -> &B::BindingLayout {
        &self.layout
    }

    #[inline]
    pub fn pipeline(&self) -> &B::Pipeline {
        &self.pipeline
    }
}

impl<B: Backend> fmt::Debug for PipelineBundle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBundle")
            .field("kernel", &self.kernel)
            .finish_non_exhaustive()
    }
}
