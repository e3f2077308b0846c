use std::fmt;

/// Command list category.
///
/// Categories share one list type; they differ only in what may be recorded and
/// whether the descriptor heap is attached.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CommandCategory {
    /// General compute work: pipelines, resource tables, dispatches and copies.
    Compute,
    /// Transfer-only work. No descriptor heap, no pipelines.
    Copy,
}

impl CommandCategory {
    pub const ALL: [CommandCategory; 2] = [CommandCategory::Compute, CommandCategory::Copy];

    /// Whether lists of this category get the shared descriptor heap.
    #[inline]
    pub fn uses_descriptor_heap(self) -> bool {
        matches!(self, CommandCategory::Compute)
    }

    #[inline]
    pub(crate) fn index(self) -> usize {
        match self {
            CommandCategory::Compute => 0,
            CommandCategory::Copy => 1,
        }
    }
}

impl fmt::Display for CommandCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CommandCategory::Compute => "compute",
            CommandCategory::Copy => "copy",
        })
    }
}
