//! Error types for the submission layer.
//!
//! Faults fall into four families:
//! - invalid state (recording on a closed list, dispatch before a pipeline)
//! - resource exhaustion (allocator limit, descriptor heap capacity)
//! - synchronization misuse (fence values that were never issued)
//! - backend failures reported by the native queue
//!
//! None of them are retried inside this crate.

use thiserror::Error;

use crate::command::{AllocatorId, CommandCategory, ListId, ListState};
use crate::pipeline::KernelId;
use crate::sync::FenceValue;

#[derive(Error, Debug)]
pub enum GpuError {
    // ========================================================================
    // Invalid State
    // ========================================================================
    /// Operation attempted on a command list in the wrong state.
    #[error("cannot {operation} on {category} command list {list}: list is {state}")]
    InvalidState {
        list: ListId,
        category: CommandCategory,
        state: ListState,
        operation: &'static str,
    },

    /// `dispatch` recorded before any `bind_pipeline` on the same list.
    #[error("cannot dispatch on {category} command list {list}: no pipeline bound")]
    NoPipelineBound {
        list: ListId,
        category: CommandCategory,
    },

    /// The list's category cannot record this operation.
    #[error("{category} command list {list} does not support {operation}")]
    UnsupportedOperation {
        list: ListId,
        category: CommandCategory,
        operation: &'static str,
    },

    /// Binding slot outside the root table range.
    #[error("resource table slot {slot} out of range (max {max})")]
    SlotOutOfRange { slot: u32, max: u32 },

    /// Copy region exceeds one of the buffers.
    #[error(
        "copy of {size} bytes out of bounds: src {src_offset}/{src_len}, dst {dst_offset}/{dst_len}"
    )]
    CopyOutOfBounds {
        src_offset: u64,
        src_len: u64,
        dst_offset: u64,
        dst_len: u64,
        size: u64,
    },

    /// A command list was handed to a device that did not create it.
    #[error("command list {list} belongs to another device")]
    ForeignCommandList { list: ListId },

    // ========================================================================
    // Resource Exhaustion
    // ========================================================================
    /// The pool could not construct a new allocator.
    #[error("{category} allocator pool exhausted ({live} live): {reason}")]
    ResourceExhausted {
        category: CommandCategory,
        live: usize,
        reason: String,
    },

    /// The descriptor heap has no contiguous range of the requested size left.
    #[error("descriptor heap exhausted: requested {requested}, {used} of {capacity} in use")]
    HeapExhausted {
        requested: u32,
        used: u32,
        capacity: u32,
    },

    // ========================================================================
    // Synchronization
    // ========================================================================
    /// Query or wait on a fence value the device never handed out.
    #[error("fence value {value} was never issued (last issued {last_issued})")]
    FenceNotIssued {
        value: FenceValue,
        last_issued: FenceValue,
    },

    /// The queue still holds the allocator's recording storage.
    #[error("allocator {allocator} is still referenced by queued work (stamp {stamp})")]
    AllocatorInFlight {
        allocator: AllocatorId,
        stamp: FenceValue,
    },

    // ========================================================================
    // Descriptors & Pipelines
    // ========================================================================
    #[error("descriptor index {index} out of range (capacity {capacity})")]
    DescriptorOutOfRange { index: u32, capacity: u32 },

    /// Descriptors are immutable after publication.
    #[error("descriptor {index} was already written")]
    DescriptorAlreadyWritten { index: u32 },

    /// A bound range references a descriptor nobody published.
    #[error("descriptor {index} was bound before it was written")]
    DescriptorUnwritten { index: u32 },

    #[error("no pipeline registered for kernel '{0}'")]
    UnknownKernel(KernelId),

    #[error("kernel '{0}' already has a pipeline bundle")]
    DuplicateKernel(KernelId),

    // ========================================================================
    // Backend
    // ========================================================================
    /// The native queue stopped accepting work.
    #[error("queue '{0}' is closed")]
    QueueClosed(String),

    /// Native API failure, surfaced verbatim.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Coarse fault family of a [`GpuError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FaultKind {
    InvalidState,
    ResourceExhaustion,
    SyncMisuse,
    Backend,
}

impl GpuError {
    pub fn kind(&self) -> FaultKind {
        match self {
            GpuError::InvalidState { .. }
            | GpuError::NoPipelineBound { .. }
            | GpuError::UnsupportedOperation { .. }
            | GpuError::SlotOutOfRange { .. }
            | GpuError::CopyOutOfBounds { .. }
            | GpuError::ForeignCommandList { .. }
            | GpuError::DescriptorOutOfRange { .. }
            | GpuError::DescriptorAlreadyWritten { .. }
            | GpuError::DescriptorUnwritten { .. }
            | GpuError::UnknownKernel(_)
            | GpuError::DuplicateKernel(_) => FaultKind::InvalidState,
            GpuError::ResourceExhausted { .. } | GpuError::HeapExhausted { .. } => {
                FaultKind::ResourceExhaustion
            }
            GpuError::FenceNotIssued { .. } | GpuError::AllocatorInFlight { .. } => {
                FaultKind::SyncMisuse
            }
            GpuError::QueueClosed(_) | GpuError::Backend(_) => FaultKind::Backend,
        }
    }

    #[inline]
    pub fn is_invalid_state(&self) -> bool {
        self.kind() == FaultKind::InvalidState
    }
}

/// Alias for `Result<T, GpuError>`.
pub type Result<T> = std::result::Result<T, GpuError>;
