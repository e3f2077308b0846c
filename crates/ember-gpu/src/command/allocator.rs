use std::collections::TryReserveError;
use std::fmt;
use std::mem;
use std::sync::Arc;

use crate::backend::Backend;
use crate::error::{GpuError, Result};
use crate::sync::FenceValue;

use super::{Command, CommandCategory, CommandStream};

/// Identity of an allocator within its device.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct AllocatorId {
    pub category: CommandCategory,
    pub serial: u32,
}

impl fmt::Display for AllocatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.category, self.serial)
    }
}

/// Reusable backing storage for recorded commands.
///
/// The stamp is the fence value of the last submission that read this
/// allocator's storage. The pool only hands the allocator out again once that
/// value is reached.
pub struct CommandAllocator<B: Backend> {
    id: AllocatorId,
    stamp: FenceValue,
    stream: CommandStream<B>,
    /// Storage frozen by the last submission, shared with the queue.
    in_flight: Option<Arc<CommandStream<B>>>,
}

impl<B: Backend> CommandAllocator<B> {
    pub(crate) fn new(
        id: AllocatorId,
        initial_capacity: usize,
    ) -> std::result::Result<Self, TryReserveError> {
        let mut commands = Vec::new();
        commands.try_reserve_exact(initial_capacity)?;

        Ok(Self {
            id,
            stamp: FenceValue::ZERO,
            stream: CommandStream::new(id.category, commands),
            in_flight: None,
        })
    }

    #[inline]
    pub fn id(&self) -> AllocatorId {
        self.id
    }

    #[inline]
    pub fn category(&self) -> CommandCategory {
        self.id.category
    }

    /// Fence value that must be reached before this allocator may be reset.
    #[inline]
    pub fn stamp(&self) -> FenceValue {
        self.stamp
    }

    /// Commands of the current recording, or of the last submission once frozen.
    pub fn recorded(&self) -> &[Command<B>] {
        match &self.in_flight {
            Some(frozen) => frozen.commands(),
            None => self.stream.commands(),
        }
    }

    pub(crate) fn set_stamp(&mut self, stamp: FenceValue) {
        self.stamp = stamp;
    }

    pub(crate) fn record(&mut self, command: Command<B>) {
        self.stream.push(command);
    }

    /// Freezes the current recording for submission.
    ///
    /// Freezing twice returns the same stream, so a batch the queue rejected can
    /// be handed over again.
    pub(crate) fn freeze(&mut self) -> Arc<CommandStream<B>> {
        if let Some(frozen) = &self.in_flight {
            return Arc::clone(frozen);
        }

        let empty = CommandStream::new(self.id.category, Vec::new());
        let frozen = Arc::new(mem::replace(&mut self.stream, empty));
        self.in_flight = Some(Arc::clone(&frozen));
        frozen
    }

    /// Reclaims storage from the last submission and clears it for recording.
    ///
    /// Fails if the queue still holds the frozen stream; the allocator is left
    /// untouched in that case.
    pub(crate) fn reset(&mut self) -> Result<()> {
        if let Some(frozen) = self.in_flight.take() {
            match Arc::try_unwrap(frozen) {
                Ok(stream) => self.stream = stream,
                Err(frozen) => {
                    self.in_flight = Some(frozen);
                    return Err(GpuError::AllocatorInFlight {
                        allocator: self.id,
                        stamp: self.stamp,
                    });
                }
            }
        }

        self.stream.clear();
        Ok(())
    }
}

impl<B: Backend> fmt::Debug for CommandAllocator<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandAllocator")
            .field("id", &self.id)
            .field("stamp", &self.stamp)
            .field("in_flight", &self.in_flight.is_some())
            .finish()
    }
}
