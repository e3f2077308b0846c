//! Ember GPU submission crate.
//!
//! This crate turns "run this compute work" requests into ordered, fence
//! synchronized command lists on a single GPU queue, recycling the command
//! allocators that back each recording.
//!
//! # Structure
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`sync`] | `Fence`, `FenceValue` |
//! | [`command`] | `CommandCategory`, `CommandAllocator`, `AllocatorPool`, `CommandList` |
//! | [`pipeline`] | `KernelId`, `PipelineBundle`, `PipelineLibrary` |
//! | [`binding`] | `DescriptorHeap`, `DescriptorRange` |
//! | [`device`] | `Device`, `DeviceInit`, `DeviceStats` |
//! | [`backend`] | `Backend` trait, `SoftBackend`, `WgpuBackend` |
//! | [`logging`] | `init_logging` |
//!
//! # Quick start
//!
//! ```rust
//! use ember_gpu::backend::soft::{SoftBackend, SoftBuffer, SoftInit};
//! use ember_gpu::command::CommandCategory;
//! use ember_gpu::device::{Device, DeviceInit};
//!
//! let backend = SoftBackend::new(SoftInit::default()).unwrap();
//! let device = Device::new(backend, DeviceInit::default()).unwrap();
//!
//! let src = SoftBuffer::from_bytes(&[1, 2, 3, 4]);
//! let dst = SoftBuffer::zeroed(4);
//!
//! let mut list = device.create_command_list(CommandCategory::Copy).unwrap();
//! list.copy_region(&src, 0, &dst, 0, 4).unwrap();
//! let value = list.execute_and_wait().unwrap();
//!
//! assert!(device.reached(value).unwrap());
//! assert_eq!(dst.to_vec(), vec![1, 2, 3, 4]);
//! ```

pub mod backend;
pub mod binding;
pub mod command;
pub mod device;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod sync;

pub use error::{FaultKind, GpuError, Result};
