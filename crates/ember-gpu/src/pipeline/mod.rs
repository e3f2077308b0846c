//! Pipeline bundles.
//!
//! The shader compiler produces a binding layout and a compiled pipeline per
//! kernel; this module pairs them and makes them available by [`KernelId`].

mod bundle;
mod library;

pub use bundle::{KernelId, PipelineBundle};
pub use library::PipelineLibrary;
