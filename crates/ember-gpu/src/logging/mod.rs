//! Logging setup.
//!
//! The crate itself only emits through the `log` facade. Binaries and tests
//! call [`init_logging`] once to route records to `env_logger`.

mod init;

pub use init::{LoggingConfig, init_logging};
