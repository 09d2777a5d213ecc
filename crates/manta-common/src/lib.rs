//! Manta Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared plumbing for the Manta sync workspace.
//!
//! - **Error Handling**: [`CommonError`] and the [`Result`] alias
//! - **Logging**: `tracing` subscriber setup driven by [`logging::LogConfig`]
//! - **Time**: snapshot timestamp naming and human-readable durations
//!
//! # Example
//!
//! ```no_run
//! use manta_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> manta_common::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     init_logging(&config)?;
//!     tracing::info!("agent starting");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;
pub mod time;

// Re-export commonly used types
pub use error::{CommonError, Result};
