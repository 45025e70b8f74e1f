//! OTF Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared plumbing for the OTF workspace members.
//!
//! - **Logging**: one place that knows how to turn a [`logging::LogConfig`]
//!   into a global `tracing` subscriber, used by every binary in the workspace.
//!
//! # Example
//!
//! ```no_run
//! use otf_common::logging::{init_logging, LogConfig, LogLevel};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::builder().level(LogLevel::Debug).build();
//!     init_logging(&config)?;
//!     tracing::info!("ready");
//!     Ok(())
//! }
//! ```

pub mod logging;
