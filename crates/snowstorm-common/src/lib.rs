//! Snowstorm Common Library
//!
//! Shared error handling and logging setup for the snowstorm workspace.
//!
//! # Overview
//!
//! This crate provides the pieces every snowstorm binary needs:
//!
//! - **Error Handling**: the [`SnowstormError`] type and [`Result`] alias
//! - **Logging**: environment-driven `tracing` subscriber initialization
//!
//! # Example
//!
//! ```no_run
//! use snowstorm_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     init_logging(&config)?;
//!     tracing::info!("ready");
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{Result, SnowstormError};
