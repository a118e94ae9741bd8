//! flarepipe common library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared plumbing for the flarepipe workspace members:
//!
//! - **Logging**: `tracing` subscriber setup (console, rotating file, JSON)
//! - **Environment**: typed environment variable lookups with defaults
//! - **Errors**: the error type those lookups report
//!
//! # Example
//!
//! ```no_run
//! use flarepipe_common::env;
//! use std::time::Duration;
//!
//! fn request_timeout() -> flarepipe_common::Result<Duration> {
//!     Ok(Duration::from_secs(env::parse_or("REQUEST_TIMEOUT", 10)?))
//! }
//! ```

pub mod env;
pub mod error;
pub mod logging;

pub use error::{CommonError, Result};
