//! Marquee Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared plumbing for the Marquee workspace members:
//!
//! - **Error Handling**: [`CommonError`] and the crate [`Result`] alias
//! - **Checksums**: SHA-256 digests and `.sha256` sidecar files used to
//!   decide whether a cached download can be reused
//! - **Logging**: [`logging::LogConfig`] and [`logging::init_logging`]
//!
//! # Example
//!
//! ```no_run
//! use marquee_common::checksum;
//!
//! fn cached(path: &std::path::Path) -> marquee_common::Result<bool> {
//!     checksum::sidecar_matches(path)
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
