//! # vmfleet Common
//!
//! Shared utilities for the vmfleet crates.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use vmfleet_common::{init_logging, LogFormat};
//!
//! init_logging("info", LogFormat::Pretty).unwrap();
//! tracing::info!(endpoint = "local", "Connected");
//! ```

pub mod logging;

pub use logging::{init_logging, LogFormat};
