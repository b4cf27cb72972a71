//! # Cadence Core
//!
//! Configuration and the shared error type used by every Cadence crate
//! and by the `cadence` binary.

pub mod config;
pub mod error;

pub use config::CadenceConfig;
pub use error::{CadenceError, Result};
