//! # CardCache Common
//!
//! Logging configuration shared by the CardCache crates.

pub mod logging;

pub use logging::{init_logging, LogConfig, LogFormat};
