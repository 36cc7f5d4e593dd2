//! Toolgate common library
//!
//! This crate contains shared code used across Toolgate components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::ToolgateConfig;
pub use error::{Result, ToolgateError};
pub use metrics::{MetricsRegistry, METRICS};
