//! kvmd-cloud Core Library
//!
//! Shared functionality for the kvmd-cloud agent:
//! - Configuration file loading and layering
//! - Common error types
//! - Tracing subscriber setup

pub mod config;
pub mod error;
pub mod tracing_init;

pub use config::AgentConfig;
pub use error::{Error, Result};
