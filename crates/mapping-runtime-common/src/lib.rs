//! Common types, errors, and configuration for mapping-runtime.
//!
//! This crate provides shared functionality used across the workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for engine and instance settings
//! - TOML configuration file loading

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{DebugLevel, EngineConfig, InstanceConfig, OptLevel, RuntimeConfig};
pub use config_file::{ConfigFile, ConfigFileError, ModuleEntry};
pub use error::{GuestAbort, ImportFunctionError, RuntimeError};
