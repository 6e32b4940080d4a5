//! Configuration structures for the mapping runtime.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings (pooling, optimization)
//! - [`InstanceConfig`]: Per-instance settings (memory hard limit, guest ABI names)

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
///
/// This structure contains all configuration options for the runtime.
/// It can be loaded from files (TOML, JSON).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-instance configuration.
    #[serde(default)]
    pub instance: InstanceConfig,
}

/// Wasmtime engine configuration.
///
/// These settings affect the global Wasmtime engine behavior shared by every
/// instance compiled against it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable pooling allocator for instance creation.
    ///
    /// Instances in this runtime are long-lived and reset rarely, so the
    /// on-demand allocator is the default.
    #[serde(default = "defaults::pooling_allocator")]
    pub pooling_allocator: bool,

    /// Maximum concurrent instances in the pool.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::max_instances")]
    pub max_instances: u32,

    /// Memory per instance slot in megabytes.
    ///
    /// Only effective when `pooling_allocator` is enabled.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Cranelift optimization level.
    #[serde(default)]
    pub opt_level: OptLevel,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: defaults::pooling_allocator(),
            max_instances: defaults::max_instances(),
            instance_memory_mb: defaults::instance_memory_mb(),
            opt_level: OptLevel::default(),
        }
    }
}

/// Cranelift optimization level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptLevel {
    /// No optimizations.
    None,
    /// Optimize for speed.
    #[default]
    Speed,
    /// Optimize for speed and size.
    SpeedAndSize,
}

/// Per-instance configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InstanceConfig {
    /// Guest heap usage in bytes above which the instance is reset before
    /// the next top-level export call.
    #[serde(default = "defaults::memory_hard_limit_bytes")]
    pub memory_hard_limit_bytes: u64,

    /// Verbosity of per-call tracing.
    #[serde(default)]
    pub debug_level: DebugLevel,

    /// Name of the guest start routine invoked during init.
    #[serde(default = "defaults::start_function")]
    pub start_function: String,

    /// Name of the guest allocator export.
    #[serde(default = "defaults::allocate_function")]
    pub allocate_function: String,

    /// Name of the guest linear memory export.
    #[serde(default = "defaults::memory_export")]
    pub memory_export: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            memory_hard_limit_bytes: defaults::memory_hard_limit_bytes(),
            debug_level: DebugLevel::default(),
            start_function: defaults::start_function(),
            allocate_function: defaults::allocate_function(),
            memory_export: defaults::memory_export(),
        }
    }
}

impl InstanceConfig {
    /// Create a config with the given hard memory limit and defaults otherwise.
    pub fn with_memory_hard_limit(memory_hard_limit_bytes: u64) -> Self {
        Self {
            memory_hard_limit_bytes,
            ..Default::default()
        }
    }
}

/// Verbosity of per-call tracing emitted by an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DebugLevel {
    /// No per-call tracing.
    #[default]
    Off,
    /// Trace every export call.
    Calls,
    /// Trace export and import calls.
    Imports,
}

/// Default value functions for serde.
mod defaults {
    pub const fn pooling_allocator() -> bool {
        false
    }

    pub const fn max_instances() -> u32 {
        100
    }

    pub const fn instance_memory_mb() -> u32 {
        256
    }

    pub const fn memory_hard_limit_bytes() -> u64 {
        64 * 1024 * 1024
    }

    pub fn start_function() -> String {
        "_start".to_string()
    }

    pub fn allocate_function() -> String {
        "allocate".to_string()
    }

    pub fn memory_export() -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();

        assert!(!config.engine.pooling_allocator);
        assert_eq!(config.engine.max_instances, 100);
        assert_eq!(config.engine.opt_level, OptLevel::Speed);

        assert_eq!(config.instance.memory_hard_limit_bytes, 64 * 1024 * 1024);
        assert_eq!(config.instance.debug_level, DebugLevel::Off);
        assert_eq!(config.instance.start_function, "_start");
        assert_eq!(config.instance.allocate_function, "allocate");
        assert_eq!(config.instance.memory_export, "memory");
    }

    #[test]
    fn test_config_serialization() {
        let config = RuntimeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: RuntimeConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(
            config.engine.max_instances,
            deserialized.engine.max_instances
        );
        assert_eq!(
            config.instance.memory_hard_limit_bytes,
            deserialized.instance.memory_hard_limit_bytes
        );
    }

    #[test]
    fn test_partial_deserialization() {
        let json = r#"{"instance": {"memory_hard_limit_bytes": 4096, "debug_level": "imports"}}"#;
        let config: RuntimeConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.instance.memory_hard_limit_bytes, 4096);
        assert_eq!(config.instance.debug_level, DebugLevel::Imports);
        // Default values for unspecified fields
        assert_eq!(config.instance.start_function, "_start");
        assert!(!config.engine.pooling_allocator);
    }

    #[test]
    fn test_debug_level_ordering() {
        assert!(DebugLevel::Imports > DebugLevel::Calls);
        assert!(DebugLevel::Calls > DebugLevel::Off);
    }

    #[test]
    fn test_with_memory_hard_limit() {
        let config = InstanceConfig::with_memory_hard_limit(1024);
        assert_eq!(config.memory_hard_limit_bytes, 1024);
        assert_eq!(config.allocate_function, "allocate");
    }
}
