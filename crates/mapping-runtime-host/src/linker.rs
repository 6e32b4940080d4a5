//! Registration of the standard host imports on an instance.
//!
//! Imports a guest does not declare are ignored at init, so registering the
//! full set is always safe.

use mapping_runtime_common::RuntimeError;
use mapping_runtime_core::Instance;

use crate::abort::{ABORT_NAME, ABORT_NAMESPACE, abort_function};
use crate::logging::LoggingHost;

/// Namespace of the guest logging import.
pub const LOG_NAMESPACE: &str = "log";
/// Name of the guest logging import.
pub const LOG_NAME: &str = "log";

/// Register all standard host functions on `instance`:
/// - `env.abort` - guest runtime faults
/// - `log.log` - guest logging into `logging`
///
/// # Errors
///
/// Returns an error if the instance is already initialized or one of the
/// imports was registered before.
pub fn register_all(instance: &Instance, logging: &LoggingHost) -> Result<(), RuntimeError> {
    register_abort(instance)?;
    register_logging(instance, logging)?;
    Ok(())
}

/// Register `env.abort(message, file, line, column)`.
pub fn register_abort(instance: &Instance) -> Result<(), RuntimeError> {
    instance.register_import(ABORT_NAMESPACE, ABORT_NAME, abort_function())
}

/// Register `log.log(level, message)`, collecting into `logging`.
pub fn register_logging(instance: &Instance, logging: &LoggingHost) -> Result<(), RuntimeError> {
    instance.register_import(LOG_NAMESPACE, LOG_NAME, logging.host_function())
}

#[cfg(test)]
mod tests {
    use mapping_runtime_common::{EngineConfig, InstanceConfig};
    use mapping_runtime_core::{CompiledModule, WasmEngine};

    use super::*;

    const GUEST_WAT: &str = r#"
        (module
            (import "env" "abort" (func (param i32 i32 i32 i32)))
            (memory (export "memory") 1)
            (func (export "allocate") (param i32) (result i32) (i32.const 1024))
        )
    "#;

    fn instance() -> Instance {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let module = CompiledModule::from_wat(engine.inner(), GUEST_WAT).unwrap();
        Instance::from_module("guest", &engine, module, InstanceConfig::default())
    }

    #[test]
    fn test_register_all() {
        let instance = instance();
        register_all(&instance, &LoggingHost::new()).unwrap();

        // log.log is registered but not imported by the guest.
        instance.init().unwrap();
    }

    #[test]
    fn test_register_twice_is_rejected() {
        let instance = instance();
        register_abort(&instance).unwrap();

        let err = register_abort(&instance).unwrap_err();
        assert!(matches!(err, RuntimeError::Registration { .. }));
    }
}
