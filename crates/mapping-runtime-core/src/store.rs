//! Per-instance store state.
//!
//! This module provides:
//! - [`HostState`]: the data every Wasmtime store of an instance carries,
//!   reachable from bound host functions through [`wasmtime::Caller`]
//! - [`create_store`]: store construction for one instantiation

use uuid::Uuid;
use wasmtime::Store;

use crate::WasmEngine;
use crate::context::CallContext;
use crate::memory::MemoryBinding;
use mapping_runtime_common::DebugLevel;

/// State owned by one instantiation of a guest module.
///
/// A fresh `HostState` is created on every init and reset, so nothing here
/// survives a reset.
pub struct HostState {
    /// Identifier of this instantiation; changes on every reset.
    pub instance_id: Uuid,

    /// Name of the owning instance, used in call-stack trails.
    pub instance_name: String,

    /// Verbosity of per-call tracing.
    pub debug_level: DebugLevel,

    /// Call context of the export call currently running on this store.
    pub(crate) context: Option<CallContext>,

    /// Guest memory and allocator, bound once instantiation succeeds.
    pub(crate) memory: Option<MemoryBinding>,
}

impl HostState {
    /// Create state for a new instantiation.
    pub fn new(instance_name: impl Into<String>, debug_level: DebugLevel) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            instance_name: instance_name.into(),
            debug_level,
            context: None,
            memory: None,
        }
    }

    /// The active call context, if an export call is running.
    pub fn context(&self) -> Option<&CallContext> {
        self.context.as_ref()
    }

    /// Returns `true` once guest memory has been bound.
    pub fn is_bound(&self) -> bool {
        self.memory.is_some()
    }
}

impl std::fmt::Debug for HostState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostState")
            .field("instance_id", &self.instance_id)
            .field("instance_name", &self.instance_name)
            .field("debug_level", &self.debug_level)
            .field("active", &self.context.is_some())
            .field("bound", &self.memory.is_some())
            .finish()
    }
}

/// Create a new Wasmtime store holding `state`.
pub fn create_store(engine: &WasmEngine, state: HostState) -> Store<HostState> {
    Store::new(engine.inner(), state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapping_runtime_common::EngineConfig;

    #[test]
    fn test_host_state_creation() {
        let state = HostState::new("erc20", DebugLevel::Calls);

        assert_eq!(state.instance_name, "erc20");
        assert_eq!(state.debug_level, DebugLevel::Calls);
        assert!(state.context().is_none());
        assert!(!state.is_bound());
    }

    #[test]
    fn test_instance_ids_are_unique() {
        let a = HostState::new("a", DebugLevel::Off);
        let b = HostState::new("a", DebugLevel::Off);
        assert_ne!(a.instance_id, b.instance_id);
    }

    #[test]
    fn test_store_creation() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let store = create_store(&engine, HostState::new("test", DebugLevel::Off));

        assert_eq!(store.data().instance_name, "test");
        assert!(format!("{:?}", store.data()).contains("HostState"));
    }
}
