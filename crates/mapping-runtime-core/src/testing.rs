//! Shared fixtures for unit tests.

use mapping_runtime_common::{DebugLevel, EngineConfig};
use wasmtime::AsContextMut;

use crate::memory::{MemoryBinding, MemoryManager};
use crate::store::{HostState, create_store};
use crate::{CompiledModule, WasmEngine};

/// A guest with only memory and a bump allocator. `allocate(0)` reports the
/// heap position without advancing it; other sizes return an 8-aligned block
/// with its size stored in the preceding word.
pub(crate) const ALLOCATOR_WAT: &str = r#"
    (module
        (memory (export "memory") 1)
        (global $heap (mut i32) (i32.const 1024))
        (func (export "allocate") (param $size i32) (result i32)
            (local $ptr i32)
            (if (i32.eqz (local.get $size))
                (then (return (global.get $heap))))
            (local.set $ptr
                (i32.and (i32.add (global.get $heap) (i32.const 11)) (i32.const -8)))
            (i32.store (i32.sub (local.get $ptr) (i32.const 4)) (local.get $size))
            (global.set $heap (i32.add (local.get $ptr) (local.get $size)))
            (local.get $ptr))
    )
"#;

/// Run `f` against a memory manager bound to a fresh allocator-only guest.
pub(crate) fn with_memory<R>(f: impl FnOnce(&mut MemoryManager<'_>) -> R) -> R {
    let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
    let module = CompiledModule::from_wat(engine.inner(), ALLOCATOR_WAT).unwrap();
    let mut store = create_store(&engine, HostState::new("test", DebugLevel::Off));

    let instance = wasmtime::Instance::new(&mut store, module.module(), &[]).unwrap();
    let memory = instance.get_memory(&mut store, "memory").unwrap();
    let allocate = instance
        .get_typed_func::<i32, i32>(&mut store, "allocate")
        .unwrap();
    let binding = MemoryBinding::new(memory, allocate);
    store.data_mut().memory = Some(binding.clone());

    let mut mm = MemoryManager::new(binding, store.as_context_mut());
    f(&mut mm)
}
