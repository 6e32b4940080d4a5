//! Core Wasmtime host runtime for mapping guests.
//!
//! This crate runs WebAssembly modules produced by the AssemblyScript
//! compiler and marshals values across their linear memory:
//! - [`WasmEngine`]: configured Wasmtime engine, shared by all instances
//! - [`CompiledModule`]: compiled guest module wrapper
//! - [`Instance`]: lifecycle, import/export registration, export calls
//! - [`CallContext`]: per-logical-call stack, spanning re-entrant calls
//! - [`MemoryManager`]: allocation and object (de)serialization in guest memory
//! - [`types`]: strings, byte arrays and arrays in the guest layout
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     WasmEngine                          │
//! │  (Shared across all instances, thread-safe)             │
//! │  - Optional pooling allocator                           │
//! │  - Compilation settings                                 │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                      Instance                           │
//! │  - Registered imports (HostFunction) and exports        │
//! │  - Store<HostState> + live instantiation                │
//! │  - Memory hard limit, auto-reset                        │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                    CallContext                          │
//! │  (One per logical call, may cross instances)            │
//! │  - CallFrame per export, folded into its parent on pop  │
//! │  - Cancellation and deadline                            │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod binder;
pub mod context;
pub mod engine;
pub mod instance;
pub mod memory;
pub mod module;
pub mod object;
pub mod store;
pub mod types;
pub mod value;

#[cfg(test)]
mod testing;

pub use binder::{ExportSignature, HostFunction, HostReturn};
pub use context::{CallContext, CallFrame, CallStack, UserData};
pub use engine::WasmEngine;
pub use instance::{
    CallError, CallParams, CallStats, ExportCall, Instance, InstanceState, WILDCARD_NAMESPACE,
};
pub use memory::{MemoryBinding, MemoryManager, OBJECT_HEADER_SIZE};
pub use module::CompiledModule;
pub use object::{AscField, AscObject, ObjectReader, ObjectWriter, RuntimeTypeId};
pub use store::HostState;
pub use types::{AscArray, AscObjectArray, AscString, ByteArray, HexError};
pub use value::{ObjectKind, Pointer, Scalar, Value, ValueKind, WasmType, WasmValue};

pub use mapping_runtime_common::RuntimeError;
