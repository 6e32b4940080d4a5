//! Standard host imports for mapping guests.
//!
//! This crate provides the host side of the imports every AssemblyScript
//! guest of the runtime expects:
//!
//! - [`abort`]: `env.abort`, the guest runtime's fault report
//! - [`logging`]: `log.log`, structured logging from guest code
//! - [`linker`]: registration of the whole set on an
//!   [`Instance`](mapping_runtime_core::Instance)

pub mod abort;
pub mod linker;
pub mod logging;

pub use abort::abort_function;
pub use linker::{register_abort, register_all, register_logging};
pub use logging::{DEFAULT_LOG_CAPACITY, LogEntry, LogLevel, LoggingHost};
