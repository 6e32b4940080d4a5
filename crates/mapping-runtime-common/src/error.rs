//! Error types for the mapping runtime.
//!
//! This module defines the error taxonomy using `thiserror`:
//! - [`RuntimeError`]: Top-level errors for registration, preparation,
//!   execution and lifecycle
//! - [`ImportFunctionError`]: A failure inside a bound host function, with the
//!   call-stack trail at the point of failure
//! - [`GuestAbort`]: A fault raised by the guest runtime through its abort import

use std::io;

use thiserror::Error;

/// Top-level runtime errors.
///
/// The variants fall into the categories below. Only the execution
/// categories can leave the guest in a modified state.
///
/// | Category            | Variants                                                          |
/// |---------------------|-------------------------------------------------------------------|
/// | Registration        | [`Registration`](Self::Registration)                              |
/// | Prepare             | [`ExportNotFound`](Self::ExportNotFound), [`ArgumentMismatch`](Self::ArgumentMismatch), [`ForeignContext`](Self::ForeignContext), [`Cancelled`](Self::Cancelled) |
/// | Import failure      | [`ImportFailure`](Self::ImportFailure)                            |
/// | Guest trap          | [`GuestTrap`](Self::GuestTrap)                                    |
/// | Protocol violation  | [`ProtocolViolation`](Self::ProtocolViolation)                    |
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// A function was registered with an invalid shape or at the wrong time.
    #[error("Registration failed: {reason}")]
    Registration {
        /// Description of the registration failure.
        reason: String,
    },

    /// The requested export was never registered.
    #[error("Export function does not exist: {name}")]
    ExportNotFound {
        /// Name of the export.
        name: String,
    },

    /// An argument did not match the registered export signature.
    #[error("Argument mismatch for '{export}' at position {position}: expected {expected}, got {actual}")]
    ArgumentMismatch {
        /// Name of the export being called.
        export: String,
        /// Zero-based argument position.
        position: usize,
        /// Expected value kind.
        expected: String,
        /// Supplied value kind.
        actual: String,
    },

    /// The instance is running under a different call context.
    #[error("Instance '{instance}' is active under a different call context")]
    ForeignContext {
        /// Name of the busy instance.
        instance: String,
    },

    /// The ambient context was cancelled or its deadline passed.
    #[error("Call context cancelled")]
    Cancelled,

    /// A bound host function failed.
    #[error(transparent)]
    ImportFailure(#[from] ImportFunctionError),

    /// The guest faulted with no host-side cause.
    #[error("Wasm trap: {message}")]
    GuestTrap {
        /// Trap or guest diagnostic text.
        message: String,
    },

    /// The embedding broke the guest ABI contract.
    #[error("Protocol violation: {reason}")]
    ProtocolViolation {
        /// Description of the violation.
        reason: String,
    },

    /// WebAssembly compilation failed.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// The module could not be instantiated or bound.
    #[error("Instantiation failed: {reason}")]
    Instantiation {
        /// Description of the instantiation failure.
        reason: String,
    },

    /// The instance has not been initialized, or was closed.
    #[error("Instance '{instance}' is not initialized")]
    NotInitialized {
        /// Name of the instance.
        instance: String,
    },

    /// A lifecycle operation was attempted while a call is in flight.
    #[error("Instance '{instance}' is busy")]
    Busy {
        /// Name of the instance.
        instance: String,
    },

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// A failure inside a bound host (import) function.
///
/// Carries the original cause and a snapshot of the call-stack trail, which
/// always ends with the fully-qualified name of the failing import.
#[derive(Error, Debug)]
#[error("Import function '{import}' failed: {cause} (stack: {})", .stack.join(" -> "))]
pub struct ImportFunctionError {
    /// Fully-qualified `namespace/name` of the import.
    pub import: String,

    /// Rendered call-stack entries, outermost first.
    pub stack: Vec<String>,

    /// The host-side cause.
    #[source]
    pub cause: anyhow::Error,
}

/// A fault the guest reports through its runtime abort import.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} in {file}({line}:{column})")]
pub struct GuestAbort {
    /// Guest diagnostic.
    pub message: String,
    /// Source file reported by the guest.
    pub file: String,
    /// Source line.
    pub line: u32,
    /// Source column.
    pub column: u32,
}

impl RuntimeError {
    /// Create a new `Registration` error.
    pub fn registration(reason: impl Into<String>) -> Self {
        Self::Registration {
            reason: reason.into(),
        }
    }

    /// Create a new `ExportNotFound` error.
    pub fn export_not_found(name: impl Into<String>) -> Self {
        Self::ExportNotFound { name: name.into() }
    }

    /// Create a new `GuestTrap` error.
    pub fn guest_trap(message: impl Into<String>) -> Self {
        Self::GuestTrap {
            message: message.into(),
        }
    }

    /// Create a new `ProtocolViolation` error.
    pub fn protocol_violation(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            reason: reason.into(),
        }
    }

    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `Instantiation` error.
    pub fn instantiation(reason: impl Into<String>) -> Self {
        Self::Instantiation {
            reason: reason.into(),
        }
    }

    /// Create a new `NotInitialized` error.
    pub fn not_initialized(instance: impl Into<String>) -> Self {
        Self::NotInitialized {
            instance: instance.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error was raised before any guest code ran.
    pub fn is_prepare_error(&self) -> bool {
        matches!(
            self,
            Self::ExportNotFound { .. }
                | Self::ArgumentMismatch { .. }
                | Self::ForeignContext { .. }
                | Self::Cancelled
        )
    }

    /// Returns `true` if this error is a guest-originated trap.
    pub fn is_guest_trap(&self) -> bool {
        matches!(self, Self::GuestTrap { .. })
    }

    /// Returns `true` if this error came from a bound host function.
    pub fn is_import_failure(&self) -> bool {
        matches!(self, Self::ImportFailure(_))
    }

    /// Returns `true` if this error is an embedding bug rather than a
    /// runtime condition.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::ProtocolViolation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RuntimeError::export_not_found("handleTransfer");
        assert_eq!(err.to_string(), "Export function does not exist: handleTransfer");

        let err = RuntimeError::registration("register before init");
        assert_eq!(err.to_string(), "Registration failed: register before init");
    }

    #[test]
    fn test_import_failure_display_ends_with_trail() {
        let err = ImportFunctionError {
            import: "store/get".into(),
            stack: vec!["mapping::handleBlock".into(), "store/get".into()],
            cause: anyhow::anyhow!("entity missing"),
        };

        let text = err.to_string();
        assert!(text.contains("entity missing"));
        assert!(text.ends_with("(stack: mapping::handleBlock -> store/get)"));
    }

    #[test]
    fn test_error_from_import_failure() {
        let err: RuntimeError = ImportFunctionError {
            import: "env/x".into(),
            stack: vec!["env/x".into()],
            cause: anyhow::anyhow!("boom"),
        }
        .into();

        assert!(err.is_import_failure());
        assert!(!err.is_guest_trap());
    }

    #[test]
    fn test_guest_abort_display() {
        let abort = GuestAbort {
            message: "Index out of range".into(),
            file: "~lib/array.ts".into(),
            line: 114,
            column: 42,
        };
        assert_eq!(abort.to_string(), "Index out of range in ~lib/array.ts(114:42)");
    }

    #[test]
    fn test_classification() {
        assert!(RuntimeError::Cancelled.is_prepare_error());
        assert!(RuntimeError::export_not_found("x").is_prepare_error());
        assert!(RuntimeError::guest_trap("unreachable").is_guest_trap());
        assert!(RuntimeError::protocol_violation("allocate failed").is_protocol_violation());
        assert!(!RuntimeError::guest_trap("x").is_prepare_error());
    }
}
