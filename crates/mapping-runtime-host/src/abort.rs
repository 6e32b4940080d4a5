//! The guest runtime's abort import.
//!
//! The AssemblyScript runtime reports assertion failures, out-of-range
//! accesses and explicit `abort()` calls through
//! `env.abort(message, file, line, column)`. The host never returns to the
//! guest from it: the body fails with a [`GuestAbort`], which the instance
//! reports as a guest trap carrying the guest's own diagnostic.

use mapping_runtime_common::GuestAbort;
use mapping_runtime_core::{AscString, CallContext, HostFunction};

/// Namespace of the abort import.
pub const ABORT_NAMESPACE: &str = "env";
/// Name of the abort import.
pub const ABORT_NAME: &str = "abort";

/// The `env.abort` host function.
pub fn abort_function() -> HostFunction {
    HostFunction::wrap4(
        |_ctx: &CallContext, message: AscString, file: AscString, line: u32, column: u32| {
            Err::<(), _>(
                GuestAbort {
                    message: message.into_string(),
                    file: file.into_string(),
                    line,
                    column,
                }
                .into(),
            )
        },
    )
}
