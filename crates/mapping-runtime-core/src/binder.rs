//! Import and export binding.
//!
//! Shapes are declared once, at registration, as ordered lists of
//! [`ValueKind`]s. At call time a small closed set of routines converts
//! between [`Value`]s and wasm values through the memory manager:
//! - [`HostFunction`]: a host-implemented import and its signature
//! - [`ExportSignature`]: the declared shape of a guest export
//! - the import wrapper, the single place where host failures and panics
//!   become [`ImportFunctionError`]s

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use mapping_runtime_common::{DebugLevel, ImportFunctionError, RuntimeError};
use thiserror::Error;
use tracing::{debug, trace, warn};
use wasmtime::{AsContextMut, Caller, FuncType, Linker, Val};

use crate::context::CallContext;
use crate::memory::{MemoryManager, protocol_violation};
use crate::store::HostState;
use crate::value::{Pointer, Value, ValueKind, WasmType, WasmValue};

/// Most results a bound function may return: the engine's multi-value limit
/// for a function type.
pub const MAX_RESULTS: usize = 1000;

type HostBody = dyn Fn(&CallContext, Vec<Value>) -> anyhow::Result<Vec<Value>> + Send + Sync;

/// A host function bound as a guest import.
///
/// The body always receives the active [`CallContext`] first, followed by
/// the lifted arguments. Objects arrive fully loaded and nil objects arrive
/// as their nil value.
#[derive(Clone)]
pub struct HostFunction {
    params: Vec<ValueKind>,
    results: Vec<ValueKind>,
    body: Arc<HostBody>,
}

impl HostFunction {
    /// Bind a body with an explicit signature.
    ///
    /// # Errors
    ///
    /// Fails if more than [`MAX_RESULTS`] results are declared.
    pub fn new<F>(
        params: Vec<ValueKind>,
        results: Vec<ValueKind>,
        body: F,
    ) -> Result<Self, RuntimeError>
    where
        F: Fn(&CallContext, Vec<Value>) -> anyhow::Result<Vec<Value>> + Send + Sync + 'static,
    {
        if results.len() > MAX_RESULTS {
            return Err(RuntimeError::registration(format!(
                "host function declares {} results, at most {MAX_RESULTS} supported",
                results.len()
            )));
        }
        Ok(Self::from_parts(params, results, body))
    }

    fn from_parts<F>(params: Vec<ValueKind>, results: Vec<ValueKind>, body: F) -> Self
    where
        F: Fn(&CallContext, Vec<Value>) -> anyhow::Result<Vec<Value>> + Send + Sync + 'static,
    {
        Self {
            params,
            results,
            body: Arc::new(body),
        }
    }

    pub fn params(&self) -> &[ValueKind] {
        &self.params
    }

    pub fn results(&self) -> &[ValueKind] {
        &self.results
    }

    /// Returns `true` if the guest's declared import type has this shape.
    pub fn matches(&self, ty: &FuncType) -> bool {
        kinds_match(ty.params(), &self.params) && kinds_match(ty.results(), &self.results)
    }
}

macro_rules! impl_wrap {
    ($(#[$doc:meta])* $name:ident $(, $arg:ident)*) => {
        $(#[$doc])*
        #[allow(non_snake_case)]
        pub fn $name<$($arg,)* R, F>(body: F) -> Self
        where
            $($arg: WasmValue,)*
            R: HostReturn,
            F: Fn(&CallContext $(, $arg)*) -> anyhow::Result<R> + Send + Sync + 'static,
        {
            let params = vec![$($arg::kind()),*];
            Self::from_parts(params, R::kinds(), move |ctx, args| {
                #[allow(unused_mut, unused_variables)]
                let mut args = args.into_iter();
                $(
                    let $arg = args
                        .next()
                        .and_then($arg::from_value)
                        .ok_or_else(|| anyhow!("argument does not match {}", $arg::kind()))?;
                )*
                body(ctx $(, $arg)*).map(HostReturn::into_values)
            })
        }
    };
}

impl HostFunction {
    impl_wrap!(
        /// Bind a typed body with no arguments.
        wrap0
    );
    impl_wrap!(
        /// Bind a typed body with one argument.
        wrap1, A1
    );
    impl_wrap!(
        /// Bind a typed body with two arguments.
        wrap2, A1, A2
    );
    impl_wrap!(
        /// Bind a typed body with three arguments.
        wrap3, A1, A2, A3
    );
    impl_wrap!(
        /// Bind a typed body with four arguments.
        wrap4, A1, A2, A3, A4
    );
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunction")
            .field("params", &self.params)
            .field("results", &self.results)
            .finish_non_exhaustive()
    }
}

/// Return types of typed host bodies: `()` or any single [`WasmValue`].
pub trait HostReturn {
    fn kinds() -> Vec<ValueKind>;

    fn into_values(self) -> Vec<Value>;
}

impl HostReturn for () {
    fn kinds() -> Vec<ValueKind> {
        Vec::new()
    }

    fn into_values(self) -> Vec<Value> {
        Vec::new()
    }
}

impl<T: WasmValue> HostReturn for T {
    fn kinds() -> Vec<ValueKind> {
        vec![T::kind()]
    }

    fn into_values(self) -> Vec<Value> {
        vec![self.into_value()]
    }
}

/// Declared shape of a guest export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportSignature {
    params: Vec<ValueKind>,
    result: Option<ValueKind>,
}

impl ExportSignature {
    pub fn new(params: Vec<ValueKind>, result: Option<ValueKind>) -> Self {
        Self { params, result }
    }

    pub fn params(&self) -> &[ValueKind] {
        &self.params
    }

    pub fn result(&self) -> Option<ValueKind> {
        self.result
    }

    /// Returns `true` if the guest's function type has this shape.
    pub fn matches(&self, ty: &FuncType) -> bool {
        kinds_match(ty.params(), &self.params)
            && kinds_match(ty.results(), self.result.as_slice())
    }

    /// Check supplied arguments against the declared parameters.
    pub(crate) fn check_args(&self, export: &str, args: &[Value]) -> Result<(), RuntimeError> {
        if args.len() != self.params.len() {
            return Err(RuntimeError::ArgumentMismatch {
                export: export.to_string(),
                position: args.len().min(self.params.len()),
                expected: format!("{} arguments", self.params.len()),
                actual: format!("{} arguments", args.len()),
            });
        }
        for (position, (arg, kind)) in args.iter().zip(&self.params).enumerate() {
            if !arg.matches(*kind) {
                return Err(RuntimeError::ArgumentMismatch {
                    export: export.to_string(),
                    position,
                    expected: kind.to_string(),
                    actual: arg.kind_name(),
                });
            }
        }
        Ok(())
    }
}

fn kinds_match(types: impl ExactSizeIterator<Item = wasmtime::ValType>, kinds: &[ValueKind]) -> bool {
    types.len() == kinds.len()
        && types
            .zip(kinds)
            .all(|(ty, kind)| WasmType::from_val_type(&ty) == Some(kind.wasm_type()))
}

/// Convert a host value into the wasm value passed to the guest, dumping
/// objects into guest memory.
pub(crate) fn lower(mm: &mut MemoryManager<'_>, value: &Value) -> Result<Val, RuntimeError> {
    match value {
        Value::Object(object) => {
            let ptr = mm.dump_object(object.as_ref())?;
            #[allow(clippy::cast_possible_wrap)]
            let raw = ptr.offset() as i32;
            Ok(Val::I32(raw))
        }
        scalar => scalar
            .scalar_to_val()
            .ok_or_else(|| protocol_violation("scalar value has no wasm representation")),
    }
}

/// Convert a wasm value produced by the guest into a host value of `kind`,
/// loading objects from guest memory.
pub(crate) fn lift(
    mm: &mut MemoryManager<'_>,
    kind: ValueKind,
    val: &Val,
) -> Result<Value, RuntimeError> {
    match kind {
        ValueKind::Object(object_kind) => {
            let raw = val.i32().ok_or_else(|| {
                protocol_violation(format!("expected an i32 pointer for {kind}"))
            })?;
            #[allow(clippy::cast_sign_loss)]
            let ptr = Pointer::new(raw as u32);
            let mut object = object_kind.instantiate();
            mm.load_into(ptr, object.as_mut())?;
            Ok(Value::Object(object))
        }
        _ => Value::scalar_from_val(kind, val).ok_or_else(|| {
            protocol_violation(format!("wasm value {val:?} does not encode {kind}"))
        }),
    }
}

/// Marker returned to the engine when an import fails. The real failure is
/// recorded on the call frame.
#[derive(Debug, Error)]
#[error("import function '{0}' aborted")]
pub(crate) struct ImportAborted(String);

/// Define `module/name` in `linker` as a call into `function`.
pub(crate) fn define_import(
    linker: &mut Linker<HostState>,
    module: &str,
    name: &str,
    ty: FuncType,
    function: HostFunction,
) -> Result<(), RuntimeError> {
    let import = format!("{module}/{name}");
    linker
        .func_new(module, name, ty, move |mut caller, params, results| {
            call_import(&mut caller, &import, &function, params, results)
        })
        .map(|_| ())
        .map_err(|e| RuntimeError::instantiation(format!("failed to bind {module}/{name}: {e}")))
}

fn call_import(
    caller: &mut Caller<'_, HostState>,
    import: &str,
    function: &HostFunction,
    params: &[Val],
    results: &mut [Val],
) -> anyhow::Result<()> {
    let Some(ctx) = caller.data().context.clone() else {
        return Err(protocol_violation(format!(
            "import '{import}' called while no call context is active"
        ))
        .into());
    };
    let traced = caller.data().debug_level >= DebugLevel::Imports;

    ctx.enter_import(import);
    if traced {
        trace!(import, stack = %ctx.render(), "Import call started");
    }

    let start = Instant::now();
    let outcome = run_import(caller, &ctx, function, params, results);
    let elapsed = start.elapsed();

    match outcome {
        Ok(()) => {
            ctx.leave_import(elapsed);
            if traced {
                debug!(import, elapsed_us = elapsed.as_micros(), "Import call finished");
            }
            Ok(())
        }
        Err(cause) => {
            let failure = ImportFunctionError {
                import: import.to_string(),
                stack: ctx.trail(),
                cause,
            };
            warn!(error = %failure, "Import function failed");
            ctx.set_abort(failure);
            ctx.leave_import(elapsed);
            Err(ImportAborted(import.to_string()).into())
        }
    }
}

fn run_import(
    caller: &mut Caller<'_, HostState>,
    ctx: &CallContext,
    function: &HostFunction,
    params: &[Val],
    results: &mut [Val],
) -> anyhow::Result<()> {
    let args = {
        let mut mm = MemoryManager::from_store(caller.as_context_mut())?;
        params
            .iter()
            .zip(&function.params)
            .map(|(val, kind)| lift(&mut mm, *kind, val))
            .collect::<Result<Vec<_>, _>>()?
    };

    // The park guard lives inside the unwind boundary, so a panicking body
    // unparks the caller while unwinding.
    let returned = panic::catch_unwind(AssertUnwindSafe(|| {
        let _parked = ctx.park(&mut *caller);
        (function.body)(ctx, args)
    }))
    .map_err(|payload| anyhow!("host function panicked: {}", panic_message(&*payload)))??;

    if returned.len() != function.results.len() {
        return Err(anyhow!(
            "host function returned {} values, declared {}",
            returned.len(),
            function.results.len()
        ));
    }
    if let Some((value, kind)) = returned
        .iter()
        .zip(&function.results)
        .find(|(value, kind)| !value.matches(**kind))
    {
        return Err(anyhow!(
            "host function returned {}, declared {kind}",
            value.kind_name()
        ));
    }

    let mut mm = MemoryManager::from_store(caller.as_context_mut())?;
    for (slot, value) in results.iter_mut().zip(&returned) {
        *slot = lower(&mut mm, value)?;
    }
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::with_memory;
    use crate::types::{AscArray, AscString};

    #[test]
    fn test_multiple_results_accepted() {
        let f = HostFunction::new(
            vec![ValueKind::I32],
            vec![ValueKind::I32, ValueKind::I64],
            |_, _| Ok(vec![Value::I32(1), Value::I64(2)]),
        )
        .unwrap();
        let ty = FuncType::new(
            &wasmtime::Engine::default(),
            [wasmtime::ValType::I32],
            [wasmtime::ValType::I32, wasmtime::ValType::I64],
        );
        assert!(f.matches(&ty));
    }

    #[test]
    fn test_too_many_results_rejected() {
        let err = HostFunction::new(
            vec![],
            vec![ValueKind::I32; MAX_RESULTS + 1],
            |_, _| Ok(vec![]),
        )
        .unwrap_err();
        assert!(matches!(err, RuntimeError::Registration { .. }));
        assert!(err.to_string().contains("at most 1000"));
    }

    #[test]
    fn test_wrap_derives_signature() {
        let f = HostFunction::wrap2(|_, a: i32, b: AscString| Ok(a + i32::try_from(b.as_str().len())?));
        assert_eq!(f.params(), &[ValueKind::I32, ValueKind::object::<AscString>()]);
        assert_eq!(f.results(), &[ValueKind::I32]);

        let unit = HostFunction::wrap1(|_, _: u64| Ok(()));
        assert!(unit.results().is_empty());

        let ty = FuncType::new(
            &wasmtime::Engine::default(),
            [wasmtime::ValType::I32, wasmtime::ValType::I32],
            [wasmtime::ValType::I32],
        );
        assert!(f.matches(&ty));
        assert!(!unit.matches(&ty));
    }

    #[test]
    fn test_wrapped_body_converts_values() {
        let f = HostFunction::wrap2(|_, a: i32, b: AscString| Ok(AscString::new(format!("{a}{b}"))));
        let ctx = CallContext::new();
        let out = (f.body)(&ctx, vec![Value::I32(4), Value::object(AscString::from("x"))]).unwrap();
        assert_eq!(out[0].as_object::<AscString>().unwrap().as_str(), "4x");

        let err = (f.body)(&ctx, vec![Value::I64(4), Value::object(AscString::nil())]).unwrap_err();
        assert!(err.to_string().contains("i32"));
    }

    #[test]
    fn test_export_signature_checks_args() {
        let sig = ExportSignature::new(vec![ValueKind::I32, ValueKind::object::<AscString>()], None);
        assert!(sig.check_args("f", &[Value::I32(1), Value::object(AscString::nil())]).is_ok());

        let err = sig.check_args("f", &[Value::I32(1), Value::I32(2)]).unwrap_err();
        assert!(matches!(err, RuntimeError::ArgumentMismatch { position: 1, .. }));
        assert!(err.is_prepare_error());

        let err = sig.check_args("f", &[Value::I32(1)]).unwrap_err();
        assert!(matches!(err, RuntimeError::ArgumentMismatch { .. }));
    }

    #[test]
    fn test_lower_and_lift() {
        with_memory(|mm| {
            let val = lower(mm, &Value::U16(65535)).unwrap();
            assert_eq!(val.i32(), Some(65535));
            assert!(matches!(lift(mm, ValueKind::U16, &val).unwrap(), Value::U16(65535)));

            let array = AscArray::new(vec![1_i64, -1]);
            let val = lower(mm, &Value::object(array.clone())).unwrap();
            let lifted = lift(mm, ValueKind::object::<AscArray<i64>>(), &val).unwrap();
            assert_eq!(lifted.as_object::<AscArray<i64>>(), Some(&array));

            let nil = lift(mm, ValueKind::object::<AscString>(), &Val::I32(0)).unwrap();
            assert!(nil.as_object::<AscString>().unwrap().is_nil());

            assert!(lift(mm, ValueKind::I64, &Val::I32(1)).unwrap_err().is_protocol_violation());
        });
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");
        let payload: Box<dyn Any + Send> = Box::new(3_u8);
        assert_eq!(panic_message(&*payload), "non-string panic payload");
    }
}
