//! Call context and call stack shared by nested and re-entrant export calls.
//!
//! One [`CallContext`] spans a whole top-level `call_export` invocation tree,
//! across every instance it touches. It carries the ordered [`CallStack`] of
//! [`CallFrame`]s and an ambient cancellation token with an optional deadline.
//! Cloning a context is cheap and yields a handle to the same shared state.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use mapping_runtime_common::{ImportFunctionError, RuntimeError};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wasmtime::{AsContextMut, Caller, StoreContextMut};

use crate::store::HostState;

/// Opaque caller-supplied data attached to a frame.
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Shared state of one export-call tree.
#[derive(Clone)]
pub struct CallContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    stack: Mutex<CallStack>,
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// A context that is never cancelled unless [`cancel`](Self::cancel) is called.
    pub fn new() -> Self {
        Self::build(CancellationToken::new(), None)
    }

    /// A context whose calls are rejected once `timeout` has elapsed.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::build(CancellationToken::new(), Instant::now().checked_add(timeout))
    }

    /// A context cancelled together with `token`.
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self::build(token, None)
    }

    fn build(token: CancellationToken, deadline: Option<Instant>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                stack: Mutex::new(CallStack::default()),
                token,
                deadline,
            }),
        }
    }

    /// The ambient cancellation token. Host functions doing blocking work can
    /// select on it or derive child tokens from it.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.inner.token
    }

    /// Cancel the context. Running guest code is not interrupted; new export
    /// calls are rejected.
    pub fn cancel(&self) {
        self.inner.token.cancel();
    }

    /// Returns `true` once cancelled or past the deadline.
    pub fn is_cancelled(&self) -> bool {
        self.inner.token.is_cancelled()
            || self
                .inner
                .deadline
                .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Fail with [`RuntimeError::Cancelled`] if the context is done.
    pub fn check(&self) -> Result<(), RuntimeError> {
        if self.is_cancelled() {
            Err(RuntimeError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Time left before the deadline, if one was set.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Returns `true` if both handles refer to the same context.
    pub fn same(&self, other: &CallContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of frames on the stack.
    pub fn depth(&self) -> usize {
        self.inner.stack.lock().depth()
    }

    /// Rendered stack entries, outermost first.
    pub fn trail(&self) -> Vec<String> {
        self.inner.stack.lock().trail()
    }

    /// The stack rendered as `inst::export -> ns/import -> ...`.
    pub fn render(&self) -> String {
        self.inner.stack.lock().render()
    }

    /// User data of the innermost frame.
    pub fn user_data(&self) -> Option<UserData> {
        self.inner
            .stack
            .lock()
            .top()
            .and_then(|frame| frame.user_data.clone())
    }

    /// Run `f` against the current stack.
    ///
    /// The stack is locked for the duration of `f`; do not call back into the
    /// context from inside it.
    pub fn inspect<R>(&self, f: impl FnOnce(&CallStack) -> R) -> R {
        f(&self.inner.stack.lock())
    }

    pub(crate) fn push(&self, frame: CallFrame) {
        self.inner.stack.lock().push(frame);
    }

    pub(crate) fn pop(&self) -> Option<CallFrame> {
        self.inner.stack.lock().pop()
    }

    /// Record `import` as running on the innermost frame.
    pub(crate) fn enter_import(&self, import: &str) {
        if let Some(frame) = self.inner.stack.lock().top_mut() {
            frame.current_import = Some(import.to_string());
            frame.import_call_count += 1;
        }
    }

    /// Clear the running import on the innermost frame and charge its time.
    pub(crate) fn leave_import(&self, elapsed: Duration) {
        if let Some(frame) = self.inner.stack.lock().top_mut() {
            frame.current_import = None;
            frame.import_call_duration += elapsed;
        }
    }

    /// Store an import failure on the innermost frame.
    pub(crate) fn set_abort(&self, failure: ImportFunctionError) {
        if let Some(frame) = self.inner.stack.lock().top_mut() {
            frame.abort = Some(failure);
        }
    }

    /// Park `caller` on the innermost frame while a host function body runs,
    /// so a re-entrant call into the same instance can reach its store.
    ///
    /// A re-entrant call may arrive through another instance's import
    /// (`A -> B -> A`), whose body only holds `B`'s caller, so `A`'s caller
    /// has to be reachable through the shared context.
    ///
    /// The returned guard keeps `caller` mutably borrowed for as long as the
    /// pointer is parked and clears it on drop, including drops during
    /// unwinding.
    pub(crate) fn park<'c, 'a>(&self, caller: &'c mut Caller<'a, HostState>) -> ParkGuard<'c, 'a> {
        let mut stack = self.inner.stack.lock();
        let index = stack.depth().checked_sub(1);
        if let Some(frame) = index.and_then(|i| stack.frames.get_mut(i)) {
            frame.parked = Some(ParkedCaller {
                caller: NonNull::from(&mut *caller).cast(),
                thread: thread::current().id(),
            });
        }
        ParkGuard {
            context: self.clone(),
            index,
            _caller: PhantomData,
        }
    }

    /// Run `f` on the store of the suspended instance `instance_id`.
    ///
    /// Returns `None` if that instance has no parked caller usable from this
    /// thread.
    ///
    /// # Safety
    ///
    /// Safe to call; soundness rests on these invariants, upheld by the crate:
    ///
    /// - A pointer is parked only by [`park`](Self::park), from a `&mut Caller`
    ///   that the returned [`ParkGuard`] keeps exclusively borrowed. The
    ///   parked caller therefore cannot be used or dropped by anyone else
    ///   until the guard clears the slot.
    /// - The guard clears the slot on drop, normal return and unwinding alike,
    ///   and it is dropped before the host function returns to the engine.
    ///   A parked caller never outlives its frame.
    /// - The pointer is dereferenced only on the thread that parked it, by
    ///   code running inside the parked host function body.
    /// - Only the innermost frame of the instance that has a parked caller is
    ///   consulted, and the nested call that uses it finishes before control
    ///   returns to that body, so at most one `&mut` to the caller is live.
    pub(crate) fn with_parked_store<R>(
        &self,
        instance_id: Uuid,
        f: impl FnOnce(StoreContextMut<'_, HostState>) -> R,
    ) -> Option<R> {
        let parked = self
            .inner
            .stack
            .lock()
            .frames
            .iter()
            .rev()
            .filter(|frame| frame.instance_id == instance_id)
            .find_map(|frame| frame.parked)?;

        if parked.thread != thread::current().id() {
            return None;
        }

        // SAFETY: see the invariants above. The pointer comes from a
        // `&mut Caller` held by a live `ParkGuard` on this thread, and no
        // other reference to it is live while `f` runs.
        #[allow(unsafe_code)]
        let caller = unsafe { &mut *parked.caller.as_ptr() };
        Some(f(caller.as_context_mut()))
    }
}

impl Default for CallContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("stack", &self.render())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A host function's `Caller`, parked while its body runs.
#[derive(Clone, Copy)]
pub(crate) struct ParkedCaller {
    caller: NonNull<Caller<'static, HostState>>,
    thread: ThreadId,
}

// The pointer is only dereferenced on `thread`.
#[allow(unsafe_code)]
unsafe impl Send for ParkedCaller {}

/// Unparks a caller when the host function body returns.
pub(crate) struct ParkGuard<'c, 'a> {
    context: CallContext,
    index: Option<usize>,
    _caller: PhantomData<&'c mut Caller<'a, HostState>>,
}

impl Drop for ParkGuard<'_, '_> {
    fn drop(&mut self) {
        let mut stack = self.context.inner.stack.lock();
        if let Some(frame) = self.index.and_then(|i| stack.frames.get_mut(i)) {
            frame.parked = None;
        }
    }
}

/// Ordered frames of one call tree, outermost first.
#[derive(Debug, Default)]
pub struct CallStack {
    frames: Vec<CallFrame>,
}

impl CallStack {
    /// The innermost frame.
    pub fn top(&self) -> Option<&CallFrame> {
        self.frames.last()
    }

    /// Number of frames.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Returns `true` when no export call is running.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Frames from outermost to innermost.
    pub fn frames(&self) -> impl Iterator<Item = &CallFrame> {
        self.frames.iter()
    }

    /// Each frame's `inst::export`, followed by `ns/import` while one runs.
    pub fn trail(&self) -> Vec<String> {
        let mut trail = Vec::with_capacity(self.frames.len() * 2);
        for frame in &self.frames {
            trail.push(frame.qualified_name());
            if let Some(import) = &frame.current_import {
                trail.push(import.clone());
            }
        }
        trail
    }

    /// The trail joined with `->`.
    pub fn render(&self) -> String {
        self.trail().join(" -> ")
    }

    fn top_mut(&mut self) -> Option<&mut CallFrame> {
        self.frames.last_mut()
    }

    fn push(&mut self, frame: CallFrame) {
        self.frames.push(frame);
    }

    /// Pop the innermost frame, folding its counters into its parent.
    fn pop(&mut self) -> Option<CallFrame> {
        let frame = self.frames.pop()?;
        if let Some(parent) = self.frames.last_mut() {
            // The child's import time already elapsed inside one of the
            // parent's imports, so only the counts fold.
            parent.export_call_count += 1 + frame.export_call_count;
            parent.import_call_count += frame.import_call_count;
        }
        Some(frame)
    }
}

/// Bookkeeping for one running export call.
pub struct CallFrame {
    instance_name: String,
    export_name: String,
    is_outermost: bool,
    current_import: Option<String>,
    export_call_count: u64,
    import_call_count: u64,
    import_call_duration: Duration,
    user_data: Option<UserData>,
    abort: Option<ImportFunctionError>,
    instance_id: Uuid,
    parked: Option<ParkedCaller>,
}

impl CallFrame {
    pub(crate) fn new(
        instance_id: Uuid,
        instance_name: &str,
        export_name: &str,
        is_outermost: bool,
        user_data: Option<UserData>,
    ) -> Self {
        Self {
            instance_name: instance_name.to_string(),
            export_name: export_name.to_string(),
            is_outermost,
            current_import: None,
            export_call_count: 0,
            import_call_count: 0,
            import_call_duration: Duration::ZERO,
            user_data,
            abort: None,
            instance_id,
            parked: None,
        }
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    pub fn export_name(&self) -> &str {
        &self.export_name
    }

    /// `inst::export`
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.instance_name, self.export_name)
    }

    /// Returns `true` if this frame started the instance's active call.
    pub fn is_outermost(&self) -> bool {
        self.is_outermost
    }

    /// Fully-qualified name of the import this frame is waiting on.
    pub fn current_import(&self) -> Option<&str> {
        self.current_import.as_deref()
    }

    /// Export calls nested under this frame, at any depth.
    pub fn export_call_count(&self) -> u64 {
        self.export_call_count
    }

    /// Import calls made by this frame and everything nested under it.
    pub fn import_call_count(&self) -> u64 {
        self.import_call_count
    }

    /// Wall-clock time this frame spent inside imports.
    pub fn import_call_duration(&self) -> Duration {
        self.import_call_duration
    }

    pub fn user_data(&self) -> Option<&UserData> {
        self.user_data.as_ref()
    }

    /// Returns `true` while this frame's instance is suspended inside a host
    /// function with its store reachable for re-entrant calls.
    pub fn is_suspended(&self) -> bool {
        self.parked.is_some()
    }

    /// The import failure recorded on this frame, if any.
    pub fn abort(&self) -> Option<&ImportFunctionError> {
        self.abort.as_ref()
    }

    pub(crate) fn take_abort(&mut self) -> Option<ImportFunctionError> {
        self.abort.take()
    }
}

impl fmt::Debug for CallFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallFrame")
            .field("instance_name", &self.instance_name)
            .field("export_name", &self.export_name)
            .field("is_outermost", &self.is_outermost)
            .field("current_import", &self.current_import)
            .field("export_call_count", &self.export_call_count)
            .field("import_call_count", &self.import_call_count)
            .field("import_call_duration", &self.import_call_duration)
            .field("has_user_data", &self.user_data.is_some())
            .field("abort", &self.abort)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(instance: &str, export: &str, outermost: bool) -> CallFrame {
        CallFrame::new(Uuid::new_v4(), instance, export, outermost, None)
    }

    #[test]
    fn test_render_alternates_exports_and_imports() {
        let ctx = CallContext::new();
        ctx.push(frame("a", "run", true));
        ctx.enter_import("env/callB");
        ctx.push(frame("b", "run", true));
        ctx.enter_import("env/callA");

        assert_eq!(
            ctx.trail(),
            vec!["a::run", "env/callB", "b::run", "env/callA"]
        );
        assert_eq!(ctx.render(), "a::run -> env/callB -> b::run -> env/callA");
        assert_eq!(ctx.depth(), 2);
    }

    #[test]
    fn test_pop_folds_counts_into_parent() {
        let ctx = CallContext::new();
        ctx.push(frame("a", "outer", true));
        ctx.enter_import("env/x");
        ctx.push(frame("b", "inner", true));
        ctx.enter_import("env/y");
        ctx.leave_import(Duration::from_millis(5));

        let inner = ctx.pop().unwrap();
        assert_eq!(inner.import_call_count(), 1);
        assert_eq!(inner.export_call_count(), 0);
        ctx.leave_import(Duration::from_millis(7));

        let outer = ctx.pop().unwrap();
        assert_eq!(outer.export_call_count(), 1);
        assert_eq!(outer.import_call_count(), 2);
        assert_eq!(outer.import_call_duration(), Duration::from_millis(7));
        assert!(outer.current_import().is_none());
        assert!(ctx.pop().is_none());
    }

    #[test]
    fn test_abort_lands_on_top_frame() {
        let ctx = CallContext::new();
        ctx.push(frame("a", "run", true));
        ctx.set_abort(ImportFunctionError {
            import: "env/fail".into(),
            stack: ctx.trail(),
            cause: anyhow::anyhow!("boom"),
        });

        let mut top = ctx.pop().unwrap();
        assert!(top.abort().is_some());
        assert_eq!(top.take_abort().unwrap().import, "env/fail");
        assert!(top.abort().is_none());
    }

    #[test]
    fn test_cancellation() {
        let ctx = CallContext::new();
        assert!(ctx.check().is_ok());
        assert!(ctx.remaining().is_none());

        let clone = ctx.clone();
        clone.cancel();
        assert!(ctx.is_cancelled());
        assert!(matches!(ctx.check(), Err(RuntimeError::Cancelled)));
    }

    #[test]
    fn test_external_token_cancels_context() {
        let token = CancellationToken::new();
        let ctx = CallContext::with_cancellation(token.child_token());
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_timeout_expires() {
        let ctx = CallContext::with_timeout(Duration::ZERO);
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.remaining(), Some(Duration::ZERO));

        let ctx = CallContext::with_timeout(Duration::from_secs(3600));
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn test_identity_and_user_data() {
        let ctx = CallContext::new();
        let other = CallContext::new();
        assert!(ctx.same(&ctx.clone()));
        assert!(!ctx.same(&other));

        let data: UserData = Arc::new(42_u32);
        ctx.push(CallFrame::new(Uuid::new_v4(), "a", "run", true, Some(data)));
        let seen = ctx.user_data().unwrap();
        assert_eq!(seen.downcast_ref::<u32>(), Some(&42));
        assert_eq!(ctx.inspect(|stack| stack.top().map(CallFrame::qualified_name)), Some("a::run".to_string()));
    }

    #[test]
    fn test_panicking_host_body_unparks_caller() {
        let engine = crate::WasmEngine::new(&mapping_runtime_common::EngineConfig::default()).unwrap();
        let mut store = crate::store::create_store(
            &engine,
            HostState::new("a", mapping_runtime_common::DebugLevel::Off),
        );

        let ctx = CallContext::new();
        let id = Uuid::new_v4();
        ctx.push(CallFrame::new(id, "a", "run", true, None));

        let host_ctx = ctx.clone();
        let func = wasmtime::Func::wrap(&mut store, move |mut caller: Caller<'_, HostState>| -> () {
            let _parked = host_ctx.park(&mut caller);
            assert!(host_ctx.inspect(|stack| stack.top().is_some_and(CallFrame::is_suspended)));
            assert_eq!(
                host_ctx.with_parked_store(id, |store| store.data().instance_name.clone()),
                Some("a".to_string())
            );
            panic!("host body failed");
        });

        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            func.call(&mut store, &[], &mut [])
        }));
        assert!(!matches!(outcome, Ok(Ok(()))));

        assert!(!ctx.inspect(|stack| stack.top().is_some_and(CallFrame::is_suspended)));
        assert!(ctx.with_parked_store(id, |_| ()).is_none());
    }

    #[test]
    fn test_parked_store_is_thread_bound() {
        let engine = crate::WasmEngine::new(&mapping_runtime_common::EngineConfig::default()).unwrap();
        let mut store = crate::store::create_store(
            &engine,
            HostState::new("a", mapping_runtime_common::DebugLevel::Off),
        );

        let ctx = CallContext::new();
        let id = Uuid::new_v4();
        ctx.push(CallFrame::new(id, "a", "run", true, None));

        let host_ctx = ctx.clone();
        let func = wasmtime::Func::wrap(&mut store, move |mut caller: Caller<'_, HostState>| {
            let _parked = host_ctx.park(&mut caller);
            let remote = host_ctx.clone();
            let reached = std::thread::spawn(move || remote.with_parked_store(id, |_| ()).is_some())
                .join()
                .unwrap();
            assert!(!reached);
        });
        func.call(&mut store, &[], &mut []).unwrap();
        assert!(ctx.with_parked_store(id, |_| ()).is_none());
    }

    #[test]
    fn test_no_parked_store_without_guard() {
        let ctx = CallContext::new();
        let id = Uuid::new_v4();
        ctx.push(CallFrame::new(id, "a", "run", true, None));
        assert!(ctx.with_parked_store(id, |_| ()).is_none());
    }
}
