//! Guest module instances: lifecycle and the export-call protocol.
//!
//! An [`Instance`] owns one compiled guest module and, once initialized, one
//! live instantiation of it. Its lifecycle is:
//!
//! ```text
//! Uninitialized --init--> Initialized --close--> Closed
//!       ^                   |     ^
//!       |  (init failed)   reset  |
//!       +---------------- Reinitializing
//! ```
//!
//! Export calls run synchronously on the calling thread. A call made from
//! inside a host function with the same [`CallContext`] re-enters the
//! instance on the store of the suspended outer call.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use mapping_runtime_common::{
    DebugLevel, GuestAbort, ImportFunctionError, InstanceConfig, RuntimeError,
};
use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use wasmtime::{AsContextMut, ExternType, Func, Linker, Store, StoreContextMut, Trap, Val};

use crate::binder::{self, ExportSignature, HostFunction};
use crate::context::{CallContext, CallFrame, UserData};
use crate::memory::{MemoryBinding, MemoryManager, protocol_violation};
use crate::store::{HostState, create_store};
use crate::value::{Value, WasmValue};
use crate::{CompiledModule, WasmEngine};

/// Namespace that matches an import of the same name in any namespace.
pub const WILDCARD_NAMESPACE: &str = "*";

/// Lifecycle state of an [`Instance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Accepting registrations; not yet instantiated.
    Uninitialized,
    /// First instantiation in progress.
    Initializing,
    /// Ready for export calls.
    Initialized,
    /// Discarding guest state and instantiating afresh.
    Reinitializing,
    /// Terminal.
    Closed,
}

/// Which export to call, and what to attach to its frame.
#[derive(Clone)]
pub struct CallParams {
    export: String,
    user_data: Option<UserData>,
}

impl CallParams {
    pub fn new(export: impl Into<String>) -> Self {
        Self {
            export: export.into(),
            user_data: None,
        }
    }

    /// Attach opaque data, readable by host functions through
    /// [`CallContext::user_data`] while this export runs.
    #[must_use]
    pub fn with_user_data(mut self, user_data: UserData) -> Self {
        self.user_data = Some(user_data);
        self
    }

    pub fn export(&self) -> &str {
        &self.export
    }
}

impl From<&str> for CallParams {
    fn from(export: &str) -> Self {
        Self::new(export)
    }
}

impl fmt::Debug for CallParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallParams")
            .field("export", &self.export)
            .field("has_user_data", &self.user_data.is_some())
            .finish()
    }
}

/// Statistics of one export call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallStats {
    /// Wall-clock time of the whole call.
    pub duration: Duration,
    /// Export calls nested under this one, across all instances.
    pub export_calls: u64,
    /// Import calls made under this one, across all instances.
    pub import_calls: u64,
    /// Time spent inside this call's own imports.
    pub import_duration: Duration,
    /// Change of this instance's heap position over the call.
    pub memory_delta: i64,
}

/// A successful export call.
#[derive(Debug)]
pub struct ExportCall {
    /// The lifted result, if the export declares one.
    pub value: Option<Value>,
    pub stats: CallStats,
}

impl ExportCall {
    /// Take the result as `T`.
    pub fn into_value<T: WasmValue>(self) -> Option<T> {
        self.value.and_then(T::from_value)
    }
}

/// A failed export call, with the statistics gathered before it failed.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct CallError {
    pub error: RuntimeError,
    pub stats: CallStats,
}

impl CallError {
    fn new(error: RuntimeError, stats: CallStats) -> Self {
        Self { error, stats }
    }

    pub fn into_error(self) -> RuntimeError {
        self.error
    }
}

/// A guest module with its import/export registrations and, once
/// initialized, a live instantiation.
pub struct Instance {
    name: String,
    engine: WasmEngine,
    module: CompiledModule,
    config: InstanceConfig,
    export_calls: AtomicU64,
    resets: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
}

struct Lifecycle {
    state: InstanceState,
    registry: Registry,
    live: Option<LiveInstance>,
}

#[derive(Clone, Default)]
struct Registry {
    imports: HashMap<(String, String), HostFunction>,
    exports: HashMap<String, ExportSignature>,
}

impl Registry {
    fn import(&self, namespace: &str, name: &str) -> Option<&HostFunction> {
        self.imports
            .get(&(namespace.to_string(), name.to_string()))
            .or_else(|| {
                self.imports
                    .get(&(WILDCARD_NAMESPACE.to_string(), name.to_string()))
            })
    }
}

struct LiveInstance {
    id: Uuid,
    /// `None` while a top-level call has the store checked out.
    store: Option<Store<HostState>>,
    memory: MemoryBinding,
    exports: HashMap<String, BoundExport>,
    active: Option<CallContext>,
    baseline_usage: u64,
    last_usage: u64,
}

impl LiveInstance {
    fn export(&self, name: &str) -> Result<BoundExport, RuntimeError> {
        self.exports
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::export_not_found(name))
    }
}

#[derive(Clone)]
struct BoundExport {
    func: Func,
    signature: ExportSignature,
}

/// Everything a call needs once preparation succeeded.
struct Prepared {
    id: Uuid,
    binding: MemoryBinding,
    bound: BoundExport,
    /// Checked-out store for a top-level call; `None` when re-entering.
    store: Option<Store<HostState>>,
}

enum Failure {
    Runtime(RuntimeError),
    Guest(anyhow::Error),
}

struct Invocation {
    result: Result<Option<Value>, Failure>,
    usage_before: Option<u64>,
    usage_after: Option<u64>,
}

impl Invocation {
    fn failed(error: RuntimeError) -> Self {
        Self {
            result: Err(Failure::Runtime(error)),
            usage_before: None,
            usage_after: None,
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    fn memory_delta(&self) -> i64 {
        match (self.usage_before, self.usage_after) {
            (Some(before), Some(after)) => after as i64 - before as i64,
            _ => 0,
        }
    }
}

impl Instance {
    /// Compile `module_bytes` into a new uninitialized instance.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes do not compile.
    pub fn new(
        name: impl Into<String>,
        engine: &WasmEngine,
        module_bytes: &[u8],
        config: InstanceConfig,
    ) -> Result<Self, RuntimeError> {
        let module = CompiledModule::from_bytes(engine.inner(), module_bytes)?;
        Ok(Self::from_module(name, engine, module, config))
    }

    /// Create an uninitialized instance of an already compiled module.
    pub fn from_module(
        name: impl Into<String>,
        engine: &WasmEngine,
        module: CompiledModule,
        config: InstanceConfig,
    ) -> Self {
        Self {
            name: name.into(),
            engine: engine.clone(),
            module,
            config,
            export_calls: AtomicU64::new(0),
            resets: AtomicU64::new(0),
            lifecycle: Mutex::new(Lifecycle {
                state: InstanceState::Uninitialized,
                registry: Registry::default(),
                live: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn module(&self) -> &CompiledModule {
        &self.module
    }

    pub fn config(&self) -> &InstanceConfig {
        &self.config
    }

    pub fn state(&self) -> InstanceState {
        self.lifecycle.lock().state
    }

    /// Number of export calls that passed preparation, including re-entrant
    /// ones.
    pub fn export_call_count(&self) -> u64 {
        self.export_calls.load(Ordering::Relaxed)
    }

    /// Number of completed resets, explicit or automatic.
    pub fn reset_count(&self) -> u64 {
        self.resets.load(Ordering::Relaxed)
    }

    /// Heap position sampled after the most recent export call (or init).
    pub fn memory_usage(&self) -> Option<u64> {
        self.lifecycle.lock().live.as_ref().map(|live| live.last_usage)
    }

    /// Heap position right after the current instantiation finished init.
    pub fn memory_baseline(&self) -> Option<u64> {
        self.lifecycle
            .lock()
            .live
            .as_ref()
            .map(|live| live.baseline_usage)
    }

    /// Bind `function` to the guest import `namespace/name`. Use
    /// [`WILDCARD_NAMESPACE`] to match `name` in any namespace.
    ///
    /// # Errors
    ///
    /// Fails after init, or if the same import was already registered.
    pub fn register_import(
        &self,
        namespace: &str,
        name: &str,
        function: HostFunction,
    ) -> Result<(), RuntimeError> {
        let mut lc = self.lifecycle.lock();
        Self::ensure_registrable(&lc)?;

        let key = (namespace.to_string(), name.to_string());
        if lc.registry.imports.contains_key(&key) {
            return Err(RuntimeError::registration(format!(
                "import {namespace}/{name} is already registered"
            )));
        }
        lc.registry.imports.insert(key, function);
        Ok(())
    }

    /// Declare the shape of the guest export `name`.
    ///
    /// # Errors
    ///
    /// Fails after init, or if the export was already registered.
    pub fn register_export(
        &self,
        name: &str,
        signature: ExportSignature,
    ) -> Result<(), RuntimeError> {
        let mut lc = self.lifecycle.lock();
        Self::ensure_registrable(&lc)?;

        if lc.registry.exports.contains_key(name) {
            return Err(RuntimeError::registration(format!(
                "export {name} is already registered"
            )));
        }
        lc.registry.exports.insert(name.to_string(), signature);
        Ok(())
    }

    fn ensure_registrable(lc: &Lifecycle) -> Result<(), RuntimeError> {
        if lc.state == InstanceState::Uninitialized {
            Ok(())
        } else {
            Err(RuntimeError::registration("register before init"))
        }
    }

    /// Instantiate the module, bind imports and exports, and run the guest
    /// start routine.
    ///
    /// On failure the instance stays uninitialized and nothing is reused by
    /// the next attempt.
    #[instrument(skip(self), fields(instance = %self.name))]
    pub fn init(&self) -> Result<(), RuntimeError> {
        let mut lc = self.lifecycle.lock();
        match lc.state {
            InstanceState::Uninitialized => {}
            InstanceState::Closed => return Err(RuntimeError::not_initialized(&self.name)),
            InstanceState::Initialized => {
                return Err(RuntimeError::instantiation(format!(
                    "instance '{}' is already initialized",
                    self.name
                )));
            }
            InstanceState::Initializing | InstanceState::Reinitializing => {
                return Err(self.busy());
            }
        }
        self.reinstantiate(&mut lc, InstanceState::Initializing)
    }

    /// Discard all guest state and instantiate afresh.
    ///
    /// # Errors
    ///
    /// Fails with [`RuntimeError::Busy`] while a call is active. If the new
    /// instantiation fails the instance is left uninitialized.
    #[instrument(skip(self), fields(instance = %self.name))]
    pub fn reset(&self) -> Result<(), RuntimeError> {
        let mut lc = self.lifecycle.lock();
        match lc.state {
            InstanceState::Uninitialized | InstanceState::Initialized => {}
            InstanceState::Closed => return Err(RuntimeError::not_initialized(&self.name)),
            InstanceState::Initializing | InstanceState::Reinitializing => {
                return Err(self.busy());
            }
        }
        if lc.live.as_ref().is_some_and(|live| live.active.is_some()) {
            return Err(self.busy());
        }

        self.reinstantiate(&mut lc, InstanceState::Reinitializing)?;
        self.resets.fetch_add(1, Ordering::Relaxed);
        info!("Instance reset");
        Ok(())
    }

    /// Release the live instantiation. Idempotent; a closed instance never
    /// leaves [`InstanceState::Closed`].
    #[instrument(skip(self), fields(instance = %self.name))]
    pub fn close(&self) -> Result<(), RuntimeError> {
        let mut lc = self.lifecycle.lock();
        match lc.state {
            InstanceState::Closed => return Ok(()),
            InstanceState::Initializing | InstanceState::Reinitializing => {
                return Err(self.busy());
            }
            InstanceState::Uninitialized | InstanceState::Initialized => {}
        }
        if lc.live.as_ref().is_some_and(|live| live.active.is_some()) {
            return Err(self.busy());
        }

        lc.state = InstanceState::Closed;
        let live = lc.live.take();
        drop(lc);
        drop(live);

        info!("Instance closed");
        Ok(())
    }

    /// Call the guest export named in `params`.
    ///
    /// A call under a context that is already active on this instance
    /// re-enters it. Otherwise this is a top-level call, and the instance is
    /// reset first if the previous call left it above its memory hard limit.
    ///
    /// # Errors
    ///
    /// Prepare errors leave the guest untouched. Execution errors carry the
    /// statistics gathered up to the failure; the instance stays usable.
    pub fn call_export(
        &self,
        ctx: &CallContext,
        params: CallParams,
        args: Vec<Value>,
    ) -> Result<ExportCall, CallError> {
        let started = Instant::now();
        let CallParams { export, user_data } = params;

        let prepared = self.prepare(ctx, &export, &args).map_err(|error| {
            debug!(instance = %self.name, export = %export, %error, "Export call rejected");
            CallError::new(
                error,
                CallStats {
                    duration: started.elapsed(),
                    ..CallStats::default()
                },
            )
        })?;
        let Prepared {
            id,
            binding,
            bound,
            store,
        } = prepared;

        self.export_calls.fetch_add(1, Ordering::Relaxed);
        let top_level = store.is_some();
        let traced = self.config.debug_level >= DebugLevel::Calls;

        ctx.push(CallFrame::new(id, &self.name, &export, top_level, user_data));
        if traced {
            debug!(
                instance = %self.name,
                export = %export,
                depth = ctx.depth(),
                reentrant = !top_level,
                "Export call started"
            );
        }

        let (invocation, store) = match store {
            Some(mut store) => {
                let invocation = Self::invoke(store.as_context_mut(), binding, &bound, &args);
                (invocation, Some(store))
            }
            None => {
                let invocation = ctx
                    .with_parked_store(id, |store| Self::invoke(store, binding, &bound, &args))
                    .unwrap_or_else(|| {
                        Invocation::failed(protocol_violation(format!(
                            "instance '{}' is active but not suspended in an import on this thread",
                            self.name
                        )))
                    });
                (invocation, None)
            }
        };

        let mut frame = ctx.pop();
        let stats = CallStats {
            duration: started.elapsed(),
            export_calls: frame.as_ref().map_or(0, CallFrame::export_call_count),
            import_calls: frame.as_ref().map_or(0, CallFrame::import_call_count),
            import_duration: frame
                .as_ref()
                .map_or(Duration::ZERO, CallFrame::import_call_duration),
            memory_delta: invocation.memory_delta(),
        };
        self.finish(id, store, invocation.usage_after);

        match invocation.result {
            Ok(value) => {
                if traced {
                    debug!(
                        instance = %self.name,
                        export = %export,
                        duration_us = stats.duration.as_micros(),
                        export_calls = stats.export_calls,
                        import_calls = stats.import_calls,
                        memory_delta = stats.memory_delta,
                        "Export call finished"
                    );
                }
                Ok(ExportCall { value, stats })
            }
            Err(failure) => {
                let abort = frame.as_mut().and_then(CallFrame::take_abort);
                let error = classify(failure, abort);
                if traced {
                    debug!(instance = %self.name, export = %export, %error, "Export call failed");
                }
                Err(CallError::new(error, stats))
            }
        }
    }

    /// Validate the call and check out what it needs, resetting first when
    /// the memory policy asks for it.
    fn prepare(
        &self,
        ctx: &CallContext,
        export: &str,
        args: &[Value],
    ) -> Result<Prepared, RuntimeError> {
        ctx.check()?;

        let mut lc = self.lifecycle.lock();
        if lc.state != InstanceState::Initialized {
            return Err(RuntimeError::not_initialized(&self.name));
        }

        let signature = lc
            .registry
            .exports
            .get(export)
            .ok_or_else(|| RuntimeError::export_not_found(export))?;
        signature.check_args(export, args)?;

        let live = lc
            .live
            .as_ref()
            .ok_or_else(|| RuntimeError::not_initialized(&self.name))?;
        match &live.active {
            Some(active) if active.same(ctx) => {
                return Ok(Prepared {
                    id: live.id,
                    binding: live.memory.clone(),
                    bound: live.export(export)?,
                    store: None,
                });
            }
            Some(_) => {
                return Err(RuntimeError::ForeignContext {
                    instance: self.name.clone(),
                });
            }
            None => {}
        }

        if live.last_usage > self.config.memory_hard_limit_bytes {
            warn!(
                instance = %self.name,
                usage = live.last_usage,
                limit = self.config.memory_hard_limit_bytes,
                "Memory hard limit exceeded, resetting instance"
            );
            self.reinstantiate(&mut lc, InstanceState::Reinitializing)?;
            self.resets.fetch_add(1, Ordering::Relaxed);
        }

        let live = lc
            .live
            .as_mut()
            .ok_or_else(|| RuntimeError::not_initialized(&self.name))?;
        let bound = live.export(export)?;
        let mut store = live.store.take().ok_or_else(|| self.busy())?;
        store.data_mut().context = Some(ctx.clone());
        live.active = Some(ctx.clone());

        Ok(Prepared {
            id: live.id,
            binding: live.memory.clone(),
            bound,
            store: Some(store),
        })
    }

    /// Lower arguments, run the export, lift its result, and sample the heap
    /// on both sides.
    fn invoke(
        mut store: StoreContextMut<'_, HostState>,
        binding: MemoryBinding,
        bound: &BoundExport,
        args: &[Value],
    ) -> Invocation {
        let mut mm = MemoryManager::new(binding.clone(), store.as_context_mut());
        let usage_before = match mm.heap_position() {
            Ok(usage) => usage,
            Err(error) => return Invocation::failed(error),
        };
        let lowered = args
            .iter()
            .map(|arg| binder::lower(&mut mm, arg))
            .collect::<Result<Vec<Val>, RuntimeError>>();
        let params = match lowered {
            Ok(params) => params,
            Err(error) => {
                return Invocation {
                    result: Err(Failure::Runtime(error)),
                    usage_before: Some(usage_before),
                    usage_after: mm.heap_position().ok(),
                };
            }
        };

        let result_kind = bound.signature.result();
        let mut results: Vec<Val> = result_kind
            .map(|kind| kind.wasm_type().zero())
            .into_iter()
            .collect();
        let called = bound.func.call(&mut store, &params, &mut results);

        let mut mm = MemoryManager::new(binding, store.as_context_mut());
        let result = match (called, result_kind, results.first()) {
            (Err(err), _, _) => Err(Failure::Guest(err)),
            (Ok(()), Some(kind), Some(raw)) => binder::lift(&mut mm, kind, raw)
                .map(Some)
                .map_err(Failure::Runtime),
            (Ok(()), _, _) => Ok(None),
        };

        Invocation {
            result,
            usage_before: Some(usage_before),
            usage_after: mm.heap_position().ok(),
        }
    }

    /// Record the post-call heap sample and, for a top-level call, return
    /// the store and clear the active context.
    fn finish(&self, id: Uuid, store: Option<Store<HostState>>, usage_after: Option<u64>) {
        let mut lc = self.lifecycle.lock();
        let Some(live) = lc.live.as_mut().filter(|live| live.id == id) else {
            return;
        };
        if let Some(usage) = usage_after {
            live.last_usage = usage;
        }
        if let Some(mut store) = store {
            store.data_mut().context = None;
            live.store = Some(store);
            live.active = None;
        }
    }

    /// Replace the live instantiation with a fresh one, without holding the
    /// lifecycle lock while guest code runs.
    fn reinstantiate(
        &self,
        lc: &mut MutexGuard<'_, Lifecycle>,
        transitional: InstanceState,
    ) -> Result<(), RuntimeError> {
        lc.state = transitional;
        let previous = lc.live.take();
        let registry = lc.registry.clone();

        let fresh = MutexGuard::unlocked(lc, || {
            drop(previous);
            self.instantiate(&registry)
        });

        match fresh {
            Ok(live) => {
                lc.live = Some(live);
                lc.state = InstanceState::Initialized;
                Ok(())
            }
            Err(error) => {
                warn!(instance = %self.name, %error, "Instantiation failed");
                lc.state = InstanceState::Uninitialized;
                Err(error)
            }
        }
    }

    fn instantiate(&self, registry: &Registry) -> Result<LiveInstance, RuntimeError> {
        let started = Instant::now();
        let mut linker = Linker::new(self.engine.inner());
        let mut defined = HashSet::new();

        for import in self.module.module().imports() {
            let (namespace, name) = (import.module(), import.name());
            let ExternType::Func(ty) = import.ty() else {
                return Err(RuntimeError::instantiation(format!(
                    "import {namespace}/{name} is not a function"
                )));
            };
            let function = registry.import(namespace, name).ok_or_else(|| {
                RuntimeError::instantiation(format!("unresolved import {namespace}/{name}"))
            })?;
            if !function.matches(&ty) {
                return Err(RuntimeError::instantiation(format!(
                    "import {namespace}/{name} has type {ty:?}, registered as {:?} -> {:?}",
                    function.params(),
                    function.results()
                )));
            }
            if defined.insert((namespace.to_string(), name.to_string())) {
                binder::define_import(&mut linker, namespace, name, ty, function.clone())?;
            }
        }

        let mut store = create_store(
            &self.engine,
            HostState::new(self.name.clone(), self.config.debug_level),
        );
        let id = store.data().instance_id;

        let instance = linker
            .instantiate(&mut store, self.module.module())
            .map_err(|e| RuntimeError::instantiation(format!("{e:#}")))?;

        let memory = instance
            .get_memory(&mut store, &self.config.memory_export)
            .ok_or_else(|| {
                RuntimeError::instantiation(format!(
                    "module does not export memory '{}'",
                    self.config.memory_export
                ))
            })?;
        let allocate = instance
            .get_typed_func::<i32, i32>(&mut store, &self.config.allocate_function)
            .map_err(|e| {
                RuntimeError::instantiation(format!(
                    "module does not export '{}(i32) -> i32': {e}",
                    self.config.allocate_function
                ))
            })?;
        let binding = MemoryBinding::new(memory, allocate);
        store.data_mut().memory = Some(binding.clone());

        let mut exports = HashMap::with_capacity(registry.exports.len());
        for (name, signature) in &registry.exports {
            let func = instance.get_func(&mut store, name).ok_or_else(|| {
                RuntimeError::instantiation(format!("module does not export function '{name}'"))
            })?;
            let ty = func.ty(&store);
            if !signature.matches(&ty) {
                return Err(RuntimeError::instantiation(format!(
                    "export '{name}' has type {ty:?}, registered as {signature:?}"
                )));
            }
            exports.insert(
                name.clone(),
                BoundExport {
                    func,
                    signature: signature.clone(),
                },
            );
        }

        if let Some(start) = instance.get_func(&mut store, &self.config.start_function) {
            self.run_start(&mut store, id, start)?;
        }

        let baseline_usage = MemoryManager::new(binding.clone(), store.as_context_mut()).heap_position()?;

        info!(
            instance = %self.name,
            instance_id = %id,
            baseline_usage,
            duration_ms = started.elapsed().as_millis(),
            "Instance initialized"
        );

        Ok(LiveInstance {
            id,
            store: Some(store),
            memory: binding,
            exports,
            active: None,
            baseline_usage,
            last_usage: baseline_usage,
        })
    }

    /// Run the start routine inside a synthetic outermost frame, so imports
    /// it calls see a valid context.
    fn run_start(
        &self,
        store: &mut Store<HostState>,
        id: Uuid,
        start: Func,
    ) -> Result<(), RuntimeError> {
        let ty = start.ty(&*store);
        if ty.params().next().is_some() || ty.results().next().is_some() {
            return Err(RuntimeError::instantiation(format!(
                "start function '{}' must take and return nothing",
                self.config.start_function
            )));
        }

        let ctx = CallContext::new();
        ctx.push(CallFrame::new(
            id,
            &self.name,
            &self.config.start_function,
            true,
            None,
        ));
        store.data_mut().context = Some(ctx.clone());
        let outcome = start.call(&mut *store, &[], &mut []);
        store.data_mut().context = None;

        let abort = ctx.pop().and_then(|mut frame| frame.take_abort());
        outcome.map_err(|err| classify(Failure::Guest(err), abort))
    }

    fn busy(&self) -> RuntimeError {
        RuntimeError::Busy {
            instance: self.name.clone(),
        }
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("name", &self.name)
            .field("module", &self.module)
            .field("state", &self.state())
            .field("export_calls", &self.export_call_count())
            .finish_non_exhaustive()
    }
}

/// Pick the error a failed call reports. A recorded import failure beats the
/// engine's generic trap, except a guest abort, which is the guest's own
/// diagnostic.
fn classify(failure: Failure, abort: Option<ImportFunctionError>) -> RuntimeError {
    if let Some(abort) = abort {
        if let Some(guest) = abort.cause.downcast_ref::<GuestAbort>() {
            return RuntimeError::guest_trap(guest.to_string());
        }
        return RuntimeError::ImportFailure(abort);
    }
    match failure {
        Failure::Runtime(error) => error,
        Failure::Guest(err) => match err.downcast::<RuntimeError>() {
            Ok(error) => error,
            Err(err) => RuntimeError::guest_trap(trap_message(&err)),
        },
    }
}

/// Human-readable trap text from an engine error.
fn trap_message(err: &anyhow::Error) -> String {
    err.downcast_ref::<Trap>()
        .map_or_else(|| err.root_cause().to_string(), ToString::to_string)
}
