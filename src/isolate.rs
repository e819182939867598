//! Isolate ownership, locking and teardown.
//!
//! An `Isolate<A>` owns one unentered V8 isolate behind a mutex. The only way
//! to run code in it is [`Isolate::run_in_lock_scope`], which takes the mutex
//! and a `v8::Locker`, then hands out a [`Lock`]. Everything else on this type
//! is safe to call from any thread without the lock.

use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::code_map::CodeMap;
use crate::config::{ErrorReporter, IsolateConfig, IsolateFlags, Logger, ModuleFallback};
use crate::error::{Error, Result};
use crate::gc::{
    DeferredDestructionQueue, DeferredItem, ExternalMemoryTarget, JsLock, MemoryRetainer,
};
use crate::lock::Lock;
use crate::security::TimeoutGuard;
use crate::security::heap_limit::{HeapLimitState, install_heap_limit};
use crate::system::V8System;
use crate::wrapper::{ApiTypes, ContextTag, TypeWrapper};

static NEXT_ISOLATE_ID: AtomicU64 = AtomicU64::new(1);

/// Per-isolate state reachable from any scope through the isolate slot.
///
/// Only touched under the isolate lock.
pub(crate) struct IsolateState {
    pub(crate) id: u64,
    pub(crate) queue: Arc<DeferredDestructionQueue>,
    pub(crate) memory: Arc<ExternalMemoryTarget>,
    flags: Cell<IsolateFlags>,
    logger: RefCell<Option<Logger>>,
    error_reporter: RefCell<Option<ErrorReporter>>,
    module_fallback: RefCell<Option<ModuleFallback>>,
    pub(crate) code_map: RefCell<CodeMap>,
    wrappers: RefCell<Vec<Rc<TypeWrapper>>>,
    has_extra_wrappers: Cell<bool>,
    wrappables: RefCell<Vec<std::sync::Weak<dyn MemoryRetainer + Send + Sync>>>,
    contexts: RefCell<Vec<v8::Weak<v8::Context>>>,
    pub(crate) external_memory: Cell<i64>,
}

impl IsolateState {
    fn new(
        id: u64,
        flags: IsolateFlags,
        queue: Arc<DeferredDestructionQueue>,
        memory: Arc<ExternalMemoryTarget>,
    ) -> Self {
        Self {
            id,
            queue,
            memory,
            flags: Cell::new(flags),
            logger: RefCell::new(None),
            error_reporter: RefCell::new(None),
            module_fallback: RefCell::new(None),
            code_map: RefCell::new(CodeMap::new()),
            wrappers: RefCell::new(Vec::new()),
            has_extra_wrappers: Cell::new(false),
            wrappables: RefCell::new(Vec::new()),
            contexts: RefCell::new(Vec::new()),
            external_memory: Cell::new(0),
        }
    }

    /// State of the isolate `scope` belongs to.
    pub(crate) fn current(isolate: &v8::Isolate) -> Result<Rc<Self>> {
        isolate
            .get_slot::<Rc<Self>>()
            .cloned()
            .ok_or_else(|| Error::internal("isolate is not managed by this crate"))
    }

    pub(crate) fn flags(&self) -> IsolateFlags {
        self.flags.get()
    }

    pub(crate) fn update_flags(&self, f: impl FnOnce(&mut IsolateFlags)) {
        let mut flags = self.flags.get();
        f(&mut flags);
        self.flags.set(flags);
    }

    pub(crate) fn set_logger(&self, logger: Option<Logger>) {
        *self.logger.borrow_mut() = logger;
    }

    pub(crate) fn set_error_reporter(&self, reporter: Option<ErrorReporter>) {
        *self.error_reporter.borrow_mut() = reporter;
    }

    pub(crate) fn set_module_fallback(&self, fallback: Option<ModuleFallback>) {
        *self.module_fallback.borrow_mut() = fallback;
    }

    pub(crate) fn logger(&self) -> Option<Logger> {
        self.logger.borrow().clone()
    }

    pub(crate) fn error_reporter(&self) -> Option<ErrorReporter> {
        self.error_reporter.borrow().clone()
    }

    pub(crate) fn module_fallback(&self) -> Option<ModuleFallback> {
        self.module_fallback.borrow().clone()
    }

    pub(crate) fn log_warning(&self, scope: &mut v8::PinScope<'_, '_>, message: &str) {
        match self.logger() {
            Some(logger) => logger(scope, message),
            None => tracing::debug!("isolate {}: {}", self.id, message),
        }
    }

    pub(crate) fn report_error(
        &self,
        scope: &mut v8::PinScope<'_, '_>,
        description: &str,
        error: v8::Local<'_, v8::Value>,
        formatted: &str,
    ) {
        match self.error_reporter() {
            Some(reporter) => reporter(scope, description, error, formatted),
            None => tracing::debug!("isolate {}: {}: {}", self.id, description, formatted),
        }
    }

    pub(crate) fn push_wrapper(&self, build: impl FnOnce(usize) -> TypeWrapper) -> usize {
        let mut wrappers = self.wrappers.borrow_mut();
        let index = wrappers.len();
        wrappers.push(Rc::new(build(index)));

        if index > 0 {
            self.has_extra_wrappers.set(true);
        }

        index
    }

    pub(crate) fn wrapper(&self, index: usize) -> Result<Rc<TypeWrapper>> {
        self.wrappers
            .borrow()
            .get(index)
            .cloned()
            .ok_or_else(|| Error::internal(format!("no type wrapper at index {index}")))
    }

    pub(crate) fn wrapper_count(&self) -> usize {
        self.wrappers.borrow().len()
    }

    /// Wrapper for the context `scope` is in.
    pub(crate) fn current_wrapper(&self, scope: &mut v8::PinScope<'_, '_>) -> Result<Rc<TypeWrapper>> {
        if !self.has_extra_wrappers.get() {
            return self.wrapper(0);
        }

        let index = scope
            .get_current_context()
            .get_slot::<ContextTag>()
            .map_or(0, |tag| tag.wrapper);

        self.wrapper(index)
    }

    pub(crate) fn register_wrappable(&self, wrappable: std::sync::Weak<dyn MemoryRetainer + Send + Sync>) {
        let mut wrappables = self.wrappables.borrow_mut();

        if wrappables.len() == wrappables.capacity() {
            wrappables.retain(|w| w.strong_count() > 0);
        }

        wrappables.push(wrappable);
    }

    pub(crate) fn live_wrappables(&self) -> Vec<Arc<dyn MemoryRetainer + Send + Sync>> {
        let mut wrappables = self.wrappables.borrow_mut();
        wrappables.retain(|w| w.strong_count() > 0);
        wrappables.iter().filter_map(|w| w.upgrade()).collect()
    }

    pub(crate) fn register_context(
        &self,
        isolate: &mut v8::Isolate,
        context: v8::Local<'_, v8::Context>,
    ) {
        let mut contexts = self.contexts.borrow_mut();
        contexts.retain(|weak| !weak.is_empty());
        contexts.push(v8::Weak::new(isolate, context));
    }

    /// Push the current `eval_allowed` flag into every live context.
    pub(crate) fn apply_eval_policy(&self, scope: &mut v8::PinScope<'_, '_, ()>) {
        let allowed = self.flags().eval_allowed;
        let mut contexts = self.contexts.borrow_mut();
        contexts.retain(|weak| !weak.is_empty());

        for weak in contexts.iter() {
            if let Some(context) = weak.to_local(scope) {
                context.set_allow_generation_from_strings(allowed);
            }
        }
    }

    /// Drop everything that holds V8 handles. Called under the lock.
    fn teardown(&self) {
        for wrapper in self.wrappers.borrow().iter() {
            wrapper.clear_templates();
        }

        self.wrappers.borrow_mut().clear();
        self.wrappables.borrow_mut().clear();
        self.contexts.borrow_mut().clear();
        self.code_map.borrow_mut().clear();
        self.set_logger(None);
        self.set_error_reporter(None);
        self.set_module_fallback(None);
    }
}

struct Engine {
    // Disposed before the heap limit state it points to.
    isolate: v8::UnenteredIsolate,
    _heap_limit: Box<HeapLimitState>,
}

/// The part of an isolate that does not depend on its type set.
pub struct IsolateBase {
    id: u64,
    engine: Mutex<Option<Engine>>,
    handle: v8::IsolateHandle,
    queue: Arc<DeferredDestructionQueue>,
    memory: Arc<ExternalMemoryTarget>,
    system: V8System,
    heap_limit_reached: Arc<AtomicBool>,
}

impl IsolateBase {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn system(&self) -> &V8System {
        &self.system
    }

    /// Stop running JavaScript as soon as possible. Any thread, no lock.
    pub fn terminate_execution(&self) {
        tracing::debug!("Terminating execution in isolate {}", self.id);
        self.handle.terminate_execution();
    }

    /// Queue `item` for finalization at the next lock entry. Any thread.
    pub fn defer_destruction(&self, item: DeferredItem) {
        self.queue.defer(item);
    }

    pub fn external_memory_target(&self) -> Arc<ExternalMemoryTarget> {
        self.memory.clone()
    }

    /// Whether the heap limit terminated execution at some point.
    pub fn heap_limit_reached(&self) -> bool {
        self.heap_limit_reached.load(Ordering::SeqCst)
    }

    /// Terminate execution if the returned guard is still alive after `timeout`.
    pub fn terminate_after(&self, timeout: Duration) -> TimeoutGuard {
        TimeoutGuard::new(self.id, self.handle.clone(), timeout)
    }

    /// Items waiting for the next lock entry.
    pub fn pending_destructions(&self) -> u64 {
        self.queue.len()
    }

    /// Items finalized since creation.
    pub fn finalized_destructions(&self) -> u64 {
        self.queue.finalized()
    }

    fn lock_engine<R>(&self, f: impl FnOnce(&mut v8::Isolate) -> R) -> R {
        assert!(
            !JsLock::is_held(self.id),
            "isolate {} is already locked by this thread",
            self.id
        );

        let mut engine = self.engine.lock().expect("isolate mutex poisoned");
        let engine = engine.as_mut().expect("isolate used after disposal");

        let mut locker = v8::Locker::new(&mut engine.isolate);
        f(&mut locker)
    }
}

impl Drop for IsolateBase {
    fn drop(&mut self) {
        let engine = match self.engine.get_mut() {
            Ok(engine) => engine.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };

        let Some(mut engine) = engine else {
            return;
        };

        let finalized = {
            let mut locker = v8::Locker::new(&mut engine.isolate);
            let isolate: &mut v8::Isolate = &mut locker;
            let _js_lock = JsLock::new(self.id);

            if let Ok(state) = IsolateState::current(isolate) {
                state.teardown();
            }

            let finalized = self.queue.drain();
            self.system.shutdown_isolate(isolate);
            finalized
        };

        drop(engine);
        self.memory.detach();
        let late = self.queue.dispose();

        tracing::debug!(
            "Isolate {} disposed ({} deferred items finalized, {} after disposal)",
            self.id,
            finalized,
            late
        );
    }
}

impl std::fmt::Debug for IsolateBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolateBase")
            .field("id", &self.id)
            .field("queue", &self.queue)
            .field("memory", &self.memory)
            .finish()
    }
}

/// An isolate exposing the type set `A`.
pub struct Isolate<A: ApiTypes> {
    base: IsolateBase,
    _types: PhantomData<fn() -> A>,
}

impl<A: ApiTypes> Isolate<A> {
    pub fn new(
        system: &V8System,
        config: IsolateConfig,
        configuration: A::Configuration,
    ) -> Result<Self> {
        config.validate()?;

        let id = NEXT_ISOLATE_ID.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(DeferredDestructionQueue::new());
        let memory = ExternalMemoryTarget::new(id);
        let heap_limit_reached = Arc::new(AtomicBool::new(false));

        let state = Rc::new(IsolateState::new(
            id,
            config.flags,
            queue.clone(),
            memory.clone(),
        ));
        state.push_wrapper(|index| TypeWrapper::new::<A>(index, configuration));

        let params = v8::CreateParams::default()
            .heap_limits(config.heap_initial_bytes(), config.heap_max_bytes());
        let mut isolate = v8::Isolate::new_unentered(params);

        let (handle, heap_limit) = {
            let mut locker = v8::Locker::new(&mut isolate);
            let isolate: &mut v8::Isolate = &mut locker;

            let heap_limit = install_heap_limit(
                isolate,
                id,
                heap_limit_reached.clone(),
                config.heap_max_bytes(),
            );
            isolate.set_allow_wasm_code_generation_callback(allow_wasm_code_generation);
            isolate.set_slot(state);

            (isolate.thread_safe_handle(), heap_limit)
        };

        tracing::debug!(
            "Created isolate {} (heap {}-{} MB)",
            id,
            config.heap_initial_mb,
            config.heap_max_mb
        );

        Ok(Self {
            base: IsolateBase {
                id,
                engine: Mutex::new(Some(Engine {
                    isolate,
                    _heap_limit: heap_limit,
                })),
                handle,
                queue,
                memory,
                system: system.clone(),
                heap_limit_reached,
            },
            _types: PhantomData,
        })
    }

    /// Run `f` with exclusive access to the isolate.
    ///
    /// Blocks while another thread holds the lock. Deferred destructions and
    /// external memory changes are applied before `f` runs.
    ///
    /// # Panics
    ///
    /// If this thread already holds this isolate's lock.
    pub fn run_in_lock_scope<R>(&self, f: impl FnOnce(&mut Lock<'_, A>) -> R) -> R {
        self.base.lock_engine(|isolate| {
            let mut lock = Lock::new(isolate, &self.base);
            f(&mut lock)
        })
    }
}

impl<A: ApiTypes> std::ops::Deref for Isolate<A> {
    type Target = IsolateBase;

    fn deref(&self) -> &IsolateBase {
        &self.base
    }
}

impl<A: ApiTypes> std::fmt::Debug for Isolate<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.base.fmt(f)
    }
}

/// Wasm compilation follows the live `eval_allowed` flag.
unsafe extern "C" fn allow_wasm_code_generation(
    context: v8::Local<v8::Context>,
    _source: v8::Local<v8::String>,
) -> bool {
    v8::callback_scope!(unsafe scope, context);

    IsolateState::current(scope).is_ok_and(|state| state.flags().eval_allowed)
}
