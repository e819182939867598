//! The execution scope: everything that needs the isolate lock.

use std::any::TypeId;
use std::cell::RefMut;
use std::marker::PhantomData;
use std::pin::pin;
use std::rc::Rc;

use crate::code_map::CodeMap;
use crate::config::{
    CompilationObserver, ErrorReporter, IsolateFlags, Logger, ModuleFallback,
    ModuleFallbackResult, ResolveMethod,
};
use crate::context::create_context;
use crate::error::{Error, JsException, Result};
use crate::gc::{HeapSnapshot, JsLock, MemoryRetainer, MemoryTracker};
use crate::isolate::{IsolateBase, IsolateState};
use crate::wrappable::{IsolateGlobal, JsContext, JsValue, Ref, type_of};
use crate::wrapper::exception::{from_exception, to_exception};
use crate::wrapper::{
    ApiTypes, Deserializer, FromJs, Resource, Serializer, ToJs, TypeWrapper, js_string,
};

/// Exclusive access to one isolate, valid for the duration of
/// [`Isolate::run_in_lock_scope`](crate::Isolate::run_in_lock_scope).
///
/// Not `Send`: the lock belongs to the thread that took it.
pub struct Lock<'a, A: ApiTypes> {
    isolate: &'a mut v8::Isolate,
    base: &'a IsolateBase,
    state: Rc<IsolateState>,
    _js_lock: JsLock,
    _types: PhantomData<fn() -> A>,
}

macro_rules! flag_accessors {
    ($($flag:ident / $setter:ident),* $(,)?) => {
        $(
            pub fn $flag(&self) -> bool {
                self.state.flags().$flag
            }

            pub fn $setter(&mut self, value: bool) {
                self.state.update_flags(|flags| flags.$flag = value);
            }
        )*
    };
}

impl<'a, A: ApiTypes> Lock<'a, A> {
    pub(crate) fn new(isolate: &'a mut v8::Isolate, base: &'a IsolateBase) -> Self {
        let js_lock = JsLock::new(base.id());
        let state = IsolateState::current(isolate).expect("isolate state missing");

        let mut lock = Self {
            isolate,
            base,
            state,
            _js_lock: js_lock,
            _types: PhantomData,
        };

        lock.apply_deferred_actions();
        lock
    }

    /// Finalize queued destructions and report pending external memory.
    fn apply_deferred_actions(&mut self) {
        let finalized = self.state.queue.drain();
        let delta = self.state.memory.take_pending();

        if delta != 0 {
            let total = self
                .isolate
                .adjust_amount_of_external_allocated_memory(delta);
            self.state.external_memory.set(total);
        }

        if finalized > 0 || delta != 0 {
            log::trace!(
                "Isolate {} lock: {} deferred items finalized, external memory {:+}",
                self.base.id(),
                finalized,
                delta
            );
        }
    }

    pub fn isolate_id(&self) -> u64 {
        self.base.id()
    }

    pub fn base(&self) -> &IsolateBase {
        self.base
    }

    fn enter<R>(
        &mut self,
        ctx: &JsContext,
        f: impl FnOnce(&mut v8::PinScope<'_, '_>, &IsolateState) -> R,
    ) -> R {
        assert_eq!(
            ctx.isolate_id(),
            self.base.id(),
            "context of isolate {} used under the lock of isolate {}",
            ctx.isolate_id(),
            self.base.id()
        );

        let state = self.state.clone();
        let scope = pin!(v8::HandleScope::new(&mut *self.isolate));
        let mut scope = scope.init();
        let context = v8::Local::new(&scope, ctx.handle());
        let scope = &mut v8::ContextScope::new(&mut scope, context);

        f(scope, &state)
    }

    fn adopt<T: 'static>(&self, handle: v8::Global<T>) -> IsolateGlobal<T> {
        IsolateGlobal::new(handle, self.base.id(), self.state.queue.clone())
    }

    // Contexts

    /// Create a context whose global object is `global`, using the default
    /// type wrapper.
    pub fn new_context<G: Resource>(&mut self, global: Ref<G>) -> Result<JsContext> {
        self.context_with_wrapper(0, &global)
    }

    /// Create a context backed by a new type wrapper built from
    /// `configuration`. The wrapper lives as long as the isolate.
    pub fn new_context_with_configuration<G: Resource>(
        &mut self,
        global: Ref<G>,
        configuration: A::Configuration,
    ) -> Result<JsContext> {
        let index = self
            .state
            .push_wrapper(|index| TypeWrapper::new::<A>(index, configuration));

        tracing::debug!(
            "Isolate {} added type wrapper {}",
            self.base.id(),
            index
        );

        self.context_with_wrapper(index, &global)
    }

    fn context_with_wrapper<G: Resource>(
        &mut self,
        wrapper_index: usize,
        global: &Ref<G>,
    ) -> Result<JsContext> {
        let state = self.state.clone();
        let context = create_context(&mut *self.isolate, &state, wrapper_index, global)?;

        Ok(JsContext::new(self.adopt(context), wrapper_index))
    }

    pub fn wrapper_index(&self, ctx: &JsContext) -> usize {
        ctx.wrapper_index()
    }

    /// Configuration of the wrapper `ctx` was created with.
    pub fn wrapper_configuration(&self, ctx: &JsContext) -> Result<A::Configuration> {
        let wrapper = self.state.wrapper(ctx.wrapper_index())?;

        wrapper
            .configuration::<A::Configuration>()
            .cloned()
            .ok_or_else(|| Error::internal("wrapper configuration has an unexpected type"))
    }

    pub fn wrapper_count(&self) -> usize {
        self.state.wrapper_count()
    }

    // Values

    pub fn wrap<T: ToJs>(&mut self, ctx: &JsContext, value: T) -> Result<JsValue> {
        let handle = self.enter(ctx, |scope, _| {
            let local = value.to_js(scope)?;
            Ok::<_, Error>(v8::Global::new(scope, local))
        })?;

        Ok(self.adopt(handle))
    }

    pub fn unwrap<T: FromJs>(&mut self, ctx: &JsContext, value: &JsValue) -> Result<T> {
        self.enter(ctx, |scope, _| {
            let local = value.open(scope);
            T::from_js(scope, local)
        })
    }

    // Exceptions

    /// The JavaScript exception `error` would be thrown as.
    pub fn wrap_exception(&mut self, ctx: &JsContext, error: &Error) -> Result<JsValue> {
        let handle = self.enter(ctx, |scope, _| {
            let exception = to_exception(scope, error);
            Ok::<_, Error>(v8::Global::new(scope, exception))
        })?;

        Ok(self.adopt(handle))
    }

    pub fn unwrap_exception(&mut self, ctx: &JsContext, value: &JsValue) -> Result<JsException> {
        self.enter(ctx, |scope, _| {
            let local = value.open(scope);
            from_exception(scope, local)
        })
    }

    // Serialization

    /// Write `value`'s tag and payload. `false` if its type has no serializer.
    pub fn serialize(
        &mut self,
        ctx: &JsContext,
        value: &JsValue,
        serializer: &mut Serializer,
    ) -> Result<bool> {
        self.enter(ctx, |scope, state| {
            let local = value.open(scope);
            let Ok(object) = v8::Local::<v8::Object>::try_from(local) else {
                return Ok(false);
            };

            let Some((type_id, _)) = type_of(scope, object) else {
                return Ok(false);
            };

            let wrapper = state.wrapper(ctx.wrapper_index())?;
            let Some(entry) = wrapper.registry().serializer(type_id) else {
                return Ok(false);
            };

            serializer.write_u32(entry.tag);
            (entry.serialize)(scope, local, serializer)?;
            Ok(true)
        })
    }

    /// Read one tagged value. `None` if the tag is unknown.
    pub fn deserialize(
        &mut self,
        ctx: &JsContext,
        deserializer: &mut Deserializer,
    ) -> Result<Option<JsValue>> {
        let handle = self.enter(ctx, |scope, state| {
            let tag = deserializer.read_u32()?;
            let wrapper = state.wrapper(ctx.wrapper_index())?;

            let Some(deserialize) = wrapper.registry().deserializer(tag) else {
                tracing::debug!("No deserializer for tag {}", tag);
                return Ok::<_, Error>(None);
            };

            let local = deserialize(scope, deserializer)?;
            Ok(Some(v8::Global::new(scope, local)))
        })?;

        Ok(handle.map(|handle| self.adopt(handle)))
    }

    // Type discovery

    fn constructor<'s, T: Resource>(
        scope: &mut v8::PinScope<'s, '_>,
        state: &IsolateState,
    ) -> Result<v8::Local<'s, v8::Function>> {
        let wrapper = state.current_wrapper(scope)?;
        let template = wrapper.template(scope, state, TypeId::of::<T>(), T::CLASS_NAME)?;

        template
            .get_function(scope)
            .ok_or_else(|| Error::internal(format!("failed to instantiate {}", T::CLASS_NAME)))
    }

    /// The JavaScript class of `T` in `ctx`.
    pub fn get_constructor<T: Resource>(&mut self, ctx: &JsContext) -> Result<JsValue> {
        let handle = self.enter(ctx, |scope, state| {
            let constructor = Self::constructor::<T>(scope, state)?;
            Ok::<_, Error>(v8::Global::new(scope, v8::Local::<v8::Value>::from(constructor)))
        })?;

        Ok(self.adopt(handle))
    }

    /// Expose `T`'s class as the global `T::CLASS_NAME` in `ctx`.
    pub fn install_constructor<T: Resource>(&mut self, ctx: &JsContext) -> Result<()> {
        self.enter(ctx, |scope, state| {
            let constructor = Self::constructor::<T>(scope, state)?;
            let key = js_string(scope, T::CLASS_NAME)?;
            let global = scope.get_current_context().global(scope);

            global
                .set(scope, key.into(), constructor.into())
                .ok_or_else(|| Error::internal(format!("failed to install {}", T::CLASS_NAME)))?;
            Ok(())
        })
    }

    /// Whether `T`'s prototype object appears on `value`'s prototype chain.
    ///
    /// Prototypes are compared by identity, so a forged `constructor`
    /// property does not count.
    pub fn is_instance_of<T: Resource>(&mut self, ctx: &JsContext, value: &JsValue) -> Result<bool> {
        self.enter(ctx, |scope, state| {
            let constructor = Self::constructor::<T>(scope, state)?;
            let key = js_string(scope, "prototype")?;

            let local = value.open(scope);
            let Ok(object) = v8::Local::<v8::Object>::try_from(local) else {
                return Ok(false);
            };

            // Proxy traps on the chain run script.
            try_catch(scope, state, |tc| {
                let target = constructor.get(tc, key.into())?;

                let mut object = object;
                loop {
                    let prototype = object.get_prototype(tc)?;
                    if !prototype.is_object() {
                        return Some(false);
                    }
                    if prototype.strict_equals(target) {
                        return Some(true);
                    }
                    object = v8::Local::<v8::Object>::try_from(prototype).ok()?;
                }
            })
        })
    }

    // Execution

    /// Compile and run `code` in `ctx`.
    pub fn evaluate(&mut self, ctx: &JsContext, code: &str) -> Result<JsValue> {
        let handle = self.enter(ctx, |scope, state| {
            let source = js_string(scope, code)?;

            try_catch(scope, state, |tc| {
                let script = v8::Script::compile(tc, source, None)?;
                let value = script.run(tc)?;
                Some(v8::Global::new(tc, value))
            })
        })?;

        Ok(self.adopt(handle))
    }

    /// Evaluate `code` and convert the completion value.
    pub fn evaluate_as<T: FromJs>(&mut self, ctx: &JsContext, code: &str) -> Result<T> {
        self.enter(ctx, |scope, state| {
            let source = js_string(scope, code)?;

            let handle = try_catch(scope, state, |tc| {
                let script = v8::Script::compile(tc, source, None)?;
                let value = script.run(tc)?;
                Some(v8::Global::new(tc, value))
            })?;

            let local = v8::Local::new(scope, &handle);
            T::from_js(scope, local)
        })
    }

    /// Call `function` with an undefined receiver.
    pub fn call(&mut self, ctx: &JsContext, function: &JsValue, args: &[&JsValue]) -> Result<JsValue> {
        let handle = self.enter(ctx, |scope, state| {
            let local = function.open(scope);
            let function = v8::Local::<v8::Function>::try_from(local)
                .map_err(|_| Error::type_error("value is not a function"))?;

            let argv: Vec<v8::Local<v8::Value>> = args.iter().map(|arg| arg.open(scope)).collect();
            let receiver: v8::Local<v8::Value> = v8::undefined(scope).into();

            try_catch(scope, state, |tc| {
                let result = function.call(tc, receiver, &argv)?;
                Some(v8::Global::new(tc, result))
            })
        })?;

        Ok(self.adopt(handle))
    }

    /// Raw scope access inside `ctx`.
    pub fn with_scope<R>(
        &mut self,
        ctx: &JsContext,
        f: impl FnOnce(&mut v8::PinScope<'_, '_>) -> R,
    ) -> R {
        self.enter(ctx, |scope, _| f(scope))
    }

    pub fn run_microtasks(&mut self) {
        self.isolate.perform_microtask_checkpoint();
    }

    /// Run pending platform tasks. `true` if a task ran.
    pub fn pump_message_loop(&mut self) -> bool {
        self.base.system().pump_message_loop(self.isolate)
    }

    /// Ask V8 for a full collection.
    pub fn request_gc(&mut self) {
        tracing::debug!("Isolate {}: low memory notification", self.base.id());
        self.isolate.low_memory_notification();
    }

    // External memory

    /// Total external memory reported to V8 so far.
    pub fn external_memory(&self) -> i64 {
        self.state.external_memory.get()
    }

    /// Report `delta` bytes directly. Returns the new total.
    pub fn adjust_external_memory(&mut self, delta: i64) -> i64 {
        let total = self
            .isolate
            .adjust_amount_of_external_allocated_memory(delta);
        self.state.external_memory.set(total);
        total
    }

    pub fn heap_snapshot(&self) -> HeapSnapshot {
        let live = self.state.live_wrappables();
        let mut tracker = MemoryTracker::new();
        let root = tracker.track_node("", "IsolateBase", 0);
        let mut total = std::mem::size_of::<IsolateBase>();

        tracker.with_parent(root, |tracker| {
            for wrappable in &live {
                total += wrappable.self_size();
                tracker.track(wrappable.memory_name(), wrappable.as_ref());
            }
        });

        tracker.set_self_size(root, total);
        tracker.finish()
    }

    pub fn code_map(&self) -> RefMut<'_, CodeMap> {
        self.state.code_map.borrow_mut()
    }

    // Flags and callbacks

    pub fn flags(&self) -> IsolateFlags {
        self.state.flags()
    }

    pub fn eval_allowed(&self) -> bool {
        self.state.flags().eval_allowed
    }

    /// Also governs wasm compilation. Applies to existing contexts too.
    pub fn set_eval_allowed(&mut self, value: bool) {
        self.state.update_flags(|flags| flags.eval_allowed = value);

        let scope = pin!(v8::HandleScope::new(&mut *self.isolate));
        let mut scope = scope.init();
        self.state.apply_eval_policy(&mut scope);
    }

    flag_accessors! {
        jspi_enabled / set_jspi_enabled,
        capture_throws_as_rejections / set_capture_throws_as_rejections,
        node_js_compat / set_node_js_compat,
        node_js_process_v2 / set_node_js_process_v2,
        set_to_string_tag / set_set_to_string_tag,
        allow_top_level_await / set_allow_top_level_await,
        using_new_module_registry / set_using_new_module_registry,
        throw_on_unrecognized_import_assertion / set_throw_on_unrecognized_import_assertion,
    }

    pub fn set_logger(&mut self, logger: Option<Logger>) {
        self.state.set_logger(logger);
    }

    pub fn set_error_reporter(&mut self, reporter: Option<ErrorReporter>) {
        self.state.set_error_reporter(reporter);
    }

    pub fn set_module_fallback(&mut self, fallback: Option<ModuleFallback>) {
        self.state.set_module_fallback(fallback);
    }

    pub fn are_warnings_logged(&self) -> bool {
        self.state.logger().is_some()
    }

    pub fn are_errors_reported(&self) -> bool {
        self.state.error_reporter().is_some()
    }

    pub fn log_warning(&mut self, ctx: &JsContext, message: &str) {
        self.enter(ctx, |scope, state| state.log_warning(scope, message));
    }

    /// Send `error` to the error reporter.
    pub fn report_error(&mut self, ctx: &JsContext, description: &str, error: &JsValue) {
        self.enter(ctx, |scope, state| {
            let local = error.open(scope);
            let formatted = match from_exception(scope, local) {
                Ok(exception) => exception.to_string(),
                Err(error) => error.to_string(),
            };
            state.report_error(scope, description, local, &formatted);
        });
    }

    /// Ask the module fallback to resolve `specifier`.
    pub fn resolve_module_fallback(
        &mut self,
        ctx: &JsContext,
        specifier: &str,
        referrer: Option<&str>,
        observer: &dyn CompilationObserver,
        method: ResolveMethod,
        attribute: Option<&str>,
    ) -> Option<ModuleFallbackResult> {
        let fallback = self.state.module_fallback()?;

        let result = self.with_scope(ctx, |scope| {
            fallback(scope, specifier, referrer, observer, method, attribute)
        });

        observer.on_module_fallback(specifier, result.is_some());
        result
    }
}

impl<A: ApiTypes> std::fmt::Debug for Lock<'_, A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("isolate_id", &self.base.id())
            .finish()
    }
}

/// Run `f` under a TryCatch and turn a failure into an error.
///
/// Termination is cancelled so the isolate stays usable, and comes back as
/// [`Error::Terminated`]. Exceptions go to the error reporter first.
fn try_catch<R>(
    scope: &mut v8::PinScope<'_, '_>,
    state: &IsolateState,
    f: impl FnOnce(&mut v8::PinScope<'_, '_>) -> Option<R>,
) -> Result<R> {
    let tc = pin!(v8::TryCatch::new(scope));
    let mut tc = tc.init();

    if let Some(result) = f(&mut tc) {
        return Ok(result);
    }

    if tc.has_terminated() || tc.is_execution_terminating() {
        tracing::debug!("Isolate {}: execution terminated", state.id);
        tc.cancel_terminate_execution();
        return Err(Error::Terminated);
    }

    let Some(exception) = tc.exception() else {
        return Err(Error::internal("script failed without an exception"));
    };

    let js = match from_exception(&mut tc, exception) {
        Ok(js) => js,
        Err(Error::Js(thrown)) => thrown,
        Err(error) => return Err(error),
    };
    state.report_error(&mut tc, "Uncaught exception", exception, &js.to_string());

    Err(Error::Js(js))
}
