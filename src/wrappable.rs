//! Native objects exposed to JavaScript.
//!
//! A resource value lives in an `Arc<Wrappable<T>>`. Its JS proxy stores a raw
//! pointer to the wrappable in internal field 0, and the wrappable keeps a weak
//! handle back to the proxy. Native strong references are counted separately
//! from the `Arc`:
//!
//! ```text
//!   Ref<T> (native)  ──count──►  Wrappable<T>  ◄──Arc── weak finalizer
//!                                    │  ▲
//!              strong Global while   │  │ internal field 0
//!              count > 0             ▼  │
//!                                  JS proxy
//! ```
//!
//! While any `Ref<T>` exists the proxy is held by a strong `v8::Global`, so it
//! cannot be collected. Once the count drops to zero only the weak handle
//! remains. When the collector reclaims the proxy, the finalizer does not free
//! anything: it enqueues the proxy-owned `Arc` on the isolate's destruction
//! queue, and the next lock entry drops it.

use std::any::TypeId;
use std::ffi::c_void;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::gc::{
    DeferredDestructionQueue, DeferredItem, GcTraceable, JsLock, MemoryRetainer, Releasable,
};
use crate::isolate::IsolateState;
use crate::wrapper::Resource;

#[repr(C)]
pub(crate) struct WrappableHeader {
    type_id: TypeId,
    class_name: &'static str,
}

/// Heap cell behind every [`Ref`]. The header must stay the first field: the
/// proxy's internal field is read back as a `*const WrappableHeader` before
/// the concrete type is known.
#[repr(C)]
pub struct Wrappable<T> {
    header: WrappableHeader,
    link: Mutex<ProxyLink>,
    value: T,
}

#[derive(Default)]
struct ProxyLink {
    strong_refs: usize,
    isolate: Option<u64>,
    queue: Option<Arc<DeferredDestructionQueue>>,
    strong: Option<v8::Global<v8::Object>>,
    weak: Option<v8::Weak<v8::Object>>,
}

// SAFETY: the V8 handles are only created, read and dropped by a thread
// holding the owning isolate's lock, or after the isolate was disposed (when
// dropping them is a no-op). The Mutex serializes access to the fields.
unsafe impl Send for ProxyLink {}

impl<T: Resource> Wrappable<T> {
    fn new(value: T) -> Self {
        Self {
            header: WrappableHeader {
                type_id: TypeId::of::<T>(),
                class_name: T::CLASS_NAME,
            },
            link: Mutex::new(ProxyLink {
                strong_refs: 1,
                ..Default::default()
            }),
            value,
        }
    }

    fn link(&self) -> std::sync::MutexGuard<'_, ProxyLink> {
        self.link.lock().expect("wrappable link poisoned")
    }
}

impl<T: Resource> Releasable for Wrappable<T> {
    fn remove_strong_ref(&self) {
        let mut link = self.link();

        // A new native reference may have appeared since the release was queued.
        if link.strong_refs == 0 {
            link.strong = None;
        }
    }
}

impl<T: Resource> MemoryRetainer for Wrappable<T> {
    fn memory_name(&self) -> &'static str {
        self.header.class_name
    }

    fn self_size(&self) -> usize {
        std::mem::size_of::<Self>() + self.value.external_memory_size()
    }
}

/// Native strong reference to a resource.
///
/// Cloning and dropping are allowed on any thread. Dropping the last one
/// releases the proxy's strong handle, immediately when this thread holds the
/// isolate lock and through the destruction queue otherwise.
pub struct Ref<T: Resource>(Arc<Wrappable<T>>);

impl<T: Resource> Ref<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(Wrappable::new(value)))
    }

    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Native strong references, this one included.
    pub fn strong_refs(&self) -> usize {
        self.0.link().strong_refs
    }

    /// Whether a JS proxy has been created for this object.
    pub fn is_wrapped(&self) -> bool {
        self.0.link().weak.is_some()
    }

    pub fn class_name(&self) -> &'static str {
        self.0.header.class_name
    }

    /// The JS proxy, created on first use. A live proxy is always reused.
    pub(crate) fn proxy<'s>(
        &self,
        scope: &mut v8::PinScope<'s, '_>,
    ) -> Result<v8::Local<'s, v8::Object>> {
        {
            let mut link = self.0.link();

            if let Some(object) = link.weak.as_ref().and_then(|weak| weak.to_local(scope)) {
                if link.strong.is_none() && link.strong_refs > 0 {
                    link.strong = Some(v8::Global::new(scope, object));
                }

                return Ok(object);
            }
        }

        let state = IsolateState::current(scope)?;
        let wrapper = state.current_wrapper(scope)?;
        let template = wrapper.template(scope, &state, TypeId::of::<T>(), T::CLASS_NAME)?;

        let object = template
            .instance_template(scope)
            .new_instance(scope)
            .ok_or_else(|| Error::internal(format!("failed to instantiate {}", T::CLASS_NAME)))?;

        self.attach(scope, object, &state);
        Ok(object)
    }

    /// Bind this object to a freshly created proxy.
    pub(crate) fn attach(
        &self,
        scope: &mut v8::PinScope<'_, '_>,
        object: v8::Local<'_, v8::Object>,
        state: &IsolateState,
    ) {
        let external = v8::External::new(scope, Arc::as_ptr(&self.0) as *mut c_void);
        object.set_internal_field(0, external.into());

        let proxy_owned = self.0.clone();
        let finalizer_queue = state.queue.clone();
        let weak = v8::Weak::with_guaranteed_finalizer(
            scope,
            object,
            Box::new(move || {
                finalizer_queue.defer(DeferredItem::release(false, proxy_owned));
            }),
        );

        {
            let mut link = self.0.link();
            link.isolate = Some(state.id);
            link.queue = Some(state.queue.clone());
            link.strong = (link.strong_refs > 0).then(|| v8::Global::new(scope, object));
            link.weak = Some(weak);
        }

        let retainer: Arc<dyn MemoryRetainer + Send + Sync> = self.0.clone();
        state.register_wrappable(Arc::downgrade(&retainer));
    }

    /// Take a native reference to the object behind `object`.
    pub(crate) fn from_proxy(
        scope: &mut v8::PinScope<'_, '_>,
        object: v8::Local<'_, v8::Object>,
    ) -> Result<Self> {
        let Some(ptr) = header_ptr(scope, object) else {
            return Err(Error::type_error(format!(
                "Expected an instance of {}",
                T::CLASS_NAME
            )));
        };

        // SAFETY: internal field 0 of a proxy holds the Arc pointer of a live
        // wrappable; the proxy's finalizer owns a reference until the proxy is
        // collected, and `object` is reachable here.
        let header = unsafe { &*ptr };
        if header.type_id != TypeId::of::<T>() {
            return Err(Error::type_error(format!(
                "Expected an instance of {}, got {}",
                T::CLASS_NAME,
                header.class_name
            )));
        }

        let ptr = ptr as *const Wrappable<T>;
        // SAFETY: the type id matched, and the pointer came from Arc::as_ptr.
        let inner = unsafe {
            Arc::increment_strong_count(ptr);
            Arc::from_raw(ptr)
        };

        {
            let mut link = inner.link();
            link.strong_refs += 1;
            if link.strong.is_none()
                && let Some(proxy) = link.weak.as_ref().and_then(|weak| weak.to_local(scope))
            {
                link.strong = Some(v8::Global::new(scope, proxy));
            }
        }

        Ok(Self(inner))
    }
}

/// Class name of the wrappable behind `object`, if it is a proxy.
pub(crate) fn type_of(
    scope: &mut v8::PinScope<'_, '_>,
    object: v8::Local<'_, v8::Object>,
) -> Option<(TypeId, &'static str)> {
    // SAFETY: see Ref::from_proxy
    header_ptr(scope, object).map(|ptr| unsafe { ((*ptr).type_id, (*ptr).class_name) })
}

fn header_ptr(
    scope: &mut v8::PinScope<'_, '_>,
    object: v8::Local<'_, v8::Object>,
) -> Option<*const WrappableHeader> {
    if let Some(ptr) = field_ptr(scope, object) {
        return Some(ptr);
    }

    // Receivers of global functions are the context's global proxy; the
    // wrapped global object is its prototype.
    let context = scope.get_current_context();
    if !context.global(scope).strict_equals(object.into()) {
        return None;
    }

    let global: v8::Local<v8::Object> = object.get_prototype(scope)?.try_into().ok()?;
    field_ptr(scope, global)
}

fn field_ptr(
    scope: &mut v8::PinScope<'_, '_>,
    object: v8::Local<'_, v8::Object>,
) -> Option<*const WrappableHeader> {
    if object.internal_field_count() < 1 {
        return None;
    }

    let data = object.get_internal_field(scope, 0)?;
    let value: v8::Local<v8::Value> = data.try_into().ok()?;
    let external: v8::Local<v8::External> = value.try_into().ok()?;
    let ptr = external.value() as *const WrappableHeader;

    (!ptr.is_null()).then_some(ptr)
}

impl<T: Resource> std::ops::Deref for Ref<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0.value
    }
}

impl<T: Resource> Clone for Ref<T> {
    fn clone(&self) -> Self {
        self.0.link().strong_refs += 1;
        Self(self.0.clone())
    }
}

impl<T: Resource> From<T> for Ref<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}

impl<T: Resource> Drop for Ref<T> {
    fn drop(&mut self) {
        let mut link = self.0.link();
        link.strong_refs -= 1;

        if link.strong_refs > 0 || link.strong.is_none() {
            return;
        }

        let Some(isolate) = link.isolate else {
            return;
        };

        if JsLock::is_held(isolate) {
            link.strong = None;
            return;
        }

        let queue = link.queue.clone();
        drop(link);

        if let Some(queue) = queue {
            queue.defer(DeferredItem::release(true, self.0.clone()));
        }
    }
}

impl<T: Resource + std::fmt::Debug> std::fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Ref").field(&self.0.value).finish()
    }
}

/// A `v8::Global` that may be dropped on any thread.
///
/// Dropped under its isolate's lock it resets immediately; anywhere else the
/// reset goes through the destruction queue.
pub struct IsolateGlobal<T: 'static> {
    handle: Option<v8::Global<T>>,
    isolate_id: u64,
    queue: Arc<DeferredDestructionQueue>,
}

// SAFETY: the handle is only dereferenced under the isolate lock (`open`
// asserts it) and only reset under the lock or by the destruction queue.
unsafe impl<T: 'static> Send for IsolateGlobal<T> {}

impl<T: 'static> IsolateGlobal<T> {
    pub(crate) fn new(
        handle: v8::Global<T>,
        isolate_id: u64,
        queue: Arc<DeferredDestructionQueue>,
    ) -> Self {
        Self {
            handle: Some(handle),
            isolate_id,
            queue,
        }
    }

    pub fn isolate_id(&self) -> u64 {
        self.isolate_id
    }

    /// Open the handle in `scope`.
    ///
    /// # Panics
    ///
    /// If the innermost lock held by this thread is not the owning isolate's.
    pub fn open<'s>(&self, scope: &mut v8::PinScope<'s, '_>) -> v8::Local<'s, T> {
        assert_eq!(
            JsLock::current(),
            Some(self.isolate_id),
            "handle opened outside its isolate lock"
        );
        v8::Local::new(scope, self.handle())
    }

    pub(crate) fn handle(&self) -> &v8::Global<T> {
        self.handle
            .as_ref()
            .expect("IsolateGlobal handle taken before drop")
    }
}

impl<T: 'static> Drop for IsolateGlobal<T> {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        if JsLock::is_held(self.isolate_id) {
            drop(handle);
        } else {
            self.queue.defer_global(handle);
        }
    }
}

impl<T: 'static> std::fmt::Debug for IsolateGlobal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolateGlobal")
            .field("isolate_id", &self.isolate_id)
            .finish()
    }
}

/// A JavaScript value owned from native code.
pub type JsValue = IsolateGlobal<v8::Value>;

/// A context created by [`Lock::new_context`](crate::Lock::new_context).
#[derive(Debug)]
pub struct JsContext {
    global: IsolateGlobal<v8::Context>,
    wrapper_index: usize,
}

impl JsContext {
    pub(crate) fn new(global: IsolateGlobal<v8::Context>, wrapper_index: usize) -> Self {
        Self {
            global,
            wrapper_index,
        }
    }

    pub fn isolate_id(&self) -> u64 {
        self.global.isolate_id()
    }

    /// Index of the type wrapper this context was created with (0 = default).
    pub fn wrapper_index(&self) -> usize {
        self.wrapper_index
    }

    pub(crate) fn handle(&self) -> &v8::Global<v8::Context> {
        self.global.handle()
    }
}
