//! Context creation with a native global object.

use std::any::TypeId;
use std::pin::pin;
use std::rc::Rc;

use crate::error::{Error, Result};
use crate::isolate::IsolateState;
use crate::wrappable::Ref;
use crate::wrapper::{ContextTag, Resource, js_string};

/// Create a context whose global object is a `G` instance bound to `global`,
/// tagged with `wrapper_index`.
pub(crate) fn create_context<G: Resource>(
    isolate: &mut v8::Isolate,
    state: &IsolateState,
    wrapper_index: usize,
    global: &Ref<G>,
) -> Result<v8::Global<v8::Context>> {
    if global.is_wrapped() {
        return Err(Error::type_error(format!(
            "{} is already bound to a JavaScript object",
            G::CLASS_NAME
        )));
    }

    let wrapper = state.wrapper(wrapper_index)?;

    let scope = pin!(v8::HandleScope::new(isolate));
    let mut scope = scope.init();

    let template = wrapper.template(&mut scope, state, TypeId::of::<G>(), G::CLASS_NAME)?;
    let global_template = template.instance_template(&scope);

    let context = v8::Context::new(
        &scope,
        v8::ContextOptions {
            global_template: Some(global_template),
            ..Default::default()
        },
    );
    let scope = &mut v8::ContextScope::new(&mut scope, context);

    context.set_slot(Rc::new(ContextTag {
        wrapper: wrapper_index,
    }));
    context.set_allow_generation_from_strings(state.flags().eval_allowed);
    state.register_context(scope, context);

    // `context.global()` is the global proxy; the object built from the
    // template sits behind it as its prototype.
    let proxy = context.global(scope);

    if !state.flags().jspi_enabled {
        hide_jspi(scope, proxy)?;
    }

    let global_object = proxy
        .get_prototype(scope)
        .and_then(|prototype| v8::Local::<v8::Object>::try_from(prototype).ok())
        .ok_or_else(|| Error::internal("context has no global object"))?;

    global.attach(scope, global_object, state);

    tracing::debug!(
        "Isolate {} created context with global {} (wrapper {})",
        state.id,
        G::CLASS_NAME,
        wrapper_index
    );

    Ok(v8::Global::new(scope, context))
}

/// Remove the JS promise integration entry points from `WebAssembly`.
fn hide_jspi(scope: &mut v8::PinScope<'_, '_>, global: v8::Local<'_, v8::Object>) -> Result<()> {
    let key = js_string(scope, "WebAssembly")?;
    let Some(wasm) = global
        .get(scope, key.into())
        .and_then(|value| v8::Local::<v8::Object>::try_from(value).ok())
    else {
        return Ok(());
    };

    for name in ["Suspending", "promising"] {
        let key = js_string(scope, name)?;
        wasm.delete(scope, key.into());
    }

    Ok(())
}
