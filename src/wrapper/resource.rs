//! Native classes exposed to JavaScript.

use std::any::TypeId;

use crate::config::IsolateFlags;
use crate::error::{Error, Result};
use crate::gc::GcTraceable;
use crate::isolate::IsolateState;
use crate::wrappable::Ref;

/// A native type with a JavaScript class.
///
/// ```ignore
/// #[derive(GcTraceable)]
/// struct Point { x: f64, y: f64 }
///
/// impl Resource for Point {
///     const CLASS_NAME: &'static str = "Point";
///
///     fn construct(scope: &mut v8::PinScope, args: &v8::FunctionCallbackArguments) -> Result<Self> {
///         Ok(Point { x: arg(scope, args, 0)?, y: arg(scope, args, 1)? })
///     }
/// }
/// ```
pub trait Resource: GcTraceable + Send + Sync + Sized + 'static {
    const CLASS_NAME: &'static str;

    /// Class this one inherits from in JavaScript. The parent must be
    /// registered in the same type set.
    fn parent() -> Option<ResourceType> {
        None
    }

    /// Add methods and properties to the class template.
    fn configure<'s>(
        _scope: &mut v8::PinScope<'s, '_, ()>,
        _template: v8::Local<'s, v8::FunctionTemplate>,
    ) {
    }

    /// Called for `new ClassName(...)` from JavaScript.
    fn construct(
        _scope: &mut v8::PinScope<'_, '_>,
        _args: &v8::FunctionCallbackArguments<'_>,
    ) -> Result<Self> {
        Err(Error::type_error("Illegal constructor"))
    }
}

/// Identity of a resource type, without the type itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceType {
    pub type_id: TypeId,
    pub class_name: &'static str,
}

impl ResourceType {
    pub fn of<T: Resource>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            class_name: T::CLASS_NAME,
        }
    }
}

/// The receiver of a method callback, as a native reference.
pub fn this<T: Resource>(
    scope: &mut v8::PinScope<'_, '_>,
    args: &v8::FunctionCallbackArguments<'_>,
) -> Result<Ref<T>> {
    Ref::from_proxy(scope, args.this())
}

/// Class template for `T`: constructor callback, one internal field for the
/// wrappable pointer, and whatever `T::configure` adds.
pub(crate) fn build_template<'s, T: Resource>(
    scope: &mut v8::PinScope<'s, '_, ()>,
    flags: &IsolateFlags,
) -> v8::Local<'s, v8::FunctionTemplate> {
    let template = v8::FunctionTemplate::new(scope, construct_callback::<T>);
    template.read_only_prototype();

    if let Some(name) = v8::String::new(scope, T::CLASS_NAME) {
        template.set_class_name(name);

        if flags.set_to_string_tag {
            let tag = v8::Symbol::get_to_string_tag(scope);
            template.prototype_template(scope).set_with_attr(
                tag.into(),
                name.into(),
                v8::PropertyAttribute::READ_ONLY | v8::PropertyAttribute::DONT_ENUM,
            );
        }
    }

    template.instance_template(scope).set_internal_field_count(1);
    T::configure(scope, template);

    template
}

fn construct_callback<T: Resource>(
    scope: &mut v8::PinScope,
    args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    if args.new_target().is_undefined() {
        Error::type_error(format!(
            "Class constructor {} cannot be invoked without 'new'",
            T::CLASS_NAME
        ))
        .throw(scope);
        return;
    }

    let state = match IsolateState::current(scope) {
        Ok(state) => state,
        Err(e) => return e.throw(scope),
    };

    match T::construct(scope, &args) {
        Ok(value) => {
            let this = args.this();
            Ref::new(value).attach(scope, this, &state);
            rv.set(this.into());
        }
        Err(e) => e.throw(scope),
    }
}

/// Install `callback` as method `name` on the class prototype.
pub fn set_method<'s>(
    scope: &mut v8::PinScope<'s, '_, ()>,
    template: v8::Local<'s, v8::FunctionTemplate>,
    name: &str,
    callback: impl v8::MapFnTo<v8::FunctionCallback>,
) {
    let method = v8::FunctionTemplate::new(scope, callback);

    if let Some(key) = v8::String::new(scope, name) {
        template
            .prototype_template(scope)
            .set(key.into(), method.into());
    }
}
