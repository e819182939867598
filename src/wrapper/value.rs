//! Conversions between Rust values and JavaScript values.

use std::pin::pin;

use crate::error::{Error, Result};
use crate::v8_helpers;
use crate::wrappable::Ref;
use crate::wrapper::Resource;
use crate::wrapper::exception::from_exception;

/// Rust → JavaScript.
pub trait ToJs {
    fn to_js<'s>(self, scope: &mut v8::PinScope<'s, '_>) -> Result<v8::Local<'s, v8::Value>>;
}

/// JavaScript → Rust.
pub trait FromJs: Sized {
    fn from_js(scope: &mut v8::PinScope<'_, '_>, value: v8::Local<'_, v8::Value>) -> Result<Self>;
}

/// Allocate a JS string.
pub fn js_string<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    text: &str,
) -> Result<v8::Local<'s, v8::String>> {
    v8::String::new(scope, text).ok_or_else(|| Error::range_error("string too long"))
}

/// Convert argument `index` of a native callback.
pub fn arg<T: FromJs>(
    scope: &mut v8::PinScope<'_, '_>,
    args: &v8::FunctionCallbackArguments<'_>,
    index: i32,
) -> Result<T> {
    T::from_js(scope, args.get(index))
}

/// Run a coercion that may call into script (`toString`, `valueOf`, getters).
///
/// A thrown exception comes back as `Error::Js` and is not left pending.
pub(crate) fn coerce<R>(
    scope: &mut v8::PinScope<'_, '_>,
    expected: &str,
    f: impl FnOnce(&mut v8::PinScope<'_, '_>) -> Option<R>,
) -> Result<R> {
    let tc = pin!(v8::TryCatch::new(scope));
    let mut tc = tc.init();

    if let Some(result) = f(&mut tc) {
        return Ok(result);
    }

    if tc.has_terminated() {
        return Err(Error::Terminated);
    }

    match tc.exception() {
        Some(exception) => Err(Error::Js(from_exception(&mut tc, exception)?)),
        None => Err(Error::type_error(format!("Expected {expected}"))),
    }
}

fn reject_symbol(value: v8::Local<'_, v8::Value>, target: &str) -> Result<()> {
    if value.is_symbol() {
        return Err(Error::type_error(format!(
            "Cannot convert a Symbol value to a {target}"
        )));
    }
    Ok(())
}

impl ToJs for () {
    fn to_js<'s>(self, scope: &mut v8::PinScope<'s, '_>) -> Result<v8::Local<'s, v8::Value>> {
        Ok(v8::undefined(scope).into())
    }
}

impl FromJs for () {
    fn from_js(_scope: &mut v8::PinScope<'_, '_>, _value: v8::Local<'_, v8::Value>) -> Result<Self> {
        Ok(())
    }
}

impl ToJs for bool {
    fn to_js<'s>(self, scope: &mut v8::PinScope<'s, '_>) -> Result<v8::Local<'s, v8::Value>> {
        Ok(v8::Boolean::new(scope, self).into())
    }
}

impl FromJs for bool {
    fn from_js(scope: &mut v8::PinScope<'_, '_>, value: v8::Local<'_, v8::Value>) -> Result<Self> {
        Ok(value.boolean_value(scope))
    }
}

impl ToJs for i32 {
    fn to_js<'s>(self, scope: &mut v8::PinScope<'s, '_>) -> Result<v8::Local<'s, v8::Value>> {
        Ok(v8::Integer::new(scope, self).into())
    }
}

impl FromJs for i32 {
    fn from_js(scope: &mut v8::PinScope<'_, '_>, value: v8::Local<'_, v8::Value>) -> Result<Self> {
        reject_symbol(value, "number")?;
        coerce(scope, "a number", |scope| value.int32_value(scope))
    }
}

impl ToJs for u32 {
    fn to_js<'s>(self, scope: &mut v8::PinScope<'s, '_>) -> Result<v8::Local<'s, v8::Value>> {
        Ok(v8::Integer::new_from_unsigned(scope, self).into())
    }
}

impl FromJs for u32 {
    fn from_js(scope: &mut v8::PinScope<'_, '_>, value: v8::Local<'_, v8::Value>) -> Result<Self> {
        reject_symbol(value, "number")?;
        coerce(scope, "a number", |scope| value.uint32_value(scope))
    }
}

impl ToJs for i64 {
    fn to_js<'s>(self, scope: &mut v8::PinScope<'s, '_>) -> Result<v8::Local<'s, v8::Value>> {
        Ok(v8::Number::new(scope, self as f64).into())
    }
}

impl FromJs for i64 {
    fn from_js(scope: &mut v8::PinScope<'_, '_>, value: v8::Local<'_, v8::Value>) -> Result<Self> {
        reject_symbol(value, "number")?;
        coerce(scope, "a number", |scope| value.integer_value(scope))
    }
}

impl ToJs for f64 {
    fn to_js<'s>(self, scope: &mut v8::PinScope<'s, '_>) -> Result<v8::Local<'s, v8::Value>> {
        Ok(v8::Number::new(scope, self).into())
    }
}

impl FromJs for f64 {
    fn from_js(scope: &mut v8::PinScope<'_, '_>, value: v8::Local<'_, v8::Value>) -> Result<Self> {
        reject_symbol(value, "number")?;
        coerce(scope, "a number", |scope| value.number_value(scope))
    }
}

impl ToJs for String {
    fn to_js<'s>(self, scope: &mut v8::PinScope<'s, '_>) -> Result<v8::Local<'s, v8::Value>> {
        Ok(js_string(scope, &self)?.into())
    }
}

impl ToJs for &str {
    fn to_js<'s>(self, scope: &mut v8::PinScope<'s, '_>) -> Result<v8::Local<'s, v8::Value>> {
        Ok(js_string(scope, self)?.into())
    }
}

impl FromJs for String {
    fn from_js(scope: &mut v8::PinScope<'_, '_>, value: v8::Local<'_, v8::Value>) -> Result<Self> {
        reject_symbol(value, "string")?;
        coerce(scope, "a string", |scope| {
            value.to_string(scope).map(|s| s.to_rust_string_lossy(scope))
        })
    }
}

impl<T: ToJs> ToJs for Option<T> {
    fn to_js<'s>(self, scope: &mut v8::PinScope<'s, '_>) -> Result<v8::Local<'s, v8::Value>> {
        match self {
            Some(value) => value.to_js(scope),
            None => Ok(v8::null(scope).into()),
        }
    }
}

impl<T: FromJs> FromJs for Option<T> {
    fn from_js(scope: &mut v8::PinScope<'_, '_>, value: v8::Local<'_, v8::Value>) -> Result<Self> {
        if value.is_null_or_undefined() {
            return Ok(None);
        }
        T::from_js(scope, value).map(Some)
    }
}

impl<T: ToJs> ToJs for Vec<T> {
    fn to_js<'s>(self, scope: &mut v8::PinScope<'s, '_>) -> Result<v8::Local<'s, v8::Value>> {
        let elements = self
            .into_iter()
            .map(|item| item.to_js(scope))
            .collect::<Result<Vec<_>>>()?;

        Ok(v8::Array::new_with_elements(scope, &elements).into())
    }
}

impl<T: FromJs> FromJs for Vec<T> {
    fn from_js(scope: &mut v8::PinScope<'_, '_>, value: v8::Local<'_, v8::Value>) -> Result<Self> {
        let array: v8::Local<v8::Array> = value
            .try_into()
            .map_err(|_| Error::type_error("Expected an array"))?;

        (0..array.length())
            .map(|i| {
                let item = array
                    .get_index(scope, i)
                    .ok_or_else(|| Error::type_error(format!("Failed to read array element {i}")))?;
                T::from_js(scope, item)
            })
            .collect()
    }
}

/// Bytes become a `Uint8Array`. Any `ArrayBuffer` or view converts back.
impl ToJs for bytes::Bytes {
    fn to_js<'s>(self, scope: &mut v8::PinScope<'s, '_>) -> Result<v8::Local<'s, v8::Value>> {
        v8_helpers::new_uint8_array(scope, &self)
            .map(Into::into)
            .ok_or_else(|| Error::range_error("Failed to create Uint8Array"))
    }
}

impl FromJs for bytes::Bytes {
    fn from_js(_scope: &mut v8::PinScope<'_, '_>, value: v8::Local<'_, v8::Value>) -> Result<Self> {
        if let Ok(view) = v8::Local::<v8::ArrayBufferView>::try_from(value) {
            return Ok(v8_helpers::view_bytes(view));
        }

        if let Ok(buffer) = v8::Local::<v8::ArrayBuffer>::try_from(value) {
            return Ok(v8_helpers::array_buffer_bytes(buffer));
        }

        Err(Error::type_error("Expected an ArrayBuffer or ArrayBufferView"))
    }
}

/// JSON-compatible values, via `JSON.parse` / `JSON.stringify`.
impl ToJs for serde_json::Value {
    fn to_js<'s>(self, scope: &mut v8::PinScope<'s, '_>) -> Result<v8::Local<'s, v8::Value>> {
        let text = serde_json::to_string(&self).map_err(|e| Error::internal(e.to_string()))?;
        let text = js_string(scope, &text)?;

        v8::json::parse(scope, text).ok_or_else(|| Error::type_error("Invalid JSON value"))
    }
}

impl FromJs for serde_json::Value {
    fn from_js(scope: &mut v8::PinScope<'_, '_>, value: v8::Local<'_, v8::Value>) -> Result<Self> {
        if value.is_undefined() {
            return Ok(serde_json::Value::Null);
        }

        let text = v8::json::stringify(scope, value)
            .map(|s| s.to_rust_string_lossy(scope))
            .ok_or_else(|| Error::type_error("Value is not JSON-serializable"))?;

        serde_json::from_str(&text)
            .map_err(|_| Error::type_error("Value is not JSON-serializable"))
    }
}

impl<T: Resource> ToJs for Ref<T> {
    fn to_js<'s>(self, scope: &mut v8::PinScope<'s, '_>) -> Result<v8::Local<'s, v8::Value>> {
        Ok(self.proxy(scope)?.into())
    }
}

impl<T: Resource> ToJs for &Ref<T> {
    fn to_js<'s>(self, scope: &mut v8::PinScope<'s, '_>) -> Result<v8::Local<'s, v8::Value>> {
        Ok(self.proxy(scope)?.into())
    }
}

impl<T: Resource> FromJs for Ref<T> {
    fn from_js(scope: &mut v8::PinScope<'_, '_>, value: v8::Local<'_, v8::Value>) -> Result<Self> {
        let object: v8::Local<v8::Object> = value
            .try_into()
            .map_err(|_| Error::type_error(format!("Expected an instance of {}", T::CLASS_NAME)))?;

        Ref::from_proxy(scope, object)
    }
}

/// Declare a plain-data struct that converts to and from a JS object with
/// the same field names.
///
/// ```ignore
/// js_struct! {
///     #[derive(Debug, PartialEq)]
///     pub struct Options {
///         pub name: String,
///         pub retries: u32,
///     }
/// }
/// ```
#[macro_export]
macro_rules! js_struct {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $($fvis:vis $field:ident : $ty:ty),* $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name {
            $($fvis $field: $ty),*
        }

        impl $crate::ToJs for $name {
            fn to_js<'s>(
                self,
                scope: &mut $crate::v8::PinScope<'s, '_>,
            ) -> $crate::Result<$crate::v8::Local<'s, $crate::v8::Value>> {
                let object = $crate::v8::Object::new(scope);
                $(
                    let key = $crate::wrapper::js_string(scope, stringify!($field))?;
                    let value = $crate::ToJs::to_js(self.$field, scope)?;
                    object.set(scope, key.into(), value);
                )*
                Ok(object.into())
            }
        }

        impl $crate::FromJs for $name {
            fn from_js(
                scope: &mut $crate::v8::PinScope<'_, '_>,
                value: $crate::v8::Local<'_, $crate::v8::Value>,
            ) -> $crate::Result<Self> {
                let object: $crate::v8::Local<$crate::v8::Object> = value.try_into().map_err(|_| {
                    $crate::Error::type_error(concat!("Expected an object for ", stringify!($name)))
                })?;
                $(
                    let key = $crate::wrapper::js_string(scope, stringify!($field))?;
                    let field = object
                        .get(scope, key.into())
                        .unwrap_or_else(|| $crate::v8::undefined(scope).into());
                    let $field = <$ty as $crate::FromJs>::from_js(scope, field)?;
                )*
                Ok(Self { $($field),* })
            }
        }
    };
}
