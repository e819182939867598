//! Translating errors across the native/JavaScript boundary.

use std::pin::pin;

use crate::error::{Disposition, Error, JsErrorKind, JsException, Result};
use crate::isolate::IsolateState;
use crate::wrapper::js_string;

/// Message JavaScript sees for errors whose details stay native.
const INTERNAL_ERROR: &str = "internal error";

impl Error {
    /// Throw this error into JavaScript.
    pub fn throw(self, scope: &mut v8::PinScope<'_, '_>) {
        let exception = to_exception(scope, &self);
        scope.throw_exception(exception);
    }
}

/// Build the JavaScript exception for a native error.
///
/// Internal errors are logged as warnings and surface as an opaque
/// `Error: internal error`.
pub(crate) fn to_exception<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    error: &Error,
) -> v8::Local<'s, v8::Value> {
    if error.disposition() == Disposition::LogWarning {
        if let Ok(state) = IsolateState::current(scope) {
            state.log_warning(scope, &error.to_string());
        } else {
            tracing::warn!("{}", error);
        }

        return new_error(scope, JsErrorKind::Error, None, INTERNAL_ERROR);
    }

    match error {
        Error::Type(message) => new_error(scope, JsErrorKind::TypeError, None, message),
        Error::Range(message) => new_error(scope, JsErrorKind::RangeError, None, message),
        Error::Dom { name, message } => new_error(scope, JsErrorKind::Other, Some(name), message),
        Error::Js(exception) => {
            let name = (exception.kind == JsErrorKind::Other).then_some(exception.name.as_str());
            new_error(scope, exception.kind, name, &exception.message)
        }
        other => new_error(scope, JsErrorKind::Error, None, &other.to_string()),
    }
}

fn new_error<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    kind: JsErrorKind,
    name: Option<&str>,
    message: &str,
) -> v8::Local<'s, v8::Value> {
    let Ok(text) = js_string(scope, message) else {
        return v8::undefined(scope).into();
    };

    let error = match kind {
        JsErrorKind::TypeError => v8::Exception::type_error(scope, text),
        JsErrorKind::RangeError => v8::Exception::range_error(scope, text),
        JsErrorKind::SyntaxError => v8::Exception::syntax_error(scope, text),
        JsErrorKind::ReferenceError => v8::Exception::reference_error(scope, text),
        JsErrorKind::Error | JsErrorKind::Other => v8::Exception::error(scope, text),
    };

    if let Some(name) = name.filter(|name| !name.is_empty())
        && let Ok(object) = v8::Local::<v8::Object>::try_from(error)
        && let (Ok(key), Ok(value)) = (js_string(scope, "name"), js_string(scope, name))
    {
        object.set(scope, key.into(), value.into());
    }

    error
}

/// Read `object[name]` as a string, or `None` when it is null or undefined.
///
/// A getter or `toString` that throws fails the read with the thrown value,
/// described without running more script.
fn string_property(
    scope: &mut v8::PinScope<'_, '_>,
    object: v8::Local<'_, v8::Object>,
    name: &str,
) -> Result<Option<String>> {
    let key = js_string(scope, name)?;

    let tc = pin!(v8::TryCatch::new(scope));
    let mut tc = tc.init();

    let read = object.get(&tc, key.into()).and_then(|value| {
        if value.is_null_or_undefined() {
            return Some(None);
        }
        value
            .to_string(&tc)
            .map(|s| Some(s.to_rust_string_lossy(&tc)))
    });

    if let Some(text) = read {
        return Ok(text);
    }

    if tc.has_terminated() {
        return Err(Error::Terminated);
    }

    match tc.exception() {
        Some(thrown) => Err(Error::Js(detail(&mut tc, thrown))),
        None => Err(Error::type_error(format!("Expected a string for '{name}'"))),
    }
}

/// A thrown value described with V8's side-effect-free formatting.
fn detail(scope: &mut v8::PinScope<'_, '_>, value: v8::Local<'_, v8::Value>) -> JsException {
    let message = value
        .to_detail_string(scope)
        .map(|s| s.to_rust_string_lossy(scope))
        .unwrap_or_default();

    JsException {
        kind: JsErrorKind::Other,
        name: String::new(),
        message,
        stack: None,
    }
}

/// Read a thrown value back into native form.
///
/// Objects contribute `name`, `message` and `stack`; a getter that throws
/// fails the read with what it threw. Anything else is described without
/// running script and gets an empty name.
pub(crate) fn from_exception(
    scope: &mut v8::PinScope<'_, '_>,
    value: v8::Local<'_, v8::Value>,
) -> Result<JsException> {
    let Ok(object) = v8::Local::<v8::Object>::try_from(value) else {
        return Ok(detail(scope, value));
    };

    let name = string_property(scope, object, "name")?.unwrap_or_else(|| "Error".to_string());
    let message = string_property(scope, object, "message")?.unwrap_or_default();
    let stack = string_property(scope, object, "stack")?;

    Ok(JsException {
        kind: JsErrorKind::from_name(&name),
        name,
        message,
        stack,
    })
}
