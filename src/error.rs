//! Error types shared by the embedding layer.

use serde::{Deserialize, Serialize};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// JavaScript error class of an exception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JsErrorKind {
    Error,
    TypeError,
    RangeError,
    SyntaxError,
    ReferenceError,
    /// Any other `name` (DOMException names, user subclasses). Thrown
    /// primitives have an empty name.
    Other,
}

impl JsErrorKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "Error" => Self::Error,
            "TypeError" => Self::TypeError,
            "RangeError" => Self::RangeError,
            "SyntaxError" => Self::SyntaxError,
            "ReferenceError" => Self::ReferenceError,
            _ => Self::Other,
        }
    }
}

/// An exception that crossed from JavaScript into native code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsException {
    pub kind: JsErrorKind,
    pub name: String,
    pub message: String,
    pub stack: Option<String>,
}

impl JsException {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            kind: JsErrorKind::from_name(&name),
            name,
            message: message.into(),
            stack: None,
        }
    }
}

impl std::fmt::Display for JsException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.name)
        } else if self.name.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{}: {}", self.name, self.message)
        }
    }
}

/// What happens to an error at the native/JavaScript boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Details are logged as a warning; JavaScript only sees "internal error".
    LogWarning,
    /// The error is delivered to JavaScript as-is.
    Propagate,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("unrecognized V8 flags: {}", .0.join(" "))]
    UnrecognizedFlags(Vec<String>),

    #[error("TypeError: {0}")]
    Type(String),

    #[error("RangeError: {0}")]
    Range(String),

    /// A named error such as a DOMException (`name`, `message`).
    #[error("{name}: {message}")]
    Dom { name: String, message: String },

    #[error("{0}")]
    Js(JsException),

    #[error("execution terminated")]
    Terminated,

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn type_error(message: impl Into<String>) -> Self {
        Self::Type(message.into())
    }

    pub fn range_error(message: impl Into<String>) -> Self {
        Self::Range(message.into())
    }

    pub fn dom(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Dom {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Internal(_) | Self::Configuration(_) | Self::UnrecognizedFlags(_) => {
                Disposition::LogWarning
            }
            _ => Disposition::Propagate,
        }
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// The JavaScript exception, if this error came from script.
    pub fn as_js(&self) -> Option<&JsException> {
        match self {
            Self::Js(exception) => Some(exception),
            _ => None,
        }
    }
}

impl From<JsException> for Error {
    fn from(exception: JsException) -> Self {
        Self::Js(exception)
    }
}
