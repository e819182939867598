//! Type wrapping: how native values, resources and errors cross into
//! JavaScript and back.
//!
//! - [`value`]: `ToJs` / `FromJs` for plain values and `js_struct!`
//! - [`resource`]: native classes and their templates
//! - [`registry`]: `ApiTypes` type sets and the `TypeWrapper` dispatch tables
//! - [`serialize`]: tagged serialization of resources
//! - `exception`: error translation in both directions
//!
//! Every context is tagged with the wrapper it was created with. While an
//! isolate has only its default wrapper, lookup skips the tag entirely.

pub(crate) mod exception;
pub mod registry;
pub mod resource;
pub mod serialize;
pub mod value;

pub use registry::{ApiTypes, TypeRegistry, TypeWrapper};
pub use resource::{Resource, ResourceType, set_method, this};
pub use serialize::{Deserializer, Serializable, Serializer};
pub use value::{FromJs, ToJs, arg, js_string};

/// Context slot naming the wrapper that owns the context.
pub(crate) struct ContextTag {
    pub(crate) wrapper: usize,
}
