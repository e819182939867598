//! Type sets and the per-wrapper dispatch tables.

use std::any::{Any, TypeId};
use std::cell::RefCell;
use std::collections::HashMap;

use crate::config::IsolateFlags;
use crate::error::{Error, Result};
use crate::isolate::IsolateState;
use crate::wrappable::Ref;
use crate::wrapper::resource::build_template;
use crate::wrapper::{Deserializer, FromJs, Resource, ResourceType, Serializable, Serializer, ToJs};

type TemplateBuilder = for<'s, 'i> fn(
    &mut v8::PinScope<'s, 'i, ()>,
    &IsolateFlags,
) -> v8::Local<'s, v8::FunctionTemplate>;

type SerializeFn =
    fn(&mut v8::PinScope<'_, '_>, v8::Local<'_, v8::Value>, &mut Serializer) -> Result<()>;

type DeserializeFn = for<'s, 'i> fn(
    &mut v8::PinScope<'s, 'i>,
    &mut Deserializer,
) -> Result<v8::Local<'s, v8::Value>>;

struct ResourceEntry {
    class_name: &'static str,
    parent: Option<ResourceType>,
    build: TemplateBuilder,
}

pub(crate) struct SerializerEntry {
    pub(crate) tag: u32,
    pub(crate) serialize: SerializeFn,
}

/// The types one wrapper knows about. Built once, then read-only.
#[derive(Default)]
pub struct TypeRegistry {
    resources: HashMap<TypeId, ResourceEntry>,
    serializers: HashMap<TypeId, SerializerEntry>,
    deserializers: HashMap<u32, (TypeId, DeserializeFn)>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resource<T: Resource>(&mut self) -> &mut Self {
        self.resources.insert(
            TypeId::of::<T>(),
            ResourceEntry {
                class_name: T::CLASS_NAME,
                parent: T::parent(),
                build: build_template::<T>,
            },
        );
        self
    }

    /// Register `T` as a resource with a serialization tag.
    ///
    /// # Panics
    ///
    /// If another type already uses `T::TAG`.
    pub fn serializable<T: Serializable>(&mut self) -> &mut Self {
        if let Some((owner, _)) = self.deserializers.get(&T::TAG)
            && *owner != TypeId::of::<T>()
        {
            panic!(
                "serialization tag {} of {} is already registered",
                T::TAG,
                T::CLASS_NAME
            );
        }

        self.resource::<T>();
        self.serializers.insert(
            TypeId::of::<T>(),
            SerializerEntry {
                tag: T::TAG,
                serialize: serialize_entry::<T>,
            },
        );
        self.deserializers
            .insert(T::TAG, (TypeId::of::<T>(), deserialize_entry::<T>));
        self
    }

    pub fn contains<T: 'static>(&self) -> bool {
        self.resources.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub(crate) fn serializer(&self, type_id: TypeId) -> Option<&SerializerEntry> {
        self.serializers.get(&type_id)
    }

    pub(crate) fn deserializer(&self, tag: u32) -> Option<DeserializeFn> {
        self.deserializers.get(&tag).map(|(_, deserialize)| *deserialize)
    }
}

fn serialize_entry<T: Serializable>(
    scope: &mut v8::PinScope<'_, '_>,
    value: v8::Local<'_, v8::Value>,
    serializer: &mut Serializer,
) -> Result<()> {
    let resource = Ref::<T>::from_js(scope, value)?;
    resource.serialize(serializer)
}

fn deserialize_entry<'s, T: Serializable>(
    scope: &mut v8::PinScope<'s, '_>,
    deserializer: &mut Deserializer,
) -> Result<v8::Local<'s, v8::Value>> {
    Ref::new(T::deserialize(deserializer)?).to_js(scope)
}

/// The set of native types an embedding exposes.
pub trait ApiTypes: 'static {
    /// Per-wrapper settings, e.g. compatibility flags that gate types.
    type Configuration: Clone + Send + Sync + 'static;

    fn register(registry: &mut TypeRegistry, configuration: &Self::Configuration);
}

/// Declare an [`ApiTypes`] set with no configuration.
///
/// ```ignore
/// declare_api_types! {
///     pub struct WebApi {
///         resources: [Headers, Blob],
///         serializable: [Blob],
///     }
/// }
/// ```
#[macro_export]
macro_rules! declare_api_types {
    (
        $vis:vis struct $name:ident {
            resources: [$($resource:ty),* $(,)?]
            $(, serializable: [$($serializable:ty),* $(,)?])?
            $(,)?
        }
    ) => {
        $vis struct $name;

        impl $crate::ApiTypes for $name {
            type Configuration = ();

            fn register(registry: &mut $crate::TypeRegistry, _configuration: &()) {
                $(registry.resource::<$resource>();)*
                $($(registry.serializable::<$serializable>();)*)?
            }
        }
    };
}

/// One instantiation of a type set: registry, configuration and the class
/// templates created from them.
///
/// Index 0 is the isolate's default wrapper. Others are appended by
/// `Lock::new_context_with_configuration` and live until the isolate does.
pub struct TypeWrapper {
    index: usize,
    configuration: Box<dyn Any>,
    registry: TypeRegistry,
    templates: RefCell<HashMap<TypeId, v8::Global<v8::FunctionTemplate>>>,
}

impl TypeWrapper {
    pub(crate) fn new<A: ApiTypes>(index: usize, configuration: A::Configuration) -> Self {
        let mut registry = TypeRegistry::new();
        A::register(&mut registry, &configuration);

        tracing::debug!(
            "Type wrapper {} registered {} resource types",
            index,
            registry.len()
        );

        Self {
            index,
            configuration: Box::new(configuration),
            registry,
            templates: RefCell::new(HashMap::new()),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn configuration<C: 'static>(&self) -> Option<&C> {
        self.configuration.downcast_ref()
    }

    /// Class template for a registered type, built on first use.
    pub(crate) fn template<'s>(
        &self,
        scope: &mut v8::PinScope<'s, '_, ()>,
        state: &IsolateState,
        type_id: TypeId,
        class_name: &str,
    ) -> Result<v8::Local<'s, v8::FunctionTemplate>> {
        if let Some(cached) = self.templates.borrow().get(&type_id) {
            return Ok(v8::Local::new(scope, cached));
        }

        let Some(entry) = self.registry.resources.get(&type_id) else {
            return Err(Error::type_error(format!(
                "{class_name} is not a registered type in this context"
            )));
        };

        let template = (entry.build)(scope, &state.flags());

        if let Some(parent) = entry.parent {
            let parent = self.template(scope, state, parent.type_id, parent.class_name)?;
            template.inherit(parent);
        }

        tracing::trace!(
            "Built template for {} in wrapper {}",
            entry.class_name,
            self.index
        );

        self.templates
            .borrow_mut()
            .insert(type_id, v8::Global::new(scope, template));

        Ok(template)
    }

    /// Drop cached templates. Called under the lock during teardown.
    pub(crate) fn clear_templates(&self) {
        self.templates.borrow_mut().clear();
    }
}

impl std::fmt::Debug for TypeWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeWrapper")
            .field("index", &self.index)
            .field("resources", &self.registry.len())
            .field("templates", &self.templates.borrow().len())
            .finish()
    }
}
