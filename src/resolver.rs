//! Maps a [`CanonicalEvent`] to a local, application-defined event type.
//!
//! Local event types are registered by name in a [`TypeRegistry`]; the
//! name looked up for each inbound event is computed by a [`NamingStrategy`].
//! An event whose name is unknown, or known but not [`Receivable`], is not
//! an error: the [`Resolver`] simply returns `None` and the event
//! goes through the name-keyed path of the [`EventBus`](crate::EventBus).
//!
//! ## Instantiation
//!
//! A [`Receivable`] type is instantiated by default-construction followed by
//! field-by-field assignment: the type's [`Default`] value is serialized into
//! a JSON object, every field listed by [`Receivable::field_names`] and
//! present in the event payload with a non-null value is overwritten with
//! the payload value, and the object is deserialized back.
//! Payload keys that are not fields of the type are ignored, and fields
//! missing from the payload keep their default value.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::record::{CanonicalEvent, RawEventRecord};

/// Namespace used by [`NamingStrategy::default`].
pub const DEFAULT_NAMESPACE: &str = "App\\Events";

/// Separator between namespace and event type in [`NamingStrategy::Namespace`].
pub const NAMESPACE_SEPARATOR: char = '\\';

/// Error types returned by the [`Resolver`].
///
/// Unknown or non-receivable types are never reported as errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned when the payload is not valid JSON.
    #[error("failed to parse payload of `{type_name}`: {source}")]
    Payload {
        /// Name of the local event type being resolved.
        type_name: String,
        /// Parsing error.
        #[source]
        source: serde_json::Error,
    },

    /// Error returned when the payload is valid JSON but not an object.
    #[error("payload of `{type_name}` must be a JSON object, found: {found}")]
    MalformedPayload {
        /// Name of the local event type being resolved.
        type_name: String,
        /// Compact rendering of the offending payload.
        found: String,
    },

    /// Error returned when the payload values do not fit the local type.
    #[error("failed to instantiate `{type_name}` from payload: {source}")]
    Instantiate {
        /// Name of the local event type being resolved.
        type_name: String,
        /// Serialization error.
        #[source]
        source: serde_json::Error,
    },
}

/// An application event type that can be built out of an inbound event.
///
/// The public field set of the type is its serialized form: implementors are
/// expected to serialize as a JSON object with one entry per field.
/// The original record is attached through [`set_event_record`] after
/// instantiation, so that handlers can inspect the stream, position and
/// metadata of the event they are handling.
///
/// [`set_event_record`]: Receivable::set_event_record
pub trait Receivable:
    Default + Serialize + DeserializeOwned + Debug + Send + Sync + 'static
{
    /// Attaches the record this event has been built from.
    fn set_event_record(&mut self, record: Arc<RawEventRecord>);

    /// Returns the record this event has been built from, if attached.
    fn event_record(&self) -> Option<&RawEventRecord>;

    /// Lists the names of the fields assignable from an event payload.
    ///
    /// Defaults to every key of the serialized [`Default`] value; fields left
    /// out of the list keep their default value on instantiation.
    fn field_names() -> Vec<String> {
        match serde_json::to_value(Self::default()) {
            Ok(Value::Object(fields)) => fields.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }
}

/// Object-safe view over a resolved [`Receivable`] event.
pub trait LocalEvent: Debug + Send + Sync {
    /// Returns the event as [`Any`], used for type-keyed dispatch.
    fn as_any(&self) -> &dyn Any;

    /// Returns the record this event has been built from, if attached.
    fn raw_record(&self) -> Option<&RawEventRecord>;

    /// Returns the Rust type name of the event.
    fn type_name(&self) -> &'static str;
}

impl<T> LocalEvent for T
where
    T: Receivable,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn raw_record(&self) -> Option<&RawEventRecord> {
        Receivable::event_record(self)
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

type Factory =
    Box<dyn Fn(&str, &Value, Arc<RawEventRecord>) -> Result<Box<dyn LocalEvent>, Error> + Send + Sync>;

enum Entry {
    Receivable(Factory),
    Declared,
}

/// Static registry of local event types, keyed by their fully-qualified name.
#[derive(Default)]
pub struct TypeRegistry {
    entries: HashMap<String, Entry>,
}

impl TypeRegistry {
    /// Registers `T` as the local event type for the specified name.
    #[must_use]
    pub fn register<T>(mut self, name: impl Into<String>) -> Self
    where
        T: Receivable,
    {
        let factory: Factory = Box::new(
            |type_name: &str,
             payload: &Value,
             record: Arc<RawEventRecord>|
             -> Result<Box<dyn LocalEvent>, Error> {
                let mut event = instantiate::<T>(type_name, payload)?;
                event.set_event_record(record);
                Ok(Box::new(event))
            },
        );

        self.entries.insert(name.into(), Entry::Receivable(factory));
        self
    }

    /// Declares a name as known to the application, without being receivable.
    ///
    /// Events resolving to a declared name are handled as unresolved.
    #[must_use]
    pub fn declare(mut self, name: impl Into<String>) -> Self {
        self.entries.insert(name.into(), Entry::Declared);
        self
    }
}

impl Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

/// Computes the local type name an inbound event should resolve to.
#[derive(Clone)]
pub enum NamingStrategy {
    /// Prefixes the event type with the namespace, joined by
    /// [`NAMESPACE_SEPARATOR`]. An empty namespace leaves the type as is.
    Namespace(String),

    /// Uses the returned value as the fully-qualified type name.
    Mapping(Arc<dyn Fn(&CanonicalEvent) -> String + Send + Sync>),
}

impl NamingStrategy {
    /// Creates a [`NamingStrategy::Mapping`] out of the specified function.
    pub fn mapping<F>(f: F) -> Self
    where
        F: Fn(&CanonicalEvent) -> String + Send + Sync + 'static,
    {
        Self::Mapping(Arc::new(f))
    }

    /// Returns the local type name for the specified event.
    pub fn type_name(&self, event: &CanonicalEvent) -> String {
        match self {
            Self::Namespace(namespace) if namespace.is_empty() => event.event_type().to_owned(),
            Self::Namespace(namespace) => {
                format!("{}{}{}", namespace, NAMESPACE_SEPARATOR, event.event_type())
            }
            Self::Mapping(f) => f(event),
        }
    }
}

impl Default for NamingStrategy {
    fn default() -> Self {
        Self::Namespace(DEFAULT_NAMESPACE.to_owned())
    }
}

impl Debug for NamingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Namespace(namespace) => f.debug_tuple("Namespace").field(namespace).finish(),
            Self::Mapping(_) => f.write_str("Mapping(..)"),
        }
    }
}

/// Resolves inbound events to registered local event types.
#[derive(Debug, Default)]
pub struct Resolver {
    registry: TypeRegistry,
    naming: NamingStrategy,
}

impl Resolver {
    /// Creates a new resolver over the specified registry and naming strategy.
    pub fn new(registry: TypeRegistry, naming: NamingStrategy) -> Self {
        Self { registry, naming }
    }

    /// Builds the local event for the specified inbound event, attaching
    /// `record` to it.
    ///
    /// Returns `Ok(None)` when no receivable type is registered under the
    /// computed name.
    pub fn resolve(
        &self,
        event: &CanonicalEvent,
        record: &Arc<RawEventRecord>,
    ) -> Result<Option<Box<dyn LocalEvent>>, Error> {
        let type_name = self.naming.type_name(event);

        let factory = match self.registry.entries.get(&type_name) {
            Some(Entry::Receivable(factory)) => factory,
            Some(Entry::Declared) => {
                tracing::trace!(%type_name, "Local event type is not receivable");
                return Ok(None);
            }
            None => {
                tracing::trace!(%type_name, "No local event type registered");
                return Ok(None);
            }
        };

        let payload = event.data_value().map_err(|source| Error::Payload {
            type_name: type_name.clone(),
            source,
        })?;

        factory(&type_name, &payload, Arc::clone(record)).map(Some)
    }
}

fn instantiate<T>(type_name: &str, payload: &Value) -> Result<T, Error>
where
    T: Receivable,
{
    let fields = payload.as_object().ok_or_else(|| Error::MalformedPayload {
        type_name: type_name.to_owned(),
        found: payload.to_string(),
    })?;

    let into_error = |source| Error::Instantiate {
        type_name: type_name.to_owned(),
        source,
    };

    let mut value = serde_json::to_value(T::default()).map_err(into_error)?;

    if let Value::Object(ref mut object) = value {
        for name in T::field_names() {
            // Null payload values leave the default in place.
            if let Some(assigned) = fields.get(&name).filter(|value| !value.is_null()) {
                object.insert(name, assigned.clone());
            }
        }
    }

    serde_json::from_value(value).map_err(into_error)
}
