//! In-process event bus used by the [`Dispatcher`](crate::Dispatcher) to hand
//! inbound events over to application handlers.
//!
//! Listeners are registered either by event type, receiving resolved
//! [`LocalEvent`]s of that type, or by event name, receiving the
//! [`CanonicalEvent`] of every inbound event with that type name that
//! did not resolve to a local type.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use crate::record::CanonicalEvent;
use crate::resolver::LocalEvent;

type TypedListener = Box<dyn Fn(&dyn Any) -> anyhow::Result<()> + Send + Sync>;
type NamedListener = Box<dyn Fn(&CanonicalEvent) -> anyhow::Result<()> + Send + Sync>;

/// Event bus supporting type-keyed and name-keyed listeners.
///
/// Listeners run synchronously, in registration order. The first failing
/// listener stops the emission and its error is returned to the caller.
/// Emitting an event nobody listens to is not an error.
#[derive(Default)]
pub struct EventBus {
    typed: HashMap<TypeId, Vec<TypedListener>>,
    named: HashMap<String, Vec<NamedListener>>,
}

impl EventBus {
    /// Registers a listener for resolved events of type `E`.
    pub fn on<E, F>(&mut self, listener: F) -> &mut Self
    where
        E: Any,
        F: Fn(&E) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let listener: TypedListener = Box::new(move |event: &dyn Any| match event.downcast_ref::<E>() {
            Some(event) => listener(event),
            None => Ok(()),
        });

        self.typed.entry(TypeId::of::<E>()).or_default().push(listener);
        self
    }

    /// Registers a listener for unresolved events with the specified type name.
    pub fn on_name<F>(&mut self, name: impl Into<String>, listener: F) -> &mut Self
    where
        F: Fn(&CanonicalEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.named.entry(name.into()).or_default().push(Box::new(listener));
        self
    }

    /// Runs all the listeners registered for the concrete type of `event`.
    pub fn emit(&self, event: &dyn LocalEvent) -> anyhow::Result<()> {
        let event = event.as_any();

        self.typed
            .get(&event.type_id())
            .into_iter()
            .flatten()
            .try_for_each(|listener| listener(event))
    }

    /// Runs all the listeners registered for the specified name.
    pub fn emit_named(&self, name: &str, event: &CanonicalEvent) -> anyhow::Result<()> {
        self.named
            .get(name)
            .into_iter()
            .flatten()
            .try_for_each(|listener| listener(event))
    }

    /// Returns true if at least one listener is registered for `E`.
    pub fn has_listeners<E: Any>(&self) -> bool {
        self.typed.contains_key(&TypeId::of::<E>())
    }

    /// Returns true if at least one listener is registered for the name.
    pub fn has_named_listeners(&self, name: &str) -> bool {
        self.named.contains_key(name)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("typed", &self.typed.len())
            .field("named", &self.named.keys().collect::<Vec<_>>())
            .finish()
    }
}
