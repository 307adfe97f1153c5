//! Contains the [`Dispatcher`], the per-record pipeline of the worker.
//!
//! Every record is decoded, resolved to a local event type if possible and
//! emitted on the [`EventBus`]. The record is acknowledged if all of it
//! succeeds and negatively acknowledged otherwise; nothing escapes
//! [`Dispatcher::dispatch`], so a failing handler never stops the worker.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::bus::EventBus;
use crate::record::{self, RawEventRecord};
use crate::report::Reporter;
use crate::resolver::Resolver;
use crate::store::{AcknowledgeableRecord, NackAction};

/// Final state of a dispatched record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The record has been handled and acknowledged.
    Acked,

    /// Handling failed and the record has been negatively acknowledged.
    Nacked,
}

/// Snapshot of a record that failed to dispatch, logged for operators.
#[derive(Debug, Serialize)]
pub struct Diagnostic<'a> {
    /// Event id.
    pub id: &'a str,
    /// Position of the event in its stream.
    pub number: u64,
    /// Stream the event belongs to.
    pub stream: &'a str,
    /// Event type name.
    #[serde(rename = "type")]
    pub event_type: &'a str,
    /// Creation time of the event.
    pub created: DateTime<Utc>,
    /// Structured event payload.
    pub data: &'a serde_json::Value,
    /// Structured event metadata.
    pub metadata: &'a serde_json::Value,
}

impl<'a> From<&'a RawEventRecord> for Diagnostic<'a> {
    fn from(record: &'a RawEventRecord) -> Self {
        Self {
            id: &record.id,
            number: record.number,
            stream: &record.stream_id,
            event_type: &record.event_type,
            created: record.created,
            data: &record.data,
            metadata: &record.metadata,
        }
    }
}

/// Routes inbound records to the [`EventBus`] and settles them with the
/// Event Store.
pub struct Dispatcher {
    resolver: Resolver,
    bus: Arc<EventBus>,
    reporter: Arc<dyn Reporter>,
    nack_action: NackAction,
}

impl Dispatcher {
    /// Creates a new [`Dispatcher`].
    ///
    /// Failed records are negatively acknowledged with [`NackAction::Retry`],
    /// use [`with_nack_action`](Dispatcher::with_nack_action) to change it.
    pub fn new(resolver: Resolver, bus: Arc<EventBus>, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            resolver,
            bus,
            reporter,
            nack_action: NackAction::default(),
        }
    }

    /// Sets the action requested to the Event Store on negative acknowledgement.
    #[must_use]
    pub fn with_nack_action(mut self, action: NackAction) -> Self {
        self.nack_action = action;
        self
    }

    /// Returns the reporter used for failed records.
    pub fn reporter(&self) -> &Arc<dyn Reporter> {
        &self.reporter
    }

    /// Dispatches the record, then acknowledges or negatively acknowledges it.
    ///
    /// Exactly one of the two is called on the record, also when a handler
    /// panics. Errors are forwarded to the [`Reporter`].
    pub async fn dispatch(&self, record: AcknowledgeableRecord) -> Outcome {
        let raw = Arc::clone(record.record());

        let result = panic::catch_unwind(AssertUnwindSafe(|| self.handle(&raw))).unwrap_or_else(
            |panic| {
                Err(anyhow::anyhow!(
                    "event handler panicked: {}",
                    panic_message(panic.as_ref())
                ))
            },
        );

        match result {
            Ok(()) => {
                match record.ack().await {
                    Ok(()) => tracing::debug!(
                        event.id = %raw.id,
                        event.stream = %raw.stream_id,
                        event.number = raw.number,
                        "Event acknowledged"
                    ),
                    Err(e) => self.reporter.report(&anyhow::Error::from(e)),
                }

                Outcome::Acked
            }
            Err(error) => {
                let diagnostic = Diagnostic::from(raw.as_ref());
                let dump = serde_json::to_string_pretty(&diagnostic)
                    .unwrap_or_else(|_| format!("{:?}", diagnostic));

                tracing::error!(
                    event.id = %raw.id,
                    event.stream = %raw.stream_id,
                    event.number = raw.number,
                    "Failed to dispatch event:\n{}",
                    dump
                );

                if let Err(e) = record.nack(self.nack_action, &format!("{:#}", error)).await {
                    self.reporter.report(&anyhow::Error::from(e));
                }

                self.reporter.report(&error);

                Outcome::Nacked
            }
        }
    }

    /// Decodes, resolves and emits the record on the [`EventBus`].
    pub fn handle(&self, raw: &Arc<RawEventRecord>) -> anyhow::Result<()> {
        let event = record::decode(raw);

        match self.resolver.resolve(&event, raw)? {
            Some(local) => self
                .bus
                .emit(local.as_ref())
                .with_context(|| format!("handler failed for local event {}", local.type_name())),
            None => self
                .bus
                .emit_named(event.event_type(), &event)
                .with_context(|| format!("handler failed for event `{}`", event.event_type())),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
