//! Contains the client-side abstractions over an Event Store supporting
//! persistent, acknowledged, competing-consumer subscriptions.
//!
//! Backends implement [`EventStore`] and [`Connection`]; every record they
//! deliver is wrapped in an [`AcknowledgeableRecord`], whose acknowledgement
//! handle can only be used once.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::record::RawEventRecord;

/// Error types returned by an Event Store backend.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned when a connection with the Event Store could not be
    /// established.
    #[error("failed to connect to the event store at {url}: {source}")]
    Connect {
        /// Endpoint the connection was attempted on.
        url: String,
        /// Backend-specific cause.
        #[source]
        source: anyhow::Error,
    },

    /// Error returned when the persistent subscription could not be opened.
    #[error("failed to open persistent subscription on stream `{stream}` for group `{group}`: {source}")]
    Subscribe {
        /// Stream the subscription was requested on.
        stream: String,
        /// Consumer group name.
        group: String,
        /// Backend-specific cause.
        #[source]
        source: anyhow::Error,
    },

    /// Error returned by an open subscription, typically a dropped connection.
    #[error("persistent subscription on stream `{stream}` failed: {source}")]
    Subscription {
        /// Stream of the failed subscription.
        stream: String,
        /// Backend-specific cause.
        #[source]
        source: anyhow::Error,
    },

    /// Error returned when acknowledging an event failed.
    #[error("failed to acknowledge event {id}: {source}")]
    Ack {
        /// Id of the event.
        id: String,
        /// Backend-specific cause.
        #[source]
        source: anyhow::Error,
    },

    /// Error returned when negatively acknowledging an event failed.
    #[error("failed to negatively acknowledge event {id}: {source}")]
    Nack {
        /// Id of the event.
        id: String,
        /// Backend-specific cause.
        #[source]
        source: anyhow::Error,
    },
}

/// Long-running stream of records delivered by a persistent subscription.
pub type RecordStream = BoxStream<'static, Result<AcknowledgeableRecord, Error>>;

/// Entrypoint of an Event Store client.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Connection type returned by [`connect`](EventStore::connect).
    type Connection: Connection;

    /// Opens a fresh connection with the Event Store at the specified endpoint.
    async fn connect(&self, url: &str) -> Result<Self::Connection, Error>;
}

/// An open connection with an Event Store.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Opens a persistent subscription on `stream` as member of the consumer
    /// `group`.
    ///
    /// The subscription is durable and tracked by the server: records are
    /// delivered at least once, and records delivered to one member of
    /// the group are not delivered to the others unless negatively acknowledged.
    ///
    /// The returned stream does not end until the connection is closed.
    async fn persistent_subscription(&self, stream: &str, group: &str)
        -> Result<RecordStream, Error>;
}

/// What the Event Store should do with a negatively acknowledged record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NackAction {
    /// Deliver the record again.
    #[default]
    Retry,

    /// Move the record out of the subscription, where an operator can
    /// inspect and replay it.
    Park,

    /// Drop the record for this consumer group.
    Skip,
}

/// Acknowledgement side of a persistent subscription.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    /// Marks the record as processed for the consumer group.
    async fn ack(&self, record: &RawEventRecord) -> Result<(), Error>;

    /// Marks the record as failed for the consumer group.
    async fn nack(
        &self,
        record: &RawEventRecord,
        action: NackAction,
        reason: &str,
    ) -> Result<(), Error>;
}

/// A [`RawEventRecord`] delivered by a persistent subscription, together
/// with the handle used to acknowledge it.
///
/// Both [`ack`](AcknowledgeableRecord::ack) and
/// [`nack`](AcknowledgeableRecord::nack) consume the value.
pub struct AcknowledgeableRecord {
    record: Arc<RawEventRecord>,
    acknowledger: Arc<dyn Acknowledger>,
}

impl AcknowledgeableRecord {
    /// Wraps a delivered record with its acknowledgement handle.
    pub fn new(record: RawEventRecord, acknowledger: Arc<dyn Acknowledger>) -> Self {
        Self {
            record: Arc::new(record),
            acknowledger,
        }
    }

    /// Returns the delivered record.
    pub fn record(&self) -> &Arc<RawEventRecord> {
        &self.record
    }

    /// Acknowledges the record.
    pub async fn ack(self) -> Result<(), Error> {
        self.acknowledger.ack(&self.record).await
    }

    /// Negatively acknowledges the record.
    pub async fn nack(self, action: NackAction, reason: &str) -> Result<(), Error> {
        self.acknowledger.nack(&self.record, action, reason).await
    }
}

impl fmt::Debug for AcknowledgeableRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcknowledgeableRecord")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}
