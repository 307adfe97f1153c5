//! Contains the wire-level [`RawEventRecord`] delivered by an Event Store
//! subscription, and its canonical, serializable form [`CanonicalEvent`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An event record, as delivered by a persistent subscription.
///
/// The record is read-only: acknowledgement is handled by the
/// [`AcknowledgeableRecord`](crate::store::AcknowledgeableRecord) carrying it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEventRecord {
    /// Unique identifier of the event.
    pub id: String,

    /// The stream the event has been appended to.
    pub stream_id: String,

    /// Position of the event inside its stream.
    pub number: u64,

    /// Name of the event type, as recorded by the producer.
    #[serde(rename = "type")]
    pub event_type: String,

    /// When the event has been recorded by the Event Store.
    pub created: DateTime<Utc>,

    /// Structured event payload.
    pub data: serde_json::Value,

    /// Structured event metadata.
    pub metadata: serde_json::Value,
}

/// Canonical representation of an inbound event, with JSON-encoded
/// payload and metadata and a millisecond epoch creation time.
///
/// Created once per inbound record by [`decode`], never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonicalEvent {
    event_type: String,
    created_epoch: i64,
    data: String,
    metadata: String,
}

impl CanonicalEvent {
    /// Name of the event type.
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    /// Creation time, in milliseconds since the Unix epoch.
    ///
    /// Always a multiple of 1000: sub-second precision is dropped on decode.
    pub fn created_epoch(&self) -> i64 {
        self.created_epoch
    }

    /// The JSON-encoded event payload.
    pub fn data(&self) -> &str {
        &self.data
    }

    /// The JSON-encoded event metadata.
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Parses the JSON-encoded payload back into a structured value.
    pub fn data_value(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.data)
    }

    /// Parses the JSON-encoded metadata back into a structured value.
    pub fn metadata_value(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.metadata)
    }
}

impl From<&RawEventRecord> for CanonicalEvent {
    fn from(raw: &RawEventRecord) -> Self {
        decode(raw)
    }
}

/// Converts a [`RawEventRecord`] into its [`CanonicalEvent`] form.
///
/// The creation time is truncated to whole seconds before being
/// converted to milliseconds, so `12:00:00.999` becomes `12:00:00.000`.
pub fn decode(raw: &RawEventRecord) -> CanonicalEvent {
    CanonicalEvent {
        event_type: raw.event_type.clone(),
        created_epoch: raw.created.timestamp() * 1000,
        data: raw.data.to_string(),
        metadata: raw.metadata.to_string(),
    }
}
