use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

use eventually_worker::RawEventRecord;

use futures::stream::Stream;

use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisResult};

/// Error returned when a Redis Stream entry cannot be decoded into a
/// [`RawEventRecord`].
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// Error returned when a required field is missing from the entry.
    #[error("no key from Redis entry: `{0}`")]
    NoKey(&'static str),

    /// Error returned when a JSON-encoded field cannot be decoded.
    #[error("failed to decode `{key}` from JSON: {source}")]
    DecodeJson {
        /// Name of the field.
        key: &'static str,
        /// JSON decoding error.
        #[source]
        source: serde_json::Error,
    },

    /// Error returned when the `created` field is not an RFC 3339 timestamp.
    #[error("failed to decode `created` timestamp: {0}")]
    DecodeCreated(#[source] chrono::ParseError),

    /// Error returned when the entry id is not in the `<millis>-<seq>` form.
    #[error("malformed Redis entry id: `{0}`")]
    EntryId(String),
}

/// Decodes an entry read from `stream` into a [`RawEventRecord`].
pub(crate) fn to_record(stream: &str, entry: &StreamId) -> Result<RawEventRecord, DecodeError> {
    let event_type: String = entry.get("type").ok_or(DecodeError::NoKey("type"))?;

    let data: String = entry.get("data").ok_or(DecodeError::NoKey("data"))?;
    let data = serde_json::from_str(&data)
        .map_err(|source| DecodeError::DecodeJson { key: "data", source })?;

    let metadata = match entry.get::<String>("metadata") {
        Some(metadata) => serde_json::from_str(&metadata)
            .map_err(|source| DecodeError::DecodeJson { key: "metadata", source })?,
        None => serde_json::Value::Null,
    };

    let created = match entry.get::<String>("created") {
        Some(created) => DateTime::parse_from_rfc3339(&created)
            .map_err(DecodeError::DecodeCreated)?
            .with_timezone(&Utc),
        None => entry_timestamp(&entry.id)?,
    };

    let number = match entry.get::<u64>("number") {
        Some(number) => number,
        None => parse_millis(&entry.id)?,
    };

    Ok(RawEventRecord {
        id: entry.get("event_id").unwrap_or_else(|| entry.id.clone()),
        stream_id: stream.to_owned(),
        number,
        event_type,
        created,
        data,
        metadata,
    })
}

/// Returns the fields of the entry appended to the parked stream for
/// a negatively acknowledged record.
pub(crate) fn to_parked_fields(record: &RawEventRecord, reason: &str) -> Vec<(&'static str, String)> {
    vec![
        ("event_id", record.id.clone()),
        ("number", record.number.to_string()),
        ("type", record.event_type.clone()),
        ("created", record.created.to_rfc3339()),
        ("data", record.data.to_string()),
        ("metadata", record.metadata.to_string()),
        ("reason", reason.to_owned()),
    ]
}

/// Parses the milliseconds component from the id of a Redis Stream entry.
pub(crate) fn parse_millis(id: &str) -> Result<u64, DecodeError> {
    id.split('-')
        .next()
        .and_then(|millis| millis.parse().ok())
        .ok_or_else(|| DecodeError::EntryId(id.to_owned()))
}

fn entry_timestamp(id: &str) -> Result<DateTime<Utc>, DecodeError> {
    let millis = parse_millis(id)?;

    i64::try_from(millis)
        .ok()
        .and_then(|millis| Utc.timestamp_millis_opt(millis).single())
        .ok_or_else(|| DecodeError::EntryId(id.to_owned()))
}

/// Position of an `XREADGROUP` reader in the consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReadCursor {
    /// Scanning this consumer's pending entries list after the given id.
    Pending(String),
    /// Waiting for entries never delivered to the group.
    New,
}

impl Default for ReadCursor {
    fn default() -> Self {
        ReadCursor::Pending("0".to_owned())
    }
}

impl ReadCursor {
    /// Returns the id argument of the next `XREADGROUP` call.
    pub(crate) fn id(&self) -> &str {
        match self {
            ReadCursor::Pending(from) => from,
            ReadCursor::New => ">",
        }
    }

    /// Returns whether the next read should block for new entries.
    pub(crate) fn blocks(&self) -> bool {
        matches!(self, ReadCursor::New)
    }

    /// Moves the cursor past a page of entries read from [`ReadCursor::id`].
    ///
    /// The pending entries list is scanned again after every read of new
    /// entries, so entries left pending by a retry are delivered again.
    pub(crate) fn advance(self, page: &[StreamId]) -> Self {
        match (self, page.last()) {
            (ReadCursor::Pending(_), Some(last)) => ReadCursor::Pending(last.id.clone()),
            (ReadCursor::Pending(_), None) => ReadCursor::New,
            (ReadCursor::New, _) => ReadCursor::default(),
        }
    }
}

/// Returns a long-running [`futures::Stream`] reading a Redis Stream as
/// member of a consumer group with `XREADGROUP`.
///
/// Entries delivered to this consumer and never acknowledged are returned
/// first, one page of `page_size` entries at a time; then the stream blocks
/// waiting for new entries, and scans the pending entries again after each
/// blocking read.
///
/// The stream is never closed, unless Redis returns an error or the
/// stream is dropped.
pub(crate) fn into_xreadgroup_stream(
    mut conn: MultiplexedConnection,
    stream_name: String,
    group_name: String,
    consumer_name: String,
    page_size: usize,
    block: Duration,
) -> impl Stream<Item = RedisResult<StreamId>> + 'static {
    async_stream::try_stream! {
        let mut cursor = ReadCursor::default();
        let block = usize::try_from(block.as_millis()).unwrap_or(usize::MAX);

        loop {
            let mut opts = StreamReadOptions::default()
                .count(page_size)
                .group(&group_name, &consumer_name);

            if cursor.blocks() {
                opts = opts.block(block);
            }

            let reply: Option<StreamReadReply> = conn
                .xread_options(&[&stream_name], &[cursor.id()], &opts)
                .await?;

            let ids: Vec<StreamId> = reply
                .into_iter()
                .flat_map(|reply| reply.keys)
                .flat_map(|key| key.ids)
                .collect();

            cursor = cursor.advance(&ids);

            for entry in ids {
                yield entry;
            }
        }
    }
}
