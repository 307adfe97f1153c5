//! Redis backend for the [`eventually-worker`](eventually_worker) crate.
//!
//! Persistent subscriptions are implemented with Redis Streams consumer
//! groups: every worker subscribing with the same group name competes for
//! the entries of the stream, and each entry stays in the group's pending
//! list until it is acknowledged with `XACK`.
//!
//! ## Entry format
//!
//! Entries appended to a subscribed stream must carry the following fields:
//!
//! | field      | required | content                                          |
//! |------------|----------|--------------------------------------------------|
//! | `type`     | yes      | name of the event type                           |
//! | `data`     | yes      | JSON-encoded event payload                       |
//! | `metadata` | no       | JSON-encoded event metadata, `null` if missing   |
//! | `event_id` | no       | unique event id, the entry id if missing         |
//! | `number`   | no       | position in the stream, from the entry id if missing |
//! | `created`  | no       | RFC 3339 timestamp, from the entry id if missing |

#![deny(unsafe_code, unused_qualifications, trivial_casts)]
#![warn(missing_docs)]

mod stream;
mod subscription;

use std::time::Duration;

use async_trait::async_trait;

use eventually_worker::store::{Error, EventStore};

pub use stream::DecodeError;
pub use subscription::*;

/// Default number of entries requested with each `XREADGROUP .. COUNT n`.
///
/// Page size can be overridden through [`RedisEventStore::stream_page_size`].
pub const STREAM_PAGE_DEFAULT: usize = 128;

/// Default time an `XREADGROUP .. BLOCK ms` waits for new entries before
/// being issued again.
pub const BLOCK_DEFAULT: Duration = Duration::from_secs(5);

/// Default consumer name used inside the consumer group.
pub const CONSUMER_DEFAULT: &str = "eventually-worker";

/// Suffix of the stream parked entries are moved to.
pub const PARKED_SUFFIX: &str = ":parked";

/// [`EventStore`] implementation connecting to a Redis server.
///
/// The same instance can be used to open any number of connections:
/// every [`connect`](EventStore::connect) call opens a new one.
#[derive(Debug, Clone)]
pub struct RedisEventStore {
    consumer_name: String,
    stream_page_size: usize,
    block: Duration,
}

impl Default for RedisEventStore {
    fn default() -> Self {
        Self {
            consumer_name: CONSUMER_DEFAULT.to_owned(),
            stream_page_size: STREAM_PAGE_DEFAULT,
            block: BLOCK_DEFAULT,
        }
    }
}

impl RedisEventStore {
    /// Changes the name this worker uses inside the consumer groups.
    ///
    /// Workers sharing the same consumer name also share the pending
    /// entries list, so the name should be unique for every running
    /// worker process.
    pub fn consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = name.into();
        self
    }

    /// Changes the number of entries requested with each `XREADGROUP`.
    pub fn stream_page_size(mut self, size: usize) -> Self {
        self.stream_page_size = size;
        self
    }

    /// Changes how long each `XREADGROUP` blocks waiting for new entries.
    pub fn block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }
}

#[async_trait]
impl EventStore for RedisEventStore {
    type Connection = RedisConnection;

    async fn connect(&self, url: &str) -> Result<Self::Connection, Error> {
        let connect_error = |source: redis::RedisError| Error::Connect {
            url: url.to_owned(),
            source: source.into(),
        };

        let client = redis::Client::open(url).map_err(connect_error)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(connect_error)?;

        tracing::debug!(url, consumer = %self.consumer_name, "Connected to Redis");

        Ok(RedisConnection {
            conn,
            consumer_name: self.consumer_name.clone(),
            stream_page_size: self.stream_page_size,
            block: self.block,
        })
    }
}
