//! Worker configuration, loaded from the environment.

use std::convert::Infallible;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

use crate::resolver::NamingStrategy;
use crate::subscription::StreamConfig;

/// Comma-separated list of stream names.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamNames(pub Vec<String>);

impl FromStr for StreamNames {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(
            s.split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(ToOwned::to_owned)
                .collect(),
        ))
    }
}

/// Error returned by [`Config::stream_configs`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned when the stream list is empty.
    #[error("EVENTSTORE_STREAMS must contain at least one stream name")]
    NoStreams,

    /// Error returned when the consumer group name is empty.
    #[error("EVENTSTORE_GROUP must not be empty")]
    NoGroup,
}

/// Configuration of the worker.
///
/// The mapping from events to local type names cannot be expressed through
/// the environment: use [`NamingStrategy::mapping`] in place of
/// [`Config::naming_strategy`] for that.
#[derive(Debug, Clone, Envconfig)]
pub struct Config {
    /// Event Store endpoint.
    #[envconfig(from = "EVENTSTORE_TCP_URL", default = "redis://127.0.0.1:6379/")]
    pub tcp_url: String,

    /// Base URL of the Event Store HTTP interface, used for trace links.
    #[envconfig(from = "EVENTSTORE_HTTP_URL", default = "http://127.0.0.1:2113")]
    pub http_url: String,

    /// Streams to subscribe to, in order.
    #[envconfig(from = "EVENTSTORE_STREAMS")]
    pub streams: StreamNames,

    /// Consumer group shared by all the stream subscriptions.
    #[envconfig(from = "EVENTSTORE_GROUP")]
    pub group: String,

    /// Namespace local event type names are looked up in.
    #[envconfig(from = "EVENTSTORE_NAMESPACE", default = "App\\Events")]
    pub namespace: String,

    /// Seconds to wait before restarting a terminated processing loop.
    #[envconfig(from = "EVENTSTORE_RECONNECT_TIMEOUT", default = "10")]
    pub reconnect_timeout_secs: u64,

    /// Name this worker uses inside the consumer group.
    #[envconfig(from = "EVENTSTORE_CONSUMER", default = "eventually-worker")]
    pub consumer: String,
}

impl Config {
    /// Returns one [`StreamConfig`] per configured stream, all in the same group.
    pub fn stream_configs(&self) -> Result<Vec<StreamConfig>, Error> {
        if self.group.trim().is_empty() {
            return Err(Error::NoGroup);
        }

        if self.streams.0.is_empty() {
            return Err(Error::NoStreams);
        }

        Ok(self
            .streams
            .0
            .iter()
            .map(|stream| StreamConfig::new(stream.clone(), self.group.clone()))
            .collect())
    }

    /// Returns the [`NamingStrategy`] prefixing event types with the namespace.
    pub fn naming_strategy(&self) -> NamingStrategy {
        NamingStrategy::Namespace(self.namespace.clone())
    }

    /// Returns the delay before restarting a terminated processing loop.
    pub fn reconnect_timeout(&self) -> Duration {
        Duration::from_secs(self.reconnect_timeout_secs)
    }
}
