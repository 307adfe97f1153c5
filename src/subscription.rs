//! Contains the [`SubscriptionManager`], which keeps one persistent
//! subscription open for each configured stream and feeds the delivered
//! records to the [`Dispatcher`].

use std::sync::Arc;

use futures::future;
use futures::stream::StreamExt;

use crate::dispatch::Dispatcher;
use crate::record::RawEventRecord;
use crate::report::Reporter;
use crate::store::{self, Connection, EventStore, RecordStream};

/// Stream to subscribe to, and the consumer group to subscribe as.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamConfig {
    /// Name of the stream.
    pub stream: String,

    /// Name of the consumer group.
    pub group: String,
}

impl StreamConfig {
    /// Creates a new [`StreamConfig`].
    pub fn new(stream: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            group: group.into(),
        }
    }
}

/// Error types returned by [`SubscriptionManager::run_all`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Error returned when no stream has been configured.
    #[error("no streams configured for subscription")]
    NoStreams,

    /// Error returned when some of the streams could not be subscribed to.
    #[error("failed to subscribe to {failed} of {total} streams")]
    Setup {
        /// Number of streams whose connection or subscription failed.
        failed: usize,
        /// Number of configured streams.
        total: usize,
    },

    /// Error returned when an open persistent subscription failed.
    #[error("lost connection with the event store: {0}")]
    Subscription(#[source] store::Error),

    /// Error returned when the server ended a persistent subscription.
    #[error("persistent subscription on stream `{stream}` ended")]
    Ended {
        /// Stream of the ended subscription.
        stream: String,
    },
}

/// Opens one connection and one persistent subscription per stream, and
/// dispatches every delivered record.
///
/// All the subscriptions are driven concurrently on the calling task:
/// records of different streams are interleaved, never handled in parallel.
pub struct SubscriptionManager<S> {
    store: S,
    tcp_url: String,
    http_url: String,
    dispatcher: Arc<Dispatcher>,
}

impl<S> SubscriptionManager<S>
where
    S: EventStore,
{
    /// Creates a new [`SubscriptionManager`].
    ///
    /// `tcp_url` is the Event Store endpoint, `http_url` is only used to
    /// build the trace link logged for every received record.
    pub fn new(
        store: S,
        tcp_url: impl Into<String>,
        http_url: impl Into<String>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            store,
            tcp_url: tcp_url.into(),
            http_url: http_url.into(),
            dispatcher,
        }
    }

    /// Returns the trace link of the record: `{http_url}/streams/{stream}/{number}`.
    pub fn trace_url(&self, record: &RawEventRecord) -> String {
        format!("{}/streams/{}/{}", self.http_url, record.stream_id, record.number)
    }

    /// Subscribes to every stream and dispatches records until one of the
    /// subscriptions terminates.
    ///
    /// Every stream is connected and subscribed to concurrently: a stream
    /// failing to connect or subscribe is reported without preventing the
    /// setup of the others, then the run ends with [`Error::Setup`].
    /// Once all the subscriptions are open, the first one failing or ending
    /// ends the run, dropping the others.
    ///
    /// This method never returns successfully.
    pub async fn run_all(&self, streams: &[StreamConfig]) -> Result<(), Error> {
        if streams.is_empty() {
            return Err(Error::NoStreams);
        }

        let results = future::join_all(streams.iter().map(|config| self.subscribe(config))).await;

        let mut subscriptions = Vec::with_capacity(streams.len());

        for (config, result) in streams.iter().zip(results) {
            match result {
                Ok((connection, records)) => {
                    subscriptions.push(Box::pin(self.consume(config, connection, records)));
                }
                Err(e) => self.reporter().report(&anyhow::Error::from(e)),
            }
        }

        if subscriptions.len() < streams.len() {
            return Err(Error::Setup {
                failed: streams.len() - subscriptions.len(),
                total: streams.len(),
            });
        }

        let (error, _, _) = future::select_all(subscriptions).await;
        Err(error)
    }

    async fn subscribe(
        &self,
        config: &StreamConfig,
    ) -> Result<(S::Connection, RecordStream), store::Error> {
        let connection = self.store.connect(&self.tcp_url).await?;

        let records = connection
            .persistent_subscription(&config.stream, &config.group)
            .await?;

        tracing::info!(
            stream = %config.stream,
            group = %config.group,
            "Persistent subscription opened"
        );

        Ok((connection, records))
    }

    async fn consume(
        &self,
        config: &StreamConfig,
        _connection: S::Connection,
        mut records: RecordStream,
    ) -> Error {
        while let Some(record) = records.next().await {
            let record = match record {
                Ok(record) => record,
                Err(e) => return Error::Subscription(e),
            };

            let url = self.trace_url(record.record());

            tracing::info!(
                event.id = %record.record().id,
                event.event_type = %record.record().event_type,
                "{}",
                url
            );

            self.dispatcher.dispatch(record).await;
        }

        tracing::warn!(
            stream = %config.stream,
            group = %config.group,
            "Persistent subscription ended"
        );

        Error::Ended {
            stream: config.stream.clone(),
        }
    }

    fn reporter(&self) -> &Arc<dyn Reporter> {
        self.dispatcher.reporter()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::bus::EventBus;
    use crate::inmemory::InMemoryEventStore;
    use crate::report::test::RecordingReporter;
    use crate::resolver::Resolver;
    use crate::store::NackAction;

    const GROUP: &str = "projections";

    fn manager(store: &InMemoryEventStore) -> (SubscriptionManager<InMemoryEventStore>, Arc<RecordingReporter>) {
        let reporter = Arc::new(RecordingReporter::default());

        let mut bus = EventBus::default();
        bus.on_name("Broken", |_| anyhow::bail!("handler failed"));

        let dispatcher = Dispatcher::new(Resolver::default(), Arc::new(bus), reporter.clone())
            .with_nack_action(NackAction::Park);
        let manager = SubscriptionManager::new(
            store.clone(),
            "memory://",
            "http://127.0.0.1:2113",
            Arc::new(dispatcher),
        );

        (manager, reporter)
    }

    async fn settle(store: &InMemoryEventStore, expected: &[(&str, usize)]) {
        while !expected.iter().all(|(stream, count)| {
            store.acked(stream, GROUP).len() + store.nacked(stream, GROUP).len() >= *count
        }) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        store.close();
    }

    #[test]
    fn trace_url_points_to_the_event_in_the_stream() {
        let store = InMemoryEventStore::default();
        let (manager, _) = manager(&store);
        let record = store.append("orders", "OrderPlaced", json!({}), json!({}));

        assert_eq!(
            "http://127.0.0.1:2113/streams/orders/0",
            manager.trace_url(&record)
        );
    }

    #[tokio::test]
    async fn empty_stream_list_is_rejected() {
        let store = InMemoryEventStore::default();
        let (manager, _) = manager(&store);

        assert!(matches!(manager.run_all(&[]).await, Err(Error::NoStreams)));
    }

    #[tokio::test]
    async fn every_stream_is_consumed_independently() {
        let store = InMemoryEventStore::default();
        store.append("orders", "OrderPlaced", json!({}), json!({}));
        store.append("orders", "Broken", json!({}), json!({}));
        store.append("customers", "CustomerRegistered", json!({}), json!({}));

        let (manager, reporter) = manager(&store);
        let streams = [
            StreamConfig::new("orders", GROUP),
            StreamConfig::new("customers", GROUP),
        ];

        let (result, ()) = tokio::join!(
            manager.run_all(&streams),
            settle(&store, &[("orders", 2), ("customers", 1)])
        );

        assert!(matches!(result, Err(Error::Ended { .. })));
        assert_eq!(vec!["0@orders"], store.acked("orders", GROUP));
        assert_eq!(1, store.nacked("orders", GROUP).len());
        assert_eq!(vec!["0@customers"], store.acked("customers", GROUP));
        assert_eq!(1, reporter.reports().len());
    }

    #[tokio::test]
    async fn failing_stream_ends_the_run() {
        let store = InMemoryEventStore::default();
        store.append("orders", "OrderPlaced", json!({}), json!({}));

        let (manager, _) = manager(&store);
        let streams = [
            StreamConfig::new("audit", GROUP),
            StreamConfig::new("orders", GROUP),
        ];

        let driver = async {
            while store.acked("orders", GROUP).is_empty() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }

            store.fail_stream("audit");
        };

        let (result, ()) = tokio::join!(manager.run_all(&streams), driver);

        match result {
            Err(Error::Subscription(store::Error::Subscription { stream, .. })) => {
                assert_eq!("audit", stream)
            }
            other => panic!("unexpected result: {:?}", other),
        }

        assert_eq!(vec!["0@orders"], store.acked("orders", GROUP));
    }

    #[tokio::test]
    async fn failing_setup_is_reported_per_stream() {
        let store = InMemoryEventStore::default();
        store.refuse_stream("audit");
        store.append("orders", "OrderPlaced", json!({}), json!({}));

        let (manager, reporter) = manager(&store);
        let streams = [
            StreamConfig::new("audit", GROUP),
            StreamConfig::new("orders", GROUP),
        ];

        let result = manager.run_all(&streams).await;

        assert!(matches!(result, Err(Error::Setup { failed: 1, total: 2 })));
        assert!(store.acked("orders", GROUP).is_empty());
        assert_eq!(0, store.pending("orders", GROUP));

        let reports = reporter.reports();
        assert_eq!(1, reports.len());
        assert!(reports[0].contains("audit"));
    }
}
