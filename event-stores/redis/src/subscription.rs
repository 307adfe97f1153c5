use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use eventually_worker::store::{
    AcknowledgeableRecord, Acknowledger, Connection, Error, NackAction, RecordStream,
};
use eventually_worker::RawEventRecord;

use futures::stream::{StreamExt, TryStreamExt};

use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, RedisResult};

use crate::stream;
use crate::PARKED_SUFFIX;

/// Connection with a Redis server, returned by
/// [`RedisEventStore::connect`](eventually_worker::EventStore::connect).
#[derive(Clone)]
pub struct RedisConnection {
    pub(crate) conn: MultiplexedConnection,
    pub(crate) consumer_name: String,
    pub(crate) stream_page_size: usize,
    pub(crate) block: Duration,
}

impl std::fmt::Debug for RedisConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisConnection")
            .field("consumer_name", &self.consumer_name)
            .field("stream_page_size", &self.stream_page_size)
            .field("block", &self.block)
            .finish_non_exhaustive()
    }
}

impl RedisConnection {
    /// Creates the Consumer Group, and the stream if it doesn't exist yet,
    /// in order to use `XREADGROUP` on it.
    async fn create_consumer_group(&self, stream: &str, group: &str) -> RedisResult<()> {
        let result: RedisResult<()> = self
            .conn
            .clone()
            .xgroup_create_mkstream(stream, group, 0)
            .await;

        if let Err(ref err) = result {
            if let Some("BUSYGROUP") = err.code() {
                // Consumer group has already been created, skip error.
                return Ok(());
            }
        }

        result
    }
}

#[async_trait]
impl Connection for RedisConnection {
    async fn persistent_subscription(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<RecordStream, Error> {
        self.create_consumer_group(stream, group)
            .await
            .map_err(|e| Error::Subscribe {
                stream: stream.to_owned(),
                group: group.to_owned(),
                source: e.into(),
            })?;

        let entries = stream::into_xreadgroup_stream(
            self.conn.clone(),
            stream.to_owned(),
            group.to_owned(),
            self.consumer_name.clone(),
            self.stream_page_size,
            self.block,
        );

        let stream_name = stream.to_owned();
        let acknowledger = RedisAcknowledger {
            conn: self.conn.clone(),
            stream: stream.to_owned(),
            group: group.to_owned(),
        };

        Ok(entries
            .map_err(move |e| Error::Subscription {
                stream: stream_name.clone(),
                source: e.into(),
            })
            .try_filter_map(move |entry| {
                let acknowledger = acknowledger.clone();

                async move {
                    match stream::to_record(&acknowledger.stream, &entry) {
                        Ok(record) => Ok(Some(AcknowledgeableRecord::new(
                            record,
                            Arc::new(EntryAcknowledger {
                                inner: acknowledger,
                                entry_id: entry.id,
                            }),
                        ))),

                        Err(e) => {
                            tracing::error!(
                                stream = %acknowledger.stream,
                                entry.id = %entry.id,
                                error = %e,
                                "Skipping undecodable Redis Stream entry"
                            );

                            acknowledger
                                .xack(&entry.id)
                                .await
                                .map_err(|source| Error::Ack {
                                    id: entry.id.clone(),
                                    source,
                                })?;

                            Ok::<_, Error>(None)
                        }
                    }
                }
            })
            .boxed())
    }
}

#[derive(Clone)]
struct RedisAcknowledger {
    conn: MultiplexedConnection,
    stream: String,
    group: String,
}

impl RedisAcknowledger {
    async fn xack(&self, entry_id: &str) -> anyhow::Result<()> {
        let acked: i64 = self
            .conn
            .clone()
            .xack(&self.stream, &self.group, &[entry_id])
            .await?;

        if acked == 0 {
            anyhow::bail!(
                "entry {} is not pending for group `{}`, check the entry id",
                entry_id,
                self.group
            );
        }

        Ok(())
    }

    async fn park(&self, record: &RawEventRecord, reason: &str) -> anyhow::Result<()> {
        let parked_stream = format!("{}{}", self.stream, PARKED_SUFFIX);
        let fields = stream::to_parked_fields(record, reason);

        let _: String = self
            .conn
            .clone()
            .xadd(&parked_stream, "*", fields.as_slice())
            .await?;

        Ok(())
    }
}

/// Acknowledges a single Redis Stream entry.
struct EntryAcknowledger {
    inner: RedisAcknowledger,
    entry_id: String,
}

#[async_trait]
impl Acknowledger for EntryAcknowledger {
    async fn ack(&self, record: &RawEventRecord) -> Result<(), Error> {
        self.inner
            .xack(&self.entry_id)
            .await
            .map_err(|source| Error::Ack {
                id: record.id.clone(),
                source,
            })
    }

    async fn nack(
        &self,
        record: &RawEventRecord,
        action: NackAction,
        reason: &str,
    ) -> Result<(), Error> {
        let result = match action {
            // Left in the pending entries list, read again by the next pending scan.
            NackAction::Retry => Ok(()),
            NackAction::Skip => self.inner.xack(&self.entry_id).await,
            NackAction::Park => match self.inner.park(record, reason).await {
                Ok(()) => self.inner.xack(&self.entry_id).await,
                Err(e) => Err(e),
            },
        };

        tracing::debug!(
            stream = %self.inner.stream,
            entry.id = %self.entry_id,
            action = ?action,
            reason,
            "Redis Stream entry negatively acknowledged"
        );

        result.map_err(|source| Error::Nack {
            id: record.id.clone(),
            source,
        })
    }
}
