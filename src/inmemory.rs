//! Contains an in-memory [`EventStore`] implementation with consumer group
//! semantics, backed by a thread-safe [`std::collections::HashMap`].
//!
//! Useful for tests and local development: events are appended with
//! [`InMemoryEventStore::append`] and delivered to every persistent
//! subscription opened on the stream, competing among members of the
//! same group. Unacknowledged records are redelivered after a
//! [`close`](InMemoryEventStore::close), or once the subscription they were
//! delivered to is dropped.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::record::RawEventRecord;
use crate::store::{
    AcknowledgeableRecord, Acknowledger, Connection, Error, EventStore, NackAction, RecordStream,
};

#[derive(Debug, Default)]
struct Group {
    cursor: usize,
    redeliver: VecDeque<RawEventRecord>,
    pending: HashMap<String, (u64, RawEventRecord)>,
    acked: Vec<String>,
    nacked: Vec<(String, NackAction)>,
    parked: Vec<RawEventRecord>,
}

impl Group {
    fn next(&mut self, events: &[RawEventRecord], owner: u64) -> Option<RawEventRecord> {
        let record = match self.redeliver.pop_front() {
            Some(record) => record,
            None => {
                let record = events.get(self.cursor)?.clone();
                self.cursor += 1;
                record
            }
        };

        self.pending
            .insert(record.id.clone(), (owner, record.clone()));

        Some(record)
    }

    /// Moves the records pending for `owner` back in front of the queue.
    fn release(&mut self, owner: u64) {
        let mut released: Vec<RawEventRecord> = self
            .pending
            .values()
            .filter(|(id, _)| *id == owner)
            .map(|(_, record)| record.clone())
            .collect();

        for record in &released {
            self.pending.remove(&record.id);
        }

        released.sort_by_key(|record| std::cmp::Reverse(record.number));

        for record in released {
            self.redeliver.push_front(record);
        }
    }
}

#[derive(Debug, Default)]
struct Backend {
    generation: u64,
    streams: HashMap<String, Vec<RawEventRecord>>,
    groups: HashMap<(String, String), Group>,
    refused_streams: HashSet<String>,
    refuse_connections: bool,
    next_subscription: u64,
    open: HashMap<u64, String>,
    failed: HashSet<u64>,
}

/// In-memory Event Store supporting persistent subscriptions.
///
/// Cloning the store returns a handle to the same backend.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventStore {
    backend: Arc<Mutex<Backend>>,
    notify: Arc<Notify>,
}

impl InMemoryEventStore {
    /// Appends a new event to the specified stream, returning the stored record.
    pub fn append(
        &self,
        stream: &str,
        event_type: &str,
        data: serde_json::Value,
        metadata: serde_json::Value,
    ) -> RawEventRecord {
        let mut backend = self.backend.lock();
        let events = backend.streams.entry(stream.to_owned()).or_default();
        let number = events.len() as u64;

        let record = RawEventRecord {
            id: format!("{}@{}", number, stream),
            stream_id: stream.to_owned(),
            number,
            event_type: event_type.to_owned(),
            created: Utc::now(),
            data,
            metadata,
        };

        events.push(record.clone());
        drop(backend);

        self.notify.notify_waiters();
        record
    }

    /// Closes every open subscription, as a dropped connection would.
    ///
    /// Records delivered but not yet acknowledged are redelivered to the
    /// next subscription of their group.
    pub fn close(&self) {
        let mut backend = self.backend.lock();
        backend.generation += 1;

        for group in backend.groups.values_mut() {
            let mut pending: Vec<RawEventRecord> =
                group.pending.drain().map(|(_, (_, r))| r).collect();
            pending.sort_by_key(|record| record.number);
            group.redeliver.extend(pending);
        }

        drop(backend);
        self.notify.notify_waiters();
    }

    /// Makes every following [`connect`](EventStore::connect) fail, or
    /// succeed again.
    pub fn refuse_connections(&self, refuse: bool) {
        self.backend.lock().refuse_connections = refuse;
    }

    /// Makes every following persistent subscription on `stream` fail.
    pub fn refuse_stream(&self, stream: &str) {
        self.backend.lock().refused_streams.insert(stream.to_owned());
    }

    /// Accepts again persistent subscriptions on a refused `stream`.
    pub fn accept_stream(&self, stream: &str) {
        self.backend.lock().refused_streams.remove(stream);
    }

    /// Fails every open subscription on `stream`, as a connection lost in
    /// the middle of the subscription would.
    ///
    /// Each failed subscription returns one error and ends; records it
    /// delivered can no longer be settled, and are redelivered once the
    /// subscription is dropped.
    pub fn fail_stream(&self, stream: &str) {
        let mut backend = self.backend.lock();

        let failed: Vec<u64> = backend
            .open
            .iter()
            .filter(|(_, open)| open.as_str() == stream)
            .map(|(id, _)| *id)
            .collect();

        backend.failed.extend(failed);
        drop(backend);

        self.notify.notify_waiters();
    }

    /// Ids of the records acknowledged by the group, in acknowledgement order.
    pub fn acked(&self, stream: &str, group: &str) -> Vec<String> {
        self.with_group(stream, group, |g| g.acked.clone())
    }

    /// Ids and actions of the records negatively acknowledged by the group.
    pub fn nacked(&self, stream: &str, group: &str) -> Vec<(String, NackAction)> {
        self.with_group(stream, group, |g| g.nacked.clone())
    }

    /// Records parked by the group.
    pub fn parked(&self, stream: &str, group: &str) -> Vec<RawEventRecord> {
        self.with_group(stream, group, |g| g.parked.clone())
    }

    /// Number of records delivered to the group and not settled yet.
    pub fn pending(&self, stream: &str, group: &str) -> usize {
        self.with_group(stream, group, |g| g.pending.len())
    }

    fn with_group<T: Default>(&self, stream: &str, group: &str, f: impl FnOnce(&Group) -> T) -> T {
        self.backend
            .lock()
            .groups
            .get(&(stream.to_owned(), group.to_owned()))
            .map(f)
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    type Connection = InMemoryConnection;

    async fn connect(&self, url: &str) -> Result<Self::Connection, Error> {
        let backend = self.backend.lock();

        if backend.refuse_connections {
            return Err(Error::Connect {
                url: url.to_owned(),
                source: anyhow::anyhow!("connection refused"),
            });
        }

        Ok(InMemoryConnection {
            store: self.clone(),
            generation: backend.generation,
        })
    }
}

/// Connection opened by [`InMemoryEventStore::connect`].
///
/// The connection, and all the subscriptions opened through it, are closed
/// by [`InMemoryEventStore::close`].
#[derive(Debug, Clone)]
pub struct InMemoryConnection {
    store: InMemoryEventStore,
    generation: u64,
}

enum Delivery {
    Record(RawEventRecord),
    Idle,
    Failed,
    Closed,
}

struct SubscriptionState {
    id: u64,
    store: InMemoryEventStore,
    stream: String,
    group: String,
    generation: u64,
    failed: bool,
    acknowledger: Arc<InMemoryAcknowledger>,
}

impl SubscriptionState {
    async fn next(mut self) -> Option<(Result<AcknowledgeableRecord, Error>, Self)> {
        if self.failed {
            return None;
        }

        // Records may be ready forever: let other subscriptions on the task run.
        tokio::task::yield_now().await;

        let notify = Arc::clone(&self.store.notify);

        loop {
            let notified = notify.notified();

            match self.poll() {
                Delivery::Record(record) => {
                    let acknowledger: Arc<dyn Acknowledger> = self.acknowledger.clone();
                    let record = AcknowledgeableRecord::new(record, acknowledger);
                    return Some((Ok(record), self));
                }
                Delivery::Failed => {
                    self.failed = true;

                    let error = Error::Subscription {
                        stream: self.stream.clone(),
                        source: anyhow::anyhow!("connection lost"),
                    };

                    return Some((Err(error), self));
                }
                Delivery::Closed => return None,
                Delivery::Idle => notified.await,
            }
        }
    }

    fn poll(&self) -> Delivery {
        let mut backend = self.store.backend.lock();

        if backend.generation != self.generation {
            return Delivery::Closed;
        }

        if backend.failed.contains(&self.id) {
            return Delivery::Failed;
        }

        let key = (self.stream.clone(), self.group.clone());
        let Backend { streams, groups, .. } = &mut *backend;
        let events = streams.get(&self.stream).map(Vec::as_slice).unwrap_or_default();

        match groups.entry(key).or_default().next(events, self.id) {
            Some(record) => Delivery::Record(record),
            None => Delivery::Idle,
        }
    }
}

impl Drop for SubscriptionState {
    fn drop(&mut self) {
        let mut backend = self.store.backend.lock();
        backend.open.remove(&self.id);
        backend.failed.remove(&self.id);

        if let Some(group) = backend
            .groups
            .get_mut(&(self.stream.clone(), self.group.clone()))
        {
            group.release(self.id);
        }

        drop(backend);
        self.store.notify.notify_waiters();
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn persistent_subscription(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<RecordStream, Error> {
        let id = {
            let mut backend = self.store.backend.lock();

            if backend.generation != self.generation {
                return Err(Error::Subscribe {
                    stream: stream.to_owned(),
                    group: group.to_owned(),
                    source: anyhow::anyhow!("connection closed"),
                });
            }

            if backend.refused_streams.contains(stream) {
                return Err(Error::Subscribe {
                    stream: stream.to_owned(),
                    group: group.to_owned(),
                    source: anyhow::anyhow!("access denied"),
                });
            }

            backend
                .groups
                .entry((stream.to_owned(), group.to_owned()))
                .or_default();

            backend.next_subscription += 1;
            let id = backend.next_subscription;
            backend.open.insert(id, stream.to_owned());
            id
        };

        let state = SubscriptionState {
            id,
            store: self.store.clone(),
            stream: stream.to_owned(),
            group: group.to_owned(),
            generation: self.generation,
            failed: false,
            acknowledger: Arc::new(InMemoryAcknowledger {
                store: self.store.clone(),
                group: group.to_owned(),
                subscription: id,
            }),
        };

        Ok(stream::unfold(state, SubscriptionState::next).boxed())
    }
}

struct InMemoryAcknowledger {
    store: InMemoryEventStore,
    group: String,
    subscription: u64,
}

impl InMemoryAcknowledger {
    fn settle<T>(
        &self,
        record: &RawEventRecord,
        f: impl FnOnce(&mut Group, RawEventRecord) -> T,
    ) -> anyhow::Result<T> {
        let mut backend = self.store.backend.lock();

        if backend.failed.contains(&self.subscription) {
            anyhow::bail!("connection lost");
        }

        let not_pending = || anyhow::anyhow!("record is not pending for group `{}`", self.group);

        let group = backend
            .groups
            .get_mut(&(record.stream_id.clone(), self.group.clone()))
            .ok_or_else(not_pending)?;

        let (_, pending) = group.pending.remove(&record.id).ok_or_else(not_pending)?;

        Ok(f(group, pending))
    }
}

#[async_trait]
impl Acknowledger for InMemoryAcknowledger {
    async fn ack(&self, record: &RawEventRecord) -> Result<(), Error> {
        self.settle(record, |group, record| group.acked.push(record.id))
            .map_err(|source| Error::Ack {
                id: record.id.clone(),
                source,
            })
    }

    async fn nack(
        &self,
        record: &RawEventRecord,
        action: NackAction,
        _reason: &str,
    ) -> Result<(), Error> {
        self.settle(record, |group, record| {
            group.nacked.push((record.id.clone(), action));

            match action {
                NackAction::Retry => group.redeliver.push_back(record),
                NackAction::Park => group.parked.push(record),
                NackAction::Skip => {}
            }
        })
        .map_err(|source| Error::Nack {
            id: record.id.clone(),
            source,
        })?;

        if action == NackAction::Retry {
            self.store.notify.notify_waiters();
        }

        Ok(())
    }
}
