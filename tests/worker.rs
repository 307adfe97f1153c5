use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use eventually_worker::inmemory::InMemoryEventStore;
use eventually_worker::store::NackAction;
use eventually_worker::{
    Dispatcher, EventBus, NamingStrategy, Pipeline, RawEventRecord, Receivable, Resolver,
    StreamConfig, SubscriptionManager, Supervisor, TracingReporter, TypeRegistry,
};

const GROUP: &str = "read-models";

#[derive(Debug, Default, Serialize, Deserialize)]
struct OrderPlaced {
    id: u64,
    total: f64,
    #[serde(skip)]
    record: Option<Arc<RawEventRecord>>,
}

impl Receivable for OrderPlaced {
    fn set_event_record(&mut self, record: Arc<RawEventRecord>) {
        self.record = Some(record);
    }

    fn event_record(&self) -> Option<&RawEventRecord> {
        self.record.as_deref()
    }
}

#[derive(Debug, Default)]
struct ReadModel {
    orders: Vec<(u64, String, u64)>,
    unresolved: Vec<String>,
}

fn read_model_bus(read_model: &Arc<Mutex<ReadModel>>) -> EventBus {
    let mut bus = EventBus::default();

    {
        let read_model = read_model.clone();
        bus.on(move |event: &OrderPlaced| {
            let record = event.event_record().expect("record is attached");
            read_model
                .lock()
                .orders
                .push((event.id, record.stream_id.clone(), record.number));
            Ok(())
        });
    }

    {
        let read_model = read_model.clone();
        bus.on_name("CustomerRegistered", move |event| {
            read_model.lock().unresolved.push(event.data().to_owned());
            Ok(())
        });
    }

    bus.on_name("CustomerDeleted", |_| anyhow::bail!("customer projection is read-only"));

    bus
}

fn pipeline_with(
    store: &InMemoryEventStore,
    bus: EventBus,
    streams: &[&str],
) -> Pipeline<InMemoryEventStore> {
    let resolver = Resolver::new(
        TypeRegistry::default().register::<OrderPlaced>("Shop\\Events\\OrderPlaced"),
        NamingStrategy::Namespace("Shop\\Events".to_owned()),
    );

    let dispatcher = Dispatcher::new(resolver, Arc::new(bus), Arc::new(TracingReporter))
        .with_nack_action(NackAction::Park);

    let manager = SubscriptionManager::new(
        store.clone(),
        "memory://",
        "http://127.0.0.1:2113",
        Arc::new(dispatcher),
    );

    Pipeline::new(
        manager,
        streams
            .iter()
            .map(|stream| StreamConfig::new(*stream, GROUP))
            .collect(),
    )
}

fn pipeline(
    store: &InMemoryEventStore,
    read_model: &Arc<Mutex<ReadModel>>,
) -> Pipeline<InMemoryEventStore> {
    pipeline_with(store, read_model_bus(read_model), &["orders", "customers"])
}

async fn wait_for(store: &InMemoryEventStore, stream: &str, settled: usize) {
    while store.acked(stream, GROUP).len() + store.nacked(stream, GROUP).len() < settled {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test(start_paused = true)]
async fn it_dispatches_events_and_survives_reconnections() {
    let store = InMemoryEventStore::default();
    let read_model = Arc::new(Mutex::new(ReadModel::default()));

    store.append("orders", "OrderPlaced", json!({ "id": 1, "total": 10.5, "currency": "EUR" }), json!({}));
    store.append("customers", "CustomerRegistered", json!({ "name": "Ada" }), json!({}));
    store.append("customers", "CustomerDeleted", json!({ "name": "Ada" }), json!({}));

    let supervisor = Supervisor::new(pipeline(&store, &read_model), Arc::new(TracingReporter))
        .with_reconnect_timeout(Duration::from_millis(10))
        .with_max_runs(2);

    let driver = async {
        wait_for(&store, "orders", 1).await;
        wait_for(&store, "customers", 2).await;

        // Drop the connections: the supervisor restarts the pipeline,
        // which keeps consuming from where the group left off.
        store.close();
        store.append("orders", "OrderPlaced", json!({ "id": 2, "total": 3.0 }), json!({}));

        wait_for(&store, "orders", 2).await;
        store.close();
    };

    let (runs, ()) = tokio::join!(supervisor.run(), driver);

    assert_eq!(2, runs);

    let read_model = read_model.lock();
    assert_eq!(
        vec![(1, "orders".to_owned(), 0), (2, "orders".to_owned(), 1)],
        read_model.orders
    );
    assert_eq!(vec![r#"{"name":"Ada"}"#.to_owned()], read_model.unresolved);

    assert_eq!(vec!["0@orders", "1@orders"], store.acked("orders", GROUP));
    assert_eq!(vec!["0@customers"], store.acked("customers", GROUP));
    assert_eq!(
        vec![("1@customers".to_owned(), NackAction::Park)],
        store.nacked("customers", GROUP)
    );
    assert_eq!(1, store.parked("customers", GROUP).len());
}

#[tokio::test(start_paused = true)]
async fn it_retries_while_the_event_store_is_unreachable() {
    let store = InMemoryEventStore::default();
    let read_model = Arc::new(Mutex::new(ReadModel::default()));

    store.refuse_connections(true);
    store.append("orders", "OrderPlaced", json!({ "id": 7, "total": 1.0 }), json!({}));

    let supervisor = Supervisor::new(pipeline(&store, &read_model), Arc::new(TracingReporter))
        .with_reconnect_timeout(Duration::from_millis(5))
        .with_max_runs(4);

    let driver = async {
        tokio::time::sleep(Duration::from_millis(12)).await;
        store.refuse_connections(false);

        wait_for(&store, "orders", 1).await;
        store.close();
    };

    let (runs, ()) = tokio::join!(supervisor.run(), driver);

    // Three refused attempts, at 0ms, 5ms and 10ms, then a successful one.
    assert_eq!(4, runs);
    assert_eq!(vec!["0@orders"], store.acked("orders", GROUP));
    assert_eq!(vec![(7, "orders".to_owned(), 0)], read_model.lock().orders);
}

#[tokio::test(start_paused = true)]
async fn it_restarts_when_a_stream_cannot_be_subscribed_to() {
    let store = InMemoryEventStore::default();
    let read_model = Arc::new(Mutex::new(ReadModel::default()));

    store.refuse_stream("customers");
    store.append("orders", "OrderPlaced", json!({ "id": 3, "total": 4.0 }), json!({}));
    store.append("customers", "CustomerRegistered", json!({ "name": "Grace" }), json!({}));

    let supervisor = Supervisor::new(pipeline(&store, &read_model), Arc::new(TracingReporter))
        .with_max_runs(2);

    let driver = async {
        tokio::time::sleep(Duration::from_secs(1)).await;

        // Nothing is consumed until every stream is subscribed to.
        assert!(store.acked("orders", GROUP).is_empty());
        store.accept_stream("customers");

        wait_for(&store, "orders", 1).await;
        wait_for(&store, "customers", 1).await;
        store.close();
    };

    let (runs, ()) = tokio::join!(supervisor.run(), driver);

    assert_eq!(2, runs);
    assert_eq!(vec!["0@orders"], store.acked("orders", GROUP));
    assert_eq!(vec!["0@customers"], store.acked("customers", GROUP));
    assert_eq!(vec![r#"{"name":"Grace"}"#.to_owned()], read_model.lock().unresolved);
}

#[tokio::test(start_paused = true)]
async fn records_in_flight_on_a_lost_subscription_are_redelivered() {
    let store = InMemoryEventStore::default();
    let deliveries = Arc::new(Mutex::new(Vec::new()));

    store.append("orders", "OrderPlaced", json!({ "id": 1, "total": 9.99 }), json!({}));

    let mut bus = EventBus::default();

    {
        let store = store.clone();
        let deliveries = deliveries.clone();

        bus.on(move |event: &OrderPlaced| {
            let mut deliveries = deliveries.lock();
            deliveries.push(event.id);

            // The connection drops while the first delivery is handled.
            if deliveries.len() == 1 {
                store.fail_stream("orders");
            }

            Ok(())
        });
    }

    let supervisor = Supervisor::new(
        pipeline_with(&store, bus, &["orders"]),
        Arc::new(TracingReporter),
    )
    .with_reconnect_timeout(Duration::from_millis(10))
    .with_max_runs(2);

    let driver = async {
        wait_for(&store, "orders", 1).await;
        store.close();
    };

    let (runs, ()) = tokio::join!(supervisor.run(), driver);

    assert_eq!(2, runs);
    assert_eq!(vec![1, 1], *deliveries.lock());
    assert_eq!(vec!["0@orders"], store.acked("orders", GROUP));
    assert_eq!(0, store.pending("orders", GROUP));
}
