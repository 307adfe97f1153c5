mod handlers;
mod tracing;

use std::sync::Arc;

use envconfig::Envconfig;

use eventually_worker::{
    Config, Dispatcher, EventBus, Pipeline, Resolver, SubscriptionManager, Supervisor,
    TracingReporter, TypeRegistry,
};
use eventually_worker_redis::RedisEventStore;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing::initialize()?;

    let config = Config::init_from_env()?;
    let streams = config.stream_configs()?;

    let mut bus = EventBus::default();
    let registry = handlers::register(&config.namespace, TypeRegistry::default(), &mut bus);

    let reporter = Arc::new(TracingReporter);

    let resolver = Resolver::new(registry, config.naming_strategy());
    let dispatcher = Dispatcher::new(resolver, Arc::new(bus), reporter.clone());

    let store = RedisEventStore::default().consumer_name(config.consumer.clone());

    let manager = SubscriptionManager::new(
        store,
        config.tcp_url.clone(),
        config.http_url.clone(),
        Arc::new(dispatcher),
    );

    ::tracing::info!(
        streams = ?config.streams.0,
        group = %config.group,
        url = %config.tcp_url,
        "Starting event worker"
    );

    // Never returns: every terminated run is reported and restarted.
    Supervisor::new(Pipeline::new(manager, streams), reporter)
        .with_reconnect_timeout(config.reconnect_timeout())
        .run()
        .await;

    Ok(())
}
