//! Event types and listeners of the application.

use std::sync::Arc;

use eventually_worker::resolver::NAMESPACE_SEPARATOR;
use eventually_worker::{EventBus, RawEventRecord, Receivable, TypeRegistry};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: String,
    pub total: f64,
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

/// Registers the local event types under `namespace`, and their listeners.
pub fn register(namespace: &str, registry: TypeRegistry, bus: &mut EventBus) -> TypeRegistry {
    bus.on(|event: &OrderPlaced| {
        tracing::info!(
            order.id = %event.order_id,
            order.total = event.total,
            stream = ?event.event_record().map(|record| &record.stream_id),
            "Order placed"
        );

        Ok(())
    });

    bus.on_name("OrderCancelled", |event| {
        tracing::info!(payload = %event.data(), "Order cancelled");
        Ok(())
    });

    registry
        .register::<OrderPlaced>(qualified(namespace, "OrderPlaced"))
        .declare(qualified(namespace, "OrderCancelled"))
}

fn qualified(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_owned()
    } else {
        format!("{}{}{}", namespace, NAMESPACE_SEPARATOR, name)
    }
}
