//! Typed event bus with audit persistence and fan-out dispatch. Grounded
//! on `core/bus.py`'s `AsyncIOBus`: per-type subscriber lists plus a
//! wildcard list, fire-and-await-all dispatch with failure isolation,
//! persist-then-dispatch ordering.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::domain::event::Event;
use crate::domain::ports::{EventBusPort, EventCallback};
use crate::infrastructure::store::Store;

/// In-process async pub/sub event bus with JSONL audit logging.
///
/// `publish` persists the event to the day's audit log first, then
/// dispatches concurrently to every matching subscriber; a panicking or
/// erroring handler is caught and logged, never propagated to the
/// publisher and never blocks other handlers.
pub struct EventBus {
    store: Arc<Store>,
    subscribers: RwLock<HashMap<String, Vec<EventCallback>>>,
    wildcard: RwLock<Vec<EventCallback>>,
    audit_events: bool,
}

impl EventBus {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            subscribers: RwLock::new(HashMap::new()),
            wildcard: RwLock::new(Vec::new()),
            audit_events: true,
        }
    }

    pub fn with_audit_logging(mut self, enabled: bool) -> Self {
        self.audit_events = enabled;
        self
    }

    pub async fn subscribe(&self, event_type: &str, callback: EventCallback) {
        if event_type == "*" {
            self.wildcard.write().await.push(callback);
        } else {
            self.subscribers
                .write()
                .await
                .entry(event_type.to_string())
                .or_default()
                .push(callback);
        }
        debug!(event_type, "subscribed to event bus");
    }

    /// Removes the exact registration (compared by `Arc` pointer
    /// identity); a no-op if the callback was never registered.
    pub async fn unsubscribe(&self, event_type: &str, callback: &EventCallback) {
        if event_type == "*" {
            self.wildcard.write().await.retain(|cb| !Arc::ptr_eq(cb, callback));
        } else if let Some(list) = self.subscribers.write().await.get_mut(event_type) {
            list.retain(|cb| !Arc::ptr_eq(cb, callback));
        }
    }

    pub async fn publish(&self, event: Event) {
        if self.audit_events {
            let date_key = event.audit_date_key();
            match serde_json::to_string(&event) {
                Ok(line) => {
                    if let Err(e) = self.store.append_audit_line(&date_key, &line).await {
                        warn!(error = %e, event_id = %event.id, "failed to persist event to audit log");
                    }
                }
                Err(e) => warn!(error = %e, event_id = %event.id, "failed to serialize event for audit log"),
            }
        }

        let mut callbacks = self
            .subscribers
            .read()
            .await
            .get(&event.event_type)
            .cloned()
            .unwrap_or_default();
        callbacks.extend(self.wildcard.read().await.iter().cloned());

        if callbacks.is_empty() {
            debug!(event_type = %event.event_type, "no subscribers for event type");
            return;
        }

        debug!(
            event_type = %event.event_type,
            subscriber_count = callbacks.len(),
            correlation_id = %event.correlation_id,
            "publishing event"
        );

        let handles: Vec<_> = callbacks
            .into_iter()
            .map(|cb| {
                let event = event.clone();
                tokio::spawn(async move { cb(event).await })
            })
            .collect();

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(
                    error = %e,
                    event_type = %event.event_type,
                    correlation_id = %event.correlation_id,
                    "event handler panicked"
                );
            }
        }
    }

    pub async fn subscriber_count(&self, event_type: Option<&str>) -> usize {
        match event_type {
            None => {
                let per_type: usize = self.subscribers.read().await.values().map(Vec::len).sum();
                per_type + self.wildcard.read().await.len()
            }
            Some("*") => self.wildcard.read().await.len(),
            Some(t) => self.subscribers.read().await.get(t).map(Vec::len).unwrap_or(0),
        }
    }
}

#[async_trait]
impl EventBusPort for EventBus {
    fn name(&self) -> &str {
        "asyncio_bus"
    }

    async fn publish(&self, event: Event) {
        EventBus::publish(self, event).await
    }

    async fn subscribe(&self, event_type: &str, callback: EventCallback) {
        EventBus::subscribe(self, event_type, callback).await
    }

    async fn unsubscribe(&self, event_type: &str, callback: &EventCallback) {
        EventBus::unsubscribe(self, event_type, callback).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    async fn temp_bus() -> EventBus {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.keep()).await.unwrap());
        EventBus::new(store)
    }

    #[tokio::test]
    async fn dispatches_to_exact_and_wildcard_subscribers() {
        let bus = temp_bus().await;
        let exact_hits = Arc::new(AtomicUsize::new(0));
        let wildcard_hits = Arc::new(AtomicUsize::new(0));

        let e = exact_hits.clone();
        bus.subscribe(
            "signal.proposed",
            Arc::new(move |_event| {
                let e = e.clone();
                Box::pin(async move {
                    e.fetch_add(1, Ordering::SeqCst);
                })
            }),
        )
        .await;

        let w = wildcard_hits.clone();
        bus.subscribe(
            "*",
            Arc::new(move |_event| {
                let w = w.clone();
                Box::pin(async move {
                    w.fetch_add(1, Ordering::SeqCst);
                })
            }),
        )
        .await;

        bus.publish(Event::new("signal.proposed", "test", serde_json::json!({})))
            .await;

        assert_eq!(exact_hits.load(Ordering::SeqCst), 1);
        assert_eq!(wildcard_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_others() {
        let bus = temp_bus().await;
        let hits = Arc::new(AtomicUsize::new(0));

        bus.subscribe(
            "x",
            Arc::new(|_event| Box::pin(async move { panic!("boom") })),
        )
        .await;

        let h = hits.clone();
        bus.subscribe(
            "x",
            Arc::new(move |_event| {
                let h = h.clone();
                Box::pin(async move {
                    h.fetch_add(1, Ordering::SeqCst);
                })
            }),
        )
        .await;

        bus.publish(Event::new("x", "test", serde_json::json!({}))).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_exact_registration() {
        let bus = temp_bus().await;
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let callback: EventCallback = Arc::new(move |_event| {
            let h = h.clone();
            Box::pin(async move {
                h.fetch_add(1, Ordering::SeqCst);
            })
        });

        bus.subscribe("y", callback.clone()).await;
        bus.unsubscribe("y", &callback).await;
        bus.publish(Event::new("y", "test", serde_json::json!({}))).await;

        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn publish_persists_to_audit_log() {
        let bus = temp_bus().await;
        bus.publish(Event::new("signal.proposed", "test", serde_json::json!({})))
            .await;
        let count = bus.store.count_audit_events_today("signal.proposed").await.unwrap();
        assert_eq!(count, 1);
    }
}
