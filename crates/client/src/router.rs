//! Message router.
//!
//! Subscribers register interest in an endpoint; the poll thread never calls them
//! directly. Every delivery goes through the dispatch queue, so subscribers only ever run
//! on the host thread.
//!
//! Two explicit capabilities exist: [`MessageSubscriber`] for decoded payloads and
//! [`StatusSubscriber`] for connection status changes. Closures implement both.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;

use crate::dispatch::{panic_message, DispatchQueue};
use crate::endpoint::EndpointId;
use crate::handle::ConnectionStatus;

/// Receives decoded payloads from one endpoint.
pub trait MessageSubscriber: Send + Sync {
    fn on_message(&self, endpoint: &EndpointId, payload: &Value);
}

/// Receives status changes from one endpoint.
#[cfg_attr(test, mockall::automock)]
pub trait StatusSubscriber: Send + Sync {
    fn on_status(&self, endpoint: &EndpointId, status: &ConnectionStatus);
}

impl<F> MessageSubscriber for F
where
    F: Fn(&EndpointId, &Value) + Send + Sync,
{
    fn on_message(&self, endpoint: &EndpointId, payload: &Value) {
        self(endpoint, payload)
    }
}

impl<F> StatusSubscriber for F
where
    F: Fn(&EndpointId, &ConnectionStatus) + Send + Sync,
{
    fn on_status(&self, endpoint: &EndpointId, status: &ConnectionStatus) {
        self(endpoint, status)
    }
}

#[derive(Default)]
struct Subscribers {
    messages: HashMap<EndpointId, Vec<Arc<dyn MessageSubscriber>>>,
    status: HashMap<EndpointId, Vec<Arc<dyn StatusSubscriber>>>,
}

/// Routes payloads and status changes to the subscribers of their endpoint.
#[derive(Clone, Default)]
pub struct MessageRouter {
    subscribers: Arc<Mutex<Subscribers>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Subscribe to payloads from an endpoint.
    pub fn on_message(
        &self,
        endpoint: impl Into<EndpointId>,
        handler: impl Fn(&EndpointId, &Value) + Send + Sync + 'static,
    ) {
        self.add_message_subscriber(endpoint, Arc::new(handler));
    }

    /// Subscribe to status changes of an endpoint.
    pub fn on_status(
        &self,
        endpoint: impl Into<EndpointId>,
        handler: impl Fn(&EndpointId, &ConnectionStatus) + Send + Sync + 'static,
    ) {
        self.add_status_subscriber(endpoint, Arc::new(handler));
    }

    pub fn add_message_subscriber(
        &self,
        endpoint: impl Into<EndpointId>,
        subscriber: Arc<dyn MessageSubscriber>,
    ) {
        self.lock()
            .messages
            .entry(endpoint.into())
            .or_default()
            .push(subscriber);
    }

    pub fn add_status_subscriber(
        &self,
        endpoint: impl Into<EndpointId>,
        subscriber: Arc<dyn StatusSubscriber>,
    ) {
        self.lock()
            .status
            .entry(endpoint.into())
            .or_default()
            .push(subscriber);
    }

    /// Drop every subscriber of an endpoint.
    pub fn remove_endpoint(&self, endpoint: &EndpointId) {
        let mut subscribers = self.lock();
        subscribers.messages.remove(endpoint);
        subscribers.status.remove(endpoint);
    }

    pub fn subscriber_count(&self, endpoint: &EndpointId) -> usize {
        let subscribers = self.lock();
        subscribers.messages.get(endpoint).map_or(0, Vec::len)
            + subscribers.status.get(endpoint).map_or(0, Vec::len)
    }

    /// Deliver a payload to every message subscriber of the endpoint.
    ///
    /// Subscribers are snapshotted first so a handler may subscribe or unsubscribe
    /// without deadlocking. A panicking subscriber is logged; the rest still run.
    /// Returns the number of subscribers invoked.
    pub fn dispatch(&self, endpoint: &EndpointId, payload: &Value) -> usize {
        let targets = self
            .lock()
            .messages
            .get(endpoint)
            .cloned()
            .unwrap_or_default();
        if targets.is_empty() {
            tracing::debug!(endpoint = %endpoint, "No message subscribers, dropping payload");
        }
        for subscriber in &targets {
            if let Err(panic) =
                panic::catch_unwind(AssertUnwindSafe(|| subscriber.on_message(endpoint, payload)))
            {
                tracing::error!(
                    endpoint = %endpoint,
                    "Message subscriber panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
        targets.len()
    }

    /// Deliver a status change to every status subscriber of the endpoint.
    pub fn dispatch_status(&self, endpoint: &EndpointId, status: &ConnectionStatus) -> usize {
        let targets = self
            .lock()
            .status
            .get(endpoint)
            .cloned()
            .unwrap_or_default();
        for subscriber in &targets {
            if let Err(panic) =
                panic::catch_unwind(AssertUnwindSafe(|| subscriber.on_status(endpoint, status)))
            {
                tracing::error!(
                    endpoint = %endpoint,
                    "Status subscriber panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
        targets.len()
    }
}

/// Background-thread side of the router: queues deliveries for the host thread.
#[derive(Clone)]
pub struct EventSink {
    queue: DispatchQueue,
    router: MessageRouter,
}

impl EventSink {
    pub fn new(queue: DispatchQueue, router: MessageRouter) -> Self {
        Self { queue, router }
    }

    pub fn publish_payload(&self, endpoint: &EndpointId, payload: Value) {
        let router = self.router.clone();
        let endpoint = endpoint.clone();
        self.queue.enqueue(move || {
            router.dispatch(&endpoint, &payload);
        });
    }

    pub fn publish_status(&self, endpoint: &EndpointId, status: ConnectionStatus) {
        let router = self.router.clone();
        let endpoint = endpoint.clone();
        self.queue.enqueue(move || {
            router.dispatch_status(&endpoint, &status);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_dispatch_only_reaches_matching_endpoint() {
        let router = MessageRouter::new();
        let a_count = Arc::new(AtomicU32::new(0));
        let b_count = Arc::new(AtomicU32::new(0));

        let a = Arc::clone(&a_count);
        router.on_message("a", move |_, _| {
            a.fetch_add(1, Ordering::SeqCst);
        });
        let b = Arc::clone(&b_count);
        router.on_message("b", move |_, _| {
            b.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(router.dispatch(&EndpointId::new("a"), &json!({"n": 1})), 1);
        assert_eq!(a_count.load(Ordering::SeqCst), 1);
        assert_eq!(b_count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panicking_subscriber_is_isolated() {
        let router = MessageRouter::new();
        let count = Arc::new(AtomicU32::new(0));

        router.on_message("a", |_, _| panic!("bad handler"));
        let c = Arc::clone(&count);
        router.on_message("a", move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(router.dispatch(&EndpointId::new("a"), &json!({})), 2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_status_subscriber_trait_object() {
        let router = MessageRouter::new();
        let mut mock = MockStatusSubscriber::new();
        mock.expect_on_status()
            .withf(|endpoint, status| {
                endpoint.as_str() == "a"
                    && matches!(status, ConnectionStatus::Rejected(reason) if reason == "ERR_BADAUTH")
            })
            .times(1)
            .return_const(());
        router.add_status_subscriber("a", Arc::new(mock));

        router.dispatch_status(
            &EndpointId::new("a"),
            &ConnectionStatus::Rejected("ERR_BADAUTH".into()),
        );
    }

    #[test]
    fn test_subscriber_may_resubscribe_during_dispatch() {
        let router = MessageRouter::new();
        let inner = router.clone();
        router.on_message("a", move |_, _| {
            inner.on_message("a", |_, _| {});
        });

        router.dispatch(&EndpointId::new("a"), &json!({}));
        assert_eq!(router.subscriber_count(&EndpointId::new("a")), 2);

        router.remove_endpoint(&EndpointId::new("a"));
        assert_eq!(router.subscriber_count(&EndpointId::new("a")), 0);
    }

    #[test]
    fn test_sink_defers_delivery_to_drain() {
        let (queue, mut drain) = DispatchQueue::new();
        let router = MessageRouter::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s = Arc::clone(&seen);
        router.on_message("a", move |_, payload| {
            s.lock().expect("lock").push(payload.clone());
        });

        let sink = EventSink::new(queue, router);
        sink.publish_payload(&EndpointId::new("a"), json!(1));
        sink.publish_payload(&EndpointId::new("a"), json!(2));
        assert!(seen.lock().expect("lock").is_empty());

        drain.drain_once();
        assert_eq!(*seen.lock().expect("lock"), vec![json!(1), json!(2)]);
    }
}
