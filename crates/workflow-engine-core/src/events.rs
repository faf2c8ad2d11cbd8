/*!
# Event bus

Best-effort fan-out of `WorkflowEvent`s to subscribers, filtered by each
subscriber's declared interest set. Grounded on the `Arc<Semaphore>`-bounded
dispatch pattern the workflow extension's engine uses for its worker pool,
applied here per subscriber so one slow subscriber's backlog never blocks
publishers or its siblings.
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::instance::{EventType, WorkflowEvent};

/// Implemented by anything that wants to observe workflow events.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    async fn on_event(&self, event: WorkflowEvent);

    /// Event types this subscriber cares about. Queried once at
    /// `subscribe` time and cached; events outside this set are never
    /// delivered to the subscriber.
    fn interested_types(&self) -> Vec<EventType>;

    /// Human-readable name used in logs when delivery is dropped.
    fn name(&self) -> &str {
        "subscriber"
    }
}

struct Subscription {
    subscriber: Arc<dyn EventSubscriber>,
    /// Bounds how many deliveries to this subscriber may be in flight at
    /// once; a full semaphore means the subscriber is falling behind and
    /// the event is dropped rather than queued unboundedly.
    permits: Arc<Semaphore>,
}

/// Publishes `WorkflowEvent`s to every subscriber interested in their
/// type, without ever blocking the publisher. Internally backed by an
/// mpsc channel consumed by a single dispatch task; fan-out to
/// subscribers happens concurrently, each bounded by its own semaphore.
pub struct EventBus {
    sender: mpsc::Sender<WorkflowEvent>,
    dispatcher: tokio::task::JoinHandle<()>,
    dropped: Arc<AtomicU64>,
    /// Tracks every in-flight per-subscriber notification task so
    /// `shutdown` can wait for them instead of abandoning them
    /// mid-delivery.
    notifications: Arc<Mutex<JoinSet<()>>>,
}

struct DispatchState {
    /// event type -> subscriptions interested in it.
    by_type: HashMap<EventType, Vec<Subscription>>,
}

impl EventBus {
    /// `buffer_size` bounds the publish-side channel; per-subscriber
    /// fan-out is capped at `min(buffer_size, 100)` in-flight deliveries.
    pub fn new(buffer_size: usize) -> (Self, EventBusHandle) {
        let (sender, receiver) = mpsc::channel(buffer_size.max(1));
        let dropped = Arc::new(AtomicU64::new(0));
        let state = Arc::new(tokio::sync::Mutex::new(DispatchState {
            by_type: HashMap::new(),
        }));
        let fan_out_cap = buffer_size.max(1).min(100);
        let notifications = Arc::new(Mutex::new(JoinSet::new()));

        let dispatcher = tokio::spawn(Self::run(
            receiver,
            state.clone(),
            dropped.clone(),
            notifications.clone(),
        ));

        let handle = EventBusHandle {
            state,
            fan_out_cap,
        };
        (
            Self {
                sender,
                dispatcher,
                dropped,
                notifications,
            },
            handle,
        )
    }

    async fn run(
        mut receiver: mpsc::Receiver<WorkflowEvent>,
        state: Arc<tokio::sync::Mutex<DispatchState>>,
        dropped: Arc<AtomicU64>,
        notifications: Arc<Mutex<JoinSet<()>>>,
    ) {
        while let Some(event) = receiver.recv().await {
            let matching = {
                let guard = state.lock().await;
                guard
                    .by_type
                    .get(&event.event_type)
                    .map(|subs| {
                        subs.iter()
                            .map(|s| (s.subscriber.clone(), s.permits.clone()))
                            .collect::<Vec<_>>()
                    })
                    .unwrap_or_default()
            };

            for (subscriber, permits) in matching {
                let event = event.clone();
                match permits.clone().try_acquire_owned() {
                    Ok(permit) => {
                        let mut notifications = notifications.lock().await;
                        notifications.spawn(async move {
                            subscriber.on_event(event).await;
                            drop(permit);
                        });
                    }
                    Err(_) => {
                        dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            subscriber = subscriber.name(),
                            event_type = event.event_type.as_str(),
                            "dropping event: subscriber is saturated"
                        );
                    }
                }
            }
        }
        debug!("event bus dispatcher shutting down");
    }

    /// Publishes an event. Never blocks: if the internal channel is full
    /// the event is dropped and counted, exactly as a saturated
    /// subscriber's delivery is dropped and counted.
    pub async fn publish(&self, event: WorkflowEvent) {
        if let Err(e) = self.sender.try_send(event) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            match e {
                mpsc::error::TrySendError::Full(_) => {
                    warn!("event bus queue full; event dropped");
                }
                mpsc::error::TrySendError::Closed(_) => {
                    debug!("event bus shutting down; event dropped");
                }
            }
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Closes the publish channel, waits for the dispatcher to drain
    /// whatever was already queued, then waits for every notification
    /// task the dispatcher spawned along the way — so no subscriber
    /// delivery is still running once this returns.
    pub async fn shutdown(self) {
        drop(self.sender);
        let _ = self.dispatcher.await;

        let mut notifications = self.notifications.lock().await;
        while notifications.join_next().await.is_some() {}
    }
}

/// Handle used to register/unregister subscribers independently of the
/// publishing side, so the bus can be cloned-by-handle into components
/// that only need to subscribe.
#[derive(Clone)]
pub struct EventBusHandle {
    state: Arc<tokio::sync::Mutex<DispatchState>>,
    fan_out_cap: usize,
}

impl EventBusHandle {
    /// Registers `subscriber` under every type in its `interested_types()`.
    /// Idempotency is not required: subscribing the same subscriber twice
    /// delivers events to it twice.
    pub async fn subscribe(&self, subscriber: Arc<dyn EventSubscriber>) {
        let mut guard = self.state.lock().await;
        for event_type in subscriber.interested_types() {
            guard
                .by_type
                .entry(event_type)
                .or_default()
                .push(Subscription {
                    subscriber: subscriber.clone(),
                    permits: Arc::new(Semaphore::new(self.fan_out_cap)),
                });
        }
    }

    /// Removes the first occurrence of `subscriber` from each interest
    /// list it was registered under.
    pub async fn unsubscribe(&self, subscriber: &Arc<dyn EventSubscriber>) {
        let mut guard = self.state.lock().await;
        for subs in guard.by_type.values_mut() {
            if let Some(pos) = subs.iter().position(|s| Arc::ptr_eq(&s.subscriber, subscriber)) {
                subs.remove(pos);
            }
        }
    }

    /// Count of distinct registrations across all event types (a
    /// subscriber interested in three types counts three times here).
    pub async fn subscriber_count(&self) -> usize {
        self.state.lock().await.by_type.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct CountingSubscriber {
        count: Arc<AtomicUsize>,
        interests: Vec<EventType>,
    }

    #[async_trait]
    impl EventSubscriber for CountingSubscriber {
        async fn on_event(&self, _event: WorkflowEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }

        fn interested_types(&self) -> Vec<EventType> {
            self.interests.clone()
        }
    }

    #[tokio::test]
    async fn delivers_to_interested_subscribers() {
        let (bus, handle) = EventBus::new(16);
        let count = Arc::new(AtomicUsize::new(0));
        handle
            .subscribe(Arc::new(CountingSubscriber {
                count: count.clone(),
                interests: vec![EventType::WorkflowStarted],
            }))
            .await;

        bus.publish(WorkflowEvent::new(EventType::WorkflowStarted, "wf-1")).await;
        bus.publish(WorkflowEvent::new(EventType::WorkflowCompleted, "wf-1")).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn uninterested_subscriber_never_notified() {
        let (bus, handle) = EventBus::new(16);
        let count = Arc::new(AtomicUsize::new(0));
        handle
            .subscribe(Arc::new(CountingSubscriber {
                count: count.clone(),
                interests: vec![EventType::StageFailed],
            }))
            .await;

        bus.publish(WorkflowEvent::new(EventType::WorkflowStarted, "wf-1")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let (bus, handle) = EventBus::new(16);
        let count = Arc::new(AtomicUsize::new(0));
        let subscriber: Arc<dyn EventSubscriber> = Arc::new(CountingSubscriber {
            count: count.clone(),
            interests: vec![EventType::WorkflowStarted],
        });
        handle.subscribe(subscriber.clone()).await;
        handle.unsubscribe(&subscriber).await;

        bus.publish(WorkflowEvent::new(EventType::WorkflowStarted, "wf-1")).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn publish_never_blocks_when_queue_is_full() {
        let (bus, _handle) = EventBus::new(1);
        // No subscribers; the dispatcher drains the channel quickly, but
        // even if it couldn't, `try_send` returning `Full` must not block
        // the caller.
        for _ in 0..50 {
            bus.publish(WorkflowEvent::new(EventType::ProgressUpdated, "wf-1")).await;
        }
    }

    #[tokio::test]
    async fn subscriber_count_reflects_registrations() {
        let (_bus, handle) = EventBus::new(4);
        assert_eq!(handle.subscriber_count().await, 0);
        handle
            .subscribe(Arc::new(CountingSubscriber {
                count: Arc::new(AtomicUsize::new(0)),
                interests: vec![EventType::WorkflowStarted, EventType::WorkflowCompleted],
            }))
            .await;
        assert_eq!(handle.subscriber_count().await, 2);
    }
}
