//! Event delivery to UI and control collaborators
//!
//! Two delivery styles share one bus:
//! - `subscribe()` hands out a broadcast receiver, the caller picks the task
//!   or thread that drains it
//! - `add_observer()` registers a callback invoked synchronously on the
//!   worker that emits the event

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use swarmsync_types::TransferEvent;
use tokio::sync::broadcast;

/// Receives transfer events synchronously
pub trait TransferObserver: Send + Sync {
    fn on_event(&self, event: &TransferEvent);
}

impl<F> TransferObserver for F
where
    F: Fn(&TransferEvent) + Send + Sync,
{
    fn on_event(&self, event: &TransferEvent) {
        self(event)
    }
}

/// Handle returned by `EventBus::add_observer`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TransferEvent>,
    observers: Arc<RwLock<Vec<(ObserverId, Arc<dyn TransferObserver>)>>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            observers: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.tx.subscribe()
    }

    pub fn add_observer(&self, observer: Arc<dyn TransferObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((id, observer));
        id
    }

    /// Returns false when the observer was not registered
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(oid, _)| *oid != id);
        observers.len() != before
    }

    pub fn emit(&self, event: TransferEvent) {
        // Snapshot so observers may (un)register from inside a callback
        let observers: Vec<_> = self
            .observers
            .read()
            .iter()
            .map(|(_, o)| Arc::clone(o))
            .collect();
        for observer in observers {
            observer.on_event(&event);
        }
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use uuid::Uuid;

    #[test]
    fn test_observer_registration() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = bus.add_observer(Arc::new(move |e: &TransferEvent| {
            sink.lock().push(e.transfer_id());
        }));

        let first = Uuid::new_v4();
        bus.emit(TransferEvent::Queued { id: first });
        assert!(bus.remove_observer(id));
        assert!(!bus.remove_observer(id));
        bus.emit(TransferEvent::Started { id: first });

        assert_eq!(*seen.lock(), vec![Some(first)]);
    }

    #[tokio::test]
    async fn test_subscribers_receive_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let id = Uuid::new_v4();
        bus.emit(TransferEvent::Completed { id });

        match rx.recv().await.unwrap() {
            TransferEvent::Completed { id: got } => assert_eq!(got, id),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
