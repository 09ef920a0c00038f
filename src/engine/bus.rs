//! In-process transport queue for [`Signal`]s.
//!
//! The bus is split into a cloneable emitting half ([`SignalBus`]) and a single
//! consuming half ([`SignalReceiver`]). It does no routing: every emitted signal is
//! delivered once, in order, to whoever holds the receiver (the dispatcher).
//!
//! Durable signals are appended to the event log *before* they are enqueued, so an
//! auditor never sees a delivered signal that was not recorded.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::storage::{StoreError, TaskStore};
use crate::types::names::EVENT_SIGNAL_EMITTED;
use crate::types::{Payload, Signal};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("signal bus closed")]
    Closed,

    #[error("failed to persist durable signal: {0}")]
    Persist(#[from] StoreError),
}

#[derive(Clone)]
pub struct SignalBus {
    tx: mpsc::UnboundedSender<Signal>,
    event_log: Option<Arc<dyn TaskStore>>,
}

pub struct SignalReceiver {
    rx: mpsc::UnboundedReceiver<Signal>,
    closed: bool,
}

impl SignalBus {
    /// Creates a bus. Durable signals are persisted to `event_log` when one is given.
    pub fn new(event_log: Option<Arc<dyn TaskStore>>) -> (Self, SignalReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self { tx, event_log },
            SignalReceiver { rx, closed: false },
        )
    }

    /// Enqueues a signal. Never waits on the consumer.
    pub async fn emit(&self, signal: Signal) -> Result<(), BusError> {
        if self.tx.is_closed() {
            return Err(BusError::Closed);
        }

        if signal.is_durable() {
            if let Some(event_log) = &self.event_log {
                let mut payload = Payload::new();
                payload.insert("signal_id".into(), json!(signal.id().to_string()));
                payload.insert("signal_type".into(), json!(signal.signal_type()));
                payload.insert("source".into(), json!(signal.source()));
                payload.insert("payload".into(), Value::Object(signal.payload().clone()));

                event_log
                    .append_event(
                        signal.payload_str("task_id"),
                        EVENT_SIGNAL_EMITTED,
                        payload,
                        Some(signal.correlation_id()),
                    )
                    .await?;
            }
        }

        log::debug!(
            "emit signal type={} id={} correlation_id={}",
            signal.signal_type(),
            signal.id(),
            signal.correlation_id()
        );
        self.tx.send(signal).map_err(|_| BusError::Closed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl SignalReceiver {
    /// Waits up to `timeout` for the next signal. `None` on timeout, or once every
    /// emitter is gone and the queue is drained (see [`SignalReceiver::is_closed`]).
    pub async fn receive(&mut self, timeout: Duration) -> Option<Signal> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(signal)) => Some(signal),
            Ok(None) => {
                self.closed = true;
                None
            }
            Err(_) => None,
        }
    }

    pub fn try_receive(&mut self) -> Option<Signal> {
        self.rx.try_recv().ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryTaskStore;
    use chrono::Utc;

    #[tokio::test]
    async fn test_emit_then_receive_in_order() {
        let (bus, mut rx) = SignalBus::new(None);

        bus.emit(Signal::new("a")).await.unwrap();
        bus.emit(Signal::new("b")).await.unwrap();
        assert_eq!(rx.len(), 2);

        let first = rx.receive(Duration::from_millis(50)).await.unwrap();
        let second = rx.receive(Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.signal_type(), "a");
        assert_eq!(second.signal_type(), "b");
        assert!(rx.is_empty());
    }

    #[tokio::test]
    async fn test_receive_times_out() {
        let (_bus, mut rx) = SignalBus::new(None);

        let received = rx.receive(Duration::from_millis(10)).await;
        assert!(received.is_none());
        assert!(!rx.is_closed());
    }

    #[tokio::test]
    async fn test_receiver_observes_closed_bus() {
        let (bus, mut rx) = SignalBus::new(None);
        bus.emit(Signal::new("last")).await.unwrap();
        drop(bus);

        assert!(rx.receive(Duration::from_millis(10)).await.is_some());
        assert!(rx.receive(Duration::from_millis(10)).await.is_none());
        assert!(rx.is_closed());
    }

    #[tokio::test]
    async fn test_emit_after_receiver_dropped_fails() {
        let (bus, rx) = SignalBus::new(None);
        drop(rx);

        assert!(bus.is_closed());
        assert!(matches!(
            bus.emit(Signal::new("lost")).await,
            Err(BusError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_cloned_emitters_share_queue() {
        let (bus, mut rx) = SignalBus::new(None);
        let other = bus.clone();

        bus.emit(Signal::new("from-one")).await.unwrap();
        other.emit(Signal::new("from-two")).await.unwrap();

        assert_eq!(rx.try_receive().unwrap().signal_type(), "from-one");
        assert_eq!(rx.try_receive().unwrap().signal_type(), "from-two");
        assert!(rx.try_receive().is_none());
    }

    #[tokio::test]
    async fn test_durable_signal_is_logged_before_delivery() {
        let store = Arc::new(InMemoryTaskStore::new());
        let (bus, mut rx) = SignalBus::new(Some(store.clone() as Arc<dyn TaskStore>));
        let since = Utc::now() - chrono::Duration::seconds(1);

        let signal = Signal::new("pdca.slice.requested")
            .with_field("task_id", "t-9")
            .with_correlation_id("corr-9")
            .durable();
        bus.emit(signal).await.unwrap();
        bus.emit(Signal::new("ephemeral")).await.unwrap();

        let events = store.list_events_since(since).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EVENT_SIGNAL_EMITTED);
        assert_eq!(events[0].task_id.as_deref(), Some("t-9"));
        assert_eq!(events[0].correlation_id.as_deref(), Some("corr-9"));
        assert_eq!(events[0].payload_str("signal_type"), Some("pdca.slice.requested"));

        assert_eq!(rx.len(), 2);
    }
}
