//! Event bus - ordered delivery of lifecycle events to a single sink
//!
//! Publishing never blocks on the sink: events are stamped with a sequence
//! number and queued for a dedicated delivery task. Subscribe and unsubscribe
//! travel through the same queue, so a sink sees exactly the events published
//! between its own subscribe and the next one, with no gaps.

use crate::error::CoreError;
use dlsession_types::Event;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Destination for delivered events
pub trait EventSink: Send + 'static {
    fn deliver(&mut self, event: Event);
}

impl EventSink for mpsc::UnboundedSender<Event> {
    fn deliver(&mut self, event: Event) {
        // Receiver gone: behaves like an absent sink
        let _ = self.send(event);
    }
}

/// Adapts a closure into an [`EventSink`]
pub struct FnSink<F>(pub F);

impl<F> EventSink for FnSink<F>
where
    F: FnMut(Event) + Send + 'static,
{
    fn deliver(&mut self, event: Event) {
        (self.0)(event)
    }
}

/// Identifies one subscription in logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

enum BusMessage {
    Event(Event),
    Subscribe(SubscriptionId, Box<dyn EventSink>),
    Unsubscribe,
}

struct Publisher {
    next_sequence: u64,
    next_subscription: u64,
    tx: mpsc::UnboundedSender<BusMessage>,
}

/// Single-sink event bus
#[derive(Clone)]
pub struct EventBus {
    publisher: Arc<Mutex<Publisher>>,
}

impl EventBus {
    /// Spawn the delivery task on the current tokio runtime
    pub fn new(shutdown: CancellationToken) -> Result<Self, CoreError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| CoreError::Init(format!("event bus needs a tokio runtime: {}", e)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        runtime.spawn(deliver_events(rx, shutdown));

        Ok(Self {
            publisher: Arc::new(Mutex::new(Publisher {
                next_sequence: 0,
                next_subscription: 0,
                tx,
            })),
        })
    }

    /// Replace the current sink with `sink`
    pub fn subscribe(&self, sink: impl EventSink) -> SubscriptionId {
        let mut publisher = self.publisher.lock();
        publisher.next_subscription += 1;
        let id = SubscriptionId(publisher.next_subscription);
        let _ = publisher.tx.send(BusMessage::Subscribe(id, Box::new(sink)));
        id
    }

    /// Subscribe a fresh channel and hand back its receiving end
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (self.subscribe(tx), rx)
    }

    /// Drop the current sink; later events are discarded until the next
    /// subscribe
    pub fn unsubscribe(&self) {
        let _ = self.publisher.lock().tx.send(BusMessage::Unsubscribe);
    }

    /// Stamp `event` with the next sequence number and queue it.
    ///
    /// Returns the stamped sequence.
    pub fn publish(&self, mut event: Event) -> u64 {
        let mut publisher = self.publisher.lock();
        publisher.next_sequence += 1;
        event.sequence = publisher.next_sequence;
        let sequence = event.sequence;
        if publisher.tx.send(BusMessage::Event(event)).is_err() {
            debug!(sequence, "Event bus stopped, dropping event");
        }
        sequence
    }
}

async fn deliver_events(mut rx: mpsc::UnboundedReceiver<BusMessage>, shutdown: CancellationToken) {
    let mut sink: Option<(SubscriptionId, Box<dyn EventSink>)> = None;

    loop {
        let message = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            message = rx.recv() => message,
        };
        let Some(message) = message else {
            break;
        };

        match message {
            BusMessage::Event(event) => match sink.as_mut() {
                Some((_, sink)) => sink.deliver(event),
                None => debug!(sequence = event.sequence, gid = %event.gid, "No subscriber, event dropped"),
            },
            BusMessage::Subscribe(id, new_sink) => {
                if let Some((old, _)) = sink.replace((id, new_sink)) {
                    info!(%old, new = %id, "Event sink replaced");
                } else {
                    info!(%id, "Event sink subscribed");
                }
            }
            BusMessage::Unsubscribe => {
                if let Some((id, _)) = sink.take() {
                    info!(%id, "Event sink unsubscribed");
                }
            }
        }
    }

    debug!("Event delivery stopped");
}
