//! Multi-subscriber event broadcast.
//!
//! Every subscription owns an unbounded, ordered channel. Emitting never
//! waits for consumers; a slow subscriber only grows its own queue.

use futures::stream::{self, Stream};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Subscriber<T> {
    id: u64,
    sender: mpsc::UnboundedSender<T>,
    cancel: CancellationToken,
}

struct BusState<T> {
    subscribers: Vec<Subscriber<T>>,
    next_id: u64,
    closed: bool,
}

/// Broadcasts events to any number of independently cancellable listeners.
///
/// Cloning the bus yields another handle to the same set of subscribers.
pub struct EventBus<T> {
    state: Arc<Mutex<BusState<T>>>,
}

impl<T> Clone for EventBus<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Clone + Send + 'static> EventBus<T> {
    /// Creates a bus without subscribers.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                subscribers: Vec::new(),
                next_id: 0,
                closed: false,
            })),
        }
    }

    /// Subscribes to every event emitted from now on.
    pub fn subscribe(&self) -> EventStream<T> {
        self.subscribe_with_cancel(CancellationToken::new())
    }

    /// Subscribes with an externally owned cancellation token.
    ///
    /// The stream ends once `cancel` fires, even if events are still queued.
    pub fn subscribe_with_cancel(&self, cancel: CancellationToken) -> EventStream<T> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;

        // A closed bus hands out streams that end immediately.
        if !state.closed {
            state.subscribers.push(Subscriber {
                id,
                sender,
                cancel: cancel.clone(),
            });
        }

        EventStream {
            id,
            receiver,
            cancel,
        }
    }

    /// Delivers `event` to every live subscriber. Returns how many received it.
    pub fn emit(&self, event: T) -> usize {
        let mut state = self.state.lock();
        state
            .subscribers
            .retain(|s| !s.cancel.is_cancelled() && !s.sender.is_closed());
        for subscriber in &state.subscribers {
            let _ = subscriber.sender.send(event.clone());
        }
        state.subscribers.len()
    }

    /// Detaches the subscription with `id`, completing its stream once the
    /// queued events are consumed. Returns false for unknown ids.
    pub fn detach(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        let before = state.subscribers.len();
        state.subscribers.retain(|s| s.id != id);
        state.subscribers.len() != before
    }

    /// Completes and detaches every subscriber. Later emits are dropped.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.subscribers.clear();
    }

    /// Returns true once [`EventBus::close`] was called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock();
        state
            .subscribers
            .retain(|s| !s.cancel.is_cancelled() && !s.sender.is_closed());
        state.subscribers.len()
    }
}

impl<T: Clone + Send + 'static> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One subscription to an [`EventBus`].
pub struct EventStream<T> {
    id: u64,
    receiver: mpsc::UnboundedReceiver<T>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> EventStream<T> {
    /// Id of the subscription, unique per bus.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next event.
    ///
    /// Returns `None` once the subscription is cancelled or the bus is closed.
    pub async fn next(&mut self) -> Option<T> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.receiver.recv() => event,
        }
    }

    /// Returns an already queued event without waiting.
    pub fn try_next(&mut self) -> Option<T> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.receiver.try_recv().ok()
    }

    /// Cancels the subscription. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Converts the subscription into a [`Stream`].
    pub fn into_stream(self) -> impl Stream<Item = T> + Send {
        stream::unfold(self, |mut events| async move {
            events.next().await.map(|event| (event, events))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        assert_eq!(bus.emit(1), 2);
        assert_eq!(bus.emit(2), 2);

        assert_eq!(first.next().await, Some(1));
        assert_eq!(first.next().await, Some(2));
        assert_eq!(second.next().await, Some(1));
        assert_eq!(second.next().await, Some(2));
    }

    #[tokio::test]
    async fn late_subscriber_misses_earlier_events() {
        let bus = EventBus::new();
        bus.emit("early");
        let mut late = bus.subscribe();
        bus.emit("late");
        assert_eq!(late.next().await, Some("late"));
        assert_eq!(late.try_next(), None);
    }

    #[tokio::test]
    async fn cancelled_subscriber_stops_and_is_detached() {
        let bus = EventBus::new();
        let mut stream = bus.subscribe();
        let other = bus.subscribe();

        bus.emit(1);
        stream.cancel();
        stream.cancel();
        assert_eq!(stream.next().await, None);
        assert_eq!(bus.emit(2), 1);
        drop(other);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn detached_subscriber_drains_then_ends() {
        let bus = EventBus::new();
        let mut detached = bus.subscribe();
        let mut kept = bus.subscribe();

        bus.emit("queued");
        assert!(bus.detach(detached.id()));
        assert!(!bus.detach(detached.id()));
        assert_eq!(bus.emit("after"), 1);

        assert_eq!(detached.next().await, Some("queued"));
        assert_eq!(detached.next().await, None);
        assert_eq!(kept.next().await, Some("queued"));
        assert_eq!(kept.next().await, Some("after"));
    }

    #[tokio::test]
    async fn close_completes_all_subscribers() {
        let bus: EventBus<u32> = EventBus::new();
        let mut stream = bus.subscribe();
        bus.close();

        assert!(bus.is_closed());
        assert_eq!(stream.next().await, None);
        assert_eq!(bus.emit(5), 0);

        let mut after_close = bus.subscribe();
        assert_eq!(after_close.next().await, None);
    }

    #[tokio::test]
    async fn emit_does_not_wait_for_consumers() {
        let bus = EventBus::new();
        let stream = bus.subscribe();
        for i in 0..10_000 {
            bus.emit(i);
        }
        let collected: Vec<_> = stream.into_stream().take(10_000).collect().await;
        assert_eq!(collected.len(), 10_000);
        assert_eq!(collected[9_999], 9_999);
    }
}
