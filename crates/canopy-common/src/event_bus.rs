//! A multi-subscriber event bus, used to notify other modules about things like new headers
//! or peers connecting.
//!
//! Every subscriber gets its own unbounded channel, so a slow consumer never blocks the
//! producer or the other subscribers. Events reach each subscriber in the order they were
//! published. Dropping a [Subscription] or calling [EventBus::unsubscribe] stops delivery.

use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;

use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::UnboundedSender;

/// Fans out events of type `T` to every live subscriber.
///
/// # Example
/// ```
/// use canopy_common::EventBus;
///
/// let bus = EventBus::new();
/// let mut subscription = bus.subscribe();
///
/// bus.publish(1);
/// bus.publish(2);
///
/// assert_eq!(subscription.try_recv(), Some(1));
/// assert_eq!(subscription.try_recv(), Some(2));
/// assert_eq!(subscription.try_recv(), None);
/// ```
#[derive(Debug)]
pub struct EventBus<T> {
    subscribers: spin::Mutex<Vec<(u64, UnboundedSender<T>)>>,
    next_id: AtomicU64,
}

/// The receiving end of an [EventBus].
#[derive(Debug)]
pub struct Subscription<T> {
    id: u64,
    receiver: UnboundedReceiver<T>,
}

impl<T> Default for EventBus<T> {
    fn default() -> Self {
        EventBus {
            subscribers: spin::Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new subscriber. It will only see events published after this call.
    pub fn subscribe(&self) -> Subscription<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = unbounded_channel();
        self.subscribers.lock().push((id, sender));

        Subscription { id, receiver }
    }

    /// Removes a subscriber. Returns false if there was no such subscriber.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let mut subscribers = self.subscribers.lock();
        let before = subscribers.len();
        subscribers.retain(|(subscriber, _)| *subscriber != id);

        subscribers.len() != before
    }

    /// Sends `event` to every subscriber, returning how many of them got it. Subscribers whose
    /// receiving end was dropped are removed here.
    pub fn publish(&self, event: T) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|(_, sender)| sender.send(event.clone()).is_ok());

        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl<T> Subscription<T> {
    /// The id to pass to [EventBus::unsubscribe]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the next event. Returns `None` once the subscription was removed from the bus,
    /// or the bus itself was dropped, and every pending event was consumed.
    pub async fn recv(&mut self) -> Option<T> {
        self.receiver.recv().await
    }

    /// Returns the next pending event without waiting.
    pub fn try_recv(&mut self) -> Option<T> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}
