//! Change streams for async cell consumers.
//!
//! Callback subscribers get synchronous replay-then-broadcast delivery;
//! streams are the async complement. Each cell feeds one broadcast channel,
//! and [`WatchStream`] yields every accepted mutation's `(value, previous)`
//! pair from subscription time onward. Slow consumers skip lagged events
//! rather than blocking the cell.

use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::Stream;

/// One accepted mutation's resulting pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent<T> {
    /// The value after the mutation.
    pub value: T,
    /// The value immediately before the mutation.
    pub previous: Option<T>,
}

/// A stream of change events for one cell.
pub struct WatchStream<T> {
    receiver: broadcast::Receiver<ChangeEvent<T>>,
}

impl<T: Clone> WatchStream<T> {
    fn new(receiver: broadcast::Receiver<ChangeEvent<T>>) -> Self {
        Self { receiver }
    }
}

impl<T: Clone + Send + 'static> Stream for WatchStream<T> {
    type Item = ChangeEvent<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Poll::Ready(Some(event)),
                Err(broadcast::error::TryRecvError::Empty) => {
                    // Register waker and return pending
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
                Err(broadcast::error::TryRecvError::Closed) => {
                    return Poll::Ready(None);
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => {
                    // Skip lagged events
                    continue;
                }
            }
        }
    }
}

/// Handle for publishing change events to stream subscribers.
pub struct WatchSender<T> {
    sender: broadcast::Sender<ChangeEvent<T>>,
}

impl<T: Clone + Send + 'static> WatchSender<T> {
    /// Create a new sender with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all stream subscribers.
    pub fn send(&self, value: T, previous: Option<T>) {
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(ChangeEvent { value, previous });
    }

    /// Open a stream of subsequent events.
    pub fn subscribe(&self) -> WatchStream<T> {
        WatchStream::new(self.sender.subscribe())
    }

    /// Get the number of current stream subscribers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T: Clone + Send + 'static> Default for WatchSender<T> {
    fn default() -> Self {
        Self::new(64)
    }
}
