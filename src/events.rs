//! Typed publish/subscribe for emulator output and lifecycle signals.

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use crate::logs::{LogRecord, Stream};
use crate::network::EmulatorPorts;

/// Event published by the supervisor and its stream readers.
#[derive(Clone, Debug, PartialEq)]
pub enum EmulatorEvent {
    /// Every parsed record
    Message {
        /// Origin stream
        stream: Stream,
        /// Parsed record
        record: LogRecord,
    },
    /// Unwrapped text of a user `log()` call
    Log {
        /// Origin stream
        stream: Stream,
        /// Unwrapped text
        text: String,
    },
    /// The readiness probe succeeded
    Ready {
        /// Ports the emulator is serving on
        ports: EmulatorPorts,
    },
    /// An error-level record was read from stderr
    Error {
        /// The offending record
        record: LogRecord,
    },
    /// The process exited
    Exited {
        /// Exit code, `None` when killed by a signal
        code: Option<i32>,
        /// `true` when the exit was requested through `stop`
        requested: bool,
    },
}

/// Discriminant of [`EmulatorEvent`] used to select subscriptions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`EmulatorEvent::Message`]
    Message,
    /// [`EmulatorEvent::Log`]
    Log,
    /// [`EmulatorEvent::Ready`]
    Ready,
    /// [`EmulatorEvent::Error`]
    Error,
    /// [`EmulatorEvent::Exited`]
    Exited,
}

impl EmulatorEvent {
    /// Kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Message { .. } => EventKind::Message,
            Self::Log { .. } => EventKind::Log,
            Self::Ready { .. } => EventKind::Ready,
            Self::Error { .. } => EventKind::Error,
            Self::Exited { .. } => EventKind::Exited,
        }
    }
}

/// Default number of events buffered per subscriber.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast point shared by every producer. Cloning shares the same channel.
#[derive(Clone, Debug)]
pub struct EventChannel {
    sender: broadcast::Sender<EmulatorEvent>,
}

impl EventChannel {
    /// Creates a channel buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes to all current subscribers. Events with no subscriber are dropped.
    pub fn publish(&self, event: EmulatorEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribes to the given kinds. An empty slice subscribes to everything.
    pub fn subscribe(&self, kinds: &[EventKind]) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            kinds: kinds.to_vec(),
        }
    }

    /// Subscribes to every event.
    pub fn subscribe_all(&self) -> Subscription {
        self.subscribe(&[])
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

/// A live subscription. Dropping it, or calling [`Subscription::unsubscribe`], detaches it
/// without affecting other subscribers.
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<EmulatorEvent>,
    kinds: Vec<EventKind>,
}

impl Subscription {
    fn wants(&self, event: &EmulatorEvent) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&event.kind())
    }

    /// Waits for the next matching event. Returns `None` once the channel is closed.
    pub async fn recv(&mut self) -> Option<EmulatorEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Returns the next matching event already buffered, if any.
    pub fn try_recv(&mut self) -> Option<EmulatorEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) if self.wants(&event) => return Some(event),
                Ok(_) => {}
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged, events dropped");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    /// Drains every matching event already buffered.
    pub fn drain(&mut self) -> Vec<EmulatorEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Detaches the subscription.
    pub fn unsubscribe(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logs::LogLevel;

    fn message(text: &str) -> EmulatorEvent {
        EmulatorEvent::Message {
            stream: Stream::Stdout,
            record: LogRecord::new(LogLevel::Info, text),
        }
    }

    #[test]
    fn kinds_are_filtered() {
        let channel = EventChannel::default();
        let mut exits = channel.subscribe(&[EventKind::Exited]);
        let mut all = channel.subscribe_all();

        channel.publish(message("a"));
        channel.publish(EmulatorEvent::Exited {
            code: Some(0),
            requested: true,
        });

        assert_eq!(
            exits.drain(),
            vec![EmulatorEvent::Exited {
                code: Some(0),
                requested: true
            }]
        );
        assert_eq!(all.drain().len(), 2);
    }

    #[test]
    fn unsubscribe_leaves_others() {
        let channel = EventChannel::default();
        let first = channel.subscribe_all();
        let mut second = channel.subscribe_all();
        assert_eq!(channel.subscriber_count(), 2);

        first.unsubscribe();
        assert_eq!(channel.subscriber_count(), 1);

        channel.publish(message("still here"));
        assert_eq!(second.drain(), vec![message("still here")]);
    }

    #[test]
    fn lagged_subscriber_keeps_receiving() {
        let channel = EventChannel::new(2);
        let mut sub = channel.subscribe_all();
        for i in 0..5 {
            channel.publish(message(&i.to_string()));
        }

        assert_eq!(sub.drain(), vec![message("3"), message("4")]);
    }

    #[tokio::test]
    async fn recv_waits_for_matching() {
        let channel = EventChannel::default();
        let mut sub = channel.subscribe(&[EventKind::Log]);

        let producer = channel.clone();
        tokio::spawn(async move {
            producer.publish(message("skip"));
            producer.publish(EmulatorEvent::Log {
                stream: Stream::Stdout,
                text: "hi".to_string(),
            });
        });

        assert_eq!(
            sub.recv().await,
            Some(EmulatorEvent::Log {
                stream: Stream::Stdout,
                text: "hi".to_string()
            })
        );
    }
}
