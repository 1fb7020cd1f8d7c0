//! Change-notification channel abstraction.
//!
//! Notifications are wake-up hints, not a message queue: delivery is
//! at-least-once and coalesced, and consumers must always re-poll the
//! durable log instead of trusting the payload. The store's append path
//! notifies [`EVENT_CHANNEL`] after each commit; the saga poller and the
//! synchronous facade listen on it.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::trace;

/// Channel notified after every successful event-store append.
pub const EVENT_CHANNEL: &str = "event";

/// Result type for notification operations.
pub type Result<T> = std::result::Result<T, NotifyError>;

/// Errors from the notification channel.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("listener is closed")]
    Closed,
}

/// A single notification.
#[derive(Debug, Clone)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

/// Sends notifications on a named channel.
pub trait Notifier: Send + Sync {
    fn notify(&self, channel: &str, payload: &str) -> Result<()>;
}

/// Receives notifications for subscribed channels.
#[async_trait]
pub trait Listener: Send {
    /// Subscribe to a channel. May be called multiple times.
    fn listen(&mut self, channel: &str) -> Result<()>;

    /// Wait for the next notification on a subscribed channel.
    ///
    /// Returns None once the listener is closed. A lagged receiver yields a
    /// coalesced wake-up rather than an error; callers re-poll the log on
    /// every wake-up, so missed payloads are harmless.
    async fn recv(&mut self) -> Option<Notification>;

    /// Liveness check, called periodically while idle.
    fn ping(&self) -> Result<()>;

    /// Unsubscribe from everything and stop receiving.
    fn close(&mut self);
}

/// Creates listeners bound to one notification medium.
pub trait ListenerFactory: Send + Sync {
    fn new_listener(&self) -> Box<dyn Listener>;
}

/// In-process broker over a tokio broadcast channel.
///
/// Implements both the notifier and the listener factory so a single
/// instance wires the store to every consumer in the process.
pub struct LocalBroker {
    tx: broadcast::Sender<Notification>,
}

impl LocalBroker {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(1024);
        Arc::new(Self { tx })
    }
}

impl Notifier for LocalBroker {
    fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        trace!(channel, "notify");
        // No receivers is fine: notifications are hints, not deliveries.
        let _ = self.tx.send(Notification {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }
}

impl ListenerFactory for LocalBroker {
    fn new_listener(&self) -> Box<dyn Listener> {
        Box::new(LocalListener {
            rx: Some(self.tx.subscribe()),
            channels: HashSet::new(),
        })
    }
}

/// Listener over the local broker.
pub struct LocalListener {
    rx: Option<broadcast::Receiver<Notification>>,
    channels: HashSet<String>,
}

#[async_trait]
impl Listener for LocalListener {
    fn listen(&mut self, channel: &str) -> Result<()> {
        if self.rx.is_none() {
            return Err(NotifyError::Closed);
        }
        self.channels.insert(channel.to_string());
        Ok(())
    }

    async fn recv(&mut self) -> Option<Notification> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(n) if self.channels.contains(&n.channel) => return Some(n),
                Ok(_) => continue,
                // Coalesced wake-up: the consumer re-polls the log anyway.
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    return Some(Notification {
                        channel: String::new(),
                        payload: String::new(),
                    })
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn ping(&self) -> Result<()> {
        if self.rx.is_none() {
            return Err(NotifyError::Closed);
        }
        Ok(())
    }

    fn close(&mut self) {
        self.rx = None;
        self.channels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_only_subscribed_channels() {
        let broker = LocalBroker::new();
        let mut listener = broker.new_listener();
        listener.listen("event").unwrap();

        broker.notify("other", "x").unwrap();
        broker.notify("event", "y").unwrap();

        let n = listener.recv().await.unwrap();
        assert_eq!(n.channel, "event");
        assert_eq!(n.payload, "y");
    }

    #[tokio::test]
    async fn closed_listener_stops_receiving() {
        let broker = LocalBroker::new();
        let mut listener = broker.new_listener();
        listener.listen("event").unwrap();
        listener.close();

        assert!(listener.ping().is_err());
        assert!(listener.recv().await.is_none());
    }
}
