//! Event-handler runtime.
//!
//! An event handler is a poller over the durable log: it resumes from its
//! persisted progress marker, processes new events, and is woken by
//! change notifications (with a periodic tick as a fallback, since
//! notifications are hints rather than guaranteed deliveries).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::ExponentialBuilder;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::aggregate::CommandError;
use crate::lock::LockManager;
use crate::notify::{ListenerFactory, EVENT_CHANNEL};

pub mod member_request;

pub use member_request::MemberRequestHandler;

/// Result type for event-handler operations.
pub type Result<T> = std::result::Result<T, CommandError>;

/// A poller over the event log.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Name, also used as the handler's advisory-lock key.
    fn name(&self) -> &str;

    /// Process every event past the handler's progress marker.
    ///
    /// Must be safe to re-run over the same events: progress markers are
    /// persisted after processing, so a crash mid-batch re-delivers.
    async fn handle_events(&self) -> Result<()>;
}

/// Backoff for saga command retries after optimistic-concurrency
/// conflicts.
pub fn saga_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(10)
        .with_jitter()
}

/// Drive an event handler until shutdown.
///
/// Loop: take the handler's keyed lock (one instance at a time does the
/// work; losing the race only causes noisy conflict errors, nothing
/// incorrect), run a handling pass, then sleep until a notification, the
/// ping tick, or shutdown.
pub fn run_event_handler(
    handler: Arc<dyn EventHandler>,
    listener_factory: Arc<dyn ListenerFactory>,
    lock_manager: Arc<dyn LockManager>,
    ping_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut listener = listener_factory.new_listener();
        if let Err(e) = listener.listen(EVENT_CHANNEL) {
            error!(handler = handler.name(), error = %e, "failed to listen");
            return;
        }

        loop {
            match lock_manager.lock(handler.name()).await {
                Ok(_guard) => {
                    if let Err(e) = handler.handle_events().await {
                        error!(handler = handler.name(), error = %e, "handle events error");
                    }
                }
                Err(e) => {
                    error!(handler = handler.name(), error = %e, "failed to acquire lock");
                }
            }

            tokio::select! {
                notification = listener.recv() => {
                    if notification.is_none() {
                        info!(handler = handler.name(), "notification channel closed");
                        return;
                    }
                }
                _ = tokio::time::sleep(ping_interval) => {
                    let _ = listener.ping();
                }
                _ = shutdown.changed() => {
                    listener.close();
                    return;
                }
            }
        }
    })
}
