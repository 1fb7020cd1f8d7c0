//! Aggregate runtime: the command-execution contract and replay loader.
//!
//! An aggregate's state is derived solely by replaying its own stream.
//! `handle_command` validates against current state and returns the events
//! to persist; state changes only ever happen through `apply_events`, which
//! the store-side replay and the execution helper drive.

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::command::Command;
use crate::event::{EventMeta, EventPayload, ProposedEvent, StoredEvent, StreamCategory};
use crate::store::{EventStore, StoreError};

pub mod member;
pub mod member_change;
pub mod registry;
pub mod roles_tree;
pub mod tension;

pub use member::{Member, MemberRepository};
pub use member_change::{MemberChange, MemberChangeRepository};
pub use registry::{UniqueValueRegistry, UniqueValueRegistryRepository};
pub use roles_tree::{RolesTree, RolesTreeRepository};
pub use tension::{Tension, TensionRepository};

/// Result type for aggregate operations.
pub type Result<T> = std::result::Result<T, CommandError>;

/// Errors raised while handling or executing commands.
///
/// `Rejected` is the validation kind: expected, recoverable, and the
/// trigger for saga compensation. Everything else is infrastructure and
/// must be surfaced unchanged.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("command rejected: {0}")]
    Rejected(String),

    #[error("command {command} not routable to {category} aggregate")]
    Unroutable {
        command: &'static str,
        category: StreamCategory,
    },

    #[error("event {0} not handled here")]
    UnhandledEvent(String),

    #[error("projection integrity check failed: {0}")]
    Integrity(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("projection error: {0}")]
    Projection(#[from] sqlx::Error),

    #[error("malformed event payload: {0}")]
    Decode(#[from] serde_json::Error),
}

impl CommandError {
    /// Whether this is a validation rejection rather than an
    /// infrastructure failure.
    pub fn is_rejection(&self) -> bool {
        matches!(self, CommandError::Rejected(_))
    }
}

/// Batch size used by the replay loader.
pub const LOAD_BATCH_SIZE: u64 = 100;

/// A consistency boundary rebuilt by replaying its stream.
#[async_trait]
pub trait Aggregate: Send {
    /// Stream id of this aggregate instance.
    fn id(&self) -> String;

    /// Aggregate type, the stream's category.
    fn category(&self) -> StreamCategory;

    /// Highest applied stream version, 0 before any event.
    fn version(&self) -> i64;

    /// Fold a batch of stored events into state, ascending by version.
    ///
    /// Must skip events at or below the current version so re-delivery
    /// during incremental rehydration is harmless.
    async fn apply_events(&mut self, events: &[StoredEvent]) -> Result<()>;

    /// Validate a command against current state and return the events it
    /// produces. Must not mutate domain state.
    async fn handle_command(&mut self, command: &Command) -> Result<Vec<EventPayload>>;
}

/// Replay a stream into an aggregate in fixed-size batches.
///
/// Restartable from any version: reads from `version + 1` until an empty
/// batch comes back, applying each batch before requesting the next.
pub async fn replay(
    store: &dyn EventStore,
    stream_id: &str,
    aggregate: &mut (impl Aggregate + ?Sized),
) -> Result<()> {
    let mut version = aggregate.version();
    loop {
        let events = store
            .read_stream(stream_id, version + 1, LOAD_BATCH_SIZE)
            .await?;
        let Some(last) = events.last() else {
            return Ok(());
        };
        version = last.version;
        aggregate.apply_events(&events).await?;
    }
}

/// Execute a command against an aggregate and persist the produced events.
///
/// Stamps every event with the command's correlation id, a causation id
/// equal to the command id, a fresh group id shared by the whole batch and
/// the command's issuer, then appends at the aggregate's current version.
/// Returns the group id and the number of events written.
pub async fn exec_command(
    command: &Command,
    aggregate: &mut (impl Aggregate + ?Sized),
    store: &dyn EventStore,
) -> Result<(Uuid, usize)> {
    debug!(
        category = %aggregate.category(),
        id = %aggregate.id(),
        command = command.payload.command_type(),
        "executing command"
    );

    let payloads = aggregate.handle_command(command).await?;

    let group_id = Uuid::new_v4();
    let meta = EventMeta {
        correlation_id: Some(command.correlation_id),
        causation_id: Some(command.id),
        group_id: Some(group_id),
        issuer_id: command.issuer_id,
    };

    let proposed = ProposedEvent::batch(payloads, &meta);
    let stored = store
        .append(
            proposed,
            aggregate.category(),
            &aggregate.id(),
            aggregate.version(),
        )
        .await?;

    Ok((group_id, stored.len()))
}
