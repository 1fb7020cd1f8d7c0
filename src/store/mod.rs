//! Event storage: the append-only, per-stream-versioned event log.
//!
//! Appends are optimistic-concurrency checked against the `streamversion`
//! bookkeeping table and globally serialized while sequence numbers are
//! assigned, so the `sequencenumber` column is monotonic in commit order.
//! Pollers reading by sequence number therefore never observe reordering,
//! only gaps from writers that lost the race.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::event::{ProposedEvent, StoredEvent, StreamCategory};
use crate::notify::Notifier;

pub mod memory;
pub mod schema;
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::MemoryEventStore;
pub use sqlite::SqliteEventStore;

#[cfg(feature = "postgres")]
pub use postgres::PostgresEventStore;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("version conflict on stream {stream_id}: current {current}, expected {expected}")]
    Concurrency {
        stream_id: String,
        current: i64,
        expected: i64,
    },

    #[error("stream {stream_id} belongs to category {actual}, not {requested}")]
    CategoryMismatch {
        stream_id: String,
        actual: StreamCategory,
        requested: StreamCategory,
    },

    #[error("malformed stored event {id}: {reason}")]
    Malformed { id: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Latest recorded version of one stream, used for the optimistic
/// concurrency check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamVersion {
    pub category: StreamCategory,
    pub stream_id: String,
    pub version: i64,
}

/// Interface for event persistence.
///
/// Implementations:
/// - [`SqliteEventStore`]: SQLite storage (default)
/// - [`PostgresEventStore`]: PostgreSQL storage (`postgres` feature)
/// - [`MemoryEventStore`]: in-memory storage for tests and embedding
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append events to a stream.
    ///
    /// Fails with [`StoreError::Concurrency`] when the stream's recorded
    /// version differs from `expected_version`, and with
    /// [`StoreError::CategoryMismatch`] when the stream already exists under
    /// a different category. On success the events carry consecutive
    /// versions starting at `expected_version + 1` and commit-ordered
    /// global sequence numbers. Conflicts are never retried here; retry
    /// policy belongs to the caller.
    async fn append(
        &self,
        events: Vec<ProposedEvent>,
        category: StreamCategory,
        stream_id: &str,
        expected_version: i64,
    ) -> Result<Vec<StoredEvent>>;

    /// Read one stream ascending by version, starting at `from_version`.
    async fn read_stream(
        &self,
        stream_id: &str,
        from_version: i64,
        limit: u64,
    ) -> Result<Vec<StoredEvent>>;

    /// Read one category ascending by sequence number.
    async fn read_category(
        &self,
        category: StreamCategory,
        from_sequence: i64,
        limit: u64,
    ) -> Result<Vec<StoredEvent>>;

    /// Read everything ascending by sequence number.
    async fn read_all(&self, from_sequence: i64, limit: u64) -> Result<Vec<StoredEvent>>;

    /// Highest committed sequence number, 0 for an empty store.
    async fn last_sequence_number(&self) -> Result<i64>;

    /// Latest recorded version of a stream, None if the stream is unknown.
    async fn stream_version(&self, stream_id: &str) -> Result<Option<StreamVersion>>;

    /// Latest event of a stream, None if the stream is empty.
    async fn last_stream_event(&self, stream_id: &str) -> Result<Option<StoredEvent>>;

    /// Bulk-load previously exported events, keeping their versions, and
    /// recompute the per-stream version bookkeeping.
    ///
    /// Bypasses the optimistic-concurrency check; running it against a live
    /// store that is concurrently written is a fatal misuse. Maintenance
    /// only.
    async fn restore(&self, events: Vec<StoredEvent>) -> Result<()>;
}

/// Shared handle to an event store.
pub type SharedEventStore = Arc<dyn EventStore>;

/// Initialize storage based on configuration.
pub async fn init_storage(
    config: &StorageConfig,
    notifier: Option<Arc<dyn Notifier>>,
) -> std::result::Result<SharedEventStore, Box<dyn std::error::Error + Send + Sync>> {
    info!(backend = %config.backend, path = %config.path, "storage init");

    match config.backend.as_str() {
        "sqlite" => {
            if let Some(parent) = std::path::Path::new(&config.path).parent() {
                std::fs::create_dir_all(parent)?;
            }

            let pool =
                sqlx::SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.path)).await?;

            let mut store = SqliteEventStore::new(pool);
            if let Some(notifier) = notifier {
                store = store.with_notifier(notifier);
            }
            store.init().await?;

            Ok(Arc::new(store))
        }
        "memory" => {
            let mut store = MemoryEventStore::new();
            if let Some(notifier) = notifier {
                store = store.with_notifier(notifier);
            }
            Ok(Arc::new(store))
        }
        #[cfg(feature = "postgres")]
        "postgres" => {
            let pool = sqlx::PgPool::connect(&config.path).await?;

            let mut store = PostgresEventStore::new(pool);
            if let Some(notifier) = notifier {
                store = store.with_notifier(notifier);
            }
            store.init().await?;

            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        "postgres" => Err("postgres storage requested but the 'postgres' feature is not enabled"
            .to_string()
            .into()),
        other => Err(format!("unknown storage backend: {other}").into()),
    }
}

/// Parse one stored row's stringly-typed fields, shared by the SQL backends.
pub(crate) fn decode_row(
    id: &str,
    category: &str,
    timestamp: &str,
) -> Result<(Uuid, StreamCategory, chrono::DateTime<chrono::Utc>)> {
    let event_id = Uuid::parse_str(id).map_err(|e| StoreError::Malformed {
        id: id.to_string(),
        reason: format!("bad event id: {e}"),
    })?;
    let category = category
        .parse::<StreamCategory>()
        .map_err(|reason| StoreError::Malformed {
            id: id.to_string(),
            reason,
        })?;
    let timestamp = chrono::DateTime::parse_from_rfc3339(timestamp)
        .map_err(|e| StoreError::Malformed {
            id: id.to_string(),
            reason: format!("bad timestamp: {e}"),
        })?
        .with_timezone(&chrono::Utc);
    Ok((event_id, category, timestamp))
}
