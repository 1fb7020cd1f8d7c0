//! PostgreSQL EventStore implementation.
//!
//! Global sequence numbers come from a bigserial column; a
//! transaction-scoped advisory lock serializes writers across the cluster
//! so sequence numbers are committed in order even though per-stream
//! writes are concurrent.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sea_query::{Expr, Order, PostgresQueryBuilder, Query};
use sqlx::{PgConnection, PgPool, Row};

use crate::event::{ProposedEvent, StoredEvent, StreamCategory};
use crate::notify::{Notifier, EVENT_CHANNEL};
use crate::store::schema::{
    Event, StreamVersion as StreamVersionTable, CREATE_EVENT_TABLE_POSTGRES,
    CREATE_STREAMVERSION_TABLE_POSTGRES,
};
use crate::store::{decode_row, EventStore, Result, StoreError, StreamVersion};

/// Advisory lock key scoping the store's append path.
const EVENT_STORE_EXCLUSIVE_LOCK: i64 = 0;

/// PostgreSQL implementation of EventStore.
pub struct PostgresEventStore {
    pool: PgPool,
    notifier: Option<Arc<dyn Notifier>>,
}

impl PostgresEventStore {
    /// Create a new PostgreSQL event store.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            notifier: None,
        }
    }

    /// Attach a notifier fired after every successful append.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Create tables and indexes if missing.
    pub async fn init(&self) -> Result<()> {
        sqlx::raw_sql(CREATE_EVENT_TABLE_POSTGRES)
            .execute(&self.pool)
            .await?;
        sqlx::raw_sql(CREATE_STREAMVERSION_TABLE_POSTGRES)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn current_stream_version(
        conn: &mut PgConnection,
        stream_id: &str,
    ) -> Result<Option<(String, i64)>> {
        let query = Query::select()
            .columns([StreamVersionTable::Category, StreamVersionTable::Version])
            .from(StreamVersionTable::Table)
            .and_where(Expr::col(StreamVersionTable::StreamId).eq(stream_id))
            .to_string(PostgresQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
        Ok(row.map(|row| (row.get("category"), row.get("version"))))
    }

    async fn upsert_stream_version(
        conn: &mut PgConnection,
        category: StreamCategory,
        stream_id: &str,
        version: i64,
    ) -> Result<()> {
        // poor man's upsert
        let delete = Query::delete()
            .from_table(StreamVersionTable::Table)
            .and_where(Expr::col(StreamVersionTable::StreamId).eq(stream_id))
            .to_string(PostgresQueryBuilder);
        sqlx::query(&delete).execute(&mut *conn).await?;

        let insert = Query::insert()
            .into_table(StreamVersionTable::Table)
            .columns([
                StreamVersionTable::StreamId,
                StreamVersionTable::Category,
                StreamVersionTable::Version,
            ])
            .values_panic([stream_id.into(), category.as_str().into(), version.into()])
            .to_string(PostgresQueryBuilder);
        sqlx::query(&insert).execute(&mut *conn).await?;

        Ok(())
    }

    async fn fetch(&self, query: &str) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query(query).fetch_all(&self.pool).await?;
        rows.iter().map(scan_event).collect()
    }

    fn notify_appended(&self) {
        if let Some(notifier) = &self.notifier {
            let _ = notifier.notify(EVENT_CHANNEL, "");
        }
    }
}

fn event_select() -> sea_query::SelectStatement {
    Query::select()
        .columns([
            Event::Id,
            Event::SequenceNumber,
            Event::EventType,
            Event::Category,
            Event::StreamId,
            Event::Timestamp,
            Event::Version,
            Event::Data,
            Event::MetaData,
        ])
        .from(Event::Table)
        .to_owned()
}

fn scan_event(row: &sqlx::postgres::PgRow) -> Result<StoredEvent> {
    let raw_id: String = row.get("id");
    let raw_category: String = row.get("category");
    let raw_timestamp: String = row.get("timestamp");
    let (id, category, timestamp) = decode_row(&raw_id, &raw_category, &raw_timestamp)?;

    Ok(StoredEvent {
        id,
        sequence_number: row.get("sequencenumber"),
        event_type: row.get("eventtype"),
        category,
        stream_id: row.get("streamid"),
        timestamp,
        version: row.get("version"),
        data: row.get("data"),
        metadata: row.get("metadata"),
    })
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn append(
        &self,
        events: Vec<ProposedEvent>,
        category: StreamCategory,
        stream_id: &str,
        expected_version: i64,
    ) -> Result<Vec<StoredEvent>> {
        if events.is_empty() {
            return Ok(vec![]);
        }

        let mut tx = self.pool.begin().await?;

        let (current, actual_category) =
            match Self::current_stream_version(&mut *tx, stream_id).await? {
                Some((raw_category, version)) => {
                    let actual = raw_category.parse::<StreamCategory>().map_err(|reason| {
                        StoreError::Malformed {
                            id: stream_id.to_string(),
                            reason,
                        }
                    })?;
                    (version, Some(actual))
                }
                None => (0, None),
            };

        if current != expected_version {
            return Err(StoreError::Concurrency {
                stream_id: stream_id.to_string(),
                current,
                expected: expected_version,
            });
        }
        if let Some(actual) = actual_category {
            if actual != category {
                return Err(StoreError::CategoryMismatch {
                    stream_id: stream_id.to_string(),
                    actual,
                    requested: category,
                });
            }
        }

        // Exclusive advisory lock, released at commit/rollback. Sequence
        // numbers assigned past this point commit in order, so consumers
        // reading by sequence number never observe reordering.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(EVENT_STORE_EXCLUSIVE_LOCK)
            .execute(&mut *tx)
            .await?;

        let mut version = expected_version;
        let mut stored = Vec::with_capacity(events.len());
        for event in &events {
            version += 1;
            let timestamp = Utc::now();
            let data = serde_json::to_string(&event.payload)?;
            let metadata = serde_json::to_string(&event.meta)?;

            let insert = Query::insert()
                .into_table(Event::Table)
                .columns([
                    Event::Id,
                    Event::EventType,
                    Event::Category,
                    Event::StreamId,
                    Event::Timestamp,
                    Event::Version,
                    Event::Data,
                    Event::MetaData,
                ])
                .values_panic([
                    event.id.to_string().into(),
                    event.payload.event_type().into(),
                    category.as_str().into(),
                    stream_id.into(),
                    timestamp.to_rfc3339().into(),
                    version.into(),
                    data.clone().into(),
                    metadata.clone().into(),
                ])
                .returning(Query::returning().column(Event::SequenceNumber))
                .to_string(PostgresQueryBuilder);

            let row = sqlx::query(&insert).fetch_one(&mut *tx).await?;
            let sequence_number: i64 = row.get(0);

            stored.push(StoredEvent {
                id: event.id,
                sequence_number,
                event_type: event.payload.event_type().to_string(),
                category,
                stream_id: stream_id.to_string(),
                timestamp,
                version,
                data,
                metadata,
            });
        }

        Self::upsert_stream_version(&mut *tx, category, stream_id, version).await?;

        tx.commit().await?;
        self.notify_appended();
        Ok(stored)
    }

    async fn read_stream(
        &self,
        stream_id: &str,
        from_version: i64,
        limit: u64,
    ) -> Result<Vec<StoredEvent>> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let query = event_select()
            .and_where(Expr::col(Event::StreamId).eq(stream_id))
            .and_where(Expr::col(Event::Version).gte(from_version))
            .order_by(Event::Version, Order::Asc)
            .limit(limit)
            .to_string(PostgresQueryBuilder);

        self.fetch(&query).await
    }

    async fn read_category(
        &self,
        category: StreamCategory,
        from_sequence: i64,
        limit: u64,
    ) -> Result<Vec<StoredEvent>> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let query = event_select()
            .and_where(Expr::col(Event::Category).eq(category.as_str()))
            .and_where(Expr::col(Event::SequenceNumber).gte(from_sequence))
            .order_by(Event::SequenceNumber, Order::Asc)
            .limit(limit)
            .to_string(PostgresQueryBuilder);

        self.fetch(&query).await
    }

    async fn read_all(&self, from_sequence: i64, limit: u64) -> Result<Vec<StoredEvent>> {
        if limit == 0 {
            return Ok(vec![]);
        }

        let query = event_select()
            .and_where(Expr::col(Event::SequenceNumber).gte(from_sequence))
            .order_by(Event::SequenceNumber, Order::Asc)
            .limit(limit)
            .to_string(PostgresQueryBuilder);

        self.fetch(&query).await
    }

    async fn last_sequence_number(&self) -> Result<i64> {
        let query = Query::select()
            .expr(Expr::col(Event::SequenceNumber).max())
            .from(Event::Table)
            .to_string(PostgresQueryBuilder);

        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        Ok(row
            .and_then(|row| row.get::<Option<i64>, _>(0))
            .unwrap_or(0))
    }

    async fn stream_version(&self, stream_id: &str) -> Result<Option<StreamVersion>> {
        let mut conn = self.pool.acquire().await?;
        match Self::current_stream_version(&mut conn, stream_id).await? {
            Some((raw_category, version)) => {
                let category =
                    raw_category
                        .parse::<StreamCategory>()
                        .map_err(|reason| StoreError::Malformed {
                            id: stream_id.to_string(),
                            reason,
                        })?;
                Ok(Some(StreamVersion {
                    category,
                    stream_id: stream_id.to_string(),
                    version,
                }))
            }
            None => Ok(None),
        }
    }

    async fn last_stream_event(&self, stream_id: &str) -> Result<Option<StoredEvent>> {
        let query = event_select()
            .and_where(Expr::col(Event::StreamId).eq(stream_id))
            .order_by(Event::Version, Order::Desc)
            .limit(1)
            .to_string(PostgresQueryBuilder);

        Ok(self.fetch(&query).await?.into_iter().next())
    }

    async fn restore(&self, events: Vec<StoredEvent>) -> Result<()> {
        use std::collections::HashMap;

        let mut tx = self.pool.begin().await?;

        let mut versions: HashMap<String, (StreamCategory, i64)> = HashMap::new();

        for event in &events {
            let insert = Query::insert()
                .into_table(Event::Table)
                .columns([
                    Event::Id,
                    Event::EventType,
                    Event::Category,
                    Event::StreamId,
                    Event::Timestamp,
                    Event::Version,
                    Event::Data,
                    Event::MetaData,
                ])
                .values_panic([
                    event.id.to_string().into(),
                    event.event_type.clone().into(),
                    event.category.as_str().into(),
                    event.stream_id.clone().into(),
                    event.timestamp.to_rfc3339().into(),
                    event.version.into(),
                    event.data.clone().into(),
                    event.metadata.clone().into(),
                ])
                .to_string(PostgresQueryBuilder);

            sqlx::query(&insert).execute(&mut *tx).await?;

            let entry = versions
                .entry(event.stream_id.clone())
                .or_insert((event.category, event.version));
            if event.version > entry.1 {
                entry.1 = event.version;
            }
        }

        for (stream_id, (category, version)) in versions {
            Self::upsert_stream_version(&mut *tx, category, &stream_id, version).await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
