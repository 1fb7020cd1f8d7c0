//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query
//! building, shared by the SQLite and PostgreSQL backends.

use sea_query::Iden;

/// Event log table schema.
#[derive(Iden)]
pub enum Event {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "sequencenumber"]
    SequenceNumber,
    #[iden = "eventtype"]
    EventType,
    #[iden = "category"]
    Category,
    #[iden = "streamid"]
    StreamId,
    #[iden = "timestamp"]
    Timestamp,
    #[iden = "version"]
    Version,
    #[iden = "data"]
    Data,
    #[iden = "metadata"]
    MetaData,
}

/// Per-stream latest-version bookkeeping table schema.
#[derive(Iden)]
pub enum StreamVersion {
    #[iden = "streamversion"]
    Table,
    #[iden = "streamid"]
    StreamId,
    #[iden = "category"]
    Category,
    #[iden = "version"]
    Version,
}

/// SQL for creating the event table (SQLite).
pub const CREATE_EVENT_TABLE_SQLITE: &str = r#"
CREATE TABLE IF NOT EXISTS event (
    id TEXT NOT NULL,
    sequencenumber INTEGER PRIMARY KEY AUTOINCREMENT,
    eventtype TEXT NOT NULL,
    category TEXT NOT NULL,
    streamid TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    version INTEGER NOT NULL,
    data TEXT NOT NULL,
    metadata TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_event_stream_version ON event(category, streamid, version);
CREATE INDEX IF NOT EXISTS idx_event_streamid ON event(streamid, version);
CREATE INDEX IF NOT EXISTS idx_event_category ON event(category);
"#;

/// SQL for creating the streamversion table (SQLite).
pub const CREATE_STREAMVERSION_TABLE_SQLITE: &str = r#"
CREATE TABLE IF NOT EXISTS streamversion (
    streamid TEXT NOT NULL,
    category TEXT NOT NULL,
    version INTEGER NOT NULL,
    PRIMARY KEY (streamid)
);
"#;

/// SQL for creating the event table (PostgreSQL).
#[cfg(feature = "postgres")]
pub const CREATE_EVENT_TABLE_POSTGRES: &str = r#"
CREATE TABLE IF NOT EXISTS event (
    id varchar NOT NULL,
    sequencenumber bigserial,
    eventtype varchar NOT NULL,
    category varchar NOT NULL,
    streamid varchar NOT NULL,
    timestamp varchar NOT NULL,
    version bigint NOT NULL,
    data text NOT NULL,
    metadata text NOT NULL,
    PRIMARY KEY (sequencenumber)
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_event_stream_version ON event(category, streamid, version);
CREATE INDEX IF NOT EXISTS idx_event_streamid ON event(streamid, version);
CREATE INDEX IF NOT EXISTS idx_event_category ON event(category);
"#;

/// SQL for creating the streamversion table (PostgreSQL).
#[cfg(feature = "postgres")]
pub const CREATE_STREAMVERSION_TABLE_POSTGRES: &str = r#"
CREATE TABLE IF NOT EXISTS streamversion (
    streamid varchar NOT NULL,
    category varchar NOT NULL,
    version bigint NOT NULL,
    PRIMARY KEY (streamid)
);
"#;
