//! In-memory EventStore implementation.
//!
//! Backs tests and embedded single-process use. The interior lock plays
//! the role the advisory lock plays for the SQL backends: sequence numbers
//! are assigned and committed under one critical section, so commit order
//! and sequence order agree.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::event::{ProposedEvent, StoredEvent, StreamCategory};
use crate::notify::{Notifier, EVENT_CHANNEL};
use crate::store::{EventStore, Result, StoreError, StreamVersion};

#[derive(Default)]
struct Inner {
    events: Vec<StoredEvent>,
    streams: HashMap<String, StreamVersion>,
}

/// Event store that keeps the whole log in memory.
#[derive(Default)]
pub struct MemoryEventStore {
    inner: RwLock<Inner>,
    notifier: Option<Arc<dyn Notifier>>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a notifier fired after every successful append.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    fn notify_appended(&self) {
        if let Some(notifier) = &self.notifier {
            let _ = notifier.notify(EVENT_CHANNEL, "");
        }
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
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

        let mut inner = self.inner.write().await;

        let current = match inner.streams.get(stream_id) {
            Some(sv) => {
                if sv.category != category {
                    return Err(StoreError::CategoryMismatch {
                        stream_id: stream_id.to_string(),
                        actual: sv.category,
                        requested: category,
                    });
                }
                sv.version
            }
            None => 0,
        };
        if current != expected_version {
            return Err(StoreError::Concurrency {
                stream_id: stream_id.to_string(),
                current,
                expected: expected_version,
            });
        }

        let mut version = expected_version;
        let mut sequence = inner.events.len() as i64;
        let mut appended = Vec::with_capacity(events.len());
        for event in events {
            version += 1;
            sequence += 1;
            appended.push(StoredEvent {
                id: event.id,
                sequence_number: sequence,
                event_type: event.payload.event_type().to_string(),
                category,
                stream_id: stream_id.to_string(),
                timestamp: Utc::now(),
                version,
                data: serde_json::to_string(&event.payload)?,
                metadata: serde_json::to_string(&event.meta)?,
            });
        }

        inner.events.extend(appended.iter().cloned());
        inner.streams.insert(
            stream_id.to_string(),
            StreamVersion {
                category,
                stream_id: stream_id.to_string(),
                version,
            },
        );
        drop(inner);

        self.notify_appended();
        Ok(appended)
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
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .iter()
            .filter(|e| e.stream_id == stream_id && e.version >= from_version)
            .take(limit as usize)
            .cloned()
            .collect())
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
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .iter()
            .filter(|e| e.category == category && e.sequence_number >= from_sequence)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn read_all(&self, from_sequence: i64, limit: u64) -> Result<Vec<StoredEvent>> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .iter()
            .filter(|e| e.sequence_number >= from_sequence)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn last_sequence_number(&self) -> Result<i64> {
        let inner = self.inner.read().await;
        Ok(inner.events.last().map(|e| e.sequence_number).unwrap_or(0))
    }

    async fn stream_version(&self, stream_id: &str) -> Result<Option<StreamVersion>> {
        let inner = self.inner.read().await;
        Ok(inner.streams.get(stream_id).cloned())
    }

    async fn last_stream_event(&self, stream_id: &str) -> Result<Option<StoredEvent>> {
        let inner = self.inner.read().await;
        Ok(inner
            .events
            .iter()
            .rev()
            .find(|e| e.stream_id == stream_id)
            .cloned())
    }

    async fn restore(&self, events: Vec<StoredEvent>) -> Result<()> {
        let mut inner = self.inner.write().await;

        for mut event in events {
            event.sequence_number = inner.events.len() as i64 + 1;
            let replacement = StreamVersion {
                category: event.category,
                stream_id: event.stream_id.clone(),
                version: event.version,
            };
            let entry = inner
                .streams
                .entry(event.stream_id.clone())
                .or_insert_with(|| replacement.clone());
            if event.version > entry.version {
                entry.version = event.version;
            }
            inner.events.push(event);
        }

        Ok(())
    }
}
