//! Member-request handler: the poller driving the member-request saga.
//!
//! Tracks its progress through the member-change and member categories as
//! a pair of sequence numbers persisted in its own singleton stream, so a
//! restart resumes from the last processed event and re-processing is
//! absorbed by the aggregates' request-id deduplication.

use std::sync::Arc;

use async_trait::async_trait;
use backon::Retryable;
use tracing::debug;
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::aggregate::CommandError;
use crate::event::{
    member_request_handler_stream_id, EventMeta, EventPayload, ProposedEvent, StoredEvent,
    StreamCategory,
};
use crate::handlers::{saga_backoff, EventHandler, Result};
use crate::saga::{saga_stream_id, MemberRequestSagaRepository};
use crate::store::{EventStore, StoreError};

const BATCH_SIZE: u64 = 100;

pub struct MemberRequestHandler {
    store: Arc<dyn EventStore>,
}

impl MemberRequestHandler {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    async fn handle_event(&self, event: &StoredEvent) -> Result<()> {
        debug!(%event, "handling event");

        let member_change_id = match event.payload()? {
            EventPayload::MemberChangeCreateRequested {
                member_change_id, ..
            }
            | EventPayload::MemberChangeUpdateRequested {
                member_change_id, ..
            }
            | EventPayload::MemberChangeSetMatchUidRequested {
                member_change_id, ..
            }
            | EventPayload::MemberChangeCompleted {
                member_change_id, ..
            }
            | EventPayload::MemberCreated {
                member_change_id, ..
            }
            | EventPayload::MemberUpdated {
                member_change_id, ..
            }
            | EventPayload::MemberMatchUidSet {
                member_change_id, ..
            } => member_change_id,
            // other member events (password changes) don't involve the saga
            _ => return Ok(()),
        };

        // Conflicts come from racing writers on the shared registry and
        // saga streams; the whole call is idempotent, so retry with
        // backoff rather than failing the pass.
        (|| async { self.call_saga(member_change_id, event).await })
            .retry(saga_backoff())
            .when(|e| matches!(e, CommandError::Store(StoreError::Concurrency { .. })))
            .await
    }

    async fn call_saga(&self, member_change_id: Uuid, event: &StoredEvent) -> Result<()> {
        let meta = event.meta().map_err(StoreError::from)?;

        let saga_name = saga_stream_id(member_change_id);
        let repository = MemberRequestSagaRepository::new(self.store.clone());
        let saga = repository.load(&saga_name).await?;

        let events = saga.handle_event(event).await?;

        let saga_meta = EventMeta {
            correlation_id: meta.correlation_id.or(Some(event.id)),
            causation_id: Some(event.id),
            group_id: Some(Uuid::new_v4()),
            issuer_id: None,
        };
        self.store
            .append(
                ProposedEvent::batch(events, &saga_meta),
                StreamCategory::MemberRequestSaga,
                &saga_name,
                saga.version(),
            )
            .await?;

        Ok(())
    }
}

#[async_trait]
impl EventHandler for MemberRequestHandler {
    fn name(&self) -> &str {
        "memberRequestHandler"
    }

    async fn handle_events(&self) -> Result<()> {
        let handler_id = member_request_handler_stream_id().to_string();

        loop {
            // progress marker: last processed sequence number per category
            let (cur_change_sn, cur_member_sn, version) =
                match self.store.last_stream_event(&handler_id).await? {
                    Some(event) => match event.payload()? {
                        EventPayload::MemberRequestHandlerStateUpdated {
                            member_change_sequence_number,
                            member_sequence_number,
                        } => (
                            member_change_sequence_number,
                            member_sequence_number,
                            event.version,
                        ),
                        other => {
                            return Err(CommandError::UnhandledEvent(
                                other.event_type().to_string(),
                            ))
                        }
                    },
                    None => (0, 0, 0),
                };

            let change_events = self
                .store
                .read_category(StreamCategory::MemberChange, cur_change_sn + 1, BATCH_SIZE)
                .await?;
            let member_events = self
                .store
                .read_category(StreamCategory::Member, cur_member_sn + 1, BATCH_SIZE)
                .await?;

            if change_events.is_empty() && member_events.is_empty() {
                return Ok(());
            }

            let mut change_sn = cur_change_sn;
            let mut member_sn = cur_member_sn;

            for event in &change_events {
                self.handle_event(event).await?;
                change_sn = event.sequence_number;
            }
            for event in &member_events {
                self.handle_event(event).await?;
                member_sn = event.sequence_number;
            }

            if change_sn != cur_change_sn || member_sn != cur_member_sn {
                let state = EventPayload::MemberRequestHandlerStateUpdated {
                    member_change_sequence_number: change_sn,
                    member_sequence_number: member_sn,
                };
                self.store
                    .append(
                        ProposedEvent::batch(vec![state], &EventMeta::default()),
                        StreamCategory::MemberRequestHandler,
                        &handler_id,
                        version,
                    )
                    .await?;
            }
        }
    }
}
