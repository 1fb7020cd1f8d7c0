//! Member-change aggregate: tracks one in-flight cross-aggregate request.
//!
//! Created implicitly by the first Request* command, completed exactly
//! once by the saga, inert forever after.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::aggregate::{replay, Aggregate, CommandError, Result};
use crate::command::{Command, CommandPayload};
use crate::event::{EventPayload, StoredEvent, StreamCategory};
use crate::store::EventStore;

pub struct MemberChangeRepository {
    store: Arc<dyn EventStore>,
}

impl MemberChangeRepository {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self, id: Uuid) -> Result<MemberChange> {
        debug!(%id, "loading member change");
        let mut change = MemberChange::new(id);
        replay(self.store.as_ref(), &id.to_string(), &mut change).await?;
        Ok(change)
    }
}

pub struct MemberChange {
    id: Uuid,
    version: i64,

    completed: bool,
}

impl MemberChange {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            version: 0,
            completed: false,
        }
    }

    pub fn completed(&self) -> bool {
        self.completed
    }

    fn apply_event(&mut self, event: &StoredEvent) -> Result<()> {
        if event.version <= self.version {
            return Ok(());
        }
        self.version = event.version;

        if let EventPayload::MemberChangeCompleted { .. } = event.payload()? {
            self.completed = true;
        }

        Ok(())
    }
}

#[async_trait]
impl Aggregate for MemberChange {
    fn id(&self) -> String {
        self.id.to_string()
    }

    fn category(&self) -> StreamCategory {
        StreamCategory::MemberChange
    }

    fn version(&self) -> i64 {
        self.version
    }

    async fn apply_events(&mut self, events: &[StoredEvent]) -> Result<()> {
        for event in events {
            self.apply_event(event)?;
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: &Command) -> Result<Vec<EventPayload>> {
        // A completed request is inert: every further command is a no-op,
        // which makes duplicate completions and saga retries harmless.
        if self.completed {
            return Ok(vec![]);
        }

        match &command.payload {
            CommandPayload::RequestCreateMember {
                member_id,
                is_admin,
                match_uid,
                user_name,
                full_name,
                email,
                password_hash,
            } => Ok(vec![EventPayload::MemberChangeCreateRequested {
                member_change_id: self.id,
                member_id: *member_id,
                is_admin: *is_admin,
                match_uid: match_uid.clone(),
                user_name: user_name.clone(),
                full_name: full_name.clone(),
                email: email.clone(),
                password_hash: password_hash.clone(),
            }]),
            CommandPayload::RequestUpdateMember {
                member_id,
                is_admin,
                user_name,
                full_name,
                email,
                prev_user_name,
                prev_email,
            } => Ok(vec![EventPayload::MemberChangeUpdateRequested {
                member_change_id: self.id,
                member_id: *member_id,
                is_admin: *is_admin,
                user_name: user_name.clone(),
                full_name: full_name.clone(),
                email: email.clone(),
                prev_user_name: prev_user_name.clone(),
                prev_email: prev_email.clone(),
            }]),
            CommandPayload::RequestSetMemberMatchUid {
                member_id,
                match_uid,
            } => Ok(vec![EventPayload::MemberChangeSetMatchUidRequested {
                member_change_id: self.id,
                member_id: *member_id,
                match_uid: match_uid.clone(),
            }]),
            CommandPayload::CompleteRequest { error, reason } => {
                Ok(vec![EventPayload::MemberChangeCompleted {
                    member_change_id: self.id,
                    error: *error,
                    reason: reason.clone(),
                }])
            }
            other => Err(CommandError::Unroutable {
                command: other.command_type(),
                category: self.category(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::exec_command;
    use crate::store::MemoryEventStore;

    fn complete(error: bool, reason: &str) -> Command {
        Command::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            CommandPayload::CompleteRequest {
                error,
                reason: reason.to_string(),
            },
        )
    }

    #[tokio::test]
    async fn completes_exactly_once() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let repo = MemberChangeRepository::new(store.clone());
        let id = Uuid::new_v4();

        let mut change = repo.load(id).await.unwrap();
        let (_, n) = exec_command(&complete(false, ""), &mut change, store.as_ref())
            .await
            .unwrap();
        assert_eq!(n, 1);

        // second completion, and anything else, is a no-op
        let mut change = repo.load(id).await.unwrap();
        assert!(change.completed());
        let (_, n) = exec_command(&complete(true, "late"), &mut change, store.as_ref())
            .await
            .unwrap();
        assert_eq!(n, 0);

        let request = Command::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            CommandPayload::RequestSetMemberMatchUid {
                member_id: Uuid::new_v4(),
                match_uid: "uid".to_string(),
            },
        );
        let mut change = repo.load(id).await.unwrap();
        let (_, n) = exec_command(&request, &mut change, store.as_ref())
            .await
            .unwrap();
        assert_eq!(n, 0);
    }
}
