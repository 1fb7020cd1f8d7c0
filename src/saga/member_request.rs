//! Member-request saga.
//!
//! Creating or updating a member must hold three independently-owned
//! uniqueness reservations (username, email, optional external match uid)
//! and then mutate the member aggregate; no single transaction spans all
//! of these. The saga reserves in order, compensates by releasing on any
//! validation failure, and always completes the request-tracking
//! member-change aggregate, with or without an error reason.
//!
//! Every command the saga issues carries the member-change id as its
//! request id, which the target aggregates deduplicate against, so a crash
//! at any point is repaired by re-running the saga over the same event.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::aggregate::{
    exec_command, replay, Aggregate, CommandError, MemberChangeRepository, MemberRepository,
    Result, UniqueValueRegistryRepository,
};
use crate::command::{Command, CommandPayload};
use crate::event::{EventPayload, StoredEvent, StreamCategory};
use crate::store::EventStore;

/// Stream id of the saga instance tracking one member change.
pub fn saga_stream_id(member_change_id: Uuid) -> String {
    format!("memberrequestsaga-{member_change_id}")
}

fn user_name_registry(user_name: &str) -> String {
    format!("username-{user_name}")
}

fn email_registry(email: &str) -> String {
    format!("email-{email}")
}

fn match_uid_registry(match_uid: &str) -> String {
    format!("matchuid-{match_uid}")
}

pub struct MemberRequestSagaRepository {
    store: Arc<dyn EventStore>,
}

impl MemberRequestSagaRepository {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self, id: &str) -> Result<MemberRequestSaga> {
        debug!(id, "loading member request saga");
        let mut saga = MemberRequestSaga::new(self.store.clone(), id);
        replay(self.store.as_ref(), id, &mut saga).await?;
        Ok(saga)
    }
}

pub struct MemberRequestSaga {
    id: String,
    version: i64,

    completed: bool,

    store: Arc<dyn EventStore>,
}

impl MemberRequestSaga {
    pub fn new(store: Arc<dyn EventStore>, id: &str) -> Self {
        Self {
            id: id.to_string(),
            version: 0,
            completed: false,
            store,
        }
    }

    pub fn completed(&self) -> bool {
        self.completed
    }

    /// React to a foreign event, issuing commands against other aggregates
    /// and returning the saga's own bookkeeping events.
    ///
    /// A [`CommandError::Rejected`] from a reservation or from the member
    /// command triggers compensation; infrastructure errors abort the pass
    /// and are retried by re-running the poller over the same event.
    pub async fn handle_event(&self, event: &StoredEvent) -> Result<Vec<EventPayload>> {
        // a completed saga discards everything
        if self.completed {
            return Ok(vec![]);
        }

        let meta = event.meta()?;
        // future commands are caused by this event
        let causation_id = event.id;
        let correlation_id = meta.correlation_id.unwrap_or(event.id);

        match event.payload()? {
            EventPayload::MemberChangeCreateRequested {
                member_change_id,
                member_id,
                is_admin,
                match_uid,
                user_name,
                full_name,
                email,
                password_hash,
            } => {
                if let Err(e) = self
                    .reserve(
                        correlation_id,
                        causation_id,
                        &user_name_registry(&user_name),
                        &user_name,
                        member_id,
                        member_change_id,
                    )
                    .await
                {
                    return self
                        .compensate(
                            e,
                            correlation_id,
                            causation_id,
                            member_change_id,
                            format!("username {user_name:?} already reserved"),
                            &[],
                            member_id,
                        )
                        .await;
                }

                if let Err(e) = self
                    .reserve(
                        correlation_id,
                        causation_id,
                        &email_registry(&email),
                        &email,
                        member_id,
                        member_change_id,
                    )
                    .await
                {
                    let taken = [(user_name_registry(&user_name), user_name.clone())];
                    return self
                        .compensate(
                            e,
                            correlation_id,
                            causation_id,
                            member_change_id,
                            format!("email {email:?} already reserved"),
                            &taken,
                            member_id,
                        )
                        .await;
                }

                if !match_uid.is_empty() {
                    if let Err(e) = self
                        .reserve(
                            correlation_id,
                            causation_id,
                            &match_uid_registry(&match_uid),
                            &match_uid,
                            member_id,
                            member_change_id,
                        )
                        .await
                    {
                        let taken = [
                            (user_name_registry(&user_name), user_name.clone()),
                            (email_registry(&email), email.clone()),
                        ];
                        return self
                            .compensate(
                                e,
                                correlation_id,
                                causation_id,
                                member_change_id,
                                format!("matchUID {match_uid:?} already reserved"),
                                &taken,
                                member_id,
                            )
                            .await;
                    }
                }

                debug!(%member_id, "creating member");
                let repo = MemberRepository::new(self.store.clone());
                let mut member = repo.load(member_id).await?;
                let command = Command::new(
                    correlation_id,
                    causation_id,
                    None,
                    CommandPayload::CreateMember {
                        member_change_id,
                        is_admin,
                        match_uid: match_uid.clone(),
                        user_name: user_name.clone(),
                        full_name,
                        email: email.clone(),
                        password_hash,
                    },
                );
                if let Err(e) = exec_command(&command, &mut member, self.store.as_ref()).await {
                    let mut taken = vec![
                        (user_name_registry(&user_name), user_name.clone()),
                        (email_registry(&email), email.clone()),
                    ];
                    if !match_uid.is_empty() {
                        taken.push((match_uid_registry(&match_uid), match_uid.clone()));
                    }
                    return self
                        .compensate(
                            e,
                            correlation_id,
                            causation_id,
                            member_change_id,
                            "error creating member".to_string(),
                            &taken,
                            member_id,
                        )
                        .await;
                }

                Ok(vec![])
            }

            EventPayload::MemberChangeUpdateRequested {
                member_change_id,
                member_id,
                is_admin,
                user_name,
                full_name,
                email,
                prev_user_name,
                prev_email,
            } => {
                // The previous values come from an eventually consistent
                // read; the member aggregate re-checks them and rejects if
                // they changed, which rolls everything back below.
                let user_name_changed = prev_user_name != user_name;
                let email_changed = prev_email != email;

                if user_name_changed {
                    if let Err(e) = self
                        .reserve(
                            correlation_id,
                            causation_id,
                            &user_name_registry(&user_name),
                            &user_name,
                            member_id,
                            member_change_id,
                        )
                        .await
                    {
                        return self
                            .compensate(
                                e,
                                correlation_id,
                                causation_id,
                                member_change_id,
                                format!("username {user_name:?} already reserved"),
                                &[],
                                member_id,
                            )
                            .await;
                    }
                }

                if email_changed {
                    if let Err(e) = self
                        .reserve(
                            correlation_id,
                            causation_id,
                            &email_registry(&email),
                            &email,
                            member_id,
                            member_change_id,
                        )
                        .await
                    {
                        let mut taken = vec![];
                        if user_name_changed {
                            taken.push((user_name_registry(&user_name), user_name.clone()));
                        }
                        return self
                            .compensate(
                                e,
                                correlation_id,
                                causation_id,
                                member_change_id,
                                format!("email {email:?} already reserved"),
                                &taken,
                                member_id,
                            )
                            .await;
                    }
                }

                debug!(%member_id, "updating member");
                let repo = MemberRepository::new(self.store.clone());
                let mut member = repo.load(member_id).await?;
                let command = Command::new(
                    correlation_id,
                    causation_id,
                    None,
                    CommandPayload::UpdateMember {
                        member_change_id,
                        is_admin,
                        user_name: user_name.clone(),
                        full_name,
                        email: email.clone(),
                        prev_user_name,
                        prev_email,
                    },
                );
                if let Err(e) = exec_command(&command, &mut member, self.store.as_ref()).await {
                    let mut taken = vec![];
                    if user_name_changed {
                        taken.push((user_name_registry(&user_name), user_name.clone()));
                    }
                    if email_changed {
                        taken.push((email_registry(&email), email.clone()));
                    }
                    return self
                        .compensate(
                            e,
                            correlation_id,
                            causation_id,
                            member_change_id,
                            "error updating member".to_string(),
                            &taken,
                            member_id,
                        )
                        .await;
                }

                Ok(vec![])
            }

            EventPayload::MemberChangeSetMatchUidRequested {
                member_change_id,
                member_id,
                match_uid,
            } => {
                if !match_uid.is_empty() {
                    if let Err(e) = self
                        .reserve(
                            correlation_id,
                            causation_id,
                            &match_uid_registry(&match_uid),
                            &match_uid,
                            member_id,
                            member_change_id,
                        )
                        .await
                    {
                        return self
                            .compensate(
                                e,
                                correlation_id,
                                causation_id,
                                member_change_id,
                                format!("matchUID {match_uid:?} already reserved"),
                                &[],
                                member_id,
                            )
                            .await;
                    }
                }

                debug!(%member_id, "setting member match uid");
                let repo = MemberRepository::new(self.store.clone());
                let mut member = repo.load(member_id).await?;
                let command = Command::new(
                    correlation_id,
                    causation_id,
                    None,
                    CommandPayload::SetMemberMatchUid {
                        member_change_id,
                        match_uid: match_uid.clone(),
                    },
                );
                if let Err(e) = exec_command(&command, &mut member, self.store.as_ref()).await {
                    let mut taken = vec![];
                    if !match_uid.is_empty() {
                        taken.push((match_uid_registry(&match_uid), match_uid.clone()));
                    }
                    return self
                        .compensate(
                            e,
                            correlation_id,
                            causation_id,
                            member_change_id,
                            "error setting member match uid".to_string(),
                            &taken,
                            member_id,
                        )
                        .await;
                }

                Ok(vec![])
            }

            EventPayload::MemberCreated {
                member_change_id, ..
            } => {
                self.complete_member_change(correlation_id, causation_id, member_change_id, "")
                    .await?;
                Ok(vec![])
            }

            EventPayload::MemberUpdated {
                member_id,
                member_change_id,
                user_name,
                email,
                prev_user_name,
                prev_email,
                ..
            } => {
                // The new values were reserved up front; renames release
                // the old ones here, keeping the registry consistent
                // without a two-phase commit.
                if prev_user_name != user_name {
                    self.release(
                        correlation_id,
                        causation_id,
                        &user_name_registry(&prev_user_name),
                        &prev_user_name,
                        member_id,
                        member_change_id,
                    )
                    .await?;
                }
                if prev_email != email {
                    self.release(
                        correlation_id,
                        causation_id,
                        &email_registry(&prev_email),
                        &prev_email,
                        member_id,
                        member_change_id,
                    )
                    .await?;
                }

                self.complete_member_change(correlation_id, causation_id, member_change_id, "")
                    .await?;
                Ok(vec![])
            }

            EventPayload::MemberMatchUidSet {
                member_id,
                member_change_id,
                match_uid,
                prev_match_uid,
            } => {
                if !prev_match_uid.is_empty() && prev_match_uid != match_uid {
                    self.release(
                        correlation_id,
                        causation_id,
                        &match_uid_registry(&prev_match_uid),
                        &prev_match_uid,
                        member_id,
                        member_change_id,
                    )
                    .await?;
                }

                self.complete_member_change(correlation_id, causation_id, member_change_id, "")
                    .await?;
                Ok(vec![])
            }

            EventPayload::MemberChangeCompleted { .. } => {
                Ok(vec![EventPayload::MemberRequestSagaCompleted {
                    saga_id: self.id.clone(),
                }])
            }

            _ => Err(CommandError::UnhandledEvent(event.event_type.clone())),
        }
    }

    /// Handle a rejection: release every reservation taken so far, then
    /// complete the member change with the error reason. Infrastructure
    /// errors pass through untouched, including failures of the releases
    /// themselves (a failed release leaves a value wrongly reserved, so it
    /// aborts the pass and the poller retries the whole event).
    #[allow(clippy::too_many_arguments)]
    async fn compensate(
        &self,
        err: CommandError,
        correlation_id: Uuid,
        causation_id: Uuid,
        member_change_id: Uuid,
        reason: String,
        taken: &[(String, String)],
        member_id: Uuid,
    ) -> Result<Vec<EventPayload>> {
        if !err.is_rejection() {
            return Err(err);
        }
        warn!(%member_change_id, error = %err, "member request failed, compensating");

        for (registry_id, value) in taken {
            self.release(
                correlation_id,
                causation_id,
                registry_id,
                value,
                member_id,
                member_change_id,
            )
            .await?;
        }

        self.complete_member_change(correlation_id, causation_id, member_change_id, &reason)
            .await?;
        Ok(vec![])
    }

    async fn reserve(
        &self,
        correlation_id: Uuid,
        causation_id: Uuid,
        registry_id: &str,
        value: &str,
        owner_id: Uuid,
        request_id: Uuid,
    ) -> Result<()> {
        debug!(registry_id, value, %owner_id, "reserving value");
        let repo = UniqueValueRegistryRepository::new(self.store.clone());
        let mut registry = repo.load(registry_id).await?;

        let command = Command::new(
            correlation_id,
            causation_id,
            None,
            CommandPayload::ReserveValue {
                value: value.to_string(),
                owner_id,
                request_id,
            },
        );
        exec_command(&command, &mut registry, self.store.as_ref()).await?;
        Ok(())
    }

    async fn release(
        &self,
        correlation_id: Uuid,
        causation_id: Uuid,
        registry_id: &str,
        value: &str,
        owner_id: Uuid,
        request_id: Uuid,
    ) -> Result<()> {
        debug!(registry_id, value, %owner_id, "releasing value");
        let repo = UniqueValueRegistryRepository::new(self.store.clone());
        let mut registry = repo.load(registry_id).await?;

        let command = Command::new(
            correlation_id,
            causation_id,
            None,
            CommandPayload::ReleaseValue {
                value: value.to_string(),
                owner_id,
                request_id,
            },
        );
        exec_command(&command, &mut registry, self.store.as_ref()).await?;
        Ok(())
    }

    async fn complete_member_change(
        &self,
        correlation_id: Uuid,
        causation_id: Uuid,
        member_change_id: Uuid,
        reason: &str,
    ) -> Result<()> {
        debug!(%member_change_id, reason, "completing member change");
        let repo = MemberChangeRepository::new(self.store.clone());
        let mut change = repo.load(member_change_id).await?;

        let command = Command::new(
            correlation_id,
            causation_id,
            None,
            CommandPayload::CompleteRequest {
                error: !reason.is_empty(),
                reason: reason.to_string(),
            },
        );
        exec_command(&command, &mut change, self.store.as_ref()).await?;
        Ok(())
    }

    fn apply_event(&mut self, event: &StoredEvent) -> Result<()> {
        if event.version <= self.version {
            return Ok(());
        }
        self.version = event.version;

        if let EventPayload::MemberRequestSagaCompleted { .. } = event.payload()? {
            self.completed = true;
        }

        Ok(())
    }
}

#[async_trait]
impl Aggregate for MemberRequestSaga {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn category(&self) -> StreamCategory {
        StreamCategory::MemberRequestSaga
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
        // the saga reacts to events, not commands
        Err(CommandError::Unroutable {
            command: command.payload.command_type(),
            category: self.category(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventMeta, ProposedEvent};
    use crate::store::MemoryEventStore;

    async fn request_create_member(
        store: &Arc<dyn EventStore>,
        member_id: Uuid,
        user_name: &str,
        email: &str,
        match_uid: &str,
    ) -> (Uuid, StoredEvent) {
        let member_change_id = Uuid::new_v4();
        let repo = MemberChangeRepository::new(store.clone());
        let mut change = repo.load(member_change_id).await.unwrap();
        let command = Command::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            CommandPayload::RequestCreateMember {
                member_id,
                is_admin: false,
                match_uid: match_uid.to_string(),
                user_name: user_name.to_string(),
                full_name: "Test Member".to_string(),
                email: email.to_string(),
                password_hash: "hash".to_string(),
            },
        );
        exec_command(&command, &mut change, store.as_ref())
            .await
            .unwrap();

        let events = store
            .read_stream(&member_change_id.to_string(), 1, 100)
            .await
            .unwrap();
        (member_change_id, events.into_iter().next().unwrap())
    }

    async fn registry_owner(store: &Arc<dyn EventStore>, id: &str, value: &str) -> Option<Uuid> {
        UniqueValueRegistryRepository::new(store.clone())
            .load(id)
            .await
            .unwrap()
            .owner(value)
    }

    async fn reserve_elsewhere(store: &Arc<dyn EventStore>, registry_id: &str, value: &str) -> Uuid {
        let other = Uuid::new_v4();
        let repo = UniqueValueRegistryRepository::new(store.clone());
        let mut registry = repo.load(registry_id).await.unwrap();
        let command = Command::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            CommandPayload::ReserveValue {
                value: value.to_string(),
                owner_id: other,
                request_id: Uuid::new_v4(),
            },
        );
        exec_command(&command, &mut registry, store.as_ref())
            .await
            .unwrap();
        other
    }

    #[tokio::test]
    async fn create_reserves_and_creates_member() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let member_id = Uuid::new_v4();

        let (member_change_id, event) = request_create_member(
            &store,
            member_id,
            "alice",
            "alice@example.com",
            "ext-1",
        )
        .await;

        let saga_repo = MemberRequestSagaRepository::new(store.clone());
        let saga = saga_repo
            .load(&saga_stream_id(member_change_id))
            .await
            .unwrap();
        let events = saga.handle_event(&event).await.unwrap();
        assert!(events.is_empty());

        assert_eq!(
            registry_owner(&store, "username-alice", "alice").await,
            Some(member_id)
        );
        assert_eq!(
            registry_owner(&store, "email-alice@example.com", "alice@example.com").await,
            Some(member_id)
        );
        assert_eq!(
            registry_owner(&store, "matchuid-ext-1", "ext-1").await,
            Some(member_id)
        );

        let member = MemberRepository::new(store.clone())
            .load(member_id)
            .await
            .unwrap();
        assert!(member.created());
    }

    #[tokio::test]
    async fn email_conflict_releases_username_and_completes_with_error() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let member_id = Uuid::new_v4();

        let other = reserve_elsewhere(&store, "email-bob@example.com", "bob@example.com").await;

        let (member_change_id, event) =
            request_create_member(&store, member_id, "bob", "bob@example.com", "").await;

        let saga_repo = MemberRequestSagaRepository::new(store.clone());
        let saga = saga_repo
            .load(&saga_stream_id(member_change_id))
            .await
            .unwrap();
        saga.handle_event(&event).await.unwrap();

        // the username reservation taken in step one was rolled back
        assert_eq!(registry_owner(&store, "username-bob", "bob").await, None);
        // the conflicting reservation is untouched
        assert_eq!(
            registry_owner(&store, "email-bob@example.com", "bob@example.com").await,
            Some(other)
        );

        // the member change completed with an error reason
        let change = MemberChangeRepository::new(store.clone())
            .load(member_change_id)
            .await
            .unwrap();
        assert!(change.completed());

        let events = store
            .read_stream(&member_change_id.to_string(), 1, 100)
            .await
            .unwrap();
        let completed = events
            .iter()
            .find_map(|e| match e.payload().unwrap() {
                EventPayload::MemberChangeCompleted { error, reason, .. } => {
                    Some((error, reason))
                }
                _ => None,
            })
            .unwrap();
        assert!(completed.0);
        assert!(completed.1.contains("already reserved"));

        // and no member was created
        let member = MemberRepository::new(store.clone())
            .load(member_id)
            .await
            .unwrap();
        assert!(!member.created());
    }

    #[tokio::test]
    async fn completed_saga_ignores_redelivered_events() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let member_id = Uuid::new_v4();

        let (member_change_id, event) =
            request_create_member(&store, member_id, "carol", "carol@example.com", "").await;

        let saga_id = saga_stream_id(member_change_id);
        let saga_repo = MemberRequestSagaRepository::new(store.clone());

        // drive the saga to completion by hand
        let saga = saga_repo.load(&saga_id).await.unwrap();
        saga.handle_event(&event).await.unwrap();

        let completion = ProposedEvent::batch(
            vec![EventPayload::MemberRequestSagaCompleted {
                saga_id: saga_id.clone(),
            }],
            &EventMeta::default(),
        );
        store
            .append(
                completion,
                StreamCategory::MemberRequestSaga,
                &saga_id,
                saga.version(),
            )
            .await
            .unwrap();

        let saga = saga_repo.load(&saga_id).await.unwrap();
        assert!(saga.completed());

        // re-delivery produces nothing, and no new commands hit the store
        let before = store.last_sequence_number().await.unwrap();
        let events = saga.handle_event(&event).await.unwrap();
        assert!(events.is_empty());
        assert_eq!(store.last_sequence_number().await.unwrap(), before);
    }

    #[tokio::test]
    async fn rename_releases_previous_values() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let member_id = Uuid::new_v4();

        // create dave through the saga
        let (change_id, event) =
            request_create_member(&store, member_id, "dave", "dave@example.com", "").await;
        let saga_repo = MemberRequestSagaRepository::new(store.clone());
        let saga = saga_repo.load(&saga_stream_id(change_id)).await.unwrap();
        saga.handle_event(&event).await.unwrap();

        // request a rename
        let update_change_id = Uuid::new_v4();
        let repo = MemberChangeRepository::new(store.clone());
        let mut change = repo.load(update_change_id).await.unwrap();
        let command = Command::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            CommandPayload::RequestUpdateMember {
                member_id,
                is_admin: false,
                user_name: "david".to_string(),
                full_name: "Dave".to_string(),
                email: "dave@example.com".to_string(),
                prev_user_name: "dave".to_string(),
                prev_email: "dave@example.com".to_string(),
            },
        );
        exec_command(&command, &mut change, store.as_ref())
            .await
            .unwrap();
        let update_event = store
            .read_stream(&update_change_id.to_string(), 1, 100)
            .await
            .unwrap()
            .into_iter()
            .next()
            .unwrap();

        let saga = saga_repo
            .load(&saga_stream_id(update_change_id))
            .await
            .unwrap();
        saga.handle_event(&update_event).await.unwrap();

        // the member emitted MemberUpdated; feed it back to the saga the
        // way the poller would
        let member_events = store
            .read_stream(&member_id.to_string(), 1, 100)
            .await
            .unwrap();
        let updated = member_events
            .iter()
            .find(|e| e.event_type == "MemberUpdated")
            .unwrap();
        let saga = saga_repo
            .load(&saga_stream_id(update_change_id))
            .await
            .unwrap();
        saga.handle_event(updated).await.unwrap();

        // old username released, new one held
        assert_eq!(registry_owner(&store, "username-dave", "dave").await, None);
        assert_eq!(
            registry_owner(&store, "username-david", "david").await,
            Some(member_id)
        );
    }
}
