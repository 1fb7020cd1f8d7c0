//! Member aggregate.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::aggregate::{replay, Aggregate, CommandError, Result};
use crate::command::{Command, CommandPayload};
use crate::event::{EventPayload, StoredEvent, StreamCategory};
use crate::store::EventStore;

pub struct MemberRepository {
    store: Arc<dyn EventStore>,
}

impl MemberRepository {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self, id: Uuid) -> Result<Member> {
        debug!(%id, "loading member");
        let mut member = Member::new(id);
        replay(self.store.as_ref(), &id.to_string(), &mut member).await?;
        Ok(member)
    }
}

pub struct Member {
    id: Uuid,
    version: i64,

    user_name: String,
    full_name: String,
    email: String,
    match_uid: String,
    is_admin: bool,

    created: bool,

    // Request ids already honoured, keyed by member-change id. Saga
    // retries re-issue the same commands; these make them no-ops.
    create_requests: HashSet<Uuid>,
    update_requests: HashSet<Uuid>,
    set_match_uid_requests: HashSet<Uuid>,
}

impl Member {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            version: 0,
            user_name: String::new(),
            full_name: String::new(),
            email: String::new(),
            match_uid: String::new(),
            is_admin: false,
            created: false,
            create_requests: HashSet::new(),
            update_requests: HashSet::new(),
            set_match_uid_requests: HashSet::new(),
        }
    }

    pub fn created(&self) -> bool {
        self.created
    }

    pub fn user_name(&self) -> &str {
        &self.user_name
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn match_uid(&self) -> &str {
        &self.match_uid
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_create_member(
        &self,
        member_change_id: Uuid,
        is_admin: bool,
        match_uid: &str,
        user_name: &str,
        full_name: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<Vec<EventPayload>> {
        if self.create_requests.contains(&member_change_id) {
            return Ok(vec![]);
        }

        if self.created {
            return Err(CommandError::Rejected("member already created".to_string()));
        }

        let mut events = vec![EventPayload::MemberCreated {
            member_id: self.id,
            member_change_id,
            user_name: user_name.to_string(),
            full_name: full_name.to_string(),
            email: email.to_string(),
            is_admin,
        }];

        if !password_hash.is_empty() {
            events.push(EventPayload::MemberPasswordSet {
                member_id: self.id,
                password_hash: password_hash.to_string(),
            });
        }

        if !match_uid.is_empty() {
            events.push(EventPayload::MemberMatchUidSet {
                member_id: self.id,
                member_change_id,
                match_uid: match_uid.to_string(),
                prev_match_uid: String::new(),
            });
        }

        Ok(events)
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_update_member(
        &self,
        member_change_id: Uuid,
        is_admin: bool,
        user_name: &str,
        full_name: &str,
        email: &str,
        prev_user_name: &str,
        prev_email: &str,
    ) -> Result<Vec<EventPayload>> {
        if self.update_requests.contains(&member_change_id) {
            return Ok(vec![]);
        }

        if !self.created {
            return Err(CommandError::Rejected("unexistent member".to_string()));
        }

        // The previous values were read from an eventually consistent view;
        // reject if they no longer match so the saga releases the wrong-way
        // reservations instead of leaking them.
        if self.user_name != prev_user_name {
            return Err(CommandError::Rejected(format!(
                "consistency error: prevUserName: {:?} != userName: {:?}",
                prev_user_name, self.user_name
            )));
        }
        if self.email != prev_email {
            return Err(CommandError::Rejected(format!(
                "consistency error: prevEmail: {:?} != email: {:?}",
                prev_email, self.email
            )));
        }

        Ok(vec![EventPayload::MemberUpdated {
            member_id: self.id,
            member_change_id,
            user_name: user_name.to_string(),
            full_name: full_name.to_string(),
            email: email.to_string(),
            is_admin,
            prev_user_name: self.user_name.clone(),
            prev_email: self.email.clone(),
        }])
    }

    fn handle_set_member_password(&self, password_hash: &str) -> Result<Vec<EventPayload>> {
        if !self.created {
            return Err(CommandError::Rejected("unexistent member".to_string()));
        }

        Ok(vec![EventPayload::MemberPasswordSet {
            member_id: self.id,
            password_hash: password_hash.to_string(),
        }])
    }

    fn handle_set_member_match_uid(
        &self,
        member_change_id: Uuid,
        match_uid: &str,
    ) -> Result<Vec<EventPayload>> {
        if self.set_match_uid_requests.contains(&member_change_id) {
            return Ok(vec![]);
        }

        Ok(vec![EventPayload::MemberMatchUidSet {
            member_id: self.id,
            member_change_id,
            match_uid: match_uid.to_string(),
            prev_match_uid: self.match_uid.clone(),
        }])
    }

    fn apply_event(&mut self, event: &StoredEvent) -> Result<()> {
        if event.version <= self.version {
            return Ok(());
        }
        self.version = event.version;

        match event.payload()? {
            EventPayload::MemberCreated {
                member_change_id,
                user_name,
                full_name,
                email,
                is_admin,
                ..
            } => {
                self.created = true;
                self.user_name = user_name;
                self.full_name = full_name;
                self.email = email;
                self.is_admin = is_admin;
                self.create_requests.insert(member_change_id);
            }
            EventPayload::MemberUpdated {
                member_change_id,
                user_name,
                full_name,
                email,
                is_admin,
                ..
            } => {
                self.user_name = user_name;
                self.full_name = full_name;
                self.email = email;
                self.is_admin = is_admin;
                self.update_requests.insert(member_change_id);
            }
            EventPayload::MemberMatchUidSet {
                member_change_id,
                match_uid,
                ..
            } => {
                self.match_uid = match_uid;
                self.set_match_uid_requests.insert(member_change_id);
            }
            EventPayload::MemberPasswordSet { .. } => {}
            _ => {}
        }

        Ok(())
    }
}

#[async_trait]
impl Aggregate for Member {
    fn id(&self) -> String {
        self.id.to_string()
    }

    fn category(&self) -> StreamCategory {
        StreamCategory::Member
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
        match &command.payload {
            CommandPayload::CreateMember {
                member_change_id,
                is_admin,
                match_uid,
                user_name,
                full_name,
                email,
                password_hash,
            } => self.handle_create_member(
                *member_change_id,
                *is_admin,
                match_uid,
                user_name,
                full_name,
                email,
                password_hash,
            ),
            CommandPayload::UpdateMember {
                member_change_id,
                is_admin,
                user_name,
                full_name,
                email,
                prev_user_name,
                prev_email,
            } => self.handle_update_member(
                *member_change_id,
                *is_admin,
                user_name,
                full_name,
                email,
                prev_user_name,
                prev_email,
            ),
            CommandPayload::SetMemberPassword { password_hash } => {
                self.handle_set_member_password(password_hash)
            }
            CommandPayload::SetMemberMatchUid {
                member_change_id,
                match_uid,
            } => self.handle_set_member_match_uid(*member_change_id, match_uid),
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

    fn create_command(member_change_id: Uuid) -> Command {
        Command::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            CommandPayload::CreateMember {
                member_change_id,
                is_admin: false,
                match_uid: String::new(),
                user_name: "alice".to_string(),
                full_name: "Alice Example".to_string(),
                email: "alice@example.com".to_string(),
                password_hash: "hash".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn create_then_duplicate_create_request_is_noop() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let repo = MemberRepository::new(store.clone());

        let member_id = Uuid::new_v4();
        let change_id = Uuid::new_v4();

        let mut member = repo.load(member_id).await.unwrap();
        let (_, n) = exec_command(&create_command(change_id), &mut member, store.as_ref())
            .await
            .unwrap();
        // MemberCreated + MemberPasswordSet
        assert_eq!(n, 2);

        let mut member = repo.load(member_id).await.unwrap();
        assert!(member.created());
        let (_, n) = exec_command(&create_command(change_id), &mut member, store.as_ref())
            .await
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn second_create_with_new_request_is_rejected() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let repo = MemberRepository::new(store.clone());

        let member_id = Uuid::new_v4();
        let mut member = repo.load(member_id).await.unwrap();
        exec_command(
            &create_command(Uuid::new_v4()),
            &mut member,
            store.as_ref(),
        )
        .await
        .unwrap();

        let mut member = repo.load(member_id).await.unwrap();
        let err = exec_command(
            &create_command(Uuid::new_v4()),
            &mut member,
            store.as_ref(),
        )
        .await
        .unwrap_err();
        assert!(err.is_rejection());
    }

    #[tokio::test]
    async fn update_rejects_stale_previous_values() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let repo = MemberRepository::new(store.clone());

        let member_id = Uuid::new_v4();
        let mut member = repo.load(member_id).await.unwrap();
        exec_command(
            &create_command(Uuid::new_v4()),
            &mut member,
            store.as_ref(),
        )
        .await
        .unwrap();

        let mut member = repo.load(member_id).await.unwrap();
        let command = Command::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            CommandPayload::UpdateMember {
                member_change_id: Uuid::new_v4(),
                is_admin: false,
                user_name: "alice2".to_string(),
                full_name: "Alice Example".to_string(),
                email: "alice@example.com".to_string(),
                prev_user_name: "stale-name".to_string(),
                prev_email: "alice@example.com".to_string(),
            },
        );
        let err = exec_command(&command, &mut member, store.as_ref())
            .await
            .unwrap_err();
        assert!(err.is_rejection());
        assert!(err.to_string().contains("consistency error"));
    }

    #[tokio::test]
    async fn set_match_uid_records_previous_value() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let repo = MemberRepository::new(store.clone());

        let member_id = Uuid::new_v4();
        let mut member = repo.load(member_id).await.unwrap();
        exec_command(
            &create_command(Uuid::new_v4()),
            &mut member,
            store.as_ref(),
        )
        .await
        .unwrap();

        let set = |change: Uuid, value: &str| {
            Command::new(
                Uuid::new_v4(),
                Uuid::new_v4(),
                None,
                CommandPayload::SetMemberMatchUid {
                    member_change_id: change,
                    match_uid: value.to_string(),
                },
            )
        };

        let mut member = repo.load(member_id).await.unwrap();
        exec_command(&set(Uuid::new_v4(), "uid-1"), &mut member, store.as_ref())
            .await
            .unwrap();

        let mut member = repo.load(member_id).await.unwrap();
        assert_eq!(member.match_uid(), "uid-1");
        exec_command(&set(Uuid::new_v4(), "uid-2"), &mut member, store.as_ref())
            .await
            .unwrap();

        let member = repo.load(member_id).await.unwrap();
        let events = store
            .read_stream(&member_id.to_string(), 1, 100)
            .await
            .unwrap();
        let last = events.last().unwrap().payload().unwrap();
        match last {
            EventPayload::MemberMatchUidSet {
                match_uid,
                prev_match_uid,
                ..
            } => {
                assert_eq!(match_uid, "uid-2");
                assert_eq!(prev_match_uid, "uid-1");
            }
            other => panic!("unexpected payload: {other:?}"),
        }
        assert_eq!(member.match_uid(), "uid-2");
    }
}
