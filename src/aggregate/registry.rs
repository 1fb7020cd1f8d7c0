//! Unique-value registry aggregate.
//!
//! One registry instance exists per namespaced value (e.g.
//! `username-alice`); its durable state is the value's owner plus the sets
//! of already-processed reserve/release request ids, which make both
//! operations safe to replay any number of times.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::aggregate::{replay, Aggregate, CommandError, Result};
use crate::command::{Command, CommandPayload};
use crate::event::{EventPayload, StoredEvent, StreamCategory};
use crate::store::EventStore;

pub struct UniqueValueRegistryRepository {
    store: Arc<dyn EventStore>,
}

impl UniqueValueRegistryRepository {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self, id: &str) -> Result<UniqueValueRegistry> {
        debug!(id, "loading unique value registry");
        let mut registry = UniqueValueRegistry::new(id);
        replay(self.store.as_ref(), id, &mut registry).await?;
        Ok(registry)
    }
}

pub struct UniqueValueRegistry {
    id: String,
    version: i64,

    values: HashMap<String, Uuid>,
    reserve_requests: HashSet<Uuid>,
    release_requests: HashSet<Uuid>,
}

impl UniqueValueRegistry {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            version: 0,
            values: HashMap::new(),
            reserve_requests: HashSet::new(),
            release_requests: HashSet::new(),
        }
    }

    /// Current owner of a value, if reserved.
    pub fn owner(&self, value: &str) -> Option<Uuid> {
        self.values.get(value).copied()
    }

    fn handle_reserve_value(
        &self,
        value: &str,
        owner_id: Uuid,
        request_id: Uuid,
    ) -> Result<Vec<EventPayload>> {
        if self.reserve_requests.contains(&request_id) {
            return Ok(vec![]);
        }

        if let Some(current) = self.values.get(value) {
            if *current == owner_id {
                return Ok(vec![]);
            }
            return Err(CommandError::Rejected(format!(
                "value {value} already reserved to id: {current}"
            )));
        }

        Ok(vec![EventPayload::UniqueRegistryValueReserved {
            registry_id: self.id.clone(),
            value: value.to_string(),
            owner_id,
            request_id,
        }])
    }

    fn handle_release_value(
        &self,
        value: &str,
        owner_id: Uuid,
        request_id: Uuid,
    ) -> Result<Vec<EventPayload>> {
        if self.release_requests.contains(&request_id) {
            return Ok(vec![]);
        }

        // Releasing a value that is not reserved, or reserved to someone
        // else, is a silent no-op: compensations may arrive out of order
        // or more than once.
        if self.values.get(value) == Some(&owner_id) {
            return Ok(vec![EventPayload::UniqueRegistryValueReleased {
                registry_id: self.id.clone(),
                value: value.to_string(),
                owner_id,
                request_id,
            }]);
        }

        Ok(vec![])
    }

    fn apply_event(&mut self, event: &StoredEvent) -> Result<()> {
        if event.version <= self.version {
            return Ok(());
        }
        self.version = event.version;

        match event.payload()? {
            EventPayload::UniqueRegistryValueReserved {
                value,
                owner_id,
                request_id,
                ..
            } => {
                self.values.insert(value, owner_id);
                self.reserve_requests.insert(request_id);
            }
            EventPayload::UniqueRegistryValueReleased {
                value, request_id, ..
            } => {
                self.values.remove(&value);
                self.release_requests.insert(request_id);
            }
            _ => {}
        }

        Ok(())
    }
}

#[async_trait]
impl Aggregate for UniqueValueRegistry {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn category(&self) -> StreamCategory {
        StreamCategory::UniqueValueRegistry
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
            CommandPayload::ReserveValue {
                value,
                owner_id,
                request_id,
            } => self.handle_reserve_value(value, *owner_id, *request_id),
            CommandPayload::ReleaseValue {
                value,
                owner_id,
                request_id,
            } => self.handle_release_value(value, *owner_id, *request_id),
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

    fn command(payload: CommandPayload) -> Command {
        Command::new(Uuid::new_v4(), Uuid::new_v4(), None, payload)
    }

    fn reserve(value: &str, owner_id: Uuid, request_id: Uuid) -> Command {
        command(CommandPayload::ReserveValue {
            value: value.to_string(),
            owner_id,
            request_id,
        })
    }

    fn release(value: &str, owner_id: Uuid, request_id: Uuid) -> Command {
        command(CommandPayload::ReleaseValue {
            value: value.to_string(),
            owner_id,
            request_id,
        })
    }

    #[tokio::test]
    async fn reserve_release_is_idempotent_and_exclusive() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let repo = UniqueValueRegistryRepository::new(store.clone());

        let m1 = Uuid::new_v4();
        let m2 = Uuid::new_v4();
        let (r1, r2, r3, r4) = (
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
        );

        // first reservation succeeds and emits one event
        let mut registry = repo.load("username-alice").await.unwrap();
        let (_, n) = exec_command(&reserve("alice", m1, r1), &mut registry, store.as_ref())
            .await
            .unwrap();
        assert_eq!(n, 1);

        // same request id: no events
        let mut registry = repo.load("username-alice").await.unwrap();
        let (_, n) = exec_command(&reserve("alice", m1, r1), &mut registry, store.as_ref())
            .await
            .unwrap();
        assert_eq!(n, 0);

        // different owner: rejected with the current owner in the reason
        let mut registry = repo.load("username-alice").await.unwrap();
        let err = exec_command(&reserve("alice", m2, r2), &mut registry, store.as_ref())
            .await
            .unwrap_err();
        assert!(err.is_rejection());
        assert!(err.to_string().contains(&m1.to_string()));

        // release by the owner frees the value
        let mut registry = repo.load("username-alice").await.unwrap();
        let (_, n) = exec_command(&release("alice", m1, r3), &mut registry, store.as_ref())
            .await
            .unwrap();
        assert_eq!(n, 1);

        // now the other owner can reserve
        let mut registry = repo.load("username-alice").await.unwrap();
        let (_, n) = exec_command(&reserve("alice", m2, r4), &mut registry, store.as_ref())
            .await
            .unwrap();
        assert_eq!(n, 1);

        let registry = repo.load("username-alice").await.unwrap();
        assert_eq!(registry.owner("alice"), Some(m2));
    }

    #[tokio::test]
    async fn release_of_unreserved_value_is_a_noop() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let repo = UniqueValueRegistryRepository::new(store.clone());

        let mut registry = repo.load("email-bob@example.com").await.unwrap();
        let (_, n) = exec_command(
            &release("bob@example.com", Uuid::new_v4(), Uuid::new_v4()),
            &mut registry,
            store.as_ref(),
        )
        .await
        .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn release_by_non_owner_does_not_free_the_value() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let repo = UniqueValueRegistryRepository::new(store.clone());

        let owner = Uuid::new_v4();
        let stranger = Uuid::new_v4();

        let mut registry = repo.load("matchuid-x1").await.unwrap();
        exec_command(
            &reserve("x1", owner, Uuid::new_v4()),
            &mut registry,
            store.as_ref(),
        )
        .await
        .unwrap();

        let mut registry = repo.load("matchuid-x1").await.unwrap();
        let (_, n) = exec_command(
            &release("x1", stranger, Uuid::new_v4()),
            &mut registry,
            store.as_ref(),
        )
        .await
        .unwrap();
        assert_eq!(n, 0);

        let registry = repo.load("matchuid-x1").await.unwrap();
        assert_eq!(registry.owner("x1"), Some(owner));
    }
}
