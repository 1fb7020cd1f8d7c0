//! Tension aggregate.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::aggregate::{replay, Aggregate, CommandError, Result};
use crate::command::{Command, CommandPayload};
use crate::event::{EventPayload, StoredEvent, StreamCategory};
use crate::store::EventStore;

pub struct TensionRepository {
    store: Arc<dyn EventStore>,
}

impl TensionRepository {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub async fn load(&self, id: Uuid) -> Result<Tension> {
        debug!(%id, "loading tension");
        let mut tension = Tension::new(id);
        replay(self.store.as_ref(), &id.to_string(), &mut tension).await?;
        Ok(tension)
    }
}

pub struct Tension {
    id: Uuid,
    version: i64,

    title: String,
    description: String,
    role_id: Option<Uuid>,
    closed: bool,

    created: bool,
}

impl Tension {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            version: 0,
            title: String::new(),
            description: String::new(),
            role_id: None,
            closed: false,
            created: false,
        }
    }

    pub fn role_id(&self) -> Option<Uuid> {
        self.role_id
    }

    pub fn closed(&self) -> bool {
        self.closed
    }

    fn handle_create_tension(
        &self,
        member_id: Uuid,
        title: &str,
        description: &str,
        role_id: Option<Uuid>,
    ) -> Result<Vec<EventPayload>> {
        if self.created {
            return Err(CommandError::Rejected(
                "tension already created".to_string(),
            ));
        }

        Ok(vec![EventPayload::TensionCreated {
            tension_id: self.id,
            member_id,
            role_id,
            title: title.to_string(),
            description: description.to_string(),
        }])
    }

    fn handle_update_tension(
        &self,
        title: &str,
        description: &str,
        role_id: Option<Uuid>,
    ) -> Result<Vec<EventPayload>> {
        if !self.created {
            return Err(CommandError::Rejected("unexistent tension".to_string()));
        }

        let mut events = vec![];
        if self.role_id != role_id {
            events.push(EventPayload::TensionRoleChanged {
                tension_id: self.id,
                prev_role_id: self.role_id,
                role_id,
            });
        }
        events.push(EventPayload::TensionUpdated {
            tension_id: self.id,
            title: title.to_string(),
            description: description.to_string(),
        });

        Ok(events)
    }

    fn handle_change_tension_role(
        &self,
        role_id: Option<Uuid>,
        tension_version: i64,
    ) -> Result<Vec<EventPayload>> {
        // When a version is provided, apply only if the tension still
        // matches it; a stale version means someone else moved it first.
        if tension_version != 0 && tension_version != self.version {
            return Ok(vec![]);
        }

        Ok(vec![EventPayload::TensionRoleChanged {
            tension_id: self.id,
            prev_role_id: self.role_id,
            role_id,
        }])
    }

    fn handle_close_tension(&self, reason: &str) -> Result<Vec<EventPayload>> {
        if !self.created {
            return Err(CommandError::Rejected("unexistent tension".to_string()));
        }

        Ok(vec![EventPayload::TensionClosed {
            tension_id: self.id,
            reason: reason.to_string(),
        }])
    }

    fn apply_event(&mut self, event: &StoredEvent) -> Result<()> {
        if event.version <= self.version {
            return Ok(());
        }
        self.version = event.version;

        match event.payload()? {
            EventPayload::TensionCreated {
                role_id,
                title,
                description,
                ..
            } => {
                self.created = true;
                self.title = title;
                self.description = description;
                self.role_id = role_id;
            }
            EventPayload::TensionUpdated {
                title, description, ..
            } => {
                self.title = title;
                self.description = description;
            }
            EventPayload::TensionRoleChanged { role_id, .. } => {
                self.role_id = role_id;
            }
            EventPayload::TensionClosed { .. } => {
                self.closed = true;
            }
            _ => {}
        }

        Ok(())
    }
}

#[async_trait]
impl Aggregate for Tension {
    fn id(&self) -> String {
        self.id.to_string()
    }

    fn category(&self) -> StreamCategory {
        StreamCategory::Tension
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
            CommandPayload::CreateTension {
                member_id,
                title,
                description,
                role_id,
            } => self.handle_create_tension(*member_id, title, description, *role_id),
            CommandPayload::UpdateTension {
                title,
                description,
                role_id,
            } => self.handle_update_tension(title, description, *role_id),
            CommandPayload::ChangeTensionRole {
                role_id,
                tension_version,
            } => self.handle_change_tension_role(*role_id, *tension_version),
            CommandPayload::CloseTension { reason } => self.handle_close_tension(reason),
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

    fn create(role_id: Option<Uuid>) -> Command {
        Command::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            CommandPayload::CreateTension {
                member_id: Uuid::new_v4(),
                title: "too many meetings".to_string(),
                description: "weekly sync is daily".to_string(),
                role_id,
            },
        )
    }

    #[tokio::test]
    async fn update_emits_role_change_only_when_role_differs() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let repo = TensionRepository::new(store.clone());
        let id = Uuid::new_v4();
        let role = Uuid::new_v4();

        let mut tension = repo.load(id).await.unwrap();
        exec_command(&create(Some(role)), &mut tension, store.as_ref())
            .await
            .unwrap();

        // same role: only TensionUpdated
        let update = Command::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            CommandPayload::UpdateTension {
                title: "t".to_string(),
                description: "d".to_string(),
                role_id: Some(role),
            },
        );
        let mut tension = repo.load(id).await.unwrap();
        let (_, n) = exec_command(&update, &mut tension, store.as_ref())
            .await
            .unwrap();
        assert_eq!(n, 1);

        // role removed: TensionRoleChanged + TensionUpdated
        let update = Command::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            CommandPayload::UpdateTension {
                title: "t".to_string(),
                description: "d".to_string(),
                role_id: None,
            },
        );
        let mut tension = repo.load(id).await.unwrap();
        let (_, n) = exec_command(&update, &mut tension, store.as_ref())
            .await
            .unwrap();
        assert_eq!(n, 2);

        let tension = repo.load(id).await.unwrap();
        assert_eq!(tension.role_id(), None);
    }

    #[tokio::test]
    async fn change_role_with_stale_version_is_a_noop() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let repo = TensionRepository::new(store.clone());
        let id = Uuid::new_v4();

        let mut tension = repo.load(id).await.unwrap();
        exec_command(&create(None), &mut tension, store.as_ref())
            .await
            .unwrap();

        let change = Command::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            None,
            CommandPayload::ChangeTensionRole {
                role_id: Some(Uuid::new_v4()),
                tension_version: 99,
            },
        );
        let mut tension = repo.load(id).await.unwrap();
        let (_, n) = exec_command(&change, &mut tension, store.as_ref())
            .await
            .unwrap();
        assert_eq!(n, 0);
    }
}
