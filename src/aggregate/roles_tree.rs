//! Roles-tree aggregate.
//!
//! The whole role hierarchy is a single aggregate so that structural
//! changes (create/move/delete roles, membership edges) stay transactional.
//! Command validation needs relational lookups, so the aggregate owns a
//! private SQLite projection of its own stream: a disposable cache keyed by
//! a persisted last-applied-version marker, rebuildable from the log at any
//! time and never a source of truth.

use std::sync::Arc;

use async_trait::async_trait;
use sea_query::{Expr, Iden, Query, SqliteQueryBuilder};
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::aggregate::{Aggregate, CommandError, Result, LOAD_BATCH_SIZE};
use crate::command::{Command, CommandPayload, DescriptionEdit};
use crate::event::{
    roles_tree_stream_id, EventPayload, RoleType, StoredEvent, StreamCategory,
};
use crate::store::EventStore;

// Projection schema. Lives in its own pool/database, not in the event
// store.

#[derive(Iden)]
enum Role {
    Table,
    Id,
    ParentId,
    RoleType,
    Name,
    Purpose,
}

#[derive(Iden)]
enum Domain {
    Table,
    Id,
    RoleId,
    Description,
}

#[derive(Iden)]
enum Accountability {
    Table,
    Id,
    RoleId,
    Description,
}

#[derive(Iden)]
enum RoleMember {
    Table,
    MemberId,
    RoleId,
}

#[derive(Iden)]
enum CircleDirectMember {
    Table,
    MemberId,
    RoleId,
}

#[derive(Iden)]
enum Marker {
    Table,
    Version,
}

const PROJECTION_CREATE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS role (
    id TEXT NOT NULL,
    parent_id TEXT,
    role_type TEXT NOT NULL,
    name TEXT NOT NULL,
    purpose TEXT NOT NULL,
    PRIMARY KEY (id)
);
CREATE TABLE IF NOT EXISTS domain (
    id TEXT NOT NULL,
    role_id TEXT NOT NULL,
    description TEXT NOT NULL,
    PRIMARY KEY (id)
);
CREATE TABLE IF NOT EXISTS accountability (
    id TEXT NOT NULL,
    role_id TEXT NOT NULL,
    description TEXT NOT NULL,
    PRIMARY KEY (id)
);
CREATE TABLE IF NOT EXISTS role_member (
    member_id TEXT NOT NULL,
    role_id TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS circle_direct_member (
    member_id TEXT NOT NULL,
    role_id TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS marker (
    version INTEGER NOT NULL
);
"#;

/// One row of the role table.
#[derive(Debug, Clone)]
pub struct RoleRecord {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub role_type: RoleType,
    pub name: String,
    pub purpose: String,
}

pub struct RolesTreeRepository {
    pool: SqlitePool,
    store: Arc<dyn EventStore>,
}

impl RolesTreeRepository {
    /// `pool` is the projection database, private to this aggregate.
    pub fn new(pool: SqlitePool, store: Arc<dyn EventStore>) -> Self {
        Self { pool, store }
    }

    pub async fn load(&self) -> Result<RolesTree> {
        let mut tree = RolesTree::new(self.pool.clone());
        tree.init_schema().await?;

        // The projection can be behind the stream or rebuilt from nothing.
        // Catch up in batches keyed on its persisted marker; apply_events
        // skips anything at or below the marker, so racing instances on a
        // shared projection are harmless.
        loop {
            let version = tree.projection_version().await?;
            tree.version = version;

            let events = self
                .store
                .read_stream(&tree.id(), version + 1, LOAD_BATCH_SIZE)
                .await?;
            if events.is_empty() {
                tree.check_broken_edges().await?;
                break;
            }
            tree.apply_events(&events).await?;
        }

        Ok(tree)
    }
}

pub struct RolesTree {
    pool: SqlitePool,
    id: Uuid,
    version: i64,
}

impl RolesTree {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            id: roles_tree_stream_id(),
            version: 0,
        }
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(PROJECTION_CREATE_SQL)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn projection_version(&self) -> Result<i64> {
        let query = Query::select()
            .column(Marker::Version)
            .from(Marker::Table)
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        Ok(row.map(|row| row.get(0)).unwrap_or(0))
    }

    async fn tx_projection_version(conn: &mut SqliteConnection) -> Result<i64> {
        let query = Query::select()
            .column(Marker::Version)
            .from(Marker::Table)
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query).fetch_optional(&mut *conn).await?;
        Ok(row.map(|row| row.get(0)).unwrap_or(0))
    }

    async fn set_projection_version(conn: &mut SqliteConnection, version: i64) -> Result<()> {
        let delete = Query::delete()
            .from_table(Marker::Table)
            .to_string(SqliteQueryBuilder);
        sqlx::query(&delete).execute(&mut *conn).await?;
        let insert = Query::insert()
            .into_table(Marker::Table)
            .columns([Marker::Version])
            .values_panic([version.into()])
            .to_string(SqliteQueryBuilder);
        sqlx::query(&insert).execute(&mut *conn).await?;
        Ok(())
    }

    /// Fetch a role by id.
    pub async fn role(&self, role_id: Uuid) -> Result<Option<RoleRecord>> {
        let query = Query::select()
            .columns([
                Role::Id,
                Role::ParentId,
                Role::RoleType,
                Role::Name,
                Role::Purpose,
            ])
            .from(Role::Table)
            .and_where(Expr::col(Role::Id).eq(role_id.to_string()))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.map(|row| scan_role(&row)).transpose()
    }

    /// Fetch the root role (the only role without a parent).
    pub async fn root_role(&self) -> Result<Option<RoleRecord>> {
        let query = Query::select()
            .columns([
                Role::Id,
                Role::ParentId,
                Role::RoleType,
                Role::Name,
                Role::Purpose,
            ])
            .from(Role::Table)
            .and_where(Expr::col(Role::ParentId).is_null())
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.map(|row| scan_role(&row)).transpose()
    }

    /// Fetch the direct children of a role.
    pub async fn child_roles(&self, role_id: Uuid) -> Result<Vec<RoleRecord>> {
        let query = Query::select()
            .columns([
                Role::Id,
                Role::ParentId,
                Role::RoleType,
                Role::Name,
                Role::Purpose,
            ])
            .from(Role::Table)
            .and_where(Expr::col(Role::ParentId).eq(role_id.to_string()))
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(scan_role).collect()
    }

    async fn domain_role(&self, domain_id: Uuid) -> Result<Option<Uuid>> {
        let query = Query::select()
            .column(Domain::RoleId)
            .from(Domain::Table)
            .and_where(Expr::col(Domain::Id).eq(domain_id.to_string()))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.map(|row| parse_uuid(row.get(0))).transpose()
    }

    async fn accountability_role(&self, accountability_id: Uuid) -> Result<Option<Uuid>> {
        let query = Query::select()
            .column(Accountability::RoleId)
            .from(Accountability::Table)
            .and_where(Expr::col(Accountability::Id).eq(accountability_id.to_string()))
            .to_string(SqliteQueryBuilder);
        let row = sqlx::query(&query).fetch_optional(&self.pool).await?;
        row.map(|row| parse_uuid(row.get(0))).transpose()
    }

    async fn role_domain_ids(&self, role_id: Uuid) -> Result<Vec<Uuid>> {
        let query = Query::select()
            .column(Domain::Id)
            .from(Domain::Table)
            .and_where(Expr::col(Domain::RoleId).eq(role_id.to_string()))
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(|row| parse_uuid(row.get(0))).collect()
    }

    async fn role_accountability_ids(&self, role_id: Uuid) -> Result<Vec<Uuid>> {
        let query = Query::select()
            .column(Accountability::Id)
            .from(Accountability::Table)
            .and_where(Expr::col(Accountability::RoleId).eq(role_id.to_string()))
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(|row| parse_uuid(row.get(0))).collect()
    }

    /// Member ids directly filling a role.
    pub async fn role_member_ids(&self, role_id: Uuid) -> Result<Vec<Uuid>> {
        let query = Query::select()
            .column(RoleMember::MemberId)
            .from(RoleMember::Table)
            .and_where(Expr::col(RoleMember::RoleId).eq(role_id.to_string()))
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(|row| parse_uuid(row.get(0))).collect()
    }

    /// Member ids directly assigned to a circle.
    pub async fn circle_direct_member_ids(&self, role_id: Uuid) -> Result<Vec<Uuid>> {
        let query = Query::select()
            .column(CircleDirectMember::MemberId)
            .from(CircleDirectMember::Table)
            .and_where(Expr::col(CircleDirectMember::RoleId).eq(role_id.to_string()))
            .to_string(SqliteQueryBuilder);
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(|row| parse_uuid(row.get(0))).collect()
    }

    /// Referential-integrity self-check run after catch-up: no orphaned
    /// parents, domains, accountabilities or membership edges.
    pub async fn check_broken_edges(&self) -> Result<()> {
        let orphans: i64 = sqlx::query(
            "SELECT count(*) FROM role r1 LEFT JOIN role r2 ON r1.parent_id = r2.id \
             WHERE r2.id IS NULL",
        )
        .fetch_one(&self.pool)
        .await?
        .get(0);
        // the root role has no parent, everything else must
        if orphans > 1 {
            return Err(CommandError::Integrity(format!(
                "there are {} broken roles",
                orphans - 1
            )));
        }

        for (table, source) in [
            ("domain", "id"),
            ("accountability", "id"),
            ("role_member", "member_id"),
            ("circle_direct_member", "member_id"),
        ] {
            let broken: i64 = sqlx::query(&format!(
                "SELECT count(t.{source}) FROM {table} t LEFT JOIN role r ON t.role_id = r.id \
                 WHERE r.id IS NULL"
            ))
            .fetch_one(&self.pool)
            .await?
            .get(0);
            if broken > 0 {
                return Err(CommandError::Integrity(format!(
                    "there are {broken} broken {table}"
                )));
            }
        }

        Ok(())
    }

    // command handlers

    async fn handle_setup_root_role(&self, name: &str) -> Result<Vec<EventPayload>> {
        if self.root_role().await?.is_some() {
            return Err(CommandError::Rejected("root role already set up".to_string()));
        }
        if name.is_empty() {
            return Err(CommandError::Rejected("empty role name".to_string()));
        }

        Ok(vec![EventPayload::RoleCreated {
            role_id: Uuid::new_v4(),
            parent_role_id: None,
            role_type: RoleType::Circle,
            name: name.to_string(),
            purpose: String::new(),
        }])
    }

    async fn handle_circle_create_child_role(
        &self,
        parent_role_id: Uuid,
        name: &str,
        role_type: RoleType,
        purpose: &str,
        domains: &[String],
        accountabilities: &[String],
    ) -> Result<Vec<EventPayload>> {
        let Some(parent) = self.role(parent_role_id).await? else {
            return Err(CommandError::Rejected(format!(
                "role {parent_role_id} doesn't exist"
            )));
        };
        if parent.role_type != RoleType::Circle {
            return Err(CommandError::Rejected(format!(
                "role {parent_role_id} isn't a circle"
            )));
        }
        if name.is_empty() {
            return Err(CommandError::Rejected("empty role name".to_string()));
        }

        let role_id = Uuid::new_v4();
        let mut events = vec![EventPayload::RoleCreated {
            role_id,
            parent_role_id: Some(parent_role_id),
            role_type,
            name: name.to_string(),
            purpose: purpose.to_string(),
        }];
        for description in domains {
            events.push(EventPayload::RoleDomainCreated {
                domain_id: Uuid::new_v4(),
                role_id,
                description: description.clone(),
            });
        }
        for description in accountabilities {
            events.push(EventPayload::RoleAccountabilityCreated {
                accountability_id: Uuid::new_v4(),
                role_id,
                description: description.clone(),
            });
        }

        Ok(events)
    }

    #[allow(clippy::too_many_arguments)]
    async fn handle_circle_update_child_role(
        &self,
        role_id: Uuid,
        name: &Option<String>,
        purpose: &Option<String>,
        create_domains: &[String],
        update_domains: &[DescriptionEdit],
        delete_domains: &[Uuid],
        create_accountabilities: &[String],
        update_accountabilities: &[DescriptionEdit],
        delete_accountabilities: &[Uuid],
    ) -> Result<Vec<EventPayload>> {
        let Some(role) = self.role(role_id).await? else {
            return Err(CommandError::Rejected(format!(
                "role {role_id} doesn't exist"
            )));
        };
        if role.parent_id.is_none() {
            return Err(CommandError::Rejected(
                "role is the root role".to_string(),
            ));
        }

        let mut events = vec![];

        let new_name = name.clone().unwrap_or_else(|| role.name.clone());
        let new_purpose = purpose.clone().unwrap_or_else(|| role.purpose.clone());
        if new_name.is_empty() {
            return Err(CommandError::Rejected("empty role name".to_string()));
        }
        if new_name != role.name || new_purpose != role.purpose {
            events.push(EventPayload::RoleUpdated {
                role_id,
                role_type: role.role_type,
                name: new_name,
                purpose: new_purpose,
            });
        }

        for domain_id in delete_domains {
            match self.domain_role(*domain_id).await? {
                Some(owner) if owner == role_id => {}
                _ => {
                    return Err(CommandError::Rejected(format!(
                        "domain {domain_id} doesn't belong to role {role_id}"
                    )))
                }
            }
            events.push(EventPayload::RoleDomainDeleted {
                domain_id: *domain_id,
            });
        }
        for edit in update_domains {
            match self.domain_role(edit.id).await? {
                Some(owner) if owner == role_id => {}
                _ => {
                    return Err(CommandError::Rejected(format!(
                        "domain {} doesn't belong to role {role_id}",
                        edit.id
                    )))
                }
            }
            events.push(EventPayload::RoleDomainUpdated {
                domain_id: edit.id,
                description: edit.description.clone(),
            });
        }
        for description in create_domains {
            events.push(EventPayload::RoleDomainCreated {
                domain_id: Uuid::new_v4(),
                role_id,
                description: description.clone(),
            });
        }

        for accountability_id in delete_accountabilities {
            match self.accountability_role(*accountability_id).await? {
                Some(owner) if owner == role_id => {}
                _ => {
                    return Err(CommandError::Rejected(format!(
                        "accountability {accountability_id} doesn't belong to role {role_id}"
                    )))
                }
            }
            events.push(EventPayload::RoleAccountabilityDeleted {
                accountability_id: *accountability_id,
            });
        }
        for edit in update_accountabilities {
            match self.accountability_role(edit.id).await? {
                Some(owner) if owner == role_id => {}
                _ => {
                    return Err(CommandError::Rejected(format!(
                        "accountability {} doesn't belong to role {role_id}",
                        edit.id
                    )))
                }
            }
            events.push(EventPayload::RoleAccountabilityUpdated {
                accountability_id: edit.id,
                description: edit.description.clone(),
            });
        }
        for description in create_accountabilities {
            events.push(EventPayload::RoleAccountabilityCreated {
                accountability_id: Uuid::new_v4(),
                role_id,
                description: description.clone(),
            });
        }

        Ok(events)
    }

    async fn handle_circle_delete_child_role(&self, role_id: Uuid) -> Result<Vec<EventPayload>> {
        let Some(role) = self.role(role_id).await? else {
            return Err(CommandError::Rejected(format!(
                "role {role_id} doesn't exist"
            )));
        };
        if role.parent_id.is_none() {
            return Err(CommandError::Rejected(
                "role is the root role".to_string(),
            ));
        }

        let mut events = vec![];
        self.delete_role_recursive(role_id, &mut events).await?;
        Ok(events)
    }

    /// Depth-first delete: children go before their parent so the
    /// projection never holds an orphaned edge mid-replay.
    fn delete_role_recursive<'a>(
        &'a self,
        role_id: Uuid,
        events: &'a mut Vec<EventPayload>,
    ) -> futures::future::BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            for child in self.child_roles(role_id).await? {
                self.delete_role_recursive(child.id, events).await?;
            }

            for member_id in self.role_member_ids(role_id).await? {
                events.push(EventPayload::RoleMemberRemoved { role_id, member_id });
            }
            for member_id in self.circle_direct_member_ids(role_id).await? {
                events.push(EventPayload::CircleDirectMemberRemoved { role_id, member_id });
            }
            for domain_id in self.role_domain_ids(role_id).await? {
                events.push(EventPayload::RoleDomainDeleted { domain_id });
            }
            for accountability_id in self.role_accountability_ids(role_id).await? {
                events.push(EventPayload::RoleAccountabilityDeleted { accountability_id });
            }
            events.push(EventPayload::RoleDeleted { role_id });

            Ok(())
        })
    }

    async fn handle_circle_add_direct_member(
        &self,
        role_id: Uuid,
        member_id: Uuid,
    ) -> Result<Vec<EventPayload>> {
        let Some(role) = self.role(role_id).await? else {
            return Err(CommandError::Rejected(format!(
                "role {role_id} doesn't exist"
            )));
        };
        if role.role_type != RoleType::Circle {
            return Err(CommandError::Rejected(format!(
                "role {role_id} isn't a circle"
            )));
        }
        if self
            .circle_direct_member_ids(role_id)
            .await?
            .contains(&member_id)
        {
            return Err(CommandError::Rejected(
                "member is already a direct member of the circle".to_string(),
            ));
        }

        Ok(vec![EventPayload::CircleDirectMemberAdded { role_id, member_id }])
    }

    async fn handle_circle_remove_direct_member(
        &self,
        role_id: Uuid,
        member_id: Uuid,
    ) -> Result<Vec<EventPayload>> {
        if !self
            .circle_direct_member_ids(role_id)
            .await?
            .contains(&member_id)
        {
            return Err(CommandError::Rejected(
                "member isn't a direct member of the circle".to_string(),
            ));
        }

        Ok(vec![EventPayload::CircleDirectMemberRemoved { role_id, member_id }])
    }

    async fn handle_role_add_member(
        &self,
        role_id: Uuid,
        member_id: Uuid,
        focus: &Option<String>,
    ) -> Result<Vec<EventPayload>> {
        let Some(role) = self.role(role_id).await? else {
            return Err(CommandError::Rejected(format!(
                "role {role_id} doesn't exist"
            )));
        };
        if role.role_type != RoleType::Normal {
            return Err(CommandError::Rejected(
                "circles take direct members, not role members".to_string(),
            ));
        }
        if self.role_member_ids(role_id).await?.contains(&member_id) {
            return Err(CommandError::Rejected(
                "member is already assigned to the role".to_string(),
            ));
        }

        Ok(vec![EventPayload::RoleMemberAdded {
            role_id,
            member_id,
            focus: focus.clone(),
        }])
    }

    async fn handle_role_remove_member(
        &self,
        role_id: Uuid,
        member_id: Uuid,
    ) -> Result<Vec<EventPayload>> {
        if !self.role_member_ids(role_id).await?.contains(&member_id) {
            return Err(CommandError::Rejected(
                "member isn't assigned to the role".to_string(),
            ));
        }

        Ok(vec![EventPayload::RoleMemberRemoved { role_id, member_id }])
    }

    // projection writes

    async fn apply_event(&mut self, conn: &mut SqliteConnection, event: &StoredEvent) -> Result<()> {
        // skip events the shared projection already holds
        let current = Self::tx_projection_version(conn).await?;
        if event.version <= current {
            self.version = current;
            return Ok(());
        }

        debug!(%event, "applying roles tree event");
        self.version = event.version;

        match event.payload()? {
            EventPayload::RoleCreated {
                role_id,
                parent_role_id,
                role_type,
                name,
                purpose,
            } => {
                let insert = Query::insert()
                    .into_table(Role::Table)
                    .columns([
                        Role::Id,
                        Role::ParentId,
                        Role::RoleType,
                        Role::Name,
                        Role::Purpose,
                    ])
                    .values_panic([
                        role_id.to_string().into(),
                        parent_role_id.map(|id| id.to_string()).into(),
                        role_type.as_str().into(),
                        name.into(),
                        purpose.into(),
                    ])
                    .to_string(SqliteQueryBuilder);
                sqlx::query(&insert).execute(&mut *conn).await?;
            }
            EventPayload::RoleUpdated {
                role_id,
                role_type,
                name,
                purpose,
            } => {
                let update = Query::update()
                    .table(Role::Table)
                    .value(Role::RoleType, role_type.as_str())
                    .value(Role::Name, name)
                    .value(Role::Purpose, purpose)
                    .and_where(Expr::col(Role::Id).eq(role_id.to_string()))
                    .to_string(SqliteQueryBuilder);
                sqlx::query(&update).execute(&mut *conn).await?;
            }
            EventPayload::RoleDeleted { role_id } => {
                let delete = Query::delete()
                    .from_table(Role::Table)
                    .and_where(Expr::col(Role::Id).eq(role_id.to_string()))
                    .to_string(SqliteQueryBuilder);
                sqlx::query(&delete).execute(&mut *conn).await?;
            }
            EventPayload::RoleChangedParent {
                role_id,
                parent_role_id,
            } => {
                let update = Query::update()
                    .table(Role::Table)
                    .value(Role::ParentId, parent_role_id.map(|id| id.to_string()))
                    .and_where(Expr::col(Role::Id).eq(role_id.to_string()))
                    .to_string(SqliteQueryBuilder);
                sqlx::query(&update).execute(&mut *conn).await?;
            }
            EventPayload::RoleDomainCreated {
                domain_id,
                role_id,
                description,
            } => {
                let insert = Query::insert()
                    .into_table(Domain::Table)
                    .columns([Domain::Id, Domain::RoleId, Domain::Description])
                    .values_panic([
                        domain_id.to_string().into(),
                        role_id.to_string().into(),
                        description.into(),
                    ])
                    .to_string(SqliteQueryBuilder);
                sqlx::query(&insert).execute(&mut *conn).await?;
            }
            EventPayload::RoleDomainUpdated {
                domain_id,
                description,
            } => {
                let update = Query::update()
                    .table(Domain::Table)
                    .value(Domain::Description, description)
                    .and_where(Expr::col(Domain::Id).eq(domain_id.to_string()))
                    .to_string(SqliteQueryBuilder);
                sqlx::query(&update).execute(&mut *conn).await?;
            }
            EventPayload::RoleDomainDeleted { domain_id } => {
                let delete = Query::delete()
                    .from_table(Domain::Table)
                    .and_where(Expr::col(Domain::Id).eq(domain_id.to_string()))
                    .to_string(SqliteQueryBuilder);
                sqlx::query(&delete).execute(&mut *conn).await?;
            }
            EventPayload::RoleAccountabilityCreated {
                accountability_id,
                role_id,
                description,
            } => {
                let insert = Query::insert()
                    .into_table(Accountability::Table)
                    .columns([
                        Accountability::Id,
                        Accountability::RoleId,
                        Accountability::Description,
                    ])
                    .values_panic([
                        accountability_id.to_string().into(),
                        role_id.to_string().into(),
                        description.into(),
                    ])
                    .to_string(SqliteQueryBuilder);
                sqlx::query(&insert).execute(&mut *conn).await?;
            }
            EventPayload::RoleAccountabilityUpdated {
                accountability_id,
                description,
            } => {
                let update = Query::update()
                    .table(Accountability::Table)
                    .value(Accountability::Description, description)
                    .and_where(Expr::col(Accountability::Id).eq(accountability_id.to_string()))
                    .to_string(SqliteQueryBuilder);
                sqlx::query(&update).execute(&mut *conn).await?;
            }
            EventPayload::RoleAccountabilityDeleted { accountability_id } => {
                let delete = Query::delete()
                    .from_table(Accountability::Table)
                    .and_where(Expr::col(Accountability::Id).eq(accountability_id.to_string()))
                    .to_string(SqliteQueryBuilder);
                sqlx::query(&delete).execute(&mut *conn).await?;
            }
            EventPayload::RoleMemberAdded {
                role_id, member_id, ..
            } => {
                let insert = Query::insert()
                    .into_table(RoleMember::Table)
                    .columns([RoleMember::MemberId, RoleMember::RoleId])
                    .values_panic([member_id.to_string().into(), role_id.to_string().into()])
                    .to_string(SqliteQueryBuilder);
                sqlx::query(&insert).execute(&mut *conn).await?;
            }
            EventPayload::RoleMemberRemoved { role_id, member_id } => {
                let delete = Query::delete()
                    .from_table(RoleMember::Table)
                    .and_where(Expr::col(RoleMember::MemberId).eq(member_id.to_string()))
                    .and_where(Expr::col(RoleMember::RoleId).eq(role_id.to_string()))
                    .to_string(SqliteQueryBuilder);
                sqlx::query(&delete).execute(&mut *conn).await?;
            }
            EventPayload::CircleDirectMemberAdded { role_id, member_id } => {
                let insert = Query::insert()
                    .into_table(CircleDirectMember::Table)
                    .columns([CircleDirectMember::MemberId, CircleDirectMember::RoleId])
                    .values_panic([member_id.to_string().into(), role_id.to_string().into()])
                    .to_string(SqliteQueryBuilder);
                sqlx::query(&insert).execute(&mut *conn).await?;
            }
            EventPayload::CircleDirectMemberRemoved { role_id, member_id } => {
                let delete = Query::delete()
                    .from_table(CircleDirectMember::Table)
                    .and_where(Expr::col(CircleDirectMember::MemberId).eq(member_id.to_string()))
                    .and_where(Expr::col(CircleDirectMember::RoleId).eq(role_id.to_string()))
                    .to_string(SqliteQueryBuilder);
                sqlx::query(&delete).execute(&mut *conn).await?;
            }
            _ => {}
        }

        Self::set_projection_version(conn, event.version).await?;
        Ok(())
    }
}

fn parse_uuid(raw: String) -> Result<Uuid> {
    Uuid::parse_str(&raw).map_err(|e| CommandError::Integrity(format!("bad uuid in projection: {e}")))
}

fn scan_role(row: &sqlx::sqlite::SqliteRow) -> Result<RoleRecord> {
    let id = parse_uuid(row.get("id"))?;
    let parent_id: Option<String> = row.get("parent_id");
    let parent_id = parent_id.map(parse_uuid).transpose()?;
    let raw_type: String = row.get("role_type");
    let role_type = raw_type
        .parse::<RoleType>()
        .map_err(CommandError::Integrity)?;

    Ok(RoleRecord {
        id,
        parent_id,
        role_type,
        name: row.get("name"),
        purpose: row.get("purpose"),
    })
}

#[async_trait]
impl Aggregate for RolesTree {
    fn id(&self) -> String {
        self.id.to_string()
    }

    fn category(&self) -> StreamCategory {
        StreamCategory::RolesTree
    }

    fn version(&self) -> i64 {
        self.version
    }

    async fn apply_events(&mut self, events: &[StoredEvent]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for event in events {
            self.apply_event(&mut *tx, event).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn handle_command(&mut self, command: &Command) -> Result<Vec<EventPayload>> {
        // The projection is shared between instances on this host; operate
        // at whatever version it holds right now.
        self.version = self.projection_version().await?;

        match &command.payload {
            CommandPayload::SetupRootRole { name } => self.handle_setup_root_role(name).await,
            CommandPayload::CircleCreateChildRole {
                parent_role_id,
                name,
                role_type,
                purpose,
                domains,
                accountabilities,
            } => {
                self.handle_circle_create_child_role(
                    *parent_role_id,
                    name,
                    *role_type,
                    purpose,
                    domains,
                    accountabilities,
                )
                .await
            }
            CommandPayload::CircleUpdateChildRole {
                role_id,
                name,
                purpose,
                create_domains,
                update_domains,
                delete_domains,
                create_accountabilities,
                update_accountabilities,
                delete_accountabilities,
            } => {
                self.handle_circle_update_child_role(
                    *role_id,
                    name,
                    purpose,
                    create_domains,
                    update_domains,
                    delete_domains,
                    create_accountabilities,
                    update_accountabilities,
                    delete_accountabilities,
                )
                .await
            }
            CommandPayload::CircleDeleteChildRole { role_id } => {
                self.handle_circle_delete_child_role(*role_id).await
            }
            CommandPayload::CircleAddDirectMember { role_id, member_id } => {
                self.handle_circle_add_direct_member(*role_id, *member_id)
                    .await
            }
            CommandPayload::CircleRemoveDirectMember { role_id, member_id } => {
                self.handle_circle_remove_direct_member(*role_id, *member_id)
                    .await
            }
            CommandPayload::RoleAddMember {
                role_id,
                member_id,
                focus,
            } => self.handle_role_add_member(*role_id, *member_id, focus).await,
            CommandPayload::RoleRemoveMember { role_id, member_id } => {
                self.handle_role_remove_member(*role_id, *member_id).await
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
    use sqlx::sqlite::SqlitePoolOptions;

    async fn projection_pool() -> SqlitePool {
        // a single connection keeps the in-memory database alive and shared
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    fn command(payload: CommandPayload) -> Command {
        Command::new(Uuid::new_v4(), Uuid::new_v4(), None, payload)
    }

    async fn setup_tree(
        repo: &RolesTreeRepository,
        store: &Arc<dyn EventStore>,
    ) -> (Uuid, Uuid) {
        let mut tree = repo.load().await.unwrap();
        exec_command(
            &command(CommandPayload::SetupRootRole {
                name: "General".to_string(),
            }),
            &mut tree,
            store.as_ref(),
        )
        .await
        .unwrap();

        let mut tree = repo.load().await.unwrap();
        let root = tree.root_role().await.unwrap().unwrap();
        exec_command(
            &command(CommandPayload::CircleCreateChildRole {
                parent_role_id: root.id,
                name: "Engineering".to_string(),
                role_type: RoleType::Circle,
                purpose: "build things".to_string(),
                domains: vec!["production".to_string()],
                accountabilities: vec!["keeping the lights on".to_string()],
            }),
            &mut tree,
            store.as_ref(),
        )
        .await
        .unwrap();

        let tree = repo.load().await.unwrap();
        let children = tree.child_roles(root.id).await.unwrap();
        assert_eq!(children.len(), 1);
        (root.id, children[0].id)
    }

    #[tokio::test]
    async fn root_role_can_only_be_set_up_once() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let repo = RolesTreeRepository::new(projection_pool().await, store.clone());

        let mut tree = repo.load().await.unwrap();
        exec_command(
            &command(CommandPayload::SetupRootRole {
                name: "General".to_string(),
            }),
            &mut tree,
            store.as_ref(),
        )
        .await
        .unwrap();

        let mut tree = repo.load().await.unwrap();
        let err = exec_command(
            &command(CommandPayload::SetupRootRole {
                name: "Again".to_string(),
            }),
            &mut tree,
            store.as_ref(),
        )
        .await
        .unwrap_err();
        assert!(err.is_rejection());
    }

    #[tokio::test]
    async fn child_role_lifecycle_updates_projection() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let repo = RolesTreeRepository::new(projection_pool().await, store.clone());
        let (_root_id, child_id) = setup_tree(&repo, &store).await;

        // add a member to a normal role under the circle
        let mut tree = repo.load().await.unwrap();
        exec_command(
            &command(CommandPayload::CircleCreateChildRole {
                parent_role_id: child_id,
                name: "Ops".to_string(),
                role_type: RoleType::Normal,
                purpose: String::new(),
                domains: vec![],
                accountabilities: vec![],
            }),
            &mut tree,
            store.as_ref(),
        )
        .await
        .unwrap();

        let tree = repo.load().await.unwrap();
        let ops = tree.child_roles(child_id).await.unwrap();
        assert_eq!(ops.len(), 1);
        let ops_id = ops[0].id;

        let member_id = Uuid::new_v4();
        let mut tree = repo.load().await.unwrap();
        exec_command(
            &command(CommandPayload::RoleAddMember {
                role_id: ops_id,
                member_id,
                focus: Some("deploys".to_string()),
            }),
            &mut tree,
            store.as_ref(),
        )
        .await
        .unwrap();

        let tree = repo.load().await.unwrap();
        assert_eq!(tree.role_member_ids(ops_id).await.unwrap(), vec![member_id]);

        // deleting the circle removes the whole subtree and its edges
        let mut tree = repo.load().await.unwrap();
        exec_command(
            &command(CommandPayload::CircleDeleteChildRole { role_id: child_id }),
            &mut tree,
            store.as_ref(),
        )
        .await
        .unwrap();

        let tree = repo.load().await.unwrap();
        assert!(tree.role(child_id).await.unwrap().is_none());
        assert!(tree.role(ops_id).await.unwrap().is_none());
        assert!(tree.role_member_ids(ops_id).await.unwrap().is_empty());
        tree.check_broken_edges().await.unwrap();
    }

    #[tokio::test]
    async fn update_child_role_edits_domains_and_accountabilities() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let repo = RolesTreeRepository::new(projection_pool().await, store.clone());
        let (_, child_id) = setup_tree(&repo, &store).await;

        let tree = repo.load().await.unwrap();
        let domain_id = tree.role_domain_ids(child_id).await.unwrap()[0];
        let accountability_id = tree.role_accountability_ids(child_id).await.unwrap()[0];

        let mut tree = repo.load().await.unwrap();
        exec_command(
            &command(CommandPayload::CircleUpdateChildRole {
                role_id: child_id,
                name: Some("Platform".to_string()),
                purpose: None,
                create_domains: vec!["tooling".to_string()],
                update_domains: vec![DescriptionEdit {
                    id: domain_id,
                    description: "production fleet".to_string(),
                }],
                delete_domains: vec![],
                create_accountabilities: vec![],
                update_accountabilities: vec![],
                delete_accountabilities: vec![accountability_id],
            }),
            &mut tree,
            store.as_ref(),
        )
        .await
        .unwrap();

        let tree = repo.load().await.unwrap();
        let role = tree.role(child_id).await.unwrap().unwrap();
        assert_eq!(role.name, "Platform");
        assert_eq!(role.purpose, "build things");
        assert_eq!(tree.role_domain_ids(child_id).await.unwrap().len(), 2);
        assert!(tree
            .role_accountability_ids(child_id)
            .await
            .unwrap()
            .is_empty());

        // editing a domain owned by another role is rejected
        let mut tree = repo.load().await.unwrap();
        let err = exec_command(
            &command(CommandPayload::CircleUpdateChildRole {
                role_id: child_id,
                name: None,
                purpose: None,
                create_domains: vec![],
                update_domains: vec![],
                delete_domains: vec![Uuid::new_v4()],
                create_accountabilities: vec![],
                update_accountabilities: vec![],
                delete_accountabilities: vec![],
            }),
            &mut tree,
            store.as_ref(),
        )
        .await
        .unwrap_err();
        assert!(err.is_rejection());
    }

    #[tokio::test]
    async fn projection_rebuilds_from_nothing() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let repo = RolesTreeRepository::new(projection_pool().await, store.clone());
        let (root_id, child_id) = setup_tree(&repo, &store).await;

        // a brand new projection database catches up from the log alone
        let fresh = RolesTreeRepository::new(projection_pool().await, store.clone());
        let tree = fresh.load().await.unwrap();
        assert_eq!(tree.root_role().await.unwrap().unwrap().id, root_id);
        assert_eq!(tree.child_roles(root_id).await.unwrap()[0].id, child_id);
        assert!(tree.version() > 0);
    }

    #[tokio::test]
    async fn direct_member_add_is_validated_against_projection() {
        let store: Arc<dyn EventStore> = Arc::new(MemoryEventStore::new());
        let repo = RolesTreeRepository::new(projection_pool().await, store.clone());
        let (_, child_id) = setup_tree(&repo, &store).await;

        let member_id = Uuid::new_v4();
        let mut tree = repo.load().await.unwrap();
        exec_command(
            &command(CommandPayload::CircleAddDirectMember {
                role_id: child_id,
                member_id,
            }),
            &mut tree,
            store.as_ref(),
        )
        .await
        .unwrap();

        let mut tree = repo.load().await.unwrap();
        let err = exec_command(
            &command(CommandPayload::CircleAddDirectMember {
                role_id: child_id,
                member_id,
            }),
            &mut tree,
            store.as_ref(),
        )
        .await
        .unwrap_err();
        assert!(err.is_rejection());
    }
}
