//! Domain events and the durable event record.
//!
//! Every state change in holon is expressed as one of the [`EventPayload`]
//! variants below, produced by an aggregate in response to a command and
//! persisted as a [`StoredEvent`]. Payloads are serialized as internally
//! tagged JSON so the `eventtype` column and the payload tag always agree.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deriving well-known stream ids (v5).
pub const HOLON_UUID_NAMESPACE: Uuid = Uuid::from_u128(0x7d11f0d2_3c44_4d69_a67c_d3ab21bc8a15);

/// Stream id of the singleton roles-tree aggregate.
pub fn roles_tree_stream_id() -> Uuid {
    Uuid::new_v5(
        &HOLON_UUID_NAMESPACE,
        StreamCategory::RolesTree.as_str().as_bytes(),
    )
}

/// Stream id of the singleton member-request handler progress stream.
pub fn member_request_handler_stream_id() -> Uuid {
    Uuid::new_v5(
        &HOLON_UUID_NAMESPACE,
        StreamCategory::MemberRequestHandler.as_str().as_bytes(),
    )
}

/// Aggregate type a stream belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamCategory {
    RolesTree,
    Member,
    Tension,
    MemberChange,
    MemberRequestHandler,
    MemberRequestSaga,
    UniqueValueRegistry,
}

impl StreamCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamCategory::RolesTree => "rolestree",
            StreamCategory::Member => "member",
            StreamCategory::Tension => "tension",
            StreamCategory::MemberChange => "memberchange",
            StreamCategory::MemberRequestHandler => "memberrequesthandler",
            StreamCategory::MemberRequestSaga => "memberrequestsaga",
            StreamCategory::UniqueValueRegistry => "uniquevalueregistry",
        }
    }
}

impl fmt::Display for StreamCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rolestree" => Ok(StreamCategory::RolesTree),
            "member" => Ok(StreamCategory::Member),
            "tension" => Ok(StreamCategory::Tension),
            "memberchange" => Ok(StreamCategory::MemberChange),
            "memberrequesthandler" => Ok(StreamCategory::MemberRequestHandler),
            "memberrequestsaga" => Ok(StreamCategory::MemberRequestSaga),
            "uniquevalueregistry" => Ok(StreamCategory::UniqueValueRegistry),
            other => Err(format!("unknown stream category: {other}")),
        }
    }
}

/// Kind of a role in the roles tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoleType {
    Normal,
    Circle,
}

impl RoleType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoleType::Normal => "normal",
            RoleType::Circle => "circle",
        }
    }
}

impl fmt::Display for RoleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(RoleType::Normal),
            "circle" => Ok(RoleType::Circle),
            other => Err(format!("unknown role type: {other}")),
        }
    }
}

/// Causal-chain metadata attached to every stored event.
///
/// `correlation_id` threads all events derived from one external command,
/// `causation_id` is the immediate command/event that produced this one,
/// `group_id` tags the batch written by a single `exec_command` call and
/// `issuer_id` is the acting member (None for system-issued commands).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    pub correlation_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
    pub group_id: Option<Uuid>,
    pub issuer_id: Option<Uuid>,
}

/// Domain event payload, tagged with its event type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    // roles tree
    RoleCreated {
        role_id: Uuid,
        parent_role_id: Option<Uuid>,
        role_type: RoleType,
        name: String,
        purpose: String,
    },
    RoleUpdated {
        role_id: Uuid,
        role_type: RoleType,
        name: String,
        purpose: String,
    },
    RoleDeleted {
        role_id: Uuid,
    },
    RoleChangedParent {
        role_id: Uuid,
        parent_role_id: Option<Uuid>,
    },
    RoleDomainCreated {
        domain_id: Uuid,
        role_id: Uuid,
        description: String,
    },
    RoleDomainUpdated {
        domain_id: Uuid,
        description: String,
    },
    RoleDomainDeleted {
        domain_id: Uuid,
    },
    RoleAccountabilityCreated {
        accountability_id: Uuid,
        role_id: Uuid,
        description: String,
    },
    RoleAccountabilityUpdated {
        accountability_id: Uuid,
        description: String,
    },
    RoleAccountabilityDeleted {
        accountability_id: Uuid,
    },
    RoleMemberAdded {
        role_id: Uuid,
        member_id: Uuid,
        focus: Option<String>,
    },
    RoleMemberRemoved {
        role_id: Uuid,
        member_id: Uuid,
    },
    CircleDirectMemberAdded {
        role_id: Uuid,
        member_id: Uuid,
    },
    CircleDirectMemberRemoved {
        role_id: Uuid,
        member_id: Uuid,
    },

    // tension
    TensionCreated {
        tension_id: Uuid,
        member_id: Uuid,
        role_id: Option<Uuid>,
        title: String,
        description: String,
    },
    TensionUpdated {
        tension_id: Uuid,
        title: String,
        description: String,
    },
    TensionRoleChanged {
        tension_id: Uuid,
        prev_role_id: Option<Uuid>,
        role_id: Option<Uuid>,
    },
    TensionClosed {
        tension_id: Uuid,
        reason: String,
    },

    // member
    MemberCreated {
        member_id: Uuid,
        member_change_id: Uuid,
        user_name: String,
        full_name: String,
        email: String,
        is_admin: bool,
    },
    MemberUpdated {
        member_id: Uuid,
        member_change_id: Uuid,
        user_name: String,
        full_name: String,
        email: String,
        is_admin: bool,
        prev_user_name: String,
        prev_email: String,
    },
    MemberPasswordSet {
        member_id: Uuid,
        password_hash: String,
    },
    MemberMatchUidSet {
        member_id: Uuid,
        member_change_id: Uuid,
        match_uid: String,
        prev_match_uid: String,
    },

    // member change (request tracking)
    MemberChangeCreateRequested {
        member_change_id: Uuid,
        member_id: Uuid,
        is_admin: bool,
        match_uid: String,
        user_name: String,
        full_name: String,
        email: String,
        password_hash: String,
    },
    MemberChangeUpdateRequested {
        member_change_id: Uuid,
        member_id: Uuid,
        is_admin: bool,
        user_name: String,
        full_name: String,
        email: String,
        prev_user_name: String,
        prev_email: String,
    },
    MemberChangeSetMatchUidRequested {
        member_change_id: Uuid,
        member_id: Uuid,
        match_uid: String,
    },
    MemberChangeCompleted {
        member_change_id: Uuid,
        error: bool,
        reason: String,
    },

    // saga bookkeeping
    MemberRequestSagaCompleted {
        saga_id: String,
    },
    MemberRequestHandlerStateUpdated {
        member_change_sequence_number: i64,
        member_sequence_number: i64,
    },

    // unique value registry
    UniqueRegistryValueReserved {
        registry_id: String,
        value: String,
        owner_id: Uuid,
        request_id: Uuid,
    },
    UniqueRegistryValueReleased {
        registry_id: String,
        value: String,
        owner_id: Uuid,
        request_id: Uuid,
    },
}

impl EventPayload {
    /// Stable event type name, stored in the `eventtype` column.
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::RoleCreated { .. } => "RoleCreated",
            EventPayload::RoleUpdated { .. } => "RoleUpdated",
            EventPayload::RoleDeleted { .. } => "RoleDeleted",
            EventPayload::RoleChangedParent { .. } => "RoleChangedParent",
            EventPayload::RoleDomainCreated { .. } => "RoleDomainCreated",
            EventPayload::RoleDomainUpdated { .. } => "RoleDomainUpdated",
            EventPayload::RoleDomainDeleted { .. } => "RoleDomainDeleted",
            EventPayload::RoleAccountabilityCreated { .. } => "RoleAccountabilityCreated",
            EventPayload::RoleAccountabilityUpdated { .. } => "RoleAccountabilityUpdated",
            EventPayload::RoleAccountabilityDeleted { .. } => "RoleAccountabilityDeleted",
            EventPayload::RoleMemberAdded { .. } => "RoleMemberAdded",
            EventPayload::RoleMemberRemoved { .. } => "RoleMemberRemoved",
            EventPayload::CircleDirectMemberAdded { .. } => "CircleDirectMemberAdded",
            EventPayload::CircleDirectMemberRemoved { .. } => "CircleDirectMemberRemoved",
            EventPayload::TensionCreated { .. } => "TensionCreated",
            EventPayload::TensionUpdated { .. } => "TensionUpdated",
            EventPayload::TensionRoleChanged { .. } => "TensionRoleChanged",
            EventPayload::TensionClosed { .. } => "TensionClosed",
            EventPayload::MemberCreated { .. } => "MemberCreated",
            EventPayload::MemberUpdated { .. } => "MemberUpdated",
            EventPayload::MemberPasswordSet { .. } => "MemberPasswordSet",
            EventPayload::MemberMatchUidSet { .. } => "MemberMatchUidSet",
            EventPayload::MemberChangeCreateRequested { .. } => "MemberChangeCreateRequested",
            EventPayload::MemberChangeUpdateRequested { .. } => "MemberChangeUpdateRequested",
            EventPayload::MemberChangeSetMatchUidRequested { .. } => {
                "MemberChangeSetMatchUidRequested"
            }
            EventPayload::MemberChangeCompleted { .. } => "MemberChangeCompleted",
            EventPayload::MemberRequestSagaCompleted { .. } => "MemberRequestSagaCompleted",
            EventPayload::MemberRequestHandlerStateUpdated { .. } => {
                "MemberRequestHandlerStateUpdated"
            }
            EventPayload::UniqueRegistryValueReserved { .. } => "UniqueRegistryValueReserved",
            EventPayload::UniqueRegistryValueReleased { .. } => "UniqueRegistryValueReleased",
        }
    }
}

/// An event produced by an aggregate, not yet persisted.
#[derive(Debug, Clone)]
pub struct ProposedEvent {
    pub id: Uuid,
    pub payload: EventPayload,
    pub meta: EventMeta,
}

impl ProposedEvent {
    pub fn new(payload: EventPayload, meta: EventMeta) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            meta,
        }
    }

    /// Stamp a batch of payloads with shared metadata.
    pub fn batch(payloads: Vec<EventPayload>, meta: &EventMeta) -> Vec<ProposedEvent> {
        payloads
            .into_iter()
            .map(|p| ProposedEvent::new(p, meta.clone()))
            .collect()
    }
}

/// The durable event record as read back from the store.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub id: Uuid,
    /// Global sequence, monotonically increasing in commit order.
    pub sequence_number: i64,
    pub event_type: String,
    pub category: StreamCategory,
    pub stream_id: String,
    pub timestamp: DateTime<Utc>,
    /// Version in the stream, gapless and starting at 1.
    pub version: i64,
    /// Serialized [`EventPayload`].
    pub data: String,
    /// Serialized [`EventMeta`].
    pub metadata: String,
}

impl StoredEvent {
    pub fn payload(&self) -> serde_json::Result<EventPayload> {
        serde_json::from_str(&self.data)
    }

    pub fn meta(&self) -> serde_json::Result<EventMeta> {
        serde_json::from_str(&self.metadata)
    }
}

impl fmt::Display for StoredEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sequence: {}, type: {}, category: {}, stream: {}, version: {}",
            self.sequence_number, self.event_type, self.category, self.stream_id, self.version
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trips_with_type_tag() {
        let payload = EventPayload::UniqueRegistryValueReserved {
            registry_id: "username-alice".to_string(),
            value: "alice".to_string(),
            owner_id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
        };

        let raw = serde_json::to_string(&payload).unwrap();
        assert!(raw.contains("\"type\":\"UniqueRegistryValueReserved\""));

        let back: EventPayload = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, payload);
        assert_eq!(back.event_type(), "UniqueRegistryValueReserved");
    }

    #[test]
    fn category_string_forms_are_stable() {
        for category in [
            StreamCategory::RolesTree,
            StreamCategory::Member,
            StreamCategory::Tension,
            StreamCategory::MemberChange,
            StreamCategory::MemberRequestHandler,
            StreamCategory::MemberRequestSaga,
            StreamCategory::UniqueValueRegistry,
        ] {
            let parsed: StreamCategory = category.as_str().parse().unwrap();
            assert_eq!(parsed, category);
        }
        assert!("nosuch".parse::<StreamCategory>().is_err());
    }

    #[test]
    fn well_known_stream_ids_are_deterministic() {
        assert_eq!(roles_tree_stream_id(), roles_tree_stream_id());
        assert_ne!(roles_tree_stream_id(), member_request_handler_stream_id());
    }
}
