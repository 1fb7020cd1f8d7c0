//! Commands: externally-triggered intents handled by aggregates.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::RoleType;

/// Edit of a domain's or accountability's description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptionEdit {
    pub id: Uuid,
    pub description: String,
}

/// A single externally-triggered intent.
///
/// `correlation_id` threads every event derived from this command across
/// aggregate boundaries; `causation_id` is the command or event that led to
/// this command being issued; `issuer_id` is the acting member, None for
/// system-issued commands (saga compensations, setup).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: Uuid,
    pub correlation_id: Uuid,
    pub causation_id: Uuid,
    pub issuer_id: Option<Uuid>,
    pub payload: CommandPayload,
}

impl Command {
    pub fn new(
        correlation_id: Uuid,
        causation_id: Uuid,
        issuer_id: Option<Uuid>,
        payload: CommandPayload,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            correlation_id,
            causation_id,
            issuer_id,
            payload,
        }
    }
}

/// Command payload, tagged with its command type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CommandPayload {
    // roles tree
    SetupRootRole {
        name: String,
    },
    CircleCreateChildRole {
        parent_role_id: Uuid,
        name: String,
        role_type: RoleType,
        purpose: String,
        domains: Vec<String>,
        accountabilities: Vec<String>,
    },
    CircleUpdateChildRole {
        role_id: Uuid,
        name: Option<String>,
        purpose: Option<String>,
        create_domains: Vec<String>,
        update_domains: Vec<DescriptionEdit>,
        delete_domains: Vec<Uuid>,
        create_accountabilities: Vec<String>,
        update_accountabilities: Vec<DescriptionEdit>,
        delete_accountabilities: Vec<Uuid>,
    },
    CircleDeleteChildRole {
        role_id: Uuid,
    },
    CircleAddDirectMember {
        role_id: Uuid,
        member_id: Uuid,
    },
    CircleRemoveDirectMember {
        role_id: Uuid,
        member_id: Uuid,
    },
    RoleAddMember {
        role_id: Uuid,
        member_id: Uuid,
        focus: Option<String>,
    },
    RoleRemoveMember {
        role_id: Uuid,
        member_id: Uuid,
    },

    // member
    CreateMember {
        member_change_id: Uuid,
        is_admin: bool,
        match_uid: String,
        user_name: String,
        full_name: String,
        email: String,
        password_hash: String,
    },
    UpdateMember {
        member_change_id: Uuid,
        is_admin: bool,
        user_name: String,
        full_name: String,
        email: String,
        prev_user_name: String,
        prev_email: String,
    },
    SetMemberPassword {
        password_hash: String,
    },
    SetMemberMatchUid {
        member_change_id: Uuid,
        match_uid: String,
    },

    // member change (request tracking)
    RequestCreateMember {
        member_id: Uuid,
        is_admin: bool,
        match_uid: String,
        user_name: String,
        full_name: String,
        email: String,
        password_hash: String,
    },
    RequestUpdateMember {
        member_id: Uuid,
        is_admin: bool,
        user_name: String,
        full_name: String,
        email: String,
        prev_user_name: String,
        prev_email: String,
    },
    RequestSetMemberMatchUid {
        member_id: Uuid,
        match_uid: String,
    },
    CompleteRequest {
        error: bool,
        reason: String,
    },

    // tension
    CreateTension {
        member_id: Uuid,
        title: String,
        description: String,
        role_id: Option<Uuid>,
    },
    UpdateTension {
        title: String,
        description: String,
        role_id: Option<Uuid>,
    },
    ChangeTensionRole {
        role_id: Option<Uuid>,
        /// When non-zero, the command only applies if the tension is still
        /// at this version.
        tension_version: i64,
    },
    CloseTension {
        reason: String,
    },

    // unique value registry
    ReserveValue {
        value: String,
        owner_id: Uuid,
        request_id: Uuid,
    },
    ReleaseValue {
        value: String,
        owner_id: Uuid,
        request_id: Uuid,
    },
}

impl CommandPayload {
    /// Stable command type name, used in logs and error messages.
    pub fn command_type(&self) -> &'static str {
        match self {
            CommandPayload::SetupRootRole { .. } => "SetupRootRole",
            CommandPayload::CircleCreateChildRole { .. } => "CircleCreateChildRole",
            CommandPayload::CircleUpdateChildRole { .. } => "CircleUpdateChildRole",
            CommandPayload::CircleDeleteChildRole { .. } => "CircleDeleteChildRole",
            CommandPayload::CircleAddDirectMember { .. } => "CircleAddDirectMember",
            CommandPayload::CircleRemoveDirectMember { .. } => "CircleRemoveDirectMember",
            CommandPayload::RoleAddMember { .. } => "RoleAddMember",
            CommandPayload::RoleRemoveMember { .. } => "RoleRemoveMember",
            CommandPayload::CreateMember { .. } => "CreateMember",
            CommandPayload::UpdateMember { .. } => "UpdateMember",
            CommandPayload::SetMemberPassword { .. } => "SetMemberPassword",
            CommandPayload::SetMemberMatchUid { .. } => "SetMemberMatchUid",
            CommandPayload::RequestCreateMember { .. } => "RequestCreateMember",
            CommandPayload::RequestUpdateMember { .. } => "RequestUpdateMember",
            CommandPayload::RequestSetMemberMatchUid { .. } => "RequestSetMemberMatchUid",
            CommandPayload::CompleteRequest { .. } => "CompleteRequest",
            CommandPayload::CreateTension { .. } => "CreateTension",
            CommandPayload::UpdateTension { .. } => "UpdateTension",
            CommandPayload::ChangeTensionRole { .. } => "ChangeTensionRole",
            CommandPayload::CloseTension { .. } => "CloseTension",
            CommandPayload::ReserveValue { .. } => "ReserveValue",
            CommandPayload::ReleaseValue { .. } => "ReleaseValue",
        }
    }
}
