//! Synchronous write facade.
//!
//! External callers need a synchronous answer to "create this member",
//! but the uniqueness saga completes asynchronously. The facade validates
//! input shape, issues the Request* command against the member-change
//! aggregate, then polls that aggregate's stream for a Completed event,
//! blocking on the notification channel between polls. A hard timeout
//! bounds caller-visible latency from a wedged saga; on timeout the
//! underlying operation may still complete later, so callers must treat
//! it as "unknown", not as failure.

use std::sync::Arc;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::aggregate::{exec_command, CommandError, MemberChangeRepository};
use crate::command::{Command, CommandPayload};
use crate::config::FacadeConfig;
use crate::event::EventPayload;
use crate::notify::{ListenerFactory, NotifyError, EVENT_CHANNEL};
use crate::store::{EventStore, StoreError};

const MIN_USER_NAME_LENGTH: usize = 2;
const MAX_USER_NAME_LENGTH: usize = 30;
const MIN_FULL_NAME_LENGTH: usize = 2;
const MAX_FULL_NAME_LENGTH: usize = 100;
const MAX_EMAIL_LENGTH: usize = 100;
const MIN_PASSWORD_LENGTH: usize = 8;
const MAX_PASSWORD_LENGTH: usize = 100;
const MAX_MATCH_UID_LENGTH: usize = 100;

/// Result type for facade operations.
pub type Result<T> = std::result::Result<T, FacadeError>;

/// Errors from the synchronous facade.
#[derive(Debug, thiserror::Error)]
pub enum FacadeError {
    /// The saga did not confirm completion within the wait bound. The
    /// request may still complete later.
    #[error("timed out waiting for request {member_change_id} to complete")]
    Timeout { member_change_id: Uuid },

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("notification error: {0}")]
    Notify(#[from] NotifyError),
}

/// Requested member creation.
#[derive(Debug, Clone, Default)]
pub struct CreateMemberChange {
    pub is_admin: bool,
    pub match_uid: String,
    pub user_name: String,
    pub full_name: String,
    pub email: String,
    pub password: String,
}

/// Per-field validation errors for a create request.
#[derive(Debug, Default)]
pub struct CreateMemberErrors {
    pub user_name: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub match_uid: Option<String>,
}

/// Outcome of a create request.
#[derive(Debug, Default)]
pub struct CreateMemberResult {
    pub member_id: Option<Uuid>,
    pub has_errors: bool,
    pub generic_error: Option<String>,
    pub errors: CreateMemberErrors,
}

/// Requested member update.
///
/// `prev_user_name`/`prev_email` come from the caller's read view, which
/// is eventually consistent; the member aggregate re-validates them and
/// the request completes with an error if they were stale.
#[derive(Debug, Clone, Default)]
pub struct UpdateMemberChange {
    pub member_id: Uuid,
    pub is_admin: bool,
    pub user_name: String,
    pub full_name: String,
    pub email: String,
    pub prev_user_name: String,
    pub prev_email: String,
}

/// Per-field validation errors for an update request.
#[derive(Debug, Default)]
pub struct UpdateMemberErrors {
    pub user_name: Option<String>,
    pub full_name: Option<String>,
    pub email: Option<String>,
}

/// Outcome of an update request.
#[derive(Debug, Default)]
pub struct UpdateMemberResult {
    pub has_errors: bool,
    pub generic_error: Option<String>,
    pub errors: UpdateMemberErrors,
}

/// Outcome of a request with no per-field errors.
#[derive(Debug, Default)]
pub struct GenericResult {
    pub has_errors: bool,
    pub generic_error: Option<String>,
}

/// Synchronous front door over the asynchronous member-request saga.
pub struct WriteFacade {
    store: Arc<dyn EventStore>,
    listeners: Arc<dyn ListenerFactory>,
    wait_timeout: Duration,
    poll_interval: Duration,
}

impl WriteFacade {
    pub fn new(
        store: Arc<dyn EventStore>,
        listeners: Arc<dyn ListenerFactory>,
        config: &FacadeConfig,
    ) -> Self {
        Self {
            store,
            listeners,
            wait_timeout: Duration::from_secs(config.wait_timeout_secs),
            poll_interval: Duration::from_secs(config.poll_interval_secs),
        }
    }

    /// Create a member, waiting for the uniqueness saga to settle.
    pub async fn create_member(
        &self,
        issuer_id: Option<Uuid>,
        change: &CreateMemberChange,
    ) -> Result<CreateMemberResult> {
        let mut res = validate_create(change);
        if res.has_errors {
            return Ok(res);
        }

        let member_id = Uuid::new_v4();
        let member_change_id = Uuid::new_v4();

        let command = Command::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            issuer_id,
            CommandPayload::RequestCreateMember {
                member_id,
                is_admin: change.is_admin,
                match_uid: change.match_uid.clone(),
                user_name: change.user_name.clone(),
                full_name: change.full_name.clone(),
                email: change.email.clone(),
                password_hash: password_hash(&change.password),
            },
        );
        self.request(member_change_id, &command).await?;

        match self.wait_completion(member_change_id).await? {
            Ok(()) => res.member_id = Some(member_id),
            Err(reason) => {
                res.has_errors = true;
                res.generic_error = Some(reason);
            }
        }
        Ok(res)
    }

    /// Update a member, waiting for the uniqueness saga to settle.
    pub async fn update_member(
        &self,
        issuer_id: Option<Uuid>,
        change: &UpdateMemberChange,
    ) -> Result<UpdateMemberResult> {
        let mut res = validate_update(change);
        if res.has_errors {
            return Ok(res);
        }

        let member_change_id = Uuid::new_v4();
        let command = Command::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            issuer_id,
            CommandPayload::RequestUpdateMember {
                member_id: change.member_id,
                is_admin: change.is_admin,
                user_name: change.user_name.clone(),
                full_name: change.full_name.clone(),
                email: change.email.clone(),
                prev_user_name: change.prev_user_name.clone(),
                prev_email: change.prev_email.clone(),
            },
        );
        self.request(member_change_id, &command).await?;

        if let Err(reason) = self.wait_completion(member_change_id).await? {
            res.has_errors = true;
            res.generic_error = Some(reason);
        }
        Ok(res)
    }

    /// Bind an external identity to a member, waiting for the saga.
    pub async fn set_member_match_uid(
        &self,
        issuer_id: Option<Uuid>,
        member_id: Uuid,
        match_uid: &str,
    ) -> Result<GenericResult> {
        let mut res = GenericResult::default();
        if match_uid.chars().count() > MAX_MATCH_UID_LENGTH {
            res.has_errors = true;
            res.generic_error = Some("matchUID too long".to_string());
            return Ok(res);
        }

        let member_change_id = Uuid::new_v4();
        let command = Command::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            issuer_id,
            CommandPayload::RequestSetMemberMatchUid {
                member_id,
                match_uid: match_uid.to_string(),
            },
        );
        self.request(member_change_id, &command).await?;

        if let Err(reason) = self.wait_completion(member_change_id).await? {
            res.has_errors = true;
            res.generic_error = Some(reason);
        }
        Ok(res)
    }

    async fn request(&self, member_change_id: Uuid, command: &Command) -> Result<()> {
        let repository = MemberChangeRepository::new(self.store.clone());
        let mut change = repository.load(member_change_id).await?;
        exec_command(command, &mut change, self.store.as_ref()).await?;
        Ok(())
    }

    /// Poll the member-change stream for a Completed event, blocking on
    /// the notification channel between polls.
    async fn wait_completion(
        &self,
        member_change_id: Uuid,
    ) -> Result<std::result::Result<(), String>> {
        let mut listener = self.listeners.new_listener();
        listener.listen(EVENT_CHANNEL)?;

        let deadline = tokio::time::Instant::now() + self.wait_timeout;
        let stream_id = member_change_id.to_string();
        let mut from_version = 1;

        loop {
            let events = self.store.read_stream(&stream_id, from_version, 100).await?;
            for event in &events {
                from_version = event.version + 1;
                if let EventPayload::MemberChangeCompleted { error, reason, .. } =
                    event.payload().map_err(StoreError::from)?
                {
                    debug!(%member_change_id, error, "member change completed");
                    return Ok(if error { Err(reason) } else { Ok(()) });
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(FacadeError::Timeout { member_change_id });
            }

            // wake on notification, on the re-poll tick (pinging the
            // listener), or give up at the deadline
            tokio::select! {
                _ = listener.recv() => {}
                _ = tokio::time::sleep(self.poll_interval) => {
                    let _ = listener.ping();
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(FacadeError::Timeout { member_change_id });
                }
            }
        }
    }
}

fn password_hash(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

fn is_user_name_valid_format(user_name: &str) -> bool {
    let mut chars = user_name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-')
}

fn is_email_valid_format(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
}

fn validate_create(change: &CreateMemberChange) -> CreateMemberResult {
    let mut res = CreateMemberResult::default();

    if let Some(reason) = validate_user_name(&change.user_name) {
        res.has_errors = true;
        res.errors.user_name = Some(reason);
    }
    if let Some(reason) = validate_full_name(&change.full_name) {
        res.has_errors = true;
        res.errors.full_name = Some(reason);
    }
    if let Some(reason) = validate_email(&change.email) {
        res.has_errors = true;
        res.errors.email = Some(reason);
    }

    if change.password.is_empty() {
        res.has_errors = true;
        res.errors.password = Some("empty password".to_string());
    } else if change.password.chars().count() < MIN_PASSWORD_LENGTH {
        res.has_errors = true;
        res.errors.password = Some("password too short".to_string());
    } else if change.password.chars().count() > MAX_PASSWORD_LENGTH {
        res.has_errors = true;
        res.errors.password = Some("password too long".to_string());
    }

    if change.match_uid.chars().count() > MAX_MATCH_UID_LENGTH {
        res.has_errors = true;
        res.errors.match_uid = Some("matchUID too long".to_string());
    }

    res
}

fn validate_update(change: &UpdateMemberChange) -> UpdateMemberResult {
    let mut res = UpdateMemberResult::default();

    if let Some(reason) = validate_user_name(&change.user_name) {
        res.has_errors = true;
        res.errors.user_name = Some(reason);
    }
    if let Some(reason) = validate_full_name(&change.full_name) {
        res.has_errors = true;
        res.errors.full_name = Some(reason);
    }
    if let Some(reason) = validate_email(&change.email) {
        res.has_errors = true;
        res.errors.email = Some(reason);
    }

    res
}

fn validate_user_name(user_name: &str) -> Option<String> {
    if user_name.is_empty() {
        return Some("empty user name".to_string());
    }
    let length = user_name.chars().count();
    if length < MIN_USER_NAME_LENGTH {
        return Some("user name too short".to_string());
    }
    if length > MAX_USER_NAME_LENGTH {
        return Some("user name too long".to_string());
    }
    if !is_user_name_valid_format(user_name) {
        return Some("invalid user name".to_string());
    }
    None
}

fn validate_full_name(full_name: &str) -> Option<String> {
    if full_name.is_empty() {
        return Some("empty user full name".to_string());
    }
    let length = full_name.chars().count();
    if length < MIN_FULL_NAME_LENGTH {
        return Some("user full name too short".to_string());
    }
    if length > MAX_FULL_NAME_LENGTH {
        return Some("user full name too long".to_string());
    }
    None
}

fn validate_email(email: &str) -> Option<String> {
    if email.is_empty() {
        return Some("empty email address".to_string());
    }
    if !is_email_valid_format(email) {
        return Some("invalid email address".to_string());
    }
    if email.chars().count() > MAX_EMAIL_LENGTH {
        return Some("email address too long".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::LocalBroker;
    use crate::store::MemoryEventStore;

    fn valid_change() -> CreateMemberChange {
        CreateMemberChange {
            is_admin: false,
            match_uid: String::new(),
            user_name: "alice".to_string(),
            full_name: "Alice Example".to_string(),
            email: "alice@example.com".to_string(),
            password: "correct horse".to_string(),
        }
    }

    fn facade_with(
        store: Arc<dyn EventStore>,
        broker: Arc<LocalBroker>,
        timeout_secs: u64,
    ) -> WriteFacade {
        let config = FacadeConfig {
            wait_timeout_secs: timeout_secs,
            poll_interval_secs: 1,
        };
        WriteFacade::new(store, broker, &config)
    }

    #[tokio::test]
    async fn rejects_malformed_input_without_touching_the_store() {
        let broker = LocalBroker::new();
        let store: Arc<dyn EventStore> =
            Arc::new(MemoryEventStore::new().with_notifier(broker.clone()));
        let facade = facade_with(store.clone(), broker, 1);

        let change = CreateMemberChange {
            user_name: "x".to_string(),
            email: "not-an-email".to_string(),
            password: "short".to_string(),
            ..valid_change()
        };
        let res = facade.create_member(None, &change).await.unwrap();

        assert!(res.has_errors);
        assert!(res.errors.user_name.is_some());
        assert!(res.errors.email.is_some());
        assert!(res.errors.password.is_some());
        assert_eq!(store.last_sequence_number().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn times_out_when_no_saga_is_running() {
        let broker = LocalBroker::new();
        let store: Arc<dyn EventStore> =
            Arc::new(MemoryEventStore::new().with_notifier(broker.clone()));
        let facade = facade_with(store.clone(), broker, 1);

        let err = facade
            .create_member(None, &valid_change())
            .await
            .unwrap_err();
        assert!(matches!(err, FacadeError::Timeout { .. }));

        // the request itself was persisted; the outcome is unknown, not
        // failed
        assert!(store.last_sequence_number().await.unwrap() > 0);
    }

    #[test]
    fn user_name_format() {
        assert!(is_user_name_valid_format("alice"));
        assert!(is_user_name_valid_format("alice.b-c_d"));
        assert!(!is_user_name_valid_format("_alice"));
        assert!(!is_user_name_valid_format("al ice"));
        assert!(!is_user_name_valid_format(""));
    }

    #[test]
    fn email_format() {
        assert!(is_email_valid_format("a@b.example"));
        assert!(!is_email_valid_format("a@b"));
        assert!(!is_email_valid_format("ab.example"));
        assert!(!is_email_valid_format("@b.example"));
    }
}
