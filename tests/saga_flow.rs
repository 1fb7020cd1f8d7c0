//! End-to-end flow: synchronous facade -> member-change aggregate ->
//! polling handler -> saga -> registries and member aggregate.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use holon::aggregate::{MemberRepository, UniqueValueRegistryRepository};
use holon::config::FacadeConfig;
use holon::facade::{CreateMemberChange, UpdateMemberChange, WriteFacade};
use holon::handlers::{run_event_handler, MemberRequestHandler};
use holon::lock::LocalLockManager;
use holon::notify::LocalBroker;
use holon::store::{EventStore, MemoryEventStore};

struct Harness {
    store: Arc<dyn EventStore>,
    facade: WriteFacade,
    shutdown: watch::Sender<bool>,
}

fn harness() -> Harness {
    let broker = LocalBroker::new();
    let store: Arc<dyn EventStore> =
        Arc::new(MemoryEventStore::new().with_notifier(broker.clone()));

    let (shutdown, shutdown_rx) = watch::channel(false);
    run_event_handler(
        Arc::new(MemberRequestHandler::new(store.clone())),
        broker.clone(),
        LocalLockManager::new(),
        Duration::from_secs(10),
        shutdown_rx,
    );

    let facade = WriteFacade::new(
        store.clone(),
        broker,
        &FacadeConfig {
            wait_timeout_secs: 10,
            poll_interval_secs: 1,
        },
    );

    Harness {
        store,
        facade,
        shutdown,
    }
}

fn alice() -> CreateMemberChange {
    CreateMemberChange {
        is_admin: true,
        match_uid: "ldap-alice".to_string(),
        user_name: "alice".to_string(),
        full_name: "Alice Example".to_string(),
        email: "alice@example.com".to_string(),
        password: "correct horse".to_string(),
    }
}

#[tokio::test]
async fn create_member_round_trips_through_the_saga() {
    let h = harness();

    let res = h.facade.create_member(None, &alice()).await.unwrap();
    assert!(!res.has_errors, "unexpected error: {:?}", res.generic_error);
    let member_id = res.member_id.unwrap();

    let member = MemberRepository::new(h.store.clone())
        .load(member_id)
        .await
        .unwrap();
    assert!(member.created());
    assert_eq!(member.user_name(), "alice");
    assert_eq!(member.match_uid(), "ldap-alice");

    // all three uniqueness locks are held by the new member
    let registries = UniqueValueRegistryRepository::new(h.store.clone());
    assert_eq!(
        registries
            .load("username-alice")
            .await
            .unwrap()
            .owner("alice"),
        Some(member_id)
    );
    assert_eq!(
        registries
            .load("email-alice@example.com")
            .await
            .unwrap()
            .owner("alice@example.com"),
        Some(member_id)
    );
    assert_eq!(
        registries
            .load("matchuid-ldap-alice")
            .await
            .unwrap()
            .owner("ldap-alice"),
        Some(member_id)
    );

    let _ = h.shutdown.send(true);
}

#[tokio::test]
async fn duplicate_username_fails_synchronously_with_a_reason() {
    let h = harness();

    let res = h.facade.create_member(None, &alice()).await.unwrap();
    assert!(!res.has_errors);

    let mut second = alice();
    second.email = "other@example.com".to_string();
    second.match_uid = String::new();
    let res = h.facade.create_member(None, &second).await.unwrap();

    assert!(res.has_errors);
    assert!(res.member_id.is_none());
    let reason = res.generic_error.unwrap();
    assert!(reason.contains("already reserved"), "reason: {reason}");

    // the loser's email reservation was rolled back
    let registries = UniqueValueRegistryRepository::new(h.store.clone());
    assert_eq!(
        registries
            .load("email-other@example.com")
            .await
            .unwrap()
            .owner("other@example.com"),
        None
    );

    let _ = h.shutdown.send(true);
}

#[tokio::test]
async fn rename_moves_the_username_reservation() {
    let h = harness();

    let res = h.facade.create_member(None, &alice()).await.unwrap();
    let member_id = res.member_id.unwrap();

    let res = h
        .facade
        .update_member(
            None,
            &UpdateMemberChange {
                member_id,
                is_admin: true,
                user_name: "alicia".to_string(),
                full_name: "Alice Example".to_string(),
                email: "alice@example.com".to_string(),
                prev_user_name: "alice".to_string(),
                prev_email: "alice@example.com".to_string(),
            },
        )
        .await
        .unwrap();
    assert!(!res.has_errors, "unexpected error: {:?}", res.generic_error);

    let registries = UniqueValueRegistryRepository::new(h.store.clone());
    assert_eq!(
        registries
            .load("username-alicia")
            .await
            .unwrap()
            .owner("alicia"),
        Some(member_id)
    );
    // the old name is free again
    assert_eq!(
        registries
            .load("username-alice")
            .await
            .unwrap()
            .owner("alice"),
        None
    );

    // and someone else can take it
    let mut newcomer = alice();
    newcomer.email = "new@example.com".to_string();
    newcomer.match_uid = String::new();
    let res = h.facade.create_member(None, &newcomer).await.unwrap();
    assert!(!res.has_errors, "unexpected error: {:?}", res.generic_error);

    let _ = h.shutdown.send(true);
}

#[tokio::test]
async fn stale_previous_values_complete_with_error_and_release_reservations() {
    let h = harness();

    let res = h.facade.create_member(None, &alice()).await.unwrap();
    let member_id = res.member_id.unwrap();

    // the caller's read view lagged: prev_user_name is wrong
    let res = h
        .facade
        .update_member(
            None,
            &UpdateMemberChange {
                member_id,
                is_admin: true,
                user_name: "al".to_string(),
                full_name: "Alice Example".to_string(),
                email: "alice@example.com".to_string(),
                prev_user_name: "wrong".to_string(),
                prev_email: "alice@example.com".to_string(),
            },
        )
        .await
        .unwrap();

    assert!(res.has_errors);

    // the tentatively reserved new username was rolled back, the old one
    // is still held
    let registries = UniqueValueRegistryRepository::new(h.store.clone());
    assert_eq!(registries.load("username-al").await.unwrap().owner("al"), None);
    assert_eq!(
        registries
            .load("username-alice")
            .await
            .unwrap()
            .owner("alice"),
        Some(member_id)
    );

    let _ = h.shutdown.send(true);
}

#[tokio::test]
async fn set_match_uid_round_trips() {
    let h = harness();

    let mut change = alice();
    change.match_uid = String::new();
    let res = h.facade.create_member(None, &change).await.unwrap();
    let member_id = res.member_id.unwrap();

    let res = h
        .facade
        .set_member_match_uid(None, member_id, "oidc-123")
        .await
        .unwrap();
    assert!(!res.has_errors, "unexpected error: {:?}", res.generic_error);

    let member = MemberRepository::new(h.store.clone())
        .load(member_id)
        .await
        .unwrap();
    assert_eq!(member.match_uid(), "oidc-123");

    assert_eq!(
        UniqueValueRegistryRepository::new(h.store.clone())
            .load("matchuid-oidc-123")
            .await
            .unwrap()
            .owner("oidc-123"),
        Some(member_id)
    );

    let _ = h.shutdown.send(true);
}

#[tokio::test]
async fn events_carry_the_causal_chain() {
    let h = harness();

    let res = h.facade.create_member(None, &alice()).await.unwrap();
    assert!(!res.has_errors);

    let all = h.store.read_all(1, 1000).await.unwrap();
    assert!(!all.is_empty());

    // the request event's correlation id threads through the registry,
    // member and completion events written by the saga
    let request = all
        .iter()
        .find(|e| e.event_type == "MemberChangeCreateRequested")
        .unwrap();
    let correlation = request.meta().unwrap().correlation_id.unwrap();

    for event_type in [
        "UniqueRegistryValueReserved",
        "MemberCreated",
        "MemberChangeCompleted",
    ] {
        let event = all.iter().find(|e| e.event_type == event_type).unwrap();
        let meta = event.meta().unwrap();
        assert_eq!(
            meta.correlation_id,
            Some(correlation),
            "{event_type} lost the correlation id"
        );
        assert!(meta.causation_id.is_some());
        assert!(meta.group_id.is_some());
    }

    let _ = h.shutdown.send(true);
}

#[tokio::test]
async fn rehydration_is_idempotent_under_redelivery() {
    let h = harness();

    let res = h.facade.create_member(None, &alice()).await.unwrap();
    let member_id = res.member_id.unwrap();

    let repo = MemberRepository::new(h.store.clone());
    let mut member = repo.load(member_id).await.unwrap();
    let version = {
        use holon::aggregate::Aggregate;
        member.version()
    };

    // apply the same stream again: versions at or below current are skipped
    let events = h
        .store
        .read_stream(&member_id.to_string(), 1, 1000)
        .await
        .unwrap();
    {
        use holon::aggregate::Aggregate;
        member.apply_events(&events).await.unwrap();
        assert_eq!(member.version(), version);
    }
    assert_eq!(member.user_name(), "alice");

    let _ = h.shutdown.send(true);
}
