//! End-to-end tests for the message creation flow: authorization,
//! persistence, and fan-out to live subscribers.

use std::path::PathBuf;
use std::sync::Arc;

use confab_api::auth::{AppState, AppStateInner};
use confab_api::error::ApiError;
use confab_api::messages::create_message;
use confab_db::Database;
use confab_gateway::registry::SubscriptionRegistry;
use confab_types::events::ChatEvent;

fn state() -> AppState {
    Arc::new(AppStateInner {
        db: Arc::new(Database::open_in_memory().unwrap()),
        registry: SubscriptionRegistry::new(),
        upload_dir: PathBuf::from("target/test-uploads"),
    })
}

fn seed_user(db: &Database, name: &str) -> i64 {
    db.create_user(name, &format!("{name}@example.com"), "hash")
        .unwrap()
}

fn send_json(text: &str, id: i64) -> ChatEvent {
    ChatEvent::SendJson {
        text: text.into(),
        created: true,
        id,
    }
}

#[tokio::test]
async fn fanout_reaches_every_participant_exactly_once() {
    let state = state();
    let alice = seed_user(&state.db, "alice");
    let bob = seed_user(&state.db, "bob");
    let chat_id = state.db.create_chat("t1", alice, &[bob]).unwrap();

    let (_sub_a, mut rx_a) = state.registry.join(chat_id);
    let (_sub_b, mut rx_b) = state.registry.join(chat_id);

    let row = create_message(&state, alice, chat_id, "hi".into())
        .await
        .unwrap();

    for rx in [&mut rx_a, &mut rx_b] {
        assert_eq!(rx.recv().await.unwrap(), send_json("hi", row.id));
        assert!(rx.try_recv().is_err());
    }
}

#[tokio::test]
async fn events_preserve_per_chat_order() {
    let state = state();
    let alice = seed_user(&state.db, "alice");
    let chat_id = state.db.create_chat("t1", alice, &[]).unwrap();

    let (_sub, mut rx) = state.registry.join(chat_id);

    let first = create_message(&state, alice, chat_id, "first".into())
        .await
        .unwrap();
    let second = create_message(&state, alice, chat_id, "second".into())
        .await
        .unwrap();

    assert_eq!(rx.recv().await.unwrap(), send_json("first", first.id));
    assert_eq!(rx.recv().await.unwrap(), send_json("second", second.id));
}

#[tokio::test]
async fn message_is_durable_before_any_subscriber_observes_it() {
    let state = state();
    let alice = seed_user(&state.db, "alice");
    let chat_id = state.db.create_chat("t1", alice, &[]).unwrap();

    let (_sub, mut rx) = state.registry.join(chat_id);
    create_message(&state, alice, chat_id, "hi".into())
        .await
        .unwrap();

    let ChatEvent::SendJson { id, created, .. } = rx.recv().await.unwrap();
    assert!(created);
    // The event's id must already be fetchable from the repository.
    let stored = state.db.get_message(id).unwrap().unwrap();
    assert_eq!(stored.text, "hi");
    assert_eq!(stored.chat_id, chat_id);
}

#[tokio::test]
async fn outsider_cannot_send_and_nothing_is_published() {
    let state = state();
    let alice = seed_user(&state.db, "alice");
    let mallory = seed_user(&state.db, "mallory");
    let chat_id = state.db.create_chat("t1", alice, &[]).unwrap();

    let (_sub, mut rx) = state.registry.join(chat_id);

    let err = create_message(&state, mallory, chat_id, "let me in".into())
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Forbidden));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn unknown_chat_is_refused_without_touching_the_registry() {
    let state = state();
    let alice = seed_user(&state.db, "alice");

    let err = create_message(&state, alice, 9999, "hello?".into())
        .await
        .unwrap_err();
    assert!(matches!(err, ApiError::Forbidden));
    assert_eq!(state.registry.subscriber_count(9999), 0);
}

#[tokio::test]
async fn closed_chat_refuses_new_messages() {
    let state = state();
    let alice = seed_user(&state.db, "alice");
    let bob = seed_user(&state.db, "bob");
    let chat_id = state.db.create_chat("t1", alice, &[bob]).unwrap();
    state.db.close_chat(chat_id).unwrap();

    for sender in [alice, bob] {
        let err = create_message(&state, sender, chat_id, "too late".into())
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden));
    }
}

#[tokio::test]
async fn disconnected_subscriber_does_not_block_the_rest() {
    let state = state();
    let alice = seed_user(&state.db, "alice");
    let bob = seed_user(&state.db, "bob");
    let chat_id = state.db.create_chat("t1", alice, &[bob]).unwrap();

    let (_sub_live, mut rx_live) = state.registry.join(chat_id);
    let (_sub_dead, rx_dead) = state.registry.join(chat_id);
    drop(rx_dead);

    let row = create_message(&state, alice, chat_id, "hi".into())
        .await
        .unwrap();

    assert_eq!(rx_live.recv().await.unwrap(), send_json("hi", row.id));
    assert_eq!(state.registry.subscriber_count(chat_id), 1);
}
