use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};
use uuid::Uuid;

use confab_types::events::ChatEvent;

/// Per-chat sets of live subscriber channels. Cloning shares the same
/// underlying map, so the REST handlers and every connection task publish
/// into and leave from the same registry.
///
/// The lock is held only for map access. Delivery itself goes through each
/// subscriber's unbounded channel, so a slow client never blocks `publish`
/// or delivery to anyone else.
///
/// Every critical section leaves the map consistent, so a poisoned lock
/// (a panic elsewhere while holding the guard) is recovered instead of
/// propagated: `publish` keeps delivering to the remaining subscribers no
/// matter what killed one of them.
#[derive(Clone, Default)]
pub struct SubscriptionRegistry {
    inner: Arc<RwLock<HashMap<i64, HashMap<Uuid, UnboundedSender<ChatEvent>>>>>,
}

/// A live binding between one connection and one chat. Leaves the registry
/// on [`Subscription::leave`] or on drop, whichever comes first; both are
/// safe to hit on every exit path of a connection task.
pub struct Subscription {
    registry: SubscriptionRegistry,
    chat_id: i64,
    conn_id: Uuid,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber under `chat_id`. Returns the handle that
    /// unregisters it and the receiving half of its event channel.
    pub fn join(&self, chat_id: i64) -> (Subscription, UnboundedReceiver<ChatEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut chats = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        chats.entry(chat_id).or_default().insert(conn_id, tx);
        debug!(chat_id, %conn_id, "subscriber joined");

        (
            Subscription {
                registry: self.clone(),
                chat_id,
                conn_id,
            },
            rx,
        )
    }

    /// Deliver `event` to every subscriber currently registered under
    /// `chat_id`. Fire-and-forget: a closed receiver is pruned and logged,
    /// never retried, and never fails the caller.
    pub fn publish(&self, chat_id: i64, event: ChatEvent) {
        let dead: Vec<Uuid> = {
            let chats = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            let Some(subscribers) = chats.get(&chat_id) else {
                return;
            };
            subscribers
                .iter()
                .filter_map(|(conn_id, tx)| tx.send(event.clone()).is_err().then_some(*conn_id))
                .collect()
        };

        if !dead.is_empty() {
            warn!(
                chat_id,
                pruned = dead.len(),
                "dropping subscribers that went away during delivery"
            );
            let mut chats = self.inner.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(subscribers) = chats.get_mut(&chat_id) {
                for conn_id in dead {
                    subscribers.remove(&conn_id);
                }
                if subscribers.is_empty() {
                    chats.remove(&chat_id);
                }
            }
        }
    }

    /// Number of live subscribers for a chat.
    pub fn subscriber_count(&self, chat_id: i64) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&chat_id)
            .map_or(0, |subscribers| subscribers.len())
    }

    fn leave(&self, chat_id: i64, conn_id: Uuid) {
        let mut chats = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(subscribers) = chats.get_mut(&chat_id) {
            if subscribers.remove(&conn_id).is_some() {
                debug!(chat_id, %conn_id, "subscriber left");
            }
            if subscribers.is_empty() {
                chats.remove(&chat_id);
            }
        }
    }
}

impl Subscription {
    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }

    /// Unregister this subscriber. Idempotent; drop performs the same
    /// cleanup for exit paths that never reach an explicit leave.
    pub fn leave(&self) {
        self.registry.leave(self.chat_id, self.conn_id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.leave(self.chat_id, self.conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn send_json(text: &str, id: i64) -> ChatEvent {
        ChatEvent::SendJson {
            text: text.into(),
            created: true,
            id,
        }
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers_in_order() {
        let registry = SubscriptionRegistry::new();
        let (_sub_a, mut rx_a) = registry.join(1);
        let (_sub_b, mut rx_b) = registry.join(1);

        registry.publish(1, send_json("first", 10));
        registry.publish(1, send_json("second", 11));

        for rx in [&mut rx_a, &mut rx_b] {
            assert_eq!(rx.recv().await.unwrap(), send_json("first", 10));
            assert_eq!(rx.recv().await.unwrap(), send_json("second", 11));
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn events_never_cross_chats() {
        let registry = SubscriptionRegistry::new();
        let (_sub_x, mut rx_x) = registry.join(1);
        let (_sub_y, mut rx_y) = registry.join(2);

        registry.publish(1, send_json("for chat 1", 1));

        assert_eq!(rx_x.recv().await.unwrap(), send_json("for chat 1", 1));
        assert!(rx_y.try_recv().is_err());
    }

    #[tokio::test]
    async fn leave_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        let (sub, _rx) = registry.join(1);
        assert_eq!(registry.subscriber_count(1), 1);

        sub.leave();
        sub.leave();
        assert_eq!(registry.subscriber_count(1), 0);

        // drop after explicit leave is also a no-op
        drop(sub);
        assert_eq!(registry.subscriber_count(1), 0);
    }

    #[tokio::test]
    async fn drop_guard_unregisters() {
        let registry = SubscriptionRegistry::new();
        let (sub_kept, mut rx_kept) = registry.join(1);
        {
            let (_sub, _rx) = registry.join(1);
            assert_eq!(registry.subscriber_count(1), 2);
        }
        // the scoped subscription is gone before any publish iterates it
        assert_eq!(registry.subscriber_count(1), 1);

        registry.publish(1, send_json("still here", 5));
        assert_eq!(rx_kept.recv().await.unwrap(), send_json("still here", 5));
        sub_kept.leave();
    }

    #[tokio::test]
    async fn dead_subscriber_is_pruned_without_hurting_others() {
        let registry = SubscriptionRegistry::new();
        let (_sub_live, mut rx_live) = registry.join(1);
        let (sub_dead, rx_dead) = registry.join(1);

        // receiver gone but the handle never left: publish must prune it
        drop(rx_dead);
        registry.publish(1, send_json("hi", 1));

        assert_eq!(rx_live.recv().await.unwrap(), send_json("hi", 1));
        assert_eq!(registry.subscriber_count(1), 1);
        // a late leave on the pruned handle stays a no-op
        sub_dead.leave();
        assert_eq!(registry.subscriber_count(1), 1);
    }

    #[tokio::test]
    async fn poisoned_lock_does_not_stop_delivery() {
        let registry = SubscriptionRegistry::new();
        let (_sub, mut rx) = registry.join(1);

        // panic while holding the write guard to poison the lock
        let poisoner = registry.clone();
        std::thread::spawn(move || {
            let _guard = poisoner.inner.write().unwrap();
            panic!("subscriber task died");
        })
        .join()
        .unwrap_err();

        registry.publish(1, send_json("still delivered", 8));
        assert_eq!(rx.recv().await.unwrap(), send_json("still delivered", 8));
        assert_eq!(registry.subscriber_count(1), 1);
    }

    #[tokio::test]
    async fn empty_chats_are_removed_from_the_map() {
        let registry = SubscriptionRegistry::new();
        let (sub, _rx) = registry.join(42);
        sub.leave();

        // publishing to a chat with no subscribers is a no-op
        registry.publish(42, send_json("into the void", 1));
        assert_eq!(registry.subscriber_count(42), 0);
    }
}
