use crate::store::{ChatStore, StoreError};
use crate::ws::ConnectionRegistry;
use relay_common::{ChatId, Delivery, Message, MessageDelivery, MessageKind, UserId};
use std::iter;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ServiceError>;

pub struct ChatService {
    store: Arc<ChatStore>,
    registry: Arc<ConnectionRegistry>,
}

impl ChatService {
    pub fn new(store: Arc<ChatStore>, registry: Arc<ConnectionRegistry>) -> Self {
        Self { store, registry }
    }

    /// Create a chat for `members` plus the caller.
    ///
    /// Only the caller learns the new ID; other members are not notified.
    pub fn create_chat(&self, caller: &UserId, members: Vec<UserId>) -> Result<ChatId> {
        let ch_id = self
            .store
            .create_chat(members.into_iter().chain(iter::once(caller.clone())))?;

        info!("New chat {} created by {}", ch_id, caller);
        Ok(ch_id)
    }

    /// Append a message and fan it out to every other member.
    ///
    /// Delivery is fire-and-forget: offline or backed-up members simply
    /// miss it, and that never fails the call.
    pub fn post_message(
        &self,
        ch_id: &ChatId,
        kind: MessageKind,
        body: impl Into<String>,
        from_id: &UserId,
    ) -> Result<Message> {
        let message = Message::new(body, from_id.clone());
        self.store.append_message(ch_id, message.clone())?;
        let members = self.store.members_of(ch_id)?;

        let delivery = Delivery::NewMessage(MessageDelivery {
            message: message.clone(),
            kind,
            ch_id: ch_id.clone(),
        });

        let mut delivered = 0;
        for member in members.iter().filter(|member| *member != from_id) {
            if self.registry.deliver(member, delivery.clone()) {
                delivered += 1;
            }
        }

        debug!(
            "Message {} in chat {} from {} delivered to {} of {} recipients",
            message.id,
            ch_id,
            from_id,
            delivered,
            members.len().saturating_sub(1)
        );

        Ok(message)
    }

    /// Send a delivery back to `user_id` on its own connection.
    pub fn reply(&self, user_id: &UserId, delivery: Delivery) {
        self.registry.deliver(user_id, delivery);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ws::registry::Registration;
    use tokio::sync::mpsc::error::TryRecvError;

    fn service() -> (ChatService, Arc<ChatStore>, Arc<ConnectionRegistry>) {
        let store = Arc::new(ChatStore::new());
        let registry = Arc::new(ConnectionRegistry::new(16));
        (
            ChatService::new(store.clone(), registry.clone()),
            store,
            registry,
        )
    }

    fn drain(reg: &mut Registration) -> Vec<Delivery> {
        let mut out = Vec::new();
        while let Ok(delivery) = reg.sink.try_recv() {
            out.push(delivery);
        }
        out
    }

    #[test]
    fn test_create_chat_includes_caller() {
        let (service, store, _) = service();
        let alice = UserId::from("alice");

        let ch_id = service
            .create_chat(&alice, vec![UserId::from("bob")])
            .unwrap();

        assert_eq!(
            store.members_of(&ch_id).unwrap(),
            vec![UserId::from("alice"), UserId::from("bob")]
        );
    }

    #[test]
    fn test_create_chat_does_not_notify_members() {
        let (service, _, registry) = service();
        let mut bob = registry.register(UserId::from("bob"));

        service
            .create_chat(&UserId::from("alice"), vec![UserId::from("bob")])
            .unwrap();

        assert_eq!(bob.sink.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_message_reaches_other_member_only() {
        let (service, _, registry) = service();
        let alice = UserId::from("alice");
        let mut alice_reg = registry.register(alice.clone());
        let mut bob_reg = registry.register(UserId::from("bob"));

        let ch_id = service
            .create_chat(&alice, vec![UserId::from("bob")])
            .unwrap();
        service
            .post_message(&ch_id, MessageKind::Add, "hi", &alice)
            .unwrap();

        let bob_got = drain(&mut bob_reg);
        assert_eq!(bob_got.len(), 1);
        match &bob_got[0] {
            Delivery::NewMessage(delivery) => {
                assert_eq!(delivery.message.body, "hi");
                assert_eq!(delivery.message.from_id, alice);
                assert_eq!(delivery.ch_id, ch_id);
                assert_eq!(delivery.kind, MessageKind::Add);
            }
            other => panic!("unexpected delivery: {:?}", other),
        }
        assert!(drain(&mut alice_reg).is_empty());
    }

    #[test]
    fn test_fan_out_skips_non_members() {
        let (service, _, registry) = service();
        let alice = UserId::from("alice");
        let mut bob = registry.register(UserId::from("bob"));
        let mut carol = registry.register(UserId::from("carol"));
        let mut mallory = registry.register(UserId::from("mallory"));

        let ch_id = service
            .create_chat(&alice, vec![UserId::from("bob"), UserId::from("carol")])
            .unwrap();
        service
            .post_message(&ch_id, MessageKind::Add, "team update", &alice)
            .unwrap();

        assert_eq!(drain(&mut bob).len(), 1);
        assert_eq!(drain(&mut carol).len(), 1);
        assert!(drain(&mut mallory).is_empty());
    }

    #[test]
    fn test_unknown_chat_is_not_found() {
        let (service, store, _) = service();

        let err = service
            .post_message(
                &ChatId::from("nonexistent"),
                MessageKind::Add,
                "hi",
                &UserId::from("alice"),
            )
            .unwrap_err();

        assert!(matches!(
            err,
            ServiceError::Store(StoreError::ChatNotFound(_))
        ));
        assert!(err.to_string().contains("not found"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_offline_recipient_still_stores_message() {
        let (service, store, _) = service();
        let alice = UserId::from("alice");

        let ch_id = service
            .create_chat(&alice, vec![UserId::from("bob")])
            .unwrap();
        service
            .post_message(&ch_id, MessageKind::Add, "hi", &alice)
            .unwrap();

        let history = store.history(&ch_id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].body, "hi");
    }

    #[test]
    fn test_sequential_posts_keep_order() {
        let (service, store, registry) = service();
        let alice = UserId::from("alice");
        let mut bob = registry.register(UserId::from("bob"));

        let ch_id = service
            .create_chat(&alice, vec![UserId::from("bob")])
            .unwrap();
        for body in ["one", "two", "three"] {
            service
                .post_message(&ch_id, MessageKind::Add, body, &alice)
                .unwrap();
        }

        let stored: Vec<_> = store
            .history(&ch_id)
            .unwrap()
            .into_iter()
            .map(|m| m.body)
            .collect();
        assert_eq!(stored, vec!["one", "two", "three"]);

        let delivered: Vec<_> = drain(&mut bob)
            .into_iter()
            .filter_map(|d| match d {
                Delivery::NewMessage(m) => Some(m.message.body),
                _ => None,
            })
            .collect();
        assert_eq!(delivered, vec!["one", "two", "three"]);
    }
}
