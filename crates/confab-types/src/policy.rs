//! Pure authorization predicates, shared by the REST handlers and the
//! websocket gateway so both surfaces enforce the same rules.

use crate::models::ChatMembership;

/// Read access: the creator is always a participant, invited users as well.
/// An unknown chat (`None`) answers false, so callers uniformly render
/// "not found or forbidden" without leaking existence.
pub fn can_read(user_id: i64, chat: Option<&ChatMembership>) -> bool {
    match chat {
        Some(chat) => chat.creator_id == user_id || chat.invited_ids.contains(&user_id),
        None => false,
    }
}

/// Send access: participants only, and never into a closed chat. Closed
/// chats stay readable as archives.
pub fn can_send(user_id: i64, chat: Option<&ChatMembership>) -> bool {
    match chat {
        Some(chat) => !chat.is_closed && can_read(user_id, Some(chat)),
        None => false,
    }
}

/// Mutation access (closing the chat, deleting attached files). Same
/// participant set as read in this model.
pub fn can_write(user_id: i64, chat: Option<&ChatMembership>) -> bool {
    can_read(user_id, chat)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(creator_id: i64, invited_ids: &[i64], is_closed: bool) -> ChatMembership {
        ChatMembership {
            creator_id,
            invited_ids: invited_ids.to_vec(),
            is_closed,
        }
    }

    #[test]
    fn read_allowed_for_creator_and_invited_only() {
        let c = chat(1, &[2, 3], false);
        assert!(can_read(1, Some(&c)));
        assert!(can_read(2, Some(&c)));
        assert!(can_read(3, Some(&c)));
        assert!(!can_read(4, Some(&c)));
    }

    #[test]
    fn unknown_chat_denies_everything() {
        assert!(!can_read(1, None));
        assert!(!can_send(1, None));
        assert!(!can_write(1, None));
    }

    #[test]
    fn closed_chat_is_a_read_only_archive() {
        let c = chat(1, &[2], true);
        assert!(can_read(1, Some(&c)));
        assert!(can_read(2, Some(&c)));
        assert!(!can_send(1, Some(&c)));
        assert!(!can_send(2, Some(&c)));
    }

    #[test]
    fn send_requires_participation() {
        let c = chat(1, &[2], false);
        assert!(can_send(1, Some(&c)));
        assert!(can_send(2, Some(&c)));
        assert!(!can_send(9, Some(&c)));
    }
}
