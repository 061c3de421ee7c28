use serde_json::Value;

use crate::dispatch::HandlerContext;
use crate::error::Result;
use crate::protocol::Update;
use crate::resources::Resource;
use crate::state::GlobalState;

pub const APPLY_UPDATE: &str = "sync.apply_update";

/// Merge one backend push into shared state. Only the master polls the
/// backend, so in practice this runs there.
pub fn apply_update(
    ctx: &mut HandlerContext<'_>,
    state: &GlobalState,
    payload: Value,
) -> Result<Option<GlobalState>> {
    let update: Update = ctx.payload(payload)?;
    let mut next = state.clone();
    let shared = &mut next.shared;

    match update {
        Update::ConnectionState { state: conn } => shared.connection_state = conn,
        Update::CurrentUser { user_id } => shared.current_user_id = Some(user_id),
        Update::NewMessage { message } => {
            let seen = shared
                .messages
                .get(&message.chat_id)
                .is_some_and(|history| history.iter().any(|m| m.id == message.id));
            if seen {
                return Ok(None);
            }
            let from_other = shared.current_user_id.as_deref() != Some(message.sender_id.as_str());
            if let Some(chat) = shared.chats.get_mut(&message.chat_id) {
                chat.last_message_id = Some(message.id.clone());
                if from_other {
                    chat.unread_count += 1;
                }
            }
            shared
                .messages
                .entry(message.chat_id.clone())
                .or_default()
                .push(message);
        }
        Update::ChatUpdated { chat } => {
            shared.chats.insert(chat.id.clone(), chat);
        }
        Update::UserUpdated { user } => {
            shared.users.insert(user.id.clone(), user);
        }
        Update::CallEnded { call_id } => {
            if shared.active_call_id.as_deref() == Some(call_id.as_str()) {
                shared.active_call_id = None;
                ctx.release(Resource::Microphone);
            }
        }
    }

    Ok((next != *state).then_some(next))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::Harness;
    use crate::model::ConnectionState;
    use crate::state::{Chat, Message};
    use chrono::Utc;
    use serde_json::json;

    fn message(id: &str, sender: &str) -> Message {
        Message {
            id: id.into(),
            chat_id: "c1".into(),
            sender_id: sender.into(),
            text: "hi".into(),
            sent_at: Utc::now(),
        }
    }

    #[test]
    fn connection_state_update_is_applied() {
        let mut h = Harness::master();
        let next = h
            .run(
                APPLY_UPDATE,
                apply_update,
                &GlobalState::default(),
                json!({ "type": "connection_state", "state": "ready" }),
            )
            .unwrap()
            .unwrap();
        assert_eq!(next.shared.connection_state, ConnectionState::Ready);
    }

    #[test]
    fn repeated_update_is_a_no_op() {
        let mut h = Harness::master();
        let mut state = GlobalState::default();
        state.shared.connection_state = ConnectionState::Ready;
        let next = h
            .run(
                APPLY_UPDATE,
                apply_update,
                &state,
                json!({ "type": "connection_state", "state": "ready" }),
            )
            .unwrap();
        assert!(next.is_none());
    }

    #[test]
    fn new_message_bumps_unread_for_others_only() {
        let mut h = Harness::master();
        let mut state = GlobalState::default();
        state.shared.current_user_id = Some("me".into());
        state.shared.chats.insert(
            "c1".into(),
            Chat {
                id: "c1".into(),
                title: "Team".into(),
                unread_count: 0,
                last_message_id: None,
            },
        );

        let theirs = serde_json::to_value(Update::NewMessage {
            message: message("m1", "them"),
        })
        .unwrap();
        let state = h.run(APPLY_UPDATE, apply_update, &state, theirs.clone()).unwrap().unwrap();
        let mine = serde_json::to_value(Update::NewMessage {
            message: message("m2", "me"),
        })
        .unwrap();
        let state = h.run(APPLY_UPDATE, apply_update, &state, mine).unwrap().unwrap();

        let chat = &state.shared.chats["c1"];
        assert_eq!(chat.unread_count, 1);
        assert_eq!(chat.last_message_id.as_deref(), Some("m2"));
        assert_eq!(state.shared.messages["c1"].len(), 2);

        let replayed = h.run(APPLY_UPDATE, apply_update, &state, theirs).unwrap();
        assert!(replayed.is_none());
    }

    #[test]
    fn replayed_message_leaves_unread_and_last_id_alone() {
        let mut h = Harness::master();
        let mut state = GlobalState::default();
        state.shared.current_user_id = Some("me".into());
        state.shared.chats.insert(
            "c1".into(),
            Chat {
                id: "c1".into(),
                title: "Team".into(),
                unread_count: 0,
                last_message_id: None,
            },
        );
        let push = |id: &str| {
            serde_json::to_value(Update::NewMessage {
                message: message(id, "them"),
            })
            .unwrap()
        };

        let state = h.run(APPLY_UPDATE, apply_update, &state, push("m1")).unwrap().unwrap();
        let state = h.run(APPLY_UPDATE, apply_update, &state, push("m2")).unwrap().unwrap();
        let after = h
            .run(APPLY_UPDATE, apply_update, &state, push("m1"))
            .unwrap()
            .unwrap_or(state);

        let chat = &after.shared.chats["c1"];
        assert_eq!(chat.unread_count, 2);
        assert_eq!(chat.last_message_id.as_deref(), Some("m2"));
        assert_eq!(after.shared.messages["c1"].len(), 2);
    }

    #[test]
    fn call_ended_clears_matching_call() {
        let mut h = Harness::master();
        let mut state = GlobalState::default();
        state.shared.active_call_id = Some("call-1".into());

        let other = h
            .run(
                APPLY_UPDATE,
                apply_update,
                &state,
                json!({ "type": "call_ended", "call_id": "call-2" }),
            )
            .unwrap();
        assert!(other.is_none());

        let next = h
            .run(
                APPLY_UPDATE,
                apply_update,
                &state,
                json!({ "type": "call_ended", "call_id": "call-1" }),
            )
            .unwrap()
            .unwrap();
        assert_eq!(next.shared.active_call_id, None);
    }

    #[test]
    fn malformed_update_is_rejected() {
        let mut h = Harness::master();
        let err = h
            .run(
                APPLY_UPDATE,
                apply_update,
                &GlobalState::default(),
                json!({ "type": "nonsense" }),
            )
            .unwrap_err();
        assert_eq!(err.code(), "invalid_payload");
    }
}
