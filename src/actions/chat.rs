use serde::Deserialize;
use serde_json::{Value, json};

use crate::dispatch::HandlerContext;
use crate::error::{MeshError, Result};
use crate::state::{GlobalState, Message};

pub const SEND_MESSAGE: &str = "chat.send_message";
pub const MARK_READ: &str = "chat.mark_read";
pub const READ_HISTORY: &str = "chat.read_history";

#[derive(Debug, Deserialize)]
struct SendMessage {
    chat_id: String,
    text: String,
}

#[derive(Debug, Deserialize)]
struct MarkRead {
    chat_id: String,
}

pub fn send_message(
    ctx: &mut HandlerContext<'_>,
    state: &GlobalState,
    payload: Value,
) -> Result<Option<GlobalState>> {
    let SendMessage { chat_id, text } = ctx.payload(payload)?;
    if text.trim().is_empty() {
        return Err(MeshError::payload(SEND_MESSAGE, "text is empty"));
    }

    let reply = ctx.call(
        "messages.sendMessage",
        json!({ "chat_id": chat_id, "text": text }),
    )?;
    let id = reply
        .get("message_id")
        .and_then(Value::as_str)
        .ok_or_else(|| MeshError::Protocol("messages.sendMessage: reply without message_id".into()))?
        .to_string();

    let mut next = state.clone();
    let shared = &mut next.shared;
    if let Some(chat) = shared.chats.get_mut(&chat_id) {
        chat.last_message_id = Some(id.clone());
    }
    shared.messages.entry(chat_id.clone()).or_default().push(Message {
        id,
        chat_id,
        sender_id: shared.current_user_id.clone().unwrap_or_default(),
        text,
        sent_at: ctx.now(),
    });
    Ok(Some(next))
}

/// Optimistic: zero the unread count right away. The master tells the
/// backend itself; a follower asks the master through [`READ_HISTORY`] so the
/// canonical state catches up with its local mark.
pub fn mark_read(
    ctx: &mut HandlerContext<'_>,
    state: &GlobalState,
    payload: Value,
) -> Result<Option<GlobalState>> {
    let MarkRead { chat_id } = ctx.payload(payload)?;
    if !has_unread(state, &chat_id) {
        return Ok(None);
    }
    if ctx.has_client() {
        tell_backend(ctx, state, &chat_id);
    } else {
        ctx.dispatch(READ_HISTORY, json!({ "chat_id": chat_id }));
    }
    Ok(Some(zero_unread(state, &chat_id)))
}

/// Master side of a read mark made anywhere in the session.
pub fn read_history(
    ctx: &mut HandlerContext<'_>,
    state: &GlobalState,
    payload: Value,
) -> Result<Option<GlobalState>> {
    let MarkRead { chat_id } = ctx.payload(payload)?;
    if !has_unread(state, &chat_id) {
        return Ok(None);
    }
    tell_backend(ctx, state, &chat_id);
    Ok(Some(zero_unread(state, &chat_id)))
}

fn has_unread(state: &GlobalState, chat_id: &str) -> bool {
    state
        .shared
        .chats
        .get(chat_id)
        .is_some_and(|chat| chat.unread_count > 0)
}

fn tell_backend(ctx: &mut HandlerContext<'_>, state: &GlobalState, chat_id: &str) {
    let max_id = state
        .shared
        .chats
        .get(chat_id)
        .and_then(|chat| chat.last_message_id.clone());
    if let Err(err) = ctx.call(
        "messages.readHistory",
        json!({ "chat_id": chat_id, "max_id": max_id }),
    ) {
        tracing::debug!(%chat_id, %err, "readHistory failed; keeping local read mark");
    }
}

fn zero_unread(state: &GlobalState, chat_id: &str) -> GlobalState {
    let mut next = state.clone();
    if let Some(chat) = next.shared.chats.get_mut(chat_id) {
        chat.unread_count = 0;
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::Harness;
    use crate::state::Chat;

    fn with_chat(unread: u32) -> GlobalState {
        let mut state = GlobalState::default();
        state.shared.current_user_id = Some("me".into());
        state.shared.chats.insert(
            "c1".into(),
            Chat {
                id: "c1".into(),
                title: "Team".into(),
                unread_count: unread,
                last_message_id: Some("m0".into()),
            },
        );
        state
    }

    #[test]
    fn send_appends_returned_message() {
        let mut h = Harness::master();
        let next = h
            .run(
                SEND_MESSAGE,
                send_message,
                &with_chat(0),
                json!({ "chat_id": "c1", "text": "hello" }),
            )
            .unwrap()
            .unwrap();
        let sent = &next.shared.messages["c1"][0];
        assert_eq!(sent.id, "msg-1");
        assert_eq!(sent.sender_id, "me");
        assert_eq!(next.shared.chats["c1"].last_message_id.as_deref(), Some("msg-1"));
    }

    #[test]
    fn send_rejects_blank_text() {
        let mut h = Harness::master();
        let err = h
            .run(
                SEND_MESSAGE,
                send_message,
                &with_chat(0),
                json!({ "chat_id": "c1", "text": "  " }),
            )
            .unwrap_err();
        assert_eq!(err.code(), "invalid_payload");
        assert!(h.handle.calls().is_empty());
    }

    #[test]
    fn mark_read_on_follower_asks_master() {
        let mut h = Harness::follower();
        let next = h
            .run(MARK_READ, mark_read, &with_chat(4), json!({ "chat_id": "c1" }))
            .unwrap()
            .unwrap();
        assert_eq!(next.shared.chats["c1"].unread_count, 0);
        assert!(h.handle.calls().is_empty());

        let queued: Vec<(String, Value)> = h.actions.drain().collect();
        assert_eq!(queued, vec![(READ_HISTORY.to_string(), json!({ "chat_id": "c1" }))]);
    }

    #[test]
    fn read_history_zeroes_and_tells_backend() {
        let mut h = Harness::master();
        let next = h
            .run(READ_HISTORY, read_history, &with_chat(5), json!({ "chat_id": "c1" }))
            .unwrap()
            .unwrap();
        assert_eq!(next.shared.chats["c1"].unread_count, 0);
        let calls = h.handle.calls();
        assert_eq!(calls[0].0, "messages.readHistory");
        assert_eq!(calls[0].1["max_id"], "m0");
        assert_eq!(h.actions.drain().count(), 0);
    }

    #[test]
    fn read_history_on_read_chat_is_a_no_op() {
        let mut h = Harness::master();
        assert!(h
            .run(READ_HISTORY, read_history, &with_chat(0), json!({ "chat_id": "c1" }))
            .unwrap()
            .is_none());
        assert!(h.handle.calls().is_empty());
    }

    #[test]
    fn mark_read_on_master_tells_backend() {
        let mut h = Harness::master();
        h.run(MARK_READ, mark_read, &with_chat(2), json!({ "chat_id": "c1" }))
            .unwrap()
            .unwrap();
        assert_eq!(h.handle.call_count("messages.readHistory"), 1);
    }

    #[test]
    fn mark_read_unknown_or_read_chat_is_a_no_op() {
        let mut h = Harness::master();
        assert!(h
            .run(MARK_READ, mark_read, &with_chat(0), json!({ "chat_id": "c1" }))
            .unwrap()
            .is_none());
        assert!(h
            .run(MARK_READ, mark_read, &with_chat(3), json!({ "chat_id": "zz" }))
            .unwrap()
            .is_none());
    }
}
