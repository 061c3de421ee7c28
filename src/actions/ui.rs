use serde::Deserialize;
use serde_json::Value;

use crate::dispatch::HandlerContext;
use crate::error::Result;
use crate::state::{GlobalState, Screen};

pub const OPEN_CHAT: &str = "ui.open_chat";
pub const SET_SEARCH_QUERY: &str = "ui.set_search_query";
pub const TOGGLE_MODAL: &str = "ui.toggle_modal";
pub const DISMISS_NOTIFICATION: &str = "ui.dismiss_notification";

#[derive(Debug, Deserialize)]
struct OpenChat {
    chat_id: String,
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    #[serde(default)]
    query: String,
}

#[derive(Debug, Deserialize)]
struct ToggleModal {
    modal: String,
}

#[derive(Debug, Deserialize)]
struct Dismiss {
    id: String,
}

pub fn open_chat(
    ctx: &mut HandlerContext<'_>,
    state: &GlobalState,
    payload: Value,
) -> Result<Option<GlobalState>> {
    let OpenChat { chat_id } = ctx.payload(payload)?;
    let mut next = state.clone();
    next.tab.screen = Screen::Chat;
    if next.tab.open_chat_id.as_deref() != Some(chat_id.as_str()) {
        next.tab.selected_message_ids.clear();
    }
    next.tab.open_chat_id = Some(chat_id);
    Ok(Some(next))
}

pub fn set_search_query(
    ctx: &mut HandlerContext<'_>,
    state: &GlobalState,
    payload: Value,
) -> Result<Option<GlobalState>> {
    let SearchQuery { query } = ctx.payload(payload)?;
    if state.tab.search_query == query {
        return Ok(None);
    }
    let mut next = state.clone();
    next.tab.search_query = query;
    Ok(Some(next))
}

/// Opening the modal that is already open closes it.
pub fn toggle_modal(
    ctx: &mut HandlerContext<'_>,
    state: &GlobalState,
    payload: Value,
) -> Result<Option<GlobalState>> {
    let ToggleModal { modal } = ctx.payload(payload)?;
    let mut next = state.clone();
    next.tab.modal = if state.tab.modal.as_deref() == Some(modal.as_str()) {
        None
    } else {
        Some(modal)
    };
    Ok(Some(next))
}

pub fn dismiss_notification(
    ctx: &mut HandlerContext<'_>,
    state: &GlobalState,
    payload: Value,
) -> Result<Option<GlobalState>> {
    let Dismiss { id } = ctx.payload(payload)?;
    let mut next = state.clone();
    next.tab.notifications.retain(|n| n.id != id);
    Ok((next.tab.notifications.len() != state.tab.notifications.len()).then_some(next))
}
