use serde::Deserialize;
use serde_json::{Value, json};

use crate::dispatch::HandlerContext;
use crate::error::{MeshError, Result};
use crate::resources::Resource;
use crate::state::GlobalState;

pub const JOIN: &str = "call.join";
pub const LEAVE: &str = "call.leave";

#[derive(Debug, Deserialize)]
struct JoinCall {
    chat_id: String,
}

pub fn join(
    ctx: &mut HandlerContext<'_>,
    state: &GlobalState,
    payload: Value,
) -> Result<Option<GlobalState>> {
    let JoinCall { chat_id } = ctx.payload(payload)?;
    if let Some(active) = &state.shared.active_call_id {
        return Err(MeshError::HandlerFailed {
            action: JOIN.into(),
            reason: format!("already in call {active}"),
        });
    }

    ctx.acquire(Resource::Microphone)?;
    let call_id = match request_call(ctx, &chat_id) {
        Ok(call_id) => call_id,
        Err(err) => {
            ctx.release(Resource::Microphone);
            return Err(err);
        }
    };
    tracing::info!(%chat_id, %call_id, "joined call");

    let mut next = state.clone();
    next.shared.active_call_id = Some(call_id);
    Ok(Some(next))
}

fn request_call(ctx: &mut HandlerContext<'_>, chat_id: &str) -> Result<String> {
    let reply = ctx.call("phone.requestCall", json!({ "chat_id": chat_id }))?;
    reply
        .get("call_id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| MeshError::Protocol("phone.requestCall: reply without call_id".into()))
}

pub fn leave(
    ctx: &mut HandlerContext<'_>,
    state: &GlobalState,
    _payload: Value,
) -> Result<Option<GlobalState>> {
    let Some(call_id) = &state.shared.active_call_id else {
        return Ok(None);
    };
    ctx.call("phone.discardCall", json!({ "call_id": call_id }))?;
    ctx.release(Resource::Microphone);

    let mut next = state.clone();
    next.shared.active_call_id = None;
    Ok(Some(next))
}
