use serde_json::{Value, json};

use crate::dispatch::HandlerContext;
use crate::error::Result;
use crate::model::ConnectionState;
use crate::resources::Resource;
use crate::state::GlobalState;

pub const SIGN_OUT: &str = "auth.sign_out";

/// Log the session out. The tab stays master but stops reconnecting while
/// the state reads `logging_out`.
pub fn sign_out(
    ctx: &mut HandlerContext<'_>,
    state: &GlobalState,
    _payload: Value,
) -> Result<Option<GlobalState>> {
    ctx.call("auth.logOut", json!({}))?;
    ctx.release(Resource::Microphone);
    ctx.release(Resource::Camera);
    ctx.disconnect();
    tracing::info!(tab = %ctx.tab_id(), "signed out");

    let mut next = state.clone();
    next.shared.connection_state = ConnectionState::LoggingOut;
    next.shared.current_user_id = None;
    next.shared.active_call_id = None;
    Ok(Some(next))
}
