//! Built-in actions of the messaging client.
//!
//! Names are namespaced by area. Handlers are reducers: they never mutate
//! the state they are given, they return a replacement.

pub mod auth;
pub mod call;
pub mod chat;
pub mod sync;
pub mod ui;

use crate::dispatch::ActionRegistry;
use crate::error::Result;
use crate::model::Gate;

/// Registry with every built-in action.
pub fn builtin_registry() -> Result<ActionRegistry> {
    let mut registry = ActionRegistry::new();
    registry.add_action_handler(sync::APPLY_UPDATE, Gate::Local, sync::apply_update)?;
    registry.add_action_handler(call::JOIN, Gate::Master, call::join)?;
    registry.add_action_handler(call::LEAVE, Gate::Master, call::leave)?;
    registry.add_action_handler(chat::SEND_MESSAGE, Gate::Master, chat::send_message)?;
    registry.add_action_handler(chat::MARK_READ, Gate::Local, chat::mark_read)?;
    registry.add_action_handler(chat::READ_HISTORY, Gate::Master, chat::read_history)?;
    registry.add_action_handler(ui::OPEN_CHAT, Gate::Local, ui::open_chat)?;
    registry.add_action_handler(ui::SET_SEARCH_QUERY, Gate::Local, ui::set_search_query)?;
    registry.add_action_handler(ui::TOGGLE_MODAL, Gate::Local, ui::toggle_modal)?;
    registry.add_action_handler(
        ui::DISMISS_NOTIFICATION,
        Gate::Local,
        ui::dismiss_notification,
    )?;
    registry.add_action_handler(auth::SIGN_OUT, Gate::Master, auth::sign_out)?;
    Ok(registry)
}

/// Shared fixtures for handler tests.
#[cfg(test)]
pub(crate) mod testing {
    use chrono::Utc;
    use serde_json::Value;

    use crate::dispatch::{Actions, HandlerContext};
    use crate::error::Result;
    use crate::protocol::{LoopbackClient, LoopbackHandle, ProtocolClient};
    use crate::resources::ExclusiveResources;
    use crate::state::GlobalState;
    use crate::tab_id::TabId;

    pub struct Harness {
        pub id: TabId,
        pub actions: Actions,
        pub resources: ExclusiveResources,
        pub client: LoopbackClient,
        pub handle: LoopbackHandle,
        pub master: bool,
    }

    impl Harness {
        /// A confirmed master with a connected loopback client.
        pub fn master() -> Self {
            let (mut client, handle) = LoopbackClient::new();
            client.connect().unwrap();
            client.poll_updates();
            let mut resources = ExclusiveResources::new(3);
            resources.on_confirmed();
            Self {
                id: "00000000000000a1".parse().unwrap(),
                actions: Actions::default(),
                resources,
                client,
                handle,
                master: true,
            }
        }

        pub fn follower() -> Self {
            Self {
                master: false,
                resources: ExclusiveResources::new(3),
                ..Self::master()
            }
        }

        pub fn run<F>(
            &mut self,
            name: &str,
            handler: F,
            state: &GlobalState,
            payload: Value,
        ) -> Result<Option<GlobalState>>
        where
            F: Fn(&mut HandlerContext<'_>, &GlobalState, Value) -> Result<Option<GlobalState>>,
        {
            let client: Option<&mut dyn ProtocolClient> = if self.master {
                Some(&mut self.client)
            } else {
                None
            };
            let mut ctx = HandlerContext::new(
                name,
                &self.id,
                Utc::now(),
                &mut self.actions,
                client,
                &mut self.resources,
            );
            handler(&mut ctx, state, payload)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_gates() {
        let registry = builtin_registry().unwrap();
        assert_eq!(registry.gate("call.join"), Some(Gate::Master));
        assert_eq!(registry.gate("chat.send_message"), Some(Gate::Master));
        assert_eq!(registry.gate("auth.sign_out"), Some(Gate::Master));
        assert_eq!(registry.gate("chat.mark_read"), Some(Gate::Local));
        assert_eq!(registry.gate("chat.read_history"), Some(Gate::Master));
        assert_eq!(registry.gate("ui.open_chat"), Some(Gate::Local));
        assert_eq!(registry.gate("sync.apply_update"), Some(Gate::Local));
        assert_eq!(registry.specs().count(), 11);
    }
}
