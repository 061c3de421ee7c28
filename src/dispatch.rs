use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{MeshError, Result};
use crate::model::Gate;
use crate::protocol::ProtocolClient;
use crate::resources::{ExclusiveResources, Resource};
use crate::state::GlobalState;
use crate::tab_id::TabId;

/// A reducer: reads the committed state and returns a replacement, or `None`
/// to leave it untouched.
pub type Handler = dyn Fn(&mut HandlerContext<'_>, &GlobalState, Value) -> Result<Option<GlobalState>>;

#[derive(Clone)]
pub struct ActionSpec {
    pub name: String,
    pub gate: Gate,
    handler: Rc<Handler>,
}

impl ActionSpec {
    pub(crate) fn handler(&self) -> Rc<Handler> {
        Rc::clone(&self.handler)
    }
}

impl std::fmt::Debug for ActionSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionSpec")
            .field("name", &self.name)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

/// Named actions and the gate each one declared at registration.
#[derive(Debug, Default, Clone)]
pub struct ActionRegistry {
    actions: BTreeMap<String, ActionSpec>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_action_handler<F>(&mut self, name: &str, gate: Gate, handler: F) -> Result<()>
    where
        F: Fn(&mut HandlerContext<'_>, &GlobalState, Value) -> Result<Option<GlobalState>> + 'static,
    {
        if self.actions.contains_key(name) {
            return Err(MeshError::DuplicateAction(name.to_string()));
        }
        self.actions.insert(
            name.to_string(),
            ActionSpec {
                name: name.to_string(),
                gate,
                handler: Rc::new(handler),
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ActionSpec> {
        self.actions.get(name)
    }

    pub fn gate(&self, name: &str) -> Option<Gate> {
        self.actions.get(name).map(|spec| spec.gate)
    }

    pub fn specs(&self) -> impl Iterator<Item = &ActionSpec> {
        self.actions.values()
    }
}

/// Follow-up dispatches requested by a handler, run after it in order.
#[derive(Debug, Default)]
pub struct Actions {
    queue: VecDeque<(String, Value)>,
}

impl Actions {
    pub fn dispatch(&mut self, name: &str, payload: Value) {
        self.queue.push_back((name.to_string(), payload));
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = (String, Value)> + '_ {
        self.queue.drain(..)
    }
}

/// Everything a handler may touch besides the state it was given.
pub struct HandlerContext<'a> {
    pub actions: &'a mut Actions,
    client: Option<&'a mut dyn ProtocolClient>,
    resources: &'a mut ExclusiveResources,
    tab_id: &'a TabId,
    action: &'a str,
    now: DateTime<Utc>,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(
        action: &'a str,
        tab_id: &'a TabId,
        now: DateTime<Utc>,
        actions: &'a mut Actions,
        client: Option<&'a mut dyn ProtocolClient>,
        resources: &'a mut ExclusiveResources,
    ) -> Self {
        Self {
            actions,
            client,
            resources,
            tab_id,
            action,
            now,
        }
    }

    pub fn tab_id(&self) -> &TabId {
        self.tab_id
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// True when a protocol client is attached, i.e. this tab is master.
    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    /// Call the backend. Fails with `NotMaster` on tabs without a client.
    pub fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        match self.client.as_mut() {
            Some(client) => client.call(method, params),
            None => Err(MeshError::NotMaster(self.action.to_string())),
        }
    }

    pub fn disconnect(&mut self) {
        if let Some(client) = self.client.as_mut() {
            client.disconnect();
        }
    }

    pub fn acquire(&mut self, resource: Resource) -> Result<()> {
        self.resources.acquire(resource)
    }

    pub fn release(&mut self, resource: Resource) {
        self.resources.release(resource);
    }

    pub fn dispatch(&mut self, name: &str, payload: Value) {
        self.actions.dispatch(name, payload);
    }

    /// Decode a payload, naming the action in the error.
    pub fn payload<T: serde::de::DeserializeOwned>(&self, payload: Value) -> Result<T> {
        serde_json::from_value(payload).map_err(|err| MeshError::payload(self.action, err.to_string()))
    }
}
