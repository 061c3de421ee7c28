use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{MeshError, Result};
use crate::model::ConnectionState;
use crate::state::{Chat, Message, User};

/// A push from the backend, fed through `sync.apply_update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Update {
    ConnectionState { state: ConnectionState },
    CurrentUser { user_id: String },
    NewMessage { message: Message },
    ChatUpdated { chat: Chat },
    UserUpdated { user: User },
    CallEnded { call_id: String },
}

/// The backend session. Only the master tab ever holds a connected client.
pub trait ProtocolClient {
    fn connect(&mut self) -> Result<()>;
    fn disconnect(&mut self);
    fn is_connected(&self) -> bool;
    fn call(&mut self, method: &str, params: Value) -> Result<Value>;
    /// Drain updates received since the last poll.
    fn poll_updates(&mut self) -> Vec<Update>;
}

#[derive(Debug, Default)]
struct LoopbackState {
    connected: bool,
    connects: u32,
    refuse_connects: u32,
    hold_ready: bool,
    failing_methods: BTreeSet<String>,
    calls: Vec<(String, Value)>,
    updates: VecDeque<Update>,
    next_id: u64,
}

/// In-process backend that answers the methods the built-in actions use.
/// Tests and the CLI drive it through a [`LoopbackHandle`].
#[derive(Debug, Clone, Default)]
pub struct LoopbackClient {
    state: Arc<Mutex<LoopbackState>>,
}

/// Remote control for a [`LoopbackClient`].
#[derive(Debug, Clone)]
pub struct LoopbackHandle {
    state: Arc<Mutex<LoopbackState>>,
}

fn guard(state: &Mutex<LoopbackState>) -> MutexGuard<'_, LoopbackState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl LoopbackClient {
    pub fn new() -> (Self, LoopbackHandle) {
        let client = Self::default();
        let handle = LoopbackHandle {
            state: Arc::clone(&client.state),
        };
        (client, handle)
    }
}

impl ProtocolClient for LoopbackClient {
    fn connect(&mut self) -> Result<()> {
        let mut state = guard(&self.state);
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(MeshError::Protocol("connection refused".into()));
        }
        state.connected = true;
        state.connects += 1;
        state.updates.push_back(Update::ConnectionState {
            state: ConnectionState::Connecting,
        });
        if !state.hold_ready {
            state.updates.push_back(Update::ConnectionState {
                state: ConnectionState::Ready,
            });
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        let mut state = guard(&self.state);
        state.connected = false;
        state.updates.clear();
    }

    fn is_connected(&self) -> bool {
        guard(&self.state).connected
    }

    fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        let mut state = guard(&self.state);
        if !state.connected {
            return Err(MeshError::Protocol(format!("{method}: not connected")));
        }
        if state.failing_methods.contains(method) {
            return Err(MeshError::Protocol(format!("{method}: rejected by server")));
        }
        state.calls.push((method.to_string(), params.clone()));
        state.next_id += 1;
        let n = state.next_id;

        match method {
            "phone.requestCall" => Ok(json!({ "call_id": format!("call-{n}") })),
            "phone.discardCall" | "messages.readHistory" | "auth.logOut" => Ok(json!({})),
            "messages.sendMessage" => Ok(json!({ "message_id": format!("msg-{n}") })),
            other => Err(MeshError::Protocol(format!("unknown method '{other}'"))),
        }
    }

    fn poll_updates(&mut self) -> Vec<Update> {
        guard(&self.state).updates.drain(..).collect()
    }
}

impl LoopbackHandle {
    /// Queue a server push for the next poll.
    pub fn push(&self, update: Update) {
        guard(&self.state).updates.push_back(update);
    }

    /// Keep the session in `connecting` after connect until [`Self::release_ready`].
    pub fn hold_ready(&self) {
        guard(&self.state).hold_ready = true;
    }

    pub fn release_ready(&self) {
        let mut state = guard(&self.state);
        state.hold_ready = false;
        if state.connected {
            state.updates.push_back(Update::ConnectionState {
                state: ConnectionState::Ready,
            });
        }
    }

    /// Fail the next `n` connect attempts.
    pub fn refuse_connects(&self, n: u32) {
        guard(&self.state).refuse_connects = n;
    }

    pub fn fail_method(&self, method: &str) {
        guard(&self.state).failing_methods.insert(method.to_string());
    }

    pub fn is_connected(&self) -> bool {
        guard(&self.state).connected
    }

    pub fn connect_count(&self) -> u32 {
        guard(&self.state).connects
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        guard(&self.state).calls.clone()
    }

    pub fn call_count(&self, method: &str) -> usize {
        guard(&self.state)
            .calls
            .iter()
            .filter(|(m, _)| m == method)
            .count()
    }
}
