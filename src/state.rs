use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{MeshError, Result};
use crate::model::{ConnectionState, Notification};
use crate::router::PendingSlot;
use crate::tab_id::TabId;

// ---------------------------------------------------------------------------
// Shared (replicated) state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Chat {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

/// Canonical application state, written by the master and replicated to
/// every tab. Replication works on top-level fields, so every field here is
/// one unit of delta.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SharedState {
    #[serde(default)]
    pub connection_state: ConnectionState,
    #[serde(default)]
    pub current_user_id: Option<String>,
    #[serde(default)]
    pub chats: BTreeMap<String, Chat>,
    #[serde(default)]
    pub users: BTreeMap<String, User>,
    /// Messages keyed by chat id, oldest first.
    #[serde(default)]
    pub messages: BTreeMap<String, Vec<Message>>,
    #[serde(default)]
    pub active_call_id: Option<String>,
}

impl SharedState {
    fn to_fields(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(MeshError::CorruptRecord(
                "shared_state".into(),
                format!("expected object, got {other}"),
            )),
        }
    }

    /// Every top-level field; publishing these is equivalent to a snapshot.
    pub fn fields(&self) -> Result<BTreeMap<String, Value>> {
        Ok(self.to_fields()?.into_iter().collect())
    }

    /// Top-level fields whose value differs in `newer`, carrying the newer value.
    pub fn diff(&self, newer: &SharedState) -> Result<BTreeMap<String, Value>> {
        let old = self.to_fields()?;
        let new = newer.to_fields()?;
        let mut changed = BTreeMap::new();
        for (key, value) in new {
            if old.get(&key) != Some(&value) {
                changed.insert(key, value);
            }
        }
        Ok(changed)
    }

    /// Overwrite the named top-level fields. Unknown keys are rejected so a
    /// newer writer cannot silently lose data on an older reader.
    pub fn apply_fields(&mut self, fields: &BTreeMap<String, Value>) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut current = self.to_fields()?;
        for (key, value) in fields {
            if !current.contains_key(key) {
                return Err(MeshError::CorruptRecord(
                    "state_delta".into(),
                    format!("unknown shared field '{key}'"),
                ));
            }
            current.insert(key.clone(), value.clone());
        }
        *self = serde_json::from_value(Value::Object(current))?;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.connection_state == ConnectionState::Ready
    }
}

// ---------------------------------------------------------------------------
// Per-tab state
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Screen {
    #[default]
    ChatList,
    Chat,
    Call,
    Settings,
}

/// UI state private to one tab. Never replicated.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TabState {
    pub screen: Screen,
    pub open_chat_id: Option<String>,
    pub search_query: String,
    pub selected_message_ids: Vec<String>,
    pub modal: Option<String>,
    pub notifications: Vec<Notification>,
    /// Deferred master-gated action this tab will run once its connection is ready.
    pub multitab_next_action: PendingSlot,
}

/// Everything a handler sees: the replicated slice plus this tab's slice.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalState {
    pub shared: SharedState,
    pub tab: TabState,
}

// ---------------------------------------------------------------------------
// Replication records
// ---------------------------------------------------------------------------

/// Changed shared fields from one master commit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateDelta {
    pub seq: u64,
    pub origin: TabId,
    pub fields: BTreeMap<String, Value>,
}

/// Full shared state as of `seq`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateSnapshot {
    pub seq: u64,
    pub origin: TabId,
    pub state: SharedState,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(id: &str) -> Chat {
        Chat {
            id: id.into(),
            title: format!("chat {id}"),
            unread_count: 0,
            last_message_id: None,
        }
    }

    #[test]
    fn diff_reports_only_changed_fields() {
        let old = SharedState::default();
        let mut new = old.clone();
        new.active_call_id = Some("call-1".into());
        new.chats.insert("c1".into(), chat("c1"));

        let delta = old.diff(&new).unwrap();
        let keys: Vec<&str> = delta.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["active_call_id", "chats"]);
    }

    #[test]
    fn diff_of_equal_states_is_empty() {
        let state = SharedState::default();
        assert!(state.diff(&state.clone()).unwrap().is_empty());
    }

    #[test]
    fn apply_fields_reproduces_newer_state() {
        let old = SharedState::default();
        let mut new = old.clone();
        new.connection_state = ConnectionState::Ready;
        new.users.insert(
            "u1".into(),
            User {
                id: "u1".into(),
                name: "Ada".into(),
            },
        );

        let delta = old.diff(&new).unwrap();
        let mut replica = old.clone();
        replica.apply_fields(&delta).unwrap();
        assert_eq!(replica, new);
    }

    #[test]
    fn apply_fields_rejects_unknown_field() {
        let mut state = SharedState::default();
        let mut fields = BTreeMap::new();
        fields.insert("not_a_field".to_string(), Value::Bool(true));
        let err = state.apply_fields(&fields).unwrap_err();
        assert!(matches!(err, MeshError::CorruptRecord(_, _)));
        assert_eq!(state, SharedState::default());
    }

    #[test]
    fn tab_state_defaults_to_chat_list_with_empty_slot() {
        let tab = TabState::default();
        assert_eq!(tab.screen, Screen::ChatList);
        assert!(tab.multitab_next_action.is_empty());
    }
}
