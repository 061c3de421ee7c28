use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::tab_id::TabId;

/// A tab's presence record in the shared registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TabDescriptor {
    pub id: TabId,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub is_master: bool,
    #[serde(default)]
    pub is_closing: bool,
}

impl TabDescriptor {
    pub fn new(id: TabId, now: DateTime<Utc>) -> Self {
        Self {
            id,
            started_at: now,
            last_heartbeat_at: now,
            is_master: false,
            is_closing: false,
        }
    }

    /// Milliseconds since the last heartbeat, clamped at zero for clock skew.
    pub fn silence_ms(&self, now: DateTime<Utc>) -> i64 {
        (now - self.last_heartbeat_at).num_milliseconds().max(0)
    }

    pub fn is_alive(&self, now: DateTime<Utc>, liveness_timeout_ms: u64) -> bool {
        !self.is_closing && self.silence_ms(now) <= liveness_timeout_ms as i64
    }
}

/// Backend connection state, owned by the master and replicated read-only.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Connecting,
    Ready,
    Broken,
    LoggingOut,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Ready => write!(f, "ready"),
            Self::Broken => write!(f, "broken"),
            Self::LoggingOut => write!(f, "logging_out"),
        }
    }
}

/// Election role of a tab.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    #[default]
    Follower,
    CandidateForMaster,
    Master,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Follower => write!(f, "follower"),
            Self::CandidateForMaster => write!(f, "candidate"),
            Self::Master => write!(f, "master"),
        }
    }
}

/// Whether an action may run on any tab or only on a ready master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    Local,
    Master,
}

/// A master-gated action waiting for a ready master.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingMasterAction {
    pub action_name: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub requested_at: DateTime<Utc>,
    pub requesting_tab_id: TabId,
}

impl PendingMasterAction {
    pub fn new(
        action_name: &str,
        payload: serde_json::Value,
        requesting_tab_id: TabId,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            action_name: action_name.to_string(),
            payload,
            requested_at: now,
            requesting_tab_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Error,
    Info,
}

/// A user-visible notice kept in the owning tab's state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: String,
    pub kind: NotificationKind,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn error(message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: NotificationKind::Error,
            message: message.into(),
            created_at: now,
        }
    }

    pub fn info(message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            kind: NotificationKind::Info,
            ..Self::error(message, now)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn id(s: &str) -> TabId {
        s.parse().unwrap()
    }

    #[test]
    fn descriptor_round_trips_json() {
        let now = Utc::now();
        let desc = TabDescriptor::new(id("00000000000000a1"), now);
        let json = serde_json::to_string_pretty(&desc).unwrap();
        let parsed: TabDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(desc, parsed);
    }

    #[test]
    fn descriptor_liveness_respects_timeout_and_closing() {
        let now = Utc::now();
        let mut desc = TabDescriptor::new(id("00000000000000a1"), now - Duration::milliseconds(2500));
        assert!(desc.is_alive(now, 3000));
        assert!(!desc.is_alive(now, 2000));
        desc.last_heartbeat_at = now;
        desc.is_closing = true;
        assert!(!desc.is_alive(now, 3000));
    }

    #[test]
    fn connection_state_serializes_snake_case() {
        let json = serde_json::to_string(&ConnectionState::LoggingOut).unwrap();
        assert_eq!(json, r#""logging_out""#);
        assert_eq!(ConnectionState::default(), ConnectionState::Connecting);
    }

    #[test]
    fn pending_action_defaults_missing_payload_to_null() {
        let json = r#"{"action_name":"call.join","requested_at":"2026-01-01T00:00:00Z","requesting_tab_id":"00000000000000a1"}"#;
        let pending: PendingMasterAction = serde_json::from_str(json).unwrap();
        assert_eq!(pending.payload, serde_json::Value::Null);
    }
}
