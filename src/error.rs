use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("action '{0}' is already registered")]
    DuplicateAction(String),

    #[error("action '{action}' failed: {reason}")]
    HandlerFailed { action: String, reason: String },

    #[error("action '{0}' requires a confirmed master tab")]
    NotMaster(String),

    #[error("connection is not ready (state: {0})")]
    NotReady(String),

    #[error("invalid tab id: {0}")]
    InvalidTabId(String),

    #[error("tab random source unavailable: {0}")]
    RandomSource(String),

    #[error("shared channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("replication gap: expected seq {expected}, oldest available {oldest}")]
    ReplicationGap { expected: u64, oldest: u64 },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("invalid payload for '{action}': {reason}")]
    InvalidPayload { action: String, reason: String },

    #[error("corrupt channel record '{0}': {1}")]
    CorruptRecord(String, String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
}

impl MeshError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnknownAction(_) => "unknown_action",
            Self::DuplicateAction(_) => "duplicate_action",
            Self::HandlerFailed { .. } => "handler_failed",
            Self::NotMaster(_) => "not_master",
            Self::NotReady(_) => "not_ready",
            Self::InvalidTabId(_) => "invalid_tab_id",
            Self::RandomSource(_) => "random_source",
            Self::ChannelUnavailable(_) => "channel_unavailable",
            Self::ReplicationGap { .. } => "replication_gap",
            Self::Protocol(_) => "protocol_error",
            Self::InvalidConfig(_) => "invalid_config",
            Self::InvalidPayload { .. } => "invalid_payload",
            Self::CorruptRecord(_, _) => "corrupt_record",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
            Self::Yaml(_) => "yaml_error",
            Self::Db(_) => "db_error",
        }
    }

    /// Shorthand used by handlers rejecting a malformed payload.
    pub fn payload(action: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            action: action.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;
