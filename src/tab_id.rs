use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

/// Tab identifier: 16 lowercase hex characters.
///
/// The first 11 digits encode the creation time in milliseconds, the last 5
/// are random. String order is therefore creation order with a random
/// tie-break, which gives election a total order over live tabs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TabId(String);

impl TabId {
    pub const HEX_LEN: usize = 16;
    const TIME_DIGITS: usize = 11;
    const TIME_MASK: u64 = (1 << 44) - 1;
    const RANDOM_MASK: u32 = (1 << 20) - 1;

    /// Generate a fresh tab id from the wall clock and OS-backed entropy.
    pub fn generate() -> Result<Self, TabIdGenerationError> {
        Self::generate_at(Utc::now(), |bytes| {
            getrandom::fill(bytes).map_err(TabIdGenerationError::random_source)
        })
    }

    /// Test hook: inject the clock and random bytes.
    pub(crate) fn generate_at<F>(
        now: DateTime<Utc>,
        mut fill_random: F,
    ) -> Result<Self, TabIdGenerationError>
    where
        F: FnMut(&mut [u8]) -> Result<(), TabIdGenerationError>,
    {
        let mut bytes = [0_u8; std::mem::size_of::<u32>()];
        fill_random(&mut bytes)?;
        let random = u32::from_be_bytes(bytes) & Self::RANDOM_MASK;
        let millis = (now.timestamp_millis().max(0) as u64) & Self::TIME_MASK;
        Ok(Self(format!(
            "{millis:0width$x}{random:05x}",
            width = Self::TIME_DIGITS
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form for logs and pretty output.
    pub fn short(&self) -> &str {
        &self.0[Self::TIME_DIGITS - 3..]
    }

    fn validate_and_normalize(value: &str) -> Result<String, TabIdParseError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(TabIdParseError::Empty);
        }
        if trimmed.len() != Self::HEX_LEN {
            return Err(TabIdParseError::InvalidLength(trimmed.len()));
        }
        if !trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(TabIdParseError::InvalidCharacter);
        }
        Ok(trimmed.to_ascii_lowercase())
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TabId {
    type Err = TabIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Self::validate_and_normalize(s)?))
    }
}

impl AsRef<str> for TabId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl From<TabId> for String {
    fn from(value: TabId) -> Self {
        value.0
    }
}

impl TryFrom<String> for TabId {
    type Error = TabIdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl ToSql for TabId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for TabId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Text(bytes) => {
                let text = std::str::from_utf8(bytes).map_err(FromSqlError::other)?;
                text.parse().map_err(FromSqlError::other)
            }
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TabIdGenerationError {
    RandomSource(String),
}

impl TabIdGenerationError {
    fn random_source(error: impl fmt::Display) -> Self {
        Self::RandomSource(error.to_string())
    }
}

impl fmt::Display for TabIdGenerationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RandomSource(message) => write!(f, "tab id generation failed: {message}"),
        }
    }
}

impl std::error::Error for TabIdGenerationError {}

impl From<TabIdGenerationError> for crate::error::MeshError {
    fn from(value: TabIdGenerationError) -> Self {
        match value {
            TabIdGenerationError::RandomSource(message) => Self::RandomSource(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TabIdParseError {
    Empty,
    InvalidLength(usize),
    InvalidCharacter,
}

impl fmt::Display for TabIdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "tab id cannot be empty"),
            Self::InvalidLength(actual) => write!(
                f,
                "tab id must be exactly {} hex characters (got {})",
                TabId::HEX_LEN,
                actual
            ),
            Self::InvalidCharacter => {
                write!(f, "tab id must contain only ASCII hex characters (0-9, a-f)")
            }
        }
    }
}

impl std::error::Error for TabIdParseError {}

impl From<TabIdParseError> for crate::error::MeshError {
    fn from(value: TabIdParseError) -> Self {
        Self::InvalidTabId(value.to_string())
    }
}
