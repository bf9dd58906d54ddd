use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub email: String,
    pub display_name: String,
}

/// Lifecycle of an internal call: `new -> up -> ended`, with a terminal
/// `failed` branch reachable only from `new`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    New,
    Up,
    Ended,
    Failed,
}

impl CallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CallStatus::New => "new",
            CallStatus::Up => "up",
            CallStatus::Ended => "ended",
            CallStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CallStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(CallStatus::New),
            "up" => Ok(CallStatus::Up),
            "ended" => Ok(CallStatus::Ended),
            "failed" => Ok(CallStatus::Failed),
            other => Err(format!("unknown call status: {other}")),
        }
    }
}

/// One logical internal call: a `calls` row. `status` is stored as plain
/// text in Postgres (see migrations); parse it with [`CallStatus::from_str`]
/// when the typed value is needed.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Call {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub caller_exten: Option<String>,
    pub callee_exten: Option<String>,
    pub caller_channel_id: Option<String>,
    pub callee_channel_id: Option<String>,
    pub bridge_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub hangup_cause: Option<i32>,
    pub hangup_reason: Option<String>,
    pub direction: String,
    pub status: String,
}

/// Append-only audit row for every event the worker receives, whether or
/// not it could be mapped to a `Call` yet.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct CallEvent {
    pub id: i64,
    pub call_id: Option<Uuid>,
    pub ts: Option<DateTime<Utc>>,
    #[sqlx(rename = "type")]
    pub event_type: Option<String>,
    pub channel_id: Option<String>,
    pub bridge_id: Option<String>,
    pub raw: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
