use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;

use crate::ids::RunId;
use crate::run::{ErrorCode, RunStatus};

/// Event kinds required by the audit contract. Every run accumulates an
/// append-only stream of these.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    Enqueue,
    Start,
    Renew,
    Exit,
    Retry,
    Error,
}

impl RunEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunEventKind::Enqueue => "enqueue",
            RunEventKind::Start => "start",
            RunEventKind::Renew => "renew",
            RunEventKind::Exit => "exit",
            RunEventKind::Retry => "retry",
            RunEventKind::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "enqueue" => Some(RunEventKind::Enqueue),
            "start" => Some(RunEventKind::Start),
            "renew" => Some(RunEventKind::Renew),
            "exit" => Some(RunEventKind::Exit),
            "retry" => Some(RunEventKind::Retry),
            "error" => Some(RunEventKind::Error),
            _ => None,
        }
    }
}

impl fmt::Display for RunEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry in a run's structured event stream. The transport/encoding is
/// left to collaborators; this is the canonical in-process shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunEvent {
    pub run_id: RunId,
    pub attempt: u16,
    pub kind: RunEventKind,
    pub recorded_at: DateTime<Utc>,
    /// Wall-clock duration of the phase that ended with this event, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub detail: Value,
}

impl RunEvent {
    pub fn new(run_id: RunId, attempt: u16, kind: RunEventKind, detail: Value) -> Self {
        Self {
            run_id,
            attempt,
            kind,
            recorded_at: Utc::now(),
            duration_ms: None,
            detail,
        }
    }

    pub fn enqueue(run_id: RunId, attempt: u16) -> Self {
        Self::new(run_id, attempt, RunEventKind::Enqueue, Value::Null)
    }

    pub fn start(run_id: RunId, attempt: u16, owner: &str) -> Self {
        Self::new(run_id, attempt, RunEventKind::Start, json!({ "owner": owner }))
    }

    pub fn renew(run_id: RunId, attempt: u16, renewals: u32) -> Self {
        Self::new(
            run_id,
            attempt,
            RunEventKind::Renew,
            json!({ "renewals": renewals }),
        )
    }

    pub fn exit(run_id: RunId, attempt: u16, status: RunStatus, duration_ms: u64) -> Self {
        let mut event = Self::new(
            run_id,
            attempt,
            RunEventKind::Exit,
            json!({ "status": status.as_str() }),
        );
        event.duration_ms = Some(duration_ms);
        event
    }

    pub fn retry(parent: RunId, attempt: u16, child: RunId, delay_ms: u64) -> Self {
        Self::new(
            parent,
            attempt,
            RunEventKind::Retry,
            json!({ "child_run_id": child.to_string(), "delay_ms": delay_ms }),
        )
    }

    pub fn error(run_id: RunId, attempt: u16, code: ErrorCode, message: &str) -> Self {
        Self::new(
            run_id,
            attempt,
            RunEventKind::Error,
            json!({ "error_code": code.as_str(), "message": message }),
        )
    }
}
