use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::ids::{ConfigVersionId, RunId};

/// Scheduler-visible run states. Queued/Running map directly to queue presence.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "queued" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "succeeded" => Some(RunStatus::Succeeded),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Priority bands. Lower value wins when claiming queued work.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum RunPriority {
    P0 = 0,
    P1 = 1,
    P2 = 2,
    P3 = 3,
}

impl RunPriority {
    pub fn as_i16(&self) -> i16 {
        *self as i16
    }

    pub fn parse(value: i16) -> Option<Self> {
        match value {
            0 => Some(RunPriority::P0),
            1 => Some(RunPriority::P1),
            2 => Some(RunPriority::P2),
            3 => Some(RunPriority::P3),
            _ => None,
        }
    }
}

/// Fixed vocabulary of terminal error codes. Callers branch on these rather
/// than parsing `error_message`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    LeaseExpired,
    EnvironmentBuildFailed,
    NetworkPolicyViolation,
    ExecutionFailed,
    TransientExhausted,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::LeaseExpired => "lease_expired",
            ErrorCode::EnvironmentBuildFailed => "environment_build_failed",
            ErrorCode::NetworkPolicyViolation => "network_policy_violation",
            ErrorCode::ExecutionFailed => "execution_failed",
            ErrorCode::TransientExhausted => "transient_exhausted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "lease_expired" => Some(ErrorCode::LeaseExpired),
            "environment_build_failed" => Some(ErrorCode::EnvironmentBuildFailed),
            "network_policy_violation" => Some(ErrorCode::NetworkPolicyViolation),
            "execution_failed" => Some(ErrorCode::ExecutionFailed),
            "transient_exhausted" => Some(ErrorCode::TransientExhausted),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Pipeline stages at which user hooks may be registered.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookStage {
    /// Runs once per configuration-version activation; gating.
    Activation,
    /// Runs per run before the transformation; sees source-side state.
    PreExecution,
    /// Runs per run after the transformation; sees output-side state.
    PostExecution,
}

impl HookStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookStage::Activation => "activation",
            HookStage::PreExecution => "pre_execution",
            HookStage::PostExecution => "post_execution",
        }
    }
}

impl fmt::Display for HookStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Small structured value returned by a hook, tagged with its origin.
///
/// Annotations are the only channel through which hooks affect a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Annotation {
    pub stage: HookStage,
    pub hook_name: String,
    pub recorded_at: DateTime<Utc>,
    pub value: Value,
}

impl Annotation {
    pub fn new(stage: HookStage, hook_name: impl Into<String>, value: Value) -> Self {
        Self {
            stage,
            hook_name: hook_name.into(),
            recorded_at: Utc::now(),
            value,
        }
    }
}

/// One attempt-tracked request to process one document with one
/// configuration version. Rows are never deleted, only superseded by a new
/// linked attempt via `parent_run`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub config_version: ConfigVersionId,
    pub input_ref: String,
    pub status: RunStatus,
    /// 1-based; monotonically increasing across linked retries.
    pub attempt: u16,
    pub max_attempts: u16,
    pub priority: RunPriority,
    /// Also the earliest claimable instant; retries push this into the future.
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub output_ref: Option<String>,
    /// Set when this row was created by a retry of a prior attempt.
    pub parent_run: Option<RunId>,
    pub annotations: Vec<Annotation>,
}

impl RunRecord {
    pub fn new(
        config_version: ConfigVersionId,
        input_ref: impl Into<String>,
        priority: RunPriority,
        max_attempts: u16,
    ) -> Self {
        Self {
            id: RunId::new(),
            config_version,
            input_ref: input_ref.into(),
            status: RunStatus::Queued,
            attempt: 1,
            max_attempts: max_attempts.max(1),
            priority,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_code: None,
            error_message: None,
            output_ref: None,
            parent_run: None,
            annotations: Vec::new(),
        }
    }

    /// Build the follow-up attempt row for this run, queued at `queued_at`.
    pub fn next_attempt(&self, queued_at: DateTime<Utc>) -> Self {
        Self {
            id: RunId::new(),
            config_version: self.config_version,
            input_ref: self.input_ref.clone(),
            status: RunStatus::Queued,
            attempt: self.attempt.saturating_add(1),
            max_attempts: self.max_attempts,
            priority: self.priority,
            queued_at,
            started_at: None,
            completed_at: None,
            error_code: None,
            error_message: None,
            output_ref: None,
            parent_run: Some(self.id),
            annotations: Vec::new(),
        }
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_attempt_links_parent_and_increments() {
        let run = RunRecord::new(ConfigVersionId::new(), "doc-1", RunPriority::P1, 3);
        let child = run.next_attempt(Utc::now());
        assert_eq!(child.attempt, 2);
        assert_eq!(child.parent_run, Some(run.id));
        assert_eq!(child.input_ref, run.input_ref);
        assert_eq!(child.status, RunStatus::Queued);
        assert!(child.error_code.is_none());
    }

    #[test]
    fn error_code_round_trips_through_str() {
        for code in [
            ErrorCode::LeaseExpired,
            ErrorCode::EnvironmentBuildFailed,
            ErrorCode::NetworkPolicyViolation,
            ErrorCode::ExecutionFailed,
            ErrorCode::TransientExhausted,
        ] {
            assert_eq!(ErrorCode::parse(code.as_str()), Some(code));
        }
    }
}
