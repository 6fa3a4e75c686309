//! Durable run state. The engine coordinates ownership exclusively through
//! the atomic conditional updates this trait exposes; there are no
//! cross-process in-memory locks over run rows.

use async_trait::async_trait;
use tabula_model::{Annotation, ErrorCode, LeaseId, RunEvent, RunId, RunRecord, RunStatus};

use crate::error::Result;
use crate::lease::{ClaimedRun, Lease};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use memory::InMemoryRunStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresRunStore;

/// Terminal state reported for a leased run. Writing it releases the lease in
/// the same conditional update.
#[derive(Clone, Debug)]
pub struct TerminalOutcome {
    pub status: RunStatus,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub output_ref: Option<String>,
}

impl TerminalOutcome {
    pub fn succeeded(output_ref: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Succeeded,
            error_code: None,
            error_message: None,
            output_ref: Some(output_ref.into()),
        }
    }

    pub fn failed(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            error_code: Some(code),
            error_message: Some(message.into()),
            output_ref: None,
        }
    }
}

/// Abstracts the run store backend consumed by the lease manager, worker
/// pool, and admission front door.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn insert_run(&self, run: &RunRecord) -> Result<()>;

    async fn run(&self, id: RunId) -> Result<Option<RunRecord>>;

    /// Atomically claim the highest-priority queued run whose `queued_at` has
    /// passed: flip it to `running` and stamp a fresh lease in one update.
    /// Concurrent callers observe at most one winner per run.
    async fn claim_next(&self, owner: &str, ttl: chrono::Duration) -> Result<Option<ClaimedRun>>;

    /// Extend the lease iff it is still owned by `lease.owner` and has not
    /// expired. Returns the renewed lease, or `LeaseExpired` when ownership
    /// has lapsed; the caller must stop work on the run.
    async fn renew_lease(&self, lease: &Lease, ttl: chrono::Duration) -> Result<Lease>;

    /// Write a terminal state and release the lease, conditional on the lease
    /// still being live and owned. `LeaseExpired` means the result must be
    /// discarded: another worker may already own a successor attempt.
    async fn finish_run(&self, lease: &Lease, outcome: &TerminalOutcome) -> Result<()>;

    /// Runs still marked `running` whose lease expiry has passed.
    async fn expired_leases(&self) -> Result<Vec<ClaimedRun>>;

    /// Terminally fail an expired leased run. Returns `false` when the row
    /// was already reclaimed or completed by someone else (lost race).
    async fn fail_expired(
        &self,
        run_id: RunId,
        lease_id: LeaseId,
        code: ErrorCode,
        message: &str,
    ) -> Result<bool>;

    /// Number of currently queued runs, exposed to the admission front door
    /// for backpressure decisions.
    async fn queue_depth(&self) -> Result<usize>;

    /// Whether any transitive successor attempt of `run_id` is still queued
    /// or running. Used to reject duplicate manual retries.
    async fn has_active_descendant(&self, run_id: RunId) -> Result<bool>;

    async fn append_annotations(&self, run_id: RunId, annotations: &[Annotation]) -> Result<()>;

    async fn append_event(&self, event: &RunEvent) -> Result<()>;

    async fn events_for(&self, run_id: RunId) -> Result<Vec<RunEvent>>;
}
