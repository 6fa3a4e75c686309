//! Admission front door: run submission with backpressure, manual retry,
//! and the status surface callers poll.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tabula_model::{ConfigVersionId, RunEvent, RunId, RunPriority, RunRecord};
use tracing::{info, warn};

use crate::activation::Activator;
use crate::config::{AdmissionConfig, RetryConfig};
use crate::error::{EngineError, Result};
use crate::events::EventSink;
use crate::store::RunStore;

#[derive(Clone, Debug)]
pub struct SubmitRequest {
    pub config_version: ConfigVersionId,
    pub input_ref: String,
    pub priority: RunPriority,
    /// Attempt budget override; the engine default applies when absent.
    pub max_attempts: Option<u16>,
}

impl SubmitRequest {
    pub fn new(config_version: ConfigVersionId, input_ref: impl Into<String>) -> Self {
        Self {
            config_version,
            input_ref: input_ref.into(),
            priority: RunPriority::P2,
            max_attempts: None,
        }
    }

    pub fn with_priority(mut self, priority: RunPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u16) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// Result of a submission attempt. `Saturated` is backpressure, not an
/// error: the caller should retry later, and nothing was enqueued.
#[derive(Clone, Debug)]
pub enum AdmissionOutcome {
    Accepted { run: RunRecord },
    Saturated { depth: usize, capacity: usize },
}

/// A run together with its full event stream, as returned by the status
/// surface.
#[derive(Clone, Debug)]
pub struct RunStatusView {
    pub run: RunRecord,
    pub events: Vec<RunEvent>,
}

pub struct AdmissionQueue<S> {
    store: Arc<S>,
    activator: Arc<Activator>,
    events: EventSink<S>,
    retry_cfg: RetryConfig,
    admission_cfg: AdmissionConfig,
}

impl<S> fmt::Debug for AdmissionQueue<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionQueue")
            .field("retry_cfg", &self.retry_cfg)
            .field("admission_cfg", &self.admission_cfg)
            .finish()
    }
}

impl<S: RunStore> AdmissionQueue<S> {
    pub fn new(
        store: Arc<S>,
        activator: Arc<Activator>,
        events: EventSink<S>,
        retry_cfg: RetryConfig,
        admission_cfg: AdmissionConfig,
    ) -> Self {
        Self {
            store,
            activator,
            events,
            retry_cfg,
            admission_cfg,
        }
    }

    /// Submit a run against an activated configuration version.
    ///
    /// Submission against a version that was never activated is an error;
    /// a saturated queue is reported as `Saturated` and enqueues nothing.
    pub async fn submit(&self, request: SubmitRequest) -> Result<AdmissionOutcome> {
        if !self.activator.is_active(request.config_version) {
            return Err(EngineError::NotActivated(request.config_version));
        }

        let depth = self.store.queue_depth().await?;
        let capacity = self.admission_cfg.max_queue_depth;
        if depth >= capacity {
            warn!(
                target: "engine::admission",
                depth,
                capacity,
                "submission rejected, queue saturated"
            );
            return Ok(AdmissionOutcome::Saturated { depth, capacity });
        }

        let run = RunRecord::new(
            request.config_version,
            request.input_ref,
            request.priority,
            request.max_attempts.unwrap_or(self.retry_cfg.max_attempts),
        );
        self.store.insert_run(&run).await?;
        info!(
            target: "engine::admission",
            run = %run.id,
            config_version = %run.config_version,
            priority = ?run.priority,
            "run admitted"
        );
        self.events
            .publish(RunEvent::enqueue(run.id, run.attempt))
            .await;
        Ok(AdmissionOutcome::Accepted { run })
    }

    /// Manually retry a terminal run: queue a new linked attempt immediately,
    /// with no backoff delay. Operator-driven, so it may run past the
    /// original attempt budget.
    ///
    /// Rejected when the run is not terminal, or when a descendant attempt is
    /// already queued or running.
    pub async fn retry(&self, run_id: RunId) -> Result<RunRecord> {
        let run = self
            .store
            .run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        if !run.status.is_terminal() {
            return Err(EngineError::RetryRejected {
                run_id,
                reason: format!("run is still {}", run.status),
            });
        }
        if self.store.has_active_descendant(run_id).await? {
            return Err(EngineError::RetryRejected {
                run_id,
                reason: "a follow-up attempt is already queued or running".into(),
            });
        }

        let mut child = run.next_attempt(Utc::now());
        // Keep the manual attempt claimable even past the original budget.
        child.max_attempts = child.max_attempts.max(child.attempt);
        self.store.insert_run(&child).await?;
        info!(
            target: "engine::admission",
            parent = %run.id,
            child = %child.id,
            attempt = child.attempt,
            "manual retry admitted"
        );
        self.events
            .publish(RunEvent::retry(run.id, run.attempt, child.id, 0))
            .await;
        self.events
            .publish(RunEvent::enqueue(child.id, child.attempt))
            .await;
        Ok(child)
    }

    /// Current queue depth, for callers implementing their own backpressure.
    pub async fn queue_depth(&self) -> Result<usize> {
        self.store.queue_depth().await
    }

    /// The run row plus its full event stream.
    pub async fn status(&self, run_id: RunId) -> Result<RunStatusView> {
        let run = self
            .store
            .run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        let events = self.store.events_for(run_id).await?;
        Ok(RunStatusView { run, events })
    }
}
