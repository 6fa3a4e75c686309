//! Single-process store used by tests and embedded deployments. One mutex
//! over the whole state gives every operation the same atomicity the
//! Postgres backend gets from conditional single-row updates.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use chrono::Utc;
use tabula_model::{Annotation, ErrorCode, LeaseId, RunEvent, RunId, RunRecord, RunStatus};
use tokio::sync::Mutex;

use crate::error::{EngineError, Result};
use crate::lease::{ClaimedRun, Lease};
use crate::store::{RunStore, TerminalOutcome};

#[derive(Default)]
struct MemState {
    runs: HashMap<RunId, RunRecord>,
    leases: HashMap<RunId, Lease>,
    children: HashMap<RunId, Vec<RunId>>,
    events: Vec<RunEvent>,
}

#[derive(Default)]
pub struct InMemoryRunStore {
    state: Mutex<MemState>,
}

impl fmt::Debug for InMemoryRunStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state.try_lock() {
            Ok(state) => f
                .debug_struct("InMemoryRunStore")
                .field("runs", &state.runs.len())
                .field("leases", &state.leases.len())
                .field("events", &state.events.len())
                .finish(),
            Err(_) => f
                .debug_struct("InMemoryRunStore")
                .field("state", &"<locked>")
                .finish(),
        }
    }
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn insert_run(&self, run: &RunRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(parent) = run.parent_run {
            state.children.entry(parent).or_default().push(run.id);
        }
        state.runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn run(&self, id: RunId) -> Result<Option<RunRecord>> {
        let state = self.state.lock().await;
        Ok(state.runs.get(&id).cloned())
    }

    async fn claim_next(&self, owner: &str, ttl: chrono::Duration) -> Result<Option<ClaimedRun>> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let next = state
            .runs
            .values()
            .filter(|run| run.status == RunStatus::Queued && run.queued_at <= now)
            .min_by_key(|run| (run.priority, run.queued_at, run.id.0))
            .map(|run| run.id);

        let Some(run_id) = next else {
            return Ok(None);
        };

        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| EngineError::Internal("claimed run vanished".into()))?;
        run.status = RunStatus::Running;
        run.started_at = Some(now);
        let lease = Lease::grant(run.id, run.attempt, owner, ttl);
        let claimed = ClaimedRun {
            run: run.clone(),
            lease: lease.clone(),
        };
        state.leases.insert(run_id, lease);
        Ok(Some(claimed))
    }

    async fn renew_lease(&self, lease: &Lease, ttl: chrono::Duration) -> Result<Lease> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let current = state.leases.get_mut(&lease.run_id);
        match current {
            Some(live)
                if live.lease_id == lease.lease_id
                    && live.owner == lease.owner
                    && !live.is_expired(now) =>
            {
                live.expires_at = now + ttl;
                live.renewals += 1;
                Ok(live.clone())
            }
            _ => Err(EngineError::LeaseExpired {
                run_id: lease.run_id,
            }),
        }
    }

    async fn finish_run(&self, lease: &Lease, outcome: &TerminalOutcome) -> Result<()> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let owned = matches!(
            state.leases.get(&lease.run_id),
            Some(live)
                if live.lease_id == lease.lease_id
                    && live.owner == lease.owner
                    && !live.is_expired(now)
        );
        if !owned {
            return Err(EngineError::LeaseExpired {
                run_id: lease.run_id,
            });
        }

        let run = state
            .runs
            .get_mut(&lease.run_id)
            .ok_or(EngineError::RunNotFound(lease.run_id))?;
        run.status = outcome.status;
        run.completed_at = Some(now);
        run.error_code = outcome.error_code;
        run.error_message = outcome.error_message.clone();
        run.output_ref = outcome.output_ref.clone();
        state.leases.remove(&lease.run_id);
        Ok(())
    }

    async fn expired_leases(&self) -> Result<Vec<ClaimedRun>> {
        let state = self.state.lock().await;
        let now = Utc::now();
        Ok(state
            .leases
            .values()
            .filter(|lease| lease.is_expired(now))
            .filter_map(|lease| {
                state.runs.get(&lease.run_id).map(|run| ClaimedRun {
                    run: run.clone(),
                    lease: lease.clone(),
                })
            })
            .collect())
    }

    async fn fail_expired(
        &self,
        run_id: RunId,
        lease_id: LeaseId,
        code: ErrorCode,
        message: &str,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let reclaimable = matches!(
            state.leases.get(&run_id),
            Some(live) if live.lease_id == lease_id && live.is_expired(now)
        );
        if !reclaimable {
            return Ok(false);
        }
        let Some(run) = state.runs.get_mut(&run_id) else {
            return Ok(false);
        };
        if run.status != RunStatus::Running {
            return Ok(false);
        }

        run.status = RunStatus::Failed;
        run.completed_at = Some(now);
        run.error_code = Some(code);
        run.error_message = Some(message.to_string());
        state.leases.remove(&run_id);
        Ok(true)
    }

    async fn queue_depth(&self) -> Result<usize> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .values()
            .filter(|run| run.status == RunStatus::Queued)
            .count())
    }

    async fn has_active_descendant(&self, run_id: RunId) -> Result<bool> {
        let state = self.state.lock().await;
        let mut frontier = vec![run_id];
        while let Some(current) = frontier.pop() {
            if let Some(children) = state.children.get(&current) {
                for child in children {
                    if let Some(run) = state.runs.get(child)
                        && !run.status.is_terminal()
                    {
                        return Ok(true);
                    }
                    frontier.push(*child);
                }
            }
        }
        Ok(false)
    }

    async fn append_annotations(&self, run_id: RunId, annotations: &[Annotation]) -> Result<()> {
        let mut state = self.state.lock().await;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or(EngineError::RunNotFound(run_id))?;
        run.annotations.extend_from_slice(annotations);
        Ok(())
    }

    async fn append_event(&self, event: &RunEvent) -> Result<()> {
        let mut state = self.state.lock().await;
        state.events.push(event.clone());
        Ok(())
    }

    async fn events_for(&self, run_id: RunId) -> Result<Vec<RunEvent>> {
        let state = self.state.lock().await;
        Ok(state
            .events
            .iter()
            .filter(|event| event.run_id == run_id)
            .cloned()
            .collect())
    }
}
