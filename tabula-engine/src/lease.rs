//! Exclusive, time-bounded ownership of queued runs.
//!
//! The lease manager is the sole arbiter of run ownership: claiming,
//! renewal, terminal reporting, expiry reclamation, and retry scheduling all
//! go through it. Atomicity comes from the store's conditional single-row
//! updates, so the design stays correct across worker processes.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tabula_model::{ErrorCode, LeaseId, RunEvent, RunId, RunRecord, RunStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{LeaseConfig, RetryConfig};
use crate::error::Result;
use crate::events::EventSink;
use crate::store::{RunStore, TerminalOutcome};

/// Ownership record binding a run to one worker for a bounded duration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Lease {
    pub lease_id: LeaseId,
    pub run_id: RunId,
    /// Attempt of the run row this lease covers.
    pub attempt: u16,
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub renewals: u32,
}

impl Lease {
    pub fn grant(
        run_id: RunId,
        attempt: u16,
        owner: impl Into<String>,
        ttl: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            lease_id: LeaseId::new(),
            run_id,
            attempt,
            owner: owner.into(),
            acquired_at: now,
            expires_at: now + ttl,
            renewals: 0,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A claimed run together with the lease that owns it.
#[derive(Clone, Debug)]
pub struct ClaimedRun {
    pub run: RunRecord,
    pub lease: Lease,
}

pub struct LeaseManager<S> {
    store: Arc<S>,
    events: EventSink<S>,
    lease_cfg: LeaseConfig,
    retry_cfg: RetryConfig,
}

impl<S> std::fmt::Debug for LeaseManager<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseManager")
            .field("lease_cfg", &self.lease_cfg)
            .field("retry_cfg", &self.retry_cfg)
            .finish()
    }
}

impl<S: RunStore + 'static> LeaseManager<S> {
    pub fn new(
        store: Arc<S>,
        events: EventSink<S>,
        lease_cfg: LeaseConfig,
        retry_cfg: RetryConfig,
    ) -> Self {
        Self {
            store,
            events,
            lease_cfg,
            retry_cfg,
        }
    }

    pub fn lease_config(&self) -> LeaseConfig {
        self.lease_cfg
    }

    /// Claim the highest-priority claimable run for `owner`, if any. At most
    /// one concurrent caller wins a given run.
    pub async fn claim(&self, owner: &str) -> Result<Option<ClaimedRun>> {
        let Some(claimed) = self.store.claim_next(owner, self.lease_cfg.ttl()).await? else {
            return Ok(None);
        };
        debug!(
            target: "engine::lease",
            run = %claimed.run.id,
            attempt = claimed.run.attempt,
            owner,
            expires_at = %claimed.lease.expires_at,
            "run claimed"
        );
        self.events
            .publish(RunEvent::start(claimed.run.id, claimed.run.attempt, owner))
            .await;
        Ok(Some(claimed))
    }

    /// Extend the lease. `LeaseExpired` is fatal to the caller's attempt: it
    /// must abort in-flight work and write nothing, since ownership may
    /// already have moved.
    pub async fn renew(&self, lease: &Lease) -> Result<Lease> {
        let renewed = self.store.renew_lease(lease, self.lease_cfg.ttl()).await?;
        self.events
            .publish(RunEvent::renew(lease.run_id, lease.attempt, renewed.renewals))
            .await;
        Ok(renewed)
    }

    /// Write the terminal state for a leased run and release the lease in
    /// the same conditional update.
    pub async fn finish(
        &self,
        lease: &Lease,
        run: &RunRecord,
        outcome: TerminalOutcome,
        duration_ms: u64,
    ) -> Result<()> {
        self.store.finish_run(lease, &outcome).await?;
        if let (Some(code), Some(message)) = (outcome.error_code, outcome.error_message.as_deref())
        {
            self.events
                .publish(RunEvent::error(run.id, run.attempt, code, message))
                .await;
        }
        self.events
            .publish(RunEvent::exit(run.id, run.attempt, outcome.status, duration_ms))
            .await;
        Ok(())
    }

    /// Queue the follow-up attempt for a recoverably failed run, delayed by
    /// exponential backoff. Returns `None` when the attempt budget is spent.
    pub async fn schedule_retry(&self, run: &RunRecord) -> Result<Option<RunRecord>> {
        if !run.attempts_remaining() {
            return Ok(None);
        }
        let delay_ms = self.backoff_delay_ms(run.id, run.attempt.saturating_add(1));
        let queued_at = Utc::now() + chrono::Duration::milliseconds(delay_ms as i64);
        let child = run.next_attempt(queued_at);
        self.store.insert_run(&child).await?;
        info!(
            target: "engine::lease",
            parent = %run.id,
            child = %child.id,
            attempt = child.attempt,
            delay_ms,
            "retry scheduled"
        );
        self.events
            .publish(RunEvent::retry(run.id, run.attempt, child.id, delay_ms))
            .await;
        self.events
            .publish(RunEvent::enqueue(child.id, child.attempt))
            .await;
        Ok(Some(child))
    }

    /// Reclaim leases past `expires_at`: the abandoned attempt row is failed
    /// with `lease_expired`, and when attempts remain a new linked attempt is
    /// queued with backoff. Returns the number of leases reclaimed.
    pub async fn reclaim_expired(&self) -> Result<u64> {
        let expired = self.store.expired_leases().await?;
        let mut reclaimed = 0u64;

        for ClaimedRun { run, lease } in expired {
            let message = if run.attempts_remaining() {
                "lease expired without renewal"
            } else {
                "lease expired without renewal (max attempts)"
            };
            // Conditional: a lost race means someone else already settled the row.
            if !self
                .store
                .fail_expired(run.id, lease.lease_id, ErrorCode::LeaseExpired, message)
                .await?
            {
                continue;
            }
            reclaimed += 1;
            warn!(
                target: "engine::lease",
                run = %run.id,
                attempt = run.attempt,
                owner = %lease.owner,
                "lease expired, run reclaimed"
            );
            let duration_ms = run
                .started_at
                .map(|started| (Utc::now() - started).num_milliseconds().max(0) as u64)
                .unwrap_or(0);
            self.events
                .publish(RunEvent::error(
                    run.id,
                    run.attempt,
                    ErrorCode::LeaseExpired,
                    message,
                ))
                .await;
            self.events
                .publish(RunEvent::exit(run.id, run.attempt, RunStatus::Failed, duration_ms))
                .await;
            self.schedule_retry(&run).await?;
        }

        Ok(reclaimed)
    }

    /// Background sweep driving `reclaim_expired` until shutdown.
    pub fn spawn_reclaimer(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        let interval = std::time::Duration::from_millis(self.lease_cfg.reclaim_interval_ms.max(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!(target: "engine::lease", "reclaimer shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        match manager.reclaim_expired().await {
                            Ok(0) => {}
                            Ok(count) => {
                                info!(target: "engine::lease", count, "expired leases reclaimed");
                            }
                            Err(err) => {
                                warn!(target: "engine::lease", error = %err, "lease reclamation sweep failed");
                            }
                        }
                    }
                }
            }
        })
    }

    /// Anchor `base * 2^(attempt-1)`, plus additive deterministic jitter, all
    /// capped. Additive-only so the documented lower bound holds.
    fn backoff_delay_ms(&self, run_id: RunId, attempt: u16) -> u64 {
        let exp = attempt.saturating_sub(1).min(32) as u32;
        let anchor = self
            .retry_cfg
            .backoff_base_ms
            .saturating_mul(1u64 << exp.min(63))
            .min(self.retry_cfg.backoff_max_ms);
        let jitter_span = (anchor as f64) * f64::from(self.retry_cfg.jitter_ratio.max(0.0));
        let jittered = anchor as f64 + jitter_span * deterministic_unit(run_id, attempt);
        (jittered.round() as u64).min(self.retry_cfg.backoff_max_ms)
    }
}

/// Stable pseudo-random unit in [0, 1) derived from the run identity, so
/// retries spread out without per-process RNG state.
fn deterministic_unit(run_id: RunId, attempt: u16) -> f64 {
    let mut hasher = DefaultHasher::default();
    run_id.hash(&mut hasher);
    attempt.hash(&mut hasher);
    (hasher.finish() as f64) / (u64::MAX as f64)
}
