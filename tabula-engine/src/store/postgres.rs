//! Postgres-backed run store. Every ownership transition is a single
//! conditional UPDATE keyed on `(lease_id, lease_owner, lease_expires_at)`,
//! so concurrent workers and the reclaimer can race freely: the row decides.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::fmt;
use tabula_model::{
    Annotation, ConfigVersionId, ErrorCode, LeaseId, RunEvent, RunEventKind, RunId, RunPriority,
    RunRecord, RunStatus,
};
use tracing::info;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::lease::{ClaimedRun, Lease};
use crate::store::{RunStore, TerminalOutcome};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id UUID PRIMARY KEY,
    config_version UUID NOT NULL,
    input_ref TEXT NOT NULL,
    status TEXT NOT NULL,
    attempt SMALLINT NOT NULL,
    max_attempts SMALLINT NOT NULL,
    priority SMALLINT NOT NULL,
    queued_at TIMESTAMPTZ NOT NULL,
    started_at TIMESTAMPTZ,
    completed_at TIMESTAMPTZ,
    error_code TEXT,
    error_message TEXT,
    output_ref TEXT,
    parent_run UUID REFERENCES runs(id),
    annotations JSONB NOT NULL DEFAULT '[]'::jsonb,
    lease_id UUID,
    lease_owner TEXT,
    lease_acquired_at TIMESTAMPTZ,
    lease_expires_at TIMESTAMPTZ,
    lease_renewals BIGINT NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_runs_ready_claim
    ON runs (priority, queued_at)
    WHERE status = 'queued';

CREATE INDEX IF NOT EXISTS idx_runs_lease_expiry
    ON runs (lease_expires_at)
    WHERE status = 'running';

CREATE INDEX IF NOT EXISTS idx_runs_parent
    ON runs (parent_run)
    WHERE parent_run IS NOT NULL;

CREATE TABLE IF NOT EXISTS run_events (
    id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
    run_id UUID NOT NULL,
    attempt SMALLINT NOT NULL,
    kind TEXT NOT NULL,
    recorded_at TIMESTAMPTZ NOT NULL,
    duration_ms BIGINT,
    detail JSONB NOT NULL DEFAULT '{}'::jsonb
);

CREATE INDEX IF NOT EXISTS idx_run_events_run ON run_events (run_id, id);
"#;

const RUN_COLUMNS: &str = "id, config_version, input_ref, status, attempt, max_attempts, \
     priority, queued_at, started_at, completed_at, error_code, error_message, output_ref, \
     parent_run, annotations, lease_id, lease_owner, lease_acquired_at, lease_expires_at, \
     lease_renewals";

#[derive(Clone)]
pub struct PostgresRunStore {
    pool: PgPool,
}

impl fmt::Debug for PostgresRunStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresRunStore")
            .field("pool_size", &self.pool.size())
            .field("idle_connections", &self.pool.num_idle())
            .finish()
    }
}

impl PostgresRunStore {
    /// Connect over an existing pool and verify the database is reachable.
    pub async fn new(pool: PgPool) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| {
                EngineError::Internal(format!("run store failed Postgres health check: {e}"))
            })?;
        info!("run store connected to Postgres");
        Ok(Self { pool })
    }

    /// Create the run and event tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    fn decode_run(row: &PgRow) -> Result<RunRecord> {
        let status: String = row.try_get("status")?;
        let status = RunStatus::parse(&status)
            .ok_or_else(|| EngineError::Internal(format!("unknown run status '{status}'")))?;
        let priority: i16 = row.try_get("priority")?;
        let priority = RunPriority::parse(priority)
            .ok_or_else(|| EngineError::Internal(format!("unknown run priority {priority}")))?;
        let error_code: Option<String> = row.try_get("error_code")?;
        let error_code = match error_code {
            Some(code) => Some(ErrorCode::parse(&code).ok_or_else(|| {
                EngineError::Internal(format!("unknown error code '{code}'"))
            })?),
            None => None,
        };
        let annotations: serde_json::Value = row.try_get("annotations")?;
        let annotations: Vec<Annotation> = serde_json::from_value(annotations)?;
        let attempt: i16 = row.try_get("attempt")?;
        let max_attempts: i16 = row.try_get("max_attempts")?;

        Ok(RunRecord {
            id: RunId(row.try_get::<Uuid, _>("id")?),
            config_version: ConfigVersionId(row.try_get::<Uuid, _>("config_version")?),
            input_ref: row.try_get("input_ref")?,
            status,
            attempt: attempt.max(0) as u16,
            max_attempts: max_attempts.max(0) as u16,
            priority,
            queued_at: row.try_get("queued_at")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            error_code,
            error_message: row.try_get("error_message")?,
            output_ref: row.try_get("output_ref")?,
            parent_run: row
                .try_get::<Option<Uuid>, _>("parent_run")?
                .map(RunId),
            annotations,
        })
    }

    fn decode_lease(row: &PgRow, attempt: u16) -> Result<Lease> {
        let lease_id: Option<Uuid> = row.try_get("lease_id")?;
        let owner: Option<String> = row.try_get("lease_owner")?;
        let acquired_at: Option<DateTime<Utc>> = row.try_get("lease_acquired_at")?;
        let expires_at: Option<DateTime<Utc>> = row.try_get("lease_expires_at")?;
        let renewals: i64 = row.try_get("lease_renewals")?;
        match (lease_id, owner, acquired_at, expires_at) {
            (Some(lease_id), Some(owner), Some(acquired_at), Some(expires_at)) => Ok(Lease {
                lease_id: LeaseId(lease_id),
                run_id: RunId(row.try_get::<Uuid, _>("id")?),
                attempt,
                owner,
                acquired_at,
                expires_at,
                renewals: renewals.clamp(0, u32::MAX as i64) as u32,
            }),
            _ => Err(EngineError::Internal(
                "running row is missing lease columns".into(),
            )),
        }
    }

    fn decode_event(row: &PgRow) -> Result<RunEvent> {
        let kind: String = row.try_get("kind")?;
        let kind = RunEventKind::parse(&kind)
            .ok_or_else(|| EngineError::Internal(format!("unknown event kind '{kind}'")))?;
        let attempt: i16 = row.try_get("attempt")?;
        let duration_ms: Option<i64> = row.try_get("duration_ms")?;
        Ok(RunEvent {
            run_id: RunId(row.try_get::<Uuid, _>("run_id")?),
            attempt: attempt.max(0) as u16,
            kind,
            recorded_at: row.try_get("recorded_at")?,
            duration_ms: duration_ms.map(|d| d.max(0) as u64),
            detail: row.try_get("detail")?,
        })
    }
}

#[async_trait]
impl RunStore for PostgresRunStore {
    async fn insert_run(&self, run: &RunRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (id, config_version, input_ref, status, attempt, max_attempts,
                              priority, queued_at, parent_run, annotations)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(run.id.0)
        .bind(run.config_version.0)
        .bind(&run.input_ref)
        .bind(run.status.as_str())
        .bind(run.attempt as i16)
        .bind(run.max_attempts as i16)
        .bind(run.priority.as_i16())
        .bind(run.queued_at)
        .bind(run.parent_run.map(|p| p.0))
        .bind(serde_json::to_value(&run.annotations)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn run(&self, id: RunId) -> Result<Option<RunRecord>> {
        let row = sqlx::query(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = $1"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::decode_run).transpose()
    }

    async fn claim_next(&self, owner: &str, ttl: Duration) -> Result<Option<ClaimedRun>> {
        // SKIP LOCKED keeps concurrent claimers from blocking on each other;
        // the inner SELECT picks the oldest highest-priority claimable row.
        let row = sqlx::query(&format!(
            r#"
            UPDATE runs
            SET status = 'running',
                started_at = NOW(),
                lease_id = $1,
                lease_owner = $2,
                lease_acquired_at = NOW(),
                lease_expires_at = NOW() + ($3::bigint) * INTERVAL '1 millisecond',
                lease_renewals = 0
            WHERE id = (
                SELECT id FROM runs
                WHERE status = 'queued' AND queued_at <= NOW()
                ORDER BY priority ASC, queued_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(LeaseId::new().0)
        .bind(owner)
        .bind(ttl.num_milliseconds())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };
        let run = Self::decode_run(&row)?;
        let lease = Self::decode_lease(&row, run.attempt)?;
        Ok(Some(ClaimedRun { run, lease }))
    }

    async fn renew_lease(&self, lease: &Lease, ttl: Duration) -> Result<Lease> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE runs
            SET lease_expires_at = NOW() + ($3::bigint) * INTERVAL '1 millisecond',
                lease_renewals = lease_renewals + 1
            WHERE id = $1
              AND lease_id = $2
              AND lease_owner = $4
              AND status = 'running'
              AND lease_expires_at > NOW()
            RETURNING {RUN_COLUMNS}
            "#
        ))
        .bind(lease.run_id.0)
        .bind(lease.lease_id.0)
        .bind(ttl.num_milliseconds())
        .bind(&lease.owner)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::decode_lease(&row, lease.attempt),
            None => Err(EngineError::LeaseExpired {
                run_id: lease.run_id,
            }),
        }
    }

    async fn finish_run(&self, lease: &Lease, outcome: &TerminalOutcome) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = $3,
                completed_at = NOW(),
                error_code = $4,
                error_message = $5,
                output_ref = $6,
                lease_id = NULL,
                lease_owner = NULL,
                lease_acquired_at = NULL,
                lease_expires_at = NULL
            WHERE id = $1
              AND lease_id = $2
              AND lease_owner = $7
              AND status = 'running'
              AND lease_expires_at > NOW()
            "#,
        )
        .bind(lease.run_id.0)
        .bind(lease.lease_id.0)
        .bind(outcome.status.as_str())
        .bind(outcome.error_code.map(|c| c.as_str()))
        .bind(&outcome.error_message)
        .bind(&outcome.output_ref)
        .bind(&lease.owner)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::LeaseExpired {
                run_id: lease.run_id,
            });
        }
        Ok(())
    }

    async fn expired_leases(&self) -> Result<Vec<ClaimedRun>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RUN_COLUMNS} FROM runs
            WHERE status = 'running'
              AND lease_expires_at IS NOT NULL
              AND lease_expires_at < NOW()
            ORDER BY lease_expires_at ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let run = Self::decode_run(row)?;
                let lease = Self::decode_lease(row, run.attempt)?;
                Ok(ClaimedRun { run, lease })
            })
            .collect()
    }

    async fn fail_expired(
        &self,
        run_id: RunId,
        lease_id: LeaseId,
        code: ErrorCode,
        message: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = 'failed',
                completed_at = NOW(),
                error_code = $3,
                error_message = $4,
                lease_id = NULL,
                lease_owner = NULL,
                lease_acquired_at = NULL,
                lease_expires_at = NULL
            WHERE id = $1
              AND lease_id = $2
              AND status = 'running'
              AND lease_expires_at < NOW()
            "#,
        )
        .bind(run_id.0)
        .bind(lease_id.0)
        .bind(code.as_str())
        .bind(message)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn queue_depth(&self) -> Result<usize> {
        let depth: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM runs WHERE status = 'queued'")
                .fetch_one(&self.pool)
                .await?;
        Ok(depth.max(0) as usize)
    }

    async fn has_active_descendant(&self, run_id: RunId) -> Result<bool> {
        let active: Option<i32> = sqlx::query_scalar(
            r#"
            WITH RECURSIVE lineage AS (
                SELECT id, status FROM runs WHERE parent_run = $1
                UNION ALL
                SELECT r.id, r.status
                FROM runs r
                JOIN lineage l ON r.parent_run = l.id
            )
            SELECT 1 FROM lineage WHERE status IN ('queued', 'running') LIMIT 1
            "#,
        )
        .bind(run_id.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(active.is_some())
    }

    async fn append_annotations(&self, run_id: RunId, annotations: &[Annotation]) -> Result<()> {
        if annotations.is_empty() {
            return Ok(());
        }
        let result = sqlx::query(
            "UPDATE runs SET annotations = annotations || $2::jsonb WHERE id = $1",
        )
        .bind(run_id.0)
        .bind(serde_json::to_value(annotations)?)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(EngineError::RunNotFound(run_id));
        }
        Ok(())
    }

    async fn append_event(&self, event: &RunEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO run_events (run_id, attempt, kind, recorded_at, duration_ms, detail)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.run_id.0)
        .bind(event.attempt as i16)
        .bind(event.kind.as_str())
        .bind(event.recorded_at)
        .bind(event.duration_ms.map(|d| d as i64))
        .bind(&event.detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn events_for(&self, run_id: RunId) -> Result<Vec<RunEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, attempt, kind, recorded_at, duration_ms, detail
            FROM run_events
            WHERE run_id = $1
            ORDER BY id ASC
            "#,
        )
        .bind(run_id.0)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::decode_event).collect()
    }
}
