//! Worker pool driving claimed runs through provisioning, hooks, execution,
//! and terminal reporting. Every worker renews its lease concurrently with
//! the transformation and abandons the run the moment a renewal is refused.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;
use tabula_model::{ConfigManifest, ConfigVersionId, ErrorCode, HookStage, RunRecord};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant as TokioInstant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::activation::Activator;
use crate::config::{LeaseConfig, PoolConfig};
use crate::error::{EngineError, Result};
use crate::hooks::{HookRegistry, StageSnapshot};
use crate::lease::{ClaimedRun, Lease, LeaseManager};
use crate::netpolicy::{ExecutionPhase, GuardedConnector, NetworkCapability};
use crate::provision::{EnvironmentHandle, EnvironmentProvisioner};
use crate::store::{RunStore, TerminalOutcome};

/// Result of one transformation attempt, as reported by the executor.
#[derive(Clone, Debug)]
pub enum ExecutionStatus {
    Succeeded {
        output_ref: String,
    },
    /// Transient failure; the engine may queue a follow-up attempt.
    Retryable {
        message: String,
    },
    /// Permanent failure; no retry regardless of remaining budget.
    Fatal {
        code: ErrorCode,
        message: String,
    },
}

/// Everything one execution sees: the run row, its environment, the scoped
/// network, and a token cancelled when the lease is lost or the engine stops.
pub struct ExecutionContext {
    pub run: RunRecord,
    pub environment: EnvironmentHandle,
    pub network: GuardedConnector,
    pub cancel: CancellationToken,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("run", &self.run.id)
            .field("attempt", &self.run.attempt)
            .field("config_version", &self.run.config_version)
            .finish()
    }
}

/// The transformation itself. Implementations should poll `ctx.cancel` and
/// return promptly once it fires; results produced after cancellation are
/// discarded anyway.
#[async_trait]
pub trait RunExecutor: Send + Sync {
    async fn execute(&self, ctx: ExecutionContext) -> ExecutionStatus;
}

/// Source of per-version manifests when no in-process activation record is
/// available, e.g. after a restart with runs still queued.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn manifest(&self, config_version: ConfigVersionId) -> Result<ConfigManifest>;
}

pub struct WorkerContext<S> {
    pub leases: Arc<LeaseManager<S>>,
    pub store: Arc<S>,
    pub provisioner: Arc<EnvironmentProvisioner>,
    pub activator: Arc<Activator>,
    pub executor: Arc<dyn RunExecutor>,
    pub config_source: Arc<dyn ConfigSource>,
    pub lease_cfg: LeaseConfig,
    pub pool_cfg: PoolConfig,
}

impl<S> Clone for WorkerContext<S> {
    fn clone(&self) -> Self {
        Self {
            leases: Arc::clone(&self.leases),
            store: Arc::clone(&self.store),
            provisioner: Arc::clone(&self.provisioner),
            activator: Arc::clone(&self.activator),
            executor: Arc::clone(&self.executor),
            config_source: Arc::clone(&self.config_source),
            lease_cfg: self.lease_cfg,
            pool_cfg: self.pool_cfg,
        }
    }
}

impl<S> fmt::Debug for WorkerContext<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerContext")
            .field("lease_cfg", &self.lease_cfg)
            .field("pool_cfg", &self.pool_cfg)
            .finish()
    }
}

#[derive(Debug)]
pub struct WorkerPool;

impl WorkerPool {
    /// Spawn the configured number of worker slots. Each slot loops claiming
    /// runs until `shutdown` fires; a run already in flight is driven to its
    /// terminal state before the slot exits.
    pub fn spawn<S: RunStore + 'static>(
        ctx: WorkerContext<S>,
        shutdown: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let slots = ctx.pool_cfg.slots.max(1);
        (0..slots)
            .map(|index| {
                let ctx = ctx.clone();
                let shutdown = shutdown.clone();
                let worker_id = format!("worker-{}-{index}", std::process::id());
                tokio::spawn(async move {
                    worker_loop(ctx, shutdown, worker_id).await;
                })
            })
            .collect()
    }
}

async fn worker_loop<S: RunStore + 'static>(
    ctx: WorkerContext<S>,
    shutdown: CancellationToken,
    worker_id: String,
) {
    let idle = std::time::Duration::from_millis(ctx.pool_cfg.idle_poll_ms.max(1));
    debug!(target: "engine::worker", worker = %worker_id, "worker started");
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        match ctx.leases.claim(&worker_id).await {
            Ok(Some(claimed)) => {
                drive_run(&ctx, &shutdown, &worker_id, claimed).await;
            }
            Ok(None) => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(idle) => {}
                }
            }
            Err(err) => {
                warn!(target: "engine::worker", worker = %worker_id, error = %err, "claim failed");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(idle) => {}
                }
            }
        }
    }
    debug!(target: "engine::worker", worker = %worker_id, "worker stopped");
}

async fn drive_run<S: RunStore + 'static>(
    ctx: &WorkerContext<S>,
    shutdown: &CancellationToken,
    worker_id: &str,
    claimed: ClaimedRun,
) {
    let ClaimedRun { run, lease } = claimed;
    let started = Instant::now();
    info!(
        target: "engine::worker",
        worker = worker_id,
        run = %run.id,
        attempt = run.attempt,
        config_version = %run.config_version,
        "run claimed"
    );

    match prepare_and_execute(ctx, shutdown, &run, lease).await {
        Ok(Some((lease, outcome, retry))) => {
            let duration_ms = started.elapsed().as_millis() as u64;
            match ctx.leases.finish(&lease, &run, outcome, duration_ms).await {
                Ok(()) => {
                    if retry {
                        if let Err(err) = ctx.leases.schedule_retry(&run).await {
                            error!(
                                target: "engine::worker",
                                run = %run.id,
                                error = %err,
                                "failed to schedule retry"
                            );
                        }
                    }
                }
                Err(EngineError::LeaseExpired { .. }) => {
                    // Ownership lapsed between execution and reporting; the
                    // result is discarded and reclamation owns the row now.
                    warn!(
                        target: "engine::worker",
                        worker = worker_id,
                        run = %run.id,
                        "lease lost before terminal write, result discarded"
                    );
                }
                Err(err) => {
                    error!(
                        target: "engine::worker",
                        run = %run.id,
                        error = %err,
                        "terminal write failed"
                    );
                }
            }
        }
        Ok(None) => {
            // Lease lost mid-run; nothing to write.
            warn!(
                target: "engine::worker",
                worker = worker_id,
                run = %run.id,
                "run abandoned after lease loss"
            );
        }
        Err(err) => {
            error!(
                target: "engine::worker",
                worker = worker_id,
                run = %run.id,
                error = %err,
                "run preparation failed"
            );
        }
    }
}

/// Drive one claimed run up to (but not including) the terminal write.
///
/// Returns the lease to finish under, the outcome, and whether a retry
/// attempt should be queued; `None` means the lease was lost and the attempt
/// must be abandoned without writing anything.
async fn prepare_and_execute<S: RunStore + 'static>(
    ctx: &WorkerContext<S>,
    shutdown: &CancellationToken,
    run: &RunRecord,
    lease: Lease,
) -> Result<Option<(Lease, TerminalOutcome, bool)>> {
    let (manifest, registry) = resolve_config(ctx, run.config_version).await?;

    // Environment first: a known-broken build fails the run terminally with
    // no retry, since every later attempt would hit the same wall.
    let environment = match ctx
        .provisioner
        .ensure_ready(run.config_version, manifest.dependency_spec.as_ref())
        .await
    {
        Ok(environment) => environment,
        Err(EngineError::BuildFailed { diagnostic, .. }) => {
            return Ok(Some((
                lease,
                TerminalOutcome::failed(ErrorCode::EnvironmentBuildFailed, diagnostic),
                false,
            )));
        }
        Err(err) => {
            let retry = run.attempts_remaining();
            let code = if retry {
                ErrorCode::ExecutionFailed
            } else {
                ErrorCode::TransientExhausted
            };
            return Ok(Some((
                lease,
                TerminalOutcome::failed(code, err.to_string()),
                retry,
            )));
        }
    };

    let runtime_network =
        NetworkCapability::scope(ExecutionPhase::Runtime, manifest.network_opt_in);
    let environment = environment.with_network(runtime_network);

    // Pre-execution hooks observe the input side; a fatal hook stops the
    // attempt before any user code runs.
    let pre_snapshot = StageSnapshot::for_run(
        HookStage::PreExecution,
        run.config_version,
        run.id,
        run.attempt,
        json!({ "input_ref": run.input_ref }),
    );
    let pre_annotations = match registry.run_stage(HookStage::PreExecution, &pre_snapshot) {
        Ok(annotations) => annotations,
        Err(EngineError::HookFatal { hook_name, detail }) => {
            return Ok(Some((
                lease,
                TerminalOutcome::failed(
                    ErrorCode::ExecutionFailed,
                    format!("pre-execution hook '{hook_name}' failed: {detail}"),
                ),
                false,
            )));
        }
        Err(err) => return Err(err),
    };
    if !pre_annotations.is_empty() {
        ctx.store.append_annotations(run.id, &pre_annotations).await?;
    }

    let cancel = shutdown.child_token();
    let exec_ctx = ExecutionContext {
        run: run.clone(),
        environment: environment.clone(),
        network: environment.connector(),
        cancel: cancel.clone(),
    };

    let Some((lease, status)) = execute_with_renewal(ctx, lease, exec_ctx, &cancel).await? else {
        return Ok(None);
    };

    let (outcome, retry, output_data) = match status {
        ExecutionStatus::Succeeded { output_ref } => {
            let data = json!({ "output_ref": output_ref });
            (TerminalOutcome::succeeded(output_ref), false, Some(data))
        }
        ExecutionStatus::Retryable { message } => {
            if run.attempts_remaining() {
                (
                    TerminalOutcome::failed(ErrorCode::ExecutionFailed, message),
                    true,
                    None,
                )
            } else {
                (
                    TerminalOutcome::failed(ErrorCode::TransientExhausted, message),
                    false,
                    None,
                )
            }
        }
        ExecutionStatus::Fatal { code, message } => {
            (TerminalOutcome::failed(code, message), false, None)
        }
    };

    // Post-execution hooks observe the output side; they run only when the
    // transformation produced one.
    if let Some(data) = output_data {
        let post_snapshot = StageSnapshot::for_run(
            HookStage::PostExecution,
            run.config_version,
            run.id,
            run.attempt,
            data,
        );
        match registry.run_stage(HookStage::PostExecution, &post_snapshot) {
            Ok(annotations) => {
                if !annotations.is_empty() {
                    ctx.store.append_annotations(run.id, &annotations).await?;
                }
            }
            Err(EngineError::HookFatal { hook_name, detail }) => {
                return Ok(Some((
                    lease,
                    TerminalOutcome::failed(
                        ErrorCode::ExecutionFailed,
                        format!("post-execution hook '{hook_name}' failed: {detail}"),
                    ),
                    false,
                )));
            }
            Err(err) => return Err(err),
        }
    }

    Ok(Some((lease, outcome, retry)))
}

async fn resolve_config<S: RunStore + 'static>(
    ctx: &WorkerContext<S>,
    config_version: ConfigVersionId,
) -> Result<(ConfigManifest, Arc<HookRegistry>)> {
    if let Some(record) = ctx.activator.record(config_version) {
        return Ok((record.manifest.clone(), Arc::clone(&record.registry)));
    }
    // Queued rows can outlive the process that admitted them; fall back to
    // configuration storage, with no hooks available for the attempt.
    let manifest = ctx.config_source.manifest(config_version).await?;
    Ok((manifest, Arc::new(HookRegistry::new())))
}

/// Run the executor while renewing the lease on a fixed cadence. A refused
/// renewal cancels the execution and abandons the attempt.
async fn execute_with_renewal<S: RunStore + 'static>(
    ctx: &WorkerContext<S>,
    mut lease: Lease,
    exec_ctx: ExecutionContext,
    cancel: &CancellationToken,
) -> Result<Option<(Lease, ExecutionStatus)>> {
    let renew_every = ctx.lease_cfg.renew_interval();
    let executor = Arc::clone(&ctx.executor);
    let run_id = exec_ctx.run.id;
    let mut execution = Box::pin(executor.execute(exec_ctx));
    // First tick is one full interval out, not immediate.
    let mut ticker = interval_at(TokioInstant::now() + renew_every, renew_every);

    loop {
        tokio::select! {
            status = &mut execution => {
                return Ok(Some((lease, status)));
            }
            _ = ticker.tick() => {
                match ctx.leases.renew(&lease).await {
                    Ok(renewed) => lease = renewed,
                    Err(EngineError::LeaseExpired { .. }) => {
                        warn!(
                            target: "engine::worker",
                            run = %run_id,
                            "lease renewal refused, cancelling execution"
                        );
                        cancel.cancel();
                        return Ok(None);
                    }
                    Err(err) => return Err(err),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::events::EventSink;
    use crate::provision::PackageInstaller;
    use crate::store::InMemoryRunStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tabula_model::{DependencySpec, InstalledPackage, RunPriority, RunStatus};

    struct NullInstaller;

    #[async_trait]
    impl PackageInstaller for NullInstaller {
        async fn install(
            &self,
            _config_version: ConfigVersionId,
            spec: &DependencySpec,
            _network: &GuardedConnector,
        ) -> Result<Vec<InstalledPackage>> {
            Ok(spec
                .requirements
                .iter()
                .map(|req| InstalledPackage::new(req.name.clone(), "1.0.0"))
                .collect())
        }
    }

    struct StaticConfigSource {
        manifest: ConfigManifest,
    }

    #[async_trait]
    impl ConfigSource for StaticConfigSource {
        async fn manifest(&self, _config_version: ConfigVersionId) -> Result<ConfigManifest> {
            Ok(self.manifest.clone())
        }
    }

    struct ScriptedExecutor {
        status: ExecutionStatus,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RunExecutor for ScriptedExecutor {
        async fn execute(&self, _ctx: ExecutionContext) -> ExecutionStatus {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.status.clone()
        }
    }

    fn context(
        manifest: ConfigManifest,
        executor: Arc<dyn RunExecutor>,
    ) -> WorkerContext<InMemoryRunStore> {
        context_with_lease(manifest, executor, LeaseConfig::default())
    }

    fn context_with_lease(
        manifest: ConfigManifest,
        executor: Arc<dyn RunExecutor>,
        lease_cfg: LeaseConfig,
    ) -> WorkerContext<InMemoryRunStore> {
        let store = Arc::new(InMemoryRunStore::new());
        let events = EventSink::new(Arc::clone(&store), 64);
        let retry_cfg = RetryConfig {
            backoff_base_ms: 10,
            ..RetryConfig::default()
        };
        let leases = Arc::new(LeaseManager::new(
            Arc::clone(&store),
            events,
            lease_cfg,
            retry_cfg,
        ));
        let provisioner = Arc::new(EnvironmentProvisioner::new(Arc::new(NullInstaller)));
        let activator = Arc::new(Activator::new(Arc::clone(&provisioner)));
        WorkerContext {
            leases,
            store,
            provisioner,
            activator,
            executor,
            config_source: Arc::new(StaticConfigSource { manifest }),
            lease_cfg,
            pool_cfg: PoolConfig {
                slots: 1,
                idle_poll_ms: 10,
            },
        }
    }

    async fn wait_terminal(
        store: &InMemoryRunStore,
        run_id: tabula_model::RunId,
    ) -> RunRecord {
        for _ in 0..200 {
            if let Some(run) = store.run(run_id).await.unwrap()
                && run.status.is_terminal()
            {
                return run;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run never reached a terminal state");
    }

    #[tokio::test]
    async fn pool_drives_a_run_to_success() {
        let manifest = ConfigManifest::new(ConfigVersionId::new());
        let executor = Arc::new(ScriptedExecutor {
            status: ExecutionStatus::Succeeded {
                output_ref: "out/doc-1.json".into(),
            },
            calls: AtomicUsize::new(0),
        });
        let ctx = context(manifest.clone(), executor.clone());
        let run = RunRecord::new(manifest.config_version, "doc-1", RunPriority::P1, 3);
        ctx.store.insert_run(&run).await.unwrap();

        let shutdown = CancellationToken::new();
        let handles = WorkerPool::spawn(ctx.clone(), shutdown.clone());

        let finished = wait_terminal(&ctx.store, run.id).await;
        assert_eq!(finished.status, RunStatus::Succeeded);
        assert_eq!(finished.output_ref.as_deref(), Some("out/doc-1.json"));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn retryable_failure_queues_a_linked_attempt() {
        let manifest = ConfigManifest::new(ConfigVersionId::new());
        let executor = Arc::new(ScriptedExecutor {
            status: ExecutionStatus::Retryable {
                message: "ocr backend timed out".into(),
            },
            calls: AtomicUsize::new(0),
        });
        let ctx = context(manifest.clone(), executor);
        let run = RunRecord::new(manifest.config_version, "doc-1", RunPriority::P1, 3);
        ctx.store.insert_run(&run).await.unwrap();

        let shutdown = CancellationToken::new();
        let handles = WorkerPool::spawn(ctx.clone(), shutdown.clone());

        let finished = wait_terminal(&ctx.store, run.id).await;
        assert_eq!(finished.status, RunStatus::Failed);
        assert_eq!(finished.error_code, Some(ErrorCode::ExecutionFailed));
        assert!(ctx.store.has_active_descendant(run.id).await.unwrap());

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn exhausted_budget_maps_to_transient_exhausted() {
        let manifest = ConfigManifest::new(ConfigVersionId::new());
        let executor = Arc::new(ScriptedExecutor {
            status: ExecutionStatus::Retryable {
                message: "still flaky".into(),
            },
            calls: AtomicUsize::new(0),
        });
        let ctx = context(manifest.clone(), executor);
        let run = RunRecord::new(manifest.config_version, "doc-1", RunPriority::P1, 1);
        ctx.store.insert_run(&run).await.unwrap();

        let shutdown = CancellationToken::new();
        let handles = WorkerPool::spawn(ctx.clone(), shutdown.clone());

        let finished = wait_terminal(&ctx.store, run.id).await;
        assert_eq!(finished.error_code, Some(ErrorCode::TransientExhausted));
        assert!(!ctx.store.has_active_descendant(run.id).await.unwrap());

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn lease_loss_mid_execution_writes_no_terminal_result() {
        // Executor stalls until it is cancelled, then reports a stale
        // success. Ownership has already lapsed by then, so nothing it
        // produces may reach the store.
        struct StallingExecutor;

        #[async_trait]
        impl RunExecutor for StallingExecutor {
            async fn execute(&self, ctx: ExecutionContext) -> ExecutionStatus {
                ctx.cancel.cancelled().await;
                ExecutionStatus::Succeeded {
                    output_ref: "stale-result".into(),
                }
            }
        }

        let lease_cfg = LeaseConfig {
            lease_ttl_secs: 0,
            reclaim_interval_ms: 50,
            ..LeaseConfig::default()
        };
        let manifest = ConfigManifest::new(ConfigVersionId::new());
        let ctx = context_with_lease(manifest.clone(), Arc::new(StallingExecutor), lease_cfg);
        let run = RunRecord::new(manifest.config_version, "doc-1", RunPriority::P1, 1);
        ctx.store.insert_run(&run).await.unwrap();

        let shutdown = CancellationToken::new();
        let mut handles = WorkerPool::spawn(ctx.clone(), shutdown.clone());
        handles.push(ctx.leases.spawn_reclaimer(shutdown.clone()));

        // The reclaimer settles the expired attempt, not the worker.
        let finished = wait_terminal(&ctx.store, run.id).await;
        assert_eq!(finished.status, RunStatus::Failed);
        assert_eq!(finished.error_code, Some(ErrorCode::LeaseExpired));
        assert!(finished.output_ref.is_none());

        // Give the refused renewal time to fire; the stale success must
        // not land after abandonment either.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let settled = ctx.store.run(run.id).await.unwrap().unwrap();
        assert_eq!(settled.status, RunStatus::Failed);
        assert_eq!(settled.error_code, Some(ErrorCode::LeaseExpired));
        assert!(settled.output_ref.is_none());

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn policy_violation_from_executor_is_terminal() {
        // Executor dials out through the run's connector; with no opt-in the
        // connect is denied deterministically.
        struct DialingExecutor;

        #[async_trait]
        impl RunExecutor for DialingExecutor {
            async fn execute(&self, ctx: ExecutionContext) -> ExecutionStatus {
                match ctx.network.connect("203.0.113.1:443").await {
                    Ok(_) => ExecutionStatus::Succeeded {
                        output_ref: "out".into(),
                    },
                    Err(err) => ExecutionStatus::Fatal {
                        code: ErrorCode::NetworkPolicyViolation,
                        message: err.to_string(),
                    },
                }
            }
        }

        let manifest = ConfigManifest::new(ConfigVersionId::new());
        let ctx = context(manifest.clone(), Arc::new(DialingExecutor));
        let run = RunRecord::new(manifest.config_version, "doc-1", RunPriority::P1, 3);
        ctx.store.insert_run(&run).await.unwrap();

        let shutdown = CancellationToken::new();
        let handles = WorkerPool::spawn(ctx.clone(), shutdown.clone());

        let finished = wait_terminal(&ctx.store, run.id).await;
        assert_eq!(finished.status, RunStatus::Failed);
        assert_eq!(finished.error_code, Some(ErrorCode::NetworkPolicyViolation));
        // Permanent failures never queue a follow-up attempt.
        assert!(!ctx.store.has_active_descendant(run.id).await.unwrap());

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn pre_execution_hook_annotations_land_on_the_run() {
        use crate::hooks::{HookOutcome, HookRecord};

        let manifest = ConfigManifest::new(ConfigVersionId::new());
        let executor = Arc::new(ScriptedExecutor {
            status: ExecutionStatus::Succeeded {
                output_ref: "out".into(),
            },
            calls: AtomicUsize::new(0),
        });
        let ctx = context(manifest.clone(), executor);
        let registry = crate::hooks::HookRegistry::new().register(HookRecord::new(
            "page-count",
            HookStage::PreExecution,
            Arc::new(|_| HookOutcome::Ok(Some(json!({ "pages": 12 })))),
        ));
        ctx.activator
            .activate(manifest.clone(), registry)
            .await
            .unwrap();

        let run = RunRecord::new(manifest.config_version, "doc-1", RunPriority::P1, 3);
        ctx.store.insert_run(&run).await.unwrap();

        let shutdown = CancellationToken::new();
        let handles = WorkerPool::spawn(ctx.clone(), shutdown.clone());

        let finished = wait_terminal(&ctx.store, run.id).await;
        assert_eq!(finished.status, RunStatus::Succeeded);
        assert_eq!(finished.annotations.len(), 1);
        assert_eq!(finished.annotations[0].hook_name, "page-count");

        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
