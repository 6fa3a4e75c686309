//! Top-level assembly: wires the store, lease manager, provisioner,
//! activator, admission queue, and worker pool together and owns their
//! lifecycle.

use std::fmt;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::activation::Activator;
use crate::admission::AdmissionQueue;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::events::{DEFAULT_EVENT_CAPACITY, EventSink};
use crate::lease::LeaseManager;
use crate::provision::{EnvironmentProvisioner, PackageInstaller};
use crate::store::RunStore;
use crate::worker::{ConfigSource, RunExecutor, WorkerContext, WorkerPool};

pub struct Engine<S> {
    config: EngineConfig,
    store: Arc<S>,
    events: EventSink<S>,
    leases: Arc<LeaseManager<S>>,
    provisioner: Arc<EnvironmentProvisioner>,
    activator: Arc<Activator>,
    admission: Arc<AdmissionQueue<S>>,
    executor: Arc<dyn RunExecutor>,
    config_source: Arc<dyn ConfigSource>,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl<S> fmt::Debug for Engine<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("running_tasks", &self.handles.len())
            .finish()
    }
}

impl<S: RunStore + 'static> Engine<S> {
    pub fn new(
        config: EngineConfig,
        store: Arc<S>,
        installer: Arc<dyn PackageInstaller>,
        executor: Arc<dyn RunExecutor>,
        config_source: Arc<dyn ConfigSource>,
    ) -> Self {
        let events = EventSink::new(Arc::clone(&store), DEFAULT_EVENT_CAPACITY);
        let leases = Arc::new(LeaseManager::new(
            Arc::clone(&store),
            events.clone(),
            config.lease,
            config.retry,
        ));
        let provisioner = Arc::new(EnvironmentProvisioner::new(installer));
        let activator = Arc::new(Activator::new(Arc::clone(&provisioner)));
        let admission = Arc::new(AdmissionQueue::new(
            Arc::clone(&store),
            Arc::clone(&activator),
            events.clone(),
            config.retry,
            config.admission,
        ));
        Self {
            config,
            store,
            events,
            leases,
            provisioner,
            activator,
            admission,
            executor,
            config_source,
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    /// Start the worker pool and the lease reclamation sweep. Idempotent
    /// start is not supported; call once.
    pub fn start(&mut self) {
        let ctx = WorkerContext {
            leases: Arc::clone(&self.leases),
            store: Arc::clone(&self.store),
            provisioner: Arc::clone(&self.provisioner),
            activator: Arc::clone(&self.activator),
            executor: Arc::clone(&self.executor),
            config_source: Arc::clone(&self.config_source),
            lease_cfg: self.config.lease,
            pool_cfg: self.config.pool,
        };
        self.handles
            .extend(WorkerPool::spawn(ctx, self.shutdown.clone()));
        self.handles
            .push(self.leases.spawn_reclaimer(self.shutdown.clone()));
        info!(
            target: "engine",
            slots = self.config.pool.slots,
            "engine started"
        );
    }

    /// Stop claiming new work and wait for every background task to exit.
    /// Runs in flight are driven to their terminal state first.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.shutdown.cancel();
        futures::future::join_all(self.handles.drain(..)).await;
        info!(target: "engine", "engine stopped");
        Ok(())
    }

    pub fn admission(&self) -> Arc<AdmissionQueue<S>> {
        Arc::clone(&self.admission)
    }

    pub fn activator(&self) -> Arc<Activator> {
        Arc::clone(&self.activator)
    }

    pub fn provisioner(&self) -> Arc<EnvironmentProvisioner> {
        Arc::clone(&self.provisioner)
    }

    pub fn events(&self) -> &EventSink<S> {
        &self.events
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
