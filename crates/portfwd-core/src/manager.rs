//! Connection registry
//!
//! [`ForwardManager`] owns every known tunnel, keyed by its identity string.
//! Structural changes happen under one short-lived lock; the slow part of a
//! start (resolution and the tunnel handshake) runs in a spawned worker while
//! only the caller waits for it.

use crate::error::{ForwardError, Result};
use crate::identity::{ResourceKind, TunnelIdentity, TunnelTarget};
use crate::inventory::Inventory;
use crate::record::{TunnelRecord, TunnelSnapshot, TunnelStatus, DEFAULT_LOG_CAPACITY};
use crate::session::SavedConnection;
use crate::tunnel::TunnelOpener;
use crate::worker::{self, WorkerContext};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Invoked after every structural or status change
pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

/// Timeouts and limits for a manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Upper bound on a single start attempt
    pub start_timeout: Duration,
    /// How long `stop_all` waits for live workers before returning
    pub shutdown_grace: Duration,
    /// How long a worker waits for its tunnel to close after a stop
    pub stop_ack_timeout: Duration,
    /// Entries kept in each record's log ring
    pub log_capacity: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(2),
            stop_ack_timeout: Duration::from_secs(5),
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

#[derive(Default)]
struct Registry {
    records: HashMap<TunnelIdentity, Arc<TunnelRecord>>,
    on_change: Option<ChangeCallback>,
}

struct Shared {
    registry: Mutex<Registry>,
    inventory: Arc<dyn Inventory>,
    opener: Arc<dyn TunnelOpener>,
    config: ManagerConfig,
    shutdown: CancellationToken,
    next_seq: AtomicU64,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self) {
        let callback = self.registry().on_change.clone();
        if let Some(callback) = callback {
            callback();
        }
    }
}

/// Notification handle given to workers; does not keep the manager alive
#[derive(Clone)]
pub(crate) struct ChangeNotifier(Weak<Shared>);

impl ChangeNotifier {
    pub(crate) fn notify(&self) {
        if let Some(shared) = self.0.upgrade() {
            shared.notify();
        }
    }
}

/// Registry of port-forward tunnels
#[derive(Clone)]
pub struct ForwardManager {
    shared: Arc<Shared>,
}

/// Non-owning handle for callbacks installed on the manager itself
#[derive(Clone)]
pub struct WeakForwardManager {
    shared: Weak<Shared>,
}

impl WeakForwardManager {
    pub fn upgrade(&self) -> Option<ForwardManager> {
        self.shared.upgrade().map(|shared| ForwardManager { shared })
    }
}

impl ForwardManager {
    pub fn new(inventory: Arc<dyn Inventory>, opener: Arc<dyn TunnelOpener>) -> Self {
        Self::with_config(inventory, opener, ManagerConfig::default())
    }

    pub fn with_config(
        inventory: Arc<dyn Inventory>,
        opener: Arc<dyn TunnelOpener>,
        config: ManagerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                registry: Mutex::new(Registry::default()),
                inventory,
                opener,
                config,
                shutdown: CancellationToken::new(),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakForwardManager {
        WeakForwardManager {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn inventory(&self) -> &Arc<dyn Inventory> {
        &self.shared.inventory
    }

    /// Process-wide parent of every worker's cancellation context
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shared.shutdown
    }

    /// Install the change callback, replacing any previous one
    ///
    /// The callback runs on whichever task made the change and must not block.
    pub fn set_on_change<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.registry().on_change = Some(Arc::new(callback));
    }

    pub async fn start_to_pod(
        &self,
        namespace: &str,
        pod: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Arc<TunnelRecord>> {
        self.start(TunnelTarget::pod(namespace, pod, local_port, remote_port))
            .await
    }

    pub async fn start_to_service(
        &self,
        namespace: &str,
        service: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Result<Arc<TunnelRecord>> {
        self.start(TunnelTarget::service(
            namespace,
            service,
            local_port,
            remote_port,
        ))
        .await
    }

    /// Start a tunnel and wait until it is Active, fails, or times out
    ///
    /// A terminal record with the same identity is cancelled and replaced.
    pub async fn start(&self, target: TunnelTarget) -> Result<Arc<TunnelRecord>> {
        let record = self.insert_starting(target)?;
        let id = record.identity().clone();
        info!(id = %id, "Starting port-forward");
        self.shared.notify();

        let (ready_tx, ready_rx) = oneshot::channel();
        let worker = tokio::spawn(worker::run(WorkerContext {
            record: record.clone(),
            inventory: self.shared.inventory.clone(),
            opener: self.shared.opener.clone(),
            notifier: ChangeNotifier(Arc::downgrade(&self.shared)),
            ready: ready_tx,
            stop_ack_timeout: self.shared.config.stop_ack_timeout,
        }));

        let timeout = self.shared.config.start_timeout;
        tokio::select! {
            ready = ready_rx => {
                if ready.is_ok() {
                    return Ok(record);
                }
            }
            _ = tokio::time::sleep(timeout) => {
                let err = ForwardError::Timeout { id: id.to_string(), timeout };
                warn!(id = %id, "Port-forward did not become ready within {:?}", timeout);
                record.log(format!("✗ Timeout after {:?}", timeout));
                if record.mark_stopped() {
                    record.log("Stopped");
                }
                record.cancel_worker();
                self.shared.notify();
                return Err(err);
            }
        }

        // The worker gave up before signalling readiness
        match worker.await {
            Ok(Err(err)) => Err(err),
            Ok(Ok(())) => Err(ForwardError::Cancelled(id.to_string())),
            Err(join_err) => {
                let err = ForwardError::Transport(format!("worker task failed: {}", join_err));
                record.fail(&err);
                Err(err)
            }
        }
    }

    fn insert_starting(&self, target: TunnelTarget) -> Result<Arc<TunnelRecord>> {
        let id = target.identity();
        let mut registry = self.shared.registry();

        let mut reconnects = 0;
        if let Some(existing) = registry.records.get(&id) {
            if existing.status().is_live() {
                return Err(ForwardError::AlreadyActive(id.to_string()));
            }
            debug!(id = %id, status = %existing.status(), "Replacing terminal record");
            existing.cancel_worker();
            reconnects = existing.reconnect_count() + 1;
            registry.records.remove(&id);
        }

        let record = Arc::new(self.new_record(target, TunnelStatus::Starting));
        record.set_reconnect_count(reconnects);
        record.log("Starting port-forward");
        registry.records.insert(id, record.clone());
        Ok(record)
    }

    fn new_record(&self, target: TunnelTarget, status: TunnelStatus) -> TunnelRecord {
        TunnelRecord::new(
            target,
            &self.shared.shutdown,
            self.shared.next_seq.fetch_add(1, Ordering::Relaxed),
            self.shared.config.log_capacity,
            status,
        )
    }

    /// Stop a tunnel, keeping its record for inspection or reconnect
    ///
    /// Stopping a record that is already Stopped succeeds without effect. A
    /// record in Error keeps its status and error message.
    pub fn stop(&self, id: &str) -> Result<()> {
        let record = self
            .get(id)
            .ok_or_else(|| ForwardError::ConnectionNotFound(id.to_string()))?;

        let stopped = record.mark_stopped();
        record.cancel_worker();
        if stopped {
            record.log("Stopped");
            info!(id = %id, "Port-forward stopped");
            self.shared.notify();
        }
        Ok(())
    }

    /// Stop every tunnel for process shutdown
    ///
    /// Detaches the change callback first, then waits at most
    /// `shutdown_grace` for live workers to exit.
    pub async fn stop_all(&self) {
        let records: Vec<Arc<TunnelRecord>> = {
            let mut registry = self.shared.registry();
            registry.on_change = None;
            registry.records.values().cloned().collect()
        };

        let mut pending = Vec::new();
        for record in records {
            let was_live = record.status().is_live();
            if record.mark_stopped() {
                record.log("Stopped (shutdown)");
            }
            record.cancel_worker();
            if was_live {
                pending.push(record);
            }
        }

        if pending.is_empty() {
            return;
        }

        info!("Stopping {} port-forward(s)", pending.len());
        let grace = self.shared.config.shutdown_grace;
        let waits = pending.iter().map(|record| record.finished());
        if tokio::time::timeout(grace, join_all(waits)).await.is_err() {
            warn!("Some port-forwards did not stop within {:?}", grace);
        }
    }

    /// Remove a terminal record from the registry
    pub fn delete(&self, id: &str) -> Result<()> {
        {
            let mut registry = self.shared.registry();
            let record = registry
                .records
                .get(id)
                .ok_or_else(|| ForwardError::ConnectionNotFound(id.to_string()))?;
            if record.status().is_live() {
                return Err(ForwardError::CannotRemoveActive(id.to_string()));
            }
            record.cancel_worker();
            registry.records.remove(id);
        }

        info!(id = %id, "Connection removed");
        self.shared.notify();
        Ok(())
    }

    /// Insert a Stopped record with no worker. Returns false if the identity exists.
    pub fn add_placeholder(&self, target: TunnelTarget) -> bool {
        {
            let mut registry = self.shared.registry();
            let id = target.identity();
            if registry.records.contains_key(&id) {
                return false;
            }
            let record = Arc::new(self.new_record(target, TunnelStatus::Stopped));
            record.log("Restored from previous session (stopped)");
            record.mark_finished();
            registry.records.insert(id, record);
        }

        self.shared.notify();
        true
    }

    /// All records, oldest first
    pub fn list(&self) -> Vec<Arc<TunnelRecord>> {
        let mut records: Vec<_> = self.shared.registry().records.values().cloned().collect();
        records.sort_by_key(|record| record.seq());
        records
    }

    pub fn list_active(&self) -> Vec<Arc<TunnelRecord>> {
        self.list()
            .into_iter()
            .filter(|record| record.status() == TunnelStatus::Active)
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<TunnelRecord>> {
        self.shared.registry().records.get(id).cloned()
    }

    pub fn snapshots(&self) -> Vec<TunnelSnapshot> {
        self.list().iter().map(|record| record.snapshot()).collect()
    }

    /// Projection persisted by the session store
    pub fn for_save(&self) -> Vec<SavedConnection> {
        self.list()
            .iter()
            .map(|record| {
                let target = record.target();
                SavedConnection {
                    namespace: target.namespace.clone(),
                    resource_type: target.kind,
                    resource_name: target.name.clone(),
                    local_port: target.local_port,
                    remote_port: target.remote_port,
                    was_active: record.status() == TunnelStatus::Active,
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.shared.registry().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of records per kind, used in status summaries
    pub fn count_by_kind(&self, kind: ResourceKind) -> usize {
        self.shared
            .registry()
            .records
            .values()
            .filter(|record| record.target().kind == kind)
            .count()
    }
}
