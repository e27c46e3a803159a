//! Per-VM controller: a serial event processor, one task per domain UUID,
//! pulling from a bounded channel (spec §9 — replaces the original
//! "controller object with `instart`/`inmigrate`/... flags" with a task
//! whose very occupancy on an event *is* the re-entrancy guard).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use pvcd_types::DomainState;
use pvcd_worker_task::WorkerTaskContext;

use crate::context::AgentContext;
use crate::driver::{DomainLiveness, VirtDriver};
use crate::error::ReconcileError;
use crate::store;

/// Bridges the store-driven reconciliation loops to the cancellable-task
/// abstraction. `diverged` answers "has the desired state moved on from
/// what this wait started for" (spec §4.2: "if state leaves migrate before
/// arrival, abort"). Agent shutdown is tracked too, but deliberately never
/// aborts these waits: migration/shutdown handshakes run to their natural
/// timeout even while the agent is shutting down.
struct DomainOperation {
    diverged: bool,
}

impl WorkerTaskContext for DomainOperation {
    fn abort_requested(&self) -> bool {
        self.diverged
    }

    fn shutdown_requested(&self) -> bool {
        pvcd_daemon::is_shutdown_requested()
    }
}

/// What woke the controller up. The dispatcher (a `watch_data` callback on
/// `/domains/<u>/state` and `/node`) only ever sends `Changed`; tests can
/// also exercise the reconciliation function directly.
#[derive(Debug, Clone, Copy)]
pub enum VmEvent {
    Changed,
}

pub struct Timeouts {
    pub shutdown_grace: Duration,
    pub receive_arrival: Duration,
    pub receive_fallback: Duration,
    pub poll_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(90),
            receive_arrival: Duration::from_secs(90),
            receive_fallback: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
        }
    }
}

pub struct VmController {
    pub uuid: Uuid,
    pub ctx: AgentContext,
    pub driver: Arc<dyn VirtDriver>,
    pub timeouts: Timeouts,
}

impl VmController {
    pub fn spawn(
        uuid: Uuid,
        ctx: AgentContext,
        driver: Arc<dyn VirtDriver>,
    ) -> (mpsc::Sender<VmEvent>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(8);
        let controller = VmController {
            uuid,
            ctx,
            driver,
            timeouts: Timeouts::default(),
        };
        let handle = tokio::spawn(async move {
            // The channel being drained serially is the re-entrancy guard:
            // a second `Changed` queued while one reconcile is in flight is
            // simply handled next, never concurrently.
            while rx.recv().await.is_some() {
                if let Err(err) = controller.reconcile().await {
                    controller.handle_error(err).await;
                }
            }
        });
        (tx, handle)
    }

    async fn handle_error(&self, err: ReconcileError) {
        match &err {
            ReconcileError::Driver(_) | ReconcileError::Process { .. } => {
                tracing::warn!(uuid = %self.uuid, %err, "reconciliation failed, marking domain failed");
                let _ = store::write_domain_failed_reason(&self.ctx, &self.uuid, &err.to_string()).await;
                let _ = store::write_domain_state(&self.ctx, &self.uuid, DomainState::Fail).await;
            }
            ReconcileError::Transient(_) => {
                tracing::warn!(uuid = %self.uuid, %err, "transient error, will retry on next event");
            }
            ReconcileError::Validation(_) | ReconcileError::ClusterState(_) => {
                tracing::error!(uuid = %self.uuid, %err, "refusing to act on malformed or inconsistent state");
            }
            ReconcileError::SessionLost => {
                tracing::error!(uuid = %self.uuid, "coordination-store session lost");
            }
        }
    }

    fn domain_name(&self) -> String {
        self.uuid.to_string()
    }

    /// The reconciliation algorithm from spec §4.2, run on every change to
    /// `/domains/<u>/{state,node}`.
    pub async fn reconcile(&self) -> Result<(), ReconcileError> {
        let state = store::read_domain_state(&self.ctx, &self.uuid).await?;
        let node = store::read_domain_node(&self.ctx, &self.uuid)
            .await?
            .ok_or_else(|| ReconcileError::ClusterState("domain has no assigned node".to_string()))?;
        let domain = self.domain_name();
        let liveness = self.driver.liveness(&domain)?;
        let is_self = node == self.ctx.node_name();

        if is_self {
            self.reconcile_as_owner(state, liveness, &domain).await
        } else {
            self.reconcile_as_non_owner(state, liveness, &domain, &node).await
        }
    }

    async fn reconcile_as_owner(
        &self,
        state: DomainState,
        liveness: DomainLiveness,
        domain: &str,
    ) -> Result<(), ReconcileError> {
        match (liveness, state) {
            (DomainLiveness::Running, DomainState::Start) => self.adopt_running(domain).await,
            (DomainLiveness::Running, DomainState::Migrate | DomainState::Unmigrate) => {
                // Stuck-in-migrate recovery: we already own it locally.
                self.adopt_running(domain).await?;
                store::write_domain_state(&self.ctx, &self.uuid, DomainState::Start).await
            }
            (DomainLiveness::Running, DomainState::Restart) => {
                self.driver.graceful_shutdown(domain)?;
                self.wait_for_shutdown(domain).await?;
                let xml = store::read_domain_xml(&self.ctx, &self.uuid).await?;
                self.driver.create_from_xml(domain, &xml)?;
                self.adopt_running(domain).await?;
                store::write_domain_state(&self.ctx, &self.uuid, DomainState::Start).await
            }
            (DomainLiveness::Running, DomainState::Shutdown) => {
                self.driver.graceful_shutdown(domain)?;
                self.wait_for_shutdown(domain).await
            }
            (DomainLiveness::Running, DomainState::Stop) => {
                self.driver.destroy(domain)?;
                self.remove_from_running(domain).await
            }
            (DomainLiveness::Running, _) => Ok(()),

            (DomainLiveness::NotRunning, DomainState::Start) => {
                let xml = store::read_domain_xml(&self.ctx, &self.uuid).await?;
                self.driver.create_from_xml(domain, &xml)?;
                self.adopt_running(domain).await
            }
            (DomainLiveness::NotRunning, DomainState::Migrate | DomainState::Unmigrate) => {
                self.receive_migrate(domain).await
            }
            (DomainLiveness::NotRunning, DomainState::Restart) => {
                store::write_domain_state(&self.ctx, &self.uuid, DomainState::Start).await
            }
            (DomainLiveness::NotRunning, DomainState::Shutdown | DomainState::Stop) => {
                self.remove_from_running(domain).await
            }
            (DomainLiveness::NotRunning, _) => Ok(()),
        }
    }

    async fn reconcile_as_non_owner(
        &self,
        state: DomainState,
        liveness: DomainLiveness,
        domain: &str,
        target: &str,
    ) -> Result<(), ReconcileError> {
        if liveness != DomainLiveness::Running {
            return Ok(());
        }
        match state {
            DomainState::Migrate | DomainState::Unmigrate => self.send_migrate(domain, target).await,
            DomainState::Shutdown => {
                self.driver.graceful_shutdown(domain)?;
                self.wait_for_shutdown(domain).await
            }
            _ => {
                // We are no longer the owner; anything else means force-terminate.
                self.driver.destroy(domain)?;
                self.remove_from_running(domain).await
            }
        }
    }

    /// send_migrate (spec §4.2): open a live-migration to `target`; on
    /// failure fall back to a graceful shutdown so the target can cold-start.
    async fn send_migrate(&self, domain: &str, target: &str) -> Result<(), ReconcileError> {
        let target_uri = format!("qemu+tcp://{target}.{}/system", self.ctx.config.cluster_domain);
        match self.driver.migrate_live(domain, &target_uri) {
            Ok(()) => self.remove_from_running(domain).await,
            Err(err) => {
                tracing::warn!(uuid = %self.uuid, %target, %err, "live migration failed, falling back to shutdown");
                self.driver.graceful_shutdown(domain)?;
                self.wait_for_shutdown(domain).await
            }
        }
    }

    /// receive_migrate (spec §4.2): wait up to `receive_arrival` for the
    /// domain to appear running locally; if the source instead fell back to
    /// shutdown, wait up to `receive_fallback` for `state=stop` then trigger
    /// a cold start.
    async fn receive_migrate(&self, domain: &str) -> Result<(), ReconcileError> {
        let deadline = self.ctx.clock.now() + self.timeouts.receive_arrival;
        loop {
            let state = store::read_domain_state(&self.ctx, &self.uuid).await?;
            let op = DomainOperation { diverged: state != DomainState::Migrate };
            if op.abort_requested() {
                return Ok(());
            }
            if self.driver.liveness(domain)? == DomainLiveness::Running {
                self.adopt_running(domain).await?;
                return store::write_domain_state(&self.ctx, &self.uuid, DomainState::Start).await;
            }
            if self.ctx.clock.now() >= deadline {
                break;
            }
            tokio::time::sleep(self.timeouts.poll_interval).await;
        }

        let state = store::read_domain_state(&self.ctx, &self.uuid).await?;
        if !matches!(state, DomainState::Shutdown | DomainState::Stop) {
            return store::write_domain_state(&self.ctx, &self.uuid, DomainState::Fail).await;
        }

        let fallback_deadline = self.ctx.clock.now() + self.timeouts.receive_fallback;
        loop {
            let state = store::read_domain_state(&self.ctx, &self.uuid).await?;
            if state == DomainState::Stop {
                return store::write_domain_state(&self.ctx, &self.uuid, DomainState::Start).await;
            }
            if self.ctx.clock.now() >= fallback_deadline {
                return store::write_domain_state(&self.ctx, &self.uuid, DomainState::Fail).await;
            }
            tokio::time::sleep(self.timeouts.poll_interval).await;
        }
    }

    async fn wait_for_shutdown(&self, domain: &str) -> Result<(), ReconcileError> {
        let deadline = self.ctx.clock.now() + self.timeouts.shutdown_grace;
        let op = DomainOperation { diverged: false };
        let mut logged_shutdown = false;
        loop {
            if op.shutdown_requested() && !logged_shutdown {
                tracing::info!(uuid = %self.uuid, "agent shutdown requested, continuing shutdown wait to its natural timeout");
                logged_shutdown = true;
            }
            if self.driver.liveness(domain)? == DomainLiveness::NotRunning {
                self.remove_from_running(domain).await?;
                return store::write_domain_state(&self.ctx, &self.uuid, DomainState::Stop).await;
            }
            if self.ctx.clock.now() >= deadline {
                self.driver.destroy(domain)?;
                self.remove_from_running(domain).await?;
                return store::write_domain_state(&self.ctx, &self.uuid, DomainState::Stop).await;
            }
            tokio::time::sleep(self.timeouts.poll_interval).await;
        }
    }

    async fn adopt_running(&self, domain: &str) -> Result<(), ReconcileError> {
        let name = self.ctx.node_name().to_string();
        let mut running = store::read_running_domains(&self.ctx, &name).await?;
        if !running.iter().any(|d| d == domain) {
            running.push(domain.to_string());
            store::write_running_domains(&self.ctx, &name, &running).await?;
        }
        Ok(())
    }

    async fn remove_from_running(&self, domain: &str) -> Result<(), ReconcileError> {
        let name = self.ctx.node_name().to_string();
        let mut running = store::read_running_domains(&self.ctx, &name).await?;
        let before = running.len();
        running.retain(|d| d != domain);
        if running.len() != before {
            store::write_running_domains(&self.ctx, &name, &running).await?;
        }
        Ok(())
    }
}

/// Runs `flush_locks` for a domain's block devices (spec §4.2 "Stuck-lock
/// recovery"): only allowed while the domain is not `start`. Fencing takes a
/// separate path (`storage_facade::flush_domain_locks` called directly) since
/// there the previous owner being confirmed down is itself the safety
/// condition, not the domain's `state` field (spec §5).
pub async fn flush_locks(ctx: &AgentContext, uuid: &Uuid) -> Result<(), ReconcileError> {
    let state = store::read_domain_state(ctx, uuid).await?;
    if state == DomainState::Start {
        return Err(ReconcileError::Validation(
            "cannot flush locks while domain is running".to_string(),
        ));
    }
    crate::storage_facade::flush_domain_locks(ctx, uuid).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pvcd_coordinator::{CoordinationStore, FakeStore};

    use super::*;
    use crate::config::NodeConfig;
    use crate::context::FakeClock;
    use crate::driver::fake::FakeDriver;

    fn controller(node_name: &str, uuid: Uuid, driver: Arc<FakeDriver>) -> VmController {
        let store: Arc<dyn CoordinationStore> = Arc::new(FakeStore::new());
        let ctx = AgentContext::new(store, Arc::new(NodeConfig::for_test(node_name)), Arc::new(FakeClock::new()));
        VmController {
            uuid,
            ctx,
            driver,
            timeouts: Timeouts::default(),
        }
    }

    #[tokio::test]
    async fn cold_start_creates_domain_and_adopts_it() {
        let uuid = Uuid::new_v4();
        let driver = Arc::new(FakeDriver::default());
        let vmc = controller("n1", uuid, driver.clone());
        store::write_domain_node(&vmc.ctx, &uuid, "n1").await.unwrap();
        store::write_domain_state(&vmc.ctx, &uuid, DomainState::Start).await.unwrap();
        vmc.ctx
            .store
            .write(&store::domain_path(&uuid, "xml"), b"<domain/>")
            .await
            .unwrap();

        vmc.reconcile().await.unwrap();

        assert_eq!(driver.liveness(&uuid.to_string()).unwrap(), DomainLiveness::Running);
        let running = store::read_running_domains(&vmc.ctx, "n1").await.unwrap();
        assert_eq!(running, vec![uuid.to_string()]);
    }

    #[tokio::test]
    async fn owner_adopts_an_already_running_domain() {
        let uuid = Uuid::new_v4();
        let driver = Arc::new(FakeDriver::default());
        driver.set_running(&uuid.to_string(), true);
        let vmc = controller("n1", uuid, driver);
        store::write_domain_node(&vmc.ctx, &uuid, "n1").await.unwrap();
        store::write_domain_state(&vmc.ctx, &uuid, DomainState::Start).await.unwrap();

        vmc.reconcile().await.unwrap();

        let running = store::read_running_domains(&vmc.ctx, "n1").await.unwrap();
        assert_eq!(running, vec![uuid.to_string()]);
    }

    #[tokio::test]
    async fn non_owner_sends_live_migration_and_drops_from_running() {
        let uuid = Uuid::new_v4();
        let driver = Arc::new(FakeDriver::default());
        driver.set_running(&uuid.to_string(), true);
        let vmc = controller("n1", uuid, driver.clone());
        store::write_domain_node(&vmc.ctx, &uuid, "n2").await.unwrap();
        store::write_domain_state(&vmc.ctx, &uuid, DomainState::Migrate).await.unwrap();
        store::write_running_domains(&vmc.ctx, "n1", &[uuid.to_string()]).await.unwrap();

        vmc.reconcile().await.unwrap();

        assert_eq!(driver.liveness(&uuid.to_string()).unwrap(), DomainLiveness::NotRunning);
        let running = store::read_running_domains(&vmc.ctx, "n1").await.unwrap();
        assert!(running.is_empty());
    }

    #[tokio::test]
    async fn non_owner_falls_back_to_shutdown_when_migration_fails() {
        let uuid = Uuid::new_v4();
        let driver = Arc::new(FakeDriver::default());
        driver.set_running(&uuid.to_string(), true);
        *driver.fail_migrate.lock().unwrap() = true;
        let vmc = controller("n1", uuid, driver.clone());
        store::write_domain_node(&vmc.ctx, &uuid, "n2").await.unwrap();
        store::write_domain_state(&vmc.ctx, &uuid, DomainState::Migrate).await.unwrap();
        store::write_running_domains(&vmc.ctx, "n1", &[uuid.to_string()]).await.unwrap();

        vmc.reconcile().await.unwrap();

        assert_eq!(store::read_domain_state(&vmc.ctx, &uuid).await.unwrap(), DomainState::Stop);
        let running = store::read_running_domains(&vmc.ctx, "n1").await.unwrap();
        assert!(running.is_empty());
    }
}
