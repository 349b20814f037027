//! The supervision task: outer loop, leadership gating, status reporting,
//! shutdown handling, and job-id reservation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use strata_agency::{Agent, Envelope, Node, TransactionBuilder};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::checks;
use crate::config::SupervisionConfig;
use crate::enforcement;
use crate::health::{recorded_status, timestamp, HealthStatus, ServerRole};
use crate::jobs::{self, Scheduler};
use crate::paths;
use crate::upgrade;

/// Job ids are reserved in batches of this size with one increment.
pub const JOB_ID_BATCH: u64 = 10_000;

/// Leadership must be at least this old before the loop body runs, so the
/// local snapshot cannot be behind the agent's last committed state.
const LEADER_STABLE_FOR: Duration = Duration::from_secs(10);

/// Start the supervision loop on the current tokio runtime.
pub fn spawn(agent: Arc<dyn Agent>, config: SupervisionConfig) -> SupervisorHandle {
    let mut supervisor = Supervisor::new(agent, config);
    let stopping = supervisor.stopping.clone();
    let wake = supervisor.wake.clone();
    let task = tokio::spawn(async move {
        supervisor.run().await;
    });
    SupervisorHandle {
        stopping,
        wake,
        task,
    }
}

/// Handle to a spawned supervision loop.
pub struct SupervisorHandle {
    stopping: Arc<AtomicBool>,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Ask the loop to stop; the tick in progress runs to completion.
    pub fn begin_shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    /// Wake the loop before its period elapses.
    pub fn broadcast(&self) {
        self.wake.notify_waiters();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}

/// The supervision control loop.
///
/// Exactly one instance runs per process; it owns all of its mutable state,
/// which is the Rust rendition of the single supervisor mutex. Every helper
/// below assumes it is called from the loop task.
pub struct Supervisor {
    agent: Arc<dyn Agent>,
    config: SupervisionConfig,
    snapshot: Node,
    transient: Node,
    job_id: u64,
    job_id_max: u64,
    upgraded: bool,
    self_shutdown: bool,
    stopping: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl Supervisor {
    pub fn new(agent: Arc<dyn Agent>, config: SupervisionConfig) -> Self {
        Self {
            agent,
            config,
            snapshot: Node::new(),
            transient: Node::new(),
            job_id: 0,
            job_id_max: 0,
            upgraded: false,
            self_shutdown: false,
            stopping: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn config(&self) -> &SupervisionConfig {
        &self.config
    }

    /// Next job id to hand out; zero when no batch is reserved.
    pub fn job_id(&self) -> u64 {
        self.job_id
    }

    pub fn job_id_max(&self) -> u64 {
        self.job_id_max
    }

    fn stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Drive the loop until shutdown is requested or observed.
    pub async fn run(&mut self) {
        self.wait_for_bootstrap().await;
        while !self.stopping() {
            self.tick().await;
            if self.stopping() {
                break;
            }
            self.wait_one_period().await;
        }
        tracing::debug!("supervision loop exited");
    }

    /// Hold off until somebody has initialized the cluster's data; running
    /// checks against a blank store would only produce noise.
    async fn wait_for_bootstrap(&self) {
        let supervision_root = self.config.prefixed(paths::SUPERVISION);
        while !self.stopping() {
            match self.agent.read_snapshot(&supervision_root).await {
                Ok(node) if !node.children("/").is_empty() => return,
                Ok(_) => {
                    tracing::debug!("waiting for the cluster to initialize its data");
                }
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        "agency root unreadable; contact your database administrator"
                    );
                }
            }
            self.wait_one_period().await;
        }
    }

    async fn wait_one_period(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.tick_period()) => {}
            _ = self.wake.notified() => {}
        }
    }

    /// One full supervision pass.
    pub async fn tick(&mut self) {
        if !self.update_snapshot().await {
            return;
        }

        if self.snapshot.has(paths::SHUTDOWN) {
            self.handle_shutdown().await;
            return;
        }
        if self.self_shutdown {
            // The shutdown marker is gone and every member is down.
            self.stopping.store(true, Ordering::SeqCst);
            return;
        }

        if !self.agent.is_leader() {
            // Per-term state: the next leadership re-reserves ids and re-runs
            // the (idempotent) upgrader.
            self.upgraded = false;
            self.job_id = 0;
            self.job_id_max = 0;
            return;
        }
        if self.agent.leader_for() < LEADER_STABLE_FOR || !self.agent.prepare_leadership_done() {
            return;
        }

        if self.job_id == 0 || self.job_id >= self.job_id_max {
            self.get_unique_ids().await;
        }

        if self.snapshot.has(paths::SUPERVISION_MAINTENANCE) {
            self.report_status("Maintenance").await;
            return;
        }

        self.report_status("Normal").await;
        if !self.upgraded {
            self.upgrade_agency().await;
        }

        let mut scheduler = Scheduler::new(self.job_id, self.job_id_max);
        for role in ServerRole::all() {
            checks::check_role(
                self.agent.as_ref(),
                &self.config,
                &self.snapshot,
                &self.transient,
                role,
                &mut scheduler,
            )
            .await;
        }
        self.handle_jobs(&mut scheduler);
        self.job_id = scheduler.cursor();
        self.flush(scheduler).await;
    }

    /// Copy the committed and transient trees below the agency prefix.
    async fn update_snapshot(&mut self) -> bool {
        match self.agent.read_snapshot(&self.config.agency_prefix).await {
            Ok(snapshot) => self.snapshot = snapshot,
            Err(err) => {
                tracing::warn!(error = %err, "could not refresh agency snapshot");
                return false;
            }
        }
        match self.agent.read_transient(&self.config.agency_prefix).await {
            Ok(transient) => self.transient = transient,
            Err(err) => {
                tracing::warn!(error = %err, "could not refresh transient state");
                return false;
            }
        }
        true
    }

    fn handle_jobs(&self, scheduler: &mut Scheduler) {
        enforcement::shrink_cluster(&self.config, &self.snapshot, scheduler);
        enforcement::enforce_replication(&self.config, &self.snapshot, scheduler);
        jobs::work_jobs(&self.config, &self.snapshot, scheduler);
    }

    /// Submit everything the tick accumulated; rejected preconditions are
    /// silent no-ops recomputed from the next snapshot.
    async fn flush(&self, mut scheduler: Scheduler) {
        for envelope in scheduler.take_envelopes() {
            match self.agent.submit_write(envelope).await {
                Ok(result) if result.accepted => {
                    if result.indices.iter().any(|index| *index == 0) {
                        tracing::debug!("transaction lost its precondition race");
                    }
                }
                Ok(_) => {
                    tracing::debug!("envelope not accepted; recomputing next tick");
                }
                Err(err) => {
                    tracing::debug!(error = %err, "envelope submission failed");
                }
            }
        }
    }

    /// Record the supervision mode: persistently only when it changed,
    /// transiently on every tick except in maintenance.
    async fn report_status(&mut self, mode: &str) {
        let mode_path = format!("{}/Mode", paths::SUPERVISION_STATE);
        let persist = self.snapshot.string_at(&mode_path) != Some(mode);

        let mut builder = TransactionBuilder::new();
        builder.set(
            self.config.prefixed(paths::SUPERVISION_STATE),
            json!({ "Mode": mode, "Timestamp": timestamp(Utc::now()) }),
        );
        let Ok(write) = builder.build() else {
            return;
        };
        let envelope = Envelope::of_write(write);

        if mode != "Maintenance" {
            if let Err(err) = self.agent.submit_transient(envelope.clone()).await {
                tracing::debug!(error = %err, "transient status report failed");
            }
        }
        if persist {
            tracing::info!(mode, "supervision mode change");
            if let Err(err) = self.agent.submit_write(envelope).await {
                tracing::debug!(error = %err, "persistent status report failed");
            }
        }
    }

    async fn upgrade_agency(&mut self) {
        let envelope = upgrade::build_upgrade_envelope(&self.config, &self.snapshot);
        if !envelope.is_empty() {
            tracing::debug!(envelope = %envelope.to_wire(), "upgrading the agency schema");
            match self.agent.submit_write(envelope).await {
                Ok(result) if result.accepted => {}
                Ok(_) => tracing::debug!("agency schema upgrade not accepted"),
                Err(err) => tracing::debug!(error = %err, "agency schema upgrade failed"),
            }
        }
        self.upgraded = true;
    }

    /// Reserve the next batch of job ids with one increment-and-read
    /// envelope. Failure is retried on the next tick.
    async fn get_unique_ids(&mut self) {
        let path = self.config.prefixed(paths::SYNC_LATEST_ID);
        let mut builder = TransactionBuilder::new();
        builder.increment(&path, JOB_ID_BATCH);
        let Ok(write) = builder.build() else {
            return;
        };
        let mut envelope = Envelope::of_write(write);
        envelope.push_read(vec![path.clone()]);

        match self.agent.submit_write(envelope).await {
            Ok(result) if result.accepted => {
                let latest = result
                    .results
                    .get(1)
                    .and_then(|value| value.pointer(&path))
                    .and_then(Value::as_u64);
                match latest {
                    Some(latest) if latest >= JOB_ID_BATCH => {
                        self.job_id_max = latest;
                        // Id zero is the "no batch" sentinel and is skipped.
                        self.job_id = (latest - JOB_ID_BATCH).max(1);
                        tracing::debug!(
                            from = self.job_id,
                            to = self.job_id_max,
                            "reserved job id batch"
                        );
                    }
                    _ => {
                        tracing::error!("job id reservation returned no counter value");
                    }
                }
            }
            Ok(_) => {
                tracing::error!("failed to acquire job ids from the agency");
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to acquire job ids from the agency");
            }
        }
    }

    /// The operator asked the whole cluster to stop. Wait until no
    /// registered server reports GOOD health anymore, then drop the marker
    /// and make sure the removal replicated before the loop exits.
    async fn handle_shutdown(&mut self) {
        self.self_shutdown = true;
        let mut servers_cleared = true;
        for server_id in self
            .snapshot
            .children(paths::CURRENT_SERVERS_REGISTERED)
            .keys()
        {
            if server_id.as_str() == "Version" {
                continue;
            }
            if recorded_status(&self.snapshot, server_id) != Some(HealthStatus::Good) {
                tracing::warn!(server = %server_id, "server does not seem to have shut down cleanly");
                continue;
            }
            tracing::debug!(server = %server_id, "waiting for server to shut down");
            servers_cleared = false;
        }

        if servers_cleared && self.agent.is_leader() {
            let mut builder = TransactionBuilder::new();
            builder.delete(self.config.prefixed(paths::SHUTDOWN));
            let Ok(write) = builder.build() else {
                return;
            };
            match self
                .agent
                .submit_write_and_wait(Envelope::of_write(write))
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    tracing::error!("shutdown marker removal was not replicated to followers");
                }
                Err(err) => {
                    tracing::error!(error = %err, "shutdown marker removal failed");
                }
            }
        }
    }
}
