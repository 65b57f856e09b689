// Copyright 2024 Golem Cloud
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The evaluation loop: a single task owning the tracked tables. One
//! tick advances every due expectation by at most one transition, in
//! snapshot order. All outside input (upstream updates, worker joins,
//! work events) arrives on the command channel and is applied between
//! ticks, so the tables are only ever touched from here.

use crate::config::ExpectationManagerConfig;
use crate::containers::TrackedContainerStore;
use crate::error::EvalError;
use crate::metrics;
use crate::model::{Session, TrackedExpectation};
use crate::status::StatusPublisher;
use crate::store::TrackedExpectationStore;
use crate::workers::WorkerPool;
use package_manager_common::api::{WorkEvent, WorkerConnection};
use package_manager_common::model::{
    Expectation, ExpectationId, ExpectationState, ExpectedPackageContainer, Reason,
    WorkInProgressId, WorkerId,
};
use rand::Rng;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub enum Command {
    UpdateExpectations(Vec<Expectation>),
    UpdateContainers(Vec<ExpectedPackageContainer>),
    WorkerConnected(WorkerConnection),
    WorkerDisconnected(WorkerId),
    WorkEvent {
        worker_id: WorkerId,
        wip: WorkInProgressId,
        event: WorkEvent,
    },
    AbortExpectation(ExpectationId),
    RestartExpectation(ExpectationId),
}

pub struct EvaluationLoop {
    pub(crate) config: ExpectationManagerConfig,
    pub(crate) store: TrackedExpectationStore,
    pub(crate) containers: TrackedContainerStore,
    pub(crate) pool: WorkerPool,
    pub(crate) publisher: StatusPublisher,
    commands: mpsc::UnboundedReceiver<Command>,
}

impl EvaluationLoop {
    pub(crate) fn new(
        config: ExpectationManagerConfig,
        publisher: StatusPublisher,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> Self {
        Self {
            config,
            store: TrackedExpectationStore::new(),
            containers: TrackedContainerStore::new(),
            pool: WorkerPool::new(),
            publisher,
            commands,
        }
    }

    /// Runs until the owning manager is dropped (command channel
    /// closes).
    pub async fn run(mut self) {
        info!("evaluation loop started");
        loop {
            self.drain_commands();

            self.tick().await;
            self.evaluate_containers().await;

            if self.store.any_dirty() {
                // Trigger fan-out wants another pass right away.
                continue;
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.evaluation_interval) => {}
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
        }
        info!("evaluation loop stopped");
    }

    pub(crate) fn drain_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            self.handle_command(command);
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::UpdateExpectations(expectations) => {
                let summary = self.store.ingest(expectations);
                if summary.changed() {
                    debug!(
                        "ingested expectation set: +{} ~{} -{} invalid {}",
                        summary.inserted, summary.restarted, summary.removed, summary.invalid
                    );
                }
            }
            Command::UpdateContainers(containers) => {
                self.containers.ingest(containers);
            }
            Command::WorkerConnected(connection) => {
                self.pool.connect(connection);
                metrics::set_connected_workers(self.pool.connected_count());
                // A fresh worker may support expectations nobody could
                // take so far.
                for tracked in self.store.iter_mut() {
                    if matches!(
                        tracked.state,
                        ExpectationState::New
                            | ExpectationState::Waiting
                            | ExpectationState::Ready
                    ) {
                        tracked.dirty = true;
                    }
                }
            }
            Command::WorkerDisconnected(worker_id) => {
                if self.pool.disconnect(&worker_id) {
                    metrics::set_connected_workers(self.pool.connected_count());
                    self.purge_worker(&worker_id);
                }
            }
            Command::WorkEvent {
                worker_id,
                wip,
                event,
            } => self.handle_work_event(worker_id, wip, event),
            Command::AbortExpectation(id) => {
                if let Some(tracked) = self.store.get_mut(&id) {
                    info!(expectation_id = %id, "abort requested");
                    tracked.abort_requested = true;
                    tracked.dirty = true;
                }
            }
            Command::RestartExpectation(id) => {
                if let Some(tracked) = self.store.get_mut(&id) {
                    info!(expectation_id = %id, "restart requested");
                    tracked.state = ExpectationState::Restarted;
                    tracked.abort_requested = false;
                    tracked.dirty = true;
                }
            }
        }
    }

    fn handle_work_event(&mut self, worker_id: WorkerId, wip: WorkInProgressId, event: WorkEvent) {
        let target = self.store.iter_mut().find(|t| {
            t.assignment
                .as_ref()
                .is_some_and(|a| a.wip == wip && a.worker_id == worker_id)
        });
        match target {
            Some(tracked) => {
                tracked.pending_events.push(event);
                tracked.dirty = true;
            }
            None => {
                // Late event for cancelled or superseded work.
                debug!(worker_id = %worker_id, wip = %wip, "work event for unknown assignment, ignoring");
            }
        }
    }

    /// Removes a departed worker from every availability cache so it is
    /// not selected again until it reconnects and is re-probed.
    fn purge_worker(&mut self, worker_id: &WorkerId) {
        for tracked in self.store.iter_mut() {
            let was_available = tracked.available_workers.remove(worker_id).is_some();
            let was_assigned = tracked
                .assignment
                .as_ref()
                .is_some_and(|a| &a.worker_id == worker_id);
            if was_available || was_assigned {
                tracked.dirty = true;
            }
        }
    }

    pub(crate) async fn tick(&mut self) {
        let started = Instant::now();

        for id in self.store.snapshot_ids() {
            let due = self.store.get(&id).is_some_and(|t| t.is_due(started));
            if !due {
                continue;
            }
            let Some(mut tracked) = self.store.take(&id) else {
                continue;
            };

            tracked.dirty = false;
            tracked.session = Session::default();
            let before_state = tracked.state;
            let before_reason = tracked.reason.clone();
            let before_status = tracked.status.clone();

            if let Err(error) = self.evaluate_one(&mut tracked).await {
                self.apply_guard(&mut tracked, error);
            }
            tracked.last_evaluation = Some(Instant::now());

            let state_changed = tracked.state != before_state;
            let publish = state_changed
                || tracked.reason != before_reason
                || tracked.status != before_status;

            if state_changed {
                debug!(
                    expectation_id = %id,
                    "state {} -> {} ({})",
                    before_state, tracked.state, tracked.reason
                );
                metrics::record_transition(before_state, tracked.state);
            }

            if tracked.session.expectation_can_be_removed {
                info!(expectation_id = %id, "expectation fully removed, dropping");
                if let Some(assignment) = tracked.assignment.take() {
                    self.pool.unassign(&assignment.worker_id, &id);
                }
                self.publish_status(&tracked);
                continue;
            }

            if publish {
                self.publish_status(&tracked);
            }

            // Fulfillment changes wake up dependents, in both
            // directions: new fulfillment releases them, a lost one must
            // pull them back before they build on a stale dependency.
            let fulfillment_changed = state_changed
                && (tracked.state == ExpectationState::Fulfilled
                    || before_state == ExpectationState::Fulfilled);

            self.store.put_back(tracked);

            if fulfillment_changed {
                for dependent in self.store.dependents_of(&id) {
                    self.store.mark_dirty(&dependent);
                }
            }
        }

        metrics::observe_tick_seconds(started.elapsed().as_secs_f64());
    }

    async fn evaluate_one(&mut self, tracked: &mut TrackedExpectation) -> Result<(), EvalError> {
        if tracked.abort_requested
            && !matches!(
                tracked.state,
                ExpectationState::Aborted | ExpectationState::Removed
            )
        {
            self.cancel_assignment(tracked).await;
            self.transition(
                tracked,
                ExpectationState::Aborted,
                Reason::uniform("Aborted on request"),
            );
            return Ok(());
        }

        match tracked.state {
            ExpectationState::New => self.handle_new(tracked).await,
            ExpectationState::Waiting => self.handle_waiting(tracked).await,
            ExpectationState::Ready => self.handle_ready(tracked).await,
            ExpectationState::Working => self.handle_working(tracked).await,
            ExpectationState::Fulfilled => self.handle_fulfilled(tracked).await,
            ExpectationState::Removed => self.handle_removed(tracked).await,
            ExpectationState::Restarted => self.handle_restarted(tracked).await,
            ExpectationState::Aborted => Ok(()),
        }
    }

    /// The safety net at the loop boundary: no failure of a single
    /// evaluation may take down the loop. Transport failures are charged
    /// to the worker, definition problems park the expectation,
    /// everything else resets it to NEW.
    fn apply_guard(&mut self, tracked: &mut TrackedExpectation, error: EvalError) {
        match &error {
            EvalError::Internal(_) => {
                error!(
                    expectation_id = %tracked.exp.id,
                    "internal error during evaluation: {error}"
                );
            }
            _ => {
                warn!(
                    expectation_id = %tracked.exp.id,
                    "evaluation failed: {error}"
                );
            }
        }

        match error {
            EvalError::Config(detail) => {
                // Parked until upstream replaces the definition; no
                // retry can fix a broken declaration.
                tracked.state = ExpectationState::New;
                tracked.config_error = true;
                tracked.is_error = true;
                tracked.reason = Reason::new("Invalid expectation definition", detail);
            }
            EvalError::Transport(_) => {
                let summary = error.summary();
                self.fail_to_new(
                    tracked,
                    Reason::new("Lost contact with the worker", summary),
                    false,
                );
            }
            EvalError::WorkerReported(ref reason) => {
                let user = reason.user.clone();
                let summary = error.summary();
                self.fail_to_new(tracked, Reason::new(user, summary), true);
            }
            EvalError::Internal(_) => {
                let summary = error.summary();
                self.fail_to_new(
                    tracked,
                    Reason::new("Internal error, retrying", summary),
                    true,
                );
            }
        }
    }

    pub(crate) fn transition(
        &mut self,
        tracked: &mut TrackedExpectation,
        state: ExpectationState,
        reason: Reason,
    ) {
        tracked.state = state;
        tracked.reason = reason;
        tracked.is_error = false;
        tracked.next_evaluation = None;
    }

    /// Reset to NEW; when the failure is charged to the expectation the
    /// next evaluation is pushed out exponentially (with jitter so herds
    /// of equally-failing expectations spread out).
    pub(crate) fn fail_to_new(
        &mut self,
        tracked: &mut TrackedExpectation,
        reason: Reason,
        count_error: bool,
    ) {
        if let Some(assignment) = tracked.assignment.take() {
            self.pool.unassign(&assignment.worker_id, &tracked.exp.id);
        }
        tracked.status.work_progress = None;
        tracked.state = ExpectationState::New;
        tracked.is_error = true;
        tracked.last_error = Some(reason.clone());
        tracked.reason = reason;

        if count_error {
            tracked.error_count += 1;
            let backoff = self
                .config
                .backoff_base
                .saturating_mul(1u32 << tracked.error_count.min(20))
                .min(self.config.backoff_max);
            let jitter = rand::rng().random_range(0.8..1.2);
            tracked.next_evaluation = Some(Instant::now() + backoff.mul_f64(jitter));
        } else {
            tracked.next_evaluation = None;
        }
    }

    /// Best-effort cancel of running work; the state machine moves on
    /// without waiting for the worker to confirm.
    pub(crate) async fn cancel_assignment(&mut self, tracked: &mut TrackedExpectation) {
        let Some(assignment) = tracked.assignment.take() else {
            return;
        };
        self.pool.unassign(&assignment.worker_id, &tracked.exp.id);
        tracked.pending_events.clear();
        tracked.status.work_progress = None;

        if let Some(worker) = self.pool.get(&assignment.worker_id) {
            let api = worker.api.clone();
            let wip = assignment.wip;
            let worker_id = assignment.worker_id.clone();
            let timeout = self.config.rpc_timeout;
            tokio::spawn(async move {
                if let Err(err) =
                    crate::workers::with_rpc_timeout(timeout, api.cancel_work_in_progress(wip))
                        .await
                {
                    debug!(worker_id = %worker_id, wip = %wip, "cancel failed: {err}");
                }
            });
        }
    }

    pub(crate) fn publish_status(&self, tracked: &TrackedExpectation) {
        if tracked.exp.status_report.send_report {
            self.publisher.enqueue_expectation(tracked.status_report());
        }
    }

    /// Marks a worker disconnected after a failed call and purges it
    /// everywhere.
    pub(crate) fn worker_call_failed(&mut self, worker_id: &WorkerId) {
        if self.pool.disconnect(worker_id) {
            metrics::set_connected_workers(self.pool.connected_count());
        }
        self.purge_worker(worker_id);
    }

    /// Carries out container duties that are due: establish monitors and
    /// run cron jobs through a worker that can reach the container.
    pub(crate) async fn evaluate_containers(&mut self) {
        let now = Instant::now();
        for id in self.containers.due_ids(now) {
            let Some(mut tracked) = self.containers.take(&id) else {
                continue;
            };
            tracked.dirty = false;
            let before = (
                tracked.monitors_ok,
                tracked.reason.clone(),
                tracked.last_cron_run,
            );

            self.evaluate_container(&mut tracked).await;
            tracked.next_cron_run = Instant::now() + self.config.container_cron_interval;

            if (tracked.monitors_ok, &tracked.reason, tracked.last_cron_run)
                != (before.0, &before.1, before.2)
            {
                self.publisher.enqueue_container(tracked.status_report());
            }
            self.containers.put_back(tracked);
        }
    }

    async fn evaluate_container(&mut self, tracked: &mut crate::containers::TrackedPackageContainer) {
        // Prefer the worker already carrying this container's duties.
        let mut candidates: Vec<WorkerId> = Vec::new();
        if let Some(current) = tracked
            .monitor_worker
            .clone()
            .filter(|id| self.pool.is_connected(id))
        {
            candidates.push(current);
        }
        let mut rest: Vec<WorkerId> = self
            .pool
            .connected_workers()
            .map(|w| w.id.clone())
            .filter(|id| !candidates.contains(id))
            .collect();
        rest.sort();
        candidates.extend(rest);

        if candidates.is_empty() {
            tracked.monitors_ok = Some(false);
            tracked.monitor_worker = None;
            tracked.reason = Reason::uniform("No workers connected");
            return;
        }

        for worker_id in candidates {
            let Some(api) = self.pool.get(&worker_id).map(|w| w.api.clone()) else {
                continue;
            };

            if tracked.monitors_ok != Some(true) || tracked.monitor_worker.as_ref() != Some(&worker_id)
            {
                match crate::workers::with_rpc_timeout(
                    self.config.rpc_timeout,
                    api.setup_package_container_monitors(&tracked.def),
                )
                .await
                {
                    Ok(result) if result.ok => {
                        tracked.monitors_ok = Some(true);
                        tracked.monitor_worker = Some(worker_id.clone());
                        tracked.reason = result.reason;
                    }
                    Ok(result) => {
                        tracked.monitors_ok = Some(false);
                        tracked.reason = result.reason;
                        continue;
                    }
                    Err(err) => {
                        debug!(worker_id = %worker_id, container_id = %tracked.def.id, "monitor setup failed: {err}");
                        self.worker_call_failed(&worker_id);
                        continue;
                    }
                }
            }

            if tracked.def.cron_jobs.cleanup.is_some() {
                match crate::workers::with_rpc_timeout(
                    self.config.rpc_timeout,
                    api.run_package_container_cron_job(&tracked.def),
                )
                .await
                {
                    Ok(result) if result.ok => {
                        tracked.last_cron_run = Some(chrono::Utc::now());
                    }
                    Ok(result) => {
                        tracked.reason = result.reason;
                    }
                    Err(err) => {
                        debug!(worker_id = %worker_id, container_id = %tracked.def.id, "container cron failed: {err}");
                        self.worker_call_failed(&worker_id);
                        tracked.monitor_worker = None;
                        continue;
                    }
                }
            }
            return;
        }
    }
}
