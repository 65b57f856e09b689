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

//! Per-state evaluation rules. Each handler applies at most one
//! transition and leaves scheduling hints (next evaluation, re-verify
//! deadline) on the tracked record.

use crate::error::EvalError;
use crate::evaluation::EvaluationLoop;
use crate::model::{Assignment, TrackedExpectation};
use crate::selection::select_worker;
use crate::workers::with_rpc_timeout;
use package_manager_common::api::{RpcError, WorkEvent, WorkOnResult, WorkerApi};
use package_manager_common::model::{ExpectationId, ExpectationState, Reason, WorkerId};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

impl EvaluationLoop {
    /// NEW: wait for dependencies, then find out whether anyone can do
    /// this at all.
    pub(crate) async fn handle_new(
        &mut self,
        tracked: &mut TrackedExpectation,
    ) -> Result<(), EvalError> {
        if let Some(unmet) = self.unmet_dependencies(tracked) {
            tracked.reason = Reason::new(
                format!("Waiting for {unmet}"),
                format!("dependency {unmet} is not fulfilled"),
            );
            tracked.is_error = false;
            return Ok(());
        }

        let outcome = select_worker(&mut self.pool, tracked, &self.config).await;
        for worker_id in &outcome.disconnected {
            self.worker_call_failed(worker_id);
        }

        if outcome.any_support_known {
            tracked.no_available_workers_reason = None;
            tracked.error_count = 0;
            self.transition(
                tracked,
                ExpectationState::Waiting,
                Reason::uniform("Waiting for a worker slot"),
            );
        } else {
            let reason = outcome
                .no_worker_reason
                .unwrap_or_else(|| Reason::uniform("No worker supports this Expectation"));
            tracked.no_available_workers_reason = Some(reason.clone());
            tracked.reason = reason;
            tracked.is_error = false;
        }
        Ok(())
    }

    /// WAITING: we know a capable worker exists; once one is free, ask
    /// it whether the work is already done, then whether it can start.
    pub(crate) async fn handle_waiting(
        &mut self,
        tracked: &mut TrackedExpectation,
    ) -> Result<(), EvalError> {
        if self.dependency_regressed(tracked) {
            return Ok(());
        }

        let outcome = select_worker(&mut self.pool, tracked, &self.config).await;
        for worker_id in &outcome.disconnected {
            self.worker_call_failed(worker_id);
        }

        let Some(worker_id) = outcome.worker else {
            if outcome.any_support_known {
                if let Some(reason) = outcome.no_worker_reason {
                    tracked.reason = reason;
                }
            } else {
                // Whatever supported it is gone; probe the fleet afresh.
                self.transition(
                    tracked,
                    ExpectationState::New,
                    outcome
                        .no_worker_reason
                        .unwrap_or_else(|| Reason::uniform("No worker supports this Expectation")),
                );
            }
            return Ok(());
        };
        tracked.session.assigned_worker = Some(worker_id.clone());
        let api = self.worker_api(&worker_id)?;

        let fulfilled = match with_rpc_timeout(
            self.config.rpc_timeout,
            api.is_expectation_fulfilled(&tracked.exp, false),
        )
        .await
        {
            Ok(result) => result,
            Err(err) => {
                self.handle_transport_failure(tracked, &worker_id, err);
                return Ok(());
            }
        };

        if fulfilled.fulfilled {
            if self.accept_fulfillment(tracked, &worker_id, fulfilled.actual_version_hash) {
                tracked.session.trigger_other_expectations_again = true;
                return Ok(());
            }
            // The worker considers an older revision fulfilled; fall
            // through and have it redone.
            debug!(
                expectation_id = %tracked.exp.id,
                "worker reports fulfilled with wrong version hash, redoing"
            );
        }

        let ready = match with_rpc_timeout(
            self.config.rpc_timeout,
            api.is_expectation_ready_to_start_working_on(&tracked.exp),
        )
        .await
        {
            Ok(result) => result,
            Err(err) => {
                self.handle_transport_failure(tracked, &worker_id, err);
                return Ok(());
            }
        };

        tracked.status.source_exists = ready.source_exists.or(tracked.status.source_exists);

        if ready.ready {
            self.transition(
                tracked,
                ExpectationState::Ready,
                Reason::uniform("Ready to start working"),
            );
        } else if ready.is_waiting_for_another {
            tracked.reason = ready.reason;
            tracked.is_error = false;
        } else {
            // Source missing or similar; start over with a fresh probe.
            self.transition(tracked, ExpectationState::New, ready.reason);
        }
        Ok(())
    }

    /// READY: hand the work to a worker.
    pub(crate) async fn handle_ready(
        &mut self,
        tracked: &mut TrackedExpectation,
    ) -> Result<(), EvalError> {
        if self.dependency_regressed(tracked) {
            return Ok(());
        }

        let outcome = select_worker(&mut self.pool, tracked, &self.config).await;
        for worker_id in &outcome.disconnected {
            self.worker_call_failed(worker_id);
        }

        let Some(worker_id) = outcome.worker else {
            self.transition(
                tracked,
                ExpectationState::New,
                outcome
                    .no_worker_reason
                    .unwrap_or_else(|| Reason::uniform("No worker available to start the work")),
            );
            return Ok(());
        };
        tracked.session.assigned_worker = Some(worker_id.clone());
        let api = self.worker_api(&worker_id)?;

        let result = match with_rpc_timeout(
            self.config.rpc_timeout,
            api.work_on_expectation(&tracked.exp),
        )
        .await
        {
            Ok(result) => result,
            Err(err) => {
                self.handle_transport_failure(tracked, &worker_id, err);
                return Ok(());
            }
        };

        match result {
            WorkOnResult::Accepted { wip } => {
                info!(
                    expectation_id = %tracked.exp.id,
                    worker_id = %worker_id,
                    wip = %wip,
                    "work started"
                );
                tracked.assignment = Some(Assignment {
                    worker_id: worker_id.clone(),
                    wip,
                });
                self.pool.assign(&worker_id, tracked.exp.id.clone());
                tracked.status.work_progress = Some(0.0);
                self.transition(
                    tracked,
                    ExpectationState::Working,
                    Reason::uniform("Working"),
                );
            }
            WorkOnResult::Rejected { reason } => {
                // Not the expectation's fault; re-plan without backoff.
                debug!(
                    expectation_id = %tracked.exp.id,
                    worker_id = %worker_id,
                    "work rejected: {reason}"
                );
                tracked.available_workers.remove(&worker_id);
                self.transition(tracked, ExpectationState::New, reason);
            }
        }
        Ok(())
    }

    /// WORKING: consume events pushed by the assigned worker; fall back
    /// to NEW when the worker is gone.
    pub(crate) async fn handle_working(
        &mut self,
        tracked: &mut TrackedExpectation,
    ) -> Result<(), EvalError> {
        let Some(assignment) = tracked.assignment.clone() else {
            return Err(EvalError::Internal(
                "WORKING expectation has no assignment".to_string(),
            ));
        };

        if !self
            .pool
            .has_assignment(&assignment.worker_id, &tracked.exp.id)
        {
            warn!(
                expectation_id = %tracked.exp.id,
                worker_id = %assignment.worker_id,
                "assigned worker disappeared while working"
            );
            tracked.pending_events.clear();
            self.fail_to_new(
                tracked,
                Reason::new(
                    "Worker disconnected during work",
                    format!("worker {} vanished", assignment.worker_id),
                ),
                false,
            );
            return Ok(());
        }

        if self.unmet_dependencies(tracked).is_some() {
            // A dependency was un-fulfilled underneath us; the output
            // may be built on a stale input.
            self.cancel_assignment(tracked).await;
            self.transition(
                tracked,
                ExpectationState::New,
                Reason::uniform("A dependency is no longer fulfilled"),
            );
            return Ok(());
        }

        for event in std::mem::take(&mut tracked.pending_events) {
            match event {
                WorkEvent::Progress { progress } => {
                    tracked.status.work_progress = Some(progress.clamp(0.0, 1.0));
                    tracked.reason = Reason::new(
                        format!("Working ({:.0}%)", progress.clamp(0.0, 1.0) * 100.0),
                        format!("progress {progress:.2} on {}", assignment.worker_id),
                    );
                }
                WorkEvent::Done {
                    actual_version_hash,
                    reason,
                } => {
                    self.pool.unassign(&assignment.worker_id, &tracked.exp.id);
                    tracked.assignment = None;
                    tracked.status.work_progress = None;
                    if self.accept_fulfillment(
                        tracked,
                        &assignment.worker_id,
                        Some(actual_version_hash.clone()),
                    ) {
                        tracked.session.trigger_other_expectations_again = true;
                        tracked.status.target_exists = Some(true);
                        debug!(expectation_id = %tracked.exp.id, "work done: {reason}");
                    } else {
                        return Err(EvalError::WorkerReported(Reason::new(
                            "Work produced an unexpected version",
                            format!(
                                "worker {} reported hash {:?}, expected {}",
                                assignment.worker_id,
                                actual_version_hash,
                                tracked.exp.content_version_hash
                            ),
                        )));
                    }
                    return Ok(());
                }
                WorkEvent::Error { reason } => {
                    self.pool.unassign(&assignment.worker_id, &tracked.exp.id);
                    tracked.assignment = None;
                    return Err(EvalError::WorkerReported(reason));
                }
            }
        }

        Ok(())
    }

    /// FULFILLED: cheap steady state; re-verify on a cadence, preferring
    /// the worker that did the work.
    pub(crate) async fn handle_fulfilled(
        &mut self,
        tracked: &mut TrackedExpectation,
    ) -> Result<(), EvalError> {
        let now = Instant::now();
        if tracked.next_reverify.is_some_and(|at| at > now) {
            tracked.next_evaluation = tracked.next_reverify;
            return Ok(());
        }

        let worker_id = match tracked
            .last_fulfilled_by
            .clone()
            .filter(|id| self.pool.is_connected(id))
        {
            Some(id) => Some(id),
            None => {
                let outcome = select_worker(&mut self.pool, tracked, &self.config).await;
                for worker_id in &outcome.disconnected {
                    self.worker_call_failed(worker_id);
                }
                outcome.worker
            }
        };

        let Some(worker_id) = worker_id else {
            // Nobody reachable to verify against; keep the state and try
            // again next interval.
            tracked.next_reverify = Some(now + self.config.fulfilled_reverify_interval);
            tracked.next_evaluation = tracked.next_reverify;
            return Ok(());
        };
        let api = self.worker_api(&worker_id)?;

        let result = match with_rpc_timeout(
            self.config.rpc_timeout,
            api.is_expectation_fulfilled(&tracked.exp, true),
        )
        .await
        {
            Ok(result) => result,
            Err(err) => {
                self.handle_transport_failure(tracked, &worker_id, err);
                return Ok(());
            }
        };

        if result.fulfilled {
            tracked.next_reverify = Some(now + self.config.fulfilled_reverify_interval);
            tracked.next_evaluation = tracked.next_reverify;
            tracked.reason = Reason::uniform("Fulfilled");
        } else {
            info!(
                expectation_id = %tracked.exp.id,
                "re-verification failed, redoing: {}",
                result.reason
            );
            tracked.status.actual_version_hash = None;
            tracked.status.target_exists = Some(false);
            tracked.next_reverify = None;
            self.transition(tracked, ExpectationState::New, result.reason);
        }
        Ok(())
    }

    /// REMOVED: run removal work if a worker can, then drop the record.
    pub(crate) async fn handle_removed(
        &mut self,
        tracked: &mut TrackedExpectation,
    ) -> Result<(), EvalError> {
        if let (Some(removed_at), Some(delay)) =
            (tracked.removed_at, tracked.exp.work_options.remove_delay)
        {
            let due_at = removed_at + delay;
            if due_at > Instant::now() {
                tracked.reason = Reason::uniform("Removal pending");
                tracked.next_evaluation = Some(due_at);
                return Ok(());
            }
        }

        // Work that already ran may have left a partial target behind.
        let had_running_work = tracked.assignment.is_some();
        self.cancel_assignment(tracked).await;

        let needs_removal = had_running_work
            || tracked.status.target_exists == Some(true)
            || tracked.status.actual_version_hash.is_some();
        if !needs_removal {
            tracked.session.expectation_can_be_removed = true;
            tracked.reason = Reason::uniform("Removed");
            return Ok(());
        }

        let outcome = select_worker(&mut self.pool, tracked, &self.config).await;
        for worker_id in &outcome.disconnected {
            self.worker_call_failed(worker_id);
        }

        let Some(worker_id) = outcome.worker else {
            tracked.error_count += 1;
            if tracked.error_count >= 3 {
                // Nobody can reach the target; give up rather than hold
                // the record forever.
                warn!(
                    expectation_id = %tracked.exp.id,
                    "no worker available for removal work, dropping anyway"
                );
                tracked.session.expectation_can_be_removed = true;
                tracked.reason = Reason::uniform("Removed (removal work skipped)");
            } else {
                tracked.reason = Reason::uniform("Waiting for a worker to remove the package");
            }
            return Ok(());
        };
        let api = self.worker_api(&worker_id)?;

        match with_rpc_timeout(
            self.config.rpc_timeout,
            api.remove_expectation(&tracked.exp),
        )
        .await
        {
            Ok(result) if result.removed => {
                tracked.session.expectation_can_be_removed = true;
                tracked.reason = Reason::uniform("Removed");
            }
            Ok(result) => {
                tracked.error_count += 1;
                tracked.reason = result.reason;
                if tracked.error_count >= 3 {
                    warn!(
                        expectation_id = %tracked.exp.id,
                        "removal work keeps failing, dropping anyway: {}",
                        tracked.reason
                    );
                    tracked.session.expectation_can_be_removed = true;
                }
            }
            Err(err) => {
                self.worker_call_failed(&worker_id);
                tracked.reason = Reason::new(
                    "Lost contact with the worker during removal",
                    err.to_string(),
                );
            }
        }
        Ok(())
    }

    /// RESTARTED: abort whatever is running, swap in the new definition
    /// and start from scratch.
    pub(crate) async fn handle_restarted(
        &mut self,
        tracked: &mut TrackedExpectation,
    ) -> Result<(), EvalError> {
        self.cancel_assignment(tracked).await;

        let mut definition_changed = false;
        if let Some((definition, hash)) = tracked.next_definition.take() {
            tracked.exp = definition;
            tracked.definition_hash = hash;
            definition_changed = true;
        }

        tracked.status = Default::default();
        tracked.pending_events.clear();
        tracked.available_workers.clear();
        tracked.queried_workers.clear();
        tracked.no_available_workers_reason = None;
        tracked.error_count = 0;
        tracked.last_error = None;
        tracked.last_fulfilled_by = None;
        tracked.next_reverify = None;
        tracked.removed_at = None;

        self.transition(tracked, ExpectationState::New, Reason::uniform("Restarted"));

        if definition_changed {
            if let Err(reason) = crate::store::validate_expectation(&tracked.exp) {
                return Err(EvalError::Config(reason));
            }
        }
        Ok(())
    }

    /// Fulfillment bookkeeping shared by the WAITING shortcut and the
    /// WORKING completion path. Returns false when the reported version
    /// does not match the declared one.
    fn accept_fulfillment(
        &mut self,
        tracked: &mut TrackedExpectation,
        worker_id: &WorkerId,
        actual_version_hash: Option<String>,
    ) -> bool {
        let Some(hash) = actual_version_hash else {
            return false;
        };
        if hash != tracked.exp.content_version_hash {
            return false;
        }
        tracked.status.actual_version_hash = Some(hash);
        tracked.last_fulfilled_by = Some(worker_id.clone());
        tracked.error_count = 0;
        tracked.last_error = None;
        tracked.next_reverify =
            Some(Instant::now() + self.config.fulfilled_reverify_interval);
        self.transition(
            tracked,
            ExpectationState::Fulfilled,
            Reason::uniform("Fulfilled"),
        );
        tracked.next_evaluation = tracked.next_reverify;
        true
    }

    /// Ids in `depends_on_fulfilled` that are not FULFILLED, rendered
    /// for reasons; `None` when all are met.
    fn unmet_dependencies(&self, tracked: &TrackedExpectation) -> Option<String> {
        let unmet: Vec<&ExpectationId> = tracked
            .exp
            .depends_on_fulfilled
            .iter()
            .filter(|id| !self.store.is_fulfilled(id))
            .collect();
        if unmet.is_empty() {
            None
        } else {
            Some(
                unmet
                    .iter()
                    .map(|id| id.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            )
        }
    }

    /// Pulls an expectation back to NEW when a dependency regressed
    /// while it sat in WAITING or READY.
    fn dependency_regressed(&mut self, tracked: &mut TrackedExpectation) -> bool {
        if let Some(unmet) = self.unmet_dependencies(tracked) {
            self.transition(
                tracked,
                ExpectationState::New,
                Reason::new(
                    format!("Waiting for {unmet}"),
                    format!("dependency {unmet} regressed"),
                ),
            );
            true
        } else {
            false
        }
    }

    fn worker_api(&self, worker_id: &WorkerId) -> Result<Arc<dyn WorkerApi>, EvalError> {
        self.pool
            .get(worker_id)
            .map(|w| w.api.clone())
            .ok_or_else(|| {
                EvalError::Internal(format!("selected worker {worker_id} is not in the pool"))
            })
    }

    /// Transport failure while talking to a specific worker: the worker
    /// is charged, the expectation is re-planned without backoff.
    fn handle_transport_failure(
        &mut self,
        tracked: &mut TrackedExpectation,
        worker_id: &WorkerId,
        err: RpcError,
    ) {
        warn!(
            expectation_id = %tracked.exp.id,
            worker_id = %worker_id,
            "worker call failed: {err}"
        );
        self.worker_call_failed(worker_id);
        tracked.available_workers.remove(worker_id);
        self.fail_to_new(
            tracked,
            Reason::new("Lost contact with the worker", err.to_string()),
            false,
        );
    }
}
