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

use chrono::Utc;
use package_manager_common::api::WorkEvent;
use package_manager_common::model::{
    Expectation, ExpectationState, ExpectationStatus, ExpectationStatusReport, Reason,
    WorkInProgressId, WorkerId,
};
use std::collections::HashMap;
use std::time::Instant;

/// A positive capability answer remembered from a probe.
#[derive(Debug, Clone)]
pub struct Availability {
    pub cost: f64,
    pub expires: Instant,
}

/// The one worker allowed to be working on an expectation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub worker_id: WorkerId,
    pub wip: WorkInProgressId,
}

/// Per-evaluation scratch, cleared before each evaluation.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub assigned_worker: Option<WorkerId>,
    /// Dependents wake up within the same tick instead of the next one.
    pub trigger_other_expectations_again: bool,
    pub expectation_can_be_removed: bool,
}

/// The manager's live record of one expectation.
pub struct TrackedExpectation {
    pub exp: Expectation,
    pub state: ExpectationState,
    pub reason: Reason,
    pub status: ExpectationStatus,
    pub is_error: bool,
    pub last_evaluation: Option<Instant>,
    /// Do not evaluate again before this; `None` means next tick.
    pub next_evaluation: Option<Instant>,
    pub available_workers: HashMap<WorkerId, Availability>,
    /// Last probe time per worker; doubles as the negative-answer cache.
    pub queried_workers: HashMap<WorkerId, Instant>,
    pub no_available_workers_reason: Option<Reason>,
    pub session: Session,
    pub error_count: u32,
    pub last_error: Option<Reason>,
    pub assignment: Option<Assignment>,
    /// Work events pushed by the assigned worker, consumed on the next
    /// evaluation of the WORKING state.
    pub pending_events: Vec<WorkEvent>,
    pub last_fulfilled_by: Option<WorkerId>,
    pub next_reverify: Option<Instant>,
    /// Structural hash of `exp`, used to detect changed definitions.
    pub definition_hash: String,
    /// Replacement definition waiting for the RESTARTED flow to finish.
    pub next_definition: Option<(Expectation, String)>,
    pub abort_requested: bool,
    pub removed_at: Option<Instant>,
    /// The definition failed validation; parked until it changes.
    pub config_error: bool,
    pub dirty: bool,
}

impl TrackedExpectation {
    pub fn new(exp: Expectation, definition_hash: String) -> Self {
        Self {
            exp,
            state: ExpectationState::New,
            reason: Reason::uniform("Not yet evaluated"),
            status: ExpectationStatus::default(),
            is_error: false,
            last_evaluation: None,
            next_evaluation: None,
            available_workers: HashMap::new(),
            queried_workers: HashMap::new(),
            no_available_workers_reason: None,
            session: Session::default(),
            error_count: 0,
            last_error: None,
            assignment: None,
            pending_events: Vec::new(),
            last_fulfilled_by: None,
            next_reverify: None,
            definition_hash,
            next_definition: None,
            abort_requested: false,
            removed_at: None,
            config_error: false,
            dirty: true,
        }
    }

    pub fn status_report(&self) -> ExpectationStatusReport {
        ExpectationStatusReport {
            id: self.exp.id.clone(),
            state: self.state,
            reason: self.reason.clone(),
            status: self.status.clone(),
            is_error: self.is_error,
            updated_at: Utc::now(),
        }
    }

    /// Due for evaluation on this tick?
    pub fn is_due(&self, now: Instant) -> bool {
        if self.config_error && !self.dirty {
            return false;
        }
        self.dirty || self.next_evaluation.is_none_or(|at| at <= now)
    }
}

/// Evaluation order within one priority: cheapest-to-settle states
/// first, so re-verification failures free capacity before waiting
/// expectations ask for it.
pub fn state_class_rank(state: ExpectationState) -> u8 {
    match state {
        ExpectationState::Fulfilled => 0,
        ExpectationState::Working => 1,
        ExpectationState::Ready => 2,
        ExpectationState::Waiting => 3,
        ExpectationState::New => 4,
        ExpectationState::Removed => 5,
        ExpectationState::Restarted => 6,
        ExpectationState::Aborted => 7,
    }
}
