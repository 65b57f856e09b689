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

//! The authoritative in-memory table of tracked expectations, keyed by
//! expectation id. Owned and mutated only by the evaluation loop.

use crate::model::{state_class_rank, TrackedExpectation};
use package_manager_common::hash::structural_hash;
use package_manager_common::model::{
    Expectation, ExpectationId, ExpectationState, Reason,
};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub inserted: usize,
    pub restarted: usize,
    pub removed: usize,
    pub invalid: usize,
}

impl IngestSummary {
    pub fn changed(&self) -> bool {
        *self != IngestSummary::default()
    }
}

#[derive(Default)]
pub struct TrackedExpectationStore {
    by_id: HashMap<ExpectationId, TrackedExpectation>,
}

impl TrackedExpectationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the expected set. New ids are inserted in NEW; known ids
    /// with a changed definition go through RESTARTED; known ids absent
    /// from the set go through REMOVED. Ingesting an identical set is a
    /// no-op.
    pub fn ingest(&mut self, expectations: Vec<Expectation>) -> IngestSummary {
        let mut summary = IngestSummary::default();
        let mut seen: HashSet<ExpectationId> = HashSet::with_capacity(expectations.len());

        for exp in expectations {
            let id = exp.id.clone();
            seen.insert(id.clone());

            let hash = match structural_hash(&exp) {
                Ok(hash) => hash,
                Err(err) => {
                    // Serialization of our own model failing is an
                    // internal bug, not an upstream problem.
                    warn!(expectation_id = %id, "failed to hash expectation definition: {err}");
                    continue;
                }
            };

            match self.by_id.entry(id.clone()) {
                Entry::Vacant(entry) => {
                    let mut tracked = TrackedExpectation::new(exp, hash);
                    if let Err(reason) = validate_expectation(&tracked.exp) {
                        mark_config_error(&mut tracked, reason);
                        summary.invalid += 1;
                    }
                    info!(expectation_id = %id, "tracking new expectation");
                    entry.insert(tracked);
                    summary.inserted += 1;
                }
                Entry::Occupied(mut entry) => {
                    let tracked = entry.get_mut();
                    if tracked.removed_at.is_some() {
                        // It came back before removal work finished.
                        tracked.removed_at = None;
                        tracked.state = ExpectationState::Restarted;
                        tracked.next_definition = Some((exp, hash));
                        tracked.dirty = true;
                        summary.restarted += 1;
                    } else if tracked.definition_hash != hash {
                        info!(expectation_id = %id, "expectation definition changed, restarting");
                        tracked.state = ExpectationState::Restarted;
                        tracked.next_definition = Some((exp, hash));
                        tracked.config_error = false;
                        tracked.dirty = true;
                        summary.restarted += 1;
                    }
                }
            }
        }

        let gone: Vec<ExpectationId> = self
            .by_id
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for id in gone {
            let tracked = self.by_id.get_mut(&id).expect("id collected above");
            if tracked.state != ExpectationState::Removed {
                info!(expectation_id = %id, "expectation removed upstream");
                tracked.state = ExpectationState::Removed;
                tracked.reason = Reason::uniform("Removed upstream");
                tracked.removed_at = Some(Instant::now());
                tracked.dirty = true;
                summary.removed += 1;
            }
        }

        summary
    }

    pub fn get(&self, id: &ExpectationId) -> Option<&TrackedExpectation> {
        self.by_id.get(id)
    }

    pub fn get_mut(&mut self, id: &ExpectationId) -> Option<&mut TrackedExpectation> {
        self.by_id.get_mut(id)
    }

    /// Detaches the record so it can be evaluated while the rest of the
    /// table stays borrowable; pair with [`put_back`](Self::put_back).
    pub fn take(&mut self, id: &ExpectationId) -> Option<TrackedExpectation> {
        self.by_id.remove(id)
    }

    pub fn put_back(&mut self, tracked: TrackedExpectation) {
        self.by_id.insert(tracked.exp.id.clone(), tracked);
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrackedExpectation> {
        self.by_id.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TrackedExpectation> {
        self.by_id.values_mut()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn mark_dirty(&mut self, id: &ExpectationId) {
        if let Some(tracked) = self.by_id.get_mut(id) {
            tracked.dirty = true;
        }
    }

    pub fn any_dirty(&self) -> bool {
        self.by_id.values().any(|t| t.dirty)
    }

    pub fn is_fulfilled(&self, id: &ExpectationId) -> bool {
        self.by_id
            .get(id)
            .is_some_and(|t| t.state == ExpectationState::Fulfilled)
    }

    /// Evaluation order: priority ascending, then state class, then id.
    pub fn snapshot_ids(&self) -> Vec<ExpectationId> {
        let mut ids: Vec<&TrackedExpectation> = self.by_id.values().collect();
        ids.sort_by(|a, b| {
            a.exp
                .priority
                .cmp(&b.exp.priority)
                .then_with(|| state_class_rank(a.state).cmp(&state_class_rank(b.state)))
                .then_with(|| a.exp.id.cmp(&b.exp.id))
        });
        ids.into_iter().map(|t| t.exp.id.clone()).collect()
    }

    /// Everyone that should wake up when `id` becomes fulfilled: both
    /// explicit trigger subscriptions and dependency waiters.
    pub fn dependents_of(&self, id: &ExpectationId) -> Vec<ExpectationId> {
        self.by_id
            .values()
            .filter(|t| {
                t.exp.triggered_by_fulfilled_ids.contains(id)
                    || t.exp.depends_on_fulfilled.contains(id)
            })
            .map(|t| t.exp.id.clone())
            .collect()
    }
}

fn mark_config_error(tracked: &mut TrackedExpectation, reason: String) {
    warn!(expectation_id = %tracked.exp.id, "invalid expectation definition: {reason}");
    tracked.config_error = true;
    tracked.is_error = true;
    tracked.reason = Reason::new("Invalid expectation definition", reason);
    tracked.dirty = false;
}

/// Definition-level validation; failures park the expectation until
/// upstream replaces it.
pub(crate) fn validate_expectation(exp: &Expectation) -> Result<(), String> {
    if exp.start_requirement.sources.is_empty() {
        return Err("expectation has no sources".to_string());
    }
    if exp.end_requirement.targets.is_empty() {
        return Err("expectation has no targets".to_string());
    }
    if exp.content_version_hash.is_empty() {
        return Err("expectation has no content version hash".to_string());
    }
    for source in &exp.start_requirement.sources {
        if source.accessors.is_empty() {
            return Err(format!(
                "source container \"{}\" has no accessors",
                source.label
            ));
        }
        for (id, accessor) in &source.accessors {
            accessor
                .validate()
                .map_err(|e| format!("source accessor \"{id}\": {e}"))?;
            if !accessor.allow_read {
                return Err(format!("source accessor \"{id}\" does not allow reading"));
            }
        }
    }
    for target in &exp.end_requirement.targets {
        if target.accessors.is_empty() {
            return Err(format!(
                "target container \"{}\" has no accessors",
                target.label
            ));
        }
        for (id, accessor) in &target.accessors {
            accessor
                .validate()
                .map_err(|e| format!("target accessor \"{id}\": {e}"))?;
        }
    }
    if exp.depends_on_fulfilled.contains(&exp.id) {
        return Err("expectation depends on itself".to_string());
    }
    Ok(())
}
