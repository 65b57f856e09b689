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

//! Tracked package containers: mirror records for containers with
//! server-side duties (monitor setup, cron-like cleanup) carried out by
//! workers on the manager's schedule.

use chrono::{DateTime, Utc};
use package_manager_common::model::{
    ContainerId, ContainerStatusReport, ExpectedPackageContainer, Reason, WorkerId,
};
use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::{info, warn};

pub struct TrackedPackageContainer {
    pub def: ExpectedPackageContainer,
    pub monitors_ok: Option<bool>,
    /// The worker currently carrying this container's duties.
    pub monitor_worker: Option<WorkerId>,
    pub reason: Reason,
    pub last_cron_run: Option<DateTime<Utc>>,
    pub next_cron_run: Instant,
    /// The definition failed validation; duties are suspended until it
    /// changes.
    pub config_error: bool,
    pub dirty: bool,
}

impl TrackedPackageContainer {
    fn new(def: ExpectedPackageContainer) -> Self {
        Self {
            def,
            monitors_ok: None,
            monitor_worker: None,
            reason: Reason::uniform("Not yet checked"),
            last_cron_run: None,
            next_cron_run: Instant::now(),
            config_error: false,
            dirty: true,
        }
    }

    pub fn status_report(&self) -> ContainerStatusReport {
        ContainerStatusReport {
            id: self.def.id.clone(),
            monitors_ok: self.monitors_ok.unwrap_or(false),
            reason: self.reason.clone(),
            last_cron_run: self.last_cron_run,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Default)]
pub struct TrackedContainerStore {
    by_id: HashMap<ContainerId, TrackedPackageContainer>,
}

impl TrackedContainerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the container set; removed containers are dropped,
    /// changed ones get their duties re-established.
    pub fn ingest(&mut self, containers: Vec<ExpectedPackageContainer>) {
        let mut seen: HashSet<ContainerId> = HashSet::with_capacity(containers.len());

        for def in containers {
            let id = def.id.clone();
            seen.insert(id.clone());

            match self.by_id.entry(id.clone()) {
                Entry::Vacant(entry) => {
                    let mut tracked = TrackedPackageContainer::new(def);
                    validate(&mut tracked);
                    info!(container_id = %id, "tracking new package container");
                    entry.insert(tracked);
                }
                Entry::Occupied(mut entry) => {
                    let tracked = entry.get_mut();
                    if tracked.def != def {
                        info!(container_id = %id, "package container definition changed");
                        tracked.def = def;
                        tracked.monitors_ok = None;
                        tracked.monitor_worker = None;
                        tracked.config_error = false;
                        tracked.next_cron_run = Instant::now();
                        tracked.dirty = true;
                        validate(tracked);
                    }
                }
            }
        }

        self.by_id.retain(|id, _| {
            let keep = seen.contains(id);
            if !keep {
                info!(container_id = %id, "package container removed upstream");
            }
            keep
        });
    }

    pub fn get(&self, id: &ContainerId) -> Option<&TrackedPackageContainer> {
        self.by_id.get(id)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TrackedPackageContainer> {
        self.by_id.values_mut()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Containers whose duties are due now.
    pub fn due_ids(&self, now: Instant) -> Vec<ContainerId> {
        self.by_id
            .values()
            .filter(|t| !t.config_error && (t.dirty || t.next_cron_run <= now))
            .map(|t| t.def.id.clone())
            .collect()
    }

    pub fn take(&mut self, id: &ContainerId) -> Option<TrackedPackageContainer> {
        self.by_id.remove(id)
    }

    pub fn put_back(&mut self, tracked: TrackedPackageContainer) {
        self.by_id.insert(tracked.def.id.clone(), tracked);
    }
}

fn validate(tracked: &mut TrackedPackageContainer) {
    if let Err(reason) = tracked.def.container.validate() {
        warn!(container_id = %tracked.def.id, "invalid container definition: {reason}");
        tracked.config_error = true;
        tracked.monitors_ok = Some(false);
        tracked.reason = Reason::new("Invalid container definition", reason);
    }
}
