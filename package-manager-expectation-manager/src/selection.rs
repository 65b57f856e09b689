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

//! Worker selection for one evaluation: use remembered availability when
//! it still holds, otherwise probe a bounded number of workers, then
//! pick the cheapest idle candidate with a deterministic id tiebreak.

use crate::config::ExpectationManagerConfig;
use crate::model::{Availability, TrackedExpectation};
use crate::workers::{with_rpc_timeout, WorkerPool};
use package_manager_common::model::{Reason, WorkerId};
use std::time::Instant;
use tracing::debug;

pub struct SelectionOutcome {
    pub worker: Option<WorkerId>,
    /// Filled in when `worker` is `None`.
    pub no_worker_reason: Option<Reason>,
    /// At least one worker is known to support the expectation, even if
    /// none is free right now.
    pub any_support_known: bool,
    /// Workers that failed at the transport level during probing; the
    /// caller purges them pool-wide.
    pub disconnected: Vec<WorkerId>,
}

pub async fn select_worker(
    pool: &mut WorkerPool,
    tracked: &mut TrackedExpectation,
    config: &ExpectationManagerConfig,
) -> SelectionOutcome {
    let now = Instant::now();
    prune_caches(pool, tracked, config, now);

    let mut disconnected = Vec::new();

    if pick_idle(pool, tracked).is_none() {
        probe_workers(pool, tracked, config, &mut disconnected, now).await;
        for id in &disconnected {
            pool.disconnect(id);
        }
    }

    let worker = pick_idle(pool, tracked);
    let any_support_known = !tracked.available_workers.is_empty();
    let no_worker_reason = if worker.is_some() {
        None
    } else if pool.connected_count() == 0 {
        Some(Reason::uniform("No workers connected"))
    } else if any_support_known {
        Some(Reason::new(
            "Waiting for a free worker",
            format!(
                "{} capable worker(s), all at capacity",
                tracked.available_workers.len()
            ),
        ))
    } else {
        Some(Reason::new(
            "No worker supports this Expectation",
            format!(
                "{} connected worker(s), {} probed negative",
                pool.connected_count(),
                tracked.queried_workers.len()
            ),
        ))
    };

    SelectionOutcome {
        worker,
        no_worker_reason,
        any_support_known,
        disconnected,
    }
}

fn prune_caches(
    pool: &WorkerPool,
    tracked: &mut TrackedExpectation,
    config: &ExpectationManagerConfig,
    now: Instant,
) {
    tracked
        .available_workers
        .retain(|id, availability| availability.expires > now && pool.is_connected(id));
    // Negative answers age out so a disconnect or a capability change
    // does not exclude a worker forever.
    tracked
        .queried_workers
        .retain(|_, queried_at| now.duration_since(*queried_at) < config.unsupported_worker_ttl);
}

/// Cheapest idle worker among the remembered availability, ties broken
/// by worker id.
fn pick_idle(pool: &WorkerPool, tracked: &TrackedExpectation) -> Option<WorkerId> {
    tracked
        .available_workers
        .iter()
        .filter(|(id, _)| pool.get(id).is_some_and(|w| w.is_idle()))
        .min_by(|(id_a, a), (id_b, b)| {
            a.cost
                .partial_cmp(&b.cost)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| id_a.cmp(id_b))
        })
        .map(|(id, _)| id.clone())
}

async fn probe_workers(
    pool: &WorkerPool,
    tracked: &mut TrackedExpectation,
    config: &ExpectationManagerConfig,
    disconnected: &mut Vec<WorkerId>,
    now: Instant,
) {
    let mut candidates: Vec<_> = pool
        .connected_workers()
        .filter(|w| {
            !tracked.available_workers.contains_key(&w.id)
                && !tracked.queried_workers.contains_key(&w.id)
        })
        .map(|w| (w.id.clone(), w.api.clone()))
        .collect();
    candidates.sort_by(|(a, _), (b, _)| a.cmp(b));
    candidates.truncate(config.probe_budget);

    for (worker_id, api) in candidates {
        tracked.queried_workers.insert(worker_id.clone(), now);

        let support = match with_rpc_timeout(
            config.rpc_timeout,
            api.do_you_support_expectation(&tracked.exp),
        )
        .await
        {
            Ok(support) => support,
            Err(err) => {
                debug!(worker_id = %worker_id, "support probe failed: {err}");
                disconnected.push(worker_id);
                continue;
            }
        };

        if !support.support {
            debug!(
                worker_id = %worker_id,
                expectation_id = %tracked.exp.id,
                "worker does not support expectation: {}",
                support.reason
            );
            continue;
        }

        let cost = match with_rpc_timeout(
            config.rpc_timeout,
            api.get_cost_for_expectation(&tracked.exp),
        )
        .await
        {
            Ok(cost) => cost.cost,
            Err(err) => {
                debug!(worker_id = %worker_id, "cost query failed: {err}");
                disconnected.push(worker_id);
                continue;
            }
        };

        // A positive answer supersedes the probe rate limit.
        tracked.queried_workers.remove(&worker_id);
        tracked.available_workers.insert(
            worker_id,
            Availability {
                cost,
                expires: now + config.available_worker_ttl,
            },
        );
    }
}
