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

//! The manager-side view of connected workers and their assignments.

use package_manager_common::api::{RpcError, WorkerApi, WorkerCapabilities, WorkerConnection};
use package_manager_common::model::{ExpectationId, WorkerId};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

pub struct WorkerAgentView {
    pub id: WorkerId,
    pub api: Arc<dyn WorkerApi>,
    pub capabilities: WorkerCapabilities,
    pub connected: bool,
    pub last_seen: Instant,
    pub current_assignments: HashSet<ExpectationId>,
}

impl WorkerAgentView {
    pub fn is_idle(&self) -> bool {
        self.connected && self.current_assignments.len() < self.capabilities.concurrency_limit
    }
}

#[derive(Default)]
pub struct WorkerPool {
    workers: HashMap<WorkerId, WorkerAgentView>,
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// A (re)connecting worker starts with a clean assignment slate; any
    /// work it was assigned before is treated as lost and re-planned by
    /// the per-expectation evaluation.
    pub fn connect(&mut self, connection: WorkerConnection) {
        info!(worker_id = %connection.id, "worker connected");
        self.workers.insert(
            connection.id.clone(),
            WorkerAgentView {
                id: connection.id,
                api: connection.api,
                capabilities: connection.capabilities,
                connected: true,
                last_seen: Instant::now(),
                current_assignments: HashSet::new(),
            },
        );
    }

    pub fn disconnect(&mut self, id: &WorkerId) -> bool {
        match self.workers.get_mut(id) {
            Some(worker) if worker.connected => {
                info!(worker_id = %id, "worker disconnected");
                worker.connected = false;
                worker.current_assignments.clear();
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: &WorkerId) -> Option<&WorkerAgentView> {
        self.workers.get(id)
    }

    pub fn is_connected(&self, id: &WorkerId) -> bool {
        self.workers.get(id).is_some_and(|w| w.connected)
    }

    pub fn has_assignment(&self, id: &WorkerId, exp: &ExpectationId) -> bool {
        self.workers
            .get(id)
            .is_some_and(|w| w.connected && w.current_assignments.contains(exp))
    }

    pub fn assign(&mut self, id: &WorkerId, exp: ExpectationId) {
        if let Some(worker) = self.workers.get_mut(id) {
            worker.current_assignments.insert(exp);
        }
    }

    pub fn unassign(&mut self, id: &WorkerId, exp: &ExpectationId) {
        if let Some(worker) = self.workers.get_mut(id) {
            worker.current_assignments.remove(exp);
        }
    }

    pub fn connected_workers(&self) -> impl Iterator<Item = &WorkerAgentView> {
        self.workers.values().filter(|w| w.connected)
    }

    pub fn connected_count(&self) -> usize {
        self.workers.values().filter(|w| w.connected).count()
    }
}

/// Bounds a worker or upstream call; an elapsed timeout is a transport
/// error like any other.
pub async fn with_rpc_timeout<T, F>(timeout: Duration, call: F) -> Result<T, RpcError>
where
    F: Future<Output = Result<T, RpcError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(RpcError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use package_manager_common::api::{
        ContainerMonitorResult, CostResult, FulfilledResult, ReadyResult, RemoveResult,
        SupportResult, WorkOnResult,
    };
    use package_manager_common::model::{Expectation, ExpectedPackageContainer, WorkInProgressId};
    use test_r::test;

    struct UnreachableWorker;

    #[async_trait]
    impl WorkerApi for UnreachableWorker {
        async fn do_you_support_expectation(
            &self,
            _exp: &Expectation,
        ) -> Result<SupportResult, RpcError> {
            Err(RpcError::Unreachable("test".to_string()))
        }

        async fn get_cost_for_expectation(
            &self,
            _exp: &Expectation,
        ) -> Result<CostResult, RpcError> {
            Err(RpcError::Unreachable("test".to_string()))
        }

        async fn is_expectation_ready_to_start_working_on(
            &self,
            _exp: &Expectation,
        ) -> Result<ReadyResult, RpcError> {
            Err(RpcError::Unreachable("test".to_string()))
        }

        async fn is_expectation_fulfilled(
            &self,
            _exp: &Expectation,
            _was_fulfilled: bool,
        ) -> Result<FulfilledResult, RpcError> {
            Err(RpcError::Unreachable("test".to_string()))
        }

        async fn work_on_expectation(
            &self,
            _exp: &Expectation,
        ) -> Result<WorkOnResult, RpcError> {
            Err(RpcError::Unreachable("test".to_string()))
        }

        async fn remove_expectation(&self, _exp: &Expectation) -> Result<RemoveResult, RpcError> {
            Err(RpcError::Unreachable("test".to_string()))
        }

        async fn cancel_work_in_progress(&self, _wip: WorkInProgressId) -> Result<(), RpcError> {
            Ok(())
        }

        async fn setup_package_container_monitors(
            &self,
            _container: &ExpectedPackageContainer,
        ) -> Result<ContainerMonitorResult, RpcError> {
            Err(RpcError::Unreachable("test".to_string()))
        }

        async fn run_package_container_cron_job(
            &self,
            _container: &ExpectedPackageContainer,
        ) -> Result<ContainerMonitorResult, RpcError> {
            Err(RpcError::Unreachable("test".to_string()))
        }
    }

    fn connection(id: &str, limit: usize) -> WorkerConnection {
        WorkerConnection {
            id: WorkerId::from(id),
            capabilities: WorkerCapabilities {
                concurrency_limit: limit,
            },
            api: Arc::new(UnreachableWorker),
        }
    }

    #[test]
    fn idle_follows_assignment_count() {
        let mut pool = WorkerPool::new();
        pool.connect(connection("w1", 1));
        assert!(pool.get(&WorkerId::from("w1")).unwrap().is_idle());

        pool.assign(&WorkerId::from("w1"), ExpectationId::from("exp1"));
        assert!(!pool.get(&WorkerId::from("w1")).unwrap().is_idle());

        pool.unassign(&WorkerId::from("w1"), &ExpectationId::from("exp1"));
        assert!(pool.get(&WorkerId::from("w1")).unwrap().is_idle());
    }

    #[test]
    fn reconnect_clears_assignments() {
        let mut pool = WorkerPool::new();
        pool.connect(connection("w1", 1));
        pool.assign(&WorkerId::from("w1"), ExpectationId::from("exp1"));
        pool.disconnect(&WorkerId::from("w1"));
        pool.connect(connection("w1", 1));
        assert!(pool.get(&WorkerId::from("w1")).unwrap().is_idle());
        assert!(!pool.has_assignment(&WorkerId::from("w1"), &ExpectationId::from("exp1")));
    }

    #[test]
    async fn rpc_timeout_maps_to_transport_error() {
        let result: Result<(), RpcError> = with_rpc_timeout(Duration::from_millis(5), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(RpcError::Timeout(_))));
    }
}
