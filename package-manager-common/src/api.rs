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

//! The logical RPC spoken between the expectation manager, the workforce
//! and the workers. Callers hold `Arc<dyn …>` handles; a deployment binds
//! these traits to its transport of choice, tests bind them in-process.

use crate::model::{
    ContainerStatusReport, Expectation, ExpectationStatusReport, ExpectedPackageContainer,
    ManagerId, Reason, WorkInProgressId, WorkerId,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Transport-level failure of a single call. Never counted against the
/// expectation being evaluated; always counted against the peer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportResult {
    pub support: bool,
    pub reason: Reason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostResult {
    /// Relative cost of this worker doing this work, factoring network
    /// locality and current load. Lower is better.
    pub cost: f64,
    pub reason: Option<Reason>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyResult {
    pub ready: bool,
    /// The worker is waiting for some other work to land first (e.g. the
    /// source is still being written); not an error, stay in WAITING.
    #[serde(default)]
    pub is_waiting_for_another: bool,
    pub source_exists: Option<bool>,
    pub reason: Reason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FulfilledResult {
    pub fulfilled: bool,
    pub actual_version_hash: Option<String>,
    pub reason: Reason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveResult {
    pub removed: bool,
    pub reason: Reason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerMonitorResult {
    pub ok: bool,
    pub reason: Reason,
}

/// Static facts a worker declares about itself when connecting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerCapabilities {
    /// How many expectations the worker accepts concurrently.
    pub concurrency_limit: usize,
}

impl Default for WorkerCapabilities {
    fn default() -> Self {
        Self {
            concurrency_limit: 1,
        }
    }
}

/// Progress pushed from a worker to the manager that started the work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkEvent {
    Progress { progress: f64 },
    Done { actual_version_hash: String, reason: Reason },
    Error { reason: Reason },
}

/// Outcome of asking a worker to start working. Rejection is a normal
/// protocol answer (worker saturated, source just vanished), distinct
/// from transport failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkOnResult {
    Accepted { wip: WorkInProgressId },
    Rejected { reason: Reason },
}

/// The job and capability-probe API every worker exposes to expectation
/// managers.
#[async_trait]
pub trait WorkerApi: Send + Sync {
    async fn do_you_support_expectation(
        &self,
        exp: &Expectation,
    ) -> Result<SupportResult, RpcError>;

    async fn get_cost_for_expectation(&self, exp: &Expectation) -> Result<CostResult, RpcError>;

    async fn is_expectation_ready_to_start_working_on(
        &self,
        exp: &Expectation,
    ) -> Result<ReadyResult, RpcError>;

    async fn is_expectation_fulfilled(
        &self,
        exp: &Expectation,
        was_fulfilled: bool,
    ) -> Result<FulfilledResult, RpcError>;

    /// On acceptance, progress streams back through
    /// [`ManagerApi::notify_work_event`] under the returned id.
    async fn work_on_expectation(&self, exp: &Expectation) -> Result<WorkOnResult, RpcError>;

    async fn remove_expectation(&self, exp: &Expectation) -> Result<RemoveResult, RpcError>;

    /// Best-effort; a worker may already have finished or never have
    /// known the id.
    async fn cancel_work_in_progress(&self, wip: WorkInProgressId) -> Result<(), RpcError>;

    async fn setup_package_container_monitors(
        &self,
        container: &ExpectedPackageContainer,
    ) -> Result<ContainerMonitorResult, RpcError>;

    async fn run_package_container_cron_job(
        &self,
        container: &ExpectedPackageContainer,
    ) -> Result<ContainerMonitorResult, RpcError>;
}

/// The surface a worker uses to talk back to an expectation manager it
/// has connected to.
#[async_trait]
pub trait ManagerApi: Send + Sync {
    async fn notify_work_event(
        &self,
        worker_id: &WorkerId,
        wip: WorkInProgressId,
        event: WorkEvent,
    ) -> Result<(), RpcError>;
}

/// A worker dialing in to an expectation manager.
#[derive(Clone)]
pub struct WorkerConnection {
    pub id: WorkerId,
    pub capabilities: WorkerCapabilities,
    pub api: Arc<dyn WorkerApi>,
}

/// The dial-in surface of an expectation manager, handed to workers by
/// the workforce.
#[async_trait]
pub trait ExpectationManagerApi: Send + Sync {
    /// Registers the worker with the manager and returns the handle the
    /// worker pushes work events through.
    async fn connect_worker(
        &self,
        connection: WorkerConnection,
    ) -> Result<Arc<dyn ManagerApi>, RpcError>;

    async fn disconnect_worker(&self, id: &WorkerId) -> Result<(), RpcError>;
}

/// An expectation manager as seen by workforce subscribers.
#[derive(Clone)]
pub struct ManagerHandle {
    pub id: ManagerId,
    pub api: Arc<dyn ExpectationManagerApi>,
}

/// Fan-out notifications from the workforce to its registered parties.
/// All methods have defaults so a subscriber only implements what it
/// cares about.
#[async_trait]
pub trait WorkforceSubscriber: Send + Sync {
    async fn manager_joined(&self, _manager: ManagerHandle) -> Result<(), RpcError> {
        Ok(())
    }

    async fn manager_left(&self, _id: &ManagerId) -> Result<(), RpcError> {
        Ok(())
    }

    async fn worker_joined(&self, _id: &WorkerId) -> Result<(), RpcError> {
        Ok(())
    }

    async fn worker_left(&self, _id: &WorkerId) -> Result<(), RpcError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub known: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: WorkerId,
    pub capabilities: WorkerCapabilities,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerInfo {
    pub id: ManagerId,
}

/// Registration and liveness API of the workforce.
#[async_trait]
pub trait WorkforceApi: Send + Sync {
    async fn register_expectation_manager(
        &self,
        manager: ManagerHandle,
        subscriber: Arc<dyn WorkforceSubscriber>,
    ) -> Result<(), RpcError>;

    async fn register_worker(
        &self,
        id: WorkerId,
        capabilities: WorkerCapabilities,
        subscriber: Arc<dyn WorkforceSubscriber>,
    ) -> Result<(), RpcError>;

    async fn unregister_expectation_manager(&self, id: &ManagerId) -> Result<(), RpcError>;

    async fn unregister_worker(&self, id: &WorkerId) -> Result<(), RpcError>;

    /// `HeartbeatAck::known == false` means the party was expired and
    /// should re-register.
    async fn heartbeat_expectation_manager(
        &self,
        id: &ManagerId,
    ) -> Result<HeartbeatAck, RpcError>;

    async fn heartbeat_worker(&self, id: &WorkerId) -> Result<HeartbeatAck, RpcError>;

    async fn list_workers(&self) -> Result<Vec<WorkerInfo>, RpcError>;

    async fn list_managers(&self) -> Result<Vec<ManagerInfo>, RpcError>;
}

/// Upstream bridge: where the manager publishes status batches. A batch
/// contains at most one record per id (latest wins during coalescing).
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish_expectation_statuses(
        &self,
        statuses: Vec<ExpectationStatusReport>,
    ) -> Result<(), RpcError>;

    async fn publish_container_statuses(
        &self,
        statuses: Vec<ContainerStatusReport>,
    ) -> Result<(), RpcError>;
}

/// Convenience for tests and single-process deployments: a sink that
/// drops everything.
pub struct NoopStatusSink;

#[async_trait]
impl StatusSink for NoopStatusSink {
    async fn publish_expectation_statuses(
        &self,
        _statuses: Vec<ExpectationStatusReport>,
    ) -> Result<(), RpcError> {
        Ok(())
    }

    async fn publish_container_statuses(
        &self,
        _statuses: Vec<ContainerStatusReport>,
    ) -> Result<(), RpcError> {
        Ok(())
    }
}

impl std::fmt::Debug for ManagerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerHandle").field("id", &self.id).finish()
    }
}

impl std::fmt::Debug for WorkerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerConnection")
            .field("id", &self.id)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}
