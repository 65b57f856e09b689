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

//! The worker agent: owns the executor handlers, routes capability
//! probes, enforces the concurrency limit and keeps the table of work in
//! progress. One agent serves any number of expectation managers, each
//! through its own session.

use crate::config::WorkerConfig;
use crate::handler::{ExpectationHandler, WorkEventSender};
use crate::metrics;
use async_trait::async_trait;
use package_manager_common::api::{
    ContainerMonitorResult, CostResult, FulfilledResult, ManagerApi, ManagerHandle, ReadyResult,
    RemoveResult, RpcError, SupportResult, WorkEvent, WorkOnResult, WorkerApi, WorkerCapabilities,
    WorkerConnection, WorkforceApi, WorkforceSubscriber,
};
use package_manager_common::coalesce::InFlightCoalescer;
use package_manager_common::model::{
    Expectation, ExpectationId, ExpectedPackageContainer, ManagerId, Reason, WorkInProgressId,
    WorkerId,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct WorkInProgress {
    expectation_id: ExpectationId,
    manager_id: ManagerId,
    worker_task: JoinHandle<()>,
    forwarder_task: JoinHandle<()>,
}

#[derive(Default)]
struct AgentState {
    managers: HashMap<ManagerId, Arc<dyn ManagerApi>>,
    work_in_progress: HashMap<WorkInProgressId, WorkInProgress>,
}

/// Outcome of routing an expectation to the handler set.
#[derive(Clone)]
struct ProbeOutcome {
    handler: Option<usize>,
    result: SupportResult,
}

pub struct WorkerAgent {
    id: WorkerId,
    capabilities: WorkerCapabilities,
    config: WorkerConfig,
    handlers: Vec<Arc<dyn ExpectationHandler>>,
    probes: InFlightCoalescer<ExpectationId, ProbeOutcome>,
    state: Mutex<AgentState>,
    self_ref: Weak<WorkerAgent>,
}

impl WorkerAgent {
    pub fn new(config: WorkerConfig, handlers: Vec<Arc<dyn ExpectationHandler>>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            id: WorkerId::from(config.worker_id.clone()),
            capabilities: config.capabilities.clone(),
            config,
            handlers,
            probes: InFlightCoalescer::new(),
            state: Mutex::new(AgentState::default()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Registers with the workforce and keeps heartbeating; re-registers
    /// when the workforce reports us unknown (it expired us during a
    /// connectivity gap). Runs until cancelled.
    pub async fn run_workforce_session(
        self: &Arc<Self>,
        workforce: Arc<dyn WorkforceApi>,
    ) -> Result<(), RpcError> {
        let subscriber: Arc<dyn WorkforceSubscriber> = self.clone();
        workforce
            .register_worker(self.id.clone(), self.capabilities.clone(), subscriber.clone())
            .await?;

        loop {
            tokio::time::sleep(self.config.heartbeat_interval).await;
            match workforce.heartbeat_worker(&self.id).await {
                Ok(ack) if !ack.known => {
                    info!(worker_id = %self.id, "workforce expired us, re-registering");
                    if let Err(err) = workforce
                        .register_worker(
                            self.id.clone(),
                            self.capabilities.clone(),
                            subscriber.clone(),
                        )
                        .await
                    {
                        warn!(worker_id = %self.id, "re-registration failed: {err}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(worker_id = %self.id, "workforce heartbeat failed: {err}");
                }
            }
        }
    }

    /// Dials in to an expectation manager with a dedicated session so
    /// work events route back to the manager that started the work.
    pub async fn connect_to_manager(
        self: &Arc<Self>,
        manager: &ManagerHandle,
    ) -> Result<(), RpcError> {
        let session: Arc<dyn WorkerApi> = Arc::new(ManagerSession {
            agent: self.clone(),
            manager_id: manager.id.clone(),
        });
        let manager_api = manager
            .api
            .connect_worker(WorkerConnection {
                id: self.id.clone(),
                capabilities: self.capabilities.clone(),
                api: session,
            })
            .await?;

        let mut state = self.state.lock().unwrap();
        state.managers.insert(manager.id.clone(), manager_api);
        info!(worker_id = %self.id, manager_id = %manager.id, "connected to expectation manager");
        Ok(())
    }

    fn drop_manager(&self, manager_id: &ManagerId) {
        let cancelled: Vec<WorkInProgressId> = {
            let mut state = self.state.lock().unwrap();
            state.managers.remove(manager_id);
            let cancelled: Vec<WorkInProgressId> = state
                .work_in_progress
                .iter()
                .filter(|(_, wip)| &wip.manager_id == manager_id)
                .map(|(id, _)| *id)
                .collect();
            for id in &cancelled {
                if let Some(wip) = state.work_in_progress.remove(id) {
                    wip.worker_task.abort();
                    wip.forwarder_task.abort();
                }
            }
            cancelled
        };
        if !cancelled.is_empty() {
            warn!(
                worker_id = %self.id,
                manager_id = %manager_id,
                "manager left, aborted {} jobs",
                cancelled.len()
            );
        }
        metrics::set_work_in_progress(self.work_in_progress_count());
    }

    pub fn work_in_progress_count(&self) -> usize {
        self.state.lock().unwrap().work_in_progress.len()
    }

    /// Which handler takes this expectation, if any. Identical probes
    /// arriving concurrently (several managers, or re-probes) share one
    /// pass over the handlers.
    async fn route(&self, exp: &Expectation) -> ProbeOutcome {
        let exp = exp.clone();
        self.probes
            .get_or_run(exp.id.clone(), || async move {
                let mut last_reason = Reason::uniform("no handler registered");
                for (index, handler) in self.handlers.iter().enumerate() {
                    let result = handler.supports(&exp).await;
                    if result.support {
                        return ProbeOutcome {
                            handler: Some(index),
                            result,
                        };
                    }
                    last_reason = result.reason;
                }
                ProbeOutcome {
                    handler: None,
                    result: SupportResult {
                        support: false,
                        reason: last_reason,
                    },
                }
            })
            .await
    }

    async fn start_work(
        self: &Arc<Self>,
        manager_id: &ManagerId,
        exp: &Expectation,
    ) -> Result<WorkOnResult, RpcError> {
        let outcome = self.route(exp).await;
        let Some(handler_index) = outcome.handler else {
            return Ok(WorkOnResult::Rejected {
                reason: outcome.result.reason,
            });
        };
        let handler = self.handlers[handler_index].clone();

        // One critical section: the capacity check must not race with
        // another acceptance. Spawning does not await, so holding the
        // lock here is fine.
        let mut state = self.state.lock().unwrap();
        if state.work_in_progress.len() >= self.capabilities.concurrency_limit {
            return Ok(WorkOnResult::Rejected {
                reason: Reason::new(
                    "Worker is busy",
                    format!(
                        "{} jobs in progress, limit {}",
                        state.work_in_progress.len(),
                        self.capabilities.concurrency_limit
                    ),
                ),
            });
        }
        let manager_api = match state.managers.get(manager_id) {
            Some(api) => api.clone(),
            None => {
                return Err(RpcError::Unreachable(format!(
                    "no session for manager {manager_id}"
                )))
            }
        };

        let wip = WorkInProgressId::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let worker_task = {
            let handler = handler.clone();
            let exp = exp.clone();
            let events = WorkEventSender::new(tx);
            tokio::spawn(async move {
                handler.work(&exp, events).await;
            })
        };

        let forwarder_task = {
            let agent = self.clone();
            let worker_id = self.id.clone();
            let expectation_id = exp.id.clone();
            tokio::spawn(async move {
                agent
                    .forward_events(manager_api, worker_id, expectation_id, wip, rx)
                    .await;
            })
        };

        state.work_in_progress.insert(
            wip,
            WorkInProgress {
                expectation_id: exp.id.clone(),
                manager_id: manager_id.clone(),
                worker_task,
                forwarder_task,
            },
        );
        metrics::set_work_in_progress(state.work_in_progress.len());
        debug!(worker_id = %self.id, expectation_id = %exp.id, wip = %wip, "work accepted");
        Ok(WorkOnResult::Accepted { wip })
    }

    async fn forward_events(
        self: Arc<Self>,
        manager_api: Arc<dyn ManagerApi>,
        worker_id: WorkerId,
        expectation_id: ExpectationId,
        wip: WorkInProgressId,
        mut rx: mpsc::UnboundedReceiver<WorkEvent>,
    ) {
        let mut saw_terminal = false;
        while let Some(event) = rx.recv().await {
            let terminal = matches!(event, WorkEvent::Done { .. } | WorkEvent::Error { .. });
            if let Err(err) = manager_api.notify_work_event(&worker_id, wip, event).await {
                warn!(
                    worker_id = %worker_id,
                    expectation_id = %expectation_id,
                    "failed to push work event: {err}"
                );
            }
            if terminal {
                saw_terminal = true;
                break;
            }
        }

        if !saw_terminal {
            // The handler task ended (or panicked) without a verdict.
            let event = WorkEvent::Error {
                reason: Reason::new(
                    "Work ended unexpectedly",
                    format!("job {wip} produced no terminal event"),
                ),
            };
            if let Err(err) = manager_api.notify_work_event(&worker_id, wip, event).await {
                warn!(
                    worker_id = %worker_id,
                    expectation_id = %expectation_id,
                    "failed to push synthetic error event: {err}"
                );
            }
        }

        let mut state = self.state.lock().unwrap();
        state.work_in_progress.remove(&wip);
        metrics::set_work_in_progress(state.work_in_progress.len());
    }

    fn cancel_work(&self, wip: WorkInProgressId) {
        let removed = {
            let mut state = self.state.lock().unwrap();
            state.work_in_progress.remove(&wip)
        };
        match removed {
            Some(entry) => {
                entry.worker_task.abort();
                entry.forwarder_task.abort();
                info!(
                    worker_id = %self.id,
                    expectation_id = %entry.expectation_id,
                    wip = %wip,
                    "work cancelled"
                );
            }
            None => {
                debug!(worker_id = %self.id, wip = %wip, "cancel for unknown job, ignoring");
            }
        }
        metrics::set_work_in_progress(self.work_in_progress_count());
    }
}

#[async_trait]
impl WorkforceSubscriber for WorkerAgent {
    async fn manager_joined(&self, manager: ManagerHandle) -> Result<(), RpcError> {
        let agent = self
            .self_ref
            .upgrade()
            .ok_or_else(|| RpcError::Unreachable("worker agent is shutting down".to_string()))?;
        agent.connect_to_manager(&manager).await
    }

    async fn manager_left(&self, id: &ManagerId) -> Result<(), RpcError> {
        self.drop_manager(id);
        Ok(())
    }
}

/// The per-manager face of the agent; what a manager holds after
/// `connect_worker`.
struct ManagerSession {
    agent: Arc<WorkerAgent>,
    manager_id: ManagerId,
}

#[async_trait]
impl WorkerApi for ManagerSession {
    async fn do_you_support_expectation(
        &self,
        exp: &Expectation,
    ) -> Result<SupportResult, RpcError> {
        Ok(self.agent.route(exp).await.result)
    }

    async fn get_cost_for_expectation(&self, exp: &Expectation) -> Result<CostResult, RpcError> {
        let outcome = self.agent.route(exp).await;
        match outcome.handler {
            Some(index) => Ok(self.agent.handlers[index].cost(exp).await),
            None => Ok(CostResult {
                cost: f64::INFINITY,
                reason: Some(outcome.result.reason),
            }),
        }
    }

    async fn is_expectation_ready_to_start_working_on(
        &self,
        exp: &Expectation,
    ) -> Result<ReadyResult, RpcError> {
        let outcome = self.agent.route(exp).await;
        match outcome.handler {
            Some(index) => Ok(self.agent.handlers[index].is_ready(exp).await),
            None => Ok(ReadyResult {
                ready: false,
                is_waiting_for_another: false,
                source_exists: None,
                reason: outcome.result.reason,
            }),
        }
    }

    async fn is_expectation_fulfilled(
        &self,
        exp: &Expectation,
        was_fulfilled: bool,
    ) -> Result<FulfilledResult, RpcError> {
        let outcome = self.agent.route(exp).await;
        match outcome.handler {
            Some(index) => Ok(self.agent.handlers[index]
                .is_fulfilled(exp, was_fulfilled)
                .await),
            None => Ok(FulfilledResult {
                fulfilled: false,
                actual_version_hash: None,
                reason: outcome.result.reason,
            }),
        }
    }

    async fn work_on_expectation(&self, exp: &Expectation) -> Result<WorkOnResult, RpcError> {
        self.agent.start_work(&self.manager_id, exp).await
    }

    async fn remove_expectation(&self, exp: &Expectation) -> Result<RemoveResult, RpcError> {
        let outcome = self.agent.route(exp).await;
        match outcome.handler {
            Some(index) => Ok(self.agent.handlers[index].remove(exp).await),
            None => Ok(RemoveResult {
                // Nothing we could have put there; treat as gone.
                removed: true,
                reason: outcome.result.reason,
            }),
        }
    }

    async fn cancel_work_in_progress(&self, wip: WorkInProgressId) -> Result<(), RpcError> {
        self.agent.cancel_work(wip);
        Ok(())
    }

    async fn setup_package_container_monitors(
        &self,
        container: &ExpectedPackageContainer,
    ) -> Result<ContainerMonitorResult, RpcError> {
        for handler in &self.agent.handlers {
            let result = handler.setup_container_monitors(container).await;
            if result.ok {
                return Ok(result);
            }
        }
        Ok(ContainerMonitorResult {
            ok: false,
            reason: Reason::uniform("no handler can monitor this container"),
        })
    }

    async fn run_package_container_cron_job(
        &self,
        container: &ExpectedPackageContainer,
    ) -> Result<ContainerMonitorResult, RpcError> {
        for handler in &self.agent.handlers {
            let result = handler.run_container_cron_job(container).await;
            if result.ok {
                return Ok(result);
            }
        }
        Ok(ContainerMonitorResult {
            ok: false,
            reason: Reason::uniform("no handler takes cron jobs for this container"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use package_manager_common::api::ExpectationManagerApi;
    use package_manager_common::model::{
        EndRequirement, PackageContent, StartRequirement, StatusReportSettings, WorkOptions,
    };
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use test_r::test;

    fn expectation(id: &str) -> Expectation {
        Expectation {
            id: ExpectationId::from(id),
            priority: 0,
            status_report: StatusReportSettings {
                label: id.to_string(),
                description: String::new(),
                send_report: true,
            },
            start_requirement: StartRequirement { sources: vec![] },
            end_requirement: EndRequirement {
                targets: vec![],
                content: PackageContent::MediaFile {
                    file_path: format!("/media/{id}.mp4"),
                },
                version: Default::default(),
            },
            work_options: WorkOptions::default(),
            depends_on_fulfilled: vec![],
            triggered_by_fulfilled_ids: vec![],
            content_version_hash: "h1".to_string(),
        }
    }

    /// Copies nothing; completes after a short sleep unless `hang`.
    struct TestHandler {
        hang: bool,
    }

    #[async_trait]
    impl ExpectationHandler for TestHandler {
        fn name(&self) -> &'static str {
            "test"
        }

        async fn supports(&self, _exp: &Expectation) -> SupportResult {
            SupportResult {
                support: true,
                reason: Reason::uniform("test handler takes everything"),
            }
        }

        async fn cost(&self, _exp: &Expectation) -> CostResult {
            CostResult {
                cost: 1.0,
                reason: None,
            }
        }

        async fn is_ready(&self, _exp: &Expectation) -> ReadyResult {
            ReadyResult {
                ready: true,
                is_waiting_for_another: false,
                source_exists: Some(true),
                reason: Reason::uniform("ready"),
            }
        }

        async fn is_fulfilled(&self, _exp: &Expectation, _was_fulfilled: bool) -> FulfilledResult {
            FulfilledResult {
                fulfilled: false,
                actual_version_hash: None,
                reason: Reason::uniform("not fulfilled"),
            }
        }

        async fn work(&self, exp: &Expectation, events: WorkEventSender) {
            if self.hang {
                std::future::pending::<()>().await;
            }
            events.progress(0.5);
            tokio::time::sleep(Duration::from_millis(5)).await;
            events.done(exp.content_version_hash.clone(), Reason::uniform("copied"));
        }

        async fn remove(&self, _exp: &Expectation) -> RemoveResult {
            RemoveResult {
                removed: true,
                reason: Reason::uniform("removed"),
            }
        }
    }

    #[derive(Default)]
    struct RecordingManager {
        events: StdMutex<Vec<WorkEvent>>,
    }

    #[async_trait]
    impl ManagerApi for RecordingManager {
        async fn notify_work_event(
            &self,
            _worker_id: &WorkerId,
            _wip: WorkInProgressId,
            event: WorkEvent,
        ) -> Result<(), RpcError> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }

    struct TestManagerApi {
        manager: Arc<RecordingManager>,
    }

    #[async_trait]
    impl ExpectationManagerApi for TestManagerApi {
        async fn connect_worker(
            &self,
            _connection: WorkerConnection,
        ) -> Result<Arc<dyn ManagerApi>, RpcError> {
            Ok(self.manager.clone())
        }

        async fn disconnect_worker(&self, _id: &WorkerId) -> Result<(), RpcError> {
            Ok(())
        }
    }

    async fn connected_agent(
        hang: bool,
        concurrency_limit: usize,
    ) -> (Arc<WorkerAgent>, Arc<RecordingManager>, Arc<dyn WorkerApi>) {
        let config = WorkerConfig {
            capabilities: WorkerCapabilities { concurrency_limit },
            ..WorkerConfig::default()
        };
        let agent = WorkerAgent::new(config, vec![Arc::new(TestHandler { hang })]);
        let manager = Arc::new(RecordingManager::default());
        let handle = ManagerHandle {
            id: ManagerId::from("em1"),
            api: Arc::new(TestManagerApi {
                manager: manager.clone(),
            }),
        };
        agent.connect_to_manager(&handle).await.unwrap();
        let session: Arc<dyn WorkerApi> = Arc::new(ManagerSession {
            agent: agent.clone(),
            manager_id: ManagerId::from("em1"),
        });
        (agent, manager, session)
    }

    #[test]
    async fn work_streams_progress_then_done() {
        let (agent, manager, session) = connected_agent(false, 2).await;
        let result = session.work_on_expectation(&expectation("exp1")).await.unwrap();
        assert!(matches!(result, WorkOnResult::Accepted { .. }));

        // Wait for the job to drain.
        for _ in 0..100 {
            if agent.work_in_progress_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let events = manager.events.lock().unwrap().clone();
        assert!(matches!(events.first(), Some(WorkEvent::Progress { .. })));
        assert!(matches!(events.last(), Some(WorkEvent::Done { .. })));
    }

    #[test]
    async fn concurrency_limit_rejects_excess_work() {
        let (_agent, _manager, session) = connected_agent(true, 1).await;
        let first = session.work_on_expectation(&expectation("exp1")).await.unwrap();
        assert!(matches!(first, WorkOnResult::Accepted { .. }));

        let second = session.work_on_expectation(&expectation("exp2")).await.unwrap();
        match second {
            WorkOnResult::Rejected { reason } => {
                assert_eq!(reason.user, "Worker is busy");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    async fn cancel_aborts_the_job() {
        let (agent, manager, session) = connected_agent(true, 1).await;
        let result = session.work_on_expectation(&expectation("exp1")).await.unwrap();
        let WorkOnResult::Accepted { wip } = result else {
            panic!("expected acceptance");
        };

        session.cancel_work_in_progress(wip).await.unwrap();
        assert_eq!(agent.work_in_progress_count(), 0);
        // No synthetic error after a cancel.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(manager.events.lock().unwrap().is_empty());
    }

    #[test]
    async fn unsupported_expectation_is_rejected() {
        let config = WorkerConfig::default();
        let agent = WorkerAgent::new(config, vec![]);
        let session = ManagerSession {
            agent: agent.clone(),
            manager_id: ManagerId::from("em1"),
        };
        let support = session
            .do_you_support_expectation(&expectation("exp1"))
            .await
            .unwrap();
        assert!(!support.support);
    }
}
