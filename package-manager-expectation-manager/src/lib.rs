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

pub mod config;
pub mod containers;
pub mod error;
pub mod evaluation;
pub mod metrics;
pub mod model;
pub mod selection;
pub mod states;
pub mod status;
pub mod store;
pub mod workers;

#[cfg(test)]
pub(crate) mod fixtures;

#[cfg(test)]
test_r::enable!();

use crate::config::ExpectationManagerConfig;
use crate::evaluation::{Command, EvaluationLoop};
use crate::status::StatusPublisher;
use async_trait::async_trait;
use package_manager_common::api::{
    ExpectationManagerApi, ManagerApi, ManagerHandle, RpcError, StatusSink, WorkEvent,
    WorkerConnection, WorkforceApi, WorkforceSubscriber,
};
use package_manager_common::model::{
    Expectation, ExpectationId, ExpectedPackageContainer, ManagerId, WorkInProgressId, WorkerId,
};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// The public face of one expectation manager. All inputs are forwarded
/// to the evaluation loop through the command channel; the loop owns
/// every table.
pub struct ExpectationManager {
    id: ManagerId,
    config: ExpectationManagerConfig,
    commands: mpsc::UnboundedSender<Command>,
    self_ref: Weak<ExpectationManager>,
}

impl ExpectationManager {
    /// Builds the manager and its (not yet running) evaluation loop;
    /// spawn [`EvaluationLoop::run`] to bring it to life. Must be called
    /// within a tokio runtime (the status publisher task starts here).
    pub fn new(
        config: ExpectationManagerConfig,
        sink: Arc<dyn StatusSink>,
    ) -> (Arc<ExpectationManager>, EvaluationLoop) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (publisher, _publisher_task) = StatusPublisher::start(
            sink,
            config.publication_window,
            config.publication_retries.clone(),
        );
        let evaluation_loop = EvaluationLoop::new(config.clone(), publisher, command_rx);
        let manager = Arc::new_cyclic(|self_ref| ExpectationManager {
            id: ManagerId::from(config.manager_id.clone()),
            config,
            commands: command_tx,
            self_ref: self_ref.clone(),
        });
        (manager, evaluation_loop)
    }

    pub fn id(&self) -> &ManagerId {
        &self.id
    }

    /// The dial-in handle handed to the workforce (and from there to
    /// workers).
    pub fn manager_handle(self: &Arc<Self>) -> ManagerHandle {
        ManagerHandle {
            id: self.id.clone(),
            api: self.clone(),
        }
    }

    /// Replaces the expected set; the loop diffs it against the tracked
    /// table.
    pub fn update_expectations(&self, expectations: Vec<Expectation>) {
        self.send(Command::UpdateExpectations(expectations));
    }

    pub fn update_containers(&self, containers: Vec<ExpectedPackageContainer>) {
        self.send(Command::UpdateContainers(containers));
    }

    pub fn abort_expectation(&self, id: ExpectationId) {
        self.send(Command::AbortExpectation(id));
    }

    pub fn restart_expectation(&self, id: ExpectationId) {
        self.send(Command::RestartExpectation(id));
    }

    /// Registers with the workforce and keeps the registration alive.
    /// Runs until cancelled.
    pub async fn run_workforce_session(
        self: &Arc<Self>,
        workforce: Arc<dyn WorkforceApi>,
    ) -> Result<(), RpcError> {
        let subscriber: Arc<dyn WorkforceSubscriber> = self.clone();
        workforce
            .register_expectation_manager(self.manager_handle(), subscriber.clone())
            .await?;
        info!(manager_id = %self.id, "registered with workforce");

        loop {
            tokio::time::sleep(self.config.heartbeat_interval).await;
            match workforce.heartbeat_expectation_manager(&self.id).await {
                Ok(ack) if !ack.known => {
                    info!(manager_id = %self.id, "workforce expired us, re-registering");
                    if let Err(err) = workforce
                        .register_expectation_manager(self.manager_handle(), subscriber.clone())
                        .await
                    {
                        warn!(manager_id = %self.id, "re-registration failed: {err}");
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(manager_id = %self.id, "workforce heartbeat failed: {err}");
                }
            }
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!(manager_id = %self.id, "evaluation loop is gone, dropping input");
        }
    }

    fn send_rpc(&self, command: Command) -> Result<(), RpcError> {
        self.commands
            .send(command)
            .map_err(|_| RpcError::Unreachable("expectation manager stopped".to_string()))
    }
}

#[async_trait]
impl ExpectationManagerApi for ExpectationManager {
    async fn connect_worker(
        &self,
        connection: WorkerConnection,
    ) -> Result<Arc<dyn ManagerApi>, RpcError> {
        self.send_rpc(Command::WorkerConnected(connection))?;
        let manager = self
            .self_ref
            .upgrade()
            .ok_or_else(|| RpcError::Unreachable("expectation manager stopped".to_string()))?;
        Ok(manager)
    }

    async fn disconnect_worker(&self, id: &WorkerId) -> Result<(), RpcError> {
        self.send_rpc(Command::WorkerDisconnected(id.clone()))
    }
}

#[async_trait]
impl ManagerApi for ExpectationManager {
    async fn notify_work_event(
        &self,
        worker_id: &WorkerId,
        wip: WorkInProgressId,
        event: WorkEvent,
    ) -> Result<(), RpcError> {
        self.send_rpc(Command::WorkEvent {
            worker_id: worker_id.clone(),
            wip,
            event,
        })
    }
}

#[async_trait]
impl WorkforceSubscriber for ExpectationManager {
    async fn worker_left(&self, id: &WorkerId) -> Result<(), RpcError> {
        self.send_rpc(Command::WorkerDisconnected(id.clone()))
    }
}
