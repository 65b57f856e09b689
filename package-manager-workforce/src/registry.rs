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

//! The singleton registry introducing expectation managers and workers
//! to each other. It never routes job traffic; once a worker has been
//! told about a manager they talk directly, so losing the workforce only
//! prevents new joins.

use crate::config::WorkforceConfig;
use crate::metrics;
use async_trait::async_trait;
use package_manager_common::api::{
    HeartbeatAck, ManagerHandle, ManagerInfo, RpcError, WorkerCapabilities, WorkerInfo,
    WorkforceApi, WorkforceSubscriber,
};
use package_manager_common::model::{ManagerId, WorkerId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct RegisteredManager {
    handle: ManagerHandle,
    subscriber: Arc<dyn WorkforceSubscriber>,
    last_seen: Instant,
}

struct RegisteredWorker {
    info: WorkerInfo,
    subscriber: Arc<dyn WorkforceSubscriber>,
    last_seen: Instant,
}

#[derive(Default)]
struct RegistryState {
    managers: HashMap<ManagerId, RegisteredManager>,
    workers: HashMap<WorkerId, RegisteredWorker>,
}

pub struct Workforce {
    config: WorkforceConfig,
    state: Mutex<RegistryState>,
}

impl Workforce {
    pub fn new(config: WorkforceConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(RegistryState::default()),
        })
    }

    /// Spawns the background task expiring silent parties. The task runs
    /// until the returned handle is aborted.
    pub fn start_liveness_watch(self: &Arc<Self>) -> JoinHandle<()> {
        let workforce = self.clone();
        let interval = workforce.config.liveness_check_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                workforce.expire_silent_parties().await;
            }
        })
    }

    /// Removes every party whose last heartbeat is older than the
    /// configured timeout and fans out the departures.
    pub async fn expire_silent_parties(&self) {
        let timeout = self.config.heartbeat_timeout;
        let (expired_managers, expired_workers) = {
            let mut state = self.state.lock().unwrap();
            let now = Instant::now();
            let expired_managers: Vec<ManagerId> = state
                .managers
                .iter()
                .filter(|(_, m)| now.duration_since(m.last_seen) > timeout)
                .map(|(id, _)| id.clone())
                .collect();
            let expired_workers: Vec<WorkerId> = state
                .workers
                .iter()
                .filter(|(_, w)| now.duration_since(w.last_seen) > timeout)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &expired_managers {
                state.managers.remove(id);
            }
            for id in &expired_workers {
                state.workers.remove(id);
            }
            (expired_managers, expired_workers)
        };

        for id in expired_managers {
            warn!(manager_id = %id, "expectation manager missed heartbeats, expiring");
            metrics::record_party_expired("manager");
            self.fan_out_manager_left(&id).await;
        }
        for id in expired_workers {
            warn!(worker_id = %id, "worker missed heartbeats, expiring");
            metrics::record_party_expired("worker");
            self.fan_out_worker_left(&id).await;
        }
        self.update_gauges();
    }

    fn update_gauges(&self) {
        let state = self.state.lock().unwrap();
        metrics::set_registered_counts(state.managers.len(), state.workers.len());
    }

    fn worker_subscribers(&self) -> Vec<(WorkerId, Arc<dyn WorkforceSubscriber>)> {
        let state = self.state.lock().unwrap();
        state
            .workers
            .iter()
            .map(|(id, w)| (id.clone(), w.subscriber.clone()))
            .collect()
    }

    fn manager_subscribers(&self) -> Vec<(ManagerId, Arc<dyn WorkforceSubscriber>)> {
        let state = self.state.lock().unwrap();
        state
            .managers
            .iter()
            .map(|(id, m)| (id.clone(), m.subscriber.clone()))
            .collect()
    }

    async fn fan_out_manager_joined(&self, manager: ManagerHandle) {
        for (worker_id, subscriber) in self.worker_subscribers() {
            if let Err(err) = subscriber.manager_joined(manager.clone()).await {
                warn!(
                    worker_id = %worker_id,
                    manager_id = %manager.id,
                    "failed to notify worker of manager join: {err}"
                );
            }
        }
    }

    async fn fan_out_manager_left(&self, id: &ManagerId) {
        for (worker_id, subscriber) in self.worker_subscribers() {
            if let Err(err) = subscriber.manager_left(id).await {
                warn!(
                    worker_id = %worker_id,
                    manager_id = %id,
                    "failed to notify worker of manager departure: {err}"
                );
            }
        }
    }

    async fn fan_out_worker_joined(&self, id: &WorkerId) {
        for (manager_id, subscriber) in self.manager_subscribers() {
            if let Err(err) = subscriber.worker_joined(id).await {
                warn!(
                    manager_id = %manager_id,
                    worker_id = %id,
                    "failed to notify manager of worker join: {err}"
                );
            }
        }
    }

    async fn fan_out_worker_left(&self, id: &WorkerId) {
        for (manager_id, subscriber) in self.manager_subscribers() {
            if let Err(err) = subscriber.worker_left(id).await {
                warn!(
                    manager_id = %manager_id,
                    worker_id = %id,
                    "failed to notify manager of worker departure: {err}"
                );
            }
        }
    }
}

#[async_trait]
impl WorkforceApi for Workforce {
    async fn register_expectation_manager(
        &self,
        manager: ManagerHandle,
        subscriber: Arc<dyn WorkforceSubscriber>,
    ) -> Result<(), RpcError> {
        let id = manager.id.clone();
        let is_new = {
            let mut state = self.state.lock().unwrap();
            let is_new = !state.managers.contains_key(&id);
            state.managers.insert(
                id.clone(),
                RegisteredManager {
                    handle: manager.clone(),
                    subscriber,
                    last_seen: Instant::now(),
                },
            );
            is_new
        };

        if is_new {
            info!(manager_id = %id, "expectation manager registered");
            self.fan_out_manager_joined(manager).await;
        } else {
            debug!(manager_id = %id, "expectation manager re-registered");
        }
        self.update_gauges();
        Ok(())
    }

    async fn register_worker(
        &self,
        id: WorkerId,
        capabilities: WorkerCapabilities,
        subscriber: Arc<dyn WorkforceSubscriber>,
    ) -> Result<(), RpcError> {
        let (is_new, managers) = {
            let mut state = self.state.lock().unwrap();
            let is_new = !state.workers.contains_key(&id);
            state.workers.insert(
                id.clone(),
                RegisteredWorker {
                    info: WorkerInfo {
                        id: id.clone(),
                        capabilities,
                    },
                    subscriber: subscriber.clone(),
                    last_seen: Instant::now(),
                },
            );
            let managers: Vec<ManagerHandle> =
                state.managers.values().map(|m| m.handle.clone()).collect();
            (is_new, managers)
        };

        // The worker needs the current manager set whether or not this
        // is a re-registration; a re-register usually means the worker
        // restarted and lost its sessions.
        for manager in managers {
            if let Err(err) = subscriber.manager_joined(manager.clone()).await {
                warn!(
                    worker_id = %id,
                    manager_id = %manager.id,
                    "failed to send manager endpoint to worker: {err}"
                );
            }
        }

        if is_new {
            info!(worker_id = %id, "worker registered");
            self.fan_out_worker_joined(&id).await;
        } else {
            debug!(worker_id = %id, "worker re-registered");
        }
        self.update_gauges();
        Ok(())
    }

    async fn unregister_expectation_manager(&self, id: &ManagerId) -> Result<(), RpcError> {
        let removed = {
            let mut state = self.state.lock().unwrap();
            state.managers.remove(id).is_some()
        };
        if removed {
            info!(manager_id = %id, "expectation manager unregistered");
            self.fan_out_manager_left(id).await;
            self.update_gauges();
        }
        Ok(())
    }

    async fn unregister_worker(&self, id: &WorkerId) -> Result<(), RpcError> {
        let removed = {
            let mut state = self.state.lock().unwrap();
            state.workers.remove(id).is_some()
        };
        if removed {
            info!(worker_id = %id, "worker unregistered");
            self.fan_out_worker_left(id).await;
            self.update_gauges();
        }
        Ok(())
    }

    async fn heartbeat_expectation_manager(
        &self,
        id: &ManagerId,
    ) -> Result<HeartbeatAck, RpcError> {
        let mut state = self.state.lock().unwrap();
        match state.managers.get_mut(id) {
            Some(manager) => {
                manager.last_seen = Instant::now();
                Ok(HeartbeatAck { known: true })
            }
            None => Ok(HeartbeatAck { known: false }),
        }
    }

    async fn heartbeat_worker(&self, id: &WorkerId) -> Result<HeartbeatAck, RpcError> {
        let mut state = self.state.lock().unwrap();
        match state.workers.get_mut(id) {
            Some(worker) => {
                worker.last_seen = Instant::now();
                Ok(HeartbeatAck { known: true })
            }
            None => Ok(HeartbeatAck { known: false }),
        }
    }

    async fn list_workers(&self) -> Result<Vec<WorkerInfo>, RpcError> {
        let state = self.state.lock().unwrap();
        Ok(state.workers.values().map(|w| w.info.clone()).collect())
    }

    async fn list_managers(&self) -> Result<Vec<ManagerInfo>, RpcError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .managers
            .values()
            .map(|m| ManagerInfo {
                id: m.handle.id.clone(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use package_manager_common::api::{ExpectationManagerApi, ManagerApi, WorkerConnection};
    use std::sync::Mutex as StdMutex;
    use test_r::test;

    #[derive(Default)]
    struct RecordingSubscriber {
        events: StdMutex<Vec<String>>,
    }

    impl RecordingSubscriber {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WorkforceSubscriber for RecordingSubscriber {
        async fn manager_joined(&self, manager: ManagerHandle) -> Result<(), RpcError> {
            self.events
                .lock()
                .unwrap()
                .push(format!("manager_joined:{}", manager.id));
            Ok(())
        }

        async fn manager_left(&self, id: &ManagerId) -> Result<(), RpcError> {
            self.events.lock().unwrap().push(format!("manager_left:{id}"));
            Ok(())
        }

        async fn worker_joined(&self, id: &WorkerId) -> Result<(), RpcError> {
            self.events.lock().unwrap().push(format!("worker_joined:{id}"));
            Ok(())
        }

        async fn worker_left(&self, id: &WorkerId) -> Result<(), RpcError> {
            self.events.lock().unwrap().push(format!("worker_left:{id}"));
            Ok(())
        }
    }

    struct DummyManagerApi;

    #[async_trait]
    impl ExpectationManagerApi for DummyManagerApi {
        async fn connect_worker(
            &self,
            _connection: WorkerConnection,
        ) -> Result<Arc<dyn ManagerApi>, RpcError> {
            Err(RpcError::Unreachable("not a real manager".to_string()))
        }

        async fn disconnect_worker(&self, _id: &WorkerId) -> Result<(), RpcError> {
            Ok(())
        }
    }

    fn manager_handle(id: &str) -> ManagerHandle {
        ManagerHandle {
            id: ManagerId::from(id),
            api: Arc::new(DummyManagerApi),
        }
    }

    fn short_timeout_config() -> WorkforceConfig {
        WorkforceConfig {
            heartbeat_timeout: Duration::from_millis(20),
            liveness_check_interval: Duration::from_millis(5),
            ..WorkforceConfig::default()
        }
    }

    #[test]
    async fn new_manager_is_announced_to_connected_workers() {
        let workforce = Workforce::new(WorkforceConfig::default());
        let worker_sub = Arc::new(RecordingSubscriber::default());

        workforce
            .register_worker(
                WorkerId::from("w1"),
                WorkerCapabilities::default(),
                worker_sub.clone(),
            )
            .await
            .unwrap();

        workforce
            .register_expectation_manager(
                manager_handle("em1"),
                Arc::new(RecordingSubscriber::default()),
            )
            .await
            .unwrap();

        assert_eq!(worker_sub.events(), vec!["manager_joined:em1".to_string()]);
    }

    #[test]
    async fn joining_worker_receives_current_managers() {
        let workforce = Workforce::new(WorkforceConfig::default());
        workforce
            .register_expectation_manager(
                manager_handle("em1"),
                Arc::new(RecordingSubscriber::default()),
            )
            .await
            .unwrap();

        let worker_sub = Arc::new(RecordingSubscriber::default());
        workforce
            .register_worker(
                WorkerId::from("w1"),
                WorkerCapabilities::default(),
                worker_sub.clone(),
            )
            .await
            .unwrap();

        assert_eq!(worker_sub.events(), vec!["manager_joined:em1".to_string()]);
    }

    #[test]
    async fn registration_is_idempotent() {
        let workforce = Workforce::new(WorkforceConfig::default());
        let manager_sub = Arc::new(RecordingSubscriber::default());
        workforce
            .register_expectation_manager(manager_handle("em1"), manager_sub.clone())
            .await
            .unwrap();

        let worker_sub = Arc::new(RecordingSubscriber::default());
        workforce
            .register_worker(
                WorkerId::from("w1"),
                WorkerCapabilities::default(),
                worker_sub.clone(),
            )
            .await
            .unwrap();
        workforce
            .register_worker(
                WorkerId::from("w1"),
                WorkerCapabilities::default(),
                worker_sub.clone(),
            )
            .await
            .unwrap();

        // Only one worker_joined despite two registrations.
        assert_eq!(manager_sub.events(), vec!["worker_joined:w1".to_string()]);
        assert_eq!(workforce.list_workers().await.unwrap().len(), 1);
    }

    #[test]
    async fn silent_worker_is_expired_and_fanned_out() {
        let workforce = Workforce::new(short_timeout_config());
        let manager_sub = Arc::new(RecordingSubscriber::default());
        workforce
            .register_expectation_manager(manager_handle("em1"), manager_sub.clone())
            .await
            .unwrap();
        workforce
            .register_worker(
                WorkerId::from("w1"),
                WorkerCapabilities::default(),
                Arc::new(RecordingSubscriber::default()),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        workforce.expire_silent_parties().await;

        assert!(workforce.list_workers().await.unwrap().is_empty());
        assert!(manager_sub
            .events()
            .contains(&"worker_left:w1".to_string()));

        let ack = workforce
            .heartbeat_worker(&WorkerId::from("w1"))
            .await
            .unwrap();
        assert!(!ack.known);
    }

    #[test]
    #[tracing_test::traced_test]
    async fn expiry_is_logged() {
        let workforce = Workforce::new(short_timeout_config());
        workforce
            .register_worker(
                WorkerId::from("w1"),
                WorkerCapabilities::default(),
                Arc::new(RecordingSubscriber::default()),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        workforce.expire_silent_parties().await;

        assert!(logs_contain("worker missed heartbeats, expiring"));
    }

    #[test]
    async fn heartbeat_keeps_parties_alive() {
        let workforce = Workforce::new(short_timeout_config());
        workforce
            .register_worker(
                WorkerId::from("w1"),
                WorkerCapabilities::default(),
                Arc::new(RecordingSubscriber::default()),
            )
            .await
            .unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let ack = workforce
                .heartbeat_worker(&WorkerId::from("w1"))
                .await
                .unwrap();
            assert!(ack.known);
            workforce.expire_silent_parties().await;
        }

        assert_eq!(workforce.list_workers().await.unwrap().len(), 1);
    }
}
