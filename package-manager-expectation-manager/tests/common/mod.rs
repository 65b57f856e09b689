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

//! In-process test cluster: a real workforce, a real expectation
//! manager and real worker agents whose only fake part is the executor,
//! which copies entries between two in-memory "containers".

use async_trait::async_trait;
use package_manager_common::api::{
    ContainerMonitorResult, CostResult, FulfilledResult, ReadyResult, RemoveResult, RpcError,
    StatusSink, SupportResult, WorkerCapabilities,
};
use package_manager_common::model::{
    Accessor, AccessorId, AccessorKind, ContainerId, ContainerStatusReport, EndRequirement,
    Expectation, ExpectationId, ExpectationState, ExpectationStatusReport,
    ExpectedPackageContainer, PackageContainerRef, PackageContent, Reason, StartRequirement,
    StatusReportSettings, WorkOptions,
};
use package_manager_expectation_manager::config::ExpectationManagerConfig;
use package_manager_expectation_manager::ExpectationManager;
use package_manager_worker::config::WorkerConfig;
use package_manager_worker::handler::{ExpectationHandler, WorkEventSender};
use package_manager_worker::WorkerAgent;
use package_manager_workforce::config::WorkforceConfig;
use package_manager_workforce::Workforce;
use package_manager_common::api::WorkforceApi;
use package_manager_common::config::RetryConfig;
use package_manager_common::tracing::TracingConfig;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// The virtual storage a scripted executor works against: which files
/// exist at the source, and what has been written to the target.
#[derive(Default)]
pub struct VirtualStorage {
    pub sources: Mutex<HashSet<String>>,
    pub targets: Mutex<HashMap<String, String>>,
}

impl VirtualStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_source(&self, path: &str) {
        self.sources.lock().unwrap().insert(path.to_string());
    }

    pub fn remove_target(&self, path: &str) {
        self.targets.lock().unwrap().remove(path);
    }

    pub fn target_version(&self, path: &str) -> Option<String> {
        self.targets.lock().unwrap().get(path).cloned()
    }
}

fn file_path(exp: &Expectation) -> String {
    match &exp.end_requirement.content {
        PackageContent::MediaFile { file_path } => file_path.clone(),
        PackageContent::JsonData { path } => path.clone(),
        PackageContent::QuantelClip { guid, title } => guid
            .clone()
            .or_else(|| title.clone())
            .unwrap_or_default(),
    }
}

fn uses_accessor_kind(refs: &[PackageContainerRef], matcher: fn(&AccessorKind) -> bool) -> bool {
    refs.iter()
        .all(|r| r.accessors.values().any(|a| matcher(&a.kind)))
}

/// Copies "files" from the virtual source set to the virtual target map.
/// Only takes expectations whose containers are reachable over local
/// folder accessors (or HTTP, when configured that way).
pub struct CopyHandler {
    pub storage: Arc<VirtualStorage>,
    pub accepts_local_folders: bool,
    pub work_delay: Duration,
    pub cron_runs: Mutex<Vec<ContainerId>>,
}

impl CopyHandler {
    pub fn local(storage: Arc<VirtualStorage>) -> Arc<Self> {
        Arc::new(Self {
            storage,
            accepts_local_folders: true,
            work_delay: Duration::from_millis(10),
            cron_runs: Mutex::new(Vec::new()),
        })
    }

    pub fn http_only(storage: Arc<VirtualStorage>) -> Arc<Self> {
        Arc::new(Self {
            storage,
            accepts_local_folders: false,
            work_delay: Duration::from_millis(10),
            cron_runs: Mutex::new(Vec::new()),
        })
    }

    pub fn slow(storage: Arc<VirtualStorage>, work_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            storage,
            accepts_local_folders: true,
            work_delay,
            cron_runs: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl ExpectationHandler for CopyHandler {
    fn name(&self) -> &'static str {
        "virtual-copy"
    }

    async fn supports(&self, exp: &Expectation) -> SupportResult {
        let matcher: fn(&AccessorKind) -> bool = if self.accepts_local_folders {
            |kind| matches!(kind, AccessorKind::LocalFolder { .. })
        } else {
            |kind| matches!(kind, AccessorKind::Http { .. })
        };
        let support = uses_accessor_kind(&exp.start_requirement.sources, matcher)
            && uses_accessor_kind(&exp.end_requirement.targets, matcher);
        SupportResult {
            support,
            reason: if support {
                Reason::uniform("accessors reachable")
            } else {
                Reason::uniform("no matching accessor")
            },
        }
    }

    async fn cost(&self, _exp: &Expectation) -> CostResult {
        CostResult {
            cost: 1.0,
            reason: None,
        }
    }

    async fn is_ready(&self, exp: &Expectation) -> ReadyResult {
        let path = file_path(exp);
        let source_exists = self.storage.sources.lock().unwrap().contains(&path);
        ReadyResult {
            ready: source_exists,
            is_waiting_for_another: false,
            source_exists: Some(source_exists),
            reason: if source_exists {
                Reason::uniform("source present")
            } else {
                Reason::uniform("source file does not exist")
            },
        }
    }

    async fn is_fulfilled(&self, exp: &Expectation, _was_fulfilled: bool) -> FulfilledResult {
        let path = file_path(exp);
        match self.storage.target_version(&path) {
            Some(version) if version == exp.content_version_hash => FulfilledResult {
                fulfilled: true,
                actual_version_hash: Some(version),
                reason: Reason::uniform("target matches"),
            },
            Some(version) => FulfilledResult {
                fulfilled: false,
                actual_version_hash: Some(version),
                reason: Reason::uniform("target holds another version"),
            },
            None => FulfilledResult {
                fulfilled: false,
                actual_version_hash: None,
                reason: Reason::uniform("target missing"),
            },
        }
    }

    async fn work(&self, exp: &Expectation, events: WorkEventSender) {
        let path = file_path(exp);
        events.progress(0.4);
        tokio::time::sleep(self.work_delay).await;
        if !self.storage.sources.lock().unwrap().contains(&path) {
            events.error(Reason::uniform("source vanished mid-copy"));
            return;
        }
        self.storage
            .targets
            .lock()
            .unwrap()
            .insert(path, exp.content_version_hash.clone());
        events.done(exp.content_version_hash.clone(), Reason::uniform("copied"));
    }

    async fn remove(&self, exp: &Expectation) -> RemoveResult {
        self.storage.remove_target(&file_path(exp));
        RemoveResult {
            removed: true,
            reason: Reason::uniform("target removed"),
        }
    }

    async fn run_container_cron_job(
        &self,
        container: &ExpectedPackageContainer,
    ) -> ContainerMonitorResult {
        self.cron_runs.lock().unwrap().push(container.id.clone());
        ContainerMonitorResult {
            ok: true,
            reason: Reason::uniform("cleanup ran"),
        }
    }

    async fn setup_container_monitors(
        &self,
        _container: &ExpectedPackageContainer,
    ) -> ContainerMonitorResult {
        ContainerMonitorResult {
            ok: true,
            reason: Reason::uniform("monitoring"),
        }
    }
}

/// Records every published report, in arrival order.
#[derive(Default)]
pub struct CollectingSink {
    pub expectation_reports: Mutex<Vec<ExpectationStatusReport>>,
    pub container_reports: Mutex<Vec<ContainerStatusReport>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn states_of(&self, id: &ExpectationId) -> Vec<ExpectationState> {
        self.expectation_reports
            .lock()
            .unwrap()
            .iter()
            .filter(|r| &r.id == id)
            .map(|r| r.state)
            .collect()
    }

    pub fn last_report_of(&self, id: &ExpectationId) -> Option<ExpectationStatusReport> {
        self.expectation_reports
            .lock()
            .unwrap()
            .iter()
            .filter(|r| &r.id == id)
            .next_back()
            .cloned()
    }

    pub fn report_count(&self) -> usize {
        self.expectation_reports.lock().unwrap().len()
    }

    /// True when `wanted` appears as a (not necessarily contiguous)
    /// subsequence of the published states for `id`.
    pub fn saw_state_sequence(&self, id: &ExpectationId, wanted: &[ExpectationState]) -> bool {
        let states = self.states_of(id);
        let mut cursor = wanted.iter().peekable();
        for state in states {
            if cursor.peek() == Some(&&state) {
                cursor.next();
            }
        }
        cursor.peek().is_none()
    }
}

#[async_trait]
impl StatusSink for CollectingSink {
    async fn publish_expectation_statuses(
        &self,
        statuses: Vec<ExpectationStatusReport>,
    ) -> Result<(), RpcError> {
        self.expectation_reports.lock().unwrap().extend(statuses);
        Ok(())
    }

    async fn publish_container_statuses(
        &self,
        statuses: Vec<ContainerStatusReport>,
    ) -> Result<(), RpcError> {
        self.container_reports.lock().unwrap().extend(statuses);
        Ok(())
    }
}

pub fn test_manager_config() -> ExpectationManagerConfig {
    ExpectationManagerConfig {
        tracing: TracingConfig::local_dev("expectation-manager-test"),
        evaluation_interval: Duration::from_millis(20),
        rpc_timeout: Duration::from_millis(500),
        heartbeat_interval: Duration::from_millis(50),
        unsupported_worker_ttl: Duration::from_millis(100),
        backoff_base: Duration::from_millis(50),
        backoff_max: Duration::from_millis(500),
        fulfilled_reverify_interval: Duration::from_millis(100),
        publication_window: Duration::from_millis(5),
        publication_retries: RetryConfig::default(),
        container_cron_interval: Duration::from_millis(50),
        ..ExpectationManagerConfig::default()
    }
}

pub fn test_workforce_config() -> WorkforceConfig {
    WorkforceConfig {
        heartbeat_timeout: Duration::from_millis(200),
        liveness_check_interval: Duration::from_millis(50),
        ..WorkforceConfig::default()
    }
}

/// One running in-process cluster.
pub struct TestCluster {
    pub workforce: Arc<Workforce>,
    pub manager: Arc<ExpectationManager>,
    pub sink: Arc<CollectingSink>,
    tasks: Vec<JoinHandle<()>>,
    worker_sessions: HashMap<String, JoinHandle<()>>,
}

impl TestCluster {
    pub async fn start() -> Self {
        let workforce = Workforce::new(test_workforce_config());
        let liveness = workforce.start_liveness_watch();

        let sink = CollectingSink::new();
        let (manager, evaluation_loop) =
            ExpectationManager::new(test_manager_config(), sink.clone());
        let loop_task = tokio::spawn(evaluation_loop.run());

        let manager_session = {
            let manager = manager.clone();
            let workforce: Arc<dyn WorkforceApi> = workforce.clone();
            tokio::spawn(async move {
                let _ = manager.run_workforce_session(workforce).await;
            })
        };

        Self {
            workforce,
            manager,
            sink,
            tasks: vec![liveness, loop_task, manager_session],
            worker_sessions: HashMap::new(),
        }
    }

    pub async fn add_worker(
        &mut self,
        id: &str,
        concurrency_limit: usize,
        handler: Arc<dyn ExpectationHandler>,
    ) -> Arc<WorkerAgent> {
        let config = WorkerConfig {
            tracing: TracingConfig::local_dev("worker-test"),
            worker_id: id.to_string(),
            capabilities: WorkerCapabilities { concurrency_limit },
            heartbeat_interval: Duration::from_millis(50),
        };
        let agent = WorkerAgent::new(config, vec![handler]);
        let session = {
            let agent = agent.clone();
            let workforce: Arc<dyn WorkforceApi> = self.workforce.clone();
            tokio::spawn(async move {
                let _ = agent.run_workforce_session(workforce).await;
            })
        };
        self.worker_sessions.insert(id.to_string(), session);
        // Give the join fan-out a moment to settle.
        tokio::time::sleep(Duration::from_millis(20)).await;
        agent
    }

    /// Simulates the worker dropping off the network: its heartbeats
    /// stop and the workforce expires it.
    pub fn kill_worker_heartbeats(&mut self, id: &str) {
        if let Some(session) = self.worker_sessions.remove(id) {
            session.abort();
        }
    }

    pub async fn wait_for_state(
        &self,
        id: &str,
        state: ExpectationState,
        timeout: Duration,
    ) -> bool {
        let id = ExpectationId::from(id);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self
                .sink
                .last_report_of(&id)
                .is_some_and(|r| r.state == state)
            {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        for session in self.worker_sessions.values() {
            session.abort();
        }
    }
}

pub fn local_container_ref(container: &str, path: &str) -> PackageContainerRef {
    PackageContainerRef {
        container_id: ContainerId::from(container),
        label: container.to_string(),
        accessors: HashMap::from([(
            AccessorId::from("local"),
            Accessor {
                allow_read: true,
                allow_write: true,
                kind: AccessorKind::LocalFolder {
                    folder_path: path.to_string(),
                },
            },
        )]),
    }
}

pub fn media_expectation(id: &str, priority: i32, version_hash: &str) -> Expectation {
    Expectation {
        id: ExpectationId::from(id),
        priority,
        status_report: StatusReportSettings {
            label: id.to_string(),
            description: format!("Copy of {id}"),
            send_report: true,
        },
        start_requirement: StartRequirement {
            sources: vec![local_container_ref("source", "/src")],
        },
        end_requirement: EndRequirement {
            targets: vec![local_container_ref("target", "/dst")],
            content: PackageContent::MediaFile {
                file_path: format!("/dst/{id}.mp4"),
            },
            version: Default::default(),
        },
        work_options: WorkOptions::default(),
        depends_on_fulfilled: vec![],
        triggered_by_fulfilled_ids: vec![],
        content_version_hash: version_hash.to_string(),
    }
}

/// The path the copy handler reads and writes for an expectation built
/// by [`media_expectation`].
pub fn media_path(id: &str) -> String {
    format!("/dst/{id}.mp4")
}
