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

//! Shared unit-test fixtures: expectation builders and a scriptable
//! in-process worker.

use async_trait::async_trait;
use package_manager_common::api::{
    ContainerMonitorResult, CostResult, FulfilledResult, ReadyResult, RemoveResult, RpcError,
    SupportResult, WorkOnResult, WorkerApi, WorkerCapabilities,
};
use package_manager_common::model::{
    Accessor, AccessorId, AccessorKind, ContainerId, EndRequirement, Expectation, ExpectationId,
    ExpectedPackageContainer, PackageContainerRef, PackageContent, Reason, StartRequirement,
    StatusReportSettings, WorkInProgressId, WorkOptions,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn container_ref(container: &str, path: &str) -> PackageContainerRef {
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

pub fn media_expectation(id: &str, priority: i32) -> Expectation {
    Expectation {
        id: ExpectationId::from(id),
        priority,
        status_report: StatusReportSettings {
            label: id.to_string(),
            description: format!("Copy of {id}"),
            send_report: true,
        },
        start_requirement: StartRequirement {
            sources: vec![container_ref("source", "/src")],
        },
        end_requirement: EndRequirement {
            targets: vec![container_ref("target", "/dst")],
            content: PackageContent::MediaFile {
                file_path: format!("/dst/{id}.mp4"),
            },
            version: Default::default(),
        },
        work_options: WorkOptions::default(),
        depends_on_fulfilled: vec![],
        triggered_by_fulfilled_ids: vec![],
        content_version_hash: "h1".to_string(),
    }
}

/// What the scripted worker answers to `work_on_expectation`.
#[derive(Clone)]
pub enum WorkScript {
    Accept,
    Reject(Reason),
}

/// A worker whose protocol answers are set by the test.
pub struct MockWorker {
    support: AtomicBool,
    unreachable: AtomicBool,
    cost: Mutex<f64>,
    ready: Mutex<ReadyResult>,
    fulfilled: Mutex<FulfilledResult>,
    work: Mutex<WorkScript>,
    concurrency_limit: AtomicUsize,
    support_probes: AtomicUsize,
    work_calls: Mutex<Vec<ExpectationId>>,
    accepted_wips: Mutex<Vec<WorkInProgressId>>,
    cancelled: Mutex<Vec<WorkInProgressId>>,
    removed: Mutex<Vec<ExpectationId>>,
    cron_runs: Mutex<Vec<ContainerId>>,
}

impl MockWorker {
    pub fn supporting() -> Arc<Self> {
        Arc::new(Self {
            support: AtomicBool::new(true),
            unreachable: AtomicBool::new(false),
            cost: Mutex::new(1.0),
            ready: Mutex::new(ReadyResult {
                ready: true,
                is_waiting_for_another: false,
                source_exists: Some(true),
                reason: Reason::uniform("ready"),
            }),
            fulfilled: Mutex::new(FulfilledResult {
                fulfilled: false,
                actual_version_hash: None,
                reason: Reason::uniform("target missing"),
            }),
            work: Mutex::new(WorkScript::Accept),
            concurrency_limit: AtomicUsize::new(1),
            support_probes: AtomicUsize::new(0),
            work_calls: Mutex::new(Vec::new()),
            accepted_wips: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            cron_runs: Mutex::new(Vec::new()),
        })
    }

    pub fn unsupporting() -> Arc<Self> {
        let worker = Self::supporting();
        worker.support.store(false, Ordering::SeqCst);
        worker
    }

    pub fn with_cost(self: Arc<Self>, cost: f64) -> Arc<Self> {
        *self.cost.lock().unwrap() = cost;
        self
    }

    pub fn with_concurrency(self: Arc<Self>, limit: usize) -> Arc<Self> {
        self.concurrency_limit.store(limit, Ordering::SeqCst);
        self
    }

    pub fn capabilities(&self) -> WorkerCapabilities {
        WorkerCapabilities {
            concurrency_limit: self.concurrency_limit.load(Ordering::SeqCst),
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_ready(&self, ready: ReadyResult) {
        *self.ready.lock().unwrap() = ready;
    }

    pub fn set_fulfilled(&self, fulfilled: FulfilledResult) {
        *self.fulfilled.lock().unwrap() = fulfilled;
    }

    pub fn set_work(&self, script: WorkScript) {
        *self.work.lock().unwrap() = script;
    }

    pub fn support_probe_count(&self) -> usize {
        self.support_probes.load(Ordering::SeqCst)
    }

    pub fn work_calls(&self) -> Vec<ExpectationId> {
        self.work_calls.lock().unwrap().clone()
    }

    pub fn accepted_wips(&self) -> Vec<WorkInProgressId> {
        self.accepted_wips.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> Vec<WorkInProgressId> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<ExpectationId> {
        self.removed.lock().unwrap().clone()
    }

    pub fn cron_runs(&self) -> Vec<ContainerId> {
        self.cron_runs.lock().unwrap().clone()
    }

    fn check_reachable(&self) -> Result<(), RpcError> {
        if self.unreachable.load(Ordering::SeqCst) {
            Err(RpcError::Unreachable("scripted outage".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl WorkerApi for MockWorker {
    async fn do_you_support_expectation(
        &self,
        _exp: &Expectation,
    ) -> Result<SupportResult, RpcError> {
        self.check_reachable()?;
        self.support_probes.fetch_add(1, Ordering::SeqCst);
        let support = self.support.load(Ordering::SeqCst);
        Ok(SupportResult {
            support,
            reason: if support {
                Reason::uniform("supported")
            } else {
                Reason::uniform("accessor family not supported")
            },
        })
    }

    async fn get_cost_for_expectation(&self, _exp: &Expectation) -> Result<CostResult, RpcError> {
        self.check_reachable()?;
        Ok(CostResult {
            cost: *self.cost.lock().unwrap(),
            reason: None,
        })
    }

    async fn is_expectation_ready_to_start_working_on(
        &self,
        _exp: &Expectation,
    ) -> Result<ReadyResult, RpcError> {
        self.check_reachable()?;
        Ok(self.ready.lock().unwrap().clone())
    }

    async fn is_expectation_fulfilled(
        &self,
        _exp: &Expectation,
        _was_fulfilled: bool,
    ) -> Result<FulfilledResult, RpcError> {
        self.check_reachable()?;
        Ok(self.fulfilled.lock().unwrap().clone())
    }

    async fn work_on_expectation(&self, exp: &Expectation) -> Result<WorkOnResult, RpcError> {
        self.check_reachable()?;
        self.work_calls.lock().unwrap().push(exp.id.clone());
        match self.work.lock().unwrap().clone() {
            WorkScript::Accept => {
                let wip = WorkInProgressId::new();
                self.accepted_wips.lock().unwrap().push(wip);
                Ok(WorkOnResult::Accepted { wip })
            }
            WorkScript::Reject(reason) => Ok(WorkOnResult::Rejected { reason }),
        }
    }

    async fn remove_expectation(&self, exp: &Expectation) -> Result<RemoveResult, RpcError> {
        self.check_reachable()?;
        self.removed.lock().unwrap().push(exp.id.clone());
        Ok(RemoveResult {
            removed: true,
            reason: Reason::uniform("removed"),
        })
    }

    async fn cancel_work_in_progress(&self, wip: WorkInProgressId) -> Result<(), RpcError> {
        self.check_reachable()?;
        self.cancelled.lock().unwrap().push(wip);
        Ok(())
    }

    async fn setup_package_container_monitors(
        &self,
        _container: &ExpectedPackageContainer,
    ) -> Result<ContainerMonitorResult, RpcError> {
        self.check_reachable()?;
        Ok(ContainerMonitorResult {
            ok: true,
            reason: Reason::uniform("monitors set up"),
        })
    }

    async fn run_package_container_cron_job(
        &self,
        container: &ExpectedPackageContainer,
    ) -> Result<ContainerMonitorResult, RpcError> {
        self.check_reachable()?;
        self.cron_runs.lock().unwrap().push(container.id.clone());
        Ok(ContainerMonitorResult {
            ok: true,
            reason: Reason::uniform("cron ran"),
        })
    }
}
