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

use async_trait::async_trait;
use package_manager_common::api::{
    ContainerMonitorResult, CostResult, FulfilledResult, ReadyResult, RemoveResult, SupportResult,
    WorkEvent,
};
use package_manager_common::model::{Expectation, ExpectedPackageContainer, Reason};
use tokio::sync::mpsc;

/// Pushes progress out of a running job. The agent forwards the events
/// to the expectation manager that started the work.
#[derive(Clone)]
pub struct WorkEventSender {
    tx: mpsc::UnboundedSender<WorkEvent>,
}

impl WorkEventSender {
    pub fn new(tx: mpsc::UnboundedSender<WorkEvent>) -> Self {
        Self { tx }
    }

    pub fn progress(&self, progress: f64) {
        let _ = self.tx.send(WorkEvent::Progress { progress });
    }

    pub fn done(&self, actual_version_hash: impl Into<String>, reason: Reason) {
        let _ = self.tx.send(WorkEvent::Done {
            actual_version_hash: actual_version_hash.into(),
            reason,
        });
    }

    pub fn error(&self, reason: Reason) {
        let _ = self.tx.send(WorkEvent::Error { reason });
    }
}

/// One executor for one family of expectations (e.g. file copies over
/// local/share accessors). The agent routes every expectation to the
/// first handler that supports it; answers are local and infallible at
/// the transport level, failures are expressed in the result reasons.
#[async_trait]
pub trait ExpectationHandler: Send + Sync {
    /// Stable name, used in logs and cost reasons.
    fn name(&self) -> &'static str;

    async fn supports(&self, exp: &Expectation) -> SupportResult;

    async fn cost(&self, exp: &Expectation) -> CostResult;

    async fn is_ready(&self, exp: &Expectation) -> ReadyResult;

    async fn is_fulfilled(&self, exp: &Expectation, was_fulfilled: bool) -> FulfilledResult;

    /// Runs the work to completion, reporting through `events`. The
    /// final event must be `Done` or `Error`; the agent aborts the task
    /// on cancellation.
    async fn work(&self, exp: &Expectation, events: WorkEventSender);

    async fn remove(&self, exp: &Expectation) -> RemoveResult;

    async fn setup_container_monitors(
        &self,
        _container: &ExpectedPackageContainer,
    ) -> ContainerMonitorResult {
        ContainerMonitorResult {
            ok: false,
            reason: Reason::uniform("handler has no container monitors"),
        }
    }

    async fn run_container_cron_job(
        &self,
        _container: &ExpectedPackageContainer,
    ) -> ContainerMonitorResult {
        ContainerMonitorResult {
            ok: false,
            reason: Reason::uniform("handler has no container cron jobs"),
        }
    }
}
