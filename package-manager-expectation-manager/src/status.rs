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

//! Status publication to the upstream control plane. Updates for the
//! same id coalesce within a publication window (latest wins); failed
//! publications are retried and then carried into the next batch, so an
//! update is superseded or delivered, never silently dropped.

use crate::metrics;
use package_manager_common::api::{RpcError, StatusSink};
use package_manager_common::config::RetryConfig;
use package_manager_common::model::{
    ContainerId, ContainerStatusReport, ExpectationId, ExpectationStatusReport,
};
use package_manager_common::retries::with_retries;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

pub enum StatusUpdate {
    Expectation(ExpectationStatusReport),
    Container(ContainerStatusReport),
}

/// The loop-side handle; the single producer of the publication queue.
#[derive(Clone)]
pub struct StatusPublisher {
    tx: mpsc::UnboundedSender<StatusUpdate>,
}

impl StatusPublisher {
    pub fn start(
        sink: Arc<dyn StatusSink>,
        window: Duration,
        retries: RetryConfig,
    ) -> (StatusPublisher, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_publisher(sink, window, retries, rx));
        (StatusPublisher { tx }, task)
    }

    pub fn enqueue_expectation(&self, report: ExpectationStatusReport) {
        let _ = self.tx.send(StatusUpdate::Expectation(report));
    }

    pub fn enqueue_container(&self, report: ContainerStatusReport) {
        let _ = self.tx.send(StatusUpdate::Container(report));
    }
}

struct Batches {
    expectations: HashMap<ExpectationId, ExpectationStatusReport>,
    containers: HashMap<ContainerId, ContainerStatusReport>,
}

impl Batches {
    fn new() -> Self {
        Self {
            expectations: HashMap::new(),
            containers: HashMap::new(),
        }
    }

    fn insert(&mut self, update: StatusUpdate) {
        match update {
            StatusUpdate::Expectation(report) => {
                self.expectations.insert(report.id.clone(), report);
            }
            StatusUpdate::Container(report) => {
                self.containers.insert(report.id.clone(), report);
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.expectations.is_empty() && self.containers.is_empty()
    }
}

async fn run_publisher(
    sink: Arc<dyn StatusSink>,
    window: Duration,
    retries: RetryConfig,
    mut rx: mpsc::UnboundedReceiver<StatusUpdate>,
) {
    let mut pending = Batches::new();
    let mut closed = false;

    loop {
        if pending.is_empty() {
            match rx.recv().await {
                Some(update) => pending.insert(update),
                None => break,
            }
        }

        // Let further updates coalesce into the batch.
        if !closed {
            let deadline = tokio::time::sleep(window);
            tokio::pin!(deadline);
            loop {
                tokio::select! {
                    _ = &mut deadline => break,
                    update = rx.recv() => match update {
                        Some(update) => pending.insert(update),
                        None => {
                            closed = true;
                            break;
                        }
                    },
                }
            }
        }

        if !pending.expectations.is_empty() {
            let batch: Vec<ExpectationStatusReport> =
                pending.expectations.drain().map(|(_, v)| v).collect();
            match publish_expectations(&sink, &retries, batch.clone()).await {
                Ok(()) => metrics::record_statuses_published(batch.len()),
                Err(err) => {
                    warn!("failed to publish {} expectation statuses: {err}", batch.len());
                    // Newer updates win over the failed ones.
                    for report in batch {
                        pending
                            .expectations
                            .entry(report.id.clone())
                            .or_insert(report);
                    }
                }
            }
        }

        if !pending.containers.is_empty() {
            let batch: Vec<ContainerStatusReport> =
                pending.containers.drain().map(|(_, v)| v).collect();
            match publish_containers(&sink, &retries, batch.clone()).await {
                Ok(()) => metrics::record_statuses_published(batch.len()),
                Err(err) => {
                    warn!("failed to publish {} container statuses: {err}", batch.len());
                    for report in batch {
                        pending.containers.entry(report.id.clone()).or_insert(report);
                    }
                }
            }
        }

        if closed && pending.is_empty() {
            break;
        }
    }
}

async fn publish_expectations(
    sink: &Arc<dyn StatusSink>,
    retries: &RetryConfig,
    batch: Vec<ExpectationStatusReport>,
) -> Result<(), RpcError> {
    with_retries(
        "status",
        "publish-expectations",
        None,
        retries,
        &(sink.clone(), batch),
        |(sink, batch)| {
            Box::pin(async move { sink.publish_expectation_statuses(batch.clone()).await })
        },
        |_| true,
    )
    .await
}

async fn publish_containers(
    sink: &Arc<dyn StatusSink>,
    retries: &RetryConfig,
    batch: Vec<ContainerStatusReport>,
) -> Result<(), RpcError> {
    with_retries(
        "status",
        "publish-containers",
        None,
        retries,
        &(sink.clone(), batch),
        |(sink, batch)| {
            Box::pin(async move { sink.publish_container_statuses(batch.clone()).await })
        },
        |_| true,
    )
    .await
}
