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

use package_manager_common::api::WorkerCapabilities;
use package_manager_common::config::ConfigLoader;
use package_manager_common::tracing::TracingConfig;
use package_manager_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub tracing: TracingConfig,
    pub worker_id: String,
    pub capabilities: WorkerCapabilities,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("worker"),
            worker_id: "worker-0".to_string(),
            capabilities: WorkerCapabilities {
                concurrency_limit: 2,
            },
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

impl SafeDisplay for WorkerConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "worker id: {}", self.worker_id);
        let _ = writeln!(
            &mut result,
            "concurrency limit: {}",
            self.capabilities.concurrency_limit
        );
        let _ = writeln!(
            &mut result,
            "heartbeat interval: {:?}",
            self.heartbeat_interval
        );
        result
    }
}

pub fn make_config_loader() -> ConfigLoader<WorkerConfig> {
    ConfigLoader::new(&PathBuf::from("config/worker.toml"))
}
