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

use package_manager_common::config::ConfigLoader;
use package_manager_common::tracing::TracingConfig;
use package_manager_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkforceConfig {
    pub tracing: TracingConfig,
    /// A party silent for longer than this is declared disconnected.
    #[serde(with = "humantime_serde")]
    pub heartbeat_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub liveness_check_interval: Duration,
}

impl Default for WorkforceConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("workforce"),
            heartbeat_timeout: Duration::from_secs(15),
            liveness_check_interval: Duration::from_secs(5),
        }
    }
}

impl SafeDisplay for WorkforceConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "heartbeat timeout: {:?}", self.heartbeat_timeout);
        let _ = writeln!(
            &mut result,
            "liveness check interval: {:?}",
            self.liveness_check_interval
        );
        result
    }
}

pub fn make_config_loader() -> ConfigLoader<WorkforceConfig> {
    ConfigLoader::new(&PathBuf::from("config/workforce.toml"))
}
