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

use package_manager_common::config::{ConfigLoader, RetryConfig};
use package_manager_common::tracing::TracingConfig;
use package_manager_common::SafeDisplay;
use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectationManagerConfig {
    pub tracing: TracingConfig,
    pub manager_id: String,
    /// Pause between evaluation ticks when nothing is dirty.
    #[serde(with = "humantime_serde")]
    pub evaluation_interval: Duration,
    /// Every remote call made by the evaluation loop is bounded by this.
    #[serde(with = "humantime_serde")]
    pub rpc_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// How many workers may be probed for one expectation per tick.
    pub probe_budget: usize,
    /// How long a positive capability answer stays usable.
    #[serde(with = "humantime_serde")]
    pub available_worker_ttl: Duration,
    /// How long a negative capability answer suppresses re-probing.
    #[serde(with = "humantime_serde")]
    pub unsupported_worker_ttl: Duration,
    /// First delay after a worker-reported error; doubles per error up
    /// to `backoff_max`.
    #[serde(with = "humantime_serde")]
    pub backoff_base: Duration,
    #[serde(with = "humantime_serde")]
    pub backoff_max: Duration,
    /// Cadence of re-verifying FULFILLED expectations.
    #[serde(with = "humantime_serde")]
    pub fulfilled_reverify_interval: Duration,
    /// Status updates for the same id coalesce within this window.
    #[serde(with = "humantime_serde")]
    pub publication_window: Duration,
    pub publication_retries: RetryConfig,
    #[serde(with = "humantime_serde")]
    pub container_cron_interval: Duration,
}

impl Default for ExpectationManagerConfig {
    fn default() -> Self {
        Self {
            tracing: TracingConfig::local_dev("expectation-manager"),
            manager_id: "expectation-manager-0".to_string(),
            evaluation_interval: Duration::from_secs(1),
            rpc_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(5),
            probe_budget: 5,
            available_worker_ttl: Duration::from_secs(60),
            unsupported_worker_ttl: Duration::from_secs(10),
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(600),
            fulfilled_reverify_interval: Duration::from_secs(10),
            publication_window: Duration::from_millis(300),
            publication_retries: RetryConfig::default(),
            container_cron_interval: Duration::from_secs(60),
        }
    }
}

impl SafeDisplay for ExpectationManagerConfig {
    fn to_safe_string(&self) -> String {
        let mut result = String::new();
        let _ = writeln!(&mut result, "tracing:");
        let _ = writeln!(&mut result, "{}", self.tracing.to_safe_string_indented());
        let _ = writeln!(&mut result, "manager id: {}", self.manager_id);
        let _ = writeln!(
            &mut result,
            "evaluation interval: {:?}",
            self.evaluation_interval
        );
        let _ = writeln!(&mut result, "rpc timeout: {:?}", self.rpc_timeout);
        let _ = writeln!(&mut result, "probe budget: {}", self.probe_budget);
        let _ = writeln!(
            &mut result,
            "availability TTLs: +{:?} / -{:?}",
            self.available_worker_ttl, self.unsupported_worker_ttl
        );
        let _ = writeln!(
            &mut result,
            "error backoff: {:?} .. {:?}",
            self.backoff_base, self.backoff_max
        );
        let _ = writeln!(
            &mut result,
            "re-verify interval: {:?}",
            self.fulfilled_reverify_interval
        );
        let _ = writeln!(
            &mut result,
            "publication window: {:?}",
            self.publication_window
        );
        result
    }
}

pub fn make_config_loader() -> ConfigLoader<ExpectationManagerConfig> {
    ConfigLoader::new(&PathBuf::from("config/expectation-manager.toml"))
}
