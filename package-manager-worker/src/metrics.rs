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

use lazy_static::lazy_static;
use prometheus::{IntGauge, Opts, Registry};

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
    static ref WORK_IN_PROGRESS: IntGauge = {
        let gauge = IntGauge::with_opts(Opts::new(
            "worker_jobs_in_progress",
            "Jobs currently running on this worker",
        ))
        .unwrap();
        REGISTRY.register(Box::new(gauge.clone())).unwrap();
        gauge
    };
}

pub fn register_all() -> Registry {
    REGISTRY.clone()
}

pub fn set_work_in_progress(count: usize) {
    WORK_IN_PROGRESS.set(count as i64);
}
