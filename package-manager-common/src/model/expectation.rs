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

use crate::model::{
    ExpectationId, PackageContainerRef, PackageContent, PackageType, PackageVersion,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A declarative unit of work: "this package should be in this state over
/// there". Immutable per id; upstream replaces the definition (and thereby
/// its content version hash) instead of mutating it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expectation {
    pub id: ExpectationId,
    /// Total order, lower is more urgent.
    pub priority: i32,
    pub status_report: StatusReportSettings,
    pub start_requirement: StartRequirement,
    pub end_requirement: EndRequirement,
    #[serde(default)]
    pub work_options: WorkOptions,
    /// Expectations that must be fulfilled before this one may leave NEW.
    #[serde(default)]
    pub depends_on_fulfilled: Vec<ExpectationId>,
    /// Expectations whose fulfillment should re-evaluate this one
    /// immediately.
    #[serde(default)]
    pub triggered_by_fulfilled_ids: Vec<ExpectationId>,
    /// Fingerprint of the content+version this expectation is about; a
    /// fulfilled expectation must report this exact hash back.
    pub content_version_hash: String,
}

impl Expectation {
    pub fn package_type(&self) -> PackageType {
        self.end_requirement.content.package_type()
    }
}

/// Operator-facing presentation settings, passed through to status
/// reports untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReportSettings {
    pub label: String,
    pub description: String,
    #[serde(default)]
    pub send_report: bool,
}

/// Where the package comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRequirement {
    pub sources: Vec<PackageContainerRef>,
}

/// Where the package should end up, and what exactly should be there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndRequirement {
    pub targets: Vec<PackageContainerRef>,
    pub content: PackageContent,
    #[serde(default)]
    pub version: PackageVersion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WorkOptions {
    /// The work may be queued behind other CPU-bound work instead of
    /// being rejected when the worker is saturated.
    #[serde(default)]
    pub allow_wait_for_cpu: bool,
    #[serde(default)]
    pub uses_cpu_count: Option<u32>,
    #[serde(default)]
    pub required_for_playout: bool,
    /// When the expectation is removed, delay the removal work by this
    /// much in case the removal was a glitch in the upstream set.
    #[serde(default, with = "humantime_serde::option")]
    pub remove_delay: Option<Duration>,
}
