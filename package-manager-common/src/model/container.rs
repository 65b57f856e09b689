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

use crate::model::{AccessorId, ContainerId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// A logical place where packages live: a folder, a share, an HTTP
/// endpoint or a video-server zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageContainer {
    pub label: String,
    pub accessors: HashMap<AccessorId, Accessor>,
}

impl PackageContainer {
    pub fn validate(&self) -> Result<(), String> {
        if self.accessors.is_empty() {
            return Err(format!("container \"{}\" has no accessors", self.label));
        }
        for (id, accessor) in &self.accessors {
            accessor
                .validate()
                .map_err(|e| format!("accessor \"{id}\": {e}"))?;
        }
        Ok(())
    }
}

/// A way of reaching a [`PackageContainer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Accessor {
    pub allow_read: bool,
    pub allow_write: bool,
    #[serde(flatten)]
    pub kind: AccessorKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AccessorKind {
    LocalFolder {
        folder_path: String,
    },
    FileShare {
        folder_path: String,
        user_name: Option<String>,
        password: Option<String>,
        network_id: Option<String>,
    },
    Http {
        base_url: String,
        is_immutable: bool,
    },
    HttpProxy {
        base_url: String,
    },
    Quantel {
        quantel_gateway_url: String,
        iso_urls: Vec<String>,
        zone_id: Option<String>,
        server_id: Option<i32>,
    },
    CorePackageInfo,
    AtemMediaStore {
        atem_host: String,
        media_pool_index: u32,
    },
}

impl Accessor {
    pub fn validate(&self) -> Result<(), String> {
        match &self.kind {
            AccessorKind::LocalFolder { folder_path } => {
                if folder_path.is_empty() {
                    return Err("local folder accessor has an empty folder path".to_string());
                }
            }
            AccessorKind::FileShare { folder_path, .. } => {
                if folder_path.is_empty() {
                    return Err("file share accessor has an empty folder path".to_string());
                }
            }
            AccessorKind::Http { base_url, .. } | AccessorKind::HttpProxy { base_url } => {
                if base_url.is_empty() {
                    return Err("http accessor has an empty base url".to_string());
                }
            }
            AccessorKind::Quantel {
                quantel_gateway_url,
                iso_urls,
                ..
            } => {
                if quantel_gateway_url.is_empty() {
                    return Err("quantel accessor has an empty gateway url".to_string());
                }
                if iso_urls.is_empty() {
                    return Err("quantel accessor has no ISA urls".to_string());
                }
            }
            AccessorKind::CorePackageInfo => {}
            AccessorKind::AtemMediaStore { atem_host, .. } => {
                if atem_host.is_empty() {
                    return Err("ATEM accessor has an empty host".to_string());
                }
            }
        }
        Ok(())
    }
}

/// A container reference as it appears inside an expectation's start or
/// end requirement: the container's identity plus the accessors the
/// worker may use to reach it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageContainerRef {
    pub container_id: ContainerId,
    pub label: String,
    pub accessors: HashMap<AccessorId, Accessor>,
}

/// Server-side duties attached to a container, carried out on a cadence
/// by a worker selected by the expectation manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ContainerCronJobs {
    /// Remove packages whose expectations disappeared more than
    /// `retention` ago.
    pub cleanup: Option<ContainerCleanup>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerCleanup {
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
}

/// An upstream-supplied container definition together with its duties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectedPackageContainer {
    pub id: ContainerId,
    pub container: PackageContainer,
    #[serde(default)]
    pub cron_jobs: ContainerCronJobs,
}
