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

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// The first-class package kinds. Side-effect work (thumbnails, previews,
/// loudness scans) is expressed as additional expectations over the same
/// kinds, so nothing here distinguishes primary from derived packages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PackageType {
    MediaFile,
    QuantelClip,
    JsonData,
}

impl Display for PackageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            PackageType::MediaFile => write!(f, "media_file"),
            PackageType::QuantelClip => write!(f, "quantel_clip"),
            PackageType::JsonData => write!(f, "json_data"),
        }
    }
}

/// Identity of a package, tagged by package type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PackageContent {
    MediaFile {
        file_path: String,
    },
    /// A clip is identified by guid when one is known, otherwise by title.
    QuantelClip {
        guid: Option<String>,
        title: Option<String>,
    },
    JsonData {
        path: String,
    },
}

impl PackageContent {
    pub fn package_type(&self) -> PackageType {
        match self {
            PackageContent::MediaFile { .. } => PackageType::MediaFile,
            PackageContent::QuantelClip { .. } => PackageType::QuantelClip,
            PackageContent::JsonData { .. } => PackageType::JsonData,
        }
    }

    /// A short human-readable identity, used in reasons shown to operators.
    pub fn display_name(&self) -> String {
        match self {
            PackageContent::MediaFile { file_path } => file_path.clone(),
            PackageContent::QuantelClip { guid, title } => guid
                .clone()
                .or_else(|| title.clone())
                .unwrap_or_else(|| "<unknown clip>".to_string()),
            PackageContent::JsonData { path } => path.clone(),
        }
    }
}

/// Revision of a package, tagged by package type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "type")]
pub enum PackageVersion {
    MediaFile {
        file_size: Option<u64>,
        modified_date: Option<i64>,
        checksum: Option<String>,
    },
    QuantelClip {
        created: Option<String>,
        clone_id: Option<i32>,
    },
    JsonData {
        modified_date: Option<i64>,
    },
    /// Upstream has not declared a version; any existing revision matches.
    #[default]
    Unversioned,
}
