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

use crate::model::{ContainerId, ExpectationId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Lifecycle state of a tracked expectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExpectationState {
    New,
    Waiting,
    Ready,
    Working,
    Fulfilled,
    Removed,
    Restarted,
    Aborted,
}

impl Display for ExpectationState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ExpectationState::New => write!(f, "NEW"),
            ExpectationState::Waiting => write!(f, "WAITING"),
            ExpectationState::Ready => write!(f, "READY"),
            ExpectationState::Working => write!(f, "WORKING"),
            ExpectationState::Fulfilled => write!(f, "FULFILLED"),
            ExpectationState::Removed => write!(f, "REMOVED"),
            ExpectationState::Restarted => write!(f, "RESTARTED"),
            ExpectationState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Why an expectation is in the state it is in. The user string is safe
/// for operator UIs; the tech string may carry diagnostic context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Reason {
    pub user: String,
    pub tech: String,
}

impl Reason {
    pub fn new(user: impl Into<String>, tech: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            tech: tech.into(),
        }
    }

    /// Both sides carry the same text.
    pub fn uniform(text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            user: text.clone(),
            tech: text,
        }
    }
}

impl Display for Reason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.user == self.tech {
            write!(f, "{}", self.user)
        } else {
            write!(f, "{} ({})", self.user, self.tech)
        }
    }
}

/// Mutable runtime status of a tracked expectation, filled in from worker
/// answers as evaluation progresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExpectationStatus {
    pub source_exists: Option<bool>,
    pub target_exists: Option<bool>,
    /// 0.0 ..= 1.0 while WORKING.
    pub work_progress: Option<f64>,
    pub actual_version_hash: Option<String>,
}

/// One record of the status-out stream, published after each transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpectationStatusReport {
    pub id: ExpectationId,
    pub state: ExpectationState,
    pub reason: Reason,
    pub status: ExpectationStatus,
    pub is_error: bool,
    pub updated_at: DateTime<Utc>,
}

/// Published per-container status, mirroring the expectation stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatusReport {
    pub id: ContainerId,
    pub monitors_ok: bool,
    pub reason: Reason,
    pub last_cron_run: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}
