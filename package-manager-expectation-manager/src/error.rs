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

use package_manager_common::api::RpcError;
use package_manager_common::model::Reason;

/// Failure of one evaluation step. The evaluation loop interprets the
/// variant to decide whether the failure is charged to the expectation
/// (backoff) or to the worker (re-selection).
#[derive(Debug, Clone, thiserror::Error)]
pub enum EvalError {
    /// Peer unreachable or timed out; the worker is at fault, the
    /// expectation is not charged.
    #[error("transport: {0}")]
    Transport(#[from] RpcError),
    /// The worker explicitly said the expectation cannot proceed;
    /// charged against the expectation, backoff applies.
    #[error("worker reported: {0}")]
    WorkerReported(Reason),
    /// The expectation definition is unusable; parked until upstream
    /// replaces the definition.
    #[error("config: {0}")]
    Config(String),
    /// Manager-side invariant violation; the expectation is reset and
    /// the loop continues.
    #[error("internal: {0}")]
    Internal(String),
}

impl EvalError {
    /// Short diagnostic for tech reasons, bounded so a pathological
    /// error cannot flood the status stream.
    pub fn summary(&self) -> String {
        const MAX: usize = 300;
        let text = self.to_string();
        if text.len() > MAX {
            let mut end = MAX;
            while !text.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}…", &text[..end])
        } else {
            text
        }
    }
}
