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

use crate::config::RetryConfig;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use ::tracing::{info, warn};

/// Runs `action` until it succeeds, the error is not retriable, or
/// `config.max_attempts` is exhausted. `target` and `op` only label log
/// lines.
pub async fn with_retries<In, F, G, R, E>(
    target: &'static str,
    op: &'static str,
    details: Option<String>,
    config: &RetryConfig,
    input: &In,
    action: F,
    is_retriable: G,
) -> Result<R, E>
where
    In: Clone,
    F: for<'a> Fn(&'a In) -> Pin<Box<dyn Future<Output = Result<R, E>> + 'a + Send>>,
    G: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match action(input).await {
            Ok(result) => {
                if attempt > 1 {
                    info!(target_name = target, op, "succeeded after {attempt} attempts");
                }
                break Ok(result);
            }
            Err(error) if attempt < config.max_attempts && is_retriable(&error) => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    target_name = target,
                    op,
                    details = details.as_deref().unwrap_or(""),
                    "attempt {attempt} failed ({error}), retrying in {delay:?}"
                );
                tokio::time::sleep(delay).await;
            }
            Err(error) => break Err(error),
        }
    }
}
