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

//! Request coalescing: when a call with the same key is already in
//! flight, join its result instead of issuing a duplicate. Used for
//! worker capability probes and container queries.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Mutex;
use tokio::sync::watch;

pub struct InFlightCoalescer<K, V> {
    inflight: Mutex<HashMap<K, watch::Receiver<Option<V>>>>,
}

impl<K, V> Default for InFlightCoalescer<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> InFlightCoalescer<K, V> {
    pub fn new() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

struct InFlightGuard<'a, K: Eq + Hash + Clone, V> {
    inflight: &'a Mutex<HashMap<K, watch::Receiver<Option<V>>>>,
    key: K,
}

impl<K: Eq + Hash + Clone, V> Drop for InFlightGuard<'_, K, V> {
    fn drop(&mut self) {
        let mut inflight = self.inflight.lock().unwrap();
        inflight.remove(&self.key);
    }
}

enum Role<V> {
    Leader(watch::Sender<Option<V>>),
    Follower(watch::Receiver<Option<V>>),
}

impl<K: Eq + Hash + Clone, V: Clone> InFlightCoalescer<K, V> {
    /// Returns the result of `run`, or of an identical call already in
    /// flight. If the in-flight caller is cancelled before producing a
    /// value, one of the waiters takes over and runs itself.
    pub async fn get_or_run<F, Fut>(&self, key: K, run: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let mut run = Some(run);
        loop {
            let role = {
                let mut inflight = self.inflight.lock().unwrap();
                match inflight.entry(key.clone()) {
                    std::collections::hash_map::Entry::Occupied(entry) => {
                        Role::Follower(entry.get().clone())
                    }
                    std::collections::hash_map::Entry::Vacant(entry) => {
                        let (tx, rx) = watch::channel(None);
                        entry.insert(rx);
                        Role::Leader(tx)
                    }
                }
            };

            match role {
                Role::Leader(tx) => {
                    let _guard = InFlightGuard {
                        inflight: &self.inflight,
                        key: key.clone(),
                    };
                    let value = (run.take().expect("leader runs at most once"))().await;
                    let _ = tx.send(Some(value.clone()));
                    return value;
                }
                Role::Follower(mut rx) => loop {
                    if let Some(value) = rx.borrow_and_update().as_ref() {
                        return value.clone();
                    }
                    if rx.changed().await.is_err() {
                        // Leader was cancelled; retry from the top.
                        break;
                    }
                },
            }
        }
    }
}
