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
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
    static ref REGISTERED_PARTIES: IntGaugeVec = {
        let gauge = IntGaugeVec::new(
            Opts::new("workforce_registered_parties", "Currently registered parties"),
            &["kind"],
        )
        .unwrap();
        REGISTRY.register(Box::new(gauge.clone())).unwrap();
        gauge
    };
    static ref PARTY_EXPIRATIONS: IntCounterVec = {
        let counter = IntCounterVec::new(
            Opts::new(
                "workforce_party_expirations_total",
                "Parties expired for missing heartbeats",
            ),
            &["kind"],
        )
        .unwrap();
        REGISTRY.register(Box::new(counter.clone())).unwrap();
        counter
    };
}

pub fn register_all() -> Registry {
    REGISTRY.clone()
}

pub fn set_registered_counts(managers: usize, workers: usize) {
    REGISTERED_PARTIES
        .with_label_values(&["manager"])
        .set(managers as i64);
    REGISTERED_PARTIES
        .with_label_values(&["worker"])
        .set(workers as i64);
}

pub fn record_party_expired(kind: &str) {
    PARTY_EXPIRATIONS.with_label_values(&[kind]).inc();
}
