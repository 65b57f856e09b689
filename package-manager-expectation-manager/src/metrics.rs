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
use package_manager_common::model::ExpectationState;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
    static ref STATE_TRANSITIONS: IntCounterVec = {
        let counter = IntCounterVec::new(
            Opts::new(
                "expectation_state_transitions_total",
                "Expectation state transitions",
            ),
            &["from", "to"],
        )
        .unwrap();
        REGISTRY.register(Box::new(counter.clone())).unwrap();
        counter
    };
    static ref EVALUATION_TICK_SECONDS: Histogram = {
        let histogram = Histogram::with_opts(
            HistogramOpts::new(
                "expectation_evaluation_tick_seconds",
                "Duration of one evaluation tick over all expectations",
            )
            .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )
        .unwrap();
        REGISTRY.register(Box::new(histogram.clone())).unwrap();
        histogram
    };
    static ref CONNECTED_WORKERS: IntGauge = {
        let gauge = IntGauge::with_opts(Opts::new(
            "expectation_manager_connected_workers",
            "Workers currently connected to this manager",
        ))
        .unwrap();
        REGISTRY.register(Box::new(gauge.clone())).unwrap();
        gauge
    };
    static ref STATUSES_PUBLISHED: IntCounter = {
        let counter = IntCounter::with_opts(Opts::new(
            "expectation_statuses_published_total",
            "Status records delivered upstream",
        ))
        .unwrap();
        REGISTRY.register(Box::new(counter.clone())).unwrap();
        counter
    };
}

pub fn register_all() -> Registry {
    REGISTRY.clone()
}

pub fn record_transition(from: ExpectationState, to: ExpectationState) {
    STATE_TRANSITIONS
        .with_label_values(&[&from.to_string(), &to.to_string()])
        .inc();
}

pub fn observe_tick_seconds(seconds: f64) {
    EVALUATION_TICK_SECONDS.observe(seconds);
}

pub fn set_connected_workers(count: usize) {
    CONNECTED_WORKERS.set(count as i64);
}

pub fn record_statuses_published(count: usize) {
    STATUSES_PUBLISHED.inc_by(count as u64);
}
