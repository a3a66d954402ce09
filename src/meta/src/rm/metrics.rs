// Copyright 2026 Bosun Contributors
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

use std::sync::OnceLock;

use prometheus::{
    histogram_opts, register_histogram_vec_with_registry,
    register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry, HistogramVec,
    IntCounterVec, IntGaugeVec, Registry,
};

/// Scheduling metrics, labeled by resource pool.
#[derive(Clone)]
pub struct RmMetrics {
    pub task_queue_pending: IntGaugeVec,
    pub task_queue_allocated: IntGaugeVec,
    pub schedule_pass_count: IntCounterVec,
    pub schedule_pass_duration: HistogramVec,
    pub provisioner_desired_instances: IntGaugeVec,
}

impl RmMetrics {
    pub fn new(registry: &Registry) -> Self {
        let task_queue_pending = register_int_gauge_vec_with_registry!(
            "rm_task_queue_pending",
            "Requests queued but not yet placed",
            &["pool"],
            registry
        )
        .unwrap();
        let task_queue_allocated = register_int_gauge_vec_with_registry!(
            "rm_task_queue_allocated",
            "Requests currently holding resources",
            &["pool"],
            registry
        )
        .unwrap();
        let schedule_pass_count = register_int_counter_vec_with_registry!(
            "rm_schedule_pass_total",
            "Completed scheduling passes",
            &["pool"],
            registry
        )
        .unwrap();
        let schedule_pass_duration = register_histogram_vec_with_registry!(
            histogram_opts!(
                "rm_schedule_pass_duration_seconds",
                "Wall time of one scheduling pass",
                prometheus::exponential_buckets(0.0001, 4.0, 10).unwrap()
            ),
            &["pool"],
            registry
        )
        .unwrap();
        let provisioner_desired_instances = register_int_gauge_vec_with_registry!(
            "rm_provisioner_desired_instances",
            "Instance count most recently requested from the provisioner",
            &["pool"],
            registry
        )
        .unwrap();

        Self {
            task_queue_pending,
            task_queue_allocated,
            schedule_pass_count,
            schedule_pass_duration,
            provisioner_desired_instances,
        }
    }

    #[cfg(test)]
    pub fn for_test() -> Self {
        Self::new(&Registry::new())
    }
}

static GLOBAL_RM_METRICS: OnceLock<RmMetrics> = OnceLock::new();

pub fn global_rm_metrics() -> &'static RmMetrics {
    GLOBAL_RM_METRICS.get_or_init(|| RmMetrics::new(prometheus::default_registry()))
}
