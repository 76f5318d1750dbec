// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
use crate::fedflow_config::config as fedflow_app_config;

pub(crate) fn worker_threads() -> usize {
    fedflow_app_config()
        .ok()
        .map(|c| c.runtime.actual_worker_threads())
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
}

pub(crate) fn worker_queue_capacity() -> usize {
    fedflow_app_config()
        .ok()
        .map(|c| c.runtime.worker_queue_capacity)
        .unwrap_or(256)
}

pub(crate) fn queue_overload_factor() -> f64 {
    fedflow_app_config()
        .ok()
        .map(|c| c.runtime.queue_overload_factor)
        .unwrap_or(2.0)
}

pub(crate) fn queue_overload_slack() -> usize {
    fedflow_app_config()
        .ok()
        .map(|c| c.runtime.queue_overload_slack)
        .unwrap_or(4)
}

pub(crate) fn queue_lock_retries() -> usize {
    fedflow_app_config()
        .ok()
        .map(|c| c.runtime.queue_lock_retries)
        .unwrap_or(16)
}

pub(crate) fn idle_park_ms() -> u64 {
    fedflow_app_config()
        .ok()
        .map(|c| c.runtime.idle_park_ms)
        .unwrap_or(20)
}

pub(crate) fn state_lock_spins() -> u32 {
    fedflow_app_config()
        .ok()
        .map(|c| c.runtime.state_lock_spins)
        .unwrap_or(64)
}

pub(crate) fn fan_out_max_clock_gap() -> u64 {
    fedflow_app_config()
        .ok()
        .map(|c| c.runtime.fan_out_max_clock_gap)
        .unwrap_or(4096)
}

pub(crate) fn fan_in_max_connector_request() -> u64 {
    fedflow_app_config()
        .ok()
        .map(|c| c.runtime.fan_in_max_connector_request)
        .unwrap_or(2048)
}

pub(crate) fn callback_max_buffered_rows() -> u64 {
    fedflow_app_config()
        .ok()
        .map(|c| c.runtime.callback_max_buffered_rows)
        .unwrap_or(16_384)
}
