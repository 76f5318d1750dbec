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
//! Process-wide execution environment.
//!
//! Responsibilities:
//! - Owns the task scheduler and the stage tuning derived from `[runtime]`.
//! - Hands out the `StageContext` every stage constructor takes.
//!
//! Key exported interfaces:
//! - Types: `ExecEnv`.

use anyhow::Result;

use crate::common::app_config::RuntimeConfig;
use crate::exec::pipeline::emitter::{StageConfig, StageContext};
use crate::exec::pipeline::scheduler::{Scheduler, SchedulerConfig, SchedulerHandle, SchedulerStats};
use crate::fedflow_logging::info;

pub struct ExecEnv {
    scheduler: Scheduler,
    context: StageContext,
}

impl ExecEnv {
    pub fn new(scheduler_config: SchedulerConfig, stage_config: StageConfig) -> Result<Self> {
        let scheduler = Scheduler::start(scheduler_config)?;
        let context = StageContext::new(scheduler.handle(), stage_config);
        info!(
            "exec env ready: workers={} fan_out_max_clock_gap={} fan_in_max_connector_request={}",
            scheduler.handle().worker_count(),
            context.config().fan_out_max_clock_gap,
            context.config().fan_in_max_connector_request
        );
        Ok(Self { scheduler, context })
    }

    pub fn from_runtime(runtime: &RuntimeConfig) -> Result<Self> {
        Self::new(
            SchedulerConfig::from_runtime(runtime),
            StageConfig::from_runtime(runtime),
        )
    }

    /// Environment configured from the process config, defaults if absent.
    pub fn from_app_config() -> Result<Self> {
        Self::new(
            SchedulerConfig::from_app_config(),
            StageConfig::from_app_config(),
        )
    }

    pub fn context(&self) -> &StageContext {
        &self.context
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        self.context.scheduler()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn shutdown(&self) {
        self.scheduler.shutdown();
    }
}
