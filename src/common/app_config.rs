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
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<FedflowConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static FedflowConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = FedflowConfig::load_from_file(&path)?;
    Ok(CONFIG.get_or_init(|| cfg))
}

pub fn init_from_env_or_default() -> Result<&'static FedflowConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = FedflowConfig::load_from_file(&path)?;
    Ok(CONFIG.get_or_init(|| cfg))
}

pub fn config() -> Result<&'static FedflowConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("FEDFLOW_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("fedflow.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $FEDFLOW_CONFIG or create ./fedflow.toml"
    ))
}

#[derive(Clone, Debug, Deserialize)]
pub struct FedflowConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "fedflow=debug,fedflow::exec::pipeline::scheduler=info"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl FedflowConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        Self::parse(&s).with_context(|| format!("parse toml: {}", path.display()))
    }

    pub fn parse(s: &str) -> Result<Self> {
        let cfg: FedflowConfig = toml::from_str(s)?;
        cfg.runtime.validate()?;
        Ok(cfg)
    }

    /// Filter expression handed to the tracing subscriber.
    pub fn effective_log_filter(&self) -> &str {
        self.log_filter.as_deref().unwrap_or(&self.log_level)
    }
}

impl Default for FedflowConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            runtime: RuntimeConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_worker_queue_capacity")]
    pub worker_queue_capacity: usize,
    #[serde(default = "default_queue_overload_factor")]
    pub queue_overload_factor: f64,
    #[serde(default = "default_queue_overload_slack")]
    pub queue_overload_slack: usize,
    #[serde(default = "default_queue_lock_retries")]
    pub queue_lock_retries: usize,
    #[serde(default = "default_idle_park_ms")]
    pub idle_park_ms: u64,
    #[serde(default = "default_state_lock_spins")]
    pub state_lock_spins: u32,
    #[serde(default = "default_fan_out_max_clock_gap")]
    pub fan_out_max_clock_gap: u64,
    #[serde(default = "default_fan_in_max_connector_request")]
    pub fan_in_max_connector_request: u64,
    #[serde(default = "default_callback_max_buffered_rows")]
    pub callback_max_buffered_rows: u64,
}

fn default_worker_threads() -> usize {
    0 // 0 means use CPU cores
}

fn default_worker_queue_capacity() -> usize {
    256
}

fn default_queue_overload_factor() -> f64 {
    2.0
}

fn default_queue_overload_slack() -> usize {
    4
}

fn default_queue_lock_retries() -> usize {
    16
}

fn default_idle_park_ms() -> u64 {
    20
}

fn default_state_lock_spins() -> u32 {
    64
}

fn default_fan_out_max_clock_gap() -> u64 {
    4096
}

fn default_fan_in_max_connector_request() -> u64 {
    2048
}

fn default_callback_max_buffered_rows() -> u64 {
    16_384
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
            worker_queue_capacity: default_worker_queue_capacity(),
            queue_overload_factor: default_queue_overload_factor(),
            queue_overload_slack: default_queue_overload_slack(),
            queue_lock_retries: default_queue_lock_retries(),
            idle_park_ms: default_idle_park_ms(),
            state_lock_spins: default_state_lock_spins(),
            fan_out_max_clock_gap: default_fan_out_max_clock_gap(),
            fan_in_max_connector_request: default_fan_in_max_connector_request(),
            callback_max_buffered_rows: default_callback_max_buffered_rows(),
        }
    }
}

impl RuntimeConfig {
    /// Get the actual number of worker threads.
    /// Returns CPU cores if configured as 0.
    pub fn actual_worker_threads(&self) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }

    fn validate(&self) -> Result<()> {
        if self.worker_queue_capacity == 0 {
            return Err(anyhow!("runtime.worker_queue_capacity must be positive"));
        }
        if !(self.queue_overload_factor >= 1.0) {
            return Err(anyhow!(
                "runtime.queue_overload_factor must be >= 1.0, got {}",
                self.queue_overload_factor
            ));
        }
        if self.fan_out_max_clock_gap == 0 {
            return Err(anyhow!("runtime.fan_out_max_clock_gap must be positive"));
        }
        if self.fan_in_max_connector_request == 0 {
            return Err(anyhow!(
                "runtime.fan_in_max_connector_request must be positive"
            ));
        }
        Ok(())
    }
}
