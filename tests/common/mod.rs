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
//! Common utilities and helpers for integration tests.
#![allow(dead_code)]
#![allow(unused_imports)]

use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use fedflow::FlowError;
use fedflow::FlowResult;
use fedflow::exec::batch::{Batch, BatchType, TermBatch, TermBatchType};
use fedflow::exec::pipeline::{
    Receiver, Scheduler, SchedulerConfig, StageConfig, StageContext,
};
use fedflow::fedflow_config;
use fedflow::fedflow_logging;

pub const WAIT: Duration = Duration::from_secs(10);

/// Test configuration for integration tests.
pub struct TestConfig {
    /// Temporary directory for test artifacts
    pub temp_dir: TempDir,
    /// Test config path
    pub config_path: PathBuf,
}

impl TestConfig {
    /// Create a new test configuration with small thresholds so that
    /// backpressure paths are hit with little data.
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let config_path = temp_dir.path().join("test_fedflow.toml");

        let config_content = r#"
log_level = "debug"

[runtime]
worker_threads = 4
worker_queue_capacity = 16
queue_overload_factor = 2.0
idle_park_ms = 5
fan_out_max_clock_gap = 8
fan_in_max_connector_request = 16
callback_max_buffered_rows = 32
"#;

        std::fs::write(&config_path, config_content)?;

        Ok(Self {
            temp_dir,
            config_path,
        })
    }

    /// Initialize logging for tests.
    pub fn init_logging(&self) {
        fedflow_logging::init_with_level("debug");
    }

    /// Parse the test configuration without touching the process-wide slot.
    pub fn load_config(&self) -> anyhow::Result<fedflow_config::FedflowConfig> {
        fedflow_config::FedflowConfig::load_from_file(&self.config_path)
    }
}

impl Default for TestConfig {
    fn default() -> Self {
        Self::new().expect("Failed to create test config")
    }
}

/// A running scheduler plus the context stages are built from.
pub struct Harness {
    pub scheduler: Scheduler,
    pub ctx: StageContext,
}

impl Harness {
    pub fn new(workers: usize) -> Self {
        Self::with_stage_config(workers, StageConfig::default())
    }

    pub fn with_stage_config(workers: usize, stage: StageConfig) -> Self {
        let scheduler = Scheduler::start(SchedulerConfig {
            workers,
            idle_park: Duration::from_millis(5),
            ..SchedulerConfig::default()
        })
        .expect("start scheduler");
        let ctx = StageContext::new(scheduler.handle(), stage);
        Self { scheduler, ctx }
    }

    pub fn batch_type(&self) -> Arc<dyn BatchType<TermBatch>> {
        Arc::new(TermBatchType::new())
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.scheduler.shutdown();
    }
}

/// Everything a receiver observed, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Rows(Vec<Vec<u64>>),
    Completed,
    Cancelled,
    Failed(FlowError),
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Event::Rows(_))
    }
}

/// Receiver that forwards every callback onto a channel.
pub struct Recorder {
    tx: mpsc::Sender<Event>,
}

impl Recorder {
    pub fn new() -> (Box<Self>, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel();
        (Box::new(Self { tx }), rx)
    }
}

impl Receiver<TermBatch> for Recorder {
    fn on_batch(&mut self, batch: TermBatch) -> FlowResult<()> {
        let rows = batch.iter_rows().map(|r| r.to_vec()).collect();
        let _ = self.tx.send(Event::Rows(rows));
        Ok(())
    }

    fn on_complete(&mut self) -> FlowResult<()> {
        let _ = self.tx.send(Event::Completed);
        Ok(())
    }

    fn on_cancelled(&mut self) -> FlowResult<()> {
        let _ = self.tx.send(Event::Cancelled);
        Ok(())
    }

    fn on_error(&mut self, cause: &FlowError) -> FlowResult<()> {
        let _ = self.tx.send(Event::Failed(cause.clone()));
        Ok(())
    }

    fn receiver_name(&self) -> String {
        "recorder".to_string()
    }
}

/// Read events until the terminal one. Panics on timeout or on a second
/// terminal event arriving right after the first.
pub fn collect_until_terminal(rx: &mpsc::Receiver<Event>) -> (Vec<Vec<u64>>, Event) {
    let mut rows = Vec::new();
    loop {
        match rx.recv_timeout(WAIT) {
            Ok(Event::Rows(batch)) => rows.extend(batch),
            Ok(terminal) => {
                assert!(
                    rx.recv_timeout(Duration::from_millis(50)).is_err(),
                    "event after terminal {terminal:?}"
                );
                return (rows, terminal);
            }
            Err(e) => panic!("no terminal event within {WAIT:?}: {e}"),
        }
    }
}

/// Collect rows until `count` have arrived, without waiting for termination.
pub fn collect_rows(rx: &mpsc::Receiver<Event>, count: usize) -> Vec<Vec<u64>> {
    let mut rows = Vec::new();
    while rows.len() < count {
        match rx.recv_timeout(WAIT) {
            Ok(Event::Rows(batch)) => rows.extend(batch),
            Ok(other) => panic!("unexpected {other:?} after {} rows", rows.len()),
            Err(e) => panic!("only {} of {count} rows arrived: {e}", rows.len()),
        }
    }
    rows
}

/// Assert nothing arrives for a short while.
pub fn assert_quiet(rx: &mpsc::Receiver<Event>) {
    if let Ok(event) = rx.recv_timeout(Duration::from_millis(100)) {
        panic!("unexpected {event:?}");
    }
}

/// Expected rows of `TermBatch::sequential(cols, n)` in `[from, to)`.
pub fn sequential_rows(cols: usize, from: usize, to: usize) -> Vec<Vec<u64>> {
    let batch = TermBatch::sequential(cols, to);
    batch.iter_rows().skip(from).map(|r| r.to_vec()).collect()
}

/// Wait for a condition to become true, with timeout.
pub fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

/// Run `f` and fail the test if it does not finish within `timeout`.
pub fn run_with_timeout<F, T>(timeout: Duration, f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(f());
    });

    match rx.recv_timeout(timeout) {
        Ok(v) => v,
        Err(_) => panic!("test timed out after {:?}", timeout),
    }
}

/// Assert that a result is Ok and return the value.
#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
    ($result:expr, $message:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("{}: {:?}", $message, e),
        }
    };
}
