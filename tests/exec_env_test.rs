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
//! Integration tests for the execution environment and the scheduler under load.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crate::common::{Event, Recorder, TestConfig, collect_until_terminal, wait_for, WAIT};
use fedflow::exec::batch::{BatchType, TermBatch, TermBatchType};
use fedflow::exec::pipeline::task::FnTask;
use fedflow::exec::pipeline::{
    BatchEmitter, CallbackEmitter, CallbackProducer, Emitter, EmitterRef, ProducerHandle,
    ResultCursor, StageState, Vars,
};
use fedflow::{ExecEnv, FlowError};

mod common;

fn env_from_test_config() -> (TestConfig, ExecEnv) {
    let config = TestConfig::new().expect("test config");
    let cfg = config.load_config().expect("load config");
    let env = ExecEnv::from_runtime(&cfg.runtime).expect("exec env");
    (config, env)
}

#[test]
fn test_config_file_drives_exec_env() {
    let (_config, env) = env_from_test_config();
    assert_eq!(env.scheduler().worker_count(), 4);
    let stage = env.context().config();
    assert_eq!(stage.fan_out_max_clock_gap, 8);
    assert_eq!(stage.fan_in_max_connector_request, 16);
    assert_eq!(stage.callback_max_buffered_rows, 32);
    env.shutdown();
}

#[test]
fn test_many_plans_share_one_scheduler() {
    let (_config, env) = env_from_test_config();
    let batch_type: Arc<dyn BatchType<TermBatch>> = Arc::new(TermBatchType::new());
    let mut consumers = Vec::new();
    for idx in 0..32usize {
        let stage: EmitterRef<TermBatch> = BatchEmitter::new(
            env.context(),
            format!("values-{idx}"),
            Vars::new(["v"]),
            batch_type.clone(),
            TermBatch::sequential(1, 100 + idx),
        );
        let cursor = ResultCursor::attach(stage, 7).expect("attach");
        consumers.push(thread::spawn(move || (idx, cursor.drain(WAIT))));
    }
    for consumer in consumers {
        let (idx, drained) = consumer.join().expect("join");
        let drained = drained.expect("drain");
        assert_eq!(drained.rows, (100 + idx) as u64);
    }
    let stats = env.stats();
    assert!(stats.tasks_run >= 32);
    assert_eq!(stats.panics, 0);
    env.shutdown();
}

#[test]
fn test_wakeups_from_many_threads_are_coalesced() {
    let (_config, env) = env_from_test_config();
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    let task = FnTask::new(env.scheduler(), "counter", move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let mut threads = Vec::new();
    for _ in 0..8 {
        let task = Arc::clone(&task);
        threads.push(thread::spawn(move || {
            for _ in 0..500 {
                task.awake();
            }
        }));
    }
    for t in threads {
        t.join().expect("join");
    }
    assert!(wait_for(|| runs.load(Ordering::SeqCst) > 0, WAIT));
    thread::sleep(Duration::from_millis(50));
    let settled = runs.load(Ordering::SeqCst);
    assert!(settled <= 4_000, "{settled} runs for 4000 wakeups");
    thread::sleep(Duration::from_millis(50));
    assert_eq!(runs.load(Ordering::SeqCst), settled);
    env.shutdown();
}

struct PanickingProducer;

impl CallbackProducer<TermBatch> for PanickingProducer {
    fn start(&self, _handle: ProducerHandle<TermBatch>) {
        panic!("driver exploded");
    }

    fn cancel(&self) {}
}

#[test]
fn test_producer_panic_becomes_failure() {
    let (_config, env) = env_from_test_config();
    let stage = CallbackEmitter::with_producer(
        env.context(),
        "panicky",
        Vars::new(["v"]),
        Arc::new(TermBatchType::new()),
        Arc::new(PanickingProducer),
    );
    let (recorder, rx) = Recorder::new();
    stage.subscribe(recorder).expect("subscribe");
    stage.request(5).expect("request");
    let (rows, terminal) = collect_until_terminal(&rx);
    assert!(rows.is_empty());
    match terminal {
        Event::Failed(FlowError::Panic(msg)) => assert!(msg.contains("driver exploded")),
        other => panic!("expected panic failure, got {other:?}"),
    }
    assert!(wait_for(|| stage.state().is_delivered(), WAIT));
    assert_eq!(env.stats().panics, 0);
    env.shutdown();
}

#[test]
fn test_run_now_drives_stage_on_caller_thread() {
    let (_config, env) = env_from_test_config();
    let stage = BatchEmitter::new(
        env.context(),
        "inline",
        Vars::new(["v"]),
        Arc::new(TermBatchType::new()),
        TermBatch::sequential(1, 3),
    );
    let (recorder, rx) = Recorder::new();
    stage.subscribe(recorder).expect("subscribe");
    stage.request(3).expect("request");
    // Either a worker already ran it or we do; both end the same way.
    stage.run_now();
    let (rows, terminal) = collect_until_terminal(&rx);
    assert_eq!(rows.len(), 3);
    assert_eq!(terminal, Event::Completed);
    assert!(wait_for(|| matches!(stage.state(), StageState::TermDelivered(_)), WAIT));
    env.shutdown();
}
