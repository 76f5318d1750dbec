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
//! Self-driven producer replaying a captured batch.
//!
//! The stage owns one batch captured at plan time (a VALUES block, a cached
//! sub-result, or nothing at all) and hands it out in demand-sized slices
//! from its own scheduler quantum. It completes as soon as the cursor reaches
//! the end, even without outstanding demand.

use std::sync::{Arc, Mutex, Weak};

use super::binding::{Binding, Vars};
use super::emitter::{EmitterBase, Stage, StageContext};
use super::state::{Outcome, StageState, StateMachine, Stateful};
use super::task::{Task, TaskCore};
use crate::exec::batch::{Batch, BatchType};

struct Replay<B> {
    batch: Option<B>,
    cursor: usize,
}

pub struct BatchEmitter<B: Batch> {
    base: EmitterBase<B>,
    replay: Mutex<Replay<B>>,
}

impl<B: Batch> BatchEmitter<B> {
    pub fn new(
        ctx: &StageContext,
        name: impl Into<String>,
        vars: Vars,
        batch_type: Arc<dyn BatchType<B>>,
        batch: B,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let this: Weak<dyn Task> = weak.clone();
            Self {
                base: EmitterBase::new(ctx, name, vars, batch_type, &[], this),
                replay: Mutex::new(Replay {
                    batch: Some(batch),
                    cursor: 0,
                }),
            }
        })
    }

    /// Stage that completes without rows.
    pub fn empty(
        ctx: &StageContext,
        name: impl Into<String>,
        vars: Vars,
        batch_type: Arc<dyn BatchType<B>>,
    ) -> Arc<Self> {
        let batch = batch_type.create(vars.len(), 0);
        Self::new(ctx, name, vars, batch_type, batch)
    }

    pub fn total_rows(&self) -> usize {
        self.replay
            .lock()
            .ok()
            .and_then(|r| r.batch.as_ref().map(Batch::rows))
            .unwrap_or(0)
    }

    fn exhausted(&self) -> bool {
        match self.replay.lock() {
            Ok(replay) => replay
                .batch
                .as_ref()
                .is_none_or(|b| replay.cursor >= b.rows()),
            Err(_) => true,
        }
    }

    fn next_slice(&self, limit: usize) -> Option<B> {
        let mut replay = self.replay.lock().ok()?;
        let cursor = replay.cursor;
        let batch = replay.batch.as_ref()?;
        let len = limit.min(batch.rows().saturating_sub(cursor));
        if len == 0 {
            return None;
        }
        let slice = batch.slice(cursor, len);
        replay.cursor = cursor + len;
        Some(slice)
    }
}

impl<B: Batch> Task for BatchEmitter<B> {
    fn task_core(&self) -> &TaskCore {
        self.base.task_core()
    }

    fn run(&self) {
        loop {
            match self.base.state() {
                StageState::Init | StageState::TermDelivered(_) => return,
                StageState::Term(_) => {
                    self.base.deliver_termination(self);
                    return;
                }
                StageState::CancelRequested => {
                    self.base.terminate_from(
                        StageState::CancelRequested,
                        Outcome::Cancelled,
                        None,
                    );
                }
                StageState::PendingTerm(_) => {
                    self.base.finish_pending();
                }
                StageState::Live => {
                    if self.exhausted() {
                        self.base
                            .terminate_from(StageState::Live, Outcome::Completed, None);
                        continue;
                    }
                    let demand = self.base.demand();
                    if demand <= 0 {
                        return;
                    }
                    if let Some(batch) = self.next_slice(demand as usize) {
                        self.base.deliver(batch);
                    }
                }
            }
        }
    }

    fn task_name(&self) -> String {
        self.base.name().to_string()
    }
}

impl<B: Batch> Stateful for BatchEmitter<B> {
    fn state_machine(&self) -> &StateMachine {
        self.base.state_machine()
    }

    fn on_release(&self) {
        let batch = self.replay.lock().ok().and_then(|mut r| r.batch.take());
        if let Some(batch) = batch {
            self.base.recycle(batch);
        }
        self.base.release();
    }
}

impl<B: Batch> Stage<B> for BatchEmitter<B> {
    fn base(&self) -> &EmitterBase<B> {
        &self.base
    }

    fn reset_local(&self, _binding: &Binding) {
        if let Ok(mut replay) = self.replay.lock() {
            replay.cursor = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::error::FlowError;
    use crate::exec::batch::{TermBatch, TermBatchType};
    use crate::exec::pipeline::emitter::test_util::{RecordingReceiver, Seen};
    use crate::exec::pipeline::emitter::{Emitter, StageConfig};
    use crate::exec::pipeline::scheduler::{Scheduler, SchedulerConfig};
    use std::sync::atomic::Ordering;
    use std::sync::mpsc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn start() -> (Scheduler, StageContext) {
        let scheduler = Scheduler::start(SchedulerConfig {
            workers: 2,
            ..SchedulerConfig::default()
        })
        .expect("start scheduler");
        let ctx = StageContext::new(scheduler.handle(), StageConfig::default());
        (scheduler, ctx)
    }

    fn rows(from: u64, to: u64, cols: u64) -> Seen {
        Seen::Rows(
            (from..to)
                .map(|r| (0..cols).map(|c| r * cols + c).collect())
                .collect(),
        )
    }

    fn collect_rows(rx: &mpsc::Receiver<Seen>, want: usize) -> Vec<Vec<u64>> {
        let mut out = Vec::new();
        while out.len() < want {
            match rx.recv_timeout(WAIT).expect("rows") {
                Seen::Rows(r) => out.extend(r),
                other => panic!("unexpected signal {other:?}"),
            }
        }
        out
    }

    #[test]
    fn replays_in_demand_sized_slices() {
        let (_scheduler, ctx) = start();
        let stage = BatchEmitter::new(
            &ctx,
            "values",
            Vars::new(["a", "b"]),
            Arc::new(TermBatchType::new()),
            TermBatch::sequential(2, 10),
        );
        let (receiver, rx) = RecordingReceiver::new();
        stage.subscribe(receiver).expect("subscribe");

        stage.request(3).expect("request");
        assert_eq!(rx.recv_timeout(WAIT).expect("first slice"), rows(0, 3, 2));
        stage.request(7).expect("request");
        let Seen::Rows(rest) = rows(3, 10, 2) else {
            unreachable!()
        };
        assert_eq!(collect_rows(&rx, 7), rest);
        assert_eq!(rx.recv_timeout(WAIT).expect("termination"), Seen::Completed);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn empty_stage_completes_on_first_request() {
        let (_scheduler, ctx) = start();
        let stage = BatchEmitter::<TermBatch>::empty(
            &ctx,
            "nothing",
            Vars::new(["x"]),
            Arc::new(TermBatchType::new()),
        );
        let (receiver, rx) = RecordingReceiver::new();
        stage.subscribe(receiver).expect("subscribe");
        assert_eq!(stage.state(), StageState::Init);
        stage.request(1).expect("request");
        assert_eq!(rx.recv_timeout(WAIT).expect("termination"), Seen::Completed);
    }

    #[test]
    fn cancel_before_exhaustion_ends_cancelled() {
        let (_scheduler, ctx) = start();
        let stage = BatchEmitter::new(
            &ctx,
            "values",
            Vars::new(["a"]),
            Arc::new(TermBatchType::new()),
            TermBatch::sequential(1, 100),
        );
        let (receiver, rx) = RecordingReceiver::new();
        stage.subscribe(receiver).expect("subscribe");
        stage.request(10).expect("request");
        assert_eq!(collect_rows(&rx, 10).len(), 10);
        stage.cancel();
        stage.cancel();
        assert_eq!(rx.recv_timeout(WAIT).expect("termination"), Seen::Cancelled);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        stage.request(5).expect("request after termination is ignored");
    }

    #[test]
    fn subscribe_after_start_is_rejected() {
        let (_scheduler, ctx) = start();
        let stage = BatchEmitter::new(
            &ctx,
            "values",
            Vars::new(["a"]),
            Arc::new(TermBatchType::new()),
            TermBatch::sequential(1, 4),
        );
        let (first, _rx) = RecordingReceiver::new();
        stage.subscribe(first).expect("subscribe");
        stage.request(1).expect("request");
        let (late, _late_rx) = RecordingReceiver::new();
        assert_eq!(stage.subscribe(late), Err(FlowError::RegisterAfterStart));
        assert_eq!(stage.request(0), Err(FlowError::InvalidRequest));
    }

    #[test]
    fn every_subscriber_sees_the_same_rows() {
        let (_scheduler, ctx) = start();
        let stage = BatchEmitter::new(
            &ctx,
            "values",
            Vars::new(["a"]),
            Arc::new(TermBatchType::new()),
            TermBatch::sequential(1, 6),
        );
        let (a, rx_a) = RecordingReceiver::new();
        let (b, rx_b) = RecordingReceiver::new();
        stage.subscribe(a).expect("subscribe");
        stage.subscribe(b).expect("subscribe");
        stage.request(6).expect("request");
        assert_eq!(collect_rows(&rx_a, 6), collect_rows(&rx_b, 6));
        assert_eq!(rx_a.recv_timeout(WAIT).expect("a done"), Seen::Completed);
        assert_eq!(rx_b.recv_timeout(WAIT).expect("b done"), Seen::Completed);
    }

    #[test]
    fn failing_receiver_cancels_the_stage() {
        let (_scheduler, ctx) = start();
        let stage = BatchEmitter::new(
            &ctx,
            "values",
            Vars::new(["a"]),
            Arc::new(TermBatchType::new()),
            TermBatch::sequential(1, 6),
        );
        let (receiver, rx) = RecordingReceiver::new();
        receiver.fail_on_batch.store(true, Ordering::SeqCst);
        stage.subscribe(receiver).expect("subscribe");
        stage.request(2).expect("request");
        assert!(matches!(rx.recv_timeout(WAIT), Ok(Seen::Rows(_))));
        assert_eq!(rx.recv_timeout(WAIT).expect("termination"), Seen::Cancelled);
    }

    #[test]
    fn rebind_replays_from_the_start() {
        let (_scheduler, ctx) = start();
        let stage = BatchEmitter::new(
            &ctx,
            "values",
            Vars::new(["a"]),
            Arc::new(TermBatchType::new()),
            TermBatch::sequential(1, 3),
        );
        let (receiver, rx) = RecordingReceiver::new();
        stage.subscribe(receiver).expect("subscribe");
        assert!(stage.delay_release());

        stage.request(3).expect("request");
        assert_eq!(collect_rows(&rx, 3).len(), 3);
        assert_eq!(rx.recv_timeout(WAIT).expect("done"), Seen::Completed);
        while !stage.state().is_delivered() {
            std::thread::yield_now();
        }

        stage.rebind(&Binding::unbound(1)).expect("rebind");
        assert_eq!(stage.state(), StageState::Init);
        stage.rebind(&Binding::unbound(1)).expect("duplicate rebind");
        stage.request(3).expect("request");
        assert_eq!(collect_rows(&rx, 3), vec![vec![0], vec![1], vec![2]]);
        assert_eq!(rx.recv_timeout(WAIT).expect("done"), Seen::Completed);

        while !stage.state().is_delivered() {
            std::thread::yield_now();
        }
        stage.allow_release();
        assert_eq!(
            stage.rebind(&Binding::unbound(2)),
            Err(FlowError::RebindReleased)
        );
    }

    #[test]
    fn duplicate_rebind_while_live_leaves_the_run_alone() {
        let (_scheduler, ctx) = start();
        let stage = BatchEmitter::new(
            &ctx,
            "values",
            Vars::new(["a"]),
            Arc::new(TermBatchType::new()),
            TermBatch::sequential(1, 6),
        );
        let (receiver, rx) = RecordingReceiver::new();
        stage.subscribe(receiver).expect("subscribe");
        assert!(stage.delay_release());
        stage.request(6).expect("request");
        assert_eq!(collect_rows(&rx, 6).len(), 6);
        assert_eq!(rx.recv_timeout(WAIT).expect("done"), Seen::Completed);
        while !stage.state().is_delivered() {
            std::thread::yield_now();
        }

        stage.rebind(&Binding::unbound(1)).expect("rebind");
        stage.request(2).expect("request");
        assert_eq!(collect_rows(&rx, 2), vec![vec![0], vec![1]]);
        while stage.base().rows_delivered() < 8 {
            std::thread::yield_now();
        }
        assert_eq!(stage.state(), StageState::Live);
        assert_eq!(stage.base().demand(), 0);

        stage.rebind(&Binding::unbound(1)).expect("duplicate rebind");
        assert_eq!(stage.state(), StageState::Live);
        assert_eq!(stage.base().demand(), 0);
        assert_eq!(stage.base().rows_delivered(), 8);
        let err = stage
            .rebind(&Binding::unbound(2))
            .expect_err("fresh sequence while live");
        assert!(matches!(err, FlowError::RebindNotTerminated { .. }));

        stage.request(4).expect("request");
        assert_eq!(
            collect_rows(&rx, 4),
            vec![vec![2], vec![3], vec![4], vec![5]]
        );
        assert_eq!(rx.recv_timeout(WAIT).expect("done"), Seen::Completed);
        stage.allow_release();
    }

    #[test]
    fn rebind_while_live_is_refused() {
        let (_scheduler, ctx) = start();
        let stage = BatchEmitter::new(
            &ctx,
            "values",
            Vars::new(["a"]),
            Arc::new(TermBatchType::new()),
            TermBatch::sequential(1, 3),
        );
        let (receiver, _rx) = RecordingReceiver::new();
        stage.subscribe(receiver).expect("subscribe");
        assert!(stage.delay_release());
        stage.request(1).expect("request");
        let err = stage.rebind(&Binding::unbound(1)).expect_err("still live");
        assert!(matches!(err, FlowError::RebindNotTerminated { .. }));
        stage.allow_release();
    }
}
