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
//! Callback-driven producer.
//!
//! Responsibilities:
//! - Adapts an external producer (an endpoint client, a parser thread, ...)
//!   that pushes batches from its own threads into the streaming protocol.
//! - Buffers offered batches and forwards them within downstream demand from
//!   the stage's own quantum.
//! - Drives the producer lifecycle: `start`, `pause`, `resume` and `cancel`
//!   are each invoked from the scheduler thread, at most once per transition.
//!
//! Key exported interfaces:
//! - Types: `CallbackEmitter`, `ProducerHandle`.
//! - Traits: `CallbackProducer`.
//!
//! Every execution hands the producer a fresh `ProducerHandle` stamped with
//! an epoch. After a rebind, offers through a handle of an earlier execution
//! are dropped.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::binding::{Binding, Vars};
use super::emitter::{EmitterBase, Stage, StageContext};
use super::state::{Flag, Outcome, StageState, StateMachine, Stateful};
use super::task::{Task, TaskCore};
use crate::common::error::{FlowError, FlowResult, panic_message};
use crate::exec::batch::{Batch, BatchType, split_front};
use crate::fedflow_logging::{debug, warn};

const STARTED: Flag = Flag::new(0, "STARTED");
const PAUSED: Flag = Flag::new(1, "PAUSED");
const CANCEL_FORWARDED: Flag = Flag::new(2, "CANCEL_FORWARDED");
static FLAGS: [Flag; 3] = [STARTED, PAUSED, CANCEL_FORWARDED];

/// External source of batches.
///
/// `start`, `pause`, `resume` and `cancel` are called from a scheduler thread
/// and must return promptly; the producer delivers through the handle from
/// any thread it likes.
pub trait CallbackProducer<B: Batch>: Send + Sync {
    fn start(&self, handle: ProducerHandle<B>);

    /// Buffered rows exceed the configured limit and nobody asks for more.
    fn pause(&self) {}

    fn resume(&self) {}

    fn cancel(&self);

    /// Prepare for the next execution. Called before the stage resets.
    fn rebind(&self, _binding: &Binding) -> FlowResult<()> {
        Ok(())
    }
}

/// Producer-side entry point into a `CallbackEmitter`.
pub struct ProducerHandle<B: Batch> {
    stage: Weak<CallbackEmitter<B>>,
    epoch: u64,
}

impl<B: Batch> Clone for ProducerHandle<B> {
    fn clone(&self) -> Self {
        Self {
            stage: self.stage.clone(),
            epoch: self.epoch,
        }
    }
}

impl<B: Batch> ProducerHandle<B> {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Queue a batch. False if the stage no longer accepts rows from this
    /// handle; the batch is then recycled.
    pub fn offer(&self, batch: B) -> bool {
        match self.stage.upgrade() {
            Some(stage) => stage.offer(self.epoch, batch),
            None => false,
        }
    }

    /// No more batches will follow.
    pub fn complete(&self) {
        if let Some(stage) = self.stage.upgrade() {
            stage.producer_done(self.epoch, Outcome::Completed, None);
        }
    }

    pub fn fail(&self, cause: FlowError) {
        if let Some(stage) = self.stage.upgrade() {
            stage.producer_done(self.epoch, Outcome::Failed, Some(cause));
        }
    }

    /// The producer acknowledges a cancellation it was asked for.
    pub fn cancelled(&self) {
        if let Some(stage) = self.stage.upgrade() {
            stage.producer_done(self.epoch, Outcome::Cancelled, None);
        }
    }
}

pub struct CallbackEmitter<B: Batch> {
    base: EmitterBase<B>,
    this: Weak<Self>,
    producer: Mutex<Option<Arc<dyn CallbackProducer<B>>>>,
    queue: Mutex<VecDeque<B>>,
    queued_rows: AtomicU64,
    epoch: AtomicU64,
    max_buffered_rows: u64,
}

impl<B: Batch> CallbackEmitter<B> {
    pub fn new(
        ctx: &StageContext,
        name: impl Into<String>,
        vars: Vars,
        batch_type: Arc<dyn BatchType<B>>,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let this: Weak<dyn Task> = weak.clone();
            Self {
                base: EmitterBase::new(ctx, name, vars, batch_type, &FLAGS, this),
                this: weak.clone(),
                producer: Mutex::new(None),
                queue: Mutex::new(VecDeque::new()),
                queued_rows: AtomicU64::new(0),
                epoch: AtomicU64::new(1),
                max_buffered_rows: ctx.config().callback_max_buffered_rows,
            }
        })
    }

    pub fn with_producer(
        ctx: &StageContext,
        name: impl Into<String>,
        vars: Vars,
        batch_type: Arc<dyn BatchType<B>>,
        producer: Arc<dyn CallbackProducer<B>>,
    ) -> Arc<Self> {
        let stage = Self::new(ctx, name, vars, batch_type);
        if let Ok(mut slot) = stage.producer.lock() {
            *slot = Some(producer);
        }
        stage
    }

    /// Attach the producer. Only one producer per stage.
    pub fn attach(&self, producer: Arc<dyn CallbackProducer<B>>) -> FlowResult<()> {
        let mut slot = self
            .producer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return Err(FlowError::DoubleRegistration);
        }
        *slot = Some(producer);
        Ok(())
    }

    pub fn queued_rows(&self) -> u64 {
        self.queued_rows.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.base.state_machine().has_flag(PAUSED)
    }

    fn producer(&self) -> Option<Arc<dyn CallbackProducer<B>>> {
        self.producer.lock().ok().and_then(|p| p.clone())
    }

    fn offer(&self, epoch: u64, batch: B) -> bool {
        if epoch != self.epoch.load(Ordering::Acquire) {
            debug!(
                "stage {} drops batch from stale producer epoch {}",
                self.base.name(),
                epoch
            );
            self.base.recycle(batch);
            return false;
        }
        let rows = batch.rows() as u64;
        let rejected = {
            let mut queue = self
                .queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            // Checked again under the queue lock: `reset_local` bumps the
            // epoch before it clears the queue.
            if epoch == self.epoch.load(Ordering::Acquire)
                && matches!(self.base.state(), StageState::Init | StageState::Live)
            {
                queue.push_back(batch);
                self.queued_rows.fetch_add(rows, Ordering::AcqRel);
                None
            } else {
                Some(batch)
            }
        };
        match rejected {
            Some(batch) => {
                self.base.recycle(batch);
                false
            }
            None => {
                self.base.awake();
                true
            }
        }
    }

    fn producer_done(&self, epoch: u64, outcome: Outcome, cause: Option<FlowError>) {
        if epoch != self.epoch.load(Ordering::Acquire) {
            return;
        }
        if self.base.begin_termination(outcome, cause) {
            self.base.awake();
        }
    }

    fn handle(&self) -> ProducerHandle<B> {
        ProducerHandle {
            stage: self.this.clone(),
            epoch: self.epoch.load(Ordering::Acquire),
        }
    }

    /// Call into the producer, turning a panic into a stage failure.
    fn call_producer<F>(&self, what: &str, f: F)
    where
        F: FnOnce(&dyn CallbackProducer<B>),
    {
        let Some(producer) = self.producer() else {
            return;
        };
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(producer.as_ref()))) {
            let msg = panic_message(payload.as_ref());
            warn!(
                "stage {} producer panicked in {}: {}",
                self.base.name(),
                what,
                msg
            );
            self.base
                .begin_termination(Outcome::Failed, Some(FlowError::Panic(msg)));
        }
    }

    fn pop_within(&self, limit: usize) -> Option<B> {
        let mut queue = self
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let batch = queue.pop_front()?;
        let (head, tail) = split_front(batch, limit);
        if let Some(tail) = tail {
            queue.push_front(tail);
        }
        self.queued_rows
            .fetch_sub(head.rows() as u64, Ordering::AcqRel);
        Some(head)
    }

    fn deliver_queued(&self) {
        loop {
            let demand = self.base.demand();
            if demand <= 0 {
                return;
            }
            let Some(batch) = self.pop_within(demand as usize) else {
                return;
            };
            if !self.base.deliver(batch) {
                return;
            }
        }
    }

    fn drop_queued(&self) {
        let dropped: Vec<B> = {
            let mut queue = self
                .queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            queue.drain(..).collect()
        };
        self.queued_rows.store(0, Ordering::Release);
        for batch in dropped {
            self.base.recycle(batch);
        }
    }

    fn queue_is_empty(&self) -> bool {
        self.queue.lock().map(|q| q.is_empty()).unwrap_or(true)
    }

    fn manage_backpressure(&self) {
        let sm = self.base.state_machine();
        let starved = self.base.demand() <= 0;
        let full = self.queued_rows() >= self.max_buffered_rows;
        if starved && full {
            if sm.try_set_flag(PAUSED) {
                debug!(
                    "stage {} pauses producer at {} buffered rows",
                    self.base.name(),
                    self.queued_rows()
                );
                self.call_producer("pause", |p| p.pause());
            }
        } else if sm.clear_flag(PAUSED) {
            self.call_producer("resume", |p| p.resume());
        }
    }
}

impl<B: Batch> Task for CallbackEmitter<B> {
    fn task_core(&self) -> &TaskCore {
        self.base.task_core()
    }

    fn run(&self) {
        let sm = self.base.state_machine();
        loop {
            let state = self.base.state();
            match state {
                StageState::Init | StageState::TermDelivered(_) => return,
                StageState::Term(_) => {
                    self.drop_queued();
                    self.base.deliver_termination(self);
                    return;
                }
                StageState::Live => {
                    if sm.try_set_flag(STARTED) {
                        if self.producer().is_none() {
                            self.base
                                .begin_termination(Outcome::Failed, Some(FlowError::NoProducer));
                            continue;
                        }
                        let handle = self.handle();
                        self.call_producer("start", move |p| p.start(handle));
                    }
                    self.deliver_queued();
                    self.manage_backpressure();
                    if self.base.state() == state {
                        return;
                    }
                }
                StageState::CancelRequested => {
                    if sm.has_flag(STARTED) && sm.try_set_flag(CANCEL_FORWARDED) {
                        self.call_producer("cancel", |p| p.cancel());
                    }
                    self.deliver_queued();
                    self.drop_queued();
                    self.base.terminate_from(
                        StageState::CancelRequested,
                        Outcome::Cancelled,
                        None,
                    );
                }
                StageState::PendingTerm(outcome) => {
                    if self.base.drops_queued(outcome) {
                        self.drop_queued();
                    } else {
                        self.deliver_queued();
                    }
                    if !self.queue_is_empty() {
                        // Waits for more demand.
                        if self.base.state() == state {
                            return;
                        }
                        continue;
                    }
                    self.base.finish_pending();
                }
            }
        }
    }

    fn task_name(&self) -> String {
        self.base.name().to_string()
    }
}

impl<B: Batch> Stateful for CallbackEmitter<B> {
    fn state_machine(&self) -> &StateMachine {
        self.base.state_machine()
    }

    fn on_release(&self) {
        self.drop_queued();
        if let Ok(mut producer) = self.producer.lock() {
            producer.take();
        }
        self.base.release();
    }
}

impl<B: Batch> Stage<B> for CallbackEmitter<B> {
    fn base(&self) -> &EmitterBase<B> {
        &self.base
    }

    fn check_request(&self) -> FlowResult<()> {
        let attached = self.producer.lock().map(|p| p.is_some()).unwrap_or(false);
        if attached {
            Ok(())
        } else {
            Err(FlowError::NoProducer)
        }
    }

    fn propagate_rebind(&self, binding: &Binding) -> FlowResult<()> {
        match self.producer() {
            Some(producer) => producer.rebind(binding),
            None => Ok(()),
        }
    }

    fn reset_local(&self, _binding: &Binding) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.drop_queued();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::batch::{TermBatch, TermBatchType};
    use crate::exec::pipeline::emitter::test_util::{RecordingReceiver, Seen};
    use crate::exec::pipeline::emitter::{Emitter, StageConfig};
    use crate::exec::pipeline::scheduler::{Scheduler, SchedulerConfig};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    /// Producer that records lifecycle calls and keeps the handle for the test.
    #[derive(Default)]
    struct ScriptedProducer {
        handle: Mutex<Option<ProducerHandle<TermBatch>>>,
        starts: AtomicUsize,
        pauses: AtomicUsize,
        resumes: AtomicUsize,
        cancels: AtomicUsize,
        ack_cancel: bool,
    }

    impl ScriptedProducer {
        fn handle(&self) -> ProducerHandle<TermBatch> {
            for _ in 0..5000 {
                if let Some(h) = self.handle.lock().expect("handle").clone() {
                    return h;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            panic!("producer never started");
        }
    }

    impl CallbackProducer<TermBatch> for ScriptedProducer {
        fn start(&self, handle: ProducerHandle<TermBatch>) {
            self.starts.fetch_add(1, Ordering::SeqCst);
            *self.handle.lock().expect("handle") = Some(handle);
        }

        fn pause(&self) {
            self.pauses.fetch_add(1, Ordering::SeqCst);
        }

        fn resume(&self) {
            self.resumes.fetch_add(1, Ordering::SeqCst);
        }

        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            if self.ack_cancel
                && let Some(h) = self.handle.lock().expect("handle").as_ref()
            {
                h.cancelled();
            }
        }
    }

    fn setup(
        max_buffered_rows: u64,
    ) -> (
        Scheduler,
        Arc<CallbackEmitter<TermBatch>>,
        Arc<ScriptedProducer>,
    ) {
        let scheduler = Scheduler::start(SchedulerConfig {
            workers: 2,
            ..SchedulerConfig::default()
        })
        .expect("start scheduler");
        let ctx = StageContext::new(
            scheduler.handle(),
            StageConfig {
                callback_max_buffered_rows: max_buffered_rows,
                ..StageConfig::default()
            },
        );
        let producer = Arc::new(ScriptedProducer::default());
        let stage = CallbackEmitter::with_producer(
            &ctx,
            "endpoint",
            Vars::new(["s"]),
            Arc::new(TermBatchType::new()),
            producer.clone(),
        );
        (scheduler, stage, producer)
    }

    #[test]
    fn request_without_producer_fails() {
        let scheduler = Scheduler::start(SchedulerConfig {
            workers: 1,
            ..SchedulerConfig::default()
        })
        .expect("start scheduler");
        let ctx = StageContext::new(scheduler.handle(), StageConfig::default());
        let stage = CallbackEmitter::<TermBatch>::new(
            &ctx,
            "orphan",
            Vars::new(["s"]),
            Arc::new(TermBatchType::new()),
        );
        assert_eq!(stage.request(1), Err(FlowError::NoProducer));
        stage
            .attach(Arc::new(ScriptedProducer::default()))
            .expect("first attach");
        assert_eq!(
            stage.attach(Arc::new(ScriptedProducer::default())),
            Err(FlowError::DoubleRegistration)
        );
    }

    #[test]
    fn offered_rows_flow_within_demand_then_complete() {
        let (_scheduler, stage, producer) = setup(1024);
        let (receiver, rx) = RecordingReceiver::new();
        stage.subscribe(receiver).expect("subscribe");
        stage.request(2).expect("request");
        let handle = producer.handle();
        assert!(handle.offer(TermBatch::sequential(1, 3)));
        handle.complete();

        assert_eq!(
            rx.recv_timeout(WAIT).expect("rows"),
            Seen::Rows(vec![vec![0], vec![1]])
        );
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        stage.request(1).expect("request");
        assert_eq!(rx.recv_timeout(WAIT).expect("rows"), Seen::Rows(vec![vec![2]]));
        assert_eq!(rx.recv_timeout(WAIT).expect("done"), Seen::Completed);
        assert_eq!(producer.starts.load(Ordering::SeqCst), 1);
        assert!(!handle.offer(TermBatch::sequential(1, 1)));
    }

    #[test]
    fn producer_failure_carries_cause() {
        let (_scheduler, stage, producer) = setup(1024);
        let (receiver, rx) = RecordingReceiver::new();
        stage.subscribe(receiver).expect("subscribe");
        stage.request(10).expect("request");
        producer
            .handle()
            .fail(FlowError::producer("endpoint returned 503"));
        assert_eq!(
            rx.recv_timeout(WAIT).expect("termination"),
            Seen::Failed(FlowError::producer("endpoint returned 503"))
        );
    }

    #[test]
    fn cancel_is_forwarded_once() {
        let (_scheduler, stage, producer) = setup(1024);
        let (receiver, rx) = RecordingReceiver::new();
        stage.subscribe(receiver).expect("subscribe");
        stage.request(10).expect("request");
        let handle = producer.handle();
        stage.cancel();
        stage.cancel();
        assert_eq!(rx.recv_timeout(WAIT).expect("termination"), Seen::Cancelled);
        assert_eq!(producer.cancels.load(Ordering::SeqCst), 1);
        assert!(!handle.offer(TermBatch::sequential(1, 1)));
        handle.complete();
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn pause_and_resume_follow_buffered_rows() {
        let (_scheduler, stage, producer) = setup(4);
        let (receiver, rx) = RecordingReceiver::new();
        stage.subscribe(receiver).expect("subscribe");
        stage.request(1).expect("request");
        let handle = producer.handle();
        assert!(handle.offer(TermBatch::sequential(1, 6)));
        assert_eq!(rx.recv_timeout(WAIT).expect("rows"), Seen::Rows(vec![vec![0]]));
        for _ in 0..5000 {
            if producer.pauses.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(producer.pauses.load(Ordering::SeqCst), 1);
        assert!(stage.is_paused());

        stage.request(5).expect("request");
        let mut seen = 0;
        while seen < 5 {
            match rx.recv_timeout(WAIT).expect("rows") {
                Seen::Rows(rows) => seen += rows.len(),
                other => panic!("unexpected {other:?}"),
            }
        }
        handle.complete();
        assert_eq!(rx.recv_timeout(WAIT).expect("done"), Seen::Completed);
        assert_eq!(producer.resumes.load(Ordering::SeqCst), 1);
        assert_eq!(producer.pauses.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stale_handle_offers_are_dropped_after_rebind() {
        let (_scheduler, stage, producer) = setup(1024);
        let (receiver, rx) = RecordingReceiver::new();
        stage.subscribe(receiver).expect("subscribe");
        assert!(stage.delay_release());
        stage.request(1).expect("request");
        let old = producer.handle();
        old.complete();
        assert_eq!(rx.recv_timeout(WAIT).expect("done"), Seen::Completed);
        while !stage.state().is_delivered() {
            std::thread::yield_now();
        }
        *producer.handle.lock().expect("handle") = None;

        stage.rebind(&Binding::unbound(1)).expect("rebind");
        stage.request(1).expect("request");
        let fresh = producer.handle();
        assert_ne!(old.epoch(), fresh.epoch());
        assert!(!old.offer(TermBatch::sequential(1, 1)));
        assert!(fresh.offer(TermBatch::from_rows(1, &[[42_u64]])));
        assert_eq!(rx.recv_timeout(WAIT).expect("rows"), Seen::Rows(vec![vec![42]]));
        assert_eq!(producer.starts.load(Ordering::SeqCst), 2);
        stage.cancel();
        assert_eq!(rx.recv_timeout(WAIT).expect("done"), Seen::Cancelled);
        stage.allow_release();
    }

    #[test]
    fn rebind_discards_rows_queued_by_previous_execution() {
        let (_scheduler, stage, producer) = setup(1024);
        let (receiver, rx) = RecordingReceiver::new();
        stage.subscribe(receiver).expect("subscribe");
        assert!(stage.delay_release());
        stage.request(1).expect("request");
        let old = producer.handle();
        old.complete();
        assert_eq!(rx.recv_timeout(WAIT).expect("done"), Seen::Completed);
        while !stage.state().is_delivered() {
            std::thread::yield_now();
        }
        // A batch that slipped into the queue between the old handle's epoch
        // check and termination.
        stage
            .queue
            .lock()
            .expect("queue")
            .push_back(TermBatch::from_rows(1, &[[7_u64]]));
        stage.queued_rows.fetch_add(1, Ordering::AcqRel);
        *producer.handle.lock().expect("handle") = None;

        stage.rebind(&Binding::unbound(1)).expect("rebind");
        assert_eq!(stage.queued_rows(), 0);
        assert!(stage.queue_is_empty());
        assert!(!old.offer(TermBatch::from_rows(1, &[[8_u64]])));
        stage.request(5).expect("request");
        let fresh = producer.handle();
        assert!(fresh.offer(TermBatch::from_rows(1, &[[42_u64]])));
        fresh.complete();
        assert_eq!(rx.recv_timeout(WAIT).expect("rows"), Seen::Rows(vec![vec![42]]));
        assert_eq!(rx.recv_timeout(WAIT).expect("done"), Seen::Completed);
        stage.allow_release();
    }

    #[test]
    fn failure_drops_rows_still_queued() {
        let (_scheduler, stage, producer) = setup(1024);
        let (receiver, rx) = RecordingReceiver::new();
        stage.subscribe(receiver).expect("subscribe");
        stage.request(1).expect("request");
        let handle = producer.handle();
        assert!(handle.offer(TermBatch::from_rows(1, &[[1_u64]])));
        assert_eq!(rx.recv_timeout(WAIT).expect("rows"), Seen::Rows(vec![vec![1]]));
        assert!(handle.offer(TermBatch::from_rows(1, &[[2_u64], [3]])));
        handle.fail(FlowError::producer("lost connection"));
        stage.request(10).expect("request");
        assert_eq!(
            rx.recv_timeout(WAIT).expect("done"),
            Seen::Failed(FlowError::producer("lost connection"))
        );
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn receiver_failing_after_completion_gets_no_more_rows() {
        let (_scheduler, stage, producer) = setup(1024);
        let (receiver, rx) = RecordingReceiver::new();
        let reject = receiver.fail_on_batch.clone();
        stage.subscribe(receiver).expect("subscribe");
        stage.request(1).expect("request");
        let handle = producer.handle();
        assert!(handle.offer(TermBatch::from_rows(1, &[[1_u64]])));
        assert_eq!(rx.recv_timeout(WAIT).expect("rows"), Seen::Rows(vec![vec![1]]));
        assert!(handle.offer(TermBatch::from_rows(1, &[[2_u64]])));
        assert!(handle.offer(TermBatch::from_rows(1, &[[3_u64]])));
        handle.complete();
        assert_eq!(stage.state(), StageState::PendingTerm(Outcome::Completed));

        reject.store(true, Ordering::SeqCst);
        stage.request(2).expect("request");
        assert_eq!(rx.recv_timeout(WAIT).expect("rows"), Seen::Rows(vec![vec![2]]));
        assert_eq!(rx.recv_timeout(WAIT).expect("done"), Seen::Completed);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(stage.queued_rows(), 0);
    }
}
