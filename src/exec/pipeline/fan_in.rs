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
//! Fan-in: merge several upstreams into one stream.
//!
//! Responsibilities:
//! - Attaches one connector per upstream and buffers what each delivers.
//! - Splits downstream demand across live connectors, capped per connector
//!   by `fan_in_max_connector_request`.
//! - Interleaves connector output round-robin and terminates once every
//!   connector has terminated, with `Failed > Cancelled > Completed`
//!   precedence and the first failure as cause.
//!
//! Key exported interfaces:
//! - Types: `FanIn`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::binding::{Binding, Vars};
use super::emitter::{EmitterBase, EmitterRef, Receiver, Stage, StageContext, UpstreamTerm};
use super::state::{Flag, Outcome, StageState, StateMachine, Stateful};
use super::task::{Task, TaskCore};
use crate::common::error::{FlowError, FlowResult};
use crate::exec::batch::{Batch, BatchType, split_front};
use crate::fedflow_logging::{debug, warn};

const CANCEL_FORWARDED: Flag = Flag::new(0, "CANCEL_FORWARDED");
static FLAGS: [Flag; 1] = [CANCEL_FORWARDED];

struct Connector<B: Batch> {
    index: usize,
    upstream: EmitterRef<B>,
    queue: Mutex<VecDeque<B>>,
    queued_rows: AtomicI64,
    in_flight: AtomicI64,
    term: Mutex<Option<UpstreamTerm>>,
    /// Terminal order among connectors, for picking the first failure.
    term_seq: AtomicUsize,
}

impl<B: Batch> Connector<B> {
    fn new(index: usize, upstream: EmitterRef<B>) -> Self {
        Self {
            index,
            upstream,
            queue: Mutex::new(VecDeque::new()),
            queued_rows: AtomicI64::new(0),
            in_flight: AtomicI64::new(0),
            term: Mutex::new(None),
            term_seq: AtomicUsize::new(0),
        }
    }

    fn term(&self) -> Option<UpstreamTerm> {
        self.term.lock().ok().and_then(|t| t.clone())
    }

    fn is_terminated(&self) -> bool {
        self.term.lock().map(|t| t.is_some()).unwrap_or(true)
    }

    fn record_term(&self, outcome: Outcome, cause: Option<FlowError>, seq: usize) -> bool {
        match self.term.lock() {
            Ok(mut term) if term.is_none() => {
                *term = Some((outcome, cause));
                self.term_seq.store(seq, Ordering::Release);
                true
            }
            _ => false,
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
            .fetch_sub(head.rows() as i64, Ordering::AcqRel);
        Some(head)
    }

    fn take_queued(&self) -> Vec<B> {
        let mut queue = self
            .queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.queued_rows.store(0, Ordering::Release);
        queue.drain(..).collect()
    }

    fn is_empty(&self) -> bool {
        self.queue.lock().map(|q| q.is_empty()).unwrap_or(true)
    }

    fn reset(&self) {
        self.queued_rows.store(0, Ordering::Release);
        self.in_flight.store(0, Ordering::Release);
        self.term_seq.store(0, Ordering::Release);
        if let Ok(mut term) = self.term.lock() {
            *term = None;
        }
    }
}

pub struct FanIn<B: Batch> {
    base: EmitterBase<B>,
    connectors: Vec<Arc<Connector<B>>>,
    cursor: AtomicUsize,
    terminations: AtomicUsize,
    max_connector_request: i64,
}

impl<B: Batch> FanIn<B> {
    /// Merge `upstreams` into one stream with output variables `vars`.
    /// Batches pass through unprojected, so every upstream must produce
    /// exactly `vars`.
    pub fn new(
        ctx: &StageContext,
        name: impl Into<String>,
        vars: Vars,
        batch_type: Arc<dyn BatchType<B>>,
        upstreams: Vec<EmitterRef<B>>,
    ) -> FlowResult<Arc<Self>> {
        let name = name.into();
        if let Some(other) = upstreams.iter().find(|u| u.vars() != &vars) {
            return Err(FlowError::VarsMismatch {
                stage: name,
                expected: vars.to_string(),
                found: format!("{} {}", other.name(), other.vars()),
            });
        }
        let connectors: Vec<Arc<Connector<B>>> = upstreams
            .into_iter()
            .enumerate()
            .map(|(index, upstream)| Arc::new(Connector::new(index, upstream)))
            .collect();
        let max_connector_request =
            ctx.config().fan_in_max_connector_request.clamp(1, i64::MAX as u64) as i64;
        let stage = Arc::new_cyclic(|weak: &Weak<Self>| {
            let this: Weak<dyn Task> = weak.clone();
            Self {
                base: EmitterBase::new(ctx, name, vars, batch_type, &FLAGS, this),
                connectors: connectors.clone(),
                cursor: AtomicUsize::new(0),
                terminations: AtomicUsize::new(0),
                max_connector_request,
            }
        });
        for connector in &connectors {
            connector.upstream.subscribe(Box::new(ConnectorReceiver {
                stage: Arc::downgrade(&stage),
                connector: connector.clone(),
            }))?;
        }
        Ok(stage)
    }

    pub fn connector_count(&self) -> usize {
        self.connectors.len()
    }

    fn enqueue(&self, connector: &Connector<B>, batch: B) {
        let rows = batch.rows() as i64;
        connector.in_flight.fetch_sub(rows, Ordering::AcqRel);
        let rejected = {
            let mut queue = connector
                .queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if matches!(self.base.state(), StageState::Init | StageState::Live) {
                queue.push_back(batch);
                connector.queued_rows.fetch_add(rows, Ordering::AcqRel);
                None
            } else {
                Some(batch)
            }
        };
        match rejected {
            Some(batch) => self.base.recycle(batch),
            None => self.base.awake(),
        }
    }

    fn connector_terminated(
        &self,
        connector: &Connector<B>,
        outcome: Outcome,
        cause: Option<FlowError>,
    ) {
        let seq = self.terminations.fetch_add(1, Ordering::AcqRel) + 1;
        if connector.record_term(outcome, cause, seq) {
            debug!(
                "fan-in {} connector {} terminated {}",
                self.base.name(),
                connector.index,
                outcome.label()
            );
        }
        self.base.awake();
    }

    fn all_terminated(&self) -> bool {
        self.connectors.iter().all(|c| c.is_terminated())
    }

    fn all_empty(&self) -> bool {
        self.connectors.iter().all(|c| c.is_empty())
    }

    /// Combined outcome and the cause of the earliest failed connector.
    fn merged_term(&self) -> UpstreamTerm {
        let mut outcome = Outcome::Completed;
        let mut first_failure: Option<(usize, FlowError)> = None;
        for connector in &self.connectors {
            let Some((o, cause)) = connector.term() else {
                continue;
            };
            outcome = outcome.merge(o);
            if o == Outcome::Failed {
                let seq = connector.term_seq.load(Ordering::Acquire);
                let cause = cause.unwrap_or_else(|| FlowError::producer("failure without cause"));
                if first_failure.as_ref().is_none_or(|(s, _)| seq < *s) {
                    first_failure = Some((seq, cause));
                }
            }
        }
        (outcome, first_failure.map(|(_, cause)| cause))
    }

    fn has_failure(&self) -> bool {
        self.connectors
            .iter()
            .any(|c| matches!(c.term(), Some((Outcome::Failed, _))))
    }

    /// Round-robin delivery within demand.
    fn drain(&self) {
        let n = self.connectors.len();
        if n == 0 {
            return;
        }
        let mut idle = 0;
        while idle < n {
            let demand = self.base.demand();
            if demand <= 0 {
                return;
            }
            let at = self.cursor.fetch_add(1, Ordering::Relaxed) % n;
            match self.connectors[at].pop_within(demand as usize) {
                Some(batch) => {
                    idle = 0;
                    if !self.base.deliver(batch) {
                        return;
                    }
                }
                None => idle += 1,
            }
        }
    }

    fn drop_queued(&self) {
        for connector in &self.connectors {
            for batch in connector.take_queued() {
                self.base.recycle(batch);
            }
        }
    }

    /// Share outstanding downstream demand among live connectors.
    fn pump(&self) {
        let live: Vec<&Arc<Connector<B>>> = self
            .connectors
            .iter()
            .filter(|c| !c.is_terminated())
            .collect();
        if live.is_empty() {
            return;
        }
        let demand = self.base.demand();
        if demand <= 0 {
            return;
        }
        let share = (demand + live.len() as i64 - 1) / live.len() as i64;
        let target = share.min(self.max_connector_request);
        for connector in live {
            let pending = connector.in_flight.load(Ordering::Acquire)
                + connector.queued_rows.load(Ordering::Acquire);
            let want = target - pending;
            if want <= 0 {
                continue;
            }
            connector.in_flight.fetch_add(want, Ordering::AcqRel);
            if let Err(e) = connector.upstream.request(want as u64) {
                warn!(
                    "fan-in {} connector {} refused request: {}",
                    self.base.name(),
                    connector.index,
                    e
                );
                connector.in_flight.fetch_sub(want, Ordering::AcqRel);
                self.connector_terminated(connector, Outcome::Failed, Some(e));
            }
        }
    }

    fn cancel_upstreams(&self) {
        if !self.base.state_machine().try_set_flag(CANCEL_FORWARDED) {
            return;
        }
        for connector in &self.connectors {
            if !connector.is_terminated() {
                connector.upstream.cancel();
            }
        }
    }
}

impl<B: Batch> Task for FanIn<B> {
    fn task_core(&self) -> &TaskCore {
        self.base.task_core()
    }

    fn run(&self) {
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
                    if self.has_failure() {
                        // The merged result is failed already; stop the rest.
                        self.cancel_upstreams();
                    }
                    self.drain();
                    if self.base.state() != state {
                        continue;
                    }
                    if self.all_terminated() {
                        let (outcome, cause) = self.merged_term();
                        self.base.begin_termination(outcome, cause);
                        continue;
                    }
                    self.pump();
                    if self.base.state() == state && !self.all_terminated() {
                        return;
                    }
                }
                StageState::CancelRequested => {
                    self.cancel_upstreams();
                    self.drain();
                    if !self.all_terminated() {
                        return;
                    }
                    self.drop_queued();
                    let (outcome, cause) = self.merged_term();
                    self.base.terminate_from(
                        StageState::CancelRequested,
                        outcome.merge(Outcome::Cancelled),
                        cause,
                    );
                }
                StageState::PendingTerm(outcome) => {
                    if self.base.drops_queued(outcome) {
                        self.drop_queued();
                    } else {
                        self.drain();
                    }
                    if !self.all_empty() {
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

impl<B: Batch> Stateful for FanIn<B> {
    fn state_machine(&self) -> &StateMachine {
        self.base.state_machine()
    }

    fn on_release(&self) {
        self.drop_queued();
        self.base.release();
    }
}

impl<B: Batch> Stage<B> for FanIn<B> {
    fn base(&self) -> &EmitterBase<B> {
        &self.base
    }

    fn propagate_rebind(&self, binding: &Binding) -> FlowResult<()> {
        for connector in &self.connectors {
            connector.upstream.rebind(binding)?;
        }
        Ok(())
    }

    fn reset_local(&self, _binding: &Binding) {
        for connector in &self.connectors {
            connector.reset();
        }
        self.terminations.store(0, Ordering::Release);
    }

    fn stage_upstreams(&self) -> Vec<EmitterRef<B>> {
        self.connectors.iter().map(|c| c.upstream.clone()).collect()
    }
}

struct ConnectorReceiver<B: Batch> {
    stage: Weak<FanIn<B>>,
    connector: Arc<Connector<B>>,
}

impl<B: Batch> Receiver<B> for ConnectorReceiver<B> {
    fn on_batch(&mut self, batch: B) -> FlowResult<()> {
        if let Some(stage) = self.stage.upgrade() {
            stage.enqueue(&self.connector, batch);
        }
        Ok(())
    }

    fn on_complete(&mut self) -> FlowResult<()> {
        if let Some(stage) = self.stage.upgrade() {
            stage.connector_terminated(&self.connector, Outcome::Completed, None);
        }
        Ok(())
    }

    fn on_cancelled(&mut self) -> FlowResult<()> {
        if let Some(stage) = self.stage.upgrade() {
            stage.connector_terminated(&self.connector, Outcome::Cancelled, None);
        }
        Ok(())
    }

    fn on_error(&mut self, cause: &FlowError) -> FlowResult<()> {
        if let Some(stage) = self.stage.upgrade() {
            stage.connector_terminated(&self.connector, Outcome::Failed, Some(cause.clone()));
        }
        Ok(())
    }

    fn receiver_name(&self) -> String {
        match self.stage.upgrade() {
            Some(stage) => format!("{}[{}]", stage.base.name(), self.connector.index),
            None => format!("fan-in[{}]", self.connector.index),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::batch::{TermBatch, TermBatchType};
    use crate::exec::pipeline::batch_emitter::BatchEmitter;
    use crate::exec::pipeline::callback_emitter::{CallbackEmitter, CallbackProducer, ProducerHandle};
    use crate::exec::pipeline::emitter::test_util::{RecordingReceiver, Seen};
    use crate::exec::pipeline::emitter::{Emitter, StageConfig};
    use crate::exec::pipeline::scheduler::{Scheduler, SchedulerConfig};
    use std::sync::mpsc;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn start(max_request: u64) -> (Scheduler, StageContext) {
        let scheduler = Scheduler::start(SchedulerConfig {
            workers: 3,
            ..SchedulerConfig::default()
        })
        .expect("start scheduler");
        let ctx = StageContext::new(
            scheduler.handle(),
            StageConfig {
                fan_in_max_connector_request: max_request,
                ..StageConfig::default()
            },
        );
        (scheduler, ctx)
    }

    fn values(ctx: &StageContext, var: &str, first: u64, rows: u64) -> EmitterRef<TermBatch> {
        let rows: Vec<[u64; 1]> = (first..first + rows).map(|v| [v]).collect();
        BatchEmitter::new(
            ctx,
            format!("values-{var}"),
            Vars::new([var]),
            Arc::new(TermBatchType::new()),
            TermBatch::from_rows(1, &rows),
        )
    }

    /// Producer failing as soon as it starts.
    struct Failing(&'static str);

    impl CallbackProducer<TermBatch> for Failing {
        fn start(&self, handle: ProducerHandle<TermBatch>) {
            handle.fail(FlowError::producer(self.0));
        }

        fn cancel(&self) {}
    }

    fn drain(rx: &mpsc::Receiver<Seen>) -> (Vec<u64>, Seen) {
        let mut rows = Vec::new();
        loop {
            match rx.recv_timeout(WAIT).expect("signal") {
                Seen::Rows(r) => rows.extend(r.into_iter().map(|row| row[0])),
                terminal => return (rows, terminal),
            }
        }
    }

    #[test]
    fn merges_all_upstreams() {
        let (_scheduler, ctx) = start(4);
        let upstreams = vec![
            values(&ctx, "a", 0, 10),
            values(&ctx, "a", 100, 7),
            values(&ctx, "a", 200, 0),
        ];
        let stage = FanIn::new(
            &ctx,
            "union",
            Vars::new(["a"]),
            Arc::new(TermBatchType::new()),
            upstreams,
        )
        .expect("fan in");
        assert_eq!(stage.vars(), &Vars::new(["a"]));
        let (receiver, rx) = RecordingReceiver::new();
        stage.subscribe(receiver).expect("subscribe");
        stage.request(100).expect("request");
        let (mut rows, terminal) = drain(&rx);
        rows.sort_unstable();
        let mut expected: Vec<u64> = (0..10).chain(100..107).collect();
        expected.sort_unstable();
        assert_eq!(rows, expected);
        assert_eq!(terminal, Seen::Completed);
    }

    #[test]
    fn respects_downstream_demand() {
        let (_scheduler, ctx) = start(64);
        let upstreams = vec![values(&ctx, "a", 0, 50), values(&ctx, "a", 100, 50)];
        let stage = FanIn::new(
            &ctx,
            "union",
            Vars::new(["a"]),
            Arc::new(TermBatchType::new()),
            upstreams,
        )
        .expect("fan in");
        let (receiver, rx) = RecordingReceiver::new();
        stage.subscribe(receiver).expect("subscribe");
        stage.request(5).expect("request");
        let mut got = 0;
        while got < 5 {
            match rx.recv_timeout(WAIT).expect("rows") {
                Seen::Rows(r) => got += r.len(),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(got, 5);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        stage.cancel();
        let (rows, terminal) = drain(&rx);
        assert!(rows.is_empty());
        assert_eq!(terminal, Seen::Cancelled);
    }

    #[test]
    fn failure_wins_with_its_cause() {
        let (_scheduler, ctx) = start(8);
        let failing = CallbackEmitter::with_producer(
            &ctx,
            "endpoint",
            Vars::new(["a"]),
            Arc::new(TermBatchType::new()),
            Arc::new(Failing("timeout contacting endpoint")),
        );
        let upstreams: Vec<EmitterRef<TermBatch>> =
            vec![values(&ctx, "a", 0, 3), failing, values(&ctx, "a", 10, 3)];
        let stage = FanIn::new(
            &ctx,
            "union",
            Vars::new(["a"]),
            Arc::new(TermBatchType::new()),
            upstreams,
        )
        .expect("fan in");
        let (receiver, rx) = RecordingReceiver::new();
        stage.subscribe(receiver).expect("subscribe");
        stage.request(100).expect("request");
        let (_, terminal) = drain(&rx);
        assert_eq!(
            terminal,
            Seen::Failed(FlowError::producer("timeout contacting endpoint"))
        );
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn upstream_with_other_vars_is_rejected() {
        let (_scheduler, ctx) = start(8);
        let x = values(&ctx, "x", 0, 2);
        let y = values(&ctx, "y", 10, 2);
        let err = FanIn::new(
            &ctx,
            "union",
            Vars::new(["x"]),
            Arc::new(TermBatchType::new()),
            vec![x.clone(), y],
        )
        .err()
        .expect("mismatched vars");
        assert!(matches!(err, FlowError::VarsMismatch { .. }));
        assert!(err.is_protocol_error());
        // Nothing was subscribed, so the matching upstream is still usable.
        let (receiver, rx) = RecordingReceiver::new();
        x.subscribe(receiver).expect("subscribe");
        x.request(2).expect("request");
        assert_eq!(drain(&rx), (vec![0, 1], Seen::Completed));
    }

    #[test]
    fn merged_batches_match_declared_width() {
        let (_scheduler, ctx) = start(8);
        let upstreams: Vec<EmitterRef<TermBatch>> = (0..2)
            .map(|i| {
                BatchEmitter::new(
                    &ctx,
                    format!("pairs-{i}"),
                    Vars::new(["s", "o"]),
                    Arc::new(TermBatchType::new()),
                    TermBatch::sequential(2, 4),
                ) as EmitterRef<TermBatch>
            })
            .collect();
        let stage = FanIn::new(
            &ctx,
            "union",
            Vars::new(["s", "o"]),
            Arc::new(TermBatchType::new()),
            upstreams,
        )
        .expect("fan in");
        let (receiver, rx) = RecordingReceiver::new();
        stage.subscribe(receiver).expect("subscribe");
        stage.request(8).expect("request");
        let mut rows = 0;
        loop {
            match rx.recv_timeout(WAIT).expect("signal") {
                Seen::Rows(r) => {
                    assert!(r.iter().all(|row| row.len() == stage.vars().len()));
                    rows += r.len();
                }
                terminal => {
                    assert_eq!(terminal, Seen::Completed);
                    break;
                }
            }
        }
        assert_eq!(rows, 8);
    }

    #[test]
    fn no_upstreams_completes_immediately() {
        let (_scheduler, ctx) = start(8);
        let stage = FanIn::<TermBatch>::new(
            &ctx,
            "empty",
            Vars::new(["a"]),
            Arc::new(TermBatchType::new()),
            Vec::new(),
        )
        .expect("fan in");
        let (receiver, rx) = RecordingReceiver::new();
        stage.subscribe(receiver).expect("subscribe");
        stage.request(1).expect("request");
        assert_eq!(drain(&rx), (Vec::new(), Seen::Completed));
    }

    #[test]
    fn rebind_reaches_every_connector() {
        let (_scheduler, ctx) = start(8);
        let a = values(&ctx, "a", 0, 2);
        let b = values(&ctx, "a", 10, 2);
        assert!(a.delay_release());
        assert!(b.delay_release());
        let stage = FanIn::new(
            &ctx,
            "union",
            Vars::new(["a"]),
            Arc::new(TermBatchType::new()),
            vec![a.clone(), b.clone()],
        )
        .expect("fan in");
        assert!(stage.delay_release());
        let (receiver, rx) = RecordingReceiver::new();
        stage.subscribe(receiver).expect("subscribe");
        for round in 1..=2 {
            stage.request(10).expect("request");
            let (mut rows, terminal) = drain(&rx);
            rows.sort_unstable();
            assert_eq!(rows, vec![0, 1, 10, 11]);
            assert_eq!(terminal, Seen::Completed);
            while !(stage.state().is_delivered()
                && a.state().is_delivered()
                && b.state().is_delivered())
            {
                std::thread::yield_now();
            }
            stage.rebind(&Binding::unbound(round)).expect("rebind");
            assert_eq!(a.state(), StageState::Init);
            assert_eq!(b.state(), StageState::Init);
        }
        stage.allow_release();
        a.allow_release();
        b.allow_release();
    }
}
