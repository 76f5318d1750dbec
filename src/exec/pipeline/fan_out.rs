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
//! Fan-out: one upstream shared by several consumers.
//!
//! Responsibilities:
//! - Subscribes a single hub to the upstream and copies every batch into the
//!   queue of each live output.
//! - Keeps a per-output clock (rows delivered) and limits upstream requests
//!   so that no output runs more than `fan_out_max_clock_gap` rows ahead of
//!   the slowest live output.
//! - Routes rebinds through the hub so the shared upstream re-executes once
//!   per binding sequence.
//!
//! Key exported interfaces:
//! - Types: `FanOutOutput`.
//! - Functions: `fan_out`.
//!
//! Cancelled outputs leave the clock calculation. The upstream is cancelled
//! only after every output has cancelled.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::binding::{Binding, RebindGuard};
use super::emitter::{
    Emitter, EmitterBase, EmitterRef, Receiver, Stage, StageContext, UpstreamTerm,
};
use super::state::{Outcome, StageState, StateMachine, Stateful};
use super::task::{Task, TaskCore};
use crate::common::error::{FlowError, FlowResult};
use crate::exec::batch::{Batch, split_front};
use crate::fedflow_logging::{debug, warn};

struct FanOutHub<B: Batch> {
    name: String,
    upstream: EmitterRef<B>,
    outputs: Mutex<Vec<Weak<FanOutOutput<B>>>>,
    max_gap: u64,
    /// Rows requested from upstream in the current execution.
    requested: AtomicU64,
    upstream_term: Mutex<Option<UpstreamTerm>>,
    rebind_guard: RebindGuard,
    cancelled: AtomicUsize,
}

impl<B: Batch> FanOutHub<B> {
    fn outputs(&self) -> Vec<Arc<FanOutOutput<B>>> {
        self.outputs
            .lock()
            .map(|outputs| outputs.iter().filter_map(Weak::upgrade).collect())
            .unwrap_or_default()
    }

    fn live_outputs(&self) -> Vec<Arc<FanOutOutput<B>>> {
        self.outputs()
            .into_iter()
            .filter(|o| o.accepts_rows())
            .collect()
    }

    fn term(&self) -> Option<UpstreamTerm> {
        self.upstream_term.lock().ok().and_then(|t| t.clone())
    }

    fn dispatch(&self, batch: B) {
        let outputs = self.live_outputs();
        let Some((last, others)) = outputs.split_last() else {
            self.upstream.batch_type().recycle(batch);
            return;
        };
        for output in others {
            output.enqueue(batch.copy());
        }
        last.enqueue(batch);
    }

    fn upstream_terminated(&self, outcome: Outcome, cause: Option<FlowError>) {
        if let Ok(mut term) = self.upstream_term.lock()
            && term.is_none()
        {
            *term = Some((outcome, cause));
        }
        for output in self.outputs() {
            output.base.awake();
        }
    }

    /// Request upstream rows up to what the furthest consumer wants, bounded
    /// by the slowest live consumer's clock plus the allowed gap.
    fn pump(&self) {
        let outputs = self.live_outputs();
        if outputs.is_empty() || self.term().is_some() {
            return;
        }
        let mut min_clock = u64::MAX;
        let mut need = 0_u64;
        for output in &outputs {
            let clock = output.clock();
            min_clock = min_clock.min(clock);
            need = need.max(clock.saturating_add(output.base.demand().max(0) as u64));
        }
        let allowed = need.min(min_clock.saturating_add(self.max_gap));
        let mut current = self.requested.load(Ordering::Acquire);
        while allowed > current {
            match self.requested.compare_exchange(
                current,
                allowed,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    if let Err(e) = self.upstream.request(allowed - current) {
                        warn!("fan-out {} upstream refused request: {}", self.name, e);
                        self.upstream_terminated(Outcome::Failed, Some(e));
                    }
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn output_cancelled(&self) {
        let total = self.outputs().len();
        if self.cancelled.fetch_add(1, Ordering::AcqRel) + 1 >= total {
            debug!("fan-out {} lost every consumer, cancelling upstream", self.name);
            self.upstream.cancel();
        }
    }

    fn rebind(&self, binding: &Binding) -> FlowResult<()> {
        let sequence = binding.sequence();
        let previous = self.rebind_guard.last();
        if !self.rebind_guard.observe(sequence) {
            return Ok(());
        }
        let result = self.rebind_shared(binding);
        if result.is_err() {
            self.rebind_guard.forget(sequence, previous);
        }
        result
    }

    fn rebind_shared(&self, binding: &Binding) -> FlowResult<()> {
        let outputs = self.outputs();
        if let Some(busy) = outputs
            .iter()
            .find(|o| !matches!(o.base.state(), StageState::Init | StageState::TermDelivered(_)))
        {
            return Err(FlowError::RebindNotTerminated {
                state: format!("{}: {}", busy.base.name(), busy.base.state()),
            });
        }
        self.upstream.rebind(binding)?;
        self.requested.store(0, Ordering::Release);
        self.cancelled.store(0, Ordering::Release);
        if let Ok(mut term) = self.upstream_term.lock() {
            *term = None;
        }
        // Siblings reset now so none of them misses rows of the next run.
        // The output that started the rebind already recorded the sequence
        // and returns immediately.
        for output in outputs {
            output.rebind(binding)?;
        }
        Ok(())
    }
}

struct HubReceiver<B: Batch> {
    hub: Weak<FanOutHub<B>>,
}

impl<B: Batch> Receiver<B> for HubReceiver<B> {
    fn on_batch(&mut self, batch: B) -> FlowResult<()> {
        if let Some(hub) = self.hub.upgrade() {
            hub.dispatch(batch);
        }
        Ok(())
    }

    fn on_complete(&mut self) -> FlowResult<()> {
        if let Some(hub) = self.hub.upgrade() {
            hub.upstream_terminated(Outcome::Completed, None);
        }
        Ok(())
    }

    fn on_cancelled(&mut self) -> FlowResult<()> {
        if let Some(hub) = self.hub.upgrade() {
            hub.upstream_terminated(Outcome::Cancelled, None);
        }
        Ok(())
    }

    fn on_error(&mut self, cause: &FlowError) -> FlowResult<()> {
        if let Some(hub) = self.hub.upgrade() {
            hub.upstream_terminated(Outcome::Failed, Some(cause.clone()));
        }
        Ok(())
    }

    fn receiver_name(&self) -> String {
        self.hub
            .upgrade()
            .map(|h| h.name.clone())
            .unwrap_or_else(|| "fan-out".to_string())
    }
}

/// One consumer-facing branch of a fan-out.
pub struct FanOutOutput<B: Batch> {
    base: EmitterBase<B>,
    hub: Arc<FanOutHub<B>>,
    index: usize,
    queue: Mutex<VecDeque<B>>,
    queued_rows: AtomicI64,
    clock: AtomicU64,
}

/// Split `upstream` into `outputs` independent emitters.
pub fn fan_out<B: Batch>(
    ctx: &StageContext,
    name: impl Into<String>,
    upstream: EmitterRef<B>,
    outputs: usize,
) -> FlowResult<Vec<Arc<FanOutOutput<B>>>> {
    let name = name.into();
    let hub = Arc::new(FanOutHub {
        name: name.clone(),
        upstream: upstream.clone(),
        outputs: Mutex::new(Vec::with_capacity(outputs)),
        max_gap: ctx.config().fan_out_max_clock_gap.max(1),
        requested: AtomicU64::new(0),
        upstream_term: Mutex::new(None),
        rebind_guard: RebindGuard::default(),
        cancelled: AtomicUsize::new(0),
    });
    let created: Vec<Arc<FanOutOutput<B>>> = (0..outputs)
        .map(|index| {
            Arc::new_cyclic(|weak: &Weak<FanOutOutput<B>>| {
                let this: Weak<dyn Task> = weak.clone();
                FanOutOutput {
                    base: EmitterBase::new(
                        ctx,
                        format!("{name}#{index}"),
                        upstream.vars().clone(),
                        upstream.batch_type().clone(),
                        &[],
                        this,
                    ),
                    hub: hub.clone(),
                    index,
                    queue: Mutex::new(VecDeque::new()),
                    queued_rows: AtomicI64::new(0),
                    clock: AtomicU64::new(0),
                }
            })
        })
        .collect();
    if let Ok(mut slots) = hub.outputs.lock() {
        slots.extend(created.iter().map(Arc::downgrade));
    }
    upstream.subscribe(Box::new(HubReceiver {
        hub: Arc::downgrade(&hub),
    }))?;
    Ok(created)
}

impl<B: Batch> FanOutOutput<B> {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Rows delivered to this output's receivers in the current execution.
    pub fn clock(&self) -> u64 {
        self.clock.load(Ordering::Acquire)
    }

    pub fn queued_rows(&self) -> i64 {
        self.queued_rows.load(Ordering::Acquire)
    }

    fn accepts_rows(&self) -> bool {
        matches!(self.base.state(), StageState::Init | StageState::Live)
    }

    fn enqueue(&self, batch: B) {
        let rows = batch.rows() as i64;
        let rejected = {
            let mut queue = self
                .queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if self.accepts_rows() {
                queue.push_back(batch);
                self.queued_rows.fetch_add(rows, Ordering::AcqRel);
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

    fn drain(&self) {
        loop {
            let demand = self.base.demand();
            if demand <= 0 {
                return;
            }
            let Some(batch) = self.pop_within(demand as usize) else {
                return;
            };
            let rows = batch.rows() as u64;
            self.clock.fetch_add(rows, Ordering::AcqRel);
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
}

impl<B: Batch> Task for FanOutOutput<B> {
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
                    self.drain();
                    if self.base.state() != state {
                        continue;
                    }
                    match self.hub.term() {
                        Some((outcome, cause)) => {
                            self.base.begin_termination(outcome, cause);
                        }
                        None => {
                            self.hub.pump();
                            if self.base.state() == state {
                                return;
                            }
                        }
                    }
                }
                StageState::CancelRequested => {
                    self.drop_queued();
                    if self.base.terminate_from(
                        StageState::CancelRequested,
                        Outcome::Cancelled,
                        None,
                    ) {
                        self.hub.output_cancelled();
                        // The slowest consumer may just have left.
                        self.hub.pump();
                    }
                }
                StageState::PendingTerm(outcome) => {
                    if self.base.drops_queued(outcome) {
                        self.drop_queued();
                    } else {
                        self.drain();
                    }
                    if !self.queue_is_empty() {
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

impl<B: Batch> Stateful for FanOutOutput<B> {
    fn state_machine(&self) -> &StateMachine {
        self.base.state_machine()
    }

    fn on_release(&self) {
        self.drop_queued();
        self.base.release();
    }
}

impl<B: Batch> Stage<B> for FanOutOutput<B> {
    fn base(&self) -> &EmitterBase<B> {
        &self.base
    }

    fn propagate_rebind(&self, binding: &Binding) -> FlowResult<()> {
        self.hub.rebind(binding)
    }

    fn reset_local(&self, _binding: &Binding) {
        self.clock.store(0, Ordering::Release);
        self.queued_rows.store(0, Ordering::Release);
    }

    fn stage_upstreams(&self) -> Vec<EmitterRef<B>> {
        vec![self.hub.upstream.clone()]
    }
}
