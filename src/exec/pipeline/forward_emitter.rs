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
//! Queue-decoupled forwarder.
//!
//! Responsibilities:
//! - Subscribes to one upstream emitter and re-emits its batches from the
//!   forwarder's own task, so the upstream never runs downstream callbacks.
//! - Translates downstream demand into upstream requests, counting rows that
//!   are queued or already requested.
//! - Optionally transforms or filters batches on the way through.
//!
//! Key exported interfaces:
//! - Types: `ForwardEmitter`, `Transform`.
//!
//! The queue only grows while the forwarder is `Init` or `Live`, and a
//! pending termination finalizes only once the queue is drained and the
//! upstream has reported its own terminal state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::binding::Binding;
use super::emitter::{EmitterBase, EmitterRef, Receiver, Stage, StageContext, UpstreamTerm};
use super::state::{Flag, Outcome, StageState, StateMachine, Stateful};
use super::task::{Task, TaskCore};
use crate::common::error::{FlowError, FlowResult};
use crate::exec::batch::{Batch, split_front};
use crate::fedflow_logging::{debug, warn};

const CANCEL_FORWARDED: Flag = Flag::new(0, "CANCEL_FORWARDED");
static FLAGS: [Flag; 1] = [CANCEL_FORWARDED];

/// Per-batch transformation. `Ok(None)` drops the batch.
pub type Transform<B> = Box<dyn FnMut(B) -> FlowResult<Option<B>> + Send>;

pub struct ForwardEmitter<B: Batch> {
    base: EmitterBase<B>,
    upstream: EmitterRef<B>,
    queue: Mutex<VecDeque<B>>,
    queued_rows: AtomicI64,
    /// Rows requested from upstream and not received yet.
    in_flight: AtomicI64,
    upstream_term: Mutex<Option<UpstreamTerm>>,
    transform: Mutex<Option<Transform<B>>>,
}

impl<B: Batch> ForwardEmitter<B> {
    pub fn new(
        ctx: &StageContext,
        name: impl Into<String>,
        upstream: EmitterRef<B>,
    ) -> FlowResult<Arc<Self>> {
        Self::build(ctx, name.into(), upstream, None)
    }

    pub fn with_transform(
        ctx: &StageContext,
        name: impl Into<String>,
        upstream: EmitterRef<B>,
        transform: Transform<B>,
    ) -> FlowResult<Arc<Self>> {
        Self::build(ctx, name.into(), upstream, Some(transform))
    }

    fn build(
        ctx: &StageContext,
        name: String,
        upstream: EmitterRef<B>,
        transform: Option<Transform<B>>,
    ) -> FlowResult<Arc<Self>> {
        let vars = upstream.vars().clone();
        let batch_type = upstream.batch_type().clone();
        let stage = Arc::new_cyclic(|weak: &Weak<Self>| {
            let this: Weak<dyn Task> = weak.clone();
            Self {
                base: EmitterBase::new(ctx, name, vars, batch_type, &FLAGS, this),
                upstream: upstream.clone(),
                queue: Mutex::new(VecDeque::new()),
                queued_rows: AtomicI64::new(0),
                in_flight: AtomicI64::new(0),
                upstream_term: Mutex::new(None),
                transform: Mutex::new(transform),
            }
        });
        upstream.subscribe(Box::new(ForwardReceiver {
            stage: Arc::downgrade(&stage),
        }))?;
        Ok(stage)
    }

    pub fn upstream(&self) -> &EmitterRef<B> {
        &self.upstream
    }

    pub fn queued_rows(&self) -> i64 {
        self.queued_rows.load(Ordering::Acquire)
    }

    fn enqueue(&self, batch: B) {
        let rows = batch.rows() as i64;
        self.in_flight.fetch_sub(rows, Ordering::AcqRel);
        let rejected = {
            let mut queue = self
                .queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if matches!(self.base.state(), StageState::Init | StageState::Live) {
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

    fn upstream_terminated(&self, outcome: Outcome, cause: Option<FlowError>) {
        if let Ok(mut term) = self.upstream_term.lock()
            && term.is_none()
        {
            *term = Some((outcome, cause));
        }
        self.base.awake();
    }

    fn upstream_done(&self) -> Option<UpstreamTerm> {
        self.upstream_term.lock().ok().and_then(|t| t.clone())
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

    fn apply_transform(&self, batch: B) -> FlowResult<Option<B>> {
        let mut transform = self
            .transform
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match transform.as_mut() {
            Some(f) => f(batch),
            None => Ok(Some(batch)),
        }
    }

    /// Forward queued batches within demand. False once the stage stopped
    /// accepting output (receiver or transform failure).
    fn drain(&self) -> bool {
        loop {
            let demand = self.base.demand();
            if demand <= 0 {
                return true;
            }
            let Some(batch) = self.pop_within(demand as usize) else {
                return true;
            };
            match self.apply_transform(batch) {
                Ok(Some(out)) => {
                    if !self.base.deliver(out) {
                        return false;
                    }
                }
                Ok(None) => {}
                Err(cause) => {
                    warn!("stage {} transform failed: {}", self.base.name(), cause);
                    self.drop_queued();
                    self.base.begin_termination(Outcome::Failed, Some(cause));
                    return false;
                }
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

    /// Ask upstream for what downstream wants beyond what is queued or in flight.
    fn pump(&self) {
        let want = self.base.demand() - self.queued_rows() - self.in_flight.load(Ordering::Acquire);
        if want <= 0 {
            return;
        }
        self.in_flight.fetch_add(want, Ordering::AcqRel);
        if let Err(e) = self.upstream.request(want as u64) {
            warn!(
                "stage {} upstream {} refused request: {}",
                self.base.name(),
                self.upstream.name(),
                e
            );
            self.in_flight.fetch_sub(want, Ordering::AcqRel);
            self.base.begin_termination(Outcome::Failed, Some(e));
        }
    }

    fn forward_cancel(&self) {
        if self.base.state_machine().try_set_flag(CANCEL_FORWARDED) {
            debug!(
                "stage {} cancels upstream {}",
                self.base.name(),
                self.upstream.name()
            );
            self.upstream.cancel();
        }
    }
}

impl<B: Batch> Task for ForwardEmitter<B> {
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
                    match self.upstream_done() {
                        Some((outcome, cause)) => {
                            self.base.begin_termination(outcome, cause);
                        }
                        None => {
                            self.pump();
                            if self.base.state() == state {
                                return;
                            }
                        }
                    }
                }
                StageState::CancelRequested => {
                    self.forward_cancel();
                    self.drain();
                    if self.upstream_done().is_none() {
                        return;
                    }
                    self.drop_queued();
                    self.base.terminate_from(
                        StageState::CancelRequested,
                        Outcome::Cancelled,
                        None,
                    );
                }
                StageState::PendingTerm(outcome) => {
                    if outcome != Outcome::Completed {
                        self.forward_cancel();
                    }
                    if self.base.drops_queued(outcome) {
                        self.drop_queued();
                    } else {
                        self.drain();
                    }
                    if !self.queue_is_empty() || self.upstream_done().is_none() {
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

impl<B: Batch> Stateful for ForwardEmitter<B> {
    fn state_machine(&self) -> &StateMachine {
        self.base.state_machine()
    }

    fn on_release(&self) {
        self.drop_queued();
        self.base.release();
    }
}

impl<B: Batch> Stage<B> for ForwardEmitter<B> {
    fn base(&self) -> &EmitterBase<B> {
        &self.base
    }

    fn propagate_rebind(&self, binding: &Binding) -> FlowResult<()> {
        self.upstream.rebind(binding)
    }

    fn reset_local(&self, _binding: &Binding) {
        self.queued_rows.store(0, Ordering::Release);
        self.in_flight.store(0, Ordering::Release);
        if let Ok(mut term) = self.upstream_term.lock() {
            *term = None;
        }
    }

    fn stage_upstreams(&self) -> Vec<EmitterRef<B>> {
        vec![self.upstream.clone()]
    }
}

struct ForwardReceiver<B: Batch> {
    stage: Weak<ForwardEmitter<B>>,
}

impl<B: Batch> Receiver<B> for ForwardReceiver<B> {
    fn on_batch(&mut self, batch: B) -> FlowResult<()> {
        match self.stage.upgrade() {
            Some(stage) => stage.enqueue(batch),
            None => drop(batch),
        }
        Ok(())
    }

    fn on_complete(&mut self) -> FlowResult<()> {
        if let Some(stage) = self.stage.upgrade() {
            stage.upstream_terminated(Outcome::Completed, None);
        }
        Ok(())
    }

    fn on_cancelled(&mut self) -> FlowResult<()> {
        if let Some(stage) = self.stage.upgrade() {
            stage.upstream_terminated(Outcome::Cancelled, None);
        }
        Ok(())
    }

    fn on_error(&mut self, cause: &FlowError) -> FlowResult<()> {
        if let Some(stage) = self.stage.upgrade() {
            stage.upstream_terminated(Outcome::Failed, Some(cause.clone()));
        }
        Ok(())
    }

    fn receiver_name(&self) -> String {
        self.stage
            .upgrade()
            .map(|s| s.base.name().to_string())
            .unwrap_or_else(|| "forwarder".to_string())
    }
}
