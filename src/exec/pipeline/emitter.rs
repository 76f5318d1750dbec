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
//! Emitter/receiver streaming protocol.
//!
//! Responsibilities:
//! - Defines the `Receiver` callbacks and the `Emitter` surface every stage exposes.
//! - Implements the shared protocol bookkeeping in `EmitterBase`: subscription,
//!   credit accounting, batch delivery, exactly-once termination and rebind.
//! - Turns every `Stage` into an `Emitter` through one blanket implementation.
//!
//! Key exported interfaces:
//! - Traits: `Receiver`, `Emitter`, `Stage`.
//! - Types: `EmitterBase`, `EmitterRef`, `StageConfig`, `StageContext`.
//!
//! Demand is counted in rows. `request(n)` adds `n` (saturating) to the
//! outstanding demand, every delivered row subtracts one. A stage never hands
//! out more rows than were requested. All receiver callbacks run on the
//! stage's own task, so a receiver never sees two callbacks at once.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::binding::{Binding, RebindGuard, Vars};
use super::scheduler::SchedulerHandle;
use super::state::{Flag, Outcome, StageState, StateMachine, Stateful};
use super::task::{Task, TaskCore};
use crate::common::app_config::RuntimeConfig;
use crate::common::config;
use crate::common::error::{FlowError, FlowResult};
use crate::exec::batch::{Batch, BatchType};
use crate::fedflow_logging::{debug, warn};

/// Consumer side of a stream. Callbacks run on the producing stage's task and
/// must not block.
pub trait Receiver<B: Batch>: Send {
    fn on_batch(&mut self, batch: B) -> FlowResult<()>;

    /// Delivery to the second and later subscribers of one emitter. The
    /// receiver must not keep a reference to `batch`.
    fn on_batch_by_copy(&mut self, batch: &B) -> FlowResult<()> {
        self.on_batch(batch.copy())
    }

    fn on_complete(&mut self) -> FlowResult<()>;

    fn on_cancelled(&mut self) -> FlowResult<()>;

    fn on_error(&mut self, cause: &FlowError) -> FlowResult<()>;

    fn receiver_name(&self) -> String {
        "receiver".to_string()
    }
}

/// Producer side of a stream.
pub trait Emitter<B: Batch>: Send + Sync {
    fn name(&self) -> &str;

    fn vars(&self) -> &Vars;

    fn batch_type(&self) -> &Arc<dyn BatchType<B>>;

    /// Register a receiver. Only valid before the first `request`.
    fn subscribe(&self, receiver: Box<dyn Receiver<B>>) -> FlowResult<()>;

    /// Grant credit for `rows` more rows. The first request starts the stage.
    fn request(&self, rows: u64) -> FlowResult<()>;

    /// Ask the stage to stop. Always ends in exactly one terminal notification.
    fn cancel(&self);

    /// Reset a terminated stage for re-execution under `binding`.
    fn rebind(&self, binding: &Binding) -> FlowResult<()>;

    fn state(&self) -> StageState;

    fn state_label(&self) -> String;

    fn upstreams(&self) -> Vec<EmitterRef<B>>;

    /// Keep the stage alive past terminal delivery. False if already released.
    fn delay_release(&self) -> bool;

    fn allow_release(&self);

    /// Run one quantum on the calling thread if no worker is running the stage.
    fn run_now(&self) -> bool;
}

pub type EmitterRef<B> = Arc<dyn Emitter<B>>;

/// Stage tuning knobs taken from `[runtime]`.
#[derive(Clone, Debug, PartialEq)]
pub struct StageConfig {
    pub fan_out_max_clock_gap: u64,
    pub fan_in_max_connector_request: u64,
    pub callback_max_buffered_rows: u64,
    pub state_lock_spins: u32,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self::from_runtime(&RuntimeConfig::default())
    }
}

impl StageConfig {
    pub fn from_runtime(runtime: &RuntimeConfig) -> Self {
        Self {
            fan_out_max_clock_gap: runtime.fan_out_max_clock_gap,
            fan_in_max_connector_request: runtime.fan_in_max_connector_request,
            callback_max_buffered_rows: runtime.callback_max_buffered_rows,
            state_lock_spins: runtime.state_lock_spins,
        }
    }

    pub fn from_app_config() -> Self {
        Self {
            fan_out_max_clock_gap: config::fan_out_max_clock_gap(),
            fan_in_max_connector_request: config::fan_in_max_connector_request(),
            callback_max_buffered_rows: config::callback_max_buffered_rows(),
            state_lock_spins: config::state_lock_spins(),
        }
    }
}

/// What a stage needs at construction: where to run and how to tune itself.
#[derive(Clone, Debug)]
pub struct StageContext {
    scheduler: SchedulerHandle,
    config: StageConfig,
}

impl StageContext {
    pub fn new(scheduler: SchedulerHandle, config: StageConfig) -> Self {
        Self { scheduler, config }
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub fn config(&self) -> &StageConfig {
        &self.config
    }
}

/// Protocol state shared by every stage variant.
pub struct EmitterBase<B: Batch> {
    name: String,
    vars: Vars,
    batch_type: Arc<dyn BatchType<B>>,
    state: StateMachine,
    core: TaskCore,
    demand: AtomicI64,
    receivers: Mutex<Vec<Box<dyn Receiver<B>>>>,
    receiver_count: AtomicUsize,
    // Set when a receiver rejected a batch; no further batches go out
    // until the next rebind.
    receiver_failed: AtomicBool,
    cause: Mutex<Option<FlowError>>,
    rebind_guard: RebindGuard,
    rows_delivered: AtomicU64,
    batches_delivered: AtomicU64,
}

impl<B: Batch> EmitterBase<B> {
    pub fn new(
        ctx: &StageContext,
        name: impl Into<String>,
        vars: Vars,
        batch_type: Arc<dyn BatchType<B>>,
        flags: &'static [Flag],
        this: Weak<dyn Task>,
    ) -> Self {
        Self {
            name: name.into(),
            vars,
            batch_type,
            state: StateMachine::with_lock_spins(flags, ctx.config().state_lock_spins),
            core: TaskCore::new(ctx.scheduler(), this),
            demand: AtomicI64::new(0),
            receivers: Mutex::new(Vec::new()),
            receiver_count: AtomicUsize::new(0),
            receiver_failed: AtomicBool::new(false),
            cause: Mutex::new(None),
            rebind_guard: RebindGuard::default(),
            rows_delivered: AtomicU64::new(0),
            batches_delivered: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vars(&self) -> &Vars {
        &self.vars
    }

    pub fn batch_type(&self) -> &Arc<dyn BatchType<B>> {
        &self.batch_type
    }

    pub fn state_machine(&self) -> &StateMachine {
        &self.state
    }

    pub fn task_core(&self) -> &TaskCore {
        &self.core
    }

    pub fn state(&self) -> StageState {
        self.state.load()
    }

    /// Outstanding demand in rows. Never negative for a well-behaved stage.
    pub fn demand(&self) -> i64 {
        self.demand.load(Ordering::Acquire)
    }

    pub fn receiver_count(&self) -> usize {
        self.receiver_count.load(Ordering::Acquire)
    }

    pub fn rows_delivered(&self) -> u64 {
        self.rows_delivered.load(Ordering::Relaxed)
    }

    pub fn batches_delivered(&self) -> u64 {
        self.batches_delivered.load(Ordering::Relaxed)
    }

    pub fn cause(&self) -> Option<FlowError> {
        self.cause.lock().ok().and_then(|c| c.clone())
    }

    pub fn awake(&self) {
        self.core.awake();
    }

    pub fn recycle(&self, batch: B) {
        self.batch_type.recycle(batch);
    }

    pub fn subscribe(&self, receiver: Box<dyn Receiver<B>>) -> FlowResult<()> {
        // Holding the state lock keeps a concurrent first request from
        // starting the stage between the check and the push.
        let guard = self.state.lock();
        if guard.state() != StageState::Init {
            return Err(FlowError::RegisterAfterStart);
        }
        let mut receivers = self
            .receivers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        debug!(
            "stage {} subscribed {}",
            self.name,
            receiver.receiver_name()
        );
        receivers.push(receiver);
        self.receiver_count.store(receivers.len(), Ordering::Release);
        Ok(())
    }

    pub fn request(&self, rows: u64) -> FlowResult<()> {
        if rows == 0 {
            return Err(FlowError::InvalidRequest);
        }
        let state = self.state.load();
        if matches!(state, StageState::Term(_) | StageState::TermDelivered(_)) {
            return Ok(());
        }
        let add = rows.min(i64::MAX as u64) as i64;
        let prev = self
            .demand
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |d| {
                Some(d.saturating_add(add))
            })
            .unwrap_or_else(|d| d);
        let started =
            state == StageState::Init && self.state.move_state(StageState::Init, StageState::Live);
        if started || (prev <= 0 && prev.saturating_add(add) > 0) {
            self.core.awake();
        }
        Ok(())
    }

    pub fn cancel(&self) {
        if self.state.advance(StageState::CancelRequested).is_some() {
            debug!("stage {} cancel requested", self.name);
            self.core.awake();
        }
    }

    /// Hand `batch` to every receiver. The last receiver takes ownership,
    /// the others get a copy. Returns false if a receiver failed; the stage
    /// has then requested its own cancellation. Once a receiver has failed
    /// every later batch is recycled unseen.
    pub fn deliver(&self, batch: B) -> bool {
        if self.receiver_failed.load(Ordering::Acquire) {
            self.batch_type.recycle(batch);
            return false;
        }
        let rows = batch.rows();
        self.demand.fetch_sub(rows as i64, Ordering::AcqRel);
        let mut receivers = self.take_receivers();
        let mut failure = None;
        match receivers.split_last_mut() {
            None => self.batch_type.recycle(batch),
            Some((last, others)) => {
                for receiver in others.iter_mut() {
                    if let Err(e) = receiver.on_batch_by_copy(&batch) {
                        failure.get_or_insert((receiver.receiver_name(), e));
                    }
                }
                if let Err(e) = last.on_batch(batch) {
                    failure.get_or_insert((last.receiver_name(), e));
                }
            }
        }
        self.restore_receivers(receivers);
        self.rows_delivered.fetch_add(rows as u64, Ordering::Relaxed);
        self.batches_delivered.fetch_add(1, Ordering::Relaxed);
        match failure {
            None => true,
            Some((receiver, e)) => {
                warn!(
                    "stage {} receiver {} failed, cancelling: {}",
                    self.name, receiver, e
                );
                self.receiver_failed.store(true, Ordering::Release);
                self.cancel();
                // A pending termination ignores the cancel; the next run
                // drops what is still queued.
                self.core.awake();
                false
            }
        }
    }

    /// Whether a stage pending `outcome` drops its queued rows instead of
    /// delivering them: always on failure, and once a receiver has failed.
    pub fn drops_queued(&self, outcome: Outcome) -> bool {
        outcome == Outcome::Failed || self.receiver_failed.load(Ordering::Acquire)
    }

    /// Enter `PendingTerm(outcome)` and record `cause` if this call won.
    pub fn begin_termination(&self, outcome: Outcome, cause: Option<FlowError>) -> bool {
        let guard = self.state.lock();
        let won = guard.advance(StageState::PendingTerm(outcome)).is_some();
        if won {
            self.store_cause(outcome, cause);
        }
        won
    }

    /// Move `from` straight to `Term(outcome)`, recording `cause` if this call won.
    pub fn terminate_from(
        &self,
        from: StageState,
        outcome: Outcome,
        cause: Option<FlowError>,
    ) -> bool {
        let guard = self.state.lock();
        if guard.state() != from {
            return false;
        }
        let won = guard.advance(StageState::Term(outcome)).is_some();
        if won {
            self.store_cause(outcome, cause);
        }
        won
    }

    /// `PendingTerm(o)` -> `Term(o)`.
    pub fn finish_pending(&self) -> bool {
        match self.state.load() {
            StageState::PendingTerm(o) => self
                .state
                .move_state(StageState::PendingTerm(o), StageState::Term(o)),
            _ => false,
        }
    }

    fn store_cause(&self, outcome: Outcome, cause: Option<FlowError>) {
        if outcome != Outcome::Failed {
            return;
        }
        if let Ok(mut slot) = self.cause.lock()
            && slot.is_none()
        {
            *slot = cause;
        }
    }

    /// Deliver the terminal notification of a `Term` stage, exactly once.
    /// Must run on the stage's own task.
    pub fn deliver_termination(&self, owner: &dyn Stateful) -> bool {
        let StageState::Term(outcome) = self.state.load() else {
            return false;
        };
        let cause = self
            .cause()
            .unwrap_or_else(|| FlowError::producer("failure without cause"));
        let mut receivers = self.take_receivers();
        for receiver in receivers.iter_mut() {
            let result = match outcome {
                Outcome::Completed => receiver.on_complete(),
                Outcome::Cancelled => receiver.on_cancelled(),
                Outcome::Failed => receiver.on_error(&cause),
            };
            if let Err(e) = result {
                warn!(
                    "stage {} receiver {} failed on {} notification: {}",
                    self.name,
                    receiver.receiver_name(),
                    outcome.label(),
                    e
                );
            }
        }
        self.restore_receivers(receivers);
        debug!(
            "stage {} terminated {} after {} rows",
            self.name,
            outcome.label(),
            self.rows_delivered()
        );
        owner.finish_delivery()
    }

    /// Common part of `on_release`: stop scheduling and drop receivers.
    pub fn release(&self) {
        self.core.unload();
        let receivers = self.take_receivers();
        self.receiver_count.store(0, Ordering::Release);
        drop(receivers);
        debug!("stage {} released", self.name);
    }

    /// One-line rendering used by graph dumps.
    pub fn describe(&self) -> String {
        format!(
            "{} {} {} demand={} rows={}",
            self.name,
            self.vars,
            self.state.render(),
            self.demand(),
            self.rows_delivered()
        )
    }

    fn take_receivers(&self) -> Vec<Box<dyn Receiver<B>>> {
        let mut receivers = self
            .receivers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        std::mem::take(&mut *receivers)
    }

    fn restore_receivers(&self, taken: Vec<Box<dyn Receiver<B>>>) {
        let mut receivers = self
            .receivers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let added = std::mem::replace(&mut *receivers, taken);
        receivers.extend(added);
    }

    fn reset_for_rebind(&self) {
        self.demand.store(0, Ordering::Release);
        self.receiver_failed.store(false, Ordering::Release);
        if let Ok(mut cause) = self.cause.lock() {
            *cause = None;
        }
    }
}

impl<B: Batch> fmt::Debug for EmitterBase<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// A stage variant: a task with an `EmitterBase` plus variant hooks.
pub trait Stage<B: Batch>: Task + Stateful {
    fn base(&self) -> &EmitterBase<B>;

    /// Extra validation for `request`.
    fn check_request(&self) -> FlowResult<()> {
        Ok(())
    }

    /// Pass a rebind to the components this stage reads from. Runs before
    /// the local reset and outside any lock.
    fn propagate_rebind(&self, _binding: &Binding) -> FlowResult<()> {
        Ok(())
    }

    /// Reset per-execution state. Runs under the state lock, so it must only
    /// swap fields and never call into another component.
    fn reset_local(&self, binding: &Binding);

    fn stage_upstreams(&self) -> Vec<EmitterRef<B>> {
        Vec::new()
    }
}

impl<B: Batch, S: Stage<B>> Emitter<B> for S {
    fn name(&self) -> &str {
        self.base().name()
    }

    fn vars(&self) -> &Vars {
        self.base().vars()
    }

    fn batch_type(&self) -> &Arc<dyn BatchType<B>> {
        self.base().batch_type()
    }

    fn subscribe(&self, receiver: Box<dyn Receiver<B>>) -> FlowResult<()> {
        self.base().subscribe(receiver)
    }

    fn request(&self, rows: u64) -> FlowResult<()> {
        self.check_request()?;
        self.base().request(rows)
    }

    fn cancel(&self) {
        self.base().cancel();
    }

    fn rebind(&self, binding: &Binding) -> FlowResult<()> {
        rebind_stage(self, binding)
    }

    fn state(&self) -> StageState {
        self.base().state()
    }

    fn state_label(&self) -> String {
        self.base().describe()
    }

    fn upstreams(&self) -> Vec<EmitterRef<B>> {
        self.stage_upstreams()
    }

    fn delay_release(&self) -> bool {
        self.base().state_machine().delay_release()
    }

    fn allow_release(&self) {
        self.drop_release_delay();
    }

    fn run_now(&self) -> bool {
        self.task_core().run_now()
    }
}

fn rebind_stage<B: Batch, S: Stage<B>>(stage: &S, binding: &Binding) -> FlowResult<()> {
    let base = stage.base();
    let sequence = binding.sequence();
    let previous = base.rebind_guard.last();
    if !base.rebind_guard.observe(sequence) {
        debug!(
            "stage {} ignores rebind {} (last {})",
            base.name(),
            sequence,
            previous
        );
        return Ok(());
    }
    if !base.state_machine().delay_release() {
        base.rebind_guard.forget(sequence, previous);
        return Err(FlowError::RebindReleased);
    }
    let result = rebind_held(stage, binding);
    if result.is_err() {
        base.rebind_guard.forget(sequence, previous);
    }
    stage.drop_release_delay();
    result
}

fn rebind_held<B: Batch, S: Stage<B>>(stage: &S, binding: &Binding) -> FlowResult<()> {
    let base = stage.base();
    let state = base.state();
    if !matches!(state, StageState::Init | StageState::TermDelivered(_)) {
        return Err(FlowError::RebindNotTerminated {
            state: state.label(),
        });
    }
    stage.propagate_rebind(binding)?;
    let guard = base.state_machine().lock();
    guard
        .reset_to_init()
        .map_err(|refused| FlowError::RebindNotTerminated {
            state: refused.label(),
        })?;
    base.reset_for_rebind();
    stage.reset_local(binding);
    drop(guard);
    debug!(
        "stage {} rebound to sequence {}",
        base.name(),
        binding.sequence()
    );
    Ok(())
}

/// Terminal signal recorded by stages that consume an upstream.
pub(crate) type UpstreamTerm = (Outcome, Option<FlowError>);
