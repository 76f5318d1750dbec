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
//! Schedulable task primitives.
//!
//! Responsibilities:
//! - Defines the `Task` contract: a non-blocking quantum plus an `awake()` trigger.
//! - Coalesces concurrent wakeups into at most one extra run and guarantees a task
//!   never runs on two threads at once.
//!
//! Key exported interfaces:
//! - Types: `TaskCore`, `TaskRef`, `FnTask`.
//! - Traits: `Task`.
//!
//! Wakeup protocol: `awake()` increments the pending counter and only the
//! 0 -> 1 transition enqueues. After a run the worker compare-and-resets the
//! counter against the value it saw at dequeue; a mismatch means wakeups
//! arrived mid-run and the task is re-enqueued exactly once.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, TryLockError, Weak};

use super::scheduler::SchedulerHandle;
use crate::common::error::panic_message;
use crate::fedflow_logging::error;

/// Unit of work run by the scheduler.
pub trait Task: Send + Sync + 'static {
    fn task_core(&self) -> &TaskCore;

    /// One cooperative quantum. Must not block.
    fn run(&self);

    fn task_name(&self) -> String {
        "task".to_string()
    }
}

/// Shared handle to a scheduled task.
pub type TaskRef = Arc<dyn Task>;

/// Result of one worker-driven execution attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RunOutcome {
    /// No wakeup arrived during the run; the task is idle.
    Idle,
    /// Wakeups arrived during the run; the task must be queued again.
    Requeue,
    /// Another thread (`run_now`) holds the running flag.
    Busy,
}

/// Scheduling metadata embedded in every task.
pub struct TaskCore {
    scheduler: SchedulerHandle,
    this: Weak<dyn Task>,
    preferred_worker: AtomicUsize,
    wakeups: AtomicU64,
    running: AtomicBool,
    unloaded: AtomicBool,
}

impl TaskCore {
    /// `this` is the weak self reference of the owning task, usually obtained
    /// from `Arc::new_cyclic`.
    pub fn new(scheduler: &SchedulerHandle, this: Weak<dyn Task>) -> Self {
        Self {
            preferred_worker: AtomicUsize::new(scheduler.next_affinity()),
            scheduler: scheduler.clone(),
            this,
            wakeups: AtomicU64::new(0),
            running: AtomicBool::new(false),
            unloaded: AtomicBool::new(false),
        }
    }

    pub fn scheduler(&self) -> &SchedulerHandle {
        &self.scheduler
    }

    pub fn preferred_worker(&self) -> usize {
        self.preferred_worker.load(Ordering::Relaxed)
    }

    pub(crate) fn set_preferred_worker(&self, idx: usize) {
        self.preferred_worker.store(idx, Ordering::Relaxed);
    }

    pub fn pending_wakeups(&self) -> u64 {
        self.wakeups.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_unloaded(&self) -> bool {
        self.unloaded.load(Ordering::Acquire)
    }

    /// Request one more run of the task.
    pub fn awake(&self) {
        if self.is_unloaded() {
            return;
        }
        if self.wakeups.fetch_add(1, Ordering::AcqRel) != 0 {
            // Already queued or running; the worker will notice the bump.
            return;
        }
        match self.this.upgrade() {
            Some(task) => self.scheduler.schedule(task),
            None => self.wakeups.store(0, Ordering::Release),
        }
    }

    /// Stop accepting wakeups. Queued copies run once more at most and are dropped.
    pub fn unload(&self) {
        self.unloaded.store(true, Ordering::Release);
    }

    /// Run the task on the calling thread if nobody else is running it.
    ///
    /// Used to break priority inversion when a thread waits on this task's
    /// progress. Pending wakeups are left for the queued copy.
    pub fn run_now(&self) -> bool {
        let Some(task) = self.this.upgrade() else {
            return false;
        };
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        run_guarded(task.as_ref());
        self.running.store(false, Ordering::Release);
        true
    }
}

impl fmt::Debug for TaskCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskCore")
            .field("preferred_worker", &self.preferred_worker())
            .field("wakeups", &self.pending_wakeups())
            .field("running", &self.is_running())
            .field("unloaded", &self.is_unloaded())
            .finish()
    }
}

/// Run one quantum, logging and swallowing a panic.
fn run_guarded(task: &dyn Task) -> bool {
    match catch_unwind(AssertUnwindSafe(|| task.run())) {
        Ok(()) => true,
        Err(payload) => {
            error!(
                "task {} panicked: {}",
                task.task_name(),
                panic_message(payload.as_ref())
            );
            false
        }
    }
}

/// Worker-side execution with wakeup coalescing.
pub(crate) fn execute(task: &TaskRef) -> (RunOutcome, bool) {
    let core = task.task_core();
    let seen = core.wakeups.load(Ordering::Acquire);
    if core
        .running
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return (RunOutcome::Busy, true);
    }
    let ok = run_guarded(task.as_ref());
    core.running.store(false, Ordering::Release);

    if core.is_unloaded() {
        core.wakeups.store(0, Ordering::Release);
        return (RunOutcome::Idle, ok);
    }
    match core
        .wakeups
        .compare_exchange(seen, 0, Ordering::AcqRel, Ordering::Acquire)
    {
        Ok(_) => (RunOutcome::Idle, ok),
        Err(_) => {
            // Collapse every mid-run wakeup into one queued run.
            core.wakeups.store(1, Ordering::Release);
            (RunOutcome::Requeue, ok)
        }
    }
}

type TaskFn = Box<dyn FnMut() + Send + 'static>;

/// Task wrapping a closure. Each `awake()` eventually runs the closure.
pub struct FnTask {
    core: TaskCore,
    name: String,
    body: Mutex<TaskFn>,
}

impl FnTask {
    pub fn new<F>(scheduler: &SchedulerHandle, name: impl Into<String>, body: F) -> Arc<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let name = name.into();
        Arc::new_cyclic(|weak: &Weak<FnTask>| {
            let this: Weak<dyn Task> = weak.clone();
            Self {
                core: TaskCore::new(scheduler, this),
                name,
                body: Mutex::new(Box::new(body)),
            }
        })
    }

    pub fn awake(&self) {
        self.core.awake();
    }
}

impl Task for FnTask {
    fn task_core(&self) -> &TaskCore {
        &self.core
    }

    fn run(&self) {
        // The running flag already excludes concurrent runs; the mutex only
        // provides `FnMut` access.
        match self.body.try_lock() {
            Ok(mut body) => (*body)(),
            Err(TryLockError::Poisoned(poisoned)) => {
                let mut body = poisoned.into_inner();
                (*body)()
            }
            Err(TryLockError::WouldBlock) => {}
        }
    }

    fn task_name(&self) -> String {
        self.name.clone()
    }
}
