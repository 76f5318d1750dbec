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
//! Work-stealing task scheduler.
//!
//! Responsibilities:
//! - Runs `Task` quanta on a fixed pool of worker threads without blocking any worker.
//! - Places awakened tasks on their preferred worker, spills to a neighbor or to a
//!   shared overflow queue under imbalance, and lets idle workers steal before parking.
//!
//! Key exported interfaces:
//! - Types: `SchedulerConfig`, `SchedulerStats`, `SchedulerHandle`, `Scheduler`.
//!
//! Placement rules:
//! - A worker queue is overloaded when its length exceeds
//!   `overload_factor * fleet_average + overload_slack`, or reaches capacity.
//! - Queue locks are taken with bounded `try_lock` retries; a contended queue is
//!   treated like an overloaded one.
//! - The balancer thread moves overflow tasks to workers below the acceptable
//!   load, otherwise leaves them for stealing.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, TryLockError};
use std::thread::{self, JoinHandle, Thread};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use super::task::{RunOutcome, TaskRef, execute};
use crate::common::app_config::RuntimeConfig;
use crate::common::config;
use crate::common::logging::should_sample;
use crate::fedflow_logging::{debug, info};

const OVERFLOW_LOG_EVERY: u64 = 1024;
static OVERFLOW_LOG_COUNT: AtomicU64 = AtomicU64::new(0);

#[derive(Clone, Debug)]
/// Tuning for one scheduler instance, read once at start-up.
pub struct SchedulerConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub overload_factor: f64,
    pub overload_slack: usize,
    pub lock_retries: usize,
    pub idle_park: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_runtime(&RuntimeConfig::default())
    }
}

impl SchedulerConfig {
    pub fn from_runtime(runtime: &RuntimeConfig) -> Self {
        Self {
            workers: runtime.actual_worker_threads(),
            queue_capacity: runtime.worker_queue_capacity,
            overload_factor: runtime.queue_overload_factor,
            overload_slack: runtime.queue_overload_slack,
            lock_retries: runtime.queue_lock_retries,
            idle_park: Duration::from_millis(runtime.idle_park_ms),
        }
    }

    /// Build from the process config file, falling back to defaults.
    pub fn from_app_config() -> Self {
        Self {
            workers: config::worker_threads(),
            queue_capacity: config::worker_queue_capacity(),
            overload_factor: config::queue_overload_factor(),
            overload_slack: config::queue_overload_slack(),
            lock_retries: config::queue_lock_retries(),
            idle_park: Duration::from_millis(config::idle_park_ms()),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
/// Point-in-time scheduler counters.
pub struct SchedulerStats {
    pub tasks_run: u64,
    pub panics: u64,
    pub requeues: u64,
    pub steals: u64,
    pub overflow_pushes: u64,
    pub balanced: u64,
    /// Balancer passes that found no worker with room.
    pub balance_stalls: u64,
    pub parks: u64,
}

#[derive(Default)]
struct Counters {
    tasks_run: AtomicU64,
    panics: AtomicU64,
    requeues: AtomicU64,
    steals: AtomicU64,
    overflow_pushes: AtomicU64,
    balanced: AtomicU64,
    balance_stalls: AtomicU64,
    parks: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SchedulerStats {
        SchedulerStats {
            tasks_run: self.tasks_run.load(Ordering::Relaxed),
            panics: self.panics.load(Ordering::Relaxed),
            requeues: self.requeues.load(Ordering::Relaxed),
            steals: self.steals.load(Ordering::Relaxed),
            overflow_pushes: self.overflow_pushes.load(Ordering::Relaxed),
            balanced: self.balanced.load(Ordering::Relaxed),
            balance_stalls: self.balance_stalls.load(Ordering::Relaxed),
            parks: self.parks.load(Ordering::Relaxed),
        }
    }
}

type TaskQueue = Mutex<VecDeque<TaskRef>>;

struct WorkerSlot {
    queue: TaskQueue,
    len: AtomicUsize,
    parked: AtomicBool,
    thread: OnceLock<Thread>,
}

impl WorkerSlot {
    fn new(capacity: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            len: AtomicUsize::new(0),
            parked: AtomicBool::new(false),
            thread: OnceLock::new(),
        }
    }
}

/// Scheduler state shared by workers, the balancer and every task.
pub(crate) struct SchedulerShared {
    config: SchedulerConfig,
    slots: Vec<WorkerSlot>,
    total_queued: AtomicUsize,
    overflow: TaskQueue,
    overflow_len: AtomicUsize,
    overflow_cv: Condvar,
    next_affinity: AtomicUsize,
    shutdown: AtomicBool,
    counters: Counters,
}

fn lock_queue(queue: &TaskQueue) -> MutexGuard<'_, VecDeque<TaskRef>> {
    queue.lock().unwrap_or_else(|e| e.into_inner())
}

fn try_lock_queue(queue: &TaskQueue) -> Option<MutexGuard<'_, VecDeque<TaskRef>>> {
    match queue.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        Err(TryLockError::WouldBlock) => None,
    }
}

impl SchedulerShared {
    fn new(config: SchedulerConfig) -> Self {
        let workers = config.workers.max(1);
        let capacity = config.queue_capacity.max(1);
        Self {
            slots: (0..workers).map(|_| WorkerSlot::new(capacity)).collect(),
            config,
            total_queued: AtomicUsize::new(0),
            overflow: Mutex::new(VecDeque::new()),
            overflow_len: AtomicUsize::new(0),
            overflow_cv: Condvar::new(),
            next_affinity: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    fn capacity(&self) -> usize {
        self.config.queue_capacity.max(1)
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Bounded spin over `try_lock`; `None` means contended.
    fn lock_bounded<'a>(&self, queue: &'a TaskQueue) -> Option<MutexGuard<'a, VecDeque<TaskRef>>> {
        for _ in 0..self.config.lock_retries.max(1) {
            if let Some(guard) = try_lock_queue(queue) {
                return Some(guard);
            }
            std::hint::spin_loop();
        }
        None
    }

    /// Longest queue length still considered healthy.
    fn acceptable_len(&self) -> usize {
        let avg = self.total_queued.load(Ordering::Relaxed) as f64 / self.slots.len() as f64;
        let bound = (avg * self.config.overload_factor).ceil() as usize + self.config.overload_slack;
        bound.min(self.capacity())
    }

    fn overloaded(&self, idx: usize) -> bool {
        let len = self.slots[idx].len.load(Ordering::Relaxed);
        len >= self.capacity() || len > self.acceptable_len()
    }

    fn try_place(&self, idx: usize, task: TaskRef) -> Result<(), TaskRef> {
        if self.overloaded(idx) {
            return Err(task);
        }
        let slot = &self.slots[idx];
        let Some(mut queue) = self.lock_bounded(&slot.queue) else {
            return Err(task);
        };
        if queue.len() >= self.capacity() {
            return Err(task);
        }
        queue.push_back(task);
        slot.len.fetch_add(1, Ordering::SeqCst);
        self.total_queued.fetch_add(1, Ordering::SeqCst);
        drop(queue);
        self.unpark_worker(idx);
        Ok(())
    }

    /// Enqueue an awakened task.
    pub(crate) fn schedule(&self, task: TaskRef) {
        if self.is_shutdown() {
            return;
        }
        let n = self.slots.len();
        let preferred = task.task_core().preferred_worker() % n;
        let task = match self.try_place(preferred, task) {
            Ok(()) => return,
            Err(task) => task,
        };
        let task = if n > 1 {
            let neighbor = (preferred + 1) % n;
            let core = Arc::clone(&task);
            match self.try_place(neighbor, task) {
                Ok(()) => {
                    core.task_core().set_preferred_worker(neighbor);
                    return;
                }
                Err(task) => task,
            }
        } else {
            task
        };
        self.push_overflow(task);
    }

    fn push_overflow(&self, task: TaskRef) {
        Counters::bump(&self.counters.overflow_pushes);
        let mut overflow = lock_queue(&self.overflow);
        overflow.push_back(task);
        self.overflow_len.fetch_add(1, Ordering::SeqCst);
        drop(overflow);
        self.overflow_cv.notify_one();
        if should_sample(&OVERFLOW_LOG_COUNT, OVERFLOW_LOG_EVERY) {
            debug!(
                "task placed on overflow queue: overflow_len={} total_queued={}",
                self.overflow_len.load(Ordering::Relaxed),
                self.total_queued.load(Ordering::Relaxed)
            );
        }
    }

    fn unpark_worker(&self, idx: usize) {
        let slot = &self.slots[idx];
        if slot.parked.swap(false, Ordering::SeqCst)
            && let Some(thread) = slot.thread.get()
        {
            thread.unpark();
        }
    }

    fn unpark_any(&self) {
        if let Some(idx) = self
            .slots
            .iter()
            .position(|slot| slot.parked.load(Ordering::SeqCst))
        {
            self.unpark_worker(idx);
        }
    }

    fn unpark_all(&self) {
        for slot in &self.slots {
            slot.parked.store(false, Ordering::SeqCst);
            if let Some(thread) = slot.thread.get() {
                thread.unpark();
            }
        }
    }

    fn pop_from(&self, idx: usize, queue: &mut VecDeque<TaskRef>) -> Option<TaskRef> {
        let task = queue.pop_front()?;
        self.slots[idx].len.fetch_sub(1, Ordering::SeqCst);
        self.total_queued.fetch_sub(1, Ordering::SeqCst);
        Some(task)
    }

    fn pop_own(&self, idx: usize) -> Option<TaskRef> {
        let slot = &self.slots[idx];
        if slot.len.load(Ordering::SeqCst) == 0 {
            return None;
        }
        let mut queue = self
            .lock_bounded(&slot.queue)
            .unwrap_or_else(|| lock_queue(&slot.queue));
        self.pop_from(idx, &mut queue)
    }

    fn pop_overflow(&self, blocking: bool) -> Option<TaskRef> {
        if self.overflow_len.load(Ordering::SeqCst) == 0 {
            return None;
        }
        let mut overflow = if blocking {
            lock_queue(&self.overflow)
        } else {
            try_lock_queue(&self.overflow)?
        };
        let task = overflow.pop_front()?;
        self.overflow_len.fetch_sub(1, Ordering::SeqCst);
        Some(task)
    }

    /// Shared queue first, then each peer once; locked queues are skipped.
    fn steal(&self, idx: usize) -> Option<TaskRef> {
        if let Some(task) = self.pop_overflow(false) {
            task.task_core().set_preferred_worker(idx);
            Counters::bump(&self.counters.steals);
            return Some(task);
        }
        let n = self.slots.len();
        for offset in 1..n {
            let victim = (idx + offset) % n;
            if self.slots[victim].len.load(Ordering::SeqCst) == 0 {
                continue;
            }
            let Some(mut queue) = try_lock_queue(&self.slots[victim].queue) else {
                continue;
            };
            if let Some(task) = self.pop_from(victim, &mut queue) {
                drop(queue);
                task.task_core().set_preferred_worker(idx);
                Counters::bump(&self.counters.steals);
                return Some(task);
            }
        }
        None
    }

    fn has_visible_work(&self, idx: usize) -> bool {
        self.slots[idx].len.load(Ordering::SeqCst) > 0
            || self.overflow_len.load(Ordering::SeqCst) > 0
            || self.total_queued.load(Ordering::SeqCst) > 0
    }

    fn run_task(&self, task: TaskRef) {
        let (outcome, ok) = execute(&task);
        Counters::bump(&self.counters.tasks_run);
        if !ok {
            Counters::bump(&self.counters.panics);
        }
        match outcome {
            RunOutcome::Idle => {}
            RunOutcome::Requeue => {
                Counters::bump(&self.counters.requeues);
                self.schedule(task);
            }
            RunOutcome::Busy => {
                self.push_overflow(task);
                thread::yield_now();
            }
        }
    }

    /// Move overflow tasks to the least loaded worker while it has room.
    /// True when a task had to go back because no worker had room.
    fn balance_overflow(&self) -> bool {
        while let Some(task) = self.pop_overflow(true) {
            let target = (0..self.slots.len())
                .min_by_key(|&idx| self.slots[idx].len.load(Ordering::Relaxed))
                .unwrap_or(0);
            match self.try_place(target, task) {
                Ok(()) => Counters::bump(&self.counters.balanced),
                Err(task) => {
                    let mut overflow = lock_queue(&self.overflow);
                    overflow.push_front(task);
                    self.overflow_len.fetch_add(1, Ordering::SeqCst);
                    drop(overflow);
                    Counters::bump(&self.counters.balance_stalls);
                    self.unpark_any();
                    return true;
                }
            }
        }
        false
    }

    fn drain_all(&self) -> Vec<TaskRef> {
        let mut drained = Vec::new();
        for slot in &self.slots {
            let mut queue = lock_queue(&slot.queue);
            drained.extend(queue.drain(..));
            slot.len.store(0, Ordering::SeqCst);
        }
        self.total_queued.store(0, Ordering::SeqCst);
        let mut overflow = lock_queue(&self.overflow);
        drained.extend(overflow.drain(..));
        self.overflow_len.store(0, Ordering::SeqCst);
        drained
    }
}

fn worker_loop(shared: Arc<SchedulerShared>, idx: usize) {
    debug!("scheduler worker {} started", idx);
    let slot = &shared.slots[idx];
    while !shared.is_shutdown() {
        if let Some(task) = shared.pop_own(idx).or_else(|| shared.steal(idx)) {
            shared.run_task(task);
            continue;
        }
        slot.parked.store(true, Ordering::SeqCst);
        if shared.has_visible_work(idx) || shared.is_shutdown() {
            slot.parked.store(false, Ordering::SeqCst);
            continue;
        }
        Counters::bump(&shared.counters.parks);
        thread::park_timeout(shared.config.idle_park);
        slot.parked.store(false, Ordering::SeqCst);
    }
    debug!("scheduler worker {} stopped", idx);
}

fn balancer_loop(shared: Arc<SchedulerShared>) {
    debug!("scheduler balancer started");
    let mut stalled = false;
    loop {
        {
            let mut overflow = lock_queue(&shared.overflow);
            // After a stall only the park interval ends the wait: new overflow
            // pushes do not free room on any worker.
            let deadline = Instant::now() + shared.config.idle_park;
            while (stalled || overflow.is_empty()) && !shared.is_shutdown() {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    break;
                }
                overflow = shared
                    .overflow_cv
                    .wait_timeout(overflow, left)
                    .unwrap_or_else(|e| e.into_inner())
                    .0;
            }
        }
        if shared.is_shutdown() {
            break;
        }
        stalled = shared.balance_overflow();
    }
    debug!("scheduler balancer stopped");
}

#[derive(Clone)]
/// Cheap handle through which tasks and stages reach their scheduler.
pub struct SchedulerHandle {
    shared: Arc<SchedulerShared>,
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("workers", &self.worker_count())
            .field("queued", &self.queued_tasks())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl SchedulerHandle {
    pub fn worker_count(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.counters.snapshot()
    }

    /// Tasks waiting in worker queues plus the overflow queue.
    pub fn queued_tasks(&self) -> usize {
        self.shared.total_queued.load(Ordering::SeqCst) + self.shared.overflow_len.load(Ordering::SeqCst)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    pub(crate) fn next_affinity(&self) -> usize {
        self.shared.next_affinity.fetch_add(1, Ordering::Relaxed) % self.shared.slots.len()
    }

    pub(crate) fn schedule(&self, task: TaskRef) {
        self.shared.schedule(task);
    }

    #[cfg(test)]
    pub(crate) fn pop_any_for_test(&self) -> Option<TaskRef> {
        (0..self.shared.slots.len())
            .find_map(|idx| self.shared.pop_own(idx))
            .or_else(|| self.shared.pop_overflow(true))
    }
}

/// Owner of the worker threads. Dropping it stops the pool.
pub struct Scheduler {
    handle: SchedulerHandle,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn start(config: SchedulerConfig) -> Result<Self> {
        let shared = Arc::new(SchedulerShared::new(config));
        let mut threads = Vec::with_capacity(shared.slots.len() + 1);
        for idx in 0..shared.slots.len() {
            let worker_shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("fedflow-worker-{idx}"))
                .spawn(move || worker_loop(worker_shared, idx))
                .with_context(|| format!("spawn scheduler worker {idx}"))?;
            let _ = shared.slots[idx].thread.set(handle.thread().clone());
            threads.push(handle);
        }
        let balancer_shared = Arc::clone(&shared);
        let balancer = thread::Builder::new()
            .name("fedflow-balancer".to_string())
            .spawn(move || balancer_loop(balancer_shared))
            .context("spawn scheduler balancer")?;
        threads.push(balancer);
        info!(
            "scheduler started: workers={} queue_capacity={} overload_factor={} overload_slack={}",
            shared.slots.len(),
            shared.config.queue_capacity,
            shared.config.overload_factor,
            shared.config.overload_slack
        );
        Ok(Self {
            handle: SchedulerHandle { shared },
            threads: Mutex::new(threads),
        })
    }

    /// Scheduler without threads; tests run queued tasks by hand.
    #[cfg(test)]
    pub(crate) fn new_stopped(config: SchedulerConfig) -> Self {
        Self {
            handle: SchedulerHandle {
                shared: Arc::new(SchedulerShared::new(config)),
            },
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn handle(&self) -> SchedulerHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.handle.stats()
    }

    /// Stop workers and drop queued tasks. Idempotent.
    pub fn shutdown(&self) {
        let shared = &self.handle.shared;
        if shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("scheduler shutting down: stats={:?}", shared.counters.snapshot());
        shared.overflow_cv.notify_all();
        shared.unpark_all();
        let threads = {
            let mut guard = self.threads.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for handle in threads {
            if handle.thread().id() == thread::current().id() {
                debug!("scheduler shutdown called from its own thread; skip self-join");
                continue;
            }
            let _ = handle.join();
        }
        // Dropped outside the queue locks.
        let drained = shared.drain_all();
        drop(drained);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
