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
//! Lock-free lifecycle state shared by every stage.
//!
//! Responsibilities:
//! - Encodes the lifecycle group, terminal outcome, a non-reentrant lock bit,
//!   a release guard and stage-private flags in one atomic word.
//! - Provides "first observer wins" transitions so concurrent terminations
//!   deliver exactly once.
//!
//! Key exported interfaces:
//! - Types: `Outcome`, `StageState`, `Flag`, `StateMachine`, `StateGuard`.
//! - Traits: `Stateful`.
//!
//! Lifecycle (groups only move forward; `rebind` is the one reset):
//! ```text
//!   Init ─► Live ─► CancelRequested ─► PendingTerm(o) ─► Term(o) ─► TermDelivered(o)
//!     │       └──────────────┴──────────────┴──────────────┘               │
//!     └──────────────────────── reset_to_init (rebind) ◄─────────────────┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

const GROUP_MASK: u64 = 0b111;
const OUTCOME_SHIFT: u32 = 3;
const OUTCOME_MASK: u64 = 0b11 << OUTCOME_SHIFT;
const STATE_MASK: u64 = GROUP_MASK | OUTCOME_MASK;
const LOCK_BIT: u64 = 1 << 5;
const RELEASED_BIT: u64 = 1 << 6;
const DELAY_SHIFT: u32 = 8;
const DELAY_ONE: u64 = 1 << DELAY_SHIFT;
const DELAY_MASK: u64 = 0xFFFF << DELAY_SHIFT;
const FLAG_SHIFT: u32 = 32;
const FLAG_MASK: u64 = 0xFFFF_FFFF << FLAG_SHIFT;

pub(crate) const DEFAULT_LOCK_SPINS: u32 = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Terminal outcome carried by the terminal groups.
pub enum Outcome {
    Completed,
    Cancelled,
    Failed,
}

impl Outcome {
    fn bits(self) -> u64 {
        let v: u64 = match self {
            Outcome::Completed => 1,
            Outcome::Cancelled => 2,
            Outcome::Failed => 3,
        };
        v << OUTCOME_SHIFT
    }

    fn from_bits(word: u64) -> Option<Self> {
        match (word & OUTCOME_MASK) >> OUTCOME_SHIFT {
            1 => Some(Outcome::Completed),
            2 => Some(Outcome::Cancelled),
            3 => Some(Outcome::Failed),
            _ => None,
        }
    }

    /// Combine two outcomes with precedence failed > cancelled > completed.
    pub fn merge(self, other: Outcome) -> Outcome {
        fn rank(o: Outcome) -> u8 {
            match o {
                Outcome::Completed => 0,
                Outcome::Cancelled => 1,
                Outcome::Failed => 2,
            }
        }
        if rank(other) > rank(self) { other } else { self }
    }

    pub fn label(self) -> &'static str {
        match self {
            Outcome::Completed => "COMPLETED",
            Outcome::Cancelled => "CANCELLED",
            Outcome::Failed => "FAILED",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
/// Lifecycle state of one stage.
pub enum StageState {
    /// Created or rebound, never requested.
    Init,
    /// Requested at least once and producing.
    Live,
    /// `cancel()` observed; the stage still has to wind down.
    CancelRequested,
    /// Outcome known, buffered batches still have to be delivered.
    PendingTerm(Outcome),
    /// Ready to deliver the terminal notification.
    Term(Outcome),
    /// Terminal notification delivered to every receiver.
    TermDelivered(Outcome),
}

impl StageState {
    fn group(self) -> u64 {
        match self {
            StageState::Init => 0,
            StageState::Live => 1,
            StageState::CancelRequested => 2,
            StageState::PendingTerm(_) => 3,
            StageState::Term(_) => 4,
            StageState::TermDelivered(_) => 5,
        }
    }

    fn bits(self) -> u64 {
        let outcome = self.outcome().map(Outcome::bits).unwrap_or(0);
        self.group() | outcome
    }

    fn from_bits(word: u64) -> Self {
        let outcome = Outcome::from_bits(word).unwrap_or(Outcome::Completed);
        match word & GROUP_MASK {
            0 => StageState::Init,
            1 => StageState::Live,
            2 => StageState::CancelRequested,
            3 => StageState::PendingTerm(outcome),
            4 => StageState::Term(outcome),
            _ => StageState::TermDelivered(outcome),
        }
    }

    pub fn outcome(self) -> Option<Outcome> {
        match self {
            StageState::PendingTerm(o) | StageState::Term(o) | StageState::TermDelivered(o) => {
                Some(o)
            }
            _ => None,
        }
    }

    /// True once the outcome is decided (pending or delivered).
    pub fn is_terminal(self) -> bool {
        self.group() >= StageState::PendingTerm(Outcome::Completed).group()
    }

    pub fn is_delivered(self) -> bool {
        matches!(self, StageState::TermDelivered(_))
    }

    /// Valid successor check: groups strictly move forward.
    pub fn can_move_to(self, next: StageState) -> bool {
        next.group() > self.group()
    }

    pub fn label(self) -> String {
        match self {
            StageState::Init => "INIT".to_string(),
            StageState::Live => "LIVE".to_string(),
            StageState::CancelRequested => "CANCEL_REQUESTED".to_string(),
            StageState::PendingTerm(o) => format!("PENDING_TERM({})", o.label()),
            StageState::Term(o) => format!("TERM({})", o.label()),
            StageState::TermDelivered(o) => format!("TERM_DELIVERED({})", o.label()),
        }
    }
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
/// Named single-bit flag owned by a stage type.
pub struct Flag {
    bit: u8,
    name: &'static str,
}

impl Flag {
    pub const fn new(bit: u8, name: &'static str) -> Self {
        assert!(bit < 32, "stage flags live in the upper 32 bits");
        Self { bit, name }
    }

    fn mask(self) -> u64 {
        1_u64 << (FLAG_SHIFT + self.bit as u32)
    }

    pub fn name(self) -> &'static str {
        self.name
    }
}

/// One atomic word holding a stage lifecycle.
pub struct StateMachine {
    word: AtomicU64,
    flags: &'static [Flag],
    lock_spins: u32,
}

impl StateMachine {
    pub fn new(flags: &'static [Flag]) -> Self {
        Self::with_lock_spins(flags, DEFAULT_LOCK_SPINS)
    }

    pub fn with_lock_spins(flags: &'static [Flag], lock_spins: u32) -> Self {
        Self {
            word: AtomicU64::new(StageState::Init.bits()),
            flags,
            lock_spins: lock_spins.max(1),
        }
    }

    pub fn load(&self) -> StageState {
        StageState::from_bits(self.word.load(Ordering::Acquire))
    }

    pub fn is_released(&self) -> bool {
        self.word.load(Ordering::Acquire) & RELEASED_BIT != 0
    }

    pub fn pending_release_delays(&self) -> u64 {
        (self.word.load(Ordering::Acquire) & DELAY_MASK) >> DELAY_SHIFT
    }

    fn wait_unlocked(&self, mut spins: u32) -> u32 {
        spins += 1;
        if spins >= self.lock_spins {
            thread::yield_now();
            0
        } else {
            std::hint::spin_loop();
            spins
        }
    }

    /// CAS loop over the word. `f` returns the new word or `None` to give up.
    fn update<F>(&self, respect_lock: bool, mut f: F) -> Result<u64, u64>
    where
        F: FnMut(u64) -> Option<u64>,
    {
        let mut spins = 0;
        let mut current = self.word.load(Ordering::Acquire);
        loop {
            if respect_lock && current & LOCK_BIT != 0 {
                spins = self.wait_unlocked(spins);
                current = self.word.load(Ordering::Acquire);
                continue;
            }
            let Some(next) = f(current) else {
                return Err(current);
            };
            match self.word.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(prev) => return Ok(prev),
                Err(actual) => current = actual,
            }
        }
    }

    /// Swap `expected` for `next` iff the current state equals `expected` and
    /// `next` is a valid successor. Waits while the lock bit is held.
    pub fn move_state(&self, expected: StageState, next: StageState) -> bool {
        if !expected.can_move_to(next) {
            return false;
        }
        self.update(true, |word| {
            (StageState::from_bits(word) == expected).then(|| (word & !STATE_MASK) | next.bits())
        })
        .is_ok()
    }

    /// Move to `next` from whatever state precedes it. Returns the previous
    /// state when this caller won the transition.
    pub fn advance(&self, next: StageState) -> Option<StageState> {
        self.update(true, |word| {
            StageState::from_bits(word)
                .can_move_to(next)
                .then(|| (word & !STATE_MASK) | next.bits())
        })
        .ok()
        .map(StageState::from_bits)
    }

    /// `Term(o)` -> `TermDelivered(o)`, exactly once.
    pub fn mark_delivered(&self) -> bool {
        self.update(true, |word| match StageState::from_bits(word) {
            StageState::Term(o) => {
                Some((word & !STATE_MASK) | StageState::TermDelivered(o).bits())
            }
            _ => None,
        })
        .is_ok()
    }

    /// Sets the released bit iff delivered, not yet released and no caller
    /// holds a release delay. True means the caller must run the release.
    pub fn try_release(&self) -> bool {
        self.update(false, |word| {
            let delivered = StageState::from_bits(word).is_delivered();
            let free = word & DELAY_MASK == 0 && word & RELEASED_BIT == 0;
            (delivered && free).then_some(word | RELEASED_BIT)
        })
        .is_ok()
    }

    /// Keep the stage alive while an in-flight call runs. False if the stage
    /// was already released.
    pub fn delay_release(&self) -> bool {
        self.update(false, |word| {
            if word & RELEASED_BIT != 0 || word & DELAY_MASK == DELAY_MASK {
                return None;
            }
            Some(word + DELAY_ONE)
        })
        .is_ok()
    }

    /// Drop one delay. True means the caller must run the release.
    pub fn allow_release(&self) -> bool {
        let dropped = self
            .update(false, |word| {
                (word & DELAY_MASK != 0).then(|| word - DELAY_ONE)
            })
            .is_ok();
        dropped && self.try_release()
    }

    /// Acquire the non-reentrant state lock. Bounded spin, then yield.
    pub fn lock(&self) -> StateGuard<'_> {
        let mut spins = 0;
        loop {
            let current = self.word.load(Ordering::Acquire);
            if current & LOCK_BIT == 0
                && self
                    .word
                    .compare_exchange_weak(
                        current,
                        current | LOCK_BIT,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
            {
                return StateGuard { machine: self };
            }
            spins = self.wait_unlocked(spins);
        }
    }

    pub fn has_flag(&self, flag: Flag) -> bool {
        self.word.load(Ordering::Acquire) & flag.mask() != 0
    }

    /// Set `flag`; true only for the caller that flipped it.
    pub fn try_set_flag(&self, flag: Flag) -> bool {
        let prev = self.word.fetch_or(flag.mask(), Ordering::AcqRel);
        prev & flag.mask() == 0
    }

    /// Clear `flag`; true only for the caller that flipped it.
    pub fn clear_flag(&self, flag: Flag) -> bool {
        let prev = self.word.fetch_and(!flag.mask(), Ordering::AcqRel);
        prev & flag.mask() != 0
    }

    /// Human-readable rendering, e.g. `LIVE|STARTED,PAUSED`.
    pub fn render(&self) -> String {
        let word = self.word.load(Ordering::Acquire);
        let mut out = StageState::from_bits(word).label();
        let names: Vec<&str> = self
            .flags
            .iter()
            .filter(|f| word & f.mask() != 0)
            .map(|f| f.name())
            .collect();
        if !names.is_empty() {
            out.push('|');
            out.push_str(&names.join(","));
        }
        if word & LOCK_BIT != 0 {
            out.push_str("|LOCKED");
        }
        if word & RELEASED_BIT != 0 {
            out.push_str("|RELEASED");
        }
        let delays = (word & DELAY_MASK) >> DELAY_SHIFT;
        if delays > 0 {
            out.push_str(&format!("|delay_release={delays}"));
        }
        out
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

#[must_use]
/// Scoped holder of the state lock; unlocks on drop.
pub struct StateGuard<'a> {
    machine: &'a StateMachine,
}

impl StateGuard<'_> {
    pub fn state(&self) -> StageState {
        self.machine.load()
    }

    /// Rebind reset: `Init` or unreleased `TermDelivered` back to `Init`,
    /// clearing all stage flags. Returns the refused state otherwise.
    pub fn reset_to_init(&self) -> Result<(), StageState> {
        self.machine
            .update(false, |word| {
                let state = StageState::from_bits(word);
                let resettable = match state {
                    StageState::Init => true,
                    StageState::TermDelivered(_) => word & RELEASED_BIT == 0,
                    _ => false,
                };
                resettable.then(|| (word & !(STATE_MASK | FLAG_MASK)) | StageState::Init.bits())
            })
            .map(|_| ())
            .map_err(StageState::from_bits)
    }

    /// Transition while holding the lock (plain `move_state` would wait on us).
    pub fn advance(&self, next: StageState) -> Option<StageState> {
        self.machine
            .update(false, |word| {
                StageState::from_bits(word)
                    .can_move_to(next)
                    .then(|| (word & !STATE_MASK) | next.bits())
            })
            .ok()
            .map(StageState::from_bits)
    }
}

impl Drop for StateGuard<'_> {
    fn drop(&mut self) {
        self.machine.word.fetch_and(!LOCK_BIT, Ordering::Release);
    }
}

/// Implemented by every stage owning a `StateMachine`.
pub trait Stateful {
    fn state_machine(&self) -> &StateMachine;

    /// Free stage resources. Runs at most once per stage instance.
    fn on_release(&self);

    /// `Term` -> `TermDelivered` and release when nobody delays it.
    fn finish_delivery(&self) -> bool {
        let sm = self.state_machine();
        if !sm.mark_delivered() {
            return false;
        }
        if sm.try_release() {
            self.on_release();
        }
        true
    }

    /// Counterpart of `StateMachine::delay_release` that runs the release hook.
    fn drop_release_delay(&self) {
        if self.state_machine().allow_release() {
            self.on_release();
        }
    }
}
