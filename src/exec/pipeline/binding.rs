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
//! Output schemas and rebind bindings.
//!
//! A `Binding` carries the values substituted into a sub-plan's free variables
//! for one execution (one outer row of a bind join). Every binding has a
//! monotonic sequence number so that a stage reached through several paths of
//! a diamond-shaped plan re-executes only once per binding.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone, PartialEq, Eq, Hash, Default)]
/// Ordered list of output variable names.
pub struct Vars(Arc<[String]>);

impl Vars {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|v| v == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }
}

impl fmt::Debug for Vars {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Vars {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, name) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "?{name}")?;
        }
        f.write_str("]")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// Values for a sub-plan's free variables, stamped with a sequence number.
pub struct Binding {
    sequence: u64,
    vars: Vars,
    values: Arc<[String]>,
}

impl Binding {
    /// `values[i]` is the lexical form of the term bound to `vars[i]`.
    pub fn new(sequence: u64, vars: Vars, values: Vec<String>) -> Self {
        assert_eq!(
            vars.len(),
            values.len(),
            "binding for {vars} has {} values",
            values.len()
        );
        Self {
            sequence,
            vars,
            values: values.into(),
        }
    }

    /// Binding with no variables.
    pub fn unbound(sequence: u64) -> Self {
        Self::new(sequence, Vars::empty(), Vec::new())
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn vars(&self) -> &Vars {
        &self.vars
    }

    pub fn get(&self, var: &str) -> Option<&str> {
        self.vars.position(var).map(|idx| self.values[idx].as_str())
    }
}

/// Issues monotonic binding sequence numbers. Sequence 0 is never issued.
#[derive(Debug, Default)]
pub struct BindingSequencer {
    last: AtomicU64,
}

impl BindingSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Last binding sequence a stage executed under.
#[derive(Debug, Default)]
pub(crate) struct RebindGuard {
    last: AtomicU64,
}

impl RebindGuard {
    /// True if `sequence` is newer than anything seen; records it.
    pub(crate) fn observe(&self, sequence: u64) -> bool {
        self.last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                (sequence > last).then_some(sequence)
            })
            .is_ok()
    }

    /// Undo a recorded sequence after the rebind was refused.
    pub(crate) fn forget(&self, sequence: u64, previous: u64) {
        let _ = self.last.compare_exchange(
            sequence,
            previous,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn last(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }
}
