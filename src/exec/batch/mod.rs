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
//! Row batch contract consumed by the streaming runtime.
//!
//! Responsibilities:
//! - Defines the opaque `Batch` payload (row/column counts, copy, append, slice).
//! - Defines `BatchType`, the factory/pool a stage uses to create and recycle batches.
//! - Ships `TermBatch`, a row-major batch of interned term ids with a bounded buffer pool.
//!
//! Key exported interfaces:
//! - Traits: `Batch`, `BatchType`.
//! - Types: `TermBatch`, `TermBatchType`.
//!
//! Row contents are never interpreted by the runtime. Ownership moves with the
//! value: a batch handed to `recycle` is consumed, so no reference to it can
//! outlive the recycling.

use std::fmt;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque collection of result rows with a fixed column count.
pub trait Batch: Send + 'static {
    fn rows(&self) -> usize;

    fn cols(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.rows() == 0
    }

    /// Deep copy, used when one batch is evidence for several receivers.
    fn copy(&self) -> Self
    where
        Self: Sized;

    /// Append all rows of `other`. Column counts must match.
    fn append(&mut self, other: &Self)
    where
        Self: Sized;

    /// Copy of rows `[offset, offset + len)`.
    fn slice(&self, offset: usize, len: usize) -> Self
    where
        Self: Sized;
}

/// Factory and pool for one batch representation.
pub trait BatchType<B: Batch>: Send + Sync {
    fn name(&self) -> &str;

    fn create(&self, cols: usize, row_capacity: usize) -> B;

    /// Return a batch to the pool. The batch is consumed.
    fn recycle(&self, batch: B);
}

/// Split `batch` so that the first part holds at most `limit` rows.
///
/// Returns the head and, if rows remain, the tail.
pub fn split_front<B: Batch>(batch: B, limit: usize) -> (B, Option<B>) {
    let rows = batch.rows();
    if rows <= limit {
        return (batch, None);
    }
    let head = batch.slice(0, limit);
    let tail = batch.slice(limit, rows - limit);
    (head, Some(tail))
}

/// Row-major batch of interned RDF term ids.
#[derive(Clone, PartialEq, Eq)]
pub struct TermBatch {
    cols: usize,
    rows: usize,
    terms: Vec<u64>,
}

impl TermBatch {
    pub fn new(cols: usize) -> Self {
        Self::with_capacity(cols, 0)
    }

    pub fn with_capacity(cols: usize, row_capacity: usize) -> Self {
        Self {
            cols,
            rows: 0,
            terms: Vec::with_capacity(cols * row_capacity),
        }
    }

    fn from_buffer(cols: usize, mut terms: Vec<u64>) -> Self {
        terms.clear();
        Self {
            cols,
            rows: 0,
            terms,
        }
    }

    /// Build a batch from explicit rows. Every row must have `cols` terms.
    pub fn from_rows<R: AsRef<[u64]>>(cols: usize, rows: &[R]) -> Self {
        let mut batch = Self::with_capacity(cols, rows.len());
        for row in rows {
            batch.push_row(row.as_ref());
        }
        batch
    }

    /// Batch of `rows` rows where row `r`, column `c` holds `r * cols + c`.
    pub fn sequential(cols: usize, rows: usize) -> Self {
        let mut batch = Self::with_capacity(cols, rows);
        for r in 0..rows {
            let row: Vec<u64> = (0..cols).map(|c| (r * cols + c) as u64).collect();
            batch.push_row(&row);
        }
        batch
    }

    pub fn push_row(&mut self, row: &[u64]) {
        assert_eq!(
            row.len(),
            self.cols,
            "row width {} does not match batch columns {}",
            row.len(),
            self.cols
        );
        self.terms.extend_from_slice(row);
        self.rows += 1;
    }

    pub fn row(&self, idx: usize) -> Option<&[u64]> {
        if idx >= self.rows {
            return None;
        }
        let start = idx * self.cols;
        Some(&self.terms[start..start + self.cols])
    }

    pub fn iter_rows(&self) -> impl Iterator<Item = &[u64]> + '_ {
        (0..self.rows).filter_map(move |idx| self.row(idx))
    }

    fn into_buffer(self) -> Vec<u64> {
        self.terms
    }
}

impl fmt::Debug for TermBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TermBatch")
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .finish()
    }
}

impl Batch for TermBatch {
    fn rows(&self) -> usize {
        self.rows
    }

    fn cols(&self) -> usize {
        self.cols
    }

    fn copy(&self) -> Self {
        self.clone()
    }

    fn append(&mut self, other: &Self) {
        assert_eq!(
            self.cols, other.cols,
            "cannot append a {}-column batch to a {}-column batch",
            other.cols, self.cols
        );
        self.terms.extend_from_slice(&other.terms);
        self.rows += other.rows;
    }

    fn slice(&self, offset: usize, len: usize) -> Self {
        let end = (offset + len).min(self.rows);
        let offset = offset.min(end);
        Self {
            cols: self.cols,
            rows: end - offset,
            terms: self.terms[offset * self.cols..end * self.cols].to_vec(),
        }
    }
}

const DEFAULT_MAX_POOLED: usize = 64;

/// Pooled factory for `TermBatch`. Recycled buffers are reused by `create`.
pub struct TermBatchType {
    free: Mutex<Vec<Vec<u64>>>,
    max_pooled: usize,
    created: AtomicU64,
    reused: AtomicU64,
}

impl TermBatchType {
    pub fn new() -> Self {
        Self::with_pool_limit(DEFAULT_MAX_POOLED)
    }

    pub fn with_pool_limit(max_pooled: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_pooled,
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    pub fn pooled(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn reused(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }
}

impl Default for TermBatchType {
    fn default() -> Self {
        Self::new()
    }
}

impl BatchType<TermBatch> for TermBatchType {
    fn name(&self) -> &str {
        "TermBatch"
    }

    fn create(&self, cols: usize, row_capacity: usize) -> TermBatch {
        let buffer = self.free.lock().ok().and_then(|mut free| free.pop());
        match buffer {
            Some(mut terms) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                terms.reserve(cols * row_capacity);
                TermBatch::from_buffer(cols, terms)
            }
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                TermBatch::with_capacity(cols, row_capacity)
            }
        }
    }

    fn recycle(&self, batch: TermBatch) {
        let mut terms = batch.into_buffer();
        terms.clear();
        if let Ok(mut free) = self.free.lock()
            && free.len() < self.max_pooled
        {
            free.push(terms);
        }
    }
}
