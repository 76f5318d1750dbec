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
//! Terminal consumers for the edge of a plan.
//!
//! `ChannelReceiver` moves every signal onto an mpsc channel; `ResultCursor`
//! sits on the other end and turns the push protocol back into a pull API
//! for a result writer, granting credit in fixed-size chunks.

use std::sync::mpsc;
use std::time::{Duration, Instant};

use super::emitter::{EmitterRef, Receiver};
use super::state::Outcome;
use crate::common::error::{FlowError, FlowResult};
use crate::exec::batch::Batch;
use crate::fedflow_logging::debug;

/// One protocol signal as seen by a consumer.
#[derive(Debug)]
pub enum Signal<B> {
    Batch(B),
    Completed,
    Cancelled,
    Failed(FlowError),
}

pub struct ChannelReceiver<B: Batch> {
    name: String,
    tx: mpsc::Sender<Signal<B>>,
}

impl<B: Batch> ChannelReceiver<B> {
    pub fn new(name: impl Into<String>) -> (Self, mpsc::Receiver<Signal<B>>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                name: name.into(),
                tx,
            },
            rx,
        )
    }

    fn send(&self, signal: Signal<B>) -> FlowResult<()> {
        self.tx
            .send(signal)
            .map_err(|_| FlowError::receiver(format!("{} consumer went away", self.name)))
    }
}

impl<B: Batch> Receiver<B> for ChannelReceiver<B> {
    fn on_batch(&mut self, batch: B) -> FlowResult<()> {
        self.send(Signal::Batch(batch))
    }

    fn on_complete(&mut self) -> FlowResult<()> {
        self.send(Signal::Completed)
    }

    fn on_cancelled(&mut self) -> FlowResult<()> {
        self.send(Signal::Cancelled)
    }

    fn on_error(&mut self, cause: &FlowError) -> FlowResult<()> {
        self.send(Signal::Failed(cause.clone()))
    }

    fn receiver_name(&self) -> String {
        self.name.clone()
    }
}

/// Everything a drained stream produced.
#[derive(Debug)]
pub struct Drained<B> {
    pub batches: Vec<B>,
    pub rows: u64,
    pub outcome: Outcome,
    pub cause: Option<FlowError>,
}

/// Pull-style reader over an emitter.
pub struct ResultCursor<B: Batch> {
    emitter: EmitterRef<B>,
    rx: mpsc::Receiver<Signal<B>>,
    chunk_rows: u64,
    credit: u64,
    rows: u64,
    finished: Option<(Outcome, Option<FlowError>)>,
}

impl<B: Batch> ResultCursor<B> {
    /// Subscribe to `emitter`. Nothing is requested until the first read.
    pub fn attach(emitter: EmitterRef<B>, chunk_rows: u64) -> FlowResult<Self> {
        let (receiver, rx) = ChannelReceiver::new(format!("cursor({})", emitter.name()));
        emitter.subscribe(Box::new(receiver))?;
        Ok(Self {
            emitter,
            rx,
            chunk_rows: chunk_rows.max(1),
            credit: 0,
            rows: 0,
            finished: None,
        })
    }

    pub fn rows_read(&self) -> u64 {
        self.rows
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.finished.as_ref().map(|(o, _)| *o)
    }

    /// Next batch, or `None` once the stream terminated. A failed stream
    /// returns its cause.
    pub fn next_batch(&mut self, timeout: Duration) -> FlowResult<Option<B>> {
        if let Some((_, cause)) = &self.finished {
            return match cause {
                Some(cause) => Err(cause.clone()),
                None => Ok(None),
            };
        }
        if self.credit == 0 {
            self.emitter.request(self.chunk_rows)?;
            self.credit = self.chunk_rows;
        }
        let signal = self.rx.recv_timeout(timeout).map_err(|e| {
            FlowError::Timeout(format!(
                "waiting on {}: {e} ({})",
                self.emitter.name(),
                self.emitter.state_label()
            ))
        })?;
        match signal {
            Signal::Batch(batch) => {
                let rows = batch.rows() as u64;
                self.credit = self.credit.saturating_sub(rows);
                self.rows += rows;
                Ok(Some(batch))
            }
            Signal::Completed => self.finish(Outcome::Completed, None),
            Signal::Cancelled => self.finish(Outcome::Cancelled, None),
            Signal::Failed(cause) => self.finish(Outcome::Failed, Some(cause)),
        }
    }

    fn finish(&mut self, outcome: Outcome, cause: Option<FlowError>) -> FlowResult<Option<B>> {
        debug!(
            "cursor on {} finished {} after {} rows",
            self.emitter.name(),
            outcome.label(),
            self.rows
        );
        self.finished = Some((outcome, cause.clone()));
        match cause {
            Some(cause) => Err(cause),
            None => Ok(None),
        }
    }

    /// Read to the end. `timeout` bounds the whole drain.
    pub fn drain(mut self, timeout: Duration) -> FlowResult<Drained<B>> {
        let deadline = Instant::now() + timeout;
        let mut batches = Vec::new();
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            match self.next_batch(left) {
                Ok(Some(batch)) => batches.push(batch),
                Ok(None) => break,
                Err(e) if self.finished.is_some() => {
                    debug!("drain of {} ended with {}", self.emitter.name(), e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        let (outcome, cause) = self
            .finished
            .take()
            .unwrap_or((Outcome::Completed, None));
        Ok(Drained {
            batches,
            rows: self.rows,
            outcome,
            cause,
        })
    }

    /// Stop the stream and wait for its terminal signal.
    pub fn cancel(mut self, timeout: Duration) -> FlowResult<Outcome> {
        self.emitter.cancel();
        let deadline = Instant::now() + timeout;
        while self.finished.is_none() {
            let left = deadline.saturating_duration_since(Instant::now());
            let signal = self.rx.recv_timeout(left).map_err(|e| {
                FlowError::Timeout(format!("cancelling {}: {e}", self.emitter.name()))
            })?;
            match signal {
                Signal::Batch(_) => {}
                Signal::Completed => self.finished = Some((Outcome::Completed, None)),
                Signal::Cancelled => self.finished = Some((Outcome::Cancelled, None)),
                Signal::Failed(cause) => self.finished = Some((Outcome::Failed, Some(cause))),
            }
        }
        Ok(self.outcome().unwrap_or(Outcome::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::batch::{TermBatch, TermBatchType};
    use crate::exec::pipeline::batch_emitter::BatchEmitter;
    use crate::exec::pipeline::binding::Vars;
    use crate::exec::pipeline::emitter::{StageConfig, StageContext};
    use crate::exec::pipeline::scheduler::{Scheduler, SchedulerConfig};
    use std::sync::Arc;

    const WAIT: Duration = Duration::from_secs(5);

    fn start() -> (Scheduler, StageContext) {
        let scheduler = Scheduler::start(SchedulerConfig {
            workers: 2,
            ..SchedulerConfig::default()
        })
        .expect("start scheduler");
        let ctx = StageContext::new(scheduler.handle(), StageConfig::default());
        (scheduler, ctx)
    }

    #[test]
    fn cursor_reads_in_chunks() {
        let (_scheduler, ctx) = start();
        let stage = BatchEmitter::new(
            &ctx,
            "values",
            Vars::new(["v"]),
            Arc::new(TermBatchType::new()),
            TermBatch::sequential(1, 25),
        );
        let mut cursor = ResultCursor::<TermBatch>::attach(stage, 10).expect("attach");
        let first = cursor.next_batch(WAIT).expect("read").expect("batch");
        assert!(first.rows() <= 10);
        let drained = cursor.drain(WAIT).expect("drain");
        assert_eq!(drained.rows, 25);
        assert_eq!(drained.outcome, Outcome::Completed);
        assert!(drained.batches.iter().all(|b| b.rows() <= 10));
    }

    #[test]
    fn cursor_cancel_waits_for_terminal() {
        let (_scheduler, ctx) = start();
        let stage = BatchEmitter::new(
            &ctx,
            "values",
            Vars::new(["v"]),
            Arc::new(TermBatchType::new()),
            TermBatch::sequential(1, 100),
        );
        let mut cursor = ResultCursor::<TermBatch>::attach(stage, 10).expect("attach");
        assert!(cursor.next_batch(WAIT).expect("read").is_some());
        assert_eq!(cursor.cancel(WAIT).expect("cancel"), Outcome::Cancelled);
    }

    #[test]
    fn dropped_consumer_surfaces_as_receiver_error() {
        let (mut receiver, rx) = ChannelReceiver::<TermBatch>::new("gone");
        drop(rx);
        let err = receiver.on_complete().expect_err("closed channel");
        assert!(matches!(err, FlowError::Receiver(_)));
    }
}
