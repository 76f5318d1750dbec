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
//! Streaming pipeline runtime.
//!
//! Responsibilities:
//! - Schedules non-blocking stage tasks on a work-stealing worker pool.
//! - Implements the demand-driven emitter/receiver protocol and its stage variants.
//! - Exposes plan-edge consumers and graph diagnostics.
//!
//! Current limitations:
//! - Stage code must not block; producers that wait on I/O push through
//!   `callback_emitter::ProducerHandle` from their own threads.

pub mod batch_emitter;
pub mod binding;
pub mod callback_emitter;
pub mod collector;
pub mod diagnostics;
pub mod emitter;
pub mod fan_in;
pub mod fan_out;
pub mod forward_emitter;
pub mod scheduler;
pub mod state;
pub mod task;

pub use batch_emitter::BatchEmitter;
pub use binding::{Binding, BindingSequencer, Vars};
pub use callback_emitter::{CallbackEmitter, CallbackProducer, ProducerHandle};
pub use collector::{ChannelReceiver, Drained, ResultCursor, Signal};
pub use emitter::{Emitter, EmitterRef, Receiver, StageConfig, StageContext};
pub use fan_in::FanIn;
pub use fan_out::{FanOutOutput, fan_out};
pub use forward_emitter::ForwardEmitter;
pub use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle, SchedulerStats};
pub use state::{Outcome, StageState};
