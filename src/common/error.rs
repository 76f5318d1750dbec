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
//! Error type shared by the streaming runtime.
//!
//! Protocol-usage errors (subscribe after start, rebind of a released
//! stage, ...) are returned synchronously to the caller and indicate a
//! plan-construction bug. Producer and receiver failures travel as the
//! terminal cause of a stage and are delivered to every subscriber.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowError {
    /// `subscribe` after the emitter left its initial state.
    RegisterAfterStart,
    /// `request` on a callback-driven stage that never had a producer attached.
    NoProducer,
    /// A second, incompatible producer or upstream registration.
    DoubleRegistration,
    /// `rebind` on a stage whose resources were already released.
    RebindReleased,
    /// `rebind` while the stage is still producing.
    RebindNotTerminated { state: String },
    /// `request(0)`.
    InvalidRequest,
    /// Failure reported by a producer.
    Producer(String),
    /// Failure returned by a receiver callback.
    Receiver(String),
    /// Panic caught while running stage code.
    Panic(String),
    /// An upstream's output variables differ from the consuming stage's.
    VarsMismatch {
        stage: String,
        expected: String,
        found: String,
    },
    /// A consumer gave up waiting for the next signal.
    Timeout(String),
}

impl FlowError {
    pub fn producer(msg: impl Into<String>) -> Self {
        Self::Producer(msg.into())
    }

    pub fn receiver(msg: impl Into<String>) -> Self {
        Self::Receiver(msg.into())
    }

    /// True for errors caused by misuse of the protocol rather than by data.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::RegisterAfterStart
                | Self::NoProducer
                | Self::DoubleRegistration
                | Self::RebindReleased
                | Self::RebindNotTerminated { .. }
                | Self::InvalidRequest
                | Self::VarsMismatch { .. }
        )
    }
}

impl fmt::Display for FlowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RegisterAfterStart => write!(f, "receiver registered after emitter start"),
            Self::NoProducer => write!(f, "request on a stage without producer"),
            Self::DoubleRegistration => write!(f, "incompatible double registration"),
            Self::RebindReleased => write!(f, "rebind of a released stage"),
            Self::RebindNotTerminated { state } => {
                write!(f, "rebind of a stage that has not terminated: state={state}")
            }
            Self::InvalidRequest => write!(f, "request must ask for at least one row"),
            Self::Producer(msg) => write!(f, "producer failed: {msg}"),
            Self::Receiver(msg) => write!(f, "receiver failed: {msg}"),
            Self::Panic(msg) => write!(f, "panic in stage execution: {msg}"),
            Self::Timeout(msg) => write!(f, "timed out: {msg}"),
            Self::VarsMismatch {
                stage,
                expected,
                found,
            } => write!(f, "stage {stage} expects vars {expected}, upstream has {found}"),
        }
    }
}

impl std::error::Error for FlowError {}

pub type FlowResult<T> = Result<T, FlowError>;

/// Render a caught panic payload the way the executor logs it.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_are_classified() {
        assert!(FlowError::RegisterAfterStart.is_protocol_error());
        assert!(
            FlowError::RebindNotTerminated {
                state: "LIVE".to_string()
            }
            .is_protocol_error()
        );
        assert!(!FlowError::producer("endpoint down").is_protocol_error());
    }

    #[test]
    fn display_carries_cause() {
        let err = FlowError::producer("http 503");
        assert_eq!(err.to_string(), "producer failed: http 503");
    }

    #[test]
    fn panic_message_handles_both_string_kinds() {
        let a: Box<dyn std::any::Any + Send> = Box::new("static");
        let b: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        let c: Box<dyn std::any::Any + Send> = Box::new(7_u32);
        assert_eq!(panic_message(a.as_ref()), "static");
        assert_eq!(panic_message(b.as_ref()), "owned");
        assert_eq!(panic_message(c.as_ref()), "unknown panic payload");
    }
}
