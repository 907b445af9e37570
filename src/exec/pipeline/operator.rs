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

//! Core operator traits and blocking semantics.
//!
//! Responsibilities:
//! - Defines processor/sink execution contracts and blocked-reason signaling.
//! - Used by drivers to orchestrate cooperative operator execution steps.
//!
//! Key exported interfaces:
//! - Types: `BlockedReason`, `Operator`, `ProcessorOperator`.

use std::sync::Arc;

use crate::common::status::ExecResult;
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::schedule::observer::Observable;
use crate::runtime::runtime_state::RuntimeState;

/// The execution engine uses cooperative scheduling.
///
/// Operators are driven by a [`PipelineDriver`](crate::exec::pipeline::driver::PipelineDriver)
/// which repeatedly tries to move data from upstream to downstream.
/// When a driver cannot make progress without blocking, it records a [`BlockedReason`]
/// and yields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockedReason {
    /// Upstream currently has no data available.
    InputEmpty,
    /// Downstream cannot accept more input at the moment.
    OutputFull,
    /// Finishing was requested and asynchronous work is still draining.
    PendingFinish,
}

/// Base operator contract implemented by every runtime operator instance.
pub trait Operator: Send {
    fn name(&self) -> &str;

    fn plan_node_id(&self) -> i32;

    /// Which parallel instance of the factory this operator is, in `[0, dop)`.
    fn driver_sequence(&self) -> i32;

    /// One-time setup. A second call is a contract violation.
    fn prepare(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        Ok(())
    }

    /// Called exactly once by the owning driver, from any terminal state.
    fn close(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        Ok(())
    }

    /// Abandons outstanding work without blocking. Safe in any state.
    fn set_cancelled(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        Ok(())
    }

    /// Monotonic: once true it stays true.
    fn is_finished(&self) -> bool {
        false
    }

    fn pending_finish(&self) -> bool {
        false
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        None
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        None
    }
}

/// Extended operator contract for stages with push/pull semantics.
pub trait ProcessorOperator: Operator {
    fn need_input(&self) -> bool;

    fn has_output(&self) -> bool;

    fn push_chunk(&mut self, state: &RuntimeState, chunk: Chunk) -> ExecResult<()>;

    fn pull_chunk(&mut self, state: &RuntimeState) -> ExecResult<Option<Chunk>>;

    /// No more input will arrive. Idempotent after the first call.
    fn set_finishing(&mut self, state: &RuntimeState) -> ExecResult<()>;

    /// Observable for sink-side readiness (need_input or is_finished may have changed).
    fn sink_observable(&self) -> Option<Arc<Observable>> {
        None
    }
}
