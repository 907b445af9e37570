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

//! Table sink operator and its factory.
//!
//! Responsibilities:
//! - Forwards every pushed chunk to the shared `TableSink` with at most one send in flight
//!   per instance, so per-instance order is preserved.
//! - Expresses backpressure through `need_input` and draining through `pending_finish`.
//! - Arrives at the shared counter on `close`; the last instance finalizes the sink.
//!
//! Key exported interfaces:
//! - Types: `TableSinkOperator`, `TableSinkOperatorFactory`.
//!
//! Instance lifecycle:
//! ```text
//! Created ─prepare─► Prepared ─push─► Running ─set_finishing─► Finishing
//!    │                  │               │                         │
//!    └──────────────────┴──set_cancelled┴─────────────────────────┴──► Cancelled
//! ```
//! `Running` with a send in flight is the backpressured state. `Finishing` and `Cancelled`
//! become finished once the outstanding send (if any) has completed. A cancelled fragment
//! reads as `Cancelled` in every poll before `set_cancelled` arrives.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use super::table_sink_shared::{SinkFinalization, TableSinkSharedState};
use crate::common::status::{ExecError, ExecResult};
use crate::connector::sink::{SendState, TableSink};
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::fragment_context::FragmentContext;
use crate::exec::pipeline::operator::{Operator, ProcessorOperator};
use crate::exec::pipeline::operator_factory::OperatorFactory;
use crate::exec::pipeline::schedule::observer::Observable;
use crate::novasink_logging::{debug, warn};
use crate::runtime::runtime_state::RuntimeState;

/// Plan node id given to the table sink, which has no plan node of its own. Same value the
/// backend uses for its pseudo sink node.
pub const PSEUDO_PLAN_NODE_ID_FOR_TABLE_SINK: i32 = -99;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum InstanceState {
    Created,
    Prepared,
    Running,
    Finishing,
    Cancelled,
}

pub struct TableSinkOperator {
    name: String,
    plan_node_id: i32,
    driver_sequence: i32,
    shared: Arc<TableSinkSharedState>,
    state: InstanceState,
    open_observed: bool,
    send_cancel_requested: AtomicBool,
    closed: bool,
    sent_chunks: usize,
    loaded_rows: i64,
    loaded_bytes: i64,
}

impl TableSinkOperator {
    fn new(
        name: String,
        plan_node_id: i32,
        driver_sequence: i32,
        shared: Arc<TableSinkSharedState>,
    ) -> Self {
        Self {
            name,
            plan_node_id,
            driver_sequence,
            shared,
            state: InstanceState::Created,
            open_observed: false,
            send_cancel_requested: AtomicBool::new(false),
            closed: false,
            sent_chunks: 0,
            loaded_rows: 0,
            loaded_bytes: 0,
        }
    }

    fn sink(&self) -> &Arc<dyn TableSink> {
        self.shared.sink()
    }

    fn fragment_ctx(&self) -> &Arc<FragmentContext> {
        self.shared.fragment_ctx()
    }

    fn send_state(&self) -> SendState {
        self.sink().poll_send(self.driver_sequence)
    }

    fn has_send_in_flight(&self) -> bool {
        !self.send_state().is_send_complete()
    }

    pub fn sent_chunks(&self) -> usize {
        self.sent_chunks
    }

    fn fail(&self, err: ExecError) -> ExecError {
        self.shared.record_error(err.clone());
        err
    }

    fn forwarding_error(&self, err: impl std::fmt::Display) -> ExecError {
        ExecError::Forwarding(format!(
            "{} sender {} failed: {err}",
            self.name, self.driver_sequence
        ))
    }

    fn ensure_open(&mut self, state: &RuntimeState) -> ExecResult<()> {
        if self.open_observed {
            return Ok(());
        }
        self.shared.ensure_open(state).map_err(|e| self.fail(e))?;
        self.open_observed = true;
        Ok(())
    }

    fn cancel_local(&mut self) {
        if self.state == InstanceState::Cancelled {
            return;
        }
        self.state = InstanceState::Cancelled;
        self.shared.mark_cancelled();
        self.request_send_cancel();
        debug!(
            target: "novasink::table_sink",
            sink = %self.name,
            driver_sequence = self.driver_sequence,
            sent_chunks = self.sent_chunks,
            "table sink instance cancelled"
        );
    }

    /// Cancels the outstanding send at most once per instance.
    fn request_send_cancel(&self) {
        if self.has_send_in_flight() && !self.send_cancel_requested.swap(true, Ordering::AcqRel)
        {
            self.sink().cancel_send(self.driver_sequence);
        }
    }

    /// True once the fragment is cancelled. Polls take `&self`, so the local state catches
    /// up in `set_cancelled`/`close`; the shared flag and the send cancel happen here.
    fn observe_fragment_cancel(&self) -> bool {
        if !self.fragment_ctx().is_cancelled() {
            return false;
        }
        self.shared.mark_cancelled();
        self.request_send_cancel();
        true
    }

    fn is_draining_or_cancelled(&self) -> bool {
        matches!(
            self.state,
            InstanceState::Finishing | InstanceState::Cancelled
        ) || self.observe_fragment_cancel()
    }
}

impl Operator for TableSinkOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn plan_node_id(&self) -> i32 {
        self.plan_node_id
    }

    fn driver_sequence(&self) -> i32 {
        self.driver_sequence
    }

    fn prepare(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        if self.state != InstanceState::Created {
            return Err(ExecError::Internal(format!(
                "{} instance {} prepared twice",
                self.name, self.driver_sequence
            )));
        }
        if !self.shared.is_prepared() {
            return Err(ExecError::Internal(format!(
                "{} instance {} prepared before its factory",
                self.name, self.driver_sequence
            )));
        }
        if let Some(err) = self.shared.open_error() {
            return Err(err);
        }
        self.state = InstanceState::Prepared;
        Ok(())
    }

    fn set_cancelled(&mut self, _state: &RuntimeState) -> ExecResult<()> {
        self.cancel_local();
        Ok(())
    }

    fn is_finished(&self) -> bool {
        self.is_draining_or_cancelled() && !self.has_send_in_flight()
    }

    fn pending_finish(&self) -> bool {
        self.is_draining_or_cancelled() && self.has_send_in_flight()
    }

    fn close(&mut self, state: &RuntimeState) -> ExecResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let mut own_result = Ok(());
        match self.state {
            InstanceState::Finishing => match self.send_state() {
                SendState::Failed(e) => {
                    own_result = Err(self.fail(self.forwarding_error(e)));
                }
                SendState::InFlight => {
                    self.cancel_local();
                }
                SendState::Idle => {
                    state.add_sink_load_counters(self.loaded_rows, self.loaded_bytes);
                }
            },
            InstanceState::Cancelled => {}
            InstanceState::Created | InstanceState::Prepared | InstanceState::Running => {
                // Closed without finishing: never let the load commit.
                self.cancel_local();
            }
        }

        let is_last = self.shared.arrive_and_is_last();
        debug!(
            target: "novasink::table_sink",
            sink = %self.name,
            driver_sequence = self.driver_sequence,
            state = ?self.state,
            sent_chunks = self.sent_chunks,
            loaded_rows = self.loaded_rows,
            is_last,
            "table sink instance closed"
        );
        if !is_last {
            return own_result;
        }
        match self.shared.finalize(state) {
            Ok(SinkFinalization::Committed) | Ok(SinkFinalization::Aborted(_)) => own_result,
            Err(err) => own_result.and(Err(err)),
        }
    }

    fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
        Some(self)
    }

    fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
        Some(self)
    }
}

impl ProcessorOperator for TableSinkOperator {
    fn need_input(&self) -> bool {
        matches!(
            self.state,
            InstanceState::Prepared | InstanceState::Running
        ) && !self.observe_fragment_cancel()
            && !self.has_send_in_flight()
    }

    fn has_output(&self) -> bool {
        false
    }

    fn push_chunk(&mut self, state: &RuntimeState, chunk: Chunk) -> ExecResult<()> {
        match self.state {
            InstanceState::Created => {
                return Err(ExecError::Internal(format!(
                    "{} instance {} received a chunk before prepare",
                    self.name, self.driver_sequence
                )));
            }
            InstanceState::Finishing => {
                return Err(ExecError::Internal(format!(
                    "{} instance {} received a chunk after set_finishing",
                    self.name, self.driver_sequence
                )));
            }
            InstanceState::Cancelled => return Ok(()),
            InstanceState::Prepared | InstanceState::Running => {}
        }
        if self.fragment_ctx().is_cancelled() {
            self.cancel_local();
            return Ok(());
        }
        if chunk.is_empty() {
            return Ok(());
        }
        self.ensure_open(state)?;
        self.state = InstanceState::Running;

        match self.send_state() {
            SendState::InFlight => {
                return Err(ExecError::Internal(format!(
                    "{} instance {} pushed while a send is in flight",
                    self.name, self.driver_sequence
                )));
            }
            SendState::Failed(e) => {
                return Err(self.fail(self.forwarding_error(e)));
            }
            SendState::Idle => {}
        }

        let rows = chunk.len() as i64;
        let bytes = chunk.logical_bytes() as i64;
        if let Err(e) = self.sink().send(self.driver_sequence, chunk) {
            warn!(
                target: "novasink::table_sink",
                sink = %self.name,
                driver_sequence = self.driver_sequence,
                error = %e,
                "table sink send rejected"
            );
            return Err(self.fail(self.forwarding_error(e)));
        }
        self.sent_chunks += 1;
        self.loaded_rows = self.loaded_rows.saturating_add(rows);
        self.loaded_bytes = self.loaded_bytes.saturating_add(bytes);
        Ok(())
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> ExecResult<Option<Chunk>> {
        Err(ExecError::Internal(format!(
            "{} does not produce output",
            self.name
        )))
    }

    fn set_finishing(&mut self, state: &RuntimeState) -> ExecResult<()> {
        match self.state {
            InstanceState::Created => {
                return Err(ExecError::Internal(format!(
                    "{} instance {} set_finishing before prepare",
                    self.name, self.driver_sequence
                )));
            }
            InstanceState::Finishing | InstanceState::Cancelled => return Ok(()),
            InstanceState::Prepared | InstanceState::Running => {}
        }
        if self.fragment_ctx().is_cancelled() {
            self.cancel_local();
            return Ok(());
        }
        // Input may have been empty; the sink is still opened.
        self.ensure_open(state)?;
        self.state = InstanceState::Finishing;
        if let Err(e) = self.sink().finish_sender(self.driver_sequence) {
            return Err(self.fail(self.forwarding_error(e)));
        }
        debug!(
            target: "novasink::table_sink",
            sink = %self.name,
            driver_sequence = self.driver_sequence,
            sent_chunks = self.sent_chunks,
            draining = self.has_send_in_flight(),
            "table sink instance finishing"
        );
        Ok(())
    }

    fn sink_observable(&self) -> Option<Arc<Observable>> {
        self.sink().observable()
    }
}

/// Creates one `TableSinkOperator` per driver and owns the shared sink.
pub struct TableSinkOperatorFactory {
    name: String,
    plan_node_id: i32,
    shared: Arc<TableSinkSharedState>,
    closed: AtomicBool,
}

impl TableSinkOperatorFactory {
    pub fn new(
        plan_node_id: i32,
        sink: Box<dyn TableSink>,
        fragment_ctx: Arc<FragmentContext>,
    ) -> Self {
        let name = format!("TABLE_SINK ({})", sink.name());
        Self {
            name,
            plan_node_id,
            shared: Arc::new(TableSinkSharedState::new(Arc::from(sink), fragment_ctx)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn shared_state(&self) -> &Arc<TableSinkSharedState> {
        &self.shared
    }
}

impl OperatorFactory for TableSinkOperatorFactory {
    fn name(&self) -> &str {
        &self.name
    }

    fn plan_node_id(&self) -> i32 {
        self.plan_node_id
    }

    fn prepare(&self, state: &RuntimeState) -> ExecResult<()> {
        self.shared.prepare(state)
    }

    fn create(&self, dop: i32, driver_sequence: i32) -> ExecResult<Box<dyn Operator>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ExecError::Internal(format!(
                "{} create after factory close",
                self.name
            )));
        }
        if driver_sequence < 0 || driver_sequence >= dop {
            return Err(ExecError::Internal(format!(
                "{} driver sequence {driver_sequence} out of range for dop {dop}",
                self.name
            )));
        }
        self.shared.register_instance();
        Ok(Box::new(TableSinkOperator::new(
            self.name.clone(),
            self.plan_node_id,
            driver_sequence,
            Arc::clone(&self.shared),
        )))
    }

    fn close(&self, state: &RuntimeState) -> ExecResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let remaining = self.shared.remaining_instances();
            if remaining > 0 {
                warn!(
                    target: "novasink::table_sink",
                    sink = %self.name,
                    remaining,
                    "factory closed before every instance closed"
                );
            }
        }
        match self.shared.finalize(state)? {
            SinkFinalization::Committed => Ok(()),
            SinkFinalization::Aborted(reason) => Err(reason),
        }
    }
}
