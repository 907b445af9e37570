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

//! Pipeline driver execution loop.
//!
//! Responsibilities:
//! - Feeds chunks from a source into one sink operator instance with cooperative scheduling.
//! - Tracks driver state transitions, blocking reasons, and the time-slice quota.
//! - Observes fragment cancellation at every step and reports failures to the fragment.
//!
//! Key exported interfaces:
//! - Types: `DriverState`, `ChunkSource`, `VecChunkSource`, `PipelineDriver`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::fragment_context::FragmentContext;
use super::operator::{BlockedReason, Operator};
use crate::common::status::{ExecError, ExecResult};
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::schedule::observer::Observable;
use crate::novasink_logging::{debug, error};
use crate::runtime::runtime_state::RuntimeState;

/// Runtime state for a single pipeline driver.
///
/// **State machine (high level)**
/// ```text
///              (scheduled)                 (time slice ends)
///   Ready ───────────────────► Running ─────────────────────► Ready
///                               │  │
///                               │  ├─ sink busy / no input ──► Blocked(reason)
///                               │  │                         │
///                               │  │        (woken)           │
///                               │  └─────────────────────────┘
///                               │
///                               ├─ completes normally ───────► Finished
///                               ├─ canceled ─────────────────► Canceled
///                               └─ fatal error ──────────────► Failed(err)
/// ```
/// A terminal state whose sink still has a send in flight is parked in `PendingFinish`
/// until the sink drains.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DriverState {
    Ready,
    Running,
    Blocked(BlockedReason),
    PendingFinish,
    Finished,
    Canceled,
    Failed(ExecError),
}

impl DriverState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DriverState::Finished | DriverState::Canceled | DriverState::Failed(_)
        )
    }
}

/// Upstream of a driver. Pull-only, polled without blocking.
pub trait ChunkSource: Send {
    fn name(&self) -> &str;

    fn has_output(&self) -> bool;

    fn is_finished(&self) -> bool;

    fn pull_chunk(&mut self, state: &RuntimeState) -> ExecResult<Option<Chunk>>;
}

/// Source replaying a fixed list of chunks.
pub struct VecChunkSource {
    chunks: VecDeque<Chunk>,
}

impl VecChunkSource {
    pub fn new(chunks: impl IntoIterator<Item = Chunk>) -> Self {
        Self {
            chunks: chunks.into_iter().collect(),
        }
    }
}

impl ChunkSource for VecChunkSource {
    fn name(&self) -> &str {
        "VEC_CHUNK_SOURCE"
    }

    fn has_output(&self) -> bool {
        !self.chunks.is_empty()
    }

    fn is_finished(&self) -> bool {
        self.chunks.is_empty()
    }

    fn pull_chunk(&mut self, _state: &RuntimeState) -> ExecResult<Option<Chunk>> {
        Ok(self.chunks.pop_front())
    }
}

/// Drives one source into one operator instance following the operator call sequence:
/// `prepare` once, `need_input`/`push_chunk` while input flows, `set_finishing` once,
/// poll until finished, `close` exactly once.
pub struct PipelineDriver {
    driver_id: i32,
    fragment_ctx: Arc<FragmentContext>,
    runtime_state: Arc<RuntimeState>,
    source: Box<dyn ChunkSource>,
    sink: Box<dyn Operator>,
    edge_chunk: Option<Chunk>,
    source_closed: bool,
    finishing_set: bool,
    prepared: bool,
    state: DriverState,
    pending_finish_state: Option<DriverState>,
    closed: bool,
    pushed_chunks: usize,
}

impl PipelineDriver {
    pub fn new(
        fragment_ctx: Arc<FragmentContext>,
        source: Box<dyn ChunkSource>,
        sink: Box<dyn Operator>,
    ) -> Self {
        let driver_id = fragment_ctx.next_driver_id();
        let runtime_state = Arc::clone(fragment_ctx.runtime_state());
        Self {
            driver_id,
            fragment_ctx,
            runtime_state,
            source,
            sink,
            edge_chunk: None,
            source_closed: false,
            finishing_set: false,
            prepared: false,
            state: DriverState::Ready,
            pending_finish_state: None,
            closed: false,
            pushed_chunks: 0,
        }
    }

    pub fn driver_id(&self) -> i32 {
        self.driver_id
    }

    pub fn driver_sequence(&self) -> i32 {
        self.sink.driver_sequence()
    }

    pub fn state(&self) -> &DriverState {
        &self.state
    }

    pub fn pushed_chunks(&self) -> usize {
        self.pushed_chunks
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub(crate) fn sink_observable(&self) -> Option<Arc<Observable>> {
        self.sink
            .as_processor_ref()
            .and_then(|proc| proc.sink_observable())
    }

    pub fn prepare(&mut self) -> ExecResult<()> {
        if self.prepared {
            return Ok(());
        }
        self.prepared = true;
        if let Err(err) = self.sink.prepare(self.runtime_state.as_ref()) {
            self.finish_with_state(DriverState::Failed(err.clone()));
            return Err(err);
        }
        Ok(())
    }

    /// Runs until blocked, terminal, or the time slice is used up. Never blocks the thread.
    pub fn process(&mut self, time_slice: Duration) -> DriverState {
        if self.state.is_terminal() {
            return self.state.clone();
        }
        if !self.prepared
            && let Err(err) = self.prepare()
        {
            return DriverState::Failed(err);
        }
        if let Some(final_state) = self.pending_finish_state.clone() {
            if self.sink.pending_finish() {
                self.state = DriverState::PendingFinish;
                return self.state.clone();
            }
            self.pending_finish_state = None;
            return self.finish_with_state(final_state);
        }

        let start = Instant::now();
        self.state = DriverState::Running;

        loop {
            if self.fragment_ctx.is_cancelled() {
                return self.finish_with_state(DriverState::Canceled);
            }
            if start.elapsed() >= time_slice {
                self.state = DriverState::Ready;
                return self.state.clone();
            }
            if self.sink.is_finished() {
                return self.finish_with_state(DriverState::Finished);
            }

            let mut made_progress = false;
            if let Err(err) = self.drive_source(&mut made_progress) {
                return self.finish_with_error(err);
            }
            if let Err(err) = self.drive_sink(&mut made_progress) {
                return self.finish_with_error(err);
            }
            if made_progress {
                continue;
            }

            if self.finishing_set {
                return self.block(BlockedReason::PendingFinish);
            }
            if self.edge_chunk.is_some() {
                return self.block(BlockedReason::OutputFull);
            }
            if !self.source_closed && !self.source.has_output() {
                return self.block(BlockedReason::InputEmpty);
            }
            self.state = DriverState::Ready;
            return self.state.clone();
        }
    }

    fn drive_source(&mut self, made_progress: &mut bool) -> ExecResult<()> {
        if self.edge_chunk.is_some() || self.source_closed {
            return Ok(());
        }
        if self.source.is_finished() {
            self.source_closed = true;
            *made_progress = true;
            return Ok(());
        }
        if !self.source.has_output() {
            return Ok(());
        }
        if let Some(chunk) = self.source.pull_chunk(self.runtime_state.as_ref())? {
            self.edge_chunk = Some(chunk);
            *made_progress = true;
        }
        Ok(())
    }

    fn drive_sink(&mut self, made_progress: &mut bool) -> ExecResult<()> {
        let sink_name = self.sink.name().to_string();
        let proc = self.sink.as_processor_mut().ok_or_else(|| {
            ExecError::Internal(format!("pipeline sink {sink_name} missing processor operator"))
        })?;
        if self.edge_chunk.is_some() && proc.need_input() {
            if let Some(chunk) = self.edge_chunk.take() {
                proc.push_chunk(self.runtime_state.as_ref(), chunk)?;
                self.pushed_chunks += 1;
                *made_progress = true;
            }
            return Ok(());
        }
        if self.source_closed && self.edge_chunk.is_none() && !self.finishing_set {
            proc.set_finishing(self.runtime_state.as_ref())?;
            self.finishing_set = true;
            debug!(
                target: "novasink::driver",
                driver_id = self.driver_id,
                op_name = %sink_name,
                pushed_chunks = self.pushed_chunks,
                "driver set_finishing"
            );
            *made_progress = true;
        }
        Ok(())
    }

    fn block(&mut self, reason: BlockedReason) -> DriverState {
        self.state = DriverState::Blocked(reason);
        self.state.clone()
    }

    fn finish_with_error(&mut self, err: ExecError) -> DriverState {
        if err.is_cancelled() {
            return self.finish_with_state(DriverState::Canceled);
        }
        self.finish_with_state(DriverState::Failed(err))
    }

    fn finish_with_state(&mut self, state: DriverState) -> DriverState {
        if let DriverState::Failed(err) = &state {
            self.fragment_ctx.report_failure(err.clone());
        }
        if matches!(state, DriverState::Canceled | DriverState::Failed(_)) {
            self.edge_chunk = None;
            if let Err(err) = self.sink.set_cancelled(self.runtime_state.as_ref()) {
                error!(
                    target: "novasink::driver",
                    driver_id = self.driver_id,
                    error = %err,
                    "operator set_cancelled failed"
                );
            }
        }
        if state.is_terminal() && self.pending_finish_state.is_none() && self.sink.pending_finish()
        {
            self.pending_finish_state = Some(state);
            self.state = DriverState::PendingFinish;
            return self.state.clone();
        }
        let state = match self.close_operators() {
            Err(err) if state == DriverState::Finished && !err.is_cancelled() => {
                DriverState::Failed(err)
            }
            _ => state,
        };
        match &state {
            DriverState::Finished => debug!(
                target: "novasink::driver",
                finst_id = ?self.fragment_ctx.fragment_instance_id().map(|id| id.to_string()),
                driver_id = self.driver_id,
                pushed_chunks = self.pushed_chunks,
                "driver finished"
            ),
            DriverState::Canceled => debug!(
                target: "novasink::driver",
                finst_id = ?self.fragment_ctx.fragment_instance_id().map(|id| id.to_string()),
                driver_id = self.driver_id,
                "driver canceled"
            ),
            DriverState::Failed(err) => error!(
                target: "novasink::driver",
                finst_id = ?self.fragment_ctx.fragment_instance_id().map(|id| id.to_string()),
                driver_id = self.driver_id,
                error = %err,
                "driver failed"
            ),
            _ => {}
        }
        self.state = state;
        self.state.clone()
    }

    /// Closes the operator exactly once; failures are reported to the fragment.
    fn close_operators(&mut self) -> ExecResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.edge_chunk = None;
        let result = self.sink.close(self.runtime_state.as_ref());
        if let Err(err) = &result {
            error!(
                target: "novasink::driver",
                driver_id = self.driver_id,
                op_name = %self.sink.name(),
                error = %err,
                "operator close failed"
            );
            self.fragment_ctx.report_failure(err.clone());
        }
        result
    }
}

impl Drop for PipelineDriver {
    fn drop(&mut self) {
        let _ = self.close_operators();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::UniqueId;
    use crate::exec::pipeline::operator::ProcessorOperator;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Calls {
        pushes: AtomicUsize,
        finishing: AtomicUsize,
        cancels: AtomicUsize,
        closes: AtomicUsize,
    }

    struct RecordingSink {
        calls: Arc<Calls>,
        fail_push_at: Option<usize>,
        finishing: bool,
        cancelled: bool,
    }

    impl Operator for RecordingSink {
        fn name(&self) -> &str {
            "RECORDING_SINK"
        }
        fn plan_node_id(&self) -> i32 {
            1
        }
        fn driver_sequence(&self) -> i32 {
            0
        }
        fn close(&mut self, _state: &RuntimeState) -> ExecResult<()> {
            self.calls.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn set_cancelled(&mut self, _state: &RuntimeState) -> ExecResult<()> {
            self.cancelled = true;
            self.calls.cancels.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn is_finished(&self) -> bool {
            self.finishing || self.cancelled
        }
        fn as_processor_mut(&mut self) -> Option<&mut dyn ProcessorOperator> {
            Some(self)
        }
        fn as_processor_ref(&self) -> Option<&dyn ProcessorOperator> {
            Some(self)
        }
    }

    impl ProcessorOperator for RecordingSink {
        fn need_input(&self) -> bool {
            !self.finishing && !self.cancelled
        }
        fn has_output(&self) -> bool {
            false
        }
        fn push_chunk(&mut self, _state: &RuntimeState, _chunk: Chunk) -> ExecResult<()> {
            let n = self.calls.pushes.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_push_at == Some(n) {
                return Err(ExecError::Forwarding("rejected".into()));
            }
            Ok(())
        }
        fn pull_chunk(&mut self, _state: &RuntimeState) -> ExecResult<Option<Chunk>> {
            Ok(None)
        }
        fn set_finishing(&mut self, _state: &RuntimeState) -> ExecResult<()> {
            self.finishing = true;
            self.calls.finishing.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn new_driver(chunks: usize, fail_push_at: Option<usize>) -> (PipelineDriver, Arc<Calls>) {
        let ctx = Arc::new(FragmentContext::new(Arc::new(RuntimeState::new(
            UniqueId::new(1, 1),
        ))));
        let calls = Arc::new(Calls::default());
        let sink = RecordingSink {
            calls: Arc::clone(&calls),
            fail_push_at,
            finishing: false,
            cancelled: false,
        };
        let source = VecChunkSource::new((0..chunks).map(|_| Chunk::default()));
        (
            PipelineDriver::new(ctx, Box::new(source), Box::new(sink)),
            calls,
        )
    }

    #[test]
    fn driver_pushes_all_chunks_then_finishes() {
        let (mut driver, calls) = new_driver(3, None);
        let state = driver.process(Duration::from_secs(5));
        assert_eq!(state, DriverState::Finished);
        assert_eq!(calls.pushes.load(Ordering::SeqCst), 3);
        assert_eq!(calls.finishing.load(Ordering::SeqCst), 1);
        assert_eq!(calls.closes.load(Ordering::SeqCst), 1);
        drop(driver);
        assert_eq!(calls.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn push_failure_fails_driver_and_fragment() {
        let (mut driver, calls) = new_driver(3, Some(2));
        let ctx = Arc::clone(&driver.fragment_ctx);
        let state = driver.process(Duration::from_secs(5));
        assert!(matches!(state, DriverState::Failed(ExecError::Forwarding(_))));
        assert!(ctx.is_cancelled());
        assert!(ctx.final_status().is_err());
        assert_eq!(calls.cancels.load(Ordering::SeqCst), 1);
        assert_eq!(calls.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_fragment_stops_before_pushing() {
        let (mut driver, calls) = new_driver(2, None);
        driver.fragment_ctx.cancel();
        let state = driver.process(Duration::from_secs(5));
        assert_eq!(state, DriverState::Canceled);
        assert_eq!(calls.pushes.load(Ordering::SeqCst), 0);
        assert_eq!(calls.cancels.load(Ordering::SeqCst), 1);
        assert!(driver.fragment_ctx.final_status().is_ok());
    }
}
