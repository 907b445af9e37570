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

//! Factory-owned coordination state for one shared table sink.
//!
//! Responsibilities:
//! - Opens the sink at most once under a mutex, whichever instance needs it first.
//! - Counts created instances that have not closed yet; the last arrival finalizes.
//! - Finalizes (commit or abort) exactly once, including when the factory close races.
//!
//! Key exported interfaces:
//! - Types: `TableSinkSharedState`, `SinkFinalization`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::status::{ExecError, ExecResult};
use crate::connector::sink::TableSink;
use crate::exec::pipeline::fragment_context::FragmentContext;
use crate::novasink_logging::{debug, info, warn};
use crate::runtime::runtime_state::RuntimeState;

/// Cached outcome of the one `open` call.
#[derive(Clone, Debug, PartialEq, Eq)]
enum OpenState {
    NotOpened,
    Opened,
    Failed(ExecError),
}

/// How the shared sink was finalized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkFinalization {
    Committed,
    /// Aborted because of the contained failure or cancellation.
    Aborted(ExecError),
}

pub struct TableSinkSharedState {
    sink: Arc<dyn TableSink>,
    fragment_ctx: Arc<FragmentContext>,
    prepared: AtomicBool,
    open_state: Mutex<OpenState>,
    registered_instances: AtomicUsize,
    remaining_instances: AtomicUsize,
    any_cancelled: AtomicBool,
    first_error: Mutex<Option<ExecError>>,
    finalized: Mutex<Option<ExecResult<SinkFinalization>>>,
}

impl TableSinkSharedState {
    pub(crate) fn new(sink: Arc<dyn TableSink>, fragment_ctx: Arc<FragmentContext>) -> Self {
        Self {
            sink,
            fragment_ctx,
            prepared: AtomicBool::new(false),
            open_state: Mutex::new(OpenState::NotOpened),
            registered_instances: AtomicUsize::new(0),
            remaining_instances: AtomicUsize::new(0),
            any_cancelled: AtomicBool::new(false),
            first_error: Mutex::new(None),
            finalized: Mutex::new(None),
        }
    }

    pub fn sink(&self) -> &Arc<dyn TableSink> {
        &self.sink
    }

    pub(crate) fn fragment_ctx(&self) -> &Arc<FragmentContext> {
        &self.fragment_ctx
    }

    /// Runs the sink's one-time `init`. A second call is a contract violation.
    pub(crate) fn prepare(&self, state: &RuntimeState) -> ExecResult<()> {
        if self.prepared.load(Ordering::Acquire) {
            return Err(ExecError::Internal(format!(
                "table sink {} prepared twice",
                self.sink.name()
            )));
        }
        self.sink.init(state).map_err(|e| {
            ExecError::Initialization(format!("init table sink {} failed: {e}", self.sink.name()))
        })?;
        self.prepared.store(true, Ordering::Release);
        debug!(
            target: "novasink::table_sink",
            sink = %self.sink.name(),
            "table sink initialized"
        );
        Ok(())
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared.load(Ordering::Acquire)
    }

    /// Opens the sink if nobody has yet. Every caller observes the same outcome; a failed
    /// open is sticky.
    pub(crate) fn ensure_open(&self, state: &RuntimeState) -> ExecResult<()> {
        let mut guard = self.open_state.lock().expect("table sink open lock");
        match &*guard {
            OpenState::Opened => return Ok(()),
            OpenState::Failed(err) => return Err(err.clone()),
            OpenState::NotOpened => {}
        }
        if !self.is_prepared() {
            return Err(ExecError::Internal(format!(
                "table sink {} opened before factory prepare",
                self.sink.name()
            )));
        }
        match self.sink.open(state) {
            Ok(()) => {
                *guard = OpenState::Opened;
                info!(
                    target: "novasink::table_sink",
                    sink = %self.sink.name(),
                    "table sink opened"
                );
                Ok(())
            }
            Err(e) => {
                let err = ExecError::Initialization(format!(
                    "open table sink {} failed: {e}",
                    self.sink.name()
                ));
                *guard = OpenState::Failed(err.clone());
                Err(err)
            }
        }
    }

    pub(crate) fn open_error(&self) -> Option<ExecError> {
        match &*self.open_state.lock().expect("table sink open lock") {
            OpenState::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }

    pub fn is_opened(&self) -> bool {
        *self.open_state.lock().expect("table sink open lock") == OpenState::Opened
    }

    pub(crate) fn register_instance(&self) {
        self.registered_instances.fetch_add(1, Ordering::AcqRel);
        self.remaining_instances.fetch_add(1, Ordering::AcqRel);
    }

    pub fn registered_instances(&self) -> usize {
        self.registered_instances.load(Ordering::Acquire)
    }

    pub fn remaining_instances(&self) -> usize {
        self.remaining_instances.load(Ordering::Acquire)
    }

    /// Marks one instance closed. Returns true for the arrival that brings the count to zero.
    pub(crate) fn arrive_and_is_last(&self) -> bool {
        loop {
            let current = self.remaining_instances.load(Ordering::Acquire);
            if current == 0 {
                return false;
            }
            if self
                .remaining_instances
                .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return current == 1;
            }
        }
    }

    pub(crate) fn record_error(&self, err: ExecError) {
        if err.is_cancelled() {
            self.mark_cancelled();
            return;
        }
        let mut guard = self.first_error.lock().expect("table sink error lock");
        if guard.is_none() {
            *guard = Some(err);
        }
    }

    pub fn first_error(&self) -> Option<ExecError> {
        self.first_error.lock().expect("table sink error lock").clone()
    }

    pub(crate) fn mark_cancelled(&self) {
        self.any_cancelled.store(true, Ordering::Release);
    }

    pub fn finalization(&self) -> Option<ExecResult<SinkFinalization>> {
        self.finalized.lock().expect("table sink finalize lock").clone()
    }

    fn abort_reason(&self) -> Option<ExecError> {
        if let Some(err) = self.first_error() {
            return Some(err);
        }
        if self.any_cancelled.load(Ordering::Acquire) || self.fragment_ctx.is_cancelled() {
            return Some(ExecError::Cancelled(format!(
                "table sink {} cancelled",
                self.sink.name()
            )));
        }
        let remaining = self.remaining_instances();
        if remaining > 0 {
            return Some(ExecError::Internal(format!(
                "table sink {} finalized with {remaining} instance(s) not closed",
                self.sink.name()
            )));
        }
        None
    }

    /// Commits or aborts the sink. Runs once; later callers get the stored outcome.
    pub(crate) fn finalize(&self, state: &RuntimeState) -> ExecResult<SinkFinalization> {
        let mut guard = self.finalized.lock().expect("table sink finalize lock");
        if let Some(outcome) = guard.as_ref() {
            return outcome.clone();
        }
        let outcome = match self.abort_reason() {
            Some(reason) => self.abort(state, reason),
            None => self.commit(state),
        };
        *guard = Some(outcome.clone());
        outcome
    }

    fn abort(&self, state: &RuntimeState, reason: ExecError) -> ExecResult<SinkFinalization> {
        if let Err(e) = self.sink.abort(state) {
            let err = ExecError::Finalization(format!(
                "abort table sink {} failed: {e} (aborting because: {reason})",
                self.sink.name()
            ));
            warn!(
                target: "novasink::table_sink",
                sink = %self.sink.name(),
                error = %err,
                "table sink abort failed"
            );
            return Err(err);
        }
        info!(
            target: "novasink::table_sink",
            sink = %self.sink.name(),
            reason = %reason,
            registered_instances = self.registered_instances(),
            "table sink aborted"
        );
        Ok(SinkFinalization::Aborted(reason))
    }

    fn commit(&self, state: &RuntimeState) -> ExecResult<SinkFinalization> {
        // Empty input still opens and commits.
        if let Err(err) = self.ensure_open(state) {
            return self.abort(state, err);
        }
        match self.sink.commit(state) {
            Ok(()) => {
                info!(
                    target: "novasink::table_sink",
                    sink = %self.sink.name(),
                    registered_instances = self.registered_instances(),
                    "table sink committed"
                );
                Ok(SinkFinalization::Committed)
            }
            Err(e) => {
                let err = ExecError::Finalization(format!(
                    "commit table sink {} failed: {e}",
                    self.sink.name()
                ));
                warn!(
                    target: "novasink::table_sink",
                    sink = %self.sink.name(),
                    error = %err,
                    "table sink commit failed"
                );
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::UniqueId;
    use crate::connector::sink::MemoryTableSink;
    use std::sync::Barrier;

    fn shared_with(sink: &MemoryTableSink) -> (TableSinkSharedState, RuntimeState) {
        let state = RuntimeState::new(UniqueId::new(9, 9));
        let ctx = Arc::new(FragmentContext::new(Arc::new(state.clone())));
        (
            TableSinkSharedState::new(Arc::new(sink.clone()), ctx),
            state,
        )
    }

    #[test]
    fn concurrent_ensure_open_opens_once() {
        let sink = MemoryTableSink::builder("t").build();
        let (shared, state) = shared_with(&sink);
        shared.prepare(&state).expect("prepare");
        let barrier = Barrier::new(8);
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    barrier.wait();
                    shared.ensure_open(&state).expect("open");
                });
            }
        });
        assert_eq!(sink.stats().open_calls, 1);
        assert!(shared.is_opened());
    }

    #[test]
    fn failed_open_is_sticky() {
        let sink = MemoryTableSink::builder("t").fail_open("no route").build();
        let (shared, state) = shared_with(&sink);
        shared.prepare(&state).expect("prepare");
        let first = shared.ensure_open(&state).expect_err("open fails");
        let second = shared.ensure_open(&state).expect_err("still fails");
        assert!(matches!(first, ExecError::Initialization(_)));
        assert_eq!(first, second);
        assert_eq!(shared.open_error(), Some(first));
        assert_eq!(sink.stats().open_calls, 1);
    }

    #[test]
    fn open_before_prepare_is_internal_error() {
        let sink = MemoryTableSink::builder("t").build();
        let (shared, state) = shared_with(&sink);
        let err = shared.ensure_open(&state).expect_err("not prepared");
        assert!(matches!(err, ExecError::Internal(_)));
        shared.prepare(&state).expect("prepare");
        let err = shared.prepare(&state).expect_err("second prepare");
        assert!(matches!(err, ExecError::Internal(_)));
        assert_eq!(sink.stats().init_calls, 1);
    }

    #[test]
    fn last_arrival_is_reported_once() {
        let sink = MemoryTableSink::builder("t").build();
        let (shared, _state) = shared_with(&sink);
        for _ in 0..3 {
            shared.register_instance();
        }
        assert!(!shared.arrive_and_is_last());
        assert!(!shared.arrive_and_is_last());
        assert!(shared.arrive_and_is_last());
        assert!(!shared.arrive_and_is_last());
        assert_eq!(shared.registered_instances(), 3);
        assert_eq!(shared.remaining_instances(), 0);
    }

    #[test]
    fn finalize_runs_once_and_aborts_on_error() {
        let sink = MemoryTableSink::builder("t").build();
        let (shared, state) = shared_with(&sink);
        shared.prepare(&state).expect("prepare");
        shared.record_error(ExecError::Forwarding("replica down".into()));
        shared.record_error(ExecError::Forwarding("later".into()));

        let outcome = shared.finalize(&state).expect("abort is not an error");
        assert_eq!(
            outcome,
            SinkFinalization::Aborted(ExecError::Forwarding("replica down".into()))
        );
        assert_eq!(shared.finalize(&state), Ok(outcome));
        assert_eq!(sink.stats().abort_calls, 1);
        assert_eq!(sink.stats().commit_calls, 0);
    }

    #[test]
    fn finalize_without_instances_opens_and_commits() {
        let sink = MemoryTableSink::builder("t").build();
        let (shared, state) = shared_with(&sink);
        shared.prepare(&state).expect("prepare");
        assert_eq!(shared.finalize(&state), Ok(SinkFinalization::Committed));
        assert_eq!(sink.stats().open_calls, 1);
        assert_eq!(sink.stats().commit_calls, 1);
        assert!(sink.is_committed());
    }

    #[test]
    fn commit_failure_is_finalization_error() {
        let sink = MemoryTableSink::builder("t").fail_commit("txn expired").build();
        let (shared, state) = shared_with(&sink);
        shared.prepare(&state).expect("prepare");
        let err = shared.finalize(&state).expect_err("commit fails");
        assert!(matches!(err, ExecError::Finalization(_)));
        assert_eq!(shared.finalization(), Some(Err(err)));
        assert_eq!(sink.stats().commit_calls, 1);
        assert_eq!(sink.stats().abort_calls, 0);
    }

    #[test]
    fn failed_abort_is_finalization_error() {
        let sink = MemoryTableSink::builder("t").fail_abort("coordinator gone").build();
        let (shared, state) = shared_with(&sink);
        shared.prepare(&state).expect("prepare");
        shared.record_error(ExecError::Forwarding("replica down".into()));

        let err = shared.finalize(&state).expect_err("abort fails");
        assert!(matches!(err, ExecError::Finalization(_)), "err={err}");
        assert!(err.message().contains("coordinator gone"));
        assert_eq!(shared.finalization(), Some(Err(err.clone())));
        assert_eq!(shared.finalize(&state), Err(err));
        assert_eq!(sink.stats().abort_calls, 1);
        assert_eq!(sink.stats().commit_calls, 0);
    }
}
