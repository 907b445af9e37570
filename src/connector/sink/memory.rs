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

//! In-memory table sink.
//!
//! Stages chunks per sender and makes them visible only on `commit`; `abort` discards every
//! staged chunk so no partial load is ever observable. Sends complete inline, after a delay
//! on the data runtime, or when a test calls `complete_pending`/`fail_pending`.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arrow::datatypes::SchemaRef;

use super::{SendState, SinkError, TableSink};
use crate::common::config;
use crate::exec::chunk::Chunk;
use crate::exec::pipeline::schedule::observer::Observable;
use crate::novasink_logging::{debug, info, warn};
use crate::runtime::global_async_runtime::spawn_on_data_runtime;
use crate::runtime::runtime_state::RuntimeState;

/// How an accepted send reaches `Idle`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendCompletion {
    Immediate,
    /// Lands after the delay on the data runtime.
    Async(Duration),
    /// Stays in flight until `complete_pending` or `fail_pending`.
    Manual,
}

/// Snapshot of lifecycle call counts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemorySinkStats {
    pub init_calls: usize,
    pub open_calls: usize,
    pub send_calls: usize,
    pub finish_sender_calls: usize,
    pub cancel_send_calls: usize,
    pub commit_calls: usize,
    pub abort_calls: usize,
}

#[derive(Default)]
struct CallCounters {
    init: AtomicUsize,
    open: AtomicUsize,
    send: AtomicUsize,
    finish_sender: AtomicUsize,
    cancel_send: AtomicUsize,
    commit: AtomicUsize,
    abort: AtomicUsize,
}

#[derive(Clone, Debug, Default)]
struct FailureInjection {
    init: Option<String>,
    open: Option<String>,
    commit: Option<String>,
    abort: Option<String>,
    // sender -> (1-based send ordinal, message)
    send_at: HashMap<i32, (usize, String)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Finalized {
    Committed,
    Aborted,
}

struct InFlightSend {
    generation: u64,
    chunk: Chunk,
    cancelled: bool,
}

#[derive(Default)]
struct SenderSlot {
    sends: usize,
    generation: u64,
    in_flight: Option<InFlightSend>,
    failure: Option<SinkError>,
    finished: bool,
}

#[derive(Default)]
struct MemorySinkState {
    resolved_schema: Option<SchemaRef>,
    opened: bool,
    finalized: Option<Finalized>,
    senders: HashMap<i32, SenderSlot>,
    staged: BTreeMap<i32, Vec<Chunk>>,
    committed: Vec<Chunk>,
}

struct MemorySinkShared {
    name: String,
    destination_schema: Option<SchemaRef>,
    completion: SendCompletion,
    failures: FailureInjection,
    state: Mutex<MemorySinkState>,
    calls: CallCounters,
    observable: Arc<Observable>,
}

/// Handle to one in-memory destination. Clones share the destination.
#[derive(Clone)]
pub struct MemoryTableSink {
    shared: Arc<MemorySinkShared>,
}

pub struct MemoryTableSinkBuilder {
    name: String,
    destination_schema: Option<SchemaRef>,
    completion: SendCompletion,
    failures: FailureInjection,
}

impl MemoryTableSinkBuilder {
    pub fn with_schema(mut self, schema: SchemaRef) -> Self {
        self.destination_schema = Some(schema);
        self
    }

    pub fn with_completion(mut self, completion: SendCompletion) -> Self {
        self.completion = completion;
        self
    }

    pub fn fail_init(mut self, msg: impl Into<String>) -> Self {
        self.failures.init = Some(msg.into());
        self
    }

    pub fn fail_open(mut self, msg: impl Into<String>) -> Self {
        self.failures.open = Some(msg.into());
        self
    }

    pub fn fail_commit(mut self, msg: impl Into<String>) -> Self {
        self.failures.commit = Some(msg.into());
        self
    }

    /// Makes `abort` fail and leaves staged chunks in place.
    pub fn fail_abort(mut self, msg: impl Into<String>) -> Self {
        self.failures.abort = Some(msg.into());
        self
    }

    /// Rejects the `nth` (1-based) send issued by `sender`.
    pub fn fail_send_at(mut self, sender: i32, nth: usize, msg: impl Into<String>) -> Self {
        self.failures.send_at.insert(sender, (nth, msg.into()));
        self
    }

    pub fn build(self) -> MemoryTableSink {
        MemoryTableSink {
            shared: Arc::new(MemorySinkShared {
                name: self.name,
                destination_schema: self.destination_schema,
                completion: self.completion,
                failures: self.failures,
                state: Mutex::new(MemorySinkState::default()),
                calls: CallCounters::default(),
                observable: Arc::new(Observable::new()),
            }),
        }
    }
}

impl MemoryTableSink {
    pub fn builder(name: impl Into<String>) -> MemoryTableSinkBuilder {
        MemoryTableSinkBuilder {
            name: name.into(),
            destination_schema: None,
            completion: SendCompletion::Immediate,
            failures: FailureInjection::default(),
        }
    }

    /// Sink whose send latency follows `[sink] memory_sink_send_latency_ms`.
    pub fn from_config(name: impl Into<String>) -> Self {
        let completion = match config::memory_sink_send_latency() {
            Some(latency) => SendCompletion::Async(latency),
            None => SendCompletion::Immediate,
        };
        Self::builder(name).with_completion(completion).build()
    }

    pub fn stats(&self) -> MemorySinkStats {
        let calls = &self.shared.calls;
        MemorySinkStats {
            init_calls: calls.init.load(Ordering::Acquire),
            open_calls: calls.open.load(Ordering::Acquire),
            send_calls: calls.send.load(Ordering::Acquire),
            finish_sender_calls: calls.finish_sender.load(Ordering::Acquire),
            cancel_send_calls: calls.cancel_send.load(Ordering::Acquire),
            commit_calls: calls.commit.load(Ordering::Acquire),
            abort_calls: calls.abort.load(Ordering::Acquire),
        }
    }

    pub fn is_committed(&self) -> bool {
        self.lock_state().finalized == Some(Finalized::Committed)
    }

    pub fn is_aborted(&self) -> bool {
        self.lock_state().finalized == Some(Finalized::Aborted)
    }

    pub fn committed_chunks(&self) -> Vec<Chunk> {
        self.lock_state().committed.clone()
    }

    pub fn committed_rows(&self) -> usize {
        self.lock_state().committed.iter().map(Chunk::len).sum()
    }

    pub fn staged_rows(&self) -> usize {
        self.lock_state()
            .staged
            .values()
            .flat_map(|chunks| chunks.iter())
            .map(Chunk::len)
            .sum()
    }

    pub fn has_in_flight(&self, sender: i32) -> bool {
        self.lock_state()
            .senders
            .get(&sender)
            .is_some_and(|slot| slot.in_flight.is_some())
    }

    /// Lands (or, if cancelled, drops) the sender's outstanding send. Returns false when
    /// nothing was in flight.
    pub fn complete_pending(&self, sender: i32) -> bool {
        self.shared.finish_send(sender, None, None)
    }

    /// Fails the sender's outstanding send asynchronously.
    pub fn fail_pending(&self, sender: i32, msg: impl Into<String>) -> bool {
        self.shared
            .finish_send(sender, None, Some(SinkError::Rejected(msg.into())))
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MemorySinkState> {
        self.shared.state.lock().expect("memory sink state lock")
    }
}

impl MemorySinkShared {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, MemorySinkState> {
        self.state.lock().expect("memory sink state lock")
    }

    /// `generation == None` matches whatever send is outstanding.
    fn finish_send(&self, sender: i32, generation: Option<u64>, failure: Option<SinkError>) -> bool {
        let notify = self.observable_notify();
        let mut guard = self.lock_state();
        let state = &mut *guard;
        let Some(slot) = state.senders.get_mut(&sender) else {
            return false;
        };
        let matches = slot
            .in_flight
            .as_ref()
            .is_some_and(|send| generation.is_none_or(|g| g == send.generation));
        if !matches {
            return false;
        }
        let Some(send) = slot.in_flight.take() else {
            return false;
        };
        if send.cancelled || state.finalized.is_some() {
            debug!(
                target: "novasink::memory_sink",
                sink = %self.name,
                sender,
                rows = send.chunk.len(),
                "drop cancelled send"
            );
        } else if let Some(err) = failure {
            slot.failure = Some(err);
        } else {
            state.staged.entry(sender).or_default().push(send.chunk);
        }
        notify.arm();
        true
    }

    fn observable_notify(&self) -> crate::exec::pipeline::schedule::observer::DeferNotify {
        self.observable.defer_notify()
    }

    fn check_schema(&self, state: &MemorySinkState, chunk: &Chunk) -> Result<(), SinkError> {
        let Some(expected) = state.resolved_schema.as_ref() else {
            return Ok(());
        };
        let actual = chunk.schema();
        if expected.fields() != actual.fields() {
            return Err(SinkError::SchemaMismatch(format!(
                "expected {:?}, got {:?}",
                expected
                    .fields()
                    .iter()
                    .map(|f| f.name().as_str())
                    .collect::<Vec<_>>(),
                actual
                    .fields()
                    .iter()
                    .map(|f| f.name().as_str())
                    .collect::<Vec<_>>()
            )));
        }
        Ok(())
    }
}

impl TableSink for MemoryTableSink {
    fn name(&self) -> &str {
        &self.shared.name
    }

    fn init(&self, _state: &RuntimeState) -> Result<(), SinkError> {
        self.shared.calls.init.fetch_add(1, Ordering::AcqRel);
        if let Some(msg) = &self.shared.failures.init {
            return Err(SinkError::Unavailable(msg.clone()));
        }
        let mut state = self.lock_state();
        state.resolved_schema = self.shared.destination_schema.clone();
        Ok(())
    }

    fn open(&self, state: &RuntimeState) -> Result<(), SinkError> {
        self.shared.calls.open.fetch_add(1, Ordering::AcqRel);
        if let Some(msg) = &self.shared.failures.open {
            return Err(SinkError::Unavailable(msg.clone()));
        }
        let mut guard = self.lock_state();
        if guard.finalized.is_some() {
            return Err(SinkError::Finalized);
        }
        guard.opened = true;
        info!(
            target: "novasink::memory_sink",
            sink = %self.shared.name,
            finst_id = ?state.fragment_instance_id().map(|id| id.to_string()),
            "memory sink opened"
        );
        Ok(())
    }

    fn send(&self, sender: i32, chunk: Chunk) -> Result<(), SinkError> {
        self.shared.calls.send.fetch_add(1, Ordering::AcqRel);
        let generation = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            if state.finalized.is_some() {
                return Err(SinkError::Finalized);
            }
            if !state.opened {
                return Err(SinkError::NotOpen);
            }
            self.shared.check_schema(state, &chunk)?;
            let slot = state.senders.entry(sender).or_default();
            if slot.finished {
                return Err(SinkError::SenderFinished(sender));
            }
            if slot.in_flight.is_some() {
                return Err(SinkError::SendInFlight(sender));
            }
            slot.sends += 1;
            if let Some((nth, msg)) = self.shared.failures.send_at.get(&sender)
                && *nth == slot.sends
            {
                return Err(SinkError::Rejected(msg.clone()));
            }
            match self.shared.completion {
                SendCompletion::Immediate => {
                    state.staged.entry(sender).or_default().push(chunk);
                    return Ok(());
                }
                SendCompletion::Async(_) | SendCompletion::Manual => {
                    slot.generation += 1;
                    slot.in_flight = Some(InFlightSend {
                        generation: slot.generation,
                        chunk,
                        cancelled: false,
                    });
                    slot.generation
                }
            }
        };

        let SendCompletion::Async(latency) = self.shared.completion else {
            return Ok(());
        };
        let shared = Arc::clone(&self.shared);
        let spawned = spawn_on_data_runtime(async move {
            tokio::time::sleep(latency).await;
            shared.finish_send(sender, Some(generation), None);
        });
        if let Err(err) = spawned {
            warn!(
                target: "novasink::memory_sink",
                sink = %self.shared.name,
                sender,
                error = %err,
                "schedule async send failed"
            );
            let mut guard = self.lock_state();
            if let Some(slot) = guard.senders.get_mut(&sender) {
                slot.in_flight = None;
            }
            return Err(SinkError::Unavailable(err.to_string()));
        }
        Ok(())
    }

    fn finish_sender(&self, sender: i32) -> Result<(), SinkError> {
        self.shared.calls.finish_sender.fetch_add(1, Ordering::AcqRel);
        let mut guard = self.lock_state();
        if guard.finalized.is_some() {
            return Err(SinkError::Finalized);
        }
        let slot = guard.senders.entry(sender).or_default();
        slot.finished = true;
        debug!(
            target: "novasink::memory_sink",
            sink = %self.shared.name,
            sender,
            sends = slot.sends,
            "memory sink sender finished"
        );
        Ok(())
    }

    fn poll_send(&self, sender: i32) -> SendState {
        let guard = self.lock_state();
        match guard.senders.get(&sender) {
            Some(slot) if slot.in_flight.is_some() => SendState::InFlight,
            Some(SenderSlot {
                failure: Some(err), ..
            }) => SendState::Failed(err.clone()),
            _ => SendState::Idle,
        }
    }

    fn cancel_send(&self, sender: i32) {
        self.shared.calls.cancel_send.fetch_add(1, Ordering::AcqRel);
        let mut guard = self.lock_state();
        if let Some(send) = guard
            .senders
            .get_mut(&sender)
            .and_then(|slot| slot.in_flight.as_mut())
        {
            send.cancelled = true;
        }
    }

    fn commit(&self, _state: &RuntimeState) -> Result<(), SinkError> {
        self.shared.calls.commit.fetch_add(1, Ordering::AcqRel);
        let mut guard = self.lock_state();
        let state = &mut *guard;
        if state.finalized.is_some() {
            return Err(SinkError::Finalized);
        }
        if !state.opened {
            return Err(SinkError::NotOpen);
        }
        if let Some(msg) = &self.shared.failures.commit {
            state.staged.clear();
            state.finalized = Some(Finalized::Aborted);
            return Err(SinkError::Unavailable(msg.clone()));
        }
        let staged = std::mem::take(&mut state.staged);
        for (_, chunks) in staged {
            state.committed.extend(chunks);
        }
        state.finalized = Some(Finalized::Committed);
        info!(
            target: "novasink::memory_sink",
            sink = %self.shared.name,
            committed_chunks = state.committed.len(),
            "memory sink committed"
        );
        Ok(())
    }

    fn abort(&self, _state: &RuntimeState) -> Result<(), SinkError> {
        self.shared.calls.abort.fetch_add(1, Ordering::AcqRel);
        let notify = self.shared.observable_notify();
        let mut guard = self.lock_state();
        let state = &mut *guard;
        match state.finalized {
            Some(Finalized::Committed) => return Err(SinkError::Finalized),
            Some(Finalized::Aborted) => return Ok(()),
            None => {}
        }
        if let Some(msg) = &self.shared.failures.abort {
            return Err(SinkError::Unavailable(msg.clone()));
        }
        let dropped_chunks: usize = state.staged.values().map(Vec::len).sum();
        state.staged.clear();
        for send in state
            .senders
            .values_mut()
            .filter_map(|slot| slot.in_flight.as_mut())
        {
            send.cancelled = true;
        }
        state.finalized = Some(Finalized::Aborted);
        info!(
            target: "novasink::memory_sink",
            sink = %self.shared.name,
            dropped_chunks,
            "memory sink aborted"
        );
        notify.arm();
        Ok(())
    }

    fn observable(&self) -> Option<Arc<Observable>> {
        Some(Arc::clone(&self.shared.observable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, RecordBatch};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::time::Instant;

    fn schema(name: &str) -> SchemaRef {
        Arc::new(Schema::new(vec![Field::new(name, DataType::Int32, false)]))
    }

    fn chunk(schema: SchemaRef, values: Vec<i32>) -> Chunk {
        Chunk::new(
            RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values))])
                .expect("record batch"),
        )
    }

    fn opened(sink: &MemoryTableSink) -> RuntimeState {
        let state = RuntimeState::default();
        sink.init(&state).expect("init");
        sink.open(&state).expect("open");
        state
    }

    #[test]
    fn send_requires_open() {
        let sink = MemoryTableSink::builder("t").build();
        let err = sink
            .send(0, chunk(schema("v"), vec![1]))
            .expect_err("send before open");
        assert_eq!(err, SinkError::NotOpen);
    }

    #[test]
    fn commit_publishes_staged_chunks_in_sender_order() {
        let sink = MemoryTableSink::builder("t").with_schema(schema("v")).build();
        let state = opened(&sink);
        sink.send(1, chunk(schema("v"), vec![3, 4])).expect("send");
        sink.send(0, chunk(schema("v"), vec![1])).expect("send");
        assert_eq!(sink.staged_rows(), 3);
        assert_eq!(sink.committed_rows(), 0);

        sink.commit(&state).expect("commit");
        assert!(sink.is_committed());
        assert_eq!(sink.committed_rows(), 3);
        assert_eq!(sink.committed_chunks()[0].len(), 1);
        assert_eq!(sink.commit(&state), Err(SinkError::Finalized));
        assert_eq!(sink.abort(&state), Err(SinkError::Finalized));
    }

    #[test]
    fn schema_mismatch_is_rejected() {
        let sink = MemoryTableSink::builder("t").with_schema(schema("v")).build();
        opened(&sink);
        let err = sink
            .send(0, chunk(schema("other"), vec![1]))
            .expect_err("mismatch");
        assert!(matches!(err, SinkError::SchemaMismatch(_)));
    }

    #[test]
    fn manual_send_stays_in_flight_until_completed() {
        let sink = MemoryTableSink::builder("t")
            .with_completion(SendCompletion::Manual)
            .build();
        opened(&sink);
        sink.send(0, chunk(schema("v"), vec![1])).expect("send");
        assert_eq!(sink.poll_send(0), SendState::InFlight);
        assert_eq!(
            sink.send(0, chunk(schema("v"), vec![2])),
            Err(SinkError::SendInFlight(0))
        );
        assert!(sink.complete_pending(0));
        assert_eq!(sink.poll_send(0), SendState::Idle);
        assert_eq!(sink.staged_rows(), 1);
        assert!(!sink.complete_pending(0));
    }

    #[test]
    fn failed_pending_send_is_sticky() {
        let sink = MemoryTableSink::builder("t")
            .with_completion(SendCompletion::Manual)
            .build();
        opened(&sink);
        sink.send(2, chunk(schema("v"), vec![1])).expect("send");
        assert!(sink.fail_pending(2, "replica timeout"));
        let failed = SendState::Failed(SinkError::Rejected("replica timeout".into()));
        assert_eq!(sink.poll_send(2), failed);
        assert_eq!(sink.poll_send(2), failed);
        assert_eq!(sink.staged_rows(), 0);
    }

    #[test]
    fn cancelled_send_is_dropped_on_completion() {
        let sink = MemoryTableSink::builder("t")
            .with_completion(SendCompletion::Manual)
            .build();
        opened(&sink);
        sink.send(0, chunk(schema("v"), vec![1, 2])).expect("send");
        sink.cancel_send(0);
        assert_eq!(sink.poll_send(0), SendState::InFlight);
        assert!(sink.complete_pending(0));
        assert_eq!(sink.poll_send(0), SendState::Idle);
        assert_eq!(sink.staged_rows(), 0);
        assert_eq!(sink.stats().cancel_send_calls, 1);
    }

    #[test]
    fn abort_with_send_in_flight_discards_everything() {
        let sink = MemoryTableSink::builder("t")
            .with_completion(SendCompletion::Async(Duration::from_millis(20)))
            .build();
        let state = opened(&sink);
        sink.send(0, chunk(schema("v"), vec![1])).expect("send");
        sink.abort(&state).expect("abort");
        assert!(sink.is_aborted());

        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.has_in_flight(0) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(sink.poll_send(0), SendState::Idle);
        assert_eq!(sink.staged_rows(), 0);
        assert_eq!(sink.committed_rows(), 0);
        assert_eq!(sink.abort(&state), Ok(()));
    }

    #[test]
    fn injected_send_failure_hits_only_the_chosen_send() {
        let sink = MemoryTableSink::builder("t")
            .fail_send_at(1, 2, "disk full")
            .build();
        opened(&sink);
        sink.send(1, chunk(schema("v"), vec![1])).expect("first send");
        sink.send(0, chunk(schema("v"), vec![1])).expect("other sender");
        assert_eq!(
            sink.send(1, chunk(schema("v"), vec![2])),
            Err(SinkError::Rejected("disk full".into()))
        );
        assert_eq!(sink.stats().send_calls, 3);
    }

    #[test]
    fn finished_sender_rejects_further_sends() {
        let sink = MemoryTableSink::builder("t")
            .with_completion(SendCompletion::Manual)
            .build();
        let state = opened(&sink);
        sink.send(0, chunk(schema("v"), vec![1])).expect("send");
        sink.finish_sender(0).expect("finish");
        assert_eq!(sink.poll_send(0), SendState::InFlight);
        assert!(sink.complete_pending(0));
        assert_eq!(
            sink.send(0, chunk(schema("v"), vec![2])),
            Err(SinkError::SenderFinished(0))
        );
        sink.send(1, chunk(schema("v"), vec![3])).expect("other sender still open");
        assert_eq!(sink.stats().finish_sender_calls, 1);

        sink.abort(&state).expect("abort");
        assert_eq!(sink.finish_sender(1), Err(SinkError::Finalized));
    }

    #[test]
    fn failed_abort_keeps_staged_chunks() {
        let sink = MemoryTableSink::builder("t").fail_abort("coordinator gone").build();
        let state = opened(&sink);
        sink.send(0, chunk(schema("v"), vec![1, 2])).expect("send");
        assert_eq!(
            sink.abort(&state),
            Err(SinkError::Unavailable("coordinator gone".into()))
        );
        assert!(!sink.is_aborted());
        assert_eq!(sink.staged_rows(), 2);
        assert_eq!(sink.stats().abort_calls, 1);
    }
}
