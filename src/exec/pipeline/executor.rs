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

//! Top-level pipeline executor entrypoint.
//!
//! Responsibilities:
//! - Prepares one sink factory, creates one driver per source, and runs every driver on its
//!   own worker thread until all of them reach a terminal state.
//! - Parks blocked drivers on a shared wake signal fed by sink and fragment observables.
//! - Closes the factory and turns fragment state into one result.
//!
//! Key exported interfaces:
//! - Types: `FragmentExecutor`.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use super::driver::{ChunkSource, DriverState, PipelineDriver};
use super::fragment_context::FragmentContext;
use super::operator_factory::OperatorFactory;
use crate::common::config;
use crate::common::status::{ExecError, ExecResult};
use crate::exec::pipeline::schedule::observer::Observable;
use crate::novasink_logging::{debug, info, warn};

/// Epoch counter that parked drivers wait on; every observable event bumps it.
struct WakeSignal {
    epoch: Mutex<u64>,
    cv: Condvar,
}

impl WakeSignal {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            epoch: Mutex::new(0),
            cv: Condvar::new(),
        })
    }

    fn epoch(&self) -> u64 {
        *self.epoch.lock().expect("wake signal lock")
    }

    fn notify(&self) {
        let mut guard = self.epoch.lock().expect("wake signal lock");
        *guard = guard.wrapping_add(1);
        self.cv.notify_all();
    }

    /// Waits until the epoch moves past `seen` or `timeout` elapses.
    fn wait_since(&self, seen: u64, timeout: Duration) {
        let guard = self.epoch.lock().expect("wake signal lock");
        let _ = self
            .cv
            .wait_timeout_while(guard, timeout, |epoch| *epoch == seen)
            .expect("wake signal lock");
    }

    fn observe(self: &Arc<Self>, observable: &Observable) {
        let wake = Arc::clone(self);
        observable.add_observer(Arc::new(move || wake.notify()));
    }
}

/// Runs one sink pipeline of a fragment to completion.
pub struct FragmentExecutor {
    fragment_ctx: Arc<FragmentContext>,
    time_slice: Duration,
    blocked_wait: Duration,
}

impl FragmentExecutor {
    pub fn new(fragment_ctx: Arc<FragmentContext>) -> Self {
        Self {
            fragment_ctx,
            time_slice: config::driver_time_slice(),
            blocked_wait: config::blocked_driver_wait(),
        }
    }

    pub fn with_time_slice(mut self, time_slice: Duration) -> Self {
        self.time_slice = time_slice.max(Duration::from_micros(1));
        self
    }

    pub fn with_blocked_wait(mut self, blocked_wait: Duration) -> Self {
        self.blocked_wait = blocked_wait.max(Duration::from_micros(1));
        self
    }

    pub fn fragment_ctx(&self) -> &Arc<FragmentContext> {
        &self.fragment_ctx
    }

    /// Executes `factory` with one driver per source (dop = `sources.len()`).
    ///
    /// Returns the first reported failure, `Cancelled` when the fragment was cancelled
    /// without one, or the factory close outcome.
    pub fn execute(
        &self,
        factory: &dyn OperatorFactory,
        sources: Vec<Box<dyn ChunkSource>>,
    ) -> ExecResult<()> {
        let state = Arc::clone(self.fragment_ctx.runtime_state());
        let dop = i32::try_from(sources.len())
            .map_err(|_| ExecError::Internal(format!("dop {} too large", sources.len())))?;
        let start = Instant::now();
        info!(
            target: "novasink::executor",
            finst_id = ?self.fragment_ctx.fragment_instance_id().map(|id| id.to_string()),
            factory = %factory.name(),
            dop,
            "execute fragment"
        );

        if let Err(err) = factory.prepare(state.as_ref()) {
            self.fragment_ctx.report_failure(err.clone());
            let _ = factory.close(state.as_ref());
            return Err(err);
        }

        let mut drivers = Vec::with_capacity(sources.len());
        for (seq, source) in sources.into_iter().enumerate() {
            match factory.create(dop, seq as i32) {
                Ok(op) => drivers.push(PipelineDriver::new(
                    Arc::clone(&self.fragment_ctx),
                    source,
                    op,
                )),
                Err(err) => {
                    self.fragment_ctx.report_failure(err.clone());
                    // Dropping the drivers closes their operators.
                    drop(drivers);
                    let _ = factory.close(state.as_ref());
                    return Err(err);
                }
            }
        }

        let wake = WakeSignal::new();
        wake.observe(&self.fragment_ctx.observable());
        let mut observed: Vec<Arc<Observable>> = Vec::new();
        for driver in &drivers {
            if let Some(observable) = driver.sink_observable()
                && !observed.iter().any(|o| Arc::ptr_eq(o, &observable))
            {
                wake.observe(&observable);
                observed.push(observable);
            }
        }

        std::thread::scope(|scope| {
            for mut driver in drivers {
                let wake = Arc::clone(&wake);
                let time_slice = self.time_slice;
                let blocked_wait = self.blocked_wait;
                scope.spawn(move || run_driver(&mut driver, &wake, time_slice, blocked_wait));
            }
        });

        let close_result = factory.close(state.as_ref());
        let (loaded_rows, loaded_bytes) = state.sink_load_counters();
        let result = self.fragment_status(close_result);
        match &result {
            Ok(()) => info!(
                target: "novasink::executor",
                finst_id = ?self.fragment_ctx.fragment_instance_id().map(|id| id.to_string()),
                loaded_rows,
                loaded_bytes,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "fragment finished"
            ),
            Err(err) => warn!(
                target: "novasink::executor",
                finst_id = ?self.fragment_ctx.fragment_instance_id().map(|id| id.to_string()),
                error = %err,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "fragment did not commit"
            ),
        }
        result
    }

    fn fragment_status(&self, close_result: ExecResult<()>) -> ExecResult<()> {
        self.fragment_ctx.final_status()?;
        if let Err(err) = close_result {
            self.fragment_ctx.report_failure(err.clone());
            return Err(err);
        }
        if self.fragment_ctx.is_cancelled() {
            return Err(ExecError::Cancelled("fragment cancelled".to_string()));
        }
        Ok(())
    }
}

fn run_driver(
    driver: &mut PipelineDriver,
    wake: &WakeSignal,
    time_slice: Duration,
    blocked_wait: Duration,
) {
    loop {
        let seen = wake.epoch();
        match driver.process(time_slice) {
            state if state.is_terminal() => {
                debug!(
                    target: "novasink::executor",
                    driver_id = driver.driver_id(),
                    driver_sequence = driver.driver_sequence(),
                    state = ?state,
                    "driver done"
                );
                return;
            }
            DriverState::Blocked(_) | DriverState::PendingFinish => {
                wake.wait_since(seen, blocked_wait);
            }
            _ => std::thread::yield_now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::types::UniqueId;
    use crate::connector::sink::{MemoryTableSink, SendCompletion};
    use crate::exec::chunk::Chunk;
    use crate::exec::operators::{PSEUDO_PLAN_NODE_ID_FOR_TABLE_SINK, TableSinkOperatorFactory};
    use crate::exec::pipeline::driver::VecChunkSource;
    use crate::runtime::runtime_state::RuntimeState;
    use arrow::array::{Int32Array, RecordBatch};
    use arrow::datatypes::{DataType, Field, Schema};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sources(dop: usize, chunks_each: usize) -> Vec<Box<dyn ChunkSource>> {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
        (0..dop)
            .map(|d| {
                let chunks = (0..chunks_each).map(|i| {
                    let batch = RecordBatch::try_new(
                        Arc::clone(&schema),
                        vec![Arc::new(Int32Array::from(vec![(d * 10 + i) as i32]))],
                    )
                    .expect("record batch");
                    Chunk::new(batch)
                });
                Box::new(VecChunkSource::new(chunks)) as Box<dyn ChunkSource>
            })
            .collect()
    }

    #[test]
    fn wake_signal_returns_on_notify() {
        let wake = WakeSignal::new();
        let seen = wake.epoch();
        let hits = Arc::new(AtomicUsize::new(0));
        std::thread::scope(|scope| {
            scope.spawn(|| {
                wake.wait_since(seen, Duration::from_secs(30));
                hits.fetch_add(1, Ordering::SeqCst);
            });
            std::thread::sleep(Duration::from_millis(5));
            wake.notify();
        });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(wake.epoch(), seen + 1);
    }

    #[test]
    fn async_sends_commit_once() {
        let ctx = Arc::new(FragmentContext::new(Arc::new(RuntimeState::new(
            UniqueId::new(1, 2),
        ))));
        let sink = MemoryTableSink::builder("t")
            .with_completion(SendCompletion::Async(Duration::from_millis(2)))
            .build();
        let factory = TableSinkOperatorFactory::new(
            PSEUDO_PLAN_NODE_ID_FOR_TABLE_SINK,
            Box::new(sink.clone()),
            Arc::clone(&ctx),
        );
        FragmentExecutor::new(Arc::clone(&ctx))
            .with_blocked_wait(Duration::from_millis(50))
            .execute(&factory, sources(4, 3))
            .expect("execute");
        assert_eq!(sink.stats().open_calls, 1);
        assert_eq!(sink.stats().send_calls, 12);
        assert_eq!(sink.stats().commit_calls, 1);
        assert_eq!(sink.committed_rows(), 12);
        assert_eq!(ctx.runtime_state().sink_load_counters().0, 12);
    }

    #[test]
    fn prepare_failure_aborts_fragment() {
        let ctx = Arc::new(FragmentContext::new(Arc::new(RuntimeState::default())));
        let sink = MemoryTableSink::builder("t").fail_init("unknown table").build();
        let factory = TableSinkOperatorFactory::new(1, Box::new(sink.clone()), Arc::clone(&ctx));
        let err = FragmentExecutor::new(Arc::clone(&ctx))
            .execute(&factory, sources(2, 1))
            .expect_err("init fails");
        assert!(matches!(err, ExecError::Initialization(_)));
        assert_eq!(ctx.final_status(), Err(err));
        assert_eq!(sink.stats().open_calls, 0);
        assert_eq!(sink.stats().send_calls, 0);
        assert_eq!(sink.stats().abort_calls, 1);
        assert_eq!(sink.stats().commit_calls, 0);
    }
}
