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

//! Fragment-level pipeline runtime context.
//!
//! Responsibilities:
//! - Holds shared state required by all drivers in one fragment execution.
//! - Carries identifiers, the runtime state handle, and cancellation/error state.
//!
//! Key exported interfaces:
//! - Types: `FragmentContext`.
//!
//! Cancellation is a monotonic atomic flag read by every operator poll. The final status is
//! a set-once cell: the first reported failure wins and also cancels the fragment, external
//! cancellation only flips the flag and leaves the status Ok.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use crate::common::status::{ExecError, ExecResult};
use crate::common::types::UniqueId;
use crate::exec::pipeline::schedule::observer::Observable;
use crate::novasink_logging::{info, warn};
use crate::runtime::runtime_state::RuntimeState;

/// Fragment-scoped runtime context shared across drivers and operator instances.
#[derive(Debug)]
pub struct FragmentContext {
    next_driver_id: AtomicI32,
    runtime_state: Arc<RuntimeState>,
    fragment_instance_id: Option<UniqueId>,
    final_error: Mutex<Option<ExecError>>,
    cancelled: AtomicBool,
    observable: Arc<Observable>,
}

impl FragmentContext {
    pub fn new(runtime_state: Arc<RuntimeState>) -> Self {
        let fragment_instance_id = runtime_state.fragment_instance_id();
        Self {
            next_driver_id: AtomicI32::new(0),
            runtime_state,
            fragment_instance_id,
            final_error: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            observable: Arc::new(Observable::new()),
        }
    }

    pub fn runtime_state(&self) -> &Arc<RuntimeState> {
        &self.runtime_state
    }

    pub fn fragment_instance_id(&self) -> Option<UniqueId> {
        self.fragment_instance_id
    }

    pub(crate) fn next_driver_id(&self) -> i32 {
        self.next_driver_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Fires whenever the fragment becomes cancelled.
    pub fn observable(&self) -> Arc<Observable> {
        Arc::clone(&self.observable)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Requests cancellation without recording a failure. Returns true for the first request.
    pub fn cancel(&self) -> bool {
        let first = !self.cancelled.swap(true, Ordering::AcqRel);
        if first {
            info!(
                target: "novasink::fragment",
                finst_id = ?self.fragment_instance_id.map(|id| id.to_string()),
                "fragment cancelled"
            );
            self.observable.notify_observers();
        }
        first
    }

    /// Records the fragment's failure and cancels every sibling instance.
    ///
    /// The first reported failure wins. A `Cancelled` error is not a failure: it only
    /// cancels the fragment and leaves the final status untouched.
    pub fn report_failure(&self, err: ExecError) -> bool {
        if err.is_cancelled() {
            self.cancel();
            return false;
        }
        {
            let mut guard = self.final_error.lock().expect("final error lock");
            if guard.is_some() {
                return false;
            }
            *guard = Some(err.clone());
        }
        warn!(
            target: "novasink::fragment",
            finst_id = ?self.fragment_instance_id.map(|id| id.to_string()),
            error = %err,
            "fragment failed"
        );
        self.runtime_state.error_state().set_error(err);
        self.cancel();
        true
    }

    pub fn failure(&self) -> Option<ExecError> {
        self.final_error.lock().expect("final error lock").clone()
    }

    /// Ok unless a failure was reported; external cancellation alone is not a failure.
    pub fn final_status(&self) -> ExecResult<()> {
        match self.failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn new_ctx() -> FragmentContext {
        FragmentContext::new(Arc::new(RuntimeState::new(UniqueId::new(3, 4))))
    }

    #[test]
    fn cancel_is_idempotent_and_notifies_once() {
        let ctx = new_ctx();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_cb = Arc::clone(&hits);
        ctx.observable().add_observer(Arc::new(move || {
            hits_cb.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(ctx.cancel());
        assert!(!ctx.cancel());
        assert!(ctx.is_cancelled());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(ctx.final_status().is_ok());
    }

    #[test]
    fn first_failure_wins_and_cancels() {
        let ctx = new_ctx();
        assert!(ctx.report_failure(ExecError::Forwarding("replica down".into())));
        assert!(!ctx.report_failure(ExecError::Finalization("later".into())));
        assert!(ctx.is_cancelled());
        assert_eq!(
            ctx.final_status(),
            Err(ExecError::Forwarding("replica down".into()))
        );
        assert_eq!(
            ctx.runtime_state().error(),
            Some(ExecError::Forwarding("replica down".into()))
        );
    }

    #[test]
    fn reported_cancellation_is_not_a_failure() {
        let ctx = new_ctx();
        assert!(!ctx.report_failure(ExecError::Cancelled("sibling failed".into())));
        assert!(ctx.is_cancelled());
        assert!(ctx.final_status().is_ok());
        assert_eq!(ctx.next_driver_id(), 0);
        assert_eq!(ctx.next_driver_id(), 1);
    }
}
