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

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::status::ExecError;
use crate::common::types::UniqueId;
use crate::novasink_logging::debug;

/// RuntimeState is the per-fragment-instance execution handle passed to every operator call.
///
/// Operators read the fragment identity from it and publish two kinds of
/// results back: the first error observed during execution and the rows/bytes their sink
/// sends loaded. Clones share the error cell and the counters.
#[derive(Debug, Clone)]
pub struct RuntimeState {
    fragment_instance_id: Option<UniqueId>,
    error_state: Arc<RuntimeErrorState>,
    load_counters: Arc<SinkLoadCounters>,
}

#[derive(Debug, Default)]
pub struct RuntimeErrorState {
    error: Mutex<Option<ExecError>>,
}

impl RuntimeErrorState {
    /// First error wins; later ones are dropped.
    pub fn set_error(&self, err: ExecError) -> bool {
        let mut guard = self.error.lock().expect("runtime error lock");
        if guard.is_none() {
            *guard = Some(err);
            return true;
        }
        false
    }

    pub fn error(&self) -> Option<ExecError> {
        self.error.lock().expect("runtime error lock").clone()
    }
}

#[derive(Debug, Default)]
struct SinkLoadCounters {
    loaded_rows: AtomicI64,
    loaded_bytes: AtomicI64,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            fragment_instance_id: None,
            error_state: Arc::new(RuntimeErrorState::default()),
            load_counters: Arc::new(SinkLoadCounters::default()),
        }
    }
}

impl RuntimeState {
    pub fn new(fragment_instance_id: UniqueId) -> Self {
        Self {
            fragment_instance_id: Some(fragment_instance_id),
            ..Self::default()
        }
    }

    pub fn fragment_instance_id(&self) -> Option<UniqueId> {
        self.fragment_instance_id
    }

    pub fn error_state(&self) -> Arc<RuntimeErrorState> {
        Arc::clone(&self.error_state)
    }

    pub fn error(&self) -> Option<ExecError> {
        self.error_state.error()
    }

    pub(crate) fn add_sink_load_counters(&self, loaded_rows: i64, loaded_bytes: i64) {
        if loaded_rows <= 0 && loaded_bytes <= 0 {
            return;
        }
        self.load_counters
            .loaded_rows
            .fetch_add(loaded_rows.max(0), Ordering::AcqRel);
        self.load_counters
            .loaded_bytes
            .fetch_add(loaded_bytes.max(0), Ordering::AcqRel);
        debug!(
            target: "novasink::sink_load",
            finst_id = ?self.fragment_instance_id.map(|id| id.to_string()),
            loaded_rows,
            loaded_bytes,
            "add sink load counters"
        );
    }

    /// Returns `(loaded_rows, loaded_bytes)` accumulated so far.
    pub fn sink_load_counters(&self) -> (i64, i64) {
        (
            self.load_counters.loaded_rows.load(Ordering::Acquire),
            self.load_counters.loaded_bytes.load(Ordering::Acquire),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_error_and_counters() {
        let state = RuntimeState::new(UniqueId::new(1, 2));
        let clone = state.clone();

        assert!(clone.error_state().set_error(ExecError::Forwarding("first".into())));
        assert!(!state.error_state().set_error(ExecError::Forwarding("second".into())));
        assert_eq!(state.error(), Some(ExecError::Forwarding("first".into())));

        clone.add_sink_load_counters(10, 400);
        state.add_sink_load_counters(5, 200);
        assert_eq!(state.sink_load_counters(), (15, 600));
        assert_eq!(clone.fragment_instance_id(), Some(UniqueId::new(1, 2)));
    }

    #[test]
    fn zero_load_is_ignored() {
        let state = RuntimeState::default();
        state.add_sink_load_counters(0, 0);
        assert_eq!(state.sink_load_counters(), (0, 0));
        assert!(state.fragment_instance_id().is_none());
    }
}
